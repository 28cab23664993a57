//! Page-view state that a conversational agent may change through a fixed
//! set of declared actions.
//!
//! Every action is validated and then applied in one `send_if_modified`
//! call, so subscribers only ever observe fully applied snapshots. Rejected
//! actions leave the state untouched and notify nobody.

use std::{
    collections::BTreeSet,
    sync::Arc,
};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::watch;
use tracing::warn;

use crate::types::now_iso;

pub const KNOWN_SECTIONS: &[&str] = &["salary", "jobs", "market", "skills", "companies"];
pub const DEFAULT_MAX_RATE: f64 = 2000.0;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Filters {
    pub location: String,
    pub role: String,
    pub remote: bool,
    pub min_rate: f64,
    pub max_rate: f64,
}

impl Default for Filters {
    fn default() -> Self {
        Self {
            location: String::new(),
            role: String::new(),
            remote: false,
            min_rate: 0.0,
            max_rate: DEFAULT_MAX_RATE,
        }
    }
}

/// A partial filter update. Absent fields keep their current value.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterPatch {
    pub location: Option<String>,
    pub role: Option<String>,
    pub remote: Option<bool>,
    pub min_rate: Option<f64>,
    pub max_rate: Option<f64>,
}

impl FilterPatch {
    fn is_empty(&self) -> bool {
        self.location.is_none()
            && self.role.is_none()
            && self.remote.is_none()
            && self.min_rate.is_none()
            && self.max_rate.is_none()
    }

    /// The merged filters, or `None` when any rate is negative, non-finite
    /// or the range is inverted.
    fn merged_into(&self, current: &Filters) -> Option<Filters> {
        let rate_ok = |rate: Option<f64>| rate.map_or(true, |r| r.is_finite() && r >= 0.0);
        if !rate_ok(self.min_rate) || !rate_ok(self.max_rate) {
            return None;
        }
        let merged = Filters {
            location: self
                .location
                .as_deref()
                .map(|v| v.trim().to_string())
                .unwrap_or_else(|| current.location.clone()),
            role: self
                .role
                .as_deref()
                .map(|v| v.trim().to_string())
                .unwrap_or_else(|| current.role.clone()),
            remote: self.remote.unwrap_or(current.remote),
            min_rate: self.min_rate.unwrap_or(current.min_rate),
            max_rate: self.max_rate.unwrap_or(current.max_rate),
        };
        (merged.min_rate <= merged.max_rate).then_some(merged)
    }

    fn describe(&self) -> String {
        let mut updates = Vec::new();
        if let Some(location) = self.location.as_deref().filter(|v| !v.trim().is_empty()) {
            updates.push(format!("location to {}", location.trim()));
        }
        if let Some(role) = self.role.as_deref().filter(|v| !v.trim().is_empty()) {
            updates.push(format!("role to {}", role.trim()));
        }
        if let Some(remote) = self.remote {
            updates.push(if remote { "remote only" } else { "all work types" }.to_string());
        }
        if let Some(min) = self.min_rate {
            updates.push(format!("min rate to £{min}"));
        }
        if let Some(max) = self.max_rate {
            updates.push(format!("max rate to £{max}"));
        }
        updates.join(", ")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentState {
    pub filters: Filters,
    pub highlighted_sections: BTreeSet<String>,
    pub expanded_sections: BTreeSet<String>,
    pub user_query: String,
    pub last_update: String,
}

impl Default for DocumentState {
    fn default() -> Self {
        Self {
            filters: Filters::default(),
            highlighted_sections: BTreeSet::new(),
            expanded_sections: BTreeSet::new(),
            user_query: String::new(),
            last_update: now_iso(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DocumentAction {
    UpdateFilters(FilterPatch),
    HighlightSection(String),
    ClearHighlights,
    ExpandSection(String),
    SetUserQuery(String),
}

impl DocumentAction {
    /// Maps an agent invocation (`name` + JSON `params`) onto a declared
    /// action. Unknown names or ill-typed params give `None`.
    pub fn from_invocation(name: &str, params: &Value) -> Option<Self> {
        let text = |key: &str| params.get(key).and_then(Value::as_str).map(str::to_string);
        match name {
            "update_document_filters" => {
                let params = if params.is_null() { json!({}) } else { params.clone() };
                serde_json::from_value::<FilterPatch>(params)
                    .ok()
                    .map(Self::UpdateFilters)
            }
            "highlight_section" => text("section").map(Self::HighlightSection),
            "clear_highlights" => Some(Self::ClearHighlights),
            "expand_section" => text("section").map(Self::ExpandSection),
            "set_user_query" => text("query").map(Self::SetUserQuery),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActionResult {
    pub applied: bool,
    pub message: String,
}

impl ActionResult {
    fn applied(message: impl Into<String>) -> Self {
        Self {
            applied: true,
            message: message.into(),
        }
    }

    fn ignored(message: impl Into<String>) -> Self {
        Self {
            applied: false,
            message: message.into(),
        }
    }
}

fn known_section(id: &str) -> bool {
    KNOWN_SECTIONS.contains(&id)
}

pub struct DocumentBridge {
    page_context: String,
    state: watch::Sender<DocumentState>,
}

impl DocumentBridge {
    /// `None` when the initial filters themselves fail validation.
    pub fn new(page_context: impl Into<String>, initial: &FilterPatch) -> Option<Self> {
        let filters = initial.merged_into(&Filters::default())?;
        let (state, _) = watch::channel(DocumentState {
            filters,
            ..DocumentState::default()
        });
        Some(Self {
            page_context: page_context.into(),
            state,
        })
    }

    pub fn state(&self) -> DocumentState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<DocumentState> {
        self.state.subscribe()
    }

    /// The snapshot exposed to the agent as readable context.
    pub fn readable(&self) -> Value {
        let state = self.state.borrow();
        json!({
            "pageContext": self.page_context,
            "currentFilters": state.filters,
            "highlightedSections": state.highlighted_sections,
            "userQuery": state.user_query,
        })
    }

    pub fn update_filters(&self, patch: &FilterPatch) -> bool {
        if patch.is_empty() {
            return false;
        }
        self.state.send_if_modified(|state| {
            let Some(filters) = patch.merged_into(&state.filters) else {
                return false;
            };
            state.filters = filters;
            state.last_update = now_iso();
            true
        })
    }

    /// Highlighting also expands the section.
    pub fn highlight_section(&self, id: &str) -> bool {
        let id = id.trim();
        if !known_section(id) {
            return false;
        }
        self.state.send_if_modified(|state| {
            state.highlighted_sections.insert(id.to_string());
            state.expanded_sections.insert(id.to_string());
            state.last_update = now_iso();
            true
        })
    }

    pub fn clear_highlights(&self) -> bool {
        self.state.send_if_modified(|state| {
            state.highlighted_sections.clear();
            state.last_update = now_iso();
            true
        })
    }

    pub fn expand_section(&self, id: &str) -> bool {
        let id = id.trim();
        if !known_section(id) {
            return false;
        }
        self.state.send_if_modified(|state| {
            state.expanded_sections.insert(id.to_string());
            state.last_update = now_iso();
            true
        })
    }

    pub fn set_user_query(&self, query: &str) -> bool {
        let query = query.trim();
        if query.is_empty() {
            return false;
        }
        self.state.send_if_modified(|state| {
            state.user_query = query.to_string();
            state.last_update = now_iso();
            true
        })
    }

    pub fn apply(&self, action: &DocumentAction) -> ActionResult {
        match action {
            DocumentAction::UpdateFilters(patch) => {
                if self.update_filters(patch) {
                    ActionResult::applied(format!(
                        "Updated page filters: {}. The document content has updated to reflect these changes.",
                        patch.describe()
                    ))
                } else {
                    ActionResult::ignored("Filters unchanged: the requested values were invalid.")
                }
            }
            DocumentAction::HighlightSection(id) => {
                if self.highlight_section(id) {
                    ActionResult::applied(format!(
                        "Highlighted the {} section. It should now be visually emphasized on the page.",
                        id.trim()
                    ))
                } else {
                    ActionResult::ignored(format!(
                        "Unknown section '{}'. Known sections: {}.",
                        id.trim(),
                        KNOWN_SECTIONS.join(", ")
                    ))
                }
            }
            DocumentAction::ClearHighlights => {
                self.clear_highlights();
                ActionResult::applied("Cleared all highlights. The page is back to normal view.")
            }
            DocumentAction::ExpandSection(id) => {
                if self.expand_section(id) {
                    ActionResult::applied(format!("Expanded the {} section.", id.trim()))
                } else {
                    ActionResult::ignored(format!("Unknown section '{}'.", id.trim()))
                }
            }
            DocumentAction::SetUserQuery(query) => {
                if self.set_user_query(query) {
                    ActionResult::applied("Noted the visitor's query.")
                } else {
                    ActionResult::ignored("Empty query ignored.")
                }
            }
        }
    }
}

/// What components receive instead of looking the bridge up ambiently.
/// Without an installed bridge every read returns the default state and
/// every action is a no-op. Falling back warns once per resolution, so
/// each page view without a bridge is reported on its own.
#[derive(Clone)]
pub enum DocumentContext {
    Installed(Arc<DocumentBridge>),
    Inert,
}

impl DocumentContext {
    pub fn resolve(bridge: Option<Arc<DocumentBridge>>) -> Self {
        match bridge {
            Some(bridge) => Self::Installed(bridge),
            None => {
                warn!("document bridge not installed, using inert default state");
                Self::Inert
            }
        }
    }

    pub fn is_installed(&self) -> bool {
        matches!(self, Self::Installed(_))
    }

    pub fn state(&self) -> DocumentState {
        match self {
            Self::Installed(bridge) => bridge.state(),
            Self::Inert => DocumentState::default(),
        }
    }

    pub fn readable(&self) -> Value {
        match self {
            Self::Installed(bridge) => bridge.readable(),
            Self::Inert => json!({
                "pageContext": "",
                "currentFilters": Filters::default(),
                "highlightedSections": [],
                "userQuery": "",
            }),
        }
    }

    pub fn subscribe(&self) -> Option<watch::Receiver<DocumentState>> {
        match self {
            Self::Installed(bridge) => Some(bridge.subscribe()),
            Self::Inert => None,
        }
    }

    pub fn apply(&self, action: &DocumentAction) -> ActionResult {
        match self {
            Self::Installed(bridge) => bridge.apply(action),
            Self::Inert => ActionResult::ignored("No document is attached to this page."),
        }
    }

    pub fn invoke(&self, name: &str, params: &Value) -> ActionResult {
        match DocumentAction::from_invocation(name, params) {
            Some(action) => self.apply(&action),
            None => ActionResult::ignored(format!(
                "Unknown action or invalid parameters for '{name}'."
            )),
        }
    }
}
