//! Decoding of the compact `custom_session_id` the voice widget attaches to
//! every chat: `displayName|fractional_<userId>|location:London,jobs:25`.
//!
//! The string is client controlled, so decoding is total: anything
//! unexpected degrades to empty fields instead of an error.

use serde::Serialize;

pub const USER_PREFIX: &str = "fractional_";
pub const ANONYMOUS_PREFIX: &str = "fractional_anon_";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PageContext {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_jobs: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionContext {
    pub display_name: String,
    /// Empty for anonymous visitors.
    pub user_id: String,
    pub page_context: Option<PageContext>,
}

impl SessionContext {
    pub fn is_anonymous(&self) -> bool {
        self.user_id.is_empty()
    }
}

pub fn decode(opaque_session_id: &str) -> SessionContext {
    let mut segments = opaque_session_id.split('|');
    let display_name = segments.next().unwrap_or("").trim().to_string();
    let user_id = decode_user_id(segments.next().unwrap_or(""));
    let page_context = segments.next().and_then(decode_page_context);

    SessionContext {
        display_name,
        user_id,
        page_context,
    }
}

fn decode_user_id(segment: &str) -> String {
    let segment = segment.trim();
    if segment.starts_with(ANONYMOUS_PREFIX) {
        return String::new();
    }
    segment
        .strip_prefix(USER_PREFIX)
        .unwrap_or(segment)
        .trim()
        .to_string()
}

fn decode_page_context(segment: &str) -> Option<PageContext> {
    let mut context = PageContext::default();
    let mut recognized = false;

    for pair in segment.split(',') {
        let Some((key, value)) = pair.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match key.trim() {
            "location" if !value.is_empty() => {
                context.location = Some(value.to_string());
                recognized = true;
            }
            "jobs" => {
                if let Ok(total) = value.parse::<u32>() {
                    context.total_jobs = Some(total);
                    recognized = true;
                }
            }
            _ => {}
        }
    }

    recognized.then_some(context)
}
