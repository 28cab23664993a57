use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::{
    dispatcher::EventDispatcher, error::WebhookError, memory_sync::MemorySync,
    profile_store::ProfileStore, signature::WebhookAuth,
};

/// Fixed-width UTC timestamps so text columns sort chronologically.
pub fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Treats an explicit JSON `null` like a missing key.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

pub struct AppState {
    pub store: Arc<dyn ProfileStore>,
    pub memory: MemorySync,
    pub dispatcher: EventDispatcher,
    pub webhook_auth: WebhookAuth,
}

/// Anything the vendor labels other than `user` is the agent speaking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", from = "String")]
pub enum TurnRole {
    User,
    Assistant,
}

impl From<String> for TurnRole {
    fn from(raw: String) -> Self {
        if raw.trim().eq_ignore_ascii_case("user") {
            TurnRole::User
        } else {
            TurnRole::Assistant
        }
    }
}

impl TurnRole {
    pub fn as_str(self) -> &'static str {
        match self {
            TurnRole::User => "user",
            TurnRole::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptTurn {
    pub role: TurnRole,
    #[serde(default, deserialize_with = "null_as_default")]
    pub content: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub timestamp: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    UserEnded,
    UserTimeout,
    MaxDuration,
    InactivityTimeout,
    Error,
}

impl EndReason {
    /// Accepts both the vendor's upper-case names and the lower-case forms.
    pub fn from_wire(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "user_ended" => Some(Self::UserEnded),
            "user_timeout" => Some(Self::UserTimeout),
            "max_duration" | "max_duration_timeout" => Some(Self::MaxDuration),
            "inactivity_timeout" => Some(Self::InactivityTimeout),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConversationEvent {
    SessionStarted {
        chat_id: String,
        chat_group_id: String,
        config_id: String,
        resumed: bool,
        session_id: String,
    },
    SessionEnded {
        chat_id: String,
        duration_seconds: u64,
        end_reason: Option<EndReason>,
        transcript: Vec<TranscriptTurn>,
        session_id: String,
    },
    ToolInvoked {
        chat_id: String,
        tool_call_id: String,
        tool_name: String,
        parameters_json: String,
        response_required: bool,
        session_id: String,
    },
}

impl ConversationEvent {
    pub fn chat_id(&self) -> &str {
        match self {
            ConversationEvent::SessionStarted { chat_id, .. }
            | ConversationEvent::SessionEnded { chat_id, .. }
            | ConversationEvent::ToolInvoked { chat_id, .. } => chat_id,
        }
    }

    /// The raw `custom_session_id`, empty when the vendor sent none.
    pub fn session_id(&self) -> &str {
        match self {
            ConversationEvent::SessionStarted { session_id, .. }
            | ConversationEvent::SessionEnded { session_id, .. }
            | ConversationEvent::ToolInvoked { session_id, .. } => session_id,
        }
    }

    pub fn wire_name(&self) -> &'static str {
        match self {
            ConversationEvent::SessionStarted { .. } => "chat_started",
            ConversationEvent::SessionEnded { .. } => "chat_ended",
            ConversationEvent::ToolInvoked { .. } => "tool_call",
        }
    }
}

/// The vendor's flat webhook body, before it is narrowed into a
/// [`ConversationEvent`].
#[derive(Debug, Deserialize)]
pub struct WebhookPayload {
    pub event_name: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub chat_id: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub chat_group_id: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub config_id: String,
    #[serde(default)]
    pub custom_session_id: Option<String>,
    #[serde(default)]
    pub resumed: Option<bool>,
    #[serde(default)]
    pub duration_seconds: Option<f64>,
    #[serde(default)]
    pub end_reason: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub messages: Vec<TranscriptTurn>,
    #[serde(default)]
    pub tool_call_id: Option<String>,
    #[serde(default)]
    pub tool_name: Option<String>,
    #[serde(default)]
    pub parameters: Option<Value>,
    #[serde(default)]
    pub response_required: Option<bool>,
}

impl WebhookPayload {
    pub fn parse(raw_body: &[u8]) -> Result<ConversationEvent, WebhookError> {
        serde_json::from_slice::<WebhookPayload>(raw_body)?.into_event()
    }

    pub fn into_event(self) -> Result<ConversationEvent, WebhookError> {
        let chat_id = self.chat_id.trim().to_string();
        if chat_id.is_empty() {
            return Err(WebhookError::MissingField("chat_id"));
        }
        let session_id = self.custom_session_id.unwrap_or_default();

        match self.event_name.as_str() {
            "chat_started" => Ok(ConversationEvent::SessionStarted {
                chat_id,
                chat_group_id: self.chat_group_id,
                config_id: self.config_id,
                resumed: self.resumed.unwrap_or(false),
                session_id,
            }),
            "chat_ended" => {
                let end_reason = self.end_reason.as_deref().and_then(|raw| {
                    let parsed = EndReason::from_wire(raw);
                    if parsed.is_none() {
                        tracing::warn!(end_reason = raw, "unrecognized end reason");
                    }
                    parsed
                });
                Ok(ConversationEvent::SessionEnded {
                    chat_id,
                    duration_seconds: self
                        .duration_seconds
                        .filter(|d| d.is_finite() && *d >= 0.0)
                        .map(|d| d.round() as u64)
                        .unwrap_or(0),
                    end_reason,
                    transcript: self.messages,
                    session_id,
                })
            }
            "tool_call" => Ok(ConversationEvent::ToolInvoked {
                chat_id,
                tool_call_id: self.tool_call_id.unwrap_or_default(),
                tool_name: self
                    .tool_name
                    .ok_or(WebhookError::MissingField("tool_name"))?,
                parameters_json: match self.parameters {
                    Some(Value::String(raw)) => raw,
                    Some(other) => other.to_string(),
                    None => "{}".to_string(),
                },
                response_required: self.response_required.unwrap_or(false),
                session_id,
            }),
            other => Err(WebhookError::UnknownEvent(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileItem {
    pub id: i64,
    pub user_id: String,
    pub item_type: String,
    pub value: String,
    pub metadata: Map<String, Value>,
    pub confirmed: bool,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpsertProfileBody {
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub item_type: String,
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub metadata: Option<Map<String, Value>>,
    #[serde(default)]
    pub confirmed: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileQuery {
    pub user_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteProfileQuery {
    pub user_id: Option<String>,
    pub item_id: Option<String>,
    pub id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryMessageBody {
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub metadata: Option<Map<String, Value>>,
}

#[derive(Debug, Deserialize)]
pub struct EventEnvelopeIn {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}
