use tracing::{debug, info};

use crate::{
    memory_sync::{MemoryMessage, MemorySync, SyncJob},
    session_context::SessionContext,
    types::ConversationEvent,
};

pub const VOICE_SOURCE: &str = "hume_voice";

/// What a single delivery led to. Handy for logs and tests; the webhook
/// response does not depend on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Logged,
    TranscriptQueued { turns: usize },
    TranscriptDropped,
    Skipped,
}

#[derive(Clone)]
pub struct EventDispatcher {
    memory: MemorySync,
}

impl EventDispatcher {
    pub fn new(memory: MemorySync) -> Self {
        Self { memory }
    }

    /// Runs one independent transition. Never fails: downstream trouble is
    /// logged by the memory sync worker.
    pub fn dispatch(&self, event: &ConversationEvent, context: &SessionContext) -> DispatchOutcome {
        match event {
            ConversationEvent::SessionStarted {
                chat_id,
                chat_group_id,
                config_id,
                resumed,
                ..
            } => {
                info!(
                    chat_id = %chat_id,
                    chat_group_id = %chat_group_id,
                    config_id = %config_id,
                    resumed,
                    "chat started"
                );
                if let Some(page) = context.page_context.as_ref() {
                    info!(
                        chat_id = %chat_id,
                        location = page.location.as_deref().unwrap_or(""),
                        total_jobs = page.total_jobs.unwrap_or(0),
                        "chat page context"
                    );
                }
                DispatchOutcome::Logged
            }
            ConversationEvent::SessionEnded {
                chat_id,
                duration_seconds,
                end_reason,
                transcript,
                ..
            } => {
                info!(
                    chat_id = %chat_id,
                    duration_seconds,
                    end_reason = ?end_reason,
                    turns = transcript.len(),
                    "chat ended"
                );
                if transcript.is_empty() || context.is_anonymous() {
                    debug!(chat_id = %chat_id, "no transcript or user id to store");
                    return DispatchOutcome::Skipped;
                }

                let job = SyncJob {
                    user_id: context.user_id.clone(),
                    thread_id: chat_id.clone(),
                    source: VOICE_SOURCE.to_string(),
                    messages: transcript
                        .iter()
                        .map(|turn| MemoryMessage::new(turn.role.as_str(), turn.content.clone()))
                        .collect(),
                };
                let turns = job.messages.len();
                if self.memory.submit(job) {
                    DispatchOutcome::TranscriptQueued { turns }
                } else {
                    DispatchOutcome::TranscriptDropped
                }
            }
            ConversationEvent::ToolInvoked {
                chat_id,
                tool_call_id,
                tool_name,
                parameters_json,
                response_required,
                ..
            } => {
                // Tools run inside the conversational agent; this is telemetry only.
                info!(
                    chat_id = %chat_id,
                    tool_call_id = %tool_call_id,
                    tool_name = %tool_name,
                    parameters = %parameters_json,
                    response_required,
                    "tool call"
                );
                DispatchOutcome::Logged
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        memory_sync::testing::{Call, RecordingMemory},
        session_context::decode,
        types::{TranscriptTurn, TurnRole},
    };

    fn ended(transcript: Vec<TranscriptTurn>) -> ConversationEvent {
        ConversationEvent::SessionEnded {
            chat_id: "chat-9".to_string(),
            duration_seconds: 30,
            end_reason: None,
            transcript,
            session_id: String::new(),
        }
    }

    fn turn(role: TurnRole, content: &str) -> TranscriptTurn {
        TranscriptTurn {
            role,
            content: content.to_string(),
            timestamp: 0,
        }
    }

    #[tokio::test]
    async fn chat_ended_syncs_transcript_even_when_first_append_fails() {
        let memory = Arc::new(RecordingMemory {
            fail_appends: vec![1],
            ..Default::default()
        });
        let (sync, worker) = MemorySync::spawn(memory.clone(), 4);
        let dispatcher = EventDispatcher::new(sync);

        let outcome = dispatcher.dispatch(
            &ended(vec![
                turn(TurnRole::User, "I'm a CFO in Leeds"),
                turn(TurnRole::Assistant, "Great, noted"),
            ]),
            &decode("Jane|fractional_u1|"),
        );
        assert_eq!(outcome, DispatchOutcome::TranscriptQueued { turns: 2 });

        drop(dispatcher);
        worker.await.unwrap();

        assert_eq!(
            memory.calls(),
            vec![
                Call::EnsureUser("u1".to_string()),
                Call::EnsureThread("chat-9".to_string(), "u1".to_string()),
                Call::Append("chat-9".to_string(), "I'm a CFO in Leeds".to_string()),
                Call::Append("chat-9".to_string(), "Great, noted".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn anonymous_or_empty_transcripts_are_skipped() {
        let memory = Arc::new(RecordingMemory::default());
        let (sync, worker) = MemorySync::spawn(memory.clone(), 4);
        let dispatcher = EventDispatcher::new(sync);

        assert_eq!(
            dispatcher.dispatch(&ended(vec![]), &decode("Jane|fractional_u1|")),
            DispatchOutcome::Skipped
        );
        assert_eq!(
            dispatcher.dispatch(
                &ended(vec![turn(TurnRole::User, "hi")]),
                &decode("Guest|fractional_anon_x|")
            ),
            DispatchOutcome::Skipped
        );

        drop(dispatcher);
        worker.await.unwrap();
        assert!(memory.calls().is_empty());
    }

    #[test]
    fn started_and_tool_events_only_log() {
        let dispatcher = EventDispatcher::new(MemorySync::disabled());
        let started = ConversationEvent::SessionStarted {
            chat_id: "c".to_string(),
            chat_group_id: "g".to_string(),
            config_id: "cfg".to_string(),
            resumed: true,
            session_id: String::new(),
        };
        let tool = ConversationEvent::ToolInvoked {
            chat_id: "c".to_string(),
            tool_call_id: "t".to_string(),
            tool_name: "search_jobs".to_string(),
            parameters_json: "{}".to_string(),
            response_required: false,
            session_id: String::new(),
        };
        let ctx = decode("Jane|fractional_u1|location:London");
        assert_eq!(dispatcher.dispatch(&started, &ctx), DispatchOutcome::Logged);
        assert_eq!(dispatcher.dispatch(&tool, &ctx), DispatchOutcome::Logged);
    }

    #[test]
    fn disabled_sync_reports_dropped_transcript() {
        let dispatcher = EventDispatcher::new(MemorySync::disabled());
        assert_eq!(
            dispatcher.dispatch(
                &ended(vec![turn(TurnRole::User, "hi")]),
                &decode("Jane|fractional_u1|")
            ),
            DispatchOutcome::TranscriptDropped
        );
    }
}
