//! Best-effort fan-out of facts and transcript turns to the long-term
//! memory service.
//!
//! Callers submit a [`SyncJob`] to a bounded queue and return immediately.
//! A single worker drains the queue in order and, per job, runs
//! ensure-user, ensure-thread, then one append per message. Every remote
//! failure is logged and absorbed; a failed append never stops the ones
//! after it.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde::Serialize;
use serde_json::{json, Map, Value};
use tokio::{
    sync::mpsc::{self, error::TrySendError},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::error::SyncError;

pub const PROFILE_THREAD_PREFIX: &str = "fractional_";

pub fn profile_thread_id(user_id: &str) -> String {
    format!("{PROFILE_THREAD_PREFIX}{user_id}")
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemoryMessage {
    pub role: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
}

impl MemoryMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
            metadata: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SyncJob {
    pub user_id: String,
    pub thread_id: String,
    pub source: String,
    pub messages: Vec<MemoryMessage>,
}

impl SyncJob {
    /// Synthesized fact sentences, recorded as `system` turns.
    pub fn facts(user_id: &str, thread_id: &str, facts: Vec<String>, source: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            thread_id: thread_id.to_string(),
            source: source.to_string(),
            messages: facts
                .into_iter()
                .map(|fact| MemoryMessage::new("system", fact))
                .collect(),
        }
    }
}

#[async_trait]
pub trait MemoryService: Send + Sync {
    async fn ensure_user(&self, user_id: &str) -> Result<(), SyncError>;
    async fn ensure_thread(
        &self,
        thread_id: &str,
        user_id: &str,
        source: &str,
    ) -> Result<(), SyncError>;
    async fn append_message(
        &self,
        thread_id: &str,
        message: &MemoryMessage,
    ) -> Result<(), SyncError>;
}

#[derive(Clone)]
pub struct ZepClient {
    http: Client,
    base_url: Url,
    api_key: String,
}

impl ZepClient {
    /// `timeout` bounds each request so a hung connection cannot stall the
    /// worker behind it.
    pub fn new(base_url: &str, api_key: &str, timeout: Duration) -> Result<Self, SyncError> {
        let base_url = Url::parse(base_url)
            .ok()
            .filter(|url| !url.cannot_be_a_base())
            .ok_or_else(|| SyncError::InvalidUrl(base_url.to_string()))?;
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url,
            api_key: api_key.to_string(),
        })
    }

    /// Appends `segments` to the base path, percent-encoding each one so
    /// caller-supplied ids stay inside a single path segment.
    fn endpoint(&self, segments: &[&str]) -> Result<Url, SyncError> {
        if let Some(bad) = segments
            .iter()
            .find(|segment| matches!(segment.trim(), "" | "." | ".."))
        {
            return Err(SyncError::InvalidPathSegment(bad.to_string()));
        }
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| SyncError::InvalidUrl(self.base_url.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// Create calls treat 409 as "already exists".
    async fn post(
        &self,
        segments: &[&str],
        body: Value,
        conflict_ok: bool,
    ) -> Result<(), SyncError> {
        let url = self.endpoint(segments)?;
        let res = self
            .http
            .post(url)
            .header("Authorization", format!("Api-Key {}", self.api_key))
            .json(&body)
            .send()
            .await?;

        let status = res.status();
        if status.is_success() || (conflict_ok && status == StatusCode::CONFLICT) {
            return Ok(());
        }
        let body = res.text().await.unwrap_or_default();
        Err(SyncError::Status {
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl MemoryService for ZepClient {
    async fn ensure_user(&self, user_id: &str) -> Result<(), SyncError> {
        self.post(&["users"], json!({ "user_id": user_id }), true).await
    }

    async fn ensure_thread(
        &self,
        thread_id: &str,
        user_id: &str,
        source: &str,
    ) -> Result<(), SyncError> {
        self.post(
            &["threads"],
            json!({
                "thread_id": thread_id,
                "user_id": user_id,
                "metadata": { "source": source },
            }),
            true,
        )
        .await
    }

    async fn append_message(
        &self,
        thread_id: &str,
        message: &MemoryMessage,
    ) -> Result<(), SyncError> {
        self.post(
            &["threads", thread_id, "messages"],
            json!({ "messages": [message] }),
            false,
        )
        .await
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SyncReport {
    pub appended: usize,
    pub failed: usize,
}

pub async fn run_sync(service: &dyn MemoryService, job: &SyncJob) -> SyncReport {
    if let Err(err) = service.ensure_user(&job.user_id).await {
        warn!(user_id = %job.user_id, error = %err, "memory sync: ensure user failed");
    }
    if let Err(err) = service
        .ensure_thread(&job.thread_id, &job.user_id, &job.source)
        .await
    {
        warn!(thread_id = %job.thread_id, error = %err, "memory sync: ensure thread failed");
    }

    let mut report = SyncReport::default();
    for (index, message) in job.messages.iter().enumerate() {
        match service.append_message(&job.thread_id, message).await {
            Ok(()) => report.appended += 1,
            Err(err) => {
                report.failed += 1;
                warn!(
                    thread_id = %job.thread_id,
                    index,
                    error = %err,
                    "memory sync: append failed, continuing"
                );
            }
        }
    }
    report
}

/// Cloneable submission handle. A disabled handle drops every job.
#[derive(Clone)]
pub struct MemorySync {
    tx: Option<mpsc::Sender<SyncJob>>,
}

impl MemorySync {
    pub fn spawn(service: Arc<dyn MemoryService>, capacity: usize) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<SyncJob>(capacity.max(1));
        let worker = tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                let report = run_sync(service.as_ref(), &job).await;
                info!(
                    user_id = %job.user_id,
                    thread_id = %job.thread_id,
                    appended = report.appended,
                    failed = report.failed,
                    "memory sync finished"
                );
            }
            debug!("memory sync worker stopped");
        });
        (Self { tx: Some(tx) }, worker)
    }

    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.tx.is_some()
    }

    /// Never waits. Returns whether the job was queued.
    pub fn submit(&self, job: SyncJob) -> bool {
        let Some(tx) = self.tx.as_ref() else {
            debug!(user_id = %job.user_id, "memory sync disabled, dropping job");
            return false;
        };
        if job.user_id.is_empty() || job.messages.is_empty() {
            return false;
        }
        match tx.try_send(job) {
            Ok(()) => true,
            Err(TrySendError::Full(job)) => {
                warn!(user_id = %job.user_id, "memory sync queue full, dropping job");
                false
            }
            Err(TrySendError::Closed(job)) => {
                warn!(user_id = %job.user_id, "memory sync worker gone, dropping job");
                false
            }
        }
    }

    pub fn sync(&self, user_id: &str, session_id: &str, facts: Vec<String>, source: &str) -> bool {
        self.submit(SyncJob::facts(user_id, session_id, facts, source))
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Call {
        EnsureUser(String),
        EnsureThread(String, String),
        Append(String, String),
    }

    /// Records every call; appends whose 1-based position is listed in
    /// `fail_appends` return an error.
    #[derive(Default)]
    pub struct RecordingMemory {
        pub calls: Mutex<Vec<Call>>,
        pub fail_appends: Vec<usize>,
        pub fail_ensure_user: bool,
    }

    impl RecordingMemory {
        pub fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }
    }

    fn refused() -> SyncError {
        SyncError::Status {
            status: 503,
            body: "unavailable".to_string(),
        }
    }

    #[async_trait]
    impl MemoryService for RecordingMemory {
        async fn ensure_user(&self, user_id: &str) -> Result<(), SyncError> {
            self.calls
                .lock()
                .unwrap()
                .push(Call::EnsureUser(user_id.to_string()));
            if self.fail_ensure_user {
                return Err(refused());
            }
            Ok(())
        }

        async fn ensure_thread(
            &self,
            thread_id: &str,
            user_id: &str,
            _source: &str,
        ) -> Result<(), SyncError> {
            self.calls.lock().unwrap().push(Call::EnsureThread(
                thread_id.to_string(),
                user_id.to_string(),
            ));
            Ok(())
        }

        async fn append_message(
            &self,
            thread_id: &str,
            message: &MemoryMessage,
        ) -> Result<(), SyncError> {
            let position = {
                let mut calls = self.calls.lock().unwrap();
                calls.push(Call::Append(thread_id.to_string(), message.content.clone()));
                calls
                    .iter()
                    .filter(|call| matches!(call, Call::Append(..)))
                    .count()
            };
            if self.fail_appends.contains(&position) {
                return Err(refused());
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{Call, RecordingMemory};
    use super::*;

    fn job(messages: &[&str]) -> SyncJob {
        SyncJob {
            user_id: "u1".to_string(),
            thread_id: "chat-1".to_string(),
            source: "test".to_string(),
            messages: messages
                .iter()
                .map(|content| MemoryMessage::new("user", *content))
                .collect(),
        }
    }

    #[tokio::test]
    async fn failed_append_does_not_stop_later_ones() {
        let memory = RecordingMemory {
            fail_appends: vec![1],
            ..Default::default()
        };
        let report = run_sync(&memory, &job(&["first", "second", "third"])).await;

        assert_eq!(report, SyncReport { appended: 2, failed: 1 });
        assert_eq!(
            memory.calls(),
            vec![
                Call::EnsureUser("u1".to_string()),
                Call::EnsureThread("chat-1".to_string(), "u1".to_string()),
                Call::Append("chat-1".to_string(), "first".to_string()),
                Call::Append("chat-1".to_string(), "second".to_string()),
                Call::Append("chat-1".to_string(), "third".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn ensure_failures_are_absorbed() {
        let memory = RecordingMemory {
            fail_ensure_user: true,
            ..Default::default()
        };
        let report = run_sync(&memory, &job(&["only"])).await;
        assert_eq!(report.appended, 1);
        assert_eq!(memory.calls().len(), 3);
    }

    #[tokio::test]
    async fn worker_drains_jobs_in_submission_order() {
        let memory = Arc::new(RecordingMemory::default());
        let (sync, worker) = MemorySync::spawn(memory.clone(), 8);

        assert!(sync.submit(job(&["a"])));
        assert!(sync.sync("u1", "fractional_u1", vec!["fact".to_string()], "profile"));
        drop(sync);
        worker.await.unwrap();

        let appends = memory
            .calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Append(thread, content) => Some((thread, content)),
                _ => None,
            })
            .collect::<Vec<_>>();
        assert_eq!(
            appends,
            vec![
                ("chat-1".to_string(), "a".to_string()),
                ("fractional_u1".to_string(), "fact".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn full_queue_drops_instead_of_waiting() {
        let (tx, _rx) = mpsc::channel::<SyncJob>(1);
        let sync = MemorySync { tx: Some(tx) };
        assert!(sync.submit(job(&["a"])));
        assert!(!sync.submit(job(&["b"])));
    }

    #[test]
    fn disabled_handle_and_empty_jobs_are_rejected() {
        let sync = MemorySync::disabled();
        assert!(!sync.is_enabled());
        assert!(!sync.submit(job(&["a"])));

        let (tx, _rx) = mpsc::channel::<SyncJob>(4);
        let sync = MemorySync { tx: Some(tx) };
        assert!(!sync.submit(job(&[])));
        assert!(!sync.sync("", "t", vec!["fact".to_string()], "profile"));
    }

    #[test]
    fn fact_jobs_use_system_role() {
        let job = SyncJob::facts(
            "u1",
            &profile_thread_id("u1"),
            vec!["User is based in Leeds".into()],
            "profile",
        );
        assert_eq!(job.thread_id, "fractional_u1");
        assert_eq!(job.messages[0].role, "system");
        assert_eq!(
            serde_json::to_value(&job.messages[0]).unwrap(),
            json!({ "role": "system", "content": "User is based in Leeds" })
        );
    }

    fn client() -> ZepClient {
        ZepClient::new("http://127.0.0.1:9/api/v2/", "k", Duration::from_secs(1)).unwrap()
    }

    #[test]
    fn thread_ids_stay_inside_one_path_segment() {
        let thread = profile_thread_id("x/../../users/victim/memory?y=#z");
        let url = client().endpoint(&["threads", &thread, "messages"]).unwrap();

        assert_eq!(
            url.as_str(),
            "http://127.0.0.1:9/api/v2/threads/fractional_x%2F..%2F..%2Fusers%2Fvictim%2Fmemory%3Fy=%23z/messages"
        );
        assert_eq!(url.query(), None);
        assert_eq!(url.path_segments().unwrap().count(), 5);
    }

    #[test]
    fn dot_and_empty_segments_are_refused() {
        let client = client();
        for thread in ["..", ".", "", " "] {
            assert!(matches!(
                client.endpoint(&["threads", thread, "messages"]),
                Err(SyncError::InvalidPathSegment(_))
            ));
        }
        assert_eq!(
            client.endpoint(&["users"]).unwrap().as_str(),
            "http://127.0.0.1:9/api/v2/users"
        );
    }

    #[test]
    fn base_url_must_be_hierarchical() {
        assert!(matches!(
            ZepClient::new("not a url", "k", Duration::from_secs(1)),
            Err(SyncError::InvalidUrl(_))
        ));
        assert!(matches!(
            ZepClient::new("mailto:ops@example.com", "k", Duration::from_secs(1)),
            Err(SyncError::InvalidUrl(_))
        ));
    }

    #[tokio::test]
    async fn refused_thread_id_fails_without_a_request() {
        let err = client()
            .append_message("..", &MemoryMessage::new("user", "hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::InvalidPathSegment(_)));
    }

    #[tokio::test]
    async fn hung_memory_service_times_out_instead_of_stalling() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _silent = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let client = ZepClient::new(
            &format!("http://{addr}/api/v2"),
            "k",
            Duration::from_millis(200),
        )
        .unwrap();
        let started = std::time::Instant::now();
        let err = client
            .append_message("fractional_u1", &MemoryMessage::new("user", "hi"))
            .await
            .unwrap_err();

        assert!(matches!(err, SyncError::Http(ref e) if e.is_timeout()));
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
