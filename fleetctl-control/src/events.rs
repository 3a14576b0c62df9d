//! SSE progress events (C7).
//!
//! The core is transport-agnostic: it only produces a typed sequence of
//! [`DeployEvent`]s over an [`EventSink`]. Wire framing (`encode_sse`) is a
//! pure function a caller's HTTP layer can use to turn that sequence into
//! actual Server-Sent Events bytes; this crate never opens a socket for it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum DeployEvent {
    Log { message: String, level: LogLevel },
    Complete { success: bool, deployment_id: String, error: Option<String> },
}

#[derive(Serialize)]
struct LogPayload<'a> {
    message: &'a str,
    level: LogLevel,
}

#[derive(Serialize)]
struct CompletePayload<'a> {
    success: bool,
    deployment_id: &'a str,
    error: &'a Option<String>,
}

/// Encodes one event as an SSE frame: `event: <kind>\ndata: <json>\n\n`.
pub fn encode_sse(event: &DeployEvent) -> String {
    match event {
        DeployEvent::Log { message, level } => {
            let data = serde_json::to_string(&LogPayload { message, level: *level }).expect("LogPayload always serializes");
            format!("event: log\ndata: {data}\n\n")
        }
        DeployEvent::Complete { success, deployment_id, error } => {
            let data = serde_json::to_string(&CompletePayload { success: *success, deployment_id, error })
                .expect("CompletePayload always serializes");
            format!("event: complete\ndata: {data}\n\n")
        }
    }
}

/// Progress sink used by orchestrators. Enforces spec invariant 5 ("every
/// emitted SSE stream ends with exactly one `complete` event; no events
/// follow it") centrally rather than trusting every call site to get the
/// ordering right.
#[derive(Clone)]
pub struct EventSink {
    tx: UnboundedSender<DeployEvent>,
    terminated: Arc<AtomicBool>,
}

impl EventSink {
    pub fn channel() -> (Self, UnboundedReceiver<DeployEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx, terminated: Arc::new(AtomicBool::new(false)) }, rx)
    }

    fn send(&self, event: DeployEvent) {
        if self.terminated.load(Ordering::SeqCst) {
            return;
        }
        // Receiver may already be gone (caller stopped listening); dropping
        // the event is fine, this is best-effort progress reporting.
        let _ = self.tx.send(event);
    }

    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        let ts = chrono::Utc::now().format("%H:%M:%S");
        self.send(DeployEvent::Log { message: format!("[{ts}] {}", message.into()), level });
    }

    pub fn info(&self, message: impl Into<String>) {
        self.log(LogLevel::Info, message);
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.log(LogLevel::Warn, message);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.log(LogLevel::Error, message);
    }

    /// Emits the terminal event. Subsequent calls to `log`/`complete` are
    /// silently dropped.
    pub fn complete(&self, success: bool, deployment_id: impl Into<String>, error: Option<String>) {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.tx.send(DeployEvent::Complete { success, deployment_id: deployment_id.into(), error });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_log_frame() {
        let frame = encode_sse(&DeployEvent::Log { message: "[00:00:01] hi".to_string(), level: LogLevel::Info });
        assert!(frame.starts_with("event: log\ndata: "));
        assert!(frame.ends_with("\n\n"));
        assert!(frame.contains("\"level\":\"info\""));
    }

    #[test]
    fn encodes_complete_frame_with_null_error() {
        let frame = encode_sse(&DeployEvent::Complete { success: true, deployment_id: "d1".to_string(), error: None });
        assert!(frame.contains("\"success\":true"));
        assert!(frame.contains("\"error\":null"));
    }

    #[tokio::test]
    async fn nothing_follows_complete() {
        let (sink, mut rx) = EventSink::channel();
        sink.info("starting");
        sink.complete(true, "d1", None);
        sink.info("should be dropped");
        sink.error("also dropped");
        drop(sink);

        let mut received = Vec::new();
        while let Some(event) = rx.recv().await {
            received.push(event);
        }

        assert_eq!(received.len(), 2);
        assert!(matches!(received[1], DeployEvent::Complete { .. }));
    }

    #[tokio::test]
    async fn only_first_complete_call_wins() {
        let (sink, mut rx) = EventSink::channel();
        sink.complete(false, "d1", Some("boom".to_string()));
        sink.complete(true, "d1", None);
        drop(sink);

        let event = rx.recv().await.unwrap();
        match event {
            DeployEvent::Complete { success, error, .. } => {
                assert!(!success);
                assert_eq!(error.as_deref(), Some("boom"));
            }
            _ => panic!("expected complete event"),
        }
        assert!(rx.recv().await.is_none());
    }
}
