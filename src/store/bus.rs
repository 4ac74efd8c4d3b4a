//! Stream bus - task streams, completion queue, status updates
//!
//! The in-memory shape of the hot store's streams:
//!
//! - `wf.tasks.{type}`: one stream per executable node type, carrying
//!   Tokens. Workers compete for messages (consumer-group semantics).
//! - `completion_signals`: the queue coordinators block on.
//! - `run.status.updates`: consumed by the status projector.
//!
//! Competing consumption is modeled with a shared receiver: any number of
//! consumers hold the same underlying queue and each message is delivered
//! to exactly one of them. Redelivery on a production stream backend is
//! absorbed by the coordinator's applied-op set, not here.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, Mutex};

use crate::ir::{CompletionSignal, StatusUpdate, Token};

/// Stream name prefix for per-type task streams
pub const TASK_STREAM_PREFIX: &str = "wf.tasks.";

/// Queue name coordinators consume
pub const COMPLETION_SIGNALS: &str = "completion_signals";

/// Stream name the projector consumes
pub const STATUS_UPDATES: &str = "run.status.updates";

/// A receiver any number of consumers can share; each message goes to
/// exactly one
#[derive(Debug)]
pub struct SharedReceiver<T> {
    inner: Arc<Mutex<mpsc::UnboundedReceiver<T>>>,
}

impl<T> Clone for SharedReceiver<T> {
    fn clone(&self) -> Self {
        SharedReceiver {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> SharedReceiver<T> {
    /// Receive the next message; `None` only when the bus is gone
    pub async fn recv(&self) -> Option<T> {
        self.inner.lock().await.recv().await
    }

    /// Non-blocking receive
    pub fn try_recv(&self) -> Option<T> {
        self.inner.try_lock().ok()?.try_recv().ok()
    }
}

#[derive(Debug)]
struct Channel<T> {
    tx: mpsc::UnboundedSender<T>,
    rx: SharedReceiver<T>,
}

impl<T> Channel<T> {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Channel {
            tx,
            rx: SharedReceiver {
                inner: Arc::new(Mutex::new(rx)),
            },
        }
    }
}

impl<T> Default for Channel<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// The hot store's streams and channels
#[derive(Debug, Default)]
pub struct StreamBus {
    tasks: DashMap<String, Channel<Token>>,
    signals: Channel<CompletionSignal>,
    statuses: Channel<StatusUpdate>,
}

impl StreamBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Full stream name for a node type
    pub fn task_stream_name(node_type: &str) -> String {
        format!("{}{}", TASK_STREAM_PREFIX, node_type)
    }

    /// Publish a token onto `wf.tasks.{type}`
    pub fn publish_task(&self, node_type: &str, token: Token) {
        let name = Self::task_stream_name(node_type);
        let channel = self.tasks.entry(name).or_default();
        // the bus owns the receiver, so the channel can never be closed
        let _ = channel.tx.send(token);
    }

    /// Worker-side handle on `wf.tasks.{type}`; clones compete
    pub fn task_stream(&self, node_type: &str) -> SharedReceiver<Token> {
        let name = Self::task_stream_name(node_type);
        self.tasks.entry(name).or_default().rx.clone()
    }

    /// Publish a completion signal
    pub fn publish_signal(&self, signal: CompletionSignal) {
        let _ = self.signals.tx.send(signal);
    }

    /// Coordinator-side handle on `completion_signals`; clones compete
    pub fn completion_signals(&self) -> SharedReceiver<CompletionSignal> {
        self.signals.rx.clone()
    }

    /// Publish a status update
    pub fn publish_status(&self, update: StatusUpdate) {
        let _ = self.statuses.tx.send(update);
    }

    /// Projector-side handle on `run.status.updates`
    pub fn status_updates(&self) -> SharedReceiver<StatusUpdate> {
        self.statuses.rx.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{RunStatus, SignalStatus};
    use crate::types::RunId;
    use chrono::Utc;
    use serde_json::json;

    fn token(run_id: RunId, to: &str) -> Token {
        Token {
            id: Token::derive_id(run_id, None, to, "start"),
            run_id,
            from_node: None,
            to_node: to.to_string(),
            payload_ref: None,
            config: json!({}),
            hop: 0,
            metadata: serde_json::Value::Null,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn tokens_route_by_node_type() {
        let bus = StreamBus::new();
        let run = RunId::generate();
        let http = bus.task_stream("http");
        let agent = bus.task_stream("agent");

        bus.publish_task("http", token(run, "fetch"));
        bus.publish_task("agent", token(run, "plan"));

        assert_eq!(http.recv().await.unwrap().to_node, "fetch");
        assert_eq!(agent.recv().await.unwrap().to_node, "plan");
        assert!(http.try_recv().is_none());
    }

    #[tokio::test]
    async fn competing_consumers_each_get_one() {
        let bus = StreamBus::new();
        let run = RunId::generate();
        let a = bus.task_stream("http");
        let b = bus.task_stream("http");

        bus.publish_task("http", token(run, "one"));
        bus.publish_task("http", token(run, "two"));

        let first = a.recv().await.unwrap();
        let second = b.recv().await.unwrap();
        let mut seen = vec![first.to_node, second.to_node];
        seen.sort();
        assert_eq!(seen, vec!["one", "two"]);
    }

    #[tokio::test]
    async fn signals_and_statuses_flow() {
        let bus = StreamBus::new();
        let run = RunId::generate();

        bus.publish_signal(CompletionSignal {
            version: 1,
            job_id: "job-1".to_string(),
            run_id: run,
            node_id: "a".to_string(),
            status: SignalStatus::Completed,
            result_data: Some(json!({"ok": true})),
            result_ref: None,
            metadata: None,
        });
        let signal = bus.completion_signals().recv().await.unwrap();
        assert_eq!(signal.node_id, "a");

        bus.publish_status(StatusUpdate::now(run, RunStatus::Running));
        let update = bus.status_updates().recv().await.unwrap();
        assert_eq!(update.status, RunStatus::Running);
    }

    #[tokio::test]
    async fn publish_before_subscribe_is_buffered() {
        let bus = StreamBus::new();
        let run = RunId::generate();
        bus.publish_task("transform", token(run, "late"));
        let rx = bus.task_stream("transform");
        assert_eq!(rx.recv().await.unwrap().to_node, "late");
    }
}
