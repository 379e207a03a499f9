//! Topic-keyed publish/subscribe fan-out for run log lines and status
//! changes.
//!
//! Built on `tokio::sync::broadcast`, generalized from "one callback per
//! operation" to "fan-out per topic": a global `"stream"` topic carries
//! everything, and each run additionally gets its own topic keyed by id.

use serde_json::json;
use std::collections::HashMap;
use std::sync::RwLock;
use tokio::sync::broadcast;

/// Topic name for the global log/status stream.
pub const GLOBAL_TOPIC: &str = "stream";

const CHANNEL_CAPACITY: usize = 1024;

/// The event bus. Cheaply cloneable; all clones share the same topic map.
#[derive(Clone)]
pub struct EventBus {
    topics: std::sync::Arc<RwLock<HashMap<String, broadcast::Sender<String>>>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            topics: std::sync::Arc::new(RwLock::new(HashMap::new())),
        }
    }

    fn sender_for(&self, topic: &str) -> broadcast::Sender<String> {
        if let Some(tx) = self.topics.read().unwrap().get(topic) {
            return tx.clone();
        }
        let mut topics = self.topics.write().unwrap();
        topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }

    /// Subscribe to `topic`. Only messages published after this call are
    /// ever observed by the returned receiver.
    pub fn subscribe(&self, topic: &str) -> broadcast::Receiver<String> {
        self.sender_for(topic).subscribe()
    }

    /// Publish a raw UTF-8 message to `topic`. A no-op if nobody is
    /// subscribed — delivery is best-effort at-most-once per subscriber.
    pub fn publish(&self, topic: &str, message: String) {
        let _ = self.sender_for(topic).send(message);
    }

    /// Publish a log line envelope to
    /// both the per-run topic and the global stream topic.
    pub fn publish_log(&self, run_id: &str, line: &str) {
        let envelope = json!({ "log": line }).to_string();
        self.publish(run_id, envelope.clone());
        self.publish(GLOBAL_TOPIC, envelope);
    }

    /// Publish a status-change envelope (`{"status": "...", "run_id": "..."}`)
    /// to both the per-run topic and the global stream topic.
    pub fn publish_status(&self, run_id: &str, status: &str) {
        let envelope = json!({ "status": status, "run_id": run_id }).to_string();
        self.publish(run_id, envelope.clone());
        self.publish(GLOBAL_TOPIC, envelope);
    }
}
