//! Progress notification hub
//!
//! One broadcast topic per instance. Log lines are also kept in a bounded
//! ring so a late subscriber first receives recent context.

use std::collections::{HashMap, VecDeque};
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, trace};

use crate::provisioning::progress::ProvisioningProgress;

const CHANNEL_CAPACITY: usize = 256;

/// Event pushed to subscribers
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ProgressEvent {
    Progress {
        progress: ProvisioningProgress,
    },
    Log {
        #[serde(rename = "instanceId")]
        instance_id: String,
        line: String,
        timestamp: DateTime<Utc>,
    },
}

impl ProgressEvent {
    /// SSE event name
    pub fn name(&self) -> &'static str {
        match self {
            ProgressEvent::Progress { .. } => "progress",
            ProgressEvent::Log { .. } => "log",
        }
    }
}

/// Where the tracker sends snapshots and log lines
pub trait ProgressSink: Send + Sync {
    fn publish_progress(&self, progress: &ProvisioningProgress);

    fn publish_log(&self, instance_id: &str, line: &str);

    /// The run was evicted; drop retained state for it
    fn release(&self, instance_id: &str);
}

/// Discards everything
#[derive(Debug, Default)]
pub struct NullSink;

impl ProgressSink for NullSink {
    fn publish_progress(&self, _progress: &ProvisioningProgress) {}

    fn publish_log(&self, _instance_id: &str, _line: &str) {}

    fn release(&self, _instance_id: &str) {}
}

struct Topic {
    sender: broadcast::Sender<ProgressEvent>,
    replay: VecDeque<String>,
}

impl Topic {
    fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            sender,
            replay: VecDeque::new(),
        }
    }
}

/// A live interest in one instance
pub struct Subscription {
    pub instance_id: String,

    /// Recent log lines, oldest first
    pub replay: Vec<String>,

    pub receiver: broadcast::Receiver<ProgressEvent>,
}

/// Fan-out of progress and log events to any number of subscribers
pub struct ProgressHub {
    replay_lines: usize,
    topics: RwLock<HashMap<String, Topic>>,
}

impl ProgressHub {
    pub fn new(replay_lines: usize) -> Self {
        Self {
            replay_lines,
            topics: RwLock::new(HashMap::new()),
        }
    }

    pub fn subscribe(&self, instance_id: &str) -> Subscription {
        let mut topics = self.topics.write().unwrap_or_else(|e| e.into_inner());
        let topic = topics
            .entry(instance_id.to_string())
            .or_insert_with(Topic::new);
        debug!(
            "Subscriber joined {} ({} buffered lines)",
            instance_id,
            topic.replay.len()
        );

        Subscription {
            instance_id: instance_id.to_string(),
            replay: topic.replay.iter().cloned().collect(),
            receiver: topic.sender.subscribe(),
        }
    }

    /// Drop the subscription; prune the topic once nobody listens and
    /// nothing is buffered
    pub fn unsubscribe(&self, subscription: Subscription) {
        let instance_id = subscription.instance_id.clone();
        drop(subscription);
        self.prune(&instance_id);
    }

    /// Remove the topic if it has no receivers and no buffered lines
    pub fn prune(&self, instance_id: &str) {
        let mut topics = self.topics.write().unwrap_or_else(|e| e.into_inner());
        let idle = topics
            .get(instance_id)
            .is_some_and(|t| t.sender.receiver_count() == 0 && t.replay.is_empty());
        if idle {
            topics.remove(instance_id);
        }
    }

    pub fn subscriber_count(&self, instance_id: &str) -> usize {
        self.topics
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(instance_id)
            .map_or(0, |t| t.sender.receiver_count())
    }

    /// Buffered log lines for an instance, oldest first
    pub fn recent_logs(&self, instance_id: &str) -> Vec<String> {
        self.topics
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(instance_id)
            .map(|t| t.replay.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn send(&self, instance_id: &str, event: ProgressEvent) {
        let topics = self.topics.read().unwrap_or_else(|e| e.into_inner());
        if let Some(topic) = topics.get(instance_id) {
            // No receivers is not an error
            let _ = topic.sender.send(event);
        }
    }
}

impl ProgressSink for ProgressHub {
    fn publish_progress(&self, progress: &ProvisioningProgress) {
        trace!("Progress {} -> {:?}", progress.instance_id, progress.status);
        self.send(
            &progress.instance_id,
            ProgressEvent::Progress {
                progress: progress.clone(),
            },
        );
    }

    fn publish_log(&self, instance_id: &str, line: &str) {
        {
            let mut topics = self.topics.write().unwrap_or_else(|e| e.into_inner());
            let topic = topics
                .entry(instance_id.to_string())
                .or_insert_with(Topic::new);
            topic.replay.push_back(line.to_string());
            while topic.replay.len() > self.replay_lines {
                topic.replay.pop_front();
            }
        }
        self.send(
            instance_id,
            ProgressEvent::Log {
                instance_id: instance_id.to_string(),
                line: line.to_string(),
                timestamp: Utc::now(),
            },
        );
    }

    fn release(&self, instance_id: &str) {
        let mut topics = self.topics.write().unwrap_or_else(|e| e.into_inner());
        if let Some(topic) = topics.get_mut(instance_id) {
            topic.replay.clear();
            if topic.sender.receiver_count() == 0 {
                topics.remove(instance_id);
            }
        }
    }
}
