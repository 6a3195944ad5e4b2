//! Topic-keyed event bus with at-most-once delivery.
//!
//! Every subscriber owns a bounded queue. [`EventBus::publish`] never waits:
//! when a subscriber's queue is full the event is dropped for that subscriber
//! and counted, so a slow consumer can never stall a workflow.

use std::collections::HashMap;
use std::fmt;
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::trace;

/// Subscribing to this topic receives every event.
pub const ALL_TOPICS: &str = "*";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    WorkflowStarted,
    StepStarted,
    StepCompleted,
    StepSkipped,
    StepRetry,
    StepFailed,
    WorkflowCompleted,
    WorkflowFailed,
    WorkflowCancelled,
    WorkflowPaused,
    WorkflowResumed,
    PipelineStarted,
    JobStarted,
    JobCompleted,
    JobFailed,
    PipelineFinished,
}

impl EventKind {
    /// The bus topic this kind of event is published on.
    pub fn topic(self) -> &'static str {
        match self {
            EventKind::WorkflowStarted => "workflow.started",
            EventKind::StepStarted => "step.started",
            EventKind::StepCompleted => "step.completed",
            EventKind::StepSkipped => "step.skipped",
            EventKind::StepRetry => "step.retry",
            EventKind::StepFailed => "step.failed",
            EventKind::WorkflowCompleted => "workflow.completed",
            EventKind::WorkflowFailed => "workflow.failed",
            EventKind::WorkflowCancelled => "workflow.cancelled",
            EventKind::WorkflowPaused => "workflow.paused",
            EventKind::WorkflowResumed => "workflow.resumed",
            EventKind::PipelineStarted => "pipeline.started",
            EventKind::JobStarted => "job.started",
            EventKind::JobCompleted => "job.completed",
            EventKind::JobFailed => "job.failed",
            EventKind::PipelineFinished => "pipeline.finished",
        }
    }

    pub fn default_severity(self) -> Severity {
        match self {
            EventKind::StepRetry
            | EventKind::StepSkipped
            | EventKind::WorkflowCancelled
            | EventKind::WorkflowPaused => {
                Severity::Warning
            }
            EventKind::StepFailed | EventKind::WorkflowFailed | EventKind::JobFailed => {
                Severity::Error
            }
            _ => Severity::Info,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.topic())
    }
}

/// A timestamped, severity-tagged record of something that happened.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
    pub severity: Severity,
    /// Execution or pipeline id the event belongs to.
    pub source_id: String,
    pub step: Option<String>,
    pub message: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl Event {
    pub fn new(kind: EventKind, source_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            kind,
            severity: kind.default_severity(),
            source_id: source_id.into(),
            step: None,
            message: message.into(),
            data: serde_json::Value::Null,
        }
    }

    pub fn with_step(mut self, step: impl Into<String>) -> Self {
        self.step = Some(step.into());
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn topic(&self) -> &'static str {
        self.kind.topic()
    }
}

#[derive(Debug)]
pub struct EventBus {
    subscribers: RwLock<HashMap<String, Vec<mpsc::Sender<Event>>>>,
    capacity: usize,
    dropped: AtomicU64,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
            dropped: AtomicU64::new(0),
        }
    }

    /// Registers a subscriber for `topic` (or [`ALL_TOPICS`]).
    pub fn subscribe(&self, topic: &str) -> mpsc::Receiver<Event> {
        self.subscribe_with_capacity(topic, self.capacity)
    }

    pub fn subscribe_with_capacity(&self, topic: &str, capacity: usize) -> mpsc::Receiver<Event> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let mut subscribers = self
            .subscribers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        subscribers.entry(topic.to_string()).or_default().push(tx);
        rx
    }

    /// Delivers `event` to every matching subscriber without blocking.
    ///
    /// Returns how many subscribers accepted it.
    pub fn publish(&self, event: &Event) -> usize {
        let mut delivered = 0;
        let mut saw_closed = false;
        {
            let subscribers = self
                .subscribers
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            for topic in [event.topic(), ALL_TOPICS] {
                let Some(senders) = subscribers.get(topic) else {
                    continue;
                };
                for tx in senders {
                    match tx.try_send(event.clone()) {
                        Ok(()) => delivered += 1,
                        Err(mpsc::error::TrySendError::Full(_)) => {
                            self.dropped.fetch_add(1, Ordering::Relaxed);
                            trace!(topic, "subscriber queue full, event dropped");
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => saw_closed = true,
                    }
                }
            }
        }
        if saw_closed {
            self.prune();
        }
        delivered
    }

    /// Total events dropped because a subscriber's queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .values()
            .map(Vec::len)
            .sum()
    }

    fn prune(&self) {
        let mut subscribers = self
            .subscribers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for senders in subscribers.values_mut() {
            senders.retain(|tx| !tx.is_closed());
        }
        subscribers.retain(|_, senders| !senders.is_empty());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(kind: EventKind) -> Event {
        Event::new(kind, "exec-1", "something happened")
    }

    #[tokio::test]
    async fn topic_subscriber_only_sees_its_topic() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe("step.completed");

        bus.publish(&event(EventKind::StepStarted));
        bus.publish(&event(EventKind::StepCompleted));

        let received = rx.recv().await.unwrap();
        assert_eq!(received.kind, EventKind::StepCompleted);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn wildcard_subscriber_sees_everything() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe(ALL_TOPICS);

        bus.publish(&event(EventKind::WorkflowStarted));
        bus.publish(&event(EventKind::JobFailed));

        assert_eq!(rx.recv().await.unwrap().kind, EventKind::WorkflowStarted);
        assert_eq!(rx.recv().await.unwrap().kind, EventKind::JobFailed);
    }

    #[test]
    fn slow_subscriber_loses_events_instead_of_blocking() {
        let bus = EventBus::new(8);
        let mut slow = bus.subscribe_with_capacity(ALL_TOPICS, 2);
        let mut fast = bus.subscribe_with_capacity(ALL_TOPICS, 16);

        for _ in 0..5 {
            bus.publish(&event(EventKind::StepRetry));
        }

        assert_eq!(bus.dropped(), 3);
        let mut slow_count = 0;
        while slow.try_recv().is_ok() {
            slow_count += 1;
        }
        let mut fast_count = 0;
        while fast.try_recv().is_ok() {
            fast_count += 1;
        }
        assert_eq!(slow_count, 2);
        assert_eq!(fast_count, 5);
    }

    #[test]
    fn closed_subscribers_are_pruned() {
        let bus = EventBus::new(4);
        let rx = bus.subscribe(ALL_TOPICS);
        assert_eq!(bus.subscriber_count(), 1);
        drop(rx);

        assert_eq!(bus.publish(&event(EventKind::WorkflowCompleted)), 0);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn severity_defaults_follow_kind() {
        assert_eq!(event(EventKind::StepFailed).severity, Severity::Error);
        assert_eq!(event(EventKind::StepRetry).severity, Severity::Warning);
        assert_eq!(event(EventKind::StepCompleted).severity, Severity::Info);
    }
}
