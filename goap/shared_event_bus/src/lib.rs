#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]

//! Event bus used by the planning stack to announce plans, replans and learning updates.

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::{fs::OpenOptions, io::AsyncWriteExt};

/// Generic event record encoded as JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    /// Unique identifier.
    pub id: String,
    /// Module producing the event.
    pub source: String,
    /// Event type (e.g., `goap.executor.replan`).
    pub event_type: String,
    /// ISO timestamp.
    pub timestamp: String,
    /// Arbitrary JSON payload.
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl EventRecord {
    /// Whether the event type starts with the dotted `prefix`.
    #[must_use]
    pub fn is_within(&self, prefix: &str) -> bool {
        self.event_type == prefix
            || self
                .event_type
                .strip_prefix(prefix)
                .is_some_and(|rest| rest.starts_with('.'))
    }
}

/// Event publisher interface.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publishes an event to the bus.
    async fn publish(&self, event: EventRecord) -> Result<()>;
}

/// In-memory bus keeping a bounded backlog; the oldest event is evicted
/// once `capacity` is reached.
#[derive(Debug, Clone)]
pub struct MemoryEventBus {
    backlog: Arc<Mutex<VecDeque<EventRecord>>>,
    capacity: usize,
}

impl MemoryEventBus {
    /// Creates a new bus with the given capacity.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            backlog: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity,
        }
    }

    /// Snapshot of recent events retained in memory.
    #[must_use]
    pub fn snapshot(&self) -> Vec<EventRecord> {
        self.backlog.lock().iter().cloned().collect()
    }

    /// Retained events under the dotted `prefix`, oldest first.
    #[must_use]
    pub fn events_within(&self, prefix: &str) -> Vec<EventRecord> {
        self.backlog
            .lock()
            .iter()
            .filter(|event| event.is_within(prefix))
            .cloned()
            .collect()
    }
}

/// File-backed publisher writing one JSON event per line.
#[derive(Debug, Clone)]
pub struct FileEventPublisher {
    path: PathBuf,
}

impl FileEventPublisher {
    /// Creates a publisher that appends JSON lines to the given path.
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating event log dir {}", parent.display()))?;
        }
        Ok(Self { path })
    }

    /// Log file this publisher appends to.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads back every event written so far, oldest first.
    pub fn replay(&self) -> Result<Vec<EventRecord>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let raw = std::fs::read_to_string(&self.path)
            .with_context(|| format!("reading event log {}", self.path.display()))?;
        raw.lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).context("decoding event record"))
            .collect()
    }
}

#[async_trait]
impl EventPublisher for MemoryEventBus {
    async fn publish(&self, event: EventRecord) -> Result<()> {
        let mut backlog = self.backlog.lock();
        if backlog.len() == self.capacity {
            backlog.pop_front();
        }
        backlog.push_back(event);
        Ok(())
    }
}

#[async_trait]
impl EventPublisher for FileEventPublisher {
    async fn publish(&self, event: EventRecord) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        let mut data = serde_json::to_vec(&event)?;
        data.push(b'\n');
        file.write_all(&data).await?;
        file.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use tokio::runtime::Runtime;

    fn sample_event(event_type: &str) -> EventRecord {
        EventRecord {
            id: "event-1".into(),
            source: "goap.executor".into(),
            event_type: event_type.into(),
            timestamp: "2026-01-10T00:00:00Z".into(),
            payload: serde_json::json!({"attempt": 1}),
        }
    }

    #[test]
    fn publishes_through_the_trait_object() {
        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            let bus = MemoryEventBus::new(16);
            let publisher: Arc<dyn EventPublisher> = Arc::new(bus.clone());
            publisher.publish(sample_event("goap.executor.replan")).await.unwrap();
            let events = bus.snapshot();
            assert_eq!(events.len(), 1);
            assert_eq!(events[0].event_type, "goap.executor.replan");
        });
    }

    #[test]
    fn backlog_respects_capacity_and_prefix() {
        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            let bus = MemoryEventBus::new(2);
            bus.publish(sample_event("goap.planner.reuse_hit")).await.unwrap();
            bus.publish(sample_event("goap.executor.replan")).await.unwrap();
            bus.publish(sample_event("goap.executorx.other")).await.unwrap();
            assert_eq!(bus.snapshot().len(), 2);
            assert_eq!(bus.events_within("goap.executor").len(), 1);
            assert!(bus.events_within("goap.planner").is_empty());
        });
    }

    #[test]
    fn file_publisher_writes_and_replays_events() {
        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            let dir = tempdir().unwrap();
            let path = dir.path().join("events.log");
            let publisher = FileEventPublisher::new(&path).unwrap();
            publisher
                .publish(sample_event("goap.learning.recorded"))
                .await
                .unwrap();
            publisher
                .publish(sample_event("goap.executor.replan"))
                .await
                .unwrap();
            assert_eq!(publisher.path(), path.as_path());
            let events = publisher.replay().unwrap();
            assert_eq!(events.len(), 2);
            assert!(events[0].is_within("goap.learning"));
            assert_eq!(events[1].event_type, "goap.executor.replan");
        });
    }
}
