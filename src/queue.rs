//! Deferred-work queue — persisted FIFO of requests that hit a hard
//! rate limit.
//!
//! Every mutation rewrites `deferred_queue.json` in full (atomic rename).
//! Depth is bounded by operators, not by load, so the O(n) rewrite is
//! fine. Nothing is requeued implicitly: a dequeued item that fails again
//! is gone unless the caller enqueues it anew (at-most-once).

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::PathBuf;
use uuid::Uuid;

use crate::state;

/// What to retry: one (symbol, endpoint) poll.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationDescriptor {
    pub symbol: String,
    pub endpoint: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: Uuid,
    pub operation: OperationDescriptor,
    pub error: String,
    pub enqueued_at: DateTime<Utc>,
}

impl QueueItem {
    pub fn new(operation: OperationDescriptor, error: impl Into<String>, enqueued_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            operation,
            error: error.into(),
            enqueued_at,
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct QueueFile {
    items: VecDeque<QueueItem>,
}

pub struct DeferredWorkQueue {
    path: PathBuf,
    file: QueueFile,
}

impl DeferredWorkQueue {
    pub fn load(path: PathBuf) -> Result<Self> {
        let file: QueueFile = state::load_or_recover(&path)?;
        Ok(Self { path, file })
    }

    pub fn enqueue(&mut self, item: QueueItem) -> Result<()> {
        self.file.items.push_back(item);
        self.persist()
    }

    pub fn dequeue(&mut self) -> Result<Option<QueueItem>> {
        let item = self.file.items.pop_front();
        if item.is_some() {
            self.persist()?;
        }
        Ok(item)
    }

    pub fn peek(&self) -> Option<&QueueItem> {
        self.file.items.front()
    }

    pub fn size(&self) -> usize {
        self.file.items.len()
    }

    pub fn clear(&mut self) -> Result<()> {
        self.file.items.clear();
        self.persist()
    }

    fn persist(&self) -> Result<()> {
        state::atomic_write_json(&self.path, &self.file)
    }
}
