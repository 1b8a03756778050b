//! FIFO of ready entries with an explicit membership set
//!
//! Membership is updated in the same critical section as the deque, so
//! "is this identity queued" never needs a scan of the queue contents.

use std::collections::{HashSet, VecDeque};

use tokio::sync::Mutex;

use crate::identity::{Identity, PoolEntry};

#[derive(Default)]
struct QueueInner {
    entries: VecDeque<PoolEntry>,
    members: HashSet<Identity>,
}

/// Ready-to-use entries in availability order.
#[derive(Default)]
pub struct WorkQueue {
    inner: Mutex<QueueInner>,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry. An identity already queued is handed back.
    pub async fn push(&self, entry: PoolEntry) -> std::result::Result<(), PoolEntry> {
        let mut inner = self.inner.lock().await;
        if !inner.members.insert(entry.identity().clone()) {
            return Err(entry);
        }
        inner.entries.push_back(entry);
        Ok(())
    }

    /// Take the oldest entry without waiting.
    pub async fn pop(&self) -> Option<PoolEntry> {
        let mut inner = self.inner.lock().await;
        let entry = inner.entries.pop_front()?;
        inner.members.remove(entry.identity());
        Some(entry)
    }

    /// Pull a specific identity out of the queue.
    pub async fn remove(&self, identity: &Identity) -> Option<PoolEntry> {
        let mut inner = self.inner.lock().await;
        if !inner.members.remove(identity) {
            return None;
        }
        let index = inner
            .entries
            .iter()
            .position(|e| e.identity() == identity)?;
        inner.entries.remove(index)
    }

    pub async fn contains(&self, identity: &Identity) -> bool {
        self.inner.lock().await.members.contains(identity)
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.entries.len()
    }

    /// Queued identities, oldest first.
    pub async fn identities(&self) -> Vec<Identity> {
        let inner = self.inner.lock().await;
        inner.entries.iter().map(|e| e.identity().clone()).collect()
    }
}
