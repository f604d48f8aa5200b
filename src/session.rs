use std::{
    collections::{HashMap, VecDeque},
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
};

use crate::record::RequestRecord;

pub const SESSION_TABLE_BOUND: usize = 100;
pub const SESSION_TABLE_TRIM: usize = 50;

/// Identifies one intercepted transaction across its request and response legs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Hands out session ids; one per proxy instance.
#[derive(Debug, Default)]
pub struct SessionIdGenerator {
    next: AtomicU64,
}

impl SessionIdGenerator {
    pub fn next_id(&self) -> SessionId {
        SessionId(self.next.fetch_add(1, Ordering::Relaxed) + 1)
    }
}

/// Request records waiting for their response leg.
///
/// Bounded: once more than [`SESSION_TABLE_BOUND`] keys have been inserted, the oldest
/// [`SESSION_TABLE_TRIM`] keys by insertion order are dropped in one step. Entries that were not
/// yet correlated are lost.
#[derive(Debug, Default)]
pub struct SessionTable {
    inner: Mutex<SessionTableInner>,
}

#[derive(Debug, Default)]
struct SessionTableInner {
    entries: HashMap<SessionId, Arc<RequestRecord>>,
    order: VecDeque<SessionId>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or overwrites the record for `id`.
    pub fn store(&self, id: SessionId, req: Arc<RequestRecord>) {
        let mut inner = self
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        inner.order.push_back(id);
        if inner.order.len() > SESSION_TABLE_BOUND {
            let evicted: Vec<_> = inner.order.drain(..SESSION_TABLE_TRIM).collect();
            for key in evicted {
                inner.entries.remove(&key);
            }
        }
        inner.entries.insert(id, req);
    }

    pub fn load(&self, id: SessionId) -> Option<Arc<RequestRecord>> {
        let inner = self
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        inner.entries.get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        let inner = self
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
