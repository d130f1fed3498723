use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::runtime::model::{Record, RecordKey, RecordKind, Revision};

// --- Interfaces ---

/// A record together with the revision it was read at.
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned {
    pub revision: Revision,
    pub record: Record,
}

/// One write of a commit. `expected` is the revision the transaction read
/// (`0` for records it created).
#[derive(Debug, Clone)]
pub enum Change {
    Put { record: Record, expected: Revision },
    Delete { key: RecordKey, expected: Revision },
}

impl Change {
    pub fn key(&self) -> RecordKey {
        match self {
            Change::Put { record, .. } => record.key(),
            Change::Delete { key, .. } => *key,
        }
    }

    pub fn expected(&self) -> Revision {
        match self {
            Change::Put { expected, .. } | Change::Delete { expected, .. } => *expected,
        }
    }
}

/// Key-addressable, optimistically locked record store.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn load(&self, key: &RecordKey) -> Result<Option<Versioned>>;

    /// All records of a kind, optionally restricted to one process instance.
    /// Note: This might be expensive in remote implementations.
    async fn scan(&self, kind: RecordKind, process_instance_id: Option<Uuid>) -> Result<Vec<Versioned>>;

    /// Applies all changes or none. Every change's expected revision must match the
    /// stored one, otherwise the commit fails with `ConcurrentModification`.
    async fn commit(&self, changes: Vec<Change>) -> Result<()>;
}

pub(crate) fn conflict(key: &RecordKey) -> EngineError {
    EngineError::ConcurrentModification {
        kind: key.kind,
        id: key.id.to_string(),
    }
}

// --- In-Memory Implementation ---

pub struct InMemoryRecordStore {
    // Commits take the write lock so revision checks and writes are atomic.
    records: RwLock<HashMap<RecordKey, Versioned>>,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
        }
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }
}

impl Default for InMemoryRecordStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn load(&self, key: &RecordKey) -> Result<Option<Versioned>> {
        Ok(self.records.read().await.get(key).cloned())
    }

    async fn scan(&self, kind: RecordKind, process_instance_id: Option<Uuid>) -> Result<Vec<Versioned>> {
        let records = self.records.read().await;
        let mut found: Vec<Versioned> = records
            .iter()
            .filter(|(key, v)| {
                key.kind == kind
                    && process_instance_id.map_or(true, |pid| v.record.process_instance_id() == Some(pid))
            })
            .map(|(_, v)| v.clone())
            .collect();
        found.sort_by_key(|v| v.record.key());
        Ok(found)
    }

    async fn commit(&self, changes: Vec<Change>) -> Result<()> {
        let mut records = self.records.write().await;

        for change in &changes {
            let key = change.key();
            let current = records.get(&key).map(|v| v.revision).unwrap_or(0);
            if current != change.expected() {
                return Err(conflict(&key));
            }
        }

        for change in changes {
            match change {
                Change::Put { record, expected } => {
                    records.insert(
                        record.key(),
                        Versioned {
                            revision: expected + 1,
                            record,
                        },
                    );
                }
                Change::Delete { key, .. } => {
                    records.remove(&key);
                }
            }
        }
        Ok(())
    }
}
