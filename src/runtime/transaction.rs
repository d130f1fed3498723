use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use uuid::Uuid;

use crate::error::Result;
use crate::runtime::model::{Entity, Record, RecordKey, RecordKind, Revision};
use crate::runtime::storage::{Change, RecordStore};

#[derive(Debug, Clone)]
struct Entry {
    /// Revision read from the store, `0` if the record did not exist.
    revision: Revision,
    record: Option<Record>,
    dirty: bool,
}

/// Unit of work over a [`RecordStore`].
///
/// Reads are cached for the lifetime of the transaction; writes stay in memory until
/// [`Transaction::commit`], which hands them to the store together with the revisions
/// they were read at. Dropping a transaction rolls it back.
pub struct Transaction {
    store: Arc<dyn RecordStore>,
    // Ordered by key; ids are v7 uuids so iteration follows creation order.
    entries: BTreeMap<RecordKey, Entry>,
    scanned: HashSet<(RecordKind, Option<Uuid>)>,
}

impl Transaction {
    pub fn begin(store: Arc<dyn RecordStore>) -> Self {
        Self {
            store,
            entries: BTreeMap::new(),
            scanned: HashSet::new(),
        }
    }

    pub async fn get<E: Entity>(&mut self, id: Uuid) -> Result<Option<E>> {
        let key = RecordKey::new(E::KIND, id);
        if !self.entries.contains_key(&key) {
            let entry = match self.store.load(&key).await? {
                Some(v) => Entry {
                    revision: v.revision,
                    record: Some(v.record),
                    dirty: false,
                },
                None => Entry {
                    revision: 0,
                    record: None,
                    dirty: false,
                },
            };
            self.entries.insert(key, entry);
        }
        Ok(self
            .entries
            .get(&key)
            .and_then(|e| e.record.as_ref())
            .and_then(E::from_record)
            .cloned())
    }

    /// Pulls every record of `kind` (of one process instance, or all) into the cache.
    /// Records already cached keep their in-transaction state.
    pub async fn scan(&mut self, kind: RecordKind, process_instance_id: Option<Uuid>) -> Result<()> {
        if self.scanned.contains(&(kind, None)) || self.scanned.contains(&(kind, process_instance_id)) {
            return Ok(());
        }
        for v in self.store.scan(kind, process_instance_id).await? {
            self.entries.entry(v.record.key()).or_insert(Entry {
                revision: v.revision,
                record: Some(v.record),
                dirty: false,
            });
        }
        self.scanned.insert((kind, process_instance_id));
        Ok(())
    }

    /// Marks a scope as fully known without asking the store (freshly created instances).
    pub fn mark_scanned(&mut self, kind: RecordKind, process_instance_id: Option<Uuid>) {
        self.scanned.insert((kind, process_instance_id));
    }

    /// Live cached records of one kind, in key order.
    pub fn cached<E: Entity>(&self) -> impl Iterator<Item = &E> {
        self.entries
            .iter()
            .filter(|(key, _)| key.kind == E::KIND)
            .filter_map(|(_, e)| e.record.as_ref().and_then(E::from_record))
    }

    pub fn put<E: Entity>(&mut self, entity: E) {
        let key = RecordKey::new(E::KIND, entity.id());
        let entry = self.entries.entry(key).or_insert(Entry {
            revision: 0,
            record: None,
            dirty: false,
        });
        entry.record = Some(entity.into_record());
        entry.dirty = true;
    }

    pub fn remove<E: Entity>(&mut self, id: Uuid) {
        let key = RecordKey::new(E::KIND, id);
        let entry = self.entries.entry(key).or_insert(Entry {
            revision: 0,
            record: None,
            dirty: false,
        });
        entry.record = None;
        entry.dirty = true;
    }

    /// Forces a revision bump on commit even though nothing changed, so that
    /// concurrent transactions touching the same record conflict.
    pub fn touch<E: Entity>(&mut self, id: Uuid) {
        if let Some(entry) = self.entries.get_mut(&RecordKey::new(E::KIND, id)) {
            if entry.record.is_some() {
                entry.dirty = true;
            }
        }
    }

    pub fn changes(&self) -> Vec<Change> {
        self.entries
            .iter()
            .filter(|(_, e)| e.dirty)
            .filter_map(|(key, e)| match (&e.record, e.revision) {
                (Some(record), expected) => Some(Change::Put {
                    record: record.clone(),
                    expected,
                }),
                // created and removed within this transaction
                (None, 0) => None,
                (None, expected) => Some(Change::Delete { key: *key, expected }),
            })
            .collect()
    }

    pub async fn commit(self) -> Result<()> {
        let changes = self.changes();
        if changes.is_empty() {
            return Ok(());
        }
        self.store.commit(changes).await
    }
}
