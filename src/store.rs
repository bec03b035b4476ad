//! In-memory record tables: the authoritative primary store and the
//! per-process replica cache.
//!
//! Both guard their table with one `Mutex`; id assignment plus append is a
//! single critical section. Reads clone records out so no lock is held
//! while callers serialize.

use std::sync::Mutex;

use crate::record::Record;

struct Table {
    records: Vec<Record>,
    current_id: i64,
}

impl Table {
    fn find_mut(&mut self, id: i64) -> Option<&mut Record> {
        self.records.iter_mut().find(|record| record.id == id)
    }

    fn find(&self, id: i64) -> Option<&Record> {
        self.records.iter().find(|record| record.id == id)
    }
}

/// The single authoritative record table. Ids start at 1, increment
/// monotonically, and are never reused even after deletion.
///
/// Constructed explicitly at process startup and handed to the request
/// handlers; there is no hidden global instance.
pub struct PrimaryStore {
    inner: Mutex<Table>,
}

impl Default for PrimaryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl PrimaryStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Table {
                records: Vec::new(),
                current_id: 0,
            }),
        }
    }

    /// Always succeeds and returns the record with its newly assigned id.
    pub fn save(&self, title: String, body: String) -> Record {
        let mut table = self.inner.lock().unwrap();
        table.current_id += 1;
        let record = Record {
            id: table.current_id,
            title,
            body,
        };
        table.records.push(record.clone());
        record
    }

    pub fn find_by_id(&self, id: i64) -> Option<Record> {
        self.inner.lock().unwrap().find(id).cloned()
    }

    /// Replaces both fields unconditionally. A field absent at the protocol
    /// layer clears to the empty string. Returns `false` when `id` is
    /// unknown, with no side effects.
    pub fn update_full(&self, id: i64, title: Option<String>, body: Option<String>) -> bool {
        let mut table = self.inner.lock().unwrap();
        match table.find_mut(id) {
            Some(record) => {
                record.title = title.unwrap_or_default();
                record.body = body.unwrap_or_default();
                true
            }
            None => false,
        }
    }

    /// Replaces only the fields explicitly provided.
    pub fn update_partial(&self, id: i64, title: Option<String>, body: Option<String>) -> bool {
        let mut table = self.inner.lock().unwrap();
        match table.find_mut(id) {
            Some(record) => {
                if let Some(title) = title {
                    record.title = title;
                }
                if let Some(body) = body {
                    record.body = body;
                }
                true
            }
            None => false,
        }
    }

    pub fn delete_by_id(&self, id: i64) -> bool {
        let mut table = self.inner.lock().unwrap();
        let before = table.records.len();
        table.records.retain(|record| record.id != id);
        table.records.len() != before
    }

    pub fn list_all(&self) -> Vec<Record> {
        self.inner.lock().unwrap().records.clone()
    }
}

/// A replica's local mirror: seeded once from the primary's snapshot and
/// thereafter mutated only by primary-pushed backup operations.
///
/// Backup creates assign ids from a local counter seeded with the snapshot
/// *length*, so replica ids can diverge from the primary's once any record
/// has been deleted. Known defect, kept intact (see DESIGN.md).
pub struct ReplicaCache {
    inner: Mutex<Table>,
}

impl ReplicaCache {
    pub fn from_snapshot(records: Vec<Record>) -> Self {
        let current_id = records.len() as i64;
        Self {
            inner: Mutex::new(Table {
                records,
                current_id,
            }),
        }
    }

    pub fn apply_create(&self, title: String, body: String) {
        let mut table = self.inner.lock().unwrap();
        table.current_id += 1;
        let record = Record {
            id: table.current_id,
            title,
            body,
        };
        table.records.push(record);
    }

    pub fn apply_update_full(&self, id: i64, title: Option<String>, body: Option<String>) {
        let mut table = self.inner.lock().unwrap();
        if let Some(record) = table.find_mut(id) {
            record.title = title.unwrap_or_default();
            record.body = body.unwrap_or_default();
        }
    }

    pub fn apply_update_partial(&self, id: i64, title: Option<String>, body: Option<String>) {
        let mut table = self.inner.lock().unwrap();
        if let Some(record) = table.find_mut(id) {
            if let Some(title) = title {
                record.title = title;
            }
            if let Some(body) = body {
                record.body = body;
            }
        }
    }

    pub fn apply_delete(&self, id: i64) {
        let mut table = self.inner.lock().unwrap();
        table.records.retain(|record| record.id != id);
    }

    pub fn find_by_id(&self, id: i64) -> Option<Record> {
        self.inner.lock().unwrap().find(id).cloned()
    }

    pub fn list_all(&self) -> Vec<Record> {
        self.inner.lock().unwrap().records.clone()
    }
}
