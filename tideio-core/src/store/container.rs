use crate::error::{Result, TideError};
use crate::store::object::{ArrayStruct, Object};
use crate::txn::TransactionManager;
use crate::types::{ObjectFilter, ObjectId, ObjectKind, TransId};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

/// Listing row returned by `list_objects`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectEntry {
    pub id: ObjectId,
    pub kind: ObjectKind,
    pub name: Option<String>,
}

/// Tracks which TIDs have been handed to persist, so purge requests can be
/// classified: already persisted runs now, in flight is deferred until the
/// persist lands, anything else is a conflict.
#[derive(Debug, Default)]
struct PersistLog {
    inflight: BTreeSet<TransId>,
    persisted_upto: TransId,
    deferred: Vec<(ObjectId, TransId)>,
}

/// Where a purge request ended up.
#[derive(Debug, PartialEq, Eq)]
pub enum PurgeDisposition {
    Applied,
    Deferred,
}

/// A named namespace of objects sharing one transaction timeline.
pub struct Container {
    pub name: String,
    pub txns: TransactionManager,
    objects: Mutex<BTreeMap<ObjectId, Arc<Object>>>,
    persist_log: Mutex<PersistLog>,
    open_count: AtomicU32,
}

impl Container {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            txns: TransactionManager::new(),
            objects: Mutex::new(BTreeMap::new()),
            persist_log: Mutex::new(PersistLog::default()),
            open_count: AtomicU32::new(0),
        }
    }

    pub fn opened(&self) {
        self.open_count.fetch_add(1, Ordering::SeqCst);
    }

    pub fn closed(&self) {
        let prev = self.open_count.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev > 0);
    }

    pub fn open_count(&self) -> u32 {
        self.open_count.load(Ordering::SeqCst)
    }

    pub fn create_object(
        &self,
        tid: TransId,
        kind: ObjectKind,
        name: Option<&str>,
        array: Option<ArrayStruct>,
    ) -> Result<Arc<Object>> {
        let obj = Arc::new(Object::create(tid, kind, name, array)?);
        let mut objects = self.objects.lock().unwrap();
        objects.insert(obj.id, obj.clone());
        tracing::debug!(
            "created {:?} object {} in container {} at transaction {}",
            kind,
            obj.id,
            self.name,
            tid
        );
        Ok(obj)
    }

    pub fn get_object(&self, id: ObjectId) -> Result<Arc<Object>> {
        let objects = self.objects.lock().unwrap();
        objects
            .get(&id)
            .cloned()
            .ok_or_else(|| TideError::NotFound(format!("object not found: {}", id)))
    }

    /// Objects visible at `tid`, ordered by ID, filtered by kind, windowed by
    /// offset and count.
    pub fn list_objects(
        &self,
        tid: TransId,
        filter: ObjectFilter,
        offset: u64,
        num: u64,
    ) -> Vec<ObjectEntry> {
        let objects = self.objects.lock().unwrap();
        objects
            .values()
            .filter(|obj| filter.matches(obj.kind) && obj.visible_at(tid))
            .skip(offset as usize)
            .take(num as usize)
            .map(|obj| ObjectEntry {
                id: obj.id,
                kind: obj.kind,
                name: obj.name.clone(),
            })
            .collect()
    }

    /// Count of objects visible at `tid` regardless of kind.
    pub fn num_objects(&self, tid: TransId) -> u64 {
        let objects = self.objects.lock().unwrap();
        objects.values().filter(|obj| obj.visible_at(tid)).count() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.objects.lock().unwrap().is_empty()
    }

    pub fn all_objects(&self) -> Vec<Arc<Object>> {
        self.objects.lock().unwrap().values().cloned().collect()
    }

    // Persist/purge coordination.

    pub fn begin_persist(&self, tid: TransId) {
        self.persist_log.lock().unwrap().inflight.insert(tid);
    }

    pub fn abandon_persist(&self, tid: TransId) {
        let mut log = self.persist_log.lock().unwrap();
        log.inflight.remove(&tid);
        // Deferred purges waiting on this persist stay queued only if some
        // other inflight persist still covers them.
        let persisted_upto = log.persisted_upto;
        let highest_inflight = log.inflight.iter().next_back().copied().unwrap_or(0);
        log.deferred.retain(|&(_, purge_tid)| {
            purge_tid <= persisted_upto || purge_tid <= highest_inflight
        });
    }

    /// Record persist completion and return the deferred purges it unblocks.
    pub fn complete_persist(&self, tid: TransId) -> Vec<(ObjectId, TransId)> {
        let mut log = self.persist_log.lock().unwrap();
        log.inflight.remove(&tid);
        log.persisted_upto = log.persisted_upto.max(tid);
        let upto = log.persisted_upto;
        let mut unblocked = Vec::new();
        log.deferred.retain(|&entry| {
            if entry.1 <= upto {
                unblocked.push(entry);
                false
            } else {
                true
            }
        });
        unblocked
    }

    /// Classify a purge request for `(object, tid)`. Purging is legal only
    /// for TIDs already handed to persist: completed persists purge now,
    /// inflight ones defer, anything else is a conflict.
    pub fn request_purge(&self, object: ObjectId, tid: TransId) -> Result<PurgeDisposition> {
        let mut log = self.persist_log.lock().unwrap();
        if tid <= log.persisted_upto {
            return Ok(PurgeDisposition::Applied);
        }
        if log.inflight.iter().any(|&p| tid <= p) {
            log.deferred.push((object, tid));
            tracing::debug!(
                "purge of object {} at transaction {} deferred until persist completes",
                object,
                tid
            );
            return Ok(PurgeDisposition::Deferred);
        }
        Err(TideError::StateConflict(format!(
            "transaction {} was not given to persist; cannot purge",
            tid
        )))
    }
}
