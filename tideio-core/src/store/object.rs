use crate::error::{Result, TideError};
use crate::io::{Extent, VersionStore};
use crate::kv::KvVersions;
use crate::types::{
    Checksum, DimSeq, Layout, ObjectId, ObjectKind, TransId, MAX_DIMS, OBJ_NAME_MAXLEN,
    SCRATCH_LEN,
};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Mutex;

/// Structural metadata of an array object. `firstdim_max` bounds growth of
/// the first logical dimension; absent means the array is fixed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArrayStruct {
    pub cell_size: u32,
    pub num_dims: u32,
    pub current_dims: Vec<u64>,
    /// `None` for contiguous layout.
    pub chunk_dims: Option<Vec<u64>>,
    pub dims_seq: DimSeq,
    pub firstdim_max: Option<u64>,
}

impl ArrayStruct {
    pub fn validate(&self) -> Result<()> {
        let n = self.num_dims as usize;
        if n == 0 || n > MAX_DIMS {
            return Err(TideError::InvalidArgument(format!(
                "array has {} dimensions, expected 1..={}",
                n, MAX_DIMS
            )));
        }
        if self.cell_size == 0 {
            return Err(TideError::InvalidArgument("cell size must be non-zero".to_string()));
        }
        if self.current_dims.len() != n {
            return Err(TideError::InvalidArgument(
                "current_dims length does not match num_dims".to_string(),
            ));
        }
        if let Some(chunks) = &self.chunk_dims {
            if chunks.len() != n {
                return Err(TideError::InvalidArgument(
                    "chunk_dims length does not match num_dims".to_string(),
                ));
            }
        }
        if self.dims_seq.len() != n {
            return Err(TideError::InvalidArgument(
                "dimension sequence length does not match num_dims".to_string(),
            ));
        }
        if let Some(max) = self.firstdim_max {
            if self.current_dims[0] > max {
                return Err(TideError::InvalidArgument(
                    "first dimension already exceeds its growth bound".to_string(),
                ));
            }
        }
        Ok(())
    }

    pub fn extendable(&self) -> bool {
        self.firstdim_max.is_some()
    }
}

/// Snapshot payload migrated between tiers, serialized with serde_json.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SnapshotPayload {
    Extents(Vec<Extent>),
    Kv(Vec<(String, Vec<u8>, Checksum)>),
}

#[derive(Debug)]
enum Versions {
    Extents(VersionStore),
    Kv(KvVersions),
}

#[derive(Debug)]
struct ObjectState {
    unlinked_at: Option<TransId>,
    open_handles: u32,
    array: Option<ArrayStruct>,
    scratch: BTreeMap<TransId, ([u8; SCRATCH_LEN], Checksum)>,
    layouts: BTreeMap<TransId, Layout>,
    versions: Versions,
}

/// One object of a container: array, blob, or KV. Existence is TID-ranged:
/// visible from the creating TID up to (exclusive) the unlink TID.
pub struct Object {
    pub id: ObjectId,
    pub kind: ObjectKind,
    pub name: Option<String>,
    pub created_tid: TransId,
    state: Mutex<ObjectState>,
}

pub fn validate_name(name: Option<&str>) -> Result<()> {
    if let Some(name) = name {
        if name.is_empty() || name.len() > OBJ_NAME_MAXLEN {
            return Err(TideError::InvalidArgument(format!(
                "object name length {} outside 1..={}",
                name.len(),
                OBJ_NAME_MAXLEN
            )));
        }
    }
    Ok(())
}

impl Object {
    pub fn create(
        tid: TransId,
        kind: ObjectKind,
        name: Option<&str>,
        array: Option<ArrayStruct>,
    ) -> Result<Self> {
        validate_name(name)?;
        let (name, array) = match kind {
            ObjectKind::Array => {
                let mut array = array.ok_or_else(|| {
                    TideError::InvalidArgument("array objects require a structure".to_string())
                })?;
                if array.dims_seq.is_empty() {
                    array.dims_seq = DimSeq::identity(array.num_dims as usize);
                }
                array.validate()?;
                (name.map(str::to_string), Some(array))
            }
            ObjectKind::Blob => (name.map(str::to_string), None),
            // KV objects are nameless; a passed-in name is ignored.
            ObjectKind::Kv => (None, None),
        };

        let versions = match kind {
            ObjectKind::Kv => Versions::Kv(KvVersions::default()),
            _ => Versions::Extents(VersionStore::default()),
        };

        Ok(Self {
            id: ObjectId::mint(),
            kind,
            name,
            created_tid: tid,
            state: Mutex::new(ObjectState {
                unlinked_at: None,
                open_handles: 0,
                array,
                scratch: BTreeMap::new(),
                layouts: BTreeMap::new(),
                versions,
            }),
        })
    }

    pub fn visible_at(&self, tid: TransId) -> bool {
        if tid < self.created_tid {
            return false;
        }
        let st = self.state.lock().unwrap();
        match st.unlinked_at {
            Some(unlink_tid) => tid < unlink_tid,
            None => true,
        }
    }

    pub fn open(&self) {
        self.state.lock().unwrap().open_handles += 1;
    }

    pub fn close(&self) {
        let mut st = self.state.lock().unwrap();
        st.open_handles = st.open_handles.saturating_sub(1);
    }

    pub fn open_handles(&self) -> u32 {
        self.state.lock().unwrap().open_handles
    }

    /// Unlink at `tid`: invisible at TIDs >= tid, still visible below.
    /// Repeating the unlink at the same TID is a no-op; at any other TID it
    /// is a conflict. Fails while any handle is open.
    pub fn unlink(&self, tid: TransId) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        if st.open_handles > 0 {
            return Err(TideError::StateConflict(format!(
                "object {} has {} open handles",
                self.id, st.open_handles
            )));
        }
        match st.unlinked_at {
            None => {
                st.unlinked_at = Some(tid);
                Ok(())
            }
            Some(existing) if existing == tid => Ok(()),
            Some(existing) => Err(TideError::StateConflict(format!(
                "object {} already unlinked at transaction {}",
                self.id, existing
            ))),
        }
    }

    pub fn set_scratch(&self, tid: TransId, scratch: &[u8], cs: Option<Checksum>) -> Result<Checksum> {
        let data: [u8; SCRATCH_LEN] = scratch.try_into().map_err(|_| {
            TideError::InvalidArgument(format!(
                "scratchpad must be exactly {} bytes, got {}",
                SCRATCH_LEN,
                scratch.len()
            ))
        })?;
        let cs = match cs {
            Some(cs) => {
                cs.verify([scratch])?;
                cs
            }
            None => Checksum::of_bytes(scratch),
        };
        self.state.lock().unwrap().scratch.insert(tid, (data, cs));
        Ok(cs)
    }

    pub fn get_scratch(&self, tid: TransId) -> Result<([u8; SCRATCH_LEN], Checksum)> {
        let st = self.state.lock().unwrap();
        st.scratch
            .range(..=tid)
            .next_back()
            .map(|(_, entry)| *entry)
            .ok_or_else(|| {
                TideError::NotFound(format!(
                    "object {} has no scratchpad at transaction {}",
                    self.id, tid
                ))
            })
    }

    /// Attach a placement descriptor at `tid`. Never moves data. Returns
    /// false when the layout is unchanged (a documented no-op).
    pub fn set_layout(&self, tid: TransId, layout: Layout) -> Result<bool> {
        if let Some(seq) = &layout.dims_seq {
            let st = self.state.lock().unwrap();
            if let Some(array) = &st.array {
                if seq.len() != array.num_dims as usize {
                    return Err(TideError::InvalidArgument(
                        "layout dimension sequence length does not match the array".to_string(),
                    ));
                }
            }
        }
        let mut st = self.state.lock().unwrap();
        let current = st.layouts.range(..=tid).next_back().map(|(_, l)| l.clone());
        if current.as_ref() == Some(&layout) {
            return Ok(false);
        }
        st.layouts.insert(tid, layout);
        Ok(true)
    }

    pub fn get_layout(&self, tid: TransId) -> Layout {
        let st = self.state.lock().unwrap();
        st.layouts
            .range(..=tid)
            .next_back()
            .map(|(_, l)| l.clone())
            .unwrap_or_else(Layout::default_bb)
    }

    pub fn get_struct(&self) -> Result<ArrayStruct> {
        let st = self.state.lock().unwrap();
        st.array.clone().ok_or_else(|| {
            TideError::InvalidArgument(format!("object {} is not an array", self.id))
        })
    }

    /// Grow the first logical dimension. Fixed arrays and requests beyond
    /// the configured bound are conflicts; shrinking is invalid. Racing
    /// get_struct callers may observe the old structure; that race is
    /// documented and accepted.
    pub fn extend(&self, firstdim_len: u64) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        let array = st.array.as_mut().ok_or_else(|| {
            TideError::InvalidArgument(format!("object {} is not an array", self.id))
        })?;
        if !array.extendable() {
            return Err(TideError::StateConflict(format!(
                "array {} has a fixed first dimension",
                self.id
            )));
        }
        let max = array.firstdim_max.unwrap_or(u64::MAX);
        if firstdim_len > max {
            return Err(TideError::StateConflict(format!(
                "requested first dimension {} exceeds bound {}",
                firstdim_len, max
            )));
        }
        if firstdim_len < array.current_dims[0] {
            return Err(TideError::InvalidArgument(format!(
                "shrinking from {} to {} is not supported",
                array.current_dims[0], firstdim_len
            )));
        }
        array.current_dims[0] = firstdim_len;
        Ok(())
    }

    // Byte-extent payload (array and blob objects).

    pub fn write_extents(&self, tid: TransId, extents: Vec<Extent>) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        match &mut st.versions {
            Versions::Extents(store) => {
                store.write(tid, extents);
                Ok(())
            }
            Versions::Kv(_) => Err(TideError::InvalidArgument(format!(
                "object {} is a KV object",
                self.id
            ))),
        }
    }

    pub fn read_ranges(&self, tid: TransId, ranges: &[(u64, u64)]) -> Result<Bytes> {
        let st = self.state.lock().unwrap();
        match &st.versions {
            Versions::Extents(store) => store.compose_ranges(tid, ranges),
            Versions::Kv(_) => Err(TideError::InvalidArgument(format!(
                "object {} is a KV object",
                self.id
            ))),
        }
    }

    /// Run a closure against the KV versions of this object.
    pub fn with_kv<T>(&self, f: impl FnOnce(&mut KvVersions) -> Result<T>) -> Result<T> {
        let mut st = self.state.lock().unwrap();
        match &mut st.versions {
            Versions::Kv(kv) => f(kv),
            Versions::Extents(_) => Err(TideError::InvalidArgument(format!(
                "object {} is not a KV object",
                self.id
            ))),
        }
    }

    // Migration support.

    pub fn rollback(&self, tid: TransId) {
        let mut st = self.state.lock().unwrap();
        match &mut st.versions {
            Versions::Extents(store) => store.rollback(tid),
            Versions::Kv(kv) => kv.rollback(tid),
        }
        st.scratch.remove(&tid);
        st.layouts.remove(&tid);
    }

    pub fn purge(&self, tid: TransId) {
        let mut st = self.state.lock().unwrap();
        match &mut st.versions {
            Versions::Extents(store) => store.purge(tid),
            Versions::Kv(kv) => kv.purge(tid),
        }
        tracing::debug!("purged object {} at and below transaction {}", self.id, tid);
    }

    pub fn has_bb_data_upto(&self, tid: TransId) -> bool {
        let st = self.state.lock().unwrap();
        match &st.versions {
            Versions::Extents(store) => store.has_data_upto(tid),
            Versions::Kv(kv) => kv.has_data_upto(tid),
        }
    }

    /// Flattened state at `tid`, the payload persist migrates to central
    /// storage.
    pub fn snapshot_payload(&self, tid: TransId) -> Result<SnapshotPayload> {
        let st = self.state.lock().unwrap();
        match &st.versions {
            Versions::Extents(store) => Ok(SnapshotPayload::Extents(store.flatten(tid)?)),
            Versions::Kv(kv) => Ok(SnapshotPayload::Kv(
                kv.flatten(tid)?
                    .into_iter()
                    .map(|(k, v, cs)| (k, v.to_vec(), cs))
                    .collect(),
            )),
        }
    }

    /// Install a payload fetched from central storage as the composition
    /// base at `tid`.
    pub fn install_snapshot(&self, tid: TransId, payload: SnapshotPayload) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        match (&mut st.versions, payload) {
            (Versions::Extents(store), SnapshotPayload::Extents(extents)) => {
                store.install_base(tid, extents);
                Ok(())
            }
            (Versions::Kv(kv), SnapshotPayload::Kv(pairs)) => {
                let view = pairs
                    .into_iter()
                    .map(|(k, v, cs)| (k, (Bytes::from(v), cs)))
                    .collect();
                kv.install_base(tid, view);
                Ok(())
            }
            _ => Err(TideError::Internal(format!(
                "snapshot payload kind does not match object {}",
                self.id
            ))),
        }
    }

    /// The delta written under exactly `tid`, for incremental replication.
    pub fn delta_extents(&self, tid: TransId) -> Result<Vec<Extent>> {
        let st = self.state.lock().unwrap();
        match &st.versions {
            Versions::Extents(store) => Ok(store.delta_of(tid)),
            Versions::Kv(_) => Err(TideError::InvalidArgument(format!(
                "object {} is a KV object",
                self.id
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed_array() -> ArrayStruct {
        ArrayStruct {
            cell_size: 4,
            num_dims: 2,
            current_dims: vec![3, 4],
            chunk_dims: None,
            dims_seq: DimSeq::identity(2),
            firstdim_max: None,
        }
    }

    #[test]
    fn test_kv_objects_are_nameless() {
        let obj = Object::create(1, ObjectKind::Kv, Some("ignored"), None).unwrap();
        assert!(obj.name.is_none());
    }

    #[test]
    fn test_unlink_is_tid_ranged() {
        let obj = Object::create(2, ObjectKind::Blob, Some("b"), None).unwrap();
        assert!(!obj.visible_at(1));
        assert!(obj.visible_at(5));

        obj.unlink(4).unwrap();
        assert!(obj.visible_at(3));
        assert!(!obj.visible_at(4));
        assert!(!obj.visible_at(9));

        // Same-TID unlink is a stable no-op, higher-TID unlink a failure.
        obj.unlink(4).unwrap();
        assert!(matches!(obj.unlink(6), Err(TideError::StateConflict(_))));
    }

    #[test]
    fn test_unlink_fails_while_open() {
        let obj = Object::create(1, ObjectKind::Blob, None, None).unwrap();
        obj.open();
        assert!(matches!(obj.unlink(2), Err(TideError::StateConflict(_))));
        obj.close();
        obj.unlink(2).unwrap();
    }

    #[test]
    fn test_scratch_exact_length_and_versioning() {
        let obj = Object::create(1, ObjectKind::Blob, None, None).unwrap();
        assert!(obj.set_scratch(1, &[0u8; 16], None).is_err());

        let pad_a = [1u8; SCRATCH_LEN];
        let pad_b = [2u8; SCRATCH_LEN];
        let cs_a = obj.set_scratch(1, &pad_a, None).unwrap();
        obj.set_scratch(3, &pad_b, None).unwrap();

        let (got, got_cs) = obj.get_scratch(2).unwrap();
        assert_eq!(got, pad_a);
        assert_eq!(got_cs, cs_a);
        let (got, _) = obj.get_scratch(3).unwrap();
        assert_eq!(got, pad_b);
    }

    #[test]
    fn test_set_layout_unchanged_is_noop() {
        let obj = Object::create(1, ObjectKind::Blob, None, None).unwrap();
        let layout = Layout {
            loc: crate::types::Location::Central,
            target_num: 4,
            stripe_size: 1024,
            dims_seq: None,
        };
        assert!(obj.set_layout(1, layout.clone()).unwrap());
        assert!(!obj.set_layout(2, layout.clone()).unwrap());
        assert_eq!(obj.get_layout(5), layout);
    }

    #[test]
    fn test_extend_boundaries() {
        let obj = Object::create(1, ObjectKind::Array, Some("a"), Some(fixed_array())).unwrap();
        assert!(matches!(obj.extend(5), Err(TideError::StateConflict(_))));

        let mut bounded = fixed_array();
        bounded.firstdim_max = Some(10);
        let obj = Object::create(1, ObjectKind::Array, Some("a"), Some(bounded)).unwrap();
        obj.extend(8).unwrap();
        assert_eq!(obj.get_struct().unwrap().current_dims[0], 8);
        assert!(matches!(obj.extend(11), Err(TideError::StateConflict(_))));
        assert!(matches!(obj.extend(2), Err(TideError::InvalidArgument(_))));
    }
}
