use crate::error::{Result, TideError};
use crate::types::TransId;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One written byte run inside an object's flat address space.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Extent {
    pub offset: u64,
    #[serde(with = "serde_bytes_vec")]
    pub data: Bytes,
}

mod serde_bytes_vec {
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &Bytes, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_bytes(data)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Bytes, D::Error> {
        let raw = Vec::<u8>::deserialize(de)?;
        Ok(Bytes::from(raw))
    }
}

impl Extent {
    pub fn end(&self) -> u64 {
        self.offset + self.data.len() as u64
    }
}

/// Per-TID delta history of an object's bytes on the burst buffer. Reads at
/// a TID compose every delta at or below it in TID order, starting from the
/// fetched base when lower deltas were purged.
#[derive(Debug, Default)]
pub struct VersionStore {
    base: Option<(TransId, Vec<Extent>)>,
    deltas: BTreeMap<TransId, Vec<Extent>>,
    purged_upto: TransId,
}

impl VersionStore {
    pub fn write(&mut self, tid: TransId, extents: Vec<Extent>) {
        self.deltas.entry(tid).or_default().extend(extents);
    }

    /// Drop the delta written under an aborted TID.
    pub fn rollback(&mut self, tid: TransId) {
        self.deltas.remove(&tid);
    }

    /// Reclaim burst-buffer storage at and below `tid`, the fetched base
    /// included.
    pub fn purge(&mut self, tid: TransId) {
        self.deltas = self.deltas.split_off(&(tid + 1));
        if let Some((base_tid, _)) = &self.base {
            if *base_tid <= tid {
                self.base = None;
            }
        }
        self.purged_upto = self.purged_upto.max(tid);
    }

    /// Whether any burst-buffer bytes remain at or below `tid`.
    pub fn has_data_upto(&self, tid: TransId) -> bool {
        self.deltas.range(..=tid).next().is_some()
            || self.base.as_ref().is_some_and(|(t, _)| *t <= tid)
    }

    /// Install a full state fetched from central storage as the composition
    /// base at `tid`.
    pub fn install_base(&mut self, tid: TransId, extents: Vec<Extent>) {
        self.base = Some((tid, extents));
    }

    /// The delta written under exactly `tid`, for incremental replication.
    pub fn delta_of(&self, tid: TransId) -> Vec<Extent> {
        self.deltas.get(&tid).cloned().unwrap_or_default()
    }

    fn check_purged(&self, tid: TransId) -> Result<()> {
        if self.purged_upto == 0 {
            return Ok(());
        }
        match &self.base {
            Some((base_tid, _)) if *base_tid >= self.purged_upto && *base_tid <= tid => Ok(()),
            _ => Err(TideError::StateConflict(format!(
                "data at or below transaction {} was purged from the burst buffer; fetch it first",
                self.purged_upto
            ))),
        }
    }

    /// Compose the requested byte ranges as observed at `tid`. Unwritten
    /// bytes read as zero. Returns one buffer concatenating the ranges in
    /// request order.
    pub fn compose_ranges(&self, tid: TransId, ranges: &[(u64, u64)]) -> Result<Bytes> {
        self.check_purged(tid)?;

        let total: u64 = ranges.iter().map(|(_, len)| len).sum();
        let mut out = vec![0u8; total as usize];

        let mut apply = |extent: &Extent| {
            let mut out_pos = 0u64;
            for &(start, len) in ranges {
                let end = start + len;
                let lo = extent.offset.max(start);
                let hi = extent.end().min(end);
                if lo < hi {
                    let src = &extent.data[(lo - extent.offset) as usize..(hi - extent.offset) as usize];
                    let dst_start = (out_pos + (lo - start)) as usize;
                    out[dst_start..dst_start + src.len()].copy_from_slice(src);
                }
                out_pos += len;
            }
        };

        let base_tid = if let Some((bt, extents)) = &self.base {
            if *bt <= tid {
                for extent in extents {
                    apply(extent);
                }
                *bt
            } else {
                0
            }
        } else {
            0
        };

        // A base installed at `tid` itself leaves no delta window.
        if base_tid < tid {
            for (_, extents) in self.deltas.range(base_tid + 1..=tid) {
                for extent in extents {
                    apply(extent);
                }
            }
        }

        Ok(Bytes::from(out))
    }

    /// Flatten the full written state at `tid` into minimal merged extents,
    /// the payload migrated by persist and full replication.
    pub fn flatten(&self, tid: TransId) -> Result<Vec<Extent>> {
        self.check_purged(tid)?;

        // Collect covered intervals, merge them, then compose each run.
        let mut intervals: Vec<(u64, u64)> = Vec::new();
        if let Some((bt, extents)) = &self.base {
            if *bt <= tid {
                intervals.extend(extents.iter().map(|e| (e.offset, e.end())));
            }
        }
        for (_, extents) in self.deltas.range(..=tid) {
            intervals.extend(extents.iter().map(|e| (e.offset, e.end())));
        }
        if intervals.is_empty() {
            return Ok(Vec::new());
        }

        intervals.sort_unstable();
        let mut merged: Vec<(u64, u64)> = Vec::new();
        for (start, end) in intervals {
            match merged.last_mut() {
                Some((_, last_end)) if start <= *last_end => *last_end = (*last_end).max(end),
                _ => merged.push((start, end)),
            }
        }

        let mut out = Vec::with_capacity(merged.len());
        for (start, end) in merged {
            let data = self.compose_ranges(tid, &[(start, end - start)])?;
            out.push(Extent { offset: start, data });
        }
        Ok(out)
    }
}
