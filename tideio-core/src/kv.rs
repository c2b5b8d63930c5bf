use crate::error::{Result, TideError};
use crate::types::{Checksum, TransId, KV_KEY_MAXLEN, KV_VALUE_MAXLEN};
use bytes::Bytes;
use std::collections::BTreeMap;

/// Outcome of a single-key get. A too-small caller buffer reports the true
/// length instead of transferring truncated data as success.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KvGetOutcome {
    Value { data: Bytes, cs: Checksum },
    TooSmall { actual_len: usize },
}

type KvDelta = BTreeMap<String, Option<(Bytes, Checksum)>>;
type KvView = BTreeMap<String, (Bytes, Checksum)>;

/// Per-TID delta history of a KV object. `None` entries are tombstones from
/// `unlink_keys`. Views at a TID fold deltas in TID order over the fetched
/// base, mirroring the byte-extent store.
#[derive(Debug, Default)]
pub struct KvVersions {
    base: Option<(TransId, KvView)>,
    deltas: BTreeMap<TransId, KvDelta>,
    purged_upto: TransId,
}

pub fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() || key.len() > KV_KEY_MAXLEN {
        return Err(TideError::InvalidArgument(format!(
            "KV key length {} outside 1..={}",
            key.len(),
            KV_KEY_MAXLEN
        )));
    }
    Ok(())
}

impl KvVersions {
    pub fn set(&mut self, tid: TransId, key: &str, value: Bytes, cs: Option<Checksum>) -> Result<Checksum> {
        validate_key(key)?;
        if value.len() > KV_VALUE_MAXLEN {
            return Err(TideError::InvalidArgument(format!(
                "KV value length {} exceeds {}",
                value.len(),
                KV_VALUE_MAXLEN
            )));
        }
        let cs = match cs {
            Some(cs) => {
                cs.verify([value.as_ref()])?;
                cs
            }
            None => Checksum::of_bytes(&value),
        };
        self.deltas
            .entry(tid)
            .or_default()
            .insert(key.to_string(), Some((value, cs)));
        Ok(cs)
    }

    fn check_purged(&self, tid: TransId) -> Result<()> {
        if self.purged_upto == 0 {
            return Ok(());
        }
        match &self.base {
            Some((base_tid, _)) if *base_tid >= self.purged_upto && *base_tid <= tid => Ok(()),
            _ => Err(TideError::StateConflict(format!(
                "KV data at or below transaction {} was purged from the burst buffer; fetch it first",
                self.purged_upto
            ))),
        }
    }

    /// Folded view of the object as observed at `tid`.
    pub fn view(&self, tid: TransId) -> Result<KvView> {
        self.check_purged(tid)?;
        let mut view = KvView::new();
        let base_tid = if let Some((bt, base)) = &self.base {
            if *bt <= tid {
                view = base.clone();
                *bt
            } else {
                0
            }
        } else {
            0
        };
        if base_tid >= tid {
            // Base installed at `tid` itself; no delta window to fold.
            return Ok(view);
        }
        for (_, delta) in self.deltas.range(base_tid + 1..=tid) {
            for (key, entry) in delta {
                match entry {
                    Some(value) => {
                        view.insert(key.clone(), value.clone());
                    }
                    None => {
                        view.remove(key);
                    }
                }
            }
        }
        Ok(view)
    }

    pub fn get_num(&self, tid: TransId) -> Result<u64> {
        Ok(self.view(tid)?.len() as u64)
    }

    pub fn get_value(&self, tid: TransId, key: &str, capacity: Option<usize>) -> Result<KvGetOutcome> {
        validate_key(key)?;
        let view = self.view(tid)?;
        let (data, cs) = view
            .get(key)
            .ok_or_else(|| TideError::NotFound(format!("key not found: {}", key)))?;
        if let Some(capacity) = capacity {
            if data.len() > capacity {
                return Ok(KvGetOutcome::TooSmall {
                    actual_len: data.len(),
                });
            }
        }
        Ok(KvGetOutcome::Value {
            data: data.clone(),
            cs: *cs,
        })
    }

    /// Keys in ascending lexicographic order over an offset window.
    pub fn list_keys(&self, tid: TransId, offset: u64, num: u64) -> Result<Vec<String>> {
        Ok(self
            .view(tid)?
            .into_keys()
            .skip(offset as usize)
            .take(num as usize)
            .collect())
    }

    /// Pairs in ascending lexicographic key order over an offset window.
    pub fn get_list(
        &self,
        tid: TransId,
        offset: u64,
        num: u64,
    ) -> Result<Vec<(String, Bytes, Checksum)>> {
        Ok(self
            .view(tid)?
            .into_iter()
            .skip(offset as usize)
            .take(num as usize)
            .map(|(k, (v, cs))| (k, v, cs))
            .collect())
    }

    /// Tombstone a batch of keys under one TID. Failures are per item; a key
    /// absent at `tid` reports NotFound for that item only.
    pub fn unlink_keys(&mut self, tid: TransId, keys: &[String]) -> Result<Vec<Result<()>>> {
        let view = self.view(tid)?;
        let mut results = Vec::with_capacity(keys.len());
        for key in keys {
            let item = validate_key(key).and_then(|_| {
                if view.contains_key(key) {
                    self.deltas
                        .entry(tid)
                        .or_default()
                        .insert(key.clone(), None);
                    Ok(())
                } else {
                    Err(TideError::NotFound(format!("key not found: {}", key)))
                }
            });
            results.push(item);
        }
        Ok(results)
    }

    pub fn rollback(&mut self, tid: TransId) {
        self.deltas.remove(&tid);
    }

    pub fn purge(&mut self, tid: TransId) {
        self.deltas = self.deltas.split_off(&(tid + 1));
        if let Some((base_tid, _)) = &self.base {
            if *base_tid <= tid {
                self.base = None;
            }
        }
        self.purged_upto = self.purged_upto.max(tid);
    }

    pub fn has_data_upto(&self, tid: TransId) -> bool {
        self.deltas.range(..=tid).next().is_some()
            || self.base.as_ref().is_some_and(|(t, _)| *t <= tid)
    }

    pub fn install_base(&mut self, tid: TransId, view: KvView) {
        self.base = Some((tid, view));
    }

    /// Flattened pairs at `tid`, the payload migrated by persist.
    pub fn flatten(&self, tid: TransId) -> Result<Vec<(String, Bytes, Checksum)>> {
        Ok(self
            .view(tid)?
            .into_iter()
            .map(|(k, (v, cs))| (k, v, cs))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_get_round_trip_with_checksum() {
        let mut kv = KvVersions::default();
        let cs = Checksum::of_bytes(b"value-1");
        let stored = kv.set(1, "alpha", Bytes::from_static(b"value-1"), Some(cs)).unwrap();
        assert_eq!(stored, cs);

        match kv.get_value(1, "alpha", None).unwrap() {
            KvGetOutcome::Value { data, cs: got } => {
                assert_eq!(data.as_ref(), b"value-1");
                assert_eq!(got, cs);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn test_bad_checksum_rejected() {
        let mut kv = KvVersions::default();
        let wrong = Checksum::of_bytes(b"other");
        let err = kv.set(1, "k", Bytes::from_static(b"v"), Some(wrong)).unwrap_err();
        assert!(matches!(err, TideError::ChecksumMismatch { .. }));
    }

    #[test]
    fn test_too_small_buffer_reports_length() {
        let mut kv = KvVersions::default();
        kv.set(1, "k", Bytes::from_static(b"0123456789"), None).unwrap();
        match kv.get_value(1, "k", Some(4)).unwrap() {
            KvGetOutcome::TooSmall { actual_len } => assert_eq!(actual_len, 10),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn test_ordered_listing_window() {
        let mut kv = KvVersions::default();
        for key in ["delta", "alpha", "charlie", "bravo"] {
            kv.set(1, key, Bytes::from_static(b"x"), None).unwrap();
        }
        assert_eq!(kv.get_num(1).unwrap(), 4);
        assert_eq!(
            kv.list_keys(1, 1, 2).unwrap(),
            vec!["bravo".to_string(), "charlie".to_string()]
        );
        let pairs = kv.get_list(1, 0, 10).unwrap();
        assert_eq!(pairs[0].0, "alpha");
        assert_eq!(pairs[3].0, "delta");
    }

    #[test]
    fn test_unlink_keys_is_per_item_and_versioned() {
        let mut kv = KvVersions::default();
        kv.set(1, "a", Bytes::from_static(b"1"), None).unwrap();
        kv.set(1, "b", Bytes::from_static(b"2"), None).unwrap();

        let results = kv
            .unlink_keys(2, &["a".to_string(), "missing".to_string()])
            .unwrap();
        assert!(results[0].is_ok());
        assert!(matches!(results[1], Err(TideError::NotFound(_))));

        // Removed at TID 2 but still visible at TID 1.
        assert_eq!(kv.get_num(2).unwrap(), 1);
        assert_eq!(kv.get_num(1).unwrap(), 2);
    }

    #[test]
    fn test_read_at_base_tid_after_purge() {
        let mut kv = KvVersions::default();
        kv.set(1, "k", Bytes::from_static(b"v1"), None).unwrap();
        kv.set(2, "k", Bytes::from_static(b"v2"), None).unwrap();
        let restored = kv.flatten(2).unwrap();
        kv.purge(2);
        assert!(kv.get_value(2, "k", None).is_err());

        // Reinstall the fetched state at the purged TID and read right there.
        let mut view = KvView::new();
        for (k, v, cs) in restored {
            view.insert(k, (v, cs));
        }
        kv.install_base(2, view);
        match kv.get_value(2, "k", None).unwrap() {
            KvGetOutcome::Value { data, .. } => assert_eq!(data.as_ref(), b"v2"),
            other => panic!("unexpected outcome: {:?}", other),
        }

        // Later deltas still fold on top of the base.
        kv.set(3, "k", Bytes::from_static(b"v3"), None).unwrap();
        match kv.get_value(3, "k", None).unwrap() {
            KvGetOutcome::Value { data, .. } => assert_eq!(data.as_ref(), b"v3"),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn test_value_size_limit() {
        let mut kv = KvVersions::default();
        let oversized = Bytes::from(vec![0u8; KV_VALUE_MAXLEN + 1]);
        assert!(kv.set(1, "k", oversized, None).is_err());
    }
}
