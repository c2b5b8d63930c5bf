use crate::error::{Result, TideError};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use ulid::Ulid;

/// Transaction identifier. Monotonically increasing per container.
pub type TransId = u64;

/// Sentinel asking the transaction manager to auto-select a TID.
pub const TID_UNKNOWN: TransId = TransId::MAX;

pub const OBJ_NAME_MAXLEN: usize = 256;
pub const KV_KEY_MAXLEN: usize = 256;
pub const KV_VALUE_MAXLEN: usize = 64 * 1024;
pub const SCRATCH_LEN: usize = 32;
pub const MAX_DIMS: usize = 32;
pub const HINT_KEY_MAXLEN: usize = 128;
pub const HINT_VALUE_MAXLEN: usize = 128;

/// 128-bit object identifier, two 64-bit words.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectId {
    pub hi: u64,
    pub lo: u64,
}

impl ObjectId {
    pub fn mint() -> Self {
        let raw = Ulid::new().0;
        Self {
            hi: (raw >> 64) as u64,
            lo: raw as u64,
        }
    }

    pub fn as_u128(&self) -> u128 {
        ((self.hi as u128) << 64) | self.lo as u128
    }
}

impl std::fmt::Display for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}{:016x}", self.hi, self.lo)
    }
}

/// 128-bit payload checksum, two 64-bit words. Computed over the entire
/// transferred payload of a call, never per fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checksum {
    pub hi: u64,
    pub lo: u64,
}

impl Checksum {
    /// Checksum over a sequence of payload fragments in transfer order.
    /// The empty payload yields a valid checksum.
    pub fn of<'a, I>(fragments: I) -> Self
    where
        I: IntoIterator<Item = &'a [u8]>,
    {
        let mut hasher = Sha256::new();
        for frag in fragments {
            hasher.update(frag);
        }
        let digest = hasher.finalize();
        let hi = u64::from_be_bytes(digest[0..8].try_into().unwrap());
        let lo = u64::from_be_bytes(digest[8..16].try_into().unwrap());
        Self { hi, lo }
    }

    pub fn of_bytes(payload: &[u8]) -> Self {
        Self::of([payload])
    }

    pub fn verify<'a, I>(&self, fragments: I) -> Result<()>
    where
        I: IntoIterator<Item = &'a [u8]>,
    {
        let actual = Self::of(fragments);
        if actual != *self {
            return Err(TideError::ChecksumMismatch {
                expected: self.to_string(),
                actual: actual.to_string(),
            });
        }
        Ok(())
    }
}

impl std::fmt::Display for Checksum {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}{:016x}", self.hi, self.lo)
    }
}

/// Container open mode. Create-if-absent is carried separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContainerMode {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

impl ContainerMode {
    pub fn readable(&self) -> bool {
        matches!(self, ContainerMode::ReadOnly | ContainerMode::ReadWrite)
    }

    pub fn writable(&self) -> bool {
        matches!(self, ContainerMode::WriteOnly | ContainerMode::ReadWrite)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObjectKind {
    Array,
    Blob,
    Kv,
}

/// Object type filter for container listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectFilter {
    Any,
    Only(ObjectKind),
}

impl ObjectFilter {
    pub fn matches(&self, kind: ObjectKind) -> bool {
        match self {
            ObjectFilter::Any => true,
            ObjectFilter::Only(k) => *k == kind,
        }
    }
}

/// Ordered hint list. Unrecognized keys are ignored, never an error;
/// over-long keys or values are rejected at construction.
#[derive(Debug, Clone, Default)]
pub struct HintList {
    hints: Vec<(String, String)>,
}

pub const HINT_LOWEST_READABLE: &str = "lowest_readable";
pub const HINT_ADJACENT_READABLE: &str = "adjacent_readable";

impl HintList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(mut self, key: &str, value: &str) -> Result<Self> {
        if key.len() > HINT_KEY_MAXLEN || !key.is_ascii() {
            return Err(TideError::InvalidArgument(format!(
                "hint key too long or non-ascii: {}",
                key.len()
            )));
        }
        if value.len() > HINT_VALUE_MAXLEN || !value.is_ascii() {
            return Err(TideError::InvalidArgument(format!(
                "hint value too long or non-ascii: {}",
                value.len()
            )));
        }
        self.hints.push((key.to_string(), value.to_string()));
        Ok(self)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.hints
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn is_true(&self, key: &str) -> bool {
        self.get(key) == Some("true")
    }
}

/// Validated permutation over `0..num_dims` mapping logical dimensions to
/// their physical ordering. Default is the identity (logical order).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DimSeq(Vec<u32>);

impl DimSeq {
    pub fn identity(num_dims: usize) -> Self {
        Self((0..num_dims as u32).collect())
    }

    pub fn new(seq: Vec<u32>) -> Result<Self> {
        let n = seq.len();
        if n > MAX_DIMS {
            return Err(TideError::InvalidArgument(format!(
                "dimension sequence has {} entries, max {}",
                n, MAX_DIMS
            )));
        }
        let mut seen = vec![false; n];
        for &d in &seq {
            let idx = d as usize;
            if idx >= n || seen[idx] {
                return Err(TideError::InvalidArgument(format!(
                    "dimension sequence is not a permutation of 0..{}",
                    n
                )));
            }
            seen[idx] = true;
        }
        Ok(Self(seq))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn is_identity(&self) -> bool {
        self.0.iter().enumerate().all(|(i, &d)| i as u32 == d)
    }

    /// Physical position of logical dimension `logical`.
    pub fn physical_of(&self, logical: usize) -> usize {
        self.0.iter().position(|&d| d as usize == logical).unwrap_or(logical)
    }

    pub fn as_slice(&self) -> &[u32] {
        &self.0
    }
}

/// Tier an object's data is placed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Location {
    BurstBuffer,
    Central,
}

/// Placement descriptor attached to an object at a TID. Attaching one never
/// moves data; movement happens during persist/fetch/replica.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Layout {
    pub loc: Location,
    /// Number of storage targets shards are round-robined over.
    pub target_num: u32,
    /// Resharding granularity: cells for contiguous arrays, chunks for
    /// chunked arrays, bytes for blobs. Ignored for KV objects.
    pub stripe_size: u64,
    /// Dimension sequence override; `None` keeps the previous one.
    pub dims_seq: Option<DimSeq>,
}

impl Layout {
    pub fn default_bb() -> Self {
        Self {
            loc: Location::BurstBuffer,
            target_num: 1,
            stripe_size: 0,
            dims_seq: None,
        }
    }
}

/// One memory fragment of a gather list.
pub type MemFrag = Bytes;

/// Gather list of payload fragments, the source of a write. Reads return the
/// composed payload as a single `Bytes`; callers scatter it with zero-copy
/// slicing.
#[derive(Debug, Clone, Default)]
pub struct MemDesc {
    pub frags: Vec<MemFrag>,
}

impl MemDesc {
    pub fn single(data: Bytes) -> Self {
        Self { frags: vec![data] }
    }

    pub fn total_len(&self) -> u64 {
        self.frags.iter().map(|f| f.len() as u64).sum()
    }

    pub fn checksum(&self) -> Checksum {
        Checksum::of(self.frags.iter().map(|f| f.as_ref()))
    }

    /// Flatten the gather list into one contiguous payload.
    pub fn gather(&self) -> Bytes {
        if self.frags.len() == 1 {
            return self.frags[0].clone();
        }
        let mut out = Vec::with_capacity(self.total_len() as usize);
        for frag in &self.frags {
            out.extend_from_slice(frag);
        }
        Bytes::from(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_empty_payload_is_valid() {
        let cs = Checksum::of_bytes(b"");
        assert_eq!(cs, Checksum::of(std::iter::empty::<&[u8]>()));
        cs.verify([b"".as_ref()]).unwrap();
    }

    #[test]
    fn test_checksum_fragments_equal_whole() {
        let whole = Checksum::of_bytes(b"hello world");
        let split = Checksum::of([b"hello ".as_ref(), b"world".as_ref()]);
        assert_eq!(whole, split);
        assert!(whole.verify([b"hello world!".as_ref()]).is_err());
    }

    #[test]
    fn test_dim_seq_validation() {
        assert!(DimSeq::new(vec![2, 0, 1]).is_ok());
        assert!(DimSeq::new(vec![0, 0, 1]).is_err());
        assert!(DimSeq::new(vec![0, 3]).is_err());
        assert!(DimSeq::identity(4).is_identity());
        assert!(!DimSeq::new(vec![1, 0]).unwrap().is_identity());
    }

    #[test]
    fn test_hint_list_limits() {
        let hints = HintList::new()
            .push(HINT_LOWEST_READABLE, "true")
            .unwrap()
            .push("some_unknown_hint", "whatever")
            .unwrap();
        assert!(hints.is_true(HINT_LOWEST_READABLE));
        assert!(!hints.is_true(HINT_ADJACENT_READABLE));

        let long_key = "k".repeat(HINT_KEY_MAXLEN + 1);
        assert!(HintList::new().push(&long_key, "v").is_err());
    }

    #[test]
    fn test_mem_desc_gather() {
        let desc = MemDesc {
            frags: vec![Bytes::from_static(b"ab"), Bytes::from_static(b"cd")],
        };
        assert_eq!(desc.total_len(), 4);
        assert_eq!(desc.gather(), Bytes::from_static(b"abcd"));
        assert_eq!(desc.checksum(), Checksum::of_bytes(b"abcd"));
    }

    #[test]
    fn test_object_id_distinct() {
        let a = ObjectId::mint();
        let b = ObjectId::mint();
        assert_ne!(a.as_u128(), b.as_u128());
    }
}
