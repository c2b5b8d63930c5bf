//! tideio-core: an I/O dispatcher between compute ranks and a two-tier
//! storage hierarchy. Writes land on the burst buffer under numbered
//! transactions; readable transaction prefixes migrate to a durable central
//! tier and can be purged, fetched back, or replicated under new layouts.

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod event;
pub mod handle;
pub mod io;
pub mod kv;
pub mod migrate;
pub mod store;
pub mod txn;
pub mod types;

pub use config::DispatcherConfig;
pub use dispatcher::Dispatcher;
pub use error::{Result, TideError};
pub use event::{EventId, EventKind, EventQuery, EventQueue, EventState, PolledEvent, WaitMode};
pub use handle::{Cookie, HandleTable, Resource};
pub use io::{BlobFrag, BlobIoDesc, Extent, Hyperslab, VersionStore};
pub use kv::{KvGetOutcome, KvVersions};
pub use migrate::{CentralBackend, FsCentralStore, MigrationEngine, NamedSnapshot};
pub use store::{ArrayStruct, Container, Object, ObjectEntry, SnapshotPayload};
pub use txn::group::{LocalGroup, ParticipantGroup};
pub use txn::{
    AbortFlag, ContainerTids, FinishOutcome, TransMode, TransStatus, TransactionManager,
};
pub use types::{
    Checksum, ContainerMode, DimSeq, HintList, Layout, Location, MemDesc, ObjectFilter, ObjectId,
    ObjectKind, TransId, HINT_ADJACENT_READABLE, HINT_LOWEST_READABLE, KV_KEY_MAXLEN,
    KV_VALUE_MAXLEN, MAX_DIMS, OBJ_NAME_MAXLEN, SCRATCH_LEN, TID_UNKNOWN,
};
