pub mod container;
pub mod object;

pub use container::{Container, ObjectEntry, PurgeDisposition};
pub use object::{ArrayStruct, Object, SnapshotPayload};
