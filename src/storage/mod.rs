pub mod memory;
pub mod session;
pub mod snapshot;

pub use memory::{merge_layer, MERGE_BLOCK_SIZE};
pub use session::SnapshotSession;
pub use snapshot::{SnapshotArtifact, SnapshotConfig, SnapshotKind, SnapshotStore};
