pub mod artifacts;
pub mod host;
pub mod snapshots;

pub use artifacts::cmd_artifacts;
pub use host::cmd_host;
pub use snapshots::cmd_snapshots;
