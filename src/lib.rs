//! Integration-test harness for Firecracker microVMs.
//!
//! Spawns VMMs (optionally under the jailer), drives their control socket
//! with a timed client, captures and restores snapshots, runs test closures
//! over artifact matrices and forwards VMM metrics in the background.

pub mod artifacts;
pub mod builder;
pub mod cli;
pub mod commands;
pub mod config;
pub mod error;
pub mod firecracker;
pub mod logging;
pub mod matrix;
pub mod metrics;
pub mod mmds;
pub mod monitor;
pub mod network;
pub mod ssh;
pub mod state;
pub mod storage;
pub mod utils;

pub use builder::{BuildParams, MicrovmBuilder, RestoreOptions};
pub use config::HarnessConfig;
pub use error::{Error, Result};
pub use firecracker::{ApiResponse, FirecrackerClient, VmHandle};
pub use matrix::{MatrixCell, TestMatrix};
pub use monitor::FcMetricsMonitor;
pub use state::VmLifecycle;
pub use storage::{SnapshotArtifact, SnapshotKind, SnapshotSession};
