//! Harness error taxonomy.
//!
//! Control-plane rejections that a test wants to *probe* are not errors: the
//! raw client returns them as [`ApiResponse`](crate::firecracker::api::ApiResponse).
//! Everything here is a failure the caller did not ask for.

use std::path::PathBuf;
use std::time::Duration;

use crate::state::VmLifecycle;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The control socket could not be reached or the connection dropped.
    #[error("control socket {socket}: {source}")]
    Connection {
        socket: PathBuf,
        #[source]
        source: hyper::Error,
    },

    /// A call exceeded its duration budget.
    #[error("{method} {path} timed out after {budget:?}")]
    Timeout {
        method: String,
        path: String,
        budget: Duration,
    },

    /// The VMM process failed to start or never exposed its control socket.
    #[error("failed to spawn VMM: {0}")]
    Spawn(String),

    /// The VMM process survived termination.
    #[error("failed to kill VMM pid {pid}: {reason}")]
    Kill { pid: u32, reason: String },

    /// A pre-boot configuration call was rejected.
    #[error("configuring {resource} failed: {status} {message}")]
    Config {
        resource: String,
        status: u16,
        message: String,
    },

    /// Any other control-plane call that answered with a non-success status.
    #[error("{method} {path} rejected: {status} {message}")]
    Api {
        method: String,
        path: String,
        status: u16,
        message: String,
    },

    /// Snapshot load failed, or restore inputs were inconsistent.
    #[error("restore failed: {0}")]
    Restore(String),

    /// The target snapshot version is malformed or cannot be translated.
    #[error("snapshot version rejected: {0}")]
    VersionIncompatible(String),

    /// A lifecycle operation was called from the wrong state.
    #[error("vm {vm_id}: cannot {op} while {actual} (expected {expected})")]
    InvalidState {
        vm_id: String,
        op: &'static str,
        expected: String,
        actual: VmLifecycle,
    },

    /// A harness precondition was violated by the caller.
    #[error("precondition failed: {0}")]
    Precondition(String),

    #[error("artifact {name}: {reason}")]
    Artifact { name: String, reason: String },

    /// Host-side setup (files, taps, jail preparation) that failed with context.
    #[error(transparent)]
    Setup(#[from] anyhow::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub fn precondition(msg: impl Into<String>) -> Self {
        Error::Precondition(msg.into())
    }

    pub fn io_context(path: impl AsRef<std::path::Path>, err: std::io::Error) -> Self {
        Error::Io(std::io::Error::new(
            err.kind(),
            format!("{}: {}", path.as_ref().display(), err),
        ))
    }

    /// True for failures that mean the control plane never answered.
    pub fn is_transport(&self) -> bool {
        matches!(self, Error::Connection { .. } | Error::Timeout { .. })
    }
}
