use serde::{Deserialize, Serialize};

/// Lifecycle of a single microVM handle.
///
/// ```text
/// NotStarted -> Spawned -> Configured -> Running <-> Paused
///                   \______ load snapshot ______/
/// any -> Killed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VmLifecycle {
    NotStarted,
    Spawned,
    Configured,
    Running,
    Paused,
    Killed,
}

impl VmLifecycle {
    /// A VMM process may exist in these states.
    pub fn has_process(self) -> bool {
        !matches!(self, VmLifecycle::NotStarted | VmLifecycle::Killed)
    }

    /// Pre-boot resources (drives, interfaces, MMDS config) can still be attached.
    pub fn is_pre_boot(self) -> bool {
        matches!(self, VmLifecycle::Spawned | VmLifecycle::Configured)
    }
}

impl std::fmt::Display for VmLifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            VmLifecycle::NotStarted => "not started",
            VmLifecycle::Spawned => "spawned",
            VmLifecycle::Configured => "configured",
            VmLifecycle::Running => "running",
            VmLifecycle::Paused => "paused",
            VmLifecycle::Killed => "killed",
        };
        f.write_str(s)
    }
}
