//! Pre-boot configuration of a microVM.
//!
//! [`VmConfig`] holds everything `VmHandle::configure` sends before
//! `InstanceStart`: machine shape, boot source and the root drive. Paths are
//! host paths; the handle places them into the VM's jail when applying.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

use super::api::MachineConfig;

/// Kernel command line for harness guests.
pub const DEFAULT_BOOT_ARGS: &str = "console=ttyS0 reboot=k panic=1 pci=off";

pub const ROOT_DRIVE_ID: &str = "rootfs";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmConfig {
    pub machine: MachineConfig,
    pub kernel: PathBuf,
    #[serde(default)]
    pub initrd: Option<PathBuf>,
    pub boot_args: String,
    /// Root block device; `None` boots without one (initrd guests)
    #[serde(default)]
    pub rootfs: Option<PathBuf>,
    #[serde(default)]
    pub rootfs_read_only: bool,
}

impl VmConfig {
    pub fn new(kernel: impl Into<PathBuf>, machine: MachineConfig) -> Self {
        Self {
            machine,
            kernel: kernel.into(),
            initrd: None,
            boot_args: DEFAULT_BOOT_ARGS.to_string(),
            rootfs: None,
            rootfs_read_only: false,
        }
    }

    pub fn with_rootfs(mut self, rootfs: impl Into<PathBuf>) -> Self {
        self.rootfs = Some(rootfs.into());
        self
    }

    pub fn with_boot_args(mut self, boot_args: impl Into<String>) -> Self {
        self.boot_args = boot_args.into();
        self
    }

    /// Short content key of this configuration, for logs and catalog records.
    pub fn config_key(&self) -> Result<String> {
        let json = serde_json::to_string(self).context("serializing VM config")?;
        let digest = Sha256::digest(json.as_bytes());
        Ok(format!("{:x}", digest)[..12].to_string())
    }
}

/// Machine shape as stored in a microVM config artifact.
///
/// Older artifacts spell SMT as `ht_enabled`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MachineSpec {
    pub vcpu_count: u8,
    pub mem_size_mib: u32,
    #[serde(default, alias = "ht_enabled")]
    pub smt: bool,
    #[serde(default)]
    pub cpu_template: Option<String>,
}

impl MachineSpec {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading microvm config {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("parsing microvm config {}", path.display()))
    }

    /// Machine config for the control plane. Dirty-page tracking is needed
    /// whenever the VM will produce diff snapshots.
    pub fn to_machine_config(&self, track_dirty_pages: bool) -> MachineConfig {
        MachineConfig {
            vcpu_count: self.vcpu_count,
            mem_size_mib: self.mem_size_mib,
            smt: Some(self.smt),
            cpu_template: self.cpu_template.clone(),
            track_dirty_pages: Some(track_dirty_pages),
        }
    }
}
