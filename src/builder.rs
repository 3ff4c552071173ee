//! Building microVMs, fresh from artifacts or restored from a snapshot.

use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use crate::artifacts::Artifact;
use crate::config::HarnessConfig;
use crate::error::{Error, Result};
use crate::firecracker::api::{MemBackend, MemBackendType, SnapshotLoad};
use crate::firecracker::{MachineSpec, VmConfig, VmHandle};
use crate::metrics::MetricsReader;
use crate::network::NetIfaceConfig;
use crate::ssh::SshConfig;
use crate::storage::session::MEM_FILE_NAME;
use crate::storage::SnapshotArtifact;

/// VMM log level used when the caller does not pick one.
pub const DEFAULT_LOG_LEVEL: &str = "Info";

/// Everything needed to configure a fresh microVM.
#[derive(Debug, Clone)]
pub struct BuildParams {
    pub kernel: PathBuf,
    pub rootfs: PathBuf,
    pub machine: MachineSpec,
    /// Required for diff snapshots of this VM later on
    pub track_dirty_pages: bool,
    pub net: Option<NetIfaceConfig>,
    pub ssh_key: Option<PathBuf>,
    pub boot_args: Option<String>,
    pub log_level: Option<String>,
}

impl BuildParams {
    pub fn new(kernel: impl Into<PathBuf>, rootfs: impl Into<PathBuf>, machine: MachineSpec) -> Self {
        Self {
            kernel: kernel.into(),
            rootfs: rootfs.into(),
            machine,
            track_dirty_pages: false,
            net: None,
            ssh_key: None,
            boot_args: None,
            log_level: None,
        }
    }
}

/// How a snapshot is brought back.
#[derive(Debug, Clone, Default)]
pub struct RestoreOptions {
    /// Recreate the host tap the snapshotted guest was using
    pub net: Option<NetIfaceConfig>,
    /// Resume right after load; otherwise the VM stays paused
    pub resume: bool,
    pub enable_diff_snapshots: bool,
    pub log_level: Option<String>,
}

pub struct MicrovmBuilder {
    config: Arc<HarnessConfig>,
}

impl MicrovmBuilder {
    pub fn new(config: Arc<HarnessConfig>) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &Arc<HarnessConfig> {
        &self.config
    }

    /// Spawn and configure a VM, ready for `start()`.
    pub async fn build(&self, params: BuildParams) -> Result<(VmHandle, MetricsReader)> {
        let mut vm = VmHandle::new(self.config.clone())?;
        vm.spawn(Some(params.log_level.as_deref().unwrap_or(DEFAULT_LOG_LEVEL)))
            .await?;
        let metrics = vm.attach_metrics().await?;

        let mut vm_config = VmConfig::new(
            &params.kernel,
            params.machine.to_machine_config(params.track_dirty_pages),
        )
        .with_rootfs(&params.rootfs);
        if let Some(boot_args) = &params.boot_args {
            vm_config = vm_config.with_boot_args(boot_args);
        }
        vm.configure(&vm_config).await?;

        if let Some(iface) = &params.net {
            vm.add_net_iface(iface).await?;
            if let Some(key) = &params.ssh_key {
                vm.set_ssh_config(self.ssh_config(iface, key.clone()));
            }
        }
        Ok((vm, metrics))
    }

    /// Build from matrix artifacts. The disk and its key are copied first so
    /// the guest can write to them without touching the cached originals.
    pub async fn build_from_artifacts(
        &self,
        kernel: &Artifact,
        disk: &Artifact,
        microvm: &Artifact,
        net: Option<NetIfaceConfig>,
        track_dirty_pages: bool,
    ) -> Result<(VmHandle, MetricsReader)> {
        let copies = self.config.copies_dir();
        let kernel_path = kernel.download().await?;
        let rootfs = disk.copy(&copies).await?;
        let ssh_key = match disk.ssh_key() {
            Some(key) => Some(key.copy(&copies).await?),
            None => None,
        };
        let mut params = BuildParams::new(kernel_path, rootfs, microvm.machine_spec().await?);
        params.track_dirty_pages = track_dirty_pages;
        params.net = net;
        params.ssh_key = ssh_key;
        self.build(params).await
    }

    /// Bring a snapshot back in a fresh VM.
    ///
    /// Every file the snapshot references is placed into the new VM's jail
    /// before `snapshot/load` is issued; a missing disk fails the restore
    /// without ever calling the control plane. The VM is left paused unless
    /// `resume` is set.
    pub async fn build_from_snapshot(
        &self,
        snapshot: &SnapshotArtifact,
        options: RestoreOptions,
    ) -> Result<(VmHandle, MetricsReader)> {
        snapshot.validate_chain()?;

        let mut vm = VmHandle::new(self.config.clone())?;
        vm.spawn(Some(options.log_level.as_deref().unwrap_or(DEFAULT_LOG_LEVEL)))
            .await?;
        let metrics = vm.attach_metrics().await?;

        let mem_path = if snapshot.is_chained() {
            let dest = vm.host_root().join(MEM_FILE_NAME);
            snapshot.materialize_memory(&dest).await?;
            vm.jail().hand_over(&dest)?;
            vm.jail().visible_path(MEM_FILE_NAME)
        } else {
            vm.create_jailed_resource(&snapshot.mem)?
        };
        let state_path = vm.create_jailed_resource(&snapshot.vmstate)?;

        let mut placed = Vec::with_capacity(snapshot.disks.len());
        for disk in snapshot.disks.iter().filter(|d| d.exists()) {
            placed.push(vm.create_jailed_resource(disk)?);
        }
        if placed.len() != snapshot.disks.len() {
            return Err(Error::precondition(format!(
                "snapshot {} lists {} disks but only {} could be placed",
                snapshot.id,
                snapshot.disks.len(),
                placed.len()
            )));
        }

        if let Some(iface) = &options.net {
            vm.restore_net_iface(iface).await?;
            if let Some(key) = &snapshot.ssh_key {
                vm.set_ssh_config(self.ssh_config(iface, key.clone()));
            }
        }

        let request = SnapshotLoad {
            snapshot_path: state_path,
            mem_backend: MemBackend {
                backend_path: mem_path,
                backend_type: MemBackendType::File,
            },
            enable_diff_snapshots: Some(options.enable_diff_snapshots),
            resume_vm: Some(false),
        };
        vm.untime_api();
        vm.load_snapshot(&request).await?;
        vm.set_api_timeout(self.config.api_timeout());

        if options.resume {
            vm.resume().await?;
        }
        info!(
            target: "vm",
            vm_id = %vm.id(),
            snapshot = %snapshot.id,
            layers = snapshot.chain().len(),
            resumed = options.resume,
            "restored from snapshot"
        );
        Ok((vm, metrics))
    }

    fn ssh_config(&self, iface: &NetIfaceConfig, key: PathBuf) -> SshConfig {
        let mut ssh = SshConfig::root(&iface.guest_ip, key);
        ssh.netns = self.config.jailer.as_ref().and_then(|j| j.netns.clone());
        ssh
    }
}
