//! Capturing snapshots of a live VM.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

use super::snapshot::{SnapshotArtifact, SnapshotKind, SnapshotStore};
use crate::artifacts::Artifact;
use crate::error::{Error, Result};
use crate::firecracker::vm::SNAPSHOT_DIR_NAME;
use crate::firecracker::VmHandle;
use crate::utils::link_or_copy;

pub const MEM_FILE_NAME: &str = "vm.mem";
pub const VMSTATE_FILE_NAME: &str = "vm.vmstate";

/// Takes snapshots of one VM and catalogues them.
///
/// Creating a snapshot disables the VM's API budget for good: snapshot calls
/// can legitimately run far longer than a configuration call.
pub struct SnapshotSession<'a> {
    vm: &'a mut VmHandle,
    store: SnapshotStore,
}

impl<'a> SnapshotSession<'a> {
    pub fn new(vm: &'a mut VmHandle) -> Self {
        let store = SnapshotStore::new(vm.harness_config().snapshots_dir());
        Self { vm, store }
    }

    pub fn store(&self) -> &SnapshotStore {
        &self.store
    }

    pub fn vm(&self) -> &VmHandle {
        self.vm
    }

    pub async fn create(
        &mut self,
        disks: &[PathBuf],
        ssh_key: &Artifact,
        kind: SnapshotKind,
    ) -> Result<SnapshotArtifact> {
        self.create_with_version(disks, ssh_key, kind, None).await
    }

    /// Pause the VM (if running), capture memory and device state, and move
    /// the files into the snapshot store. `disks` are recorded as given, in
    /// attach order.
    pub async fn create_with_version(
        &mut self,
        disks: &[PathBuf],
        ssh_key: &Artifact,
        kind: SnapshotKind,
        version: Option<&str>,
    ) -> Result<SnapshotArtifact> {
        if disks.is_empty() {
            return Err(Error::precondition(
                "a snapshot needs at least the root disk",
            ));
        }
        self.vm.untime_api();

        let snap_dir = self.vm.jail().create_dir(SNAPSHOT_DIR_NAME)?;
        // Files from an earlier capture may be hard links into the store;
        // the VMM must write fresh inodes.
        for name in [MEM_FILE_NAME, VMSTATE_FILE_NAME] {
            remove_if_present(&snap_dir.join(name))?;
        }

        let mem_visible = self
            .vm
            .jail()
            .visible_path(&format!("{}/{}", SNAPSHOT_DIR_NAME, MEM_FILE_NAME));
        let state_visible = self
            .vm
            .jail()
            .visible_path(&format!("{}/{}", SNAPSHOT_DIR_NAME, VMSTATE_FILE_NAME));
        self.vm
            .pause_to_snapshot(&mem_visible, &state_visible, kind.into(), version)
            .await?;

        let id = format!("snap-{}", uuid::Uuid::new_v4().simple());
        let store_dir = self.store.snapshot_dir(&id);
        tokio::fs::create_dir_all(&store_dir)
            .await
            .map_err(|e| Error::io_context(&store_dir, e))?;
        let mem = link_into(&snap_dir.join(MEM_FILE_NAME), &store_dir).await?;
        let vmstate = link_into(&snap_dir.join(VMSTATE_FILE_NAME), &store_dir).await?;
        let key = ssh_key.copy_into(&store_dir).await?;

        let snapshot = SnapshotArtifact::new(
            id,
            self.vm.id(),
            kind,
            mem,
            vmstate,
            disks.to_vec(),
            Some(key),
            self.vm.net_ifaces().to_vec(),
            version.map(String::from),
        );
        self.store.save(&snapshot).await?;
        info!(
            target: "snapshot",
            vm_id = %self.vm.id(),
            snapshot = %snapshot.id,
            %kind,
            "snapshot captured"
        );
        Ok(snapshot)
    }

    /// Chain `diff` onto `base` and persist the link in the store.
    pub async fn rebase(
        &self,
        diff: &mut SnapshotArtifact,
        base: Arc<SnapshotArtifact>,
    ) -> Result<()> {
        diff.rebase(base)?;
        self.store.save(diff).await
    }
}

fn remove_if_present(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => {
            debug!(path = %path.display(), "removed previous snapshot file");
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::io_context(path, e)),
    }
}

/// Hard-link (or copy across filesystems) `src` into `dir` under its own name.
async fn link_into(src: &Path, dir: &Path) -> Result<PathBuf> {
    if !src.exists() {
        return Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("VMM did not write {}", src.display()),
        )));
    }
    let name = src
        .file_name()
        .ok_or_else(|| Error::precondition(format!("no file name in {}", src.display())))?;
    let dest = dir.join(name);
    let (from, to) = (src.to_path_buf(), dest.clone());
    tokio::task::spawn_blocking(move || link_or_copy(&from, &to))
        .await
        .map_err(|e| Error::Setup(anyhow::anyhow!("link task failed: {}", e)))?
        .map_err(|e| Error::io_context(src, e))?;
    Ok(dest)
}
