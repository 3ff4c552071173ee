use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::fs;
use tracing::{debug, info};

use super::memory::{merge_layer, MERGE_BLOCK_SIZE};
use crate::error::{Error, Result};
use crate::firecracker::api::SnapshotKindParam;
use crate::network::NetIfaceConfig;

const CONFIG_FILE: &str = "config.json";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotKind {
    /// Self-contained memory + device state
    Full,
    /// Only the pages dirtied since the previous capture
    Diff,
}

impl std::fmt::Display for SnapshotKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SnapshotKind::Full => write!(f, "full"),
            SnapshotKind::Diff => write!(f, "diff"),
        }
    }
}

impl From<SnapshotKind> for SnapshotKindParam {
    fn from(kind: SnapshotKind) -> Self {
        match kind {
            SnapshotKind::Full => SnapshotKindParam::Full,
            SnapshotKind::Diff => SnapshotKindParam::Diff,
        }
    }
}

static LAST_SEQ: AtomicU64 = AtomicU64::new(0);

/// Strictly increasing capture stamp. Wall-clock nanoseconds, bumped past
/// the previous stamp so two captures in the same tick still order.
pub fn next_capture_seq() -> u64 {
    let now = Utc::now().timestamp_nanos_opt().unwrap_or(0).max(0) as u64;
    let mut prev = LAST_SEQ.load(Ordering::Relaxed);
    loop {
        let next = now.max(prev + 1);
        match LAST_SEQ.compare_exchange_weak(prev, next, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => return next,
            Err(actual) => prev = actual,
        }
    }
}

/// Files produced by one capture, plus what a restore needs to bring the
/// guest back: its disks, the key that logs into it and its interfaces.
///
/// A diff snapshot may point at the snapshot it was taken on top of. Its
/// memory file only holds the pages dirtied since that capture, so restoring
/// it replays the whole chain, oldest first.
#[derive(Debug, Clone)]
pub struct SnapshotArtifact {
    pub id: String,
    pub vm_id: String,
    pub kind: SnapshotKind,
    pub mem: PathBuf,
    pub vmstate: PathBuf,
    /// Disk images in attach order; restore places them in this order
    pub disks: Vec<PathBuf>,
    pub ssh_key: Option<PathBuf>,
    pub net_ifaces: Vec<NetIfaceConfig>,
    /// Snapshot data version requested at capture, if any
    pub version: Option<String>,
    pub created_at: DateTime<Utc>,
    seq: u64,
    base: Option<Arc<SnapshotArtifact>>,
}

impl SnapshotArtifact {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: impl Into<String>,
        vm_id: impl Into<String>,
        kind: SnapshotKind,
        mem: PathBuf,
        vmstate: PathBuf,
        disks: Vec<PathBuf>,
        ssh_key: Option<PathBuf>,
        net_ifaces: Vec<NetIfaceConfig>,
        version: Option<String>,
    ) -> Self {
        Self {
            id: id.into(),
            vm_id: vm_id.into(),
            kind,
            mem,
            vmstate,
            disks,
            ssh_key,
            net_ifaces,
            version,
            created_at: Utc::now(),
            seq: next_capture_seq(),
            base: None,
        }
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn base(&self) -> Option<&Arc<SnapshotArtifact>> {
        self.base.as_ref()
    }

    /// Record that this diff was captured on top of `base`.
    ///
    /// Only diffs have a base, and the base must have been captured first.
    pub fn rebase(&mut self, base: Arc<SnapshotArtifact>) -> Result<()> {
        if self.kind != SnapshotKind::Diff {
            return Err(Error::precondition(format!(
                "snapshot {} is {}, only diff snapshots have a base",
                self.id, self.kind
            )));
        }
        if base.seq >= self.seq {
            return Err(Error::precondition(format!(
                "base {} was not captured before {}",
                base.id, self.id
            )));
        }
        self.base = Some(base);
        Ok(())
    }

    /// Snapshots to replay, chain root first, ending with `self`.
    pub fn chain(&self) -> Vec<&SnapshotArtifact> {
        let mut chain = vec![self];
        let mut cur = self;
        while let Some(base) = cur.base.as_deref() {
            chain.push(base);
            cur = base;
        }
        chain.reverse();
        chain
    }

    /// Whether restoring needs more than this snapshot's own memory file.
    pub fn is_chained(&self) -> bool {
        self.base.is_some()
    }

    /// Check that every file the chain needs is present and that the capture
    /// order is consistent.
    pub fn validate_chain(&self) -> Result<()> {
        let chain = self.chain();
        for pair in chain.windows(2) {
            if pair[1].kind != SnapshotKind::Diff {
                return Err(Error::Restore(format!(
                    "snapshot {} has a base but is not a diff",
                    pair[1].id
                )));
            }
            if pair[0].seq >= pair[1].seq {
                return Err(Error::Restore(format!(
                    "snapshot chain out of order at {}",
                    pair[1].id
                )));
            }
        }
        for snap in &chain {
            if !snap.mem.exists() {
                return Err(Error::Restore(format!(
                    "memory file {} of snapshot {} is missing",
                    snap.mem.display(),
                    snap.id
                )));
            }
        }
        if !self.vmstate.exists() {
            return Err(Error::Restore(format!(
                "state file {} of snapshot {} is missing",
                self.vmstate.display(),
                self.id
            )));
        }
        Ok(())
    }

    /// Write the self-contained memory image for this snapshot to `dest`:
    /// the chain root's image with every later layer merged on top.
    pub async fn materialize_memory(&self, dest: &Path) -> Result<()> {
        let chain = self.chain();
        let root = chain[0];
        fs::copy(&root.mem, dest)
            .await
            .map_err(|e| Error::io_context(&root.mem, e))?;
        for layer in &chain[1..] {
            let base = dest.to_path_buf();
            let layer_path = layer.mem.clone();
            let written = tokio::task::spawn_blocking(move || {
                merge_layer(&base, &layer_path, MERGE_BLOCK_SIZE)
            })
            .await
            .map_err(|e| Error::Restore(format!("merge task failed: {}", e)))?
            .map_err(|e| Error::io_context(&layer.mem, e))?;
            debug!(snapshot = %layer.id, bytes = written, "merged diff layer");
        }
        Ok(())
    }

    fn to_config(&self) -> SnapshotConfig {
        SnapshotConfig {
            id: self.id.clone(),
            vm_id: self.vm_id.clone(),
            kind: self.kind,
            memory_path: self.mem.clone(),
            vmstate_path: self.vmstate.clone(),
            disks: self.disks.clone(),
            ssh_key: self.ssh_key.clone(),
            net_ifaces: self.net_ifaces.clone(),
            version: self.version.clone(),
            base_id: self.base.as_ref().map(|b| b.id.clone()),
            seq: self.seq,
            created_at: self.created_at,
        }
    }
}

/// On-disk record of one catalogued snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotConfig {
    pub id: String,
    pub vm_id: String,
    pub kind: SnapshotKind,
    pub memory_path: PathBuf,
    pub vmstate_path: PathBuf,
    pub disks: Vec<PathBuf>,
    #[serde(default)]
    pub ssh_key: Option<PathBuf>,
    #[serde(default)]
    pub net_ifaces: Vec<NetIfaceConfig>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub base_id: Option<String>,
    pub seq: u64,
    pub created_at: DateTime<Utc>,
}

impl SnapshotConfig {
    fn into_artifact(self, base: Option<Arc<SnapshotArtifact>>) -> SnapshotArtifact {
        SnapshotArtifact {
            id: self.id,
            vm_id: self.vm_id,
            kind: self.kind,
            mem: self.memory_path,
            vmstate: self.vmstate_path,
            disks: self.disks,
            ssh_key: self.ssh_key,
            net_ifaces: self.net_ifaces,
            version: self.version,
            created_at: self.created_at,
            seq: self.seq,
            base,
        }
    }
}

/// Catalog of snapshots under `<work_dir>/snapshots/<id>/`, so snapshot
/// files outlive the jail of the VM that produced them.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    snapshots_dir: PathBuf,
}

impl SnapshotStore {
    pub fn new(snapshots_dir: impl Into<PathBuf>) -> Self {
        Self {
            snapshots_dir: snapshots_dir.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.snapshots_dir
    }

    pub fn snapshot_dir(&self, id: &str) -> PathBuf {
        self.snapshots_dir.join(id)
    }

    /// Write (or rewrite) the metadata record for `snapshot`.
    pub async fn save(&self, snapshot: &SnapshotArtifact) -> Result<()> {
        let dir = self.snapshot_dir(&snapshot.id);
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| Error::io_context(&dir, e))?;

        let json = serde_json::to_string_pretty(&snapshot.to_config())?;
        let path = dir.join(CONFIG_FILE);
        fs::write(&path, json)
            .await
            .map_err(|e| Error::io_context(&path, e))?;

        info!(
            snapshot = %snapshot.id,
            vm_id = %snapshot.vm_id,
            kind = %snapshot.kind,
            base = ?snapshot.base.as_ref().map(|b| &b.id),
            "snapshot saved"
        );
        Ok(())
    }

    pub async fn load_config(&self, id: &str) -> Result<SnapshotConfig> {
        let path = self.snapshot_dir(id).join(CONFIG_FILE);
        if !path.exists() {
            return Err(Error::precondition(format!("snapshot '{}' not found", id)));
        }
        let json = fs::read_to_string(&path)
            .await
            .map_err(|e| Error::io_context(&path, e))?;
        let config = serde_json::from_str(&json)
            .with_context(|| format!("parsing snapshot metadata {}", path.display()))?;
        Ok(config)
    }

    /// Load a snapshot together with its base chain.
    pub async fn load(&self, id: &str) -> Result<SnapshotArtifact> {
        let mut configs = vec![self.load_config(id).await?];
        let mut seen: HashSet<String> = HashSet::from([id.to_string()]);
        while let Some(base_id) = configs.last().and_then(|c| c.base_id.clone()) {
            if !seen.insert(base_id.clone()) {
                return Err(Error::Restore(format!(
                    "snapshot {} has a cyclic base chain",
                    id
                )));
            }
            configs.push(self.load_config(&base_id).await?);
        }

        let mut base: Option<Arc<SnapshotArtifact>> = None;
        while let Some(config) = configs.pop() {
            let artifact = config.into_artifact(base.take());
            if configs.is_empty() {
                return Ok(artifact);
            }
            base = Some(Arc::new(artifact));
        }
        Err(Error::Restore(format!("snapshot {} has no records", id)))
    }

    /// Catalogued snapshots in capture order.
    pub async fn list(&self) -> Result<Vec<SnapshotConfig>> {
        let mut snapshots = Vec::new();
        if !self.snapshots_dir.exists() {
            return Ok(snapshots);
        }
        let mut entries = fs::read_dir(&self.snapshots_dir)
            .await
            .map_err(|e| Error::io_context(&self.snapshots_dir, e))?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if entry.path().join(CONFIG_FILE).exists() {
                    snapshots.push(self.load_config(name).await?);
                }
            }
        }
        snapshots.sort_by_key(|s| s.seq);
        Ok(snapshots)
    }

    /// Remove a snapshot's directory. Refuses while another snapshot still
    /// uses it as a base.
    pub async fn delete(&self, id: &str) -> Result<()> {
        if let Some(dependent) = self
            .list()
            .await?
            .into_iter()
            .find(|s| s.base_id.as_deref() == Some(id))
        {
            return Err(Error::precondition(format!(
                "snapshot {} is the base of {}",
                id, dependent.id
            )));
        }
        let dir = self.snapshot_dir(id);
        if dir.exists() {
            fs::remove_dir_all(&dir)
                .await
                .map_err(|e| Error::io_context(&dir, e))?;
            info!(snapshot = id, "snapshot deleted");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn artifact(dir: &Path, id: &str, kind: SnapshotKind, mem: &[u8]) -> SnapshotArtifact {
        let snap_dir = dir.join(id);
        std::fs::create_dir_all(&snap_dir).unwrap();
        let mem_path = snap_dir.join("vm.mem");
        let state_path = snap_dir.join("vm.vmstate");
        std::fs::write(&mem_path, mem).unwrap();
        std::fs::write(&state_path, b"state").unwrap();
        SnapshotArtifact::new(
            id,
            "vm-test",
            kind,
            mem_path,
            state_path,
            vec![PathBuf::from("/images/rootfs.ext4")],
            None,
            vec![NetIfaceConfig::default()],
            None,
        )
    }

    #[test]
    fn test_capture_seq_is_strictly_increasing() {
        let mut prev = next_capture_seq();
        for _ in 0..1000 {
            let next = next_capture_seq();
            assert!(next > prev);
            prev = next;
        }
    }

    #[test]
    fn test_kind_maps_to_api_param() {
        assert_eq!(SnapshotKindParam::from(SnapshotKind::Diff), SnapshotKindParam::Diff);
        assert_eq!(SnapshotKind::Full.to_string(), "full");
    }

    #[test]
    fn test_rebase_rules() {
        let dir = tempfile::tempdir().unwrap();
        let full = Arc::new(artifact(dir.path(), "a", SnapshotKind::Full, b"a"));
        let mut diff = artifact(dir.path(), "b", SnapshotKind::Diff, b"b");
        let mut full2 = artifact(dir.path(), "c", SnapshotKind::Full, b"c");

        assert!(matches!(full2.rebase(full.clone()), Err(Error::Precondition(_))));

        diff.rebase(full.clone()).unwrap();
        assert_eq!(diff.base().unwrap().id, "a");

        // A base captured later than the diff is rejected.
        let mut early = artifact(dir.path(), "d", SnapshotKind::Diff, b"d");
        let later = Arc::new(artifact(dir.path(), "e", SnapshotKind::Full, b"e"));
        early.seq = 1;
        assert!(matches!(early.rebase(later), Err(Error::Precondition(_))));
    }

    #[test]
    fn test_chain_order_and_validation() {
        let dir = tempfile::tempdir().unwrap();
        let full = Arc::new(artifact(dir.path(), "a", SnapshotKind::Full, b"a"));
        let mut d1 = artifact(dir.path(), "b", SnapshotKind::Diff, b"b");
        d1.rebase(full).unwrap();
        let mut d2 = artifact(dir.path(), "c", SnapshotKind::Diff, b"c");
        d2.rebase(Arc::new(d1)).unwrap();

        let ids: Vec<&str> = d2.chain().iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert!(d2.is_chained());
        d2.validate_chain().unwrap();

        std::fs::remove_file(dir.path().join("b/vm.mem")).unwrap();
        assert!(matches!(d2.validate_chain(), Err(Error::Restore(_))));
    }

    #[tokio::test]
    async fn test_materialize_memory_applies_layers_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let bs = MERGE_BLOCK_SIZE;

        let full = Arc::new(artifact(dir.path(), "a", SnapshotKind::Full, &vec![1u8; bs * 3]));
        let mut layer1 = vec![0u8; bs * 3];
        layer1[bs..bs * 2].fill(2);
        layer1[bs * 2..].fill(2);
        let mut d1 = artifact(dir.path(), "b", SnapshotKind::Diff, &layer1);
        d1.rebase(full).unwrap();
        let mut layer2 = vec![0u8; bs * 3];
        layer2[bs * 2..].fill(3);
        let mut d2 = artifact(dir.path(), "c", SnapshotKind::Diff, &layer2);
        d2.rebase(Arc::new(d1)).unwrap();

        let out = dir.path().join("merged.mem");
        d2.materialize_memory(&out).await.unwrap();
        let merged = std::fs::read(&out).unwrap();
        assert!(merged[..bs].iter().all(|&b| b == 1));
        assert!(merged[bs..bs * 2].iter().all(|&b| b == 2));
        assert!(merged[bs * 2..].iter().all(|&b| b == 3));

        // Layers themselves are untouched.
        assert_eq!(std::fs::read(dir.path().join("c/vm.mem")).unwrap(), layer2);
    }

    #[tokio::test]
    async fn test_store_save_load_rebuilds_chain() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path().join("snapshots"));

        let full = artifact(dir.path(), "snap-full", SnapshotKind::Full, b"full");
        store.save(&full).await.unwrap();
        let mut diff = artifact(dir.path(), "snap-diff", SnapshotKind::Diff, b"diff");
        diff.rebase(Arc::new(full.clone())).unwrap();
        store.save(&diff).await.unwrap();

        assert!(store.snapshot_dir("snap-diff").join(CONFIG_FILE).exists());

        let loaded = store.load("snap-diff").await.unwrap();
        assert_eq!(loaded.kind, SnapshotKind::Diff);
        assert_eq!(loaded.seq(), diff.seq());
        assert_eq!(loaded.net_ifaces, vec![NetIfaceConfig::default()]);
        let base = loaded.base().unwrap();
        assert_eq!(base.id, "snap-full");
        assert!(base.base().is_none());

        let listed: Vec<String> = store.list().await.unwrap().into_iter().map(|s| s.id).collect();
        assert_eq!(listed, vec!["snap-full", "snap-diff"]);
    }

    #[tokio::test]
    async fn test_store_delete_respects_dependents() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path().join("snapshots"));
        let full = artifact(dir.path(), "base", SnapshotKind::Full, b"x");
        store.save(&full).await.unwrap();
        let mut diff = artifact(dir.path(), "top", SnapshotKind::Diff, b"y");
        diff.rebase(Arc::new(full)).unwrap();
        store.save(&diff).await.unwrap();

        assert!(matches!(store.delete("base").await, Err(Error::Precondition(_))));
        store.delete("top").await.unwrap();
        store.delete("base").await.unwrap();
        assert!(store.list().await.unwrap().is_empty());
        assert!(matches!(store.load("base").await, Err(Error::Precondition(_))));
    }

    #[test]
    fn test_snapshot_config_defaults_optional_fields() {
        let json = r#"{
            "id": "snap-1",
            "vm_id": "vm-1",
            "kind": "full",
            "memory_path": "/s/vm.mem",
            "vmstate_path": "/s/vm.vmstate",
            "disks": ["/images/rootfs.ext4"],
            "seq": 7,
            "created_at": "2024-01-15T10:30:00Z"
        }"#;
        let config: SnapshotConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.kind, SnapshotKind::Full);
        assert!(config.base_id.is_none());
        assert!(config.net_ifaces.is_empty());
        assert!(config.ssh_key.is_none());
    }
}
