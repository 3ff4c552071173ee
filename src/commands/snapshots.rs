use anyhow::{Context, Result};
use serde::Serialize;
use tracing::info;

use crate::cli::{SnapshotsArgs, SnapshotsCommands};
use crate::config::HarnessConfig;
use crate::storage::{SnapshotConfig, SnapshotStore};

pub async fn cmd_snapshots(config: &HarnessConfig, args: SnapshotsArgs) -> Result<()> {
    let store = SnapshotStore::new(config.snapshots_dir());
    match args.cmd {
        SnapshotsCommands::Ls { json } => cmd_snapshots_ls(&store, json).await,
        SnapshotsCommands::Rm { id } => cmd_snapshots_rm(&store, &id).await,
    }
}

/// Snapshot info for display/JSON output
#[derive(Debug, Serialize)]
struct SnapshotInfo {
    id: String,
    kind: String,
    base: Option<String>,
    vm_id: String,
    created_at: String,
    age: String,
    size_bytes: u64,
    size_human: String,
}

async fn cmd_snapshots_ls(store: &SnapshotStore, json: bool) -> Result<()> {
    let configs = store.list().await.context("listing snapshots")?;

    let mut snapshots = Vec::with_capacity(configs.len());
    for config in &configs {
        snapshots.push(build_snapshot_info(store, config).await);
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&snapshots)?);
        return Ok(());
    }
    if snapshots.is_empty() {
        println!("No snapshots found.");
        return Ok(());
    }

    println!(
        "{:<38} {:<5} {:<38} {:<6} {:<8}",
        "ID", "KIND", "BASE", "AGE", "SIZE"
    );
    for info in snapshots {
        println!(
            "{:<38} {:<5} {:<38} {:<6} {:<8}",
            info.id,
            info.kind,
            info.base.as_deref().unwrap_or("-"),
            info.age,
            info.size_human
        );
    }
    Ok(())
}

async fn build_snapshot_info(store: &SnapshotStore, config: &SnapshotConfig) -> SnapshotInfo {
    let size_bytes = captured_bytes(store, config).await;
    SnapshotInfo {
        id: config.id.clone(),
        kind: config.kind.to_string(),
        base: config.base_id.clone(),
        vm_id: config.vm_id.clone(),
        created_at: config.created_at.to_rfc3339(),
        age: format_age(chrono::Utc::now().signed_duration_since(config.created_at)),
        size_bytes,
        size_human: format_size(size_bytes),
    }
}

async fn cmd_snapshots_rm(store: &SnapshotStore, id: &str) -> Result<()> {
    info!(snapshot = id, "deleting snapshot");
    store
        .load_config(id)
        .await
        .with_context(|| format!("snapshot '{}' not found", id))?;
    store.delete(id).await?;
    println!("Deleted snapshot '{}'", id);
    Ok(())
}

const AGE_UNITS: [(i64, &str); 3] = [(86_400, "d"), (3_600, "h"), (60, "m")];

/// Largest whole unit of `age`; clock skew reads as `0s`.
fn format_age(age: chrono::Duration) -> String {
    let secs = age.num_seconds().max(0);
    AGE_UNITS
        .iter()
        .find(|(unit, _)| secs >= *unit)
        .map(|(unit, suffix)| format!("{}{}", secs / unit, suffix))
        .unwrap_or_else(|| format!("{}s", secs))
}

pub(crate) fn format_size(bytes: u64) -> String {
    let mut value = bytes as f64;
    let mut unit = "B";
    for next in ["K", "M", "G", "T"] {
        if value < 1024.0 {
            break;
        }
        value /= 1024.0;
        unit = next;
    }
    if unit == "B" {
        format!("{}B", bytes)
    } else {
        format!("{:.1}{}", value, unit)
    }
}

/// Bytes held by the snapshot's own memory and state files. Disks are
/// referenced, not captured, so they do not count.
async fn captured_bytes(store: &SnapshotStore, config: &SnapshotConfig) -> u64 {
    let dir = store.snapshot_dir(&config.id);
    let mut total = 0;
    for file in [&config.memory_path, &config.vmstate_path] {
        let path = if file.is_absolute() { file.clone() } else { dir.join(file) };
        if let Ok(meta) = tokio::fs::metadata(&path).await {
            total += meta.len();
        }
    }
    total
}
