use anyhow::{Context, Result};

use crate::artifacts::{ArtifactCollection, ArtifactKind};
use crate::cli::{ArtifactsArgs, ArtifactsCommands};
use crate::config::HarnessConfig;

use super::snapshots::format_size;

const ALL_KINDS: &[ArtifactKind] = &[
    ArtifactKind::Kernel,
    ArtifactKind::Disk,
    ArtifactKind::SshKey,
    ArtifactKind::Microvm,
    ArtifactKind::Firecracker,
];

pub async fn cmd_artifacts(config: &HarnessConfig, args: ArtifactsArgs) -> Result<()> {
    match args.cmd {
        ArtifactsCommands::Ls { kind, keyword } => {
            cmd_artifacts_ls(config, kind, keyword.as_deref()).await
        }
    }
}

async fn cmd_artifacts_ls(
    config: &HarnessConfig,
    kind: Option<ArtifactKind>,
    keyword: Option<&str>,
) -> Result<()> {
    let collection = ArtifactCollection::new(config.artifact_dir());
    let kinds = match kind {
        Some(kind) => vec![kind],
        None => ALL_KINDS.to_vec(),
    };

    let mut found = 0;
    println!("{:<12} {:<48} {:<8}", "KIND", "NAME", "SIZE");
    for kind in kinds {
        let set = collection
            .list(kind, keyword)
            .await
            .with_context(|| format!("listing {} artifacts", kind))?;
        for artifact in set.artifacts() {
            let path = artifact.download().await?;
            let size = tokio::fs::metadata(&path).await.map(|m| m.len()).unwrap_or(0);
            println!("{:<12} {:<48} {:<8}", kind.to_string(), artifact.name(), format_size(size));
            found += 1;
        }
    }
    if found == 0 {
        println!("No artifacts found in {}", collection.root().display());
    }
    Ok(())
}
