use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::artifacts::ArtifactKind;

#[derive(Parser, Debug)]
#[command(name = "fctest", version, about = "Firecracker integration-test harness")]
pub struct Cli {
    /// Harness config file (TOML); falls back to $FCTEST_CONFIG and the
    /// standard locations
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Output is captured by a parent process: plain log lines only
    #[arg(long, global = true, hide = true)]
    pub sub_process: bool,

    #[command(subcommand)]
    pub cmd: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Show detected host properties and the resolved harness config
    Host,
    /// Manage the snapshot catalog
    Snapshots(SnapshotsArgs),
    /// Inspect the local artifact store
    Artifacts(ArtifactsArgs),
}

#[derive(Args, Debug)]
pub struct SnapshotsArgs {
    #[command(subcommand)]
    pub cmd: SnapshotsCommands,
}

#[derive(Subcommand, Debug)]
pub enum SnapshotsCommands {
    /// List catalogued snapshots, oldest first
    Ls {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },
    /// Delete a snapshot (refused while another snapshot uses it as base)
    Rm {
        /// Snapshot id
        id: String,
    },
}

#[derive(Args, Debug)]
pub struct ArtifactsArgs {
    #[command(subcommand)]
    pub cmd: ArtifactsCommands,
}

#[derive(Subcommand, Debug)]
pub enum ArtifactsCommands {
    /// List artifacts, optionally of one kind
    Ls {
        #[arg(long, value_enum)]
        kind: Option<ArtifactKind>,

        /// Only names containing this keyword
        #[arg(long)]
        keyword: Option<String>,
    },
}
