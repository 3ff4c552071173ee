//! Test artifacts: kernels, disk images, ssh keys, microVM configs and VMM
//! release binaries, fetched lazily from a local store or over HTTP.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::firecracker::MachineSpec;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum ArtifactKind {
    Kernel,
    Disk,
    SshKey,
    Microvm,
    Firecracker,
}

impl ArtifactKind {
    /// Subdirectory of the local artifact store holding this kind.
    pub fn dir_name(self) -> &'static str {
        match self {
            ArtifactKind::Kernel => "kernels",
            ArtifactKind::Disk => "disks",
            ArtifactKind::SshKey => "disks",
            ArtifactKind::Microvm => "microvms",
            ArtifactKind::Firecracker => "firecrackers",
        }
    }
}

impl std::fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ArtifactKind::Kernel => "kernel",
            ArtifactKind::Disk => "disk",
            ArtifactKind::SshKey => "ssh-key",
            ArtifactKind::Microvm => "microvm",
            ArtifactKind::Firecracker => "firecracker",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactSource {
    Local(PathBuf),
    /// HTTP(S) URL, downloaded into the cache directory on first use
    Remote { url: String, cache_dir: PathBuf },
}

const SSH_KEY_SUFFIX: &str = "id_rsa";

/// A named, typed resource that becomes a local file on first use.
///
/// Clones share the materialization, so a file is fetched at most once no
/// matter how many matrix cells use it.
#[derive(Debug, Clone)]
pub struct Artifact {
    name: String,
    kind: ArtifactKind,
    source: ArtifactSource,
    sha256: Option<String>,
    local: Arc<OnceCell<PathBuf>>,
}

impl Artifact {
    pub fn local(kind: ArtifactKind, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        Self {
            name,
            kind,
            source: ArtifactSource::Local(path),
            sha256: None,
            local: Arc::new(OnceCell::new()),
        }
    }

    pub fn remote(kind: ArtifactKind, url: &str, cache_dir: impl Into<PathBuf>) -> Self {
        let name = url
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or(url)
            .to_string();
        Self {
            name,
            kind,
            source: ArtifactSource::Remote {
                url: url.to_string(),
                cache_dir: cache_dir.into(),
            },
            sha256: None,
            local: Arc::new(OnceCell::new()),
        }
    }

    /// Verify the materialized file against this lowercase hex digest.
    pub fn with_sha256(mut self, hex: impl Into<String>) -> Self {
        self.sha256 = Some(hex.into().to_lowercase());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ArtifactKind {
        self.kind
    }

    pub fn source(&self) -> &ArtifactSource {
        &self.source
    }

    /// Local path once materialized.
    pub fn local_path(&self) -> Option<&Path> {
        self.local.get().map(PathBuf::as_path)
    }

    /// Materialize the artifact locally (once) and return its path.
    pub async fn download(&self) -> Result<PathBuf> {
        let path = self
            .local
            .get_or_try_init(|| async {
                let path = match &self.source {
                    ArtifactSource::Local(path) => {
                        if !path.exists() {
                            return Err(self.error(format!("{} does not exist", path.display())));
                        }
                        path.clone()
                    }
                    ArtifactSource::Remote { url, cache_dir } => {
                        self.fetch(url, cache_dir).await?
                    }
                };
                if let Some(expected) = &self.sha256 {
                    let actual = sha256_file(&path).await?;
                    if &actual != expected {
                        return Err(self.error(format!(
                            "checksum mismatch: expected {}, got {}",
                            expected, actual
                        )));
                    }
                }
                Ok(path)
            })
            .await?;
        Ok(path.clone())
    }

    async fn fetch(&self, url: &str, cache_dir: &Path) -> Result<PathBuf> {
        let dest = cache_dir.join(&self.name);
        if dest.exists() {
            debug!(artifact = %self.name, path = %dest.display(), "artifact cached");
            return Ok(dest);
        }
        tokio::fs::create_dir_all(cache_dir)
            .await
            .map_err(|e| Error::io_context(cache_dir, e))?;

        info!(artifact = %self.name, url, "downloading artifact");
        let mut resp = reqwest::get(url)
            .await
            .map_err(|e| self.error(format!("GET {}: {}", url, e)))?;
        if !resp.status().is_success() {
            return Err(self.error(format!("GET {} answered {}", url, resp.status())));
        }

        // Write beside the target and rename so a partial download never
        // looks complete.
        let partial = cache_dir.join(format!(".{}.{}.part", self.name, uuid::Uuid::new_v4().simple()));
        let mut file = tokio::fs::File::create(&partial)
            .await
            .map_err(|e| Error::io_context(&partial, e))?;
        while let Some(chunk) = resp
            .chunk()
            .await
            .map_err(|e| self.error(format!("reading {}: {}", url, e)))?
        {
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        drop(file);
        tokio::fs::rename(&partial, &dest)
            .await
            .map_err(|e| Error::io_context(&dest, e))?;
        Ok(dest)
    }

    /// Copy the artifact into `dir` as a fresh, independently mutable file.
    pub async fn copy_into(&self, dir: &Path) -> Result<PathBuf> {
        let src = self.download().await?;
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| Error::io_context(dir, e))?;
        let dest = dir.join(&self.name);
        tokio::fs::copy(&src, &dest)
            .await
            .map_err(|e| Error::io_context(&dest, e))?;
        if self.kind == ArtifactKind::SshKey {
            // ssh refuses keys readable by others.
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&dest, std::fs::Permissions::from_mode(0o600)).await?;
        }
        Ok(dest)
    }

    /// Copy into a new unique directory under `copies_root`.
    pub async fn copy(&self, copies_root: &Path) -> Result<PathBuf> {
        let dir = copies_root.join(uuid::Uuid::new_v4().simple().to_string());
        self.copy_into(&dir).await
    }

    /// The key that logs into a disk image: `<disk-stem>.id_rsa` beside it.
    pub fn ssh_key(&self) -> Option<Artifact> {
        if self.kind != ArtifactKind::Disk {
            return None;
        }
        let stem = self.name.rsplit_once('.').map_or(self.name.as_str(), |(s, _)| s);
        let key_name = format!("{}.{}", stem, SSH_KEY_SUFFIX);
        let source = match &self.source {
            ArtifactSource::Local(path) => ArtifactSource::Local(path.with_file_name(&key_name)),
            ArtifactSource::Remote { url, cache_dir } => {
                let base = url.rsplit_once('/').map_or("", |(b, _)| b);
                ArtifactSource::Remote {
                    url: format!("{}/{}", base, key_name),
                    cache_dir: cache_dir.clone(),
                }
            }
        };
        Some(Artifact {
            name: key_name,
            kind: ArtifactKind::SshKey,
            source,
            sha256: None,
            local: Arc::new(OnceCell::new()),
        })
    }

    /// Parse a microVM config artifact.
    pub async fn machine_spec(&self) -> Result<MachineSpec> {
        if self.kind != ArtifactKind::Microvm {
            return Err(self.error("not a microvm config artifact"));
        }
        let path = self.download().await?;
        Ok(MachineSpec::from_file(&path)?)
    }

    fn error(&self, reason: impl Into<String>) -> Error {
        Error::Artifact {
            name: self.name.clone(),
            reason: reason.into(),
        }
    }
}

async fn sha256_file(path: &Path) -> Result<String> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|e| Error::io_context(path, e))?;
    Ok(format!("{:x}", Sha256::digest(&bytes)))
}

/// An ordered list of artifacts of one kind: one axis of a test matrix.
#[derive(Debug, Clone)]
pub struct ArtifactSet {
    kind: ArtifactKind,
    artifacts: Vec<Artifact>,
}

impl ArtifactSet {
    pub fn new(kind: ArtifactKind, artifacts: Vec<Artifact>) -> Result<Self> {
        if let Some(odd) = artifacts.iter().find(|a| a.kind() != kind) {
            return Err(Error::Artifact {
                name: odd.name().to_string(),
                reason: format!("is a {} in a {} set", odd.kind(), kind),
            });
        }
        Ok(Self { kind, artifacts })
    }

    pub fn kind(&self) -> ArtifactKind {
        self.kind
    }

    pub fn artifacts(&self) -> &[Artifact] {
        &self.artifacts
    }

    pub fn len(&self) -> usize {
        self.artifacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.artifacts.is_empty()
    }
}

/// Local artifact store laid out as `<root>/<kind dir>/<file>`.
#[derive(Debug, Clone)]
pub struct ArtifactCollection {
    root: PathBuf,
}

impl ArtifactCollection {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Artifacts of `kind` whose name contains `keyword`, sorted by name.
    pub async fn list(&self, kind: ArtifactKind, keyword: Option<&str>) -> Result<ArtifactSet> {
        let dir = self.root.join(kind.dir_name());
        let mut artifacts = Vec::new();
        if !dir.exists() {
            return ArtifactSet::new(kind, artifacts);
        }
        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .map_err(|e| Error::io_context(&dir, e))?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            let is_key = name.ends_with(&format!(".{}", SSH_KEY_SUFFIX));
            let wanted = match kind {
                ArtifactKind::SshKey => is_key,
                ArtifactKind::Disk => !is_key,
                _ => true,
            };
            if name.starts_with('.') || !wanted {
                continue;
            }
            if keyword.map_or(true, |k| name.contains(k)) {
                artifacts.push(Artifact::local(kind, entry.path()));
            }
        }
        artifacts.sort_by(|a, b| a.name().cmp(b.name()));
        ArtifactSet::new(kind, artifacts)
    }

    pub async fn kernels(&self, keyword: Option<&str>) -> Result<ArtifactSet> {
        self.list(ArtifactKind::Kernel, keyword).await
    }

    pub async fn disks(&self, keyword: Option<&str>) -> Result<ArtifactSet> {
        self.list(ArtifactKind::Disk, keyword).await
    }

    pub async fn microvms(&self, keyword: Option<&str>) -> Result<ArtifactSet> {
        self.list(ArtifactKind::Microvm, keyword).await
    }

    /// VMM release binaries, oldest version first. Files whose names do not
    /// parse as releases are skipped.
    pub async fn firecrackers(&self) -> Result<Vec<FirecrackerRelease>> {
        let set = self.list(ArtifactKind::Firecracker, Some("firecracker-v")).await?;
        let mut releases: Vec<FirecrackerRelease> = set
            .artifacts()
            .iter()
            .filter_map(|a| FirecrackerRelease::from_artifact(a.clone()).ok())
            .collect();
        releases.sort_by(|a, b| a.version_tuple().cmp(&b.version_tuple()));
        Ok(releases)
    }
}

/// A `firecracker-vX.Y.Z[-suffix]` release binary.
#[derive(Debug, Clone)]
pub struct FirecrackerRelease {
    artifact: Artifact,
    major: u32,
    minor: u32,
    patch: u32,
}

impl FirecrackerRelease {
    pub fn from_artifact(artifact: Artifact) -> Result<Self> {
        let (major, minor, patch) = parse_release_name(artifact.name()).ok_or_else(|| {
            Error::Artifact {
                name: artifact.name().to_string(),
                reason: "not a firecracker-vX.Y.Z release name".to_string(),
            }
        })?;
        Ok(Self {
            artifact,
            major,
            minor,
            patch,
        })
    }

    pub fn artifact(&self) -> &Artifact {
        &self.artifact
    }

    pub fn version(&self) -> String {
        format!("{}.{}.{}", self.major, self.minor, self.patch)
    }

    fn version_tuple(&self) -> (u32, u32, u32) {
        (self.major, self.minor, self.patch)
    }

    /// Snapshot data version this release writes: patch releases share it.
    pub fn snapshot_version(&self) -> String {
        format!("{}.{}.0", self.major, self.minor)
    }

    /// The matching jailer binary, `jailer-vX.Y.Z[-suffix]` beside the VMM.
    pub fn jailer(&self) -> Artifact {
        let name = self.artifact.name().replacen("firecracker-", "jailer-", 1);
        match self.artifact.source() {
            ArtifactSource::Local(path) => {
                Artifact::local(ArtifactKind::Firecracker, path.with_file_name(name))
            }
            ArtifactSource::Remote { url, cache_dir } => {
                let base = url.rsplit_once('/').map_or("", |(b, _)| b);
                Artifact::remote(
                    ArtifactKind::Firecracker,
                    &format!("{}/{}", base, name),
                    cache_dir.clone(),
                )
            }
        }
    }
}

fn parse_release_name(name: &str) -> Option<(u32, u32, u32)> {
    let rest = name.strip_prefix("firecracker-v")?;
    let version = rest.split('-').next()?;
    let mut parts = version.split('.').map(|p| p.parse::<u32>().ok());
    let parsed = (parts.next()??, parts.next()??, parts.next()??);
    if parts.next().is_some() {
        return None;
    }
    Some(parsed)
}
