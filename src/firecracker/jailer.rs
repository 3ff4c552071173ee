//! Where a VMM's files live and how paths are presented to it.
//!
//! A jailed VMM sees its chroot as `/`, so every resource it opens must be
//! linked into the chroot and addressed as `/<name>`. An unjailed VMM runs in
//! a private scratch directory and sees real host paths.

use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::JailerSettings;
use crate::state::validate_vm_id;
use crate::utils::{chown_to, link_or_copy};

pub const API_SOCKET_NAME: &str = "api.socket";

/// Jailer invocation for one VM.
#[derive(Debug, Clone)]
pub struct JailerContext {
    id: String,
    exec_file: PathBuf,
    settings: JailerSettings,
}

impl JailerContext {
    pub fn new(id: &str, exec_file: &Path, settings: JailerSettings) -> Result<Self> {
        validate_vm_id(id)?;
        if exec_file.file_name().is_none() {
            bail!("VMM binary path has no file name: {}", exec_file.display());
        }
        Ok(Self {
            id: id.to_string(),
            exec_file: exec_file.to_path_buf(),
            settings,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn uid(&self) -> u32 {
        self.settings.uid
    }

    pub fn gid(&self) -> u32 {
        self.settings.gid
    }

    pub fn daemonize(&self) -> bool {
        self.settings.daemonize
    }

    pub fn netns(&self) -> Option<&str> {
        self.settings.netns.as_deref()
    }

    pub fn jailer_bin(&self) -> &Path {
        &self.settings.jailer_bin
    }

    fn exec_name(&self) -> String {
        self.exec_file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// `<chroot_base>/<exec_name>/<id>`, everything the jailer creates for this VM
    pub fn chroot_base_with_id(&self) -> PathBuf {
        self.settings
            .chroot_base
            .join(self.exec_name())
            .join(&self.id)
    }

    /// The directory the VMM sees as `/`
    pub fn chroot_path(&self) -> PathBuf {
        self.chroot_base_with_id().join("root")
    }

    /// Written by the jailer when it daemonizes
    pub fn pid_file(&self) -> PathBuf {
        self.chroot_path().join(format!("{}.pid", self.exec_name()))
    }

    /// Jailer arguments followed by `--` and the VMM's own arguments.
    pub fn construct_args(&self, vmm_args: &[String]) -> Vec<String> {
        let mut args = vec![
            "--id".to_string(),
            self.id.clone(),
            "--exec-file".to_string(),
            self.exec_file.display().to_string(),
            "--uid".to_string(),
            self.settings.uid.to_string(),
            "--gid".to_string(),
            self.settings.gid.to_string(),
            "--node".to_string(),
            self.settings.numa_node.to_string(),
            "--chroot-base-dir".to_string(),
            self.settings.chroot_base.display().to_string(),
        ];
        if let Some(ns) = &self.settings.netns {
            args.push("--netns".to_string());
            args.push(format!("/var/run/netns/{}", ns));
        }
        if self.settings.daemonize {
            args.push("--daemonize".to_string());
        }
        if !vmm_args.is_empty() {
            args.push("--".to_string());
            args.extend(vmm_args.iter().cloned());
        }
        args
    }

    /// Poll for the daemonized VMM's pid file.
    pub async fn read_pid(&self, retries: u32, delay: Duration) -> Result<u32> {
        let pid_file = self.pid_file();
        for _ in 0..retries {
            if let Ok(content) = tokio::fs::read_to_string(&pid_file).await {
                if let Ok(pid) = content.trim().parse::<u32>() {
                    return Ok(pid);
                }
            }
            tokio::time::sleep(delay).await;
        }
        bail!("pid file {} never appeared", pid_file.display())
    }
}

/// The filesystem view of one VMM.
#[derive(Debug)]
pub enum Jail {
    /// Private scratch directory, removed when the jail is dropped
    Unjailed(tempfile::TempDir),
    Jailed(JailerContext),
}

impl Jail {
    /// Allocate a fresh `fctest-` prefixed scratch directory under `parent`.
    pub fn unjailed(parent: &Path) -> Result<Self> {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
        let dir = tempfile::Builder::new()
            .prefix("fctest-")
            .tempdir_in(parent)
            .context("allocating VM directory")?;
        Ok(Jail::Unjailed(dir))
    }

    /// Host directory backing the VMM's root
    pub fn host_root(&self) -> PathBuf {
        match self {
            Jail::Unjailed(dir) => dir.path().to_path_buf(),
            Jail::Jailed(ctx) => ctx.chroot_path(),
        }
    }

    /// Host path of the control socket
    pub fn api_socket_path(&self) -> PathBuf {
        self.host_root().join(API_SOCKET_NAME)
    }

    /// How the VMM addresses `rel` (a path relative to its root).
    pub fn visible_path(&self, rel: &str) -> String {
        let rel = rel.trim_start_matches('/');
        match self {
            Jail::Unjailed(dir) => dir.path().join(rel).display().to_string(),
            Jail::Jailed(_) => format!("/{}", rel),
        }
    }

    /// Make a host file reachable by the VMM and return the path it should use.
    ///
    /// Jailed: hard-link into the chroot (replacing any same-named file) and
    /// hand ownership to the jailer identity. Unjailed: the host path as-is.
    pub fn place(&self, host_file: &Path) -> Result<String> {
        match self {
            Jail::Unjailed(_) => Ok(host_file.display().to_string()),
            Jail::Jailed(ctx) => {
                let name = host_file
                    .file_name()
                    .with_context(|| format!("no file name in {}", host_file.display()))?;
                let root = ctx.chroot_path();
                std::fs::create_dir_all(&root)
                    .with_context(|| format!("creating chroot {}", root.display()))?;
                let dest = root.join(name);
                link_or_copy(host_file, &dest)
                    .with_context(|| format!("linking {} into jail", host_file.display()))?;
                chown_to(&dest, ctx.uid(), ctx.gid())
                    .with_context(|| format!("chown {}", dest.display()))?;
                debug!(src = %host_file.display(), dest = %dest.display(), "jailed resource");
                Ok(format!("/{}", name.to_string_lossy()))
            }
        }
    }

    /// Create `rel` as a directory under the root, owned by the VMM identity.
    pub fn create_dir(&self, rel: &str) -> Result<PathBuf> {
        let dir = self.host_root().join(rel.trim_start_matches('/'));
        std::fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;
        if let Jail::Jailed(ctx) = self {
            chown_to(&dir, ctx.uid(), ctx.gid())
                .with_context(|| format!("chown {}", dir.display()))?;
        }
        Ok(dir)
    }

    /// Give a file the harness created inside the root to the VMM identity.
    pub fn hand_over(&self, host_path: &Path) -> Result<()> {
        if let Jail::Jailed(ctx) = self {
            chown_to(host_path, ctx.uid(), ctx.gid())
                .with_context(|| format!("chown {}", host_path.display()))?;
        }
        Ok(())
    }

    pub fn is_jailed(&self) -> bool {
        matches!(self, Jail::Jailed(_))
    }

    /// Remove the jail's directories. Unjailed scratch dirs go away on drop.
    pub fn cleanup(&self) {
        if let Jail::Jailed(ctx) = self {
            let dir = ctx.chroot_base_with_id();
            if let Err(e) = std::fs::remove_dir_all(&dir) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(dir = %dir.display(), error = %e, "failed to remove jail");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> JailerSettings {
        JailerSettings {
            chroot_base: PathBuf::from("/srv/jailer"),
            netns: Some("fc-ns".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_chroot_layout() {
        let ctx = JailerContext::new("vm-1", Path::new("/usr/bin/firecracker"), settings()).unwrap();
        assert_eq!(ctx.chroot_base_with_id(), PathBuf::from("/srv/jailer/firecracker/vm-1"));
        assert_eq!(ctx.chroot_path(), PathBuf::from("/srv/jailer/firecracker/vm-1/root"));
        assert_eq!(
            ctx.pid_file(),
            PathBuf::from("/srv/jailer/firecracker/vm-1/root/firecracker.pid")
        );
    }

    #[test]
    fn test_construct_args() {
        let ctx = JailerContext::new("vm-1", Path::new("/usr/bin/firecracker"), settings()).unwrap();
        let args = ctx.construct_args(&["--api-sock".to_string(), "/api.socket".to_string()]);
        let joined = args.join(" ");
        assert!(joined.starts_with("--id vm-1 --exec-file /usr/bin/firecracker --uid 1234 --gid 1234"));
        assert!(joined.contains("--chroot-base-dir /srv/jailer"));
        assert!(joined.contains("--netns /var/run/netns/fc-ns"));
        assert!(joined.contains("--daemonize"));
        assert!(joined.ends_with("-- --api-sock /api.socket"));
    }

    #[test]
    fn test_invalid_id_rejected() {
        assert!(JailerContext::new("bad/id", Path::new("/usr/bin/firecracker"), settings()).is_err());
    }

    #[test]
    fn test_jailed_visible_paths() {
        let ctx = JailerContext::new("vm-1", Path::new("/usr/bin/firecracker"), settings()).unwrap();
        let jail = Jail::Jailed(ctx);
        assert_eq!(jail.visible_path("snapshot/vm.mem"), "/snapshot/vm.mem");
        assert_eq!(
            jail.api_socket_path(),
            PathBuf::from("/srv/jailer/firecracker/vm-1/root/api.socket")
        );
    }

    #[test]
    fn test_unjailed_paths_and_cleanup() {
        let parent = tempfile::tempdir().unwrap();
        let jail = Jail::unjailed(parent.path()).unwrap();
        let root = jail.host_root();
        assert!(root.starts_with(parent.path()));
        assert!(root
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("fctest-"));
        assert_eq!(
            jail.visible_path("/snapshot/vm.mem"),
            root.join("snapshot/vm.mem").display().to_string()
        );

        let kernel = parent.path().join("vmlinux.bin");
        std::fs::write(&kernel, b"kernel").unwrap();
        assert_eq!(jail.place(&kernel).unwrap(), kernel.display().to_string());

        drop(jail);
        assert!(!root.exists());
    }
}
