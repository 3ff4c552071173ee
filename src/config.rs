//! Harness configuration.
//!
//! A [`HarnessConfig`] is loaded once per test session and handed to every
//! component behind an `Arc`. Host facts that used to be probed lazily (CPU
//! vendor, supported CPU templates, host kernel) are resolved at load time
//! into [`HostProps`] so no component reads global state.

use anyhow::{bail, Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

pub const CONFIG_FILE: &str = "config.toml";
pub const CONFIG_ENV: &str = "FCTEST_CONFIG";

/// Settings for running the VMM inside the jailer sandbox.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct JailerSettings {
    pub jailer_bin: PathBuf,
    pub uid: u32,
    pub gid: u32,
    pub numa_node: u32,
    pub chroot_base: PathBuf,
    pub daemonize: bool,
    /// Network namespace name (under /var/run/netns) to launch the VMM in
    pub netns: Option<String>,
}

impl Default for JailerSettings {
    fn default() -> Self {
        Self {
            jailer_bin: PathBuf::from("jailer"),
            uid: 1234,
            gid: 1234,
            numa_node: 0,
            chroot_base: PathBuf::from("/srv/jailer"),
            daemonize: true,
            netns: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    pub firecracker_bin: PathBuf,
    /// Root for unjailed VM directories, the snapshot catalog and artifact copies
    pub work_dir: PathBuf,
    /// Local artifact store; defaults to `<work_dir>/artifacts`
    pub artifact_dir: Option<PathBuf>,
    /// Download cache for remote artifacts; defaults to `<work_dir>/cache`
    pub cache_dir: Option<PathBuf>,
    pub api_timeout_ms: u64,
    pub spawn_wait_retries: u32,
    pub spawn_wait_delay_ms: u64,
    pub kill_timeout_ms: u64,
    pub metrics_interval_secs: u64,
    /// Log level passed to the VMM (`--level`)
    pub vmm_log_level: String,
    /// Run VMMs under the jailer; unjailed when absent
    pub jailer: Option<JailerSettings>,
    /// Resolved at load time, never read from the file.
    #[serde(skip)]
    pub host: HostProps,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            firecracker_bin: PathBuf::from("firecracker"),
            jailer: None,
            work_dir: std::env::temp_dir().join("fctest"),
            artifact_dir: None,
            cache_dir: None,
            api_timeout_ms: 100,
            spawn_wait_retries: 50,
            spawn_wait_delay_ms: 100,
            kill_timeout_ms: 5000,
            metrics_interval_secs: 60,
            vmm_log_level: "Info".to_string(),
            host: HostProps::default(),
        }
    }
}

impl HarnessConfig {
    /// Locate, parse and resolve the config. Built-in defaults apply when no
    /// file exists anywhere on the lookup chain.
    pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
        let mut config = match find_config_file(explicit_path)? {
            Some(path) => {
                let content = std::fs::read_to_string(&path)
                    .with_context(|| format!("reading config file: {}", path.display()))?;
                let config = Self::from_toml_str(&content)
                    .with_context(|| format!("parsing config file: {}", path.display()))?;
                info!(config_file = %path.display(), "loaded harness config");
                config
            }
            None => {
                debug!("no config file found, using defaults");
                Self::default()
            }
        };
        config.host = HostProps::detect()?;
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        if config.api_timeout_ms == 0 {
            bail!("api_timeout_ms must be positive");
        }
        if config.spawn_wait_retries == 0 {
            bail!("spawn_wait_retries must be positive");
        }
        if config.metrics_interval_secs == 0 {
            bail!("metrics_interval_secs must be positive");
        }
        Ok(config)
    }

    pub fn api_timeout(&self) -> Duration {
        Duration::from_millis(self.api_timeout_ms)
    }

    pub fn spawn_wait_delay(&self) -> Duration {
        Duration::from_millis(self.spawn_wait_delay_ms)
    }

    pub fn metrics_interval(&self) -> Duration {
        Duration::from_secs(self.metrics_interval_secs)
    }

    pub fn artifact_dir(&self) -> PathBuf {
        self.artifact_dir
            .clone()
            .unwrap_or_else(|| self.work_dir.join("artifacts"))
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.cache_dir
            .clone()
            .unwrap_or_else(|| self.work_dir.join("cache"))
    }

    /// Snapshot catalog root
    pub fn snapshots_dir(&self) -> PathBuf {
        self.work_dir.join("snapshots")
    }

    /// Parent of the per-VM directories of unjailed runs
    pub fn vms_dir(&self) -> PathBuf {
        self.work_dir.join("vms")
    }

    /// Where artifact copies (`Artifact::copy`) land
    pub fn copies_dir(&self) -> PathBuf {
        self.work_dir.join("copies")
    }
}

/// Find the config file: explicit path, `$FCTEST_CONFIG`, XDG user config,
/// then `/etc/fctest`. `Ok(None)` means "use defaults".
pub fn find_config_file(explicit_path: Option<&Path>) -> Result<Option<PathBuf>> {
    if let Some(path) = explicit_path {
        if !path.exists() {
            bail!("Config file not found: {}", path.display());
        }
        return Ok(Some(path.to_path_buf()));
    }

    if let Ok(path) = std::env::var(CONFIG_ENV) {
        let p = PathBuf::from(&path);
        if !p.exists() {
            bail!("{} points to a missing file: {}", CONFIG_ENV, path);
        }
        return Ok(Some(p));
    }

    if let Some(proj_dirs) = ProjectDirs::from("", "", "fctest") {
        let p = proj_dirs.config_dir().join(CONFIG_FILE);
        if p.exists() {
            return Ok(Some(p));
        }
    }

    let system = Path::new("/etc/fctest").join(CONFIG_FILE);
    if system.exists() {
        return Ok(Some(system));
    }

    Ok(None)
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum CpuVendor {
    Intel,
    Amd,
    Arm,
    #[default]
    Unknown,
}

/// Facts about the host, resolved once.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct HostProps {
    pub arch: String,
    pub cpu_vendor: CpuVendor,
    pub cpu_model: String,
    /// Host kernel release, e.g. "6.1.55"
    pub host_kernel: String,
    /// Static CPU templates the VMM accepts on this host
    pub supported_cpu_templates: Vec<String>,
}

impl HostProps {
    pub fn detect() -> Result<Self> {
        let cpuinfo = std::fs::read_to_string("/proc/cpuinfo").unwrap_or_default();
        let uts = nix::sys::utsname::uname().context("reading host uname")?;
        let release = uts.release().to_string_lossy().into_owned();
        let props = Self::from_cpuinfo(std::env::consts::ARCH, &cpuinfo, &release);
        debug!(
            arch = %props.arch,
            vendor = ?props.cpu_vendor,
            kernel = %props.host_kernel,
            templates = ?props.supported_cpu_templates,
            "detected host"
        );
        Ok(props)
    }

    pub fn from_cpuinfo(arch: &str, cpuinfo: &str, kernel_release: &str) -> Self {
        let field = |name: &str| {
            cpuinfo.lines().find_map(|line| {
                let (key, value) = line.split_once(':')?;
                (key.trim() == name).then(|| value.trim().to_string())
            })
        };

        let cpu_vendor = match field("vendor_id").as_deref() {
            Some("GenuineIntel") => CpuVendor::Intel,
            Some("AuthenticAMD") => CpuVendor::Amd,
            _ if arch == "aarch64" => CpuVendor::Arm,
            _ => CpuVendor::Unknown,
        };

        let supported_cpu_templates = match cpu_vendor {
            CpuVendor::Intel => vec!["C3", "T2", "T2CL", "T2S"],
            CpuVendor::Amd => vec!["T2A"],
            CpuVendor::Arm | CpuVendor::Unknown => vec![],
        }
        .into_iter()
        .map(String::from)
        .collect();

        Self {
            arch: arch.to_string(),
            cpu_vendor,
            cpu_model: field("model name").unwrap_or_default(),
            host_kernel: kernel_release
                .split(|c: char| c == '-' || c == '+')
                .next()
                .unwrap_or(kernel_release)
                .to_string(),
            supported_cpu_templates,
        }
    }

    pub fn supports_cpu_template(&self, name: &str) -> bool {
        self.supported_cpu_templates.iter().any(|t| t == name)
    }
}
