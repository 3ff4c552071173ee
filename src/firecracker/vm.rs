use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use super::api::{
    faults, ApiResponse, Drive, DrivePatch, FirecrackerClient, InstanceAction, Metrics,
    MmdsConfig, MmdsVersion, NetworkInterface, SnapshotCreate, SnapshotKindParam, SnapshotLoad,
    VmRunState,
};
use super::config::{VmConfig, ROOT_DRIVE_ID};
use super::jailer::{Jail, JailerContext, API_SOCKET_NAME};
use crate::config::HarnessConfig;
use crate::error::{Error, Result};
use crate::metrics::MetricsReader;
use crate::network::{NetIfaceConfig, Tap};
use crate::ssh::{SshConfig, SshConnection};
use crate::state::{generate_vm_id, VmLifecycle};
use crate::utils::graceful_kill_async;

/// Block + net devices a v0.23 snapshot can describe.
pub const FC_V0_23_MAX_DEVICES_ATTACHED: usize = 11;

/// Directory under the VM root that receives snapshot files.
pub const SNAPSHOT_DIR_NAME: &str = "snapshot";

const METRICS_FIFO_NAME: &str = "metrics.fifo";
const LOG_FILE_NAME: &str = "fc.log";
const FLUSH_WAIT: Duration = Duration::from_secs(5);

/// One microVM: its VMM process, jail, control client and attached devices.
///
/// Operations check the lifecycle state first and fail with
/// [`Error::InvalidState`] when called out of order. Dropping the handle kills
/// a live VMM and removes the jail.
pub struct VmHandle {
    vm_id: String,
    config: Arc<HarnessConfig>,
    jail: Jail,
    state: VmLifecycle,
    process: Option<Child>,
    pid: Option<u32>,
    client: Option<FirecrackerClient>,
    metrics: Option<MetricsReader>,
    drives: Vec<String>,
    ifaces: Vec<NetIfaceConfig>,
    taps: Vec<Tap>,
    ssh: Option<SshConfig>,
}

impl VmHandle {
    /// Allocate an id and a fresh jail. Nothing is started yet.
    pub fn new(config: Arc<HarnessConfig>) -> Result<Self> {
        let vm_id = generate_vm_id();
        let jail = match &config.jailer {
            Some(settings) => Jail::Jailed(JailerContext::new(
                &vm_id,
                &config.firecracker_bin,
                settings.clone(),
            )?),
            None => Jail::unjailed(&config.vms_dir())?,
        };
        debug!(target: "vm", vm_id = %vm_id, root = %jail.host_root().display(), "allocated VM");
        Ok(Self {
            vm_id,
            config,
            jail,
            state: VmLifecycle::NotStarted,
            process: None,
            pid: None,
            client: None,
            metrics: None,
            drives: Vec::new(),
            ifaces: Vec::new(),
            taps: Vec::new(),
            ssh: None,
        })
    }

    pub fn id(&self) -> &str {
        &self.vm_id
    }

    pub fn state(&self) -> VmLifecycle {
        self.state
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn jail(&self) -> &Jail {
        &self.jail
    }

    /// Host directory the VMM sees as its root
    pub fn host_root(&self) -> PathBuf {
        self.jail.host_root()
    }

    pub fn api_socket_path(&self) -> PathBuf {
        self.jail.api_socket_path()
    }

    pub fn harness_config(&self) -> &Arc<HarnessConfig> {
        &self.config
    }

    /// Control client; only available once the VMM has been spawned.
    pub fn client(&self) -> Result<&FirecrackerClient> {
        self.client.as_ref().ok_or_else(|| Error::InvalidState {
            vm_id: self.vm_id.clone(),
            op: "use the API",
            expected: "spawned".to_string(),
            actual: self.state,
        })
    }

    /// Disable the per-call budget for the rest of this handle's life.
    pub fn untime_api(&mut self) {
        if let Some(client) = &self.client {
            self.client = Some(client.untimed());
        }
    }

    pub fn set_api_timeout(&mut self, timeout: Duration) {
        if let Some(client) = &self.client {
            self.client = Some(client.with_timeout(timeout));
        }
    }

    fn expect_state(&self, op: &'static str, allowed: &[VmLifecycle]) -> Result<()> {
        if allowed.contains(&self.state) {
            return Ok(());
        }
        Err(Error::InvalidState {
            vm_id: self.vm_id.clone(),
            op,
            expected: allowed
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(" or "),
            actual: self.state,
        })
    }

    /// Start the VMM (through the jailer when configured) and wait until its
    /// control socket accepts connections.
    pub async fn spawn(&mut self, log_level: Option<&str>) -> Result<()> {
        self.expect_state("spawn", &[VmLifecycle::NotStarted])?;
        info!(target: "vm", vm_id = %self.vm_id, "starting Firecracker process");

        std::fs::create_dir_all(self.jail.host_root())
            .map_err(|e| Error::io_context(self.jail.host_root(), e))?;

        let mut vmm_args = vec![
            "--api-sock".to_string(),
            self.jail.visible_path(API_SOCKET_NAME),
            "--id".to_string(),
            self.vm_id.clone(),
        ];

        if let Some(level) = log_level {
            let log_path = self.jail.host_root().join(LOG_FILE_NAME);
            std::fs::File::create(&log_path).map_err(|e| Error::io_context(&log_path, e))?;
            self.jail.hand_over(&log_path)?;
            vmm_args.extend([
                "--log-path".to_string(),
                self.jail.visible_path(LOG_FILE_NAME),
                "--level".to_string(),
                level.to_string(),
                "--show-level".to_string(),
                "--show-log-origin".to_string(),
            ]);
        }

        let (program, args) = match &self.jail {
            Jail::Jailed(ctx) => (ctx.jailer_bin().to_path_buf(), ctx.construct_args(&vmm_args)),
            Jail::Unjailed(_) => (self.config.firecracker_bin.clone(), vmm_args),
        };

        let mut cmd = Command::new(&program);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd
            .spawn()
            .map_err(|e| Error::Spawn(format!("{}: {}", program.display(), e)))?;

        // Stream stdout/stderr to tracing
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    info!(target: "firecracker", "{}", strip_firecracker_prefix(&line));
                }
            });
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    warn!(target: "firecracker", "{}", strip_firecracker_prefix(&line));
                }
            });
        }

        self.pid = child.id();
        self.process = Some(child);
        // From here on a failure leaves a process behind that kill()/drop must reap.
        self.state = VmLifecycle::Spawned;

        if let Err(e) = self.wait_for_socket().await {
            let _ = self.kill().await;
            return Err(e);
        }

        if let Jail::Jailed(ctx) = &self.jail {
            if ctx.daemonize() {
                let pid = ctx
                    .read_pid(self.config.spawn_wait_retries, self.config.spawn_wait_delay())
                    .await?;
                self.pid = Some(pid);
            }
        }

        self.client = Some(
            FirecrackerClient::new(self.jail.api_socket_path())
                .with_timeout(self.config.api_timeout()),
        );
        info!(target: "vm", vm_id = %self.vm_id, pid = ?self.pid, "Firecracker API socket ready");
        Ok(())
    }

    /// Wait until the control socket accepts a connection.
    async fn wait_for_socket(&mut self) -> Result<()> {
        let socket = self.jail.api_socket_path();
        let daemonized = matches!(&self.jail, Jail::Jailed(ctx) if ctx.daemonize());

        for _ in 0..self.config.spawn_wait_retries {
            if tokio::net::UnixStream::connect(&socket).await.is_ok() {
                return Ok(());
            }
            // A daemonizing jailer exits right after forking the VMM.
            if !daemonized {
                if let Some(child) = self.process.as_mut() {
                    if let Ok(Some(status)) = child.try_wait() {
                        return Err(Error::Spawn(format!(
                            "VMM exited with {} before exposing {}",
                            status,
                            socket.display()
                        )));
                    }
                }
            }
            tokio::time::sleep(self.config.spawn_wait_delay()).await;
        }

        let waited = self.config.spawn_wait_delay() * self.config.spawn_wait_retries;
        Err(Error::Spawn(format!(
            "control socket {} not ready after {:?}",
            socket.display(),
            waited
        )))
    }

    /// Machine shape, boot source and root drive. Any rejection is fatal.
    pub async fn configure(&mut self, vm_config: &VmConfig) -> Result<()> {
        self.expect_state("configure", &[VmLifecycle::Spawned, VmLifecycle::Configured])?;
        let client = self.client()?.clone();

        let resp = client.set_machine_config(&vm_config.machine).await?;
        config_result("machine-config", resp)?;

        let boot_source = super::api::BootSource {
            kernel_image_path: self.jail.place(&vm_config.kernel)?,
            initrd_path: match &vm_config.initrd {
                Some(initrd) => Some(self.jail.place(initrd)?),
                None => None,
            },
            boot_args: Some(vm_config.boot_args.clone()),
        };
        let resp = client.set_boot_source(&boot_source).await?;
        config_result("boot-source", resp)?;

        if let Some(rootfs) = &vm_config.rootfs {
            self.add_drive(ROOT_DRIVE_ID, rootfs, true, vm_config.rootfs_read_only)
                .await?;
        }

        self.state = VmLifecycle::Configured;
        info!(
            target: "vm",
            vm_id = %self.vm_id,
            vcpus = vm_config.machine.vcpu_count,
            mem_mib = vm_config.machine.mem_size_mib,
            "VM configured"
        );
        Ok(())
    }

    /// Attach a block device before boot.
    pub async fn add_drive(
        &mut self,
        drive_id: &str,
        host_path: &Path,
        is_root_device: bool,
        is_read_only: bool,
    ) -> Result<()> {
        self.expect_state("add a drive", &[VmLifecycle::Spawned, VmLifecycle::Configured])?;
        let drive = Drive {
            drive_id: drive_id.to_string(),
            path_on_host: self.jail.place(host_path)?,
            is_root_device,
            is_read_only,
            partuuid: None,
            rate_limiter: None,
        };
        let resp = self.client()?.add_drive(&drive).await?;
        config_result(&format!("drive {}", drive_id), resp)?;
        if !self.drives.iter().any(|d| d == drive_id) {
            self.drives.push(drive_id.to_string());
        }
        Ok(())
    }

    /// Swap the backing file of an attached drive on a live VM.
    pub async fn patch_drive(&mut self, drive_id: &str, host_path: &Path) -> Result<()> {
        self.expect_state("patch a drive", &[VmLifecycle::Running, VmLifecycle::Paused])?;
        let patch = DrivePatch {
            drive_id: drive_id.to_string(),
            path_on_host: Some(self.jail.place(host_path)?),
            rate_limiter: None,
        };
        self.client()?.patch_drive(&patch).await?.into_result()?;
        Ok(())
    }

    /// Create the host tap for `iface` and register the guest interface.
    pub async fn add_net_iface(&mut self, iface: &NetIfaceConfig) -> Result<()> {
        self.expect_state(
            "add a network interface",
            &[VmLifecycle::Spawned, VmLifecycle::Configured],
        )?;
        self.setup_tap(iface).await?;
        let body = NetworkInterface {
            iface_id: iface.iface_id().to_string(),
            host_dev_name: iface.tap_name.clone(),
            guest_mac: Some(iface.guest_mac()?),
            rx_rate_limiter: None,
            tx_rate_limiter: None,
        };
        let resp = self.client()?.add_network_interface(&body).await?;
        config_result(&format!("network interface {}", iface.iface_id()), resp)?;
        self.ifaces.push(iface.clone());
        Ok(())
    }

    /// Host side only: create the tap a restored guest expects to find. The
    /// interface itself is already part of the snapshot's device state.
    pub async fn restore_net_iface(&mut self, iface: &NetIfaceConfig) -> Result<()> {
        self.expect_state("restore a network interface", &[VmLifecycle::Spawned])?;
        self.setup_tap(iface).await?;
        self.ifaces.push(iface.clone());
        Ok(())
    }

    async fn setup_tap(&mut self, iface: &NetIfaceConfig) -> Result<()> {
        let netns = self.config.jailer.as_ref().and_then(|j| j.netns.as_deref());
        let tap = Tap::create(&iface.tap_name, netns, &iface.host_ip, iface.netmask_len).await?;
        self.taps.push(tap);
        Ok(())
    }

    /// Attached block + net devices.
    pub fn device_count(&self) -> usize {
        self.drives.len() + self.ifaces.len()
    }

    pub fn net_ifaces(&self) -> &[NetIfaceConfig] {
        &self.ifaces
    }

    pub async fn configure_mmds(&mut self, version: MmdsVersion, iface_ids: &[&str]) -> Result<()> {
        self.expect_state("configure MMDS", &[VmLifecycle::Spawned, VmLifecycle::Configured])?;
        let body = MmdsConfig {
            version,
            network_interfaces: iface_ids.iter().map(|s| s.to_string()).collect(),
            ipv4_address: None,
        };
        let resp = self.client()?.set_mmds_config(&body).await?;
        config_result("mmds config", resp)
    }

    pub async fn put_mmds(&self, data: &Value) -> Result<()> {
        self.client()?.put_mmds(data).await?.into_result()?;
        Ok(())
    }

    pub async fn get_mmds(&self) -> Result<Value> {
        self.client()?.get_mmds().await?.into_result()?.json()
    }

    /// Issue `InstanceStart` and hand back the raw answer. The state advances
    /// only on success, so callers can probe an expected rejection.
    pub async fn try_start(&mut self) -> Result<ApiResponse> {
        self.expect_state("start", &[VmLifecycle::Configured])?;
        let resp = self.client()?.put_action(&InstanceAction::InstanceStart).await?;
        if resp.is_success() {
            self.state = VmLifecycle::Running;
            info!(target: "vm", vm_id = %self.vm_id, "VM started");
        }
        Ok(resp)
    }

    pub async fn start(&mut self) -> Result<()> {
        self.try_start().await?.into_result()?;
        Ok(())
    }

    pub async fn pause(&mut self) -> Result<()> {
        self.expect_state("pause", &[VmLifecycle::Running])?;
        self.client()?
            .patch_vm_state(VmRunState::Paused)
            .await?
            .into_result()?;
        self.state = VmLifecycle::Paused;
        Ok(())
    }

    pub async fn resume(&mut self) -> Result<()> {
        self.expect_state("resume", &[VmLifecycle::Paused])?;
        self.client()?
            .patch_vm_state(VmRunState::Resumed)
            .await?
            .into_result()?;
        self.state = VmLifecycle::Running;
        Ok(())
    }

    /// Pause if needed, then ask for a snapshot and return the raw answer.
    pub async fn try_pause_to_snapshot(&mut self, request: &SnapshotCreate) -> Result<ApiResponse> {
        self.expect_state(
            "snapshot",
            &[VmLifecycle::Running, VmLifecycle::Paused],
        )?;
        if self.state == VmLifecycle::Running {
            self.pause().await?;
        }
        self.client()?.create_snapshot(request).await
    }

    /// Pause and write memory + device state to the given VMM-visible paths.
    pub async fn pause_to_snapshot(
        &mut self,
        mem_file_path: &str,
        snapshot_path: &str,
        kind: SnapshotKindParam,
        version: Option<&str>,
    ) -> Result<()> {
        let request = SnapshotCreate {
            snapshot_path: snapshot_path.to_string(),
            mem_file_path: mem_file_path.to_string(),
            snapshot_type: Some(kind),
            version: version.map(String::from),
        };
        let resp = self.try_pause_to_snapshot(&request).await?;
        if resp.is_success() {
            info!(target: "vm", vm_id = %self.vm_id, ?kind, "snapshot created");
            return Ok(());
        }
        Err(snapshot_error(resp))
    }

    /// Load a snapshot into a freshly spawned VMM. The VM ends up paused.
    pub async fn load_snapshot(&mut self, request: &SnapshotLoad) -> Result<()> {
        self.expect_state("load a snapshot", &[VmLifecycle::Spawned])?;
        let resp = self.client()?.load_snapshot(request).await?;
        if !resp.is_success() {
            return Err(Error::Restore(format!(
                "snapshot load answered {}: {}",
                resp.status.as_u16(),
                resp.fault_message()
            )));
        }
        self.state = if request.resume_vm == Some(true) {
            VmLifecycle::Running
        } else {
            VmLifecycle::Paused
        };
        Ok(())
    }

    /// Make a host file visible to the VMM; returns the path to give the API.
    pub fn create_jailed_resource(&self, host_path: &Path) -> Result<String> {
        Ok(self.jail.place(host_path)?)
    }

    /// Create the metrics FIFO, start draining it and point the VMM at it.
    pub async fn attach_metrics(&mut self) -> Result<MetricsReader> {
        self.expect_state(
            "attach metrics",
            &[VmLifecycle::Spawned, VmLifecycle::Configured],
        )?;
        if let Some(reader) = &self.metrics {
            return Ok(reader.clone());
        }
        let fifo = self.jail.host_root().join(METRICS_FIFO_NAME);
        let reader = MetricsReader::open(&fifo)?;
        self.jail.hand_over(&fifo)?;
        let body = Metrics {
            metrics_path: self.jail.visible_path(METRICS_FIFO_NAME),
        };
        let resp = self.client()?.set_metrics(&body).await?;
        if let Err(e) = config_result("metrics", resp) {
            reader.stop();
            return Err(e);
        }
        self.metrics = Some(reader.clone());
        Ok(reader)
    }

    pub fn metrics(&self) -> Option<&MetricsReader> {
        self.metrics.as_ref()
    }

    /// Every metrics record the VMM has emitted so far.
    pub fn get_all_metrics(&self) -> Result<Vec<Value>> {
        self.metrics
            .as_ref()
            .map(MetricsReader::all)
            .ok_or_else(|| Error::precondition(format!("vm {} has no metrics sink", self.vm_id)))
    }

    /// Force a metrics flush and return the record it produced.
    pub async fn flush_metrics(&self) -> Result<Value> {
        let reader = self
            .metrics
            .as_ref()
            .ok_or_else(|| Error::precondition(format!("vm {} has no metrics sink", self.vm_id)))?;
        let seen = reader.len();
        self.client()?
            .put_action(&InstanceAction::FlushMetrics)
            .await?
            .into_result()?;
        if !reader.wait_beyond(seen, FLUSH_WAIT).await {
            return Err(Error::Timeout {
                method: "FlushMetrics".to_string(),
                path: reader.path().display().to_string(),
                budget: FLUSH_WAIT,
            });
        }
        reader
            .all()
            .pop()
            .ok_or_else(|| Error::precondition("metrics record vanished"))
    }

    pub fn set_ssh_config(&mut self, ssh: SshConfig) {
        self.ssh = Some(ssh);
    }

    pub fn ssh(&self) -> Result<SshConnection> {
        self.ssh
            .clone()
            .map(SshConnection::new)
            .ok_or_else(|| Error::precondition(format!("vm {} has no ssh config", self.vm_id)))
    }

    /// Terminate the VMM: SIGTERM, bounded wait, then SIGKILL. Idempotent.
    ///
    /// The jail stays on disk so snapshot files written there survive; it is
    /// removed when the handle is dropped.
    pub async fn kill(&mut self) -> Result<()> {
        if self.state == VmLifecycle::Killed {
            return Ok(());
        }
        if let Some(reader) = &self.metrics {
            reader.stop();
        }
        let timeout = Duration::from_millis(self.config.kill_timeout_ms);
        let child_pid = self.process.as_ref().and_then(Child::id);

        if let Some(pid) = self.pid {
            info!(target: "vm", vm_id = %self.vm_id, pid, "killing Firecracker process");
            let gone = match self.process.as_mut() {
                Some(child) if child_pid == Some(pid) => terminate_child(child, pid, timeout).await,
                _ => graceful_kill_async(pid, timeout).await,
            };
            if !gone {
                return Err(Error::Kill {
                    pid,
                    reason: format!("still alive {:?} after SIGKILL", timeout),
                });
            }
        }

        // Reap whatever is left (the daemonizing jailer has already exited).
        if let Some(mut child) = self.process.take() {
            let _ = child.start_kill();
            let _ = tokio::time::timeout(timeout, child.wait()).await;
        }

        for tap in self.taps.drain(..) {
            let _ = tap.delete().await;
        }
        self.client = None;
        self.state = VmLifecycle::Killed;
        Ok(())
    }
}

async fn terminate_child(child: &mut Child, pid: u32, timeout: Duration) -> bool {
    let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
    if tokio::time::timeout(timeout, child.wait()).await.is_ok() {
        return true;
    }
    debug!(pid, "process ignored SIGTERM, sending SIGKILL");
    let _ = child.start_kill();
    tokio::time::timeout(timeout, child.wait()).await.is_ok()
}

impl Drop for VmHandle {
    fn drop(&mut self) {
        if let Some(reader) = &self.metrics {
            reader.stop();
        }
        if self.state.has_process() {
            if let Some(pid) = self.pid {
                let _ = kill(Pid::from_raw(pid as i32), Signal::SIGKILL);
            }
            if let Some(child) = self.process.as_mut() {
                let _ = child.start_kill();
            }
        }
        self.jail.cleanup();
    }
}

/// Pre-boot configuration calls answer 204 and nothing else.
fn config_result(resource: &str, resp: ApiResponse) -> Result<()> {
    if resp.is_no_content() {
        return Ok(());
    }
    Err(Error::Config {
        resource: resource.to_string(),
        status: resp.status.as_u16(),
        message: resp.fault_message(),
    })
}

fn snapshot_error(resp: ApiResponse) -> Error {
    let message = resp.fault_message();
    if message.contains(faults::INVALID_VERSION_FORMAT)
        || message.contains(faults::CANNOT_TRANSLATE_VERSION)
    {
        return Error::VersionIncompatible(message);
    }
    Error::Api {
        method: resp.method.to_string(),
        path: resp.path,
        status: resp.status.as_u16(),
        message,
    }
}

/// Strip Firecracker's timestamp and instance prefix from a log line.
///
/// "2025-11-15T17:18:55.027478889 [anonymous-instance:main] message" -> "message"
fn strip_firecracker_prefix(line: &str) -> &str {
    let mut result = line;

    if let Some(pos) = result.find(' ') {
        if result.starts_with("20") && result.chars().nth(4) == Some('-') {
            result = &result[pos + 1..];
        }
    }

    if result.starts_with('[') {
        if let Some(end_pos) = result.find("] ") {
            result = &result[end_pos + 2..];
        }
    }

    result
}
