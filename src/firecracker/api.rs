use hyper::{Body, Client, Method, Request, StatusCode};
use hyperlocal::{UnixConnector, Uri as UnixUri};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::error::{Error, Result};

/// Fault strings returned verbatim by the control plane.
pub mod faults {
    pub const INVALID_VERSION_FORMAT: &str = "Invalid microVM version format";
    pub const CANNOT_TRANSLATE_VERSION: &str =
        "Cannot translate microVM version to snapshot data version";
    pub const TOO_MANY_DEVICES: &str = "Too many devices attached";
    pub const MMDS_TOKEN_INVALID: &str = "MMDS token not valid.";
}

/// Budget for a single control-plane round trip unless a caller overrides it.
pub const MAX_API_CALL_DURATION: Duration = Duration::from_millis(100);

/// Firecracker API client speaking HTTP over the VMM's unix socket.
///
/// Every call is bounded by `request_timeout`; `None` means untimed, which is
/// what snapshot create/load use since their duration scales with guest memory.
/// Non-2xx answers are returned as [`ApiResponse`], never as errors.
#[derive(Debug, Clone)]
pub struct FirecrackerClient {
    socket_path: PathBuf,
    client: Client<UnixConnector>,
    request_timeout: Option<Duration>,
}

impl FirecrackerClient {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        // Connection failures surface to the caller; hyper must not replay them.
        let client = Client::builder()
            .pool_max_idle_per_host(10)
            .retry_canceled_requests(false)
            .build(UnixConnector);
        Self {
            socket_path: socket_path.into(),
            client,
            request_timeout: Some(MAX_API_CALL_DURATION),
        }
    }

    /// Return a clone with a different request budget.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        Self {
            socket_path: self.socket_path.clone(),
            client: self.client.clone(),
            request_timeout: Some(timeout),
        }
    }

    /// Return a clone whose calls are never cut short.
    pub fn untimed(&self) -> Self {
        Self {
            socket_path: self.socket_path.clone(),
            client: self.client.clone(),
            request_timeout: None,
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.request_timeout
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Build Unix socket URI for Firecracker API
    fn uri(&self, path: &str) -> hyper::Uri {
        UnixUri::new(&self.socket_path, path).into()
    }

    /// Issue one request and collect the whole response within the budget.
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<String>,
    ) -> Result<ApiResponse> {
        let mut builder = Request::builder().method(method.clone()).uri(self.uri(path));
        if body.is_some() {
            builder = builder.header("Content-Type", "application/json");
        }
        builder = builder.header("Accept", "application/json");
        let req = builder
            .body(body.map(Body::from).unwrap_or_else(Body::empty))
            .map_err(|e| Error::precondition(format!("invalid request {} {}: {}", method, path, e)))?;

        let exchange = async {
            let resp = self.client.request(req).await?;
            let status = resp.status();
            let bytes = hyper::body::to_bytes(resp.into_body()).await?;
            Ok::<_, hyper::Error>((status, bytes))
        };

        let outcome = match self.request_timeout {
            Some(budget) => tokio::time::timeout(budget, exchange)
                .await
                .map_err(|_| Error::Timeout {
                    method: method.to_string(),
                    path: path.to_string(),
                    budget,
                })?,
            None => exchange.await,
        };
        let (status, bytes) = outcome.map_err(|source| Error::Connection {
            socket: self.socket_path.clone(),
            source,
        })?;

        debug!(target: "fc-api", %method, path, status = status.as_u16(), "api call");
        Ok(ApiResponse {
            method,
            path: path.to_string(),
            status,
            body: String::from_utf8_lossy(&bytes).into_owned(),
        })
    }

    pub async fn get(&self, path: &str) -> Result<ApiResponse> {
        self.request(Method::GET, path, None).await
    }

    pub async fn put<T: Serialize + ?Sized>(&self, path: &str, body: &T) -> Result<ApiResponse> {
        let json = serde_json::to_string(body)?;
        self.request(Method::PUT, path, Some(json)).await
    }

    pub async fn patch<T: Serialize + ?Sized>(&self, path: &str, body: &T) -> Result<ApiResponse> {
        let json = serde_json::to_string(body)?;
        self.request(Method::PATCH, path, Some(json)).await
    }

    /// Instance description (`GET /`)
    pub async fn instance_info(&self) -> Result<ApiResponse> {
        self.get("/").await
    }

    pub async fn version(&self) -> Result<ApiResponse> {
        self.get("/version").await
    }

    /// Configure boot source (kernel + optional initrd)
    pub async fn set_boot_source(&self, config: &BootSource) -> Result<ApiResponse> {
        self.put("/boot-source", config).await
    }

    /// Configure machine (vCPU, memory)
    pub async fn set_machine_config(&self, config: &MachineConfig) -> Result<ApiResponse> {
        self.put("/machine-config", config).await
    }

    pub async fn get_machine_config(&self) -> Result<ApiResponse> {
        self.get("/machine-config").await
    }

    /// Add a drive (rootfs or data disk)
    pub async fn add_drive(&self, config: &Drive) -> Result<ApiResponse> {
        self.put(&format!("/drives/{}", config.drive_id), config).await
    }

    /// Swap a drive's backing file after boot
    pub async fn patch_drive(&self, patch: &DrivePatch) -> Result<ApiResponse> {
        self.patch(&format!("/drives/{}", patch.drive_id), patch)
            .await
    }

    pub async fn add_network_interface(&self, config: &NetworkInterface) -> Result<ApiResponse> {
        self.put(&format!("/network-interfaces/{}", config.iface_id), config)
            .await
    }

    /// Configure MMDS (metadata service)
    pub async fn set_mmds_config(&self, config: &MmdsConfig) -> Result<ApiResponse> {
        self.put("/mmds/config", config).await
    }

    /// Put data into MMDS (replaces entire MMDS content)
    pub async fn put_mmds(&self, data: &serde_json::Value) -> Result<ApiResponse> {
        self.put("/mmds", data).await
    }

    /// Patch data into MMDS (merges with existing MMDS content)
    pub async fn patch_mmds(&self, data: &serde_json::Value) -> Result<ApiResponse> {
        self.patch("/mmds", data).await
    }

    pub async fn get_mmds(&self) -> Result<ApiResponse> {
        self.get("/mmds").await
    }

    pub async fn create_snapshot(&self, config: &SnapshotCreate) -> Result<ApiResponse> {
        self.put("/snapshot/create", config).await
    }

    pub async fn load_snapshot(&self, config: &SnapshotLoad) -> Result<ApiResponse> {
        self.put("/snapshot/load", config).await
    }

    /// Perform an action (InstanceStart, FlushMetrics, etc.)
    pub async fn put_action(&self, action: &InstanceAction) -> Result<ApiResponse> {
        self.put("/actions", action).await
    }

    /// Change VM state (Pause/Resume)
    pub async fn patch_vm_state(&self, state: VmRunState) -> Result<ApiResponse> {
        self.patch("/vm", &VmStateChange { state }).await
    }

    /// Point the VMM's metrics output at a file or FIFO
    pub async fn set_metrics(&self, config: &Metrics) -> Result<ApiResponse> {
        self.put("/metrics", config).await
    }

    pub async fn set_logger(&self, config: &Logger) -> Result<ApiResponse> {
        self.put("/logger", config).await
    }

    /// Configure balloon device
    pub async fn set_balloon(&self, config: &Balloon) -> Result<ApiResponse> {
        self.put("/balloon", config).await
    }

    /// Configure entropy device (virtio-rng)
    pub async fn set_entropy_device(&self, config: &EntropyDevice) -> Result<ApiResponse> {
        self.put("/entropy", config).await
    }

    /// Configure vsock device for host-guest communication
    pub async fn set_vsock(&self, config: &Vsock) -> Result<ApiResponse> {
        self.put("/vsock", config).await
    }
}

/// A fully read control-plane response.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub method: Method,
    pub path: String,
    pub status: StatusCode,
    pub body: String,
}

impl ApiResponse {
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    pub fn is_ok(&self) -> bool {
        self.status == StatusCode::OK
    }

    pub fn is_no_content(&self) -> bool {
        self.status == StatusCode::NO_CONTENT
    }

    pub fn is_bad_request(&self) -> bool {
        self.status == StatusCode::BAD_REQUEST
    }

    pub fn is_not_found(&self) -> bool {
        self.status == StatusCode::NOT_FOUND
    }

    pub fn is_payload_too_large(&self) -> bool {
        self.status == StatusCode::PAYLOAD_TOO_LARGE
    }

    /// `fault_message` of an error body, or the raw body when it is not one.
    pub fn fault_message(&self) -> String {
        #[derive(Deserialize)]
        struct Fault {
            fault_message: String,
        }
        match serde_json::from_str::<Fault>(&self.body) {
            Ok(f) => f.fault_message,
            Err(_) => self.body.trim().to_string(),
        }
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_str(&self.body)?)
    }

    /// Turn a non-2xx answer into [`Error::Api`].
    pub fn into_result(self) -> Result<Self> {
        if self.is_success() {
            return Ok(self);
        }
        Err(Error::Api {
            method: self.method.to_string(),
            path: self.path.clone(),
            status: self.status.as_u16(),
            message: self.fault_message(),
        })
    }
}

// API data structures

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootSource {
    pub kernel_image_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initrd_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub boot_args: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MachineConfig {
    pub vcpu_count: u8,
    pub mem_size_mib: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub smt: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_template: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub track_dirty_pages: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Drive {
    pub drive_id: String,
    pub path_on_host: String,
    pub is_root_device: bool,
    pub is_read_only: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub partuuid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limiter: Option<RateLimiter>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DrivePatch {
    pub drive_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path_on_host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limiter: Option<RateLimiter>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkInterface {
    pub iface_id: String,
    pub host_dev_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub guest_mac: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rx_rate_limiter: Option<RateLimiter>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx_rate_limiter: Option<RateLimiter>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimiter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bandwidth: Option<TokenBucket>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ops: Option<TokenBucket>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenBucket {
    pub size: u64,
    pub refill_time: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum MmdsVersion {
    V1,
    V2,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MmdsConfig {
    pub version: MmdsVersion,
    pub network_interfaces: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ipv4_address: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SnapshotKindParam {
    Full,
    Diff,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotCreate {
    pub snapshot_path: String,
    pub mem_file_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot_type: Option<SnapshotKindParam>,
    /// Target VMM version the snapshot must be loadable by ("X.Y.Z")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotLoad {
    pub snapshot_path: String,
    pub mem_backend: MemBackend,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enable_diff_snapshots: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resume_vm: Option<bool>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum MemBackendType {
    File,
    Uffd,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemBackend {
    pub backend_path: String,
    pub backend_type: MemBackendType,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "action_type")]
pub enum InstanceAction {
    InstanceStart,
    SendCtrlAltDel,
    FlushMetrics,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum VmRunState {
    Paused,
    Resumed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmStateChange {
    pub state: VmRunState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metrics {
    pub metrics_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Logger {
    pub log_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub show_level: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub show_log_origin: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Balloon {
    pub amount_mib: u32,
    pub deflate_on_oom: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats_polling_interval_s: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntropyDevice {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limiter: Option<RateLimiter>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vsock {
    /// Guest CID (must be > 2, typically 3)
    pub guest_cid: u32,
    /// Path to Unix socket on host
    pub uds_path: String,
}

/// Body of `GET /`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceInfo {
    pub id: String,
    pub state: String,
    pub vmm_version: String,
    #[serde(default)]
    pub app_name: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(status: u16, body: &str) -> ApiResponse {
        ApiResponse {
            method: Method::PUT,
            path: "/snapshot/create".to_string(),
            status: StatusCode::from_u16(status).unwrap(),
            body: body.to_string(),
        }
    }

    #[test]
    fn test_status_classification() {
        assert!(response(204, "").is_no_content());
        assert!(response(204, "").is_success());
        assert!(!response(204, "").is_ok());
        assert!(response(200, "{}").is_ok());
        assert!(response(400, "").is_bad_request());
        assert!(response(404, "").is_not_found());
        assert!(response(413, "").is_payload_too_large());
        assert!(!response(400, "").is_success());
    }

    #[test]
    fn test_fault_message_extraction() {
        let resp = response(
            400,
            r#"{"fault_message":"Cannot translate microVM version to snapshot data version"}"#,
        );
        assert_eq!(resp.fault_message(), faults::CANNOT_TRANSLATE_VERSION);
        assert_eq!(response(500, " oops \n").fault_message(), "oops");
    }

    #[test]
    fn test_into_result_maps_rejection() {
        let err = response(400, r#"{"fault_message":"bad"}"#)
            .into_result()
            .unwrap_err();
        match err {
            Error::Api { status, message, path, .. } => {
                assert_eq!(status, 400);
                assert_eq!(message, "bad");
                assert_eq!(path, "/snapshot/create");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(response(204, "").into_result().is_ok());
    }

    #[test]
    fn test_snapshot_create_serialization() {
        let body = SnapshotCreate {
            snapshot_path: "/snapshot/vm.vmstate".to_string(),
            mem_file_path: "/snapshot/vm.mem".to_string(),
            snapshot_type: Some(SnapshotKindParam::Diff),
            version: Some("0.23.0".to_string()),
        };
        let json: serde_json::Value = serde_json::to_value(&body).unwrap();
        assert_eq!(json["snapshot_type"], "Diff");
        assert_eq!(json["version"], "0.23.0");

        let bare = SnapshotCreate {
            version: None,
            snapshot_type: None,
            ..body
        };
        let json = serde_json::to_string(&bare).unwrap();
        assert!(!json.contains("version"));
        assert!(!json.contains("snapshot_type"));
    }

    #[test]
    fn test_action_and_state_bodies() {
        let json = serde_json::to_string(&InstanceAction::FlushMetrics).unwrap();
        assert_eq!(json, r#"{"action_type":"FlushMetrics"}"#);
        let json = serde_json::to_string(&VmStateChange {
            state: VmRunState::Paused,
        })
        .unwrap();
        assert_eq!(json, r#"{"state":"Paused"}"#);
    }

    #[test]
    fn test_client_timeout_variants() {
        let client = FirecrackerClient::new("/tmp/none.socket");
        assert_eq!(client.timeout(), Some(MAX_API_CALL_DURATION));
        assert_eq!(client.untimed().timeout(), None);
        assert_eq!(
            client.with_timeout(Duration::from_secs(2)).timeout(),
            Some(Duration::from_secs(2))
        );
        assert_eq!(client.untimed().socket_path(), Path::new("/tmp/none.socket"));
    }
}
