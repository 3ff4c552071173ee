// Common test utilities for fctest integration tests: a mock Firecracker
// control plane served over a unix socket and a fake VMM binary.
#![allow(dead_code)]

use fctest::config::HarnessConfig;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use hyperlocal::UnixServerExt;
use serde_json::{json, Value};
use std::collections::{BTreeSet, HashMap};
use std::convert::Infallible;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

pub const PAGE: usize = 4096;
pub const GUEST_PAGES: usize = 4;
pub const MOCK_VERSION: &str = "1.4.0";

/// One request as the mock saw it.
#[derive(Debug, Clone)]
pub struct Recorded {
    pub method: String,
    pub path: String,
    pub body: String,
}

/// State behind one mock VMM. Guest memory is modelled as a few pages with
/// dirty tracking so full and diff snapshots produce realistic files.
#[derive(Debug)]
pub struct MockState {
    pub requests: Vec<Recorded>,
    pub overrides: HashMap<(String, String), (u16, String)>,
    pub delay: Option<Duration>,
    pub machine_config: Option<Value>,
    pub mmds: Value,
    pub devices: BTreeSet<String>,
    pub metrics_path: Option<PathBuf>,
    pub flushes: u64,
    pub memory: Vec<u8>,
    pub dirty: Vec<bool>,
    pub running: bool,
    pub loaded_diff_enabled: Option<bool>,
}

impl Default for MockState {
    fn default() -> Self {
        let mut memory = vec![0u8; PAGE * GUEST_PAGES];
        for (i, page) in memory.chunks_mut(PAGE).enumerate() {
            page.fill(i as u8 + 1);
        }
        Self {
            requests: Vec::new(),
            overrides: HashMap::new(),
            delay: None,
            machine_config: None,
            mmds: json!({}),
            devices: BTreeSet::new(),
            metrics_path: None,
            flushes: 0,
            memory,
            dirty: vec![true; GUEST_PAGES],
            running: false,
            loaded_diff_enabled: None,
        }
    }
}

fn ok(value: Value) -> (u16, String) {
    (200, value.to_string())
}

fn no_content() -> (u16, String) {
    (204, String::new())
}

pub fn fault(message: &str) -> String {
    json!({ "fault_message": message }).to_string()
}

fn bad_request(message: &str) -> (u16, String) {
    (400, fault(message))
}

impl MockState {
    /// Answer `method path` with a fixed status and body from now on.
    pub fn force(&mut self, method: &str, path: &str, status: u16, body: &str) {
        self.overrides
            .insert((method.to_string(), path.to_string()), (status, body.to_string()));
    }

    /// Simulate the guest writing `byte` over a whole page.
    pub fn write_guest(&mut self, page: usize, byte: u8) {
        self.memory[page * PAGE..(page + 1) * PAGE].fill(byte);
        self.dirty[page] = true;
    }

    pub fn page(&self, page: usize) -> &[u8] {
        &self.memory[page * PAGE..(page + 1) * PAGE]
    }

    pub fn count(&self, method: &str, path: &str) -> usize {
        self.requests
            .iter()
            .filter(|r| r.method == method && r.path == path)
            .count()
    }

    fn respond(&mut self, method: &Method, path: &str, body: &str) -> (u16, String) {
        self.requests.push(Recorded {
            method: method.to_string(),
            path: path.to_string(),
            body: body.to_string(),
        });
        if let Some(forced) = self.overrides.get(&(method.to_string(), path.to_string())) {
            return forced.clone();
        }
        let json: Value = serde_json::from_str(body).unwrap_or(Value::Null);

        match (method, path) {
            (&Method::GET, "/") => ok(json!({
                "id": "mock",
                "state": if self.running { "Running" } else { "Not started" },
                "vmm_version": MOCK_VERSION,
            })),
            (&Method::GET, "/version") => ok(json!({ "firecracker_version": MOCK_VERSION })),
            (&Method::GET, "/machine-config") => ok(self
                .machine_config
                .clone()
                .unwrap_or_else(|| json!({"vcpu_count": 1, "mem_size_mib": 128}))),
            (&Method::PUT, "/machine-config") => {
                self.machine_config = Some(json);
                no_content()
            }
            (&Method::GET, "/mmds") => ok(self.mmds.clone()),
            (&Method::PUT, "/mmds") => {
                self.mmds = json;
                no_content()
            }
            (&Method::PATCH, "/mmds") => {
                if let (Some(current), Some(patch)) = (self.mmds.as_object_mut(), json.as_object()) {
                    for (k, v) in patch {
                        current.insert(k.clone(), v.clone());
                    }
                }
                no_content()
            }
            (&Method::PUT, "/metrics") => {
                self.metrics_path = json["metrics_path"].as_str().map(PathBuf::from);
                no_content()
            }
            (&Method::PUT, "/actions") => self.action(&json),
            (&Method::PATCH, "/vm") => {
                self.running = json["state"] == "Resumed";
                no_content()
            }
            (&Method::PUT, "/snapshot/create") => self.snapshot_create(&json),
            (&Method::PUT, "/snapshot/load") => self.snapshot_load(&json),
            (&Method::PUT, p) if p.starts_with("/drives/") || p.starts_with("/network-interfaces/") => {
                self.devices.insert(p.to_string());
                no_content()
            }
            (&Method::GET, _) => ok(json!({})),
            _ => no_content(),
        }
    }

    fn action(&mut self, json: &Value) -> (u16, String) {
        match json["action_type"].as_str() {
            Some("InstanceStart") => {
                self.running = true;
                no_content()
            }
            Some("FlushMetrics") => {
                let Some(path) = self.metrics_path.clone() else {
                    return bad_request("metrics system not initialized");
                };
                self.flushes += 1;
                let record = json!({
                    "utc_timestamp_ms": chrono::Utc::now().timestamp_millis(),
                    "api_server": { "process_startup_time_us": 1000, "process_startup_time_cpu_us": 900 },
                    "latencies_us": { "full_create_snapshot": 12 },
                    "block": { "read_bytes": 4096 * self.flushes, "read_count": self.flushes },
                    "vcpu": { "exit_io_in": self.flushes },
                });
                let written = std::fs::OpenOptions::new()
                    .append(true)
                    .open(&path)
                    .and_then(|mut f| writeln!(f, "{}", record));
                match written {
                    Ok(()) => no_content(),
                    Err(e) => bad_request(&format!("writing metrics: {}", e)),
                }
            }
            _ => no_content(),
        }
    }

    fn check_version(&self, version: &str) -> Result<(), &'static str> {
        let parts: Result<Vec<u32>, _> = version.split('.').map(str::parse::<u32>).collect();
        let parts = match parts {
            Ok(p) if p.len() == 3 => p,
            _ => return Err("Invalid microVM version format"),
        };
        if (parts[0], parts[1]) < (0, 23) {
            return Err("Cannot translate microVM version to snapshot data version");
        }
        if (parts[0], parts[1]) == (0, 23) && self.devices.len() > 11 {
            return Err("Too many devices attached");
        }
        Ok(())
    }

    fn snapshot_create(&mut self, json: &Value) -> (u16, String) {
        if self.running {
            return bad_request("The microVM must be paused before creating a snapshot");
        }
        if let Some(version) = json["version"].as_str() {
            if let Err(msg) = self.check_version(version) {
                return bad_request(msg);
            }
        }
        let (Some(mem_path), Some(state_path)) =
            (json["mem_file_path"].as_str(), json["snapshot_path"].as_str())
        else {
            return bad_request("missing snapshot paths");
        };

        let diff = json["snapshot_type"] == "Diff";
        let mut mem = vec![0u8; self.memory.len()];
        for page in 0..GUEST_PAGES {
            if !diff || self.dirty[page] {
                mem[page * PAGE..(page + 1) * PAGE].copy_from_slice(self.page(page));
            }
        }
        let state = json!({
            "mmds": self.mmds,
            "devices": self.devices,
            "machine_config": self.machine_config,
        });
        if let Err(e) = std::fs::write(mem_path, &mem)
            .and_then(|_| std::fs::write(state_path, state.to_string()))
        {
            return bad_request(&format!("writing snapshot: {}", e));
        }
        self.dirty = vec![false; GUEST_PAGES];
        no_content()
    }

    fn snapshot_load(&mut self, json: &Value) -> (u16, String) {
        let state_path = json["snapshot_path"].as_str().unwrap_or_default();
        let mem_path = json["mem_backend"]["backend_path"].as_str().unwrap_or_default();
        let Ok(state) = std::fs::read_to_string(state_path) else {
            return bad_request(&format!("Cannot open snapshot file: {}", state_path));
        };
        let Ok(memory) = std::fs::read(mem_path) else {
            return bad_request(&format!("Cannot open memory file: {}", mem_path));
        };
        let Ok(state) = serde_json::from_str::<Value>(&state) else {
            return bad_request("Failed to deserialize the microVM state");
        };
        self.mmds = state["mmds"].clone();
        self.machine_config = Some(state["machine_config"].clone());
        self.devices = state["devices"]
            .as_array()
            .map(|a| a.iter().filter_map(|d| d.as_str().map(String::from)).collect())
            .unwrap_or_default();
        self.memory = memory;
        self.dirty = vec![false; GUEST_PAGES];
        self.loaded_diff_enabled = json["enable_diff_snapshots"].as_bool();
        self.running = json["resume_vm"].as_bool().unwrap_or(false);
        no_content()
    }
}

async fn handle(
    state: Arc<Mutex<MockState>>,
    req: Request<Body>,
) -> Result<Response<Body>, Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let bytes = hyper::body::to_bytes(req.into_body()).await.unwrap_or_default();
    let body = String::from_utf8_lossy(&bytes).into_owned();

    let delay = state.lock().unwrap().delay;
    if let Some(delay) = delay {
        tokio::time::sleep(delay).await;
    }
    let (status, body) = state.lock().unwrap().respond(&method, &path, &body);
    Ok(Response::builder()
        .status(StatusCode::from_u16(status).unwrap())
        .header("Content-Type", "application/json")
        .body(Body::from(body))
        .unwrap())
}

/// A mock control plane bound at one socket path.
#[derive(Clone)]
pub struct MockFirecracker {
    pub socket: PathBuf,
    pub state: Arc<Mutex<MockState>>,
}

impl MockFirecracker {
    pub fn serve(socket: &Path) -> anyhow::Result<Self> {
        let state = Arc::new(Mutex::new(MockState::default()));
        let shared = state.clone();
        let make_service = make_service_fn(move |_| {
            let shared = shared.clone();
            async move {
                Ok::<_, Infallible>(service_fn(move |req| handle(shared.clone(), req)))
            }
        });
        let server = Server::bind_unix(socket)?.serve(make_service);
        tokio::spawn(async move {
            let _ = server.await;
        });
        Ok(Self {
            socket: socket.to_path_buf(),
            state,
        })
    }

    pub fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }
}

/// Fake VMM plus a watcher that gives every spawned fake its own mock
/// control plane.
///
/// The fake VMM is a shell script that records its `--api-sock` argument and
/// then idles; the watcher binds a [`MockFirecracker`] at each recorded path.
pub struct MockFleet {
    pub dir: tempfile::TempDir,
    pub vmm: PathBuf,
    mocks: Arc<Mutex<Vec<MockFirecracker>>>,
    watcher: JoinHandle<()>,
}

impl MockFleet {
    pub fn start() -> anyhow::Result<Self> {
        let dir = tempfile::tempdir()?;
        let spawn_log = dir.path().join("spawned.log");
        std::fs::write(&spawn_log, "")?;

        let vmm = dir.path().join("fake-firecracker");
        std::fs::write(
            &vmm,
            format!(
                "#!/bin/sh\n\
                 while [ $# -gt 0 ]; do\n\
                 \x20 case \"$1\" in\n\
                 \x20   --api-sock) echo \"$2\" >> '{}'; shift 2 ;;\n\
                 \x20   *) shift ;;\n\
                 \x20 esac\n\
                 done\n\
                 exec sleep 60\n",
                spawn_log.display()
            ),
        )?;
        std::fs::set_permissions(&vmm, std::fs::Permissions::from_mode(0o755))?;

        let mocks: Arc<Mutex<Vec<MockFirecracker>>> = Arc::new(Mutex::new(Vec::new()));
        let registry = mocks.clone();
        let watcher = tokio::spawn(async move {
            let mut served = 0usize;
            loop {
                tokio::time::sleep(Duration::from_millis(5)).await;
                let Ok(content) = std::fs::read_to_string(&spawn_log) else {
                    continue;
                };
                for socket in content.lines().skip(served) {
                    match MockFirecracker::serve(Path::new(socket)) {
                        Ok(mock) => registry.lock().unwrap().push(mock),
                        Err(e) => eprintln!("mock bind at {} failed: {}", socket, e),
                    }
                    served += 1;
                }
            }
        });

        Ok(Self {
            dir,
            vmm,
            mocks,
            watcher,
        })
    }

    /// Harness config pointing at the fake VMM, with scratch space in the
    /// fleet's temp dir.
    pub fn config(&self) -> HarnessConfig {
        HarnessConfig {
            firecracker_bin: self.vmm.clone(),
            work_dir: self.dir.path().join("work"),
            api_timeout_ms: 1000,
            spawn_wait_retries: 400,
            spawn_wait_delay_ms: 10,
            kill_timeout_ms: 2000,
            ..Default::default()
        }
    }

    /// The mock serving `socket`, waiting briefly for the watcher to bind it.
    pub async fn mock(&self, socket: &Path) -> MockFirecracker {
        for _ in 0..200 {
            if let Some(mock) = self
                .mocks
                .lock()
                .unwrap()
                .iter()
                .find(|m| m.socket == socket)
                .cloned()
            {
                return mock;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("no mock VMM bound at {}", socket.display());
    }

    pub fn spawned(&self) -> usize {
        self.mocks.lock().unwrap().len()
    }

    /// Most recently bound mock.
    pub fn latest(&self) -> Option<MockFirecracker> {
        self.mocks.lock().unwrap().last().cloned()
    }
}

impl Drop for MockFleet {
    fn drop(&mut self) {
        self.watcher.abort();
    }
}

/// Write `len` bytes of `byte` to `dir/name` and return the path.
pub fn scratch_file(dir: &Path, name: &str, byte: u8, len: usize) -> PathBuf {
    std::fs::create_dir_all(dir).unwrap();
    let path = dir.join(name);
    std::fs::write(&path, vec![byte; len]).unwrap();
    path
}
