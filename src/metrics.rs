//! Firecracker metrics: the FIFO stream, schema checks and flattening for export.
//!
//! The VMM writes one JSON object per line to its metrics path each time it
//! flushes (periodically, and on a `FlushMetrics` action).

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Accumulates every record the VMM writes to a metrics FIFO.
///
/// Cheap to clone; all clones share the same record list. The drain task
/// stops when [`MetricsReader::stop`] is called.
#[derive(Debug, Clone)]
pub struct MetricsReader {
    path: PathBuf,
    records: Arc<Mutex<Vec<Value>>>,
    notify: Arc<Notify>,
    cancel: CancellationToken,
}

impl MetricsReader {
    /// Create the FIFO at `path` and start draining it.
    ///
    /// The FIFO is opened read-write so the writer side never sees ENXIO and
    /// the reader never sees EOF between VMM flushes.
    pub fn open(path: &Path) -> Result<Self> {
        use nix::sys::stat::Mode;
        nix::unistd::mkfifo(path, Mode::from_bits_truncate(0o666))
            .with_context(|| format!("creating metrics FIFO {}", path.display()))?;

        let receiver = tokio::net::unix::pipe::OpenOptions::new()
            .read_write(true)
            .open_receiver(path)
            .with_context(|| format!("opening metrics FIFO {}", path.display()))?;

        let reader = Self {
            path: path.to_path_buf(),
            records: Arc::new(Mutex::new(Vec::new())),
            notify: Arc::new(Notify::new()),
            cancel: CancellationToken::new(),
        };

        let records = reader.records.clone();
        let notify = reader.notify.clone();
        let cancel = reader.cancel.clone();
        let fifo = reader.path.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(receiver).lines();
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    line = lines.next_line() => match line {
                        Ok(Some(line)) if line.trim().is_empty() => {}
                        Ok(Some(line)) => match serde_json::from_str::<Value>(&line) {
                            Ok(record) => {
                                if let Ok(mut all) = records.lock() {
                                    all.push(record);
                                }
                                notify.notify_waiters();
                            }
                            Err(e) => warn!(target: "metrics", error = %e, "skipping malformed metrics line"),
                        },
                        Ok(None) => break,
                        Err(e) => {
                            warn!(target: "metrics", fifo = %fifo.display(), error = %e, "metrics FIFO read failed");
                            break;
                        }
                    },
                }
            }
            debug!(target: "metrics", fifo = %fifo.display(), "metrics drain stopped");
        });

        Ok(reader)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Every record received so far, oldest first.
    pub fn all(&self) -> Vec<Value> {
        self.records.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait until more than `seen` records exist; `false` on timeout.
    pub async fn wait_beyond(&self, seen: usize, timeout: Duration) -> bool {
        let wait = async {
            loop {
                let notified = self.notify.notified();
                if self.len() > seen {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, wait).await.is_ok()
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

/// Required numeric fields per metrics group.
const REQUIRED_FIELDS: &[(&str, &[&str])] = &[
    (
        "api_server",
        &[
            "process_startup_time_us",
            "process_startup_time_cpu_us",
            "sync_response_fails",
            "sync_vmm_send_timeout_count",
        ],
    ),
    (
        "balloon",
        &[
            "activate_fails",
            "inflate_count",
            "stats_updates_count",
            "stats_update_fails",
            "deflate_count",
            "event_fails",
        ],
    ),
    (
        "block",
        &[
            "activate_fails",
            "cfg_fails",
            "no_avail_buffer",
            "event_fails",
            "execute_fails",
            "invalid_reqs_count",
            "flush_count",
            "queue_event_count",
            "rate_limiter_event_count",
            "update_count",
            "update_fails",
            "read_bytes",
            "write_bytes",
            "read_count",
            "write_count",
            "rate_limiter_throttled_events",
            "io_engine_throttled_events",
        ],
    ),
    (
        "deprecated_api",
        &["deprecated_http_api_calls", "deprecated_cmd_line_api_calls"],
    ),
    (
        "get_api_requests",
        &[
            "instance_info_count",
            "machine_cfg_count",
            "mmds_count",
            "vmm_version_count",
        ],
    ),
    (
        "i8042",
        &[
            "error_count",
            "missed_read_count",
            "missed_write_count",
            "read_count",
            "reset_count",
            "write_count",
        ],
    ),
    (
        "latencies_us",
        &[
            "full_create_snapshot",
            "diff_create_snapshot",
            "load_snapshot",
            "pause_vm",
            "resume_vm",
            "vmm_full_create_snapshot",
            "vmm_diff_create_snapshot",
            "vmm_load_snapshot",
            "vmm_pause_vm",
            "vmm_resume_vm",
        ],
    ),
    (
        "logger",
        &[
            "missed_metrics_count",
            "metrics_fails",
            "missed_log_count",
            "log_fails",
        ],
    ),
    (
        "mmds",
        &[
            "rx_accepted",
            "rx_accepted_err",
            "rx_accepted_unusual",
            "rx_bad_eth",
            "rx_count",
            "tx_bytes",
            "tx_count",
            "tx_errors",
            "tx_frames",
            "connections_created",
            "connections_destroyed",
        ],
    ),
    (
        "net",
        &[
            "activate_fails",
            "cfg_fails",
            "mac_address_updates",
            "no_rx_avail_buffer",
            "no_tx_avail_buffer",
            "event_fails",
            "rx_queue_event_count",
            "rx_event_rate_limiter_count",
            "rx_partial_writes",
            "rx_rate_limiter_throttled",
            "rx_tap_event_count",
            "rx_bytes_count",
            "rx_packets_count",
            "rx_fails",
            "rx_count",
            "tap_read_fails",
            "tap_write_fails",
            "tx_bytes_count",
            "tx_malformed_frames",
            "tx_fails",
            "tx_count",
            "tx_packets_count",
            "tx_partial_reads",
            "tx_queue_event_count",
            "tx_rate_limiter_event_count",
            "tx_rate_limiter_throttled",
            "tx_spoofed_mac_count",
        ],
    ),
    (
        "patch_api_requests",
        &[
            "drive_count",
            "drive_fails",
            "network_count",
            "network_fails",
            "machine_cfg_count",
            "machine_cfg_fails",
            "mmds_count",
            "mmds_fails",
        ],
    ),
    (
        "put_api_requests",
        &[
            "actions_count",
            "actions_fails",
            "boot_source_count",
            "boot_source_fails",
            "drive_count",
            "drive_fails",
            "logger_count",
            "logger_fails",
            "machine_cfg_count",
            "machine_cfg_fails",
            "cpu_cfg_count",
            "cpu_cfg_fails",
            "metrics_count",
            "metrics_fails",
            "network_count",
            "network_fails",
            "mmds_count",
            "mmds_fails",
            "vsock_count",
            "vsock_fails",
        ],
    ),
    ("seccomp", &["num_faults"]),
    (
        "vcpu",
        &[
            "exit_io_in",
            "exit_io_out",
            "exit_mmio_read",
            "exit_mmio_write",
            "failures",
        ],
    ),
    ("vmm", &["device_events", "panic_count"]),
    (
        "uart",
        &[
            "error_count",
            "flush_count",
            "missed_read_count",
            "missed_write_count",
            "read_count",
            "write_count",
        ],
    ),
    (
        "signals",
        &[
            "sigbus", "sigsegv", "sigxfsz", "sigxcpu", "sigpipe", "sighup", "sigill",
        ],
    ),
    (
        "vsock",
        &[
            "activate_fails",
            "cfg_fails",
            "rx_queue_event_fails",
            "tx_queue_event_fails",
            "ev_queue_event_fails",
            "muxer_event_fails",
            "conn_event_fails",
            "rx_queue_event_count",
            "tx_queue_event_count",
            "rx_bytes_count",
            "tx_bytes_count",
            "rx_packets_count",
            "tx_packets_count",
            "conns_added",
            "conns_killed",
            "conns_removed",
            "killq_resync",
            "tx_flush_fails",
            "tx_write_fails",
            "rx_read_fails",
        ],
    ),
    (
        "entropy",
        &[
            "activate_fails",
            "entropy_event_fails",
            "entropy_event_count",
            "entropy_bytes",
            "host_rng_fails",
            "entropy_rate_limiter_throttled",
            "rate_limiter_event_count",
        ],
    ),
];

const AARCH64_REQUIRED: (&str, &[&str]) =
    ("rtc", &["error_count", "missed_read_count", "missed_write_count"]);

const VHOST_USER_REQUIRED: &[&str] = &[
    "activate_fails",
    "cfg_fails",
    "init_time_us",
    "activate_time_us",
    "config_change_time_us",
];

/// Maximum allowed skew between a record's `utc_timestamp_ms` and now.
pub const MAX_TIMESTAMP_SKEW_MS: i64 = 1000;

/// Check a record against the required schema. Returns every violation found;
/// an empty list means the record is valid.
pub fn validate(record: &Value, now_ms: i64, arch: &str) -> Vec<String> {
    let mut problems = Vec::new();

    match record.get("utc_timestamp_ms").and_then(Value::as_i64) {
        Some(ts) if (now_ms - ts).abs() < MAX_TIMESTAMP_SKEW_MS => {}
        Some(ts) => problems.push(format!(
            "utc_timestamp_ms {} is {}ms away from now",
            ts,
            (now_ms - ts).abs()
        )),
        None => problems.push("'utc_timestamp_ms' is a required property".to_string()),
    }

    let vhost_groups: Vec<String> = record
        .as_object()
        .map(|o| {
            o.keys()
                .filter(|k| k.starts_with("vhost_user_"))
                .cloned()
                .collect()
        })
        .unwrap_or_default();
    let mut groups: Vec<(&str, &[&str])> = REQUIRED_FIELDS.to_vec();
    if arch == "aarch64" {
        groups.push(AARCH64_REQUIRED);
    }
    for name in &vhost_groups {
        groups.push((name.as_str(), VHOST_USER_REQUIRED));
    }

    for (group, fields) in groups {
        let Some(body) = record.get(group).and_then(Value::as_object) else {
            problems.push(format!("'{}' is a required property", group));
            continue;
        };
        for field in fields {
            match body.get(*field) {
                Some(v) if v.is_number() => {}
                Some(_) => problems.push(format!("{}.{} is not a number", group, field)),
                None => problems.push(format!("'{}' is a required property", field)),
            }
        }
    }

    problems
}

/// Current time as milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Unit {
    Bytes,
    Milliseconds,
    Microseconds,
    Count,
}

/// Unit for a dotted metrics key. Every segment is checked, so a unit can come
/// from the group (`latencies_us.pause_vm`) or the field.
pub fn unit_for_key(full_key: &str) -> Unit {
    for key in full_key.to_lowercase().split('.') {
        if key.ends_with("_bytes") || key.ends_with("_bytes_count") {
            return Unit::Bytes;
        }
        if key.ends_with("_ms") {
            return Unit::Milliseconds;
        }
        if key.ends_with("_us") {
            return Unit::Microseconds;
        }
    }
    Unit::Count
}

/// One exported data point.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricPoint {
    pub name: String,
    pub value: Value,
    pub unit: Unit,
}

pub const EXPORT_PREFIX: &str = "fc_metrics";

/// Groups holding store-once values that never change after being set.
const EXPORT_ONCE_GROUPS: &[&str] = &["api_server", "latencies_us"];

/// Flattens records into `fc_metrics.<group>.<key>` points.
///
/// Remembers which export-once groups it has already emitted, so feed every
/// record of one VM through the same flattener.
#[derive(Debug, Default)]
pub struct Flattener {
    exported_once: HashSet<String>,
}

impl Flattener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn flatten(&mut self, record: &Value) -> Vec<MetricPoint> {
        let mut points = Vec::new();
        let Some(groups) = record.as_object() else {
            return points;
        };
        for (group, body) in groups {
            if group == "utc_timestamp_ms" || self.exported_once.contains(group) {
                continue;
            }
            walk(group, body, &mut points);
            if EXPORT_ONCE_GROUPS.contains(&group.as_str()) {
                self.exported_once.insert(group.clone());
            }
        }
        points
    }
}

fn walk(key: &str, value: &Value, out: &mut Vec<MetricPoint>) {
    match value {
        Value::Object(map) => {
            for (k, v) in map {
                walk(&format!("{}.{}", key, k), v, out);
            }
        }
        other => out.push(MetricPoint {
            name: format!("{}.{}", EXPORT_PREFIX, key),
            value: other.clone(),
            unit: unit_for_key(key),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    fn full_record(ts: i64) -> Value {
        let mut record = serde_json::Map::new();
        record.insert("utc_timestamp_ms".to_string(), json!(ts));
        for (group, fields) in REQUIRED_FIELDS {
            let body: serde_json::Map<String, Value> =
                fields.iter().map(|f| (f.to_string(), json!(0))).collect();
            record.insert(group.to_string(), Value::Object(body));
        }
        Value::Object(record)
    }

    #[test]
    fn test_validate_full_record() {
        let now = now_ms();
        assert!(validate(&full_record(now), now, "x86_64").is_empty());
    }

    #[test]
    fn test_validate_reports_missing_field() {
        let now = now_ms();
        let mut record = full_record(now);
        record["api_server"]
            .as_object_mut()
            .unwrap()
            .remove("process_startup_time_us");
        let problems = validate(&record, now, "x86_64");
        assert_eq!(
            problems,
            vec!["'process_startup_time_us' is a required property".to_string()]
        );
    }

    #[test]
    fn test_validate_timestamp_skew() {
        let now = now_ms();
        let problems = validate(&full_record(now - 5000), now, "x86_64");
        assert_eq!(problems.len(), 1);
        assert!(problems[0].contains("5000ms"));
    }

    #[test]
    fn test_validate_arch_and_vhost_groups() {
        let now = now_ms();
        let mut record = full_record(now);
        record["vhost_user_block_0"] = json!({"activate_fails": 0});
        let problems = validate(&record, now, "aarch64");
        assert!(problems.contains(&"'rtc' is a required property".to_string()));
        assert!(problems.contains(&"'activate_time_us' is a required property".to_string()));
    }

    #[test]
    fn test_unit_for_key() {
        assert_eq!(unit_for_key("block.read_bytes"), Unit::Bytes);
        assert_eq!(unit_for_key("net.rx_bytes_count"), Unit::Bytes);
        assert_eq!(unit_for_key("latencies_us.pause_vm"), Unit::Microseconds);
        assert_eq!(unit_for_key("api_server.process_startup_time_us"), Unit::Microseconds);
        assert_eq!(unit_for_key("foo.elapsed_ms"), Unit::Milliseconds);
        assert_eq!(unit_for_key("vcpu.exit_io_in"), Unit::Count);
    }

    #[test]
    fn test_flatten_skips_timestamp_and_exports_once() {
        let record = json!({
            "utc_timestamp_ms": 1,
            "api_server": {"process_startup_time_us": 10},
            "block": {"read_bytes": 4096, "nested": {"count": 2}},
        });
        let mut flattener = Flattener::new();
        let first = flattener.flatten(&record);
        let names: Vec<&str> = first.iter().map(|p| p.name.as_str()).collect();
        assert!(names.contains(&"fc_metrics.api_server.process_startup_time_us"));
        assert!(names.contains(&"fc_metrics.block.read_bytes"));
        assert!(names.contains(&"fc_metrics.block.nested.count"));
        assert!(!names.iter().any(|n| n.contains("utc_timestamp_ms")));

        let second = flattener.flatten(&record);
        assert!(second.iter().all(|p| !p.name.contains("api_server")));
        assert_eq!(second.len(), 2);
    }

    #[tokio::test]
    async fn test_reader_collects_lines() {
        let dir = tempfile::tempdir().unwrap();
        let fifo = dir.path().join("metrics.fifo");
        let reader = MetricsReader::open(&fifo).unwrap();

        let mut writer = std::fs::OpenOptions::new().write(true).open(&fifo).unwrap();
        writeln!(writer, "{}", json!({"utc_timestamp_ms": 1})).unwrap();
        writeln!(writer, "not json").unwrap();
        writeln!(writer, "{}", json!({"utc_timestamp_ms": 2})).unwrap();
        drop(writer);

        assert!(reader.wait_beyond(1, Duration::from_secs(5)).await);
        let all = reader.all();
        assert_eq!(all.len(), 2);
        assert_eq!(all[1]["utc_timestamp_ms"], 2);

        // The read-write open keeps the stream alive after a writer closes.
        let mut writer = std::fs::OpenOptions::new().write(true).open(&fifo).unwrap();
        writeln!(writer, "{}", json!({"utc_timestamp_ms": 3})).unwrap();
        assert!(reader.wait_beyond(2, Duration::from_secs(5)).await);
        reader.stop();
    }
}
