//! Background sampler forwarding a VM's metrics to a telemetry sink.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::firecracker::api::InstanceAction;
use crate::firecracker::{FirecrackerClient, VmHandle};
use crate::metrics::{Flattener, MetricPoint, MetricsReader};

/// How often the sampler checks for a stop request.
pub const DEFAULT_TICK: Duration = Duration::from_secs(1);

/// Floor for both the tick and the sampling interval.
pub const MIN_TICK: Duration = Duration::from_millis(1);

const FINAL_FLUSH_WAIT: Duration = Duration::from_secs(2);

/// Where metrics records come from.
#[async_trait]
pub trait MetricsSource: Send + Sync {
    /// Every record so far, oldest first.
    async fn all_metrics(&self) -> Result<Vec<Value>>;

    /// Ask the producer to emit a fresh record now.
    async fn flush(&self) -> Result<()>;
}

/// Where flattened points go.
pub trait MetricsSink: Send + Sync {
    fn put_metrics(&self, vm_id: &str, points: &[MetricPoint]);
}

/// Reads a live VM's metrics FIFO and flushes through its control socket.
pub struct VmMetricsSource {
    reader: MetricsReader,
    client: FirecrackerClient,
}

impl VmMetricsSource {
    pub fn new(vm: &VmHandle) -> Result<Self> {
        let reader = vm
            .metrics()
            .cloned()
            .ok_or_else(|| Error::precondition(format!("vm {} has no metrics sink", vm.id())))?;
        Ok(Self {
            reader,
            client: vm.client()?.clone(),
        })
    }
}

#[async_trait]
impl MetricsSource for VmMetricsSource {
    async fn all_metrics(&self) -> Result<Vec<Value>> {
        Ok(self.reader.all())
    }

    async fn flush(&self) -> Result<()> {
        let seen = self.reader.len();
        self.client
            .put_action(&InstanceAction::FlushMetrics)
            .await?
            .into_result()?;
        if !self.reader.wait_beyond(seen, FINAL_FLUSH_WAIT).await {
            debug!(target: "metrics", "no record after final flush");
        }
        Ok(())
    }
}

/// Logs every point at debug level under target `fc_metrics`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl MetricsSink for TracingSink {
    fn put_metrics(&self, vm_id: &str, points: &[MetricPoint]) {
        for point in points {
            debug!(
                target: "fc_metrics",
                vm_id,
                name = %point.name,
                value = %point.value,
                unit = ?point.unit,
                "metric"
            );
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    Idle,
    Running,
    Stopping,
    Stopped,
}

/// Read position and export-once memory, handed between the task and `stop`.
#[derive(Debug, Default)]
struct Progress {
    seen: usize,
    flattener: Flattener,
}

/// Samples a VM's metrics on a fixed interval until stopped.
///
/// Call [`FcMetricsMonitor::stop`] before killing the VM: the final drain
/// flushes through the VM's control socket. Failures inside the sampler are
/// logged and never end the test.
pub struct FcMetricsMonitor {
    vm_id: String,
    source: Arc<dyn MetricsSource>,
    sink: Arc<dyn MetricsSink>,
    interval: Duration,
    tick: Duration,
    state: MonitorState,
    cancel: CancellationToken,
    task: Option<JoinHandle<Progress>>,
}

impl FcMetricsMonitor {
    pub fn new(
        vm_id: impl Into<String>,
        source: Arc<dyn MetricsSource>,
        sink: Arc<dyn MetricsSink>,
        interval: Duration,
    ) -> Self {
        Self {
            vm_id: vm_id.into(),
            source,
            sink,
            interval: interval.max(MIN_TICK),
            tick: DEFAULT_TICK,
            state: MonitorState::Idle,
            cancel: CancellationToken::new(),
            task: None,
        }
    }

    /// Monitor a live VM with the configured interval.
    pub fn for_vm(vm: &VmHandle, sink: Arc<dyn MetricsSink>) -> Result<Self> {
        let source = Arc::new(VmMetricsSource::new(vm)?);
        Ok(Self::new(
            vm.id(),
            source,
            sink,
            vm.harness_config().metrics_interval(),
        ))
    }

    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick.max(MIN_TICK);
        self
    }

    pub fn state(&self) -> MonitorState {
        self.state
    }

    pub fn start(&mut self) -> Result<()> {
        if self.state != MonitorState::Idle {
            return Err(Error::precondition(format!(
                "metrics monitor for {} already started ({:?})",
                self.vm_id, self.state
            )));
        }
        let vm_id = self.vm_id.clone();
        let source = self.source.clone();
        let sink = self.sink.clone();
        let cancel = self.cancel.clone();
        let interval = self.interval;
        let tick = self.tick;

        self.task = Some(tokio::spawn(async move {
            let mut progress = Progress::default();
            info!(target: "monitor", vm_id = %vm_id, ?interval, "metrics monitor started");
            loop {
                drain(&vm_id, source.as_ref(), sink.as_ref(), &mut progress).await;
                // Sleep in ticks so a stop request is noticed quickly. At
                // least one tick passes between drains.
                let mut waited = Duration::ZERO;
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => return progress,
                        _ = tokio::time::sleep(tick) => {}
                    }
                    waited += tick;
                    if waited >= interval {
                        break;
                    }
                }
            }
        }));
        self.state = MonitorState::Running;
        Ok(())
    }

    /// Stop sampling, flush the VM once more and forward what is left.
    /// Idempotent.
    pub async fn stop(&mut self) {
        if self.state == MonitorState::Stopped {
            return;
        }
        self.state = MonitorState::Stopping;
        self.cancel.cancel();

        let mut progress = match self.task.take() {
            Some(task) => match task.await {
                Ok(progress) => progress,
                Err(e) => {
                    warn!(target: "monitor", vm_id = %self.vm_id, error = %e, "metrics monitor task failed");
                    Progress::default()
                }
            },
            None => Progress::default(),
        };

        if let Err(e) = self.source.flush().await {
            warn!(target: "monitor", vm_id = %self.vm_id, error = %e, "final metrics flush failed");
        }
        drain(
            &self.vm_id,
            self.source.as_ref(),
            self.sink.as_ref(),
            &mut progress,
        )
        .await;
        self.state = MonitorState::Stopped;
        info!(target: "monitor", vm_id = %self.vm_id, records = progress.seen, "metrics monitor stopped");
    }
}

impl Drop for FcMetricsMonitor {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn drain(
    vm_id: &str,
    source: &dyn MetricsSource,
    sink: &dyn MetricsSink,
    progress: &mut Progress,
) {
    match source.all_metrics().await {
        Ok(records) => {
            for record in records.iter().skip(progress.seen) {
                let points = progress.flattener.flatten(record);
                sink.put_metrics(vm_id, &points);
            }
            progress.seen = progress.seen.max(records.len());
        }
        Err(e) => warn!(target: "monitor", vm_id, error = %e, "reading metrics failed"),
    }
}
