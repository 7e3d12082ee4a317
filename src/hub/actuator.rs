use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clock::{Millis, SharedClock};
use crate::error::ActuatorError;
use crate::store::{CameraTelemetry, FrameStamp, LiveEnabled, SharedStore, StateStoreExt};

/// One capture handed to the actuator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureJob {
    pub id: String,
    pub requested_at: Millis,
}

/// The hardware side: performs captures and reports telemetry.
#[async_trait]
pub trait CameraActuator: Send + Sync {
    fn name(&self) -> &str;

    /// Take one capture and return a reference to the result
    async fn capture(&self, job: &CaptureJob) -> Result<String, ActuatorError>;
}

/// Clears the busy flag when a capture ends, however it ends
struct BusyGuard<'a>(&'a AtomicBool);

impl<'a> BusyGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Result<Self, ActuatorError> {
        if flag.swap(true, Ordering::SeqCst) {
            return Err(ActuatorError::Busy);
        }
        Ok(Self(flag))
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Stand-in camera that writes telemetry and frame stamps into the store
pub struct SimulatedActuator {
    store: SharedStore,
    clock: SharedClock,
    telemetry_interval: Duration,
    capture_latency: Duration,
    busy: AtomicBool,
    captures: AtomicU64,
    frames: AtomicU64,
    cancellation_token: CancellationToken,
}

impl SimulatedActuator {
    pub fn new(store: SharedStore, clock: SharedClock, telemetry_interval: Duration) -> Self {
        Self {
            store,
            clock,
            telemetry_interval,
            capture_latency: Duration::from_millis(800),
            busy: AtomicBool::new(false),
            captures: AtomicU64::new(0),
            frames: AtomicU64::new(0),
            cancellation_token: CancellationToken::new(),
        }
    }

    pub fn with_capture_latency(mut self, latency: Duration) -> Self {
        self.capture_latency = latency;
        self
    }

    /// Captures completed so far
    pub fn capture_count(&self) -> u64 {
        self.captures.load(Ordering::SeqCst)
    }

    /// Write one telemetry sample, and a new frame stamp while live is on
    pub async fn emit(&self) {
        let tick = self.frames.load(Ordering::SeqCst);
        let telemetry = CameraTelemetry {
            memory: 512.0 - (tick % 64) as f64,
            temperature: 41.0 + (tick % 10) as f64 / 10.0,
            latency_or_load: 12.0,
            signal_or_disk: -55.0,
        };
        if let Err(e) = self.store.save(&telemetry).await {
            warn!("Simulated telemetry write failed: {}", e);
        }

        let live = self.store.load_or(LiveEnabled(false)).await;
        if live.0 && !self.busy.load(Ordering::SeqCst) {
            let frame = FrameStamp {
                frame_id: self.frames.fetch_add(1, Ordering::SeqCst) + 1,
            };
            if let Err(e) = self.store.save(&frame).await {
                warn!("Simulated frame write failed: {}", e);
            }
        }
    }

    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let actuator = Arc::clone(self);
        let token = self.cancellation_token.clone();

        tokio::spawn(async move {
            info!(
                "Simulated camera running ({:?} telemetry interval)",
                actuator.telemetry_interval
            );
            let mut ticker = interval(actuator.telemetry_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => actuator.emit().await,
                    _ = token.cancelled() => break,
                }
            }
            info!("Simulated camera stopped");
        })
    }

    pub fn stop(&self) {
        self.cancellation_token.cancel();
    }
}

#[async_trait]
impl CameraActuator for SimulatedActuator {
    fn name(&self) -> &str {
        "simulated"
    }

    async fn capture(&self, job: &CaptureJob) -> Result<String, ActuatorError> {
        let _busy = BusyGuard::acquire(&self.busy)?;
        debug!(
            "Simulated capture {} requested at {} (now {})",
            job.id,
            job.requested_at,
            self.clock.now_ms()
        );
        sleep(self.capture_latency).await;
        self.captures.fetch_add(1, Ordering::SeqCst);
        Ok(format!("captures/{}.jpg", job.id))
    }
}

/// Runs an external command per capture; the output path is passed as the
/// command's last argument.
pub struct ProcessActuator {
    command: String,
    capture_dir: PathBuf,
    busy: AtomicBool,
}

impl ProcessActuator {
    pub fn new(command: impl Into<String>, capture_dir: impl AsRef<Path>) -> Self {
        Self {
            command: command.into(),
            capture_dir: capture_dir.as_ref().to_path_buf(),
            busy: AtomicBool::new(false),
        }
    }

    pub fn output_path(&self, job: &CaptureJob) -> PathBuf {
        self.capture_dir.join(format!("{}.jpg", job.id))
    }
}

#[async_trait]
impl CameraActuator for ProcessActuator {
    fn name(&self) -> &str {
        "process"
    }

    async fn capture(&self, job: &CaptureJob) -> Result<String, ActuatorError> {
        let _busy = BusyGuard::acquire(&self.busy)?;

        tokio::fs::create_dir_all(&self.capture_dir)
            .await
            .map_err(|e| ActuatorError::CommandFailed {
                details: format!(
                    "cannot create capture directory {}: {}",
                    self.capture_dir.display(),
                    e
                ),
            })?;

        let output_path = self.output_path(job);
        debug!("Running capture command for {}", job.id);

        let output = Command::new("sh")
            .arg("-c")
            .arg(format!("{} \"$1\"", self.command))
            .arg("camlink-capture")
            .arg(output_path.as_os_str())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| ActuatorError::CommandFailed {
                details: format!("failed to execute capture command: {}", e),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ActuatorError::CommandFailed {
                details: format!("capture command exited with {}: {}", output.status, stderr.trim()),
            });
        }

        Ok(output_path.display().to_string())
    }
}
