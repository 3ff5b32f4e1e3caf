//! Health monitoring and metrics for pipeline

use log::{info, warn};
use std::collections::HashSet;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;

use super::lock;
use super::state::{ModuleStatus, PipelineState};

fn unix_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64
}

/// What a stage contributes to the aggregate statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageRole {
    Capture,
    Sync,
    Encode,
    Mux,
}

impl std::fmt::Display for StageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            StageRole::Capture => "capture",
            StageRole::Sync => "sync",
            StageRole::Encode => "encode",
            StageRole::Mux => "mux",
        };
        f.write_str(name)
    }
}

/// Health metrics for one stage
///
/// Written by the stage's worker, polled by the coordinator and the health
/// monitor. Counters are atomics; only the error string takes a lock.
pub struct StageHealth {
    /// Items taken from the input queue(s)
    pub frames_in: AtomicU64,

    /// Items successfully handed downstream (captured, emitted, encoded, written)
    pub frames_out: AtomicU64,

    /// Number of frames dropped due to backpressure or errors
    pub frame_drops: AtomicU64,

    /// Bytes handed downstream
    pub bytes_processed: AtomicU64,

    /// Number of keyframes processed
    pub keyframes_processed: AtomicU64,

    /// Recoverable and fatal errors seen
    pub errors: AtomicU64,

    /// Timestamp (as Unix microseconds) of the last successfully processed frame
    pub last_frame_time: AtomicU64,

    /// Last measured video-minus-audio target drift (microseconds)
    pub drift_micros: AtomicI64,

    last_error: Mutex<Option<String>>,
}

impl StageHealth {
    /// Create a new health metrics instance
    pub fn new() -> Self {
        Self {
            frames_in: AtomicU64::new(0),
            frames_out: AtomicU64::new(0),
            frame_drops: AtomicU64::new(0),
            bytes_processed: AtomicU64::new(0),
            keyframes_processed: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            last_frame_time: AtomicU64::new(unix_micros()),
            drift_micros: AtomicI64::new(0),
            last_error: Mutex::new(None),
        }
    }

    /// Record an item taken from an input queue
    pub fn record_input(&self) {
        self.frames_in.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a dropped frame
    pub fn record_frame_drop(&self) {
        self.frame_drops.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a successfully processed frame
    pub fn record_frame(&self, size: usize, is_keyframe: bool) {
        self.last_frame_time.store(unix_micros(), Ordering::Relaxed);
        self.frames_out.fetch_add(1, Ordering::Relaxed);
        self.bytes_processed
            .fetch_add(size as u64, Ordering::Relaxed);
        if is_keyframe {
            self.keyframes_processed.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record the drift measured between the two streams
    pub fn record_drift(&self, micros: i64) {
        self.drift_micros.store(micros, Ordering::Relaxed);
    }

    /// Record an error and keep its message as the stage's last error
    pub fn record_error(&self, message: impl Into<String>) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        *lock(&self.last_error) = Some(message.into());
    }

    pub fn frames_in(&self) -> u64 {
        self.frames_in.load(Ordering::Relaxed)
    }

    pub fn frames_out(&self) -> u64 {
        self.frames_out.load(Ordering::Relaxed)
    }

    /// Get the number of frame drops
    pub fn frame_drops(&self) -> u64 {
        self.frame_drops.load(Ordering::Relaxed)
    }

    /// Get the total bytes processed
    pub fn bytes_processed(&self) -> u64 {
        self.bytes_processed.load(Ordering::Relaxed)
    }

    /// Get the number of keyframes processed
    pub fn keyframes_processed(&self) -> u64 {
        self.keyframes_processed.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    /// Get the timestamp of the last frame (Unix microseconds)
    pub fn last_frame_time(&self) -> u64 {
        self.last_frame_time.load(Ordering::Relaxed)
    }

    pub fn drift_micros(&self) -> i64 {
        self.drift_micros.load(Ordering::Relaxed)
    }

    /// Last recorded error message, if any
    pub fn last_error(&self) -> Option<String> {
        lock(&self.last_error).clone()
    }

    /// Calculate the frame drop rate as a percentage
    pub fn frame_drop_rate(&self) -> f64 {
        drop_rate(self.frame_drops(), self.frames_out())
    }

    /// Check if the stage has stalled (no frames for given duration)
    pub fn is_stalled(&self, threshold: Duration) -> bool {
        let elapsed_micros = unix_micros().saturating_sub(self.last_frame_time());
        elapsed_micros > threshold.as_micros() as u64
    }
}

impl Default for StageHealth {
    fn default() -> Self {
        Self::new()
    }
}

fn drop_rate(drops: u64, processed: u64) -> f64 {
    if processed == 0 {
        return 0.0;
    }
    (drops as f64 / processed as f64) * 100.0
}

/// Read-only view of one stage, held by [`StatsHandle`]
#[derive(Clone)]
pub struct StageProbe {
    pub name: String,
    pub role: StageRole,
    pub health: Arc<StageHealth>,
    pub status: Arc<Mutex<ModuleStatus>>,
}

impl StageProbe {
    pub fn status(&self) -> ModuleStatus {
        *lock(&self.status)
    }

    fn snapshot(&self) -> StageStats {
        StageStats {
            name: self.name.clone(),
            role: self.role,
            status: self.status(),
            frames_in: self.health.frames_in(),
            frames_out: self.health.frames_out(),
            frame_drops: self.health.frame_drops(),
            bytes: self.health.bytes_processed(),
            errors: self.health.errors(),
            drift_micros: self.health.drift_micros(),
            last_frame_time: self.health.last_frame_time(),
            last_error: self.health.last_error(),
        }
    }
}

/// Snapshot of one stage
#[derive(Debug, Clone)]
pub struct StageStats {
    pub name: String,
    pub role: StageRole,
    pub status: ModuleStatus,
    pub frames_in: u64,
    pub frames_out: u64,
    pub frame_drops: u64,
    pub bytes: u64,
    pub errors: u64,
    pub drift_micros: i64,
    /// Unix microseconds
    pub last_frame_time: u64,
    pub last_error: Option<String>,
}

/// Snapshot of the whole pipeline, gathered by polling every stage
#[derive(Debug, Clone)]
pub struct PipelineStats {
    pub state: PipelineState,
    pub frames_captured: u64,
    pub frames_encoded: u64,
    pub frames_dropped: u64,
    /// Encoded frames per second since start
    pub throughput_fps: f64,
    pub bytes_written: u64,
    pub packets_written: u64,
    /// Video-minus-audio drift last measured by the sync stage
    pub av_drift_micros: i64,
    pub elapsed: Duration,
    pub stages: Vec<StageStats>,
}

impl PipelineStats {
    /// Drop rate against everything captured, as a percentage
    pub fn frame_drop_rate(&self) -> f64 {
        drop_rate(self.frames_dropped, self.frames_captured)
    }

    /// `(stage, message)` for every stage that has recorded an error
    pub fn last_errors(&self) -> Vec<(&str, &str)> {
        self.stages
            .iter()
            .filter_map(|s| s.last_error.as_deref().map(|e| (s.name.as_str(), e)))
            .collect()
    }

    pub fn stage(&self, name: &str) -> Option<&StageStats> {
        self.stages.iter().find(|s| s.name == name)
    }

    /// Most recent frame activity across all stages (Unix microseconds)
    pub fn last_activity(&self) -> u64 {
        self.stages
            .iter()
            .map(|s| s.last_frame_time)
            .max()
            .unwrap_or(0)
    }
}

impl std::fmt::Display for PipelineStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}: {} captured, {} encoded, {} dropped ({:.2}%), {:.1} fps, {} packets / {} bytes written, drift {}µs",
            self.state,
            self.frames_captured,
            self.frames_encoded,
            self.frames_dropped,
            self.frame_drop_rate(),
            self.throughput_fps,
            self.packets_written,
            self.bytes_written,
            self.av_drift_micros
        )
    }
}

/// Cloneable, thread-safe access to a pipeline's statistics
#[derive(Clone)]
pub struct StatsHandle {
    probes: Arc<Vec<StageProbe>>,
    state: Arc<Mutex<PipelineState>>,
    started_at: Arc<Mutex<Option<Instant>>>,
}

impl StatsHandle {
    pub fn new(probes: Vec<StageProbe>, state: Arc<Mutex<PipelineState>>) -> Self {
        Self {
            probes: Arc::new(probes),
            state,
            started_at: Arc::new(Mutex::new(None)),
        }
    }

    pub(crate) fn mark_started(&self) {
        lock(&self.started_at).get_or_insert_with(Instant::now);
    }

    pub fn state(&self) -> PipelineState {
        *lock(&self.state)
    }

    /// Poll every stage
    pub fn snapshot(&self) -> PipelineStats {
        let stages: Vec<StageStats> = self.probes.iter().map(StageProbe::snapshot).collect();
        let sum = |role: StageRole, f: fn(&StageStats) -> u64| -> u64 {
            stages.iter().filter(|s| s.role == role).map(f).sum()
        };

        let frames_captured = sum(StageRole::Capture, |s| s.frames_out);
        let frames_encoded = sum(StageRole::Encode, |s| s.frames_out);
        let packets_written = sum(StageRole::Mux, |s| s.frames_out);
        let bytes_written = sum(StageRole::Mux, |s| s.bytes);
        let frames_dropped = stages.iter().map(|s| s.frame_drops).sum();
        let av_drift_micros = stages
            .iter()
            .find(|s| s.role == StageRole::Sync)
            .map(|s| s.drift_micros)
            .unwrap_or(0);

        let started_at = *lock(&self.started_at);
        let elapsed = started_at.map(|t| t.elapsed()).unwrap_or_default();
        let throughput_fps = if elapsed.as_secs_f64() > 0.0 {
            frames_encoded as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        };

        PipelineStats {
            state: self.state(),
            frames_captured,
            frames_encoded,
            frames_dropped,
            throughput_fps,
            bytes_written,
            packets_written,
            av_drift_micros,
            elapsed,
            stages,
        }
    }
}

/// Health alert types
#[derive(Debug, Clone, PartialEq)]
pub enum HealthAlert {
    /// Pipeline has stalled (no frames for threshold duration)
    Stalled { duration: Duration },

    /// High frame drop rate detected
    HighDropRate { rate: f64 },

    /// Measured A/V drift above the configured limit
    DriftExceeded { drift_micros: i64 },

    /// A stage recorded a new error
    StageError { stage: String, message: String },
}

impl std::fmt::Display for HealthAlert {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthAlert::Stalled { duration } => {
                write!(f, "Pipeline stalled for {:?}", duration)
            }
            HealthAlert::HighDropRate { rate } => {
                write!(f, "High frame drop rate: {:.2}%", rate)
            }
            HealthAlert::DriftExceeded { drift_micros } => {
                write!(f, "A/V drift {}µs", drift_micros)
            }
            HealthAlert::StageError { stage, message } => {
                write!(f, "Stage {} failed: {}", stage, message)
            }
        }
    }
}

/// Health monitoring service
///
/// Periodically polls the pipeline statistics, logs a summary line and sends
/// alerts when issues are detected. Returns once the pipeline has stopped or
/// the alert receiver is gone.
pub struct HealthMonitor {
    stats: StatsHandle,
    alert_tx: mpsc::Sender<HealthAlert>,
    check_interval: Duration,
    stall_threshold: Duration,
    drop_rate_threshold: f64,
    drift_threshold: Duration,
}

impl HealthMonitor {
    /// Create a new health monitor
    pub fn new(stats: StatsHandle, alert_tx: mpsc::Sender<HealthAlert>) -> Self {
        Self {
            stats,
            alert_tx,
            check_interval: Duration::from_secs(5),
            stall_threshold: Duration::from_secs(5),
            drop_rate_threshold: 10.0, // 10% drop rate
            drift_threshold: Duration::from_millis(80),
        }
    }

    /// Configure the check interval
    pub fn with_check_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval;
        self
    }

    /// Configure the stall threshold
    pub fn with_stall_threshold(mut self, threshold: Duration) -> Self {
        self.stall_threshold = threshold;
        self
    }

    /// Configure the drop rate threshold
    pub fn with_drop_rate_threshold(mut self, threshold: f64) -> Self {
        self.drop_rate_threshold = threshold;
        self
    }

    /// Configure the drift threshold
    pub fn with_drift_threshold(mut self, threshold: Duration) -> Self {
        self.drift_threshold = threshold;
        self
    }

    /// Alerts for one snapshot; `reported` holds stages already reported as failed
    fn check(&self, stats: &PipelineStats, reported: &mut HashSet<String>) -> Vec<HealthAlert> {
        let mut alerts = Vec::new();

        for stage in &stats.stages {
            if let Some(message) = &stage.last_error
                && reported.insert(stage.name.clone())
            {
                alerts.push(HealthAlert::StageError {
                    stage: stage.name.clone(),
                    message: message.clone(),
                });
            }
        }

        if !stats.state.is_running() {
            return alerts;
        }

        let idle_micros = unix_micros().saturating_sub(stats.last_activity());
        if idle_micros > self.stall_threshold.as_micros() as u64 {
            alerts.push(HealthAlert::Stalled {
                duration: Duration::from_micros(idle_micros),
            });
        }

        let rate = stats.frame_drop_rate();
        if rate > self.drop_rate_threshold {
            alerts.push(HealthAlert::HighDropRate { rate });
        }

        if stats.av_drift_micros.unsigned_abs() > self.drift_threshold.as_micros() as u64 {
            alerts.push(HealthAlert::DriftExceeded {
                drift_micros: stats.av_drift_micros,
            });
        }

        alerts
    }

    /// Run the health monitor until the pipeline stops
    pub async fn run(&self) {
        let mut interval = tokio::time::interval(self.check_interval);
        let mut reported = HashSet::new();

        loop {
            interval.tick().await;

            let stats = self.stats.snapshot();
            if stats.state.is_active() {
                info!("Pipeline: {}", stats);
            }

            for alert in self.check(&stats, &mut reported) {
                warn!("HealthMonitor: {}", alert);
                if self.alert_tx.send(alert).await.is_err() {
                    return;
                }
            }

            if stats.state == PipelineState::Stopped {
                info!("HealthMonitor: pipeline stopped ({})", stats);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn probe(name: &str, role: StageRole) -> StageProbe {
        StageProbe {
            name: name.into(),
            role,
            health: Arc::new(StageHealth::new()),
            status: Arc::new(Mutex::new(ModuleStatus::Initialized)),
        }
    }

    #[test]
    fn test_health_metrics() {
        let health = StageHealth::new();

        health.record_frame(1000, false);
        health.record_frame(2000, true);
        health.record_frame(1500, false);

        assert_eq!(health.frames_out(), 3);
        assert_eq!(health.bytes_processed(), 4500);
        assert_eq!(health.keyframes_processed(), 1);
        assert_eq!(health.frame_drops(), 0);

        health.record_frame_drop();
        health.record_frame_drop();

        assert_eq!(health.frame_drops(), 2);
        assert!(health.frame_drop_rate() > 0.0);
    }

    #[test]
    fn test_last_error_kept() {
        let health = StageHealth::new();
        assert!(health.last_error().is_none());

        health.record_error("first");
        health.record_error("second");
        assert_eq!(health.errors(), 2);
        assert_eq!(health.last_error().as_deref(), Some("second"));
    }

    #[test]
    fn test_stall_detection() {
        let health = StageHealth::new();
        assert!(!health.is_stalled(Duration::from_secs(1)));

        health.record_frame(1000, false);
        std::thread::sleep(Duration::from_millis(150));
        assert!(health.is_stalled(Duration::from_millis(100)));
    }

    #[test]
    fn test_snapshot_aggregates_by_role() {
        let capture_v = probe("capture-video", StageRole::Capture);
        let capture_a = probe("capture-audio", StageRole::Capture);
        let sync = probe("sync", StageRole::Sync);
        let encode = probe("encode", StageRole::Encode);
        let mux = probe("mux", StageRole::Mux);

        for _ in 0..3 {
            capture_v.health.record_frame(100, false);
        }
        capture_a.health.record_frame(10, false);
        capture_a.health.record_frame_drop();
        sync.health.record_drift(-12_000);
        encode.health.record_frame(50, true);
        mux.health.record_frame(400, true);
        mux.health.record_frame(100, false);
        mux.health.record_error("disk full");

        let state = Arc::new(Mutex::new(PipelineState::Idle));
        let handle = StatsHandle::new(vec![capture_v, capture_a, sync, encode, mux], state);
        let stats = handle.snapshot();

        assert_eq!(stats.frames_captured, 4);
        assert_eq!(stats.frames_encoded, 1);
        assert_eq!(stats.frames_dropped, 1);
        assert_eq!(stats.packets_written, 2);
        assert_eq!(stats.bytes_written, 500);
        assert_eq!(stats.av_drift_micros, -12_000);
        assert_eq!(stats.last_errors(), vec![("mux", "disk full")]);
        assert_eq!(stats.throughput_fps, 0.0);
    }

    #[test]
    fn test_check_reports_stage_error_once() {
        let mux = probe("mux", StageRole::Mux);
        mux.health.record_error("write failed");
        let state = Arc::new(Mutex::new(PipelineState::Idle));
        let handle = StatsHandle::new(vec![mux], state);

        let (tx, _rx) = mpsc::channel(4);
        let monitor = HealthMonitor::new(handle.clone(), tx);
        let mut reported = HashSet::new();

        let first = monitor.check(&handle.snapshot(), &mut reported);
        assert_eq!(first.len(), 1);
        assert!(matches!(&first[0], HealthAlert::StageError { stage, .. } if stage == "mux"));

        let second = monitor.check(&handle.snapshot(), &mut reported);
        assert!(second.is_empty());
    }

    #[test]
    fn test_check_drift_and_drop_rate_while_running() {
        let capture = probe("capture-video", StageRole::Capture);
        let sync = probe("sync", StageRole::Sync);
        capture.health.record_frame(1, false);
        capture.health.record_frame_drop();
        sync.health.record_drift(150_000);

        let state = Arc::new(Mutex::new(PipelineState::Running {
            started_at: Instant::now(),
        }));
        let handle = StatsHandle::new(vec![capture, sync], state);
        let (tx, _rx) = mpsc::channel(4);
        let monitor = HealthMonitor::new(handle.clone(), tx);

        let alerts = monitor.check(&handle.snapshot(), &mut HashSet::new());
        assert!(alerts.contains(&HealthAlert::DriftExceeded { drift_micros: 150_000 }));
        assert!(alerts.iter().any(|a| matches!(a, HealthAlert::HighDropRate { .. })));
        assert!(!alerts.iter().any(|a| matches!(a, HealthAlert::Stalled { .. })));
    }

    #[tokio::test]
    async fn test_monitor_exits_when_stopped() {
        let mux = probe("mux", StageRole::Mux);
        mux.health.record_error("boom");
        let state = Arc::new(Mutex::new(PipelineState::Stopped));
        let handle = StatsHandle::new(vec![mux], state);

        let (tx, mut rx) = mpsc::channel(4);
        let monitor = HealthMonitor::new(handle, tx).with_check_interval(Duration::from_millis(10));
        monitor.run().await;

        let alert = rx.recv().await;
        assert!(matches!(alert, Some(HealthAlert::StageError { .. })));
    }
}
