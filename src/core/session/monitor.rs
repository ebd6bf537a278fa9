//! Session volume monitor.
//!
//! Decides when the assistant's speech has actually finished playing by
//! sampling the energy of the live output signal. The backend's "audio done"
//! event only says the bytes were sent; playback can lag behind it by
//! seconds.
//!
//! The monitor first discovers the output's [`SignalTap`] through a
//! [`SinkLocator`] (bounded retries), then samples it on a fixed interval.
//! Energy is measured as the RMS of the Hann-windowed frame, computed in the
//! frequency domain via Parseval's theorem. Completion fires after a
//! continuous stretch of silence, or when the failsafe ceiling elapses.

use anyhow::Result;
use parking_lot::Mutex;
use rustfft::num_complex::Complex32;
use rustfft::{Fft, FftPlanner};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::sink::{SignalTap, SinkLocator};

// =============================================================================
// Configuration
// =============================================================================

/// Tuning for the volume monitor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Time between energy samples (ms)
    pub sample_interval_ms: u64,
    /// Energy at or below this value counts as silence
    pub silence_threshold: f32,
    /// Continuous silence required for completion (ms)
    pub silence_duration_ms: u64,
    /// Completion is forced this long after the monitor starts (ms)
    pub failsafe_ms: u64,
    /// Signal tap discovery attempts before giving up
    pub discovery_attempts: u32,
    /// Delay between discovery attempts (ms)
    pub discovery_interval_ms: u64,
    /// FFT length; also the number of samples analysed per measurement
    pub fft_size: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            sample_interval_ms: 100,
            silence_threshold: 0.01,
            silence_duration_ms: 2000,
            failsafe_ms: 8000,
            discovery_attempts: 10,
            discovery_interval_ms: 200,
            fft_size: 512,
        }
    }
}

impl MonitorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.sample_interval_ms == 0 {
            anyhow::bail!("monitor sample_interval_ms must be greater than 0");
        }
        if !(self.silence_threshold > 0.0 && self.silence_threshold <= 1.0) {
            anyhow::bail!("monitor silence_threshold must be in (0.0, 1.0]");
        }
        if self.silence_duration_ms == 0 {
            anyhow::bail!("monitor silence_duration_ms must be greater than 0");
        }
        if self.silence_duration_ms >= self.failsafe_ms {
            anyhow::bail!("monitor silence_duration_ms must be shorter than failsafe_ms");
        }
        if self.discovery_attempts == 0 {
            anyhow::bail!("monitor discovery_attempts must be at least 1");
        }
        if self.discovery_interval_ms == 0 {
            anyhow::bail!("monitor discovery_interval_ms must be greater than 0");
        }
        if self.fft_size < 16 {
            anyhow::bail!("monitor fft_size must be at least 16");
        }
        Ok(())
    }

    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }

    pub fn discovery_interval(&self) -> Duration {
        Duration::from_millis(self.discovery_interval_ms)
    }

    pub fn failsafe(&self) -> Duration {
        Duration::from_millis(self.failsafe_ms)
    }
}

// =============================================================================
// Energy Measurement
// =============================================================================

/// Hann window of length `n`.
pub fn hann_window(n: usize) -> Vec<f32> {
    let len = n as f32;
    (0..n)
        .map(|i| 0.5 * (1.0 - (2.0 * std::f32::consts::PI * i as f32 / len).cos()))
        .collect()
}

/// Measures scalar signal energy of fixed-size frames.
pub struct EnergyMeter {
    fft: Arc<dyn Fft<f32>>,
    window: Vec<f32>,
    frame: Vec<f32>,
    spectrum: Vec<Complex32>,
}

impl EnergyMeter {
    pub fn new(fft_size: usize) -> Self {
        let mut planner = FftPlanner::<f32>::new();
        let fft = planner.plan_fft_forward(fft_size);
        Self {
            fft,
            window: hann_window(fft_size),
            frame: vec![0.0; fft_size],
            spectrum: vec![Complex32::default(); fft_size],
        }
    }

    /// Energy of `samples` (shorter input is zero-padded, longer truncated).
    pub fn energy(&mut self, samples: &[f32]) -> f32 {
        let n = self.window.len();
        for (i, bin) in self.spectrum.iter_mut().enumerate() {
            let sample = samples.get(i).copied().unwrap_or(0.0);
            *bin = Complex32::new(sample * self.window[i], 0.0);
        }
        self.fft.process(&mut self.spectrum);

        let power: f32 = self.spectrum.iter().map(|c| c.norm_sqr()).sum();
        (power / (n as f32 * n as f32)).sqrt()
    }

    /// Read the current frame from `tap` and measure it.
    pub fn measure(&mut self, tap: &dyn SignalTap) -> f32 {
        let mut frame = std::mem::take(&mut self.frame);
        tap.read_frame(&mut frame);
        let energy = self.energy(&frame);
        self.frame = frame;
        energy
    }
}

// =============================================================================
// Silence Tracking
// =============================================================================

/// Running silent-duration counter.
///
/// Silence is measured from the first quiet sample, so a run of `n` quiet
/// samples spans `(n - 1) * interval_ms`. The signal may have gone quiet
/// anywhere inside the interval before that sample.
#[derive(Debug, Clone)]
pub struct SilenceTracker {
    threshold: f32,
    interval_ms: u64,
    required_ms: u64,
    silent_ms: Option<u64>,
}

impl SilenceTracker {
    pub fn new(threshold: f32, interval_ms: u64, required_ms: u64) -> Self {
        Self {
            threshold,
            interval_ms,
            required_ms,
            silent_ms: None,
        }
    }

    pub fn from_config(config: &MonitorConfig) -> Self {
        Self::new(
            config.silence_threshold,
            config.sample_interval_ms,
            config.silence_duration_ms,
        )
    }

    /// Feed one sample. Returns `true` once the required silence is reached.
    pub fn observe(&mut self, energy: f32) -> bool {
        self.silent_ms = if energy > self.threshold {
            None
        } else {
            Some(self.silent_ms.map_or(0, |ms| ms + self.interval_ms))
        };
        self.silent_ms.is_some_and(|ms| ms >= self.required_ms)
    }

    pub fn silent_ms(&self) -> u64 {
        self.silent_ms.unwrap_or(0)
    }
}

// =============================================================================
// Events and Status
// =============================================================================

/// Why the monitor completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CompletionReason {
    Silence,
    Failsafe,
}

impl fmt::Display for CompletionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompletionReason::Silence => write!(f, "silence"),
            CompletionReason::Failsafe => write!(f, "failsafe"),
        }
    }
}

/// What happened to a monitor.
#[derive(Debug, Clone, PartialEq)]
pub enum MonitorEventKind {
    /// The signal tap was found
    Attached { attempts: u32 },
    /// Discovery gave up or the sink is unavailable
    AttachFailed { attempts: u32, reason: String },
    /// Playback finished
    Completed(CompletionReason),
}

/// Event emitted by a monitor, tagged with its ID so that events from a
/// superseded monitor can be recognized and ignored.
#[derive(Debug, Clone, PartialEq)]
pub struct MonitorEvent {
    pub monitor_id: u64,
    pub kind: MonitorEventKind,
}

/// Receives monitor events.
pub type MonitorEventSink = Arc<dyn Fn(MonitorEvent) + Send + Sync>;

/// Live status of a monitor, for diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MonitorStatus {
    pub monitor_id: u64,
    pub running: bool,
    pub attached: bool,
    pub discovery_attempts: u32,
    pub samples: u64,
    pub last_energy: f32,
    pub silent_ms: u64,
    pub completion: Option<CompletionReason>,
}

// =============================================================================
// Monitor
// =============================================================================

/// Handle to a running monitor.
pub struct MonitorHandle {
    id: u64,
    token: CancellationToken,
    status: Arc<Mutex<MonitorStatus>>,
    task: JoinHandle<()>,
}

impl MonitorHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn status(&self) -> MonitorStatus {
        self.status.lock().clone()
    }

    /// Token that stops this monitor when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Stop sampling. Safe to call more than once.
    pub fn stop(&self) {
        self.token.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl fmt::Debug for MonitorHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MonitorHandle")
            .field("id", &self.id)
            .field("cancelled", &self.token.is_cancelled())
            .finish()
    }
}

/// Spawns volume monitors.
pub struct VolumeMonitor;

impl VolumeMonitor {
    /// Start a monitor as a child of `parent`. Cancelling `parent` stops it.
    pub fn start(
        id: u64,
        config: MonitorConfig,
        locator: Arc<dyn SinkLocator>,
        parent: &CancellationToken,
        sink: MonitorEventSink,
    ) -> MonitorHandle {
        let token = parent.child_token();
        let status = Arc::new(Mutex::new(MonitorStatus {
            monitor_id: id,
            running: true,
            ..Default::default()
        }));

        let task = tokio::spawn(run_monitor(
            id,
            config,
            locator,
            token.clone(),
            status.clone(),
            sink,
        ));

        MonitorHandle {
            id,
            token,
            status,
            task,
        }
    }
}

async fn run_monitor(
    id: u64,
    config: MonitorConfig,
    locator: Arc<dyn SinkLocator>,
    token: CancellationToken,
    status: Arc<Mutex<MonitorStatus>>,
    sink: MonitorEventSink,
) {
    let failsafe = tokio::time::sleep_until(Instant::now() + config.failsafe());
    tokio::pin!(failsafe);

    let finish = |kind: MonitorEventKind| {
        {
            let mut s = status.lock();
            s.running = false;
            if let MonitorEventKind::Completed(reason) = &kind {
                s.completion = Some(*reason);
            }
        }
        sink(MonitorEvent {
            monitor_id: id,
            kind,
        });
    };

    // Discovery
    let mut attempts = 0u32;
    let tap: Arc<dyn SignalTap> = loop {
        attempts += 1;
        status.lock().discovery_attempts = attempts;

        match locator.locate().await {
            Ok(Some(tap)) => break tap,
            Ok(None) if attempts < config.discovery_attempts => {
                debug!(monitor_id = id, attempts, "Signal tap not available yet");
                tokio::select! {
                    biased;
                    _ = token.cancelled() => {
                        status.lock().running = false;
                        return;
                    }
                    _ = &mut failsafe => {
                        warn!(monitor_id = id, "Failsafe elapsed during sink discovery");
                        finish(MonitorEventKind::Completed(CompletionReason::Failsafe));
                        return;
                    }
                    _ = tokio::time::sleep(config.discovery_interval()) => {}
                }
            }
            Ok(None) => {
                warn!(monitor_id = id, attempts, "Signal tap not found");
                finish(MonitorEventKind::AttachFailed {
                    attempts,
                    reason: "signal tap not found".to_string(),
                });
                return;
            }
            Err(e) => {
                warn!(monitor_id = id, attempts, "Audio sink unavailable: {}", e);
                finish(MonitorEventKind::AttachFailed {
                    attempts,
                    reason: e.to_string(),
                });
                return;
            }
        }
    };

    if token.is_cancelled() {
        status.lock().running = false;
        return;
    }

    info!(monitor_id = id, attempts, "Volume monitor attached");
    status.lock().attached = true;
    sink(MonitorEvent {
        monitor_id: id,
        kind: MonitorEventKind::Attached { attempts },
    });

    // Sampling
    let mut meter = EnergyMeter::new(config.fft_size);
    let mut tracker = SilenceTracker::from_config(&config);
    // First sample one interval after attach, not immediately.
    let period = config.sample_interval();
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => {
                debug!(monitor_id = id, "Volume monitor stopped");
                status.lock().running = false;
                return;
            }
            _ = &mut failsafe => {
                info!(monitor_id = id, "Volume monitor failsafe reached");
                finish(MonitorEventKind::Completed(CompletionReason::Failsafe));
                return;
            }
            _ = ticker.tick() => {
                let energy = meter.measure(tap.as_ref());
                let silent = tracker.observe(energy);
                {
                    let mut s = status.lock();
                    s.samples += 1;
                    s.last_energy = energy;
                    s.silent_ms = tracker.silent_ms();
                }
                if silent {
                    info!(monitor_id = id, silent_ms = tracker.silent_ms(), "Sustained silence detected");
                    finish(MonitorEventKind::Completed(CompletionReason::Silence));
                    return;
                }
            }
        }
    }
}
