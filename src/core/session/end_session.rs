//! End-of-session state machine.
//!
//! The backend never says "the conversation is over and the user has heard
//! everything". The machine reconstructs that moment from four independent
//! signals: the end-session function succeeding, the goodbye response
//! completing, the goodbye audio being fully sent, and the volume monitor
//! hearing silence. Timers bound the worst case whenever one of those signals
//! never shows up.
//!
//! ```text
//! Idle --end_session ok--> ExpectingGoodbye --response_done--> WaitingForAudioDone
//!   ^                                                              |
//!   |                                                          audio_done
//!   |                                                              v
//!   +---- Disconnecting <--silence / failsafe / timers---- MonitoringSilence
//! ```
//!
//! The machine performs no I/O itself. Timers, monitors and the disconnect
//! are requested through [`EndSessionEffects`], and every timer or monitor is
//! identified by an ID so that events from a superseded one are ignored.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::monitor::{CompletionReason, MonitorEvent, MonitorEventKind};

// =============================================================================
// Configuration
// =============================================================================

/// Timing policy for ending a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EndSessionConfig {
    /// Upper bound from the end-session call to disconnect, used until the
    /// volume monitor attaches (ms)
    pub fallback_timeout_ms: u64,
    /// Disconnect delay after a quick discovery failure (ms)
    pub fast_fallback_ms: u64,
    /// Disconnect delay after a slow discovery failure (ms)
    pub slow_fallback_ms: u64,
    /// Discovery failures with at most this many attempts use the fast delay
    pub fast_fallback_max_attempts: u32,
}

impl Default for EndSessionConfig {
    fn default() -> Self {
        Self {
            fallback_timeout_ms: 15_000,
            fast_fallback_ms: 500,
            slow_fallback_ms: 2_500,
            fast_fallback_max_attempts: 3,
        }
    }
}

impl EndSessionConfig {
    pub fn validate(&self) -> Result<()> {
        if self.fallback_timeout_ms == 0 {
            anyhow::bail!("end_session fallback_timeout_ms must be greater than 0");
        }
        if self.fast_fallback_ms > self.slow_fallback_ms {
            anyhow::bail!("end_session fast_fallback_ms must not exceed slow_fallback_ms");
        }
        Ok(())
    }

    /// Delay before the heuristic disconnect after discovery gave up.
    pub fn heuristic_delay(&self, attempts: u32) -> Duration {
        if attempts <= self.fast_fallback_max_attempts {
            Duration::from_millis(self.fast_fallback_ms)
        } else {
            Duration::from_millis(self.slow_fallback_ms)
        }
    }
}

// =============================================================================
// Types
// =============================================================================

/// Phase of the end-of-session flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EndSessionPhase {
    #[default]
    Idle,
    ExpectingGoodbye,
    WaitingForAudioDone,
    MonitoringSilence,
    Disconnecting,
}

impl fmt::Display for EndSessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndSessionPhase::Idle => write!(f, "idle"),
            EndSessionPhase::ExpectingGoodbye => write!(f, "expecting_goodbye"),
            EndSessionPhase::WaitingForAudioDone => write!(f, "waiting_for_audio_done"),
            EndSessionPhase::MonitoringSilence => write!(f, "monitoring_silence"),
            EndSessionPhase::Disconnecting => write!(f, "disconnecting"),
        }
    }
}

/// Which timer fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TimerKind {
    /// Bounded worst case from the end-session call
    Fallback,
    /// Scheduled after sink discovery failed
    Heuristic,
}

/// What triggered an automatic disconnect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "trigger")]
pub enum DisconnectReason {
    /// The monitor heard sustained silence or hit its failsafe
    Monitor { reason: CompletionReason },
    /// The fallback timer fired before the monitor attached
    FallbackTimeout,
    /// Sink discovery failed and the heuristic delay elapsed
    DiscoveryFailed { attempts: u32 },
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::Monitor { reason } => write!(f, "monitor {reason}"),
            DisconnectReason::FallbackTimeout => write!(f, "fallback timeout"),
            DisconnectReason::DiscoveryFailed { attempts } => {
                write!(f, "sink discovery failed after {attempts} attempts")
            }
        }
    }
}

/// Side effects the machine asks its owner to perform.
pub trait EndSessionEffects {
    /// Start a timer that reports `(id, kind)` back after `delay`. Cancelling
    /// the returned token must prevent the report.
    fn arm_timer(&mut self, id: u64, kind: TimerKind, delay: Duration) -> CancellationToken;

    /// Start a volume monitor whose events carry `id`. Cancelling the
    /// returned token must stop it.
    fn start_monitor(&mut self, id: u64) -> CancellationToken;

    /// Perform the single disconnect operation.
    fn disconnect(&mut self, reason: DisconnectReason);
}

#[derive(Debug)]
struct ActiveTimer {
    id: u64,
    token: CancellationToken,
}

#[derive(Debug)]
struct ActiveMonitor {
    id: u64,
    token: CancellationToken,
}

/// Serializable view of the machine.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EndSessionSnapshot {
    pub phase: EndSessionPhase,
    pub trigger_call_id: Option<String>,
    pub fallback_armed: bool,
    pub heuristic_armed: bool,
    pub monitor_id: Option<u64>,
    pub last_disconnect: Option<DisconnectReason>,
}

// =============================================================================
// Machine
// =============================================================================

/// Owns `EndSessionState`. Only the session event loop calls into it.
#[derive(Debug)]
pub struct EndSessionMachine {
    config: EndSessionConfig,
    phase: EndSessionPhase,
    trigger_call_id: Option<String>,
    goodbye_response_id: Option<String>,
    /// `audio_done` seen while still waiting for the goodbye response
    early_audio_done: Option<String>,
    fallback: Option<ActiveTimer>,
    heuristic: Option<ActiveTimer>,
    monitor: Option<ActiveMonitor>,
    /// Attempts reported by the last failed discovery
    pending_discovery_attempts: u32,
    last_disconnect: Option<DisconnectReason>,
    next_id: u64,
}

impl EndSessionMachine {
    pub fn new(config: EndSessionConfig) -> Self {
        Self {
            config,
            phase: EndSessionPhase::Idle,
            trigger_call_id: None,
            goodbye_response_id: None,
            early_audio_done: None,
            fallback: None,
            heuristic: None,
            monitor: None,
            pending_discovery_attempts: 0,
            last_disconnect: None,
            next_id: 0,
        }
    }

    pub fn phase(&self) -> EndSessionPhase {
        self.phase
    }

    pub fn trigger_call_id(&self) -> Option<&str> {
        self.trigger_call_id.as_deref()
    }

    pub fn snapshot(&self) -> EndSessionSnapshot {
        EndSessionSnapshot {
            phase: self.phase,
            trigger_call_id: self.trigger_call_id.clone(),
            fallback_armed: self.fallback.is_some(),
            heuristic_armed: self.heuristic.is_some(),
            monitor_id: self.monitor.as_ref().map(|m| m.id),
            last_disconnect: self.last_disconnect.clone(),
        }
    }

    fn allocate_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn set_phase(&mut self, phase: EndSessionPhase) {
        if self.phase != phase {
            info!(from = %self.phase, to = %phase, "End-of-session phase change");
            self.phase = phase;
        }
    }

    /// The end-session function reported success.
    pub fn on_end_session_confirmed(&mut self, call_id: &str, fx: &mut dyn EndSessionEffects) {
        if self.phase != EndSessionPhase::Idle {
            debug!(call_id, phase = %self.phase, "End session already in progress");
            return;
        }

        self.trigger_call_id = Some(call_id.to_string());
        self.goodbye_response_id = None;
        self.early_audio_done = None;

        let id = self.allocate_id();
        let delay = Duration::from_millis(self.config.fallback_timeout_ms);
        let token = fx.arm_timer(id, TimerKind::Fallback, delay);
        self.fallback = Some(ActiveTimer { id, token });

        self.set_phase(EndSessionPhase::ExpectingGoodbye);
    }

    /// A response finished.
    pub fn on_response_done(
        &mut self,
        response_id: &str,
        status: &str,
        function_call_ids: &[String],
        fx: &mut dyn EndSessionEffects,
    ) {
        if self.phase != EndSessionPhase::ExpectingGoodbye {
            return;
        }

        let issued_trigger = self
            .trigger_call_id
            .as_ref()
            .is_some_and(|id| function_call_ids.contains(id));

        if status != "completed" || issued_trigger {
            debug!(
                response_id,
                status, issued_trigger, "Response is not the goodbye, still waiting"
            );
            return;
        }

        self.goodbye_response_id = Some(response_id.to_string());
        self.set_phase(EndSessionPhase::WaitingForAudioDone);

        if self.early_audio_done.as_deref() == Some(response_id) {
            debug!(response_id, "Goodbye audio already finished sending");
            self.start_monitoring(fx);
        }
    }

    /// All audio for a response was sent.
    pub fn on_audio_done(&mut self, response_id: &str, fx: &mut dyn EndSessionEffects) {
        match self.phase {
            EndSessionPhase::ExpectingGoodbye => {
                self.early_audio_done = Some(response_id.to_string());
            }
            EndSessionPhase::WaitingForAudioDone => {
                if let Some(goodbye) = &self.goodbye_response_id {
                    if goodbye != response_id {
                        warn!(
                            response_id,
                            goodbye = %goodbye,
                            "audio_done for a different response, monitoring anyway"
                        );
                    }
                }
                self.start_monitoring(fx);
            }
            _ => {}
        }
    }

    fn start_monitoring(&mut self, fx: &mut dyn EndSessionEffects) {
        if let Some(previous) = self.monitor.take() {
            previous.token.cancel();
        }
        let id = self.allocate_id();
        let token = fx.start_monitor(id);
        self.monitor = Some(ActiveMonitor { id, token });
        self.set_phase(EndSessionPhase::MonitoringSilence);
    }

    /// Event from a volume monitor.
    pub fn on_monitor_event(&mut self, event: &MonitorEvent, fx: &mut dyn EndSessionEffects) {
        let current = self.monitor.as_ref().map(|m| m.id);
        if current != Some(event.monitor_id) || self.phase != EndSessionPhase::MonitoringSilence {
            debug!(monitor_id = event.monitor_id, "Ignoring event from stale monitor");
            return;
        }

        match &event.kind {
            MonitorEventKind::Attached { attempts } => {
                debug!(attempts, "Monitor attached, clearing fallback timer");
                if let Some(fallback) = self.fallback.take() {
                    fallback.token.cancel();
                }
            }
            MonitorEventKind::AttachFailed { attempts, reason } => {
                warn!(attempts, reason = %reason, "Monitor could not attach, scheduling heuristic disconnect");
                self.monitor = None;
                if let Some(previous) = self.heuristic.take() {
                    previous.token.cancel();
                }
                let id = self.allocate_id();
                let delay = self.config.heuristic_delay(*attempts);
                let token = fx.arm_timer(id, TimerKind::Heuristic, delay);
                self.heuristic = Some(ActiveTimer { id, token });
                self.pending_discovery_attempts = *attempts;
            }
            MonitorEventKind::Completed(reason) => {
                self.monitor = None;
                self.trigger_disconnect(DisconnectReason::Monitor { reason: *reason }, fx);
            }
        }
    }

    /// A timer armed through [`EndSessionEffects::arm_timer`] fired.
    pub fn on_timer_fired(&mut self, id: u64, kind: TimerKind, fx: &mut dyn EndSessionEffects) {
        match kind {
            TimerKind::Fallback => {
                if self.fallback.as_ref().map(|t| t.id) != Some(id) {
                    debug!(timer_id = id, "Ignoring stale fallback timer");
                    return;
                }
                self.fallback = None;
                warn!("Fallback timer fired before playback completion was observed");
                self.trigger_disconnect(DisconnectReason::FallbackTimeout, fx);
            }
            TimerKind::Heuristic => {
                if self.heuristic.as_ref().map(|t| t.id) != Some(id) {
                    debug!(timer_id = id, "Ignoring stale heuristic timer");
                    return;
                }
                self.heuristic = None;
                let attempts = self.pending_discovery_attempts;
                self.trigger_disconnect(DisconnectReason::DiscoveryFailed { attempts }, fx);
            }
        }
    }

    fn trigger_disconnect(&mut self, reason: DisconnectReason, fx: &mut dyn EndSessionEffects) {
        info!(reason = %reason, "Ending session");
        self.set_phase(EndSessionPhase::Disconnecting);
        self.cancel_all();
        self.last_disconnect = Some(reason.clone());
        fx.disconnect(reason);
        self.reset();
    }

    fn cancel_all(&mut self) {
        if let Some(timer) = self.fallback.take() {
            timer.token.cancel();
        }
        if let Some(timer) = self.heuristic.take() {
            timer.token.cancel();
        }
        if let Some(monitor) = self.monitor.take() {
            monitor.token.cancel();
        }
    }

    /// The session is being torn down from outside the machine (explicit
    /// disconnect or transport loss). An in-progress flow passes through
    /// `Disconnecting` before returning to `Idle`. Returns whether one was
    /// in progress.
    pub fn abandon(&mut self) -> bool {
        if self.phase == EndSessionPhase::Idle {
            self.cancel_all();
            return false;
        }
        info!(phase = %self.phase, "Session teardown, abandoning end-of-session flow");
        self.set_phase(EndSessionPhase::Disconnecting);
        self.reset();
        true
    }

    /// Cancel everything and return to `Idle`.
    fn reset(&mut self) {
        self.cancel_all();
        self.trigger_call_id = None;
        self.goodbye_response_id = None;
        self.early_audio_done = None;
        self.pending_discovery_attempts = 0;
        self.set_phase(EndSessionPhase::Idle);
    }
}
