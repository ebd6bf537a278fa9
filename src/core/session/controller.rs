//! Session lifecycle controller.
//!
//! [`SessionController`] owns one conversation with the realtime backend. It
//! opens the transport, wires the protocol dispatcher, the function bridge,
//! the playback pipeline and the volume monitor together, and drives the
//! end-of-session state machine.
//!
//! All state changes happen on a single event-loop task. Everything else
//! (the frame pump, function executions, timers, monitors) runs on its own
//! task and only posts [`ControlEvent`]s to that loop. A per-session
//! [`CancellationToken`] parents every one of those tasks so a disconnect
//! stops them all at once.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use waav_session::core::session::*;
//!
//! let output = VirtualOutput::new(24_000);
//! let transport = WebSocketTransport::new(OPENAI_REALTIME_URL, "gpt-4o-realtime-preview", api_key);
//! let controller = SessionController::new(
//!     ControllerConfig::default(),
//!     Box::new(transport),
//!     registry,
//!     Arc::new(output.clone()),
//!     Arc::new(output),
//! );
//! controller.connect().await?;
//! controller.send_message("Hello!");
//! ```

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::base::{
    ConnectionState, FunctionCallRequest, ListenerSet, SessionError, SessionErrorCallback,
    SessionInfo, SessionResult, StateChangeCallback, Subscription, TranscriptCallback,
    TranscriptResult, TranscriptRole,
};
use super::end_session::{
    DisconnectReason, EndSessionConfig, EndSessionEffects, EndSessionMachine, EndSessionSnapshot,
    TimerKind,
};
use super::functions::{FunctionBridge, FunctionOutcome, FunctionRegistry};
use super::monitor::{
    MonitorConfig, MonitorEvent, MonitorEventKind, MonitorHandle, MonitorStatus, VolumeMonitor,
};
use super::playback::{PlaybackPipeline, PlaybackStats};
use super::protocol::{
    ApiError, ClientEvent, ConversationItem, DispatcherCallbacks, DispatcherStats, EventHandler,
    InputAudioTranscription, ProtocolDispatcher, ProtocolEvent, SessionUpdateConfig,
};
use super::sink::{AudioSink, SinkLocator};
use super::transport::{Transport, TransportFrame};

/// Default upper bound for one function execution.
pub const DEFAULT_FUNCTION_TIMEOUT_MS: u64 = 30_000;

// =============================================================================
// Configuration
// =============================================================================

/// Settings for one controller.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// System instructions sent with `session.update`
    pub instructions: Option<String>,
    /// Output voice
    pub voice: Option<String>,
    /// Model used to transcribe the user's audio, if any
    pub transcription_model: Option<String>,
    /// Name of the function that ends the session
    pub end_session_function: String,
    /// Upper bound for one function execution
    pub function_timeout: Duration,
    pub end_session: EndSessionConfig,
    pub monitor: MonitorConfig,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            instructions: None,
            voice: None,
            transcription_model: None,
            end_session_function: "end_session".to_string(),
            function_timeout: Duration::from_millis(DEFAULT_FUNCTION_TIMEOUT_MS),
            end_session: EndSessionConfig::default(),
            monitor: MonitorConfig::default(),
        }
    }
}

// =============================================================================
// Diagnostics
// =============================================================================

/// Function call counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FunctionCallStats {
    pub requested: u64,
    pub succeeded: u64,
    pub failed: u64,
    /// Results that could not be handed to the transport
    pub undelivered: u64,
}

/// Point-in-time view of a controller.
#[derive(Debug, Clone, Serialize)]
pub struct SessionDiagnostics {
    pub session: SessionInfo,
    pub remote_session_id: Option<String>,
    pub state: ConnectionState,
    pub end_session: EndSessionSnapshot,
    pub dispatcher: DispatcherStats,
    pub playback: PlaybackStats,
    pub monitor: Option<MonitorStatus>,
    pub functions: FunctionCallStats,
    pub registered_functions: Vec<String>,
    pub disconnect_requests: u64,
    pub disconnects_performed: u64,
}

// =============================================================================
// Control Events
// =============================================================================

/// Everything the event loop reacts to.
#[derive(Debug)]
enum ControlEvent {
    Protocol(ProtocolEvent),
    ParseError(SessionError),
    FunctionSettled(FunctionOutcome),
    Monitor(MonitorEvent),
    TimerFired { id: u64, kind: TimerKind },
    TransportClosed { reason: String },
}

type ControlSender = mpsc::UnboundedSender<ControlEvent>;

fn forward<T, F>(events: &ControlSender, wrap: F) -> EventHandler<T>
where
    T: Send + 'static,
    F: Fn(T) -> ControlEvent + Send + Sync + 'static,
{
    let events = events.clone();
    Arc::new(move |value: T| {
        let _ = events.send(wrap(value));
        Box::pin(async {})
    })
}

/// Dispatcher table that forwards every event into the control loop.
fn forwarding_callbacks(events: &ControlSender) -> DispatcherCallbacks {
    DispatcherCallbacks {
        on_function_call: forward(events, |request: FunctionCallRequest| {
            ControlEvent::Protocol(ProtocolEvent::FunctionCall(request))
        }),
        on_audio_delta: forward(
            events,
            |(response_id, item_id, data): (String, Option<String>, Bytes)| {
                ControlEvent::Protocol(ProtocolEvent::AudioDelta {
                    response_id,
                    item_id,
                    data,
                })
            },
        ),
        on_transcript_delta: forward(events, |(response_id, delta): (String, String)| {
            ControlEvent::Protocol(ProtocolEvent::TranscriptDelta { response_id, delta })
        }),
        on_transcript_done: forward(events, |(response_id, transcript): (String, String)| {
            ControlEvent::Protocol(ProtocolEvent::TranscriptDone {
                response_id,
                transcript,
            })
        }),
        on_audio_done: forward(events, |response_id: String| {
            ControlEvent::Protocol(ProtocolEvent::AudioDone { response_id })
        }),
        on_response_done: forward(
            events,
            |(response_id, status, function_call_ids): (String, String, Vec<String>)| {
                ControlEvent::Protocol(ProtocolEvent::ResponseDone {
                    response_id,
                    status,
                    function_call_ids,
                })
            },
        ),
        on_error: forward(events, |error: ApiError| {
            ControlEvent::Protocol(ProtocolEvent::Error(error))
        }),
        on_session_created: forward(events, |session_id: String| {
            ControlEvent::Protocol(ProtocolEvent::SessionCreated { session_id })
        }),
        on_speech_started: forward(events, |(item_id, audio_start_ms): (String, u64)| {
            ControlEvent::Protocol(ProtocolEvent::SpeechStarted {
                item_id,
                audio_start_ms,
            })
        }),
        on_user_transcript: forward(events, |(item_id, transcript): (String, String)| {
            ControlEvent::Protocol(ProtocolEvent::UserTranscript {
                item_id,
                transcript,
            })
        }),
        on_parse_error: forward(events, ControlEvent::ParseError),
    }
}

// =============================================================================
// Controller
// =============================================================================

struct ControllerInner {
    config: ControllerConfig,
    registry: FunctionRegistry,
    transport: tokio::sync::Mutex<Box<dyn Transport>>,
    playback: PlaybackPipeline,
    locator: Arc<dyn SinkLocator>,

    state: RwLock<ConnectionState>,
    session: RwLock<SessionInfo>,
    remote_session_id: RwLock<Option<String>>,
    outbound: RwLock<Option<mpsc::Sender<ClientEvent>>>,
    cancel: Mutex<Option<CancellationToken>>,
    dispatcher: RwLock<Option<Arc<ProtocolDispatcher>>>,
    event_loop: Mutex<Option<JoinHandle<()>>>,
    connect_lock: tokio::sync::Mutex<()>,

    /// Set while no live session exists; the first teardown path to swap it
    /// performs the teardown
    closed: AtomicBool,
    end_session: Mutex<EndSessionMachine>,
    monitor: Mutex<Option<MonitorHandle>>,
    last_monitor_status: Mutex<Option<MonitorStatus>>,

    state_listeners: Arc<ListenerSet<ConnectionState>>,
    transcript_listeners: Arc<ListenerSet<TranscriptResult>>,
    error_listeners: Arc<ListenerSet<SessionError>>,

    functions_requested: AtomicU64,
    functions_succeeded: AtomicU64,
    functions_failed: AtomicU64,
    functions_undelivered: AtomicU64,
    disconnect_requests: AtomicU64,
    disconnects_performed: AtomicU64,
}

/// Handle to one realtime conversation. Cheap to clone.
#[derive(Clone)]
pub struct SessionController {
    inner: Arc<ControllerInner>,
}

impl SessionController {
    pub fn new(
        config: ControllerConfig,
        transport: Box<dyn Transport>,
        registry: FunctionRegistry,
        sink: Arc<dyn AudioSink>,
        locator: Arc<dyn SinkLocator>,
    ) -> Self {
        let end_session = EndSessionMachine::new(config.end_session.clone());
        Self {
            inner: Arc::new(ControllerInner {
                config,
                registry,
                transport: tokio::sync::Mutex::new(transport),
                playback: PlaybackPipeline::new(sink),
                locator,
                state: RwLock::new(ConnectionState::Disconnected),
                session: RwLock::new(SessionInfo::new()),
                remote_session_id: RwLock::new(None),
                outbound: RwLock::new(None),
                cancel: Mutex::new(None),
                dispatcher: RwLock::new(None),
                event_loop: Mutex::new(None),
                connect_lock: tokio::sync::Mutex::new(()),
                closed: AtomicBool::new(true),
                end_session: Mutex::new(end_session),
                monitor: Mutex::new(None),
                last_monitor_status: Mutex::new(None),
                state_listeners: ListenerSet::new(),
                transcript_listeners: ListenerSet::new(),
                error_listeners: ListenerSet::new(),
                functions_requested: AtomicU64::new(0),
                functions_succeeded: AtomicU64::new(0),
                functions_failed: AtomicU64::new(0),
                functions_undelivered: AtomicU64::new(0),
                disconnect_requests: AtomicU64::new(0),
                disconnects_performed: AtomicU64::new(0),
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.read()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn session_info(&self) -> SessionInfo {
        self.inner.session.read().clone()
    }

    pub fn playback(&self) -> &PlaybackPipeline {
        &self.inner.playback
    }

    /// Open the transport and start a fresh session.
    ///
    /// A no-op while already connecting or connected.
    pub async fn connect(&self) -> SessionResult<()> {
        let inner = &self.inner;
        let _guard = inner.connect_lock.lock().await;

        match self.state() {
            ConnectionState::Connected | ConnectionState::Connecting => {
                debug!("connect() ignored, session already active");
                return Ok(());
            }
            ConnectionState::Disconnected | ConnectionState::Failed => {}
        }

        let session = SessionInfo::new();
        let session_id = session.id.clone();
        *inner.session.write() = session;
        *inner.remote_session_id.write() = None;
        *inner.last_monitor_status.lock() = None;
        inner.set_state(ConnectionState::Connecting).await;

        info!(session_id = %session_id, "Connecting session");

        let opened = inner.transport.lock().await.open().await;
        let channels = match opened {
            Ok(channels) => channels,
            Err(e) => {
                error!(session_id = %session_id, "Failed to open transport: {}", e);
                inner.set_state(ConnectionState::Failed).await;
                inner.error_listeners.emit(e.clone()).await;
                return Err(e);
            }
        };

        let token = CancellationToken::new();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let dispatcher = Arc::new(ProtocolDispatcher::new(forwarding_callbacks(&events_tx)));
        let bridge = FunctionBridge::new(
            inner.registry.clone(),
            inner.config.end_session_function.clone(),
            inner.config.function_timeout,
        );

        *inner.outbound.write() = Some(channels.outbound);
        *inner.cancel.lock() = Some(token.clone());
        *inner.dispatcher.write() = Some(dispatcher.clone());
        inner.closed.store(false, Ordering::Release);

        let update = inner.session_update();
        if !inner.send_event(ClientEvent::SessionUpdate { session: update }) {
            warn!(session_id = %session_id, "Failed to queue session.update");
        }

        // Published before the tasks start, so a transport that closes at
        // once can only move the state on to Failed.
        inner.set_state(ConnectionState::Connected).await;
        info!(
            session_id = %session_id,
            functions = inner.registry.len(),
            "Session connected"
        );

        tokio::spawn(pump_frames(
            channels.inbound,
            dispatcher,
            events_tx.clone(),
            token.clone(),
        ));

        let event_loop = tokio::spawn(run_event_loop(
            inner.clone(),
            events_rx,
            events_tx,
            bridge,
            token,
        ));
        if let Some(previous) = inner.event_loop.lock().replace(event_loop) {
            previous.abort();
        }
        Ok(())
    }

    /// End the session. Idempotent: only the first call tears down.
    pub async fn disconnect(&self) -> SessionResult<()> {
        self.inner.disconnect_requests.fetch_add(1, Ordering::Relaxed);
        self.inner
            .teardown(ConnectionState::Disconnected, "requested")
            .await;
        Ok(())
    }

    /// Send a user text message and request a response.
    pub fn send_message(&self, text: &str) -> bool {
        if !self.is_connected() {
            warn!("send_message() while not connected");
            return false;
        }
        self.inner.send_event(ClientEvent::ConversationItemCreate {
            item: ConversationItem::user_text(text),
        }) && self.inner.send_event(ClientEvent::ResponseCreate)
    }

    /// Send a function output for `call_id` and request a response.
    pub fn send_function_result(&self, call_id: &str, output: &str) -> bool {
        if !self.is_connected() {
            return false;
        }
        self.inner.send_function_output(call_id, output.to_string())
    }

    /// Append PCM16 input audio to the backend's input buffer.
    pub fn send_audio(&self, pcm: &[u8]) -> bool {
        if !self.is_connected() {
            return false;
        }
        self.inner.send_event(ClientEvent::audio_append(pcm))
    }

    pub fn on_state_change(&self, callback: StateChangeCallback) -> Subscription {
        self.inner.state_listeners.subscribe(callback)
    }

    pub fn on_transcript(&self, callback: TranscriptCallback) -> Subscription {
        self.inner.transcript_listeners.subscribe(callback)
    }

    pub fn on_error(&self, callback: SessionErrorCallback) -> Subscription {
        self.inner.error_listeners.subscribe(callback)
    }

    pub fn diagnostics(&self) -> SessionDiagnostics {
        let inner = &self.inner;
        let monitor = inner
            .monitor
            .lock()
            .as_ref()
            .map(MonitorHandle::status)
            .or_else(|| inner.last_monitor_status.lock().clone());

        SessionDiagnostics {
            session: inner.session.read().clone(),
            remote_session_id: inner.remote_session_id.read().clone(),
            state: self.state(),
            end_session: inner.end_session.lock().snapshot(),
            dispatcher: inner
                .dispatcher
                .read()
                .as_ref()
                .map(|d| d.stats())
                .unwrap_or_default(),
            playback: inner.playback.stats(),
            monitor,
            functions: FunctionCallStats {
                requested: inner.functions_requested.load(Ordering::Relaxed),
                succeeded: inner.functions_succeeded.load(Ordering::Relaxed),
                failed: inner.functions_failed.load(Ordering::Relaxed),
                undelivered: inner.functions_undelivered.load(Ordering::Relaxed),
            },
            registered_functions: inner.registry.names(),
            disconnect_requests: inner.disconnect_requests.load(Ordering::Relaxed),
            disconnects_performed: inner.disconnects_performed.load(Ordering::Relaxed),
        }
    }
}

impl ControllerInner {
    fn session_id(&self) -> String {
        self.session.read().id.clone()
    }

    async fn set_state(&self, state: ConnectionState) {
        let previous = std::mem::replace(&mut *self.state.write(), state);
        if previous != state {
            info!(session_id = %self.session_id(), from = %previous, to = %state, "Connection state change");
            self.state_listeners.emit(state).await;
        }
    }

    fn session_update(&self) -> SessionUpdateConfig {
        let tools = self.registry.tool_definitions();
        let has_tools = !tools.is_empty();
        SessionUpdateConfig {
            modalities: Some(vec!["text".to_string(), "audio".to_string()]),
            instructions: self.config.instructions.clone(),
            voice: self.config.voice.clone(),
            input_audio_format: Some("pcm16".to_string()),
            output_audio_format: Some("pcm16".to_string()),
            input_audio_transcription: self
                .config
                .transcription_model
                .clone()
                .map(|model| InputAudioTranscription { model }),
            tools: has_tools.then_some(tools),
            tool_choice: has_tools.then(|| "auto".to_string()),
        }
    }

    fn send_event(&self, event: ClientEvent) -> bool {
        let outbound = self.outbound.read();
        let Some(sender) = outbound.as_ref() else {
            return false;
        };
        let kind = event.kind();
        match sender.try_send(event) {
            Ok(()) => true,
            Err(e) => {
                warn!(kind, "Failed to queue client event: {}", e);
                false
            }
        }
    }

    fn send_function_output(&self, call_id: &str, output: String) -> bool {
        self.send_event(ClientEvent::ConversationItemCreate {
            item: ConversationItem::function_output(call_id, output),
        }) && self.send_event(ClientEvent::ResponseCreate)
    }

    /// Single teardown path for every way a session ends.
    async fn teardown(&self, final_state: ConnectionState, reason: &str) {
        if self.closed.swap(true, Ordering::AcqRel) {
            debug!(reason, "Session already torn down");
            return;
        }

        let session_id = self.session_id();
        info!(session_id = %session_id, reason, "Tearing down session");

        if let Some(token) = self.cancel.lock().take() {
            token.cancel();
        }
        self.end_session.lock().abandon();
        if let Some(monitor) = self.monitor.lock().take() {
            monitor.stop();
            *self.last_monitor_status.lock() = Some(monitor.status());
        }
        self.outbound.write().take();
        self.playback.clear();

        if let Err(e) = self.transport.lock().await.close().await {
            warn!(session_id = %session_id, "Failed to close transport: {}", e);
        }

        self.disconnects_performed.fetch_add(1, Ordering::Relaxed);
        self.set_state(final_state).await;
    }

    async fn emit_transcript(&self, text: String, role: TranscriptRole, is_final: bool, id: String) {
        self.transcript_listeners
            .emit(TranscriptResult {
                text,
                role,
                is_final,
                correlation_id: Some(id),
            })
            .await;
    }

    async fn handle_protocol_event(
        &self,
        event: ProtocolEvent,
        bridge: &FunctionBridge,
        events: &ControlSender,
        token: &CancellationToken,
    ) -> Option<DisconnectReason> {
        match event {
            ProtocolEvent::FunctionCall(request) => {
                self.functions_requested.fetch_add(1, Ordering::Relaxed);
                debug!(call_id = %request.call_id, function = %request.name, "Function call received");
                let bridge = bridge.clone();
                let events = events.clone();
                // Not a child of the session token: in-flight calls finish and
                // their results are dropped once the loop is gone.
                tokio::spawn(async move {
                    if let Some(outcome) = bridge.execute(request).await {
                        let _ = events.send(ControlEvent::FunctionSettled(outcome));
                    }
                });
                None
            }
            ProtocolEvent::AudioDelta {
                response_id, data, ..
            } => {
                if let Err(e) = self.playback.ingest(&response_id, data) {
                    warn!(response_id = %response_id, "Dropping audio chunk: {}", e);
                }
                None
            }
            ProtocolEvent::TranscriptDelta { response_id, delta } => {
                self.emit_transcript(delta, TranscriptRole::Assistant, false, response_id)
                    .await;
                None
            }
            ProtocolEvent::TranscriptDone {
                response_id,
                transcript,
            } => {
                debug!(response_id = %response_id, "Assistant transcript complete");
                self.emit_transcript(transcript, TranscriptRole::Assistant, true, response_id)
                    .await;
                None
            }
            ProtocolEvent::AudioDone { response_id } => {
                debug!(response_id = %response_id, "Response audio complete");
                self.playback.complete_message(&response_id);
                self.with_machine(events, token, |machine, fx| {
                    machine.on_audio_done(&response_id, fx)
                })
            }
            ProtocolEvent::ResponseDone {
                response_id,
                status,
                function_call_ids,
            } => {
                debug!(response_id = %response_id, status = %status, "Response done");
                self.with_machine(events, token, |machine, fx| {
                    machine.on_response_done(&response_id, &status, &function_call_ids, fx)
                })
            }
            ProtocolEvent::Error(api_error) => {
                error!(
                    error_type = %api_error.error_type,
                    code = api_error.code.as_deref().unwrap_or_default(),
                    "Backend error: {}",
                    api_error.message
                );
                self.error_listeners
                    .emit(SessionError::ProviderError(api_error.message))
                    .await;
                None
            }
            ProtocolEvent::SessionCreated { session_id } => {
                info!(session_id = %self.session_id(), remote_session_id = %session_id, "Backend session created");
                *self.remote_session_id.write() = Some(session_id);
                None
            }
            ProtocolEvent::SpeechStarted {
                item_id,
                audio_start_ms,
            } => {
                debug!(item_id = %item_id, audio_start_ms, "User speech started");
                None
            }
            ProtocolEvent::UserTranscript {
                item_id,
                transcript,
            } => {
                self.emit_transcript(transcript, TranscriptRole::User, true, item_id)
                    .await;
                None
            }
        }
    }

    async fn handle_function_settled(
        &self,
        outcome: FunctionOutcome,
        events: &ControlSender,
        token: &CancellationToken,
    ) -> Option<DisconnectReason> {
        let FunctionOutcome {
            name,
            result,
            error,
            end_session_confirmed,
        } = outcome;

        if result.success {
            self.functions_succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.functions_failed.fetch_add(1, Ordering::Relaxed);
        }
        if let Some(error) = error {
            self.error_listeners.emit(error).await;
        }

        let delivered = self.send_function_output(&result.call_id, result.output().to_string());
        if !delivered {
            self.functions_undelivered.fetch_add(1, Ordering::Relaxed);
            warn!(call_id = %result.call_id, function = %name, "Function result not delivered");
        }

        if end_session_confirmed {
            info!(call_id = %result.call_id, "End-session function confirmed");
            let call_id = result.call_id;
            return self.with_machine(events, token, |machine, fx| {
                machine.on_end_session_confirmed(&call_id, fx)
            });
        }
        None
    }

    /// Run one machine step with effects bound to this session.
    fn with_machine<F>(
        &self,
        events: &ControlSender,
        token: &CancellationToken,
        step: F,
    ) -> Option<DisconnectReason>
    where
        F: FnOnce(&mut EndSessionMachine, &mut dyn EndSessionEffects),
    {
        let mut effects = SessionEffects {
            inner: self,
            events,
            token,
            disconnect: None,
        };
        step(&mut self.end_session.lock(), &mut effects);
        effects.disconnect
    }
}

/// Effects of the end-of-session machine, bound to one live session.
struct SessionEffects<'a> {
    inner: &'a ControllerInner,
    events: &'a ControlSender,
    token: &'a CancellationToken,
    disconnect: Option<DisconnectReason>,
}

impl EndSessionEffects for SessionEffects<'_> {
    fn arm_timer(&mut self, id: u64, kind: TimerKind, delay: Duration) -> CancellationToken {
        let timer = self.token.child_token();
        let cancelled = timer.clone();
        let events = self.events.clone();
        debug!(timer_id = id, ?kind, delay_ms = delay.as_millis() as u64, "Arming timer");
        tokio::spawn(async move {
            tokio::select! {
                _ = cancelled.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let _ = events.send(ControlEvent::TimerFired { id, kind });
                }
            }
        });
        timer
    }

    fn start_monitor(&mut self, id: u64) -> CancellationToken {
        let events = self.events.clone();
        let handle = VolumeMonitor::start(
            id,
            self.inner.config.monitor.clone(),
            self.inner.locator.clone(),
            self.token,
            Arc::new(move |event: MonitorEvent| {
                let _ = events.send(ControlEvent::Monitor(event));
            }),
        );
        let token = handle.cancellation_token();
        if let Some(previous) = self.inner.monitor.lock().replace(handle) {
            previous.stop();
        }
        token
    }

    fn disconnect(&mut self, reason: DisconnectReason) {
        self.disconnect = Some(reason);
    }
}

/// Feed inbound frames through the dispatcher in arrival order.
async fn pump_frames(
    mut inbound: mpsc::Receiver<TransportFrame>,
    dispatcher: Arc<ProtocolDispatcher>,
    events: ControlSender,
    token: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            frame = inbound.recv() => frame,
        };

        match frame {
            Some(TransportFrame::Text(text)) => dispatcher.dispatch(&text).await,
            Some(TransportFrame::Closed { reason }) => {
                let _ = events.send(ControlEvent::TransportClosed { reason });
                break;
            }
            Some(TransportFrame::Error(e)) => {
                let _ = events.send(ControlEvent::TransportClosed { reason: e });
                break;
            }
            None => {
                let _ = events.send(ControlEvent::TransportClosed {
                    reason: "inbound channel closed".to_string(),
                });
                break;
            }
        }
    }
}

async fn run_event_loop(
    inner: Arc<ControllerInner>,
    mut events_rx: mpsc::UnboundedReceiver<ControlEvent>,
    events_tx: ControlSender,
    bridge: FunctionBridge,
    token: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            event = events_rx.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        let disconnect = match event {
            ControlEvent::Protocol(event) => {
                inner
                    .handle_protocol_event(event, &bridge, &events_tx, &token)
                    .await
            }
            ControlEvent::ParseError(e) => {
                inner.error_listeners.emit(e).await;
                None
            }
            ControlEvent::FunctionSettled(outcome) => {
                inner
                    .handle_function_settled(outcome, &events_tx, &token)
                    .await
            }
            ControlEvent::Monitor(event) => {
                debug!(monitor_id = event.monitor_id, kind = ?event.kind, "Monitor event");
                let current = match inner.monitor.lock().as_ref() {
                    Some(handle) if handle.id() == event.monitor_id => {
                        *inner.last_monitor_status.lock() = Some(handle.status());
                        true
                    }
                    _ => false,
                };
                if current {
                    if let MonitorEventKind::AttachFailed { reason, .. } = &event.kind {
                        inner
                            .error_listeners
                            .emit(SessionError::SinkUnavailable(reason.clone()))
                            .await;
                    }
                }
                inner.with_machine(&events_tx, &token, |machine, fx| {
                    machine.on_monitor_event(&event, fx)
                })
            }
            ControlEvent::TimerFired { id, kind } => {
                inner.with_machine(&events_tx, &token, |machine, fx| {
                    machine.on_timer_fired(id, kind, fx)
                })
            }
            ControlEvent::TransportClosed { reason } => {
                if inner.closed.load(Ordering::Acquire) {
                    break;
                }
                error!(session_id = %inner.session_id(), reason = %reason, "Transport closed unexpectedly");
                inner
                    .error_listeners
                    .emit(SessionError::ConnectionLost(reason.clone()))
                    .await;
                inner
                    .teardown(ConnectionState::Failed, "connection lost")
                    .await;
                break;
            }
        };

        if let Some(reason) = disconnect {
            inner.disconnect_requests.fetch_add(1, Ordering::Relaxed);
            inner
                .teardown(ConnectionState::Disconnected, &reason.to_string())
                .await;
            break;
        }
    }
    debug!("Session event loop stopped");
}
