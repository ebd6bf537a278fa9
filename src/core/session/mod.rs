//! Realtime conversation sessions.
//!
//! A session is one live conversation with a speech-capable backend over the
//! OpenAI Realtime protocol. Synthesized audio streams back and is played in
//! order; function calls requested by the model are executed against a
//! registry; and the session ends itself once the model has called the
//! end-session function and its goodbye has actually finished playing.
//!
//! # Components
//!
//! - [`ProtocolDispatcher`] - parses inbound frames and routes typed events
//! - [`FunctionBridge`] - executes function calls, one result per call ID
//! - [`PlaybackPipeline`] - ordered single-worker playback of audio chunks
//! - [`VolumeMonitor`] - FFT energy sampling of the playing audio
//! - [`EndSessionMachine`] - decides when the conversation is over
//! - [`SessionController`] - owns the lifecycle and wires everything together
//!
//! # Audio Format
//!
//! PCM 16-bit signed little-endian, mono, 24kHz by default.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use serde_json::json;
//! use waav_session::core::session::*;
//!
//! let registry = FunctionRegistry::new();
//! registry.register("end_session", handler_fn(|_| async move { Ok(json!({"ok": true})) }));
//!
//! let output = VirtualOutput::new(24_000);
//! let controller = SessionController::new(
//!     ControllerConfig::default(),
//!     Box::new(WebSocketTransport::new(OPENAI_REALTIME_URL, "gpt-4o-realtime-preview", key)),
//!     registry,
//!     Arc::new(output.clone()),
//!     Arc::new(output),
//! );
//!
//! controller.on_transcript(Arc::new(|t| Box::pin(async move {
//!     println!("[{}] {}", t.role, t.text);
//! })));
//! controller.connect().await?;
//! ```

mod base;
pub mod controller;
pub mod end_session;
pub mod functions;
pub mod monitor;
pub mod playback;
pub mod protocol;
pub mod sink;
pub mod transport;

pub use base::{
    AsyncListener, ConnectionState, FunctionCallRequest, ListenerSet, SessionError,
    SessionErrorCallback, SessionInfo, SessionResult, StateChangeCallback, Subscription,
    TranscriptCallback, TranscriptResult, TranscriptRole,
};
pub use controller::{
    ControllerConfig, DEFAULT_FUNCTION_TIMEOUT_MS, FunctionCallStats, SessionController,
    SessionDiagnostics,
};
pub use end_session::{
    DisconnectReason, EndSessionConfig, EndSessionEffects, EndSessionMachine, EndSessionPhase,
    EndSessionSnapshot, TimerKind,
};
pub use functions::{
    FunctionBridge, FunctionDefinition, FunctionHandler, FunctionOutcome, FunctionRegistry,
    FunctionResult, handler_fn,
};
pub use monitor::{
    CompletionReason, EnergyMeter, MonitorConfig, MonitorEvent, MonitorEventKind,
    MonitorEventSink, MonitorHandle, MonitorStatus, SilenceTracker, VolumeMonitor, hann_window,
};
pub use playback::{
    AudioChunk, AudioMessage, PlaybackError, PlaybackEvent, PlaybackPipeline, PlaybackState,
    PlaybackStats,
};
pub use protocol::{
    ApiError, ClientEvent, ConversationItem, DispatcherCallbacks, DispatcherStats, EventHandler,
    ProtocolDispatcher, ProtocolEvent, ServerEvent, SessionUpdateConfig, ToolDef, parse_frame,
};
pub use sink::{AudioSink, SignalTap, SinkError, SinkLocator, VirtualOutput, pcm16_to_f32};
pub use transport::{
    OPENAI_REALTIME_URL, Transport, TransportChannels, TransportFrame, WebSocketTransport,
};
