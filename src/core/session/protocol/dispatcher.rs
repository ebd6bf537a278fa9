//! Protocol event dispatcher.
//!
//! Turns raw transport frames into [`ProtocolEvent`]s and routes each one to
//! exactly one callback in a [`DispatcherCallbacks`] table. The dispatcher
//! holds no session state. Unknown event types are traced and dropped;
//! malformed frames are reported through the parse-error callback and never
//! stop the processing of later frames.

use bytes::Bytes;
use serde::Serialize;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, trace, warn};

use super::messages::{ApiError, ServerEvent};
use crate::core::session::base::{FunctionCallRequest, SessionError};

// =============================================================================
// Events
// =============================================================================

/// A typed inbound protocol event.
#[derive(Debug, Clone)]
pub enum ProtocolEvent {
    /// The backend asked for a function to be executed
    FunctionCall(FunctionCallRequest),
    /// A chunk of synthesized speech
    AudioDelta {
        response_id: String,
        item_id: Option<String>,
        data: Bytes,
    },
    /// Assistant transcript fragment
    TranscriptDelta { response_id: String, delta: String },
    /// Final assistant transcript for one response item
    TranscriptDone {
        response_id: String,
        transcript: String,
    },
    /// All audio for a response has been sent
    AudioDone { response_id: String },
    /// A response finished
    ResponseDone {
        response_id: String,
        status: String,
        /// Call IDs of function calls issued by this response
        function_call_ids: Vec<String>,
    },
    /// Error reported by the backend
    Error(ApiError),
    /// The backend accepted the session
    SessionCreated { session_id: String },
    /// Server VAD detected the user speaking
    SpeechStarted { item_id: String, audio_start_ms: u64 },
    /// Transcript of the user's input audio
    UserTranscript { item_id: String, transcript: String },
}

impl ProtocolEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            ProtocolEvent::FunctionCall(_) => "function_call",
            ProtocolEvent::AudioDelta { .. } => "audio_delta",
            ProtocolEvent::TranscriptDelta { .. } => "transcript_delta",
            ProtocolEvent::TranscriptDone { .. } => "transcript_done",
            ProtocolEvent::AudioDone { .. } => "audio_done",
            ProtocolEvent::ResponseDone { .. } => "response_done",
            ProtocolEvent::Error(_) => "error",
            ProtocolEvent::SessionCreated { .. } => "session_created",
            ProtocolEvent::SpeechStarted { .. } => "speech_started",
            ProtocolEvent::UserTranscript { .. } => "user_transcript",
        }
    }
}

impl TryFrom<ServerEvent> for ProtocolEvent {
    type Error = SessionError;

    fn try_from(event: ServerEvent) -> Result<Self, SessionError> {
        let mapped = match event {
            ServerEvent::FunctionCallArgumentsDone {
                response_id,
                call_id,
                name,
                arguments,
                ..
            } => ProtocolEvent::FunctionCall(FunctionCallRequest {
                name,
                call_id,
                arguments,
                response_id,
            }),
            ServerEvent::AudioDelta {
                response_id,
                item_id,
                delta,
            } => {
                let data = ServerEvent::decode_audio_delta(&delta).map_err(|e| {
                    SessionError::MalformedEvent(format!("invalid base64 audio delta: {e}"))
                })?;
                ProtocolEvent::AudioDelta {
                    response_id,
                    item_id,
                    data: Bytes::from(data),
                }
            }
            ServerEvent::AudioTranscriptDelta {
                response_id, delta, ..
            } => ProtocolEvent::TranscriptDelta { response_id, delta },
            ServerEvent::AudioTranscriptDone {
                response_id,
                transcript,
                ..
            } => ProtocolEvent::TranscriptDone {
                response_id,
                transcript,
            },
            ServerEvent::AudioDone { response_id, .. } => ProtocolEvent::AudioDone { response_id },
            ServerEvent::ResponseDone { response } => ProtocolEvent::ResponseDone {
                function_call_ids: response.function_call_ids(),
                response_id: response.id,
                status: response.status,
            },
            ServerEvent::Error { error } => ProtocolEvent::Error(error),
            ServerEvent::SessionCreated { session } => ProtocolEvent::SessionCreated {
                session_id: session.id,
            },
            ServerEvent::SpeechStarted {
                item_id,
                audio_start_ms,
            } => ProtocolEvent::SpeechStarted {
                item_id,
                audio_start_ms,
            },
            ServerEvent::TranscriptionCompleted {
                item_id,
                transcript,
            } => ProtocolEvent::UserTranscript {
                item_id,
                transcript,
            },
        };
        Ok(mapped)
    }
}

/// Parse one text frame.
///
/// Returns `Ok(None)` for well-formed frames whose `type` is not one the
/// session understands.
pub fn parse_frame(frame: &str) -> Result<Option<ProtocolEvent>, SessionError> {
    let value: serde_json::Value = serde_json::from_str(frame)
        .map_err(|e| SessionError::MalformedEvent(format!("invalid JSON: {e}")))?;

    let event_type = value
        .get("type")
        .and_then(|t| t.as_str())
        .ok_or_else(|| SessionError::MalformedEvent("missing event type".to_string()))?;

    if !ServerEvent::is_known_type(event_type) {
        trace!(event_type, "Dropping unrecognized server event");
        return Ok(None);
    }

    let event_type = event_type.to_string();
    let event: ServerEvent = serde_json::from_value(value)
        .map_err(|e| SessionError::MalformedEvent(format!("{event_type}: {e}")))?;

    ProtocolEvent::try_from(event).map(Some)
}

// =============================================================================
// Callback Table
// =============================================================================

/// Async event handler.
pub type EventHandler<T> =
    Arc<dyn Fn(T) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

fn noop<T: Send + 'static>() -> EventHandler<T> {
    Arc::new(|_| Box::pin(async {}))
}

/// One handler per event kind. Every handler defaults to a no-op.
#[derive(Clone)]
pub struct DispatcherCallbacks {
    pub on_function_call: EventHandler<FunctionCallRequest>,
    /// `(response_id, item_id, pcm)`
    pub on_audio_delta: EventHandler<(String, Option<String>, Bytes)>,
    /// `(response_id, delta)`
    pub on_transcript_delta: EventHandler<(String, String)>,
    /// `(response_id, transcript)`
    pub on_transcript_done: EventHandler<(String, String)>,
    /// `response_id`
    pub on_audio_done: EventHandler<String>,
    /// `(response_id, status, function_call_ids)`
    pub on_response_done: EventHandler<(String, String, Vec<String>)>,
    pub on_error: EventHandler<ApiError>,
    /// `session_id`
    pub on_session_created: EventHandler<String>,
    /// `(item_id, audio_start_ms)`
    pub on_speech_started: EventHandler<(String, u64)>,
    /// `(item_id, transcript)`
    pub on_user_transcript: EventHandler<(String, String)>,
    pub on_parse_error: EventHandler<SessionError>,
}

impl Default for DispatcherCallbacks {
    fn default() -> Self {
        Self {
            on_function_call: noop(),
            on_audio_delta: noop(),
            on_transcript_delta: noop(),
            on_transcript_done: noop(),
            on_audio_done: noop(),
            on_response_done: noop(),
            on_error: noop(),
            on_session_created: noop(),
            on_speech_started: noop(),
            on_user_transcript: noop(),
            on_parse_error: noop(),
        }
    }
}

// =============================================================================
// Dispatcher
// =============================================================================

/// Counters describing what the dispatcher has seen.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatcherStats {
    pub frames_received: u64,
    pub events_dispatched: u64,
    pub frames_dropped: u64,
    pub frames_malformed: u64,
}

/// Routes inbound frames to the callback matching their kind.
pub struct ProtocolDispatcher {
    callbacks: DispatcherCallbacks,
    frames_received: AtomicU64,
    events_dispatched: AtomicU64,
    frames_dropped: AtomicU64,
    frames_malformed: AtomicU64,
}

impl ProtocolDispatcher {
    pub fn new(callbacks: DispatcherCallbacks) -> Self {
        Self {
            callbacks,
            frames_received: AtomicU64::new(0),
            events_dispatched: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
            frames_malformed: AtomicU64::new(0),
        }
    }

    /// Parse and route one frame.
    pub async fn dispatch(&self, frame: &str) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);

        match parse_frame(frame) {
            Ok(Some(event)) => self.route(event).await,
            Ok(None) => {
                self.frames_dropped.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.frames_malformed.fetch_add(1, Ordering::Relaxed);
                warn!("Failed to parse server event: {}", e);
                (self.callbacks.on_parse_error)(e).await;
            }
        }
    }

    /// Route an already-parsed event.
    pub async fn route(&self, event: ProtocolEvent) {
        debug!(kind = event.kind(), "Dispatching protocol event");
        self.events_dispatched.fetch_add(1, Ordering::Relaxed);

        let cb = &self.callbacks;
        match event {
            ProtocolEvent::FunctionCall(request) => (cb.on_function_call)(request).await,
            ProtocolEvent::AudioDelta {
                response_id,
                item_id,
                data,
            } => (cb.on_audio_delta)((response_id, item_id, data)).await,
            ProtocolEvent::TranscriptDelta { response_id, delta } => {
                (cb.on_transcript_delta)((response_id, delta)).await
            }
            ProtocolEvent::TranscriptDone {
                response_id,
                transcript,
            } => (cb.on_transcript_done)((response_id, transcript)).await,
            ProtocolEvent::AudioDone { response_id } => (cb.on_audio_done)(response_id).await,
            ProtocolEvent::ResponseDone {
                response_id,
                status,
                function_call_ids,
            } => (cb.on_response_done)((response_id, status, function_call_ids)).await,
            ProtocolEvent::Error(error) => (cb.on_error)(error).await,
            ProtocolEvent::SessionCreated { session_id } => {
                (cb.on_session_created)(session_id).await
            }
            ProtocolEvent::SpeechStarted {
                item_id,
                audio_start_ms,
            } => (cb.on_speech_started)((item_id, audio_start_ms)).await,
            ProtocolEvent::UserTranscript {
                item_id,
                transcript,
            } => (cb.on_user_transcript)((item_id, transcript)).await,
        }
    }

    pub fn stats(&self) -> DispatcherStats {
        DispatcherStats {
            frames_received: self.frames_received.load(Ordering::Relaxed),
            events_dispatched: self.events_dispatched.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            frames_malformed: self.frames_malformed.load(Ordering::Relaxed),
        }
    }
}
