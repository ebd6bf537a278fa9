//! Base types for realtime conversation sessions.
//!
//! This module defines the error taxonomy, connection state, transcript
//! payloads, callback aliases and the listener registry used by the
//! session controller.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use thiserror::Error;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur during a realtime session.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SessionError {
    /// The transport could not be opened
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// The transport closed without a requested disconnect
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// Authentication failed
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// WebSocket error
    #[error("WebSocket error: {0}")]
    WebSocketError(String),

    /// Error event reported by the backend
    #[error("Provider error: {0}")]
    ProviderError(String),

    /// Inbound frame could not be parsed
    #[error("Malformed event: {0}")]
    MalformedEvent(String),

    /// Backend requested a function that is not registered
    #[error("Unknown function: {0}")]
    UnknownFunction(String),

    /// Function execution failed
    #[error("Function failed: {0}")]
    FunctionFailed(String),

    /// The audio sink or its signal tap could not be reached
    #[error("Audio sink unavailable: {0}")]
    SinkUnavailable(String),

    /// Not connected
    #[error("Not connected")]
    NotConnected,
}

/// Result type for session operations.
pub type SessionResult<T> = Result<T, SessionError>;

// =============================================================================
// Connection State
// =============================================================================

/// Connection state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// Not connected to the backend
    #[default]
    Disconnected,
    /// Transport is being opened
    Connecting,
    /// Connected and ready
    Connected,
    /// Connection could not be established or was lost
    Failed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "Disconnected"),
            ConnectionState::Connecting => write!(f, "Connecting"),
            ConnectionState::Connected => write!(f, "Connected"),
            ConnectionState::Failed => write!(f, "Failed"),
        }
    }
}

// =============================================================================
// Session Identity
// =============================================================================

/// Identity of one session generation.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    /// Session ID (UUID v4)
    pub id: String,
    /// Creation time, RFC 3339
    pub created_at: String,
}

impl SessionInfo {
    pub fn new() -> Self {
        let created_at = OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .unwrap_or_default();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            created_at,
        }
    }
}

impl Default for SessionInfo {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Transcripts
// =============================================================================

/// Transcript fragment or final transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptResult {
    /// The transcribed text
    pub text: String,
    /// Role of the speaker
    pub role: TranscriptRole,
    /// Whether this is a final transcript
    pub is_final: bool,
    /// Response ID (assistant) or item ID (user)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

/// Role of the speaker in a transcript.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TranscriptRole {
    /// User speech transcript
    User,
    /// Assistant speech transcript
    Assistant,
}

impl fmt::Display for TranscriptRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TranscriptRole::User => write!(f, "user"),
            TranscriptRole::Assistant => write!(f, "assistant"),
        }
    }
}

// =============================================================================
// Function Calls
// =============================================================================

/// Function call requested by the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCallRequest {
    /// Function name
    pub name: String,
    /// Call ID, unique per request
    pub call_id: String,
    /// JSON arguments as sent on the wire
    pub arguments: String,
    /// Response that issued the call
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_id: Option<String>,
}

// =============================================================================
// Callback Types
// =============================================================================

/// Callback type for connection state changes.
pub type StateChangeCallback =
    Arc<dyn Fn(ConnectionState) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Callback type for transcript events.
pub type TranscriptCallback =
    Arc<dyn Fn(TranscriptResult) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Callback type for error events.
pub type SessionErrorCallback =
    Arc<dyn Fn(SessionError) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

// =============================================================================
// Listener Registry
// =============================================================================

/// Generic async listener stored in a [`ListenerSet`].
pub type AsyncListener<T> =
    Arc<dyn Fn(T) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// A set of async listeners that can be added and removed at runtime.
pub struct ListenerSet<T> {
    next_id: AtomicU64,
    entries: RwLock<Vec<(u64, AsyncListener<T>)>>,
}

impl<T: Clone + Send + 'static> ListenerSet<T> {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_id: AtomicU64::new(1),
            entries: RwLock::new(Vec::new()),
        })
    }

    /// Register a listener. Dropping the returned handle keeps the listener;
    /// call [`Subscription::unsubscribe`] to remove it.
    pub fn subscribe(self: &Arc<Self>, listener: AsyncListener<T>) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries.write().push((id, listener));

        let weak: Weak<Self> = Arc::downgrade(self);
        Subscription {
            remove: Some(Box::new(move || {
                if let Some(set) = weak.upgrade() {
                    set.entries.write().retain(|(entry_id, _)| *entry_id != id);
                }
            })),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Invoke every listener in registration order.
    pub async fn emit(&self, value: T) {
        let snapshot: Vec<AsyncListener<T>> =
            self.entries.read().iter().map(|(_, l)| l.clone()).collect();
        for listener in snapshot {
            listener(value.clone()).await;
        }
    }
}

/// Handle returned when registering a listener.
pub struct Subscription {
    remove: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    /// Remove the listener this handle was created for.
    pub fn unsubscribe(mut self) {
        if let Some(remove) = self.remove.take() {
            remove();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.remove.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_connection_state_display() {
        assert_eq!(ConnectionState::Connected.to_string(), "Connected");
        assert_eq!(ConnectionState::Disconnected.to_string(), "Disconnected");
        assert_eq!(ConnectionState::Connecting.to_string(), "Connecting");
        assert_eq!(ConnectionState::Failed.to_string(), "Failed");
    }

    #[test]
    fn test_default_state_is_disconnected() {
        assert_eq!(ConnectionState::default(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_error_display() {
        let err = SessionError::ConnectionFailed("test".to_string());
        assert!(err.to_string().contains("Connection failed"));

        let err = SessionError::NotConnected;
        assert_eq!(err.to_string(), "Not connected");
    }

    #[test]
    fn test_session_info_has_uuid_and_timestamp() {
        let info = SessionInfo::new();
        assert!(uuid::Uuid::parse_str(&info.id).is_ok());
        assert!(OffsetDateTime::parse(&info.created_at, &Rfc3339).is_ok());
        assert_ne!(info.id, SessionInfo::new().id);
    }

    #[tokio::test]
    async fn test_listener_set_emit_and_unsubscribe() {
        let set: Arc<ListenerSet<u32>> = ListenerSet::new();
        let total = Arc::new(AtomicUsize::new(0));

        let t1 = total.clone();
        let first = set.subscribe(Arc::new(move |v| {
            let t1 = t1.clone();
            Box::pin(async move {
                t1.fetch_add(v as usize, Ordering::SeqCst);
            })
        }));
        let t2 = total.clone();
        let _second = set.subscribe(Arc::new(move |v| {
            let t2 = t2.clone();
            Box::pin(async move {
                t2.fetch_add(v as usize * 10, Ordering::SeqCst);
            })
        }));

        set.emit(1).await;
        assert_eq!(total.load(Ordering::SeqCst), 11);

        first.unsubscribe();
        assert_eq!(set.len(), 1);

        set.emit(1).await;
        assert_eq!(total.load(Ordering::SeqCst), 21);
    }
}
