//! Realtime wire protocol: message types and the inbound event dispatcher.

pub mod dispatcher;
pub mod messages;

pub use dispatcher::{
    DispatcherCallbacks, DispatcherStats, EventHandler, ProtocolDispatcher, ProtocolEvent,
    parse_frame,
};
pub use messages::{
    ApiError, ClientEvent, ConversationItem, InputAudioTranscription, ServerEvent,
    SessionUpdateConfig, ToolDef,
};
