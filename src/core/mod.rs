pub mod session;

// Re-export commonly used types for convenience
pub use session::{
    ConnectionState, ControllerConfig, FunctionRegistry, SessionController, SessionDiagnostics,
    SessionError, SessionResult,
};
