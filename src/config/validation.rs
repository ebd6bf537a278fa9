//! Configuration validation.

use super::SessionConfig;

/// Validate credentials and function settings.
pub fn validate_session(config: &SessionConfig) -> Result<(), Box<dyn std::error::Error>> {
    if config.api_key.trim().is_empty() {
        return Err(
            "OPENAI_API_KEY is required (set the environment variable or realtime.api_key in YAML)"
                .into(),
        );
    }
    if config.url.trim().is_empty() {
        return Err("Realtime URL must not be empty".into());
    }
    if config.end_session_function.trim().is_empty() {
        return Err("End-session function name must not be empty".into());
    }
    if config.function_timeout_ms == 0 {
        return Err("Function timeout must be greater than 0".into());
    }
    if config.playback_sample_rate == 0 {
        return Err("Playback sample rate must be greater than 0".into());
    }
    Ok(())
}

/// Validate the end-of-session timers and monitor tuning.
pub fn validate_timing(config: &SessionConfig) -> Result<(), Box<dyn std::error::Error>> {
    config.end_session.validate()?;
    config.monitor.validate()?;
    Ok(())
}
