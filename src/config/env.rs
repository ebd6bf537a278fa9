//! Environment variable loading.

use std::env;
use std::str::FromStr;

use super::SessionConfig;

/// Read an optional, non-empty environment variable.
pub(crate) fn env_string(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

/// Parse an optional environment variable, failing on unparseable values.
pub(crate) fn env_parse<T>(name: &str) -> Result<Option<T>, String>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env_string(name) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| format!("Invalid value for {name}: {e}")),
        None => Ok(None),
    }
}

/// Build a configuration from defaults overridden by environment variables.
pub fn load_from_env() -> Result<SessionConfig, Box<dyn std::error::Error>> {
    let mut config = SessionConfig::default();

    if let Some(key) = env_string("OPENAI_API_KEY") {
        config.api_key = key;
    }
    if let Some(url) = env_string("REALTIME_URL") {
        config.url = url;
    }
    if let Some(model) = env_string("REALTIME_MODEL") {
        config.model = model;
    }
    if let Some(voice) = env_string("REALTIME_VOICE") {
        config.voice = Some(voice);
    }
    if let Some(instructions) = env_string("REALTIME_INSTRUCTIONS") {
        config.instructions = Some(instructions);
    }
    if let Some(model) = env_string("REALTIME_TRANSCRIPTION_MODEL") {
        config.transcription_model = Some(model);
    }
    if let Some(name) = env_string("END_SESSION_FUNCTION") {
        config.end_session_function = name;
    }
    if let Some(ms) = env_parse("FUNCTION_TIMEOUT_MS")? {
        config.function_timeout_ms = ms;
    }

    let end_session = &mut config.end_session;
    if let Some(ms) = env_parse("END_SESSION_FALLBACK_MS")? {
        end_session.fallback_timeout_ms = ms;
    }
    if let Some(ms) = env_parse("FAST_FALLBACK_MS")? {
        end_session.fast_fallback_ms = ms;
    }
    if let Some(ms) = env_parse("SLOW_FALLBACK_MS")? {
        end_session.slow_fallback_ms = ms;
    }
    if let Some(attempts) = env_parse("FAST_FALLBACK_MAX_ATTEMPTS")? {
        end_session.fast_fallback_max_attempts = attempts;
    }

    let monitor = &mut config.monitor;
    if let Some(ms) = env_parse("MONITOR_SAMPLE_INTERVAL_MS")? {
        monitor.sample_interval_ms = ms;
    }
    if let Some(threshold) = env_parse("SILENCE_THRESHOLD")? {
        monitor.silence_threshold = threshold;
    }
    if let Some(ms) = env_parse("SILENCE_DURATION_MS")? {
        monitor.silence_duration_ms = ms;
    }
    if let Some(ms) = env_parse("MONITOR_FAILSAFE_MS")? {
        monitor.failsafe_ms = ms;
    }
    if let Some(attempts) = env_parse("SINK_DISCOVERY_ATTEMPTS")? {
        monitor.discovery_attempts = attempts;
    }
    if let Some(ms) = env_parse("SINK_DISCOVERY_INTERVAL_MS")? {
        monitor.discovery_interval_ms = ms;
    }
    if let Some(size) = env_parse("MONITOR_FFT_SIZE")? {
        monitor.fft_size = size;
    }

    if let Some(rate) = env_parse("PLAYBACK_SAMPLE_RATE")? {
        config.playback_sample_rate = rate;
    }

    Ok(config)
}
