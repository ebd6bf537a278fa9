//! Merging YAML overrides onto the environment configuration.

use super::SessionConfig;
use super::env::load_from_env;
use super::yaml::YamlConfig;

/// Load the environment configuration and apply YAML values on top.
pub fn merge_config(
    yaml: Option<YamlConfig>,
) -> Result<SessionConfig, Box<dyn std::error::Error>> {
    let mut config = load_from_env()?;
    let Some(yaml) = yaml else {
        return Ok(config);
    };

    if let Some(realtime) = yaml.realtime {
        if let Some(key) = realtime.api_key {
            config.api_key = key;
        }
        if let Some(url) = realtime.url {
            config.url = url;
        }
        if let Some(model) = realtime.model {
            config.model = model;
        }
        if realtime.voice.is_some() {
            config.voice = realtime.voice;
        }
        if realtime.instructions.is_some() {
            config.instructions = realtime.instructions;
        }
        if realtime.transcription_model.is_some() {
            config.transcription_model = realtime.transcription_model;
        }
    }

    if let Some(functions) = yaml.functions {
        if let Some(name) = functions.end_session_function {
            config.end_session_function = name;
        }
        if let Some(ms) = functions.timeout_ms {
            config.function_timeout_ms = ms;
        }
    }

    if let Some(end_session) = yaml.end_session {
        let target = &mut config.end_session;
        if let Some(ms) = end_session.fallback_timeout_ms {
            target.fallback_timeout_ms = ms;
        }
        if let Some(ms) = end_session.fast_fallback_ms {
            target.fast_fallback_ms = ms;
        }
        if let Some(ms) = end_session.slow_fallback_ms {
            target.slow_fallback_ms = ms;
        }
        if let Some(attempts) = end_session.fast_fallback_max_attempts {
            target.fast_fallback_max_attempts = attempts;
        }
    }

    if let Some(monitor) = yaml.monitor {
        let target = &mut config.monitor;
        if let Some(ms) = monitor.sample_interval_ms {
            target.sample_interval_ms = ms;
        }
        if let Some(threshold) = monitor.silence_threshold {
            target.silence_threshold = threshold;
        }
        if let Some(ms) = monitor.silence_duration_ms {
            target.silence_duration_ms = ms;
        }
        if let Some(ms) = monitor.failsafe_ms {
            target.failsafe_ms = ms;
        }
        if let Some(attempts) = monitor.discovery_attempts {
            target.discovery_attempts = attempts;
        }
        if let Some(ms) = monitor.discovery_interval_ms {
            target.discovery_interval_ms = ms;
        }
        if let Some(size) = monitor.fft_size {
            target.fft_size = size;
        }
    }

    if let Some(rate) = yaml.playback.and_then(|p| p.sample_rate) {
        config.playback_sample_rate = rate;
    }

    Ok(config)
}
