use serde::Deserialize;
use std::path::PathBuf;

/// Complete YAML configuration structure
///
/// All fields are optional to allow partial configuration. Values present in
/// the file override environment variables.
///
/// # Example YAML structure
/// ```yaml
/// realtime:
///   api_key: "sk-..."
///   url: "wss://api.openai.com/v1/realtime"
///   model: "gpt-4o-realtime-preview"
///   voice: "alloy"
///   instructions: "You are a friendly receptionist."
///   transcription_model: "whisper-1"
///
/// functions:
///   end_session_function: "end_session"
///   timeout_ms: 30000
///
/// end_session:
///   fallback_timeout_ms: 15000
///   fast_fallback_ms: 500
///   slow_fallback_ms: 2500
///   fast_fallback_max_attempts: 3
///
/// monitor:
///   sample_interval_ms: 100
///   silence_threshold: 0.01
///   silence_duration_ms: 2000
///   failsafe_ms: 8000
///   discovery_attempts: 10
///   discovery_interval_ms: 200
///   fft_size: 512
///
/// playback:
///   sample_rate: 24000
/// ```
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct YamlConfig {
    pub realtime: Option<RealtimeYaml>,
    pub functions: Option<FunctionsYaml>,
    pub end_session: Option<EndSessionYaml>,
    pub monitor: Option<MonitorYaml>,
    pub playback: Option<PlaybackYaml>,
}

/// Realtime backend connection from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct RealtimeYaml {
    pub api_key: Option<String>,
    pub url: Option<String>,
    pub model: Option<String>,
    pub voice: Option<String>,
    pub instructions: Option<String>,
    pub transcription_model: Option<String>,
}

/// Function execution from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct FunctionsYaml {
    pub end_session_function: Option<String>,
    pub timeout_ms: Option<u64>,
}

/// End-of-session timers from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct EndSessionYaml {
    pub fallback_timeout_ms: Option<u64>,
    pub fast_fallback_ms: Option<u64>,
    pub slow_fallback_ms: Option<u64>,
    pub fast_fallback_max_attempts: Option<u32>,
}

/// Volume monitor tuning from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct MonitorYaml {
    pub sample_interval_ms: Option<u64>,
    pub silence_threshold: Option<f32>,
    pub silence_duration_ms: Option<u64>,
    pub failsafe_ms: Option<u64>,
    pub discovery_attempts: Option<u32>,
    pub discovery_interval_ms: Option<u64>,
    pub fft_size: Option<usize>,
}

/// Playback output from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct PlaybackYaml {
    pub sample_rate: Option<u32>,
}

impl YamlConfig {
    /// Load configuration from a YAML file
    ///
    /// # Errors
    /// Returns an error if:
    /// - The file cannot be read
    /// - The YAML is malformed
    /// - Fields have invalid types
    pub fn from_file(path: &PathBuf) -> Result<Self, Box<dyn std::error::Error>> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config file {}: {e}", path.display()))?;

        let config: YamlConfig = serde_yaml::from_str(&contents)
            .map_err(|e| format!("Failed to parse YAML config: {e}"))?;

        Ok(config)
    }
}
