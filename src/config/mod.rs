//! Configuration module for WaaV sessions
//!
//! This module handles session configuration from various sources: .env files, YAML files,
//! and environment variables. Priority: YAML > ENV vars > .env values > defaults.
//!
//! # Modules
//! - `yaml`: YAML configuration file loading
//! - `env`: Environment variable loading
//! - `merge`: Merging YAML and environment configurations
//! - `validation`: Configuration validation logic
//!
//! # Example
//! ```rust,no_run
//! use waav_session::config::SessionConfig;
//! use std::path::PathBuf;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // Load from environment variables only
//! let config = SessionConfig::from_env()?;
//!
//! // Load from YAML file with environment variable overrides
//! let config_path = PathBuf::from("session.yaml");
//! let config = SessionConfig::from_file(&config_path)?;
//!
//! println!("Connecting to {}", config.url);
//! # Ok(())
//! # }
//! ```

use std::path::PathBuf;
use std::time::Duration;

use crate::core::session::{ControllerConfig, EndSessionConfig, MonitorConfig, OPENAI_REALTIME_URL};

mod env;
mod merge;
mod validation;
mod yaml;

pub use yaml::YamlConfig;

/// Default realtime model.
pub const DEFAULT_REALTIME_MODEL: &str = "gpt-4o-realtime-preview";

/// Default playback sample rate (OpenAI Realtime PCM16 output).
pub const DEFAULT_PLAYBACK_SAMPLE_RATE: u32 = 24_000;

/// Session configuration
///
/// Contains everything needed to run one realtime session:
/// - Backend connection (URL, model, API key)
/// - Session parameters sent with `session.update`
/// - Function execution settings
/// - End-of-session timers and volume monitor tuning
#[derive(Debug, Clone)]
pub struct SessionConfig {
    // Backend connection
    pub api_key: String,
    pub url: String,
    pub model: String,

    // Session parameters
    pub voice: Option<String>,
    pub instructions: Option<String>,
    pub transcription_model: Option<String>,

    // Function execution
    /// Name of the function whose success starts the end-of-session flow
    /// Default: "end_session"
    pub end_session_function: String,
    /// Default: 30000
    pub function_timeout_ms: u64,

    pub end_session: EndSessionConfig,
    pub monitor: MonitorConfig,

    /// Sample rate of the PCM16 audio the backend sends
    /// Default: 24000
    pub playback_sample_rate: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            url: OPENAI_REALTIME_URL.to_string(),
            model: DEFAULT_REALTIME_MODEL.to_string(),
            voice: None,
            instructions: None,
            transcription_model: None,
            end_session_function: "end_session".to_string(),
            function_timeout_ms: crate::core::session::DEFAULT_FUNCTION_TIMEOUT_MS,
            end_session: EndSessionConfig::default(),
            monitor: MonitorConfig::default(),
            playback_sample_rate: DEFAULT_PLAYBACK_SAMPLE_RATE,
        }
    }
}

/// Zeroize the API key when the configuration is dropped.
impl Drop for SessionConfig {
    fn drop(&mut self) {
        use zeroize::Zeroize;
        self.api_key.zeroize();
    }
}

impl SessionConfig {
    /// Load configuration from environment variables and defaults.
    ///
    /// The .env file is loaded by the binary at startup, so its values are
    /// already visible as environment variables here.
    pub fn from_env() -> Result<Self, Box<dyn std::error::Error>> {
        let config = merge::merge_config(None)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML file with environment variable base
    ///
    /// Priority order (highest to lowest):
    /// 1. YAML file values
    /// 2. Environment variables (actual ENV vars override .env values)
    /// 3. .env file values
    /// 4. Default values
    ///
    /// # Errors
    /// Returns an error if:
    /// - The YAML file cannot be read or is malformed
    /// - Environment variables have invalid formats
    /// - Configuration validation fails
    pub fn from_file(path: &PathBuf) -> Result<Self, Box<dyn std::error::Error>> {
        let yaml_config = yaml::YamlConfig::from_file(path)?;
        let config = merge::merge_config(Some(yaml_config))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), Box<dyn std::error::Error>> {
        validation::validate_session(self)?;
        validation::validate_timing(self)?;
        Ok(())
    }

    pub fn function_timeout(&self) -> Duration {
        Duration::from_millis(self.function_timeout_ms)
    }

    /// Settings for a [`crate::core::session::SessionController`].
    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            instructions: self.instructions.clone(),
            voice: self.voice.clone(),
            transcription_model: self.transcription_model.clone(),
            end_session_function: self.end_session_function.clone(),
            function_timeout: self.function_timeout(),
            end_session: self.end_session.clone(),
            monitor: self.monitor.clone(),
        }
    }
}
