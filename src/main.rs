use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use clap::Parser;
use serde_json::json;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use waav_session::SessionConfig;
use waav_session::core::session::{
    ConnectionState, FunctionDefinition, FunctionRegistry, SessionController, SessionError,
    TranscriptResult, VirtualOutput, WebSocketTransport, handler_fn,
};

/// WaaV Session - run one realtime voice conversation
#[derive(Parser, Debug)]
#[command(name = "waav-session")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short = 'c', long = "config", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Text message sent as soon as the session is connected
    #[arg(long = "message", value_name = "TEXT")]
    message: Option<String>,

    /// Record the assistant's audio to a WAV file
    #[arg(long = "record", value_name = "FILE.wav")]
    record: Option<PathBuf>,

    /// Disconnect after this many seconds
    #[arg(long = "max-duration", value_name = "SECS")]
    max_duration: Option<u64>,
}

/// Functions that control the session itself.
fn session_functions(end_session_function: &str) -> FunctionRegistry {
    let registry = FunctionRegistry::new();
    registry.register_with_definition(
        FunctionDefinition::new(end_session_function)
            .with_description(
                "End the conversation. Call this once the user is done, then say a short goodbye.",
            )
            .with_parameters(json!({
                "type": "object",
                "properties": {
                    "reason": { "type": "string", "description": "Why the conversation ended" }
                }
            })),
        handler_fn(|args| async move {
            let reason = args["reason"].as_str().unwrap_or("unspecified");
            info!(reason, "Model ended the session");
            Ok(json!({ "ended": true }))
        }),
    );
    registry
}

/// General purpose helpers available to the model.
fn utility_functions() -> FunctionRegistry {
    let registry = FunctionRegistry::new();
    registry.register_with_definition(
        FunctionDefinition::new("get_current_time")
            .with_description("Get the current UTC date and time")
            .with_parameters(json!({ "type": "object", "properties": {} })),
        handler_fn(|_| async move {
            let now = OffsetDateTime::now_utc()
                .format(&Rfc3339)
                .unwrap_or_default();
            Ok(json!({ "utc": now }))
        }),
    );
    registry
}

async fn wait_for_deadline(deadline: Option<Duration>) {
    match deadline {
        Some(duration) => tokio::time::sleep(duration).await,
        None => std::future::pending().await,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if it exists (must be done before config loading)
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Must be installed before any TLS connection is attempted
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow!("Failed to install default crypto provider"))?;

    let cli = Cli::parse();

    let config = if let Some(config_path) = cli.config {
        println!("Loading configuration from {}", config_path.display());
        SessionConfig::from_file(&config_path).map_err(|e| anyhow!(e.to_string()))?
    } else {
        SessionConfig::from_env().map_err(|e| anyhow!(e.to_string()))?
    };

    let mut output = VirtualOutput::new(config.playback_sample_rate);
    if let Some(path) = &cli.record {
        output = output.with_recording(path)?;
    }

    let registry = FunctionRegistry::from_registries([
        &session_functions(&config.end_session_function),
        &utility_functions(),
    ]);

    let transport = WebSocketTransport::new(&config.url, &config.model, config.api_key.clone());
    let controller = SessionController::new(
        config.controller_config(),
        Box::new(transport),
        registry,
        Arc::new(output.clone()),
        Arc::new(output.clone()),
    );

    let (state_tx, mut state_rx) = mpsc::unbounded_channel();
    let _state_subscription = controller.on_state_change(Arc::new(move |state: ConnectionState| {
        let _ = state_tx.send(state);
        Box::pin(async {})
    }));
    let _transcript_subscription = controller.on_transcript(Arc::new(|t: TranscriptResult| {
        Box::pin(async move {
            if t.is_final {
                info!(role = %t.role, "{}", t.text);
            }
        })
    }));
    let _error_subscription = controller.on_error(Arc::new(|e: SessionError| {
        Box::pin(async move {
            warn!("Session error: {}", e);
        })
    }));

    controller.connect().await?;

    if let Some(message) = &cli.message {
        if !controller.send_message(message) {
            warn!("Failed to send opening message");
        }
    }

    let deadline = wait_for_deadline(cli.max_duration.map(Duration::from_secs));
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            state = state_rx.recv() => match state {
                Some(ConnectionState::Disconnected) | Some(ConnectionState::Failed) | None => break,
                Some(_) => {}
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, disconnecting");
                break;
            }
            _ = &mut deadline => {
                info!("Maximum duration reached, disconnecting");
                break;
            }
        }
    }

    controller.disconnect().await?;
    output.finish_recording()?;

    let diagnostics = serde_json::to_string(&controller.diagnostics())?;
    info!(diagnostics = %diagnostics, "Session finished");

    Ok(())
}
