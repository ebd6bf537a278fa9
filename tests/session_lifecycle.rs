//! Session Lifecycle Tests
//!
//! Drives a `SessionController` against an in-memory backend with paused
//! time. Covers connection state, function execution, event routing, the
//! end-of-session flow (silence, failsafe, fallback and heuristic timers)
//! and teardown.

mod mock_session;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::time::Instant;

use mock_session::*;
use waav_session::core::session::{
    AudioSink, CompletionReason, ConnectionState, ControllerConfig, DisconnectReason,
    EndSessionPhase, FunctionDefinition, FunctionRegistry, SessionController, SessionError,
    SinkLocator, TranscriptRole, VirtualOutput, handler_fn,
};

const SAMPLE_RATE: u32 = 24_000;

fn test_config() -> ControllerConfig {
    ControllerConfig {
        instructions: Some("You are a test assistant.".to_string()),
        voice: Some("alloy".to_string()),
        ..Default::default()
    }
}

fn registry() -> FunctionRegistry {
    let registry = FunctionRegistry::new();
    registry.register_with_definition(
        FunctionDefinition::new("end_session")
            .with_description("End the conversation")
            .with_parameters(json!({ "type": "object", "properties": {} })),
        handler_fn(|_args| async { Ok(json!({ "ended": true })) }),
    );
    registry.register(
        "lookup",
        handler_fn(|args| async move { Ok(json!({ "echo": args })) }),
    );
    registry.register(
        "slow_lookup",
        handler_fn(|_args| async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(json!({ "slow": true }))
        }),
    );
    registry.register(
        "very_slow_lookup",
        handler_fn(|_args| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(json!({ "very_slow": true }))
        }),
    );
    registry
}

fn build(sink: Arc<dyn AudioSink>, locator: Arc<dyn SinkLocator>) -> (SessionController, MockBackend) {
    let (transport, backend) = mock_transport();
    let controller =
        SessionController::new(test_config(), Box::new(transport), registry(), sink, locator);
    (controller, backend)
}

/// Controller whose monitor reads a real-time virtual output.
fn build_with_virtual_output() -> (SessionController, MockBackend) {
    let output = VirtualOutput::new(SAMPLE_RATE);
    build(Arc::new(output.clone()), Arc::new(output))
}

fn build_with_locator(script: LocatorScript) -> (SessionController, MockBackend) {
    build(Arc::new(RecordingSink::default()), ScriptedLocator::new(script))
}

async fn connected(controller: &SessionController) {
    controller.connect().await.expect("connect");
    settle().await;
    assert_eq!(controller.state(), ConnectionState::Connected);
}

/// Run the end-session function and let its result reach the backend.
async fn confirm_end_session(backend: &MockBackend) {
    backend.send_json(function_call("call_end", "end_session", json!({}), "resp_1"));
    let output = backend.wait_for_output("call_end").await;
    assert_eq!(output["success"], true);
    backend.send_json(response_done("resp_1", "completed", &["call_end"]));
    settle().await;
}

fn last_disconnect(controller: &SessionController) -> Option<DisconnectReason> {
    controller.diagnostics().end_session.last_disconnect
}

// =============================================================================
// Connection
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_connect_sends_session_update_with_tools() {
    let (controller, backend) = build_with_locator(LocatorScript::NeverFound);
    let recorder = StateRecorder::attach(&controller);

    connected(&controller).await;

    let sent = backend.sent();
    assert_eq!(sent[0]["type"], "session.update");
    assert_eq!(sent[0]["session"]["instructions"], "You are a test assistant.");
    let tools: Vec<&str> = sent[0]["session"]["tools"]
        .as_array()
        .expect("tools")
        .iter()
        .filter_map(|t| t["name"].as_str())
        .collect();
    assert!(tools.contains(&"end_session"));
    assert!(tools.contains(&"lookup"));

    assert_eq!(
        recorder.history(),
        vec![ConnectionState::Connecting, ConnectionState::Connected]
    );
}

#[tokio::test(start_paused = true)]
async fn test_connect_twice_opens_once() {
    let (controller, backend) = build_with_locator(LocatorScript::NeverFound);

    connected(&controller).await;
    let first_session = controller.session_info().id;
    controller.connect().await.unwrap();

    assert_eq!(backend.opens(), 1);
    assert_eq!(controller.session_info().id, first_session);
}

#[tokio::test(start_paused = true)]
async fn test_connect_failure_reports_failed() {
    let (controller, backend) = build_with_locator(LocatorScript::NeverFound);
    backend.refuse_connections(true);
    let errors = ErrorRecorder::attach(&controller);

    let result = controller.connect().await;

    assert!(matches!(result, Err(SessionError::ConnectionFailed(_))));
    assert_eq!(controller.state(), ConnectionState::Failed);
    assert!(
        errors
            .errors()
            .iter()
            .any(|e| matches!(e, SessionError::ConnectionFailed(_)))
    );
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_starts_fresh_session() {
    let (controller, backend) = build_with_locator(LocatorScript::NeverFound);

    connected(&controller).await;
    backend.send_json(session_created("sess_remote_1"));
    settle().await;
    let first = controller.diagnostics();
    assert_eq!(first.remote_session_id.as_deref(), Some("sess_remote_1"));

    controller.disconnect().await.unwrap();
    connected(&controller).await;

    let second = controller.diagnostics();
    assert_ne!(first.session.id, second.session.id);
    assert!(second.remote_session_id.is_none());
    assert_eq!(backend.opens(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_send_message_queues_item_and_response() {
    let (controller, backend) = build_with_locator(LocatorScript::NeverFound);
    assert!(!controller.send_message("too early"));

    connected(&controller).await;
    assert!(controller.send_message("Hello there"));
    settle().await;

    let sent = backend.sent();
    let item = sent
        .iter()
        .find(|e| e["type"] == "conversation.item.create")
        .expect("item");
    assert_eq!(item["item"]["role"], "user");
    assert_eq!(backend.sent_types().last().map(String::as_str), Some("response.create"));
}

// =============================================================================
// Functions
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_function_result_sent_exactly_once_per_call() {
    let (controller, backend) = build_with_locator(LocatorScript::NeverFound);
    connected(&controller).await;

    let call = function_call("call_1", "lookup", json!({ "q": "weather" }), "resp_1");
    backend.send_json(call.clone());
    backend.send_json(call);

    let output = backend.wait_for_output("call_1").await;
    tokio::time::sleep(Duration::from_millis(500)).await;

    assert_eq!(output["success"], true);
    assert_eq!(output["data"]["echo"]["q"], "weather");
    assert_eq!(backend.outputs_for("call_1").len(), 1);
    assert_eq!(controller.diagnostics().functions.succeeded, 1);
}

#[tokio::test(start_paused = true)]
async fn test_unknown_function_is_not_fatal() {
    let (controller, backend) = build_with_locator(LocatorScript::NeverFound);
    let errors = ErrorRecorder::attach(&controller);
    connected(&controller).await;

    backend.send_json(function_call("call_x", "does_not_exist", json!({}), "resp_1"));
    let output = backend.wait_for_output("call_x").await;

    assert_eq!(output["success"], false);
    assert!(
        errors
            .errors()
            .iter()
            .any(|e| matches!(e, SessionError::UnknownFunction(name) if name == "does_not_exist"))
    );
    assert_eq!(controller.state(), ConnectionState::Connected);
    assert_eq!(controller.diagnostics().functions.failed, 1);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_calls_settle_in_completion_order() {
    let (controller, backend) = build_with_locator(LocatorScript::NeverFound);
    connected(&controller).await;

    backend.send_json(function_call("call_slow", "slow_lookup", json!({}), "resp_1"));
    backend.send_json(function_call("call_fast", "lookup", json!({}), "resp_1"));

    backend.wait_for_output("call_slow").await;
    let order: Vec<String> = backend
        .function_outputs()
        .into_iter()
        .map(|(id, _)| id)
        .collect();
    assert_eq!(order, vec!["call_fast".to_string(), "call_slow".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn test_function_result_after_disconnect_is_dropped() {
    let (controller, backend) = build_with_locator(LocatorScript::NeverFound);
    connected(&controller).await;

    backend.send_json(function_call("call_late", "very_slow_lookup", json!({}), "resp_1"));
    settle().await;
    tokio::time::sleep(Duration::from_secs(1)).await;
    controller.disconnect().await.unwrap();

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert!(backend.outputs_for("call_late").is_empty());
    assert_eq!(controller.state(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_manual_function_result() {
    let (controller, backend) = build_with_locator(LocatorScript::NeverFound);
    assert!(!controller.send_function_result("call_m", "{}"));

    connected(&controller).await;
    assert!(controller.send_function_result("call_m", r#"{"ok":true}"#));
    settle().await;

    assert_eq!(backend.outputs_for("call_m"), vec![json!({ "ok": true })]);
}

// =============================================================================
// Event Routing
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_transcripts_are_forwarded() {
    let (controller, backend) = build_with_locator(LocatorScript::NeverFound);
    let transcripts = TranscriptRecorder::attach(&controller);
    connected(&controller).await;

    backend.send_json(user_transcript("item_u1", "What time is it?"));
    backend.send_json(transcript_delta("resp_1", "It is "));
    backend.send_json(transcript_done("resp_1", "It is noon."));
    settle().await;

    let got = transcripts.transcripts();
    assert_eq!(got.len(), 3);
    assert_eq!(got[0].role, TranscriptRole::User);
    assert!(got[0].is_final);
    assert_eq!(got[1].role, TranscriptRole::Assistant);
    assert!(!got[1].is_final);
    assert_eq!(got[2].text, "It is noon.");
    assert_eq!(got[2].correlation_id.as_deref(), Some("resp_1"));
}

#[tokio::test(start_paused = true)]
async fn test_malformed_frame_does_not_stop_session() {
    let (controller, backend) = build_with_locator(LocatorScript::NeverFound);
    let errors = ErrorRecorder::attach(&controller);
    let transcripts = TranscriptRecorder::attach(&controller);
    connected(&controller).await;

    backend.send_raw("{not json");
    backend.send_json(json!({ "type": "rate_limits.updated", "rate_limits": [] }));
    backend.send_json(transcript_done("resp_1", "still here"));
    settle().await;

    assert!(
        errors
            .errors()
            .iter()
            .any(|e| matches!(e, SessionError::MalformedEvent(_)))
    );
    assert_eq!(transcripts.transcripts().len(), 1);
    assert_eq!(controller.state(), ConnectionState::Connected);
    assert!(controller.diagnostics().dispatcher.frames_malformed >= 1);
}

#[tokio::test(start_paused = true)]
async fn test_backend_error_is_reported() {
    let (controller, backend) = build_with_locator(LocatorScript::NeverFound);
    let errors = ErrorRecorder::attach(&controller);
    connected(&controller).await;

    backend.send_json(error_event("invalid_request_error", "bad item"));
    settle().await;

    assert_eq!(
        errors.errors(),
        vec![SessionError::ProviderError("bad item".to_string())]
    );
    assert_eq!(controller.state(), ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_audio_chunks_play_in_order() {
    let sink = Arc::new(RecordingSink::default());
    let (controller, backend) = build(sink.clone(), ScriptedLocator::new(LocatorScript::NeverFound));
    connected(&controller).await;

    let chunks: Vec<Vec<u8>> = (1..=3).map(|n| tone(240, 1000 * n)).collect();
    for chunk in &chunks {
        backend.send_json(audio_delta("resp_1", chunk));
    }
    backend.send_json(audio_done("resp_1"));
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(sink.chunks(), chunks);
    assert_eq!(controller.diagnostics().playback.chunks_played, 3);
}

// =============================================================================
// End of Session
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_goodbye_audio_then_silence_disconnects() {
    let (controller, backend) = build_with_virtual_output();
    let mut states = StateRecorder::attach(&controller);
    connected(&controller).await;

    confirm_end_session(&backend).await;
    assert_eq!(
        controller.diagnostics().end_session.phase,
        EndSessionPhase::ExpectingGoodbye
    );

    // One second of goodbye audio.
    backend.send_json(audio_delta("resp_2", &tone(SAMPLE_RATE as usize, 12_000)));
    backend.send_json(response_done("resp_2", "completed", &[]));
    settle().await;
    assert_eq!(
        controller.diagnostics().end_session.phase,
        EndSessionPhase::WaitingForAudioDone
    );

    let start = Instant::now();
    backend.send_json(audio_done("resp_2"));
    states.wait_for(ConnectionState::Disconnected).await;
    let elapsed = start.elapsed();

    // Audio plays for 1s, then a full 2s of silence completes the monitor.
    assert!(elapsed >= Duration::from_millis(3000), "{elapsed:?}");
    assert!(elapsed < Duration::from_millis(3400), "{elapsed:?}");
    assert_eq!(
        last_disconnect(&controller),
        Some(DisconnectReason::Monitor {
            reason: CompletionReason::Silence
        })
    );

    let diagnostics = controller.diagnostics();
    assert_eq!(diagnostics.disconnects_performed, 1);
    assert_eq!(diagnostics.end_session.phase, EndSessionPhase::Idle);
    let monitor = diagnostics.monitor.expect("monitor status");
    assert!(monitor.attached);
    assert_eq!(monitor.completion, Some(CompletionReason::Silence));
}

#[tokio::test(start_paused = true)]
async fn test_failsafe_disconnects_when_audio_never_stops() {
    let (controller, backend) = build_with_locator(LocatorScript::AlwaysLoud);
    let mut states = StateRecorder::attach(&controller);
    connected(&controller).await;

    confirm_end_session(&backend).await;
    backend.send_json(response_done("resp_2", "completed", &[]));
    settle().await;

    let start = Instant::now();
    backend.send_json(audio_done("resp_2"));
    states.wait_for(ConnectionState::Disconnected).await;
    let elapsed = start.elapsed();

    // The monitor attached, so the 15s fallback was cancelled and the 8s
    // failsafe decides.
    assert!(elapsed >= Duration::from_millis(7900), "{elapsed:?}");
    assert!(elapsed < Duration::from_millis(8500), "{elapsed:?}");
    assert_eq!(
        last_disconnect(&controller),
        Some(DisconnectReason::Monitor {
            reason: CompletionReason::Failsafe
        })
    );
}

#[tokio::test(start_paused = true)]
async fn test_fallback_when_goodbye_never_arrives() {
    let (controller, backend) = build_with_locator(LocatorScript::NeverFound);
    let mut states = StateRecorder::attach(&controller);
    connected(&controller).await;

    let start = Instant::now();
    confirm_end_session(&backend).await;
    states.wait_for(ConnectionState::Disconnected).await;
    let elapsed = start.elapsed();

    assert!(elapsed >= Duration::from_secs(15), "{elapsed:?}");
    assert!(elapsed < Duration::from_millis(15_500), "{elapsed:?}");
    assert_eq!(last_disconnect(&controller), Some(DisconnectReason::FallbackTimeout));
    assert_eq!(states.count(ConnectionState::Disconnected), 1);
}

#[tokio::test(start_paused = true)]
async fn test_unavailable_sink_uses_fast_heuristic() {
    let (controller, backend) = build_with_locator(LocatorScript::Unavailable);
    let errors = ErrorRecorder::attach(&controller);
    let mut states = StateRecorder::attach(&controller);
    connected(&controller).await;

    confirm_end_session(&backend).await;
    // audio_done before response_done is remembered.
    backend.send_json(audio_done("resp_2"));
    settle().await;

    let start = Instant::now();
    backend.send_json(response_done("resp_2", "completed", &[]));
    states.wait_for(ConnectionState::Disconnected).await;
    let elapsed = start.elapsed();

    assert!(elapsed >= Duration::from_millis(500), "{elapsed:?}");
    assert!(elapsed < Duration::from_millis(700), "{elapsed:?}");
    assert_eq!(
        last_disconnect(&controller),
        Some(DisconnectReason::DiscoveryFailed { attempts: 1 })
    );
    assert!(
        errors
            .errors()
            .iter()
            .any(|e| matches!(e, SessionError::SinkUnavailable(reason) if reason.contains("no output device")))
    );
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_discovery_uses_slow_heuristic() {
    let locator = ScriptedLocator::new(LocatorScript::NeverFound);
    let (controller, backend) = build(Arc::new(RecordingSink::default()), locator.clone());
    let mut states = StateRecorder::attach(&controller);
    connected(&controller).await;

    confirm_end_session(&backend).await;
    backend.send_json(response_done("resp_2", "completed", &[]));
    settle().await;

    let start = Instant::now();
    backend.send_json(audio_done("resp_2"));
    states.wait_for(ConnectionState::Disconnected).await;
    let elapsed = start.elapsed();

    // Ten attempts 200ms apart, then the 2500ms slow delay.
    assert_eq!(locator.calls(), 10);
    assert!(elapsed >= Duration::from_millis(4200), "{elapsed:?}");
    assert!(elapsed < Duration::from_millis(4700), "{elapsed:?}");
    assert_eq!(
        last_disconnect(&controller),
        Some(DisconnectReason::DiscoveryFailed { attempts: 10 })
    );
}

#[tokio::test(start_paused = true)]
async fn test_response_with_trigger_call_is_not_goodbye() {
    let (controller, backend) = build_with_locator(LocatorScript::AlwaysLoud);
    connected(&controller).await;

    confirm_end_session(&backend).await;
    backend.send_json(audio_done("resp_1"));
    settle().await;

    // resp_1 issued the end-session call, so it is not the goodbye.
    let diagnostics = controller.diagnostics();
    assert_eq!(diagnostics.end_session.phase, EndSessionPhase::ExpectingGoodbye);
    assert_eq!(
        diagnostics.end_session.trigger_call_id.as_deref(),
        Some("call_end")
    );
    assert!(diagnostics.monitor.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_failed_goodbye_response_keeps_waiting() {
    let (controller, backend) = build_with_locator(LocatorScript::AlwaysLoud);
    connected(&controller).await;

    confirm_end_session(&backend).await;
    backend.send_json(response_done("resp_2", "cancelled", &[]));
    settle().await;

    assert_eq!(
        controller.diagnostics().end_session.phase,
        EndSessionPhase::ExpectingGoodbye
    );
}

// =============================================================================
// Teardown
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_disconnect_is_idempotent() {
    let (controller, backend) = build_with_locator(LocatorScript::NeverFound);
    let states = StateRecorder::attach(&controller);
    connected(&controller).await;

    let (a, b, c) = tokio::join!(
        controller.disconnect(),
        controller.disconnect(),
        controller.disconnect()
    );
    assert!(a.is_ok() && b.is_ok() && c.is_ok());
    settle().await;

    let diagnostics = controller.diagnostics();
    assert_eq!(diagnostics.disconnect_requests, 3);
    assert_eq!(diagnostics.disconnects_performed, 1);
    assert_eq!(backend.closes(), 1);
    assert_eq!(states.count(ConnectionState::Disconnected), 1);
    assert!(!controller.send_message("after disconnect"));
}

#[tokio::test(start_paused = true)]
async fn test_explicit_disconnect_cancels_end_session_timers() {
    let (controller, backend) = build_with_locator(LocatorScript::NeverFound);
    let states = StateRecorder::attach(&controller);
    connected(&controller).await;

    confirm_end_session(&backend).await;
    controller.disconnect().await.unwrap();

    // Well past the fallback; nothing else may fire.
    tokio::time::sleep(Duration::from_secs(30)).await;

    let diagnostics = controller.diagnostics();
    assert_eq!(diagnostics.disconnects_performed, 1);
    assert_eq!(diagnostics.end_session.phase, EndSessionPhase::Idle);
    assert_eq!(diagnostics.end_session.last_disconnect, None);
    assert_eq!(states.count(ConnectionState::Disconnected), 1);
}

#[tokio::test(start_paused = true)]
async fn test_transport_loss_fails_without_reconnect() {
    let (controller, backend) = build_with_locator(LocatorScript::NeverFound);
    let errors = ErrorRecorder::attach(&controller);
    let mut states = StateRecorder::attach(&controller);
    connected(&controller).await;

    backend.close("server going away");
    states.wait_for(ConnectionState::Failed).await;
    tokio::time::sleep(Duration::from_secs(30)).await;

    assert_eq!(controller.state(), ConnectionState::Failed);
    assert_eq!(backend.opens(), 1);
    assert!(
        errors
            .errors()
            .iter()
            .any(|e| matches!(e, SessionError::ConnectionLost(_)))
    );

    // A later disconnect does not tear down twice.
    controller.disconnect().await.unwrap();
    assert_eq!(controller.diagnostics().disconnects_performed, 1);
    assert_eq!(controller.state(), ConnectionState::Failed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_immediate_hang_up_leaves_session_failed() {
    for _ in 0..20 {
        let (controller, backend) = build_with_locator(LocatorScript::NeverFound);
        backend.hang_up_on_open(true);
        let mut states = StateRecorder::attach(&controller);

        controller.connect().await.unwrap();
        states.wait_for(ConnectionState::Failed).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(controller.state(), ConnectionState::Failed);
        assert_eq!(
            states.history(),
            vec![
                ConnectionState::Connecting,
                ConnectionState::Connected,
                ConnectionState::Failed
            ]
        );
        assert_eq!(controller.diagnostics().disconnects_performed, 1);
    }
}
