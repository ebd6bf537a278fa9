//! In-memory realtime backend for session tests
//!
//! Provides:
//! - `MockTransport`: a `Transport` whose peer is driven by the test
//! - `MockBackend`: pushes server events and inspects client events
//! - Wire event builders matching the realtime protocol
//! - Scripted sink locators and taps for the volume monitor
//! - State and error recorders fed from controller callbacks

// Shared by several test binaries; not every helper is used by each.
#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use base64::prelude::*;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::mpsc;

use waav_session::core::session::{
    AudioSink, ConnectionState, SessionController, SessionError, SessionResult, SignalTap,
    SinkError, SinkLocator, TranscriptResult, Transport, TransportChannels, TransportFrame,
};

// =============================================================================
// Transport
// =============================================================================

#[derive(Default)]
struct MockShared {
    inbound: Mutex<Option<mpsc::Sender<TransportFrame>>>,
    sent: Mutex<Vec<Value>>,
    opens: AtomicUsize,
    closes: AtomicUsize,
    fail_open: AtomicBool,
    hang_up_on_open: AtomicBool,
}

/// Transport whose far end is a [`MockBackend`].
pub struct MockTransport {
    shared: Arc<MockShared>,
}

/// Create a connected transport/backend pair.
pub fn mock_transport() -> (MockTransport, MockBackend) {
    let shared = Arc::new(MockShared::default());
    (
        MockTransport {
            shared: shared.clone(),
        },
        MockBackend { shared },
    )
}

#[async_trait]
impl Transport for MockTransport {
    async fn open(&mut self) -> SessionResult<TransportChannels> {
        self.shared.opens.fetch_add(1, Ordering::SeqCst);
        if self.shared.fail_open.load(Ordering::SeqCst) {
            return Err(SessionError::ConnectionFailed(
                "mock backend refused the connection".to_string(),
            ));
        }

        let (out_tx, mut out_rx) = mpsc::channel(256);
        let (in_tx, in_rx) = mpsc::channel(1024);
        if self.shared.hang_up_on_open.load(Ordering::SeqCst) {
            drop(in_tx);
        } else {
            *self.shared.inbound.lock() = Some(in_tx);
        }

        // Drains until the controller drops its outbound sender.
        let shared = self.shared.clone();
        tokio::spawn(async move {
            while let Some(event) = out_rx.recv().await {
                let value = serde_json::to_value(&event).unwrap_or(Value::Null);
                shared.sent.lock().push(value);
            }
        });

        Ok(TransportChannels {
            outbound: out_tx,
            inbound: in_rx,
        })
    }

    async fn close(&mut self) -> SessionResult<()> {
        self.shared.closes.fetch_add(1, Ordering::SeqCst);
        self.shared.inbound.lock().take();
        Ok(())
    }
}

/// Test-side handle on the mock backend.
#[derive(Clone)]
pub struct MockBackend {
    shared: Arc<MockShared>,
}

impl MockBackend {
    pub fn refuse_connections(&self, refuse: bool) {
        self.shared.fail_open.store(refuse, Ordering::SeqCst);
    }

    /// Accept connections but drop the inbound side straight away.
    pub fn hang_up_on_open(&self, hang_up: bool) {
        self.shared.hang_up_on_open.store(hang_up, Ordering::SeqCst);
    }

    pub fn opens(&self) -> usize {
        self.shared.opens.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.shared.closes.load(Ordering::SeqCst)
    }

    pub fn is_open(&self) -> bool {
        self.shared.inbound.lock().is_some()
    }

    /// Push a raw text frame to the client.
    pub fn send_raw(&self, text: &str) {
        let sender = self.shared.inbound.lock().clone();
        let sender = sender.expect("mock backend is not connected");
        sender
            .try_send(TransportFrame::Text(text.to_string()))
            .expect("inbound channel full");
    }

    /// Push a server event to the client.
    pub fn send_json(&self, event: Value) {
        self.send_raw(&event.to_string());
    }

    /// Drop the connection from the backend side.
    pub fn close(&self, reason: &str) {
        if let Some(sender) = self.shared.inbound.lock().take() {
            let _ = sender.try_send(TransportFrame::Closed {
                reason: reason.to_string(),
            });
        }
    }

    /// Every client event received so far, as JSON.
    pub fn sent(&self) -> Vec<Value> {
        self.shared.sent.lock().clone()
    }

    pub fn sent_types(&self) -> Vec<String> {
        self.sent()
            .iter()
            .filter_map(|e| e["type"].as_str().map(str::to_string))
            .collect()
    }

    /// Function outputs received so far, in arrival order, as
    /// `(call_id, parsed output)`.
    pub fn function_outputs(&self) -> Vec<(String, Value)> {
        self.sent()
            .iter()
            .filter(|e| e["type"] == "conversation.item.create")
            .filter(|e| e["item"]["type"] == "function_call_output")
            .map(|e| {
                let call_id = e["item"]["call_id"].as_str().unwrap_or_default().to_string();
                let output = e["item"]["output"]
                    .as_str()
                    .and_then(|s| serde_json::from_str(s).ok())
                    .unwrap_or(Value::Null);
                (call_id, output)
            })
            .collect()
    }

    pub fn outputs_for(&self, call_id: &str) -> Vec<Value> {
        self.function_outputs()
            .into_iter()
            .filter(|(id, _)| id == call_id)
            .map(|(_, output)| output)
            .collect()
    }

    /// Wait until an output for `call_id` has arrived.
    pub async fn wait_for_output(&self, call_id: &str) -> Value {
        for _ in 0..10_000 {
            if let Some(output) = self.outputs_for(call_id).into_iter().next() {
                return output;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        panic!("no function output for {call_id}");
    }
}

// =============================================================================
// Wire Events
// =============================================================================

pub fn session_created(id: &str) -> Value {
    json!({
        "type": "session.created",
        "session": { "id": id, "model": "gpt-4o-realtime-preview" }
    })
}

pub fn function_call(call_id: &str, name: &str, arguments: Value, response_id: &str) -> Value {
    json!({
        "type": "response.function_call_arguments.done",
        "response_id": response_id,
        "item_id": format!("item_{call_id}"),
        "call_id": call_id,
        "name": name,
        "arguments": arguments.to_string()
    })
}

pub fn audio_delta(response_id: &str, pcm: &[u8]) -> Value {
    json!({
        "type": "response.audio.delta",
        "response_id": response_id,
        "item_id": format!("item_{response_id}"),
        "delta": BASE64_STANDARD.encode(pcm)
    })
}

pub fn audio_done(response_id: &str) -> Value {
    json!({
        "type": "response.audio.done",
        "response_id": response_id,
        "item_id": format!("item_{response_id}")
    })
}

/// `response.done` whose output lists the given function calls.
pub fn response_done(response_id: &str, status: &str, call_ids: &[&str]) -> Value {
    let output: Vec<Value> = call_ids
        .iter()
        .map(|id| json!({ "type": "function_call", "call_id": id, "status": "completed" }))
        .collect();
    json!({
        "type": "response.done",
        "response": { "id": response_id, "status": status, "output": output }
    })
}

pub fn transcript_delta(response_id: &str, delta: &str) -> Value {
    json!({
        "type": "response.audio_transcript.delta",
        "response_id": response_id,
        "delta": delta
    })
}

pub fn transcript_done(response_id: &str, transcript: &str) -> Value {
    json!({
        "type": "response.audio_transcript.done",
        "response_id": response_id,
        "transcript": transcript
    })
}

pub fn user_transcript(item_id: &str, transcript: &str) -> Value {
    json!({
        "type": "conversation.item.input_audio_transcription.completed",
        "item_id": item_id,
        "transcript": transcript
    })
}

pub fn error_event(error_type: &str, message: &str) -> Value {
    json!({
        "type": "error",
        "error": { "type": error_type, "message": message }
    })
}

/// Square wave at Nyquist, PCM16 little-endian.
pub fn tone(samples: usize, amplitude: i16) -> Vec<u8> {
    (0..samples)
        .flat_map(|i| {
            let v = if i % 2 == 0 { amplitude } else { -amplitude };
            v.to_le_bytes()
        })
        .collect()
}

// =============================================================================
// Audio Output
// =============================================================================

/// Sink that records chunks without real-time pacing.
#[derive(Default)]
pub struct RecordingSink {
    chunks: Mutex<Vec<Vec<u8>>>,
}

impl RecordingSink {
    pub fn chunks(&self) -> Vec<Vec<u8>> {
        self.chunks.lock().clone()
    }
}

#[async_trait]
impl AudioSink for RecordingSink {
    async fn render(&self, pcm: &[u8]) -> Result<(), SinkError> {
        self.chunks.lock().push(pcm.to_vec());
        tokio::time::sleep(Duration::from_millis(10)).await;
        Ok(())
    }
}

/// Tap that always reads a loud signal.
pub struct LoudTap;

impl SignalTap for LoudTap {
    fn read_frame(&self, frame: &mut [f32]) {
        for (i, s) in frame.iter_mut().enumerate() {
            *s = if i % 2 == 0 { 0.5 } else { -0.5 };
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocatorScript {
    /// Fail immediately with `SinkError::Unavailable`
    Unavailable,
    /// Never find a tap
    NeverFound,
    /// Find a tap that never goes quiet
    AlwaysLoud,
}

/// Sink locator with a fixed behaviour.
pub struct ScriptedLocator {
    script: LocatorScript,
    calls: AtomicU32,
}

impl ScriptedLocator {
    pub fn new(script: LocatorScript) -> Arc<Self> {
        Arc::new(Self {
            script,
            calls: AtomicU32::new(0),
        })
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SinkLocator for ScriptedLocator {
    async fn locate(&self) -> Result<Option<Arc<dyn SignalTap>>, SinkError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.script {
            LocatorScript::Unavailable => {
                Err(SinkError::Unavailable("no output device".to_string()))
            }
            LocatorScript::NeverFound => Ok(None),
            LocatorScript::AlwaysLoud => Ok(Some(Arc::new(LoudTap))),
        }
    }
}

// =============================================================================
// Recorders
// =============================================================================

/// Records every state change and lets a test wait for one.
pub struct StateRecorder {
    history: Arc<Mutex<Vec<ConnectionState>>>,
    rx: mpsc::UnboundedReceiver<ConnectionState>,
}

impl StateRecorder {
    pub fn attach(controller: &SessionController) -> Self {
        let history = Arc::new(Mutex::new(Vec::new()));
        let (tx, rx) = mpsc::unbounded_channel();
        let recorded = history.clone();
        controller.on_state_change(Arc::new(move |state: ConnectionState| {
            recorded.lock().push(state);
            let _ = tx.send(state);
            Box::pin(async {})
        }));
        Self { history, rx }
    }

    pub fn history(&self) -> Vec<ConnectionState> {
        self.history.lock().clone()
    }

    pub fn count(&self, state: ConnectionState) -> usize {
        self.history().iter().filter(|s| **s == state).count()
    }

    /// Wait (in virtual time) for `state`; panics after a minute.
    pub async fn wait_for(&mut self, state: ConnectionState) {
        let wait = async {
            while let Some(next) = self.rx.recv().await {
                if next == state {
                    return;
                }
            }
        };
        tokio::time::timeout(Duration::from_secs(60), wait)
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for {state}"));
    }
}

/// Collects errors reported through `on_error`.
#[derive(Clone, Default)]
pub struct ErrorRecorder {
    errors: Arc<Mutex<Vec<SessionError>>>,
}

impl ErrorRecorder {
    pub fn attach(controller: &SessionController) -> Self {
        let recorder = Self::default();
        let errors = recorder.errors.clone();
        controller.on_error(Arc::new(move |error: SessionError| {
            errors.lock().push(error);
            Box::pin(async {})
        }));
        recorder
    }

    pub fn errors(&self) -> Vec<SessionError> {
        self.errors.lock().clone()
    }
}

/// Collects transcripts reported through `on_transcript`.
#[derive(Clone, Default)]
pub struct TranscriptRecorder {
    transcripts: Arc<Mutex<Vec<TranscriptResult>>>,
}

impl TranscriptRecorder {
    pub fn attach(controller: &SessionController) -> Self {
        let recorder = Self::default();
        let transcripts = recorder.transcripts.clone();
        controller.on_transcript(Arc::new(move |t: TranscriptResult| {
            transcripts.lock().push(t);
            Box::pin(async {})
        }));
        recorder
    }

    pub fn transcripts(&self) -> Vec<TranscriptResult> {
        self.transcripts.lock().clone()
    }
}

/// Let spawned tasks run without advancing time much.
pub async fn settle() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
}
