//! Audio playback pipeline.
//!
//! Chunks of synthesized speech arrive tagged with a message ID and a
//! per-message sequence number. The pipeline keeps the chunks of each
//! message, queues them, and renders them in order through an
//! [`AudioSink`] on a single worker task. A chunk that fails to render is
//! reported and skipped; the queue keeps draining.
//!
//! Per turn the state goes `Idle -> Buffering -> Playing -> Idle`, with an
//! `Error` excursion on a render failure that always returns to `Idle` or
//! `Playing`.

use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::sink::AudioSink;

/// Capacity of the playback event broadcast channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Errors returned when feeding the pipeline.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum PlaybackError {
    /// The chunk does not continue its message's sequence
    #[error("Out-of-order chunk for {message_id}: expected {expected}, got {got}")]
    OutOfOrder {
        message_id: String,
        expected: u64,
        got: u64,
    },

    /// The message was already marked complete
    #[error("Message {0} is already complete")]
    MessageComplete(String),
}

/// Playback state of the current turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackState {
    #[default]
    Idle,
    Buffering,
    Playing,
    Error,
}

impl fmt::Display for PlaybackState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlaybackState::Idle => write!(f, "idle"),
            PlaybackState::Buffering => write!(f, "buffering"),
            PlaybackState::Playing => write!(f, "playing"),
            PlaybackState::Error => write!(f, "error"),
        }
    }
}

/// One chunk of audio for a message.
#[derive(Debug, Clone)]
pub struct AudioChunk {
    pub message_id: String,
    pub sequence_number: u64,
    pub data: Bytes,
    pub timestamp: OffsetDateTime,
    pub processed: bool,
}

/// All chunks received for one assistant message.
#[derive(Debug, Clone)]
pub struct AudioMessage {
    pub id: String,
    pub chunks: Vec<AudioChunk>,
    pub is_complete: bool,
    pub started_at: OffsetDateTime,
    pub completed_at: Option<OffsetDateTime>,
}

impl AudioMessage {
    fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            chunks: Vec::new(),
            is_complete: false,
            started_at: OffsetDateTime::now_utc(),
            completed_at: None,
        }
    }

    fn next_sequence(&self) -> u64 {
        self.chunks.len() as u64
    }

    /// Total payload bytes across all chunks.
    pub fn total_bytes(&self) -> usize {
        self.chunks.iter().map(|c| c.data.len()).sum()
    }
}

/// Notifications published by the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum PlaybackEvent {
    StateChanged(PlaybackState),
    PlaybackStarted { message_id: String },
    ChunkFailed {
        message_id: String,
        sequence_number: u64,
        error: String,
    },
    PlaybackEnded,
}

/// Snapshot of pipeline counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PlaybackStats {
    pub state: PlaybackState,
    pub queue_depth: usize,
    pub is_playing: bool,
    pub chunks_played: u64,
    pub chunks_failed: u64,
    pub turns_completed: u64,
    pub retained_messages: usize,
}

#[derive(Default)]
struct PipelineState {
    state: PlaybackState,
    queue: VecDeque<AudioChunk>,
    messages: HashMap<String, AudioMessage>,
    /// Arrival order of retained messages
    message_order: Vec<String>,
    worker_active: bool,
    /// Bumped by `clear()` so a running worker stops at its next chunk
    generation: u64,
    chunks_played: u64,
    chunks_failed: u64,
    turns_completed: u64,
}

/// Ordered, single-worker playback of streamed audio.
#[derive(Clone)]
pub struct PlaybackPipeline {
    sink: Arc<dyn AudioSink>,
    inner: Arc<Mutex<PipelineState>>,
    events: broadcast::Sender<PlaybackEvent>,
}

impl PlaybackPipeline {
    pub fn new(sink: Arc<dyn AudioSink>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            sink,
            inner: Arc::new(Mutex::new(PipelineState::default())),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PlaybackEvent> {
        self.events.subscribe()
    }

    /// Append bytes to `message_id`, assigning the next sequence number.
    pub fn ingest(&self, message_id: &str, data: Bytes) -> Result<u64, PlaybackError> {
        let sequence_number = {
            let inner = self.inner.lock();
            inner
                .messages
                .get(message_id)
                .map(AudioMessage::next_sequence)
                .unwrap_or(0)
        };
        self.push_chunk(message_id, sequence_number, data)?;
        Ok(sequence_number)
    }

    /// Append an explicitly numbered chunk. The number must be the next one
    /// for its message.
    pub fn push_chunk(
        &self,
        message_id: &str,
        sequence_number: u64,
        data: Bytes,
    ) -> Result<(), PlaybackError> {
        let mut transitions = Vec::new();
        let spawn_generation;
        {
            let mut inner = self.inner.lock();

            if !inner.messages.contains_key(message_id) {
                Self::supersede_completed(&mut inner);
                inner
                    .messages
                    .insert(message_id.to_string(), AudioMessage::new(message_id));
                inner.message_order.push(message_id.to_string());
            }

            let chunk = {
                let Some(message) = inner.messages.get_mut(message_id) else {
                    return Ok(());
                };
                if message.is_complete {
                    return Err(PlaybackError::MessageComplete(message_id.to_string()));
                }
                let expected = message.next_sequence();
                if sequence_number != expected {
                    return Err(PlaybackError::OutOfOrder {
                        message_id: message_id.to_string(),
                        expected,
                        got: sequence_number,
                    });
                }
                let chunk = AudioChunk {
                    message_id: message_id.to_string(),
                    sequence_number,
                    data,
                    timestamp: OffsetDateTime::now_utc(),
                    processed: false,
                };
                message.chunks.push(chunk.clone());
                chunk
            };

            inner.queue.push_back(chunk);

            if inner.state == PlaybackState::Idle {
                inner.state = PlaybackState::Buffering;
                transitions.push(PlaybackEvent::StateChanged(PlaybackState::Buffering));
            }

            spawn_generation = if inner.worker_active {
                None
            } else {
                inner.worker_active = true;
                Some(inner.generation)
            };
        }

        for event in transitions {
            let _ = self.events.send(event);
        }

        if let Some(generation) = spawn_generation {
            let pipeline = self.clone();
            tokio::spawn(async move { pipeline.run_worker(generation).await });
        }

        Ok(())
    }

    /// Mark a message as fully received.
    pub fn complete_message(&self, message_id: &str) {
        let mut inner = self.inner.lock();
        if let Some(message) = inner.messages.get_mut(message_id) {
            if !message.is_complete {
                message.is_complete = true;
                message.completed_at = Some(OffsetDateTime::now_utc());
                debug!(
                    message_id,
                    chunks = message.chunks.len(),
                    bytes = message.total_bytes(),
                    "Audio message complete"
                );
            }
        }
    }

    /// Drop retained messages that are complete, keeping at most the newest
    /// one in progress.
    fn supersede_completed(inner: &mut PipelineState) {
        let completed: Vec<String> = inner
            .message_order
            .iter()
            .filter(|id| inner.messages.get(*id).is_some_and(|m| m.is_complete))
            .cloned()
            .collect();
        for id in completed {
            inner.messages.remove(&id);
            inner.message_order.retain(|m| m != &id);
        }
    }

    async fn run_worker(&self, generation: u64) {
        let mut current_message: Option<String> = None;

        loop {
            let chunk = {
                let mut inner = self.inner.lock();
                if inner.generation != generation {
                    return;
                }
                match inner.queue.pop_front() {
                    Some(chunk) => chunk,
                    None => {
                        inner.worker_active = false;
                        inner.state = PlaybackState::Idle;
                        inner.turns_completed += 1;
                        drop(inner);
                        let _ = self
                            .events
                            .send(PlaybackEvent::StateChanged(PlaybackState::Idle));
                        let _ = self.events.send(PlaybackEvent::PlaybackEnded);
                        info!("Playback ended");
                        return;
                    }
                }
            };

            if current_message.as_deref() != Some(chunk.message_id.as_str()) {
                current_message = Some(chunk.message_id.clone());
                self.set_state(generation, PlaybackState::Playing);
                let _ = self.events.send(PlaybackEvent::PlaybackStarted {
                    message_id: chunk.message_id.clone(),
                });
            }

            match self.sink.render(&chunk.data).await {
                Ok(()) => {
                    let mut inner = self.inner.lock();
                    inner.chunks_played += 1;
                    if let Some(message) = inner.messages.get_mut(&chunk.message_id) {
                        if let Some(stored) = message
                            .chunks
                            .get_mut(chunk.sequence_number as usize)
                        {
                            stored.processed = true;
                        }
                    }
                }
                Err(e) => {
                    warn!(
                        message_id = %chunk.message_id,
                        sequence = chunk.sequence_number,
                        "Failed to render audio chunk: {}",
                        e
                    );
                    self.inner.lock().chunks_failed += 1;
                    self.set_state(generation, PlaybackState::Error);
                    let _ = self.events.send(PlaybackEvent::ChunkFailed {
                        message_id: chunk.message_id.clone(),
                        sequence_number: chunk.sequence_number,
                        error: e.to_string(),
                    });
                    self.set_state(generation, PlaybackState::Playing);
                }
            }
        }
    }

    fn set_state(&self, generation: u64, state: PlaybackState) {
        let changed = {
            let mut inner = self.inner.lock();
            if inner.generation != generation {
                return;
            }
            let changed = inner.state != state;
            inner.state = state;
            changed
        };
        if changed {
            let _ = self.events.send(PlaybackEvent::StateChanged(state));
        }
    }

    /// Drop queued chunks and retained messages, and stop the worker.
    pub fn clear(&self) {
        let was_active = {
            let mut inner = self.inner.lock();
            let was_active = inner.worker_active || !inner.queue.is_empty();
            inner.queue.clear();
            inner.messages.clear();
            inner.message_order.clear();
            inner.worker_active = false;
            inner.generation += 1;
            inner.state = PlaybackState::Idle;
            was_active
        };
        self.sink.clear();
        if was_active {
            let _ = self
                .events
                .send(PlaybackEvent::StateChanged(PlaybackState::Idle));
        }
    }

    pub fn state(&self) -> PlaybackState {
        self.inner.lock().state
    }

    pub fn is_playing(&self) -> bool {
        matches!(
            self.inner.lock().state,
            PlaybackState::Playing | PlaybackState::Buffering
        )
    }

    pub fn queue_depth(&self) -> usize {
        self.inner.lock().queue.len()
    }

    pub fn message(&self, message_id: &str) -> Option<AudioMessage> {
        self.inner.lock().messages.get(message_id).cloned()
    }

    pub fn stats(&self) -> PlaybackStats {
        let inner = self.inner.lock();
        PlaybackStats {
            state: inner.state,
            queue_depth: inner.queue.len(),
            is_playing: matches!(
                inner.state,
                PlaybackState::Playing | PlaybackState::Buffering
            ),
            chunks_played: inner.chunks_played,
            chunks_failed: inner.chunks_failed,
            turns_completed: inner.turns_completed,
            retained_messages: inner.messages.len(),
        }
    }
}
