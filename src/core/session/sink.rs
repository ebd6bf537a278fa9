//! Audio output capabilities.
//!
//! The playback pipeline renders into an [`AudioSink`]; the volume monitor
//! reads what is actually playing through a [`SignalTap`] obtained from a
//! [`SinkLocator`]. Each capability is a separate narrow trait so that
//! callers never need to query an object for optional methods.
//!
//! [`VirtualOutput`] implements all three: it paces rendering in real time
//! at the configured sample rate and exposes the currently playing frame.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info};

/// Errors raised by audio sinks and sink discovery.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SinkError {
    /// The sink cannot be reached and retrying will not help
    #[error("Audio sink unavailable: {0}")]
    Unavailable(String),

    /// A chunk could not be rendered
    #[error("Render failed: {0}")]
    RenderFailed(String),

    /// The WAV recorder failed
    #[error("Recording failed: {0}")]
    Recording(String),
}

/// Destination for synthesized PCM 16-bit little-endian mono audio.
#[async_trait]
pub trait AudioSink: Send + Sync {
    /// Render one chunk. Returns once the chunk has been handed to the output.
    async fn render(&self, pcm: &[u8]) -> Result<(), SinkError>;

    /// Drop anything the sink has buffered.
    fn clear(&self) {}
}

/// Read access to the signal that is currently being played.
pub trait SignalTap: Send + Sync {
    /// Fill `frame` with the most recent output samples, normalized to
    /// [-1.0, 1.0]. Positions with nothing playing are zero.
    fn read_frame(&self, frame: &mut [f32]);
}

/// Finds the live signal tap.
///
/// `Ok(Some(_))` attaches, `Ok(None)` means "not there yet, ask again", and
/// `Err(_)` means retrying is pointless.
#[async_trait]
pub trait SinkLocator: Send + Sync {
    async fn locate(&self) -> Result<Option<Arc<dyn SignalTap>>, SinkError>;
}

/// Convert PCM 16-bit little-endian bytes to normalized samples.
pub fn pcm16_to_f32(pcm: &[u8]) -> Vec<f32> {
    pcm.chunks_exact(2)
        .map(|b| i16::from_le_bytes([b[0], b[1]]) as f32 / 32768.0)
        .collect()
}

// =============================================================================
// Virtual Output
// =============================================================================

struct PlayingChunk {
    samples: Arc<Vec<f32>>,
    started: Instant,
}

struct VirtualOutputInner {
    sample_rate: u32,
    opened: AtomicBool,
    playing: Mutex<Option<PlayingChunk>>,
    recorder: Mutex<Option<hound::WavWriter<BufWriter<File>>>>,
    samples_rendered: AtomicU64,
}

/// Real-time paced output device with a built-in signal tap.
#[derive(Clone)]
pub struct VirtualOutput {
    inner: Arc<VirtualOutputInner>,
}

impl VirtualOutput {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            inner: Arc::new(VirtualOutputInner {
                sample_rate: sample_rate.max(1),
                opened: AtomicBool::new(false),
                playing: Mutex::new(None),
                recorder: Mutex::new(None),
                samples_rendered: AtomicU64::new(0),
            }),
        }
    }

    /// Also write everything rendered to a WAV file.
    pub fn with_recording(self, path: impl AsRef<Path>) -> Result<Self, SinkError> {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: self.inner.sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let writer = hound::WavWriter::create(path.as_ref(), spec)
            .map_err(|e| SinkError::Recording(e.to_string()))?;
        info!(path = %path.as_ref().display(), "Recording session audio");
        *self.inner.recorder.lock() = Some(writer);
        Ok(self)
    }

    /// Flush and close the WAV recording, if any.
    pub fn finish_recording(&self) -> Result<(), SinkError> {
        if let Some(writer) = self.inner.recorder.lock().take() {
            writer
                .finalize()
                .map_err(|e| SinkError::Recording(e.to_string()))?;
        }
        Ok(())
    }

    pub fn sample_rate(&self) -> u32 {
        self.inner.sample_rate
    }

    /// Whether anything has been rendered yet.
    pub fn is_open(&self) -> bool {
        self.inner.opened.load(Ordering::Acquire)
    }

    pub fn samples_rendered(&self) -> u64 {
        self.inner.samples_rendered.load(Ordering::Relaxed)
    }

    fn record(&self, pcm: &[u8]) -> Result<(), SinkError> {
        let mut recorder = self.inner.recorder.lock();
        if let Some(writer) = recorder.as_mut() {
            for b in pcm.chunks_exact(2) {
                writer
                    .write_sample(i16::from_le_bytes([b[0], b[1]]))
                    .map_err(|e| SinkError::Recording(e.to_string()))?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl AudioSink for VirtualOutput {
    async fn render(&self, pcm: &[u8]) -> Result<(), SinkError> {
        if pcm.len() % 2 != 0 {
            return Err(SinkError::RenderFailed(format!(
                "odd PCM16 payload length {}",
                pcm.len()
            )));
        }

        let samples = pcm16_to_f32(pcm);
        let duration =
            Duration::from_secs_f64(samples.len() as f64 / self.inner.sample_rate as f64);

        self.record(pcm)?;
        self.inner.opened.store(true, Ordering::Release);
        self.inner
            .samples_rendered
            .fetch_add(samples.len() as u64, Ordering::Relaxed);

        *self.inner.playing.lock() = Some(PlayingChunk {
            samples: Arc::new(samples),
            started: Instant::now(),
        });

        tokio::time::sleep(duration).await;
        Ok(())
    }

    fn clear(&self) {
        debug!("Clearing virtual output");
        *self.inner.playing.lock() = None;
    }
}

impl SignalTap for VirtualOutput {
    fn read_frame(&self, frame: &mut [f32]) {
        frame.fill(0.0);

        let (samples, started) = match self.inner.playing.lock().as_ref() {
            Some(chunk) => (chunk.samples.clone(), chunk.started),
            None => return,
        };

        let position =
            (started.elapsed().as_secs_f64() * self.inner.sample_rate as f64) as usize;
        if position >= samples.len() {
            return;
        }

        // Window ending at the playhead, right-aligned in the frame.
        let end = position.max(1).min(samples.len());
        let start = end.saturating_sub(frame.len());
        let window = &samples[start..end];
        let offset = frame.len() - window.len();
        frame[offset..].copy_from_slice(window);
    }
}

#[async_trait]
impl SinkLocator for VirtualOutput {
    async fn locate(&self) -> Result<Option<Arc<dyn SignalTap>>, SinkError> {
        if self.is_open() {
            Ok(Some(Arc::new(self.clone())))
        } else {
            Ok(None)
        }
    }
}
