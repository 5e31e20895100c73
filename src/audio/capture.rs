//! Microphone capture
//!
//! The cpal stream lives on a dedicated thread, as cpal streams are not `Send`
//! on every host. The callback downmixes to mono, resamples to the wire rate and
//! forwards samples without blocking; if the consumer falls behind, samples are
//! dropped on the capture side rather than stalling the device.

use bytes::Bytes;
use cpal::traits::{DeviceTrait, StreamTrait};
use crossbeam_channel::{bounded, RecvTimeoutError};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::audio::device::resolve_input;
use crate::audio::resample::StreamResampler;
use crate::codec::encoder::samples_to_pcm16;
use crate::error::CaptureError;

/// How long `start` waits for the device thread to report in
const OPEN_TIMEOUT: Duration = Duration::from_secs(3);

/// Capacity of the capture channel, in callback batches
const CAPTURE_CHANNEL_CAPACITY: usize = 64;

/// Output of a capture source
#[derive(Debug, Clone, PartialEq)]
pub enum CaptureEvent {
    /// Mono f32 samples at the requested rate
    Samples(Vec<f32>),
    /// The device failed; no more samples will follow
    Fault(CaptureError),
}

/// A microphone-like source
pub trait AudioInput: Send + 'static {
    /// Acquire the device and start producing mono samples at `sample_rate`
    fn start(&mut self, sample_rate: u32) -> Result<mpsc::Receiver<CaptureEvent>, CaptureError>;

    /// Release the device; idempotent
    fn stop(&mut self);
}

impl AudioInput for Box<dyn AudioInput> {
    fn start(&mut self, sample_rate: u32) -> Result<mpsc::Receiver<CaptureEvent>, CaptureError> {
        (**self).start(sample_rate)
    }

    fn stop(&mut self) {
        (**self).stop()
    }
}

/// cpal-backed microphone
pub struct MicrophoneInput {
    device_id: Option<String>,
    running: Arc<AtomicBool>,
    thread_handle: Option<JoinHandle<()>>,
    samples_captured: Arc<AtomicU64>,
    samples_dropped: Arc<AtomicU64>,
}

impl MicrophoneInput {
    pub fn new(device_id: Option<String>) -> Self {
        Self {
            device_id,
            running: Arc::new(AtomicBool::new(false)),
            thread_handle: None,
            samples_captured: Arc::new(AtomicU64::new(0)),
            samples_dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn samples_captured(&self) -> u64 {
        self.samples_captured.load(Ordering::Relaxed)
    }

    pub fn samples_dropped(&self) -> u64 {
        self.samples_dropped.load(Ordering::Relaxed)
    }
}

/// Map a backend error string onto the capture taxonomy
fn classify(message: String) -> CaptureError {
    let lower = message.to_lowercase();
    if lower.contains("permission") || lower.contains("denied") || lower.contains("not authorized") {
        CaptureError::PermissionDenied(message)
    } else {
        CaptureError::DeviceUnavailable(message)
    }
}

impl AudioInput for MicrophoneInput {
    fn start(&mut self, sample_rate: u32) -> Result<mpsc::Receiver<CaptureEvent>, CaptureError> {
        if self.is_running() {
            self.stop();
        }

        let (event_tx, event_rx) = mpsc::channel::<CaptureEvent>(CAPTURE_CHANNEL_CAPACITY);
        let (ready_tx, ready_rx) = bounded::<Result<(), CaptureError>>(1);
        let (error_tx, error_rx) = bounded::<CaptureError>(16);

        let device_id = self.device_id.clone();
        let running = self.running.clone();
        let samples_captured = self.samples_captured.clone();
        let samples_dropped = self.samples_dropped.clone();
        self.samples_captured.store(0, Ordering::SeqCst);
        self.samples_dropped.store(0, Ordering::SeqCst);
        running.store(true, Ordering::SeqCst);

        let handle = thread::Builder::new()
            .name("capture-mic".to_string())
            .spawn(move || {
                let opened = (|| -> Result<cpal::Stream, CaptureError> {
                    let device = resolve_input(device_id.as_deref()).map_err(classify)?;
                    let supported = device.default_input_config().map_err(classify)?;
                    let channels = supported.channels() as usize;
                    let device_rate = supported.sample_rate().0;
                    let config: cpal::StreamConfig = supported.into();

                    let mut resampler = StreamResampler::new(device_rate, sample_rate)
                        .map_err(CaptureError::DeviceUnavailable)?;
                    let callback_running = running.clone();
                    let data_tx = event_tx.clone();
                    let mut mono = Vec::new();

                    let stream = device
                        .into_inner()
                        .build_input_stream(
                            &config,
                            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                                if !callback_running.load(Ordering::Relaxed) {
                                    return;
                                }
                                mono.clear();
                                mono.extend(
                                    data.chunks(channels.max(1))
                                        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32),
                                );
                                let mut out = Vec::with_capacity(mono.len());
                                resampler.process(&mono, &mut out);
                                if out.is_empty() {
                                    return;
                                }
                                let count = out.len() as u64;
                                if data_tx.try_send(CaptureEvent::Samples(out)).is_ok() {
                                    samples_captured.fetch_add(count, Ordering::Relaxed);
                                } else {
                                    samples_dropped.fetch_add(count, Ordering::Relaxed);
                                }
                            },
                            move |err| {
                                let _ = error_tx.try_send(classify(err.to_string()));
                            },
                            None,
                        )
                        .map_err(|e| classify(e.to_string()))?;
                    stream.play().map_err(|e| classify(e.to_string()))?;
                    Ok(stream)
                })();

                let stream = match opened {
                    Ok(stream) => {
                        let _ = ready_tx.send(Ok(()));
                        stream
                    }
                    Err(e) => {
                        running.store(false, Ordering::SeqCst);
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                while running.load(Ordering::Relaxed) {
                    match error_rx.recv_timeout(Duration::from_millis(10)) {
                        Ok(err) => {
                            tracing::error!("Microphone stream error: {}", err);
                            running.store(false, Ordering::SeqCst);
                            let _ = event_tx.blocking_send(CaptureEvent::Fault(err));
                            break;
                        }
                        Err(RecvTimeoutError::Timeout) => {}
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }

                drop(stream);
                tracing::debug!("Microphone stream released");
            })
            .map_err(|e| CaptureError::DeviceUnavailable(e.to_string()))?;

        self.thread_handle = Some(handle);

        match ready_rx.recv_timeout(OPEN_TIMEOUT) {
            Ok(Ok(())) => {
                tracing::info!("Microphone capture started at {} Hz", sample_rate);
                Ok(event_rx)
            }
            Ok(Err(e)) => {
                self.stop();
                Err(e)
            }
            Err(_) => {
                self.stop();
                Err(CaptureError::DeviceUnavailable(
                    "microphone did not start in time".to_string(),
                ))
            }
        }
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for MicrophoneInput {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Regroups a sample stream into fixed-size i16 LE PCM chunks
pub struct Chunker {
    samples_per_chunk: usize,
    pending: Vec<f32>,
}

impl Chunker {
    pub fn new(samples_per_chunk: usize) -> Self {
        let samples_per_chunk = samples_per_chunk.max(1);
        Self {
            samples_per_chunk,
            pending: Vec::with_capacity(samples_per_chunk * 2),
        }
    }

    /// Append samples and return every complete chunk
    pub fn push(&mut self, samples: &[f32]) -> Vec<Bytes> {
        self.pending.extend_from_slice(samples);
        let complete = self.pending.len() / self.samples_per_chunk;
        let mut chunks = Vec::with_capacity(complete);

        for chunk in self
            .pending
            .chunks_exact(self.samples_per_chunk)
            .take(complete)
        {
            chunks.push(samples_to_pcm16(chunk));
        }
        self.pending.drain(..complete * self.samples_per_chunk);
        chunks
    }

    /// Samples waiting for a full chunk
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunker_emits_full_chunks_only() {
        let mut chunker = Chunker::new(4);
        assert!(chunker.push(&[0.0; 3]).is_empty());

        let chunks = chunker.push(&[0.5; 6]);
        assert_eq!(chunks.len(), 2);
        assert!(chunks.iter().all(|c| c.len() == 8));
        assert_eq!(chunker.pending(), 1);
    }

    #[test]
    fn test_chunker_pcm_values() {
        let mut chunker = Chunker::new(2);
        let chunks = chunker.push(&[1.0, -2.0]);
        let pcm = &chunks[0];
        assert_eq!(i16::from_le_bytes([pcm[0], pcm[1]]), i16::MAX);
        assert_eq!(i16::from_le_bytes([pcm[2], pcm[3]]), -i16::MAX);
    }

    #[test]
    fn test_classify_permission() {
        assert!(matches!(
            classify("Access denied by the system".into()),
            CaptureError::PermissionDenied(_)
        ));
        assert!(matches!(
            classify("device disconnected".into()),
            CaptureError::DeviceUnavailable(_)
        ));
    }

    #[test]
    fn test_microphone_start_reports_outcome() {
        // Only meaningful with hardware; without it start must fail cleanly
        let mut mic = MicrophoneInput::new(Some("input:__no_such_device__".into()));
        assert!(mic.start(16_000).is_err());
        assert!(!mic.is_running());
        mic.stop();
    }
}
