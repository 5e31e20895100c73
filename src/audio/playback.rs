//! Reply audio rendering
//!
//! ```text
//!  enqueue(pcm, seq) ──► PlaybackBuffer ──► render thread ──► AudioOutput
//!        (never blocks)   (ordered, windowed)   (paced by device)
//! ```
//!
//! The render thread is the only consumer of the buffer. A write to the
//! output blocks at device pacing, so the buffer is where latency is bounded.

use bytes::Bytes;
use cpal::traits::{DeviceTrait, StreamTrait};
use crossbeam_channel::{bounded, Receiver};
use parking_lot::{Condvar, Mutex};
use ringbuf::traits::{Consumer as _, Observer as _, Producer as _, Split as _};
use ringbuf::{HeapProd, HeapRb};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::audio::buffer::{Admit, Next, PlaybackBuffer, PlaybackStats};
use crate::audio::device::resolve_output;
use crate::audio::resample::StreamResampler;
use crate::codec::decoder::pcm16_to_samples;
use crate::config::PlaybackConfig;
use crate::error::PlaybackError;

/// Device-side ring size, in milliseconds of audio
const DEVICE_RING_MS: u32 = 200;

/// How long `open` waits for the device thread
const OPEN_TIMEOUT: Duration = Duration::from_secs(3);

/// A speaker-like sink
pub trait AudioOutput: Send + 'static {
    /// Acquire the device for mono samples at `sample_rate`
    fn open(&mut self, sample_rate: u32) -> Result<(), PlaybackError>;

    /// Render samples, blocking at device pacing
    fn write(&mut self, samples: &[f32]) -> Result<(), PlaybackError>;

    /// Release the device; idempotent
    fn close(&mut self);
}

impl AudioOutput for Box<dyn AudioOutput> {
    fn open(&mut self, sample_rate: u32) -> Result<(), PlaybackError> {
        (**self).open(sample_rate)
    }

    fn write(&mut self, samples: &[f32]) -> Result<(), PlaybackError> {
        (**self).write(samples)
    }

    fn close(&mut self) {
        (**self).close()
    }
}

/// cpal-backed speaker
pub struct CpalOutput {
    device_id: Option<String>,
    running: Arc<AtomicBool>,
    thread_handle: Option<JoinHandle<()>>,
    producer: Option<HeapProd<f32>>,
    resampler: Option<StreamResampler>,
    error_rx: Option<Receiver<PlaybackError>>,
    scratch: Vec<f32>,
}

impl CpalOutput {
    pub fn new(device_id: Option<String>) -> Self {
        Self {
            device_id,
            running: Arc::new(AtomicBool::new(false)),
            thread_handle: None,
            producer: None,
            resampler: None,
            error_rx: None,
            scratch: Vec::new(),
        }
    }
}

impl AudioOutput for CpalOutput {
    fn open(&mut self, sample_rate: u32) -> Result<(), PlaybackError> {
        self.close();

        let (ready_tx, ready_rx) = bounded::<Result<(u32, HeapProd<f32>), PlaybackError>>(1);
        let (error_tx, error_rx) = bounded::<PlaybackError>(16);
        let device_id = self.device_id.clone();
        let running = self.running.clone();
        running.store(true, Ordering::SeqCst);

        let handle = thread::Builder::new()
            .name("playback-device".to_string())
            .spawn(move || {
                let opened = (|| -> Result<(cpal::Stream, u32, HeapProd<f32>), PlaybackError> {
                    let device = resolve_output(device_id.as_deref())
                        .map_err(PlaybackError::DeviceUnavailable)?;
                    let supported = device
                        .default_output_config()
                        .map_err(PlaybackError::DeviceUnavailable)?;
                    let channels = supported.channels() as usize;
                    let device_rate = supported.sample_rate().0;
                    let config: cpal::StreamConfig = supported.into();

                    let ring = HeapRb::<f32>::new((device_rate * DEVICE_RING_MS / 1000) as usize);
                    let (producer, mut consumer) = ring.split();

                    let stream = device
                        .into_inner()
                        .build_output_stream(
                            &config,
                            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                                for frame in data.chunks_mut(channels.max(1)) {
                                    let sample = consumer.try_pop().unwrap_or(0.0);
                                    frame.fill(sample);
                                }
                            },
                            move |err| {
                                let _ = error_tx
                                    .try_send(PlaybackError::DeviceUnavailable(err.to_string()));
                            },
                            None,
                        )
                        .map_err(|e| PlaybackError::DeviceUnavailable(e.to_string()))?;
                    stream
                        .play()
                        .map_err(|e| PlaybackError::DeviceUnavailable(e.to_string()))?;
                    Ok((stream, device_rate, producer))
                })();

                let stream = match opened {
                    Ok((stream, rate, producer)) => {
                        let _ = ready_tx.send(Ok((rate, producer)));
                        stream
                    }
                    Err(e) => {
                        running.store(false, Ordering::SeqCst);
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                while running.load(Ordering::Relaxed) {
                    thread::sleep(Duration::from_millis(10));
                }
                drop(stream);
            })
            .map_err(|e| PlaybackError::DeviceUnavailable(e.to_string()))?;
        self.thread_handle = Some(handle);

        match ready_rx.recv_timeout(OPEN_TIMEOUT) {
            Ok(Ok((device_rate, producer))) => {
                self.resampler = Some(
                    StreamResampler::new(sample_rate, device_rate)
                        .map_err(PlaybackError::DeviceUnavailable)?,
                );
                self.producer = Some(producer);
                self.error_rx = Some(error_rx);
                tracing::info!(
                    "Speaker opened: {} Hz stream on {} Hz device",
                    sample_rate,
                    device_rate
                );
                Ok(())
            }
            Ok(Err(e)) => {
                self.close();
                Err(e)
            }
            Err(_) => {
                self.close();
                Err(PlaybackError::DeviceUnavailable(
                    "speaker did not open in time".to_string(),
                ))
            }
        }
    }

    fn write(&mut self, samples: &[f32]) -> Result<(), PlaybackError> {
        if let Some(err) = self.error_rx.as_ref().and_then(|rx| rx.try_recv().ok()) {
            return Err(err);
        }
        let (Some(producer), Some(resampler)) = (self.producer.as_mut(), self.resampler.as_mut())
        else {
            return Err(PlaybackError::DeviceUnavailable("speaker not open".to_string()));
        };

        self.scratch.clear();
        resampler.process(samples, &mut self.scratch);

        let mut offset = 0;
        while offset < self.scratch.len() {
            if !self.running.load(Ordering::Relaxed) {
                return Err(PlaybackError::DeviceUnavailable("speaker stopped".to_string()));
            }
            offset += producer.push_slice(&self.scratch[offset..]);
            if offset < self.scratch.len() && producer.is_full() {
                thread::sleep(Duration::from_millis(5));
            }
        }
        Ok(())
    }

    fn close(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
        self.producer = None;
        self.resampler = None;
        self.error_rx = None;
    }
}

impl Drop for CpalOutput {
    fn drop(&mut self) {
        self.close();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Running,
    /// Render what is buffered, up to the deadline
    Draining { deadline: Instant },
    Halt,
}

struct Shared {
    buffer: Mutex<PlaybackBuffer>,
    mode: Mutex<Mode>,
    wake: Condvar,
}

impl Shared {
    fn notify(&self) {
        // Taking the mode lock orders the wakeup after the render thread's check
        let _mode = self.mode.lock();
        self.wake.notify_all();
    }
}

/// Cloneable producer side of the playback engine
#[derive(Clone)]
pub struct PlaybackHandle {
    shared: Arc<Shared>,
}

impl PlaybackHandle {
    /// Admit a reply chunk; never blocks on the device
    pub fn enqueue(&self, pcm: Bytes, seq: u64) -> Admit {
        let admit = self.shared.buffer.lock().push(seq, pcm);
        match admit {
            Admit::Queued { evicted } if evicted > 0 => {
                tracing::debug!("Playback window full, evicted {} chunk(s)", evicted);
            }
            Admit::Stale => tracing::trace!("Dropped stale reply chunk {}", seq),
            Admit::Duplicate => tracing::trace!("Dropped duplicate reply chunk {}", seq),
            _ => {}
        }
        self.shared.notify();
        admit
    }

    /// Discard everything not yet rendered
    pub fn clear(&self) -> usize {
        let dropped = self.shared.buffer.lock().clear();
        if dropped > 0 {
            tracing::debug!("Cleared {} pending reply chunk(s)", dropped);
        }
        dropped
    }

    pub fn buffered(&self) -> Duration {
        self.shared.buffer.lock().buffered()
    }

    pub fn stats(&self) -> PlaybackStats {
        self.shared.buffer.lock().stats()
    }
}

/// Owns the render thread and the output device
pub struct PlaybackEngine {
    shared: Arc<Shared>,
    thread_handle: Option<JoinHandle<()>>,
}

impl PlaybackEngine {
    /// Open `output` and start rendering; device failures go to `on_fault`
    pub fn start<O, F>(
        mut output: O,
        config: &PlaybackConfig,
        on_fault: F,
    ) -> Result<Self, PlaybackError>
    where
        O: AudioOutput,
        F: Fn(PlaybackError) + Send + 'static,
    {
        output.open(config.sample_rate)?;

        let shared = Arc::new(Shared {
            buffer: Mutex::new(PlaybackBuffer::new(
                config.window(),
                config.gap_timeout(),
                config.sample_rate,
            )),
            mode: Mutex::new(Mode::Running),
            wake: Condvar::new(),
        });

        let render_shared = shared.clone();
        let handle = thread::Builder::new()
            .name("playback-render".to_string())
            .spawn(move || render_loop(render_shared, output, on_fault))
            .map_err(|e| PlaybackError::DeviceUnavailable(e.to_string()))?;

        Ok(Self {
            shared,
            thread_handle: Some(handle),
        })
    }

    pub fn handle(&self) -> PlaybackHandle {
        PlaybackHandle {
            shared: self.shared.clone(),
        }
    }

    /// Stop rendering, first playing out up to `flush` of buffered audio
    pub fn stop(mut self, flush: Duration) -> PlaybackStats {
        {
            let mut mode = self.shared.mode.lock();
            *mode = if flush.is_zero() {
                Mode::Halt
            } else {
                Mode::Draining {
                    deadline: Instant::now() + flush,
                }
            };
            self.shared.wake.notify_all();
        }
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
        self.shared.buffer.lock().stats()
    }
}

impl Drop for PlaybackEngine {
    fn drop(&mut self) {
        if self.thread_handle.is_some() {
            *self.shared.mode.lock() = Mode::Halt;
            self.shared.wake.notify_all();
            // The thread exits on its own once the current write returns
            self.thread_handle.take();
        }
    }
}

fn render_loop<O, F>(shared: Arc<Shared>, mut output: O, on_fault: F)
where
    O: AudioOutput,
    F: Fn(PlaybackError),
{
    loop {
        let mode = *shared.mode.lock();
        if mode == Mode::Halt {
            break;
        }
        if let Mode::Draining { deadline } = mode {
            if Instant::now() >= deadline {
                break;
            }
        }

        let next = shared.buffer.lock().pop(Instant::now());
        match next {
            Next::Chunk(chunk) => {
                let samples = pcm16_to_samples(&chunk.pcm);
                if let Err(e) = output.write(&samples) {
                    tracing::error!("Playback failed: {}", e);
                    on_fault(e);
                    break;
                }
            }
            Next::Wait(remaining) => {
                let mut guard = shared.mode.lock();
                if *guard != Mode::Halt {
                    shared.wake.wait_for(&mut guard, remaining);
                }
            }
            Next::Empty => {
                let mut guard = shared.mode.lock();
                match *guard {
                    Mode::Halt | Mode::Draining { .. } => break,
                    Mode::Running => {
                        // Recheck under the mode lock so an enqueue cannot slip past
                        if shared.buffer.lock().is_empty() {
                            shared.wake.wait_for(&mut guard, Duration::from_millis(50));
                        }
                    }
                }
            }
        }
    }

    output.close();
    tracing::debug!("Playback render thread exited");
}
