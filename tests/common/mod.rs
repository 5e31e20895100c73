//! Shared test fixtures: in-memory devices and a scripted remote service

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::SinkExt;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::{CancellationToken, PollSender};

use live_assistant::audio::{AudioInput, AudioOutput, CaptureEvent};
use live_assistant::config::{
    AppConfig, CaptureConfig, Credential, PlaybackConfig, ScreenConfig, SessionTimings,
    TransportConfig,
};
use live_assistant::error::{CaptureError, ConnectError, PlaybackError, TransportFault};
use live_assistant::network::{CloseReason, Connector, LinkEvent, LinkSink, LinkStream};
use live_assistant::protocol::{ControlKind, Envelope, MediaKind};
use live_assistant::screen::{ScreenGrabber, ScreenImage};
use live_assistant::session::MediaDevices;

/// Short timings so scenarios finish quickly
pub fn test_config() -> AppConfig {
    AppConfig {
        capture: CaptureConfig {
            device_id: None,
            sample_rate: 16_000,
            chunk_ms: 20,
        },
        screen: ScreenConfig {
            enabled: true,
            interval_ms: 50,
            max_dimension: 16,
            jpeg_quality: 60,
            dedup: true,
        },
        playback: PlaybackConfig {
            sample_rate: 16_000,
            window_ms: 500,
            gap_timeout_ms: 10,
            ..PlaybackConfig::default()
        },
        transport: TransportConfig {
            credential: Some(Credential::new("test-key")),
            outbound_capacity: 32,
            connect_timeout_ms: 300,
            idle_timeout_ms: 400,
            heartbeat_ms: 50,
            ..TransportConfig::default()
        },
        session: SessionTimings {
            start_timeout_ms: 1_000,
            flush_ms: 100,
            force_close_ms: 1_000,
            reconnect_attempts: 2,
            reconnect_initial_ms: 10,
            reconnect_max_ms: 20,
        },
        ..AppConfig::default()
    }
}

/// Acquire/release bookkeeping across every device a test created
#[derive(Debug, Default)]
pub struct DeviceLedger {
    pub mic_started: AtomicUsize,
    pub mic_stopped: AtomicUsize,
    pub output_opened: AtomicUsize,
    pub output_closed: AtomicUsize,
    pub screen_opened: AtomicUsize,
    pub screen_closed: AtomicUsize,
}

impl DeviceLedger {
    /// Every acquired device has been released
    pub fn all_released(&self) -> bool {
        self.mic_started.load(Ordering::SeqCst) == self.mic_stopped.load(Ordering::SeqCst)
            && self.output_opened.load(Ordering::SeqCst)
                == self.output_closed.load(Ordering::SeqCst)
            && self.screen_opened.load(Ordering::SeqCst)
                == self.screen_closed.load(Ordering::SeqCst)
    }

    pub fn starts(&self) -> usize {
        self.mic_started.load(Ordering::SeqCst)
    }
}

pub struct StubDevices {
    pub ledger: Arc<DeviceLedger>,
    pub deny_microphone: AtomicBool,
    pub with_screen: bool,
}

impl StubDevices {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            ledger: Arc::new(DeviceLedger::default()),
            deny_microphone: AtomicBool::new(false),
            with_screen: true,
        })
    }

    pub fn audio_only() -> Arc<Self> {
        Arc::new(Self {
            ledger: Arc::new(DeviceLedger::default()),
            deny_microphone: AtomicBool::new(false),
            with_screen: false,
        })
    }
}

impl MediaDevices for StubDevices {
    fn audio_input(&self, _config: &CaptureConfig) -> Box<dyn AudioInput> {
        Box::new(StubMicrophone {
            ledger: self.ledger.clone(),
            deny: self.deny_microphone.load(Ordering::SeqCst),
            running: Arc::new(AtomicBool::new(false)),
            thread_handle: None,
        })
    }

    fn audio_output(&self, _config: &PlaybackConfig) -> Box<dyn AudioOutput> {
        Box::new(StubSpeaker {
            ledger: self.ledger.clone(),
            sample_rate: 0,
            open: false,
        })
    }

    fn screen(&self, _config: &ScreenConfig) -> Option<Box<dyn ScreenGrabber>> {
        self.with_screen.then(|| {
            Box::new(StubScreen {
                ledger: self.ledger.clone(),
                open: false,
                frame: 0,
            }) as Box<dyn ScreenGrabber>
        })
    }
}

/// Emits 10 ms of a quiet tone every 10 ms
pub struct StubMicrophone {
    ledger: Arc<DeviceLedger>,
    deny: bool,
    running: Arc<AtomicBool>,
    thread_handle: Option<JoinHandle<()>>,
}

impl AudioInput for StubMicrophone {
    fn start(&mut self, sample_rate: u32) -> Result<mpsc::Receiver<CaptureEvent>, CaptureError> {
        if self.deny {
            return Err(CaptureError::PermissionDenied("microphone blocked".into()));
        }
        let (tx, rx) = mpsc::channel(64);
        let running = self.running.clone();
        running.store(true, Ordering::SeqCst);
        self.ledger.mic_started.fetch_add(1, Ordering::SeqCst);

        let batch = (sample_rate / 100) as usize;
        self.thread_handle = Some(thread::spawn(move || {
            while running.load(Ordering::SeqCst) {
                let _ = tx.try_send(CaptureEvent::Samples(vec![0.1; batch]));
                thread::sleep(Duration::from_millis(10));
            }
        }));
        Ok(rx)
    }

    fn stop(&mut self) {
        if self.running.swap(false, Ordering::SeqCst) {
            self.ledger.mic_stopped.fetch_add(1, Ordering::SeqCst);
        }
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for StubMicrophone {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Paces writes like a real device
pub struct StubSpeaker {
    ledger: Arc<DeviceLedger>,
    sample_rate: u32,
    open: bool,
}

impl AudioOutput for StubSpeaker {
    fn open(&mut self, sample_rate: u32) -> Result<(), PlaybackError> {
        self.sample_rate = sample_rate.max(1);
        self.open = true;
        self.ledger.output_opened.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn write(&mut self, samples: &[f32]) -> Result<(), PlaybackError> {
        let micros = samples.len() as u64 * 1_000_000 / self.sample_rate as u64;
        thread::sleep(Duration::from_micros(micros));
        Ok(())
    }

    fn close(&mut self) {
        if self.open {
            self.open = false;
            self.ledger.output_closed.fetch_add(1, Ordering::SeqCst);
        }
    }
}

impl Drop for StubSpeaker {
    fn drop(&mut self) {
        self.close();
    }
}

/// 8x8 frames whose content changes every grab
pub struct StubScreen {
    ledger: Arc<DeviceLedger>,
    open: bool,
    frame: u8,
}

impl ScreenGrabber for StubScreen {
    fn open(&mut self) -> Result<(), CaptureError> {
        self.open = true;
        self.ledger.screen_opened.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn grab(&mut self) -> Result<ScreenImage, CaptureError> {
        self.frame = self.frame.wrapping_add(1);
        Ok(ScreenImage {
            rgba: Bytes::from(vec![self.frame; 8 * 8 * 4]),
            width: 8,
            height: 8,
        })
    }

    fn close(&mut self) {
        if self.open {
            self.open = false;
            self.ledger.screen_closed.fetch_add(1, Ordering::SeqCst);
        }
    }
}

impl Drop for StubScreen {
    fn drop(&mut self) {
        self.close();
    }
}

/// Scripted remote: completes setup, echoes audio, answers heartbeats
#[derive(Default)]
pub struct StubRemote {
    /// Media frames received, in arrival order
    pub received: Arc<Mutex<Vec<(MediaKind, u64)>>>,
    pub opened: AtomicUsize,
    /// Refuse this many upcoming connects with a network error
    pub fail_next: AtomicUsize,
    pub reject_credential: AtomicBool,
    /// Keep the link open but stop answering anything
    silent: Arc<AtomicBool>,
    link: Mutex<Option<CancellationToken>>,
}

impl StubRemote {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Drop the current link as if the network went away
    pub fn kill_link(&self) {
        if let Some(link) = self.link.lock().take() {
            link.cancel();
        }
    }

    /// Stop replying, heartbeats included, without closing the link
    pub fn go_silent(&self) {
        self.silent.store(true, Ordering::SeqCst);
    }

    pub fn received_of(&self, kind: MediaKind) -> Vec<u64> {
        self.received
            .lock()
            .iter()
            .filter(|(k, _)| *k == kind)
            .map(|(_, seq)| *seq)
            .collect()
    }
}

#[async_trait]
impl Connector for StubRemote {
    async fn open(&self, _config: &TransportConfig) -> Result<(LinkSink, LinkStream), ConnectError> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        let refused = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(ConnectError::Network("connection refused".into()));
        }

        let (client_tx, mut remote_rx) = mpsc::channel::<LinkEvent>(64);
        let (remote_tx, client_rx) = mpsc::channel::<Result<LinkEvent, TransportFault>>(64);
        let reject = self.reject_credential.load(Ordering::SeqCst);
        let received = self.received.clone();
        let silent = self.silent.clone();
        let link = CancellationToken::new();
        *self.link.lock() = Some(link.clone());

        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = link.cancelled() => break,
                    event = remote_rx.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };
                if silent.load(Ordering::SeqCst) {
                    continue;
                }
                let reply = match event {
                    LinkEvent::Frame(text) => match Envelope::from_text(&text) {
                        Ok(Envelope::Setup(_)) if reject => {
                            LinkEvent::Close(CloseReason::Unauthorized("invalid key".into()))
                        }
                        Ok(Envelope::Setup(_)) => match Envelope::control(ControlKind::SetupComplete).to_text() {
                            Ok(text) => LinkEvent::Frame(text),
                            Err(_) => break,
                        },
                        Ok(Envelope::Media(body)) => {
                            received.lock().push((body.kind, body.seq));
                            if body.kind != MediaKind::Audio {
                                continue;
                            }
                            LinkEvent::Frame(text)
                        }
                        _ => continue,
                    },
                    LinkEvent::Heartbeat => LinkEvent::Heartbeat,
                    LinkEvent::Close(_) => break,
                };
                if remote_tx.send(Ok(reply)).await.is_err() {
                    break;
                }
            }
        });

        let sink: LinkSink = Box::pin(
            PollSender::new(client_tx).sink_map_err(|_| TransportFault::Dropped("remote gone".into())),
        );
        let stream: LinkStream = Box::pin(ReceiverStream::new(client_rx));
        Ok((sink, stream))
    }
}

/// Poll `check` every 10 ms for up to `within`
pub async fn eventually(within: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
