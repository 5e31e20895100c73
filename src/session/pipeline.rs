//! Per-session task set
//!
//! One [`Pipeline`] exists per session. It holds the devices and the tasks that
//! move media between them and the transport:
//!
//! ```text
//!  mic ──► audio producer ──┐
//!                           ├──► OutboundSender ──► TransportClient
//!  screen ──► screen producer┘
//!
//!  TransportClient ──► Inbound ──► dispatcher ──► PlaybackHandle
//!                                      └──► SessionEvent (faults, control)
//! ```
//!
//! Devices are acquired playback first, then microphone, then screen, and all
//! of them are released on every exit path, including drop.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::audio::{AudioInput, CaptureEvent, Chunker, PlaybackEngine, PlaybackHandle};
use crate::codec::FrameEncoder;
use crate::config::AppConfig;
use crate::error::{CaptureError, PlaybackError, SessionFault, TransportFault};
use crate::network::{Inbound, OutboundSender, ReconnectPolicy, TransportClient};
use crate::protocol::{ControlKind, MediaFrame, MediaKind, ReplyFrame, WireMessage};
use crate::screen::{FrameDedup, ScreenGrabber};
use crate::session::devices::MediaDevices;

/// How long a finished-but-slow task gets before it is aborted
const TASK_GRACE: Duration = Duration::from_millis(250);

/// Per-kind wire sequence counters, shared across sessions
#[derive(Debug, Default)]
pub struct SequenceCounters {
    audio: AtomicU64,
    screen: AtomicU64,
}

impl SequenceCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next sequence number for `kind`, starting at 1
    pub fn next(&self, kind: MediaKind) -> u64 {
        let counter = match kind {
            MediaKind::Audio => &self.audio,
            MediaKind::Screen => &self.screen,
        };
        counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Last number handed out for `kind`
    pub fn last(&self, kind: MediaKind) -> u64 {
        match kind {
            MediaKind::Audio => self.audio.load(Ordering::Relaxed),
            MediaKind::Screen => self.screen.load(Ordering::Relaxed),
        }
    }
}

/// Something the controller must hear about
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEventKind {
    Fault(SessionFault),
    Control(ControlKind),
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionEvent {
    pub session: Uuid,
    pub kind: SessionEventKind,
}

/// Everything a pipeline needs from the controller
#[derive(Clone)]
pub struct PipelineContext {
    pub session: Uuid,
    pub config: Arc<AppConfig>,
    pub devices: Arc<dyn MediaDevices>,
    pub counters: Arc<SequenceCounters>,
    pub events: mpsc::UnboundedSender<SessionEvent>,
}

impl PipelineContext {
    fn report(&self, fault: SessionFault) {
        let _ = self.events.send(SessionEvent {
            session: self.session,
            kind: SessionEventKind::Fault(fault),
        });
    }
}

/// Screen handle plus the per-session dedup and encoder state
struct ScreenWorker {
    grabber: Box<dyn ScreenGrabber>,
    dedup: Option<FrameDedup>,
    encoder: FrameEncoder,
}

/// Tasks aborted on drop
#[derive(Default)]
struct TaskSet {
    tasks: Vec<JoinHandle<()>>,
}

impl TaskSet {
    fn push(&mut self, task: JoinHandle<()>) {
        self.tasks.push(task);
    }

    /// Wait for every task, aborting those still running after the grace
    async fn join(&mut self, grace: Duration) {
        for task in self.tasks.drain(..) {
            let abort = task.abort_handle();
            if tokio::time::timeout(grace, task).await.is_err() {
                abort.abort();
            }
        }
    }
}

impl Drop for TaskSet {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

pub struct Pipeline {
    session: Uuid,
    cancel: CancellationToken,
    playback: Option<PlaybackEngine>,
    mic: Option<Box<dyn AudioInput>>,
    screen: Option<Arc<Mutex<ScreenWorker>>>,
    producers: TaskSet,
    dispatcher: TaskSet,
}

impl Pipeline {
    fn empty(session: Uuid) -> Self {
        Self {
            session,
            cancel: CancellationToken::new(),
            playback: None,
            mic: None,
            screen: None,
            producers: TaskSet::default(),
            dispatcher: TaskSet::default(),
        }
    }

    /// Acquire devices, connect, and start every task
    ///
    /// With a `reconnect` policy the connection is retried with backoff.
    /// On error everything acquired so far is released before returning.
    pub async fn start(
        ctx: PipelineContext,
        transport: &mut TransportClient,
        reconnect: Option<ReconnectPolicy>,
    ) -> Result<Self, SessionFault> {
        let mut pipeline = Self::empty(ctx.session);
        match pipeline.acquire(&ctx, transport, reconnect).await {
            Ok(()) => Ok(pipeline),
            Err(fault) => {
                transport.abort();
                pipeline.release_devices().await;
                Err(fault)
            }
        }
    }

    async fn acquire(
        &mut self,
        ctx: &PipelineContext,
        transport: &mut TransportClient,
        reconnect: Option<ReconnectPolicy>,
    ) -> Result<(), SessionFault> {
        let config = ctx.config.clone();

        // Playback
        let output = ctx.devices.audio_output(&config.playback);
        let playback_config = config.playback.clone();
        let fault_ctx = ctx.clone();
        let engine = tokio::task::spawn_blocking(move || {
            PlaybackEngine::start(output, &playback_config, move |e: PlaybackError| {
                fault_ctx.report(SessionFault::Playback(e));
            })
        })
        .await
        .map_err(|e| PlaybackError::DeviceUnavailable(e.to_string()))??;
        let playback = engine.handle();
        self.playback = Some(engine);

        // Microphone
        let mut mic = ctx.devices.audio_input(&config.capture);
        let sample_rate = config.capture.sample_rate;
        let (mic, started) = tokio::task::spawn_blocking(move || {
            let started = mic.start(sample_rate);
            (mic, started)
        })
        .await
        .map_err(|e| CaptureError::DeviceUnavailable(e.to_string()))?;
        self.mic = Some(mic);
        let capture_rx = started?;

        // Screen
        if let Some(mut grabber) = ctx.devices.screen(&config.screen) {
            let (grabber, opened) = tokio::task::spawn_blocking(move || {
                let opened = grabber.open();
                (grabber, opened)
            })
            .await
            .map_err(|e| CaptureError::DeviceUnavailable(e.to_string()))?;
            self.screen = Some(Arc::new(Mutex::new(ScreenWorker {
                grabber,
                dedup: config.screen.dedup.then(FrameDedup::new),
                encoder: FrameEncoder::from_config(&config.screen),
            })));
            opened?;
        }

        // Connection
        let inbound = match reconnect {
            Some(policy) => transport.reconnect(ctx.session, &policy).await?,
            None => transport.connect(ctx.session).await?,
        };
        let sender = transport.sender().map_err(|e| {
            SessionFault::Transport(TransportFault::Dropped(e.to_string()))
        })?;

        self.producers.push(tokio::spawn(audio_producer(
            ctx.clone(),
            capture_rx,
            sender.clone(),
            self.cancel.clone(),
        )));
        if let Some(worker) = self.screen.clone() {
            self.producers.push(tokio::spawn(screen_producer(
                ctx.clone(),
                worker,
                sender,
                self.cancel.clone(),
            )));
        }
        self.dispatcher
            .push(tokio::spawn(dispatch(ctx.clone(), inbound, playback)));

        tracing::info!("Session {} pipeline running", ctx.session);
        Ok(())
    }

    /// Graceful stop: capture first, then drain outbound audio and buffered
    /// playback for up to `flush` each (concurrently), then release everything
    pub async fn stop(mut self, transport: &mut TransportClient, flush: Duration) {
        self.cancel.cancel();
        self.producers.join(TASK_GRACE).await;
        self.release_capture().await;

        let playback = self.playback.take();
        let drain_playback = async move {
            if let Some(engine) = playback {
                let stats = tokio::task::spawn_blocking(move || engine.stop(flush)).await;
                if let Ok(stats) = stats {
                    tracing::debug!(
                        "Playback stopped: {} rendered, {} evicted, {} stale, {} skipped",
                        stats.rendered,
                        stats.evicted,
                        stats.stale,
                        stats.skipped
                    );
                }
            }
        };
        tokio::join!(transport.close(flush), drain_playback);

        self.dispatcher.join(TASK_GRACE).await;
        tracing::info!("Session {} pipeline stopped", self.session);
    }

    async fn release_capture(&mut self) {
        if let Some(mut mic) = self.mic.take() {
            let _ = tokio::task::spawn_blocking(move || mic.stop()).await;
        }
        if let Some(worker) = self.screen.take() {
            let _ = tokio::task::spawn_blocking(move || worker.lock().grabber.close()).await;
        }
    }

    async fn release_devices(&mut self) {
        self.cancel.cancel();
        self.release_capture().await;
        if let Some(engine) = self.playback.take() {
            let _ = tokio::task::spawn_blocking(move || engine.stop(Duration::ZERO)).await;
        }
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        // Reached when a start or stop was cut short
        self.cancel.cancel();
        let mic = self.mic.take();
        let screen = self.screen.take();
        let playback = self.playback.take();
        if mic.is_none() && screen.is_none() && playback.is_none() {
            return;
        }

        let release = move || {
            if let Some(mut mic) = mic {
                mic.stop();
            }
            if let Some(worker) = screen {
                worker.lock().grabber.close();
            }
            if let Some(engine) = playback {
                engine.stop(Duration::ZERO);
            }
        };
        // Releasing joins device threads; keep that off the async workers
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn_blocking(release);
            }
            Err(_) => release(),
        }
    }
}

async fn audio_producer(
    ctx: PipelineContext,
    mut capture: mpsc::Receiver<CaptureEvent>,
    sender: OutboundSender,
    cancel: CancellationToken,
) {
    let capture_config = &ctx.config.capture;
    let mut chunker = Chunker::new(capture_config.samples_per_chunk());
    let mut encoder = FrameEncoder::from_config(&ctx.config.screen);

    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            event = capture.recv() => event,
        };

        match event {
            Some(CaptureEvent::Samples(samples)) => {
                for pcm in chunker.push(&samples) {
                    let frame = MediaFrame::Audio {
                        pcm,
                        sample_rate: capture_config.sample_rate,
                        seq: ctx.counters.next(MediaKind::Audio),
                    };
                    match encoder.encode(frame, ctx.session) {
                        Ok(msg) => {
                            if sender.send(msg).is_err() {
                                // The transport reports its own fault
                                return;
                            }
                        }
                        Err(e) => {
                            ctx.report(SessionFault::Capture(e));
                            return;
                        }
                    }
                }
            }
            Some(CaptureEvent::Fault(e)) => {
                tracing::error!("Microphone failed: {}", e);
                ctx.report(SessionFault::Capture(e));
                return;
            }
            None => {
                if !cancel.is_cancelled() {
                    ctx.report(SessionFault::Capture(CaptureError::DeviceUnavailable(
                        "microphone stream ended".to_string(),
                    )));
                }
                return;
            }
        }
    }
    tracing::debug!("Audio producer stopped, {} sample(s) unsent", chunker.pending());
}

async fn screen_producer(
    ctx: PipelineContext,
    worker: Arc<Mutex<ScreenWorker>>,
    sender: OutboundSender,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(ctx.config.screen.interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let worker = worker.clone();
        let counters = ctx.counters.clone();
        let session = ctx.session;
        let grabbed = tokio::task::spawn_blocking(move || -> Result<Option<WireMessage>, CaptureError> {
            let mut worker = worker.lock();
            let image = worker.grabber.grab()?;
            if let Some(dedup) = worker.dedup.as_mut() {
                if !dedup.is_new(&image) {
                    return Ok(None);
                }
            }
            // Numbered only once it is known to be sent
            let frame = MediaFrame::Screen {
                image: image.rgba,
                width: image.width,
                height: image.height,
                seq: counters.next(MediaKind::Screen),
            };
            worker.encoder.encode(frame, session).map(Some)
        })
        .await;

        if cancel.is_cancelled() {
            break;
        }
        match grabbed {
            Ok(Ok(Some(msg))) => {
                if sender.send(msg).is_err() {
                    return;
                }
            }
            Ok(Ok(None)) => tracing::trace!("Screen unchanged, skipped"),
            Ok(Err(e)) => {
                tracing::error!("Screen capture failed: {}", e);
                ctx.report(SessionFault::Capture(e));
                return;
            }
            Err(e) => {
                ctx.report(SessionFault::Capture(CaptureError::DeviceUnavailable(
                    e.to_string(),
                )));
                return;
            }
        }
    }
    tracing::debug!("Screen producer stopped");
}

async fn dispatch(ctx: PipelineContext, mut inbound: Inbound, playback: PlaybackHandle) {
    while let Some(item) = inbound.next().await {
        match item {
            Ok(ReplyFrame::AudioChunk { pcm, seq }) => {
                playback.enqueue(pcm, seq);
            }
            Ok(ReplyFrame::ControlSignal { kind }) => {
                match kind {
                    ControlKind::Interrupted => {
                        let dropped = playback.clear();
                        tracing::info!("Reply interrupted, dropped {} pending chunk(s)", dropped);
                    }
                    ControlKind::TurnComplete => tracing::debug!("Turn complete"),
                    ControlKind::GoAway => {
                        ctx.report(SessionFault::Transport(TransportFault::Dropped(
                            "remote announced go_away".to_string(),
                        )));
                        return;
                    }
                    ControlKind::SetupComplete => {}
                }
                let _ = ctx.events.send(SessionEvent {
                    session: ctx.session,
                    kind: SessionEventKind::Control(kind),
                });
            }
            Err(fault) => {
                ctx.report(SessionFault::Transport(fault));
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[test]
    fn test_counters_are_per_kind() {
        let counters = SequenceCounters::new();
        assert_eq!(counters.next(MediaKind::Audio), 1);
        assert_eq!(counters.next(MediaKind::Audio), 2);
        assert_eq!(counters.next(MediaKind::Screen), 1);
        assert_eq!(counters.last(MediaKind::Audio), 2);
    }

    /// Microphone whose release takes a while
    struct SlowMicrophone {
        stopped: Arc<AtomicBool>,
    }

    impl AudioInput for SlowMicrophone {
        fn start(&mut self, _sample_rate: u32) -> Result<mpsc::Receiver<CaptureEvent>, CaptureError> {
            Err(CaptureError::DeviceUnavailable("not used".into()))
        }

        fn stop(&mut self) {
            std::thread::sleep(Duration::from_millis(300));
            self.stopped.store(true, Ordering::SeqCst);
        }
    }

    fn pipeline_holding_mic(stopped: Arc<AtomicBool>) -> Pipeline {
        let mut pipeline = Pipeline::empty(Uuid::nil());
        pipeline.mic = Some(Box::new(SlowMicrophone { stopped }));
        pipeline
    }

    #[tokio::test]
    async fn test_drop_releases_off_the_runtime() {
        let stopped = Arc::new(AtomicBool::new(false));
        let pipeline = pipeline_holding_mic(stopped.clone());

        let started = std::time::Instant::now();
        drop(pipeline);
        assert!(started.elapsed() < Duration::from_millis(150));

        let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
        while !stopped.load(Ordering::SeqCst) && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(stopped.load(Ordering::SeqCst));
    }

    #[test]
    fn test_drop_without_runtime_releases_inline() {
        let stopped = Arc::new(AtomicBool::new(false));
        drop(pipeline_holding_mic(stopped.clone()));
        assert!(stopped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_task_set_aborts_stragglers() {
        let mut tasks = TaskSet::default();
        tasks.push(tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(60)).await;
        }));
        let started = std::time::Instant::now();
        tasks.join(Duration::from_millis(20)).await;
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(tasks.tasks.is_empty());
    }
}
