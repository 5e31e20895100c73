//! Session controller actor
//!
//! A single task owns the session lifecycle and is the only writer of
//! [`SessionState`]. Everything else talks to it through [`SessionHandle`],
//! which only enqueues commands and therefore never blocks.
//!
//! ```text
//!  Idle ──toggle──► Starting ──ok──► Active ──toggle──► Stopping ──► Idle
//!                      │                │
//!                      └──fail──► Faulted ◄──fault──┘
//!  Faulted ──toggle──► Starting (with reconnect backoff)
//! ```
//!
//! While a transition runs, presses are absorbed into at most one pending
//! target which is applied once the transition has finished.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::timeout;
use uuid::Uuid;

use crate::config::AppConfig;
use crate::error::SessionFault;
use crate::network::{Connector, ReconnectPolicy, TransportClient};
use crate::session::devices::MediaDevices;
use crate::session::pipeline::{
    Pipeline, PipelineContext, SequenceCounters, SessionEvent, SessionEventKind,
};
use crate::session::state::{SessionState, StateBus};
use crate::session::toggle::{ToggleEvent, ToggleSink};

enum Command {
    Toggle(ToggleEvent),
    Stop,
    Shutdown(oneshot::Sender<()>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Target {
    On,
    Off,
}

/// What a press means while a transition is in flight
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Starting,
    Stopping,
    FaultTeardown,
}

impl Phase {
    fn toggle_target(self) -> Target {
        match self {
            Phase::Starting | Phase::FaultTeardown => Target::Off,
            Phase::Stopping => Target::On,
        }
    }
}

#[derive(Default)]
struct Pending {
    target: Option<Target>,
    shutdown: Option<oneshot::Sender<()>>,
}

impl Pending {
    fn absorb(&mut self, command: Command, phase: Phase) {
        match command {
            Command::Toggle(event) => {
                if self.target.is_some() {
                    tracing::debug!(
                        "Toggle at {} ignored, one is already pending",
                        event.timestamp
                    );
                } else {
                    tracing::debug!("Toggle at {} queued during {:?}", event.timestamp, phase);
                    self.target = Some(phase.toggle_target());
                }
            }
            Command::Stop => self.target = Some(Target::Off),
            Command::Shutdown(ack) => {
                self.target = Some(Target::Off);
                self.shutdown = Some(ack);
            }
        }
    }
}

/// Poll `transition` to completion while absorbing incoming commands
async fn drive<F: Future>(
    commands: &mut mpsc::UnboundedReceiver<Command>,
    pending: &mut Pending,
    phase: Phase,
    transition: F,
) -> F::Output {
    let mut transition = std::pin::pin!(transition);
    let mut open = true;
    loop {
        tokio::select! {
            biased;
            output = &mut transition => return output,
            command = commands.recv(), if open => match command {
                Some(command) => pending.absorb(command, phase),
                None => open = false,
            },
        }
    }
}

enum Wake {
    Command(Option<Command>),
    Event(SessionEvent),
}

/// Entry point: builds the actor and returns its handle
pub struct SessionController {
    config: Arc<AppConfig>,
    devices: Arc<dyn MediaDevices>,
    transport: TransportClient,
    counters: Arc<SequenceCounters>,
    bus: Arc<StateBus>,
    last_fault: Arc<Mutex<Option<SessionFault>>>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    events_rx: mpsc::UnboundedReceiver<SessionEvent>,
    live: Option<Pipeline>,
    session: Option<Uuid>,
    state: SessionState,
}

impl SessionController {
    /// Spawn the controller on the current tokio runtime
    pub fn spawn(
        config: Arc<AppConfig>,
        devices: Arc<dyn MediaDevices>,
        connector: Arc<dyn Connector>,
    ) -> SessionHandle {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let bus = Arc::new(StateBus::new(SessionState::Idle));
        let last_fault = Arc::new(Mutex::new(None));

        let controller = SessionController {
            transport: TransportClient::new(connector, config.transport.clone()),
            config,
            devices,
            counters: Arc::new(SequenceCounters::new()),
            bus: bus.clone(),
            last_fault: last_fault.clone(),
            events_tx,
            events_rx,
            live: None,
            session: None,
            state: SessionState::Idle,
        };
        tokio::spawn(controller.run(commands_rx));

        SessionHandle {
            commands: commands_tx,
            bus,
            last_fault,
        }
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        tracing::info!("Session controller running");
        let mut pending = Pending::default();

        loop {
            if let Some(ack) = pending.shutdown.take() {
                self.shutdown().await;
                let _ = ack.send(());
                return;
            }
            if let Some(target) = pending.target.take() {
                self.apply(target, &mut commands, &mut pending).await;
                continue;
            }

            let wake = tokio::select! {
                command = commands.recv() => Wake::Command(command),
                Some(event) = self.events_rx.recv() => Wake::Event(event),
            };

            match wake {
                Wake::Command(Some(Command::Toggle(event))) => {
                    tracing::debug!("Toggle at {} while {}", event.timestamp, self.state);
                    pending.target = Some(if self.state == SessionState::Active {
                        Target::Off
                    } else {
                        Target::On
                    });
                }
                Wake::Command(Some(Command::Stop)) => pending.target = Some(Target::Off),
                Wake::Command(Some(Command::Shutdown(ack))) => pending.shutdown = Some(ack),
                Wake::Command(None) => {
                    // Every handle is gone
                    self.shutdown().await;
                    return;
                }
                Wake::Event(event) => self.on_event(event, &mut commands, &mut pending).await,
            }
        }
    }

    async fn apply(
        &mut self,
        target: Target,
        commands: &mut mpsc::UnboundedReceiver<Command>,
        pending: &mut Pending,
    ) {
        match (target, self.state) {
            (Target::On, SessionState::Idle) => self.start(false, commands, pending).await,
            (Target::On, SessionState::Faulted) => self.start(true, commands, pending).await,
            (Target::Off, SessionState::Active) => self.stop(commands, pending).await,
            (Target::Off, SessionState::Faulted) => self.set_state(SessionState::Idle),
            (target, state) => tracing::debug!("{:?} while {} is a no-op", target, state),
        }
    }

    async fn start(
        &mut self,
        reconnect: bool,
        commands: &mut mpsc::UnboundedReceiver<Command>,
        pending: &mut Pending,
    ) {
        let session = Uuid::new_v4();
        self.session = Some(session);
        self.set_state(SessionState::Starting);

        let timings = &self.config.session;
        let policy = reconnect.then(|| ReconnectPolicy::from(timings));
        let budget = match policy {
            Some(policy) => policy.budget(timings.start_timeout()),
            None => timings.start_timeout(),
        };
        let ctx = PipelineContext {
            session,
            config: self.config.clone(),
            devices: self.devices.clone(),
            counters: self.counters.clone(),
            events: self.events_tx.clone(),
        };

        let started = drive(
            commands,
            pending,
            Phase::Starting,
            timeout(budget, Pipeline::start(ctx, &mut self.transport, policy)),
        )
        .await;

        match started {
            Ok(Ok(pipeline)) => {
                self.live = Some(pipeline);
                self.last_fault.lock().take();
                self.set_state(SessionState::Active);
            }
            Ok(Err(fault)) => self.fail(fault),
            Err(_) => {
                self.transport.abort();
                self.fail(SessionFault::StartTimeout(budget));
            }
        }
    }

    async fn stop(
        &mut self,
        commands: &mut mpsc::UnboundedReceiver<Command>,
        pending: &mut Pending,
    ) {
        self.set_state(SessionState::Stopping);
        let flush = self.config.session.flush();
        self.teardown(flush, Phase::Stopping, commands, pending).await;
        self.set_state(SessionState::Idle);
    }

    /// Stop the live pipeline, force-closing it if it overruns
    async fn teardown(
        &mut self,
        flush: Duration,
        phase: Phase,
        commands: &mut mpsc::UnboundedReceiver<Command>,
        pending: &mut Pending,
    ) {
        self.session = None;
        let Some(pipeline) = self.live.take() else {
            return;
        };
        let force_close = self.config.session.force_close();
        let stopped = drive(
            commands,
            pending,
            phase,
            timeout(force_close, pipeline.stop(&mut self.transport, flush)),
        )
        .await;
        if stopped.is_err() {
            tracing::warn!("Stop exceeded {:?}, forcing close", force_close);
            self.transport.abort();
        }
    }

    async fn on_event(
        &mut self,
        event: SessionEvent,
        commands: &mut mpsc::UnboundedReceiver<Command>,
        pending: &mut Pending,
    ) {
        if self.session != Some(event.session) || self.state != SessionState::Active {
            tracing::trace!("Ignoring event from session {}", event.session);
            return;
        }
        match event.kind {
            SessionEventKind::Control(kind) => tracing::debug!("Remote signal {:?}", kind),
            SessionEventKind::Fault(fault) => {
                tracing::error!("Session {} failed: {}", event.session, fault);
                self.teardown(Duration::ZERO, Phase::FaultTeardown, commands, pending)
                    .await;
                self.fail(fault);
            }
        }
    }

    async fn shutdown(&mut self) {
        if self.live.is_some() {
            self.set_state(SessionState::Stopping);
            let flush = self.config.session.flush();
            let force_close = self.config.session.force_close();
            if let Some(pipeline) = self.live.take() {
                if timeout(force_close, pipeline.stop(&mut self.transport, flush))
                    .await
                    .is_err()
                {
                    self.transport.abort();
                }
            }
        }
        self.session = None;
        self.set_state(SessionState::Idle);
        tracing::info!("Session controller stopped");
    }

    fn fail(&mut self, fault: SessionFault) {
        tracing::error!("Session faulted: {}", fault);
        *self.last_fault.lock() = Some(fault);
        self.session = None;
        self.set_state(SessionState::Faulted);
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state == state {
            return;
        }
        tracing::info!("Session {} -> {}", self.state, state);
        self.state = state;
        self.bus.publish(state);
    }
}

/// Cloneable, non-blocking handle to the controller
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<Command>,
    bus: Arc<StateBus>,
    last_fault: Arc<Mutex<Option<SessionFault>>>,
}

impl SessionHandle {
    pub fn toggle(&self) {
        self.on_toggle(Utc::now());
    }

    /// Turn the session off if it is on; a no-op otherwise
    pub fn stop(&self) {
        let _ = self.commands.send(Command::Stop);
    }

    /// Stop any live session and end the controller task
    pub async fn shutdown(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.commands.send(Command::Shutdown(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
    }

    pub fn current_state(&self) -> SessionState {
        self.bus.current()
    }

    /// Deliver every state change to `callback`, starting with the current one
    pub fn subscribe<F>(&self, callback: F)
    where
        F: Fn(SessionState) + Send + 'static,
    {
        self.bus.subscribe(callback);
    }

    pub fn watch(&self) -> watch::Receiver<SessionState> {
        self.bus.watch()
    }

    /// Why the session last went `Faulted`; cleared by the next successful start
    pub fn last_fault(&self) -> Option<SessionFault> {
        self.last_fault.lock().clone()
    }

    /// Wait until the published state equals `target`, for at most `within`
    pub async fn wait_for_state(&self, target: SessionState, within: Duration) -> bool {
        let mut rx = self.bus.watch();
        let outcome = timeout(within, rx.wait_for(|state| *state == target)).await;
        matches!(outcome, Ok(Ok(_)))
    }
}

impl ToggleSink for SessionHandle {
    fn on_toggle(&self, timestamp: DateTime<Utc>) {
        if self
            .commands
            .send(Command::Toggle(ToggleEvent { timestamp }))
            .is_err()
        {
            tracing::warn!("Toggle at {} dropped, controller has stopped", timestamp);
        }
    }
}
