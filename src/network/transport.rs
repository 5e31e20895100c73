//! Duplex connection to the remote service
//!
//! ```text
//!  producers ──► OutboundQueue ──► writer task ──► LinkSink ──► remote
//!                                   (+ heartbeats)
//!  remote ──► LinkStream ──► reader task ──► Inbound (ReplyFrame | fault)
//! ```
//!
//! A dead link is detected by the idle timeout on either task, or by a remote
//! close. The client reports it on [`Inbound`] and never retries on its own;
//! [`TransportClient::reconnect`] exists for the controller to call explicitly.

use async_trait::async_trait;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::TransportConfig;
use crate::error::{ConnectError, SendError, SessionFault, TransportFault};
use crate::network::backoff::ReconnectPolicy;
use crate::network::queue::{Enqueued, OutboundQueue};
use crate::protocol::{
    decode_reply, encode_wire, ControlKind, Envelope, MediaKind, ReplyFrame, SetupRequest,
    WireMessage,
};

/// How long a cancelled task gets to finish before it is aborted
const JOIN_GRACE: Duration = Duration::from_millis(250);

/// Why the remote ended the link
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    Normal(String),
    /// Credential rejected
    Unauthorized(String),
}

/// Link-level event, below the JSON envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// One text frame
    Frame(String),
    /// Keepalive; counts as liveness, carries nothing
    Heartbeat,
    Close(CloseReason),
}

pub type LinkSink = Pin<Box<dyn Sink<LinkEvent, Error = TransportFault> + Send>>;
pub type LinkStream = Pin<Box<dyn Stream<Item = Result<LinkEvent, TransportFault>> + Send>>;

/// Opens raw links; the client layers setup, queuing and liveness on top
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn open(&self, config: &TransportConfig) -> Result<(LinkSink, LinkStream), ConnectError>;
}

pub type InboundItem = Result<ReplyFrame, TransportFault>;

/// Inbound reply frames of one connection
///
/// Ends when the connection is closed. A fault is delivered as a final `Err`.
pub struct Inbound {
    rx: mpsc::UnboundedReceiver<InboundItem>,
}

impl Inbound {
    pub async fn next(&mut self) -> Option<InboundItem> {
        self.rx.recv().await
    }
}

/// Cloneable enqueue handle for producer tasks
#[derive(Clone)]
pub struct OutboundSender {
    queue: Arc<OutboundQueue>,
}

impl OutboundSender {
    pub fn send(&self, msg: WireMessage) -> Result<Enqueued, SendError> {
        let (kind, seq) = (msg.kind, msg.seq);
        let outcome = self.queue.push(msg)?;
        match outcome {
            Enqueued::Queued => {}
            Enqueued::DroppedOldestScreen(dropped) => {
                tracing::debug!("Outbound full, dropped screen frame {}", dropped)
            }
            Enqueued::DroppedIncoming => {
                tracing::debug!("Outbound full of audio, dropped incoming {:?} frame {}", kind, seq)
            }
            Enqueued::DroppedOldestAudio(dropped) => {
                tracing::warn!("Outbound full of audio, dropped audio frame {}", dropped)
            }
        }
        Ok(outcome)
    }

    pub fn is_open(&self) -> bool {
        self.queue.is_open()
    }
}

/// One live link and its two tasks
struct Connection {
    correlation_id: Uuid,
    outbound: Arc<OutboundQueue>,
    cancel: CancellationToken,
    writer: Option<JoinHandle<()>>,
    reader: Option<JoinHandle<()>>,
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.outbound.close();
        for task in [self.writer.take(), self.reader.take()].into_iter().flatten() {
            task.abort();
        }
    }
}

pub struct TransportClient {
    connector: Arc<dyn Connector>,
    config: TransportConfig,
    live: Option<Connection>,
}

impl TransportClient {
    pub fn new(connector: Arc<dyn Connector>, config: TransportConfig) -> Self {
        Self {
            connector,
            config,
            live: None,
        }
    }

    /// Open a link, complete setup and start the I/O tasks
    pub async fn connect(&mut self, correlation_id: Uuid) -> Result<Inbound, ConnectError> {
        // At most one live connection
        self.abort();

        let connect_timeout = self.config.connect_timeout();
        let (sink, stream) = match timeout(connect_timeout, self.handshake(correlation_id)).await {
            Ok(result) => result?,
            Err(_) => {
                tracing::warn!("Connect timed out after {:?}", connect_timeout);
                return Err(ConnectError::Timeout);
            }
        };

        let outbound = Arc::new(OutboundQueue::new(self.config.outbound_capacity));
        let cancel = CancellationToken::new();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        let writer = tokio::spawn(write_loop(
            sink,
            outbound.clone(),
            cancel.clone(),
            self.config.heartbeat(),
            self.config.idle_timeout(),
            inbound_tx.clone(),
        ));
        let reader = tokio::spawn(read_loop(
            stream,
            outbound.clone(),
            cancel.clone(),
            self.config.idle_timeout(),
            inbound_tx,
        ));

        self.live = Some(Connection {
            correlation_id,
            outbound,
            cancel,
            writer: Some(writer),
            reader: Some(reader),
        });
        tracing::info!("Connected to {} (session {})", self.config.endpoint, correlation_id);
        Ok(Inbound { rx: inbound_rx })
    }

    async fn handshake(
        &self,
        correlation_id: Uuid,
    ) -> Result<(LinkSink, LinkStream), ConnectError> {
        let (mut sink, mut stream) = self.connector.open(&self.config).await?;

        let setup = Envelope::Setup(SetupRequest::audio_reply(
            correlation_id,
            &self.config.model,
            &self.config.voice,
        ))
        .to_text()
        .map_err(|e| ConnectError::Network(e.to_string()))?;
        sink.send(LinkEvent::Frame(setup))
            .await
            .map_err(|e| ConnectError::Network(e.to_string()))?;

        loop {
            match stream.next().await {
                Some(Ok(LinkEvent::Frame(text))) => match decode_reply(&text) {
                    Ok(ReplyFrame::ControlSignal {
                        kind: ControlKind::SetupComplete,
                    }) => break,
                    Ok(other) => tracing::debug!("Ignoring {:?} before setup completed", other),
                    Err(e) => return Err(ConnectError::Network(e.to_string())),
                },
                Some(Ok(LinkEvent::Heartbeat)) => {}
                Some(Ok(LinkEvent::Close(CloseReason::Unauthorized(reason)))) => {
                    return Err(ConnectError::Auth(reason))
                }
                Some(Ok(LinkEvent::Close(CloseReason::Normal(reason)))) => {
                    return Err(ConnectError::Network(format!("closed during setup: {}", reason)))
                }
                Some(Err(e)) => return Err(ConnectError::Network(e.to_string())),
                None => return Err(ConnectError::Network("closed during setup".to_string())),
            }
        }

        Ok((sink, stream))
    }

    /// Connect with exponential backoff; an auth rejection stops early
    pub async fn reconnect(
        &mut self,
        correlation_id: Uuid,
        policy: &ReconnectPolicy,
    ) -> Result<Inbound, SessionFault> {
        let mut last = ConnectError::Timeout;
        for attempt in 1..=policy.max_attempts {
            let delay = policy.delay_for(attempt);
            tracing::info!(
                "Reconnect attempt {}/{} in {:?}",
                attempt,
                policy.max_attempts,
                delay
            );
            tokio::time::sleep(delay).await;

            match self.connect(correlation_id).await {
                Ok(inbound) => return Ok(inbound),
                Err(ConnectError::Auth(reason)) => {
                    return Err(SessionFault::Connect(ConnectError::Auth(reason)))
                }
                Err(e) => {
                    tracing::warn!("Reconnect attempt {} failed: {}", attempt, e);
                    last = e;
                }
            }
        }
        Err(SessionFault::ReconnectExhausted {
            attempts: policy.max_attempts,
            last,
        })
    }

    /// Enqueue without waiting on the network
    pub fn send(&self, msg: WireMessage) -> Result<Enqueued, SendError> {
        self.sender()?.send(msg)
    }

    pub fn sender(&self) -> Result<OutboundSender, SendError> {
        self.live
            .as_ref()
            .filter(|c| c.outbound.is_open())
            .map(|c| OutboundSender {
                queue: c.outbound.clone(),
            })
            .ok_or(SendError::ConnectionClosed)
    }

    pub fn is_connected(&self) -> bool {
        self.live.as_ref().is_some_and(|c| c.outbound.is_open())
    }

    /// Graceful close: drop queued screen frames, drain audio for up to `flush`
    pub async fn close(&mut self, flush: Duration) {
        let Some(mut conn) = self.live.take() else {
            return;
        };

        let discarded = conn.outbound.discard(MediaKind::Screen);
        if discarded > 0 {
            tracing::debug!("Discarded {} queued screen frame(s) on close", discarded);
        }
        conn.outbound.seal();

        if let Some(writer) = conn.writer.as_mut() {
            match timeout(flush, writer).await {
                Ok(_) => conn.writer = None,
                Err(_) => tracing::debug!(
                    "Outbound flush incomplete after {:?}, {} message(s) left",
                    flush,
                    conn.outbound.len()
                ),
            }
        }

        conn.cancel.cancel();
        conn.outbound.close();
        for task in [conn.writer.take(), conn.reader.take()].into_iter().flatten() {
            let abort = task.abort_handle();
            if timeout(JOIN_GRACE, task).await.is_err() {
                abort.abort();
            }
        }
        tracing::info!("Connection {} closed", conn.correlation_id);
    }

    /// Tear down immediately, dropping anything unsent
    pub fn abort(&mut self) {
        if let Some(conn) = self.live.take() {
            tracing::debug!("Aborting connection {}", conn.correlation_id);
        }
    }
}

async fn write_loop(
    mut sink: LinkSink,
    outbound: Arc<OutboundQueue>,
    cancel: CancellationToken,
    heartbeat: Duration,
    idle: Duration,
    faults: mpsc::UnboundedSender<InboundItem>,
) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + heartbeat, heartbeat);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = outbound.pop() => match next {
                Some(msg) => match encode_wire(&msg) {
                    Ok(text) => LinkEvent::Frame(text),
                    Err(e) => {
                        tracing::warn!("Dropping unencodable {:?} frame {}: {}", msg.kind, msg.seq, e);
                        continue;
                    }
                },
                // Sealed and drained
                None => break,
            },
            _ = ticker.tick() => LinkEvent::Heartbeat,
        };

        let fault = match timeout(idle, sink.send(event)).await {
            Ok(Ok(())) => continue,
            Ok(Err(fault)) => fault,
            Err(_) => TransportFault::Dropped(format!("write stalled for {:?}", idle)),
        };
        if !cancel.is_cancelled() {
            tracing::error!("Outbound link failed: {}", fault);
            let _ = faults.send(Err(fault));
        }
        outbound.close();
        return;
    }

    let _ = timeout(JOIN_GRACE, sink.close()).await;
}

async fn read_loop(
    mut stream: LinkStream,
    outbound: Arc<OutboundQueue>,
    cancel: CancellationToken,
    idle: Duration,
    inbound: mpsc::UnboundedSender<InboundItem>,
) {
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            next = timeout(idle, stream.next()) => next,
        };

        let fault = match next {
            Ok(Some(Ok(LinkEvent::Heartbeat))) => continue,
            Ok(Some(Ok(LinkEvent::Frame(text)))) => match decode_reply(&text) {
                Ok(frame) => {
                    let _ = inbound.send(Ok(frame));
                    continue;
                }
                Err(violation) => violation,
            },
            Ok(Some(Ok(LinkEvent::Close(reason)))) => {
                TransportFault::Dropped(format!("remote closed: {:?}", reason))
            }
            Ok(Some(Err(fault))) => fault,
            Ok(None) => TransportFault::Dropped("link ended".to_string()),
            Err(_) => TransportFault::Dropped(format!("no inbound traffic for {:?}", idle)),
        };

        if !cancel.is_cancelled() {
            tracing::error!("Inbound link failed: {}", fault);
            let _ = inbound.send(Err(fault));
        }
        outbound.close();
        return;
    }
}
