//! Network subsystem: outbound queue, duplex transport and WebSocket link

pub mod backoff;
pub mod queue;
pub mod transport;
pub mod websocket;

pub use backoff::ReconnectPolicy;
pub use queue::{Enqueued, OutboundQueue};
pub use transport::{
    CloseReason, Connector, Inbound, InboundItem, LinkEvent, LinkSink, LinkStream,
    OutboundSender, TransportClient,
};
pub use websocket::WebSocketConnector;
