//! WebSocket link to the live service

use async_trait::async_trait;
use futures_util::future::ready;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{self, Message};

use crate::config::{CredentialPlacement, TransportConfig};
use crate::error::{ConnectError, TransportFault};
use crate::network::transport::{CloseReason, Connector, LinkEvent, LinkSink, LinkStream};

/// Connects with tokio-tungstenite
#[derive(Debug, Default, Clone)]
pub struct WebSocketConnector;

impl WebSocketConnector {
    pub fn new() -> Self {
        Self
    }
}

/// Upgrade request carrying the credential
pub fn build_request(config: &TransportConfig) -> Result<Request, ConnectError> {
    let credential = config
        .credential
        .as_ref()
        .ok_or_else(|| ConnectError::Auth("no credential configured".to_string()))?;

    let url = match config.credential_placement {
        CredentialPlacement::Bearer => config.endpoint.clone(),
        CredentialPlacement::Query => {
            let separator = if config.endpoint.contains('?') { '&' } else { '?' };
            format!("{}{}key={}", config.endpoint, separator, credential.expose())
        }
    };

    let mut request = url
        .into_client_request()
        .map_err(|e| ConnectError::Network(format!("invalid endpoint: {}", e)))?;

    if config.credential_placement == CredentialPlacement::Bearer {
        let value = format!("Bearer {}", credential.expose())
            .parse()
            .map_err(|_| ConnectError::Auth("credential is not a valid header value".to_string()))?;
        request.headers_mut().insert(AUTHORIZATION, value);
    }
    Ok(request)
}

fn classify(err: tungstenite::Error) -> ConnectError {
    match err {
        tungstenite::Error::Http(response)
            if response.status().as_u16() == 401 || response.status().as_u16() == 403 =>
        {
            ConnectError::Auth(format!("upgrade rejected with {}", response.status()))
        }
        other => ConnectError::Network(other.to_string()),
    }
}

fn to_message(event: LinkEvent) -> Message {
    match event {
        LinkEvent::Frame(text) => Message::Text(text),
        LinkEvent::Heartbeat => Message::Ping(Vec::new()),
        LinkEvent::Close(reason) => {
            let (code, reason) = match reason {
                CloseReason::Normal(reason) => (CloseCode::Normal, reason),
                CloseReason::Unauthorized(reason) => (CloseCode::Policy, reason),
            };
            Message::Close(Some(CloseFrame {
                code,
                reason: reason.into(),
            }))
        }
    }
}

fn from_message(message: Result<Message, tungstenite::Error>) -> Option<Result<LinkEvent, TransportFault>> {
    match message {
        Ok(Message::Text(text)) => Some(Ok(LinkEvent::Frame(text))),
        Ok(Message::Binary(bytes)) => Some(
            String::from_utf8(bytes)
                .map(LinkEvent::Frame)
                .map_err(|_| TransportFault::ProtocolViolation("binary frame is not UTF-8".into())),
        ),
        Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => Some(Ok(LinkEvent::Heartbeat)),
        Ok(Message::Close(frame)) => {
            let reason = match frame {
                Some(frame) if frame.code == CloseCode::Policy => {
                    CloseReason::Unauthorized(frame.reason.into_owned())
                }
                Some(frame) => CloseReason::Normal(format!("{}: {}", frame.code, frame.reason)),
                None => CloseReason::Normal(String::new()),
            };
            Some(Ok(LinkEvent::Close(reason)))
        }
        Ok(Message::Frame(_)) => None,
        Err(e) => Some(Err(TransportFault::Dropped(e.to_string()))),
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn open(&self, config: &TransportConfig) -> Result<(LinkSink, LinkStream), ConnectError> {
        let request = build_request(config)?;
        tracing::debug!("Opening WebSocket to {}", config.endpoint);

        let (ws_stream, _) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(classify)?;
        let (write, read) = ws_stream.split();

        let sink: LinkSink = Box::pin(
            write
                .sink_map_err(|e| TransportFault::Dropped(e.to_string()))
                .with(|event: LinkEvent| ready(Ok::<_, TransportFault>(to_message(event)))),
        );
        let stream: LinkStream = Box::pin(read.filter_map(|message| ready(from_message(message))));
        Ok((sink, stream))
    }
}
