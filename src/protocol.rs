//! Frames, wire messages and the JSON envelope exchanged with the remote service
//!
//! Every text frame on the link is one [`Envelope`]:
//!
//! ```text
//! {"type":"setup",   "correlation_id":U, "model":M, "voice":V, "response_modalities":["AUDIO"]}
//! {"type":"media",   "kind":"audio"|"screen", "seq":N, "correlation_id":U, "mime_type":T, "data":base64}
//! {"type":"control", "signal":"setup_complete"|"turn_complete"|"interrupted"|"go_away"}
//! ```

use base64::Engine;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::TransportFault;

/// Kind of captured media; sequence numbers are counted per kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Audio,
    Screen,
}

/// A unit of captured media, consumed exactly once by the encoder
#[derive(Debug, Clone)]
pub enum MediaFrame {
    /// Little-endian i16 mono PCM
    Audio {
        pcm: Bytes,
        sample_rate: u32,
        seq: u64,
    },
    /// Raw RGBA pixels
    Screen {
        image: Bytes,
        width: u32,
        height: u32,
        seq: u64,
    },
}

/// Encoded frame ready for the outbound queue
#[derive(Debug, Clone, PartialEq)]
pub struct WireMessage {
    pub kind: MediaKind,
    pub seq: u64,
    pub correlation_id: Uuid,
    pub mime_type: String,
    pub payload: Bytes,
}

/// Control signals from the remote service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlKind {
    SetupComplete,
    TurnComplete,
    /// The user barged in; pending reply audio is obsolete
    Interrupted,
    /// The remote is about to close the connection
    GoAway,
}

/// Decoded inbound frame
#[derive(Debug, Clone, PartialEq)]
pub enum ReplyFrame {
    AudioChunk { pcm: Bytes, seq: u64 },
    ControlSignal { kind: ControlKind },
}

/// First frame on every connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetupRequest {
    pub correlation_id: Uuid,
    pub model: String,
    pub voice: String,
    pub response_modalities: Vec<String>,
}

impl SetupRequest {
    pub fn audio_reply(correlation_id: Uuid, model: &str, voice: &str) -> Self {
        Self {
            correlation_id,
            model: model.to_string(),
            voice: voice.to_string(),
            response_modalities: vec!["AUDIO".to_string()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaBody {
    pub kind: MediaKind,
    pub seq: u64,
    pub correlation_id: Uuid,
    pub mime_type: String,
    /// base64 payload
    pub data: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlBody {
    pub signal: ControlKind,
}

/// One text frame on the link
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Envelope {
    Setup(SetupRequest),
    Media(MediaBody),
    Control(ControlBody),
}

impl Envelope {
    pub fn to_text(&self) -> Result<String, TransportFault> {
        serde_json::to_string(self)
            .map_err(|e| TransportFault::ProtocolViolation(format!("serialize: {}", e)))
    }

    pub fn from_text(text: &str) -> Result<Self, TransportFault> {
        serde_json::from_str(text)
            .map_err(|e| TransportFault::ProtocolViolation(format!("deserialize: {}", e)))
    }

    pub fn control(signal: ControlKind) -> Self {
        Envelope::Control(ControlBody { signal })
    }
}

impl From<&WireMessage> for Envelope {
    fn from(msg: &WireMessage) -> Self {
        Envelope::Media(MediaBody {
            kind: msg.kind,
            seq: msg.seq,
            correlation_id: msg.correlation_id,
            mime_type: msg.mime_type.clone(),
            data: base64::engine::general_purpose::STANDARD.encode(&msg.payload),
        })
    }
}

/// Serialize an outbound message to a text frame
pub fn encode_wire(msg: &WireMessage) -> Result<String, TransportFault> {
    Envelope::from(msg).to_text()
}

/// Decode an inbound text frame
pub fn decode_reply(text: &str) -> Result<ReplyFrame, TransportFault> {
    match Envelope::from_text(text)? {
        Envelope::Media(body) if body.kind == MediaKind::Audio => {
            let pcm = base64::engine::general_purpose::STANDARD
                .decode(body.data.as_bytes())
                .map_err(|e| TransportFault::ProtocolViolation(format!("base64: {}", e)))?;
            Ok(ReplyFrame::AudioChunk {
                pcm: Bytes::from(pcm),
                seq: body.seq,
            })
        }
        Envelope::Media(body) => Err(TransportFault::ProtocolViolation(format!(
            "unexpected inbound {:?} media",
            body.kind
        ))),
        Envelope::Control(body) => Ok(ReplyFrame::ControlSignal { kind: body.signal }),
        Envelope::Setup(_) => Err(TransportFault::ProtocolViolation(
            "unexpected inbound setup".into(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn audio_message(seq: u64) -> WireMessage {
        WireMessage {
            kind: MediaKind::Audio,
            seq,
            correlation_id: Uuid::new_v4(),
            mime_type: "audio/pcm;rate=16000".to_string(),
            payload: Bytes::from_static(&[1, 0, 2, 0, 3, 0]),
        }
    }

    #[test]
    fn test_echoed_audio_keeps_seq_and_payload() {
        let msg = audio_message(42);
        let text = encode_wire(&msg).unwrap();

        match decode_reply(&text).unwrap() {
            ReplyFrame::AudioChunk { pcm, seq } => {
                assert_eq!(seq, 42);
                assert_eq!(pcm, msg.payload);
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn test_envelope_tags() {
        let text = encode_wire(&audio_message(1)).unwrap();
        let json: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(json["type"], "media");
        assert_eq!(json["kind"], "audio");
        assert_eq!(json["seq"], 1);

        let text = Envelope::control(ControlKind::TurnComplete).to_text().unwrap();
        assert_eq!(text, r#"{"type":"control","signal":"turn_complete"}"#);
    }

    #[test]
    fn test_control_decodes() {
        let reply = decode_reply(r#"{"type":"control","signal":"interrupted"}"#).unwrap();
        assert_eq!(
            reply,
            ReplyFrame::ControlSignal {
                kind: ControlKind::Interrupted
            }
        );
    }

    #[test]
    fn test_inbound_screen_is_violation() {
        let mut msg = audio_message(3);
        msg.kind = MediaKind::Screen;
        let text = encode_wire(&msg).unwrap();
        assert!(matches!(
            decode_reply(&text),
            Err(TransportFault::ProtocolViolation(_))
        ));
    }

    #[test]
    fn test_garbage_is_violation() {
        assert!(matches!(
            decode_reply("not json"),
            Err(TransportFault::ProtocolViolation(_))
        ));
        assert!(matches!(
            decode_reply(r#"{"type":"media","kind":"audio","seq":1}"#),
            Err(TransportFault::ProtocolViolation(_))
        ));
    }

    #[test]
    fn test_setup_request_shape() {
        let id = Uuid::new_v4();
        let setup = Envelope::Setup(SetupRequest::audio_reply(id, "models/x", "Puck"));
        let json: serde_json::Value = serde_json::from_str(&setup.to_text().unwrap()).unwrap();
        assert_eq!(json["type"], "setup");
        assert_eq!(json["voice"], "Puck");
        assert_eq!(json["response_modalities"][0], "AUDIO");
        assert_eq!(json["correlation_id"], id.to_string());
    }
}
