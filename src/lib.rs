//! # Live Assistant
//!
//! Toggle-driven, low-latency voice and screen session with a remote
//! conversational service.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────┐  ToggleEvent   ┌───────────────────────────────────────────┐
//! │ToggleListener├───────────────►│        SessionController (actor)          │
//! └──────────────┘                │  Idle → Starting → Active → Stopping      │
//!                                 │            └──────► Faulted               │
//!                                 └───────┬──────────────────────┬────────────┘
//!                                         │ StateBus             │ spawns per session
//!                           ┌─────────────▼─────┐     ┌──────────▼───────────────┐
//!                           │ Overlay / Tray    │     │        Pipeline          │
//!                           │ (subscribers)     │     │                          │
//!                           └───────────────────┘     │ ┌──────────┐ ┌────────┐  │
//!                                                     │ │Microphone│ │ Screen │  │
//!                                                     │ │ Chunker  │ │ Dedup  │  │
//!                                                     │ └────┬─────┘ └───┬────┘  │
//!                                                     │      ▼ Encoder   ▼       │
//!                                                     │ ┌─────────────────────┐  │
//!                                                     │ │ OutboundQueue       │  │
//!                                                     │ │ (audio > screen)    │  │
//!                                                     │ └─────────┬───────────┘  │
//!                                                     └───────────┼──────────────┘
//!                                                                 ▼
//!                     ┌────────────────────────────────────────────────────────┐
//!                     │ TransportClient: writer task ──► remote ──► reader task │
//!                     └──────────────────────────────────────────┬─────────────┘
//!                                                                │ ReplyFrame
//!                                  ┌─────────────────────────────▼─────────────┐
//!                                  │ PlaybackEngine: PlaybackBuffer → render    │
//!                                  │ thread → output device                    │
//!                                  └───────────────────────────────────────────┘
//! ```

pub mod audio;
pub mod codec;
pub mod config;
pub mod error;
pub mod network;
pub mod protocol;
pub mod screen;
pub mod session;

pub use session::{SessionController, SessionHandle, SessionState, ToggleEvent};

/// Application-wide constants
pub mod constants {
    /// Outbound microphone sample rate expected by the remote service
    pub const DEFAULT_SEND_SAMPLE_RATE: u32 = 16_000;

    /// Sample rate of inbound reply audio
    pub const DEFAULT_RECEIVE_SAMPLE_RATE: u32 = 24_000;

    /// Duration of one outbound audio chunk (1024 samples at 16 kHz)
    pub const DEFAULT_AUDIO_CHUNK_MS: u32 = 64;

    /// Allowed audio chunk cadence range in milliseconds
    pub const AUDIO_CHUNK_MS_RANGE: std::ops::RangeInclusive<u32> = 20..=100;

    /// Screen capture cadence in milliseconds
    pub const DEFAULT_SCREEN_INTERVAL_MS: u64 = 1_000;

    /// Lower bound for the screen cadence
    pub const MIN_SCREEN_INTERVAL_MS: u64 = 250;

    /// Longest edge of an outbound screen thumbnail
    pub const DEFAULT_SCREEN_MAX_DIMENSION: u32 = 1024;

    /// JPEG quality for screen thumbnails
    pub const DEFAULT_JPEG_QUALITY: u8 = 80;

    /// Playback jitter window in milliseconds
    pub const DEFAULT_PLAYBACK_WINDOW_MS: u64 = 1_500;

    /// How long the render loop waits for a missing sequence number
    pub const DEFAULT_GAP_TIMEOUT_MS: u64 = 60;

    /// Outbound queue capacity in messages
    pub const DEFAULT_OUTBOUND_CAPACITY: usize = 16;

    /// Default remote endpoint
    pub const DEFAULT_ENDPOINT: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

    /// Default target model
    pub const DEFAULT_MODEL: &str = "models/gemini-2.0-flash-exp";

    /// Default prebuilt voice
    pub const DEFAULT_VOICE: &str = "Puck";

    /// Connection establishment timeout (open + setup handshake)
    pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5_000;

    /// Read/write idle timeout used for dead-connection detection
    pub const DEFAULT_IDLE_TIMEOUT_MS: u64 = 15_000;

    /// Link heartbeat interval
    pub const DEFAULT_HEARTBEAT_MS: u64 = 5_000;

    /// T_start: whole session setup
    pub const DEFAULT_START_TIMEOUT_MS: u64 = 10_000;

    /// T_flush: graceful drain of audio out and playback
    pub const DEFAULT_FLUSH_MS: u64 = 500;

    /// T_forceclose: upper bound of a stop
    pub const DEFAULT_FORCE_CLOSE_MS: u64 = 3_000;

    /// N_max: reconnect attempts after a fault
    pub const DEFAULT_RECONNECT_ATTEMPTS: u32 = 3;

    /// Upper bound accepted for `reconnect_attempts`
    pub const MAX_RECONNECT_ATTEMPTS: u32 = 10;

    /// First reconnect delay
    pub const DEFAULT_RECONNECT_INITIAL_MS: u64 = 500;

    /// Reconnect delay cap
    pub const DEFAULT_RECONNECT_MAX_MS: u64 = 8_000;

    /// Overlay icon edge in pixels
    pub const DEFAULT_OVERLAY_SIZE: u32 = 100;

    /// Overlay distance from the screen edge
    pub const DEFAULT_OVERLAY_MARGIN: u32 = 30;

    /// Environment variable holding the credential
    pub const CREDENTIAL_ENV: &str = "LIVE_ASSISTANT_API_KEY";

    /// Fallback credential variable
    pub const CREDENTIAL_ENV_FALLBACK: &str = "GEMINI_API_KEY";

    /// Environment override for the model
    pub const MODEL_ENV: &str = "LIVE_ASSISTANT_MODEL";
}
