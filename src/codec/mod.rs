//! Media codec: captured frames to wire payloads and back

pub mod encoder;
pub mod decoder;

pub use encoder::{samples_to_pcm16, FrameEncoder};
pub use decoder::pcm16_to_samples;
