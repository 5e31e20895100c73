//! Audio subsystem: microphone capture, reply buffering and playback

pub mod buffer;
pub mod capture;
pub mod device;
pub mod playback;
pub mod resample;

pub use buffer::{Admit, PlaybackBuffer, PlaybackStats};
pub use capture::{AudioInput, CaptureEvent, Chunker, MicrophoneInput};
pub use device::{list_devices, AudioDevice, AudioDeviceInfo};
pub use playback::{AudioOutput, CpalOutput, PlaybackEngine, PlaybackHandle};
pub use resample::StreamResampler;
