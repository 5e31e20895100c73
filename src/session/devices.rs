//! Device factory handed to the controller

use crate::audio::{AudioInput, AudioOutput, CpalOutput, MicrophoneInput};
use crate::config::{CaptureConfig, PlaybackConfig, ScreenConfig};
use crate::screen::ScreenGrabber;

/// Creates fresh, unopened device handles for each session
pub trait MediaDevices: Send + Sync + 'static {
    fn audio_input(&self, config: &CaptureConfig) -> Box<dyn AudioInput>;

    fn audio_output(&self, config: &PlaybackConfig) -> Box<dyn AudioOutput>;

    /// `None` when screen capture is disabled or unsupported
    fn screen(&self, config: &ScreenConfig) -> Option<Box<dyn ScreenGrabber>>;
}

/// cpal audio, plus xcap screens with the `screen-capture` feature
#[derive(Debug, Default, Clone)]
pub struct SystemDevices;

impl MediaDevices for SystemDevices {
    fn audio_input(&self, config: &CaptureConfig) -> Box<dyn AudioInput> {
        Box::new(MicrophoneInput::new(config.device_id.clone()))
    }

    fn audio_output(&self, config: &PlaybackConfig) -> Box<dyn AudioOutput> {
        Box::new(CpalOutput::new(config.device_id.clone()))
    }

    #[cfg(feature = "screen-capture")]
    fn screen(&self, config: &ScreenConfig) -> Option<Box<dyn ScreenGrabber>> {
        config
            .enabled
            .then(|| Box::new(crate::screen::MonitorGrabber::new()) as Box<dyn ScreenGrabber>)
    }

    #[cfg(not(feature = "screen-capture"))]
    fn screen(&self, config: &ScreenConfig) -> Option<Box<dyn ScreenGrabber>> {
        if config.enabled {
            tracing::warn!("Built without screen-capture; running audio-only");
        }
        None
    }
}
