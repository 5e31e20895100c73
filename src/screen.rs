//! Screen snapshots
//!
//! A [`ScreenGrabber`] hands out raw RGBA frames of the primary monitor.
//! [`FrameDedup`] lets the producer skip frames whose content did not change.

use bytes::Bytes;

use crate::error::CaptureError;

/// Raw RGBA snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScreenImage {
    pub rgba: Bytes,
    pub width: u32,
    pub height: u32,
}

/// A screen-capture handle, held by at most one session at a time
pub trait ScreenGrabber: Send + 'static {
    /// Acquire the capture handle
    fn open(&mut self) -> Result<(), CaptureError>;

    /// Take one snapshot; may block for the duration of the capture
    fn grab(&mut self) -> Result<ScreenImage, CaptureError>;

    /// Release the capture handle; idempotent
    fn close(&mut self);
}

impl ScreenGrabber for Box<dyn ScreenGrabber> {
    fn open(&mut self) -> Result<(), CaptureError> {
        (**self).open()
    }

    fn grab(&mut self) -> Result<ScreenImage, CaptureError> {
        (**self).grab()
    }

    fn close(&mut self) {
        (**self).close()
    }
}

/// Content-hash filter for consecutive frames
#[derive(Debug, Default)]
pub struct FrameDedup {
    last: Option<blake3::Hash>,
    skipped: u64,
}

impl FrameDedup {
    pub fn new() -> Self {
        Self::default()
    }

    /// `true` if `image` differs from the previously accepted frame
    pub fn is_new(&mut self, image: &ScreenImage) -> bool {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&image.width.to_le_bytes());
        hasher.update(&image.height.to_le_bytes());
        hasher.update(&image.rgba);
        let hash = hasher.finalize();

        if self.last == Some(hash) {
            self.skipped += 1;
            return false;
        }
        self.last = Some(hash);
        true
    }

    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    pub fn reset(&mut self) {
        self.last = None;
    }
}

#[cfg(feature = "screen-capture")]
pub use monitor::MonitorGrabber;

#[cfg(feature = "screen-capture")]
mod monitor {
    use super::*;

    /// Primary monitor through xcap
    #[derive(Debug, Default)]
    pub struct MonitorGrabber {
        open: bool,
    }

    impl MonitorGrabber {
        pub fn new() -> Self {
            Self::default()
        }

        fn primary() -> Result<xcap::Monitor, CaptureError> {
            let monitors = xcap::Monitor::all().map_err(classify)?;
            let mut fallback = None;
            for monitor in monitors {
                if monitor.is_primary() {
                    return Ok(monitor);
                }
                fallback.get_or_insert(monitor);
            }
            fallback.ok_or_else(|| CaptureError::DeviceUnavailable("no monitor found".into()))
        }
    }

    fn classify(err: xcap::XCapError) -> CaptureError {
        let message = err.to_string();
        let lower = message.to_lowercase();
        if lower.contains("permission") || lower.contains("denied") {
            CaptureError::PermissionDenied(message)
        } else {
            CaptureError::DeviceUnavailable(message)
        }
    }

    impl ScreenGrabber for MonitorGrabber {
        fn open(&mut self) -> Result<(), CaptureError> {
            // Probe once so a missing permission fails the session start
            Self::primary()?.capture_image().map_err(classify)?;
            self.open = true;
            Ok(())
        }

        fn grab(&mut self) -> Result<ScreenImage, CaptureError> {
            if !self.open {
                return Err(CaptureError::DeviceUnavailable("screen grabber not open".into()));
            }
            // Monitors are re-enumerated each time; layouts change while running
            let image = Self::primary()?.capture_image().map_err(classify)?;
            let (width, height) = image.dimensions();
            Ok(ScreenImage {
                rgba: Bytes::from(image.into_raw()),
                width,
                height,
            })
        }

        fn close(&mut self) {
            self.open = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image(fill: u8) -> ScreenImage {
        ScreenImage {
            rgba: Bytes::from(vec![fill; 4 * 4 * 4]),
            width: 4,
            height: 4,
        }
    }

    #[test]
    fn test_dedup_skips_identical() {
        let mut dedup = FrameDedup::new();
        assert!(dedup.is_new(&image(1)));
        assert!(!dedup.is_new(&image(1)));
        assert!(dedup.is_new(&image(2)));
        assert!(dedup.is_new(&image(1)));
        assert_eq!(dedup.skipped(), 1);
    }

    #[test]
    fn test_dedup_reset() {
        let mut dedup = FrameDedup::new();
        assert!(dedup.is_new(&image(7)));
        dedup.reset();
        assert!(dedup.is_new(&image(7)));
    }

    #[test]
    fn test_dimensions_are_hashed() {
        let mut dedup = FrameDedup::new();
        let wide = ScreenImage {
            rgba: Bytes::from(vec![0; 32]),
            width: 4,
            height: 2,
        };
        let tall = ScreenImage {
            width: 2,
            height: 4,
            ..wide.clone()
        };
        assert!(dedup.is_new(&wide));
        assert!(dedup.is_new(&tall));
    }
}
