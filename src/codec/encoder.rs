//! Frame encoder
//!
//! Audio is already PCM16 and passes through with its rate in the mime type.
//! Screen frames are scaled to fit the configured bound and JPEG-compressed.

use bytes::{BufMut, Bytes, BytesMut};
use image::codecs::jpeg::JpegEncoder;
use image::{imageops::FilterType, DynamicImage, RgbaImage};
use uuid::Uuid;

use crate::config::ScreenConfig;
use crate::error::CaptureError;
use crate::protocol::{MediaFrame, MediaKind, WireMessage};

/// Encodes captured frames into wire messages
#[derive(Debug, Clone)]
pub struct FrameEncoder {
    max_dimension: u32,
    jpeg_quality: u8,
    frames_encoded: u64,
    bytes_produced: u64,
}

impl FrameEncoder {
    pub fn new(max_dimension: u32, jpeg_quality: u8) -> Self {
        Self {
            max_dimension: max_dimension.max(1),
            jpeg_quality: jpeg_quality.clamp(1, 100),
            frames_encoded: 0,
            bytes_produced: 0,
        }
    }

    pub fn from_config(config: &ScreenConfig) -> Self {
        Self::new(config.max_dimension, config.jpeg_quality)
    }

    /// Encode one frame; kind and seq are carried over unchanged
    pub fn encode(
        &mut self,
        frame: MediaFrame,
        correlation_id: Uuid,
    ) -> Result<WireMessage, CaptureError> {
        let message = match frame {
            MediaFrame::Audio {
                pcm,
                sample_rate,
                seq,
            } => {
                if pcm.len() % 2 != 0 {
                    return Err(CaptureError::Encoding(format!(
                        "audio frame {} has odd length {}",
                        seq,
                        pcm.len()
                    )));
                }
                WireMessage {
                    kind: MediaKind::Audio,
                    seq,
                    correlation_id,
                    mime_type: format!("audio/pcm;rate={}", sample_rate),
                    payload: pcm,
                }
            }
            MediaFrame::Screen {
                image,
                width,
                height,
                seq,
            } => WireMessage {
                kind: MediaKind::Screen,
                seq,
                correlation_id,
                mime_type: "image/jpeg".to_string(),
                payload: self.encode_jpeg(image, width, height)?,
            },
        };

        self.frames_encoded += 1;
        self.bytes_produced += message.payload.len() as u64;
        Ok(message)
    }

    fn encode_jpeg(&self, rgba: Bytes, width: u32, height: u32) -> Result<Bytes, CaptureError> {
        let pixels = RgbaImage::from_raw(width, height, rgba.to_vec()).ok_or_else(|| {
            CaptureError::Encoding(format!(
                "{} bytes do not form a {}x{} RGBA image",
                rgba.len(),
                width,
                height
            ))
        })?;

        let mut image = DynamicImage::ImageRgba8(pixels);
        if width.max(height) > self.max_dimension {
            image = image.resize(self.max_dimension, self.max_dimension, FilterType::Triangle);
        }

        let rgb = image.to_rgb8();
        let mut out = Vec::with_capacity((rgb.width() * rgb.height() / 4) as usize);
        JpegEncoder::new_with_quality(&mut out, self.jpeg_quality)
            .encode_image(&rgb)
            .map_err(|e| CaptureError::Encoding(e.to_string()))?;
        Ok(Bytes::from(out))
    }

    pub fn frames_encoded(&self) -> u64 {
        self.frames_encoded
    }

    pub fn bytes_produced(&self) -> u64 {
        self.bytes_produced
    }
}

/// f32 samples to little-endian i16 PCM
pub fn samples_to_pcm16(samples: &[f32]) -> Bytes {
    let mut pcm = BytesMut::with_capacity(samples.len() * 2);
    for &sample in samples {
        pcm.put_i16_le((sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16);
    }
    pcm.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn screen(width: u32, height: u32, seq: u64) -> MediaFrame {
        MediaFrame::Screen {
            image: Bytes::from(vec![128u8; (width * height * 4) as usize]),
            width,
            height,
            seq,
        }
    }

    #[test]
    fn test_audio_passes_through() {
        let mut encoder = FrameEncoder::new(1024, 80);
        let id = Uuid::new_v4();
        let pcm = samples_to_pcm16(&[0.0, 0.5, -0.5]);

        let msg = encoder
            .encode(
                MediaFrame::Audio {
                    pcm: pcm.clone(),
                    sample_rate: 16_000,
                    seq: 9,
                },
                id,
            )
            .unwrap();

        assert_eq!(msg.kind, MediaKind::Audio);
        assert_eq!(msg.seq, 9);
        assert_eq!(msg.correlation_id, id);
        assert_eq!(msg.mime_type, "audio/pcm;rate=16000");
        assert_eq!(msg.payload, pcm);
    }

    #[test]
    fn test_odd_audio_rejected() {
        let mut encoder = FrameEncoder::new(1024, 80);
        let result = encoder.encode(
            MediaFrame::Audio {
                pcm: Bytes::from_static(&[1, 2, 3]),
                sample_rate: 16_000,
                seq: 1,
            },
            Uuid::new_v4(),
        );
        assert!(matches!(result, Err(CaptureError::Encoding(_))));
    }

    #[test]
    fn test_screen_is_scaled_jpeg() {
        let mut encoder = FrameEncoder::new(64, 80);
        let msg = encoder.encode(screen(256, 128, 4), Uuid::new_v4()).unwrap();

        assert_eq!(msg.kind, MediaKind::Screen);
        assert_eq!(msg.seq, 4);
        assert_eq!(msg.mime_type, "image/jpeg");
        assert_eq!(&msg.payload[..2], &[0xFF, 0xD8]);

        let decoded =
            image::load_from_memory_with_format(&msg.payload, image::ImageFormat::Jpeg).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (64, 32));
    }

    #[test]
    fn test_small_screen_not_upscaled() {
        let mut encoder = FrameEncoder::new(1024, 80);
        let msg = encoder.encode(screen(40, 30, 1), Uuid::new_v4()).unwrap();
        let decoded =
            image::load_from_memory_with_format(&msg.payload, image::ImageFormat::Jpeg).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (40, 30));
    }

    #[test]
    fn test_truncated_screen_rejected() {
        let mut encoder = FrameEncoder::new(1024, 80);
        let frame = MediaFrame::Screen {
            image: Bytes::from(vec![0u8; 10]),
            width: 8,
            height: 8,
            seq: 1,
        };
        assert!(matches!(
            encoder.encode(frame, Uuid::new_v4()),
            Err(CaptureError::Encoding(_))
        ));
        assert_eq!(encoder.frames_encoded(), 0);
    }
}
