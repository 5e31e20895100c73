//! Mono sample-rate conversion between device rates and wire rates

use rubato::{FastFixedIn, PolynomialDegree, Resampler};

/// Input block size fed to rubato
const BLOCK_FRAMES: usize = 256;

/// Streaming mono resampler
///
/// Accepts arbitrarily sized input and emits whatever full blocks are ready.
/// With equal rates it is a plain copy.
pub struct StreamResampler {
    inner: Option<FastFixedIn<f32>>,
    pending: Vec<f32>,
}

impl StreamResampler {
    pub fn new(from_rate: u32, to_rate: u32) -> Result<Self, String> {
        let inner = if from_rate == to_rate {
            None
        } else {
            let resampler = FastFixedIn::<f32>::new(
                to_rate as f64 / from_rate as f64,
                1.0,
                PolynomialDegree::Cubic,
                BLOCK_FRAMES,
                1,
            )
            .map_err(|e| e.to_string())?;
            Some(resampler)
        };

        Ok(Self {
            inner,
            pending: Vec::with_capacity(BLOCK_FRAMES * 2),
        })
    }

    pub fn is_passthrough(&self) -> bool {
        self.inner.is_none()
    }

    /// Feed `input`, appending converted samples to `out`
    pub fn process(&mut self, input: &[f32], out: &mut Vec<f32>) {
        let Some(resampler) = self.inner.as_mut() else {
            out.extend_from_slice(input);
            return;
        };

        self.pending.extend_from_slice(input);
        loop {
            let needed = resampler.input_frames_next();
            if self.pending.len() < needed {
                break;
            }
            match resampler.process(&[&self.pending[..needed]], None) {
                Ok(blocks) => {
                    if let Some(block) = blocks.first() {
                        out.extend_from_slice(block);
                    }
                }
                Err(e) => {
                    tracing::warn!("Resampler block failed: {}", e);
                }
            }
            self.pending.drain(..needed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_passthrough() {
        let mut resampler = StreamResampler::new(16_000, 16_000).unwrap();
        assert!(resampler.is_passthrough());

        let mut out = Vec::new();
        resampler.process(&[0.1, 0.2, 0.3], &mut out);
        assert_eq!(out, vec![0.1, 0.2, 0.3]);
    }

    #[test]
    fn test_downsample_ratio() {
        let mut resampler = StreamResampler::new(48_000, 16_000).unwrap();
        let input = vec![0.0f32; 48_000];
        let mut out = Vec::new();

        for chunk in input.chunks(480) {
            resampler.process(chunk, &mut out);
        }

        // One second in, roughly one second out minus the unfilled tail block
        assert!(out.len() > 15_000 && out.len() <= 16_000, "got {}", out.len());
    }

    #[test]
    fn test_holds_partial_block() {
        let mut resampler = StreamResampler::new(24_000, 48_000).unwrap();
        let mut out = Vec::new();
        resampler.process(&[0.0; 10], &mut out);
        assert!(out.is_empty());
    }
}
