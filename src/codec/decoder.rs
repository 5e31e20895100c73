//! Reply audio decoding

/// Little-endian i16 PCM to f32 samples in [-1, 1]; a trailing odd byte is ignored
pub fn pcm16_to_samples(pcm: &[u8]) -> Vec<f32> {
    pcm.chunks_exact(2)
        .map(|pair| {
            let value = i16::from_le_bytes([pair[0], pair[1]]);
            (value as f32 / 32768.0).clamp(-1.0, 1.0)
        })
        .collect()
}
