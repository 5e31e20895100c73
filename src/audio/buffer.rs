//! Time-windowed jitter buffer for inbound reply audio
//!
//! Chunks are kept in sequence order and bounded by duration, not count.
//! When a new chunk would push the buffered audio past the window, the oldest
//! chunks are evicted: stale audio is worse than a brief skip. Anything at or
//! below the last rendered sequence number is dropped on arrival. Before the
//! first render, the first admitted sequence number is the floor instead.

use bytes::Bytes;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Reply audio waiting to be rendered (i16 LE mono PCM)
#[derive(Debug, Clone)]
pub struct BufferedChunk {
    pub seq: u64,
    pub pcm: Bytes,
    pub duration: Duration,
}

/// Outcome of [`PlaybackBuffer::push`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admit {
    /// Queued; `evicted` older chunks were dropped to make room
    Queued { evicted: usize },
    /// Sequence at or below the last rendered one, or below the first admitted
    Stale,
    /// Same sequence already buffered
    Duplicate,
}

/// Outcome of [`PlaybackBuffer::pop`]
#[derive(Debug, Clone)]
pub enum Next {
    Chunk(BufferedChunk),
    /// A sequence gap is still inside its grace period
    Wait(Duration),
    Empty,
}

/// Playback buffer statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlaybackStats {
    pub received: u64,
    pub rendered: u64,
    pub evicted: u64,
    pub stale: u64,
    /// Missing sequence numbers given up on
    pub skipped: u64,
}

/// Ordered, duration-bounded queue of reply audio
pub struct PlaybackBuffer {
    chunks: VecDeque<BufferedChunk>,
    window: Duration,
    gap_timeout: Duration,
    sample_rate: u32,
    buffered: Duration,
    last_rendered: Option<u64>,
    /// First admitted sequence; the floor until something renders
    first_admitted: Option<u64>,
    gap_since: Option<Instant>,
    stats: PlaybackStats,
}

impl PlaybackBuffer {
    pub fn new(window: Duration, gap_timeout: Duration, sample_rate: u32) -> Self {
        Self {
            chunks: VecDeque::new(),
            window,
            gap_timeout,
            sample_rate: sample_rate.max(1),
            buffered: Duration::ZERO,
            last_rendered: None,
            first_admitted: None,
            gap_since: None,
            stats: PlaybackStats::default(),
        }
    }

    /// Duration of i16 mono PCM at the buffer's sample rate
    pub fn duration_of(&self, pcm_len: usize) -> Duration {
        let samples = (pcm_len / 2) as u64;
        Duration::from_micros(samples * 1_000_000 / self.sample_rate as u64)
    }

    /// Admit a chunk, evicting from the front until it fits the window
    pub fn push(&mut self, seq: u64, mut pcm: Bytes) -> Admit {
        self.stats.received += 1;

        let stale = match (self.last_rendered, self.first_admitted) {
            (Some(last), _) => seq <= last,
            (None, Some(first)) => seq < first,
            (None, None) => false,
        };
        if stale {
            self.stats.stale += 1;
            return Admit::Stale;
        }

        let position = match self.chunks.binary_search_by_key(&seq, |c| c.seq) {
            Ok(_) => return Admit::Duplicate,
            Err(position) => position,
        };

        let mut duration = self.duration_of(pcm.len());
        if duration > self.window {
            // Keep the freshest tail that fits on its own
            let max_samples = (self.window.as_micros() as u64 * self.sample_rate as u64 / 1_000_000) as usize;
            let keep = max_samples * 2;
            pcm = pcm.slice(pcm.len() - keep..);
            duration = self.duration_of(keep);
        }

        let mut position = position;
        let mut evicted = 0;
        while self.buffered + duration > self.window {
            let Some(oldest) = self.chunks.pop_front() else {
                break;
            };
            self.buffered -= oldest.duration;
            self.stats.evicted += 1;
            evicted += 1;
            position = position.saturating_sub(1);
        }

        self.chunks.insert(position, BufferedChunk { seq, pcm, duration });
        self.buffered += duration;
        self.first_admitted.get_or_insert(seq);
        Admit::Queued { evicted }
    }

    /// Next chunk in sequence order, waiting out short gaps
    pub fn pop(&mut self, now: Instant) -> Next {
        let Some(front) = self.chunks.front() else {
            self.gap_since = None;
            return Next::Empty;
        };

        if let Some(last) = self.last_rendered {
            let expected = last + 1;
            if front.seq > expected {
                let since = *self.gap_since.get_or_insert(now);
                let waited = now.saturating_duration_since(since);
                if waited < self.gap_timeout {
                    return Next::Wait(self.gap_timeout - waited);
                }
                self.stats.skipped += front.seq - expected;
            }
        }

        self.gap_since = None;
        let Some(chunk) = self.chunks.pop_front() else {
            return Next::Empty;
        };
        self.buffered -= chunk.duration;
        self.last_rendered = Some(chunk.seq);
        self.stats.rendered += 1;
        Next::Chunk(chunk)
    }

    /// Drop everything pending; ordering state is kept
    pub fn clear(&mut self) -> usize {
        let dropped = self.chunks.len();
        self.chunks.clear();
        self.buffered = Duration::ZERO;
        self.gap_since = None;
        dropped
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Audio currently buffered
    pub fn buffered(&self) -> Duration {
        self.buffered
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn last_rendered(&self) -> Option<u64> {
        self.last_rendered
    }

    pub fn stats(&self) -> PlaybackStats {
        self.stats.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const RATE: u32 = 24_000;

    /// `ms` milliseconds of silence at 24 kHz
    fn pcm(ms: u64) -> Bytes {
        Bytes::from(vec![0u8; (RATE as u64 * ms / 1000) as usize * 2])
    }

    fn buffer(window_ms: u64) -> PlaybackBuffer {
        PlaybackBuffer::new(
            Duration::from_millis(window_ms),
            Duration::from_millis(50),
            RATE,
        )
    }

    fn pop_seq(buffer: &mut PlaybackBuffer, now: Instant) -> Option<u64> {
        match buffer.pop(now) {
            Next::Chunk(chunk) => Some(chunk.seq),
            _ => None,
        }
    }

    #[test]
    fn test_renders_in_seq_order() {
        let mut buffer = buffer(1000);
        let now = Instant::now();

        buffer.push(1, pcm(20));
        buffer.push(3, pcm(20));
        buffer.push(2, pcm(20));

        assert_eq!(pop_seq(&mut buffer, now), Some(1));
        assert_eq!(pop_seq(&mut buffer, now), Some(2));
        assert_eq!(pop_seq(&mut buffer, now), Some(3));
        assert!(matches!(buffer.pop(now), Next::Empty));
    }

    #[test]
    fn test_stale_after_render_is_dropped() {
        // Arrival order 3, 1, 2, 4: only 3 and 4 are ever rendered
        let mut buffer = buffer(1000);
        let now = Instant::now();
        let mut rendered = Vec::new();

        assert_eq!(buffer.push(3, pcm(20)), Admit::Queued { evicted: 0 });
        rendered.extend(pop_seq(&mut buffer, now));
        assert_eq!(buffer.push(1, pcm(20)), Admit::Stale);
        assert_eq!(buffer.push(2, pcm(20)), Admit::Stale);
        buffer.push(4, pcm(20));
        rendered.extend(pop_seq(&mut buffer, now));

        assert_eq!(rendered, vec![3, 4]);
        assert_eq!(buffer.stats().stale, 2);
    }

    #[test]
    fn test_late_arrivals_below_first_admitted_are_stale() {
        // Same arrival order, nothing rendered in between
        let mut buffer = buffer(1000);
        let now = Instant::now();

        assert_eq!(buffer.push(3, pcm(20)), Admit::Queued { evicted: 0 });
        assert_eq!(buffer.push(1, pcm(20)), Admit::Stale);
        assert_eq!(buffer.push(2, pcm(20)), Admit::Stale);
        assert_eq!(buffer.push(4, pcm(20)), Admit::Queued { evicted: 0 });

        assert_eq!(pop_seq(&mut buffer, now), Some(3));
        assert_eq!(pop_seq(&mut buffer, now), Some(4));
        assert!(matches!(buffer.pop(now), Next::Empty));
        assert_eq!(buffer.stats().stale, 2);
    }

    #[test]
    fn test_full_buffer_evicts_exactly_oldest() {
        let mut buffer = buffer(100);
        for seq in 0..5 {
            assert_eq!(buffer.push(seq, pcm(20)), Admit::Queued { evicted: 0 });
        }
        assert_eq!(buffer.buffered(), Duration::from_millis(100));

        assert_eq!(buffer.push(5, pcm(20)), Admit::Queued { evicted: 1 });
        assert_eq!(buffer.len(), 5);
        assert!(buffer.buffered() <= buffer.window());
        assert_eq!(pop_seq(&mut buffer, Instant::now()), Some(1));
    }

    #[test]
    fn test_duplicate_rejected() {
        let mut buffer = buffer(1000);
        buffer.push(7, pcm(20));
        assert_eq!(buffer.push(7, pcm(20)), Admit::Duplicate);
        assert_eq!(buffer.len(), 1);
    }

    #[test]
    fn test_gap_waits_then_skips() {
        let mut buffer = buffer(1000);
        let start = Instant::now();

        buffer.push(1, pcm(20));
        assert_eq!(pop_seq(&mut buffer, start), Some(1));

        buffer.push(3, pcm(20));
        match buffer.pop(start) {
            Next::Wait(remaining) => assert_eq!(remaining, Duration::from_millis(50)),
            other => panic!("expected wait, got {:?}", other),
        }

        // The missing chunk shows up inside the grace period
        buffer.push(2, pcm(20));
        assert_eq!(pop_seq(&mut buffer, start + Duration::from_millis(10)), Some(2));
        assert_eq!(pop_seq(&mut buffer, start + Duration::from_millis(10)), Some(3));

        buffer.push(6, pcm(20));
        assert!(matches!(buffer.pop(start), Next::Wait(_)));
        assert_eq!(pop_seq(&mut buffer, start + Duration::from_millis(60)), Some(6));
        assert_eq!(buffer.stats().skipped, 2);
    }

    #[test]
    fn test_oversized_chunk_keeps_tail() {
        let mut buffer = buffer(100);
        assert_eq!(buffer.push(1, pcm(250)), Admit::Queued { evicted: 0 });
        assert_eq!(buffer.buffered(), Duration::from_millis(100));
    }

    #[test]
    fn test_clear_keeps_order_state() {
        let mut buffer = buffer(1000);
        buffer.push(1, pcm(20));
        pop_seq(&mut buffer, Instant::now());
        buffer.push(2, pcm(20));
        buffer.push(3, pcm(20));

        assert_eq!(buffer.clear(), 2);
        assert!(buffer.is_empty());
        assert_eq!(buffer.buffered(), Duration::ZERO);
        assert_eq!(buffer.push(1, pcm(20)), Admit::Stale);
    }

    proptest! {
        #[test]
        fn prop_window_bound_and_monotone_render(
            ops in proptest::collection::vec((0u64..64, 1u64..60, any::<bool>()), 1..200)
        ) {
            let mut buffer = buffer(200);
            let mut now = Instant::now();
            let mut last: Option<u64> = None;

            for (seq, ms, render) in ops {
                buffer.push(seq, pcm(ms));
                prop_assert!(buffer.buffered() <= buffer.window());

                if render {
                    now += Duration::from_millis(100);
                    if let Next::Chunk(chunk) = buffer.pop(now) {
                        if let Some(prev) = last {
                            prop_assert!(chunk.seq > prev);
                        }
                        last = Some(chunk.seq);
                    }
                }
            }
        }
    }
}
