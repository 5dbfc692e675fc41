//! Pairing of independently clocked microphone and speaker streams.
//!
//! The mic and echo-reference callbacks run on separate device threads whose
//! wall-clock rates are not correlated. The echo canceller needs exactly one
//! speaker frame per mic frame, aligned to within a few milliseconds. A
//! plain queue either grows without bound or underruns, so a small state
//! machine tracks the current drift and decides, per arrival, whether to
//! enqueue, pair, or drop.
//!
//! The states encode the depth of the pending-mic FIFO: `S0` is empty, the
//! `S1a`/`S1b` and `S4a`/`S4b` pairs distinguish whether the depth was
//! reached from below or from above, and at `S4b`/`S5` further mic arrivals
//! overflow and evict the oldest queued frame. Speaker frames arriving while
//! nothing is queued are dropped. Steady state oscillates around a two-frame
//! mic lead, which is the nominal lag exported to size the echo filter.

use std::collections::VecDeque;
use std::sync::Mutex;

/// A mic frame paired with its time-aligned echo-reference frame.
///
/// When echo cancellation is off the speaker side is absent and chunks flow
/// straight from the mic lane to the DSP chain.
#[derive(Debug)]
pub struct AudioChunk {
    /// Mono 16-bit PCM, `FRAME_SIZE` samples.
    pub mic: Vec<i16>,
    /// Echo reference, `FRAME_SIZE` samples (or `FRAME_SIZE * channels`
    /// interleaved in multichannel echo mode).
    pub speaker: Option<Vec<i16>>,
}

impl AudioChunk {
    pub fn mic_only(mic: Vec<i16>) -> Self {
        Self { mic, speaker: None }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SyncState {
    S0,
    S1a,
    S1b,
    S2,
    S3,
    S4a,
    S4b,
    S5,
}

struct Inner {
    state: SyncState,
    queue: VecDeque<Vec<i16>>,
}

/// Re-aligns mic and speaker arrivals into [`AudioChunk`] pairs.
///
/// `add_mic`, `add_speaker` and `reset` are serialized by one mutex; no call
/// holds it for longer than a queue push/pop.
pub struct Resynchronizer {
    inner: Mutex<Inner>,
}

impl Default for Resynchronizer {
    fn default() -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: SyncState::S0,
                queue: VecDeque::new(),
            }),
        }
    }
}

impl Resynchronizer {
    /// Accept a mic frame from the capture callback. The frame is queued
    /// until a speaker frame pairs with it; in overflow states the oldest
    /// queued frame is evicted instead.
    pub fn add_mic(&self, mic: Vec<i16>) {
        use SyncState::*;
        let mut dropped = false;
        {
            let mut inner = self.inner.lock().expect("resync mutex");
            inner.queue.push_back(mic);
            match inner.state {
                S0 => inner.state = S1a,
                S1a => inner.state = S2,
                S1b => inner.state = S2,
                S2 => inner.state = S3,
                S3 => inner.state = S4a,
                S4a => inner.state = S5,
                S4b | S5 => dropped = true,
            }
            if dropped {
                inner.queue.pop_front();
            }
        }
        if dropped {
            log::debug!("resynchronizer: dropped microphone frame due to overflow");
        }
    }

    /// Accept an echo-reference frame. Returns a paired chunk when a mic
    /// frame was waiting; drops the speaker frame while the queue is behind.
    pub fn add_speaker(&self, speaker: Vec<i16>) -> Option<AudioChunk> {
        use SyncState::*;
        let result = {
            let mut inner = self.inner.lock().expect("resync mutex");
            match inner.state {
                S0 | S1a => None,
                S1b => {
                    inner.state = S0;
                    inner.queue.pop_front()
                }
                S2 => {
                    inner.state = S1b;
                    inner.queue.pop_front()
                }
                S3 => {
                    inner.state = S2;
                    inner.queue.pop_front()
                }
                S4a | S4b => {
                    inner.state = S3;
                    inner.queue.pop_front()
                }
                S5 => {
                    inner.state = S4b;
                    inner.queue.pop_front()
                }
            }
        };
        match result {
            Some(mic) => Some(AudioChunk {
                mic,
                speaker: Some(speaker),
            }),
            None => {
                log::debug!("resynchronizer: dropped speaker frame due to underrun");
                None
            }
        }
    }

    /// Drain the FIFO and return to the initial state.
    pub fn reset(&self) {
        let mut inner = self.inner.lock().expect("resync mutex");
        inner.state = SyncState::S0;
        inner.queue.clear();
    }

    /// Mic frames currently waiting for a speaker frame.
    pub fn queue_depth(&self) -> usize {
        self.inner.lock().expect("resync mutex").queue.len()
    }

    /// Steady-state mic lead in frames; the echo canceller sizes its filter
    /// as `FRAME_SIZE * (10 + nominal_lag)`.
    pub fn nominal_lag(&self) -> usize {
        2
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(tag: i16) -> Vec<i16> {
        vec![tag; 4]
    }

    #[test]
    fn speaker_before_mic_is_dropped() {
        let r = Resynchronizer::default();
        assert!(r.add_speaker(frame(0)).is_none());
        r.add_mic(frame(1));
        // One queued mic is not yet enough to start pairing
        assert!(r.add_speaker(frame(2)).is_none());
    }

    #[test]
    fn steady_state_pairs_in_fifo_order() {
        let r = Resynchronizer::default();
        r.add_mic(frame(1));
        r.add_mic(frame(2));
        let a = r.add_speaker(frame(10)).expect("pair");
        assert_eq!(a.mic[0], 1);
        assert_eq!(a.speaker.as_deref().unwrap()[0], 10);
        let b = r.add_speaker(frame(11)).expect("pair");
        assert_eq!(b.mic[0], 2);
        assert_eq!(r.queue_depth(), 0);
    }

    #[test]
    fn alternating_arrivals_keep_two_frame_lead() {
        let r = Resynchronizer::default();
        r.add_mic(frame(1));
        r.add_mic(frame(2));
        for i in 3..40 {
            r.add_mic(frame(i));
            assert!(r.add_speaker(frame(100 + i)).is_some());
            assert_eq!(r.queue_depth(), 2);
        }
    }

    #[test]
    fn speaker_stall_drops_oldest_mics() {
        let r = Resynchronizer::default();
        // Reach the post-mic steady point: three mics queued, one behind
        r.add_mic(frame(1));
        r.add_mic(frame(2));
        r.add_mic(frame(3));
        // Speaker pauses for five mic frames
        let before = r.queue_depth();
        for i in 4..9 {
            r.add_mic(frame(i));
        }
        // Depth saturates; three of the five arrivals forced an eviction
        assert_eq!(r.queue_depth(), 5);
        assert_eq!(before + 5 - r.queue_depth(), 3);
        // Pairing resumes; every emitted chunk carries a speaker frame
        for i in 0..5 {
            let chunk = r.add_speaker(frame(50 + i)).expect("pair");
            assert!(chunk.speaker.is_some());
        }
        assert_eq!(r.queue_depth(), 0);
    }

    #[test]
    fn reset_returns_to_initial_state() {
        let r = Resynchronizer::default();
        r.add_mic(frame(1));
        r.add_mic(frame(2));
        r.add_mic(frame(3));
        r.reset();
        assert_eq!(r.queue_depth(), 0);
        // Initial state drops the first speaker frame again
        assert!(r.add_speaker(frame(9)).is_none());
    }

    #[test]
    fn arbitrary_interleavings_stay_bounded() {
        // Deterministic pseudo-random interleaving of mic and speaker arrivals
        let mut lcg = 0x2545f491u64;
        let r = Resynchronizer::default();
        let (mut mics, mut speakers, mut pairs) = (0u32, 0u32, 0u32);
        for _ in 0..10_000 {
            lcg = lcg.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            if lcg & 0x100 != 0 {
                mics += 1;
                r.add_mic(frame(0));
            } else {
                speakers += 1;
                if r.add_speaker(frame(0)).is_some() {
                    pairs += 1;
                }
            }
            assert!(r.queue_depth() <= 5, "queue exceeded bound");
        }
        // Every pair consumed one mic and one speaker arrival
        assert!(pairs <= mics.min(speakers));
    }
}
