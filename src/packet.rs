//! Accumulation of encoded frames into outgoing voice packets.
//!
//! Legacy codecs pack several length-prefixed sub-frames per packet, with
//! the high bit of each length byte flagging a follow-up sub-frame and an
//! empty sub-frame marking the end of a speech burst. Opus packs exactly
//! one encoded frame spanning `frames_per_packet` 10 ms frames.

use crate::codec::AudioCodec;
use crate::settings::{ControlState, LoopMode, Settings, SERVER_LOOPBACK_TARGET};

/// Continuation flag in a legacy sub-frame length byte.
const SUBFRAME_CONTINUATION: u8 = 0x80;

/// One outgoing voice packet, handed to the transport collaborator for wire
/// encoding and send. The payload bytes are opaque codec data.
#[derive(Debug, Clone)]
pub struct AudioPacket {
    /// Voice target or context the packet is addressed to.
    pub target: i32,
    /// Terminator flag: last packet of a contiguous speech burst.
    pub is_last_frame: bool,
    /// 10 ms frames since startup at the first frame in this packet.
    pub frame_number: u64,
    /// Positional audio data, when enabled and available.
    pub position: Option<[f32; 3]>,
    pub codec: AudioCodec,
    pub payload: Vec<u8>,
}

/// Resolve the target id a flushing packet is addressed to.
///
/// A terminator may belong to a whisper burst whose key was already
/// released; the latched previous target routes that final packet. Server
/// loopback overrides everything.
pub fn resolve_target(
    terminator: bool,
    voice_target: i32,
    settings: &Settings,
    ctl: &ControlState,
) -> i32 {
    let mut target = voice_target;
    if terminator {
        let prev = ctl.take_prev_target();
        if prev > 0 {
            target = prev;
        }
    }
    if settings.loop_mode == LoopMode::Server {
        target = SERVER_LOOPBACK_TARGET;
    }
    target
}

/// Collects encoded frames and assembles packets on flush.
pub struct Packetizer {
    frames: Vec<Vec<u8>>,
    buffered_frames: u32,
    frame_counter: u64,
}

impl Packetizer {
    pub fn new() -> Self {
        Self {
            frames: Vec::new(),
            buffered_frames: 0,
            frame_counter: 0,
        }
    }

    /// Count one 10 ms frame entering the pipeline, transmitted or not.
    pub fn begin_frame(&mut self) {
        self.frame_counter += 1;
    }

    /// Account for zero-padded frames appended to a short Opus tail.
    pub fn advance_frames(&mut self, n: u32) {
        self.frame_counter += u64::from(n);
        self.buffered_frames += n;
    }

    /// Long silence elapsed; packets restart from frame number zero.
    pub fn reset_frame_counter(&mut self) {
        self.frame_counter = 0;
    }

    pub fn buffered_frames(&self) -> u32 {
        self.buffered_frames
    }

    /// Count one encoded (or Opus-accumulated) 10 ms frame.
    pub fn note_frame_buffered(&mut self) {
        self.buffered_frames += 1;
    }

    /// Drop the buffered-frame count after an encoder failure so the next
    /// packet's frame number stays consistent with what was actually sent.
    pub fn clear_buffered(&mut self) {
        self.buffered_frames = 0;
    }

    /// Discard everything accumulated (codec switch).
    pub fn discard(&mut self) {
        self.frames.clear();
        self.buffered_frames = 0;
    }

    pub fn push_encoded(&mut self, bytes: Vec<u8>) {
        self.frames.push(bytes);
    }

    /// A packet flushes when the burst just ended or enough frames are
    /// buffered.
    pub fn should_flush(&self, terminator: bool, frames_per_packet: u32) -> bool {
        terminator || self.buffered_frames >= frames_per_packet
    }

    /// Assemble the pending frames into one packet.
    pub fn flush(
        &mut self,
        terminator: bool,
        codec: AudioCodec,
        target: i32,
        position: Option<[f32; 3]>,
    ) -> AudioPacket {
        let frames_in_packet = self.buffered_frames;
        self.buffered_frames = 0;

        let payload = match codec {
            AudioCodec::Opus => {
                // Opus carries exactly one encoded frame per packet
                debug_assert_eq!(self.frames.len(), 1);
                self.frames.pop().unwrap_or_default()
            }
            AudioCodec::CeltAlpha | AudioCodec::CeltBeta => {
                build_legacy_payload(&self.frames, terminator)
            }
        };
        self.frames.clear();

        AudioPacket {
            target,
            is_last_frame: terminator,
            frame_number: self.frame_counter.saturating_sub(u64::from(frames_in_packet)),
            position,
            codec,
            payload,
        }
    }
}

impl Default for Packetizer {
    fn default() -> Self {
        Self::new()
    }
}

/// Concatenate sub-frames with per-sub-frame length headers. The high bit
/// of each length byte announces a following sub-frame; a terminator
/// appends an empty sub-frame to signal end-of-burst.
fn build_legacy_payload(frames: &[Vec<u8>], terminator: bool) -> Vec<u8> {
    let total = frames.len() + usize::from(terminator);
    let mut out = Vec::with_capacity(frames.iter().map(|f| f.len() + 1).sum::<usize>() + 1);
    for (i, frame) in frames.iter().enumerate() {
        debug_assert!(frame.len() < 128, "legacy sub-frame too large");
        let mut head = frame.len() as u8;
        if i + 1 < total {
            head |= SUBFRAME_CONTINUATION;
        }
        out.push(head);
        out.extend_from_slice(frame);
    }
    if terminator {
        out.push(0x00);
    }
    out
}
