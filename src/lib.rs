//! voicecap - Voice capture pipeline for a low-latency VoIP client.
//!
//! Turns raw microphone PCM (and, optionally, an echo-reference copy of the
//! local playback) into encoded, packetized voice frames handed to a
//! transport collaborator. The pipeline owns the downmix, resampling,
//! mic/speaker resynchronization, echo cancellation, denoise, AGC, voice
//! activity detection, transmission arbitration, codec framing and
//! bandwidth negotiation; devices, transports, UI and settings persistence
//! are collaborators reached through narrow traits.

pub mod bandwidth;
#[cfg(feature = "alsa-backend")]
pub mod backend;
#[cfg(feature = "celt")]
mod celt;
pub mod codec;
pub mod dsp;
pub mod mixer;
pub mod packet;
pub mod pipeline;
pub mod registrar;
pub mod resync;
pub mod settings;
pub mod sinks;
mod speex;
pub mod transmit;

/// Canonical processing rate; every DSP stage and codec runs at 48 kHz.
pub const SAMPLE_RATE: u32 = 48_000;

/// Samples per 10 ms frame at the canonical rate.
pub const FRAME_SIZE: usize = 480;

pub use codec::{AudioCodec, FrameEncoder};
pub use packet::AudioPacket;
pub use pipeline::{CapturePipeline, Telemetry};
pub use resync::{AudioChunk, Resynchronizer};
pub use settings::{ControlState, Settings, SettingsStore};
pub use sinks::Sinks;
