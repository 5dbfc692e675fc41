//! Bandwidth accounting against the server-imposed ceiling.
//!
//! The network cost of a voice stream is the codec bitrate plus per-packet
//! overhead (IP, UDP, the voice header, optional position, optional TCP
//! tunnelling), amortised over the packets per second that the
//! frames-per-packet setting implies. When the requested quality exceeds
//! the ceiling the governor first coarsens the packetisation, then walks
//! the bitrate down in 1 kbit/s steps, floored at 8 kbit/s.

use crate::settings::Settings;

/// Lowest bitrate the governor will ever fall to, bits/s.
pub const MIN_BITRATE: i32 = 8000;

/// Total bits/s on the wire for a `(bitrate, frames_per_packet)` choice.
pub fn network_bandwidth(bitrate: i32, frames: i32, positional: bool, tcp: bool) -> i32 {
    let mut overhead = 20
        + 8
        + 4
        + 1
        + 2
        + if positional { 12 } else { 0 }
        + if tcp { 12 } else { 0 }
        + frames;
    overhead *= 800 / frames;
    overhead + bitrate
}

/// The encoder parameters the governor settled on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BandwidthBudget {
    pub bitrate: i32,
    pub frames_per_packet: u32,
    pub allow_low_delay: bool,
}

/// Fit the user's requested quality under `ceiling` bits/s (-1 = no limit).
pub fn adjust_bandwidth(ceiling: i32, settings: &Settings) -> BandwidthBudget {
    let mut frames = settings.frames_per_packet.max(1) as i32;
    let mut bitrate = settings.quality;
    let positional = settings.transmit_position;
    let tcp = settings.tcp_compat;

    if ceiling != -1 && network_bandwidth(bitrate, frames, positional, tcp) > ceiling {
        if frames <= 4 && ceiling <= 32_000 {
            frames = 4;
        } else if frames == 1 && ceiling <= 64_000 {
            frames = 2;
        } else if frames == 2 && ceiling <= 48_000 {
            frames = 4;
        }
        if network_bandwidth(bitrate, frames, positional, tcp) > ceiling {
            loop {
                bitrate -= 1000;
                if bitrate <= MIN_BITRATE
                    || network_bandwidth(bitrate, frames, positional, tcp) <= ceiling
                {
                    break;
                }
            }
        }
    }
    if bitrate < MIN_BITRATE {
        bitrate = MIN_BITRATE;
    }

    BandwidthBudget {
        bitrate,
        frames_per_packet: frames as u32,
        allow_low_delay: settings.allow_low_delay,
    }
}
