//! Codec selection and the narrow encoder interface the pipeline consumes.
//!
//! The pipeline never talks to a codec library directly; it hands 16-bit PCM
//! to a [`FrameEncoder`] and gets opaque bytes back. The facade owns the
//! encoder instances, decides which codec is active (never switching in the
//! middle of a speech burst) and carries the deferred-reset flag that is
//! raised on codec switches, speech onsets, bitrate changes and processor
//! rebuilds.

use std::sync::atomic::Ordering;

use anyhow::{Context, Result};

use crate::settings::{ControlState, LoopMode, Settings};
use crate::{FRAME_SIZE, SAMPLE_RATE};

/// Upper bound for one encoded packet payload.
const MAX_ENCODED_BYTES: usize = 4000;

/// Wire identifier of the active codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioCodec {
    Opus,
    CeltAlpha,
    CeltBeta,
}

/// Narrow abstract encoder interface; implementations wrap one codec
/// library session.
pub trait FrameEncoder: Send {
    /// Encode PCM (one or more 10 ms frames) into at most `max_bytes` bytes.
    fn encode(&mut self, pcm: &[i16], max_bytes: usize) -> Result<Vec<u8>>;
    /// Drop accumulated codec state (start of a new burst).
    fn reset(&mut self) -> Result<()>;
    /// Target bitrate in bits/s; applied before every encode.
    fn set_bitrate(&mut self, bits_per_sec: i32) -> Result<()>;
}

// ======================== Opus ========================

/// Opus encoder in CBR mode, application hint derived from the configured
/// quality tier.
pub struct OpusFrameEncoder {
    inner: opus::Encoder,
}

impl OpusFrameEncoder {
    pub fn new(quality: i32, allow_low_delay: bool) -> Result<Self> {
        let application = if allow_low_delay && quality >= 64_000 {
            log::info!("codec: Opus encoder set for low delay");
            opus::Application::LowDelay
        } else if quality >= 32_000 {
            log::info!("codec: Opus encoder set for high quality speech");
            opus::Application::Audio
        } else {
            log::info!("codec: Opus encoder set for low quality speech");
            opus::Application::Voip
        };
        let mut inner = opus::Encoder::new(SAMPLE_RATE, opus::Channels::Mono, application)?;
        inner.set_vbr(false)?;
        Ok(Self { inner })
    }
}

impl FrameEncoder for OpusFrameEncoder {
    fn encode(&mut self, pcm: &[i16], max_bytes: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; max_bytes];
        let len = self.inner.encode(pcm, &mut buf)?;
        buf.truncate(len);
        Ok(buf)
    }

    fn reset(&mut self) -> Result<()> {
        self.inner.reset_state()?;
        Ok(())
    }

    fn set_bitrate(&mut self, bits_per_sec: i32) -> Result<()> {
        self.inner.set_bitrate(opus::Bitrate::Bits(bits_per_sec))?;
        Ok(())
    }
}

// ======================== Facade ========================

/// Owns the encoder sessions and the active-codec decision.
pub struct CodecFacade {
    codec: AudioCodec,
    opus: Box<dyn FrameEncoder>,
    celt: Option<(AudioCodec, Box<dyn FrameEncoder>)>,
    reset_pending: bool,
}

impl CodecFacade {
    pub fn new(settings: &Settings, quality: i32) -> Result<Self> {
        Ok(Self {
            codec: AudioCodec::CeltAlpha,
            opus: Box::new(OpusFrameEncoder::new(quality, settings.allow_low_delay)?),
            celt: None,
            reset_pending: true,
        })
    }

    /// Replace the Opus session. Used by tests to inject a deterministic
    /// encoder through the abstract interface.
    pub fn install_opus(&mut self, encoder: Box<dyn FrameEncoder>) {
        self.opus = encoder;
    }

    /// Install a CELT session for the given bitstream variant.
    pub fn install_celt(&mut self, codec: AudioCodec, encoder: Box<dyn FrameEncoder>) {
        debug_assert!(matches!(codec, AudioCodec::CeltAlpha | AudioCodec::CeltBeta));
        self.celt = Some((codec, encoder));
    }

    pub fn codec(&self) -> AudioCodec {
        self.codec
    }

    /// Raise the deferred encoder reset (speech onset, processor rebuild).
    pub fn request_reset(&mut self) {
        self.reset_pending = true;
    }

    /// Decide which codec encodes the next frame. Returns `true` when the
    /// codec changed, in which case the caller must discard any buffered
    /// frames to keep the packet sequence consistent.
    pub fn select(&mut self, settings: &Settings, ctl: &ControlState, was_speech: bool) -> bool {
        let use_opus = if was_speech {
            // Never switch codecs in the middle of a burst
            self.codec == AudioCodec::Opus
        } else {
            (settings.opus && ctl.server_opus.load(Ordering::Relaxed))
                || settings.loop_mode == LoopMode::Local
        };

        let next = if use_opus {
            AudioCodec::Opus
        } else {
            match self.pick_celt(settings, ctl, was_speech) {
                Some(codec) => codec,
                None => {
                    // No usable legacy encoder; Opus is always available
                    if self.codec != AudioCodec::Opus {
                        log::warn!("codec: no CELT encoder available, using Opus");
                    }
                    AudioCodec::Opus
                }
            }
        };

        if next != self.codec {
            log::info!("codec: switching {:?} -> {:?}", self.codec, next);
            self.codec = next;
            self.reset_pending = true;
            return true;
        }
        false
    }

    fn pick_celt(
        &mut self,
        settings: &Settings,
        ctl: &ControlState,
        was_speech: bool,
    ) -> Option<AudioCodec> {
        // Keep the current variant while talking if it is still advertised
        if was_speech {
            if let Some((codec, _)) = &self.celt {
                let version = match codec {
                    AudioCodec::CeltAlpha => ctl.celt_alpha.load(Ordering::Relaxed),
                    _ => ctl.celt_beta.load(Ordering::Relaxed),
                };
                if *codec == self.codec && version != 0 {
                    return Some(*codec);
                }
            }
        }

        let alpha = ctl.celt_alpha.load(Ordering::Relaxed);
        let beta = ctl.celt_beta.load(Ordering::Relaxed);
        let wanted = if settings.prefer_alpha {
            [(AudioCodec::CeltAlpha, alpha), (AudioCodec::CeltBeta, beta)]
        } else {
            [(AudioCodec::CeltBeta, beta), (AudioCodec::CeltAlpha, alpha)]
        };
        let target = wanted.iter().find(|(_, v)| *v != 0).map(|(c, _)| *c)?;

        if let Some((codec, _)) = &self.celt {
            if *codec == target {
                return Some(target);
            }
        }

        #[cfg(feature = "celt")]
        {
            match crate::celt::CeltFrameEncoder::new() {
                Ok(enc) => {
                    self.celt = Some((target, Box::new(enc)));
                    return Some(target);
                }
                Err(e) => {
                    log::warn!("codec: CELT encoder unavailable: {e:#}");
                }
            }
        }

        // An already installed session of the other variant still beats
        // falling back to Opus mid-selection
        self.celt.as_ref().map(|(codec, _)| *codec)
    }

    /// Encode one frame's worth of PCM with the active codec. Returns the
    /// payload bytes and the bitrate to report, computed as
    /// `encoded_bytes * 100 * 8 / ten_ms_frames`.
    pub fn encode(&mut self, pcm: &[i16], quality: i32) -> Result<(Vec<u8>, i32)> {
        let (encoder, cap) = match self.codec {
            AudioCodec::Opus => (&mut self.opus, MAX_ENCODED_BYTES),
            AudioCodec::CeltAlpha | AudioCodec::CeltBeta => {
                let (_, enc) = self
                    .celt
                    .as_mut()
                    .context("CELT selected without an encoder session")?;
                // CELT is driven to a target packet size
                (enc, (quality as usize / (8 * 100)).clamp(1, MAX_ENCODED_BYTES))
            }
        };

        if self.reset_pending {
            encoder.reset()?;
            self.reset_pending = false;
        }
        encoder.set_bitrate(quality)?;

        let bytes = encoder.encode(pcm, cap)?;
        let ten_ms_frames = (pcm.len() / FRAME_SIZE).max(1);
        let bitrate = (bytes.len() * 100 * 8 / ten_ms_frames) as i32;
        Ok((bytes, bitrate))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::Settings;

    /// Deterministic encoder: emits `fill` repeated `len` times.
    pub(crate) struct StubEncoder {
        pub fill: u8,
        pub len: usize,
        pub resets: u32,
    }

    impl FrameEncoder for StubEncoder {
        fn encode(&mut self, _pcm: &[i16], max_bytes: usize) -> Result<Vec<u8>> {
            Ok(vec![self.fill; self.len.min(max_bytes)])
        }

        fn reset(&mut self) -> Result<()> {
            self.resets += 1;
            Ok(())
        }

        fn set_bitrate(&mut self, _bits_per_sec: i32) -> Result<()> {
            Ok(())
        }
    }

    fn facade_with_stub_opus() -> CodecFacade {
        let settings = Settings::default();
        let mut facade = CodecFacade::new(&settings, settings.quality).expect("facade");
        facade.install_opus(Box::new(StubEncoder {
            fill: 0xAA,
            len: 40,
            resets: 0,
        }));
        facade
    }

    #[test]
    fn server_opus_advertisement_selects_opus() {
        let settings = Settings::default();
        let ctl = ControlState::default();
        ctl.server_opus.store(true, Ordering::Relaxed);
        let mut facade = facade_with_stub_opus();
        assert!(facade.select(&settings, &ctl, false));
        assert_eq!(facade.codec(), AudioCodec::Opus);
        // Selecting again is a no-op
        assert!(!facade.select(&settings, &ctl, false));
    }

    #[test]
    fn local_loopback_forces_opus_without_server() {
        let settings = Settings {
            loop_mode: LoopMode::Local,
            ..Settings::default()
        };
        let ctl = ControlState::default();
        let mut facade = facade_with_stub_opus();
        facade.select(&settings, &ctl, false);
        assert_eq!(facade.codec(), AudioCodec::Opus);
    }

    #[test]
    fn installed_celt_wins_when_opus_is_declined() {
        let settings = Settings {
            opus: false,
            ..Settings::default()
        };
        let ctl = ControlState::default();
        ctl.celt_alpha.store(0x8000_000b_u32 as i32, Ordering::Relaxed);
        let mut facade = facade_with_stub_opus();
        facade.install_celt(
            AudioCodec::CeltAlpha,
            Box::new(StubEncoder {
                fill: 0x55,
                len: 20,
                resets: 0,
            }),
        );
        facade.select(&settings, &ctl, false);
        assert_eq!(facade.codec(), AudioCodec::CeltAlpha);
    }

    #[test]
    fn codec_is_stable_while_talking() {
        let settings = Settings {
            opus: false,
            ..Settings::default()
        };
        let ctl = ControlState::default();
        ctl.celt_alpha.store(1, Ordering::Relaxed);
        let mut facade = facade_with_stub_opus();
        facade.install_celt(
            AudioCodec::CeltAlpha,
            Box::new(StubEncoder {
                fill: 0x55,
                len: 20,
                resets: 0,
            }),
        );
        facade.select(&settings, &ctl, false);
        assert_eq!(facade.codec(), AudioCodec::CeltAlpha);
        // Server flips to Opus mid-burst; the variant must not move
        ctl.server_opus.store(true, Ordering::Relaxed);
        let settings = Settings::default();
        assert!(!facade.select(&settings, &ctl, true));
        assert_eq!(facade.codec(), AudioCodec::CeltAlpha);
        // Burst over: switch happens and buffered frames must be discarded
        assert!(facade.select(&settings, &ctl, false));
        assert_eq!(facade.codec(), AudioCodec::Opus);
    }

    #[test]
    fn reported_bitrate_follows_the_payload_size() {
        let settings = Settings::default();
        let ctl = ControlState::default();
        ctl.server_opus.store(true, Ordering::Relaxed);
        let mut facade = facade_with_stub_opus();
        facade.select(&settings, &ctl, false);
        // Two 10 ms frames of PCM, 40 encoded bytes
        let pcm = vec![0i16; 2 * FRAME_SIZE];
        let (bytes, bitrate) = facade.encode(&pcm, settings.quality).expect("encode");
        assert_eq!(bytes.len(), 40);
        assert_eq!(bitrate, 40 * 100 * 8 / 2);
    }

    #[test]
    fn reset_reaches_the_encoder_once() {
        let settings = Settings::default();
        let ctl = ControlState::default();
        ctl.server_opus.store(true, Ordering::Relaxed);
        let mut facade = facade_with_stub_opus();
        facade.select(&settings, &ctl, false);
        let pcm = vec![0i16; FRAME_SIZE];
        facade.encode(&pcm, settings.quality).expect("encode");
        facade.encode(&pcm, settings.quality).expect("encode");
        // The reset raised by the initial selection was consumed exactly once;
        // nothing observable from outside beyond not erroring, so exercise the
        // request path too.
        facade.request_reset();
        facade.encode(&pcm, settings.quality).expect("encode");
    }
}
