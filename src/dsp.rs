//! The per-frame DSP chain: echo cancellation, denoise, AGC, dereverb,
//! voice activity detection and peak metering.
//!
//! Stage order is fixed: raw-mic metering, raw-speaker metering, echo
//! cancellation, neural denoise, speex preprocess, telemetry extraction.
//! The speex states are not thread safe and are reconfigured on settings
//! changes, so the whole chain is owned by the capture worker; other
//! threads request reconfiguration through [`DspChain::request_reset`] and
//! the worker applies it at the next frame boundary.

use anyhow::Result;

use crate::resync::AudioChunk;
use crate::settings::{NoiseCancel, Settings};
use crate::speex::{EchoCanceller, Preprocessor, Resampler};
use crate::{FRAME_SIZE, SAMPLE_RATE};

/// Speex resampler quality for both capture lanes.
pub const RESAMPLER_QUALITY: i32 = 3;

/// Create a mic- or echo-lane resampler at the pipeline's fixed quality.
pub(crate) fn lane_resampler(channels: u32, in_rate: u32) -> Result<Resampler> {
    Resampler::new(channels, in_rate, SAMPLE_RATE, RESAMPLER_QUALITY)
}

/// One processed frame plus the telemetry scalars the UI meters read.
#[derive(Debug)]
pub struct ProcessedFrame {
    /// Cleaned mono PCM, `FRAME_SIZE` samples.
    pub pcm: Vec<i16>,
    /// Raw mic RMS in dBFS, floored at -96.
    pub peak_mic: f32,
    /// Raw mic sample peak.
    pub max_mic: i16,
    /// Raw speaker RMS in dBFS; 0 when no echo reference was present.
    pub peak_speaker: f32,
    /// Processed-signal RMS in dBFS.
    pub peak_signal: f32,
    /// Processed level attenuated by the current AGC gain, floored at -96.
    pub peak_clean_mic: f32,
    /// AGC gain in dB at frame start.
    pub agc_gain: f32,
    /// Speech probability in [0, 1] from the preprocessor VAD.
    pub speech_prob: f32,
}

/// Echo-side geometry, fixed until the mixer is reinitialised.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoLayout {
    /// Number of playback channels delivering the echo reference; 0 = echo off.
    pub channels: usize,
    /// True when the canceller consumes all channels interleaved instead of a
    /// mixed-down mono reference.
    pub multichannel: bool,
    /// Resynchronizer steady-state lag, in frames.
    pub nominal_lag: usize,
}

impl EchoLayout {
    fn speakers(&self) -> usize {
        if self.multichannel {
            self.channels
        } else {
            1
        }
    }
}

pub struct DspChain {
    preprocess: Option<Preprocessor>,
    echo: Option<EchoCanceller>,
    #[cfg(feature = "rnnoise")]
    rnn: Option<Box<nnnoiseless::DenoiseState<'static>>>,
    /// Effective noise canceller after capability downgrades.
    noise_cancel: NoiseCancel,
    layout: EchoLayout,
    needs_reset: bool,
}

impl DspChain {
    pub fn new() -> Self {
        Self {
            preprocess: None,
            echo: None,
            #[cfg(feature = "rnnoise")]
            rnn: None,
            noise_cancel: NoiseCancel::Off,
            layout: EchoLayout::default(),
            needs_reset: true,
        }
    }

    /// Record a new echo-side geometry and schedule a state rebuild.
    pub fn configure(&mut self, layout: EchoLayout) {
        self.layout = layout;
        self.needs_reset = true;
    }

    /// Schedule a state rebuild at the next frame boundary (settings change).
    pub fn request_reset(&mut self) {
        self.needs_reset = true;
    }

    /// True when the next frame will rebuild the preprocessor and echo
    /// state. The caller must also reset the resynchronizer in that case.
    pub fn reset_pending(&self) -> bool {
        self.needs_reset
    }

    /// AGC ramp rate in dB/s: 12 while transmitting, 0 while silent.
    pub fn set_agc_increment(&mut self, db_per_sec: i32) {
        if let Some(pp) = self.preprocess.as_mut() {
            pp.set_agc_increment(db_per_sec);
        }
    }

    fn select_noise_cancel(&mut self, settings: &Settings) {
        let mut effective = settings.noise_cancel_mode;

        if matches!(effective, NoiseCancel::Rnn | NoiseCancel::Both) {
            #[cfg(feature = "rnnoise")]
            {
                if FRAME_SIZE != nnnoiseless::DenoiseState::FRAME_SIZE {
                    log::warn!("dsp: RNNoise needs 480-sample frames, falling back to Speex");
                    effective = NoiseCancel::Speex;
                } else if self.rnn.is_none() {
                    self.rnn = Some(nnnoiseless::DenoiseState::new());
                }
            }
            #[cfg(not(feature = "rnnoise"))]
            {
                log::warn!("dsp: built without RNNoise support, falling back to Speex");
                effective = NoiseCancel::Speex;
            }
        }

        let pp = self.preprocess.as_mut().expect("preprocessor initialised");
        match effective {
            NoiseCancel::Off => {
                log::info!("dsp: noise canceller disabled");
                pp.set_denoise(false);
            }
            NoiseCancel::Speex => {
                log::info!("dsp: using Speex noise canceller");
                pp.set_denoise(true);
                pp.set_noise_suppress(settings.noise_suppress);
            }
            NoiseCancel::Rnn => {
                log::info!("dsp: using RNNoise noise canceller");
                pp.set_denoise(false);
            }
            NoiseCancel::Both => {
                log::info!("dsp: using RNNoise and Speex noise cancellers");
                pp.set_denoise(true);
                pp.set_noise_suppress(settings.noise_suppress);
            }
        }
        self.noise_cancel = effective;
    }

    fn reset_processor(&mut self, settings: &Settings) -> Result<()> {
        let mut pp = Preprocessor::new(FRAME_SIZE, SAMPLE_RATE)?;
        pp.set_vad(true);
        pp.set_agc(true);
        pp.set_dereverb(true);
        pp.set_agc_target(30_000);
        let max_gain = (20.0 * (30_000.0 / settings.min_loudness.max(1) as f32).log10()).floor();
        pp.set_agc_max_gain(max_gain as i32);
        pp.set_agc_decrement(-60);
        self.preprocess = Some(pp);

        self.select_noise_cancel(settings);

        if self.layout.channels > 0 {
            let filter = FRAME_SIZE * (10 + self.layout.nominal_lag);
            let echo = EchoCanceller::new(FRAME_SIZE, filter, self.layout.speakers(), SAMPLE_RATE)?;
            self.preprocess
                .as_mut()
                .expect("preprocessor initialised")
                .set_echo_state(&echo);
            self.echo = Some(echo);
            log::info!(
                "dsp: echo canceller active, {} speaker channel(s), filter {} samples",
                self.layout.speakers(),
                filter
            );
        } else {
            self.echo = None;
        }

        self.needs_reset = false;
        Ok(())
    }

    /// Run the fixed pipeline on one chunk. `chunk.mic` must hold exactly
    /// `FRAME_SIZE` samples.
    pub fn process(&mut self, chunk: AudioChunk, settings: &Settings) -> Result<ProcessedFrame> {
        debug_assert_eq!(chunk.mic.len(), FRAME_SIZE);

        // Raw mic metering before anything touches the samples
        let mut sum = 1.0f32;
        let mut max_mic = 1i16;
        for &s in &chunk.mic {
            sum += f32::from(s) * f32::from(s);
            max_mic = max_mic.max(s.unsigned_abs().min(i16::MAX as u16) as i16);
        }
        let peak_mic = dbfs((sum / FRAME_SIZE as f32).sqrt());

        let peak_speaker = match (&chunk.speaker, self.layout.channels > 0) {
            (Some(speaker), true) => {
                let mut sum = 1.0f32;
                for &s in speaker.iter() {
                    sum += f32::from(s) * f32::from(s);
                }
                dbfs((sum / speaker.len().max(1) as f32).sqrt())
            }
            _ => 0.0,
        };

        if self.needs_reset {
            self.reset_processor(settings)?;
        }

        let pp = self.preprocess.as_mut().expect("preprocessor initialised");
        let agc_gain = pp.agc_gain() as f32;
        if matches!(self.noise_cancel, NoiseCancel::Speex | NoiseCancel::Both) {
            // Suppression strength tracks the gain the AGC is already applying
            pp.set_noise_suppress(settings.noise_suppress - agc_gain as i32);
        }

        let mut pcm = match (&mut self.echo, &chunk.speaker) {
            (Some(echo), Some(speaker)) => {
                let mut clean = vec![0i16; FRAME_SIZE];
                echo.cancel(&chunk.mic, speaker, &mut clean);
                clean
            }
            _ => chunk.mic,
        };

        #[cfg(feature = "rnnoise")]
        if matches!(self.noise_cancel, NoiseCancel::Rnn | NoiseCancel::Both) {
            if let Some(rnn) = self.rnn.as_mut() {
                // RNNoise operates on floats in the 16-bit sample range
                let mut frame = [0.0f32; FRAME_SIZE];
                for (dst, &src) in frame.iter_mut().zip(pcm.iter()) {
                    *dst = f32::from(src);
                }
                let mut denoised = [0.0f32; FRAME_SIZE];
                rnn.process_frame(&mut denoised, &frame);
                for (dst, &src) in pcm.iter_mut().zip(denoised.iter()) {
                    *dst = src.clamp(f32::from(i16::MIN), f32::from(i16::MAX)) as i16;
                }
            }
        }

        let pp = self.preprocess.as_mut().expect("preprocessor initialised");
        pp.run(&mut pcm);

        let mut sum = 1.0f32;
        for &s in &pcm {
            sum += f32::from(s) * f32::from(s);
        }
        let peak_signal = dbfs((sum / FRAME_SIZE as f32).sqrt());
        let speech_prob = pp.speech_prob();
        let peak_clean_mic = (peak_signal - agc_gain).max(-96.0);

        Ok(ProcessedFrame {
            pcm,
            peak_mic,
            max_mic,
            peak_speaker,
            peak_signal,
            peak_clean_mic,
            agc_gain,
            speech_prob,
        })
    }
}

impl Default for DspChain {
    fn default() -> Self {
        Self::new()
    }
}

fn dbfs(rms: f32) -> f32 {
    (20.0 * (rms / 32768.0).log10()).max(-96.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resync::AudioChunk;

    #[test]
    fn silent_frame_meters_at_floor() {
        let mut dsp = DspChain::new();
        let settings = Settings::default();
        let out = dsp
            .process(AudioChunk::mic_only(vec![0i16; FRAME_SIZE]), &settings)
            .expect("process");
        assert_eq!(out.pcm.len(), FRAME_SIZE);
        assert_eq!(out.peak_mic, -96.0);
        assert!(out.speech_prob >= 0.0 && out.speech_prob <= 1.0);
    }

    #[test]
    fn sine_frame_meters_near_expected_level() {
        let mut dsp = DspChain::new();
        let settings = Settings::default();
        let mic: Vec<i16> = (0..FRAME_SIZE)
            .map(|i| {
                let t = i as f32 / SAMPLE_RATE as f32;
                (16384.0 * (2.0 * std::f32::consts::PI * 440.0 * t).sin()) as i16
            })
            .collect();
        let out = dsp.process(AudioChunk::mic_only(mic), &settings).expect("process");
        // Half-scale sine has an RMS of about -9 dBFS
        assert!(out.peak_mic > -12.0 && out.peak_mic < -6.0, "got {}", out.peak_mic);
        assert!(out.max_mic > 16_000);
    }

    #[test]
    fn reset_is_consumed_by_first_frame() {
        let mut dsp = DspChain::new();
        assert!(dsp.reset_pending());
        let settings = Settings::default();
        dsp.process(AudioChunk::mic_only(vec![0i16; FRAME_SIZE]), &settings)
            .expect("process");
        assert!(!dsp.reset_pending());
        dsp.request_reset();
        assert!(dsp.reset_pending());
    }
}
