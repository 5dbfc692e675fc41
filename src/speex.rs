//! Safe wrappers around SpeexDSP's preprocessor, echo canceller and resampler.

use std::ffi::{c_int, c_void};

// ======================== FFI declarations ========================

/// Opaque type for SpeexPreprocessState
#[repr(C)]
pub struct SpeexPreprocessState {
    _private: [u8; 0],
}

/// Opaque type for SpeexEchoState
#[repr(C)]
pub struct SpeexEchoState {
    _private: [u8; 0],
}

/// Opaque type for SpeexResamplerState
#[repr(C)]
pub struct SpeexResamplerState {
    _private: [u8; 0],
}

// Preprocessor request constants, from speex/speex_preprocess.h
const SPEEX_PREPROCESS_SET_DENOISE: c_int = 0;
const SPEEX_PREPROCESS_SET_AGC: c_int = 2;
const SPEEX_PREPROCESS_SET_VAD: c_int = 4;
const SPEEX_PREPROCESS_SET_DEREVERB: c_int = 8;
const SPEEX_PREPROCESS_SET_NOISE_SUPPRESS: c_int = 18;
const SPEEX_PREPROCESS_SET_ECHO_STATE: c_int = 24;
const SPEEX_PREPROCESS_SET_AGC_INCREMENT: c_int = 26;
const SPEEX_PREPROCESS_SET_AGC_DECREMENT: c_int = 28;
const SPEEX_PREPROCESS_SET_AGC_MAX_GAIN: c_int = 30;
const SPEEX_PREPROCESS_GET_AGC_GAIN: c_int = 35;
const SPEEX_PREPROCESS_GET_PROB: c_int = 45;
const SPEEX_PREPROCESS_SET_AGC_TARGET: c_int = 46;

// Echo canceller request constants, from speex/speex_echo.h
const SPEEX_ECHO_SET_SAMPLING_RATE: c_int = 24;

const RESAMPLER_ERR_SUCCESS: c_int = 0;

unsafe extern "C" {
    fn speex_preprocess_state_init(frame_size: c_int, sampling_rate: c_int)
        -> *mut SpeexPreprocessState;
    fn speex_preprocess_state_destroy(st: *mut SpeexPreprocessState);
    fn speex_preprocess_run(st: *mut SpeexPreprocessState, x: *mut i16) -> c_int;
    fn speex_preprocess_ctl(
        st: *mut SpeexPreprocessState,
        request: c_int,
        ptr: *mut c_void,
    ) -> c_int;

    fn speex_echo_state_init_mc(
        frame_size: c_int,
        filter_length: c_int,
        nb_mic: c_int,
        nb_speakers: c_int,
    ) -> *mut SpeexEchoState;
    fn speex_echo_state_destroy(st: *mut SpeexEchoState);
    fn speex_echo_cancellation(
        st: *mut SpeexEchoState,
        rec: *const i16,
        play: *const i16,
        out: *mut i16,
    );
    fn speex_echo_ctl(st: *mut SpeexEchoState, request: c_int, ptr: *mut c_void) -> c_int;

    fn speex_resampler_init(
        nb_channels: u32,
        in_rate: u32,
        out_rate: u32,
        quality: c_int,
        err: *mut c_int,
    ) -> *mut SpeexResamplerState;
    fn speex_resampler_destroy(st: *mut SpeexResamplerState);
    fn speex_resampler_process_float(
        st: *mut SpeexResamplerState,
        channel_index: u32,
        in_: *const f32,
        in_len: *mut u32,
        out: *mut f32,
        out_len: *mut u32,
    ) -> c_int;
    fn speex_resampler_process_interleaved_float(
        st: *mut SpeexResamplerState,
        in_: *const f32,
        in_len: *mut u32,
        out: *mut f32,
        out_len: *mut u32,
    ) -> c_int;
}

// ======================== Preprocessor ========================

/// Safe wrapper around SpeexPreprocessState: VAD, AGC, dereverb and denoise.
pub struct Preprocessor {
    state: *mut SpeexPreprocessState,
}

// SpeexPreprocessState is used from the capture worker thread only
unsafe impl Send for Preprocessor {}

impl Preprocessor {
    /// Create a new preprocessor for a given frame size (in samples) and sample rate.
    pub fn new(frame_size: usize, sample_rate: u32) -> anyhow::Result<Self> {
        let state =
            unsafe { speex_preprocess_state_init(frame_size as c_int, sample_rate as c_int) };
        if state.is_null() {
            anyhow::bail!("Failed to initialize speex preprocessor");
        }
        Ok(Self { state })
    }

    fn ctl_int(&mut self, request: c_int, value: i32) {
        let mut val: c_int = value;
        unsafe {
            speex_preprocess_ctl(self.state, request, &mut val as *mut c_int as *mut c_void);
        }
    }

    fn get_int(&mut self, request: c_int) -> i32 {
        let mut val: c_int = 0;
        unsafe {
            speex_preprocess_ctl(self.state, request, &mut val as *mut c_int as *mut c_void);
        }
        val
    }

    pub fn set_vad(&mut self, enable: bool) {
        self.ctl_int(SPEEX_PREPROCESS_SET_VAD, enable as i32);
    }

    pub fn set_agc(&mut self, enable: bool) {
        self.ctl_int(SPEEX_PREPROCESS_SET_AGC, enable as i32);
    }

    pub fn set_dereverb(&mut self, enable: bool) {
        self.ctl_int(SPEEX_PREPROCESS_SET_DEREVERB, enable as i32);
    }

    pub fn set_denoise(&mut self, enable: bool) {
        self.ctl_int(SPEEX_PREPROCESS_SET_DENOISE, enable as i32);
    }

    /// Set noise suppress level in dB (negative value, e.g. -30).
    pub fn set_noise_suppress(&mut self, level: i32) {
        self.ctl_int(SPEEX_PREPROCESS_SET_NOISE_SUPPRESS, level);
    }

    /// Set AGC target signal level.
    pub fn set_agc_target(&mut self, level: i32) {
        self.ctl_int(SPEEX_PREPROCESS_SET_AGC_TARGET, level);
    }

    pub fn set_agc_max_gain(&mut self, db: i32) {
        self.ctl_int(SPEEX_PREPROCESS_SET_AGC_MAX_GAIN, db);
    }

    pub fn set_agc_increment(&mut self, db_per_sec: i32) {
        self.ctl_int(SPEEX_PREPROCESS_SET_AGC_INCREMENT, db_per_sec);
    }

    pub fn set_agc_decrement(&mut self, db_per_sec: i32) {
        self.ctl_int(SPEEX_PREPROCESS_SET_AGC_DECREMENT, db_per_sec);
    }

    /// Current AGC gain in dB.
    pub fn agc_gain(&mut self) -> i32 {
        self.get_int(SPEEX_PREPROCESS_GET_AGC_GAIN)
    }

    /// Speech probability of the last processed frame, in [0, 1].
    pub fn speech_prob(&mut self) -> f32 {
        self.get_int(SPEEX_PREPROCESS_GET_PROB) as f32 / 100.0
    }

    /// Attach an echo canceller so residual echo is suppressed as well.
    pub fn set_echo_state(&mut self, echo: &EchoCanceller) {
        unsafe {
            speex_preprocess_ctl(
                self.state,
                SPEEX_PREPROCESS_SET_ECHO_STATE,
                echo.state as *mut c_void,
            );
        }
    }

    /// Run the preprocessor on a frame of 16-bit PCM mono samples, in place.
    /// Returns the raw VAD verdict.
    pub fn run(&mut self, samples: &mut [i16]) -> bool {
        unsafe { speex_preprocess_run(self.state, samples.as_mut_ptr()) != 0 }
    }
}

impl Drop for Preprocessor {
    fn drop(&mut self) {
        unsafe {
            speex_preprocess_state_destroy(self.state);
        }
    }
}

// ======================== Echo canceller ========================

/// Safe wrapper around SpeexEchoState (MDF adaptive filter).
pub struct EchoCanceller {
    state: *mut SpeexEchoState,
    frame_size: usize,
    speakers: usize,
}

unsafe impl Send for EchoCanceller {}

impl EchoCanceller {
    /// Create an echo canceller with one mic channel and `speakers` playback
    /// channels. `filter_length` is in samples per channel.
    pub fn new(
        frame_size: usize,
        filter_length: usize,
        speakers: usize,
        sample_rate: u32,
    ) -> anyhow::Result<Self> {
        let state = unsafe {
            speex_echo_state_init_mc(
                frame_size as c_int,
                filter_length as c_int,
                1,
                speakers as c_int,
            )
        };
        if state.is_null() {
            anyhow::bail!("Failed to initialize speex echo canceller");
        }
        let mut rate: c_int = sample_rate as c_int;
        unsafe {
            speex_echo_ctl(
                state,
                SPEEX_ECHO_SET_SAMPLING_RATE,
                &mut rate as *mut c_int as *mut c_void,
            );
        }
        Ok(Self {
            state,
            frame_size,
            speakers,
        })
    }

    /// Subtract the estimated echo of `speaker` from `mic`, writing the
    /// cleaned frame into `out`. `speaker` holds `frame_size * speakers`
    /// interleaved samples; `mic` and `out` hold `frame_size` samples.
    pub fn cancel(&mut self, mic: &[i16], speaker: &[i16], out: &mut [i16]) {
        debug_assert_eq!(mic.len(), self.frame_size);
        debug_assert_eq!(speaker.len(), self.frame_size * self.speakers);
        debug_assert_eq!(out.len(), self.frame_size);
        unsafe {
            speex_echo_cancellation(self.state, mic.as_ptr(), speaker.as_ptr(), out.as_mut_ptr());
        }
    }
}

impl Drop for EchoCanceller {
    fn drop(&mut self) {
        unsafe {
            speex_echo_state_destroy(self.state);
        }
    }
}

// ======================== Resampler ========================

/// Safe wrapper around SpeexResamplerState, float API.
pub struct Resampler {
    state: *mut SpeexResamplerState,
}

unsafe impl Send for Resampler {}

impl Resampler {
    /// Create a new resampler.
    ///
    /// * `channels` - Number of channels
    /// * `in_rate`  - Input sample rate
    /// * `out_rate` - Output sample rate
    /// * `quality`  - Speex quality level, 0..=10
    pub fn new(channels: u32, in_rate: u32, out_rate: u32, quality: i32) -> anyhow::Result<Self> {
        let mut err: c_int = 0;
        let state =
            unsafe { speex_resampler_init(channels, in_rate, out_rate, quality as c_int, &mut err) };
        if err != RESAMPLER_ERR_SUCCESS || state.is_null() {
            anyhow::bail!("Failed to initialize speex resampler: err={}", err);
        }
        Ok(Self { state })
    }

    /// Resample a single channel of float PCM data.
    ///
    /// Returns `(input_samples_consumed, output_samples_produced)`.
    pub fn process_float(
        &mut self,
        channel: u32,
        input: &[f32],
        output: &mut [f32],
    ) -> anyhow::Result<(u32, u32)> {
        let mut in_len = input.len() as u32;
        let mut out_len = output.len() as u32;
        let err = unsafe {
            speex_resampler_process_float(
                self.state,
                channel,
                input.as_ptr(),
                &mut in_len,
                output.as_mut_ptr(),
                &mut out_len,
            )
        };
        if err != RESAMPLER_ERR_SUCCESS {
            anyhow::bail!("Speex resampler error: {}", err);
        }
        Ok((in_len, out_len))
    }

    /// Resample interleaved multichannel float PCM data. Lengths are in
    /// samples per channel.
    pub fn process_interleaved_float(
        &mut self,
        input: &[f32],
        channels: usize,
        output: &mut [f32],
    ) -> anyhow::Result<(u32, u32)> {
        let mut in_len = (input.len() / channels) as u32;
        let mut out_len = (output.len() / channels) as u32;
        let err = unsafe {
            speex_resampler_process_interleaved_float(
                self.state,
                input.as_ptr(),
                &mut in_len,
                output.as_mut_ptr(),
                &mut out_len,
            )
        };
        if err != RESAMPLER_ERR_SUCCESS {
            anyhow::bail!("Speex resampler error: {}", err);
        }
        Ok((in_len, out_len))
    }
}

impl Drop for Resampler {
    fn drop(&mut self) {
        unsafe {
            speex_resampler_destroy(self.state);
        }
    }
}
