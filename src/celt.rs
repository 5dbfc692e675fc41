//! Safe wrapper around the legacy libcelt encoder.
//!
//! Compiled only with the `celt` cargo feature; the codec facade falls back
//! to Opus when the library is absent.

use std::ffi::c_int;

use anyhow::Result;

use crate::codec::FrameEncoder;
use crate::{FRAME_SIZE, SAMPLE_RATE};

/// Opaque type for CELTMode
#[repr(C)]
pub struct CeltMode {
    _private: [u8; 0],
}

/// Opaque type for CELTEncoder
#[repr(C)]
pub struct CeltEncoderState {
    _private: [u8; 0],
}

// Encoder request constants, from celt.h
const CELT_SET_PREDICTION_REQUEST: c_int = 4;
const CELT_SET_VBR_RATE_REQUEST: c_int = 6;
const CELT_RESET_STATE_REQUEST: c_int = 8;

unsafe extern "C" {
    fn celt_mode_create(fs: i32, frame_size: c_int, error: *mut c_int) -> *mut CeltMode;
    fn celt_mode_destroy(mode: *mut CeltMode);
    fn celt_encoder_create(
        mode: *const CeltMode,
        channels: c_int,
        error: *mut c_int,
    ) -> *mut CeltEncoderState;
    fn celt_encoder_destroy(st: *mut CeltEncoderState);
    fn celt_encode(
        st: *mut CeltEncoderState,
        pcm: *const i16,
        optional_synthesis: *mut i16,
        compressed: *mut u8,
        nb_compressed_bytes: c_int,
    ) -> c_int;
    fn celt_encoder_ctl(st: *mut CeltEncoderState, request: c_int, ...) -> c_int;
}

/// One CELT encoder session at the canonical rate and frame size.
pub struct CeltFrameEncoder {
    mode: *mut CeltMode,
    state: *mut CeltEncoderState,
}

// The session is confined to the capture worker thread
unsafe impl Send for CeltFrameEncoder {}

impl CeltFrameEncoder {
    pub fn new() -> Result<Self> {
        let mut err: c_int = 0;
        let mode = unsafe { celt_mode_create(SAMPLE_RATE as i32, FRAME_SIZE as c_int, &mut err) };
        if mode.is_null() {
            anyhow::bail!("Failed to create CELT mode: err={}", err);
        }
        let state = unsafe { celt_encoder_create(mode, 1, &mut err) };
        if state.is_null() {
            unsafe { celt_mode_destroy(mode) };
            anyhow::bail!("Failed to create CELT encoder: err={}", err);
        }
        // The transport's sub-frame container cannot tolerate inter-frame
        // prediction; each sub-frame must decode independently.
        unsafe {
            celt_encoder_ctl(state, CELT_SET_PREDICTION_REQUEST, 0 as c_int);
        }
        Ok(Self { mode, state })
    }
}

impl FrameEncoder for CeltFrameEncoder {
    fn encode(&mut self, pcm: &[i16], max_bytes: usize) -> Result<Vec<u8>> {
        debug_assert_eq!(pcm.len(), FRAME_SIZE);
        let mut buf = vec![0u8; max_bytes];
        let len = unsafe {
            celt_encode(
                self.state,
                pcm.as_ptr(),
                std::ptr::null_mut(),
                buf.as_mut_ptr(),
                buf.len() as c_int,
            )
        };
        if len <= 0 {
            anyhow::bail!("CELT encode failed: {}", len);
        }
        buf.truncate(len as usize);
        Ok(buf)
    }

    fn reset(&mut self) -> Result<()> {
        unsafe {
            celt_encoder_ctl(self.state, CELT_RESET_STATE_REQUEST);
        }
        Ok(())
    }

    fn set_bitrate(&mut self, bits_per_sec: i32) -> Result<()> {
        unsafe {
            celt_encoder_ctl(self.state, CELT_SET_VBR_RATE_REQUEST, bits_per_sec as c_int);
        }
        Ok(())
    }
}

impl Drop for CeltFrameEncoder {
    fn drop(&mut self) {
        unsafe {
            celt_encoder_destroy(self.state);
            celt_mode_destroy(self.mode);
        }
    }
}
