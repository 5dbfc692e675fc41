//! ALSA capture backend.
//!
//! Opens a PCM capture device on a dedicated thread and feeds interleaved
//! 16-bit periods into the pipeline's mic lane. Device errors are recovered
//! with a `prepare` and capture continues; the pipeline never sees them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use alsa::pcm::{Access, Format, HwParams, PCM};
use alsa::{Direction, ValueOr};
use anyhow::{Context, Result};

use crate::mixer::SamplePcm;
use crate::pipeline::CapturePipeline;
use crate::registrar::{CaptureBackend, CaptureStream};
use crate::SAMPLE_RATE;

/// Parameters negotiated with the ALSA hardware.
#[derive(Debug, Clone)]
struct AlsaParams {
    sample_rate: u32,
    channels: u32,
    period_size: usize,
}

fn open_capture(device: &str, sample_rate: u32, channels: u32) -> Result<(PCM, AlsaParams)> {
    let pcm = PCM::new(device, Direction::Capture, false)
        .with_context(|| format!("Failed to open PCM device '{}' for capture", device))?;

    {
        let hwp = HwParams::any(&pcm).with_context(|| "Failed to initialize HwParams")?;
        hwp.set_access(Access::RWInterleaved)?;
        hwp.set_format(Format::S16LE)?;
        hwp.set_channels_near(channels)?;
        hwp.set_rate_near(sample_rate, ValueOr::Nearest)?;
        pcm.hw_params(&hwp)?;
    }

    let (actual_rate, actual_channels, period_size) = {
        let hwp = pcm.hw_params_current()?;
        (hwp.get_rate()?, hwp.get_channels()?, hwp.get_period_size()? as usize)
    };

    log::info!(
        "alsa: capture device={}, rate={}, channels={}, period_size={}",
        device,
        actual_rate,
        actual_channels,
        period_size,
    );

    Ok((
        pcm,
        AlsaParams {
            sample_rate: actual_rate,
            channels: actual_channels,
            period_size,
        },
    ))
}

fn capture_loop(device: &str, pipeline: &CapturePipeline, running: &AtomicBool) -> Result<()> {
    let (pcm, params) = open_capture(device, SAMPLE_RATE, 1)?;
    pipeline.set_mic_format(params.channels as usize, params.sample_rate)?;

    let mut read_buf = vec![0i16; params.period_size * params.channels as usize];
    let io = pcm.io_i16()?;

    while running.load(Ordering::Relaxed) {
        match io.readi(&mut read_buf) {
            Ok(frames) => {
                let samples = frames * params.channels as usize;
                pipeline.add_mic(&SamplePcm::Short(&read_buf[..samples]));
            }
            Err(e) => {
                log::warn!("alsa: capture error: {}, recovering...", e);
                if let Err(e2) = pcm.prepare() {
                    log::error!("alsa: failed to recover PCM capture: {}", e2);
                    anyhow::bail!("unrecoverable capture device error");
                }
            }
        }
    }
    Ok(())
}

/// Backend registered under the name `"alsa"`.
pub struct AlsaCaptureBackend {
    device: String,
}

impl AlsaCaptureBackend {
    pub fn new(device: impl Into<String>) -> Self {
        Self {
            device: device.into(),
        }
    }
}

impl Default for AlsaCaptureBackend {
    fn default() -> Self {
        Self::new("default")
    }
}

impl CaptureBackend for AlsaCaptureBackend {
    fn name(&self) -> &'static str {
        "alsa"
    }

    fn priority(&self) -> i32 {
        10
    }

    fn open(&self, pipeline: Arc<CapturePipeline>) -> Result<Box<dyn CaptureStream>> {
        let running = Arc::new(AtomicBool::new(true));
        let thread_running = running.clone();
        let device = self.device.clone();
        let handle = thread::Builder::new()
            .name("alsa-capture".into())
            .spawn(move || {
                if let Err(e) = capture_loop(&device, &pipeline, &thread_running) {
                    log::error!("alsa: capture thread error: {e:#}");
                }
            })?;
        Ok(Box::new(AlsaStream {
            running,
            handle: Some(handle),
        }))
    }
}

struct AlsaStream {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl CaptureStream for AlsaStream {
    fn is_alive(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for AlsaStream {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
