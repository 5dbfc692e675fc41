//! The capture pipeline: device-facing input lanes, the resynchronizer, and
//! the worker thread that runs DSP, arbitration, encoding and packetization.
//!
//! Real-time audio lives on dedicated OS threads (NOT async tasks): the
//! backend's mic and speaker callbacks push PCM through [`CapturePipeline::add_mic`]
//! and [`CapturePipeline::add_echo`], which downmix, resample and frame the
//! samples; completed frames cross to the capture worker over a bounded
//! channel. Frames are never waited for on the device threads; when the
//! worker backlogs, frames are dropped with a warning.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use anyhow::Result;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::bandwidth::{adjust_bandwidth, BandwidthBudget};
use crate::codec::{AudioCodec, CodecFacade};
use crate::dsp::{lane_resampler, DspChain, EchoLayout, ProcessedFrame};
use crate::mixer::{Mixer, SamplePcm, ALL_CHANNELS_MASK};
use crate::packet::{resolve_target, Packetizer};
use crate::resync::{AudioChunk, Resynchronizer};
use crate::settings::{ControlState, EchoOption, LoopMode, Settings, SettingsStore};
use crate::sinks::Sinks;
use crate::speex::Resampler;
use crate::transmit::{AudioCue, TransmitArbiter};
use crate::{FRAME_SIZE, SAMPLE_RATE};

/// Completed frames queued between the device threads and the worker.
const CHUNK_QUEUE_DEPTH: usize = 64;

/// Meter values exported to the UI, readable from any thread.
#[derive(Default)]
pub struct Telemetry {
    peak_mic: AtomicU32,
    peak_speaker: AtomicU32,
    peak_signal: AtomicU32,
    peak_clean_mic: AtomicU32,
    agc_gain: AtomicU32,
    speech_prob: AtomicU32,
    bitrate: AtomicI32,
    transmitting: AtomicBool,
}

impl Telemetry {
    fn store_frame(&self, frame: &ProcessedFrame) {
        self.peak_mic.store(frame.peak_mic.to_bits(), Ordering::Relaxed);
        self.peak_speaker.store(frame.peak_speaker.to_bits(), Ordering::Relaxed);
        self.peak_signal.store(frame.peak_signal.to_bits(), Ordering::Relaxed);
        self.peak_clean_mic.store(frame.peak_clean_mic.to_bits(), Ordering::Relaxed);
        self.agc_gain.store(frame.agc_gain.to_bits(), Ordering::Relaxed);
        self.speech_prob.store(frame.speech_prob.to_bits(), Ordering::Relaxed);
    }

    fn set_bitrate(&self, bits_per_sec: i32) {
        self.bitrate.store(bits_per_sec, Ordering::Relaxed);
    }

    fn set_transmitting(&self, on: bool) {
        self.transmitting.store(on, Ordering::Relaxed);
    }

    pub fn peak_mic(&self) -> f32 {
        f32::from_bits(self.peak_mic.load(Ordering::Relaxed))
    }

    pub fn peak_speaker(&self) -> f32 {
        f32::from_bits(self.peak_speaker.load(Ordering::Relaxed))
    }

    pub fn peak_signal(&self) -> f32 {
        f32::from_bits(self.peak_signal.load(Ordering::Relaxed))
    }

    pub fn peak_clean_mic(&self) -> f32 {
        f32::from_bits(self.peak_clean_mic.load(Ordering::Relaxed))
    }

    pub fn agc_gain(&self) -> f32 {
        f32::from_bits(self.agc_gain.load(Ordering::Relaxed))
    }

    pub fn speech_prob(&self) -> f32 {
        f32::from_bits(self.speech_prob.load(Ordering::Relaxed))
    }

    /// Reported bitrate: `encoded_bytes * 100 * 8 / frames_encoded`, zero
    /// while silent.
    pub fn bitrate(&self) -> i32 {
        self.bitrate.load(Ordering::Relaxed)
    }

    pub fn is_transmitting(&self) -> bool {
        self.transmitting.load(Ordering::Relaxed)
    }
}

/// State shared between the pipeline handle, its lanes and the worker.
pub(crate) struct PipelineShared {
    running: AtomicBool,
    /// A settings or format change happened; rebuild the DSP state at the
    /// next frame boundary. The worker observes at most one swap per frame.
    needs_reset: AtomicBool,
    echo_channels: AtomicUsize,
    echo_multi: AtomicBool,
    quality: AtomicI32,
    frames_per_packet: AtomicU32,
}

impl PipelineShared {
    fn new(budget: BandwidthBudget) -> Self {
        Self {
            running: AtomicBool::new(true),
            needs_reset: AtomicBool::new(true),
            echo_channels: AtomicUsize::new(0),
            echo_multi: AtomicBool::new(false),
            quality: AtomicI32::new(budget.bitrate),
            frames_per_packet: AtomicU32::new(budget.frames_per_packet),
        }
    }
}

// ======================== Input lanes ========================

/// One device-facing accumulation lane: collects arbitrary-length callback
/// buffers, downmixes (or keeps interleaved for multichannel echo),
/// resamples to the canonical rate and emits exact `FRAME_SIZE` frames.
struct InputLane {
    mixer: Mixer,
    resampler: Option<Resampler>,
    channels: usize,
    /// Keep all channels interleaved instead of downmixing (multichannel echo).
    interleaved: bool,
    /// Accumulated float samples at the device rate.
    buf: Vec<f32>,
    /// Fill level in per-channel samples.
    filled: usize,
    /// Device samples per channel per 10 ms frame.
    lane_len: usize,
    /// Output width: 1 for downmixed lanes, `channels` for interleaved.
    width: usize,
}

impl InputLane {
    fn new(channels: usize, rate: u32, mask: u64, interleaved: bool) -> Result<Self> {
        let width = if interleaved { channels } else { 1 };
        let lane_len = FRAME_SIZE * rate as usize / SAMPLE_RATE as usize;
        let resampler = if rate != SAMPLE_RATE {
            Some(lane_resampler(width as u32, rate)?)
        } else {
            None
        };
        Ok(Self {
            mixer: Mixer::new(channels, mask),
            resampler,
            channels,
            interleaved,
            buf: vec![0.0; lane_len * width],
            filled: 0,
            lane_len,
            width,
        })
    }

    /// Feed one callback buffer, invoking `emit` for every completed frame.
    fn push(&mut self, pcm: &SamplePcm<'_>, mut emit: impl FnMut(Vec<i16>)) -> Result<()> {
        let mut remaining = pcm.len() / self.channels;
        let mut offset = 0;
        while remaining > 0 {
            let take = remaining.min(self.lane_len - self.filled);
            let src = pcm.slice(offset * self.channels, (offset + take) * self.channels);
            if self.interleaved {
                copy_to_float(
                    &mut self.buf[self.filled * self.width..(self.filled + take) * self.width],
                    &src,
                );
            } else {
                self.mixer.mix(&mut self.buf[self.filled..self.filled + take], &src);
            }
            self.filled += take;
            offset += take;
            remaining -= take;

            if self.filled == self.lane_len {
                self.filled = 0;
                emit(self.finish_frame()?);
            }
        }
        Ok(())
    }

    fn finish_frame(&mut self) -> Result<Vec<i16>> {
        let out_len = FRAME_SIZE * self.width;
        let mut out = vec![0i16; out_len];
        let resampled;
        let floats: &[f32] = match self.resampler.as_mut() {
            Some(rs) => {
                let mut scratch = vec![0.0f32; out_len];
                if self.width == 1 {
                    rs.process_float(0, &self.buf, &mut scratch)?;
                } else {
                    rs.process_interleaved_float(&self.buf, self.width, &mut scratch)?;
                }
                resampled = scratch;
                &resampled
            }
            None => &self.buf,
        };
        for (dst, &src) in out.iter_mut().zip(floats.iter()) {
            *dst = (src * 32768.0).clamp(-32768.0, 32767.0) as i16;
        }
        Ok(out)
    }
}

fn copy_to_float(dst: &mut [f32], src: &SamplePcm<'_>) {
    match src {
        SamplePcm::Float(s) => dst.copy_from_slice(s),
        SamplePcm::Short(s) => {
            for (d, &v) in dst.iter_mut().zip(s.iter()) {
                *d = f32::from(v) * (1.0 / 32768.0);
            }
        }
    }
}

// ======================== Frame processor ========================

/// The capture-thread body: DSP chain, transmission arbiter, codec facade
/// and packetizer, driven one chunk at a time.
///
/// Exposed so tests (and embedders with their own thread model) can drive
/// frames synchronously; [`CapturePipeline`] wraps it in a worker thread.
pub struct FrameProcessor {
    settings: SettingsStore,
    ctl: Arc<ControlState>,
    sinks: Sinks,
    shared: Arc<PipelineShared>,
    resync: Arc<Resynchronizer>,
    telemetry: Arc<Telemetry>,
    dsp: DspChain,
    arbiter: TransmitArbiter,
    facade: CodecFacade,
    packetizer: Packetizer,
    opus_pcm: Vec<i16>,
    last_quality: i32,
}

impl FrameProcessor {
    /// Standalone constructor; computes the bandwidth budget from the
    /// current settings and ceiling.
    pub fn new(settings: SettingsStore, ctl: Arc<ControlState>, sinks: Sinks) -> Result<Self> {
        let snapshot = settings.lock().expect("settings mutex").clone();
        let budget = adjust_bandwidth(ctl.max_bandwidth.load(Ordering::Relaxed), &snapshot);
        let shared = Arc::new(PipelineShared::new(budget));
        Self::with_parts(
            settings,
            ctl,
            sinks,
            shared,
            Arc::new(Resynchronizer::default()),
            Arc::new(Telemetry::default()),
        )
    }

    pub(crate) fn with_parts(
        settings: SettingsStore,
        ctl: Arc<ControlState>,
        sinks: Sinks,
        shared: Arc<PipelineShared>,
        resync: Arc<Resynchronizer>,
        telemetry: Arc<Telemetry>,
    ) -> Result<Self> {
        let snapshot = settings.lock().expect("settings mutex").clone();
        let quality = shared.quality.load(Ordering::Relaxed);
        let facade = CodecFacade::new(&snapshot, quality)?;
        Ok(Self {
            settings,
            ctl,
            sinks,
            shared,
            resync,
            telemetry,
            dsp: DspChain::new(),
            arbiter: TransmitArbiter::new(),
            facade,
            packetizer: Packetizer::new(),
            opus_pcm: Vec::with_capacity(FRAME_SIZE * 8),
            last_quality: quality,
        })
    }

    /// Access the codec facade, e.g. to install encoder sessions.
    pub fn facade_mut(&mut self) -> &mut CodecFacade {
        &mut self.facade
    }

    pub fn telemetry(&self) -> &Telemetry {
        &self.telemetry
    }

    /// Schedule a DSP-state rebuild before the next frame.
    pub fn request_reset(&self) {
        self.shared.needs_reset.store(true, Ordering::Relaxed);
    }

    /// Process one paired chunk. Per-frame failures are logged and the
    /// frame dropped; each frame is independent.
    pub fn process_chunk(&mut self, chunk: AudioChunk) {
        if let Err(e) = self.try_process(chunk) {
            log::error!("capture: frame processing failed: {e:#}");
        }
    }

    fn try_process(&mut self, chunk: AudioChunk) -> Result<()> {
        // One immutable snapshot per frame; the arbiter and packetizer must
        // not observe mid-frame settings changes.
        let settings = self.settings.lock().expect("settings mutex").clone();
        let voice_target = self.ctl.voice_target.load(Ordering::Relaxed);

        if self.shared.needs_reset.swap(false, Ordering::Relaxed) {
            self.dsp.configure(EchoLayout {
                channels: self.shared.echo_channels.load(Ordering::Relaxed),
                multichannel: self.shared.echo_multi.load(Ordering::Relaxed),
                nominal_lag: self.resync.nominal_lag(),
            });
        }
        let processor_rebuilt = self.dsp.reset_pending();
        if processor_rebuilt {
            self.resync.reset();
        }

        self.packetizer.begin_frame();

        let frame = self.dsp.process(chunk, &settings)?;
        let verdict = self.arbiter.decide(&frame, &settings, &self.ctl);
        self.telemetry.store_frame(&frame);
        self.telemetry.set_transmitting(verdict.is_speech);

        if processor_rebuilt {
            self.facade.request_reset();
        }

        if let Some(cue) = verdict.audio_cue {
            let path = match cue {
                AudioCue::On => &settings.cue_on_path,
                AudioCue::Off => &settings.cue_off_path,
            };
            self.sinks.output.play_sample(path);
        }
        if verdict.mute_cue {
            self.sinks.output.play_sample(&settings.mute_cue_path);
        }
        if let Some(intent) = verdict.idle_intent {
            self.sinks.notifier.idle_intent(intent);
        }
        if verdict.reset_frame_counter {
            self.packetizer.reset_frame_counter();
        }

        if !verdict.transmit() {
            self.telemetry.set_bitrate(0);
            self.dsp.set_agc_increment(0);
            return Ok(());
        }
        self.dsp.set_agc_increment(12);

        if verdict.encoder_reset {
            self.facade.request_reset();
        }

        if self.facade.select(&settings, &self.ctl, verdict.was_speech) {
            // Codec switched between bursts; pending frames no longer match
            self.packetizer.discard();
            self.opus_pcm.clear();
        }

        let quality = self.shared.quality.load(Ordering::Relaxed);
        let frames_per_packet = self.shared.frames_per_packet.load(Ordering::Relaxed).max(1);
        if quality != self.last_quality {
            // Bitrate changed (bandwidth governor); start the encoder clean
            self.facade.request_reset();
            self.last_quality = quality;
        }

        let mut encoded = None;
        match self.facade.codec() {
            AudioCodec::CeltAlpha | AudioCodec::CeltBeta => {
                match self.facade.encode(&frame.pcm, quality) {
                    Ok((bytes, bitrate)) => {
                        self.telemetry.set_bitrate(bitrate);
                        self.packetizer.note_frame_buffered();
                        encoded = Some(bytes);
                    }
                    Err(e) => {
                        self.telemetry.set_bitrate(0);
                        log::warn!("capture: CELT encode failed: {e:#}");
                        return Ok(());
                    }
                }
            }
            AudioCodec::Opus => {
                self.opus_pcm.extend_from_slice(&frame.pcm);
                self.packetizer.note_frame_buffered();

                if verdict.terminator()
                    || self.packetizer.buffered_frames() >= frames_per_packet
                {
                    let buffered = self.packetizer.buffered_frames();
                    if buffered < frames_per_packet {
                        // A burst ended mid-packet: pad with silence so every
                        // packet spans the same number of 10 ms frames and the
                        // receiver never sees a codec reconfiguration.
                        let missing = frames_per_packet - buffered;
                        self.opus_pcm
                            .resize(self.opus_pcm.len() + missing as usize * FRAME_SIZE, 0);
                        self.packetizer.advance_frames(missing);
                    }

                    match self.facade.encode(&self.opus_pcm, quality) {
                        Ok((bytes, bitrate)) => {
                            self.telemetry.set_bitrate(bitrate);
                            encoded = Some(bytes);
                        }
                        Err(e) => {
                            self.telemetry.set_bitrate(0);
                            // These frames are lost; keep the sequence counter
                            // consistent with what actually left the pipeline
                            self.packetizer.clear_buffered();
                            log::warn!("capture: Opus encode failed: {e:#}");
                        }
                    }
                    self.opus_pcm.clear();
                    if encoded.is_none() {
                        return Ok(());
                    }
                }
            }
        }

        if let Some(bytes) = encoded {
            self.packetizer.push_encoded(bytes);
            self.flush_check(verdict.terminator(), voice_target, &settings, frames_per_packet);
        }

        if verdict.terminator() {
            self.telemetry.set_bitrate(0);
        }
        Ok(())
    }

    fn flush_check(
        &mut self,
        terminator: bool,
        voice_target: i32,
        settings: &Settings,
        frames_per_packet: u32,
    ) {
        if !self.packetizer.should_flush(terminator, frames_per_packet) {
            return;
        }

        let target = resolve_target(terminator, voice_target, settings, &self.ctl);
        let position = if settings.transmit_position {
            self.sinks.positional.as_ref().and_then(|p| p.fetch())
        } else {
            None
        };
        let packet = self
            .packetizer
            .flush(terminator, self.facade.codec(), target, position);

        if let Some(recorder) = &self.sinks.recorder {
            recorder.add_frame(&packet);
        }
        if settings.loop_mode == LoopMode::Local {
            self.sinks.loopback.send(packet);
        } else {
            self.sinks.transport.send(packet);
        }
    }
}

// ======================== Pipeline handle ========================

/// The running capture pipeline: owns the worker thread and the two input
/// lanes, and is the object capture backends feed.
pub struct CapturePipeline {
    shared: Arc<PipelineShared>,
    ctl: Arc<ControlState>,
    settings: SettingsStore,
    resync: Arc<Resynchronizer>,
    telemetry: Arc<Telemetry>,
    mic: Mutex<Option<InputLane>>,
    echo: Mutex<Option<InputLane>>,
    chunk_tx: Mutex<Option<mpsc::Sender<AudioChunk>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl CapturePipeline {
    /// Build the processing chain and spawn the capture worker thread.
    pub fn start(
        settings: SettingsStore,
        ctl: Arc<ControlState>,
        sinks: Sinks,
    ) -> Result<Arc<Self>> {
        let snapshot = settings.lock().expect("settings mutex").clone();
        let budget = adjust_bandwidth(ctl.max_bandwidth.load(Ordering::Relaxed), &snapshot);
        let shared = Arc::new(PipelineShared::new(budget));
        let resync = Arc::new(Resynchronizer::default());
        let telemetry = Arc::new(Telemetry::default());

        log::info!(
            "capture: starting at {} bits/s, {} frames/packet, {} hz",
            budget.bitrate,
            budget.frames_per_packet,
            SAMPLE_RATE
        );

        let (chunk_tx, mut chunk_rx) = mpsc::channel::<AudioChunk>(CHUNK_QUEUE_DEPTH);

        let mut processor = FrameProcessor::with_parts(
            settings.clone(),
            ctl.clone(),
            sinks,
            shared.clone(),
            resync.clone(),
            telemetry.clone(),
        )?;

        let worker_shared = shared.clone();
        let worker = thread::Builder::new()
            .name("voice-capture".into())
            .spawn(move || {
                while let Some(chunk) = chunk_rx.blocking_recv() {
                    if !worker_shared.running.load(Ordering::Relaxed) {
                        break;
                    }
                    processor.process_chunk(chunk);
                }
                log::info!("capture: worker stopped");
            })?;

        Ok(Arc::new(Self {
            shared,
            ctl,
            settings,
            resync,
            telemetry,
            mic: Mutex::new(None),
            echo: Mutex::new(None),
            chunk_tx: Mutex::new(Some(chunk_tx)),
            worker: Mutex::new(Some(worker)),
        }))
    }

    /// Declare the mic stream format. Called by the backend before the
    /// first `add_mic`, and again whenever the device renegotiates.
    pub fn set_mic_format(&self, channels: usize, rate: u32) -> Result<()> {
        let mask = self
            .settings
            .lock()
            .expect("settings mutex")
            .audio_input_channel_mask;
        let lane = InputLane::new(channels, rate, mask, false)?;
        *self.mic.lock().expect("mic lane mutex") = Some(lane);
        self.shared.needs_reset.store(true, Ordering::Relaxed);
        log::info!(
            "capture: initialized mixer for {channels} channel {rate} hz mic{}",
            if mask != ALL_CHANNELS_MASK {
                format!(", channel mask {mask:#x}")
            } else {
                String::new()
            }
        );
        Ok(())
    }

    /// Declare the echo-reference stream format; `channels == 0` disables
    /// the echo path.
    pub fn set_echo_format(&self, channels: usize, rate: u32) -> Result<()> {
        if channels == 0 {
            *self.echo.lock().expect("echo lane mutex") = None;
            self.shared.echo_channels.store(0, Ordering::Relaxed);
            self.shared.needs_reset.store(true, Ordering::Relaxed);
            return Ok(());
        }
        let multi = {
            let settings = self.settings.lock().expect("settings mutex");
            settings.echo_option == EchoOption::SpeexMultichannel
        };
        // The echo reference has no channel-mask setting; mix all channels
        let lane = InputLane::new(channels, rate, ALL_CHANNELS_MASK, multi)?;
        *self.echo.lock().expect("echo lane mutex") = Some(lane);
        self.shared.echo_channels.store(channels, Ordering::Relaxed);
        self.shared.echo_multi.store(multi, Ordering::Relaxed);
        self.shared.needs_reset.store(true, Ordering::Relaxed);
        log::info!(
            "capture: initialized mixer for {channels} channel {rate} hz echo{}",
            if multi { " (multichannel)" } else { "" }
        );
        Ok(())
    }

    /// Mic device callback entry point.
    pub fn add_mic(&self, pcm: &SamplePcm<'_>) {
        if !self.shared.running.load(Ordering::Relaxed) {
            return;
        }
        let mut guard = self.mic.lock().expect("mic lane mutex");
        let Some(lane) = guard.as_mut() else {
            log::warn!("capture: add_mic before set_mic_format");
            return;
        };
        let echo_on = self.shared.echo_channels.load(Ordering::Relaxed) > 0;
        let result = lane.push(pcm, |frame| {
            if echo_on {
                self.resync.add_mic(frame);
            } else {
                self.send_chunk(AudioChunk::mic_only(frame));
            }
        });
        if let Err(e) = result {
            log::error!("capture: mic lane error: {e:#}");
        }
    }

    /// Speaker (echo reference) callback entry point.
    pub fn add_echo(&self, pcm: &SamplePcm<'_>) {
        if !self.shared.running.load(Ordering::Relaxed) {
            return;
        }
        let mut guard = self.echo.lock().expect("echo lane mutex");
        let Some(lane) = guard.as_mut() else {
            log::warn!("capture: add_echo before set_echo_format");
            return;
        };
        let result = lane.push(pcm, |frame| {
            if let Some(chunk) = self.resync.add_speaker(frame) {
                self.send_chunk(chunk);
            }
        });
        if let Err(e) = result {
            log::error!("capture: echo lane error: {e:#}");
        }
    }

    fn send_chunk(&self, chunk: AudioChunk) {
        let guard = self.chunk_tx.lock().expect("chunk channel mutex");
        if let Some(tx) = guard.as_ref() {
            match tx.try_send(chunk) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    log::warn!("capture: worker backlogged, dropping frame");
                }
                Err(TrySendError::Closed(_)) => {}
            }
        }
    }

    /// Notify the pipeline that the settings store changed: recompute the
    /// bandwidth budget and rebuild the DSP state at the next frame.
    pub fn settings_changed(&self) {
        let snapshot = self.settings.lock().expect("settings mutex").clone();
        let budget = adjust_bandwidth(self.ctl.max_bandwidth.load(Ordering::Relaxed), &snapshot);
        self.shared.quality.store(budget.bitrate, Ordering::Relaxed);
        self.shared
            .frames_per_packet
            .store(budget.frames_per_packet, Ordering::Relaxed);
        self.shared.needs_reset.store(true, Ordering::Relaxed);
    }

    pub fn telemetry(&self) -> &Telemetry {
        &self.telemetry
    }

    /// True while a speech burst is being transmitted.
    pub fn is_transmitting(&self) -> bool {
        self.telemetry.is_transmitting()
    }

    /// Signal shutdown and join the worker. In-flight frames are discarded;
    /// queued buffers are released by the channel and resynchronizer drops.
    pub fn stop(&self) {
        self.shared.running.store(false, Ordering::SeqCst);
        self.chunk_tx.lock().expect("chunk channel mutex").take();
        if let Some(handle) = self.worker.lock().expect("worker mutex").take() {
            let _ = handle.join();
        }
    }
}

impl Drop for CapturePipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Apply a server bandwidth ceiling. With a live pipeline the new budget
/// takes effect at the next frame; otherwise the capture path is restarted
/// through the output collaborator so a fresh pipeline picks it up.
pub fn set_max_bandwidth(
    bits_per_sec: i32,
    pipeline: Option<&CapturePipeline>,
    settings: &SettingsStore,
    ctl: &ControlState,
    sinks: &Sinks,
) {
    if bits_per_sec == ctl.max_bandwidth.load(Ordering::Relaxed) {
        return;
    }
    let snapshot = settings.lock().expect("settings mutex").clone();
    let budget = adjust_bandwidth(bits_per_sec, &snapshot);
    ctl.max_bandwidth.store(bits_per_sec, Ordering::Relaxed);

    if bits_per_sec != -1
        && (budget.bitrate != snapshot.quality
            || budget.frames_per_packet != snapshot.frames_per_packet)
    {
        sinks.notifier.notify(&format!(
            "Server maximum network bandwidth is only {} kbit/s. \
             Audio quality auto-adjusted to {} kbit/s ({} ms)",
            bits_per_sec / 1000,
            budget.bitrate / 1000,
            budget.frames_per_packet * 10
        ));
    }

    match pipeline {
        Some(p) => {
            p.shared.quality.store(budget.bitrate, Ordering::Relaxed);
            p.shared
                .frames_per_packet
                .store(budget.frames_per_packet, Ordering::Relaxed);
        }
        None => {
            sinks.output.stop_input();
            sinks.output.start_input();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lane_emits_exact_frames_from_odd_buffers() {
        let mut lane = InputLane::new(1, SAMPLE_RATE, ALL_CHANNELS_MASK, false).expect("lane");
        let mut frames = Vec::new();
        // 480 + 480 samples delivered as 3 odd-sized buffers
        let chunk_a = vec![0.25f32; 300];
        let chunk_b = vec![0.25f32; 500];
        let chunk_c = vec![0.25f32; 160];
        for chunk in [&chunk_a, &chunk_b, &chunk_c] {
            lane.push(&SamplePcm::Float(chunk), |f| frames.push(f)).expect("push");
        }
        assert_eq!(frames.len(), 2);
        assert!(frames.iter().all(|f| f.len() == FRAME_SIZE));
        assert_eq!(frames[0][0], (0.25f32 * 32768.0) as i16);
    }

    #[test]
    fn stereo_lane_downmixes_before_framing() {
        let mut lane = InputLane::new(2, SAMPLE_RATE, ALL_CHANNELS_MASK, false).expect("lane");
        let mut frames = Vec::new();
        let src: Vec<i16> = (0..FRAME_SIZE).flat_map(|_| [8192i16, -8192]).collect();
        lane.push(&SamplePcm::Short(&src), |f| frames.push(f)).expect("push");
        assert_eq!(frames.len(), 1);
        // Opposite-phase channels cancel
        assert!(frames[0].iter().all(|&s| s == 0));
    }

    #[test]
    fn interleaved_lane_preserves_channels() {
        let mut lane = InputLane::new(2, SAMPLE_RATE, ALL_CHANNELS_MASK, true).expect("lane");
        let mut frames = Vec::new();
        let src: Vec<i16> = (0..FRAME_SIZE).flat_map(|_| [8192i16, -8192]).collect();
        lane.push(&SamplePcm::Short(&src), |f| frames.push(f)).expect("push");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].len(), 2 * FRAME_SIZE);
        assert_eq!(frames[0][0], 8192);
        assert_eq!(frames[0][1], -8192);
    }

    #[test]
    fn resampling_lane_still_emits_frame_size() {
        let mut lane = InputLane::new(1, 44_100, ALL_CHANNELS_MASK, false).expect("lane");
        let mut frames = Vec::new();
        // One 10 ms frame at 44.1 kHz is 441 samples
        let src = vec![0.1f32; 441];
        lane.push(&SamplePcm::Float(&src), |f| frames.push(f)).expect("push");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].len(), FRAME_SIZE);
    }
}
