//! User settings and shared control-plane state.
//!
//! The capture pipeline never reads live settings mid-frame: the worker
//! clones an immutable [`Settings`] snapshot at the start of every frame and
//! passes it by value through the DSP chain and the transmission arbiter.
//! Fast-changing control signals (voice target, push-to-talk, server
//! capabilities) live in [`ControlState`] as atomics.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use config::{Config as ConfigLoader, Environment, File};
use serde::{Deserialize, Serialize};

/// How the decision to transmit a frame is made.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransmitMode {
    Continuous,
    VoiceActivity,
    PushToTalk,
}

/// Where encoded packets are routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopMode {
    None,
    Local,
    Server,
}

/// Which noise canceller runs on the cleaned mic signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoiseCancel {
    Off,
    Speex,
    Rnn,
    Both,
}

/// Echo cancellation mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EchoOption {
    Off,
    SpeexMixed,
    SpeexMultichannel,
}

/// Which scalar drives the voice-activity hysteresis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VadMetric {
    SignalToNoise,
    Amplitude,
}

/// What to do after `idle_time` seconds of continuous silence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdleAction {
    Nothing,
    Deafen,
    Mute,
}

/// User preferences consumed by the capture pipeline.
///
/// `complexity`, `jitter_buffer_size`, `push_click` and `reconnect` are
/// recognised but consumed by collaborators (output pipeline, UI) rather
/// than by the capture path itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub transmit_mode: TransmitMode,
    pub loop_mode: LoopMode,
    pub noise_cancel_mode: NoiseCancel,
    pub echo_option: EchoOption,

    pub vad_metric: VadMetric,
    /// Voice-deactivation threshold; speech continues while level stays above it.
    pub vad_min: f32,
    /// Voice-activation threshold; speech starts when level exceeds it.
    pub vad_max: f32,
    /// Extra frames transmitted after VAD falls, to avoid chopping word tails.
    pub voice_hold: u32,

    /// Requested encoder bitrate in bits/s, before bandwidth adjustment.
    pub quality: i32,
    /// Requested 10 ms frames per packet, before bandwidth adjustment.
    pub frames_per_packet: u32,
    pub complexity: i32,
    /// AGC reference: maximum gain is derived from 30000 / min_loudness.
    pub min_loudness: i32,
    /// Speex noise suppression strength in dB (negative).
    pub noise_suppress: i32,
    pub jitter_buffer_size: i32,

    pub allow_low_delay: bool,
    /// User opts into the Opus codec when the server advertises it.
    pub opus: bool,
    /// Prefer the CELT alpha bitstream over beta when both are usable.
    pub prefer_alpha: bool,

    pub transmit_position: bool,
    pub push_click: bool,
    pub tcp_compat: bool,
    pub reconnect: bool,

    /// Seconds of continuous silence before the idle action fires.
    pub idle_time: u64,
    pub idle_action: IdleAction,
    pub undo_idle_on_activity: bool,

    pub tx_audio_cue: bool,
    pub tx_mute_cue: bool,
    pub cue_on_path: String,
    pub cue_off_path: String,
    pub mute_cue_path: String,

    pub mute: bool,
    pub deaf: bool,

    pub audio_input_name: String,
    pub audio_output_name: String,
    /// 64-bit capture channel mask; all ones means "mix every channel".
    pub audio_input_channel_mask: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            transmit_mode: TransmitMode::VoiceActivity,
            loop_mode: LoopMode::None,
            noise_cancel_mode: NoiseCancel::Speex,
            echo_option: EchoOption::Off,
            vad_metric: VadMetric::SignalToNoise,
            vad_min: 0.80,
            vad_max: 0.98,
            voice_hold: 20,
            quality: 40_000,
            frames_per_packet: 2,
            complexity: 10,
            min_loudness: 1000,
            noise_suppress: -30,
            jitter_buffer_size: 4,
            allow_low_delay: true,
            opus: true,
            prefer_alpha: true,
            transmit_position: false,
            push_click: false,
            tcp_compat: false,
            reconnect: true,
            idle_time: 5 * 60,
            idle_action: IdleAction::Nothing,
            undo_idle_on_activity: false,
            tx_audio_cue: false,
            tx_mute_cue: false,
            cue_on_path: String::new(),
            cue_off_path: String::new(),
            mute_cue_path: String::new(),
            mute: false,
            deaf: false,
            audio_input_name: String::new(),
            audio_output_name: String::new(),
            audio_input_channel_mask: u64::MAX,
        }
    }
}

impl Settings {
    /// Load settings from an optional file and `VOICECAP_`-prefixed
    /// environment variables, layered over the built-in defaults.
    pub fn load(path: Option<&str>) -> Result<Self, config::ConfigError> {
        let mut builder =
            ConfigLoader::builder().add_source(ConfigLoader::try_from(&Settings::default())?);
        if let Some(path) = path {
            builder = builder.add_source(File::with_name(path).required(false));
        }
        builder
            .add_source(Environment::with_prefix("VOICECAP"))
            .build()?
            .try_deserialize()
    }
}

/// Shared, mutable settings store. The control plane replaces the value;
/// the capture worker snapshots it once per frame.
pub type SettingsStore = Arc<Mutex<Settings>>;

/// Reserved target id for server loopback packets.
pub const SERVER_LOOPBACK_TARGET: i32 = 31;

/// Fast-changing control signals shared between the UI/network threads and
/// the capture worker. Everything here is a single atomic read per frame.
#[derive(Debug)]
pub struct ControlState {
    /// Current voice target; 0 = normal speech, > 0 = whisper/shout target,
    /// < 0 = no valid target (suppress transmission).
    pub voice_target: AtomicI32,
    /// Target latched before the last whisper key release; consumed by the
    /// terminator packet of the whisper burst.
    pub prev_target: AtomicI32,
    /// Number of push-to-talk style keys currently held (includes whisper keys).
    pub push_to_talk: AtomicU32,
    /// Explicit push-to-talk intent for `TransmitMode::PushToTalk`.
    pub ptt_down: AtomicBool,
    /// Push-to-mute key currently held.
    pub push_to_mute: AtomicBool,
    /// Plugin/API request to force the microphone open.
    pub force_transmit: AtomicBool,
    /// Server session id; 0 while disconnected.
    pub session: AtomicU32,
    /// Server advertised that every client supports Opus.
    pub server_opus: AtomicBool,
    /// Bitstream versions of the two CELT variants advertised by the
    /// server; 0 while not advertised.
    pub celt_alpha: AtomicI32,
    pub celt_beta: AtomicI32,
    /// Server-side per-user state.
    pub server_muted: AtomicBool,
    pub server_suppressed: AtomicBool,
    /// Last server bandwidth ceiling seen, bits/s; -1 = no limit.
    pub max_bandwidth: AtomicI32,
    /// Exported talking state, see [`crate::transmit::TalkState`].
    pub talking: AtomicU8,
}

impl Default for ControlState {
    fn default() -> Self {
        Self {
            voice_target: AtomicI32::new(0),
            prev_target: AtomicI32::new(0),
            push_to_talk: AtomicU32::new(0),
            ptt_down: AtomicBool::new(false),
            push_to_mute: AtomicBool::new(false),
            force_transmit: AtomicBool::new(false),
            session: AtomicU32::new(0),
            server_opus: AtomicBool::new(false),
            celt_alpha: AtomicI32::new(0),
            celt_beta: AtomicI32::new(0),
            server_muted: AtomicBool::new(false),
            server_suppressed: AtomicBool::new(false),
            max_bandwidth: AtomicI32::new(-1),
            talking: AtomicU8::new(0),
        }
    }
}

impl ControlState {
    /// Take the latched previous whisper target, resetting it to 0.
    pub fn take_prev_target(&self) -> i32 {
        self.prev_target.swap(0, Ordering::Relaxed)
    }
}
