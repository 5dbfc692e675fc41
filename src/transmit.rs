//! Transmission arbitration: turns DSP telemetry plus user intent into a
//! per-frame speak/stay-silent verdict and the side effects that hang off
//! its edges (cue sounds, talking-state export, idle actions).
//!
//! All timing here is counted in 10 ms frames rather than wall clock, which
//! keeps the arbiter deterministic for a given frame sequence.

use std::sync::atomic::Ordering;

use crate::dsp::ProcessedFrame;
use crate::settings::{ControlState, IdleAction, LoopMode, Settings, TransmitMode, VadMetric};

/// Frames per second at the canonical rate.
const FRAMES_PER_SECOND: u64 = 100;

/// Minimum spacing between two talking-while-muted cues, in frames (5 s).
const MUTE_CUE_DELAY_FRAMES: u64 = 5 * FRAMES_PER_SECOND;

/// Consecutive silent frames after which the packet frame counter restarts.
const FRAME_COUNTER_RESET_SILENCE: u32 = 500;

/// Exported per-user talking state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TalkState {
    Passive,
    Talking,
    /// Speaking to an explicit voice target (whisper/shout).
    Shouting,
}

impl TalkState {
    pub fn as_u8(self) -> u8 {
        match self {
            TalkState::Passive => 0,
            TalkState::Talking => 1,
            TalkState::Shouting => 2,
        }
    }

    pub fn from_u8(v: u8) -> Self {
        match v {
            1 => TalkState::Talking,
            2 => TalkState::Shouting,
            _ => TalkState::Passive,
        }
    }
}

/// Transmission on/off cue requested by an edge in the speech state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioCue {
    On,
    Off,
}

/// Request to the UI collaborator triggered by the idle policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleIntent {
    Deafen,
    Mute,
    Undeafen,
    Unmute,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Activity {
    Active,
    Idle,
}

/// Outcome of arbitrating one frame.
#[derive(Debug)]
pub struct FrameVerdict {
    pub is_speech: bool,
    /// Speech state of the previous frame; a frame is encoded while either
    /// this or `is_speech` is set (the trailing frame becomes the terminator).
    pub was_speech: bool,
    pub talking_while_muted: bool,
    pub talk: TalkState,
    pub audio_cue: Option<AudioCue>,
    pub mute_cue: bool,
    pub idle_intent: Option<IdleIntent>,
    /// Long silence elapsed; restart the packet frame counter.
    pub reset_frame_counter: bool,
    /// Speech onset; the encoder state must be reset before this frame.
    pub encoder_reset: bool,
}

impl FrameVerdict {
    /// Whether this frame proceeds to the encoder at all.
    pub fn transmit(&self) -> bool {
        self.is_speech || self.was_speech
    }

    /// Whether this frame ends a speech burst.
    pub fn terminator(&self) -> bool {
        !self.is_speech
    }
}

/// Per-stream arbitration state.
pub struct TransmitArbiter {
    was_speech: bool,
    hold_frames: u32,
    silent_frames: u32,
    idle_frames: u64,
    activity: Activity,
    mute_cue_elapsed: u64,
}

impl TransmitArbiter {
    pub fn new() -> Self {
        Self {
            was_speech: false,
            hold_frames: 0,
            silent_frames: 0,
            idle_frames: 0,
            activity: Activity::Active,
            mute_cue_elapsed: MUTE_CUE_DELAY_FRAMES,
        }
    }

    /// True while a speech burst is in progress.
    pub fn is_transmitting(&self) -> bool {
        self.was_speech
    }

    /// Arbitrate one processed frame against the settings snapshot and the
    /// shared control state.
    pub fn decide(
        &mut self,
        frame: &ProcessedFrame,
        settings: &Settings,
        ctl: &ControlState,
    ) -> FrameVerdict {
        let level = match settings.vad_metric {
            VadMetric::SignalToNoise => frame.speech_prob,
            VadMetric::Amplitude => 1.0 + frame.peak_clean_mic / 96.0,
        };

        // Hysteresis: full threshold to open, reduced threshold to stay open
        let mut is_speech =
            level > settings.vad_max || (level > settings.vad_min && self.was_speech);

        if !is_speech {
            self.hold_frames += 1;
            if self.hold_frames < settings.voice_hold {
                // Keep the mic open briefly so word tails are not chopped
                is_speech = true;
            }
        } else {
            self.hold_frames = 0;
        }

        if settings.transmit_mode == TransmitMode::Continuous
            || ctl.force_transmit.load(Ordering::Relaxed)
        {
            is_speech = true;
        } else if settings.transmit_mode == TransmitMode::PushToTalk {
            is_speech = ctl.ptt_down.load(Ordering::Relaxed);
        }

        // Any held push-to-talk style key (whispering included) opens the mic
        is_speech = is_speech || ctl.push_to_talk.load(Ordering::Relaxed) > 0;

        let voice_target = ctl.voice_target.load(Ordering::Relaxed);
        let server_blocked = settings.loop_mode != LoopMode::Local
            && ctl.session.load(Ordering::Relaxed) != 0
            && (ctl.server_muted.load(Ordering::Relaxed)
                || ctl.server_suppressed.load(Ordering::Relaxed));
        let mut talking_while_muted = false;
        if settings.mute
            || server_blocked
            || ctl.push_to_mute.load(Ordering::Relaxed)
            || voice_target < 0
        {
            talking_while_muted = is_speech;
            is_speech = false;
        }

        if is_speech {
            self.silent_frames = 0;
        } else {
            self.silent_frames = self.silent_frames.saturating_add(1);
        }
        let reset_frame_counter = self.silent_frames > FRAME_COUNTER_RESET_SILENCE;

        let talk = if !is_speech {
            TalkState::Passive
        } else if voice_target == 0 {
            TalkState::Talking
        } else {
            TalkState::Shouting
        };
        ctl.talking.store(talk.as_u8(), Ordering::Relaxed);

        let in_session = ctl.session.load(Ordering::Relaxed) != 0;
        let audio_cue = if in_session && settings.tx_audio_cue {
            if is_speech && !self.was_speech {
                Some(AudioCue::On)
            } else if !is_speech && self.was_speech {
                Some(AudioCue::Off)
            } else {
                None
            }
        } else {
            None
        };

        self.mute_cue_elapsed = self.mute_cue_elapsed.saturating_add(1);
        let mute_cue = in_session
            && settings.tx_mute_cue
            && !ctl.push_to_mute.load(Ordering::Relaxed)
            && !settings.deaf
            && talking_while_muted
            && self.mute_cue_elapsed >= MUTE_CUE_DELAY_FRAMES;
        if mute_cue {
            self.mute_cue_elapsed = 0;
        }

        // Idle bookkeeping: a burst's trailing frame still restarts the
        // timer, and attempted speech counts as user activity even when
        // muting swallowed it.
        let mut idle_intent = None;
        if is_speech || self.was_speech || talking_while_muted {
            if self.activity == Activity::Idle {
                self.activity = Activity::Active;
                if settings.undo_idle_on_activity {
                    idle_intent = match settings.idle_action {
                        IdleAction::Deafen if settings.deaf => Some(IdleIntent::Undeafen),
                        IdleAction::Mute if settings.mute => Some(IdleIntent::Unmute),
                        _ => None,
                    };
                }
            }
            self.idle_frames = 0;
        } else {
            self.idle_frames += 1;
            if settings.idle_time > 0
                && self.idle_frames > settings.idle_time.saturating_mul(FRAMES_PER_SECOND)
            {
                self.idle_frames = 0;
                self.activity = Activity::Idle;
                idle_intent = match settings.idle_action {
                    IdleAction::Deafen if !settings.deaf => Some(IdleIntent::Deafen),
                    IdleAction::Mute if !settings.mute => Some(IdleIntent::Mute),
                    _ => None,
                };
            }
        }

        let verdict = FrameVerdict {
            is_speech,
            was_speech: self.was_speech,
            talking_while_muted,
            talk,
            audio_cue,
            mute_cue,
            idle_intent,
            reset_frame_counter,
            encoder_reset: is_speech && !self.was_speech,
        };
        self.was_speech = is_speech;
        verdict
    }
}

impl Default for TransmitArbiter {
    fn default() -> Self {
        Self::new()
    }
}
