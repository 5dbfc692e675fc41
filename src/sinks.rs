//! Collaborator interfaces the pipeline talks to.
//!
//! The capture path holds only the capabilities it needs: a packet sink for
//! the transport, an optional local loopback, an optional voice recorder,
//! an optional positional-data source, the output pipeline for cue samples
//! and restarts, and a notifier for user-visible messages. No collaborator
//! holds a reference back into the pipeline.

use std::sync::Arc;

use crate::packet::AudioPacket;
use crate::transmit::IdleIntent;

/// Consumes finished voice packets. The transport implementation performs
/// wire encoding and delivery; the pipeline does not know about TCP or UDP.
pub trait PacketSink: Send + Sync {
    fn send(&self, packet: AudioPacket);
}

/// Optional recording tap; sees every flushed packet before it leaves.
pub trait VoiceRecorder: Send + Sync {
    fn add_frame(&self, packet: &AudioPacket);
}

/// Optional positional-data provider (plugin manager).
pub trait PositionalSource: Send + Sync {
    fn fetch(&self) -> Option<[f32; 3]>;
}

/// The playback side: cue samples and capture restarts.
pub trait OutputPipeline: Send + Sync {
    fn play_sample(&self, path: &str);
    fn stop_input(&self);
    fn start_input(&self);
}

/// User-visible notifications and idle-policy intents, handled by the UI.
pub trait UiNotifier: Send + Sync {
    fn notify(&self, message: &str);
    fn idle_intent(&self, intent: IdleIntent);
}

/// The full set of collaborators handed to a pipeline at start.
#[derive(Clone)]
pub struct Sinks {
    pub transport: Arc<dyn PacketSink>,
    pub loopback: Arc<dyn PacketSink>,
    pub recorder: Option<Arc<dyn VoiceRecorder>>,
    pub positional: Option<Arc<dyn PositionalSource>>,
    pub output: Arc<dyn OutputPipeline>,
    pub notifier: Arc<dyn UiNotifier>,
}

/// Inert collaborator used to fill unneeded slots.
pub struct NullSink;

impl PacketSink for NullSink {
    fn send(&self, _packet: AudioPacket) {}
}

impl OutputPipeline for NullSink {
    fn play_sample(&self, _path: &str) {}
    fn stop_input(&self) {}
    fn start_input(&self) {}
}

impl UiNotifier for NullSink {
    fn notify(&self, _message: &str) {}
    fn idle_intent(&self, _intent: IdleIntent) {}
}

impl Sinks {
    /// All-inert collaborator set; callers replace the slots they care about.
    pub fn null() -> Self {
        let null = Arc::new(NullSink);
        Self {
            transport: null.clone(),
            loopback: null.clone(),
            recorder: None,
            positional: None,
            output: null.clone(),
            notifier: null,
        }
    }
}
