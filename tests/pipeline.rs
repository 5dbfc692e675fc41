//! End-to-end capture scenarios driven synchronously through the frame
//! processor, with deterministic encoder stubs injected through the
//! abstract encoder interface and collecting collaborator sinks.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use voicecap::codec::{AudioCodec, FrameEncoder};
use voicecap::packet::AudioPacket;
use voicecap::pipeline::{set_max_bandwidth, FrameProcessor};
use voicecap::resync::AudioChunk;
use voicecap::settings::{ControlState, LoopMode, Settings, TransmitMode};
use voicecap::sinks::{PacketSink, Sinks, UiNotifier};
use voicecap::transmit::IdleIntent;
use voicecap::{FRAME_SIZE, SAMPLE_RATE};

/// Deterministic encoder standing in for a codec library.
struct StubEncoder {
    fill: u8,
    len: usize,
    /// PCM lengths seen by `encode`, for asserting zero-padding.
    pcm_lengths: Arc<Mutex<Vec<usize>>>,
}

impl StubEncoder {
    fn new(fill: u8, len: usize) -> (Self, Arc<Mutex<Vec<usize>>>) {
        let lengths = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                fill,
                len,
                pcm_lengths: lengths.clone(),
            },
            lengths,
        )
    }
}

impl FrameEncoder for StubEncoder {
    fn encode(&mut self, pcm: &[i16], max_bytes: usize) -> Result<Vec<u8>> {
        self.pcm_lengths.lock().unwrap().push(pcm.len());
        Ok(vec![self.fill; self.len.min(max_bytes)])
    }

    fn reset(&mut self) -> Result<()> {
        Ok(())
    }

    fn set_bitrate(&mut self, _bits_per_sec: i32) -> Result<()> {
        Ok(())
    }
}

#[derive(Default)]
struct CollectingSink {
    packets: Mutex<Vec<AudioPacket>>,
}

impl PacketSink for CollectingSink {
    fn send(&self, packet: AudioPacket) {
        self.packets.lock().unwrap().push(packet);
    }
}

#[derive(Default)]
struct CountingNotifier {
    notices: Mutex<Vec<String>>,
    intents: Mutex<Vec<IdleIntent>>,
}

impl UiNotifier for CountingNotifier {
    fn notify(&self, message: &str) {
        self.notices.lock().unwrap().push(message.to_string());
    }

    fn idle_intent(&self, intent: IdleIntent) {
        self.intents.lock().unwrap().push(intent);
    }
}

struct RestartCounter {
    stops: AtomicU32,
    starts: AtomicU32,
}

impl voicecap::sinks::OutputPipeline for RestartCounter {
    fn play_sample(&self, _path: &str) {}

    fn stop_input(&self) {
        self.stops.fetch_add(1, Ordering::Relaxed);
    }

    fn start_input(&self) {
        self.starts.fetch_add(1, Ordering::Relaxed);
    }
}

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn sine_frame(amplitude: f32) -> Vec<i16> {
    (0..FRAME_SIZE)
        .map(|i| {
            let t = i as f32 / SAMPLE_RATE as f32;
            (amplitude * 32768.0 * (2.0 * std::f32::consts::PI * 440.0 * t).sin()) as i16
        })
        .collect()
}

fn harness(settings: Settings) -> (FrameProcessor, Arc<ControlState>, Arc<CollectingSink>) {
    init_logging();
    let store = Arc::new(Mutex::new(settings));
    let ctl = Arc::new(ControlState::default());
    let transport = Arc::new(CollectingSink::default());
    let mut sinks = Sinks::null();
    sinks.transport = transport.clone();
    let processor = FrameProcessor::new(store, ctl.clone(), sinks).expect("processor");
    (processor, ctl, transport)
}

#[test]
fn continuous_opus_emits_fifty_packets_per_second() {
    // Continuous mode, no echo, Opus, 2 frames per packet
    let settings = Settings {
        transmit_mode: TransmitMode::Continuous,
        quality: 40_000,
        frames_per_packet: 2,
        loop_mode: LoopMode::None,
        ..Settings::default()
    };
    let (mut processor, ctl, transport) = harness(settings);
    ctl.server_opus.store(true, Ordering::Relaxed);
    let (stub, _) = StubEncoder::new(0xA0, 50);
    processor.facade_mut().install_opus(Box::new(stub));

    // One second of -20 dBFS sine
    for _ in 0..100 {
        processor.process_chunk(AudioChunk::mic_only(sine_frame(0.1)));
    }

    let packets = transport.packets.lock().unwrap();
    assert_eq!(packets.len(), 50);
    for (i, packet) in packets.iter().enumerate() {
        assert_eq!(packet.codec, AudioCodec::Opus);
        assert_eq!(packet.frame_number, 2 * i as u64);
        assert!(!packet.is_last_frame);
        assert_eq!(packet.payload.len(), 50);
    }
}

#[test]
fn opus_burst_end_pads_to_full_packet() {
    // A burst shorter than frames_per_packet still produces one packet
    // spanning the full frame count, tail zero-padded
    let settings = Settings {
        transmit_mode: TransmitMode::PushToTalk,
        voice_hold: 0,
        frames_per_packet: 6,
        ..Settings::default()
    };
    let (mut processor, ctl, transport) = harness(settings);
    ctl.server_opus.store(true, Ordering::Relaxed);
    let (stub, pcm_lengths) = StubEncoder::new(0xB0, 40);
    processor.facade_mut().install_opus(Box::new(stub));

    ctl.ptt_down.store(true, Ordering::Relaxed);
    for _ in 0..3 {
        processor.process_chunk(AudioChunk::mic_only(sine_frame(0.2)));
    }
    ctl.ptt_down.store(false, Ordering::Relaxed);
    // Release frame: arbitration falls, the burst terminator flushes
    processor.process_chunk(AudioChunk::mic_only(sine_frame(0.0)));

    let packets = transport.packets.lock().unwrap();
    assert_eq!(packets.len(), 1);
    assert!(packets[0].is_last_frame);
    assert_eq!(packets[0].frame_number, 0);
    // The encoder saw exactly frames_per_packet worth of PCM
    let lengths = pcm_lengths.lock().unwrap();
    assert_eq!(*lengths, vec![6 * FRAME_SIZE]);

    // Nothing further flows while the key stays up
    drop(packets);
    processor.process_chunk(AudioChunk::mic_only(sine_frame(0.0)));
    assert_eq!(transport.packets.lock().unwrap().len(), 1);
}

#[test]
fn ptt_release_mid_packet_emits_celt_terminator() {
    // CELT, 6 frames per packet, release after two speech frames: the
    // terminator packet carries three sub-frames plus the empty end marker
    let settings = Settings {
        transmit_mode: TransmitMode::PushToTalk,
        voice_hold: 0,
        frames_per_packet: 6,
        opus: false,
        ..Settings::default()
    };
    let (mut processor, ctl, transport) = harness(settings);
    ctl.celt_alpha.store(1, Ordering::Relaxed);
    let (stub, _) = StubEncoder::new(0xC0, 20);
    processor
        .facade_mut()
        .install_celt(AudioCodec::CeltAlpha, Box::new(stub));

    ctl.ptt_down.store(true, Ordering::Relaxed);
    for _ in 0..2 {
        processor.process_chunk(AudioChunk::mic_only(sine_frame(0.2)));
    }
    ctl.ptt_down.store(false, Ordering::Relaxed);
    processor.process_chunk(AudioChunk::mic_only(sine_frame(0.0)));

    let packets = transport.packets.lock().unwrap();
    assert_eq!(packets.len(), 1);
    let packet = &packets[0];
    assert!(packet.is_last_frame);
    assert_eq!(packet.codec, AudioCodec::CeltAlpha);

    // Decode the legacy sub-frame container
    let mut frames = Vec::new();
    let mut at = 0;
    loop {
        let head = packet.payload[at];
        at += 1;
        let len = usize::from(head & 0x7F);
        frames.push(packet.payload[at..at + len].to_vec());
        at += len;
        if head & 0x80 == 0 {
            break;
        }
    }
    assert_eq!(at, packet.payload.len());
    assert_eq!(frames.len(), 4);
    assert!(frames[..3].iter().all(|f| f.len() == 20));
    assert!(frames[3].is_empty(), "end-of-burst marker must be empty");
}

#[test]
fn codec_switch_happens_only_between_bursts() {
    let settings = Settings {
        transmit_mode: TransmitMode::PushToTalk,
        voice_hold: 0,
        frames_per_packet: 2,
        opus: false,
        ..Settings::default()
    };
    init_logging();
    let store = Arc::new(Mutex::new(settings));
    let ctl = Arc::new(ControlState::default());
    let transport = Arc::new(CollectingSink::default());
    let mut sinks = Sinks::null();
    sinks.transport = transport.clone();
    let mut processor = FrameProcessor::new(store.clone(), ctl.clone(), sinks).expect("processor");

    ctl.celt_alpha.store(1, Ordering::Relaxed);
    let (celt_stub, _) = StubEncoder::new(0xC0, 20);
    processor
        .facade_mut()
        .install_celt(AudioCodec::CeltAlpha, Box::new(celt_stub));
    let (opus_stub, _) = StubEncoder::new(0xD0, 30);
    processor.facade_mut().install_opus(Box::new(opus_stub));

    // First burst on CELT
    ctl.ptt_down.store(true, Ordering::Relaxed);
    processor.process_chunk(AudioChunk::mic_only(sine_frame(0.2)));
    processor.process_chunk(AudioChunk::mic_only(sine_frame(0.2)));
    ctl.ptt_down.store(false, Ordering::Relaxed);
    processor.process_chunk(AudioChunk::mic_only(sine_frame(0.0)));

    // Server and user flip to Opus while nothing is transmitted
    ctl.server_opus.store(true, Ordering::Relaxed);
    store.lock().unwrap().opus = true;

    // Second burst
    ctl.ptt_down.store(true, Ordering::Relaxed);
    processor.process_chunk(AudioChunk::mic_only(sine_frame(0.2)));
    processor.process_chunk(AudioChunk::mic_only(sine_frame(0.2)));
    ctl.ptt_down.store(false, Ordering::Relaxed);
    processor.process_chunk(AudioChunk::mic_only(sine_frame(0.0)));

    let packets = transport.packets.lock().unwrap();
    assert!(packets.len() >= 3);
    assert!(packets
        .iter()
        .take_while(|p| !p.is_last_frame)
        .all(|p| p.codec == AudioCodec::CeltAlpha));
    let last = packets.last().unwrap();
    assert_eq!(last.codec, AudioCodec::Opus);
    assert!(last.is_last_frame);
}

#[test]
fn local_loopback_routes_packets_away_from_transport() {
    let settings = Settings {
        transmit_mode: TransmitMode::Continuous,
        frames_per_packet: 1,
        loop_mode: LoopMode::Local,
        ..Settings::default()
    };
    init_logging();
    let store = Arc::new(Mutex::new(settings));
    let ctl = Arc::new(ControlState::default());
    let transport = Arc::new(CollectingSink::default());
    let loopback = Arc::new(CollectingSink::default());
    let mut sinks = Sinks::null();
    sinks.transport = transport.clone();
    sinks.loopback = loopback.clone();
    let mut processor = FrameProcessor::new(store, ctl, sinks).expect("processor");
    let (stub, _) = StubEncoder::new(0xE0, 10);
    processor.facade_mut().install_opus(Box::new(stub));

    for _ in 0..4 {
        processor.process_chunk(AudioChunk::mic_only(sine_frame(0.1)));
    }

    assert!(transport.packets.lock().unwrap().is_empty());
    assert_eq!(loopback.packets.lock().unwrap().len(), 4);
}

#[test]
fn bandwidth_ceiling_notifies_and_restarts_idle_capture() {
    // Server ceiling 32 kbit/s against a 64 kbit/s, 1 frame/packet request
    let settings = Settings {
        quality: 64_000,
        frames_per_packet: 1,
        ..Settings::default()
    };
    init_logging();
    let store = Arc::new(Mutex::new(settings));
    let ctl = ControlState::default();
    let notifier = Arc::new(CountingNotifier::default());
    let output = Arc::new(RestartCounter {
        stops: AtomicU32::new(0),
        starts: AtomicU32::new(0),
    });
    let mut sinks = Sinks::null();
    sinks.notifier = notifier.clone();
    sinks.output = output.clone();

    set_max_bandwidth(32_000, None, &store, &ctl, &sinks);

    let notices = notifier.notices.lock().unwrap();
    assert_eq!(notices.len(), 1);
    assert!(notices[0].contains("32 kbit/s"));
    // No live pipeline: the capture path is torn down and restarted
    assert_eq!(output.stops.load(Ordering::Relaxed), 1);
    assert_eq!(output.starts.load(Ordering::Relaxed), 1);

    // Re-applying the same ceiling is a no-op
    drop(notices);
    set_max_bandwidth(32_000, None, &store, &ctl, &sinks);
    assert_eq!(notifier.notices.lock().unwrap().len(), 1);
}
