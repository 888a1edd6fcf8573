use std::time::Instant;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bitflags::bitflags;
use log::{debug, warn};
use midly::num::{u15, u24, u28, u4, u7};
use midly::{Format, Header, MetaMessage, MidiMessage, Smf, Timing, TrackEvent, TrackEventKind};

use crate::error::{Error, Result};
use crate::sequencer::live::{apply_recorded_note, RecordedNote, DEFAULT_TOLERANCE_FACTOR};
use crate::sequencer::midi::MidiBuffer;
use crate::sequencer::note::NoteRegistry;
use crate::sequencer::pattern::Pattern;
use crate::transport::Transport;

/// Tick resolution of the files the recorder writes
const TICKS_PER_BEAT: u16 = 960;

/// 120 BPM, the tempo recordings are written at
const DEFAULT_TEMPO_MICROS: f64 = 500_000.0;

bitflags! {
    /// How [`MidiRecorder::apply_to_pattern`] filters and prepares
    pub struct ApplicatorSettings: u32 {
        const CLEAR_PATTERN_BEFORE_APPLYING = 0x1;
        const LIMIT_TO_PATTERN_CHANNEL = 0x2;
        const APPLY_CHANNEL_0 = 0x4;
        const APPLY_CHANNEL_1 = 0x4 << 1;
        const APPLY_CHANNEL_2 = 0x4 << 2;
        const APPLY_CHANNEL_3 = 0x4 << 3;
        const APPLY_CHANNEL_4 = 0x4 << 4;
        const APPLY_CHANNEL_5 = 0x4 << 5;
        const APPLY_CHANNEL_6 = 0x4 << 6;
        const APPLY_CHANNEL_7 = 0x4 << 7;
        const APPLY_CHANNEL_8 = 0x4 << 8;
        const APPLY_CHANNEL_9 = 0x4 << 9;
        const APPLY_CHANNEL_10 = 0x4 << 10;
        const APPLY_CHANNEL_11 = 0x4 << 11;
        const APPLY_CHANNEL_12 = 0x4 << 12;
        const APPLY_CHANNEL_13 = 0x4 << 13;
        const APPLY_CHANNEL_14 = 0x4 << 14;
        const APPLY_CHANNEL_15 = 0x4 << 15;
    }
}

impl ApplicatorSettings {
    fn accepts_channel(self, channel: u8) -> bool {
        channel < 16 && self.contains(Self::from_bits_truncate(0x4u32 << channel))
    }
}

#[derive(Debug, Clone, Copy)]
struct RecordedEvent {
    bytes: [u8; 3],
    timestamp_micros: u64,
}

/// Free-running recorder turning observed MIDI into a Standard MIDI File
/// track and back.
///
/// Subscribes to channels rather than ports: `start_recording` adds a
/// channel to the subscription, and events on unsubscribed channels are
/// ignored. Timestamps are microseconds from the first `start_recording`.
pub struct MidiRecorder {
    recording: bool,
    playing: bool,
    channels: Vec<u8>,
    events: Vec<RecordedEvent>,
    started_at: Instant,
}

impl Default for MidiRecorder {
    fn default() -> Self {
        Self::new()
    }
}

impl MidiRecorder {
    pub fn new() -> Self {
        Self {
            recording: false,
            playing: false,
            channels: Vec::new(),
            events: Vec::new(),
            started_at: Instant::now(),
        }
    }

    pub fn is_recording(&self) -> bool {
        self.recording
    }

    pub fn is_playing(&self) -> bool {
        self.playing
    }

    pub fn event_count(&self) -> usize {
        self.events.len()
    }

    /// Subscribe a channel and begin recording (optionally clearing what
    /// was recorded before)
    pub fn start_recording(&mut self, channel: u8, clear: bool) {
        if clear {
            self.clear_recording();
        }
        if !self.channels.contains(&channel) {
            self.channels.push(channel);
        }
        if !self.recording {
            self.started_at = Instant::now();
            self.recording = true;
        }
    }

    /// Unsubscribe a channel, or every channel when `None`; recording stops
    /// once no subscriptions remain
    pub fn stop_recording(&mut self, channel: Option<u8>) {
        match channel {
            Some(channel) => self.channels.retain(|&c| c != channel),
            None => self.channels.clear(),
        }
        if self.channels.is_empty() {
            self.recording = false;
        }
    }

    pub fn clear_recording(&mut self) {
        self.events.clear();
    }

    /// Feed one observed message through the recorder's channel filter
    pub fn handle_midi_message(&mut self, byte1: u8, byte2: u8, byte3: u8) {
        let timestamp = self.started_at.elapsed().as_micros() as u64;
        self.record_event(byte1, byte2, byte3, timestamp);
    }

    /// Timestamp-explicit variant of [`handle_midi_message`](Self::handle_midi_message)
    pub fn record_event(&mut self, byte1: u8, byte2: u8, byte3: u8, timestamp_micros: u64) {
        if !self.recording {
            return;
        }
        if !(0x80..0xA0).contains(&byte1) {
            return;
        }
        if !self.channels.contains(&(byte1 & 0x0F)) {
            return;
        }
        self.events.push(RecordedEvent {
            bytes: [byte1, byte2, byte3],
            timestamp_micros,
        });
    }

    /// Rewrite the channel nibble of every recorded channel-voice event
    pub fn force_to_channel(&mut self, channel: u8) {
        let channel = channel & 0x0F;
        for event in &mut self.events {
            if event.bytes[0] < 0xF0 {
                event.bytes[0] = (event.bytes[0] & 0xF0) | channel;
            }
        }
    }

    /// Serialise the collected events as a single-track SMF
    pub fn midi(&self) -> Result<Vec<u8>> {
        let mut events = self.events.clone();
        events.sort_by_key(|event| event.timestamp_micros);

        let mut track = Vec::with_capacity(events.len() + 2);
        track.push(TrackEvent {
            delta: u28::new(0),
            kind: TrackEventKind::Meta(MetaMessage::Tempo(u24::new(DEFAULT_TEMPO_MICROS as u32))),
        });
        let mut last_tick = 0u32;
        for event in &events {
            let Some(kind) = bytes_to_event_kind(event.bytes) else {
                continue;
            };
            let tick = micros_to_ticks(event.timestamp_micros);
            track.push(TrackEvent {
                delta: u28::new(tick.saturating_sub(last_tick)),
                kind,
            });
            last_tick = tick;
        }
        track.push(TrackEvent {
            delta: u28::new(0),
            kind: TrackEventKind::Meta(MetaMessage::EndOfTrack),
        });

        let smf = Smf {
            header: Header::new(Format::SingleTrack, Timing::Metrical(u15::new(TICKS_PER_BEAT))),
            tracks: vec![track],
        };
        let mut data = Vec::new();
        smf.write_std(&mut data).map_err(Error::Persistence)?;
        Ok(data)
    }

    pub fn base64_midi(&self) -> Result<String> {
        Ok(BASE64.encode(self.midi()?))
    }

    /// Replace the recorded events with track 0 of the given file.
    ///
    /// Returns `false` (keeping the current events) when the data is not a
    /// readable SMF.
    pub fn load_from_midi(&mut self, data: &[u8]) -> bool {
        let Ok(smf) = Smf::parse(data) else {
            warn!("could not parse midi data of {} bytes", data.len());
            return false;
        };
        let Some(track) = smf.tracks.first() else {
            return false;
        };
        let ticks_per_beat = match smf.header.timing {
            Timing::Metrical(tpb) => tpb.as_int() as f64,
            Timing::Timecode(fps, subframe) => {
                // Equivalent resolution: ticks per second scaled to one beat
                // at the default tempo
                (fps.as_f32() as f64 * subframe as f64) * DEFAULT_TEMPO_MICROS / 1_000_000.0
            }
        };
        let mut events = Vec::new();
        let mut tempo_micros = DEFAULT_TEMPO_MICROS;
        let mut timestamp = 0.0f64;
        for event in track {
            timestamp += event.delta.as_int() as f64 * tempo_micros / ticks_per_beat;
            match event.kind {
                TrackEventKind::Meta(MetaMessage::Tempo(tempo)) => {
                    tempo_micros = tempo.as_int() as f64;
                }
                TrackEventKind::Midi { channel, message } => {
                    if let Some(bytes) = message_to_bytes(channel.as_int(), message) {
                        events.push(RecordedEvent {
                            bytes,
                            timestamp_micros: timestamp as u64,
                        });
                    }
                }
                _ => {}
            }
        }
        debug!("loaded {} events from midi data", events.len());
        self.events = events;
        true
    }

    pub fn load_from_base64(&mut self, data: &str) -> bool {
        match BASE64.decode(data) {
            Ok(bytes) => self.load_from_midi(&bytes),
            Err(_) => false,
        }
    }

    /// Schedule every recorded event against the transport and start it.
    ///
    /// Events sharing a timestamp travel in one buffer; the transport is
    /// asked to stop itself one beat after the final event.
    pub fn play_recording(&mut self, transport: &dyn Transport, bpm: u32) {
        let mut events = self.events.clone();
        events.sort_by_key(|event| event.timestamp_micros);

        let mut buffer = MidiBuffer::new();
        let mut buffer_timestamp = None::<u64>;
        let mut last_offset = 0u64;
        for event in &events {
            if buffer_timestamp != Some(event.timestamp_micros) {
                if let Some(timestamp) = buffer_timestamp {
                    let offset =
                        transport.seconds_to_sub_steps(bpm, timestamp as f64 / 1_000_000.0);
                    transport.schedule_midi_buffer(std::mem::take(&mut buffer), offset);
                    last_offset = offset;
                }
                buffer_timestamp = Some(event.timestamp_micros);
            }
            buffer.add_event(crate::sequencer::midi::MidiEvent::new(
                event.bytes[0],
                event.bytes[1],
                event.bytes[2],
            ));
        }
        if let Some(timestamp) = buffer_timestamp {
            if !buffer.is_empty() {
                let offset = transport.seconds_to_sub_steps(bpm, timestamp as f64 / 1_000_000.0);
                transport.schedule_midi_buffer(buffer, offset);
                last_offset = offset;
            }
        }
        transport.schedule_timer_command(
            last_offset + transport.multiplier(),
            crate::command::TimerCommand::StopPlayback,
        );
        transport.start(bpm);
        self.playing = true;
    }

    pub fn stop_playback(&mut self, transport: &dyn Transport) {
        transport.stop();
        self.playing = false;
    }

    /// React to the transport stopping: playback ends, and any ongoing
    /// recording is closed out
    pub fn on_timer_running_changed(&mut self, running: bool) {
        if !running {
            self.playing = false;
            if self.recording {
                self.stop_recording(None);
            }
        }
    }

    /// Quantise the recorded note-on/note-off pairs into a pattern.
    ///
    /// `sub_step_micros` converts recorded microsecond timestamps into the
    /// pattern's sub-step domain. Returns how many notes changed the grid.
    pub fn apply_to_pattern(
        &self,
        pattern: &mut Pattern,
        registry: &mut NoteRegistry,
        settings: ApplicatorSettings,
        sub_step_micros: u64,
    ) -> usize {
        if settings.contains(ApplicatorSettings::CLEAR_PATTERN_BEFORE_APPLYING) {
            pattern.clear();
        }
        let pattern_channel = pattern.midi_channel();
        let accepts = |channel: u8| {
            if settings.contains(ApplicatorSettings::LIMIT_TO_PATTERN_CHANNEL) {
                channel == pattern_channel
            } else {
                settings.accepts_channel(channel)
            }
        };

        let mut events = self.events.clone();
        events.sort_by_key(|event| event.timestamp_micros);
        let sub_step_micros = sub_step_micros.max(1) as f64;
        let to_sub_steps = |micros: u64| (micros as f64 / sub_step_micros) as i64;

        let mut pending: Vec<(u8, u8, u8, u64)> = Vec::new();
        let mut written = 0;
        for event in &events {
            let status = event.bytes[0] & 0xF0;
            let channel = event.bytes[0] & 0x0F;
            if !accepts(channel) {
                continue;
            }
            let is_on = status == 0x90 && event.bytes[2] > 0;
            let is_off = status == 0x80 || (status == 0x90 && event.bytes[2] == 0);
            if is_on {
                pending.push((channel, event.bytes[1], event.bytes[2], event.timestamp_micros));
            } else if is_off {
                let Some(index) = pending
                    .iter()
                    .position(|&(c, note, _, _)| c == channel && note == event.bytes[1])
                else {
                    continue;
                };
                let (_, note, velocity, start) = pending.remove(index);
                let recorded = RecordedNote {
                    timestamp: to_sub_steps(start),
                    end_timestamp: to_sub_steps(event.timestamp_micros),
                    midi_note: note,
                    velocity,
                };
                if apply_recorded_note(pattern, registry, &recorded, DEFAULT_TOLERANCE_FACTOR) {
                    written += 1;
                }
            }
        }
        written
    }
}

fn micros_to_ticks(micros: u64) -> u32 {
    (micros as f64 * TICKS_PER_BEAT as f64 / DEFAULT_TEMPO_MICROS) as u32
}

fn bytes_to_event_kind(bytes: [u8; 3]) -> Option<TrackEventKind<'static>> {
    let channel = u4::new(bytes[0] & 0x0F);
    let message = match bytes[0] & 0xF0 {
        0x80 => MidiMessage::NoteOff {
            key: u7::new(bytes[1]),
            vel: u7::new(bytes[2]),
        },
        0x90 => MidiMessage::NoteOn {
            key: u7::new(bytes[1]),
            vel: u7::new(bytes[2]),
        },
        0xA0 => MidiMessage::Aftertouch {
            key: u7::new(bytes[1]),
            vel: u7::new(bytes[2]),
        },
        0xB0 => MidiMessage::Controller {
            controller: u7::new(bytes[1]),
            value: u7::new(bytes[2]),
        },
        0xC0 => MidiMessage::ProgramChange {
            program: u7::new(bytes[1]),
        },
        0xD0 => MidiMessage::ChannelAftertouch {
            vel: u7::new(bytes[1]),
        },
        0xE0 => MidiMessage::PitchBend {
            bend: midly::PitchBend(midly::num::u14::new(
                ((bytes[2] as u16) << 7) | bytes[1] as u16,
            )),
        },
        _ => return None,
    };
    Some(TrackEventKind::Midi { channel, message })
}

fn message_to_bytes(channel: u8, message: MidiMessage) -> Option<[u8; 3]> {
    let bytes = match message {
        MidiMessage::NoteOff { key, vel } => [0x80 | channel, key.as_int(), vel.as_int()],
        MidiMessage::NoteOn { key, vel } => [0x90 | channel, key.as_int(), vel.as_int()],
        MidiMessage::Aftertouch { key, vel } => [0xA0 | channel, key.as_int(), vel.as_int()],
        MidiMessage::Controller { controller, value } => {
            [0xB0 | channel, controller.as_int(), value.as_int()]
        }
        MidiMessage::ProgramChange { program } => [0xC0 | channel, program.as_int(), 0],
        MidiMessage::ChannelAftertouch { vel } => [0xD0 | channel, vel.as_int(), 0],
        MidiMessage::PitchBend { bend } => {
            let value = bend.0.as_int();
            [0xE0 | channel, (value & 0x7F) as u8, (value >> 7) as u8]
        }
    };
    Some(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sequencer::test_support::RecordingTransport;

    fn recorder_with_notes() -> MidiRecorder {
        let mut recorder = MidiRecorder::new();
        recorder.start_recording(0, true);
        recorder.record_event(0x90, 60, 100, 0);
        recorder.record_event(0x80, 60, 0, 500_000);
        recorder.record_event(0x90, 64, 90, 500_000);
        recorder.record_event(0x80, 64, 0, 1_000_000);
        recorder
    }

    #[test]
    fn channel_filter_gates_recording() {
        let mut recorder = MidiRecorder::new();
        recorder.start_recording(2, true);
        recorder.record_event(0x92, 60, 100, 0);
        recorder.record_event(0x90, 60, 100, 0);
        recorder.record_event(0xF8, 0, 0, 0);
        assert_eq!(recorder.event_count(), 1);
        recorder.stop_recording(None);
        assert!(!recorder.is_recording());
        recorder.record_event(0x92, 62, 100, 10);
        assert_eq!(recorder.event_count(), 1);
    }

    #[test]
    fn multi_channel_subscription() {
        let mut recorder = MidiRecorder::new();
        recorder.start_recording(0, true);
        recorder.start_recording(1, false);
        recorder.record_event(0x90, 60, 100, 0);
        recorder.record_event(0x91, 61, 100, 0);
        assert_eq!(recorder.event_count(), 2);
        recorder.stop_recording(Some(0));
        assert!(recorder.is_recording());
        recorder.record_event(0x90, 62, 100, 10);
        assert_eq!(recorder.event_count(), 2);
    }

    #[test]
    fn smf_round_trip_preserves_events() {
        let recorder = recorder_with_notes();
        let data = recorder.midi().unwrap();

        let mut loaded = MidiRecorder::new();
        assert!(loaded.load_from_midi(&data));
        assert_eq!(loaded.event_count(), 4);
        assert_eq!(loaded.events[0].bytes, [0x90, 60, 100]);
        // 500 ms at 120 BPM survives the tick conversion
        let delta = loaded.events[1].timestamp_micros as i64 - 500_000;
        assert!(delta.abs() < 1_000, "timestamp drifted by {}", delta);
    }

    #[test]
    fn base64_round_trip() {
        let recorder = recorder_with_notes();
        let encoded = recorder.base64_midi().unwrap();
        let mut loaded = MidiRecorder::new();
        assert!(loaded.load_from_base64(&encoded));
        assert_eq!(loaded.event_count(), 4);
        assert!(!loaded.load_from_base64("not base64!"));
    }

    #[test]
    fn malformed_data_keeps_current_events() {
        let mut recorder = recorder_with_notes();
        assert!(!recorder.load_from_midi(b"junk"));
        assert_eq!(recorder.event_count(), 4);
    }

    #[test]
    fn force_to_channel_rewrites_status_nibbles() {
        let mut recorder = recorder_with_notes();
        recorder.force_to_channel(5);
        assert!(recorder.events.iter().all(|e| e.bytes[0] & 0x0F == 5));
    }

    #[test]
    fn playback_groups_events_by_timestamp() {
        let mut recorder = recorder_with_notes();
        let transport = RecordingTransport::new();
        recorder.play_recording(&transport, 120);
        assert!(recorder.is_playing());
        assert!(transport.is_running());

        let buffers = transport.midi_buffers.lock().unwrap();
        // Three distinct timestamps: 0, 500ms, 1s
        assert_eq!(buffers.len(), 3);
        // The shared 500ms timestamp carries two events in one buffer
        assert_eq!(buffers[1].1.len(), 2);
        let commands = transport.timer_commands.lock().unwrap();
        assert!(matches!(
            commands.last(),
            Some((_, crate::command::TimerCommand::StopPlayback))
        ));
    }

    #[test]
    fn apply_to_pattern_quantises_pairs() {
        let mut recorder = MidiRecorder::new();
        recorder.start_recording(0, true);
        // 1 sub-step = 10ms; step duration 8 sub-steps
        recorder.record_event(0x90, 60, 100, 0);
        recorder.record_event(0x80, 60, 0, 40_000);
        recorder.record_event(0x90, 64, 90, 810_000);
        recorder.record_event(0x80, 64, 0, 1_200_000);

        let mut registry = NoteRegistry::new();
        let mut pattern = Pattern::new("test");
        pattern.set_midi_channel(&mut registry, 0);
        pattern.take_stale_channels();

        let written = recorder.apply_to_pattern(
            &mut pattern,
            &mut registry,
            ApplicatorSettings::LIMIT_TO_PATTERN_CHANNEL,
            10_000,
        );
        assert_eq!(written, 2);
        assert!(pattern.subnote_index(0, 0, 60).is_some());
        // 81 sub-steps snaps to step 10 (80 sub-steps)
        assert!(pattern.subnote_index(0, 10, 64).is_some());
    }

    #[test]
    fn applicator_channel_flags_are_powers_of_two() {
        assert!(ApplicatorSettings::APPLY_CHANNEL_3.accepts_channel(3));
        assert!(!ApplicatorSettings::APPLY_CHANNEL_3.accepts_channel(4));
        let settings =
            ApplicatorSettings::APPLY_CHANNEL_0 | ApplicatorSettings::APPLY_CHANNEL_15;
        assert!(settings.accepts_channel(0));
        assert!(settings.accepts_channel(15));
        assert!(!settings.accepts_channel(7));
    }
}
