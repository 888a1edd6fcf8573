use std::collections::HashMap;

use crate::io::midi_intake::NoteMessage;
use crate::io::midi_recorder::MidiRecorder;
use crate::sequencer::live::LiveRecorder;
use crate::sequencer::note::{NoteId, NoteRegistry};
use crate::sequencer::pattern::{NoteDestination, Pattern, CONTROL_CHANNEL};
use crate::sequencer::sequence::Sequence;
use crate::transport::{Router, RouterDestination};

/// Name used for the session-global sequence when none is given
pub const GLOBAL_SEQUENCE_NAME: &str = "Global";

/// Beat-subdivision counters derived from the 32-per-beat tick stream
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BeatSubdivisions {
    pub beat_4th: u64,
    pub beat_8th: u64,
    pub beat_16th: u64,
    pub beat_32nd: u64,
    pub beat_64th: u64,
    pub beat_128th: u64,
}

/// Process-wide container for the note registry, the named sequences and
/// the session's live-recording state.
///
/// Lives on the editing thread; playback components only ever borrow the
/// pieces they need.
pub struct Session {
    registry: NoteRegistry,
    sequences: HashMap<String, Sequence>,
    current_midi_channel: Option<u8>,
    live_recorder: LiveRecorder,
    midi_recorder: MidiRecorder,
    beats: BeatSubdivisions,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    pub fn new() -> Self {
        Self {
            registry: NoteRegistry::new(),
            sequences: HashMap::new(),
            current_midi_channel: None,
            live_recorder: LiveRecorder::new(),
            midi_recorder: MidiRecorder::new(),
            beats: BeatSubdivisions::default(),
        }
    }

    pub fn registry(&self) -> &NoteRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut NoteRegistry {
        &mut self.registry
    }

    pub fn live_recorder(&self) -> &LiveRecorder {
        &self.live_recorder
    }

    pub fn live_recorder_mut(&mut self) -> &mut LiveRecorder {
        &mut self.live_recorder
    }

    pub fn midi_recorder(&self) -> &MidiRecorder {
        &self.midi_recorder
    }

    pub fn midi_recorder_mut(&mut self) -> &mut MidiRecorder {
        &mut self.midi_recorder
    }

    /// Convenience for interning a note in the session registry
    pub fn note(&mut self, midi_note: u8, midi_channel: u8) -> Option<NoteId> {
        self.registry.note(midi_note, midi_channel)
    }

    pub fn current_midi_channel(&self) -> Option<u8> {
        self.current_midi_channel
    }

    /// Change the stand-in channel control-channel patterns play through.
    ///
    /// Their compiled buffers were built against the old stand-in, so the
    /// caches of every control-channel pattern are dropped.
    pub fn set_current_midi_channel(&mut self, channel: Option<u8>) {
        let channel = channel.filter(|&c| c < CONTROL_CHANNEL);
        if self.current_midi_channel == channel {
            return;
        }
        self.current_midi_channel = channel;
        for sequence in self.sequences.values() {
            for pattern in sequence.patterns() {
                if let Ok(mut pattern) = pattern.lock() {
                    if pattern.midi_channel() == CONTROL_CHANNEL {
                        pattern.invalidate_all();
                    }
                }
            }
        }
    }

    fn normalised_name(name: &str) -> &str {
        if name.is_empty() {
            GLOBAL_SEQUENCE_NAME
        } else {
            name
        }
    }

    /// Fetch a sequence by name, creating it on first use (the empty name
    /// denotes the session-global sequence)
    pub fn sequence_mut(&mut self, name: &str) -> &mut Sequence {
        let name = Self::normalised_name(name);
        self.sequences
            .entry(name.to_string())
            .or_insert_with(|| Sequence::new(name))
    }

    pub fn sequence(&self, name: &str) -> Option<&Sequence> {
        self.sequences.get(Self::normalised_name(name))
    }

    pub fn sequence_names(&self) -> impl Iterator<Item = &str> {
        self.sequences.keys().map(String::as_str)
    }

    /// Switch a sequence's active pattern, shutting live recording down when
    /// the target actually changes
    pub fn set_active_pattern(&mut self, sequence_name: &str, index: usize) {
        let changed = self.sequence_mut(sequence_name).set_active_pattern(index);
        if changed {
            self.live_recorder.set_enabled(false);
        }
    }

    /// Feed an intake note message into the live recorder, filtered against
    /// the active pattern's channel
    pub fn handle_live_midi(
        &mut self,
        sequence_name: &str,
        byte1: u8,
        byte2: u8,
        byte3: u8,
        timestamp: f64,
    ) {
        let Some(sequence) = self.sequences.get(Self::normalised_name(sequence_name)) else {
            return;
        };
        let Some(pattern) = sequence.pattern(sequence.active_pattern()) else {
            return;
        };
        let channel = match pattern.lock() {
            Ok(pattern) => pattern.midi_channel(),
            Err(_) => return,
        };
        self.live_recorder
            .handle_midi_message(channel, byte1, byte2, byte3, timestamp);
    }

    /// Drain completed live-recorded notes into the active pattern
    pub fn apply_live_recording(&mut self, sequence_name: &str) -> usize {
        let Some(sequence) = self.sequences.get(Self::normalised_name(sequence_name)) else {
            return 0;
        };
        let Some(pattern) = sequence.pattern(sequence.active_pattern()) else {
            return 0;
        };
        let pattern = pattern.clone();
        let Ok(mut pattern) = pattern.lock() else {
            return 0;
        };
        self.live_recorder
            .apply_completed(&mut pattern, &mut self.registry)
    }

    /// Fan one intake message out to the recorders: the MIDI recorder sees
    /// the raw bytes, the live recorder the timestamped note traffic
    pub fn handle_intake_message(&mut self, sequence_name: &str, message: &NoteMessage) {
        self.midi_recorder
            .handle_midi_message(message.bytes[0], message.bytes[1], message.bytes[2]);
        if message.is_note_like {
            self.handle_live_midi(
                sequence_name,
                message.bytes[0],
                message.bytes[1],
                message.bytes[2],
                message.time_stamp,
            );
        }
    }

    /// The transport stopped: recording ends, counters rewind, sequences
    /// detach from the tick stream
    pub fn handle_transport_stop(&mut self) {
        self.live_recorder.set_enabled(false);
        self.midi_recorder.on_timer_running_changed(false);
        self.beats = BeatSubdivisions::default();
        for sequence in self.sequences.values_mut() {
            sequence.disconnect_playback();
        }
    }

    pub fn beats(&self) -> BeatSubdivisions {
        self.beats
    }

    /// Update the subdivision counters from a 32-per-beat tick index
    pub fn metronome_tick(&mut self, beat: u64) {
        if beat % 32 == 0 {
            self.beats.beat_4th = beat / 32;
        }
        if beat % 16 == 0 {
            self.beats.beat_8th = beat / 16;
        }
        if beat % 8 == 0 {
            self.beats.beat_16th = beat / 8;
        }
        if beat % 4 == 0 {
            self.beats.beat_32nd = beat / 4;
        }
        if beat % 2 == 0 {
            self.beats.beat_64th = beat / 2;
        }
        self.beats.beat_128th = beat;
    }
}

/// Push a pattern's routing into the MIDI router.
///
/// Sampler-bound destinations route to the sampler, external patterns to
/// hardware out (rewritten to the external channel when one is set), and
/// everything else to the synth engine.
pub fn update_routing(pattern: &Pattern, router: &dyn Router) {
    let actual_channel = match (pattern.note_destination(), pattern.external_midi_channel()) {
        (NoteDestination::External, Some(external)) => external,
        _ => pattern.midi_channel(),
    };
    let destination = match pattern.note_destination() {
        NoteDestination::SampleTrigger | NoteDestination::SampleSliced => {
            RouterDestination::Sampler
        }
        NoteDestination::External => RouterDestination::External,
        NoteDestination::Synth | NoteDestination::SampleLooped => RouterDestination::Synth,
    };
    let override_channel = if actual_channel == pattern.midi_channel() {
        None
    } else {
        Some(actual_channel)
    };
    router.set_channel_destination(pattern.midi_channel(), destination, override_channel);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn sequences_are_created_on_demand_and_named() {
        let mut session = Session::new();
        session.sequence_mut("T1");
        session.sequence_mut("");
        assert!(session.sequence("T1").is_some());
        assert_eq!(
            session.sequence("").unwrap().name(),
            GLOBAL_SEQUENCE_NAME
        );
    }

    #[test]
    fn beat_counters_divide_the_tick_stream() {
        let mut session = Session::new();
        session.metronome_tick(64);
        assert_eq!(session.beats().beat_4th, 2);
        assert_eq!(session.beats().beat_8th, 4);
        assert_eq!(session.beats().beat_128th, 64);
        session.metronome_tick(65);
        // Coarser counters hold their value between their own boundaries
        assert_eq!(session.beats().beat_4th, 2);
        assert_eq!(session.beats().beat_128th, 65);
    }

    #[test]
    fn active_pattern_change_disables_live_recording() {
        let mut session = Session::new();
        {
            let sequence = session.sequence_mut("T1");
            sequence.add_pattern(Pattern::new("Pattern 1"));
            sequence.add_pattern(Pattern::new("Pattern 2"));
        }
        session.live_recorder_mut().set_enabled(true);
        session.set_active_pattern("T1", 1);
        assert!(!session.live_recorder().enabled());
        // Re-selecting the same pattern is not a change
        session.live_recorder_mut().set_enabled(true);
        session.set_active_pattern("T1", 1);
        assert!(session.live_recorder().enabled());
    }

    #[test]
    fn current_channel_change_invalidates_control_channel_caches() {
        let mut session = Session::new();
        {
            let sequence = session.sequence_mut("T1");
            sequence.add_pattern(Pattern::new("Pattern 1"));
        }
        {
            let sequence = session.sequence("T1").unwrap();
            let mut pattern = sequence.pattern(0).unwrap().lock().unwrap();
            pattern.store_buffers(0, Default::default());
        }
        session.set_current_midi_channel(Some(3));
        let sequence = session.sequence("T1").unwrap();
        let pattern = sequence.pattern(0).unwrap().lock().unwrap();
        assert!(!pattern.has_cached_buffers(0));
    }

    #[test]
    fn routing_follows_the_destination() {
        struct RecordingRouter {
            calls: Mutex<Vec<(u8, RouterDestination, Option<u8>)>>,
        }
        impl Router for RecordingRouter {
            fn set_channel_destination(
                &self,
                channel: u8,
                destination: RouterDestination,
                override_channel: Option<u8>,
            ) {
                self.calls
                    .lock()
                    .unwrap()
                    .push((channel, destination, override_channel));
            }
            fn set_synth_channels(&self, _channel: u8, _engines: &[i32]) {}
        }

        let router = RecordingRouter {
            calls: Mutex::new(Vec::new()),
        };
        let mut registry = NoteRegistry::new();
        let mut pattern = Pattern::new("Pattern 1");
        pattern.set_midi_channel(&mut registry, 4);
        pattern.set_note_destination(NoteDestination::External);
        pattern.set_external_midi_channel(Some(9));
        update_routing(&pattern, &router);

        let calls = router.calls.lock().unwrap();
        assert_eq!(calls[0], (4, RouterDestination::External, Some(9)));
    }
}
