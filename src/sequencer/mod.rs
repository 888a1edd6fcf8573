pub mod compiler;
pub mod image;
pub mod live;
pub mod midi;
pub mod note;
pub mod pattern;
pub mod player;
pub mod segment;
pub mod sequence;

pub use live::LiveRecorder;
pub use midi::{MidiBuffer, MidiEvent};
pub use note::{Note, NoteId, NoteRegistry};
pub use pattern::{NoteDestination, Pattern, SubnoteMetadata};
pub use player::{PatternPlayer, PlaybackContext};
pub use segment::{Playfield, Segment, SegmentClip, SegmentScheduler};
pub use sequence::Sequence;

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    use crate::command::{ClipCommand, ClipId, TimerCommand};
    use crate::sequencer::midi::MidiBuffer;
    use crate::transport::{Sampler, SamplerClip, Transport};

    /// Transport double that records everything scheduled against it
    pub(crate) struct RecordingTransport {
        running: AtomicBool,
        pub midi_buffers: Mutex<Vec<(u64, MidiBuffer)>>,
        pub clip_commands: Mutex<Vec<(u64, ClipCommand)>>,
        pub timer_commands: Mutex<Vec<(u64, TimerCommand)>>,
    }

    impl RecordingTransport {
        pub fn new() -> Self {
            Self {
                running: AtomicBool::new(false),
                midi_buffers: Mutex::new(Vec::new()),
                clip_commands: Mutex::new(Vec::new()),
                timer_commands: Mutex::new(Vec::new()),
            }
        }

        pub fn set_running(&self, running: bool) {
            self.running.store(running, Ordering::SeqCst);
        }

        pub fn is_running(&self) -> bool {
            self.running.load(Ordering::SeqCst)
        }
    }

    impl Transport for RecordingTransport {
        fn sub_step_length_micros(&self) -> u64 {
            1_000
        }

        fn sub_step_playhead(&self) -> i64 {
            0
        }

        fn multiplier(&self) -> u64 {
            32
        }

        fn timer_running(&self) -> bool {
            self.is_running()
        }

        fn schedule_midi_buffer(&self, buffer: MidiBuffer, offset: u64) {
            self.midi_buffers.lock().unwrap().push((offset, buffer));
        }

        fn schedule_clip_command(&self, command: ClipCommand, offset: u64) {
            self.clip_commands.lock().unwrap().push((offset, command));
        }

        fn schedule_timer_command(&self, offset: u64, command: TimerCommand) {
            self.timer_commands.lock().unwrap().push((offset, command));
        }

        fn start(&self, _bpm: u32) {
            self.set_running(true);
        }

        fn stop(&self) {
            self.set_running(false);
        }

        fn seconds_to_sub_steps(&self, bpm: u32, seconds: f64) -> u64 {
            (seconds * bpm as f64 / 60.0 * self.multiplier() as f64) as u64
        }
    }

    /// Sampler clip double with sixteen slices from note 60
    pub(crate) struct TestClip {
        id: ClipId,
        key_zone_start: u8,
        key_zone_end: u8,
    }

    impl TestClip {
        pub fn new(id: ClipId, key_zone_start: u8, key_zone_end: u8) -> Self {
            Self {
                id,
                key_zone_start,
                key_zone_end,
            }
        }
    }

    impl SamplerClip for TestClip {
        fn id(&self) -> ClipId {
            self.id
        }

        fn key_zone_start(&self) -> u8 {
            self.key_zone_start
        }

        fn key_zone_end(&self) -> u8 {
            self.key_zone_end
        }

        fn slices(&self) -> i32 {
            16
        }

        fn slice_base_midi_note(&self) -> u8 {
            60
        }

        fn slice_for(&self, midi_note: u8) -> i32 {
            midi_note as i32 % self.slices()
        }

        fn root_note(&self) -> u8 {
            60
        }

        fn volume_absolute(&self) -> f32 {
            1.0
        }
    }

    pub(crate) struct TestSampler {
        clips: Vec<TestClip>,
    }

    impl TestSampler {
        pub fn new(clips: Vec<TestClip>) -> Self {
            Self { clips }
        }
    }

    impl Sampler for TestSampler {
        fn clip_by_id(&self, id: ClipId) -> Option<&dyn SamplerClip> {
            self.clips
                .iter()
                .find(|clip| clip.id == id)
                .map(|clip| clip as &dyn SamplerClip)
        }
    }
}
