//! Interfaces consumed from the surrounding system.
//!
//! The sequencer core drives an external transport (the sync timer), a MIDI
//! router and a sampler backend, but implements none of them. The embedding
//! layer supplies these and is also responsible for forwarding the
//! transport's outbound signals back into the core: timer commands to
//! [`SegmentScheduler::handle_timer_command`], sent clip commands to
//! [`SegmentScheduler::on_clip_command_sent`], and timer-running changes to
//! the scheduler and the recorders.
//!
//! [`SegmentScheduler::handle_timer_command`]: crate::sequencer::SegmentScheduler::handle_timer_command
//! [`SegmentScheduler::on_clip_command_sent`]: crate::sequencer::SegmentScheduler::on_clip_command_sent

use crate::command::{ClipCommand, ClipId, TimerCommand};
use crate::sequencer::midi::MidiBuffer;

/// The external sync timer driving all playback.
///
/// Sub-steps are the transport's finest time unit; a beat contains
/// [`multiplier`](Transport::multiplier) of them. All scheduling offsets are
/// relative to "now" in sub-steps.
pub trait Transport: Send + Sync {
    /// Length of one sub-step in microseconds at the current tempo
    fn sub_step_length_micros(&self) -> u64;
    /// Current playhead position in sub-steps
    fn sub_step_playhead(&self) -> i64;
    /// Sub-steps per beat
    fn multiplier(&self) -> u64;
    /// Whether the timer is currently running
    fn timer_running(&self) -> bool;

    /// Queue a MIDI buffer to fire `offset` sub-steps from now
    fn schedule_midi_buffer(&self, buffer: MidiBuffer, offset: u64);
    /// Queue a clip command to fire `offset` sub-steps from now
    fn schedule_clip_command(&self, command: ClipCommand, offset: u64);
    /// Queue a timer command to fire `offset` sub-steps from now
    fn schedule_timer_command(&self, offset: u64, command: TimerCommand);

    /// Start the timer at the given tempo
    fn start(&self, bpm: u32);
    /// Stop the timer
    fn stop(&self);

    /// Convert a duration in seconds to a sub-step count at the given tempo
    fn seconds_to_sub_steps(&self, bpm: u32, seconds: f64) -> u64;
}

/// Routing targets the MIDI router understands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouterDestination {
    /// The internal synth engine
    Synth,
    /// The sampler backend
    Sampler,
    /// Hardware MIDI out
    External,
}

/// The external MIDI router.
pub trait Router: Send + Sync {
    /// Point a channel at a destination, optionally rewriting it to another
    /// channel on the way out
    fn set_channel_destination(
        &self,
        channel: u8,
        destination: RouterDestination,
        override_channel: Option<u8>,
    );
    /// Tell the router which synth engines are chained to a channel
    fn set_synth_channels(&self, channel: u8, engines: &[i32]);
}

/// A sampler clip as seen by the sequencer: key zone, slicing and volume.
pub trait SamplerClip: Send + Sync {
    fn id(&self) -> ClipId;
    fn key_zone_start(&self) -> u8;
    fn key_zone_end(&self) -> u8;
    /// Number of slices the clip is divided into
    fn slices(&self) -> i32;
    /// The midi note slice 0 is mapped to
    fn slice_base_midi_note(&self) -> u8;
    /// Which slice the given midi note addresses
    fn slice_for(&self, midi_note: u8) -> i32;
    fn root_note(&self) -> u8;
    fn volume_absolute(&self) -> f32;
}

/// The sampler backend's clip lookup.
pub trait Sampler: Send + Sync {
    fn clip_by_id(&self, id: ClipId) -> Option<&dyn SamplerClip>;
}
