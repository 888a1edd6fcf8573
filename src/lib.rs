// Playgrid backend - step-based MIDI sequencer core
//
// Pattern grids with per-step micro-timing compile into pre-scheduled MIDI
// buffers, a live recorder quantises played notes back into the grid, and a
// song scheduler turns segment lists into timer commands for an external
// transport. JACK MIDI intake feeds all of it through lock-free rings.

pub mod command;
pub mod error;
pub mod io;
pub mod sequencer;
pub mod session;
pub mod transport;

// Re-export commonly used types
pub use command::{ClipCommand, ClipId, ClipScope, PatternChange, TimerCommand};
pub use error::{Error, Result};
pub use io::{MidiIntake, MidiRecorder, NoteMessage};
pub use sequencer::{
    LiveRecorder, MidiBuffer, MidiEvent, NoteDestination, NoteId, NoteRegistry, Pattern,
    PatternPlayer, Playfield, PlaybackContext, Segment, SegmentClip, SegmentScheduler, Sequence,
};
pub use session::Session;
pub use transport::{Router, RouterDestination, Sampler, SamplerClip, Transport};
