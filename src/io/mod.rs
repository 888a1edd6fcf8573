pub mod midi_intake;
pub mod midi_recorder;

pub use midi_intake::{IntakeProcess, MidiIntake, NoteMessage, PortConfig};
pub use midi_recorder::{ApplicatorSettings, MidiRecorder};
