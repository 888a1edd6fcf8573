pub mod types;

pub use types::{ClipCommand, ClipId, ClipScope, PatternChange, TimerCommand};
