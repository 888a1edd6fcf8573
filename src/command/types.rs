/// Identifier of a sampler clip as handed out by the sampler backend.
///
/// Values below 1 mean "no clip" and commands referencing them are ignored.
pub type ClipId = i32;

/// Commands the song scheduler hands to the transport's command queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerCommand {
    /// Start looping a sampler clip (channel, clip id, midi note)
    StartClipLoop {
        channel: u8,
        clip_id: ClipId,
        note: u8,
    },
    /// Stop looping a sampler clip (channel, clip id, midi note)
    StopClipLoop {
        channel: u8,
        clip_id: ClipId,
        note: u8,
    },
    /// Mark a playfield part as sounding (channel, column, part, sub-step offset the part was started at)
    StartPart {
        channel: u8,
        column: u8,
        part: u8,
        offset: u64,
    },
    /// Mark a playfield part as silent (channel, column, part)
    StopPart { channel: u8, column: u8, part: u8 },
    /// Halt song playback entirely
    StopPlayback,
}

/// Which sampler voice pool a clip command addresses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClipScope {
    /// Play through the per-channel voice pool
    Channel(u8),
    /// Play through the dry (uneffected) global pool
    NoEffect,
    /// Play through the effected global pool
    Effected,
}

/// An instruction to the sampler to start or stop a clip
///
/// Mirrors what the sampler backend consumes: at most one of
/// `start_playback`/`stop_playback` is set, and the `change_*` flags gate
/// whether the accompanying value is applied.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClipCommand {
    pub clip_id: ClipId,
    pub scope: ClipScope,
    pub start_playback: bool,
    pub stop_playback: bool,
    pub change_volume: bool,
    pub volume: f32,
    pub change_slice: bool,
    pub slice: i32,
    pub midi_note: u8,
    pub looping: bool,
}

impl ClipCommand {
    fn new(clip_id: ClipId, scope: ClipScope) -> Self {
        Self {
            clip_id,
            scope,
            start_playback: false,
            stop_playback: false,
            change_volume: false,
            volume: 0.0,
            change_slice: false,
            slice: 0,
            midi_note: 60,
            looping: false,
        }
    }

    /// A command addressing the given channel's voice pool
    pub fn channel_command(clip_id: ClipId, channel: u8) -> Self {
        Self::new(clip_id, ClipScope::Channel(channel))
    }

    /// A command addressing the dry global voice pool
    pub fn no_effect_command(clip_id: ClipId) -> Self {
        Self::new(clip_id, ClipScope::NoEffect)
    }

    /// A command addressing the effected global voice pool
    pub fn effected_command(clip_id: ClipId) -> Self {
        Self::new(clip_id, ClipScope::Effected)
    }
}

/// Structural change notifications published to pattern observers
///
/// Emitted by the edit thread after each mutation has been applied (and the
/// pattern lock released), so observers see settled state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatternChange {
    /// A single cell's subnotes or metadata changed
    Cell { row: usize, column: usize },
    /// The grid's shape or one of its playback properties changed
    Structure,
}
