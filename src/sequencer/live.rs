use log::{debug, warn};

use crate::sequencer::compiler::step_duration;
use crate::sequencer::note::NoteRegistry;
use crate::sequencer::pattern::Pattern;

/// Slots preallocated for notes that are held down mid-recording
pub const PENDING_NOTE_POOL_SIZE: usize = 100;

/// Fraction of a step within which a recorded timing snaps to the grid
pub const DEFAULT_TOLERANCE_FACTOR: f64 = 0.3;

#[derive(Debug, Clone, Copy, Default)]
struct PendingNote {
    timestamp: i64,
    midi_note: u8,
    velocity: u8,
}

/// A completed note-on/note-off pair waiting to be written into the grid
#[derive(Debug, Clone, Copy)]
pub struct RecordedNote {
    pub timestamp: i64,
    pub end_timestamp: i64,
    pub midi_note: u8,
    pub velocity: u8,
}

/// Matches live note-on/note-off pairs and writes them into a pattern with
/// sub-step quantisation.
///
/// The message-facing half (`handle_midi_message`) works against a fixed
/// pool of pending-note slots and never allocates; completed records queue
/// up for the editing thread, which drains them with
/// [`apply_completed`](LiveRecorder::apply_completed).
pub struct LiveRecorder {
    enabled: bool,
    tolerance_factor: f64,
    pool: Vec<PendingNote>,
    held: Vec<PendingNote>,
    completed: Vec<RecordedNote>,
    dropped: u64,
}

impl Default for LiveRecorder {
    fn default() -> Self {
        Self::new()
    }
}

impl LiveRecorder {
    pub fn new() -> Self {
        Self {
            enabled: false,
            tolerance_factor: DEFAULT_TOLERANCE_FACTOR,
            pool: vec![PendingNote::default(); PENDING_NOTE_POOL_SIZE],
            held: Vec::with_capacity(PENDING_NOTE_POOL_SIZE),
            completed: Vec::new(),
            dropped: 0,
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Enable or disable recording; disabling returns any still-held notes
    /// to the pool unwritten
    pub fn set_enabled(&mut self, enabled: bool) {
        if self.enabled != enabled {
            self.enabled = enabled;
            if !enabled {
                self.held.clear();
                self.replenish();
            }
        }
    }

    pub fn tolerance_factor(&self) -> f64 {
        self.tolerance_factor
    }

    /// Adjust how forgiving quantisation is (default 0.3 of a step)
    pub fn set_tolerance_factor(&mut self, factor: f64) {
        self.tolerance_factor = factor.max(0.0);
    }

    /// Notes dropped because the pending pool was exhausted
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Feed one timestamped message through the recorder.
    ///
    /// `timestamp` is in transport sub-steps, as produced by the MIDI
    /// intake. Messages on other channels must already be filtered out by
    /// the caller's channel filter.
    pub fn handle_midi_message(
        &mut self,
        pattern_channel: u8,
        byte1: u8,
        byte2: u8,
        byte3: u8,
        timestamp: f64,
    ) {
        if self.enabled && (0x90..0xA0).contains(&byte1) && byte3 > 0 {
            if byte1 & 0x0F != pattern_channel {
                return;
            }
            match self.pool.pop() {
                Some(mut slot) => {
                    slot.timestamp = timestamp as i64;
                    slot.midi_note = byte2;
                    slot.velocity = byte3;
                    self.held.push(slot);
                }
                None => {
                    self.dropped += 1;
                    warn!("pending-note pool exhausted, dropping live note {}", byte2);
                }
            }
            return;
        }
        let is_off = (0x80..0x90).contains(&byte1) || ((0x90..0xA0).contains(&byte1) && byte3 == 0);
        if is_off && !self.held.is_empty() && byte1 & 0x0F == pattern_channel {
            if let Some(index) = self.held.iter().position(|held| held.midi_note == byte2) {
                let pending = self.held.remove(index);
                self.completed.push(RecordedNote {
                    timestamp: pending.timestamp,
                    end_timestamp: timestamp as i64,
                    midi_note: pending.midi_note,
                    velocity: pending.velocity,
                });
            }
        }
    }

    /// Write every completed record into the pattern; returns how many
    /// actually changed it
    pub fn apply_completed(&mut self, pattern: &mut Pattern, registry: &mut NoteRegistry) -> usize {
        let completed = std::mem::take(&mut self.completed);
        self.replenish();
        let mut written = 0;
        for note in completed {
            if apply_recorded_note(pattern, registry, &note, self.tolerance_factor) {
                written += 1;
            }
        }
        written
    }

    fn replenish(&mut self) {
        while self.pool.len() + self.held.len() < PENDING_NOTE_POOL_SIZE {
            self.pool.push(PendingNote::default());
        }
    }
}

/// Quantise one recorded note into its grid position and write it.
///
/// Timing within `tolerance = max(1, ceil(step * factor))` of a step
/// boundary snaps to it (possibly advancing to the next step); a duration
/// within tolerance of the step length becomes 0, meaning "use the step
/// default". Returns `false` when the pattern already held an identical
/// subnote, or when the pattern's note length is invalid.
pub fn apply_recorded_note(
    pattern: &mut Pattern,
    registry: &mut NoteRegistry,
    note: &RecordedNote,
    tolerance_factor: f64,
) -> bool {
    let Some(step_duration) = step_duration(pattern.note_length()) else {
        return false;
    };
    let step_duration = step_duration as i64;
    let tolerance = ((step_duration as f64 * tolerance_factor).ceil() as i64).max(1);
    let pattern_length = (pattern.width() * pattern.available_bars()) as i64;

    let normalised = note.timestamp.rem_euclid(pattern_length * step_duration);
    let mut step = normalised / step_duration;
    let mut delay = normalised - step * step_duration;
    if delay < tolerance {
        delay = 0;
    } else if step_duration - delay < tolerance {
        step = (step + 1) % pattern_length;
        delay = 0;
    }

    let width = pattern.width() as i64;
    let bars = pattern.available_bars() as i64;
    let row = (step / width) % bars;
    let column = step - row * width;
    let row = pattern.bank_offset() + row as usize;
    let column = column as usize;

    let mut duration = note.end_timestamp - note.timestamp;
    if (duration - step_duration).abs() < tolerance {
        duration = 0;
    }

    let index = match pattern.subnote_index(row, column, note.midi_note) {
        Some(index) => {
            let same = |key: &str, value: i64| {
                pattern
                    .subnote_metadata(row, column, index, key)
                    .and_then(|v| v.as_i64())
                    .unwrap_or(0)
                    == value
            };
            if same("velocity", note.velocity as i64)
                && same("duration", duration)
                && same("delay", delay)
            {
                // Identical hit already in the grid, nothing to change
                return false;
            }
            index
        }
        None => {
            let Some(id) = registry.note(note.midi_note, pattern.midi_channel()) else {
                return false;
            };
            match pattern.add_subnote(registry, row, column, id) {
                Some(index) => index,
                None => return false,
            }
        }
    };

    pattern.set_subnote_metadata(row, column, index, "velocity", Some((note.velocity as i64).into()));
    pattern.set_subnote_metadata(row, column, index, "duration", Some(duration.into()));
    pattern.set_subnote_metadata(row, column, index, "delay", Some(delay.into()));
    debug!(
        "recorded note {} at ({}, {}) delay {} duration {}",
        note.midi_note, row, column, delay, duration
    );
    true
}
