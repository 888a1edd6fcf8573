use std::collections::{BTreeMap, HashMap};

use log::warn;
use serde_json::Value;

use crate::command::{ClipId, PatternChange};
use crate::sequencer::compiler::LOOKAHEAD;
use crate::sequencer::midi::MidiBuffer;
use crate::sequencer::note::{NoteId, NoteRegistry};

/// Velocity used when a subnote has no metadata
pub const DEFAULT_VELOCITY: i64 = 64;

/// The control channel; patterns on it never emit notes of their own
pub const CONTROL_CHANNEL: u8 = 15;

/// Part slot names within a channel
const PART_NAMES: [&str; 5] = ["a", "b", "c", "d", "e"];

/// Where a pattern's compiled notes are sent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NoteDestination {
    /// The internal synth engine (the default)
    #[default]
    Synth,
    /// Sampler, one clip per key zone
    SampleTrigger,
    /// Sampler, notes select slices of a clip
    SampleSliced,
    /// Sampler loops the clip; the pattern itself stays silent
    SampleLooped,
    /// Hardware MIDI out via the router
    External,
}

/// Per-subnote metadata: a string-keyed scalar map.
///
/// The keys playback understands are `velocity` (0-127), `delay` (sub-steps,
/// may be negative) and `duration` (sub-steps, 0 meaning "use step length").
/// Anything else rides along untouched and is persisted verbatim.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubnoteMetadata(serde_json::Map<String, Value>);

impl SubnoteMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Set a key, or remove it when `value` is `None`
    pub fn set(&mut self, key: &str, value: Option<Value>) {
        match value {
            Some(value) => {
                self.0.insert(key.to_string(), value);
            }
            None => {
                self.0.remove(key);
            }
        }
    }

    pub fn set_int(&mut self, key: &str, value: i64) {
        self.0.insert(key.to_string(), Value::from(value));
    }

    fn int(&self, key: &str) -> Option<i64> {
        self.0.get(key).and_then(Value::as_i64)
    }

    pub fn velocity(&self) -> Option<i64> {
        self.int("velocity")
    }

    pub fn delay(&self) -> Option<i64> {
        self.int("delay")
    }

    pub fn duration(&self) -> Option<i64> {
        self.int("duration")
    }

    pub fn entries(&self) -> &serde_json::Map<String, Value> {
        &self.0
    }

    pub fn from_entries(entries: serde_json::Map<String, Value>) -> Self {
        Self(entries)
    }
}

/// One subnote reference in a cell.
///
/// Carries the note's value and channel alongside its identity so the
/// compiler can run without touching the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subnote {
    pub id: NoteId,
    pub midi_note: u8,
    pub midi_channel: u8,
}

/// A grid position: an optional compound note, its ordered subnotes, and
/// their metadata (always the same length as the subnote list).
#[derive(Debug, Clone, Default)]
pub struct Cell {
    compound: Option<NoteId>,
    subnotes: Vec<Subnote>,
    metadata: Vec<SubnoteMetadata>,
}

impl Cell {
    pub fn compound(&self) -> Option<NoteId> {
        self.compound
    }

    pub fn subnotes(&self) -> &[Subnote] {
        &self.subnotes
    }

    pub fn metadata(&self) -> &[SubnoteMetadata] {
        &self.metadata
    }

    pub fn is_empty(&self) -> bool {
        self.subnotes.is_empty()
    }
}

/// Compiled MIDI for one grid position, keyed by sub-step offset relative
/// to the position's own emit time (negative keys come from early
/// micro-timing in look-ahead cells).
pub type PositionBuffers = BTreeMap<i64, MidiBuffer>;

/// A rectangular grid of cells making up one musical pattern.
///
/// All mutation happens on the editing thread; the scheduler thread only
/// reads cells and the compiled-buffer cache, both guarded by whatever lock
/// wraps the pattern. Every mutation invalidates the compiled buffers it
/// could influence, including those of the preceding look-ahead positions.
pub struct Pattern {
    name: String,
    rows: Vec<Vec<Cell>>,
    width: usize,
    midi_channel: u8,
    external_midi_channel: Option<u8>,
    note_destination: NoteDestination,
    note_length: i32,
    available_bars: usize,
    active_bar: usize,
    bank_offset: usize,
    bank_length: usize,
    enabled: bool,
    channel_muted: bool,
    default_note_duration: i64,
    playing_row: usize,
    playing_column: usize,
    channel_index: usize,
    part_index: usize,
    clip_ids: Vec<ClipId>,
    stale_channels: Vec<u8>,
    position_buffers: HashMap<usize, PositionBuffers>,
    observers: Vec<Box<dyn FnMut(PatternChange) + Send>>,
}

impl std::fmt::Debug for Pattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pattern")
            .field("name", &self.name)
            .field("width", &self.width)
            .field("height", &self.rows.len())
            .field("midi_channel", &self.midi_channel)
            .field("note_length", &self.note_length)
            .field("available_bars", &self.available_bars)
            .finish()
    }
}

impl Pattern {
    pub fn new(name: impl Into<String>) -> Self {
        let mut pattern = Self {
            name: name.into(),
            rows: Vec::new(),
            width: 16,
            midi_channel: CONTROL_CHANNEL,
            external_midi_channel: None,
            note_destination: NoteDestination::Synth,
            note_length: 3,
            available_bars: 1,
            active_bar: 0,
            bank_offset: 0,
            bank_length: 8,
            enabled: true,
            channel_muted: false,
            default_note_duration: 0,
            playing_row: 0,
            playing_column: 0,
            channel_index: 0,
            part_index: 0,
            clip_ids: Vec::new(),
            stale_channels: Vec::new(),
            position_buffers: HashMap::new(),
            observers: Vec::new(),
        };
        pattern.set_height(16);
        pattern
    }

    // --- observers ---

    /// Register a change observer; it runs on the editing thread after each
    /// structural mutation has been applied.
    pub fn add_observer(&mut self, observer: impl FnMut(PatternChange) + Send + 'static) {
        self.observers.push(Box::new(observer));
    }

    fn notify(&mut self, change: PatternChange) {
        for observer in &mut self.observers {
            observer(change);
        }
    }

    // --- shape and simple properties ---

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.rows.len()
    }

    /// Resize the row width; notes in dropped tail columns are removed
    pub fn set_width(&mut self, width: usize) {
        if width == 0 || width == self.width {
            return;
        }
        for row in &mut self.rows {
            row.resize_with(width, Cell::default);
        }
        self.width = width;
        self.invalidate_all();
        self.notify(PatternChange::Structure);
    }

    /// Resize the row count; dropped rows lose their notes
    pub fn set_height(&mut self, height: usize) {
        if height == self.rows.len() {
            return;
        }
        let width = self.width;
        self.rows
            .resize_with(height, || vec![Cell::default(); width]);
        self.invalidate_all();
        self.notify(PatternChange::Structure);
    }

    pub fn midi_channel(&self) -> u8 {
        self.midi_channel
    }

    /// Change the pattern's channel, remapping every note reference in the
    /// grid to the equivalent note on the new channel.
    ///
    /// The old channel is remembered so the player can flush an all-notes-off
    /// for it before the next step fires.
    pub fn set_midi_channel(&mut self, registry: &mut NoteRegistry, midi_channel: u8) {
        let midi_channel = midi_channel.min(15);
        if self.midi_channel == midi_channel {
            return;
        }
        let previous = self.midi_channel;
        self.midi_channel = midi_channel;
        for row in &mut self.rows {
            for cell in row.iter_mut() {
                if cell.subnotes.is_empty() {
                    continue;
                }
                for subnote in &mut cell.subnotes {
                    // Interning cannot fail here: the value range was checked
                    // when the subnote first entered the grid
                    if let Some(id) = registry.note(subnote.midi_note, midi_channel) {
                        subnote.id = id;
                        subnote.midi_channel = midi_channel;
                    }
                }
                let ids: Vec<NoteId> = cell.subnotes.iter().map(|s| s.id).collect();
                cell.compound = registry.compound(&ids);
            }
        }
        self.stale_channels.push(previous);
        self.invalidate_all();
        self.notify(PatternChange::Structure);
    }

    pub fn external_midi_channel(&self) -> Option<u8> {
        self.external_midi_channel
    }

    pub fn set_external_midi_channel(&mut self, channel: Option<u8>) {
        if self.external_midi_channel != channel {
            self.external_midi_channel = channel;
            self.notify(PatternChange::Structure);
        }
    }

    pub fn note_destination(&self) -> NoteDestination {
        self.note_destination
    }

    /// Change the destination; the current channel is flushed with an
    /// all-notes-off before the next step so nothing hangs across the switch
    pub fn set_note_destination(&mut self, destination: NoteDestination) {
        if self.note_destination != destination {
            self.stale_channels.push(self.midi_channel);
            self.note_destination = destination;
            self.notify(PatternChange::Structure);
        }
    }

    pub fn note_length(&self) -> i32 {
        self.note_length
    }

    pub fn set_note_length(&mut self, note_length: i32) {
        if self.note_length != note_length {
            self.note_length = note_length;
            self.invalidate_all();
            self.notify(PatternChange::Structure);
        }
    }

    pub fn available_bars(&self) -> usize {
        self.available_bars
    }

    pub fn set_available_bars(&mut self, available_bars: usize) {
        let adjusted = available_bars.clamp(1, self.bank_length);
        if self.available_bars != adjusted {
            self.available_bars = adjusted;
            self.set_active_bar(self.active_bar);
            self.invalidate_all();
            self.notify(PatternChange::Structure);
        }
    }

    pub fn active_bar(&self) -> usize {
        self.active_bar
    }

    pub fn set_active_bar(&mut self, active_bar: usize) {
        let adjusted = active_bar.min(self.available_bars.saturating_sub(1));
        if self.active_bar != adjusted {
            self.active_bar = adjusted;
            self.notify(PatternChange::Structure);
        }
    }

    pub fn bank_offset(&self) -> usize {
        self.bank_offset
    }

    pub fn set_bank_offset(&mut self, bank_offset: usize) {
        if self.bank_offset != bank_offset {
            self.bank_offset = bank_offset;
            self.invalidate_all();
            self.notify(PatternChange::Structure);
        }
    }

    pub fn bank_length(&self) -> usize {
        self.bank_length
    }

    pub fn set_bank_length(&mut self, bank_length: usize) {
        if bank_length > 0 && self.bank_length != bank_length {
            self.bank_length = bank_length;
            // Available bars may no longer fit inside a bank
            self.set_available_bars(self.available_bars);
            self.invalidate_all();
            self.notify(PatternChange::Structure);
        }
    }

    /// Select a bank by name; "I"/"II"/"III" (or the legacy "A"/"B"/"C")
    pub fn set_bank(&mut self, bank: &str) {
        let offset = match bank.to_uppercase().as_str() {
            "A" | "I" => 0,
            "B" | "II" => self.bank_length,
            "C" | "III" => self.bank_length * 2,
            _ => self.bank_offset,
        };
        self.set_bank_offset(offset);
    }

    pub fn bank_name(&self) -> &'static str {
        match self.bank_offset / self.bank_length {
            0 => "I",
            1 => "II",
            2 => "III",
            _ => "(?)",
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        if self.enabled != enabled {
            self.enabled = enabled;
            self.notify(PatternChange::Structure);
        }
    }

    pub fn channel_muted(&self) -> bool {
        self.channel_muted
    }

    /// Mute flag mirrored from the embedding layer's channel strip
    pub fn set_channel_muted(&mut self, muted: bool) {
        self.channel_muted = muted;
    }

    pub fn default_note_duration(&self) -> i64 {
        self.default_note_duration
    }

    pub fn set_default_note_duration(&mut self, duration: i64) {
        if self.default_note_duration != duration {
            self.default_note_duration = duration;
            self.notify(PatternChange::Structure);
        }
    }

    pub fn clip_ids(&self) -> &[ClipId] {
        &self.clip_ids
    }

    pub fn set_clip_ids(&mut self, clip_ids: Vec<ClipId>) {
        if self.clip_ids != clip_ids {
            self.clip_ids = clip_ids;
            self.notify(PatternChange::Structure);
        }
    }

    pub fn channel_index(&self) -> usize {
        self.channel_index
    }

    pub fn set_channel_index(&mut self, channel_index: usize) {
        self.channel_index = channel_index;
    }

    pub fn part_index(&self) -> usize {
        self.part_index
    }

    pub fn set_part_index(&mut self, part_index: usize) {
        self.part_index = part_index;
    }

    pub fn part_name(&self) -> &'static str {
        PART_NAMES.get(self.part_index).copied().unwrap_or("")
    }

    /// Image-provider URL for this pattern's current bank
    pub fn thumbnail_url(&self, sequence_name: &str, pattern_index: usize) -> String {
        format!(
            "image://pattern/{}/{}/{}",
            sequence_name,
            pattern_index,
            self.bank_offset / self.bank_length
        )
    }

    // --- playhead indicators ---

    pub fn playing_row(&self) -> usize {
        self.playing_row
    }

    pub fn playing_column(&self) -> usize {
        self.playing_column
    }

    pub(crate) fn set_playing_position(&mut self, row: usize, column: usize) {
        self.playing_row = row;
        self.playing_column = column;
    }

    pub(crate) fn reset_playing_position(&mut self) {
        self.playing_row = 0;
        self.playing_column = 0;
    }

    // --- cells ---

    pub fn cell(&self, row: usize, column: usize) -> Option<&Cell> {
        self.rows.get(row)?.get(column)
    }

    fn check_position(&self, row: usize, column: usize) -> bool {
        if row >= self.rows.len() || column >= self.width {
            warn!(
                "position ({}, {}) is outside the {}x{} grid, ignoring",
                row,
                column,
                self.rows.len(),
                self.width
            );
            return false;
        }
        true
    }

    /// Index of the subnote with the given value at a position, if any
    pub fn subnote_index(&self, row: usize, column: usize, midi_note: u8) -> Option<usize> {
        self.cell(row, column)?
            .subnotes
            .iter()
            .position(|subnote| subnote.midi_note == midi_note)
    }

    fn normalised(&self, registry: &mut NoteRegistry, note: NoteId) -> Option<Subnote> {
        let (midi_note, midi_channel) = {
            let note = registry.get(note);
            (note.midi_note(), note.midi_channel())
        };
        let id = if midi_channel == self.midi_channel {
            note
        } else {
            registry.note(midi_note, self.midi_channel)?
        };
        Some(Subnote {
            id,
            midi_note,
            midi_channel: self.midi_channel,
        })
    }

    fn refresh_compound(cell: &mut Cell, registry: &mut NoteRegistry) {
        let ids: Vec<NoteId> = cell.subnotes.iter().map(|s| s.id).collect();
        cell.compound = registry.compound(&ids);
    }

    /// Append a subnote to a position, returning its index.
    ///
    /// The note is normalised to the pattern's channel on the way in.
    pub fn add_subnote(
        &mut self,
        registry: &mut NoteRegistry,
        row: usize,
        column: usize,
        note: NoteId,
    ) -> Option<usize> {
        if !self.check_position(row, column) {
            return None;
        }
        let subnote = self.normalised(registry, note)?;
        let cell = &mut self.rows[row][column];
        cell.subnotes.push(subnote);
        cell.metadata.push(SubnoteMetadata::new());
        Self::refresh_compound(cell, registry);
        self.invalidate_position(row, column);
        self.notify(PatternChange::Cell { row, column });
        Some(self.rows[row][column].subnotes.len() - 1)
    }

    /// Insert a subnote at a specific index (clamped to the list length)
    pub fn insert_subnote(
        &mut self,
        registry: &mut NoteRegistry,
        row: usize,
        column: usize,
        index: usize,
        note: NoteId,
    ) {
        if !self.check_position(row, column) {
            return;
        }
        let Some(subnote) = self.normalised(registry, note) else {
            return;
        };
        let cell = &mut self.rows[row][column];
        let index = index.min(cell.subnotes.len());
        cell.subnotes.insert(index, subnote);
        cell.metadata.insert(index, SubnoteMetadata::new());
        Self::refresh_compound(cell, registry);
        self.invalidate_position(row, column);
        self.notify(PatternChange::Cell { row, column });
    }

    /// Insert a subnote keeping the list sorted ascending by note value,
    /// returning the insertion index
    pub fn insert_subnote_sorted(
        &mut self,
        registry: &mut NoteRegistry,
        row: usize,
        column: usize,
        note: NoteId,
    ) -> Option<usize> {
        if !self.check_position(row, column) {
            return None;
        }
        let subnote = self.normalised(registry, note)?;
        let cell = &mut self.rows[row][column];
        let mut index = 0;
        for existing in &cell.subnotes {
            if existing.midi_note <= subnote.midi_note {
                index += 1;
            } else {
                break;
            }
        }
        cell.subnotes.insert(index, subnote);
        cell.metadata.insert(index, SubnoteMetadata::new());
        Self::refresh_compound(cell, registry);
        self.invalidate_position(row, column);
        self.notify(PatternChange::Cell { row, column });
        Some(index)
    }

    /// Remove the subnote at the given index from a position
    pub fn remove_subnote(
        &mut self,
        registry: &mut NoteRegistry,
        row: usize,
        column: usize,
        index: usize,
    ) {
        if !self.check_position(row, column) {
            return;
        }
        let cell = &mut self.rows[row][column];
        if index >= cell.subnotes.len() {
            warn!("no subnote {} at ({}, {}), ignoring", index, row, column);
            return;
        }
        cell.subnotes.remove(index);
        cell.metadata.remove(index);
        Self::refresh_compound(cell, registry);
        self.invalidate_position(row, column);
        self.notify(PatternChange::Cell { row, column });
    }

    /// Set (or, with `None`, remove) one metadata key on a subnote
    pub fn set_subnote_metadata(
        &mut self,
        row: usize,
        column: usize,
        index: usize,
        key: &str,
        value: Option<Value>,
    ) {
        if !self.check_position(row, column) {
            return;
        }
        let cell = &mut self.rows[row][column];
        let Some(metadata) = cell.metadata.get_mut(index) else {
            warn!("no subnote {} at ({}, {}), ignoring", index, row, column);
            return;
        };
        metadata.set(key, value);
        self.invalidate_position(row, column);
        self.notify(PatternChange::Cell { row, column });
    }

    pub fn subnote_metadata(
        &self,
        row: usize,
        column: usize,
        index: usize,
        key: &str,
    ) -> Option<Value> {
        self.cell(row, column)?
            .metadata
            .get(index)?
            .get(key)
            .cloned()
    }

    /// Replace a whole cell (used by persistence and cloning)
    pub(crate) fn set_cell(
        &mut self,
        registry: &mut NoteRegistry,
        row: usize,
        column: usize,
        subnotes: Vec<Subnote>,
        metadata: Vec<SubnoteMetadata>,
    ) {
        if !self.check_position(row, column) {
            return;
        }
        if !metadata.is_empty() && metadata.len() != subnotes.len() {
            warn!(
                "metadata length {} does not match subnote count {} at ({}, {}), ignoring",
                metadata.len(),
                subnotes.len(),
                row,
                column
            );
            return;
        }
        let cell = &mut self.rows[row][column];
        cell.metadata = if metadata.is_empty() {
            vec![SubnoteMetadata::new(); subnotes.len()]
        } else {
            metadata
        };
        cell.subnotes = subnotes;
        Self::refresh_compound(cell, registry);
        self.invalidate_position(row, column);
        self.notify(PatternChange::Cell { row, column });
    }

    /// Remove all notes and metadata
    pub fn clear(&mut self) {
        for row in &mut self.rows {
            for cell in row.iter_mut() {
                *cell = Cell::default();
            }
        }
        self.invalidate_all();
        self.notify(PatternChange::Structure);
    }

    /// Remove all notes and metadata from one row
    pub fn clear_row(&mut self, row: usize) {
        if row >= self.rows.len() {
            return;
        }
        for cell in &mut self.rows[row] {
            *cell = Cell::default();
        }
        self.invalidate_all();
        self.notify(PatternChange::Structure);
    }

    /// Remove all notes and metadata from one bank's rows
    pub fn clear_bank(&mut self, bank: usize) {
        for i in 0..self.bank_length {
            self.clear_row(bank * self.bank_length + i);
        }
    }

    /// Restore playback defaults, optionally dropping all notes too
    pub fn reset(&mut self, clear_notes: bool) {
        self.note_destination = NoteDestination::Synth;
        self.external_midi_channel = None;
        self.default_note_duration = 0;
        self.note_length = 3;
        self.available_bars = 1;
        self.active_bar = 0;
        self.bank_offset = 0;
        self.bank_length = 8;
        self.set_width(16);
        if clear_notes {
            self.clear();
        }
        self.set_height(16);
        self.invalidate_all();
        self.notify(PatternChange::Structure);
    }

    /// Copy another pattern's properties and notes into this one
    pub fn clone_from(&mut self, registry: &mut NoteRegistry, other: &Pattern) {
        self.clear();
        self.set_width(other.width);
        self.set_height(other.height());
        self.set_midi_channel(registry, other.midi_channel);
        self.note_destination = other.note_destination;
        self.external_midi_channel = other.external_midi_channel;
        self.set_note_length(other.note_length);
        self.set_bank_length(other.bank_length);
        self.set_available_bars(other.available_bars);
        self.set_active_bar(other.active_bar);
        self.set_bank_offset(other.bank_offset);
        self.set_enabled(other.enabled);
        self.default_note_duration = other.default_note_duration;
        for row in 0..other.height() {
            for column in 0..other.width {
                let cell = &other.rows[row][column];
                if cell.subnotes.is_empty() {
                    continue;
                }
                let subnotes = cell
                    .subnotes
                    .iter()
                    .filter_map(|subnote| {
                        registry
                            .note(subnote.midi_note, self.midi_channel)
                            .map(|id| Subnote {
                                id,
                                midi_note: subnote.midi_note,
                                midi_channel: self.midi_channel,
                            })
                    })
                    .collect();
                self.set_cell(registry, row, column, subnotes, cell.metadata.clone());
            }
        }
    }

    pub fn has_notes(&self) -> bool {
        self.rows
            .iter()
            .any(|row| row.iter().any(|cell| !cell.is_empty()))
    }

    pub fn bank_has_notes(&self, bank: usize) -> bool {
        (0..self.bank_length).any(|i| {
            self.rows
                .get(bank * self.bank_length + i)
                .map(|row| row.iter().any(|cell| !cell.is_empty()))
                .unwrap_or(false)
        })
    }

    pub fn current_bank_has_notes(&self) -> bool {
        self.bank_has_notes(self.bank_offset / self.bank_length)
    }

    // --- immediate note state (pad previews) ---

    /// Turn a position's subnotes on in the registry and report them with
    /// their velocities (from metadata, defaulting to 64) so the caller can
    /// sound them immediately
    pub fn set_position_on(
        &self,
        registry: &mut NoteRegistry,
        row: usize,
        column: usize,
    ) -> Vec<(NoteId, i64)> {
        let mut turned_on = Vec::new();
        if let Some(cell) = self.cell(row, column) {
            for (index, subnote) in cell.subnotes.iter().enumerate() {
                let velocity = cell
                    .metadata
                    .get(index)
                    .and_then(SubnoteMetadata::velocity)
                    .unwrap_or(DEFAULT_VELOCITY);
                registry.set_note_on(subnote.id);
                turned_on.push((subnote.id, velocity));
            }
        }
        turned_on
    }

    /// Turn a position's subnotes off in the registry
    pub fn set_position_off(&self, registry: &mut NoteRegistry, row: usize, column: usize) {
        if let Some(cell) = self.cell(row, column) {
            for subnote in &cell.subnotes {
                registry.set_note_off(subnote.id);
            }
        }
    }

    // --- compiled-buffer cache ---

    /// Drop the compiled buffers the given position can influence: its own
    /// key and the `LOOKAHEAD` keys preceding it
    pub fn invalidate_position(&mut self, row: usize, column: usize) {
        let base = row * self.width + column;
        for back in 0..=LOOKAHEAD {
            if let Some(key) = base.checked_sub(back) {
                self.position_buffers.remove(&key);
            }
        }
    }

    /// Drop every compiled buffer
    pub fn invalidate_all(&mut self) {
        self.position_buffers.clear();
    }

    pub(crate) fn cached_buffers(&self, key: usize) -> Option<&PositionBuffers> {
        self.position_buffers.get(&key)
    }

    pub(crate) fn store_buffers(&mut self, key: usize, buffers: PositionBuffers) {
        self.position_buffers.insert(key, buffers);
    }

    #[cfg(test)]
    pub(crate) fn has_cached_buffers(&self, key: usize) -> bool {
        self.position_buffers.contains_key(&key)
    }

    /// Channels that still need an all-notes-off flushed by the player
    pub fn take_stale_channels(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.stale_channels)
    }

    /// Whether a channel change is still waiting for its all-notes-off
    #[cfg(test)]
    pub(crate) fn has_stale_channels(&self) -> bool {
        !self.stale_channels.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pattern_and_registry() -> (Pattern, NoteRegistry) {
        let mut registry = NoteRegistry::new();
        let mut pattern = Pattern::new("test");
        pattern.set_midi_channel(&mut registry, 0);
        pattern.take_stale_channels();
        (pattern, registry)
    }

    #[test]
    fn metadata_length_tracks_subnote_length() {
        let (mut pattern, mut registry) = pattern_and_registry();
        let note = registry.note(60, 0).unwrap();
        let other = registry.note(64, 0).unwrap();
        pattern.add_subnote(&mut registry, 0, 0, note);
        pattern.insert_subnote_sorted(&mut registry, 0, 0, other);
        let cell = pattern.cell(0, 0).unwrap();
        assert_eq!(cell.subnotes().len(), cell.metadata().len());
        pattern.remove_subnote(&mut registry, 0, 0, 0);
        let cell = pattern.cell(0, 0).unwrap();
        assert_eq!(cell.subnotes().len(), 1);
        assert_eq!(cell.metadata().len(), 1);
    }

    #[test]
    fn sorted_insert_orders_by_note_value() {
        let (mut pattern, mut registry) = pattern_and_registry();
        for value in [67u8, 60, 64] {
            let note = registry.note(value, 0).unwrap();
            pattern.insert_subnote_sorted(&mut registry, 0, 0, note);
        }
        let values: Vec<u8> = pattern
            .cell(0, 0)
            .unwrap()
            .subnotes()
            .iter()
            .map(|s| s.midi_note)
            .collect();
        assert_eq!(values, vec![60, 64, 67]);
    }

    #[test]
    fn channel_change_remaps_every_subnote() {
        let (mut pattern, mut registry) = pattern_and_registry();
        let note = registry.note(60, 0).unwrap();
        pattern.add_subnote(&mut registry, 0, 0, note);
        pattern.add_subnote(&mut registry, 1, 3, note);
        pattern.set_midi_channel(&mut registry, 7);
        for row in 0..pattern.height() {
            for column in 0..pattern.width() {
                for subnote in pattern.cell(row, column).unwrap().subnotes() {
                    assert_eq!(subnote.midi_channel, 7);
                    assert_eq!(registry.get(subnote.id).midi_channel(), 7);
                }
            }
        }
        assert!(pattern.has_stale_channels());
    }

    #[test]
    fn notes_added_on_foreign_channel_are_normalised() {
        let (mut pattern, mut registry) = pattern_and_registry();
        let foreign = registry.note(62, 9).unwrap();
        pattern.add_subnote(&mut registry, 0, 0, foreign);
        let subnote = pattern.cell(0, 0).unwrap().subnotes()[0];
        assert_eq!(subnote.midi_channel, 0);
        assert_eq!(registry.get(subnote.id).midi_channel(), 0);
    }

    #[test]
    fn mutation_invalidates_lookahead_window() {
        let (mut pattern, mut registry) = pattern_and_registry();
        pattern.store_buffers(3, PositionBuffers::new());
        pattern.store_buffers(4, PositionBuffers::new());
        pattern.store_buffers(5, PositionBuffers::new());
        pattern.store_buffers(6, PositionBuffers::new());
        let note = registry.note(60, 0).unwrap();
        pattern.add_subnote(&mut registry, 0, 5, note);
        assert!(!pattern.has_cached_buffers(5));
        assert!(!pattern.has_cached_buffers(4));
        assert!(!pattern.has_cached_buffers(3));
        assert!(pattern.has_cached_buffers(6));
    }

    #[test]
    fn available_bars_clamps_to_bank_length() {
        let (mut pattern, _) = pattern_and_registry();
        pattern.set_available_bars(pattern.bank_length() + 1);
        assert_eq!(pattern.available_bars(), pattern.bank_length());
        pattern.set_available_bars(0);
        assert_eq!(pattern.available_bars(), 1);
    }

    #[test]
    fn narrowing_drops_tail_cells() {
        let (mut pattern, mut registry) = pattern_and_registry();
        let note = registry.note(60, 0).unwrap();
        pattern.add_subnote(&mut registry, 0, 15, note);
        pattern.set_width(8);
        assert_eq!(pattern.width(), 8);
        assert!(pattern.cell(0, 15).is_none());
        pattern.set_width(16);
        assert!(pattern.cell(0, 15).unwrap().is_empty());
    }

    #[test]
    fn out_of_range_positions_are_ignored() {
        let (mut pattern, mut registry) = pattern_and_registry();
        let note = registry.note(60, 0).unwrap();
        assert!(pattern.add_subnote(&mut registry, 99, 0, note).is_none());
        assert!(!pattern.has_notes());
    }

    #[test]
    fn observers_see_cell_changes() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        let (mut pattern, mut registry) = pattern_and_registry();
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        pattern.add_observer(move |change| {
            if matches!(change, PatternChange::Cell { row: 2, column: 3 }) {
                seen.fetch_add(1, Ordering::SeqCst);
            }
        });
        let note = registry.note(60, 0).unwrap();
        pattern.add_subnote(&mut registry, 2, 3, note);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn bank_selection_by_name() {
        let (mut pattern, _) = pattern_and_registry();
        pattern.set_bank("II");
        assert_eq!(pattern.bank_offset(), 8);
        assert_eq!(pattern.bank_name(), "II");
        pattern.set_bank("a");
        assert_eq!(pattern.bank_offset(), 0);
    }
}
