use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use log::warn;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;
use crate::sequencer::note::NoteRegistry;
use crate::sequencer::pattern::{Pattern, Subnote, SubnoteMetadata, CONTROL_CHANNEL};

/// An ordered list of patterns played together.
///
/// Patterns are arena-held behind per-pattern locks: the editing thread and
/// the scheduler thread both reach them through the sequence, each taking a
/// pattern's lock only briefly.
pub struct Sequence {
    name: String,
    patterns: Vec<Arc<Mutex<Pattern>>>,
    active_pattern: usize,
    solo_pattern: Option<usize>,
    scene_index: usize,
    is_playing: bool,
    version: u32,
}

impl Sequence {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            patterns: Vec::new(),
            active_pattern: 0,
            solo_pattern: None,
            scene_index: 0,
            is_playing: false,
            version: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn patterns(&self) -> &[Arc<Mutex<Pattern>>] {
        &self.patterns
    }

    pub fn pattern(&self, index: usize) -> Option<&Arc<Mutex<Pattern>>> {
        self.patterns.get(index)
    }

    pub fn pattern_count(&self) -> usize {
        self.patterns.len()
    }

    pub fn add_pattern(&mut self, pattern: Pattern) -> usize {
        self.patterns.push(Arc::new(Mutex::new(pattern)));
        self.patterns.len() - 1
    }

    pub fn insert_pattern(&mut self, index: usize, pattern: Pattern) {
        let index = index.min(self.patterns.len());
        self.patterns.insert(index, Arc::new(Mutex::new(pattern)));
    }

    pub fn remove_pattern(&mut self, index: usize) {
        if index < self.patterns.len() {
            self.patterns.remove(index);
            if self.active_pattern >= self.patterns.len() && self.active_pattern > 0 {
                self.active_pattern = self.patterns.len() - 1;
            }
        }
    }

    pub fn active_pattern(&self) -> usize {
        self.active_pattern
    }

    /// Change the active pattern.
    ///
    /// Returns `true` when the index actually changed, so the caller can
    /// shut down live recording aimed at the previous pattern.
    pub fn set_active_pattern(&mut self, index: usize) -> bool {
        let index = index.min(self.patterns.len().saturating_sub(1));
        if self.active_pattern != index {
            self.active_pattern = index;
            true
        } else {
            false
        }
    }

    pub fn solo_pattern(&self) -> Option<usize> {
        self.solo_pattern
    }

    pub fn set_solo_pattern(&mut self, index: Option<usize>) {
        self.solo_pattern = index;
    }

    /// The playfield track this sequence occupies in song mode
    pub fn scene_index(&self) -> usize {
        self.scene_index
    }

    pub fn set_scene_index(&mut self, scene_index: usize) {
        self.scene_index = scene_index;
    }

    pub fn is_playing(&self) -> bool {
        self.is_playing
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn set_version(&mut self, version: u32) {
        self.version = version;
    }

    /// Hook this sequence up to the transport tick stream
    pub fn prepare_playback(&mut self) {
        self.is_playing = true;
    }

    /// Detach from the tick stream; patterns go silent on the same tick
    pub fn disconnect_playback(&mut self) {
        self.is_playing = false;
        for pattern in &self.patterns {
            if let Ok(mut pattern) = pattern.lock() {
                pattern.reset_playing_position();
            }
        }
    }

    // --- persistence ---

    fn data_location(&self, data_dir: &Path) -> PathBuf {
        data_dir
            .join("session")
            .join("sequences")
            .join(sanitize_name(&self.name))
    }

    /// Write the sequence to its slot under `data_dir`.
    ///
    /// Returns `false` on any I/O failure; the file is left as it was.
    pub fn save(&self, data_dir: &Path) -> bool {
        match self.try_save(data_dir) {
            Ok(()) => true,
            Err(error) => {
                warn!("failed to save sequence '{}': {}", self.name, error);
                false
            }
        }
    }

    fn try_save(&self, data_dir: &Path) -> Result<()> {
        let location = self.data_location(data_dir);
        fs::create_dir_all(&location)?;
        let json = SequenceJson {
            active_pattern: self.active_pattern,
            patterns: self
                .patterns
                .iter()
                .map(|pattern| pattern_to_json(&pattern.lock().expect("pattern lock poisoned")))
                .collect(),
        };
        let data = serde_json::to_string(&json)?;
        fs::write(location.join(self.version.to_string()), data)?;
        Ok(())
    }

    /// Replace this sequence's patterns from its slot under `data_dir`.
    ///
    /// Returns `false` when the file is missing or malformed; no partial
    /// state is retained on failure.
    pub fn load(&mut self, data_dir: &Path, registry: &mut NoteRegistry) -> bool {
        match self.try_load(data_dir, registry) {
            Ok(()) => true,
            Err(error) => {
                warn!("failed to load sequence '{}': {}", self.name, error);
                false
            }
        }
    }

    fn try_load(&mut self, data_dir: &Path, registry: &mut NoteRegistry) -> Result<()> {
        let path = self.data_location(data_dir).join(self.version.to_string());
        let data = fs::read_to_string(path)?;
        let json: SequenceJson = serde_json::from_str(&data)?;
        let mut patterns = Vec::with_capacity(json.patterns.len());
        for (index, cells) in json.patterns.iter().enumerate() {
            let pattern = pattern_from_json(format!("Pattern {}", index + 1), cells, registry);
            patterns.push(Arc::new(Mutex::new(pattern)));
        }
        self.patterns = patterns;
        self.active_pattern = json
            .active_pattern
            .min(self.patterns.len().saturating_sub(1));
        Ok(())
    }
}

/// Keep filename-safe characters: letters, digits, space, dot, underscore
fn sanitize_name(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, ' ' | '.' | '_'))
        .collect()
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SequenceJson {
    active_pattern: usize,
    patterns: Vec<PatternJson>,
}

/// A pattern on the wire is its grid: rows of cells
type PatternJson = Vec<Vec<CellJson>>;

#[derive(Serialize, Deserialize, Default)]
struct CellJson {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    note: Option<NoteJson>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    metadata: Option<Value>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NoteJson {
    midi_note: i64,
    midi_channel: i64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    subnotes: Vec<NoteJson>,
}

fn pattern_to_json(pattern: &Pattern) -> PatternJson {
    let mut rows = Vec::with_capacity(pattern.height());
    for row in 0..pattern.height() {
        let mut cells = Vec::with_capacity(pattern.width());
        for column in 0..pattern.width() {
            let cell = pattern.cell(row, column).expect("in-range cell");
            if cell.is_empty() {
                cells.push(CellJson::default());
                continue;
            }
            let subnotes = cell
                .subnotes()
                .iter()
                .map(|subnote| NoteJson {
                    midi_note: subnote.midi_note as i64,
                    midi_channel: subnote.midi_channel as i64,
                    subnotes: Vec::new(),
                })
                .collect();
            let metadata = cell
                .metadata()
                .iter()
                .map(|meta| Value::Object(meta.entries().clone()))
                .collect();
            cells.push(CellJson {
                // Compound notes have no value of their own; 128 marks them
                // as composite the way the source data does
                note: Some(NoteJson {
                    midi_note: 128,
                    midi_channel: pattern.midi_channel() as i64,
                    subnotes,
                }),
                metadata: Some(Value::Array(metadata)),
            });
        }
        rows.push(cells);
    }
    rows
}

fn pattern_from_json(name: String, cells: &PatternJson, registry: &mut NoteRegistry) -> Pattern {
    let mut pattern = Pattern::new(name);
    // Adopt the channel the stored notes were on before filling the grid,
    // so channel normalisation does not rewrite them
    let channel = cells
        .iter()
        .flatten()
        .filter_map(|cell| cell.note.as_ref())
        .flat_map(|note| &note.subnotes)
        .map(|note| note.midi_channel.clamp(0, 15) as u8)
        .next()
        .unwrap_or(CONTROL_CHANNEL);
    pattern.set_midi_channel(registry, channel);
    pattern.take_stale_channels();
    if !cells.is_empty() {
        pattern.set_height(cells.len());
        let width = cells.iter().map(Vec::len).max().unwrap_or(0);
        if width > 0 {
            pattern.set_width(width);
        }
    }
    for (row, row_cells) in cells.iter().enumerate() {
        for (column, cell) in row_cells.iter().enumerate() {
            let Some(note) = &cell.note else {
                continue;
            };
            if note.subnotes.is_empty() {
                continue;
            }
            let subnotes: Vec<Subnote> = note
                .subnotes
                .iter()
                .filter_map(|subnote| {
                    let midi_note = u8::try_from(subnote.midi_note).ok().filter(|&n| n <= 127)?;
                    let id = registry.note(midi_note, channel)?;
                    Some(Subnote {
                        id,
                        midi_note,
                        midi_channel: channel,
                    })
                })
                .collect();
            let metadata = match &cell.metadata {
                Some(Value::Array(entries)) => entries
                    .iter()
                    .map(|entry| match entry {
                        Value::Object(map) => SubnoteMetadata::from_entries(map.clone()),
                        _ => SubnoteMetadata::new(),
                    })
                    .collect(),
                _ => Vec::new(),
            };
            pattern.set_cell(registry, row, column, subnotes, metadata);
        }
    }
    pattern
}
