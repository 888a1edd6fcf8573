use std::collections::HashMap;

use log::warn;

/// Pitch class names used for note naming
const PITCH_CLASS_NAMES: [&str; 12] = [
    "C", "C#", "D", "D#", "E", "F", "F#", "G", "G#", "A", "A#", "B",
];

/// Handle to a note interned in a [`NoteRegistry`]
///
/// Ids are stable for the registry's lifetime; equality of ids is equality
/// of note identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NoteId(u32);

/// A note identity: either an atomic `(midi note, channel)` pair or a
/// compound holding an ordered list of atomic subnotes.
///
/// The `is_playing` flag is transient runtime state and is never persisted.
#[derive(Debug, Clone)]
pub struct Note {
    name: String,
    midi_note: u8,
    midi_channel: u8,
    subnotes: Vec<NoteId>,
    is_playing: bool,
    on_count: u32,
}

impl Note {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn midi_note(&self) -> u8 {
        self.midi_note
    }

    pub fn midi_channel(&self) -> u8 {
        self.midi_channel
    }

    pub fn octave(&self) -> i32 {
        self.midi_note as i32 / 12 - 1
    }

    pub fn is_playing(&self) -> bool {
        self.is_playing
    }

    pub fn subnotes(&self) -> &[NoteId] {
        &self.subnotes
    }

    pub fn is_compound(&self) -> bool {
        !self.subnotes.is_empty()
    }
}

/// Intern-style cache owning every note identity for the session.
///
/// Requesting the same atomic `(midi note, channel)` key always returns the
/// same id. Compound notes are content-addressed by their ordered subnote id
/// list, so two compounds with the same subnotes in the same order share an
/// identity.
#[derive(Debug, Default)]
pub struct NoteRegistry {
    notes: Vec<Note>,
    atomic_index: HashMap<(u8, u8), NoteId>,
    compound_index: HashMap<Vec<NoteId>, NoteId>,
}

impl NoteRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up (or create) the note for a `(midi note, channel)` pair.
    ///
    /// Returns `None` for values outside the MIDI ranges.
    pub fn note(&mut self, midi_note: u8, midi_channel: u8) -> Option<NoteId> {
        if midi_note > 127 || midi_channel > 15 {
            return None;
        }
        if let Some(&id) = self.atomic_index.get(&(midi_note, midi_channel)) {
            return Some(id);
        }
        let id = NoteId(self.notes.len() as u32);
        self.notes.push(Note {
            name: PITCH_CLASS_NAMES[midi_note as usize % 12].to_string(),
            midi_note,
            midi_channel,
            subnotes: Vec::new(),
            is_playing: false,
            on_count: 0,
        });
        self.atomic_index.insert((midi_note, midi_channel), id);
        Some(id)
    }

    /// Look up (or create) the compound note for an ordered subnote list.
    ///
    /// An empty list has no identity and yields `None`.
    pub fn compound(&mut self, subnotes: &[NoteId]) -> Option<NoteId> {
        if subnotes.is_empty() {
            return None;
        }
        if let Some(&id) = self.compound_index.get(subnotes) {
            return Some(id);
        }
        let id = NoteId(self.notes.len() as u32);
        self.notes.push(Note {
            name: String::new(),
            midi_note: 0,
            midi_channel: self.get(subnotes[0]).midi_channel,
            subnotes: subnotes.to_vec(),
            is_playing: false,
            on_count: 0,
        });
        self.compound_index.insert(subnotes.to_vec(), id);
        Some(id)
    }

    pub fn get(&self, id: NoteId) -> &Note {
        &self.notes[id.0 as usize]
    }

    /// Find an already-interned atomic note without creating one
    pub fn find(&self, midi_note: u8, midi_channel: u8) -> Option<NoteId> {
        self.atomic_index.get(&(midi_note, midi_channel)).copied()
    }

    /// Turn a note on, recursing into compound subnotes.
    ///
    /// Playing state is reference counted: a note turned on twice needs two
    /// offs before `is_playing` drops again.
    pub fn set_note_on(&mut self, id: NoteId) {
        let subnotes = self.notes[id.0 as usize].subnotes.clone();
        if subnotes.is_empty() {
            let note = &mut self.notes[id.0 as usize];
            note.on_count += 1;
            note.is_playing = true;
        } else {
            for subnote in subnotes {
                self.set_note_on(subnote);
            }
        }
    }

    /// Turn a note off, recursing into compound subnotes
    pub fn set_note_off(&mut self, id: NoteId) {
        let subnotes = self.notes[id.0 as usize].subnotes.clone();
        if subnotes.is_empty() {
            let note = &mut self.notes[id.0 as usize];
            if note.on_count > 0 {
                note.on_count -= 1;
            } else {
                warn!("note off for a note that was never turned on");
            }
            if note.on_count == 0 {
                note.is_playing = false;
            }
        } else {
            for subnote in subnotes {
                self.set_note_off(subnote);
            }
        }
    }

    /// Directly set the playing flag, bypassing the on/off refcount.
    ///
    /// Used for externally observed state such as sampler clip feedback.
    pub fn set_is_playing(&mut self, id: NoteId, is_playing: bool) {
        let note = &mut self.notes[id.0 as usize];
        note.is_playing = is_playing;
        if !is_playing {
            note.on_count = 0;
        }
    }

    pub fn len(&self) -> usize {
        self.notes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.notes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atomic_notes_are_interned() {
        let mut registry = NoteRegistry::new();
        let a = registry.note(60, 0).unwrap();
        let b = registry.note(60, 0).unwrap();
        let c = registry.note(60, 1).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(registry.get(a).name(), "C");
        assert_eq!(registry.get(a).octave(), 4);
    }

    #[test]
    fn out_of_range_notes_are_rejected() {
        let mut registry = NoteRegistry::new();
        assert!(registry.note(128, 0).is_none());
        assert!(registry.note(60, 16).is_none());
    }

    #[test]
    fn compound_identity_is_content_addressed() {
        let mut registry = NoteRegistry::new();
        let c = registry.note(60, 0).unwrap();
        let e = registry.note(64, 0).unwrap();
        let g = registry.note(67, 0).unwrap();
        let chord = registry.compound(&[c, e, g]).unwrap();
        let same = registry.compound(&[c, e, g]).unwrap();
        let reordered = registry.compound(&[e, c, g]).unwrap();
        assert_eq!(chord, same);
        assert_ne!(chord, reordered);
        assert!(registry.compound(&[]).is_none());
    }

    #[test]
    fn playing_state_is_reference_counted() {
        let mut registry = NoteRegistry::new();
        let note = registry.note(60, 0).unwrap();
        registry.set_note_on(note);
        registry.set_note_on(note);
        registry.set_note_off(note);
        assert!(registry.get(note).is_playing());
        registry.set_note_off(note);
        assert!(!registry.get(note).is_playing());
    }

    #[test]
    fn compound_state_fans_out_to_subnotes() {
        let mut registry = NoteRegistry::new();
        let c = registry.note(60, 0).unwrap();
        let e = registry.note(64, 0).unwrap();
        let chord = registry.compound(&[c, e]).unwrap();
        registry.set_note_on(chord);
        assert!(registry.get(c).is_playing());
        assert!(registry.get(e).is_playing());
        registry.set_note_off(chord);
        assert!(!registry.get(c).is_playing());
    }
}
