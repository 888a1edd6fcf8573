use log::warn;

use crate::sequencer::midi::{MidiBuffer, MidiEvent};
use crate::sequencer::pattern::{Pattern, PositionBuffers, Subnote, DEFAULT_VELOCITY};

/// How many positions past the current one are scanned for negative-delay
/// subnotes that want to fire early
pub const LOOKAHEAD: usize = 2;

/// Sub-steps per step for each note length setting (1 = quarter speed up to
/// 6 = octuple speed)
pub fn step_duration(note_length: i32) -> Option<u64> {
    match note_length {
        1 => Some(32),
        2 => Some(16),
        3 => Some(8),
        4 => Some(4),
        5 => Some(2),
        6 => Some(1),
        _ => {
            warn!("note length {} is not valid, pattern will never play", note_length);
            None
        }
    }
}

/// Work out whether an absolute sub-step position lands on a step boundary
/// for the given note length.
///
/// Returns the step index (position divided down into steps) and the step
/// duration in sub-steps, or `None` when the position falls between steps.
pub fn step_length_details(note_length: i32, position: u64) -> Option<(u64, u64)> {
    let duration = step_duration(note_length)?;
    if position % duration == 0 {
        Some((position / duration, duration))
    } else {
        None
    }
}

fn add_note(
    buffers: &mut PositionBuffers,
    offset: i64,
    subnote: &Subnote,
    velocity: i64,
    on: bool,
    override_channel: Option<u8>,
) {
    let channel = override_channel.unwrap_or(subnote.midi_channel);
    let velocity = velocity.clamp(0, 127) as u8;
    let event = if on {
        MidiEvent::note_on(channel, subnote.midi_note, velocity)
    } else {
        MidiEvent::note_off(channel, subnote.midi_note, velocity)
    };
    buffers.entry(offset).or_insert_with(MidiBuffer::new).add_event(event);
}

/// Compile the MIDI buffers for one wrapped grid position.
///
/// `position` is already wrapped into `[0, available_bars * width)`. The
/// result maps sub-step offsets (relative to the position's emit time) to
/// the buffer that should fire then: each subnote contributes a note-on at
/// its delay and a note-off at delay + duration, and the `LOOKAHEAD`
/// positions that follow contribute the note-ons of any subnote whose
/// negative delay reaches back into this step.
pub fn compile_position(
    pattern: &Pattern,
    position: u64,
    step_duration: u64,
    override_channel: Option<u8>,
) -> PositionBuffers {
    let mut buffers = PositionBuffers::new();
    let width = pattern.width() as u64;
    let wrap = pattern.available_bars() as u64 * width;

    for ahead in 0..=LOOKAHEAD as u64 {
        let our_position = (position + ahead) % wrap;
        let row = (our_position / width) % pattern.available_bars() as u64;
        let column = our_position - row * width;
        let Some(cell) = pattern.cell(row as usize + pattern.bank_offset(), column as usize)
        else {
            continue;
        };
        let subnotes = cell.subnotes();
        let metadata = cell.metadata();

        if ahead == 0 {
            for (index, subnote) in subnotes.iter().enumerate() {
                let meta = metadata.get(index);
                match meta {
                    Some(meta) if !meta.is_empty() => {
                        let velocity = meta.velocity().unwrap_or(DEFAULT_VELOCITY);
                        let delay = meta.delay().unwrap_or(0);
                        let mut duration = meta.duration().unwrap_or(step_duration as i64);
                        if duration < 1 {
                            duration = step_duration as i64;
                        }
                        add_note(&mut buffers, delay, subnote, velocity, true, override_channel);
                        add_note(
                            &mut buffers,
                            delay + duration,
                            subnote,
                            velocity,
                            false,
                            override_channel,
                        );
                    }
                    _ => {
                        add_note(&mut buffers, 0, subnote, DEFAULT_VELOCITY, true, override_channel);
                        add_note(
                            &mut buffers,
                            step_duration as i64,
                            subnote,
                            DEFAULT_VELOCITY,
                            false,
                            override_channel,
                        );
                    }
                }
            }
        } else {
            // Look-ahead cells matter only when a subnote wants to start
            // before its own step
            let adjustment = (ahead * step_duration) as i64;
            for (index, subnote) in subnotes.iter().enumerate() {
                let Some(meta) = metadata.get(index) else {
                    continue;
                };
                let Some(delay) = meta.delay() else {
                    continue;
                };
                if delay >= 0 {
                    continue;
                }
                let velocity = meta.velocity().unwrap_or(DEFAULT_VELOCITY);
                let mut duration = meta.duration().unwrap_or(step_duration as i64);
                if duration < 1 {
                    duration = step_duration as i64;
                }
                add_note(
                    &mut buffers,
                    adjustment + delay,
                    subnote,
                    velocity,
                    true,
                    override_channel,
                );
                add_note(
                    &mut buffers,
                    adjustment + delay + duration,
                    subnote,
                    velocity,
                    false,
                    override_channel,
                );
            }
        }
    }
    buffers
}

/// Fetch the compiled buffers for a wrapped position, rebuilding them on a
/// cache miss. The cache key is offset by the bank window so each bank
/// caches independently.
pub fn cached_position_buffers<'a>(
    pattern: &'a mut Pattern,
    position: u64,
    step_duration: u64,
    override_channel: Option<u8>,
) -> &'a PositionBuffers {
    let key = position as usize + pattern.bank_offset() * pattern.width();
    if pattern.cached_buffers(key).is_none() {
        let buffers = compile_position(pattern, position, step_duration, override_channel);
        pattern.store_buffers(key, buffers);
    }
    pattern.cached_buffers(key).expect("buffers were just stored")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sequencer::note::NoteRegistry;
    use serde_json::json;

    fn pattern_on_channel_zero() -> (Pattern, NoteRegistry) {
        let mut registry = NoteRegistry::new();
        let mut pattern = Pattern::new("test");
        pattern.set_midi_channel(&mut registry, 0);
        pattern.take_stale_channels();
        (pattern, registry)
    }

    #[test]
    fn note_length_ladder() {
        assert_eq!(step_length_details(1, 64), Some((2, 32)));
        assert_eq!(step_length_details(3, 8), Some((1, 8)));
        assert_eq!(step_length_details(3, 9), None);
        assert_eq!(step_length_details(6, 9), Some((9, 1)));
        assert_eq!(step_length_details(0, 8), None);
    }

    #[test]
    fn default_metadata_compiles_on_and_off_at_step_bounds() {
        let (mut pattern, mut registry) = pattern_on_channel_zero();
        let note = registry.note(60, 0).unwrap();
        pattern.add_subnote(&mut registry, 0, 0, note);

        let buffers = compile_position(&pattern, 0, 8, None);
        let on = buffers.get(&0).expect("note on at offset 0");
        assert_eq!(on.events()[0], MidiEvent::note_on(0, 60, 64));
        let off = buffers.get(&8).expect("note off at step duration");
        assert_eq!(off.events()[0], MidiEvent::note_off(0, 60, 64));
    }

    #[test]
    fn metadata_controls_velocity_delay_and_duration() {
        let (mut pattern, mut registry) = pattern_on_channel_zero();
        let note = registry.note(62, 0).unwrap();
        pattern.add_subnote(&mut registry, 0, 0, note);
        pattern.set_subnote_metadata(0, 0, 0, "velocity", Some(json!(100)));
        pattern.set_subnote_metadata(0, 0, 0, "delay", Some(json!(3)));
        pattern.set_subnote_metadata(0, 0, 0, "duration", Some(json!(4)));

        let buffers = compile_position(&pattern, 0, 8, None);
        assert_eq!(
            buffers.get(&3).unwrap().events()[0],
            MidiEvent::note_on(0, 62, 100)
        );
        assert_eq!(
            buffers.get(&7).unwrap().events()[0],
            MidiEvent::note_off(0, 62, 100)
        );
    }

    #[test]
    fn negative_delay_fires_from_the_preceding_step() {
        let (mut pattern, mut registry) = pattern_on_channel_zero();
        let note = registry.note(64, 0).unwrap();
        pattern.add_subnote(&mut registry, 0, 1, note);
        pattern.set_subnote_metadata(0, 1, 0, "delay", Some(json!(-2)));
        pattern.set_subnote_metadata(0, 1, 0, "duration", Some(json!(4)));

        // Compiling position 0 should pick up (0, 1)'s early note-on at
        // step_duration - 2
        let buffers = compile_position(&pattern, 0, 8, None);
        let on = buffers.get(&6).expect("early note on from lookahead");
        assert_eq!(on.events()[0], MidiEvent::note_on(0, 64, 64));
        let off = buffers.get(&10).expect("matching note off");
        assert_eq!(off.events()[0], MidiEvent::note_off(0, 64, 64));
    }

    #[test]
    fn override_channel_rewrites_event_channels() {
        let mut registry = NoteRegistry::new();
        let mut pattern = Pattern::new("test");
        // Stays on the control channel; override stands in for it
        let note = registry.note(60, 15).unwrap();
        pattern.add_subnote(&mut registry, 0, 0, note);

        let buffers = compile_position(&pattern, 0, 8, Some(3));
        assert_eq!(
            buffers.get(&0).unwrap().events()[0],
            MidiEvent::note_on(3, 60, 64)
        );
    }

    #[test]
    fn zero_duration_metadata_falls_back_to_step_length() {
        let (mut pattern, mut registry) = pattern_on_channel_zero();
        let note = registry.note(60, 0).unwrap();
        pattern.add_subnote(&mut registry, 0, 0, note);
        pattern.set_subnote_metadata(0, 0, 0, "velocity", Some(json!(90)));
        pattern.set_subnote_metadata(0, 0, 0, "duration", Some(json!(0)));

        let buffers = compile_position(&pattern, 0, 8, None);
        assert!(buffers.get(&8).is_some());
    }
}
