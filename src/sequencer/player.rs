use std::sync::Arc;

use crate::command::ClipCommand;
use crate::sequencer::compiler::{self, step_length_details};
use crate::sequencer::midi::MidiBuffer;
use crate::sequencer::pattern::{NoteDestination, Pattern, CONTROL_CHANNEL};
use crate::sequencer::segment::Playfield;
use crate::sequencer::sequence::Sequence;
use crate::transport::{Sampler, Transport};

/// Session state the player consults while judging what should sound
#[derive(Clone, Copy)]
pub struct PlaybackContext<'a> {
    /// Whether the song scheduler is in charge of activation
    pub song_mode: bool,
    /// The song scheduler's playfield state grid
    pub playfield: &'a Playfield,
    /// The session's stand-in channel for control-channel patterns
    pub current_midi_channel: Option<u8>,
}

/// Advances patterns against the transport tick stream.
///
/// The transport calls [`on_advance`](PatternPlayer::on_advance) just before
/// each window of sub-steps begins and [`on_tick`](PatternPlayer::on_tick)
/// on every sub-step; both run on the scheduler thread and take each
/// pattern's lock only long enough to pull (or lazily rebuild) compiled
/// buffers.
pub struct PatternPlayer {
    transport: Arc<dyn Transport>,
}

impl PatternPlayer {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    /// Schedule everything the sequence's patterns want to sound during the
    /// next `progression_length` sub-steps starting at `sequence_position`
    pub fn on_advance(
        &self,
        sequence: &Sequence,
        context: &PlaybackContext,
        sequence_position: u64,
        progression_length: u64,
    ) {
        for (index, pattern) in sequence.patterns().iter().enumerate() {
            let Ok(mut pattern) = pattern.lock() else {
                continue;
            };
            self.advance_pattern(
                &mut pattern,
                sequence,
                context,
                index,
                sequence_position,
                progression_length,
            );
        }
    }

    /// Update the playhead indicators of every relevant pattern
    pub fn on_tick(&self, sequence: &Sequence, context: &PlaybackContext, sequence_position: u64) {
        for (index, pattern) in sequence.patterns().iter().enumerate() {
            let Ok(mut pattern) = pattern.lock() else {
                continue;
            };
            let playing = is_playing(&pattern, sequence, context, index)
                && (matches!(
                    pattern.note_destination(),
                    NoteDestination::SampleTrigger | NoteDestination::SampleSliced
                ) || pattern.midi_channel() < CONTROL_CHANNEL
                    || context.current_midi_channel.is_some());
            // Position zero always lands, so indicators reset to the origin
            if !playing && sequence_position != 0 {
                continue;
            }
            let Some((step, _)) = step_length_details(pattern.note_length(), sequence_position)
            else {
                continue;
            };
            let width = pattern.width() as u64;
            let bars = pattern.available_bars() as u64;
            let wrapped = step % (bars * width);
            let row = (wrapped / width) % bars;
            let column = wrapped - row * width;
            let bank_offset = pattern.bank_offset();
            pattern.set_playing_position(row as usize + bank_offset, column as usize);
        }
    }

    fn advance_pattern(
        &self,
        pattern: &mut Pattern,
        sequence: &Sequence,
        context: &PlaybackContext,
        pattern_index: usize,
        sequence_position: u64,
        progression_length: u64,
    ) {
        // A channel change leaves hanging state behind; silence the old
        // channel before anything new fires
        for channel in pattern.take_stale_channels() {
            self.transport
                .schedule_midi_buffer(MidiBuffer::all_notes_off(channel), 0);
        }

        if pattern.channel_muted() {
            return;
        }
        if !is_playing(pattern, sequence, context, pattern_index) {
            return;
        }
        let destination = pattern.note_destination();
        let sample_bound = matches!(
            destination,
            NoteDestination::SampleTrigger | NoteDestination::SampleSliced
        );
        if !(sample_bound
            || pattern.midi_channel() < CONTROL_CHANNEL
            || context.current_midi_channel.is_some())
        {
            return;
        }
        // The control channel never carries notes itself; without a
        // stand-in channel there is nothing to emit
        let override_channel = if pattern.midi_channel() == CONTROL_CHANNEL {
            match context.current_midi_channel {
                Some(channel) => Some(channel),
                None => return,
            }
        } else {
            None
        };

        let playback_offset = if context.song_mode {
            context.playfield.part_offset(
                pattern.channel_index(),
                sequence.scene_index(),
                pattern.part_index(),
            )
        } else {
            0
        };

        let width = pattern.width() as u64;
        let bars = pattern.available_bars() as u64;
        for increment in 0..=progression_length {
            let next_position = sequence_position.saturating_sub(playback_offset) + increment;
            let Some((step, step_duration)) =
                step_length_details(pattern.note_length(), next_position)
            else {
                continue;
            };
            let wrapped = step % (bars * width);
            let buffers =
                compiler::cached_position_buffers(pattern, wrapped, step_duration, override_channel);
            if destination == NoteDestination::SampleLooped {
                // Looping channels make their sound through the sampler, not
                // through pattern notes
                continue;
            }
            for (&offset, buffer) in buffers.iter() {
                let at = (increment as i64 + offset).max(0) as u64;
                self.transport.schedule_midi_buffer(buffer.clone(), at);
            }
        }
    }
}

/// Whether a pattern should currently be sounding
pub fn is_playing(
    pattern: &Pattern,
    sequence: &Sequence,
    context: &PlaybackContext,
    pattern_index: usize,
) -> bool {
    if context.song_mode {
        context.playfield.part_active(
            pattern.channel_index(),
            sequence.scene_index(),
            pattern.part_index(),
        )
    } else if sequence.is_playing() {
        match sequence.solo_pattern() {
            Some(solo) => solo == pattern_index,
            None => pattern.enabled(),
        }
    } else {
        false
    }
}

/// Convert an incoming note message into sampler clip commands.
///
/// Every clip of the pattern whose key zone contains the note produces one
/// command: note-ons start playback with the velocity mapped to volume,
/// note-offs stop it. Sliced patterns pin the note to 60 and select the
/// slice the incoming note addresses instead.
pub fn clip_commands_for_message(
    pattern: &Pattern,
    sampler: &dyn Sampler,
    byte1: u8,
    byte2: u8,
    byte3: u8,
) -> Vec<ClipCommand> {
    let mut commands = Vec::new();
    for &clip_id in pattern.clip_ids() {
        let Some(clip) = sampler.clip_by_id(clip_id) else {
            continue;
        };
        if byte2 < clip.key_zone_start() || clip.key_zone_end() < byte2 {
            continue;
        }
        let mut command = ClipCommand::channel_command(clip_id, pattern.midi_channel());
        command.start_playback = byte1 >= 0x90;
        command.stop_playback = byte1 < 0x90;
        if command.start_playback {
            command.change_volume = true;
            command.volume = byte3 as f32 / 128.0;
        }
        if pattern.note_destination() == NoteDestination::SampleSliced {
            command.midi_note = 60;
            command.change_slice = true;
            command.slice = clip.slice_for(byte2);
        } else {
            command.midi_note = byte2;
        }
        commands.push(command);
    }
    commands
}

/// Feed a pattern-channel note message through sample dispatch, scheduling
/// the resulting clip commands immediately.
///
/// Only meaningful for patterns whose destination is the sampler; everything
/// else is routed by the MIDI router instead.
pub fn dispatch_sample_message(
    pattern: &Pattern,
    sampler: &dyn Sampler,
    transport: &dyn Transport,
    byte1: u8,
    byte2: u8,
    byte3: u8,
) {
    if !matches!(
        pattern.note_destination(),
        NoteDestination::SampleTrigger | NoteDestination::SampleSliced
    ) {
        return;
    }
    if !(0x80..0xA0).contains(&byte1) {
        return;
    }
    let channel = byte1 & 0x0F;
    if channel != pattern.midi_channel() {
        return;
    }
    for command in clip_commands_for_message(pattern, sampler, byte1, byte2, byte3) {
        transport.schedule_clip_command(command, 0);
    }
}
