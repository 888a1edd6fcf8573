use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, warn};

use crate::command::{ClipCommand, ClipId, TimerCommand};
use crate::transport::Transport;

pub const PLAYFIELD_CHANNELS: usize = 10;
pub const PLAYFIELD_TRACKS: usize = 10;
pub const PLAYFIELD_PARTS: usize = 5;

#[derive(Default)]
struct PartState {
    active: AtomicBool,
    offset: AtomicU64,
}

/// Which `(channel, track, part)` slots should currently be sounding in
/// song mode, and the sub-step each was started at.
///
/// Reads happen on the scheduler thread mid-advancement, writes on whatever
/// thread drives the song scheduler; plain atomics keep both wait-free.
pub struct Playfield {
    parts: Vec<PartState>,
}

impl Default for Playfield {
    fn default() -> Self {
        Self::new()
    }
}

impl Playfield {
    pub fn new() -> Self {
        let mut parts = Vec::new();
        parts.resize_with(
            PLAYFIELD_CHANNELS * PLAYFIELD_TRACKS * PLAYFIELD_PARTS,
            PartState::default,
        );
        Self { parts }
    }

    fn index(&self, channel: usize, track: usize, part: usize) -> Option<usize> {
        if channel >= PLAYFIELD_CHANNELS || track >= PLAYFIELD_TRACKS || part >= PLAYFIELD_PARTS {
            return None;
        }
        Some((channel * PLAYFIELD_TRACKS + track) * PLAYFIELD_PARTS + part)
    }

    pub fn part_active(&self, channel: usize, track: usize, part: usize) -> bool {
        self.index(channel, track, part)
            .map(|i| self.parts[i].active.load(Ordering::Acquire))
            .unwrap_or(false)
    }

    /// The sub-step position the part was started at, for reprojecting
    /// pattern positions on mid-song starts
    pub fn part_offset(&self, channel: usize, track: usize, part: usize) -> u64 {
        self.index(channel, track, part)
            .map(|i| self.parts[i].offset.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    fn start_part(&self, channel: usize, track: usize, part: usize, offset: u64) {
        if let Some(i) = self.index(channel, track, part) {
            self.parts[i].offset.store(offset, Ordering::Release);
            self.parts[i].active.store(true, Ordering::Release);
        }
    }

    fn stop_part(&self, channel: usize, track: usize, part: usize) {
        if let Some(i) = self.index(channel, track, part) {
            self.parts[i].active.store(false, Ordering::Release);
        }
    }

    pub fn reset(&self) {
        for part in &self.parts {
            part.active.store(false, Ordering::Release);
            part.offset.store(0, Ordering::Release);
        }
    }
}

/// A clip reference inside a song segment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentClip {
    /// The channel (row) the clip lives on
    pub channel: u8,
    /// The track (column) within the channel
    pub column: u8,
    /// The part slot (0-4)
    pub part: u8,
    /// The sampler-side clip id
    pub clip_id: ClipId,
}

/// One element of the song timeline
#[derive(Debug, Clone, Default)]
pub struct Segment {
    pub bar_length: u32,
    pub beat_length: u32,
    pub clips: Vec<SegmentClip>,
}

impl Segment {
    /// Segment duration in sub-steps, four beats to the bar
    pub fn duration_sub_steps(&self, ticks_per_beat: u64) -> u64 {
        (self.bar_length as u64 * 4 + self.beat_length as u64) * ticks_per_beat
    }
}

/// Turns the segment list into a playlist of timer commands and drives the
/// playfield as the playhead crosses them.
pub struct SegmentScheduler {
    song_mode: bool,
    playhead: u64,
    playlist: BTreeMap<u64, Vec<TimerCommand>>,
    running_loops: HashSet<ClipId>,
    playfield: Arc<Playfield>,
    segments: Vec<Segment>,
    channel_is_loop: [bool; PLAYFIELD_CHANNELS],
    playlist_dirty: bool,
    stop_handler: Option<Box<dyn FnMut() + Send>>,
}

impl Default for SegmentScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl SegmentScheduler {
    pub fn new() -> Self {
        Self {
            song_mode: false,
            playhead: 0,
            playlist: BTreeMap::new(),
            running_loops: HashSet::new(),
            playfield: Arc::new(Playfield::new()),
            segments: Vec::new(),
            channel_is_loop: [false; PLAYFIELD_CHANNELS],
            playlist_dirty: false,
            stop_handler: None,
        }
    }

    pub fn playfield(&self) -> &Arc<Playfield> {
        &self.playfield
    }

    pub fn song_mode(&self) -> bool {
        self.song_mode
    }

    pub fn set_song_mode(&mut self, song_mode: bool) {
        if self.song_mode != song_mode {
            self.song_mode = song_mode;
            self.playlist_dirty = true;
        }
    }

    pub fn playhead(&self) -> u64 {
        self.playhead
    }

    /// Replace the song timeline; the playlist is rebuilt lazily
    pub fn set_segments(&mut self, segments: Vec<Segment>) {
        self.segments = segments;
        self.playlist_dirty = true;
    }

    /// Mark a channel as a sample-loop channel; its clips get clip-loop
    /// commands instead of part commands
    pub fn set_channel_loop_mode(&mut self, channel: usize, is_loop: bool) {
        if channel < PLAYFIELD_CHANNELS && self.channel_is_loop[channel] != is_loop {
            self.channel_is_loop[channel] = is_loop;
            self.playlist_dirty = true;
        }
    }

    /// Called when song playback halts, so the embedding layer can detach
    /// its sequences from the tick stream on the same tick
    pub fn set_stop_handler(&mut self, handler: impl FnMut() + Send + 'static) {
        self.stop_handler = Some(Box::new(handler));
    }

    /// Rebuild the playlist if any input changed since the last build.
    ///
    /// Rebuild requests coalesce on the dirty flag; callers flush at a
    /// convenient moment rather than once per mutation.
    pub fn rebuild_if_dirty(&mut self, ticks_per_beat: u64) {
        if self.playlist_dirty {
            self.rebuild_playlist(ticks_per_beat);
            self.playlist_dirty = false;
        }
    }

    fn rebuild_playlist(&mut self, ticks_per_beat: u64) {
        self.playlist.clear();
        if !self.song_mode || self.segments.is_empty() {
            return;
        }
        let mut position = 0u64;
        let mut clips_in_previous: Vec<SegmentClip> = Vec::new();
        for segment in &self.segments {
            let mut commands = Vec::new();
            for clip in &segment.clips {
                if !clips_in_previous.contains(clip) {
                    commands.push(start_command(
                        clip,
                        self.channel_is_loop[clip.channel as usize],
                        position,
                    ));
                }
            }
            for clip in &clips_in_previous {
                if !segment.clips.contains(clip) {
                    commands.push(stop_command(
                        clip,
                        self.channel_is_loop[clip.channel as usize],
                    ));
                }
            }
            clips_in_previous = segment.clips.clone();
            self.playlist.insert(position, commands);
            position += segment.duration_sub_steps(ticks_per_beat);
        }
        // Close out whatever is still sounding, then halt playback
        let mut commands: Vec<TimerCommand> = clips_in_previous
            .iter()
            .map(|clip| stop_command(clip, self.channel_is_loop[clip.channel as usize]))
            .collect();
        commands.push(TimerCommand::StopPlayback);
        self.playlist.insert(position, commands);
        debug!(
            "rebuilt playlist: {} positions over {} sub-steps",
            self.playlist.len(),
            position
        );
    }

    /// Begin song playback at `offset` sub-steps into the timeline.
    ///
    /// The playfield is reset and the playlist is dry-run from the origin to
    /// the offset (skipping stop-playback commands) so mid-song starts see
    /// every part and loop that should already be sounding. A non-zero
    /// `duration` schedules the stop that far ahead.
    pub fn start(&mut self, transport: &dyn Transport, offset: u64, duration: u64) {
        self.playfield.reset();
        self.running_loops.clear();
        // Handle position zero explicitly before walking to the offset, so
        // the opening segment's commands apply even for offset zero
        self.playhead = 1;
        self.move_playhead(transport, 0, true);
        self.move_playhead(transport, offset, true);
        if duration > 0 {
            transport.schedule_timer_command(duration, TimerCommand::StopPlayback);
        }
    }

    /// Halt song playback: detach sequences and rewind the playhead
    pub fn stop(&mut self, transport: &dyn Transport) {
        if let Some(handler) = &mut self.stop_handler {
            handler();
        }
        transport.stop();
        self.playhead = 0;
    }

    /// Advance the playhead by one sub-step and dispatch anything due
    pub fn progress_playback(&mut self, transport: &dyn Transport) {
        if !transport.timer_running() || !self.song_mode {
            return;
        }
        self.playhead += 1;
        let Some(commands) = self.playlist.get(&self.playhead).cloned() else {
            return;
        };
        for command in commands {
            match command {
                TimerCommand::StartClipLoop { clip_id, .. }
                | TimerCommand::StopClipLoop { clip_id, .. } => {
                    // A missing clip leaves nothing to loop
                    if clip_id >= 1 {
                        transport.schedule_timer_command(0, command);
                    }
                }
                TimerCommand::StartPart { .. } | TimerCommand::StopPart { .. } => {
                    self.handle_timer_command(transport, command);
                }
                TimerCommand::StopPlayback => {
                    if let Some(handler) = &mut self.stop_handler {
                        handler();
                    }
                    transport.schedule_timer_command(0, command);
                }
            }
        }
    }

    /// Apply a timer command to the playfield state machine.
    ///
    /// Also the entry point for the transport's `timer_command` signal.
    pub fn handle_timer_command(&mut self, transport: &dyn Transport, command: TimerCommand) {
        match command {
            TimerCommand::StartPart {
                channel,
                column,
                part,
                offset,
            } => {
                self.playfield
                    .start_part(channel as usize, column as usize, part as usize, offset);
            }
            TimerCommand::StopPart {
                channel,
                column,
                part,
            } => {
                self.playfield
                    .stop_part(channel as usize, column as usize, part as usize);
            }
            TimerCommand::StopPlayback => {
                self.stop(transport);
            }
            TimerCommand::StartClipLoop { .. } | TimerCommand::StopClipLoop { .. } => {}
        }
    }

    /// Track clips the transport reports as started, so they can all be
    /// silenced when playback halts
    pub fn on_clip_command_sent(&mut self, command: &ClipCommand) {
        if command.start_playback {
            self.running_loops.insert(command.clip_id);
        }
    }

    /// React to the transport starting or stopping.
    ///
    /// On stop, every loop that may be sounding gets a stop command on every
    /// scope it could have been started through, and the playfield is
    /// reinitialised.
    pub fn on_timer_running_changed(&mut self, transport: &dyn Transport, running: bool) {
        if running {
            return;
        }
        for &clip_id in &self.running_loops {
            let mut command = ClipCommand::no_effect_command(clip_id);
            command.stop_playback = true;
            transport.schedule_clip_command(command, 0);
            let mut command = ClipCommand::effected_command(clip_id);
            command.stop_playback = true;
            transport.schedule_clip_command(command, 0);
            for channel in 0..PLAYFIELD_CHANNELS as u8 {
                let mut command = ClipCommand::channel_command(clip_id, channel);
                command.midi_note = 60;
                command.stop_playback = true;
                transport.schedule_clip_command(command, 0);
            }
        }
        self.running_loops.clear();
        self.playfield.reset();
    }

    /// Walk the playhead to a new position one sub-step at a time, applying
    /// every playlist entry crossed on the way
    fn move_playhead(&mut self, transport: &dyn Transport, new_position: u64, ignore_stop: bool) {
        if new_position == self.playhead {
            return;
        }
        let forward = new_position > self.playhead;
        while self.playhead != new_position {
            if forward {
                self.playhead += 1;
            } else {
                self.playhead -= 1;
            }
            let Some(commands) = self.playlist.get(&self.playhead).cloned() else {
                continue;
            };
            for command in commands {
                match command {
                    TimerCommand::StopPlayback if ignore_stop => {}
                    TimerCommand::StartClipLoop { clip_id, .. }
                    | TimerCommand::StopClipLoop { clip_id, .. } => {
                        if clip_id >= 1 {
                            transport.schedule_timer_command(0, command);
                        } else {
                            warn!("segment references a missing clip, skipping");
                        }
                    }
                    _ => self.handle_timer_command(transport, command),
                }
            }
        }
    }
}

fn start_command(clip: &SegmentClip, is_loop_channel: bool, position: u64) -> TimerCommand {
    if is_loop_channel {
        TimerCommand::StartClipLoop {
            channel: clip.channel,
            clip_id: clip.clip_id,
            note: 60,
        }
    } else {
        TimerCommand::StartPart {
            channel: clip.channel,
            column: clip.column,
            part: clip.part,
            offset: position,
        }
    }
}

fn stop_command(clip: &SegmentClip, is_loop_channel: bool) -> TimerCommand {
    if is_loop_channel {
        TimerCommand::StopClipLoop {
            channel: clip.channel,
            clip_id: clip.clip_id,
            note: 60,
        }
    } else {
        TimerCommand::StopPart {
            channel: clip.channel,
            column: clip.column,
            part: clip.part,
        }
    }
}
