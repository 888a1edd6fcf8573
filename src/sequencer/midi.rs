/// MIDI event representing a single 3-byte channel-voice message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MidiEvent {
    /// MIDI status byte (includes channel)
    pub status: u8,
    /// First data byte (note number, CC number, etc.)
    pub data1: u8,
    /// Second data byte (velocity, CC value, etc.)
    pub data2: u8,
}

impl MidiEvent {
    /// Create a new MIDI event
    pub fn new(status: u8, data1: u8, data2: u8) -> Self {
        Self {
            status,
            data1,
            data2,
        }
    }

    /// Create a note on event
    pub fn note_on(channel: u8, note: u8, velocity: u8) -> Self {
        Self {
            status: 0x90 | (channel & 0x0F),
            data1: note,
            data2: velocity,
        }
    }

    /// Create a note off event
    pub fn note_off(channel: u8, note: u8, velocity: u8) -> Self {
        Self {
            status: 0x80 | (channel & 0x0F),
            data1: note,
            data2: velocity,
        }
    }

    /// Check if this is a note on event (with non-zero velocity)
    pub fn is_note_on(&self) -> bool {
        (self.status & 0xF0) == 0x90 && self.data2 > 0
    }

    /// Check if this is a note off event (or note on with zero velocity)
    pub fn is_note_off(&self) -> bool {
        (self.status & 0xF0) == 0x80 || ((self.status & 0xF0) == 0x90 && self.data2 == 0)
    }

    /// Get the MIDI channel (0-15)
    pub fn channel(&self) -> u8 {
        self.status & 0x0F
    }

    /// Get the message type (upper 4 bits of status)
    pub fn message_type(&self) -> u8 {
        self.status & 0xF0
    }
}

/// An ordered list of MIDI events meant to fire together.
///
/// The buffer itself carries no timing; the scheduling offset is external
/// (compiled position buffers are keyed by their sub-step offset, and the
/// transport honours the offset a buffer was submitted with). Events keep
/// their insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MidiBuffer {
    events: Vec<MidiEvent>,
}

impl MidiBuffer {
    /// Create a new empty buffer
    pub fn new() -> Self {
        Self { events: Vec::new() }
    }

    /// Create a buffer holding a single All Notes Off (CC 123) for a channel
    pub fn all_notes_off(channel: u8) -> Self {
        let mut buffer = Self::new();
        buffer.add_event(MidiEvent::new(0xB0 | (channel & 0x0F), 123, 0));
        buffer
    }

    /// Append an event to the buffer
    pub fn add_event(&mut self, event: MidiEvent) {
        self.events.push(event);
    }

    /// Append all events from another buffer
    pub fn append(&mut self, other: &MidiBuffer) {
        self.events.extend_from_slice(&other.events);
    }

    pub fn events(&self) -> &[MidiEvent] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn note_on_with_zero_velocity_counts_as_off() {
        let event = MidiEvent::new(0x93, 60, 0);
        assert!(!event.is_note_on());
        assert!(event.is_note_off());
        assert_eq!(event.channel(), 3);
        assert_eq!(event.message_type(), 0x90);
    }

    #[test]
    fn buffer_preserves_insertion_order() {
        let mut buffer = MidiBuffer::new();
        buffer.add_event(MidiEvent::note_on(0, 60, 100));
        buffer.add_event(MidiEvent::note_on(0, 64, 100));
        buffer.add_event(MidiEvent::note_off(0, 60, 64));
        let notes: Vec<u8> = buffer.events().iter().map(|e| e.data1).collect();
        assert_eq!(notes, vec![60, 64, 60]);
    }

    #[test]
    fn all_notes_off_is_cc_123() {
        let buffer = MidiBuffer::all_notes_off(5);
        assert_eq!(buffer.len(), 1);
        assert_eq!(buffer.events()[0], MidiEvent::new(0xB5, 123, 0));
    }
}
