//! Append-only, coalescing event-stream builder.
//!
//! Each builder call either overwrites a still-empty tail record (coalescing
//! a "no event this tick" sentinel) or appends a fresh one. This preserves
//! the record-then-replay separation the renderer depends on without
//! reaching for raw function pointers: [`HandlerRef`] is a tagged variant
//! matched by [`crate::Engine::replay_event`].

/// Which handler a recorded event should be replayed through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerRef {
    NoteOn,
    NoteOff,
    Aftertouch,
    ControlBankSelect,
    ControlDataEntryCourse,
    ControlChannelVolume,
    ControlChannelBalance,
    ControlChannelPan,
    ControlChannelExpression,
    ControlDataEntryFine,
    ControlChannelHold,
    ControlDataIncrement,
    ControlDataDecrement,
    ControlNonRegisteredParamFine,
    ControlNonRegisteredParamCourse,
    ControlRegisteredParamFine,
    ControlRegisteredParamCourse,
    ControlChannelSoundOff,
    ControlChannelControllersOff,
    ControlChannelNotesOff,
    Patch,
    ChannelPressure,
    Pitch,
    SysexRolandDrumTrack,
    SysexGmReset,
    SysexRolandReset,
    SysexYamahaReset,
    MidiDivisions,
    Tempo,
    MetaPassthrough(MetaKind),
}

/// Meta events that are recorded verbatim but otherwise acted on as no-ops
/// by the core (a downstream MIDI-timeline consumer reads them back out).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetaKind {
    SequenceNumber,
    Text,
    Copyright,
    TrackName,
    InstrumentName,
    Lyric,
    Marker,
    CuePoint,
    ProgramName,
    DeviceName,
    MidiChannel,
    MidiPort,
    EndOfTrack,
}

/// One row of the event stream: a time-stamped, optionally-empty handler call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventRecord {
    pub handler: Option<HandlerRef>,
    pub channel: u8,
    pub data: u32,
    pub samples_to_next: u32,
}

impl EventRecord {
    fn empty() -> Self {
        Self { handler: None, channel: 0, data: 0, samples_to_next: 0 }
    }
}

/// The append-only, coalescing event buffer.
#[derive(Debug, Clone, Default)]
pub struct EventStream {
    records: Vec<EventRecord>,
}

impl EventStream {
    /// A stream seeded with the single null sentinel record `init` writes,
    /// matching the reference implementation's first allocated event.
    pub fn new() -> Self {
        Self { records: vec![EventRecord::empty()] }
    }

    /// Coalesces into the empty tail record if one exists, else appends a
    /// fresh record with `samples_to_next = 0`.
    pub fn push(&mut self, handler: HandlerRef, channel: u8, data: u32) {
        if let Some(last) = self.records.last_mut() {
            if last.handler.is_none() {
                last.handler = Some(handler);
                last.channel = channel;
                last.data = data;
                return;
            }
        }
        self.records.push(EventRecord { handler: Some(handler), channel, data, samples_to_next: 0 });
    }

    /// All recorded rows, in stream order.
    pub fn records(&self) -> &[EventRecord] {
        &self.records
    }

    /// Rewinds the play cursor back to the first event (used by `reset_to_start`).
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the stream holds only the initial empty sentinel.
    pub fn is_empty(&self) -> bool {
        self.records.len() <= 1 && self.records.first().map(|r| r.handler.is_none()).unwrap_or(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_push_coalesces_into_sentinel() {
        let mut stream = EventStream::new();
        assert_eq!(stream.len(), 1);
        stream.push(HandlerRef::NoteOn, 0, 0x3c64);
        assert_eq!(stream.len(), 1, "should overwrite the sentinel, not append");
        assert_eq!(stream.records()[0].handler, Some(HandlerRef::NoteOn));
    }

    #[test]
    fn second_push_appends() {
        let mut stream = EventStream::new();
        stream.push(HandlerRef::NoteOn, 0, 0x3c64);
        stream.push(HandlerRef::NoteOff, 0, 0x3c00);
        assert_eq!(stream.len(), 2);
    }
}
