//! The two-slot-per-(channel,note) voice pool and its intrusive active list.

use std::sync::Arc;

use bitflags::bitflags;

use crate::patch::{Patch, Sample};

bitflags! {
    /// Per-voice playback mode bits, copied from the resolved [`Sample`] at note-on.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SampleModes: u8 {
        /// The voice has an envelope generator (as opposed to a flat/looped one-shot).
        const ENVELOPE = 0b0001;
        /// The sample loops while the note is held.
        const LOOP = 0b0010;
        /// Note-off enters the sustain-release stage (3) rather than the normal one (4).
        const SUSTAIN = 0b0100;
        /// Note-off enters the clamped-release stage (5) rather than the normal one (4).
        const CLAMPED = 0b1000;
    }
}

bitflags! {
    /// Hold-pedal bookkeeping latched on a voice at note-on / note-off time.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct HoldFlags: u8 {
        /// Snapshot of `channel.hold` taken when the voice was triggered.
        const HELD = 0b01;
        /// A note-off arrived while the pedal was held; release is deferred.
        const HOLD_OFF = 0b10;
    }
}

/// Identifies one of the two slots for a given `(channel, note)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VoiceId {
    /// 0 or 1: which of the two per-(channel,note) slots.
    pub slot: u8,
    /// MIDI channel, 0..16.
    pub channel: u8,
    /// MIDI note, 0..128.
    pub note: u8,
}

impl VoiceId {
    pub(crate) fn new(slot: u8, channel: u8, note: u8) -> Self {
        Self { slot, channel, note }
    }

    /// The other slot for the same (channel, note).
    pub fn other_slot(&self) -> VoiceId {
        VoiceId::new(1 - self.slot, self.channel, self.note)
    }
}

/// A single playback voice: sample cursor, envelope state, and pool links.
///
/// Voices are pool-resident — they live inside [`crate::Engine`]'s fixed
/// `[2][16][128]` table and are never individually allocated. `replay` and
/// `next` are nullable back-references into that same table rather than
/// owning handles, avoiding a cyclic-ownership graph.
#[derive(Debug, Clone, Default)]
pub struct Voice {
    /// Whether this slot currently holds a sounding or releasing note.
    pub active: bool,
    /// Note-off arrived during the initial attack stage; latched until attack completes.
    pub is_off: bool,
    /// `(channel << 8) | note`, redundant with the slot's own `(channel, note)` but
    /// kept to match the source's event-driven fields and the re-trigger bookkeeping.
    pub noteid: u16,
    pub(crate) patch: Option<Arc<Patch>>,
    pub(crate) sample: Option<Arc<Sample>>,
    /// Fixed-point playback cursor into the sample, written back by the DSP loop.
    pub sample_pos: u32,
    /// Per-frame phase increment, recomputed on pitch/controller changes.
    pub sample_inc: u32,
    /// Velocity last applied to this voice (note-on, aftertouch, or channel pressure).
    pub velocity: u8,
    /// Computed 0..1024 mix gain.
    pub vol_lvl: i32,
    pub modes: SampleModes,
    /// Envelope stage, 0..6.
    pub env: u8,
    /// Signed per-frame envelope delta; negative during release/re-trigger-fade.
    pub env_inc: i32,
    /// Current envelope amplitude, written back by the DSP loop.
    pub env_level: i32,
    pub hold: HoldFlags,
    /// The other slot for this (channel, note), if it is mid-attack during a re-trigger.
    pub replay: Option<VoiceId>,
    /// Intrusive active-list link.
    pub(crate) next: Option<VoiceId>,
}

impl Voice {
    /// The patch currently bound to this voice, if any.
    pub fn patch(&self) -> Option<&Arc<Patch>> {
        self.patch.as_ref()
    }

    /// The sample currently bound to this voice, if any.
    pub fn sample(&self) -> Option<&Arc<Sample>> {
        self.sample.as_ref()
    }
}
