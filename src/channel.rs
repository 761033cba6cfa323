//! Per-channel MIDI controller surface.

use std::sync::Arc;

use crate::patch::Patch;

/// One of the 16 MIDI channels' controller state.
#[derive(Debug, Clone, Default)]
pub struct Channel {
    pub bank: u8,
    pub(crate) patch: Option<Arc<Patch>>,
    pub volume: u8,
    pub expression: u8,
    pub pressure: u8,
    pub pan: i8,
    pub balance: i8,
    pub left_adjust: i32,
    pub right_adjust: i32,
    /// Sustain pedal down (`true`) or up (`false`). `HOLD_OFF` latching lives
    /// on the individual voices, not here — see [`crate::voice::HoldFlags`].
    pub hold: bool,
    pub pitch: i32,
    pub pitch_range: u16,
    pub pitch_adjust: i32,
    /// 14-bit RPN/NRPN parameter-number selector.
    pub reg_data: u16,
    /// `false` selects RPN, `true` selects NRPN.
    pub reg_non: bool,
    pub isdrum: bool,
}

impl Channel {
    /// The patch currently assigned to this channel, if any.
    pub fn patch(&self) -> Option<&Arc<Patch>> {
        self.patch.as_ref()
    }

    /// Initial state for every channel before the first reset: matches a
    /// zero-initialized instance in the reference implementation, prior to
    /// the GM/Roland reset that `Engine::new` performs immediately after.
    pub(crate) fn zeroed() -> Self {
        Self::default()
    }
}
