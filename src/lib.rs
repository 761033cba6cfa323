//! MIDI wavetable synthesis: event-dispatch and voice-state core.
//!
//! This crate owns the real-time state machine that sits between a decoded
//! MIDI byte stream and the DSP inner loop: the 16-channel controller
//! surface, the two-slot-per-note polyphonic voice pool with its intrusive
//! active list, the envelope automaton, and the pitch/volume/pan kernels.
//! It does not parse MIDI files, decode patch/sample assets, run the DSP
//! inner loop, or perform audio output — see each module's docs for the
//! external collaborators it expects.
//!
//! # Quick start
//! ```
//! use wavesynth_core::{Config, Engine};
//! use wavesynth_core::patch::{Patch, Sample};
//!
//! let mut engine = Engine::new(Config::default());
//! engine.patches().load(Patch::single_sample(0, 100, 0, Sample::flat(256)));
//!
//! let mut running_status = 0u8;
//! let consumed = engine.setup_midi_event(&[0x90, 0x3c, 0x64], &mut running_status);
//! assert_eq!(consumed, 3);
//! ```

#![warn(missing_docs)]

pub mod channel;
pub mod config;
mod engine;
pub mod event;
pub mod patch;
pub mod tables;
mod tuning;
pub mod voice;
pub mod volume;

pub use config::{Config, MixerOptions};
pub use engine::Engine;
pub use voice::VoiceId;

/// Errors surfaced by the core.
///
/// Most failure modes described by the design (unresolved patch, over-range
/// controller values) are not represented here: they are silently dropped or
/// clamped by design, since a wavetable engine must keep playing through
/// ill-formed input. Only a misconfigured instance and a genuinely corrupt
/// event stream are reported.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// [`Config::new`] was given a nonsensical setting.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// `setup_midi_event` hit an unrecognized `0xFn` class.
    #[error("corrupt event at offset {offset}")]
    Corrupt {
        /// Byte offset of the unrecognized event within the call's input slice.
        offset: usize,
    },
}
