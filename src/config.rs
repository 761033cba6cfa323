//! Instance-scoped configuration, replacing the source's process-wide globals
//! (`_WM_SampleRate`, `_WM_MasterVolume`, `_WM_MixerOptions`).

use crate::EngineError;
use bitflags::bitflags;

bitflags! {
    /// Mixer option bits read by the volume kernel.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MixerOptions: u32 {
        /// Use the squared ("perceptual") volume curve instead of the linear one.
        const LOG_VOLUME = 0x01;
    }
}

/// Read-only settings captured once at [`crate::Engine::new`] time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    sample_rate: u32,
    master_volume: i32,
    mixer_options: MixerOptions,
}

impl Config {
    /// Builds a config, rejecting a zero sample rate (which would divide by
    /// zero in the tuning kernel).
    pub fn new(sample_rate: u32, master_volume: i32, mixer_options: MixerOptions) -> Result<Self, EngineError> {
        if sample_rate == 0 {
            return Err(EngineError::InvalidConfig("sample_rate must be nonzero".into()));
        }
        Ok(Self { sample_rate, master_volume, mixer_options })
    }

    /// Sample rate in Hz.
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Master volume, scaled the same way as the per-voice volume kernel (0..1024).
    pub fn master_volume(&self) -> i32 {
        self.master_volume
    }

    /// Active mixer option bits.
    pub fn mixer_options(&self) -> MixerOptions {
        self.mixer_options
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sample_rate: 44_100,
            master_volume: 960,
            mixer_options: MixerOptions::empty(),
        }
    }
}
