//! Pitch/tuning pipeline: cents-to-phase increment derivation.

use crate::tables::FREQ_TABLE;

/// Seed frequency for a freshly-triggered note, before pitch-bend is applied.
///
/// `note_used` is the patch's fixed root note if it has one, else the
/// requested MIDI note. The result is later divided by 100 to select a
/// sample's root-frequency band.
pub(crate) fn seed_freq(note_used: u8) -> u32 {
    let idx = (note_used % 12) as usize * 100;
    let shift = 10 - (note_used / 12) as u32;
    FREQ_TABLE[idx] >> shift
}

/// Derives a voice's per-frame phase increment.
///
/// `base_note` is the patch's fixed root note if nonzero, else the voice's
/// triggered note. The two divisions are kept in this order (rather than
/// combined into one) to preserve the source's fixed-point scaling exactly.
pub(crate) fn derive_sample_inc(sample_rate: u32, base_note: u8, pitch_adjust: i32, inc_div: u32) -> u32 {
    let mut note_f = base_note as i32 * 100 + pitch_adjust;
    note_f = note_f.clamp(0, 12700);

    let idx = (note_f % 1200) as usize;
    let shift = 10 - (note_f / 1200) as u32;
    let freq = FREQ_TABLE[idx] >> shift;

    let denom = (sample_rate as u64 * 100) / 1024;
    (((freq as u64 / denom) * 1024) / inc_div as u64) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seed_freq_middle_c() {
        // note 60: 60 % 12 == 0, 60 / 12 == 5, shift == 5
        let f = seed_freq(60);
        assert_eq!(f, FREQ_TABLE[0] >> 5);
    }

    #[test]
    fn derive_sample_inc_clamps_negative_note_f_to_zero() {
        let inc = derive_sample_inc(44_100, 0, -100_000, 256);
        let inc_at_floor = derive_sample_inc(44_100, 0, 0, 256);
        assert_eq!(inc, inc_at_floor);
    }

    #[test]
    fn derive_sample_inc_clamps_large_note_f_to_ceiling() {
        let inc = derive_sample_inc(44_100, 127, 100_000, 256);
        let inc_at_ceiling = derive_sample_inc(44_100, 127, 12700 - 127 * 100, 256);
        assert_eq!(inc, inc_at_ceiling);
    }

    #[test]
    fn derive_sample_inc_is_monotonic_in_pitch() {
        let low = derive_sample_inc(44_100, 60, 0, 256);
        let high = derive_sample_inc(44_100, 60, 1200, 256);
        assert!(high > low);
    }
}
