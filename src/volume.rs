//! Volume and pan gain kernels.

use crate::config::MixerOptions;
use crate::tables::{LIN_VOLUME, PAN_VOLUME, SQR_VOLUME};

/// `vol_lvl = (curve[volume] * curve[expression] * curve[velocity]) / 1048576`,
/// scaled by the patch's amplitude trim. `curve` is [`SQR_VOLUME`] under
/// [`MixerOptions::LOG_VOLUME`], else [`LIN_VOLUME`].
pub fn compute_vol_lvl(volume: u8, expression: u8, velocity: u8, patch_amp: i32, options: MixerOptions) -> i32 {
    let curve: &[i16; 128] = if options.contains(MixerOptions::LOG_VOLUME) { &SQR_VOLUME } else { &LIN_VOLUME };

    let v = curve[volume as usize] as i64;
    let e = curve[expression as usize] as i64;
    let n = curve[velocity as usize] as i64;
    let volume = (v * e * n) / 1_048_576;
    (volume * patch_amp as i64 / 100) as i32
}

/// Computes the channel's `(left_adjust, right_adjust)` mixer gains from
/// `pan + balance`, clamped to `[-64, 63]` and offset into `PAN_VOLUME`'s
/// 0..127 index range.
pub fn compute_pan_adjust(pan: i8, balance: i8, master_volume: i32) -> (i32, i32) {
    let mut pan_adjust = balance as i32 + pan as i32;
    pan_adjust = pan_adjust.clamp(-64, 63);
    pan_adjust += 64;

    let amp = 32i64;
    let p = pan_adjust as usize;
    let left = (PAN_VOLUME[127 - p] as i64 * master_volume as i64 * amp) / 1_048_576;
    let right = (PAN_VOLUME[p] as i64 * master_volume as i64 * amp) / 1_048_576;
    (left as i32, right as i32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn silence_at_zero_velocity() {
        assert_eq!(compute_vol_lvl(100, 127, 0, 100, MixerOptions::empty()), 0);
    }

    #[test]
    fn full_scale_inputs_saturate_near_1024_before_amp_scaling() {
        let v = compute_vol_lvl(127, 127, 127, 100, MixerOptions::empty());
        // 1024^3 / 1048576 == 1024 exactly.
        assert_eq!(v, 1024);
    }

    #[test]
    fn log_volume_option_uses_squared_curve() {
        let lin = compute_vol_lvl(64, 127, 127, 100, MixerOptions::empty());
        let log = compute_vol_lvl(64, 127, 127, 100, MixerOptions::LOG_VOLUME);
        assert!(log < lin, "squared curve should be quieter than linear at half volume");
    }

    #[test]
    fn patch_amp_scales_linearly() {
        let full = compute_vol_lvl(127, 127, 127, 100, MixerOptions::empty());
        let half = compute_vol_lvl(127, 127, 127, 50, MixerOptions::empty());
        assert_eq!(half, full / 2);
    }

    #[test]
    fn centered_pan_splits_master_volume_evenly() {
        let (left, right) = compute_pan_adjust(0, 0, 1024);
        assert_eq!(left, right);
    }

    #[test]
    fn hard_left_pan_silences_right_channel() {
        let (left, right) = compute_pan_adjust(-64, 0, 1024);
        assert!(left > right);
        assert_eq!(right, 0);
    }

    #[test]
    fn pan_sum_matches_invariant_5() {
        let (left, right) = compute_pan_adjust(10, -3, 1024);
        let p = (10i32 - 3).clamp(-64, 63) + 64;
        let expected_left = (PAN_VOLUME[127 - p as usize] as i64 * 1024 * 32) / 1_048_576;
        let expected_right = (PAN_VOLUME[p as usize] as i64 * 1024 * 32) / 1_048_576;
        assert_eq!(left as i64 + right as i64, expected_left + expected_right);
    }
}
