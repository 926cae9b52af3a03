//! Volume engine: maps remote protocol volume values onto either a
//! software 16.16 gain pair or a hardware mixer decibel level.
//!
//! The remote protocol sends 16.16 fixed-point gains taken from a
//! 101-entry logarithmic curve (entry 0 = volume 100, entry 100 = mute).
//! The tables below are carried verbatim from that protocol scale,
//! including its two ambiguous flat runs and one swapped adjacent pair;
//! the lookup is written around those quirks rather than re-deriving a
//! smooth curve.

use std::sync::Mutex;

use crate::mixer::MixerSession;
use crate::ring::FIXED_ONE;
use crate::state::OutputState;

/// Remote protocol volume floor in whole dB; hardware levels below this
/// force the mixer minimum (mute).
pub const MIN_VOLUME_DB: i64 = -72;

/// Protocol volume curve: index 0 corresponds to remote volume 100,
/// index 100 to remote volume 0. Non-increasing apart from the known
/// swapped 2048/2050 pair, which is kept as the protocol ships it.
pub const VOLUME_CURVE: [i64; 101] = [
    65536, 61952, 58624, 55296, 52224, 49408, 46592, 44032, 41728, 39424,
    37120, 35072, 33024, 31232, 29696, 27904, 26368, 24832, 23552, 22272,
    20992, 19968, 18688, 17664, 16640, 15872, 14848, 14080, 13312, 12544,
    12032, 11264, 10752, 9984, 9472, 8960, 8448, 7936, 7680, 7168,
    6656, 6400, 6144, 5632, 5376, 5120, 4864, 4608, 4352, 4096,
    3840, 3584, 3328, 3328, 3072, 2816, 2816, 2560, 2304, 2304,
    2048, 2050, 1937, 1830, 1729, 1634, 1543, 1458, 1378, 1302,
    1230, 1162, 1098, 1037, 980, 926, 781, 658, 555, 468,
    395, 333, 281, 237, 200, 168, 142, 120, 101, 85,
    72, 61, 51, 43, 36, 31, 26, 22, 18, 16,
    0,
];

/// Renormalized gain scale over the same index domain, used for the
/// software volume path when linear-in-dB behaviour is requested.
pub const VOLUME_CURVE_RENORM: [i64; 101] = [
    65536, 58409, 52057, 46396, 41350, 36854, 32768, 29274, 26090,
    23253, 20724, 18471, 16384, 14672, 13076, 11654, 10387, 9257, 8192,
    7353, 6554, 5841, 5206, 4640, 4096, 3685, 3285, 2927, 2609, 2325,
    2048, 1847, 1646, 1467, 1308, 1165, 1024, 926, 825, 735, 655,
    584, 512, 464, 414, 369, 328, 293, 256, 233, 207, 185, 165, 147, 128,
    117, 104, 93, 83, 74, 64, 58, 52, 46, 41, 37, 32, 29, 26, 23, 21, 18, 16,
    0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
];

/// Index of the first curve entry strictly below `level`, clamped so the
/// bracketing entry above it always exists.
fn curve_floor_index(level: u32) -> usize {
    VOLUME_CURVE
        .iter()
        .position(|&v| v < i64::from(level))
        .unwrap_or(VOLUME_CURVE.len() - 1)
        .max(1)
}

/// Software gain pair for a remote level.
///
/// Default mode passes the 16.16 values straight through. The
/// linear-dB-internal mode looks the left value up on the protocol curve
/// and substitutes the renormalized gain for both channels. The lookup
/// is driven by the left channel only, mirroring the upstream protocol
/// (a known asymmetry, preserved on purpose).
pub fn software_gain(left: u32, right: u32, linear_db_internal: bool) -> (i32, i32) {
    if !linear_db_internal {
        return (left as i32, right as i32);
    }
    if left == 0 {
        return (0, 0);
    }
    let g = VOLUME_CURVE_RENORM[curve_floor_index(left) - 1] as i32;
    (g, g)
}

/// A hardware volume request resolved to whole decibels.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HwLevel {
    /// Attenuation in whole dB relative to the top of the scale.
    Db(i64),
    /// Force the mixer minimum (mute).
    Min,
}

/// Map a remote level onto a hardware decibel value.
///
/// Linear mode walks the protocol curve and produces an index-based
/// attenuation, rounding to the nearer of the two bracketing entries.
/// Non-linear mode converts the 16.16 value directly via 20·log10.
pub fn hardware_level(left: u32, linear: bool) -> HwLevel {
    if left == 0 {
        return HwLevel::Min;
    }
    if linear {
        let low = curve_floor_index(left);
        let level = i64::from(left);
        let db = if (VOLUME_CURVE[low - 1] - level) >= (level - VOLUME_CURVE[low]) {
            -(low as i64)
        } else {
            -(low as i64 - 1)
        };
        HwLevel::Db(db)
    } else {
        let db = (20.0 * f64::from(left).log10() - 20.0 * 65536_f64.log10()).floor() as i64;
        HwLevel::Db(db)
    }
}

/// Which component owns volume for this process, fixed at startup.
pub enum VolumeMode {
    Software { linear_db_internal: bool },
    Hardware { linear: bool },
}

/// Entry point for the remote volume-control protocol. Failures are
/// internal and logged; volume must never interrupt playback.
pub struct VolumeControl {
    mode: VolumeMode,
    mixer: Option<MixerSession>,
}

impl VolumeControl {
    pub fn software(linear_db_internal: bool) -> Self {
        Self {
            mode: VolumeMode::Software { linear_db_internal },
            mixer: None,
        }
    }

    pub fn hardware(mixer: MixerSession, linear: bool) -> Self {
        Self {
            mode: VolumeMode::Hardware { linear },
            mixer: Some(mixer),
        }
    }

    /// Apply a remote volume command (16.16 scale, 65536 = unity).
    pub fn set_volume(&mut self, shared: &Mutex<OutputState>, left: u32, right: u32) {
        match self.mode {
            VolumeMode::Software { linear_db_internal } => {
                let (gain_l, gain_r) = software_gain(left, right, linear_db_internal);
                tracing::debug!(left, right, gain_l, gain_r, "software volume");
                let mut out = shared.lock().unwrap();
                out.gain_l = gain_l;
                out.gain_r = gain_r;
            }
            VolumeMode::Hardware { linear } => {
                {
                    // Hardware applies the attenuation; keep the frame
                    // writer at unity.
                    let mut out = shared.lock().unwrap();
                    out.gain_l = FIXED_ONE;
                    out.gain_r = FIXED_ONE;
                }
                let Some(mixer) = self.mixer.as_mut() else {
                    return;
                };
                match hardware_level(left, linear) {
                    HwLevel::Db(db) => {
                        tracing::debug!(left, db, linear, "hardware volume");
                        mixer.set_level(false, false, db, db);
                    }
                    HwLevel::Min => mixer.set_level(false, true, 0, 0),
                }
            }
        }
    }

    /// Push the mixer to its maximum once (unmute-to-max startup option).
    pub fn unmute_to_max(&mut self) {
        if let Some(mixer) = self.mixer.as_mut() {
            mixer.set_level(true, false, 0, 0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn curve_endpoints_are_unity_and_mute() {
        assert_eq!(VOLUME_CURVE[0], 65536);
        assert_eq!(VOLUME_CURVE[100], 0);
        assert_eq!(VOLUME_CURVE_RENORM[0], 65536);
        assert_eq!(VOLUME_CURVE_RENORM[100], 0);
    }

    #[test]
    fn curve_is_non_increasing_except_swapped_pair() {
        let mut increases = Vec::new();
        for i in 1..VOLUME_CURVE.len() {
            if VOLUME_CURVE[i] > VOLUME_CURVE[i - 1] {
                increases.push(i);
            }
        }
        // The protocol ships 2048 followed by 2050; everything else
        // descends or stays flat.
        assert_eq!(increases, vec![61]);
        assert_eq!(VOLUME_CURVE[60], 2048);
        assert_eq!(VOLUME_CURVE[61], 2050);
    }

    #[test]
    fn renorm_curve_is_non_increasing() {
        for pair in VOLUME_CURVE_RENORM.windows(2) {
            assert!(pair[1] <= pair[0]);
        }
    }

    #[test]
    fn software_linear_passes_values_through() {
        assert_eq!(software_gain(65536, 65536, false), (65536, 65536));
        assert_eq!(software_gain(1234, 5678, false), (1234, 5678));
    }

    #[test]
    fn software_db_mode_mutes_at_zero_and_tops_out_at_unity() {
        assert_eq!(software_gain(0, 0, true), (0, 0));
        assert_eq!(software_gain(65536, 65536, true), (65536, 65536));
    }

    #[test]
    fn software_db_mode_uses_left_channel_for_both() {
        let (l, r) = software_gain(32768, 999, true);
        assert_eq!(l, r);
    }

    #[test]
    fn hardware_zero_forces_minimum() {
        assert_eq!(hardware_level(0, true), HwLevel::Min);
        assert_eq!(hardware_level(0, false), HwLevel::Min);
    }

    #[test]
    fn hardware_nonlinear_is_log_of_fixed_point() {
        assert_eq!(hardware_level(65536, false), HwLevel::Db(0));
        // 20*log10(0.5) = -6.02, floored.
        assert_eq!(hardware_level(32768, false), HwLevel::Db(-7));
    }

    #[test]
    fn hardware_linear_rounds_to_nearer_curve_entry() {
        // Exact top entry: zero attenuation.
        assert_eq!(hardware_level(65536, true), HwLevel::Db(0));
        // Exact second entry (61952): one step down.
        assert_eq!(hardware_level(61952, true), HwLevel::Db(-1));
        // Midpoint bias: closer to the lower bracket rounds down.
        assert_eq!(hardware_level(62000, true), HwLevel::Db(-1));
    }
}
