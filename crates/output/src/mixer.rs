//! Hardware mixer session: attaches to one playback volume element and
//! applies decibel levels resolved by the volume engine.
//!
//! All decibel values travel in whole dB at the API surface and are
//! scaled to the control's hundredth-of-a-dB precision on the way in and
//! out. Runtime set failures are logged and swallowed; a volume error
//! must never interrupt playback.

use alsa::mixer::{Mixer, MilliBel, Selem, SelemChannelId, SelemId};
use alsa::Round;

use crate::error::MixerError;
use crate::volume::MIN_VOLUME_DB;

/// Sentinel the control layer uses for "gain mute" ranges.
const DB_GAIN_MUTE: i64 = -9_999_999;

/// Resolve a requested level against the forcing flags and the mixer's
/// discovered range. Returns the left/right whole-dB pair to apply plus
/// whether the request collapsed to the minimum.
fn resolve_level(
    setmax: bool,
    mut setmin: bool,
    mut db_l: i64,
    mut db_r: i64,
    min_db: i64,
    max_db: i64,
) -> (i64, i64, bool) {
    if db_l < MIN_VOLUME_DB || db_l == DB_GAIN_MUTE {
        setmin = true;
    }
    if setmax {
        db_l = max_db / 100;
        db_r = max_db / 100;
    }
    if setmin {
        db_l = min_db / 100;
        db_r = min_db / 100;
    }
    (
        db_l.clamp(min_db / 100, max_db / 100),
        db_r.clamp(min_db / 100, max_db / 100),
        setmin,
    )
}

/// One attached playback volume element.
pub struct MixerSession {
    mixer: Mixer,
    elem_name: String,
    elem_index: u32,
    /// Discovered range in hundredths of a dB.
    min_db: i64,
    max_db: i64,
}

impl MixerSession {
    /// Open a control handle, bind the named element, unmute it if it has
    /// a switch, and read back its decibel range.
    pub fn attach(ctl: &str, elem_name: &str, elem_index: u32) -> Result<Self, MixerError> {
        let mixer = Mixer::new(ctl, false).map_err(|source| MixerError::Attach {
            ctl: ctl.to_string(),
            source,
        })?;

        let (min_db, max_db) = {
            let selem = mixer
                .find_selem(&SelemId::new(elem_name, elem_index))
                .ok_or_else(|| MixerError::ElementNotFound {
                    name: elem_name.to_string(),
                    index: elem_index,
                })?;

            if selem.has_playback_switch() {
                if let Err(e) = selem.set_playback_switch_all(1) {
                    tracing::warn!(element = elem_name, error = %e, "unable to unmute element");
                }
            }

            let (MilliBel(min), MilliBel(max)) = selem.get_playback_db_range();
            (min, max)
        };

        tracing::debug!(
            element = elem_name,
            min_db = min_db / 100,
            max_db = max_db / 100,
            "mixer attached"
        );

        Ok(Self {
            mixer,
            elem_name: elem_name.to_string(),
            elem_index,
            min_db,
            max_db,
        })
    }

    /// Discovered decibel range in hundredths of a dB.
    pub fn db_range(&self) -> (i64, i64) {
        (self.min_db, self.max_db)
    }

    /// Apply a whole-dB level pair, optionally forced to the range
    /// extremes. Errors from the underlying call are logged only.
    pub fn set_level(&mut self, setmax: bool, setmin: bool, db_l: i64, db_r: i64) {
        let (db_l, db_r, setmin) = resolve_level(setmax, setmin, db_l, db_r, self.min_db, self.max_db);
        tracing::debug!(
            element = %self.elem_name,
            db_l,
            db_r,
            setmax,
            setmin,
            "set hardware level"
        );

        let _ = self.mixer.handle_events();
        let Some(selem) = self.selem() else {
            tracing::warn!(element = %self.elem_name, "mixer element disappeared");
            return;
        };
        if let Err(e) = selem.set_playback_db_all(MilliBel(db_l * 100), Round::Floor) {
            tracing::warn!(error = %e, "error setting playback level");
        }
    }

    /// Read the current left/right level back in whole dB, for
    /// diagnostics and round-trip checks.
    pub fn current_db(&mut self) -> Option<(i64, i64)> {
        let _ = self.mixer.handle_events();
        let selem = self.selem()?;
        let MilliBel(l) = selem.get_playback_vol_db(SelemChannelId::FrontLeft).ok()?;
        let MilliBel(r) = selem.get_playback_vol_db(SelemChannelId::FrontRight).ok()?;
        Some((l / 100, r / 100))
    }

    fn selem(&self) -> Option<Selem<'_>> {
        self.mixer
            .find_selem(&SelemId::new(&self.elem_name, self.elem_index))
    }
}

/// Print the playback-volume-capable elements of a device's control to
/// stdout. Callable regardless of session state.
pub fn list_mixers(output_device: &str) -> Result<(), MixerError> {
    let ctl = crate::device::ctl_for_device(output_device);
    tracing::info!(device = output_device, ctl = %ctl, "listing mixers");

    let mixer = Mixer::new(&ctl, false).map_err(|source| MixerError::Attach {
        ctl: ctl.clone(),
        source,
    })?;

    println!("Volume controls for {output_device}");
    for elem in mixer.iter() {
        let Some(selem) = Selem::new(elem) else {
            continue;
        };
        if !selem.has_playback_volume() {
            continue;
        }
        let sid = selem.get_id();
        let name = sid.get_name().unwrap_or("?").to_string();
        if sid.get_index() > 0 {
            println!("   {},{}", name, sid.get_index());
        } else {
            println!("   {name}");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    // Plausible range for a DAC: -102.00 dB .. 0.00 dB.
    const MIN: i64 = -10_200;
    const MAX: i64 = 0;

    #[test]
    fn plain_level_passes_through() {
        assert_eq!(resolve_level(false, false, -20, -20, MIN, MAX), (-20, -20, false));
    }

    #[test]
    fn setmin_forces_mixer_minimum() {
        assert_eq!(resolve_level(false, true, 0, 0, MIN, MAX), (-102, -102, true));
    }

    #[test]
    fn setmax_forces_mixer_maximum() {
        assert_eq!(resolve_level(true, false, -40, -40, MIN, MAX), (0, 0, false));
    }

    #[test]
    fn levels_below_protocol_floor_collapse_to_minimum() {
        assert_eq!(resolve_level(false, false, -80, -80, MIN, MAX), (-102, -102, true));
        // -72 itself is still representable.
        assert_eq!(resolve_level(false, false, -72, -72, MIN, MAX), (-72, -72, false));
    }

    #[test]
    fn levels_are_clamped_to_the_discovered_range() {
        assert_eq!(resolve_level(false, false, 5, 5, MIN, MAX), (0, 0, false));
        // A range that tops out above zero keeps positive gain available.
        assert_eq!(resolve_level(false, false, 5, 5, MIN, 600), (5, 5, false));
    }

    #[test]
    fn gain_mute_sentinel_collapses_to_minimum() {
        assert_eq!(
            resolve_level(false, false, DB_GAIN_MUTE, DB_GAIN_MUTE, MIN, MAX),
            (-102, -102, true)
        );
    }
}
