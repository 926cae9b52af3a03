//! Shared state between the output worker and its producers.
//!
//! One mutex guards everything in [`OutputState`]: the control/decoder
//! side publishes desired state, sample rate, encoding and audio frames;
//! the output worker reads them, drains the ring, and writes playback
//! telemetry back. The worker never holds the lock across a blocking
//! device wait.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::ring::{FrameRing, SilenceSource, FIXED_ONE};
use crate::types::Encoding;

/// Player state published by the control collaborator.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PlayerState {
    /// Output disabled; no device is held while off.
    #[default]
    Off,
    /// Device may be open but nothing is queued; the writer feeds silence.
    Stopped,
    /// Audio is queueing but playback has not reached the start
    /// threshold yet; the writer feeds silence until it does.
    Buffering,
    /// Steady playback.
    Running,
}

impl PlayerState {
    pub fn is_off(self) -> bool {
        self == PlayerState::Off
    }
}

/// Cross-fade activity published by the fade collaborator. Only the
/// crossing phase concerns the frame writer; other fade shapes are
/// pre-applied by the producer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FadePhase {
    #[default]
    Inactive,
    Cross,
}

/// Everything the output worker shares with its producers, guarded by a
/// single mutex. Producers write the request fields (`state`, `device`,
/// `current_sample_rate`, `encoding`, gains, ring); the worker writes the
/// telemetry fields. `state` is the only field both sides set.
pub struct OutputState {
    pub state: PlayerState,
    /// ALSA device name to open ("default", "hw:0,0", ...).
    pub device: String,
    /// Requested buffer: values below 500 are milliseconds, larger
    /// values are literal frames.
    pub buffer: u32,
    /// Requested period: values below 50 are a period count, larger
    /// values are literal frames.
    pub period: u32,
    pub current_sample_rate: u32,
    pub encoding: Encoding,
    /// DSD polarity inversion request (native DSD only).
    pub invert: bool,

    /// 16.16 software gains applied by the frame writer; forced to unity
    /// while a hardware mixer owns volume.
    pub gain_l: i32,
    pub gain_r: i32,

    /// Frames that must be queued before a cold start begins playback;
    /// authoritative value is twice the negotiated buffer size.
    pub start_frames: u64,

    /// Frames committed to the device since the session opened.
    pub frames_played: u64,
    /// `frames_played` captured at the last delay query; paired with
    /// `updated` it is the sole position-sync mechanism.
    pub frames_played_snapshot: u64,
    /// Frames the device currently has buffered (its reported delay).
    pub device_frames: i64,
    /// When the telemetry trio above was last refreshed.
    pub updated: Option<Instant>,

    /// Set while open attempts are failing; cleared on success.
    pub error_opening: bool,

    pub fade: FadePhase,
    pub cross_gain_in: i32,
    pub cross_gain_out: i32,
    /// Sample index of the outgoing track inside the ring while a
    /// cross-fade is active.
    pub cross_offset: Option<usize>,
    /// DoP frame marker alternation state, carried across batches.
    pub dop_marker: u8,

    pub ring: FrameRing,
    pub silence: SilenceSource,
}

impl OutputState {
    pub fn new(device: &str, buffer: u32, period: u32, ring_frames: usize) -> Self {
        Self {
            state: PlayerState::Off,
            device: device.to_string(),
            buffer,
            period,
            current_sample_rate: 44_100,
            encoding: Encoding::Pcm,
            invert: false,
            gain_l: FIXED_ONE,
            gain_r: FIXED_ONE,
            start_frames: 0,
            frames_played: 0,
            frames_played_snapshot: 0,
            device_frames: 0,
            updated: None,
            error_opening: false,
            fade: FadePhase::Inactive,
            cross_gain_in: FIXED_ONE,
            cross_gain_out: 0,
            cross_offset: None,
            dop_marker: 0x05,
            ring: FrameRing::new(ring_frames),
            silence: SilenceSource::new(),
        }
    }

    /// Create a shared, mutex-protected state instance.
    pub fn shared(device: &str, buffer: u32, period: u32, ring_frames: usize) -> Arc<Mutex<Self>> {
        Arc::new(Mutex::new(Self::new(device, buffer, period, ring_frames)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_start_off_with_unity_gain() {
        let state = OutputState::new("default", 40, 4, 1024);
        assert!(state.state.is_off());
        assert_eq!((state.gain_l, state.gain_r), (FIXED_ONE, FIXED_ONE));
        assert!(!state.error_opening);
        assert_eq!(state.start_frames, 0);
    }
}
