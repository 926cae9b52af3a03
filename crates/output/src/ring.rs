//! Shared frame ring buffer between the producer and the output worker.
//!
//! Samples are interleaved stereo `i32`, left-justified. The writer side
//! (decoder/test source) appends frames; the output worker reads whole
//! contiguous runs, may mutate them in place (gain, cross-fade blend, DoP
//! markers), and then advances the read cursor by exactly the frame count
//! it committed to the device.

use crate::types::CHANNELS;

/// 16.16 fixed-point unity gain.
pub const FIXED_ONE: i32 = 0x10000;

/// Frames of silence available from [`SilenceSource`] per batch.
pub const MAX_SILENCE_FRAMES: usize = 8192;

/// Apply a 16.16 fixed-point gain to one sample.
#[inline]
pub fn apply_sample_gain(gain: i32, sample: i32) -> i32 {
    ((i64::from(gain) * i64::from(sample)) >> 16) as i32
}

/// Bounded ring of interleaved stereo samples.
pub struct FrameRing {
    buf: Vec<i32>,
    read: usize,
    write: usize,
    used: usize,
}

impl FrameRing {
    /// Create a ring holding up to `frames` stereo frames.
    pub fn new(frames: usize) -> Self {
        Self {
            buf: vec![0; frames.max(1) * CHANNELS],
            read: 0,
            write: 0,
            used: 0,
        }
    }

    pub fn capacity_frames(&self) -> usize {
        self.buf.len() / CHANNELS
    }

    /// Frames currently buffered.
    pub fn frames_used(&self) -> usize {
        self.used / CHANNELS
    }

    pub fn frames_free(&self) -> usize {
        (self.buf.len() - self.used) / CHANNELS
    }

    /// Frames readable without wrapping; one transfer batch never spans
    /// the wrap point.
    pub fn contiguous_frames(&self) -> usize {
        let run = (self.buf.len() - self.read).min(self.used);
        run / CHANNELS
    }

    /// Mutable view of the next `frames` frames at the read cursor.
    ///
    /// Callers must not request more than [`Self::contiguous_frames`].
    pub fn read_slice(&mut self, frames: usize) -> &mut [i32] {
        let n = frames.min(self.contiguous_frames()) * CHANNELS;
        &mut self.buf[self.read..self.read + n]
    }

    /// Consume `frames` frames previously obtained via [`Self::read_slice`].
    pub fn advance_read(&mut self, frames: usize) {
        let n = frames.min(self.frames_used()) * CHANNELS;
        self.read = (self.read + n) % self.buf.len();
        self.used -= n;
    }

    /// Append interleaved samples, returning how many frames fit.
    pub fn push_frames(&mut self, samples: &[i32]) -> usize {
        let want = samples.len() / CHANNELS;
        let fit = want.min(self.frames_free());
        let mut src = 0;
        let mut remaining = fit * CHANNELS;
        while remaining > 0 {
            let run = remaining.min(self.buf.len() - self.write);
            self.buf[self.write..self.write + run].copy_from_slice(&samples[src..src + run]);
            self.write = (self.write + run) % self.buf.len();
            src += run;
            remaining -= run;
        }
        self.used += fit * CHANNELS;
        fit
    }

    /// Drop all buffered audio (producer-side flush on track change).
    pub fn clear(&mut self) {
        self.read = 0;
        self.write = 0;
        self.used = 0;
        self.buf.fill(0);
    }

    /// Apply per-channel gain in place to the next `frames` frames.
    pub fn apply_gain(&mut self, frames: usize, gain_l: i32, gain_r: i32) {
        if gain_l == FIXED_ONE && gain_r == FIXED_ONE {
            return;
        }
        for chunk in self.read_slice(frames).chunks_exact_mut(CHANNELS) {
            chunk[0] = apply_sample_gain(gain_l, chunk[0]);
            chunk[1] = apply_sample_gain(gain_r, chunk[1]);
        }
    }

    /// Cross-fade blend: mix the outgoing audio at `cross_offset` (a
    /// sample index into this ring) into the live frames at the read
    /// cursor. Advances `cross_offset` past the blended region.
    ///
    /// Invoked only after the final batch size is known, since a direct
    /// access region grant can shrink the batch.
    pub fn blend_cross(
        &mut self,
        frames: usize,
        cross_gain_in: i32,
        cross_gain_out: i32,
        cross_offset: &mut usize,
    ) {
        let n = frames.min(self.contiguous_frames()) * CHANNELS;
        let len = self.buf.len();
        for i in 0..n {
            let out_sample = self.buf[(*cross_offset + i) % len];
            let live = &mut self.buf[self.read + i];
            *live = apply_sample_gain(cross_gain_in, *live)
                .saturating_add(apply_sample_gain(cross_gain_out, out_sample));
        }
        *cross_offset = (*cross_offset + n) % len;
    }
}

/// Fixed source buffers fed to the packing step when no live audio is
/// available. PCM silence is zeros; DSD silence is the 0x69 bit pattern.
pub struct SilenceSource {
    pcm: Vec<i32>,
    dsd: Vec<i32>,
}

impl SilenceSource {
    pub fn new() -> Self {
        Self {
            pcm: vec![0; MAX_SILENCE_FRAMES * CHANNELS],
            dsd: vec![0x6969_6969_u32 as i32; MAX_SILENCE_FRAMES * CHANNELS],
        }
    }

    /// Silence samples for the given batch; DoP marker injection mutates
    /// the buffer in place, so this hands out a fresh pattern each call.
    pub fn slice(&mut self, frames: usize, dsd: bool) -> &mut [i32] {
        let n = frames.min(MAX_SILENCE_FRAMES) * CHANNELS;
        if dsd {
            self.dsd[..n].fill(0x6969_6969_u32 as i32);
            &mut self.dsd[..n]
        } else {
            self.pcm[..n].fill(0);
            &mut self.pcm[..n]
        }
    }
}

impl Default for SilenceSource {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frames(ring: &mut FrameRing, n: usize) -> Vec<i32> {
        ring.read_slice(n).to_vec()
    }

    #[test]
    fn push_then_read_roundtrips_in_order() {
        let mut ring = FrameRing::new(4);
        assert_eq!(ring.push_frames(&[1, 2, 3, 4]), 2);
        assert_eq!(ring.frames_used(), 2);
        assert_eq!(frames(&mut ring, 2), vec![1, 2, 3, 4]);
        ring.advance_read(2);
        assert_eq!(ring.frames_used(), 0);
    }

    #[test]
    fn push_clamps_to_free_space() {
        let mut ring = FrameRing::new(2);
        assert_eq!(ring.push_frames(&[1, 1, 2, 2, 3, 3]), 2);
        assert_eq!(ring.frames_free(), 0);
        assert_eq!(ring.push_frames(&[9, 9]), 0);
    }

    #[test]
    fn contiguous_run_stops_at_wrap_point() {
        let mut ring = FrameRing::new(4);
        ring.push_frames(&[1, 1, 2, 2, 3, 3]);
        ring.advance_read(2);
        ring.push_frames(&[4, 4, 5, 5]);
        // read cursor sits at frame 2 of 4; one contiguous run of 2 left.
        assert_eq!(ring.frames_used(), 3);
        assert_eq!(ring.contiguous_frames(), 2);
        assert_eq!(frames(&mut ring, 2), vec![3, 3, 4, 4]);
        ring.advance_read(2);
        assert_eq!(ring.contiguous_frames(), 1);
        assert_eq!(frames(&mut ring, 1), vec![5, 5]);
    }

    #[test]
    fn gain_is_applied_per_channel_in_place() {
        let mut ring = FrameRing::new(2);
        ring.push_frames(&[0x10000, 0x10000]);
        ring.apply_gain(1, FIXED_ONE / 2, FIXED_ONE / 4);
        assert_eq!(frames(&mut ring, 1), vec![0x8000, 0x4000]);
    }

    #[test]
    fn unity_gain_leaves_samples_untouched() {
        let mut ring = FrameRing::new(2);
        ring.push_frames(&[123, -456]);
        ring.apply_gain(1, FIXED_ONE, FIXED_ONE);
        assert_eq!(frames(&mut ring, 1), vec![123, -456]);
    }

    #[test]
    fn cross_blend_mixes_outgoing_audio_and_advances_offset() {
        let mut ring = FrameRing::new(4);
        // Frames 0..2 are the outgoing track, frames 2..4 the incoming one.
        ring.push_frames(&[0x20000, 0x20000, 0x20000, 0x20000, 0x10000, 0x10000, 0x10000, 0x10000]);
        ring.advance_read(2);
        let mut cross = 0usize;
        ring.blend_cross(2, FIXED_ONE / 2, FIXED_ONE / 2, &mut cross);
        // 0.5 * incoming + 0.5 * outgoing = 0x8000 + 0x10000.
        assert_eq!(frames(&mut ring, 2), vec![0x18000; 4]);
        assert_eq!(cross, 4);
    }

    #[test]
    fn silence_source_hands_out_requested_pattern() {
        let mut silence = SilenceSource::new();
        assert!(silence.slice(4, false).iter().all(|&s| s == 0));
        assert!(
            silence
                .slice(4, true)
                .iter()
                .all(|&s| s as u32 == 0x6969_6969)
        );
        assert_eq!(silence.slice(MAX_SILENCE_FRAMES * 2, false).len(), MAX_SILENCE_FRAMES * 2);
    }
}
