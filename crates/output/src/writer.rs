//! Frame writer: moves one batch of frames from the shared ring (or a
//! silence source) into an open device session.
//!
//! The internal representation is always interleaved stereo `i32`; the
//! final device layout is produced here by the scale-and-pack step.
//! Software gain, cross-fade blending, DoP marker injection and DSD
//! polarity inversion all happen on the way through, after the final
//! batch size is known.

use crate::device::DeviceSession;
use crate::error::TransferError;
use crate::ring::{apply_sample_gain, FIXED_ONE, MAX_SILENCE_FRAMES};
use crate::state::{FadePhase, OutputState, PlayerState};
use crate::types::{SampleFormat, CHANNELS};

/// Unrecovered interleaved-write failures tolerated before the session
/// is declared lost.
const WRITE_FAILURE_LIMIT: u32 = 10;

/// Pack `frames` interleaved `i32` frames into the device layout,
/// applying a 16.16 gain pair on the way. Bitstream formats are packed
/// by truncation and never scaled.
pub fn scale_and_pack(
    dst: &mut [u8],
    src: &[i32],
    frames: usize,
    gain_l: i32,
    gain_r: i32,
    format: SampleFormat,
) {
    let n = frames * CHANNELS;
    let unity = gain_l == FIXED_ONE && gain_r == FIXED_ONE;
    let gained = |i: usize| {
        let g = if i % 2 == 0 { gain_l } else { gain_r };
        apply_sample_gain(g, src[i])
    };

    match format {
        SampleFormat::S32Le => {
            for i in 0..n {
                let s = if unity { src[i] } else { gained(i) };
                dst[i * 4..i * 4 + 4].copy_from_slice(&s.to_le_bytes());
            }
        }
        SampleFormat::S24Le => {
            for i in 0..n {
                let s = if unity { src[i] } else { gained(i) } >> 8;
                dst[i * 4..i * 4 + 4].copy_from_slice(&s.to_le_bytes());
            }
        }
        SampleFormat::S24_3Le => {
            for i in 0..n {
                let s = if unity { src[i] } else { gained(i) } >> 8;
                let b = s.to_le_bytes();
                dst[i * 3..i * 3 + 3].copy_from_slice(&b[..3]);
            }
        }
        SampleFormat::S16Le => {
            for i in 0..n {
                let s = ((if unity { src[i] } else { gained(i) }) >> 16) as i16;
                dst[i * 2..i * 2 + 2].copy_from_slice(&s.to_le_bytes());
            }
        }
        SampleFormat::DsdU32Le => {
            for i in 0..n {
                dst[i * 4..i * 4 + 4].copy_from_slice(&(src[i] as u32).to_le_bytes());
            }
        }
        SampleFormat::DsdU32Be => {
            for i in 0..n {
                dst[i * 4..i * 4 + 4].copy_from_slice(&(src[i] as u32).to_be_bytes());
            }
        }
        SampleFormat::DsdU16Le => {
            for i in 0..n {
                let s = ((src[i] as u32) >> 16) as u16;
                dst[i * 2..i * 2 + 2].copy_from_slice(&s.to_le_bytes());
            }
        }
        SampleFormat::DsdU16Be => {
            for i in 0..n {
                let s = ((src[i] as u32) >> 16) as u16;
                dst[i * 2..i * 2 + 2].copy_from_slice(&s.to_be_bytes());
            }
        }
        SampleFormat::DsdU8 => {
            for i in 0..n {
                dst[i] = ((src[i] as u32) >> 24) as u8;
            }
        }
    }
}

/// Rewrite `frames` frames in place as DoP: the bitstream payload drops
/// into bits 8..24 and the alternating frame marker lands in the top
/// byte. Both channels of a frame carry the same marker; `marker` keeps
/// the alternation phase across batches.
pub fn update_dop(buf: &mut [i32], frames: usize, invert: bool, marker: &mut u8) {
    for frame in buf[..frames * CHANNELS].chunks_exact_mut(CHANNELS) {
        let scaled_marker = u32::from(*marker) << 24;
        for s in frame {
            let data = if invert { !(*s as u32) } else { *s as u32 };
            *s = (((data >> 8) & 0x00FF_FF00) | scaled_marker) as i32;
        }
        *marker = if *marker == 0x05 { 0xFA } else { 0x05 };
    }
}

/// Flip the polarity of a native DSD bitstream in place.
pub fn dsd_invert(buf: &mut [i32], frames: usize) {
    for s in &mut buf[..frames * CHANNELS] {
        *s = !*s;
    }
}

/// Startup-threshold promotion: buffering becomes running once the ring
/// holds `start_frames` frames.
fn promoted(state: PlayerState, frames_used: usize, start_frames: u64) -> PlayerState {
    if state == PlayerState::Buffering && frames_used as u64 >= start_frames {
        PlayerState::Running
    } else {
        state
    }
}

/// Mutate a live or silence source slice for its encoding: DoP marker
/// injection or native DSD inversion. Plain PCM passes untouched.
fn condition_source(
    src: &mut [i32],
    frames: usize,
    encoding: crate::types::Encoding,
    invert: bool,
    marker: &mut u8,
) {
    if encoding.is_dop() {
        update_dop(src, frames, invert, marker);
    } else if encoding.is_native_dsd() && invert {
        dsd_invert(src, frames);
    }
}

/// Transfer up to `requested` frames into the session. Returns the frame
/// count actually committed; `Ok(0)` means the caller should back off.
pub fn write_frames(
    session: &mut DeviceSession,
    out: &mut OutputState,
    requested: usize,
) -> Result<usize, TransferError> {
    out.state = promoted(out.state, out.ring.frames_used(), out.start_frames);

    let live = out.state == PlayerState::Running && out.ring.frames_used() > 0;
    let frames = if live {
        requested.min(out.ring.contiguous_frames())
    } else {
        requested.min(MAX_SILENCE_FRAMES)
    };
    if frames == 0 {
        return Ok(0);
    }

    let params = *session.params();
    let format = params.format;
    let frame_bytes = format.bytes_per_frame();
    let encoding = out.encoding;
    let bitstream = encoding.is_bitstream();
    let (gain_l, gain_r) = if live && !bitstream {
        (out.gain_l, out.gain_r)
    } else {
        (FIXED_ONE, FIXED_ONE)
    };

    let committed = if params.mmap {
        let mut produced = 0usize;
        let committed = session
            .mmap_write(frames, |dst: &mut [u8]| {
                // The granted region may be smaller than asked for.
                let n = (dst.len() / frame_bytes).min(frames);
                produced = n;
                if n == 0 {
                    return 0;
                }
                if live {
                    if out.fade == FadePhase::Cross {
                        if let Some(mut offset) = out.cross_offset {
                            out.ring
                                .blend_cross(n, out.cross_gain_in, out.cross_gain_out, &mut offset);
                            out.cross_offset = Some(offset);
                        }
                    }
                    let src = out.ring.read_slice(n);
                    condition_source(src, n, encoding, out.invert, &mut out.dop_marker);
                    scale_and_pack(&mut dst[..n * frame_bytes], src, n, gain_l, gain_r, format);
                } else {
                    let src = out.silence.slice(n, bitstream);
                    condition_source(src, n, encoding, out.invert, &mut out.dop_marker);
                    scale_and_pack(&mut dst[..n * frame_bytes], src, n, gain_l, gain_r, format);
                }
                n
            })
            .map_err(TransferError::Mmap)?;
        if committed != produced {
            return Err(TransferError::ShortCommit {
                written: produced,
                committed,
            });
        }
        committed
    } else {
        let n = frames;
        if live {
            if out.fade == FadePhase::Cross {
                if let Some(mut offset) = out.cross_offset {
                    out.ring
                        .blend_cross(n, out.cross_gain_in, out.cross_gain_out, &mut offset);
                    out.cross_offset = Some(offset);
                }
            }
            condition_source(
                out.ring.read_slice(n),
                n,
                encoding,
                out.invert,
                &mut out.dop_marker,
            );
        } else {
            condition_source(
                out.silence.slice(n, bitstream),
                n,
                encoding,
                out.invert,
                &mut out.dop_marker,
            );
        }

        let result = if format == SampleFormat::S32Le {
            if live {
                out.ring.apply_gain(n, gain_l, gain_r);
                session.write_samples(out.ring.read_slice(n))
            } else {
                session.write_samples(out.silence.slice(n, bitstream))
            }
        } else {
            let src: &[i32] = if live {
                out.ring.read_slice(n)
            } else {
                out.silence.slice(n, bitstream)
            };
            session.write_translated(n, |dst| {
                scale_and_pack(dst, src, n, gain_l, gain_r, format);
            })
        };

        match result {
            Ok(wrote) => {
                session.reset_write_failures();
                if wrote < n {
                    tracing::warn!(requested = n, wrote, "short interleaved write");
                }
                wrote
            }
            Err(e) => {
                tracing::warn!(error = %e, "interleaved write failed, recovering");
                if session.recover(e.errno(), true).is_err() {
                    if session.record_write_failure() >= WRITE_FAILURE_LIMIT {
                        return Err(TransferError::DeviceLost);
                    }
                }
                return Err(TransferError::Fault(e));
            }
        }
    };

    out.frames_played += committed as u64;
    if live {
        out.ring.advance_read(committed);
    }
    Ok(committed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn s32_pack_is_verbatim_at_unity() {
        let src = [0x0102_0304, -1];
        let mut dst = [0u8; 8];
        scale_and_pack(&mut dst, &src, 1, FIXED_ONE, FIXED_ONE, SampleFormat::S32Le);
        assert_eq!(&dst[..4], &0x0102_0304_i32.to_le_bytes());
        assert_eq!(&dst[4..], &(-1_i32).to_le_bytes());
    }

    #[test]
    fn gain_is_applied_per_channel_while_packing() {
        let src = [0x10000, 0x10000];
        let mut dst = [0u8; 8];
        scale_and_pack(&mut dst, &src, 1, FIXED_ONE / 2, FIXED_ONE / 4, SampleFormat::S32Le);
        assert_eq!(i32::from_le_bytes(dst[..4].try_into().unwrap()), 0x8000);
        assert_eq!(i32::from_le_bytes(dst[4..].try_into().unwrap()), 0x4000);
    }

    #[test]
    fn s24_pack_drops_the_low_byte() {
        let src = [0x1234_5678, 0x1234_5678];
        let mut dst = [0u8; 8];
        scale_and_pack(&mut dst, &src, 1, FIXED_ONE, FIXED_ONE, SampleFormat::S24Le);
        assert_eq!(i32::from_le_bytes(dst[..4].try_into().unwrap()), 0x0012_3456);
    }

    #[test]
    fn packed_24_bit_uses_three_bytes_little_endian() {
        let src = [0x1234_5678, 0x1234_5678];
        let mut dst = [0u8; 6];
        scale_and_pack(&mut dst, &src, 1, FIXED_ONE, FIXED_ONE, SampleFormat::S24_3Le);
        assert_eq!(&dst[..3], &[0x56, 0x34, 0x12]);
    }

    #[test]
    fn s16_pack_keeps_the_top_half() {
        let src = [0x1234_5678, -0x1234_5678];
        let mut dst = [0u8; 4];
        scale_and_pack(&mut dst, &src, 1, FIXED_ONE, FIXED_ONE, SampleFormat::S16Le);
        assert_eq!(i16::from_le_bytes(dst[..2].try_into().unwrap()), 0x1234);
        assert_eq!(i16::from_le_bytes(dst[2..].try_into().unwrap()), -0x1235);
    }

    #[test]
    fn dsd_packing_truncates_and_never_scales() {
        let src = [0x6969_6969_u32 as i32, 0x6969_6969_u32 as i32];
        let mut dst = [0u8; 2];
        // Half gain must be ignored for bitstream layouts.
        scale_and_pack(&mut dst, &src, 1, FIXED_ONE / 2, FIXED_ONE / 2, SampleFormat::DsdU8);
        assert_eq!(dst, [0x69, 0x69]);

        let mut wide = [0u8; 8];
        scale_and_pack(&mut wide, &src, 1, FIXED_ONE, FIXED_ONE, SampleFormat::DsdU32Be);
        assert_eq!(&wide[..4], &[0x69, 0x69, 0x69, 0x69]);
    }

    #[test]
    fn dop_markers_alternate_per_frame_and_persist_across_batches() {
        let mut buf = [0x1122_3344_u32 as i32; 4];
        let mut marker = 0x05u8;
        update_dop(&mut buf, 2, false, &mut marker);
        assert_eq!(buf[0] as u32, 0x0511_2200);
        assert_eq!(buf[0] as u32 >> 24, 0x05);
        assert_eq!(buf[1] as u32 >> 24, 0x05);
        assert_eq!(buf[2] as u32 >> 24, 0xFA);
        assert_eq!(buf[3] as u32 >> 24, 0xFA);
        // Next batch continues where this one left off.
        assert_eq!(marker, 0x05);
        let mut next = [0i32; 2];
        update_dop(&mut next, 1, false, &mut marker);
        assert_eq!(next[0] as u32 >> 24, 0x05);
        assert_eq!(marker, 0xFA);
    }

    #[test]
    fn dop_payload_lands_in_the_middle_sixteen_bits() {
        let mut buf = [0xABCD_0000_u32 as i32; 2];
        let mut marker = 0x05u8;
        update_dop(&mut buf, 1, false, &mut marker);
        assert_eq!(buf[0] as u32, 0x05AB_CD00);
    }

    #[test]
    fn dop_inversion_flips_the_payload_not_the_marker() {
        let mut buf = [0x0000_0000_i32; 2];
        let mut marker = 0x05u8;
        update_dop(&mut buf, 1, true, &mut marker);
        assert_eq!(buf[0] as u32, 0x05FF_FF00);
    }

    #[test]
    fn native_dsd_inversion_flips_every_bit() {
        let mut buf = [0x6969_6969_u32 as i32; 2];
        dsd_invert(&mut buf, 1);
        assert_eq!(buf[0] as u32, 0x9696_9696);
    }

    #[test]
    fn buffering_promotes_to_running_at_the_start_threshold() {
        assert_eq!(promoted(PlayerState::Buffering, 99, 100), PlayerState::Buffering);
        assert_eq!(promoted(PlayerState::Buffering, 100, 100), PlayerState::Running);
        assert_eq!(promoted(PlayerState::Stopped, 100, 100), PlayerState::Stopped);
        assert_eq!(promoted(PlayerState::Running, 0, 100), PlayerState::Running);
    }
}
