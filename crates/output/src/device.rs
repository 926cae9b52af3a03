//! Playback device session: open, parameter negotiation, and thin
//! wrappers over the transfer primitives.
//!
//! Negotiation order is fixed: resampling policy, access mode, sample
//! format, channel count, period geometry, buffer geometry, then install.
//! A direct `hw:` device that rejects the sample rate is retried exactly
//! once through the `plughw:` resampling plugin.

use alsa::device_name::HintIter;
use alsa::pcm::{Access, Frames, HwParams, State, PCM};
use alsa::{Direction, ValueOr};
use anyhow::Context;

use crate::error::OpenError;
use crate::types::{Encoding, SampleFormat, CHANNELS};

/// Upper bound on accepted device name length.
pub const MAX_DEVICE_LEN: usize = 128;

/// Native formats tried in order when the encoding does not pin one.
pub const FORMAT_PREFERENCE: [SampleFormat; 4] = [
    SampleFormat::S32Le,
    SampleFormat::S24Le,
    SampleFormat::S24_3Le,
    SampleFormat::S16Le,
];

/// Everything the caller asks for when opening a device.
pub struct OpenRequest<'a> {
    pub device: &'a str,
    pub rate: u32,
    /// Below 500: milliseconds. Otherwise literal frames.
    pub buffer: u32,
    /// Below 50: period count. Otherwise a period size in frames.
    pub period: u32,
    pub encoding: Encoding,
    /// Forces a specific native format instead of the preference walk.
    pub format_hint: Option<SampleFormat>,
    pub mmap: bool,
}

/// What negotiation actually settled on.
#[derive(Clone, Copy, Debug)]
pub struct NegotiatedParams {
    pub format: SampleFormat,
    pub rate: u32,
    pub buffer_size: usize,
    pub period_size: usize,
    pub mmap: bool,
}

/// An open, configured playback device.
pub struct DeviceSession {
    pcm: PCM,
    params: NegotiatedParams,
    encoding: Encoding,
    /// Staging buffer for interleaved writes in non-native formats;
    /// absent when samples go to the device untranslated.
    write_buf: Option<Vec<u8>>,
    /// Consecutive unrecovered interleaved-write failures.
    write_failures: u32,
}

enum Negotiation {
    Done(NegotiatedParams),
    RateRejected(alsa::Error),
}

/// Derive the resampling-plugin name for a direct hardware device.
/// Returns `None` when the name is not eligible for the fallback.
fn plug_fallback(device: &str) -> Option<String> {
    device.strip_prefix("hw:").map(|rest| format!("plughw:{rest}"))
}

/// Control device name for a PCM device name. `hw:` and `plughw:` names
/// map to their card control; anything else is passed through unchanged.
pub fn ctl_for_device(device: &str) -> String {
    let hw = if device.starts_with("hw:") {
        Some(device)
    } else if device.starts_with("plughw:") {
        // Same card, minus the plug layer.
        Some(&device[4..])
    } else {
        None
    };
    match hw {
        Some(name) => match name.rfind(',') {
            Some(comma) => name[..comma].to_string(),
            None => name.to_string(),
        },
        None => device.to_string(),
    }
}

fn negotiate(pcm: &PCM, name: &str, req: &OpenRequest<'_>) -> Result<Negotiation, OpenError> {
    let err = |param: &'static str| move |source| OpenError::Negotiate { param, source };

    let hwp = HwParams::any(pcm).map_err(err("any"))?;
    let direct = name.starts_with("hw:");
    hwp.set_rate_resample(!direct).map_err(err("resample"))?;

    if let Err(source) = hwp.set_rate(req.rate, ValueOr::Nearest) {
        if direct {
            return Ok(Negotiation::RateRejected(source));
        }
        return Err(OpenError::Negotiate {
            param: "rate",
            source,
        });
    }

    let mut mmap = req.mmap;
    if mmap && hwp.set_access(Access::MMapInterleaved).is_err() {
        tracing::debug!(device = name, "no direct access support, using buffered writes");
        mmap = false;
    }
    if !mmap {
        hwp.set_access(Access::RWInterleaved).map_err(err("access"))?;
    }

    let fixed = req.encoding.fixed_format().or(req.format_hint);
    let format = match fixed {
        Some(f) => {
            hwp.set_format(f.to_alsa()).map_err(err("format"))?;
            f
        }
        None => FORMAT_PREFERENCE
            .iter()
            .copied()
            .find(|f| hwp.set_format(f.to_alsa()).is_ok())
            .ok_or(OpenError::FormatUnsupported)?,
    };

    hwp.set_channels(CHANNELS as u32).map_err(err("channels"))?;

    if req.period < 50 {
        hwp.set_periods(req.period, ValueOr::Nearest)
            .map_err(err("periods"))?;
    } else {
        hwp.set_period_size_near(req.period as Frames, ValueOr::Nearest)
            .map_err(err("period size"))?;
    }
    if req.buffer < 500 {
        hwp.set_buffer_time_near(req.buffer * 1000, ValueOr::Nearest)
            .map_err(err("buffer time"))?;
    } else {
        hwp.set_buffer_size_near(req.buffer as Frames)
            .map_err(err("buffer size"))?;
    }

    let period_size = hwp.get_period_size().map_err(err("period size"))?;
    let buffer_size = hwp.get_buffer_size().map_err(err("buffer size"))?;

    pcm.hw_params(&hwp).map_err(err("install"))?;

    Ok(Negotiation::Done(NegotiatedParams {
        format,
        rate: req.rate,
        buffer_size: buffer_size as usize,
        period_size: period_size as usize,
        mmap,
    }))
}

impl DeviceSession {
    /// Open and fully negotiate a playback device.
    pub fn open(req: &OpenRequest<'_>) -> Result<Self, OpenError> {
        if req.device.len() > MAX_DEVICE_LEN {
            return Err(OpenError::DeviceName(req.device.to_string()));
        }

        let mut name = req.device.to_string();
        loop {
            let pcm =
                PCM::new(&name, Direction::Playback, false).map_err(|source| OpenError::Open {
                    device: name.clone(),
                    source,
                })?;

            match negotiate(&pcm, &name, req)? {
                Negotiation::Done(params) => {
                    tracing::info!(
                        device = %name,
                        format = ?params.format,
                        rate_hz = params.rate,
                        buffer_frames = params.buffer_size,
                        period_frames = params.period_size,
                        mmap = params.mmap,
                        "playback device opened"
                    );

                    // Translated writes need a staging buffer; direct
                    // access and native 32-bit writes do not.
                    let write_buf = if !params.mmap && params.format != SampleFormat::S32Le {
                        let bytes = params.buffer_size * params.format.bytes_per_frame();
                        let mut buf: Vec<u8> = Vec::new();
                        buf.try_reserve_exact(bytes)
                            .map_err(|_| OpenError::Alloc { bytes })?;
                        buf.resize(bytes, 0);
                        Some(buf)
                    } else {
                        None
                    };

                    return Ok(Self {
                        pcm,
                        params,
                        encoding: req.encoding,
                        write_buf,
                        write_failures: 0,
                    });
                }
                Negotiation::RateRejected(source) => match plug_fallback(&name) {
                    Some(plug) => {
                        tracing::info!(
                            device = %name,
                            fallback = %plug,
                            rate_hz = req.rate,
                            "rate rejected, retrying through resampling plugin"
                        );
                        name = plug;
                    }
                    None => {
                        return Err(OpenError::Negotiate {
                            param: "rate",
                            source,
                        });
                    }
                },
            }
        }
    }

    pub fn params(&self) -> &NegotiatedParams {
        &self.params
    }

    /// The stream shape this session was opened for.
    pub fn stream_shape(&self) -> (u32, Encoding) {
        (self.params.rate, self.encoding)
    }

    pub fn pcm_state(&self) -> State {
        self.pcm.state()
    }

    pub fn recover(&self, errno: i32, quiet: bool) -> Result<(), alsa::Error> {
        self.pcm.recover(errno, quiet)
    }

    pub fn avail(&self) -> Result<Frames, alsa::Error> {
        self.pcm.avail_update()
    }

    pub fn delay(&self) -> Result<Frames, alsa::Error> {
        self.pcm.delay()
    }

    pub fn start_transfer(&self) -> Result<(), alsa::Error> {
        self.pcm.start()
    }

    /// Wait for the device to accept more frames; `Ok(false)` is a timeout.
    pub fn wait(&self, timeout_ms: u32) -> Result<bool, alsa::Error> {
        self.pcm.wait(Some(timeout_ms))
    }

    /// Direct access transfer. `fill` receives the granted byte region,
    /// which may cover fewer frames than `max_frames`, and returns the
    /// frame count it filled. Returns the committed frame count.
    pub fn mmap_write<F>(&self, max_frames: usize, fill: F) -> Result<usize, alsa::Error>
    where
        F: FnMut(&mut [u8]) -> usize,
    {
        self.pcm.io_bytes().mmap(max_frames, fill)
    }

    /// Interleaved write of native 32-bit samples; returns frames written.
    pub fn write_samples(&self, buf: &[i32]) -> Result<usize, alsa::Error> {
        self.pcm.io_i32()?.writei(buf)
    }

    /// Interleaved write through the staging buffer. `fill` packs the
    /// device-format bytes for `frames` frames; returns frames written.
    pub fn write_translated<F>(&mut self, frames: usize, fill: F) -> Result<usize, alsa::Error>
    where
        F: FnOnce(&mut [u8]),
    {
        let bytes = frames * self.params.format.bytes_per_frame();
        let pcm = &self.pcm;
        let buf = match self.write_buf.as_mut() {
            Some(b) => &mut b[..bytes],
            None => return Err(alsa::Error::new("writei", libc::EINVAL)),
        };
        fill(buf);
        pcm.io_bytes().writei(buf)
    }

    /// Count a failed interleaved write that recovery could not repair.
    pub fn record_write_failure(&mut self) -> u32 {
        self.write_failures += 1;
        self.write_failures
    }

    pub fn reset_write_failures(&mut self) {
        self.write_failures = 0;
    }
}

/// Cheap availability check used while waiting for a device to appear.
pub fn probe(device: &str) -> bool {
    PCM::new(device, Direction::Playback, false).is_ok()
}

/// Print the playback-capable PCM devices to stdout.
pub fn list_devices() -> anyhow::Result<()> {
    let hints = HintIter::new_str(None, "pcm").context("unable to enumerate pcm devices")?;
    println!("Output devices:");
    for hint in hints {
        if hint.direction == Some(Direction::Capture) {
            continue;
        }
        let Some(name) = hint.name else { continue };
        let desc = hint
            .desc
            .unwrap_or_default()
            .lines()
            .next()
            .unwrap_or("")
            .to_string();
        if desc.is_empty() {
            println!("  {name}");
        } else {
            println!("  {name} - {desc}");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ctl_name_drops_subdevice_for_hw_devices() {
        assert_eq!(ctl_for_device("hw:0,0"), "hw:0");
        assert_eq!(ctl_for_device("hw:CARD=DAC,DEV=0"), "hw:CARD=DAC");
        assert_eq!(ctl_for_device("hw:1"), "hw:1");
    }

    #[test]
    fn ctl_name_strips_plug_layer() {
        assert_eq!(ctl_for_device("plughw:0,0"), "hw:0");
        assert_eq!(ctl_for_device("plughw:CARD=DAC"), "hw:CARD=DAC");
    }

    #[test]
    fn ctl_name_passes_other_devices_through() {
        assert_eq!(ctl_for_device("default"), "default");
        assert_eq!(ctl_for_device("dmix:0,0"), "dmix:0,0");
    }

    #[test]
    fn plug_fallback_applies_to_direct_devices_only() {
        assert_eq!(plug_fallback("hw:0,0").as_deref(), Some("plughw:0,0"));
        assert_eq!(plug_fallback("default"), None);
        // The fallback result itself is not eligible again.
        assert_eq!(plug_fallback("plughw:0,0"), None);
    }

    #[test]
    fn oversized_device_name_is_rejected() {
        let name = "x".repeat(MAX_DEVICE_LEN + 1);
        let req = OpenRequest {
            device: &name,
            rate: 44_100,
            buffer: 40,
            period: 4,
            encoding: Encoding::Pcm,
            format_hint: None,
            mmap: true,
        };
        assert!(matches!(
            DeviceSession::open(&req),
            Err(OpenError::DeviceName(_))
        ));
    }

    #[test]
    fn format_preference_starts_wide_and_narrows() {
        assert_eq!(FORMAT_PREFERENCE[0], SampleFormat::S32Le);
        assert_eq!(FORMAT_PREFERENCE[3], SampleFormat::S16Le);
        for pair in FORMAT_PREFERENCE.windows(2) {
            assert!(pair[1].bytes_per_sample() <= pair[0].bytes_per_sample());
        }
    }
}
