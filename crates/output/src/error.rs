//! Error kinds for the device, transfer, and mixer boundaries.
//!
//! Raw ALSA return codes never cross a module boundary unmapped; every
//! native failure is wrapped into one of these discriminated kinds at the
//! call site where it occurs. None of them is fatal to the process; the
//! output worker retries, recovers, or tears the session down and reopens.

use thiserror::Error;

/// Failures while opening and negotiating a playback device.
#[derive(Debug, Error)]
pub enum OpenError {
    #[error("device name too long: {0}")]
    DeviceName(String),

    #[error("playback open failed for {device}: {source}")]
    Open { device: String, source: alsa::Error },

    #[error("{param} negotiation failed: {source}")]
    Negotiate {
        param: &'static str,
        source: alsa::Error,
    },

    /// No acceptable sample format; retried on the next cycle since
    /// device capabilities can change.
    #[error("device supports none of the requested sample formats")]
    FormatUnsupported,

    #[error("unable to allocate {bytes} byte packing buffer")]
    Alloc { bytes: usize },
}

/// Faults raised while transferring frames to an open device.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("mmap transfer failed: {0}")]
    Mmap(alsa::Error),

    #[error("mmap commit wrote {committed} of {written} frames")]
    ShortCommit { written: usize, committed: usize },

    /// Recovery exhausted or the device vanished; the session must be
    /// torn down and reopened from scratch.
    #[error("playback device lost")]
    DeviceLost,

    /// Transient fault already handed to the recovery primitive; the
    /// caller skips this batch and tries again.
    #[error("transfer fault: {0}")]
    Fault(alsa::Error),
}

/// Failures attaching to or driving a hardware mixer element.
#[derive(Debug, Error)]
pub enum MixerError {
    #[error("mixer attach failed for {ctl}: {source}")]
    Attach { ctl: String, source: alsa::Error },

    #[error("mixer element {name},{index} not found")]
    ElementNotFound { name: String, index: u32 },
}
