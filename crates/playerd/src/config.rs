use std::path::PathBuf;

use alsa_output::types::{Encoding, SampleFormat};

/// Hardware mixer selection.
#[derive(Clone, Debug)]
pub struct MixerConfig {
    /// Control device; defaults to the output device's card control.
    pub ctl: Option<String>,
    pub name: String,
    pub index: u32,
}

/// Resolved daemon configuration.
#[derive(Clone, Debug)]
pub struct PlayerConfig {
    pub device: String,
    pub buffer: u32,
    pub period: u32,
    pub format: Option<SampleFormat>,
    pub encoding: Encoding,
    /// Invert bitstream polarity on native DSD devices.
    pub invert: bool,
    pub mmap: bool,
    pub reopen: bool,
    pub mixer: Option<MixerConfig>,
    /// Unmute the mixer to maximum once and keep volume in software.
    pub unmute: bool,
    pub mixer_linear: bool,
    /// Software volume through the renormalized decibel curve.
    pub db_volume: bool,
    pub rt_priority: Option<u32>,
    pub pin_cpu: bool,
    pub power_script: Option<PathBuf>,
    pub rate: u32,
    pub tone_hz: f64,
    /// Interpret volume commands as raw 16.16 gains.
    pub raw_volume: bool,
}
