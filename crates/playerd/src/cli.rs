use std::path::PathBuf;

use anyhow::{anyhow, Result};
use clap::Parser;

use alsa_output::types::{Encoding, SampleFormat};

use crate::config::{MixerConfig, PlayerConfig};

#[derive(Parser, Debug)]
#[command(name = "playerd", version)]
pub struct Args {
    /// ALSA output device
    #[arg(long, default_value = "default")]
    pub device: String,

    /// List output devices and exit
    #[arg(long)]
    pub list_devices: bool,

    /// List hardware volume controls for the output device and exit
    #[arg(long)]
    pub list_mixers: bool,

    /// Buffer size: milliseconds below 500, frames otherwise
    #[arg(long, default_value_t = 40)]
    pub buffer: u32,

    /// Period: count below 50, size in frames otherwise
    #[arg(long, default_value_t = 4)]
    pub period: u32,

    /// Fix the sample format (32, 24, 24_3, 16) instead of negotiating
    #[arg(long)]
    pub format: Option<String>,

    /// Stream encoding: pcm, dop, dop24, dop24_3, dsd_u8, dsd_u16le,
    /// dsd_u16be, dsd_u32le, dsd_u32be
    #[arg(long)]
    pub encoding: Option<String>,

    /// Invert bitstream polarity (native DSD devices that expect it)
    #[arg(long)]
    pub invert: bool,

    /// Use buffered writes instead of direct (mmap) access
    #[arg(long)]
    pub no_mmap: bool,

    /// Close and reopen the device once after opening
    #[arg(long)]
    pub reopen: bool,

    /// Hardware mixer element, "Name" or "Name,index"
    #[arg(long)]
    pub mixer: Option<String>,

    /// Control device for the mixer (default: the output device's card)
    #[arg(long)]
    pub mixer_device: Option<String>,

    /// Treat the mixer range as one dB per volume step
    #[arg(long)]
    pub mixer_linear: bool,

    /// Unmute the mixer to maximum once; volume stays in software
    #[arg(long)]
    pub unmute: bool,

    /// Map software volume through the renormalized decibel curve
    #[arg(long)]
    pub db_volume: bool,

    /// SCHED_FIFO priority for the output thread
    #[arg(long)]
    pub rt_priority: Option<u32>,

    /// Pin the output thread to the last CPU core
    #[arg(long)]
    pub pin_cpu: bool,

    /// Script invoked with "on"/"off" on amplifier power transitions
    #[arg(long)]
    pub power_script: Option<PathBuf>,

    /// Test tone sample rate in Hz
    #[arg(long, default_value_t = 44_100)]
    pub rate: u32,

    /// Test tone frequency in Hz
    #[arg(long, default_value_t = 440.0)]
    pub tone_hz: f64,

    /// Interpret volume commands as raw 16.16 gains
    #[arg(long)]
    pub raw_volume: bool,
}

/// Split a "Name" or "Name,index" mixer spec.
fn parse_mixer_spec(spec: &str) -> Result<(String, u32)> {
    match spec.rsplit_once(',') {
        Some((name, index)) if !name.is_empty() => {
            let index = index
                .parse()
                .map_err(|_| anyhow!("bad mixer index in {spec:?}"))?;
            Ok((name.to_string(), index))
        }
        _ if !spec.is_empty() => Ok((spec.to_string(), 0)),
        _ => Err(anyhow!("empty mixer name")),
    }
}

impl Args {
    pub fn player_config(&self) -> Result<PlayerConfig> {
        let format = match &self.format {
            Some(s) => Some(
                SampleFormat::parse_pcm(s).ok_or_else(|| anyhow!("unknown sample format {s:?}"))?,
            ),
            None => None,
        };

        let encoding = match &self.encoding {
            Some(s) => {
                Encoding::parse(s).ok_or_else(|| anyhow!("unknown encoding {s:?}"))?
            }
            None => Encoding::Pcm,
        };

        let mixer = match &self.mixer {
            Some(spec) => {
                let (name, index) = parse_mixer_spec(spec)?;
                Some(MixerConfig {
                    ctl: self.mixer_device.clone(),
                    name,
                    index,
                })
            }
            None => None,
        };

        Ok(PlayerConfig {
            device: self.device.clone(),
            buffer: self.buffer,
            period: self.period,
            format,
            encoding,
            invert: self.invert,
            mmap: !self.no_mmap,
            reopen: self.reopen,
            mixer,
            unmute: self.unmute,
            mixer_linear: self.mixer_linear,
            db_volume: self.db_volume,
            rt_priority: self.rt_priority,
            pin_cpu: self.pin_cpu,
            power_script: self.power_script.clone(),
            rate: self.rate,
            tone_hz: self.tone_hz,
            raw_volume: self.raw_volume,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mixer_spec_defaults_to_index_zero() {
        assert_eq!(parse_mixer_spec("PCM").unwrap(), ("PCM".to_string(), 0));
    }

    #[test]
    fn mixer_spec_takes_a_trailing_index() {
        assert_eq!(
            parse_mixer_spec("Digital,1").unwrap(),
            ("Digital".to_string(), 1)
        );
    }

    #[test]
    fn bad_mixer_specs_are_rejected() {
        assert!(parse_mixer_spec("").is_err());
        assert!(parse_mixer_spec("PCM,x").is_err());
    }

    #[test]
    fn format_flag_round_trips_through_config() {
        let args = Args::parse_from(["playerd", "--format", "24_3", "--no-mmap"]);
        let config = args.player_config().unwrap();
        assert_eq!(config.format, Some(SampleFormat::S24_3Le));
        assert!(!config.mmap);
    }

    #[test]
    fn encoding_flag_round_trips_through_config() {
        let args = Args::parse_from(["playerd", "--encoding", "dop", "--invert"]);
        let config = args.player_config().unwrap();
        assert_eq!(config.encoding, Encoding::Dop);
        assert!(config.invert);

        let args = Args::parse_from(["playerd"]);
        let config = args.player_config().unwrap();
        assert_eq!(config.encoding, Encoding::Pcm);
        assert!(!config.invert);

        let args = Args::parse_from(["playerd", "--encoding", "mqa"]);
        assert!(args.player_config().is_err());
    }
}
