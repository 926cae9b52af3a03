//! Sample formats and stream encodings negotiated with the playback device.
//!
//! Internally every frame is a stereo pair of left-justified `i32` samples;
//! the device-facing layout is chosen at open time and applied by the
//! scale-and-pack step in `writer`.

use alsa::pcm::Format;

/// Channels per frame. The engine is stereo end to end.
pub const CHANNELS: usize = 2;

/// Device sample layouts the session can negotiate, in descending
/// preference order for auto-selection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SampleFormat {
    S32Le,
    S24Le,
    S24_3Le,
    S16Le,
    DsdU8,
    DsdU16Le,
    DsdU16Be,
    DsdU32Le,
    DsdU32Be,
}

impl SampleFormat {
    /// Bytes one sample occupies in the device layout.
    pub fn bytes_per_sample(self) -> usize {
        match self {
            SampleFormat::S32Le | SampleFormat::DsdU32Le | SampleFormat::DsdU32Be => 4,
            SampleFormat::S24Le => 4,
            SampleFormat::S24_3Le => 3,
            SampleFormat::S16Le | SampleFormat::DsdU16Le | SampleFormat::DsdU16Be => 2,
            SampleFormat::DsdU8 => 1,
        }
    }

    /// Bytes one stereo frame occupies in the device layout.
    pub fn bytes_per_frame(self) -> usize {
        self.bytes_per_sample() * CHANNELS
    }

    /// The matching ALSA format constant.
    pub fn to_alsa(self) -> Format {
        match self {
            SampleFormat::S32Le => Format::S32LE,
            SampleFormat::S24Le => Format::S24LE,
            SampleFormat::S24_3Le => Format::S243LE,
            SampleFormat::S16Le => Format::S16LE,
            SampleFormat::DsdU8 => Format::DSDU8,
            SampleFormat::DsdU16Le => Format::DSDU16LE,
            SampleFormat::DsdU16Be => Format::DSDU16BE,
            SampleFormat::DsdU32Le => Format::DSDU32LE,
            SampleFormat::DsdU32Be => Format::DSDU32BE,
        }
    }

    /// Parse a user-supplied fixed PCM format ("32", "24", "24_3", "16").
    pub fn parse_pcm(s: &str) -> Option<Self> {
        match s {
            "32" => Some(SampleFormat::S32Le),
            "24" => Some(SampleFormat::S24Le),
            "24_3" => Some(SampleFormat::S24_3Le),
            "16" => Some(SampleFormat::S16Le),
            _ => None,
        }
    }
}

/// How decoded audio is encapsulated on its way to the device.
///
/// `Pcm` is ordinary PCM in whatever layout the session negotiated. The
/// other variants carry a 1-bit bitstream either marker-wrapped inside a
/// PCM container (DoP) or as a native DSD device format.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Encoding {
    #[default]
    Pcm,
    Dop,
    DopS24Le,
    DopS24_3Le,
    DsdU8,
    DsdU16Le,
    DsdU16Be,
    DsdU32Le,
    DsdU32Be,
}

impl Encoding {
    /// Whether this encoding carries a bitstream rather than plain PCM.
    pub fn is_bitstream(self) -> bool {
        self != Encoding::Pcm
    }

    /// Whether the bitstream needs DoP frame markers injected.
    pub fn is_dop(self) -> bool {
        matches!(self, Encoding::Dop | Encoding::DopS24Le | Encoding::DopS24_3Le)
    }

    /// Whether the bitstream is a native DSD device format (polarity
    /// inversion applies here, marker injection does not).
    pub fn is_native_dsd(self) -> bool {
        self.is_bitstream() && !self.is_dop()
    }

    /// Parse a user-supplied encoding name.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pcm" => Some(Encoding::Pcm),
            "dop" => Some(Encoding::Dop),
            "dop24" => Some(Encoding::DopS24Le),
            "dop24_3" => Some(Encoding::DopS24_3Le),
            "dsd_u8" => Some(Encoding::DsdU8),
            "dsd_u16le" => Some(Encoding::DsdU16Le),
            "dsd_u16be" => Some(Encoding::DsdU16Be),
            "dsd_u32le" => Some(Encoding::DsdU32Le),
            "dsd_u32be" => Some(Encoding::DsdU32Be),
            _ => None,
        }
    }

    /// The device format this encoding requires, or `None` when the
    /// session is free to negotiate from the preference list.
    pub fn fixed_format(self) -> Option<SampleFormat> {
        match self {
            Encoding::Pcm | Encoding::Dop => None,
            Encoding::DopS24Le => Some(SampleFormat::S24Le),
            Encoding::DopS24_3Le => Some(SampleFormat::S24_3Le),
            Encoding::DsdU8 => Some(SampleFormat::DsdU8),
            Encoding::DsdU16Le => Some(SampleFormat::DsdU16Le),
            Encoding::DsdU16Be => Some(SampleFormat::DsdU16Be),
            Encoding::DsdU32Le => Some(SampleFormat::DsdU32Le),
            Encoding::DsdU32Be => Some(SampleFormat::DsdU32Be),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_shapes_match_sample_widths() {
        assert_eq!(SampleFormat::S32Le.bytes_per_frame(), 8);
        assert_eq!(SampleFormat::S24_3Le.bytes_per_frame(), 6);
        assert_eq!(SampleFormat::S16Le.bytes_per_frame(), 4);
        assert_eq!(SampleFormat::DsdU8.bytes_per_frame(), 2);
    }

    #[test]
    fn parse_pcm_accepts_known_widths_only() {
        assert_eq!(SampleFormat::parse_pcm("24_3"), Some(SampleFormat::S24_3Le));
        assert_eq!(SampleFormat::parse_pcm("8"), None);
    }

    #[test]
    fn encoding_names_parse() {
        assert_eq!(Encoding::parse("pcm"), Some(Encoding::Pcm));
        assert_eq!(Encoding::parse("dop24_3"), Some(Encoding::DopS24_3Le));
        assert_eq!(Encoding::parse("dsd_u32be"), Some(Encoding::DsdU32Be));
        assert_eq!(Encoding::parse("flac"), None);
    }

    #[test]
    fn dop_encodings_pin_their_container_format() {
        assert_eq!(Encoding::DopS24Le.fixed_format(), Some(SampleFormat::S24Le));
        assert_eq!(Encoding::Dop.fixed_format(), None);
        assert!(Encoding::Dop.is_dop());
        assert!(!Encoding::DsdU32Le.is_dop());
        assert!(Encoding::DsdU32Le.is_native_dsd());
        assert!(!Encoding::Pcm.is_bitstream());
    }
}
