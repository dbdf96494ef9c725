//! Video format, codec support, color and audio definitions.
//!
//! Bit values match what streaming servers advertise and what the
//! transport expects on stream start.

use std::fmt;
use std::str::FromStr;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::errors::SessionError;

bitflags! {
    /// Video formats the client offers to the server on stream start.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct VideoFormats: u32 {
        const H264 = 0x0001;
        const H264_HIGH8_444 = 0x0004;
        const H265 = 0x0100;
        const H265_MAIN10 = 0x0200;
        const H265_REXT8_444 = 0x0400;
        const H265_REXT10_444 = 0x0800;
        const AV1_MAIN8 = 0x1000;
        const AV1_MAIN10 = 0x2000;
        const AV1_HIGH8_444 = 0x4000;
        const AV1_HIGH10_444 = 0x8000;

        const MASK_H264 = Self::H264.bits() | Self::H264_HIGH8_444.bits();
        const MASK_H265 = Self::H265.bits()
            | Self::H265_MAIN10.bits()
            | Self::H265_REXT8_444.bits()
            | Self::H265_REXT10_444.bits();
        const MASK_AV1 = Self::AV1_MAIN8.bits()
            | Self::AV1_MAIN10.bits()
            | Self::AV1_HIGH8_444.bits()
            | Self::AV1_HIGH10_444.bits();
        const MASK_10BIT = Self::H265_MAIN10.bits()
            | Self::H265_REXT10_444.bits()
            | Self::AV1_MAIN10.bits()
            | Self::AV1_HIGH10_444.bits();
    }
}

impl VideoFormats {
    /// Add the 10-bit counterpart of every 8-bit base format present.
    pub fn with_ten_bit_counterparts(self) -> Self {
        let mut out = self;
        if self.contains(Self::H265) {
            out |= Self::H265_MAIN10;
        }
        if self.contains(Self::AV1_MAIN8) {
            out |= Self::AV1_MAIN10;
        }
        out
    }

    /// The single format the decoder is configured for.
    pub fn primary(self) -> Self {
        [
            Self::AV1_MAIN10,
            Self::AV1_MAIN8,
            Self::H265_MAIN10,
            Self::H265,
            Self::H264,
        ]
        .into_iter()
        .find(|f| self.contains(*f))
        .unwrap_or(Self::H264)
    }
}

bitflags! {
    /// Server codec mode support bitmask, as reported in server info.
    ///
    /// Unknown bits are retained so masks survive a round trip.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct CodecModeSupport: u32 {
        const H264 = 0x1;
        const H264_HIGH = 0x2;
        const H264_HIGH8_444 = 0x4;
        const HEVC = 0x100;
        const HEVC_MAIN10 = 0x200;
        const HEVC_REXT8_444 = 0x400;
        const HEVC_REXT10_444 = 0x800;
        const AV1_MAIN8 = 0x10000;
        const AV1_MAIN10 = 0x20000;
        const AV1_HIGH8_444 = 0x40000;
        const AV1_HIGH10_444 = 0x80000;

        const ANY_H264 = Self::H264.bits() | Self::H264_HIGH.bits();
        const ANY_HEVC = Self::HEVC.bits() | Self::HEVC_MAIN10.bits() | Self::HEVC_REXT8_444.bits();
        const HDR = Self::HEVC_MAIN10.bits() | Self::AV1_MAIN10.bits();

        const _ = !0;
    }
}

impl CodecModeSupport {
    /// Whether any HDR-capable (10-bit) codec mode is advertised.
    pub fn supports_hdr(self) -> bool {
        self.intersects(Self::HDR)
    }

    /// A zero mask means the server did not report codec support.
    pub fn is_unreported(self) -> bool {
        self.is_empty()
    }
}

/// Color space of the video stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum ColorSpace {
    Rec601 = 0,
    Rec709 = 1,
    Rec2020 = 2,
}

/// Quantization range of the video stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum ColorRange {
    Limited = 0,
    Full = 1,
}

impl ColorRange {
    pub fn from_full(full: bool) -> Self {
        if full {
            ColorRange::Full
        } else {
            ColorRange::Limited
        }
    }
}

/// User-facing codec choice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FormatOption {
    #[default]
    Auto,
    H264,
    Hevc,
    Av1,
}

impl FormatOption {
    /// Base (8-bit) formats offered for this choice.
    pub fn base_formats(self) -> VideoFormats {
        match self {
            FormatOption::Auto => VideoFormats::H264 | VideoFormats::H265,
            FormatOption::H264 => VideoFormats::H264,
            FormatOption::Hevc => VideoFormats::H265,
            FormatOption::Av1 => VideoFormats::AV1_MAIN8,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FormatOption::Auto => "auto",
            FormatOption::H264 => "h264",
            FormatOption::Hevc => "hevc",
            FormatOption::Av1 => "av1",
        }
    }
}

impl fmt::Display for FormatOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FormatOption {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(FormatOption::Auto),
            "h264" | "avc" => Ok(FormatOption::H264),
            "hevc" | "h265" => Ok(FormatOption::Hevc),
            "av1" => Ok(FormatOption::Av1),
            other => Err(SessionError::InvalidInput(format!(
                "unknown video format: {other}. Valid: auto, h264, hevc, av1"
            ))),
        }
    }
}

/// Audio channel layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AudioConfig {
    #[default]
    #[serde(rename = "stereo")]
    Stereo,
    #[serde(rename = "5.1")]
    Surround51,
    #[serde(rename = "7.1")]
    Surround71,
}

impl AudioConfig {
    pub fn channel_count(self) -> u32 {
        match self {
            AudioConfig::Stereo => 2,
            AudioConfig::Surround51 => 6,
            AudioConfig::Surround71 => 8,
        }
    }

    pub fn channel_mask(self) -> u32 {
        match self {
            AudioConfig::Stereo => 0x3,
            AudioConfig::Surround51 => 0x3F,
            AudioConfig::Surround71 => 0x63F,
        }
    }

    /// Packed value sent to the transport: mask, channel count, magic byte.
    pub fn to_wire(self) -> u32 {
        (self.channel_mask() << 16) | (self.channel_count() << 8) | 0xCA
    }
}

impl fmt::Display for AudioConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AudioConfig::Stereo => "stereo",
            AudioConfig::Surround51 => "5.1",
            AudioConfig::Surround71 => "7.1",
        })
    }
}

impl FromStr for AudioConfig {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stereo" | "2.0" => Ok(AudioConfig::Stereo),
            "5.1" => Ok(AudioConfig::Surround51),
            "7.1" => Ok(AudioConfig::Surround71),
            other => Err(SessionError::InvalidInput(format!(
                "unknown audio configuration: {other}. Valid: stereo, 5.1, 7.1"
            ))),
        }
    }
}
