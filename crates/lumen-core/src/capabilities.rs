//! Server and device capability models.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::errors::ControlError;
use crate::formats::{CodecModeSupport, VideoFormats};
use crate::types::ServerInfo;

/// Pixel count of 3840x2160.
pub const UHD_PIXELS: u64 = 3840 * 2160;

/// Capabilities a server advertises for one session.
///
/// Fetched fresh per session and never cached across restarts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerCapabilities {
    pub codec_mode_support: CodecModeSupport,
    /// Zero means the server did not report a limit.
    pub max_luma_pixels_h264: u64,
    /// Zero means the server did not report a limit.
    pub max_luma_pixels_hevc: u64,
    pub supports_4k: bool,
}

impl Default for ServerCapabilities {
    fn default() -> Self {
        Self {
            codec_mode_support: CodecModeSupport::empty(),
            max_luma_pixels_h264: 0,
            max_luma_pixels_hevc: 0,
            supports_4k: false,
        }
    }
}

impl ServerCapabilities {
    /// Decode capabilities from a server info response.
    ///
    /// Missing numeric fields default to zero. `Supports4K` is honoured when
    /// present; otherwise 4K support is inferred from the luma limits.
    pub fn from_server_info(info: &ServerInfo) -> Result<Self, ControlError> {
        let codec_bits = info.get_u64("ServerCodecModeSupport")?.unwrap_or(0);
        let codec_bits = u32::try_from(codec_bits).map_err(|_| {
            ControlError::MalformedResponse(format!("ServerCodecModeSupport={codec_bits}"))
        })?;
        let max_luma_pixels_h264 = info.get_u64("MaxLumaPixelsH264")?.unwrap_or(0);
        let max_luma_pixels_hevc = info.get_u64("MaxLumaPixelsHEVC")?.unwrap_or(0);

        let supports_4k = match info.get("Supports4K").map(str::trim) {
            Some("1") | Some("true") => true,
            Some("0") | Some("false") => false,
            Some(other) => {
                return Err(ControlError::MalformedResponse(format!("Supports4K={other}")))
            }
            None => max_luma_pixels_h264.max(max_luma_pixels_hevc) >= UHD_PIXELS,
        };

        Ok(Self {
            codec_mode_support: CodecModeSupport::from_bits_retain(codec_bits),
            max_luma_pixels_h264,
            max_luma_pixels_hevc,
            supports_4k,
        })
    }

    /// Largest luma pixel count the server can encode, zero if unreported.
    pub fn max_luma_pixels(&self) -> u64 {
        self.max_luma_pixels_h264.max(self.max_luma_pixels_hevc)
    }

    pub fn supports_hdr(&self) -> bool {
        self.codec_mode_support.supports_hdr()
    }

    pub fn offers_h264(&self) -> bool {
        self.codec_mode_support.is_unreported()
            || self.codec_mode_support.intersects(CodecModeSupport::ANY_H264)
    }

    pub fn offers_hevc(&self) -> bool {
        self.codec_mode_support.is_unreported()
            || self.codec_mode_support.intersects(CodecModeSupport::ANY_HEVC)
    }
}

bitflags! {
    /// Capability bits reported by the native video decoder.
    ///
    /// The top byte carries the preferred slice count per frame.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct DecoderCapabilities: u32 {
        const DIRECT_SUBMIT = 0x1;
        const RFI_AVC = 0x2;
        const RFI_HEVC = 0x4;
        const RFI_AV1 = 0x40;

        const _ = !0;
    }
}

impl DecoderCapabilities {
    pub fn slices_per_frame(self) -> u8 {
        ((self.bits() >> 24) & 0xFF) as u8
    }
}

/// What the local device can decode and display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceCapabilities {
    pub decoder: DecoderCapabilities,
    pub decodable_formats: VideoFormats,
    pub hdr_display: bool,
}

impl Default for DeviceCapabilities {
    fn default() -> Self {
        Self {
            decoder: DecoderCapabilities::empty(),
            decodable_formats: VideoFormats::H264
                | VideoFormats::H265
                | VideoFormats::H265_MAIN10
                | VideoFormats::AV1_MAIN8
                | VideoFormats::AV1_MAIN10,
            hdr_display: true,
        }
    }
}

impl DeviceCapabilities {
    pub fn with_decoder_bits(mut self, bits: u32) -> Self {
        self.decoder = DecoderCapabilities::from_bits_retain(bits);
        self
    }

    /// HDR needs an HDR display and at least one decodable 10-bit format.
    pub fn supports_hdr(&self) -> bool {
        self.hdr_display && self.decodable_formats.intersects(VideoFormats::MASK_10BIT)
    }

    /// One-line summary of the decoder capability bits.
    pub fn summary(&self) -> String {
        let caps = self.decoder;
        format!(
            "SlicesPerFrame={}, RFI_AVC={}, RFI_HEVC={}, RFI_AV1={}, DirectSubmit={}",
            caps.slices_per_frame(),
            caps.contains(DecoderCapabilities::RFI_AVC),
            caps.contains(DecoderCapabilities::RFI_HEVC),
            caps.contains(DecoderCapabilities::RFI_AV1),
            caps.contains(DecoderCapabilities::DIRECT_SUBMIT),
        )
    }
}
