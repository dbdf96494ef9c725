//! Stream parameter resolution.
//!
//! Combines user preferences, local device capability and server capability
//! into a concrete [`StreamConfiguration`]. Resolution is pure: the same
//! inputs always produce the same configuration and advisories.
//!
//! Capability mismatches never fail resolution. They downgrade the request
//! and are reported as [`Advisory`] values for the UI.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::capabilities::{DeviceCapabilities, ServerCapabilities};
use crate::errors::SessionError;
use crate::formats::{AudioConfig, ColorRange, ColorSpace, FormatOption, VideoFormats};

// ============================================================================
// Resolution
// ============================================================================

/// A video resolution in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const R360: Resolution = Resolution::new(640, 360);
    pub const R480: Resolution = Resolution::new(854, 480);
    pub const R720: Resolution = Resolution::new(1280, 720);
    pub const R1080: Resolution = Resolution::new(1920, 1080);
    pub const R1440: Resolution = Resolution::new(2560, 1440);
    pub const R2160: Resolution = Resolution::new(3840, 2160);

    /// Candidate resolutions offered to the user, smallest first.
    pub const CANDIDATES: [Resolution; 6] = [
        Self::R360,
        Self::R480,
        Self::R720,
        Self::R1080,
        Self::R1440,
        Self::R2160,
    ];

    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn pixels(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }
}

impl Default for Resolution {
    fn default() -> Self {
        Self::R720
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl FromStr for Resolution {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || SessionError::InvalidInput(format!("invalid resolution: {s}"));
        let (w, h) = s.trim().split_once(['x', 'X']).ok_or_else(invalid)?;
        let width = w.trim().parse::<u32>().map_err(|_| invalid())?;
        let height = h.trim().parse::<u32>().map_err(|_| invalid())?;
        Ok(Self::new(width, height))
    }
}

impl TryFrom<String> for Resolution {
    type Error = SessionError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Resolution> for String {
    fn from(value: Resolution) -> Self {
        value.to_string()
    }
}

/// Frame rates offered to the user.
pub const FPS_OPTIONS: [u32; 4] = [30, 60, 90, 120];

// ============================================================================
// Preferences and Configuration
// ============================================================================

/// What the user asked for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamPreferences {
    pub resolution: Resolution,
    pub fps: u32,
    /// Zero selects a bitrate from resolution and frame rate.
    pub bitrate_kbps: u32,
    pub format: FormatOption,
    pub hdr: bool,
    pub full_range: bool,
    pub audio: AudioConfig,
}

impl Default for StreamPreferences {
    fn default() -> Self {
        Self {
            resolution: Resolution::R720,
            fps: 60,
            bitrate_kbps: 0,
            format: FormatOption::Auto,
            hdr: false,
            full_range: false,
            audio: AudioConfig::Stereo,
        }
    }
}

impl StreamPreferences {
    pub fn validate(&self) -> Result<(), SessionError> {
        if self.resolution.width == 0 || self.resolution.height == 0 {
            return Err(SessionError::InvalidInput(format!(
                "resolution must be non-zero, got {}",
                self.resolution
            )));
        }
        if self.fps == 0 {
            return Err(SessionError::InvalidInput("fps must be greater than 0".into()));
        }
        Ok(())
    }

    /// Snap selections that are not offered to the first offered option.
    pub fn snap_to(&self, options: &StreamOptions) -> StreamPreferences {
        let mut snapped = self.clone();
        if !options.resolutions.contains(&snapped.resolution) {
            if let Some(first) = options.resolutions.first() {
                snapped.resolution = *first;
            }
        }
        if !options.fps.contains(&snapped.fps) {
            if let Some(first) = options.fps.first() {
                snapped.fps = *first;
            }
        }
        if !options.formats.contains(&snapped.format) {
            if let Some(first) = options.formats.first() {
                snapped.format = *first;
            }
        }
        snapped
    }
}

/// Concrete stream configuration handed to the transport.
///
/// Immutable once a session begins and discarded when it ends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamConfiguration {
    pub resolution: Resolution,
    pub fps: u32,
    pub bitrate_kbps: u32,
    pub video_formats: VideoFormats,
    pub audio: AudioConfig,
    pub color_space: ColorSpace,
    pub color_range: ColorRange,
    pub hdr: bool,
    /// Server-side optimal settings. Always off.
    pub sops_enabled: bool,
    /// Always zero for compatibility with older servers.
    pub client_refresh_rate_x100: u32,
}

impl StreamConfiguration {
    /// Parameters for configuring the local decoder.
    pub fn video_params(&self) -> VideoStreamParams {
        VideoStreamParams {
            width: self.resolution.width,
            height: self.resolution.height,
            fps: self.fps,
            format: self.video_formats.primary(),
            color_space: self.color_space,
            color_range: self.color_range,
            bit_depth: if self.hdr { 10 } else { 8 },
            hdr: self.hdr,
        }
    }
}

/// Decoder setup parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoStreamParams {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub format: VideoFormats,
    pub color_space: ColorSpace,
    pub color_range: ColorRange,
    pub bit_depth: u8,
    pub hdr: bool,
}

/// A non-fatal capability mismatch reported to the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Advisory {
    /// The server advertises no 10-bit codec mode.
    HdrUnsupportedByServer,
    /// The local display or decoder cannot present HDR.
    HdrUnsupportedByDevice,
    /// HDR was requested with a codec that has no 10-bit profile.
    HdrUnsupportedByFormat(FormatOption),
    /// None of the requested formats can be decoded locally.
    FormatUnsupportedByDevice(FormatOption),
}

impl fmt::Display for Advisory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Advisory::HdrUnsupportedByServer => {
                write!(f, "Your PC GPU does not support streaming HDR. The stream will be SDR.")
            }
            Advisory::HdrUnsupportedByDevice => {
                write!(f, "This headset cannot display HDR. The stream will be SDR.")
            }
            Advisory::HdrUnsupportedByFormat(format) => write!(
                f,
                "HDR is not available with {}. The stream will be SDR.",
                format.as_str().to_ascii_uppercase()
            ),
            Advisory::FormatUnsupportedByDevice(format) => write!(
                f,
                "This headset cannot decode {}. Falling back to H264.",
                format.as_str().to_ascii_uppercase()
            ),
        }
    }
}

impl From<Advisory> for SessionError {
    fn from(advisory: Advisory) -> Self {
        SessionError::CapabilityMismatch(advisory.to_string())
    }
}

/// Output of [`resolve`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedStream {
    pub config: StreamConfiguration,
    pub advisories: Vec<Advisory>,
}

// ============================================================================
// Resolution Logic
// ============================================================================

/// Resolve preferences against server and device capability.
pub fn resolve(
    prefs: &StreamPreferences,
    server: &ServerCapabilities,
    device: &DeviceCapabilities,
) -> Result<ResolvedStream, SessionError> {
    prefs.validate()?;

    let mut advisories = Vec::new();

    let mut base = prefs.format.base_formats() & device.decodable_formats;
    if base.is_empty() {
        advisories.push(Advisory::FormatUnsupportedByDevice(prefs.format));
        base = VideoFormats::H264;
    }

    let mut hdr = prefs.hdr;
    if hdr {
        let downgrade = if !server.supports_hdr() {
            Some(Advisory::HdrUnsupportedByServer)
        } else if !device.supports_hdr() {
            Some(Advisory::HdrUnsupportedByDevice)
        } else if base == VideoFormats::H264 {
            Some(Advisory::HdrUnsupportedByFormat(prefs.format))
        } else {
            None
        };
        if let Some(advisory) = downgrade {
            tracing::info!(%advisory, "downgrading stream to SDR");
            advisories.push(advisory);
            hdr = false;
        }
    }

    let video_formats = if hdr {
        (base.with_ten_bit_counterparts() & device.decodable_formats) | base
    } else {
        base - VideoFormats::MASK_10BIT
    };

    let bitrate_kbps = if prefs.bitrate_kbps > 0 {
        prefs.bitrate_kbps
    } else {
        default_bitrate_kbps(prefs.resolution, prefs.fps)
    };

    let config = StreamConfiguration {
        resolution: prefs.resolution,
        fps: prefs.fps,
        bitrate_kbps,
        video_formats,
        audio: prefs.audio,
        color_space: if hdr {
            ColorSpace::Rec2020
        } else {
            ColorSpace::Rec709
        },
        color_range: ColorRange::from_full(prefs.full_range),
        hdr,
        sops_enabled: false,
        client_refresh_rate_x100: 0,
    };

    Ok(ResolvedStream { config, advisories })
}

/// Default bitrate in kbps for a resolution and frame rate.
///
/// The resolution factor is interpolated across the candidate table; the
/// frame rate factor grows with the square root above 60 FPS.
pub fn default_bitrate_kbps(resolution: Resolution, fps: u32) -> u32 {
    const FACTORS: [f64; 6] = [1.0, 2.0, 5.0, 10.0, 20.0, 40.0];

    let pixels = resolution.pixels() as f64;
    let table: Vec<f64> = Resolution::CANDIDATES
        .iter()
        .map(|r| r.pixels() as f64)
        .collect();

    let mut resolution_factor = FACTORS[FACTORS.len() - 1];
    for (i, &px) in table.iter().enumerate() {
        if pixels <= px {
            resolution_factor = if i == 0 || pixels == px {
                FACTORS[i]
            } else {
                let span = (pixels - table[i - 1]) / (px - table[i - 1]);
                FACTORS[i - 1] + span * (FACTORS[i] - FACTORS[i - 1])
            };
            break;
        }
    }

    let fps = f64::from(fps);
    let frame_rate_factor = if fps <= 60.0 {
        fps
    } else {
        (fps / 60.0).sqrt() * 60.0
    } / 30.0;

    ((resolution_factor * frame_rate_factor).round() as u32) * 1000
}

// ============================================================================
// UI Option Filtering
// ============================================================================

/// Capability-derived option lists for display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamOptions {
    pub resolutions: Vec<Resolution>,
    pub fps: Vec<u32>,
    pub formats: Vec<FormatOption>,
}

pub fn stream_options(server: &ServerCapabilities) -> StreamOptions {
    StreamOptions {
        resolutions: resolution_options(server),
        fps: FPS_OPTIONS.to_vec(),
        formats: format_options(server),
    }
}

/// Candidate resolutions the server can encode.
///
/// A zero luma limit means unreported and filters nothing. 3840x2160 also
/// requires explicit 4K support. An empty result falls back to every
/// candidate.
pub fn resolution_options(server: &ServerCapabilities) -> Vec<Resolution> {
    let max_pixels = server.max_luma_pixels();
    let filtered: Vec<Resolution> = Resolution::CANDIDATES
        .iter()
        .copied()
        .filter(|r| max_pixels == 0 || r.pixels() <= max_pixels)
        .filter(|r| server.supports_4k || *r != Resolution::R2160)
        .collect();

    if filtered.is_empty() {
        Resolution::CANDIDATES.to_vec()
    } else {
        filtered
    }
}

/// Formats offered for selection. AV1 is always offered as a manual override.
pub fn format_options(server: &ServerCapabilities) -> Vec<FormatOption> {
    let mut formats = vec![FormatOption::Auto];
    if server.offers_h264() {
        formats.push(FormatOption::H264);
    }
    if server.offers_hevc() {
        formats.push(FormatOption::Hevc);
    }
    formats.push(FormatOption::Av1);
    formats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formats::CodecModeSupport;
    use proptest::prelude::*;

    fn server(mask: u32, luma: u64, supports_4k: bool) -> ServerCapabilities {
        ServerCapabilities {
            codec_mode_support: CodecModeSupport::from_bits_retain(mask),
            max_luma_pixels_h264: luma,
            max_luma_pixels_hevc: luma,
            supports_4k,
        }
    }

    #[test]
    fn test_hdr_downgrade_without_server_support() {
        let prefs = StreamPreferences {
            hdr: true,
            format: FormatOption::Hevc,
            ..Default::default()
        };
        let resolved =
            resolve(&prefs, &server(0x0103, 0, true), &DeviceCapabilities::default()).unwrap();

        assert!(!resolved.config.hdr);
        assert!(!resolved.config.video_formats.intersects(VideoFormats::MASK_10BIT));
        assert_eq!(resolved.config.color_space, ColorSpace::Rec709);
        assert_eq!(resolved.advisories, vec![Advisory::HdrUnsupportedByServer]);
    }

    #[test]
    fn test_hdr_kept_with_server_support() {
        let prefs = StreamPreferences {
            hdr: true,
            full_range: true,
            ..Default::default()
        };
        let resolved =
            resolve(&prefs, &server(0x0301, 0, true), &DeviceCapabilities::default()).unwrap();

        assert!(resolved.config.hdr);
        assert!(resolved.advisories.is_empty());
        assert_eq!(
            resolved.config.video_formats,
            VideoFormats::H264 | VideoFormats::H265 | VideoFormats::H265_MAIN10
        );
        assert_eq!(resolved.config.color_space, ColorSpace::Rec2020);
        assert_eq!(resolved.config.color_range, ColorRange::Full);
        assert_eq!(resolved.config.video_params().bit_depth, 10);
    }

    #[test]
    fn test_hdr_with_forced_h264_is_downgraded() {
        let prefs = StreamPreferences {
            hdr: true,
            format: FormatOption::H264,
            ..Default::default()
        };
        let resolved =
            resolve(&prefs, &server(0x0301, 0, true), &DeviceCapabilities::default()).unwrap();
        assert!(!resolved.config.hdr);
        assert_eq!(resolved.config.video_formats, VideoFormats::H264);
        assert_eq!(
            resolved.advisories,
            vec![Advisory::HdrUnsupportedByFormat(FormatOption::H264)]
        );
    }

    #[test]
    fn test_hdr_downgraded_by_device() {
        let device = DeviceCapabilities {
            hdr_display: false,
            ..Default::default()
        };
        let prefs = StreamPreferences {
            hdr: true,
            ..Default::default()
        };
        let resolved = resolve(&prefs, &server(0x20301, 0, true), &device).unwrap();
        assert!(!resolved.config.hdr);
        assert_eq!(resolved.advisories, vec![Advisory::HdrUnsupportedByDevice]);
    }

    #[test]
    fn test_undecodable_format_falls_back_to_h264() {
        let device = DeviceCapabilities {
            decodable_formats: VideoFormats::H264 | VideoFormats::H265,
            ..Default::default()
        };
        let prefs = StreamPreferences {
            format: FormatOption::Av1,
            ..Default::default()
        };
        let resolved = resolve(&prefs, &server(0x10001, 0, true), &device).unwrap();
        assert_eq!(resolved.config.video_formats, VideoFormats::H264);
        assert_eq!(
            resolved.advisories,
            vec![Advisory::FormatUnsupportedByDevice(FormatOption::Av1)]
        );
    }

    #[test]
    fn test_invalid_preferences_rejected() {
        let prefs = StreamPreferences {
            fps: 0,
            ..Default::default()
        };
        assert!(matches!(
            resolve(&prefs, &ServerCapabilities::default(), &DeviceCapabilities::default()),
            Err(SessionError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_fixed_flags() {
        let resolved = resolve(
            &StreamPreferences::default(),
            &ServerCapabilities::default(),
            &DeviceCapabilities::default(),
        )
        .unwrap();
        assert!(!resolved.config.sops_enabled);
        assert_eq!(resolved.config.client_refresh_rate_x100, 0);
        assert_eq!(resolved.config.bitrate_kbps, 10_000);
    }

    #[test]
    fn test_explicit_bitrate_wins() {
        let prefs = StreamPreferences {
            bitrate_kbps: 35_000,
            ..Default::default()
        };
        let resolved =
            resolve(&prefs, &ServerCapabilities::default(), &DeviceCapabilities::default())
                .unwrap();
        assert_eq!(resolved.config.bitrate_kbps, 35_000);
    }

    #[test]
    fn test_default_bitrate_table() {
        assert_eq!(default_bitrate_kbps(Resolution::R720, 60), 10_000);
        assert_eq!(default_bitrate_kbps(Resolution::R1080, 60), 20_000);
        assert_eq!(default_bitrate_kbps(Resolution::R1080, 30), 10_000);
        assert_eq!(default_bitrate_kbps(Resolution::R360, 30), 1_000);
        assert_eq!(default_bitrate_kbps(Resolution::R2160, 120), 113_000);
        assert_eq!(default_bitrate_kbps(Resolution::new(7680, 4320), 30), 40_000);
    }

    #[test]
    fn test_resolution_filter_fallback_when_nothing_fits() {
        let options = resolution_options(&server(0x3, 1, false));
        assert_eq!(options, Resolution::CANDIDATES.to_vec());
    }

    #[test]
    fn test_zero_luma_means_unlimited() {
        let options = resolution_options(&server(0x3, 0, true));
        assert_eq!(options, Resolution::CANDIDATES.to_vec());
        let no_4k = resolution_options(&server(0x3, 0, false));
        assert_eq!(no_4k.len(), 5);
        assert!(!no_4k.contains(&Resolution::R2160));
    }

    #[test]
    fn test_format_options_follow_mask() {
        assert_eq!(
            format_options(&server(0x3, 0, false)),
            vec![FormatOption::Auto, FormatOption::H264, FormatOption::Av1]
        );
        assert_eq!(
            format_options(&server(0x100, 0, false)),
            vec![FormatOption::Auto, FormatOption::Hevc, FormatOption::Av1]
        );
        assert_eq!(format_options(&server(0, 0, false)).len(), 4);
    }

    #[test]
    fn test_4k_hdr_request_against_1080p_sdr_server() {
        let caps = ServerCapabilities {
            codec_mode_support: CodecModeSupport::from_bits_retain(0x3),
            max_luma_pixels_h264: 2_073_600,
            max_luma_pixels_hevc: 2_073_600,
            supports_4k: false,
        };
        let prefs = StreamPreferences {
            resolution: Resolution::R2160,
            hdr: true,
            ..Default::default()
        };

        assert_eq!(
            resolution_options(&caps),
            vec![
                Resolution::R360,
                Resolution::R480,
                Resolution::R720,
                Resolution::R1080
            ]
        );

        let resolved = resolve(&prefs, &caps, &DeviceCapabilities::default()).unwrap();
        assert!(!resolved.config.hdr);
        assert_eq!(resolved.advisories, vec![Advisory::HdrUnsupportedByServer]);
        assert_eq!(
            resolved.advisories[0].to_string(),
            "Your PC GPU does not support streaming HDR. The stream will be SDR."
        );
    }

    #[test]
    fn test_snap_to_first_offered_option() {
        let caps = server(0x3, 2_073_600, false);
        let prefs = StreamPreferences {
            resolution: Resolution::R2160,
            format: FormatOption::Hevc,
            ..Default::default()
        };
        let snapped = prefs.snap_to(&stream_options(&caps));
        assert_eq!(snapped.resolution, Resolution::R360);
        assert_eq!(snapped.format, FormatOption::Auto);
        assert_eq!(snapped.fps, 60);
    }

    #[test]
    fn test_resolution_parse_and_display() {
        assert_eq!("2560x1440".parse::<Resolution>().unwrap(), Resolution::R1440);
        assert_eq!(Resolution::R1080.to_string(), "1920x1080");
        assert!("wide".parse::<Resolution>().is_err());
    }

    fn any_format() -> impl Strategy<Value = FormatOption> {
        prop_oneof![
            Just(FormatOption::Auto),
            Just(FormatOption::H264),
            Just(FormatOption::Hevc),
            Just(FormatOption::Av1),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        #[test]
        fn prop_resolution_options_never_empty(
            mask in any::<u32>(),
            h264 in 0u64..20_000_000,
            hevc in 0u64..20_000_000,
            supports_4k in any::<bool>(),
        ) {
            let caps = ServerCapabilities {
                codec_mode_support: CodecModeSupport::from_bits_retain(mask),
                max_luma_pixels_h264: h264,
                max_luma_pixels_hevc: hevc,
                supports_4k,
            };
            let options = resolution_options(&caps);
            prop_assert!(!options.is_empty());
            if !supports_4k && options.len() < Resolution::CANDIDATES.len() {
                prop_assert!(!options.contains(&Resolution::R2160));
            }
        }

        #[test]
        fn prop_hdr_requires_server_bits(
            mask in any::<u32>(),
            format in any_format(),
            hdr in any::<bool>(),
            full_range in any::<bool>(),
        ) {
            let caps = ServerCapabilities {
                codec_mode_support: CodecModeSupport::from_bits_retain(mask),
                ..Default::default()
            };
            let prefs = StreamPreferences { format, hdr, full_range, ..Default::default() };
            let resolved = resolve(&prefs, &caps, &DeviceCapabilities::default()).unwrap();

            if resolved.config.hdr {
                prop_assert!(mask & 0x20200 != 0);
                prop_assert_eq!(resolved.config.color_space, ColorSpace::Rec2020);
            } else {
                prop_assert!(!resolved.config.video_formats.intersects(VideoFormats::MASK_10BIT));
                prop_assert_eq!(resolved.config.color_space, ColorSpace::Rec709);
            }
            prop_assert_eq!(resolved.config.color_range, ColorRange::from_full(full_range));
            prop_assert!(resolved.advisories.len() <= 1);
            prop_assert_eq!(hdr && !resolved.config.hdr, resolved.advisories.len() == 1);
        }
    }
}
