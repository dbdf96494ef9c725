//! Property-based tests for lumen-controller
//!
//! These tests verify correctness properties using proptest.

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use lumen_core::formats::{AudioConfig, FormatOption};
    use lumen_core::resolver::{Resolution, StreamPreferences, FPS_OPTIONS};

    use crate::config::{CliOverrides, Config};
    use crate::output::{OutputFormat, OutputFormatter};
    use crate::ExitCode;

    fn output_format_strategy() -> impl Strategy<Value = String> {
        prop_oneof![
            Just("table".to_string()),
            Just("json".to_string()),
            Just("quiet".to_string()),
        ]
    }

    fn log_level_strategy() -> impl Strategy<Value = String> {
        prop_oneof![
            Just("error".to_string()),
            Just("warn".to_string()),
            Just("info".to_string()),
            Just("debug".to_string()),
            Just("trace".to_string()),
        ]
    }

    fn preferences_strategy() -> impl Strategy<Value = StreamPreferences> {
        (
            prop::sample::select(Resolution::CANDIDATES.to_vec()),
            prop::sample::select(FPS_OPTIONS.to_vec()),
            prop_oneof![Just(0u32), 500u32..150_000],
            prop::sample::select(vec![
                FormatOption::Auto,
                FormatOption::H264,
                FormatOption::Hevc,
                FormatOption::Av1,
            ]),
            any::<bool>(),
            any::<bool>(),
            prop::sample::select(vec![
                AudioConfig::Stereo,
                AudioConfig::Surround51,
                AudioConfig::Surround71,
            ]),
        )
            .prop_map(
                |(resolution, fps, bitrate_kbps, format, hdr, full_range, audio)| {
                    StreamPreferences {
                        resolution,
                        fps,
                        bitrate_kbps,
                        format,
                        hdr,
                        full_range,
                        audio,
                    }
                },
            )
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        /// CLI output_format override takes precedence over the config file
        #[test]
        fn test_config_override_output_format(
            config_format in output_format_strategy(),
            cli_format in output_format_strategy()
        ) {
            let mut config = Config::default();
            config.output.format = config_format;

            let overrides = CliOverrides {
                output_format: Some(cli_format.clone()),
                ..Default::default()
            };

            prop_assert_eq!(config.with_overrides(&overrides).output.format, cli_format);
        }

        /// --debug forces debug logging whatever the file says
        #[test]
        fn test_config_override_debug(config_level in log_level_strategy()) {
            let mut config = Config::default();
            config.logging.level = config_level;

            let overrides = CliOverrides {
                debug: Some(true),
                ..Default::default()
            };

            prop_assert_eq!(config.with_overrides(&overrides).logging.level, "debug");
        }

        /// Any valid configuration survives a TOML round trip
        #[test]
        fn test_config_toml_round_trip(
            stream in preferences_strategy(),
            format in output_format_strategy(),
            level in log_level_strategy(),
            probe in 1u64..600,
            pairing in 1u64..600
        ) {
            let mut config = Config::default();
            config.stream = stream;
            config.output.format = format;
            config.logging.level = level;
            config.connection.probe_timeout_seconds = probe;
            config.connection.pairing_timeout_seconds = pairing;

            let text = toml::to_string_pretty(&config).unwrap();
            let parsed: Config = toml::from_str(&text).unwrap();

            prop_assert!(parsed.validate().is_ok());
            prop_assert_eq!(parsed.stream, config.stream);
            prop_assert_eq!(parsed.output.format, config.output.format);
            prop_assert_eq!(parsed.logging.level, config.logging.level);
            prop_assert_eq!(parsed.connection.probe_timeout_seconds, probe);
            prop_assert_eq!(parsed.connection.pairing_timeout_seconds, pairing);
        }

        /// Error output carries the numeric code and its name in JSON mode
        #[test]
        fn test_error_output_carries_exit_code(
            code in prop::sample::select(vec![
                ExitCode::GeneralError,
                ExitCode::PairingRejected,
                ExitCode::Timeout,
                ExitCode::ConnectionFailed,
                ExitCode::InvalidInput,
                ExitCode::NotPaired,
            ]),
            message in "[a-zA-Z0-9 ]{1,40}"
        ) {
            let formatter = OutputFormatter::new(OutputFormat::Json, false);
            let output = formatter.format_error_with_code(&message, code);
            let value: serde_json::Value = serde_json::from_str(&output).unwrap();

            prop_assert_eq!(value["exit_code"].as_i64(), Some(code as i64));
            prop_assert_eq!(value["exit_code_name"].as_str(), Some(code.name()));
            prop_assert_eq!(value["error"].as_str(), Some(message.as_str()));
        }
    }
}
