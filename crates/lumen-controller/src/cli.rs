//! CLI command definitions and argument parsing

use std::io::{self, Write};
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use lumen_core::capabilities::{DeviceCapabilities, ServerCapabilities};
use lumen_core::formats::{AudioConfig, FormatOption};
use lumen_core::resolver::{resolve, stream_options, Resolution, StreamPreferences};
use lumen_core::types::{HostAddress, ServerInfo};
use lumen_core::SettingsStore;
use tracing::debug;

use crate::config::Config;
use crate::credentials::{CredentialError, SqliteCredentialStore};
use crate::output::{OutputFormat, OutputFormatter, SuccessMessage};
use crate::settings::JsonSettingsStore;
use crate::ExitCode;

/// Lumen - game-streaming client host tools
#[derive(Parser, Debug)]
#[command(name = "lumen")]
#[command(version, about = "Lumen - manage pairing state and preview stream settings")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Output format
    #[arg(long, default_value = "table", global = true)]
    pub output: OutputFormat,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Debug logging
    #[arg(long, global = true)]
    pub debug: bool,

    /// Config file path
    #[arg(long, global = true, env = "LUMEN_CONFIG")]
    pub config: Option<PathBuf>,

    /// Credentials database path
    #[arg(long, global = true)]
    pub credentials_db: Option<PathBuf>,
}

impl Cli {
    /// Execute the CLI command with a resolved configuration
    pub async fn execute_with_config(self, config: Config) -> anyhow::Result<ExitCode> {
        let formatter = OutputFormatter::new(self.output, self.verbose || config.output.verbose);

        match self.command {
            Commands::Identity(args) => args.execute(&config, &formatter).await,
            Commands::Certs(args) => args.execute(&config, &formatter).await,
            Commands::Last(args) => args.execute(&config, &formatter).await,
            Commands::Config(args) => args.execute(&config, &formatter, self.config).await,
            Commands::Options(args) => args.execute(&formatter),
            Commands::Resolve(args) => args.execute(&config, &formatter),
        }
    }
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Show the device identity
    Identity(IdentityArgs),
    /// Manage pinned server certificates
    Certs(CertsArgs),
    /// Show or clear the last-used connection
    Last(LastArgs),
    /// Manage the configuration file
    Config(ConfigArgs),
    /// List the stream options a server's capabilities allow
    Options(OptionsArgs),
    /// Preview the stream configuration for a server
    Resolve(ResolveArgs),
}

fn open_credentials(config: &Config) -> anyhow::Result<SqliteCredentialStore> {
    let path = config
        .credentials_path()
        .ok_or_else(|| anyhow::anyhow!("Could not determine credentials database path"))?;
    debug!(path = %path.display(), "opening credentials");
    Ok(SqliteCredentialStore::open(&path)?)
}

fn open_settings(config: &Config) -> anyhow::Result<JsonSettingsStore> {
    let path = config
        .settings_path()
        .ok_or_else(|| anyhow::anyhow!("Could not determine settings path"))?;
    Ok(JsonSettingsStore::new(path))
}

/// Ask for confirmation on stderr; anything but "y" aborts.
fn confirm(warning: &str) -> io::Result<bool> {
    eprintln!("WARNING: {warning}");
    eprint!("Are you sure you want to continue? [y/N] ");
    io::stderr().flush()?;

    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    Ok(input.trim().eq_ignore_ascii_case("y"))
}

/// Credentials are keyed by host name; accept `host:port` too.
fn host_key(input: &str) -> Result<String, String> {
    HostAddress::parse(input)
        .map(|address| address.host)
        .map_err(|e| e.status_text())
}

/// Arguments for the identity command
#[derive(Parser, Debug)]
pub struct IdentityArgs {
    #[command(subcommand)]
    pub action: IdentityAction,
}

/// Identity subcommands
#[derive(Subcommand, Debug)]
pub enum IdentityAction {
    /// Show the current identity
    Show,
}

impl IdentityArgs {
    pub async fn execute(
        self,
        config: &Config,
        formatter: &OutputFormatter,
    ) -> anyhow::Result<ExitCode> {
        let store = open_credentials(config)?;
        match self.action {
            IdentityAction::Show => {
                formatter.progress("Loading identity...");
                let identity = store.identity().await?;
                println!("{}", formatter.format_identity(identity.as_ref()));
                Ok(ExitCode::Success)
            }
        }
    }
}

/// Arguments for the certs command
#[derive(Parser, Debug)]
pub struct CertsArgs {
    #[command(subcommand)]
    pub action: CertsAction,
}

/// Certificate subcommands
#[derive(Subcommand, Debug)]
pub enum CertsAction {
    /// List paired hosts
    List,
    /// Show the certificate pinned for a host
    Show {
        /// Host, optionally with port
        host: String,
        /// Include the full DER encoding
        #[arg(long)]
        der: bool,
    },
    /// Forget the certificate for a host (re-pairing required)
    Remove {
        host: String,
        /// Skip confirmation
        #[arg(long)]
        force: bool,
    },
    /// Forget the device identity and every certificate
    Reset {
        /// Skip confirmation
        #[arg(long)]
        force: bool,
    },
    /// Export identity and certificates to a file
    Export {
        #[arg(long, short = 'f')]
        file: PathBuf,
    },
    /// Import identity and certificates from a file
    Import {
        #[arg(long, short = 'f')]
        file: PathBuf,
    },
}

impl CertsArgs {
    pub async fn execute(
        self,
        config: &Config,
        formatter: &OutputFormatter,
    ) -> anyhow::Result<ExitCode> {
        let store = open_credentials(config)?;

        match self.action {
            CertsAction::List => {
                formatter.progress("Loading certificates...");
                let certs = store.list().await?;
                println!("{}", formatter.format_certificates(&certs));
                Ok(ExitCode::Success)
            }
            CertsAction::Show { host, der } => {
                let host = match host_key(&host) {
                    Ok(host) => host,
                    Err(msg) => {
                        formatter.error(&msg);
                        return Ok(ExitCode::InvalidInput);
                    }
                };
                match store.get(&host).await? {
                    Some(cert) => {
                        println!("{}", formatter.format_certificate_detail(&cert, der));
                        Ok(ExitCode::Success)
                    }
                    None => {
                        formatter.error(&format!("Not paired with {host}"));
                        Ok(ExitCode::NotPaired)
                    }
                }
            }
            CertsAction::Remove { host, force } => {
                let host = match host_key(&host) {
                    Ok(host) => host,
                    Err(msg) => {
                        formatter.error(&msg);
                        return Ok(ExitCode::InvalidInput);
                    }
                };
                if store.get(&host).await?.is_none() {
                    formatter.error(&format!("Not paired with {host}"));
                    return Ok(ExitCode::NotPaired);
                }
                if !force
                    && !confirm(&format!(
                        "This forgets the certificate for '{host}'. You will need to pair again."
                    ))?
                {
                    eprintln!("Aborted.");
                    return Ok(ExitCode::Success);
                }

                match store.remove(&host).await {
                    Ok(()) => {}
                    Err(CredentialError::NotFound(_)) => return Ok(ExitCode::NotPaired),
                    Err(e) => return Err(e.into()),
                }
                formatter.success(&format!("Removed pairing for {host}"));
                if formatter.format() == OutputFormat::Json {
                    let message = SuccessMessage::new(format!("removed {host}"));
                    println!("{}", formatter.format_success(&message, "certs remove"));
                }
                Ok(ExitCode::Success)
            }
            CertsAction::Reset { force } => {
                if !force
                    && !confirm(
                        "This deletes the device identity and ALL pinned certificates. \
                         Every host will need to be paired again.",
                    )?
                {
                    eprintln!("Aborted.");
                    return Ok(ExitCode::Success);
                }
                store.reset().await?;
                formatter.success("Pairing state reset");
                if formatter.format() == OutputFormat::Json {
                    let message = SuccessMessage::new("reset");
                    println!("{}", formatter.format_success(&message, "certs reset"));
                }
                Ok(ExitCode::Success)
            }
            CertsAction::Export { file } => {
                formatter.progress(&format!("Exporting to {}...", file.display()));
                let count = store.export(&file).await?;
                formatter.success(&format!("Exported {count} certificates to {}", file.display()));
                Ok(ExitCode::Success)
            }
            CertsAction::Import { file } => {
                if !file.exists() {
                    formatter.error(&format!("File not found: {}", file.display()));
                    return Ok(ExitCode::InvalidInput);
                }
                match store.import(&file).await {
                    Ok(count) => {
                        formatter.success(&format!(
                            "Imported {count} certificates from {}",
                            file.display()
                        ));
                        Ok(ExitCode::Success)
                    }
                    Err(e @ (CredentialError::Corrupt(_) | CredentialError::Serialization(_))) => {
                        formatter.error(&e.to_string());
                        Ok(ExitCode::InvalidInput)
                    }
                    Err(e) => Err(e.into()),
                }
            }
        }
    }
}

/// Arguments for the last command
#[derive(Parser, Debug)]
pub struct LastArgs {
    /// Forget the last connection
    #[arg(long)]
    pub clear: bool,
}

impl LastArgs {
    pub async fn execute(
        self,
        config: &Config,
        formatter: &OutputFormatter,
    ) -> anyhow::Result<ExitCode> {
        let store = open_settings(config)?;
        if self.clear {
            store.clear_last_connection().await?;
            formatter.success("Last connection cleared");
            return Ok(ExitCode::Success);
        }
        let last = store.last_connection().await?;
        println!("{}", formatter.format_last_connection(last.as_ref()));
        Ok(ExitCode::Success)
    }
}

/// Arguments for the config command
#[derive(Parser, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub action: ConfigAction,
}

/// Config subcommands
#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Write a commented sample configuration
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Print the effective configuration
    Show,
    /// Print the configuration file path
    Path,
}

impl ConfigArgs {
    pub async fn execute(
        self,
        config: &Config,
        formatter: &OutputFormatter,
        custom_path: Option<PathBuf>,
    ) -> anyhow::Result<ExitCode> {
        let path = custom_path.or_else(Config::default_path);

        match self.action {
            ConfigAction::Init { force } => {
                let path =
                    path.ok_or_else(|| anyhow::anyhow!("Could not determine config path"))?;
                if path.exists() && !force {
                    formatter.error(&format!(
                        "{} already exists (use --force to overwrite)",
                        path.display()
                    ));
                    return Ok(ExitCode::InvalidInput);
                }
                if let Some(parent) = path.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                tokio::fs::write(&path, Config::sample_toml()).await?;
                formatter.success(&format!("Wrote {}", path.display()));
                Ok(ExitCode::Success)
            }
            ConfigAction::Show => {
                match formatter.format() {
                    OutputFormat::Table => print!("{}", toml::to_string_pretty(config)?),
                    OutputFormat::Json => println!("{}", formatter.format_success(config, "config show")),
                    OutputFormat::Quiet => {}
                }
                Ok(ExitCode::Success)
            }
            ConfigAction::Path => {
                match path {
                    Some(path) => println!("{}", path.display()),
                    None => formatter.warning("No configuration directory on this platform"),
                }
                Ok(ExitCode::Success)
            }
        }
    }
}

/// Server capability flags, as reported in the server info response
#[derive(Args, Debug, Clone, Default)]
pub struct ServerArgs {
    /// ServerCodecModeSupport bitmask (decimal or 0x-prefixed hex)
    #[arg(long)]
    pub codec_support: Option<String>,

    /// MaxLumaPixelsH264
    #[arg(long)]
    pub max_luma_h264: Option<u64>,

    /// MaxLumaPixelsHEVC
    #[arg(long)]
    pub max_luma_hevc: Option<u64>,

    /// Supports4K (1/0/true/false); inferred from luma limits when absent
    #[arg(long)]
    pub supports_4k: Option<String>,
}

impl ServerArgs {
    fn server_info(&self) -> ServerInfo {
        let mut info = ServerInfo::new();
        if let Some(bits) = &self.codec_support {
            info.insert("ServerCodecModeSupport", bits.as_str());
        }
        if let Some(max) = self.max_luma_h264 {
            info.insert("MaxLumaPixelsH264", max.to_string());
        }
        if let Some(max) = self.max_luma_hevc {
            info.insert("MaxLumaPixelsHEVC", max.to_string());
        }
        if let Some(value) = &self.supports_4k {
            info.insert("Supports4K", value.as_str());
        }
        info
    }

    pub fn capabilities(&self) -> Result<ServerCapabilities, String> {
        ServerCapabilities::from_server_info(&self.server_info()).map_err(|e| e.to_string())
    }
}

/// Local decoder capability flags
#[derive(Args, Debug, Clone, Default)]
pub struct DeviceArgs {
    /// Decoder capability bits (decimal or 0x-prefixed hex)
    #[arg(long)]
    pub decoder_caps: Option<String>,

    /// The display cannot present HDR
    #[arg(long)]
    pub no_hdr_display: bool,
}

impl DeviceArgs {
    pub fn capabilities(&self) -> Result<DeviceCapabilities, String> {
        let mut device = DeviceCapabilities::default();
        if let Some(raw) = &self.decoder_caps {
            let raw = raw.trim();
            let bits = match raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
                Some(hex) => u32::from_str_radix(hex, 16),
                None => raw.parse(),
            }
            .map_err(|e| format!("Invalid decoder capabilities '{raw}': {e}"))?;
            device = device.with_decoder_bits(bits);
        }
        if self.no_hdr_display {
            device.hdr_display = false;
        }
        Ok(device)
    }
}

/// Arguments for the options command
#[derive(Parser, Debug)]
pub struct OptionsArgs {
    #[command(flatten)]
    pub server: ServerArgs,

    #[command(flatten)]
    pub device: DeviceArgs,
}

impl OptionsArgs {
    pub fn execute(self, formatter: &OutputFormatter) -> anyhow::Result<ExitCode> {
        let (server, device) = match (self.server.capabilities(), self.device.capabilities()) {
            (Ok(server), Ok(device)) => (server, device),
            (Err(msg), _) | (_, Err(msg)) => {
                formatter.error(&msg);
                return Ok(ExitCode::InvalidInput);
            }
        };
        let options = stream_options(&server);
        println!("{}", formatter.format_options(&server, &options, &device));
        Ok(ExitCode::Success)
    }
}

/// Arguments for the resolve command
#[derive(Parser, Debug)]
pub struct ResolveArgs {
    #[command(flatten)]
    pub server: ServerArgs,

    #[command(flatten)]
    pub device: DeviceArgs,

    /// Resolution, e.g. 1920x1080
    #[arg(long)]
    pub resolution: Option<Resolution>,

    #[arg(long)]
    pub fps: Option<u32>,

    /// Bitrate in kbps (0 = automatic)
    #[arg(long)]
    pub bitrate: Option<u32>,

    /// Video format: auto, h264, hevc, av1
    #[arg(long)]
    pub format: Option<FormatOption>,

    /// Request HDR
    #[arg(long)]
    pub hdr: bool,

    /// Request full color range
    #[arg(long)]
    pub full_range: bool,

    /// Audio layout: stereo, 5.1, 7.1
    #[arg(long)]
    pub audio: Option<AudioConfig>,

    /// Snap unsupported selections to the first offered option
    #[arg(long)]
    pub snap: bool,
}

impl ResolveArgs {
    /// Configured preferences with command-line selections applied
    pub fn preferences(&self, base: &StreamPreferences) -> StreamPreferences {
        let mut prefs = base.clone();
        if let Some(resolution) = self.resolution {
            prefs.resolution = resolution;
        }
        if let Some(fps) = self.fps {
            prefs.fps = fps;
        }
        if let Some(bitrate) = self.bitrate {
            prefs.bitrate_kbps = bitrate;
        }
        if let Some(format) = self.format {
            prefs.format = format;
        }
        if let Some(audio) = self.audio {
            prefs.audio = audio;
        }
        prefs.hdr |= self.hdr;
        prefs.full_range |= self.full_range;
        prefs
    }

    pub fn execute(self, config: &Config, formatter: &OutputFormatter) -> anyhow::Result<ExitCode> {
        let (server, device) = match (self.server.capabilities(), self.device.capabilities()) {
            (Ok(server), Ok(device)) => (server, device),
            (Err(msg), _) | (_, Err(msg)) => {
                formatter.error(&msg);
                return Ok(ExitCode::InvalidInput);
            }
        };

        let mut prefs = self.preferences(&config.stream);
        if self.snap {
            prefs = prefs.snap_to(&stream_options(&server));
        }

        match resolve(&prefs, &server, &device) {
            Ok(resolved) => {
                println!("{}", formatter.format_resolved(&resolved));
                Ok(ExitCode::Success)
            }
            Err(e) => {
                formatter.error(&e.status_text());
                Ok(ExitCode::from(&e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lumen_core::formats::CodecModeSupport;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("lumen").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_global_flags() {
        let cli = parse(&["--output", "json", "-v", "certs", "list"]);
        assert_eq!(cli.output, OutputFormat::Json);
        assert!(cli.verbose);
        assert!(matches!(
            cli.command,
            Commands::Certs(CertsArgs {
                action: CertsAction::List
            })
        ));
    }

    #[test]
    fn test_certs_remove_force() {
        let cli = parse(&["certs", "remove", "10.0.0.2", "--force"]);
        match cli.command {
            Commands::Certs(CertsArgs {
                action: CertsAction::Remove { host, force },
            }) => {
                assert_eq!(host, "10.0.0.2");
                assert!(force);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_host_key_strips_port() {
        assert_eq!(host_key("pc:48010").unwrap(), "pc");
        assert_eq!(host_key("[fe80::1]:47989").unwrap(), "fe80::1");
        assert!(host_key("  ").is_err());
    }

    #[test]
    fn test_resolve_arguments_parse_core_types() {
        let cli = parse(&[
            "resolve",
            "--resolution",
            "3840x2160",
            "--format",
            "hevc",
            "--audio",
            "5.1",
            "--hdr",
            "--codec-support",
            "0x20301",
        ]);
        let Commands::Resolve(args) = cli.command else {
            panic!("expected resolve");
        };

        let prefs = args.preferences(&StreamPreferences::default());
        assert_eq!(prefs.resolution, Resolution::R2160);
        assert_eq!(prefs.format, FormatOption::Hevc);
        assert_eq!(prefs.audio, AudioConfig::Surround51);
        assert!(prefs.hdr);
        assert_eq!(prefs.fps, 60);

        let server = args.server.capabilities().unwrap();
        assert!(server.codec_mode_support.contains(CodecModeSupport::HEVC_MAIN10));
    }

    #[test]
    fn test_invalid_format_is_rejected() {
        let result = Cli::try_parse_from(["lumen", "resolve", "--format", "vp9"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_server_args_reject_bad_codec_mask() {
        let args = ServerArgs {
            codec_support: Some("0xZZ".into()),
            ..Default::default()
        };
        assert!(args.capabilities().is_err());
    }

    #[test]
    fn test_device_args() {
        let args = DeviceArgs {
            decoder_caps: Some("0x04000003".into()),
            no_hdr_display: true,
        };
        let device = args.capabilities().unwrap();
        assert_eq!(device.decoder.slices_per_frame(), 4);
        assert!(!device.hdr_display);

        let bad = DeviceArgs {
            decoder_caps: Some("lots".into()),
            no_hdr_display: false,
        };
        assert!(bad.capabilities().is_err());
    }

    #[test]
    fn test_supports_4k_flag_controls_2160p() {
        let without = ServerArgs {
            max_luma_hevc: Some(8_847_360),
            supports_4k: Some("0".into()),
            ..Default::default()
        };
        let options = stream_options(&without.capabilities().unwrap());
        assert!(!options.resolutions.contains(&Resolution::R2160));

        let inferred = ServerArgs {
            max_luma_hevc: Some(8_847_360),
            ..Default::default()
        };
        let options = stream_options(&inferred.capabilities().unwrap());
        assert!(options.resolutions.contains(&Resolution::R2160));
    }
}
