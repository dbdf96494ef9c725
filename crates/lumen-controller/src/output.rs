//! Output formatting for CLI results
//!
//! Three output formats are supported:
//! - Table: Human-readable tables (default)
//! - JSON: Structured JSON for scripting and automation
//! - Quiet: Minimal output, exit codes only

use std::str::FromStr;

use comfy_table::{presets::UTF8_FULL, Table};
use lumen_core::capabilities::{DeviceCapabilities, ServerCapabilities};
use lumen_core::resolver::{ResolvedStream, StreamOptions};
use lumen_core::types::{ConnectionParams, DeviceIdentity};
use serde::Serialize;

use crate::credentials::StoredCertificate;
use crate::ExitCode;

/// Output format options
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OutputFormat {
    #[default]
    Table,
    Json,
    Quiet,
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "table" => Ok(Self::Table),
            "json" => Ok(Self::Json),
            "quiet" => Ok(Self::Quiet),
            _ => Err(format!("Unknown output format: {s}")),
        }
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Table => write!(f, "table"),
            Self::Json => write!(f, "json"),
            Self::Quiet => write!(f, "quiet"),
        }
    }
}

/// Standard JSON response wrapper
#[derive(Serialize)]
pub struct JsonResponse<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// ISO 8601 timestamp
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
}

impl<T: Serialize> JsonResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            timestamp: chrono::Utc::now().to_rfc3339(),
            command: None,
        }
    }

    pub fn success_with_command(data: T, command: &str) -> Self {
        Self {
            command: Some(command.to_string()),
            ..Self::success(data)
        }
    }
}

impl JsonResponse<()> {
    pub fn error(message: &str) -> JsonResponse<()> {
        JsonResponse {
            success: false,
            data: None,
            error: Some(message.to_string()),
            timestamp: chrono::Utc::now().to_rfc3339(),
            command: None,
        }
    }
}

/// Formats output for different modes
pub struct OutputFormatter {
    format: OutputFormat,
    verbose: bool,
}

impl OutputFormatter {
    pub fn new(format: OutputFormat, verbose: bool) -> Self {
        Self { format, verbose }
    }

    pub fn format(&self) -> OutputFormat {
        self.format
    }

    pub fn is_quiet(&self) -> bool {
        self.format == OutputFormat::Quiet
    }

    /// Format the device identity, if one exists
    pub fn format_identity(&self, identity: Option<&DeviceIdentity>) -> String {
        match self.format {
            OutputFormat::Table => match identity {
                Some(identity) => {
                    let mut table = property_table();
                    table.add_row(vec!["Device ID", identity.as_str()]);
                    table.to_string()
                }
                None => "No device identity yet. One is created on first connection.".to_string(),
            },
            OutputFormat::Json => self.to_json_response(
                &IdentityOutput {
                    identity: identity.map(|i| i.as_str().to_string()),
                },
                "identity show",
            ),
            OutputFormat::Quiet => String::new(),
        }
    }

    /// Format pinned certificate list
    pub fn format_certificates(&self, certs: &[StoredCertificate]) -> String {
        match self.format {
            OutputFormat::Table => self.certificates_table(certs),
            OutputFormat::Json => self.to_json_response(
                &CertificatesOutput {
                    count: certs.len(),
                    certificates: certs.iter().map(|c| CertificateJson::from_stored(c, false)).collect(),
                },
                "certs list",
            ),
            OutputFormat::Quiet => String::new(),
        }
    }

    /// Format one pinned certificate
    pub fn format_certificate_detail(&self, cert: &StoredCertificate, show_der: bool) -> String {
        match self.format {
            OutputFormat::Table => {
                let mut table = property_table();
                table.add_row(vec!["Host", &cert.host]);
                table.add_row(vec!["SHA-256", &cert.fingerprint()]);
                table.add_row(vec!["Size", &format!("{} bytes", cert.certificate.der().len())]);
                table.add_row(vec!["Pinned At", &format_time(cert.pinned_at)]);
                if show_der {
                    table.add_row(vec!["DER", &hex::encode(cert.certificate.der())]);
                }
                table.to_string()
            }
            OutputFormat::Json => {
                self.to_json_response(&CertificateJson::from_stored(cert, show_der), "certs show")
            }
            OutputFormat::Quiet => String::new(),
        }
    }

    /// Format the last-used connection
    pub fn format_last_connection(&self, params: Option<&ConnectionParams>) -> String {
        match self.format {
            OutputFormat::Table => match params {
                Some(params) => {
                    let mut table = property_table();
                    table.add_row(vec!["Host", &params.address.to_string()]);
                    table.add_row(vec!["App", &format!("{} ({})", params.app_label(), params.app_id)]);
                    table.to_string()
                }
                None => "No previous connection.".to_string(),
            },
            OutputFormat::Json => self.to_json_response(&params, "last"),
            OutputFormat::Quiet => String::new(),
        }
    }

    /// Format capability-derived stream options
    pub fn format_options(
        &self,
        server: &ServerCapabilities,
        options: &StreamOptions,
        device: &DeviceCapabilities,
    ) -> String {
        match self.format {
            OutputFormat::Table => {
                let mut table = property_table();
                table.add_row(vec!["Resolutions", &join(&options.resolutions)]);
                table.add_row(vec!["Frame Rates", &join(&options.fps)]);
                table.add_row(vec!["Formats", &join(&options.formats)]);
                table.add_row(vec!["Server HDR", yes_no(server.supports_hdr())]);
                table.add_row(vec!["Device HDR", yes_no(device.supports_hdr())]);
                table.add_row(vec!["Decoder", &device.summary()]);
                table.to_string()
            }
            OutputFormat::Json => self.to_json_response(
                &OptionsOutput {
                    options,
                    server_hdr: server.supports_hdr(),
                    device_hdr: device.supports_hdr(),
                    decoder: device.summary(),
                },
                "options",
            ),
            OutputFormat::Quiet => String::new(),
        }
    }

    /// Format a resolved stream configuration
    pub fn format_resolved(&self, resolved: &ResolvedStream) -> String {
        let config = &resolved.config;
        match self.format {
            OutputFormat::Table => {
                let mut table = property_table();
                table.add_row(vec!["Resolution", &config.resolution.to_string()]);
                table.add_row(vec!["Frame Rate", &config.fps.to_string()]);
                table.add_row(vec!["Bitrate", &format!("{} kbps", config.bitrate_kbps)]);
                table.add_row(vec!["Formats", &format!("{:#06x}", config.video_formats.bits())]);
                table.add_row(vec!["HDR", yes_no(config.hdr)]);
                table.add_row(vec!["Color", &format!("{:?} / {:?}", config.color_space, config.color_range)]);
                table.add_row(vec!["Audio", &config.audio.to_string()]);
                let mut out = table.to_string();
                for advisory in &resolved.advisories {
                    out.push_str(&format!("\n⚠ {advisory}"));
                }
                out
            }
            OutputFormat::Json => self.to_json_response(
                &ResolvedOutput {
                    config,
                    advisories: resolved.advisories.iter().map(ToString::to_string).collect(),
                },
                "resolve",
            ),
            OutputFormat::Quiet => String::new(),
        }
    }

    /// Format a generic success result
    pub fn format_success<T: Serialize>(&self, data: &T, command: &str) -> String {
        match self.format {
            OutputFormat::Json => self.to_json_response(data, command),
            OutputFormat::Table | OutputFormat::Quiet => String::new(),
        }
    }

    /// Format error with exit code context
    pub fn format_error_with_code(&self, message: &str, code: ExitCode) -> String {
        match self.format {
            OutputFormat::Table => format!("Error: {message}"),
            OutputFormat::Json => self.to_json(&ErrorOutput {
                success: false,
                error: message.to_string(),
                exit_code: code as i32,
                exit_code_name: code.name(),
                timestamp: chrono::Utc::now().to_rfc3339(),
            }),
            OutputFormat::Quiet => String::new(),
        }
    }

    /// Progress message (verbose table mode only)
    pub fn progress(&self, message: &str) {
        if self.verbose && self.format == OutputFormat::Table {
            eprintln!("... {message}");
        }
    }

    pub fn success(&self, message: &str) {
        if self.format == OutputFormat::Table {
            println!("✓ {message}");
        }
    }

    pub fn error(&self, message: &str) {
        match self.format {
            OutputFormat::Table => eprintln!("✗ {message}"),
            OutputFormat::Json => println!(
                "{}",
                self.to_json(&MessageOutput {
                    error: Some(message),
                    warning: None,
                    timestamp: chrono::Utc::now().to_rfc3339(),
                })
            ),
            OutputFormat::Quiet => {}
        }
    }

    pub fn warning(&self, message: &str) {
        match self.format {
            OutputFormat::Table => eprintln!("⚠ {message}"),
            OutputFormat::Json => println!(
                "{}",
                self.to_json(&MessageOutput {
                    error: None,
                    warning: Some(message),
                    timestamp: chrono::Utc::now().to_rfc3339(),
                })
            ),
            OutputFormat::Quiet => {}
        }
    }

    fn to_json<T: Serialize>(&self, value: &T) -> String {
        serde_json::to_string_pretty(value).unwrap_or_else(|e| format!("{{\"error\": \"{e}\"}}"))
    }

    fn to_json_response<T: Serialize>(&self, value: &T, command: &str) -> String {
        self.to_json(&JsonResponse::success_with_command(value, command))
    }

    fn certificates_table(&self, certs: &[StoredCertificate]) -> String {
        if certs.is_empty() {
            return "No paired hosts.".to_string();
        }

        let mut table = Table::new();
        table.load_preset(UTF8_FULL);
        table.set_header(vec!["Host", "Fingerprint", "Pinned At"]);
        for cert in certs {
            let fingerprint = cert.fingerprint();
            table.add_row(vec![
                cert.host.as_str(),
                &fingerprint[..fingerprint.len().min(16)],
                &format_time(cert.pinned_at),
            ]);
        }
        table.to_string()
    }
}

fn property_table() -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["Property", "Value"]);
    table
}

fn join<T: ToString>(items: &[T]) -> String {
    items.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")
}

fn yes_no(value: bool) -> &'static str {
    if value {
        "yes"
    } else {
        "no"
    }
}

fn format_time(time: std::time::SystemTime) -> String {
    let datetime: chrono::DateTime<chrono::Utc> = time.into();
    datetime.format("%Y-%m-%d %H:%M:%S UTC").to_string()
}

fn format_time_iso(time: std::time::SystemTime) -> String {
    let datetime: chrono::DateTime<chrono::Utc> = time.into();
    datetime.to_rfc3339()
}

// JSON output structures

#[derive(Serialize)]
struct IdentityOutput {
    identity: Option<String>,
}

#[derive(Serialize)]
struct CertificatesOutput {
    certificates: Vec<CertificateJson>,
    count: usize,
}

#[derive(Serialize)]
struct CertificateJson {
    host: String,
    fingerprint: String,
    pinned_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    der_hex: Option<String>,
}

impl CertificateJson {
    fn from_stored(cert: &StoredCertificate, show_der: bool) -> Self {
        Self {
            host: cert.host.clone(),
            fingerprint: cert.fingerprint(),
            pinned_at: format_time_iso(cert.pinned_at),
            der_hex: show_der.then(|| hex::encode(cert.certificate.der())),
        }
    }
}

#[derive(Serialize)]
struct OptionsOutput<'a> {
    #[serde(flatten)]
    options: &'a StreamOptions,
    server_hdr: bool,
    device_hdr: bool,
    decoder: String,
}

#[derive(Serialize)]
struct ResolvedOutput<'a> {
    config: &'a lumen_core::resolver::StreamConfiguration,
    advisories: Vec<String>,
}

#[derive(Serialize)]
struct ErrorOutput {
    success: bool,
    error: String,
    exit_code: i32,
    exit_code_name: &'static str,
    timestamp: String,
}

#[derive(Serialize)]
struct MessageOutput<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    warning: Option<&'a str>,
    timestamp: String,
}

/// Simple success message for JSON output
#[derive(Serialize)]
pub struct SuccessMessage {
    pub message: String,
}

impl SuccessMessage {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}
