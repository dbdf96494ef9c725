//! Common types used throughout Lumen Core.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::errors::{ControlError, SessionError};

/// Default HTTP control port of a streaming server.
pub const DEFAULT_HTTP_PORT: u16 = 47989;

/// App id that launches the full desktop.
pub const DESKTOP_APP_ID: u32 = 0;

// ============================================================================
// Addressing
// ============================================================================

/// A server host and control port.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HostAddress {
    pub host: String,
    pub port: u16,
}

impl HostAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse user input of the form `host`, `host:port`, `[v6]`, `[v6]:port`
    /// or a bare IPv6 literal. The port defaults to [`DEFAULT_HTTP_PORT`].
    pub fn parse(input: &str) -> Result<Self, SessionError> {
        let input = input.trim();
        if input.is_empty() {
            return Err(SessionError::InvalidInput("Host cannot be empty".into()));
        }

        if let Some(rest) = input.strip_prefix('[') {
            let (host, tail) = rest.split_once(']').ok_or_else(|| {
                SessionError::InvalidInput(format!("unterminated IPv6 literal: {input}"))
            })?;
            if host.is_empty() {
                return Err(SessionError::InvalidInput("Host cannot be empty".into()));
            }
            let port = match tail {
                "" => DEFAULT_HTTP_PORT,
                t => match t.strip_prefix(':') {
                    Some(p) => parse_port(p)?,
                    None => {
                        return Err(SessionError::InvalidInput(format!(
                            "unexpected characters after IPv6 literal: {t}"
                        )))
                    }
                },
            };
            return Ok(Self::new(host, port));
        }

        match input.matches(':').count() {
            0 => Ok(Self::new(input, DEFAULT_HTTP_PORT)),
            1 => {
                let (host, port) = input.split_once(':').unwrap_or((input, ""));
                if host.is_empty() {
                    return Err(SessionError::InvalidInput("Host cannot be empty".into()));
                }
                Ok(Self::new(host, parse_port(port)?))
            }
            // Bare IPv6 literal without brackets cannot carry a port.
            _ => Ok(Self::new(input, DEFAULT_HTTP_PORT)),
        }
    }
}

fn parse_port(s: &str) -> Result<u16, SessionError> {
    match s.parse::<u16>() {
        Ok(0) | Err(_) => Err(SessionError::InvalidInput(format!("invalid port: {s}"))),
        Ok(port) => Ok(port),
    }
}

impl fmt::Display for HostAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// User connection intent: which server and which app to launch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionParams {
    pub address: HostAddress,
    pub app_id: u32,
}

impl ConnectionParams {
    pub fn new(host: impl Into<String>, port: u16, app_id: u32) -> Self {
        Self {
            address: HostAddress::new(host, port),
            app_id,
        }
    }

    pub fn host(&self) -> &str {
        &self.address.host
    }

    /// Label used for the launched app.
    pub fn app_label(&self) -> &'static str {
        if self.app_id == DESKTOP_APP_ID {
            "Desktop"
        } else {
            "Lumen"
        }
    }
}

// ============================================================================
// Identity and Trust
// ============================================================================

/// Stable per-install client identifier: 16 lowercase hex characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceIdentity(String);

impl DeviceIdentity {
    /// Generate a fresh identifier from 8 random bytes.
    pub fn generate() -> Result<Self, getrandom::Error> {
        let mut bytes = [0u8; 8];
        getrandom::getrandom(&mut bytes)?;
        Ok(Self(hex::encode(bytes)))
    }

    /// Wrap a previously persisted identifier, rejecting malformed values.
    pub fn from_stored(value: &str) -> Option<Self> {
        let valid = value.len() == 16 && value.bytes().all(|b| b.is_ascii_hexdigit());
        valid.then(|| Self(value.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// DER-encoded server certificate pinned during pairing.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PinnedCertificate {
    der: Vec<u8>,
}

impl PinnedCertificate {
    pub fn from_der(der: impl Into<Vec<u8>>) -> Self {
        Self { der: der.into() }
    }

    pub fn der(&self) -> &[u8] {
        &self.der
    }

    /// Lowercase hex SHA-256 fingerprint of the DER bytes.
    pub fn fingerprint(&self) -> String {
        hex::encode(Sha256::digest(&self.der))
    }
}

impl fmt::Debug for PinnedCertificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PinnedCertificate")
            .field("fingerprint", &self.fingerprint())
            .field("len", &self.der.len())
            .finish()
    }
}

/// Pairing state of a host. Always derived, never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PairState {
    Unpaired,
    Paired,
}

impl PairState {
    /// Paired only when the server agrees and a certificate is pinned locally.
    pub fn derive(server_reports_paired: bool, has_pinned_certificate: bool) -> Self {
        if server_reports_paired && has_pinned_certificate {
            PairState::Paired
        } else {
            PairState::Unpaired
        }
    }
}

// ============================================================================
// Server Info
// ============================================================================

/// Decoded server info response, kept as a field map.
///
/// Field lookups are defensive: a missing or malformed field is a typed error
/// or a default, never a panic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerInfo {
    fields: BTreeMap<String, String>,
}

impl ServerInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.fields.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }

    /// Parse an unsigned numeric field. Accepts decimal or `0x` hex.
    pub fn get_u64(&self, key: &str) -> Result<Option<u64>, ControlError> {
        let Some(raw) = self.get(key) else {
            return Ok(None);
        };
        let raw = raw.trim();
        let parsed = match raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
            Some(hex) => u64::from_str_radix(hex, 16),
            None => raw.parse::<u64>(),
        };
        parsed
            .map(Some)
            .map_err(|_| ControlError::MalformedResponse(format!("{key}={raw}")))
    }

    /// Display name, falling back to `host` for blank or `UNKNOWN` names.
    pub fn display_name(&self, host: &str) -> String {
        match self.get("hostname").map(str::trim) {
            Some(name) if !name.is_empty() && !name.eq_ignore_ascii_case("UNKNOWN") => {
                name.to_string()
            }
            _ => host.to_string(),
        }
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// One launchable application on a server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppEntry {
    pub id: u32,
    pub title: String,
    pub hdr_supported: bool,
}

/// Opaque handle to a native render surface owned by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SurfaceHandle(pub u64);
