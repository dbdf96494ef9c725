//! PIN-based pairing with a streaming server.
//!
//! The coordinator runs one handshake per host at a time. A successful
//! handshake pins the server certificate in the [`CredentialStore`]; this is
//! the only place a certificate is ever written.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{info, warn};

use crate::collaborators::{ControlChannel, CredentialStore, PairOutcome, PairingProtocol};
use crate::errors::{ControlError, PairingRejection};
use crate::types::{HostAddress, PinnedCertificate};

/// Default timeout for a full pairing handshake. Long, since the user has
/// to type the PIN on the server.
pub const DEFAULT_PAIRING_TIMEOUT: Duration = Duration::from_secs(120);

/// Result of a pairing attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairResult {
    Paired(PinnedCertificate),
    IncorrectPin,
    AlreadyInProgress,
    OtherFailure(String),
}

impl PairResult {
    pub fn is_paired(&self) -> bool {
        matches!(self, PairResult::Paired(_))
    }

    /// The rejection for a failed attempt, `None` on success.
    pub fn rejection(&self) -> Option<PairingRejection> {
        match self {
            PairResult::Paired(_) => None,
            PairResult::IncorrectPin => Some(PairingRejection::IncorrectPin),
            PairResult::AlreadyInProgress => Some(PairingRejection::AlreadyInProgress),
            PairResult::OtherFailure(msg) => Some(PairingRejection::Other(msg.clone())),
        }
    }
}

/// Generate a random 4-digit PIN.
pub fn generate_pin() -> Result<String, getrandom::Error> {
    let mut bytes = [0u8; 4];
    getrandom::getrandom(&mut bytes)?;
    Ok(format!("{:04}", u32::from_le_bytes(bytes) % 10_000))
}

/// Whether `pin` is exactly four ASCII digits.
pub fn is_valid_pin(pin: &str) -> bool {
    pin.len() == 4 && pin.bytes().all(|b| b.is_ascii_digit())
}

/// Marks a host as pairing until dropped.
struct InFlight<'a> {
    hosts: &'a Mutex<HashSet<String>>,
    host: String,
}

impl<'a> InFlight<'a> {
    fn acquire(hosts: &'a Mutex<HashSet<String>>, host: &str) -> Option<Self> {
        let mut guard = hosts.lock().unwrap_or_else(|e| e.into_inner());
        if !guard.insert(host.to_string()) {
            return None;
        }
        Some(Self {
            hosts,
            host: host.to_string(),
        })
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let mut guard = self.hosts.lock().unwrap_or_else(|e| e.into_inner());
        guard.remove(&self.host);
    }
}

/// Drives the pairing handshake and persists the resulting certificate.
pub struct PairingCoordinator {
    channel: Arc<dyn ControlChannel>,
    protocol: Arc<dyn PairingProtocol>,
    credentials: Arc<dyn CredentialStore>,
    timeout: Duration,
    in_flight: Mutex<HashSet<String>>,
}

impl PairingCoordinator {
    pub fn new(
        channel: Arc<dyn ControlChannel>,
        protocol: Arc<dyn PairingProtocol>,
        credentials: Arc<dyn CredentialStore>,
    ) -> Self {
        Self {
            channel,
            protocol,
            credentials,
            timeout: DEFAULT_PAIRING_TIMEOUT,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Pair with `address` using `pin`.
    ///
    /// A second attempt to the same host while one is in flight returns
    /// [`PairResult::AlreadyInProgress`] and leaves the first untouched.
    pub async fn pair(&self, address: &HostAddress, pin: &str) -> PairResult {
        if !is_valid_pin(pin) {
            return PairResult::OtherFailure("PIN must be exactly 4 digits".into());
        }

        let Some(_in_flight) = InFlight::acquire(&self.in_flight, &address.host) else {
            warn!(host = %address, "pairing already in progress for host");
            return PairResult::AlreadyInProgress;
        };

        info!(host = %address, "starting pairing handshake");
        let result = match tokio::time::timeout(self.timeout, self.handshake(address, pin)).await {
            Ok(result) => result,
            Err(_) => PairResult::OtherFailure(ControlError::Timeout(self.timeout).to_string()),
        };
        info!(host = %address, paired = result.is_paired(), "pairing finished");
        result
    }

    async fn handshake(&self, address: &HostAddress, pin: &str) -> PairResult {
        let identity = match self.credentials.device_identity().await {
            Ok(identity) => identity,
            Err(e) => return PairResult::OtherFailure(format!("Pairing error: {e}")),
        };
        let cert = match self.credentials.certificate(&address.host).await {
            Ok(cert) => cert,
            Err(e) => return PairResult::OtherFailure(format!("Pairing error: {e}")),
        };
        let server_info = match self
            .channel
            .query_server_info(address, &identity, cert.as_ref())
            .await
        {
            Ok(info) => info,
            Err(e) => return PairResult::OtherFailure(format!("Pairing error: {e}")),
        };

        match self.protocol.pair(address, &identity, &server_info, pin).await {
            Ok(PairOutcome::Paired(cert)) => {
                if let Err(e) = self
                    .credentials
                    .put_certificate(&address.host, cert.clone())
                    .await
                {
                    return PairResult::OtherFailure(format!("Failed to save certificate: {e}"));
                }
                PairResult::Paired(cert)
            }
            Ok(PairOutcome::PinWrong) => PairResult::IncorrectPin,
            Ok(PairOutcome::AlreadyInProgress) => PairResult::AlreadyInProgress,
            Ok(PairOutcome::Failed(msg)) => PairResult::OtherFailure(msg),
            Err(e) => PairResult::OtherFailure(format!("Pairing error: {e}")),
        }
    }
}
