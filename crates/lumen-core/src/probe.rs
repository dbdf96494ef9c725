//! Server probing: pairing state, capabilities, display name and app list.
//!
//! Every remote call is bounded by the probe timeout. Failures are returned
//! as typed errors and never retried here.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::capabilities::ServerCapabilities;
use crate::collaborators::{ControlChannel, CredentialStore};
use crate::errors::{ControlError, SessionError};
use crate::types::{AppEntry, HostAddress, PairState, ServerInfo};

/// Default timeout for a single probe request.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Result of a pairing-state check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairCheck {
    pub state: PairState,
    pub server_reports_paired: bool,
    pub has_pinned_certificate: bool,
}

impl PairCheck {
    pub fn is_paired(&self) -> bool {
        self.state == PairState::Paired
    }

    /// Why the host is not paired, if it isn't.
    pub fn reason(&self) -> Option<&'static str> {
        match (self.server_reports_paired, self.has_pinned_certificate) {
            (true, true) => None,
            (true, false) => Some("Pairing certificate missing; re-pair required"),
            (false, _) => Some("Server requires pairing"),
        }
    }
}

/// Queries a server over the control channel.
pub struct ServerProbe {
    channel: Arc<dyn ControlChannel>,
    credentials: Arc<dyn CredentialStore>,
    timeout: Duration,
}

impl ServerProbe {
    pub fn new(channel: Arc<dyn ControlChannel>, credentials: Arc<dyn CredentialStore>) -> Self {
        Self {
            channel,
            credentials,
            timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Derive the pairing state of `address`.
    ///
    /// A server that reports paired is still `Unpaired` when no certificate
    /// is pinned locally for the host.
    pub async fn check_pairing_state(&self, address: &HostAddress) -> Result<PairCheck, SessionError> {
        let identity = self.credentials.device_identity().await?;
        let cert = self.credentials.certificate(&address.host).await?;

        debug!(host = %address, pinned = cert.is_some(), "checking pairing state");
        let server_state = self
            .bounded(self.channel.query_pair_state(address, &identity, cert.as_ref()))
            .await?;

        let server_reports_paired = server_state == PairState::Paired;
        let has_pinned_certificate = cert.is_some();
        let check = PairCheck {
            state: PairState::derive(server_reports_paired, has_pinned_certificate),
            server_reports_paired,
            has_pinned_certificate,
        };
        info!(host = %address, state = ?check.state, "pairing state resolved");
        Ok(check)
    }

    pub async fn fetch_server_info(&self, address: &HostAddress) -> Result<ServerInfo, SessionError> {
        let identity = self.credentials.device_identity().await?;
        let cert = self.credentials.certificate(&address.host).await?;
        let info = self
            .bounded(self.channel.query_server_info(address, &identity, cert.as_ref()))
            .await?;
        Ok(info)
    }

    pub async fn fetch_capabilities(
        &self,
        address: &HostAddress,
    ) -> Result<ServerCapabilities, SessionError> {
        let info = self.fetch_server_info(address).await?;
        let caps = ServerCapabilities::from_server_info(&info).map_err(|e| {
            SessionError::NetworkFailure(format!("Failed to load capabilities: {e}"))
        })?;
        debug!(
            host = %address,
            codec_mode_support = %format!("{:#x}", caps.codec_mode_support.bits()),
            max_luma = caps.max_luma_pixels(),
            supports_4k = caps.supports_4k,
            "fetched server capabilities"
        );
        Ok(caps)
    }

    /// Human-readable server name; blank or `UNKNOWN` names fall back to the host.
    pub async fn fetch_server_name(&self, address: &HostAddress) -> Result<String, SessionError> {
        let info = self.fetch_server_info(address).await?;
        Ok(info.display_name(&address.host))
    }

    pub async fn fetch_app_list(&self, address: &HostAddress) -> Result<Vec<AppEntry>, SessionError> {
        let identity = self.credentials.device_identity().await?;
        let cert = self.credentials.certificate(&address.host).await?;
        let apps = self
            .bounded(self.channel.query_app_list(address, &identity, cert.as_ref()))
            .await?;
        Ok(apps)
    }

    async fn bounded<T, F>(&self, fut: F) -> Result<T, ControlError>
    where
        F: Future<Output = Result<T, ControlError>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(ControlError::Timeout(self.timeout)),
        }
    }
}
