//! Collaborator interfaces consumed by the session layer.
//!
//! Everything that talks to the network, the native decoder or persistent
//! storage sits behind one of these traits. Production implementations live
//! with the host application; [`crate::store`] and [`crate::harness`] carry
//! the in-memory and scripted ones.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::errors::{ControlError, DecoderError, SessionError, StoreError};
use crate::formats::AudioConfig;
use crate::resolver::{StreamConfiguration, VideoStreamParams};
use crate::session::ControllerMessage;
use crate::types::{
    AppEntry, ConnectionParams, DeviceIdentity, HostAddress, PairState, PinnedCertificate,
    ServerInfo, SurfaceHandle,
};

// ============================================================================
// Storage
// ============================================================================

/// Persists the device identity and per-host pinned certificates.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Return the device identity, creating and persisting it on first use.
    async fn device_identity(&self) -> Result<DeviceIdentity, StoreError>;

    /// Pinned certificate for `host`, if the host has been paired.
    async fn certificate(&self, host: &str) -> Result<Option<PinnedCertificate>, StoreError>;

    /// Pin `cert` for `host`, replacing any previous certificate.
    async fn put_certificate(&self, host: &str, cert: PinnedCertificate)
        -> Result<(), StoreError>;

    /// Forget the device identity and every pinned certificate.
    async fn clear_all(&self) -> Result<(), StoreError>;
}

/// Persists small user settings.
#[async_trait]
pub trait SettingsStore: Send + Sync {
    async fn last_connection(&self) -> Result<Option<ConnectionParams>, StoreError>;

    async fn save_last_connection(&self, params: &ConnectionParams) -> Result<(), StoreError>;
}

// ============================================================================
// Network
// ============================================================================

/// Unauthenticated and certificate-authenticated control requests.
#[async_trait]
pub trait ControlChannel: Send + Sync {
    /// Whether the server considers this client paired.
    async fn query_pair_state(
        &self,
        address: &HostAddress,
        identity: &DeviceIdentity,
        cert: Option<&PinnedCertificate>,
    ) -> Result<PairState, ControlError>;

    async fn query_server_info(
        &self,
        address: &HostAddress,
        identity: &DeviceIdentity,
        cert: Option<&PinnedCertificate>,
    ) -> Result<ServerInfo, ControlError>;

    async fn query_app_list(
        &self,
        address: &HostAddress,
        identity: &DeviceIdentity,
        cert: Option<&PinnedCertificate>,
    ) -> Result<Vec<AppEntry>, ControlError>;
}

/// Raw outcome of the PIN pairing handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairOutcome {
    Paired(PinnedCertificate),
    PinWrong,
    AlreadyInProgress,
    Failed(String),
}

/// The PIN-exchange pairing handshake.
#[async_trait]
pub trait PairingProtocol: Send + Sync {
    async fn pair(
        &self,
        address: &HostAddress,
        identity: &DeviceIdentity,
        server_info: &ServerInfo,
        pin: &str,
    ) -> Result<PairOutcome, ControlError>;
}

/// Everything the transport needs to start a stream.
#[derive(Debug, Clone)]
pub struct StreamStart {
    pub params: ConnectionParams,
    pub app_name: &'static str,
    pub config: StreamConfiguration,
    pub identity: DeviceIdentity,
    pub certificate: Option<PinnedCertificate>,
}

/// The streaming connection. Reports progress through the [`EventSink`].
#[async_trait]
pub trait StreamTransport: Send + Sync {
    async fn start(
        &self,
        request: StreamStart,
        video: Arc<dyn VideoDecoder>,
        audio: Arc<dyn AudioSink>,
        events: EventSink,
    ) -> Result<(), SessionError>;

    /// Stop the stream. Must be a no-op when nothing is running.
    async fn stop(&self);
}

// ============================================================================
// Media
// ============================================================================

/// The native video decode and render pipeline.
pub trait VideoDecoder: Send + Sync {
    fn attach(&self, surface: SurfaceHandle) -> Result<(), DecoderError>;

    fn configure(&self, params: &VideoStreamParams) -> Result<(), DecoderError>;

    fn start(&self) -> Result<(), DecoderError>;

    /// Stop decoding. Must be a no-op when already stopped.
    fn stop(&self);

    fn set_hdr_mode(&self, enabled: bool, metadata: Option<&[u8]>);

    /// Whether the pipeline stopped producing frames.
    fn is_stalled(&self) -> bool;

    /// Raw capability bits, see [`crate::capabilities::DecoderCapabilities`].
    fn capabilities(&self) -> u32 {
        0
    }
}

pub trait AudioSink: Send + Sync {
    fn configure(&self, config: AudioConfig) -> Result<(), DecoderError>;

    fn stop(&self);
}

// ============================================================================
// Transport Events
// ============================================================================

/// Link quality reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionQuality {
    Good,
    Poor,
    Unknown,
}

/// Everything the transport can report about a running stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    StageStarting { stage: String },
    StageComplete { stage: String },
    StageFailed { stage: String, code: i32 },
    ConnectionStarted,
    ConnectionTerminated { code: i32 },
    StatusUpdate(ConnectionQuality),
    DisplayMessage(String),
    TransientMessage(String),
    SetHdrMode { enabled: bool, metadata: Option<Vec<u8>> },
    Rumble { controller: u16, low_freq: u16, high_freq: u16 },
    RumbleTriggers { controller: u16, left: u16, right: u16 },
    SetMotionEventState { controller: u16, motion_type: u8, report_rate_hz: u16 },
    SetControllerLed { controller: u16, r: u8, g: u8, b: u8 },
}

/// Delivers transport events to the controller that started the stream.
///
/// Each sink is bound to the request epoch it was issued under; events from
/// a superseded stream are discarded by the controller.
#[derive(Debug, Clone)]
pub struct EventSink {
    epoch: u64,
    tx: mpsc::UnboundedSender<ControllerMessage>,
}

impl EventSink {
    pub(crate) fn new(epoch: u64, tx: mpsc::UnboundedSender<ControllerMessage>) -> Self {
        Self { epoch, tx }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Post an event. Returns false once the controller is gone.
    pub fn emit(&self, event: TransportEvent) -> bool {
        self.tx
            .send(ControllerMessage::Transport {
                epoch: self.epoch,
                event,
            })
            .is_ok()
    }
}
