//! Test harness for Lumen core.
//!
//! Scriptable collaborators that record how they were driven, plus a
//! [`Harness`] bundle that wires them into a [`SessionController`].

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use crate::collaborators::{
    AudioSink, ControlChannel, CredentialStore, EventSink, PairOutcome, PairingProtocol,
    StreamStart, StreamTransport, TransportEvent, VideoDecoder,
};
use crate::errors::{ControlError, DecoderError, SessionError, StoreError};
use crate::formats::AudioConfig;
use crate::resolver::VideoStreamParams;
use crate::session::{Collaborators, SessionChannels, SessionConfig, SessionController};
use crate::store::{InMemoryCredentialStore, InMemorySettingsStore};
use crate::types::{
    AppEntry, DeviceIdentity, HostAddress, PairState, PinnedCertificate, ServerInfo,
    SurfaceHandle,
};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Server info of an HDR-capable 4K server.
pub fn hdr_server_info() -> ServerInfo {
    ServerInfo::new()
        .with_field("hostname", "gaming-pc")
        .with_field("PairStatus", "1")
        .with_field("ServerCodecModeSupport", "0x20301")
        .with_field("MaxLumaPixelsH264", "8294400")
        .with_field("MaxLumaPixelsHEVC", "8294400")
        .with_field("Supports4K", "1")
}

/// Server info of a 1080p server with H.264 only.
pub fn sdr_1080p_server_info() -> ServerInfo {
    ServerInfo::new()
        .with_field("hostname", "office-pc")
        .with_field("ServerCodecModeSupport", "0x3")
        .with_field("MaxLumaPixelsH264", "2073600")
        .with_field("MaxLumaPixelsHEVC", "2073600")
        .with_field("Supports4K", "0")
}

/// A certificate for tests.
pub fn test_certificate() -> PinnedCertificate {
    PinnedCertificate::from_der(vec![0x30, 0x82, 0x01, 0x0a, 0x02, 0x82])
}

// ============================================================================
// Control channel
// ============================================================================

/// Control channel with scripted answers.
pub struct ScriptedControlChannel {
    pair_state: Mutex<PairState>,
    server_info: Mutex<ServerInfo>,
    apps: Mutex<Vec<AppEntry>>,
    failure: Mutex<Option<ControlError>>,
    delay: Mutex<Option<Duration>>,
    pair_state_queries: AtomicUsize,
    server_info_queries: AtomicUsize,
}

impl Default for ScriptedControlChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedControlChannel {
    /// Reports paired and serves [`hdr_server_info`].
    pub fn new() -> Self {
        Self {
            pair_state: Mutex::new(PairState::Paired),
            server_info: Mutex::new(hdr_server_info()),
            apps: Mutex::new(Vec::new()),
            failure: Mutex::new(None),
            delay: Mutex::new(None),
            pair_state_queries: AtomicUsize::new(0),
            server_info_queries: AtomicUsize::new(0),
        }
    }

    pub fn reporting(self, state: PairState) -> Self {
        self.set_pair_state(state);
        self
    }

    pub fn with_server_info(self, info: ServerInfo) -> Self {
        *lock(&self.server_info) = info;
        self
    }

    pub fn with_apps(self, apps: Vec<AppEntry>) -> Self {
        *lock(&self.apps) = apps;
        self
    }

    pub fn with_delay(self, delay: Duration) -> Self {
        *lock(&self.delay) = Some(delay);
        self
    }

    pub fn unreachable(self) -> Self {
        *lock(&self.failure) = Some(ControlError::Unreachable("connection refused".into()));
        self
    }

    pub fn set_pair_state(&self, state: PairState) {
        *lock(&self.pair_state) = state;
    }

    pub fn pair_state_queries(&self) -> usize {
        self.pair_state_queries.load(Ordering::SeqCst)
    }

    pub fn server_info_queries(&self) -> usize {
        self.server_info_queries.load(Ordering::SeqCst)
    }

    async fn respond<T>(&self, value: T) -> Result<T, ControlError> {
        let delay = *lock(&self.delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let failure = lock(&self.failure).clone();
        match failure {
            Some(e) => Err(e),
            None => Ok(value),
        }
    }
}

#[async_trait]
impl ControlChannel for ScriptedControlChannel {
    async fn query_pair_state(
        &self,
        _address: &HostAddress,
        _identity: &DeviceIdentity,
        _cert: Option<&PinnedCertificate>,
    ) -> Result<PairState, ControlError> {
        self.pair_state_queries.fetch_add(1, Ordering::SeqCst);
        let state = *lock(&self.pair_state);
        self.respond(state).await
    }

    async fn query_server_info(
        &self,
        _address: &HostAddress,
        _identity: &DeviceIdentity,
        _cert: Option<&PinnedCertificate>,
    ) -> Result<ServerInfo, ControlError> {
        self.server_info_queries.fetch_add(1, Ordering::SeqCst);
        let info = lock(&self.server_info).clone();
        self.respond(info).await
    }

    async fn query_app_list(
        &self,
        _address: &HostAddress,
        _identity: &DeviceIdentity,
        _cert: Option<&PinnedCertificate>,
    ) -> Result<Vec<AppEntry>, ControlError> {
        let apps = lock(&self.apps).clone();
        self.respond(apps).await
    }
}

// ============================================================================
// Pairing
// ============================================================================

/// Pairing protocol returning a scripted outcome.
pub struct ScriptedPairing {
    outcome: Mutex<PairOutcome>,
    delay: Option<Duration>,
    attempts: AtomicUsize,
}

impl ScriptedPairing {
    pub fn new(outcome: PairOutcome) -> Self {
        Self {
            outcome: Mutex::new(outcome),
            delay: None,
            attempts: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn set_outcome(&self, outcome: PairOutcome) {
        *lock(&self.outcome) = outcome;
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PairingProtocol for ScriptedPairing {
    async fn pair(
        &self,
        _address: &HostAddress,
        _identity: &DeviceIdentity,
        _server_info: &ServerInfo,
        _pin: &str,
    ) -> Result<PairOutcome, ControlError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        Ok(lock(&self.outcome).clone())
    }
}

// ============================================================================
// Credentials
// ============================================================================

/// In-memory credential store that counts certificate writes.
#[derive(Default)]
pub struct RecordingCredentialStore {
    inner: InMemoryCredentialStore,
    put_calls: AtomicUsize,
}

impl RecordingCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_calls(&self) -> usize {
        self.put_calls.load(Ordering::SeqCst)
    }

    pub async fn certificate_count(&self) -> usize {
        self.inner.certificate_count().await
    }
}

#[async_trait]
impl CredentialStore for RecordingCredentialStore {
    async fn device_identity(&self) -> Result<DeviceIdentity, StoreError> {
        self.inner.device_identity().await
    }

    async fn certificate(&self, host: &str) -> Result<Option<PinnedCertificate>, StoreError> {
        self.inner.certificate(host).await
    }

    async fn put_certificate(
        &self,
        host: &str,
        cert: PinnedCertificate,
    ) -> Result<(), StoreError> {
        self.put_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.put_certificate(host, cert).await
    }

    async fn clear_all(&self) -> Result<(), StoreError> {
        self.inner.clear_all().await
    }
}

// ============================================================================
// Transport
// ============================================================================

/// Transport that records start requests and keeps the event sink so tests
/// can inject events.
pub struct RecordingTransport {
    starts: Mutex<Vec<StreamStart>>,
    sink: Mutex<Option<EventSink>>,
    stops: AtomicUsize,
    auto_connect: AtomicBool,
    failure: Mutex<Option<SessionError>>,
}

impl Default for RecordingTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingTransport {
    /// Reports `ConnectionStarted` as soon as a stream starts.
    pub fn new() -> Self {
        Self {
            starts: Mutex::new(Vec::new()),
            sink: Mutex::new(None),
            stops: AtomicUsize::new(0),
            auto_connect: AtomicBool::new(true),
            failure: Mutex::new(None),
        }
    }

    pub fn set_auto_connect(&self, enabled: bool) {
        self.auto_connect.store(enabled, Ordering::SeqCst);
    }

    pub fn fail_starts_with(&self, error: SessionError) {
        *lock(&self.failure) = Some(error);
    }

    pub fn start_count(&self) -> usize {
        lock(&self.starts).len()
    }

    pub fn stop_count(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    pub fn starts(&self) -> Vec<StreamStart> {
        lock(&self.starts).clone()
    }

    pub fn last_start(&self) -> Option<StreamStart> {
        lock(&self.starts).last().cloned()
    }

    /// Emit an event through the sink of the latest stream.
    pub fn emit(&self, event: TransportEvent) -> bool {
        match lock(&self.sink).as_ref() {
            Some(sink) => sink.emit(event),
            None => false,
        }
    }
}

#[async_trait]
impl StreamTransport for RecordingTransport {
    async fn start(
        &self,
        request: StreamStart,
        _video: Arc<dyn VideoDecoder>,
        _audio: Arc<dyn AudioSink>,
        events: EventSink,
    ) -> Result<(), SessionError> {
        if let Some(e) = lock(&self.failure).clone() {
            return Err(e);
        }
        lock(&self.starts).push(request);
        if self.auto_connect.load(Ordering::SeqCst) {
            events.emit(TransportEvent::StageStarting {
                stage: "RTSP handshake".into(),
            });
            events.emit(TransportEvent::StageComplete {
                stage: "RTSP handshake".into(),
            });
            events.emit(TransportEvent::ConnectionStarted);
        }
        *lock(&self.sink) = Some(events);
        Ok(())
    }

    async fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }
}

// ============================================================================
// Media
// ============================================================================

/// Decoder that records calls.
#[derive(Default)]
pub struct RecordingDecoder {
    attached: Mutex<Option<SurfaceHandle>>,
    configured: Mutex<Vec<VideoStreamParams>>,
    starts: AtomicUsize,
    stops: AtomicUsize,
    hdr: Mutex<Option<bool>>,
    stalled: AtomicBool,
    start_failure: Mutex<Option<String>>,
    capabilities: u32,
}

impl RecordingDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capabilities(mut self, bits: u32) -> Self {
        self.capabilities = bits;
        self
    }

    pub fn set_stalled(&self, stalled: bool) {
        self.stalled.store(stalled, Ordering::SeqCst);
    }

    /// Make every later `start` fail with `message`.
    pub fn fail_starts_with(&self, message: impl Into<String>) {
        *lock(&self.start_failure) = Some(message.into());
    }

    pub fn attached(&self) -> Option<SurfaceHandle> {
        *lock(&self.attached)
    }

    pub fn configured(&self) -> Vec<VideoStreamParams> {
        lock(&self.configured).clone()
    }

    pub fn start_count(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stop_count(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    pub fn hdr_mode(&self) -> Option<bool> {
        *lock(&self.hdr)
    }
}

impl VideoDecoder for RecordingDecoder {
    fn attach(&self, surface: SurfaceHandle) -> Result<(), DecoderError> {
        *lock(&self.attached) = Some(surface);
        Ok(())
    }

    fn configure(&self, params: &VideoStreamParams) -> Result<(), DecoderError> {
        if lock(&self.attached).is_none() {
            return Err(DecoderError::NoSurface);
        }
        lock(&self.configured).push(*params);
        Ok(())
    }

    fn start(&self) -> Result<(), DecoderError> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = lock(&self.start_failure).clone() {
            return Err(DecoderError::Other(message));
        }
        self.stalled.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }

    fn set_hdr_mode(&self, enabled: bool, _metadata: Option<&[u8]>) {
        *lock(&self.hdr) = Some(enabled);
    }

    fn is_stalled(&self) -> bool {
        self.stalled.load(Ordering::SeqCst)
    }

    fn capabilities(&self) -> u32 {
        self.capabilities
    }
}

/// Audio sink that records its configuration.
#[derive(Default)]
pub struct RecordingAudio {
    configured: Mutex<Option<AudioConfig>>,
    stops: AtomicUsize,
}

impl RecordingAudio {
    pub fn configured(&self) -> Option<AudioConfig> {
        *lock(&self.configured)
    }

    pub fn stop_count(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

impl AudioSink for RecordingAudio {
    fn configure(&self, config: AudioConfig) -> Result<(), DecoderError> {
        *lock(&self.configured) = Some(config);
        Ok(())
    }

    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }
}

// ============================================================================
// Harness
// ============================================================================

/// Every collaborator a controller needs, scripted for a happy path.
///
/// By default the server reports paired, pairing succeeds, and streams
/// connect immediately.
pub struct Harness {
    pub control: Arc<ScriptedControlChannel>,
    pub pairing: Arc<ScriptedPairing>,
    pub transport: Arc<RecordingTransport>,
    pub decoder: Arc<RecordingDecoder>,
    pub audio: Arc<RecordingAudio>,
    pub credentials: Arc<RecordingCredentialStore>,
    pub settings: Arc<InMemorySettingsStore>,
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}

impl Harness {
    pub fn new() -> Self {
        Self::with_control(ScriptedControlChannel::new())
    }

    pub fn with_control(control: ScriptedControlChannel) -> Self {
        Self {
            control: Arc::new(control),
            pairing: Arc::new(ScriptedPairing::new(PairOutcome::Paired(test_certificate()))),
            transport: Arc::new(RecordingTransport::new()),
            decoder: Arc::new(RecordingDecoder::new()),
            audio: Arc::new(RecordingAudio::default()),
            credentials: Arc::new(RecordingCredentialStore::new()),
            settings: InMemorySettingsStore::new_shared(),
        }
    }

    pub fn with_pairing(mut self, pairing: ScriptedPairing) -> Self {
        self.pairing = Arc::new(pairing);
        self
    }

    pub fn without_auto_connect(self) -> Self {
        self.transport.set_auto_connect(false);
        self
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            control: self.control.clone(),
            pairing: self.pairing.clone(),
            transport: self.transport.clone(),
            decoder: self.decoder.clone(),
            audio: self.audio.clone(),
            credentials: self.credentials.clone(),
            settings: self.settings.clone(),
        }
    }

    /// Build a controller over this harness. Must run inside a Tokio runtime.
    pub fn controller(&self, config: SessionConfig) -> (SessionController, SessionChannels) {
        SessionController::new(self.collaborators(), config)
    }

    /// Pin [`test_certificate`] for `host`.
    pub async fn pin_certificate(&self, host: &str) {
        if let Err(e) = self.credentials.put_certificate(host, test_certificate()).await {
            tracing::warn!(error = %e, "failed to pin test certificate");
        }
    }
}
