//! Session controller: the connection lifecycle state machine.
//!
//! The controller owns all session state and is driven from a single event
//! loop. Network and pairing work runs on a [`Worker`]; results come back
//! through the controller's mailbox tagged with the request epoch they were
//! issued under, and anything from a superseded request is dropped.
//!
//! A stream is started only when the controller holds pending connection
//! parameters, the host is paired, and the render surface is ready. Those
//! three can become true in any order; [`SessionController::start_if_ready`]
//! re-checks them after every transition.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::capabilities::DeviceCapabilities;
use crate::collaborators::{
    AudioSink, ConnectionQuality, ControlChannel, CredentialStore, EventSink, PairingProtocol,
    SettingsStore, StreamStart, StreamTransport, TransportEvent, VideoDecoder,
};
use crate::errors::{PairingRejection, SessionError, StoreError};
use crate::pairing::{generate_pin, PairResult, PairingCoordinator, DEFAULT_PAIRING_TIMEOUT};
use crate::probe::{PairCheck, ServerProbe, DEFAULT_PROBE_TIMEOUT};
use crate::resolver::{
    self, Advisory, ResolvedStream, StreamConfiguration, StreamOptions, StreamPreferences,
};
use crate::types::{
    AppEntry, ConnectionParams, DeviceIdentity, HostAddress, PinnedCertificate, SurfaceHandle,
};
use crate::worker::{JobError, Worker};

// ============================================================================
// State
// ============================================================================

/// Lifecycle phase of the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionPhase {
    /// No request and no stream.
    #[default]
    Idle,
    /// Checking whether the host is paired.
    ProbingPairing,
    /// A PIN is shown and pairing is running or awaiting a retry.
    AwaitingPin,
    /// Paired; waiting for the render surface.
    ReadyToConnect,
    /// Stream start issued.
    Connecting,
    Connected,
    /// The last stream ended or failed to start.
    Disconnected,
}

/// What was live when the device went to sleep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuspendSnapshot {
    /// Whether a stream was connected at suspend time.
    pub was_active: bool,
    pub params: Option<ConnectionParams>,
}

/// Session readiness state. Mutated only by [`SessionController`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SessionState {
    pub phase: SessionPhase,
    pub pending: Option<ConnectionParams>,
    pub is_paired: bool,
    pub is_surface_ready: bool,
    pub pre_suspend: Option<SuspendSnapshot>,
}

impl SessionState {
    /// Parameters to start a stream with, if every start condition holds.
    pub fn ready_params(&self) -> Option<&ConnectionParams> {
        if self.is_paired && self.is_surface_ready {
            self.pending.as_ref()
        } else {
            None
        }
    }
}

/// The live stream, exclusively owned by the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveSession {
    pub params: ConnectionParams,
    pub epoch: u64,
    /// Set once the stream start job has resolved parameters.
    pub config: Option<StreamConfiguration>,
    pub connected: bool,
}

/// Status text and connected flag, always published together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionStatus {
    pub text: String,
    pub connected: bool,
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        Self {
            text: "Not connected".into(),
            connected: false,
        }
    }
}

/// Events for the UI layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UiEvent {
    PhaseChanged(SessionPhase),
    /// Show `pin` so the user can enter it on the server.
    PinRequired { host: String, pin: String },
    PairingSucceeded { host: String },
    PairingFailed { host: String, rejection: PairingRejection },
    Advisory(Advisory),
    Error(SessionError),
    StreamOptions { address: HostAddress, options: StreamOptions },
    ServerName { address: HostAddress, name: String },
    AppList { address: HostAddress, apps: Vec<AppEntry> },
    VideoPipelineRestarted,
    PairingReset,
}

// ============================================================================
// Mailbox
// ============================================================================

#[derive(Debug)]
pub(crate) enum CompletionKind {
    PairCheck(Result<PairCheck, SessionError>),
    Pairing { host: String, result: PairResult },
    StreamStarted(Result<ResolvedStream, SessionError>),
    StartSuperseded,
    StreamStopped,
    Options { address: HostAddress, result: Result<StreamOptions, SessionError> },
    ServerName { address: HostAddress, result: Result<String, SessionError> },
    Apps { address: HostAddress, result: Result<Vec<AppEntry>, SessionError> },
    Persisted(Result<(), StoreError>),
    PairingReset(Result<(), StoreError>),
}

#[derive(Debug)]
pub(crate) struct Completion {
    epoch: u64,
    kind: CompletionKind,
}

#[derive(Debug)]
pub(crate) enum ControllerMessage {
    Completion(Completion),
    Transport { epoch: u64, event: TransportEvent },
}

// ============================================================================
// Wiring
// ============================================================================

/// The collaborators a controller drives.
#[derive(Clone)]
pub struct Collaborators {
    pub control: Arc<dyn ControlChannel>,
    pub pairing: Arc<dyn PairingProtocol>,
    pub transport: Arc<dyn StreamTransport>,
    pub decoder: Arc<dyn VideoDecoder>,
    pub audio: Arc<dyn AudioSink>,
    pub credentials: Arc<dyn CredentialStore>,
    pub settings: Arc<dyn SettingsStore>,
}

/// Controller tuning.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub probe_timeout: Duration,
    pub pairing_timeout: Duration,
    pub preferences: StreamPreferences,
    pub device: DeviceCapabilities,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            pairing_timeout: DEFAULT_PAIRING_TIMEOUT,
            preferences: StreamPreferences::default(),
            device: DeviceCapabilities::default(),
        }
    }
}

/// Receivers handed to the UI layer.
pub struct SessionChannels {
    /// Latest status line and connected flag.
    pub status: watch::Receiver<ConnectionStatus>,
    /// Discrete events in the order they happened.
    pub events: mpsc::UnboundedReceiver<UiEvent>,
}

/// Commands accepted by a running controller.
#[derive(Debug, Clone)]
pub enum Command {
    /// See [`SessionController::request_connect`].
    Connect {
        host: String,
        port: u16,
        app_id: u32,
        pairing_verified: bool,
    },
    /// Tear down the session.
    Disconnect,
    /// The render surface was created.
    SurfaceReady(SurfaceHandle),
    /// The render surface was destroyed.
    SurfaceLost,
    /// The device is going to sleep.
    Suspend,
    /// The device woke up.
    Resume,
    /// Retry pairing; `None` generates a new PIN.
    RetryPairing { pin: Option<String> },
    /// Forget the device identity and every pinned certificate.
    ResetPairing,
    /// Use these preferences from the next stream start.
    SetPreferences(StreamPreferences),
    /// Publish capability-filtered options for a host.
    RequestOptions(HostAddress),
    /// Publish a host's display name.
    RequestServerName(HostAddress),
    /// Publish a host's launchable apps.
    RequestAppList(HostAddress),
    /// Stop the session and end the controller task.
    Shutdown,
}

/// Handle for sending commands to a spawned controller.
#[derive(Clone)]
pub struct SessionHandle {
    tx: mpsc::Sender<Command>,
}

impl SessionHandle {
    /// Queue a command. Fails once the controller task has ended.
    pub async fn send(&self, command: Command) -> Result<(), SessionError> {
        self.tx
            .send(command)
            .await
            .map_err(|_| SessionError::Transport("session controller has stopped".into()))
    }
}

// ============================================================================
// Controller
// ============================================================================

/// Drives probe → pair → resolve → stream for one client.
pub struct SessionController {
    state: SessionState,
    epoch: u64,
    /// Mirror of `epoch` read by queued jobs.
    current_epoch: Arc<AtomicU64>,
    active: Option<ActiveSession>,
    prefs: StreamPreferences,
    device: DeviceCapabilities,

    probe: Arc<ServerProbe>,
    pairing: Arc<PairingCoordinator>,
    transport: Arc<dyn StreamTransport>,
    decoder: Arc<dyn VideoDecoder>,
    audio: Arc<dyn AudioSink>,
    credentials: Arc<dyn CredentialStore>,
    settings: Arc<dyn SettingsStore>,

    worker: Worker,
    mailbox_tx: mpsc::UnboundedSender<ControllerMessage>,
    mailbox_rx: mpsc::UnboundedReceiver<ControllerMessage>,
    in_flight: usize,
    pairing_jobs: usize,

    status: watch::Sender<ConnectionStatus>,
    events: mpsc::UnboundedSender<UiEvent>,
}

impl SessionController {
    /// Create a controller. Must be called inside a Tokio runtime.
    pub fn new(collaborators: Collaborators, config: SessionConfig) -> (Self, SessionChannels) {
        let Collaborators {
            control,
            pairing,
            transport,
            decoder,
            audio,
            credentials,
            settings,
        } = collaborators;

        let probe = ServerProbe::new(control.clone(), credentials.clone())
            .with_timeout(config.probe_timeout);
        let coordinator = PairingCoordinator::new(control, pairing, credentials.clone())
            .with_timeout(config.pairing_timeout);

        let mut device = config.device;
        let decoder_bits = decoder.capabilities();
        if decoder_bits != 0 {
            device = device.with_decoder_bits(decoder_bits);
        }
        info!(decoder = %device.summary(), "device capabilities");

        let (mailbox_tx, mailbox_rx) = mpsc::unbounded_channel();
        let (status, status_rx) = watch::channel(ConnectionStatus::default());
        let (events, events_rx) = mpsc::unbounded_channel();

        let controller = Self {
            state: SessionState::default(),
            epoch: 0,
            current_epoch: Arc::new(AtomicU64::new(0)),
            active: None,
            prefs: config.preferences,
            device,
            probe: Arc::new(probe),
            pairing: Arc::new(coordinator),
            transport,
            decoder,
            audio,
            credentials,
            settings,
            worker: Worker::spawn("session-worker"),
            mailbox_tx,
            mailbox_rx,
            in_flight: 0,
            pairing_jobs: 0,
            status,
            events,
        };

        let channels = SessionChannels {
            status: status_rx,
            events: events_rx,
        };
        (controller, channels)
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    /// Readiness flags, pending request and suspend snapshot.
    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Current lifecycle phase.
    pub fn phase(&self) -> SessionPhase {
        self.state.phase
    }

    /// Request epoch; bumped by every connect request and stop.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// The stream that has been started, if any.
    pub fn active_session(&self) -> Option<&ActiveSession> {
        self.active.as_ref()
    }

    /// Whether the transport reported the connection as started.
    pub fn is_connected(&self) -> bool {
        self.active.as_ref().is_some_and(|a| a.connected)
    }

    /// Preferences the next stream start resolves against.
    pub fn preferences(&self) -> &StreamPreferences {
        &self.prefs
    }

    /// Local capabilities, including the decoder's reported bits.
    pub fn device_capabilities(&self) -> &DeviceCapabilities {
        &self.device
    }

    /// Snapshot of the published status.
    pub fn status(&self) -> ConnectionStatus {
        self.status.borrow().clone()
    }

    /// Number of submitted jobs whose completion has not been handled yet.
    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    /// Replace stream preferences. Applies from the next stream start.
    pub fn set_preferences(&mut self, prefs: StreamPreferences) {
        self.prefs = prefs;
    }

    // ------------------------------------------------------------------
    // Connection intent
    // ------------------------------------------------------------------

    /// Request a connection to `host:port` launching `app_id`.
    ///
    /// Supersedes any earlier request and tears down a live stream. With
    /// `pairing_verified` the pairing probe is skipped.
    pub fn request_connect(
        &mut self,
        host: &str,
        port: u16,
        app_id: u32,
        pairing_verified: bool,
    ) -> Result<(), SessionError> {
        let host = host.trim();
        if host.is_empty() {
            return Err(self.reject_input("Host cannot be empty"));
        }
        if port == 0 {
            return Err(self.reject_input("Port must be between 1 and 65535"));
        }

        let params = ConnectionParams::new(host, port, app_id);
        let epoch = self.bump_epoch();

        if self.active.is_some() {
            info!("superseding live session");
            self.teardown_active();
        }
        if let Some(previous) = self.state.pending.replace(params.clone()) {
            debug!(host = %previous.address, "superseding pending request");
        }
        self.state.is_paired = false;
        info!(host = %params.address, app_id, pairing_verified, epoch, "connect requested");

        self.persist_last_connection(&params);

        if pairing_verified {
            self.set_status("Connecting...", false);
            self.on_pairing_resolved(true, None);
        } else {
            self.set_phase(SessionPhase::ProbingPairing);
            self.set_status("Checking pairing...", false);
            let probe = self.probe.clone();
            let address = params.address.clone();
            self.submit(
                epoch,
                async move { CompletionKind::PairCheck(probe.check_pairing_state(&address).await) },
                |e| CompletionKind::PairCheck(Err(SessionError::Transport(e.to_string()))),
            );
        }
        Ok(())
    }

    fn reject_input(&mut self, msg: &str) -> SessionError {
        let err = SessionError::InvalidInput(msg.to_string());
        warn!(error = %err, "connect request rejected");
        self.set_status(err.status_text(), false);
        err
    }

    /// The render surface is ready; attach it to the decoder.
    pub fn on_surface_ready(&mut self, surface: SurfaceHandle) {
        if let Err(e) = self.decoder.attach(surface) {
            warn!(error = %e, "failed to attach render surface");
            self.set_status(SessionError::from(e).status_text(), self.is_connected());
            return;
        }
        debug!(?surface, "render surface ready");
        self.state.is_surface_ready = true;
        self.start_if_ready();
    }

    /// The render surface is gone; no stream starts until a new one is ready.
    pub fn on_surface_lost(&mut self) {
        debug!("render surface lost");
        self.state.is_surface_ready = false;
    }

    /// Record the pairing outcome for the pending request.
    ///
    /// On failure the controller moves to `AwaitingPin` and starts pairing
    /// with a freshly generated PIN.
    pub fn on_pairing_resolved(&mut self, success: bool, error: Option<String>) {
        self.state.is_paired = success;
        if success {
            if self.state.pending.is_some() {
                self.set_phase(SessionPhase::ReadyToConnect);
            }
            self.start_if_ready();
        } else {
            if let Some(reason) = &error {
                info!(%reason, "host is not paired");
            }
            self.begin_pairing(None);
        }
    }

    /// Retry pairing while awaiting a PIN. `None` generates a new PIN.
    pub fn retry_pairing(&mut self, pin: Option<String>) -> Result<(), SessionError> {
        if self.state.phase != SessionPhase::AwaitingPin || self.state.pending.is_none() {
            return Err(SessionError::InvalidInput("no pairing is awaiting a retry".into()));
        }
        if self.pairing_jobs > 0 {
            return Err(SessionError::PairingRejected(PairingRejection::AlreadyInProgress));
        }
        self.begin_pairing(pin);
        Ok(())
    }

    fn begin_pairing(&mut self, pin: Option<String>) {
        let Some(params) = self.state.pending.clone() else {
            debug!("no pending request to pair for");
            return;
        };
        let pin = match pin {
            Some(pin) => pin,
            None => match generate_pin() {
                Ok(pin) => pin,
                Err(e) => {
                    error!(error = %e, "failed to generate pairing PIN");
                    self.set_status(format!("Pairing error: {e}"), false);
                    return;
                }
            },
        };

        let host = params.host().to_string();
        self.set_phase(SessionPhase::AwaitingPin);
        self.set_status(format!("Enter PIN {pin} on {host} to pair"), false);
        self.emit(UiEvent::PinRequired {
            host: host.clone(),
            pin: pin.clone(),
        });

        let pairing = self.pairing.clone();
        let address = params.address;
        let fault_host = host.clone();
        self.pairing_jobs += 1;
        self.submit(
            self.epoch,
            async move {
                let result = pairing.pair(&address, &pin).await;
                CompletionKind::Pairing { host, result }
            },
            move |e| CompletionKind::Pairing {
                host: fault_host,
                result: PairResult::OtherFailure(e.to_string()),
            },
        );
    }

    /// Start the stream if every start condition holds.
    ///
    /// This is the only place a stream start is issued. Returns whether a
    /// start was issued.
    pub fn start_if_ready(&mut self) -> bool {
        let Some(params) = self.state.ready_params().cloned() else {
            debug!(
                paired = self.state.is_paired,
                surface_ready = self.state.is_surface_ready,
                pending = self.state.pending.is_some(),
                "start conditions not met"
            );
            return false;
        };
        self.state.pending = None;

        // Stop-before-start: a previous stream is torn down first.
        self.teardown_active();

        let epoch = self.epoch;
        info!(host = %params.address, app_id = params.app_id, epoch, "starting stream");
        self.set_phase(SessionPhase::Connecting);
        self.set_status("Starting stream...", false);

        self.active = Some(ActiveSession {
            params: params.clone(),
            epoch,
            config: None,
            connected: false,
        });

        let job = StartJob {
            epoch,
            current_epoch: self.current_epoch.clone(),
            params,
            prefs: self.prefs.clone(),
            device: self.device,
            probe: self.probe.clone(),
            credentials: self.credentials.clone(),
            transport: self.transport.clone(),
            decoder: self.decoder.clone(),
            audio: self.audio.clone(),
            sink: EventSink::new(epoch, self.mailbox_tx.clone()),
        };
        self.submit(
            epoch,
            async move {
                match job.run().await {
                    Some(result) => CompletionKind::StreamStarted(result),
                    None => CompletionKind::StartSuperseded,
                }
            },
            |e| CompletionKind::StreamStarted(Err(SessionError::Transport(e.to_string()))),
        );
        true
    }

    /// Tear down everything and return to `Idle`. A no-op when idle.
    pub fn stop(&mut self) {
        if self.is_idle() {
            debug!("stop requested while idle");
            return;
        }
        let epoch = self.bump_epoch();
        info!(epoch, "stopping session");
        self.teardown_active();
        self.state.pending = None;
        self.state.is_paired = false;
        self.state.is_surface_ready = false;
        self.state.pre_suspend = None;
        self.set_phase(SessionPhase::Idle);
        self.set_status("Disconnected", false);
    }

    fn is_idle(&self) -> bool {
        self.state.phase == SessionPhase::Idle
            && self.state.pending.is_none()
            && self.active.is_none()
    }

    fn teardown_active(&mut self) {
        let Some(active) = self.active.take() else {
            return;
        };
        info!(host = %active.params.address, epoch = active.epoch, "tearing down stream");
        self.decoder.stop();
        self.audio.stop();

        let transport = self.transport.clone();
        let decoder = self.decoder.clone();
        let audio = self.audio.clone();
        self.submit(
            self.epoch,
            async move {
                transport.stop().await;
                decoder.stop();
                audio.stop();
                CompletionKind::StreamStopped
            },
            |_| CompletionKind::StreamStopped,
        );
    }

    /// Clear the device identity and every pinned certificate.
    pub fn reset_pairing(&mut self) {
        self.stop();
        let credentials = self.credentials.clone();
        self.submit(
            self.epoch,
            async move { CompletionKind::PairingReset(credentials.clear_all().await) },
            |e| CompletionKind::PairingReset(Err(StoreError::OperationFailed(e.to_string()))),
        );
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Snapshot what is live before the device sleeps.
    pub fn suspend(&mut self) {
        let was_active = self.is_connected();
        let params = self
            .active
            .as_ref()
            .map(|a| a.params.clone())
            .or_else(|| self.state.pending.clone());
        info!(was_active, has_params = params.is_some(), "suspending");
        self.state.pre_suspend = Some(SuspendSnapshot { was_active, params });
    }

    /// Restore after wake.
    ///
    /// A session that dropped while suspended is reconnected from the
    /// snapshot without re-probing pairing. A surviving session only gets
    /// its video pipeline restarted if it stalled.
    pub fn resume(&mut self) {
        let Some(snapshot) = self.state.pre_suspend.take() else {
            debug!("resume without a suspend snapshot");
            return;
        };

        if self.is_connected() {
            self.restart_video_if_stalled();
            return;
        }

        match (snapshot.was_active, snapshot.params) {
            (true, Some(params)) => {
                info!(host = %params.address, "session dropped while suspended, reconnecting");
                if let Err(e) = self.request_connect(
                    &params.address.host,
                    params.address.port,
                    params.app_id,
                    true,
                ) {
                    warn!(error = %e, "reconnect after resume failed");
                }
            }
            _ => debug!("nothing to restore after resume"),
        }
    }

    fn restart_video_if_stalled(&mut self) {
        if !self.decoder.is_stalled() {
            debug!("video pipeline healthy after resume");
            return;
        }
        let Some(config) = self.active.as_ref().and_then(|a| a.config.clone()) else {
            return;
        };
        info!("restarting stalled video pipeline");
        self.decoder.stop();
        let restarted = self
            .decoder
            .configure(&config.video_params())
            .and_then(|()| self.decoder.start());
        match restarted {
            Ok(()) => self.emit(UiEvent::VideoPipelineRestarted),
            Err(e) => {
                warn!(error = %e, "video pipeline restart failed");
                self.set_status(SessionError::from(e).status_text(), true);
            }
        }
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Fetch capability-derived option lists for `address`.
    pub fn request_stream_options(&mut self, address: HostAddress) {
        let probe = self.probe.clone();
        let fault_address = address.clone();
        self.submit(
            self.epoch,
            async move {
                let result = probe
                    .fetch_capabilities(&address)
                    .await
                    .map(|caps| resolver::stream_options(&caps));
                CompletionKind::Options { address, result }
            },
            move |e| CompletionKind::Options {
                address: fault_address,
                result: Err(SessionError::Transport(e.to_string())),
            },
        );
    }

    /// Fetch the display name for `address`.
    pub fn request_server_name(&mut self, address: HostAddress) {
        let probe = self.probe.clone();
        let fault_address = address.clone();
        self.submit(
            self.epoch,
            async move {
                let result = probe.fetch_server_name(&address).await;
                CompletionKind::ServerName { address, result }
            },
            move |e| CompletionKind::ServerName {
                address: fault_address,
                result: Err(SessionError::Transport(e.to_string())),
            },
        );
    }

    /// Fetch the launchable apps on `address`.
    pub fn request_app_list(&mut self, address: HostAddress) {
        let probe = self.probe.clone();
        let fault_address = address.clone();
        self.submit(
            self.epoch,
            async move {
                let result = probe.fetch_app_list(&address).await;
                CompletionKind::Apps { address, result }
            },
            move |e| CompletionKind::Apps {
                address: fault_address,
                result: Err(SessionError::Transport(e.to_string())),
            },
        );
    }

    // ------------------------------------------------------------------
    // Event loop
    // ------------------------------------------------------------------

    /// Apply one [`Command`].
    pub fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect {
                host,
                port,
                app_id,
                pairing_verified,
            } => {
                // Rejections are already published as status.
                let _ = self.request_connect(&host, port, app_id, pairing_verified);
            }
            Command::Disconnect => self.stop(),
            Command::SurfaceReady(surface) => self.on_surface_ready(surface),
            Command::SurfaceLost => self.on_surface_lost(),
            Command::Suspend => self.suspend(),
            Command::Resume => self.resume(),
            Command::RetryPairing { pin } => {
                if let Err(e) = self.retry_pairing(pin) {
                    self.set_status(e.status_text(), self.is_connected());
                }
            }
            Command::ResetPairing => self.reset_pairing(),
            Command::SetPreferences(prefs) => self.set_preferences(prefs),
            Command::RequestOptions(address) => self.request_stream_options(address),
            Command::RequestServerName(address) => self.request_server_name(address),
            Command::RequestAppList(address) => self.request_app_list(address),
            Command::Shutdown => self.stop(),
        }
    }

    /// Run the controller on its own task until `Shutdown` or every handle
    /// is dropped.
    pub fn spawn(mut self) -> (SessionHandle, JoinHandle<()>) {
        let (tx, mut commands) = mpsc::channel::<Command>(32);
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    command = commands.recv() => match command {
                        Some(Command::Shutdown) | None => break,
                        Some(command) => self.handle_command(command),
                    },
                    Some(message) = self.mailbox_rx.recv() => self.dispatch(message),
                }
            }
            self.stop();
            self.settle().await;
            self.worker.shutdown().await;
            info!("session controller stopped");
        });
        (SessionHandle { tx }, task)
    }

    /// Wait for one mailbox message and handle it.
    pub async fn process_next(&mut self) {
        if let Some(message) = self.mailbox_rx.recv().await {
            self.dispatch(message);
        }
    }

    /// Handle messages until no submitted job is outstanding, then drain
    /// whatever else is queued.
    pub async fn settle(&mut self) {
        while self.in_flight > 0 {
            self.process_next().await;
        }
        self.drain();
    }

    /// Handle every message already queued without waiting.
    pub fn drain(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(message) = self.mailbox_rx.try_recv() {
            self.dispatch(message);
            handled += 1;
        }
        handled
    }

    fn dispatch(&mut self, message: ControllerMessage) {
        match message {
            ControllerMessage::Completion(completion) => self.on_completion(completion),
            ControllerMessage::Transport { epoch, event } => self.on_transport_event(epoch, event),
        }
    }

    fn on_completion(&mut self, completion: Completion) {
        self.in_flight = self.in_flight.saturating_sub(1);
        let Completion { epoch, kind } = completion;
        let stale = epoch != self.epoch;

        match kind {
            CompletionKind::PairCheck(_) | CompletionKind::StreamStarted(_) if stale => {
                debug!(epoch, current = self.epoch, "discarding stale completion");
            }
            CompletionKind::PairCheck(result) => self.on_pair_check(result),
            CompletionKind::Pairing { host, result } => {
                self.pairing_jobs = self.pairing_jobs.saturating_sub(1);
                if stale {
                    debug!(%host, epoch, "discarding stale pairing result");
                } else {
                    self.on_pair_result(host, result);
                }
            }
            CompletionKind::StreamStarted(result) => self.on_stream_started(epoch, result),
            CompletionKind::StartSuperseded => {
                debug!(epoch, "stream start abandoned for a superseded request");
            }
            CompletionKind::StreamStopped => trace!("previous stream stopped"),
            CompletionKind::Options { address, result } => match result {
                Ok(options) => self.emit(UiEvent::StreamOptions { address, options }),
                Err(e) => self.report_query_error(e),
            },
            CompletionKind::ServerName { address, result } => match result {
                Ok(name) => self.emit(UiEvent::ServerName { address, name }),
                Err(e) => self.report_query_error(e),
            },
            CompletionKind::Apps { address, result } => match result {
                Ok(apps) => self.emit(UiEvent::AppList { address, apps }),
                Err(e) => self.report_query_error(e),
            },
            CompletionKind::Persisted(result) => {
                if let Err(e) = result {
                    warn!(error = %e, "failed to save last connection");
                }
            }
            CompletionKind::PairingReset(result) => match result {
                Ok(()) => {
                    info!("pairing state reset");
                    self.set_status("Pairing reset", false);
                    self.emit(UiEvent::PairingReset);
                }
                Err(e) => {
                    error!(error = %e, "failed to reset pairing state");
                    self.report_query_error(e.into());
                }
            },
        }
    }

    fn on_pair_check(&mut self, result: Result<PairCheck, SessionError>) {
        match result {
            Ok(check) if check.is_paired() => self.on_pairing_resolved(true, None),
            Ok(check) => self.on_pairing_resolved(false, check.reason().map(String::from)),
            Err(e) => {
                warn!(error = %e, "pairing check failed");
                self.state.pending = None;
                self.set_phase(SessionPhase::Disconnected);
                self.set_status(e.status_text(), false);
                self.emit(UiEvent::Error(e));
            }
        }
    }

    fn on_pair_result(&mut self, host: String, result: PairResult) {
        match result.rejection() {
            None => {
                info!(%host, "paired");
                self.emit(UiEvent::PairingSucceeded { host });
                self.set_status("Paired", false);
                self.on_pairing_resolved(true, None);
            }
            Some(rejection) => {
                info!(%host, %rejection, "pairing rejected");
                self.set_status(rejection.guidance(), false);
                self.emit(UiEvent::PairingFailed { host, rejection });
            }
        }
    }

    fn on_stream_started(&mut self, epoch: u64, result: Result<ResolvedStream, SessionError>) {
        let live = self.active.as_ref().is_some_and(|a| a.epoch == epoch);
        if !live {
            debug!(epoch, "stream start resolved for a session that is gone");
            return;
        }

        match result {
            Ok(resolved) => {
                let connected = self.is_connected();
                if let Some(active) = self.active.as_mut() {
                    active.config = Some(resolved.config);
                }
                for advisory in resolved.advisories {
                    if !connected {
                        let mismatch = SessionError::from(advisory.clone());
                        self.set_status(mismatch.status_text(), false);
                    }
                    self.emit(UiEvent::Advisory(advisory));
                }
            }
            Err(e) => {
                warn!(error = %e, "stream start failed");
                self.active = None;
                self.decoder.stop();
                self.audio.stop();
                self.set_phase(SessionPhase::Disconnected);
                self.set_status(e.status_text(), false);
                self.emit(UiEvent::Error(e));
            }
        }
    }

    fn report_query_error(&mut self, e: SessionError) {
        warn!(error = %e, "request failed");
        self.set_status(e.status_text(), self.is_connected());
        self.emit(UiEvent::Error(e));
    }

    /// Single dispatch point for everything the transport reports.
    fn on_transport_event(&mut self, epoch: u64, event: TransportEvent) {
        let live = self.active.as_ref().is_some_and(|a| a.epoch == epoch);
        if !live {
            trace!(epoch, ?event, "discarding event from superseded stream");
            return;
        }

        match event {
            TransportEvent::StageStarting { stage } => {
                debug!(%stage, "stage starting");
                self.set_status(format!("Starting: {stage}"), false);
            }
            TransportEvent::StageComplete { stage } => {
                debug!(%stage, "stage complete");
                self.set_status(format!("Completed: {stage}"), false);
            }
            TransportEvent::StageFailed { stage, code } => {
                warn!(%stage, code, "stage failed");
                self.decoder.stop();
                self.audio.stop();
                self.active = None;
                let err = SessionError::StageFailure { stage, code };
                self.set_phase(SessionPhase::Disconnected);
                self.set_status(err.status_text(), false);
                self.emit(UiEvent::Error(err));
            }
            TransportEvent::ConnectionStarted => {
                if let Some(active) = self.active.as_mut() {
                    active.connected = true;
                }
                info!("connection started");
                self.set_phase(SessionPhase::Connected);
                self.set_status("Connected", true);
            }
            TransportEvent::ConnectionTerminated { code } => {
                info!(code, "connection terminated");
                self.decoder.stop();
                self.audio.stop();
                self.active = None;
                self.set_phase(SessionPhase::Disconnected);
                let text = if code == 0 {
                    "Disconnected".to_string()
                } else {
                    format!("Connection terminated (error: {code})")
                };
                self.set_status(text, false);
            }
            TransportEvent::StatusUpdate(quality) => {
                let text = match quality {
                    ConnectionQuality::Good => "Connection: Good",
                    ConnectionQuality::Poor => "Connection: Poor",
                    ConnectionQuality::Unknown => "Connection: Unknown",
                };
                self.set_status(text, self.is_connected());
            }
            TransportEvent::DisplayMessage(message) => {
                self.set_status(message, self.is_connected());
            }
            TransportEvent::TransientMessage(message) => {
                debug!(%message, "transient transport message");
            }
            TransportEvent::SetHdrMode { enabled, metadata } => {
                debug!(enabled, "server toggled HDR mode");
                self.decoder.set_hdr_mode(enabled, metadata.as_deref());
            }
            TransportEvent::Rumble { .. }
            | TransportEvent::RumbleTriggers { .. }
            | TransportEvent::SetMotionEventState { .. }
            | TransportEvent::SetControllerLed { .. } => {
                trace!(?event, "controller feedback not handled");
            }
        }
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    /// Invalidate every outstanding request and return the new epoch.
    fn bump_epoch(&mut self) -> u64 {
        self.epoch += 1;
        self.current_epoch.store(self.epoch, Ordering::Release);
        self.epoch
    }

    fn submit<F, E>(&mut self, epoch: u64, job: F, on_fault: E)
    where
        F: Future<Output = CompletionKind> + Send + 'static,
        E: FnOnce(JobError) -> CompletionKind + Send + 'static,
    {
        let tx = self.mailbox_tx.clone();
        let submitted = self.worker.submit(job, move |outcome| {
            let kind = outcome.unwrap_or_else(on_fault);
            // The controller may already be gone.
            let _ = tx.send(ControllerMessage::Completion(Completion { epoch, kind }));
        });
        match submitted {
            Ok(()) => self.in_flight += 1,
            Err(e) => error!(error = %e, "failed to submit background job"),
        }
    }

    fn persist_last_connection(&mut self, params: &ConnectionParams) {
        let settings = self.settings.clone();
        let params = params.clone();
        self.submit(
            self.epoch,
            async move { CompletionKind::Persisted(settings.save_last_connection(&params).await) },
            |e| CompletionKind::Persisted(Err(StoreError::OperationFailed(e.to_string()))),
        );
    }

    fn set_phase(&mut self, phase: SessionPhase) {
        if self.state.phase != phase {
            debug!(from = ?self.state.phase, to = ?phase, "phase change");
            self.state.phase = phase;
            self.emit(UiEvent::PhaseChanged(phase));
        }
    }

    fn set_status(&self, text: impl Into<String>, connected: bool) {
        self.status.send_replace(ConnectionStatus {
            text: text.into(),
            connected,
        });
    }

    fn emit(&self, event: UiEvent) {
        // No UI listening is fine.
        let _ = self.events.send(event);
    }
}

/// Everything needed to bring up one stream on the worker.
struct StartJob {
    epoch: u64,
    current_epoch: Arc<AtomicU64>,
    params: ConnectionParams,
    prefs: StreamPreferences,
    device: DeviceCapabilities,
    probe: Arc<ServerProbe>,
    credentials: Arc<dyn CredentialStore>,
    transport: Arc<dyn StreamTransport>,
    decoder: Arc<dyn VideoDecoder>,
    audio: Arc<dyn AudioSink>,
    sink: EventSink,
}

impl StartJob {
    fn is_superseded(&self) -> bool {
        self.current_epoch.load(Ordering::Acquire) != self.epoch
    }

    /// Bring the stream up. `None` when the request was superseded before
    /// the transport was started.
    async fn run(self) -> Option<Result<ResolvedStream, SessionError>> {
        if self.is_superseded() {
            debug!(epoch = self.epoch, "skipping start for a superseded request");
            return None;
        }

        // Nothing from an earlier stream may still be decoding.
        self.decoder.stop();
        self.transport.stop().await;

        let (resolved, identity, certificate) = match self.prepare().await {
            Ok(prepared) => prepared,
            Err(e) => return Some(Err(e)),
        };
        if self.is_superseded() {
            debug!(epoch = self.epoch, "request superseded while resolving the stream");
            return None;
        }

        if let Err(e) = self.decoder.configure(&resolved.config.video_params()) {
            return Some(Err(e.into()));
        }
        if let Err(e) = self.audio.configure(resolved.config.audio) {
            return Some(Err(e.into()));
        }

        let request = StreamStart {
            app_name: self.params.app_label(),
            params: self.params,
            config: resolved.config.clone(),
            identity,
            certificate,
        };
        let started = self
            .transport
            .start(request, self.decoder, self.audio, self.sink)
            .await;
        Some(started.map(|()| resolved))
    }

    async fn prepare(
        &self,
    ) -> Result<(ResolvedStream, DeviceIdentity, Option<PinnedCertificate>), SessionError> {
        let caps = self.probe.fetch_capabilities(&self.params.address).await?;
        let resolved = resolver::resolve(&self.prefs, &caps, &self.device)?;
        debug!(config = ?resolved.config, advisories = resolved.advisories.len(), "stream configuration resolved");

        let identity = self.credentials.device_identity().await?;
        let certificate = self.credentials.certificate(self.params.host()).await?;
        Ok((resolved, identity, certificate))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harness::{sdr_1080p_server_info, Harness, ScriptedControlChannel};

    fn params(host: &str) -> ConnectionParams {
        ConnectionParams::new(host, 47989, 0)
    }

    #[test]
    fn test_ready_params_requires_every_condition() {
        let mut started = 0;
        for mask in 0u8..8 {
            let state = SessionState {
                is_paired: mask & 1 != 0,
                is_surface_ready: mask & 2 != 0,
                pending: (mask & 4 != 0).then(|| params("pc")),
                ..Default::default()
            };
            if state.ready_params().is_some() {
                assert_eq!(mask, 7);
                started += 1;
            }
        }
        assert_eq!(started, 1);
    }

    #[tokio::test]
    async fn test_stop_when_idle_is_noop() {
        let harness = Harness::new();
        let (mut controller, channels) = harness.controller(SessionConfig::default());

        let before = controller.state().clone();
        let status_before = channels.status.borrow().clone();
        controller.stop();

        assert_eq!(controller.state(), &before);
        assert_eq!(controller.epoch(), 0);
        assert_eq!(*channels.status.borrow(), status_before);
        assert_eq!(controller.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_blank_host_rejected_without_network() {
        let harness = Harness::new();
        let (mut controller, channels) = harness.controller(SessionConfig::default());

        let err = controller.request_connect("   ", 47989, 0, false).unwrap_err();

        assert!(matches!(err, SessionError::InvalidInput(_)));
        assert_eq!(channels.status.borrow().text, "Error: Host cannot be empty");
        assert_eq!(controller.in_flight(), 0);
        assert_eq!(harness.control.pair_state_queries(), 0);
    }

    #[tokio::test]
    async fn test_surface_before_pairing_starts_once_paired() {
        let harness = Harness::new();
        harness.pin_certificate("pc").await;
        let (mut controller, _channels) = harness.controller(SessionConfig::default());

        controller.on_surface_ready(SurfaceHandle(1));
        assert_eq!(harness.transport.start_count(), 0);

        controller.request_connect("pc", 47989, 0, false).unwrap();
        controller.settle().await;

        assert_eq!(harness.transport.start_count(), 1);
        assert!(controller.is_connected());
        assert_eq!(controller.phase(), SessionPhase::Connected);
    }

    #[tokio::test]
    async fn test_paired_without_surface_waits() {
        let harness = Harness::new();
        let (mut controller, _channels) = harness.controller(SessionConfig::default());

        controller.request_connect("pc", 47989, 0, true).unwrap();
        controller.settle().await;

        assert_eq!(harness.transport.start_count(), 0);
        assert_eq!(controller.phase(), SessionPhase::ReadyToConnect);
        assert!(controller.state().pending.is_some());

        controller.on_surface_ready(SurfaceHandle(9));
        controller.settle().await;
        assert_eq!(harness.transport.start_count(), 1);
        assert!(controller.state().pending.is_none());
    }

    #[tokio::test]
    async fn test_stage_failure_stops_decoder_and_reports() {
        let harness = Harness::new().without_auto_connect();
        let (mut controller, mut channels) = harness.controller(SessionConfig::default());

        controller.on_surface_ready(SurfaceHandle(1));
        controller.request_connect("pc", 47989, 0, true).unwrap();
        controller.settle().await;
        let stops_before = harness.decoder.stop_count();

        harness.transport.emit(TransportEvent::StageFailed {
            stage: "RTSP handshake".into(),
            code: 10,
        });
        controller.settle().await;

        assert!(controller.active_session().is_none());
        assert_eq!(controller.phase(), SessionPhase::Disconnected);
        assert!(harness.decoder.stop_count() > stops_before);
        assert_eq!(
            channels.status.borrow().text,
            "Failed: RTSP handshake (error: 10)"
        );

        let mut saw_failure = false;
        while let Ok(event) = channels.events.try_recv() {
            if let UiEvent::Error(SessionError::StageFailure { code, .. }) = event {
                assert_eq!(code, 10);
                saw_failure = true;
            }
        }
        assert!(saw_failure);
    }

    #[tokio::test]
    async fn test_termination_status_text() {
        let harness = Harness::new();
        let (mut controller, channels) = harness.controller(SessionConfig::default());

        controller.on_surface_ready(SurfaceHandle(1));
        controller.request_connect("pc", 47989, 0, true).unwrap();
        controller.settle().await;
        assert_eq!(*channels.status.borrow(), ConnectionStatus {
            text: "Connected".into(),
            connected: true,
        });

        harness.transport.emit(TransportEvent::StatusUpdate(ConnectionQuality::Poor));
        controller.settle().await;
        assert_eq!(channels.status.borrow().text, "Connection: Poor");
        assert!(channels.status.borrow().connected);

        harness.transport.emit(TransportEvent::ConnectionTerminated { code: -1 });
        controller.settle().await;
        assert_eq!(
            channels.status.borrow().text,
            "Connection terminated (error: -1)"
        );
        assert!(!controller.is_connected());
    }

    #[tokio::test]
    async fn test_hdr_mode_forwarded_to_decoder() {
        let harness = Harness::new();
        let (mut controller, _channels) = harness.controller(SessionConfig::default());

        controller.on_surface_ready(SurfaceHandle(1));
        controller.request_connect("pc", 47989, 0, true).unwrap();
        controller.settle().await;

        harness.transport.emit(TransportEvent::SetHdrMode {
            enabled: true,
            metadata: None,
        });
        controller.settle().await;
        assert_eq!(harness.decoder.hdr_mode(), Some(true));
    }

    #[tokio::test]
    async fn test_stop_tears_down_and_resets_flags() {
        let harness = Harness::new();
        let (mut controller, channels) = harness.controller(SessionConfig::default());

        controller.on_surface_ready(SurfaceHandle(1));
        controller.request_connect("pc", 47989, 0, true).unwrap();
        controller.settle().await;
        let epoch = controller.epoch();

        controller.stop();
        controller.settle().await;

        assert_eq!(controller.phase(), SessionPhase::Idle);
        assert!(!controller.state().is_paired);
        assert!(!controller.state().is_surface_ready);
        assert!(controller.state().pending.is_none());
        assert!(controller.epoch() > epoch);
        assert!(harness.transport.stop_count() >= 1);
        assert_eq!(channels.status.borrow().text, "Disconnected");
    }

    #[tokio::test]
    async fn test_resume_restarts_stalled_video_only() {
        let harness = Harness::new();
        let (mut controller, mut channels) = harness.controller(SessionConfig::default());

        controller.on_surface_ready(SurfaceHandle(1));
        controller.request_connect("pc", 47989, 0, true).unwrap();
        controller.settle().await;

        controller.suspend();
        harness.decoder.set_stalled(true);
        controller.resume();
        controller.settle().await;

        assert_eq!(harness.transport.start_count(), 1);
        assert_eq!(harness.decoder.start_count(), 1);
        let restarted = std::iter::from_fn(|| channels.events.try_recv().ok())
            .any(|e| e == UiEvent::VideoPipelineRestarted);
        assert!(restarted);
    }

    #[tokio::test]
    async fn test_failed_video_restart_keeps_session() {
        let harness = Harness::new();
        let (mut controller, channels) = harness.controller(SessionConfig::default());

        controller.on_surface_ready(SurfaceHandle(1));
        controller.request_connect("pc", 47989, 0, true).unwrap();
        controller.settle().await;

        controller.suspend();
        harness.decoder.set_stalled(true);
        harness.decoder.fail_starts_with("codec lost");
        controller.resume();
        controller.settle().await;

        assert!(controller.is_connected());
        let status = channels.status.borrow().clone();
        assert!(status.connected);
        assert_eq!(status.text, "Decoder error: codec lost");
    }

    #[tokio::test]
    async fn test_advisory_published_as_status_before_connect() {
        let harness = Harness::with_control(
            ScriptedControlChannel::new().with_server_info(sdr_1080p_server_info()),
        );
        harness.transport.set_auto_connect(false);
        let config = SessionConfig {
            preferences: StreamPreferences {
                hdr: true,
                ..Default::default()
            },
            ..Default::default()
        };
        let (mut controller, channels) = harness.controller(config);

        controller.on_surface_ready(SurfaceHandle(1));
        controller.request_connect("pc", 47989, 0, true).unwrap();
        controller.settle().await;

        assert_eq!(
            channels.status.borrow().text,
            SessionError::CapabilityMismatch(Advisory::HdrUnsupportedByServer.to_string())
                .status_text()
        );
    }

    #[tokio::test]
    async fn test_retry_pairing_requires_awaiting_pin() {
        let harness = Harness::new();
        let (mut controller, _channels) = harness.controller(SessionConfig::default());
        assert!(matches!(
            controller.retry_pairing(None),
            Err(SessionError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn test_reset_pairing_clears_credentials() {
        let harness = Harness::new();
        harness.pin_certificate("pc").await;
        let (mut controller, mut channels) = harness.controller(SessionConfig::default());

        controller.on_surface_ready(SurfaceHandle(1));
        controller.request_connect("pc", 47989, 0, true).unwrap();
        controller.settle().await;

        controller.reset_pairing();
        controller.settle().await;

        assert_eq!(harness.credentials.certificate_count().await, 0);
        let reset = std::iter::from_fn(|| channels.events.try_recv().ok())
            .any(|e| e == UiEvent::PairingReset);
        assert!(reset);
    }
}
