//! Lumen Core - connection, pairing and session orchestration for a
//! game-streaming client.
//!
//! This crate implements:
//! - Server probing (pairing state, capabilities, name, app list)
//! - PIN pairing with certificate pinning
//! - Stream parameter resolution against server and device capability
//! - The session lifecycle state machine with suspend/resume recovery
//!
//! The wire protocol, decoder and storage are collaborators behind the
//! traits in [`collaborators`].

#![forbid(unsafe_code)]

// Core state machine
pub mod session;

// Services
pub mod pairing;
pub mod probe;
pub mod resolver;

// Infrastructure
pub mod collaborators;
pub mod store;
pub mod worker;

// Supporting modules
pub mod capabilities;
pub mod errors;
pub mod formats;
pub mod harness;
pub mod types;

pub use collaborators::{
    AudioSink, ControlChannel, CredentialStore, EventSink, PairingProtocol, SettingsStore,
    StreamTransport, TransportEvent, VideoDecoder,
};
pub use errors::SessionError;
pub use session::{
    Collaborators, Command, ConnectionStatus, SessionChannels, SessionConfig, SessionController,
    SessionHandle, SessionPhase, UiEvent,
};
