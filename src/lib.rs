//! `vocalink` — the transport engine of a one-to-one encrypted real-time
//! voice call: framing/encryption, sequencing/acknowledgment, congestion
//! inference, path selection across relay/P2P/LAN candidates, a small
//! reliable control sub-protocol, and the adaptive-bitrate feedback loop.
//!
//! Audio capture/playback, the codec, the DSP chain, and the jitter
//! buffer are external collaborators behind the traits in
//! [`collaborators`]; this crate ships real (non-mock) implementations
//! of the socket (`socket`) and audio device (`audio`) collaborators so
//! a call can actually run end to end.

pub mod audio;
pub mod bitrate;
pub mod collaborators;
pub mod config;
pub mod congestion;
pub mod controller;
pub mod crypto;
pub mod endpoint;
pub mod error;
pub mod framing;
pub mod handshake;
pub mod reliable;
pub mod seq;
pub mod socket;
pub mod stats;
pub mod testutil;
pub mod time;
pub mod types;

pub use controller::Controller;
pub use error::ControllerError;
pub use types::{ControllerState, EndpointKind, NetworkType};
