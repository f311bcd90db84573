use thiserror::Error;

/// Errors surfaced to the embedder via the state callback.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ControllerError {
    #[error("unknown protocol error")]
    Unknown,
    #[error("incompatible protocol version")]
    Incompatible,
    #[error("timed out")]
    Timeout,
    #[error("audio device error")]
    AudioIo,
}

/// Setup-time failures: these happen before the controller reaches a
/// steady state and are returned directly rather than surfaced through
/// the state callback.
#[derive(Debug, Error)]
pub enum SetupError {
    #[error("failed to bind local socket: {0}")]
    SocketBind(#[source] std::io::Error),
    #[error("failed to enumerate audio devices: {0}")]
    AudioEnumerate(#[source] anyhow::Error),
    #[error("encryption key must be set before Start()")]
    KeyNotSet,
    #[error("controller already started")]
    AlreadyStarted,
}
