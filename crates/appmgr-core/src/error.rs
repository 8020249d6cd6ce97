use std::net::SocketAddr;
use std::sync::Arc;

/// Failure type returned by stop hooks and data loaders.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

pub type Result<T, E = AppMgrError> = std::result::Result<T, E>;

/// Every failure the lifecycle can surface.
///
/// The enum is `Clone` so that one failed start can be handed to every
/// caller awaiting it. Non-clonable sources are kept behind an `Arc`.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AppMgrError {
    /// Invalid construction input. Surfaced before anything is scheduled.
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("failed to bind listener on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: Arc<std::io::Error>,
    },

    /// A stop hook failed. Remaining hooks were not run and the listener
    /// is still open.
    #[error("stop hook `{name}` failed: {source}")]
    Hook {
        name: String,
        #[source]
        source: Arc<dyn std::error::Error + Send + Sync>,
    },

    #[error("stop hook `{0}` registered after shutdown began")]
    HookRejected(String),

    /// A handler tried to send an absent value.
    #[error("handler attempted to send an absent response value")]
    InvalidResponse,

    #[error("server has already been stopped")]
    Closed,

    #[error("transport failure: {0}")]
    Transport(Arc<std::io::Error>),
}

impl AppMgrError {
    pub fn hook(name: impl Into<String>, source: BoxError) -> Self {
        AppMgrError::Hook {
            name: name.into(),
            source: Arc::from(source),
        }
    }
}

impl From<std::io::Error> for AppMgrError {
    fn from(e: std::io::Error) -> Self {
        AppMgrError::Transport(Arc::new(e))
    }
}
