//! Framework-agnostic building blocks of the application server lifecycle:
//! configuration resolution, the error taxonomy, one-shot signals, the
//! stop-hook registry and the lifecycle phase.

pub mod config;
pub mod error;
pub mod hooks;
pub mod phase;
pub mod signal;

pub use config::{ResolvedConfig, ServerConfig};
pub use error::{AppMgrError, BoxError, Result};
pub use hooks::StopHooks;
pub use phase::Phase;
pub use signal::OneShot;
