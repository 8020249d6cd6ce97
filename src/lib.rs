//! Lifecycle manager for an HTTP application server.
//!
//! Construct an [`AppMgr`], register routes and stop hooks, and let it bind
//! on the next scheduling tick (or call [`AppMgr::start`] yourself). Shut it
//! down with [`AppMgr::stop`], which runs the hooks in order before the
//! listener is closed.

pub use appmgr_core::{config, error, hooks, phase, signal};
pub use appmgr_core::{AppMgrError, BoxError, OneShot, Phase, ResolvedConfig, Result, ServerConfig, StopHooks};
pub use appmgr_server::{assets, listener, loader, markup, payload, routes, server};
pub use appmgr_server::{normalize, AppMgr, AppMgrBuilder, DataLoader, Endpoint, Markup, Normalized, Payload, RouteTable};
