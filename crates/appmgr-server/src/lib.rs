//! The application server: lifecycle controller, route table, static
//! assets, and response normalization on top of axum.

pub mod assets;
pub mod listener;
pub mod loader;
pub mod markup;
pub mod payload;
pub mod routes;
pub mod server;

pub use appmgr_core::{AppMgrError, BoxError, OneShot, Phase, ResolvedConfig, Result, ServerConfig};
pub use loader::DataLoader;
pub use markup::Markup;
pub use payload::{normalize, Normalized, Payload};
pub use routes::RouteTable;
pub use server::{AppMgr, AppMgrBuilder, Endpoint};
