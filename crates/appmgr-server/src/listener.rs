use std::net::SocketAddr;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::TcpListener;

use appmgr_core::{AppMgrError, Result};

const BACKLOG: i32 = 1024;

/// Resolves `host:port` to the first usable socket address.
pub async fn resolve_addr(host: &str, port: u16) -> Result<SocketAddr> {
    let mut addrs = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| AppMgrError::Configuration(format!("cannot resolve host {host:?}: {e}")))?;
    addrs
        .next()
        .ok_or_else(|| AppMgrError::Configuration(format!("host {host:?} has no addresses")))
}

/// Binds a listening TCP socket and hands it to Tokio.
///
/// The socket is in the listening state when this returns, so connections
/// made from that point on queue in the backlog even before the accept
/// loop runs. Port `0` lets the OS choose; read the result back with
/// `local_addr`.
pub fn bind(addr: SocketAddr) -> Result<TcpListener> {
    let bind_error = |e: std::io::Error| AppMgrError::Bind {
        addr,
        source: std::sync::Arc::new(e),
    };

    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .map_err(bind_error)?;
    socket.set_reuse_address(true).map_err(bind_error)?;
    socket.set_nodelay(true).map_err(bind_error)?;
    socket.set_nonblocking(true).map_err(bind_error)?;
    socket.bind(&addr.into()).map_err(bind_error)?;
    socket.listen(BACKLOG).map_err(bind_error)?;

    TcpListener::from_std(std::net::TcpListener::from(socket)).map_err(bind_error)
}
