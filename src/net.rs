//! Socket setup for the tunnel ends

use mio::net::{TcpListener, TcpStream};
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::debug;

/// Bind a non-blocking listening socket (SO_REUSEADDR is set by mio)
pub fn create_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let listener = TcpListener::bind(addr)?;
    debug!("Listening on {}", listener.local_addr()?);
    Ok(listener)
}

/// Connect the tunnel at startup.
///
/// Blocks for at most `timeout`, then hands back a non-blocking stream.
pub fn connect_tunnel(addr: SocketAddr, timeout: Duration) -> io::Result<TcpStream> {
    let stream = std::net::TcpStream::connect_timeout(&addr, timeout)?;

    // Configure TCP options
    stream.set_nodelay(true).ok();
    stream.set_nonblocking(true)?;

    Ok(TcpStream::from_std(stream))
}

/// Start a connect without waiting for it; completion is reported as
/// writable readiness
pub fn connect_nonblocking(addr: SocketAddr) -> io::Result<TcpStream> {
    TcpStream::connect(addr)
}
