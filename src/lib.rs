//! # muxtun
//!
//! Carries many TCP connections over a single TCP tunnel.
//!
//! ## Features
//!
//! - **One link, many streams**: every outside connection gets a random
//!   32-bit stream identifier that prefixes its bytes on the tunnel
//! - **Single-threaded reactor** built on `mio`; all sockets non-blocking
//! - **Two framings**: length-prefixed (default) and read-boundary for
//!   compatibility with peers that send one frame per write
//! - **Idle stream expiry** so abandoned connections do not leak
//!
//! ## Architecture
//!
//! ```text
//!  applications            client                 server            target
//!  ───────────► listener ─► [id|payload] ═tunnel═► peer ─► connect ─► service
//!  ◄─────────── stream   ◄─ [id|payload] ◄═══════ peer ◄─ stream  ◄─
//! ```
//!
//! The client ([`tunnel::Role::Originating`]) accepts application
//! connections and assigns identifiers. The server
//! ([`tunnel::Role::Terminating`]) accepts the tunnel and dials the target
//! once per identifier it has not seen. A new tunnel connection on the server
//! replaces the old one and closes every stream of the old session.

pub mod config;
pub mod logging;
pub mod net;
pub mod reactor;
pub mod tunnel;

pub use config::Config;
pub use reactor::{Reactor, ShutdownHandle};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default per-stream idle timeout
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 300;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Tunnel error: {0}")]
    Tunnel(#[from] tunnel::TunnelError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Tunnel connection closed")]
    TunnelClosed,
}
