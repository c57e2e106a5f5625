//! Tunnel layer - stream multiplexing over a single TCP link
//!
//! Provides:
//! - Frame header encoding/decoding
//! - Stream identifier allocation
//! - Descriptor <-> identifier bookkeeping
//! - Buffered non-blocking writes
//! - The connection manager driving both tunnel roles

pub mod allocator;
pub mod codec;
mod frame;
mod manager;
mod outbound;
mod session;

pub use allocator::{EntropySource, IdAllocator, ScriptedEntropy, SystemEntropy};
pub use frame::{Frame, FrameDecoder, Framing};
pub use manager::{
    AcceptOutcome, ConnectProbe, ConnectionManager, Delivery, ManagerSettings, OutsideOutcome,
    PeerOutcome, Role, WritableOutcome, FIRST_DYNAMIC_TOKEN, LISTENER_TOKEN,
};
pub use outbound::{Flush, WriteBuffer};
pub use session::SessionTable;

use thiserror::Error;

/// Tunnel layer errors
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Event for unregistered descriptor: {0}")]
    UnknownDescriptor(usize),

    #[error("Session already present (descriptor {token}, stream {conn_id:#010x})")]
    DuplicateSession { token: usize, conn_id: u32 },

    #[error("No free stream identifier after {attempts} attempts")]
    IdSpaceExhausted { attempts: u32 },

    #[error("Entropy source failed")]
    Entropy,

    #[error("Frame too large: {0} > {1}")]
    FrameTooLarge(usize, usize),

    #[error("Malformed frame: {0}")]
    MalformedFrame(String),
}

impl TunnelError {
    /// Whether the process must stop when this error reaches the event loop
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TunnelError::IdSpaceExhausted { .. } | TunnelError::Entropy
        )
    }
}

/// Size of the reusable exchange buffer, header included
pub const FRAME_BUFFER_SIZE: usize = 2048;

/// Stream identifier prefix length
pub const STREAM_ID_SIZE: usize = 4;

/// Payload length field used by length-prefixed framing
pub const LENGTH_FIELD_SIZE: usize = 2;

/// Upper bound on identifier draws per allocation
pub const MAX_ALLOCATION_ATTEMPTS: u32 = 32;
