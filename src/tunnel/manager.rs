//! Connection manager for both ends of the tunnel
//!
//! Owns the listening socket, the tunnel peer and every outside connection,
//! and moves bytes between them:
//!
//! - outside socket read -> frame tagged with the stream's identifier -> peer
//! - peer read -> frames -> outside socket named by each identifier
//!
//! All sockets are non-blocking. Every operation drains its socket until it
//! would block and queues anything the destination refuses, so one slow
//! descriptor never holds up the others.

use super::{
    EntropySource, Frame, FrameDecoder, Framing, Flush, IdAllocator, SessionTable, SystemEntropy,
    TunnelError, WriteBuffer, FRAME_BUFFER_SIZE,
};
use mio::net::{TcpListener, TcpStream};
use mio::{Interest, Registry, Token};
use std::collections::HashMap;
use std::io::{self, ErrorKind, Read};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

/// Token of the listening socket
pub const LISTENER_TOKEN: Token = Token(0);

/// First token handed to peers and outside connections; lower values are
/// reserved for the listener and the event loop's waker
pub const FIRST_DYNAMIC_TOKEN: usize = 2;

/// Which end of the tunnel a manager runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Client: accepts application connections, owns one fixed tunnel peer
    Originating,
    /// Server: accepts the tunnel, dials `target` for every new stream
    Terminating { target: SocketAddr },
}

/// Runtime knobs shared by both roles
#[derive(Debug, Clone, Copy)]
pub struct ManagerSettings {
    /// Frame boundary convention on the tunnel link
    pub framing: Framing,
    /// Close streams without traffic for this long (`None` disables)
    pub idle_timeout: Option<Duration>,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            framing: Framing::default(),
            idle_timeout: Some(Duration::from_secs(crate::DEFAULT_IDLE_TIMEOUT_SECS)),
        }
    }
}

/// Result of [`ConnectionManager::accept_new_outside_connection`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptOutcome {
    /// No connection was pending
    Idle,
    /// A connection was pending but could not be used; try again
    Skipped,
    /// Originating role: a new application stream
    Stream { token: Token, conn_id: u32 },
    /// Terminating role: a new tunnel peer replaced the previous one
    PeerReplaced { token: Token, evicted: usize },
}

/// One frame handed to an outside connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    pub token: Token,
    pub conn_id: u32,
    /// The frame caused a new outbound connection
    pub opened: bool,
}

/// Result of [`ConnectionManager::receive_from_tunnel_peer`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerOutcome {
    Delivered(Vec<Delivery>),
    /// The peer disconnected and has been closed
    Gone,
}

/// Result of [`ConnectionManager::receive_from_outside`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutsideOutcome {
    Forwarded { conn_id: u32, bytes: usize },
    /// End of stream or read error; the stream has been torn down
    Closed { conn_id: u32 },
}

/// Result of [`ConnectionManager::outside_writable`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WritableOutcome {
    StillConnecting,
    Connected { conn_id: u32 },
    ConnectFailed { conn_id: u32 },
    Flushed,
    Closed { conn_id: u32 },
}

/// State of a non-blocking connect
#[derive(Debug)]
pub enum ConnectProbe {
    Pending,
    Established,
    Failed(io::Error),
}

impl ConnectProbe {
    /// Inspect a stream whose connect was issued without blocking
    pub fn of(stream: &TcpStream) -> Self {
        match stream.take_error() {
            Ok(Some(e)) | Err(e) => return ConnectProbe::Failed(e),
            Ok(None) => {}
        }
        match stream.peer_addr() {
            Ok(_) => ConnectProbe::Established,
            Err(e) if e.kind() == ErrorKind::NotConnected => ConnectProbe::Pending,
            Err(e) => ConnectProbe::Failed(e),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Connecting,
    Established,
}

struct OutsideStream {
    conn_id: u32,
    stream: TcpStream,
    outbound: WriteBuffer,
    interest: Interest,
    phase: Phase,
    last_activity: Instant,
}

struct Peer {
    token: Token,
    stream: TcpStream,
    outbound: WriteBuffer,
    interest: Interest,
    decoder: FrameDecoder,
}

impl Peer {
    fn new(token: Token, stream: TcpStream, framing: Framing) -> Self {
        Self {
            token,
            stream,
            outbound: WriteBuffer::new(),
            interest: Interest::READABLE,
            decoder: FrameDecoder::new(framing),
        }
    }
}

enum Wiring<E> {
    Originating { allocator: IdAllocator<E> },
    Terminating { target: SocketAddr },
}

fn interest_for(flush: Flush) -> Interest {
    match flush {
        Flush::Drained => Interest::READABLE,
        Flush::Pending => Interest::READABLE | Interest::WRITABLE,
    }
}

fn deregister(registry: &Registry, stream: &mut TcpStream) {
    if let Err(e) = registry.deregister(stream) {
        debug!("Deregister failed: {}", e);
    }
}

/// Multiplexing state machine for one tunnel end
pub struct ConnectionManager<E = SystemEntropy> {
    wiring: Wiring<E>,
    settings: ManagerSettings,
    listener: TcpListener,
    peer: Option<Peer>,
    /// Established streams
    sessions: SessionTable,
    /// Outbound connects not yet confirmed, by stream identifier
    pending: HashMap<u32, Token>,
    streams: HashMap<Token, OutsideStream>,
    frame_buf: Box<[u8; FRAME_BUFFER_SIZE]>,
    next_token: usize,
    dropped_frames: u64,
    accept_stalled: bool,
}

impl ConnectionManager<SystemEntropy> {
    /// Server end: `listener` faces the tunnel, `target` is the real service
    pub fn terminating(listener: TcpListener, target: SocketAddr, settings: ManagerSettings) -> Self {
        Self::with_wiring(listener, Wiring::Terminating { target }, settings)
    }
}

impl<E: EntropySource> ConnectionManager<E> {
    /// Client end: `listener` faces local applications, `peer` is the
    /// already connected tunnel
    pub fn originating(
        listener: TcpListener,
        peer: TcpStream,
        allocator: IdAllocator<E>,
        settings: ManagerSettings,
    ) -> Self {
        let mut manager = Self::with_wiring(listener, Wiring::Originating { allocator }, settings);
        let token = manager.next_token();
        manager.peer = Some(Peer::new(token, peer, settings.framing));
        manager
    }

    fn with_wiring(listener: TcpListener, wiring: Wiring<E>, settings: ManagerSettings) -> Self {
        Self {
            wiring,
            settings,
            listener,
            peer: None,
            sessions: SessionTable::new(),
            pending: HashMap::new(),
            streams: HashMap::new(),
            frame_buf: Box::new([0u8; FRAME_BUFFER_SIZE]),
            next_token: FIRST_DYNAMIC_TOKEN,
            dropped_frames: 0,
            accept_stalled: false,
        }
    }

    /// Register the listener and the initial peer, if any
    pub fn register(&mut self, registry: &Registry) -> io::Result<()> {
        registry.register(&mut self.listener, LISTENER_TOKEN, Interest::READABLE)?;
        if let Some(peer) = self.peer.as_mut() {
            registry.register(&mut peer.stream, peer.token, peer.interest)?;
        }
        Ok(())
    }

    pub fn role(&self) -> Role {
        match self.wiring {
            Wiring::Originating { .. } => Role::Originating,
            Wiring::Terminating { target } => Role::Terminating { target },
        }
    }

    pub fn settings(&self) -> &ManagerSettings {
        &self.settings
    }

    pub fn listener_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn is_listener(&self, token: Token) -> bool {
        token == LISTENER_TOKEN
    }

    pub fn is_peer(&self, token: Token) -> bool {
        self.peer_token() == Some(token)
    }

    pub fn peer_token(&self) -> Option<Token> {
        self.peer.as_ref().map(|peer| peer.token)
    }

    pub fn has_peer(&self) -> bool {
        self.peer.is_some()
    }

    /// Whether `token` names an outside connection (established or connecting)
    pub fn tracks(&self, token: Token) -> bool {
        self.streams.contains_key(&token)
    }

    /// Whether `token` was ever handed out; events for such tokens that are
    /// no longer tracked belong to sockets closed earlier in the same batch
    pub fn was_issued(&self, token: Token) -> bool {
        token.0 >= FIRST_DYNAMIC_TOKEN && token.0 < self.next_token
    }

    /// Established streams
    pub fn stream_count(&self) -> usize {
        self.sessions.len()
    }

    /// Outbound connects still in progress
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn sessions(&self) -> &SessionTable {
        &self.sessions
    }

    /// Frames discarded as protocol violations
    pub fn dropped_frames(&self) -> u64 {
        self.dropped_frames
    }

    /// The last accept failed with a non-transient error (e.g. descriptor
    /// exhaustion) and connections may still be queued on the listener
    pub fn accept_stalled(&self) -> bool {
        self.accept_stalled
    }

    /// Accept one connection from the listening socket.
    ///
    /// Originating role: the connection becomes a new stream. Terminating
    /// role: the connection becomes the tunnel peer and every existing
    /// stream is torn down.
    pub fn accept_new_outside_connection(
        &mut self,
        registry: &Registry,
    ) -> Result<AcceptOutcome, TunnelError> {
        let (stream, addr) = match self.listener.accept() {
            Ok(accepted) => accepted,
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                self.accept_stalled = false;
                return Ok(AcceptOutcome::Idle);
            }
            Err(e)
                if matches!(
                    e.kind(),
                    ErrorKind::Interrupted
                        | ErrorKind::ConnectionAborted
                        | ErrorKind::ConnectionReset
                ) =>
            {
                debug!("Transient accept error: {}", e);
                return Ok(AcceptOutcome::Skipped);
            }
            Err(e) => {
                // Queued connections get no new readiness edge; the event
                // loop retries while this flag is set
                if self.accept_stalled {
                    debug!("Accept still failing: {}", e);
                } else {
                    error!("Accept error: {}, will retry", e);
                }
                self.accept_stalled = true;
                return Ok(AcceptOutcome::Idle);
            }
        };
        self.accept_stalled = false;
        stream.set_nodelay(true).ok();

        match self.wiring {
            Wiring::Originating { .. } => self.adopt_outside(registry, stream, addr),
            Wiring::Terminating { .. } => self.replace_peer(registry, stream, addr),
        }
    }

    fn adopt_outside(
        &mut self,
        registry: &Registry,
        mut stream: TcpStream,
        addr: SocketAddr,
    ) -> Result<AcceptOutcome, TunnelError> {
        let Wiring::Originating { allocator } = &mut self.wiring else {
            return Ok(AcceptOutcome::Skipped);
        };
        let sessions = &self.sessions;
        let conn_id = match allocator.allocate(|id| sessions.contains_id(id)) {
            Ok(id) => id,
            Err(e) => {
                error!("Rejecting connection from {}: {}", addr, e);
                return Err(e);
            }
        };

        let token = self.next_token();
        if let Err(e) = registry.register(&mut stream, token, Interest::READABLE) {
            error!("Failed to register connection from {}: {}", addr, e);
            return Ok(AcceptOutcome::Skipped);
        }
        self.sessions.insert(token, conn_id)?;
        self.streams.insert(
            token,
            OutsideStream {
                conn_id,
                stream,
                outbound: WriteBuffer::new(),
                interest: Interest::READABLE,
                phase: Phase::Established,
                last_activity: Instant::now(),
            },
        );

        info!("Stream {:#010x} opened for {}", conn_id, addr);
        Ok(AcceptOutcome::Stream { token, conn_id })
    }

    fn replace_peer(
        &mut self,
        registry: &Registry,
        mut stream: TcpStream,
        addr: SocketAddr,
    ) -> Result<AcceptOutcome, TunnelError> {
        if let Some(mut old) = self.peer.take() {
            info!("New tunnel connection from {} replaces the current peer", addr);
            deregister(registry, &mut old.stream);
        } else {
            info!("Tunnel connection from {}", addr);
        }
        let evicted = self.reset_streams(registry);
        if evicted > 0 {
            info!("Closed {} stream(s) of the previous tunnel session", evicted);
        }

        let token = self.next_token();
        if let Err(e) = registry.register(&mut stream, token, Interest::READABLE) {
            error!("Failed to register tunnel connection from {}: {}", addr, e);
            return Ok(AcceptOutcome::Skipped);
        }
        self.peer = Some(Peer::new(token, stream, self.settings.framing));

        Ok(AcceptOutcome::PeerReplaced { token, evicted })
    }

    /// Read everything available from the tunnel peer and route each frame
    /// to its outside connection.
    pub fn receive_from_tunnel_peer(
        &mut self,
        registry: &Registry,
    ) -> Result<PeerOutcome, TunnelError> {
        let mut deliveries = Vec::new();
        let mut frames = Vec::new();
        let mut gone = false;
        while !gone {
            let Some(peer) = self.peer.as_mut() else {
                return Ok(PeerOutcome::Delivered(deliveries));
            };
            let n = match peer.stream.read(&mut self.frame_buf[..]) {
                Ok(0) => {
                    info!("Tunnel peer disconnected");
                    gone = true;
                    0
                }
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!("Tunnel peer read error: {}", e);
                    gone = true;
                    0
                }
            };

            if n > 0 {
                trace!("Read {} bytes from tunnel peer", n);
                peer.decoder.push(&self.frame_buf[..n]);
                loop {
                    match peer.decoder.next_frame() {
                        Ok(Some(frame)) => frames.push(frame),
                        Ok(None) => break,
                        Err(TunnelError::MalformedFrame(reason)) => {
                            warn!("Dropping malformed frame: {}", reason);
                            self.dropped_frames += 1;
                            break;
                        }
                        Err(e) => {
                            error!("Tunnel link corrupted: {}", e);
                            gone = true;
                            break;
                        }
                    }
                }
            }

            // Hand over this read's frames before reading more
            for frame in frames.drain(..) {
                if let Some(delivery) = self.deliver(registry, frame) {
                    deliveries.push(delivery);
                }
            }
        }

        if gone {
            self.drop_peer(registry);
            return Ok(PeerOutcome::Gone);
        }
        Ok(PeerOutcome::Delivered(deliveries))
    }

    fn deliver(&mut self, registry: &Registry, frame: Frame) -> Option<Delivery> {
        let conn_id = frame.conn_id;
        trace!(
            "Frame for stream {:#010x}: {} bytes",
            conn_id,
            frame.payload.len()
        );

        if let Some(token) = self.sessions.lookup_by_id(conn_id) {
            self.queue_to_stream(registry, token, &frame.payload);
            return Some(Delivery {
                token,
                conn_id,
                opened: false,
            });
        }

        if let Some(&token) = self.pending.get(&conn_id) {
            self.queue_to_stream(registry, token, &frame.payload);
            return Some(Delivery {
                token,
                conn_id,
                opened: false,
            });
        }

        match self.wiring {
            Wiring::Originating { .. } => {
                warn!("Dropping frame for unknown stream {:#010x}", conn_id);
                self.dropped_frames += 1;
                None
            }
            Wiring::Terminating { target } => {
                let token = self.open_target(registry, conn_id, target)?;
                self.queue_to_stream(registry, token, &frame.payload);
                Some(Delivery {
                    token,
                    conn_id,
                    opened: true,
                })
            }
        }
    }

    fn open_target(&mut self, registry: &Registry, conn_id: u32, target: SocketAddr) -> Option<Token> {
        let mut stream = match crate::net::connect_nonblocking(target) {
            Ok(stream) => stream,
            Err(e) => {
                error!(
                    "Stream {:#010x} failed to connect to {}: {}",
                    conn_id, target, e
                );
                return None;
            }
        };

        let token = self.next_token();
        if let Err(e) = registry.register(&mut stream, token, Interest::WRITABLE) {
            error!("Stream {:#010x} failed to register: {}", conn_id, e);
            return None;
        }

        debug!("Stream {:#010x} connecting to {}", conn_id, target);
        self.pending.insert(conn_id, token);
        self.streams.insert(
            token,
            OutsideStream {
                conn_id,
                stream,
                outbound: WriteBuffer::new(),
                interest: Interest::WRITABLE,
                phase: Phase::Connecting,
                last_activity: Instant::now(),
            },
        );
        Some(token)
    }

    fn queue_to_stream(&mut self, registry: &Registry, token: Token, payload: &[u8]) {
        let Some(outside) = self.streams.get_mut(&token) else {
            return;
        };
        outside.outbound.push(payload);
        outside.last_activity = Instant::now();
        if outside.phase == Phase::Established {
            self.flush_stream(registry, token);
        }
    }

    /// Read everything available from an outside connection and frame it
    /// onto the tunnel.
    pub fn receive_from_outside(
        &mut self,
        registry: &Registry,
        token: Token,
    ) -> Result<OutsideOutcome, TunnelError> {
        let conn_id = self
            .sessions
            .lookup_by_token(token)
            .ok_or(TunnelError::UnknownDescriptor(token.0))?;
        let framing = self.settings.framing;
        let header_len = framing.header_len();
        let max_payload = framing.max_payload();

        let mut forwarded = 0;
        let mut closed = false;
        loop {
            let Some(outside) = self.streams.get_mut(&token) else {
                return Ok(OutsideOutcome::Closed { conn_id });
            };
            let read = outside
                .stream
                .read(&mut self.frame_buf[header_len..header_len + max_payload]);
            match read {
                Ok(0) => {
                    debug!("Stream {:#010x} closed by its endpoint", conn_id);
                    closed = true;
                    break;
                }
                Ok(n) => {
                    outside.last_activity = Instant::now();
                    forwarded += n;
                    let len = framing.write_header(&mut self.frame_buf[..], conn_id, n);
                    self.send_to_peer(registry, len);
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!("Stream {:#010x} read error: {}", conn_id, e);
                    closed = true;
                    break;
                }
            }
        }

        if closed {
            self.close_stream(registry, token);
            return Ok(OutsideOutcome::Closed { conn_id });
        }
        trace!("Stream {:#010x} forwarded {} bytes", conn_id, forwarded);
        Ok(OutsideOutcome::Forwarded {
            conn_id,
            bytes: forwarded,
        })
    }

    fn send_to_peer(&mut self, registry: &Registry, len: usize) {
        let Some(peer) = self.peer.as_mut() else {
            debug!("No tunnel peer, dropping {} byte frame", len);
            return;
        };
        peer.outbound.push(&self.frame_buf[..len]);
        self.flush_peer(registry);
    }

    /// Writable readiness on an outside connection: finish a pending
    /// connect or flush queued bytes.
    pub fn outside_writable(
        &mut self,
        registry: &Registry,
        token: Token,
    ) -> Result<WritableOutcome, TunnelError> {
        let outside = self
            .streams
            .get_mut(&token)
            .ok_or(TunnelError::UnknownDescriptor(token.0))?;
        let conn_id = outside.conn_id;

        if outside.phase == Phase::Established {
            return Ok(if self.flush_stream(registry, token) {
                WritableOutcome::Flushed
            } else {
                WritableOutcome::Closed { conn_id }
            });
        }

        match ConnectProbe::of(&outside.stream) {
            ConnectProbe::Pending => Ok(WritableOutcome::StillConnecting),
            ConnectProbe::Failed(e) => {
                warn!("Stream {:#010x} connect failed: {}", conn_id, e);
                self.close_stream(registry, token);
                Ok(WritableOutcome::ConnectFailed { conn_id })
            }
            ConnectProbe::Established => {
                if let Err(e) = self.sessions.insert(token, conn_id) {
                    error!("Stream {:#010x} cannot be tracked: {}", conn_id, e);
                    self.close_stream(registry, token);
                    return Ok(WritableOutcome::Closed { conn_id });
                }
                outside.phase = Phase::Established;
                outside.stream.set_nodelay(true).ok();
                self.pending.remove(&conn_id);
                info!("Stream {:#010x} connected", conn_id);

                Ok(if self.flush_stream(registry, token) {
                    WritableOutcome::Connected { conn_id }
                } else {
                    WritableOutcome::Closed { conn_id }
                })
            }
        }
    }

    /// Writable readiness on the tunnel peer. Returns whether the peer is
    /// still present.
    pub fn peer_writable(&mut self, registry: &Registry) -> bool {
        self.flush_peer(registry)
    }

    /// Flush a stream's queue and fix its interest. Returns false if the
    /// stream was closed.
    fn flush_stream(&mut self, registry: &Registry, token: Token) -> bool {
        let Some(outside) = self.streams.get_mut(&token) else {
            return false;
        };
        let result = outside.outbound.flush_into(&mut outside.stream);
        let failure = match result {
            Ok(flush) => {
                let wanted = interest_for(flush);
                if wanted == outside.interest {
                    return true;
                }
                match registry.reregister(&mut outside.stream, token, wanted) {
                    Ok(()) => {
                        outside.interest = wanted;
                        return true;
                    }
                    Err(e) => e,
                }
            }
            Err(e) => e,
        };

        debug!("Stream {:#010x} write failed: {}", outside.conn_id, failure);
        self.close_stream(registry, token);
        false
    }

    fn flush_peer(&mut self, registry: &Registry) -> bool {
        let Some(peer) = self.peer.as_mut() else {
            return false;
        };
        let result = peer.outbound.flush_into(&mut peer.stream);
        let failure = match result {
            Ok(flush) => {
                if flush == Flush::Pending {
                    trace!("Tunnel peer backlog: {} bytes", peer.outbound.len());
                }
                let wanted = interest_for(flush);
                if wanted == peer.interest {
                    return true;
                }
                match registry.reregister(&mut peer.stream, peer.token, wanted) {
                    Ok(()) => {
                        peer.interest = wanted;
                        return true;
                    }
                    Err(e) => e,
                }
            }
            Err(e) => e,
        };

        error!("Tunnel peer write failed: {}", failure);
        self.drop_peer(registry);
        false
    }

    fn drop_peer(&mut self, registry: &Registry) {
        if let Some(mut peer) = self.peer.take() {
            deregister(registry, &mut peer.stream);
            if !peer.outbound.is_empty() {
                debug!(
                    "Discarding {} unsent bytes for the tunnel peer",
                    peer.outbound.len()
                );
            }
        }
    }

    /// Tear down one outside connection, whatever its phase
    fn close_stream(&mut self, registry: &Registry, token: Token) -> Option<u32> {
        let mut outside = self.streams.remove(&token)?;
        deregister(registry, &mut outside.stream);
        match outside.phase {
            Phase::Connecting => {
                self.pending.remove(&outside.conn_id);
            }
            Phase::Established => {
                self.sessions.remove_by_token(token);
            }
        }
        debug!("Stream {:#010x} closed", outside.conn_id);
        Some(outside.conn_id)
    }

    fn reset_streams(&mut self, registry: &Registry) -> usize {
        let evicted = self.streams.len();
        for (_, mut outside) in self.streams.drain() {
            deregister(registry, &mut outside.stream);
        }
        self.sessions.clear();
        self.pending.clear();
        evicted
    }

    /// Close streams idle for longer than the configured timeout
    pub fn expire_idle(&mut self, registry: &Registry, now: Instant) -> usize {
        let Some(limit) = self.settings.idle_timeout else {
            return 0;
        };
        let expired: Vec<Token> = self
            .streams
            .iter()
            .filter(|(_, outside)| now.saturating_duration_since(outside.last_activity) >= limit)
            .map(|(&token, _)| token)
            .collect();

        for &token in &expired {
            if let Some(conn_id) = self.close_stream(registry, token) {
                info!("Stream {:#010x} idle for {:?}, closing", conn_id, limit);
            }
        }
        expired.len()
    }

    fn next_token(&mut self) -> Token {
        let token = Token(self.next_token);
        self.next_token += 1;
        token
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::ScriptedEntropy;
    use mio::Poll;
    use std::io::Write;
    use std::net::{TcpListener as StdListener, TcpStream as StdStream};
    use std::thread;

    /// Retry `f` until it yields a value; sockets settle asynchronously
    fn settle<T>(mut f: impl FnMut() -> Option<T>) -> T {
        for _ in 0..300 {
            if let Some(value) = f() {
                return value;
            }
            thread::sleep(Duration::from_millis(10));
        }
        panic!("condition not reached");
    }

    fn local_listener() -> TcpListener {
        TcpListener::bind("127.0.0.1:0".parse().unwrap()).unwrap()
    }

    fn settings(framing: Framing) -> ManagerSettings {
        ManagerSettings {
            framing,
            idle_timeout: None,
        }
    }

    /// Client manager wired to a plain std socket standing in for the server
    fn client_with_fake_server(
        ids: Vec<u32>,
        settings: ManagerSettings,
    ) -> (ConnectionManager<ScriptedEntropy>, StdStream, Poll) {
        let fake_server = StdListener::bind("127.0.0.1:0").unwrap();
        let peer = StdStream::connect(fake_server.local_addr().unwrap()).unwrap();
        peer.set_nonblocking(true).unwrap();
        let (server_side, _) = fake_server.accept().unwrap();
        server_side
            .set_read_timeout(Some(Duration::from_secs(3)))
            .unwrap();

        let poll = Poll::new().unwrap();
        let mut manager = ConnectionManager::originating(
            local_listener(),
            TcpStream::from_std(peer),
            IdAllocator::new(ScriptedEntropy::new(ids)),
            settings,
        );
        manager.register(poll.registry()).unwrap();
        (manager, server_side, poll)
    }

    fn accept_stream<E: EntropySource>(
        manager: &mut ConnectionManager<E>,
        poll: &Poll,
    ) -> (Token, u32) {
        settle(|| {
            match manager
                .accept_new_outside_connection(poll.registry())
                .unwrap()
            {
                AcceptOutcome::Stream { token, conn_id } => Some((token, conn_id)),
                _ => None,
            }
        })
    }

    #[test]
    fn test_originating_assigns_distinct_ids() {
        let (mut manager, _server, poll) =
            client_with_fake_server(vec![7, 7, 9], settings(Framing::ReadBoundary));
        let addr = manager.listener_addr().unwrap();

        let _app1 = StdStream::connect(addr).unwrap();
        let (token1, id1) = accept_stream(&mut manager, &poll);
        let _app2 = StdStream::connect(addr).unwrap();
        let (token2, id2) = accept_stream(&mut manager, &poll);

        assert_eq!(id1, 7);
        assert_eq!(id2, 9, "colliding draw must be re-rolled");
        assert_ne!(token1, token2);
        assert_eq!(manager.stream_count(), 2);
        assert_eq!(manager.sessions().lookup_by_id(7), Some(token1));
        assert_eq!(manager.sessions().lookup_by_token(token2), Some(9));
    }

    #[test]
    fn test_allocation_failure_aborts_accept() {
        let (mut manager, _server, poll) =
            client_with_fake_server(vec![], settings(Framing::ReadBoundary));
        let addr = manager.listener_addr().unwrap();

        let mut app = StdStream::connect(addr).unwrap();
        let err = settle(|| manager.accept_new_outside_connection(poll.registry()).err());
        assert!(err.is_fatal());
        assert_eq!(manager.stream_count(), 0);

        app.set_read_timeout(Some(Duration::from_secs(3))).unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(app.read(&mut buf).unwrap_or(0), 0);
    }

    #[test]
    fn test_outside_bytes_framed_with_stream_id() {
        let (mut manager, mut server, poll) =
            client_with_fake_server(vec![7], settings(Framing::ReadBoundary));
        let mut app = StdStream::connect(manager.listener_addr().unwrap()).unwrap();
        let (token, _) = accept_stream(&mut manager, &poll);

        app.write_all(b"GET /\n").unwrap();
        settle(|| match manager.receive_from_outside(poll.registry(), token).unwrap() {
            OutsideOutcome::Forwarded { bytes, .. } if bytes > 0 => Some(()),
            _ => None,
        });

        let mut wire = [0u8; 10];
        server.read_exact(&mut wire).unwrap();
        assert_eq!(&wire, b"\x00\x00\x00\x07GET /\n");
    }

    #[test]
    fn test_outside_eof_removes_session() {
        let (mut manager, _server, poll) =
            client_with_fake_server(vec![11], settings(Framing::LengthPrefixed));
        let app = StdStream::connect(manager.listener_addr().unwrap()).unwrap();
        let (token, _) = accept_stream(&mut manager, &poll);

        drop(app);
        let outcome = settle(|| match manager.receive_from_outside(poll.registry(), token).unwrap() {
            closed @ OutsideOutcome::Closed { .. } => Some(closed),
            _ => None,
        });

        assert_eq!(outcome, OutsideOutcome::Closed { conn_id: 11 });
        assert!(manager.sessions().is_empty());
        assert!(!manager.tracks(token));
        assert!(matches!(
            manager.receive_from_outside(poll.registry(), token),
            Err(TunnelError::UnknownDescriptor(_))
        ));
    }

    #[test]
    fn test_originating_drops_unknown_stream() {
        let (mut manager, mut server, poll) =
            client_with_fake_server(vec![], settings(Framing::LengthPrefixed));

        let frame = Frame::new(99, &b"stray"[..])
            .encode(Framing::LengthPrefixed)
            .unwrap();
        server.write_all(&frame).unwrap();

        settle(|| {
            manager.receive_from_tunnel_peer(poll.registry()).unwrap();
            (manager.dropped_frames() == 1).then_some(())
        });
        assert_eq!(manager.stream_count(), 0);
        assert_eq!(manager.pending_count(), 0);
        assert!(manager.has_peer());
    }

    #[test]
    fn test_peer_frames_reach_outside_connection() {
        let (mut manager, mut server, poll) =
            client_with_fake_server(vec![5], settings(Framing::LengthPrefixed));
        let mut app = StdStream::connect(manager.listener_addr().unwrap()).unwrap();
        app.set_read_timeout(Some(Duration::from_secs(3))).unwrap();
        let (token, _) = accept_stream(&mut manager, &poll);

        let mut wire = Frame::new(5, &b"HTTP/1.1 "[..])
            .encode(Framing::LengthPrefixed)
            .unwrap();
        wire.extend_from_slice(
            &Frame::new(5, &b"200 OK"[..])
                .encode(Framing::LengthPrefixed)
                .unwrap(),
        );
        server.write_all(&wire).unwrap();

        let delivered = settle(|| match manager.receive_from_tunnel_peer(poll.registry()).unwrap() {
            PeerOutcome::Delivered(d) if !d.is_empty() => Some(d),
            _ => None,
        });
        assert!(delivered.iter().all(|d| d.token == token && !d.opened));

        let mut reply = [0u8; 15];
        app.read_exact(&mut reply).unwrap();
        assert_eq!(&reply, b"HTTP/1.1 200 OK");
    }

    #[test]
    fn test_peer_eof_keeps_sessions() {
        let (mut manager, server, poll) =
            client_with_fake_server(vec![3], settings(Framing::LengthPrefixed));
        let _app = StdStream::connect(manager.listener_addr().unwrap()).unwrap();
        accept_stream(&mut manager, &poll);

        drop(server);
        settle(|| match manager.receive_from_tunnel_peer(poll.registry()).unwrap() {
            PeerOutcome::Gone => Some(()),
            _ => None,
        });

        assert!(!manager.has_peer());
        assert_eq!(manager.stream_count(), 1);
    }

    #[test]
    fn test_frames_before_peer_eof_are_delivered() {
        let (mut manager, mut server, poll) =
            client_with_fake_server(vec![4], settings(Framing::LengthPrefixed));
        let mut app = StdStream::connect(manager.listener_addr().unwrap()).unwrap();
        app.set_read_timeout(Some(Duration::from_secs(3))).unwrap();
        accept_stream(&mut manager, &poll);

        let frame = Frame::new(4, &b"last words"[..])
            .encode(Framing::LengthPrefixed)
            .unwrap();
        server.write_all(&frame).unwrap();
        drop(server);

        settle(|| match manager.receive_from_tunnel_peer(poll.registry()).unwrap() {
            PeerOutcome::Gone => Some(()),
            _ => None,
        });
        assert!(!manager.has_peer());

        let mut reply = [0u8; 10];
        app.read_exact(&mut reply).unwrap();
        assert_eq!(&reply, b"last words");
    }

    #[test]
    fn test_idle_streams_expire() {
        let (mut manager, _server, poll) = client_with_fake_server(
            vec![1, 2],
            ManagerSettings {
                framing: Framing::LengthPrefixed,
                idle_timeout: Some(Duration::from_millis(20)),
            },
        );
        let addr = manager.listener_addr().unwrap();
        let _app1 = StdStream::connect(addr).unwrap();
        accept_stream(&mut manager, &poll);

        thread::sleep(Duration::from_millis(50));
        let _app2 = StdStream::connect(addr).unwrap();
        accept_stream(&mut manager, &poll);

        assert_eq!(manager.expire_idle(poll.registry(), Instant::now()), 1);
        assert_eq!(manager.stream_count(), 1);
        assert!(manager.sessions().contains_id(2));
    }

    #[test]
    fn test_peer_replacement_resets_all_streams() {
        let target = StdListener::bind("127.0.0.1:0").unwrap();
        let poll = Poll::new().unwrap();
        let mut manager = ConnectionManager::terminating(
            local_listener(),
            target.local_addr().unwrap(),
            settings(Framing::LengthPrefixed),
        );
        manager.register(poll.registry()).unwrap();
        let tunnel_addr = manager.listener_addr().unwrap();

        let mut first = StdStream::connect(tunnel_addr).unwrap();
        let outcome = settle(|| match manager.accept_new_outside_connection(poll.registry()).unwrap() {
            AcceptOutcome::Idle => None,
            other => Some(other),
        });
        assert!(matches!(outcome, AcceptOutcome::PeerReplaced { evicted: 0, .. }));

        for id in [1u32, 2, 3] {
            let frame = Frame::new(id, &b"hello"[..])
                .encode(Framing::LengthPrefixed)
                .unwrap();
            first.write_all(&frame).unwrap();
        }
        let mut opened = 0;
        settle(|| {
            if let PeerOutcome::Delivered(d) = manager.receive_from_tunnel_peer(poll.registry()).unwrap() {
                opened += d.iter().filter(|d| d.opened).count();
            }
            (opened == 3).then_some(())
        });
        assert_eq!(manager.pending_count() + manager.stream_count(), 3);

        let target_sides: Vec<StdStream> = (0..3).map(|_| target.accept().unwrap().0).collect();

        let _second = StdStream::connect(tunnel_addr).unwrap();
        let outcome = settle(|| match manager.accept_new_outside_connection(poll.registry()).unwrap() {
            AcceptOutcome::Idle => None,
            other => Some(other),
        });

        assert!(matches!(outcome, AcceptOutcome::PeerReplaced { evicted: 3, .. }));
        assert!(manager.sessions().is_empty());
        assert_eq!(manager.pending_count(), 0);
        assert!(manager.has_peer());

        for mut side in target_sides {
            side.set_read_timeout(Some(Duration::from_secs(3))).unwrap();
            let mut buf = [0u8; 16];
            // Payload may or may not have been flushed before the reset
            loop {
                match side.read(&mut buf) {
                    Ok(0) => break,
                    Ok(_) => continue,
                    Err(e) if e.kind() == ErrorKind::ConnectionReset => break,
                    Err(e) => panic!("target connection not closed: {}", e),
                }
            }
        }
    }

    #[test]
    fn test_pending_connect_buffers_payload() {
        let target = StdListener::bind("127.0.0.1:0").unwrap();
        let poll = Poll::new().unwrap();
        let mut manager = ConnectionManager::terminating(
            local_listener(),
            target.local_addr().unwrap(),
            settings(Framing::ReadBoundary),
        );
        manager.register(poll.registry()).unwrap();

        let mut tunnel = StdStream::connect(manager.listener_addr().unwrap()).unwrap();
        settle(|| match manager.accept_new_outside_connection(poll.registry()).unwrap() {
            AcceptOutcome::PeerReplaced { .. } => Some(()),
            _ => None,
        });

        tunnel.write_all(b"\x00\x00\x00\x07GET /\n").unwrap();
        let delivery = settle(|| match manager.receive_from_tunnel_peer(poll.registry()).unwrap() {
            PeerOutcome::Delivered(d) if !d.is_empty() => Some(d[0]),
            _ => None,
        });
        assert!(delivery.opened);
        assert_eq!(delivery.conn_id, 7);
        assert!(!manager.sessions().contains_id(7));

        let (mut target_side, _) = target.accept().unwrap();
        let outcome = settle(|| match manager.outside_writable(poll.registry(), delivery.token).unwrap() {
            WritableOutcome::StillConnecting => None,
            other => Some(other),
        });
        assert_eq!(outcome, WritableOutcome::Connected { conn_id: 7 });
        assert_eq!(manager.sessions().lookup_by_id(7), Some(delivery.token));
        assert_eq!(manager.pending_count(), 0);

        target_side
            .set_read_timeout(Some(Duration::from_secs(3)))
            .unwrap();
        let mut request = [0u8; 6];
        target_side.read_exact(&mut request).unwrap();
        assert_eq!(&request, b"GET /\n");
    }

    #[test]
    fn test_failed_connect_redials_on_next_frame() {
        // Nothing listens on this port once the listener is dropped
        let closed = StdListener::bind("127.0.0.1:0").unwrap();
        let target = closed.local_addr().unwrap();
        drop(closed);

        let poll = Poll::new().unwrap();
        let mut manager =
            ConnectionManager::terminating(local_listener(), target, settings(Framing::LengthPrefixed));
        manager.register(poll.registry()).unwrap();

        let mut tunnel = StdStream::connect(manager.listener_addr().unwrap()).unwrap();
        settle(|| match manager.accept_new_outside_connection(poll.registry()).unwrap() {
            AcceptOutcome::PeerReplaced { .. } => Some(()),
            _ => None,
        });

        let one = Frame::new(5, &b"one"[..])
            .encode(Framing::LengthPrefixed)
            .unwrap();
        tunnel.write_all(&one).unwrap();
        let first = settle(|| match manager.receive_from_tunnel_peer(poll.registry()).unwrap() {
            PeerOutcome::Delivered(d) if !d.is_empty() => Some(d[0]),
            _ => None,
        });
        assert!(first.opened);

        let outcome = settle(|| match manager.outside_writable(poll.registry(), first.token).unwrap() {
            WritableOutcome::StillConnecting => None,
            other => Some(other),
        });
        assert_eq!(outcome, WritableOutcome::ConnectFailed { conn_id: 5 });
        assert_eq!(manager.pending_count(), 0);
        assert_eq!(manager.stream_count(), 0);
        assert!(!manager.tracks(first.token));

        let two = Frame::new(5, &b"two"[..])
            .encode(Framing::LengthPrefixed)
            .unwrap();
        tunnel.write_all(&two).unwrap();
        let second = settle(|| match manager.receive_from_tunnel_peer(poll.registry()).unwrap() {
            PeerOutcome::Delivered(d) if !d.is_empty() => Some(d[0]),
            _ => None,
        });
        assert!(second.opened);
        assert_eq!(second.conn_id, 5);
        assert_ne!(second.token, first.token);
    }
}
