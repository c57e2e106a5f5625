//! Single-threaded event loop driving a [`ConnectionManager`]
//!
//! One `Poll` waits on the listener, the tunnel peer, every outside
//! connection and a waker used for shutdown. Each readiness event is
//! dispatched to exactly one manager operation at a time.

use crate::tunnel::{
    AcceptOutcome, ConnectionManager, EntropySource, PeerOutcome, Role, SystemEntropy, TunnelError,
    WritableOutcome,
};
use crate::{Error, Result};
use mio::{Events, Poll, Token, Waker};
use std::io::{self, ErrorKind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

pub use crate::tunnel::LISTENER_TOKEN;

/// Token of the shutdown waker
pub const WAKER_TOKEN: Token = Token(1);

/// Poll capacity when none is configured
pub const DEFAULT_MAX_EVENTS: usize = 64;

/// Stops a running [`Reactor`] from another thread
#[derive(Clone)]
pub struct ShutdownHandle {
    flag: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.flag.store(true, Ordering::SeqCst);
        if let Err(e) = self.waker.wake() {
            warn!("Failed to wake event loop: {}", e);
        }
    }
}

/// Retry delay for an accept that failed with a non-transient error
pub const ACCEPT_RETRY_INTERVAL: Duration = Duration::from_millis(250);

/// How often idle streams are swept for a given timeout
pub fn sweep_interval(idle_timeout: Duration) -> Duration {
    (idle_timeout / 4).max(Duration::from_secs(1))
}

fn poll_timeout(sweep: Option<Duration>, accept_stalled: bool) -> Option<Duration> {
    if !accept_stalled {
        return sweep;
    }
    Some(sweep.map_or(ACCEPT_RETRY_INTERVAL, |s| s.min(ACCEPT_RETRY_INTERVAL)))
}

/// Stop the loop only for fatal errors; any other error costs just the event
fn escalate(err: TunnelError) -> Result<()> {
    if err.is_fatal() {
        error!("Fatal tunnel error: {}", err);
        return Err(err.into());
    }
    warn!("Dropping event: {}", err);
    Ok(())
}

pub struct Reactor<E = SystemEntropy> {
    poll: Poll,
    events: Events,
    manager: ConnectionManager<E>,
    waker: Arc<Waker>,
    stop: Arc<AtomicBool>,
}

impl<E: EntropySource> Reactor<E> {
    /// Register the manager's sockets and prepare the loop
    pub fn new(mut manager: ConnectionManager<E>, max_events: usize) -> Result<Self> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        manager.register(poll.registry())?;

        Ok(Self {
            poll,
            events: Events::with_capacity(max_events.max(1)),
            manager,
            waker,
            stop: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            flag: self.stop.clone(),
            waker: self.waker.clone(),
        }
    }

    pub fn manager(&self) -> &ConnectionManager<E> {
        &self.manager
    }

    /// Run until shutdown, a fatal error, or (client only) loss of the tunnel
    pub fn run(&mut self) -> Result<()> {
        let role = self.manager.role();
        let sweep = self.manager.settings().idle_timeout.map(sweep_interval);
        let mut last_sweep = Instant::now();

        match self.manager.listener_addr() {
            Ok(addr) => info!("Event loop running as {:?}, listening on {}", role, addr),
            Err(_) => info!("Event loop running as {:?}", role),
        }

        loop {
            if self.stop.load(Ordering::SeqCst) {
                info!("Shutdown requested");
                return Ok(());
            }

            let timeout = poll_timeout(sweep, self.manager.accept_stalled());
            match self.poll.poll(&mut self.events, timeout) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!("Poll failed: {}", e);
                    return Err(e.into());
                }
            }

            let ready: Vec<(Token, bool, bool)> = self
                .events
                .iter()
                .map(|event| {
                    (
                        event.token(),
                        event.is_readable() || event.is_read_closed() || event.is_error(),
                        event.is_writable() || event.is_write_closed() || event.is_error(),
                    )
                })
                .collect();

            if self.manager.accept_stalled() {
                self.accept_pending()?;
            }

            for (token, readable, writable) in ready {
                self.dispatch(token, readable, writable)?;

                if role == Role::Originating && !self.manager.has_peer() {
                    error!("Tunnel to server lost");
                    return Err(Error::TunnelClosed);
                }
            }

            if let Some(interval) = sweep {
                let now = Instant::now();
                if now.duration_since(last_sweep) >= interval {
                    last_sweep = now;
                    let expired = self.manager.expire_idle(self.poll.registry(), now);
                    if expired > 0 {
                        debug!("Expired {} idle stream(s)", expired);
                    }
                }
            }
        }
    }

    /// Accept until the listener has nothing more to hand out
    fn accept_pending(&mut self) -> Result<()> {
        let registry = self.poll.registry();
        loop {
            match self.manager.accept_new_outside_connection(registry) {
                Ok(AcceptOutcome::Idle) => return Ok(()),
                Ok(AcceptOutcome::Skipped) => continue,
                Ok(AcceptOutcome::Stream { token, conn_id }) => {
                    trace!("Stream {:#010x} on descriptor {}", conn_id, token.0);
                }
                Ok(AcceptOutcome::PeerReplaced { token, evicted }) => {
                    debug!("Tunnel peer on descriptor {}, {} stream(s) evicted", token.0, evicted);
                }
                Err(e) => escalate(e)?,
            }
        }
    }

    fn dispatch(&mut self, token: Token, readable: bool, writable: bool) -> Result<()> {
        if token == WAKER_TOKEN {
            return Ok(());
        }

        if self.manager.is_listener(token) {
            return self.accept_pending();
        }

        let registry = self.poll.registry();

        if self.manager.is_peer(token) {
            if writable && !self.manager.peer_writable(registry) {
                return Ok(());
            }
            if readable {
                match self.manager.receive_from_tunnel_peer(registry) {
                    Ok(PeerOutcome::Gone) => {
                        if let Role::Terminating { .. } = self.manager.role() {
                            info!("Waiting for a new tunnel connection");
                        }
                    }
                    Ok(PeerOutcome::Delivered(deliveries)) => {
                        trace!("Delivered {} frame(s)", deliveries.len());
                    }
                    Err(e) => return escalate(e),
                }
            }
            return Ok(());
        }

        if self.manager.tracks(token) {
            if writable {
                match self.manager.outside_writable(registry, token) {
                    Ok(WritableOutcome::ConnectFailed { conn_id }) => {
                        debug!("Stream {:#010x} dropped after failed connect", conn_id);
                    }
                    Ok(outcome) => trace!("Descriptor {} writable: {:?}", token.0, outcome),
                    Err(e) => escalate(e)?,
                }
            }
            if readable && self.manager.sessions().contains_token(token) {
                match self.manager.receive_from_outside(registry, token) {
                    Ok(outcome) => trace!("Descriptor {} readable: {:?}", token.0, outcome),
                    Err(e) => escalate(e)?,
                }
            }
            return Ok(());
        }

        if self.manager.was_issued(token) {
            trace!("Stale event for closed descriptor {}", token.0);
        } else {
            warn!("Event for unregistered descriptor {}", token.0);
        }
        Ok(())
    }
}

/// Run `reactor` on a blocking thread until it stops or Ctrl-C arrives
pub async fn run_until_interrupted<E>(mut reactor: Reactor<E>) -> Result<()>
where
    E: EntropySource + Send + 'static,
{
    let handle = reactor.shutdown_handle();
    let mut worker = tokio::task::spawn_blocking(move || reactor.run());

    tokio::select! {
        finished = &mut worker => finished.map_err(io::Error::other)?,
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("Interrupted, shutting down");
            handle.shutdown();
            worker.await.map_err(io::Error::other)?
        }
    }
}
