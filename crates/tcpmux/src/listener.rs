use std::collections::VecDeque;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, TcpListener as StdTcpListener};
use std::sync::atomic::{AtomicU16, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use socket2::{Domain, Socket, Type};
use tracing::{event, Level};

use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::gate::{Checkpoint, Gate};

/// How long the accept loop sleeps between non-blocking accept polls. Bounds
/// how quickly a paused or stopped listener notices, and how promptly a live
/// port change takes effect once the previous accept cycle completes.
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Backlog passed to `listen(2)` for each (re)bind. Generous enough that a
/// burst of connects does not get refused by the kernel before our own
/// buffer-full rejection path even gets a chance to run.
const LISTEN_BACKLOG: i32 = 1024;

struct Shared {
    port: AtomicU16,
    limit: AtomicUsize,
    buffer: Mutex<VecDeque<Connection>>,
    gate: Gate,
    /// The port a live rebind failed for, alongside the error, so that a
    /// caller checking for *its own* call's outcome never picks up a stale
    /// failure left behind by a different, unrelated rebind.
    last_bind_error: Mutex<Option<(u16, io::Error)>>,
}

/// Owns one TCP accept loop for one port and a bounded local buffer of
/// accepted-but-not-yet-drained connections.
///
/// A `Listener` binds eagerly: [`Listener::new`] does not return until the
/// background accept thread has bound the port and is ready to accept (or
/// has failed to bind, in which case the error is returned to the caller
/// instead of a `Listener`).
pub struct Listener {
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
}

impl Listener {
    /// Binds `port` and starts accepting in a background thread. `limit` is
    /// the local buffer cap; `0` means unbounded.
    pub fn new(port: u16, limit: usize) -> Result<Self> {
        let shared = Arc::new(Shared {
            port: AtomicU16::new(port),
            limit: AtomicUsize::new(limit),
            buffer: Mutex::new(VecDeque::new()),
            gate: Gate::new(),
            last_bind_error: Mutex::new(None),
        });

        let (ready_tx, ready_rx) = oneshot::channel();
        let thread_shared = Arc::clone(&shared);
        let thread = thread::Builder::new()
            .name(format!("tcpmux-listener-{port}"))
            .spawn(move || accept_loop(thread_shared, ready_tx))
            .expect("failed to spawn listener accept thread");

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = thread.join();
                return Err(Error::BindFailed { port, source: e });
            }
            Err(_) => {
                return Err(Error::InvariantViolation(
                    "listener accept thread exited before signaling readiness".to_string(),
                ));
            }
        }

        Ok(Self {
            shared,
            thread: Some(thread),
        })
    }

    /// Removes and returns the oldest buffered connection, if any. Never blocks.
    pub fn pull_one(&self) -> Option<Connection> {
        self.shared
            .buffer
            .lock()
            .expect("listener buffer mutex poisoned")
            .pop_front()
    }

    /// Current buffer depth.
    pub fn size(&self) -> usize {
        self.shared
            .buffer
            .lock()
            .expect("listener buffer mutex poisoned")
            .len()
    }

    /// The port this listener is currently bound to (or attempting to bind to).
    pub fn port(&self) -> u16 {
        self.shared.port.load(Ordering::Relaxed)
    }

    /// Live port change. Pauses the accept loop, updates the port, resumes
    /// it, and reports a bind failure from the resulting rebind if one
    /// occurred. Connections already buffered under the old port are kept
    /// and retain their original `Connection::port()`.
    pub fn set_port(&self, port: u16) -> Result<()> {
        self.shared.gate.disable();
        self.shared.port.store(port, Ordering::Relaxed);
        self.shared.gate.enable();
        self.take_bind_error(port)
    }

    /// The local buffer cap; `0` means unbounded.
    pub fn limit(&self) -> usize {
        self.shared.limit.load(Ordering::Relaxed)
    }

    /// Live buffer cap change. Already-buffered connections in excess of a
    /// lowered limit are kept; the limit only gates future pushes.
    pub fn set_limit(&self, limit: usize) {
        self.shared.gate.disable();
        self.shared.limit.store(limit, Ordering::Relaxed);
        self.shared.gate.enable();
    }

    /// Pauses the accept loop. Blocks until the in-flight accept cycle has
    /// completed and the loop has observably parked. Idempotent.
    pub fn disable(&self) {
        self.shared.gate.disable();
    }

    /// Resumes a paused accept loop, reporting a bind failure from the
    /// resulting rebind if one occurred. Blocks until the loop has observably
    /// resumed. Idempotent.
    pub fn enable(&self) -> Result<()> {
        let port = self.port();
        self.shared.gate.enable();
        self.take_bind_error(port)
    }

    /// Whether the accept loop is currently running (as opposed to paused,
    /// pausing, or stopped).
    pub fn is_enabled(&self) -> bool {
        self.shared.gate.is_enabled()
    }

    /// Reports a bind failure from *this call's own* rebind, if one is
    /// parked for `port`. A live rebind happens on the background accept
    /// thread after `disable`/`enable` have already returned (see
    /// `Gate::checkpoint`'s `Resuming` branch, which unblocks the caller
    /// before the corresponding `bind_listener` call even starts), so a
    /// failure parked here may belong to an earlier, unrelated rebind rather
    /// than this one. Only an error parked for the exact `port` passed in is
    /// ever surfaced; a mismatched entry is stale and is discarded rather
    /// than misattributed to this call.
    fn take_bind_error(&self, port: u16) -> Result<()> {
        let mut guard = self
            .shared
            .last_bind_error
            .lock()
            .expect("bind error mutex poisoned");
        match guard.take() {
            Some((err_port, source)) if err_port == port => Err(Error::BindFailed { port, source }),
            Some((stale_port, stale_error)) => {
                event!(
                    Level::WARN,
                    message = "discarding stale bind error from an earlier rebind",
                    stale_port,
                    current_port = port,
                    error = %stale_error
                );
                Ok(())
            }
            None => Ok(()),
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.shared.gate.stop();
        if let Some(thread) = self.thread.take() {
            let port = self.port();
            if thread.join().is_err() {
                event!(
                    Level::ERROR,
                    message = "listener accept thread panicked during shutdown",
                    port
                );
            }
        }
    }
}

fn bind_listener(port: u16) -> io::Result<StdTcpListener> {
    let address: SocketAddr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port).into();
    let socket = Socket::new(Domain::IPV4, Type::STREAM, None)?;
    socket.set_reuse_address(true)?;
    socket.bind(&address.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

/// The accept loop run by the listener's background thread. Each full cycle
/// rebinds on the current port (so `set_port` takes effect on the next
/// cycle), accepts exactly one socket, then hands it to the buffer or
/// rejects it with the apology banner if the buffer is full.
fn accept_loop(shared: Arc<Shared>, ready_tx: oneshot::Sender<io::Result<()>>) {
    let mut ready_tx = Some(ready_tx);

    'outer: loop {
        if shared.gate.checkpoint() == Checkpoint::Stop {
            return;
        }

        let port = shared.port.load(Ordering::Relaxed);
        let std_listener = match bind_listener(port) {
            Ok(listener) => listener,
            Err(e) => {
                event!(
                    Level::ERROR,
                    message = "failed to bind listener port",
                    port,
                    error = %e
                );
                if let Some(tx) = ready_tx.take() {
                    // First bind: the error is reported synchronously to the constructor.
                    let _ = tx.send(Err(e));
                    return;
                }
                // Live rebind (from set_port/enable): park paused and let the
                // error surface at the next enable()/set_port() call for
                // this same port.
                *shared
                    .last_bind_error
                    .lock()
                    .expect("bind error mutex poisoned") = Some((port, e));
                shared.gate.force_pause();
                continue;
            }
        };

        if let Some(tx) = ready_tx.take() {
            let _ = tx.send(Ok(()));
        }

        event!(Level::TRACE, message = "accepting on port", port);

        // Each non-blocking poll is a safe place to park: nothing irrevocable
        // is in flight, so a pause requested while we are waiting for the
        // next client takes effect immediately instead of only at cycle
        // boundaries. A resume found here may have brought a new port/limit
        // with it, so we break back out to the top of the outer loop to
        // rebind rather than keep accepting on the (possibly stale) socket.
        let socket = 'accept: loop {
            match shared.gate.checkpoint() {
                Checkpoint::Stop => return,
                Checkpoint::Resumed => continue 'outer,
                Checkpoint::Continue => {}
            }
            match std_listener.accept() {
                Ok((socket, _peer)) => break 'accept socket,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(ACCEPT_POLL_INTERVAL);
                }
                Err(e) => {
                    event!(
                        Level::ERROR,
                        message = "transient accept error, retrying",
                        port,
                        error = %e
                    );
                    thread::sleep(ACCEPT_POLL_INTERVAL);
                }
            }
        };

        let connection = Connection::new(socket, port);
        let limit = shared.limit.load(Ordering::Relaxed);
        let mut buffer = shared.buffer.lock().expect("listener buffer mutex poisoned");

        if limit == 0 || buffer.len() < limit {
            buffer.push_back(connection);
        } else {
            drop(buffer);
            event!(
                Level::DEBUG,
                message = "local buffer full, rejecting connection",
                port
            );
            connection.reject();
        }
    }
}
