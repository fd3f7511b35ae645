use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{event, Level};

use crate::connection::Connection;
use crate::error::Result;
use crate::gate::{Checkpoint, Gate};
use crate::listener::Listener;

/// How long the drain thread sleeps after a pass over every listener finds
/// nothing to pull, so an idle queue does not spin a full CPU core.
const DRAIN_IDLE_SLEEP: Duration = Duration::from_millis(5);

struct Shared {
    listeners: Mutex<Vec<(u16, Listener)>>,
    buffer: Mutex<VecDeque<Connection>>,
    limit_order: AtomicUsize,
    gate: Gate,
}

/// Multiplexes an arbitrary, dynamically mutable set of per-port [`Listener`]s
/// into one globally bounded FIFO.
///
/// The drain thread scans listeners in insertion order once per pass, pulling
/// at most one connection from each — round-robin fairness across ports —
/// and either appends the result to the global buffer or rejects it if the
/// global buffer is at its cap.
pub struct Queue {
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
}

impl Queue {
    /// Creates one [`Listener`] per distinct port in `ports` (duplicates are
    /// ignored after the first) and starts the drain thread.
    pub fn new(ports: &[u16]) -> Result<Self> {
        let mut listeners = Vec::new();
        for &port in ports {
            if listeners.iter().any(|(p, _)| *p == port) {
                continue;
            }
            listeners.push((port, Listener::new(port, 0)?));
        }

        let shared = Arc::new(Shared {
            listeners: Mutex::new(listeners),
            buffer: Mutex::new(VecDeque::new()),
            limit_order: AtomicUsize::new(0),
            gate: Gate::new(),
        });

        let thread_shared = Arc::clone(&shared);
        let thread = thread::Builder::new()
            .name("tcpmux-queue-drain".to_string())
            .spawn(move || drain_loop(thread_shared))
            .expect("failed to spawn queue drain thread");

        event!(Level::DEBUG, message = "queue constructed", ports = ?ports);

        Ok(Self {
            shared,
            thread: Some(thread),
        })
    }

    /// Adds a `Listener` for `port` if one is not already present. Idempotent.
    pub fn add(&self, port: u16) -> Result<()> {
        let mut listeners = self.shared.listeners.lock().expect("membership mutex poisoned");
        if listeners.iter().any(|(p, _)| *p == port) {
            return Ok(());
        }
        listeners.push((port, Listener::new(port, 0)?));
        event!(Level::DEBUG, message = "listener added", port);
        Ok(())
    }

    /// Adds a `Listener` for each port in `ports` not already present.
    pub fn add_many(&self, ports: &[u16]) -> Result<()> {
        for &port in ports {
            self.add(port)?;
        }
        Ok(())
    }

    /// Stops and drops the `Listener` for `port`, if present. Connections it
    /// had already handed to the queue's global buffer remain. Blocks until
    /// the removed listener's accept thread has joined.
    pub fn remove(&self, port: u16) {
        let mut listeners = self.shared.listeners.lock().expect("membership mutex poisoned");
        if let Some(index) = listeners.iter().position(|(p, _)| *p == port) {
            listeners.remove(index);
            event!(Level::DEBUG, message = "listener removed", port);
        }
    }

    /// Removes the `Listener` for each port in `ports`, if present.
    pub fn remove_many(&self, ports: &[u16]) {
        for &port in ports {
            self.remove(port);
        }
    }

    /// Removes and returns the oldest buffered connection, if any. Never blocks.
    pub fn pull_one(&self) -> Option<Connection> {
        self.shared
            .buffer
            .lock()
            .expect("queue buffer mutex poisoned")
            .pop_front()
    }

    /// Current depth of the global buffer.
    pub fn size(&self) -> usize {
        self.shared
            .buffer
            .lock()
            .expect("queue buffer mutex poisoned")
            .len()
    }

    /// The global buffer cap; `0` means unbounded.
    pub fn limit_order(&self) -> usize {
        self.shared.limit_order.load(Ordering::Relaxed)
    }

    /// Sets the global buffer cap; `0` means unbounded.
    pub fn set_limit_order(&self, limit: usize) {
        self.shared.limit_order.store(limit, Ordering::Relaxed);
    }

    /// Enables every listener currently in the queue. Bind failures from any
    /// resulting rebind are logged (not propagated — there is no single
    /// caller-meaningful error to return for an operation over N children).
    pub fn enable(&self) {
        let listeners = self.shared.listeners.lock().expect("membership mutex poisoned");
        for (port, listener) in listeners.iter() {
            if let Err(e) = listener.enable() {
                event!(Level::ERROR, message = "failed to re-enable listener", port, error = %e);
            }
        }
    }

    /// Disables every listener currently in the queue.
    pub fn disable(&self) {
        let listeners = self.shared.listeners.lock().expect("membership mutex poisoned");
        for (_, listener) in listeners.iter() {
            listener.disable();
        }
    }

    /// Enables the listener for `port`, if present.
    pub fn enable_port(&self, port: u16) -> Result<()> {
        let listeners = self.shared.listeners.lock().expect("membership mutex poisoned");
        if let Some((_, listener)) = listeners.iter().find(|(p, _)| *p == port) {
            listener.enable()?;
        }
        Ok(())
    }

    /// Disables the listener for `port`, if present.
    pub fn disable_port(&self, port: u16) {
        let listeners = self.shared.listeners.lock().expect("membership mutex poisoned");
        if let Some((_, listener)) = listeners.iter().find(|(p, _)| *p == port) {
            listener.disable();
        }
    }

    /// Enables the listener for each port in `ports` that is present.
    pub fn enable_many(&self, ports: &[u16]) -> Result<()> {
        for &port in ports {
            self.enable_port(port)?;
        }
        Ok(())
    }

    /// Disables the listener for each port in `ports` that is present.
    pub fn disable_many(&self, ports: &[u16]) {
        for &port in ports {
            self.disable_port(port);
        }
    }

    /// Whether `port` currently has a listener.
    pub fn has(&self, port: u16) -> bool {
        self.shared
            .listeners
            .lock()
            .expect("membership mutex poisoned")
            .iter()
            .any(|(p, _)| *p == port)
    }

    /// The ports currently in the queue, in insertion order.
    pub fn listeners(&self) -> Vec<u16> {
        self.shared
            .listeners
            .lock()
            .expect("membership mutex poisoned")
            .iter()
            .map(|(port, _)| *port)
            .collect()
    }

    /// Sets the buffer cap for the listener on `port`, if present.
    pub fn set_specific_limit(&self, port: u16, limit: usize) {
        let listeners = self.shared.listeners.lock().expect("membership mutex poisoned");
        if let Some((_, listener)) = listeners.iter().find(|(p, _)| *p == port) {
            listener.set_limit(limit);
        }
    }

    /// The buffer cap for the listener on `port`, if present.
    pub fn get_specific_limit(&self, port: u16) -> Option<usize> {
        self.shared
            .listeners
            .lock()
            .expect("membership mutex poisoned")
            .iter()
            .find(|(p, _)| *p == port)
            .map(|(_, listener)| listener.limit())
    }

    /// True iff at least one listener in the queue is currently enabled.
    /// Vacuously false for an empty queue.
    pub fn is_enabled(&self) -> bool {
        self.shared
            .listeners
            .lock()
            .expect("membership mutex poisoned")
            .iter()
            .any(|(_, listener)| listener.is_enabled())
    }

    /// Whether the listener for `port` is currently enabled. `false` if no
    /// listener is registered for `port`.
    pub fn is_enabled_port(&self, port: u16) -> bool {
        self.shared
            .listeners
            .lock()
            .expect("membership mutex poisoned")
            .iter()
            .find(|(p, _)| *p == port)
            .map(|(_, listener)| listener.is_enabled())
            .unwrap_or(false)
    }
}

impl Drop for Queue {
    fn drop(&mut self) {
        self.shared.gate.stop();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                event!(Level::ERROR, message = "queue drain thread panicked during shutdown");
            }
        }
    }
}

/// The drain thread: one round-robin pass over every listener per iteration,
/// pulling at most one connection each, merging the results into the global
/// buffer (or rejecting them if it is full). Acquires the membership lock
/// for the duration of a pass, consistent with the documented lock order
/// `membership ≻ listener-buffer ≻ queue-buffer`.
fn drain_loop(shared: Arc<Shared>) {
    loop {
        if shared.gate.checkpoint() == Checkpoint::Stop {
            return;
        }

        let mut pulled_any = false;
        {
            let listeners = shared.listeners.lock().expect("membership mutex poisoned");
            for (port, listener) in listeners.iter() {
                let Some(connection) = listener.pull_one() else {
                    continue;
                };
                pulled_any = true;

                let limit = shared.limit_order.load(Ordering::Relaxed);
                let mut buffer = shared.buffer.lock().expect("queue buffer mutex poisoned");
                if limit == 0 || buffer.len() < limit {
                    buffer.push_back(connection);
                } else {
                    drop(buffer);
                    event!(
                        Level::DEBUG,
                        message = "global buffer full, rejecting connection",
                        port
                    );
                    connection.reject();
                }
            }
        }

        if !pulled_any {
            thread::sleep(DRAIN_IDLE_SLEEP);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpStream;

    fn free_port() -> u16 {
        let socket = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        socket.local_addr().unwrap().port()
    }

    fn wait_for<F: Fn() -> bool>(f: F, timeout: Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        while std::time::Instant::now() < deadline {
            if f() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        f()
    }

    #[test]
    fn add_then_remove_clears_membership() {
        let queue = Queue::new(&[]).unwrap();
        let port = free_port();

        queue.add(port).unwrap();
        assert!(queue.has(port));
        assert_eq!(queue.listeners(), vec![port]);

        queue.remove(port);
        assert!(!queue.has(port));
        assert!(queue.listeners().is_empty());
    }

    #[test]
    fn round_robin_drains_every_port_per_pass() {
        let port_a = free_port();
        let port_b = free_port();
        let queue = Queue::new(&[port_a, port_b]).unwrap();

        TcpStream::connect(("127.0.0.1", port_a)).unwrap();
        TcpStream::connect(("127.0.0.1", port_b)).unwrap();
        TcpStream::connect(("127.0.0.1", port_a)).unwrap();

        assert!(wait_for(|| queue.size() == 3, Duration::from_secs(1)));

        let mut ports = Vec::new();
        while let Some(connection) = queue.pull_one() {
            ports.push(connection.port());
        }
        assert_eq!(ports.iter().filter(|&&p| p == port_a).count(), 2);
        assert_eq!(ports.iter().filter(|&&p| p == port_b).count(), 1);
    }

    #[test]
    fn global_limit_rejects_past_cap() {
        let port = free_port();
        let queue = Queue::new(&[port]).unwrap();
        queue.set_limit_order(1);

        let _a = TcpStream::connect(("127.0.0.1", port)).unwrap();
        let _b = TcpStream::connect(("127.0.0.1", port)).unwrap();

        assert!(wait_for(|| queue.size() == 1, Duration::from_secs(1)));
        thread::sleep(Duration::from_millis(100));
        assert_eq!(queue.size(), 1);
    }

    #[test]
    fn disable_preserves_buffered_work_across_pause() {
        let port = free_port();
        let queue = Queue::new(&[port]).unwrap();

        TcpStream::connect(("127.0.0.1", port)).unwrap();
        TcpStream::connect(("127.0.0.1", port)).unwrap();
        assert!(wait_for(|| queue.size() == 2, Duration::from_secs(1)));

        queue.disable();
        assert!(!queue.is_enabled());

        let _pending = TcpStream::connect(("127.0.0.1", port));
        thread::sleep(Duration::from_millis(50));
        assert_eq!(queue.size(), 2);

        queue.enable();
        assert!(queue.is_enabled());
        assert!(wait_for(|| queue.size() == 3, Duration::from_secs(1)));
    }

    #[test]
    fn is_enabled_is_vacuously_false_when_empty() {
        let queue = Queue::new(&[]).unwrap();
        assert!(!queue.is_enabled());
    }
}
