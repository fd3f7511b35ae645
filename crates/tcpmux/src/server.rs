use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{event, Level};

use crate::connection::Connection;
use crate::error::Result;
use crate::gate::{Checkpoint, Gate};
use crate::queue::Queue;

/// How long the dispatch thread sleeps when the queue has nothing to pull or
/// the worker pool is already at its cap, so an idle server does not spin.
const DISPATCH_IDLE_SLEEP: Duration = Duration::from_millis(5);

type Handler = dyn Fn(Connection) + Send + Sync + 'static;

struct Shared {
    queue: Queue,
    handler: Arc<Handler>,
    limit_executor: AtomicUsize,
    /// Shuts the dispatch thread down on `Drop`. The Server has no pause
    /// state of its own — `enable`/`disable`/`is_enabled` inherit the
    /// underlying `Queue`'s control surface — so only the `Stopping`
    /// transition of this gate is ever used.
    gate: Gate,
}

/// Wraps a [`Queue`] with a bounded worker pool that dispatches exactly one
/// connection per handler invocation.
///
/// The dispatch thread reaps finished workers, then — while under the
/// executor cap — pulls at most one connection from the queue and spawns a
/// worker thread to run the handler on it. A handler panic is caught and
/// logged; it never brings down the dispatch thread or another worker.
///
/// `Server` inherits the `Queue`'s control surface: `enable`/`disable`/
/// `is_enabled` act on every `Listener` in the underlying queue, same as
/// calling them on the `Queue` directly.
pub struct Server {
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
}

impl Server {
    /// Builds a [`Queue`] over `ports` and starts dispatching connections to
    /// `handler`. The worker cap defaults to
    /// [`std::thread::available_parallelism`].
    pub fn new<F>(ports: &[u16], handler: F) -> Result<Self>
    where
        F: Fn(Connection) + Send + Sync + 'static,
    {
        let default_limit = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);

        let shared = Arc::new(Shared {
            queue: Queue::new(ports)?,
            handler: Arc::new(handler),
            limit_executor: AtomicUsize::new(default_limit),
            gate: Gate::new(),
        });

        let (done_tx, done_rx) = crossbeam::channel::unbounded::<()>();
        let thread_shared = Arc::clone(&shared);
        let thread = thread::Builder::new()
            .name("tcpmux-server-dispatch".to_string())
            .spawn(move || dispatch_loop(thread_shared, done_tx, done_rx))
            .expect("failed to spawn server dispatch thread");

        event!(Level::DEBUG, message = "server constructed", worker_cap = default_limit);

        Ok(Self {
            shared,
            thread: Some(thread),
        })
    }

    /// Adds a `Listener` for `port` to the underlying queue, if not already present.
    pub fn add(&self, port: u16) -> Result<()> {
        self.shared.queue.add(port)
    }

    /// Removes the `Listener` for `port` from the underlying queue, if present.
    pub fn remove(&self, port: u16) {
        self.shared.queue.remove(port);
    }

    /// The ports currently registered, in insertion order.
    pub fn listeners(&self) -> Vec<u16> {
        self.shared.queue.listeners()
    }

    /// The subset of registered ports whose listener is currently enabled.
    pub fn active_listeners(&self) -> Vec<u16> {
        self.shared
            .queue
            .listeners()
            .into_iter()
            .filter(|&port| self.shared.queue.is_enabled_port(port))
            .collect()
    }

    /// Whether `port` currently has a listener registered.
    pub fn has(&self, port: u16) -> bool {
        self.shared.queue.has(port)
    }

    /// Enables the listener for `port`, if present.
    pub fn enable_port(&self, port: u16) -> Result<()> {
        self.shared.queue.enable_port(port)
    }

    /// Disables the listener for `port`, if present.
    pub fn disable_port(&self, port: u16) {
        self.shared.queue.disable_port(port);
    }

    /// Sets the buffer cap for the listener on `port`, if present.
    pub fn set_specific_limit(&self, port: u16, limit: usize) {
        self.shared.queue.set_specific_limit(port, limit);
    }

    /// The buffer cap for the listener on `port`, if present.
    pub fn get_specific_limit(&self, port: u16) -> Option<usize> {
        self.shared.queue.get_specific_limit(port)
    }

    /// Current depth of the underlying queue's global buffer.
    pub fn size(&self) -> usize {
        self.shared.queue.size()
    }

    /// The worker pool cap. `0` means unbounded.
    pub fn limit_executor(&self) -> usize {
        self.shared.limit_executor.load(Ordering::Relaxed)
    }

    /// Sets the worker pool cap. `0` means unbounded. Already-running workers
    /// are never interrupted; the new cap only gates future dispatch.
    pub fn set_limit_executor(&self, limit: usize) {
        self.shared.limit_executor.store(limit, Ordering::Relaxed);
    }

    /// The global buffer cap on the underlying queue; `0` means unbounded.
    pub fn limit_order(&self) -> usize {
        self.shared.queue.limit_order()
    }

    /// Sets the global buffer cap on the underlying queue; `0` means unbounded.
    pub fn set_limit_order(&self, limit: usize) {
        self.shared.queue.set_limit_order(limit);
    }

    /// Disables every `Listener` in the underlying queue (control flow
    /// propagates downward, Server → Queue → Listeners): no port accepts
    /// further connections, though already-buffered work and already-running
    /// workers are unaffected and the dispatch thread keeps draining it.
    /// Idempotent.
    pub fn disable(&self) {
        self.shared.queue.disable();
    }

    /// Re-enables every `Listener` in the underlying queue. Idempotent.
    pub fn enable(&self) {
        self.shared.queue.enable();
    }

    /// True iff at least one `Listener` in the underlying queue is currently
    /// enabled — inherited directly from `Queue::is_enabled`.
    pub fn is_enabled(&self) -> bool {
        self.shared.queue.is_enabled()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shared.gate.stop();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                event!(Level::ERROR, message = "server dispatch thread panicked during shutdown");
            }
        }
    }
}

fn dispatch_loop(
    shared: Arc<Shared>,
    done_tx: crossbeam::channel::Sender<()>,
    done_rx: crossbeam::channel::Receiver<()>,
) {
    let mut workers: Vec<JoinHandle<()>> = Vec::new();

    loop {
        if shared.gate.checkpoint() == Checkpoint::Stop {
            break;
        }

        // Reap every worker that has signaled completion since the last pass.
        let mut reaped = 0;
        while done_rx.try_recv().is_ok() {
            reaped += 1;
        }
        if reaped > 0 {
            let mut still_running = Vec::with_capacity(workers.len());
            for handle in workers.drain(..) {
                if handle.is_finished() {
                    if handle.join().is_err() {
                        event!(Level::ERROR, message = "connection handler panicked");
                    }
                } else {
                    still_running.push(handle);
                }
            }
            workers = still_running;
        }

        let cap = shared.limit_executor.load(Ordering::Relaxed);
        let at_cap = cap != 0 && workers.len() >= cap;
        if at_cap {
            thread::sleep(DISPATCH_IDLE_SLEEP);
            continue;
        }

        let Some(connection) = shared.queue.pull_one() else {
            thread::sleep(DISPATCH_IDLE_SLEEP);
            continue;
        };

        let handler = Arc::clone(&shared.handler);
        let worker_done_tx = done_tx.clone();
        let port = connection.port();
        let handle = thread::Builder::new()
            .name(format!("tcpmux-worker-{port}"))
            .spawn(move || {
                let result = panic::catch_unwind(AssertUnwindSafe(|| handler(connection)));
                if result.is_err() {
                    event!(Level::ERROR, message = "connection handler panicked", port);
                }
                let _ = worker_done_tx.send(());
            })
            .expect("failed to spawn worker thread");
        workers.push(handle);
    }

    for handle in workers {
        if handle.join().is_err() {
            event!(Level::ERROR, message = "connection handler panicked during shutdown");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpStream;
    use std::sync::atomic::AtomicUsize as StdAtomicUsize;
    use std::sync::Mutex as StdMutex;

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
    fn dispatches_one_connection_per_handler_call() {
        let port = free_port();
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let worker_seen = Arc::clone(&seen);

        let server = Server::new(&[port], move |connection| {
            worker_seen.lock().unwrap().push(connection.port());
        })
        .unwrap();

        TcpStream::connect(("127.0.0.1", port)).unwrap();
        TcpStream::connect(("127.0.0.1", port)).unwrap();

        assert!(wait_for(|| seen.lock().unwrap().len() == 2, Duration::from_secs(2)));
        drop(server);
    }

    #[test]
    fn handler_panic_does_not_stop_dispatch() {
        let port = free_port();
        let calls = Arc::new(StdAtomicUsize::new(0));
        let worker_calls = Arc::clone(&calls);

        let server = Server::new(&[port], move |_connection| {
            let n = worker_calls.fetch_add(1, Ordering::SeqCst);
            if n == 0 {
                panic!("boom");
            }
        })
        .unwrap();

        TcpStream::connect(("127.0.0.1", port)).unwrap();
        assert!(wait_for(|| calls.load(Ordering::SeqCst) >= 1, Duration::from_secs(1)));

        TcpStream::connect(("127.0.0.1", port)).unwrap();
        assert!(wait_for(|| calls.load(Ordering::SeqCst) >= 2, Duration::from_secs(1)));

        drop(server);
    }

    #[test]
    fn executor_cap_bounds_concurrent_workers() {
        let port = free_port();
        let active = Arc::new(StdAtomicUsize::new(0));
        let max_seen = Arc::new(StdAtomicUsize::new(0));
        let worker_active = Arc::clone(&active);
        let worker_max = Arc::clone(&max_seen);

        let server = Server::new(&[port], move |_connection| {
            let now = worker_active.fetch_add(1, Ordering::SeqCst) + 1;
            worker_max.fetch_max(now, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(100));
            worker_active.fetch_sub(1, Ordering::SeqCst);
        })
        .unwrap();
        server.set_limit_executor(1);

        for _ in 0..4 {
            TcpStream::connect(("127.0.0.1", port)).unwrap();
        }

        thread::sleep(Duration::from_millis(600));
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
        drop(server);
    }

    #[test]
    fn disable_pauses_every_listener_without_dropping_queued_work() {
        let port = free_port();
        let calls = Arc::new(StdAtomicUsize::new(0));
        let worker_calls = Arc::clone(&calls);

        let server = Server::new(&[port], move |_connection| {
            worker_calls.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        // A connection accepted before `disable()` is genuine queued work:
        // it is still dispatched to the handler while the server is disabled.
        TcpStream::connect(("127.0.0.1", port)).unwrap();
        assert!(wait_for(|| calls.load(Ordering::SeqCst) == 1, Duration::from_secs(1)));

        server.disable();
        assert!(!server.is_enabled());
        assert!(!server.active_listeners().contains(&port));

        // `disable()` propagates down to the queue's listener, so a
        // connection opened while disabled is never accepted into any
        // buffer and the handler is never invoked for it.
        let _pending = TcpStream::connect(("127.0.0.1", port));
        thread::sleep(Duration::from_millis(100));
        assert_eq!(server.size(), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        server.enable();
        assert!(server.is_enabled());
        assert!(wait_for(|| calls.load(Ordering::SeqCst) == 2, Duration::from_secs(1)));
    }
}
