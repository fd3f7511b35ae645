//! An embeddable multi-port TCP accept/dispatch runtime.
//!
//! Three layered components, each usable on its own:
//!
//! - [`Listener`] binds one port, accepts on a background thread, and buffers
//!   accepted connections up to a local cap.
//! - [`Queue`] multiplexes any number of `Listener`s into one globally
//!   bounded FIFO, draining them round-robin.
//! - [`Server`] wraps a `Queue` with a bounded worker pool that dispatches
//!   exactly one connection per handler invocation.
//!
//! All three are live-reconfigurable: ports, buffer caps, worker caps, and
//! pause/resume all take effect without tearing the runtime down.

mod connection;
mod error;
mod gate;
mod listener;
mod queue;
mod server;

pub use connection::Connection;
pub use error::{Error, Result};
pub use listener::Listener;
pub use queue::Queue;
pub use server::Server;
