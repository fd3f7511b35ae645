use std::io::Write;
use std::net::TcpStream;

/// The literal apology banner written to a peer whose connection is rejected
/// because the buffer it would have landed in is full. Exactly 5 ASCII bytes,
/// no terminator.
pub(crate) const APOLOGY_BANNER: &[u8] = b"Sorry";

/// An accepted TCP connection, handed from a [`crate::Listener`] through a
/// [`crate::Queue`] to a [`crate::Server`] worker and finally to the
/// user-supplied handler.
///
/// A `Connection` has exactly one owner at any instant. It is moved between
/// components, never shared; the socket it wraps is closed when the owner
/// drops it.
#[derive(Debug)]
pub struct Connection {
    socket: TcpStream,
    port: u16,
}

impl Connection {
    pub(crate) fn new(socket: TcpStream, port: u16) -> Self {
        Self { socket, port }
    }

    /// The port this connection was accepted on.
    ///
    /// If the owning [`crate::Listener`] has since had its port changed with
    /// `set_port`, buffered connections are never retroactively relabelled:
    /// this value always reflects the port at accept time.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Borrows the underlying socket.
    pub fn socket(&self) -> &TcpStream {
        &self.socket
    }

    /// Mutably borrows the underlying socket.
    pub fn socket_mut(&mut self) -> &mut TcpStream {
        &mut self.socket
    }

    /// Consumes the connection, returning the underlying socket.
    pub fn into_socket(self) -> TcpStream {
        self.socket
    }

    /// Writes the apology banner and closes the socket. Used by the
    /// back-pressure rejection path in [`crate::Listener`] and [`crate::Queue`].
    /// A failed write does not retry; the socket is closed either way.
    pub(crate) fn reject(mut self) {
        let _ = self.socket.write_all(APOLOGY_BANNER);
        let _ = self.socket.shutdown(std::net::Shutdown::Both);
    }
}
