mod datagram;
mod memory;
mod net;

use std::fmt;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;

pub use datagram::DatagramStream;
pub use memory::{MemoryStream, MemoryTransport};
pub use net::TokioTransport;

/// A boxed future returned by the socket primitives.
pub type IoFuture<'a, T> = Pin<Box<dyn Future<Output = io::Result<T>> + Send + 'a>>;

/// A connected byte or record stream.
///
/// Implemented by `TCP` connections, by datagram sockets bound to one peer
/// and by the secure layers wrapping them.
pub trait StreamSocket: fmt::Debug + Send + Sync {
    /// Receives data into `buf`.
    ///
    /// Returns `Ok(0)` when the peer closed the connection.
    fn recv<'a>(&'a self, buf: &'a mut [u8]) -> IoFuture<'a, usize>;

    /// Sends `data`, returning the number of bytes sent.
    fn send<'a>(&'a self, data: &'a [u8]) -> IoFuture<'a, usize>;

    /// Address of the peer.
    fn peer_addr(&self) -> SocketAddr;

    /// Local address.
    fn local_addr(&self) -> SocketAddr;

    /// Closes the socket.
    ///
    /// Pending and later receive and send calls fail promptly.
    fn close(&self);
}

/// A listening stream socket.
pub trait StreamListener: fmt::Debug + Send + Sync {
    /// Accepts a new connection.
    fn accept(&self) -> IoFuture<'_, Arc<dyn StreamSocket>>;

    /// Local address.
    fn local_addr(&self) -> SocketAddr;

    /// Closes the listener.
    fn close(&self);
}

/// An unconnected datagram socket.
pub trait DatagramSocket: fmt::Debug + Send + Sync {
    /// Receives a datagram into `buf`, returning its size and sender.
    fn recv_from<'a>(&'a self, buf: &'a mut [u8]) -> IoFuture<'a, (usize, SocketAddr)>;

    /// Sends a datagram to `peer`.
    fn send_to<'a>(&'a self, data: &'a [u8], peer: SocketAddr) -> IoFuture<'a, usize>;

    /// Local address.
    fn local_addr(&self) -> SocketAddr;

    /// Closes the socket.
    fn close(&self);
}

/// The socket stack.
pub trait Transport: fmt::Debug + Send + Sync {
    /// Resolves a host name or an IP address.
    fn resolve<'a>(&'a self, host: &'a str, port: u16) -> IoFuture<'a, SocketAddr>;

    /// Connects to `peer` from `local_port`, or from an ephemeral port when
    /// `local_port` is zero.
    ///
    /// Enables the socket keepalive option when `keepalive` is set.
    fn connect(
        &self,
        local_port: u16,
        peer: SocketAddr,
        keepalive: bool,
    ) -> IoFuture<'_, Arc<dyn StreamSocket>>;

    /// Listens on `port`.
    fn listen(&self, port: u16) -> IoFuture<'_, Arc<dyn StreamListener>>;

    /// Binds a datagram socket on `port`, or on an ephemeral port when
    /// `port` is zero.
    fn bind_datagram(&self, port: u16) -> IoFuture<'_, Arc<dyn DatagramSocket>>;
}

#[inline]
pub(crate) fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "socket closed")
}
