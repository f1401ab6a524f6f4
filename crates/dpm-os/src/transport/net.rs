use std::future::poll_fn;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll, ready};

use tokio::io::ReadBuf;
use tokio::net::{TcpListener, TcpSocket, TcpStream, UdpSocket};

use tokio_util::sync::CancellationToken;

use super::{
    DatagramSocket, IoFuture, StreamListener, StreamSocket, Transport, closed_error,
};

// Pending connections a listener queues.
const LISTEN_BACKLOG: u32 = 4;

#[inline]
fn unspecified(peer: SocketAddr, port: u16) -> SocketAddr {
    if peer.is_ipv4() {
        SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), port)
    } else {
        SocketAddr::new(Ipv6Addr::UNSPECIFIED.into(), port)
    }
}

/// A [`Transport`] over the `tokio` socket stack.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioTransport;

impl TokioTransport {
    /// Creates a [`TokioTransport`].
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl Transport for TokioTransport {
    fn resolve<'a>(&'a self, host: &'a str, port: u16) -> IoFuture<'a, SocketAddr> {
        Box::pin(async move {
            tokio::net::lookup_host((host, port))
                .await?
                .next()
                .ok_or_else(|| {
                    io::Error::new(io::ErrorKind::NotFound, format!("no address for `{host}`"))
                })
        })
    }

    fn connect(
        &self,
        local_port: u16,
        peer: SocketAddr,
        keepalive: bool,
    ) -> IoFuture<'_, Arc<dyn StreamSocket>> {
        Box::pin(async move {
            let socket = if peer.is_ipv4() {
                TcpSocket::new_v4()?
            } else {
                TcpSocket::new_v6()?
            };

            if local_port != 0 {
                socket.set_reuseaddr(true)?;
                socket.bind(unspecified(peer, local_port))?;
            }
            socket.set_keepalive(keepalive)?;

            let stream = socket.connect(peer).await?;
            let stream: Arc<dyn StreamSocket> = Arc::new(TokioStream::new(stream)?);
            Ok(stream)
        })
    }

    fn listen(&self, port: u16) -> IoFuture<'_, Arc<dyn StreamListener>> {
        Box::pin(async move {
            let socket = TcpSocket::new_v4()?;
            socket.set_reuseaddr(true)?;
            socket.bind(SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), port))?;

            let listener = socket.listen(LISTEN_BACKLOG)?;
            let local = listener.local_addr()?;
            let listener: Arc<dyn StreamListener> = Arc::new(TokioListener {
                listener: Mutex::new(Some(listener)),
                local,
                closed: CancellationToken::new(),
            });
            Ok(listener)
        })
    }

    fn bind_datagram(&self, port: u16) -> IoFuture<'_, Arc<dyn DatagramSocket>> {
        Box::pin(async move {
            let socket = UdpSocket::bind(SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), port)).await?;
            let local = socket.local_addr()?;
            let socket: Arc<dyn DatagramSocket> = Arc::new(TokioDatagram {
                socket: Mutex::new(Some(socket)),
                local,
                closed: CancellationToken::new(),
            });
            Ok(socket)
        })
    }
}

// Sockets are held behind an option so that closing releases them at once,
// even while an operation is pending.
type Slot<T> = Mutex<Option<T>>;

#[inline]
fn lock<T>(slot: &Slot<T>) -> MutexGuard<'_, Option<T>> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug)]
struct TokioStream {
    stream: Slot<TcpStream>,
    peer: SocketAddr,
    local: SocketAddr,
    closed: CancellationToken,
}

impl TokioStream {
    fn new(stream: TcpStream) -> io::Result<Self> {
        Ok(Self {
            peer: stream.peer_addr()?,
            local: stream.local_addr()?,
            stream: Mutex::new(Some(stream)),
            closed: CancellationToken::new(),
        })
    }

    fn poll_read(&self, cx: &mut Context<'_>, buf: &mut [u8]) -> Poll<io::Result<usize>> {
        let stream = lock(&self.stream);
        let Some(stream) = stream.as_ref() else {
            return Poll::Ready(Err(closed_error()));
        };

        loop {
            ready!(stream.poll_read_ready(cx))?;
            match stream.try_read(buf) {
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                result => return Poll::Ready(result),
            }
        }
    }

    fn poll_write(&self, cx: &mut Context<'_>, data: &[u8]) -> Poll<io::Result<usize>> {
        let stream = lock(&self.stream);
        let Some(stream) = stream.as_ref() else {
            return Poll::Ready(Err(closed_error()));
        };

        loop {
            ready!(stream.poll_write_ready(cx))?;
            match stream.try_write(data) {
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                result => return Poll::Ready(result),
            }
        }
    }
}

impl StreamSocket for TokioStream {
    fn recv<'a>(&'a self, buf: &'a mut [u8]) -> IoFuture<'a, usize> {
        Box::pin(async move {
            tokio::select! {
                () = self.closed.cancelled() => Err(closed_error()),
                received = poll_fn(|cx| self.poll_read(cx, buf)) => received,
            }
        })
    }

    fn send<'a>(&'a self, data: &'a [u8]) -> IoFuture<'a, usize> {
        Box::pin(async move {
            let mut sent = 0;
            let write_all = poll_fn(|cx| {
                while sent < data.len() {
                    match ready!(self.poll_write(cx, &data[sent..]))? {
                        0 => return Poll::Ready(Err(io::Error::from(io::ErrorKind::WriteZero))),
                        size => sent += size,
                    }
                }
                Poll::Ready(Ok(sent))
            });

            tokio::select! {
                () = self.closed.cancelled() => Err(closed_error()),
                written = write_all => written,
            }
        })
    }

    fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    fn local_addr(&self) -> SocketAddr {
        self.local
    }

    fn close(&self) {
        self.closed.cancel();
        drop(lock(&self.stream).take());
    }
}

#[derive(Debug)]
struct TokioListener {
    listener: Slot<TcpListener>,
    local: SocketAddr,
    closed: CancellationToken,
}

impl TokioListener {
    fn poll_accept(&self, cx: &mut Context<'_>) -> Poll<io::Result<TcpStream>> {
        match lock(&self.listener).as_ref() {
            Some(listener) => listener.poll_accept(cx).map_ok(|(stream, _)| stream),
            None => Poll::Ready(Err(closed_error())),
        }
    }
}

impl StreamListener for TokioListener {
    fn accept(&self) -> IoFuture<'_, Arc<dyn StreamSocket>> {
        Box::pin(async move {
            let stream = tokio::select! {
                () = self.closed.cancelled() => return Err(closed_error()),
                accepted = poll_fn(|cx| self.poll_accept(cx)) => accepted?,
            };
            let stream: Arc<dyn StreamSocket> = Arc::new(TokioStream::new(stream)?);
            Ok(stream)
        })
    }

    fn local_addr(&self) -> SocketAddr {
        self.local
    }

    fn close(&self) {
        self.closed.cancel();
        drop(lock(&self.listener).take());
    }
}

#[derive(Debug)]
struct TokioDatagram {
    socket: Slot<UdpSocket>,
    local: SocketAddr,
    closed: CancellationToken,
}

impl TokioDatagram {
    fn poll_recv_from(
        &self,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<io::Result<(usize, SocketAddr)>> {
        let socket = lock(&self.socket);
        let Some(socket) = socket.as_ref() else {
            return Poll::Ready(Err(closed_error()));
        };

        let mut read = ReadBuf::new(buf);
        let from = ready!(socket.poll_recv_from(cx, &mut read))?;
        Poll::Ready(Ok((read.filled().len(), from)))
    }

    fn poll_send_to(
        &self,
        cx: &mut Context<'_>,
        data: &[u8],
        peer: SocketAddr,
    ) -> Poll<io::Result<usize>> {
        match lock(&self.socket).as_ref() {
            Some(socket) => socket.poll_send_to(cx, data, peer),
            None => Poll::Ready(Err(closed_error())),
        }
    }
}

impl DatagramSocket for TokioDatagram {
    fn recv_from<'a>(&'a self, buf: &'a mut [u8]) -> IoFuture<'a, (usize, SocketAddr)> {
        Box::pin(async move {
            tokio::select! {
                () = self.closed.cancelled() => Err(closed_error()),
                received = poll_fn(|cx| self.poll_recv_from(cx, buf)) => received,
            }
        })
    }

    fn send_to<'a>(&'a self, data: &'a [u8], peer: SocketAddr) -> IoFuture<'a, usize> {
        Box::pin(async move {
            tokio::select! {
                () = self.closed.cancelled() => Err(closed_error()),
                sent = poll_fn(|cx| self.poll_send_to(cx, data, peer)) => sent,
            }
        })
    }

    fn local_addr(&self) -> SocketAddr {
        self.local
    }

    fn close(&self) {
        self.closed.cancel();
        drop(lock(&self.socket).take());
    }
}
