use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};

use tokio_util::sync::CancellationToken;

use tracing::debug;

use super::{DatagramSocket, IoFuture, StreamSocket, closed_error};

/// A datagram socket restricted to a single peer, seen as a stream of
/// records.
///
/// Lets a secure layer run a `DTLS` handshake over a datagram socket.
/// Datagrams coming from other peers are discarded.
#[derive(Debug)]
pub struct DatagramStream {
    socket: Arc<dyn DatagramSocket>,
    peer: SocketAddr,
    // A datagram received before the stream was created.
    first: Mutex<Option<Vec<u8>>>,
    closed: CancellationToken,
}

impl DatagramStream {
    /// Creates a [`DatagramStream`] towards `peer`.
    #[must_use]
    pub fn new(socket: Arc<dyn DatagramSocket>, peer: SocketAddr) -> Self {
        Self {
            socket,
            peer,
            first: Mutex::new(None),
            closed: CancellationToken::new(),
        }
    }

    /// Delivers `datagram` as the first received record.
    #[must_use]
    pub fn first_datagram(self, datagram: Vec<u8>) -> Self {
        *self.first.lock().unwrap_or_else(PoisonError::into_inner) = Some(datagram);
        self
    }
}

impl StreamSocket for DatagramStream {
    fn recv<'a>(&'a self, buf: &'a mut [u8]) -> IoFuture<'a, usize> {
        Box::pin(async move {
            let first = self
                .first
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            if let Some(datagram) = first {
                let size = datagram.len().min(buf.len());
                buf[..size].copy_from_slice(&datagram[..size]);
                return Ok(size);
            }

            loop {
                let (size, from) = tokio::select! {
                    () = self.closed.cancelled() => return Err(closed_error()),
                    received = self.socket.recv_from(buf) => received?,
                };

                if from == self.peer {
                    return Ok(size);
                }
                debug!("Discard datagram from `{from}`, bound to `{}`", self.peer);
            }
        })
    }

    fn send<'a>(&'a self, data: &'a [u8]) -> IoFuture<'a, usize> {
        Box::pin(async move {
            if self.closed.is_cancelled() {
                return Err(closed_error());
            }
            self.socket.send_to(data, self.peer).await
        })
    }

    fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    fn local_addr(&self) -> SocketAddr {
        self.socket.local_addr()
    }

    // The shared socket stays open.
    fn close(&self) {
        self.closed.cancel();
    }
}

#[cfg(test)]
mod tests {
    use crate::transport::{MemoryTransport, Transport};

    use super::*;

    #[tokio::test]
    async fn single_peer() {
        let transport = MemoryTransport::new();
        let server = transport.bind_datagram(5684).await.unwrap();
        let peer = transport.bind_datagram(0).await.unwrap();
        let intruder = transport.bind_datagram(0).await.unwrap();

        let stream = DatagramStream::new(server.clone(), peer.local_addr())
            .first_datagram(b"hello".to_vec());

        let mut buf = [0; 16];
        let size = stream.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..size], b"hello");

        let _ = intruder.send_to(b"noise", server.local_addr()).await.unwrap();
        let _ = peer.send_to(b"record", server.local_addr()).await.unwrap();
        let size = stream.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..size], b"record");

        let _ = stream.send(b"reply").await.unwrap();
        let (size, from) = peer.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..size], b"reply");
        assert_eq!(from, server.local_addr());

        // The shared socket outlives the stream.
        stream.close();
        assert!(stream.recv(&mut buf).await.is_err());
        assert!(server.send_to(b"still", peer.local_addr()).await.is_ok());
    }
}
