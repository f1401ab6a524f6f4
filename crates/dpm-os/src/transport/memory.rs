use std::collections::{HashMap, HashSet};
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio::time::Instant;

use tokio_util::sync::CancellationToken;

use super::{
    DatagramSocket, IoFuture, StreamListener, StreamSocket, Transport, closed_error,
};

// First port handed out when zero is requested.
const FIRST_EPHEMERAL_PORT: u16 = 49152;

const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

type Datagram = (Vec<u8>, SocketAddr);

#[derive(Debug, Default)]
struct Network {
    listeners: HashMap<u16, mpsc::UnboundedSender<Arc<dyn StreamSocket>>>,
    datagrams: HashMap<u16, mpsc::UnboundedSender<Datagram>>,
    // Local ports held by connected client streams.
    bound: HashSet<u16>,
    next_port: u16,
    attempts: Vec<(Instant, SocketAddr)>,
    streams: Vec<Arc<MemoryStream>>,
}

impl Network {
    fn ephemeral_port(&mut self) -> u16 {
        loop {
            let port = self.next_port.max(FIRST_EPHEMERAL_PORT);
            self.next_port = port.checked_add(1).unwrap_or(FIRST_EPHEMERAL_PORT);
            if !self.bound.contains(&port)
                && !self.listeners.contains_key(&port)
                && !self.datagrams.contains_key(&port)
            {
                return port;
            }
        }
    }
}

fn lock(network: &Mutex<Network>) -> MutexGuard<'_, Network> {
    network.lock().unwrap_or_else(PoisonError::into_inner)
}

/// An in-process network.
///
/// Every endpoint lives on the loopback address, and ports are the only
/// discriminant. Connecting to a port nobody listens on is refused, and
/// datagrams sent to an unbound port are lost.
///
/// Connection attempts and stream endpoints are recorded, so that the
/// behaviour of sessions can be inspected.
#[derive(Debug, Clone, Default)]
pub struct MemoryTransport {
    network: Arc<Mutex<Network>>,
}

impl MemoryTransport {
    /// Creates an empty [`MemoryTransport`].
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Instants of all connection attempts towards `port`.
    #[must_use]
    pub fn connect_attempts(&self, port: u16) -> Vec<Instant> {
        lock(&self.network)
            .attempts
            .iter()
            .filter(|(_, peer)| peer.port() == port)
            .map(|(instant, _)| *instant)
            .collect()
    }

    /// All stream endpoints created so far, in creation order.
    ///
    /// Both ends of every connection are included, client end first.
    #[must_use]
    pub fn streams(&self) -> Vec<Arc<MemoryStream>> {
        lock(&self.network).streams.clone()
    }

    /// Whether something listens on `port`.
    #[must_use]
    pub fn is_listening(&self, port: u16) -> bool {
        lock(&self.network).listeners.contains_key(&port)
    }
}

impl Transport for MemoryTransport {
    fn resolve<'a>(&'a self, host: &'a str, port: u16) -> IoFuture<'a, SocketAddr> {
        Box::pin(async move {
            if host == "localhost" {
                return Ok(SocketAddr::new(LOCALHOST, port));
            }
            host.parse::<IpAddr>()
                .map(|ip| SocketAddr::new(ip, port))
                .map_err(|_| io::Error::new(io::ErrorKind::NotFound, format!("unknown host `{host}`")))
        })
    }

    fn connect(
        &self,
        local_port: u16,
        peer: SocketAddr,
        _keepalive: bool,
    ) -> IoFuture<'_, Arc<dyn StreamSocket>> {
        Box::pin(async move {
            let mut network = lock(&self.network);
            network.attempts.push((Instant::now(), peer));

            if local_port != 0
                && (network.bound.contains(&local_port) || network.listeners.contains_key(&local_port))
            {
                return Err(io::Error::from(io::ErrorKind::AddrInUse));
            }

            let Some(listener) = network.listeners.get(&peer.port()).cloned() else {
                return Err(io::Error::from(io::ErrorKind::ConnectionRefused));
            };

            let port = if local_port == 0 {
                network.ephemeral_port()
            } else {
                local_port
            };
            let local = SocketAddr::new(LOCALHOST, port);
            let weak = Arc::downgrade(&self.network);

            let (client, server) = MemoryStream::pair(local, peer, weak);
            let client = Arc::new(client);
            let server = Arc::new(server);

            if listener.send(server.clone()).is_err() {
                let _ = network.listeners.remove(&peer.port());
                return Err(io::Error::from(io::ErrorKind::ConnectionRefused));
            }

            let _ = network.bound.insert(port);
            network.streams.push(client.clone());
            network.streams.push(server);

            let client: Arc<dyn StreamSocket> = client;
            Ok(client)
        })
    }

    fn listen(&self, port: u16) -> IoFuture<'_, Arc<dyn StreamListener>> {
        Box::pin(async move {
            let mut network = lock(&self.network);
            let port = if port == 0 {
                network.ephemeral_port()
            } else {
                port
            };

            if network.listeners.contains_key(&port) || network.bound.contains(&port) {
                return Err(io::Error::from(io::ErrorKind::AddrInUse));
            }

            let (sender, receiver) = mpsc::unbounded_channel();
            let _ = network.listeners.insert(port, sender);

            let listener: Arc<dyn StreamListener> = Arc::new(MemoryListener {
                local: SocketAddr::new(LOCALHOST, port),
                incoming: AsyncMutex::new(receiver),
                closed: CancellationToken::new(),
                network: Arc::downgrade(&self.network),
            });
            Ok(listener)
        })
    }

    fn bind_datagram(&self, port: u16) -> IoFuture<'_, Arc<dyn DatagramSocket>> {
        Box::pin(async move {
            let mut network = lock(&self.network);
            let port = if port == 0 {
                network.ephemeral_port()
            } else {
                port
            };

            if network.datagrams.contains_key(&port) {
                return Err(io::Error::from(io::ErrorKind::AddrInUse));
            }

            let (sender, receiver) = mpsc::unbounded_channel();
            let _ = network.datagrams.insert(port, sender);

            let socket: Arc<dyn DatagramSocket> = Arc::new(MemoryDatagram {
                local: SocketAddr::new(LOCALHOST, port),
                incoming: AsyncMutex::new(receiver),
                closed: CancellationToken::new(),
                network: Arc::downgrade(&self.network),
            });
            Ok(socket)
        })
    }
}

#[derive(Debug)]
struct Incoming {
    receiver: mpsc::UnboundedReceiver<Vec<u8>>,
    pending: Vec<u8>,
}

/// One end of an in-process stream connection.
#[derive(Debug)]
pub struct MemoryStream {
    local: SocketAddr,
    peer: SocketAddr,
    incoming: AsyncMutex<Incoming>,
    outgoing: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    closed: CancellationToken,
    // Set on client ends, which hold their local port.
    network: Option<Weak<Mutex<Network>>>,
}

impl MemoryStream {
    fn pair(local: SocketAddr, peer: SocketAddr, network: Weak<Mutex<Network>>) -> (Self, Self) {
        let (to_server, from_client) = mpsc::unbounded_channel();
        let (to_client, from_server) = mpsc::unbounded_channel();

        let client = Self::new(local, peer, from_server, to_server, Some(network));
        let server = Self::new(peer, local, from_client, to_client, None);
        (client, server)
    }

    fn new(
        local: SocketAddr,
        peer: SocketAddr,
        receiver: mpsc::UnboundedReceiver<Vec<u8>>,
        sender: mpsc::UnboundedSender<Vec<u8>>,
        network: Option<Weak<Mutex<Network>>>,
    ) -> Self {
        Self {
            local,
            peer,
            incoming: AsyncMutex::new(Incoming {
                receiver,
                pending: Vec::new(),
            }),
            outgoing: Mutex::new(Some(sender)),
            closed: CancellationToken::new(),
            network,
        }
    }

    /// Whether this end has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    async fn receive(&self, buf: &mut [u8]) -> usize {
        let mut incoming = self.incoming.lock().await;

        if incoming.pending.is_empty() {
            match incoming.receiver.recv().await {
                Some(data) => incoming.pending = data,
                // Peer closed.
                None => return 0,
            }
        }

        let size = incoming.pending.len().min(buf.len());
        buf[..size].copy_from_slice(&incoming.pending[..size]);
        let _ = incoming.pending.drain(..size);
        size
    }
}

impl StreamSocket for MemoryStream {
    fn recv<'a>(&'a self, buf: &'a mut [u8]) -> IoFuture<'a, usize> {
        Box::pin(async move {
            tokio::select! {
                () = self.closed.cancelled() => Err(closed_error()),
                size = self.receive(buf) => Ok(size),
            }
        })
    }

    fn send<'a>(&'a self, data: &'a [u8]) -> IoFuture<'a, usize> {
        Box::pin(async move {
            if self.closed.is_cancelled() {
                return Err(closed_error());
            }
            let outgoing = self.outgoing.lock().unwrap_or_else(PoisonError::into_inner);
            match outgoing.as_ref() {
                Some(sender) if sender.send(data.to_vec()).is_ok() => Ok(data.len()),
                _ => Err(io::Error::from(io::ErrorKind::BrokenPipe)),
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
        // Dropping the sender lets the peer observe the close.
        drop(
            self.outgoing
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take(),
        );
        if let Some(network) = self.network.as_ref().and_then(Weak::upgrade) {
            let _ = lock(&network).bound.remove(&self.local.port());
        }
    }
}

#[derive(Debug)]
struct MemoryListener {
    local: SocketAddr,
    incoming: AsyncMutex<mpsc::UnboundedReceiver<Arc<dyn StreamSocket>>>,
    closed: CancellationToken,
    network: Weak<Mutex<Network>>,
}

impl StreamListener for MemoryListener {
    fn accept(&self) -> IoFuture<'_, Arc<dyn StreamSocket>> {
        Box::pin(async move {
            tokio::select! {
                () = self.closed.cancelled() => Err(closed_error()),
                accepted = async { self.incoming.lock().await.recv().await } => {
                    accepted.ok_or_else(closed_error)
                }
            }
        })
    }

    fn local_addr(&self) -> SocketAddr {
        self.local
    }

    fn close(&self) {
        self.closed.cancel();
        if let Some(network) = self.network.upgrade() {
            let _ = lock(&network).listeners.remove(&self.local.port());
        }
    }
}

#[derive(Debug)]
struct MemoryDatagram {
    local: SocketAddr,
    incoming: AsyncMutex<mpsc::UnboundedReceiver<Datagram>>,
    closed: CancellationToken,
    network: Weak<Mutex<Network>>,
}

impl DatagramSocket for MemoryDatagram {
    fn recv_from<'a>(&'a self, buf: &'a mut [u8]) -> IoFuture<'a, (usize, SocketAddr)> {
        Box::pin(async move {
            tokio::select! {
                () = self.closed.cancelled() => Err(closed_error()),
                received = async { self.incoming.lock().await.recv().await } => {
                    let (data, from) = received.ok_or_else(closed_error)?;
                    // Excess bytes of a datagram are discarded.
                    let size = data.len().min(buf.len());
                    buf[..size].copy_from_slice(&data[..size]);
                    Ok((size, from))
                }
            }
        })
    }

    fn send_to<'a>(&'a self, data: &'a [u8], peer: SocketAddr) -> IoFuture<'a, usize> {
        Box::pin(async move {
            if self.closed.is_cancelled() {
                return Err(closed_error());
            }
            let Some(network) = self.network.upgrade() else {
                return Err(closed_error());
            };
            if let Some(sender) = lock(&network).datagrams.get(&peer.port()) {
                let _ = sender.send((data.to_vec(), self.local));
            }
            Ok(data.len())
        })
    }

    fn local_addr(&self) -> SocketAddr {
        self.local
    }

    fn close(&self) {
        self.closed.cancel();
        if let Some(network) = self.network.upgrade() {
            let _ = lock(&network).datagrams.remove(&self.local.port());
        }
    }
}
