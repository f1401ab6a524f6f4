mod tcp_client;
mod tcp_server;
mod udp_client;
mod udp_server;

use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use dpm::config::{MAX_SUB_SESSIONS, SessionConfig, SessionKind};
use dpm::error::{DmError, Result};
use dpm::job::JobId;

use tokio::sync::{Mutex as AsyncMutex, Notify, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use tracing::{debug, info, warn};

use crate::callbacks::{ConnectEvent, RecvEvent, SharedSessionCallbacks};
use crate::coordinator::Coordinator;
use crate::events::DpmEvent;
use crate::manager::WeakManager;
use crate::report::ErrorReporter;
use crate::secure::{SecureContext, SecureProtocol, SecureProvider, SecureRole, TicketCache};
use crate::transport::{DatagramSocket, StreamListener, StreamSocket, Transport};

/// Time granted to a session task to come alive.
pub const START_CONFIRM_TIMEOUT: Duration = Duration::from_secs(5);

/// Default time granted to a session to stop before it is forcibly stopped.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(1);

/// Wait before reconnecting a client whose connection dropped.
pub const RECONNECT_WAIT: Duration = Duration::from_secs(5);

// Attempts and pause to bind a local port still held by a previous socket.
const BIND_RETRY_COUNT: u32 = 5;
const BIND_RETRY_WAIT: Duration = Duration::from_millis(500);

/// Run status of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RunStatus {
    /// No task is running.
    Stopped = 0,
    /// The task is creating its socket, or a client is connecting.
    Init = 1,
    /// A server waits for peers.
    WaitingAccept = 2,
    /// A connection has been established.
    Connected = 3,
    /// Data flows.
    Running = 4,
    /// The task is closing its sockets.
    GoingStop = 5,
    /// The task is about to be created.
    ReadyToCreate = 6,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Stopped => "stopped",
            Self::Init => "init",
            Self::WaitingAccept => "waiting accept",
            Self::Connected => "connected",
            Self::Running => "running",
            Self::GoingStop => "going stop",
            Self::ReadyToCreate => "ready to create",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Command {
    None,
    Stop,
    Restart,
}

impl Command {
    const fn into_error(self) -> DmError {
        match self {
            Self::Restart => DmError::RestartRequest,
            Self::None | Self::Stop => DmError::StopRequest,
        }
    }
}

// State a session task observed and the manager persists at sleep entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Observed {
    pub(crate) peer: Option<SocketAddr>,
    pub(crate) local_port: Option<u16>,
}

// What the manager lends to every session task.
#[derive(Clone)]
pub(crate) struct SessionEnv {
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) coordinator: Coordinator,
    pub(crate) reporter: ErrorReporter,
    pub(crate) secure_provider: Option<Arc<dyn SecureProvider>>,
    pub(crate) tickets: TicketCache,
    pub(crate) events: mpsc::Sender<DpmEvent>,
    pub(crate) manager: WeakManager,
}

struct SubSession {
    peer: SocketAddr,
    // Absent for plain datagram peers.
    socket: Option<Arc<dyn StreamSocket>>,
    reader: Option<JoinHandle<()>>,
    last_access: Instant,
}

impl SubSession {
    fn close(self) {
        if let Some(reader) = self.reader {
            reader.abort();
        }
        if let Some(socket) = self.socket {
            socket.close();
        }
    }
}

#[derive(Default)]
struct Link {
    stream: Option<Arc<dyn StreamSocket>>,
    listener: Option<Arc<dyn StreamListener>>,
    datagram: Option<Arc<dyn DatagramSocket>>,
    subs: Vec<SubSession>,
    keepalive: Option<JoinHandle<()>>,
}

impl Link {
    fn close(&mut self) {
        if let Some(keepalive) = self.keepalive.take() {
            keepalive.abort();
        }
        for sub in self.subs.drain(..) {
            sub.close();
        }
        if let Some(stream) = self.stream.take() {
            stream.close();
        }
        if let Some(listener) = self.listener.take() {
            listener.close();
        }
        if let Some(datagram) = self.datagram.take() {
            datagram.close();
        }
    }
}

// Outcome of a bounded receive.
enum Poll {
    Data(usize),
    Closed,
    Idle,
}

// Why a receive loop ended.
enum Exit {
    Command(Command),
    PeerClosed,
}

/// Snapshot of a session, for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    /// Session identifier.
    pub id: u8,
    /// Session kind, when the session has been started at least once.
    pub kind: Option<SessionKind>,
    /// Run status.
    pub status: RunStatus,
    /// Whether the session has been forcibly stopped.
    pub force_stopped: bool,
    /// Last observed peer.
    pub peer: Option<SocketAddr>,
    /// Local port in use.
    pub local_port: Option<u16>,
    /// Peers currently served, for server sessions.
    pub sub_sessions: Vec<SocketAddr>,
}

// The runtime of one session. Exactly one task drives its state machine,
// server sessions add one reader task per peer.
pub(crate) struct Session {
    id: u8,
    name: String,
    status: watch::Sender<RunStatus>,
    command: Mutex<Command>,
    command_posted: Notify,
    // Serializes receive and send.
    io: AsyncMutex<()>,
    link: Mutex<Link>,
    observed: Mutex<Observed>,
    config: Mutex<Option<SessionConfig>>,
    force_stopped: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Session {
    pub(crate) fn new(id: u8) -> Arc<Self> {
        let (status, _) = watch::channel(RunStatus::Stopped);
        Arc::new(Self {
            id,
            name: format!("DPM_SESS{id}"),
            status,
            command: Mutex::new(Command::None),
            command_posted: Notify::new(),
            io: AsyncMutex::new(()),
            link: Mutex::new(Link::default()),
            observed: Mutex::new(Observed::default()),
            config: Mutex::new(None),
            force_stopped: AtomicBool::new(false),
            task: Mutex::new(None),
        })
    }

    pub(crate) const fn id(&self) -> u8 {
        self.id
    }

    pub(crate) fn status(&self) -> RunStatus {
        *self.status.borrow()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<RunStatus> {
        self.status.subscribe()
    }

    pub(crate) fn is_force_stopped(&self) -> bool {
        self.force_stopped.load(Ordering::Acquire)
    }

    pub(crate) fn observed(&self) -> Observed {
        *lock(&self.observed)
    }

    // Seeds the observed state with what a previous boot persisted.
    pub(crate) fn restore(&self, config: &SessionConfig) {
        lock(&self.observed).peer = config.peer;
    }

    pub(crate) fn info(&self) -> SessionInfo {
        let observed = self.observed();
        SessionInfo {
            id: self.id,
            kind: lock(&self.config).as_ref().map(|config| config.kind),
            status: self.status(),
            force_stopped: self.is_force_stopped(),
            peer: observed.peer,
            local_port: observed.local_port,
            sub_sessions: lock(&self.link).subs.iter().map(|sub| sub.peer).collect(),
        }
    }

    fn set_status(&self, status: RunStatus) {
        let previous = self.status.send_replace(status);
        if previous != status {
            debug!("Session `{}`: {previous} -> {status}", self.id);
        }
    }

    fn post(&self, command: Command) {
        *lock(&self.command) = command;
        self.command_posted.notify_one();
    }

    fn take_command(&self) -> Command {
        std::mem::replace(&mut *lock(&self.command), Command::None)
    }

    fn observe_peer(&self, peer: SocketAddr) {
        lock(&self.observed).peer = Some(peer);
    }

    fn observe_local_port(&self, port: Option<u16>) {
        lock(&self.observed).local_port = port;
    }

    fn close_link(&self) {
        lock(&self.link).close();
    }

    // Sleeps for `duration` unless a command is posted meanwhile.
    async fn pause(&self, duration: Duration) -> Option<Command> {
        let deadline = Instant::now() + duration;
        loop {
            let command = self.take_command();
            if command != Command::None {
                return Some(command);
            }

            tokio::select! {
                () = tokio::time::sleep_until(deadline) => return None,
                () = self.command_posted.notified() => {}
            }
        }
    }

    async fn receive(
        &self,
        socket: &dyn StreamSocket,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Poll {
        let received = tokio::time::timeout(timeout, socket.recv(buf)).await;
        // A send in progress completes before the data is handed out.
        let _io = self.io.lock().await;
        match received {
            Err(_) => Poll::Idle,
            Ok(Ok(0)) => Poll::Closed,
            Ok(Ok(size)) => Poll::Data(size),
            Ok(Err(e)) => {
                debug!("Session `{}`: receive from `{}` failed: {e}", self.id, socket.peer_addr());
                Poll::Closed
            }
        }
    }

    async fn receive_from(
        &self,
        socket: &dyn DatagramSocket,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<Option<(usize, SocketAddr)>> {
        let received = tokio::time::timeout(timeout, socket.recv_from(buf)).await;
        let _io = self.io.lock().await;
        match received {
            Err(_) => Ok(None),
            Ok(Ok(received)) => Ok(Some(received)),
            Ok(Err(e)) if e.kind() == io::ErrorKind::NotConnected => Err(DmError::NotConnected),
            Ok(Err(e)) => {
                // Datagram errors, such as an unreachable port, are transient.
                debug!("Session `{}`: datagram receive failed: {e}", self.id);
                Ok(None)
            }
        }
    }

    pub(crate) async fn start(
        self: &Arc<Self>,
        config: SessionConfig,
        callbacks: SharedSessionCallbacks,
        env: SessionEnv,
    ) -> Result<()> {
        config.validate()?;

        let mut status = self.subscribe();
        if !matches!(self.status(), RunStatus::Stopped) {
            debug!("Session `{}` already started", self.id);
            return Ok(());
        }

        self.force_stopped.store(false, Ordering::Release);
        *lock(&self.command) = Command::None;
        *lock(&self.config) = Some(config.clone());
        self.set_status(RunStatus::ReadyToCreate);

        let handle = tokio::spawn(run(self.clone(), config, callbacks, env));
        if let Some(previous) = lock(&self.task).replace(handle) {
            previous.abort();
        }

        let confirmed = tokio::time::timeout(
            START_CONFIRM_TIMEOUT,
            status.wait_for(|status| *status != RunStatus::ReadyToCreate),
        )
        .await;

        // A task failing right away reports its own error.
        match confirmed {
            Ok(Ok(_)) => Ok(()),
            _ => Err(DmError::TaskCreateFail),
        }
    }

    // Tears the session down without waiting for its task.
    pub(crate) fn abort(&self) {
        if let Some(task) = lock(&self.task).take() {
            task.abort();
        }
        self.close_link();
        self.set_status(RunStatus::Stopped);
    }

    pub(crate) async fn stop(&self, timeout: Duration) -> Result<()> {
        let mut status = self.subscribe();
        if matches!(self.status(), RunStatus::Stopped) {
            drop(lock(&self.task).take());
            return Ok(());
        }

        // A task being created must come alive before it can be asked to stop.
        let _ = tokio::time::timeout(
            START_CONFIRM_TIMEOUT,
            status.wait_for(|status| *status != RunStatus::ReadyToCreate),
        )
        .await;

        self.post(Command::Stop);
        let stopped =
            tokio::time::timeout(timeout, status.wait_for(|status| *status == RunStatus::Stopped))
                .await;

        if matches!(stopped, Ok(Ok(_))) {
            drop(lock(&self.task).take());
            info!("Session `{}` stopped", self.id);
            return Ok(());
        }

        warn!("Session `{}` did not stop within {timeout:?}, force it", self.id);
        if let Some(task) = lock(&self.task).take() {
            task.abort();
        }
        self.close_link();
        self.force_stopped.store(true, Ordering::Release);
        self.set_status(RunStatus::Stopped);
        Err(DmError::ForceStopped)
    }

    pub(crate) async fn send(&self, ip: IpAddr, port: u16, data: &[u8]) -> Result<usize> {
        if self.is_force_stopped() {
            return Err(DmError::ForceStopped);
        }

        let mut status = self.subscribe();
        let _ = tokio::time::timeout(
            START_CONFIRM_TIMEOUT,
            status.wait_for(|status| *status != RunStatus::ReadyToCreate),
        )
        .await;
        if matches!(self.status(), RunStatus::Stopped) {
            return Err(DmError::NotConnected);
        }

        let Some(config) = lock(&self.config).clone() else {
            return Err(DmError::NotConnected);
        };

        let _io = self.io.lock().await;
        let target = SocketAddr::new(ip, port);

        let sent = match config.kind {
            SessionKind::TcpClient => {
                let stream = lock(&self.link).stream.clone();
                let Some(stream) = stream else {
                    return Err(DmError::NotConnected);
                };
                stream.send(data).await
            }
            SessionKind::TcpServer => {
                let Some(socket) = self.sub_socket(target) else {
                    return Err(DmError::NotFoundSubSession);
                };
                socket.send(data).await
            }
            SessionKind::UdpServer => {
                if let Some(socket) = self.sub_socket(target) {
                    socket.send(data).await
                } else {
                    let known = lock(&self.link).subs.iter().any(|sub| sub.peer == target);
                    let datagram = lock(&self.link).datagram.clone();
                    match datagram {
                        Some(datagram) if known => datagram.send_to(data, target).await,
                        Some(_) => return Err(DmError::NotFoundSubSession),
                        None => return Err(DmError::NotConnected),
                    }
                }
            }
            SessionKind::UdpClient => {
                let target = if ip.is_unspecified() && port == 0 {
                    match self.observed().peer {
                        Some(peer) => peer,
                        None => return Err(DmError::NotConnected),
                    }
                } else {
                    target
                };

                let (stream, datagram) = {
                    let link = lock(&self.link);
                    (link.stream.clone(), link.datagram.clone())
                };
                match (stream, datagram) {
                    // A secure client only talks to its server.
                    (Some(stream), _) => stream.send(data).await,
                    (None, Some(datagram)) => datagram.send_to(data, target).await,
                    (None, None) => return Err(DmError::NotConnected),
                }
            }
        };

        sent.map_err(|e| DmError::SendFail(e.to_string().into()))
    }

    fn sub_socket(&self, peer: SocketAddr) -> Option<Arc<dyn StreamSocket>> {
        let mut link = lock(&self.link);
        let sub = link.subs.iter_mut().find(|sub| sub.peer == peer)?;
        sub.last_access = Instant::now();
        sub.socket.clone()
    }

    // Registers a peer of a server session, evicting the one with the oldest
    // access when all sub-sessions are taken.
    fn admit(&self, peer: SocketAddr, socket: Option<Arc<dyn StreamSocket>>) {
        let mut link = lock(&self.link);

        if let Some(sub) = link.subs.iter_mut().find(|sub| sub.peer == peer) {
            sub.last_access = Instant::now();
            if let Some(socket) = socket {
                if let Some(previous) = sub.socket.replace(socket) {
                    previous.close();
                }
            }
            return;
        }

        if link.subs.len() >= MAX_SUB_SESSIONS {
            let oldest = link
                .subs
                .iter()
                .enumerate()
                .min_by_key(|(_, sub)| sub.last_access)
                .map(|(index, _)| index);
            if let Some(index) = oldest {
                let evicted = link.subs.remove(index);
                info!("Session `{}`: evict peer `{}`", self.id, evicted.peer);
                evicted.close();
            }
        }

        link.subs.push(SubSession {
            peer,
            socket,
            reader: None,
            last_access: Instant::now(),
        });
    }

    fn set_reader(&self, peer: SocketAddr, reader: JoinHandle<()>) {
        let mut link = lock(&self.link);
        match link.subs.iter_mut().find(|sub| sub.peer == peer) {
            Some(sub) => {
                if let Some(previous) = sub.reader.replace(reader) {
                    previous.abort();
                }
            }
            None => reader.abort(),
        }
    }

    // Returns the number of peers left.
    fn remove_sub(&self, peer: SocketAddr) -> usize {
        let mut link = lock(&self.link);
        if let Some(index) = link.subs.iter().position(|sub| sub.peer == peer) {
            let sub = link.subs.remove(index);
            if let Some(socket) = sub.socket {
                socket.close();
            }
        }
        link.subs.len()
    }

    // Closes every peer of a server session.
    fn release_peers(&self) {
        for sub in lock(&self.link).subs.drain(..) {
            sub.close();
        }
    }

    // Forgets an ephemeral local port, so that the next run picks a new one.
    pub(crate) fn forget_ephemeral_port(&self) {
        let ephemeral = lock(&self.config)
            .as_ref()
            .is_some_and(|config| config.local_port == 0);
        if ephemeral {
            self.observe_local_port(None);
        }
    }

    fn touch(&self, peer: SocketAddr) {
        if let Some(sub) = lock(&self.link).subs.iter_mut().find(|sub| sub.peer == peer) {
            sub.last_access = Instant::now();
        }
    }

    fn arm_keepalive(&self, config: &SessionConfig, callbacks: &SharedSessionCallbacks, env: &SessionEnv) {
        if config.keepalive_interval_s == 0 || !config.kind.is_tcp() {
            return;
        }

        let id = self.id;
        let period = Duration::from_secs(u64::from(config.keepalive_interval_s));
        let callbacks = callbacks.clone();
        let coordinator = env.coordinator.clone();
        let events = env.events.clone();

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                let _ = interval.tick().await;
                let job = coordinator.start(JobId::Keepalive(id));
                let event = DpmEvent::Keepalive {
                    session: id,
                    callbacks: callbacks.clone(),
                    job,
                };
                if events.send(event).await.is_err() {
                    break;
                }
            }
        });

        if let Some(previous) = lock(&self.link).keepalive.replace(handle) {
            previous.abort();
        }
    }

    fn disarm_keepalive(&self) {
        if let Some(keepalive) = lock(&self.link).keepalive.take() {
            keepalive.abort();
        }
    }

    async fn secure(
        &self,
        socket: Arc<dyn StreamSocket>,
        role: SecureRole,
        protocol: SecureProtocol,
        callbacks: &SharedSessionCallbacks,
        env: &SessionEnv,
    ) -> Result<Arc<dyn StreamSocket>> {
        let Some(provider) = env.secure_provider.as_deref() else {
            return Err(DmError::SecureInitFail("no secure provider".into()));
        };

        let mut context = SecureContext::setup(
            &self.name,
            role,
            protocol,
            env.tickets.clone(),
            |settings| callbacks.on_secure_setup(settings),
        )
        .await?;

        // Sleep must not interrupt a handshake.
        let _job = env.coordinator.start(JobId::Session(self.id));
        context.handshake(provider, socket, &env.reporter).await
    }

    async fn dispatch_connect(
        &self,
        callbacks: &SharedSessionCallbacks,
        env: &SessionEnv,
        peer: Option<SocketAddr>,
        result: Result<()>,
    ) {
        let Some(manager) = env.manager.upgrade() else {
            return;
        };
        let job = env.coordinator.start(JobId::Session(self.id));
        callbacks
            .on_connect(ConnectEvent {
                session: self.id,
                peer,
                result,
                job,
                manager,
            })
            .await;
    }

    async fn dispatch_recv(
        &self,
        callbacks: &SharedSessionCallbacks,
        env: &SessionEnv,
        peer: SocketAddr,
        data: Vec<u8>,
    ) {
        let Some(manager) = env.manager.upgrade() else {
            return;
        };
        let job = env.coordinator.start(JobId::Session(self.id));
        callbacks
            .on_recv(RecvEvent {
                session: self.id,
                peer,
                data,
                job,
                manager,
            })
            .await;
    }

    // Receives from a single stream until a command or a close.
    async fn stream_loop(
        &self,
        socket: &Arc<dyn StreamSocket>,
        timeout: Duration,
        callbacks: &SharedSessionCallbacks,
        env: &SessionEnv,
    ) -> Exit {
        let peer = socket.peer_addr();
        let mut buf = vec![0; dpm::config::RX_BUFFER_SIZE];

        loop {
            let command = self.take_command();
            if command != Command::None {
                return Exit::Command(command);
            }

            let poll = tokio::select! {
                poll = self.receive(socket.as_ref(), &mut buf, timeout) => poll,
                () = self.command_posted.notified() => continue,
            };

            match poll {
                Poll::Idle => {}
                Poll::Data(size) => {
                    self.dispatch_recv(callbacks, env, peer, buf[..size].to_vec())
                        .await;
                }
                Poll::Closed => {
                    info!("Session `{}`: peer `{peer}` closed the connection", self.id);
                    self.dispatch_recv(callbacks, env, peer, Vec::new()).await;
                    return Exit::PeerClosed;
                }
            }
        }
    }
}

// Binds a local resource, retrying while the port is still held by a
// previous socket.
async fn bind_with_retry<T, F, Fut>(session: &Session, port: u16, mut bind: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = io::Result<T>>,
{
    for attempt in 1..=BIND_RETRY_COUNT {
        match bind().await {
            Ok(bound) => return Ok(bound),
            Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
                warn!(
                    "Session `{}`: port {port} busy, bind attempt {attempt}/{BIND_RETRY_COUNT}",
                    session.id
                );
                if let Some(command) = session.pause(BIND_RETRY_WAIT).await {
                    return Err(command.into_error());
                }
            }
            Err(e) => return Err(DmError::SocketCreateFail(e.to_string().into())),
        }
    }
    Err(DmError::BindFail(port))
}

async fn run(
    session: Arc<Session>,
    config: SessionConfig,
    callbacks: SharedSessionCallbacks,
    env: SessionEnv,
) {
    session.set_status(RunStatus::Init);
    info!("Session `{}` started as {}", session.id, config.kind);

    let result = match config.kind {
        SessionKind::TcpClient => tcp_client::run(&session, &config, &callbacks, &env).await,
        SessionKind::TcpServer => tcp_server::run(&session, &config, &callbacks, &env).await,
        SessionKind::UdpClient => udp_client::run(&session, &config, &callbacks, &env).await,
        SessionKind::UdpServer => udp_server::run(&session, &config, &callbacks, &env).await,
    };

    session.set_status(RunStatus::GoingStop);
    session.close_link();

    match result {
        Ok(()) => {}
        Err(e) if e.is_control() => debug!("Session `{}`: {e}", session.id),
        Err(e) => env
            .reporter
            .report(&format!("Session `{}`", session.id), &e),
    }

    session.set_status(RunStatus::Stopped);
}

#[cfg(test)]
mod tests;
