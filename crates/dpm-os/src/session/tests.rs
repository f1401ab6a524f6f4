use std::net::Ipv4Addr;
use std::sync::Mutex as StdMutex;

use dpm::config::ReconnectPolicy;

use crate::callbacks::{CallbackFuture, SessionCallbacks};
use crate::secure::tests::ScriptedProvider;
use crate::transport::MemoryTransport;

use super::*;

struct Ignore;

impl SessionCallbacks for Ignore {
    fn on_recv(&self, event: RecvEvent) -> CallbackFuture {
        drop(event);
        Box::pin(async {})
    }
}

fn callbacks() -> SharedSessionCallbacks {
    Arc::new(Ignore)
}

fn env(transport: &MemoryTransport) -> (SessionEnv, Arc<StdMutex<Vec<u8>>>) {
    let (events, _) = mpsc::channel(16);
    let reporter = ErrorReporter::default();
    let codes = Arc::new(StdMutex::new(Vec::new()));
    let sink = codes.clone();
    reporter.set(Some(Arc::new(move |code: u8, _: &str| {
        sink.lock().unwrap().push(code);
    })));

    let env = SessionEnv {
        transport: Arc::new(transport.clone()),
        coordinator: Coordinator::new(),
        reporter,
        secure_provider: None,
        tickets: TicketCache::new(),
        events,
        manager: WeakManager::detached(),
    };
    (env, codes)
}

async fn wait_status(session: &Session, expected: RunStatus) {
    let _ = session
        .subscribe()
        .wait_for(|status| *status == expected)
        .await
        .unwrap();
}

const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);
const UNSPECIFIED: IpAddr = IpAddr::V4(Ipv4Addr::UNSPECIFIED);

#[tokio::test(start_paused = true)]
async fn invalid_config_stays_stopped() {
    let transport = MemoryTransport::new();
    let (env, _) = env(&transport);
    let session = Session::new(1);

    let error = session
        .start(SessionConfig::tcp_client("", 9000), callbacks(), env)
        .await
        .unwrap_err();
    assert!(matches!(error, DmError::InvalidConfig(_)));
    assert_eq!(session.status(), RunStatus::Stopped);
    assert!(transport.connect_attempts(9000).is_empty());
}

#[tokio::test(start_paused = true)]
async fn bounded_connection_attempts() {
    let transport = MemoryTransport::new();
    let (env, codes) = env(&transport);
    let coordinator = env.coordinator.clone();
    let session = Session::new(2);

    let config = SessionConfig::tcp_client("127.0.0.1", 7000).reconnect(ReconnectPolicy {
        retry_count: 3,
        wait_time_s: 2,
        auto_reconnect: false,
    });
    session.start(config, callbacks(), env).await.unwrap();
    wait_status(&session, RunStatus::Stopped).await;

    let attempts = transport.connect_attempts(7000);
    assert_eq!(attempts.len(), 3);
    for pair in attempts.windows(2) {
        assert_eq!(pair[1] - pair[0], Duration::from_secs(2));
    }
    assert_eq!(*codes.lock().unwrap(), vec![0x10]);
    assert!(coordinator.is_idle());
}

#[tokio::test(start_paused = true)]
async fn auto_reconnect_keeps_trying() {
    let transport = MemoryTransport::new();
    let (env, codes) = env(&transport);
    let coordinator = env.coordinator.clone();
    let session = Session::new(2);

    let config = SessionConfig::tcp_client("127.0.0.1", 7000).reconnect(ReconnectPolicy {
        retry_count: 2,
        wait_time_s: 1,
        auto_reconnect: true,
    });
    session.start(config, callbacks(), env).await.unwrap();

    tokio::time::sleep(Duration::from_millis(10_500)).await;
    assert_eq!(session.status(), RunStatus::Init);
    assert_eq!(transport.connect_attempts(7000).len(), 11);
    // Reported once, when the initial attempts are exhausted.
    assert_eq!(*codes.lock().unwrap(), vec![0x10]);
    // Retrying forever does not prevent sleep.
    assert!(coordinator.is_idle());

    // A server showing up is eventually reached.
    let listener = transport.listen(7000).await.unwrap();
    let _accepted = listener.accept().await.unwrap();
    wait_status(&session, RunStatus::Running).await;

    assert_eq!(session.stop(DEFAULT_STOP_TIMEOUT).await, Ok(()));
    assert_eq!(session.status(), RunStatus::Stopped);
}

#[tokio::test(start_paused = true)]
async fn bind_conflict_is_retried() {
    let transport = MemoryTransport::new();
    let _holder = transport.listen(9000).await.unwrap();
    let (env, codes) = env(&transport);
    let session = Session::new(1);

    let start = Instant::now();
    session
        .start(SessionConfig::tcp_server(9000), callbacks(), env)
        .await
        .unwrap();
    wait_status(&session, RunStatus::Stopped).await;

    assert_eq!(start.elapsed(), BIND_RETRY_WAIT * BIND_RETRY_COUNT);
    assert_eq!(*codes.lock().unwrap(), vec![0x0F]);
}

#[tokio::test(start_paused = true)]
async fn server_routes_to_peers() {
    let transport = MemoryTransport::new();
    let (env, _) = env(&transport);
    let session = Session::new(1);

    session
        .start(SessionConfig::tcp_server(9000), callbacks(), env)
        .await
        .unwrap();
    wait_status(&session, RunStatus::WaitingAccept).await;

    let client = transport
        .connect(0, SocketAddr::new(LOCALHOST, 9000), false)
        .await
        .unwrap();
    wait_status(&session, RunStatus::Running).await;

    let local = client.local_addr();
    assert_eq!(session.send(local.ip(), local.port(), b"hello").await, Ok(5));
    let mut buf = [0; 16];
    assert_eq!(client.recv(&mut buf).await.unwrap(), 5);
    assert_eq!(&buf[..5], b"hello");

    assert_eq!(
        session.send(LOCALHOST, 1, b"lost").await,
        Err(DmError::NotFoundSubSession)
    );
    assert_eq!(session.info().peer, Some(local));

    // The last peer leaving puts the server back to waiting.
    client.close();
    wait_status(&session, RunStatus::WaitingAccept).await;
    assert!(session.info().sub_sessions.is_empty());

    let start = Instant::now();
    assert_eq!(session.stop(DEFAULT_STOP_TIMEOUT).await, Ok(()));
    assert!(start.elapsed() < DEFAULT_STOP_TIMEOUT);
    assert!(!transport.is_listening(9000));
}

struct Record(mpsc::UnboundedSender<Vec<u8>>);

impl SessionCallbacks for Record {
    fn on_recv(&self, event: RecvEvent) -> CallbackFuture {
        let _ = self.0.send(event.data.clone());
        Box::pin(async {})
    }
}

#[tokio::test(start_paused = true)]
async fn idle_peer_does_not_delay_others() {
    let transport = MemoryTransport::new();
    let (env, _) = env(&transport);
    let session = Session::new(1);
    let (sender, mut received) = mpsc::unbounded_channel();
    let timeout = Duration::from_secs(60);

    session
        .start(
            SessionConfig::tcp_server(9000).receive_timeout_ms(60_000),
            Arc::new(Record(sender)),
            env,
        )
        .await
        .unwrap();
    wait_status(&session, RunStatus::WaitingAccept).await;

    let server = SocketAddr::new(LOCALHOST, 9000);
    let _idle = transport.connect(0, server, false).await.unwrap();
    let busy = transport.connect(0, server, false).await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(session.info().sub_sessions.len(), 2);

    let start = Instant::now();
    let _ = busy.send(b"data").await.unwrap();
    assert_eq!(received.recv().await, Some(b"data".to_vec()));
    assert!(start.elapsed() < timeout);
}

#[tokio::test(start_paused = true)]
async fn oldest_peer_is_evicted() {
    let transport = MemoryTransport::new();
    let (env, _) = env(&transport);
    let session = Session::new(1);

    session
        .start(SessionConfig::tcp_server(9000), callbacks(), env)
        .await
        .unwrap();
    wait_status(&session, RunStatus::WaitingAccept).await;

    let server = SocketAddr::new(LOCALHOST, 9000);
    let mut clients = Vec::new();
    for _ in 0..3 {
        clients.push(transport.connect(0, server, false).await.unwrap());
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let peers = session.info().sub_sessions;
    assert_eq!(
        peers,
        vec![clients[1].local_addr(), clients[2].local_addr()]
    );

    // The evicted peer observes the close.
    let mut buf = [0; 4];
    assert_eq!(clients[0].recv(&mut buf).await.unwrap(), 0);
    assert_eq!(session.status(), RunStatus::Running);
}

#[tokio::test(start_paused = true)]
async fn udp_client_replies_to_last_peer() {
    let transport = MemoryTransport::new();
    let (env, _) = env(&transport);
    let session = Session::new(4);
    let server = transport.bind_datagram(5683).await.unwrap();

    session
        .start(SessionConfig::udp_client("127.0.0.1", 5683), callbacks(), env)
        .await
        .unwrap();
    wait_status(&session, RunStatus::Running).await;

    // Nothing received yet.
    assert_eq!(
        session.send(UNSPECIFIED, 0, b"one").await,
        Err(DmError::NotConnected)
    );
    assert_eq!(session.info().peer, None);

    assert_eq!(session.send(LOCALHOST, 5683, b"one").await, Ok(3));
    let mut buf = [0; 16];
    let (size, client) = server.recv_from(&mut buf).await.unwrap();
    assert_eq!(&buf[..size], b"one");

    let other = transport.bind_datagram(0).await.unwrap();
    let _ = other.send_to(b"ping", client).await.unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(session.info().peer, Some(other.local_addr()));

    assert_eq!(session.send(UNSPECIFIED, 0, b"two").await, Ok(3));
    let (size, from) = other.recv_from(&mut buf).await.unwrap();
    assert_eq!((&buf[..size], from), (&b"two"[..], client));

    assert_eq!(session.stop(DEFAULT_STOP_TIMEOUT).await, Ok(()));
    assert_eq!(
        session.send(UNSPECIFIED, 0, b"three").await,
        Err(DmError::NotConnected)
    );
}

#[tokio::test(start_paused = true)]
async fn udp_client_keeps_peer_across_sleep() {
    let transport = MemoryTransport::new();
    let (env, _) = env(&transport);
    let session = Session::new(4);
    let _server = transport.bind_datagram(5683).await.unwrap();
    let peer = transport.bind_datagram(0).await.unwrap();

    // A peer observed before sleep.
    let mut config = SessionConfig::udp_client("127.0.0.1", 5683);
    config.peer = Some(peer.local_addr());
    session.restore(&config);

    session.start(config, callbacks(), env).await.unwrap();
    wait_status(&session, RunStatus::Running).await;

    assert_eq!(session.send(UNSPECIFIED, 0, b"back").await, Ok(4));
    let mut buf = [0; 16];
    let (size, _) = peer.recv_from(&mut buf).await.unwrap();
    assert_eq!(&buf[..size], b"back");
}

#[tokio::test(start_paused = true)]
async fn stuck_session_is_forcibly_stopped() {
    let transport = MemoryTransport::new();
    let listener = transport.listen(4433).await.unwrap();
    let (mut env, _) = env(&transport);
    let coordinator = env.coordinator.clone();

    let mut provider = ScriptedProvider::new([]);
    provider.stall = Some(Duration::from_secs(60));
    env.secure_provider = Some(Arc::new(provider));

    let session = Session::new(3);
    session
        .start(
            SessionConfig::tcp_client("127.0.0.1", 4433).secure(),
            callbacks(),
            env,
        )
        .await
        .unwrap();
    let _accepted = listener.accept().await.unwrap();
    wait_status(&session, RunStatus::Connected).await;

    // The handshake does not look at commands.
    let start = Instant::now();
    assert_eq!(
        session.stop(Duration::from_millis(300)).await,
        Err(DmError::ForceStopped)
    );
    assert_eq!(start.elapsed(), Duration::from_millis(300));

    assert_eq!(session.status(), RunStatus::Stopped);
    assert!(session.is_force_stopped());
    assert!(transport.streams()[0].is_closed());

    // The aborted task releases its job once the runtime drops it.
    tokio::time::sleep(Duration::from_millis(1)).await;
    assert!(coordinator.is_idle());
    assert_eq!(
        session.send(LOCALHOST, 4433, b"late").await,
        Err(DmError::ForceStopped)
    );
}

#[test]
fn status_codes() {
    assert_eq!(RunStatus::Stopped as u8, 0);
    assert_eq!(RunStatus::WaitingAccept as u8, 2);
    assert_eq!(RunStatus::ReadyToCreate as u8, 6);
    assert_eq!(RunStatus::GoingStop.to_string(), "going stop");
}
