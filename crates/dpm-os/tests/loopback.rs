mod common;

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use serial_test::serial;

use dpm::config::SessionConfig;
use dpm::wakeup::{BootKind, WakeupSource};

use dpm_os::manager::DpmManager;
use dpm_os::retention::MemoryRegion;
use dpm_os::session::RunStatus;
use dpm_os::transport::{TokioTransport, Transport};

use common::{Recorder, init_tracing, register_echo, register_lifecycle};

// Bound on every network wait.
const TIMEOUT: Duration = Duration::from_secs(5);

fn free_port() -> u16 {
    std::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
        .and_then(|listener| listener.local_addr())
        .map(|address| address.port())
        .unwrap()
}

async fn boot(region: &MemoryRegion, source: WakeupSource, port: u16) -> (DpmManager, Arc<Recorder>) {
    init_tracing();
    let recorder = Arc::new(Recorder::default());
    let manager = DpmManager::builder(Arc::new(region.clone()), Arc::new(TokioTransport::new()))
        .wakeup_source(source)
        .build();

    let registered = recorder.clone();
    manager.register_config_callback(move |registration| {
        register_lifecycle(registration, &registered);
        register_echo(registration, &registered, 1, SessionConfig::tcp_server(port));
    });
    let _ = manager.start().await.unwrap();

    let _ = tokio::time::timeout(
        TIMEOUT,
        manager
            .subscribe_session(1)
            .unwrap()
            .wait_for(|status| *status == RunStatus::WaitingAccept),
    )
    .await
    .unwrap()
    .unwrap();

    (manager, recorder)
}

async fn ping(port: u16) {
    let transport = TokioTransport::new();
    let server = SocketAddr::new(Ipv4Addr::LOCALHOST.into(), port);
    let client = tokio::time::timeout(TIMEOUT, transport.connect(0, server, false))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(client.send(b"ping").await.unwrap(), 4);
    let mut buf = [0; 16];
    let size = tokio::time::timeout(TIMEOUT, client.recv(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf[..size], b"ping");
    client.close();
}

#[tokio::test]
#[serial]
async fn echo_across_sleep() {
    let region = MemoryRegion::new();
    let port = free_port();

    let (manager, recorder) = boot(&region, WakeupSource::PowerOn, port).await;
    ping(port).await;
    assert_eq!(*recorder.received.lock().unwrap(), vec![b"ping".to_vec()]);

    tokio::time::timeout(TIMEOUT, manager.request_sleep())
        .await
        .unwrap()
        .unwrap();
    drop(manager);

    // The server listens again on the same port after the wakeup.
    let (manager, recorder) = boot(&region, WakeupSource::Packet, port).await;
    assert_eq!(Recorder::count(&recorder.wakeups), 1);
    assert_eq!(
        manager.session_info(1).unwrap().local_port,
        Some(port)
    );
    ping(port).await;
    assert!(recorder.codes().is_empty());
}

#[tokio::test]
#[serial]
async fn wake_kind_is_reported() {
    let region = MemoryRegion::new();
    let port = free_port();

    let (manager, _) = boot(&region, WakeupSource::PowerOn, port).await;
    tokio::time::timeout(TIMEOUT, manager.request_sleep())
        .await
        .unwrap()
        .unwrap();
    drop(manager);

    let manager = DpmManager::builder(Arc::new(region.clone()), Arc::new(TokioTransport::new()))
        .wakeup_source(WakeupSource::RtcTimer)
        .build();
    let recorder = Arc::new(Recorder::default());
    let registered = recorder.clone();
    manager.register_config_callback(move |registration| {
        register_lifecycle(registration, &registered);
    });
    assert_eq!(
        manager.start().await,
        Ok(BootKind::Wake(WakeupSource::RtcTimer))
    );
    assert_eq!(Recorder::count(&recorder.boots), 0);
    assert_eq!(Recorder::count(&recorder.wakeups), 1);
}
