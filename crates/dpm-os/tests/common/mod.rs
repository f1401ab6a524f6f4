#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use dpm::config::SessionConfig;

use dpm_os::callbacks::{
    CallbackFuture, ConnectEvent, InitEvent, KeepaliveEvent, RecvEvent, SessionCallbacks,
    TimerEvent,
};
use dpm_os::manager::Registration;
use dpm_os::secure::{
    Established, HandshakeFuture, SecureProvider, SecureRole, SecureSettings, SessionTicket,
};
use dpm_os::transport::StreamSocket;

use dpm::config::TimerKind;

/// Prints the manager logs through the test output capture.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

/// Everything the callbacks observed.
#[derive(Debug, Default)]
pub struct Recorder {
    pub boots: AtomicUsize,
    pub wakeups: AtomicUsize,
    pub external_wakeups: AtomicUsize,
    pub timer_fires: AtomicUsize,
    pub keepalives: AtomicUsize,
    pub connects: Mutex<Vec<bool>>,
    pub received: Mutex<Vec<Vec<u8>>>,
    pub closes: AtomicUsize,
    pub codes: Mutex<Vec<u8>>,
}

impl Recorder {
    pub fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }

    pub fn codes(&self) -> Vec<u8> {
        self.codes.lock().unwrap().clone()
    }
}

/// Echoes every payload back to its sender.
pub struct Echo {
    recorder: Arc<Recorder>,
}

impl Echo {
    pub fn new(recorder: &Arc<Recorder>) -> Arc<Self> {
        Arc::new(Self {
            recorder: recorder.clone(),
        })
    }
}

impl SessionCallbacks for Echo {
    fn on_connect(&self, event: ConnectEvent) -> CallbackFuture {
        self.recorder.connects.lock().unwrap().push(event.result.is_ok());
        Box::pin(async {})
    }

    fn on_recv(&self, event: RecvEvent) -> CallbackFuture {
        let recorder = self.recorder.clone();
        Box::pin(async move {
            if event.is_closed() {
                let _ = recorder.closes.fetch_add(1, Ordering::SeqCst);
                return;
            }
            recorder.received.lock().unwrap().push(event.data.clone());
            let _ = event.reply(&event.data).await;
        })
    }

    fn on_keepalive(&self, event: KeepaliveEvent) -> CallbackFuture {
        drop(event);
        let _ = self.recorder.keepalives.fetch_add(1, Ordering::SeqCst);
        Box::pin(async {})
    }

    fn on_secure_setup(&self, settings: &mut SecureSettings) {
        if settings.role == SecureRole::Server {
            settings.cert = Some(b"certificate".to_vec());
            settings.private_key = Some(b"key".to_vec());
        }
    }
}

/// Registers the init, wakeup and error callbacks on `recorder`.
pub fn register_lifecycle(registration: &mut Registration, recorder: &Arc<Recorder>) {
    let boots = recorder.clone();
    let wakeups = recorder.clone();
    let external = recorder.clone();
    let codes = recorder.clone();

    let _ = registration
        .boot_init(move |_: InitEvent| {
            let _ = boots.boots.fetch_add(1, Ordering::SeqCst);
            async {}
        })
        .wakeup_init(move |_: InitEvent| {
            let _ = wakeups.wakeups.fetch_add(1, Ordering::SeqCst);
            async {}
        })
        .external_wakeup(move |_: InitEvent| {
            let _ = external.external_wakeups.fetch_add(1, Ordering::SeqCst);
            async {}
        })
        .error(move |code, _| codes.codes.lock().unwrap().push(code));
}

/// Registers a periodic timer counting its expirations on `recorder`.
pub fn register_timer(registration: &mut Registration, recorder: &Arc<Recorder>, id: u8, interval_s: u32) {
    let fires = recorder.clone();
    let _ = registration.timer(id, TimerKind::Periodic, interval_s, move |_: TimerEvent| {
        let _ = fires.timer_fires.fetch_add(1, Ordering::SeqCst);
        async {}
    });
}

/// Registers an echo session.
pub fn register_echo(registration: &mut Registration, recorder: &Arc<Recorder>, id: u8, config: SessionConfig) {
    let _ = registration.session(id, config, Echo::new(recorder));
}

/// A secure engine accepting every handshake and issuing a fixed ticket.
#[derive(Debug, Default)]
pub struct TicketingProvider {
    offered: Mutex<Vec<Option<SessionTicket>>>,
}

impl TicketingProvider {
    pub fn offered(&self) -> Vec<Option<SessionTicket>> {
        self.offered.lock().unwrap().clone()
    }
}

impl SecureProvider for TicketingProvider {
    fn handshake<'a>(
        &'a self,
        socket: Arc<dyn StreamSocket>,
        _settings: &'a SecureSettings,
        ticket: Option<SessionTicket>,
    ) -> HandshakeFuture<'a> {
        Box::pin(async move {
            self.offered.lock().unwrap().push(ticket);
            Ok(Established {
                socket,
                ticket: Some(SessionTicket(b"ticket".to_vec())),
            })
        })
    }
}
