use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;

use dpm::error::Result;
use dpm::wakeup::BootKind;

use crate::coordinator::Job;
use crate::manager::DpmManager;
use crate::secure::SecureSettings;

/// Future returned by every application callback.
pub type CallbackFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// A session reached a peer, or failed to.
///
/// The job guard keeps the device awake until it is dropped.
#[derive(Debug)]
pub struct ConnectEvent {
    /// Session identifier.
    pub session: u8,
    /// The peer, when known.
    pub peer: Option<SocketAddr>,
    /// Outcome of the connection.
    pub result: Result<()>,
    /// Job guard.
    pub job: Job,
    /// The manager driving the session.
    pub manager: DpmManager,
}

/// A session received data.
///
/// Empty data means that the peer closed the connection.
#[derive(Debug)]
pub struct RecvEvent {
    /// Session identifier.
    pub session: u8,
    /// The sender.
    pub peer: SocketAddr,
    /// Received data.
    pub data: Vec<u8>,
    /// Job guard.
    pub job: Job,
    /// The manager driving the session.
    pub manager: DpmManager,
}

impl RecvEvent {
    /// Whether the peer closed the connection.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.data.is_empty()
    }

    /// Sends `data` back to the sender.
    ///
    /// # Errors
    ///
    /// Fails as [`DpmManager::send_to_session`] does.
    pub async fn reply(&self, data: &[u8]) -> Result<usize> {
        self.manager
            .send_to_session(self.session, self.peer.ip(), self.peer.port(), data)
            .await
    }
}

/// The keepalive timer of a session expired.
#[derive(Debug)]
pub struct KeepaliveEvent {
    /// Session identifier.
    pub session: u8,
    /// Job guard.
    pub job: Job,
    /// The manager driving the session.
    pub manager: DpmManager,
}

/// An application timer expired.
#[derive(Debug)]
pub struct TimerEvent {
    /// Timer identifier.
    pub timer: u8,
    /// Job guard.
    pub job: Job,
    /// The manager owning the timer.
    pub manager: DpmManager,
}

/// The manager booted.
#[derive(Debug)]
pub struct InitEvent {
    /// How the manager booted.
    pub boot: BootKind,
    /// Job guard.
    pub job: Job,
    /// The booting manager.
    pub manager: DpmManager,
}

/// The callbacks of a session.
///
/// Every event carries a job guard: the device is not allowed to sleep
/// until the guard is dropped, so a callback which hands work over to another
/// task should move the guard along with it.
pub trait SessionCallbacks: Send + Sync + 'static {
    /// A connection has been established, or has failed.
    fn on_connect(&self, event: ConnectEvent) -> CallbackFuture {
        drop(event);
        Box::pin(async {})
    }

    /// Data has been received.
    fn on_recv(&self, event: RecvEvent) -> CallbackFuture;

    /// The keepalive interval elapsed.
    fn on_keepalive(&self, event: KeepaliveEvent) -> CallbackFuture {
        drop(event);
        Box::pin(async {})
    }

    /// Customizes the handshake settings of a secure session.
    fn on_secure_setup(&self, _settings: &mut SecureSettings) {}
}

/// The callback of an application timer.
pub trait TimerCallback: Send + Sync + 'static {
    /// The timer expired.
    fn on_fire(&self, event: TimerEvent) -> CallbackFuture;
}

impl<F, Fut> TimerCallback for F
where
    F: Fn(TimerEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn on_fire(&self, event: TimerEvent) -> CallbackFuture {
        Box::pin(self(event))
    }
}

/// A boot, wakeup or external wakeup initialization callback.
pub trait InitCallback: Send + Sync + 'static {
    /// The manager booted.
    fn on_init(&self, event: InitEvent) -> CallbackFuture;
}

impl<F, Fut> InitCallback for F
where
    F: Fn(InitEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn on_init(&self, event: InitEvent) -> CallbackFuture {
        Box::pin(self(event))
    }
}

pub(crate) type SharedSessionCallbacks = Arc<dyn SessionCallbacks>;
pub(crate) type SharedTimerCallback = Arc<dyn TimerCallback>;
pub(crate) type SharedInitCallback = Arc<dyn InitCallback>;
