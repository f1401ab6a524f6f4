use std::fmt;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use dpm::config::{
    MAX_SESSIONS, SessionConfig, SessionKind, TimerConfig, TimerKind, check_session_id,
};
use dpm::error::{DmError, Result};
use dpm::job::{Completion, JobId};
use dpm::retention::{CallbackFlags, RetentionBlob};
use dpm::wakeup::{BootKind, WakeupSource};

use indexmap::IndexMap;

use tokio::sync::{mpsc, watch};

use tracing::{debug, info, warn};

use crate::callbacks::{
    InitCallback, InitEvent, SessionCallbacks, SharedInitCallback, SharedSessionCallbacks,
    SharedTimerCallback, TimerCallback,
};
use crate::coordinator::{Coordinator, Job};
use crate::events::{DpmEvent, EventDispatcher};
use crate::report::{ErrorCallback, ErrorReporter};
use crate::retention::{RetentionRegion, RetentionStore};
use crate::secure::{SecureProvider, TicketCache};
use crate::session::{DEFAULT_STOP_TIMEOUT, RunStatus, Session, SessionEnv, SessionInfo};
use crate::timer::TimerRegistry;
use crate::transport::Transport;

const MANAGER_CONTEXT: &str = "DPM manager";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn session_context(id: u8) -> String {
    format!("Session `{id}`")
}

/// The lifecycle state of a [`DpmManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState {
    /// [`DpmManager::start`] has not completed yet.
    Uninitialized,
    /// Booting from power on.
    NormalBoot,
    /// Sessions and timers are running.
    Running,
    /// The device is about to sleep.
    SleepPending,
    /// Booting from a wakeup, restoring the retained state.
    WakeBoot,
}

/// The configuration callback, run at every boot.
pub type ConfigCallback = Arc<dyn Fn(&mut Registration) + Send + Sync>;

#[derive(Clone)]
struct SessionEntry {
    config: SessionConfig,
    callbacks: SharedSessionCallbacks,
}

/// What the configuration callback registers.
///
/// The configuration callback runs at every boot: on wake boots the retained
/// session and timer state is then laid over what it registered.
#[derive(Default)]
pub struct Registration {
    boot_init: Option<SharedInitCallback>,
    wakeup_init: Option<SharedInitCallback>,
    external_wakeup: Option<SharedInitCallback>,
    error: Option<ErrorCallback>,
    sessions: IndexMap<u8, SessionEntry>,
    timers: IndexMap<u8, (TimerConfig, SharedTimerCallback)>,
    user_params_size: usize,
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("callbacks", &self.flags())
            .field("sessions", &self.sessions.keys().collect::<Vec<_>>())
            .field("timers", &self.timers.keys().collect::<Vec<_>>())
            .field("user_params_size", &self.user_params_size)
            .finish()
    }
}

impl Registration {
    /// Sets the callback run on power-on boots.
    pub fn boot_init(&mut self, callback: impl InitCallback) -> &mut Self {
        self.boot_init = Some(Arc::new(callback));
        self
    }

    /// Sets the callback run on wake boots.
    pub fn wakeup_init(&mut self, callback: impl InitCallback) -> &mut Self {
        self.wakeup_init = Some(Arc::new(callback));
        self
    }

    /// Sets the callback run after the wakeup one when an external signal
    /// woke the device.
    pub fn external_wakeup(&mut self, callback: impl InitCallback) -> &mut Self {
        self.external_wakeup = Some(Arc::new(callback));
        self
    }

    /// Sets the callback receiving every error code and message.
    pub fn error(&mut self, callback: impl Fn(u8, &str) + Send + Sync + 'static) -> &mut Self {
        self.error = Some(Arc::new(callback));
        self
    }

    /// Registers a session.
    ///
    /// Registering the same identifier twice replaces the first session.
    pub fn session(
        &mut self,
        id: u8,
        config: SessionConfig,
        callbacks: Arc<dyn SessionCallbacks>,
    ) -> &mut Self {
        let _ = self.sessions.insert(id, SessionEntry { config, callbacks });
        self
    }

    /// Registers an application timer.
    pub fn timer(
        &mut self,
        id: u8,
        kind: TimerKind,
        interval_s: u32,
        callback: impl TimerCallback,
    ) -> &mut Self {
        let callback: SharedTimerCallback = Arc::new(callback);
        let _ = self
            .timers
            .insert(id, (TimerConfig::new(kind, interval_s), callback));
        self
    }

    /// Reserves a retained application payload of `size` bytes.
    pub fn user_params(&mut self, size: usize) -> &mut Self {
        self.user_params_size = size;
        self
    }

    fn flags(&self) -> CallbackFlags {
        CallbackFlags {
            boot_init: self.boot_init.is_some(),
            wakeup_init: self.wakeup_init.is_some(),
            external_wakeup: self.external_wakeup.is_some(),
            error: self.error.is_some(),
        }
    }
}

struct Runtime {
    dispatcher: EventDispatcher,
    timers: TimerRegistry,
}

struct Inner {
    store: RetentionStore,
    transport: Arc<dyn Transport>,
    secure_provider: Option<Arc<dyn SecureProvider>>,
    wakeup_source: WakeupSource,
    stop_timeout: Duration,
    sleep_timeout: Option<Duration>,
    coordinator: Coordinator,
    reporter: ErrorReporter,
    tickets: TicketCache,
    state: Mutex<ManagerState>,
    config_callback: Mutex<Option<ConfigCallback>>,
    entries: Mutex<IndexMap<u8, SessionEntry>>,
    timer_callbacks: Mutex<IndexMap<u8, SharedTimerCallback>>,
    user_params_size: Mutex<usize>,
    callback_flags: Mutex<CallbackFlags>,
    sessions: Vec<Arc<Session>>,
    runtime: Mutex<Option<Runtime>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        for session in &self.sessions {
            session.abort();
        }
        if let Some(runtime) = lock(&self.runtime).take() {
            runtime.timers.unset_all();
            runtime.dispatcher.cancel();
        }
    }
}

// A handle which does not keep the manager alive.
#[derive(Clone)]
pub(crate) struct WeakManager(Weak<Inner>);

impl WeakManager {
    pub(crate) fn upgrade(&self) -> Option<DpmManager> {
        self.0.upgrade().map(|inner| DpmManager { inner })
    }

    // A handle to no manager: callbacks are never invoked through it.
    #[cfg(test)]
    pub(crate) fn detached() -> Self {
        Self(Weak::new())
    }
}

/// A [`DpmManager`] builder.
pub struct DpmManagerBuilder {
    region: Arc<dyn RetentionRegion>,
    transport: Arc<dyn Transport>,
    secure_provider: Option<Arc<dyn SecureProvider>>,
    wakeup_source: WakeupSource,
    stop_timeout: Duration,
    sleep_timeout: Option<Duration>,
}

impl DpmManagerBuilder {
    /// Sets the `TLS` and `DTLS` engine of secure sessions.
    #[must_use]
    #[inline]
    pub fn secure_provider(mut self, provider: Arc<dyn SecureProvider>) -> Self {
        self.secure_provider = Some(provider);
        self
    }

    /// Sets the reason of the boot.
    #[must_use]
    #[inline]
    pub const fn wakeup_source(mut self, source: WakeupSource) -> Self {
        self.wakeup_source = source;
        self
    }

    /// Sets the time granted to a session to stop before it is forcibly
    /// stopped.
    #[must_use]
    #[inline]
    pub const fn stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    /// Bounds the wait for outstanding jobs when sleep is requested.
    #[must_use]
    #[inline]
    pub const fn sleep_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.sleep_timeout = timeout;
        self
    }

    /// Builds the [`DpmManager`].
    #[must_use]
    pub fn build(self) -> DpmManager {
        let sessions = (1..=MAX_SESSIONS).map(Session::new).collect();

        DpmManager {
            inner: Arc::new(Inner {
                store: RetentionStore::new(self.region),
                transport: self.transport,
                secure_provider: self.secure_provider,
                wakeup_source: self.wakeup_source,
                stop_timeout: self.stop_timeout,
                sleep_timeout: self.sleep_timeout,
                coordinator: Coordinator::new(),
                reporter: ErrorReporter::default(),
                tickets: TicketCache::new(),
                state: Mutex::new(ManagerState::Uninitialized),
                config_callback: Mutex::new(None),
                entries: Mutex::new(IndexMap::new()),
                timer_callbacks: Mutex::new(IndexMap::new()),
                user_params_size: Mutex::new(0),
                callback_flags: Mutex::new(CallbackFlags::default()),
                sessions,
                runtime: Mutex::new(None),
            }),
        }
    }
}

/// The DPM manager.
///
/// Boots sessions and timers from the application configuration, or from
/// retention memory after a wakeup, tracks every job, and saves the state to
/// retain when the device goes to sleep.
///
/// Cloning a [`DpmManager`] is cheap, every clone drives the same sessions.
#[derive(Clone)]
pub struct DpmManager {
    inner: Arc<Inner>,
}

impl fmt::Debug for DpmManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DpmManager")
            .field("state", &self.state())
            .field("wakeup_source", &self.inner.wakeup_source)
            .field("outstanding_jobs", &self.inner.coordinator.outstanding())
            .finish_non_exhaustive()
    }
}

impl DpmManager {
    /// Creates a [`DpmManagerBuilder`] over a retention region and a socket
    /// transport.
    #[must_use]
    pub fn builder(
        region: Arc<dyn RetentionRegion>,
        transport: Arc<dyn Transport>,
    ) -> DpmManagerBuilder {
        DpmManagerBuilder {
            region,
            transport,
            secure_provider: None,
            wakeup_source: WakeupSource::PowerOn,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            sleep_timeout: None,
        }
    }

    fn downgrade(&self) -> WeakManager {
        WeakManager(Arc::downgrade(&self.inner))
    }

    fn set_state(&self, state: ManagerState) {
        let previous = std::mem::replace(&mut *lock(&self.inner.state), state);
        if previous != state {
            debug!("DPM manager: {previous:?} -> {state:?}");
        }
    }

    /// Lifecycle state.
    #[must_use]
    pub fn state(&self) -> ManagerState {
        *lock(&self.inner.state)
    }

    /// The job coordinator.
    #[must_use]
    pub fn coordinator(&self) -> &Coordinator {
        &self.inner.coordinator
    }

    // Spawns the event dispatcher and the timer registry on first use.
    fn runtime(&self) -> (mpsc::Sender<DpmEvent>, TimerRegistry) {
        let mut runtime = lock(&self.inner.runtime);
        let runtime = runtime.get_or_insert_with(|| {
            let dispatcher = EventDispatcher::spawn(self.downgrade());
            let timers = TimerRegistry::new(self.inner.coordinator.clone(), dispatcher.sender());
            Runtime { dispatcher, timers }
        });
        (runtime.dispatcher.sender(), runtime.timers.clone())
    }

    fn env(&self) -> SessionEnv {
        let (events, _) = self.runtime();
        SessionEnv {
            transport: self.inner.transport.clone(),
            coordinator: self.inner.coordinator.clone(),
            reporter: self.inner.reporter.clone(),
            secure_provider: self.inner.secure_provider.clone(),
            tickets: self.inner.tickets.clone(),
            events,
            manager: self.downgrade(),
        }
    }

    fn session(&self, id: u8) -> Result<&Arc<Session>> {
        check_session_id(id)?;
        self.inner
            .sessions
            .get(usize::from(id) - 1)
            .ok_or(DmError::OutOfRange)
    }

    /// Registers the configuration callback, run at every boot.
    pub fn register_config_callback(&self, callback: impl Fn(&mut Registration) + Send + Sync + 'static) {
        *lock(&self.inner.config_callback) = Some(Arc::new(callback));
    }

    /// Boots the manager.
    ///
    /// A wakeup boot restores the sessions and timers retained at sleep
    /// entry, while a power-on boot, or a wakeup without valid retained
    /// content, erases the retention memory and starts from the registered
    /// configuration.
    ///
    /// # Errors
    ///
    /// Fails when the manager already booted, or when the initialization
    /// callback of the boot kind is missing. Failures of single sessions
    /// and timers are reported and leave them stopped.
    pub async fn start(&self) -> Result<BootKind> {
        if self.state() != ManagerState::Uninitialized {
            return self
                .inner
                .reporter
                .check(MANAGER_CONTEXT, Err(DmError::AlreadyExist));
        }

        let result = self.boot().await;
        if result.is_err() {
            self.set_state(ManagerState::Uninitialized);
        }
        self.inner.reporter.check(MANAGER_CONTEXT, result)
    }

    async fn boot(&self) -> Result<BootKind> {
        let inner = &self.inner;
        let _job = inner.coordinator.start(JobId::Manager);
        let (_, timers) = self.runtime();

        let source = inner.wakeup_source;
        let blob = if source.is_wakeup() {
            let blob = inner.store.load();
            if blob.is_none() {
                warn!("Woken up by {source} without valid retained content, cold boot");
            }
            blob
        } else {
            None
        };

        let boot = match blob {
            Some(_) => BootKind::Wake(source),
            None => BootKind::Normal,
        };
        info!("DPM manager boots: {boot:?}");

        if boot.is_wake() {
            self.set_state(ManagerState::WakeBoot);
        } else {
            self.set_state(ManagerState::NormalBoot);
            inner.store.erase();
        }

        let mut registration = Registration::default();
        let config_callback = lock(&inner.config_callback).clone();
        match config_callback {
            Some(callback) => callback(&mut registration),
            None => warn!("No configuration callback registered"),
        }
        inner.reporter.set(registration.error.clone());
        *lock(&inner.callback_flags) = registration.flags();
        *lock(&inner.user_params_size) = registration.user_params_size;
        *lock(&inner.timer_callbacks) = registration
            .timers
            .iter()
            .map(|(id, (_, callback))| (*id, callback.clone()))
            .collect();

        let mut entries = std::mem::take(&mut registration.sessions);
        let timer_table: Vec<(u8, TimerConfig)> = match &blob {
            Some(blob) => {
                for (id, config) in &blob.sessions {
                    match entries.get_mut(id) {
                        Some(entry) => entry.config = config.clone(),
                        None => warn!("Retained session `{id}` is no longer registered"),
                    }
                }
                blob.timers.clone()
            }
            None => registration
                .timers
                .iter()
                .map(|(id, (config, _))| (*id, *config))
                .collect(),
        };
        for (id, entry) in &entries {
            if let Ok(session) = self.session(*id) {
                session.restore(&entry.config);
            }
        }
        *lock(&inner.entries) = entries;

        // The init callbacks may already seed the payload.
        if registration.user_params_size > 0 {
            if let Err(e) = inner.store.allocate_user(registration.user_params_size) {
                inner.reporter.report(MANAGER_CONTEXT, &e);
            }
        }

        match boot {
            BootKind::Normal => {
                let callback = registration.boot_init.take().ok_or(DmError::NoBootCallback)?;
                self.run_init(&callback, boot).await;
            }
            BootKind::Wake(source) => {
                if let Some(bytes) = inner.store.load_tickets() {
                    if let Err(e) = inner.tickets.restore(&bytes).await {
                        inner.reporter.report(MANAGER_CONTEXT, &e);
                    }
                }

                let callback = registration
                    .wakeup_init
                    .take()
                    .ok_or(DmError::NoWakeupCallback)?;
                self.run_init(&callback, boot).await;

                if source == WakeupSource::ExternalSignal {
                    if let Some(callback) = registration.external_wakeup.take() {
                        self.run_init(&callback, boot).await;
                    }
                }
            }
        }

        for (id, config) in timer_table {
            let Some(callback) = lock(&inner.timer_callbacks).get(&id).cloned() else {
                warn!("Retained timer `{id}` has no registered callback");
                continue;
            };
            if let Err(e) = timers.create(id, config, callback) {
                inner.reporter.report(&format!("Timer `{id}`"), &e);
            }
        }

        let ids: Vec<u8> = lock(&inner.entries).keys().copied().collect();
        for id in ids {
            if let Err(e) = self.launch(id).await {
                inner.reporter.report(&session_context(id), &e);
            }
        }

        self.set_state(ManagerState::Running);
        Ok(boot)
    }

    async fn run_init(&self, callback: &SharedInitCallback, boot: BootKind) {
        let job = self.inner.coordinator.start(JobId::Manager);
        callback
            .on_init(InitEvent {
                boot,
                job,
                manager: self.clone(),
            })
            .await;
    }

    async fn launch(&self, id: u8) -> Result<()> {
        let session = self.session(id)?;
        let Some(entry) = lock(&self.inner.entries).get(&id).cloned() else {
            return Err(DmError::OutOfRange);
        };
        session.start(entry.config, entry.callbacks, self.env()).await
    }

    /// Starts a registered session.
    ///
    /// Starting a running session does nothing.
    ///
    /// # Errors
    ///
    /// Fails when the identifier is unknown, the configuration is invalid
    /// or the session task does not come alive.
    pub async fn start_session(&self, id: u8) -> Result<()> {
        let result = self.launch(id).await;
        self.inner.reporter.check(&session_context(id), result)
    }

    /// Stops a session.
    ///
    /// Stopping a stopped session does nothing. A client which connected
    /// from an ephemeral port will pick a new one on its next start.
    ///
    /// # Errors
    ///
    /// Returns [`DmError::ForceStopped`] when the session did not stop in
    /// time and has been torn down.
    pub async fn stop_session(&self, id: u8) -> Result<()> {
        let result = match self.session(id) {
            Ok(session) => {
                let stopped = session.stop(self.inner.stop_timeout).await;
                session.forget_ephemeral_port();
                stopped
            }
            Err(e) => Err(e),
        };
        self.inner.reporter.check(&session_context(id), result)
    }

    /// Sends `data` through a session.
    ///
    /// Server sessions route the data to the peer at `ip:port`. A `UDP`
    /// client sends to `ip:port`, or to the last peer it heard from when
    /// given `0.0.0.0:0`.
    ///
    /// # Errors
    ///
    /// Returns [`DmError::NotConnected`] without a connection,
    /// [`DmError::NotFoundSubSession`] when a server has no such peer and
    /// [`DmError::SendFail`] when the socket fails.
    pub async fn send_to_session(
        &self,
        id: u8,
        ip: IpAddr,
        port: u16,
        data: &[u8],
    ) -> Result<usize> {
        let result = match self.session(id) {
            Ok(session) => session.send(ip, port, data).await,
            Err(e) => Err(e),
        };
        self.inner.reporter.check(&session_context(id), result)
    }

    /// Run status of a session.
    ///
    /// # Errors
    ///
    /// Returns [`DmError::OutOfRange`] for an invalid identifier.
    pub fn session_status(&self, id: u8) -> Result<RunStatus> {
        self.session(id).map(|session| session.status())
    }

    /// Subscribes to the run status of a session.
    ///
    /// # Errors
    ///
    /// Returns [`DmError::OutOfRange`] for an invalid identifier.
    pub fn subscribe_session(&self, id: u8) -> Result<watch::Receiver<RunStatus>> {
        self.session(id).map(|session| session.subscribe())
    }

    /// Snapshot of a session.
    ///
    /// # Errors
    ///
    /// Returns [`DmError::OutOfRange`] for an invalid identifier.
    pub fn session_info(&self, id: u8) -> Result<SessionInfo> {
        self.session(id).map(|session| session.info())
    }

    /// Configuration a session will start with.
    #[must_use]
    pub fn session_config(&self, id: u8) -> Option<SessionConfig> {
        lock(&self.inner.entries)
            .get(&id)
            .map(|entry| entry.config.clone())
    }

    fn update_session(&self, id: u8, update: impl FnOnce(&mut SessionEntry)) -> Result<()> {
        let result = check_session_id(id).and_then(|()| {
            let mut entries = lock(&self.inner.entries);
            let entry = entries.get_mut(&id).ok_or(DmError::OutOfRange)?;
            update(entry);
            Ok(())
        });
        self.inner.reporter.check(&session_context(id), result)
    }

    /// Sets the kind of a session.
    ///
    /// # Errors
    ///
    /// Returns [`DmError::OutOfRange`] when the session is not registered.
    pub fn set_session_kind(&self, id: u8, kind: SessionKind) -> Result<()> {
        self.update_session(id, |entry| entry.config.kind = kind)
    }

    /// Sets the local port of a session, zero being an ephemeral port.
    ///
    /// # Errors
    ///
    /// Returns [`DmError::OutOfRange`] when the session is not registered.
    pub fn set_session_local_port(&self, id: u8, port: u16) -> Result<()> {
        self.update_session(id, |entry| entry.config.local_port = port)
    }

    /// Sets the server address of a client session.
    ///
    /// # Errors
    ///
    /// Returns [`DmError::OutOfRange`] when the session is not registered.
    pub fn set_session_server_addr(&self, id: u8, addr: impl Into<String>) -> Result<()> {
        let addr = addr.into();
        self.update_session(id, |entry| entry.config.server_addr = addr)
    }

    /// Sets the server port of a client session.
    ///
    /// # Errors
    ///
    /// Returns [`DmError::OutOfRange`] when the session is not registered.
    pub fn set_session_server_port(&self, id: u8, port: u16) -> Result<()> {
        self.update_session(id, |entry| entry.config.server_port = port)
    }

    /// Sets the keepalive interval of a session, zero disabling it.
    ///
    /// # Errors
    ///
    /// Returns [`DmError::OutOfRange`] when the session is not registered.
    pub fn set_session_keepalive(&self, id: u8, interval_s: u32) -> Result<()> {
        self.update_session(id, |entry| entry.config.keepalive_interval_s = interval_s)
    }

    /// Sets the number of connection attempts of a client session.
    ///
    /// # Errors
    ///
    /// Returns [`DmError::OutOfRange`] when the session is not registered.
    pub fn set_session_retry_count(&self, id: u8, retry_count: u32) -> Result<()> {
        self.update_session(id, |entry| entry.config.reconnect.retry_count = retry_count)
    }

    /// Sets the wait between connection attempts of a client session.
    ///
    /// # Errors
    ///
    /// Returns [`DmError::OutOfRange`] when the session is not registered.
    pub fn set_session_wait_time(&self, id: u8, wait_time_s: u32) -> Result<()> {
        self.update_session(id, |entry| entry.config.reconnect.wait_time_s = wait_time_s)
    }

    /// Sets whether a client session reconnects forever.
    ///
    /// # Errors
    ///
    /// Returns [`DmError::OutOfRange`] when the session is not registered.
    pub fn set_session_auto_reconnect(&self, id: u8, auto_reconnect: bool) -> Result<()> {
        self.update_session(id, |entry| {
            entry.config.reconnect.auto_reconnect = auto_reconnect;
        })
    }

    /// Sets whether a session is secured.
    ///
    /// # Errors
    ///
    /// Returns [`DmError::OutOfRange`] when the session is not registered.
    pub fn set_session_secure(&self, id: u8, secure: bool) -> Result<()> {
        self.update_session(id, |entry| entry.config.secure = secure)
    }

    /// Overrides the receive timeout of a session.
    ///
    /// # Errors
    ///
    /// Returns [`DmError::OutOfRange`] when the session is not registered.
    pub fn set_session_receive_timeout(&self, id: u8, timeout_ms: Option<u32>) -> Result<()> {
        self.update_session(id, |entry| entry.config.receive_timeout_ms = timeout_ms)
    }

    /// Replaces the callbacks of a session.
    ///
    /// # Errors
    ///
    /// Returns [`DmError::OutOfRange`] when the session is not registered.
    pub fn set_session_callbacks(&self, id: u8, callbacks: Arc<dyn SessionCallbacks>) -> Result<()> {
        self.update_session(id, |entry| entry.callbacks = callbacks)
    }

    /// Arms an application timer.
    ///
    /// # Errors
    ///
    /// Fails on an invalid identifier, kind or interval, and with
    /// [`DmError::AlreadyExist`] when the timer is already armed.
    pub fn set_timer(
        &self,
        id: u8,
        kind: TimerKind,
        interval_s: u32,
        callback: impl TimerCallback,
    ) -> Result<()> {
        let callback: SharedTimerCallback = Arc::new(callback);
        let (_, timers) = self.runtime();
        let result = timers.create(id, TimerConfig::new(kind, interval_s), callback.clone());
        if result.is_ok() {
            let _ = lock(&self.inner.timer_callbacks).insert(id, callback);
        }
        self.inner.reporter.check(&format!("Timer `{id}`"), result)
    }

    /// Disarms an application timer.
    ///
    /// Disarming a timer which is not armed does nothing.
    ///
    /// # Errors
    ///
    /// Returns [`DmError::OutOfRange`] for an invalid identifier.
    pub fn unset_timer(&self, id: u8) -> Result<()> {
        let (_, timers) = self.runtime();
        let result = timers.unset(id).map(|_| ());
        self.inner.reporter.check(&format!("Timer `{id}`"), result)
    }

    /// Armed timers.
    #[must_use]
    pub fn active_timers(&self) -> Vec<(u8, TimerConfig)> {
        lock(&self.inner.runtime)
            .as_ref()
            .map(|runtime| runtime.timers.active())
            .unwrap_or_default()
    }

    /// Starts a job, which prevents sleep until its guard is released.
    #[must_use = "dropping the guard immediately completes the job"]
    pub fn job_start(&self, id: JobId) -> Job {
        self.inner.coordinator.start(id)
    }

    /// Starts an application job with a fresh identifier.
    #[must_use = "dropping the guard immediately completes the job"]
    pub fn user_job(&self) -> Job {
        self.inner.coordinator.user_job()
    }

    /// Completes a job detached from its guard.
    pub fn job_done(&self, id: JobId) -> Completion {
        self.inner.coordinator.done(id)
    }

    /// Subscribes to sleep permissions.
    ///
    /// The value changes each time the last outstanding job completes.
    #[must_use]
    pub fn subscribe_sleep(&self) -> watch::Receiver<u64> {
        self.inner.coordinator.subscribe()
    }

    /// Waits until no job is outstanding.
    pub async fn wait_sleep_permission(&self) {
        self.inner.coordinator.wait_idle().await;
    }

    /// Prepares the device for sleep.
    ///
    /// Waits for every outstanding job, stops timers and sessions, and saves
    /// the state to retain: session configurations with what the sessions
    /// observed, armed timers and session tickets.
    ///
    /// # Errors
    ///
    /// Fails when the state cannot be saved to retention memory.
    pub async fn request_sleep(&self) -> Result<()> {
        let result = self.enter_sleep().await;
        self.inner.reporter.check(MANAGER_CONTEXT, result)
    }

    async fn enter_sleep(&self) -> Result<()> {
        let inner = &self.inner;

        match inner.sleep_timeout {
            Some(timeout) => {
                if tokio::time::timeout(timeout, inner.coordinator.wait_idle())
                    .await
                    .is_err()
                {
                    warn!(
                        "Sleep forced with outstanding jobs: {:?}",
                        inner.coordinator.outstanding_jobs()
                    );
                }
            }
            None => inner.coordinator.wait_idle().await,
        }

        self.set_state(ManagerState::SleepPending);
        info!("DPM manager enters sleep");

        let runtime = lock(&inner.runtime).take();
        let timer_table = runtime
            .as_ref()
            .map(|runtime| runtime.timers.active())
            .unwrap_or_default();
        if let Some(runtime) = &runtime {
            runtime.timers.unset_all();
        }

        for session in &inner.sessions {
            if let Err(e) = session.stop(inner.stop_timeout).await {
                inner.reporter.report(&session_context(session.id()), &e);
            }
        }

        let sessions = {
            let mut entries = lock(&inner.entries);
            for (id, entry) in entries.iter_mut() {
                let Ok(session) = self.session(*id) else {
                    continue;
                };
                let observed = session.observed();
                if observed.peer.is_some() {
                    entry.config.peer = observed.peer;
                }
                if let Some(port) = observed.local_port {
                    entry.config.local_port = port;
                }
            }
            entries
                .iter()
                .map(|(id, entry)| (*id, entry.config.clone()))
                .collect()
        };

        let blob = RetentionBlob {
            sessions,
            timers: timer_table,
            user_params_size: *lock(&inner.user_params_size),
            callbacks: *lock(&inner.callback_flags),
        };
        inner.store.save(&blob)?;

        let tickets = inner.tickets.snapshot().await;
        if let Err(e) = inner.store.save_tickets(&tickets) {
            inner.reporter.report(MANAGER_CONTEXT, &DmError::TicketSaveFail);
            debug!("Tickets not saved: {e}");
        }

        if let Some(runtime) = runtime {
            runtime.dispatcher.shutdown().await;
        }
        Ok(())
    }

    /// Reads the retained application payload.
    #[must_use]
    pub fn user_params(&self) -> Option<Vec<u8>> {
        self.inner.store.read_user()
    }

    /// Writes the retained application payload.
    ///
    /// # Errors
    ///
    /// Returns [`DmError::InvalidSize`] when `bytes` does not match the
    /// registered size.
    pub fn set_user_params(&self, bytes: &[u8]) -> Result<()> {
        let result = self.inner.store.write_user(bytes);
        self.inner.reporter.check(MANAGER_CONTEXT, result)
    }

    /// Logs the status of every session.
    pub fn print_session_info(&self) {
        for session in &self.inner.sessions {
            let info = session.info();
            let Some(kind) = info.kind else {
                continue;
            };
            info!(
                "Session `{}`: {kind}, {}{}, peer {:?}, local port {:?}, peers {:?}",
                info.id,
                info.status,
                if info.force_stopped { " (force stopped)" } else { "" },
                info.peer,
                info.local_port,
                info.sub_sessions,
            );
        }
    }

    /// Logs the configuration of a session.
    ///
    /// # Errors
    ///
    /// Returns [`DmError::OutOfRange`] when the session is not registered.
    pub fn print_session_config(&self, id: u8) -> Result<()> {
        let result = check_session_id(id).and_then(|()| {
            let config = self.session_config(id).ok_or(DmError::OutOfRange)?;
            info!("Session `{id}` configuration: {config:?}");
            Ok(())
        });
        self.inner.reporter.check(&session_context(id), result)
    }
}
