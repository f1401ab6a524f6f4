use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use dpm::error::{DmError, Result};

use serde::{Deserialize, Serialize};

use tokio::sync::Mutex as AsyncMutex;

use tracing::{debug, warn};

use crate::report::ErrorReporter;
use crate::transport::StreamSocket;

/// Number of handshake retries after the first attempt.
pub const HANDSHAKE_RETRY_COUNT: u32 = 2;

/// Minimum and maximum handshake timeouts of `DTLS` sessions.
pub const DTLS_HANDSHAKE_TIMEOUT: (Duration, Duration) =
    (Duration::from_millis(100), Duration::from_millis(400));

/// Minimum and maximum handshake timeouts of `TLS` sessions.
pub const TLS_HANDSHAKE_TIMEOUT: (Duration, Duration) =
    (Duration::from_millis(1000), Duration::from_millis(8000));

/// The side of a secure session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecureRole {
    /// Initiates the handshake.
    Client,
    /// Answers the handshake.
    Server,
}

/// The secure protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecureProtocol {
    /// `TLS` over a stream.
    Tls,
    /// `DTLS` over datagrams.
    Dtls,
}

/// Handshake settings.
///
/// Initialized with the defaults of the role and protocol, and then handed to
/// the secure setup callback of the session for customization.
#[derive(Clone)]
pub struct SecureSettings {
    /// Session role.
    pub role: SecureRole,
    /// Session protocol.
    pub protocol: SecureProtocol,
    /// Minimum handshake timeout.
    pub handshake_timeout_min: Duration,
    /// Maximum handshake timeout.
    pub handshake_timeout_max: Duration,
    /// Number of handshake retries after the first attempt.
    pub retry_count: u32,
    /// Whether replayed records are rejected, `DTLS` only.
    pub anti_replay: bool,
    /// Whether a server verifies clients through cookies, `DTLS` only.
    pub cookies: bool,
    /// Whether the peer certificate is verified.
    pub verify_peer: bool,
    /// Server name indication.
    pub server_name: Option<String>,
    /// Certificate authority chain.
    pub ca_cert: Option<Vec<u8>>,
    /// Own certificate.
    pub cert: Option<Vec<u8>>,
    /// Own private key.
    pub private_key: Option<Vec<u8>>,
}

impl fmt::Debug for SecureSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecureSettings")
            .field("role", &self.role)
            .field("protocol", &self.protocol)
            .field("handshake_timeout_min", &self.handshake_timeout_min)
            .field("handshake_timeout_max", &self.handshake_timeout_max)
            .field("retry_count", &self.retry_count)
            .field("anti_replay", &self.anti_replay)
            .field("cookies", &self.cookies)
            .field("verify_peer", &self.verify_peer)
            .field("server_name", &self.server_name)
            .field("ca_cert", &self.ca_cert.as_ref().map(Vec::len))
            .field("cert", &self.cert.as_ref().map(Vec::len))
            .field("private_key", &self.private_key.as_ref().map(|_| "<hidden>"))
            .finish()
    }
}

impl SecureSettings {
    /// Creates the default [`SecureSettings`] of a role and protocol.
    #[must_use]
    pub const fn new(role: SecureRole, protocol: SecureProtocol) -> Self {
        let (handshake_timeout_min, handshake_timeout_max) = match protocol {
            SecureProtocol::Tls => TLS_HANDSHAKE_TIMEOUT,
            SecureProtocol::Dtls => DTLS_HANDSHAKE_TIMEOUT,
        };
        let datagram = matches!(protocol, SecureProtocol::Dtls);

        Self {
            role,
            protocol,
            handshake_timeout_min,
            handshake_timeout_max,
            retry_count: HANDSHAKE_RETRY_COUNT,
            anti_replay: datagram,
            cookies: datagram && matches!(role, SecureRole::Server),
            verify_peer: false,
            server_name: None,
            ca_cert: None,
            cert: None,
            private_key: None,
        }
    }

    /// Timeout of a handshake attempt.
    ///
    /// Doubles from the minimum at every attempt, up to the maximum.
    #[must_use]
    pub fn attempt_timeout(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.handshake_timeout_min
            .saturating_mul(factor)
            .min(self.handshake_timeout_max)
    }

    fn validate(&self) -> Result<()> {
        if self.handshake_timeout_min.is_zero()
            || self.handshake_timeout_min > self.handshake_timeout_max
        {
            return Err(DmError::SecureInitFail(
                "invalid handshake timeout pair".into(),
            ));
        }
        if self.role == SecureRole::Server && (self.cert.is_none() || self.private_key.is_none()) {
            return Err(DmError::SecureInitFail(
                "a server needs a certificate and a private key".into(),
            ));
        }
        if self.verify_peer && self.ca_cert.is_none() {
            return Err(DmError::SecureInitFail(
                "peer verification needs a certificate authority".into(),
            ));
        }
        if self.protocol == SecureProtocol::Tls && (self.anti_replay || self.cookies) {
            return Err(DmError::SecureInitFail(
                "anti-replay and cookies apply to DTLS only".into(),
            ));
        }
        Ok(())
    }
}

/// A saved secure session, used to resume without a full handshake.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionTicket(pub Vec<u8>);

impl fmt::Debug for SessionTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionTicket({} bytes)", self.0.len())
    }
}

/// An established secure session.
#[derive(Debug)]
pub struct Established {
    /// The socket carrying decrypted application data.
    pub socket: Arc<dyn StreamSocket>,
    /// The ticket to resume the session later, if the peer issued one.
    pub ticket: Option<SessionTicket>,
}

/// A failed handshake attempt.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandshakeError {
    /// The `DTLS` server asked to repeat the handshake with a cookie.
    #[error("Hello verify required")]
    HelloVerifyRequired,
    /// The attempt timed out.
    #[error("Handshake timeout")]
    Timeout,
    /// The peer refused to resume the offered session.
    #[error("Session ticket rejected")]
    TicketRejected,
    /// The handshake failed for good.
    #[error("{0}")]
    Failed(String),
}

/// Future returned by [`SecureProvider::handshake`].
pub type HandshakeFuture<'a> =
    Pin<Box<dyn Future<Output = std::result::Result<Established, HandshakeError>> + Send + 'a>>;

/// The `TLS` and `DTLS` engine.
pub trait SecureProvider: fmt::Debug + Send + Sync {
    /// Runs one handshake attempt over `socket`.
    ///
    /// When a `ticket` is given, the engine tries to resume the session it
    /// describes.
    fn handshake<'a>(
        &'a self,
        socket: Arc<dyn StreamSocket>,
        settings: &'a SecureSettings,
        ticket: Option<SessionTicket>,
    ) -> HandshakeFuture<'a>;
}

type TicketSlot = Arc<AsyncMutex<Option<SessionTicket>>>;

/// Saved session tickets, keyed by session name.
///
/// Every entry has its own lock, so sessions sharing a name are serialized
/// while other sessions proceed.
#[derive(Debug, Clone, Default)]
pub struct TicketCache {
    entries: Arc<Mutex<HashMap<String, TicketSlot>>>,
}

impl TicketCache {
    /// Creates an empty [`TicketCache`].
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, name: &str) -> TicketSlot {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(name.to_owned())
            .or_default()
            .clone()
    }

    fn slots(&self) -> Vec<(String, TicketSlot)> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(name, slot)| (name.clone(), slot.clone()))
            .collect()
    }

    /// Returns the ticket saved for `name`.
    pub async fn get(&self, name: &str) -> Option<SessionTicket> {
        self.slot(name).lock().await.clone()
    }

    /// Saves a ticket for `name`.
    pub async fn put(&self, name: &str, ticket: SessionTicket) {
        *self.slot(name).lock().await = Some(ticket);
    }

    /// Forgets the ticket saved for `name`.
    pub async fn remove(&self, name: &str) {
        *self.slot(name).lock().await = None;
    }

    /// Serializes all saved tickets.
    pub async fn snapshot(&self) -> Vec<u8> {
        let mut tickets = HashMap::new();
        for (name, slot) in self.slots() {
            if let Some(ticket) = slot.lock().await.clone() {
                let _ = tickets.insert(name, ticket);
            }
        }
        serde_json::to_vec(&tickets).unwrap_or_default()
    }

    /// Restores tickets serialized by [`TicketCache::snapshot`].
    ///
    /// # Errors
    ///
    /// Returns [`DmError::TicketRestoreFail`] when the content is malformed.
    pub async fn restore(&self, bytes: &[u8]) -> Result<()> {
        let tickets: HashMap<String, SessionTicket> =
            serde_json::from_slice(bytes).map_err(|e| {
                warn!("Saved session tickets are malformed: {e}");
                DmError::TicketRestoreFail
            })?;

        for (name, ticket) in tickets {
            self.put(&name, ticket).await;
        }
        Ok(())
    }
}

/// The secure layer of a session.
#[derive(Debug)]
pub struct SecureContext {
    name: String,
    settings: SecureSettings,
    cache: TicketCache,
    ticket: Option<SessionTicket>,
}

impl SecureContext {
    /// Sets up a secure context for the session called `name`.
    ///
    /// The defaults of `role` and `protocol` are passed to `configure`, and
    /// any ticket saved under `name` is installed to resume the previous
    /// secure session.
    ///
    /// # Errors
    ///
    /// Returns [`DmError::SecureInitFail`] when the settings are
    /// inconsistent.
    pub async fn setup(
        name: &str,
        role: SecureRole,
        protocol: SecureProtocol,
        cache: TicketCache,
        configure: impl FnOnce(&mut SecureSettings),
    ) -> Result<Self> {
        let mut settings = SecureSettings::new(role, protocol);
        configure(&mut settings);
        settings.validate()?;

        let ticket = cache.get(name).await;
        if ticket.is_some() {
            debug!("Session `{name}` resumes a saved secure session");
        }

        Ok(Self {
            name: name.to_owned(),
            settings,
            cache,
            ticket,
        })
    }

    /// Handshake settings.
    #[must_use]
    pub const fn settings(&self) -> &SecureSettings {
        &self.settings
    }

    /// Whether a saved ticket is installed.
    #[must_use]
    pub const fn has_ticket(&self) -> bool {
        self.ticket.is_some()
    }

    /// Runs the handshake over `socket`.
    ///
    /// Timeouts and `DTLS` hello verify requests are retried up to the retry
    /// count. A rejected ticket is forgotten and the handshake repeated in
    /// full. On success the new ticket is saved under the session name.
    ///
    /// # Errors
    ///
    /// Returns [`DmError::HandshakeFail`] when the handshake fails or all
    /// attempts are exhausted.
    pub(crate) async fn handshake(
        &mut self,
        provider: &dyn SecureProvider,
        socket: Arc<dyn StreamSocket>,
        reporter: &ErrorReporter,
    ) -> Result<Arc<dyn StreamSocket>> {
        let attempts = self.settings.retry_count.saturating_add(1);

        for attempt in 0..attempts {
            let timeout = self.settings.attempt_timeout(attempt);
            let handshake = provider.handshake(socket.clone(), &self.settings, self.ticket.clone());

            let outcome = tokio::time::timeout(timeout, handshake)
                .await
                .unwrap_or(Err(HandshakeError::Timeout));

            match outcome {
                Ok(Established { socket, ticket }) => {
                    if let Some(ticket) = ticket {
                        self.cache.put(&self.name, ticket.clone()).await;
                        self.ticket = Some(ticket);
                    }
                    debug!("Session `{}` secured at attempt {}", self.name, attempt + 1);
                    return Ok(socket);
                }
                Err(HandshakeError::HelloVerifyRequired) => {
                    debug!("Session `{}`: hello verify required, restart handshake", self.name);
                }
                Err(HandshakeError::Timeout) => {
                    warn!(
                        "Session `{}`: handshake attempt {} timed out after {timeout:?}",
                        self.name,
                        attempt + 1
                    );
                }
                Err(HandshakeError::TicketRejected) => {
                    self.ticket = None;
                    self.cache.remove(&self.name).await;
                    reporter.report(&format!("Session `{}`", self.name), &DmError::TicketRestoreFail);
                }
                Err(HandshakeError::Failed(reason)) => {
                    return Err(DmError::HandshakeFail(reason.into()));
                }
            }
        }

        Err(DmError::HandshakeFail(
            format!("no handshake after {attempts} attempts").into(),
        ))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::VecDeque;

    use tokio::time::Instant;

    use crate::transport::{MemoryTransport, Transport};

    use super::*;

    // A provider replaying a script of outcomes, one per attempt.
    #[derive(Debug, Default)]
    pub(crate) struct ScriptedProvider {
        script: Mutex<VecDeque<Option<HandshakeError>>>,
        offered: Mutex<Vec<Option<SessionTicket>>>,
        pub(crate) stall: Option<Duration>,
    }

    impl ScriptedProvider {
        pub(crate) fn new(script: impl IntoIterator<Item = Option<HandshakeError>>) -> Self {
            Self {
                script: Mutex::new(script.into_iter().collect()),
                ..Self::default()
            }
        }

        pub(crate) fn offered(&self) -> Vec<Option<SessionTicket>> {
            self.offered.lock().unwrap().clone()
        }
    }

    impl SecureProvider for ScriptedProvider {
        fn handshake<'a>(
            &'a self,
            socket: Arc<dyn StreamSocket>,
            _settings: &'a SecureSettings,
            ticket: Option<SessionTicket>,
        ) -> HandshakeFuture<'a> {
            Box::pin(async move {
                self.offered.lock().unwrap().push(ticket);
                let next = self.script.lock().unwrap().pop_front().flatten();
                if let Some(stall) = self.stall {
                    tokio::time::sleep(stall).await;
                }
                match next {
                    Some(error) => Err(error),
                    None => Ok(Established {
                        socket,
                        ticket: Some(SessionTicket(b"resume".to_vec())),
                    }),
                }
            })
        }
    }

    async fn socket() -> Arc<dyn StreamSocket> {
        let transport = MemoryTransport::new();
        let _listener = transport.listen(4433).await.unwrap();
        transport
            .connect(0, "127.0.0.1:4433".parse().unwrap(), false)
            .await
            .unwrap()
    }

    async fn context(cache: &TicketCache) -> SecureContext {
        SecureContext::setup(
            "DPM_SESS2",
            SecureRole::Client,
            SecureProtocol::Dtls,
            cache.clone(),
            |_| {},
        )
        .await
        .unwrap()
    }

    #[test]
    fn defaults_and_backoff() {
        let settings = SecureSettings::new(SecureRole::Client, SecureProtocol::Dtls);
        assert!(settings.anti_replay);
        assert!(!settings.cookies);
        assert_eq!(settings.attempt_timeout(0), Duration::from_millis(100));
        assert_eq!(settings.attempt_timeout(1), Duration::from_millis(200));
        assert_eq!(settings.attempt_timeout(2), Duration::from_millis(400));
        assert_eq!(settings.attempt_timeout(40), Duration::from_millis(400));

        let settings = SecureSettings::new(SecureRole::Server, SecureProtocol::Tls);
        assert!(!settings.anti_replay);
        assert_eq!(settings.attempt_timeout(0), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn setup_validation() {
        let cache = TicketCache::new();

        let error = SecureContext::setup(
            "DPM_SESS1",
            SecureRole::Server,
            SecureProtocol::Tls,
            cache.clone(),
            |_| {},
        )
        .await
        .unwrap_err();
        assert!(matches!(error, DmError::SecureInitFail(_)));

        let context = SecureContext::setup(
            "DPM_SESS1",
            SecureRole::Server,
            SecureProtocol::Tls,
            cache,
            |settings| {
                settings.cert = Some(b"cert".to_vec());
                settings.private_key = Some(b"key".to_vec());
            },
        )
        .await
        .unwrap();
        assert!(!context.has_ticket());
    }

    #[tokio::test(start_paused = true)]
    async fn hello_verify_then_success() {
        let cache = TicketCache::new();
        let provider = ScriptedProvider::new([Some(HandshakeError::HelloVerifyRequired), None]);
        let mut context = context(&cache).await;

        let _ = context
            .handshake(&provider, socket().await, &ErrorReporter::default())
            .await
            .unwrap();
        assert_eq!(provider.offered().len(), 2);
        assert_eq!(cache.get("DPM_SESS2").await, Some(SessionTicket(b"resume".to_vec())));

        // The next context of the same session resumes.
        let mut context = self::context(&cache).await;
        assert!(context.has_ticket());
        let provider = ScriptedProvider::new([None]);
        let _ = context
            .handshake(&provider, socket().await, &ErrorReporter::default())
            .await
            .unwrap();
        assert_eq!(provider.offered(), vec![Some(SessionTicket(b"resume".to_vec()))]);
    }

    #[tokio::test(start_paused = true)]
    async fn bounded_retries() {
        let cache = TicketCache::new();
        let mut provider = ScriptedProvider::new([]);
        // Every attempt outlives its timeout.
        provider.stall = Some(Duration::from_secs(10));
        let mut context = context(&cache).await;

        let start = Instant::now();
        let error = context
            .handshake(&provider, socket().await, &ErrorReporter::default())
            .await
            .unwrap_err();

        assert!(matches!(error, DmError::HandshakeFail(_)));
        assert_eq!(provider.offered().len(), 3);
        // 100 ms, then 200 ms, then 400 ms.
        assert_eq!(start.elapsed(), Duration::from_millis(700));
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_ticket() {
        let cache = TicketCache::new();
        cache.put("DPM_SESS2", SessionTicket(b"stale".to_vec())).await;
        let provider = ScriptedProvider::new([Some(HandshakeError::TicketRejected), None]);
        let mut context = context(&cache).await;

        let codes = Arc::new(Mutex::new(Vec::new()));
        let reporter = ErrorReporter::default();
        let sink = codes.clone();
        reporter.set(Some(Arc::new(move |code: u8, _: &str| sink.lock().unwrap().push(code))));

        let _ = context
            .handshake(&provider, socket().await, &reporter)
            .await
            .unwrap();

        assert_eq!(
            provider.offered(),
            vec![Some(SessionTicket(b"stale".to_vec())), None]
        );
        assert_eq!(*codes.lock().unwrap(), vec![0x1B]);
        assert_eq!(cache.get("DPM_SESS2").await, Some(SessionTicket(b"resume".to_vec())));
    }

    #[tokio::test]
    async fn fatal_failure() {
        let cache = TicketCache::new();
        let provider = ScriptedProvider::new([Some(HandshakeError::Failed("bad certificate".into()))]);
        let mut context = context(&cache).await;

        let error = context
            .handshake(&provider, socket().await, &ErrorReporter::default())
            .await
            .unwrap_err();
        assert_eq!(error, DmError::HandshakeFail("bad certificate".into()));
        assert_eq!(provider.offered().len(), 1);
        assert!(cache.get("DPM_SESS2").await.is_none());
    }

    #[tokio::test]
    async fn snapshot_and_restore() {
        let cache = TicketCache::new();
        cache.put("DPM_SESS1", SessionTicket(vec![1, 2])).await;
        cache.put("DPM_SESS3", SessionTicket(vec![3])).await;
        cache.remove("DPM_SESS3").await;

        let restored = TicketCache::new();
        restored.restore(&cache.snapshot().await).await.unwrap();
        assert_eq!(restored.get("DPM_SESS1").await, Some(SessionTicket(vec![1, 2])));
        assert!(restored.get("DPM_SESS3").await.is_none());

        assert_eq!(restored.restore(b"garbage").await, Err(DmError::TicketRestoreFail));
    }
}
