use alloc::borrow::Cow;
use alloc::string::String;

use core::fmt;
use core::net::SocketAddr;
use core::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{DmError, Result};

/// Maximum number of sessions a manager drives.
pub const MAX_SESSIONS: u8 = 4;

/// Maximum number of application timers.
pub const MAX_TIMERS: u8 = 4;

/// Maximum number of peers a server session serves at the same time.
pub const MAX_SUB_SESSIONS: usize = 2;

/// Size of the receive buffer of a session.
pub const RX_BUFFER_SIZE: usize = 1500;

// Receive timeouts per session kind, plain and secure, in milliseconds.
const TCP_CLIENT_RX_TIMEOUT: (u64, u64) = (100, 1000);
const TCP_SERVER_RX_TIMEOUT: (u64, u64) = (100, 2000);
const UDP_CLIENT_RX_TIMEOUT: (u64, u64) = (300, 1000);
const UDP_SERVER_RX_TIMEOUT: (u64, u64) = (300, 2000);

/// Checks that a session identifier lies in `1..=MAX_SESSIONS`.
///
/// # Errors
///
/// Returns [`DmError::OutOfRange`] for any other identifier.
#[inline]
pub const fn check_session_id(id: u8) -> Result<()> {
    if id >= 1 && id <= MAX_SESSIONS {
        Ok(())
    } else {
        Err(DmError::OutOfRange)
    }
}

/// Checks that a timer identifier lies in `1..=MAX_TIMERS`.
///
/// # Errors
///
/// Returns [`DmError::OutOfRange`] for any other identifier.
#[inline]
pub const fn check_timer_id(id: u8) -> Result<()> {
    if id >= 1 && id <= MAX_TIMERS {
        Ok(())
    } else {
        Err(DmError::OutOfRange)
    }
}

/// Session kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum SessionKind {
    /// `TCP` server.
    TcpServer = 1,
    /// `TCP` client.
    TcpClient = 2,
    /// `UDP` server.
    UdpServer = 3,
    /// `UDP` client.
    UdpClient = 4,
}

impl fmt::Display for SessionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::TcpServer => "TCP server",
            Self::TcpClient => "TCP client",
            Self::UdpServer => "UDP server",
            Self::UdpClient => "UDP client",
        })
    }
}

impl SessionKind {
    /// Whether the session accepts peers.
    #[must_use]
    pub const fn is_server(self) -> bool {
        matches!(self, Self::TcpServer | Self::UdpServer)
    }

    /// Whether the session reaches out to a server.
    #[must_use]
    pub const fn is_client(self) -> bool {
        !self.is_server()
    }

    /// Whether the session runs over `TCP`.
    #[must_use]
    pub const fn is_tcp(self) -> bool {
        matches!(self, Self::TcpServer | Self::TcpClient)
    }
}

/// Timer kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum TimerKind {
    /// A timer which is never armed.
    #[default]
    None = 0,
    /// A timer firing at every interval.
    Periodic = 1,
    /// A timer firing once.
    OneShot = 2,
}

impl fmt::Display for TimerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::None => "none",
            Self::Periodic => "periodic",
            Self::OneShot => "one-shot",
        })
    }
}

/// How a client session reacts to a failed connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconnectPolicy {
    /// Number of connection attempts.
    pub retry_count: u32,
    /// Seconds between two attempts.
    pub wait_time_s: u32,
    /// Whether to keep retrying forever once all attempts have failed.
    pub auto_reconnect: bool,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            retry_count: 1,
            wait_time_s: 1,
            auto_reconnect: false,
        }
    }
}

impl ReconnectPolicy {
    /// Time between two connection attempts.
    ///
    /// A zero wait time falls back to one second.
    #[must_use]
    pub const fn wait_time(&self) -> Duration {
        if self.wait_time_s == 0 {
            Duration::from_secs(1)
        } else {
            Duration::from_secs(self.wait_time_s as u64)
        }
    }

    /// Number of connection attempts, never less than one.
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        if self.retry_count == 0 {
            1
        } else {
            self.retry_count
        }
    }
}

/// Configuration of a network session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Session kind.
    pub kind: SessionKind,
    /// Local port.
    ///
    /// Servers listen on it. Clients bind to it when it is not zero,
    /// otherwise they receive an ephemeral port.
    pub local_port: u16,
    /// Server address, either an IP address or a host name.
    #[serde(default)]
    pub server_addr: String,
    /// Server port.
    #[serde(default)]
    pub server_port: u16,
    /// Last observed peer.
    ///
    /// For clients this is the resolved server, for servers the last
    /// peer which reached the session.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer: Option<SocketAddr>,
    /// Keepalive interval in seconds, zero to disable keepalive.
    #[serde(default)]
    pub keepalive_interval_s: u32,
    /// Reconnection policy.
    #[serde(default)]
    pub reconnect: ReconnectPolicy,
    /// Whether the session runs over `TLS` or `DTLS`.
    #[serde(default)]
    pub secure: bool,
    /// Receive timeout override in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receive_timeout_ms: Option<u32>,
}

impl SessionConfig {
    /// Creates a [`SessionConfig`] for the given kind.
    #[must_use]
    pub const fn new(kind: SessionKind) -> Self {
        Self {
            kind,
            local_port: 0,
            server_addr: String::new(),
            server_port: 0,
            peer: None,
            keepalive_interval_s: 0,
            reconnect: ReconnectPolicy {
                retry_count: 1,
                wait_time_s: 1,
                auto_reconnect: false,
            },
            secure: false,
            receive_timeout_ms: None,
        }
    }

    /// Creates a `TCP` server configuration listening on `port`.
    #[must_use]
    pub fn tcp_server(port: u16) -> Self {
        Self::new(SessionKind::TcpServer).local_port(port)
    }

    /// Creates a `TCP` client configuration reaching `addr:port`.
    #[must_use]
    pub fn tcp_client(addr: impl Into<String>, port: u16) -> Self {
        Self::new(SessionKind::TcpClient).server(addr, port)
    }

    /// Creates a `UDP` server configuration bound to `port`.
    #[must_use]
    pub fn udp_server(port: u16) -> Self {
        Self::new(SessionKind::UdpServer).local_port(port)
    }

    /// Creates a `UDP` client configuration reaching `addr:port`.
    #[must_use]
    pub fn udp_client(addr: impl Into<String>, port: u16) -> Self {
        Self::new(SessionKind::UdpClient).server(addr, port)
    }

    /// Sets the local port.
    #[must_use]
    #[inline]
    pub const fn local_port(mut self, port: u16) -> Self {
        self.local_port = port;
        self
    }

    /// Sets the server address and port.
    #[must_use]
    #[inline]
    pub fn server(mut self, addr: impl Into<String>, port: u16) -> Self {
        self.server_addr = addr.into();
        self.server_port = port;
        self
    }

    /// Sets the keepalive interval in seconds.
    #[must_use]
    #[inline]
    pub const fn keepalive(mut self, interval_s: u32) -> Self {
        self.keepalive_interval_s = interval_s;
        self
    }

    /// Sets the reconnection policy.
    #[must_use]
    #[inline]
    pub const fn reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    /// Enables `TLS` or `DTLS`.
    #[must_use]
    #[inline]
    pub const fn secure(mut self) -> Self {
        self.secure = true;
        self
    }

    /// Overrides the receive timeout.
    #[must_use]
    #[inline]
    pub const fn receive_timeout_ms(mut self, timeout_ms: u32) -> Self {
        self.receive_timeout_ms = Some(timeout_ms);
        self
    }

    /// Checks the configuration invariants.
    ///
    /// Clients need a server address and a server port, servers need a
    /// local port.
    ///
    /// # Errors
    ///
    /// Returns [`DmError::InvalidConfig`] describing the first broken
    /// invariant.
    pub fn validate(&self) -> Result<()> {
        if self.kind.is_client() {
            if self.server_addr.trim().is_empty() {
                return Err(DmError::InvalidConfig(Cow::Borrowed(
                    "empty server address",
                )));
            }
            if self.server_port == 0 {
                return Err(DmError::InvalidConfig(Cow::Borrowed("zero server port")));
            }
        } else if self.local_port == 0 {
            return Err(DmError::InvalidConfig(Cow::Borrowed("zero local port")));
        }
        Ok(())
    }

    /// The receive timeout of the session.
    ///
    /// Returns the override when present, otherwise the default for the
    /// session kind and security mode.
    #[must_use]
    pub fn receive_timeout(&self) -> Duration {
        if let Some(timeout_ms) = self.receive_timeout_ms {
            return Duration::from_millis(u64::from(timeout_ms));
        }

        let (plain, secure) = match self.kind {
            SessionKind::TcpClient => TCP_CLIENT_RX_TIMEOUT,
            SessionKind::TcpServer => TCP_SERVER_RX_TIMEOUT,
            SessionKind::UdpClient => UDP_CLIENT_RX_TIMEOUT,
            SessionKind::UdpServer => UDP_SERVER_RX_TIMEOUT,
        };

        Duration::from_millis(if self.secure { secure } else { plain })
    }
}

/// Configuration of an application timer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimerConfig {
    /// Timer kind.
    pub kind: TimerKind,
    /// Interval in seconds.
    pub interval_s: u32,
}

impl TimerConfig {
    /// Creates a [`TimerConfig`].
    #[must_use]
    pub const fn new(kind: TimerKind, interval_s: u32) -> Self {
        Self { kind, interval_s }
    }

    /// Checks that the timer can be armed.
    ///
    /// # Errors
    ///
    /// Returns [`DmError::TimerTypeInvalid`] for [`TimerKind::None`], and
    /// [`DmError::InvalidInterval`] for a zero interval.
    pub const fn validate(&self) -> Result<()> {
        if matches!(self.kind, TimerKind::None) {
            return Err(DmError::TimerTypeInvalid);
        }
        if self.interval_s == 0 {
            return Err(DmError::InvalidInterval);
        }
        Ok(())
    }

    /// Timer interval.
    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_s as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_needs_server() {
        let config = SessionConfig::tcp_client("", 8080);
        assert!(matches!(config.validate(), Err(DmError::InvalidConfig(_))));

        // Blank address.
        let config = SessionConfig::tcp_client("   ", 8080);
        assert!(config.validate().is_err());

        let config = SessionConfig::udp_client("10.0.0.1", 0);
        assert!(config.validate().is_err());

        let config = SessionConfig::tcp_client("10.0.0.1", 8080);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn server_needs_local_port() {
        assert!(SessionConfig::tcp_server(0).validate().is_err());
        assert!(SessionConfig::udp_server(0).validate().is_err());
        assert!(SessionConfig::tcp_server(9000).validate().is_ok());
        assert!(SessionConfig::udp_server(9000).validate().is_ok());
    }

    #[test]
    fn receive_timeouts() {
        let config = SessionConfig::tcp_client("10.0.0.1", 8080);
        assert_eq!(config.receive_timeout(), Duration::from_millis(100));
        assert_eq!(
            config.clone().secure().receive_timeout(),
            Duration::from_millis(1000)
        );

        let config = SessionConfig::udp_server(5684).secure();
        assert_eq!(config.receive_timeout(), Duration::from_millis(2000));

        let config = SessionConfig::udp_client("10.0.0.1", 5683).receive_timeout_ms(50);
        assert_eq!(config.receive_timeout(), Duration::from_millis(50));
    }

    #[test]
    fn identifiers() {
        assert_eq!(check_session_id(0), Err(DmError::OutOfRange));
        assert!(check_session_id(1).is_ok());
        assert!(check_session_id(MAX_SESSIONS).is_ok());
        assert_eq!(check_session_id(MAX_SESSIONS + 1), Err(DmError::OutOfRange));
        assert_eq!(check_timer_id(5), Err(DmError::OutOfRange));
    }

    #[test]
    fn timer_validation() {
        assert_eq!(
            TimerConfig::new(TimerKind::None, 5).validate(),
            Err(DmError::TimerTypeInvalid)
        );
        assert_eq!(
            TimerConfig::new(TimerKind::Periodic, 0).validate(),
            Err(DmError::InvalidInterval)
        );
        assert!(TimerConfig::new(TimerKind::OneShot, 1).validate().is_ok());
    }

    #[test]
    fn reconnect_policy() {
        let policy = ReconnectPolicy {
            retry_count: 0,
            wait_time_s: 0,
            auto_reconnect: true,
        };
        assert_eq!(policy.attempts(), 1);
        assert_eq!(policy.wait_time(), Duration::from_secs(1));
    }
}
