use alloc::borrow::Cow;
use alloc::vec::Vec;

use serde::{Deserialize, Serialize};

use crate::config::{MAX_SESSIONS, MAX_TIMERS, SessionConfig, TimerConfig};
use crate::error::{DmError, Result};

/// Sentinel opening a valid retention blob.
pub const MAGIC: u32 = 0xDEAD_BEAF;

/// Name of the retention region holding the blob.
pub const CONFIG_REGION: &str = "DPM_CONFIG";

/// Name of the retention region holding the application payload.
pub const USER_REGION: &str = "DPM_USER_PARAMS";

/// Name of the retention region holding the saved session tickets.
pub const TICKET_REGION: &str = "DPM_TLS_TICKETS";

/// Default capacity of the blob region in bytes.
pub const CONFIG_REGION_SIZE: usize = 4096;

// Magic code and body length, both little endian.
const HEADER_SIZE: usize = 8;

/// Which callbacks were registered when the blob was written.
///
/// Callbacks cannot cross a power cycle, they are registered again at every
/// boot. The flags let a wake boot detect a registration which changed
/// between two boots.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallbackFlags {
    /// Boot initialization callback.
    pub boot_init: bool,
    /// Wakeup initialization callback.
    pub wakeup_init: bool,
    /// External wakeup callback.
    pub external_wakeup: bool,
    /// Error callback.
    pub error: bool,
}

/// The state which survives sleep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionBlob {
    /// Session configurations by identifier.
    pub sessions: Vec<(u8, SessionConfig)>,
    /// Timer configurations by identifier.
    pub timers: Vec<(u8, TimerConfig)>,
    /// Size of the application payload region.
    pub user_params_size: usize,
    /// Registered callbacks.
    pub callbacks: CallbackFlags,
}

impl RetentionBlob {
    /// Creates an empty [`RetentionBlob`].
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the configuration of a session.
    #[must_use]
    pub fn session(&self, id: u8) -> Option<&SessionConfig> {
        self.sessions
            .iter()
            .find_map(|(session_id, config)| (*session_id == id).then_some(config))
    }

    /// Returns the configuration of a timer.
    #[must_use]
    pub fn timer(&self, id: u8) -> Option<&TimerConfig> {
        self.timers
            .iter()
            .find_map(|(timer_id, config)| (*timer_id == id).then_some(config))
    }

    /// Encodes the blob into a region of `capacity` bytes.
    ///
    /// # Errors
    ///
    /// Returns [`DmError::InvalidSize`] when more than four sessions or
    /// timers are present, or when the encoding exceeds `capacity`.
    pub fn encode(&self, capacity: usize) -> Result<Vec<u8>> {
        if self.sessions.len() > usize::from(MAX_SESSIONS) {
            return Err(DmError::InvalidSize {
                expected: usize::from(MAX_SESSIONS),
                actual: self.sessions.len(),
            });
        }
        if self.timers.len() > usize::from(MAX_TIMERS) {
            return Err(DmError::InvalidSize {
                expected: usize::from(MAX_TIMERS),
                actual: self.timers.len(),
            });
        }

        let body = serde_json::to_vec(self)
            .map_err(|e| DmError::RetentionAllocFail(Cow::Owned(alloc::format!("{e}"))))?;

        let size = HEADER_SIZE + body.len();
        let length = u32::try_from(body.len()).ok().filter(|_| size <= capacity);
        let Some(length) = length else {
            return Err(DmError::InvalidSize {
                expected: capacity,
                actual: size,
            });
        };

        let mut bytes = Vec::with_capacity(size);
        bytes.extend_from_slice(&MAGIC.to_le_bytes());
        bytes.extend_from_slice(&length.to_le_bytes());
        bytes.extend_from_slice(&body);
        Ok(bytes)
    }

    /// Decodes a blob from the content of a region.
    ///
    /// Returns [`None`] when the region does not start with [`MAGIC`],
    /// including erased regions, or when its content is truncated or
    /// malformed.
    #[must_use]
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let magic = u32::from_le_bytes(bytes.get(0..4)?.try_into().ok()?);
        if magic != MAGIC {
            return None;
        }

        let length = u32::from_le_bytes(bytes.get(4..HEADER_SIZE)?.try_into().ok()?);
        let end = HEADER_SIZE.checked_add(usize::try_from(length).ok()?)?;
        let body = bytes.get(HEADER_SIZE..end)?;

        match serde_json::from_slice::<Self>(body) {
            Ok(blob)
                if blob.sessions.len() <= usize::from(MAX_SESSIONS)
                    && blob.timers.len() <= usize::from(MAX_TIMERS) =>
            {
                Some(blob)
            }
            Ok(_) => {
                log::warn!("Retention blob holds too many entries, discard it");
                None
            }
            Err(e) => {
                log::warn!("Retention blob body is malformed, discard it: {e}");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    extern crate std;
    use std::vec;

    use crate::config::{ReconnectPolicy, TimerKind};

    fn blob() -> RetentionBlob {
        let client = SessionConfig::tcp_client("192.168.1.10", 8080)
            .keepalive(30)
            .reconnect(ReconnectPolicy {
                retry_count: 3,
                wait_time_s: 2,
                auto_reconnect: true,
            })
            .secure();

        let mut server = SessionConfig::tcp_server(9000);
        server.peer = Some("192.168.1.20:50123".parse().unwrap());

        RetentionBlob {
            sessions: vec![(1, server), (2, client)],
            timers: vec![
                (1, TimerConfig::new(TimerKind::Periodic, 5)),
                (3, TimerConfig::new(TimerKind::OneShot, 60)),
            ],
            user_params_size: 64,
            callbacks: CallbackFlags {
                boot_init: true,
                wakeup_init: true,
                external_wakeup: false,
                error: true,
            },
        }
    }

    #[test]
    fn round_trip() {
        let blob = blob();
        let bytes = blob.encode(CONFIG_REGION_SIZE).unwrap();

        assert_eq!(&bytes[0..4], &MAGIC.to_le_bytes());
        assert_eq!(RetentionBlob::decode(&bytes), Some(blob.clone()));

        // Trailing bytes of a larger region are ignored.
        let mut region = vec![0u8; CONFIG_REGION_SIZE];
        region[..bytes.len()].copy_from_slice(&bytes);
        assert_eq!(RetentionBlob::decode(&region), Some(blob));

        let empty = RetentionBlob::new();
        let bytes = empty.encode(CONFIG_REGION_SIZE).unwrap();
        assert_eq!(RetentionBlob::decode(&bytes), Some(empty));
    }

    #[test]
    fn not_a_blob() {
        // Cold boot and erased flash.
        assert_eq!(RetentionBlob::decode(&[0u8; CONFIG_REGION_SIZE]), None);
        assert_eq!(RetentionBlob::decode(&[0xFFu8; CONFIG_REGION_SIZE]), None);
        assert_eq!(RetentionBlob::decode(&[]), None);

        // Any change to the sentinel invalidates an otherwise valid blob.
        let bytes = blob().encode(CONFIG_REGION_SIZE).unwrap();
        for index in 0..4 {
            for bit in 0..8 {
                let mut corrupted = bytes.clone();
                corrupted[index] ^= 1 << bit;
                assert_eq!(RetentionBlob::decode(&corrupted), None);
            }
        }
    }

    #[test]
    fn truncated_or_malformed() {
        let bytes = blob().encode(CONFIG_REGION_SIZE).unwrap();

        // Truncated body.
        assert_eq!(RetentionBlob::decode(&bytes[..bytes.len() - 1]), None);
        // Truncated header.
        assert_eq!(RetentionBlob::decode(&bytes[..6]), None);

        // Valid header, garbage body.
        let mut garbage = bytes.clone();
        garbage[HEADER_SIZE] = b'#';
        assert_eq!(RetentionBlob::decode(&garbage), None);
    }

    #[test]
    fn capacity() {
        let blob = blob();
        let size = blob.encode(CONFIG_REGION_SIZE).unwrap().len();

        assert!(blob.encode(size).is_ok());
        assert_eq!(
            blob.encode(size - 1),
            Err(DmError::InvalidSize {
                expected: size - 1,
                actual: size
            })
        );

        let mut crowded = RetentionBlob::new();
        for id in 1..=5 {
            crowded.timers.push((id, TimerConfig::new(TimerKind::Periodic, 1)));
        }
        assert!(matches!(
            crowded.encode(CONFIG_REGION_SIZE),
            Err(DmError::InvalidSize { .. })
        ));
    }

    #[test]
    fn lookups() {
        let blob = blob();
        assert_eq!(blob.session(2).map(|s| s.server_port), Some(8080));
        assert!(blob.session(4).is_none());
        assert_eq!(blob.timer(3).map(|t| t.interval_s), Some(60));
        assert!(blob.timer(2).is_none());
    }
}
