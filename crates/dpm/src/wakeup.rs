use core::fmt;

use serde::{Deserialize, Serialize};

/// The reason why the device is running.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WakeupSource {
    /// Cold boot after power-on or reset.
    #[default]
    PowerOn,
    /// The real-time clock timer expired.
    RtcTimer,
    /// A packet addressed to the device has been received.
    Packet,
    /// The application requested the wakeup.
    User,
    /// The access point stopped acknowledging the device.
    NoAck,
    /// The device has been deauthenticated by the access point.
    Deauth,
    /// The traffic indication map could not be received.
    TimError,
    /// An external signal woke up the device.
    ExternalSignal,
    /// The source cannot be determined.
    Unknown,
}

impl WakeupSource {
    /// Whether the device is resuming from sleep, so that the retention
    /// memory may hold a valid blob.
    #[must_use]
    pub const fn is_wakeup(self) -> bool {
        !matches!(self, Self::PowerOn)
    }
}

impl fmt::Display for WakeupSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::PowerOn => "power-on",
            Self::RtcTimer => "RTC timer",
            Self::Packet => "packet",
            Self::User => "user",
            Self::NoAck => "no ack",
            Self::Deauth => "deauthentication",
            Self::TimError => "TIM error",
            Self::ExternalSignal => "external signal",
            Self::Unknown => "unknown",
        })
    }
}

/// How the manager booted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BootKind {
    /// Normal boot: the retention memory has been erased and seeded.
    Normal,
    /// Wake boot: the retention memory has been restored.
    Wake(WakeupSource),
}

impl BootKind {
    /// Whether the manager restored its state from the retention memory.
    #[must_use]
    pub const fn is_wake(self) -> bool {
        matches!(self, Self::Wake(_))
    }
}
