use alloc::borrow::Cow;

/// All errors raised by the DPM manager.
///
/// Every variant maps to a numeric code of the DPM error catalogue through
/// [`DmError::code`]. The code is what the error callback receives, together
/// with the rendered message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DmError {
    /// No boot initialization callback has been registered.
    #[error("No boot initialization callback registered")]
    NoBootCallback,
    /// No wakeup initialization callback has been registered.
    #[error("No wakeup initialization callback registered")]
    NoWakeupCallback,
    /// A retention memory region could not be allocated.
    #[error("Retention memory allocation failed for `{0}`")]
    RetentionAllocFail(Cow<'static, str>),
    /// A size does not match the expected one.
    #[error("Invalid size: expected {expected} bytes, found {actual} bytes")]
    InvalidSize {
        /// Expected size.
        expected: usize,
        /// Actual size.
        actual: usize,
    },
    /// The timer kind cannot be armed.
    #[error("Invalid timer type")]
    TimerTypeInvalid,
    /// Data could not be sent.
    #[error("Send failed: {0}")]
    SendFail(Cow<'static, str>),
    /// No socket could be allocated.
    #[error("Socket allocation failed")]
    SocketAllocFail,
    /// A socket could not be created.
    #[error("Socket creation failed: {0}")]
    SocketCreateFail(Cow<'static, str>),
    /// A socket could not be bound to its local port.
    #[error("Bind failed on port {0}")]
    BindFail(u16),
    /// A connection could not be established.
    #[error("Connect failed: {0}")]
    ConnectFail(Cow<'static, str>),
    /// No receive buffer could be allocated.
    #[error("Receive buffer allocation failed")]
    RxBufferAllocFail,
    /// A session configuration is invalid.
    #[error("Invalid session configuration: {0}")]
    InvalidConfig(Cow<'static, str>),
    /// No sub-session matches the given peer.
    #[error("No sub-session found for the given peer")]
    NotFoundSubSession,
    /// A task could not be created.
    #[error("Task creation failed")]
    TaskCreateFail,
    /// The retention memory could not be read.
    #[error("Retention memory read failed")]
    RetentionReadFail,
    /// The network is down.
    #[error("Network is down")]
    NetDown,
    /// The secure context could not be initialized.
    #[error("Secure context initialization failed: {0}")]
    SecureInitFail(Cow<'static, str>),
    /// A saved session ticket could not be restored.
    #[error("Session ticket restore failed")]
    TicketRestoreFail,
    /// The secure handshake failed.
    #[error("Handshake failed: {0}")]
    HandshakeFail(Cow<'static, str>),
    /// A mutex could not be created.
    #[error("Mutex creation failed")]
    MutexCreateFail,
    /// A stop has been requested.
    #[error("Stop requested")]
    StopRequest,
    /// The socket is not connected.
    #[error("Socket not connected")]
    NotConnected,
    /// A restart has been requested.
    #[error("Restart requested")]
    RestartRequest,
    /// The peer closed the connection.
    #[error("Connection closed by peer")]
    PeerClosedConnection,
    /// No data has been received before the timeout.
    #[error("Receive timeout")]
    ReceiveTimeout,
    /// A timer could not be created.
    #[error("Timer creation failed")]
    TimerCreateFail,
    /// An identifier is out of range or unknown.
    #[error("Identifier out of range")]
    OutOfRange,
    /// A session ticket could not be saved.
    #[error("Session ticket save failed")]
    TicketSaveFail,
    /// An entity already exists with the given identifier.
    #[error("Already exists")]
    AlreadyExist,
    /// An interval is not valid.
    #[error("Invalid interval")]
    InvalidInterval,
    /// A session has been forcibly stopped.
    #[error("Session forcibly stopped")]
    ForceStopped,
}

impl DmError {
    /// Returns the numeric code of the error in the DPM error catalogue.
    #[must_use]
    pub const fn code(&self) -> u8 {
        match self {
            Self::NoBootCallback => 0x01,
            Self::NoWakeupCallback => 0x02,
            Self::RetentionAllocFail(_) => 0x04,
            Self::InvalidSize { .. } => 0x05,
            Self::TimerTypeInvalid => 0x06,
            Self::SendFail(_) => 0x0A,
            Self::SocketAllocFail => 0x0D,
            Self::SocketCreateFail(_) => 0x0E,
            Self::BindFail(_) => 0x0F,
            Self::ConnectFail(_) => 0x10,
            Self::RxBufferAllocFail => 0x11,
            Self::InvalidConfig(_) => 0x12,
            Self::NotFoundSubSession => 0x14,
            Self::TaskCreateFail => 0x15,
            Self::RetentionReadFail => 0x17,
            Self::NetDown => 0x19,
            Self::SecureInitFail(_) => 0x1A,
            Self::TicketRestoreFail => 0x1B,
            Self::HandshakeFail(_) => 0x1C,
            Self::MutexCreateFail => 0x1D,
            Self::StopRequest => 0x1E,
            Self::NotConnected => 0x20,
            Self::RestartRequest => 0x22,
            Self::PeerClosedConnection => 0x23,
            Self::ReceiveTimeout => 0x25,
            Self::TimerCreateFail => 0x26,
            Self::OutOfRange => 0x27,
            Self::TicketSaveFail => 0x28,
            Self::AlreadyExist => 0x2A,
            Self::InvalidInterval => 0x2B,
            Self::ForceStopped => 0x30,
        }
    }

    /// Whether the error is a control signal rather than a failure.
    ///
    /// Stop and restart requests unwind a session to its stopped state and
    /// must not be reported as failures.
    #[must_use]
    pub const fn is_control(&self) -> bool {
        matches!(self, Self::StopRequest | Self::RestartRequest)
    }

    /// Whether the error concerns the configuration supplied by the
    /// application.
    #[must_use]
    pub const fn is_config(&self) -> bool {
        matches!(
            self,
            Self::NoBootCallback
                | Self::NoWakeupCallback
                | Self::InvalidSize { .. }
                | Self::TimerTypeInvalid
                | Self::InvalidConfig(_)
                | Self::OutOfRange
                | Self::InvalidInterval
                | Self::AlreadyExist
        )
    }
}

/// A specialized [`Result`] type for [`DmError`].
pub type Result<T> = core::result::Result<T, DmError>;
