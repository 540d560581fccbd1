use std::fmt;

/// Lifecycle of one connection.
///
/// ```text
/// Created -> Connecting -> Idle -> SendingRequest -> ReceivingHeader -> ReceivingBody -> Received -> Idle
///                |          |                             |                 |
///          ConnectTimeout IdleTimeout               ResponseTimeout   ResponseTimeout
/// ```
///
/// Every active state may also end in `Error`, `ClosedByServer` or `Closed`, and every
/// terminal-ish state (`Error`, the timeouts, `ClosedByServer`) leads to `Closed`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Created,
    Connecting,
    ConnectTimeout,
    Idle,
    SendingRequest,
    ReceivingHeader,
    ReceivingBody,
    Received,
    ResponseTimeout,
    ClosedByServer,
    Closed,
    Error,
    IdleTimeout,
}

impl ConnectionState {
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;

        match self {
            Created => matches!(next, Connecting),
            Connecting => matches!(next, Idle | ConnectTimeout | Error | ClosedByServer | Closed),
            Idle => matches!(next, SendingRequest | IdleTimeout | Error | ClosedByServer | Closed),
            SendingRequest => matches!(next, ReceivingHeader | Error | ClosedByServer | Closed),
            ReceivingHeader => matches!(next, ReceivingBody | Received | ResponseTimeout | Error | ClosedByServer | Closed),
            ReceivingBody => matches!(next, Received | ResponseTimeout | Error | ClosedByServer | Closed),
            Received => matches!(next, Idle | Closed),
            ConnectTimeout | ResponseTimeout | IdleTimeout | ClosedByServer | Error => matches!(next, Closed),
            Closed => false,
        }
    }

    #[inline]
    pub fn is_closed(self) -> bool {
        self == ConnectionState::Closed
    }

    /// `true` while a request has been handed to the connection and not fully answered.
    #[inline]
    pub fn is_busy(self) -> bool {
        matches!(self, ConnectionState::SendingRequest | ConnectionState::ReceivingHeader | ConnectionState::ReceivingBody)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
