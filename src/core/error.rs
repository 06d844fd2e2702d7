use thiserror::Error;

use crate::transfer::{TransferError, TransferErrorKind};

/// Transport failure classes observable to the caller. Mapped from the
/// transfer engine's error codes; anything the classifier cannot place
/// lands in `Other`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum TransportErrorKind {
    Dns,
    Connect,
    Tls,
    Read,
    Write,
    Other,
}

impl std::fmt::Display for TransportErrorKind {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::Dns => "dns",
            Self::Connect => "connect",
            Self::Tls => "tls",
            Self::Read => "read",
            Self::Write => "write",
            Self::Other => "other",
        };
        formatter.write_str(text)
    }
}

/// Which deadline elapsed: a single attempt's transfer timeout, or the
/// aggregate budget covering every attempt and its backoff.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum TimeoutPhase {
    Attempt,
    Aggregate,
}

impl std::fmt::Display for TimeoutPhase {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::Attempt => "attempt",
            Self::Aggregate => "aggregate",
        };
        formatter.write_str(text)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorCode {
    Transport,
    Timeout,
    DeadlineExceeded,
    Cancelled,
    Protocol,
    Init,
}

impl ErrorCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Transport => "transport",
            Self::Timeout => "timeout",
            Self::DeadlineExceeded => "deadline_exceeded",
            Self::Cancelled => "cancelled",
            Self::Protocol => "protocol",
            Self::Init => "init",
        }
    }
}

/// Terminal request outcomes that are errors. An HTTP status of 4xx/5xx is
/// *not* an error: the response is returned and the caller inspects the
/// status itself.
#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("http transport error ({kind}): {message}")]
    Transport {
        kind: TransportErrorKind,
        message: String,
    },
    #[error("http request timed out ({phase}): {message}")]
    Timeout { phase: TimeoutPhase, message: String },
    #[error("http request was cancelled")]
    Cancelled,
    #[error("malformed http response: {message}")]
    Protocol { message: String },
    #[error("failed to initialize http client: {message}")]
    Init { message: String },
}

impl Error {
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Transport { .. } => ErrorCode::Transport,
            Self::Timeout {
                phase: TimeoutPhase::Attempt,
                ..
            } => ErrorCode::Timeout,
            Self::Timeout {
                phase: TimeoutPhase::Aggregate,
                ..
            } => ErrorCode::DeadlineExceeded,
            Self::Cancelled => ErrorCode::Cancelled,
            Self::Protocol { .. } => ErrorCode::Protocol,
            Self::Init { .. } => ErrorCode::Init,
        }
    }

    pub(crate) fn deadline_exceeded(deadline_ms: u128) -> Self {
        Self::Timeout {
            phase: TimeoutPhase::Aggregate,
            message: format!("aggregate deadline of {deadline_ms}ms elapsed"),
        }
    }
}

impl From<TransferError> for Error {
    fn from(error: TransferError) -> Self {
        let TransferError { kind, message } = error;
        match kind {
            TransferErrorKind::Timeout => Self::Timeout {
                phase: TimeoutPhase::Attempt,
                message,
            },
            TransferErrorKind::Cancelled => Self::Cancelled,
            TransferErrorKind::Protocol => Self::Protocol { message },
            TransferErrorKind::Dns => Self::Transport {
                kind: TransportErrorKind::Dns,
                message,
            },
            TransferErrorKind::Connect => Self::Transport {
                kind: TransportErrorKind::Connect,
                message,
            },
            TransferErrorKind::Tls => Self::Transport {
                kind: TransportErrorKind::Tls,
                message,
            },
            TransferErrorKind::Read => Self::Transport {
                kind: TransportErrorKind::Read,
                message,
            },
            TransferErrorKind::Write => Self::Transport {
                kind: TransportErrorKind::Write,
                message,
            },
            TransferErrorKind::Other => Self::Transport {
                kind: TransportErrorKind::Other,
                message,
            },
        }
    }
}
