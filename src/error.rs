use serde_derive::{Deserialize, Serialize};

/// skiff errors. Errors travel across the network in operation responses, so
/// they must be serializable and self-contained. All except Internal are
/// considered user-facing and may be returned to clients.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Error {
    /// The operation was aborted and must be retried, e.g. because the leader
    /// changed while a request was in flight.
    Abort,
    /// Invalid data, typically decoding errors or corrupt log entries.
    InvalidData(String),
    /// Invalid user input or request.
    InvalidInput(String),
    /// An input/output error.
    IO(String),
    /// An internal error. On a server, an internal error halts the node,
    /// since its state may now be inconsistent with the rest of the cluster.
    Internal(String),
    /// The user state machine failed while applying a command. Surfaced to
    /// the caller verbatim, never retried.
    Application(String),
    /// The contacted server does not know an elected leader.
    NoLeader,
    /// The contacted member cannot serve the request in its current role,
    /// e.g. a reserve member receiving a command.
    IllegalMemberState,
    /// A command arrived at the leader ahead of its session's sequence order.
    /// Carries the last sequence number applied for the session, so the
    /// client can resubmit the missing commands.
    CommandGap { last_sequence: u64 },
    /// A query's sequence number is ahead of the session's applied commands.
    /// The client must let the missing commands complete first.
    QueryGap,
    /// The client is not known to the cluster.
    UnknownClient,
    /// The session is not known to the cluster (expired or never registered).
    UnknownSession,
    /// No state machine is registered under the requested name.
    UnknownStateMachine,
    /// The session was closed locally and can no longer submit operations.
    ClosedSession,
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Abort => write!(f, "operation aborted"),
            Error::InvalidData(msg) => write!(f, "invalid data: {msg}"),
            Error::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            Error::IO(msg) => write!(f, "io error: {msg}"),
            Error::Internal(msg) => write!(f, "internal error: {msg}"),
            Error::Application(msg) => write!(f, "application error: {msg}"),
            Error::NoLeader => write!(f, "no elected leader"),
            Error::IllegalMemberState => write!(f, "member cannot serve request in current role"),
            Error::CommandGap { last_sequence } => {
                write!(f, "command out of sequence order, last applied {last_sequence}")
            }
            Error::QueryGap => write!(f, "query ahead of applied commands"),
            Error::UnknownClient => write!(f, "unknown client"),
            Error::UnknownSession => write!(f, "unknown session"),
            Error::UnknownStateMachine => write!(f, "unknown state machine"),
            Error::ClosedSession => write!(f, "session closed"),
        }
    }
}

impl Error {
    /// Returns whether the error is considered internal, i.e. a server-side
    /// invariant violation rather than an expected error condition.
    pub fn is_internal(&self) -> bool {
        matches!(self, Error::Internal(_))
    }
}

/// Constructs an Error::InvalidData via format!() and into().
#[macro_export]
macro_rules! errdata {
    ($($args:tt)*) => { $crate::error::Error::InvalidData(format!($($args)*)).into() };
}

/// Constructs an Error::InvalidInput via format!() and into().
#[macro_export]
macro_rules! errinput {
    ($($args:tt)*) => { $crate::error::Error::InvalidInput(format!($($args)*)).into() };
}

/// A skiff Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Allows `return errinput!(...)` and similar in functions returning Result.
impl<T> From<Error> for Result<T> {
    fn from(error: Error) -> Self {
        Err(error)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::IO(err.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        match *err {
            bincode::ErrorKind::Io(err) => Error::IO(err.to_string()),
            err => Error::InvalidData(err.to_string()),
        }
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::InvalidInput(err.to_string())
    }
}

impl From<log::ParseLevelError> for Error {
    fn from(err: log::ParseLevelError) -> Self {
        Error::InvalidInput(err.to_string())
    }
}

impl From<log::SetLoggerError> for Error {
    fn from(err: log::SetLoggerError) -> Self {
        Error::Internal(err.to_string())
    }
}

impl<T> From<crossbeam::channel::SendError<T>> for Error {
    fn from(err: crossbeam::channel::SendError<T>) -> Self {
        Error::Internal(format!("channel send failed: {err}"))
    }
}

impl From<crossbeam::channel::RecvError> for Error {
    fn from(err: crossbeam::channel::RecvError) -> Self {
        Error::Internal(format!("channel receive failed: {err}"))
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Error::Internal(format!("lock poisoned: {err}"))
    }
}
