//! The server-side session layer: session records, the session manager, the
//! deterministic state machine driver, and the state machine registry.

mod driver;
mod manager;
mod registry;
mod session;

pub use driver::{Applied, ApplyContext, Driver, StateMachine};
#[cfg(test)]
pub use driver::tests::TestState;
pub use manager::SessionManager;
pub use registry::Registry;
pub use session::{BufferedCommand, EventBatch, Session};

/// A session ID: the log index of the session's register entry.
pub type SessionId = u64;

/// A session is expired once it has not been heard from for this multiple of
/// its timeout.
pub const EXPIRY_FACTOR: u64 = 2;

/// The hard per-session bound on cached command results. Results are normally
/// pruned by keep-alive acknowledgements; this bounds worst-case memory for
/// clients that stop acknowledging.
pub const RESULT_CACHE_WINDOW: u64 = 1024;
