//! Wedding guestbook synchronization
//!
//! The [`Guestbook`] keeps an in-memory, newest-first list of entries fed by
//! three paths: the initial fetch from the remote store, realtime insert
//! notifications from other visitors, and local submissions. When the remote
//! store is unconfigured or unreachable it degrades to local persisted
//! storage.

pub mod backend;
pub mod config;
pub mod synchronizer;

pub use backend::Backend;
pub use config::{ConfigError, GuestbookConfig};
pub use synchronizer::{
    Draft, Guestbook, GuestbookState, RealtimeStatus, RejectReason, SubmitOutcome,
};

/// Initializes tracing with the given log level.
pub fn init_tracing(log_level: &str) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();
}
