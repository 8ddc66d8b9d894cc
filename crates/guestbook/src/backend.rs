//! Remote store selection

use std::{fmt, sync::Arc};

use tracing::{error, info};
use wish_store::{SupabaseWishStore, WishStore};

use crate::GuestbookConfig;

/// The remote store the guestbook talks to, if any
#[derive(Clone)]
pub enum Backend {
    /// A configured remote store
    Connected(Arc<dyn WishStore>),
    /// No remote store; the session runs on local storage only
    Unconfigured,
}

impl Backend {
    /// Wraps a store implementation
    pub fn connected(store: impl WishStore + 'static) -> Self {
        Self::Connected(Arc::new(store))
    }

    /// Builds the backend described by the configuration
    pub fn from_config(config: &GuestbookConfig) -> Self {
        let Some(supabase) = config.supabase() else {
            info!("No remote store configured");
            return Self::Unconfigured;
        };

        info!(url = %supabase.url, table = %supabase.table, "Using Supabase store");
        match SupabaseWishStore::new(supabase) {
            Ok(store) => Self::connected(store),
            Err(e) => {
                error!(error = %e, "Failed to create Supabase client");
                Self::Unconfigured
            }
        }
    }

    /// Returns true if a remote store is configured
    pub fn is_configured(&self) -> bool {
        matches!(self, Self::Connected(_))
    }
}

impl fmt::Debug for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connected(_) => f.write_str("Backend::Connected"),
            Self::Unconfigured => f.write_str("Backend::Unconfigured"),
        }
    }
}
