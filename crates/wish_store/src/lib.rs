//! Storage for guestbook entries
//!
//! This crate provides the remote store abstraction (read, insert and
//! realtime insert notifications) with an in-memory implementation and a
//! client for the hosted Supabase backend, plus the local key/value storage
//! used as a fallback when the remote store cannot be reached.

mod error;
mod fallback;
mod realtime;
mod rest;
mod store;

pub use error::*;
pub use fallback::*;
pub use rest::*;
pub use store::*;
