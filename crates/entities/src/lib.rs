//! Core entity definitions for the wedding guestbook.
//!
//! This crate defines the data types shared by the store clients and the
//! synchronizer: guestbook entries ("wishes"), RSVP attendance, the entry
//! lifecycle and the timestamp wire format.

mod attendance;
mod timestamp;
mod wish;

pub use attendance::*;
pub use timestamp::*;
pub use wish::*;
