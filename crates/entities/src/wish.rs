//! Guestbook entry definitions.

use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::{Attendance, deserialize_attendance, serde_timestamp};

/// Lifecycle of a guestbook entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WishStatus {
    /// Rendered optimistically, remote insert in flight.
    Pending,
    /// Acknowledged by the remote store.
    Confirmed,
    /// Persisted only to local fallback storage.
    #[default]
    LocalOnly,
}

/// A guestbook entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Wish {
    /// Server-assigned or locally synthesized identifier
    #[serde(deserialize_with = "deserialize_id")]
    pub id: String,
    /// Submitter name
    pub name: String,
    /// Message body
    pub message: String,
    /// RSVP attendance, if given
    #[serde(
        default,
        deserialize_with = "deserialize_attendance",
        skip_serializing_if = "Option::is_none"
    )]
    pub attendance: Option<Attendance>,
    /// Submission instant; `None` when the stored value was unreadable
    #[serde(default, with = "serde_timestamp")]
    pub timestamp: Option<DateTime<Utc>>,
    /// Lifecycle status
    #[serde(default)]
    pub status: WishStatus,
}

impl Wish {
    /// Creates a provisional entry awaiting remote confirmation.
    pub fn pending(
        id: impl Into<String>,
        name: impl Into<String>,
        message: impl Into<String>,
        attendance: Option<Attendance>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            message: message.into(),
            attendance,
            timestamp: Some(timestamp),
            status: WishStatus::Pending,
        }
    }

    /// Marks the entry as persisted locally only.
    pub fn into_local_only(mut self) -> Self {
        self.status = WishStatus::LocalOnly;
        self
    }

    /// Returns true while the remote insert is still in flight.
    pub fn is_pending(&self) -> bool {
        self.status == WishStatus::Pending
    }

    /// Builds the insert payload for this entry.
    pub fn to_new_wish(&self) -> NewWish {
        NewWish {
            name: self.name.clone(),
            message: self.message.clone(),
            attendance: self.attendance,
            timestamp: self.timestamp.unwrap_or_else(Utc::now),
        }
    }
}

/// A row of the remote `wishes` table as exchanged on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WishRow {
    /// Server-assigned identifier
    #[serde(deserialize_with = "deserialize_id")]
    pub id: String,
    /// Submitter name
    pub name: String,
    /// Message body
    pub message: String,
    /// RSVP attendance
    #[serde(
        default,
        deserialize_with = "deserialize_attendance",
        skip_serializing_if = "Option::is_none"
    )]
    pub attendance: Option<Attendance>,
    /// Submission instant
    #[serde(default, with = "serde_timestamp")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl From<WishRow> for Wish {
    fn from(row: WishRow) -> Self {
        Self {
            id: row.id,
            name: row.name,
            message: row.message,
            attendance: row.attendance,
            timestamp: row.timestamp,
            status: WishStatus::Confirmed,
        }
    }
}

/// Insert payload for a new entry; the store assigns the id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewWish {
    /// Submitter name
    pub name: String,
    /// Message body
    pub message: String,
    /// RSVP attendance
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attendance: Option<Attendance>,
    /// Submission instant, serialized as ISO-8601 text
    #[serde(
        serialize_with = "crate::timestamp::serialize_timestamp",
        deserialize_with = "crate::timestamp::deserialize_timestamp"
    )]
    pub timestamp: DateTime<Utc>,
}

/// Accepts both text and numeric identifiers, carrying them as text.
fn deserialize_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number id, got {other}"
        ))),
    }
}

/// Synthesizes local identifiers from the current time.
///
/// Ids are milliseconds since the epoch, bumped when needed so that two
/// entries created within the same millisecond still get distinct ids.
#[derive(Debug, Default)]
pub struct LocalIdGenerator {
    last: AtomicI64,
}

impl LocalIdGenerator {
    /// Creates a new generator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the next id for an entry created at `now`.
    pub fn next_id(&self, now: DateTime<Utc>) -> String {
        let candidate = now.timestamp_millis();
        let mut last = self.last.load(Ordering::Relaxed);
        loop {
            let next = candidate.max(last + 1);
            match self
                .last
                .compare_exchange_weak(last, next, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => return next.to_string(),
                Err(actual) => last = actual,
            }
        }
    }
}
