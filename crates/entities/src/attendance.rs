//! RSVP attendance definitions.

use serde::{Deserialize, Deserializer, Serialize};

/// Whether a guest will attend the wedding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Attendance {
    /// Guest will attend.
    #[serde(alias = "yes")]
    Attending,
    /// Guest will not attend.
    #[serde(alias = "no")]
    NotAttending,
}

impl Attendance {
    /// Converts the attendance to its wire string
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Attending => "attending",
            Self::NotAttending => "not_attending",
        }
    }

    /// Parses attendance from its wire string or RSVP form value
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "attending" | "yes" => Some(Self::Attending),
            "not_attending" | "no" => Some(Self::NotAttending),
            _ => None,
        }
    }

    /// Human readable label shown next to an entry.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Attending => "Hadir",
            Self::NotAttending => "Tidak hadir",
        }
    }
}

/// Deserializes an optional attendance, mapping unknown values to `None`.
///
/// Rows written by other clients may carry free text in the attendance
/// column; such a row is still a valid entry.
pub fn deserialize_attendance<'de, D>(deserializer: D) -> Result<Option<Attendance>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match raw {
        Some(serde_json::Value::String(s)) => Attendance::parse(&s),
        Some(serde_json::Value::Bool(true)) => Some(Attendance::Attending),
        Some(serde_json::Value::Bool(false)) => Some(Attendance::NotAttending),
        _ => None,
    })
}
