//! Timestamp wire format and display helpers.
//!
//! Entries carry their submission instant as ISO-8601 text on the wire and
//! in local storage. Rows written by other clients are not always well
//! formed, so parsing never fails hard: an unreadable value becomes `None`
//! and is rendered with a placeholder.

use chrono::{DateTime, Datelike, Local, NaiveDateTime, SecondsFormat, TimeZone, Timelike, Utc};

/// Label shown for an entry whose timestamp is unknown.
pub const UNKNOWN_TIMESTAMP_LABEL: &str = "Baru saja";

const MONTHS_ID: [&str; 12] = [
    "Januari",
    "Februari",
    "Maret",
    "April",
    "Mei",
    "Juni",
    "Juli",
    "Agustus",
    "September",
    "Oktober",
    "November",
    "Desember",
];

/// Formats an instant as RFC 3339 UTC text with millisecond precision.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parses timestamp text.
///
/// Accepts RFC 3339, the PostgreSQL `timestamptz` text form
/// (`2024-01-01 00:00:00.123+00`) and offset-less date-times, which are
/// taken as UTC.
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }

    if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
        return Some(ts.with_timezone(&Utc));
    }

    if let Ok(ts) = DateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f%#z") {
        return Some(ts.with_timezone(&Utc));
    }

    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .map(|naive| naive.and_utc())
}

/// Converts epoch milliseconds into an instant.
pub fn timestamp_from_millis(ms: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms).single()
}

/// Display label for an entry timestamp in the local time zone.
pub fn timestamp_label(ts: Option<&DateTime<Utc>>) -> String {
    timestamp_label_in(ts, &Local)
}

/// Display label for an entry timestamp in the given time zone, e.g.
/// `1 Januari 2024 pukul 07.00`.
pub fn timestamp_label_in<Tz: TimeZone>(ts: Option<&DateTime<Utc>>, tz: &Tz) -> String {
    let Some(ts) = ts else {
        return UNKNOWN_TIMESTAMP_LABEL.to_string();
    };

    let local = ts.with_timezone(tz);
    format!(
        "{} {} {} pukul {:02}.{:02}",
        local.day(),
        MONTHS_ID[local.month0() as usize],
        local.year(),
        local.hour(),
        local.minute()
    )
}

/// Serializes a required instant as ISO-8601 text.
pub fn serialize_timestamp<S>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_str(&format_timestamp(ts))
}

/// Deserializes a required instant from ISO-8601 text.
pub fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let text = <String as serde::Deserialize>::deserialize(deserializer)?;
    parse_timestamp(&text)
        .ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp: {text}")))
}

/// Serde adapter for `Option<DateTime<Utc>>` stored as ISO-8601 text.
///
/// Serializes `None` as `null`. Deserializes text (see [`parse_timestamp`])
/// or epoch milliseconds; anything else becomes `None`.
pub mod serde_timestamp {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    use super::{format_timestamp, parse_timestamp, timestamp_from_millis};

    pub fn serialize<S>(ts: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match ts {
            Some(ts) => serializer.serialize_str(&format_timestamp(ts)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = Option::<serde_json::Value>::deserialize(deserializer)?;
        Ok(match raw {
            Some(serde_json::Value::String(s)) => parse_timestamp(&s),
            Some(serde_json::Value::Number(n)) => n.as_i64().and_then(timestamp_from_millis),
            _ => None,
        })
    }
}
