//! Time range bounds as typed by the user: either a usable UTC instant or the
//! raw text that failed to parse.

use std::fmt;

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimeBound {
    Valid(DateTime<Utc>),
    Invalid(String),
}

impl TimeBound {
    pub fn parse(text: &str) -> Self {
        match parse_timestamp(text) {
            Some(value) => Self::Valid(value),
            None => Self::Invalid(text.to_string()),
        }
    }

    pub fn valid(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Valid(value) => Some(*value),
            Self::Invalid(_) => None,
        }
    }

    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Valid(_))
    }
}

impl From<DateTime<Utc>> for TimeBound {
    fn from(value: DateTime<Utc>) -> Self {
        Self::Valid(value)
    }
}

impl fmt::Display for TimeBound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Valid(value) => f.write_str(&to_iso_string(*value)),
            Self::Invalid(text) => f.write_str(text),
        }
    }
}

/// UTC ISO-8601 with millisecond precision, e.g. `2024-01-02T03:04:05.000Z`.
pub fn to_iso_string(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Accepts RFC 3339 with any offset, or an offset-less date/time taken as UTC.
pub fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }

    if let Ok(value) = DateTime::parse_from_rfc3339(text) {
        return Some(value.with_timezone(&Utc));
    }

    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"] {
        if let Ok(value) = NaiveDateTime::parse_from_str(text, format) {
            return Some(value.and_utc());
        }
    }

    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|value| value.and_utc())
}
