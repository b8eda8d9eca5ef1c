//! Task identifiers.
//!
//! Ids are ULIDs: the timestamp prefix keeps them roughly sortable by
//! enqueue time and they can be generated by concurrent producers without
//! coordination. They are persisted as their canonical 26-character text.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Identifier of one persisted task row.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Ulid);

impl TaskId {
    /// Generate a new id whose timestamp part is `now`.
    ///
    /// Taking the time explicitly lets a `ManualClock` produce ids that line
    /// up with the rest of the row's timestamps.
    pub fn generate(now: DateTime<Utc>) -> Self {
        let timestamp_ms = u64::try_from(now.timestamp_millis()).unwrap_or(0);
        Self(Ulid::from_parts(timestamp_ms, rand::random()))
    }

    pub fn from_ulid(ulid: Ulid) -> Self {
        Self(ulid)
    }

    pub fn as_ulid(&self) -> Ulid {
        self.0
    }
}

impl From<Ulid> for TaskId {
    fn from(ulid: Ulid) -> Self {
        Self(ulid)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for TaskId {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ulid::from_string(s).map(Self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn generated_ids_carry_the_given_timestamp() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let a = TaskId::generate(now);
        let b = TaskId::generate(now);

        assert_ne!(a, b);
        assert_eq!(a.as_ulid().timestamp_ms(), now.timestamp_millis() as u64);
        assert_eq!(b.as_ulid().timestamp_ms(), now.timestamp_millis() as u64);
    }

    #[test]
    fn ids_sort_by_generation_time() {
        let earlier = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let later = earlier + chrono::Duration::milliseconds(5);

        assert!(TaskId::generate(earlier) < TaskId::generate(later));
    }

    #[test]
    fn text_form_parses_back() {
        let id = TaskId::generate(Utc::now());
        let parsed: TaskId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
        assert!("not-a-ulid".parse::<TaskId>().is_err());
    }

    #[test]
    fn serializes_as_plain_string() {
        let id = TaskId::generate(Utc::now());
        let json = serde_json::to_value(id).unwrap();
        assert_eq!(json, serde_json::Value::String(id.to_string()));
    }
}
