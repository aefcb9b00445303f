//! Timestamp helpers shared by backups and migration records.

use std::time::Duration;

use time::{OffsetDateTime, format_description::BorrowedFormatItem, macros::format_description};

const BACKUP_STAMP: &[BorrowedFormatItem<'static>] =
    format_description!("[year]-[month]-[day]_[hour]-[minute]-[second]");

/// Directory-safe stamp used to name backup runs, e.g. `2026-10-16_09-30-00`.
pub fn backup_stamp(at: OffsetDateTime) -> String {
    at.format(BACKUP_STAMP)
        .unwrap_or_else(|_| at.unix_timestamp().to_string())
}

/// Milliseconds as `u64`, saturating for absurdly long durations.
pub fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Serialize a [`Duration`] as whole milliseconds.
pub mod serde_millis {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(super::duration_ms(*value))
    }
}
