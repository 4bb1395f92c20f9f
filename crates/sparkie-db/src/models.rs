//! Database row types. These map directly to SQLite rows and stay
//! independent of the wire types in sparkie-types.

use chrono::{DateTime, NaiveDateTime, Utc};
use sparkie_types::models::Role;
use tracing::warn;

pub struct UserRow {
    pub id: i64,
    pub username: String,
    pub email: String,
    pub password_hash: String,
    pub is_active: bool,
    pub created_at: String,
}

pub struct ConversationRow {
    pub id: i64,
    pub user_id: i64,
    pub title: String,
    pub created_at: String,
    pub updated_at: String,
    pub message_count: i64,
}

pub struct MessageRow {
    pub id: i64,
    pub conversation_id: i64,
    pub role: Role,
    pub content: String,
    pub created_at: String,
}

/// Parse a stored timestamp. Rows written by this crate use RFC 3339; plain
/// `datetime('now')` values ("YYYY-MM-DD HH:MM:SS") are read as UTC.
pub fn parse_timestamp(raw: &str) -> DateTime<Utc> {
    raw.parse::<DateTime<Utc>>()
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S").map(|ndt| ndt.and_utc()))
        .unwrap_or_else(|e| {
            warn!("Corrupt timestamp '{}': {}", raw, e);
            DateTime::default()
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, Timelike};

    #[test]
    fn parses_both_timestamp_formats() {
        let a = parse_timestamp("2026-03-01T10:20:30.123Z");
        assert_eq!((a.year(), a.hour(), a.second()), (2026, 10, 30));

        let b = parse_timestamp("2026-03-01 10:20:30");
        assert_eq!((b.month(), b.minute()), (3, 20));
    }
}
