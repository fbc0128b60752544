//! SQLite storage layer for hush.
//!
//! Owns all persistent state: the room table with TTL expiry and the
//! per-room message log with server-assigned sequence numbers.  The relay
//! never inspects `nonce` or `ciphertext`; both are stored verbatim as
//! blobs.  Schema creation and evolution live in the migration runner
//! ([`crate::migrate`]); this module assumes a migrated database.

use std::path::Path;

use rand::rngs::OsRng;
use rand::RngCore;
use rusqlite::types::ValueRef;
use rusqlite::{params, Connection, OptionalExtension};

use crate::migrate::{self, MigrateError};

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum StorageError {
    /// Room is missing, or expired where liveness is part of the lookup.
    NotFound,
    /// Room exists but its expiry has passed.
    RoomExpired,
    Sqlite(rusqlite::Error),
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageError::NotFound => write!(f, "room not found"),
            StorageError::RoomExpired => write!(f, "room expired"),
            StorageError::Sqlite(e) => write!(f, "sqlite error: {e}"),
        }
    }
}

impl std::error::Error for StorageError {}

impl From<rusqlite::Error> for StorageError {
    fn from(e: rusqlite::Error) -> Self {
        StorageError::Sqlite(e)
    }
}

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

/// A persisted ciphertext message, as read back for history replay.
#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub seq: i64,
    pub created_at: i64,
    pub nonce: Vec<u8>,
    pub ciphertext: Vec<u8>,
    pub message_type: String,
}

// ---------------------------------------------------------------------------
// Storage handle
// ---------------------------------------------------------------------------

/// Main storage handle wrapping a SQLite connection.
///
/// SQLite serializes writes on the connection, and every multi-step
/// operation here runs inside one transaction, so sequence assignment is
/// race-free without any further coordination in the caller.
pub struct Storage {
    conn: Connection,
}

impl Storage {
    /// Open or create a database at the given path.
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        Ok(Self { conn })
    }

    /// Create an in-memory database, used by tests.
    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Ok(Self { conn })
    }

    /// Apply pending schema migrations from `dir`.  Returns the number of
    /// files applied.
    pub fn migrate(&mut self, dir: &Path) -> Result<usize, MigrateError> {
        migrate::Runner::new(&mut self.conn, dir).run()
    }

    // -----------------------------------------------------------------------
    // Rooms
    // -----------------------------------------------------------------------

    /// Create a room that expires `ttl_secs` from now.  Returns the token and
    /// the expiry instant.
    ///
    /// The token is 16 bytes from the OS RNG, hex-encoded: knowing the URL is
    /// the sole key to the room, so the token must be uniformly random.
    pub fn create_room(&self, ttl_secs: u64) -> Result<(String, i64), StorageError> {
        let mut bytes = [0u8; 16];
        OsRng.fill_bytes(&mut bytes);
        let token = hex::encode(bytes);

        let now = now_secs();
        let expires_at = now + ttl_secs as i64;
        self.conn.execute(
            "INSERT INTO rooms (token, created_at, expires_at) VALUES (?1, ?2, ?3)",
            params![token, now, expires_at],
        )?;

        Ok((token, expires_at))
    }

    /// Whether a live (unexpired) room with this token exists.
    pub fn room_exists(&self, token: &str) -> Result<bool, StorageError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM rooms WHERE token = ?1 AND expires_at > ?2",
            params![token, now_secs()],
            |row| row.get(0),
        )?;
        Ok(count == 1)
    }

    /// Expiry instant of a live room, in seconds since epoch.
    pub fn room_expiry(&self, token: &str) -> Result<i64, StorageError> {
        self.conn
            .query_row(
                "SELECT expires_at FROM rooms WHERE token = ?1 AND expires_at > ?2",
                params![token, now_secs()],
                |row| row.get_ref(0).and_then(epoch_from_ref),
            )
            .optional()?
            .ok_or(StorageError::NotFound)
    }

    /// Remove a room and its entire message set, unconditionally.
    pub fn delete_room(&mut self, token: &str) -> Result<(), StorageError> {
        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM messages WHERE room_id = ?1", params![token])?;
        tx.execute("DELETE FROM rooms WHERE token = ?1", params![token])?;
        tx.commit()?;
        Ok(())
    }

    /// Delete every expired room together with its messages, in one
    /// transaction.  Returns the number of rooms removed.  Idempotent.
    pub fn cleanup_expired(&mut self) -> Result<usize, StorageError> {
        let now = now_secs();

        let tx = self.conn.transaction()?;
        tx.execute(
            "DELETE FROM messages WHERE room_id IN
                 (SELECT token FROM rooms WHERE expires_at <= ?1)",
            params![now],
        )?;
        let rooms = tx.execute("DELETE FROM rooms WHERE expires_at <= ?1", params![now])?;
        tx.commit()?;

        Ok(rooms)
    }

    /// Rewrite legacy rows whose timestamps were stored as text (integer
    /// strings or RFC 3339) into plain integers.  One-shot, run at startup.
    pub fn normalize_room_timestamps(&self) -> Result<usize, StorageError> {
        let mut stmt = self.conn.prepare(
            "SELECT token, created_at, expires_at FROM rooms
             WHERE typeof(created_at) != 'integer' OR typeof(expires_at) != 'integer'",
        )?;
        let rows: Vec<(String, i64, i64)> = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get_ref(1).and_then(epoch_from_ref)?,
                    row.get_ref(2).and_then(epoch_from_ref)?,
                ))
            })?
            .collect::<Result<_, _>>()?;
        drop(stmt);

        for (token, created_at, expires_at) in &rows {
            self.conn.execute(
                "UPDATE rooms SET created_at = ?1, expires_at = ?2 WHERE token = ?3",
                params![created_at, expires_at, token],
            )?;
        }

        Ok(rows.len())
    }

    // -----------------------------------------------------------------------
    // Message log
    // -----------------------------------------------------------------------

    /// Persist a ciphertext message and return the sequence number the server
    /// assigned to it.
    ///
    /// The expiry check, the max-seq read, and the insert share one
    /// transaction, which is what makes the per-room sequence strictly
    /// increasing under concurrent senders.
    pub fn insert_message(
        &mut self,
        room_id: &str,
        nonce: &[u8],
        ciphertext: &[u8],
        created_at: i64,
        message_type: &str,
    ) -> Result<i64, StorageError> {
        let now = now_secs();

        let tx = self.conn.transaction()?;

        let expires_at = tx
            .query_row(
                "SELECT expires_at FROM rooms WHERE token = ?1",
                params![room_id],
                |row| row.get_ref(0).and_then(epoch_from_ref),
            )
            .optional()?
            .ok_or(StorageError::NotFound)?;
        if expires_at <= now {
            return Err(StorageError::RoomExpired);
        }

        let seq: i64 = tx.query_row(
            "SELECT COALESCE(MAX(seq), 0) + 1 FROM messages WHERE room_id = ?1",
            params![room_id],
            |row| row.get(0),
        )?;

        tx.execute(
            "INSERT INTO messages (room_id, created_at, ciphertext, nonce, seq, message_type)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![room_id, created_at, ciphertext, nonce, seq, message_type],
        )?;

        tx.commit()?;
        Ok(seq)
    }

    /// All messages of a live room with `seq > after_seq`, ascending.
    pub fn messages_since(
        &self,
        room_id: &str,
        after_seq: i64,
    ) -> Result<Vec<StoredMessage>, StorageError> {
        let expires_at = self
            .conn
            .query_row(
                "SELECT expires_at FROM rooms WHERE token = ?1",
                params![room_id],
                |row| row.get_ref(0).and_then(epoch_from_ref),
            )
            .optional()?
            .ok_or(StorageError::NotFound)?;
        if expires_at <= now_secs() {
            return Err(StorageError::RoomExpired);
        }

        let mut stmt = self.conn.prepare(
            "SELECT seq, created_at, nonce, ciphertext, message_type
             FROM messages
             WHERE room_id = ?1 AND seq > ?2
             ORDER BY seq ASC",
        )?;
        let rows = stmt.query_map(params![room_id, after_seq], |row| {
            Ok(StoredMessage {
                seq: row.get(0)?,
                created_at: row.get(1)?,
                nonce: row.get(2)?,
                ciphertext: row.get(3)?,
                message_type: row.get(4)?,
            })
        })?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }

    /// Current sequence head of a room, for diagnostics.  0 when empty.
    pub fn max_seq(&self, room_id: &str) -> Result<i64, StorageError> {
        let seq = self.conn.query_row(
            "SELECT COALESCE(MAX(seq), 0) FROM messages WHERE room_id = ?1",
            params![room_id],
            |row| row.get(0),
        )?;
        Ok(seq)
    }
}

// ---------------------------------------------------------------------------
// Time helpers
// ---------------------------------------------------------------------------

/// Current time as seconds since UNIX epoch.
pub fn now_secs() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// Interpret a SQLite column as an epoch-seconds value, tolerating the legacy
/// textual encodings that [`Storage::normalize_room_timestamps`] rewrites.
fn epoch_from_ref(value: ValueRef<'_>) -> rusqlite::Result<i64> {
    let bad = |detail: &str| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            format!("invalid unix/time value: {detail}").into(),
        )
    };
    match value {
        ValueRef::Integer(i) => Ok(i),
        ValueRef::Real(f) => Ok(f as i64),
        ValueRef::Text(bytes) => {
            let s = std::str::from_utf8(bytes).map_err(|_| bad("not utf-8"))?;
            parse_epoch_text(s).ok_or_else(|| bad(s))
        }
        _ => Err(bad("unsupported column type")),
    }
}

/// Parse `"1700000000"` or an RFC 3339 timestamp into epoch seconds.
fn parse_epoch_text(s: &str) -> Option<i64> {
    let s = s.trim();
    if let Ok(unix) = s.parse::<i64>() {
        return Some(unix);
    }
    parse_rfc3339(s)
}

/// Minimal RFC 3339 parser: `YYYY-MM-DDTHH:MM:SS[.frac][Z|±HH:MM]`.
/// Fractional seconds are truncated.
fn parse_rfc3339(s: &str) -> Option<i64> {
    let (date, rest) = s.split_once(['T', 't', ' '])?;

    let mut date_parts = date.split('-');
    let year: i64 = date_parts.next()?.parse().ok()?;
    let month: u64 = date_parts.next()?.parse().ok()?;
    let day: u64 = date_parts.next()?.parse().ok()?;
    if date_parts.next().is_some() || !(1..=12).contains(&month) || !(1..=31).contains(&day) {
        return None;
    }

    // Split the trailing zone designator off the time-of-day part.
    let (time, offset_secs) = if let Some(t) = rest.strip_suffix(['Z', 'z']) {
        (t, 0i64)
    } else if let Some(pos) = rest.rfind(['+', '-']) {
        let (t, zone) = rest.split_at(pos);
        let sign = if zone.starts_with('-') { -1 } else { 1 };
        let (zh, zm) = zone[1..].split_once(':')?;
        let zh: i64 = zh.parse().ok()?;
        let zm: i64 = zm.parse().ok()?;
        (t, sign * (zh * 3600 + zm * 60))
    } else {
        return None;
    };

    let time = time.split_once('.').map(|(t, _)| t).unwrap_or(time);
    let mut time_parts = time.split(':');
    let hour: i64 = time_parts.next()?.parse().ok()?;
    let minute: i64 = time_parts.next()?.parse().ok()?;
    let second: i64 = time_parts.next()?.parse().ok()?;
    if time_parts.next().is_some() || hour > 23 || minute > 59 || second > 60 {
        return None;
    }

    let days = days_from_civil(year, month, day);
    Some(days * 86400 + hour * 3600 + minute * 60 + second - offset_secs)
}

/// Format epoch seconds as `YYYY-MM-DDTHH:MM:SSZ`.
pub fn format_rfc3339(secs: i64) -> String {
    let days = secs.div_euclid(86400);
    let time_secs = secs.rem_euclid(86400);
    let hours = time_secs / 3600;
    let minutes = (time_secs % 3600) / 60;
    let seconds = time_secs % 60;

    // Civil date from days since epoch (Howard Hinnant's algorithm).
    let z = days + 719_468;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    let doe = (z - era * 146_097) as u64;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146_096) / 365;
    let y = yoe as i64 + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = doy - (153 * mp + 2) / 5 + 1;
    let m = if mp < 10 { mp + 3 } else { mp - 9 };
    let y = if m <= 2 { y + 1 } else { y };

    format!("{y:04}-{m:02}-{d:02}T{hours:02}:{minutes:02}:{seconds:02}Z")
}

/// Days since epoch for a civil date (inverse of the formatter above).
fn days_from_civil(year: i64, month: u64, day: u64) -> i64 {
    let y = if month <= 2 { year - 1 } else { year };
    let era = if y >= 0 { y } else { y - 399 } / 400;
    let yoe = (y - era * 400) as u64;
    let mp = if month > 2 { month - 3 } else { month + 9 };
    let doy = (153 * mp + 2) / 5 + day - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146_097 + doe as i64 - 719_468
}
