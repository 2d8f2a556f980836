//! Connect codes, friendships, and the user directory cache.
//!
//! Backed by SQLite. The authoritative user directory lives with the
//! external identity provider; the `users` table here is a cache refreshed
//! on every successful authentication so friend views and sender names can
//! be rendered without a provider round-trip.

use std::sync::Arc;

use parking_lot::Mutex;
use rand::Rng;
use rusqlite::{params, Connection};
use thiserror::Error;

/// Connect-code alphabet: A–Z and 2–9 with the ambiguous I, L, O, 1, 0
/// removed. 32 symbols.
pub const CODE_ALPHABET: &[u8] = b"ABCDEFGHJKMNPQRSTUVWXYZ23456789";

/// Connect codes are always six characters.
pub const CODE_LENGTH: usize = 6;

/// Uniqueness-collision retries before giving up on allocation.
const MAX_CODE_ATTEMPTS: usize = 10;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS users (
    user_id    TEXT PRIMARY KEY,
    email      TEXT NOT NULL,
    handle     TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS connect_codes (
    user_id    TEXT PRIMARY KEY,
    code       TEXT NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS friendships (
    user_id    TEXT NOT NULL,
    friend_id  TEXT NOT NULL,
    UNIQUE(user_id, friend_id)
);
";

/// Errors surfaced by directory operations. The dispatch layer maps these
/// onto the client-visible error strings.
#[derive(Error, Debug)]
pub enum DirectoryError {
    #[error("Cannot add yourself")]
    SelfFriend,

    #[error("Already friends")]
    AlreadyFriends,

    #[error("Connect code space exhausted")]
    CodeExhaustion,

    #[error("Database error: {0}")]
    Database(String),
}

impl From<rusqlite::Error> for DirectoryError {
    fn from(e: rusqlite::Error) -> Self {
        DirectoryError::Database(e.to_string())
    }
}

/// A cached directory entry.
#[derive(Debug, Clone)]
pub struct UserRecord {
    pub user_id: String,
    pub email: String,
    pub handle: String,
}

/// The persistent side of identity & friendships.
#[derive(Clone)]
pub struct Directory {
    conn: Arc<Mutex<Connection>>,
}

impl Directory {
    /// Open or create the directory database.
    ///
    /// `None` opens an in-memory database (tests, local development).
    pub fn open(path: Option<&str>) -> Result<Self, DirectoryError> {
        let conn = match path {
            Some(p) => Connection::open(p)?,
            None => Connection::open_in_memory()?,
        };
        conn.execute_batch(SCHEMA)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    // ── User cache ────────────────────────────────────────────────────────

    /// Refresh the cached identity for a user. Called on every successful
    /// authentication.
    pub fn upsert_user(
        &self,
        user_id: &str,
        email: &str,
        handle: &str,
    ) -> Result<(), DirectoryError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO users (user_id, email, handle) VALUES (?, ?, ?)
             ON CONFLICT(user_id) DO UPDATE SET email = excluded.email, handle = excluded.handle",
            params![user_id, email, handle],
        )?;
        Ok(())
    }

    /// Look up a cached user.
    pub fn get_user(&self, user_id: &str) -> Result<Option<UserRecord>, DirectoryError> {
        let conn = self.conn.lock();
        let result = conn.query_row(
            "SELECT user_id, email, handle FROM users WHERE user_id = ?",
            params![user_id],
            |row| {
                Ok(UserRecord {
                    user_id: row.get(0)?,
                    email: row.get(1)?,
                    handle: row.get(2)?,
                })
            },
        );

        match result {
            Ok(record) => Ok(Some(record)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    // ── Connect codes ─────────────────────────────────────────────────────

    /// Return the user's connect code, allocating one on first request.
    ///
    /// Candidates are drawn uniformly over the alphabet; a uniqueness
    /// collision triggers a retry, up to `MAX_CODE_ATTEMPTS`.
    pub fn get_or_create_connect_code(&self, user_id: &str) -> Result<String, DirectoryError> {
        let conn = self.conn.lock();

        let existing = conn.query_row(
            "SELECT code FROM connect_codes WHERE user_id = ?",
            params![user_id],
            |row| row.get::<_, String>(0),
        );
        match existing {
            Ok(code) => return Ok(code),
            Err(rusqlite::Error::QueryReturnedNoRows) => {}
            Err(e) => return Err(e.into()),
        }

        for _ in 0..MAX_CODE_ATTEMPTS {
            let code = random_code();
            match conn.execute(
                "INSERT INTO connect_codes (user_id, code) VALUES (?, ?)",
                params![user_id, code],
            ) {
                Ok(_) => {
                    tracing::info!(user_id, code = code.as_str(), "Allocated connect code");
                    return Ok(code);
                }
                Err(e) if is_unique_violation(&e) => {
                    tracing::debug!(code = code.as_str(), "Connect code collision, retrying");
                    continue;
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(DirectoryError::CodeExhaustion)
    }

    /// Resolve a connect code to its owner. Callers normalize case first.
    pub fn resolve_code(&self, code: &str) -> Result<Option<String>, DirectoryError> {
        let conn = self.conn.lock();
        let result = conn.query_row(
            "SELECT user_id FROM connect_codes WHERE code = ?",
            params![code],
            |row| row.get::<_, String>(0),
        );

        match result {
            Ok(user_id) => Ok(Some(user_id)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    // ── Friendships ───────────────────────────────────────────────────────

    /// Insert the symmetric friendship `(a, b)` / `(b, a)` in one
    /// transaction.
    pub fn add_friendship(&self, a: &str, b: &str) -> Result<(), DirectoryError> {
        if a == b {
            return Err(DirectoryError::SelfFriend);
        }

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let existing: i64 = tx.query_row(
            "SELECT COUNT(*) FROM friendships WHERE user_id = ? AND friend_id = ?",
            params![a, b],
            |row| row.get(0),
        )?;
        if existing > 0 {
            return Err(DirectoryError::AlreadyFriends);
        }

        tx.execute(
            "INSERT INTO friendships (user_id, friend_id) VALUES (?, ?)",
            params![a, b],
        )?;
        tx.execute(
            "INSERT INTO friendships (user_id, friend_id) VALUES (?, ?)",
            params![b, a],
        )?;
        tx.commit()?;

        tracing::info!(user = a, friend = b, "Friendship added");
        Ok(())
    }

    /// Whether `(a, b)` is in the friendship relation.
    pub fn are_friends(&self, a: &str, b: &str) -> Result<bool, DirectoryError> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM friendships WHERE user_id = ? AND friend_id = ?",
            params![a, b],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Ids of all friends of `user_id`.
    pub fn friend_ids(&self, user_id: &str) -> Result<Vec<String>, DirectoryError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT friend_id FROM friendships WHERE user_id = ?")?;
        let rows = stmt.query_map(params![user_id], |row| row.get::<_, String>(0))?;

        let mut ids = Vec::new();
        for row in rows {
            ids.push(row?);
        }
        Ok(ids)
    }

    /// Friends of `user_id` joined with their cached directory entries.
    pub fn list_friends(&self, user_id: &str) -> Result<Vec<UserRecord>, DirectoryError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT u.user_id, u.email, u.handle
             FROM friendships f
             JOIN users u ON u.user_id = f.friend_id
             WHERE f.user_id = ?
             ORDER BY u.handle",
        )?;
        let rows = stmt.query_map(params![user_id], |row| {
            Ok(UserRecord {
                user_id: row.get(0)?,
                email: row.get(1)?,
                handle: row.get(2)?,
            })
        })?;

        let mut friends = Vec::new();
        for row in rows {
            friends.push(row?);
        }
        Ok(friends)
    }
}

fn random_code() -> String {
    let mut rng = rand::thread_rng();
    (0..CODE_LENGTH)
        .map(|_| CODE_ALPHABET[rng.gen_range(0..CODE_ALPHABET.len())] as char)
        .collect()
}

fn is_unique_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _)
            if err.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_directory() -> Directory {
        let dir = Directory::open(None).unwrap();
        dir.upsert_user("u-1", "ada@example.com", "ada").unwrap();
        dir.upsert_user("u-2", "grace@example.com", "grace").unwrap();
        dir
    }

    #[test]
    fn test_code_matches_alphabet() {
        let dir = test_directory();
        let code = dir.get_or_create_connect_code("u-1").unwrap();

        assert_eq!(code.len(), CODE_LENGTH);
        for byte in code.bytes() {
            assert!(
                CODE_ALPHABET.contains(&byte),
                "Code {} contains {} outside the alphabet",
                code,
                byte as char
            );
        }
        // The ambiguous symbols never appear.
        for forbidden in ['I', 'L', 'O', '1', '0'] {
            assert!(!code.contains(forbidden));
        }
    }

    #[test]
    fn test_code_is_stable_across_requests() {
        let dir = test_directory();
        let first = dir.get_or_create_connect_code("u-1").unwrap();
        let second = dir.get_or_create_connect_code("u-1").unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_codes_are_unique_per_user() {
        let dir = test_directory();
        let a = dir.get_or_create_connect_code("u-1").unwrap();
        let b = dir.get_or_create_connect_code("u-2").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_resolve_code() {
        let dir = test_directory();
        let code = dir.get_or_create_connect_code("u-1").unwrap();

        assert_eq!(dir.resolve_code(&code).unwrap(), Some("u-1".to_string()));
        assert_eq!(dir.resolve_code("QQQQQQ").unwrap(), None);
    }

    #[test]
    fn test_friendship_is_symmetric() {
        let dir = test_directory();
        dir.add_friendship("u-1", "u-2").unwrap();

        assert!(dir.are_friends("u-1", "u-2").unwrap());
        assert!(dir.are_friends("u-2", "u-1").unwrap());
    }

    #[test]
    fn test_self_friend_rejected() {
        let dir = test_directory();
        assert!(matches!(
            dir.add_friendship("u-1", "u-1"),
            Err(DirectoryError::SelfFriend)
        ));
    }

    #[test]
    fn test_duplicate_friendship_rejected() {
        let dir = test_directory();
        dir.add_friendship("u-1", "u-2").unwrap();

        assert!(matches!(
            dir.add_friendship("u-1", "u-2"),
            Err(DirectoryError::AlreadyFriends)
        ));
        // The reverse direction is the same edge.
        assert!(matches!(
            dir.add_friendship("u-2", "u-1"),
            Err(DirectoryError::AlreadyFriends)
        ));
    }

    #[test]
    fn test_list_friends_joins_user_cache() {
        let dir = test_directory();
        dir.add_friendship("u-1", "u-2").unwrap();

        let friends = dir.list_friends("u-1").unwrap();
        assert_eq!(friends.len(), 1);
        assert_eq!(friends[0].user_id, "u-2");
        assert_eq!(friends[0].handle, "grace");

        let friends = dir.list_friends("u-2").unwrap();
        assert_eq!(friends.len(), 1);
        assert_eq!(friends[0].user_id, "u-1");
    }

    #[test]
    fn test_friend_ids() {
        let dir = test_directory();
        dir.upsert_user("u-3", "alan@example.com", "alan").unwrap();
        dir.add_friendship("u-1", "u-2").unwrap();
        dir.add_friendship("u-1", "u-3").unwrap();

        let mut ids = dir.friend_ids("u-1").unwrap();
        ids.sort();
        assert_eq!(ids, vec!["u-2".to_string(), "u-3".to_string()]);
    }

    #[test]
    fn test_upsert_refreshes_handle() {
        let dir = test_directory();
        dir.upsert_user("u-1", "ada.l@example.com", "ada.l").unwrap();

        let user = dir.get_user("u-1").unwrap().unwrap();
        assert_eq!(user.email, "ada.l@example.com");
        assert_eq!(user.handle, "ada.l");
    }
}
