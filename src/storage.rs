//! Append-only SQLite log of user/bot exchanges.
//!
//! Every call opens a fresh connection and relies on SQLite's own locking;
//! the schema is ensured idempotently before writes. Storage errors never
//! propagate: they are logged and surfaced as empty results or `false`.

use rusqlite::{Connection, params};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Messages longer than this are truncated before storage.
const MAX_FIELD_CHARS: usize = 1000;

/// Hard cap on `history` rows per request.
pub const HISTORY_MAX: usize = 20;

/// Default number of `history` rows.
pub const HISTORY_DEFAULT: usize = 5;

/// One recorded exchange, as returned by `history`.
#[derive(Debug, Clone)]
pub struct InteractionRow {
    pub user_message: String,
    pub bot_response: Option<String>,
    pub timestamp: String,
}

#[derive(Debug, Clone)]
pub struct TopUser {
    pub user_id: i64,
    pub username: Option<String>,
    pub count: i64,
}

#[derive(Debug, Clone)]
pub struct RecentUser {
    pub user_id: i64,
    pub username: Option<String>,
    pub last_interaction: String,
}

/// Aggregate numbers for the admin panel.
#[derive(Debug, Clone)]
pub struct Stats {
    pub distinct_users: i64,
    pub total_interactions: i64,
    pub last_24h: i64,
    pub top_users: Vec<TopUser>,
}

pub struct InteractionLog {
    db_path: PathBuf,
}

/// Truncate at a char boundary, counting chars the way the platform does.
fn truncate_chars(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

impl InteractionLog {
    pub fn new<P: AsRef<Path>>(db_path: P) -> Self {
        Self { db_path: db_path.as_ref().to_path_buf() }
    }

    fn open(&self) -> rusqlite::Result<Connection> {
        let conn = Connection::open(&self.db_path)?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS interactions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                username TEXT,
                user_message TEXT NOT NULL,
                bot_response TEXT,
                timestamp DATETIME DEFAULT CURRENT_TIMESTAMP
            );

            CREATE INDEX IF NOT EXISTS idx_interactions_user_id ON interactions(user_id);
            "#,
        )?;
        Ok(conn)
    }

    /// Record one exchange. Returns `false` (and logs) on any storage error.
    pub fn record(
        &self,
        user_id: i64,
        username: Option<&str>,
        user_message: &str,
        bot_response: Option<&str>,
    ) -> bool {
        let result = self.open().and_then(|conn| {
            conn.execute(
                "INSERT INTO interactions (user_id, username, user_message, bot_response)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    user_id,
                    username,
                    truncate_chars(user_message, MAX_FIELD_CHARS),
                    bot_response.map(|r| truncate_chars(r, MAX_FIELD_CHARS)),
                ],
            )
        });

        match result {
            Ok(_) => {
                info!("Recorded interaction for user {user_id}");
                true
            }
            Err(e) => {
                warn!("Failed to record interaction: {e}");
                false
            }
        }
    }

    /// Most recent exchanges for one user, newest first. `limit` is clamped
    /// to `HISTORY_MAX`.
    pub fn history(&self, user_id: i64, limit: usize) -> Vec<InteractionRow> {
        let limit = limit.min(HISTORY_MAX);
        let result = self.open().and_then(|conn| {
            let mut stmt = conn.prepare(
                "SELECT user_message, bot_response, timestamp
                 FROM interactions
                 WHERE user_id = ?1
                 ORDER BY timestamp DESC, id DESC
                 LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![user_id, limit as i64], |row| {
                Ok(InteractionRow {
                    user_message: row.get(0)?,
                    bot_response: row.get(1)?,
                    timestamp: row.get(2)?,
                })
            })?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
        });

        result.unwrap_or_else(|e| {
            warn!("Failed to read history: {e}");
            Vec::new()
        })
    }

    /// Aggregate statistics for the admin panel.
    pub fn stats(&self) -> Option<Stats> {
        let cutoff = (chrono::Utc::now() - chrono::Duration::days(1))
            .format("%Y-%m-%d %H:%M:%S")
            .to_string();

        let result = self.open().and_then(|conn| {
            let distinct_users: i64 =
                conn.query_row("SELECT COUNT(DISTINCT user_id) FROM interactions", [], |r| {
                    r.get(0)
                })?;
            let total_interactions: i64 =
                conn.query_row("SELECT COUNT(*) FROM interactions", [], |r| r.get(0))?;
            let last_24h: i64 = conn.query_row(
                "SELECT COUNT(*) FROM interactions WHERE timestamp >= ?1",
                params![cutoff],
                |r| r.get(0),
            )?;

            let mut stmt = conn.prepare(
                "SELECT user_id, username, COUNT(*) as interaction_count
                 FROM interactions
                 GROUP BY user_id, username
                 ORDER BY interaction_count DESC
                 LIMIT 5",
            )?;
            let top_users = stmt
                .query_map([], |row| {
                    Ok(TopUser {
                        user_id: row.get(0)?,
                        username: row.get(1)?,
                        count: row.get(2)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            Ok(Stats { distinct_users, total_interactions, last_24h, top_users })
        });

        match result {
            Ok(stats) => Some(stats),
            Err(e) => {
                warn!("Failed to compute stats: {e}");
                None
            }
        }
    }

    /// Per-day interaction counts for the last 7 recorded days, newest first.
    pub fn daily_counts(&self) -> Vec<(String, i64)> {
        let result = self.open().and_then(|conn| {
            let mut stmt = conn.prepare(
                "SELECT date(timestamp) as interaction_date, COUNT(*)
                 FROM interactions
                 GROUP BY interaction_date
                 ORDER BY interaction_date DESC
                 LIMIT 7",
            )?;
            let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
        });

        result.unwrap_or_else(|e| {
            warn!("Failed to read daily counts: {e}");
            Vec::new()
        })
    }

    /// Distinct users ordered by most recent interaction.
    pub fn recent_users(&self, limit: usize) -> Vec<RecentUser> {
        let result = self.open().and_then(|conn| {
            let mut stmt = conn.prepare(
                "SELECT user_id, username, MAX(timestamp) as last_interaction
                 FROM interactions
                 GROUP BY user_id, username
                 ORDER BY last_interaction DESC
                 LIMIT ?1",
            )?;
            let rows = stmt.query_map(params![limit as i64], |row| {
                Ok(RecentUser {
                    user_id: row.get(0)?,
                    username: row.get(1)?,
                    last_interaction: row.get(2)?,
                })
            })?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
        });

        result.unwrap_or_else(|e| {
            warn!("Failed to read recent users: {e}");
            Vec::new()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_log() -> (TempDir, InteractionLog) {
        let dir = TempDir::new().unwrap();
        let log = InteractionLog::new(dir.path().join("interactions.db"));
        (dir, log)
    }

    #[test]
    fn test_record_and_history() {
        let (_dir, log) = test_log();
        for i in 0..3 {
            let question = format!("q{i}");
            let answer = format!("a{i}");
            assert!(log.record(100, Some("alice"), &question, Some(answer.as_str())));
        }

        let rows = log.history(100, 5);
        assert_eq!(rows.len(), 3);
        // Newest first.
        assert_eq!(rows[0].user_message, "q2");
        assert_eq!(rows[2].user_message, "q0");
    }

    #[test]
    fn test_history_respects_limit_and_cap() {
        let (_dir, log) = test_log();
        for i in 0..25 {
            log.record(100, None, &format!("m{i}"), None);
        }

        assert_eq!(log.history(100, 5).len(), 5);
        // Limit above the cap is clamped to 20.
        assert_eq!(log.history(100, 100).len(), 20);
    }

    #[test]
    fn test_history_is_per_user() {
        let (_dir, log) = test_log();
        log.record(100, Some("alice"), "from alice", None);
        log.record(200, Some("bob"), "from bob", None);

        let rows = log.history(100, 5);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].user_message, "from alice");
    }

    #[test]
    fn test_record_truncates_long_messages() {
        let (_dir, log) = test_log();
        let long = "x".repeat(2000);
        assert!(log.record(100, None, &long, Some(long.as_str())));

        let rows = log.history(100, 1);
        assert_eq!(rows[0].user_message.chars().count(), 1000);
        assert_eq!(rows[0].bot_response.as_ref().unwrap().chars().count(), 1000);
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        let cyrillic = "ш".repeat(1500);
        let truncated = truncate_chars(&cyrillic, 1000);
        assert_eq!(truncated.chars().count(), 1000);
    }

    #[test]
    fn test_stats_counts() {
        let (_dir, log) = test_log();
        log.record(100, Some("alice"), "one", Some("r"));
        log.record(100, Some("alice"), "two", Some("r"));
        log.record(200, Some("bob"), "three", None);

        let stats = log.stats().unwrap();
        assert_eq!(stats.distinct_users, 2);
        assert_eq!(stats.total_interactions, 3);
        assert_eq!(stats.last_24h, 3);
        assert_eq!(stats.top_users[0].user_id, 100);
        assert_eq!(stats.top_users[0].count, 2);
    }

    #[test]
    fn test_daily_counts_grouped() {
        let (_dir, log) = test_log();
        log.record(100, None, "a", None);
        log.record(200, None, "b", None);

        let days = log.daily_counts();
        assert_eq!(days.len(), 1);
        assert_eq!(days[0].1, 2);
    }

    #[test]
    fn test_recent_users_ordering() {
        let (_dir, log) = test_log();
        log.record(100, Some("alice"), "a", None);
        log.record(200, Some("bob"), "b", None);

        let users = log.recent_users(10);
        assert_eq!(users.len(), 2);
    }

    #[test]
    fn test_unwritable_path_degrades_to_false() {
        let log = InteractionLog::new("/nonexistent/dir/interactions.db");
        assert!(!log.record(100, None, "msg", None));
        assert!(log.history(100, 5).is_empty());
        assert!(log.stats().is_none());
    }
}
