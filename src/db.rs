use rusqlite::{params, Connection, Result};
use serde::Serialize;
use std::path::Path;
use std::str::FromStr;

/// Opens (or creates) the points database at the given path.
///
/// The bots own this file; the panel only creates the `users` table when it is
/// missing so a fresh install can still serve empty statistics.
pub fn open_or_create(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent() {
        // A missing directory surfaces as a rusqlite open error below.
        let _ = std::fs::create_dir_all(parent);
    }

    let conn = Connection::open(path)?;

    // Enable WAL mode so the bots can keep writing while the panel reads
    conn.execute_batch("PRAGMA journal_mode=WAL;")?;

    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS users (
            username      TEXT PRIMARY KEY,
            points        INTEGER NOT NULL DEFAULT 0,
            message_count INTEGER NOT NULL DEFAULT 0,
            last_seen     TEXT,
            is_follower   INTEGER NOT NULL DEFAULT 0
        );

        CREATE INDEX IF NOT EXISTS idx_users_points ON users(points);",
    )?;

    Ok(conn)
}

/// One of the top users shown on the stats card.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TopUser {
    pub username: String,
    pub points: i64,
    pub messages: i64,
    pub last_seen: Option<String>,
}

/// Aggregate numbers for the dashboard.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PointsStats {
    pub total_users: i64,
    pub total_points: i64,
    pub total_messages: i64,
    /// Mean points over users that have any, rounded to two decimals.
    pub avg_points: f64,
    pub top_users: Vec<TopUser>,
}

/// How many users the stats card lists.
const TOP_USERS: usize = 10;

pub fn stats(conn: &Connection) -> Result<PointsStats> {
    let (total_users, total_points, total_messages): (i64, i64, i64) = conn.query_row(
        "SELECT COUNT(*), COALESCE(SUM(points), 0), COALESCE(SUM(message_count), 0) FROM users",
        [],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
    )?;

    let avg: Option<f64> = conn.query_row(
        "SELECT AVG(points) FROM users WHERE points > 0",
        [],
        |row| row.get(0),
    )?;
    let avg_points = (avg.unwrap_or(0.0) * 100.0).round() / 100.0;

    let mut stmt = conn.prepare(
        "SELECT username, points, message_count, last_seen
         FROM users
         ORDER BY points DESC, username ASC
         LIMIT ?1",
    )?;
    let top_users = stmt
        .query_map(params![TOP_USERS as i64], |row| {
            Ok(TopUser {
                username: row.get(0)?,
                points: row.get(1)?,
                messages: row.get(2)?,
                last_seen: row.get(3)?,
            })
        })?
        .collect::<Result<Vec<_>>>()?;

    Ok(PointsStats {
        total_users,
        total_points,
        total_messages,
        avg_points,
        top_users,
    })
}

/// A row of the full ranking.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LeaderboardEntry {
    pub rank: usize,
    pub username: String,
    pub points: i64,
    pub messages: i64,
    pub last_seen: Option<String>,
    pub is_follower: bool,
}

/// Users ordered by points, highest first, ranked from 1.
pub fn leaderboard(conn: &Connection, limit: usize) -> Result<Vec<LeaderboardEntry>> {
    let mut stmt = conn.prepare(
        "SELECT username, points, message_count, last_seen, is_follower
         FROM users
         ORDER BY points DESC, username ASC
         LIMIT ?1",
    )?;
    let rows = stmt
        .query_map(params![limit as i64], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, i64>(4)?,
            ))
        })?
        .collect::<Result<Vec<_>>>()?;

    Ok(rows
        .into_iter()
        .enumerate()
        .map(
            |(i, (username, points, messages, last_seen, is_follower))| LeaderboardEntry {
                rank: i + 1,
                username,
                points,
                messages,
                last_seen,
                is_follower: is_follower != 0,
            },
        )
        .collect())
}

/// Add `points` (may be negative) to `username`.
///
/// Returns the number of rows updated: 0 when the user does not exist.
pub fn add_points(conn: &Connection, username: &str, points: i64) -> Result<usize> {
    conn.execute(
        "UPDATE users SET points = points + ?1 WHERE username = ?2",
        params![points, username],
    )
}

/// Which users a points reset applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClearScope {
    All,
    NonFollowers,
}

impl FromStr for ClearScope {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "all" => Ok(ClearScope::All),
            "non_followers" => Ok(ClearScope::NonFollowers),
            other => Err(format!("invalid clear type: {other}")),
        }
    }
}

/// Reset points to zero for the users in `scope`; returns rows affected.
pub fn clear_points(conn: &Connection, scope: ClearScope) -> Result<usize> {
    match scope {
        ClearScope::All => conn.execute("UPDATE users SET points = 0", []),
        ClearScope::NonFollowers => {
            conn.execute("UPDATE users SET points = 0 WHERE is_follower = 0", [])
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_db() -> (TempDir, Connection) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data").join("users.db");
        let conn = open_or_create(&path).unwrap();
        (dir, conn)
    }

    fn insert_user(conn: &Connection, name: &str, points: i64, messages: i64, follower: bool) {
        conn.execute(
            "INSERT INTO users (username, points, message_count, last_seen, is_follower)
             VALUES (?1, ?2, ?3, '2024-05-01 12:00:00', ?4)",
            params![name, points, messages, follower as i64],
        )
        .unwrap();
    }

    #[test]
    fn creates_database_and_parent_dir() {
        let (dir, conn) = test_db();
        assert!(dir.path().join("data").join("users.db").exists());

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn idempotent_creation() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("users.db");

        let conn1 = open_or_create(&path).unwrap();
        insert_user(&conn1, "alice", 5, 1, false);
        drop(conn1);
        let conn2 = open_or_create(&path).unwrap();

        let count: i64 = conn2
            .query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn stats_on_empty_table() {
        let (_dir, conn) = test_db();
        let s = stats(&conn).unwrap();
        assert_eq!(s.total_users, 0);
        assert_eq!(s.total_points, 0);
        assert_eq!(s.total_messages, 0);
        assert_eq!(s.avg_points, 0.0);
        assert!(s.top_users.is_empty());
    }

    #[test]
    fn stats_aggregate_and_average_ignores_zero_points() {
        let (_dir, conn) = test_db();
        insert_user(&conn, "alice", 10, 3, true);
        insert_user(&conn, "bob", 5, 7, false);
        insert_user(&conn, "carol", 0, 2, false);
        insert_user(&conn, "dave", 1, 0, false);

        let s = stats(&conn).unwrap();
        assert_eq!(s.total_users, 4);
        assert_eq!(s.total_points, 16);
        assert_eq!(s.total_messages, 12);
        // (10 + 5 + 1) / 3 = 5.333..
        assert_eq!(s.avg_points, 5.33);
        assert_eq!(s.top_users[0].username, "alice");
        assert_eq!(s.top_users[0].messages, 3);
    }

    #[test]
    fn stats_lists_at_most_ten_users() {
        let (_dir, conn) = test_db();
        for i in 0..15 {
            insert_user(&conn, &format!("user{i:02}"), i, 0, false);
        }

        let s = stats(&conn).unwrap();
        assert_eq!(s.top_users.len(), 10);
        assert_eq!(s.top_users[0].username, "user14");
    }

    #[test]
    fn leaderboard_ranks_by_points() {
        let (_dir, conn) = test_db();
        insert_user(&conn, "alice", 10, 3, true);
        insert_user(&conn, "bob", 50, 7, false);
        insert_user(&conn, "carol", 20, 2, true);

        let board = leaderboard(&conn, 100).unwrap();
        let names: Vec<_> = board.iter().map(|e| e.username.as_str()).collect();
        assert_eq!(names, vec!["bob", "carol", "alice"]);
        assert_eq!(board[0].rank, 1);
        assert_eq!(board[2].rank, 3);
        assert!(!board[0].is_follower);
        assert!(board[1].is_follower);
    }

    #[test]
    fn leaderboard_respects_limit() {
        let (_dir, conn) = test_db();
        for i in 0..5 {
            insert_user(&conn, &format!("u{i}"), i, 0, false);
        }
        assert_eq!(leaderboard(&conn, 2).unwrap().len(), 2);
    }

    #[test]
    fn add_points_updates_existing_user() {
        let (_dir, conn) = test_db();
        insert_user(&conn, "alice", 10, 0, false);

        assert_eq!(add_points(&conn, "alice", 15).unwrap(), 1);
        assert_eq!(add_points(&conn, "alice", -5).unwrap(), 1);

        let points: i64 = conn
            .query_row("SELECT points FROM users WHERE username = 'alice'", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(points, 20);
    }

    #[test]
    fn add_points_to_unknown_user_touches_nothing() {
        let (_dir, conn) = test_db();
        assert_eq!(add_points(&conn, "ghost", 10).unwrap(), 0);
    }

    #[test]
    fn clear_non_followers_keeps_follower_points() {
        let (_dir, conn) = test_db();
        insert_user(&conn, "alice", 10, 0, true);
        insert_user(&conn, "bob", 20, 0, false);
        insert_user(&conn, "carol", 30, 0, false);

        assert_eq!(clear_points(&conn, ClearScope::NonFollowers).unwrap(), 2);
        let s = stats(&conn).unwrap();
        assert_eq!(s.total_points, 10);

        assert_eq!(clear_points(&conn, ClearScope::All).unwrap(), 3);
        assert_eq!(stats(&conn).unwrap().total_points, 0);
    }

    #[test]
    fn clear_scope_parsing() {
        assert_eq!("all".parse::<ClearScope>().unwrap(), ClearScope::All);
        assert_eq!(
            "non_followers".parse::<ClearScope>().unwrap(),
            ClearScope::NonFollowers
        );
        assert!("everyone".parse::<ClearScope>().is_err());
    }
}
