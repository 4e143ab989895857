use crate::Database;
use crate::models::{NewResult, ResultRow, UserRow};
use anyhow::Result;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, Row};

impl Database {
    // -- Users --

    pub fn create_user(&self, id: &str, username: &str, password_hash: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO users (id, username, password) VALUES (?1, ?2, ?3)",
                (id, username, password_hash),
            )?;
            Ok(())
        })
    }

    pub fn get_user_by_username(&self, username: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user_by_username(conn, username))
    }

    // -- Uploads --

    pub fn record_upload(&self, image_path: &str, user_id: &str, created_at: DateTime<Utc>) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO uploads (image_path, user_id, created_at) VALUES (?1, ?2, ?3)",
                (image_path, user_id, format_timestamp(created_at)),
            )?;
            Ok(())
        })
    }

    /// Id of the user who uploaded `image_path`.
    pub fn get_upload_owner(&self, image_path: &str) -> Result<Option<String>> {
        self.with_conn(|conn| {
            let owner: Option<String> = conn
                .query_row(
                    "SELECT user_id FROM uploads WHERE image_path = ?1",
                    [image_path],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(owner)
        })
    }

    // -- Results --

    /// Insert one record per face, all or nothing.
    pub fn insert_results(
        &self,
        user_id: &str,
        image_path: &str,
        results: &[NewResult],
        created_at: DateTime<Utc>,
    ) -> Result<()> {
        let created_at = format_timestamp(created_at);
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare(
                    "INSERT INTO results (id, user_id, image_path, dominant_emotion, confidence, emotions, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                )?;
                for r in results {
                    stmt.execute(rusqlite::params![
                        r.id,
                        user_id,
                        image_path,
                        r.dominant_emotion,
                        r.confidence,
                        r.emotions,
                        created_at,
                    ])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
    }

    /// All results owned by `user_id`, newest first.
    pub fn get_results_for_user(&self, user_id: &str) -> Result<Vec<ResultRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, user_id, image_path, dominant_emotion, confidence, emotions, created_at
                 FROM results
                 WHERE user_id = ?1
                 ORDER BY created_at DESC, rowid DESC",
            )?;

            let rows = stmt
                .query_map([user_id], map_result_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            Ok(rows)
        })
    }

    pub fn get_result(&self, id: &str) -> Result<Option<ResultRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, user_id, image_path, dominant_emotion, confidence, emotions, created_at
                 FROM results WHERE id = ?1",
            )?;
            let row = stmt.query_row([id], map_result_row).optional()?;
            Ok(row)
        })
    }

    /// Delete a result owned by `user_id`.
    /// Returns `None` if nothing matched, otherwise how many of the owner's
    /// results still reference the same image. The upload record goes with the
    /// last one.
    pub fn delete_result(&self, id: &str, user_id: &str) -> Result<Option<(String, usize)>> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            let image_path: Option<String> = tx
                .query_row(
                    "SELECT image_path FROM results WHERE id = ?1 AND user_id = ?2",
                    [id, user_id],
                    |row| row.get(0),
                )
                .optional()?;

            let Some(image_path) = image_path else {
                return Ok(None);
            };

            tx.execute("DELETE FROM results WHERE id = ?1", [id])?;
            let remaining: i64 = tx.query_row(
                "SELECT COUNT(*) FROM results WHERE image_path = ?1 AND user_id = ?2",
                [image_path.as_str(), user_id],
                |row| row.get(0),
            )?;
            if remaining == 0 {
                tx.execute(
                    "DELETE FROM uploads WHERE image_path = ?1 AND user_id = ?2",
                    [image_path.as_str(), user_id],
                )?;
            }
            tx.commit()?;

            Ok(Some((image_path, remaining as usize)))
        })
    }
}

fn query_user_by_username(conn: &Connection, username: &str) -> Result<Option<UserRow>> {
    let mut stmt =
        conn.prepare("SELECT id, username, password, created_at FROM users WHERE username = ?1")?;

    let row = stmt
        .query_row([username], |row| {
            Ok(UserRow {
                id: row.get(0)?,
                username: row.get(1)?,
                password: row.get(2)?,
                created_at: row.get(3)?,
            })
        })
        .optional()?;

    Ok(row)
}

fn map_result_row(row: &Row<'_>) -> rusqlite::Result<ResultRow> {
    let created_at: String = row.get(6)?;
    Ok(ResultRow {
        id: row.get(0)?,
        user_id: row.get(1)?,
        image_path: row.get(2)?,
        dominant_emotion: row.get(3)?,
        confidence: row.get(4)?,
        emotions: row.get(5)?,
        created_at: parse_timestamp(6, &created_at)?,
    })
}

/// Microsecond RFC 3339 in UTC, so lexical order matches time order.
fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(idx: usize, value: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

/// Extension trait for optional query results
trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
