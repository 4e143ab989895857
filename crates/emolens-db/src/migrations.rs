use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS users (
            id          TEXT PRIMARY KEY,
            username    TEXT NOT NULL UNIQUE,
            password    TEXT NOT NULL,
            created_at  TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
        );

        CREATE TABLE IF NOT EXISTS results (
            id                TEXT PRIMARY KEY,
            user_id           TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            image_path        TEXT NOT NULL,
            dominant_emotion  TEXT NOT NULL,
            confidence        REAL NOT NULL,
            emotions          TEXT NOT NULL,
            created_at        TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS uploads (
            image_path  TEXT PRIMARY KEY,
            user_id     TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            created_at  TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_results_user
            ON results(user_id, created_at);

        CREATE INDEX IF NOT EXISTS idx_results_image
            ON results(image_path);
        ",
    )?;

    info!("Database migrations complete");
    Ok(())
}
