use rusqlite::Connection;
use tracing::info;

use crate::error::{Result, StoreError};

pub const SCHEMA_VERSION: i64 = 1;

/// Columns the queries rely on, per table. Checked once at startup.
const CONTRACT: &[(&str, &[&str])] = &[
    ("identities", &["id", "email", "created_at"]),
    ("login_tokens", &["token", "email", "expires_at", "used_at"]),
    ("users", &["id", "email", "display_name", "created_at"]),
    (
        "items",
        &[
            "id",
            "title",
            "vague_description",
            "status",
            "category",
            "location_hint",
            "metadata",
            "ai_confidence",
            "poster_id",
            "object_type",
            "color",
            "created_at",
        ],
    ),
    ("item_images", &["id", "item_id", "storage_path", "thumbnail_path", "created_at"]),
    (
        "messages",
        &[
            "id",
            "item_id",
            "sender_id",
            "receiver_id",
            "body",
            "confirm_role",
            "confirm_kind",
            "sender_handle",
            "read_at",
            "created_at",
        ],
    ),
];

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL);")?;

    let version: i64 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |r| r.get(0),
    )?;

    if version < 1 {
        info!("Running migration v1 (initial schema)");
        conn.execute_batch(
            "
            CREATE TABLE identities (
                id          TEXT PRIMARY KEY,
                email       TEXT NOT NULL UNIQUE,
                created_at  TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
            );

            CREATE TABLE login_tokens (
                token       TEXT PRIMARY KEY,
                email       TEXT NOT NULL,
                expires_at  TEXT NOT NULL,
                used_at     TEXT
            );

            CREATE TABLE users (
                id            TEXT PRIMARY KEY,
                email         TEXT NOT NULL UNIQUE,
                display_name  TEXT,
                created_at    TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
            );

            CREATE TABLE items (
                id                 TEXT PRIMARY KEY,
                title              TEXT,
                vague_description  TEXT,
                status             TEXT NOT NULL DEFAULT 'found'
                                   CHECK (status IN ('found', 'lost', 'claimed')),
                category           TEXT,
                location_hint      TEXT,
                metadata           TEXT NOT NULL DEFAULT '{}',
                ai_confidence      REAL,
                poster_id          TEXT REFERENCES users(id),
                object_type        TEXT,
                color              TEXT,
                created_at         TEXT NOT NULL
            );

            CREATE INDEX idx_items_created ON items(created_at);

            CREATE TABLE item_images (
                id              TEXT PRIMARY KEY,
                item_id         TEXT NOT NULL REFERENCES items(id) ON DELETE CASCADE,
                storage_path    TEXT NOT NULL,
                thumbnail_path  TEXT,
                created_at      TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
            );

            CREATE INDEX idx_item_images_item ON item_images(item_id);

            CREATE TABLE messages (
                id             TEXT PRIMARY KEY,
                item_id        TEXT NOT NULL REFERENCES items(id) ON DELETE CASCADE,
                sender_id      TEXT NOT NULL REFERENCES users(id),
                receiver_id    TEXT NOT NULL,
                body           TEXT,
                confirm_role   TEXT CHECK (confirm_role IN ('finder', 'claimant')),
                confirm_kind   TEXT CHECK (confirm_kind IN ('found', 'returned')),
                sender_handle  TEXT,
                read_at        TEXT,
                created_at     TEXT NOT NULL
            );

            CREATE INDEX idx_messages_item ON messages(item_id, created_at);
            CREATE INDEX idx_messages_unread ON messages(receiver_id, read_at);

            INSERT INTO schema_version (version) VALUES (1);
            ",
        )?;
    }

    info!("Database migrations complete (schema v{})", SCHEMA_VERSION);
    Ok(())
}

/// Fail fast if a table or column the queries need is missing.
pub fn verify(conn: &Connection) -> Result<()> {
    for (table, columns) in CONTRACT {
        let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
        let present: Vec<String> = stmt
            .query_map([], |row| row.get::<_, String>(1))?
            .collect::<std::result::Result<_, _>>()?;

        if present.is_empty() {
            return Err(StoreError::Schema(format!("table '{}' is missing", table)));
        }

        let missing: Vec<&str> = columns
            .iter()
            .copied()
            .filter(|c| !present.iter().any(|p| p == c))
            .collect();
        if !missing.is_empty() {
            return Err(StoreError::Schema(format!(
                "table '{}' lacks column(s): {}",
                table,
                missing.join(", ")
            )));
        }
    }
    Ok(())
}
