use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension};
use tracing::{debug, warn};
use uuid::Uuid;

use macfind_types::handshake::Confirmations;
use macfind_types::models::{Item, ItemFilters, ItemImage, ItemMetadata, ItemStatus, UserProfile};
use macfind_types::tags::handle_from_email;

use crate::Database;
use crate::error::{Result, StoreError, is_foreign_key_violation};
use crate::messages::thread_between;
use crate::models::{ITEM_COLUMNS, ImageRow, ItemRow, UserRow, fmt_ts, parse_uuid};

/// Fields for a user-posted found item.
#[derive(Debug, Clone, Default)]
pub struct NewItem {
    pub title: Option<String>,
    pub vague_description: Option<String>,
    pub category: Option<String>,
    pub location_hint: Option<String>,
    pub metadata: ItemMetadata,
    pub ai_confidence: Option<f64>,
    pub poster_id: Option<Uuid>,
    pub object_type: Option<String>,
    pub color: Option<String>,
}

impl Database {
    // -- Identities & login tokens --

    /// Stable user id for an email, created on first sign-in.
    pub fn upsert_identity(&self, email: &str) -> Result<Uuid> {
        self.with_conn_mut(|conn| {
            let existing: Option<String> = conn
                .query_row("SELECT id FROM identities WHERE email = ?1", [email], |row| row.get(0))
                .optional()?;
            if let Some(id) = existing {
                return parse_uuid(&id, "identities.id");
            }

            let id = Uuid::new_v4();
            conn.execute(
                "INSERT INTO identities (id, email) VALUES (?1, ?2)",
                (id.to_string(), email),
            )?;
            debug!("New identity {} for {}", id, email);
            Ok(id)
        })
    }

    pub fn create_login_token(&self, token: &str, email: &str, expires_at: DateTime<Utc>) -> Result<()> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT INTO login_tokens (token, email, expires_at) VALUES (?1, ?2, ?3)",
                (token, email, fmt_ts(expires_at)),
            )?;
            Ok(())
        })
    }

    /// Burn a one-time token. Returns the email it was issued for, or `None`
    /// if the token is unknown, expired, or already used.
    pub fn consume_login_token(&self, token: &str, now: DateTime<Utc>) -> Result<Option<String>> {
        self.with_conn_mut(|conn| {
            let now = fmt_ts(now);
            let changed = conn.execute(
                "UPDATE login_tokens SET used_at = ?1
                 WHERE token = ?2 AND used_at IS NULL AND expires_at > ?1",
                (&now, token),
            )?;
            if changed == 0 {
                return Ok(None);
            }
            let email = conn.query_row(
                "SELECT email FROM login_tokens WHERE token = ?1",
                [token],
                |row| row.get(0),
            )?;
            Ok(Some(email))
        })
    }

    // -- Users --

    /// Create the profile row if it is absent. Returns true if a row was inserted.
    pub fn ensure_user(&self, id: Uuid, email: &str, display_name: Option<&str>) -> Result<bool> {
        self.with_conn_mut(|conn| ensure_user_row(conn, id, email, display_name))
    }

    pub fn get_user(&self, id: Uuid) -> Result<Option<UserProfile>> {
        let row = self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, email, display_name FROM users WHERE id = ?1",
                [id.to_string()],
                |row| {
                    Ok(UserRow {
                        id: row.get(0)?,
                        email: row.get(1)?,
                        display_name: row.get(2)?,
                    })
                },
            )
            .optional()
            .map_err(StoreError::from)
        })?;
        row.map(UserProfile::try_from).transpose()
    }

    // -- Items --

    /// Insert a found item. A poster without a profile row surfaces as
    /// `StoreError::MissingUser` so the caller can create it and retry.
    pub fn insert_item(&self, new: &NewItem) -> Result<Item> {
        let id = Uuid::new_v4();
        let now = Utc::now();

        self.with_conn_mut(|conn| {
            let result = conn.execute(
                "INSERT INTO items (id, title, vague_description, status, category, location_hint,
                                    metadata, ai_confidence, poster_id, object_type, color, created_at)
                 VALUES (?1, ?2, ?3, 'found', ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                rusqlite::params![
                    id.to_string(),
                    new.title,
                    new.vague_description,
                    new.category,
                    new.location_hint,
                    new.metadata.to_value().to_string(),
                    new.ai_confidence,
                    new.poster_id.map(|p| p.to_string()),
                    new.object_type,
                    new.color,
                    fmt_ts(now),
                ],
            );

            match result {
                Ok(_) => {}
                Err(e) if is_foreign_key_violation(&e) => {
                    return Err(match new.poster_id {
                        Some(poster) => StoreError::MissingUser(poster),
                        None => StoreError::Sqlite(e),
                    });
                }
                Err(e) => return Err(e.into()),
            }

            query_item(conn, id)?.ok_or(StoreError::NotFound("item"))
        })
    }

    pub fn insert_item_image(&self, item_id: Uuid, storage_path: &str, thumbnail_path: Option<&str>) -> Result<ItemImage> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT INTO item_images (id, item_id, storage_path, thumbnail_path) VALUES (?1, ?2, ?3, ?4)",
                (Uuid::new_v4().to_string(), item_id.to_string(), storage_path, thumbnail_path),
            )?;
            Ok(ItemImage {
                path: storage_path.to_string(),
                thumbnail_path: thumbnail_path.map(str::to_string),
                url: None,
            })
        })
    }

    pub fn get_item(&self, id: Uuid) -> Result<Option<Item>> {
        self.with_conn(|conn| {
            let Some(mut item) = query_item(conn, id)? else {
                return Ok(None);
            };
            let mut images = query_images(conn, &[id])?;
            item.images = images.remove(&id).unwrap_or_default();
            Ok(Some(item))
        })
    }

    /// Newest first. Status, location and time range are pushed into SQL; tag and
    /// free-text search run on the narrowed metadata afterwards.
    pub fn list_items(&self, filters: &ItemFilters, now: DateTime<Utc>) -> Result<Vec<Item>> {
        self.with_conn(|conn| {
            let mut sql = format!("SELECT {} FROM items WHERE 1 = 1", ITEM_COLUMNS);
            let mut params: Vec<String> = Vec::new();

            if let Some(status) = filters.status {
                params.push(status.as_str().to_string());
                sql.push_str(&format!(" AND status = ?{}", params.len()));
            }
            if let Some(location) = filters.location.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
                params.push(format!("%{}%", escape_like(&location.to_lowercase())));
                sql.push_str(&format!(
                    " AND lower(coalesce(location_hint, '')) LIKE ?{} ESCAPE '\\'",
                    params.len()
                ));
            }
            if let Some(since) = filters.time_range.and_then(|r| r.lower_bound(now)) {
                params.push(fmt_ts(since));
                sql.push_str(&format!(" AND created_at >= ?{}", params.len()));
            }
            sql.push_str(" ORDER BY created_at DESC");

            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(rusqlite::params_from_iter(params.iter()), ItemRow::from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            let mut items = Vec::with_capacity(rows.len());
            for row in rows {
                match Item::try_from(row) {
                    Ok(item) if filters.matches(&item) => items.push(item),
                    Ok(_) => {}
                    Err(e) => warn!("Skipping item: {}", e),
                }
            }

            // Attach images by id, without relying on a join.
            let ids: Vec<Uuid> = items.iter().map(|i| i.id).collect();
            let mut images = query_images(conn, &ids)?;
            for item in &mut items {
                item.images = images.remove(&item.id).unwrap_or_default();
            }
            Ok(items)
        })
    }

    /// Move an item's status. Allowed for the poster, and for a claimant
    /// whose thread with the poster has a completed handshake. Leaving
    /// `claimed` is rejected.
    pub fn set_item_status(&self, item_id: Uuid, actor: Uuid, status: ItemStatus) -> Result<ItemStatus> {
        self.with_conn_mut(|conn| {
            let item = query_item(conn, item_id)?.ok_or(StoreError::NotFound("item"))?;

            let allowed = match item.owner_id {
                Some(poster) if poster == actor => true,
                Some(poster) => handshake_closed(conn, item_id, poster, actor)?,
                None => false,
            };
            if !allowed {
                return Err(StoreError::PolicyDenied(format!(
                    "user {} may not change status of item {}",
                    actor, item_id
                )));
            }

            let next = item.status.transition(status)?;
            if next != item.status {
                conn.execute(
                    "UPDATE items SET status = ?1 WHERE id = ?2 AND status != 'claimed'",
                    (next.as_str(), item_id.to_string()),
                )?;
            }
            Ok(next)
        })
    }

    /// Delete an item and, through the cascade, its images and messages.
    /// Returns the storage paths of the removed images.
    pub fn delete_item(&self, item_id: Uuid, actor: Uuid) -> Result<Vec<String>> {
        self.with_conn_mut(|conn| {
            let item = query_item(conn, item_id)?.ok_or(StoreError::NotFound("item"))?;
            if item.owner_id != Some(actor) {
                return Err(StoreError::PolicyDenied(format!(
                    "user {} does not own item {}",
                    actor, item_id
                )));
            }

            let paths = query_images(conn, &[item_id])?
                .remove(&item_id)
                .unwrap_or_default()
                .into_iter()
                .map(|img| img.path)
                .collect();

            conn.execute("DELETE FROM items WHERE id = ?1", [item_id.to_string()])?;
            Ok(paths)
        })
    }
}

pub(crate) fn ensure_user_row(
    conn: &Connection,
    id: Uuid,
    email: &str,
    display_name: Option<&str>,
) -> Result<bool> {
    let display_name = display_name
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| handle_from_email(email));

    let inserted = conn.execute(
        "INSERT INTO users (id, email, display_name) VALUES (?1, ?2, ?3)
         ON CONFLICT DO NOTHING",
        (id.to_string(), email, display_name),
    )?;
    if inserted > 0 {
        debug!("Created profile row for {} ({})", id, email);
    }
    Ok(inserted > 0)
}

pub(crate) fn query_item(conn: &Connection, id: Uuid) -> Result<Option<Item>> {
    let row = conn
        .query_row(
            &format!("SELECT {} FROM items WHERE id = ?1", ITEM_COLUMNS),
            [id.to_string()],
            ItemRow::from_row,
        )
        .optional()?;
    row.map(Item::try_from).transpose()
}

/// Whether `claimant` and `poster` have both confirmed on their thread.
fn handshake_closed(conn: &Connection, item_id: Uuid, poster: Uuid, claimant: Uuid) -> Result<bool> {
    let history = thread_between(conn, item_id, claimant, poster)?;
    Ok(Confirmations::from_history(&history).is_closed(poster, claimant, poster))
}

/// Batch-fetch images for a set of item ids, grouped by item.
fn query_images(conn: &Connection, item_ids: &[Uuid]) -> Result<HashMap<Uuid, Vec<ItemImage>>> {
    let mut grouped: HashMap<Uuid, Vec<ItemImage>> = HashMap::new();
    if item_ids.is_empty() {
        return Ok(grouped);
    }

    let placeholders: Vec<String> = (1..=item_ids.len()).map(|i| format!("?{}", i)).collect();
    let sql = format!(
        "SELECT item_id, storage_path, thumbnail_path FROM item_images
         WHERE item_id IN ({}) ORDER BY created_at",
        placeholders.join(", ")
    );

    let ids: Vec<String> = item_ids.iter().map(Uuid::to_string).collect();
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(rusqlite::params_from_iter(ids.iter()), |row| {
            Ok(ImageRow {
                item_id: row.get(0)?,
                storage_path: row.get(1)?,
                thumbnail_path: row.get(2)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    for row in rows {
        let Ok(item_id) = row.item_id.parse::<Uuid>() else {
            warn!("Corrupt item_id '{}' on item image", row.item_id);
            continue;
        };
        if let Some(image) = row.into_image() {
            grouped.entry(item_id).or_default().push(image);
        }
    }
    Ok(grouped)
}

fn escape_like(s: &str) -> String {
    s.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
}
