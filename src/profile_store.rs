use async_trait::async_trait;
use serde_json::{Map, Value};
use sqlx::{postgres::PgPoolOptions, postgres::PgRow, PgPool, Row};
use tokio::sync::Mutex;

use crate::{
    error::StoreError,
    types::{now_iso, ProfileItem},
};

/// Structured profile facts, at most one row per `(user_id, item_type, value)`.
#[async_trait]
pub trait ProfileStore: Send + Sync {
    /// Inserts the item or, when the triple already exists, replaces its
    /// `metadata`, `confirmed` and `updated_at` in place.
    async fn upsert(
        &self,
        user_id: &str,
        item_type: &str,
        value: &str,
        metadata: &Map<String, Value>,
        confirmed: bool,
    ) -> Result<ProfileItem, StoreError>;

    /// Newest first.
    async fn list(&self, user_id: &str) -> Result<Vec<ProfileItem>, StoreError>;

    /// Deletes only when `item_id` belongs to `user_id`. Returns whether a
    /// row was removed; callers must not leak that to clients.
    async fn delete(&self, user_id: &str, item_id: i64) -> Result<bool, StoreError>;
}

pub struct PgProfileStore {
    pool: PgPool,
}

impl PgProfileStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }
}

fn json_text(value: &Map<String, Value>) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string())
}

fn parse_metadata(value: &str) -> Map<String, Value> {
    serde_json::from_str::<Map<String, Value>>(value).unwrap_or_default()
}

fn row_to_item(row: &PgRow) -> ProfileItem {
    ProfileItem {
        id: row.get("id"),
        user_id: row.get("user_id"),
        item_type: row.get("item_type"),
        value: row.get("value"),
        metadata: parse_metadata(&row.get::<String, _>("metadata")),
        confirmed: row.get("confirmed"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

#[async_trait]
impl ProfileStore for PgProfileStore {
    async fn upsert(
        &self,
        user_id: &str,
        item_type: &str,
        value: &str,
        metadata: &Map<String, Value>,
        confirmed: bool,
    ) -> Result<ProfileItem, StoreError> {
        let now = now_iso();
        let row = sqlx::query(
            r#"
            INSERT INTO profile_items (user_id, item_type, value, metadata, confirmed, created_at, updated_at)
            VALUES ($1,$2,$3,$4,$5,$6,$7)
            ON CONFLICT (user_id, item_type, value) DO UPDATE SET
                metadata = EXCLUDED.metadata,
                confirmed = EXCLUDED.confirmed,
                updated_at = EXCLUDED.updated_at
            RETURNING id, user_id, item_type, value, metadata, confirmed, created_at, updated_at
            "#,
        )
        .bind(user_id)
        .bind(item_type)
        .bind(value)
        .bind(json_text(metadata))
        .bind(confirmed)
        .bind(&now)
        .bind(&now)
        .fetch_one(&self.pool)
        .await?;

        Ok(row_to_item(&row))
    }

    async fn list(&self, user_id: &str) -> Result<Vec<ProfileItem>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, user_id, item_type, value, metadata, confirmed, created_at, updated_at
             FROM profile_items WHERE user_id = $1 ORDER BY created_at DESC, id DESC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(row_to_item).collect())
    }

    async fn delete(&self, user_id: &str, item_id: i64) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM profile_items WHERE id = $1 AND user_id = $2")
            .bind(item_id)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

/// In-process store for development without Postgres and for tests. The
/// mutex is the serialization point that the unique index is in Postgres.
#[derive(Default)]
pub struct MemoryProfileStore {
    inner: Mutex<MemoryRows>,
}

#[derive(Default)]
struct MemoryRows {
    next_id: i64,
    items: Vec<ProfileItem>,
}

impl MemoryProfileStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProfileStore for MemoryProfileStore {
    async fn upsert(
        &self,
        user_id: &str,
        item_type: &str,
        value: &str,
        metadata: &Map<String, Value>,
        confirmed: bool,
    ) -> Result<ProfileItem, StoreError> {
        let now = now_iso();
        let mut rows = self.inner.lock().await;

        if let Some(existing) = rows.items.iter_mut().find(|item| {
            item.user_id == user_id && item.item_type == item_type && item.value == value
        }) {
            existing.metadata = metadata.clone();
            existing.confirmed = confirmed;
            existing.updated_at = now;
            return Ok(existing.clone());
        }

        rows.next_id += 1;
        let item = ProfileItem {
            id: rows.next_id,
            user_id: user_id.to_string(),
            item_type: item_type.to_string(),
            value: value.to_string(),
            metadata: metadata.clone(),
            confirmed,
            created_at: now.clone(),
            updated_at: now,
        };
        rows.items.push(item.clone());
        Ok(item)
    }

    async fn list(&self, user_id: &str) -> Result<Vec<ProfileItem>, StoreError> {
        let rows = self.inner.lock().await;
        let mut items = rows
            .items
            .iter()
            .filter(|item| item.user_id == user_id)
            .cloned()
            .collect::<Vec<_>>();
        items.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.id.cmp(&a.id))
        });
        Ok(items)
    }

    async fn delete(&self, user_id: &str, item_id: i64) -> Result<bool, StoreError> {
        let mut rows = self.inner.lock().await;
        let before = rows.items.len();
        rows.items
            .retain(|item| !(item.id == item_id && item.user_id == user_id));
        Ok(rows.items.len() != before)
    }
}
