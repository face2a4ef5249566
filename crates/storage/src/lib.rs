use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Row, Sqlite,
};
use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    str::FromStr,
    sync::Mutex,
};

/// Per-field string storage that survives process restarts.
///
/// Fields are logical names (`timeFrom`, `orderBy`, ...). `set_items` writes a
/// batch as one unit, and a `None` value in a batch removes that field.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get_item(&self, field: &str) -> Result<Option<String>>;
    async fn set_item(&self, field: &str, value: &str) -> Result<()>;
    async fn set_items(&self, items: &[(&str, Option<String>)]) -> Result<()>;
    async fn remove_item(&self, field: &str) -> Result<()>;
}

/// SQLite-backed store. Several scopes (one per view) can share one database.
#[derive(Clone)]
pub struct SqliteKeyValueStore {
    pool: Pool<Sqlite>,
    scope: String,
}

impl SqliteKeyValueStore {
    pub async fn new(database_url: &str, scope: impl Into<String>) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)
            .with_context(|| format!("invalid sqlite url '{database_url}'"))?
            .create_if_missing(true);
        // Every connection to an in-memory database is a separate database.
        let max_connections = if database_url.contains(":memory:") {
            1
        } else {
            5
        };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(connect_options)
            .await
            .with_context(|| format!("failed to open key-value store at '{database_url}'"))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS kv_items (
                scope      TEXT NOT NULL,
                field      TEXT NOT NULL,
                value      TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                PRIMARY KEY (scope, field)
            )
            "#,
        )
        .execute(&pool)
        .await
        .context("failed to ensure kv_items table exists")?;

        Ok(Self {
            pool,
            scope: scope.into(),
        })
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }
}

const UPSERT_ITEM: &str = "INSERT INTO kv_items (scope, field, value, updated_at) VALUES (?, ?, ?, CURRENT_TIMESTAMP)
     ON CONFLICT(scope, field) DO UPDATE SET value = excluded.value, updated_at = CURRENT_TIMESTAMP";
const DELETE_ITEM: &str = "DELETE FROM kv_items WHERE scope = ? AND field = ?";

#[async_trait]
impl KeyValueStore for SqliteKeyValueStore {
    async fn get_item(&self, field: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT value FROM kv_items WHERE scope = ? AND field = ?")
            .bind(&self.scope)
            .bind(field)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("failed to read '{field}'"))?;
        Ok(row.map(|r| r.get::<String, _>(0)))
    }

    async fn set_item(&self, field: &str, value: &str) -> Result<()> {
        sqlx::query(UPSERT_ITEM)
            .bind(&self.scope)
            .bind(field)
            .bind(value)
            .execute(&self.pool)
            .await
            .with_context(|| format!("failed to write '{field}'"))?;
        Ok(())
    }

    async fn set_items(&self, items: &[(&str, Option<String>)]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        for (field, value) in items {
            match value {
                Some(value) => {
                    sqlx::query(UPSERT_ITEM)
                        .bind(&self.scope)
                        .bind(*field)
                        .bind(value)
                        .execute(&mut *tx)
                        .await
                        .with_context(|| format!("failed to write '{field}'"))?;
                }
                None => {
                    sqlx::query(DELETE_ITEM)
                        .bind(&self.scope)
                        .bind(*field)
                        .execute(&mut *tx)
                        .await
                        .with_context(|| format!("failed to remove '{field}'"))?;
                }
            }
        }

        tx.commit().await?;
        Ok(())
    }

    async fn remove_item(&self, field: &str) -> Result<()> {
        sqlx::query(DELETE_ITEM)
            .bind(&self.scope)
            .bind(field)
            .execute(&self.pool)
            .await
            .with_context(|| format!("failed to remove '{field}'"))?;
        Ok(())
    }
}

/// In-process store for tests and sessions that should not outlive the process.
#[derive(Default)]
pub struct MemoryKeyValueStore {
    items: Mutex<HashMap<String, String>>,
}

impl MemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> HashMap<String, String> {
        self.lock().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        // A poisoned map is still a valid map.
        self.items
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl KeyValueStore for MemoryKeyValueStore {
    async fn get_item(&self, field: &str) -> Result<Option<String>> {
        Ok(self.lock().get(field).cloned())
    }

    async fn set_item(&self, field: &str, value: &str) -> Result<()> {
        self.lock().insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn set_items(&self, items: &[(&str, Option<String>)]) -> Result<()> {
        let mut guard = self.lock();
        for (field, value) in items {
            match value {
                Some(value) => {
                    guard.insert(field.to_string(), value.clone());
                }
                None => {
                    guard.remove(*field);
                }
            }
        }
        Ok(())
    }

    async fn remove_item(&self, field: &str) -> Result<()> {
        self.lock().remove(field);
        Ok(())
    }
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url.contains(":memory:") || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

/// `sqlite://` url for a database file, with platform separators normalised.
pub fn sqlite_url_for_path(path: &Path) -> String {
    format!("sqlite://{}", path.to_string_lossy().replace('\\', "/"))
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
