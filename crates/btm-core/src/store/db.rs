//! SQLite-backed document store implementation.

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Row, Sqlite};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use super::{collection, StoreMigrator, SCHEMA_VERSION};

/// Handle to the store. Cheap to clone; all clones share one pool.
///
/// The default database file lives under the XDG state directory:
/// `~/.local/state/btm/store.db`.
#[derive(Clone)]
pub struct DurableStore {
    pool: Pool<Sqlite>,
}

impl DurableStore {
    /// Open (or create) the store at the default location. The caller is
    /// expected to follow up with [`migrate_if_needed`](Self::migrate_if_needed)
    /// before reading documents.
    pub async fn open_default() -> Result<Self> {
        let xdg_dirs = xdg::BaseDirectories::with_prefix("btm")?;
        let state_dir = xdg_dirs.get_state_home();
        tokio::fs::create_dir_all(&state_dir).await?;
        Self::open_at(&state_dir.join("store.db")).await
    }

    /// Open (or create) a store at an explicit path and create the schema.
    pub async fn open_at(db_path: &Path) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await
            .with_context(|| format!("open store at {}", db_path.display()))?;

        let store = DurableStore { pool };
        store.create_schema().await?;
        Ok(store)
    }

    async fn create_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS documents (
                collection TEXT NOT NULL,
                id TEXT NOT NULL,
                doc TEXT NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (collection, id)
            );
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Atomically replace the document at `(collection, id)`. A partial write
    /// is never observable; failures surface to the caller.
    pub async fn store<T: Serialize>(&self, collection: &str, id: &str, document: &T) -> Result<()> {
        let doc = serde_json::to_string(document).context("encode document")?;
        sqlx::query(
            r#"
            INSERT INTO documents (collection, id, doc, updated_at)
            VALUES (?1, ?2, ?3, unixepoch())
            ON CONFLICT (collection, id) DO UPDATE SET
                doc = excluded.doc,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(collection)
        .bind(id)
        .bind(doc)
        .execute(&self.pool)
        .await
        .with_context(|| format!("store {}/{}", collection, id))?;
        Ok(())
    }

    /// Fetch one document, or `None` if absent. A document that no longer
    /// decodes is logged and reported as missing.
    pub async fn retrieve<T: DeserializeOwned>(
        &self,
        collection: &str,
        id: &str,
    ) -> Result<Option<T>> {
        let row = sqlx::query("SELECT doc FROM documents WHERE collection = ?1 AND id = ?2")
            .bind(collection)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("retrieve {}/{}", collection, id))?;
        let Some(row) = row else {
            return Ok(None);
        };
        let doc: String = row.get("doc");
        match serde_json::from_str(&doc) {
            Ok(v) => Ok(Some(v)),
            Err(e) => {
                tracing::warn!(collection, id, error = %e, "corrupt document treated as missing");
                Ok(None)
            }
        }
    }

    /// Fetch every document in a collection as an `id -> value` map, skipping
    /// documents that no longer decode.
    pub async fn retrieve_all<T: DeserializeOwned>(
        &self,
        collection: &str,
    ) -> Result<HashMap<String, T>> {
        let rows = sqlx::query("SELECT id, doc FROM documents WHERE collection = ?1 ORDER BY id")
            .bind(collection)
            .fetch_all(&self.pool)
            .await
            .with_context(|| format!("retrieve all {}", collection))?;

        let mut out = HashMap::with_capacity(rows.len());
        for row in rows {
            let id: String = row.get("id");
            let doc: String = row.get("doc");
            match serde_json::from_str(&doc) {
                Ok(v) => {
                    out.insert(id, v);
                }
                Err(e) => {
                    tracing::warn!(collection, id, error = %e, "skipping corrupt document");
                }
            }
        }
        Ok(out)
    }

    /// Delete one document, or the entire collection when `id` is `None`.
    pub async fn delete(&self, collection: &str, id: Option<&str>) -> Result<()> {
        match id {
            Some(id) => {
                sqlx::query("DELETE FROM documents WHERE collection = ?1 AND id = ?2")
                    .bind(collection)
                    .bind(id)
                    .execute(&self.pool)
                    .await
                    .with_context(|| format!("delete {}/{}", collection, id))?;
            }
            None => {
                sqlx::query("DELETE FROM documents WHERE collection = ?1")
                    .bind(collection)
                    .execute(&self.pool)
                    .await
                    .with_context(|| format!("delete collection {}", collection))?;
            }
        }
        Ok(())
    }

    /// Check `metadata.version` against the compiled schema version and run
    /// the registered migrator once on mismatch. The migrator to use is named
    /// in `metadata.migrator` (default `"rebuild"`); an unknown name fails.
    pub async fn migrate_if_needed(
        &self,
        migrators: &HashMap<String, Arc<dyn StoreMigrator>>,
    ) -> Result<()> {
        let stored: Option<u32> = self.retrieve(collection::METADATA, "version").await?;
        match stored {
            None => {
                self.store(collection::METADATA, "version", &SCHEMA_VERSION)
                    .await?;
                return Ok(());
            }
            Some(v) if v == SCHEMA_VERSION => return Ok(()),
            Some(v) => {
                let name: String = self
                    .retrieve(collection::METADATA, "migrator")
                    .await?
                    .unwrap_or_else(|| "rebuild".to_string());
                let migrator = migrators
                    .get(&name)
                    .with_context(|| format!("no migrator registered under {:?}", name))?;
                tracing::info!(from = v, to = SCHEMA_VERSION, migrator = %name, "migrating store");
                self.run_migration(migrator.as_ref()).await?;
                self.store(collection::METADATA, "version", &SCHEMA_VERSION)
                    .await?;
            }
        }
        Ok(())
    }

    async fn run_migration(&self, migrator: &dyn StoreMigrator) -> Result<()> {
        let rows = sqlx::query("SELECT collection, id, doc FROM documents")
            .fetch_all(&self.pool)
            .await?;
        for row in rows {
            let coll: String = row.get("collection");
            let id: String = row.get("id");
            let doc: String = row.get("doc");
            let value: serde_json::Value = match serde_json::from_str(&doc) {
                Ok(v) => v,
                Err(_) => {
                    self.delete(&coll, Some(&id)).await?;
                    continue;
                }
            };
            match migrator.migrate(&coll, &id, value) {
                Some(rewritten) => self.store(&coll, &id, &rewritten).await?,
                None => self.delete(&coll, Some(&id)).await?,
            }
        }
        Ok(())
    }
}
