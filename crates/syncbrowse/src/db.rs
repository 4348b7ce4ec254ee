//! SQLite-backed local index of folders and their entries

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::path::Path;
use std::str::FromStr;
use tracing::debug;

use crate::model::{Entry, EntryKind, Folder, FolderStats};
use crate::source::IndexSource;

#[derive(Clone)]
pub struct IndexStore {
    pool: SqlitePool,
}

fn parse_timestamp(value: Option<String>) -> Option<DateTime<Utc>> {
    value.and_then(|s| {
        DateTime::parse_from_rfc3339(&s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc))
    })
}

fn row_to_entry(row: &SqliteRow) -> Entry {
    let is_dir: bool = row.get("is_dir");
    let size: i64 = row.get("size");
    Entry {
        folder: row.get("folder"),
        path: row.get("path"),
        name: row.get("name"),
        kind: if is_dir {
            EntryKind::Directory
        } else {
            EntryKind::File
        },
        size: size.max(0) as u64,
        modified_at: parse_timestamp(row.get("modified_at")),
    }
}

const ENTRY_COLUMNS: &str = "folder, path, name, is_dir, size, modified_at";

impl IndexStore {
    pub async fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let db_path = db_path.as_ref();

        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", db_path.display()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .context("Failed to connect to database")?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Failed to run migrations")
    }

    pub async fn upsert_folder(&self, folder: &Folder) -> Result<()> {
        sqlx::query(
            "INSERT INTO folders (id, label) VALUES (?, ?)
             ON CONFLICT(id) DO UPDATE SET label = excluded.label",
        )
        .bind(&folder.id)
        .bind(&folder.label)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Drop folders (and their entries) no longer present in `keep`.
    pub async fn remove_folders_except(&self, keep: &[String]) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let existing: Vec<String> = sqlx::query("SELECT id FROM folders")
            .fetch_all(&mut *tx)
            .await?
            .iter()
            .map(|row| row.get("id"))
            .collect();

        let mut removed = 0;
        for id in existing.iter().filter(|id| !keep.contains(id)) {
            sqlx::query("DELETE FROM entries WHERE folder = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
            removed += sqlx::query("DELETE FROM folders WHERE id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?
                .rows_affected();
        }

        tx.commit().await?;
        Ok(removed)
    }

    pub async fn list_folders_with_stats(&self) -> Result<Vec<(Folder, FolderStats)>> {
        let rows = sqlx::query(
            "SELECT f.id, f.label, f.last_update,
                    COALESCE(SUM(CASE WHEN e.is_dir = 0 THEN 1 ELSE 0 END), 0) AS file_count,
                    COALESCE(SUM(CASE WHEN e.is_dir = 1 THEN 1 ELSE 0 END), 0) AS dir_count,
                    COALESCE(SUM(CASE WHEN e.is_dir = 0 THEN e.size ELSE 0 END), 0) AS total_size
             FROM folders f
             LEFT JOIN entries e ON e.folder = f.id
             GROUP BY f.id
             ORDER BY f.label",
        )
        .fetch_all(&self.pool)
        .await?;

        let folders = rows
            .iter()
            .map(|row| {
                let file_count: i64 = row.get("file_count");
                let dir_count: i64 = row.get("dir_count");
                let total_size: i64 = row.get("total_size");
                (
                    Folder {
                        id: row.get("id"),
                        label: row.get("label"),
                    },
                    FolderStats {
                        file_count: file_count.max(0) as u64,
                        dir_count: dir_count.max(0) as u64,
                        size: total_size.max(0) as u64,
                        last_update: parse_timestamp(row.get("last_update")),
                    },
                )
            })
            .collect();

        Ok(folders)
    }

    /// Replace every entry of `folder` in one transaction.
    pub async fn replace_folder_entries(&self, folder: &str, entries: &[Entry]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM entries WHERE folder = ?")
            .bind(folder)
            .execute(&mut *tx)
            .await?;

        for entry in entries {
            sqlx::query(
                "INSERT INTO entries (folder, path, parent_path, name, is_dir, size, modified_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(folder)
            .bind(&entry.path)
            .bind(entry.parent_path())
            .bind(&entry.name)
            .bind(entry.is_directory())
            .bind(entry.size as i64)
            .bind(entry.modified_at.map(|dt| dt.to_rfc3339()))
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        debug!(folder, entries = entries.len(), "replaced folder entries");
        Ok(())
    }

    pub async fn upsert_entry(&self, entry: &Entry) -> Result<()> {
        sqlx::query(
            "INSERT INTO entries (folder, path, parent_path, name, is_dir, size, modified_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(folder, path) DO UPDATE SET
                is_dir = excluded.is_dir,
                size = excluded.size,
                modified_at = excluded.modified_at",
        )
        .bind(&entry.folder)
        .bind(&entry.path)
        .bind(entry.parent_path())
        .bind(&entry.name)
        .bind(entry.is_directory())
        .bind(entry.size as i64)
        .bind(entry.modified_at.map(|dt| dt.to_rfc3339()))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_entries_by_parent(&self, folder: &str, parent_path: &str) -> Result<Vec<Entry>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM entries WHERE folder = ? AND parent_path = ?",
            ENTRY_COLUMNS
        ))
        .bind(folder)
        .bind(parent_path)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(row_to_entry).collect())
    }

    pub async fn get_entry(&self, folder: &str, path: &str) -> Result<Option<Entry>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM entries WHERE folder = ? AND path = ?",
            ENTRY_COLUMNS
        ))
        .bind(folder)
        .bind(path)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(row_to_entry))
    }

    pub async fn set_last_update(&self, folder: &str, at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE folders SET last_update = ? WHERE id = ?")
            .bind(at.to_rfc3339())
            .bind(folder)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Forget every folder and entry.
    pub async fn clear(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM entries").execute(&mut *tx).await?;
        sqlx::query("DELETE FROM folders").execute(&mut *tx).await?;
        tx.commit().await?;
        Ok(())
    }
}

impl IndexSource for IndexStore {
    async fn children(&self, folder: &str, path: &str) -> Result<Vec<Entry>> {
        self.get_entries_by_parent(folder, path)
            .await
            .with_context(|| format!("reading '{}' of folder {}", path, folder))
    }

    async fn entry(&self, folder: &str, path: &str) -> Result<Option<Entry>> {
        self.get_entry(folder, path).await
    }
}
