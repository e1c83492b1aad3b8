use std::collections::BTreeSet;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension};
use tracing::{debug, info};

use crate::store::error::StoreError;
use crate::store::{
    ImageSnapshot, JobExecution, MonitoredTag, RecordStore, StoreStats, TagUpdate, TrackedImage,
};

/// Schema migrations
/// Each version contains a list of SQL statements to execute
const MIGRATIONS: &[&[&str]] = &[
    // v1: indexes used by the retention sweeper
    &[
        "CREATE INDEX IF NOT EXISTS idx_tag_updates_scraped_at ON tag_updates(scraped_at)",
        "CREATE INDEX IF NOT EXISTS idx_monitored_tags_last_viewed ON monitored_tags(last_viewed)",
    ],
];

type MonitoredTagRow = (i64, String, String, String, i64, i64);
type TagUpdateRow = (i64, i64, i64, String);

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn new(db_path: &Path) -> Result<Self, StoreError> {
        info!("Initializing database at {:?}", db_path);

        let conn = Connection::open(db_path)?;

        // Enable WAL mode for better concurrency
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;

        debug!("Database connection established");

        let store = Self {
            conn: Mutex::new(conn),
        };

        store.create_schema()?;
        info!("Database initialized successfully");

        Ok(store)
    }

    /// Acquire database connection lock with proper error handling
    fn lock_conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::LockPoisoned)
    }

    fn create_schema(&self) -> Result<(), StoreError> {
        debug!("Creating database schema");

        let conn = self.lock_conn()?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS monitored_tags (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                endpoint TEXT NOT NULL,
                image TEXT NOT NULL,
                tag TEXT NOT NULL,
                added_at INTEGER NOT NULL,
                last_viewed INTEGER NOT NULL,
                UNIQUE(endpoint, image, tag)
            )
            "#,
            [],
        )?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS tag_updates (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                monitored_tag_id INTEGER NOT NULL,
                scraped_at INTEGER NOT NULL,
                digest TEXT NOT NULL,
                FOREIGN KEY (monitored_tag_id) REFERENCES monitored_tags(id) ON DELETE CASCADE
            )
            "#,
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_tag_updates_monitored_tag_id ON tag_updates(monitored_tag_id)",
            [],
        )?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS image_snapshots (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                endpoint TEXT NOT NULL,
                image TEXT NOT NULL,
                known_tags TEXT NOT NULL,
                UNIQUE(endpoint, image)
            )
            "#,
            [],
        )?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS job_executions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                started INTEGER NOT NULL,
                completed INTEGER NOT NULL,
                successful_queries INTEGER NOT NULL,
                failed_queries INTEGER NOT NULL
            )
            "#,
            [],
        )?;

        Self::apply_migrations(&conn)?;

        debug!("Database schema created successfully");
        Ok(())
    }

    /// Apply pending migrations based on user_version pragma
    fn apply_migrations(conn: &Connection) -> Result<(), StoreError> {
        let current_version: i32 =
            conn.pragma_query_value(None, "user_version", |row| row.get(0))?;

        for (i, statements) in MIGRATIONS.iter().enumerate() {
            let version = (i + 1) as i32;
            if version > current_version {
                for sql in *statements {
                    conn.execute(sql, [])?;
                }
                debug!("Applied migration v{}", version);
            }
        }

        let target_version = MIGRATIONS.len() as i32;
        if target_version > current_version {
            conn.pragma_update(None, "user_version", target_version)?;
            debug!("Updated schema version to v{}", target_version);
        }

        Ok(())
    }

    fn to_datetime(millis: i64) -> Result<DateTime<Utc>, StoreError> {
        DateTime::from_timestamp_millis(millis).ok_or(StoreError::InvalidTimestamp(millis))
    }

    fn to_monitored_tag(row: MonitoredTagRow) -> Result<MonitoredTag, StoreError> {
        let (id, endpoint, image, tag, added_at, last_viewed) = row;
        Ok(MonitoredTag {
            id,
            endpoint,
            image,
            tag,
            added_at: Self::to_datetime(added_at)?,
            last_viewed: Self::to_datetime(last_viewed)?,
        })
    }

    fn to_tag_update(row: TagUpdateRow) -> Result<TagUpdate, StoreError> {
        let (id, monitored_tag_id, scraped_at, digest) = row;
        Ok(TagUpdate {
            id,
            monitored_tag_id,
            scraped_at: Self::to_datetime(scraped_at)?,
            digest,
        })
    }

    /// Records that a monitored tag was looked at by a user
    pub fn set_last_viewed(&self, id: i64, at: DateTime<Utc>) -> Result<(), StoreError> {
        let conn = self.lock_conn()?;
        conn.execute(
            "UPDATE monitored_tags SET last_viewed = ?1 WHERE id = ?2",
            (at.timestamp_millis(), id),
        )?;
        Ok(())
    }

    /// Returns the snapshot of an image without creating it
    pub fn snapshot(&self, endpoint: &str, image: &str) -> Result<Option<ImageSnapshot>, StoreError> {
        let conn = self.lock_conn()?;
        let known_tags: Option<String> = conn
            .query_row(
                "SELECT known_tags FROM image_snapshots WHERE endpoint = ?1 AND image = ?2",
                (endpoint, image),
                |row| row.get(0),
            )
            .optional()?;

        known_tags
            .map(|json| {
                Ok(ImageSnapshot {
                    endpoint: endpoint.to_string(),
                    image: image.to_string(),
                    known_tags: serde_json::from_str(&json)?,
                })
            })
            .transpose()
    }
}

impl RecordStore for SqliteStore {
    fn add_monitored_tag(
        &self,
        endpoint: &str,
        image: &str,
        tag: &str,
    ) -> Result<bool, StoreError> {
        let now = Utc::now().timestamp_millis();
        let conn = self.lock_conn()?;

        // INSERT OR IGNORE with UNIQUE(endpoint, image, tag) keeps the triple unique
        let rows_inserted = conn.execute(
            r#"
            INSERT OR IGNORE INTO monitored_tags (endpoint, image, tag, added_at, last_viewed)
            VALUES (?1, ?2, ?3, ?4, ?4)
            "#,
            (endpoint, image, tag, now),
        )?;

        Ok(rows_inserted > 0)
    }

    fn monitored_tags(&self) -> Result<Vec<MonitoredTag>, StoreError> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, endpoint, image, tag, added_at, last_viewed FROM monitored_tags ORDER BY id",
        )?;

        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                ))
            })?
            .collect::<Result<Vec<MonitoredTagRow>, _>>()?;

        rows.into_iter().map(Self::to_monitored_tag).collect()
    }

    fn find_monitored_tag(
        &self,
        endpoint: &str,
        image: &str,
        tag: &str,
    ) -> Result<Option<MonitoredTag>, StoreError> {
        let conn = self.lock_conn()?;
        let row: Option<MonitoredTagRow> = conn
            .query_row(
                r#"
                SELECT id, endpoint, image, tag, added_at, last_viewed FROM monitored_tags
                WHERE endpoint = ?1 AND image = ?2 AND tag = ?3
                "#,
                (endpoint, image, tag),
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                    ))
                },
            )
            .optional()?;

        row.map(Self::to_monitored_tag).transpose()
    }

    fn monitored_tag_exists(
        &self,
        endpoint: &str,
        image: &str,
        tag: &str,
    ) -> Result<bool, StoreError> {
        let conn = self.lock_conn()?;
        let exists: bool = conn.query_row(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM monitored_tags
                WHERE endpoint = ?1 AND image = ?2 AND tag = ?3
            )
            "#,
            (endpoint, image, tag),
            |row| row.get(0),
        )?;

        Ok(exists)
    }

    fn delete_monitored_tag(&self, id: i64) -> Result<(), StoreError> {
        let conn = self.lock_conn()?;
        conn.execute("DELETE FROM monitored_tags WHERE id = ?1", [id])?;
        Ok(())
    }

    fn tracked_images(&self) -> Result<Vec<TrackedImage>, StoreError> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT DISTINCT endpoint, image FROM monitored_tags ORDER BY endpoint, image",
        )?;

        let images = stmt
            .query_map([], |row| {
                Ok(TrackedImage {
                    endpoint: row.get(0)?,
                    image: row.get(1)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(images)
    }

    fn latest_update(&self, monitored_tag_id: i64) -> Result<Option<TagUpdate>, StoreError> {
        let conn = self.lock_conn()?;
        let row: Option<TagUpdateRow> = conn
            .query_row(
                r#"
                SELECT id, monitored_tag_id, scraped_at, digest FROM tag_updates
                WHERE monitored_tag_id = ?1
                ORDER BY scraped_at DESC, id DESC
                LIMIT 1
                "#,
                [monitored_tag_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()?;

        row.map(Self::to_tag_update).transpose()
    }

    fn insert_update(
        &self,
        monitored_tag_id: i64,
        digest: &str,
        scraped_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO tag_updates (monitored_tag_id, scraped_at, digest) VALUES (?1, ?2, ?3)",
            (monitored_tag_id, scraped_at.timestamp_millis(), digest),
        )?;
        Ok(())
    }

    fn updates(&self, monitored_tag_id: i64) -> Result<Vec<TagUpdate>, StoreError> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT id, monitored_tag_id, scraped_at, digest FROM tag_updates
            WHERE monitored_tag_id = ?1
            ORDER BY scraped_at, id
            "#,
        )?;

        let rows = stmt
            .query_map([monitored_tag_id], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
            })?
            .collect::<Result<Vec<TagUpdateRow>, _>>()?;

        rows.into_iter().map(Self::to_tag_update).collect()
    }

    fn delete_updates_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let conn = self.lock_conn()?;
        let deleted = conn.execute(
            "DELETE FROM tag_updates WHERE scraped_at < ?1",
            [cutoff.timestamp_millis()],
        )?;
        Ok(deleted)
    }

    fn delete_tags_viewed_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let conn = self.lock_conn()?;
        let deleted = conn.execute(
            "DELETE FROM monitored_tags WHERE last_viewed < ?1",
            [cutoff.timestamp_millis()],
        )?;
        Ok(deleted)
    }

    fn ensure_snapshot(&self, endpoint: &str, image: &str) -> Result<ImageSnapshot, StoreError> {
        {
            let conn = self.lock_conn()?;
            conn.execute(
                r#"
                INSERT INTO image_snapshots (endpoint, image, known_tags)
                VALUES (?1, ?2, '[]')
                ON CONFLICT(endpoint, image) DO NOTHING
                "#,
                (endpoint, image),
            )?;
        }

        Ok(self
            .snapshot(endpoint, image)?
            .unwrap_or_else(|| ImageSnapshot {
                endpoint: endpoint.to_string(),
                image: image.to_string(),
                known_tags: BTreeSet::new(),
            }))
    }

    fn apply_discovery(
        &self,
        endpoint: &str,
        image: &str,
        new_tags: &[String],
        live_tags: &BTreeSet<String>,
    ) -> Result<usize, StoreError> {
        let known_tags = serde_json::to_string(live_tags)?;
        let now = Utc::now().timestamp_millis();

        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;

        let mut inserted = 0;
        {
            let mut exists = tx.prepare(
                "SELECT EXISTS(SELECT 1 FROM monitored_tags WHERE endpoint = ?1 AND image = ?2 AND tag = ?3)",
            )?;
            let mut insert = tx.prepare(
                r#"
                INSERT INTO monitored_tags (endpoint, image, tag, added_at, last_viewed)
                VALUES (?1, ?2, ?3, ?4, ?4)
                "#,
            )?;
            for tag in new_tags {
                let already_monitored: bool =
                    exists.query_row((endpoint, image, tag), |row| row.get(0))?;
                if !already_monitored {
                    insert.execute((endpoint, image, tag, now))?;
                    inserted += 1;
                }
            }
        }

        tx.execute(
            r#"
            INSERT INTO image_snapshots (endpoint, image, known_tags)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(endpoint, image) DO UPDATE SET known_tags = excluded.known_tags
            "#,
            (endpoint, image, &known_tags),
        )?;

        tx.commit()?;
        Ok(inserted)
    }

    fn insert_job_execution(&self, execution: &JobExecution) -> Result<(), StoreError> {
        let conn = self.lock_conn()?;
        conn.execute(
            r#"
            INSERT INTO job_executions (started, completed, successful_queries, failed_queries)
            VALUES (?1, ?2, ?3, ?4)
            "#,
            (
                execution.started.timestamp_millis(),
                execution.completed.timestamp_millis(),
                execution.successful_queries,
                execution.failed_queries,
            ),
        )?;
        Ok(())
    }

    fn recent_job_executions(&self, limit: usize) -> Result<Vec<JobExecution>, StoreError> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT started, completed, successful_queries, failed_queries FROM job_executions
            ORDER BY started DESC, id DESC
            LIMIT ?1
            "#,
        )?;

        let rows = stmt
            .query_map([limit as i64], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, u32>(2)?,
                    row.get::<_, u32>(3)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(started, completed, successful_queries, failed_queries)| {
                Ok(JobExecution {
                    started: Self::to_datetime(started)?,
                    completed: Self::to_datetime(completed)?,
                    successful_queries,
                    failed_queries,
                })
            })
            .collect()
    }

    fn stats(&self) -> Result<StoreStats, StoreError> {
        let conn = self.lock_conn()?;
        let count = |table: &str| -> Result<u64, StoreError> {
            let n: i64 =
                conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| {
                    row.get(0)
                })?;
            Ok(n as u64)
        };

        Ok(StoreStats {
            monitored_tags: count("monitored_tags")?,
            tag_updates: count("tag_updates")?,
            image_snapshots: count("image_snapshots")?,
            job_executions: count("job_executions")?,
        })
    }
}
