//! Roster and stream-record persistence.
//!
//! The recorder only needs the narrow [`StreamerRoster`] and [`RecordStore`]
//! interfaces. [`SyncDb`] implements both on SQLite.

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::error::Error as StdError;
use std::fmt;
use std::future::Future;
use std::path::Path;
use tokio::runtime::Runtime;

use crate::constants::DEFAULT_QUALITY;
use crate::hls::QualityLimit;
use crate::queries::{ddl, streamers, streams};

/// Who to watch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Streamer {
    pub id: i64,
    pub name: String,
    pub max_quality: String,
}

/// Values of a stream row about to be created; the url starts out empty
#[derive(Debug, Clone, PartialEq)]
pub struct NewStream {
    pub streamer_id: i64,
    pub title: Option<String>,
    pub category: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// One recording session
#[derive(Debug, Clone, PartialEq)]
pub struct StreamRecord {
    pub id: i64,
    pub streamer_id: i64,
    pub url: Option<String>,
    pub title: Option<String>,
    pub category: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Database errors
#[derive(Debug)]
pub enum StoreError {
    /// Query or connection failure
    Database(sqlx::Error),
    /// Could not start the runtime that drives queries
    Runtime(std::io::Error),
    /// Rejected input
    Invalid(String),
    /// No row matched
    NotFound(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Database(err) => write!(f, "Database error: {}", err),
            StoreError::Runtime(err) => write!(f, "Runtime error: {}", err),
            StoreError::Invalid(msg) => write!(f, "Invalid value: {}", msg),
            StoreError::NotFound(msg) => write!(f, "Not found: {}", msg),
        }
    }
}

impl StdError for StoreError {}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::Database(err)
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Source of the streamers to watch
pub trait StreamerRoster: Send + Sync {
    fn streamers(&self) -> Result<Vec<Streamer>>;
}

/// Where recording sessions are persisted. Both calls may be retried.
pub trait RecordStore: Send + Sync {
    fn create_stream(&self, stream: &NewStream) -> Result<i64>;
    fn update_stream_url(&self, id: i64, url: &str) -> Result<()>;
}

/// Streamer names are case-insensitive and stored lowercased. Only ASCII
/// letters, digits, `_` and `-` are allowed; the name ends up in URLs and
/// log lines.
pub fn normalize_name(name: &str) -> Result<String> {
    let name = name.trim();
    if name.is_empty() {
        return Err(StoreError::Invalid("Missing streamer name".to_string()));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(StoreError::Invalid(format!("Invalid streamer name: {}", name)));
    }
    Ok(name.to_lowercase())
}

/// Accepts what the HLS resolver understands: `best`, `worst`, `audio_only`,
/// `720p` or `1080p60`
pub fn validate_quality(quality: &str) -> Result<()> {
    quality
        .parse::<QualityLimit>()
        .map(|_| ())
        .map_err(StoreError::Invalid)
}

fn millis_to_datetime(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn streamer_from_row(row: &SqliteRow) -> Result<Streamer> {
    Ok(Streamer {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        max_quality: row.try_get("max_quality")?,
    })
}

fn stream_from_row(row: &SqliteRow) -> Result<StreamRecord> {
    Ok(StreamRecord {
        id: row.try_get("id")?,
        streamer_id: row.try_get("streamer_id")?,
        url: row.try_get("url")?,
        title: row.try_get("title")?,
        category: row.try_get("category")?,
        created_at: millis_to_datetime(row.try_get("created_at")?),
    })
}

/// Synchronous SQLite database wrapper that owns a runtime for blocking
/// operations, so recorder threads can call it directly.
pub struct SyncDb {
    pool: SqlitePool,
    runtime: Runtime,
}

impl SyncDb {
    /// Open (creating if needed) a database file
    pub fn connect(path: &Path) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .foreign_keys(true);
        Self::open(options, 5)
    }

    /// Private in-memory database; a single connection keeps it alive
    pub fn connect_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .in_memory(true)
            .foreign_keys(true);
        Self::open(options, 1)
    }

    fn open(options: SqliteConnectOptions, max_connections: u32) -> Result<Self> {
        // Several recorder threads block on this runtime at once
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .map_err(StoreError::Runtime)?;
        let pool = runtime.block_on(
            SqlitePoolOptions::new()
                .max_connections(max_connections)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect_with(options),
        )?;
        Ok(Self { pool, runtime })
    }

    /// Block on an async future using the embedded runtime
    pub fn block_on<F, T>(&self, fut: F) -> T
    where
        F: Future<Output = T>,
    {
        self.runtime.block_on(fut)
    }

    /// Create tables and indexes that don't exist yet
    pub fn init_schema(&self) -> Result<()> {
        self.block_on(async {
            for sql in ddl::all() {
                sqlx::query(&sql).execute(&self.pool).await?;
            }
            Ok(())
        })
    }

    pub fn add_streamer(&self, name: &str, max_quality: Option<&str>) -> Result<Streamer> {
        let name = normalize_name(name)?;
        let quality = max_quality.unwrap_or(DEFAULT_QUALITY);
        validate_quality(quality)?;
        let id = self.block_on(async {
            sqlx::query(&streamers::insert(&name, quality))
                .execute(&self.pool)
                .await
        })?
        .last_insert_rowid();
        Ok(Streamer {
            id,
            name,
            max_quality: quality.to_string(),
        })
    }

    pub fn set_streamer_quality(&self, name: &str, max_quality: &str) -> Result<()> {
        let name = normalize_name(name)?;
        validate_quality(max_quality)?;
        let result = self.block_on(async {
            sqlx::query(&streamers::update_quality(&name, max_quality))
                .execute(&self.pool)
                .await
        })?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("streamer '{}'", name)));
        }
        Ok(())
    }

    /// Delete a streamer and its streams; returns false if it didn't exist
    pub fn remove_streamer(&self, name: &str) -> Result<bool> {
        let name = normalize_name(name)?;
        let result = self.block_on(async {
            sqlx::query(&streamers::delete_by_name(&name))
                .execute(&self.pool)
                .await
        })?;
        Ok(result.rows_affected() > 0)
    }

    pub fn streamer(&self, name: &str) -> Result<Option<Streamer>> {
        let name = normalize_name(name)?;
        let row = self.block_on(async {
            sqlx::query(&streamers::select_by_name(&name))
                .fetch_optional(&self.pool)
                .await
        })?;
        row.as_ref().map(streamer_from_row).transpose()
    }

    pub fn stream(&self, id: i64) -> Result<Option<StreamRecord>> {
        let row = self.block_on(async {
            sqlx::query(&streams::select_by_id(id))
                .fetch_optional(&self.pool)
                .await
        })?;
        row.as_ref().map(stream_from_row).transpose()
    }

    /// Most recent streams first, optionally for one streamer only
    pub fn latest_streams(&self, streamer_name: Option<&str>, limit: u64) -> Result<Vec<StreamRecord>> {
        let name = streamer_name.map(normalize_name).transpose()?;
        let rows = self.block_on(async {
            sqlx::query(&streams::select_latest(name.as_deref(), limit))
                .fetch_all(&self.pool)
                .await
        })?;
        rows.iter().map(stream_from_row).collect()
    }
}

impl StreamerRoster for SyncDb {
    fn streamers(&self) -> Result<Vec<Streamer>> {
        let rows = self.block_on(async {
            sqlx::query(&streamers::select_all())
                .fetch_all(&self.pool)
                .await
        })?;
        rows.iter().map(streamer_from_row).collect()
    }
}

impl RecordStore for SyncDb {
    fn create_stream(&self, stream: &NewStream) -> Result<i64> {
        let sql = streams::insert(
            stream.streamer_id,
            stream.title.as_deref(),
            stream.category.as_deref(),
            stream.created_at.timestamp_millis(),
        );
        let result = self.block_on(async { sqlx::query(&sql).execute(&self.pool).await })?;
        Ok(result.last_insert_rowid())
    }

    fn update_stream_url(&self, id: i64, url: &str) -> Result<()> {
        let result = self.block_on(async {
            sqlx::query(&streams::update_url(id, url))
                .execute(&self.pool)
                .await
        })?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("stream {}", id)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> SyncDb {
        let db = SyncDb::connect_in_memory().unwrap();
        db.init_schema().unwrap();
        db
    }

    #[test]
    fn test_add_and_list_streamers() {
        let db = test_db();
        let alice = db.add_streamer("Alice", None).unwrap();
        db.add_streamer("bob", Some("720p60")).unwrap();

        assert_eq!(alice.name, "alice");
        assert_eq!(alice.max_quality, "best");

        let roster = db.streamers().unwrap();
        let names: Vec<_> = roster.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["alice", "bob"]);
        assert_eq!(roster[1].max_quality, "720p60");
    }

    #[test]
    fn test_duplicate_streamer_is_rejected() {
        let db = test_db();
        db.add_streamer("alice", None).unwrap();
        assert!(db.add_streamer("ALICE", None).is_err());
    }

    #[test]
    fn test_invalid_streamer_values() {
        let db = test_db();
        assert!(matches!(db.add_streamer("  ", None), Err(StoreError::Invalid(_))));
        assert!(matches!(
            db.add_streamer("alice", Some("720P")),
            Err(StoreError::Invalid(_))
        ));
    }

    #[test]
    fn test_streamer_names_are_path_safe() {
        for ok in ["alice", "Team_Alice", "night-owl", "x2"] {
            assert!(normalize_name(ok).is_ok(), "{}", ok);
        }
        for bad in ["team/alice", "../alice", "al ice", "alice?", "ali\\ce", "élise"] {
            assert!(
                matches!(normalize_name(bad), Err(StoreError::Invalid(_))),
                "{}",
                bad
            );
        }

        let db = test_db();
        assert!(matches!(
            db.add_streamer("team/alice", None),
            Err(StoreError::Invalid(_))
        ));
        assert!(db.streamers().unwrap().is_empty());
    }

    #[test]
    fn test_unknown_quality_word_is_rejected() {
        let db = test_db();
        assert!(matches!(
            db.add_streamer("alice", Some("source")),
            Err(StoreError::Invalid(_))
        ));
        db.add_streamer("alice", None).unwrap();
        assert!(db.set_streamer_quality("alice", "source").is_err());
        assert_eq!(db.streamer("alice").unwrap().unwrap().max_quality, "best");
    }

    #[test]
    fn test_validate_quality() {
        for ok in ["best", "worst", "audio_only", "720p", "1080p60"] {
            assert!(validate_quality(ok).is_ok(), "{}", ok);
        }
        for bad in ["", "720", "p30", "Best", "720p-1", "hd 720", "source", "high"] {
            assert!(validate_quality(bad).is_err(), "{}", bad);
        }
    }

    #[test]
    fn test_stream_lifecycle() {
        let db = test_db();
        let alice = db.add_streamer("alice", None).unwrap();
        let created_at = DateTime::from_timestamp_millis(1_700_000_000_000).unwrap();

        let id = db
            .create_stream(&NewStream {
                streamer_id: alice.id,
                title: Some("Speedrun".to_string()),
                category: None,
                created_at,
            })
            .unwrap();

        let stream = db.stream(id).unwrap().unwrap();
        assert_eq!(stream.url, None);
        assert_eq!(stream.title.as_deref(), Some("Speedrun"));
        assert_eq!(stream.created_at, created_at);

        db.update_stream_url(id, "https://cid.example/").unwrap();
        db.update_stream_url(id, "https://cid2.example/").unwrap();
        let stream = db.stream(id).unwrap().unwrap();
        assert_eq!(stream.url.as_deref(), Some("https://cid2.example/"));

        assert!(matches!(
            db.update_stream_url(id + 100, "x"),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn test_latest_streams_and_cascade() {
        let db = test_db();
        let alice = db.add_streamer("alice", None).unwrap();
        let bob = db.add_streamer("bob", None).unwrap();
        for (streamer_id, ms) in [(alice.id, 1_000), (bob.id, 2_000), (alice.id, 3_000)] {
            db.create_stream(&NewStream {
                streamer_id,
                title: None,
                category: None,
                created_at: DateTime::from_timestamp_millis(ms).unwrap(),
            })
            .unwrap();
        }

        let all = db.latest_streams(None, 10).unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].created_at.timestamp_millis(), 3_000);

        let alice_streams = db.latest_streams(Some("Alice"), 1).unwrap();
        assert_eq!(alice_streams.len(), 1);
        assert_eq!(alice_streams[0].streamer_id, alice.id);

        assert!(db.remove_streamer("alice").unwrap());
        assert!(!db.remove_streamer("alice").unwrap());
        assert_eq!(db.latest_streams(None, 10).unwrap().len(), 1);
    }

    #[test]
    fn test_set_quality() {
        let db = test_db();
        db.add_streamer("alice", None).unwrap();
        db.set_streamer_quality("alice", "480p").unwrap();
        assert_eq!(db.streamer("alice").unwrap().unwrap().max_quality, "480p");
        assert!(db.set_streamer_quality("carol", "480p").is_err());
    }
}
