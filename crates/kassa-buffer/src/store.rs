//! # Buffer Store Management
//!
//! Connection pool creation and configuration for the SQLite-backed buffer.
//!
//! ## Durability Model
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Crash-Consistent Writes                            │
//! │                                                                         │
//! │  insert / status transition / DLQ promotion                            │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  BEGIN ─► write rows ─► COMMIT                                         │
//! │                            │                                            │
//! │                            ▼                                            │
//! │  WAL append + fsync (synchronous=FULL)                                 │
//! │                                                                         │
//! │  Power loss immediately after the call returns success?                │
//! │  The committed transaction is already on disk. Power loss mid-commit?  │
//! │  SQLite rolls the WAL back to the pre-state on next open.              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## WAL Mode
//! SQLite WAL (Write-Ahead Logging) mode is enabled for:
//! - Concurrent readers that never block the single writer
//! - Crash recovery from the log
//!
//! Unlike a throughput-oriented deployment we run `synchronous=FULL`, not
//! NORMAL: a receipt acknowledged to the POS caller must survive an abrupt
//! power loss, so every commit is forced to stable storage. The fsync cost
//! is bounded (low single-digit milliseconds on typical terminal disks)
//! and only paid on the Phase 1 insert path.

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

use kassa_core::BufferStatus;

use crate::error::{BufferError, BufferResult};
use crate::migrations;
use crate::repository::dead_letter::DeadLetterRepository;
use crate::repository::event::EventRepository;
use crate::repository::receipt::ReceiptRepository;

/// Default ceiling on active (pending/syncing) receipts.
pub const DEFAULT_CAPACITY: u32 = 200;

// =============================================================================
// Configuration
// =============================================================================

/// Buffer configuration.
///
/// ## Example
/// ```rust,ignore
/// let config = BufferConfig::new("/var/lib/kassa/buffer.db")
///     .capacity(200)
///     .max_connections(5);
/// ```
#[derive(Debug, Clone)]
pub struct BufferConfig {
    /// Path to the SQLite database file.
    pub database_path: PathBuf,

    /// Ceiling on active receipts. Inserting beyond this fails with
    /// [`BufferError::CapacityExceeded`].
    pub capacity: u32,

    /// Maximum number of connections in the pool.
    /// Default: 5 (one writer + concurrent status readers)
    pub max_connections: u32,

    /// Minimum number of connections to keep alive.
    pub min_connections: u32,

    /// Connection timeout duration.
    pub connect_timeout: Duration,

    /// Whether to run migrations on open.
    pub run_migrations: bool,
}

impl BufferConfig {
    /// Creates a new buffer configuration with the given path.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        BufferConfig {
            database_path: path.into(),
            capacity: DEFAULT_CAPACITY,
            max_connections: 5,
            min_connections: 1,
            connect_timeout: Duration::from_secs(30),
            run_migrations: true,
        }
    }

    /// Sets the active-receipt ceiling.
    pub fn capacity(mut self, capacity: u32) -> Self {
        self.capacity = capacity;
        self
    }

    /// Sets the maximum number of connections.
    pub fn max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }

    /// Sets whether to run migrations on open.
    pub fn run_migrations(mut self, run: bool) -> Self {
        self.run_migrations = run;
        self
    }

    /// Creates an in-memory buffer configuration (for testing).
    ///
    /// ## Usage
    /// ```rust,ignore
    /// let buffer = Buffer::open(BufferConfig::in_memory()).await?;
    /// // Fully isolated, perfect for tests
    /// ```
    pub fn in_memory() -> Self {
        BufferConfig {
            database_path: PathBuf::from(":memory:"),
            capacity: DEFAULT_CAPACITY,
            max_connections: 1, // In-memory requires single connection
            min_connections: 1,
            connect_timeout: Duration::from_secs(5),
            run_migrations: true,
        }
    }
}

// =============================================================================
// Buffer
// =============================================================================

/// Main buffer handle providing repository access.
///
/// The buffer exclusively owns the receipts, dead-letter, and event tables;
/// every other component interacts only through these repositories, never
/// via direct storage access.
#[derive(Debug, Clone)]
pub struct Buffer {
    /// The SQLite connection pool.
    pool: SqlitePool,

    /// Active-receipt ceiling enforced by inserts.
    capacity: u32,
}

impl Buffer {
    /// Opens (or creates) the buffer database.
    ///
    /// ## What This Does
    /// 1. Creates the database file if it doesn't exist
    /// 2. Configures SQLite for crash-consistent buffering:
    ///    - WAL mode for concurrent reads
    ///    - FULL synchronous (fsync on every commit)
    ///    - Foreign keys enabled
    /// 3. Creates the connection pool
    /// 4. Runs migrations (if enabled)
    pub async fn open(config: BufferConfig) -> BufferResult<Self> {
        info!(
            path = %config.database_path.display(),
            capacity = config.capacity,
            "Opening receipt buffer"
        );

        // sqlite://path with mode=rwc creates the file if not exists
        let connect_url = format!("sqlite://{}?mode=rwc", config.database_path.display());

        let connect_options = SqliteConnectOptions::from_str(&connect_url)
            .map_err(|e| BufferError::ConnectionFailed(e.to_string()))?
            // WAL mode: readers don't block the writer and vice versa
            .journal_mode(SqliteJournalMode::Wal)
            // FULL synchronous: every commit is fsynced. A receipt we
            // acknowledged must survive power loss.
            .synchronous(SqliteSynchronous::Full)
            // Enable foreign key constraints
            .foreign_keys(true)
            .create_if_missing(true);

        debug!("Connection options configured");

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.connect_timeout)
            .connect_with(connect_options)
            .await
            .map_err(|e| BufferError::ConnectionFailed(e.to_string()))?;

        info!(
            max_connections = config.max_connections,
            "Buffer pool created"
        );

        let buffer = Buffer {
            pool,
            capacity: config.capacity,
        };

        if config.run_migrations {
            buffer.run_migrations().await?;
        }

        Ok(buffer)
    }

    /// Runs database migrations. Idempotent.
    pub async fn run_migrations(&self) -> BufferResult<()> {
        migrations::run_migrations(&self.pool).await
    }

    /// Returns a reference to the connection pool.
    ///
    /// For advanced queries not covered by repositories. Prefer repository
    /// methods when available.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Returns the configured active-receipt ceiling.
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Returns the receipt repository.
    pub fn receipts(&self) -> ReceiptRepository {
        ReceiptRepository::new(self.pool.clone(), self.capacity)
    }

    /// Returns the dead-letter repository.
    pub fn dead_letters(&self) -> DeadLetterRepository {
        DeadLetterRepository::new(self.pool.clone())
    }

    /// Returns the event-log repository.
    pub fn events(&self) -> EventRepository {
        EventRepository::new(self.pool.clone())
    }

    /// Aggregates counts per state plus DLQ size and percent-of-capacity.
    pub async fn status(&self) -> BufferResult<BufferStatus> {
        let counts = self.receipts().status_counts().await?;
        let dead_letters = self.dead_letters().count().await? as u32;

        let active = counts.pending + counts.syncing;
        let percent_full = if self.capacity == 0 {
            100.0
        } else {
            (active as f64 / self.capacity as f64) * 100.0
        };

        Ok(BufferStatus {
            capacity: self.capacity,
            active,
            percent_full,
            pending: counts.pending,
            syncing: counts.syncing,
            synced: counts.synced,
            failed: counts.failed,
            dead_letters,
        })
    }

    /// Closes the buffer connection pool.
    ///
    /// Waits for pending WAL writes before returning; after calling close,
    /// all repository operations will fail.
    pub async fn close(&self) {
        info!("Closing buffer connection pool");
        self.pool.close().await;
    }

    /// Checks if the buffer is healthy (can execute queries).
    ///
    /// A service that cannot reach its buffer must fail health checks
    /// rather than accept receipts it cannot persist.
    pub async fn health_check(&self) -> bool {
        sqlx::query("SELECT 1").execute(&self.pool).await.is_ok()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
