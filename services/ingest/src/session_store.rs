use crate::config::DatabaseConfig;
use crate::error::StoreError;
use anyhow::{Context, Result};
use async_trait::async_trait;
use bodyscan_common::{Pose, ScanStatus, ScanUploadSession, SessionUpdate};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::FromRow;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, instrument};

/// Persistence for scan upload sessions, keyed by `(uid, scan_id)`.
///
/// `upsert` applies the update under the store's own isolation, so a
/// rejected transition leaves the stored document untouched.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get(&self, uid: &str, scan_id: &str) -> Result<Option<ScanUploadSession>, StoreError>;

    async fn upsert(&self, update: SessionUpdate) -> Result<ScanUploadSession, StoreError>;

    /// Cheap round trip used by the readiness probe.
    async fn ping(&self) -> Result<(), StoreError>;
}

#[derive(Debug, FromRow)]
struct SessionRow {
    uid: String,
    scan_id: String,
    status: String,
    photo_paths: serde_json::Value,
    correlation_id: Option<String>,
    current_weight_kg: Option<f64>,
    goal_weight_kg: Option<f64>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<SessionRow> for ScanUploadSession {
    type Error = StoreError;

    fn try_from(row: SessionRow) -> Result<Self, StoreError> {
        let status = row
            .status
            .parse::<ScanStatus>()
            .map_err(|e| StoreError::Database(sqlx::Error::Decode(e.into())))?;
        let photo_paths: BTreeMap<Pose, String> = serde_json::from_value(row.photo_paths)?;

        Ok(ScanUploadSession {
            uid: row.uid,
            scan_id: row.scan_id,
            photo_paths,
            status,
            correlation_id: row.correlation_id,
            current_weight_kg: row.current_weight_kg,
            goal_weight_kg: row.goal_weight_kg,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// Session store in PostgreSQL
pub struct PgSessionStore {
    pool: PgPool,
}

impl PgSessionStore {
    /// Create a new session store with connection pool
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.connect_timeout())
            .idle_timeout(Some(config.idle_timeout()))
            .connect(&config.url)
            .await
            .context("Failed to connect to PostgreSQL")?;

        info!("Connected to PostgreSQL database");

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> Result<()> {
        info!("Running database migrations");

        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Failed to run migrations")?;

        info!("Database migrations completed");
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl SessionStore for PgSessionStore {
    async fn get(&self, uid: &str, scan_id: &str) -> Result<Option<ScanUploadSession>, StoreError> {
        let row = sqlx::query_as::<_, SessionRow>(
            r#"
            SELECT uid, scan_id, status, photo_paths, correlation_id,
                   current_weight_kg, goal_weight_kg, created_at, updated_at
            FROM scan_sessions
            WHERE uid = $1 AND scan_id = $2
            "#,
        )
        .bind(uid)
        .bind(scan_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(ScanUploadSession::try_from).transpose()
    }

    #[instrument(skip(self, update), fields(uid = %update.uid, scan_id = %update.scan_id))]
    async fn upsert(&self, update: SessionUpdate) -> Result<ScanUploadSession, StoreError> {
        let mut tx = self.pool.begin().await?;

        let existing = sqlx::query_as::<_, SessionRow>(
            r#"
            SELECT uid, scan_id, status, photo_paths, correlation_id,
                   current_weight_kg, goal_weight_kg, created_at, updated_at
            FROM scan_sessions
            WHERE uid = $1 AND scan_id = $2
            FOR UPDATE
            "#,
        )
        .bind(&update.uid)
        .bind(&update.scan_id)
        .fetch_optional(&mut *tx)
        .await?;

        let now = Utc::now();
        let session = match existing {
            Some(row) => {
                let mut session = ScanUploadSession::try_from(row)?;
                session.apply(update, now)?;
                session
            }
            None => ScanUploadSession::create(update, now)?,
        };

        // created_at is only written by the INSERT branch
        sqlx::query(
            r#"
            INSERT INTO scan_sessions (
                uid, scan_id, status, photo_paths, correlation_id,
                current_weight_kg, goal_weight_kg, created_at, updated_at
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9
            )
            ON CONFLICT (uid, scan_id) DO UPDATE SET
                status = EXCLUDED.status,
                photo_paths = EXCLUDED.photo_paths,
                correlation_id = EXCLUDED.correlation_id,
                current_weight_kg = EXCLUDED.current_weight_kg,
                goal_weight_kg = EXCLUDED.goal_weight_kg,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&session.uid)
        .bind(&session.scan_id)
        .bind(session.status.as_str())
        .bind(serde_json::to_value(&session.photo_paths)?)
        .bind(&session.correlation_id)
        .bind(session.current_weight_kg)
        .bind(session.goal_weight_kg)
        .bind(session.created_at)
        .bind(session.updated_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        debug!(status = %session.status, poses = session.photo_paths.len(), "Session upserted");
        metrics::counter!("ingest.sessions.upserted", "status" => session.status.as_str()).increment(1);

        Ok(session)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

struct MemoryEntry {
    session: ScanUploadSession,
    expires_at: Instant,
}

/// In-process session store. Entries expire `ttl` after their last write.
pub struct MemorySessionStore {
    ttl: Duration,
    entries: Mutex<HashMap<(String, String), MemoryEntry>>,
}

impl MemorySessionStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Drop expired entries, returning how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| entry.expires_at > now);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

fn key(uid: &str, scan_id: &str) -> (String, String) {
    (uid.to_string(), scan_id.to_string())
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn get(&self, uid: &str, scan_id: &str) -> Result<Option<ScanUploadSession>, StoreError> {
        let now = Instant::now();
        Ok(self
            .entries
            .lock()
            .get(&key(uid, scan_id))
            .filter(|entry| entry.expires_at > now)
            .map(|entry| entry.session.clone()))
    }

    async fn upsert(&self, update: SessionUpdate) -> Result<ScanUploadSession, StoreError> {
        let now = Instant::now();
        let key = key(&update.uid, &update.scan_id);
        let mut entries = self.entries.lock();

        let existing = entries
            .get(&key)
            .filter(|entry| entry.expires_at > now)
            .map(|entry| entry.session.clone());

        let session = match existing {
            Some(mut session) => {
                session.apply(update, Utc::now())?;
                session
            }
            None => ScanUploadSession::create(update, Utc::now())?,
        };

        entries.insert(
            key,
            MemoryEntry {
                session: session.clone(),
                expires_at: now + self.ttl,
            },
        );

        Ok(session)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
