use crate::config::DatabaseConfig;
use crate::store_manager::{StoreDriver, StoreHandle};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions, Postgres};
use sqlx::{Connection, FromRow};
use std::time::Duration;
use tracing::{debug, info, instrument};

/// Handle type handed to clip operations
pub type PgHandle = StoreHandle<PoolConnection<Postgres>>;

/// Stored audio clip
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Clip {
    pub id: i64,
    pub title: String,
    pub description: Option<String>,
    pub genre: String,
    /// Free-form length label such as "30s"
    pub duration: String,
    pub audio_url: String,
    pub play_count: i32,
    pub created_at: DateTime<Utc>,
}

/// Fields supplied when creating a clip
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewClip {
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    pub genre: String,
    pub duration: String,
    pub audio_url: String,
}

impl NewClip {
    /// Check the fields the schema cannot enforce
    pub fn validate(&self) -> Result<(), String> {
        for (field, value) in [
            ("title", &self.title),
            ("genre", &self.genre),
            ("duration", &self.duration),
        ] {
            if value.trim().is_empty() {
                return Err(format!("Field '{field}' must not be empty"));
            }
        }

        if !self.audio_url.starts_with("http://") && !self.audio_url.starts_with("https://") {
            return Err("Audio URL must be a valid HTTP/HTTPS URL".to_string());
        }

        Ok(())
    }
}

/// Play statistics for one clip
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClipStats {
    pub id: i64,
    pub title: String,
    pub play_count: i32,
    pub description: Option<String>,
    pub genre: String,
    pub duration: String,
}

impl From<Clip> for ClipStats {
    fn from(clip: Clip) -> Self {
        Self {
            id: clip.id,
            title: clip.title,
            play_count: clip.play_count,
            description: clip.description,
            genre: clip.genre,
            duration: clip.duration,
        }
    }
}

/// List filters and pagination
#[derive(Debug, Clone, Default)]
pub struct ClipQuery {
    pub skip: i64,
    pub limit: i64,
    /// Case-insensitive genre match
    pub genre: Option<String>,
}

/// Most played clip in the catalog
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PopularClip {
    pub id: i64,
    pub title: String,
    pub plays: i32,
}

/// Catalog-wide totals
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogStats {
    pub total_clips: i64,
    pub total_plays: i64,
    pub genres: Vec<String>,
    pub most_popular_clip: Option<PopularClip>,
}

/// PostgreSQL driver for the store manager
pub struct PgDriver {
    max_connections: u32,
    min_connections: u32,
    acquire_timeout: Duration,
    idle_timeout: Duration,
    run_migrations: bool,
}

impl PgDriver {
    pub fn new(config: &DatabaseConfig) -> Self {
        Self {
            max_connections: config.max_connections,
            min_connections: config.min_connections,
            acquire_timeout: config.connect_timeout(),
            idle_timeout: config.idle_timeout(),
            run_migrations: config.run_migrations,
        }
    }
}

#[async_trait]
impl StoreDriver for PgDriver {
    type Pool = PgPool;
    type Conn = PoolConnection<Postgres>;

    async fn connect(&self, descriptor: &str) -> Result<PgPool> {
        let pool = PgPoolOptions::new()
            .max_connections(self.max_connections)
            .min_connections(self.min_connections)
            .acquire_timeout(self.acquire_timeout)
            .idle_timeout(Some(self.idle_timeout))
            // The manager probes every handle itself.
            .test_before_acquire(false)
            .after_connect(|conn, _meta| {
                Box::pin(async move {
                    sqlx::query("SET TIME ZONE 'UTC'").execute(conn).await?;
                    Ok(())
                })
            })
            .connect(descriptor)
            .await
            .context("Failed to connect to PostgreSQL")?;

        info!("Connected to PostgreSQL database");

        Ok(pool)
    }

    async fn on_ready(&self, pool: &PgPool) -> Result<()> {
        if !self.run_migrations {
            return Ok(());
        }

        info!("Running database migrations");

        sqlx::migrate!("./migrations")
            .run(pool)
            .await
            .context("Failed to run migrations")?;

        info!("Database migrations completed");
        Ok(())
    }

    async fn open(&self, pool: &PgPool) -> Result<PoolConnection<Postgres>> {
        pool.acquire()
            .await
            .context("Failed to acquire connection from pool")
    }

    async fn ping(&self, conn: &mut PoolConnection<Postgres>) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&mut **conn)
            .await
            .context("Liveness probe failed")?;
        Ok(())
    }

    async fn discard(&self, conn: PoolConnection<Postgres>) {
        // Detached so the pool opens a replacement instead of reusing it.
        if let Err(e) = conn.detach().close().await {
            debug!(error = %e, "Error closing discarded connection");
        }
    }

    async fn close(&self, pool: PgPool) {
        pool.close().await;
        info!("PostgreSQL pool closed");
    }
}

const CLIP_COLUMNS: &str =
    "id, title, description, genre, duration, audio_url, play_count, created_at";

/// Get a clip by ID
pub async fn get_clip(conn: &mut PgConnection, clip_id: i64) -> Result<Option<Clip>> {
    let clip = sqlx::query_as::<_, Clip>(&format!(
        "SELECT {CLIP_COLUMNS} FROM clips WHERE id = $1"
    ))
    .bind(clip_id)
    .fetch_optional(&mut *conn)
    .await
    .context("Failed to query clip")?;

    Ok(clip)
}

/// List clips with optional genre filter
#[instrument(skip(conn))]
pub async fn list_clips(conn: &mut PgConnection, query: &ClipQuery) -> Result<Vec<Clip>> {
    let clips = sqlx::query_as::<_, Clip>(&format!(
        r#"
        SELECT {CLIP_COLUMNS}
        FROM clips
        WHERE ($1::text IS NULL OR LOWER(genre) = LOWER($1))
        ORDER BY id ASC
        OFFSET $2
        LIMIT $3
        "#
    ))
    .bind(query.genre.as_deref())
    .bind(query.skip)
    .bind(query.limit)
    .fetch_all(&mut *conn)
    .await
    .context("Failed to list clips")?;

    Ok(clips)
}

/// Insert a new clip
#[instrument(skip(conn, clip), fields(title = %clip.title, genre = %clip.genre))]
pub async fn create_clip(conn: &mut PgConnection, clip: &NewClip) -> Result<Clip> {
    let mut tx = conn.begin().await.context("Failed to begin transaction")?;

    let created = sqlx::query_as::<_, Clip>(&format!(
        r#"
        INSERT INTO clips (title, description, genre, duration, audio_url, play_count, created_at)
        VALUES ($1, $2, $3, $4, $5, 0, NOW())
        RETURNING {CLIP_COLUMNS}
        "#
    ))
    .bind(&clip.title)
    .bind(&clip.description)
    .bind(&clip.genre)
    .bind(&clip.duration)
    .bind(&clip.audio_url)
    .fetch_one(&mut *tx)
    .await
    .context("Failed to insert clip")?;

    tx.commit().await.context("Failed to commit transaction")?;

    debug!(clip_id = created.id, "Clip created");

    Ok(created)
}

/// Increment a clip's play count, returning the updated clip if it exists
#[instrument(skip(conn))]
pub async fn record_play(conn: &mut PgConnection, clip_id: i64) -> Result<Option<Clip>> {
    let mut tx = conn.begin().await.context("Failed to begin transaction")?;

    let updated = sqlx::query_as::<_, Clip>(&format!(
        r#"
        UPDATE clips
        SET play_count = play_count + 1
        WHERE id = $1
        RETURNING {CLIP_COLUMNS}
        "#
    ))
    .bind(clip_id)
    .fetch_optional(&mut *tx)
    .await
    .context("Failed to increment play count")?;

    // Nothing to persist for a missing clip; dropping rolls back.
    if updated.is_some() {
        tx.commit().await.context("Failed to commit transaction")?;
    }

    Ok(updated)
}

/// Most played clips, highest first
pub async fn popular_clips(conn: &mut PgConnection, limit: i64) -> Result<Vec<Clip>> {
    let clips = sqlx::query_as::<_, Clip>(&format!(
        "SELECT {CLIP_COLUMNS} FROM clips ORDER BY play_count DESC, id ASC LIMIT $1"
    ))
    .bind(limit)
    .fetch_all(&mut *conn)
    .await
    .context("Failed to query popular clips")?;

    Ok(clips)
}

/// Catalog-wide statistics
pub async fn catalog_stats(conn: &mut PgConnection) -> Result<CatalogStats> {
    let (total_clips, total_plays): (i64, i64) = sqlx::query_as(
        r#"
        SELECT
            COUNT(*) AS total_clips,
            COALESCE(SUM(play_count), 0)::BIGINT AS total_plays
        FROM clips
        "#,
    )
    .fetch_one(&mut *conn)
    .await
    .context("Failed to get catalog totals")?;

    let genres: Vec<String> = sqlx::query_scalar("SELECT DISTINCT genre FROM clips ORDER BY genre")
        .fetch_all(&mut *conn)
        .await
        .context("Failed to list genres")?;

    let most_popular_clip = sqlx::query_as::<_, PopularClip>(
        "SELECT id, title, play_count AS plays FROM clips ORDER BY play_count DESC, id ASC LIMIT 1",
    )
    .fetch_optional(&mut *conn)
    .await
    .context("Failed to query most popular clip")?;

    Ok(CatalogStats {
        total_clips,
        total_plays,
        genres,
        most_popular_clip,
    })
}
