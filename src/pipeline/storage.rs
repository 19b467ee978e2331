//! Storage Module - TimescaleDB Integration
//!
//! Batched prepared inserts for the seven analytical tables. Writers are
//! idempotent under at-least-once delivery: append-only tables conflict-skip
//! on their primary key, and the sessions table upserts with replacing
//! semantics so repeated flushes converge.

use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::info;

use crate::common::config::DatabaseConfig;
use crate::error::Result;
use crate::models::rows::{
    ErrorRow, EventRow, PageViewRow, PageViewUpdate, ReplayChunkRow, SessionRow, WebVitalsRow,
};
use crate::schemas::insights::Insight;

/// Storage manager for TimescaleDB
pub struct StorageManager {
    pool: PgPool,
}

impl StorageManager {
    /// Connect a pool using the configured limits
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .connect(&config.connection_string())
            .await?;

        info!("Connected to TimescaleDB at {}:{}", config.host, config.port);

        Ok(Self { pool })
    }

    /// Wrap an existing pool (integration tests)
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create tables, hypertables, and indexes
    pub async fn initialize_schema(&self) -> Result<()> {
        info!("Initializing analytics schema");

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS events (
                event_id UUID NOT NULL,
                project_id VARCHAR(64) NOT NULL,
                session_id UUID NOT NULL,
                user_id VARCHAR(128),
                event_type VARCHAR(32) NOT NULL,
                timestamp TIMESTAMPTZ NOT NULL,
                url TEXT,
                path TEXT,
                title TEXT,
                referrer TEXT,
                click_x SMALLINT,
                click_y SMALLINT,
                target_selector TEXT,
                target_tag VARCHAR(32),
                target_text TEXT,
                scroll_depth SMALLINT,
                error_message TEXT,
                error_type VARCHAR(128),
                lcp DOUBLE PRECISION,
                fid DOUBLE PRECISION,
                cls DOUBLE PRECISION,
                ttfb DOUBLE PRECISION,
                payload TEXT,
                browser VARCHAR(64),
                os VARCHAR(64),
                device_type VARCHAR(32),
                viewport_width INTEGER,
                viewport_height INTEGER,
                country VARCHAR(64),
                city VARCHAR(128),
                PRIMARY KEY (timestamp, event_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Month-sized chunks match the query patterns of the dashboard
        sqlx::query(
            r#"
            SELECT create_hypertable('events', 'timestamp',
                if_not_exists => TRUE,
                chunk_time_interval => INTERVAL '1 month'
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .ok();

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sessions (
                session_id UUID PRIMARY KEY,
                project_id VARCHAR(64) NOT NULL,
                user_id VARCHAR(128),
                started_at TIMESTAMPTZ NOT NULL,
                ended_at TIMESTAMPTZ NOT NULL,
                duration_ms BIGINT NOT NULL,
                page_views BIGINT NOT NULL,
                events_count BIGINT NOT NULL,
                errors_count BIGINT NOT NULL,
                click_count BIGINT NOT NULL,
                entry_page TEXT,
                exit_page TEXT,
                has_error BOOLEAN NOT NULL,
                has_rage_click BOOLEAN NOT NULL,
                has_dead_click BOOLEAN NOT NULL,
                is_bounced BOOLEAN NOT NULL,
                browser VARCHAR(64),
                os VARCHAR(64),
                device_type VARCHAR(32),
                country VARCHAR(64),
                city VARCHAR(128)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS page_views (
                event_id UUID PRIMARY KEY,
                project_id VARCHAR(64) NOT NULL,
                session_id UUID NOT NULL,
                timestamp TIMESTAMPTZ NOT NULL,
                url TEXT,
                path TEXT,
                title TEXT,
                referrer TEXT,
                time_on_page_ms BIGINT NOT NULL DEFAULT 0,
                scroll_depth SMALLINT NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS web_vitals (
                event_id UUID PRIMARY KEY,
                project_id VARCHAR(64) NOT NULL,
                session_id UUID NOT NULL,
                timestamp TIMESTAMPTZ NOT NULL,
                url TEXT,
                path TEXT,
                lcp DOUBLE PRECISION,
                fid DOUBLE PRECISION,
                cls DOUBLE PRECISION,
                ttfb DOUBLE PRECISION,
                fcp DOUBLE PRECISION,
                inp DOUBLE PRECISION
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS errors (
                event_id UUID PRIMARY KEY,
                project_id VARCHAR(64) NOT NULL,
                session_id UUID NOT NULL,
                timestamp TIMESTAMPTZ NOT NULL,
                url TEXT,
                path TEXT,
                message TEXT,
                stack TEXT,
                source TEXT,
                line INTEGER,
                col INTEGER,
                error_type VARCHAR(128)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS insights (
                insight_id UUID PRIMARY KEY,
                project_id VARCHAR(64) NOT NULL,
                session_id UUID NOT NULL,
                insight_type VARCHAR(32) NOT NULL,
                timestamp TIMESTAMPTZ NOT NULL,
                url TEXT,
                path TEXT,
                x DOUBLE PRECISION,
                y DOUBLE PRECISION,
                target_selector TEXT,
                details JSONB,
                related_event_ids UUID[]
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS replay_chunks (
                session_id UUID NOT NULL,
                project_id VARCHAR(64) NOT NULL,
                chunk_index INTEGER NOT NULL,
                timestamp_start TIMESTAMPTZ NOT NULL,
                timestamp_end TIMESTAMPTZ NOT NULL,
                data BYTEA NOT NULL,
                data_size BIGINT NOT NULL,
                event_count INTEGER NOT NULL,
                has_full_snapshot BOOLEAN NOT NULL,
                PRIMARY KEY (timestamp_start, session_id, chunk_index)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            SELECT create_hypertable('replay_chunks', 'timestamp_start',
                if_not_exists => TRUE,
                chunk_time_interval => INTERVAL '1 day'
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .ok();

        // Old replays age out; cold storage migration happens elsewhere
        sqlx::query(
            r#"
            SELECT add_retention_policy('replay_chunks', INTERVAL '30 days',
                if_not_exists => TRUE)
            "#,
        )
        .execute(&self.pool)
        .await
        .ok();

        self.create_indexes().await?;

        info!("Schema initialization complete");
        Ok(())
    }

    async fn create_indexes(&self) -> Result<()> {
        let indexes = vec![
            "CREATE INDEX IF NOT EXISTS idx_events_session ON events(session_id, timestamp)",
            "CREATE INDEX IF NOT EXISTS idx_events_project_type ON events(project_id, event_type, timestamp DESC)",
            "CREATE INDEX IF NOT EXISTS idx_sessions_project ON sessions(project_id, started_at DESC)",
            "CREATE INDEX IF NOT EXISTS idx_page_views_session ON page_views(session_id, timestamp)",
            "CREATE INDEX IF NOT EXISTS idx_errors_project ON errors(project_id, timestamp DESC)",
            "CREATE INDEX IF NOT EXISTS idx_insights_project_type ON insights(project_id, insight_type, timestamp DESC)",
            "CREATE INDEX IF NOT EXISTS idx_insights_session ON insights(session_id)",
            "CREATE INDEX IF NOT EXISTS idx_replay_session ON replay_chunks(session_id, chunk_index)",
        ];

        for index_sql in indexes {
            sqlx::query(index_sql).execute(&self.pool).await?;
        }

        Ok(())
    }

    /// Append a batch of event rows; duplicates from redelivery are skipped
    pub async fn insert_events(&self, rows: &[EventRow]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;

        for row in rows {
            sqlx::query(
                r#"
                INSERT INTO events
                (event_id, project_id, session_id, user_id, event_type, timestamp,
                 url, path, title, referrer,
                 click_x, click_y, target_selector, target_tag, target_text,
                 scroll_depth, error_message, error_type,
                 lcp, fid, cls, ttfb, payload,
                 browser, os, device_type, viewport_width, viewport_height,
                 country, city)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10,
                        $11, $12, $13, $14, $15, $16, $17, $18,
                        $19, $20, $21, $22, $23,
                        $24, $25, $26, $27, $28, $29, $30)
                ON CONFLICT (timestamp, event_id) DO NOTHING
                "#,
            )
            .bind(row.event_id)
            .bind(&row.project_id)
            .bind(row.session_id)
            .bind(&row.user_id)
            .bind(&row.event_type)
            .bind(row.timestamp)
            .bind(&row.url)
            .bind(&row.path)
            .bind(&row.title)
            .bind(&row.referrer)
            .bind(row.click_x)
            .bind(row.click_y)
            .bind(&row.target_selector)
            .bind(&row.target_tag)
            .bind(&row.target_text)
            .bind(row.scroll_depth)
            .bind(&row.error_message)
            .bind(&row.error_type)
            .bind(row.lcp)
            .bind(row.fid)
            .bind(row.cls)
            .bind(row.ttfb)
            .bind(&row.payload)
            .bind(&row.browser)
            .bind(&row.os)
            .bind(&row.device_type)
            .bind(row.viewport_width)
            .bind(row.viewport_height)
            .bind(&row.country)
            .bind(&row.city)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    pub async fn insert_page_views(&self, rows: &[PageViewRow]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;

        for row in rows {
            sqlx::query(
                r#"
                INSERT INTO page_views
                (event_id, project_id, session_id, timestamp, url, path, title,
                 referrer, time_on_page_ms, scroll_depth)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                ON CONFLICT (event_id) DO NOTHING
                "#,
            )
            .bind(row.event_id)
            .bind(&row.project_id)
            .bind(row.session_id)
            .bind(row.timestamp)
            .bind(&row.url)
            .bind(&row.path)
            .bind(&row.title)
            .bind(&row.referrer)
            .bind(row.time_on_page_ms)
            .bind(row.scroll_depth)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Close out page views whose dwell time became known
    pub async fn apply_page_view_updates(&self, updates: &[PageViewUpdate]) -> Result<()> {
        if updates.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;

        for update in updates {
            sqlx::query(
                r#"
                UPDATE page_views
                SET time_on_page_ms = $2, scroll_depth = $3
                WHERE event_id = $1
                "#,
            )
            .bind(update.event_id)
            .bind(update.time_on_page_ms)
            .bind(update.scroll_depth)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    pub async fn insert_web_vitals(&self, rows: &[WebVitalsRow]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;

        for row in rows {
            sqlx::query(
                r#"
                INSERT INTO web_vitals
                (event_id, project_id, session_id, timestamp, url, path,
                 lcp, fid, cls, ttfb, fcp, inp)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
                ON CONFLICT (event_id) DO NOTHING
                "#,
            )
            .bind(row.event_id)
            .bind(&row.project_id)
            .bind(row.session_id)
            .bind(row.timestamp)
            .bind(&row.url)
            .bind(&row.path)
            .bind(row.lcp)
            .bind(row.fid)
            .bind(row.cls)
            .bind(row.ttfb)
            .bind(row.fcp)
            .bind(row.inp)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    pub async fn insert_errors(&self, rows: &[ErrorRow]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;

        for row in rows {
            sqlx::query(
                r#"
                INSERT INTO errors
                (event_id, project_id, session_id, timestamp, url, path,
                 message, stack, source, line, col, error_type)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
                ON CONFLICT (event_id) DO NOTHING
                "#,
            )
            .bind(row.event_id)
            .bind(&row.project_id)
            .bind(row.session_id)
            .bind(row.timestamp)
            .bind(&row.url)
            .bind(&row.path)
            .bind(&row.message)
            .bind(&row.stack)
            .bind(&row.source)
            .bind(row.line)
            .bind(row.col)
            .bind(&row.error_type)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    pub async fn insert_insights(&self, insights: &[Insight]) -> Result<()> {
        use chrono::TimeZone;

        if insights.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;

        for insight in insights {
            let at = chrono::Utc
                .timestamp_millis_opt(insight.timestamp)
                .single()
                .unwrap_or_else(chrono::Utc::now);

            sqlx::query(
                r#"
                INSERT INTO insights
                (insight_id, project_id, session_id, insight_type, timestamp,
                 url, path, x, y, target_selector, details, related_event_ids)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
                ON CONFLICT (insight_id) DO NOTHING
                "#,
            )
            .bind(insight.insight_id)
            .bind(&insight.project_id)
            .bind(insight.session_id)
            .bind(insight.insight_type.as_str())
            .bind(at)
            .bind(&insight.url)
            .bind(&insight.path)
            .bind(insight.x)
            .bind(insight.y)
            .bind(&insight.target_selector)
            .bind(&insight.details)
            .bind(&insight.related_event_ids)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    pub async fn insert_replay_chunks(&self, rows: &[ReplayChunkRow]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;

        for row in rows {
            sqlx::query(
                r#"
                INSERT INTO replay_chunks
                (session_id, project_id, chunk_index, timestamp_start,
                 timestamp_end, data, data_size, event_count, has_full_snapshot)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                ON CONFLICT (timestamp_start, session_id, chunk_index) DO NOTHING
                "#,
            )
            .bind(row.session_id)
            .bind(&row.project_id)
            .bind(row.chunk_index)
            .bind(row.timestamp_start)
            .bind(row.timestamp_end)
            .bind(&row.data)
            .bind(row.data_size)
            .bind(row.event_count)
            .bind(row.has_full_snapshot)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Upsert session rows with replacing semantics; repeated flushes of
    /// the same session converge to the latest state
    pub async fn upsert_sessions(&self, rows: &[SessionRow]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;

        for row in rows {
            sqlx::query(
                r#"
                INSERT INTO sessions
                (session_id, project_id, user_id, started_at, ended_at,
                 duration_ms, page_views, events_count, errors_count,
                 click_count, entry_page, exit_page, has_error,
                 has_rage_click, has_dead_click, is_bounced,
                 browser, os, device_type, country, city)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10,
                        $11, $12, $13, $14, $15, $16, $17, $18, $19, $20, $21)
                ON CONFLICT (session_id) DO UPDATE SET
                    project_id = EXCLUDED.project_id,
                    user_id = EXCLUDED.user_id,
                    started_at = EXCLUDED.started_at,
                    ended_at = EXCLUDED.ended_at,
                    duration_ms = EXCLUDED.duration_ms,
                    page_views = EXCLUDED.page_views,
                    events_count = EXCLUDED.events_count,
                    errors_count = EXCLUDED.errors_count,
                    click_count = EXCLUDED.click_count,
                    entry_page = EXCLUDED.entry_page,
                    exit_page = EXCLUDED.exit_page,
                    has_error = EXCLUDED.has_error,
                    has_rage_click = EXCLUDED.has_rage_click,
                    has_dead_click = EXCLUDED.has_dead_click,
                    is_bounced = EXCLUDED.is_bounced,
                    browser = EXCLUDED.browser,
                    os = EXCLUDED.os,
                    device_type = EXCLUDED.device_type,
                    country = EXCLUDED.country,
                    city = EXCLUDED.city
                "#,
            )
            .bind(row.session_id)
            .bind(&row.project_id)
            .bind(&row.user_id)
            .bind(row.started_at)
            .bind(row.ended_at)
            .bind(row.duration_ms)
            .bind(row.page_views)
            .bind(row.events_count)
            .bind(row.errors_count)
            .bind(row.click_count)
            .bind(&row.entry_page)
            .bind(&row.exit_page)
            .bind(row.has_error)
            .bind(row.has_rage_click)
            .bind(row.has_dead_click)
            .bind(row.is_bounced)
            .bind(&row.browser)
            .bind(&row.os)
            .bind(&row.device_type)
            .bind(&row.country)
            .bind(&row.city)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Liveness probe for the HTTP surface
    pub async fn health_check(&self) -> bool {
        sqlx::query("SELECT 1").fetch_one(&self.pool).await.is_ok()
    }
}

#[async_trait::async_trait]
impl crate::insights::InsightWriter for StorageManager {
    async fn write_insights(&self, insights: &[Insight]) -> Result<()> {
        self.insert_insights(insights).await
    }
}

#[async_trait::async_trait]
impl crate::pipeline::session_aggregator::SessionWriter for StorageManager {
    async fn write_sessions(&self, rows: &[SessionRow]) -> Result<()> {
        self.upsert_sessions(rows).await
    }
}

#[async_trait::async_trait]
impl crate::pipeline::replay_processor::ChunkWriter for StorageManager {
    async fn write_chunks(&self, rows: &[ReplayChunkRow]) -> Result<()> {
        self.insert_replay_chunks(rows).await
    }
}
