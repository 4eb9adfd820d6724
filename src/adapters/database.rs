use chrono::{DateTime, Utc};
use eyre::{Result, WrapErr};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};

use crate::domain::{BreakerEvent, BreakerEventKind, EvaluationResult, PriceMap};

/// Audit log: published results, breaker transitions, and the active baseline.
#[derive(Clone)]
pub struct Database {
    pub pool: SqlitePool,
}

impl Database {
    pub async fn new(db_path: &str) -> Result<Self> {
        let url = format!("sqlite:{}?mode=rwc", db_path);
        Self::connect(&url).await
    }

    pub async fn connect(url: &str) -> Result<Self> {
        // Every connection to an in-memory database is a separate database.
        let max_connections = if url.contains(":memory:") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .wrap_err_with(|| format!("failed to open {}", url))?;

        let db = Self { pool };
        db.run_migrations().await?;
        Ok(db)
    }

    async fn run_migrations(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS evaluations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                regime TEXT NOT NULL,
                target_regime TEXT NOT NULL,
                basket_value REAL NOT NULL,
                token_price REAL NOT NULL,
                change_percent REAL NOT NULL,
                rebalance_progress REAL NOT NULL,
                breaker_tripped INTEGER NOT NULL,
                weights TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS breaker_events (
                id TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                code TEXT NOT NULL,
                message TEXT NOT NULL,
                at TEXT NOT NULL,
                auto_clear_at TEXT
            );

            CREATE TABLE IF NOT EXISTS baseline (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                captured_at TEXT NOT NULL,
                prices TEXT NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // --- Evaluations ---

    pub async fn insert_evaluation(&self, result: &EvaluationResult) -> Result<()> {
        let weights = serde_json::to_string(&result.weights)?;
        sqlx::query(
            "INSERT INTO evaluations (timestamp, regime, target_regime, basket_value, token_price, change_percent, rebalance_progress, breaker_tripped, weights) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(result.timestamp.to_rfc3339())
        .bind(result.regime.to_string())
        .bind(result.target_regime.to_string())
        .bind(result.basket_value)
        .bind(result.token_price)
        .bind(result.change_percent)
        .bind(result.rebalance_progress)
        .bind(result.breaker_tripped)
        .bind(&weights)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn count_evaluations(&self) -> Result<i64> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM evaluations")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0)
    }

    // --- Breaker events ---

    pub async fn insert_breaker_event(&self, event: &BreakerEvent) -> Result<()> {
        sqlx::query(
            "INSERT INTO breaker_events (id, kind, code, message, at, auto_clear_at) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&event.id)
        .bind(event.kind.to_string())
        .bind(&event.code)
        .bind(&event.message)
        .bind(event.at.to_rfc3339())
        .bind(event.auto_clear_at.map(|t| t.to_rfc3339()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn recent_breaker_events(&self, limit: i64) -> Result<Vec<BreakerEvent>> {
        let rows = sqlx::query_as::<_, BreakerEventRow>(
            "SELECT id, kind, code, message, at, auto_clear_at FROM breaker_events ORDER BY at DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|r| r.into()).collect())
    }

    // --- Baseline ---

    pub async fn save_baseline(&self, prices: &PriceMap, captured_at: DateTime<Utc>) -> Result<()> {
        let json = serde_json::to_string(prices)?;
        sqlx::query(
            "INSERT INTO baseline (id, captured_at, prices) VALUES (1, ?, ?)
             ON CONFLICT(id) DO UPDATE SET captured_at = excluded.captured_at, prices = excluded.prices",
        )
        .bind(captured_at.to_rfc3339())
        .bind(&json)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn load_baseline(&self) -> Result<Option<(PriceMap, DateTime<Utc>)>> {
        let row: Option<(String, String)> =
            sqlx::query_as("SELECT prices, captured_at FROM baseline WHERE id = 1")
                .fetch_optional(&self.pool)
                .await?;

        let Some((prices, captured_at)) = row else {
            return Ok(None);
        };
        let prices: PriceMap =
            serde_json::from_str(&prices).wrap_err("stored baseline is not valid JSON")?;
        let captured_at = DateTime::parse_from_rfc3339(&captured_at)
            .wrap_err("stored baseline timestamp is invalid")?
            .with_timezone(&Utc);
        Ok(Some((prices, captured_at)))
    }

    pub async fn clear_baseline(&self) -> Result<()> {
        sqlx::query("DELETE FROM baseline").execute(&self.pool).await?;
        Ok(())
    }
}

// --- Row types for sqlx ---

#[derive(sqlx::FromRow)]
struct BreakerEventRow {
    id: String,
    kind: String,
    code: String,
    message: String,
    at: String,
    auto_clear_at: Option<String>,
}

fn parse_ts(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

impl From<BreakerEventRow> for BreakerEvent {
    fn from(r: BreakerEventRow) -> Self {
        BreakerEvent {
            id: r.id,
            kind: match r.kind.as_str() {
                "TRIPPED" => BreakerEventKind::Tripped,
                "OVERRIDE" => BreakerEventKind::Override,
                _ => BreakerEventKind::Cleared,
            },
            code: r.code,
            message: r.message,
            at: parse_ts(&r.at).unwrap_or_else(Utc::now),
            auto_clear_at: r.auto_clear_at.as_deref().and_then(parse_ts),
        }
    }
}
