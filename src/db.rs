use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tokio::sync::OnceCell;
use vercel_runtime::Error;

static POOL: OnceCell<PgPool> = OnceCell::const_new();

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ResponseAnalysisRow {
  pub query_id: String,
  pub answer_engine: String,
  pub buying_journey_stage: Option<String>,
  pub sentiment_score: Option<f64>,
  pub ranking_position: Option<i32>,
  pub company_mentioned: Option<bool>,
  pub solution_analysis: Option<String>,
  pub geographic_region: Option<String>,
  pub icp_vertical: Option<String>,
  pub buyer_persona: Option<String>,
  pub rank_list: Option<String>,
  pub mentioned_companies_json: Option<String>,
  pub analysis_batch_id: Option<String>,
  pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct ResponseQueryFilter {
  pub geographic_region: Option<String>,
  pub icp_vertical: Option<String>,
  pub analysis_batch_id: Option<String>,
  pub created_from: Option<DateTime<Utc>>,
  pub created_to: Option<DateTime<Utc>>,
}

async fn ensure_schema(pool: &PgPool) -> Result<(), Error> {
  // Keep schema creation idempotent; the ingestion pipeline owns the real
  // migrations and this only has to hold up for fresh local databases.
  sqlx::query(
    r#"
      CREATE TABLE IF NOT EXISTS response_analysis (
        id BIGINT GENERATED ALWAYS AS IDENTITY PRIMARY KEY,
        company_id TEXT NOT NULL,
        query_id TEXT NOT NULL,
        answer_engine TEXT NOT NULL,
        buying_journey_stage TEXT NULL,
        sentiment_score DOUBLE PRECISION NULL,
        ranking_position INT NULL,
        company_mentioned BOOLEAN NULL,
        solution_analysis TEXT NULL,
        geographic_region TEXT NULL,
        icp_vertical TEXT NULL,
        buyer_persona TEXT NULL,
        rank_list TEXT NULL,
        mentioned_companies_json TEXT NULL,
        analysis_batch_id TEXT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
      );
    "#,
  )
  .execute(pool)
  .await
  .map_err(|e| -> Error { Box::new(e) })?;

  sqlx::query(
    r#"
      CREATE INDEX IF NOT EXISTS idx_response_analysis_company_created
        ON response_analysis (company_id, created_at);
    "#,
  )
  .execute(pool)
  .await
  .map_err(|e| -> Error { Box::new(e) })?;

  sqlx::query(
    r#"
      CREATE INDEX IF NOT EXISTS idx_response_analysis_company_batch
        ON response_analysis (company_id, analysis_batch_id);
    "#,
  )
  .execute(pool)
  .await
  .map_err(|e| -> Error { Box::new(e) })?;

  Ok(())
}

pub async fn get_pool() -> Result<&'static PgPool, Error> {
  POOL
    .get_or_try_init(|| async {
      let url = std::env::var("SUPABASE_DB_URL")
        .or_else(|_| std::env::var("DATABASE_URL"))
        .map_err(|_| -> Error {
          Box::new(std::io::Error::other(
            "Missing SUPABASE_DB_URL (or DATABASE_URL)",
          ))
        })?;

      let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&url)
        .await
        .map_err(|e| -> Error { Box::new(e) })?;

      ensure_schema(&pool).await?;
      Ok::<_, Error>(pool)
    })
    .await
}

pub async fn fetch_response_analysis_rows(
  pool: &PgPool,
  company_id: &str,
  filter: &ResponseQueryFilter,
) -> Result<Vec<ResponseAnalysisRow>, Error> {
  let rows = sqlx::query_as::<_, ResponseAnalysisRow>(
    r#"
      SELECT
        query_id,
        answer_engine,
        buying_journey_stage,
        sentiment_score,
        ranking_position,
        company_mentioned,
        solution_analysis,
        geographic_region,
        icp_vertical,
        buyer_persona,
        rank_list,
        mentioned_companies_json,
        analysis_batch_id,
        created_at
      FROM response_analysis
      WHERE company_id = $1
        AND ($2::text IS NULL OR geographic_region = $2)
        AND ($3::text IS NULL OR icp_vertical = $3)
        AND ($4::text IS NULL OR analysis_batch_id = $4)
        AND ($5::timestamptz IS NULL OR created_at >= $5)
        AND ($6::timestamptz IS NULL OR created_at <= $6)
      ORDER BY created_at DESC;
    "#,
  )
  .bind(company_id)
  .bind(filter.geographic_region.as_deref())
  .bind(filter.icp_vertical.as_deref())
  .bind(filter.analysis_batch_id.as_deref())
  .bind(filter.created_from)
  .bind(filter.created_to)
  .fetch_all(pool)
  .await
  .map_err(|e| -> Error { Box::new(e) })?;

  Ok(rows)
}

pub async fn count_response_analysis_rows(pool: &PgPool, company_id: &str) -> Result<i64, Error> {
  let (count,): (i64,) = sqlx::query_as(
    r#"
      SELECT COUNT(*)
      FROM response_analysis
      WHERE company_id = $1;
    "#,
  )
  .bind(company_id)
  .fetch_one(pool)
  .await
  .map_err(|e| -> Error { Box::new(e) })?;

  Ok(count)
}
