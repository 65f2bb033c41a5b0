use chrono::{Duration, Utc};
use vercel_runtime::Error;

use xfunnel_rust::aggregator::{aggregate, AggregateConfig};
use xfunnel_rust::db::{fetch_response_analysis_rows, get_pool, ResponseQueryFilter};
use xfunnel_rust::segments::{build_segments, TimeGranularity};

fn validate_database_url() -> Result<(), Error> {
  let url = std::env::var("SUPABASE_DB_URL")
    .or_else(|_| std::env::var("DATABASE_URL"))
    .unwrap_or_default();
  let trimmed = url.trim();
  if trimmed.is_empty() {
    return Err(Box::new(std::io::Error::other(
      "Missing SUPABASE_DB_URL (or DATABASE_URL)",
    )) as Error);
  }
  if !trimmed.contains("://") {
    return Err(Box::new(std::io::Error::other(
      "Invalid SUPABASE_DB_URL/DATABASE_URL (expected URL scheme like postgres://...)",
    )) as Error);
  }
  Ok(())
}

fn parse_flag_value(args: &[String], flag: &str) -> Option<String> {
  args
    .iter()
    .position(|a| a == flag)
    .and_then(|idx| args.get(idx + 1))
    .cloned()
}

fn fmt_opt(value: Option<f64>) -> String {
  match value {
    Some(v) => format!("{:.3}", v),
    None => "N/A".to_string(),
  }
}

#[tokio::main]
async fn main() -> Result<(), Error> {
  let subscriber = tracing_subscriber::fmt()
    .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
    .compact()
    .finish();
  let _ = tracing::subscriber::set_global_default(subscriber);

  validate_database_url()?;
  let args: Vec<String> = std::env::args().collect();

  let company_id = parse_flag_value(&args, "--company-id")
    .or_else(|| parse_flag_value(&args, "--company"))
    .unwrap_or_default();
  if company_id.trim().is_empty() {
    eprintln!("Missing required --company-id");
    eprintln!("Example: cargo run --bin local_aggregate_once -- --company-id acme --granularity week --days 30");
    return Ok(());
  }

  let granularity = parse_flag_value(&args, "--granularity")
    .as_deref()
    .and_then(TimeGranularity::parse)
    .unwrap_or(TimeGranularity::Batch);
  let days = parse_flag_value(&args, "--days").and_then(|v| v.parse::<i64>().ok());

  let mut filter = ResponseQueryFilter {
    geographic_region: parse_flag_value(&args, "--region"),
    icp_vertical: parse_flag_value(&args, "--vertical"),
    ..Default::default()
  };
  if let Some(days) = days {
    filter.created_from = Some(Utc::now() - Duration::days(days.clamp(1, 365)));
  }

  let pool = get_pool().await?;
  let rows = fetch_response_analysis_rows(pool, company_id.trim(), &filter).await?;
  println!("company_id={} rows={}", company_id.trim(), rows.len());

  if rows.is_empty() {
    println!("nothing to aggregate");
    return Ok(());
  }

  let report = aggregate(&rows, &AggregateConfig::default());
  let total = &report.overall.total;
  println!(
    "overall mention_rate={} avg_position={} feature_score={} sentiment={} records={}",
    fmt_opt(total.mention_rate),
    fmt_opt(total.avg_position),
    fmt_opt(total.feature_score),
    fmt_opt(total.sentiment),
    total.record_count
  );

  for (engine, rollup) in report.by_engine.iter() {
    println!(
      "engine={} mention_rate={} avg_position={} feature_score={} sentiment={} records={}",
      engine,
      fmt_opt(rollup.total.mention_rate),
      fmt_opt(rollup.total.avg_position),
      fmt_opt(rollup.total.feature_score),
      fmt_opt(rollup.total.sentiment),
      rollup.total.record_count
    );
  }

  for (stage, count) in report.stage_counts.iter() {
    println!("stage={} records={}", stage, count);
  }

  let segments = build_segments(&rows, granularity);
  println!("granularity={} segments={}", granularity.as_str(), segments.len());
  for seg in segments.iter() {
    println!(
      "segment key={} label=\"{}\" records={} start={} end={}",
      seg.key,
      seg.label,
      seg.record_count,
      seg.start.to_rfc3339(),
      seg.end.to_rfc3339()
    );
  }

  Ok(())
}
