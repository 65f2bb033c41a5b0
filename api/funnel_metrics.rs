use bytes::Bytes;
use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Utc};
use http_body_util::BodyExt;
use hyper::{HeaderMap, Method, StatusCode};
use serde::Deserialize;
use vercel_runtime::{run, service_fn, Error, Request, Response, ResponseBody};

use xfunnel_rust::aggregator::{aggregate, mean_of_defined, AggregateConfig, MetricSet};
use xfunnel_rust::competitors::{capped_view, competitor_breakdown, rankings_view};
use xfunnel_rust::db::{fetch_response_analysis_rows, get_pool, ResponseQueryFilter};
use xfunnel_rust::segments::{build_segments, calculate_change, rows_in_segment, TimeGranularity};

const DEFAULT_COMPETITOR_CAP: usize = 5;

fn bearer_token(header_value: Option<&str>) -> Option<&str> {
  let value = header_value?;
  value.strip_prefix("Bearer ").or_else(|| value.strip_prefix("bearer "))
}

fn json_response(status: StatusCode, value: serde_json::Value) -> Result<Response<ResponseBody>, Error> {
  Ok(
    Response::builder()
      .status(status)
      .header("content-type", "application/json; charset=utf-8")
      .body(ResponseBody::from(value))?,
  )
}

fn has_database_url() -> bool {
  std::env::var("SUPABASE_DB_URL")
    .or_else(|_| std::env::var("DATABASE_URL"))
    .map(|v| !v.is_empty())
    .unwrap_or(false)
}

fn required_string(input: Option<String>, field: &str) -> Result<String, Error> {
  let value = input.unwrap_or_default().trim().to_string();
  if value.is_empty() {
    return Err(Box::new(std::io::Error::other(format!(
      "{field} is required"
    ))));
  }
  Ok(value)
}

fn parse_dt(input: &str) -> Option<NaiveDate> {
  NaiveDate::parse_from_str(input.trim(), "%Y-%m-%d").ok()
}

fn day_start(date: NaiveDate) -> Option<DateTime<Utc>> {
  Utc
    .with_ymd_and_hms(date.year(), date.month(), date.day(), 0, 0, 0)
    .single()
}

#[derive(Deserialize)]
struct FunnelRpcRequest {
  op: String,
  #[serde(default)]
  company_id: Option<String>,
  #[serde(default)]
  company_name: Option<String>,
  #[serde(default)]
  brand_aliases: Option<Vec<String>>,
  #[serde(default)]
  granularity: Option<String>,
  #[serde(default)]
  geographic_region: Option<String>,
  #[serde(default)]
  icp_vertical: Option<String>,
  #[serde(default)]
  analysis_batch_id: Option<String>,
  #[serde(default)]
  start_dt: Option<String>,
  #[serde(default)]
  end_dt: Option<String>,
  #[serde(default)]
  competitor_cap: Option<usize>,
  #[serde(default)]
  normalize_regions: Option<bool>,
}

fn filter_from_request(parsed: &FunnelRpcRequest) -> ResponseQueryFilter {
  let created_from = parsed
    .start_dt
    .as_deref()
    .and_then(parse_dt)
    .and_then(day_start);
  let created_to = parsed
    .end_dt
    .as_deref()
    .and_then(parse_dt)
    .and_then(day_start)
    .map(|dt| dt + chrono::Duration::days(1) - chrono::Duration::seconds(1));

  ResponseQueryFilter {
    geographic_region: parsed
      .geographic_region
      .clone()
      .filter(|v| !v.trim().is_empty()),
    icp_vertical: parsed.icp_vertical.clone().filter(|v| !v.trim().is_empty()),
    analysis_batch_id: parsed
      .analysis_batch_id
      .clone()
      .filter(|v| !v.trim().is_empty()),
    created_from,
    created_to,
  }
}

fn rounded_pct(rate: Option<f64>) -> serde_json::Value {
  match rate {
    Some(v) => serde_json::json!((v * 100.0).round() as i64),
    None => serde_json::Value::Null,
  }
}

fn metric_changes(current: &MetricSet, previous: Option<&MetricSet>) -> serde_json::Value {
  let change = |cur: Option<f64>, prev: Option<f64>| -> serde_json::Value {
    match cur {
      Some(c) => serde_json::json!(calculate_change(c, prev)),
      None => serde_json::Value::Null,
    }
  };

  serde_json::json!({
    "mention_rate": change(current.mention_rate, previous.and_then(|p| p.mention_rate)),
    "avg_position": change(current.avg_position, previous.and_then(|p| p.avg_position)),
    "feature_score": change(current.feature_score, previous.and_then(|p| p.feature_score)),
    "sentiment": change(current.sentiment, previous.and_then(|p| p.sentiment)),
  })
}

async fn handle_funnel_metrics(
  method: &Method,
  headers: &HeaderMap,
  body: Bytes,
) -> Result<Response<ResponseBody>, Error> {
  let expected = std::env::var("RUST_INTERNAL_TOKEN").unwrap_or_default();
  let provided = bearer_token(headers.get("authorization").and_then(|v| v.to_str().ok())).unwrap_or("");

  if expected.is_empty() || provided != expected {
    return json_response(
      StatusCode::UNAUTHORIZED,
      serde_json::json!({"ok": false, "error": "unauthorized"}),
    );
  }

  if method != Method::POST {
    return json_response(
      StatusCode::METHOD_NOT_ALLOWED,
      serde_json::json!({"ok": false, "error": "method_not_allowed"}),
    );
  }

  if !has_database_url() {
    return json_response(
      StatusCode::NOT_IMPLEMENTED,
      serde_json::json!({"ok": false, "error": "not_configured", "message": "Missing SUPABASE_DB_URL (or DATABASE_URL)"}),
    );
  }

  let parsed: FunnelRpcRequest = serde_json::from_slice(&body).map_err(|e| -> Error {
    Box::new(std::io::Error::other(format!("invalid json body: {e}")))
  })?;

  let company_id = match required_string(parsed.company_id.clone(), "company_id") {
    Ok(v) => v,
    Err(_) => {
      return json_response(
        StatusCode::BAD_REQUEST,
        serde_json::json!({"ok": false, "error": "bad_request", "message": "company_id is required"}),
      )
    }
  };

  let pool = get_pool().await?;
  let filter = filter_from_request(&parsed);

  let rows = match fetch_response_analysis_rows(pool, &company_id, &filter).await {
    Ok(v) => v,
    Err(_) => {
      // Never aggregate over a partial result set.
      return json_response(
        StatusCode::BAD_GATEWAY,
        serde_json::json!({"ok": false, "error": "failed_to_load", "message": "failed to load response analysis"}),
      );
    }
  };

  let cfg = AggregateConfig {
    normalize_regions: parsed.normalize_regions.unwrap_or(false),
  };

  match parsed.op.as_str() {
    "overview" => {
      let report = aggregate(&rows, &cfg);
      let summary = serde_json::json!({
        "mention_rate_pct": rounded_pct(report.overall.total.mention_rate),
        "feature_score_pct": rounded_pct(report.overall.total.feature_score),
        "avg_position": report.overall.total.avg_position,
        "sentiment": report.overall.total.sentiment,
        "record_count": report.overall.total.record_count,
      });

      json_response(
        StatusCode::OK,
        serde_json::json!({
          "ok": true,
          "company_id": company_id,
          "rows": rows.len(),
          "summary": summary,
          "report": serde_json::to_value(&report)?,
        }),
      )
    }

    "segments" => {
      let granularity = parsed
        .granularity
        .as_deref()
        .and_then(TimeGranularity::parse)
        .unwrap_or(TimeGranularity::Batch);

      let segments = build_segments(&rows, granularity);
      let reports: Vec<MetricSet> = segments
        .iter()
        .map(|seg| aggregate(&rows_in_segment(&rows, seg), &cfg).overall.total)
        .collect();

      let mut payload = Vec::with_capacity(segments.len());
      for (idx, seg) in segments.iter().enumerate() {
        let current = &reports[idx];
        // Segments are sorted newest first, so "previous" is the next index.
        let previous = reports.get(idx + 1);
        payload.push(serde_json::json!({
          "key": seg.key,
          "label": seg.label,
          "start": seg.start.to_rfc3339(),
          "end": seg.end.to_rfc3339(),
          "record_count": seg.record_count,
          "metrics": serde_json::to_value(current)?,
          "changes": metric_changes(current, previous),
        }));
      }

      // Period averages skip segments with no qualifying records instead of
      // dragging the mean toward zero.
      let period_averages = serde_json::json!({
        "mention_rate": mean_of_defined(&reports.iter().map(|m| m.mention_rate).collect::<Vec<_>>()),
        "avg_position": mean_of_defined(&reports.iter().map(|m| m.avg_position).collect::<Vec<_>>()),
        "feature_score": mean_of_defined(&reports.iter().map(|m| m.feature_score).collect::<Vec<_>>()),
        "sentiment": mean_of_defined(&reports.iter().map(|m| m.sentiment).collect::<Vec<_>>()),
      });

      json_response(
        StatusCode::OK,
        serde_json::json!({
          "ok": true,
          "company_id": company_id,
          "granularity": granularity.as_str(),
          "period_averages": period_averages,
          "segments": payload,
        }),
      )
    }

    "competitors" => {
      let company_name = match required_string(parsed.company_name.clone(), "company_name") {
        Ok(v) => v,
        Err(_) => {
          return json_response(
            StatusCode::BAD_REQUEST,
            serde_json::json!({"ok": false, "error": "bad_request", "message": "company_name is required"}),
          )
        }
      };

      let aliases = parsed.brand_aliases.clone().unwrap_or_default();
      let cap = parsed.competitor_cap.unwrap_or(DEFAULT_COMPETITOR_CAP).clamp(1, 25);

      let breakdown = competitor_breakdown(&rows, &company_name, &aliases);
      json_response(
        StatusCode::OK,
        serde_json::json!({
          "ok": true,
          "company_id": company_id,
          "observed_responses": breakdown.observed_responses,
          "mentions": serde_json::to_value(capped_view(&breakdown, cap))?,
          "rankings": serde_json::to_value(rankings_view(&breakdown, cap))?,
        }),
      )
    }

    other => json_response(
      StatusCode::BAD_REQUEST,
      serde_json::json!({"ok": false, "error": "bad_request", "message": format!("unknown op: {other}")}),
    ),
  }
}

async fn handler(req: Request) -> Result<Response<ResponseBody>, Error> {
  let method = req.method().clone();
  let headers = req.headers().clone();
  let bytes = req.into_body().collect().await?.to_bytes();
  handle_funnel_metrics(&method, &headers, bytes).await
}

#[tokio::main]
async fn main() -> Result<(), Error> {
  run(service_fn(handler)).await
}
