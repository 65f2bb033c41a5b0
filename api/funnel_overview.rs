use hyper::{HeaderMap, Method, StatusCode};
use vercel_runtime::{run, service_fn, Error, Request, Response, ResponseBody};

use xfunnel_rust::aggregator::{aggregate, AggregateConfig, MetricSet};
use xfunnel_rust::db::{
  count_response_analysis_rows, fetch_response_analysis_rows, get_pool, ResponseQueryFilter,
};
use xfunnel_rust::segments::{build_segments, calculate_change, rows_in_segment, TimeGranularity};

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

fn query_param(query: Option<&str>, key: &str) -> Option<String> {
  let q = query?;
  for pair in q.split('&') {
    let mut it = pair.splitn(2, '=');
    let k = it.next().unwrap_or("");
    let v = it.next().unwrap_or("");
    if k == key {
      return Some(v.replace('+', " "));
    }
  }
  None
}

fn metric_json(metrics: &MetricSet, previous: Option<&MetricSet>) -> serde_json::Value {
  let change = |cur: Option<f64>, prev: Option<f64>| -> serde_json::Value {
    match cur {
      Some(c) => serde_json::json!(calculate_change(c, prev)),
      None => serde_json::Value::Null,
    }
  };

  serde_json::json!({
    "mention_rate": metrics.mention_rate,
    "avg_position": metrics.avg_position,
    "feature_score": metrics.feature_score,
    "sentiment": metrics.sentiment,
    "record_count": metrics.record_count,
    "changes": {
      "mention_rate": change(metrics.mention_rate, previous.and_then(|p| p.mention_rate)),
      "avg_position": change(metrics.avg_position, previous.and_then(|p| p.avg_position)),
      "feature_score": change(metrics.feature_score, previous.and_then(|p| p.feature_score)),
      "sentiment": change(metrics.sentiment, previous.and_then(|p| p.sentiment)),
    },
  })
}

async fn handle_overview(
  method: &Method,
  headers: &HeaderMap,
  uri: &hyper::Uri,
) -> Result<Response<ResponseBody>, Error> {
  if method != Method::GET {
    return json_response(
      StatusCode::METHOD_NOT_ALLOWED,
      serde_json::json!({"ok": false, "error": "method_not_allowed"}),
    );
  }

  let expected = std::env::var("RUST_INTERNAL_TOKEN").unwrap_or_default();
  let provided = bearer_token(headers.get("authorization").and_then(|v| v.to_str().ok())).unwrap_or("");

  if expected.is_empty() || provided != expected {
    return json_response(
      StatusCode::UNAUTHORIZED,
      serde_json::json!({"ok": false, "error": "unauthorized"}),
    );
  }

  if !has_database_url() {
    return json_response(
      StatusCode::NOT_IMPLEMENTED,
      serde_json::json!({"ok": false, "error": "not_configured", "message": "Missing SUPABASE_DB_URL (or DATABASE_URL)"}),
    );
  }

  let company_id = query_param(uri.query(), "company_id").unwrap_or_default();
  if company_id.trim().is_empty() {
    return json_response(
      StatusCode::BAD_REQUEST,
      serde_json::json!({"ok": false, "error": "bad_request", "message": "company_id is required"}),
    );
  }

  let granularity = query_param(uri.query(), "granularity")
    .as_deref()
    .and_then(TimeGranularity::parse)
    .unwrap_or(TimeGranularity::Batch);

  let pool = get_pool().await?;

  // Cheap placeholder check before pulling the full result set.
  let total = match count_response_analysis_rows(pool, company_id.trim()).await {
    Ok(v) => v,
    Err(_) => {
      return json_response(
        StatusCode::BAD_GATEWAY,
        serde_json::json!({"ok": false, "error": "failed_to_load", "message": "failed to load response analysis"}),
      );
    }
  };
  if total == 0 {
    return json_response(
      StatusCode::OK,
      serde_json::json!({
        "ok": true,
        "company_id": company_id.trim(),
        "granularity": granularity.as_str(),
        "segments": 0,
        "current": serde_json::Value::Null,
      }),
    );
  }

  let rows = match fetch_response_analysis_rows(pool, company_id.trim(), &ResponseQueryFilter::default()).await {
    Ok(v) => v,
    Err(_) => {
      return json_response(
        StatusCode::BAD_GATEWAY,
        serde_json::json!({"ok": false, "error": "failed_to_load", "message": "failed to load response analysis"}),
      );
    }
  };

  let cfg = AggregateConfig::default();
  let segments = build_segments(&rows, granularity);
  let current_metrics = segments
    .first()
    .map(|seg| aggregate(&rows_in_segment(&rows, seg), &cfg).overall.total);
  let previous_metrics = segments
    .get(1)
    .map(|seg| aggregate(&rows_in_segment(&rows, seg), &cfg).overall.total);

  let current = match (segments.first(), current_metrics.as_ref()) {
    (Some(seg), Some(metrics)) => serde_json::json!({
      "key": seg.key,
      "label": seg.label,
      "start": seg.start.to_rfc3339(),
      "end": seg.end.to_rfc3339(),
      "record_count": seg.record_count,
      "metrics": metric_json(metrics, previous_metrics.as_ref()),
    }),
    _ => serde_json::Value::Null,
  };

  json_response(
    StatusCode::OK,
    serde_json::json!({
      "ok": true,
      "company_id": company_id.trim(),
      "granularity": granularity.as_str(),
      "segments": segments.len(),
      "current": current,
    }),
  )
}

async fn handler(req: Request) -> Result<Response<ResponseBody>, Error> {
  let method = req.method().clone();
  let headers = req.headers().clone();
  let uri = req.uri().clone();
  handle_overview(&method, &headers, &uri).await
}

#[tokio::main]
async fn main() -> Result<(), Error> {
  run(service_fn(handler)).await
}
