use indexmap::IndexMap;
use serde::Serialize;
use tracing::warn;

use crate::db::ResponseAnalysisRow;
use crate::engines::{map_engine, ENGINE_KEYS};
use crate::journey::{stage_of, JourneyStage};
use crate::regions::display_region;

#[derive(Debug, Clone)]
pub struct AggregateConfig {
  pub normalize_regions: bool,
}

impl Default for AggregateConfig {
  fn default() -> Self {
    Self {
      normalize_regions: false,
    }
  }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct MetricSet {
  pub mention_rate: Option<f64>,
  pub avg_position: Option<f64>,
  pub feature_score: Option<f64>,
  pub sentiment: Option<f64>,
  pub record_count: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricRollup {
  pub total: MetricSet,
  pub by_region: IndexMap<String, MetricSet>,
  pub by_vertical: IndexMap<String, MetricSet>,
  pub by_persona: IndexMap<String, MetricSet>,
  pub by_query: IndexMap<String, MetricSet>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct FunnelReport {
  pub overall: MetricRollup,
  pub by_engine: IndexMap<String, MetricRollup>,
  pub stage_counts: IndexMap<String, usize>,
}

struct PreparedRecord<'a> {
  row: &'a ResponseAnalysisRow,
  engine: &'static str,
  stage: Option<JourneyStage>,
  position: Option<i32>,
  has_feature: Option<bool>,
}

fn parse_solution_analysis(raw: Option<&str>, query_id: &str) -> Option<bool> {
  let input = raw?.trim();
  if input.is_empty() {
    return None;
  }

  match serde_json::from_str::<serde_json::Value>(input) {
    Ok(value) => {
      let flag = value.get("has_feature").and_then(|f| f.as_str()).unwrap_or("");
      Some(flag.eq_ignore_ascii_case("yes"))
    }
    Err(err) => {
      warn!(query_id, error = %err, "skipping malformed solution_analysis payload");
      None
    }
  }
}

fn prepare(rows: &[ResponseAnalysisRow]) -> Vec<PreparedRecord<'_>> {
  rows
    .iter()
    .filter_map(|row| {
      let engine = map_engine(&row.answer_engine)?;
      Some(PreparedRecord {
        row,
        engine,
        stage: stage_of(row.buying_journey_stage.as_deref()),
        position: row.ranking_position.filter(|p| *p >= 1),
        has_feature: parse_solution_analysis(row.solution_analysis.as_deref(), &row.query_id),
      })
    })
    .collect()
}

fn mean(values: &[f64]) -> Option<f64> {
  if values.is_empty() {
    return None;
  }
  Some(values.iter().sum::<f64>() / (values.len() as f64))
}

// Average of already-aggregated values. Absent values are skipped, never
// counted as zero.
pub fn mean_of_defined(values: &[Option<f64>]) -> Option<f64> {
  let defined: Vec<f64> = values.iter().filter_map(|v| *v).collect();
  mean(&defined)
}

fn compute_metric_set(records: &[&PreparedRecord<'_>]) -> MetricSet {
  // Mention rate averages per-query rates: engines respond at different
  // rates per query, so record-weighted averaging would skew toward queries
  // with more responses.
  let mut engines_by_query: IndexMap<&str, IndexMap<&'static str, bool>> = IndexMap::new();
  for rec in records {
    if !rec.stage.is_some_and(|s| s.is_early_stage()) {
      continue;
    }
    let engines = engines_by_query.entry(rec.row.query_id.as_str()).or_default();
    let mentioned = rec.row.company_mentioned == Some(true);
    let slot = engines.entry(rec.engine).or_insert(false);
    *slot = *slot || mentioned;
  }
  let query_rates: Vec<f64> = engines_by_query
    .values()
    .map(|engines| {
      let mentioned = engines.values().filter(|m| **m).count();
      (mentioned as f64) / (engines.len() as f64)
    })
    .collect();

  let positions: Vec<f64> = records
    .iter()
    .filter(|rec| rec.stage.is_some_and(|s| s.is_position_stage()))
    .filter_map(|rec| rec.position.map(|p| p as f64))
    .collect();

  let feature_flags: Vec<bool> = records
    .iter()
    .filter(|rec| rec.stage.is_some_and(|s| s.is_evaluation_stage()))
    .filter_map(|rec| rec.has_feature)
    .collect();
  let feature_score = if feature_flags.is_empty() {
    None
  } else {
    let yes = feature_flags.iter().filter(|f| **f).count();
    Some((yes as f64) / (feature_flags.len() as f64))
  };

  let sentiments: Vec<f64> = records
    .iter()
    .filter_map(|rec| rec.row.sentiment_score)
    .collect();

  MetricSet {
    mention_rate: mean(&query_rates),
    avg_position: mean(&positions),
    feature_score,
    sentiment: mean(&sentiments),
    record_count: records.len(),
  }
}

fn dim_key(value: Option<&str>) -> String {
  match value.map(str::trim) {
    Some(v) if !v.is_empty() => v.to_string(),
    _ => "unknown".to_string(),
  }
}

fn group_by<'a, F>(records: &[&'a PreparedRecord<'a>], key_of: F) -> IndexMap<String, MetricSet>
where
  F: Fn(&PreparedRecord<'a>) -> String,
{
  let mut grouped: IndexMap<String, Vec<&PreparedRecord<'_>>> = IndexMap::new();
  for &rec in records {
    grouped.entry(key_of(rec)).or_default().push(rec);
  }

  grouped
    .into_iter()
    .map(|(key, members)| {
      let metrics = compute_metric_set(&members);
      (key, metrics)
    })
    .collect()
}

fn rollup(records: &[&PreparedRecord<'_>], cfg: &AggregateConfig) -> MetricRollup {
  let region_key = |rec: &PreparedRecord<'_>| {
    let raw = dim_key(rec.row.geographic_region.as_deref());
    if cfg.normalize_regions && raw != "unknown" {
      display_region(&raw)
    } else {
      raw
    }
  };

  MetricRollup {
    total: compute_metric_set(records),
    by_region: group_by(records, region_key),
    by_vertical: group_by(records, |rec| dim_key(rec.row.icp_vertical.as_deref())),
    by_persona: group_by(records, |rec| dim_key(rec.row.buyer_persona.as_deref())),
    by_query: group_by(records, |rec| rec.row.query_id.clone()),
  }
}

pub fn aggregate(rows: &[ResponseAnalysisRow], cfg: &AggregateConfig) -> FunnelReport {
  let prepared = prepare(rows);
  let refs: Vec<&PreparedRecord<'_>> = prepared.iter().collect();

  let overall = rollup(&refs, cfg);

  let mut by_engine = IndexMap::new();
  for key in ENGINE_KEYS {
    let subset: Vec<&PreparedRecord<'_>> = refs
      .iter()
      .copied()
      .filter(|rec| rec.engine == key)
      .collect();
    if subset.is_empty() {
      continue;
    }
    by_engine.insert(key.to_string(), rollup(&subset, cfg));
  }

  let mut stage_counts: IndexMap<String, usize> = IndexMap::new();
  for stage in JourneyStage::ALL {
    stage_counts.insert(stage.as_str().to_string(), 0);
  }
  for rec in refs.iter() {
    let key = rec.stage.map(|s| s.as_str()).unwrap_or("unknown");
    *stage_counts.entry(key.to_string()).or_insert(0) += 1;
  }

  FunnelReport {
    overall,
    by_engine,
    stage_counts,
  }
}
