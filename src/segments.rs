use chrono::{DateTime, Datelike, Duration, Months, NaiveDate, TimeZone, Utc};
use indexmap::IndexMap;
use serde::Serialize;

use crate::db::ResponseAnalysisRow;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeGranularity {
  Batch,
  Week,
  Month,
}

impl TimeGranularity {
  pub fn parse(raw: &str) -> Option<TimeGranularity> {
    match raw.trim().to_ascii_lowercase().as_str() {
      "batch" => Some(TimeGranularity::Batch),
      "week" | "weekly" => Some(TimeGranularity::Week),
      "month" | "monthly" => Some(TimeGranularity::Month),
      _ => None,
    }
  }

  pub fn as_str(self) -> &'static str {
    match self {
      TimeGranularity::Batch => "batch",
      TimeGranularity::Week => "week",
      TimeGranularity::Month => "month",
    }
  }
}

#[derive(Debug, Clone, Serialize)]
pub struct TimeSegment {
  pub granularity: TimeGranularity,
  pub key: String,
  pub label: String,
  pub start: DateTime<Utc>,
  pub end: DateTime<Utc>,
  pub record_count: usize,
}

fn batch_key(raw: Option<&str>) -> String {
  match raw.map(str::trim) {
    Some(v) if !v.is_empty() => v.to_string(),
    _ => "unknown".to_string(),
  }
}

fn week_start_of(date: NaiveDate) -> NaiveDate {
  date - Duration::days(date.weekday().num_days_from_monday() as i64)
}

fn day_start_utc(date: NaiveDate) -> DateTime<Utc> {
  Utc
    .with_ymd_and_hms(date.year(), date.month(), date.day(), 0, 0, 0)
    .single()
    .unwrap_or_else(Utc::now)
}

fn build_batch_segments(rows: &[ResponseAnalysisRow]) -> Vec<TimeSegment> {
  let mut batches: IndexMap<String, (DateTime<Utc>, DateTime<Utc>, usize)> = IndexMap::new();
  for row in rows {
    let key = batch_key(row.analysis_batch_id.as_deref());
    let entry = batches
      .entry(key)
      .or_insert((row.created_at, row.created_at, 0));
    entry.0 = entry.0.min(row.created_at);
    entry.1 = entry.1.max(row.created_at);
    entry.2 += 1;
  }

  let mut segments: Vec<TimeSegment> = batches
    .into_iter()
    .map(|(key, (start, end, record_count))| TimeSegment {
      granularity: TimeGranularity::Batch,
      key,
      label: String::new(),
      start,
      end,
      record_count,
    })
    .collect();

  segments.sort_by(|a, b| b.end.cmp(&a.end));

  // Several ingestion runs can land on one calendar day; only then does the
  // label need a time-of-day suffix.
  let mut per_day: IndexMap<NaiveDate, usize> = IndexMap::new();
  for seg in segments.iter() {
    *per_day.entry(seg.end.date_naive()).or_insert(0) += 1;
  }
  for seg in segments.iter_mut() {
    let day = seg.end.date_naive();
    let ambiguous = per_day.get(&day).copied().unwrap_or(0) > 1;
    seg.label = if ambiguous {
      format!(
        "{} ({} responses)",
        seg.end.format("%b %-d %H:%M"),
        seg.record_count
      )
    } else {
      format!("{} ({} responses)", seg.end.format("%b %-d"), seg.record_count)
    };
  }

  segments
}

fn build_week_segments(rows: &[ResponseAnalysisRow]) -> Vec<TimeSegment> {
  let mut weeks: IndexMap<NaiveDate, usize> = IndexMap::new();
  for row in rows {
    *weeks
      .entry(week_start_of(row.created_at.date_naive()))
      .or_insert(0) += 1;
  }

  let mut segments: Vec<TimeSegment> = weeks
    .into_iter()
    .map(|(week_start, record_count)| {
      let start = day_start_utc(week_start);
      let end = start + Duration::days(7) - Duration::seconds(1);
      let week_of_month = week_start.day0() / 7 + 1;
      TimeSegment {
        granularity: TimeGranularity::Week,
        key: week_start.to_string(),
        label: format!("{} Week {}", start.format("%b"), week_of_month),
        start,
        end,
        record_count,
      }
    })
    .collect();

  segments.sort_by(|a, b| b.start.cmp(&a.start));
  segments
}

fn build_month_segments(rows: &[ResponseAnalysisRow]) -> Vec<TimeSegment> {
  let mut months: IndexMap<NaiveDate, usize> = IndexMap::new();
  for row in rows {
    let date = row.created_at.date_naive();
    let first = date.with_day(1).unwrap_or(date);
    *months.entry(first).or_insert(0) += 1;
  }

  let mut segments: Vec<TimeSegment> = months
    .into_iter()
    .map(|(first, record_count)| {
      let start = day_start_utc(first);
      let next_month = first.checked_add_months(Months::new(1)).unwrap_or(first);
      let end = day_start_utc(next_month) - Duration::seconds(1);
      TimeSegment {
        granularity: TimeGranularity::Month,
        key: first.format("%Y-%m").to_string(),
        label: start.format("%B %Y").to_string(),
        start,
        end,
        record_count,
      }
    })
    .collect();

  segments.sort_by(|a, b| b.start.cmp(&a.start));
  segments
}

pub fn build_segments(rows: &[ResponseAnalysisRow], granularity: TimeGranularity) -> Vec<TimeSegment> {
  match granularity {
    TimeGranularity::Batch => build_batch_segments(rows),
    TimeGranularity::Week => build_week_segments(rows),
    TimeGranularity::Month => build_month_segments(rows),
  }
}

pub fn rows_in_segment(rows: &[ResponseAnalysisRow], segment: &TimeSegment) -> Vec<ResponseAnalysisRow> {
  rows
    .iter()
    .filter(|row| match segment.granularity {
      TimeGranularity::Batch => batch_key(row.analysis_batch_id.as_deref()) == segment.key,
      _ => row.created_at >= segment.start && row.created_at <= segment.end,
    })
    .cloned()
    .collect()
}

pub fn calculate_change(current: f64, previous: Option<f64>) -> f64 {
  match previous {
    Some(prev) if prev > 0.0 => ((current - prev) / prev) * 100.0,
    _ => {
      if current > 0.0 {
        100.0
      } else {
        0.0
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn row_at(batch_id: Option<&str>, at: DateTime<Utc>) -> ResponseAnalysisRow {
    ResponseAnalysisRow {
      query_id: "q".to_string(),
      answer_engine: "perplexity".to_string(),
      buying_journey_stage: Some("problem_exploration".to_string()),
      sentiment_score: None,
      ranking_position: None,
      company_mentioned: Some(true),
      solution_analysis: None,
      geographic_region: None,
      icp_vertical: None,
      buyer_persona: None,
      rank_list: None,
      mentioned_companies_json: None,
      analysis_batch_id: batch_id.map(|b| b.to_string()),
      created_at: at,
    }
  }

  fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
  }

  #[test]
  fn batch_segments_sort_newest_first() {
    let rows = vec![
      row_at(Some("b1"), at(2025, 8, 1, 10, 0)),
      row_at(Some("b2"), at(2025, 8, 3, 10, 0)),
      row_at(Some("b2"), at(2025, 8, 3, 11, 0)),
    ];

    let segments = build_segments(&rows, TimeGranularity::Batch);
    assert_eq!(segments.len(), 2);
    assert_eq!(segments[0].key, "b2");
    assert_eq!(segments[0].record_count, 2);
    assert_eq!(segments[1].key, "b1");
  }

  #[test]
  fn same_day_batches_get_time_disambiguated_labels() {
    let rows = vec![
      row_at(Some("b1"), at(2025, 8, 3, 9, 15)),
      row_at(Some("b2"), at(2025, 8, 3, 17, 40)),
      row_at(Some("b3"), at(2025, 8, 1, 8, 0)),
    ];

    let segments = build_segments(&rows, TimeGranularity::Batch);
    let labels: Vec<&str> = segments.iter().map(|s| s.label.as_str()).collect();

    assert_eq!(labels[0], "Aug 3 17:40 (1 responses)");
    assert_eq!(labels[1], "Aug 3 09:15 (1 responses)");
    // A lone batch on its day keeps the short label.
    assert_eq!(labels[2], "Aug 1 (1 responses)");
    assert_ne!(labels[0], labels[1]);
  }

  #[test]
  fn missing_batch_id_groups_under_unknown() {
    let rows = vec![
      row_at(None, at(2025, 8, 2, 10, 0)),
      row_at(Some(""), at(2025, 8, 2, 11, 0)),
    ];

    let segments = build_segments(&rows, TimeGranularity::Batch);
    assert_eq!(segments.len(), 1);
    assert_eq!(segments[0].key, "unknown");
    assert_eq!(segments[0].record_count, 2);
  }

  #[test]
  fn week_windows_are_monday_aligned_and_inclusive() {
    let rows = vec![row_at(Some("b1"), at(2025, 8, 6, 12, 0))];

    let segments = build_segments(&rows, TimeGranularity::Week);
    assert_eq!(segments.len(), 1);
    let seg = &segments[0];
    assert_eq!(seg.start, at(2025, 8, 4, 0, 0));
    assert_eq!(seg.end, Utc.with_ymd_and_hms(2025, 8, 10, 23, 59, 59).unwrap());
    assert_eq!(seg.label, "Aug Week 1");

    // Sunday of the same week lands in the same segment.
    let sunday = row_at(Some("b1"), Utc.with_ymd_and_hms(2025, 8, 10, 23, 59, 59).unwrap());
    assert_eq!(rows_in_segment(&[sunday], seg).len(), 1);
  }

  #[test]
  fn month_segments_use_calendar_boundaries() {
    let rows = vec![
      row_at(Some("b1"), at(2025, 7, 31, 23, 0)),
      row_at(Some("b2"), at(2025, 8, 1, 0, 30)),
    ];

    let segments = build_segments(&rows, TimeGranularity::Month);
    assert_eq!(segments.len(), 2);
    assert_eq!(segments[0].label, "August 2025");
    assert_eq!(segments[1].label, "July 2025");
    assert_eq!(segments[0].start, at(2025, 8, 1, 0, 0));
    assert_eq!(
      segments[1].end,
      Utc.with_ymd_and_hms(2025, 7, 31, 23, 59, 59).unwrap()
    );
  }

  #[test]
  fn segments_partition_the_row_set() {
    let rows = vec![
      row_at(Some("b1"), at(2025, 7, 28, 10, 0)),
      row_at(Some("b2"), at(2025, 8, 4, 10, 0)),
      row_at(None, at(2025, 8, 5, 10, 0)),
    ];

    for granularity in [TimeGranularity::Batch, TimeGranularity::Week, TimeGranularity::Month] {
      let segments = build_segments(&rows, granularity);
      let scoped_total: usize = segments
        .iter()
        .map(|seg| rows_in_segment(&rows, seg).len())
        .sum();
      assert_eq!(scoped_total, rows.len(), "granularity {:?}", granularity);
    }
  }

  #[test]
  fn change_against_missing_or_zero_previous_is_bounded() {
    assert_eq!(calculate_change(5.0, None), 100.0);
    assert_eq!(calculate_change(0.0, None), 0.0);
    assert_eq!(calculate_change(5.0, Some(0.0)), 100.0);
    assert!((calculate_change(10.0, Some(5.0)) - 100.0).abs() < 1e-9);
    assert!((calculate_change(4.0, Some(5.0)) + 20.0).abs() < 1e-9);
  }
}
