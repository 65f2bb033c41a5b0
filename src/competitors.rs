use indexmap::IndexMap;
use serde::Serialize;
use serde_json::Value;

use crate::db::ResponseAnalysisRow;
use crate::journey::stage_of;

pub fn parse_company_list_json(raw: Option<&str>) -> Vec<String> {
  let input = raw.unwrap_or("").trim();
  if input.is_empty() {
    return Vec::new();
  }

  let parsed: Value = match serde_json::from_str(input) {
    Ok(v) => v,
    Err(_) => return Vec::new(),
  };

  let arr = match parsed.as_array() {
    Some(v) => v,
    None => return Vec::new(),
  };

  arr.iter()
    .filter_map(|v| v.as_str())
    .map(|s| s.trim())
    .filter(|s| !s.is_empty())
    .map(|s| s.to_string())
    .collect()
}

pub fn normalize_aliases(primary: &str, aliases: &[String]) -> Vec<String> {
  let mut out: Vec<String> = Vec::new();

  let primary_norm = primary.trim();
  if !primary_norm.is_empty() {
    out.push(primary_norm.to_string());
  }

  for a in aliases.iter() {
    let a = a.trim();
    if a.is_empty() {
      continue;
    }
    if out.iter().any(|existing| existing.eq_ignore_ascii_case(a)) {
      continue;
    }
    out.push(a.to_string());
  }

  out
}

pub fn matches_any_case_insensitive(candidate: &str, needles: &[String]) -> bool {
  let candidate = candidate.trim();
  if candidate.is_empty() {
    return false;
  }
  needles.iter().any(|n| candidate.eq_ignore_ascii_case(n.trim()))
}

fn is_numbered_list_item(line: &str) -> bool {
  let mut seen_digit = false;
  let mut chars = line.chars().peekable();

  while let Some(ch) = chars.peek().copied() {
    if ch.is_ascii_digit() {
      seen_digit = true;
      chars.next();
      continue;
    }
    break;
  }

  if !seen_digit {
    return false;
  }

  let sep = chars.next().unwrap_or('\0');
  matches!(sep, '.' | ')' | ':')
}

fn strip_list_marker(line: &str) -> Option<&str> {
  for prefix in ["- ", "* ", "• "] {
    if let Some(rest) = line.strip_prefix(prefix) {
      return Some(rest.trim());
    }
  }

  if is_numbered_list_item(line) {
    let after_digits = line.trim_start_matches(|c: char| c.is_ascii_digit());
    let rest = after_digits
      .strip_prefix('.')
      .or_else(|| after_digits.strip_prefix(')'))
      .or_else(|| after_digits.strip_prefix(':'))
      .unwrap_or(after_digits);
    return Some(rest.trim());
  }

  None
}

// Position is the 1-based index among recognized list lines; prose lines
// between list items do not consume a position.
pub fn parse_rank_list(raw: &str) -> Vec<String> {
  let mut out = Vec::new();

  for raw_line in raw.lines() {
    let line = raw_line.trim();
    if line.is_empty() {
      continue;
    }

    let Some(name) = strip_list_marker(line) else {
      continue;
    };
    if name.is_empty() {
      continue;
    }
    out.push(name.to_string());
  }

  out
}

#[derive(Debug, Clone, Serialize)]
pub struct CompetitorStats {
  pub name: String,
  pub mentions: usize,
  pub mention_pct: f64,
  pub avg_position: Option<f64>,
  pub position_count: usize,
  pub is_self: bool,
}

impl CompetitorStats {
  fn new(name: &str, is_self: bool) -> CompetitorStats {
    CompetitorStats {
      name: name.to_string(),
      mentions: 0,
      mention_pct: 0.0,
      avg_position: None,
      position_count: 0,
      is_self,
    }
  }

  fn push_position(&mut self, position: f64) {
    let n = self.position_count as f64;
    let old_mean = self.avg_position.unwrap_or(0.0);
    self.avg_position = Some((old_mean * n + position) / (n + 1.0));
    self.position_count += 1;
  }
}

#[derive(Debug, Clone, Serialize)]
pub struct CompetitorBreakdown {
  pub competitors: Vec<CompetitorStats>,
  pub observed_responses: usize,
}

// Accumulates in first-seen order; callers sort by mention share with a
// stable sort so exact ties keep discovery order.
pub fn competitor_breakdown(
  rows: &[ResponseAnalysisRow],
  company_name: &str,
  brand_aliases: &[String],
) -> CompetitorBreakdown {
  let self_names = normalize_aliases(company_name, brand_aliases);
  let self_key = company_name.trim().to_ascii_lowercase();

  let mut stats: IndexMap<String, CompetitorStats> = IndexMap::new();
  let mut observed_responses = 0usize;

  for row in rows {
    let Some(stage) = stage_of(row.buying_journey_stage.as_deref()) else {
      continue;
    };

    if stage.is_early_stage() {
      observed_responses += 1;

      let mentioned = parse_company_list_json(row.mentioned_companies_json.as_deref());
      let mut self_credited = false;

      for name in mentioned.iter() {
        if matches_any_case_insensitive(name, &self_names) {
          if !self_credited {
            entry(&mut stats, &self_key, company_name, true).mentions += 1;
            self_credited = true;
          }
          continue;
        }
        entry(&mut stats, &name.to_ascii_lowercase(), name, false).mentions += 1;
      }

      if row.company_mentioned == Some(true) && !self_credited {
        entry(&mut stats, &self_key, company_name, true).mentions += 1;
      }
    } else if stage.is_position_stage() {
      let ranked = row
        .rank_list
        .as_deref()
        .map(parse_rank_list)
        .unwrap_or_default();
      if ranked.is_empty() {
        continue;
      }
      observed_responses += 1;

      for (idx, name) in ranked.iter().enumerate() {
        let position = (idx + 1) as f64;
        let stat = if matches_any_case_insensitive(name, &self_names) {
          entry(&mut stats, &self_key, company_name, true)
        } else {
          entry(&mut stats, &name.to_ascii_lowercase(), name, false)
        };
        stat.mentions += 1;
        stat.push_position(position);
      }
    }
  }

  let mut competitors: Vec<CompetitorStats> = stats.into_values().collect();
  if observed_responses > 0 {
    for stat in competitors.iter_mut() {
      stat.mention_pct = (stat.mentions as f64) * 100.0 / (observed_responses as f64);
    }
  }

  CompetitorBreakdown {
    competitors,
    observed_responses,
  }
}

fn entry<'a>(
  stats: &'a mut IndexMap<String, CompetitorStats>,
  key: &str,
  display_name: &str,
  is_self: bool,
) -> &'a mut CompetitorStats {
  stats
    .entry(key.to_string())
    .or_insert_with(|| CompetitorStats::new(display_name, is_self))
}

fn split_and_rank(breakdown: &CompetitorBreakdown) -> (Option<CompetitorStats>, Vec<CompetitorStats>) {
  let own = breakdown.competitors.iter().find(|c| c.is_self).cloned();
  let mut others: Vec<CompetitorStats> = breakdown
    .competitors
    .iter()
    .filter(|c| !c.is_self)
    .cloned()
    .collect();

  // Stable sort: equal percentages keep first-seen order.
  others.sort_by(|a, b| {
    b.mention_pct
      .partial_cmp(&a.mention_pct)
      .unwrap_or(std::cmp::Ordering::Equal)
  });

  (own, others)
}

pub fn capped_view(breakdown: &CompetitorBreakdown, cap: usize) -> Vec<CompetitorStats> {
  let (own, others) = split_and_rank(breakdown);

  let mut out = Vec::new();
  if let Some(own) = own {
    out.push(own);
  }

  for stat in others.iter().take(cap) {
    out.push(stat.clone());
  }

  let excluded = &others[others.len().min(cap)..];
  if !excluded.is_empty() {
    let mut rest = CompetitorStats::new("Rest", false);
    for stat in excluded {
      rest.mentions += stat.mentions;
      rest.mention_pct += stat.mention_pct;
    }
    out.push(rest);
  }

  out
}

pub fn rankings_view(breakdown: &CompetitorBreakdown, cap: usize) -> Vec<CompetitorStats> {
  let (own, others) = split_and_rank(breakdown);

  let mut out = Vec::new();
  if let Some(own) = own {
    out.push(own);
  }
  for stat in others.iter().take(cap) {
    out.push(stat.clone());
  }

  // Position-averaging a remainder group is not meaningful, so there is no
  // Rest entry here and unranked names drop out.
  out.retain(|stat| stat.avg_position.is_some());
  out
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::{TimeZone, Utc};

  fn base_row(query_id: &str, stage: &str) -> ResponseAnalysisRow {
    ResponseAnalysisRow {
      query_id: query_id.to_string(),
      answer_engine: "perplexity".to_string(),
      buying_journey_stage: Some(stage.to_string()),
      sentiment_score: None,
      ranking_position: None,
      company_mentioned: None,
      solution_analysis: None,
      geographic_region: None,
      icp_vertical: None,
      buyer_persona: None,
      rank_list: None,
      mentioned_companies_json: None,
      analysis_batch_id: None,
      created_at: Utc.with_ymd_and_hms(2025, 8, 4, 12, 0, 0).unwrap(),
    }
  }

  fn mention_row(query_id: &str, companies: &[&str], self_mentioned: bool) -> ResponseAnalysisRow {
    let mut row = base_row(query_id, "problem_exploration");
    row.company_mentioned = Some(self_mentioned);
    row.mentioned_companies_json = Some(serde_json::to_string(companies).unwrap());
    row
  }

  fn ranked_row(query_id: &str, rank_list: &str) -> ResponseAnalysisRow {
    let mut row = base_row(query_id, "solution_comparison");
    row.rank_list = Some(rank_list.to_string());
    row
  }

  #[test]
  fn parse_rank_list_strips_ordinal_markers() {
    let parsed = parse_rank_list("1. Acme\n2) Beta\n- Gamma\nSome prose line\n• Delta");
    assert_eq!(parsed, vec!["Acme", "Beta", "Gamma", "Delta"]);
  }

  #[test]
  fn parse_company_list_json_ignores_garbage() {
    assert!(parse_company_list_json(Some("not json")).is_empty());
    assert!(parse_company_list_json(Some("{\"a\":1}")).is_empty());
    assert_eq!(
      parse_company_list_json(Some(r#"["Acme", " Beta ", ""]"#)),
      vec!["Acme".to_string(), "Beta".to_string()]
    );
  }

  #[test]
  fn running_mean_matches_incremental_formula() {
    let mut stat = CompetitorStats::new("Acme", false);
    stat.push_position(1.0);
    stat.push_position(3.0);
    stat.push_position(5.0);
    assert_eq!(stat.position_count, 3);
    assert!((stat.avg_position.unwrap() - 3.0).abs() < 1e-9);
  }

  #[test]
  fn self_mentions_credit_once_per_record() {
    // Both the boolean and a listed alias point at the analyzed company;
    // one record must contribute one self mention.
    let rows = vec![mention_row("q1", &["Acme Corp", "Beta"], true)];
    let breakdown = competitor_breakdown(&rows, "Acme", &["Acme Corp".to_string()]);

    let own = breakdown.competitors.iter().find(|c| c.is_self).unwrap();
    assert_eq!(own.mentions, 1);
    assert_eq!(own.name, "Acme");
  }

  #[test]
  fn rank_list_positions_feed_running_means() {
    let rows = vec![
      ranked_row("q1", "1. Beta\n2. Acme\n3. Gamma"),
      ranked_row("q2", "1. Acme\n2. Beta"),
    ];
    let breakdown = competitor_breakdown(&rows, "Acme", &[]);

    let own = breakdown.competitors.iter().find(|c| c.is_self).unwrap();
    assert_eq!(own.position_count, 2);
    assert!((own.avg_position.unwrap() - 1.5).abs() < 1e-9);

    let beta = breakdown.competitors.iter().find(|c| c.name == "Beta").unwrap();
    assert!((beta.avg_position.unwrap() - 1.5).abs() < 1e-9);
  }

  #[test]
  fn capped_view_collapses_remainder_into_rest() {
    let mut rows = Vec::new();
    let counts: [(&str, usize); 8] = [
      ("C1", 40),
      ("C2", 20),
      ("C3", 10),
      ("C4", 8),
      ("C5", 6),
      ("C6", 4),
      ("C7", 3),
      ("C8", 2),
    ];
    let mut query = 0usize;
    for (name, count) in counts {
      for _ in 0..count {
        query += 1;
        rows.push(mention_row(&format!("q{query}"), &[name], true));
      }
    }

    let breakdown = competitor_breakdown(&rows, "Acme", &[]);
    let capped = capped_view(&breakdown, 5);

    assert!(capped[0].is_self);
    let names: Vec<&str> = capped[1..].iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, vec!["C1", "C2", "C3", "C4", "C5", "Rest"]);

    let rest = capped.last().unwrap();
    assert_eq!(rest.mentions, 5);
    let expected_pct = (3.0 + 2.0) * 100.0 / (breakdown.observed_responses as f64);
    assert!((rest.mention_pct - expected_pct).abs() < 1e-9);

    let rankings = rankings_view(&breakdown, 5);
    assert!(rankings.iter().all(|c| c.name != "Rest"));
  }

  #[test]
  fn unknown_stage_rows_are_skipped() {
    let mut row = mention_row("q1", &["Beta"], true);
    row.buying_journey_stage = None;
    let breakdown = competitor_breakdown(&[row], "Acme", &[]);
    assert!(breakdown.competitors.is_empty());
    assert_eq!(breakdown.observed_responses, 0);
  }
}
