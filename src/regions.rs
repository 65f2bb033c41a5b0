pub fn display_region(raw: &str) -> String {
  let trimmed = raw.trim();
  let folded = trimmed.to_ascii_lowercase().replace([' ', '-'], "_");

  match folded.as_str() {
    "na" | "north_america" | "americas" | "us" | "usa" | "united_states" => "North America".to_string(),
    "emea" | "europe_middle_east_africa" => "EMEA".to_string(),
    "europe" | "eu" => "Europe".to_string(),
    "apac" | "asia_pacific" => "APAC".to_string(),
    "latam" | "latin_america" => "LATAM".to_string(),
    "" => "unknown".to_string(),
    _ => trimmed.to_string(),
  }
}
