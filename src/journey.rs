#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JourneyStage {
  ProblemExploration,
  SolutionEducation,
  SolutionComparison,
  SolutionEvaluation,
  FinalResearch,
}

impl JourneyStage {
  pub const ALL: [JourneyStage; 5] = [
    JourneyStage::ProblemExploration,
    JourneyStage::SolutionEducation,
    JourneyStage::SolutionComparison,
    JourneyStage::SolutionEvaluation,
    JourneyStage::FinalResearch,
  ];

  pub fn parse(raw: &str) -> Option<JourneyStage> {
    match raw.trim().to_ascii_lowercase().as_str() {
      "problem_exploration" => Some(JourneyStage::ProblemExploration),
      "solution_education" => Some(JourneyStage::SolutionEducation),
      "solution_comparison" => Some(JourneyStage::SolutionComparison),
      "solution_evaluation" => Some(JourneyStage::SolutionEvaluation),
      "final_research" => Some(JourneyStage::FinalResearch),
      _ => None,
    }
  }

  pub fn as_str(self) -> &'static str {
    match self {
      JourneyStage::ProblemExploration => "problem_exploration",
      JourneyStage::SolutionEducation => "solution_education",
      JourneyStage::SolutionComparison => "solution_comparison",
      JourneyStage::SolutionEvaluation => "solution_evaluation",
      JourneyStage::FinalResearch => "final_research",
    }
  }

  pub fn is_early_stage(self) -> bool {
    matches!(
      self,
      JourneyStage::ProblemExploration | JourneyStage::SolutionEducation
    )
  }

  pub fn is_position_stage(self) -> bool {
    matches!(
      self,
      JourneyStage::SolutionComparison | JourneyStage::FinalResearch
    )
  }

  pub fn is_evaluation_stage(self) -> bool {
    matches!(self, JourneyStage::SolutionEvaluation)
  }
}

pub fn stage_of(raw: Option<&str>) -> Option<JourneyStage> {
  raw.and_then(JourneyStage::parse)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parses_all_stage_names_case_insensitive() {
    for stage in JourneyStage::ALL {
      assert_eq!(JourneyStage::parse(stage.as_str()), Some(stage));
      assert_eq!(JourneyStage::parse(&stage.as_str().to_uppercase()), Some(stage));
    }
  }

  #[test]
  fn unknown_stage_parses_to_none() {
    assert_eq!(JourneyStage::parse("awareness"), None);
    assert_eq!(stage_of(None), None);
    assert_eq!(stage_of(Some("")), None);
  }

  #[test]
  fn stage_gates_match_metric_membership() {
    assert!(JourneyStage::ProblemExploration.is_early_stage());
    assert!(JourneyStage::SolutionEducation.is_early_stage());
    assert!(!JourneyStage::SolutionComparison.is_early_stage());

    assert!(JourneyStage::SolutionComparison.is_position_stage());
    assert!(JourneyStage::FinalResearch.is_position_stage());
    assert!(!JourneyStage::SolutionEvaluation.is_position_stage());

    assert!(JourneyStage::SolutionEvaluation.is_evaluation_stage());
    assert!(!JourneyStage::FinalResearch.is_evaluation_stage());
  }
}
