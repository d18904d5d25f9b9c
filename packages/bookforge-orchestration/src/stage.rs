use crate::error::{OrchestratorError, Result};
use serde::{Deserialize, Serialize};

/// Pipeline state identifier.
///
/// The declaration order is the execution order. `Done` is terminal and has
/// no executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StageId {
    Plan,
    Research,
    Write,
    Polish,
    Illustrate,
    Format,
    QaFact,
    Affiliate,
    QaHtml,
    Done,
}

impl StageId {
    /// Every state, in order, including `Done`
    pub const ALL: [StageId; 10] = [
        StageId::Plan,
        StageId::Research,
        StageId::Write,
        StageId::Polish,
        StageId::Illustrate,
        StageId::Format,
        StageId::QaFact,
        StageId::Affiliate,
        StageId::QaHtml,
        StageId::Done,
    ];

    /// States that run an executor, in order
    pub const PIPELINE: [StageId; 9] = [
        StageId::Plan,
        StageId::Research,
        StageId::Write,
        StageId::Polish,
        StageId::Illustrate,
        StageId::Format,
        StageId::QaFact,
        StageId::Affiliate,
        StageId::QaHtml,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StageId::Plan => "PLAN",
            StageId::Research => "RESEARCH",
            StageId::Write => "WRITE",
            StageId::Polish => "POLISH",
            StageId::Illustrate => "ILLUSTRATE",
            StageId::Format => "FORMAT",
            StageId::QaFact => "QA_FACT",
            StageId::Affiliate => "AFFILIATE",
            StageId::QaHtml => "QA_HTML",
            StageId::Done => "DONE",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        StageId::ALL
            .iter()
            .copied()
            .find(|stage| stage.as_str() == s)
            .ok_or_else(|| OrchestratorError::parse(format!("Invalid stage ID: {}", s)))
    }

    /// Position in the declared order
    pub fn ordinal(&self) -> usize {
        *self as usize
    }

    /// Following state; `None` for `Done`
    pub fn next(&self) -> Option<StageId> {
        StageId::ALL.get(self.ordinal() + 1).copied()
    }

    pub fn is_terminal(&self) -> bool {
        *self == StageId::Done
    }

    /// State that follows a sequence of completed stages.
    ///
    /// Fails unless `steps` is exactly a prefix of `PIPELINE`.
    pub fn after_steps<S: AsRef<str>>(steps: &[S]) -> Result<StageId> {
        if steps.len() > StageId::PIPELINE.len() {
            return Err(OrchestratorError::InvalidManifest(format!(
                "{} completed steps, pipeline has {}",
                steps.len(),
                StageId::PIPELINE.len()
            )));
        }

        for (position, (step, expected)) in steps.iter().zip(StageId::PIPELINE).enumerate() {
            if step.as_ref() != expected.as_str() {
                return Err(OrchestratorError::InvalidManifest(format!(
                    "step {} is {}, expected {}",
                    position,
                    step.as_ref(),
                    expected
                )));
            }
        }

        Ok(StageId::ALL[steps.len()])
    }
}

impl std::fmt::Display for StageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_id_roundtrip() {
        for stage in &StageId::ALL {
            let parsed = StageId::from_str(stage.as_str()).unwrap();
            assert_eq!(*stage, parsed);
        }
        assert!(StageId::from_str("L1_IR").is_err());
    }

    #[test]
    fn test_serde_names_match_as_str() {
        let json = serde_json::to_string(&StageId::QaHtml).unwrap();
        assert_eq!(json, "\"QA_HTML\"");
        let parsed: StageId = serde_json::from_str("\"QA_FACT\"").unwrap();
        assert_eq!(parsed, StageId::QaFact);
    }

    #[test]
    fn test_next_walks_declared_order() {
        let mut walked = vec![StageId::Plan];
        let mut current = StageId::Plan;
        while let Some(next) = current.next() {
            walked.push(next);
            current = next;
        }
        assert_eq!(walked, StageId::ALL.to_vec());
        assert!(StageId::Done.is_terminal());
    }

    #[test]
    fn test_after_steps() {
        let none: [&str; 0] = [];
        assert_eq!(StageId::after_steps(&none).unwrap(), StageId::Plan);
        assert_eq!(
            StageId::after_steps(&["PLAN", "RESEARCH"]).unwrap(),
            StageId::Write
        );

        let all: Vec<&str> = StageId::PIPELINE.iter().map(|s| s.as_str()).collect();
        assert_eq!(StageId::after_steps(&all).unwrap(), StageId::Done);
    }

    #[test]
    fn test_after_steps_rejects_gaps_and_duplicates() {
        assert!(StageId::after_steps(&["PLAN", "WRITE"]).is_err());
        assert!(StageId::after_steps(&["PLAN", "PLAN"]).is_err());
        assert!(StageId::after_steps(&["RESEARCH"]).is_err());
    }
}
