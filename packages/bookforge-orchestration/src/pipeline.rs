use crate::cost::Usd;
use crate::error::{OrchestratorError, Result};
use crate::stage::StageId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Stage context passed to handlers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageContext {
    pub run_id: String,
    pub topic: String,
    pub stage: StageId,
    /// 1-based attempt number of this stage
    pub attempt: u32,
    /// Results of the stages completed so far, keyed by stage name
    #[serde(default)]
    pub outputs: BTreeMap<String, serde_json::Value>,
}

impl StageContext {
    /// Output of an earlier stage
    pub fn output_of(&self, stage: StageId) -> Option<&serde_json::Value> {
        self.outputs.get(stage.as_str())
    }
}

/// One metered call made while executing a stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub service: String,
    pub cost_usd: f64,
}

impl Usage {
    pub fn new(service: impl Into<String>, cost_usd: f64) -> Self {
        Self {
            service: service.into(),
            cost_usd,
        }
    }

    pub fn cost(&self) -> Usd {
        Usd::from_dollars(self.cost_usd)
    }
}

/// Stage output
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageOutput {
    /// Result handed to later stages (ids, paths, counts)
    #[serde(default)]
    pub data: serde_json::Value,
    /// Quality score, evaluated against the stage's gate if one is declared
    #[serde(default)]
    pub score: Option<f64>,
    #[serde(default)]
    pub usage: Vec<Usage>,
}

impl StageOutput {
    pub fn new(data: serde_json::Value) -> Self {
        Self {
            data,
            score: None,
            usage: Vec::new(),
        }
    }

    pub fn with_score(mut self, score: f64) -> Self {
        self.score = Some(score);
        self
    }

    pub fn with_usage(mut self, usage: Usage) -> Self {
        self.usage.push(usage);
        self
    }
}

/// Stage handler trait (pluggable stages)
#[async_trait]
pub trait StageHandler: Send + Sync {
    /// Stage identifier
    fn stage_id(&self) -> StageId;

    /// Metered external service this stage calls, if any.
    ///
    /// Admission for the stage goes through the rate limiter under this name.
    fn service(&self) -> Option<&str> {
        None
    }

    /// Execute stage
    async fn execute(&self, ctx: &StageContext) -> Result<StageOutput>;
}

/// Minimum score a stage result must reach
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityGate {
    pub name: String,
    pub min_score: f64,
}

impl QualityGate {
    pub fn new(name: impl Into<String>, min_score: f64) -> Self {
        Self {
            name: name.into(),
            min_score,
        }
    }

    /// Accept the score or fail with `QualityGateFailed`.
    ///
    /// A missing score never passes.
    pub fn evaluate(&self, stage: StageId, score: Option<f64>) -> Result<f64> {
        match score {
            Some(score) if score >= self.min_score => Ok(score),
            _ => Err(OrchestratorError::QualityGateFailed {
                stage: stage.to_string(),
                gate: self.name.clone(),
                score,
                min_score: self.min_score,
            }),
        }
    }
}

/// Stage id → executor binding
#[derive(Default, Clone)]
pub struct StageRegistry {
    handlers: HashMap<StageId, Arc<dyn StageHandler>>,
}

impl StageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a stage handler, replacing any previous one for the same stage
    pub fn register(&mut self, handler: Arc<dyn StageHandler>) -> Result<()> {
        let stage = handler.stage_id();
        if stage.is_terminal() {
            return Err(OrchestratorError::config(format!(
                "{} is terminal and cannot have a handler",
                stage
            )));
        }
        self.handlers.insert(stage, handler);
        Ok(())
    }

    pub fn get(&self, stage: StageId) -> Result<Arc<dyn StageHandler>> {
        self.handlers
            .get(&stage)
            .cloned()
            .ok_or_else(|| OrchestratorError::StageNotFound(stage.to_string()))
    }

    /// Fail on the first pipeline stage without a handler
    pub fn ensure_complete(&self) -> Result<()> {
        match StageId::PIPELINE
            .iter()
            .find(|stage| !self.handlers.contains_key(*stage))
        {
            Some(missing) => Err(OrchestratorError::StageNotFound(missing.to_string())),
            None => Ok(()),
        }
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
