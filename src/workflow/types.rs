use crate::core::types::{
    AuthenticityReport, CardMetadata, Hints, SetMatch, Valuation,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowStatus {
    Running,
    Succeeded,
    Partial,
    Failed,
}

/// Pipeline stages in execution order. Serializes as a string so stage
/// records can be keyed by stage name in persisted executions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Stage {
    Extracting,
    Reasoning,
    ResolvingSet,
    Pricing,
    VerifyingAuthenticity,
    Aggregating,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Extracting => "Extracting",
            Stage::Reasoning => "Reasoning",
            Stage::ResolvingSet => "ResolvingSet",
            Stage::Pricing => "Pricing",
            Stage::VerifyingAuthenticity => "VerifyingAuthenticity",
            Stage::Aggregating => "Aggregating",
        }
    }
}

/// Outcome of one stage, persisted as soon as the stage settles so a crashed
/// execution can resume from here instead of restarting the pipeline.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StageRecord {
    pub stage: Stage,
    pub ok: bool,
    pub detail: String,
    /// Stage output, serialized; shape depends on the stage.
    pub payload: serde_json::Value,
    #[serde(rename = "completedAt")]
    pub completed_at: DateTime<Utc>,
}

impl StageRecord {
    pub fn succeeded<T: Serialize>(stage: Stage, detail: impl Into<String>, payload: &T) -> Self {
        Self {
            stage,
            ok: true,
            detail: detail.into(),
            payload: serde_json::to_value(payload).unwrap_or(serde_json::Value::Null),
            completed_at: Utc::now(),
        }
    }

    pub fn failed(stage: Stage, detail: impl Into<String>) -> Self {
        Self {
            stage,
            ok: false,
            detail: detail.into(),
            payload: serde_json::Value::Null,
            completed_at: Utc::now(),
        }
    }
}

/// One pipeline run, durable across crashes via per-stage partial updates.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub id: String,
    #[serde(rename = "imageRef")]
    pub image_ref: String,
    pub hints: Hints,
    pub status: WorkflowStatus,
    #[serde(rename = "stageResults")]
    pub stage_results: BTreeMap<Stage, StageRecord>,
    #[serde(rename = "startedAt")]
    pub started_at: DateTime<Utc>,
    #[serde(rename = "finishedAt")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl WorkflowExecution {
    pub fn new(id: String, image_ref: String, hints: Hints) -> Self {
        Self {
            id,
            image_ref,
            hints,
            status: WorkflowStatus::Running,
            stage_results: BTreeMap::new(),
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    /// Payload of a stage that already completed successfully, decoded.
    /// Used on resume to skip re-running completed stages.
    pub fn completed_payload<T: for<'de> Deserialize<'de>>(&self, stage: Stage) -> Option<T> {
        let record = self.stage_results.get(&stage)?;
        if !record.ok {
            return None;
        }
        serde_json::from_value(record.payload.clone()).ok()
    }
}

/// What `identify` hands back to the caller.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IdentifyOutcome {
    #[serde(rename = "executionId")]
    pub execution_id: String,
    pub status: WorkflowStatus,
    #[serde(rename = "cardMetadata")]
    pub card_metadata: CardMetadata,
    #[serde(rename = "setMatch")]
    pub set_match: Option<SetMatch>,
    pub valuation: Option<Valuation>,
    pub authenticity: Option<AuthenticityReport>,
}
