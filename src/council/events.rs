//! Typed events for the streaming council pipeline.
//!
//! Every SSE frame the server emits is one [`CouncilEvent`] serialized as
//! JSON with a `type` envelope field; the variant names below serialize to
//! the snake_case names consumed by the UI (`stage1_model_start`,
//! `stage3_chunk`, …).

use serde::Serialize;

use crate::council::model::{ChairmanAnswer, ModelRanking, ModelResponse};
use crate::council::ranking::AggregateRanking;

/// Payload of `title_complete`.
#[derive(Debug, Clone, Serialize)]
pub struct TitleData {
    pub title: String,
}

/// Payload of `stage2_metadata`: the anonymization mapping, announced before
/// any ranking chunks so consumers can resolve labels live.
#[derive(Debug, Clone, Serialize)]
pub struct LabelMapData {
    pub label_to_model: serde_json::Value,
}

/// Payload of `stage2_complete`: the mapping plus the leaderboard.
#[derive(Debug, Clone, Serialize)]
pub struct Stage2Metadata {
    pub label_to_model: serde_json::Value,
    pub aggregate_rankings: Vec<AggregateRanking>,
}

/// One event in the streamed lifecycle of a council turn.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CouncilEvent {
    Stage1Start,
    Stage1ModelStart {
        model: String,
    },
    Stage1Chunk {
        model: String,
        content: String,
    },
    Stage1Complete {
        data: Vec<ModelResponse>,
    },
    Stage2Start,
    Stage2ModelStart {
        model: String,
    },
    Stage2Metadata {
        data: LabelMapData,
    },
    Stage2Chunk {
        model: String,
        content: String,
    },
    Stage2Complete {
        data: Vec<ModelRanking>,
        metadata: Stage2Metadata,
    },
    Stage3Start,
    Stage3Chunk {
        model: String,
        content: String,
    },
    Stage3Complete {
        data: ChairmanAnswer,
    },
    TitleComplete {
        data: TitleData,
    },
    Complete,
    Error {
        message: String,
    },
}

impl CouncilEvent {
    /// The wire name of this event's `type` field.
    pub fn type_name(&self) -> &'static str {
        match self {
            CouncilEvent::Stage1Start => "stage1_start",
            CouncilEvent::Stage1ModelStart { .. } => "stage1_model_start",
            CouncilEvent::Stage1Chunk { .. } => "stage1_chunk",
            CouncilEvent::Stage1Complete { .. } => "stage1_complete",
            CouncilEvent::Stage2Start => "stage2_start",
            CouncilEvent::Stage2ModelStart { .. } => "stage2_model_start",
            CouncilEvent::Stage2Metadata { .. } => "stage2_metadata",
            CouncilEvent::Stage2Chunk { .. } => "stage2_chunk",
            CouncilEvent::Stage2Complete { .. } => "stage2_complete",
            CouncilEvent::Stage3Start => "stage3_start",
            CouncilEvent::Stage3Chunk { .. } => "stage3_chunk",
            CouncilEvent::Stage3Complete { .. } => "stage3_complete",
            CouncilEvent::TitleComplete { .. } => "title_complete",
            CouncilEvent::Complete => "complete",
            CouncilEvent::Error { .. } => "error",
        }
    }
}
