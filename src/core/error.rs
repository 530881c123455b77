use std::path::PathBuf;
use thiserror::Error;

use crate::pipeline::stage::Stage;

/// Failure kinds surfaced by the funnel.
///
/// Per-record evaluator failures are not represented here: they are
/// recovered inside a stage (see `engine::handoff`) and only escalate as
/// `StageExhausted` when nothing survives.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Stage '{stage}' exhausted: all {attempted} record evaluations failed")]
    StageExhausted { stage: Stage, attempted: usize },

    #[error("Incomplete merge for stage '{stage}': missing partition indices {missing:?} of {expected}")]
    IncompleteMerge {
        stage: Stage,
        expected: usize,
        missing: Vec<usize>,
    },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed document {path}: {source}")]
    Serialization {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl PipelineError {
    pub fn config(msg: impl Into<String>) -> Self {
        PipelineError::Configuration(msg.into())
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        PipelineError::Io {
            path: path.into(),
            source,
        }
    }

    /// Process exit code used by the CLI, so external orchestration can tell
    /// "not finished yet" apart from genuine failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            PipelineError::Configuration(_) => 2,
            PipelineError::StageExhausted { .. } => 3,
            PipelineError::IncompleteMerge { .. } => 4,
            PipelineError::Io { .. } | PipelineError::Serialization { .. } => 1,
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
