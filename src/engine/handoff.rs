use std::time::Instant;

use anyhow::{bail, Result as AnyResult};
use log::{info, warn};
use uuid::Uuid;

use crate::core::domain::{Evaluation, Geometry, Structure};
use crate::core::error::{PipelineError, Result};
use crate::engine::evaluator::{EvaluationResult, Evaluator};
use crate::pipeline::stage::Stage;

/// An input record whose evaluation failed, with the reason.
#[derive(Debug, Clone, PartialEq)]
pub struct FailedRecord {
    pub id: Uuid,
    pub reason: String,
}

/// Per-record result consumed by the stage loop.
#[derive(Debug, Clone)]
pub enum RecordOutcome {
    Evaluated(Structure),
    Failed(FailedRecord),
}

/// Everything one hand-off stage produced.
#[derive(Debug, Clone)]
pub struct HandoffReport {
    pub stage: Stage,
    pub attempted: usize,
    pub records: Vec<Structure>,
    pub failed: Vec<FailedRecord>,
}

impl HandoffReport {
    /// True when there was input and none of it survived.
    pub fn is_exhausted(&self) -> bool {
        self.attempted > 0 && self.records.is_empty()
    }

    pub fn ensure_not_exhausted(&self) -> Result<()> {
        if self.is_exhausted() {
            return Err(PipelineError::StageExhausted {
                stage: self.stage,
                attempted: self.attempted,
            });
        }
        Ok(())
    }

    pub fn failed_ids(&self) -> Vec<Uuid> {
        self.failed.iter().map(|f| f.id).collect()
    }
}

/// Checks an engine result and turns it into the successor record.
fn accept(
    input: &Structure,
    result: EvaluationResult,
    stage: Stage,
    index: Option<usize>,
) -> AnyResult<Structure> {
    let Some(method) = stage.evaluation_method() else {
        bail!("stage '{}' does not evaluate records", stage);
    };
    if !result.energy.is_finite() {
        bail!("non-finite energy {}", result.energy);
    }

    let geometry = match result.relaxed {
        Some(g) => {
            check_same_atoms(input.geometry(), &g)?;
            g.validate()?;
            g
        }
        None => input.geometry().clone(),
    };

    Ok(input.derive(
        geometry,
        Evaluation {
            energy: result.energy,
            method,
        },
        stage,
        index,
    ))
}

fn check_same_atoms(before: &Geometry, after: &Geometry) -> AnyResult<()> {
    if before.len() != after.len() {
        bail!(
            "atom count mismatch: expected {}, got {}",
            before.len(),
            after.len()
        );
    }
    if let Some((i, _)) = before
        .atoms
        .iter()
        .zip(&after.atoms)
        .enumerate()
        .find(|(_, (a, b))| a.symbol != b.symbol)
    {
        bail!("species changed at atom {}", i);
    }
    Ok(())
}

/// Runs `evaluate` on every input record in order.
///
/// A record whose evaluation fails is dropped and logged; the stage itself
/// only fails (through [`HandoffReport::ensure_not_exhausted`]) when nothing
/// survives.
pub fn hand_off<F>(stage: Stage, index: Option<usize>, inputs: &[Structure], mut evaluate: F) -> HandoffReport
where
    F: FnMut(&Structure) -> AnyResult<EvaluationResult>,
{
    let start = Instant::now();
    let mut records = Vec::with_capacity(inputs.len());
    let mut failed = Vec::new();

    for (n, input) in inputs.iter().enumerate() {
        let outcome = match evaluate(input).and_then(|res| accept(input, res, stage, index)) {
            Ok(record) => RecordOutcome::Evaluated(record),
            Err(e) => RecordOutcome::Failed(FailedRecord {
                id: input.id(),
                reason: format!("{:#}", e),
            }),
        };

        match outcome {
            RecordOutcome::Evaluated(record) => records.push(record),
            RecordOutcome::Failed(f) => {
                warn!(
                    "[{}] record {} ({}/{}) dropped: {}",
                    stage,
                    f.id,
                    n + 1,
                    inputs.len(),
                    f.reason
                );
                failed.push(f);
            }
        }
    }

    info!(
        "[{}] evaluated {}/{} records in {:.1}s",
        stage,
        records.len(),
        inputs.len(),
        start.elapsed().as_secs_f64()
    );

    HandoffReport {
        stage,
        attempted: inputs.len(),
        records,
        failed,
    }
}

/// [`hand_off`] driven by an [`Evaluator`].
pub fn evaluate_all(
    evaluator: &dyn Evaluator,
    stage: Stage,
    index: Option<usize>,
    inputs: &[Structure],
) -> HandoffReport {
    info!("[{}] handing {} records to {}", stage, inputs.len(), evaluator.name());
    hand_off(stage, index, inputs, |s| evaluator.evaluate(s))
}
