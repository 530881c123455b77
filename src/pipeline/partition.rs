use std::ops::Range;

use crate::core::domain::{Partition, Population, Stoichiometry};
use crate::core::error::{PipelineError, Result};
use crate::pipeline::stage::Stage;

/// Slice of `0..len` owned by instance `index` out of `total`.
///
/// Slices are contiguous, balanced to within one item, disjoint, and cover
/// `0..len` exactly once across `0..total`.
pub fn partition_range(len: usize, total: usize, index: usize) -> Result<Range<usize>> {
    if total == 0 {
        return Err(PipelineError::config("number of instances must be > 0"));
    }
    if index >= total {
        return Err(PipelineError::config(format!(
            "instance index {} out of range for {} instances",
            index, total
        )));
    }
    let base = len / total;
    let extra = len % total;
    let start = index * base + index.min(extra);
    let size = base + usize::from(index < extra);
    Ok(start..start + size)
}

/// Instance `index`'s share of `population`, labelled for `stage`.
pub fn partition(population: &Population, stage: Stage, total: usize, index: usize) -> Result<Partition> {
    let range = partition_range(population.len(), total, index)?;
    Ok(Partition {
        stage,
        stoichiometry: population.stoichiometry.clone(),
        index,
        total,
        records: population.records[range].to_vec(),
        failed: Vec::new(),
    })
}

/// Concatenates all partitions of `stage` into one population, in index
/// order. Does not deduplicate.
///
/// Mismatched stage, stoichiometry or instance count, and duplicate or
/// out-of-range indices are configuration errors; absent indices are an
/// incomplete merge.
pub fn merge(
    stage: Stage,
    stoichiometry: &Stoichiometry,
    expected: usize,
    mut partitions: Vec<Partition>,
) -> Result<Population> {
    for p in &partitions {
        if p.stage != stage {
            return Err(PipelineError::config(format!(
                "partition {} belongs to stage '{}', expected '{}'",
                p.index, p.stage, stage
            )));
        }
        if &p.stoichiometry != stoichiometry {
            return Err(PipelineError::config(format!(
                "partition {} declares stoichiometry {}, expected {}",
                p.index, p.stoichiometry, stoichiometry
            )));
        }
        if p.total != expected {
            return Err(PipelineError::config(format!(
                "partition {} was produced for {} instances, expected {}",
                p.index, p.total, expected
            )));
        }
        if p.index >= expected {
            return Err(PipelineError::config(format!(
                "partition index {} out of range for {} instances",
                p.index, expected
            )));
        }
    }

    partitions.sort_by_key(|p| p.index);
    if let Some(w) = partitions.windows(2).find(|w| w[0].index == w[1].index) {
        return Err(PipelineError::config(format!("duplicate partition index {}", w[0].index)));
    }

    let present: Vec<usize> = partitions.iter().map(|p| p.index).collect();
    let missing: Vec<usize> = (0..expected).filter(|i| present.binary_search(i).is_err()).collect();
    if !missing.is_empty() {
        return Err(PipelineError::IncompleteMerge {
            stage,
            expected,
            missing,
        });
    }

    let records = partitions.into_iter().flat_map(|p| p.records).collect();
    Ok(Population::new(stage, stoichiometry.clone(), records))
}
