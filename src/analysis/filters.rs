use std::collections::HashMap;

use log::debug;
use rayon::prelude::*;

use crate::analysis::topology::{self, BondGraph, GraphInvariants};
use crate::core::chemistry::{BondCutoffs, BondingRule};
use crate::core::domain::{canonical_cmp, Structure};
use crate::core::error::{PipelineError, Result};

/// Keeps every record with energy <= E_min + `threshold` (eV).
///
/// Fails if the threshold is negative or not finite, or if any record is
/// unevaluated. An empty input yields an empty output.
pub fn energy_filter(records: &[Structure], threshold: f64) -> Result<Vec<Structure>> {
    if !threshold.is_finite() || threshold < 0.0 {
        return Err(PipelineError::config(format!(
            "energy threshold must be finite and >= 0, got {}",
            threshold
        )));
    }

    let mut energies = Vec::with_capacity(records.len());
    for r in records {
        let e = r
            .energy()
            .ok_or_else(|| PipelineError::config(format!("record {} has no evaluated energy", r.id())))?;
        energies.push(e);
    }

    let Some(e_min) = energies.iter().copied().min_by(|a, b| a.total_cmp(b)) else {
        return Ok(Vec::new());
    };
    let cutoff = e_min + threshold;

    Ok(records
        .iter()
        .zip(&energies)
        .filter(|(_, e)| **e <= cutoff)
        .map(|(r, _)| r.clone())
        .collect())
}

/// Builds the bond graph of every record under one shared cutoff table.
pub fn fingerprints(records: &[Structure], rule: &BondingRule) -> Result<Vec<BondGraph>> {
    let mut species: Vec<&str> = records
        .iter()
        .flat_map(|r| r.geometry().atoms.iter())
        .filter(|a| a.tag <= rule.max_tag)
        .map(|a| a.symbol.as_str())
        .collect();
    species.sort_unstable();
    species.dedup();

    let cutoffs = BondCutoffs::new(&species, rule)?;

    records
        .par_iter()
        .map(|r| topology::fingerprint(r.geometry(), &cutoffs, rule))
        .collect()
}

/// Keeps one record per structural-equivalence class: the lowest-energy
/// member, ties broken by record id. Output is in canonical order, so the
/// result does not depend on input order and the filter is idempotent.
pub fn graph_filter(records: &[Structure], rule: &BondingRule) -> Result<Vec<Structure>> {
    if records.is_empty() {
        return Ok(Vec::new());
    }

    let mut ordered: Vec<&Structure> = records.iter().collect();
    ordered.sort_by(|a, b| canonical_cmp(a, b));

    let owned: Vec<Structure> = ordered.iter().map(|r| (*r).clone()).collect();
    let graphs = fingerprints(&owned, rule)?;

    // Bucket by cheap invariants; the isomorphism test only runs within a bucket.
    let mut buckets: HashMap<&GraphInvariants, Vec<usize>> = HashMap::new();
    let mut representatives: Vec<usize> = Vec::new();
    let mut isomorphism_tests = 0usize;

    for (i, graph) in graphs.iter().enumerate() {
        let bucket = buckets.entry(graph.invariants()).or_default();
        let duplicate = bucket.iter().any(|&rep| {
            isomorphism_tests += 1;
            graphs[rep].is_equivalent(graph)
        });
        if !duplicate {
            bucket.push(i);
            representatives.push(i);
        }
    }

    debug!(
        "Graph filter: {} records, {} buckets, {} classes, {} isomorphism tests",
        owned.len(),
        buckets.len(),
        representatives.len(),
        isomorphism_tests
    );

    let mut owned: Vec<Option<Structure>> = owned.into_iter().map(Some).collect();
    Ok(representatives
        .into_iter()
        .filter_map(|i| owned[i].take())
        .collect())
}

/// Keeps records whose adsorbate atoms form a single joined nanocluster.
pub fn joined_filter(records: &[Structure], rule: &BondingRule) -> Result<Vec<Structure>> {
    if records.is_empty() {
        return Ok(Vec::new());
    }
    let graphs = fingerprints(records, rule)?;
    Ok(records
        .iter()
        .zip(&graphs)
        .filter(|(_, g)| g.is_adsorbate_joined())
        .map(|(r, _)| r.clone())
        .collect())
}
