use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use log::{info, warn};
use rand::seq::index::sample;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::core::error::{PipelineError, Result};
use crate::pipeline::store;

/// Metadata of one trained model, written next to its parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub index: usize,
    pub parameters_path: PathBuf,
    /// `None` when the corresponding evaluation set was empty.
    pub overall_rmse: Option<f64>,
    pub in_rmse: Option<f64>,
    pub out_rmse: Option<f64>,
    pub species: Vec<String>,
    pub train_count: usize,
    pub trained_at: DateTime<Utc>,
}

/// The cross-stoichiometry surrogate artifact: `<model_dir>/<version>/`.
///
/// A model counts as present only once its completion marker exists; the
/// marker is written after the info file, so a half-written training run is
/// never consumed.
#[derive(Debug, Clone)]
pub struct ModelArtifact {
    root: PathBuf,
}

impl ModelArtifact {
    pub fn new(model_dir: &Path, version: &str) -> Self {
        Self {
            root: model_dir.join(version),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn parameters_path(&self, index: usize) -> PathBuf {
        self.root.join(format!("model_parameters_{:03}.bin", index))
    }

    pub fn info_path(&self, index: usize) -> PathBuf {
        self.root.join(format!("model_info_{:03}.json", index))
    }

    pub fn marker_path(&self, index: usize) -> PathBuf {
        self.root.join(format!("model_{:03}.complete", index))
    }

    /// Persists `info` and marks the model complete.
    pub fn commit(&self, info: &ModelInfo) -> Result<()> {
        store::write_json(&self.info_path(info.index), info)?;
        let marker = self.marker_path(info.index);
        fs::write(&marker, info.trained_at.to_rfc3339()).map_err(|e| PipelineError::io(&marker, e))
    }

    /// Every model with a completion marker, ordered by index.
    pub fn complete_models(&self) -> Result<Vec<ModelInfo>> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(PipelineError::io(&self.root, e)),
        };

        let mut indices = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| PipelineError::io(&self.root, e))?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(idx) = name
                .strip_prefix("model_")
                .and_then(|s| s.strip_suffix(".complete"))
                .and_then(|s| s.parse::<usize>().ok())
            {
                indices.push(idx);
            }
        }
        indices.sort_unstable();

        indices
            .into_iter()
            .map(|idx| store::read_json::<ModelInfo>(&self.info_path(idx)))
            .collect()
    }

    /// The complete model with the lowest overall RMSE (ties: lowest index).
    /// Absent or unfinished artifacts are configuration errors.
    pub fn best_model(&self) -> Result<ModelInfo> {
        let models = self.complete_models()?;
        for m in &models {
            match m.overall_rmse {
                Some(rmse) => info!("Model {:03}: overall RMSE {:.6} eV", m.index, rmse),
                None => warn!("Model {:03}: no RMSE recorded, skipped", m.index),
            }
        }
        models
            .into_iter()
            .filter_map(|m| m.overall_rmse.filter(|r| r.is_finite()).map(|r| (r, m)))
            .min_by(|(ra, a), (rb, b)| ra.total_cmp(rb).then(a.index.cmp(&b.index)))
            .map(|(_, m)| m)
            .ok_or_else(|| {
                PipelineError::config(format!(
                    "no complete surrogate model under {}; run surrogate-train first",
                    self.root.display()
                ))
            })
    }
}

// --- Training Data Helpers ---

/// Splits `0..n` into training and validation indices: at least a 90/10
/// split, with the training side capped at `max_train`.
pub fn split_data<R: Rng + ?Sized>(n: usize, max_train: usize, rng: &mut R) -> (Vec<usize>, Vec<usize>) {
    let n_train = ((0.9 * n as f64).round() as usize).min(max_train).min(n);
    let mut train = sample(rng, n, n_train).into_vec();
    train.sort_unstable();

    let mut in_train = vec![false; n];
    for &i in &train {
        in_train[i] = true;
    }
    let other = (0..n).filter(|&i| !in_train[i]).collect();
    (train, other)
}

/// At most `n` elements of `data`, sampled without replacement.
pub fn subset<R: Rng + ?Sized>(data: &[usize], n: usize, rng: &mut R) -> Vec<usize> {
    if data.len() <= n {
        return data.to_vec();
    }
    let mut picked: Vec<usize> = sample(rng, data.len(), n).into_iter().map(|i| data[i]).collect();
    picked.sort_unstable();
    picked
}

/// Root mean square error; `None` for empty or mismatched inputs.
pub fn rmse(target: &[f64], pred: &[f64]) -> Option<f64> {
    if target.is_empty() || target.len() != pred.len() {
        return None;
    }
    let sum: f64 = target.iter().zip(pred).map(|(t, p)| (t - p) * (t - p)).sum();
    Some((sum / target.len() as f64).sqrt())
}

// --- Unphysical Relaxation Guard ---

fn kde(samples: &[f64], bandwidth: f64, x: f64) -> f64 {
    let norm = 1.0 / (samples.len() as f64 * bandwidth * (2.0 * std::f64::consts::PI).sqrt());
    samples
        .iter()
        .map(|s| {
            let u = (x - s) / bandwidth;
            (-0.5 * u * u).exp()
        })
        .sum::<f64>()
        * norm
}

/// Energy change below which a surrogate relaxation is deemed unphysical.
///
/// Builds a Gaussian KDE of the energy changes, climbs from the largest
/// change to the main peak, then descends from one bandwidth below the peak
/// to the valley separating it from spuriously low relaxations. Returns
/// `None` when there is nothing to separate (fewer than two samples or no
/// spread).
pub fn unphysical_threshold(diffs: &[f64], bandwidth: f64) -> Option<f64> {
    if diffs.len() < 2 || !(bandwidth > 0.0) {
        return None;
    }
    let lo = diffs.iter().copied().fold(f64::INFINITY, f64::min);
    let hi = diffs.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if !(hi - lo > 0.0) || !lo.is_finite() || !hi.is_finite() {
        return None;
    }

    let step = bandwidth / 20.0;
    let max_steps = (((hi - lo) + 10.0 * bandwidth) / step).ceil() as usize;
    let f = |x: f64| kde(diffs, bandwidth, x);

    // Main peak
    let mut peak = hi;
    for _ in 0..max_steps {
        let here = f(peak);
        if f(peak + step) > here {
            peak += step;
        } else if f(peak - step) > here {
            peak -= step;
        } else {
            break;
        }
    }

    // Valley left of the peak
    let floor = lo - 4.0 * bandwidth;
    let mut valley = peak - bandwidth;
    for _ in 0..max_steps {
        if valley - step < floor || f(valley - step) >= f(valley) {
            break;
        }
        valley -= step;
    }
    Some(valley)
}

/// Flags which energy changes are accepted (strictly above the threshold).
pub fn accept_relaxations(diffs: &[f64], bandwidth: f64) -> Vec<bool> {
    match unphysical_threshold(diffs, bandwidth) {
        Some(threshold) => {
            let accept: Vec<bool> = diffs.iter().map(|&d| d > threshold).collect();
            let rejected = accept.iter().filter(|a| !**a).count();
            if rejected > 0 {
                warn!(
                    "{} surrogate relaxations dropped below {:.3} eV and are reverted",
                    rejected, threshold
                );
            }
            accept
        }
        None => vec![true; diffs.len()],
    }
}
