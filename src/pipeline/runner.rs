use std::collections::{BTreeSet, HashMap};
use std::path::Path;

use chrono::Utc;
use log::{debug, info, warn};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::Serialize;
use uuid::Uuid;

use crate::analysis::filters;
use crate::core::config::{StoichiometryConfig, SurrogateTrainingConfig};
use crate::core::domain::{sort_canonical, Evaluation, EvaluationMethod, Partition, Population, Provenance, Structure};
use crate::core::error::{PipelineError, Result};
use crate::core::spatial;
use crate::engine::evaluator::{Evaluator, SearchEngine, SearchRequest, SurrogateBackend};
use crate::engine::handoff::{evaluate_all, hand_off};
use crate::engine::surrogate::{accept_relaxations, rmse, split_data, subset, ModelArtifact, ModelInfo};
use crate::pipeline::partition::{merge, partition};
use crate::pipeline::stage::Stage;
use crate::pipeline::store::RunLayout;

fn layout_of(config: &StoichiometryConfig) -> RunLayout {
    RunLayout::new(&config.run_dir)
}

// --- Search ---

/// One independent global-search instance. Persists partition `index` of
/// the search stage.
pub fn run_search(config: &StoichiometryConfig, index: usize, engine: &dyn SearchEngine) -> Result<Partition> {
    if index >= config.agox.num_runs {
        return Err(PipelineError::config(format!(
            "search instance {} out of range for {} runs",
            index, config.agox.num_runs
        )));
    }

    let request = SearchRequest {
        stoichiometry: config.nanocluster_stoichiometry.clone(),
        surface: config.surface.clone(),
        num_iterations: config.agox.num_iterations,
        index,
        seed: index as u64,
    };
    info!(
        "[search] instance {}/{}: {} for {} iterations with {}",
        index,
        config.agox.num_runs,
        request.stoichiometry,
        request.num_iterations,
        engine.name()
    );

    let candidates = engine.search(&request).map_err(|e| {
        warn!("[search] instance {} failed: {:#}", index, e);
        PipelineError::StageExhausted {
            stage: Stage::Search,
            attempted: 1,
        }
    })?;

    let found = candidates.len();
    let mut records = Vec::with_capacity(found);
    for (n, c) in candidates.into_iter().enumerate() {
        if let Err(e) = c.geometry.validate() {
            warn!("[search] candidate {} dropped: {}", n, e);
            continue;
        }
        if !c.energy.is_finite() {
            warn!("[search] candidate {} dropped: non-finite energy", n);
            continue;
        }
        if !config.nanocluster_stoichiometry.matches(&c.geometry) {
            warn!("[search] candidate {} dropped: adsorbate composition differs", n);
            continue;
        }
        records.push(Structure::new(
            c.geometry,
            Provenance {
                stage: Stage::Search,
                index: Some(index),
                origin: None,
            },
            Some(Evaluation {
                energy: c.energy,
                method: EvaluationMethod::GlobalSearch,
            }),
        ));
    }

    if found > 0 && records.is_empty() {
        return Err(PipelineError::StageExhausted {
            stage: Stage::Search,
            attempted: found,
        });
    }

    let part = Partition {
        stage: Stage::Search,
        stoichiometry: config.nanocluster_stoichiometry.clone(),
        index,
        total: config.agox.num_runs,
        records,
        failed: Vec::new(),
    };
    let path = layout_of(config).write_partition(&part)?;
    info!("[search] kept {}/{} candidates -> {}", part.records.len(), found, path.display());
    Ok(part)
}

// --- Filters ---

/// Merges all search partitions and keeps the low-energy window.
pub fn run_energy_filter(config: &StoichiometryConfig) -> Result<Population> {
    let layout = layout_of(config);
    let merged = merge(
        Stage::Search,
        &config.nanocluster_stoichiometry,
        config.agox.num_runs,
        layout.read_partitions(Stage::Search)?,
    )?;
    info!("[energy_filter] loaded {} structures", merged.len());

    let kept = filters::energy_filter(&merged.records, config.energy_filter.threshold)?;
    info!(
        "[energy_filter] {} structures within {} eV of the minimum",
        kept.len(),
        config.energy_filter.threshold
    );

    let population = Population::new(Stage::EnergyFilter, merged.stoichiometry, kept);
    layout.write_population(&population)?;
    Ok(population)
}

/// Number of physics-relax instances the merge expects.
pub fn physics_instance_count(config: &StoichiometryConfig) -> Result<usize> {
    match config.physics_relax.num_instances {
        Some(n) => Ok(n),
        None => Ok(layout_of(config).read_population(Stage::GraphFilter2)?.len()),
    }
}

/// Graph deduplication for `stage` (one of the three graph-filter stages).
/// The last one also drops structures whose adsorbate is not one joined
/// cluster and writes the summary table.
pub fn run_graph_filter(config: &StoichiometryConfig, stage: Stage) -> Result<Population> {
    let layout = layout_of(config);
    let rule = config.graph_filter.bonding_rule();

    let input = match stage {
        Stage::GraphFilter1 => layout.read_population(Stage::EnergyFilter)?,
        Stage::GraphFilter2 => layout.read_population(Stage::SurrogateRelax)?,
        Stage::GraphFilter3 => merge(
            Stage::PhysicsRelax,
            &config.nanocluster_stoichiometry,
            physics_instance_count(config)?,
            layout.read_partitions(Stage::PhysicsRelax)?,
        )?,
        other => {
            return Err(PipelineError::config(format!("'{}' is not a graph-filter stage", other)));
        }
    };
    info!("[{}] loaded {} structures", stage, input.len());

    let mut kept = filters::graph_filter(&input.records, &rule)?;
    info!("[{}] {} structural groups", stage, kept.len());

    if stage == Stage::GraphFilter3 {
        kept = filters::joined_filter(&kept, &rule)?;
        info!("[{}] {} structures form a single joined cluster", stage, kept.len());
    }

    let population = Population::new(stage, input.stoichiometry, kept);
    layout.write_population(&population)?;
    if stage == Stage::GraphFilter3 {
        write_summary(&layout.summary_path(), &population)?;
    }
    Ok(population)
}

#[derive(Serialize)]
struct SummaryRow {
    rank: usize,
    id: Uuid,
    energy: Option<f64>,
    relative_energy: Option<f64>,
    method: Option<EvaluationMethod>,
    atoms: usize,
    origin: Option<Uuid>,
}

fn write_summary(path: &Path, population: &Population) -> Result<()> {
    let to_err = |e: csv::Error| {
        let source = match e.into_kind() {
            csv::ErrorKind::Io(io) => io,
            other => std::io::Error::other(format!("{:?}", other)),
        };
        PipelineError::io(path, source)
    };

    let e_min = population.min_energy();
    let mut writer = csv::Writer::from_path(path).map_err(to_err)?;
    for (rank, r) in population.records.iter().enumerate() {
        writer
            .serialize(SummaryRow {
                rank: rank + 1,
                id: r.id(),
                energy: r.energy(),
                relative_energy: r.energy().zip(e_min).map(|(e, m)| e - m),
                method: r.evaluation().map(|e| e.method),
                atoms: r.geometry().len(),
                origin: r.provenance().origin,
            })
            .map_err(to_err)?;
    }
    writer.flush().map_err(|e| PipelineError::io(path, e))
}

// --- Surrogate ---

/// Trains surrogate model `index` on the first graph-filtered populations of
/// every listed run and commits it to the shared artifact.
pub fn run_surrogate_train(
    config: &SurrogateTrainingConfig,
    index: usize,
    backend: &dyn SurrogateBackend,
) -> Result<ModelInfo> {
    let mut structures: Vec<Structure> = Vec::new();
    for run_dir in &config.input_run_dirs {
        match RunLayout::new(run_dir).read_population(Stage::GraphFilter1) {
            Ok(p) => structures.extend(p.records),
            Err(e) => warn!("[surrogate_train] skipping {}: {}", run_dir.display(), e),
        }
    }
    if structures.is_empty() {
        return Err(PipelineError::config("no training structures found in any input run"));
    }
    if let Some(r) = structures.iter().find(|r| r.energy().is_none()) {
        return Err(PipelineError::config(format!("training record {} has no energy", r.id())));
    }
    info!("[surrogate_train] loaded {} structures", structures.len());

    let species: Vec<String> = structures
        .iter()
        .flat_map(|r| r.geometry().atoms.iter().map(|a| a.symbol.clone()))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();

    let mut rng = ChaCha8Rng::seed_from_u64(index as u64);
    let (train_idx, other_idx) = split_data(structures.len(), config.max_train_structures, &mut rng);
    let training: Vec<Structure> = train_idx.iter().map(|&i| structures[i].clone()).collect();

    let artifact = ModelArtifact::new(&config.model_dir, &config.version);
    let parameters_path = artifact.parameters_path(index);
    std::fs::create_dir_all(artifact.root()).map_err(|e| PipelineError::io(artifact.root(), e))?;

    info!("[surrogate_train] training model {:03} on {} structures", index, training.len());
    let exhausted = |e: anyhow::Error| {
        warn!("[surrogate_train] model {:03}: {:#}", index, e);
        PipelineError::StageExhausted {
            stage: Stage::SurrogateTrain,
            attempted: 1,
        }
    };
    backend.train(&training, &species, &parameters_path).map_err(exhausted)?;
    let model = backend.load(&parameters_path, &species).map_err(exhausted)?;

    let in_set = subset(&train_idx, config.max_evaluate_structures, &mut rng);
    let out_set = subset(&other_idx, config.max_evaluate_structures, &mut rng);
    info!(
        "[surrogate_train] evaluating on {} in-sample and {} out-of-sample structures",
        in_set.len(),
        out_set.len()
    );

    let score = |set: &[usize]| -> (Vec<f64>, Vec<f64>) {
        let mut targets = Vec::with_capacity(set.len());
        let mut preds = Vec::with_capacity(set.len());
        for &i in set {
            let r = &structures[i];
            match model.predict(r.geometry()) {
                Ok(p) if p.is_finite() => {
                    targets.extend(r.energy());
                    preds.push(p);
                }
                Ok(p) => warn!("[surrogate_train] non-finite prediction {} for {}", p, r.id()),
                Err(e) => warn!("[surrogate_train] prediction failed for {}: {:#}", r.id(), e),
            }
        }
        (targets, preds)
    };
    let (in_t, in_p) = score(&in_set);
    let (out_t, out_p) = score(&out_set);
    let all_t: Vec<f64> = in_t.iter().chain(&out_t).copied().collect();
    let all_p: Vec<f64> = in_p.iter().chain(&out_p).copied().collect();

    let info = ModelInfo {
        index,
        parameters_path,
        overall_rmse: rmse(&all_t, &all_p),
        in_rmse: rmse(&in_t, &in_p),
        out_rmse: rmse(&out_t, &out_p),
        species,
        train_count: training.len(),
        trained_at: Utc::now(),
    };
    let fmt = |v: Option<f64>| v.map_or("n/a".to_string(), |x| format!("{:.6} eV", x));
    info!("[surrogate_train] in-sample RMSE: {}", fmt(info.in_rmse));
    info!("[surrogate_train] out-of-sample RMSE: {}", fmt(info.out_rmse));
    info!("[surrogate_train] overall RMSE: {}", fmt(info.overall_rmse));

    artifact.commit(&info)?;
    Ok(info)
}

/// Relaxes the first graph-filtered population with the best complete
/// surrogate model, reverting relaxations that fall into unphysically low
/// energies.
pub fn run_surrogate_relax(config: &StoichiometryConfig, backend: &dyn SurrogateBackend) -> Result<Population> {
    let settings = config
        .surrogate
        .as_ref()
        .ok_or_else(|| PipelineError::config("surrogate settings are required for surrogate-relax"))?;
    let layout = layout_of(config);

    let artifact = ModelArtifact::new(&settings.model_dir, &settings.version);
    let best = artifact.best_model()?;
    info!(
        "[surrogate_relax] using model {:03} ({})",
        best.index,
        best.parameters_path.display()
    );
    let model = backend
        .load(&best.parameters_path, &best.species)
        .map_err(|e| PipelineError::config(format!("surrogate model {:03} unusable: {:#}", best.index, e)))?;

    let input = layout.read_population(Stage::GraphFilter1)?;

    let mut initial: HashMap<Uuid, f64> = HashMap::new();
    let report = hand_off(Stage::SurrogateRelax, None, &input.records, |s| {
        let e0 = model.predict(s.geometry())?;
        if !e0.is_finite() {
            anyhow::bail!("non-finite initial prediction {}", e0);
        }
        initial.insert(s.id(), e0);
        model.relax(s)
    });
    report.ensure_not_exhausted()?;

    let by_id: HashMap<Uuid, &Structure> = input.records.iter().map(|r| (r.id(), r)).collect();
    let lookup = |origin: Option<Uuid>| {
        let origin = origin?;
        Some((*by_id.get(&origin)?, *initial.get(&origin)?))
    };

    let diffs: Vec<f64> = report
        .records
        .iter()
        .map(|r| match (r.energy(), lookup(r.provenance().origin)) {
            (Some(e), Some((_, e0))) => e - e0,
            _ => 0.0,
        })
        .collect();
    let accept = accept_relaxations(&diffs, settings.kde_bandwidth);

    let records: Vec<Structure> = report
        .records
        .into_iter()
        .zip(accept)
        .map(|(relaxed, ok)| match (ok, lookup(relaxed.provenance().origin)) {
            (false, Some((original, e0))) => {
                debug!(
                    "[surrogate_relax] reverting {} (displacement {:.3} Å)",
                    original.id(),
                    spatial::rmsd(original.geometry(), relaxed.geometry()).unwrap_or(0.0)
                );
                original.derive(
                    original.geometry().clone(),
                    Evaluation {
                        energy: e0,
                        method: EvaluationMethod::Surrogate,
                    },
                    Stage::SurrogateRelax,
                    None,
                )
            }
            _ => relaxed,
        })
        .collect();

    let population = Population::new(Stage::SurrogateRelax, input.stoichiometry, records);
    layout.write_population(&population)?;
    Ok(population)
}

// --- Physics ---

/// Physics relaxation of instance `index`'s slice of the second
/// graph-filtered population. The partition is persisted even when every
/// evaluation failed, so the merge sees the instance as finished. With an
/// empty input and one instance per structure there are no instances at
/// all, and nothing is written.
pub fn run_physics_relax(config: &StoichiometryConfig, index: usize, evaluator: &dyn Evaluator) -> Result<Partition> {
    let layout = layout_of(config);
    let mut input = layout.read_population(Stage::GraphFilter2)?;
    sort_canonical(&mut input.records);

    let total = config.physics_relax.num_instances.unwrap_or(input.len());
    if total == 0 {
        info!("[physics_relax] graph_filter_2 is empty; nothing to relax");
        return Ok(Partition {
            stage: Stage::PhysicsRelax,
            stoichiometry: input.stoichiometry,
            index,
            total,
            records: Vec::new(),
            failed: Vec::new(),
        });
    }
    let slice = partition(&input, Stage::PhysicsRelax, total, index)?;
    info!("[physics_relax] instance {}/{}: {} structures", index, total, slice.records.len());

    let report = evaluate_all(evaluator, Stage::PhysicsRelax, Some(index), &slice.records);
    let part = Partition {
        failed: report.failed_ids(),
        records: report.records.clone(),
        ..slice
    };
    layout.write_partition(&part)?;
    report.ensure_not_exhausted()?;
    Ok(part)
}

// --- Status ---

/// What exists on disk for one stage of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageStatus {
    pub stage: Stage,
    pub population: bool,
    pub partitions: usize,
    /// Instance outputs a parallel stage needs; `None` when not yet known,
    /// in which case any output counts.
    pub expected: Option<usize>,
}

impl StageStatus {
    pub fn is_done(&self) -> bool {
        if self.population {
            return true;
        }
        if !self.stage.is_parallel() {
            return false;
        }
        match self.expected {
            Some(n) => self.partitions >= n,
            None => self.partitions > 0,
        }
    }
}

fn expected_instances(config: &StoichiometryConfig, layout: &RunLayout, stage: Stage) -> Result<Option<usize>> {
    match stage {
        Stage::Search => Ok(Some(config.agox.num_runs)),
        Stage::PhysicsRelax => match config.physics_relax.num_instances {
            Some(n) => Ok(Some(n)),
            None if layout.has_population(Stage::GraphFilter2) => {
                Ok(Some(layout.read_population(Stage::GraphFilter2)?.len()))
            }
            None => Ok(None),
        },
        _ => Ok(None),
    }
}

/// Per-stage state of a run directory. The cross-stoichiometry training
/// stage is reported from the surrogate artifact, when configured.
pub fn run_status(config: &StoichiometryConfig) -> Result<Vec<StageStatus>> {
    let layout = layout_of(config);
    let mut out = Vec::with_capacity(Stage::ALL.len());
    for stage in Stage::ALL {
        let status = if stage.is_cross_stoichiometry() {
            let models = match &config.surrogate {
                Some(s) => ModelArtifact::new(&s.model_dir, &s.version).complete_models()?.len(),
                None => 0,
            };
            StageStatus {
                stage,
                population: false,
                partitions: models,
                expected: None,
            }
        } else {
            StageStatus {
                stage,
                population: layout.has_population(stage),
                partitions: layout.partition_indices(stage)?.len(),
                expected: expected_instances(config, &layout, stage)?,
            }
        };
        out.push(status);
    }
    Ok(out)
}

/// First stage whose output is missing or incomplete; `None` when the run
/// is done.
pub fn next_stage(statuses: &[StageStatus]) -> Option<Stage> {
    statuses.iter().find(|s| !s.is_done()).map(|s| s.stage)
}
