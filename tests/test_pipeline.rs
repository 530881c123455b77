mod common;

use std::path::Path;

use cluster_funnel::core::config::{parse_config, StoichiometryConfig, SurrogateTrainingConfig};
use chrono::Utc;
use cluster_funnel::core::domain::{EvaluationMethod, Population};
use cluster_funnel::engine::surrogate::{ModelArtifact, ModelInfo};
use cluster_funnel::core::error::PipelineError;
use cluster_funnel::pipeline::runner::{self, next_stage};
use cluster_funnel::pipeline::stage::Stage;
use cluster_funnel::pipeline::store::RunLayout;
use common::*;
use tempfile::tempdir;

fn configs(root: &Path) -> (StoichiometryConfig, SurrogateTrainingConfig) {
    let run_dir = root.join("Cu2O");
    let model_dir = root.join("models");
    let config = parse_config(&run_config_json(&run_dir, &model_dir, 2)).unwrap();

    let training = serde_json::json!({
        "model_dir": model_dir,
        "version": "test",
        "input_run_dirs": [run_dir, root.join("never_ran")],
        "max_train_structures": 10,
        "max_evaluate_structures": 10
    });
    let training = parse_config(&training.to_string()).unwrap();
    (config, training)
}

#[test]
fn test_full_funnel() {
    let dir = tempdir().unwrap();
    let (config, training) = configs(dir.path());
    let layout = RunLayout::new(&config.run_dir);

    // Search: the off-composition candidate is dropped
    for index in 0..2 {
        let part = runner::run_search(&config, index, &MockSearch).unwrap();
        assert_eq!(part.records.len(), 4);
        assert!(part
            .records
            .iter()
            .all(|r| r.provenance().index == Some(index)));
    }
    assert_eq!(next_stage(&runner::run_status(&config).unwrap()), Some(Stage::EnergyFilter));

    // -8.0 lies outside the 1 eV window
    let filtered = runner::run_energy_filter(&config).unwrap();
    assert_eq!(filtered.len(), 6);

    // One chain and one triangle survive, the lowest of each
    let gf1 = runner::run_graph_filter(&config, Stage::GraphFilter1).unwrap();
    let energies: Vec<f64> = gf1.records.iter().filter_map(|r| r.energy()).collect();
    assert_eq!(energies, vec![-10.0, -9.5]);

    let model = runner::run_surrogate_train(&training, 0, &MockBackend).unwrap();
    assert_eq!(model.train_count, 2);
    assert_eq!(model.species, vec!["Cu".to_string(), "O".to_string()]);
    assert!(model.overall_rmse.is_some());

    let relaxed = runner::run_surrogate_relax(&config, &MockBackend).unwrap();
    assert_eq!(relaxed.len(), 2);
    for r in &relaxed.records {
        assert_eq!(r.evaluation().map(|e| e.method), Some(EvaluationMethod::Surrogate));
        assert!((r.energy().unwrap() - (-9.1)).abs() < 1e-9);
    }

    let gf2 = runner::run_graph_filter(&config, Stage::GraphFilter2).unwrap();
    assert_eq!(gf2.len(), 2);

    // Default: one physics instance per structure
    assert_eq!(runner::physics_instance_count(&config).unwrap(), 2);
    let evaluator = MockEvaluator { fail_above: 0.0 };
    runner::run_physics_relax(&config, 0, &evaluator).unwrap();

    assert!(matches!(
        runner::run_graph_filter(&config, Stage::GraphFilter3),
        Err(PipelineError::IncompleteMerge { .. })
    ));

    runner::run_physics_relax(&config, 1, &evaluator).unwrap();
    let last = runner::run_graph_filter(&config, Stage::GraphFilter3).unwrap();
    assert_eq!(last.len(), 2);
    assert!(last
        .records
        .iter()
        .all(|r| r.evaluation().map(|e| e.method) == Some(EvaluationMethod::Physics)));

    let summary = std::fs::read_to_string(layout.summary_path()).unwrap();
    let mut lines = summary.lines();
    assert!(lines.next().unwrap().starts_with("rank,id,energy"));
    assert_eq!(lines.count(), 2);

    assert_eq!(next_stage(&runner::run_status(&config).unwrap()), None);
}

#[test]
fn test_search_failures() {
    let dir = tempdir().unwrap();
    let (config, _) = configs(dir.path());

    assert!(matches!(
        runner::run_search(&config, 0, &FailingSearch),
        Err(PipelineError::StageExhausted {
            stage: Stage::Search,
            ..
        })
    ));
    assert!(matches!(
        runner::run_search(&config, 2, &MockSearch),
        Err(PipelineError::Configuration(_))
    ));

    // Nothing merged yet
    runner::run_search(&config, 1, &MockSearch).unwrap();
    match runner::run_energy_filter(&config) {
        Err(PipelineError::IncompleteMerge { missing, .. }) => assert_eq!(missing, vec![0]),
        other => panic!("expected incomplete merge, got {:?}", other.map(|p| p.len())),
    }
}

#[test]
fn test_stage_order_is_enforced() {
    let dir = tempdir().unwrap();
    let (config, training) = configs(dir.path());

    assert!(matches!(
        runner::run_graph_filter(&config, Stage::GraphFilter2),
        Err(PipelineError::Configuration(_))
    ));
    assert!(matches!(
        runner::run_graph_filter(&config, Stage::EnergyFilter),
        Err(PipelineError::Configuration(_))
    ));
    assert!(matches!(
        runner::run_surrogate_train(&training, 0, &MockBackend),
        Err(PipelineError::Configuration(_))
    ));
    // No trained model yet
    assert!(matches!(
        runner::run_surrogate_relax(&config, &MockBackend),
        Err(PipelineError::Configuration(_))
    ));
}

#[test]
fn test_exhausted_physics_instance_still_reports() {
    let dir = tempdir().unwrap();
    let (config, _) = configs(dir.path());
    let layout = RunLayout::new(&config.run_dir);

    let pop = Population::new(
        Stage::GraphFilter2,
        config.nanocluster_stoichiometry.clone(),
        vec![evaluated(linear(), -9.0), evaluated(triangle(), -8.0)],
    );
    layout.write_population(&pop).unwrap();

    let mut config = config;
    config.physics_relax.num_instances = Some(1);

    let res = runner::run_physics_relax(&config, 0, &MockEvaluator { fail_above: -100.0 });
    assert!(matches!(
        res,
        Err(PipelineError::StageExhausted {
            stage: Stage::PhysicsRelax,
            attempted: 2
        })
    ));

    let parts = layout.read_partitions(Stage::PhysicsRelax).unwrap();
    assert_eq!(parts.len(), 1);
    assert!(parts[0].records.is_empty());
    assert_eq!(parts[0].failed.len(), 2);

    // The merge sees a finished instance with nothing to offer
    let last = runner::run_graph_filter(&config, Stage::GraphFilter3).unwrap();
    assert!(last.is_empty());
}

#[test]
fn test_status_waits_for_every_instance() {
    let dir = tempdir().unwrap();
    let run_dir = dir.path().join("Cu2O");
    let config: StoichiometryConfig =
        parse_config(&run_config_json(&run_dir, &dir.path().join("models"), 4)).unwrap();

    runner::run_search(&config, 0, &MockSearch).unwrap();
    let statuses = runner::run_status(&config).unwrap();
    let search = &statuses[0];
    assert_eq!(search.stage, Stage::Search);
    assert_eq!((search.partitions, search.expected), (1, Some(4)));
    assert!(!search.is_done());
    assert_eq!(next_stage(&statuses), Some(Stage::Search));

    for index in 1..4 {
        runner::run_search(&config, index, &MockSearch).unwrap();
    }
    assert_eq!(next_stage(&runner::run_status(&config).unwrap()), Some(Stage::EnergyFilter));
}

#[test]
fn test_status_counts_physics_instances() {
    let dir = tempdir().unwrap();
    let (config, _) = configs(dir.path());
    let layout = RunLayout::new(&config.run_dir);

    let physics = |config: &StoichiometryConfig| {
        runner::run_status(config)
            .unwrap()
            .into_iter()
            .find(|s| s.stage == Stage::PhysicsRelax)
            .unwrap()
    };
    assert_eq!(physics(&config).expected, None);

    let pop = Population::new(
        Stage::GraphFilter2,
        config.nanocluster_stoichiometry.clone(),
        vec![evaluated(linear(), -9.0), evaluated(triangle(), -8.0)],
    );
    layout.write_population(&pop).unwrap();
    assert_eq!(physics(&config).expected, Some(2));

    runner::run_physics_relax(&config, 1, &MockEvaluator { fail_above: 0.0 }).unwrap();
    assert!(!physics(&config).is_done());
    runner::run_physics_relax(&config, 0, &MockEvaluator { fail_above: 0.0 }).unwrap();
    assert!(physics(&config).is_done());
}

#[test]
fn test_empty_physics_input_is_not_an_error() {
    let dir = tempdir().unwrap();
    let (config, _) = configs(dir.path());
    let layout = RunLayout::new(&config.run_dir);
    layout
        .write_population(&Population::new(
            Stage::GraphFilter2,
            config.nanocluster_stoichiometry.clone(),
            vec![],
        ))
        .unwrap();

    let part = runner::run_physics_relax(&config, 0, &MockEvaluator { fail_above: 0.0 }).unwrap();
    assert!(part.records.is_empty());
    assert!(layout.partition_indices(Stage::PhysicsRelax).unwrap().is_empty());

    let physics = runner::run_status(&config)
        .unwrap()
        .into_iter()
        .find(|s| s.stage == Stage::PhysicsRelax)
        .unwrap();
    assert!(physics.is_done());

    let last = runner::run_graph_filter(&config, Stage::GraphFilter3).unwrap();
    assert!(last.is_empty());
}

#[test]
fn test_unphysical_surrogate_relaxation_is_reverted() {
    let dir = tempdir().unwrap();
    let (config, _) = configs(dir.path());
    let layout = RunLayout::new(&config.run_dir);

    let mut records: Vec<_> = (0..20).map(|i| evaluated(linear(), -10.0 + 0.01 * i as f64)).collect();
    let outlier = evaluated(triangle(), -9.5);
    records.push(outlier.clone());
    layout
        .write_population(&Population::new(
            Stage::GraphFilter1,
            config.nanocluster_stoichiometry.clone(),
            records,
        ))
        .unwrap();

    let settings = config.surrogate.as_ref().unwrap();
    ModelArtifact::new(&settings.model_dir, &settings.version)
        .commit(&ModelInfo {
            index: 0,
            parameters_path: settings.model_dir.join("params.bin"),
            overall_rmse: Some(0.05),
            in_rmse: Some(0.05),
            out_rmse: None,
            species: vec!["Cu".into(), "O".into()],
            train_count: 20,
            trained_at: Utc::now(),
        })
        .unwrap();

    let relaxed = runner::run_surrogate_relax(&config, &OutlierBackend).unwrap();
    assert_eq!(relaxed.len(), 21);

    let reverted = relaxed
        .records
        .iter()
        .find(|r| r.provenance().origin == Some(outlier.id()))
        .unwrap();
    assert_eq!(reverted.geometry(), &triangle());
    assert_eq!(reverted.energy(), Some(-9.0));
    assert_eq!(reverted.evaluation().map(|e| e.method), Some(EvaluationMethod::Surrogate));
    assert_eq!(reverted.provenance().stage, Stage::SurrogateRelax);

    // Everyone else keeps the relaxed energy
    let kept: Vec<_> = relaxed
        .records
        .iter()
        .filter(|r| r.provenance().origin != Some(outlier.id()))
        .collect();
    assert_eq!(kept.len(), 20);
    assert!(kept.iter().all(|r| (r.energy().unwrap() - (-9.1)).abs() < 1e-9));
}

#[test]
fn test_summary_write_failure_is_io() {
    let dir = tempdir().unwrap();
    let (mut config, _) = configs(dir.path());
    config.physics_relax.num_instances = Some(1);
    let layout = RunLayout::new(&config.run_dir);

    layout
        .write_population(&Population::new(
            Stage::GraphFilter2,
            config.nanocluster_stoichiometry.clone(),
            vec![evaluated(linear(), -9.0)],
        ))
        .unwrap();
    runner::run_physics_relax(&config, 0, &MockEvaluator { fail_above: 0.0 }).unwrap();

    // A directory where the summary table should go
    std::fs::create_dir_all(layout.summary_path()).unwrap();

    let err = runner::run_graph_filter(&config, Stage::GraphFilter3).unwrap_err();
    assert!(matches!(err, PipelineError::Io { .. }), "got {:?}", err);
    assert_eq!(err.exit_code(), 1);
}
