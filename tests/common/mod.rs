#![allow(dead_code)]

use std::fs;
use std::path::Path;

use anyhow::{bail, Result};
use nalgebra::Point3;

use cluster_funnel::core::domain::{Atom, Evaluation, EvaluationMethod, Geometry, Provenance, Structure};
use cluster_funnel::engine::evaluator::{
    EvaluationResult, Evaluator, SearchCandidate, SearchEngine, SearchRequest, SurrogateBackend, SurrogateModel,
};
use cluster_funnel::pipeline::stage::Stage;

// --- Geometries (Cu2O adsorbate, no support) ---
//
// With a 0.3 Å tolerance: Cu-O bonds below 2.28 Å, Cu-Cu below 2.94 Å.

pub const TOLERANCE: f64 = 0.3;

pub fn geometry(atoms: &[(&str, [f64; 3])]) -> Geometry {
    Geometry::new(
        atoms
            .iter()
            .map(|(s, p)| Atom::new(s, Point3::new(p[0], p[1], p[2]), 0))
            .collect(),
        None,
    )
}

/// Cu-O-Cu chain, Cu atoms not bonded to each other.
pub fn linear() -> Geometry {
    geometry(&[("Cu", [0.0, 0.0, 0.0]), ("O", [1.8, 0.0, 0.0]), ("Cu", [3.6, 0.0, 0.0])])
}

/// `linear` with every atom displaced 0.3 Å along z; same bonds.
pub fn linear_perturbed() -> Geometry {
    geometry(&[("Cu", [0.0, 0.0, 0.3]), ("O", [1.8, 0.0, -0.3]), ("Cu", [3.6, 0.0, 0.3])])
}

/// Cu-Cu-O triangle, all three pairs bonded.
pub fn triangle() -> Geometry {
    geometry(&[("Cu", [0.0, 0.0, 0.0]), ("Cu", [2.4, 0.0, 0.0]), ("O", [1.2, 1.2, 0.0])])
}

/// Cu2O with one Cu far away from the rest.
pub fn split() -> Geometry {
    geometry(&[("Cu", [0.0, 0.0, 0.0]), ("O", [1.8, 0.0, 0.0]), ("Cu", [12.0, 0.0, 0.0])])
}

pub fn record(geometry: Geometry, energy: Option<f64>) -> Structure {
    Structure::new(
        geometry,
        Provenance {
            stage: Stage::Search,
            index: Some(0),
            origin: None,
        },
        energy.map(|energy| Evaluation {
            energy,
            method: EvaluationMethod::GlobalSearch,
        }),
    )
}

pub fn evaluated(geometry: Geometry, energy: f64) -> Structure {
    record(geometry, Some(energy))
}

// --- Configuration ---

pub fn run_config_json(run_dir: &Path, model_dir: &Path, num_runs: usize) -> String {
    serde_json::json!({
        "run_dir": run_dir,
        "nanocluster_stoichiometry": "Cu2O",
        "surface": {
            "element": "Cu",
            "a": 3.61,
            "low_level_size": [3, 3, 3],
            "high_level_size": [4, 4, 4],
            "vacuum": 10.0
        },
        "agox": { "num_iterations": 10, "num_runs": num_runs },
        "energy_filter": { "threshold": 1.0 },
        "graph_filter": { "bond_tolerance": TOLERANCE },
        "surrogate": { "model_dir": model_dir, "version": "test" }
    })
    .to_string()
}

// --- Mock Engines ---

/// Lowers the input energy by 0.5 eV without moving atoms. Records whose
/// input energy is above `fail_above` fail.
pub struct MockEvaluator {
    pub fail_above: f64,
}

impl Evaluator for MockEvaluator {
    fn evaluate(&self, structure: &Structure) -> Result<EvaluationResult> {
        let e = structure.energy().unwrap_or(0.0);
        if e > self.fail_above {
            bail!("did not converge");
        }
        Ok(EvaluationResult {
            energy: e - 0.5,
            relaxed: Some(structure.geometry().clone()),
        })
    }

    fn name(&self) -> &str {
        "Mock Evaluator"
    }
}

/// Returns the same candidate list for every instance, plus one candidate
/// with the wrong composition.
pub struct MockSearch;

impl SearchEngine for MockSearch {
    fn search(&self, _request: &SearchRequest) -> Result<Vec<SearchCandidate>> {
        let c = |geometry, energy| SearchCandidate { geometry, energy };
        Ok(vec![
            c(linear(), -10.0),
            c(linear_perturbed(), -9.8),
            c(triangle(), -9.5),
            c(triangle(), -8.0),
            c(geometry(&[("Cu", [0.0, 0.0, 0.0])]), -12.0),
        ])
    }

    fn name(&self) -> &str {
        "Mock Search"
    }
}

pub struct FailingSearch;

impl SearchEngine for FailingSearch {
    fn search(&self, _request: &SearchRequest) -> Result<Vec<SearchCandidate>> {
        bail!("optimizer crashed")
    }

    fn name(&self) -> &str {
        "Failing Search"
    }
}

/// Energy is -3 eV per atom; relaxation lowers it by 0.1 eV in place.
pub struct MockModel;

impl SurrogateModel for MockModel {
    fn predict(&self, geometry: &Geometry) -> Result<f64> {
        Ok(-3.0 * geometry.len() as f64)
    }

    fn relax(&self, structure: &Structure) -> Result<EvaluationResult> {
        Ok(EvaluationResult {
            energy: self.predict(structure.geometry())? - 0.1,
            relaxed: None,
        })
    }
}

pub struct MockBackend;

impl SurrogateBackend for MockBackend {
    fn train(&self, training: &[Structure], _species: &[String], parameters_path: &Path) -> Result<()> {
        if training.is_empty() {
            bail!("nothing to train on");
        }
        fs::write(parameters_path, format!("{} structures", training.len()))?;
        Ok(())
    }

    fn load(&self, parameters_path: &Path, _species: &[String]) -> Result<Box<dyn SurrogateModel>> {
        if !parameters_path.exists() {
            bail!("missing {}", parameters_path.display());
        }
        Ok(Box::new(MockModel))
    }
}

/// Like `MockModel`, but triangles slide 0.5 Å and fall 5 eV during
/// relaxation, far below every other record.
pub struct OutlierModel;

impl SurrogateModel for OutlierModel {
    fn predict(&self, geometry: &Geometry) -> Result<f64> {
        MockModel.predict(geometry)
    }

    fn relax(&self, structure: &Structure) -> Result<EvaluationResult> {
        let g = structure.geometry();
        let e0 = self.predict(g)?;
        if g == &triangle() {
            let mut moved = g.clone();
            for atom in &mut moved.atoms {
                atom.position.z += 0.5;
            }
            return Ok(EvaluationResult {
                energy: e0 - 5.0,
                relaxed: Some(moved),
            });
        }
        Ok(EvaluationResult {
            energy: e0 - 0.1,
            relaxed: None,
        })
    }
}

pub struct OutlierBackend;

impl SurrogateBackend for OutlierBackend {
    fn train(&self, _training: &[Structure], _species: &[String], _parameters_path: &Path) -> Result<()> {
        bail!("not trainable")
    }

    fn load(&self, _parameters_path: &Path, _species: &[String]) -> Result<Box<dyn SurrogateModel>> {
        Ok(Box::new(OutlierModel))
    }
}
