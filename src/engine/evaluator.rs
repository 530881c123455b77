use std::path::Path;

use anyhow::Result;

use crate::core::config::SurfaceSettings;
use crate::core::domain::{Geometry, Stoichiometry, Structure};

/// The result of a physical evaluation.
#[derive(Debug, Clone)]
pub struct EvaluationResult {
    /// The potential energy (eV).
    pub energy: f64,
    /// Relaxed geometry. `None` keeps the input geometry (single point).
    pub relaxed: Option<Geometry>,
}

/// A generic interface for per-record energy engines.
/// Implementations must be Thread-Safe (Sync).
pub trait Evaluator: Send + Sync {
    /// Takes a structure, relaxes it, and returns the result.
    /// An `Err` is a per-record failure (non-convergence, blow-up).
    fn evaluate(&self, structure: &Structure) -> Result<EvaluationResult>;

    /// Returns the name of the engine.
    fn name(&self) -> &str;
}

/// Input of one independent global-search instance.
#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub stoichiometry: Stoichiometry,
    pub surface: SurfaceSettings,
    pub num_iterations: usize,
    pub index: usize,
    /// Instances are seeded by their index.
    pub seed: u64,
}

/// One structure found by the search, with its search-native energy.
#[derive(Debug, Clone)]
pub struct SearchCandidate {
    pub geometry: Geometry,
    pub energy: f64,
}

/// Global optimizer producing candidate structures.
pub trait SearchEngine: Send + Sync {
    fn search(&self, request: &SearchRequest) -> Result<Vec<SearchCandidate>>;

    fn name(&self) -> &str;
}

/// A trained surrogate regression model.
pub trait SurrogateModel: Send + Sync {
    /// Single-point energy prediction (eV).
    fn predict(&self, geometry: &Geometry) -> Result<f64>;

    /// Relaxes a structure on the surrogate energy surface.
    fn relax(&self, structure: &Structure) -> Result<EvaluationResult>;
}

/// Trains surrogate models and loads trained ones back.
pub trait SurrogateBackend: Send + Sync {
    /// Trains on `training` and stores the parameters at `parameters_path`.
    fn train(&self, training: &[Structure], species: &[String], parameters_path: &Path) -> Result<()>;

    /// Loads a trained model from its parameters.
    fn load(&self, parameters_path: &Path, species: &[String]) -> Result<Box<dyn SurrogateModel>>;
}
