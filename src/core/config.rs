use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::core::chemistry::{covalent_radius, BondingRule};
use crate::core::domain::Stoichiometry;
use crate::core::error::{PipelineError, Result};

// --- Shared Pieces ---

/// An external program speaking the JSON stdin/stdout protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CommandSpec {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

fn default_version() -> String {
    "v1".to_string()
}

// --- Single Stoichiometry Run ---

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SurfaceSettings {
    /// Element the support surface is built from.
    pub element: String,
    /// Lattice parameter of the fcc(111) surface (Å).
    pub a: f64,
    /// Surface size (a, b, c) for low-level calculations.
    pub low_level_size: [u32; 3],
    /// Surface size (a, b, c) for high-level calculations.
    pub high_level_size: [u32; 3],
    /// Vacuum between the top layer and the next periodic copy (Å).
    pub vacuum: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgoxSettings {
    pub num_iterations: usize,
    /// Independent search instances the merge expects.
    #[serde(default = "AgoxSettings::default_num_runs")]
    pub num_runs: usize,
}

impl AgoxSettings {
    fn default_num_runs() -> usize {
        1
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EnergyFilterSettings {
    /// Admission window above the population minimum (eV).
    #[serde(default = "EnergyFilterSettings::default_threshold")]
    pub threshold: f64,
}

impl EnergyFilterSettings {
    fn default_threshold() -> f64 {
        1.0
    }
}

impl Default for EnergyFilterSettings {
    fn default() -> Self {
        Self {
            threshold: Self::default_threshold(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GraphFilterSettings {
    /// Required: added to the covalent radius sum when deciding bonds (Å).
    pub bond_tolerance: f64,
    #[serde(default)]
    pub radii: BTreeMap<String, f64>,
    #[serde(default = "GraphFilterSettings::default_max_tag")]
    pub max_tag: u32,
}

impl GraphFilterSettings {
    fn default_max_tag() -> u32 {
        1
    }

    pub fn bonding_rule(&self) -> BondingRule {
        BondingRule {
            tolerance: self.bond_tolerance,
            radii: self.radii.clone(),
            max_tag: self.max_tag,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SurrogateSettings {
    /// Root of the cross-stoichiometry model artifact.
    pub model_dir: PathBuf,
    #[serde(default = "default_version")]
    pub version: String,
    /// KDE bandwidth used to detect unphysical relaxation drops (eV).
    #[serde(default = "SurrogateSettings::default_kde_bandwidth")]
    pub kde_bandwidth: f64,
}

impl SurrogateSettings {
    fn default_kde_bandwidth() -> f64 {
        0.1
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PhysicsRelaxSettings {
    /// `None`: one structure per instance.
    #[serde(default)]
    pub num_instances: Option<usize>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EvaluatorSettings {
    #[serde(default)]
    pub search: Option<CommandSpec>,
    #[serde(default)]
    pub surrogate: Option<CommandSpec>,
    #[serde(default)]
    pub physics: Option<CommandSpec>,
}

/// Configuration of one stoichiometry run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StoichiometryConfig {
    pub run_dir: PathBuf,
    pub nanocluster_stoichiometry: Stoichiometry,
    pub surface: SurfaceSettings,
    pub agox: AgoxSettings,
    #[serde(default)]
    pub energy_filter: EnergyFilterSettings,
    pub graph_filter: GraphFilterSettings,
    #[serde(default)]
    pub surrogate: Option<SurrogateSettings>,
    #[serde(default)]
    pub physics_relax: PhysicsRelaxSettings,
    #[serde(default)]
    pub evaluators: EvaluatorSettings,
}

// --- Cross-Stoichiometry Surrogate Training ---

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SurrogateTrainingConfig {
    pub model_dir: PathBuf,
    #[serde(default = "default_version")]
    pub version: String,
    /// Stoichiometry runs whose first graph-filtered population is trained on.
    pub input_run_dirs: Vec<PathBuf>,
    /// Caps the training set (memory).
    pub max_train_structures: usize,
    /// Caps each evaluation subset (runtime).
    pub max_evaluate_structures: usize,
    #[serde(default)]
    pub trainer: Option<CommandSpec>,
}

// --- Loading & Validation ---

pub trait Validate {
    fn validate(&self) -> Result<()>;
}

fn ensure(cond: bool, msg: impl FnOnce() -> String) -> Result<()> {
    if cond {
        Ok(())
    } else {
        Err(PipelineError::config(msg()))
    }
}

fn validate_version(version: &str) -> Result<()> {
    ensure(
        !version.is_empty() && version.chars().all(|c| c.is_ascii_alphanumeric() || "._-".contains(c)),
        || format!("artifact version '{}' must be a plain directory name", version),
    )
}

impl Validate for StoichiometryConfig {
    fn validate(&self) -> Result<()> {
        let s = &self.surface;
        ensure(covalent_radius(&s.element).is_some() || self.graph_filter.radii.contains_key(&s.element), || {
            format!("unknown surface element '{}'", s.element)
        })?;
        ensure(s.a.is_finite() && s.a > 0.0, || format!("surface.a must be > 0, got {}", s.a))?;
        ensure(s.vacuum.is_finite() && s.vacuum > 0.0, || {
            format!("surface.vacuum must be > 0, got {}", s.vacuum)
        })?;
        ensure(
            s.low_level_size.iter().chain(&s.high_level_size).all(|&n| n > 0),
            || "surface sizes must be non-zero".to_string(),
        )?;

        ensure(self.agox.num_iterations > 0, || "agox.num_iterations must be > 0".to_string())?;
        ensure(self.agox.num_runs > 0, || "agox.num_runs must be > 0".to_string())?;

        let t = self.energy_filter.threshold;
        ensure(t.is_finite() && t >= 0.0, || {
            format!("energy_filter.threshold must be finite and >= 0, got {}", t)
        })?;

        let g = &self.graph_filter;
        ensure(g.bond_tolerance.is_finite() && g.bond_tolerance >= 0.0, || {
            format!("graph_filter.bond_tolerance must be finite and >= 0, got {}", g.bond_tolerance)
        })?;
        for (symbol, r) in &g.radii {
            ensure(r.is_finite() && *r > 0.0, || {
                format!("graph_filter.radii.{} must be > 0, got {}", symbol, r)
            })?;
        }

        if let Some(sur) = &self.surrogate {
            validate_version(&sur.version)?;
            ensure(sur.kde_bandwidth.is_finite() && sur.kde_bandwidth > 0.0, || {
                format!("surrogate.kde_bandwidth must be > 0, got {}", sur.kde_bandwidth)
            })?;
        }

        if let Some(n) = self.physics_relax.num_instances {
            ensure(n > 0, || "physics_relax.num_instances must be > 0".to_string())?;
        }
        Ok(())
    }
}

impl Validate for SurrogateTrainingConfig {
    fn validate(&self) -> Result<()> {
        validate_version(&self.version)?;
        ensure(!self.input_run_dirs.is_empty(), || "input_run_dirs must not be empty".to_string())?;
        ensure(self.max_train_structures > 0, || "max_train_structures must be > 0".to_string())?;
        ensure(self.max_evaluate_structures > 0, || {
            "max_evaluate_structures must be > 0".to_string()
        })?;
        Ok(())
    }
}

/// Parses a JSON configuration document and validates it.
/// Unknown keys and invariant violations are configuration errors.
pub fn load_config<C: DeserializeOwned + Validate>(path: &Path) -> Result<C> {
    if matches!(path.extension().and_then(|e| e.to_str()), Some("yaml" | "yml")) {
        return Err(PipelineError::config(format!(
            "{}: configuration documents are JSON; convert YAML files to JSON with the same keys",
            path.display()
        )));
    }
    let text = fs::read_to_string(path).map_err(|e| PipelineError::io(path, e))?;
    parse_config(&text).map_err(|e| match e {
        PipelineError::Configuration(msg) => PipelineError::config(format!("{}: {}", path.display(), msg)),
        other => other,
    })
}

/// Same as [`load_config`], from an in-memory document.
pub fn parse_config<C: DeserializeOwned + Validate>(text: &str) -> Result<C> {
    let config: C = serde_json::from_str(text).map_err(|e| PipelineError::config(e.to_string()))?;
    config.validate()?;
    Ok(config)
}
