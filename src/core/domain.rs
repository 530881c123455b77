use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use nalgebra::{Matrix3, Point3, Vector3};
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::error::{PipelineError, Result};
use crate::pipeline::stage::Stage;

// --- Layer tags ---

/// Tag of atoms belonging to the deposited nanocluster.
pub const ADSORBATE_TAG: u32 = 0;
/// Tag of the top surface layer (layers below count upwards from here).
pub const TOP_LAYER_TAG: u32 = 1;

// --- Geometry Types ---

/// A single atom instance in a structure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Atom {
    pub symbol: String,
    pub position: Point3<f64>, // Å
    /// 0 = adsorbate, 1 = top surface layer, 2+ = deeper layers.
    #[serde(default)]
    pub tag: u32,
}

impl Atom {
    pub fn new(symbol: &str, position: Point3<f64>, tag: u32) -> Self {
        Self {
            symbol: symbol.to_string(),
            position,
            tag,
        }
    }

    pub fn is_adsorbate(&self) -> bool {
        self.tag == ADSORBATE_TAG
    }
}

/// Periodic cell. Surfaces are periodic in-plane only, hence per-axis flags.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lattice {
    pub vectors: Matrix3<f64>, // Columns are a, b, c
    pub inverse: Matrix3<f64>, // Precomputed for fractional conversion
    pub pbc: [bool; 3],
}

impl Lattice {
    pub fn new(a: Vector3<f64>, b: Vector3<f64>, c: Vector3<f64>, pbc: [bool; 3]) -> Option<Self> {
        let vectors = Matrix3::from_columns(&[a, b, c]);
        let inverse = vectors.try_inverse()?;
        Some(Self { vectors, inverse, pbc })
    }

    pub fn to_fractional(&self, p: &Point3<f64>) -> Point3<f64> {
        Point3::from(self.inverse * p.coords)
    }

    pub fn to_cartesian(&self, p: &Point3<f64>) -> Point3<f64> {
        Point3::from(self.vectors * p.coords)
    }
}

/// Atomic positions, species and (optional) cell of one configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Geometry {
    pub atoms: Vec<Atom>,
    pub lattice: Option<Lattice>,
}

impl Geometry {
    pub fn new(atoms: Vec<Atom>, lattice: Option<Lattice>) -> Self {
        Self { atoms, lattice }
    }

    pub fn len(&self) -> usize {
        self.atoms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.atoms.is_empty()
    }

    /// Element counts of the adsorbate atoms only.
    pub fn adsorbate_composition(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for atom in self.atoms.iter().filter(|a| a.is_adsorbate()) {
            *counts.entry(atom.symbol.clone()).or_insert(0) += 1;
        }
        counts
    }

    /// Rejects geometries no stage can work with.
    pub fn validate(&self) -> Result<()> {
        if self.atoms.is_empty() {
            return Err(PipelineError::config("structure has zero atoms"));
        }
        for (i, atom) in self.atoms.iter().enumerate() {
            if atom.position.coords.iter().any(|c| !c.is_finite()) {
                return Err(PipelineError::config(format!(
                    "atom {} ({}) has non-finite coordinates",
                    i, atom.symbol
                )));
            }
        }
        Ok(())
    }
}

// --- Evaluation ---

/// Which evaluator produced an energy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvaluationMethod {
    GlobalSearch,
    Surrogate,
    Physics,
}

impl fmt::Display for EvaluationMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EvaluationMethod::GlobalSearch => "global_search",
            EvaluationMethod::Surrogate => "surrogate",
            EvaluationMethod::Physics => "physics",
        };
        f.write_str(s)
    }
}

/// Energy and its producing method travel together, so a record is either
/// fully evaluated or not evaluated at all.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    pub energy: f64, // eV
    pub method: EvaluationMethod,
}

/// Where a record came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provenance {
    pub stage: Stage,
    /// Parallel instance index, for records produced by parallel stages.
    pub index: Option<usize>,
    /// Record this one was re-evaluated from.
    pub origin: Option<Uuid>,
}

// --- The Core Entity ---

/// One candidate configuration. Immutable once created: re-evaluation
/// yields a new record whose provenance points back at this one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Structure {
    id: Uuid,
    geometry: Geometry,
    provenance: Provenance,
    evaluation: Option<Evaluation>,
}

impl Structure {
    pub fn new(geometry: Geometry, provenance: Provenance, evaluation: Option<Evaluation>) -> Self {
        Self {
            id: Uuid::new_v4(),
            geometry,
            provenance,
            evaluation,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    pub fn provenance(&self) -> &Provenance {
        &self.provenance
    }

    pub fn evaluation(&self) -> Option<&Evaluation> {
        self.evaluation.as_ref()
    }

    pub fn energy(&self) -> Option<f64> {
        self.evaluation.map(|e| e.energy)
    }

    /// Creates the successor record produced by `stage` from this one.
    pub fn derive(
        &self,
        geometry: Geometry,
        evaluation: Evaluation,
        stage: Stage,
        index: Option<usize>,
    ) -> Structure {
        Structure::new(
            geometry,
            Provenance {
                stage,
                index,
                origin: Some(self.id),
            },
            Some(evaluation),
        )
    }
}

/// Canonical order: energy ascending (unevaluated last), then id.
pub fn canonical_cmp(a: &Structure, b: &Structure) -> Ordering {
    let by_energy = match (a.energy(), b.energy()) {
        (Some(ea), Some(eb)) => ea.total_cmp(&eb),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    };
    by_energy.then_with(|| a.id.cmp(&b.id))
}

pub fn sort_canonical(records: &mut [Structure]) {
    records.sort_by(canonical_cmp);
}

// --- Stoichiometry ---

fn formula_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"([A-Z][a-z]?)(\d*)").expect("static formula pattern"))
}

/// Element counts of the nanocluster being searched for, e.g. `Cu4O2`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Stoichiometry {
    counts: BTreeMap<String, usize>,
}

impl Stoichiometry {
    pub fn counts(&self) -> &BTreeMap<String, usize> {
        &self.counts
    }

    pub fn atom_count(&self) -> usize {
        self.counts.values().sum()
    }

    /// Verifies that the adsorbate atoms of a geometry match these counts.
    pub fn matches(&self, geometry: &Geometry) -> bool {
        geometry.adsorbate_composition() == self.counts
    }
}

impl FromStr for Stoichiometry {
    type Err = PipelineError;

    fn from_str(formula: &str) -> Result<Self> {
        let trimmed = formula.trim();
        if trimmed.is_empty() {
            return Err(PipelineError::config("empty stoichiometry"));
        }

        let mut counts = BTreeMap::new();
        let mut consumed = 0;
        for cap in formula_regex().captures_iter(trimmed) {
            let whole = cap.get(0).map(|m| m.range()).unwrap_or(0..0);
            if whole.start != consumed {
                break;
            }
            consumed = whole.end;

            let symbol = cap[1].to_string();
            let count = if cap[2].is_empty() {
                1
            } else {
                cap[2].parse::<usize>().map_err(|_| {
                    PipelineError::config(format!("invalid count in stoichiometry '{}'", formula))
                })?
            };
            if count == 0 {
                return Err(PipelineError::config(format!(
                    "zero count for {} in stoichiometry '{}'",
                    symbol, formula
                )));
            }
            *counts.entry(symbol).or_insert(0) += count;
        }

        if consumed != trimmed.len() {
            return Err(PipelineError::config(format!("malformed stoichiometry '{}'", formula)));
        }
        Ok(Self { counts })
    }
}

impl TryFrom<String> for Stoichiometry {
    type Error = PipelineError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Stoichiometry> for String {
    fn from(value: Stoichiometry) -> Self {
        value.to_string()
    }
}

impl fmt::Display for Stoichiometry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (symbol, count) in &self.counts {
            if *count == 1 {
                write!(f, "{}", symbol)?;
            } else {
                write!(f, "{}{}", symbol, count)?;
            }
        }
        Ok(())
    }
}

// --- Populations ---

/// The complete output of one stage for one stoichiometry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Population {
    pub stage: Stage,
    pub stoichiometry: Stoichiometry,
    pub records: Vec<Structure>,
}

impl Population {
    pub fn new(stage: Stage, stoichiometry: Stoichiometry, records: Vec<Structure>) -> Self {
        Self {
            stage,
            stoichiometry,
            records,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn min_energy(&self) -> Option<f64> {
        self.records
            .iter()
            .filter_map(|r| r.energy())
            .min_by(|a, b| a.total_cmp(b))
    }
}

/// One parallel worker's share of a stage's output, keyed by worker index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Partition {
    pub stage: Stage,
    pub stoichiometry: Stoichiometry,
    pub index: usize,
    pub total: usize,
    pub records: Vec<Structure>,
    /// Ids of input records whose evaluation failed in this instance.
    #[serde(default)]
    pub failed: Vec<Uuid>,
}
