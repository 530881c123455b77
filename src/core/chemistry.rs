use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::core::error::{PipelineError, Result};

/// Covalent radius (Å) of an element, Cordero et al. (2008).
/// Covers the elements common in oxide and metal-supported cluster work;
/// anything else must come in through configuration overrides.
pub fn covalent_radius(symbol: &str) -> Option<f64> {
    let r = match symbol {
        "H" => 0.31,
        "Li" => 1.28,
        "Be" => 0.96,
        "B" => 0.84,
        "C" => 0.76,
        "N" => 0.71,
        "O" => 0.66,
        "F" => 0.57,
        "Na" => 1.66,
        "Mg" => 1.41,
        "Al" => 1.21,
        "Si" => 1.11,
        "P" => 1.07,
        "S" => 1.05,
        "Cl" => 1.02,
        "K" => 2.03,
        "Ca" => 1.76,
        "Sc" => 1.70,
        "Ti" => 1.60,
        "V" => 1.53,
        "Cr" => 1.39,
        "Mn" => 1.39,
        "Fe" => 1.32,
        "Co" => 1.26,
        "Ni" => 1.24,
        "Cu" => 1.32,
        "Zn" => 1.22,
        "Ga" => 1.22,
        "Ge" => 1.20,
        "As" => 1.19,
        "Se" => 1.20,
        "Br" => 1.20,
        "Sr" => 1.95,
        "Y" => 1.90,
        "Zr" => 1.75,
        "Nb" => 1.64,
        "Mo" => 1.54,
        "Ru" => 1.46,
        "Rh" => 1.42,
        "Pd" => 1.39,
        "Ag" => 1.45,
        "Cd" => 1.44,
        "In" => 1.42,
        "Sn" => 1.39,
        "Sb" => 1.39,
        "Ba" => 2.15,
        "La" => 2.07,
        "Ce" => 2.04,
        "Hf" => 1.75,
        "Ta" => 1.70,
        "W" => 1.62,
        "Re" => 1.51,
        "Os" => 1.44,
        "Ir" => 1.41,
        "Pt" => 1.36,
        "Au" => 1.36,
        "Pb" => 1.46,
        "Bi" => 1.48,
        _ => return None,
    };
    Some(r)
}

/// Bonding rule shared by every fingerprint of a filter pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BondingRule {
    /// Added to r_a + r_b (Å). Small changes here can merge or split
    /// equivalence classes, so it has no default.
    pub tolerance: f64,
    /// Per-element covalent radius overrides (Å).
    pub radii: BTreeMap<String, f64>,
    /// Atoms tagged above this are left out of the bond graph.
    pub max_tag: u32,
}

impl BondingRule {
    pub fn new(tolerance: f64) -> Self {
        Self {
            tolerance,
            radii: BTreeMap::new(),
            max_tag: 1,
        }
    }

    pub fn radius(&self, symbol: &str) -> Option<f64> {
        self.radii.get(symbol).copied().or_else(|| covalent_radius(symbol))
    }
}

/// A flattened 2D matrix storing pre-computed squared bond cutoffs.
/// Access is O(1) via `index = i * N + j`.
#[derive(Debug, Clone)]
pub struct BondCutoffs {
    species: Vec<String>,
    cutoff_matrix_sq: Vec<f64>,
}

impl BondCutoffs {
    /// Builds the grid for the given species under `rule`.
    /// Fails if any species has no known radius or the tolerance is invalid.
    pub fn new<S: AsRef<str>>(species: &[S], rule: &BondingRule) -> Result<Self> {
        if !rule.tolerance.is_finite() || rule.tolerance < 0.0 {
            return Err(PipelineError::config(format!(
                "bond tolerance must be finite and >= 0, got {}",
                rule.tolerance
            )));
        }

        let mut names: Vec<String> = species.iter().map(|s| s.as_ref().to_string()).collect();
        names.sort();
        names.dedup();

        let mut radii = Vec::with_capacity(names.len());
        for name in &names {
            let r = rule
                .radius(name)
                .ok_or_else(|| PipelineError::config(format!("no covalent radius known for '{}'", name)))?;
            if !r.is_finite() || r <= 0.0 {
                return Err(PipelineError::config(format!("invalid covalent radius {} for '{}'", r, name)));
            }
            radii.push(r);
        }

        let n = names.len();
        let mut grid = vec![0.0; n * n];
        for i in 0..n {
            for j in 0..n {
                let cutoff = radii[i] + radii[j] + rule.tolerance;
                grid[i * n + j] = cutoff * cutoff;
            }
        }

        Ok(Self {
            species: names,
            cutoff_matrix_sq: grid,
        })
    }

    pub fn species_index(&self, symbol: &str) -> Option<usize> {
        self.species.binary_search_by(|s| s.as_str().cmp(symbol)).ok()
    }

    /// Squared distance below which two atoms are considered bonded.
    #[inline(always)]
    pub fn get_cutoff_sq(&self, id_a: usize, id_b: usize) -> f64 {
        self.cutoff_matrix_sq[id_a * self.species.len() + id_b]
    }
}
