use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::domain::EvaluationMethod;

/// Pipeline stages of one stoichiometry run, in execution order.
///
/// `Search(parallel) → EnergyFilter → GraphFilter1 → SurrogateTrain(parallel)
/// → SurrogateRelax → GraphFilter2 → PhysicsRelax(parallel) → GraphFilter3 → Done`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Stage {
    #[serde(rename = "search")]
    Search,
    #[serde(rename = "energy_filter")]
    EnergyFilter,
    #[serde(rename = "graph_filter_1")]
    GraphFilter1,
    #[serde(rename = "surrogate_train")]
    SurrogateTrain,
    #[serde(rename = "surrogate_relax")]
    SurrogateRelax,
    #[serde(rename = "graph_filter_2")]
    GraphFilter2,
    #[serde(rename = "physics_relax")]
    PhysicsRelax,
    #[serde(rename = "graph_filter_3")]
    GraphFilter3,
}

impl Stage {
    pub const ALL: [Stage; 8] = [
        Stage::Search,
        Stage::EnergyFilter,
        Stage::GraphFilter1,
        Stage::SurrogateTrain,
        Stage::SurrogateRelax,
        Stage::GraphFilter2,
        Stage::PhysicsRelax,
        Stage::GraphFilter3,
    ];

    /// Directory name under `run_dir`, also the serialized name.
    pub fn name(self) -> &'static str {
        match self {
            Stage::Search => "search",
            Stage::EnergyFilter => "energy_filter",
            Stage::GraphFilter1 => "graph_filter_1",
            Stage::SurrogateTrain => "surrogate_train",
            Stage::SurrogateRelax => "surrogate_relax",
            Stage::GraphFilter2 => "graph_filter_2",
            Stage::PhysicsRelax => "physics_relax",
            Stage::GraphFilter3 => "graph_filter_3",
        }
    }

    /// Parallel stages persist one partition per instance index.
    pub fn is_parallel(self) -> bool {
        matches!(self, Stage::Search | Stage::SurrogateTrain | Stage::PhysicsRelax)
    }

    /// Whether the output lives in the shared model artifact rather than in
    /// the stoichiometry's run directory.
    pub fn is_cross_stoichiometry(self) -> bool {
        self == Stage::SurrogateTrain
    }

    /// Next state; `None` is `Done`.
    pub fn successor(self) -> Option<Stage> {
        let pos = Stage::ALL.iter().position(|&s| s == self)?;
        Stage::ALL.get(pos + 1).copied()
    }

    /// Stage whose persisted population this one consumes.
    pub fn input(self) -> Option<Stage> {
        match self {
            Stage::Search => None,
            Stage::EnergyFilter => Some(Stage::Search),
            Stage::GraphFilter1 => Some(Stage::EnergyFilter),
            Stage::SurrogateTrain => Some(Stage::GraphFilter1),
            Stage::SurrogateRelax => Some(Stage::GraphFilter1),
            Stage::GraphFilter2 => Some(Stage::SurrogateRelax),
            Stage::PhysicsRelax => Some(Stage::GraphFilter2),
            Stage::GraphFilter3 => Some(Stage::PhysicsRelax),
        }
    }

    /// Evaluator tag carried by records this stage produces, for hand-off stages.
    pub fn evaluation_method(self) -> Option<EvaluationMethod> {
        match self {
            Stage::Search => Some(EvaluationMethod::GlobalSearch),
            Stage::SurrogateRelax => Some(EvaluationMethod::Surrogate),
            Stage::PhysicsRelax => Some(EvaluationMethod::Physics),
            _ => None,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
