use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use anyhow::{bail, Context, Result};
use log::debug;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::core::config::{CommandSpec, SurfaceSettings};
use crate::core::domain::{Geometry, Structure};
use crate::engine::evaluator::{
    EvaluationResult, Evaluator, SearchCandidate, SearchEngine, SearchRequest, SurrogateBackend, SurrogateModel,
};

// --- Wire Protocol ---

/// One JSON document written to the program's stdin.
#[derive(Debug, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Request<'a> {
    Search {
        stoichiometry: String,
        surface: &'a SurfaceSettings,
        num_iterations: usize,
        index: usize,
        seed: u64,
    },
    Train {
        structures: &'a [Structure],
        species: &'a [String],
        parameters_path: &'a Path,
    },
    Predict {
        parameters_path: &'a Path,
        species: &'a [String],
        geometry: &'a Geometry,
    },
    Relax {
        parameters_path: &'a Path,
        species: &'a [String],
        geometry: &'a Geometry,
    },
    PhysicsRelax {
        geometry: &'a Geometry,
    },
}

/// Reply to every per-structure operation.
#[derive(Debug, Deserialize)]
struct EnergyReply {
    #[serde(default)]
    energy: Option<f64>,
    #[serde(default)]
    geometry: Option<Geometry>,
    /// Set by the program to signal non-convergence or similar.
    #[serde(default)]
    error: Option<String>,
}

impl EnergyReply {
    fn into_result(self) -> Result<EvaluationResult> {
        if let Some(reason) = self.error {
            bail!("{}", reason);
        }
        let energy = self.energy.context("reply carries no energy")?;
        Ok(EvaluationResult {
            energy,
            relaxed: self.geometry,
        })
    }
}

#[derive(Debug, Deserialize)]
struct SearchReply {
    candidates: Vec<SearchCandidateWire>,
}

#[derive(Debug, Deserialize)]
struct SearchCandidateWire {
    geometry: Geometry,
    energy: f64,
}

#[derive(Debug, Deserialize)]
struct AckReply {
    #[serde(default)]
    error: Option<String>,
}

// --- Process Runner ---

/// Spawns an external program per call and streams JSON through its pipes.
#[derive(Debug, Clone)]
pub struct CommandRunner {
    spec: CommandSpec,
    label: String,
}

impl CommandRunner {
    pub fn new(spec: CommandSpec) -> Self {
        let label = format!("{} (command)", spec.program);
        Self { spec, label }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    fn call<R: DeserializeOwned>(&self, request: &Request<'_>) -> Result<R> {
        let payload = serde_json::to_vec(request).context("Failed to encode request")?;

        let mut child = Command::new(&self.spec.program)
            .args(&self.spec.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("Failed to spawn '{}'", self.spec.program))?;

        if let Some(mut stdin) = child.stdin.take() {
            if let Err(e) = stdin.write_all(&payload) {
                // Reap the child before bailing
                let _ = child.kill();
                let _ = child.wait();
                return Err(e).context("Failed to write request to stdin");
            }
        }

        let output = child.wait_with_output().context("Failed to read program output")?;

        if !output.status.success() {
            let err_msg = String::from_utf8_lossy(&output.stderr);
            bail!("'{}' exited with {}: {}", self.spec.program, output.status, err_msg.trim());
        }

        debug!("'{}' replied with {} bytes", self.spec.program, output.stdout.len());
        serde_json::from_slice(&output.stdout).context("Could not parse program reply")
    }
}

// --- Adapters ---

/// Full physics relaxation through an external program.
pub struct CommandEvaluator {
    runner: CommandRunner,
}

impl CommandEvaluator {
    pub fn new(spec: CommandSpec) -> Self {
        Self {
            runner: CommandRunner::new(spec),
        }
    }
}

impl Evaluator for CommandEvaluator {
    fn evaluate(&self, structure: &Structure) -> Result<EvaluationResult> {
        let reply: EnergyReply = self.runner.call(&Request::PhysicsRelax {
            geometry: structure.geometry(),
        })?;
        reply.into_result()
    }

    fn name(&self) -> &str {
        self.runner.label()
    }
}

/// Global search through an external program.
pub struct CommandSearch {
    runner: CommandRunner,
}

impl CommandSearch {
    pub fn new(spec: CommandSpec) -> Self {
        Self {
            runner: CommandRunner::new(spec),
        }
    }
}

impl SearchEngine for CommandSearch {
    fn search(&self, request: &SearchRequest) -> Result<Vec<SearchCandidate>> {
        let reply: SearchReply = self.runner.call(&Request::Search {
            stoichiometry: request.stoichiometry.to_string(),
            surface: &request.surface,
            num_iterations: request.num_iterations,
            index: request.index,
            seed: request.seed,
        })?;
        Ok(reply
            .candidates
            .into_iter()
            .map(|c| SearchCandidate {
                geometry: c.geometry,
                energy: c.energy,
            })
            .collect())
    }

    fn name(&self) -> &str {
        self.runner.label()
    }
}

/// A trained model served by an external program.
pub struct CommandSurrogate {
    runner: CommandRunner,
    parameters_path: PathBuf,
    species: Vec<String>,
}

impl SurrogateModel for CommandSurrogate {
    fn predict(&self, geometry: &Geometry) -> Result<f64> {
        let reply: EnergyReply = self.runner.call(&Request::Predict {
            parameters_path: &self.parameters_path,
            species: &self.species,
            geometry,
        })?;
        Ok(reply.into_result()?.energy)
    }

    fn relax(&self, structure: &Structure) -> Result<EvaluationResult> {
        let reply: EnergyReply = self.runner.call(&Request::Relax {
            parameters_path: &self.parameters_path,
            species: &self.species,
            geometry: structure.geometry(),
        })?;
        reply.into_result()
    }
}

/// Surrogate training and model loading through an external program.
pub struct CommandSurrogateBackend {
    runner: CommandRunner,
}

impl CommandSurrogateBackend {
    pub fn new(spec: CommandSpec) -> Self {
        Self {
            runner: CommandRunner::new(spec),
        }
    }
}

impl SurrogateBackend for CommandSurrogateBackend {
    fn train(&self, training: &[Structure], species: &[String], parameters_path: &Path) -> Result<()> {
        let reply: AckReply = self.runner.call(&Request::Train {
            structures: training,
            species,
            parameters_path,
        })?;
        if let Some(reason) = reply.error {
            bail!("training failed: {}", reason);
        }
        if !parameters_path.exists() {
            bail!("trainer did not write {}", parameters_path.display());
        }
        Ok(())
    }

    fn load(&self, parameters_path: &Path, species: &[String]) -> Result<Box<dyn SurrogateModel>> {
        if !parameters_path.exists() {
            bail!("model parameters {} not found", parameters_path.display());
        }
        Ok(Box::new(CommandSurrogate {
            runner: self.runner.clone(),
            parameters_path: parameters_path.to_path_buf(),
            species: species.to_vec(),
        }))
    }
}
