use std::fs;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::core::domain::{Partition, Population};
use crate::core::error::{PipelineError, Result};
use crate::pipeline::stage::Stage;

/// Writes `value` as JSON through a temporary file and an atomic rename, so
/// a reader never sees a partially written artifact.
pub fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| PipelineError::io(parent, e))?;
    }
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| PipelineError::config(format!("invalid output path {}", path.display())))?;
    let tmp = path.with_file_name(format!(".{}.tmp", file_name));

    let bytes = serde_json::to_vec_pretty(value).map_err(|e| PipelineError::Serialization {
        path: path.to_path_buf(),
        source: e,
    })?;
    fs::write(&tmp, bytes).map_err(|e| PipelineError::io(&tmp, e))?;
    fs::rename(&tmp, path).map_err(|e| PipelineError::io(path, e))
}

pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let bytes = fs::read(path).map_err(|e| PipelineError::io(path, e))?;
    serde_json::from_slice(&bytes).map_err(|e| PipelineError::Serialization {
        path: path.to_path_buf(),
        source: e,
    })
}

/// Where one stoichiometry run keeps its stage outputs.
#[derive(Debug, Clone)]
pub struct RunLayout {
    run_dir: PathBuf,
}

impl RunLayout {
    pub fn new(run_dir: impl Into<PathBuf>) -> Self {
        Self { run_dir: run_dir.into() }
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    pub fn stage_dir(&self, stage: Stage) -> PathBuf {
        self.run_dir.join(stage.name())
    }

    pub fn population_path(&self, stage: Stage) -> PathBuf {
        self.stage_dir(stage).join("population.json")
    }

    pub fn partition_path(&self, stage: Stage, index: usize) -> PathBuf {
        self.stage_dir(stage).join(format!("part_{:03}.json", index))
    }

    pub fn summary_path(&self) -> PathBuf {
        self.run_dir.join("final_structures.csv")
    }

    pub fn has_population(&self, stage: Stage) -> bool {
        self.population_path(stage).is_file()
    }

    pub fn write_population(&self, population: &Population) -> Result<PathBuf> {
        let path = self.population_path(population.stage);
        write_json(&path, population)?;
        Ok(path)
    }

    /// Loads the output of `stage`; a missing file is a configuration error
    /// naming the stage that has to run first.
    pub fn read_population(&self, stage: Stage) -> Result<Population> {
        let path = self.population_path(stage);
        if !path.is_file() {
            return Err(PipelineError::config(format!(
                "{} not found; stage '{}' has not completed",
                path.display(),
                stage
            )));
        }
        let population: Population = read_json(&path)?;
        if population.stage != stage {
            return Err(PipelineError::config(format!(
                "{} holds stage '{}', expected '{}'",
                path.display(),
                population.stage,
                stage
            )));
        }
        Ok(population)
    }

    pub fn write_partition(&self, partition: &Partition) -> Result<PathBuf> {
        let path = self.partition_path(partition.stage, partition.index);
        write_json(&path, partition)?;
        Ok(path)
    }

    /// Indices of the partition files present for `stage`.
    pub fn partition_indices(&self, stage: Stage) -> Result<Vec<usize>> {
        let dir = self.stage_dir(stage);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(PipelineError::io(&dir, e)),
        };

        let mut indices = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| PipelineError::io(&dir, e))?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(idx) = name
                .strip_prefix("part_")
                .and_then(|s| s.strip_suffix(".json"))
                .and_then(|s| s.parse::<usize>().ok())
            {
                indices.push(idx);
            }
        }
        indices.sort_unstable();
        Ok(indices)
    }

    pub fn read_partitions(&self, stage: Stage) -> Result<Vec<Partition>> {
        self.partition_indices(stage)?
            .into_iter()
            .map(|i| read_json(&self.partition_path(stage, i)))
            .collect()
    }
}
