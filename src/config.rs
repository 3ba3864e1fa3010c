use crate::DreError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CUTS_SUFFIX: &str = "_cuts.bin";
pub const SCORES_SUFFIX: &str = "_chi.bin";
pub const SUMMARY_SUFFIX: &str = "_dre.json";
pub const PSF_EXTENSION: &str = "psf";

/// Directory layout of a run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RunPaths {
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,
    pub psf_dir: PathBuf,
    pub summary_dir: PathBuf,
    pub mosaics_dir: PathBuf,
}

impl Default for RunPaths {
    fn default() -> Self {
        Self {
            input_dir: PathBuf::from("Cuts"),
            output_dir: PathBuf::from("Chi"),
            psf_dir: PathBuf::from("PSF"),
            summary_dir: PathBuf::from("Summary"),
            mosaics_dir: PathBuf::from("Mosaics"),
        }
    }
}

impl RunPaths {
    /// Everything under one base directory, for tests and scratch runs.
    pub fn under(base: &Path) -> Self {
        let d = Self::default();
        Self {
            input_dir: base.join(d.input_dir),
            output_dir: base.join(d.output_dir),
            psf_dir: base.join(d.psf_dir),
            summary_dir: base.join(d.summary_dir),
            mosaics_dir: base.join(d.mosaics_dir),
        }
    }

    pub fn job_paths(&self, input_file: &Path) -> JobPaths {
        let name = tile_name(input_file);
        JobPaths {
            output: self.output_dir.join(format!("{}{}", name, SCORES_SUFFIX)),
            psf: self.psf_dir.join(format!("{}.{}", name, PSF_EXTENSION)),
            summary: self.summary_dir.join(format!("{}{}", name, SUMMARY_SUFFIX)),
            mosaics: self.mosaics_dir.join(&name),
            input: input_file.to_path_buf(),
            name,
        }
    }
}

/// Resolved file locations for one input tile.
#[derive(Debug, Clone, PartialEq)]
pub struct JobPaths {
    pub name: String,
    pub input: PathBuf,
    pub output: PathBuf,
    pub psf: PathBuf,
    pub summary: PathBuf,
    pub mosaics: PathBuf,
}

impl JobPaths {
    pub fn mosaic_file(&self, object_id: &str) -> PathBuf {
        self.mosaics
            .join(format!("{}_{}_mosaic.fits", self.name, object_id))
    }
}

/// `tileA_cuts.bin` -> `tileA`; other names lose only their extension.
pub fn tile_name(input_file: &Path) -> String {
    let file_name = input_file
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    if let Some(stripped) = file_name.strip_suffix(CUTS_SUFFIX) {
        return stripped.to_string();
    }
    input_file
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or(file_name)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Worker threads, also the size of the convolution pool.
    pub n_proc: usize,
    /// In-flight cutouts allowed in the input queue.
    pub queue_capacity: usize,
    pub poll_timeout_ms: u64,
    pub save_mosaics: bool,
    pub paths: RunPaths,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            n_proc: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            queue_capacity: 100,
            poll_timeout_ms: 1000,
            save_mosaics: false,
            paths: RunPaths::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_file(path: &Path) -> Result<Self, DreError> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), DreError> {
        if self.n_proc == 0 {
            return Err(DreError::Config("n_proc must be at least 1".to_string()));
        }
        if self.queue_capacity == 0 {
            return Err(DreError::Config("queue_capacity must be at least 1".to_string()));
        }
        if self.poll_timeout_ms == 0 {
            return Err(DreError::Config("poll_timeout_ms must be positive".to_string()));
        }
        Ok(())
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn log_summary(&self) {
        tracing::info!("===== ENGINE CONFIGURATION =====");
        tracing::info!("Workers: {}", self.n_proc);
        tracing::info!("Input queue capacity: {} cutouts", self.queue_capacity);
        tracing::info!("Poll timeout: {} ms", self.poll_timeout_ms);
        tracing::info!("Save mosaics: {}", self.save_mosaics);
        tracing::info!("Input dir: {}", self.paths.input_dir.display());
        tracing::info!("Output dir: {}", self.paths.output_dir.display());
        tracing::info!("PSF dir: {}", self.paths.psf_dir.display());
        tracing::info!("================================");
    }
}
