use clap::{Parser, Subcommand};
use dre::cancel::cancel_on_ctrl_c;
use dre::psf::write_psf;
use dre::synthetic::{SyntheticGrid, gaussian_psf};
use dre::{CancellationToken, DreError, Engine, EngineConfig, FileOutcome, RunPaths};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

#[derive(Parser)]
#[command(name = "dre")]
#[command(about = "Parallel galaxy model fitting against a PSF-convolved model cube", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fit every cutout archive of the input directory
    Fit {
        /// Model cube archive
        #[arg(long)]
        models: PathBuf,
        /// JSON engine configuration
        #[arg(long)]
        config: Option<PathBuf>,
        /// Put Cuts/, Chi/, PSF/, Summary/ and Mosaics/ under this directory
        #[arg(long)]
        base: Option<PathBuf>,
        /// Fit a single cutout archive instead of the whole input directory
        #[arg(long)]
        input: Option<PathBuf>,
        #[arg(long)]
        n_proc: Option<usize>,
        #[arg(long)]
        queue_capacity: Option<usize>,
        /// Write a FITS mosaic per fitted object
        #[arg(long)]
        mosaics: bool,
    },
    /// Write a synthetic Sérsic model cube
    MakeModels {
        output: PathBuf,
        /// JSON grid description; the built-in grid is used when absent
        #[arg(long)]
        grid: Option<PathBuf>,
        #[arg(long)]
        size: Option<usize>,
    },
    /// Write a circular Gaussian PSF
    MakePsf {
        output: PathBuf,
        #[arg(long, default_value_t = 15)]
        size: usize,
        #[arg(long, default_value_t = 2.0)]
        sigma: f32,
    },
}

fn load_config(
    config: Option<PathBuf>,
    base: Option<PathBuf>,
    n_proc: Option<usize>,
    queue_capacity: Option<usize>,
    mosaics: bool,
) -> Result<EngineConfig, DreError> {
    let mut cfg = match config {
        Some(path) => EngineConfig::from_file(&path)?,
        None => EngineConfig::default(),
    };
    if let Some(base) = base {
        cfg.paths = RunPaths::under(&base);
    }
    if let Some(n) = n_proc {
        cfg.n_proc = n;
    }
    if let Some(cap) = queue_capacity {
        cfg.queue_capacity = cap;
    }
    cfg.save_mosaics |= mosaics;
    cfg.validate()?;
    Ok(cfg)
}

fn main() -> Result<(), DreError> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Fit { models, config, base, input, n_proc, queue_capacity, mosaics } => {
            let cfg = load_config(config, base, n_proc, queue_capacity, mosaics)?;
            cfg.log_summary();

            let cancel = CancellationToken::new();
            cancel_on_ctrl_c(cancel.clone())?;
            let engine = Engine::load(cfg, &models)?.with_cancel(cancel);

            match input {
                Some(file) => {
                    std::fs::create_dir_all(&engine.config().paths.output_dir)?;
                    let job = engine.config().paths.job_paths(&file);
                    match engine.fit_file(&job, "(1/1)")? {
                        FileOutcome::Skipped { name, reason } => {
                            tracing::warn!("{} skipped: {}", name, reason);
                        }
                        FileOutcome::Failed { name, reason } => {
                            return Err(DreError::Other(format!("{} failed: {}", name, reason)));
                        }
                        _ => {}
                    }
                }
                None => {
                    let report = engine.fit_dir()?;
                    if report.aborted() {
                        tracing::warn!("Run aborted after {:.1}s", report.elapsed.as_secs_f64());
                    }
                }
            }
        }
        Commands::MakeModels { output, grid, size } => {
            let mut grid = match grid {
                Some(path) => serde_json::from_str(&std::fs::read_to_string(path)?)?,
                None => SyntheticGrid::default(),
            };
            if let Some(size) = size {
                grid.size = size;
            }
            let store = grid.build()?;
            store.save(&output)?;
            tracing::info!("Wrote {} models of shape {:?} to {}", store.n_models(), grid.shape(), output.display());
        }
        Commands::MakePsf { output, size, sigma } => {
            write_psf(&output, &gaussian_psf(size, sigma))?;
            tracing::info!("Wrote {}x{} PSF (sigma {}) to {}", size, size, sigma, output.display());
        }
    }
    Ok(())
}
