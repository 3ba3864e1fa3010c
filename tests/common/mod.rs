#![allow(dead_code)]

use dre::config::CUTS_SUFFIX;
use dre::cutout::{Cutout, ObjectId, write_cutouts};
use dre::model_store::{GridIndex, ModelStore, SharedModels};
use dre::psf::{PsfConvolver, write_psf};
use dre::synthetic::{SyntheticGrid, gaussian_psf};
use dre::{CancellationToken, EngineConfig, RunPaths};
use ndarray::Array2;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

pub const SIZE: usize = 16;

/// `[E, T, R, A, y, x] = [2, 3, 3, 5, 16, 16]`
pub fn scenario_models() -> ModelStore {
    SyntheticGrid {
        size: SIZE,
        ax_ratio: vec![0.4, 0.7],
        angle: vec![0.0, 60.0, 120.0],
        log_r: vec![0.2, 0.45, 0.7],
        sersic_n: vec![0.5, 1.0, 2.0, 3.0, 4.0],
    }
    .build()
    .unwrap()
}

pub fn psf() -> Array2<f32> {
    gaussian_psf(5, 1.0)
}

pub fn config(base: &Path, n_proc: usize) -> EngineConfig {
    EngineConfig {
        n_proc,
        queue_capacity: 8,
        poll_timeout_ms: 50,
        save_mosaics: false,
        paths: RunPaths::under(base),
    }
}

pub fn convolved(models: &ModelStore) -> SharedModels {
    PsfConvolver::new(2)
        .convolve_with(models, psf().view(), &CancellationToken::new())
        .unwrap()
}

/// A cutout that matches the convolved model at `idx` exactly, up to flux.
pub fn matching_cutout(convolved: &ModelStore, idx: GridIndex) -> Cutout {
    Cutout::new(
        convolved.image(idx).mapv(|v| v * 250.0),
        Array2::from_elem((SIZE, SIZE), true),
        Array2::from_elem((SIZE, SIZE), 0.5),
    )
    .unwrap()
}

/// A cutout whose mask leaves no pixel to fit.
pub fn unfittable_cutout() -> Cutout {
    Cutout::new(
        Array2::ones((SIZE, SIZE)),
        Array2::from_elem((SIZE, SIZE), false),
        Array2::ones((SIZE, SIZE)),
    )
    .unwrap()
}

pub fn grid_index(n: usize) -> GridIndex {
    GridIndex { e: n % 2, t: n % 3, r: (n / 2) % 3, a: n % 5 }
}

/// Writes `<name>_cuts.bin`, and the PSF when asked. Returns the input path.
pub fn write_tile(
    paths: &RunPaths,
    name: &str,
    cutouts: &[(ObjectId, Cutout)],
    with_psf: bool,
) -> PathBuf {
    fs::create_dir_all(&paths.input_dir).unwrap();
    fs::create_dir_all(&paths.psf_dir).unwrap();
    let input = paths.input_dir.join(format!("{}{}", name, CUTS_SUFFIX));
    write_cutouts(&input, cutouts.iter().map(|(id, c)| (id, c))).unwrap();
    if with_psf {
        write_psf(&paths.job_paths(&input).psf, &psf()).unwrap();
    }
    input
}

/// `n` fittable cutouts with ids `01_0001..`, each matching a different model.
pub fn fittable(convolved: &ModelStore, n: usize) -> Vec<(ObjectId, Cutout)> {
    (1..=n)
        .map(|i| (ObjectId::new(1, i as i64), matching_cutout(convolved, grid_index(i))))
        .collect()
}

/// Reads back a mosaic written by `dre::fits::write_fits_image`.
pub fn read_fits_image(path: &Path) -> Array2<f32> {
    const BLOCK: usize = 2880;
    let mut bytes = Vec::new();
    fs::File::open(path).unwrap().read_to_end(&mut bytes).unwrap();

    let (mut nx, mut ny, mut data_start) = (0, 0, 0);
    for (i, card) in bytes.chunks(80).enumerate() {
        let text = String::from_utf8_lossy(card).into_owned();
        let value = || text[10..30].trim().parse::<usize>().unwrap();
        match text[..8].trim() {
            "NAXIS1" => nx = value(),
            "NAXIS2" => ny = value(),
            "END" => {
                data_start = ((i * 80) / BLOCK + 1) * BLOCK;
                break;
            }
            _ => {}
        }
    }
    let data = bytes[data_start..data_start + nx * ny * 4]
        .chunks_exact(4)
        .map(|c| f32::from_be_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    Array2::from_shape_vec((ny, nx), data).unwrap()
}
