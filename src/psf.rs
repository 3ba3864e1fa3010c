use crate::archive::{ArchiveReader, ArchiveWriter};
use crate::array::StoredArray;
use crate::cancel::CancellationToken;
use crate::model_store::{ModelStore, SharedModels};
use crate::DreError;
use ndarray::{Array2, Array6, ArrayView2, Ix2};
use rayon::prelude::*;
use std::path::Path;

pub const PSF_KEY: &str = "psf";

/// Read a PSF kernel, normalised to unit sum.
///
/// A missing file is [`DreError::PsfNotFound`], which callers treat as
/// "skip this tile".
pub fn load_psf(path: &Path) -> Result<Array2<f32>, DreError> {
    if !path.is_file() {
        return Err(DreError::PsfNotFound(path.to_path_buf()));
    }
    let mut reader: ArchiveReader<StoredArray<f32>> = ArchiveReader::open(path)?;
    let stored = match reader.get(PSF_KEY)? {
        Some(s) => s,
        None => reader
            .first()?
            .map(|(_, s)| s)
            .ok_or_else(|| DreError::Archive(format!("{} holds no kernel", path.display())))?,
    };
    let mut kernel = stored.into_array::<Ix2>()?;
    if kernel.is_empty() {
        return Err(DreError::Archive(format!("{} holds an empty kernel", path.display())));
    }
    let total: f32 = kernel.sum();
    if total.is_finite() && total != 0.0 {
        kernel /= total;
    }
    Ok(kernel)
}

pub fn write_psf(path: &Path, kernel: &Array2<f32>) -> Result<(), DreError> {
    let mut writer = ArchiveWriter::create(path)?;
    writer.append(PSF_KEY, &StoredArray::from_array(kernel))?;
    writer.finish()
}

/// 2-D convolution cropped to the input size, centred the way
/// `scipy.signal.convolve(..., mode="same")` centres it.
pub fn convolve_same(image: ArrayView2<'_, f32>, kernel: ArrayView2<'_, f32>) -> Array2<f32> {
    let (ny, nx) = image.dim();
    let (ky, kx) = kernel.dim();
    let (cy, cx) = ((ky - 1) / 2, (kx - 1) / 2);
    let mut out = Array2::<f32>::zeros((ny, nx));
    for ((i, j), o) in out.indexed_iter_mut() {
        let mut acc = 0.0f32;
        for p in 0..ky {
            // source row = i + cy - p
            let Some(si) = (i + cy).checked_sub(p) else { break };
            if si >= ny {
                continue;
            }
            for q in 0..kx {
                let Some(sj) = (j + cx).checked_sub(q) else { break };
                if sj >= nx {
                    continue;
                }
                acc += kernel[[p, q]] * image[[si, sj]];
            }
        }
        *o = acc;
    }
    out
}

/// Convolves a whole model cube with one PSF on a sized thread pool.
pub struct PsfConvolver {
    parallelism: usize,
}

impl PsfConvolver {
    pub fn new(parallelism: usize) -> Self {
        Self { parallelism: parallelism.max(1) }
    }

    /// Returns only once every image has been convolved; the result is the
    /// read-only cube workers fit against.
    pub fn convolve(
        &self,
        models: &ModelStore,
        psf_path: &Path,
        cancel: &CancellationToken,
    ) -> Result<SharedModels, DreError> {
        let psf = load_psf(psf_path)?;
        self.convolve_with(models, psf.view(), cancel)
    }

    pub fn convolve_with(
        &self,
        models: &ModelStore,
        psf: ArrayView2<'_, f32>,
        cancel: &CancellationToken,
    ) -> Result<SharedModels, DreError> {
        let (ny, nx) = models.image_shape();
        // [E, T, R, A, y, x] -> [E*T*R*A, y, x]
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.parallelism)
            .build()
            .map_err(|e| DreError::Other(format!("failed to create thread pool: {e}")))?;

        let slices: Vec<Vec<f32>> = pool.install(|| {
            models
                .as_slice()
                .par_chunks(ny * nx)
                .map(|chunk| {
                    if cancel.is_cancelled() {
                        return Err(DreError::Cancelled);
                    }
                    let image = ArrayView2::from_shape((ny, nx), chunk)?;
                    Ok(convolve_same(image, psf).into_raw_vec_and_offset().0)
                })
                .collect::<Result<Vec<_>, DreError>>()
        })?;

        let cube = Array6::from_shape_vec(models.models().raw_dim(), slices.concat())?;
        Ok(models.with_images(cube)?.shared())
    }
}
