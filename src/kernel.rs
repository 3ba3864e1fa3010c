//! Fitting kernel: cutout in, score cube over the `[E, T, R, A]` grid out.

use crate::cutout::Cutout;
use crate::model_store::{GridIndex, ModelStore};
use ndarray::{Array2, Array4, ArrayView2, Zip, s};

pub trait FitKernel: Send + Sync {
    /// Score every model against `cutout`; lower is better. Cells that cannot
    /// be scored are NaN, and an all-NaN cube marks the object as failed.
    fn fit(&self, cutout: &Cutout, models: &ModelStore) -> Array4<f32>;

    /// `[observation | scaled model | residual]` for the model at `idx`.
    fn render_mosaic(&self, cutout: &Cutout, models: &ModelStore, idx: GridIndex) -> Array2<f32> {
        let model = models.image(idx);
        let scale = flux_scale(cutout, model).unwrap_or(0.0);
        mosaic(cutout.obj.view(), model, scale)
    }
}

/// Weighted least-squares: for each model the flux scale that best matches
/// the masked pixels, scored by reduced chi-square with `1/rms²` weights.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChiSquareKernel;

impl FitKernel for ChiSquareKernel {
    fn fit(&self, cutout: &Cutout, models: &ModelStore) -> Array4<f32> {
        let grid = models.grid_shape();
        let nan_cube = || Array4::from_elem(grid, f32::NAN);
        if cutout.shape() != models.image_shape() {
            return nan_cube();
        }
        let Some(weights) = Weights::new(cutout) else {
            return nan_cube();
        };
        let obj = cutout.obj.as_standard_layout();
        let data = obj.as_slice().unwrap_or(&[]);
        let (ny, nx) = models.image_shape();

        let scores: Vec<f32> = models
            .as_slice()
            .chunks(ny * nx)
            .map(|model| weights.reduced_chi2(data, model))
            .collect();
        Array4::from_shape_vec(grid, scores).unwrap_or_else(|_| nan_cube())
    }
}

struct Weights {
    w: Vec<f32>,
    n_valid: usize,
}

impl Weights {
    /// `None` when fewer than two pixels are usable.
    fn new(cutout: &Cutout) -> Option<Self> {
        let mut w = Vec::with_capacity(cutout.obj.len());
        let mut n_valid = 0;
        Zip::from(&cutout.obj)
            .and(&cutout.seg)
            .and(&cutout.rms)
            .for_each(|&d, &m, &sigma| {
                if m && d.is_finite() && sigma.is_finite() && sigma > 0.0 {
                    w.push(1.0 / (sigma * sigma));
                    n_valid += 1;
                } else {
                    w.push(0.0);
                }
            });
        (n_valid >= 2).then_some(Self { w, n_valid })
    }

    fn scale(&self, data: &[f32], model: &[f32]) -> Option<f32> {
        let (mut dm, mut mm) = (0.0f64, 0.0f64);
        for ((&w, &d), &m) in self.w.iter().zip(data).zip(model) {
            dm += (w * d * m) as f64;
            mm += (w * m * m) as f64;
        }
        let scale = (dm / mm) as f32;
        (mm > 0.0 && scale.is_finite()).then_some(scale)
    }

    fn reduced_chi2(&self, data: &[f32], model: &[f32]) -> f32 {
        let Some(scale) = self.scale(data, model) else {
            return f32::NAN;
        };
        let chi2: f64 = self
            .w
            .iter()
            .zip(data)
            .zip(model)
            .map(|((&w, &d), &m)| {
                let r = d - scale * m;
                (w * r * r) as f64
            })
            .sum();
        (chi2 / (self.n_valid - 1) as f64) as f32
    }
}

pub fn flux_scale(cutout: &Cutout, model: ArrayView2<'_, f32>) -> Option<f32> {
    let weights = Weights::new(cutout)?;
    let obj = cutout.obj.as_standard_layout();
    let model = model.as_standard_layout();
    weights.scale(obj.as_slice()?, model.as_slice()?)
}

pub fn mosaic(obj: ArrayView2<'_, f32>, model: ArrayView2<'_, f32>, scale: f32) -> Array2<f32> {
    let (ny, nx) = obj.dim();
    let scaled = model.mapv(|m| m * scale);
    let mut out = Array2::<f32>::zeros((ny, 3 * nx));
    out.slice_mut(s![.., 0..nx]).assign(&obj);
    out.slice_mut(s![.., nx..2 * nx]).assign(&scaled);
    out.slice_mut(s![.., 2 * nx..]).assign(&(&obj - &scaled));
    out
}

pub fn all_nan(scores: &Array4<f32>) -> bool {
    scores.iter().all(|v| v.is_nan())
}

/// Position and value of the smallest non-NaN score.
pub fn best_fit(scores: &Array4<f32>) -> Option<(GridIndex, f32)> {
    scores
        .indexed_iter()
        .filter(|(_, v)| !v.is_nan())
        .min_by(|(_, a), (_, b)| a.total_cmp(b))
        .map(|((e, t, r, a), &v)| (GridIndex { e, t, r, a }, v))
}
