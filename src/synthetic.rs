//! Synthetic Sérsic model cubes and Gaussian PSFs, for exercising the
//! pipeline without survey data.

use crate::model_store::ModelStore;
use crate::DreError;
use itertools::iproduct;
use ndarray::{Array2, Array6};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SyntheticGrid {
    /// Image side in pixels.
    pub size: usize,
    pub ax_ratio: Vec<f32>,
    /// Position angles in degrees.
    pub angle: Vec<f32>,
    /// log10 of the effective radius in pixels.
    pub log_r: Vec<f32>,
    /// One Sérsic index per galaxy type.
    pub sersic_n: Vec<f32>,
}

impl Default for SyntheticGrid {
    fn default() -> Self {
        Self {
            size: 32,
            ax_ratio: vec![0.2, 0.4, 0.6, 0.8, 1.0],
            angle: (0..6).map(|i| i as f32 * 30.0).collect(),
            log_r: vec![0.2, 0.4, 0.6, 0.8, 1.0],
            sersic_n: vec![1.0, 4.0],
        }
    }
}

// Capaccioli's approximation, good to ~1e-3 for 0.5 < n < 10.
fn sersic_b(n: f32) -> f32 {
    2.0 * n - 1.0 / 3.0
}

/// Unit-sum Sérsic profile centred on the image.
pub fn sersic_image(size: usize, n: f32, log_r: f32, ax_ratio: f32, angle_deg: f32) -> Array2<f32> {
    let centre = (size as f32 - 1.0) / 2.0;
    let r_e = 10f32.powf(log_r);
    let b = sersic_b(n);
    let (sin, cos) = angle_deg.to_radians().sin_cos();
    let q = ax_ratio.max(1e-3);

    let mut image = Array2::from_shape_fn((size, size), |(i, j)| {
        let (dx, dy) = (j as f32 - centre, i as f32 - centre);
        let major = dx * cos + dy * sin;
        let minor = -dx * sin + dy * cos;
        let r = (major * major + (minor / q).powi(2)).sqrt();
        (-b * ((r / r_e).powf(1.0 / n) - 1.0)).exp()
    });
    let total = image.sum();
    if total > 0.0 {
        image /= total;
    }
    image
}

pub fn gaussian_psf(size: usize, sigma: f32) -> Array2<f32> {
    let centre = (size as f32 - 1.0) / 2.0;
    let mut psf = Array2::from_shape_fn((size, size), |(i, j)| {
        let r2 = (i as f32 - centre).powi(2) + (j as f32 - centre).powi(2);
        (-r2 / (2.0 * sigma * sigma)).exp()
    });
    let total = psf.sum();
    psf /= total;
    psf
}

impl SyntheticGrid {
    pub fn shape(&self) -> [usize; 6] {
        [
            self.ax_ratio.len(),
            self.angle.len(),
            self.log_r.len(),
            self.sersic_n.len(),
            self.size,
            self.size,
        ]
    }

    pub fn build(&self) -> Result<ModelStore, DreError> {
        if self.size == 0 {
            return Err(DreError::Config("synthetic image size must be positive".to_string()));
        }
        let shape = self.shape();
        let mut data = Vec::with_capacity(shape.iter().product());
        for (&q, &theta, &lr, &n) in iproduct!(&self.ax_ratio, &self.angle, &self.log_r, &self.sersic_n) {
            data.extend(sersic_image(self.size, n, lr, q, theta).iter().copied());
        }
        let models = Array6::from_shape_vec(shape, data)?;
        ModelStore::new(
            models.into_dyn(),
            self.ax_ratio.clone(),
            self.angle.clone(),
            self.log_r.clone(),
        )
    }
}
