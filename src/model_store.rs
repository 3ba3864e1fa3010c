//! Model cube `models[E, T, R, A, y, x]` and its coordinate axes.
//!
//! E indexes `ax_ratio`, T indexes `angle`, R indexes `log_r`; A is the
//! galaxy type/profile axis and has no physical coordinate. The store is
//! built once and handed out as an `Arc`, so every worker reads the same
//! buffer and nobody can write to it.

use crate::DreError;
use crate::archive::{ArchiveReader, ArchiveWriter};
use crate::array::StoredArray;
use ndarray::{Array6, ArrayD, ArrayView2, Ix1, Ix5, Ix6, Axis};
use std::path::Path;
use std::sync::Arc;

pub const MODELS_KEY: &str = "models";
pub const LOG_R_KEY: &str = "log_r";
pub const AX_RATIO_KEY: &str = "ax_ratio";
pub const ANGLE_KEY: &str = "angle";

pub type SharedModels = Arc<ModelStore>;

/// Index of one model in the `[E, T, R, A]` grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GridIndex {
    pub e: usize,
    pub t: usize,
    pub r: usize,
    pub a: usize,
}

impl GridIndex {
    pub fn as_array(&self) -> [usize; 4] {
        [self.e, self.t, self.r, self.a]
    }
}

impl From<[usize; 4]> for GridIndex {
    fn from(i: [usize; 4]) -> Self {
        Self { e: i[0], t: i[1], r: i[2], a: i[3] }
    }
}

#[derive(Debug, Clone)]
pub struct ModelStore {
    models: Array6<f32>,
    ax_ratio: Vec<f32>,
    angle: Vec<f32>,
    log_r: Vec<f32>,
}

impl ModelStore {
    /// Accepts a 6-D `[E, T, R, A, y, x]` cube, or a 5-D `[E, T, R, y, x]`
    /// cube which gets a unit type axis.
    pub fn new(
        models: ArrayD<f32>,
        ax_ratio: Vec<f32>,
        angle: Vec<f32>,
        log_r: Vec<f32>,
    ) -> Result<Self, DreError> {
        let models = match models.ndim() {
            6 => models.into_dimensionality::<Ix6>(),
            5 => models
                .into_dimensionality::<Ix5>()
                .map(|m| m.insert_axis(Axis(3))),
            n => {
                return Err(DreError::ModelLoad(format!(
                    "model cube must have 5 or 6 dimensions, found {}",
                    n
                )));
            }
        }
        .map_err(|e| DreError::ModelLoad(e.to_string()))?;

        let shape = models.shape();
        for (name, axis, len) in [
            (AX_RATIO_KEY, 0, ax_ratio.len()),
            (ANGLE_KEY, 1, angle.len()),
            (LOG_R_KEY, 2, log_r.len()),
        ] {
            if shape[axis] != len {
                return Err(DreError::ModelLoad(format!(
                    "axis {} has length {} but the cube has {} entries along dimension {}",
                    name, len, shape[axis], axis
                )));
            }
        }
        if shape.iter().any(|&d| d == 0) {
            return Err(DreError::ModelLoad(format!("empty model cube {:?}", shape)));
        }

        Ok(Self {
            models: models.as_standard_layout().into_owned(),
            ax_ratio,
            angle,
            log_r,
        })
    }

    pub fn load(path: &Path) -> Result<Self, DreError> {
        if !path.is_file() {
            return Err(DreError::ModelLoad(format!(
                "models file {} not found",
                path.display()
            )));
        }
        let mut reader: ArchiveReader<StoredArray<f32>> =
            ArchiveReader::open(path).map_err(|e| DreError::ModelLoad(e.to_string()))?;

        let mut take = |key: &str| -> Result<StoredArray<f32>, DreError> {
            reader
                .get(key)
                .map_err(|e| DreError::ModelLoad(e.to_string()))?
                .ok_or_else(|| {
                    DreError::ModelLoad(format!("{} has no '{}' entry", path.display(), key))
                })
        };
        let models = take(MODELS_KEY)?;
        let axis = |stored: StoredArray<f32>, key: &str| -> Result<Vec<f32>, DreError> {
            stored
                .into_array::<Ix1>()
                .map(|a| a.to_vec())
                .map_err(|_| DreError::ModelLoad(format!("'{}' must be 1-D", key)))
        };
        let ax_ratio = axis(take(AX_RATIO_KEY)?, AX_RATIO_KEY)?;
        let angle = axis(take(ANGLE_KEY)?, ANGLE_KEY)?;
        let log_r = axis(take(LOG_R_KEY)?, LOG_R_KEY)?;
        let models = models
            .into_dyn()
            .map_err(|e| DreError::ModelLoad(e.to_string()))?;

        let store = Self::new(models, ax_ratio, angle, log_r)?;
        tracing::info!(
            "Loaded models {:?} from {}",
            store.models.shape(),
            path.display()
        );
        Ok(store)
    }

    pub fn save(&self, path: &Path) -> Result<(), DreError> {
        let mut writer = ArchiveWriter::create(path)?;
        writer.append(MODELS_KEY, &StoredArray::from_array(&self.models))?;
        for (key, values) in [
            (AX_RATIO_KEY, &self.ax_ratio),
            (ANGLE_KEY, &self.angle),
            (LOG_R_KEY, &self.log_r),
        ] {
            writer.append(key, &StoredArray { shape: vec![values.len()], data: values.clone() })?;
        }
        writer.finish()
    }

    /// Same axes, different images. Used to publish the convolved cube.
    pub fn with_images(&self, images: Array6<f32>) -> Result<Self, DreError> {
        if images.shape() != self.models.shape() {
            return Err(DreError::Other(format!(
                "image cube {:?} does not match model cube {:?}",
                images.shape(),
                self.models.shape()
            )));
        }
        Ok(Self {
            models: images.as_standard_layout().into_owned(),
            ax_ratio: self.ax_ratio.clone(),
            angle: self.angle.clone(),
            log_r: self.log_r.clone(),
        })
    }

    pub fn shared(self) -> SharedModels {
        Arc::new(self)
    }

    pub fn models(&self) -> &Array6<f32> {
        &self.models
    }

    /// Contiguous row-major view of every image.
    pub fn as_slice(&self) -> &[f32] {
        // Construction always stores standard layout.
        self.models.as_slice().unwrap_or(&[])
    }

    pub fn grid_shape(&self) -> [usize; 4] {
        let s = self.models.shape();
        [s[0], s[1], s[2], s[3]]
    }

    pub fn image_shape(&self) -> (usize, usize) {
        let s = self.models.shape();
        (s[4], s[5])
    }

    pub fn n_models(&self) -> usize {
        self.grid_shape().iter().product()
    }

    pub fn image(&self, idx: GridIndex) -> ArrayView2<'_, f32> {
        self.models
            .index_axis(Axis(0), idx.e)
            .index_axis_move(Axis(0), idx.t)
            .index_axis_move(Axis(0), idx.r)
            .index_axis_move(Axis(0), idx.a)
    }

    pub fn ax_ratio(&self) -> &[f32] {
        &self.ax_ratio
    }

    pub fn angle(&self) -> &[f32] {
        &self.angle
    }

    pub fn log_r(&self) -> &[f32] {
        &self.log_r
    }
}
