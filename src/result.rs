use crate::DreError;
use crate::cutout::ObjectId;
use crate::model_store::{GridIndex, ModelStore};
use ndarray::{Array2, Array4};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

/// Best-fit parameters of one object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct FitParameters {
    pub ext_number: i64,
    pub number: i64,
    pub e_idx: usize,
    pub t_idx: usize,
    pub r_idx: usize,
    pub a_idx: usize,
    pub ax_ratio: f32,
    pub angle: f32,
    pub log_r: f32,
    pub chi: f32,
}

impl FitParameters {
    /// Map a grid index through the model axes.
    pub fn new(
        object_id: &ObjectId,
        idx: GridIndex,
        chi: f32,
        models: &ModelStore,
    ) -> Result<Self, DreError> {
        let (ext_number, number) = object_id.numbers()?;
        let coordinate = |axis: &[f32], i: usize, name: &str| {
            axis.get(i).copied().ok_or_else(|| {
                DreError::Other(format!("{} index {} outside the model grid", name, i))
            })
        };
        Ok(Self {
            ext_number,
            number,
            e_idx: idx.e,
            t_idx: idx.t,
            r_idx: idx.r,
            a_idx: idx.a,
            ax_ratio: coordinate(models.ax_ratio(), idx.e, "E")?,
            angle: coordinate(models.angle(), idx.t, "T")?,
            log_r: coordinate(models.log_r(), idx.r, "R")?,
            chi,
        })
    }

    pub fn grid_index(&self) -> GridIndex {
        GridIndex { e: self.e_idx, t: self.t_idx, r: self.r_idx, a: self.a_idx }
    }

    pub fn key(&self) -> (i64, i64) {
        (self.ext_number, self.number)
    }
}

/// Outcome of fitting one work item. Exactly one per consumed item.
#[derive(Debug, Clone)]
pub enum FitResult {
    Success {
        object_id: ObjectId,
        parameters: FitParameters,
        score_cube: Array4<f32>,
        mosaic: Option<Array2<f32>>,
    },
    /// The score cube was entirely NaN.
    Failure {
        object_id: ObjectId,
        score_cube: Array4<f32>,
    },
}

impl FitResult {
    pub fn object_id(&self) -> &ObjectId {
        match self {
            FitResult::Success { object_id, .. } | FitResult::Failure { object_id, .. } => {
                object_id
            }
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, FitResult::Success { .. })
    }

    pub fn score_cube(&self) -> &Array4<f32> {
        match self {
            FitResult::Success { score_cube, .. } | FitResult::Failure { score_cube, .. } => {
                score_cube
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryRow {
    #[serde(rename = "ROW")]
    pub row: usize,
    #[serde(flatten)]
    pub parameters: FitParameters,
}

/// Append-only table with one row per successfully fitted object.
#[derive(Debug, Clone, Default)]
pub struct Summary {
    name: String,
    rows: Vec<SummaryRow>,
}

impl Summary {
    pub fn new(name: &str) -> Self {
        Self { name: name.to_string(), rows: Vec::new() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn append(&mut self, parameters: FitParameters) {
        let row = self.rows.len();
        self.rows.push(SummaryRow { row, parameters });
    }

    pub fn rows(&self) -> &[SummaryRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn save(&self, path: &Path) -> Result<(), DreError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(&mut writer, &self.rows)?;
        writer.flush()?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Vec<SummaryRow>, DreError> {
        let reader = BufReader::new(File::open(path)?);
        Ok(serde_json::from_reader(reader)?)
    }
}
