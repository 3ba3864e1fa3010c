use crate::DreError;
use crate::archive::{ArchiveReader, ArchiveWriter};
use crate::array::StoredArray;
use bincode::{Decode, Encode};
use ndarray::{Array2, Ix2};
use std::fmt;
use std::path::Path;

/// `"<extension>_<catalog_number>"`, unique within one cutout archive.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(String);

impl ObjectId {
    pub fn new(ext_number: i64, number: i64) -> Self {
        Self(format!("{:02}_{:04}", ext_number, number))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `(EXT_NUMBER, NUMBER)`.
    pub fn numbers(&self) -> Result<(i64, i64), DreError> {
        let bad = || DreError::Other(format!("malformed object id '{}'", self.0));
        let (ext, number) = self.0.split_once('_').ok_or_else(bad)?;
        let ext = ext.parse::<i64>().map_err(|_| bad())?;
        let number = number.parse::<i64>().map_err(|_| bad())?;
        Ok((ext, number))
    }
}

impl From<&str> for ObjectId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ObjectId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Pixel data, segmentation mask and noise map of one object.
#[derive(Debug, Clone, PartialEq)]
pub struct Cutout {
    pub obj: Array2<f32>,
    pub seg: Array2<bool>,
    pub rms: Array2<f32>,
}

impl Cutout {
    pub fn new(obj: Array2<f32>, seg: Array2<bool>, rms: Array2<f32>) -> Result<Self, DreError> {
        if obj.shape() != seg.shape() || obj.shape() != rms.shape() {
            return Err(DreError::Archive(format!(
                "cutout planes differ in shape: obj {:?}, seg {:?}, rms {:?}",
                obj.shape(),
                seg.shape(),
                rms.shape()
            )));
        }
        Ok(Self { obj, seg, rms })
    }

    pub fn shape(&self) -> (usize, usize) {
        self.obj.dim()
    }

    pub fn to_record(&self) -> CutoutRecord {
        CutoutRecord {
            obj: StoredArray::from_array(&self.obj),
            seg: StoredArray::from_array(&self.seg),
            rms: StoredArray::from_array(&self.rms),
        }
    }
}

/// On-disk form of a [`Cutout`].
#[derive(Encode, Decode, Debug, Clone, PartialEq)]
pub struct CutoutRecord {
    pub obj: StoredArray<f32>,
    pub seg: StoredArray<bool>,
    pub rms: StoredArray<f32>,
}

impl TryFrom<CutoutRecord> for Cutout {
    type Error = DreError;

    fn try_from(record: CutoutRecord) -> Result<Self, DreError> {
        Cutout::new(
            record.obj.into_array::<Ix2>()?,
            record.seg.into_array::<Ix2>()?,
            record.rms.into_array::<Ix2>()?,
        )
    }
}

/// One unit of work on the input queue.
#[derive(Debug, Clone)]
pub struct WorkItem {
    pub object_id: ObjectId,
    pub cutout: Cutout,
}

pub struct CutoutArchive {
    reader: ArchiveReader<CutoutRecord>,
}

impl CutoutArchive {
    pub fn open(path: &Path) -> Result<Self, DreError> {
        Ok(Self { reader: ArchiveReader::open(path)? })
    }

    pub fn object_ids(&self) -> Vec<ObjectId> {
        self.reader.keys().iter().map(|k| ObjectId::from(k.as_str())).collect()
    }

    pub fn len(&self) -> usize {
        self.reader.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reader.is_empty()
    }

    pub fn load(&mut self, object_id: &ObjectId) -> Result<WorkItem, DreError> {
        let record = self.reader.get(object_id.as_str())?.ok_or_else(|| {
            DreError::Archive(format!(
                "{} has no cutout {}",
                self.reader.path().display(),
                object_id
            ))
        })?;
        Ok(WorkItem {
            object_id: object_id.clone(),
            cutout: Cutout::try_from(record)?,
        })
    }
}

/// Write a cutout archive in one go. The cutout stage normally produces
/// these; the engine only needs this for tooling and tests.
pub fn write_cutouts<'a>(
    path: &Path,
    cutouts: impl IntoIterator<Item = (&'a ObjectId, &'a Cutout)>,
) -> Result<usize, DreError> {
    let mut writer = ArchiveWriter::create(path)?;
    for (id, cutout) in cutouts {
        writer.append(id.as_str(), &cutout.to_record())?;
    }
    let n = writer.len();
    writer.finish()?;
    Ok(n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_object_id_format_and_parse() {
        let id = ObjectId::new(1, 42);
        assert_eq!(id.as_str(), "01_0042");
        assert_eq!(id.numbers().unwrap(), (1, 42));
        assert_eq!(ObjectId::from("12_123456").numbers().unwrap(), (12, 123456));
    }

    #[test]
    fn test_malformed_object_ids() {
        for bad in ["0042", "a_1", "1_b", "1_2_3", ""] {
            assert!(ObjectId::from(bad).numbers().is_err(), "{bad}");
        }
    }

    #[test]
    fn test_cutout_shape_mismatch() {
        let err = Cutout::new(
            Array2::zeros((4, 4)),
            Array2::from_elem((4, 3), true),
            Array2::ones((4, 4)),
        );
        assert!(err.is_err());
    }

    #[test]
    fn test_archive_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t_cuts.bin");
        let cutout = Cutout::new(
            Array2::from_shape_fn((3, 3), |(i, j)| (i * 3 + j) as f32),
            Array2::from_shape_fn((3, 3), |(i, j)| i == j),
            Array2::ones((3, 3)),
        )
        .unwrap();
        let ids = [ObjectId::new(0, 2), ObjectId::new(0, 1)];
        write_cutouts(&path, ids.iter().map(|id| (id, &cutout))).unwrap();

        let mut archive = CutoutArchive::open(&path).unwrap();
        assert_eq!(archive.object_ids(), vec![ObjectId::new(0, 1), ObjectId::new(0, 2)]);
        let item = archive.load(&ObjectId::new(0, 2)).unwrap();
        assert_eq!(item.cutout, cutout);
        assert!(archive.load(&ObjectId::new(9, 9)).is_err());
    }
}
