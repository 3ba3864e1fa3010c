//! Keyed, append-only record archive.
//!
//! Layout: an 8-byte magic followed by records of
//! `[u32 key_len][key][u64 payload_len][bincode payload]`, little-endian.
//! Every append is flushed, so a reader only ever sees whole records plus at
//! most one truncated tail, which it ignores.

use crate::DreError;
use bincode::{Decode, Encode};
use rustc_hash::{FxHashMap, FxHashSet};
use std::fs::File;
use std::io::{BufReader, BufWriter, ErrorKind, Read, Seek, SeekFrom, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

const MAGIC: &[u8; 8] = b"DREARC01";

pub struct ArchiveWriter<T> {
    path: PathBuf,
    writer: BufWriter<File>,
    keys: FxHashSet<String>,
    _marker: PhantomData<T>,
}

impl<T: Encode> ArchiveWriter<T> {
    /// Create (or truncate) an archive at `path`.
    pub fn create(path: &Path) -> Result<Self, DreError> {
        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);
        writer.write_all(MAGIC)?;
        writer.flush()?;
        Ok(Self {
            path: path.to_path_buf(),
            writer,
            keys: FxHashSet::default(),
            _marker: PhantomData,
        })
    }

    pub fn append(&mut self, key: &str, value: &T) -> Result<(), DreError> {
        if self.keys.contains(key) {
            return Err(DreError::Archive(format!(
                "duplicate key {} in {}",
                key,
                self.path.display()
            )));
        }
        let payload = bincode::encode_to_vec(value, bincode::config::standard())?;
        let key_bytes = key.as_bytes();
        self.writer.write_all(&(key_bytes.len() as u32).to_le_bytes())?;
        self.writer.write_all(key_bytes)?;
        self.writer.write_all(&(payload.len() as u64).to_le_bytes())?;
        self.writer.write_all(&payload)?;
        self.writer.flush()?;
        self.keys.insert(key.to_string());
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn finish(mut self) -> Result<(), DreError> {
        self.writer.flush()?;
        Ok(())
    }
}

pub struct ArchiveReader<T> {
    path: PathBuf,
    reader: BufReader<File>,
    keys: Vec<String>,
    index: FxHashMap<String, (u64, u64)>,
    _marker: PhantomData<T>,
}

impl<T: Decode<()>> ArchiveReader<T> {
    pub fn open(path: &Path) -> Result<Self, DreError> {
        let mut reader = BufReader::new(File::open(path)?);
        let index = scan(&mut reader, path)?;
        let mut keys: Vec<String> = index.keys().cloned().collect();
        keys.sort();
        Ok(Self {
            path: path.to_path_buf(),
            reader,
            keys,
            index,
            _marker: PhantomData,
        })
    }

    /// Entry names in sorted order.
    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.index.contains_key(key)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&mut self, key: &str) -> Result<Option<T>, DreError> {
        let Some(&(offset, len)) = self.index.get(key) else {
            return Ok(None);
        };
        self.reader.seek(SeekFrom::Start(offset))?;
        let mut payload = vec![0u8; len as usize];
        self.reader.read_exact(&mut payload)?;
        let (value, _): (T, usize) =
            bincode::decode_from_slice(&payload, bincode::config::standard())?;
        Ok(Some(value))
    }

    pub fn first(&mut self) -> Result<Option<(String, T)>, DreError> {
        let Some(key) = self.keys.first().cloned() else {
            return Ok(None);
        };
        Ok(self.get(&key)?.map(|v| (key, v)))
    }
}

/// Index every complete record: key -> (payload offset, payload length).
fn scan(
    reader: &mut BufReader<File>,
    path: &Path,
) -> Result<FxHashMap<String, (u64, u64)>, DreError> {
    let file_len = reader.get_ref().metadata()?.len();
    let mut magic = [0u8; 8];
    match reader.read_exact(&mut magic) {
        Ok(()) if &magic == MAGIC => {}
        Ok(()) => {
            return Err(DreError::Archive(format!(
                "{} is not a dre archive",
                path.display()
            )));
        }
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
            return Err(DreError::Archive(format!("{} is empty", path.display())));
        }
        Err(e) => return Err(e.into()),
    }

    let mut index = FxHashMap::default();
    let mut pos = MAGIC.len() as u64;
    loop {
        let mut len_buf = [0u8; 4];
        if read_or_eof(reader, &mut len_buf)?.is_none() {
            break;
        }
        let key_len = u32::from_le_bytes(len_buf) as u64;
        if pos + 4 + key_len > file_len {
            break;
        }
        let mut key_buf = vec![0u8; key_len as usize];
        if read_or_eof(reader, &mut key_buf)?.is_none() {
            break;
        }
        let mut size_buf = [0u8; 8];
        if read_or_eof(reader, &mut size_buf)?.is_none() {
            break;
        }
        let payload_len = u64::from_le_bytes(size_buf);
        let payload_offset = pos + 4 + key_len + 8;
        if payload_offset + payload_len > file_len {
            break;
        }
        let key = String::from_utf8(key_buf).map_err(|e| {
            DreError::Archive(format!("bad key in {}: {}", path.display(), e))
        })?;
        reader.seek(SeekFrom::Start(payload_offset + payload_len))?;
        index.insert(key, (payload_offset, payload_len));
        pos = payload_offset + payload_len;
    }
    if pos < file_len {
        tracing::warn!(
            "{}: ignoring {} trailing bytes of an incomplete record",
            path.display(),
            file_len - pos
        );
    }
    Ok(index)
}

fn read_or_eof(reader: &mut BufReader<File>, buf: &mut [u8]) -> Result<Option<()>, DreError> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(Some(())),
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => Ok(None),
        Err(e) => Err(e.into()),
    }
}
