use std::fmt;
use std::path::PathBuf;

#[derive(Debug)]
pub enum DreError {
    ModelLoad(String),
    PsfNotFound(PathBuf),
    Cancelled,
    WorkerCrashed(usize),
    Archive(String),
    Config(String),
    Serialization(Box<bincode::error::EncodeError>),
    Deserialization(Box<bincode::error::DecodeError>),
    Json(serde_json::Error),
    Io(std::io::Error),
    Other(String),
}

impl fmt::Display for DreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DreError::ModelLoad(e) => write!(f, "Model load error: {}", e),
            DreError::PsfNotFound(p) => write!(f, "PSF file not found: {}", p.display()),
            DreError::Cancelled => write!(f, "Cancelled by user request"),
            DreError::WorkerCrashed(n) => write!(f, "{} worker(s) crashed", n),
            DreError::Archive(e) => write!(f, "Archive error: {}", e),
            DreError::Config(e) => write!(f, "Config error: {}", e),
            DreError::Serialization(e) => write!(f, "Serialization error: {}", e),
            DreError::Deserialization(e) => write!(f, "Deserialization error: {}", e),
            DreError::Json(e) => write!(f, "JSON error: {}", e),
            DreError::Io(e) => write!(f, "IO error: {}", e),
            DreError::Other(e) => write!(f, "Error: {}", e),
        }
    }
}

impl std::error::Error for DreError {}

impl From<bincode::error::EncodeError> for DreError {
    fn from(err: bincode::error::EncodeError) -> Self {
        DreError::Serialization(Box::new(err))
    }
}

impl From<bincode::error::DecodeError> for DreError {
    fn from(err: bincode::error::DecodeError) -> Self {
        DreError::Deserialization(Box::new(err))
    }
}

impl From<serde_json::Error> for DreError {
    fn from(err: serde_json::Error) -> Self {
        DreError::Json(err)
    }
}

impl From<std::io::Error> for DreError {
    fn from(err: std::io::Error) -> Self {
        DreError::Io(err)
    }
}

impl From<ndarray::ShapeError> for DreError {
    fn from(err: ndarray::ShapeError) -> Self {
        DreError::Other(format!("shape error: {}", err))
    }
}

impl From<String> for DreError {
    fn from(err: String) -> Self {
        DreError::Other(err)
    }
}

impl From<&str> for DreError {
    fn from(err: &str) -> Self {
        DreError::Other(err.to_string())
    }
}
