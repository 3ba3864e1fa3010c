pub mod archive;
pub mod array;
pub mod cancel;
pub mod collector;
pub mod config;
pub mod cutout;
pub mod error;
pub mod feeder;
pub mod fits;
pub mod kernel;
pub mod model_store;
pub mod orchestrator;
pub mod progress;
pub mod psf;
pub mod queue;
pub mod result;
pub mod synthetic;
pub mod worker;

pub use cancel::CancellationToken;
pub use config::{EngineConfig, JobPaths, RunPaths};
pub use error::*;
pub use model_store::{ModelStore, SharedModels};
pub use orchestrator::{Engine, FileOutcome, JobReport, JobState, RunReport};
pub use queue::{QueueConsumer, QueueProducer, work_queue_pair};
