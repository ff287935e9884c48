pub mod admission;
pub mod api;
pub mod codec;
pub mod config;
pub mod error;
pub mod journal;
pub mod manager;
pub mod pipeline;
pub mod state;
pub mod task;

pub use admission::{AdmissionGate, GateError, MemorySampler, SystemMemory};
pub use api::{CancelResponse, ErrorBody, StatusKind, StatusResponse, UploadResponse};
pub use codec::{Codec, ZstdCodec, ZstdSettings};
pub use config::{Config, ConfigError};
pub use error::TaskError;
pub use journal::{JournalError, TaskJournal};
pub use manager::TaskManager;
pub use pipeline::{PipelineError, PipelineRunner, Progress};
pub use state::{FailureKind, StateFile, TaskState};
pub use task::{Task, TaskId, TaskIdError, TaskPaths};
