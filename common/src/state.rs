use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{
    fmt,
    fs::{self, File},
    io::{self, Write},
    path::PathBuf,
};
use thiserror::Error;

/// Clasificación de una falla terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Archivo original ausente o corrupto.
    Input,
    /// Alguna etapa del pipeline no arrancó, falló o se rompió un pipe.
    Pipeline,
    /// No se pudo mover el resultado a su lugar final.
    Publication,
    Cancelled,
    TimedOut,
    /// Problemas propios (journal, archivo de estado).
    Internal,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureKind::Input => "input",
            FailureKind::Pipeline => "pipeline",
            FailureKind::Publication => "publication",
            FailureKind::Cancelled => "cancelled",
            FailureKind::TimedOut => "timed_out",
            FailureKind::Internal => "internal",
        };
        f.write_str(s)
    }
}

/// Estado explícito de una tarea. Avanza en línea recta; `Failed` puede
/// alcanzarse desde cualquier estado no terminal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Created,
    Probing,
    Admitting,
    Recompressing,
    Publishing,
    Finished,
    Failed { kind: FailureKind, reason: String },
}

impl TaskState {
    fn step(&self) -> Option<u8> {
        match self {
            TaskState::Created => Some(0),
            TaskState::Probing => Some(1),
            TaskState::Admitting => Some(2),
            TaskState::Recompressing => Some(3),
            TaskState::Publishing => Some(4),
            TaskState::Finished => Some(5),
            TaskState::Failed { .. } => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Finished | TaskState::Failed { .. })
    }

    pub fn can_advance_to(&self, next: &TaskState) -> bool {
        if self.is_terminal() {
            return false;
        }
        match (self.step(), next.step()) {
            (_, None) => true,
            (Some(cur), Some(nxt)) => nxt == cur + 1,
            (None, Some(_)) => false,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            TaskState::Created => "CREATED",
            TaskState::Probing => "PROBING",
            TaskState::Admitting => "ADMITTING",
            TaskState::Recompressing => "RECOMPRESSING",
            TaskState::Publishing => "PUBLISHING",
            TaskState::Finished => "FINISHED",
            TaskState::Failed { .. } => "FAILED",
        }
    }
}

#[derive(Debug, Error)]
pub enum StateError {
    #[error("E/S sobre el archivo de estado {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("archivo de estado {path} inválido: {source}")]
    Format {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("transición inválida: {from} -> {to}")]
    InvalidTransition {
        from: &'static str,
        to: &'static str,
    },
}

#[derive(Debug, Serialize, Deserialize)]
struct StateRecord {
    #[serde(flatten)]
    state: TaskState,
    updated_at: DateTime<Utc>,
}

/// `state.json` de una tarea. Se reescribe con archivo temporal + rename,
/// así que un lector nunca ve un JSON a medias.
#[derive(Debug, Clone)]
pub struct StateFile {
    path: PathBuf,
}

impl StateFile {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn load(&self) -> Result<Option<TaskState>, StateError> {
        let bytes = match fs::read(&self.path) {
            Ok(b) => b,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(StateError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };
        let record: StateRecord =
            serde_json::from_slice(&bytes).map_err(|source| StateError::Format {
                path: self.path.clone(),
                source,
            })?;
        Ok(Some(record.state))
    }

    pub fn store(&self, state: &TaskState) -> Result<(), StateError> {
        let record = StateRecord {
            state: state.clone(),
            updated_at: Utc::now(),
        };
        let json = serde_json::to_vec_pretty(&record).map_err(|source| StateError::Format {
            path: self.path.clone(),
            source,
        })?;

        let tmp = self.path.with_extension("json.tmp");
        let write = || -> io::Result<()> {
            let mut file = File::create(&tmp)?;
            file.write_all(&json)?;
            file.sync_all()?;
            fs::rename(&tmp, &self.path)
        };
        write().map_err(|source| StateError::Io {
            path: self.path.clone(),
            source,
        })
    }
}
