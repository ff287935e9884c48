use thiserror::Error;

use crate::admission::GateError;
use crate::journal::JournalError;
use crate::pipeline::PipelineError;
use crate::state::{FailureKind, StateError};

/// Falla terminal de una tarea. `details` guarda una línea por causa
/// (por ejemplo, las dos etapas del pipeline fallando a la vez).
#[derive(Debug, Error)]
#[error("{reason}")]
pub struct TaskError {
    pub kind: FailureKind,
    pub reason: String,
    pub details: Vec<String>,
}

impl TaskError {
    pub fn new(kind: FailureKind, reason: impl Into<String>) -> Self {
        Self {
            kind,
            reason: reason.into(),
            details: Vec::new(),
        }
    }

    pub fn input(reason: impl Into<String>) -> Self {
        Self::new(FailureKind::Input, reason)
    }

    pub fn publication(reason: impl Into<String>) -> Self {
        Self::new(FailureKind::Publication, reason)
    }

    pub fn internal(reason: impl Into<String>) -> Self {
        Self::new(FailureKind::Internal, reason)
    }

    /// Errores del probe: salvo cancelación, son culpa del archivo.
    pub fn from_probe(err: PipelineError) -> Self {
        match err {
            PipelineError::Cancelled => Self::new(FailureKind::Cancelled, "tarea cancelada"),
            other => Self::with_causes(
                FailureKind::Input,
                format!("el archivo original no pasó la verificación: {other}"),
                &other,
            ),
        }
    }

    fn with_causes(kind: FailureKind, reason: String, err: &PipelineError) -> Self {
        Self {
            kind,
            reason,
            details: err.causes().iter().map(|c| c.to_string()).collect(),
        }
    }
}

impl From<PipelineError> for TaskError {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::Cancelled => Self::new(FailureKind::Cancelled, "tarea cancelada"),
            other => Self::with_causes(
                FailureKind::Pipeline,
                format!("falló el pipeline de recompresión: {other}"),
                &other,
            ),
        }
    }
}

impl From<GateError> for TaskError {
    fn from(err: GateError) -> Self {
        match err {
            GateError::Cancelled => Self::new(FailureKind::Cancelled, "tarea cancelada"),
            timed_out @ GateError::TimedOut { .. } => {
                Self::new(FailureKind::TimedOut, format!("admisión: {timed_out}"))
            }
        }
    }
}

impl From<JournalError> for TaskError {
    fn from(err: JournalError) -> Self {
        Self::internal(err.to_string())
    }
}

impl From<StateError> for TaskError {
    fn from(err: StateError) -> Self {
        Self::internal(err.to_string())
    }
}
