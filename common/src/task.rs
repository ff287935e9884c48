use chrono::Local;
use serde::{Deserialize, Serialize};
use std::{
    fmt, io,
    path::{Path, PathBuf},
};
use thiserror::Error;
use uuid::Uuid;

use crate::journal::TaskJournal;
use crate::state::{StateError, StateFile, TaskState};

pub const SOURCE_FILENAME: &str = "ori.zst";
pub const PUBLISHED_FILENAME: &str = "output.zst";
pub const JOURNAL_FILENAME: &str = "task.log";
pub const STATE_FILENAME: &str = "state.json";
pub const TEMP_FILENAME: &str = "__temp_running.zst.tmp";
pub const DOWNLOAD_DIRNAME: &str = "download";

/// Largo máximo aceptado al parsear un id que viene de afuera (URL, CLI).
const MAX_ID_LEN: usize = 128;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TaskIdError {
    #[error("id de tarea vacío")]
    Empty,
    #[error("id de tarea demasiado largo ({0} bytes)")]
    TooLong(usize),
    #[error("id de tarea con caracteres no permitidos: {0:?}")]
    InvalidChars(String),
}

/// Identificador de una tarea: `task_<fecha>_<uuid>`.
///
/// Sólo contiene `[A-Za-z0-9_-]`, así que se puede usar tal cual como
/// nombre de directorio y como segmento de URL.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TaskId(String);

impl TaskId {
    pub fn mint() -> Self {
        Self(format!(
            "task_{}_{}",
            Local::now().format("%Y-%m-%d"),
            Uuid::new_v4()
        ))
    }

    pub fn parse(raw: &str) -> Result<Self, TaskIdError> {
        if raw.is_empty() {
            return Err(TaskIdError::Empty);
        }
        if raw.len() > MAX_ID_LEN {
            return Err(TaskIdError::TooLong(raw.len()));
        }
        if !raw
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(TaskIdError::InvalidChars(raw.to_string()));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for TaskId {
    type Error = TaskIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<TaskId> for String {
    fn from(id: TaskId) -> Self {
        id.0
    }
}

/// Rutas resueltas de una tarea. Se arman una sola vez al crear el handle.
#[derive(Debug, Clone)]
pub struct TaskPaths {
    pub dir: PathBuf,
    pub source: PathBuf,
    pub journal: PathBuf,
    pub state: PathBuf,
    pub temp_output: PathBuf,
    pub download_dir: PathBuf,
    pub published: PathBuf,
}

impl TaskPaths {
    pub fn new(data_dir: &Path, id: &TaskId) -> Self {
        let dir = data_dir.join(id.as_str());
        let download_dir = dir.join(DOWNLOAD_DIRNAME);
        Self {
            source: dir.join(SOURCE_FILENAME),
            journal: dir.join(JOURNAL_FILENAME),
            state: dir.join(STATE_FILENAME),
            temp_output: dir.join(TEMP_FILENAME),
            published: download_dir.join(PUBLISHED_FILENAME),
            download_dir,
            dir,
        }
    }
}

/// Handle de una tarea: id, rutas y journal.
///
/// Los clones comparten el journal, así que el orden de los timestamps
/// se mantiene aunque el handle pase del handler HTTP al manager.
#[derive(Debug, Clone)]
pub struct Task {
    id: TaskId,
    paths: TaskPaths,
    journal: TaskJournal,
}

impl Task {
    /// Handle para una tarea que puede o no existir en disco.
    pub fn open(data_dir: &Path, id: TaskId) -> Self {
        let paths = TaskPaths::new(data_dir, &id);
        let journal = TaskJournal::new(id.clone(), paths.journal.clone());
        Self { id, paths, journal }
    }

    /// Mintea un id nuevo y crea su directorio.
    pub fn create(data_dir: &Path) -> io::Result<Self> {
        let task = Self::open(data_dir, TaskId::mint());
        std::fs::create_dir_all(&task.paths.dir)?;
        Ok(task)
    }

    pub fn id(&self) -> &TaskId {
        &self.id
    }

    pub fn paths(&self) -> &TaskPaths {
        &self.paths
    }

    pub fn journal(&self) -> &TaskJournal {
        &self.journal
    }

    pub fn state_file(&self) -> StateFile {
        StateFile::new(self.paths.state.clone())
    }

    pub fn load_state(&self) -> Result<Option<TaskState>, StateError> {
        self.state_file().load()
    }

    /// La existencia del artefacto publicado es la única señal de "terminado".
    pub fn is_finished(&self) -> bool {
        self.paths.published.is_file()
    }

    /// Hay journal => la tarea existe (aunque todavía no haya arrancado).
    pub fn exists(&self) -> bool {
        self.paths.journal.is_file()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn mint_genera_ids_unicos_y_seguros_para_rutas() {
        let ids: HashSet<TaskId> = (0..500).map(|_| TaskId::mint()).collect();
        assert_eq!(ids.len(), 500);

        for id in &ids {
            assert!(id.as_str().starts_with("task_"));
            assert!(!id.as_str().contains('/'));
            assert_eq!(TaskId::parse(id.as_str()).as_ref(), Ok(id));
        }
    }

    #[test]
    fn parse_rechaza_segmentos_peligrosos() {
        assert_eq!(TaskId::parse(""), Err(TaskIdError::Empty));
        assert!(matches!(
            TaskId::parse("../etc"),
            Err(TaskIdError::InvalidChars(_))
        ));
        assert!(matches!(
            TaskId::parse("a/b"),
            Err(TaskIdError::InvalidChars(_))
        ));
        assert!(matches!(
            TaskId::parse("tarea\n"),
            Err(TaskIdError::InvalidChars(_))
        ));
        assert!(matches!(
            TaskId::parse(&"x".repeat(200)),
            Err(TaskIdError::TooLong(200))
        ));
        assert!(TaskId::parse("task_2024-01-01_abc-123").is_ok());
    }

    #[test]
    fn task_id_se_serializa_como_string_y_valida_al_deserializar() {
        let id = TaskId::parse("task_x").unwrap();
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"task_x\"");

        let back: TaskId = serde_json::from_str("\"task_x\"").unwrap();
        assert_eq!(back, id);

        assert!(serde_json::from_str::<TaskId>("\"../x\"").is_err());
    }

    #[test]
    fn task_paths_quedan_dentro_del_directorio_de_la_tarea() {
        let id = TaskId::parse("task_abc").unwrap();
        let paths = TaskPaths::new(Path::new("/data/tasks"), &id);

        assert_eq!(paths.dir, PathBuf::from("/data/tasks/task_abc"));
        assert_eq!(paths.source, PathBuf::from("/data/tasks/task_abc/ori.zst"));
        assert_eq!(paths.journal, PathBuf::from("/data/tasks/task_abc/task.log"));
        assert_eq!(
            paths.published,
            PathBuf::from("/data/tasks/task_abc/download/output.zst")
        );
        assert_eq!(paths.temp_output.parent(), Some(paths.dir.as_path()));
    }
}
