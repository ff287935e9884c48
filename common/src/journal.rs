use chrono::{DateTime, FixedOffset, Local};
use std::{
    fs::{self, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};
use thiserror::Error;
use tracing::info;

use crate::task::TaskId;

/// Formato fijo del timestamp que encabeza cada línea.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.9f %z";
/// Separador entre timestamp y mensaje.
pub const SEPARATOR: &str = " | ";

#[derive(Debug, Error)]
pub enum JournalError {
    #[error("no se pudo escribir el journal {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("no se pudo leer el journal {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Log de eventos append-only de una tarea (`task.log`).
///
/// Cada `append` abre, escribe una línea completa con un solo `write_all`,
/// hace `sync_data` y cierra. No hay buffer entre llamadas.
#[derive(Debug, Clone)]
pub struct TaskJournal {
    task_id: TaskId,
    path: PathBuf,
    // último timestamp emitido, para que nunca vaya para atrás
    last_stamp: Arc<Mutex<Option<DateTime<Local>>>>,
}

impl TaskJournal {
    pub fn new(task_id: TaskId, path: PathBuf) -> Self {
        Self {
            task_id,
            path,
            last_stamp: Arc::new(Mutex::new(None)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, message: impl AsRef<str>) -> Result<(), JournalError> {
        // una entrada = una línea
        let message = message.as_ref().replace(['\r', '\n'], " ");
        let stamp = self.next_stamp();
        let line = format!("{}{}{}\n", stamp.format(TIMESTAMP_FORMAT), SEPARATOR, message);

        info!(task = %self.task_id, "{}", message);

        let write = || -> io::Result<()> {
            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)?;
            file.write_all(line.as_bytes())?;
            file.sync_data()
        };
        write().map_err(|source| JournalError::Write {
            path: self.path.clone(),
            source,
        })
    }

    /// Contenido completo. Si el journal no existe devuelve "".
    pub fn read_all(&self) -> Result<String, JournalError> {
        match fs::read(&self.path) {
            Ok(bytes) => Ok(String::from_utf8_lossy(&bytes).into_owned()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(String::new()),
            Err(source) => Err(JournalError::Read {
                path: self.path.clone(),
                source,
            }),
        }
    }

    /// Última línea no vacía, o "" si no hay nada.
    pub fn read_last_line(&self) -> Result<String, JournalError> {
        let content = self.read_all()?;
        Ok(content
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .unwrap_or("")
            .to_string())
    }

    fn next_stamp(&self) -> DateTime<Local> {
        let now = Local::now();
        let mut last = self
            .last_stamp
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let stamp = match *last {
            Some(prev) if prev > now => prev,
            _ => now,
        };
        *last = Some(stamp);
        stamp
    }
}

/// Separa una línea del journal en (timestamp, mensaje).
pub fn parse_line(line: &str) -> Option<(DateTime<FixedOffset>, &str)> {
    let (stamp, message) = line.split_once(SEPARATOR)?;
    let stamp = DateTime::parse_from_str(stamp, TIMESTAMP_FORMAT).ok()?;
    Some((stamp, message))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    fn temp_journal(sub: &str) -> TaskJournal {
        let base = env::temp_dir()
            .join("journal_tests")
            .join(format!("{}-{}", sub, uuid::Uuid::new_v4()));
        fs::create_dir_all(&base).unwrap();
        let id = TaskId::parse("task_test").unwrap();
        TaskJournal::new(id, base.join("task.log"))
    }

    #[test]
    fn journal_inexistente_se_lee_como_vacio() {
        let journal = temp_journal("missing");
        assert_eq!(journal.read_all().unwrap(), "");
        assert_eq!(journal.read_last_line().unwrap(), "");
    }

    #[test]
    fn append_agrega_lineas_con_timestamp_parseable() {
        let journal = temp_journal("append");
        journal.append("Tarea creada").unwrap();
        journal.append("Guardando el archivo recibido").unwrap();

        let content = journal.read_all().unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);

        let (_, msg) = parse_line(lines[0]).unwrap();
        assert_eq!(msg, "Tarea creada");
        let (_, msg) = parse_line(lines[1]).unwrap();
        assert_eq!(msg, "Guardando el archivo recibido");
    }

    #[test]
    fn lecturas_sucesivas_son_prefijo_de_las_siguientes() {
        let journal = temp_journal("prefix");
        let mut previous = journal.read_all().unwrap();

        for i in 0..20 {
            journal.append(format!("evento {i}")).unwrap();
            let now = journal.read_all().unwrap();
            assert!(now.starts_with(&previous));
            assert!(now.len() > previous.len());
            previous = now;
        }
    }

    #[test]
    fn timestamps_no_decrecen() {
        let journal = temp_journal("monotonic");
        for i in 0..50 {
            journal.append(format!("linea {i}")).unwrap();
        }

        let content = journal.read_all().unwrap();
        let stamps: Vec<_> = content
            .lines()
            .map(|l| parse_line(l).unwrap().0)
            .collect();
        assert!(stamps.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn read_last_line_ignora_lineas_vacias_y_los_saltos_se_aplanan() {
        let journal = temp_journal("last");
        journal.append("primero").unwrap();
        journal.append("segundo\ncon salto").unwrap();

        let last = journal.read_last_line().unwrap();
        let (_, msg) = parse_line(&last).unwrap();
        assert_eq!(msg, "segundo con salto");
        assert_eq!(journal.read_all().unwrap().lines().count(), 2);
    }

    #[test]
    fn clones_comparten_el_orden_de_timestamps() {
        let journal = temp_journal("clones");
        let other = journal.clone();
        journal.append("a").unwrap();
        other.append("b").unwrap();
        journal.append("c").unwrap();

        let content = journal.read_all().unwrap();
        let msgs: Vec<&str> = content.lines().map(|l| parse_line(l).unwrap().1).collect();
        assert_eq!(msgs, vec!["a", "b", "c"]);
    }
}
