use std::{
    collections::HashMap,
    io,
    sync::{Arc, Mutex, MutexGuard},
};
use tokio::{task::JoinHandle, time::timeout};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::admission::{AdmissionGate, MemorySampler, SystemMemory};
use crate::codec::{Codec, ZstdCodec};
use crate::config::Config;
use crate::error::TaskError;
use crate::pipeline::PipelineRunner;
use crate::state::{FailureKind, StateError, TaskState};
use crate::task::{Task, TaskId, TaskPaths};

const MIB: u64 = 1024 * 1024;

/// Lleva el estado persistido de una tarea y valida cada transición.
struct StateTracker<'a> {
    task: &'a Task,
    current: TaskState,
}

impl<'a> StateTracker<'a> {
    fn resume(task: &'a Task) -> Self {
        let current = match task.load_state() {
            Ok(Some(state)) => state,
            Ok(None) => TaskState::Created,
            Err(e) => {
                warn!("tarea {}: estado ilegible ({}), se asume CREATED", task.id(), e);
                TaskState::Created
            }
        };
        Self { task, current }
    }

    fn advance(&mut self, next: TaskState) -> Result<(), TaskError> {
        if !self.current.can_advance_to(&next) {
            return Err(StateError::InvalidTransition {
                from: self.current.label(),
                to: next.label(),
            }
            .into());
        }
        self.task.state_file().store(&next)?;
        self.task
            .journal()
            .append(format!("Estado: {} -> {}", self.current.label(), next.label()))?;
        self.current = next;
        Ok(())
    }

    fn fail(&mut self, kind: FailureKind, reason: String) -> TaskState {
        let failed = TaskState::Failed { kind, reason };
        if !self.current.can_advance_to(&failed) {
            return self.current.clone();
        }
        if let Err(e) = self.task.state_file().store(&failed) {
            error!("tarea {}: no se pudo guardar el estado FAILED: {}", self.task.id(), e);
        }
        self.current = failed;
        self.current.clone()
    }
}

/// Mueve el temporal a `download/` con un único rename.
async fn publish(paths: &TaskPaths) -> io::Result<()> {
    // que los bytes estén en disco antes de hacerlos visibles
    tokio::fs::File::open(&paths.temp_output)
        .await?
        .sync_all()
        .await?;
    tokio::fs::create_dir_all(&paths.download_dir).await?;
    tokio::fs::rename(&paths.temp_output, &paths.published).await
}

/// Orquesta cada tarea de punta a punta:
/// verificar → probe → admisión → recompresión → publicación.
///
/// Cualquier error se convierte en una línea terminal del journal y en
/// `TaskState::Failed`; nunca sale de la tarea que lo produjo.
#[derive(Clone)]
pub struct TaskManager {
    config: Arc<Config>,
    runner: PipelineRunner,
    gate: AdmissionGate,
    running: Arc<Mutex<HashMap<TaskId, CancellationToken>>>,
}

impl TaskManager {
    pub fn new(config: Config, codec: Arc<dyn Codec>, sampler: Arc<dyn MemorySampler>) -> Self {
        let runner = PipelineRunner::new(codec, config.chunk_size, config.progress_interval);
        let gate = AdmissionGate::new(sampler, config.gate_max_backoff)
            .with_max_wait(config.gate_max_wait);
        Self {
            config: Arc::new(config),
            runner,
            gate,
            running: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// zstd + memoria real del sistema.
    pub fn from_config(config: Config) -> Self {
        let codec = Arc::new(ZstdCodec::new(config.codec.clone()));
        Self::new(config, codec, Arc::new(SystemMemory::new()))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn open_task(&self, id: TaskId) -> Task {
        Task::open(&self.config.data_dir, id)
    }

    /// Reserva id y directorio para una tarea nueva.
    pub fn create_task(&self) -> Result<Task, TaskError> {
        let task = Task::create(&self.config.data_dir).map_err(|e| {
            TaskError::internal(format!("no se pudo crear el directorio de la tarea: {e}"))
        })?;
        task.state_file().store(&TaskState::Created)?;
        task.journal().append("Tarea creada")?;
        Ok(task)
    }

    /// Marca como fallida una tarea que nunca llegó a arrancar
    /// (por ejemplo, si la subida se cortó).
    pub fn abandon(&self, task: &Task, reason: &str) -> TaskState {
        let mut tracker = StateTracker::resume(task);
        if let Err(e) = task.journal().append(format!("Tarea fallida (input): {reason}")) {
            error!("tarea {}: {}", task.id(), e);
        }
        tracker.fail(FailureKind::Input, reason.to_string())
    }

    /// Lanza la tarea en segundo plano. Devuelve `None` si ya está corriendo
    /// o si ya terminó.
    pub fn start(&self, task: Task) -> Option<JoinHandle<TaskState>> {
        match task.load_state() {
            Ok(Some(state)) if state.is_terminal() => {
                warn!("tarea {} ya está en estado {}, no se relanza", task.id(), state.label());
                return None;
            }
            _ => {}
        }

        let cancel = CancellationToken::new();
        {
            let mut running = self.running();
            if running.contains_key(task.id()) {
                warn!("tarea {} ya está corriendo", task.id());
                return None;
            }
            running.insert(task.id().clone(), cancel.clone());
        }

        info!("lanzando tarea {}", task.id());
        let manager = self.clone();
        Some(tokio::spawn(async move {
            let state = manager.run(&task, cancel).await;
            manager.running().remove(task.id());
            info!("tarea {} terminó en estado {}", task.id(), state.label());
            state
        }))
    }

    /// Cancela una tarea en curso. `false` si no estaba corriendo.
    pub fn cancel(&self, id: &TaskId) -> bool {
        match self.running().get(id) {
            Some(token) => {
                info!("cancelando tarea {}", id);
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self, id: &TaskId) -> bool {
        self.running().contains_key(id)
    }

    /// Corre la máquina de estados hasta un estado terminal.
    pub async fn run(&self, task: &Task, cancel: CancellationToken) -> TaskState {
        let mut tracker = StateTracker::resume(task);

        // el límite cubre hasta la recompresión; la publicación queda afuera
        let recoded = match self.config.max_execution {
            Some(limit) => match timeout(limit, self.recode(task, &mut tracker, &cancel)).await {
                Ok(r) => r,
                Err(_) => Err(TaskError::new(
                    FailureKind::TimedOut,
                    format!("se superó el tiempo máximo de ejecución ({limit:?})"),
                )),
            },
            None => self.recode(task, &mut tracker, &cancel).await,
        };

        let driven = match recoded {
            Ok(()) => self.publish_output(task, &mut tracker).await,
            Err(err) => Err(err),
        };

        match driven {
            Ok(()) => tracker.current.clone(),
            Err(err) => self.fail(task, &mut tracker, err).await,
        }
    }

    async fn fail(&self, task: &Task, tracker: &mut StateTracker<'_>, err: TaskError) -> TaskState {
        let journal = task.journal();
        for detail in &err.details {
            if let Err(e) = journal.append(format!("Causa: {detail}")) {
                error!("tarea {}: {}", task.id(), e);
            }
        }
        if let Err(e) = journal.append(format!("Tarea fallida ({}): {}", err.kind, err.reason)) {
            error!("tarea {}: {}", task.id(), e);
        }

        // el temporal de una corrida fallida no vale nada
        match tokio::fs::remove_file(&task.paths().temp_output).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("tarea {}: no se pudo borrar el temporal: {}", task.id(), e),
        }

        tracker.fail(err.kind, err.reason)
    }

    async fn admit(&self, task: &Task, cancel: &CancellationToken) -> Result<(), TaskError> {
        let floor = self.config.min_available_memory;
        task.journal().append(format!(
            "Esperando memoria disponible (mínimo {} MiB)",
            floor / MIB
        ))?;
        let admission = self.gate.wait(floor, cancel).await?;
        task.journal().append(format!(
            "Memoria disponible: {} MiB",
            admission.available / MIB
        ))?;
        Ok(())
    }

    /// Verificación, probe, admisión y recompresión al temporal.
    async fn recode(
        &self,
        task: &Task,
        tracker: &mut StateTracker<'_>,
        cancel: &CancellationToken,
    ) -> Result<(), TaskError> {
        let journal = task.journal();
        let paths = task.paths();

        journal.append("Verificando integridad y tamaño del archivo")?;
        let original_size = match tokio::fs::metadata(&paths.source).await {
            Ok(meta) if meta.is_file() => meta.len(),
            Ok(_) => return Err(TaskError::input("el archivo original no es un archivo regular")),
            Err(e) => {
                return Err(TaskError::input(format!(
                    "no se pudo leer el archivo original: {e}"
                )))
            }
        };
        journal.append(format!("Tamaño del archivo original: {original_size}"))?;

        tracker.advance(TaskState::Probing)?;
        self.admit(task, cancel).await?;
        journal.append("Calculando tamaño descomprimido")?;
        let uncompressed = self
            .runner
            .probe_size(&paths.source, cancel)
            .await
            .map_err(TaskError::from_probe)?;
        journal.append(format!("Tamaño descomprimido: {uncompressed}"))?;

        tracker.advance(TaskState::Admitting)?;
        self.admit(task, cancel).await?;

        tracker.advance(TaskState::Recompressing)?;
        journal.append(format!(
            "Recomprimiendo con {}, armando pipelines",
            self.runner.codec().name()
        ))?;
        let transferred = self
            .runner
            .recompress(&paths.source, uncompressed, &paths.temp_output, cancel, |p| {
                if let Err(e) = journal.append(p.to_string()) {
                    warn!("tarea {}: no se pudo registrar el progreso: {}", task.id(), e);
                }
            })
            .await?;
        if transferred != uncompressed {
            warn!(
                "tarea {}: el probe dio {} bytes pero pasaron {} por el pipe",
                task.id(),
                uncompressed,
                transferred
            );
        }
        journal.append(format!(
            "Recompresión terminada ({transferred} bytes transferidos)"
        ))?;

        let recompressed = tokio::fs::metadata(&paths.temp_output)
            .await
            .map_err(|e| {
                TaskError::new(
                    FailureKind::Pipeline,
                    format!("encode terminó bien pero no dejó salida: {e}"),
                )
            })?
            .len();
        let ratio = if original_size == 0 {
            0.0
        } else {
            recompressed as f64 / original_size as f64 * 100.0
        };
        journal.append(format!(
            "Tamaño recomprimido: {recompressed} ({ratio:.2}% del archivo original)"
        ))?;
        Ok(())
    }

    async fn publish_output(
        &self,
        task: &Task,
        tracker: &mut StateTracker<'_>,
    ) -> Result<(), TaskError> {
        let journal = task.journal();
        tracker.advance(TaskState::Publishing)?;
        journal.append("Moviendo el archivo recomprimido al directorio de descarga")?;
        publish(task.paths())
            .await
            .map_err(|e| TaskError::publication(format!("no se pudo publicar el resultado: {e}")))?;

        tracker.advance(TaskState::Finished)?;
        journal.append("Tarea terminada, ¡genial!")?;
        Ok(())
    }

    fn running(&self) -> MutexGuard<'_, HashMap<TaskId, CancellationToken>> {
        self.running
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
