// server/src/state.rs

use rezstd_common::{Task, TaskId, TaskIdError, TaskManager};

#[derive(Clone)]
pub struct AppState {
    pub manager: TaskManager,
}

impl AppState {
    pub fn new(manager: TaskManager) -> Self {
        Self { manager }
    }

    /// Handle de la tarea a partir del segmento de URL, validando el id.
    pub fn task(&self, raw: &str) -> Result<Task, TaskIdError> {
        let id = TaskId::parse(raw)?;
        Ok(self.manager.open_task(id))
    }
}
