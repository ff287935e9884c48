use serde::{Deserialize, Serialize};

use crate::state::TaskState;
use crate::task::TaskId;

/* --------- DTOs HTTP compartidos entre server y client --------- */

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadResponse {
    pub task: TaskId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusKind {
    Finished,
    Running,
    Failed,
    #[serde(rename = "not found")]
    NotFound,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: StatusKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<TaskState>,
    #[serde(rename = "log-last-line")]
    pub log_last_line: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelResponse {
    pub task: TaskId,
    pub cancelled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}
