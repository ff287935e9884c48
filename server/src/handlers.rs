use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, Request, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use rezstd_common::{
    CancelResponse, ErrorBody, StatusKind, StatusResponse, Task, TaskState, UploadResponse,
};
use std::path::Path as FsPath;
use tokio::io::AsyncWriteExt;
use tower::ServiceExt;
use tower_http::{services::ServeFile, trace::TraceLayer};
use tracing::{info, warn};

use crate::state::AppState;

type ApiError = (StatusCode, Json<ErrorBody>);

fn api_error(code: StatusCode, msg: impl Into<String>) -> ApiError {
    (code, Json(ErrorBody { error: msg.into() }))
}

pub fn build_router(state: AppState) -> Router {
    let body_limit = match state.manager.config().max_upload_bytes {
        Some(max) => DefaultBodyLimit::max(max),
        None => DefaultBodyLimit::disable(),
    };

    Router::new()
        .route("/health", get(health))
        .route("/rezstd/upload/one", post(upload))
        .route("/rezstd/status/:task", get(status))
        .route("/rezstd/log/:task", get(log))
        .route("/rezstd/download/:task/:any_filename", get(download))
        .route("/rezstd/cancel/:task", post(cancel))
        .layer(body_limit)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/* ---------------- handlers HTTP ---------------- */

async fn health() -> &'static str {
    "ok"
}

fn open_task(state: &AppState, raw: &str) -> Result<Task, ApiError> {
    state
        .task(raw)
        .map_err(|e| api_error(StatusCode::BAD_REQUEST, e.to_string()))
}

// Guarda el primer campo "file" en `dest`. Devuelve los bytes escritos,
// o None si el formulario no traía el campo.
async fn receive_file(multipart: &mut Multipart, dest: &FsPath) -> anyhow::Result<Option<u64>> {
    while let Some(mut field) = multipart.next_field().await? {
        if field.name() != Some("file") {
            continue;
        }

        let mut file = tokio::fs::File::create(dest).await?;
        let mut written: u64 = 0;
        while let Some(chunk) = field.chunk().await? {
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        // el archivo tiene que estar completo en disco antes de arrancar
        file.sync_all().await?;
        return Ok(Some(written));
    }
    Ok(None)
}

// Recibe el archivo, crea la tarea y la lanza en segundo plano
async fn upload(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, ApiError> {
    let task = state.manager.create_task().map_err(|e| {
        warn!("no se pudo crear la tarea: {}", e);
        api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "no se pudo crear el directorio de la tarea",
        )
    })?;

    if let Err(e) = task.journal().append("Guardando el archivo recibido") {
        warn!("tarea {}: {}", task.id(), e);
    }

    match receive_file(&mut multipart, &task.paths().source).await {
        Ok(Some(bytes)) => {
            if let Err(e) = task
                .journal()
                .append(format!("Archivo recibido: {bytes} bytes"))
            {
                warn!("tarea {}: {}", task.id(), e);
            }
        }
        Ok(None) => {
            state
                .manager
                .abandon(&task, "el formulario no traía el campo 'file'");
            return Err(api_error(
                StatusCode::BAD_REQUEST,
                "falta el campo 'file' en el formulario",
            ));
        }
        Err(e) => {
            warn!("tarea {}: no se pudo guardar el archivo: {:#}", task.id(), e);
            state
                .manager
                .abandon(&task, &format!("no se pudo guardar el archivo: {e}"));
            return Err(api_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "no se pudo guardar el archivo",
            ));
        }
    }

    state.manager.start(task.clone());
    info!("tarea {} recibida y lanzada", task.id());

    Ok(Json(UploadResponse {
        task: task.id().clone(),
    }))
}

// Estado de la tarea + última línea del log
async fn status(
    State(state): State<AppState>,
    Path(raw): Path<String>,
) -> Result<(StatusCode, Json<StatusResponse>), ApiError> {
    let task = open_task(&state, &raw)?;

    if !task.exists() {
        return Ok((
            StatusCode::NOT_FOUND,
            Json(StatusResponse {
                status: StatusKind::NotFound,
                state: None,
                log_last_line: None,
            }),
        ));
    }

    let last_line = task.journal().read_last_line().map_err(|e| {
        warn!("tarea {}: {}", task.id(), e);
        api_error(StatusCode::INTERNAL_SERVER_ERROR, "no se pudo leer el log")
    })?;

    let persisted = task.load_state().unwrap_or_else(|e| {
        warn!("tarea {}: {}", task.id(), e);
        None
    });

    // el archivo publicado manda sobre cualquier otra cosa
    let (code, kind) = if task.is_finished() {
        (StatusCode::OK, StatusKind::Finished)
    } else if matches!(persisted, Some(TaskState::Failed { .. })) {
        (StatusCode::OK, StatusKind::Failed)
    } else {
        (StatusCode::ACCEPTED, StatusKind::Running)
    };

    Ok((
        code,
        Json(StatusResponse {
            status: kind,
            state: persisted,
            log_last_line: Some(last_line),
        }),
    ))
}

// Log completo en texto plano
async fn log(
    State(state): State<AppState>,
    Path(raw): Path<String>,
) -> Result<String, ApiError> {
    let task = open_task(&state, &raw)?;
    let content = task.journal().read_all().map_err(|e| {
        warn!("tarea {}: {}", task.id(), e);
        api_error(StatusCode::INTERNAL_SERVER_ERROR, "no se pudo leer el log")
    })?;

    if content.is_empty() {
        return Err(api_error(StatusCode::NOT_FOUND, "log no encontrado"));
    }
    Ok(content)
}

// Sirve el archivo publicado; el nombre final de la URL es libre
async fn download(
    State(state): State<AppState>,
    Path((raw, _any_filename)): Path<(String, String)>,
    request: Request,
) -> Result<Response, ApiError> {
    let task = open_task(&state, &raw)?;
    if !task.is_finished() {
        return Err(api_error(
            StatusCode::NOT_FOUND,
            "la tarea no existe o todavía no terminó",
        ));
    }

    match ServeFile::new(&task.paths().published).oneshot(request).await {
        Ok(res) => Ok(res.into_response()),
        Err(never) => match never {},
    }
}

async fn cancel(
    State(state): State<AppState>,
    Path(raw): Path<String>,
) -> Result<(StatusCode, Json<CancelResponse>), ApiError> {
    let task = open_task(&state, &raw)?;
    let cancelled = state.manager.cancel(task.id());
    let code = if cancelled {
        StatusCode::ACCEPTED
    } else {
        StatusCode::NOT_FOUND
    };
    Ok((
        code,
        Json(CancelResponse {
            task: task.id().clone(),
            cancelled,
        }),
    ))
}
