use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use reqwest::{
    multipart::{Form, Part},
    Body, Client, StatusCode,
};
use rezstd_common::{CancelResponse, StatusKind, StatusResponse, TaskId, UploadResponse};
use std::{path::PathBuf, time::Duration};
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;

const DEFAULT_URL: &str = "http://localhost:8080";

#[derive(Parser)]
#[command(name = "rezstd")]
#[command(about = "CLI simple para hablar con el servidor de recompresión")]
struct Cli {
    /// URL base del servidor
    #[arg(long, env = "REZSTD_URL", default_value = DEFAULT_URL, global = true)]
    url: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sube un archivo y crea una tarea de recompresión
    Upload {
        #[arg(value_name = "ARCHIVO")]
        file: PathBuf,

        /// Espera a que la tarea termine
        #[arg(long)]
        wait: bool,
    },
    /// Consulta el estado de una tarea
    Status {
        #[arg(value_name = "TASK_ID", value_parser = parse_task_id)]
        id: TaskId,
    },
    /// Muestra el log completo de una tarea
    Log {
        #[arg(value_name = "TASK_ID", value_parser = parse_task_id)]
        id: TaskId,
    },
    /// Hace polling hasta que la tarea termine o falle
    Wait {
        #[arg(value_name = "TASK_ID", value_parser = parse_task_id)]
        id: TaskId,

        /// Segundos entre consultas
        #[arg(long, default_value_t = 2)]
        interval: u64,
    },
    /// Descarga el archivo recomprimido
    Download {
        #[arg(value_name = "TASK_ID", value_parser = parse_task_id)]
        id: TaskId,

        /// Ruta de salida (por defecto <TASK_ID>.zst)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Cancela una tarea en curso
    Cancel {
        #[arg(value_name = "TASK_ID", value_parser = parse_task_id)]
        id: TaskId,
    },
}

fn parse_task_id(raw: &str) -> Result<TaskId, String> {
    TaskId::parse(raw).map_err(|e| e.to_string())
}

fn endpoint(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
}

async fn fetch_status(client: &Client, base: &str, id: &TaskId) -> Result<StatusResponse> {
    let url = endpoint(base, &format!("rezstd/status/{id}"));
    let resp = client.get(&url).send().await?;
    let code = resp.status();
    if code == StatusCode::BAD_REQUEST || code.is_server_error() {
        bail!("el servidor respondió {} para {}", code, url);
    }
    Ok(resp.json().await?)
}

fn print_status(id: &TaskId, status: &StatusResponse) {
    println!("Tarea:");
    println!("  id: {}", id);
    println!("  estado: {:?}", status.status);
    if let Some(ref state) = status.state {
        println!("  etapa: {}", state.label());
    }
    if let Some(ref line) = status.log_last_line {
        println!("  último log: {}", line);
    }
}

async fn upload(client: &Client, base: &str, file: &PathBuf) -> Result<TaskId> {
    let handle = tokio::fs::File::open(file)
        .await
        .with_context(|| format!("no se pudo abrir {}", file.display()))?;
    let len = handle.metadata().await?.len();
    let file_name = file
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "upload.zst".to_string());

    // se manda en streaming, sin cargar el archivo en memoria
    let part = Part::stream_with_length(Body::wrap_stream(ReaderStream::new(handle)), len)
        .file_name(file_name)
        .mime_str("application/octet-stream")?;
    let form = Form::new().part("file", part);

    let url = endpoint(base, "rezstd/upload/one");
    let resp = client.post(&url).multipart(form).send().await?;
    if !resp.status().is_success() {
        bail!(
            "la subida falló (status {}): {}",
            resp.status(),
            resp.text().await.unwrap_or_default()
        );
    }
    let UploadResponse { task } = resp.json().await?;
    Ok(task)
}

async fn wait_for(client: &Client, base: &str, id: &TaskId, interval: Duration) -> Result<()> {
    let mut last_seen = String::new();
    loop {
        let status = fetch_status(client, base, id).await?;
        if let Some(ref line) = status.log_last_line {
            if *line != last_seen {
                println!("{}", line);
                last_seen = line.clone();
            }
        }

        match status.status {
            StatusKind::Finished => {
                println!("Tarea {} terminada.", id);
                return Ok(());
            }
            StatusKind::Failed => bail!("la tarea {} falló", id),
            StatusKind::NotFound => bail!("no se encontró la tarea {}", id),
            StatusKind::Running => tokio::time::sleep(interval).await,
        }
    }
}

async fn download(client: &Client, base: &str, id: &TaskId, output: PathBuf) -> Result<u64> {
    let url = endpoint(base, &format!("rezstd/download/{id}/output.zst"));
    let mut resp = client.get(&url).send().await?;
    if !resp.status().is_success() {
        bail!("no se pudo descargar la tarea {} (status {})", id, resp.status());
    }

    // se escribe a un .part y se renombra al final
    let partial = output.with_extension("part");
    let mut file = tokio::fs::File::create(&partial)
        .await
        .with_context(|| format!("no se pudo crear {}", partial.display()))?;
    let mut written: u64 = 0;
    while let Some(chunk) = resp.chunk().await? {
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    file.sync_all().await?;
    tokio::fs::rename(&partial, &output).await?;
    Ok(written)
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    let client = Client::new();
    let base_url = cli.url;

    match cli.command {
        Commands::Upload { file, wait } => {
            let id = upload(&client, &base_url, &file).await?;
            println!("Tarea creada:");
            println!("  id: {}", id);
            if wait {
                wait_for(&client, &base_url, &id, Duration::from_secs(2)).await?;
            }
        }

        Commands::Status { id } => {
            let status = fetch_status(&client, &base_url, &id).await?;
            if status.status == StatusKind::NotFound {
                println!("No se encontró la tarea con id {id}");
            } else {
                print_status(&id, &status);
            }
        }

        Commands::Log { id } => {
            let url = endpoint(&base_url, &format!("rezstd/log/{id}"));
            let resp = client.get(&url).send().await?;
            if resp.status().is_success() {
                print!("{}", resp.text().await?);
            } else {
                println!("No se encontró el log de la tarea {id}");
            }
        }

        Commands::Wait { id, interval } => {
            wait_for(&client, &base_url, &id, Duration::from_secs(interval.max(1))).await?;
        }

        Commands::Download { id, output } => {
            let output = output.unwrap_or_else(|| PathBuf::from(format!("{id}.zst")));
            let bytes = download(&client, &base_url, &id, output.clone()).await?;
            println!("Descargados {} bytes en {}", bytes, output.display());
        }

        Commands::Cancel { id } => {
            let url = endpoint(&base_url, &format!("rezstd/cancel/{id}"));
            let resp = client.post(&url).send().await?;
            let body: CancelResponse = resp.json().await?;
            if body.cancelled {
                println!("Tarea {} cancelada", body.task);
            } else {
                println!("La tarea {} no estaba corriendo", body.task);
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_une_sin_barras_dobles() {
        assert_eq!(
            endpoint("http://localhost:8080/", "/rezstd/status/x"),
            "http://localhost:8080/rezstd/status/x"
        );
        assert_eq!(endpoint("http://h", "health"), "http://h/health");
    }

    #[test]
    fn parsea_subcomandos() {
        let cli = Cli::try_parse_from([
            "rezstd",
            "--url",
            "http://master:8080",
            "download",
            "task_2024-01-01_abc",
            "-o",
            "/tmp/out.zst",
        ])
        .unwrap();
        assert_eq!(cli.url, "http://master:8080");
        match cli.command {
            Commands::Download { id, output } => {
                assert_eq!(id.as_str(), "task_2024-01-01_abc");
                assert_eq!(output, Some(PathBuf::from("/tmp/out.zst")));
            }
            _ => panic!("subcomando inesperado"),
        }
    }

    #[test]
    fn rechaza_ids_invalidos() {
        assert!(Cli::try_parse_from(["rezstd", "status", "../etc"]).is_err());
    }

    #[test]
    fn wait_usa_intervalo_por_defecto() {
        let cli = Cli::try_parse_from(["rezstd", "wait", "task_x"]).unwrap();
        match cli.command {
            Commands::Wait { interval, .. } => assert_eq!(interval, 2),
            _ => panic!("subcomando inesperado"),
        }
    }
}
