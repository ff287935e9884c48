use std::{
    fmt, io,
    path::Path,
    process::{ExitStatus, Stdio},
    sync::Arc,
    time::Duration,
};
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    process::Child,
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::codec::Codec;

const MIB: f64 = 1024.0 * 1024.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Decode,
    Encode,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Decode => f.write_str("decode"),
            Stage::Encode => f.write_str("encode"),
        }
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("no se pudo iniciar la etapa {stage}: {source}")]
    Spawn {
        stage: Stage,
        #[source]
        source: io::Error,
    },
    #[error("la etapa {stage} no expuso su pipe")]
    MissingPipe { stage: Stage },
    #[error("error en el pipe de la etapa {stage}: {source}")]
    Pipe {
        stage: Stage,
        #[source]
        source: io::Error,
    },
    #[error("no se pudo esperar a la etapa {stage}: {source}")]
    Wait {
        stage: Stage,
        #[source]
        source: io::Error,
    },
    #[error("la etapa {stage} terminó con {status}")]
    Exit { stage: Stage, status: ExitStatus },
    #[error("{}", join_errors(.0))]
    Multiple(Vec<PipelineError>),
    #[error("pipeline cancelado")]
    Cancelled,
}

impl PipelineError {
    /// Errores individuales (aplana `Multiple`).
    pub fn causes(&self) -> Vec<&PipelineError> {
        match self {
            PipelineError::Multiple(all) => all.iter().flat_map(|e| e.causes()).collect(),
            other => vec![other],
        }
    }

    fn from_many(mut errors: Vec<PipelineError>) -> Option<PipelineError> {
        match errors.len() {
            0 => None,
            1 => errors.pop(),
            _ => Some(PipelineError::Multiple(errors)),
        }
    }
}

fn join_errors(errors: &[PipelineError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Una muestra de progreso del pipeline de recompresión.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Progress {
    pub transferred: u64,
    pub size_hint: u64,
    /// Tiempo desde el reporte anterior.
    pub interval: Duration,
    /// Bytes copiados desde el reporte anterior.
    pub interval_bytes: u64,
}

impl Progress {
    /// Bytes por segundo en el último intervalo.
    pub fn throughput(&self) -> u64 {
        let secs = self.interval.as_secs_f64();
        if secs <= 0.0 {
            return 0;
        }
        (self.interval_bytes as f64 / secs) as u64
    }

    /// Porcentaje contra el tamaño estimado. Sin estimación es 0.
    pub fn percent(&self) -> u64 {
        if self.size_hint == 0 {
            return 0;
        }
        ((self.transferred as u128 * 100) / self.size_hint as u128) as u64
    }
}

impl fmt::Display for Progress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let throughput = self.throughput();
        write!(
            f,
            "Progreso de recompresión: {}/{} (tiempo: {:.2}s, velocidad: {} B/s ~ {:.2} MiB/s, {}%)",
            self.transferred,
            self.size_hint,
            self.interval.as_secs_f64(),
            throughput,
            throughput as f64 / MIB,
            self.percent()
        )
    }
}

/// Copia `reader` en `writer` por bloques de `chunk_size`, contando bytes.
/// Cada vez que pasa `report_every` desde el último reporte llama a
/// `on_progress`, y una vez más al terminar si quedaron bytes sin
/// reportar. Nunca acumula más de un bloque en memoria.
pub async fn copy_with_progress<R, W, F>(
    reader: &mut R,
    writer: &mut W,
    chunk_size: usize,
    size_hint: u64,
    report_every: Duration,
    mut on_progress: F,
) -> Result<u64, PipelineError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    F: FnMut(&Progress),
{
    let mut buf = vec![0u8; chunk_size.max(1)];
    let mut transferred: u64 = 0;
    let mut last_report = Instant::now();
    let mut reported_bytes: u64 = 0;

    loop {
        let n = reader
            .read(&mut buf)
            .await
            .map_err(|source| PipelineError::Pipe {
                stage: Stage::Decode,
                source,
            })?;
        if n == 0 {
            break;
        }
        writer
            .write_all(&buf[..n])
            .await
            .map_err(|source| PipelineError::Pipe {
                stage: Stage::Encode,
                source,
            })?;
        transferred += n as u64;

        let interval = last_report.elapsed();
        if interval >= report_every {
            on_progress(&Progress {
                transferred,
                size_hint,
                interval,
                interval_bytes: transferred - reported_bytes,
            });
            last_report = Instant::now();
            reported_bytes = transferred;
        }
    }

    // cierre: lo que quedó sin reportar
    if transferred > reported_bytes {
        on_progress(&Progress {
            transferred,
            size_hint,
            interval: last_report.elapsed(),
            interval_bytes: transferred - reported_bytes,
        });
    }

    writer
        .flush()
        .await
        .map_err(|source| PipelineError::Pipe {
            stage: Stage::Encode,
            source,
        })?;
    Ok(transferred)
}

fn check_exit(stage: Stage, status: io::Result<ExitStatus>) -> Result<(), PipelineError> {
    match status {
        Ok(status) if status.success() => Ok(()),
        Ok(status) => Err(PipelineError::Exit { stage, status }),
        Err(source) => Err(PipelineError::Wait { stage, source }),
    }
}

async fn kill_quietly(child: &mut Child, stage: Stage) {
    if let Err(e) = child.kill().await {
        debug!("no se pudo matar la etapa {}: {}", stage, e);
    }
}

/// Ejecuta las etapas decode/encode del codec conectadas por un pipe.
#[derive(Clone)]
pub struct PipelineRunner {
    codec: Arc<dyn Codec>,
    chunk_size: usize,
    report_every: Duration,
}

impl PipelineRunner {
    pub fn new(codec: Arc<dyn Codec>, chunk_size: usize, report_every: Duration) -> Self {
        Self {
            codec,
            chunk_size,
            report_every,
        }
    }

    pub fn codec(&self) -> &dyn Codec {
        self.codec.as_ref()
    }

    fn spawn_decoder(&self, source: &Path) -> Result<Child, PipelineError> {
        let mut cmd = self.codec.decode_command(source);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        cmd.spawn().map_err(|source| PipelineError::Spawn {
            stage: Stage::Decode,
            source,
        })
    }

    fn spawn_encoder(&self, size_hint: u64, target: &Path) -> Result<Child, PipelineError> {
        let mut cmd = self.codec.encode_command(size_hint, target);
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        cmd.spawn().map_err(|source| PipelineError::Spawn {
            stage: Stage::Encode,
            source,
        })
    }

    /// Descomprime `source` descartando la salida y devuelve cuántos bytes
    /// produjo. Un exit != 0 significa que el archivo no es válido.
    pub async fn probe_size(
        &self,
        source: &Path,
        cancel: &CancellationToken,
    ) -> Result<u64, PipelineError> {
        let mut decoder = self.spawn_decoder(source)?;
        let mut stdout = decoder.stdout.take().ok_or(PipelineError::MissingPipe {
            stage: Stage::Decode,
        })?;

        let mut sink = tokio::io::sink();
        let counted = tokio::select! {
            r = copy_with_progress(
                &mut stdout,
                &mut sink,
                self.chunk_size,
                0,
                Duration::MAX,
                |_| {},
            ) => Some(r),
            _ = cancel.cancelled() => None,
        };
        drop(stdout);

        let Some(counted) = counted else {
            kill_quietly(&mut decoder, Stage::Decode).await;
            return Err(PipelineError::Cancelled);
        };

        let status = tokio::select! {
            s = decoder.wait() => s,
            _ = cancel.cancelled() => {
                kill_quietly(&mut decoder, Stage::Decode).await;
                return Err(PipelineError::Cancelled);
            }
        };

        // el exit code manda: si decode falló, el conteo no vale
        check_exit(Stage::Decode, status)?;
        counted
    }

    /// Corre decode(source) | encode(target) copiando por bloques y
    /// reportando progreso. Devuelve los bytes transferidos por el pipe.
    ///
    /// Si cualquiera de las dos etapas falla el archivo `target` no es válido.
    pub async fn recompress<F>(
        &self,
        source: &Path,
        size_hint: u64,
        target: &Path,
        cancel: &CancellationToken,
        on_progress: F,
    ) -> Result<u64, PipelineError>
    where
        F: FnMut(&Progress),
    {
        // encode primero: si decode no arranca, encode muere con kill_on_drop
        let mut encoder = self.spawn_encoder(size_hint, target)?;
        let mut decoder = self.spawn_decoder(source)?;

        let mut stdin = encoder.stdin.take().ok_or(PipelineError::MissingPipe {
            stage: Stage::Encode,
        })?;
        let mut stdout = decoder.stdout.take().ok_or(PipelineError::MissingPipe {
            stage: Stage::Decode,
        })?;

        let pumped = tokio::select! {
            r = copy_with_progress(
                &mut stdout,
                &mut stdin,
                self.chunk_size,
                size_hint,
                self.report_every,
                on_progress,
            ) => Some(r),
            _ = cancel.cancelled() => None,
        };

        // cerrar stdin = fin de datos para encode; soltar stdout hace que
        // decode reciba EPIPE si la copia se cortó antes de tiempo
        drop(stdin);
        drop(stdout);

        let Some(pumped) = pumped else {
            kill_quietly(&mut decoder, Stage::Decode).await;
            kill_quietly(&mut encoder, Stage::Encode).await;
            return Err(PipelineError::Cancelled);
        };

        let (dec_status, enc_status) = tokio::select! {
            r = async { tokio::join!(decoder.wait(), encoder.wait()) } => r,
            _ = cancel.cancelled() => {
                kill_quietly(&mut decoder, Stage::Decode).await;
                kill_quietly(&mut encoder, Stage::Encode).await;
                return Err(PipelineError::Cancelled);
            }
        };

        let mut errors = Vec::new();
        let transferred = match pumped {
            Ok(n) => n,
            Err(e) => {
                warn!("copia interrumpida: {}", e);
                errors.push(e);
                0
            }
        };
        if let Err(e) = check_exit(Stage::Decode, dec_status) {
            errors.push(e);
        }
        if let Err(e) = check_exit(Stage::Encode, enc_status) {
            errors.push(e);
        }

        match PipelineError::from_many(errors) {
            Some(err) => Err(err),
            None => Ok(transferred),
        }
    }
}
