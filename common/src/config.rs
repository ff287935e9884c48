use std::{env, net::SocketAddr, path::PathBuf, str::FromStr, time::Duration};
use thiserror::Error;

use crate::codec::ZstdSettings;

pub const DEFAULT_BIND: &str = "0.0.0.0:8080";
pub const DEFAULT_DATA_DIR: &str = "./www_pub/tasks";
/// 9 GiB: lo que necesita zstd con --long=31 -22 para trabajar tranquilo.
pub const DEFAULT_MIN_AVAILABLE_MEM: u64 = 9 * 1024 * 1024 * 1024;
pub const DEFAULT_GATE_MAX_BACKOFF_MS: u64 = 10_000;
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;
pub const DEFAULT_PROGRESS_SECS: u64 = 1;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("valor inválido para {key}: {value:?} ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Configuración del servicio. Todo sale de variables de entorno con
/// valores por defecto razonables.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind: SocketAddr,
    pub data_dir: PathBuf,
    pub codec: ZstdSettings,
    /// Piso de memoria disponible antes de cada etapa pesada.
    pub min_available_memory: u64,
    pub gate_max_backoff: Duration,
    pub gate_max_wait: Option<Duration>,
    pub max_execution: Option<Duration>,
    /// Tamaño del bloque de copia entre decode y encode.
    pub chunk_size: usize,
    pub progress_interval: Duration,
    pub max_upload_bytes: Option<usize>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 8080)),
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            codec: ZstdSettings::default(),
            min_available_memory: DEFAULT_MIN_AVAILABLE_MEM,
            gate_max_backoff: Duration::from_millis(DEFAULT_GATE_MAX_BACKOFF_MS),
            gate_max_wait: None,
            max_execution: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
            progress_interval: Duration::from_secs(DEFAULT_PROGRESS_SECS),
            max_upload_bytes: None,
        }
    }
}

fn parse_var<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) if raw.trim().is_empty() => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::Invalid {
                key,
                value: raw.clone(),
                reason: e.to_string(),
            }),
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Igual que `from_env` pero con una fuente de variables inyectable.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Config::default();

        let bind = parse_var::<SocketAddr>(&lookup, "REZSTD_BIND")?.unwrap_or(defaults.bind);
        let data_dir = lookup("REZSTD_DATA_DIR")
            .filter(|s| !s.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or(defaults.data_dir);

        let codec = ZstdSettings {
            binary: lookup("REZSTD_CODEC_BIN")
                .filter(|s| !s.trim().is_empty())
                .unwrap_or(defaults.codec.binary),
            level: parse_var(&lookup, "REZSTD_LEVEL")?.unwrap_or(defaults.codec.level),
            window_log: parse_var(&lookup, "REZSTD_WINDOW_LOG")?
                .unwrap_or(defaults.codec.window_log),
            threads: parse_var(&lookup, "REZSTD_THREADS")?.unwrap_or(defaults.codec.threads),
        };
        if !(1..=22).contains(&codec.level) {
            return Err(ConfigError::Invalid {
                key: "REZSTD_LEVEL",
                value: codec.level.to_string(),
                reason: "debe estar entre 1 y 22".to_string(),
            });
        }
        if !(10..=31).contains(&codec.window_log) {
            return Err(ConfigError::Invalid {
                key: "REZSTD_WINDOW_LOG",
                value: codec.window_log.to_string(),
                reason: "debe estar entre 10 y 31".to_string(),
            });
        }

        let chunk_size =
            parse_var::<usize>(&lookup, "REZSTD_CHUNK_SIZE")?.unwrap_or(defaults.chunk_size);
        if chunk_size == 0 {
            return Err(ConfigError::Invalid {
                key: "REZSTD_CHUNK_SIZE",
                value: "0".to_string(),
                reason: "debe ser mayor a 0".to_string(),
            });
        }

        let gate_max_backoff = parse_var::<u64>(&lookup, "REZSTD_GATE_MAX_BACKOFF_MS")?
            .map(Duration::from_millis)
            .unwrap_or(defaults.gate_max_backoff);
        if gate_max_backoff.is_zero() {
            return Err(ConfigError::Invalid {
                key: "REZSTD_GATE_MAX_BACKOFF_MS",
                value: "0".to_string(),
                reason: "debe ser mayor a 0".to_string(),
            });
        }

        Ok(Self {
            bind,
            data_dir,
            codec,
            min_available_memory: parse_var(&lookup, "REZSTD_MIN_AVAILABLE_MEM")?
                .unwrap_or(defaults.min_available_memory),
            gate_max_backoff,
            gate_max_wait: parse_var(&lookup, "REZSTD_GATE_MAX_WAIT_SECS")?
                .map(Duration::from_secs),
            max_execution: parse_var(&lookup, "REZSTD_MAX_EXEC_SECS")?.map(Duration::from_secs),
            chunk_size,
            progress_interval: parse_var(&lookup, "REZSTD_PROGRESS_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.progress_interval),
            max_upload_bytes: parse_var(&lookup, "REZSTD_MAX_UPLOAD_BYTES")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn sin_variables_usa_defaults() {
        let cfg = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(cfg.bind.to_string(), DEFAULT_BIND);
        assert_eq!(cfg.data_dir, PathBuf::from(DEFAULT_DATA_DIR));
        assert_eq!(cfg.codec, ZstdSettings::default());
        assert_eq!(cfg.min_available_memory, DEFAULT_MIN_AVAILABLE_MEM);
        assert_eq!(cfg.gate_max_wait, None);
        assert_eq!(cfg.max_execution, None);
        assert_eq!(cfg.chunk_size, DEFAULT_CHUNK_SIZE);
        assert_eq!(cfg.max_upload_bytes, None);
    }

    #[test]
    fn respeta_variables_definidas() {
        let cfg = Config::from_lookup(lookup(&[
            ("REZSTD_BIND", "127.0.0.1:9000"),
            ("REZSTD_DATA_DIR", "/srv/tasks"),
            ("REZSTD_LEVEL", "19"),
            ("REZSTD_THREADS", "8"),
            ("REZSTD_MIN_AVAILABLE_MEM", "1048576"),
            ("REZSTD_GATE_MAX_WAIT_SECS", "60"),
            ("REZSTD_MAX_EXEC_SECS", "3600"),
            ("REZSTD_CHUNK_SIZE", "1024"),
            ("REZSTD_MAX_UPLOAD_BYTES", "100"),
        ]))
        .unwrap();

        assert_eq!(cfg.bind.port(), 9000);
        assert_eq!(cfg.data_dir, PathBuf::from("/srv/tasks"));
        assert_eq!(cfg.codec.level, 19);
        assert_eq!(cfg.codec.threads, 8);
        assert_eq!(cfg.min_available_memory, 1_048_576);
        assert_eq!(cfg.gate_max_wait, Some(Duration::from_secs(60)));
        assert_eq!(cfg.max_execution, Some(Duration::from_secs(3600)));
        assert_eq!(cfg.chunk_size, 1024);
        assert_eq!(cfg.max_upload_bytes, Some(100));
    }

    #[test]
    fn valores_invalidos_son_error() {
        assert!(Config::from_lookup(lookup(&[("REZSTD_LEVEL", "23")])).is_err());
        assert!(Config::from_lookup(lookup(&[("REZSTD_LEVEL", "alto")])).is_err());
        assert!(Config::from_lookup(lookup(&[("REZSTD_CHUNK_SIZE", "0")])).is_err());
        assert!(Config::from_lookup(lookup(&[("REZSTD_BIND", "no-es-una-direccion")])).is_err());

        let err = Config::from_lookup(lookup(&[("REZSTD_GATE_MAX_BACKOFF_MS", "0")])).unwrap_err();
        assert!(err.to_string().contains("REZSTD_GATE_MAX_BACKOFF_MS"));

        let err = Config::from_lookup(lookup(&[("REZSTD_WINDOW_LOG", "40")])).unwrap_err();
        assert!(err.to_string().contains("REZSTD_WINDOW_LOG"));
    }
}
