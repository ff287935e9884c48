use rand::Rng;
use std::{
    io,
    sync::{Arc, Mutex},
    time::Duration,
};
use sysinfo::{System, SystemExt};
use thiserror::Error;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const MIB: u64 = 1024 * 1024;
/// Piso del backoff: evita girar en vacío cuando el sorteo da 0.
const MIN_BACKOFF: Duration = Duration::from_millis(100);

/// Fuente de "memoria disponible" del sistema.
pub trait MemorySampler: Send + Sync {
    fn available_bytes(&self) -> io::Result<u64>;
}

/// Lee `MemAvailable` a través de sysinfo.
pub struct SystemMemory {
    sys: Mutex<System>,
}

impl SystemMemory {
    pub fn new() -> Self {
        Self {
            sys: Mutex::new(System::new()),
        }
    }
}

impl Default for SystemMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySampler for SystemMemory {
    fn available_bytes(&self) -> io::Result<u64> {
        let mut sys = self
            .sys
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "lock de sysinfo envenenado"))?;
        sys.refresh_memory();

        // sysinfo devuelve 0 en todo cuando no pudo leer /proc/meminfo
        if sys.total_memory() == 0 {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                "no se pudo leer la memoria del sistema",
            ));
        }
        Ok(sys.available_memory())
    }
}

#[derive(Debug, Error)]
pub enum GateError {
    #[error("admisión cancelada")]
    Cancelled,
    #[error("se esperó {waited:?} sin llegar a {floor} bytes libres")]
    TimedOut { waited: Duration, floor: u64 },
}

/// Resultado de una admisión exitosa.
#[derive(Debug, Clone, Copy)]
pub struct Admission {
    pub available: u64,
    pub samples: u32,
    pub waited: Duration,
}

/// Compuerta de memoria: bloquea hasta que haya al menos `floor` bytes
/// disponibles. No reserva nada, sólo retrasa el arranque.
#[derive(Clone)]
pub struct AdmissionGate {
    sampler: Arc<dyn MemorySampler>,
    max_backoff: Duration,
    max_wait: Option<Duration>,
}

impl AdmissionGate {
    pub fn new(sampler: Arc<dyn MemorySampler>, max_backoff: Duration) -> Self {
        Self {
            sampler,
            max_backoff,
            max_wait: None,
        }
    }

    /// Límite opcional de espera. Sin límite la espera es indefinida.
    pub fn with_max_wait(mut self, max_wait: Option<Duration>) -> Self {
        self.max_wait = max_wait;
        self
    }

    pub async fn wait(
        &self,
        floor: u64,
        cancel: &CancellationToken,
    ) -> Result<Admission, GateError> {
        let started = Instant::now();
        let mut samples: u32 = 0;

        loop {
            samples += 1;
            match self.sampler.available_bytes() {
                Ok(available) if available >= floor => {
                    debug!(
                        "admitido con {} MiB disponibles tras {} muestras",
                        available / MIB,
                        samples
                    );
                    return Ok(Admission {
                        available,
                        samples,
                        waited: started.elapsed(),
                    });
                }
                Ok(available) => info!(
                    "{} MiB disponibles, se necesitan al menos {} MiB, esperando...",
                    available / MIB,
                    floor / MIB
                ),
                Err(e) => warn!("no se pudo muestrear la memoria ({}), reintentando", e),
            }

            if let Some(max) = self.max_wait {
                let waited = started.elapsed();
                if waited >= max {
                    return Err(GateError::TimedOut { waited, floor });
                }
            }

            let backoff = self.backoff();
            tokio::select! {
                _ = cancel.cancelled() => return Err(GateError::Cancelled),
                _ = sleep(backoff) => {}
            }
        }
    }

    fn backoff(&self) -> Duration {
        let max_ms = self.max_backoff.as_millis() as u64;
        let min_ms = (MIN_BACKOFF.as_millis() as u64).min(max_ms);
        Duration::from_millis(rand::rng().random_range(min_ms..=max_ms))
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Sampler con lecturas guionadas. Al agotarse repite la última.
    pub struct ScriptedMemory {
        readings: Mutex<VecDeque<io::Result<u64>>>,
        last: Mutex<u64>,
        pub calls: AtomicU32,
    }

    impl ScriptedMemory {
        pub fn new(readings: Vec<io::Result<u64>>) -> Self {
            Self {
                readings: Mutex::new(readings.into()),
                last: Mutex::new(0),
                calls: AtomicU32::new(0),
            }
        }

        pub fn plenty() -> Self {
            Self::new(vec![Ok(u64::MAX)])
        }
    }

    impl MemorySampler for ScriptedMemory {
        fn available_bytes(&self) -> io::Result<u64> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut readings = self.readings.lock().unwrap();
            let mut last = self.last.lock().unwrap();
            match readings.pop_front() {
                Some(Ok(v)) => {
                    *last = v;
                    Ok(v)
                }
                Some(Err(e)) => Err(e),
                None => Ok(*last),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::ScriptedMemory;
    use super::*;
    use std::sync::atomic::Ordering;

    const GIB: u64 = 1024 * MIB;

    fn gate(sampler: Arc<ScriptedMemory>) -> AdmissionGate {
        AdmissionGate::new(sampler, Duration::from_millis(1))
    }

    #[tokio::test]
    async fn admite_de_inmediato_si_hay_memoria() {
        let sampler = Arc::new(ScriptedMemory::new(vec![Ok(10 * GIB)]));
        let adm = gate(sampler.clone())
            .wait(9 * GIB, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(adm.samples, 1);
        assert_eq!(adm.available, 10 * GIB);
        assert_eq!(sampler.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn espera_mientras_la_memoria_esta_bajo_el_piso() {
        let sampler = Arc::new(ScriptedMemory::new(vec![
            Ok(GIB),
            Ok(2 * GIB),
            Ok(9 * GIB - 1),
            Ok(9 * GIB),
        ]));
        let adm = gate(sampler.clone())
            .wait(9 * GIB, &CancellationToken::new())
            .await
            .unwrap();

        // nunca admite con una lectura bajo el piso
        assert_eq!(adm.samples, 4);
        assert_eq!(adm.available, 9 * GIB);
    }

    #[tokio::test]
    async fn tolera_errores_de_lectura() {
        let sampler = Arc::new(ScriptedMemory::new(vec![
            Err(io::Error::new(io::ErrorKind::Other, "meminfo")),
            Err(io::Error::new(io::ErrorKind::Other, "meminfo")),
            Ok(u64::MAX),
        ]));
        let adm = gate(sampler).wait(1, &CancellationToken::new()).await.unwrap();
        assert_eq!(adm.samples, 3);
    }

    #[tokio::test]
    async fn cancelacion_corta_la_espera() {
        let sampler = Arc::new(ScriptedMemory::new(vec![Ok(0)]));
        let gate = AdmissionGate::new(sampler, Duration::from_secs(60));
        let cancel = CancellationToken::new();
        let c = cancel.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(20)).await;
            c.cancel();
        });

        let res = gate.wait(GIB, &cancel).await;
        assert!(matches!(res, Err(GateError::Cancelled)));
    }

    #[tokio::test]
    async fn max_wait_corta_con_timed_out() {
        let sampler = Arc::new(ScriptedMemory::new(vec![Ok(0)]));
        let gate = gate(sampler).with_max_wait(Some(Duration::from_millis(30)));

        let res = gate.wait(GIB, &CancellationToken::new()).await;
        assert!(matches!(res, Err(GateError::TimedOut { floor, .. }) if floor == GIB));
    }

    #[test]
    fn backoff_queda_dentro_del_rango() {
        let g = AdmissionGate::new(
            Arc::new(ScriptedMemory::plenty()),
            Duration::from_secs(10),
        );
        for _ in 0..200 {
            let b = g.backoff();
            assert!(b >= MIN_BACKOFF && b <= Duration::from_secs(10));
        }
    }
}
