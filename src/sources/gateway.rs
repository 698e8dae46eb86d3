use bytes::Bytes;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::ExtractError;
use crate::sources::{normalize_source, MediaExtractor, StreamDescriptor};

/// Resultado compartido de una resolución en vuelo
type SharedResolve = Shared<BoxFuture<'static, Result<StreamDescriptor, ExtractError>>>;

/// Retraso máximo entre reintentos de extracción
const MAX_RETRY_DELAY: Duration = Duration::from_secs(10);

/// Gateway hacia el backend de extracción.
///
/// Añade al backend tres comportamientos: lista de bloqueo por política,
/// reintentos acotados con backoff exponencial para fallos transitorios, y
/// deduplicación single-flight global por clave normalizada. Cuando varios
/// guilds piden la misma fuente a la vez, solo existe una resolución en
/// vuelo y todos los llamantes reciben el mismo resultado.
pub struct ExtractorGateway {
    backend: Arc<dyn MediaExtractor>,
    in_flight: DashMap<String, SharedResolve>,
    blocked_sources: Vec<String>,
    retry_attempts: u32,
    base_delay: Duration,
}

impl ExtractorGateway {
    pub fn new(
        backend: Arc<dyn MediaExtractor>,
        blocked_sources: Vec<String>,
        retry_attempts: u32,
    ) -> Self {
        Self {
            backend,
            in_flight: DashMap::new(),
            blocked_sources,
            retry_attempts: retry_attempts.max(1),
            base_delay: Duration::from_millis(500),
        }
    }

    #[cfg(test)]
    fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    /// Resuelve una fuente a su descriptor de stream.
    ///
    /// Las llamadas concurrentes con la misma clave normalizada se acoplan a
    /// una única resolución subyacente. Cancelar a un llamante solo lo
    /// desengancha del futuro compartido; la resolución sigue disponible
    /// para el resto de los que esperan.
    pub async fn resolve(&self, source: &str) -> Result<StreamDescriptor, ExtractError> {
        let key = normalize_source(source);

        if let Some(blocked) = self
            .blocked_sources
            .iter()
            .find(|b| key.to_lowercase().contains(b.as_str()))
        {
            info!("🚫 Fuente bloqueada por política ({}): {}", blocked, key);
            return Err(ExtractError::Blocked(key));
        }

        let shared = match self.in_flight.entry(key.clone()) {
            dashmap::mapref::entry::Entry::Occupied(existing) => {
                debug!("🔗 Resolución ya en vuelo para {}, acoplando", key);
                existing.get().clone()
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                let backend = Arc::clone(&self.backend);
                let original = source.to_string();
                let attempts = self.retry_attempts;
                let base_delay = self.base_delay;

                let fut = async move {
                    resolve_with_retry(backend, original, attempts, base_delay).await
                }
                .boxed()
                .shared();

                slot.insert(fut.clone());
                fut
            }
        };

        let result = shared.await;
        // El futuro ya terminó; todos los acoplados tienen su clon
        self.in_flight.remove(&key);
        result
    }

    /// Descarga los bytes del medio, con los mismos reintentos transitorios
    pub async fn fetch_media(
        &self,
        descriptor: &StreamDescriptor,
    ) -> Result<Bytes, ExtractError> {
        let mut attempt = 0u32;
        loop {
            match self.backend.download(descriptor).await {
                Ok(bytes) => return Ok(bytes),
                Err(err) if err.is_permanent() => return Err(err),
                Err(err) => {
                    attempt += 1;
                    if attempt >= self.retry_attempts {
                        return Err(err);
                    }
                    let delay = backoff_delay(self.base_delay, attempt);
                    warn!(
                        "⚠️ Descarga falló ({}), reintento {}/{} en {}",
                        err,
                        attempt,
                        self.retry_attempts,
                        humantime::format_duration(delay)
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

async fn resolve_with_retry(
    backend: Arc<dyn MediaExtractor>,
    source: String,
    attempts: u32,
    base_delay: Duration,
) -> Result<StreamDescriptor, ExtractError> {
    let mut attempt = 0u32;
    loop {
        match backend.resolve(&source).await {
            Ok(descriptor) => {
                debug!("✅ Fuente resuelta: {} -> {}", source, descriptor.title);
                return Ok(descriptor);
            }
            Err(err) if err.is_permanent() => return Err(err),
            Err(err) => {
                attempt += 1;
                if attempt >= attempts {
                    warn!("❌ Extracción agotó {} reintentos: {}", attempts, err);
                    return Err(err);
                }
                let delay = backoff_delay(base_delay, attempt);
                warn!(
                    "⚠️ Extracción falló ({}), reintento {}/{} en {}",
                    err,
                    attempt,
                    attempts,
                    humantime::format_duration(delay)
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
        .min(MAX_RETRY_DELAY)
}
