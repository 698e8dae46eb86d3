pub mod gateway;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

pub use gateway::ExtractorGateway;

use crate::error::ExtractError;

/// Descriptor de stream resuelto por el backend de extracción
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamDescriptor {
    /// URL directa del stream de audio
    pub stream_url: String,
    /// Título resuelto
    pub title: String,
    /// Duración si se conoce (los streams en vivo no la tienen)
    pub duration: Option<Duration>,
    /// Si la fuente es una transmisión en vivo
    pub is_live: bool,
}

/// Backend de extracción de medios (colaborador externo).
///
/// Resuelve una URL o consulta de búsqueda a un stream reproducible y
/// descarga sus bytes. El gateway le añade deduplicación y reintentos;
/// nadie más debe llamarlo directamente.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MediaExtractor: Send + Sync {
    /// Resuelve metadata y URL de stream para una fuente
    async fn resolve(&self, source: &str) -> Result<StreamDescriptor, ExtractError>;

    /// Descarga el audio completo del descriptor
    async fn download(&self, descriptor: &StreamDescriptor) -> Result<Bytes, ExtractError>;
}

/// Normaliza una fuente a su clave canónica.
///
/// Dos fuentes que apuntan al mismo medio deben producir la misma clave:
/// el single-flight del gateway y el caché en disco indexan por ella.
/// Para URLs se elimina el fragmento y los parámetros de tracking; las
/// consultas de búsqueda se colapsan a minúsculas.
pub fn normalize_source(source: &str) -> String {
    let trimmed = source.trim();

    if let Ok(mut parsed) = Url::parse(trimmed) {
        parsed.set_fragment(None);

        let kept: Vec<(String, String)> = parsed
            .query_pairs()
            .filter(|(k, _)| !is_tracking_param(k))
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();

        if kept.is_empty() {
            parsed.set_query(None);
        } else {
            let mut pairs = parsed.query_pairs_mut();
            pairs.clear();
            for (k, v) in &kept {
                pairs.append_pair(k, v);
            }
        }

        parsed.to_string()
    } else {
        // Consulta de búsqueda: minúsculas y espacios colapsados
        let collapsed = trimmed.split_whitespace().collect::<Vec<_>>().join(" ");
        format!("search:{}", collapsed.to_lowercase())
    }
}

fn is_tracking_param(key: &str) -> bool {
    key.starts_with("utm_") || matches!(key, "feature" | "si" | "fbclid" | "ref")
}
