use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info, warn};

use crate::{GuildId, UserId};

/// Entrada serializada de un snapshot de cola
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PersistedEntry {
    pub source: String,
    pub title: String,
    pub requester: UserId,
    pub duration_secs: Option<u64>,
    pub offset_secs: f64,
    pub from_autoplaylist: bool,
    pub queued_at: DateTime<Utc>,
}

/// Snapshot persistido de la cola de un guild.
///
/// Contiene la secuencia ordenada y, aparte, la entrada en reproducción con
/// su último offset conocido. Con esto la cola se reconstruye tras un
/// reinicio y la reproducción se reanuda donde quedó.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct QueueSnapshot {
    pub entries: Vec<PersistedEntry>,
    pub now_playing: Option<PersistedEntry>,
}

/// Almacenamiento de snapshots de cola, un archivo JSON por guild
pub struct QueueStore {
    dir: PathBuf,
}

impl QueueStore {
    pub fn new(data_dir: &Path) -> Result<Self> {
        let dir = data_dir.join("queues");
        std::fs::create_dir_all(&dir)?;
        info!("📁 Almacén de colas inicializado en {}", dir.display());
        Ok(Self { dir })
    }

    /// Guarda el snapshot de un guild con reemplazo atómico.
    ///
    /// Un crash a mitad de escritura nunca corrompe un snapshot válido
    /// anterior: se escribe a un archivo temporal y se renombra encima.
    pub async fn save(&self, guild_id: GuildId, snapshot: &QueueSnapshot) -> Result<()> {
        let raw = serde_json::to_vec_pretty(snapshot)?;
        let path = self.queue_file_path(guild_id);
        tokio::task::spawn_blocking(move || atomic_write(&path, &raw)).await??;
        debug!(
            "💾 Snapshot guardado para guild {} ({} entradas)",
            guild_id,
            snapshot.entries.len()
        );
        Ok(())
    }

    /// Carga el snapshot de un guild; None si no existe o está corrupto
    pub async fn load(&self, guild_id: GuildId) -> Option<QueueSnapshot> {
        let path = self.queue_file_path(guild_id);
        let raw = match fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!("No se pudo leer el snapshot de guild {}: {}", guild_id, e);
                return None;
            }
        };

        match serde_json::from_str(&raw) {
            Ok(snapshot) => {
                info!("📂 Snapshot restaurado para guild {}", guild_id);
                Some(snapshot)
            }
            Err(e) => {
                warn!(
                    "Snapshot corrupto para guild {} (se ignora): {}",
                    guild_id, e
                );
                None
            }
        }
    }

    /// Elimina el snapshot de un guild
    pub async fn delete(&self, guild_id: GuildId) {
        let path = self.queue_file_path(guild_id);
        if let Err(e) = fs::remove_file(&path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("No se pudo borrar el snapshot de guild {}: {}", guild_id, e);
            }
        }
    }

    fn queue_file_path(&self, guild_id: GuildId) -> PathBuf {
        self.dir.join(format!("guild_{}.json", guild_id.0))
    }
}

/// Escritura con reemplazo atómico: temporal en el mismo directorio y rename
pub(crate) fn atomic_write(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    tmp.write_all(data)?;
    tmp.flush()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}
