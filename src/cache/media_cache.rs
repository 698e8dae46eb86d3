use bytes::Bytes;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::fs;
use tracing::{debug, info, warn};

use crate::error::EngineError;
use crate::storage::atomic_write;

const INDEX_FILE: &str = "index.json";

/// Metadata de una entrada de caché
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntryMeta {
    pub key: String,
    pub path: PathBuf,
    pub size: u64,
    pub created: DateTime<Utc>,
    pub last_access: DateTime<Utc>,
    /// Exenta de evicción (medios de autoplaylist, si está configurado)
    pub retain: bool,
}

/// Contadores de uso del caché
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl CacheStats {
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }
    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }
}

/// Caché de audio descargado, direccionado por clave normalizada
pub struct MediaCache {
    dir: PathBuf,
    index: DashMap<String, CacheEntryMeta>,
    limit_bytes: u64,
    limit_days: u32,
    stats: CacheStats,
}

impl MediaCache {
    /// Abre el caché, recargando el índice persistido si existe.
    ///
    /// Las entradas cuyo archivo ya no está en disco se descartan del
    /// índice al cargar.
    pub async fn open(dir: PathBuf, limit_bytes: u64, limit_days: u32) -> anyhow::Result<Self> {
        fs::create_dir_all(&dir).await?;

        let index = DashMap::new();
        let index_path = dir.join(INDEX_FILE);
        if index_path.exists() {
            match fs::read_to_string(&index_path).await {
                Ok(raw) => match serde_json::from_str::<HashMap<String, CacheEntryMeta>>(&raw) {
                    Ok(entries) => {
                        let mut dropped = 0usize;
                        for (key, meta) in entries {
                            if meta.path.exists() {
                                index.insert(key, meta);
                            } else {
                                dropped += 1;
                            }
                        }
                        if dropped > 0 {
                            warn!("🗑️ {} entradas de caché sin archivo descartadas", dropped);
                        }
                    }
                    Err(e) => warn!("Índice de caché corrupto, empezando vacío: {}", e),
                },
                Err(e) => warn!("No se pudo leer el índice de caché: {}", e),
            }
        }

        info!(
            "🗄️ Caché de medios abierto en {} ({} entradas)",
            dir.display(),
            index.len()
        );

        Ok(Self {
            dir,
            index,
            limit_bytes,
            limit_days,
            stats: CacheStats::default(),
        })
    }

    /// Almacena los bytes de un medio y devuelve su entrada.
    ///
    /// Aplica la política de evicción tras insertar, por si el total
    /// supera el límite configurado.
    pub async fn put(
        &self,
        key: &str,
        bytes: &Bytes,
        retain: bool,
    ) -> Result<CacheEntryMeta, EngineError> {
        let path = self.file_path(key);
        fs::write(&path, bytes).await?;

        let now = Utc::now();
        let meta = CacheEntryMeta {
            key: key.to_string(),
            path,
            size: bytes.len() as u64,
            created: now,
            last_access: now,
            retain,
        };
        self.index.insert(key.to_string(), meta.clone());
        debug!("💾 Cacheado {} ({} bytes, retain={})", key, meta.size, retain);

        self.evict().await;
        self.save_index().await?;
        Ok(meta)
    }

    /// Busca una entrada, actualizando su último acceso
    pub fn get(&self, key: &str) -> Option<CacheEntryMeta> {
        match self.index.get_mut(key) {
            Some(mut entry) => {
                entry.last_access = Utc::now();
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.clone())
            }
            None => {
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Actualiza el último acceso sin leer la entrada
    pub fn touch(&self, key: &str) {
        if let Some(mut entry) = self.index.get_mut(key) {
            entry.last_access = Utc::now();
        }
    }

    /// Lee los bytes cacheados de una clave.
    ///
    /// Si el archivo desapareció por debajo del índice, la entrada se
    /// descarta y se devuelve miss.
    pub async fn read(&self, key: &str) -> Option<Bytes> {
        let meta = self.get(key)?;
        match fs::read(&meta.path).await {
            Ok(raw) => Some(Bytes::from(raw)),
            Err(e) => {
                warn!("Archivo de caché ilegible para {}: {}", key, e);
                self.index.remove(key);
                None
            }
        }
    }

    /// Aplica la política de evicción y devuelve cuántas entradas salieron
    pub async fn evict(&self) -> usize {
        let mut evicted = 0usize;
        let now = Utc::now();

        // Por edad: toda entrada no retenida más vieja que el límite sale,
        // haya o no presión de tamaño
        if self.limit_days > 0 {
            let cutoff = now - ChronoDuration::days(i64::from(self.limit_days));
            let expired: Vec<CacheEntryMeta> = self
                .index
                .iter()
                .filter(|e| !e.retain && e.created < cutoff)
                .map(|e| e.clone())
                .collect();

            for meta in expired {
                if self.delete_entry(&meta).await {
                    evicted += 1;
                }
            }
        }

        // Por tamaño: LRU estricto entre las no retenidas hasta satisfacer
        // el límite
        if self.limit_bytes > 0 {
            let mut candidates: Vec<CacheEntryMeta> = self
                .index
                .iter()
                .filter(|e| !e.retain)
                .map(|e| e.clone())
                .collect();
            candidates.sort_by_key(|e| e.last_access);

            let mut total: u64 = candidates.iter().map(|e| e.size).sum();
            for meta in candidates {
                if total <= self.limit_bytes {
                    break;
                }
                if self.delete_entry(&meta).await {
                    evicted += 1;
                    total -= meta.size;
                }
            }
        }

        if evicted > 0 {
            self.stats
                .evictions
                .fetch_add(evicted as u64, Ordering::Relaxed);
            info!("🧹 Evicción de caché: {} entradas eliminadas", evicted);
            if let Err(e) = self.save_index().await {
                warn!("No se pudo persistir el índice tras evicción: {}", e);
            }
        }
        evicted
    }

    /// Elimina una entrada explícitamente
    pub async fn remove(&self, key: &str) -> bool {
        let meta = match self.index.get(key) {
            Some(entry) => entry.clone(),
            None => return false,
        };
        let removed = self.delete_entry(&meta).await;
        if removed {
            if let Err(e) = self.save_index().await {
                warn!("No se pudo persistir el índice tras remove: {}", e);
            }
        }
        removed
    }

    /// Vacía todas las entradas no retenidas
    pub async fn clear(&self) -> usize {
        let all: Vec<CacheEntryMeta> = self
            .index
            .iter()
            .filter(|e| !e.retain)
            .map(|e| e.clone())
            .collect();

        let mut removed = 0usize;
        for meta in all {
            if self.delete_entry(&meta).await {
                removed += 1;
            }
        }
        if let Err(e) = self.save_index().await {
            warn!("No se pudo persistir el índice tras clear: {}", e);
        }
        info!("🗑️ Caché limpiado: {} entradas", removed);
        removed
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Tamaño total de las entradas no retenidas
    pub fn unretained_size(&self) -> u64 {
        self.index
            .iter()
            .filter(|e| !e.retain)
            .map(|e| e.size)
            .sum()
    }

    // Métodos privados

    /// Borra el archivo y la entrada del índice.
    ///
    /// Si el borrado del archivo falla, la entrada se conserva para
    /// reintentarla en la próxima pasada de evicción.
    async fn delete_entry(&self, meta: &CacheEntryMeta) -> bool {
        match fs::remove_file(&meta.path).await {
            Ok(()) => {
                self.index.remove(&meta.key);
                debug!("🗑️ Entrada de caché eliminada: {}", meta.key);
                true
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.index.remove(&meta.key);
                true
            }
            Err(e) => {
                warn!(
                    "No se pudo borrar {} (se reintentará): {}",
                    meta.path.display(),
                    e
                );
                false
            }
        }
    }

    fn file_path(&self, key: &str) -> PathBuf {
        let digest = blake3::hash(key.as_bytes());
        self.dir.join(format!("{}.bin", digest.to_hex()))
    }

    async fn save_index(&self) -> Result<(), EngineError> {
        let snapshot: HashMap<String, CacheEntryMeta> = self
            .index
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        let raw = serde_json::to_vec_pretty(&snapshot)
            .map_err(|e| std::io::Error::other(format!("índice de caché no serializable: {e}")))?;
        let path = self.dir.join(INDEX_FILE);
        tokio::task::spawn_blocking(move || atomic_write(&path, &raw))
            .await
            .map_err(|e| std::io::Error::other(format!("tarea de índice cancelada: {e}")))??;
        Ok(())
    }
}

impl std::fmt::Debug for MediaCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaCache")
            .field("dir", &self.dir)
            .field("entries", &self.index.len())
            .field("limit_bytes", &self.limit_bytes)
            .field("limit_days", &self.limit_days)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn cache_with_limit(limit_bytes: u64) -> (tempfile::TempDir, MediaCache) {
        let dir = tempfile::tempdir().unwrap();
        let cache = MediaCache::open(dir.path().to_path_buf(), limit_bytes, 0)
            .await
            .unwrap();
        (dir, cache)
    }

    #[tokio::test]
    async fn test_put_get_roundtrip() {
        let (_dir, cache) = cache_with_limit(0).await;
        let bytes = Bytes::from_static(b"pcm-audio-data");
        cache.put("song-a", &bytes, false).await.unwrap();

        let meta = cache.get("song-a").expect("entrada presente");
        assert_eq!(meta.size, bytes.len() as u64);
        assert_eq!(cache.read("song-a").await.unwrap(), bytes);
        assert_eq!(cache.stats().hits(), 2);
    }

    #[tokio::test]
    async fn test_miss_counts() {
        let (_dir, cache) = cache_with_limit(0).await;
        assert!(cache.get("nunca-visto").is_none());
        assert_eq!(cache.stats().misses(), 1);
    }

    #[tokio::test]
    async fn test_lru_eviction_respects_size_limit() {
        let (_dir, cache) = cache_with_limit(25).await;
        let chunk = Bytes::from(vec![0u8; 10]);

        cache.put("uno", &chunk, false).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        cache.put("dos", &chunk, false).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        // Tocar "uno" para que "dos" sea el LRU
        cache.touch("uno");
        cache.put("tres", &chunk, false).await.unwrap();

        assert!(cache.unretained_size() <= 25);
        assert!(cache.get("dos").is_none(), "el LRU debe salir primero");
        assert!(cache.get("uno").is_some());
        assert!(cache.get("tres").is_some());
    }

    #[tokio::test]
    async fn test_retained_entries_never_evicted() {
        let (_dir, cache) = cache_with_limit(15).await;
        let chunk = Bytes::from(vec![0u8; 10]);

        cache.put("autoplay", &chunk, true).await.unwrap();
        cache.put("usuario-1", &chunk, false).await.unwrap();
        cache.put("usuario-2", &chunk, false).await.unwrap();
        cache.evict().await;

        assert!(cache.get("autoplay").is_some(), "retain nunca se evicta");
        assert!(cache.unretained_size() <= 15);
    }

    #[tokio::test]
    async fn test_zero_limit_disables_eviction() {
        let (_dir, cache) = cache_with_limit(0).await;
        let chunk = Bytes::from(vec![0u8; 1024]);
        for i in 0..5 {
            cache.put(&format!("clave-{i}"), &chunk, false).await.unwrap();
        }
        assert_eq!(cache.evict().await, 0);
        assert_eq!(cache.len(), 5);
    }

    #[tokio::test]
    async fn test_age_eviction_removes_expired_entries() {
        let dir = tempfile::tempdir().unwrap();
        let chunk = Bytes::from_static(b"pcm");
        {
            let cache = MediaCache::open(dir.path().to_path_buf(), 0, 7)
                .await
                .unwrap();
            cache.put("caducada", &chunk, false).await.unwrap();
            cache.put("caducada-retenida", &chunk, true).await.unwrap();
            cache.put("fresca", &chunk, false).await.unwrap();
        }

        // Envejecer dos entradas reescribiendo el índice persistido
        let index_path = dir.path().join(INDEX_FILE);
        let raw = std::fs::read_to_string(&index_path).unwrap();
        let mut entries: HashMap<String, CacheEntryMeta> = serde_json::from_str(&raw).unwrap();
        for key in ["caducada", "caducada-retenida"] {
            entries.get_mut(key).unwrap().created = Utc::now() - ChronoDuration::days(10);
        }
        std::fs::write(&index_path, serde_json::to_string(&entries).unwrap()).unwrap();

        let cache = MediaCache::open(dir.path().to_path_buf(), 0, 7)
            .await
            .unwrap();
        assert_eq!(cache.evict().await, 1);
        assert!(cache.get("caducada").is_none(), "la caducada debe salir");
        assert!(
            cache.get("caducada-retenida").is_some(),
            "retain ignora la edad"
        );
        assert!(cache.get("fresca").is_some());
    }

    #[tokio::test]
    async fn test_index_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let bytes = Bytes::from_static(b"persistente");
        {
            let cache = MediaCache::open(dir.path().to_path_buf(), 0, 0)
                .await
                .unwrap();
            cache.put("persistida", &bytes, true).await.unwrap();
        }

        let reopened = MediaCache::open(dir.path().to_path_buf(), 0, 0)
            .await
            .unwrap();
        let meta = reopened.get("persistida").expect("índice recargado");
        assert!(meta.retain);
        assert_eq!(reopened.read("persistida").await.unwrap(), bytes);
    }

    #[tokio::test]
    async fn test_clear_keeps_retained() {
        let (_dir, cache) = cache_with_limit(0).await;
        let chunk = Bytes::from_static(b"x");
        cache.put("retenida", &chunk, true).await.unwrap();
        cache.put("normal", &chunk, false).await.unwrap();

        assert_eq!(cache.clear().await, 1);
        assert!(cache.get("retenida").is_some());
        assert!(cache.get("normal").is_none());
    }
}
