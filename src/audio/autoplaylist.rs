use anyhow::Result;
use chrono::Utc;
use rand::seq::SliceRandom;
use std::path::PathBuf;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::storage::atomic_write;

/// Lista de reserva que rellena la cola cuando queda vacía.
///
/// Respaldada por un archivo de texto con una fuente por línea (las líneas
/// vacías y los comentarios `#` se ignoran). El orden de recorrido se fija
/// al cargar: secuencial o mezclado una sola vez, para que una pasada
/// completa sea estable. Al agotar la pasada, el archivo se relee para
/// recoger ediciones externas.
pub struct AutoplaylistManager {
    file: PathBuf,
    audit_file: PathBuf,
    entries: Vec<String>,
    cursor: usize,
    randomize: bool,
    remove_on_error: bool,
}

impl AutoplaylistManager {
    pub async fn load(file: PathBuf, randomize: bool, remove_on_error: bool) -> Result<Self> {
        let audit_file = file.with_extension("removed.log");
        let mut manager = Self {
            file,
            audit_file,
            entries: Vec::new(),
            cursor: 0,
            randomize,
            remove_on_error,
        };
        manager.reload().await;
        info!(
            "📻 Autoplaylist cargada: {} fuentes ({})",
            manager.entries.len(),
            if randomize { "mezclada" } else { "secuencial" }
        );
        Ok(manager)
    }

    /// Siguiente fuente de la lista; None si la lista está vacía
    pub async fn next(&mut self) -> Option<String> {
        if self.cursor >= self.entries.len() {
            // Pasada completa: releer por si el archivo cambió
            self.reload().await;
            if self.entries.is_empty() {
                return None;
            }
        }

        let source = self.entries[self.cursor].clone();
        self.cursor += 1;
        debug!("📻 Autoplaylist suministra: {}", source);
        Some(source)
    }

    /// Registra una fuente no reproducible.
    ///
    /// Siempre escribe un registro de auditoría; además la poda del archivo
    /// de respaldo si `remove_from_ap_on_error` está activo.
    pub async fn report_unplayable(&mut self, source: &str, reason: &str) -> Result<()> {
        self.audit(source, reason).await?;

        if !self.remove_on_error {
            return Ok(());
        }

        if let Some(index) = self.entries.iter().position(|e| e == source) {
            self.entries.remove(index);
            if index < self.cursor {
                self.cursor -= 1;
            }
        }

        // Reescribir el archivo conservando comentarios y líneas ajenas
        match fs::read_to_string(&self.file).await {
            Ok(raw) => {
                let kept: String = raw
                    .lines()
                    .filter(|line| line.trim() != source)
                    .map(|line| format!("{line}\n"))
                    .collect();
                let path = self.file.clone();
                tokio::task::spawn_blocking(move || atomic_write(&path, kept.as_bytes()))
                    .await??;
                info!("✂️ Fuente podada de la autoplaylist: {}", source);
            }
            Err(e) => warn!("No se pudo reescribir la autoplaylist: {}", e),
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    // Métodos privados

    async fn reload(&mut self) {
        let raw = match fs::read_to_string(&self.file).await {
            Ok(raw) => raw,
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("No se pudo leer la autoplaylist: {}", e);
                }
                self.entries.clear();
                self.cursor = 0;
                return;
            }
        };

        self.entries = raw
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(str::to_string)
            .collect();

        if self.randomize {
            self.entries.shuffle(&mut rand::thread_rng());
        }
        self.cursor = 0;
    }

    async fn audit(&self, source: &str, reason: &str) -> Result<()> {
        let line = format!("{}\t{}\t{}\n", Utc::now().to_rfc3339(), source, reason);
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.audit_file)
            .await?;
        file.write_all(line.as_bytes()).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    async fn write_list(lines: &[&str]) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("autoplaylist.txt");
        fs::write(&path, lines.join("\n")).await.unwrap();
        (dir, path)
    }

    #[tokio::test]
    async fn test_sequential_traversal_is_stable() {
        let (_dir, path) = write_list(&["uno", "dos", "# comentario", "", "tres"]).await;
        let mut ap = AutoplaylistManager::load(path, false, false).await.unwrap();

        assert_eq!(ap.next().await.unwrap(), "uno");
        assert_eq!(ap.next().await.unwrap(), "dos");
        assert_eq!(ap.next().await.unwrap(), "tres");
        // Segunda pasada tras agotar la primera
        assert_eq!(ap.next().await.unwrap(), "uno");
    }

    #[tokio::test]
    async fn test_shuffled_order_fixed_for_one_pass() {
        let sources: Vec<String> = (0..50).map(|i| format!("src-{i}")).collect();
        let refs: Vec<&str> = sources.iter().map(String::as_str).collect();
        let (_dir, path) = write_list(&refs).await;
        let mut ap = AutoplaylistManager::load(path, true, false).await.unwrap();

        let mut pass: Vec<String> = Vec::new();
        for _ in 0..50 {
            pass.push(ap.next().await.unwrap());
        }
        let mut sorted = pass.clone();
        sorted.sort();
        let mut expected = sources.clone();
        expected.sort();
        // Una pasada completa cubre cada fuente exactamente una vez
        assert_eq!(sorted, expected);
    }

    #[tokio::test]
    async fn test_empty_list_yields_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("inexistente.txt");
        let mut ap = AutoplaylistManager::load(path, false, false).await.unwrap();
        assert!(ap.next().await.is_none());
        assert!(ap.is_empty());
    }

    #[tokio::test]
    async fn test_report_unplayable_prunes_and_audits() {
        let (_dir, path) = write_list(&["# lista", "mala", "buena"]).await;
        let mut ap = AutoplaylistManager::load(path.clone(), false, true)
            .await
            .unwrap();

        ap.report_unplayable("mala", "no reproducible").await.unwrap();

        assert_eq!(ap.len(), 1);
        let rewritten = fs::read_to_string(&path).await.unwrap();
        assert!(rewritten.contains("# lista"), "los comentarios se conservan");
        assert!(!rewritten.contains("mala"));

        let audit = fs::read_to_string(path.with_extension("removed.log"))
            .await
            .unwrap();
        assert!(audit.contains("mala"));
        assert!(audit.contains("no reproducible"));
    }

    #[tokio::test]
    async fn test_report_without_removal_keeps_file() {
        let (_dir, path) = write_list(&["mala", "buena"]).await;
        let mut ap = AutoplaylistManager::load(path.clone(), false, false)
            .await
            .unwrap();

        ap.report_unplayable("mala", "bloqueada").await.unwrap();

        assert_eq!(ap.len(), 2);
        let raw = fs::read_to_string(&path).await.unwrap();
        assert!(raw.contains("mala"));
    }
}
