use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;
use tracing::{debug, info};

use crate::error::EngineError;
use crate::sources::StreamDescriptor;
use crate::storage::{PersistedEntry, QueueSnapshot};
use crate::UserId;

/// Una unidad encolada o en reproducción
#[derive(Debug, Clone)]
pub struct Entry {
    /// URL o consulta de búsqueda tal como la pidió el usuario
    pub source: String,
    /// Descriptor resuelto; se rellena perezosamente tras la extracción
    pub descriptor: Option<StreamDescriptor>,
    pub title: String,
    pub duration: Option<Duration>,
    pub requested_by: UserId,
    pub queued_at: DateTime<Utc>,
    /// Último offset de reproducción conocido, en segundos
    pub offset_secs: f64,
    pub from_autoplaylist: bool,
}

impl Entry {
    pub fn new(source: impl Into<String>, requested_by: UserId) -> Self {
        let source = source.into();
        Self {
            title: source.clone(),
            source,
            descriptor: None,
            duration: None,
            requested_by,
            queued_at: Utc::now(),
            offset_secs: 0.0,
            from_autoplaylist: false,
        }
    }

    /// Entrada suministrada por la autoplaylist (sin solicitante humano)
    pub fn from_autoplaylist(source: impl Into<String>) -> Self {
        Self {
            from_autoplaylist: true,
            ..Self::new(source, UserId(0))
        }
    }

    /// Rellena título, duración y descriptor tras una extracción exitosa
    pub fn apply_descriptor(&mut self, descriptor: StreamDescriptor) {
        self.title = descriptor.title.clone();
        self.duration = descriptor.duration;
        self.descriptor = Some(descriptor);
    }
}

impl From<&Entry> for PersistedEntry {
    fn from(entry: &Entry) -> Self {
        Self {
            source: entry.source.clone(),
            title: entry.title.clone(),
            requester: entry.requested_by,
            duration_secs: entry.duration.map(|d| d.as_secs()),
            offset_secs: entry.offset_secs,
            from_autoplaylist: entry.from_autoplaylist,
            queued_at: entry.queued_at,
        }
    }
}

impl From<PersistedEntry> for Entry {
    fn from(persisted: PersistedEntry) -> Self {
        Self {
            source: persisted.source,
            descriptor: None,
            title: persisted.title,
            duration: persisted.duration_secs.map(Duration::from_secs),
            requested_by: persisted.requester,
            queued_at: persisted.queued_at,
            offset_secs: persisted.offset_secs,
            from_autoplaylist: persisted.from_autoplaylist,
        }
    }
}

/// Variantes de inserción en la cola
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueMode {
    /// Al final de la secuencia
    Append,
    /// Justo después del slot en reproducción
    PlayNext,
    /// Al frente, interrumpiendo la reproducción actual
    PlayNow,
}

/// Cola ordenada por guild, con slot de reproducción separado.
///
/// Invariante: una entrada pertenece o a la secuencia o al slot, nunca a
/// ambos. Reordenar o quitar entradas jamás toca el slot.
#[derive(Debug)]
pub struct TrackQueue {
    entries: VecDeque<Entry>,
    now_playing: Option<Entry>,
    round_robin: bool,
    /// Secuencia de la última reproducción por solicitante (rotación justa)
    last_played: HashMap<UserId, u64>,
    play_seq: u64,
    max_size: usize,
}

impl TrackQueue {
    pub fn new(max_size: usize, round_robin: bool) -> Self {
        Self {
            entries: VecDeque::new(),
            now_playing: None,
            round_robin,
            last_played: HashMap::new(),
            play_seq: 0,
            max_size,
        }
    }

    /// Inserta una entrada según el modo y devuelve su posición
    pub fn enqueue(&mut self, entry: Entry, mode: EnqueueMode) -> Result<usize, EngineError> {
        if self.entries.len() >= self.max_size {
            return Err(EngineError::QueueFull(self.max_size));
        }

        let position = match mode {
            EnqueueMode::Append => {
                self.entries.push_back(entry);
                self.entries.len() - 1
            }
            EnqueueMode::PlayNext | EnqueueMode::PlayNow => {
                self.entries.push_front(entry);
                0
            }
        };

        info!(
            "➕ Encolada \"{}\" en posición {} ({:?})",
            self.entries[position].title, position, mode
        );
        Ok(position)
    }

    /// Devuelve una entrada al frente sin límite de tamaño (recuperación y
    /// re-encolado de play-now)
    pub fn requeue_front(&mut self, entry: Entry) {
        self.entries.push_front(entry);
    }

    /// Quita la entrada en `position` de la secuencia
    pub fn remove(&mut self, position: usize) -> Result<Entry, EngineError> {
        self.entries
            .remove(position)
            .ok_or(EngineError::OutOfRange(position))
    }

    /// Mueve una entrada de `from` a `to`
    pub fn move_entry(&mut self, from: usize, to: usize) -> Result<(), EngineError> {
        if from >= self.entries.len() {
            return Err(EngineError::OutOfRange(from));
        }
        if to >= self.entries.len() {
            return Err(EngineError::OutOfRange(to));
        }
        if from != to {
            let entry = self
                .entries
                .remove(from)
                .ok_or(EngineError::OutOfRange(from))?;
            self.entries.insert(to, entry);
            debug!("📍 Entrada movida de {} a {}", from, to);
        }
        Ok(())
    }

    /// Mezcla la secuencia (el slot no se toca)
    pub fn shuffle(&mut self) {
        let mut items: Vec<_> = self.entries.drain(..).collect();
        items.shuffle(&mut rand::thread_rng());
        self.entries.extend(items);
        info!("🔀 Cola mezclada ({} entradas)", self.entries.len());
    }

    /// Quita duplicados de la secuencia por clave normalizada,
    /// conservando la primera aparición de cada fuente
    pub fn clear_duplicates(&mut self) -> usize {
        let mut seen = HashSet::new();
        let original_len = self.entries.len();
        self.entries
            .retain(|entry| seen.insert(crate::sources::normalize_source(&entry.source)));

        let removed = original_len - self.entries.len();
        if removed > 0 {
            info!("🗑️ Eliminados {} duplicados de la cola", removed);
        }
        removed
    }

    /// Vacía la secuencia y devuelve cuántas entradas había
    pub fn clear(&mut self) -> usize {
        let removed = self.entries.len();
        self.entries.clear();
        info!("🗑️ Cola limpiada ({} entradas)", removed);
        removed
    }

    /// Promueve la siguiente entrada al slot de reproducción.
    ///
    /// En modo round-robin la elegida es la entrada más antigua del
    /// solicitante que lleva más tiempo sin reproducir; si no, FIFO
    /// estricto. El slot anterior debe haberse liberado con
    /// [`Self::finish_current`].
    pub fn advance(&mut self) -> Option<Entry> {
        let index = self.next_index()?;
        let entry = self.entries.remove(index)?;

        self.play_seq += 1;
        self.last_played.insert(entry.requested_by, self.play_seq);

        debug!("➡️ Siguiente en cola: {}", entry.title);
        self.now_playing = Some(entry.clone());
        Some(entry)
    }

    /// La entrada que `advance` escogería, sin promoverla
    pub fn peek_next(&self) -> Option<&Entry> {
        self.next_index().and_then(|i| self.entries.get(i))
    }

    /// Promueve incondicionalmente la entrada al frente.
    ///
    /// La usan las interrupciones play-now, que no pasan por la rotación
    /// justa.
    pub fn advance_front(&mut self) -> Option<Entry> {
        let entry = self.entries.pop_front()?;
        self.play_seq += 1;
        self.last_played.insert(entry.requested_by, self.play_seq);
        self.now_playing = Some(entry.clone());
        Some(entry)
    }

    /// Libera el slot de reproducción
    pub fn finish_current(&mut self) -> Option<Entry> {
        self.now_playing.take()
    }

    pub fn now_playing(&self) -> Option<&Entry> {
        self.now_playing.as_ref()
    }

    pub fn now_playing_mut(&mut self) -> Option<&mut Entry> {
        self.now_playing.as_mut()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn set_round_robin(&mut self, enabled: bool) {
        self.round_robin = enabled;
    }

    /// Duración total de la secuencia más el track actual
    pub fn total_duration(&self) -> Duration {
        let queued: Duration = self.entries.iter().filter_map(|e| e.duration).sum();
        let current = self
            .now_playing
            .as_ref()
            .and_then(|e| e.duration)
            .unwrap_or_default();
        queued + current
    }

    /// Snapshot serializable de la cola completa
    pub fn snapshot(&self) -> QueueSnapshot {
        QueueSnapshot {
            entries: self.entries.iter().map(PersistedEntry::from).collect(),
            now_playing: self.now_playing.as_ref().map(PersistedEntry::from),
        }
    }

    /// Reconstruye la cola desde un snapshot.
    ///
    /// Con `keep_offsets` en false (persistencia deshabilitada) todos los
    /// offsets se ponen a cero y la reproducción arranca desde el inicio.
    pub fn restore(&mut self, snapshot: QueueSnapshot, keep_offsets: bool) {
        self.entries = snapshot
            .entries
            .into_iter()
            .map(Entry::from)
            .collect();
        self.now_playing = snapshot.now_playing.map(Entry::from);
        if !keep_offsets {
            for entry in self.entries.iter_mut() {
                entry.offset_secs = 0.0;
            }
            if let Some(entry) = self.now_playing.as_mut() {
                entry.offset_secs = 0.0;
            }
        }
    }

    /// Página de la cola para mostrar al usuario
    pub fn page(&self, page: usize, per_page: usize) -> QueuePage {
        let safe_page = page.max(1);
        let start = (safe_page - 1) * per_page;
        let end = (start + per_page).min(self.entries.len());
        let total_pages = if self.entries.is_empty() {
            1
        } else {
            self.entries.len().div_ceil(per_page)
        };

        QueuePage {
            entries: if start < self.entries.len() {
                self.entries.range(start..end).cloned().collect()
            } else {
                Vec::new()
            },
            current_page: safe_page,
            total_pages,
            total_entries: self.entries.len(),
            total_duration: self.total_duration(),
        }
    }

    // Métodos privados

    fn next_index(&self) -> Option<usize> {
        if self.entries.is_empty() {
            return None;
        }
        if !self.round_robin {
            return Some(0);
        }

        // Solicitante con la reproducción más antigua; nunca-reproducidos
        // primero; empates por orden de cola
        let mut seen = HashSet::new();
        let mut best: Option<(u64, usize)> = None;
        for (index, entry) in self.entries.iter().enumerate() {
            if !seen.insert(entry.requested_by) {
                continue;
            }
            let last = self
                .last_played
                .get(&entry.requested_by)
                .copied()
                .unwrap_or(0);
            match best {
                Some((best_last, _)) if last >= best_last => {}
                _ => best = Some((last, index)),
            }
        }
        best.map(|(_, index)| index)
    }
}

/// Página de cola lista para presentar
#[derive(Debug, Clone)]
pub struct QueuePage {
    pub entries: Vec<Entry>,
    pub current_page: usize,
    pub total_pages: usize,
    pub total_entries: usize,
    pub total_duration: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn entry(source: &str, user: u64) -> Entry {
        Entry::new(source, UserId(user))
    }

    #[test]
    fn test_enqueue_modes_position() {
        let mut queue = TrackQueue::new(100, false);
        queue.enqueue(entry("a", 1), EnqueueMode::Append).unwrap();
        queue.enqueue(entry("b", 1), EnqueueMode::Append).unwrap();
        let pos = queue.enqueue(entry("c", 1), EnqueueMode::PlayNext).unwrap();
        assert_eq!(pos, 0);

        assert_eq!(queue.advance().unwrap().source, "c");
        queue.finish_current();
        assert_eq!(queue.advance().unwrap().source, "a");
    }

    #[test]
    fn test_queue_full_rejected() {
        let mut queue = TrackQueue::new(2, false);
        queue.enqueue(entry("a", 1), EnqueueMode::Append).unwrap();
        queue.enqueue(entry("b", 1), EnqueueMode::Append).unwrap();
        assert!(matches!(
            queue.enqueue(entry("c", 1), EnqueueMode::Append),
            Err(EngineError::QueueFull(2))
        ));
    }

    #[test]
    fn test_advance_is_fifo_without_round_robin() {
        let mut queue = TrackQueue::new(100, false);
        for s in ["uno", "dos", "tres"] {
            queue.enqueue(entry(s, 1), EnqueueMode::Append).unwrap();
        }
        for expected in ["uno", "dos", "tres"] {
            assert_eq!(queue.advance().unwrap().source, expected);
            queue.finish_current();
        }
        assert!(queue.advance().is_none());
    }

    #[test]
    fn test_round_robin_rotates_requesters() {
        let mut queue = TrackQueue::new(100, true);
        // A, B, C encolan 3 tracks cada uno, intercalados por solicitante
        for round in 0..3 {
            for user in [1u64, 2, 3] {
                queue
                    .enqueue(entry(&format!("u{user}-t{round}"), user), EnqueueMode::Append)
                    .unwrap();
            }
        }

        let mut order = Vec::new();
        while let Some(e) = queue.advance() {
            order.push(e.requested_by.0);
            queue.finish_current();
        }
        assert_eq!(order, vec![1, 2, 3, 1, 2, 3, 1, 2, 3]);
    }

    #[test]
    fn test_round_robin_never_repeats_while_others_wait() {
        let mut queue = TrackQueue::new(100, true);
        // A encola 3 seguidos, luego B encola 2
        for i in 0..3 {
            queue
                .enqueue(entry(&format!("a{i}"), 1), EnqueueMode::Append)
                .unwrap();
        }
        for i in 0..2 {
            queue
                .enqueue(entry(&format!("b{i}"), 2), EnqueueMode::Append)
                .unwrap();
        }

        let mut order = Vec::new();
        while let Some(e) = queue.advance() {
            order.push(e.requested_by.0);
            queue.finish_current();
        }
        assert_eq!(order, vec![1, 2, 1, 2, 1]);
    }

    #[test]
    fn test_advance_front_ignores_round_robin() {
        let mut queue = TrackQueue::new(100, true);
        queue.enqueue(entry("a", 1), EnqueueMode::Append).unwrap();
        queue.advance();
        queue.finish_current();
        // La rotación preferiría a B (usuario 2), pero play-now manda
        queue.enqueue(entry("b", 2), EnqueueMode::Append).unwrap();
        queue.enqueue(entry("urgente", 1), EnqueueMode::PlayNow).unwrap();

        let promoted = queue.advance_front().unwrap();
        assert_eq!(promoted.source, "urgente");
    }

    #[test]
    fn test_remove_and_move_do_not_touch_slot() {
        let mut queue = TrackQueue::new(100, false);
        queue.enqueue(entry("actual", 1), EnqueueMode::Append).unwrap();
        queue.enqueue(entry("x", 1), EnqueueMode::Append).unwrap();
        queue.enqueue(entry("y", 1), EnqueueMode::Append).unwrap();
        queue.advance();

        queue.remove(0).unwrap();
        queue.move_entry(0, 0).unwrap();
        assert_eq!(queue.now_playing().unwrap().source, "actual");
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_clear_duplicates_keeps_first_occurrence() {
        let mut queue = TrackQueue::new(100, false);
        queue
            .enqueue(
                entry("https://example.com/cancion?utm_source=share", 1),
                EnqueueMode::Append,
            )
            .unwrap();
        queue
            .enqueue(entry("https://example.com/otra", 2), EnqueueMode::Append)
            .unwrap();
        // Mismo medio que la primera, con tracking distinto
        queue
            .enqueue(entry("https://example.com/cancion", 3), EnqueueMode::Append)
            .unwrap();

        assert_eq!(queue.clear_duplicates(), 1);
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.advance().unwrap().requested_by, UserId(1));
        assert_eq!(queue.clear_duplicates(), 0);
    }

    #[test]
    fn test_remove_out_of_range() {
        let mut queue = TrackQueue::new(100, false);
        assert!(matches!(queue.remove(3), Err(EngineError::OutOfRange(3))));
    }

    #[test]
    fn test_snapshot_restore_keeps_order_and_offsets() {
        let mut queue = TrackQueue::new(100, false);
        for s in ["a", "b", "c"] {
            queue.enqueue(entry(s, 1), EnqueueMode::Append).unwrap();
        }
        queue.advance();
        queue.now_playing_mut().unwrap().offset_secs = 47.25;

        let snapshot = queue.snapshot();
        let mut restored = TrackQueue::new(100, false);
        restored.restore(snapshot, true);

        assert_eq!(restored.now_playing().unwrap().source, "a");
        assert_eq!(restored.now_playing().unwrap().offset_secs, 47.25);
        let order: Vec<String> = std::iter::from_fn(|| {
            restored.finish_current();
            restored.advance().map(|e| e.source)
        })
        .collect();
        assert_eq!(order, vec!["b".to_string(), "c".to_string()]);
    }

    #[test]
    fn test_restore_without_persistence_zeroes_offsets() {
        let mut queue = TrackQueue::new(100, false);
        queue.enqueue(entry("a", 1), EnqueueMode::Append).unwrap();
        queue.advance();
        queue.now_playing_mut().unwrap().offset_secs = 30.0;

        let mut restored = TrackQueue::new(100, false);
        restored.restore(queue.snapshot(), false);
        assert_eq!(restored.now_playing().unwrap().offset_secs, 0.0);
    }

    #[test]
    fn test_page_math() {
        let mut queue = TrackQueue::new(100, false);
        for i in 0..25 {
            queue
                .enqueue(entry(&format!("t{i}"), 1), EnqueueMode::Append)
                .unwrap();
        }

        let page = queue.page(2, 10);
        assert_eq!(page.total_pages, 3);
        assert_eq!(page.entries.len(), 10);
        assert_eq!(page.entries[0].source, "t10");

        let beyond = queue.page(9, 10);
        assert!(beyond.entries.is_empty());
        assert_eq!(beyond.total_entries, 25);
    }
}
