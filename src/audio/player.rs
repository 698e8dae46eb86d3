use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch, Mutex as TokioMutex};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::audio::autoplaylist::AutoplaylistManager;
use crate::audio::connection::ConnectionSupervisor;
use crate::audio::queue::{EnqueueMode, Entry, QueuePage, TrackQueue};
use crate::audio::votes::{SkipVoteTracker, VoteOutcome};
use crate::cache::MediaCache;
use crate::config::Config;
use crate::error::{EngineError, ExtractError};
use crate::sources::{normalize_source, ExtractorGateway, StreamDescriptor};
use crate::storage::QueueStore;
use crate::transport::VoiceTransport;
use crate::{GuildId, UserId};

/// PCM s16le estéreo a 48 kHz
const BYTES_PER_SEC: usize = 192_000;
/// Frame de 20 ms
const FRAME_BYTES: usize = 3_840;
const FRAME_MS: f64 = 20.0;
/// Cada cuánto se persiste el offset mientras suena un track
const PERSIST_INTERVAL: Duration = Duration::from_secs(5);

pub const MIN_SPEED: f64 = 0.5;
pub const MAX_SPEED: f64 = 100.0;

/// Estado del reproductor de un guild.
///
/// Las transiciones son la única vía por la que cambia el track actual;
/// todas se serializan en el mailbox del actor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerState {
    Idle,
    Resolving,
    Playing,
    Paused,
    AwaitingReconnect,
    Stopped,
}

/// Notificación visible para el despachador de comandos.
///
/// Todo fallo permanente produce exactamente una notificación que nombra la
/// entrada y la clase de motivo, nunca un error interno crudo.
#[derive(Debug, Clone)]
pub enum PlayerNotification {
    TrackStarted { guild_id: GuildId, title: String },
    TrackSkipped { guild_id: GuildId, title: String },
    TrackDropped { guild_id: GuildId, title: String, reason: String },
    QueueEnded { guild_id: GuildId },
    ConnectionLost { guild_id: GuildId },
    SessionEnded { guild_id: GuildId, reason: String },
}

/// Comandos del despachador hacia el actor del guild
pub(crate) enum PlayerCommand {
    Enqueue {
        source: String,
        mode: EnqueueMode,
        requester: UserId,
        reply: oneshot::Sender<Result<usize, EngineError>>,
    },
    Skip {
        voter: UserId,
        force: bool,
        reply: oneshot::Sender<Result<VoteOutcome, EngineError>>,
    },
    Pause {
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    Resume {
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    Seek {
        secs: f64,
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    SetSpeed {
        rate: f64,
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    SetVolume {
        level: f32,
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    MoveEntry {
        from: usize,
        to: usize,
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    Remove {
        position: usize,
        reply: oneshot::Sender<Result<Entry, EngineError>>,
    },
    Shuffle {
        reply: oneshot::Sender<()>,
    },
    Clear {
        reply: oneshot::Sender<usize>,
    },
    ClearDuplicates {
        reply: oneshot::Sender<usize>,
    },
    NowPlaying {
        reply: oneshot::Sender<Option<Entry>>,
    },
    QueuePage {
        page: usize,
        reply: oneshot::Sender<QueuePage>,
    },
    State {
        reply: oneshot::Sender<PlayerState>,
    },
    ListenersChanged {
        count: usize,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
}

/// Eventos internos de las tareas auxiliares hacia el actor.
///
/// Llevan la generación con la que se lanzaron: un evento de una generación
/// vieja pertenece a un track ya cancelado y se descarta.
pub(crate) enum PlayerEvent {
    Resolved {
        generation: u64,
        result: Result<ResolvedMedia, ExtractError>,
    },
    TrackFinished {
        generation: u64,
        result: Result<(), EngineError>,
    },
    TransportLost,
    TransportRestored,
    ReconnectExhausted,
}

/// Medio listo para emitir: descriptor más bytes de audio
pub(crate) struct ResolvedMedia {
    descriptor: StreamDescriptor,
    media: Bytes,
}

/// Emisión en curso de un track
struct PlaybackSession {
    cancel: CancellationToken,
    pause: watch::Sender<bool>,
    position_ms: Arc<AtomicU64>,
}

/// Colaboradores que necesita un actor de guild
pub(crate) struct PlayerDeps {
    pub config: Arc<Config>,
    pub gateway: Arc<ExtractorGateway>,
    pub cache: Arc<MediaCache>,
    pub store: Arc<QueueStore>,
    pub autoplaylist: Option<Arc<TokioMutex<AutoplaylistManager>>>,
    pub transport: Arc<dyn VoiceTransport>,
    pub notifications: mpsc::UnboundedSender<PlayerNotification>,
}

/// Actor de reproducción de un guild.
///
/// Cada guild es lógicamente mono-hilo: los comandos se encolan en el
/// mailbox y se aplican en orden de llegada, nunca compitiendo con una
/// transición en vuelo. Las esperas largas (extracción, descarga, emisión,
/// backoff) viven en tareas auxiliares que reportan por eventos.
pub struct GuildPlayer {
    guild_id: GuildId,
    config: Arc<Config>,
    queue: TrackQueue,
    votes: SkipVoteTracker,
    gateway: Arc<ExtractorGateway>,
    cache: Arc<MediaCache>,
    store: Arc<QueueStore>,
    autoplaylist: Option<Arc<TokioMutex<AutoplaylistManager>>>,
    transport: Arc<dyn VoiceTransport>,
    notifications: mpsc::UnboundedSender<PlayerNotification>,

    state: PlayerState,
    generation: u64,
    session: Option<PlaybackSession>,
    current_media: Option<Bytes>,
    volume: Arc<Mutex<f32>>,
    speed: Arc<Mutex<f64>>,
    auto_paused: bool,
    state_before_outage: Option<PlayerState>,

    idle_deadline: Option<Instant>,
    vc_empty_deadline: Option<Instant>,

    cmd_rx: mpsc::UnboundedReceiver<PlayerCommand>,
    events_tx: mpsc::UnboundedSender<PlayerEvent>,
    events_rx: mpsc::UnboundedReceiver<PlayerEvent>,
    cancel: CancellationToken,
}

impl GuildPlayer {
    /// Crea el actor del guild y lo deja corriendo.
    ///
    /// Restaura el snapshot persistido si existe; con la persistencia
    /// deshabilitada la cola se replica pero los offsets arrancan en cero.
    pub(crate) async fn spawn(guild_id: GuildId, deps: PlayerDeps) -> PlayerHandle {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let mut queue = TrackQueue::new(deps.config.max_queue_size, deps.config.round_robin_queue);
        if let Some(snapshot) = deps.store.load(guild_id).await {
            queue.restore(snapshot, deps.config.persistent_queue);
        }

        ConnectionSupervisor::new(
            guild_id,
            Arc::clone(&deps.transport),
            events_tx.clone(),
            deps.config.reconnect_attempts,
            Duration::from_secs(deps.config.reconnect_max_delay_secs),
        )
        .spawn(cancel.child_token());

        let player = Self {
            guild_id,
            votes: SkipVoteTracker::new(deps.config.skips_required, deps.config.skip_ratio),
            volume: Arc::new(Mutex::new(deps.config.default_volume)),
            speed: Arc::new(Mutex::new(1.0)),
            queue,
            gateway: deps.gateway,
            cache: deps.cache,
            store: deps.store,
            autoplaylist: deps.autoplaylist,
            transport: deps.transport,
            notifications: deps.notifications,
            config: deps.config,
            state: PlayerState::Idle,
            generation: 0,
            session: None,
            current_media: None,
            auto_paused: false,
            state_before_outage: None,
            idle_deadline: None,
            vc_empty_deadline: None,
            cmd_rx,
            events_tx,
            events_rx,
            cancel,
        };
        tokio::spawn(player.run());

        PlayerHandle {
            guild_id,
            commands: cmd_tx,
        }
    }

    async fn run(mut self) {
        info!("🎚️ Actor de reproducción iniciado para guild {}", self.guild_id);

        // Recuperación tras reinicio: el track que estaba sonando se
        // reanuda en su último offset conocido
        if let Some(entry) = self.queue.now_playing().cloned() {
            info!(
                "🔄 Reanudando \"{}\" en guild {} desde {:.1}s",
                entry.title, self.guild_id, entry.offset_secs
            );
            self.begin_resolve(&entry);
        } else if !self.queue.is_empty() {
            self.advance_and_resolve().await;
        } else {
            self.refresh_timers();
        }

        let mut persist_tick = tokio::time::interval(PERSIST_INTERVAL);
        persist_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        while self.state != PlayerState::Stopped {
            let idle_deadline = self.idle_deadline;
            let vc_deadline = self.vc_empty_deadline;

            tokio::select! {
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    None => self.shutdown("desconexión explícita").await,
                },
                Some(event) = self.events_rx.recv() => self.handle_event(event).await,
                _ = persist_tick.tick(), if self.state == PlayerState::Playing => {
                    self.sync_offset();
                    self.persist_queue().await;
                }
                _ = async { tokio::time::sleep_until(idle_deadline.unwrap()).await },
                        if idle_deadline.is_some() => {
                    info!("💤 Reproductor inactivo en guild {}, cerrando sesión", self.guild_id);
                    self.shutdown("reproductor inactivo").await;
                }
                _ = async { tokio::time::sleep_until(vc_deadline.unwrap()).await },
                        if vc_deadline.is_some() => {
                    info!("💤 Canal sin oyentes en guild {}, cerrando sesión", self.guild_id);
                    self.shutdown("canal sin oyentes").await;
                }
            }
        }

        debug!("Actor terminado para guild {}", self.guild_id);
    }

    async fn handle_command(&mut self, command: PlayerCommand) {
        match command {
            PlayerCommand::Enqueue {
                source,
                mode,
                requester,
                reply,
            } => {
                let entry = Entry::new(source, requester);
                let result = self.queue.enqueue(entry, mode);
                let ok = result.is_ok();
                let _ = reply.send(result);
                if !ok {
                    return;
                }
                self.persist_queue().await;

                let interrupting = mode == EnqueueMode::PlayNow
                    && matches!(
                        self.state,
                        PlayerState::Playing
                            | PlayerState::Paused
                            | PlayerState::Resolving
                            | PlayerState::AwaitingReconnect
                    );
                if interrupting {
                    // Un play-now aceptado durante un corte también
                    // interrumpe: la resolución corre igual y el track
                    // queda listo en pausa hasta que el transporte vuelva
                    let during_outage = self.state == PlayerState::AwaitingReconnect;
                    self.interrupt_for_play_now().await;
                    if during_outage && self.state == PlayerState::Resolving {
                        self.state = PlayerState::AwaitingReconnect;
                    }
                } else if self.state == PlayerState::Idle {
                    self.advance_and_resolve().await;
                }
            }

            PlayerCommand::Skip { voter, force, reply } => {
                let Some(current) = self.queue.now_playing() else {
                    let _ = reply.send(Err(EngineError::NothingPlaying));
                    return;
                };
                // El solicitante del track tiene bypass instantáneo
                let bypass = force || voter == current.requested_by;
                let outcome =
                    self.votes
                        .cast_vote(voter, self.transport.eligible_listeners(), bypass);
                let _ = reply.send(Ok(outcome));
                if outcome == VoteOutcome::Skip {
                    self.skip_current().await;
                }
            }

            PlayerCommand::Pause { reply } => {
                let result = match self.state {
                    PlayerState::Playing => {
                        self.auto_paused = false;
                        self.set_paused(true);
                        Ok(())
                    }
                    PlayerState::Paused => Ok(()),
                    PlayerState::AwaitingReconnect => {
                        self.state_before_outage = Some(PlayerState::Paused);
                        Ok(())
                    }
                    _ => Err(EngineError::NothingPlaying),
                };
                let _ = reply.send(result);
            }

            PlayerCommand::Resume { reply } => {
                let result = match self.state {
                    PlayerState::Paused => {
                        self.auto_paused = false;
                        self.set_paused(false);
                        Ok(())
                    }
                    PlayerState::Playing => Ok(()),
                    PlayerState::AwaitingReconnect => {
                        self.state_before_outage = Some(PlayerState::Playing);
                        Ok(())
                    }
                    _ => Err(EngineError::NothingPlaying),
                };
                let _ = reply.send(result);
            }

            PlayerCommand::Seek { secs, reply } => {
                let _ = reply.send(self.seek(secs));
            }

            PlayerCommand::SetSpeed { rate, reply } => {
                let result = if (MIN_SPEED..=MAX_SPEED).contains(&rate) {
                    *self.speed.lock() = rate;
                    info!("⏩ Velocidad ajustada a {:.2}x en guild {}", rate, self.guild_id);
                    Ok(())
                } else {
                    Err(EngineError::InvalidSpeed(rate))
                };
                let _ = reply.send(result);
            }

            PlayerCommand::SetVolume { level, reply } => {
                let result = if (0.0..=1.0).contains(&level) {
                    *self.volume.lock() = level;
                    info!(
                        "🔊 Volumen ajustado a {}% en guild {}",
                        (level * 100.0) as u8,
                        self.guild_id
                    );
                    Ok(())
                } else {
                    Err(EngineError::InvalidVolume(level))
                };
                let _ = reply.send(result);
            }

            PlayerCommand::MoveEntry { from, to, reply } => {
                let result = self.queue.move_entry(from, to);
                let ok = result.is_ok();
                let _ = reply.send(result);
                if ok {
                    self.persist_queue().await;
                }
            }

            PlayerCommand::Remove { position, reply } => {
                let result = self.queue.remove(position);
                let ok = result.is_ok();
                let _ = reply.send(result);
                if ok {
                    self.persist_queue().await;
                }
            }

            PlayerCommand::Shuffle { reply } => {
                self.queue.shuffle();
                let _ = reply.send(());
                self.persist_queue().await;
            }

            PlayerCommand::Clear { reply } => {
                let removed = self.queue.clear();
                let _ = reply.send(removed);
                self.persist_queue().await;
            }

            PlayerCommand::ClearDuplicates { reply } => {
                let removed = self.queue.clear_duplicates();
                let _ = reply.send(removed);
                if removed > 0 {
                    self.persist_queue().await;
                }
            }

            PlayerCommand::NowPlaying { reply } => {
                self.sync_offset();
                let _ = reply.send(self.queue.now_playing().cloned());
            }

            PlayerCommand::QueuePage { page, reply } => {
                let _ = reply.send(self.queue.page(page, 10));
            }

            PlayerCommand::State { reply } => {
                let _ = reply.send(self.state);
            }

            PlayerCommand::ListenersChanged { count } => self.listeners_changed(count),

            PlayerCommand::Stop { reply } => {
                self.shutdown("desconexión explícita").await;
                let _ = reply.send(());
            }
        }
    }

    async fn handle_event(&mut self, event: PlayerEvent) {
        match event {
            PlayerEvent::Resolved { generation, result } => {
                if generation != self.generation {
                    debug!("Resolución obsoleta descartada en guild {}", self.guild_id);
                    return;
                }
                match result {
                    Ok(resolved) => self.on_resolved(resolved).await,
                    Err(err) => self.drop_current(err).await,
                }
            }

            PlayerEvent::TrackFinished { generation, result } => {
                if generation != self.generation {
                    return;
                }
                if let Err(err) = result {
                    // Mismo tratamiento que un final natural, log distinto
                    error!(
                        "🎛️ Fallo de reproducción a mitad de track en guild {}: {}",
                        self.guild_id, err
                    );
                } else if let Some(entry) = self.queue.now_playing() {
                    debug!("🏁 Track terminado: {}", entry.title);
                }
                self.queue.finish_current();
                self.session = None;
                self.current_media = None;
                self.advance_and_resolve().await;
            }

            PlayerEvent::TransportLost => {
                if !matches!(
                    self.state,
                    PlayerState::Playing | PlayerState::Paused | PlayerState::Resolving
                ) {
                    return;
                }
                self.state_before_outage = Some(if self.state == PlayerState::Paused {
                    PlayerState::Paused
                } else {
                    PlayerState::Playing
                });
                if let Some(session) = &self.session {
                    let _ = session.pause.send(true);
                }
                self.sync_offset();
                self.persist_queue().await;
                self.state = PlayerState::AwaitingReconnect;
                self.idle_deadline = None;
                self.vc_empty_deadline = None;
                self.notify(PlayerNotification::ConnectionLost {
                    guild_id: self.guild_id,
                });
            }

            PlayerEvent::TransportRestored => {
                if self.state != PlayerState::AwaitingReconnect {
                    return;
                }
                let resume_to = self
                    .state_before_outage
                    .take()
                    .unwrap_or(PlayerState::Paused);
                if resume_to == PlayerState::Playing {
                    if self.session.is_some() {
                        self.set_paused(false);
                    } else if self.current_media.is_some() {
                        let offset = self
                            .queue
                            .now_playing()
                            .map(|e| e.offset_secs)
                            .unwrap_or(0.0);
                        self.state = PlayerState::Playing;
                        self.start_playback(offset, false);
                        self.refresh_timers();
                    } else if let Some(entry) = self.queue.now_playing().cloned() {
                        self.begin_resolve(&entry);
                    } else {
                        self.state = PlayerState::Idle;
                        self.refresh_timers();
                    }
                } else {
                    self.state = PlayerState::Paused;
                    self.refresh_timers();
                }
            }

            PlayerEvent::ReconnectExhausted => {
                self.shutdown("reconexión agotada").await;
            }
        }
    }

    // Transiciones

    /// Resolución exitosa: el slot arranca a emitir desde su offset
    async fn on_resolved(&mut self, resolved: ResolvedMedia) {
        let Some(entry) = self.queue.now_playing_mut() else {
            return;
        };
        entry.apply_descriptor(resolved.descriptor);
        let offset = entry.offset_secs;
        let title = entry.title.clone();
        self.current_media = Some(resolved.media);
        self.votes.reset();

        if self.state == PlayerState::AwaitingReconnect {
            // La extracción terminó durante el corte: dejarlo listo en pausa
            self.state_before_outage = Some(PlayerState::Playing);
            self.start_playback(offset, true);
        } else {
            let autopause = self.config.auto_pause && self.transport.eligible_listeners() == 0;
            self.auto_paused = autopause;
            self.state = if autopause {
                PlayerState::Paused
            } else {
                PlayerState::Playing
            };
            self.start_playback(offset, autopause);
            self.refresh_timers();
        }

        info!("▶️ Reproduciendo \"{}\" en guild {}", title, self.guild_id);
        self.notify(PlayerNotification::TrackStarted {
            guild_id: self.guild_id,
            title,
        });
        self.persist_queue().await;
        self.maybe_prefetch();
    }

    /// Fallo permanente (o transitorio agotado): soltar la entrada y seguir
    async fn drop_current(&mut self, err: ExtractError) {
        if let Some(entry) = self.queue.finish_current() {
            warn!(
                "❌ Entrada descartada en guild {}: \"{}\" ({})",
                self.guild_id, entry.title, err
            );
            self.notify(PlayerNotification::TrackDropped {
                guild_id: self.guild_id,
                title: entry.title.clone(),
                reason: err.reason_class().to_string(),
            });
            if entry.from_autoplaylist && err.is_permanent() {
                if let Some(autoplaylist) = &self.autoplaylist {
                    if let Err(e) = autoplaylist
                        .lock()
                        .await
                        .report_unplayable(&entry.source, err.reason_class())
                        .await
                    {
                        warn!("No se pudo podar la autoplaylist: {}", e);
                    }
                }
            }
        }
        self.current_media = None;
        self.advance_and_resolve().await;
    }

    /// Promueve la siguiente entrada (cola o autoplaylist) y lanza su
    /// resolución; si no hay nada, pasa a Idle
    async fn advance_and_resolve(&mut self) {
        loop {
            self.queue.finish_current();
            if let Some(entry) = self.queue.advance() {
                self.begin_resolve(&entry);
                self.persist_queue().await;
                return;
            }

            if self.config.enable_autoplaylist {
                if let Some(autoplaylist) = &self.autoplaylist {
                    if let Some(source) = autoplaylist.lock().await.next().await {
                        self.queue.requeue_front(Entry::from_autoplaylist(source));
                        continue;
                    }
                }
            }

            self.state = PlayerState::Idle;
            self.session = None;
            self.current_media = None;
            self.refresh_timers();
            self.notify(PlayerNotification::QueueEnded {
                guild_id: self.guild_id,
            });
            self.persist_queue().await;
            return;
        }
    }

    /// Lanza la resolución del track en el slot en una tarea auxiliar.
    ///
    /// Detener el guild no cancela una resolución compartida en el gateway:
    /// el actor simplemente deja de esperarla (la generación invalida el
    /// evento) y los demás guilds acoplados siguen.
    fn begin_resolve(&mut self, entry: &Entry) {
        self.state = PlayerState::Resolving;
        self.refresh_timers();
        self.generation += 1;

        let generation = self.generation;
        let gateway = Arc::clone(&self.gateway);
        let cache = Arc::clone(&self.cache);
        let events = self.events_tx.clone();
        let source = entry.source.clone();
        let retain = entry.from_autoplaylist && self.config.storage_retain_autoplay;

        tokio::spawn(async move {
            let result = resolve_media(gateway, cache, &source, retain).await;
            let _ = events.send(PlayerEvent::Resolved { generation, result });
        });
    }

    /// Interrupción por `play-now`: la entrada interrumpida vuelve al
    /// frente (tras la nueva) o se descarta, según configuración
    async fn interrupt_for_play_now(&mut self) {
        self.generation += 1;
        self.cancel_playback();
        let interrupted = self.queue.finish_current();
        self.current_media = None;

        // La entrada play-now está al frente; la rotación justa no aplica
        match self.queue.advance_front() {
            Some(entry) => self.begin_resolve(&entry),
            None => {
                self.advance_and_resolve().await;
                return;
            }
        }

        if let Some(mut entry) = interrupted {
            if self.config.play_now_requeue {
                entry.offset_secs = 0.0;
                entry.descriptor = None;
                info!("↩️ \"{}\" devuelta al frente de la cola", entry.title);
                self.queue.requeue_front(entry);
            } else {
                self.notify(PlayerNotification::TrackSkipped {
                    guild_id: self.guild_id,
                    title: entry.title,
                });
            }
        }
        self.persist_queue().await;
    }

    async fn skip_current(&mut self) {
        self.generation += 1;
        self.cancel_playback();
        if let Some(entry) = self.queue.finish_current() {
            info!("⏭️ Saltando \"{}\" en guild {}", entry.title, self.guild_id);
            self.notify(PlayerNotification::TrackSkipped {
                guild_id: self.guild_id,
                title: entry.title,
            });
        }
        self.current_media = None;
        self.advance_and_resolve().await;
    }

    fn seek(&mut self, secs: f64) -> Result<(), EngineError> {
        if !matches!(self.state, PlayerState::Playing | PlayerState::Paused) {
            return Err(EngineError::NothingPlaying);
        }
        let Some(media) = &self.current_media else {
            return Err(EngineError::NothingPlaying);
        };
        let duration = media.len() as f64 / BYTES_PER_SEC as f64;
        if !secs.is_finite() || secs < 0.0 || secs > duration {
            return Err(EngineError::InvalidSeek(secs));
        }

        self.generation += 1;
        self.cancel_playback();
        if let Some(entry) = self.queue.now_playing_mut() {
            entry.offset_secs = secs;
        }
        let paused = self.state == PlayerState::Paused;
        self.start_playback(secs, paused);
        info!("⏱️ Seek a {:.1}s en guild {}", secs, self.guild_id);
        Ok(())
    }

    fn listeners_changed(&mut self, count: usize) {
        if count == 0 {
            if let Some(timeout) = self.config.inactive_vc_timeout() {
                self.vc_empty_deadline = Some(Instant::now() + timeout);
            }
            if self.config.auto_pause && self.state == PlayerState::Playing {
                info!("⏸️ Auto-pausa: canal sin oyentes en guild {}", self.guild_id);
                self.auto_paused = true;
                self.set_paused(true);
            }
        } else {
            self.vc_empty_deadline = None;
            if self.auto_paused && self.state == PlayerState::Paused {
                info!("▶️ Auto-reanudación: oyente de vuelta en guild {}", self.guild_id);
                self.auto_paused = false;
                self.set_paused(false);
            }
        }
    }

    // Mecánica interna

    fn start_playback(&mut self, offset_secs: f64, start_paused: bool) {
        let Some(media) = self.current_media.clone() else {
            return;
        };
        let cancel = CancellationToken::new();
        let (pause_tx, pause_rx) = watch::channel(start_paused);
        let position_ms = Arc::new(AtomicU64::new((offset_secs * 1000.0) as u64));

        self.session = Some(PlaybackSession {
            cancel: cancel.clone(),
            pause: pause_tx,
            position_ms: Arc::clone(&position_ms),
        });

        let transport = Arc::clone(&self.transport);
        let events = self.events_tx.clone();
        let generation = self.generation;
        let volume = Arc::clone(&self.volume);
        let speed = Arc::clone(&self.speed);

        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                result = emit_frames(
                    media, offset_secs, transport, pause_rx, position_ms, volume, speed,
                ) => {
                    let _ = events.send(PlayerEvent::TrackFinished { generation, result });
                }
            }
        });
    }

    fn cancel_playback(&mut self) {
        if let Some(session) = self.session.take() {
            session.cancel.cancel();
        }
    }

    fn set_paused(&mut self, paused: bool) {
        if let Some(session) = &self.session {
            let _ = session.pause.send(paused);
        }
        self.state = if paused {
            PlayerState::Paused
        } else {
            PlayerState::Playing
        };
        self.refresh_timers();
    }

    /// Rearma el temporizador de inactividad según el estado actual
    fn refresh_timers(&mut self) {
        self.idle_deadline = match self.state {
            PlayerState::Idle | PlayerState::Paused => self
                .config
                .player_inactive_timeout()
                .map(|timeout| Instant::now() + timeout),
            _ => None,
        };
    }

    /// Copia la posición de la emisión al offset del slot
    fn sync_offset(&mut self) {
        if let Some(session) = &self.session {
            let secs = session.position_ms.load(Ordering::Relaxed) as f64 / 1000.0;
            if let Some(entry) = self.queue.now_playing_mut() {
                entry.offset_secs = secs;
            }
        }
    }

    async fn persist_queue(&mut self) {
        if let Err(e) = self.store.save(self.guild_id, &self.queue.snapshot()).await {
            warn!("No se pudo persistir la cola de guild {}: {}", self.guild_id, e);
        }
    }

    /// Pre-descarga consultiva del siguiente track; jamás bloquea la
    /// reproducción actual
    fn maybe_prefetch(&self) {
        if !self.config.pre_download_next_song {
            return;
        }
        let Some(next) = self.queue.peek_next() else {
            return;
        };
        let gateway = Arc::clone(&self.gateway);
        let cache = Arc::clone(&self.cache);
        let source = next.source.clone();
        let retain = next.from_autoplaylist && self.config.storage_retain_autoplay;

        debug!("📥 Pre-descargando siguiente track: {}", source);
        tokio::spawn(async move {
            if let Err(e) = resolve_media(gateway, cache, &source, retain).await {
                debug!("Pre-descarga falló para {}: {}", source, e);
            }
        });
    }

    async fn shutdown(&mut self, reason: &str) {
        self.generation += 1;
        self.cancel_playback();
        self.cancel.cancel();
        self.sync_offset();
        self.persist_queue().await;
        self.state = PlayerState::Stopped;
        info!("🛑 Sesión terminada en guild {}: {}", self.guild_id, reason);
        self.notify(PlayerNotification::SessionEnded {
            guild_id: self.guild_id,
            reason: reason.to_string(),
        });
    }

    fn notify(&self, notification: PlayerNotification) {
        let _ = self.notifications.send(notification);
    }
}

/// Resuelve y materializa el medio de una fuente.
///
/// El caché se consulta primero; un fallo de E/S de caché nunca aborta: se
/// degrada a streaming sin persistir, con aviso en el log.
async fn resolve_media(
    gateway: Arc<ExtractorGateway>,
    cache: Arc<MediaCache>,
    source: &str,
    retain: bool,
) -> Result<ResolvedMedia, ExtractError> {
    let descriptor = gateway.resolve(source).await?;
    let key = normalize_source(source);

    if let Some(media) = cache.read(&key).await {
        debug!("🎯 Medio servido desde caché: {}", key);
        return Ok(ResolvedMedia { descriptor, media });
    }

    let media = gateway.fetch_media(&descriptor).await?;
    if let Err(e) = cache.put(&key, &media, retain).await {
        warn!("⚠️ Caché no disponible, reproduciendo sin persistir: {}", e);
    }
    Ok(ResolvedMedia { descriptor, media })
}

/// Bucle de emisión de frames con cadencia de 20 ms.
///
/// La velocidad escala el reloj de emisión y el volumen la ganancia de las
/// muestras. Un corte de conexión no termina el track: el frame se
/// reintenta mientras el supervisor gestiona la reconexión.
async fn emit_frames(
    media: Bytes,
    start_offset_secs: f64,
    transport: Arc<dyn VoiceTransport>,
    mut pause_rx: watch::Receiver<bool>,
    position_ms: Arc<AtomicU64>,
    volume: Arc<Mutex<f32>>,
    speed: Arc<Mutex<f64>>,
) -> Result<(), EngineError> {
    let start_byte = (start_offset_secs * BYTES_PER_SEC as f64) as usize;
    let mut pos = (start_byte / FRAME_BYTES) * FRAME_BYTES;

    loop {
        // Pausa cooperativa: esperar a despausar
        while *pause_rx.borrow() {
            if pause_rx.changed().await.is_err() {
                return Ok(());
            }
        }

        if pos >= media.len() {
            return Ok(());
        }
        let end = (pos + FRAME_BYTES).min(media.len());
        let frame = apply_gain(&media[pos..end], *volume.lock());

        match transport.send_frame(frame).await {
            Ok(()) => {}
            Err(EngineError::ConnectionLost) => {
                // El supervisor nos pausará; no perder este frame
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
            Err(err) => return Err(err),
        }

        pos = end;
        position_ms.store((pos / (BYTES_PER_SEC / 1000)) as u64, Ordering::Relaxed);

        let rate = *speed.lock();
        tokio::time::sleep(Duration::from_secs_f64(FRAME_MS / 1000.0 / rate)).await;
    }
}

/// Escala muestras s16le por la ganancia dada
fn apply_gain(frame: &[u8], gain: f32) -> Bytes {
    if (gain - 1.0).abs() < f32::EPSILON {
        return Bytes::copy_from_slice(frame);
    }
    let mut out = Vec::with_capacity(frame.len());
    for chunk in frame.chunks_exact(2) {
        let sample = i16::from_le_bytes([chunk[0], chunk[1]]);
        let scaled = (f32::from(sample) * gain).clamp(f32::from(i16::MIN), f32::from(i16::MAX));
        out.extend_from_slice(&(scaled as i16).to_le_bytes());
    }
    if frame.len() % 2 == 1 {
        out.push(frame[frame.len() - 1]);
    }
    Bytes::from(out)
}

/// Asa pública del actor de un guild.
///
/// Todos los métodos encolan un comando en el mailbox; el orden de llegada
/// es el orden de aplicación.
#[derive(Clone)]
pub struct PlayerHandle {
    guild_id: GuildId,
    commands: mpsc::UnboundedSender<PlayerCommand>,
}

impl PlayerHandle {
    pub fn guild_id(&self) -> GuildId {
        self.guild_id
    }

    /// True si el actor ya terminó
    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    pub async fn enqueue(
        &self,
        source: impl Into<String>,
        mode: EnqueueMode,
        requester: UserId,
    ) -> Result<usize, EngineError> {
        self.request(|reply| PlayerCommand::Enqueue {
            source: source.into(),
            mode,
            requester,
            reply,
        })
        .await?
    }

    pub async fn skip(&self, voter: UserId, force: bool) -> Result<VoteOutcome, EngineError> {
        self.request(|reply| PlayerCommand::Skip { voter, force, reply })
            .await?
    }

    pub async fn pause(&self) -> Result<(), EngineError> {
        self.request(|reply| PlayerCommand::Pause { reply }).await?
    }

    pub async fn resume(&self) -> Result<(), EngineError> {
        self.request(|reply| PlayerCommand::Resume { reply }).await?
    }

    pub async fn seek(&self, secs: f64) -> Result<(), EngineError> {
        self.request(|reply| PlayerCommand::Seek { secs, reply })
            .await?
    }

    pub async fn set_speed(&self, rate: f64) -> Result<(), EngineError> {
        self.request(|reply| PlayerCommand::SetSpeed { rate, reply })
            .await?
    }

    pub async fn set_volume(&self, level: f32) -> Result<(), EngineError> {
        self.request(|reply| PlayerCommand::SetVolume { level, reply })
            .await?
    }

    pub async fn move_entry(&self, from: usize, to: usize) -> Result<(), EngineError> {
        self.request(|reply| PlayerCommand::MoveEntry { from, to, reply })
            .await?
    }

    pub async fn remove(&self, position: usize) -> Result<Entry, EngineError> {
        self.request(|reply| PlayerCommand::Remove { position, reply })
            .await?
    }

    pub async fn shuffle(&self) -> Result<(), EngineError> {
        self.request(|reply| PlayerCommand::Shuffle { reply }).await
    }

    pub async fn clear(&self) -> Result<usize, EngineError> {
        self.request(|reply| PlayerCommand::Clear { reply }).await
    }

    /// Quita duplicados de la cola y devuelve cuántos salieron
    pub async fn clear_duplicates(&self) -> Result<usize, EngineError> {
        self.request(|reply| PlayerCommand::ClearDuplicates { reply })
            .await
    }

    pub async fn now_playing(&self) -> Result<Option<Entry>, EngineError> {
        self.request(|reply| PlayerCommand::NowPlaying { reply })
            .await
    }

    pub async fn queue_page(&self, page: usize) -> Result<QueuePage, EngineError> {
        self.request(|reply| PlayerCommand::QueuePage { page, reply })
            .await
    }

    pub async fn state(&self) -> Result<PlayerState, EngineError> {
        self.request(|reply| PlayerCommand::State { reply }).await
    }

    /// Informa del número de oyentes elegibles (auto-pausa y temporizador
    /// de canal vacío); sin respuesta
    pub fn notify_listeners(&self, count: usize) {
        let _ = self
            .commands
            .send(PlayerCommand::ListenersChanged { count });
    }

    /// Detiene la sesión del guild y espera a que el actor cierre
    pub async fn stop(&self) -> Result<(), EngineError> {
        self.request(|reply| PlayerCommand::Stop { reply }).await
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> PlayerCommand,
    ) -> Result<T, EngineError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .map_err(|_| EngineError::Stopped)?;
        rx.await.map_err(|_| EngineError::Stopped)
    }
}
