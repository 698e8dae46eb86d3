use anyhow::{Context, Result};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex as TokioMutex};
use tracing::{info, warn};

use crate::audio::{AutoplaylistManager, GuildPlayer, PlayerHandle, PlayerNotification};
use crate::cache::MediaCache;
use crate::config::Config;
use crate::error::EngineError;
use crate::sources::{ExtractorGateway, MediaExtractor};
use crate::storage::QueueStore;
use crate::transport::VoiceTransport;
use crate::GuildId;

/// Motor de reproducción multi-guild.
///
/// Mantiene el registro de actores por guild y los colaboradores
/// compartidos entre todos: gateway de extracción (con acoplamiento de
/// resoluciones concurrentes), caché de medios, persistencia de colas y
/// autoplaylist. La ruta de un guild nunca bloquea la de otro.
pub struct JukeboxEngine {
    config: Arc<Config>,
    gateway: Arc<ExtractorGateway>,
    cache: Arc<MediaCache>,
    store: Arc<QueueStore>,
    autoplaylist: Option<Arc<TokioMutex<AutoplaylistManager>>>,
    players: DashMap<GuildId, PlayerHandle>,
    notifications: mpsc::UnboundedSender<PlayerNotification>,
}

impl JukeboxEngine {
    /// Construye el motor con el backend de extracción dado.
    ///
    /// Devuelve también el receptor de notificaciones, por el que los
    /// actores de todos los guilds reportan al despachador.
    pub async fn new(
        config: Config,
        backend: Arc<dyn MediaExtractor>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<PlayerNotification>)> {
        let config = Arc::new(config);

        let gateway = Arc::new(ExtractorGateway::new(
            backend,
            config.blocked_sources.clone(),
            config.extract_retry_attempts,
        ));
        let cache = Arc::new(
            MediaCache::open(
                config.cache_dir.clone(),
                config.storage_limit_bytes,
                config.storage_limit_days,
            )
            .await
            .context("no se pudo abrir el caché de medios")?,
        );
        let store =
            Arc::new(QueueStore::new(&config.data_dir).context("no se pudo abrir el almacén de colas")?);

        let autoplaylist = if config.enable_autoplaylist {
            match AutoplaylistManager::load(
                config.auto_playlist_file.clone(),
                config.auto_playlist_random,
                config.remove_from_ap_on_error,
            )
            .await
            {
                Ok(manager) => Some(Arc::new(TokioMutex::new(manager))),
                Err(e) => {
                    warn!("⚠️ Autoplaylist no disponible, continuando sin ella: {}", e);
                    None
                }
            }
        } else {
            None
        };

        let (notifications, notifications_rx) = mpsc::unbounded_channel();

        info!("🎵 Motor de reproducción listo");
        Ok((
            Self {
                config,
                gateway,
                cache,
                store,
                autoplaylist,
                players: DashMap::new(),
                notifications,
            },
            notifications_rx,
        ))
    }

    /// Asa del guild, creando su actor si no existe o ya terminó.
    ///
    /// El transporte solo se usa al crear; un guild ya activo conserva el
    /// suyo.
    pub async fn player_for(
        &self,
        guild_id: GuildId,
        transport: Arc<dyn VoiceTransport>,
    ) -> PlayerHandle {
        if let Some(existing) = self.players.get(&guild_id) {
            if !existing.is_closed() {
                return existing.clone();
            }
        }

        info!("🆕 Creando reproductor para guild {}", guild_id);
        let handle = GuildPlayer::spawn(
            guild_id,
            crate::audio::player::PlayerDeps {
                config: Arc::clone(&self.config),
                gateway: Arc::clone(&self.gateway),
                cache: Arc::clone(&self.cache),
                store: Arc::clone(&self.store),
                autoplaylist: self.autoplaylist.clone(),
                transport,
                notifications: self.notifications.clone(),
            },
        )
        .await;
        self.players.insert(guild_id, handle.clone());
        handle
    }

    /// Asa del guild si su actor sigue vivo
    pub fn player(&self, guild_id: GuildId) -> Option<PlayerHandle> {
        self.players
            .get(&guild_id)
            .filter(|handle| !handle.is_closed())
            .map(|handle| handle.clone())
    }

    /// Guilds con actor vivo
    pub fn active_guilds(&self) -> Vec<GuildId> {
        self.players
            .iter()
            .filter(|entry| !entry.value().is_closed())
            .map(|entry| *entry.key())
            .collect()
    }

    /// Termina la sesión de un guild; su cola queda persistida
    pub async fn leave(&self, guild_id: GuildId) -> Result<(), EngineError> {
        let Some((_, handle)) = self.players.remove(&guild_id) else {
            return Err(EngineError::NothingPlaying);
        };
        handle.stop().await
    }

    /// Apagado ordenado: detiene todos los actores, que persisten sus
    /// colas antes de cerrar
    pub async fn shutdown(&self) {
        info!("🛑 Apagando motor ({} guilds activos)", self.players.len());
        let handles: Vec<PlayerHandle> = self
            .players
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        self.players.clear();
        for handle in handles {
            if let Err(e) = handle.stop().await {
                warn!("Reproductor de guild {} ya cerrado: {}", handle.guild_id(), e);
            }
        }
    }

    pub fn cache(&self) -> &MediaCache {
        &self.cache
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ExtractError;
    use crate::sources::StreamDescriptor;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::time::Duration;

    struct StubExtractor;

    #[async_trait]
    impl MediaExtractor for StubExtractor {
        async fn resolve(&self, source: &str) -> Result<StreamDescriptor, ExtractError> {
            Ok(StreamDescriptor {
                stream_url: source.to_string(),
                title: source.to_string(),
                duration: Some(Duration::from_secs(1)),
                is_live: false,
            })
        }

        async fn download(&self, _d: &StreamDescriptor) -> Result<Bytes, ExtractError> {
            Ok(Bytes::from_static(&[0u8; 64]))
        }
    }

    struct StubTransport;

    #[async_trait]
    impl VoiceTransport for StubTransport {
        async fn send_frame(&self, _frame: Bytes) -> Result<(), EngineError> {
            Ok(())
        }

        async fn wait_disconnected(&self) {
            std::future::pending::<()>().await
        }

        async fn reconnect(&self) -> bool {
            true
        }

        fn eligible_listeners(&self) -> usize {
            1
        }
    }

    async fn engine() -> (JukeboxEngine, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            data_dir: dir.path().to_path_buf(),
            cache_dir: dir.path().join("cache"),
            ..Config::default()
        };
        let (engine, _rx) = JukeboxEngine::new(config, Arc::new(StubExtractor))
            .await
            .unwrap();
        (engine, dir)
    }

    #[tokio::test]
    async fn test_player_for_reuses_live_actor() {
        let (engine, _dir) = engine().await;
        let first = engine
            .player_for(GuildId(1), Arc::new(StubTransport))
            .await;
        let second = engine
            .player_for(GuildId(1), Arc::new(StubTransport))
            .await;
        assert!(!first.is_closed());
        assert_eq!(first.guild_id(), second.guild_id());
        assert_eq!(engine.active_guilds(), vec![GuildId(1)]);
    }

    #[tokio::test]
    async fn test_guilds_are_independent() {
        let (engine, _dir) = engine().await;
        engine.player_for(GuildId(1), Arc::new(StubTransport)).await;
        engine.player_for(GuildId(2), Arc::new(StubTransport)).await;

        let mut guilds = engine.active_guilds();
        guilds.sort_by_key(|g| g.0);
        assert_eq!(guilds, vec![GuildId(1), GuildId(2)]);

        engine.leave(GuildId(1)).await.unwrap();
        assert!(engine.player(GuildId(1)).is_none());
        assert!(engine.player(GuildId(2)).is_some());
    }

    #[tokio::test]
    async fn test_leave_unknown_guild_fails() {
        let (engine, _dir) = engine().await;
        assert!(matches!(
            engine.leave(GuildId(99)).await,
            Err(EngineError::NothingPlaying)
        ));
    }

    #[tokio::test]
    async fn test_shutdown_stops_all_players() {
        let (engine, _dir) = engine().await;
        let handle = engine
            .player_for(GuildId(1), Arc::new(StubTransport))
            .await;
        engine.shutdown().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(handle.is_closed());
        assert!(engine.active_guilds().is_empty());
    }

    #[tokio::test]
    async fn test_player_for_replaces_closed_actor() {
        let (engine, _dir) = engine().await;
        let first = engine
            .player_for(GuildId(1), Arc::new(StubTransport))
            .await;
        first.stop().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let second = engine
            .player_for(GuildId(1), Arc::new(StubTransport))
            .await;
        assert!(!second.is_closed());
    }
}
