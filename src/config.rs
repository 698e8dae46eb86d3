use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    // Votación de skip
    pub skips_required: usize,
    pub skip_ratio: f64,

    // Caché de medios
    pub storage_limit_bytes: u64, // 0 = sin límite
    pub storage_limit_days: u32,  // 0 = sin límite
    pub storage_retain_autoplay: bool,

    // Cola
    pub persistent_queue: bool,
    pub pre_download_next_song: bool,
    pub round_robin_queue: bool,
    pub max_queue_size: usize,
    /// Si `play-now` devuelve el track interrumpido al frente de la cola
    /// (true) o lo descarta (false)
    pub play_now_requeue: bool,

    // Temporizadores de inactividad (0 = deshabilitado)
    pub leave_inactive_vc_timeout: u64, // segundos sin oyentes
    pub leave_player_inactive_for: u64, // segundos en Idle/Paused
    pub auto_pause: bool,

    // Autoplaylist
    pub enable_autoplaylist: bool,
    pub auto_playlist_random: bool,
    pub remove_from_ap_on_error: bool,
    pub auto_playlist_file: PathBuf,

    // Extracción
    pub blocked_sources: Vec<String>,
    pub extract_retry_attempts: u32,

    // Reconexión
    pub reconnect_attempts: u32,
    pub reconnect_max_delay_secs: u64,

    // Audio
    pub default_volume: f32,

    // Paths
    pub data_dir: PathBuf,
    pub cache_dir: PathBuf,
}

impl Config {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self {
            // Votación
            skips_required: std::env::var("SKIPS_REQUIRED")
                .unwrap_or_else(|_| "4".to_string())
                .parse()?,
            skip_ratio: std::env::var("SKIP_RATIO")
                .unwrap_or_else(|_| "0.5".to_string())
                .parse()?,

            // Caché
            storage_limit_bytes: std::env::var("STORAGE_LIMIT_BYTES")
                .unwrap_or_else(|_| "0".to_string())
                .parse()?,
            storage_limit_days: std::env::var("STORAGE_LIMIT_DAYS")
                .unwrap_or_else(|_| "0".to_string())
                .parse()?,
            storage_retain_autoplay: std::env::var("STORAGE_RETAIN_AUTOPLAY")
                .unwrap_or_else(|_| "true".to_string())
                .parse()?,

            // Cola
            persistent_queue: std::env::var("PERSISTENT_QUEUE")
                .unwrap_or_else(|_| "true".to_string())
                .parse()?,
            pre_download_next_song: std::env::var("PRE_DOWNLOAD_NEXT_SONG")
                .unwrap_or_else(|_| "false".to_string())
                .parse()?,
            round_robin_queue: std::env::var("ROUND_ROBIN_QUEUE")
                .unwrap_or_else(|_| "false".to_string())
                .parse()?,
            max_queue_size: std::env::var("MAX_QUEUE_SIZE")
                .unwrap_or_else(|_| "1000".to_string())
                .parse()?,
            play_now_requeue: std::env::var("PLAY_NOW_REQUEUE")
                .unwrap_or_else(|_| "true".to_string())
                .parse()?,

            // Temporizadores
            leave_inactive_vc_timeout: std::env::var("LEAVE_INACTIVE_VC_TIMEOUT")
                .unwrap_or_else(|_| "300".to_string())
                .parse()?,
            leave_player_inactive_for: std::env::var("LEAVE_PLAYER_INACTIVE_FOR")
                .unwrap_or_else(|_| "600".to_string())
                .parse()?,
            auto_pause: std::env::var("AUTO_PAUSE")
                .unwrap_or_else(|_| "true".to_string())
                .parse()?,

            // Autoplaylist
            enable_autoplaylist: std::env::var("ENABLE_AUTOPLAYLIST")
                .unwrap_or_else(|_| "false".to_string())
                .parse()?,
            auto_playlist_random: std::env::var("AUTO_PLAYLIST_RANDOM")
                .unwrap_or_else(|_| "true".to_string())
                .parse()?,
            remove_from_ap_on_error: std::env::var("REMOVE_FROM_AP_ON_ERROR")
                .unwrap_or_else(|_| "true".to_string())
                .parse()?,
            auto_playlist_file: std::env::var("AUTO_PLAYLIST_FILE")
                .unwrap_or_else(|_| "autoplaylist.txt".to_string())
                .into(),

            // Extracción
            blocked_sources: std::env::var("BLOCKED_SOURCES")
                .unwrap_or_default()
                .split(',')
                .map(|s| s.trim().to_lowercase())
                .filter(|s| !s.is_empty())
                .collect(),
            extract_retry_attempts: std::env::var("EXTRACT_RETRY_ATTEMPTS")
                .unwrap_or_else(|_| "3".to_string())
                .parse()?,

            // Reconexión
            reconnect_attempts: std::env::var("RECONNECT_ATTEMPTS")
                .unwrap_or_else(|_| "5".to_string())
                .parse()?,
            reconnect_max_delay_secs: std::env::var("RECONNECT_MAX_DELAY")
                .unwrap_or_else(|_| "30".to_string())
                .parse()?,

            // Audio
            default_volume: std::env::var("DEFAULT_VOLUME")
                .unwrap_or_else(|_| "0.5".to_string())
                .parse()?,

            // Paths
            data_dir: std::env::var("DATA_DIR")
                .unwrap_or_else(|_| "./data".to_string())
                .into(),
            cache_dir: std::env::var("CACHE_DIR")
                .unwrap_or_else(|_| "./cache".to_string())
                .into(),
        };

        // Create directories if they don't exist
        std::fs::create_dir_all(&config.data_dir)?;
        std::fs::create_dir_all(&config.cache_dir)?;

        // Validate configuration before returning
        config.validate()?;

        Ok(config)
    }

    /// Validates configuration values for correctness.
    ///
    /// Performs sanity checks on configuration values to catch
    /// common mistakes before any guild actor starts.
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.skip_ratio) {
            anyhow::bail!(
                "Skip ratio must be between 0.0 and 1.0, got: {}",
                self.skip_ratio
            );
        }

        if !(0.0..=1.0).contains(&self.default_volume) {
            anyhow::bail!(
                "Default volume must be between 0.0 and 1.0, got: {}",
                self.default_volume
            );
        }

        if self.max_queue_size == 0 {
            anyhow::bail!("Max queue size must be greater than 0");
        }

        if self.extract_retry_attempts == 0 {
            anyhow::bail!("Extract retry attempts must be greater than 0");
        }

        if self.reconnect_attempts == 0 {
            anyhow::bail!("Reconnect attempts must be greater than 0");
        }

        Ok(())
    }

    /// Temporizador de canal sin oyentes; None si está deshabilitado
    pub fn inactive_vc_timeout(&self) -> Option<Duration> {
        (self.leave_inactive_vc_timeout > 0)
            .then(|| Duration::from_secs(self.leave_inactive_vc_timeout))
    }

    /// Temporizador de reproductor parado; None si está deshabilitado
    pub fn player_inactive_timeout(&self) -> Option<Duration> {
        (self.leave_player_inactive_for > 0)
            .then(|| Duration::from_secs(self.leave_player_inactive_for))
    }

    /// Returns a summary of the current configuration for logging.
    pub fn summary(&self) -> String {
        format!(
            "Config Summary:\n  \
            Skip: {} votos o ratio {:.2}\n  \
            Cache: {} bytes, {} días, retain autoplay={}\n  \
            Queue: persistente={}, round-robin={}, pre-download={}, máx {}\n  \
            Timers: vc={}s, player={}s, auto-pause={}\n  \
            Autoplaylist: enabled={}, random={}, remove-on-error={}",
            self.skips_required,
            self.skip_ratio,
            self.storage_limit_bytes,
            self.storage_limit_days,
            self.storage_retain_autoplay,
            self.persistent_queue,
            self.round_robin_queue,
            self.pre_download_next_song,
            self.max_queue_size,
            self.leave_inactive_vc_timeout,
            self.leave_player_inactive_for,
            self.auto_pause,
            self.enable_autoplaylist,
            self.auto_playlist_random,
            self.remove_from_ap_on_error,
        )
    }
}

/// Default configuration values.
///
/// Used as fallbacks when environment variables are not provided.
impl Default for Config {
    fn default() -> Self {
        Self {
            // Votación
            skips_required: 4,
            skip_ratio: 0.5,

            // Caché
            storage_limit_bytes: 0,
            storage_limit_days: 0,
            storage_retain_autoplay: true,

            // Cola
            persistent_queue: true,
            pre_download_next_song: false,
            round_robin_queue: false,
            max_queue_size: 1000,
            play_now_requeue: true,

            // Temporizadores
            leave_inactive_vc_timeout: 300,
            leave_player_inactive_for: 600,
            auto_pause: true,

            // Autoplaylist
            enable_autoplaylist: false,
            auto_playlist_random: true,
            remove_from_ap_on_error: true,
            auto_playlist_file: "autoplaylist.txt".into(),

            // Extracción
            blocked_sources: Vec::new(),
            extract_retry_attempts: 3,

            // Reconexión
            reconnect_attempts: 5,
            reconnect_max_delay_secs: 30,

            // Audio
            default_volume: 0.5,

            // Paths
            data_dir: "./data".into(),
            cache_dir: "./cache".into(),
        }
    }
}
