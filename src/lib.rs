//! Motor de reproducción de audio multi-guild.
//!
//! Cada guild tiene su propio actor de reproducción con cola, votación de
//! skip y reanudación tras reinicio; todos comparten el gateway de
//! extracción (con acoplamiento de resoluciones concurrentes), el caché de
//! medios en disco y la persistencia de colas. La integración concreta se
//! inyecta por los traits [`sources::MediaExtractor`] y
//! [`transport::VoiceTransport`].

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fmt;

pub mod audio;
pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod sources;
pub mod storage;
pub mod transport;

pub use audio::{EnqueueMode, Entry, PlayerHandle, PlayerNotification, PlayerState, QueuePage, VoteOutcome};
pub use config::Config;
pub use engine::JukeboxEngine;
pub use error::{EngineError, ExtractError};
pub use sources::{MediaExtractor, StreamDescriptor};
pub use storage::{QueueSnapshot, QueueStore};
pub use transport::VoiceTransport;

/// Identificador de guild (servidor)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GuildId(pub u64);

/// Identificador de usuario
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserId(pub u64);

impl fmt::Display for GuildId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Inicializa el logging global con el filtro de entorno habitual
pub fn init_tracing() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("open_jukebox=debug".parse()?),
        )
        .init();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_display_as_raw_numbers() {
        assert_eq!(GuildId(42).to_string(), "42");
        assert_eq!(UserId(7).to_string(), "7");
    }

    #[test]
    fn test_ids_serialize_transparent_enough() {
        let json = serde_json::to_string(&UserId(5)).unwrap();
        let back: UserId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, UserId(5));
    }
}
