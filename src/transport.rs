use async_trait::async_trait;
use bytes::Bytes;

use crate::error::EngineError;

/// Cliente de transporte de voz (colaborador externo).
///
/// El motor no conoce el protocolo del gateway de voz; solo necesita enviar
/// frames, enterarse de las desconexiones y pedir reconexión. Una instancia
/// corresponde a la sesión de voz de un guild.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait VoiceTransport: Send + Sync {
    /// Envía un frame de audio PCM al transporte.
    ///
    /// `Err(EngineError::ConnectionLost)` indica un corte que el supervisor
    /// de conexión va a gestionar; `Err(EngineError::Playback)` indica un
    /// error de stream que termina el track.
    async fn send_frame(&self, frame: Bytes) -> Result<(), EngineError>;

    /// Se resuelve cuando el transporte pierde la conexión
    async fn wait_disconnected(&self);

    /// Intenta restablecer la conexión; true si lo consigue
    async fn reconnect(&self) -> bool;

    /// Oyentes elegibles en el canal (excluye sordos e inactivos)
    fn eligible_listeners(&self) -> usize;
}
