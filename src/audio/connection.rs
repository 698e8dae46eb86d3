use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::audio::player::PlayerEvent;
use crate::transport::VoiceTransport;
use crate::GuildId;

/// Supervisor de la conexión de voz de un guild.
///
/// Observa el transporte y refleja sus cortes en el reproductor: al detectar
/// una desconexión emite `TransportLost` (el actor pasa a
/// `AwaitingReconnect` sin descartar la cola) y reintenta reconectar con
/// backoff exponencial acotado. Si los intentos se agotan, la sesión del
/// guild se declara muerta.
pub struct ConnectionSupervisor {
    guild_id: GuildId,
    transport: Arc<dyn VoiceTransport>,
    events: mpsc::UnboundedSender<PlayerEvent>,
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
}

impl ConnectionSupervisor {
    pub(crate) fn new(
        guild_id: GuildId,
        transport: Arc<dyn VoiceTransport>,
        events: mpsc::UnboundedSender<PlayerEvent>,
        max_attempts: u32,
        max_delay: Duration,
    ) -> Self {
        Self {
            guild_id,
            transport,
            events,
            max_attempts: max_attempts.max(1),
            base_delay: Duration::from_millis(500),
            max_delay,
        }
    }

    #[cfg(test)]
    fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    pub(crate) fn spawn(self, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move { self.run(cancel).await })
    }

    async fn run(self, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = self.transport.wait_disconnected() => {}
            }

            warn!("🔌 Transporte desconectado en guild {}", self.guild_id);
            let _ = self.events.send(PlayerEvent::TransportLost);

            if self.reconnect_with_backoff(&cancel).await {
                info!("✅ Transporte restablecido en guild {}", self.guild_id);
                let _ = self.events.send(PlayerEvent::TransportRestored);
            } else {
                if cancel.is_cancelled() {
                    return;
                }
                error!(
                    "❌ Reconexión agotada tras {} intentos en guild {}",
                    self.max_attempts, self.guild_id
                );
                let _ = self.events.send(PlayerEvent::ReconnectExhausted);
                return;
            }
        }
    }

    /// Reintenta la conexión hasta agotar los intentos permitidos
    async fn reconnect_with_backoff(&self, cancel: &CancellationToken) -> bool {
        for attempt in 1..=self.max_attempts {
            let delay = self
                .base_delay
                .saturating_mul(2u32.saturating_pow(attempt - 1))
                .min(self.max_delay);
            info!(
                "🔁 Reintento de conexión {}/{} para guild {} en {}",
                attempt,
                self.max_attempts,
                self.guild_id,
                humantime::format_duration(delay)
            );

            tokio::select! {
                _ = cancel.cancelled() => return false,
                _ = tokio::time::sleep(delay) => {}
            }

            let reconnected = tokio::select! {
                _ = cancel.cancelled() => return false,
                ok = self.transport.reconnect() => ok,
            };
            if reconnected {
                return true;
            }
            warn!(
                "⚠️ Reintento de conexión {} falló para guild {}",
                attempt, self.guild_id
            );
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::Notify;

    /// Transporte falso: una desconexión disparable y un número de
    /// reintentos que fallan antes de reconectar
    struct FlakyTransport {
        disconnect: Notify,
        attempts: AtomicU32,
        fail_first: u32,
    }

    impl FlakyTransport {
        fn new(fail_first: u32) -> Self {
            Self {
                disconnect: Notify::new(),
                attempts: AtomicU32::new(0),
                fail_first,
            }
        }
    }

    #[async_trait]
    impl VoiceTransport for FlakyTransport {
        async fn send_frame(&self, _frame: Bytes) -> Result<(), EngineError> {
            Ok(())
        }

        async fn wait_disconnected(&self) {
            self.disconnect.notified().await;
        }

        async fn reconnect(&self) -> bool {
            self.attempts.fetch_add(1, Ordering::SeqCst) >= self.fail_first
        }

        fn eligible_listeners(&self) -> usize {
            1
        }
    }

    fn supervisor(
        transport: Arc<FlakyTransport>,
        attempts: u32,
    ) -> (
        ConnectionSupervisor,
        mpsc::UnboundedReceiver<PlayerEvent>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sup = ConnectionSupervisor::new(
            GuildId(1),
            transport,
            tx,
            attempts,
            Duration::from_millis(10),
        )
        .with_base_delay(Duration::from_millis(1));
        (sup, rx)
    }

    #[tokio::test]
    async fn test_disconnect_then_successful_reconnect() {
        let transport = Arc::new(FlakyTransport::new(1));
        let (sup, mut rx) = supervisor(transport.clone(), 5);
        let cancel = CancellationToken::new();
        let handle = sup.spawn(cancel.clone());

        transport.disconnect.notify_one();

        assert!(matches!(rx.recv().await, Some(PlayerEvent::TransportLost)));
        assert!(matches!(
            rx.recv().await,
            Some(PlayerEvent::TransportRestored)
        ));
        // Un fallo y una reconexión exitosa
        assert_eq!(transport.attempts.load(Ordering::SeqCst), 2);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_exhausted_attempts_end_session() {
        let transport = Arc::new(FlakyTransport::new(u32::MAX));
        let (sup, mut rx) = supervisor(transport.clone(), 3);
        let handle = sup.spawn(CancellationToken::new());

        transport.disconnect.notify_one();

        assert!(matches!(rx.recv().await, Some(PlayerEvent::TransportLost)));
        assert!(matches!(
            rx.recv().await,
            Some(PlayerEvent::ReconnectExhausted)
        ));
        assert_eq!(transport.attempts.load(Ordering::SeqCst), 3);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_stops_supervision() {
        let transport = Arc::new(FlakyTransport::new(0));
        let (sup, mut rx) = supervisor(transport, 3);
        let cancel = CancellationToken::new();
        let handle = sup.spawn(cancel.clone());

        cancel.cancel();
        handle.await.unwrap();
        assert!(rx.recv().await.is_none());
    }
}
