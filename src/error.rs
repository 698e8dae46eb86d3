use thiserror::Error;

/// Resultado de una extracción fallida.
///
/// El backend de extracción puede fallar de forma permanente (la fuente no
/// existe o está bloqueada por política) o de forma transitoria (red caída,
/// timeout). Los fallos transitorios se reintentan en el gateway antes de
/// llegar al reproductor.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExtractError {
    /// La fuente no se puede reproducir nunca (borrada, privada, inválida)
    #[error("fuente no reproducible: {0}")]
    Unplayable(String),

    /// La fuente coincide con la lista de bloqueo
    #[error("fuente bloqueada por política: {0}")]
    Blocked(String),

    /// Fallo de red o timeout; reintentarlo puede funcionar
    #[error("fallo transitorio de extracción: {0}")]
    Transient(String),
}

impl ExtractError {
    /// Un fallo permanente nunca se reintenta
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::Unplayable(_) | Self::Blocked(_))
    }

    /// Clase del fallo para notificaciones al usuario
    pub fn reason_class(&self) -> &'static str {
        match self {
            Self::Unplayable(_) => "no reproducible",
            Self::Blocked(_) => "bloqueada",
            Self::Transient(_) => "fallo de red",
        }
    }
}

/// Errores del motor de reproducción.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Error de decodificación o de stream a mitad de un track
    #[error("fallo de reproducción: {0}")]
    Playback(String),

    /// E/S de caché fallida; nunca aborta la reproducción
    #[error("error de E/S de caché: {0}")]
    CacheIo(#[from] std::io::Error),

    #[error("conexión de voz perdida")]
    ConnectionLost,

    #[error("velocidad {0} fuera de rango (válido 0.5 a 100.0)")]
    InvalidSpeed(f64),

    #[error("volumen {0} fuera de rango (válido 0.0 a 1.0)")]
    InvalidVolume(f32),

    #[error("posición {0} fuera de rango")]
    OutOfRange(usize),

    #[error("salto a {0:.1}s fuera de la duración del track")]
    InvalidSeek(f64),

    #[error("la cola está llena (máximo {0} canciones)")]
    QueueFull(usize),

    #[error("no hay ningún track reproduciéndose")]
    NothingPlaying,

    /// El actor del guild ya terminó; ningún comando puede procesarse
    #[error("el reproductor está detenido")]
    Stopped,
}

impl EngineError {
    pub fn playback(msg: impl Into<String>) -> Self {
        Self::Playback(msg.into())
    }
}
