//! Gestion d'erreurs pour le système audio
//! 
//! Ce module définit tous les types d'erreurs possibles côté audio :
//! configuration du périphérique, construction du convertisseur PCM,
//! conversion à la volée, lecture et stockage temporaire.
//!
//! Politique de propagation : les erreurs "par chunk" (conversion, format)
//! restent locales et ne doivent jamais interrompre une session de capture.

use thiserror::Error;

/// Énumération de toutes les erreurs possibles dans le système audio
#[derive(Error, Debug)]
pub enum AudioError {
    /// Aucun périphérique audio (microphone ou haut-parleurs) n'a été trouvé
    #[error("Aucun périphérique audio trouvé")]
    NoDeviceFound,
    
    /// Le périphérique refuse le format ou la catégorie demandée
    #[error("Configuration du périphérique refusée: {0}")]
    DeviceConfiguration(String),
    
    /// Seul le PCM 16 bits est supporté
    #[error("Profondeur de {0} bits non supportée (16 bits uniquement)")]
    UnsupportedBitDepth(u16),
    
    /// Format audio incohérent (sample rate nul, payload tronqué, etc.)
    #[error("Format audio invalide: {0}")]
    InvalidFormat(String),
    
    /// Le convertisseur ne peut pas être construit pour cette paire de formats
    #[error("Convertisseur impossible {from} → {to}: {reason}")]
    FormatConstruction { from: String, to: String, reason: String },
    
    /// La conversion a échoué à l'exécution (ou produit zéro frame)
    #[error("Conversion échouée: {0}")]
    ConversionFailure(String),
    
    /// Une capture est déjà en cours sur ce pipeline
    #[error("Capture déjà active")]
    CaptureAlreadyActive,
    
    /// Erreur du stream cpal (construction, démarrage, pause)
    #[error("Erreur stream audio: {0}")]
    Stream(String),
    
    /// Le chargement ou la lecture d'une ressource a échoué
    #[error("Erreur de lecture: {0}")]
    Playback(String),
    
    /// Erreur du stockage temporaire (écriture/suppression)
    #[error("Erreur stockage temporaire: {0}")]
    Scratch(String),
    
    /// Erreur d'encodage/décodage du conteneur WAV
    #[error("Erreur WAV: {0}")]
    Wav(#[from] hound::Error),
    
    #[error("Erreur IO: {0}")]
    Io(#[from] std::io::Error),
}

impl AudioError {
    /// Crée une erreur de construction de convertisseur avec contexte
    pub fn format_construction(
        from: impl std::fmt::Display,
        to: impl std::fmt::Display,
        reason: impl Into<String>,
    ) -> Self {
        Self::FormatConstruction {
            from: from.to_string(),
            to: to.to_string(),
            reason: reason.into(),
        }
    }
    
    /// Vérifie si l'erreur ne concerne qu'un seul chunk
    /// 
    /// Ces erreurs entraînent le drop du chunk, jamais l'arrêt de la capture.
    pub fn is_chunk_local(&self) -> bool {
        matches!(
            self,
            AudioError::FormatConstruction { .. }
                | AudioError::ConversionFailure(_)
                | AudioError::InvalidFormat(_)
        )
    }
}

impl From<cpal::BuildStreamError> for AudioError {
    fn from(err: cpal::BuildStreamError) -> Self {
        AudioError::Stream(format!("Erreur construction stream: {}", err))
    }
}

impl From<cpal::PlayStreamError> for AudioError {
    fn from(err: cpal::PlayStreamError) -> Self {
        AudioError::Stream(format!("Erreur démarrage stream: {}", err))
    }
}

impl From<cpal::PauseStreamError> for AudioError {
    fn from(err: cpal::PauseStreamError) -> Self {
        AudioError::Stream(format!("Erreur pause stream: {}", err))
    }
}

impl From<cpal::DefaultStreamConfigError> for AudioError {
    fn from(err: cpal::DefaultStreamConfigError) -> Self {
        AudioError::DeviceConfiguration(format!("Erreur config par défaut: {}", err))
    }
}

impl From<cpal::SupportedStreamConfigsError> for AudioError {
    fn from(err: cpal::SupportedStreamConfigsError) -> Self {
        AudioError::DeviceConfiguration(format!("Configs supportées indisponibles: {}", err))
    }
}

impl From<cpal::DevicesError> for AudioError {
    fn from(err: cpal::DevicesError) -> Self {
        AudioError::DeviceConfiguration(format!("Énumération des périphériques: {}", err))
    }
}

/// Type Result personnalisé pour notre crate
pub type AudioResult<T> = Result<T, AudioError>;
