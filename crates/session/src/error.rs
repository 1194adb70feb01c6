//! Gestion d'erreurs du contrôleur de session
//! 
//! Les intentions mal venues (enregistrer avant le handshake, enregistrer
//! deux fois) sont rejetées avec une raison lisible, jamais ignorées ni
//! fatales.

use audio::AudioError;
use network::{NetworkError, ProtocolState};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SessionError {
    /// Handshake non terminé
    #[error("Impossible d'enregistrer : handshake non terminé (état {0})")]
    NotReady(ProtocolState),
    
    /// Un enregistrement est déjà en cours
    #[error("Enregistrement déjà en cours")]
    AlreadyRecording,
    
    /// L'acteur de session est arrêté
    #[error("Session arrêtée")]
    Closed,
    
    #[error("Configuration invalide: {0}")]
    Config(String),
    
    #[error("Audio: {0}")]
    Audio(#[from] AudioError),
    
    #[error("Réseau: {0}")]
    Network(#[from] NetworkError),
}

impl SessionError {
    /// Vérifie si l'erreur est un rejet d'intention (l'état n'a pas changé)
    pub fn is_rejection(&self) -> bool {
        matches!(self, SessionError::NotReady(_) | SessionError::AlreadyRecording)
    }
}

pub type SessionResult<T> = Result<T, SessionError>;
