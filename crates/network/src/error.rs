//! Gestion d'erreurs pour le système networking
//! 
//! Ce module définit toutes les erreurs possibles côté connexion et protocole.
//! Il suit les mêmes patterns que le module audio pour la cohérence du code.
//!
//! Deux familles :
//! - erreurs fatales à la connexion (transport) : passage en état Error,
//!   reconnexion complète obligatoire
//! - erreurs locales (message malformé, envoi hors état Ready) : le message
//!   est perdu, la connexion reste saine

use thiserror::Error;

/// Énumération de toutes les erreurs possibles dans le système réseau
#[derive(Error, Debug)]
pub enum NetworkError {
    /// Échec au niveau de la connexion persistante
    #[error("Erreur de transport: {0}")]
    Transport(String),
    
    /// La connexion a été fermée (localement ou par le serveur)
    #[error("Connexion fermée")]
    ConnectionClosed,
    
    /// Message entrant malformé ou inconnu
    #[error("Violation de protocole: {0}")]
    ProtocolViolation(String),
    
    /// Erreur lors de la sérialisation/désérialisation JSON
    #[error("Erreur de sérialisation: {0}")]
    Serialization(#[from] serde_json::Error),
    
    /// Payload audio base64 illisible
    #[error("Base64 invalide: {0}")]
    Base64(#[from] base64::DecodeError),
    
    /// Opération tentée alors que la connexion n'est pas dans le bon état
    #[error("Opération {operation} invalide dans l'état {current_state}")]
    InvalidState { operation: String, current_state: String },
    
    /// Envoi tenté avant la fin du handshake
    #[error("Handshake non terminé, message ignoré")]
    NotReady,
    
    /// Erreur de configuration réseau
    #[error("Configuration réseau invalide: {0}")]
    ConfigError(String),
}

/// Type Result personnalisé pour notre crate network
pub type NetworkResult<T> = Result<T, NetworkError>;

impl NetworkError {
    /// Crée une erreur d'état invalide avec contexte
    pub fn invalid_state(operation: &str, current_state: impl std::fmt::Display) -> Self {
        Self::InvalidState {
            operation: operation.to_string(),
            current_state: current_state.to_string(),
        }
    }
    
    /// Vérifie si l'erreur condamne la connexion courante
    pub fn is_fatal_to_connection(&self) -> bool {
        matches!(self, NetworkError::Transport(_) | NetworkError::ConnectionClosed)
    }
    
    /// Vérifie si l'erreur ne concerne qu'un seul message
    pub fn is_local(&self) -> bool {
        matches!(
            self,
            NetworkError::ProtocolViolation(_)
                | NetworkError::Serialization(_)
                | NetworkError::Base64(_)
                | NetworkError::NotReady
        )
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for NetworkError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        NetworkError::Transport(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    
    #[test]
    fn test_error_display() {
        let error = NetworkError::invalid_state("connect", "Ready");
        assert!(error.to_string().contains("connect"));
        assert!(error.to_string().contains("Ready"));
    }
    
    #[test]
    fn test_error_classification() {
        assert!(NetworkError::Transport("reset".to_string()).is_fatal_to_connection());
        assert!(NetworkError::ConnectionClosed.is_fatal_to_connection());
        assert!(!NetworkError::ProtocolViolation("x".to_string()).is_fatal_to_connection());
        
        assert!(NetworkError::ProtocolViolation("x".to_string()).is_local());
        assert!(NetworkError::NotReady.is_local());
        assert!(!NetworkError::Transport("reset".to_string()).is_local());
    }
    
    #[test]
    fn test_json_error_is_local() {
        let err: NetworkError = serde_json::from_str::<serde_json::Value>("{oops")
            .unwrap_err()
            .into();
        assert!(err.is_local());
    }
}
