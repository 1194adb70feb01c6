//! Traits abstraits pour le système networking
//! 
//! Ce module définit les interfaces de la connexion persistante :
//! - `Connector` : ouvre une connexion et y branche le flux d'événements
//! - `Connection` : handle d'envoi/fermeture d'une connexion ouverte
//!
//! Implémentations disponibles :
//! - `WebSocketConnector` : WebSocket réel avec tokio-tungstenite
//! - `SimulatedConnector` : connexion pilotée par les tests

use tokio::sync::mpsc;

use crate::{ConnectionId, NetworkResult, Payload};

/// Événement remonté par une connexion
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportEvent {
    /// La connexion est ouverte
    Open,
    
    /// Message reçu (texte ou binaire)
    Message(Payload),
    
    /// Erreur de transport (fatale pour la connexion)
    Error(String),
    
    /// Fermeture par le serveur ou perte de la connexion
    Close { code: u16, reason: String },
}

/// Événement étiqueté par l'identité de sa connexion
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionEvent {
    pub id: ConnectionId,
    pub event: TransportEvent,
}

/// Handle d'une connexion
/// 
/// `send` est un enfilage non bloquant : il ne doit jamais attendre le réseau.
pub trait Connection: Send + Sync {
    /// Envoie un message
    /// 
    /// # Erreurs
    /// - `NetworkError::ConnectionClosed` si la connexion n'est pas ouverte
    fn send(&self, payload: Payload) -> NetworkResult<()>;
    
    /// Ferme la connexion (idempotent)
    fn close(&self);
    
    /// Vérifie que la connexion est ouverte
    fn is_open(&self) -> bool;
}

/// Fabrique de connexions
pub trait Connector: Send + Sync {
    /// Démarre l'ouverture d'une connexion vers `url`
    /// 
    /// Retourne immédiatement. L'ouverture effective est signalée par un
    /// `TransportEvent::Open` (ou `Error`) sur `events`, étiqueté avec `id`.
    fn open(
        &self,
        id: ConnectionId,
        url: &str,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> NetworkResult<Box<dyn Connection>>;
    
    /// Description du connecteur pour les logs
    fn describe(&self) -> String {
        "Connecteur inconnu".to_string()
    }
}
