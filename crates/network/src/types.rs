//! Types de données pour le système networking
//! 
//! Ce module définit les structures principales pour la connexion au service
//! conversationnel :
//! - ProtocolState : états du protocole (handshake compris)
//! - ConnectionId : identité d'une connexion (protège des timers périmés)
//! - LiveConfig : configuration de la session distante
//! - ProtocolStats : statistiques et métriques

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// États du protocole
/// 
/// ```text
/// Disconnected → Connecting → AwaitingSetup → Ready → (Disconnected | Error)
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProtocolState {
    /// Aucune connexion
    Disconnected,
    
    /// Connexion en cours d'ouverture
    Connecting,
    
    /// Connexion ouverte, Setup envoyé, en attente d'acquittement
    AwaitingSetup,
    
    /// Handshake terminé (acquitté ou forcé par timeout)
    Ready,
    
    /// Connexion perdue ou erreur distante : reconnexion complète requise
    Error,
}

impl ProtocolState {
    /// Vérifie si une connexion existe (ouverte ou en cours d'ouverture)
    pub fn is_connected(&self) -> bool {
        matches!(
            self,
            ProtocolState::Connecting | ProtocolState::AwaitingSetup | ProtocolState::Ready
        )
    }
    
    pub fn is_ready(&self) -> bool {
        *self == ProtocolState::Ready
    }
    
    /// Description courte pour l'affichage
    pub fn description(&self) -> &'static str {
        match self {
            ProtocolState::Disconnected => "Déconnecté",
            ProtocolState::Connecting => "Connexion...",
            ProtocolState::AwaitingSetup => "Handshake...",
            ProtocolState::Ready => "Prêt",
            ProtocolState::Error => "Erreur",
        }
    }
}

impl fmt::Display for ProtocolState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Identité d'une connexion
/// 
/// Chaque `connect` crée un nouvel identifiant. Les événements et timers
/// étiquetés avec un ancien identifiant sont ignorés.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Encodage des chunks audio sortants
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioEncoding {
    /// Enveloppe JSON `realtimeInput.audio` avec payload base64
    #[default]
    Base64Json,
    
    /// Frame binaire brute (PCM little-endian)
    RawBinary,
}

/// Modalité de réponse demandée au service
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResponseModality {
    #[default]
    Audio,
    Text,
}

/// Configuration de la session distante
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LiveConfig {
    /// URL WebSocket du service
    pub endpoint: String,
    
    /// Clé d'API ajoutée en paramètre `key` de l'URL
    pub api_key: Option<String>,
    
    /// Identifiant du modèle
    pub model: String,
    
    /// Voix prédéfinie pour les réponses audio
    pub voice_name: String,
    
    /// Instruction système envoyée dans le Setup
    pub system_instruction: String,
    
    /// Modalité de réponse (AUDIO par défaut)
    pub response_modality: ResponseModality,
    
    /// Délai avant de forcer l'état Ready sans acquittement (défaut: 10s)
    pub handshake_timeout_ms: u64,
    
    /// Encodage des chunks audio sortants
    pub audio_encoding: AudioEncoding,
    
    /// Demande la transcription de l'audio envoyé
    pub input_transcription: bool,
    
    /// Demande la transcription de l'audio reçu
    pub output_transcription: bool,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            endpoint: "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent".to_string(),
            api_key: None,
            model: "models/gemini-2.0-flash-live-001".to_string(),
            voice_name: "Puck".to_string(),
            system_instruction: "Tu es un assistant vocal. Réponds brièvement et naturellement.".to_string(),
            response_modality: ResponseModality::Audio,
            handshake_timeout_ms: 10_000,
            audio_encoding: AudioEncoding::Base64Json,
            input_transcription: true,
            output_transcription: false,
        }
    }
}

impl LiveConfig {
    /// Configuration pour tests (endpoint local, pas de clé)
    pub fn test_config() -> Self {
        Self {
            endpoint: "ws://127.0.0.1:9001/live".to_string(),
            api_key: None,
            model: "models/test".to_string(),
            system_instruction: "test".to_string(),
            ..Default::default()
        }
    }
    
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
    
    /// URL complète de connexion (avec la clé si présente)
    pub fn connection_url(&self) -> String {
        match &self.api_key {
            Some(key) if !key.is_empty() => {
                let separator = if self.endpoint.contains('?') { '&' } else { '?' };
                format!("{}{}key={}", self.endpoint, separator, key)
            }
            _ => self.endpoint.clone(),
        }
    }
    
    /// Valide que la configuration est cohérente
    pub fn validate(&self) -> Result<(), String> {
        if !(self.endpoint.starts_with("ws://") || self.endpoint.starts_with("wss://")) {
            return Err(format!("Endpoint non WebSocket: {}", self.endpoint));
        }
        
        if self.model.trim().is_empty() {
            return Err("Modèle non renseigné".to_string());
        }
        
        if self.handshake_timeout_ms == 0 {
            return Err("Timeout de handshake nul".to_string());
        }
        
        Ok(())
    }
}

/// Statistiques du protocole
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolStats {
    pub connections_opened: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub audio_chunks_sent: u64,
    pub audio_chunks_dropped: u64,
    pub protocol_violations: u64,
    pub handshakes_acknowledged: u64,
    pub handshakes_forced: u64,
}

impl ProtocolStats {
    /// Résumé d'une ligne pour l'affichage en fin de session
    pub fn summary(&self) -> String {
        format!(
            "{} messages envoyés ({}), {} reçus ({}), audio {} envoyé(s) / {} perdu(s), {} violation(s)",
            self.messages_sent,
            human_bytes(self.bytes_sent),
            self.messages_received,
            human_bytes(self.bytes_received),
            self.audio_chunks_sent,
            self.audio_chunks_dropped,
            self.protocol_violations,
        )
    }
}

/// Taille lisible (base 1024)
fn human_bytes(bytes: u64) -> String {
    const KIB: f64 = 1024.0;
    match bytes as f64 {
        size if size >= KIB * KIB => format!("{:.1} Mio", size / (KIB * KIB)),
        size if size >= KIB => format!("{:.1} Kio", size / KIB),
        _ => format!("{} o", bytes),
    }
}
