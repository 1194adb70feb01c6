//! Configuration de la session

use audio::AudioConfig;
use network::LiveConfig;
use serde::{Deserialize, Serialize};

/// Configuration complète d'une session
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Formats, files et périphériques audio
    pub audio: AudioConfig,
    
    /// Connexion au service distant
    pub live: LiveConfig,
    
    /// Diffère le démarrage de l'enregistrement tant qu'une réponse est jouée
    pub defer_recording_while_playing: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            audio: AudioConfig::default(),
            live: LiveConfig::default(),
            defer_recording_while_playing: true,
        }
    }
}

impl SessionConfig {
    /// Configuration pour tests
    pub fn test_config() -> Self {
        Self {
            audio: AudioConfig::test_config(),
            live: LiveConfig::test_config(),
            defer_recording_while_playing: true,
        }
    }
    
    /// Mode duplex : enregistrement et lecture simultanés
    pub fn duplex(mut self) -> Self {
        self.defer_recording_while_playing = false;
        self
    }
    
    pub fn validate(&self) -> Result<(), String> {
        self.audio.validate()?;
        self.live.validate()?;
        Ok(())
    }
}
