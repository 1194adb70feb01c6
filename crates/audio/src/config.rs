//! Configuration audio
//! 
//! Ce module définit les paramètres du pipeline duplex :
//! - le format canonique envoyé au service (capture)
//! - le format de l'audio reçu (lecture)
//! - les tailles de files et le délai de grâce avant suppression des
//!   ressources de lecture

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{AudioFormat, DeviceOptions};

/// Configuration principale du système audio
/// 
/// `#[derive(Serialize, Deserialize)]` permet de la charger depuis le
/// fichier TOML de l'application (section `[audio]`).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Format canonique des chunks envoyés (16 kHz mono par défaut)
    pub capture_format: AudioFormat,
    
    /// Format du PCM brut reçu du service (24 kHz mono par défaut)
    pub playback_format: AudioFormat,
    
    /// Capacité de la file callback → session, en chunks
    /// 
    /// File pleine = chunk perdu (pas de backlog illimité)
    pub capture_queue_capacity: usize,
    
    /// Délai avant de supprimer une ressource jouée (ms)
    /// 
    /// Évite de supprimer un fichier que le moteur de lecture référence encore.
    pub playback_grace_ms: u64,
    
    /// Microphone à utiliser (None = défaut système)
    pub input_device: Option<String>,
    
    /// Sortie à utiliser (None = défaut système)
    pub output_device: Option<String>,
    
    /// Sample rate natif souhaité pour le micro
    pub preferred_input_rate: Option<u32>,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            capture_format: AudioFormat::canonical_input(),
            playback_format: AudioFormat::canonical_output(),
            capture_queue_capacity: 32,     // ~32 buffers callback
            playback_grace_ms: 500,
            input_device: None,
            output_device: None,
            preferred_input_rate: None,
        }
    }
}

impl AudioConfig {
    /// Configuration pour tests (délais accélérés)
    pub fn test_config() -> Self {
        Self {
            capture_queue_capacity: 8,
            playback_grace_ms: 10,
            ..Default::default()
        }
    }
    
    /// Configuration faible latence (file plus courte, grâce réduite)
    pub fn low_latency() -> Self {
        Self {
            capture_queue_capacity: 8,
            playback_grace_ms: 200,
            ..Default::default()
        }
    }
    
    pub fn playback_grace(&self) -> Duration {
        Duration::from_millis(self.playback_grace_ms)
    }
    
    /// Options passées au périphérique de capture
    pub fn input_options(&self) -> DeviceOptions {
        DeviceOptions {
            device_name: self.input_device.clone(),
            preferred_sample_rate: self.preferred_input_rate,
            preferred_channels: None,
        }
    }
    
    /// Valide que la configuration est cohérente
    pub fn validate(&self) -> Result<(), String> {
        self.capture_format
            .validate()
            .map_err(|e| format!("Format de capture invalide: {}", e))?;
        self.playback_format
            .validate()
            .map_err(|e| format!("Format de lecture invalide: {}", e))?;
        
        if !self.capture_format.interleaved {
            return Err("Le format de capture canonique doit être entrelacé".to_string());
        }
        
        if self.capture_queue_capacity == 0 {
            return Err("Capacité de file de capture nulle".to_string());
        }
        
        if self.playback_grace_ms > 10_000 {
            return Err(format!(
                "Délai de grâce invalide: {}ms (max 10000)",
                self.playback_grace_ms
            ));
        }
        
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    
    #[test]
    fn test_default_config() {
        let config = AudioConfig::default();
        
        assert_eq!(config.capture_format.sample_rate, 16000);
        assert_eq!(config.playback_format.sample_rate, 24000);
        assert_eq!(config.playback_grace(), Duration::from_millis(500));
        assert!(config.validate().is_ok());
    }
    
    #[test]
    fn test_invalid_config() {
        let mut config = AudioConfig::default();
        
        config.capture_format.bit_depth = 24;
        assert!(config.validate().is_err());
        
        config.capture_format = AudioFormat::new(16000, 1, false);
        assert!(config.validate().is_err());
        
        config.capture_format = AudioFormat::canonical_input();
        config.capture_queue_capacity = 0;
        assert!(config.validate().is_err());
    }
    
    #[test]
    fn test_preset_configs() {
        assert!(AudioConfig::test_config().validate().is_ok());
        assert!(AudioConfig::low_latency().validate().is_ok());
        assert_eq!(AudioConfig::test_config().playback_grace_ms, 10);
    }
    
    #[test]
    fn test_partial_config_deserialization() {
        let config: AudioConfig = serde_json::from_str(
            r#"{ "playback_grace_ms": 250, "input_device": "USB Mic" }"#
        ).unwrap();
        
        assert_eq!(config.playback_grace_ms, 250);
        assert_eq!(config.input_options().device_name.as_deref(), Some("USB Mic"));
        assert_eq!(config.capture_format, AudioFormat::canonical_input());
    }
}
