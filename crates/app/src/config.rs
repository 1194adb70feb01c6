// Chargement de la configuration du client
//
// Ordre d'application : fichier TOML optionnel, puis surcharges issues de la
// ligne de commande et de l'environnement (.env compris).

use std::path::Path;

use anyhow::{Context, Result};
use session::SessionConfig;

/// Surcharges fournies par la ligne de commande
#[derive(Clone, Debug, Default)]
pub struct Overrides {
    pub api_key: Option<String>,
    pub endpoint: Option<String>,
    pub model: Option<String>,
    pub voice: Option<String>,
    pub input_device: Option<String>,
    pub output_device: Option<String>,
    pub duplex: bool,
}

/// Charge la configuration depuis un fichier TOML (défauts si absent)
pub fn load_file(path: Option<&Path>) -> Result<SessionConfig> {
    let Some(path) = path else {
        return Ok(SessionConfig::default());
    };
    
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("lecture de {}", path.display()))?;
    parse_toml(&text).with_context(|| format!("configuration invalide dans {}", path.display()))
}

fn parse_toml(text: &str) -> Result<SessionConfig> {
    Ok(toml::from_str(text)?)
}

/// Applique les surcharges puis valide le résultat
pub fn resolve(mut config: SessionConfig, overrides: Overrides) -> Result<SessionConfig> {
    if let Some(key) = overrides.api_key {
        config.live.api_key = Some(key);
    }
    if let Some(endpoint) = overrides.endpoint {
        config.live.endpoint = endpoint;
    }
    if let Some(model) = overrides.model {
        config.live.model = model;
    }
    if let Some(voice) = overrides.voice {
        config.live.voice_name = voice;
    }
    if overrides.input_device.is_some() {
        config.audio.input_device = overrides.input_device;
    }
    if overrides.output_device.is_some() {
        config.audio.output_device = overrides.output_device;
    }
    if overrides.duplex {
        config = config.duplex();
    }
    
    config.validate().map_err(anyhow::Error::msg)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    
    #[test]
    fn test_missing_file_gives_defaults() {
        let config = load_file(None).unwrap();
        assert_eq!(config, SessionConfig::default());
    }
    
    #[test]
    fn test_partial_toml() {
        let config = parse_toml(
            r#"
            defer_recording_while_playing = false

            [live]
            voice_name = "Kore"
            handshake_timeout_ms = 5000

            [audio]
            playback_grace_ms = 250
            "#,
        )
        .unwrap();
        
        assert_eq!(config.live.voice_name, "Kore");
        assert_eq!(config.live.handshake_timeout_ms, 5000);
        assert_eq!(config.audio.playback_grace_ms, 250);
        assert_eq!(config.audio.capture_format.sample_rate, 16000);
        assert!(!config.defer_recording_while_playing);
    }
    
    #[test]
    fn test_overrides_win_over_file() {
        let file = parse_toml("[live]\nvoice_name = \"Kore\"\n").unwrap();
        let config = resolve(
            file,
            Overrides {
                api_key: Some("secret".to_string()),
                voice: Some("Puck".to_string()),
                duplex: true,
                ..Default::default()
            },
        )
        .unwrap();
        
        assert_eq!(config.live.api_key.as_deref(), Some("secret"));
        assert_eq!(config.live.voice_name, "Puck");
        assert!(!config.defer_recording_while_playing);
    }
    
    #[test]
    fn test_invalid_endpoint_rejected() {
        let result = resolve(
            SessionConfig::default(),
            Overrides {
                endpoint: Some("http://example.com".to_string()),
                ..Default::default()
            },
        );
        assert!(result.is_err());
    }
}
