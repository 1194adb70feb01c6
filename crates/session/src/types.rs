//! Types publics de la session

use audio::CaptureStats;
use network::{ProtocolState, ProtocolStats};
use serde::{Deserialize, Serialize};

/// Instantané de la session
/// 
/// Invariant : `recording` n'est vrai que si `state == Ready`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub state: ProtocolState,
    pub recording: bool,
    pub playing: bool,
    
    /// Un tour du modèle est en cours
    pub model_turn_active: bool,
    
    /// Tour local terminé, réponse attendue
    pub processing: bool,
    
    /// Un démarrage d'enregistrement attend la fin de la lecture
    pub recording_deferred: bool,
}

impl Session {
    /// Texte de statut court pour l'affichage
    pub fn status_line(&self) -> String {
        let mut status = self.state.description().to_string();
        if self.recording {
            status.push_str(" 🎤");
        }
        if self.playing {
            status.push_str(" 🔊");
        }
        if self.processing {
            status.push_str(" ⏳");
        }
        status
    }
}

/// Compteurs cumulés de la session
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStats {
    pub protocol: ProtocolStats,
    pub capture: CaptureStats,
}

impl SessionStats {
    /// Résumé capture pour l'affichage
    pub fn capture_summary(&self) -> String {
        let capture = &self.capture;
        format!(
            "{} chunk(s) capturé(s) dont {} silencieux, {} perdu(s), {} conversion(s) échouée(s)",
            capture.chunks_forwarded,
            capture.silent_chunks,
            capture.chunks_dropped,
            capture.conversion_failures,
        )
    }
}

/// Résultat d'une intention acceptée
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IntentOutcome {
    /// L'intention a été appliquée
    Done,
    
    /// Rien à faire (la raison est fournie)
    NoOp(String),
    
    /// Démarrage différé jusqu'à la fin de la lecture
    Deferred,
}

/// Événements publiés par la session
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionEvent {
    StateChanged(ProtocolState),
    
    /// Handshake terminé (`forced` si par timeout)
    Ready { forced: bool },
    
    RecordingStarted,
    RecordingStopped,
    
    /// Texte de réponse finale du modèle
    AnswerText(String),
    InputTranscription(String),
    OutputTranscription(String),
    
    /// Le modèle a terminé son tour
    ModelTurnComplete,
    Interrupted,
    
    PlaybackStarted { size_bytes: usize },
    PlaybackFinished,
    PlaybackFailed(String),
    
    /// Erreur périphérique ou conversion (la session continue)
    AudioError(String),
    
    /// Erreur signalée par le serveur
    ErrorNotice(String),
    TransportFailed(String),
    Closed { code: u16, reason: String },
    ProtocolViolation(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    
    #[test]
    fn test_status_line() {
        let session = Session {
            state: ProtocolState::Ready,
            recording: true,
            playing: false,
            model_turn_active: false,
            processing: false,
            recording_deferred: false,
        };
        assert_eq!(session.status_line(), "Prêt 🎤");
    }
    
    #[test]
    fn test_capture_summary() {
        let stats = SessionStats {
            capture: CaptureStats {
                chunks_forwarded: 50,
                silent_chunks: 48,
                chunks_dropped: 1,
                ..CaptureStats::default()
            },
            ..SessionStats::default()
        };
        assert_eq!(
            stats.capture_summary(),
            "50 chunk(s) capturé(s) dont 48 silencieux, 1 perdu(s), 0 conversion(s) échouée(s)"
        );
    }
}
