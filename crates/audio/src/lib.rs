//! Crate audio pour Parlo - Client vocal duplex temps réel
//! 
//! Ce crate gère toute la chaîne audio :
//! - Conversion PCM (rééchantillonnage, canaux, entrelacement)
//! - Capture microphone avec cpal
//! - Lecture séquentielle des réponses avec cpal
//! - Stockage temporaire des ressources jouables
//! - Périphériques simulés pour les tests

pub mod config;      // Configuration audio
pub mod types;       // Types de données (AudioFormat, AudioChunk)
pub mod traits;      // Traits abstraits
pub mod convert;     // Moteur de conversion PCM
pub mod capture;     // Pipeline de capture + micro cpal
pub mod playback;    // Pipeline de lecture + sortie cpal
pub mod storage;     // Stockage temporaire sur disque
pub mod sim;         // Périphériques simulés
pub mod error;       // Gestion d'erreurs

// Réexports pour faciliter l'utilisation
pub use config::*;
pub use types::*;
pub use traits::*;
pub use error::*;
pub use convert::PcmConverter;

// Réexports des implémentations principales
pub use capture::{CaptureEvent, CaptureStats, CapturePipeline, CpalInputDevice};
pub use playback::{CpalOutputDevice, PlaybackEvent, PlaybackHandle, PlaybackPipeline, PlaybackQueueEntry};
pub use storage::FsScratchStorage;
