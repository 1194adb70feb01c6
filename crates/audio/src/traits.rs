//! Traits abstraits pour le système audio
//! 
//! Ce module définit les interfaces que doivent implémenter les
//! collaborateurs externes du pipeline audio :
//! - `InputDevice` : périphérique qui livre des frames brutes via un callback
//! - `OutputDevice` : périphérique qui joue une ressource matérialisée
//! - `ScratchStorage` : stockage temporaire servant de pont vers la lecture
//!
//! Chaque trait a une implémentation réelle (cpal, système de fichiers) et
//! une implémentation simulée dans `sim` pour les tests sans hardware.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::{AudioChunk, AudioFormat, AudioResult};

/// Callback appelé pour chaque buffer brut livré par le périphérique
/// 
/// Il est exécuté sur le thread temps réel du périphérique : il ne doit
/// jamais bloquer.
pub type FrameCallback = Box<dyn FnMut(AudioChunk) + Send + 'static>;

/// Options de configuration du périphérique
/// 
/// Équivalent du "audio device configuration" : un appel boîte noire qui
/// réussit ou échoue.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeviceOptions {
    /// Nom du périphérique (None = périphérique par défaut)
    pub device_name: Option<String>,
    
    /// Sample rate souhaité si le périphérique le supporte
    pub preferred_sample_rate: Option<u32>,
    
    /// Nombre de canaux souhaité si le périphérique le supporte
    pub preferred_channels: Option<u16>,
}

/// Handle d'un tap installé sur un périphérique d'entrée
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TapHandle(pub u64);

/// Ressource matérialisée dans le stockage temporaire
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ScratchHandle {
    /// Chemin unique généré par le stockage
    pub path: PathBuf,
}

/// Trait pour un périphérique de capture
/// 
/// # Contrat
/// - `configure` retourne le format natif que le périphérique livrera
/// - `start_capture` installe le tap et démarre le moteur audio
/// - `stop_capture` garantit que le tap est détaché et le moteur arrêté
///   avant de retourner
/// - `pause_capture` / `resume_capture` conservent le tap installé
pub trait InputDevice: Send {
    /// Configure le périphérique et retourne son format natif
    /// 
    /// # Erreurs
    /// - `AudioError::DeviceConfiguration` : format ou catégorie refusés
    /// - `AudioError::NoDeviceFound` : aucun microphone
    fn configure(&mut self, options: &DeviceOptions) -> AudioResult<AudioFormat>;
    
    /// Installe le tap et démarre la livraison des frames
    fn start_capture(&mut self, on_frame: FrameCallback) -> AudioResult<TapHandle>;
    
    /// Suspend la livraison sans détacher le tap
    fn pause_capture(&mut self, tap: TapHandle) -> AudioResult<()>;
    
    /// Reprend la livraison après une pause
    fn resume_capture(&mut self, tap: TapHandle) -> AudioResult<()>;
    
    /// Détache le tap et arrête le moteur
    fn stop_capture(&mut self, tap: TapHandle) -> AudioResult<()>;
    
    /// Retourne des informations sur le périphérique utilisé
    fn device_info(&self) -> String {
        "Périphérique inconnu".to_string()
    }
}

/// Signal d'arrêt d'une lecture en cours
/// 
/// Lisible depuis un thread bloquant (`is_cancelled`) comme depuis une
/// tâche async (`cancelled`). Les clones partagent le même signal.
#[derive(Clone, Debug)]
pub struct PlaybackCancel {
    sender: Arc<watch::Sender<bool>>,
    receiver: watch::Receiver<bool>,
}

impl PlaybackCancel {
    pub fn new() -> Self {
        let (sender, receiver) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
            receiver,
        }
    }
    
    /// Demande l'arrêt ; idempotent
    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }
    
    pub fn is_cancelled(&self) -> bool {
        *self.receiver.borrow()
    }
    
    /// Se termine dès que l'arrêt est demandé
    pub async fn cancelled(&self) {
        let mut receiver = self.receiver.clone();
        let _ = receiver.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for PlaybackCancel {
    fn default() -> Self {
        Self::new()
    }
}

/// Trait pour un périphérique de lecture
/// 
/// `play` se termine quand la ressource a été jouée en entier, quand
/// `cancel` est déclenché (retour `Ok`, la sortie est libérée), ou en
/// erreur si le chargement/la lecture échoue.
#[async_trait]
pub trait OutputDevice: Send + Sync {
    /// Joue une ressource jusqu'au bout ou jusqu'à l'arrêt demandé
    /// 
    /// # Erreurs
    /// - `AudioError::Playback` : ressource illisible ou lecture interrompue
    async fn play(&self, resource: &ScratchHandle, cancel: &PlaybackCancel) -> AudioResult<()>;
    
    /// Retourne des informations sur le périphérique de sortie
    fn device_info(&self) -> String {
        "Périphérique de sortie inconnu".to_string()
    }
}

/// Trait pour le stockage temporaire durable (écriture puis suppression)
pub trait ScratchStorage: Send + Sync {
    /// Écrit un blob sous un nom unique généré
    fn write(&self, bytes: &[u8]) -> AudioResult<ScratchHandle>;
    
    /// Supprime un blob précédemment écrit
    fn delete(&self, handle: &ScratchHandle) -> AudioResult<()>;
}
