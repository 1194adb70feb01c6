//! Périphériques et stockage simulés
//! 
//! Implémentations sans hardware des traits `InputDevice`, `OutputDevice`
//! et `ScratchStorage`, utilisées par les tests et par le mode démo.
//! Chaque simulateur expose un handle de contrôle partagé pour injecter des
//! frames, provoquer des pannes et inspecter ce qui s'est passé.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use crate::{
    AudioChunk, AudioError, AudioFormat, AudioResult, DeviceOptions, FrameCallback,
    InputDevice, OutputDevice, PlaybackCancel, ScratchHandle, ScratchStorage, TapHandle,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Default)]
struct InputState {
    callback: Option<FrameCallback>,
    tap: Option<TapHandle>,
    paused: bool,
    refuse_configuration: bool,
    starts: usize,
    stops: usize,
    last_options: Option<DeviceOptions>,
}

/// Micro simulé : les frames sont poussées par le test via `SimulatedInputControl`
pub struct SimulatedInputDevice {
    format: AudioFormat,
    state: Arc<Mutex<InputState>>,
    next_tap: u64,
}

/// Handle de contrôle d'un `SimulatedInputDevice`
#[derive(Clone)]
pub struct SimulatedInputControl {
    format: AudioFormat,
    state: Arc<Mutex<InputState>>,
}

impl SimulatedInputDevice {
    /// Crée un micro simulé qui livre des frames au format natif `format`
    pub fn new(format: AudioFormat) -> Self {
        Self {
            format,
            state: Arc::new(Mutex::new(InputState::default())),
            next_tap: 0,
        }
    }
    
    pub fn control(&self) -> SimulatedInputControl {
        SimulatedInputControl {
            format: self.format,
            state: Arc::clone(&self.state),
        }
    }
}

impl InputDevice for SimulatedInputDevice {
    fn configure(&mut self, options: &DeviceOptions) -> AudioResult<AudioFormat> {
        let mut state = lock(&self.state);
        state.last_options = Some(options.clone());
        if state.refuse_configuration {
            return Err(AudioError::DeviceConfiguration(
                "configuration refusée par le simulateur".to_string(),
            ));
        }
        Ok(self.format)
    }
    
    fn start_capture(&mut self, on_frame: FrameCallback) -> AudioResult<TapHandle> {
        let mut state = lock(&self.state);
        if state.tap.is_some() {
            return Err(AudioError::CaptureAlreadyActive);
        }
        
        self.next_tap += 1;
        let tap = TapHandle(self.next_tap);
        state.callback = Some(on_frame);
        state.tap = Some(tap);
        state.paused = false;
        state.starts += 1;
        Ok(tap)
    }
    
    fn pause_capture(&mut self, tap: TapHandle) -> AudioResult<()> {
        let mut state = lock(&self.state);
        if state.tap == Some(tap) {
            state.paused = true;
        }
        Ok(())
    }
    
    fn resume_capture(&mut self, tap: TapHandle) -> AudioResult<()> {
        let mut state = lock(&self.state);
        if state.tap == Some(tap) {
            state.paused = false;
        }
        Ok(())
    }
    
    fn stop_capture(&mut self, tap: TapHandle) -> AudioResult<()> {
        let mut state = lock(&self.state);
        if state.tap == Some(tap) {
            state.tap = None;
            state.callback = None;
            state.paused = false;
            state.stops += 1;
        }
        Ok(())
    }
    
    fn device_info(&self) -> String {
        format!("Micro simulé ({})", self.format)
    }
}

impl SimulatedInputControl {
    /// Livre un buffer brut au callback (ignoré si pas de tap ou en pause)
    /// 
    /// # Retourne
    /// `true` si le buffer a été livré
    pub fn push_chunk(&self, chunk: AudioChunk) -> bool {
        let mut state = lock(&self.state);
        if state.paused {
            return false;
        }
        match state.callback.as_mut() {
            Some(callback) => {
                callback(chunk);
                true
            }
            None => false,
        }
    }
    
    /// Livre `frames` frames de silence au format natif
    pub fn push_silence(&self, frames: usize) -> bool {
        self.push_chunk(AudioChunk::silence(self.format, frames))
    }
    
    /// Fait échouer (ou réussir) les prochains `configure`
    pub fn refuse_configuration(&self, refuse: bool) {
        lock(&self.state).refuse_configuration = refuse;
    }
    
    pub fn is_capturing(&self) -> bool {
        lock(&self.state).tap.is_some()
    }
    
    pub fn is_paused(&self) -> bool {
        lock(&self.state).paused
    }
    
    pub fn start_count(&self) -> usize {
        lock(&self.state).starts
    }
    
    pub fn stop_count(&self) -> usize {
        lock(&self.state).stops
    }
    
    pub fn last_options(&self) -> Option<DeviceOptions> {
        lock(&self.state).last_options.clone()
    }
}

#[derive(Debug, Default)]
struct OutputState {
    played: Mutex<Vec<ScratchHandle>>,
    failing: AtomicBool,
    active: AtomicUsize,
    max_concurrent: AtomicUsize,
    cancelled: AtomicUsize,
}

/// Haut-parleur simulé : chaque lecture dure `play_duration` (horloge tokio)
#[derive(Clone, Debug)]
pub struct SimulatedOutputDevice {
    play_duration: Duration,
    state: Arc<OutputState>,
}

impl SimulatedOutputDevice {
    pub fn new(play_duration: Duration) -> Self {
        Self {
            play_duration,
            state: Arc::new(OutputState::default()),
        }
    }
    
    /// Fait échouer (ou réussir) les lectures suivantes
    pub fn set_failing(&self, failing: bool) {
        self.state.failing.store(failing, Ordering::SeqCst);
    }
    
    pub fn played(&self) -> Vec<ScratchHandle> {
        lock(&self.state.played).clone()
    }
    
    pub fn played_count(&self) -> usize {
        lock(&self.state.played).len()
    }
    
    /// Nombre maximal de lectures simultanées observé
    pub fn max_concurrent(&self) -> usize {
        self.state.max_concurrent.load(Ordering::SeqCst)
    }
    
    /// Lectures arrêtées avant la fin par un `PlaybackCancel`
    pub fn cancelled_count(&self) -> usize {
        self.state.cancelled.load(Ordering::SeqCst)
    }
    
    pub fn active_count(&self) -> usize {
        self.state.active.load(Ordering::SeqCst)
    }
}

/// Décrémente le compteur de lectures actives, même si la tâche est annulée
struct ActiveGuard<'a>(&'a AtomicUsize);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl OutputDevice for SimulatedOutputDevice {
    async fn play(&self, resource: &ScratchHandle, cancel: &PlaybackCancel) -> AudioResult<()> {
        let active = self.state.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.max_concurrent.fetch_max(active, Ordering::SeqCst);
        let _guard = ActiveGuard(&self.state.active);
        
        tokio::select! {
            _ = tokio::time::sleep(self.play_duration) => {}
            _ = cancel.cancelled() => {
                self.state.cancelled.fetch_add(1, Ordering::SeqCst);
                return Ok(());
            }
        }
        
        if self.state.failing.load(Ordering::SeqCst) {
            return Err(AudioError::Playback("lecture simulée en échec".to_string()));
        }
        
        lock(&self.state.played).push(resource.clone());
        Ok(())
    }
    
    fn device_info(&self) -> String {
        "Haut-parleur simulé".to_string()
    }
}

#[derive(Debug, Default)]
struct StorageState {
    blobs: Mutex<HashMap<PathBuf, Vec<u8>>>,
    next_id: AtomicU64,
    deleted: AtomicUsize,
    fail_writes: AtomicBool,
}

/// Stockage temporaire en mémoire
#[derive(Clone, Debug, Default)]
pub struct MemoryScratchStorage {
    state: Arc<StorageState>,
}

impl MemoryScratchStorage {
    pub fn new() -> Self {
        Self::default()
    }
    
    /// Fait échouer (ou réussir) les écritures suivantes
    pub fn fail_writes(&self, fail: bool) {
        self.state.fail_writes.store(fail, Ordering::SeqCst);
    }
    
    pub fn contains(&self, handle: &ScratchHandle) -> bool {
        lock(&self.state.blobs).contains_key(&handle.path)
    }
    
    pub fn get(&self, handle: &ScratchHandle) -> Option<Vec<u8>> {
        lock(&self.state.blobs).get(&handle.path).cloned()
    }
    
    /// Nombre de blobs encore présents
    pub fn len(&self) -> usize {
        lock(&self.state.blobs).len()
    }
    
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
    
    pub fn deleted_count(&self) -> usize {
        self.state.deleted.load(Ordering::SeqCst)
    }
}

impl ScratchStorage for MemoryScratchStorage {
    fn write(&self, bytes: &[u8]) -> AudioResult<ScratchHandle> {
        if self.state.fail_writes.load(Ordering::SeqCst) {
            return Err(AudioError::Scratch("écriture simulée en échec".to_string()));
        }
        
        let id = self.state.next_id.fetch_add(1, Ordering::SeqCst);
        let path = PathBuf::from(format!("memory://scratch-{}.wav", id));
        lock(&self.state.blobs).insert(path.clone(), bytes.to_vec());
        Ok(ScratchHandle { path })
    }
    
    fn delete(&self, handle: &ScratchHandle) -> AudioResult<()> {
        match lock(&self.state.blobs).remove(&handle.path) {
            Some(_) => {
                self.state.deleted.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            None => Err(AudioError::Scratch(format!(
                "ressource inconnue : {}",
                handle.path.display()
            ))),
        }
    }
}
