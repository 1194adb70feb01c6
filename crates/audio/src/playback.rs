//! Pipeline de lecture audio
//! 
//! Ce module contient :
//! - `PlaybackPipeline` : acteur tokio qui accumule les payloads audio reçus,
//!   les matérialise en ressource jouable et les joue un par un
//! - `CpalOutputDevice` : implémentation de `OutputDevice` avec cpal
//!
//! # Cycle de vie d'une entrée
//! 
//! 1. Les payloads reçus pendant qu'une lecture est en cours sont accumulés
//! 2. À la fin de la lecture, ils sont concaténés dans l'ordre d'arrivée
//! 3. Le buffer est enveloppé dans un en-tête WAV (sauf s'il en a déjà un)
//! 4. La ressource est écrite dans le stockage temporaire puis jouée
//! 5. Après un délai de grâce, la ressource est supprimée
//!
//! À l'arrêt, la lecture courante reçoit un `PlaybackCancel` : le
//! périphérique libère sa sortie, puis la ressource suit le même délai de
//! grâce avant suppression.
//!
//! Une seule lecture à la fois : jamais de lecture concurrente.

use std::io::Cursor;
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, FromSample, Sample, SampleFormat, SizedSample, Stream, StreamConfig};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::capture::find_device;
use crate::{
    AudioChunk, AudioError, AudioFormat, AudioResult, OutputDevice, PcmConverter,
    PlaybackCancel, ScratchHandle, ScratchStorage,
};

/// Attente maximale d'un périphérique après une demande d'arrêt
const RELEASE_TIMEOUT: Duration = Duration::from_secs(2);

/// Période de vérification de l'arrêt pendant une lecture cpal
const CANCEL_POLL: Duration = Duration::from_millis(50);

/// Événements émis par le pipeline de lecture
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PlaybackEvent {
    /// Une entrée commence à jouer
    Started { size_bytes: usize },
    
    /// L'entrée courante a été jouée jusqu'au bout
    Finished,
    
    /// Matérialisation ou lecture échouée (l'indicateur de lecture est levé)
    Failed(String),
}

/// Entrée matérialisée en cours de lecture
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlaybackQueueEntry {
    pub resource: ScratchHandle,
    pub created_at: SystemTime,
    pub size_bytes: usize,
}

enum PlaybackCommand {
    Enqueue(Vec<u8>),
    DiscardPending,
    Shutdown(oneshot::Sender<()>),
}

/// Handle pour piloter le pipeline de lecture
/// 
/// Clonable, utilisable depuis n'importe quelle tâche.
#[derive(Clone, Debug)]
pub struct PlaybackHandle {
    commands: mpsc::UnboundedSender<PlaybackCommand>,
}

impl PlaybackHandle {
    /// Ajoute un payload audio à la file
    /// 
    /// # Erreurs
    /// - `AudioError::Playback` si le pipeline est arrêté
    pub fn enqueue(&self, payload: Vec<u8>) -> AudioResult<()> {
        self.commands
            .send(PlaybackCommand::Enqueue(payload))
            .map_err(|_| AudioError::Playback("pipeline de lecture arrêté".to_string()))
    }
    
    /// Jette les payloads en attente (la lecture courante continue)
    pub fn discard_pending(&self) {
        let _ = self.commands.send(PlaybackCommand::DiscardPending);
    }
    
    /// Arrête la lecture courante, libère sa ressource et termine l'acteur
    pub async fn shutdown(&self) {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.commands.send(PlaybackCommand::Shutdown(reply_tx)).is_ok() {
            let _ = reply_rx.await;
        }
    }
}

struct ActivePlayback {
    entry: PlaybackQueueEntry,
    cancel: PlaybackCancel,
    task: JoinHandle<AudioResult<()>>,
}

/// Acteur de lecture (propriétaire unique de l'entrée courante)
pub struct PlaybackPipeline {
    output: Arc<dyn OutputDevice>,
    storage: Arc<dyn ScratchStorage>,
    format: AudioFormat,
    grace: Duration,
    pending: Vec<Vec<u8>>,
    current: Option<ActivePlayback>,
    events: mpsc::UnboundedSender<PlaybackEvent>,
}

impl PlaybackPipeline {
    /// Lance l'acteur de lecture sur le runtime tokio courant
    /// 
    /// # Arguments
    /// * `output` - Périphérique de sortie
    /// * `storage` - Stockage temporaire des ressources
    /// * `format` - Format des payloads PCM bruts reçus
    /// * `grace` - Délai avant suppression d'une ressource jouée
    /// 
    /// # Retourne
    /// Le handle de commande et le flux d'événements de lecture
    pub fn spawn(
        output: Arc<dyn OutputDevice>,
        storage: Arc<dyn ScratchStorage>,
        format: AudioFormat,
        grace: Duration,
    ) -> (PlaybackHandle, mpsc::UnboundedReceiver<PlaybackEvent>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        
        let pipeline = Self {
            output,
            storage,
            format,
            grace,
            pending: Vec::new(),
            current: None,
            events: event_tx,
        };
        tokio::spawn(pipeline.run(command_rx));
        
        (PlaybackHandle { commands: command_tx }, event_rx)
    }
    
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<PlaybackCommand>) {
        debug!("🔊 Pipeline de lecture démarré ({})", self.format);
        
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(PlaybackCommand::Enqueue(payload)) => {
                        if payload.is_empty() {
                            continue;
                        }
                        self.pending.push(payload);
                        self.start_next();
                    }
                    Some(PlaybackCommand::DiscardPending) => {
                        if !self.pending.is_empty() {
                            debug!("🗑️  {} payload(s) en attente jeté(s)", self.pending.len());
                        }
                        self.pending.clear();
                    }
                    Some(PlaybackCommand::Shutdown(reply)) => {
                        self.release_current().await;
                        let _ = reply.send(());
                        break;
                    }
                    None => {
                        self.release_current().await;
                        break;
                    }
                },
                result = wait_current(&mut self.current) => {
                    self.finish_current(result);
                    self.start_next();
                }
            }
        }
        
        debug!("🛑 Pipeline de lecture arrêté");
    }
    
    /// Démarre l'entrée suivante si aucune lecture n'est en cours
    fn start_next(&mut self) {
        if self.current.is_some() || self.pending.is_empty() {
            return;
        }
        
        let buffer = coalesce(std::mem::take(&mut self.pending));
        let size_bytes = buffer.len();
        
        let resource = match materialize(&buffer, self.format)
            .and_then(|bytes| self.storage.write(&bytes))
        {
            Ok(resource) => resource,
            Err(e) => {
                warn!("⚠️  Matérialisation audio échouée : {}", e);
                self.emit(PlaybackEvent::Failed(e.to_string()));
                return;
            }
        };
        
        let entry = PlaybackQueueEntry {
            resource: resource.clone(),
            created_at: SystemTime::now(),
            size_bytes,
        };
        
        let output = Arc::clone(&self.output);
        let cancel = PlaybackCancel::new();
        let signal = cancel.clone();
        let task = tokio::spawn(async move { output.play(&resource, &signal).await });
        
        info!("🔊 Lecture de {} octets", size_bytes);
        self.current = Some(ActivePlayback { entry, cancel, task });
        self.emit(PlaybackEvent::Started { size_bytes });
    }
    
    fn finish_current(&mut self, result: Result<AudioResult<()>, tokio::task::JoinError>) {
        let Some(active) = self.current.take() else {
            return;
        };
        
        match result {
            Ok(Ok(())) => {
                debug!("✅ Lecture terminée");
                self.emit(PlaybackEvent::Finished);
            }
            Ok(Err(e)) => {
                warn!("⚠️  Lecture échouée : {}", e);
                self.emit(PlaybackEvent::Failed(e.to_string()));
            }
            Err(e) => {
                error!("❌ Tâche de lecture interrompue : {}", e);
                self.emit(PlaybackEvent::Failed(e.to_string()));
            }
        }
        
        self.schedule_delete(active.entry.resource);
    }
    
    /// Supprime la ressource après le délai de grâce
    fn schedule_delete(&self, resource: ScratchHandle) -> JoinHandle<()> {
        let storage = Arc::clone(&self.storage);
        let grace = self.grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if let Err(e) = storage.delete(&resource) {
                warn!("⚠️  Suppression de {:?} échouée : {}", resource.path, e);
            }
        })
    }
    
    /// Arrête la lecture courante puis supprime sa ressource après le délai de grâce
    /// 
    /// Retourne une fois le périphérique libéré et la ressource supprimée.
    async fn release_current(&mut self) {
        self.pending.clear();
        let Some(active) = self.current.take() else {
            return;
        };
        
        active.cancel.cancel();
        match tokio::time::timeout(RELEASE_TIMEOUT, active.task).await {
            Ok(Ok(Ok(()))) => debug!("🔇 Lecture arrêtée"),
            Ok(Ok(Err(e))) => debug!("🔇 Lecture arrêtée en erreur : {}", e),
            Ok(Err(e)) => warn!("⚠️  Tâche de lecture interrompue : {}", e),
            Err(_) => warn!("⚠️  Sortie audio toujours active après {:?}", RELEASE_TIMEOUT),
        }
        self.emit(PlaybackEvent::Finished);
        
        if let Err(e) = self.schedule_delete(active.entry.resource).await {
            warn!("⚠️  Libération de la ressource échouée : {}", e);
        }
    }
    
    fn emit(&self, event: PlaybackEvent) {
        let _ = self.events.send(event);
    }
}

async fn wait_current(
    current: &mut Option<ActivePlayback>,
) -> Result<AudioResult<()>, tokio::task::JoinError> {
    match current {
        Some(active) => (&mut active.task).await,
        None => std::future::pending().await,
    }
}

/// Concatène les payloads dans l'ordre d'arrivée
fn coalesce(payloads: Vec<Vec<u8>>) -> Vec<u8> {
    let total = payloads.iter().map(Vec::len).sum();
    let mut buffer = Vec::with_capacity(total);
    for payload in payloads {
        buffer.extend_from_slice(&payload);
    }
    buffer
}

/// Enveloppe un buffer PCM brut dans un en-tête WAV
/// 
/// Un buffer qui commence déjà par `RIFF` est auto-descriptif et
/// retourné tel quel.
pub fn materialize(buffer: &[u8], format: AudioFormat) -> AudioResult<Vec<u8>> {
    if buffer.starts_with(b"RIFF") {
        return Ok(buffer.to_vec());
    }
    
    let frame_bytes = format.bytes_per_frame();
    let usable = buffer.len() - buffer.len() % frame_bytes;
    if usable != buffer.len() {
        warn!("⚠️  {} octet(s) de fin ignoré(s)", buffer.len() - usable);
    }
    
    let chunk = AudioChunk::from_bytes(format, buffer[..usable].to_vec())?;
    
    let spec = hound::WavSpec {
        channels: format.channels,
        sample_rate: format.sample_rate,
        bits_per_sample: format.bit_depth,
        sample_format: hound::SampleFormat::Int,
    };
    
    let mut cursor = Cursor::new(Vec::with_capacity(usable + 44));
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)?;
        for sample in chunk.samples() {
            writer.write_sample(sample)?;
        }
        writer.finalize()?;
    }
    
    Ok(cursor.into_inner())
}

/// Périphérique de lecture cpal
/// 
/// Décode la ressource WAV, l'adapte au format natif du périphérique via
/// `PcmConverter` et bloque (sur un thread `spawn_blocking`) jusqu'à ce
/// que tous les échantillons aient été consommés.
#[derive(Clone, Debug, Default)]
pub struct CpalOutputDevice {
    device_name: Option<String>,
}

impl CpalOutputDevice {
    pub fn new(device_name: Option<String>) -> Self {
        Self { device_name }
    }
}

#[async_trait]
impl OutputDevice for CpalOutputDevice {
    async fn play(&self, resource: &ScratchHandle, cancel: &PlaybackCancel) -> AudioResult<()> {
        let resource = resource.clone();
        let device_name = self.device_name.clone();
        let cancel = cancel.clone();
        
        tokio::task::spawn_blocking(move || play_blocking(&resource, device_name.as_deref(), &cancel))
            .await
            .map_err(|e| AudioError::Playback(format!("thread de lecture : {}", e)))?
    }
    
    fn device_info(&self) -> String {
        self.device_name
            .clone()
            .unwrap_or_else(|| "Sortie par défaut".to_string())
    }
}

fn play_blocking(
    resource: &ScratchHandle,
    device_name: Option<&str>,
    cancel: &PlaybackCancel,
) -> AudioResult<()> {
    let mut reader = hound::WavReader::open(&resource.path)?;
    let spec = reader.spec();
    
    if spec.sample_format != hound::SampleFormat::Int || spec.bits_per_sample != 16 {
        return Err(AudioError::UnsupportedBitDepth(spec.bits_per_sample));
    }
    
    let samples = reader
        .samples::<i16>()
        .collect::<Result<Vec<_>, _>>()?;
    let source = AudioFormat::new(spec.sample_rate, spec.channels, true);
    let chunk = AudioChunk::from_samples(source, &samples)?;
    if chunk.is_empty() {
        return Ok(());
    }
    
    let host = cpal::default_host();
    let device = match device_name {
        Some(name) => find_device(host.output_devices()?, name)?,
        None => host.default_output_device().ok_or(AudioError::NoDeviceFound)?,
    };
    
    let supported = device.default_output_config()?;
    let device_format = AudioFormat::new(supported.sample_rate(), supported.channels(), true);
    let mut converter = PcmConverter::new(source, device_format)?;
    let converted = converter.convert_clip(chunk)?;
    let duration = converted.duration();
    
    let (done_tx, done_rx) = std_mpsc::channel();
    let stream = build_output_stream(
        &device,
        &supported.config(),
        supported.sample_format(),
        converted.samples(),
        done_tx,
    )?;
    stream.play()?;
    
    // Marge pour la latence du périphérique
    let deadline = Instant::now() + duration + Duration::from_secs(2);
    let outcome = wait_playback(&done_rx, cancel, deadline);
    drop(stream);
    outcome
}

/// Attend la fin de la lecture, l'arrêt demandé ou l'échéance
fn wait_playback(
    done: &std_mpsc::Receiver<()>,
    cancel: &PlaybackCancel,
    deadline: Instant,
) -> AudioResult<()> {
    loop {
        if cancel.is_cancelled() {
            debug!("🔇 Arrêt de la lecture demandé");
            return Ok(());
        }
        
        match done.recv_timeout(CANCEL_POLL) {
            Ok(()) => return Ok(()),
            Err(std_mpsc::RecvTimeoutError::Timeout) if Instant::now() < deadline => {}
            Err(_) => {
                return Err(AudioError::Playback(
                    "la lecture ne s'est pas terminée".to_string(),
                ))
            }
        }
    }
}

fn build_output_stream(
    device: &Device,
    config: &StreamConfig,
    sample_format: SampleFormat,
    samples: Vec<i16>,
    done: std_mpsc::Sender<()>,
) -> AudioResult<Stream> {
    match sample_format {
        SampleFormat::F32 => build_typed_output::<f32>(device, config, samples, done),
        SampleFormat::I16 => build_typed_output::<i16>(device, config, samples, done),
        SampleFormat::U16 => build_typed_output::<u16>(device, config, samples, done),
        other => Err(AudioError::DeviceConfiguration(format!(
            "Format d'échantillon non supporté : {:?}",
            other
        ))),
    }
}

fn build_typed_output<T>(
    device: &Device,
    config: &StreamConfig,
    samples: Vec<i16>,
    done: std_mpsc::Sender<()>,
) -> AudioResult<Stream>
where
    T: SizedSample + FromSample<i16>,
{
    let mut position = 0usize;
    let mut notified = false;
    
    let stream = device.build_output_stream(
        config,
        move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
            for slot in data.iter_mut() {
                *slot = match samples.get(position) {
                    Some(&sample) => {
                        position += 1;
                        T::from_sample(sample)
                    }
                    None => T::EQUILIBRIUM,
                };
            }
            
            if position >= samples.len() && !notified {
                notified = true;
                let _ = done.send(());
            }
        },
        move |err| {
            error!("❌ Erreur stream audio sortie : {}", err);
        },
        None,
    )?;
    Ok(stream)
}

/// Liste les périphériques de sortie disponibles
pub fn list_output_devices() -> AudioResult<Vec<String>> {
    let host = cpal::default_host();
    Ok(host
        .output_devices()?
        .map(|device| {
            device
                .description()
                .ok()
                .map(|desc| desc.name().to_string())
                .unwrap_or_else(|| "Périphérique inconnu".to_string())
        })
        .collect())
}
