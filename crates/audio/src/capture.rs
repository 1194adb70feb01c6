//! Pipeline de capture audio
//! 
//! Ce module contient :
//! - `CapturePipeline` : possède le tap micro, convertit chaque buffer brut
//!   vers le format canonique et le transmet sans bloquer
//! - `CpalInputDevice` : implémentation de `InputDevice` avec cpal
//!
//! # Architecture thread
//! 
//! cpal appelle notre callback sur un thread temps réel. Le callback
//! convertit le buffer puis fait un `try_send` dans une file bornée :
//! si la file est pleine, le chunk est perdu (jamais de backlog illimité,
//! jamais de blocage sur le réseau).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, FromSample, Sample, SampleFormat, SizedSample, Stream, StreamConfig};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::{
    AudioChunk, AudioError, AudioFormat, AudioResult, DeviceOptions, FrameCallback,
    InputDevice, PcmConverter, TapHandle,
};

/// Événement émis par le pipeline de capture
#[derive(Clone, Debug, PartialEq)]
pub enum CaptureEvent {
    /// Chunk canonique prêt à être envoyé
    Chunk(AudioChunk),
    
    /// La conversion d'un buffer a échoué (buffer perdu, capture continue)
    ConversionFailed(String),
}

/// Sort d'un buffer livré par le périphérique
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameOutcome {
    /// Buffer vide ignoré silencieusement
    Discarded,
    /// Chunk converti et transmis
    Forwarded,
    /// File pleine ou fermée : chunk perdu
    QueueFull,
    /// Conversion échouée : événement émis, chunk perdu
    Failed,
}

/// Statistiques de capture
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureStats {
    pub chunks_forwarded: u64,
    pub chunks_discarded: u64,
    pub chunks_dropped: u64,
    pub conversion_failures: u64,
    
    /// Chunks transmis sous le seuil de silence (micro coupé ?)
    pub silent_chunks: u64,
}

/// Niveau crête sous lequel un chunk est considéré silencieux
pub const SILENCE_PEAK_LEVEL: f32 = 0.01;

#[derive(Debug, Default)]
struct CaptureCounters {
    forwarded: AtomicU64,
    discarded: AtomicU64,
    dropped: AtomicU64,
    failures: AtomicU64,
    silent: AtomicU64,
}

impl CaptureCounters {
    fn snapshot(&self) -> CaptureStats {
        CaptureStats {
            chunks_forwarded: self.forwarded.load(Ordering::Relaxed),
            chunks_discarded: self.discarded.load(Ordering::Relaxed),
            chunks_dropped: self.dropped.load(Ordering::Relaxed),
            conversion_failures: self.failures.load(Ordering::Relaxed),
            silent_chunks: self.silent.load(Ordering::Relaxed),
        }
    }
}

/// Pipeline de capture : périphérique → conversion → file non bloquante
/// 
/// Le pipeline ne démarre que si aucune capture n'est active, que le
/// périphérique accepte la configuration et que le convertisseur peut être
/// construit pour la paire (format natif, format canonique).
pub struct CapturePipeline {
    device: Box<dyn InputDevice>,
    target: AudioFormat,
    options: DeviceOptions,
    sink: mpsc::Sender<CaptureEvent>,
    tap: Option<TapHandle>,
    paused: bool,
    counters: Arc<CaptureCounters>,
}

impl CapturePipeline {
    /// Crée un pipeline inactif
    /// 
    /// # Arguments
    /// * `device` - Périphérique de capture
    /// * `target` - Format canonique des chunks émis
    /// * `options` - Options passées à `configure`
    /// * `sink` - File bornée vers le consommateur des chunks
    pub fn new(
        device: Box<dyn InputDevice>,
        target: AudioFormat,
        options: DeviceOptions,
        sink: mpsc::Sender<CaptureEvent>,
    ) -> Self {
        Self {
            device,
            target,
            options,
            sink,
            tap: None,
            paused: false,
            counters: Arc::new(CaptureCounters::default()),
        }
    }
    
    /// Démarre la capture
    /// 
    /// # Erreurs
    /// - `AudioError::CaptureAlreadyActive` si un tap est déjà installé
    /// - `AudioError::UnsupportedBitDepth` si le format cible n'est pas 16 bits
    /// - `AudioError::DeviceConfiguration` si le périphérique refuse
    /// - `AudioError::FormatConstruction` si la conversion est impossible
    pub fn start(&mut self) -> AudioResult<()> {
        if self.tap.is_some() {
            return Err(AudioError::CaptureAlreadyActive);
        }
        
        self.target.validate()?;
        let source = self.device.configure(&self.options)?;
        let mut converter = PcmConverter::new(source, self.target)?;
        
        info!("🎤 Démarrage capture : {} → {}", source, self.target);
        
        let sink = self.sink.clone();
        let counters = Arc::clone(&self.counters);
        let tap = self.device.start_capture(Box::new(move |chunk| {
            process_frame(&mut converter, chunk, &sink, &counters);
        }))?;
        
        self.tap = Some(tap);
        self.paused = false;
        
        info!("✅ Capture démarrée sur {}", self.device.device_info());
        Ok(())
    }
    
    /// Arrête la capture
    /// 
    /// Au retour, le tap est détaché et le moteur arrêté.
    /// Arrêter un pipeline inactif est un succès sans effet.
    pub fn stop(&mut self) -> AudioResult<()> {
        let Some(tap) = self.tap.take() else {
            return Ok(());
        };
        
        self.paused = false;
        self.device.stop_capture(tap)?;
        
        info!("🛑 Capture arrêtée");
        Ok(())
    }
    
    /// Suspend la capture en gardant le tap installé
    pub fn pause(&mut self) -> AudioResult<()> {
        match self.tap {
            Some(tap) if !self.paused => {
                self.device.pause_capture(tap)?;
                self.paused = true;
                debug!("⏸️  Capture en pause");
                Ok(())
            }
            _ => Ok(()),
        }
    }
    
    /// Reprend une capture en pause
    pub fn resume(&mut self) -> AudioResult<()> {
        match self.tap {
            Some(tap) if self.paused => {
                self.device.resume_capture(tap)?;
                self.paused = false;
                debug!("▶️  Capture reprise");
                Ok(())
            }
            _ => Ok(()),
        }
    }
    
    pub fn is_active(&self) -> bool {
        self.tap.is_some()
    }
    
    pub fn is_paused(&self) -> bool {
        self.paused
    }
    
    pub fn target_format(&self) -> AudioFormat {
        self.target
    }
    
    pub fn stats(&self) -> CaptureStats {
        self.counters.snapshot()
    }
}

impl Drop for CapturePipeline {
    fn drop(&mut self) {
        if self.tap.is_some() {
            debug!("🧹 Nettoyage automatique de la capture audio");
            if let Err(e) = self.stop() {
                warn!("⚠️  Arrêt de la capture au drop : {}", e);
            }
        }
    }
}

/// Traite un buffer livré par le périphérique
/// 
/// Appelé sur le thread temps réel : aucune opération bloquante.
fn process_frame(
    converter: &mut PcmConverter,
    chunk: AudioChunk,
    sink: &mpsc::Sender<CaptureEvent>,
    counters: &CaptureCounters,
) -> FrameOutcome {
    if chunk.is_empty() {
        counters.discarded.fetch_add(1, Ordering::Relaxed);
        return FrameOutcome::Discarded;
    }
    
    let mut silent = false;
    let (event, outcome) = match converter.convert(chunk) {
        Ok(converted) => {
            silent = converted.peak_level() < SILENCE_PEAK_LEVEL;
            (CaptureEvent::Chunk(converted), FrameOutcome::Forwarded)
        }
        Err(e) => {
            counters.failures.fetch_add(1, Ordering::Relaxed);
            (CaptureEvent::ConversionFailed(e.to_string()), FrameOutcome::Failed)
        }
    };
    
    if sink.try_send(event).is_err() {
        counters.dropped.fetch_add(1, Ordering::Relaxed);
        return FrameOutcome::QueueFull;
    }
    
    if outcome == FrameOutcome::Forwarded {
        counters.forwarded.fetch_add(1, Ordering::Relaxed);
        if silent {
            counters.silent.fetch_add(1, Ordering::Relaxed);
        }
    }
    outcome
}

/// Commandes envoyées au thread qui possède le stream cpal
enum StreamCommand {
    Pause(std_mpsc::Sender<AudioResult<()>>),
    Resume(std_mpsc::Sender<AudioResult<()>>),
    Stop,
}

/// Thread dédié qui possède le stream cpal
/// 
/// Le `Stream` cpal reste sur son thread de création ; on le pilote par
/// messages.
struct CaptureWorker {
    tap: TapHandle,
    commands: std_mpsc::Sender<StreamCommand>,
    thread: Option<JoinHandle<()>>,
}

impl CaptureWorker {
    fn request(&self, make: impl FnOnce(std_mpsc::Sender<AudioResult<()>>) -> StreamCommand) -> AudioResult<()> {
        let (reply_tx, reply_rx) = std_mpsc::channel();
        self.commands
            .send(make(reply_tx))
            .map_err(|_| AudioError::Stream("thread de capture arrêté".to_string()))?;
        reply_rx
            .recv()
            .map_err(|_| AudioError::Stream("thread de capture arrêté".to_string()))?
    }
    
    fn shutdown(mut self) -> AudioResult<()> {
        let _ = self.commands.send(StreamCommand::Stop);
        if let Some(thread) = self.thread.take() {
            thread
                .join()
                .map_err(|_| AudioError::Stream("panic du thread de capture".to_string()))?;
        }
        Ok(())
    }
}

/// Configuration retenue par `configure`
#[derive(Clone)]
struct ConfiguredInput {
    device: Device,
    stream_config: StreamConfig,
    sample_format: SampleFormat,
    format: AudioFormat,
}

/// Périphérique de capture cpal
/// 
/// Supporte les formats d'échantillons f32, i16 et u16 du périphérique,
/// convertis en i16 avec `cpal::Sample::from_sample`.
#[derive(Default)]
pub struct CpalInputDevice {
    configured: Option<ConfiguredInput>,
    worker: Option<CaptureWorker>,
    next_tap: u64,
    device_name: String,
}

impl CpalInputDevice {
    pub fn new() -> Self {
        Self::default()
    }
}

impl InputDevice for CpalInputDevice {
    fn configure(&mut self, options: &DeviceOptions) -> AudioResult<AudioFormat> {
        let host = cpal::default_host();
        
        let device = match &options.device_name {
            Some(name) => find_device(host.input_devices()?, name)?,
            None => host.default_input_device().ok_or(AudioError::NoDeviceFound)?,
        };
        
        let default_config = device.default_input_config()?;
        let mut chosen = default_config.clone();
        
        if let Some(rate) = options.preferred_sample_rate {
            for range in device.supported_input_configs()? {
                let channels_ok = options
                    .preferred_channels
                    .is_none_or(|channels| channels == range.channels());
                
                if range.sample_format() == default_config.sample_format()
                    && channels_ok
                    && rate >= range.min_sample_rate()
                    && rate <= range.max_sample_rate()
                {
                    chosen = range.with_sample_rate(rate);
                    break;
                }
            }
        }
        
        let format = AudioFormat::new(chosen.sample_rate(), chosen.channels(), true);
        format.validate()?;
        
        self.device_name = device_name(&device);
        debug!(
            "📋 Config capture : {} ({:?}) sur {}",
            format,
            chosen.sample_format(),
            self.device_name
        );
        
        self.configured = Some(ConfiguredInput {
            device,
            stream_config: chosen.config(),
            sample_format: chosen.sample_format(),
            format,
        });
        
        Ok(format)
    }
    
    fn start_capture(&mut self, on_frame: FrameCallback) -> AudioResult<TapHandle> {
        if self.worker.is_some() {
            return Err(AudioError::CaptureAlreadyActive);
        }
        
        let configured = self
            .configured
            .clone()
            .ok_or_else(|| AudioError::DeviceConfiguration("périphérique non configuré".to_string()))?;
        
        let (command_tx, command_rx) = std_mpsc::channel::<StreamCommand>();
        let (ready_tx, ready_rx) = std_mpsc::channel::<AudioResult<()>>();
        
        let thread = std::thread::Builder::new()
            .name("parlo-capture".to_string())
            .spawn(move || {
                let started = build_input_stream(&configured, on_frame).and_then(|stream| {
                    stream.play()?;
                    Ok(stream)
                });
                
                let stream = match started {
                    Ok(stream) => {
                        let _ = ready_tx.send(Ok(()));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                
                while let Ok(command) = command_rx.recv() {
                    match command {
                        StreamCommand::Pause(reply) => {
                            let _ = reply.send(stream.pause().map_err(AudioError::from));
                        }
                        StreamCommand::Resume(reply) => {
                            let _ = reply.send(stream.play().map_err(AudioError::from));
                        }
                        StreamCommand::Stop => break,
                    }
                }
                
                drop(stream);
            })?;
        
        ready_rx
            .recv()
            .map_err(|_| AudioError::Stream("le thread de capture n'a pas démarré".to_string()))??;
        
        self.next_tap += 1;
        let tap = TapHandle(self.next_tap);
        self.worker = Some(CaptureWorker {
            tap,
            commands: command_tx,
            thread: Some(thread),
        });
        
        Ok(tap)
    }
    
    fn pause_capture(&mut self, tap: TapHandle) -> AudioResult<()> {
        match &self.worker {
            Some(worker) if worker.tap == tap => worker.request(StreamCommand::Pause),
            _ => Ok(()),
        }
    }
    
    fn resume_capture(&mut self, tap: TapHandle) -> AudioResult<()> {
        match &self.worker {
            Some(worker) if worker.tap == tap => worker.request(StreamCommand::Resume),
            _ => Ok(()),
        }
    }
    
    fn stop_capture(&mut self, tap: TapHandle) -> AudioResult<()> {
        match self.worker.take() {
            Some(worker) if worker.tap == tap => worker.shutdown(),
            other => {
                self.worker = other;
                Ok(())
            }
        }
    }
    
    fn device_info(&self) -> String {
        if self.device_name.is_empty() {
            "Micro non configuré".to_string()
        } else {
            self.device_name.clone()
        }
    }
}

fn build_input_stream(configured: &ConfiguredInput, on_frame: FrameCallback) -> AudioResult<Stream> {
    match configured.sample_format {
        SampleFormat::F32 => build_typed_stream::<f32>(configured, on_frame),
        SampleFormat::I16 => build_typed_stream::<i16>(configured, on_frame),
        SampleFormat::U16 => build_typed_stream::<u16>(configured, on_frame),
        other => Err(AudioError::DeviceConfiguration(format!(
            "Format d'échantillon non supporté : {:?}",
            other
        ))),
    }
}

fn build_typed_stream<T>(configured: &ConfiguredInput, mut on_frame: FrameCallback) -> AudioResult<Stream>
where
    T: SizedSample,
    i16: FromSample<T>,
{
    let format = configured.format;
    let stream = configured.device.build_input_stream(
        &configured.stream_config,
        move |data: &[T], _: &cpal::InputCallbackInfo| {
            let samples: Vec<i16> = data.iter().map(|&s| i16::from_sample(s)).collect();
            match AudioChunk::from_samples(format, &samples) {
                Ok(chunk) => on_frame(chunk),
                Err(e) => warn!("⚠️  Buffer périphérique ignoré : {}", e),
            }
        },
        move |err| {
            error!("❌ Erreur stream audio : {}", err);
        },
        None,
    )?;
    Ok(stream)
}

fn device_name(device: &Device) -> String {
    device
        .description()
        .ok()
        .map(|desc| desc.name().to_string())
        .unwrap_or_else(|| "Périphérique inconnu".to_string())
}

pub(crate) fn find_device(devices: impl Iterator<Item = Device>, name: &str) -> AudioResult<Device> {
    devices
        .into_iter()
        .find(|device| device_name(device) == name)
        .ok_or_else(|| AudioError::DeviceConfiguration(format!("périphérique introuvable : {}", name)))
}

/// Liste les microphones disponibles
pub fn list_input_devices() -> AudioResult<Vec<String>> {
    let host = cpal::default_host();
    Ok(host.input_devices()?.map(|device| device_name(&device)).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimulatedInputDevice;
    
    fn converter() -> PcmConverter {
        PcmConverter::new(AudioFormat::new(48000, 1, true), AudioFormat::canonical_input()).unwrap()
    }
    
    #[test]
    fn test_zero_length_buffer_discarded() {
        let (tx, mut rx) = mpsc::channel(4);
        let counters = CaptureCounters::default();
        
        let chunk = AudioChunk::silence(AudioFormat::new(48000, 1, true), 0);
        let outcome = process_frame(&mut converter(), chunk, &tx, &counters);
        
        assert_eq!(outcome, FrameOutcome::Discarded);
        assert!(rx.try_recv().is_err());
        assert_eq!(counters.snapshot().chunks_discarded, 1);
    }
    
    #[test]
    fn test_frame_converted_and_forwarded() {
        let (tx, mut rx) = mpsc::channel(4);
        let counters = CaptureCounters::default();
        
        let chunk = AudioChunk::silence(AudioFormat::new(48000, 1, true), 480);
        let outcome = process_frame(&mut converter(), chunk, &tx, &counters);
        
        assert_eq!(outcome, FrameOutcome::Forwarded);
        match rx.try_recv().unwrap() {
            CaptureEvent::Chunk(chunk) => {
                assert_eq!(chunk.format(), AudioFormat::canonical_input());
                // Premier buffer du flux : amorçage du rééchantillonneur
                assert!(chunk.frame_count() > 0 && chunk.frame_count() < 160);
            }
            other => panic!("Événement inattendu : {:?}", other),
        }
    }
    
    #[test]
    fn test_silent_chunks_counted() {
        let (tx, _rx) = mpsc::channel(4);
        let counters = CaptureCounters::default();
        let format = AudioFormat::new(48000, 1, true);
        let mut converter = converter();
        
        let quiet = AudioChunk::silence(format, 480);
        let loud = AudioChunk::from_samples(format, &vec![12000i16; 480]).unwrap();
        process_frame(&mut converter, quiet, &tx, &counters);
        process_frame(&mut converter, loud, &tx, &counters);
        
        let stats = counters.snapshot();
        assert_eq!(stats.chunks_forwarded, 2);
        assert_eq!(stats.silent_chunks, 1);
    }
    
    #[test]
    fn test_conversion_failure_reported_not_fatal() {
        let (tx, mut rx) = mpsc::channel(4);
        let counters = CaptureCounters::default();
        
        // Mauvais format source : la conversion échoue
        let chunk = AudioChunk::silence(AudioFormat::new(44100, 1, true), 441);
        let outcome = process_frame(&mut converter(), chunk, &tx, &counters);
        
        assert_eq!(outcome, FrameOutcome::Failed);
        assert!(matches!(rx.try_recv().unwrap(), CaptureEvent::ConversionFailed(_)));
        assert_eq!(counters.snapshot().conversion_failures, 1);
    }
    
    #[test]
    fn test_full_queue_drops_chunk() {
        let (tx, _rx) = mpsc::channel(1);
        let counters = CaptureCounters::default();
        let format = AudioFormat::new(48000, 1, true);
        
        assert_eq!(
            process_frame(&mut converter(), AudioChunk::silence(format, 480), &tx, &counters),
            FrameOutcome::Forwarded
        );
        assert_eq!(
            process_frame(&mut converter(), AudioChunk::silence(format, 480), &tx, &counters),
            FrameOutcome::QueueFull
        );
        assert_eq!(counters.snapshot().chunks_dropped, 1);
    }
    
    #[tokio::test]
    async fn test_pipeline_start_stop() {
        let device = SimulatedInputDevice::new(AudioFormat::new(48000, 2, true));
        let control = device.control();
        let (tx, mut rx) = mpsc::channel(8);
        let mut pipeline = CapturePipeline::new(
            Box::new(device),
            AudioFormat::canonical_input(),
            DeviceOptions::default(),
            tx,
        );
        
        pipeline.start().unwrap();
        assert!(pipeline.is_active());
        assert!(matches!(pipeline.start(), Err(AudioError::CaptureAlreadyActive)));
        
        control.push_silence(960);
        match rx.recv().await.unwrap() {
            CaptureEvent::Chunk(chunk) => {
                assert_eq!(chunk.format(), AudioFormat::canonical_input());
                assert!(chunk.frame_count() > 0 && chunk.frame_count() <= 320);
            }
            other => panic!("Événement inattendu : {:?}", other),
        }
        
        pipeline.stop().unwrap();
        assert!(!pipeline.is_active());
        assert!(!control.is_capturing());
        
        // Arrêter un pipeline inactif est un no-op
        assert!(pipeline.stop().is_ok());
        assert_eq!(control.stop_count(), 1);
    }
    
    #[tokio::test]
    async fn test_resampler_state_kept_across_callbacks() {
        let device = SimulatedInputDevice::new(AudioFormat::new(48000, 2, true));
        let control = device.control();
        let (tx, mut rx) = mpsc::channel(8);
        let mut pipeline = CapturePipeline::new(
            Box::new(device),
            AudioFormat::canonical_input(),
            DeviceOptions::default(),
            tx,
        );
        pipeline.start().unwrap();
        
        let mut counts = Vec::new();
        for _ in 0..12 {
            control.push_silence(960);
            match rx.recv().await.unwrap() {
                CaptureEvent::Chunk(chunk) => counts.push(chunk.frame_count()),
                other => panic!("Événement inattendu : {:?}", other),
            }
        }
        
        // Flux continu : 960 / 3 = 320 frames par callback une fois amorcé
        for count in &counts[2..] {
            assert!((319..=321).contains(count), "frames = {}", count);
        }
        
        pipeline.stop().unwrap();
    }
    
    #[tokio::test]
    async fn test_pause_resume_keeps_tap() {
        let device = SimulatedInputDevice::new(AudioFormat::canonical_input());
        let control = device.control();
        let (tx, mut rx) = mpsc::channel(8);
        let mut pipeline = CapturePipeline::new(
            Box::new(device),
            AudioFormat::canonical_input(),
            DeviceOptions::default(),
            tx,
        );
        
        pipeline.start().unwrap();
        pipeline.pause().unwrap();
        assert!(pipeline.is_paused());
        assert!(control.is_capturing());
        
        control.push_silence(160);
        assert!(rx.try_recv().is_err());
        
        pipeline.resume().unwrap();
        control.push_silence(160);
        assert!(matches!(rx.recv().await, Some(CaptureEvent::Chunk(_))));
        assert_eq!(control.start_count(), 1);
    }
    
    #[test]
    fn test_configuration_refused() {
        let device = SimulatedInputDevice::new(AudioFormat::canonical_input());
        device.control().refuse_configuration(true);
        let (tx, _rx) = mpsc::channel(8);
        let mut pipeline = CapturePipeline::new(
            Box::new(device),
            AudioFormat::canonical_input(),
            DeviceOptions::default(),
            tx,
        );
        
        assert!(matches!(pipeline.start(), Err(AudioError::DeviceConfiguration(_))));
        assert!(!pipeline.is_active());
    }
    
    #[test]
    fn test_non_16_bit_target_rejected_before_start() {
        let device = SimulatedInputDevice::new(AudioFormat::canonical_input());
        let control = device.control();
        let (tx, _rx) = mpsc::channel(8);
        let mut target = AudioFormat::canonical_input();
        target.bit_depth = 32;
        let mut pipeline = CapturePipeline::new(Box::new(device), target, DeviceOptions::default(), tx);
        
        assert!(matches!(pipeline.start(), Err(AudioError::UnsupportedBitDepth(32))));
        assert_eq!(control.start_count(), 0);
    }
}
