//! Moteur de conversion PCM
//! 
//! Ce module transforme un buffer de frames brutes capturées dans le format
//! natif du périphérique vers le format canonique envoyé sur le réseau
//! (et inversement pour adapter l'audio reçu au périphérique de sortie).
//!
//! Étapes d'une conversion :
//! 1. Séparation en plans (un `Vec` par canal) si la source est entrelacée
//! 2. Adaptation du nombre de canaux (downmix vers mono par moyenne)
//! 3. Rééchantillonnage sinc fenêtré (rubato), canal par canal
//! 4. Ré-entrelacement si la destination est entrelacée
//!
//! Le rééchantillonneur garde son historique d'un buffer à l'autre : des
//! buffers consécutifs forment un flux continu, sans raccord ni dérive.
//! Si la source et la destination ont le même sample rate et la même
//! représentation, la conversion est un passthrough sans copie.

use std::fmt;

use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};
use tracing::debug;

use crate::{AudioChunk, AudioError, AudioFormat, AudioResult, Sample};

/// Taille maximale d'un bloc passé au rééchantillonneur (frames)
const MAX_BLOCK_FRAMES: usize = 4096;

/// Convertisseur entre deux formats PCM 16 bits
/// 
/// Avec rééchantillonnage, le convertisseur a un état (historique du
/// filtre) : une instance par flux, possédée par le callback de capture.
pub struct PcmConverter {
    source: AudioFormat,
    target: AudioFormat,
    resampler: Option<SincFixedIn<f32>>,
}

impl fmt::Debug for PcmConverter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PcmConverter")
            .field("source", &self.source)
            .field("target", &self.target)
            .field("resampling", &self.resampler.is_some())
            .finish()
    }
}

impl PcmConverter {
    /// Sample rate minimal supporté par le moteur
    pub const MIN_SAMPLE_RATE: u32 = 8000;
    
    /// Sample rate maximal supporté par le moteur
    pub const MAX_SAMPLE_RATE: u32 = 192_000;
    
    /// Nombre maximal de canaux
    pub const MAX_CHANNELS: u16 = 8;
    
    /// Construit un convertisseur pour une paire de formats
    /// 
    /// # Erreurs
    /// - `AudioError::FormatConstruction` si l'un des formats est hors des
    ///   plages supportées (rate, canaux, profondeur) ou si le
    ///   rééchantillonneur ne peut pas être construit
    /// 
    /// # Example
    /// ```rust
    /// use audio::{AudioFormat, PcmConverter};
    /// 
    /// let device = AudioFormat::new(48000, 2, true);
    /// let converter = PcmConverter::new(device, AudioFormat::canonical_input()).unwrap();
    /// assert_eq!(converter.output_capacity(480), 160);
    /// ```
    pub fn new(source: AudioFormat, target: AudioFormat) -> AudioResult<Self> {
        for format in [&source, &target] {
            format
                .validate()
                .map_err(|e| AudioError::format_construction(source, target, e.to_string()))?;
            
            if format.sample_rate < Self::MIN_SAMPLE_RATE || format.sample_rate > Self::MAX_SAMPLE_RATE {
                return Err(AudioError::format_construction(
                    source,
                    target,
                    format!(
                        "sample rate {} hors plage ({}-{})",
                        format.sample_rate,
                        Self::MIN_SAMPLE_RATE,
                        Self::MAX_SAMPLE_RATE
                    ),
                ));
            }
            
            if format.channels > Self::MAX_CHANNELS {
                return Err(AudioError::format_construction(
                    source,
                    target,
                    format!("{} canaux (max {})", format.channels, Self::MAX_CHANNELS),
                ));
            }
        }
        
        let resampler = if source.sample_rate != target.sample_rate {
            let params = SincInterpolationParameters {
                sinc_len: 256,
                f_cutoff: 0.95,
                interpolation: SincInterpolationType::Linear,
                oversampling_factor: 256,
                window: WindowFunction::BlackmanHarris2,
            };
            let ratio = target.sample_rate as f64 / source.sample_rate as f64;
            let resampler = SincFixedIn::<f32>::new(
                ratio,
                1.0,
                params,
                MAX_BLOCK_FRAMES,
                target.channels as usize,
            )
            .map_err(|e| AudioError::format_construction(source, target, e.to_string()))?;
            Some(resampler)
        } else {
            None
        };
        
        debug!("🔧 Convertisseur PCM : {} → {}", source, target);
        Ok(Self { source, target, resampler })
    }
    
    pub fn source(&self) -> AudioFormat {
        self.source
    }
    
    pub fn target(&self) -> AudioFormat {
        self.target
    }
    
    /// Vrai si la conversion ne touche pas aux données
    pub fn is_passthrough(&self) -> bool {
        self.source.sample_rate == self.target.sample_rate
            && self.source.same_representation(&self.target)
    }
    
    /// Capacité de sortie pour `input_frames` frames en entrée
    /// 
    /// Formule : ceil(input_frames * target_rate / source_rate). Un buffer
    /// isolé peut produire un peu moins (l'historique du filtre compense sur
    /// le flux).
    pub fn output_capacity(&self, input_frames: usize) -> usize {
        let numerator = input_frames as u64 * self.target.sample_rate as u64;
        numerator.div_ceil(self.source.sample_rate as u64) as usize
    }
    
    /// Convertit le buffer suivant du flux
    /// 
    /// # Erreurs
    /// - `AudioError::ConversionFailure` si le chunk n'est pas dans le format
    ///   source, si le rééchantillonneur échoue ou si la conversion produit
    ///   zéro frame
    pub fn convert(&mut self, chunk: AudioChunk) -> AudioResult<AudioChunk> {
        if chunk.format() != self.source {
            return Err(AudioError::ConversionFailure(format!(
                "chunk en {} alors que le convertisseur attend {}",
                chunk.format(),
                self.source
            )));
        }
        
        // Passthrough : on rend le buffer tel quel
        if self.is_passthrough() {
            return Ok(chunk);
        }
        
        let input_frames = chunk.frame_count();
        let capacity = self.output_capacity(input_frames);
        let planes = self.target_planes(&chunk);
        let planes = match self.resampler.as_mut() {
            Some(resampler) => resample_stream(resampler, planes, capacity)?,
            None => planes,
        };
        
        self.assemble(planes, input_frames)
    }
    
    /// Convertit un clip complet (lecture d'une réponse)
    /// 
    /// Vide le filtre en fin de clip et retire son retard : la sortie dure
    /// exactement `output_capacity(n)` frames, alignée sur l'entrée.
    pub fn convert_clip(&mut self, chunk: AudioChunk) -> AudioResult<AudioChunk> {
        let Some(mut resampler) = self.resampler.take() else {
            return self.convert(chunk);
        };
        
        let result = self.convert_clip_with(&mut resampler, chunk);
        resampler.reset();
        self.resampler = Some(resampler);
        result
    }
    
    fn convert_clip_with(
        &self,
        resampler: &mut SincFixedIn<f32>,
        chunk: AudioChunk,
    ) -> AudioResult<AudioChunk> {
        if chunk.format() != self.source {
            return Err(AudioError::ConversionFailure(format!(
                "clip en {} alors que le convertisseur attend {}",
                chunk.format(),
                self.source
            )));
        }
        
        let input_frames = chunk.frame_count();
        let expected = self.output_capacity(input_frames);
        let delay = resampler.output_delay();
        
        let planes = self.target_planes(&chunk);
        let mut planes = resample_stream(resampler, planes, expected + delay)?;
        
        resampler
            .set_chunk_size(MAX_BLOCK_FRAMES)
            .map_err(|e| AudioError::ConversionFailure(e.to_string()))?;
        while planes.first().map_or(0, Vec::len) < expected + delay {
            let tail = resampler
                .process_partial::<Vec<f32>>(None, None)
                .map_err(|e| AudioError::ConversionFailure(e.to_string()))?;
            if tail.first().is_none_or(Vec::is_empty) {
                break;
            }
            for (plane, extra) in planes.iter_mut().zip(tail) {
                plane.extend(extra);
            }
        }
        
        for plane in planes.iter_mut() {
            plane.drain(..delay.min(plane.len()));
            plane.truncate(expected);
        }
        
        self.assemble(planes, input_frames)
    }
    
    /// Plans d'entrée adaptés au nombre de canaux cible (f32 normalisés)
    /// 
    /// Un canal cible sans canal source reste silencieux.
    fn target_planes(&self, chunk: &AudioChunk) -> Vec<Vec<f32>> {
        let samples = chunk.samples();
        let source_channels = self.source.channels as usize;
        let planes = if self.source.interleaved {
            deinterleave(&samples, source_channels)
        } else {
            split_planar(&samples, source_channels)
        };
        
        let frames = chunk.frame_count();
        map_channels(planes, self.target.channels as usize)
            .into_iter()
            .map(|plane| match plane {
                Some(p) => p.into_iter().map(to_f32).collect(),
                None => vec![0.0; frames],
            })
            .collect()
    }
    
    fn assemble(&self, planes: Vec<Vec<f32>>, input_frames: usize) -> AudioResult<AudioChunk> {
        let output_frames = planes.first().map_or(0, Vec::len);
        if output_frames == 0 {
            return Err(AudioError::ConversionFailure(format!(
                "zéro frame produite pour {} frames en entrée",
                input_frames
            )));
        }
        
        let planes: Vec<Option<Vec<Sample>>> = planes
            .into_iter()
            .map(|plane| Some(plane.into_iter().map(to_i16).collect()))
            .collect();
        
        let output = if self.target.interleaved {
            interleave(&planes, self.target.channels as usize, output_frames)
        } else {
            join_planar(&planes, output_frames)
        };
        
        AudioChunk::from_samples(self.target, &output)
    }
}

/// Passe des plans au rééchantillonneur par blocs d'au plus `MAX_BLOCK_FRAMES`
fn resample_stream(
    resampler: &mut SincFixedIn<f32>,
    planes: Vec<Vec<f32>>,
    capacity: usize,
) -> AudioResult<Vec<Vec<f32>>> {
    let frames = planes.first().map_or(0, Vec::len);
    let mut output = vec![Vec::with_capacity(capacity); planes.len()];
    
    let mut offset = 0;
    while offset < frames {
        let block = (frames - offset).min(MAX_BLOCK_FRAMES);
        resampler
            .set_chunk_size(block)
            .map_err(|e| AudioError::ConversionFailure(e.to_string()))?;
        
        let input: Vec<&[f32]> = planes.iter().map(|p| &p[offset..offset + block]).collect();
        let resampled = resampler
            .process(&input, None)
            .map_err(|e| AudioError::ConversionFailure(e.to_string()))?;
        for (plane, part) in output.iter_mut().zip(resampled) {
            plane.extend(part);
        }
        offset += block;
    }
    
    Ok(output)
}

fn to_f32(sample: Sample) -> f32 {
    sample as f32 / 32768.0
}

fn to_i16(sample: f32) -> Sample {
    (sample * 32768.0).round().clamp(i16::MIN as f32, i16::MAX as f32) as Sample
}

/// Sépare un buffer entrelacé en un plan par canal
pub fn deinterleave(samples: &[Sample], channels: usize) -> Vec<Vec<Sample>> {
    if channels == 0 {
        return Vec::new();
    }
    
    let frames = samples.len() / channels;
    let mut planes = vec![Vec::with_capacity(frames); channels];
    for frame in samples.chunks_exact(channels) {
        for (plane, &sample) in planes.iter_mut().zip(frame) {
            plane.push(sample);
        }
    }
    planes
}

/// Entrelace des plans : [f0_c0, f0_c1, ..., f1_c0, ...]
/// 
/// Un canal absent (`None` ou index au-delà des plans disponibles) est
/// ignoré : sa position reste à zéro.
pub fn interleave(planes: &[Option<Vec<Sample>>], channels: usize, frames: usize) -> Vec<Sample> {
    let mut output = vec![0i16; frames * channels];
    for channel in 0..channels {
        let Some(Some(plane)) = planes.get(channel) else {
            continue;
        };
        for (frame, &sample) in plane.iter().take(frames).enumerate() {
            output[frame * channels + channel] = sample;
        }
    }
    output
}

fn split_planar(samples: &[Sample], channels: usize) -> Vec<Vec<Sample>> {
    let frames = samples.len() / channels;
    samples
        .chunks_exact(frames.max(1))
        .take(channels)
        .map(|plane| plane.to_vec())
        .collect()
}

fn join_planar(planes: &[Option<Vec<Sample>>], frames: usize) -> Vec<Sample> {
    let mut output = Vec::with_capacity(planes.len() * frames);
    for plane in planes {
        match plane {
            Some(p) => {
                output.extend(p.iter().take(frames));
                output.extend(std::iter::repeat_n(0, frames.saturating_sub(p.len())));
            }
            None => output.extend(std::iter::repeat_n(0, frames)),
        }
    }
    output
}

/// Adapte le nombre de canaux
/// 
/// Destination mono + source multi-canal : moyenne des canaux.
/// Sinon le canal `c` reprend le canal source `c`, les canaux manquants
/// restent `None`.
fn map_channels(planes: Vec<Vec<Sample>>, target_channels: usize) -> Vec<Option<Vec<Sample>>> {
    if target_channels == 1 && planes.len() > 1 {
        let frames = planes.iter().map(Vec::len).min().unwrap_or(0);
        let count = planes.len() as i32;
        let mono = (0..frames)
            .map(|i| {
                let sum: i32 = planes.iter().map(|p| p[i] as i32).sum();
                (sum / count) as Sample
            })
            .collect();
        return vec![Some(mono)];
    }
    
    let mut planes = planes.into_iter();
    (0..target_channels).map(|_| planes.next()).collect()
}
