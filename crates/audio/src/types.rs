//! Types de données pour le système audio
//! 
//! Ce module définit les structures principales pour manipuler l'audio PCM :
//! - AudioFormat : description d'un flux PCM (rate, canaux, layout)
//! - AudioChunk : un buffer de frames PCM 16 bits dans un format donné
//! - Sample : type d'un échantillon canonique

use std::fmt;
use std::time::Duration;

use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};

use crate::{AudioError, AudioResult};

/// Type pour un échantillon audio canonique
/// 
/// Tout le pipeline travaille en PCM linéaire signé 16 bits little-endian.
pub type Sample = i16;

/// Nombre d'octets par échantillon (16 bits)
pub const BYTES_PER_SAMPLE: usize = 2;

/// Description d'un flux PCM
/// 
/// `bit_depth` est toujours 16 : toute autre valeur est rejetée par
/// `AudioFormat::with_bit_depth` avant le démarrage d'une capture.
/// 
/// Layout des données :
/// - `interleaved = true`  : [f0_c0, f0_c1, f1_c0, f1_c1, ...]
/// - `interleaved = false` : [f0_c0, f1_c0, ..., f0_c1, f1_c1, ...] (un plan par canal)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AudioFormat {
    /// Fréquence d'échantillonnage en Hz
    pub sample_rate: u32,
    
    /// Nombre de canaux (1 = mono, 2 = stéréo, ...)
    pub channels: u16,
    
    /// Profondeur en bits, fixée à 16
    #[serde(default = "default_bit_depth")]
    pub bit_depth: u16,
    
    /// Layout entrelacé ou planaire
    #[serde(default = "default_interleaved")]
    pub interleaved: bool,
}

fn default_bit_depth() -> u16 {
    AudioFormat::BIT_DEPTH
}

fn default_interleaved() -> bool {
    true
}

impl AudioFormat {
    /// Seule profondeur supportée
    pub const BIT_DEPTH: u16 = 16;
    
    /// Crée un format PCM 16 bits
    /// 
    /// # Example
    /// ```rust
    /// use audio::AudioFormat;
    /// 
    /// let format = AudioFormat::new(16000, 1, true);
    /// assert_eq!(format.bytes_per_frame(), 2);
    /// ```
    pub fn new(sample_rate: u32, channels: u16, interleaved: bool) -> Self {
        Self {
            sample_rate,
            channels,
            bit_depth: Self::BIT_DEPTH,
            interleaved,
        }
    }
    
    /// Crée un format en validant la profondeur demandée
    /// 
    /// # Erreurs
    /// - `AudioError::UnsupportedBitDepth` si `bit_depth != 16`
    pub fn with_bit_depth(
        sample_rate: u32,
        channels: u16,
        bit_depth: u16,
        interleaved: bool,
    ) -> AudioResult<Self> {
        let format = Self {
            sample_rate,
            channels,
            bit_depth,
            interleaved,
        };
        format.validate()?;
        Ok(format)
    }
    
    /// PCM canonique envoyé au service : 16 kHz mono entrelacé
    pub fn canonical_input() -> Self {
        Self::new(16000, 1, true)
    }
    
    /// PCM renvoyé par le service : 24 kHz mono entrelacé
    pub fn canonical_output() -> Self {
        Self::new(24000, 1, true)
    }
    
    /// Vérifie que le format est cohérent
    pub fn validate(&self) -> AudioResult<()> {
        if self.bit_depth != Self::BIT_DEPTH {
            return Err(AudioError::UnsupportedBitDepth(self.bit_depth));
        }
        if self.sample_rate == 0 {
            return Err(AudioError::InvalidFormat("sample rate nul".to_string()));
        }
        if self.channels == 0 {
            return Err(AudioError::InvalidFormat("aucun canal".to_string()));
        }
        Ok(())
    }
    
    /// Taille d'une frame (tous canaux) en octets
    pub fn bytes_per_frame(&self) -> usize {
        self.channels as usize * BYTES_PER_SAMPLE
    }
    
    /// Même représentation des échantillons (canaux + layout)
    pub fn same_representation(&self, other: &AudioFormat) -> bool {
        self.channels == other.channels
            && self.interleaved == other.interleaved
            && self.bit_depth == other.bit_depth
    }
    
    /// Type MIME annoncé au service distant
    pub fn mime_type(&self) -> String {
        format!("audio/pcm;rate={}", self.sample_rate)
    }
    
    /// Durée correspondant à un nombre de frames
    pub fn duration_of(&self, frame_count: usize) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(frame_count as f64 / self.sample_rate as f64)
    }
}

impl fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}Hz/{}ch/{}bit/{}",
            self.sample_rate,
            self.channels,
            self.bit_depth,
            if self.interleaved { "entrelacé" } else { "planaire" }
        )
    }
}

/// Buffer de frames PCM 16 bits
/// 
/// Invariant : `payload.len() == frame_count * channels * 2`. La longueur du
/// payload n'est jamais fournie indépendamment : les constructeurs la
/// dérivent du format et rejettent tout buffer tronqué.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AudioChunk {
    format: AudioFormat,
    frame_count: usize,
    payload: Vec<u8>,
}

impl AudioChunk {
    /// Construit un chunk depuis des octets PCM little-endian
    /// 
    /// # Erreurs
    /// - `AudioError::InvalidFormat` si la longueur n'est pas un multiple
    ///   de la taille d'une frame
    pub fn from_bytes(format: AudioFormat, payload: Vec<u8>) -> AudioResult<Self> {
        format.validate()?;
        let frame_size = format.bytes_per_frame();
        if payload.len() % frame_size != 0 {
            return Err(AudioError::InvalidFormat(format!(
                "payload de {} octets incompatible avec des frames de {} octets",
                payload.len(),
                frame_size
            )));
        }
        
        Ok(Self {
            format,
            frame_count: payload.len() / frame_size,
            payload,
        })
    }
    
    /// Construit un chunk depuis des échantillons i16
    /// 
    /// Les échantillons doivent déjà suivre le layout du format.
    pub fn from_samples(format: AudioFormat, samples: &[Sample]) -> AudioResult<Self> {
        let mut payload = vec![0u8; samples.len() * BYTES_PER_SAMPLE];
        LittleEndian::write_i16_into(samples, &mut payload);
        Self::from_bytes(format, payload)
    }
    
    /// Crée un chunk de silence
    pub fn silence(format: AudioFormat, frame_count: usize) -> Self {
        Self {
            format,
            frame_count,
            payload: vec![0u8; frame_count * format.bytes_per_frame()],
        }
    }
    
    pub fn format(&self) -> AudioFormat {
        self.format
    }
    
    pub fn frame_count(&self) -> usize {
        self.frame_count
    }
    
    pub fn is_empty(&self) -> bool {
        self.frame_count == 0
    }
    
    /// Octets PCM bruts
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }
    
    /// Consomme le chunk et rend le payload sans copie
    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }
    
    /// Décode le payload en échantillons i16
    pub fn samples(&self) -> Vec<Sample> {
        let mut samples = vec![0i16; self.payload.len() / BYTES_PER_SAMPLE];
        LittleEndian::read_i16_into(&self.payload, &mut samples);
        samples
    }
    
    /// Durée audio du chunk
    pub fn duration(&self) -> Duration {
        self.format.duration_of(self.frame_count)
    }
    
    /// Niveau crête normalisé entre 0.0 et 1.0
    pub fn peak_level(&self) -> f32 {
        self.samples()
            .iter()
            .map(|&s| (s as f32 / i16::MAX as f32).abs())
            .fold(0.0, f32::max)
    }
}
