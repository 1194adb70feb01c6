//! Protocole filaire du service conversationnel
//! 
//! Ce module contient :
//! - `Payload` : message brut (texte UTF-8 ou binaire)
//! - `OutboundEnvelope` : Setup, chunk audio, TurnComplete
//! - `InboundEnvelope` : audio binaire, SetupAck, ErrorNotice, ServerContent
//! - `classify` / `decode_inbound` : démultiplexage des messages entrants
//!
//! # Classification
//! 
//! Un message est du JSON de contrôle si son premier octet est `{` ou `[`,
//! sinon c'est de l'audio binaire. Le JSON est d'abord parsé en valeur,
//! puis décodé en variantes typées par ordre de priorité :
//! setupComplete, error, serverContent.

use audio::AudioChunk;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::{AudioEncoding, LiveConfig, NetworkError, NetworkResult, ResponseModality};

/// Message brut échangé sur la connexion
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Payload {
    Text(String),
    Binary(Vec<u8>),
}

impl Payload {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Payload::Text(text) => text.as_bytes(),
            Payload::Binary(bytes) => bytes,
        }
    }
    
    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }
    
    pub fn is_empty(&self) -> bool {
        self.as_bytes().is_empty()
    }
}

/// Chemin de traitement d'un message entrant
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PayloadKind {
    JsonControl,
    BinaryAudio,
}

/// Classe un message d'après son premier octet
/// 
/// Retourne `None` pour un message vide.
pub fn classify(bytes: &[u8]) -> Option<PayloadKind> {
    match bytes.first()? {
        b'{' | b'[' => Some(PayloadKind::JsonControl),
        _ => Some(PayloadKind::BinaryAudio),
    }
}

/// Paramètres du message Setup
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SetupRequest {
    pub model: String,
    pub response_modality: ResponseModality,
    pub voice_name: String,
    pub system_instruction: String,
    pub input_transcription: bool,
    pub output_transcription: bool,
}

impl From<&LiveConfig> for SetupRequest {
    fn from(config: &LiveConfig) -> Self {
        Self {
            model: config.model.clone(),
            response_modality: config.response_modality,
            voice_name: config.voice_name.clone(),
            system_instruction: config.system_instruction.clone(),
            input_transcription: config.input_transcription,
            output_transcription: config.output_transcription,
        }
    }
}

/// Messages sortants
#[derive(Clone, Debug, PartialEq)]
pub enum OutboundEnvelope {
    /// Premier message de chaque connexion, envoyé une seule fois
    Setup(SetupRequest),
    
    /// Chunk audio canonique
    Audio(AudioChunk),
    
    /// Fin de tour de parole locale
    TurnComplete,
}

impl OutboundEnvelope {
    /// Encode le message pour la connexion
    /// 
    /// Seul l'audio dépend de `encoding` : en `RawBinary` le PCM est envoyé
    /// tel quel dans une frame binaire.
    pub fn encode(&self, encoding: AudioEncoding) -> NetworkResult<Payload> {
        let value = match self {
            OutboundEnvelope::Setup(setup) => setup_json(setup),
            OutboundEnvelope::Audio(chunk) => {
                if encoding == AudioEncoding::RawBinary {
                    return Ok(Payload::Binary(chunk.payload().to_vec()));
                }
                json!({
                    "realtimeInput": {
                        "audio": {
                            "mimeType": chunk.format().mime_type(),
                            "data": BASE64.encode(chunk.payload()),
                        }
                    }
                })
            }
            OutboundEnvelope::TurnComplete => json!({
                "realtimeInput": { "turnComplete": true }
            }),
        };
        
        Ok(Payload::Text(serde_json::to_string(&value)?))
    }
    
    pub fn kind(&self) -> &'static str {
        match self {
            OutboundEnvelope::Setup(_) => "setup",
            OutboundEnvelope::Audio(_) => "audio",
            OutboundEnvelope::TurnComplete => "turnComplete",
        }
    }
}

fn setup_json(setup: &SetupRequest) -> Value {
    let mut body = json!({
        "model": setup.model,
        "generationConfig": {
            "responseModalities": [setup.response_modality],
            "speechConfig": {
                "voiceConfig": {
                    "prebuiltVoiceConfig": { "voiceName": setup.voice_name }
                }
            }
        },
        "systemInstruction": {
            "parts": [{ "text": setup.system_instruction }]
        }
    });
    
    if let Some(object) = body.as_object_mut() {
        if setup.input_transcription {
            object.insert("inputAudioTranscription".to_string(), json!({}));
        }
        if setup.output_transcription {
            object.insert("outputAudioTranscription".to_string(), json!({}));
        }
    }
    
    json!({ "setup": body })
}

/// Audio inline reçu dans une part
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InlineAudio {
    pub mime_type: Option<String>,
    pub data: Vec<u8>,
}

/// Part d'un tour du modèle
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ContentPart {
    pub text: Option<String>,
    pub is_thought: bool,
    pub audio: Option<InlineAudio>,
}

/// Contenu envoyé par le serveur pendant un tour
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ServerContent {
    /// Parts du tour, dans l'ordre
    pub parts: Vec<ContentPart>,
    pub input_transcription: Option<String>,
    pub output_transcription: Option<String>,
    pub turn_complete: bool,
    pub interrupted: bool,
    /// Parts écartées car illisibles (audio inline mal encodé)
    pub rejected_parts: usize,
}

/// Messages entrants
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InboundEnvelope {
    /// Audio binaire brut
    BinaryAudio(Vec<u8>),
    
    /// Acquittement du Setup
    SetupAck,
    
    /// Erreur signalée par le serveur
    ErrorNotice { message: String },
    
    /// Contenu d'un tour
    ServerContent(ServerContent),
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct InboundWire {
    error: Option<Value>,
    server_content: Option<ServerContentWire>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerContentWire {
    model_turn: Option<ModelTurnWire>,
    input_transcription: Option<TranscriptionWire>,
    output_transcription: Option<TranscriptionWire>,
    #[serde(default)]
    turn_complete: bool,
    #[serde(default)]
    interrupted: bool,
}

#[derive(Deserialize)]
struct ModelTurnWire {
    #[serde(default)]
    parts: Vec<PartWire>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PartWire {
    text: Option<String>,
    #[serde(default)]
    thought: bool,
    inline_data: Option<InlineDataWire>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct InlineDataWire {
    mime_type: Option<String>,
    data: String,
}

#[derive(Deserialize)]
struct TranscriptionWire {
    text: Option<String>,
}

/// Décode un message entrant
/// 
/// # Retourne
/// Les enveloppes reconnues dans l'ordre de priorité. Un message JSON peut
/// en porter plusieurs.
/// 
/// Une part dont l'audio inline est illisible est écartée et comptée dans
/// `ServerContent::rejected_parts` ; le reste du message est conservé.
/// 
/// # Erreurs
/// - `NetworkError::ProtocolViolation` : message vide, JSON invalide, JSON
///   qui n'est pas un objet, aucun champ connu
pub fn decode_inbound(payload: &Payload) -> NetworkResult<Vec<InboundEnvelope>> {
    let bytes = payload.as_bytes();
    
    match classify(bytes) {
        None => Err(NetworkError::ProtocolViolation("message vide".to_string())),
        Some(PayloadKind::BinaryAudio) => Ok(vec![InboundEnvelope::BinaryAudio(bytes.to_vec())]),
        Some(PayloadKind::JsonControl) => decode_control(bytes),
    }
}

fn decode_control(bytes: &[u8]) -> NetworkResult<Vec<InboundEnvelope>> {
    let value: Value = serde_json::from_slice(bytes)
        .map_err(|e| NetworkError::ProtocolViolation(format!("JSON invalide: {}", e)))?;
    
    if !value.is_object() {
        return Err(NetworkError::ProtocolViolation(
            "le message de contrôle n'est pas un objet".to_string(),
        ));
    }
    
    // Présence du champ, quelle que soit sa valeur (`null` compris)
    let setup_complete = value.get("setupComplete").is_some();
    
    let wire: InboundWire = serde_json::from_value(value)
        .map_err(|e| NetworkError::ProtocolViolation(format!("structure inattendue: {}", e)))?;
    
    let mut envelopes = Vec::new();
    
    if setup_complete {
        envelopes.push(InboundEnvelope::SetupAck);
    }
    
    if let Some(error) = wire.error {
        envelopes.push(InboundEnvelope::ErrorNotice {
            message: error_message(&error),
        });
    }
    
    if let Some(content) = wire.server_content {
        envelopes.push(InboundEnvelope::ServerContent(decode_server_content(content)));
    }
    
    if envelopes.is_empty() {
        return Err(NetworkError::ProtocolViolation(
            "aucun champ de contrôle reconnu".to_string(),
        ));
    }
    
    debug!("📨 {} enveloppe(s) décodée(s)", envelopes.len());
    Ok(envelopes)
}

fn error_message(error: &Value) -> String {
    match error {
        Value::String(message) => message.clone(),
        Value::Object(fields) => fields
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string()),
        other => other.to_string(),
    }
}

fn decode_server_content(wire: ServerContentWire) -> ServerContent {
    let mut parts = Vec::new();
    let mut rejected_parts = 0;
    
    for part in wire.model_turn.map(|turn| turn.parts).unwrap_or_default() {
        let audio = match part.inline_data {
            Some(inline) => match BASE64.decode(inline.data.as_bytes()) {
                Ok(data) => Some(InlineAudio {
                    mime_type: inline.mime_type,
                    data,
                }),
                Err(e) => {
                    warn!("⚠️  Audio inline illisible, part ignorée : {}", e);
                    rejected_parts += 1;
                    continue;
                }
            },
            None => None,
        };
        
        parts.push(ContentPart {
            text: part.text,
            is_thought: part.thought,
            audio,
        });
    }
    
    ServerContent {
        parts,
        input_transcription: wire.input_transcription.and_then(|t| t.text),
        output_transcription: wire.output_transcription.and_then(|t| t.text),
        turn_complete: wire.turn_complete,
        interrupted: wire.interrupted,
        rejected_parts,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use audio::AudioFormat;
    
    fn text(json: &str) -> Payload {
        Payload::Text(json.to_string())
    }
    
    #[test]
    fn test_classify_by_first_byte() {
        assert_eq!(classify(b"{\"a\":1}"), Some(PayloadKind::JsonControl));
        assert_eq!(classify(b"[1]"), Some(PayloadKind::JsonControl));
        assert_eq!(classify(&[0x00, 0x7B]), Some(PayloadKind::BinaryAudio));
        assert_eq!(classify(b" {}"), Some(PayloadKind::BinaryAudio));
        assert_eq!(classify(b""), None);
    }
    
    #[test]
    fn test_binary_audio_not_parsed() {
        let payload = Payload::Binary(vec![0x00, 0x01, 0x02]);
        let envelopes = decode_inbound(&payload).unwrap();
        assert_eq!(envelopes, vec![InboundEnvelope::BinaryAudio(vec![0x00, 0x01, 0x02])]);
    }
    
    #[test]
    fn test_json_in_binary_frame_is_control() {
        let payload = Payload::Binary(b"{\"setupComplete\":{}}".to_vec());
        assert_eq!(decode_inbound(&payload).unwrap(), vec![InboundEnvelope::SetupAck]);
    }
    
    #[test]
    fn test_protocol_violations() {
        for bad in ["{not json", "[1,2]", "{\"unknown\":true}", ""] {
            let result = decode_inbound(&text(bad));
            assert!(
                matches!(result, Err(NetworkError::ProtocolViolation(_))),
                "{} devrait être rejeté",
                bad
            );
        }
    }
    
    #[test]
    fn test_error_notice() {
        let envelopes = decode_inbound(&text(r#"{"error":{"message":"quota dépassé","code":429}}"#)).unwrap();
        assert_eq!(
            envelopes,
            vec![InboundEnvelope::ErrorNotice { message: "quota dépassé".to_string() }]
        );
    }
    
    #[test]
    fn test_server_content_parts_in_order() {
        let audio = BASE64.encode([1u8, 2, 3, 4]);
        let json = format!(
            r#"{{"serverContent":{{"modelTurn":{{"parts":[
                {{"text":"je réfléchis","thought":true}},
                {{"text":"Bonjour"}},
                {{"inlineData":{{"mimeType":"audio/pcm;rate=24000","data":"{}"}}}}
            ]}},"inputTranscription":{{"text":"salut"}},"turnComplete":true}}}}"#,
            audio
        );
        
        let envelopes = decode_inbound(&text(&json)).unwrap();
        let InboundEnvelope::ServerContent(content) = &envelopes[0] else {
            panic!("ServerContent attendu");
        };
        
        assert_eq!(content.parts.len(), 3);
        assert!(content.parts[0].is_thought);
        assert_eq!(content.parts[1].text.as_deref(), Some("Bonjour"));
        assert!(!content.parts[1].is_thought);
        assert_eq!(content.parts[2].audio.as_ref().unwrap().data, vec![1, 2, 3, 4]);
        assert_eq!(content.input_transcription.as_deref(), Some("salut"));
        assert!(content.turn_complete);
        assert!(!content.interrupted);
    }
    
    #[test]
    fn test_multiple_fields_in_priority_order() {
        let envelopes = decode_inbound(&text(
            r#"{"serverContent":{"turnComplete":true},"error":"boom","setupComplete":{}}"#,
        ))
        .unwrap();
        
        assert_eq!(envelopes[0], InboundEnvelope::SetupAck);
        assert_eq!(envelopes[1], InboundEnvelope::ErrorNotice { message: "boom".to_string() });
        assert!(matches!(envelopes[2], InboundEnvelope::ServerContent(_)));
    }
    
    #[test]
    fn test_bad_inline_audio_skips_only_that_part() {
        let envelopes = decode_inbound(&text(
            r#"{"setupComplete":{},"serverContent":{"modelTurn":{"parts":[{"text":"Bonjour"},{"inlineData":{"data":"@@@"}}]}}}"#,
        ))
        .unwrap();
        
        assert_eq!(envelopes.len(), 2);
        assert_eq!(envelopes[0], InboundEnvelope::SetupAck);
        let InboundEnvelope::ServerContent(content) = &envelopes[1] else {
            panic!("serverContent attendu : {:?}", envelopes[1]);
        };
        assert_eq!(content.parts.len(), 1);
        assert_eq!(content.parts[0].text.as_deref(), Some("Bonjour"));
        assert_eq!(content.rejected_parts, 1);
    }
    
    #[test]
    fn test_null_setup_complete_is_an_ack() {
        assert_eq!(
            decode_inbound(&text(r#"{"setupComplete":null}"#)).unwrap(),
            vec![InboundEnvelope::SetupAck]
        );
    }
    
    #[test]
    fn test_setup_envelope_shape() {
        let mut config = LiveConfig::test_config();
        config.input_transcription = true;
        let payload = OutboundEnvelope::Setup(SetupRequest::from(&config))
            .encode(AudioEncoding::Base64Json)
            .unwrap();
        
        let value: Value = serde_json::from_slice(payload.as_bytes()).unwrap();
        let setup = &value["setup"];
        assert_eq!(setup["model"], "models/test");
        assert_eq!(setup["generationConfig"]["responseModalities"][0], "AUDIO");
        assert_eq!(
            setup["generationConfig"]["speechConfig"]["voiceConfig"]["prebuiltVoiceConfig"]["voiceName"],
            "Puck"
        );
        assert_eq!(setup["systemInstruction"]["parts"][0]["text"], "test");
        assert!(setup.get("inputAudioTranscription").is_some());
        assert!(setup.get("outputAudioTranscription").is_none());
    }
    
    #[test]
    fn test_audio_envelope_base64_roundtrip() {
        let format = AudioFormat::canonical_input();
        let chunk = AudioChunk::from_samples(format, &[0, 1, -1, i16::MAX, i16::MIN]).unwrap();
        
        let payload = OutboundEnvelope::Audio(chunk.clone())
            .encode(AudioEncoding::Base64Json)
            .unwrap();
        let value: Value = serde_json::from_slice(payload.as_bytes()).unwrap();
        let audio = &value["realtimeInput"]["audio"];
        
        assert_eq!(audio["mimeType"], "audio/pcm;rate=16000");
        let decoded = BASE64.decode(audio["data"].as_str().unwrap()).unwrap();
        assert_eq!(decoded, chunk.payload());
    }
    
    #[test]
    fn test_audio_envelope_raw_binary() {
        let chunk = AudioChunk::silence(AudioFormat::canonical_input(), 4);
        let payload = OutboundEnvelope::Audio(chunk).encode(AudioEncoding::RawBinary).unwrap();
        assert_eq!(payload, Payload::Binary(vec![0u8; 8]));
    }
    
    #[test]
    fn test_turn_complete_envelope() {
        let payload = OutboundEnvelope::TurnComplete.encode(AudioEncoding::RawBinary).unwrap();
        let value: Value = serde_json::from_slice(payload.as_bytes()).unwrap();
        assert_eq!(value["realtimeInput"]["turnComplete"], true);
    }
}
