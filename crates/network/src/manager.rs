//! Machine à états du protocole conversationnel
//! 
//! Ce module implémente `LiveProtocol`, propriétaire unique de la connexion
//! courante. Il gère le cycle connect → handshake → ready → teardown, encode
//! les messages sortants et démultiplexe les messages entrants.
//!
//! `LiveProtocol` ne lance aucune boucle : son propriétaire (le contrôleur de
//! session) lit `ProtocolInbox` et lui passe chaque entrée, ce qui sérialise
//! toutes les transitions.
//!
//! # Timer de handshake
//! 
//! À l'ouverture, un timer est armé. S'il expire avant l'acquittement, l'état
//! passe à Ready (repli volontaire, pas une erreur). Le timer est étiqueté par
//! `ConnectionId` : un timer d'une connexion remplacée n'a aucun effet.

use std::sync::Arc;

use audio::AudioChunk;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::{
    Connection, ConnectionEvent, ConnectionId, Connector, InboundEnvelope, LiveConfig,
    NetworkError, NetworkResult, OutboundEnvelope, ProtocolState, ProtocolStats, ServerContent,
    SetupRequest, TransportEvent, decode_inbound,
};

/// Entrée de la machine à états
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProtocolInput {
    /// Événement d'une connexion
    Connection(ConnectionEvent),
    
    /// Expiration du timer de handshake d'une connexion
    HandshakeTimeout(ConnectionId),
}

/// Effets observables d'une transition
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProtocolEvent {
    /// Nouvel état du protocole
    StateChanged(ProtocolState),
    
    /// Handshake terminé (`forced` si par timeout)
    Ready { forced: bool },
    
    /// Texte de réponse finale du modèle
    AnswerText(String),
    
    /// Transcription de l'audio envoyé
    InputTranscription(String),
    
    /// Transcription de l'audio reçu
    OutputTranscription(String),
    
    /// Audio à jouer
    Audio(Vec<u8>),
    
    /// Le modèle a terminé son tour
    TurnComplete,
    
    /// Le modèle a été interrompu
    Interrupted,
    
    /// Erreur signalée par le serveur
    ErrorNotice(String),
    
    /// Connexion perdue
    TransportFailed(String),
    
    /// Connexion fermée par le serveur
    Closed { code: u16, reason: String },
    
    /// Message entrant rejeté (la connexion reste saine)
    ProtocolViolation(String),
}

/// Files d'entrée de la machine à états
pub struct ProtocolInbox {
    events: mpsc::UnboundedReceiver<ConnectionEvent>,
    timeouts: mpsc::UnboundedReceiver<ConnectionId>,
}

impl ProtocolInbox {
    /// Attend la prochaine entrée
    /// 
    /// Ne retourne `None` que si le `LiveProtocol` a été détruit.
    pub async fn recv(&mut self) -> Option<ProtocolInput> {
        tokio::select! {
            Some(event) = self.events.recv() => Some(ProtocolInput::Connection(event)),
            Some(id) = self.timeouts.recv() => Some(ProtocolInput::HandshakeTimeout(id)),
            else => None,
        }
    }
}

struct ActiveConnection {
    id: ConnectionId,
    connection: Box<dyn Connection>,
    handshake_timer: Option<JoinHandle<()>>,
}

impl ActiveConnection {
    fn cancel_timer(&mut self) {
        if let Some(timer) = self.handshake_timer.take() {
            timer.abort();
        }
    }
}

/// Machine à états du protocole
/// 
/// # Example
/// ```rust
/// use std::sync::Arc;
/// use network::{LiveConfig, LiveProtocol, ProtocolState, SimulatedConnector};
/// 
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let connector = SimulatedConnector::new().with_auto_accept();
/// let (mut protocol, mut inbox) = LiveProtocol::new(LiveConfig::test_config(), Arc::new(connector));
/// 
/// protocol.connect().unwrap();
/// let input = inbox.recv().await.unwrap();
/// protocol.handle_input(input);
/// assert_eq!(protocol.state(), ProtocolState::AwaitingSetup);
/// # }
/// ```
pub struct LiveProtocol {
    config: LiveConfig,
    connector: Arc<dyn Connector>,
    state: ProtocolState,
    current: Option<ActiveConnection>,
    next_id: u64,
    model_turn_active: bool,
    stats: ProtocolStats,
    events_tx: mpsc::UnboundedSender<ConnectionEvent>,
    timeouts_tx: mpsc::UnboundedSender<ConnectionId>,
}

impl LiveProtocol {
    /// Crée la machine à états et ses files d'entrée
    pub fn new(config: LiveConfig, connector: Arc<dyn Connector>) -> (Self, ProtocolInbox) {
        let (events_tx, events) = mpsc::unbounded_channel();
        let (timeouts_tx, timeouts) = mpsc::unbounded_channel();
        
        let protocol = Self {
            config,
            connector,
            state: ProtocolState::Disconnected,
            current: None,
            next_id: 0,
            model_turn_active: false,
            stats: ProtocolStats::default(),
            events_tx,
            timeouts_tx,
        };
        
        (protocol, ProtocolInbox { events, timeouts })
    }
    
    pub fn state(&self) -> ProtocolState {
        self.state
    }
    
    pub fn is_ready(&self) -> bool {
        self.state.is_ready()
    }
    
    pub fn connection_id(&self) -> Option<ConnectionId> {
        self.current.as_ref().map(|active| active.id)
    }
    
    /// Indique si un tour du modèle est en cours
    pub fn model_turn_active(&self) -> bool {
        self.model_turn_active
    }
    
    pub fn stats(&self) -> &ProtocolStats {
        &self.stats
    }
    
    pub fn config(&self) -> &LiveConfig {
        &self.config
    }
    
    /// Ouvre une nouvelle connexion
    /// 
    /// # Erreurs
    /// - `NetworkError::InvalidState` si une connexion existe déjà
    /// - `NetworkError::Transport` si le connecteur refuse (état Error)
    pub fn connect(&mut self) -> NetworkResult<Vec<ProtocolEvent>> {
        if self.state.is_connected() {
            return Err(NetworkError::invalid_state("connect", self.state));
        }
        
        // Une connexion en erreur n'est jamais reprise
        self.drop_connection();
        self.model_turn_active = false;
        
        self.next_id += 1;
        let id = ConnectionId(self.next_id);
        let url = self.config.connection_url();
        
        info!("🚀 Connexion {} via {}", id, self.connector.describe());
        
        let connection = match self.connector.open(id, &url, self.events_tx.clone()) {
            Ok(connection) => connection,
            Err(e) => {
                warn!("❌ Ouverture impossible : {}", e);
                self.state = ProtocolState::Error;
                return Err(e);
            }
        };
        
        self.stats.connections_opened += 1;
        self.current = Some(ActiveConnection {
            id,
            connection,
            handshake_timer: None,
        });
        
        Ok(self.transition(ProtocolState::Connecting).into_iter().collect())
    }
    
    /// Ferme la connexion courante
    pub fn close(&mut self) -> Vec<ProtocolEvent> {
        if let Some(active) = &self.current {
            info!("🔌 Fermeture de la connexion {}", active.id);
        }
        self.drop_connection();
        self.model_turn_active = false;
        self.transition(ProtocolState::Disconnected).into_iter().collect()
    }
    
    /// Applique une entrée et retourne ses effets
    pub fn handle_input(&mut self, input: ProtocolInput) -> Vec<ProtocolEvent> {
        match input {
            ProtocolInput::Connection(event) => self.handle_connection_event(event),
            ProtocolInput::HandshakeTimeout(id) => self.handle_handshake_timeout(id),
        }
    }
    
    fn handle_connection_event(&mut self, event: ConnectionEvent) -> Vec<ProtocolEvent> {
        if self.connection_id() != Some(event.id) {
            debug!("🕰️  Événement de la connexion périmée {} ignoré", event.id);
            return Vec::new();
        }
        
        match event.event {
            TransportEvent::Open => self.handle_open(),
            TransportEvent::Message(payload) => {
                self.stats.messages_received += 1;
                self.stats.bytes_received += payload.len() as u64;
                
                match decode_inbound(&payload) {
                    Ok(envelopes) => self.handle_envelopes(envelopes),
                    Err(e) => {
                        self.stats.protocol_violations += 1;
                        warn!("⚠️  Message ignoré : {}", e);
                        vec![ProtocolEvent::ProtocolViolation(e.to_string())]
                    }
                }
            }
            TransportEvent::Error(reason) => self.fail(reason),
            TransportEvent::Close { code, reason } => {
                info!("🔌 Connexion fermée par le serveur ({}) {}", code, reason);
                self.drop_connection();
                self.model_turn_active = false;
                
                let mut events = vec![ProtocolEvent::Closed { code, reason }];
                events.extend(self.transition(ProtocolState::Disconnected));
                events
            }
        }
    }
    
    /// Ouverture : envoie le Setup puis arme le timer de handshake
    fn handle_open(&mut self) -> Vec<ProtocolEvent> {
        if self.state != ProtocolState::Connecting {
            debug!("Ouverture ignorée dans l'état {}", self.state);
            return Vec::new();
        }
        
        let mut events: Vec<ProtocolEvent> =
            self.transition(ProtocolState::AwaitingSetup).into_iter().collect();
        
        let setup = OutboundEnvelope::Setup(SetupRequest::from(&self.config));
        if let Err(e) = self.send_envelope(&setup) {
            events.extend(self.fail(format!("envoi du Setup impossible : {}", e)));
            return events;
        }
        
        let timeout = self.config.handshake_timeout();
        let timeouts_tx = self.timeouts_tx.clone();
        if let Some(active) = self.current.as_mut() {
            let id = active.id;
            active.handshake_timer = Some(tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                let _ = timeouts_tx.send(id);
            }));
            debug!("⏱️  Setup envoyé sur {}, timeout dans {:?}", id, timeout);
        }
        
        events
    }
    
    /// Repli du handshake : force Ready si la connexion est toujours la
    /// courante, toujours ouverte et toujours en attente
    pub fn handle_handshake_timeout(&mut self, id: ConnectionId) -> Vec<ProtocolEvent> {
        let still_current = self
            .current
            .as_ref()
            .is_some_and(|active| active.id == id && active.connection.is_open());
        
        if !still_current || self.state != ProtocolState::AwaitingSetup {
            debug!("⏱️  Timer de handshake {} sans effet", id);
            return Vec::new();
        }
        
        if let Some(active) = self.current.as_mut() {
            active.handshake_timer = None;
        }
        
        warn!("⏱️  Pas d'acquittement du Setup, passage forcé en Ready");
        self.stats.handshakes_forced += 1;
        
        let mut events: Vec<ProtocolEvent> =
            self.transition(ProtocolState::Ready).into_iter().collect();
        events.push(ProtocolEvent::Ready { forced: true });
        events
    }
    
    fn handle_envelope(&mut self, envelope: InboundEnvelope) -> Vec<ProtocolEvent> {
        match envelope {
            InboundEnvelope::SetupAck => {
                if self.state != ProtocolState::AwaitingSetup {
                    debug!("Acquittement du Setup ignoré dans l'état {}", self.state);
                    return Vec::new();
                }
                
                if let Some(active) = self.current.as_mut() {
                    active.cancel_timer();
                }
                
                info!("✅ Setup acquitté");
                self.stats.handshakes_acknowledged += 1;
                
                let mut events: Vec<ProtocolEvent> =
                    self.transition(ProtocolState::Ready).into_iter().collect();
                events.push(ProtocolEvent::Ready { forced: false });
                events
            }
            InboundEnvelope::ErrorNotice { message } => {
                warn!("❌ Erreur du serveur : {}", message);
                self.drop_connection();
                self.model_turn_active = false;
                
                let mut events = vec![ProtocolEvent::ErrorNotice(message)];
                events.extend(self.transition(ProtocolState::Error));
                events
            }
            InboundEnvelope::BinaryAudio(bytes) => vec![ProtocolEvent::Audio(bytes)],
            InboundEnvelope::ServerContent(content) => self.handle_server_content(content),
        }
    }
    
    /// Applique les enveloppes d'un message dans l'ordre
    /// 
    /// Une erreur serveur abandonne la connexion : le reste du message
    /// n'est pas traité.
    fn handle_envelopes(&mut self, envelopes: Vec<InboundEnvelope>) -> Vec<ProtocolEvent> {
        let mut events = Vec::new();
        for envelope in envelopes {
            events.extend(self.handle_envelope(envelope));
            if self.state == ProtocolState::Error {
                break;
            }
        }
        events
    }
    
    fn handle_server_content(&mut self, content: ServerContent) -> Vec<ProtocolEvent> {
        let mut events = Vec::new();
        
        if content.rejected_parts > 0 {
            self.stats.protocol_violations += content.rejected_parts as u64;
            events.push(ProtocolEvent::ProtocolViolation(format!(
                "{} part(s) audio illisible(s) ignorée(s)",
                content.rejected_parts
            )));
        }
        
        if !content.parts.is_empty() {
            self.model_turn_active = true;
        }
        
        for part in content.parts {
            match (part.text, part.is_thought) {
                (Some(text), true) => debug!("💭 {}", text),
                (Some(text), false) => events.push(ProtocolEvent::AnswerText(text)),
                (None, _) => {}
            }
            if let Some(audio) = part.audio {
                events.push(ProtocolEvent::Audio(audio.data));
            }
        }
        
        if let Some(text) = content.input_transcription {
            events.push(ProtocolEvent::InputTranscription(text));
        }
        if let Some(text) = content.output_transcription {
            events.push(ProtocolEvent::OutputTranscription(text));
        }
        
        if content.interrupted {
            self.model_turn_active = false;
            events.push(ProtocolEvent::Interrupted);
        }
        
        if content.turn_complete {
            self.model_turn_active = false;
            events.push(ProtocolEvent::TurnComplete);
        }
        
        events
    }
    
    /// Envoie un chunk audio
    /// 
    /// Hors état Ready, le chunk est perdu avec un warning (jamais mis en
    /// file, jamais fatal).
    /// 
    /// # Retourne
    /// `true` si le chunk a été transmis
    pub fn send_audio(&mut self, chunk: AudioChunk) -> bool {
        if !self.is_ready() {
            self.stats.audio_chunks_dropped += 1;
            warn!("⚠️  Chunk audio ignoré : état {}", self.state);
            return false;
        }
        
        match self.send_envelope(&OutboundEnvelope::Audio(chunk)) {
            Ok(()) => {
                self.stats.audio_chunks_sent += 1;
                true
            }
            Err(e) => {
                self.stats.audio_chunks_dropped += 1;
                warn!("⚠️  Envoi audio échoué : {}", e);
                false
            }
        }
    }
    
    /// Envoie le signal de fin de tour
    /// 
    /// # Retourne
    /// `true` si le message a été transmis (zéro envoi hors état Ready)
    pub fn send_turn_complete(&mut self) -> bool {
        if !self.is_ready() {
            warn!("⚠️  TurnComplete ignoré : état {}", self.state);
            return false;
        }
        
        match self.send_envelope(&OutboundEnvelope::TurnComplete) {
            Ok(()) => {
                debug!("📤 TurnComplete envoyé");
                true
            }
            Err(e) => {
                warn!("⚠️  Envoi du TurnComplete échoué : {}", e);
                false
            }
        }
    }
    
    fn send_envelope(&mut self, envelope: &OutboundEnvelope) -> NetworkResult<()> {
        let active = self.current.as_ref().ok_or(NetworkError::ConnectionClosed)?;
        let payload = envelope.encode(self.config.audio_encoding)?;
        let size = payload.len() as u64;
        
        active.connection.send(payload)?;
        trace!("📤 {} ({} octets)", envelope.kind(), size);
        
        self.stats.messages_sent += 1;
        self.stats.bytes_sent += size;
        Ok(())
    }
    
    /// Erreur de transport : connexion abandonnée, état Error
    fn fail(&mut self, reason: String) -> Vec<ProtocolEvent> {
        warn!("❌ Erreur de transport : {}", reason);
        self.drop_connection();
        self.model_turn_active = false;
        
        let mut events = vec![ProtocolEvent::TransportFailed(reason)];
        events.extend(self.transition(ProtocolState::Error));
        events
    }
    
    fn drop_connection(&mut self) {
        if let Some(mut active) = self.current.take() {
            active.cancel_timer();
            active.connection.close();
        }
    }
    
    /// Change d'état ; une transition vers l'état courant est un no-op
    fn transition(&mut self, next: ProtocolState) -> Option<ProtocolEvent> {
        if self.state == next {
            return None;
        }
        
        debug!("🔄 {} → {}", self.state, next);
        self.state = next;
        Some(ProtocolEvent::StateChanged(next))
    }
}

impl Drop for LiveProtocol {
    fn drop(&mut self) {
        self.drop_connection();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AudioEncoding, Payload, SimulatedConnector, SimulatedLink};
    use audio::AudioFormat;
    use std::time::Duration;
    
    struct Harness {
        protocol: LiveProtocol,
        inbox: ProtocolInbox,
        connector: SimulatedConnector,
    }
    
    impl Harness {
        fn new() -> Self {
            Self::with_config(LiveConfig::test_config())
        }
        
        fn with_config(config: LiveConfig) -> Self {
            let connector = SimulatedConnector::new();
            let (protocol, inbox) = LiveProtocol::new(config, Arc::new(connector.clone()));
            Self { protocol, inbox, connector }
        }
        
        async fn pump(&mut self) -> Vec<ProtocolEvent> {
            let input = self.inbox.recv().await.unwrap();
            self.protocol.handle_input(input)
        }
        
        /// Connecte et ouvre, retourne le lien (état AwaitingSetup)
        async fn open(&mut self) -> SimulatedLink {
            self.protocol.connect().unwrap();
            let link = self.connector.last_link().unwrap();
            link.accept();
            self.pump().await;
            link
        }
    }
    
    fn chunk() -> AudioChunk {
        AudioChunk::silence(AudioFormat::canonical_input(), 160)
    }
    
    #[tokio::test(start_paused = true)]
    async fn test_setup_sent_once_on_open() {
        let mut h = Harness::new();
        
        let events = h.protocol.connect().unwrap();
        assert_eq!(events, vec![ProtocolEvent::StateChanged(ProtocolState::Connecting)]);
        
        let link = h.connector.last_link().unwrap();
        assert!(link.sent().is_empty());
        
        link.accept();
        let events = h.pump().await;
        assert_eq!(events, vec![ProtocolEvent::StateChanged(ProtocolState::AwaitingSetup)]);
        
        let sent = link.sent_json();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].get("setup").is_some());
    }
    
    #[tokio::test(start_paused = true)]
    async fn test_ack_cancels_timeout() {
        let mut h = Harness::new();
        let link = h.open().await;
        
        tokio::time::sleep(Duration::from_secs(2)).await;
        link.deliver_text(r#"{"setupComplete":{}}"#);
        let events = h.pump().await;
        assert_eq!(
            events,
            vec![
                ProtocolEvent::StateChanged(ProtocolState::Ready),
                ProtocolEvent::Ready { forced: false },
            ]
        );
        
        // Le timer annulé ne se déclenche jamais
        let waited = tokio::time::timeout(Duration::from_secs(20), h.inbox.recv()).await;
        assert!(waited.is_err());
        assert_eq!(h.protocol.stats().handshakes_forced, 0);
    }
    
    #[tokio::test(start_paused = true)]
    async fn test_timeout_forces_ready_once() {
        let mut h = Harness::new();
        let link = h.open().await;
        let start = tokio::time::Instant::now();
        
        let events = h.pump().await;
        assert!(start.elapsed() >= Duration::from_secs(10));
        assert!(start.elapsed() < Duration::from_millis(10_100));
        assert_eq!(
            events,
            vec![
                ProtocolEvent::StateChanged(ProtocolState::Ready),
                ProtocolEvent::Ready { forced: true },
            ]
        );
        
        // Acquittement tardif à t=11s : sans effet
        tokio::time::sleep(Duration::from_secs(1)).await;
        link.deliver_text(r#"{"setupComplete":{}}"#);
        assert!(h.pump().await.is_empty());
        assert_eq!(h.protocol.state(), ProtocolState::Ready);
    }
    
    #[tokio::test(start_paused = true)]
    async fn test_stale_timer_ignored() {
        let mut h = Harness::new();
        let old = h.open().await;
        let old_id = old.id();
        
        h.protocol.close();
        h.open().await;
        
        // Timer de l'ancienne connexion : aucun effet
        assert!(h.protocol.handle_handshake_timeout(old_id).is_empty());
        assert_eq!(h.protocol.state(), ProtocolState::AwaitingSetup);
        
        // Un événement de l'ancienne connexion est ignoré aussi
        old.deliver_text(r#"{"setupComplete":{}}"#);
        assert!(h.pump().await.is_empty());
        assert_eq!(h.protocol.state(), ProtocolState::AwaitingSetup);
    }
    
    #[tokio::test(start_paused = true)]
    async fn test_timeout_requires_open_connection() {
        let mut h = Harness::new();
        let link = h.open().await;
        
        // Le socket est tombé sans que l'événement soit encore traité
        link.fail("reset");
        let id = link.id();
        assert!(h.protocol.handle_handshake_timeout(id).is_empty());
        assert_eq!(h.protocol.state(), ProtocolState::AwaitingSetup);
    }
    
    #[tokio::test(start_paused = true)]
    async fn test_audio_dropped_until_ready() {
        let mut h = Harness::new();
        assert!(!h.protocol.send_audio(chunk()));
        
        let link = h.open().await;
        assert!(!h.protocol.send_audio(chunk()));
        assert!(!h.protocol.send_turn_complete());
        
        link.deliver_text(r#"{"setupComplete":{}}"#);
        h.pump().await;
        assert!(h.protocol.send_audio(chunk()));
        assert!(h.protocol.send_turn_complete());
        
        let sent = link.sent_json();
        assert_eq!(sent.len(), 3);
        assert!(sent[0].get("setup").is_some());
        assert!(sent[1]["realtimeInput"].get("audio").is_some());
        assert_eq!(sent[2]["realtimeInput"]["turnComplete"], true);
        assert_eq!(h.protocol.stats().audio_chunks_dropped, 2);
    }
    
    #[tokio::test(start_paused = true)]
    async fn test_raw_binary_audio() {
        let config = LiveConfig {
            audio_encoding: AudioEncoding::RawBinary,
            ..LiveConfig::test_config()
        };
        let mut h = Harness::with_config(config);
        let link = h.open().await;
        link.deliver_text(r#"{"setupComplete":{}}"#);
        h.pump().await;
        
        assert!(h.protocol.send_audio(chunk()));
        assert_eq!(link.sent()[1], Payload::Binary(vec![0u8; 320]));
    }
    
    #[tokio::test(start_paused = true)]
    async fn test_binary_payload_routed_to_audio() {
        let mut h = Harness::new();
        let link = h.open().await;
        
        link.deliver_binary(vec![0x00, 0x10, 0x20, 0x30]);
        assert_eq!(h.pump().await, vec![ProtocolEvent::Audio(vec![0x00, 0x10, 0x20, 0x30])]);
    }
    
    #[tokio::test(start_paused = true)]
    async fn test_server_content_demux() {
        let mut h = Harness::new();
        let link = h.open().await;
        
        link.deliver_text(
            r#"{"serverContent":{"modelTurn":{"parts":[
                {"text":"hmm","thought":true},
                {"text":"Bonjour"},
                {"inlineData":{"mimeType":"audio/pcm;rate=24000","data":"AAECAw=="}}
            ]}}}"#,
        );
        let events = h.pump().await;
        assert_eq!(
            events,
            vec![
                ProtocolEvent::AnswerText("Bonjour".to_string()),
                ProtocolEvent::Audio(vec![0, 1, 2, 3]),
            ]
        );
        assert!(h.protocol.model_turn_active());
        
        link.deliver_text(r#"{"serverContent":{"turnComplete":true}}"#);
        assert_eq!(h.pump().await, vec![ProtocolEvent::TurnComplete]);
        assert!(!h.protocol.model_turn_active());
    }
    
    #[tokio::test(start_paused = true)]
    async fn test_protocol_violation_keeps_connection() {
        let mut h = Harness::new();
        let link = h.open().await;
        
        link.deliver_text("{broken");
        let events = h.pump().await;
        assert!(matches!(events[..], [ProtocolEvent::ProtocolViolation(_)]));
        assert_eq!(h.protocol.state(), ProtocolState::AwaitingSetup);
        assert!(link.is_open());
    }
    
    #[tokio::test(start_paused = true)]
    async fn test_unreadable_inline_audio_keeps_rest_of_message() {
        let mut h = Harness::new();
        let link = h.open().await;
        
        link.deliver_text(
            r#"{"setupComplete":{},"serverContent":{"modelTurn":{"parts":[{"text":"Bonjour"},{"inlineData":{"data":"@@@"}}]}}}"#,
        );
        let events = h.pump().await;
        
        assert_eq!(h.protocol.state(), ProtocolState::Ready);
        assert!(events.contains(&ProtocolEvent::Ready { forced: false }));
        assert!(events.contains(&ProtocolEvent::AnswerText("Bonjour".to_string())));
        assert!(events.iter().any(|e| matches!(e, ProtocolEvent::ProtocolViolation(_))));
        assert!(!events.iter().any(|e| matches!(e, ProtocolEvent::Audio(_))));
        assert_eq!(h.protocol.stats().protocol_violations, 1);
        assert!(link.is_open());
    }
    
    #[tokio::test(start_paused = true)]
    async fn test_error_notice_stops_rest_of_message() {
        let mut h = Harness::new();
        let link = h.open().await;
        
        link.deliver_text(
            r#"{"error":{"message":"quota"},"serverContent":{"modelTurn":{"parts":[{"text":"trop tard"}]},"turnComplete":true}}"#,
        );
        let events = h.pump().await;
        
        assert_eq!(
            events,
            vec![
                ProtocolEvent::ErrorNotice("quota".to_string()),
                ProtocolEvent::StateChanged(ProtocolState::Error),
            ]
        );
        assert!(!h.protocol.model_turn_active());
        assert!(link.closed_locally());
    }
    
    #[tokio::test(start_paused = true)]
    async fn test_remote_error_notice() {
        let mut h = Harness::new();
        let link = h.open().await;
        
        link.deliver_text(r#"{"error":{"message":"modèle inconnu"}}"#);
        let events = h.pump().await;
        assert_eq!(
            events,
            vec![
                ProtocolEvent::ErrorNotice("modèle inconnu".to_string()),
                ProtocolEvent::StateChanged(ProtocolState::Error),
            ]
        );
        assert!(link.closed_locally());
        assert_eq!(h.protocol.connection_id(), None);
    }
    
    #[tokio::test(start_paused = true)]
    async fn test_transport_error_then_full_reconnect() {
        let mut h = Harness::new();
        let link = h.open().await;
        link.deliver_text(r#"{"setupComplete":{}}"#);
        h.pump().await;
        
        link.fail("connexion réinitialisée");
        let events = h.pump().await;
        assert_eq!(events[1], ProtocolEvent::StateChanged(ProtocolState::Error));
        
        // Nouvelle connexion : nouveau handshake complet
        let link = h.open().await;
        assert_eq!(h.protocol.state(), ProtocolState::AwaitingSetup);
        assert_eq!(link.sent_json().len(), 1);
        assert_eq!(h.connector.connection_count(), 2);
    }
    
    #[tokio::test(start_paused = true)]
    async fn test_remote_close() {
        let mut h = Harness::new();
        let link = h.open().await;
        
        link.close_remote(1000, "bye");
        let events = h.pump().await;
        assert_eq!(
            events,
            vec![
                ProtocolEvent::Closed { code: 1000, reason: "bye".to_string() },
                ProtocolEvent::StateChanged(ProtocolState::Disconnected),
            ]
        );
    }
    
    #[tokio::test]
    async fn test_connect_twice_rejected() {
        let mut h = Harness::new();
        h.protocol.connect().unwrap();
        assert!(matches!(h.protocol.connect(), Err(NetworkError::InvalidState { .. })));
    }
    
    #[tokio::test]
    async fn test_refused_connection_enters_error() {
        let mut h = Harness::new();
        h.connector.refuse_connections(true);
        assert!(h.protocol.connect().is_err());
        assert_eq!(h.protocol.state(), ProtocolState::Error);
        
        h.connector.refuse_connections(false);
        assert!(h.protocol.connect().is_ok());
    }
    
    #[test]
    fn test_close_when_disconnected_is_noop() {
        let connector = SimulatedConnector::new();
        let (mut protocol, _inbox) = LiveProtocol::new(LiveConfig::test_config(), Arc::new(connector));
        assert!(protocol.close().is_empty());
    }
}
