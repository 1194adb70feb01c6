//! Contrôleur de session
//! 
//! Acteur propriétaire unique du protocole, du pipeline de capture et du
//! handle de lecture. Toutes les entrées (intentions utilisateur, événements
//! réseau, timer de handshake, chunks capturés, fin de lecture) deviennent
//! des messages typés consommés un par un par la même boucle : une seule
//! transition à la fois, sans drapeau partagé entre threads.
//!
//! # Règles
//! 
//! - `start_recording` exige l'état Ready
//! - `stop_recording` envoie exactement un TurnComplete (perdu hors Ready)
//! - toute sortie de l'état Ready arrête l'enregistrement
//! - fermeture : capture, puis lecture, puis connexion

use std::sync::Arc;

use audio::{
    CaptureEvent, CapturePipeline, InputDevice, OutputDevice, PlaybackEvent, PlaybackHandle,
    PlaybackPipeline, ScratchStorage,
};
use network::{Connector, LiveProtocol, ProtocolEvent, ProtocolInbox, ProtocolState};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::{
    IntentOutcome, Session, SessionConfig, SessionError, SessionEvent, SessionResult, SessionStats,
};

/// Capacité du canal d'événements publiés
const EVENT_CAPACITY: usize = 256;

/// Collaborateurs externes de la session
pub struct SessionDevices {
    pub input: Box<dyn InputDevice>,
    pub output: Arc<dyn OutputDevice>,
    pub storage: Arc<dyn ScratchStorage>,
    pub connector: Arc<dyn Connector>,
}

type Reply = oneshot::Sender<SessionResult<IntentOutcome>>;

enum Intent {
    Connect(Reply),
    Disconnect(Reply),
    StartRecording(Reply),
    StopRecording(Reply),
    ToggleConnection(Reply),
    ToggleRecording(Reply),
    Snapshot(oneshot::Sender<Session>),
    Stats(oneshot::Sender<SessionStats>),
    Shutdown(oneshot::Sender<()>),
}

/// Handle public de la session
/// 
/// Clonable ; chaque méthode attend que l'acteur ait appliqué l'intention.
#[derive(Clone)]
pub struct SessionHandle {
    intents: mpsc::UnboundedSender<Intent>,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionHandle {
    async fn request(&self, make: impl FnOnce(Reply) -> Intent) -> SessionResult<IntentOutcome> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.intents
            .send(make(reply_tx))
            .map_err(|_| SessionError::Closed)?;
        reply_rx.await.map_err(|_| SessionError::Closed)?
    }
    
    /// Ouvre la connexion (no-op si une connexion existe)
    pub async fn connect(&self) -> SessionResult<IntentOutcome> {
        self.request(Intent::Connect).await
    }
    
    /// Ferme la connexion après avoir arrêté l'enregistrement
    pub async fn disconnect(&self) -> SessionResult<IntentOutcome> {
        self.request(Intent::Disconnect).await
    }
    
    /// Démarre l'enregistrement
    /// 
    /// # Erreurs
    /// - `SessionError::NotReady` si le handshake n'est pas terminé
    /// - `SessionError::AlreadyRecording` si un enregistrement est en cours
    /// - `SessionError::Audio` si le périphérique refuse
    pub async fn start_recording(&self) -> SessionResult<IntentOutcome> {
        self.request(Intent::StartRecording).await
    }
    
    /// Arrête l'enregistrement et signale la fin du tour
    pub async fn stop_recording(&self) -> SessionResult<IntentOutcome> {
        self.request(Intent::StopRecording).await
    }
    
    /// `connect` ou `disconnect` selon l'état courant
    pub async fn toggle_connection(&self) -> SessionResult<IntentOutcome> {
        self.request(Intent::ToggleConnection).await
    }
    
    /// `start_recording` ou `stop_recording` selon l'état courant
    pub async fn toggle_recording(&self) -> SessionResult<IntentOutcome> {
        self.request(Intent::ToggleRecording).await
    }
    
    /// Instantané de l'état courant
    pub async fn snapshot(&self) -> SessionResult<Session> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.intents
            .send(Intent::Snapshot(reply_tx))
            .map_err(|_| SessionError::Closed)?;
        reply_rx.await.map_err(|_| SessionError::Closed)
    }
    
    /// Compteurs du protocole et de la capture
    pub async fn stats(&self) -> SessionResult<SessionStats> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.intents
            .send(Intent::Stats(reply_tx))
            .map_err(|_| SessionError::Closed)?;
        reply_rx.await.map_err(|_| SessionError::Closed)
    }
    
    /// Abonnement aux événements publiés à partir de maintenant
    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }
    
    /// Termine la session dans l'ordre : capture, lecture, connexion
    pub async fn shutdown(&self) {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.intents.send(Intent::Shutdown(reply_tx)).is_ok() {
            let _ = reply_rx.await;
        }
    }
}

/// Lance une session sur le runtime tokio courant
/// 
/// # Erreurs
/// - `SessionError::Config` si la configuration est incohérente
pub fn spawn_session(config: SessionConfig, devices: SessionDevices) -> SessionResult<SessionHandle> {
    config.validate().map_err(SessionError::Config)?;
    
    let (capture_tx, capture_rx) = mpsc::channel(config.audio.capture_queue_capacity);
    let capture = CapturePipeline::new(
        devices.input,
        config.audio.capture_format,
        config.audio.input_options(),
        capture_tx,
    );
    
    let (playback, playback_rx) = PlaybackPipeline::spawn(
        devices.output,
        devices.storage,
        config.audio.playback_format,
        config.audio.playback_grace(),
    );
    
    let (protocol, inbox) = LiveProtocol::new(config.live.clone(), devices.connector);
    
    let (intents_tx, intents_rx) = mpsc::unbounded_channel();
    let (events_tx, _) = broadcast::channel(EVENT_CAPACITY);
    
    let controller = SessionController {
        defer_while_playing: config.defer_recording_while_playing,
        protocol,
        capture,
        playback,
        recording: false,
        playing: false,
        processing: false,
        deferred_start: false,
        events: events_tx.clone(),
    };
    
    tokio::spawn(controller.run(intents_rx, inbox, capture_rx, playback_rx));
    info!("🎬 Session démarrée");
    
    Ok(SessionHandle {
        intents: intents_tx,
        events: events_tx,
    })
}

struct SessionController {
    defer_while_playing: bool,
    protocol: LiveProtocol,
    capture: CapturePipeline,
    playback: PlaybackHandle,
    recording: bool,
    playing: bool,
    processing: bool,
    deferred_start: bool,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionController {
    async fn run(
        mut self,
        mut intents: mpsc::UnboundedReceiver<Intent>,
        mut inbox: ProtocolInbox,
        mut capture_rx: mpsc::Receiver<CaptureEvent>,
        mut playback_rx: mpsc::UnboundedReceiver<PlaybackEvent>,
    ) {
        loop {
            tokio::select! {
                intent = intents.recv() => match intent {
                    Some(Intent::Shutdown(reply)) => {
                        self.teardown().await;
                        let _ = reply.send(());
                        break;
                    }
                    Some(intent) => self.handle_intent(intent),
                    None => {
                        self.teardown().await;
                        break;
                    }
                },
                Some(input) = inbox.recv() => {
                    let events = self.protocol.handle_input(input);
                    self.apply_protocol_events(events);
                }
                Some(event) = capture_rx.recv() => self.handle_capture(event),
                Some(event) = playback_rx.recv() => self.handle_playback(event),
            }
        }
        
        info!("🛑 Session terminée");
    }
    
    fn handle_intent(&mut self, intent: Intent) {
        match intent {
            Intent::Connect(reply) => {
                let _ = reply.send(self.connect());
            }
            Intent::Disconnect(reply) => {
                let _ = reply.send(Ok(self.disconnect()));
            }
            Intent::StartRecording(reply) => {
                let _ = reply.send(self.start_recording());
            }
            Intent::StopRecording(reply) => {
                let _ = reply.send(Ok(self.stop_recording()));
            }
            Intent::ToggleConnection(reply) => {
                let outcome = if self.protocol.state().is_connected() {
                    Ok(self.disconnect())
                } else {
                    self.connect()
                };
                let _ = reply.send(outcome);
            }
            Intent::ToggleRecording(reply) => {
                let outcome = if self.recording || self.deferred_start {
                    Ok(self.stop_recording())
                } else {
                    self.start_recording()
                };
                let _ = reply.send(outcome);
            }
            Intent::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
            Intent::Stats(reply) => {
                let _ = reply.send(SessionStats {
                    protocol: self.protocol.stats().clone(),
                    capture: self.capture.stats(),
                });
            }
            Intent::Shutdown(_) => {}
        }
    }
    
    fn snapshot(&self) -> Session {
        Session {
            state: self.protocol.state(),
            recording: self.recording,
            playing: self.playing,
            model_turn_active: self.protocol.model_turn_active(),
            processing: self.processing,
            recording_deferred: self.deferred_start,
        }
    }
    
    fn connect(&mut self) -> SessionResult<IntentOutcome> {
        if self.protocol.state().is_connected() {
            return Ok(IntentOutcome::NoOp(format!(
                "déjà connecté ({})",
                self.protocol.state()
            )));
        }
        
        self.processing = false;
        let events = self.protocol.connect()?;
        self.apply_protocol_events(events);
        Ok(IntentOutcome::Done)
    }
    
    fn disconnect(&mut self) -> IntentOutcome {
        let state = self.protocol.state();
        if state == ProtocolState::Disconnected {
            return IntentOutcome::NoOp("aucune connexion".to_string());
        }
        
        // Jamais de connexion fermée sous un tap ouvert
        self.halt_recording();
        self.deferred_start = false;
        self.processing = false;
        
        let events = self.protocol.close();
        self.apply_protocol_events(events);
        IntentOutcome::Done
    }
    
    fn start_recording(&mut self) -> SessionResult<IntentOutcome> {
        if self.recording {
            return Err(SessionError::AlreadyRecording);
        }
        
        let state = self.protocol.state();
        if !state.is_ready() {
            return Err(SessionError::NotReady(state));
        }
        
        if self.playing && self.defer_while_playing {
            if !self.deferred_start {
                info!("⏳ Enregistrement différé jusqu'à la fin de la lecture");
            }
            self.deferred_start = true;
            return Ok(IntentOutcome::Deferred);
        }
        
        self.begin_capture()?;
        Ok(IntentOutcome::Done)
    }
    
    fn begin_capture(&mut self) -> SessionResult<()> {
        if let Err(e) = self.capture.start() {
            warn!("❌ Démarrage de la capture impossible : {}", e);
            self.emit(SessionEvent::AudioError(e.to_string()));
            return Err(e.into());
        }
        
        self.recording = true;
        self.processing = false;
        info!("🎤 Enregistrement démarré");
        self.emit(SessionEvent::RecordingStarted);
        Ok(())
    }
    
    fn stop_recording(&mut self) -> IntentOutcome {
        if !self.recording {
            if self.deferred_start {
                self.deferred_start = false;
                return IntentOutcome::NoOp("démarrage différé annulé".to_string());
            }
            return IntentOutcome::NoOp("pas d'enregistrement en cours".to_string());
        }
        
        self.halt_recording();
        
        if self.protocol.send_turn_complete() {
            self.processing = true;
        }
        
        IntentOutcome::Done
    }
    
    /// Arrête la capture sans signaler de fin de tour
    fn halt_recording(&mut self) {
        if !self.recording {
            return;
        }
        
        if let Err(e) = self.capture.stop() {
            warn!("⚠️  Arrêt de la capture : {}", e);
            self.emit(SessionEvent::AudioError(e.to_string()));
        }
        
        self.recording = false;
        info!("🛑 Enregistrement arrêté");
        self.emit(SessionEvent::RecordingStopped);
    }
    
    fn apply_protocol_events(&mut self, events: Vec<ProtocolEvent>) {
        for event in events {
            let published = match event {
                ProtocolEvent::StateChanged(state) => {
                    if !state.is_ready() {
                        self.halt_recording();
                        self.deferred_start = false;
                        self.processing = false;
                    }
                    SessionEvent::StateChanged(state)
                }
                ProtocolEvent::Ready { forced } => SessionEvent::Ready { forced },
                ProtocolEvent::AnswerText(text) => {
                    info!("💬 {}", text);
                    SessionEvent::AnswerText(text)
                }
                ProtocolEvent::InputTranscription(text) => SessionEvent::InputTranscription(text),
                ProtocolEvent::OutputTranscription(text) => SessionEvent::OutputTranscription(text),
                ProtocolEvent::Audio(bytes) => {
                    self.processing = false;
                    if let Err(e) = self.playback.enqueue(bytes) {
                        warn!("⚠️  Audio reçu perdu : {}", e);
                    }
                    continue;
                }
                ProtocolEvent::TurnComplete => {
                    self.processing = false;
                    SessionEvent::ModelTurnComplete
                }
                ProtocolEvent::Interrupted => {
                    self.playback.discard_pending();
                    SessionEvent::Interrupted
                }
                ProtocolEvent::ErrorNotice(message) => SessionEvent::ErrorNotice(message),
                ProtocolEvent::TransportFailed(reason) => SessionEvent::TransportFailed(reason),
                ProtocolEvent::Closed { code, reason } => SessionEvent::Closed { code, reason },
                ProtocolEvent::ProtocolViolation(reason) => SessionEvent::ProtocolViolation(reason),
            };
            self.emit(published);
        }
    }
    
    fn handle_capture(&mut self, event: CaptureEvent) {
        match event {
            CaptureEvent::Chunk(chunk) => {
                if self.recording {
                    self.protocol.send_audio(chunk);
                } else {
                    debug!("Chunk résiduel après l'arrêt ignoré");
                }
            }
            CaptureEvent::ConversionFailed(reason) => {
                debug!("⚠️  Conversion échouée : {}", reason);
                self.emit(SessionEvent::AudioError(reason));
            }
        }
    }
    
    fn handle_playback(&mut self, event: PlaybackEvent) {
        match event {
            PlaybackEvent::Started { size_bytes } => {
                self.playing = true;
                self.emit(SessionEvent::PlaybackStarted { size_bytes });
            }
            PlaybackEvent::Finished => {
                self.playing = false;
                self.emit(SessionEvent::PlaybackFinished);
                self.resume_deferred();
            }
            PlaybackEvent::Failed(reason) => {
                self.playing = false;
                self.emit(SessionEvent::PlaybackFailed(reason));
                self.resume_deferred();
            }
        }
    }
    
    /// Démarre l'enregistrement différé si la session est toujours prête
    fn resume_deferred(&mut self) {
        if !std::mem::take(&mut self.deferred_start) {
            return;
        }
        
        if self.protocol.is_ready() && !self.recording {
            // L'erreur est déjà publiée en AudioError
            let _ = self.begin_capture();
        }
    }
    
    async fn teardown(&mut self) {
        info!("🧹 Fermeture de la session");
        self.halt_recording();
        self.deferred_start = false;
        self.playback.shutdown().await;
        self.playing = false;
        let events = self.protocol.close();
        self.apply_protocol_events(events);
    }
    
    fn emit(&self, event: SessionEvent) {
        // Aucun abonné n'est une situation normale
        let _ = self.events.send(event);
    }
}
