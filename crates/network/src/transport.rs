//! Transports de la connexion persistante
//! 
//! Ce module implémente le trait `Connector` de deux façons :
//! - `WebSocketConnector` : WebSocket (ws:// ou wss://) avec tokio-tungstenite
//! - `SimulatedConnector` : connexion en mémoire pilotée par les tests via
//!   `SimulatedLink` (ouverture, messages entrants, erreurs, fermeture)
//!
//! # Architecture
//! 
//! Chaque connexion WebSocket est une tâche tokio qui possède le socket.
//! Les envois passent par un canal non borné (jamais de blocage côté
//! appelant) et les événements remontent étiquetés par `ConnectionId`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::{
    Connection, ConnectionEvent, ConnectionId, Connector, NetworkError, NetworkResult, Payload,
    TransportEvent,
};

/// Code de fermeture quand le flux se termine sans trame Close
const ABNORMAL_CLOSURE: u16 = 1006;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

enum SocketCommand {
    Send(Payload),
    Close,
}

/// Connecteur WebSocket réel
/// 
/// # Example
/// ```rust,no_run
/// use network::{ConnectionId, Connector, WebSocketConnector};
/// use tokio::sync::mpsc;
/// 
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let (tx, mut rx) = mpsc::unbounded_channel();
/// let connection = WebSocketConnector::new().open(ConnectionId(1), "ws://127.0.0.1:9001", tx)?;
/// let first = rx.recv().await;
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug, Default)]
pub struct WebSocketConnector;

impl WebSocketConnector {
    pub fn new() -> Self {
        Self
    }
}

struct WebSocketConnection {
    commands: mpsc::UnboundedSender<SocketCommand>,
    open: Arc<AtomicBool>,
}

impl Connection for WebSocketConnection {
    fn send(&self, payload: Payload) -> NetworkResult<()> {
        if !self.is_open() {
            return Err(NetworkError::ConnectionClosed);
        }
        self.commands
            .send(SocketCommand::Send(payload))
            .map_err(|_| NetworkError::ConnectionClosed)
    }
    
    fn close(&self) {
        let _ = self.commands.send(SocketCommand::Close);
        self.open.store(false, Ordering::SeqCst);
    }
    
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

impl Connector for WebSocketConnector {
    fn open(
        &self,
        id: ConnectionId,
        url: &str,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> NetworkResult<Box<dyn Connection>> {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let open = Arc::new(AtomicBool::new(false));
        
        tokio::spawn(run_socket(id, url.to_string(), command_rx, events, Arc::clone(&open)));
        
        Ok(Box::new(WebSocketConnection {
            commands: command_tx,
            open,
        }))
    }
    
    fn describe(&self) -> String {
        "WebSocket".to_string()
    }
}

/// Tâche propriétaire du socket
async fn run_socket(
    id: ConnectionId,
    url: String,
    mut commands: mpsc::UnboundedReceiver<SocketCommand>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    open: Arc<AtomicBool>,
) {
    let emit = |event: TransportEvent| {
        let _ = events.send(ConnectionEvent { id, event });
    };
    
    debug!("🔌 Connexion {} vers {}", id, redact(&url));
    
    let socket = match connect_async(url.as_str()).await {
        Ok((socket, _response)) => socket,
        Err(e) => {
            warn!("❌ Connexion {} impossible : {}", id, e);
            emit(TransportEvent::Error(e.to_string()));
            return;
        }
    };
    
    open.store(true, Ordering::SeqCst);
    info!("✅ Connexion {} ouverte", id);
    emit(TransportEvent::Open);
    
    let (mut sink, mut stream) = socket.split();
    
    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(SocketCommand::Send(payload)) => {
                    let message = match payload {
                        Payload::Text(text) => Message::Text(text),
                        Payload::Binary(bytes) => Message::Binary(bytes),
                    };
                    if let Err(e) = sink.send(message).await {
                        emit(TransportEvent::Error(e.to_string()));
                        break;
                    }
                }
                Some(SocketCommand::Close) | None => {
                    let _ = sink.send(Message::Close(None)).await;
                    debug!("🔌 Connexion {} fermée localement", id);
                    break;
                }
            },
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => emit(TransportEvent::Message(Payload::Text(text))),
                Some(Ok(Message::Binary(bytes))) => emit(TransportEvent::Message(Payload::Binary(bytes))),
                Some(Ok(Message::Close(frame))) => {
                    let (code, reason) = frame
                        .map(|f| (u16::from(f.code), f.reason.into_owned()))
                        .unwrap_or((ABNORMAL_CLOSURE, String::new()));
                    emit(TransportEvent::Close { code, reason });
                    break;
                }
                // Ping/Pong gérés par tungstenite
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    emit(TransportEvent::Error(e.to_string()));
                    break;
                }
                None => {
                    emit(TransportEvent::Close { code: ABNORMAL_CLOSURE, reason: String::new() });
                    break;
                }
            }
        }
    }
    
    open.store(false, Ordering::SeqCst);
}

/// Masque la clé d'API dans les logs
fn redact(url: &str) -> String {
    match url.find("key=") {
        Some(index) => format!("{}key=***", &url[..index]),
        None => url.to_string(),
    }
}

struct LinkState {
    id: ConnectionId,
    url: String,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    sent: Mutex<Vec<Payload>>,
    open: AtomicBool,
    closed_locally: AtomicBool,
}

/// Handle de test d'une connexion simulée
/// 
/// Permet d'injecter les événements réseau et d'inspecter ce qui a été envoyé.
#[derive(Clone)]
pub struct SimulatedLink {
    state: Arc<LinkState>,
}

impl SimulatedLink {
    pub fn id(&self) -> ConnectionId {
        self.state.id
    }
    
    pub fn url(&self) -> &str {
        &self.state.url
    }
    
    fn emit(&self, event: TransportEvent) {
        let _ = self.state.events.send(ConnectionEvent {
            id: self.state.id,
            event,
        });
    }
    
    /// Signale l'ouverture de la connexion
    pub fn accept(&self) {
        self.state.open.store(true, Ordering::SeqCst);
        self.emit(TransportEvent::Open);
    }
    
    /// Livre un message texte
    pub fn deliver_text(&self, text: &str) {
        self.emit(TransportEvent::Message(Payload::Text(text.to_string())));
    }
    
    /// Livre un message binaire
    pub fn deliver_binary(&self, bytes: Vec<u8>) {
        self.emit(TransportEvent::Message(Payload::Binary(bytes)));
    }
    
    /// Simule une erreur de transport
    pub fn fail(&self, reason: &str) {
        self.state.open.store(false, Ordering::SeqCst);
        self.emit(TransportEvent::Error(reason.to_string()));
    }
    
    /// Simule une fermeture par le serveur
    pub fn close_remote(&self, code: u16, reason: &str) {
        self.state.open.store(false, Ordering::SeqCst);
        self.emit(TransportEvent::Close {
            code,
            reason: reason.to_string(),
        });
    }
    
    /// Messages envoyés par le client, dans l'ordre
    pub fn sent(&self) -> Vec<Payload> {
        lock(&self.state.sent).clone()
    }
    
    /// Messages texte envoyés, parsés en JSON
    pub fn sent_json(&self) -> Vec<serde_json::Value> {
        self.sent()
            .iter()
            .filter_map(|payload| match payload {
                Payload::Text(text) => serde_json::from_str(text).ok(),
                Payload::Binary(_) => None,
            })
            .collect()
    }
    
    pub fn is_open(&self) -> bool {
        self.state.open.load(Ordering::SeqCst)
    }
    
    pub fn closed_locally(&self) -> bool {
        self.state.closed_locally.load(Ordering::SeqCst)
    }
}

struct SimulatedConnection {
    state: Arc<LinkState>,
}

impl Connection for SimulatedConnection {
    fn send(&self, payload: Payload) -> NetworkResult<()> {
        if !self.state.open.load(Ordering::SeqCst) {
            return Err(NetworkError::ConnectionClosed);
        }
        lock(&self.state.sent).push(payload);
        Ok(())
    }
    
    fn close(&self) {
        self.state.open.store(false, Ordering::SeqCst);
        self.state.closed_locally.store(true, Ordering::SeqCst);
    }
    
    fn is_open(&self) -> bool {
        self.state.open.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct ConnectorState {
    links: Mutex<Vec<SimulatedLink>>,
    auto_accept: AtomicBool,
    refuse: AtomicBool,
}

/// Connecteur simulé pour les tests sans réseau
/// 
/// Par défaut, les connexions restent en cours d'ouverture jusqu'à ce que le
/// test appelle `SimulatedLink::accept`.
#[derive(Clone, Default)]
pub struct SimulatedConnector {
    state: Arc<ConnectorState>,
}

impl SimulatedConnector {
    pub fn new() -> Self {
        Self::default()
    }
    
    /// Ouvre automatiquement chaque nouvelle connexion
    pub fn with_auto_accept(self) -> Self {
        self.state.auto_accept.store(true, Ordering::SeqCst);
        self
    }
    
    /// Fait échouer (ou réussir) les prochains `open`
    pub fn refuse_connections(&self, refuse: bool) {
        self.state.refuse.store(refuse, Ordering::SeqCst);
    }
    
    /// Toutes les connexions ouvertes, dans l'ordre
    pub fn links(&self) -> Vec<SimulatedLink> {
        lock(&self.state.links).clone()
    }
    
    pub fn last_link(&self) -> Option<SimulatedLink> {
        lock(&self.state.links).last().cloned()
    }
    
    pub fn connection_count(&self) -> usize {
        lock(&self.state.links).len()
    }
}

impl Connector for SimulatedConnector {
    fn open(
        &self,
        id: ConnectionId,
        url: &str,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> NetworkResult<Box<dyn Connection>> {
        if self.state.refuse.load(Ordering::SeqCst) {
            return Err(NetworkError::Transport("connexion refusée (simulée)".to_string()));
        }
        
        let state = Arc::new(LinkState {
            id,
            url: url.to_string(),
            events,
            sent: Mutex::new(Vec::new()),
            open: AtomicBool::new(false),
            closed_locally: AtomicBool::new(false),
        });
        let link = SimulatedLink {
            state: Arc::clone(&state),
        };
        
        lock(&self.state.links).push(link.clone());
        
        if self.state.auto_accept.load(Ordering::SeqCst) {
            link.accept();
        }
        
        Ok(Box::new(SimulatedConnection { state }))
    }
    
    fn describe(&self) -> String {
        "Simulé".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    
    #[test]
    fn test_redact_hides_key() {
        assert_eq!(redact("wss://host/path?key=abc"), "wss://host/path?key=***");
        assert_eq!(redact("ws://host"), "ws://host");
    }
    
    #[tokio::test]
    async fn test_simulated_link_events() {
        let connector = SimulatedConnector::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let connection = connector.open(ConnectionId(7), "ws://test", tx).unwrap();
        let link = connector.last_link().unwrap();
        
        // Envoi refusé tant que la connexion n'est pas ouverte
        assert!(connection.send(Payload::Text("x".to_string())).is_err());
        
        link.accept();
        assert_eq!(
            rx.recv().await,
            Some(ConnectionEvent { id: ConnectionId(7), event: TransportEvent::Open })
        );
        
        connection.send(Payload::Binary(vec![1, 2])).unwrap();
        assert_eq!(link.sent(), vec![Payload::Binary(vec![1, 2])]);
        
        link.deliver_binary(vec![0]);
        assert!(matches!(
            rx.recv().await,
            Some(ConnectionEvent { event: TransportEvent::Message(Payload::Binary(_)), .. })
        ));
        
        connection.close();
        assert!(link.closed_locally());
        assert!(!connection.is_open());
    }
    
    #[test]
    fn test_refused_connection() {
        let connector = SimulatedConnector::new();
        connector.refuse_connections(true);
        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(connector.open(ConnectionId(1), "ws://test", tx).is_err());
        assert_eq!(connector.connection_count(), 0);
    }
    
    #[tokio::test]
    async fn test_websocket_unreachable_reports_error() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        // Port 9 (discard) : connexion refusée en local
        let connection = WebSocketConnector::new()
            .open(ConnectionId(1), "ws://127.0.0.1:9/", tx)
            .unwrap();
        
        let event = rx.recv().await.unwrap();
        assert_eq!(event.id, ConnectionId(1));
        assert!(matches!(event.event, TransportEvent::Error(_)));
        assert!(!connection.is_open());
    }
}
