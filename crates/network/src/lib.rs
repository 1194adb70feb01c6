//! Crate network - Connexion au service conversationnel temps réel
//! 
//! Ce crate gère la connexion persistante vers le service distant : handshake
//! Setup, envoi des chunks audio canoniques, démultiplexage des réponses
//! (audio binaire ou JSON de contrôle) et signal de fin de tour.
//! 
//! # Architecture
//! 
//! - `error` : Gestion d'erreurs (transport fatal vs message local)
//! - `types` : États, identité de connexion, configuration, statistiques
//! - `protocol` : Enveloppes sortantes/entrantes et classification
//! - `traits` : Traits `Connector` / `Connection`
//! - `transport` : WebSocket réel et connexion simulée
//! - `manager` : Machine à états `LiveProtocol`
//! 
//! # Example
//! 
//! ```rust
//! use std::sync::Arc;
//! use network::{LiveConfig, LiveProtocol, ProtocolEvent, ProtocolState, SimulatedConnector};
//! 
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let connector = SimulatedConnector::new();
//! let (mut protocol, mut inbox) = LiveProtocol::new(LiveConfig::test_config(), Arc::new(connector.clone()));
//! 
//! protocol.connect().unwrap();
//! let link = connector.last_link().unwrap();
//! link.accept();
//! protocol.handle_input(inbox.recv().await.unwrap());
//! 
//! link.deliver_text(r#"{"setupComplete":{}}"#);
//! let events = protocol.handle_input(inbox.recv().await.unwrap());
//! assert!(events.contains(&ProtocolEvent::Ready { forced: false }));
//! assert_eq!(protocol.state(), ProtocolState::Ready);
//! # }
//! ```

// Modules internes
mod error;
mod types;
mod protocol;
mod traits;
mod transport;
mod manager;

// Re-exports publics
pub use error::{NetworkError, NetworkResult};

pub use types::{
    AudioEncoding, ConnectionId, LiveConfig, ProtocolState, ProtocolStats, ResponseModality,
};

pub use protocol::{
    ContentPart, InboundEnvelope, InlineAudio, OutboundEnvelope, Payload, PayloadKind,
    ServerContent, SetupRequest, classify, decode_inbound,
};

pub use traits::{Connection, ConnectionEvent, Connector, TransportEvent};

pub use transport::{SimulatedConnector, SimulatedLink, WebSocketConnector};

pub use manager::{LiveProtocol, ProtocolEvent, ProtocolInbox, ProtocolInput};

/// Version du crate network
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
