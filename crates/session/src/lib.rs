//! Crate session - Contrôleur de conversation vocale
//! 
//! Orchestre la capture, la connexion et la lecture selon les intentions
//! de l'utilisateur (connecter, enregistrer, arrêter) :
//! 
//! - `config` : `SessionConfig` (audio + service distant)
//! - `types` : instantané `Session`, `SessionEvent`, `IntentOutcome`
//! - `controller` : acteur de session et `SessionHandle`
//! 
//! # Example
//! 
//! ```rust,no_run
//! use std::sync::Arc;
//! use audio::{CpalInputDevice, CpalOutputDevice, FsScratchStorage};
//! use network::WebSocketConnector;
//! use session::{SessionConfig, SessionDevices, spawn_session};
//! 
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let devices = SessionDevices {
//!     input: Box::new(CpalInputDevice::new()),
//!     output: Arc::new(CpalOutputDevice::default()),
//!     storage: Arc::new(FsScratchStorage::in_temp_dir()?),
//!     connector: Arc::new(WebSocketConnector::new()),
//! };
//! let session = spawn_session(SessionConfig::default(), devices)?;
//! 
//! session.connect().await?;
//! // ... attendre SessionEvent::Ready puis :
//! session.start_recording().await?;
//! session.stop_recording().await?;
//! session.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod controller;
pub mod error;
pub mod types;

pub use config::SessionConfig;
pub use controller::{SessionDevices, SessionHandle, spawn_session};
pub use error::{SessionError, SessionResult};
pub use types::{IntentOutcome, Session, SessionEvent, SessionStats};
