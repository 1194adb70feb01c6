// Client vocal Parlo
//
// Conversation vocale avec un service distant :
// - talk : connexion puis Entrée pour parler / terminer son tour
// - devices : liste des périphériques audio
// - probe : vérifie le handshake (acquitté ou forcé par timeout)

mod config;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use audio::{CpalInputDevice, CpalOutputDevice, FsScratchStorage};
use clap::{Args, Parser, Subcommand};
use network::WebSocketConnector;
use session::{IntentOutcome, SessionConfig, SessionDevices, SessionEvent, SessionHandle, spawn_session};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::Overrides;

const DEFAULT_LOG_FILTER: &str = "parlo_client=info,session=info,network=info,audio=info";

#[derive(Parser)]
#[command(author, version, about = "Client de conversation vocale Parlo")]
struct Cli {
    /// Fichier de configuration TOML
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Conversation interactive (Entrée = parler / terminer)
    Talk(ConnectArgs),
    /// Liste les périphériques audio
    Devices,
    /// Vérifie la connexion et le handshake
    Probe(ConnectArgs),
}

#[derive(Args, Clone, Debug)]
struct ConnectArgs {
    /// Clé d'API du service
    #[arg(long, env = "PARLO_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// URL WebSocket du service
    #[arg(long, env = "PARLO_ENDPOINT")]
    endpoint: Option<String>,

    #[arg(long)]
    model: Option<String>,

    #[arg(long)]
    voice: Option<String>,

    /// Microphone (nom cpal)
    #[arg(long)]
    input_device: Option<String>,

    /// Sortie audio (nom cpal)
    #[arg(long)]
    output_device: Option<String>,

    /// Enregistrer pendant la lecture des réponses
    #[arg(long)]
    duplex: bool,
}

impl From<ConnectArgs> for Overrides {
    fn from(args: ConnectArgs) -> Self {
        Self {
            api_key: args.api_key,
            endpoint: args.endpoint,
            model: args.model,
            voice: args.voice,
            input_device: args.input_device,
            output_device: args.output_device,
            duplex: args.duplex,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // .env avant clap pour que les variables `env` soient visibles
    dotenv::dotenv().ok();
    init_logging();

    let cli = Cli::parse();

    match cli.command {
        Commands::Talk(args) => {
            let config = load_config(cli.config.as_deref(), args)?;
            run_talk(config).await
        }
        Commands::Devices => list_devices(),
        Commands::Probe(args) => {
            let config = load_config(cli.config.as_deref(), args)?;
            run_probe(config).await
        }
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn load_config(path: Option<&std::path::Path>, args: ConnectArgs) -> Result<SessionConfig> {
    let file = config::load_file(path)?;
    config::resolve(file, args.into())
}

fn cpal_devices(config: &SessionConfig) -> Result<SessionDevices> {
    let storage = FsScratchStorage::in_temp_dir().context("dossier temporaire de lecture")?;
    debug!("📁 Fichiers temporaires dans {}", storage.root().display());

    Ok(SessionDevices {
        input: Box::new(CpalInputDevice::new()),
        output: Arc::new(CpalOutputDevice::new(config.audio.output_device.clone())),
        storage: Arc::new(storage),
        connector: Arc::new(WebSocketConnector::new()),
    })
}

/// Conversation interactive
async fn run_talk(config: SessionConfig) -> Result<()> {
    let devices = cpal_devices(&config)?;
    let session = spawn_session(config, devices)?;
    let mut events = session.events();

    println!("🚀 Client Parlo");
    session.connect().await?;

    println!("📋 Utilisation :");
    println!("   • Entrée : parler / terminer son tour");
    println!("   • Ctrl+C : quitter");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                println!("\n🛑 Arrêt demandé");
                break;
            }

            line = lines.next_line() => match line {
                Ok(Some(_)) => toggle_recording(&session).await,
                // stdin fermé
                Ok(None) => break,
                Err(e) => {
                    warn!("⚠️  Lecture clavier : {}", e);
                    break;
                }
            },

            event = events.recv() => match event {
                Ok(event) => {
                    if !render_event(&event) {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    debug!("{} événements non affichés", missed);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    print_summary(&session).await;
    println!("🔌 Fermeture...");
    session.shutdown().await;
    println!("👋 Au revoir !");
    Ok(())
}

/// Affiche l'état final et les compteurs de la session
async fn print_summary(session: &SessionHandle) {
    if let Ok(snapshot) = session.snapshot().await {
        println!("📍 État : {}", snapshot.status_line());
    }
    match session.stats().await {
        Ok(stats) => {
            println!("📊 Réseau : {}", stats.protocol.summary());
            println!("📊 Capture : {}", stats.capture_summary());
        }
        Err(e) => debug!("statistiques indisponibles : {}", e),
    }
}

async fn toggle_recording(session: &SessionHandle) {
    match session.toggle_recording().await {
        Ok(IntentOutcome::Done) => {}
        Ok(IntentOutcome::Deferred) => println!("⏳ Enregistrement après la réponse en cours"),
        Ok(IntentOutcome::NoOp(reason)) => println!("ℹ️  {}", reason),
        Err(e) if e.is_rejection() => println!("❌ {}", e),
        Err(e) => warn!("❌ {}", e),
    }
}

/// Affiche un événement ; `false` quand la conversation ne peut plus continuer
fn render_event(event: &SessionEvent) -> bool {
    match event {
        SessionEvent::Ready { forced: false } => println!("✅ Prêt, appuyez sur Entrée pour parler"),
        SessionEvent::Ready { forced: true } => {
            println!("✅ Prêt (sans acquittement), appuyez sur Entrée pour parler")
        }
        SessionEvent::RecordingStarted => println!("🎤 Parlez... (Entrée pour terminer)"),
        SessionEvent::RecordingStopped => println!("⏳ Réponse en attente"),
        SessionEvent::AnswerText(text) => println!("🤖 {}", text),
        SessionEvent::InputTranscription(text) => println!("🗣️  {}", text),
        SessionEvent::OutputTranscription(text) => println!("🔈 {}", text),
        SessionEvent::Interrupted => println!("✋ Réponse interrompue"),
        SessionEvent::PlaybackFailed(reason) => println!("⚠️  Lecture impossible : {}", reason),
        SessionEvent::AudioError(reason) => println!("⚠️  Audio : {}", reason),
        SessionEvent::ErrorNotice(message) => {
            println!("❌ Erreur du service : {}", message);
            return false;
        }
        SessionEvent::TransportFailed(reason) => {
            println!("❌ Connexion perdue : {}", reason);
            return false;
        }
        SessionEvent::Closed { code, reason } => {
            println!("🔌 Connexion fermée ({}) {}", code, reason);
            return false;
        }
        other => debug!("{:?}", other),
    }
    true
}

/// Liste les périphériques cpal
fn list_devices() -> Result<()> {
    println!("🎤 Entrées :");
    for name in audio::capture::list_input_devices()? {
        println!("   • {}", name);
    }

    println!("🔊 Sorties :");
    for name in audio::playback::list_output_devices()? {
        println!("   • {}", name);
    }

    Ok(())
}

/// Connexion seule : attend l'état Ready puis se déconnecte
async fn run_probe(config: SessionConfig) -> Result<()> {
    let limit = config.live.handshake_timeout() + Duration::from_secs(5);
    let devices = cpal_devices(&config)?;
    let session = spawn_session(config, devices)?;
    let mut events = session.events();

    let started = Instant::now();
    session.connect().await?;
    info!("📡 Connexion en cours...");

    let outcome = tokio::time::timeout(limit, wait_ready(&mut events)).await;
    print_summary(&session).await;
    session.shutdown().await;

    match outcome {
        Ok(Ok(false)) => println!("✅ Handshake acquitté en {:?}", started.elapsed()),
        Ok(Ok(true)) => println!("⚠️  Aucun acquittement, état Ready forcé après {:?}", started.elapsed()),
        Ok(Err(reason)) => anyhow::bail!("connexion échouée : {}", reason),
        Err(_) => anyhow::bail!("aucune réponse après {:?}", limit),
    }

    Ok(())
}

/// Attend `Ready` et retourne `forced`
async fn wait_ready(events: &mut broadcast::Receiver<SessionEvent>) -> Result<bool, String> {
    loop {
        match events.recv().await {
            Ok(SessionEvent::Ready { forced }) => return Ok(forced),
            Ok(SessionEvent::TransportFailed(reason)) | Ok(SessionEvent::ErrorNotice(reason)) => {
                return Err(reason)
            }
            Ok(SessionEvent::Closed { code, reason }) => return Err(format!("{} {}", code, reason)),
            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
            Err(broadcast::error::RecvError::Closed) => return Err("session terminée".to_string()),
        }
    }
}
