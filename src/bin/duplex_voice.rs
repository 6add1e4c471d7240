//! CLI binary for duplex-voice.

use clap::{Parser, Subcommand};
use duplex_voice::audio::capture::CpalCapture;
use duplex_voice::audio::playback::CpalPlayback;
use duplex_voice::pipeline::messages::Role;
use duplex_voice::{DuplexConfig, DuplexVoice, SessionEvent, SessionState};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Real-time duplex voice client.
#[derive(Parser)]
#[command(name = "duplex-voice", version, about)]
struct Cli {
    /// Path to TOML configuration file (defaults to the user config path if it exists).
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the remote service WebSocket URL.
    #[arg(long, env = "DUPLEX_VOICE_URL")]
    url: Option<String>,

    /// Subcommand to run.
    #[command(subcommand)]
    command: Option<Command>,
}

/// Available commands.
#[derive(Subcommand)]
enum Command {
    /// Start a voice session and print the conversation.
    Run {
        /// Print session events as JSON lines instead of plain text.
        #[arg(long)]
        json: bool,
    },

    /// List available audio devices.
    Devices,

    /// Print the effective configuration as TOML.
    Config {
        /// Also write it to the config path.
        #[arg(long)]
        save: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr so stdout stays clean for transcripts.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("duplex_voice=info,tungstenite=warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(DuplexConfig::default_config_path);

    let mut config = if cli.config.is_some() || config_path.exists() {
        DuplexConfig::from_file(&config_path)?
    } else {
        DuplexConfig::default()
    };
    if let Some(url) = cli.url {
        config.agent.url = url;
    }

    match cli.command.unwrap_or(Command::Run { json: false }) {
        Command::Run { json } => run_session(config, json).await,
        Command::Devices => list_devices(),
        Command::Config { save } => show_config(config, &config_path, save),
    }
}

async fn run_session(config: DuplexConfig, json: bool) -> anyhow::Result<()> {
    println!("duplex-voice v{}", env!("CARGO_PKG_VERSION"));

    let mut voice = DuplexVoice::new(config)?;
    let events = voice.subscribe();
    let printer = tokio::spawn(print_events(events, json));

    if let Err(e) = voice.start_session().await {
        voice.end_session().await;
        printer.abort();
        return Err(e.into());
    }
    println!("\nConnected. Speak into your microphone. Press Ctrl+C to stop.\n");

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                warn!("failed to listen for Ctrl+C: {e}");
            }
            info!("received Ctrl+C, shutting down...");
        }
        _ = wait_for_stop(&voice) => {
            warn!("session stopped");
        }
    }

    voice.end_session().await;
    printer.abort();
    Ok(())
}

/// Resolves once the session task has exited on its own (retries exhausted
/// or a fatal device error).
async fn wait_for_stop(voice: &DuplexVoice) {
    let mut poll = tokio::time::interval(Duration::from_millis(250));
    while voice.is_running() {
        poll.tick().await;
    }
}

async fn print_events(mut events: broadcast::Receiver<SessionEvent>, json: bool) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!("event printer lagged, skipped {n} events");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };

        if json {
            match serde_json::to_string(&event) {
                Ok(line) => println!("{line}"),
                Err(e) => warn!("failed to encode event: {e}"),
            }
            continue;
        }

        match event {
            SessionEvent::Transcript { role, text } => {
                let who = match role {
                    Role::User => "you",
                    Role::Assistant => "assistant",
                };
                println!("{who}: {text}");
            }
            SessionEvent::ConnectionStateChanged {
                state: state @ (SessionState::Connecting | SessionState::Error | SessionState::Idle),
            } => info!("session {state:?}"),
            SessionEvent::Error { kind, reason } => eprintln!("error ({kind:?}): {reason}"),
            _ => {}
        }
    }
}

fn list_devices() -> anyhow::Result<()> {
    println!("Input devices:");
    for name in CpalCapture::list_input_devices()? {
        println!("  - {name}");
    }

    println!("\nOutput devices:");
    for name in CpalPlayback::list_output_devices()? {
        println!("  - {name}");
    }

    Ok(())
}

fn show_config(mut config: DuplexConfig, path: &std::path::Path, save: bool) -> anyhow::Result<()> {
    config.validate()?;
    print!("{}", toml::to_string_pretty(&config)?);
    if save {
        config.save_to_file(path)?;
        eprintln!("saved to {}", path.display());
    }
    Ok(())
}
