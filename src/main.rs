use std::path::PathBuf;

use anyhow::Context as _;
use clap::Parser;
use log::{debug, info, warn};
use tokio::sync::mpsc;

mod clock;
mod codec;
mod config;
mod connection;
mod demo;
mod history;
mod manager;
mod messages;
mod mqtt;
mod replication;
mod router;
mod staleness;
mod store;

use messages::Command;
use mqtt::MqttTransport;

/// Keeps a live view of loading-bay sensors published over MQTT.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Path to the TOML configuration file
    #[arg(long, default_value = "config.toml")]
    config: PathBuf,

    /// Bay to follow, overriding `tracking.default_id`
    #[arg(long)]
    slot: Option<String>,

    /// Ignore any `[mqtt]` section and run on synthetic data
    #[arg(long)]
    demo: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    pretty_env_logger::init();
    let args = Args::parse();

    let mut config = if args.config.exists() {
        config::AppConfig::load(&args.config)
            .with_context(|| format!("loading {}", args.config.display()))?
    } else {
        warn!("{} not found, using defaults", args.config.display());
        config::AppConfig::default()
    };
    if let Some(slot) = args.slot {
        config.tracking.default_id = Some(slot);
    }
    if args.demo {
        config.mqtt = None;
    }

    let (command_tx, command_rx) = mpsc::channel(8);
    spawn_command_sources(command_tx);

    let clock = Box::new(clock::RuntimeClock::new());
    let manager = match &config.mqtt {
        Some(mqtt) => {
            let (transport, events) = MqttTransport::connect(mqtt);
            let mut manager = manager::Manager::live(&config, transport, clock);
            info!("Following {}", describe(&config, manager.current_id()));
            manager.run(Some(events), command_rx).await;
            manager
        }
        None => {
            info!("No MQTT endpoint configured, running in demo mode");
            let mut manager = manager::Manager::<MqttTransport>::demo(&config, clock);
            info!("Following {}", describe(&config, manager.current_id()));
            manager.run(None, command_rx).await;
            manager
        }
    };

    info!(
        "Final connection state: {}{}",
        manager.connection_state(),
        manager
            .error_cause()
            .map(|cause| format!(" ({cause})"))
            .unwrap_or_default()
    );
    if let Some(err) = manager.subscription_error() {
        warn!("Last subscription error: {}", err);
    }
    if manager.retain_warning() {
        warn!("No retained data was received for the followed topics");
    }
    let ids = match config.tracking.variant() {
        config::Variant::Single => vec![manager.current_id().to_string()],
        config::Variant::Multi => manager.ids(),
    };
    for id in ids {
        let state = manager.snapshot(&id);
        let history = manager.history(&id);
        info!(
            "{}: {} ({} recent readings)",
            id,
            serde_json::to_string(&state)?,
            history.len()
        );
    }

    Ok(())
}

fn describe(config: &config::AppConfig, current_id: &str) -> String {
    match config.tracking.variant() {
        config::Variant::Single => format!("bay {current_id}"),
        config::Variant::Multi => format!("bays {}", config.tracking.tracked_ids().join(", ")),
    }
}

/// Ctrl-C shuts down; each line on stdin switches the followed bay.
fn spawn_command_sources(command_tx: mpsc::Sender<Command>) {
    let shutdown_tx = command_tx.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                request_shutdown(&shutdown_tx).await;
            }
            Err(err) => warn!("Failed to listen for Ctrl-C: {}", err),
        }
    });

    // The only thread besides the runtime; a pending read must not hold up
    // runtime shutdown.
    std::thread::spawn(move || {
        for line in std::io::stdin().lines() {
            let Ok(line) = line else {
                break;
            };
            if command_tx.blocking_send(Command::SwitchEntity(line)).is_err() {
                break;
            }
        }
    });
}

/// False once the manager has stopped listening.
async fn request_shutdown(command_tx: &mpsc::Sender<Command>) -> bool {
    if command_tx.send(Command::Shutdown).await.is_err() {
        debug!("Manager already stopped, dropping Ctrl-C");
        return false;
    }
    true
}
