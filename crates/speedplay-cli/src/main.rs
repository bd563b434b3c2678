//! # Speedplay
//!
//! Play an audio file or URL at any speed without changing its pitch.

mod control;

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::Parser;
use crossbeam_channel::select;
use directories::ProjectDirs;
use speedplay_audio::sink::list_output_devices;
use speedplay_audio::{PlayerConfig, PlayerEvent, SpeedPlayer};
use speedplay_core::{DataSource, PlaybackState};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use control::{Command, HELP, SPEED_STEP};

#[derive(Parser, Debug)]
#[command(name = "speedplay", version, about)]
struct Args {
    /// File path or URL to play
    #[arg(required_unless_present = "list_devices")]
    source: Option<String>,

    /// Playback speed ratio
    #[arg(long)]
    speed: Option<f32>,

    /// Volume from 0.0 to 1.0
    #[arg(long)]
    volume: Option<f32>,

    /// Start position in milliseconds
    #[arg(long)]
    seek: Option<u64>,

    /// Configuration file. Defaults to config.json in the user config directory.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Output device name
    #[arg(long)]
    device: Option<String>,

    /// Print the available output devices and exit
    #[arg(long)]
    list_devices: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "speedplay=info,speedplay_audio=info".into()),
        )
        .init();

    let args = Args::parse();

    if args.list_devices {
        for name in list_output_devices()? {
            println!("{name}");
        }
        return Ok(());
    }

    let mut config = load_config(args.config.as_deref())?;
    if let Some(speed) = args.speed {
        config.initial_speed = speed;
    }
    if let Some(volume) = args.volume {
        config.initial_volume = volume;
    }
    if args.device.is_some() {
        config.output_device = args.device;
    }

    let Some(source) = args.source else {
        bail!("No source given");
    };
    let source = DataSource::parse(&source)?;

    info!("Starting Speedplay v{}", env!("CARGO_PKG_VERSION"));
    play(config, source, args.seek)
}

/// Explicit `--config` must exist; the default location is optional.
fn load_config(path: Option<&Path>) -> Result<PlayerConfig> {
    if let Some(path) = path {
        return PlayerConfig::from_json_file(path)
            .with_context(|| format!("Failed to load {}", path.display()));
    }

    let Some(dirs) = ProjectDirs::from("com", "speedplay", "Speedplay") else {
        return Ok(PlayerConfig::default());
    };
    let path = dirs.config_dir().join("config.json");
    if !path.exists() {
        return Ok(PlayerConfig::default());
    }
    info!("Loading configuration from {}", path.display());
    PlayerConfig::from_json_file(&path)
        .with_context(|| format!("Failed to load {}", path.display()))
}

fn play(config: PlayerConfig, source: DataSource, seek: Option<u64>) -> Result<()> {
    let player = SpeedPlayer::new(config)?;
    let events = player.subscribe();

    player.prepare(source)?;
    if let Some(position) = seek {
        player.seek_to(position)?;
    }
    player.start()?;
    print_info(&player);
    println!("{HELP}");

    let commands = control::spawn_reader()?;
    let outcome = loop {
        select! {
            recv(events) -> event => match event {
                Ok(PlayerEvent::Completion) => break Ok(()),
                Ok(PlayerEvent::Error) => break Err(anyhow::anyhow!("Playback failed")),
                Ok(PlayerEvent::Prepared) => {}
                Err(_) => break Ok(()),
            },
            recv(commands) -> command => match command {
                Ok(Command::Quit) | Err(_) => break Ok(()),
                Ok(command) => {
                    if let Err(e) = apply(&player, command) {
                        warn!("{e}");
                        break Err(e.into());
                    }
                }
            },
        }
    };

    player.release();
    outcome
}

fn apply(player: &SpeedPlayer, command: Command) -> speedplay_core::Result<()> {
    match command {
        Command::TogglePause => {
            if player.state() == PlaybackState::Started {
                player.pause()?;
                println!("paused");
            } else {
                player.start()?;
                println!("playing");
            }
        }
        Command::Seek(position) => player.seek_to(position)?,
        Command::Faster => {
            player.set_playback_speed(player.playback_speed() + SPEED_STEP);
            println!("speed {:.2}", player.playback_speed());
        }
        Command::Slower => {
            player.set_playback_speed(player.playback_speed() - SPEED_STEP);
            println!("speed {:.2}", player.playback_speed());
        }
        Command::Info => print_info(player),
        Command::Quit => {}
    }
    Ok(())
}

fn print_info(player: &SpeedPlayer) {
    let position = player.current_position().unwrap_or_default();
    println!(
        "{:?}  {} / {} ms  speed {:.2}  session {}",
        player.state(),
        position,
        player.duration(),
        player.playback_speed(),
        player
            .audio_session_id()
            .map_or_else(|| "-".to_string(), |id| id.to_string()),
    );
}
