//! Interactive commands read from stdin.

use std::io::BufRead;

use crossbeam_channel::{unbounded, Receiver};
use tracing::warn;

/// Speed change applied by `+` and `-`.
pub const SPEED_STEP: f32 = 0.25;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Command {
    TogglePause,
    Seek(u64),
    Faster,
    Slower,
    Info,
    Quit,
}

impl Command {
    pub fn parse(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace();
        let command = match parts.next()? {
            "p" => Self::TogglePause,
            "s" => Self::Seek(parts.next()?.parse().ok()?),
            "+" => Self::Faster,
            "-" => Self::Slower,
            "i" => Self::Info,
            "q" => Self::Quit,
            _ => return None,
        };
        Some(command)
    }
}

pub const HELP: &str = "commands: p pause/resume, s <ms> seek, + faster, - slower, i info, q quit";

/// Read commands from stdin on a background thread. The channel closes at
/// end of input.
pub fn spawn_reader() -> std::io::Result<Receiver<Command>> {
    let (tx, rx) = unbounded();
    std::thread::Builder::new()
        .name("speedplay-stdin".to_string())
        .spawn(move || {
            for line in std::io::stdin().lock().lines() {
                let Ok(line) = line else { break };
                if line.trim().is_empty() {
                    continue;
                }
                match Command::parse(&line) {
                    Some(command) => {
                        if tx.send(command).is_err() {
                            break;
                        }
                    }
                    None => warn!("Unknown command {:?}. {}", line.trim(), HELP),
                }
            }
        })?;
    Ok(rx)
}
