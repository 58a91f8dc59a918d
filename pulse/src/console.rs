//! Operator commands read from standard input.

use std::str::FromStr;
use std::sync::Arc;

use anyhow::Context;
use pulse_core::DriverHandle;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;

use crate::realm::{BlockPos, BlockUpdate, Player, RealmView};

const HELP_TEXT: &str = "\
Commands:
  stop                                   Save everything and shut down
  status                                 Show tick rate, MSPT and world stats
  warp <ticks>                           Run ticks back to back without sleeping
  warp stop                              End a running warp
  rate <tps>                             Change the target tick rate
  join <player> | leave <player>         Connect or disconnect a player
  sleep <player>                         Put a player to bed
  schedule <world> <x> <y> <z> <redstone|growth> [delay]
                                         Schedule a block update";

/// A parsed console command.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Shut the server down.
    Stop,
    /// Print the latest status.
    Status,
    /// Warp the given number of ticks.
    Warp(u64),
    /// End the running warp.
    CancelWarp,
    /// Change the tick rate.
    Rate(f32),
    /// Connect a player.
    Join(String),
    /// Disconnect a player.
    Leave(String),
    /// Put a player to bed.
    Sleep(String),
    /// Schedule a block update.
    Schedule {
        /// Target world.
        world: String,
        /// Target block.
        pos: BlockPos,
        /// Ticks from now.
        delay: u32,
        /// The update.
        update: BlockUpdate,
    },
    /// List the commands.
    Help,
}

/// Why a console line was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    /// No such command.
    #[error("Unknown command '{0}', try 'help'")]
    Unknown(String),
    /// Wrong arguments; holds the expected usage.
    #[error("Usage: {0}")]
    Usage(&'static str),
}

impl FromStr for Command {
    type Err = CommandError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut args = line.split_whitespace();
        let Some(name) = args.next() else {
            return Err(CommandError::Usage("help"));
        };
        let name = name.to_ascii_lowercase();
        let rest: Vec<&str> = args.collect();

        let command = match (name.as_str(), rest.as_slice()) {
            ("stop", []) => Self::Stop,
            ("status" | "tps", []) => Self::Status,
            ("help" | "?", []) => Self::Help,
            ("warp", ["stop"]) => Self::CancelWarp,
            ("warp", [ticks]) => Self::Warp(
                ticks
                    .parse()
                    .map_err(|_| CommandError::Usage("warp <ticks> | warp stop"))?,
            ),
            ("rate", [rate]) => Self::Rate(
                rate.parse()
                    .map_err(|_| CommandError::Usage("rate <tps>"))?,
            ),
            ("join", [player]) => Self::Join((*player).to_owned()),
            ("leave", [player]) => Self::Leave((*player).to_owned()),
            ("sleep", [player]) => Self::Sleep((*player).to_owned()),
            ("schedule", [world, x, y, z, kind, delay @ ..]) if delay.len() <= 1 => {
                parse_schedule(world, [x, y, z], kind, delay.first().copied())
                    .ok_or(CommandError::Usage(
                        "schedule <world> <x> <y> <z> <redstone|growth> [delay]",
                    ))?
            }
            ("stop" | "status" | "tps" | "help" | "?", _) => {
                return Err(CommandError::Usage(name_usage(&name)));
            }
            ("warp", _) => return Err(CommandError::Usage("warp <ticks> | warp stop")),
            ("rate", _) => return Err(CommandError::Usage("rate <tps>")),
            ("join" | "leave" | "sleep", _) => {
                return Err(CommandError::Usage("join|leave|sleep <player>"));
            }
            ("schedule", _) => {
                return Err(CommandError::Usage(
                    "schedule <world> <x> <y> <z> <redstone|growth> [delay]",
                ));
            }
            _ => return Err(CommandError::Unknown(name)),
        };
        Ok(command)
    }
}

fn name_usage(name: &str) -> &'static str {
    match name {
        "stop" => "stop",
        "help" | "?" => "help",
        _ => "status",
    }
}

fn parse_schedule(world: &str, coords: [&&str; 3], kind: &str, delay: Option<&str>) -> Option<Command> {
    let [x, y, z] = coords.map(|coord| coord.parse::<i32>().ok());
    let pos = BlockPos::new(x?, y?, z?);
    let update = match kind {
        "redstone" => BlockUpdate::Redstone { power: 15 },
        "growth" => BlockUpdate::Growth { stage: 0 },
        _ => return None,
    };
    let delay = match delay {
        Some(delay) => delay.parse().ok().filter(|&delay| delay > 0)?,
        None => update.delay(),
    };
    Some(Command::Schedule {
        world: world.to_owned(),
        pos,
        delay,
        update,
    })
}

/// Runs `command`, reporting the result through the log.
///
/// Anything touching the realm is submitted to the simulation thread and awaited.
pub async fn execute(command: Command, handle: &DriverHandle, realm: &RealmView) -> anyhow::Result<()> {
    match command {
        Command::Stop => {
            if !handle.request_stop() {
                log::info!("Server is already {}", handle.state());
            }
        }
        Command::Status => log_status(handle, realm),
        Command::Warp(ticks) => {
            handle.request_warp(ticks)?;
            log::info!("Warping {ticks} tick(s)");
        }
        Command::CancelWarp => {
            if handle.cancel_warp() {
                log::info!("Warp cancelled");
            } else {
                log::info!("No warp in progress");
            }
        }
        Command::Rate(rate) => handle.set_tick_rate(rate)?,
        Command::Join(name) => {
            let players = Arc::clone(&realm.players);
            let joined = handle
                .submit(move || {
                    let mut players = players.write();
                    if players.contains_key(&name) {
                        return None;
                    }
                    players.insert(
                        name.clone(),
                        Player {
                            name: name.clone(),
                            asleep_since: None,
                        },
                    );
                    Some(name)
                })
                .await?;
            match joined {
                Some(name) => log::info!("{name} joined the game"),
                None => log::info!("That player is already online"),
            }
        }
        Command::Leave(name) => {
            let players = Arc::clone(&realm.players);
            let left = handle.submit(move || players.write().remove(&name)).await?;
            match left {
                Some(player) => log::info!("{} left the game", player.name),
                None => log::info!("That player is not online"),
            }
        }
        Command::Sleep(name) => {
            let players = Arc::clone(&realm.players);
            let tasks_handle = handle.clone();
            let slept = handle
                .submit(move || {
                    let mut players = players.write();
                    let player = players.get_mut(&name)?;
                    player.asleep_since = Some(tasks_handle.tick_count());
                    Some(player.name.clone())
                })
                .await?;
            match slept {
                Some(name) => log::info!("{name} is now sleeping"),
                None => log::info!("That player is not online"),
            }
        }
        Command::Schedule {
            world,
            pos,
            delay,
            update,
        } => {
            let target = Arc::clone(
                realm
                    .world(&world)
                    .with_context(|| format!("No world named '{world}'"))?,
            );
            let tasks_handle = handle.clone();
            let (scheduled, at) = handle
                .submit(move || {
                    let now = tasks_handle.tick_count();
                    let scheduled = target.schedule(pos, update, now, delay);
                    (scheduled, now + u64::from(delay))
                })
                .await?;
            if scheduled {
                log::info!("Scheduled {update:?} at {pos:?} in '{world}' for tick {at}");
            } else {
                log::info!("That update is already scheduled");
            }
        }
        Command::Help => log::info!("{HELP_TEXT}"),
    }
    Ok(())
}

fn log_status(handle: &DriverHandle, realm: &RealmView) {
    let status = handle.status();
    log::info!(
        "Tick {} ({}), target {} TPS, measured {:.1} TPS, {:.2} ms/tick, {} player(s)",
        handle.tick_count(),
        handle.state(),
        handle.tick_rate(),
        status.tps,
        status.mspt,
        realm.players.read().len()
    );
    if handle.warp_remaining() > 0 {
        log::info!("{} warp tick(s) left", handle.warp_remaining());
    }
    for world in &realm.worlds {
        log::info!(
            "  {}: {} update(s) applied, {} pending",
            world.name(),
            world.applied(),
            world.pending()
        );
    }
}

/// Reads commands from stdin until `cancel_token` fires or stdin closes.
pub async fn run(handle: DriverHandle, realm: RealmView, cancel_token: CancellationToken) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            () = cancel_token.cancelled() => break,
            line = lines.next_line() => line,
        };
        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                log::warn!("Failed to read console input: {e}");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        match line.parse::<Command>() {
            Ok(command) => {
                if let Err(e) = execute(command, &handle, &realm).await {
                    log::warn!("{e:#}");
                }
            }
            Err(e) => log::warn!("{e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_commands() {
        assert_eq!("stop".parse::<Command>(), Ok(Command::Stop));
        assert_eq!("  STATUS ".parse::<Command>(), Ok(Command::Status));
        assert_eq!("warp 200".parse::<Command>(), Ok(Command::Warp(200)));
        assert_eq!("warp stop".parse::<Command>(), Ok(Command::CancelWarp));
        assert_eq!("rate 40".parse::<Command>(), Ok(Command::Rate(40.0)));
        assert_eq!("sleep alex".parse::<Command>(), Ok(Command::Sleep("alex".to_owned())));
    }

    #[test]
    fn test_parse_schedule() {
        assert_eq!(
            "schedule nether 1 -2 3 redstone".parse::<Command>(),
            Ok(Command::Schedule {
                world: "nether".to_owned(),
                pos: BlockPos::new(1, -2, 3),
                delay: 2,
                update: BlockUpdate::Redstone { power: 15 },
            })
        );
        assert_eq!(
            "schedule overworld 0 64 0 growth 5".parse::<Command>(),
            Ok(Command::Schedule {
                world: "overworld".to_owned(),
                pos: BlockPos::new(0, 64, 0),
                delay: 5,
                update: BlockUpdate::Growth { stage: 0 },
            })
        );
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(
            "fly".parse::<Command>(),
            Err(CommandError::Unknown("fly".to_owned()))
        );
        assert!(matches!("warp".parse::<Command>(), Err(CommandError::Usage(_))));
        assert!(matches!("warp -3".parse::<Command>(), Err(CommandError::Usage(_))));
        assert!(matches!("stop now".parse::<Command>(), Err(CommandError::Usage("stop"))));
        assert!(matches!(
            "schedule end 0 0 0 growth 0".parse::<Command>(),
            Err(CommandError::Usage(_))
        ));
        assert!(matches!(
            "schedule end 0 0 0 lava".parse::<Command>(),
            Err(CommandError::Usage(_))
        ));
    }
}
