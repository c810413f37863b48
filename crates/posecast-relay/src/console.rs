//! Line-oriented operator commands read from stdin.

use crate::registry::DeviceTarget;
use crate::server::RelayState;
use posecast_common::SystemCommand;
use std::fmt::Write as _;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

const HELP: &str = "\
commands:
  list                          show registered devices
  select <device|all> <label>   select an exercise
  start <device|all>            start a workout
  stop <device|all>             stop a workout
  help                          show this text
devices are addressed by index ([1], [2], ...), device id, or `all`";

/// A parsed operator line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperatorCommand {
    /// Print the device table.
    List,
    /// Send a command to one device or all of them.
    Send {
        /// Addressed devices.
        target: DeviceTarget,
        /// Command to send.
        command: SystemCommand,
    },
    /// Print usage.
    Help,
}

/// Parse one operator line. Blank lines parse to `Ok(None)`.
///
/// # Errors
///
/// Returns a usage message for unknown verbs or missing arguments.
pub fn parse_line(line: &str) -> Result<Option<OperatorCommand>, String> {
    let mut words = line.split_whitespace();
    let Some(verb) = words.next() else {
        return Ok(None);
    };
    let target = |w: Option<&str>| -> Result<DeviceTarget, String> {
        let w = w.ok_or_else(|| format!("{verb}: missing device"))?;
        w.trim_start_matches('[')
            .trim_end_matches(']')
            .parse()
            .map_err(|_| format!("{verb}: bad device {w}"))
    };
    let cmd = match verb.to_ascii_lowercase().as_str() {
        "list" | "ls" => OperatorCommand::List,
        "help" | "?" => OperatorCommand::Help,
        "select" => {
            let target = target(words.next())?;
            let label = words.next().ok_or("select: missing exercise")?;
            OperatorCommand::Send {
                target,
                command: SystemCommand::SelectExercise {
                    exercise_type: Some(label.to_string()),
                },
            }
        }
        "start" => OperatorCommand::Send {
            target: target(words.next())?,
            command: SystemCommand::StartWorkout,
        },
        "stop" => OperatorCommand::Send {
            target: target(words.next())?,
            command: SystemCommand::StopWorkout,
        },
        other => return Err(format!("unknown command: {other} (try `help`)")),
    };
    Ok(Some(cmd))
}

/// Carry out `cmd` and describe the outcome.
#[must_use]
pub fn execute(state: &RelayState, cmd: OperatorCommand) -> String {
    match cmd {
        OperatorCommand::Help => HELP.to_string(),
        OperatorCommand::List => {
            let devices = state.registry.list();
            if devices.is_empty() {
                return "no devices connected".to_string();
            }
            let mut out = String::new();
            for d in devices {
                let workout = if d.workout_active {
                    "workout active"
                } else {
                    "idle"
                };
                let _ = writeln!(
                    out,
                    "  [{}] {} - {} ({})",
                    d.index, d.device_id, d.exercise, workout
                );
            }
            out.pop();
            out
        }
        OperatorCommand::Send { target, command } => match state.command(&target, command) {
            Ok(n) => format!("sent to {n} device(s)"),
            Err(e) => format!("error: {e}"),
        },
    }
}

/// Read operator lines from `input` until EOF, answering on `output`.
///
/// # Errors
///
/// Returns an error if reading the input or writing a reply fails.
pub async fn run_console<R, W>(
    state: Arc<RelayState>,
    input: R,
    mut output: W,
) -> std::io::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = input.lines();
    while let Some(line) = lines.next_line().await? {
        let reply = match parse_line(&line) {
            Ok(Some(cmd)) => execute(&state, cmd),
            Ok(None) => continue,
            Err(e) => e,
        };
        output.write_all(reply.as_bytes()).await?;
        output.write_all(b"\n").await?;
        output.flush().await?;
    }
    debug!("operator console closed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use tokio::io::BufReader;
    use tokio::sync::mpsc;

    #[test]
    fn parse_verbs() {
        assert_eq!(parse_line("  ").unwrap(), None);
        assert_eq!(parse_line("list").unwrap(), Some(OperatorCommand::List));
        assert_eq!(parse_line("HELP").unwrap(), Some(OperatorCommand::Help));
        assert_eq!(
            parse_line("start all").unwrap(),
            Some(OperatorCommand::Send {
                target: DeviceTarget::All,
                command: SystemCommand::StartWorkout,
            })
        );
        assert_eq!(
            parse_line("stop [2]").unwrap(),
            Some(OperatorCommand::Send {
                target: DeviceTarget::Index(2),
                command: SystemCommand::StopWorkout,
            })
        );
        assert_eq!(
            parse_line("select dev-9 squats").unwrap(),
            Some(OperatorCommand::Send {
                target: DeviceTarget::Id("dev-9".into()),
                command: SystemCommand::SelectExercise {
                    exercise_type: Some("squats".into()),
                },
            })
        );
    }

    #[test]
    fn parse_errors() {
        assert!(parse_line("start").unwrap_err().contains("missing device"));
        assert!(parse_line("select 1").unwrap_err().contains("missing exercise"));
        assert!(parse_line("jump 1").unwrap_err().contains("unknown command"));
    }

    #[tokio::test]
    async fn console_session() {
        let state = Arc::new(RelayState::new(ServerConfig::default()));
        let (tx, mut rx) = mpsc::channel(4);
        state.registry.register("dev-a", "push-ups", 1, tx);

        let input = BufReader::new(&b"list\n\nstart 1\nstop 7\nbogus\n"[..]);
        let mut output = Vec::new();
        run_console(Arc::clone(&state), input, &mut output).await.unwrap();

        let text = String::from_utf8(output).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "  [1] dev-a - push-ups (idle)");
        assert_eq!(lines[1], "sent to 1 device(s)");
        assert_eq!(lines[2], "error: device [7] not found");
        assert!(lines[3].starts_with("unknown command"));
        assert!(rx.recv().await.unwrap().contains("start_workout"));
    }

    #[test]
    fn empty_list() {
        let state = RelayState::new(ServerConfig::default());
        assert_eq!(execute(&state, OperatorCommand::List), "no devices connected");
    }
}
