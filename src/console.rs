use std::{
    io::BufRead,
    path::PathBuf,
    thread,
};

use anyhow::{Context, Result, anyhow, bail};
use crossbeam_channel::Sender;

use crate::pipeline::{Controls, ModelKind};

/// A line typed on the supervisor console.
#[derive(Clone, Debug, PartialEq)]
pub enum ConsoleCommand {
    SwitchModel(ModelKind),
    Threshold(f32),
    Pause,
    Resume,
    Filter(bool),
    Snapshot(Option<PathBuf>),
    Status,
    Quit,
}

pub const HELP: &str = "commands: model fast|full, threshold <0-1>, pause, resume, \
filter on|off, snapshot [path], status, quit";

impl ConsoleCommand {
    /// Parse one line. Blank lines yield `None`.
    pub fn parse(line: &str) -> Result<Option<Self>> {
        let mut words = line.split_whitespace();
        let Some(verb) = words.next() else {
            return Ok(None);
        };
        let arg = words.next();
        if words.next().is_some() {
            bail!("too many arguments for `{verb}`");
        }

        let command = match (verb.to_ascii_lowercase().as_str(), arg) {
            ("model", Some(kind)) => ConsoleCommand::SwitchModel(kind.parse()?),
            ("threshold", Some(value)) => {
                let value: f32 = value
                    .parse()
                    .with_context(|| format!("`{value}` is not a number"))?;
                if value.is_nan() {
                    bail!("threshold must be a number");
                }
                ConsoleCommand::Threshold(value.clamp(0.0, 1.0))
            }
            ("pause", None) => ConsoleCommand::Pause,
            ("resume", None) => ConsoleCommand::Resume,
            ("filter", Some(toggle)) => ConsoleCommand::Filter(parse_toggle(toggle)?),
            ("snapshot", path) => ConsoleCommand::Snapshot(path.map(PathBuf::from)),
            ("status", None) => ConsoleCommand::Status,
            ("quit" | "exit", None) => ConsoleCommand::Quit,
            ("model" | "threshold" | "filter", None) => bail!("`{verb}` needs a value"),
            _ => return Err(anyhow!("unknown command `{}`", line.trim())),
        };
        Ok(Some(command))
    }

    /// Apply the parts of the command that only touch shared controls.
    /// Returns `false` for commands the caller has to handle.
    pub fn apply(&self, controls: &Controls) -> bool {
        match self {
            ConsoleCommand::Threshold(value) => controls.set_threshold(*value),
            ConsoleCommand::Pause => controls.set_paused(true),
            ConsoleCommand::Resume => controls.set_paused(false),
            ConsoleCommand::Filter(enabled) => controls.set_filter_duplicates(*enabled),
            _ => return false,
        }
        true
    }
}

fn parse_toggle(raw: &str) -> Result<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "on" | "true" | "yes" | "1" => Ok(true),
        "off" | "false" | "no" | "0" => Ok(false),
        other => Err(anyhow!("expected on or off, got `{other}`")),
    }
}

/// Read commands from `input` on a background thread. End of input only ends
/// the reader; the pipeline keeps running without a console.
pub fn spawn_reader<R>(input: R, commands: Sender<ConsoleCommand>) -> Result<thread::JoinHandle<()>>
where
    R: BufRead + Send + 'static,
{
    let handle = thread::Builder::new()
        .name("console".to_string())
        .spawn(move || {
            for line in input.lines() {
                let line = match line {
                    Ok(line) => line,
                    Err(err) => {
                        log::warn!("console read failed: {err:?}");
                        break;
                    }
                };
                match ConsoleCommand::parse(&line) {
                    Ok(Some(command)) => {
                        let quit = command == ConsoleCommand::Quit;
                        if commands.send(command).is_err() || quit {
                            return;
                        }
                    }
                    Ok(None) => {}
                    Err(err) => eprintln!("{err:#}\n{HELP}"),
                }
            }
            log::info!("console input closed");
        })?;
    Ok(handle)
}
