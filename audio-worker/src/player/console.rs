//! Runtime commands typed on stdin while a worker is streaming.

use audio_worker::protocol::CommandRecord;

pub const HELP: &str = "\
commands:
  seek TS            jump to TS, in [[h:]m:]s form
  volume N [force]   set the volume in percent; `force` lifts the 500 cap
  fx SPEC...         replace the effect chain
  fx clear           remove all effects
  stop               stop playback
  help               show this message";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Seek(String),
    Volume { volume: u32, force: bool },
    Effects(Vec<String>),
    ClearEffects,
    Stop,
    Help,
}

impl ConsoleCommand {
    /// Parses one line. Blank lines yield `Ok(None)`.
    pub fn parse(line: &str) -> Result<Option<Self>, String> {
        let mut words = line.split_whitespace();
        let Some(verb) = words.next() else {
            return Ok(None);
        };
        let rest: Vec<&str> = words.collect();
        let command = match (verb, rest.as_slice()) {
            ("seek", [ts]) => ConsoleCommand::Seek(ts.to_string()),
            ("volume" | "vol", [n] | [n, "force"]) => ConsoleCommand::Volume {
                volume: n.parse().map_err(|_| format!("not a volume: {n}"))?,
                force: rest.len() == 2,
            },
            ("fx", ["clear"]) => ConsoleCommand::ClearEffects,
            ("fx", specs) if !specs.is_empty() => {
                ConsoleCommand::Effects(specs.iter().map(|s| s.to_string()).collect())
            }
            ("stop" | "quit", []) => ConsoleCommand::Stop,
            ("help" | "?", []) => ConsoleCommand::Help,
            _ => return Err(format!("unrecognized command: {}", line.trim())),
        };
        Ok(Some(command))
    }

    /// The update record carrying this command, if it is one the worker handles.
    pub fn to_update(&self, id: &str) -> Option<CommandRecord> {
        let mut record = CommandRecord::update(id);
        match self {
            ConsoleCommand::Seek(ts) => record.seek = Some(ts.clone()),
            ConsoleCommand::Volume { volume, force } => {
                record.volume = Some(*volume);
                record.force = *force;
            }
            ConsoleCommand::Effects(specs) => record.helper_chain = specs.clone(),
            // An empty forced chain replaces whatever is there.
            ConsoleCommand::ClearEffects => record.force = true,
            ConsoleCommand::Stop | ConsoleCommand::Help => return None,
        }
        Some(record)
    }
}
