use crate::{Error, Result};
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

/// Lifecycle verb sent to a provider with its configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Command {
    Run,
    Init,
    Destroy,
    Plan,
    Status,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Run => "run",
            Command::Init => "init",
            Command::Destroy => "destroy",
            Command::Plan => "plan",
            Command::Status => "status",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Command {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "run" => Ok(Command::Run),
            "init" => Ok(Command::Init),
            "destroy" => Ok(Command::Destroy),
            "plan" => Ok(Command::Plan),
            "status" => Ok(Command::Status),
            other => Err(Error::Config(format!("unknown command '{}'", other))),
        }
    }
}

#[derive(Serialize)]
struct Envelope<'a> {
    command: Command,
    config: &'a serde_json::Value,
}

/// The single line written to a provider's stdin before any data:
/// `{"command": "<verb>", "config": {...}}` followed by a newline.
pub fn encode(command: Command, config: &serde_json::Value) -> Result<Vec<u8>> {
    let empty = serde_json::Value::Object(Default::default());
    let config = if config.is_null() { &empty } else { config };
    let mut line = serde_json::to_vec(&Envelope { command, config })?;
    line.push(b'\n');
    Ok(line)
}
