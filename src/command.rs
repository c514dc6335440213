//! Operator commands.
//!
//! Commands arrive asynchronously (stdin, MQTT, Ctrl-C) over a channel and
//! are drained by the tracking thread once per frame, so the tracking state
//! only ever has a single writer.

use std::io::BufRead;
use std::str::FromStr;
use std::sync::mpsc::Sender;
use std::thread::JoinHandle;

use anyhow::{anyhow, Result};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OperatorCommand {
    /// Point at the configured center and drop PID state.
    Center,
    /// Drop PID state and the last target center; angles are untouched.
    Reset,
    /// Follow a new identity, or none for observation-only mode.
    SetTarget(Option<String>),
    Quit,
}

impl FromStr for OperatorCommand {
    type Err = anyhow::Error;

    /// Accepts `center`/`c`, `reset`/`r`, `quit`/`q`, and
    /// `target <label>`/`t <label>`; `target none` or a bare `t` clears it.
    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        let (verb, rest) = match trimmed.split_once(char::is_whitespace) {
            Some((verb, rest)) => (verb, rest.trim()),
            None => (trimmed, ""),
        };
        match verb.to_lowercase().as_str() {
            "c" | "center" => Ok(Self::Center),
            "r" | "reset" => Ok(Self::Reset),
            "q" | "quit" | "exit" => Ok(Self::Quit),
            "t" | "target" => {
                if rest.is_empty() || rest.eq_ignore_ascii_case("none") {
                    Ok(Self::SetTarget(None))
                } else {
                    Ok(Self::SetTarget(Some(rest.to_string())))
                }
            }
            "" => Err(anyhow!("empty command")),
            other => Err(anyhow!("unknown command '{}'", other)),
        }
    }
}

/// Parse JSON command payloads such as `{"command":"target","label":"laura"}`,
/// falling back to the plain-text form.
pub fn parse_command_payload(payload: &[u8]) -> Result<OperatorCommand> {
    #[derive(serde::Deserialize)]
    struct CommandPayload {
        command: String,
        #[serde(default)]
        label: Option<String>,
    }

    if let Ok(parsed) = serde_json::from_slice::<CommandPayload>(payload) {
        let text = match parsed.label {
            Some(label) => format!("{} {}", parsed.command, label),
            None => parsed.command,
        };
        return text.parse();
    }
    let text = std::str::from_utf8(payload).map_err(|e| anyhow!("command is not utf-8: {}", e))?;
    text.parse()
}

/// Forward stdin lines as commands until stdin closes or the receiver hangs up.
pub fn spawn_stdin_reader(tx: Sender<OperatorCommand>) -> JoinHandle<()> {
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            if line.trim().is_empty() {
                continue;
            }
            match line.parse::<OperatorCommand>() {
                Ok(cmd) => {
                    if tx.send(cmd).is_err() {
                        break;
                    }
                }
                Err(e) => log::warn!("ignored operator input: {}", e),
            }
        }
    })
}
