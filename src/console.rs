//! Line-oriented host standing in for the page layer: each stdin line is a
//! press event, a form edit or a connectivity change.

use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::gesture::PressEvent;
use crate::models::Situation;
use crate::processor::alert_dispatcher::AlertDispatcher;
use crate::processor::retry_sweep::ConnectivityEvent;

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Press(PressEvent),
    Situation(Situation),
    Name(String),
    Message(String),
    Share(bool),
    Connectivity(ConnectivityEvent),
    Clear,
    Pending,
    Status,
    Health,
    Quit,
}

pub fn parse_command(line: &str) -> Result<Command, String> {
    let line = line.trim();
    let (word, rest) = match line.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, rest.trim()),
        None => (line, ""),
    };

    let command = match word.to_lowercase().as_str() {
        "down" => Command::Press(PressEvent::PointerDown),
        "up" => Command::Press(PressEvent::PointerUp),
        "leave" => Command::Press(PressEvent::PointerLeave),
        "touchstart" => Command::Press(PressEvent::TouchStart),
        "touchend" => Command::Press(PressEvent::TouchEnd),
        "touchcancel" => Command::Press(PressEvent::TouchCancel),
        "situation" => Command::Situation(rest.parse::<Situation>().map_err(|e| e.to_string())?),
        "name" => Command::Name(rest.to_string()),
        "message" => Command::Message(rest.to_string()),
        "share" => match rest {
            "on" => Command::Share(true),
            "off" => Command::Share(false),
            other => return Err(format!("share expects on|off, got '{}'", other)),
        },
        "online" => Command::Connectivity(ConnectivityEvent::Online),
        "offline" => Command::Connectivity(ConnectivityEvent::Offline),
        "clear" => Command::Clear,
        "pending" => Command::Pending,
        "status" => Command::Status,
        "health" => Command::Health,
        "quit" | "exit" => Command::Quit,
        "" => return Err("empty command".to_string()),
        other => return Err(format!("unknown command '{}'", other)),
    };
    Ok(command)
}

pub struct ConsoleHost {
    pub dispatcher: Arc<AlertDispatcher>,
    pub presses: mpsc::Sender<PressEvent>,
    pub connectivity: mpsc::Sender<ConnectivityEvent>,
}

impl ConsoleHost {
    /// Reads commands until `quit` or end of input.
    pub async fn run<R: AsyncBufRead + Unpin>(&self, input: R) -> anyhow::Result<()> {
        let mut lines = input.lines();
        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let command = match parse_command(&line) {
                Ok(c) => c,
                Err(e) => {
                    warn!("Ignoring input: {}", e);
                    continue;
                }
            };
            if command == Command::Quit {
                break;
            }
            self.apply(command).await?;
        }
        info!("Console input closed");
        Ok(())
    }

    async fn apply(&self, command: Command) -> anyhow::Result<()> {
        match command {
            Command::Press(event) => self.presses.send(event).await?,
            Command::Situation(s) => self.dispatcher.select_situation(s),
            Command::Name(name) => self.dispatcher.set_name(&name),
            Command::Message(message) => self.dispatcher.set_message(&message),
            Command::Share(on) => self.dispatcher.set_share_location(on),
            Command::Connectivity(event) => self.connectivity.send(event).await?,
            Command::Clear => self.dispatcher.reset_form(),
            Command::Pending => {
                let pending = self.dispatcher.pending().await;
                println!("{} pending alert(s)", pending.len());
                for record in pending {
                    println!(
                        "  {} {} {} retries={}",
                        record.id, record.created_at, record.situation, record.retry_count
                    );
                }
            }
            Command::Status => {
                let form = self.dispatcher.form();
                let status = self.dispatcher.status();
                println!(
                    "state={:?} situation={} share_location={} {}",
                    status.state,
                    form.situation.map(|s| s.to_string()).unwrap_or_else(|| "-".into()),
                    form.share_location,
                    status.text
                );
            }
            Command::Health => {
                for h in self.dispatcher.failover().health() {
                    println!(
                        "  {} ok={} failed={} last_error={}",
                        h.endpoint,
                        h.successes,
                        h.failures,
                        h.last_error.as_deref().unwrap_or("-")
                    );
                }
            }
            Command::Quit => {}
        }
        Ok(())
    }
}
