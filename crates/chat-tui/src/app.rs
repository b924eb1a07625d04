//! Application state and message handling

use anyhow::Result;
use chat_core::{ChatEvent, EventReceiver, UserCommand};
use std::io::{self, Write};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::debug;

/// Console front-end: turns stdin lines into commands for the controller.
pub struct ChatApp {
    pub username: String,
    pub command_sender: mpsc::UnboundedSender<UserCommand>,
}

impl ChatApp {
    pub fn new(username: String) -> (Self, mpsc::UnboundedReceiver<UserCommand>) {
        let (sender, receiver) = mpsc::unbounded_channel();

        let app = ChatApp {
            username,
            command_sender: sender,
        };

        (app, receiver)
    }

    pub fn print_help(&self) {
        println!("Welcome {}!", self.username);
        println!("Send broadcast messages by typing and hitting <Enter>.");
        println!("Send private messages like this: @username message to send");
        println!("Type \"quit\" to exit.");
    }

    /// Reads stdin until the user quits or input ends. Either way a
    /// shutdown command is sent before returning.
    pub async fn handle_user_input(&self) -> Result<()> {
        let stdin = tokio::io::stdin();
        let mut lines = BufReader::new(stdin).lines();

        prompt()?;
        while let Some(line) = lines.next_line().await? {
            match parse_line(&line) {
                Ok(Some(UserCommand::Shutdown)) => break,
                Ok(Some(command)) => {
                    if self.command_sender.send(command).is_err() {
                        debug!("Controller stopped; leaving input loop");
                        return Ok(());
                    }
                }
                Ok(None) => {}
                Err(hint) => println!("{hint}"),
            }
            prompt()?;
        }

        let _ = self.command_sender.send(UserCommand::Shutdown);
        Ok(())
    }
}

fn prompt() -> io::Result<()> {
    print!("> ");
    io::stdout().flush()
}

/// `quit` exits, `@name text` is a private message, anything else is a
/// broadcast. Blank lines are ignored.
pub fn parse_line(line: &str) -> std::result::Result<Option<UserCommand>, String> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    if trimmed.eq_ignore_ascii_case("quit") || trimmed.eq_ignore_ascii_case("exit") {
        return Ok(Some(UserCommand::Shutdown));
    }
    if let Some(rest) = trimmed.strip_prefix('@') {
        return match rest.split_once(char::is_whitespace) {
            Some((username, text)) if !username.is_empty() && !text.trim().is_empty() => {
                Ok(Some(UserCommand::Private {
                    username: username.to_string(),
                    text: text.trim().to_string(),
                }))
            }
            _ => Err("Usage: @username message to send".to_string()),
        };
    }
    Ok(Some(UserCommand::Broadcast(trimmed.to_string())))
}

/// Renders controller events until the controller drops its sender.
pub async fn print_events(mut events: EventReceiver) {
    while let Some(event) = events.recv().await {
        match event {
            ChatEvent::ChatMessageArrived { peer, text, .. } => {
                println!("\r{}: {}", peer.display_name(), text);
            }
            ChatEvent::ClientConnected(peer) => {
                println!("\rConnected to {peer}");
            }
            ChatEvent::ClientDisconnected { peer, reason } => {
                println!("\r{} disconnected ({reason})", peer.display_name());
            }
            ChatEvent::SendFailed { peer, text, reason } => {
                let to = peer
                    .map(|p| p.display_name())
                    .unwrap_or_else(|| "nobody".to_string());
                println!("\rThe following message could not be sent to {to}:\n{text}\nReason: {reason}");
            }
            ChatEvent::DuplicateResolved { kept, .. } => {
                debug!("Kept existing connection to {kept}");
                continue;
            }
            ChatEvent::ConnectFailed { address, reason } => {
                println!("\rCould not connect to {address}: {reason}");
            }
        }
        print!("> ");
        let _ = io::stdout().flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_broadcast_and_quit() {
        assert_eq!(
            parse_line("  hello world "),
            Ok(Some(UserCommand::Broadcast("hello world".into())))
        );
        assert_eq!(parse_line("QUIT"), Ok(Some(UserCommand::Shutdown)));
        assert_eq!(parse_line("   "), Ok(None));
    }

    #[test]
    fn test_parse_private() {
        assert_eq!(
            parse_line("@bob see you at noon"),
            Ok(Some(UserCommand::Private {
                username: "bob".into(),
                text: "see you at noon".into(),
            }))
        );
        assert!(parse_line("@bob").is_err());
        assert!(parse_line("@ hi").is_err());
    }
}
