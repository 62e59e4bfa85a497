//! Operator commands typed into the server's console.
//!
//! These run through the same registry and router primitives as client
//! commands; the operator simply is not a session.

use std::sync::Arc;

use anyhow::{Result, anyhow, bail};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::{
    message::{SERVER_NAME, ServerFrame},
    registry::RegistryError,
    router::{Router, format_user_list},
    store::call_blocking,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperatorCommand {
    Broadcast(String),
    Say(String),
    Msg { to: String, text: String },
    Kick { username: String, reason: Option<String> },
    List,
    Accounts,
    Stop,
    Help,
}

impl OperatorCommand {
    /// Parses one console line. The command word is case-insensitive.
    ///
    /// - `broadcast <text>` - server notice to everyone
    /// - `say <text>` - chat message from the server to everyone
    /// - `msg <user> <text>` - private message from the server
    /// - `kick <user> [reason]` - disconnect a user
    /// - `list` - online users
    /// - `accounts` - every registered account
    /// - `stop` - shut the server down
    /// - `help`
    pub fn parse(line: &str) -> Result<Self> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Err(anyhow!("empty command"));
        }

        let (word, rest) = match trimmed.split_once(char::is_whitespace) {
            Some((word, rest)) => (word, rest.trim()),
            None => (trimmed, ""),
        };

        match (word.to_lowercase().as_str(), rest) {
            ("list", _) => Ok(OperatorCommand::List),
            ("accounts", _) => Ok(OperatorCommand::Accounts),
            ("stop", _) => Ok(OperatorCommand::Stop),
            ("help", _) => Ok(OperatorCommand::Help),
            ("broadcast", "") => Err(anyhow!("broadcast requires text: broadcast <text>")),
            ("broadcast", text) => Ok(OperatorCommand::Broadcast(text.to_string())),
            ("say", "") => Err(anyhow!("say requires text: say <text>")),
            ("say", text) => Ok(OperatorCommand::Say(text.to_string())),
            ("msg", rest) => match rest.split_once(char::is_whitespace) {
                Some((to, text)) if !text.trim().is_empty() => Ok(OperatorCommand::Msg {
                    to: to.to_string(),
                    text: text.trim().to_string(),
                }),
                _ => Err(anyhow!("msg requires a user and text: msg <user> <text>")),
            },
            ("kick", "") => Err(anyhow!("kick requires a user: kick <user> [reason]")),
            ("kick", rest) => {
                let (username, reason) = match rest.split_once(char::is_whitespace) {
                    Some((username, reason)) => (username, Some(reason.trim().to_string())),
                    None => (rest, None),
                };
                Ok(OperatorCommand::Kick {
                    username: username.to_string(),
                    reason,
                })
            }
            _ => Err(anyhow!(
                "invalid command. Try: broadcast, say, msg, kick, list, accounts, stop, help"
            )),
        }
    }
}

pub const OPERATOR_HELP: &str = "\
Operator commands:
  broadcast <text>      Send a server notice to every user
  say <text>            Chat to every user as 'server'
  msg <user> <text>     Private message a user as 'server'
  kick <user> [reason]  Disconnect a user
  list                  Show online users
  accounts              Show registered accounts
  stop                  Shut the server down
  help                  Show this help";

pub struct Operator {
    router: Arc<Router>,
    shutdown: CancellationToken,
}

impl Operator {
    pub fn new(router: Arc<Router>, shutdown: CancellationToken) -> Self {
        Self { router, shutdown }
    }

    /// Runs a command and returns the text to show the operator.
    pub async fn execute(&self, command: OperatorCommand) -> Result<String> {
        let registry = self.router.registry();
        match command {
            OperatorCommand::Broadcast(text) => {
                let delivered = registry.broadcast(ServerFrame::server(text), None).await;
                Ok(format!("Broadcast delivered to {delivered} user(s)."))
            }
            OperatorCommand::Say(text) => {
                let delivered = registry
                    .broadcast(ServerFrame::message(SERVER_NAME, text), None)
                    .await;
                Ok(format!("Message delivered to {delivered} user(s)."))
            }
            OperatorCommand::Msg { to, text } => {
                let target = registry.lookup(&to).await?;
                target.deliver(ServerFrame::private(SERVER_NAME, text)).await?;
                Ok(format!("Private message sent to {to}."))
            }
            OperatorCommand::Kick { username, reason } => self.kick(&username, reason).await,
            OperatorCommand::List => Ok(format_user_list(&registry.snapshot().await)),
            OperatorCommand::Accounts => self.accounts().await,
            OperatorCommand::Stop => {
                self.stop().await;
                Ok("Server stopping.".to_string())
            }
            OperatorCommand::Help => Ok(OPERATOR_HELP.to_string()),
        }
    }

    /// Takes the user out of the registry, so no further broadcast reaches
    /// them, and closes their session with the notice as its last frame.
    /// The session announces the departure.
    pub async fn kick(&self, username: &str, reason: Option<String>) -> Result<String> {
        let target = self
            .router
            .registry()
            .remove(username)
            .await
            .ok_or_else(|| RegistryError::NotFound(username.to_string()))?;
        let notice = match reason {
            Some(reason) => format!("You have been kicked from the server: {reason}"),
            None => "You have been kicked from the server.".to_string(),
        };
        target.dismiss(ServerFrame::server(notice));
        info!(username, peer = ?target.peer(), "user kicked by operator");
        Ok(format!("Kicked {username}."))
    }

    pub async fn stop(&self) {
        info!("operator requested shutdown");
        self.router
            .registry()
            .broadcast(ServerFrame::server("Server is shutting down."), None)
            .await;
        self.shutdown.cancel();
    }

    async fn accounts(&self) -> Result<String> {
        let accounts = call_blocking(self.router.store(), |store| store.list_all()).await?;
        if accounts.is_empty() {
            return Ok("No registered accounts.".to_string());
        }

        let lines: Vec<String> = accounts
            .iter()
            .map(|account| {
                format!(
                    "{:<20} messages={:<6} last_login={}",
                    account.username,
                    account.message_count,
                    account.last_login.format("%Y-%m-%d %H:%M:%S UTC"),
                )
            })
            .collect();
        Ok(lines.join("\n"))
    }
}

/// Executes console lines until the input ends or `stop` is issued.
pub async fn run_console(operator: &Operator, mut lines: mpsc::Receiver<String>) -> Result<()> {
    while let Some(line) = lines.recv().await {
        if line.trim().is_empty() {
            continue;
        }

        let command = match OperatorCommand::parse(&line) {
            Ok(command) => command,
            Err(err) => {
                println!("error: {err}");
                continue;
            }
        };

        let stopping = command == OperatorCommand::Stop;
        match operator.execute(command).await {
            Ok(output) => println!("{output}"),
            Err(err) => println!("error: {err}"),
        }
        if stopping {
            return Ok(());
        }
    }

    bail!("operator console input closed")
}
