//! Parsing of chat commands sent by authenticated clients.

use crate::{error::UsageError, message::ClientFrame};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatCommand {
    Say(String),
    Msg { to: String, text: String },
    Me(String),
    List,
    Ping,
    Time,
    Uptime,
    WhoAmI,
    Help,
    Clear,
    Exit,
}

impl ChatCommand {
    /// Interprets a frame received after authentication.
    ///
    /// The command word is case-insensitive. A frame with an empty command
    /// takes the command from a leading `/` in the body; a body without a
    /// leading `/` is an implicit `/say`.
    pub fn parse(frame: &ClientFrame) -> Result<Self, UsageError> {
        let command = frame.command.trim().to_lowercase();
        let (command, rest) = if command.is_empty() {
            split_body(&frame.body)
        } else {
            (command, frame.body.as_str())
        };

        match command.as_str() {
            "/say" => Ok(ChatCommand::Say(rest.trim().to_string())),
            "/msg" => parse_msg(rest),
            "/me" => match rest.trim() {
                "" => Err(UsageError::Me),
                text => Ok(ChatCommand::Me(text.to_string())),
            },
            "/list" => Ok(ChatCommand::List),
            "/ping" => Ok(ChatCommand::Ping),
            "/time" => Ok(ChatCommand::Time),
            "/uptime" => Ok(ChatCommand::Uptime),
            "/whoami" => Ok(ChatCommand::WhoAmI),
            "/help" => Ok(ChatCommand::Help),
            "/clear" => Ok(ChatCommand::Clear),
            "/exit" => Ok(ChatCommand::Exit),
            "login" | "register" => Err(UsageError::AlreadyAuthenticated),
            _ => Err(UsageError::UnknownCommand(command)),
        }
    }
}

fn split_body(body: &str) -> (String, &str) {
    let body = body.trim_start();
    if !body.starts_with('/') {
        return ("/say".to_string(), body);
    }
    match body.split_once(char::is_whitespace) {
        Some((command, rest)) => (command.to_lowercase(), rest),
        None => (body.trim_end().to_lowercase(), ""),
    }
}

fn parse_msg(rest: &str) -> Result<ChatCommand, UsageError> {
    let (to, text) = rest.trim().split_once(char::is_whitespace).ok_or(UsageError::Msg)?;
    let text = text.trim();
    if text.is_empty() {
        return Err(UsageError::Msg);
    }
    Ok(ChatCommand::Msg {
        to: to.to_string(),
        text: text.to_string(),
    })
}

pub const HELP_TEXT: &str = "\
Available commands:
  /say <message>        Send a message to everyone else (same as typing without a command)
  /msg <user> <message> Send a private message
  /me <action>          Describe an action to everyone
  /list                 Show online users
  /whoami               Show your account details
  /time                 Show the server time
  /uptime               Show how long the server has been running
  /ping                 Check the connection
  /clear                Clear your screen
  /help                 Show this help
  /exit                 Leave the chat";
