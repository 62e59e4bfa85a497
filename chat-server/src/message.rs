use serde::{Deserialize, Serialize};

/// Username attached to frames the operator sends on behalf of the server.
pub const SERVER_NAME: &str = "server";

/// Request sent by a client. Before authentication `command` is `login` or
/// `register`; afterwards it is a slash command such as `/say`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClientFrame {
    pub command: String,
    #[serde(default)]
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl ClientFrame {
    pub fn new(command: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            body: body.into(),
            password: None,
        }
    }

    pub fn login(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            command: "login".to_string(),
            body: username.into(),
            password: Some(password.into()),
        }
    }

    pub fn register(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            command: "register".to_string(),
            body: username.into(),
            password: Some(password.into()),
        }
    }

    /// Builds a frame from a line typed by a user: `/cmd rest` becomes a
    /// command frame, anything else is sent as `/say`.
    pub fn from_input(line: &str) -> Self {
        let line = line.trim();
        if line.starts_with('/') {
            match line.split_once(char::is_whitespace) {
                Some((command, body)) => Self::new(command, body.trim_start()),
                None => Self::new(line, ""),
            }
        } else {
            Self::new("/say", line)
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum FrameKind {
    /// Connection-level notices: auth results, joins, leaves, kicks.
    Server,
    /// Reply to a command, visible only to the sender.
    Command,
    Message,
    Private,
    PrivateSent,
    Action,
    Clear,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServerFrame {
    #[serde(rename = "type")]
    pub kind: FrameKind,
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
}

impl ServerFrame {
    fn new(kind: FrameKind, body: impl Into<String>, username: Option<String>) -> Self {
        Self {
            kind,
            body: body.into(),
            username,
        }
    }

    pub fn server(body: impl Into<String>) -> Self {
        Self::new(FrameKind::Server, body, None)
    }

    pub fn command(body: impl Into<String>) -> Self {
        Self::new(FrameKind::Command, body, None)
    }

    pub fn message(from: impl Into<String>, body: impl Into<String>) -> Self {
        Self::new(FrameKind::Message, body, Some(from.into()))
    }

    pub fn private(from: impl Into<String>, body: impl Into<String>) -> Self {
        Self::new(FrameKind::Private, body, Some(from.into()))
    }

    pub fn private_sent(to: impl Into<String>, body: impl Into<String>) -> Self {
        Self::new(FrameKind::PrivateSent, body, Some(to.into()))
    }

    pub fn action(body: impl Into<String>) -> Self {
        Self::new(FrameKind::Action, body, None)
    }

    pub fn clear() -> Self {
        Self::new(FrameKind::Clear, "", None)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn server_frames_use_lowercase_type_tags() {
        let sent = serde_json::to_value(ServerFrame::private_sent("bob", "psst")).unwrap();
        assert_eq!(
            sent,
            json!({ "type": "privatesent", "body": "psst", "username": "bob" })
        );

        let notice = serde_json::to_value(ServerFrame::server("hello")).unwrap();
        assert_eq!(notice, json!({ "type": "server", "body": "hello" }));
    }

    #[test]
    fn client_frame_body_and_password_are_optional() {
        let frame: ClientFrame = serde_json::from_str(r#"{"command":"/list"}"#).unwrap();
        assert_eq!(frame, ClientFrame::new("/list", ""));

        let login: ClientFrame =
            serde_json::from_str(r#"{"command":"login","body":"carol","password":"pw"}"#).unwrap();
        assert_eq!(login, ClientFrame::login("carol", "pw"));
    }

    #[test]
    fn client_frame_requires_command() {
        assert!(serde_json::from_str::<ClientFrame>(r#"{"body":"hi"}"#).is_err());
    }

    #[test]
    fn input_lines_map_to_commands() {
        assert_eq!(ClientFrame::from_input("hello there"), ClientFrame::new("/say", "hello there"));
        assert_eq!(
            ClientFrame::from_input("/msg bob  see you"),
            ClientFrame::new("/msg", "bob  see you")
        );
        assert_eq!(ClientFrame::from_input("/list\n"), ClientFrame::new("/list", ""));
    }
}
