//! Command dispatch for authenticated sessions.
//!
//! The router decides who receives what. All delivery goes through the
//! [`Registry`], so a reply to the sender and a broadcast from another
//! session share the same per-session outbox and never interleave on the wire.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use chrono::Local;
use tracing::{debug, error};

use crate::{
    command::{ChatCommand, HELP_TEXT},
    message::{ClientFrame, ServerFrame},
    registry::{Registry, SessionHandle},
    store::{SharedStore, call_blocking},
};

/// What the session should do after a frame has been dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Exit,
}

pub struct Router {
    registry: Arc<Registry>,
    store: SharedStore,
    started_at: Instant,
}

impl Router {
    pub fn new(registry: Arc<Registry>, store: SharedStore) -> Self {
        Self {
            registry,
            store,
            started_at: Instant::now(),
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub async fn dispatch(&self, sender: &SessionHandle, frame: ClientFrame) -> Flow {
        let command = match ChatCommand::parse(&frame) {
            Ok(command) => command,
            Err(usage) => {
                reply(sender, ServerFrame::command(usage.to_string())).await;
                return Flow::Continue;
            }
        };

        match command {
            ChatCommand::Say(text) => self.say(sender, text).await,
            ChatCommand::Msg { to, text } => self.private_message(sender, &to, text).await,
            ChatCommand::Me(text) => self.action(sender, &text).await,
            ChatCommand::List => {
                let online = self.registry.snapshot().await;
                reply(sender, ServerFrame::command(format_user_list(&online))).await;
            }
            ChatCommand::Ping => reply(sender, ServerFrame::command("pong")).await,
            ChatCommand::Time => {
                let now = Local::now().format("%Y-%m-%d %H:%M:%S");
                reply(sender, ServerFrame::command(format!("Server time: {now}"))).await;
            }
            ChatCommand::Uptime => {
                let uptime = format_uptime(self.uptime());
                reply(sender, ServerFrame::command(format!("Server uptime: {uptime}"))).await;
            }
            ChatCommand::WhoAmI => {
                let details = self.whoami(sender.username()).await;
                reply(sender, ServerFrame::command(details)).await;
            }
            ChatCommand::Help => reply(sender, ServerFrame::command(HELP_TEXT)).await,
            ChatCommand::Clear => reply(sender, ServerFrame::clear()).await,
            ChatCommand::Exit => return Flow::Exit,
        }

        Flow::Continue
    }

    /// Sends chat text to everyone except the sender.
    pub async fn say(&self, sender: &SessionHandle, text: String) {
        if text.is_empty() {
            return;
        }
        self.record_message(sender.username()).await;
        let username = sender.username();
        self.registry
            .broadcast(ServerFrame::message(username, text), Some(username))
            .await;
    }

    /// Unlike [`Router::say`], an action is echoed back to its sender.
    pub async fn action(&self, sender: &SessionHandle, text: &str) {
        self.record_message(sender.username()).await;
        let body = format!("* {} {}", sender.username(), text);
        self.registry.broadcast(ServerFrame::action(body), None).await;
    }

    async fn private_message(&self, sender: &SessionHandle, to: &str, text: String) {
        let Ok(target) = self.registry.lookup(to).await else {
            reply(sender, ServerFrame::command(format!("User {to} is not online."))).await;
            return;
        };

        if let Err(err) = target
            .deliver(ServerFrame::private(sender.username(), text.clone()))
            .await
        {
            debug!(from = sender.username(), to, error = %err, "private message not delivered");
            reply(sender, ServerFrame::command(format!("User {to} is not online."))).await;
            return;
        }
        self.record_message(sender.username()).await;
        reply(sender, ServerFrame::private_sent(to, text)).await;
    }

    pub async fn announce_join(&self, username: &str) {
        let notice = ServerFrame::server(format!("{username} has joined the chat."));
        self.registry.broadcast(notice, Some(username)).await;
    }

    pub async fn announce_leave(&self, username: &str) {
        let notice = ServerFrame::server(format!("{username} has left the chat."));
        self.registry.broadcast(notice, Some(username)).await;
    }

    async fn whoami(&self, username: &str) -> String {
        let name = username.to_string();
        match call_blocking(&self.store, move |store| store.account(&name)).await {
            Ok(Some(account)) => format!(
                "You are {}. Messages sent: {}. Member since {}. Last login {}.",
                account.username,
                account.message_count,
                account.created_at.format("%Y-%m-%d %H:%M:%S UTC"),
                account.last_login.format("%Y-%m-%d %H:%M:%S UTC"),
            ),
            Ok(None) => format!("You are {username}."),
            Err(err) => {
                error!(username, error = %err, "failed to read account");
                format!("You are {username}. Account details are unavailable right now.")
            }
        }
    }

    async fn record_message(&self, username: &str) {
        let name = username.to_string();
        if let Err(err) =
            call_blocking(&self.store, move |store| store.increment_message_count(&name)).await
        {
            error!(username, error = %err, "failed to record message");
        }
    }
}

async fn reply(sender: &SessionHandle, frame: ServerFrame) {
    if let Err(err) = sender.deliver(frame).await {
        debug!(username = sender.username(), error = %err, "reply not delivered");
    }
}

pub fn format_user_list(online: &[String]) -> String {
    if online.is_empty() {
        return "No users online.".to_string();
    }
    format!("Online users ({}): {}", online.len(), online.join(", "))
}

fn format_uptime(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    let (days, hours, minutes, seconds) = (secs / 86_400, secs / 3_600 % 24, secs / 60 % 60, secs % 60);
    if days > 0 {
        format!("{days}d {hours:02}h {minutes:02}m {seconds:02}s")
    } else {
        format!("{hours:02}h {minutes:02}m {seconds:02}s")
    }
}
