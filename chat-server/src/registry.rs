//! The set of authenticated sessions, keyed by username.
//!
//! The registry never owns a session. It stores a [`SessionHandle`], which
//! can queue frames on the session's outbox and ask the session to end; the
//! session task itself performs the teardown.

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{Arc, OnceLock},
    time::Duration,
};

use futures::future::join_all;
use thiserror::Error;
use tokio::sync::{
    Mutex,
    mpsc::{self, error::SendTimeoutError},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::message::ServerFrame;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("user {0} is already connected")]
    DuplicateUser(String),

    #[error("user {0} is not online")]
    NotFound(String),

    #[error("session for {0} closed before it could be registered")]
    SessionClosed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    #[error("outbound backlog for {0} is full")]
    Backlog(String),

    #[error("session for {0} is closed")]
    Closed(String),
}

/// Non-owning reference to a live session.
#[derive(Debug)]
pub struct SessionHandle {
    username: String,
    peer: Option<SocketAddr>,
    outbox: mpsc::Sender<ServerFrame>,
    terminate: CancellationToken,
    // Written by the session's writer after everything queued, then the
    // transport closes.
    farewell: Arc<OnceLock<ServerFrame>>,
    delivery_timeout: Duration,
}

impl SessionHandle {
    pub fn new(
        username: impl Into<String>,
        peer: Option<SocketAddr>,
        outbox: mpsc::Sender<ServerFrame>,
        terminate: CancellationToken,
        farewell: Arc<OnceLock<ServerFrame>>,
        delivery_timeout: Duration,
    ) -> Self {
        Self {
            username: username.into(),
            peer,
            outbox,
            terminate,
            farewell,
            delivery_timeout,
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Queues a frame for the session's writer.
    ///
    /// Waits at most the delivery timeout for room in the outbox. A reader
    /// that falls that far behind is told to terminate.
    pub async fn deliver(&self, frame: ServerFrame) -> Result<(), DeliveryError> {
        match self.outbox.send_timeout(frame, self.delivery_timeout).await {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(_)) => {
                warn!(username = %self.username, "outbound backlog exceeded, disconnecting");
                self.terminate.cancel();
                Err(DeliveryError::Backlog(self.username.clone()))
            }
            Err(SendTimeoutError::Closed(_)) => Err(DeliveryError::Closed(self.username.clone())),
        }
    }

    /// Terminates the session with `notice` as the last frame its client
    /// receives. Only the first notice is kept.
    pub fn dismiss(&self, notice: ServerFrame) {
        if self.farewell.set(notice).is_err() {
            debug!(username = %self.username, "session already has a farewell notice");
        }
        self.terminate.cancel();
    }
}

#[derive(Debug, Default)]
pub struct Registry {
    sessions: Mutex<HashMap<String, Arc<SessionHandle>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts the session and queues `greeting` as its first frame, both
    /// under the lock. No broadcast can reach the session ahead of the
    /// greeting, and nobody can see the session before it is greeted.
    pub async fn add(
        &self,
        session: Arc<SessionHandle>,
        greeting: ServerFrame,
    ) -> Result<(), RegistryError> {
        let mut sessions = self.sessions.lock().await;
        if sessions.contains_key(session.username()) {
            return Err(RegistryError::DuplicateUser(session.username.clone()));
        }

        session
            .outbox
            .try_send(greeting)
            .map_err(|_| RegistryError::SessionClosed(session.username.clone()))?;
        sessions.insert(session.username.clone(), session);
        Ok(())
    }

    /// Removing a user that is not present is a no-op.
    pub async fn remove(&self, username: &str) -> Option<Arc<SessionHandle>> {
        self.sessions.lock().await.remove(username)
    }

    /// Removes the entry only if it still belongs to `session`; a newer
    /// session under the same name is left alone.
    pub async fn remove_session(&self, session: &SessionHandle) -> bool {
        let mut sessions = self.sessions.lock().await;
        match sessions.get(session.username()) {
            Some(current) if std::ptr::eq(Arc::as_ptr(current), session) => {
                sessions.remove(session.username());
                true
            }
            _ => false,
        }
    }

    pub async fn lookup(&self, username: &str) -> Result<Arc<SessionHandle>, RegistryError> {
        self.sessions
            .lock()
            .await
            .get(username)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(username.to_string()))
    }

    pub async fn contains(&self, username: &str) -> bool {
        self.sessions.lock().await.contains_key(username)
    }

    /// Sorted usernames at the moment of the call.
    pub async fn snapshot(&self) -> Vec<String> {
        let mut names: Vec<String> = self.sessions.lock().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.lock().await.is_empty()
    }

    async fn recipients(&self, exclude: Option<&str>) -> Vec<Arc<SessionHandle>> {
        self.sessions
            .lock()
            .await
            .values()
            .filter(|session| Some(session.username()) != exclude)
            .cloned()
            .collect()
    }

    /// Delivers `frame` to every session except `exclude`, concurrently.
    ///
    /// Every delivery runs to completion; a failed recipient is logged and
    /// does not affect the others. Returns how many deliveries succeeded.
    pub async fn broadcast(&self, frame: ServerFrame, exclude: Option<&str>) -> usize {
        let recipients = self.recipients(exclude).await;
        let deliveries = recipients.iter().map(|session| session.deliver(frame.clone()));

        let mut delivered = 0;
        for result in join_all(deliveries).await {
            match result {
                Ok(()) => delivered += 1,
                Err(err) => debug!(error = %err, "broadcast delivery failed"),
            }
        }
        delivered
    }
}
