//! One client connection, from handshake to close.
//!
//! A session owns its transport. The read half stays with the session task;
//! the write half belongs to a writer task that drains the session's outbox,
//! so every frame bound for this client is written by exactly one task.

use std::{
    net::SocketAddr,
    sync::{Arc, OnceLock},
};

use futures::{SinkExt, StreamExt};
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf},
    sync::mpsc,
    task::JoinHandle,
    time::timeout,
};
use tokio_util::{
    codec::{FramedRead, FramedWrite},
    sync::CancellationToken,
};
use tracing::{debug, error, info, warn};

use crate::{
    codec::ServerCodec,
    config::SessionLimits,
    error::{AuthError, CodecError},
    message::{ClientFrame, ServerFrame},
    registry::{RegistryError, SessionHandle},
    router::{Flow, Router},
    store::{StoreError, call_blocking},
};

pub const MAX_USERNAME_CHARS: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Authenticating,
    Active,
    Closing,
    Closed,
}

impl SessionState {
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Connecting, Authenticating)
                | (Authenticating, Active)
                | (Authenticating, Closed)
                | (Active, Closing)
                | (Closing, Closed)
        )
    }
}

enum Handshake {
    Admitted(Arc<SessionHandle>),
    Rejected(AuthError),
    Abandoned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseReason {
    ClientExit,
    Eof,
    TransportError,
    Terminated,
}

pub struct Session<T> {
    peer: Option<SocketAddr>,
    state: SessionState,
    frames: FramedRead<ReadHalf<T>, ServerCodec>,
    outbox: mpsc::Sender<ServerFrame>,
    writer: JoinHandle<()>,
    // Tells the writer to flush what is queued and shut the transport down.
    closing: CancellationToken,
    // Cancelled by a kick, a server stop, a backlog overflow or a failed write.
    terminate: CancellationToken,
    farewell: Arc<OnceLock<ServerFrame>>,
    router: Arc<Router>,
    limits: SessionLimits,
}

impl<T> Session<T>
where
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    /// Wraps a freshly accepted transport. `shutdown` is the server-wide
    /// signal; cancelling it terminates this session too.
    pub fn new(
        stream: T,
        peer: Option<SocketAddr>,
        router: Arc<Router>,
        limits: SessionLimits,
        shutdown: &CancellationToken,
    ) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        let frames = FramedRead::new(reader, ServerCodec::with_max_length(limits.max_frame_length));
        let sink = FramedWrite::new(writer, ServerCodec::with_max_length(limits.max_frame_length));
        let (outbox, inbox) = mpsc::channel(limits.outbox_capacity.max(1));

        let terminate = shutdown.child_token();
        let closing = CancellationToken::new();
        let farewell = Arc::new(OnceLock::new());
        let writer = tokio::spawn(run_writer(
            sink,
            inbox,
            Arc::clone(&farewell),
            closing.clone(),
            terminate.clone(),
        ));

        Self {
            peer,
            state: SessionState::Connecting,
            frames,
            outbox,
            writer,
            closing,
            terminate,
            farewell,
            router,
            limits,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Drives the session until it is closed.
    pub async fn run(mut self) {
        self.advance(SessionState::Authenticating);

        match self.handshake().await {
            Handshake::Admitted(handle) => {
                self.advance(SessionState::Active);
                info!(peer = ?self.peer, username = handle.username(), "client joined");
                self.router.announce_join(handle.username()).await;

                let reason = self.serve(&handle).await;
                self.advance(SessionState::Closing);
                self.leave(handle, reason).await;
            }
            Handshake::Rejected(rejection) => {
                info!(peer = ?self.peer, reason = %rejection, "handshake rejected");
                if self
                    .outbox
                    .send(ServerFrame::server(rejection.to_string()))
                    .await
                    .is_err()
                {
                    debug!(peer = ?self.peer, "writer gone before rejection was sent");
                }
            }
            Handshake::Abandoned => {
                debug!(peer = ?self.peer, "connection ended before authentication");
            }
        }

        self.close().await;
    }

    fn advance(&mut self, next: SessionState) {
        if !self.state.can_transition_to(next) {
            warn!(peer = ?self.peer, from = ?self.state, to = ?next, "unexpected session transition");
        }
        debug!(peer = ?self.peer, from = ?self.state, to = ?next, "session transition");
        self.state = next;
    }

    /// Reads the next well-formed frame, skipping malformed ones. An error
    /// carries the reason the session must end.
    async fn next_frame(&mut self) -> Result<ClientFrame, CloseReason> {
        loop {
            let next = tokio::select! {
                biased;
                _ = self.terminate.cancelled() => return Err(CloseReason::Terminated),
                next = self.frames.next() => next,
            };

            match next {
                Some(Ok(Ok(frame))) => return Ok(frame),
                Some(Ok(Err(err))) => {
                    warn!(peer = ?self.peer, error = %err, "dropping malformed frame");
                }
                Some(Err(err)) => {
                    warn!(peer = ?self.peer, error = %err, "closing connection after read failure");
                    return Err(CloseReason::TransportError);
                }
                None => return Err(CloseReason::Eof),
            }
        }
    }

    async fn handshake(&mut self) -> Handshake {
        let frame = match self.next_frame().await {
            Ok(frame) => frame,
            Err(_) => return Handshake::Abandoned,
        };

        match self.admit(frame).await {
            Ok(handle) => Handshake::Admitted(handle),
            Err(rejection) => Handshake::Rejected(rejection),
        }
    }

    async fn admit(&self, frame: ClientFrame) -> Result<Arc<SessionHandle>, AuthError> {
        let registering = match frame.command.trim().to_lowercase().as_str() {
            "login" => false,
            "register" => true,
            _ => return Err(AuthError::NotAuthenticated),
        };

        let username = frame.body.trim().to_string();
        let password = frame.password.unwrap_or_default();
        if username.is_empty() || password.is_empty() {
            return Err(AuthError::MissingCredentials);
        }
        if username.chars().count() > MAX_USERNAME_CHARS || username.contains(char::is_whitespace) {
            return Err(AuthError::InvalidUsername);
        }

        // Credentials are checked before anything reveals who is online;
        // Registry::add is the only duplicate check.
        let greeting = if registering {
            self.register(&username, password).await?;
            format!("Registration successful. Welcome to the chat, {username}!")
        } else {
            self.login(&username, password).await?;
            format!("Login successful. Welcome back, {username}!")
        };

        let handle = Arc::new(SessionHandle::new(
            username,
            self.peer,
            self.outbox.clone(),
            self.terminate.clone(),
            Arc::clone(&self.farewell),
            self.limits.delivery_timeout,
        ));
        self.router
            .registry()
            .add(Arc::clone(&handle), ServerFrame::server(greeting))
            .await
            .map_err(|err| match err {
                RegistryError::DuplicateUser(_) => AuthError::AlreadyConnected,
                other => {
                    debug!(peer = ?self.peer, error = %other, "registration in registry failed");
                    AuthError::Unavailable
                }
            })?;
        Ok(handle)
    }

    async fn register(&self, username: &str, password: String) -> Result<(), AuthError> {
        let name = username.to_string();
        let created = call_blocking(self.router.store(), move |store| {
            store.register(&name, &password)
        })
        .await
        .map_err(store_unavailable)?;

        if created {
            info!(username, "account registered");
            Ok(())
        } else {
            Err(AuthError::UsernameTaken)
        }
    }

    async fn login(&self, username: &str, password: String) -> Result<(), AuthError> {
        let name = username.to_string();
        call_blocking(self.router.store(), move |store| {
            if !store.exists(&name)? {
                return Ok(Err(AuthError::UnknownUser));
            }
            if !store.authenticate(&name, &password)? {
                return Ok(Err(AuthError::WrongPassword));
            }
            Ok(Ok(()))
        })
        .await
        .map_err(store_unavailable)?
    }

    async fn serve(&mut self, handle: &SessionHandle) -> CloseReason {
        loop {
            let frame = match self.next_frame().await {
                Ok(frame) => frame,
                Err(reason) => return reason,
            };
            if self.router.dispatch(handle, frame).await == Flow::Exit {
                return CloseReason::ClientExit;
            }
        }
    }

    async fn leave(&mut self, handle: Arc<SessionHandle>, reason: CloseReason) {
        let username = handle.username().to_string();
        // A kick has already taken the entry; the departure is still announced.
        self.router.registry().remove_session(&handle).await;
        drop(handle);

        info!(peer = ?self.peer, %username, ?reason, "client left");
        self.router.announce_leave(&username).await;
    }

    async fn close(&mut self) {
        self.closing.cancel();
        if timeout(self.limits.close_grace, &mut self.writer).await.is_err() {
            warn!(peer = ?self.peer, "writer did not flush in time, dropping connection");
            self.writer.abort();
        }
        self.advance(SessionState::Closed);
    }
}

fn store_unavailable(err: StoreError) -> AuthError {
    error!(error = %err, "credential store failed during handshake");
    AuthError::Unavailable
}

async fn run_writer<W>(
    mut sink: FramedWrite<WriteHalf<W>, ServerCodec>,
    mut inbox: mpsc::Receiver<ServerFrame>,
    farewell: Arc<OnceLock<ServerFrame>>,
    closing: CancellationToken,
    terminate: CancellationToken,
) where
    W: AsyncWrite,
{
    if let Err(err) = pump_frames(&mut sink, &mut inbox, &farewell, &closing).await {
        debug!(error = %err, "failed to write to client");
        terminate.cancel();
    }
}

async fn pump_frames<W>(
    sink: &mut FramedWrite<WriteHalf<W>, ServerCodec>,
    inbox: &mut mpsc::Receiver<ServerFrame>,
    farewell: &OnceLock<ServerFrame>,
    closing: &CancellationToken,
) -> Result<(), CodecError>
where
    W: AsyncWrite,
{
    loop {
        let frame = tokio::select! {
            biased;
            frame = inbox.recv() => frame,
            _ = closing.cancelled() => None,
        };
        match frame {
            Some(frame) => sink.send(frame).await?,
            None => break,
        }
    }

    // Refuse new frames, then flush whatever was already queued.
    inbox.close();
    while let Some(frame) = inbox.recv().await {
        sink.send(frame).await?;
    }
    if let Some(frame) = farewell.get() {
        sink.send(frame.clone()).await?;
    }
    sink.close().await
}
