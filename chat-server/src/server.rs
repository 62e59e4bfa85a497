use std::{future::Future, net::SocketAddr, sync::Arc};

use anyhow::Result;
use tokio::{
    net::{TcpListener, TcpStream},
    select,
    task::JoinSet,
    time,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    config::SessionLimits,
    operator::Operator,
    registry::Registry,
    router::Router,
    session::Session,
    store::SharedStore,
};

/// Accepts connections and runs one [`Session`] task per client.
pub struct Server {
    listener: TcpListener,
    router: Arc<Router>,
    limits: SessionLimits,
    shutdown: CancellationToken,
}

impl Server {
    pub fn new(listener: TcpListener, store: SharedStore, limits: SessionLimits) -> Self {
        let registry = Arc::new(Registry::new());
        Self {
            listener,
            router: Arc::new(Router::new(registry, store)),
            limits,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn registry(&self) -> Arc<Registry> {
        Arc::clone(self.router.registry())
    }

    /// A console handle bound to this server's registry and shutdown signal.
    pub fn operator(&self) -> Operator {
        Operator::new(Arc::clone(&self.router), self.shutdown.clone())
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Serves until `shutdown` resolves or the server's own token is
    /// cancelled, then terminates every session and waits for them to close.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Server {
            listener,
            router,
            limits,
            shutdown: token,
        } = self;
        tokio::pin!(shutdown);

        let mut sessions = JoinSet::new();

        loop {
            select! {
                _ = &mut shutdown => break,
                _ = token.cancelled() => break,
                accept_result = listener.accept() => {
                    handle_accept_result(accept_result, &mut sessions, &router, limits, &token);
                }
                Some(joined) = sessions.join_next(), if !sessions.is_empty() => {
                    if let Err(err) = joined {
                        warn!(error = ?err, "session task failed");
                    }
                }
            }
        }

        let online = router.registry().len().await;
        info!(sessions = sessions.len(), online, "server shutting down");
        token.cancel();
        drop(listener);

        // Each session already bounds its own flush by close_grace; the
        // extra second covers the leave bookkeeping around it.
        let drain = async { while sessions.join_next().await.is_some() {} };
        if time::timeout(limits.close_grace + time::Duration::from_secs(1), drain)
            .await
            .is_err()
        {
            warn!(remaining = sessions.len(), "aborting sessions that did not close in time");
            sessions.shutdown().await;
        }

        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

fn handle_accept_result(
    result: std::io::Result<(TcpStream, SocketAddr)>,
    sessions: &mut JoinSet<()>,
    router: &Arc<Router>,
    limits: SessionLimits,
    shutdown: &CancellationToken,
) {
    match result {
        Ok((stream, peer)) => {
            debug!(peer = %peer, "accepted connection");
            if let Err(err) = stream.set_nodelay(true) {
                debug!(peer = %peer, error = ?err, "failed to set TCP_NODELAY");
            }
            let session = Session::new(stream, Some(peer), Arc::clone(router), limits, shutdown);
            sessions.spawn(session.run());
        }
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}
