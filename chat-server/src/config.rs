use std::{net::SocketAddr, path::PathBuf, time::Duration};

use crate::{cli::ServeArgs, codec::DEFAULT_MAX_FRAME_LENGTH};

/// Per-session resource bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionLimits {
    /// Largest inbound frame, and so the largest accumulation buffer.
    pub max_frame_length: usize,
    /// Frames that may wait in a session's outbox.
    pub outbox_capacity: usize,
    /// How long a delivery may wait for outbox space before the recipient
    /// is disconnected.
    pub delivery_timeout: Duration,
    /// How long teardown waits for queued frames to flush.
    pub close_grace: Duration,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
            outbox_capacity: 256,
            delivery_timeout: Duration::from_millis(1000),
            close_grace: Duration::from_millis(2000),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    pub accounts: PathBuf,
    pub limits: SessionLimits,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 5000)),
            accounts: PathBuf::from("accounts.json"),
            limits: SessionLimits::default(),
        }
    }
}

impl From<&ServeArgs> for ServerConfig {
    fn from(args: &ServeArgs) -> Self {
        Self {
            listen: args.listen,
            accounts: args.accounts.clone(),
            limits: SessionLimits {
                max_frame_length: args.max_frame_bytes,
                // A zero-capacity channel would panic; one slot is the floor.
                outbox_capacity: args.outbox_capacity.max(1),
                delivery_timeout: Duration::from_millis(args.delivery_timeout_ms),
                close_grace: Duration::from_millis(args.close_grace_ms),
            },
        }
    }
}
