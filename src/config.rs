use anyhow::bail;
use std::net::SocketAddr;
use std::time::Duration;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
pub const MIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeouts below the minimum are raised to the default rather than
/// rejected, matching the behavior clients of older deployments rely on.
pub(crate) fn effective_timeout(configured: Duration) -> Duration {
    if configured < MIN_TIMEOUT {
        DEFAULT_TIMEOUT
    } else {
        configured
    }
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,

    /// Per-operation read/write deadline, also the handshake step deadline.
    /// The heartbeat cadence is derived from it (period = timeout / 3).
    pub timeout: Duration,

    /// Bound of each socket's send queue. A sender blocks up to the socket
    /// timeout when the queue is full, then fails.
    pub send_queue_size: usize,

    /// Bound of the per-connection receive channel between the read loop
    /// and the connection worker.
    pub recv_queue_size: usize,
}

impl ServerConfig {
    pub fn new(listen_addr: SocketAddr) -> ServerConfig {
        ServerConfig {
            listen_addr,
            timeout: DEFAULT_TIMEOUT,
            send_queue_size: 100,
            recv_queue_size: 100,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.send_queue_size == 0 {
            bail!("send queue size must be positive");
        }
        if self.recv_queue_size == 0 {
            bail!("recv queue size must be positive");
        }
        Ok(())
    }

    pub fn effective_timeout(&self) -> Duration {
        effective_timeout(self.timeout)
    }
}

#[derive(Clone, Debug)]
pub struct ClientConfig {
    pub remote_addr: SocketAddr,

    /// Opaque token bytes answered to the server's "auth" action.
    pub token: Vec<u8>,

    pub timeout: Duration,

    /// Delay between reconnection attempts. `None` disables reconnection; a
    /// hard handshake rejection disables it at runtime as well.
    pub reconnect_delay: Option<Duration>,

    pub send_queue_size: usize,
    pub recv_queue_size: usize,
}

impl ClientConfig {
    pub fn new(remote_addr: SocketAddr) -> ClientConfig {
        ClientConfig {
            remote_addr,
            token: Vec::new(),
            timeout: DEFAULT_TIMEOUT,
            reconnect_delay: None,
            send_queue_size: 100,
            recv_queue_size: 100,
        }
    }

    pub fn with_token(mut self, token: impl Into<Vec<u8>>) -> ClientConfig {
        self.token = token.into();
        self
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> ClientConfig {
        self.reconnect_delay = Some(delay);
        self
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.send_queue_size == 0 {
            bail!("send queue size must be positive");
        }
        if self.recv_queue_size == 0 {
            bail!("recv queue size must be positive");
        }
        Ok(())
    }

    pub fn effective_timeout(&self) -> Duration {
        effective_timeout(self.timeout)
    }
}
