use crate::auth::Auth;
use crate::config::ServerConfig;
use crate::handshake::serve_handshake;
use crate::packet::{frame_type, Frame};
use crate::socket::{wait_true, Socket, SocketOptions};
use anyhow::bail;
use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use rustc_hash::FxHashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, instrument, warn};

/// Where the server hands frames and session transitions. The router
/// implements this; tests plug in mocks.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SocketDispatcher: Send + Sync + 'static {
    /// One non-control frame, in per-socket arrival order.
    async fn on_message(&self, socket: &Arc<Socket>, frame: Frame);

    /// Session went up (after registration) or down (after removal). On the
    /// way down the socket carries its close reason.
    async fn on_status(&self, socket: &Arc<Socket>, connected: bool);
}

pub type AcceptFilter = Arc<dyn Fn(SocketAddr) -> bool + Send + Sync>;

pub struct ServerOptions {
    pub config: ServerConfig,
    pub dispatcher: Arc<dyn SocketDispatcher>,
    /// Token verifier; `None` admits every connection anonymously.
    pub auth: Option<Arc<dyn Auth>>,
    /// Admission predicate consulted before the handshake.
    pub accept_filter: Option<AcceptFilter>,
}

/// Delay sequence for transient accept errors: 5ms doubling up to 1s,
/// reset after any successful accept.
struct AcceptBackoff {
    delay: Option<Duration>,
}

impl AcceptBackoff {
    const INITIAL: Duration = Duration::from_millis(5);
    const MAX: Duration = Duration::from_secs(1);

    fn new() -> AcceptBackoff {
        AcceptBackoff { delay: None }
    }

    fn next_delay(&mut self) -> Duration {
        let next = match self.delay {
            None => Self::INITIAL,
            Some(d) => (d * 2).min(Self::MAX),
        };
        self.delay = Some(next);
        next
    }

    fn reset(&mut self) {
        self.delay = None;
    }
}

pub struct Server {
    config: ServerConfig,
    dispatcher: Arc<dyn SocketDispatcher>,
    auth: Option<Arc<dyn Auth>>,
    accept_filter: Option<AcceptFilter>,

    local_addr: SocketAddr,
    listener: Mutex<Option<TcpListener>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,

    /// Every live socket keyed by socket id (which is distinct from the
    /// router's uid registry - unauthenticated and anonymous sessions live
    /// here too).
    sockets: RwLock<FxHashMap<String, Arc<Socket>>>,

    die_tx: watch::Sender<bool>,
    socket_idx: AtomicU64,
}

impl Server {
    pub async fn new(opts: ServerOptions) -> anyhow::Result<Server> {
        opts.config.validate()?;
        let listener = TcpListener::bind(opts.config.listen_addr).await?;
        let local_addr = listener.local_addr()?;
        info!("listening on {}", local_addr);

        let (die_tx, _) = watch::channel(false);
        Ok(Server {
            config: opts.config,
            dispatcher: opts.dispatcher,
            auth: opts.auth,
            accept_filter: opts.accept_filter,
            local_addr,
            listener: Mutex::new(Some(listener)),
            accept_task: Mutex::new(None),
            sockets: RwLock::new(FxHashMap::default()),
            die_tx,
            socket_idx: AtomicU64::new(0),
        })
    }

    pub fn address(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn start(self: &Arc<Self>) -> anyhow::Result<()> {
        let listener = self
            .listener
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let Some(listener) = listener else {
            bail!("server already started");
        };

        let server = self.clone();
        let handle = tokio::spawn(accept_loop(server, listener));
        *self.accept_task.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        Ok(())
    }

    /// Closes the die signal and the listener, then waits for every
    /// connection worker to finish.
    pub async fn stop(&self) {
        self.die_tx.send_replace(true);
        let handle = self
            .accept_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        info!("server stopped");
    }

    pub async fn get_socket(&self, id: &str) -> Option<Arc<Socket>> {
        self.sockets.read().await.get(id).cloned()
    }

    pub async fn socket_count(&self) -> usize {
        self.sockets.read().await.len()
    }

    fn next_socket_id(&self) -> String {
        let mut idx = self.socket_idx.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        if idx == 0 {
            idx = self.socket_idx.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        }
        format!("tcp_{}", idx)
    }

    async fn store_socket(&self, socket: &Arc<Socket>) {
        self.sockets
            .write()
            .await
            .insert(socket.id().to_string(), socket.clone());
    }

    async fn remove_socket(&self, socket: &Arc<Socket>) {
        self.sockets.write().await.remove(socket.id());
    }

    /// Control frames are answered in place; everything else goes to the
    /// dispatcher.
    async fn handle_frame(&self, socket: &Arc<Socket>, frame: Frame) {
        match frame.frame_type() {
            frame_type::HEARTBEAT | frame_type::ECHO => {
                if let Err(e) = socket.send(frame).await {
                    debug!(id = %socket.id(), "echo reply failed: {}", e);
                }
            }
            t if frame_type::is_control(t) => {
                debug!(id = %socket.id(), "dropping unexpected control frame {:#04x}", t);
            }
            _ => self.dispatcher.on_message(socket, frame).await,
        }
    }
}

async fn accept_loop(server: Arc<Server>, listener: TcpListener) {
    let mut die_rx = server.die_tx.subscribe();
    let mut workers = JoinSet::new();
    let mut backoff = AcceptBackoff::new();

    loop {
        tokio::select! {
            _ = wait_true(&mut die_rx) => break,
            res = listener.accept() => match res {
                Ok((stream, addr)) => {
                    backoff.reset();
                    let server = server.clone();
                    workers.spawn(handle_connection(server, stream, addr));
                }
                Err(e) => {
                    let delay = backoff.next_delay();
                    warn!("accept error: {} - backing off {:?}", e, delay);
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    drop(listener);
    while workers.join_next().await.is_some() {}
}

#[instrument(name = "connection", skip_all, fields(addr = %addr))]
async fn handle_connection(server: Arc<Server>, mut stream: TcpStream, addr: SocketAddr) {
    if let Some(filter) = &server.accept_filter {
        if !filter(addr) {
            debug!("connection rejected by accept filter");
            return;
        }
    }

    let timeout = server.config.effective_timeout();
    let socket_id = server.next_socket_id();
    let user = match serve_handshake(&mut stream, server.auth.as_ref(), &socket_id, timeout).await {
        Ok(user) => user,
        Err(e) => {
            debug!("handshake failed: {}", e);
            return;
        }
    };

    let (recv_tx, mut recv_rx) = mpsc::channel(server.config.recv_queue_size);
    let socket = match Socket::spawn(
        stream,
        SocketOptions {
            id: socket_id,
            user,
            timeout,
            send_queue_size: server.config.send_queue_size,
        },
        recv_tx,
    ) {
        Ok(socket) => socket,
        Err(e) => {
            warn!("socket setup failed: {}", e);
            return;
        }
    };

    server.store_socket(&socket).await;
    server.dispatcher.on_status(&socket, true).await;

    let mut die_rx = server.die_tx.subscribe();
    let mut closed_rx = socket.subscribe_closed();
    loop {
        tokio::select! {
            _ = wait_true(&mut die_rx) => break,
            _ = wait_true(&mut closed_rx) => break,
            maybe = recv_rx.recv() => {
                let Some(frame) = maybe else { break };
                server.handle_frame(&socket, frame).await;
            }
        }
    }

    socket.close();
    server.remove_socket(&socket).await;
    server.dispatcher.on_status(&socket, false).await;
    debug!(id = %socket.id(), reason = ?socket.close_reason(), "connection finished");
}
