use crate::config::ClientConfig;
use crate::error::{CallError, HandshakeError, SocketError};
use crate::handshake::client_handshake;
use crate::msgs::{ErrMsg, WireMsg};
use crate::packet::{frame_type, Frame};
use crate::route_head::{MsgKind, RouteHead};
use crate::socket::{wait_true, Socket, SocketOptions};
use anyhow::bail;
use async_trait::async_trait;
use dashmap::DashMap;
#[cfg(test)]
use mockall::automock;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{debug, info, trace, warn};

/// Application-side callbacks of a client. Frames consumed by an ask-id
/// callback never reach `on_message`.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClientDispatcher: Send + Sync + 'static {
    async fn on_message(&self, frame: Frame);
    async fn on_status(&self, connected: bool);
}

type RespCallback = Box<dyn FnOnce(Frame) + Send + Sync + 'static>;

/// Connects, authenticates and keeps the session alive. Any failure in
/// dial, handshake or either socket loop schedules another attempt after
/// the configured reconnect delay - forever, until `close` is called or a
/// hard handshake rejection disables reconnection.
pub struct Client {
    config: ClientConfig,
    dispatcher: Option<Arc<dyn ClientDispatcher>>,

    socket: RwLock<Option<Arc<Socket>>>,
    callbacks: DashMap<u32, RespCallback>,
    ask_idx: AtomicU32,

    /// Milliseconds between reconnect attempts; zero or negative disables.
    /// Flipped negative on a hard handshake failure so a rejecting server
    /// is not hammered with doomed re-auth attempts.
    reconnect_delay_ms: AtomicI64,
    reconnecting: AtomicBool,
    closed: AtomicBool,
}

impl Client {
    pub fn new(
        config: ClientConfig,
        dispatcher: Option<Arc<dyn ClientDispatcher>>,
    ) -> anyhow::Result<Arc<Client>> {
        config.validate()?;
        let reconnect_delay_ms = config
            .reconnect_delay
            .map(|d| d.as_millis() as i64)
            .unwrap_or(-1);

        Ok(Arc::new(Client {
            config,
            dispatcher,
            socket: RwLock::new(None),
            callbacks: DashMap::new(),
            ask_idx: AtomicU32::new(0),
            reconnect_delay_ms: AtomicI64::new(reconnect_delay_ms),
            reconnecting: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }))
    }

    /// One connection attempt. On failure the reconnect loop takes over if
    /// it is enabled; the first error is still surfaced to the caller.
    pub async fn connect(self: &Arc<Self>) -> anyhow::Result<()> {
        match self.try_connect().await {
            Ok(()) => Ok(()),
            Err(e) => {
                if self.reconnect_enabled() {
                    self.schedule_reconnect();
                }
                Err(e)
            }
        }
    }

    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        if let Some(socket) = self.socket.write().await.take() {
            socket.close();
        }
        self.callbacks.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn reconnect_enabled(&self) -> bool {
        self.reconnect_delay_ms.load(Ordering::SeqCst) > 0
    }

    pub async fn valid(&self) -> bool {
        match self.socket.read().await.as_ref() {
            Some(socket) => socket.valid(),
            None => false,
        }
    }

    pub async fn socket_id(&self) -> Option<String> {
        self.socket.read().await.as_ref().map(|s| s.id().to_string())
    }

    /// Fire-and-forget: no correlation, no reply expected.
    pub async fn send_async<Req: WireMsg>(&self, target: u32, req: &Req) -> anyhow::Result<()> {
        let socket = self.current_socket().await?;
        let head = RouteHead {
            target_uid: target,
            source_uid: 0,
            ask_id: 0,
            msg_id: Req::MSG_ID,
            msg_kind: MsgKind::Async,
        };
        let frame = Frame::new(frame_type::ROUTE)
            .with_head(head.to_bytes())
            .with_body(req.to_body());
        socket.send(frame).await?;
        Ok(())
    }

    /// A synchronous call over the asynchronous duplex channel: allocate an
    /// ask id, park a callback under it, send the request, and wait for the
    /// reply or the deadline. On timeout the callback is replaced with a
    /// no-op so a late reply is swallowed instead of reaching a freed
    /// waiter.
    pub async fn send_request<Req: WireMsg, Resp: WireMsg>(
        &self,
        target: u32,
        req: &Req,
        deadline: Duration,
    ) -> anyhow::Result<Resp> {
        let socket = self.current_socket().await?;
        let ask_id = self.next_ask_id();
        let head = RouteHead {
            target_uid: target,
            source_uid: 0,
            ask_id,
            msg_id: Req::MSG_ID,
            msg_kind: MsgKind::Request,
        };
        let frame = Frame::new(frame_type::ROUTE)
            .with_head(head.to_bytes())
            .with_body(req.to_body());

        let (tx, rx) = oneshot::channel();
        self.callbacks.insert(
            ask_id,
            Box::new(move |reply| {
                let _ = tx.send(reply);
            }),
        );

        if let Err(e) = socket.send(frame).await {
            self.callbacks.remove(&ask_id);
            return Err(e.into());
        }

        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(reply)) => decode_reply::<Resp>(&reply),
            Ok(Err(_)) => bail!("connection closed while awaiting reply"),
            Err(_) => {
                self.callbacks.insert(ask_id, Box::new(|_| {}));
                Err(CallError::Timeout.into())
            }
        }
    }

    async fn current_socket(&self) -> Result<Arc<Socket>, SocketError> {
        self.socket
            .read()
            .await
            .clone()
            .ok_or(SocketError::Disconnected)
    }

    fn next_ask_id(&self) -> u32 {
        let mut id = self.ask_idx.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        if id == 0 {
            id = self.ask_idx.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        }
        id
    }

    async fn try_connect(self: &Arc<Self>) -> anyhow::Result<()> {
        if let Some(old) = self.socket.write().await.take() {
            old.close();
        }

        let timeout = self.config.effective_timeout();
        let mut stream =
            tokio::time::timeout(timeout, TcpStream::connect(self.config.remote_addr)).await??;

        let socket_id = match client_handshake(&mut stream, &self.config.token, timeout).await {
            Ok(id) => id,
            Err(e) => {
                if matches!(e.downcast_ref::<HandshakeError>(), Some(HandshakeError::Rejected(_))) {
                    warn!("hard handshake failure, disabling reconnection: {}", e);
                    self.reconnect_delay_ms.store(-1, Ordering::SeqCst);
                }
                return Err(e);
            }
        };

        let (recv_tx, recv_rx) = mpsc::channel(self.config.recv_queue_size);
        let socket = Socket::spawn(
            stream,
            SocketOptions {
                id: socket_id,
                user: Default::default(),
                timeout,
                send_queue_size: self.config.send_queue_size,
            },
            recv_tx,
        )?;
        socket.spawn_heartbeat();

        *self.socket.write().await = Some(socket.clone());
        info!(id = %socket.id(), "connected to {}", self.config.remote_addr);

        if let Some(dispatcher) = &self.dispatcher {
            dispatcher.on_status(true).await;
        }

        tokio::spawn(recv_loop(self.clone(), socket, recv_rx));
        Ok(())
    }

    async fn on_frame(&self, frame: Frame) {
        let t = frame.frame_type();
        if frame_type::is_control(t) {
            trace!("swallowing control frame {:#04x}", t);
            return;
        }
        if t == frame_type::ROUTE {
            if let Ok(head) = RouteHead::from_frame(&frame) {
                if head.ask_id != 0 {
                    if let Some((_, callback)) = self.callbacks.remove(&head.ask_id) {
                        callback(frame);
                        return;
                    }
                }
            }
        }
        if let Some(dispatcher) = &self.dispatcher {
            dispatcher.on_message(frame).await;
        }
    }

    fn schedule_reconnect(self: &Arc<Self>) {
        if self
            .reconnecting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        let client = self.clone();
        tokio::spawn(async move {
            loop {
                let delay_ms = client.reconnect_delay_ms.load(Ordering::SeqCst);
                if delay_ms <= 0 || client.is_closed() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(delay_ms as u64)).await;
                if client.is_closed() || client.valid().await {
                    break;
                }
                info!("reconnecting to {}", client.config.remote_addr);
                match client.try_connect().await {
                    Ok(()) => break,
                    Err(e) => warn!("reconnect attempt failed: {}", e),
                }
            }
            client.reconnecting.store(false, Ordering::SeqCst);
        });
    }
}

async fn recv_loop(client: Arc<Client>, socket: Arc<Socket>, mut recv_rx: mpsc::Receiver<Frame>) {
    let mut closed_rx = socket.subscribe_closed();
    loop {
        tokio::select! {
            _ = wait_true(&mut closed_rx) => break,
            maybe = recv_rx.recv() => {
                let Some(frame) = maybe else { break };
                client.on_frame(frame).await;
            }
        }
    }

    socket.close();
    debug!(id = %socket.id(), reason = ?socket.close_reason(), "session down");

    // waiters of in-flight calls fail fast instead of running out their
    // deadlines against a dead connection
    client.callbacks.clear();

    if let Some(dispatcher) = &client.dispatcher {
        dispatcher.on_status(false).await;
    }
    if client.reconnect_enabled() && !client.is_closed() {
        client.schedule_reconnect();
    }
}

fn decode_reply<Resp: WireMsg>(frame: &Frame) -> anyhow::Result<Resp> {
    let head = RouteHead::from_frame(frame)?;
    match head.msg_kind {
        MsgKind::RespErr => {
            let err = ErrMsg::from_body(frame.body())?;
            Err(CallError::Remote { code: err.code, detail: err.detail }.into())
        }
        MsgKind::Response => {
            if head.msg_id != Resp::MSG_ID {
                return Err(CallError::MsgIdMismatch {
                    expected: Resp::MSG_ID,
                    got: head.msg_id,
                }
                .into());
            }
            Resp::from_body(frame.body())
        }
        kind => Err(CallError::UnexpectedKind(kind).into()),
    }
}
