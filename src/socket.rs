use crate::auth::UserInfo;
use crate::error::SocketError;
use crate::packet::{frame_type, Frame};
use dashmap::DashMap;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace};

#[derive(Clone, Copy, Debug, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum SocketStatus {
    /// Constructed, loops not yet running. Embedders that build the socket
    /// around their own handshake park it in `Handshake` until identity is
    /// established; the built-in server and client complete the handshake on
    /// the raw stream first, so their sockets pass through `Connecting` only
    /// briefly.
    Connecting = 0,
    Handshake = 1,
    Connected = 2,
    Disconnected = 3,
}

pub struct SocketOptions {
    pub id: String,
    pub user: UserInfo,
    pub timeout: Duration,
    pub send_queue_size: usize,
}

/// One TCP connection. The accept (or connect) path owns the lifecycle; the
/// read and write loops hold shared references but only ever signal closure,
/// never control it. The read loop is the single serializing point for
/// arrival order, the write loop for egress order.
pub struct Socket {
    id: String,
    user: UserInfo,
    login_at: SystemTime,
    remote_addr: SocketAddr,
    local_addr: SocketAddr,
    timeout: Duration,

    send_tx: mpsc::Sender<Frame>,
    closed_tx: watch::Sender<bool>,
    status: AtomicU8,

    last_sent_at: AtomicI64,
    last_recvd_at: AtomicI64,
    err_count: AtomicU32,
    close_reason: Mutex<Option<String>>,

    /// Deployment-specific tags; the router itself only reads what it wrote.
    meta: DashMap<String, String>,
}

impl Socket {
    /// Splits the connection and spawns the read and write loops. Incoming
    /// frames are pushed to `recv_tx` in arrival order; the caller consumes
    /// that channel for the socket's lifetime.
    pub fn spawn(
        conn: TcpStream,
        opts: SocketOptions,
        recv_tx: mpsc::Sender<Frame>,
    ) -> anyhow::Result<Arc<Socket>> {
        let remote_addr = conn.peer_addr()?;
        let local_addr = conn.local_addr()?;
        let (read_half, write_half) = conn.into_split();

        let (send_tx, send_rx) = mpsc::channel(opts.send_queue_size);
        let (closed_tx, _) = watch::channel(false);
        let now = unix_now();

        let socket = Arc::new(Socket {
            id: opts.id,
            user: opts.user,
            login_at: SystemTime::now(),
            remote_addr,
            local_addr,
            timeout: opts.timeout,
            send_tx,
            closed_tx,
            status: AtomicU8::new(SocketStatus::Connecting.into()),
            last_sent_at: AtomicI64::new(now),
            last_recvd_at: AtomicI64::new(now),
            err_count: AtomicU32::new(0),
            close_reason: Mutex::new(None),
            meta: DashMap::new(),
        });

        let read_closed = socket.subscribe_closed();
        let write_closed = socket.subscribe_closed();
        tokio::spawn(read_loop(socket.clone(), read_half, recv_tx, read_closed));
        tokio::spawn(write_loop(socket.clone(), write_half, send_rx, write_closed));

        // a loop may already have failed and closed the socket; never
        // resurrect a Disconnected one
        let _ = socket.status.compare_exchange(
            SocketStatus::Connecting.into(),
            SocketStatus::Connected.into(),
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        Ok(socket)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn user(&self) -> &UserInfo {
        &self.user
    }

    pub fn login_at(&self) -> SystemTime {
        self.login_at
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn status(&self) -> SocketStatus {
        SocketStatus::try_from(self.status.load(Ordering::SeqCst))
            .unwrap_or(SocketStatus::Disconnected)
    }

    pub fn valid(&self) -> bool {
        self.status() == SocketStatus::Connected
    }

    pub fn meta(&self) -> &DashMap<String, String> {
        &self.meta
    }

    pub fn err_count(&self) -> u32 {
        self.err_count.load(Ordering::Relaxed)
    }

    pub fn bump_err(&self) -> u32 {
        self.err_count.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn last_sent_at(&self) -> i64 {
        self.last_sent_at.load(Ordering::Relaxed)
    }

    pub fn last_recvd_at(&self) -> i64 {
        self.last_recvd_at.load(Ordering::Relaxed)
    }

    /// Enqueues a frame on the bounded send queue. Blocks up to the socket
    /// timeout when the queue is full, then fails; this coalesces
    /// backpressure with the slowest consumer and is uniform across server
    /// and client ends.
    pub async fn send(&self, frame: Frame) -> Result<(), SocketError> {
        if !self.valid() {
            return Err(SocketError::Disconnected);
        }
        match tokio::time::timeout(self.timeout, self.send_tx.send(frame)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(SocketError::Disconnected),
            Err(_) => Err(SocketError::SendTimeout),
        }
    }

    /// Idempotent: the first caller transitions the status and fires the
    /// closed signal; everyone else is a no-op. Safe against concurrent
    /// callers and against either loop being mid-frame.
    pub fn close(&self) {
        let prev = self.status.swap(SocketStatus::Disconnected.into(), Ordering::SeqCst);
        if prev == u8::from(SocketStatus::Disconnected) {
            return;
        }
        trace!(id = %self.id, "closing socket");
        self.closed_tx.send_replace(true);
    }

    pub fn subscribe_closed(&self) -> watch::Receiver<bool> {
        self.closed_tx.subscribe()
    }

    /// The first recorded reason wins; later loop errors on an already
    /// dying socket are noise.
    pub(crate) fn record_close_reason(&self, reason: String) {
        let mut guard = self.close_reason.lock().unwrap_or_else(|e| e.into_inner());
        if guard.is_none() {
            *guard = Some(reason);
        }
    }

    pub fn close_reason(&self) -> Option<String> {
        self.close_reason.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn mark_sent(&self) {
        self.last_sent_at.store(unix_now(), Ordering::Relaxed);
    }

    fn mark_recvd(&self) {
        self.last_recvd_at.store(unix_now(), Ordering::Relaxed);
    }

    /// Keeps an otherwise idle session from tripping the peer's read
    /// deadline: every timeout/3 the task checks whether anything went out
    /// in the last timeout/2 seconds and enqueues a heartbeat if not.
    pub fn spawn_heartbeat(self: &Arc<Self>) {
        let socket = self.clone();
        let mut closed_rx = self.subscribe_closed();
        tokio::spawn(async move {
            let period = socket.timeout / 3;
            let threshold = (socket.timeout / 2).as_secs() as i64;
            let start = tokio::time::Instant::now() + period;
            let mut tick = tokio::time::interval_at(start, period);
            loop {
                tokio::select! {
                    _ = wait_true(&mut closed_rx) => break,
                    _ = tick.tick() => {
                        if unix_now() - socket.last_sent_at() >= threshold {
                            if socket.send(Frame::new(frame_type::HEARTBEAT)).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            }
        });
    }
}

impl std::fmt::Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Socket{{id:{}, uid:{}, remote:{}, status:{:?}}}",
            self.id,
            self.user.uid,
            self.remote_addr,
            self.status()
        )
    }
}

/// Waits until the receiver's value becomes `true` (or the sender drops).
/// Equivalent to `rx.wait_for(|v| *v).await`, but doesn't hold the
/// non-`Send` `watch::Ref` across the await points of other `select!`
/// branches.
pub(crate) async fn wait_true(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

async fn read_loop(
    socket: Arc<Socket>,
    mut reader: OwnedReadHalf,
    recv_tx: mpsc::Sender<Frame>,
    mut closed_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            biased;
            _ = wait_true(&mut closed_rx) => break,
            res = tokio::time::timeout(socket.timeout, Frame::read_from(&mut reader)) => {
                match res {
                    Ok(Ok(frame)) => {
                        socket.mark_recvd();
                        if recv_tx.send(frame).await.is_err() {
                            break;
                        }
                    }
                    Ok(Err(e)) => {
                        debug!(id = %socket.id, "read error: {}", e);
                        socket.record_close_reason(format!("read: {}", e));
                        break;
                    }
                    Err(_) => {
                        debug!(id = %socket.id, "read deadline expired");
                        socket.record_close_reason("read deadline expired".to_string());
                        break;
                    }
                }
            }
        }
    }
    socket.close();
}

async fn write_loop(
    socket: Arc<Socket>,
    mut writer: OwnedWriteHalf,
    mut send_rx: mpsc::Receiver<Frame>,
    mut closed_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            biased;
            _ = wait_true(&mut closed_rx) => break,
            maybe = send_rx.recv() => {
                let Some(frame) = maybe else { break };
                match tokio::time::timeout(socket.timeout, frame.write_to(&mut writer)).await {
                    Ok(Ok(())) => socket.mark_sent(),
                    Ok(Err(e)) => {
                        debug!(id = %socket.id, "write error: {}", e);
                        socket.record_close_reason(format!("write: {}", e));
                        break;
                    }
                    Err(_) => {
                        debug!(id = %socket.id, "write deadline expired");
                        socket.record_close_reason("write deadline expired".to_string());
                        break;
                    }
                }
            }
        }
    }
    socket.close();
}
