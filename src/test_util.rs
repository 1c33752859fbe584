//! Shared helpers for the in-crate tests.

use crate::client::ClientDispatcher;
use crate::packet::Frame;
use async_trait::async_trait;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};

/// A connected loopback TCP pair: (client end, server end).
pub async fn tcp_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (client, accepted) = tokio::join!(TcpStream::connect(addr), async {
        listener.accept().await.unwrap().0
    });
    (client.unwrap(), accepted)
}

/// Client dispatcher that parks every uncorrelated frame on a channel for
/// the test to inspect.
pub struct CapturingClientDispatcher {
    tx: mpsc::UnboundedSender<Frame>,
    rx: Mutex<mpsc::UnboundedReceiver<Frame>>,
}

impl CapturingClientDispatcher {
    pub fn new() -> CapturingClientDispatcher {
        let (tx, rx) = mpsc::unbounded_channel();
        CapturingClientDispatcher { tx, rx: Mutex::new(rx) }
    }

    pub async fn next_frame(&self, deadline: Duration) -> Frame {
        let mut rx = self.rx.lock().await;
        tokio::time::timeout(deadline, rx.recv())
            .await
            .expect("no frame arrived before the deadline")
            .expect("capture channel closed")
    }

    pub async fn is_empty(&self) -> bool {
        self.rx.lock().await.is_empty()
    }
}

#[async_trait]
impl ClientDispatcher for CapturingClientDispatcher {
    async fn on_message(&self, frame: Frame) {
        let _ = self.tx.send(frame);
    }

    async fn on_status(&self, _connected: bool) {}
}
