use thiserror::Error;

/// Violations of the wire format. Any of these means the byte stream can no
/// longer be trusted to be correctly framed, so the connection is closed
/// without a reply.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("packet body size {0} exceeds the 8388607 byte limit")]
    BodyTooLarge(usize),

    #[error("route head has {0} bytes, expected 17")]
    BadRouteHead(usize),
}

/// Socket-level send failures. These stay per-socket and never terminate
/// anything beyond the call that observed them.
#[derive(Debug, Error)]
pub enum SocketError {
    #[error("socket disconnected")]
    Disconnected,

    #[error("send queue full, gave up after the socket timeout")]
    SendTimeout,
}

/// Handshake failures, both sides. `Rejected` is the hard case: the peer
/// explicitly refused us, so retrying with the same credentials is pointless.
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("handshake rejected by peer: {0}")]
    Rejected(String),

    #[error("unexpected frame type {0:#04x} during handshake")]
    UnexpectedFrame(u8),

    #[error("peer required unknown action {0:?}")]
    UnknownAction(String),

    #[error("ack result carried no socket id")]
    EmptyAck,
}

/// Failures of a synchronous call as surfaced to the caller.
#[derive(Debug, Error)]
pub enum CallError {
    #[error("remote error {code}: {detail}")]
    Remote { code: i32, detail: String },

    #[error("reply msg_id {got} does not match expected {expected}")]
    MsgIdMismatch { expected: u32, got: u32 },

    #[error("unexpected reply kind {0:?}")]
    UnexpectedKind(crate::route_head::MsgKind),

    #[error("call timed out")]
    Timeout,
}
