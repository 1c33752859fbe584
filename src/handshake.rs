//! The control-frame exchange that establishes a socket's identity before
//! its loops start. The server is reactive, the client initiates:
//!
//! ```ascii
//! client                          server
//!   | ------- HandShake ----------> |
//!   | <--- ActionRequire("auth") -- |      (only with a verifier configured)
//!   | ------ DoAction(token) -----> |
//!   | <- AckResult("ok", sock id) - |      or AckResult("fail", reason)
//! ```
//!
//! Every read and write is bounded by the configured timeout; any frame of
//! an unexpected type closes the connection with no further reply.

use crate::auth::{Auth, UserInfo};
use crate::error::HandshakeError;
use crate::packet::{frame_type, Frame};
use anyhow::Context;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::debug;

const ACTION_AUTH: &str = "auth";

async fn read_frame(conn: &mut TcpStream, timeout: Duration) -> anyhow::Result<Frame> {
    tokio::time::timeout(timeout, Frame::read_from(conn))
        .await
        .context("handshake read deadline expired")?
}

async fn write_frame(conn: &mut TcpStream, frame: &Frame, timeout: Duration) -> anyhow::Result<()> {
    tokio::time::timeout(timeout, frame.write_to(conn))
        .await
        .context("handshake write deadline expired")?
}

/// Server side. Returns the verified identity; with no verifier configured
/// the auth step is skipped and the anonymous identity is admitted. The
/// caller allocates the socket id up front so it can go out in the ack.
pub async fn serve_handshake(
    conn: &mut TcpStream,
    auth: Option<&Arc<dyn Auth>>,
    socket_id: &str,
    timeout: Duration,
) -> anyhow::Result<UserInfo> {
    let frame = read_frame(conn, timeout).await?;
    if frame.frame_type() != frame_type::HAND_SHAKE || !frame.body().is_empty() {
        return Err(HandshakeError::UnexpectedFrame(frame.frame_type()).into());
    }

    let mut user = UserInfo::default();
    if let Some(auth) = auth {
        debug!("requiring auth action");
        let require = Frame::new(frame_type::ACTION_REQUIRE).with_head(ACTION_AUTH.into());
        write_frame(conn, &require, timeout).await?;

        let frame = read_frame(conn, timeout).await?;
        if frame.frame_type() != frame_type::DO_ACTION {
            return Err(HandshakeError::UnexpectedFrame(frame.frame_type()).into());
        }

        match auth.token_auth(frame.body()).await {
            Ok(verified) => user = verified,
            Err(e) => {
                let reason = e.to_string();
                let fail = Frame::new(frame_type::ACK_RESULT)
                    .with_head(b"fail".to_vec())
                    .with_body(reason.clone().into_bytes());
                // best effort - the connection is going away either way
                let _ = write_frame(conn, &fail, timeout).await;
                return Err(HandshakeError::Rejected(reason).into());
            }
        }
    }

    let ack = Frame::new(frame_type::ACK_RESULT)
        .with_head(b"ok".to_vec())
        .with_body(socket_id.as_bytes().to_vec());
    write_frame(conn, &ack, timeout).await?;

    debug!(uid = user.uid, socket_id, "handshake complete");
    Ok(user)
}

/// Client side. Answers whatever actions the server requires from a small
/// action table and returns the socket id assigned in the final ack.
pub async fn client_handshake(
    conn: &mut TcpStream,
    token: &[u8],
    timeout: Duration,
) -> anyhow::Result<String> {
    let mut actions: FxHashMap<&str, &[u8]> = FxHashMap::default();
    actions.insert(ACTION_AUTH, token);

    write_frame(conn, &Frame::new(frame_type::HAND_SHAKE), timeout).await?;

    loop {
        let frame = read_frame(conn, timeout).await?;
        match frame.frame_type() {
            frame_type::ACTION_REQUIRE => {
                let name = String::from_utf8_lossy(frame.head()).to_string();
                let Some(arg) = actions.get(name.as_str()) else {
                    return Err(HandshakeError::UnknownAction(name).into());
                };
                let reply = Frame::new(frame_type::DO_ACTION)
                    .with_head(name.clone().into_bytes())
                    .with_body(arg.to_vec());
                write_frame(conn, &reply, timeout).await?;
            }
            frame_type::ACK_RESULT => {
                if frame.head() != b"ok" {
                    let reason = String::from_utf8_lossy(frame.body()).to_string();
                    return Err(HandshakeError::Rejected(reason).into());
                }
                if frame.body().is_empty() {
                    return Err(HandshakeError::EmptyAck.into());
                }
                return Ok(String::from_utf8_lossy(frame.body()).to_string());
            }
            other => return Err(HandshakeError::UnexpectedFrame(other).into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticTokenAuth;
    use crate::test_util::tcp_pair;

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn auth() -> Arc<dyn Auth> {
        Arc::new(StaticTokenAuth::new().with_user("token-a", UserInfo::new(111, "alice", "admin")))
    }

    #[tokio::test]
    async fn test_success_with_auth() {
        let (mut client, mut server) = tcp_pair().await;
        let auth = auth();

        let server_side =
            tokio::spawn(
                async move { serve_handshake(&mut server, Some(&auth), "tcp_7", TIMEOUT).await },
            );
        let socket_id = client_handshake(&mut client, b"token-a", TIMEOUT).await.unwrap();

        assert_eq!(socket_id, "tcp_7");
        let user = server_side.await.unwrap().unwrap();
        assert_eq!(user, UserInfo::new(111, "alice", "admin"));
    }

    #[tokio::test]
    async fn test_no_verifier_admits_anonymous() {
        let (mut client, mut server) = tcp_pair().await;

        let server_side =
            tokio::spawn(async move { serve_handshake(&mut server, None, "tcp_1", TIMEOUT).await });
        let socket_id = client_handshake(&mut client, b"ignored", TIMEOUT).await.unwrap();

        assert_eq!(socket_id, "tcp_1");
        let user = server_side.await.unwrap().unwrap();
        assert!(user.is_anonymous());
    }

    #[tokio::test]
    async fn test_bad_token_is_rejected_with_reason() {
        let (mut client, mut server) = tcp_pair().await;
        let auth = auth();

        let server_side =
            tokio::spawn(
                async move { serve_handshake(&mut server, Some(&auth), "tcp_1", TIMEOUT).await },
            );
        let err = client_handshake(&mut client, b"wrong", TIMEOUT).await.unwrap_err();

        match err.downcast_ref::<HandshakeError>() {
            Some(HandshakeError::Rejected(reason)) => assert_eq!(reason, "invalid token"),
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(server_side.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_empty_token_against_verifier_fails() {
        let (mut client, mut server) = tcp_pair().await;
        let auth = auth();

        let server_side =
            tokio::spawn(
                async move { serve_handshake(&mut server, Some(&auth), "tcp_1", TIMEOUT).await },
            );
        let err = client_handshake(&mut client, b"", TIMEOUT).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<HandshakeError>(),
            Some(HandshakeError::Rejected(_))
        ));
        assert!(server_side.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_wrong_opening_frame_closes_without_reply() {
        let (mut client, mut server) = tcp_pair().await;

        let server_side =
            tokio::spawn(async move { serve_handshake(&mut server, None, "tcp_1", TIMEOUT).await });

        // a route frame instead of HandShake
        Frame::new(frame_type::ROUTE)
            .write_to(&mut client)
            .await
            .unwrap();

        let err = server_side.await.unwrap().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<HandshakeError>(),
            Some(HandshakeError::UnexpectedFrame(t)) if *t == frame_type::ROUTE
        ));
    }

    #[tokio::test]
    async fn test_handshake_with_nonempty_body_is_a_violation() {
        let (mut client, mut server) = tcp_pair().await;

        let server_side =
            tokio::spawn(async move { serve_handshake(&mut server, None, "tcp_1", TIMEOUT).await });

        Frame::new(frame_type::HAND_SHAKE)
            .with_body(b"junk".to_vec())
            .write_to(&mut client)
            .await
            .unwrap();

        assert!(server_side.await.unwrap().is_err());
    }
}
