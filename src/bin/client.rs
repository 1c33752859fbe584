use async_trait::async_trait;
use clap::Parser;
use msgroute::client::{Client, ClientDispatcher};
use msgroute::config::ClientConfig;
use msgroute::msgs::{EchoRequest, EchoResponse};
use msgroute::packet::Frame;
use msgroute::route_head::RouteHead;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, Level};

#[derive(Parser)]
#[command(about = "demo client: authenticate, echo, optionally message a peer")]
struct Args {
    /// Server address
    #[clap(default_value = "127.0.0.1:8090")]
    server: String,

    /// Auth token answered during the handshake
    #[clap(long, default_value = "")]
    token: String,

    /// Peer uid to send the message to; 0 calls the router's echo handler
    #[clap(long, default_value_t = 0)]
    target: u32,

    #[clap(long, default_value = "hello")]
    message: String,

    /// Reconnect delay in seconds; 0 disables reconnection
    #[clap(long, default_value_t = 0)]
    reconnect: u64,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,
}

struct LogDispatcher;

#[async_trait]
impl ClientDispatcher for LogDispatcher {
    async fn on_message(&self, frame: Frame) {
        match RouteHead::from_frame(&frame) {
            Ok(head) => info!(
                source = head.source_uid,
                msg_id = head.msg_id,
                body_len = frame.body().len(),
                "incoming route frame"
            ),
            Err(e) => info!("incoming frame with unreadable head: {}", e),
        }
    }

    async fn on_status(&self, connected: bool) {
        info!(connected, "session status");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    tracing_subscriber::fmt().with_max_level(level).try_init().ok();

    let mut config = ClientConfig::new(args.server.parse()?).with_token(args.token.clone());
    if args.reconnect > 0 {
        config = config.with_reconnect_delay(Duration::from_secs(args.reconnect));
    }

    let client = Client::new(config, Some(Arc::new(LogDispatcher)))?;
    client.connect().await?;
    info!(socket_id = ?client.socket_id().await, "connected");

    if args.target == 0 {
        let resp: EchoResponse = client
            .send_request(
                0,
                &EchoRequest { msg: args.message.clone() },
                Duration::from_secs(10),
            )
            .await?;
        info!(echoed = %resp.msg, "echo round trip complete");
    } else {
        client.send_async(args.target, &EchoRequest { msg: args.message.clone() }).await?;
        info!(target = args.target, "message sent, waiting for traffic; ctrl-c to quit");
        tokio::signal::ctrl_c().await?;
    }

    client.close().await;
    Ok(())
}
