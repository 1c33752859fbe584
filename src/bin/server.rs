use clap::Parser;
use msgroute::auth::{Auth, FakeAuth, StaticTokenAuth, UserInfo};
use msgroute::config::ServerConfig;
use msgroute::permit::LocalPermit;
use msgroute::router::{builtin_call_table, Router};
use msgroute::server::{Server, ServerOptions};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, Level};

#[derive(Parser)]
#[command(about = "message router server")]
struct Args {
    /// Address to listen on
    #[clap(default_value = "127.0.0.1:8090")]
    listen: String,

    /// Read/write timeout in seconds
    #[clap(long, default_value_t = 30)]
    timeout: u64,

    /// Static token in the form token:uid:name:role; repeatable. Without
    /// any, every token is admitted with a sequential uid.
    #[clap(long)]
    token: Vec<String>,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,

    #[clap(long, default_value_t = false)]
    very_verbose: bool,
}

fn parse_token(spec: &str) -> anyhow::Result<(String, UserInfo)> {
    let parts: Vec<&str> = spec.split(':').collect();
    if parts.len() != 4 {
        anyhow::bail!("token spec must be token:uid:name:role, got {:?}", spec);
    }
    let uid: u32 = parts[1].parse()?;
    Ok((parts[0].to_string(), UserInfo::new(uid, parts[2], parts[3])))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match (args.verbose, args.very_verbose) {
        (_, true) => Level::TRACE,
        (true, _) => Level::DEBUG,
        (false, false) => Level::INFO,
    };
    tracing_subscriber::fmt().with_max_level(level).try_init().ok();

    let auth: Arc<dyn Auth> = if args.token.is_empty() {
        info!("no static tokens configured, admitting every token");
        Arc::new(FakeAuth::default())
    } else {
        let mut static_auth = StaticTokenAuth::new();
        for spec in &args.token {
            let (token, user) = parse_token(spec)?;
            static_auth = static_auth.with_user(token, user);
        }
        Arc::new(static_auth)
    };

    let (event_tx, mut event_rx) = mpsc::channel(64);
    tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            info!(?event, "user stat change");
        }
    });

    let router = Arc::new(
        Router::new(builtin_call_table())
            .with_permit(Arc::new(LocalPermit))
            .with_event_queue(event_tx),
    );

    let mut config = ServerConfig::new(args.listen.parse()?);
    config.timeout = Duration::from_secs(args.timeout);

    let server = Arc::new(
        Server::new(ServerOptions {
            config,
            dispatcher: router,
            auth: Some(auth),
            accept_filter: None,
        })
        .await?,
    );
    server.start()?;
    info!("serving on {}", server.address());

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    server.stop().await;
    Ok(())
}
