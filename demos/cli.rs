use clap::Parser;
use n0_error::Result;
use proxy_auth_relay::{
    Authority, BasicCredential, DEFAULT_RETRY_COUNT, Direct, ListenerOpts, ProxyOpts, ProxyServer,
    StaticCredential, StaticProxy,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Forward proxy that authenticates to an actual proxy on behalf of its
/// clients.
#[derive(Parser)]
struct Cli {
    /// Listeners as `address:port[,backlog=N]`, separated by `;`.
    #[clap(short, long, default_value = "127.0.0.1:8888")]
    listen: String,
    /// Actual proxy (`host:port`). Requests go directly to their targets if
    /// unset.
    #[clap(short, long)]
    proxy: Option<String>,
    /// User name for the actual proxy.
    #[clap(short, long, requires = "proxy")]
    user: Option<String>,
    /// Password for the actual proxy.
    #[clap(long, requires = "user")]
    password: Option<String>,
    /// How often a request is resent after a 407 challenge.
    #[clap(short, long, default_value_t = DEFAULT_RETRY_COUNT)]
    retry: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    let cli = Cli::parse();

    let listeners = ListenerOpts::parse_many(&cli.listen)?;
    let mut opts = match &cli.proxy {
        Some(proxy) => {
            let proxy = Authority::from_authority_str(proxy)?;
            info!(%proxy, "relaying to actual proxy");
            ProxyOpts::new(StaticProxy(vec![proxy]))
        }
        None => {
            info!("connecting directly");
            ProxyOpts::new(Direct)
        }
    }
    .retry_count(cli.retry);
    if let Some(user) = cli.user {
        let password = cli.password.unwrap_or_default();
        opts = opts.credentials(StaticCredential(BasicCredential::new(user, &password)));
    }

    let server = ProxyServer::new(opts);
    tokio::select! {
        res = server.serve_all(&listeners) => res?,
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
        }
    }
    server.shutdown().await;
    Ok(())
}
