use std::sync::Arc;

use n0_error::{Result, StdResultExt};
use tokio::{net::TcpListener, task::JoinSet};
use tokio_util::future::FutureExt;
use tracing::{debug, info};

pub use self::opts::{
    DEFAULT_BACKLOG, DEFAULT_RETRY_COUNT, Direct, ListenerOpts, MessagePools, ProxyOpts,
    ProxyTarget, ResolveProxy, StaticProxy,
};
use crate::connection::Connections;

pub(crate) mod opts;

/// Proxy that accepts client connections on TCP listeners.
///
/// Each accepted connection is served in its own task. Requests are relayed
/// to the actual proxy chosen by the configured [`ResolveProxy`], answering
/// its 407 challenges with credentials from the configured
/// [`CredentialProvider`](crate::CredentialProvider). CONNECT requests turn
/// the connection into a tunnel once the upstream accepted them.
#[derive(Debug, Clone)]
pub struct ProxyServer {
    opts: Arc<ProxyOpts>,
    connections: Connections,
}

impl ProxyServer {
    pub fn new(opts: ProxyOpts) -> Self {
        Self {
            opts: Arc::new(opts),
            connections: Connections::default(),
        }
    }

    pub fn opts(&self) -> &ProxyOpts {
        &self.opts
    }

    /// Number of client connections currently served.
    pub fn active_connections(&self) -> usize {
        self.connections.active()
    }

    /// Accepts connections from `listener` until [`ProxyServer::shutdown`]
    /// is called or accepting fails.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        loop {
            let (stream, client_addr) = match listener
                .accept()
                .with_cancellation_token(self.connections.shutdown_token())
                .await
            {
                None => return Ok(()),
                Some(res) => res?,
            };
            self.connections
                .start(stream, client_addr, self.opts.clone());
        }
    }

    /// Binds all `listeners` and serves them until shutdown.
    pub async fn serve_all(&self, listeners: &[ListenerOpts]) -> Result<()> {
        let mut tasks = JoinSet::new();
        for opts in listeners {
            debug!(addr=%opts.addr, "binding listener");
            let listener = opts.bind().std_context("failed to bind listener")?;
            info!(addr=%listener.local_addr()?, backlog=opts.backlog, "listening");
            let this = self.clone();
            tasks.spawn(async move { this.serve(listener).await });
        }
        while let Some(res) = tasks.join_next().await {
            res.std_context("listener task failed")??;
        }
        Ok(())
    }

    /// Stops all connections.
    ///
    /// Tunnels and pending exchanges are cut off.
    pub fn stop_all(&self) {
        debug!("stopping all connections");
        self.connections.stop_all();
    }

    /// Stops accepting, closes all connections and waits briefly for their
    /// tasks to end.
    pub async fn shutdown(&self) {
        self.connections.shutdown().await;
    }
}
