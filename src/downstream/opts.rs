use std::{future::Future, io, net::SocketAddr, str::FromStr, sync::Arc};

use dynosaur::dynosaur;
use http::Uri;
use n0_error::e;
use tokio::net::{TcpListener, TcpSocket};

use crate::{
    error::ListenerError,
    message::{Request, Response},
    parse::Authority,
    pool::{BlockPool, DEFAULT_MAX_CACHED_INSTANCES, InstancePool},
    upstream::{CredentialProvider, DynCredentialProvider, NoCredentials},
};

/// Number of times a request is resent after a 407 challenge.
pub const DEFAULT_RETRY_COUNT: usize = 2;

/// Listen backlog used when a listener does not set one.
pub const DEFAULT_BACKLOG: u32 = 8;

/// Configuration of a [`ProxyServer`](super::ProxyServer).
#[derive(derive_more::Debug, Clone)]
pub struct ProxyOpts {
    pub(crate) retry_count: usize,
    #[debug("DynResolveProxy")]
    pub(crate) resolver: Arc<DynResolveProxy<'static>>,
    #[debug("DynCredentialProvider")]
    pub(crate) credentials: Arc<DynCredentialProvider<'static>>,
    pub(crate) pools: MessagePools,
}

impl Default for ProxyOpts {
    fn default() -> Self {
        Self::new(Direct)
    }
}

impl ProxyOpts {
    /// Creates options that route requests with `resolver` and send no
    /// credentials.
    pub fn new(resolver: impl ResolveProxy + 'static) -> Self {
        Self {
            retry_count: DEFAULT_RETRY_COUNT,
            resolver: DynResolveProxy::new_arc(resolver),
            credentials: DynCredentialProvider::new_arc(NoCredentials),
            pools: MessagePools::default(),
        }
    }

    /// Sets the provider of credentials for the actual proxy.
    pub fn credentials(mut self, provider: impl CredentialProvider + 'static) -> Self {
        self.credentials = DynCredentialProvider::new_arc(provider);
        self
    }

    /// Sets how often a request is resent after a 407 challenge.
    ///
    /// With 0 the first challenge is passed on to the client and request
    /// bodies are never retained.
    pub fn retry_count(mut self, count: usize) -> Self {
        self.retry_count = count;
        self
    }

    /// Sets the pools messages are allocated from.
    pub fn pools(mut self, pools: MessagePools) -> Self {
        self.pools = pools;
        self
    }
}

/// What a request asks the proxy to reach.
#[derive(Debug, Clone, Copy)]
pub enum ProxyTarget<'a> {
    /// Target of an absolute-form request.
    Uri(&'a Uri),
    /// Host of any other request, including CONNECT.
    Authority(&'a Authority),
}

#[dynosaur(pub(crate) DynResolveProxy = dyn(box) ResolveProxy)]
/// Chooses the actual proxy for a request.
pub trait ResolveProxy: Send + Sync {
    /// Returns the candidate actual proxies in preference order, or `None` to
    /// connect to the target host directly.
    ///
    /// An empty list is treated like `None`.
    fn resolve<'a>(
        &'a self,
        target: ProxyTarget<'a>,
    ) -> impl Future<Output = Option<Vec<Authority>>> + Send + 'a;
}

/// Connects every request directly to its target host.
#[derive(Debug, Default, Clone)]
pub struct Direct;

impl ResolveProxy for Direct {
    async fn resolve<'a>(&'a self, _target: ProxyTarget<'a>) -> Option<Vec<Authority>> {
        None
    }
}

/// Sends every request to the same actual proxies.
#[derive(Debug, Clone)]
pub struct StaticProxy(pub Vec<Authority>);

impl ResolveProxy for StaticProxy {
    async fn resolve<'a>(&'a self, _target: ProxyTarget<'a>) -> Option<Vec<Authority>> {
        Some(self.0.clone())
    }
}

/// Pools shared by all connections of a server.
#[derive(Debug, Clone)]
pub struct MessagePools {
    pub(crate) blocks: BlockPool,
    pub(crate) requests: InstancePool<Request>,
    pub(crate) responses: InstancePool<Response>,
}

impl Default for MessagePools {
    fn default() -> Self {
        Self::new(BlockPool::default(), DEFAULT_MAX_CACHED_INSTANCES)
    }
}

impl MessagePools {
    /// Creates pools keeping up to `max_cached` idle requests and responses.
    pub fn new(blocks: BlockPool, max_cached: usize) -> Self {
        Self {
            requests: InstancePool::new(blocks.clone(), max_cached),
            responses: InstancePool::new(blocks.clone(), max_cached),
            blocks,
        }
    }

    pub fn blocks(&self) -> &BlockPool {
        &self.blocks
    }
}

/// Address and backlog of a listening socket.
///
/// Parsed from `address:port[,backlog=N]`. IPv6 addresses go in square
/// brackets, as in `[::1]:8888,backlog=16`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerOpts {
    pub addr: SocketAddr,
    pub backlog: u32,
}

impl ListenerOpts {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            backlog: DEFAULT_BACKLOG,
        }
    }

    /// Parses several listeners separated by `;`.
    pub fn parse_many(s: &str) -> Result<Vec<Self>, ListenerError> {
        s.split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(Self::from_str)
            .collect()
    }

    /// Binds a listening socket.
    pub fn bind(&self) -> io::Result<TcpListener> {
        let socket = match self.addr {
            SocketAddr::V4(_) => TcpSocket::new_v4()?,
            SocketAddr::V6(_) => TcpSocket::new_v6()?,
        };
        socket.set_reuseaddr(true)?;
        socket.bind(self.addr)?;
        socket.listen(self.backlog)
    }
}

impl FromStr for ListenerOpts {
    type Err = ListenerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split(',');
        let endpoint = parts.next().unwrap_or_default().trim();
        let addr = endpoint.parse().map_err(|_| {
            e!(ListenerError::InvalidEndpoint {
                input: endpoint.to_string()
            })
        })?;
        let mut opts = Self::new(addr);
        for param in parts {
            let invalid = || {
                e!(ListenerError::InvalidParameter {
                    param: param.trim().to_string()
                })
            };
            let (name, value) = param.split_once('=').ok_or_else(invalid)?;
            if !name.trim().eq_ignore_ascii_case("backlog") {
                return Err(invalid());
            }
            let value = value.trim();
            if !value.is_empty() {
                opts.backlog = value.parse().map_err(|_| invalid())?;
            }
        }
        Ok(opts)
    }
}
