//! Client connections and the registry that runs them.

use std::{
    io,
    net::SocketAddr,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use http::StatusCode;
use n0_error::e;
use tokio::net::TcpStream;
use tokio_util::{future::FutureExt, sync::CancellationToken, task::TaskTracker};
use tracing::{Instrument, debug, error, error_span, info, warn};

use crate::{
    buffer::Modification,
    communication::{ClientIo, CommunicationOwner, communicate},
    downstream::{ProxyOpts, ProxyTarget, ResolveProxy},
    error::ProxyError,
    message::{Request, Response},
    parse::Authority,
    upstream::{BasicCredential, CredentialProvider, CredentialRequest, Upstream, basic_realm},
    util::{Direction, Prebuffered},
};

const GRACEFUL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// Credential obtained for one actual proxy.
#[derive(Debug)]
struct CachedCredential {
    endpoint: Authority,
    credential: Option<BasicCredential>,
}

/// Per-connection state and policy.
#[derive(Debug)]
pub(crate) struct Session {
    opts: Arc<ProxyOpts>,
    cache: Option<CachedCredential>,
    using_proxy: bool,
    /// Actual proxy the current upstream connection goes to.
    endpoint: Option<Authority>,
}

impl Session {
    pub(crate) fn new(opts: Arc<ProxyOpts>) -> Self {
        Self {
            opts,
            cache: None,
            using_proxy: false,
            endpoint: None,
        }
    }

    /// Serves the client on `stream` until either side is done.
    pub(crate) async fn run(mut self, stream: TcpStream) -> Result<(), ProxyError> {
        stream.set_nodelay(true).ok();
        let (recv, send) = stream.into_split();
        let mut client = ClientIo {
            recv: Prebuffered::new(recv),
            send,
        };
        let mut upstream = Upstream::default();
        let opts = self.opts.clone();
        communicate(&mut self, &mut client, &mut upstream, &opts.pools).await
    }

    /// Looks up the credential for `endpoint`, asking the provider on first
    /// use.
    async fn cached_credential(&mut self, endpoint: &Authority) -> Option<&BasicCredential> {
        if self
            .cache
            .as_ref()
            .is_none_or(|cache| &cache.endpoint != endpoint)
        {
            let credential = self
                .opts
                .credentials
                .credential(CredentialRequest {
                    endpoint,
                    realm: None,
                    first_request: true,
                    previous: None,
                })
                .await;
            self.cache = Some(CachedCredential {
                endpoint: endpoint.clone(),
                credential,
            });
        }
        self.cache.as_ref()?.credential.as_ref()
    }
}

impl CommunicationOwner for Session {
    async fn before_send<'a>(
        &'a mut self,
        upstream: &'a mut Upstream,
        request: &'a Request,
        repeat: usize,
    ) -> Result<Vec<Modification>, ProxyError> {
        if repeat == 0 {
            let host = request.host().ok_or_else(|| e!(ProxyError::MissingHost))?;
            let target = match request.target_uri() {
                Some(uri) => ProxyTarget::Uri(uri),
                None => ProxyTarget::Authority(host),
            };
            let (candidates, using_proxy) = match self.opts.resolver.resolve(target).await {
                Some(proxies) if !proxies.is_empty() => (proxies, true),
                _ => (vec![host.clone()], false),
            };
            self.using_proxy = using_proxy;
            upstream.ensure_connect(candidates).await?;
        } else if !upstream.is_connected() {
            upstream.reconnect().await?;
        }
        self.endpoint = if self.using_proxy {
            upstream.endpoint().cloned()
        } else {
            None
        };
        let Some(endpoint) = self.endpoint.clone() else {
            return Ok(Vec::new());
        };

        let client_span = request.proxy_authorization_span();
        if repeat == 0 && !client_span.is_empty() {
            // the client authenticates itself
            return Ok(Vec::new());
        }
        let Some(credential) = self.cached_credential(&endpoint).await else {
            return Ok(Vec::new());
        };
        let span = if client_span.is_empty() {
            request.end_of_header_fields()
        } else {
            client_span
        };
        Ok(vec![Modification::replace(span, credential.field_line())])
    }

    fn using_proxy(&self) -> bool {
        self.using_proxy
    }

    fn retry_limit(&self) -> usize {
        self.opts.retry_count
    }

    async fn review<'a>(&'a mut self, _request: &'a Request, response: &'a Response) -> bool {
        if !self.using_proxy || response.status() != StatusCode::PROXY_AUTHENTICATION_REQUIRED {
            return false;
        }
        let Some(endpoint) = self.endpoint.clone() else {
            return false;
        };
        // Nothing cached yet if the client sent its own credential.
        let previous = self
            .cache
            .take()
            .filter(|cache| cache.endpoint == endpoint)
            .and_then(|cache| cache.credential);
        let realm = response.proxy_authenticate().and_then(basic_realm);
        let fresh = self
            .opts
            .credentials
            .credential(CredentialRequest {
                endpoint: &endpoint,
                realm,
                first_request: false,
                previous: previous.as_ref(),
            })
            .await;
        let retrying = fresh.is_some();
        if let Some(credential) = &fresh {
            debug!(%endpoint, user=credential.user(), "got new credential");
        }
        self.cache = Some(CachedCredential {
            endpoint,
            credential: fresh.or(previous),
        });
        retrying
    }

    fn on_round_trip(&self, request: &Request, response: &Response, retrying: bool) {
        let heading = if retrying { "retrying" } else { "respond" };
        let method = request.method();
        let status = response.status();
        let host = request.host().map(ToString::to_string).unwrap_or_default();
        if status.as_u16() < 400 {
            info!(%method, %status, %host, "{heading}");
        } else if status == StatusCode::PROXY_AUTHENTICATION_REQUIRED {
            warn!(%method, %status, %host, "{heading}");
        } else {
            error!(%method, %status, %host, "{heading}");
        }
    }

    async fn settle_upstream<'a>(
        &'a mut self,
        upstream: &'a mut Upstream,
        request: &'a Request,
        response: &'a Response,
        retrying: bool,
    ) -> Result<(), ProxyError> {
        if response.keep_alive() || (request.is_connect() && response.status().is_success()) {
            return Ok(());
        }
        upstream.disconnect();
        if retrying {
            upstream.reconnect().await?;
        }
        Ok(())
    }

    fn on_error(&self, request: Option<&Request>, error: &ProxyError) -> Option<StatusCode> {
        let status = error.should_reply();
        match request {
            Some(request) => {
                debug!(method=%request.method(), ?status, "request failed: {error:#}")
            }
            None => debug!(?status, "reading request failed: {error:#}"),
        }
        status
    }

    fn on_tunnel_started(&self, request: &Request) {
        let host = request.host().map(ToString::to_string).unwrap_or_default();
        debug!(%host, using_proxy = self.using_proxy, "tunnel started");
    }

    fn on_tunnel_closed(&self, direction: Direction, result: &io::Result<u64>) {
        match result {
            Ok(len) => debug!(%direction, len, "tunnel direction closed"),
            Err(err) => debug!(%direction, "tunnel direction failed: {err:#}"),
        }
    }
}

/// Registry of running connections.
///
/// Each connection occupies a slot from activation until its task ends.
/// Slots of finished connections are reused.
#[derive(Debug, Clone, Default)]
pub(crate) struct Connections {
    slots: Arc<Mutex<Slots>>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

#[derive(Debug, Default)]
struct Slots {
    active: Vec<Option<CancellationToken>>,
    free: Vec<usize>,
}

impl Slots {
    fn activate(&mut self, token: CancellationToken) -> usize {
        match self.free.pop() {
            Some(slot) => {
                self.active[slot] = Some(token);
                slot
            }
            None => {
                self.active.push(Some(token));
                self.active.len() - 1
            }
        }
    }

    fn complete(&mut self, slot: usize) {
        if self.active.get_mut(slot).and_then(Option::take).is_some() {
            self.free.push(slot);
        }
    }
}

impl Connections {
    /// Starts serving `stream` in a new task and returns its slot.
    pub(crate) fn start(
        &self,
        stream: TcpStream,
        client_addr: SocketAddr,
        opts: Arc<ProxyOpts>,
    ) -> usize {
        let token = self.shutdown.child_token();
        let slot = self.lock().activate(token.clone());
        let slots = self.slots.clone();
        self.tasks.spawn(
            async move {
                debug!(%client_addr, "accepted connection");
                match token
                    .run_until_cancelled_owned(Session::new(opts).run(stream))
                    .await
                {
                    None => debug!("connection stopped"),
                    Some(Ok(())) => debug!("connection closed"),
                    Some(Err(err)) => warn!("failed to handle connection: {err:#}"),
                }
                lock(&slots).complete(slot);
            }
            .instrument(error_span!("conn", id = slot)),
        );
        slot
    }

    /// Stops the connection in `slot`, closing both of its sockets.
    ///
    /// Returns `false` if the slot is not active.
    pub(crate) fn stop(&self, slot: usize) -> bool {
        match self.lock().active.get(slot) {
            Some(Some(token)) => {
                token.cancel();
                true
            }
            _ => false,
        }
    }

    pub(crate) fn stop_all(&self) {
        for token in self.lock().active.iter().flatten() {
            token.cancel();
        }
    }

    /// Number of active connections.
    pub(crate) fn active(&self) -> usize {
        let slots = self.lock();
        slots.active.len() - slots.free.len()
    }

    /// Token cancelled when the registry shuts down.
    pub(crate) fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Stops all connections and waits for their tasks to end.
    pub(crate) async fn shutdown(&self) {
        self.shutdown.cancel();
        self.tasks.close();
        debug!("shutting down ({} pending tasks)", self.tasks.len());
        match self.tasks.wait().timeout(GRACEFUL_SHUTDOWN_TIMEOUT).await {
            Ok(_) => debug!("all connections closed cleanly"),
            Err(_) => debug!(
                remaining = self.tasks.len(),
                "not all connections closed in time"
            ),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slots> {
        lock(&self.slots)
    }
}

fn lock(slots: &Mutex<Slots>) -> MutexGuard<'_, Slots> {
    slots.lock().unwrap_or_else(PoisonError::into_inner)
}
