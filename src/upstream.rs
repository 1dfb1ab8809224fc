//! The connection from the proxy to the actual proxy or origin server.

use std::io;

use n0_error::e;
use tokio::net::{
    TcpStream,
    tcp::{OwnedReadHalf, OwnedWriteHalf},
};
use tracing::debug;

pub use self::auth::{
    BasicCredential, CredentialProvider, CredentialRequest, NoCredentials, StaticCredential,
};
pub(crate) use self::auth::{DynCredentialProvider, basic_realm};
use crate::{error::ProxyError, parse::Authority, util::Prebuffered};

mod auth;

/// Socket halves of an established upstream connection.
#[derive(derive_more::Debug)]
pub(crate) struct UpstreamStreams {
    #[debug("Prebuffered<OwnedReadHalf>")]
    pub(crate) recv: Prebuffered<OwnedReadHalf>,
    pub(crate) send: OwnedWriteHalf,
    pub(crate) endpoint: Authority,
}

/// Upstream socket that is connected lazily and can be reconnected.
///
/// Remembers the candidate endpoints it was last asked to connect to, so that
/// it can reconnect after the peer closed a non keep-alive connection.
#[derive(Debug, Default)]
pub(crate) struct Upstream {
    candidates: Vec<Authority>,
    streams: Option<UpstreamStreams>,
}

impl Upstream {
    /// Makes sure there is a connection to one of `candidates`.
    ///
    /// An existing connection is kept if its endpoint is among them.
    /// Otherwise the candidates are tried in order.
    pub(crate) async fn ensure_connect(&mut self, candidates: Vec<Authority>) -> Result<(), ProxyError> {
        if let Some(streams) = &self.streams
            && candidates.contains(&streams.endpoint)
        {
            self.candidates = candidates;
            return Ok(());
        }
        self.disconnect();
        self.candidates = candidates;
        self.connect().await
    }

    /// Connects again to the remembered candidates.
    pub(crate) async fn reconnect(&mut self) -> Result<(), ProxyError> {
        self.disconnect();
        self.connect().await
    }

    /// Closes the connection, if any.
    pub(crate) fn disconnect(&mut self) {
        if let Some(streams) = self.streams.take() {
            debug!(endpoint=%streams.endpoint, "disconnect upstream");
        }
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.streams.is_some()
    }

    /// The endpoint of the current connection.
    pub(crate) fn endpoint(&self) -> Option<&Authority> {
        self.streams.as_ref().map(|streams| &streams.endpoint)
    }

    pub(crate) fn streams(&mut self) -> Result<&mut UpstreamStreams, ProxyError> {
        self.streams.as_mut().ok_or_else(|| {
            e!(ProxyError::Io, io::Error::from(io::ErrorKind::NotConnected).into())
        })
    }

    async fn connect(&mut self) -> Result<(), ProxyError> {
        let mut last_err = None;
        for endpoint in &self.candidates {
            match TcpStream::connect((endpoint.connect_host(), endpoint.port)).await {
                Ok(stream) => {
                    stream.set_nodelay(true).ok();
                    debug!(%endpoint, "connected to upstream");
                    let (recv, send) = stream.into_split();
                    self.streams = Some(UpstreamStreams {
                        recv: Prebuffered::new(recv),
                        send,
                        endpoint: endpoint.clone(),
                    });
                    return Ok(());
                }
                Err(err) => {
                    debug!(%endpoint, "failed to connect to upstream: {err:#}");
                    last_err = Some(err);
                }
            }
        }
        let endpoints = self
            .candidates
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        let source = last_err.unwrap_or_else(|| io::Error::other("no upstream endpoint"));
        Err(e!(ProxyError::UpstreamConnect { endpoints, source }))
    }
}

#[cfg(test)]
mod tests {
    use n0_error::{Result, StdResultExt};
    use tokio::net::TcpListener;

    use super::*;

    #[tokio::test]
    async fn keeps_matching_connection() -> Result {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let accept = tokio::spawn(async move {
            let mut accepted = Vec::new();
            for _ in 0..2 {
                accepted.push(listener.accept().await.map(|(s, _)| s));
            }
            accepted
        });
        let endpoint = Authority::new("127.0.0.1", addr.port());

        let mut upstream = Upstream::default();
        assert!(upstream.streams().is_err());
        upstream.ensure_connect(vec![endpoint.clone()]).await?;
        assert_eq!(upstream.endpoint(), Some(&endpoint));
        upstream.ensure_connect(vec![endpoint.clone()]).await?;
        upstream.reconnect().await?;
        assert!(upstream.is_connected());
        upstream.disconnect();
        assert!(!upstream.is_connected());

        // exactly two connections were made
        let accepted = accept.await.std_context("join")?;
        assert_eq!(accepted.len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn reports_unreachable_candidates() -> Result {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();
        drop(listener);
        let mut upstream = Upstream::default();
        let err = upstream
            .ensure_connect(vec![Authority::new("127.0.0.1", port)])
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::UpstreamConnect { .. }));
        assert_eq!(err.should_reply(), Some(http::StatusCode::BAD_GATEWAY));
        Ok(())
    }
}
