//! Drives one client connection through request/response exchanges.
//!
//! The engine only knows HTTP framing. Everything that depends on policy,
//! such as where to connect, which fields to inject and whether to retry, is
//! asked from a [`CommunicationOwner`].

use std::{future::Future, io};

use http::StatusCode;
use n0_error::{anyerr, e};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::{
    buffer::Modification,
    downstream::MessagePools,
    error::{MessageError, ProxyError},
    message::{ReadingState, Request, Response},
    upstream::Upstream,
    util::{Direction, Prebuffered, forward_bidi, send_error_response},
};

const CONNECTION_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";

/// Policy callbacks of the communication engine.
pub(crate) trait CommunicationOwner: Send + Sync {
    /// Called before each attempt to send `request`.
    ///
    /// Makes sure `upstream` is connected and returns the modifications to
    /// apply to the request. `repeat` is 0 for the first attempt.
    fn before_send<'a>(
        &'a mut self,
        upstream: &'a mut Upstream,
        request: &'a Request,
        repeat: usize,
    ) -> impl Future<Output = Result<Vec<Modification>, ProxyError>> + Send + 'a;

    /// Whether the current upstream is an actual proxy rather than the
    /// target host itself.
    fn using_proxy(&self) -> bool;

    /// How often a request may be resent.
    fn retry_limit(&self) -> usize;

    /// Decides whether `request` is sent again instead of passing `response`
    /// on to the client.
    fn review<'a>(
        &'a mut self,
        request: &'a Request,
        response: &'a Response,
    ) -> impl Future<Output = bool> + Send + 'a;

    /// Called once per round trip, after the retry decision.
    fn on_round_trip(&self, request: &Request, response: &Response, retrying: bool);

    /// Adjusts the upstream connection after a response was consumed.
    fn settle_upstream<'a>(
        &'a mut self,
        upstream: &'a mut Upstream,
        request: &'a Request,
        response: &'a Response,
        retrying: bool,
    ) -> impl Future<Output = Result<(), ProxyError>> + Send + 'a;

    /// Returns the status of the error response to send, if any.
    fn on_error(&self, request: Option<&Request>, error: &ProxyError) -> Option<StatusCode>;

    fn on_tunnel_started(&self, request: &Request);

    fn on_tunnel_closed(&self, direction: Direction, result: &io::Result<u64>);
}

/// The client side of a connection.
#[derive(Debug)]
pub(crate) struct ClientIo<R, W> {
    pub(crate) recv: Prebuffered<R>,
    pub(crate) send: W,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    /// Read the next request.
    Next,
    /// The client ended the session.
    Close,
    /// Relay raw bytes from now on.
    Tunnel,
}

/// Serves requests from `client` until the session ends.
///
/// A client that disconnects between requests ends the session with
/// `Ok(())`. Any other failure is reported to the owner, answered with an
/// error response if nothing was sent to the client yet, and returned.
pub(crate) async fn communicate<O, R, W>(
    owner: &mut O,
    client: &mut ClientIo<R, W>,
    upstream: &mut Upstream,
    pools: &MessagePools,
) -> Result<(), ProxyError>
where
    O: CommunicationOwner,
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    loop {
        let mut request = pools.requests.alloc();
        let mut response = pools.responses.alloc();
        let mut responded = false;
        let result = exchange(
            owner,
            client,
            upstream,
            &mut request,
            &mut response,
            &mut responded,
        )
        .await;
        let outcome = match result {
            Ok(outcome) => outcome,
            Err(err) => {
                let read = matches!(
                    request.reading_state(),
                    ReadingState::Header | ReadingState::Body | ReadingState::BodyRedirected
                );
                let status = owner.on_error(read.then_some(&request), &err);
                if !responded && let Some(status) = status {
                    if let Err(send_err) = send_error_response(&mut client.send, status).await {
                        debug!("failed to send error response: {send_err:#}");
                    }
                }
                pools.requests.release(request, true);
                pools.responses.release(response, true);
                return Err(err);
            }
        };
        let result = match outcome {
            Outcome::Next => {
                pools.requests.release(request, false);
                pools.responses.release(response, false);
                continue;
            }
            Outcome::Close => Ok(()),
            Outcome::Tunnel => tunnel(owner, client, upstream, &request).await,
        };
        pools.requests.release(request, result.is_err());
        pools.responses.release(response, result.is_err());
        return result;
    }
}

/// Handles one request, including its retries.
async fn exchange<O, R, W>(
    owner: &mut O,
    client: &mut ClientIo<R, W>,
    upstream: &mut Upstream,
    request: &mut Request,
    response: &mut Response,
    responded: &mut bool,
) -> Result<Outcome, ProxyError>
where
    O: CommunicationOwner,
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    if !request
        .read_header(&mut client.recv)
        .await
        .map_err(bad_request)?
    {
        return Ok(Outcome::Close);
    }
    let mut repeat = 0;
    loop {
        let modifications = owner.before_send(upstream, request, repeat).await?;
        if request.is_connect() && !owner.using_proxy() {
            request
                .read_body(&mut client.recv)
                .await
                .map_err(bad_request)?;
            *responded = true;
            client.send.write_all(CONNECTION_ESTABLISHED).await?;
            client.send.flush().await?;
            return Ok(Outcome::Tunnel);
        }

        request.clear_modifications();
        for modification in modifications {
            request
                .add_modification(modification)
                .map_err(|err| e!(ProxyError::Internal, anyerr!(err)))?;
        }
        // Direct connections are never retried.
        let retain = owner.retry_limit() > 0 && owner.using_proxy();
        send_request(client, upstream, request, repeat, retain).await?;
        receive_response(client, upstream, request, response, responded).await?;

        let retrying = repeat < owner.retry_limit() && owner.review(request, response).await;
        owner.on_round_trip(request, response, retrying);
        let streams = upstream.streams()?;
        if retrying {
            response
                .redirect(&mut tokio::io::sink(), &mut streams.recv)
                .await
                .map_err(bad_response)?;
            owner
                .settle_upstream(upstream, request, response, true)
                .await?;
            repeat += 1;
            continue;
        }

        *responded = true;
        response
            .redirect(&mut client.send, &mut streams.recv)
            .await
            .map_err(bad_response)?;
        client.send.flush().await?;
        let status = response.status();
        if (request.is_connect() && status == StatusCode::OK)
            || status == StatusCode::SWITCHING_PROTOCOLS
        {
            return Ok(Outcome::Tunnel);
        }
        owner
            .settle_upstream(upstream, request, response, false)
            .await?;
        return Ok(Outcome::Next);
    }
}

/// Sends the request upstream.
///
/// The first attempt streams the body from the client, keeping a copy if the
/// request may have to be resent. Later attempts write the retained message.
async fn send_request<R, W>(
    client: &mut ClientIo<R, W>,
    upstream: &mut Upstream,
    request: &mut Request,
    repeat: usize,
    retain: bool,
) -> Result<(), ProxyError>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    let streams = upstream.streams()?;
    if repeat > 0 {
        request.write(&mut streams.send, false).await
    } else if retain {
        request
            .redirect_and_retain(&mut streams.send, &mut client.recv)
            .await
    } else {
        request.redirect(&mut streams.send, &mut client.recv).await
    }
    .map_err(forward_failed)?;
    streams
        .send
        .flush()
        .await
        .map_err(|err| forward_failed(err.into()))?;
    Ok(())
}

/// Reads the final response to `request`.
///
/// Interim 1xx responses are passed on to the client.
async fn receive_response<R, W>(
    client: &mut ClientIo<R, W>,
    upstream: &mut Upstream,
    request: &Request,
    response: &mut Response,
    responded: &mut bool,
) -> Result<(), ProxyError>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    let streams = upstream.streams()?;
    loop {
        if !response
            .read_header(&mut streams.recv, Some(request))
            .await
            .map_err(bad_response)?
        {
            return Err(e!(ProxyError::UpstreamClosed));
        }
        let status = response.status();
        if !status.is_informational() || status == StatusCode::SWITCHING_PROTOCOLS {
            return Ok(());
        }
        debug!(%status, "interim response");
        *responded = true;
        response
            .redirect(&mut client.send, &mut streams.recv)
            .await
            .map_err(bad_response)?;
        client.send.flush().await?;
    }
}

async fn tunnel<O, R, W>(
    owner: &O,
    client: &mut ClientIo<R, W>,
    upstream: &mut Upstream,
    request: &Request,
) -> Result<(), ProxyError>
where
    O: CommunicationOwner,
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    owner.on_tunnel_started(request);
    let streams = upstream.streams()?;
    let result = forward_bidi(
        &mut client.recv,
        &mut client.send,
        &mut streams.recv,
        &mut streams.send,
        |direction, result| owner.on_tunnel_closed(direction, result),
    )
    .await;
    upstream.disconnect();
    result?;
    Ok(())
}

#[track_caller]
fn bad_request(source: MessageError) -> ProxyError {
    e!(ProxyError::BadRequest { source })
}

/// Maps a failure while streaming a request. Malformed input is the
/// client's fault, I/O errors are charged to the upstream.
#[track_caller]
fn forward_failed(source: MessageError) -> ProxyError {
    match source {
        MessageError::Io { .. } => e!(ProxyError::ForwardFailed { source }),
        source => bad_request(source),
    }
}

#[track_caller]
fn bad_response(source: MessageError) -> ProxyError {
    e!(ProxyError::BadResponse { source })
}
