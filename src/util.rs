use std::io;

use http::StatusCode;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::trace;

pub use self::prebuffered::Prebuffered;

mod prebuffered;

/// One direction of a tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum Direction {
    #[display("client-to-upstream")]
    ClientToUpstream,
    #[display("upstream-to-client")]
    UpstreamToClient,
}

/// Relays bytes in both directions until both sides reached EOF.
///
/// When one side's input ends, only the write half of the opposite socket is
/// shut down, so the other direction keeps flowing. An error in either
/// direction ends both. `on_close` is called as soon as a direction ends.
pub(crate) async fn forward_bidi(
    client_recv: &mut (impl AsyncRead + Send + Unpin),
    client_send: &mut (impl AsyncWrite + Send + Unpin),
    upstream_recv: &mut (impl AsyncRead + Send + Unpin),
    upstream_send: &mut (impl AsyncWrite + Send + Unpin),
    on_close: impl Fn(Direction, &io::Result<u64>) + Sync,
) -> io::Result<(u64, u64)> {
    let start = n0_future::time::Instant::now();
    let on_close = &on_close;
    tokio::try_join!(
        async {
            let res = relay(client_recv, upstream_send).await;
            trace!(?res, elapsed=?start.elapsed(), "forward client-to-upstream finished");
            on_close(Direction::ClientToUpstream, &res);
            res
        },
        async {
            let res = relay(upstream_recv, client_send).await;
            trace!(?res, elapsed=?start.elapsed(), "forward upstream-to-client finished");
            on_close(Direction::UpstreamToClient, &res);
            res
        }
    )
}

async fn relay(
    recv: &mut (impl AsyncRead + Send + Unpin),
    send: &mut (impl AsyncWrite + Send + Unpin),
) -> io::Result<u64> {
    let len = tokio::io::copy(recv, send).await?;
    // The peer may already have closed its read side.
    send.shutdown().await.ok();
    Ok(len)
}

/// Writes a minimal, bodiless error response.
pub(crate) async fn send_error_response(
    send: &mut (impl AsyncWrite + Send + Unpin),
    status: StatusCode,
) -> io::Result<()> {
    let reason = status.canonical_reason().unwrap_or("Error");
    let response = format!("HTTP/1.0 {} {reason}\r\n\r\n", status.as_u16());
    send.write_all(response.as_bytes()).await?;
    send.flush().await
}
