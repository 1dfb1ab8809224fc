use std::{
    net::SocketAddr,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use n0_error::{Result, StdResultExt, anyerr};
use n0_future::task::AbortOnDropHandle;
use n0_tracing_test::traced_test;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};
use tokio_util::time::FutureExt;
use tracing::debug;

use crate::{
    Authority, BasicCredential, CredentialProvider, CredentialRequest, Direct, ProxyOpts,
    ProxyServer, StaticCredential, StaticProxy,
};

const TIMEOUT: Duration = Duration::from_secs(10);

/// Credential the fake actual proxy accepts.
const ACCEPTED_AUTHORIZATION: &str = "Basic dXNlcjpzZWNyZXQ=";

// -- Test helpers --

/// Reads one request (header and Content-Length body) from `stream`.
///
/// Returns an empty buffer if the stream ends before a request starts.
pub(crate) async fn read_request(stream: &mut (impl AsyncRead + Unpin)) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 2048];
    loop {
        let parsed = {
            let mut headers = [httparse::EMPTY_HEADER; 32];
            let mut request = httparse::Request::new(&mut headers);
            match request.parse(&buf).std_context("invalid request")? {
                httparse::Status::Complete(len) => {
                    Some(len + content_length(request.headers)?)
                }
                httparse::Status::Partial => None,
            }
        };
        if let Some(total) = parsed
            && buf.len() >= total
        {
            return Ok(buf);
        }
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            if buf.is_empty() {
                return Ok(buf);
            }
            return Err(anyerr!("stream ended inside a request"));
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

fn content_length(headers: &[httparse::Header<'_>]) -> Result<usize> {
    match header(headers, "content-length") {
        Some(value) => value.parse().std_context("invalid Content-Length"),
        None => Ok(0),
    }
}

fn header<'a>(headers: &[httparse::Header<'a>], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case(name))
        .and_then(|h| std::str::from_utf8(h.value).ok())
}

/// Parses a response header, returning the status and the header length.
fn parse_response(bytes: &[u8]) -> Result<(u16, usize)> {
    let mut headers = [httparse::EMPTY_HEADER; 16];
    let mut response = httparse::Response::new(&mut headers);
    match response.parse(bytes).std_context("invalid response")? {
        httparse::Status::Complete(len) => Ok((response.code.unwrap_or_default(), len)),
        httparse::Status::Partial => Err(anyerr!("incomplete response")),
    }
}

/// Reads a response header up to and including the empty line.
async fn read_head(stream: &mut TcpStream) -> Result<Vec<u8>> {
    let mut head = Vec::new();
    while !head.ends_with(b"\r\n\r\n") {
        let mut byte = [0u8];
        if stream.read(&mut byte).await? == 0 {
            return Err(anyerr!("stream ended inside a response header"));
        }
        head.push(byte[0]);
    }
    Ok(head)
}

/// Sends `request`, closes the sending side and returns everything received.
async fn send_and_receive(proxy_addr: SocketAddr, request: &[u8]) -> Result<Vec<u8>> {
    let mut stream = TcpStream::connect(proxy_addr).await?;
    stream.write_all(request).await?;
    stream.shutdown().await?;
    let mut received = Vec::new();
    stream
        .read_to_end(&mut received)
        .timeout(TIMEOUT)
        .await
        .anyerr()??;
    Ok(received)
}

async fn spawn_proxy(opts: ProxyOpts) -> Result<(SocketAddr, ProxyServer, AbortOnDropHandle<Result>)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let server = ProxyServer::new(opts);
    debug!(%addr, "spawned proxy server");
    let task = tokio::spawn({
        let server = server.clone();
        async move { server.serve(listener).await }
    });
    Ok((addr, server, AbortOnDropHandle::new(task)))
}

/// Spawns a simple TCP echo server.
async fn spawn_echo_server() -> Result<(SocketAddr, AbortOnDropHandle<()>)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let task = tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let (mut read, mut write) = stream.split();
                let _ = tokio::io::copy(&mut read, &mut write).await;
            });
        }
    });
    Ok((addr, AbortOnDropHandle::new(task)))
}

/// Spawns an HTTP origin server that answers "origin {method} {target}".
async fn spawn_origin_server() -> Result<(SocketAddr, AbortOnDropHandle<()>)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let task = tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                while let Ok(request) = read_request(&mut stream).await {
                    if request.is_empty() {
                        break;
                    }
                    let mut headers = [httparse::EMPTY_HEADER; 32];
                    let mut parsed = httparse::Request::new(&mut headers);
                    let _ = parsed.parse(&request);
                    let body = format!(
                        "origin {} {}",
                        parsed.method.unwrap_or_default(),
                        parsed.path.unwrap_or_default()
                    );
                    let response = format!(
                        "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n{body}",
                        body.len()
                    );
                    if stream.write_all(response.as_bytes()).await.is_err() {
                        break;
                    }
                }
            });
        }
    });
    Ok((addr, AbortOnDropHandle::new(task)))
}

/// An actual proxy requiring [`ACCEPTED_AUTHORIZATION`].
#[derive(Debug, Clone, Default)]
struct FakeProxy {
    /// Closes each connection after the first response.
    close_after_response: bool,
    requests: Arc<Mutex<Vec<String>>>,
    connections: Arc<AtomicUsize>,
}

impl FakeProxy {
    async fn spawn(self) -> Result<(Authority, AbortOnDropHandle<()>)> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        debug!(%addr, "spawned fake actual proxy");
        let task = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                self.connections.fetch_add(1, Ordering::SeqCst);
                let this = self.clone();
                tokio::spawn(async move {
                    if let Err(err) = this.serve(stream).await {
                        debug!("fake proxy connection failed: {err:#}");
                    }
                });
            }
        });
        Ok((Authority::new("127.0.0.1", addr.port()), AbortOnDropHandle::new(task)))
    }

    async fn serve(&self, mut stream: TcpStream) -> Result<()> {
        loop {
            let request = read_request(&mut stream).await?;
            if request.is_empty() {
                return Ok(());
            }
            self.requests
                .lock()
                .unwrap()
                .push(String::from_utf8_lossy(&request).into_owned());
            let mut headers = [httparse::EMPTY_HEADER; 32];
            let mut parsed = httparse::Request::new(&mut headers);
            parsed.parse(&request).std_context("invalid request")?;
            let method = parsed.method.unwrap_or_default();
            let target = parsed.path.unwrap_or_default().to_string();

            if header(parsed.headers, "proxy-authorization") != Some(ACCEPTED_AUTHORIZATION) {
                stream
                    .write_all(
                        b"HTTP/1.1 407 Proxy Authentication Required\r\n\
                          Proxy-Authenticate: Basic realm=\"fake\"\r\n\
                          Content-Length: 6\r\n\r\ndenied",
                    )
                    .await?;
                continue;
            }
            if method == "CONNECT" {
                let mut upstream = TcpStream::connect(&target).await?;
                stream
                    .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
                    .await?;
                tokio::io::copy_bidirectional(&mut stream, &mut upstream).await?;
                return Ok(());
            }
            let body = format!("proxied {method} {target}");
            let connection = if self.close_after_response {
                "Connection: close\r\n"
            } else {
                ""
            };
            let response = format!(
                "HTTP/1.1 200 OK\r\n{connection}Content-Length: {}\r\n\r\n{body}",
                body.len()
            );
            stream.write_all(response.as_bytes()).await?;
            if self.close_after_response {
                return Ok(());
            }
        }
    }

    fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }
}

/// Provider that records its calls.
///
/// It answers a challenge with `user:{password}`. With `preemptive` it also
/// answers the initial call.
#[derive(Debug, Clone, Default)]
struct RecordingProvider {
    preemptive: bool,
    password: &'static str,
    calls: Arc<Mutex<Vec<(bool, Option<String>)>>>,
}

impl CredentialProvider for RecordingProvider {
    async fn credential<'a>(&'a self, request: CredentialRequest<'a>) -> Option<BasicCredential> {
        self.calls
            .lock()
            .unwrap()
            .push((request.first_request, request.realm.map(ToString::to_string)));
        if request.first_request && !self.preemptive {
            return None;
        }
        Some(BasicCredential::new("user", self.password))
    }
}

fn get_request(target: &str) -> String {
    format!("GET http://{target}/index.html HTTP/1.1\r\nHost: {target}\r\n\r\n")
}

// -- Tests --

#[tokio::test]
#[traced_test]
async fn answers_challenge_with_credential() -> Result {
    let fake = FakeProxy::default();
    let (proxy, _fake_task) = fake.clone().spawn().await?;
    let provider = RecordingProvider {
        password: "secret",
        ..Default::default()
    };
    let opts = ProxyOpts::new(StaticProxy(vec![proxy]))
        .credentials(provider.clone());
    let (addr, _server, _task) = spawn_proxy(opts).await?;

    let received = send_and_receive(addr, get_request("origin.test").as_bytes()).await?;
    let (status, len) = parse_response(&received)?;
    assert_eq!(status, 200);
    assert_eq!(&received[len..], b"proxied GET http://origin.test/index.html");

    let requests = fake.requests();
    assert_eq!(requests.len(), 2);
    assert!(!requests[0].contains("Proxy-Authorization"));
    assert!(requests[1].ends_with(&format!(
        "Host: origin.test\r\nProxy-Authorization: {ACCEPTED_AUTHORIZATION}\r\n\r\n"
    )));
    assert_eq!(
        *provider.calls.lock().unwrap(),
        vec![(true, None), (false, Some("fake".to_string()))]
    );
    Ok(())
}

#[tokio::test]
#[traced_test]
async fn rejected_client_credential_is_replaced() -> Result {
    let fake = FakeProxy::default();
    let (proxy, _fake_task) = fake.clone().spawn().await?;
    let provider = RecordingProvider {
        password: "secret",
        ..Default::default()
    };
    let opts = ProxyOpts::new(StaticProxy(vec![proxy])).credentials(provider.clone());
    let (addr, _server, _task) = spawn_proxy(opts).await?;

    let request = "GET http://origin.test/ HTTP/1.1\r\nProxy-Authorization: Basic d3Jvbmc=\r\nHost: origin.test\r\n\r\n";
    let received = send_and_receive(addr, request.as_bytes()).await?;
    let (status, _) = parse_response(&received)?;
    assert_eq!(status, 200);

    // the retry replaces the client's field in place
    assert_eq!(
        fake.requests(),
        vec![
            request.to_string(),
            request.replace("Basic d3Jvbmc=", ACCEPTED_AUTHORIZATION),
        ]
    );
    assert_eq!(
        *provider.calls.lock().unwrap(),
        vec![(false, Some("fake".to_string()))]
    );
    Ok(())
}

#[tokio::test]
#[traced_test]
async fn cached_credential_is_sent_preemptively() -> Result {
    let fake = FakeProxy::default();
    let (proxy, _fake_task) = fake.clone().spawn().await?;
    let provider = RecordingProvider {
        preemptive: true,
        password: "secret",
        ..Default::default()
    };
    let opts = ProxyOpts::new(StaticProxy(vec![proxy])).credentials(provider.clone());
    let (addr, _server, _task) = spawn_proxy(opts).await?;

    // two requests on one connection
    let request = get_request("origin.test").repeat(2);
    let received = send_and_receive(addr, request.as_bytes()).await?;
    let (status, len) = parse_response(&received)?;
    assert_eq!(status, 200);
    let (status, _) = parse_response(&received[len + 41..])?;
    assert_eq!(status, 200);

    assert_eq!(fake.requests().len(), 2);
    assert_eq!(fake.connections.load(Ordering::SeqCst), 1);
    assert_eq!(provider.calls.lock().unwrap().len(), 1);
    Ok(())
}

#[tokio::test]
#[traced_test]
async fn retries_are_bounded() -> Result {
    let fake = FakeProxy::default();
    let (proxy, _fake_task) = fake.clone().spawn().await?;
    let provider = RecordingProvider {
        preemptive: true,
        password: "wrong",
        ..Default::default()
    };
    let opts = ProxyOpts::new(StaticProxy(vec![proxy]))
        .credentials(provider.clone())
        .retry_count(2);
    let (addr, _server, _task) = spawn_proxy(opts).await?;

    let received = send_and_receive(addr, get_request("origin.test").as_bytes()).await?;
    let (status, len) = parse_response(&received)?;
    assert_eq!(status, 407);
    assert_eq!(&received[len..], b"denied");
    assert_eq!(fake.requests().len(), 3);
    assert_eq!(provider.calls.lock().unwrap().len(), 3);
    Ok(())
}

#[tokio::test]
#[traced_test]
async fn rejected_static_credential_is_not_retried() -> Result {
    let fake = FakeProxy::default();
    let (proxy, _fake_task) = fake.clone().spawn().await?;
    let opts = ProxyOpts::new(StaticProxy(vec![proxy]))
        .credentials(StaticCredential(BasicCredential::new("user", "nope")));
    let (addr, _server, _task) = spawn_proxy(opts).await?;

    let received = send_and_receive(addr, get_request("origin.test").as_bytes()).await?;
    assert_eq!(parse_response(&received)?.0, 407);
    let requests = fake.requests();
    assert_eq!(requests.len(), 1);
    assert!(requests[0].contains("Proxy-Authorization: Basic dXNlcjpub3Bl\r\n"));
    Ok(())
}

#[tokio::test]
#[traced_test]
async fn client_credential_is_kept() -> Result {
    let fake = FakeProxy::default();
    let (proxy, _fake_task) = fake.clone().spawn().await?;
    let opts = ProxyOpts::new(StaticProxy(vec![proxy]))
        .credentials(StaticCredential(BasicCredential::new("other", "x")));
    let (addr, _server, _task) = spawn_proxy(opts).await?;

    let request = format!(
        "GET http://origin.test/ HTTP/1.1\r\nProxy-Authorization: {ACCEPTED_AUTHORIZATION}\r\nHost: origin.test\r\n\r\n"
    );
    let received = send_and_receive(addr, request.as_bytes()).await?;
    assert_eq!(parse_response(&received)?.0, 200);
    assert_eq!(fake.requests(), vec![request]);
    Ok(())
}

#[tokio::test]
#[traced_test]
async fn reconnects_after_connection_close() -> Result {
    let fake = FakeProxy {
        close_after_response: true,
        ..Default::default()
    };
    let (proxy, _fake_task) = fake.clone().spawn().await?;
    let opts = ProxyOpts::new(StaticProxy(vec![proxy])).credentials(StaticCredential(
        BasicCredential::new("user", "secret"),
    ));
    let (addr, _server, _task) = spawn_proxy(opts).await?;

    let request = [get_request("a.test"), get_request("b.test")].concat();
    let received = send_and_receive(addr, request.as_bytes()).await?;
    let text = String::from_utf8_lossy(&received);
    assert!(text.contains("proxied GET http://a.test/index.html"));
    assert!(text.ends_with("proxied GET http://b.test/index.html"));
    assert_eq!(fake.connections.load(Ordering::SeqCst), 2);
    Ok(())
}

#[tokio::test]
#[traced_test]
async fn connect_tunnel_through_actual_proxy() -> Result {
    let fake = FakeProxy::default();
    let (proxy, _fake_task) = fake.clone().spawn().await?;
    let (echo_addr, _echo_task) = spawn_echo_server().await?;
    let provider = RecordingProvider {
        password: "secret",
        ..Default::default()
    };
    let opts = ProxyOpts::new(StaticProxy(vec![proxy])).credentials(provider);
    let (addr, _server, _task) = spawn_proxy(opts).await?;

    let mut stream = TcpStream::connect(addr).await?;
    let request = format!("CONNECT {echo_addr} HTTP/1.1\r\nHost: {echo_addr}\r\n\r\n");
    stream.write_all(request.as_bytes()).await?;
    let head = read_head(&mut stream).timeout(TIMEOUT).await.anyerr()??;
    assert_eq!(parse_response(&head)?.0, 200);

    stream.write_all(b"hello tunnel").await?;
    stream.shutdown().await?;
    let mut echoed = Vec::new();
    stream
        .read_to_end(&mut echoed)
        .timeout(TIMEOUT)
        .await
        .anyerr()??;
    assert_eq!(echoed, b"hello tunnel");
    // one challenge, then the authorized CONNECT
    assert_eq!(fake.requests().len(), 2);
    Ok(())
}

#[tokio::test]
#[traced_test]
async fn direct_requests_reach_origin() -> Result {
    let (origin_addr, _origin_task) = spawn_origin_server().await?;
    let (addr, _server, _task) = spawn_proxy(ProxyOpts::new(Direct)).await?;

    let request = format!("GET /path HTTP/1.1\r\nHost: {origin_addr}\r\n\r\n");
    let received = send_and_receive(addr, request.as_bytes()).await?;
    let (status, len) = parse_response(&received)?;
    assert_eq!(status, 200);
    assert_eq!(&received[len..], b"origin GET /path");
    Ok(())
}

#[tokio::test]
#[traced_test]
async fn direct_connect_is_answered_locally() -> Result {
    let (echo_addr, _echo_task) = spawn_echo_server().await?;
    let (addr, _server, _task) = spawn_proxy(ProxyOpts::default()).await?;

    let mut stream = TcpStream::connect(addr).await?;
    stream
        .write_all(format!("CONNECT {echo_addr} HTTP/1.1\r\n\r\n").as_bytes())
        .await?;
    let head = read_head(&mut stream).timeout(TIMEOUT).await.anyerr()??;
    assert_eq!(head, b"HTTP/1.1 200 Connection Established\r\n\r\n");
    stream.write_all(b"ping").await?;
    let mut buf = [0u8; 4];
    stream
        .read_exact(&mut buf)
        .timeout(TIMEOUT)
        .await
        .anyerr()??;
    assert_eq!(&buf, b"ping");
    Ok(())
}

#[tokio::test]
#[traced_test]
async fn malformed_request_is_rejected() -> Result {
    let (addr, _server, _task) = spawn_proxy(ProxyOpts::default()).await?;
    let received = send_and_receive(addr, b"GET /\r\n\r\n").await?;
    assert_eq!(received, b"HTTP/1.0 400 Bad Request\r\n\r\n");

    let received = send_and_receive(addr, b"GET / HTTP/1.1\r\n\r\n").await?;
    assert_eq!(received, b"HTTP/1.0 400 Bad Request\r\n\r\n");
    Ok(())
}

#[tokio::test]
#[traced_test]
async fn unreachable_upstream_is_bad_gateway() -> Result {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();
    drop(listener);
    let opts = ProxyOpts::new(StaticProxy(vec![Authority::new("127.0.0.1", port)]));
    let (addr, _server, _task) = spawn_proxy(opts).await?;
    let received = send_and_receive(addr, get_request("origin.test").as_bytes()).await?;
    assert_eq!(received, b"HTTP/1.0 502 Bad Gateway\r\n\r\n");
    Ok(())
}

#[tokio::test]
#[traced_test]
async fn shutdown_closes_tunnels() -> Result {
    let (echo_addr, _echo_task) = spawn_echo_server().await?;
    let (addr, server, task) = spawn_proxy(ProxyOpts::default()).await?;

    let mut stream = TcpStream::connect(addr).await?;
    stream
        .write_all(format!("CONNECT {echo_addr} HTTP/1.1\r\n\r\n").as_bytes())
        .await?;
    read_head(&mut stream).timeout(TIMEOUT).await.anyerr()??;
    assert_eq!(server.active_connections(), 1);

    server.shutdown().await;
    let mut rest = Vec::new();
    stream
        .read_to_end(&mut rest)
        .timeout(TIMEOUT)
        .await
        .anyerr()??;
    assert!(rest.is_empty());
    assert_eq!(server.active_connections(), 0);
    // the accept loop ended as well
    task.await.std_context("join")??;
    Ok(())
}
