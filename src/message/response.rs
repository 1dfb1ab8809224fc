use std::ops::{Deref, DerefMut};

use http::{Method, StatusCode, Version};
use tokio::io::AsyncRead;

use super::{BodyLength, FRAMING_FIELD_LETTERS, Framing, Message, Request};
use crate::{
    buffer::{ScanBytes, Span, header::FieldLine},
    error::MessageError,
    parse::{has_connection_option, parse_version},
    pool::{BlockPool, Poolable},
    util::Prebuffered,
};

/// An HTTP response read from the upstream peer.
#[derive(Debug)]
pub struct Response {
    message: Message,
    status: StatusCode,
    keep_alive: bool,
    proxy_authenticate: Option<String>,
    proxy_authenticate_span: Span,
}

impl Deref for Response {
    type Target = Message;

    fn deref(&self) -> &Message {
        &self.message
    }
}

impl DerefMut for Response {
    fn deref_mut(&mut self) -> &mut Message {
        &mut self.message
    }
}

impl Poolable for Response {
    fn create(blocks: &BlockPool) -> Self {
        Self::new(blocks.clone())
    }

    fn reset(&mut self) {
        self.message.reset();
        self.reset_response();
    }
}

impl Response {
    /// Creates an empty response allocating from `pool`.
    pub fn new(pool: BlockPool) -> Self {
        Self {
            message: Message::new(pool),
            status: StatusCode::OK,
            keep_alive: true,
            proxy_authenticate: None,
            proxy_authenticate_span: Span::ZERO,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Whether the peer keeps the connection open after this response.
    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    /// Value of the first `Proxy-Authenticate` field.
    pub fn proxy_authenticate(&self) -> Option<&str> {
        self.proxy_authenticate.as_deref()
    }

    /// Span of the first `Proxy-Authenticate` field line including its CRLF.
    pub fn proxy_authenticate_span(&self) -> Span {
        self.proxy_authenticate_span
    }

    /// Reads the response header.
    ///
    /// `request` is the request this response answers. Its method decides
    /// whether the response can carry a body at all.
    pub async fn read_header<R>(
        &mut self,
        input: &mut Prebuffered<R>,
        request: Option<&Request>,
    ) -> Result<bool, MessageError>
    where
        R: AsyncRead + Unpin + Send,
    {
        self.message.begin_header()?;
        self.reset_response();
        let method = request.map(|request| request.method().clone());
        let result = self.scan_header(input, method.as_ref()).await;
        self.message.finish_header(result)
    }

    /// Reads the whole response, retaining its body.
    pub async fn read<R>(
        &mut self,
        input: &mut Prebuffered<R>,
        request: Option<&Request>,
    ) -> Result<bool, MessageError>
    where
        R: AsyncRead + Unpin + Send,
    {
        if !self.read_header(input, request).await? {
            return Ok(false);
        }
        self.message.read_body(input).await?;
        Ok(true)
    }

    fn reset_response(&mut self) {
        self.status = StatusCode::OK;
        self.keep_alive = true;
        self.proxy_authenticate = None;
        self.proxy_authenticate_span = Span::ZERO;
    }

    async fn scan_header<R>(
        &mut self,
        input: &mut Prebuffered<R>,
        method: Option<&Method>,
    ) -> Result<(), MessageError>
    where
        R: AsyncRead + Unpin + Send,
    {
        let mut scan = self.message.header.scan(input);

        let mut version = String::new();
        if scan.read_ascii_to(&[b' '], &mut version, false).await? {
            return Err(MessageError::bad_request("status line is missing tokens"));
        }
        let version =
            parse_version(&version).ok_or_else(|| MessageError::bad_request("invalid HTTP version"))?;
        // The reason phrase is optional in practice.
        let mut status = String::new();
        if !scan.read_ascii_to(&[b' '], &mut status, false).await? {
            scan.skip_item(true).await?;
        }
        let status = parse_status(&status)?;
        self.message.version = version;
        self.status = status;
        self.keep_alive = version != Version::HTTP_10 && version != Version::HTTP_09;

        let bodiless = status.is_informational()
            || status == StatusCode::NO_CONTENT
            || status == StatusCode::NOT_MODIFIED
            || method == Some(&Method::HEAD)
            || (method == Some(&Method::CONNECT) && status.is_success());

        let mut interest = FRAMING_FIELD_LETTERS.to_vec();
        interest.push(b'p');
        let mut framing = Framing::default();
        loop {
            let (name, start) = match scan.next_field(&interest).await? {
                FieldLine::End => break,
                FieldLine::Skipped => continue,
                FieldLine::Named { name, start } => (name, start),
            };
            match name.as_str() {
                "connection" => {
                    let value = scan.read_value().await?;
                    if has_connection_option(&value, "close") {
                        self.keep_alive = false;
                    } else if has_connection_option(&value, "keep-alive") {
                        self.keep_alive = true;
                    }
                }
                "proxy-authenticate" if self.proxy_authenticate.is_none() => {
                    let value = scan.read_value().await?;
                    self.proxy_authenticate_span = Span::new(start, scan.current_offset());
                    self.proxy_authenticate = Some(value.trim_matches([' ', '\t']).to_string());
                }
                "content-length" | "transfer-encoding" if bodiless => {
                    scan.skip_value().await?;
                }
                name => {
                    if !framing.scan_field(&mut scan, name).await? {
                        scan.skip_value().await?;
                    }
                }
            }
        }
        self.message.body_length = if bodiless {
            BodyLength::Length(0)
        } else {
            framing.body_length()
        };
        Ok(())
    }
}

fn parse_status(token: &str) -> Result<StatusCode, MessageError> {
    if token.len() != 3 || !token.bytes().all(|b| b.is_ascii_digit()) {
        return Err(MessageError::bad_request("invalid status code"));
    }
    StatusCode::from_bytes(token.as_bytes()).map_err(|_| MessageError::bad_request("invalid status code"))
}
