use std::{
    ops::{Deref, DerefMut},
    str::FromStr,
};

use http::{Method, Uri};
use tokio::io::AsyncRead;

use super::{FRAMING_FIELD_LETTERS, Framing, Message};
use crate::{
    buffer::{Span, header::FieldLine},
    error::MessageError,
    parse::{Authority, parse_version},
    pool::{BlockPool, Poolable},
    util::Prebuffered,
};

/// Form of the request-target in the request line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TargetForm {
    /// `/path?query`
    #[default]
    Origin,
    /// `http://host/path`
    Absolute,
    /// `host:port`, used by CONNECT.
    Authority,
    /// `*`, used by server-wide OPTIONS.
    Asterisk,
}

/// An HTTP request read from a client.
#[derive(Debug)]
pub struct Request {
    message: Message,
    method: Method,
    target_form: TargetForm,
    target_span: Span,
    target_uri: Option<Uri>,
    host: Option<Authority>,
    host_span: Span,
    proxy_authorization: Span,
}

impl Deref for Request {
    type Target = Message;

    fn deref(&self) -> &Message {
        &self.message
    }
}

impl DerefMut for Request {
    fn deref_mut(&mut self) -> &mut Message {
        &mut self.message
    }
}

impl Poolable for Request {
    fn create(blocks: &BlockPool) -> Self {
        Self::new(blocks.clone())
    }

    fn reset(&mut self) {
        self.message.reset();
        self.reset_request();
    }
}

impl Request {
    /// Creates an empty request allocating from `pool`.
    pub fn new(pool: BlockPool) -> Self {
        Self {
            message: Message::new(pool),
            method: Method::GET,
            target_form: TargetForm::Origin,
            target_span: Span::ZERO,
            target_uri: None,
            host: None,
            host_span: Span::ZERO,
            proxy_authorization: Span::ZERO,
        }
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn is_connect(&self) -> bool {
        self.method == Method::CONNECT
    }

    pub fn target_form(&self) -> TargetForm {
        self.target_form
    }

    /// Span of the request-target in the request line.
    pub fn request_target_span(&self) -> Span {
        self.target_span
    }

    /// The request-target, only set for absolute-form requests.
    pub fn target_uri(&self) -> Option<&Uri> {
        self.target_uri.as_ref()
    }

    /// The host the request is meant for.
    ///
    /// Taken from the request-target when it names one, otherwise from the
    /// first `Host` field.
    pub fn host(&self) -> Option<&Authority> {
        self.host.as_ref()
    }

    /// Span of the first `Host` field line including its CRLF.
    pub fn host_span(&self) -> Span {
        self.host_span
    }

    /// Span of the `Proxy-Authorization` field line including its CRLF.
    ///
    /// Empty if the client sent no such field.
    pub fn proxy_authorization_span(&self) -> Span {
        self.proxy_authorization
    }

    /// Reads the request header.
    ///
    /// Returns `Ok(false)` if the input ended cleanly before a request
    /// started.
    pub async fn read_header<R>(&mut self, input: &mut Prebuffered<R>) -> Result<bool, MessageError>
    where
        R: AsyncRead + Unpin + Send,
    {
        self.message.begin_header()?;
        self.reset_request();
        let result = self.scan_header(input).await;
        self.message.finish_header(result)
    }

    /// Reads the whole request, retaining its body.
    pub async fn read<R>(&mut self, input: &mut Prebuffered<R>) -> Result<bool, MessageError>
    where
        R: AsyncRead + Unpin + Send,
    {
        if !self.read_header(input).await? {
            return Ok(false);
        }
        self.message.read_body(input).await?;
        Ok(true)
    }

    fn reset_request(&mut self) {
        self.method = Method::GET;
        self.target_form = TargetForm::Origin;
        self.target_span = Span::ZERO;
        self.target_uri = None;
        self.host = None;
        self.host_span = Span::ZERO;
        self.proxy_authorization = Span::ZERO;
    }

    async fn scan_header<R>(&mut self, input: &mut Prebuffered<R>) -> Result<(), MessageError>
    where
        R: AsyncRead + Unpin + Send,
    {
        let mut scan = self.message.header.scan(input);

        let method = scan.read_item(false).await?;
        self.method = Method::from_bytes(method.as_bytes())
            .map_err(|_| MessageError::bad_request("invalid method"))?;
        let target_start = scan.current_offset();
        let target = scan.read_item(false).await?;
        self.target_span = Span::new(target_start, scan.current_offset() - 1);
        let version = scan.read_item(true).await?;
        self.message.version =
            parse_version(&version).ok_or_else(|| MessageError::bad_request("invalid HTTP version"))?;
        let (form, host, uri) = classify_target(&self.method, &target)?;
        self.target_form = form;
        self.host = host;
        self.target_uri = uri;

        let mut interest = FRAMING_FIELD_LETTERS.to_vec();
        interest.extend_from_slice(b"hp");
        let mut framing = Framing::default();
        loop {
            let (name, start) = match scan.next_field(&interest).await? {
                FieldLine::End => break,
                FieldLine::Skipped => continue,
                FieldLine::Named { name, start } => (name, start),
            };
            match name.as_str() {
                "host" if self.host_span.is_empty() => {
                    let value = scan.read_value().await?;
                    self.host_span = Span::new(start, scan.current_offset());
                    if self.host.is_none() {
                        let host = Authority::with_default_port(&value, 80)
                            .map_err(|_| MessageError::bad_request("invalid Host field"))?;
                        self.host = Some(host);
                    }
                }
                "proxy-authorization" => {
                    scan.skip_value().await?;
                    if self.proxy_authorization.is_empty() {
                        self.proxy_authorization = Span::new(start, scan.current_offset());
                    }
                }
                name => {
                    if !framing.scan_field(&mut scan, name).await? {
                        scan.skip_value().await?;
                    }
                }
            }
        }
        self.message.body_length = framing.body_length();
        Ok(())
    }
}

/// Determines the form of a request-target and the host it names.
fn classify_target(
    method: &Method,
    target: &str,
) -> Result<(TargetForm, Option<Authority>, Option<Uri>), MessageError> {
    if target == "*" {
        Ok((TargetForm::Asterisk, None, None))
    } else if target.starts_with('/') {
        Ok((TargetForm::Origin, None, None))
    } else if has_scheme(target) {
        let uri = Uri::from_str(target)
            .map_err(|_| MessageError::bad_request("invalid absolute-form target"))?;
        let host = Authority::from_absolute_uri(&uri)
            .map_err(|_| MessageError::bad_request("absolute-form target without host"))?;
        Ok((TargetForm::Absolute, Some(host), Some(uri)))
    } else {
        let default_port = if *method == Method::CONNECT { 443 } else { 80 };
        let host = Authority::with_default_port(target, default_port)
            .map_err(|_| MessageError::bad_request("invalid authority-form target"))?;
        Ok((TargetForm::Authority, Some(host), None))
    }
}

fn has_scheme(target: &str) -> bool {
    match target.split_once("://") {
        Some((scheme, _)) => {
            let mut chars = scheme.chars();
            chars.next().is_some_and(|c| c.is_ascii_alphabetic())
                && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
        }
        None => false,
    }
}
