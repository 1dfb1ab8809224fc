//! HTTP/1.x messages parsed from and written to byte streams.
//!
//! A [`Message`] keeps the raw header bytes and records only what a proxy
//! needs: framing, a few field positions and the version. Rewriting is done
//! by registering [`Modification`]s over spans of the raw header, applied
//! when the message is written out.

use http::Version;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, Sink};

pub use self::{
    request::{Request, TargetForm},
    response::Response,
};
use crate::{
    buffer::{BodyBuffer, BodyTier, HeaderBuffer, HeaderScan, Modification, Span},
    error::MessageError,
    parse::{is_chunked, parse_content_length},
    pool::BlockPool,
    util::Prebuffered,
};

mod request;
mod response;

/// First letters of the framing fields every message kind scans.
const FRAMING_FIELD_LETTERS: &[u8] = b"ct";

/// Progress of reading a message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReadingState {
    /// Nothing read yet.
    #[default]
    None,
    /// The header is read, the body is still on the input.
    Header,
    /// The whole message is read and retained.
    Body,
    /// The body was streamed to another output and is not retained.
    BodyRedirected,
    /// Reading failed. The message must be reset before reuse.
    Error,
}

/// How the end of a body is determined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyLength {
    /// A body of exactly this many bytes.
    Length(u64),
    /// A body in chunked transfer coding.
    Chunked,
}

impl Default for BodyLength {
    fn default() -> Self {
        BodyLength::Length(0)
    }
}

/// State and buffers shared by requests and responses.
#[derive(Debug)]
pub struct Message {
    header: HeaderBuffer,
    body: BodyBuffer,
    modifications: Vec<Modification>,
    state: ReadingState,
    version: Version,
    body_length: BodyLength,
    end_of_header: Span,
}

impl Message {
    pub(crate) fn new(pool: BlockPool) -> Self {
        Self {
            header: HeaderBuffer::new(pool),
            body: BodyBuffer::default(),
            modifications: Vec::new(),
            state: ReadingState::None,
            version: Version::HTTP_11,
            body_length: BodyLength::default(),
            end_of_header: Span::ZERO,
        }
    }

    /// Clears the message and returns its blocks to the pool.
    pub fn reset(&mut self) {
        self.header.reset();
        self.body.reset();
        self.modifications.clear();
        self.state = ReadingState::None;
        self.version = Version::HTTP_11;
        self.body_length = BodyLength::default();
        self.end_of_header = Span::ZERO;
    }

    pub fn reading_state(&self) -> ReadingState {
        self.state
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn body_length(&self) -> BodyLength {
        self.body_length
    }

    /// Insertion point just before the empty line ending the header.
    pub fn end_of_header_fields(&self) -> Span {
        self.end_of_header
    }

    /// Length of the header section including the terminating empty line.
    pub fn header_len(&self) -> usize {
        self.header.current_offset()
    }

    /// Storage tier of the retained body.
    pub fn body_tier(&self) -> BodyTier {
        self.body.tier()
    }

    /// Number of body bytes read, including chunk framing.
    pub fn body_len(&self) -> u64 {
        self.body.len()
    }

    pub fn modifications(&self) -> &[Modification] {
        &self.modifications
    }

    /// Registers a modification, keeping the list sorted.
    ///
    /// Fails if the span overlaps an existing modification. Spans that only
    /// touch at a boundary are fine, and zero-length spans at the same
    /// offset are written in the order they were added.
    pub fn add_modification(&mut self, modification: Modification) -> Result<(), MessageError> {
        let span = modification.span();
        let mut index = self.modifications.len();
        for (i, existing) in self.modifications.iter().enumerate() {
            let other = existing.span();
            if span.end < other.start {
                index = i;
                break;
            } else if span.end == other.start {
                if !other.is_empty() || !span.is_empty() {
                    index = i;
                    break;
                }
            } else if span.start < other.end {
                return Err(n0_error::e!(MessageError::SpanConflict { span }));
            }
        }
        self.modifications.insert(index, modification);
        Ok(())
    }

    pub fn clear_modifications(&mut self) {
        self.modifications.clear();
    }

    /// Reads the body into tiered storage.
    pub async fn read_body<R>(&mut self, input: &mut Prebuffered<R>) -> Result<(), MessageError>
    where
        R: AsyncRead + Unpin + Send,
    {
        self.expect_state(ReadingState::Header)?;
        let result = self
            .body
            .transfer(
                &mut self.header,
                input,
                self.body_length,
                None::<&mut Sink>,
                true,
            )
            .await;
        self.settle(result, ReadingState::Body)
    }

    /// Writes the header with modifications applied and streams the body
    /// from `input` to `output` without retaining it.
    pub async fn redirect<R, W>(
        &mut self,
        output: &mut W,
        input: &mut Prebuffered<R>,
    ) -> Result<(), MessageError>
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send,
    {
        self.redirect_inner(output, input, false).await
    }

    /// Like [`Message::redirect`], but keeps a copy of the body so that the
    /// message can be written again with [`Message::write`].
    pub async fn redirect_and_retain<R, W>(
        &mut self,
        output: &mut W,
        input: &mut Prebuffered<R>,
    ) -> Result<(), MessageError>
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send,
    {
        self.redirect_inner(output, input, true).await
    }

    async fn redirect_inner<R, W>(
        &mut self,
        output: &mut W,
        input: &mut Prebuffered<R>,
        retain: bool,
    ) -> Result<(), MessageError>
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send,
    {
        self.expect_state(ReadingState::Header)?;
        let result = async {
            self.header
                .write_header(output, &self.modifications)
                .await?;
            self.body
                .transfer(
                    &mut self.header,
                    input,
                    self.body_length,
                    Some(output),
                    retain,
                )
                .await
        }
        .await;
        let state = if retain {
            ReadingState::Body
        } else {
            ReadingState::BodyRedirected
        };
        self.settle(result, state)
    }

    /// Writes a fully read message.
    ///
    /// With `suppress_modification` the original header bytes are written.
    pub async fn write<W>(
        &mut self,
        output: &mut W,
        suppress_modification: bool,
    ) -> Result<(), MessageError>
    where
        W: AsyncWrite + Unpin + Send,
    {
        self.expect_state(ReadingState::Body)?;
        let modifications: &[Modification] = if suppress_modification {
            &[]
        } else {
            &self.modifications
        };
        self.header.write_header(output, modifications).await?;
        self.body.write_body(&self.header, output).await?;
        output.flush().await?;
        Ok(())
    }

    /// Prepares for reading a new header.
    fn begin_header(&mut self) -> Result<(), MessageError> {
        if matches!(self.state, ReadingState::Header | ReadingState::Error) {
            return Err(MessageError::invalid_state(self.state));
        }
        self.reset();
        Ok(())
    }

    /// Records the outcome of scanning a header.
    ///
    /// Returns `Ok(false)` if the input ended before the message started.
    fn finish_header(&mut self, result: Result<(), MessageError>) -> Result<bool, MessageError> {
        match result {
            Ok(()) => {
                self.end_of_header = Span::at(self.header.current_offset() - 2);
                self.state = ReadingState::Header;
                Ok(true)
            }
            Err(err) if err.is_stream_ended() => {
                self.state = ReadingState::None;
                Ok(false)
            }
            Err(err) => {
                self.state = ReadingState::Error;
                Err(err)
            }
        }
    }

    fn expect_state(&self, state: ReadingState) -> Result<(), MessageError> {
        if self.state != state {
            return Err(MessageError::invalid_state(self.state));
        }
        Ok(())
    }

    fn settle(
        &mut self,
        result: Result<(), MessageError>,
        state: ReadingState,
    ) -> Result<(), MessageError> {
        self.state = match result {
            Ok(()) => state,
            Err(_) => ReadingState::Error,
        };
        result
    }
}

/// Framing fields seen in one header section.
#[derive(Debug, Default)]
struct Framing {
    content_length: Option<u64>,
    chunked: bool,
}

impl Framing {
    /// Handles the fields that determine body framing.
    ///
    /// Returns `false` if `name` is not a framing field, in which case the
    /// value is still unread.
    async fn scan_field<R>(
        &mut self,
        scan: &mut HeaderScan<'_, R>,
        name: &str,
    ) -> Result<bool, MessageError>
    where
        R: AsyncRead + Unpin + Send,
    {
        match name {
            "content-length" => {
                let value = scan.read_value().await?;
                let len = parse_content_length(&value)
                    .ok_or_else(|| MessageError::bad_request("invalid Content-Length"))?;
                if self.content_length.is_some_and(|prev| prev != len) {
                    return Err(MessageError::bad_request("conflicting Content-Length"));
                }
                self.content_length = Some(len);
            }
            "transfer-encoding" => {
                if is_chunked(&scan.read_value().await?) {
                    self.chunked = true;
                }
            }
            _ => return Ok(false),
        }
        Ok(true)
    }

    /// Chunked coding overrides any Content-Length.
    fn body_length(&self) -> BodyLength {
        if self.chunked {
            BodyLength::Chunked
        } else {
            BodyLength::Length(self.content_length.unwrap_or(0))
        }
    }
}
