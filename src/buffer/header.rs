use bytes::BytesMut;
use http::StatusCode;
use n0_error::e;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{
    Modification,
    scan::{COLON, CR, HTAB, SP, ScanBytes},
};
use crate::{
    error::MessageError,
    pool::{Block, BlockPool},
    util::Prebuffered,
};

/// Upper bound for the size of a header section.
pub const HEADER_SECTION_MAX_LENGTH: usize = 64 * 1024;

/// Keeps every byte of a message header in pooled blocks.
///
/// Blocks are only appended, never reused mid-message, so the header can be
/// written out again later with modifications merged in. Blocks before the
/// last one are always completely filled, which makes an absolute offset
/// `block_index * block_size + position`.
#[derive(Debug)]
pub(crate) struct HeaderBuffer {
    pool: BlockPool,
    blocks: Vec<Block>,
    /// Read cursor in the last block.
    next: usize,
    /// Fill limit of the last block.
    limit: usize,
}

impl HeaderBuffer {
    pub(crate) fn new(pool: BlockPool) -> Self {
        Self {
            pool,
            blocks: Vec::new(),
            next: 0,
            limit: 0,
        }
    }

    pub(crate) fn pool(&self) -> &BlockPool {
        &self.pool
    }

    /// Returns all blocks to the pool.
    pub(crate) fn reset(&mut self) {
        self.blocks.clear();
        self.next = 0;
        self.limit = 0;
    }

    /// Absolute offset of the read cursor.
    pub(crate) fn current_offset(&self) -> usize {
        match self.blocks.len() {
            0 => 0,
            n => (n - 1) * self.pool.block_size() + self.next,
        }
    }

    /// Bytes read from the input past the cursor.
    pub(crate) fn over_read(&self) -> &[u8] {
        match self.blocks.last() {
            Some(block) => &block[self.next..self.limit],
            None => &[],
        }
    }

    /// Unfilled room at the end of the last block.
    pub(crate) fn margin(&self) -> usize {
        match self.blocks.last() {
            Some(block) => block.len() - self.limit,
            None => 0,
        }
    }

    /// Reads until at least `len` bytes follow the cursor in the last block.
    ///
    /// `len` must not exceed `over_read().len() + margin()`.
    pub(crate) async fn fill_over_read<R>(
        &mut self,
        input: &mut Prebuffered<R>,
        len: usize,
    ) -> Result<(), MessageError>
    where
        R: AsyncRead + Unpin + Send,
    {
        let wanted = self.next + len;
        let Some(block) = self.blocks.last_mut() else {
            return Ok(());
        };
        while self.limit < wanted {
            let n = input.read(&mut block[self.limit..wanted]).await?;
            if n == 0 {
                return Err(MessageError::bad_request("unexpected end of stream in body"));
            }
            self.limit += n;
        }
        Ok(())
    }

    /// Keeps `keep` over-read bytes and pushes the rest back to `input`.
    pub(crate) fn unread_surplus<R>(&mut self, input: &mut Prebuffered<R>, keep: usize)
    where
        R: AsyncRead + Unpin,
    {
        let cut = (self.next + keep).min(self.limit);
        if let Some(block) = self.blocks.last() {
            input.unread(&block[cut..self.limit]);
        }
        self.limit = cut;
    }

    /// Forgets the over-read bytes after they were moved elsewhere.
    pub(crate) fn drop_over_read(&mut self) {
        self.limit = self.next;
    }

    /// Creates a cursor scanning this buffer, reading more from `input`.
    pub(crate) fn scan<'a, R>(&'a mut self, input: &'a mut Prebuffered<R>) -> HeaderScan<'a, R> {
        HeaderScan { buf: self, input }
    }

    /// Writes the retained header to `output`, merging in `modifications`.
    ///
    /// The modifications have to be sorted and must not overlap. For each one
    /// the bytes before its span are copied, then the rewrite function runs:
    /// if it applied, the original span is skipped, otherwise it is copied as
    /// well.
    pub(crate) async fn write_header<W>(
        &self,
        output: &mut W,
        modifications: &[Modification],
    ) -> Result<(), MessageError>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let total = self.current_offset();
        let mut scratch = BytesMut::new();
        let mut written = 0;
        let mut prev_end = 0;
        for modification in modifications {
            let span = modification.span();
            if span.start < prev_end {
                return Err(e!(MessageError::SpanConflict { span }));
            }
            if span.start > total {
                break;
            }
            self.write_range(output, written, span.start).await?;
            written = span.start;
            scratch.clear();
            if modification.apply(&mut scratch) {
                output.write_all(&scratch).await?;
                written = span.end.min(total);
            }
            prev_end = span.end;
        }
        self.write_range(output, written, total).await?;
        Ok(())
    }

    async fn write_range<W>(&self, output: &mut W, start: usize, end: usize) -> Result<(), MessageError>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let block_size = self.pool.block_size();
        let mut offset = start;
        while offset < end {
            let index = offset / block_size;
            let within = offset % block_size;
            let chunk_end = ((index + 1) * block_size).min(end);
            let block = &self.blocks[index];
            output
                .write_all(&block[within..within + (chunk_end - offset)])
                .await?;
            offset = chunk_end;
        }
        Ok(())
    }

    async fn fill<R>(&mut self, input: &mut Prebuffered<R>) -> Result<(), MessageError>
    where
        R: AsyncRead + Unpin + Send,
    {
        let full = self
            .blocks
            .last()
            .is_none_or(|block| self.limit == block.len());
        if full {
            if self.blocks.len() * self.pool.block_size() >= HEADER_SECTION_MAX_LENGTH {
                return Err(e!(MessageError::Malformed {
                    status: StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE,
                    reason: "header section too large"
                }));
            }
            self.blocks.push(self.pool.alloc());
            self.next = 0;
            self.limit = 0;
        }
        let started = self.blocks.len() > 1 || self.limit > 0;
        let Some(block) = self.blocks.last_mut() else {
            return Err(MessageError::invalid_state(Default::default()));
        };
        let n = input.read(&mut block[self.limit..]).await?;
        if n == 0 {
            return Err(if started {
                MessageError::bad_request("unexpected end of stream in header")
            } else {
                e!(MessageError::StreamEnded)
            });
        }
        self.limit += n;
        Ok(())
    }
}

/// Line-oriented parser over a [`HeaderBuffer`].
pub(crate) struct HeaderScan<'a, R> {
    buf: &'a mut HeaderBuffer,
    input: &'a mut Prebuffered<R>,
}

/// Result of scanning the start of a header field line.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum FieldLine {
    /// The empty line terminating the header section.
    End,
    /// A field whose name does not start with an interesting letter; the
    /// whole line was skipped.
    Skipped,
    /// A field of interest. The cursor is positioned after the colon.
    Named { name: String, start: usize },
}

impl<R: AsyncRead + Unpin + Send> ScanBytes for HeaderScan<'_, R> {
    async fn next_byte(&mut self) -> Result<u8, MessageError> {
        if self.buf.next == self.buf.limit {
            self.buf.fill(self.input).await?;
        }
        let Some(block) = self.buf.blocks.last() else {
            return Err(MessageError::invalid_state(Default::default()));
        };
        let byte = block[self.buf.next];
        self.buf.next += 1;
        Ok(byte)
    }
}

impl<R: AsyncRead + Unpin + Send> HeaderScan<'_, R> {
    pub(crate) fn current_offset(&self) -> usize {
        self.buf.current_offset()
    }

    /// Reads one space separated start-line token.
    ///
    /// The last token runs to the end of the line; any other token hitting
    /// CRLF is an error.
    pub(crate) async fn read_item(&mut self, last: bool) -> Result<String, MessageError> {
        let mut item = String::new();
        let delimiters: &[u8] = if last { &[] } else { &[SP] };
        let eol = self.read_ascii_to(delimiters, &mut item, false).await?;
        if !last && eol {
            return Err(MessageError::bad_request("start line is missing tokens"));
        }
        Ok(item)
    }

    /// Like [`HeaderScan::read_item`] without keeping the token.
    pub(crate) async fn skip_item(&mut self, last: bool) -> Result<(), MessageError> {
        if last {
            self.skip_to_crlf().await?;
        } else if self.skip_to(&[SP]).await? {
            return Err(MessageError::bad_request("start line is missing tokens"));
        }
        Ok(())
    }

    /// Scans the start of the next field line.
    ///
    /// Only names whose first letter (case folded) is in `interest` are read;
    /// other lines are skipped without allocating.
    pub(crate) async fn next_field(&mut self, interest: &[u8]) -> Result<FieldLine, MessageError> {
        let start = self.current_offset();
        let first = self.next_byte().await?;
        if first == CR {
            self.expect_lf().await?;
            return Ok(FieldLine::End);
        }
        if first == COLON {
            return Err(MessageError::bad_request("empty field name"));
        }
        let first = first.to_ascii_lowercase();
        if !interest.contains(&first) {
            self.skip_to_crlf().await?;
            return Ok(FieldLine::Skipped);
        }
        let mut name = String::from(char::from(first));
        if self.read_ascii_to(&[COLON], &mut name, true).await? {
            return Err(MessageError::bad_request("field line without colon"));
        }
        if name.bytes().any(|b| b == SP || b == HTAB) {
            return Err(MessageError::bad_request("whitespace in field name"));
        }
        Ok(FieldLine::Named { name, start })
    }

    /// Reads a field value up to the end of its line.
    pub(crate) async fn read_value(&mut self) -> Result<String, MessageError> {
        let mut value = String::new();
        self.read_ascii_to(&[], &mut value, false).await?;
        Ok(value)
    }

    pub(crate) async fn skip_value(&mut self) -> Result<(), MessageError> {
        self.skip_to_crlf().await?;
        Ok(())
    }
}
