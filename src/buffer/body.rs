use std::io::SeekFrom;

use tokio::{
    fs::File,
    io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWrite, AsyncWriteExt},
};

use super::{
    header::HeaderBuffer,
    scan::{CR, HTAB, LF, SEMICOLON, SP, ScanBytes},
};
use crate::{
    error::MessageError,
    message::BodyLength,
    pool::{Block, BlockPool},
    util::Prebuffered,
};

/// Bodies up to this length are kept in memory, longer ones go to a temp file.
pub const BODY_STREAM_THRESHOLD: u64 = 1024 * 1024;

/// Storage medium chosen for a retained body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyTier {
    /// Nothing retained.
    None,
    /// A sub-range of the last header block.
    HeaderRemainder,
    /// One pooled block.
    Block,
    /// A heap buffer.
    Memory,
    /// An anonymous temporary file.
    TempFile,
}

#[derive(Debug, Default)]
enum BodyStore {
    #[default]
    None,
    HeaderRemainder {
        len: usize,
    },
    Block {
        block: Block,
        len: usize,
    },
    Memory(Vec<u8>),
    TempFile(File),
}

impl BodyStore {
    fn for_length(length: u64, pool: &BlockPool) -> Result<Self, MessageError> {
        Ok(if length <= pool.block_size() as u64 {
            BodyStore::Block {
                block: pool.alloc(),
                len: 0,
            }
        } else if length <= BODY_STREAM_THRESHOLD {
            BodyStore::Memory(Vec::with_capacity(length as usize))
        } else {
            temp_file()?
        })
    }

    async fn append(&mut self, bytes: &[u8]) -> Result<(), MessageError> {
        match self {
            BodyStore::None | BodyStore::HeaderRemainder { .. } => {}
            BodyStore::Block { block, len } => {
                let end = *len + bytes.len();
                if end > block.len() {
                    return Err(MessageError::bad_request("body longer than declared"));
                }
                block[*len..end].copy_from_slice(bytes);
                *len = end;
            }
            BodyStore::Memory(buf) => buf.extend_from_slice(bytes),
            BodyStore::TempFile(file) => file.write_all(bytes).await?,
        }
        Ok(())
    }

    fn tier(&self) -> BodyTier {
        match self {
            BodyStore::None => BodyTier::None,
            BodyStore::HeaderRemainder { .. } => BodyTier::HeaderRemainder,
            BodyStore::Block { .. } => BodyTier::Block,
            BodyStore::Memory(_) => BodyTier::Memory,
            BodyStore::TempFile(_) => BodyTier::TempFile,
        }
    }
}

fn temp_file() -> Result<BodyStore, MessageError> {
    let file = tempfile::tempfile()?;
    Ok(BodyStore::TempFile(File::from_std(file)))
}

/// A message body, stored in the tier its length calls for.
#[derive(Debug, Default)]
pub(crate) struct BodyBuffer {
    store: BodyStore,
    length: u64,
}

impl BodyBuffer {
    pub(crate) fn reset(&mut self) {
        self.store = BodyStore::None;
        self.length = 0;
    }

    pub(crate) fn tier(&self) -> BodyTier {
        self.store.tier()
    }

    /// Number of body bytes transferred, chunk framing included.
    pub(crate) fn len(&self) -> u64 {
        self.length
    }

    /// Consumes a body from `input`.
    ///
    /// Body bytes already read into `header` are taken first. Bytes are
    /// copied to `forward` as they arrive; with `retain` they are also kept
    /// for [`BodyBuffer::write_body`]. Input past the end of the body is
    /// pushed back for the next message.
    pub(crate) async fn transfer<R, W>(
        &mut self,
        header: &mut HeaderBuffer,
        input: &mut Prebuffered<R>,
        length: BodyLength,
        forward: Option<&mut W>,
        retain: bool,
    ) -> Result<(), MessageError>
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send,
    {
        self.reset();
        match length {
            BodyLength::Length(len) => {
                self.transfer_length(header, input, len, forward, retain)
                    .await
            }
            BodyLength::Chunked => self.transfer_chunked(header, input, forward, retain).await,
        }
    }

    async fn transfer_length<R, W>(
        &mut self,
        header: &mut HeaderBuffer,
        input: &mut Prebuffered<R>,
        length: u64,
        mut forward: Option<&mut W>,
        retain: bool,
    ) -> Result<(), MessageError>
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send,
    {
        let over_read = header.over_read().len();
        if length <= (over_read + header.margin()) as u64 {
            let len = length as usize;
            header.fill_over_read(input, len).await?;
            header.unread_surplus(input, len);
            if let Some(out) = forward.as_deref_mut() {
                out.write_all(header.over_read()).await?;
                out.flush().await?;
            }
            self.length = length;
            if retain && len > 0 {
                self.store = BodyStore::HeaderRemainder { len };
            }
            return Ok(());
        }

        // Everything over-read belongs to this body.
        let store = if retain {
            BodyStore::for_length(length, header.pool())?
        } else {
            BodyStore::None
        };
        let mut spool = Spool {
            forward,
            store,
            length: 0,
        };
        spool.put(header.over_read()).await?;
        header.drop_over_read();

        let mut scratch = header.pool().alloc();
        let mut remaining = length - over_read as u64;
        while remaining > 0 {
            let want = remaining.min(scratch.len() as u64) as usize;
            let n = input.read(&mut scratch[..want]).await?;
            if n == 0 {
                return Err(MessageError::bad_request("unexpected end of stream in body"));
            }
            spool.put(&scratch[..n]).await?;
            remaining -= n as u64;
        }
        self.finish(spool).await
    }

    async fn transfer_chunked<R, W>(
        &mut self,
        header: &mut HeaderBuffer,
        input: &mut Prebuffered<R>,
        forward: Option<&mut W>,
        retain: bool,
    ) -> Result<(), MessageError>
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send,
    {
        // The final length is unknown, so a retained copy goes to a file.
        let store = if retain { temp_file()? } else { BodyStore::None };
        let mut block = header.pool().alloc();
        let over_read = header.over_read();
        let limit = over_read.len().min(block.len());
        block[..limit].copy_from_slice(&over_read[..limit]);
        header.drop_over_read();

        let mut scan = ChunkScan {
            input,
            spool: Spool {
                forward,
                store,
                length: 0,
            },
            block,
            next: 0,
            limit,
            flushed: 0,
        };
        scan.run().await?;
        let ChunkScan {
            input,
            spool,
            block,
            next,
            limit,
            ..
        } = scan;
        input.unread(&block[next..limit]);
        self.finish(spool).await
    }

    async fn finish<W>(&mut self, spool: Spool<'_, W>) -> Result<(), MessageError>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let Spool {
            forward,
            mut store,
            length,
        } = spool;
        if let Some(out) = forward {
            out.flush().await?;
        }
        if let BodyStore::TempFile(file) = &mut store {
            file.flush().await?;
        }
        self.store = store;
        self.length = length;
        Ok(())
    }

    /// Writes the retained body to `output`.
    ///
    /// `header` must be the buffer the body was read with, since the
    /// smallest bodies live in its last block.
    pub(crate) async fn write_body<W>(
        &mut self,
        header: &HeaderBuffer,
        output: &mut W,
    ) -> Result<(), MessageError>
    where
        W: AsyncWrite + Unpin + Send,
    {
        match &mut self.store {
            BodyStore::None => {}
            BodyStore::HeaderRemainder { len } => {
                output.write_all(&header.over_read()[..*len]).await?
            }
            BodyStore::Block { block, len } => output.write_all(&block[..*len]).await?,
            BodyStore::Memory(buf) => output.write_all(buf).await?,
            BodyStore::TempFile(file) => {
                file.seek(SeekFrom::Start(0)).await?;
                let copied = tokio::io::copy(&mut (&mut *file).take(self.length), output).await?;
                if copied != self.length {
                    return Err(MessageError::bad_request("retained body was truncated"));
                }
            }
        }
        output.flush().await?;
        Ok(())
    }
}

/// Copies transferred body bytes to the forward sink and the store.
struct Spool<'a, W> {
    forward: Option<&'a mut W>,
    store: BodyStore,
    length: u64,
}

impl<W: AsyncWrite + Unpin + Send> Spool<'_, W> {
    async fn put(&mut self, bytes: &[u8]) -> Result<(), MessageError> {
        if bytes.is_empty() {
            return Ok(());
        }
        if let Some(out) = self.forward.as_deref_mut() {
            out.write_all(bytes).await?;
        }
        self.store.append(bytes).await?;
        self.length += bytes.len() as u64;
        Ok(())
    }
}

/// Decodes chunked transfer coding while passing the raw bytes through.
///
/// Only one block is held. Scanned bytes are flushed to the spool before the
/// block is refilled and at every chunk boundary.
struct ChunkScan<'a, R, W> {
    input: &'a mut Prebuffered<R>,
    spool: Spool<'a, W>,
    block: Block,
    next: usize,
    limit: usize,
    flushed: usize,
}

impl<R, W> ScanBytes for ChunkScan<'_, R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    async fn next_byte(&mut self) -> Result<u8, MessageError> {
        if self.next == self.limit {
            self.refill().await?;
        }
        let byte = self.block[self.next];
        self.next += 1;
        Ok(byte)
    }
}

impl<R, W> ChunkScan<'_, R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    async fn run(&mut self) -> Result<(), MessageError> {
        let mut size_line = String::new();
        loop {
            size_line.clear();
            let eol = self
                .read_ascii_to(&[SP, HTAB, SEMICOLON], &mut size_line, false)
                .await?;
            if !eol {
                // chunk-ext
                self.skip_to_crlf().await?;
            }
            let size = u64::from_str_radix(&size_line, 16)
                .map_err(|_| MessageError::bad_request("invalid chunk size"))?;
            if size == 0 {
                break;
            }
            self.skip(size).await?;
            if self.next_byte().await? != CR || self.next_byte().await? != LF {
                return Err(MessageError::bad_request("chunk data not followed by CRLF"));
            }
            self.flush().await?;
        }
        // trailer section up to the empty line
        while !self.skip_to_crlf().await? {}
        self.flush().await
    }

    async fn skip(&mut self, mut remaining: u64) -> Result<(), MessageError> {
        while remaining > 0 {
            if self.next == self.limit {
                self.refill().await?;
            }
            let step = remaining.min((self.limit - self.next) as u64);
            self.next += step as usize;
            remaining -= step;
        }
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), MessageError> {
        self.spool.put(&self.block[self.flushed..self.next]).await?;
        self.flushed = self.next;
        Ok(())
    }

    async fn refill(&mut self) -> Result<(), MessageError> {
        self.flush().await?;
        self.next = 0;
        self.limit = 0;
        self.flushed = 0;
        let n = self.input.read(&mut self.block[..]).await?;
        if n == 0 {
            return Err(MessageError::bad_request(
                "unexpected end of stream in chunked body",
            ));
        }
        self.limit = n;
        Ok(())
    }
}
