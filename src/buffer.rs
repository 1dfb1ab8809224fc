//! Block-backed buffers for HTTP message headers and bodies.

use bytes::{Bytes, BytesMut};

pub use self::{
    body::{BODY_STREAM_THRESHOLD, BodyTier},
    header::HEADER_SECTION_MAX_LENGTH,
};
pub(crate) use self::{
    body::BodyBuffer,
    header::{HeaderBuffer, HeaderScan},
    scan::ScanBytes,
};

pub(crate) mod body;
pub(crate) mod header;
pub(crate) mod scan;

/// Half-open byte range `[start, end)` in the logical header stream.
///
/// Offsets count from the first byte of the start line, across block
/// boundaries. A zero-length span marks an insertion point.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, derive_more::Display)]
#[display("[{start}, {end})")]
pub struct Span {
    /// First byte of the range.
    pub start: usize,
    /// One past the last byte of the range.
    pub end: usize,
}

impl Span {
    /// The empty span at offset zero, used for "not present".
    pub const ZERO: Span = Span { start: 0, end: 0 };

    /// Creates a span. `end` is clamped so that the span is never inverted.
    pub fn new(start: usize, end: usize) -> Self {
        Self {
            start,
            end: end.max(start),
        }
    }

    /// Creates a zero-length insertion point at `offset`.
    pub fn at(offset: usize) -> Self {
        Self::new(offset, offset)
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

type Rewrite = Box<dyn Fn(&mut BytesMut) -> bool + Send + Sync>;

/// Replacement of a header span, applied when the message is written.
///
/// The rewrite function appends replacement bytes to the scratch buffer and
/// returns `true`, or returns `false` to let the original bytes through.
#[derive(derive_more::Debug)]
pub struct Modification {
    span: Span,
    #[debug("Fn(&mut BytesMut) -> bool")]
    rewrite: Rewrite,
}

impl Modification {
    /// Creates a modification with a custom rewrite function.
    pub fn new(
        span: Span,
        rewrite: impl Fn(&mut BytesMut) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            span,
            rewrite: Box::new(rewrite),
        }
    }

    /// Creates a modification that always replaces `span` with `bytes`.
    pub fn replace(span: Span, bytes: impl Into<Bytes>) -> Self {
        let bytes = bytes.into();
        Self::new(span, move |out| {
            out.extend_from_slice(&bytes);
            true
        })
    }

    pub fn span(&self) -> Span {
        self.span
    }

    pub(crate) fn apply(&self, out: &mut BytesMut) -> bool {
        (self.rewrite)(out)
    }
}
