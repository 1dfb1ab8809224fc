use std::future::Future;

use crate::error::MessageError;

pub(crate) const CR: u8 = b'\r';
pub(crate) const LF: u8 = b'\n';
pub(crate) const SP: u8 = b' ';
pub(crate) const HTAB: u8 = b'\t';
pub(crate) const COLON: u8 = b':';
pub(crate) const SEMICOLON: u8 = b';';

/// Byte cursor over a block-buffered input.
///
/// Implementors only provide [`ScanBytes::next_byte`], which pulls more input
/// from the socket when the current block is exhausted. Line handling is
/// shared: every CR must be followed by LF, and CRLF always terminates the
/// token being scanned.
pub(crate) trait ScanBytes: Send {
    /// Returns the next byte, reading from the input if needed.
    fn next_byte(&mut self) -> impl Future<Output = Result<u8, MessageError>> + Send;

    /// Consumes the LF that has to follow a CR.
    fn expect_lf(&mut self) -> impl Future<Output = Result<(), MessageError>> + Send {
        async move {
            match self.next_byte().await? {
                LF => Ok(()),
                _ => Err(MessageError::bad_request("CR not followed by LF")),
            }
        }
    }

    /// Appends bytes to `sink` up to one of `delimiters` or the end of line.
    ///
    /// Returns `true` if the scan stopped at CRLF. The delimiter is consumed
    /// but not copied.
    fn read_ascii_to(
        &mut self,
        delimiters: &[u8],
        sink: &mut String,
        decapitalize: bool,
    ) -> impl Future<Output = Result<bool, MessageError>> + Send {
        async move {
            loop {
                let byte = self.next_byte().await?;
                if byte == CR {
                    self.expect_lf().await?;
                    return Ok(true);
                }
                if delimiters.contains(&byte) {
                    return Ok(false);
                }
                let byte = if decapitalize {
                    byte.to_ascii_lowercase()
                } else {
                    byte
                };
                sink.push(char::from(byte));
            }
        }
    }

    /// Like [`ScanBytes::read_ascii_to`] without copying.
    fn skip_to(&mut self, delimiters: &[u8]) -> impl Future<Output = Result<bool, MessageError>> + Send {
        async move {
            loop {
                let byte = self.next_byte().await?;
                if byte == CR {
                    self.expect_lf().await?;
                    return Ok(true);
                }
                if delimiters.contains(&byte) {
                    return Ok(false);
                }
            }
        }
    }

    /// Skips the rest of the current line, including its CRLF.
    ///
    /// Returns `true` if the line was empty.
    fn skip_to_crlf(&mut self) -> impl Future<Output = Result<bool, MessageError>> + Send {
        async move {
            let mut empty = true;
            loop {
                if self.next_byte().await? == CR {
                    self.expect_lf().await?;
                    return Ok(empty);
                }
                empty = false;
            }
        }
    }
}
