//! Sans-I/O line and block reader.
//!
//! The driver feeds raw transport bytes in with [`LineReader::feed`] and asks
//! for either a single status line or a dot-terminated block. Nothing here
//! blocks: when the buffer does not yet hold what was asked for, the call
//! fails with [`ReadError::Incomplete`] and the caller must read more input.

use std::io::{self, Write};

use bytes::{Bytes, BytesMut};

use crate::Error;

/// Maximum line length to prevent memory exhaustion.
pub const MAX_LINE_LENGTH: usize = 1024 * 1024; // 1 MB

/// Maximum buffered block size.
pub const MAX_BLOCK_SIZE: usize = 64 * 1024 * 1024; // 64 MB

/// Errors produced by [`LineReader`].
#[derive(Debug, thiserror::Error)]
pub enum ReadError {
    /// Not enough buffered input; feed more bytes and retry.
    #[error("incomplete input")]
    Incomplete,

    /// A line exceeded [`MAX_LINE_LENGTH`] without a terminator.
    #[error("line too long")]
    LineTooLong,

    /// A buffered block exceeded [`MAX_BLOCK_SIZE`].
    #[error("block too large")]
    BlockTooLarge,

    /// The streamed-block sink failed.
    #[error("block sink error: {0}")]
    Sink(#[from] io::Error),
}

impl ReadError {
    /// Returns `true` if more input is needed.
    #[must_use]
    pub const fn is_incomplete(&self) -> bool {
        matches!(self, Self::Incomplete)
    }
}

impl From<ReadError> for Error {
    /// `Incomplete` only reaches this conversion when the transport has hit
    /// end of stream, so it maps to [`Error::ConnectionClosed`].
    fn from(err: ReadError) -> Self {
        match err {
            ReadError::Incomplete => Self::ConnectionClosed,
            ReadError::LineTooLong => Self::Malformed("line too long".to_string()),
            ReadError::BlockTooLarge => Self::Malformed(format!(
                "multi-line response exceeds {MAX_BLOCK_SIZE} bytes"
            )),
            ReadError::Sink(e) => Self::Io(e),
        }
    }
}

/// Incremental reader for POP3 responses.
#[derive(Debug, Default)]
pub struct LineReader {
    /// Unconsumed transport bytes.
    inbound: BytesMut,
    /// Block content accumulated so far by [`LineReader::read_block`].
    block: BytesMut,
    /// Bytes written so far by [`LineReader::read_block_into`].
    spooled: usize,
}

impl LineReader {
    /// Creates an empty reader.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends bytes received from the transport.
    pub fn feed(&mut self, data: &[u8]) {
        self.inbound.extend_from_slice(data);
    }

    /// Returns the number of received bytes not yet consumed.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.inbound.len()
    }

    /// Reads one line, stripped of its terminator.
    ///
    /// Invalid UTF-8 is replaced rather than rejected; status lines are
    /// ASCII in practice and the text is only used for display.
    ///
    /// # Errors
    ///
    /// [`ReadError::Incomplete`] if no full line is buffered yet,
    /// [`ReadError::LineTooLong`] if the pending line exceeds the limit.
    pub fn read_line(&mut self) -> Result<String, ReadError> {
        let line = self.take_line()?;
        Ok(String::from_utf8_lossy(&line).into_owned())
    }

    /// Reads a dot-terminated block into memory.
    ///
    /// Returns the block content with the terminator line removed, each line
    /// ending in CRLF and the leading-dot transparency undone. Partial
    /// progress is kept across `Incomplete` results.
    ///
    /// # Errors
    ///
    /// [`ReadError::Incomplete`] until the terminator line arrives,
    /// [`ReadError::BlockTooLarge`] if the block outgrows the limit.
    pub fn read_block(&mut self) -> Result<Bytes, ReadError> {
        loop {
            let line = self.take_line()?;
            if is_terminator(&line) {
                return Ok(std::mem::take(&mut self.block).freeze());
            }
            let line = unescape(&line);
            if self.block.len() + line.len() + 2 > MAX_BLOCK_SIZE {
                self.block.clear();
                return Err(ReadError::BlockTooLarge);
            }
            self.block.extend_from_slice(line);
            self.block.extend_from_slice(b"\r\n");
        }
    }

    /// Streams a dot-terminated block into `sink`.
    ///
    /// Every complete line is unescaped and written out as soon as it is
    /// available, so only the current line is ever held in memory. Returns
    /// the total number of bytes written once the terminator arrives.
    ///
    /// # Errors
    ///
    /// [`ReadError::Incomplete`] until the terminator line arrives,
    /// [`ReadError::Sink`] if writing to `sink` fails.
    pub fn read_block_into<W: Write + ?Sized>(&mut self, sink: &mut W) -> Result<usize, ReadError> {
        loop {
            let line = self.take_line()?;
            if is_terminator(&line) {
                return Ok(std::mem::take(&mut self.spooled));
            }
            let line = unescape(&line);
            sink.write_all(line)?;
            sink.write_all(b"\r\n")?;
            self.spooled += line.len() + 2;
        }
    }

    /// Splits the next line off the inbound buffer, without its terminator.
    ///
    /// CRLF is the protocol terminator; a bare LF is tolerated.
    fn take_line(&mut self) -> Result<BytesMut, ReadError> {
        let Some(pos) = self.inbound.iter().position(|&b| b == b'\n') else {
            if self.inbound.len() > MAX_LINE_LENGTH {
                return Err(ReadError::LineTooLong);
            }
            return Err(ReadError::Incomplete);
        };
        if pos > MAX_LINE_LENGTH {
            return Err(ReadError::LineTooLong);
        }

        let mut line = self.inbound.split_to(pos + 1);
        line.truncate(pos);
        if line.last() == Some(&b'\r') {
            line.truncate(pos - 1);
        }
        Ok(line)
    }
}

fn is_terminator(line: &[u8]) -> bool {
    line == b"."
}

/// Removes the transparency dot from a line that starts with `..`.
fn unescape(line: &[u8]) -> &[u8] {
    match line {
        [b'.', rest @ ..] => rest,
        _ => line,
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::redundant_clone,
    clippy::manual_string_new,
    clippy::needless_collect,
    clippy::unreadable_literal,
    clippy::used_underscore_items,
    clippy::similar_names
)]
mod tests {
    use super::*;

    #[test]
    fn test_read_line() {
        let mut reader = LineReader::new();
        reader.feed(b"+OK POP3 server ready\r\n");
        assert_eq!(reader.read_line().unwrap(), "+OK POP3 server ready");
        assert_eq!(reader.buffered(), 0);
    }

    #[test]
    fn test_read_line_incomplete_then_complete() {
        let mut reader = LineReader::new();
        reader.feed(b"+OK 2 3");
        assert!(reader.read_line().unwrap_err().is_incomplete());

        reader.feed(b"20\r\n-ERR");
        assert_eq!(reader.read_line().unwrap(), "+OK 2 320");
        assert!(reader.read_line().unwrap_err().is_incomplete());
        assert_eq!(reader.buffered(), 4);
    }

    #[test]
    fn test_read_line_bare_lf() {
        let mut reader = LineReader::new();
        reader.feed(b"+OK\n");
        assert_eq!(reader.read_line().unwrap(), "+OK");
    }

    #[test]
    fn test_read_block_unescapes_leading_dot() {
        let mut reader = LineReader::new();
        reader.feed(b"Subject: hi\r\n\r\n..hidden\r\n...\r\n.\r\n");
        let block = reader.read_block().unwrap();
        assert_eq!(&block[..], b"Subject: hi\r\n\r\n.hidden\r\n..\r\n");
    }

    #[test]
    fn test_read_block_across_chunks() {
        let mut reader = LineReader::new();
        reader.feed(b"1 whqtswO00WBw418f9t5JxYwZ\r\n2 QhdPYR:");
        assert!(reader.read_block().unwrap_err().is_incomplete());

        reader.feed(b"00WBw1Ph7x7\r\n.");
        assert!(reader.read_block().unwrap_err().is_incomplete());

        reader.feed(b"\r\n+OK next");
        let block = reader.read_block().unwrap();
        assert_eq!(
            &block[..],
            b"1 whqtswO00WBw418f9t5JxYwZ\r\n2 QhdPYR:00WBw1Ph7x7\r\n"
        );
        assert_eq!(reader.buffered(), 8);
    }

    #[test]
    fn test_read_empty_block() {
        let mut reader = LineReader::new();
        reader.feed(b".\r\n");
        assert!(reader.read_block().unwrap().is_empty());
    }

    #[test]
    fn test_read_block_into_streams_lines() {
        let mut reader = LineReader::new();
        let mut sink = Vec::new();

        reader.feed(b"From: a@example.com\r\n..dot\r\n");
        assert!(reader.read_block_into(&mut sink).unwrap_err().is_incomplete());
        // Complete lines are already written out before the terminator.
        assert_eq!(sink, b"From: a@example.com\r\n.dot\r\n");

        reader.feed(b"\r\n.\r\n");
        let written = reader.read_block_into(&mut sink).unwrap();
        assert_eq!(written, sink.len());
        assert_eq!(sink, b"From: a@example.com\r\n.dot\r\n\r\n");
    }

    #[test]
    fn test_line_length_limit() {
        let mut reader = LineReader::new();
        reader.feed("A".repeat(MAX_LINE_LENGTH + 100).as_bytes());
        assert!(matches!(reader.read_line(), Err(ReadError::LineTooLong)));
    }

    #[test]
    fn test_incomplete_maps_to_connection_closed() {
        let err: Error = ReadError::Incomplete.into();
        assert!(matches!(err, Error::ConnectionClosed));
    }

    mod dot_transparency {
        use super::*;
        use proptest::prelude::*;

        fn escape(lines: &[String]) -> Vec<u8> {
            let mut wire = Vec::new();
            for line in lines {
                if line.starts_with('.') {
                    wire.push(b'.');
                }
                wire.extend_from_slice(line.as_bytes());
                wire.extend_from_slice(b"\r\n");
            }
            wire.extend_from_slice(b".\r\n");
            wire
        }

        proptest! {
            #[test]
            fn escaped_lines_come_back_unchanged(
                lines in proptest::collection::vec("\\.{0,3}[a-zA-Z0-9 :]{0,20}", 0..20)
            ) {
                let mut reader = LineReader::new();
                reader.feed(&escape(&lines));
                let block = reader.read_block().unwrap();

                let mut expected = Vec::new();
                for line in &lines {
                    expected.extend_from_slice(line.as_bytes());
                    expected.extend_from_slice(b"\r\n");
                }
                prop_assert_eq!(&block[..], &expected[..]);
                prop_assert_eq!(reader.buffered(), 0);
            }
        }
    }
}
