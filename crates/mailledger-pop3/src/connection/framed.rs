//! Framed I/O for the POP3 protocol.
//!
//! Pulls transport bytes into a [`LineReader`] until it can produce the
//! status line or dot-terminated block the session asks for, and writes
//! command lines. Every read and write is bounded by the I/O timeout.

#![allow(clippy::missing_errors_doc)]

use std::future::Future;
use std::io::Write;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::protocol::{LineReader, ReadError, Transmit};
use crate::{Error, Result};

/// Default buffer size for reading.
const DEFAULT_BUFFER_SIZE: usize = 8192;

/// Framed connection for the POP3 protocol.
pub struct FramedStream<S> {
    stream: S,
    reader: LineReader,
    read_buffer: BytesMut,
    io_timeout: Duration,
}

impl<S> FramedStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Creates a new framed stream.
    pub fn new(stream: S, io_timeout: Duration) -> Self {
        Self {
            stream,
            reader: LineReader::new(),
            read_buffer: BytesMut::with_capacity(DEFAULT_BUFFER_SIZE),
            io_timeout,
        }
    }

    /// Reads one status line, terminator stripped.
    pub async fn read_line(&mut self) -> Result<String> {
        let line = loop {
            match self.reader.read_line() {
                Ok(line) => break line,
                Err(ReadError::Incomplete) => self.fill().await?,
                Err(e) => return Err(e.into()),
            }
        };
        tracing::debug!("POP3< {line}");
        Ok(line)
    }

    /// Reads a dot-terminated block into memory.
    pub async fn read_block(&mut self) -> Result<Bytes> {
        loop {
            match self.reader.read_block() {
                Ok(block) => {
                    tracing::trace!(len = block.len(), "POP3< block");
                    return Ok(block);
                }
                Err(ReadError::Incomplete) => self.fill().await?,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Streams a dot-terminated block into `sink` as it arrives.
    ///
    /// Returns the number of bytes written.
    pub async fn read_block_into<W: Write + ?Sized>(&mut self, sink: &mut W) -> Result<usize> {
        loop {
            match self.reader.read_block_into(sink) {
                Ok(len) => {
                    tracing::trace!(len, "POP3< spooled block");
                    return Ok(len);
                }
                Err(ReadError::Incomplete) => self.fill().await?,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Writes a command to the stream.
    pub async fn write_command(&mut self, transmit: &Transmit) -> Result<()> {
        tracing::debug!("POP3> {transmit}");
        let io_timeout = self.io_timeout;
        let stream = &mut self.stream;
        with_timeout(io_timeout, async {
            stream.write_all(transmit.data()).await?;
            stream.flush().await?;
            Ok::<_, Error>(())
        })
        .await
    }

    /// Shuts the write half down.
    pub async fn shutdown(&mut self) -> Result<()> {
        with_timeout(self.io_timeout, async {
            self.stream.shutdown().await?;
            Ok::<_, Error>(())
        })
        .await
    }

    /// Consumes the framed stream and returns the inner stream.
    ///
    /// Fails if the server sent data that was not consumed yet; after STLS
    /// anything received in plaintext must not survive into the TLS session.
    pub fn into_inner(self) -> Result<S> {
        if self.reader.buffered() > 0 {
            return Err(Error::ProtocolViolation(format!(
                "{} bytes received ahead of TLS negotiation",
                self.reader.buffered()
            )));
        }
        Ok(self.stream)
    }

    /// Reads more transport bytes into the line reader.
    async fn fill(&mut self) -> Result<()> {
        self.read_buffer.clear();
        let read = with_timeout(self.io_timeout, async {
            Ok::<_, Error>(self.stream.read_buf(&mut self.read_buffer).await?)
        })
        .await?;
        if read == 0 {
            return Err(Error::ConnectionClosed);
        }
        self.reader.feed(&self.read_buffer);
        Ok(())
    }
}

async fn with_timeout<T>(limit: Duration, fut: impl Future<Output = Result<T>>) -> Result<T> {
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| Error::Timeout(limit))?
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
    use crate::command::Command;
    use tokio_test::io::Builder;

    const TIMEOUT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn test_framed_read_simple_line() {
        let mock = Builder::new().read(b"+OK ready\r\n").build();
        let mut framed = FramedStream::new(mock, TIMEOUT);
        let line = framed.read_line().await.unwrap();
        assert_eq!(line, "+OK ready");
    }

    #[tokio::test]
    async fn test_framed_read_line_split_across_reads() {
        let mock = Builder::new()
            .read(b"+OK 2 3")
            .read(b"20\r")
            .read(b"\n")
            .build();
        let mut framed = FramedStream::new(mock, TIMEOUT);
        assert_eq!(framed.read_line().await.unwrap(), "+OK 2 320");
    }

    #[tokio::test]
    async fn test_framed_read_block() {
        let mock = Builder::new()
            .read(b"+OK\r\n1 abc\r\n")
            .read(b"2 def\r\n.\r\n")
            .build();
        let mut framed = FramedStream::new(mock, TIMEOUT);
        assert_eq!(framed.read_line().await.unwrap(), "+OK");
        let block = framed.read_block().await.unwrap();
        assert_eq!(&block[..], b"1 abc\r\n2 def\r\n");
    }

    #[tokio::test]
    async fn test_framed_read_block_into() {
        let mock = Builder::new()
            .read(b"Subject: hi\r\n\r\n..dot\r\n.\r\n")
            .build();
        let mut framed = FramedStream::new(mock, TIMEOUT);
        let mut sink = Vec::new();
        let len = framed.read_block_into(&mut sink).await.unwrap();
        assert_eq!(sink, b"Subject: hi\r\n\r\n.dot\r\n");
        assert_eq!(len, sink.len());
    }

    #[tokio::test]
    async fn test_framed_eof_is_connection_closed() {
        let mock = Builder::new().read(b"+OK partial").build();
        let mut framed = FramedStream::new(mock, TIMEOUT);
        assert!(matches!(
            framed.read_line().await,
            Err(Error::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_framed_write_command() {
        let mock = Builder::new().write(b"TOP 1 0\r\n").build();
        let mut framed = FramedStream::new(mock, TIMEOUT);
        framed
            .write_command(&Transmit::new(Command::Top { msg: 1, lines: 0 }))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_into_inner_rejects_buffered_data() {
        let mock = Builder::new().read(b"+OK begin TLS\r\n-ERR injected\r\n").build();
        let mut framed = FramedStream::new(mock, TIMEOUT);
        framed.read_line().await.unwrap();
        assert!(matches!(
            framed.into_inner(),
            Err(Error::ProtocolViolation(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_framed_read_timeout() {
        let mock = Builder::new().wait(Duration::from_secs(10)).build();
        let mut framed = FramedStream::new(mock, TIMEOUT);
        assert!(matches!(
            framed.read_line().await,
            Err(Error::Timeout(t)) if t == TIMEOUT
        ));
    }
}
