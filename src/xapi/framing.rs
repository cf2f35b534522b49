//! Delimiter-less JSON framing.
//!
//! The broker writes bare JSON documents back to back with no length prefix.
//! A frame ends at the first byte where the buffered input forms one
//! complete JSON value; whatever follows stays buffered for the next call.
//! Object and array frames are tracked with an incremental bracket scanner,
//! so each byte is inspected once no matter how many reads a frame spans.

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};

use crate::{Result, XapiError};

/// Bytes requested from the socket per read.
const READ_CHUNK: usize = 4096;

/// Largest incomplete document tolerated before the stream is declared corrupt.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Accumulates raw bytes and cuts complete JSON values off the front.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buf: Vec<u8>,
    scan: Scan,
}

/// Bracket-matching state for the frame at the front of the buffer.
#[derive(Debug, Default, Clone, Copy)]
struct Scan {
    /// Bytes of the current frame already inspected.
    offset: usize,
    depth: usize,
    in_string: bool,
    escaped: bool,
}

impl Scan {
    /// Advances over `bytes[self.offset..]` and returns the end of the
    /// frame if its outermost bracket closed.
    fn advance(&mut self, bytes: &[u8]) -> Option<usize> {
        while self.offset < bytes.len() {
            let byte = bytes[self.offset];
            self.offset += 1;
            if self.in_string {
                match byte {
                    _ if self.escaped => self.escaped = false,
                    b'\\' => self.escaped = true,
                    b'"' => self.in_string = false,
                    _ => {}
                }
                continue;
            }
            match byte {
                b'"' => self.in_string = true,
                b'{' | b'[' => self.depth += 1,
                b'}' | b']' => {
                    self.depth = self.depth.saturating_sub(1);
                    if self.depth == 0 {
                        return Some(self.offset);
                    }
                }
                _ => {}
            }
        }
        None
    }
}

impl FrameBuffer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends freshly read bytes.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Number of bytes buffered but not yet returned as a frame.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Pops the next complete JSON value, or `None` if more bytes are needed.
    ///
    /// # Errors
    ///
    /// Returns [`XapiError::ProtocolFailure`] if the buffered bytes can never
    /// become valid JSON, or if an incomplete value exceeds
    /// [`MAX_FRAME_BYTES`].
    pub fn next_frame(&mut self) -> Result<Option<serde_json::Value>> {
        if self.scan.offset == 0 {
            let Some(start) = self.buf.iter().position(|b| !b.is_ascii_whitespace()) else {
                self.buf.clear();
                return Ok(None);
            };
            if start > 0 {
                self.buf.drain(..start);
            }
        }

        if !matches!(self.buf.first(), Some(b'{' | b'[')) {
            return self.next_scalar();
        }

        let Some(end) = self.scan.advance(&self.buf) else {
            return self.incomplete();
        };
        let parsed = serde_json::from_slice(&self.buf[..end]);
        self.buf.drain(..end);
        self.scan = Scan::default();
        parsed
            .map(Some)
            .map_err(|e| XapiError::ProtocolFailure(e.to_string()))
    }

    /// Parses a frame that does not start with a bracket.
    fn next_scalar(&mut self) -> Result<Option<serde_json::Value>> {
        let (parsed, consumed) = {
            let mut values =
                serde_json::Deserializer::from_slice(&self.buf).into_iter::<serde_json::Value>();
            let parsed = values.next();
            (parsed, values.byte_offset())
        };

        match parsed {
            Some(Ok(value)) => {
                self.buf.drain(..consumed);
                Ok(Some(value))
            }
            Some(Err(e)) if e.is_eof() => self.incomplete(),
            Some(Err(e)) => Err(XapiError::ProtocolFailure(e.to_string())),
            None => Ok(None),
        }
    }

    fn incomplete(&self) -> Result<Option<serde_json::Value>> {
        if self.buf.len() > MAX_FRAME_BYTES {
            Err(XapiError::ProtocolFailure(format!(
                "incomplete frame exceeds {MAX_FRAME_BYTES} bytes"
            )))
        } else {
            Ok(None)
        }
    }
}

/// Reads frames until one is complete, pulling more bytes as needed.
async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    buffer: &mut FrameBuffer,
    chunk: &mut [u8],
) -> Result<serde_json::Value> {
    loop {
        if let Some(value) = buffer.next_frame()? {
            return Ok(value);
        }
        let n = reader.read(chunk).await?;
        if n == 0 {
            return Err(XapiError::ConnectionClosed);
        }
        buffer.extend(&chunk[..n]);
    }
}

/// Writes one encoded message, retrying short writes until every byte is out.
async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, bytes: &[u8]) -> Result<()> {
    let mut sent = 0;
    while sent < bytes.len() {
        let n = writer.write(&bytes[sent..]).await?;
        if n == 0 {
            return Err(XapiError::ConnectionClosed);
        }
        sent += n;
    }
    writer.flush().await?;
    Ok(())
}

/// A full-duplex framed connection over one socket.
pub struct FramedConnection<S> {
    stream: S,
    buffer: FrameBuffer,
    chunk: Vec<u8>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> FramedConnection<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            buffer: FrameBuffer::new(),
            chunk: vec![0; READ_CHUNK],
        }
    }

    /// Serializes and sends one message.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the socket write fails.
    pub async fn send<T: Serialize + ?Sized>(&mut self, message: &T) -> Result<()> {
        let bytes = serde_json::to_vec(message)?;
        write_frame(&mut self.stream, &bytes).await
    }

    /// Receives the next complete JSON document.
    ///
    /// # Errors
    ///
    /// Returns [`XapiError::ConnectionClosed`] on EOF, [`XapiError::Io`] on
    /// socket failure, and [`XapiError::ProtocolFailure`] on malformed input.
    pub async fn receive(&mut self) -> Result<serde_json::Value> {
        read_frame(&mut self.stream, &mut self.buffer, &mut self.chunk).await
    }

    /// Receives the next document and decodes it as `T`.
    ///
    /// # Errors
    ///
    /// Same as [`receive`](Self::receive), plus [`XapiError::Json`] if the
    /// document does not match `T`.
    pub async fn receive_as<T: DeserializeOwned>(&mut self) -> Result<T> {
        let value = self.receive().await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Shuts down the write side of the socket.
    ///
    /// # Errors
    ///
    /// Returns an error if the shutdown (TLS close-notify) fails.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.stream.shutdown().await?;
        Ok(())
    }

    /// Splits into independently owned read and write halves. Bytes already
    /// buffered move to the reader.
    pub fn split(self) -> (FrameReader<ReadHalf<S>>, FrameWriter<WriteHalf<S>>) {
        let (read, write) = tokio::io::split(self.stream);
        (
            FrameReader {
                reader: read,
                buffer: self.buffer,
                chunk: self.chunk,
            },
            FrameWriter { writer: write },
        )
    }
}

/// Read half of a framed connection.
pub struct FrameReader<R> {
    reader: R,
    buffer: FrameBuffer,
    chunk: Vec<u8>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// Receives the next complete JSON document.
    ///
    /// # Errors
    ///
    /// See [`FramedConnection::receive`].
    pub async fn receive(&mut self) -> Result<serde_json::Value> {
        read_frame(&mut self.reader, &mut self.buffer, &mut self.chunk).await
    }
}

/// Write half of a framed connection.
pub struct FrameWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    /// Serializes and sends one message.
    ///
    /// # Errors
    ///
    /// See [`FramedConnection::send`].
    pub async fn send<T: Serialize + ?Sized>(&mut self, message: &T) -> Result<()> {
        let bytes = serde_json::to_vec(message)?;
        write_frame(&mut self.writer, &bytes).await
    }

    /// Shuts down the write side of the socket.
    ///
    /// # Errors
    ///
    /// Returns an error if the shutdown fails.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.writer.shutdown().await?;
        Ok(())
    }
}
