//! Framed reader and writer halves over async byte streams.

use crate::codec::{self, Codec};
use crate::error::ProtocolError;
use crate::frame::Frame;
use crate::message::{Header, Options};
use crate::MAX_OPTIONS_LEN;
use bytes::{Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Default read buffer size (8 KiB).
pub const DEFAULT_READ_BUFFER_SIZE: usize = 8 * 1024;

/// Reads the handshake line.
///
/// The reader must be buffered so that bytes following the newline stay
/// available for the frame reader.
pub async fn read_options<R>(reader: &mut R) -> Result<Options, ProtocolError>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::with_capacity(128);
    let n = reader
        .take(MAX_OPTIONS_LEN as u64 + 1)
        .read_until(b'\n', &mut line)
        .await?;

    if n == 0 {
        return Err(ProtocolError::ConnectionClosed);
    }
    if line.last() != Some(&b'\n') {
        if n > MAX_OPTIONS_LEN {
            return Err(ProtocolError::OptionsTooLong(MAX_OPTIONS_LEN));
        }
        return Err(ProtocolError::UnexpectedEof);
    }

    Ok(serde_json::from_slice(&line)?)
}

/// Writes the handshake line.
pub async fn write_options<W>(writer: &mut W, options: &Options) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&options.to_line()?).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads header and body frames from a stream.
pub struct FrameReader<R> {
    inner: R,
    buf: BytesMut,
    codec: Arc<dyn Codec>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R, codec: Arc<dyn Codec>) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(DEFAULT_READ_BUFFER_SIZE),
            codec,
        }
    }

    /// Returns the negotiated codec.
    pub fn codec(&self) -> &Arc<dyn Codec> {
        &self.codec
    }

    /// Reads the next complete frame.
    ///
    /// End-of-stream between frames yields `ConnectionClosed`; end-of-stream
    /// inside a frame yields `UnexpectedEof`.
    pub async fn read_frame(&mut self) -> Result<Frame, ProtocolError> {
        loop {
            if let Some(frame) = Frame::decode(&mut self.buf)? {
                return Ok(frame);
            }

            self.buf.reserve(DEFAULT_READ_BUFFER_SIZE);
            let n = self.inner.read_buf(&mut self.buf).await?;
            if n == 0 {
                return Err(if self.buf.is_empty() {
                    ProtocolError::ConnectionClosed
                } else {
                    ProtocolError::UnexpectedEof
                });
            }
            tracing::trace!("Read {} bytes ({} buffered)", n, self.buf.len());
        }
    }

    /// Reads one call header.
    pub async fn read_header(&mut self) -> Result<Header, ProtocolError> {
        let frame = self.read_frame().await?;
        if !frame.flags.is_header() {
            return Err(ProtocolError::UnexpectedFrame { expected: "header" });
        }
        codec::decode(self.codec.as_ref(), &frame.payload)
    }

    /// Reads one body frame without decoding it.
    pub async fn read_body(&mut self) -> Result<Bytes, ProtocolError> {
        let frame = self.read_frame().await?;
        if frame.flags.is_header() {
            return Err(ProtocolError::UnexpectedFrame { expected: "body" });
        }
        Ok(frame.payload)
    }

    /// Reads one body and decodes it as a document.
    pub async fn read_body_value(&mut self) -> Result<Value, ProtocolError> {
        let payload = self.read_body().await?;
        self.codec.decode(&payload)
    }

    /// Reads one body and decodes it into `T`.
    pub async fn read_body_into<T: DeserializeOwned>(&mut self) -> Result<T, ProtocolError> {
        codec::from_value(self.read_body_value().await?)
    }
}

/// Writes header/body pairs to a stream.
///
/// Each pair is encoded into one buffer and written with a single
/// `write_all` followed by a flush. Any failure shuts the stream down so the
/// peer never decodes a partial pair. A write whose future was dropped part
/// way through is treated the same on the next call.
pub struct FrameWriter<W: AsyncWrite + Unpin> {
    inner: W,
    codec: Arc<dyn Codec>,
    closed: bool,
    writing: bool,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W, codec: Arc<dyn Codec>) -> Self {
        Self {
            inner,
            codec,
            closed: false,
            writing: false,
        }
    }

    /// Returns the negotiated codec.
    pub fn codec(&self) -> &Arc<dyn Codec> {
        &self.codec
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Writes one header and a serializable body.
    pub async fn write<T: Serialize + ?Sized>(
        &mut self,
        header: &Header,
        body: &T,
    ) -> Result<(), ProtocolError> {
        let body = match codec::to_value(body) {
            Ok(value) => value,
            Err(e) => {
                self.close().await;
                return Err(e);
            }
        };
        self.write_value(header, &body).await
    }

    /// Writes one header and a body document.
    pub async fn write_value(&mut self, header: &Header, body: &Value) -> Result<(), ProtocolError> {
        if self.writing {
            tracing::debug!("Previous write was interrupted, closing stream");
            self.close().await;
        }
        if self.closed {
            return Err(ProtocolError::ConnectionClosed);
        }

        self.writing = true;
        let result = self.write_pair(header, body).await;
        self.writing = false;
        if let Err(ref e) = result {
            tracing::debug!("Write failed for seq={}: {}", header.seq, e);
            self.close().await;
        }
        result
    }

    async fn write_pair(&mut self, header: &Header, body: &Value) -> Result<(), ProtocolError> {
        let header_payload = codec::encode(self.codec.as_ref(), header)?;
        let body_payload = self.codec.encode(body)?;

        let header_frame = Frame::header(header_payload);
        let body_frame = Frame::body(body_payload);

        let mut buf = BytesMut::with_capacity(header_frame.encoded_len() + body_frame.encoded_len());
        header_frame.encode_into(&mut buf)?;
        body_frame.encode_into(&mut buf)?;

        self.inner.write_all(&buf).await?;
        self.inner.flush().await?;
        tracing::trace!("Wrote seq={} ({} bytes)", header.seq, buf.len());
        Ok(())
    }

    /// Shuts the stream down. Idempotent.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(e) = self.inner.shutdown().await {
            tracing::debug!("Shutdown error: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{CborCodec, JsonCodec};
    use serde::Deserialize;
    use tokio::io::BufReader;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Args {
        num1: i32,
        num2: i32,
    }

    #[tokio::test]
    async fn test_header_body_roundtrip() {
        let (client, server) = tokio::io::duplex(1024);
        let mut writer = FrameWriter::new(client, Arc::new(CborCodec));
        let mut reader = FrameReader::new(server, Arc::new(CborCodec));

        let header = Header::new("Foo.Sum", 1);
        writer.write(&header, &Args { num1: 2, num2: 3 }).await.unwrap();

        assert_eq!(reader.read_header().await.unwrap(), header);
        let args: Args = reader.read_body_into().await.unwrap();
        assert_eq!(args, Args { num1: 2, num2: 3 });
    }

    #[tokio::test]
    async fn test_options_then_frames_in_one_read() {
        let codec: Arc<dyn Codec> = Arc::new(JsonCodec);
        let (client, server) = tokio::io::duplex(4096);

        let mut raw = client;
        write_options(&mut raw, &Options::new().with_codec(crate::JSON))
            .await
            .unwrap();
        let mut writer = FrameWriter::new(raw, codec.clone());
        writer.write(&Header::new("A.B", 9), &"x").await.unwrap();

        let mut buffered = BufReader::new(server);
        let options = read_options(&mut buffered).await.unwrap();
        assert_eq!(options.codec_type, crate::JSON);

        let mut reader = FrameReader::new(buffered, codec);
        assert_eq!(reader.read_header().await.unwrap().seq, 9);
        assert_eq!(reader.read_body_value().await.unwrap(), Value::from("x"));
    }

    #[tokio::test]
    async fn test_clean_eof_vs_truncated_frame() {
        let (client, server) = tokio::io::duplex(1024);
        drop(client);
        let mut reader = FrameReader::new(server, Arc::new(CborCodec));
        assert!(reader.read_header().await.unwrap_err().is_eof());

        let (mut client, server) = tokio::io::duplex(1024);
        let frame = Frame::header(Bytes::from_static(b"\xa0")).encode().unwrap();
        client.write_all(&frame[..frame.len() - 1]).await.unwrap();
        drop(client);
        let mut reader = FrameReader::new(server, Arc::new(CborCodec));
        assert!(matches!(
            reader.read_header().await,
            Err(ProtocolError::UnexpectedEof)
        ));
    }

    #[tokio::test]
    async fn test_frame_kind_mismatch() {
        let (mut client, server) = tokio::io::duplex(1024);
        let frame = Frame::body(Bytes::from_static(b"\xf6")).encode().unwrap();
        client.write_all(&frame).await.unwrap();

        let mut reader = FrameReader::new(server, Arc::new(CborCodec));
        assert!(matches!(
            reader.read_header().await,
            Err(ProtocolError::UnexpectedFrame { expected: "header" })
        ));
    }

    #[tokio::test]
    async fn test_options_errors() {
        let (mut client, server) = tokio::io::duplex(1024);
        client.write_all(b"{\"magic_number\":1").await.unwrap();
        drop(client);
        let mut buffered = BufReader::new(server);
        assert!(matches!(
            read_options(&mut buffered).await,
            Err(ProtocolError::UnexpectedEof)
        ));

        let (mut client, server) = tokio::io::duplex(1024);
        client.write_all(b"not json\n").await.unwrap();
        let mut buffered = BufReader::new(server);
        assert!(matches!(
            read_options(&mut buffered).await,
            Err(ProtocolError::Json(_))
        ));
    }

    #[tokio::test]
    async fn test_write_after_close() {
        let (client, _server) = tokio::io::duplex(1024);
        let mut writer = FrameWriter::new(client, Arc::new(CborCodec));
        writer.close().await;
        writer.close().await;
        assert!(writer.is_closed());

        let result = writer.write(&Header::new("A.B", 1), &()).await;
        assert!(matches!(result, Err(ProtocolError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_encode_failure_closes_stream() {
        use std::collections::HashMap;

        let (client, server) = tokio::io::duplex(1024);
        let mut writer = FrameWriter::new(client, Arc::new(CborCodec));

        // Map keys must be strings in the document model.
        let mut bad: HashMap<(i32, i32), i32> = HashMap::new();
        bad.insert((1, 2), 3);
        assert!(writer.write(&Header::new("A.B", 1), &bad).await.is_err());
        assert!(writer.is_closed());

        let mut reader = FrameReader::new(server, Arc::new(CborCodec));
        assert!(reader.read_header().await.unwrap_err().is_eof());
    }
}
