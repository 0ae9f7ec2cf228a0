// ABOUTME: TCP (optionally TLS) transport carrying AMQP frames
// ABOUTME: Splits the socket into buffered frame reader and writer halves

use amq_protocol::frame::AMQPFrame;
use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::net::TcpStream;
use tracing::trace;

use crate::client::error::{Error, Result};
use crate::client::types::ConnectOptions;
use crate::codec;

type ReadStream = Box<dyn AsyncRead + Send + Unpin>;
type WriteStream = Box<dyn AsyncWrite + Send + Unpin>;

/// Establish the socket described by `options` and split it into frame
/// halves. The connect itself is the only operation in the client with an
/// explicit timeout; `connection_timeout=0` in the URL disables it.
pub(crate) async fn connect(options: &ConnectOptions) -> Result<(FrameReader, FrameWriter)> {
    let connecting = TcpStream::connect((options.host.as_str(), options.port));
    let socket = match options.connect_timeout {
        Some(limit) => tokio::time::timeout(limit, connecting)
            .await
            .map_err(|_| Error::ConnectTimeout)??,
        None => connecting.await?,
    };

    if options.tls {
        return tls_handshake(socket, options).await;
    }
    let (read, write) = socket.into_split();
    Ok((
        FrameReader::new(Box::new(read)),
        FrameWriter::new(Box::new(write)),
    ))
}

#[cfg(feature = "tls")]
async fn tls_handshake(
    socket: TcpStream,
    options: &ConnectOptions,
) -> Result<(FrameReader, FrameWriter)> {
    let connector = native_tls::TlsConnector::new().map_err(|err| Error::Tls(err.to_string()))?;
    let connector = tokio_native_tls::TlsConnector::from(connector);
    let stream = connector
        .connect(&options.host, socket)
        .await
        .map_err(|err| Error::Tls(err.to_string()))?;
    let (read, write) = tokio::io::split(stream);
    Ok((
        FrameReader::new(Box::new(read)),
        FrameWriter::new(Box::new(write)),
    ))
}

#[cfg(not(feature = "tls"))]
async fn tls_handshake(
    _socket: TcpStream,
    _options: &ConnectOptions,
) -> Result<(FrameReader, FrameWriter)> {
    Err(Error::Tls(
        "amqps requires building with the `tls` feature".to_string(),
    ))
}

/// Read half: accumulates inbound bytes and yields decoded frames.
pub(crate) struct FrameReader {
    stream: ReadStream,
    buffer: BytesMut,
}

impl FrameReader {
    fn new(stream: ReadStream) -> Self {
        Self {
            stream,
            buffer: BytesMut::with_capacity(8 * 1024),
        }
    }

    /// Read a single frame from the underlying stream.
    ///
    /// Waits until enough bytes have accumulated to decode a frame; bytes
    /// beyond the frame stay buffered for the next call. A stream that
    /// closes on a frame boundary yields `None`; closing mid-frame is an
    /// error.
    pub(crate) async fn read_frame(&mut self) -> Result<Option<AMQPFrame>> {
        loop {
            if let Some((consumed, frame)) = codec::unmarshal(&self.buffer)? {
                self.buffer.advance(consumed);
                trace!(?frame, "frame received");
                return Ok(Some(frame));
            }
            if 0 == self.stream.read_buf(&mut self.buffer).await? {
                return if self.buffer.is_empty() {
                    Ok(None)
                } else {
                    Err(Error::ConnectionClosed)
                };
            }
        }
    }
}

/// Write half: marshals frames into a buffered writer.
pub(crate) struct FrameWriter {
    stream: BufWriter<WriteStream>,
}

impl FrameWriter {
    fn new(stream: WriteStream) -> Self {
        Self {
            stream: BufWriter::new(stream),
        }
    }

    pub(crate) async fn write_frame(&mut self, frame: &AMQPFrame) -> Result<()> {
        trace!(?frame, "writing frame");
        let bytes = codec::marshal(frame)?;
        self.stream.write_all(&bytes).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Write a batch of frames with a single flush. Used by publish so the
    /// method, header and body frames leave as one contiguous sequence.
    pub(crate) async fn write_frames(&mut self, frames: &[AMQPFrame]) -> Result<()> {
        for frame in frames {
            trace!(?frame, "writing frame");
            let bytes = codec::marshal(frame)?;
            self.stream.write_all(&bytes).await?;
        }
        self.stream.flush().await?;
        Ok(())
    }
}
