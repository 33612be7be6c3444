//! Stream framing: fixed-width decimal length prefix + JSON record.
//!
//! TCP delivers bytes, not messages, so a read may end anywhere inside a
//! frame. [`FrameBuffer`] accumulates whatever arrives and hands back
//! complete messages only; [`FrameReader`] drives it from an async socket.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::protocol::{Message, ProtocolError};

/// Width of the ASCII length prefix.
pub const PREFIX_LEN: usize = 8;

/// Largest payload the prefix can describe.
pub const MAX_FRAME_LEN: usize = 99_999_999;

const READ_CHUNK: usize = 8 * 1024;

/// Prefix and serialize a message into a ready-to-write frame.
pub fn encode_frame(msg: &Message) -> Result<Vec<u8>, ProtocolError> {
    let payload = msg.encode()?;
    if payload.len() > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge {
            len: payload.len(),
            max: MAX_FRAME_LEN,
        });
    }
    let mut frame = Vec::with_capacity(PREFIX_LEN + payload.len());
    frame.extend_from_slice(format!("{:0width$}", payload.len(), width = PREFIX_LEN).as_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Write one framed message.
pub async fn write_message<W>(writer: &mut W, msg: &Message) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode_frame(msg)?;
    writer.write_all(&frame).await?;
    Ok(())
}

fn parse_prefix(prefix: &[u8]) -> Result<usize, ProtocolError> {
    let malformed = || ProtocolError::MalformedPrefix(String::from_utf8_lossy(prefix).into_owned());
    if !prefix.iter().all(u8::is_ascii_digit) {
        return Err(malformed());
    }
    std::str::from_utf8(prefix)
        .ok()
        .and_then(|digits| digits.parse().ok())
        .ok_or_else(malformed)
}

/// Accumulates partial reads until complete frames are available.
#[derive(Debug)]
pub struct FrameBuffer {
    buf: Vec<u8>,
    max_len: usize,
}

impl FrameBuffer {
    /// `max_len` caps the payload size accepted from the peer.
    pub fn new(max_len: usize) -> Self {
        Self {
            buf: Vec::new(),
            max_len: max_len.min(MAX_FRAME_LEN),
        }
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Number of bytes held that do not yet form a complete frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Pop the next complete message, if one has fully arrived.
    pub fn next_frame(&mut self) -> Result<Option<Message>, ProtocolError> {
        if self.buf.len() < PREFIX_LEN {
            return Ok(None);
        }
        let len = parse_prefix(&self.buf[..PREFIX_LEN])?;
        if len > self.max_len {
            return Err(ProtocolError::FrameTooLarge {
                len,
                max: self.max_len,
            });
        }
        let end = PREFIX_LEN + len;
        if self.buf.len() < end {
            return Ok(None);
        }
        let msg = Message::decode(&self.buf[PREFIX_LEN..end]);
        self.buf.drain(..end);
        msg.map(Some)
    }
}

/// Reads framed messages from an async byte stream.
///
/// `next_message` is cancel-safe: bytes are moved into the internal buffer
/// as soon as they are read, so dropping the future (e.g. in a
/// `tokio::select!`) never loses data.
pub struct FrameReader<R> {
    inner: R,
    buffer: FrameBuffer,
    chunk: Box<[u8]>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R, max_len: usize) -> Self {
        Self {
            inner,
            buffer: FrameBuffer::new(max_len),
            chunk: vec![0u8; READ_CHUNK].into_boxed_slice(),
        }
    }

    /// Next message, or `None` when the peer closed cleanly between frames.
    pub async fn next_message(&mut self) -> Result<Option<Message>, ProtocolError> {
        loop {
            if let Some(msg) = self.buffer.next_frame()? {
                return Ok(Some(msg));
            }
            let n = self.inner.read(&mut self.chunk).await?;
            if n == 0 {
                if self.buffer.is_empty() {
                    return Ok(None);
                }
                return Err(ProtocolError::Truncated(self.buffer.buffered()));
            }
            self.buffer.extend(&self.chunk[..n]);
        }
    }

    /// Like `next_message`, but a clean close is an error.
    pub async fn expect_message(&mut self) -> Result<Message, ProtocolError> {
        self.next_message()
            .await?
            .ok_or(ProtocolError::ConnectionClosed)
    }

    pub fn get_mut(&mut self) -> &mut R {
        &mut self.inner
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ot::Operation;
    use crate::protocol::{ClientId, MessageKind};

    fn sample() -> Message {
        let op = Operation::new().retain(1).insert("hi");
        Message::operation(ClientId::new(2).unwrap(), op, 3)
    }

    #[test]
    fn test_prefix_is_zero_padded() {
        let frame = encode_frame(&sample()).unwrap();
        let payload_len = frame.len() - PREFIX_LEN;
        let prefix = std::str::from_utf8(&frame[..PREFIX_LEN]).unwrap();
        assert_eq!(prefix, format!("{payload_len:08}"));
        assert!(prefix.starts_with('0'));
    }

    #[test]
    fn test_partial_reads_are_buffered() {
        let frame = encode_frame(&sample()).unwrap();
        let mut buffer = FrameBuffer::new(MAX_FRAME_LEN);

        // prefix split across two reads, then the payload byte by byte
        buffer.extend(&frame[..3]);
        assert!(buffer.next_frame().unwrap().is_none());
        buffer.extend(&frame[3..PREFIX_LEN]);
        assert!(buffer.next_frame().unwrap().is_none());
        for byte in &frame[PREFIX_LEN..frame.len() - 1] {
            buffer.extend(std::slice::from_ref(byte));
            assert!(buffer.next_frame().unwrap().is_none());
        }
        buffer.extend(&frame[frame.len() - 1..]);

        assert_eq!(buffer.next_frame().unwrap(), Some(sample()));
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_back_to_back_frames() {
        let mut bytes = encode_frame(&sample()).unwrap();
        bytes.extend(encode_frame(&Message::remove(ClientId::new(2).unwrap())).unwrap());

        let mut buffer = FrameBuffer::new(MAX_FRAME_LEN);
        buffer.extend(&bytes);
        assert_eq!(buffer.next_frame().unwrap(), Some(sample()));
        let second = buffer.next_frame().unwrap().unwrap();
        assert_eq!(second.kind, MessageKind::Remove);
        assert!(buffer.next_frame().unwrap().is_none());
    }

    #[test]
    fn test_malformed_prefix() {
        let mut buffer = FrameBuffer::new(MAX_FRAME_LEN);
        buffer.extend(b"00x00012{}");
        assert!(matches!(
            buffer.next_frame(),
            Err(ProtocolError::MalformedPrefix(_))
        ));
    }

    #[test]
    fn test_frame_over_limit() {
        let mut buffer = FrameBuffer::new(16);
        buffer.extend(b"00000017");
        assert!(matches!(
            buffer.next_frame(),
            Err(ProtocolError::FrameTooLarge { len: 17, max: 16 })
        ));
    }

    #[tokio::test]
    async fn test_reader_over_split_stream() {
        let frame = encode_frame(&sample()).unwrap();
        let (mut tx, rx) = tokio::io::duplex(4);
        let writer = tokio::spawn(async move {
            tx.write_all(&frame).await.unwrap();
            tx.write_all(&frame).await.unwrap();
        });

        let mut reader = FrameReader::new(rx, MAX_FRAME_LEN);
        assert_eq!(reader.next_message().await.unwrap(), Some(sample()));
        assert_eq!(reader.next_message().await.unwrap(), Some(sample()));
        writer.await.unwrap();
        // writer half dropped: clean close between frames
        assert!(reader.next_message().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reader_truncated_stream() {
        let frame = encode_frame(&sample()).unwrap();
        let (mut tx, rx) = tokio::io::duplex(1024);
        tx.write_all(&frame[..frame.len() - 2]).await.unwrap();
        drop(tx);

        let mut reader = FrameReader::new(rx, MAX_FRAME_LEN);
        assert!(matches!(
            reader.next_message().await,
            Err(ProtocolError::Truncated(_))
        ));
    }

    #[tokio::test]
    async fn test_expect_message_on_close() {
        let (tx, rx) = tokio::io::duplex(64);
        drop(tx);
        let mut reader = FrameReader::new(rx, MAX_FRAME_LEN);
        assert!(matches!(
            reader.expect_message().await,
            Err(ProtocolError::ConnectionClosed)
        ));
    }
}
