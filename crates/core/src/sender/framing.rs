//! MLLP block framing: `0x0B` + payload + `0x1C` + `0x0D`.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const START_BLOCK: u8 = 0x0B;
pub const END_BLOCK: u8 = 0x1C;
pub const CARRIAGE_RETURN: u8 = 0x0D;

/// Largest frame accepted from a receiver. Anything bigger is treated as a broken stream.
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame exceeds {MAX_FRAME_SIZE} bytes")]
    TooLarge,
    #[error("stream closed in the middle of a frame")]
    Truncated,
}

pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(payload.len() + 3);
    frame.push(START_BLOCK);
    frame.extend_from_slice(payload);
    frame.push(END_BLOCK);
    frame.push(CARRIAGE_RETURN);
    frame
}

pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&encode_frame(payload)).await?;
    writer.flush().await
}

/// Reads whole frames from a byte stream, buffering partial reads between calls.
///
/// `next_frame` is cancel safe: bytes are only consumed from the stream by a completed
/// `read`, and they are kept in the buffer until a full frame is available.
#[derive(Debug)]
pub struct FrameReader<R> {
    inner: R,
    buffer: Vec<u8>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buffer: Vec::new(),
        }
    }

    /// Returns the next frame's payload, or `None` once the peer has closed the stream cleanly.
    pub async fn next_frame(&mut self) -> Result<Option<Vec<u8>>, FrameError> {
        let mut chunk = [0u8; 4096];
        loop {
            if let Some(frame) = self.take_frame()? {
                return Ok(Some(frame));
            }
            let read = self.inner.read(&mut chunk).await?;
            if read == 0 {
                return if self.buffer.iter().all(u8::is_ascii_whitespace) {
                    Ok(None)
                } else {
                    Err(FrameError::Truncated)
                };
            }
            self.buffer.extend_from_slice(&chunk[..read]);
        }
    }

    fn take_frame(&mut self) -> Result<Option<Vec<u8>>, FrameError> {
        let Some(start) = self.buffer.iter().position(|&b| b == START_BLOCK) else {
            // Bytes outside a frame carry no meaning.
            self.buffer.clear();
            return Ok(None);
        };
        let end = self.buffer[start..]
            .windows(2)
            .position(|pair| pair == [END_BLOCK, CARRIAGE_RETURN])
            .map(|offset| start + offset);
        match end {
            Some(end) => {
                let payload = self.buffer[start + 1..end].to_vec();
                self.buffer.drain(..end + 2);
                Ok(Some(payload))
            }
            None if self.buffer.len() - start > MAX_FRAME_SIZE => Err(FrameError::TooLarge),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_frame_wraps_payload() {
        assert_eq!(encode_frame(b"MSH|x"), b"\x0bMSH|x\x1c\x0d");
        assert_eq!(encode_frame(b""), [START_BLOCK, END_BLOCK, CARRIAGE_RETURN]);
    }

    #[tokio::test]
    async fn test_reader_splits_frames_and_skips_noise() {
        let mut bytes = b"\r\n".to_vec();
        bytes.extend(encode_frame(b"first"));
        bytes.extend(encode_frame(b""));
        bytes.extend(encode_frame(b"second"));
        let mut reader = FrameReader::new(bytes.as_slice());

        assert_eq!(reader.next_frame().await.unwrap(), Some(b"first".to_vec()));
        assert_eq!(reader.next_frame().await.unwrap(), Some(Vec::new()));
        assert_eq!(reader.next_frame().await.unwrap(), Some(b"second".to_vec()));
        assert_eq!(reader.next_frame().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_reader_reports_truncated_frame() {
        let bytes = b"\x0bMSH|partial".to_vec();
        let mut reader = FrameReader::new(bytes.as_slice());

        assert!(matches!(
            reader.next_frame().await,
            Err(FrameError::Truncated)
        ));
    }

    #[tokio::test]
    async fn test_write_frame_round_trips_through_reader() {
        let mut wire = Vec::new();
        write_frame(&mut wire, b"MSH|^~\\&|A\rPID|1\r").await.unwrap();

        let mut reader = FrameReader::new(wire.as_slice());
        assert_eq!(
            reader.next_frame().await.unwrap().unwrap(),
            b"MSH|^~\\&|A\rPID|1\r".to_vec()
        );
    }
}
