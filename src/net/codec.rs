//! Length-delimited framing.
//!
//! Each frame is a big-endian `u32` length followed by that many bytes.
//! [`FrameCodec`] is a `tokio_util` [`Decoder`]/[`Encoder`] driven through
//! `FramedRead`/`FramedWrite`. EOF exactly at a frame boundary ends the
//! stream; anywhere else it is [`CodecError::Truncated`].

use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures_util::StreamExt;
use std::io;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio_util::codec::{Decoder, Encoder, Framed, FramedRead, FramedWrite};

const HEADER_LEN: usize = 4;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("frame of {size} bytes exceeds limit of {limit}")]
    TooLarge { size: usize, limit: usize },
    #[error("stream ended mid-frame")]
    Truncated,
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type FrameReader<R> = FramedRead<R, FrameCodec>;
pub type FrameWriter<W> = FramedWrite<W, FrameCodec>;
pub type FramedStream<S> = Framed<S, FrameCodec>;

/// Decoder/encoder for length-prefixed frames.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_frame_bytes: usize,
}

impl FrameCodec {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self { max_frame_bytes }
    }

    pub fn max_frame_bytes(&self) -> usize {
        self.max_frame_bytes
    }

    pub fn reader<R: AsyncRead>(&self, io: R) -> FrameReader<R> {
        FramedRead::new(io, *self)
    }

    pub fn writer<W: AsyncWrite>(&self, io: W) -> FrameWriter<W> {
        FramedWrite::new(io, *self)
    }

    pub fn framed<S: AsyncRead + AsyncWrite>(&self, io: S) -> FramedStream<S> {
        Framed::new(io, *self)
    }

    /// Reader and writer halves over `io`, starting from bytes already read off it.
    pub fn split<S: AsyncRead + AsyncWrite>(
        &self,
        io: S,
        buffered: BytesMut,
    ) -> (FrameReader<ReadHalf<S>>, FrameWriter<WriteHalf<S>>) {
        let (read, write) = tokio::io::split(io);
        let mut reader = self.reader(read);
        *reader.read_buffer_mut() = buffered;
        (reader, self.writer(write))
    }

    /// Like [`framed`](Self::framed), resuming from `buffered`.
    pub fn framed_with<S: AsyncRead + AsyncWrite>(&self, io: S, buffered: BytesMut) -> FramedStream<S> {
        let mut framed = self.framed(io);
        *framed.read_buffer_mut() = buffered;
        framed
    }

    fn check_len(&self, size: usize) -> Result<(), CodecError> {
        if size > self.max_frame_bytes {
            return Err(CodecError::TooLarge {
                size,
                limit: self.max_frame_bytes,
            });
        }
        Ok(())
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(4 * 1024 * 1024)
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, CodecError> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }
        let size = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        self.check_len(size)?;

        if src.len() < HEADER_LEN + size {
            src.reserve(HEADER_LEN + size - src.len());
            return Ok(None);
        }
        src.advance(HEADER_LEN);
        Ok(Some(src.split_to(size).freeze()))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, CodecError> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() => Ok(None),
            None => Err(CodecError::Truncated),
        }
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = CodecError;

    fn encode(&mut self, frame: Bytes, dst: &mut BytesMut) -> Result<(), CodecError> {
        self.check_len(frame.len())?;
        dst.reserve(HEADER_LEN + frame.len());
        dst.put_u32(frame.len() as u32);
        dst.extend_from_slice(&frame);
        Ok(())
    }
}

/// Next frame from `frames`; `Ok(None)` on clean end of stream.
pub async fn next_frame<S>(frames: &mut S) -> Result<Option<Bytes>, CodecError>
where
    S: futures_util::Stream<Item = Result<Bytes, CodecError>> + Unpin,
{
    frames.next().await.transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::SinkExt;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn frames_cross_a_pipe() {
        let codec = FrameCodec::new(64);
        let (a, b) = tokio::io::duplex(256);
        let mut writer = codec.writer(a);
        writer.send(Bytes::from_static(b"hello")).await.unwrap();
        writer.send(Bytes::new()).await.unwrap();
        drop(writer);

        let mut reader = codec.reader(b);
        assert_eq!(next_frame(&mut reader).await.unwrap().unwrap(), Bytes::from_static(b"hello"));
        assert_eq!(next_frame(&mut reader).await.unwrap().unwrap().len(), 0);
        assert!(next_frame(&mut reader).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn header_is_big_endian_u32() {
        let codec = FrameCodec::new(64);
        let (a, mut b) = tokio::io::duplex(64);
        codec.writer(a).send(Bytes::from_static(b"abc")).await.unwrap();

        let mut raw = [0u8; 7];
        tokio::io::AsyncReadExt::read_exact(&mut b, &mut raw).await.unwrap();
        assert_eq!(raw, [0, 0, 0, 3, b'a', b'b', b'c']);
    }

    #[tokio::test]
    async fn rejects_oversized_frames() {
        let codec = FrameCodec::new(4);
        let (mut a, b) = tokio::io::duplex(64);
        assert!(matches!(
            codec.writer(tokio::io::sink()).send(Bytes::from_static(b"too long")).await,
            Err(CodecError::TooLarge { .. })
        ));

        a.write_all(&100u32.to_be_bytes()).await.unwrap();
        let mut reader = codec.reader(b);
        assert!(matches!(
            next_frame(&mut reader).await,
            Err(CodecError::TooLarge { size: 100, .. })
        ));
    }

    #[tokio::test]
    async fn truncated_frame_is_an_error() {
        let codec = FrameCodec::new(64);
        let (mut a, b) = tokio::io::duplex(64);
        a.write_all(&10u32.to_be_bytes()).await.unwrap();
        a.write_all(b"abc").await.unwrap();
        drop(a);
        let mut reader = codec.reader(b);
        assert!(matches!(next_frame(&mut reader).await, Err(CodecError::Truncated)));
    }
}
