//! Newline-delimited framing for the relay protocol.
//!
//! [`FrameCodec`] sits on top of [`LinesCodec`]: every frame is one line, a
//! trailing `\r` is tolerated, and blank lines are skipped. Lines that break
//! the length limit or are not UTF-8 come out as a [`ProtocolError`] item
//! instead of a stream error, so one bad frame never ends the stream.

use std::io;

use bytes::BytesMut;
use futures_util::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Decoder, Encoder, FramedRead, FramedWrite, LinesCodec, LinesCodecError};

use crate::error::{FrameError, ProtocolError};

/// Default upper bound for one inbound frame, line ending excluded.
pub const DEFAULT_MAX_FRAME_LEN: usize = 64 * 1024;

/// One decoded line, or the reason it was thrown away.
pub type Frame = Result<String, ProtocolError>;

pub type FrameReader<R> = FramedRead<R, FrameCodec>;
pub type FrameWriter<W> = FramedWrite<W, FrameCodec>;

#[derive(Debug, Clone)]
pub struct FrameCodec {
    lines: LinesCodec,
    max_len: usize,
}

impl FrameCodec {
    pub fn new(max_len: usize) -> Self {
        // LinesCodec counts a trailing '\r' against its limit.
        Self {
            lines: LinesCodec::new_with_max_length(max_len.saturating_add(1)),
            max_len,
        }
    }

    fn classify(
        &self,
        decoded: Result<Option<String>, LinesCodecError>,
    ) -> Result<Option<Frame>, io::Error> {
        let too_long = ProtocolError::FrameTooLong {
            limit: self.max_len,
        };
        match decoded {
            Ok(Some(line)) if line.len() > self.max_len => Ok(Some(Err(too_long))),
            Ok(Some(line)) => Ok(Some(Ok(line))),
            Ok(None) => Ok(None),
            Err(LinesCodecError::MaxLineLengthExceeded) => Ok(Some(Err(too_long))),
            // Decoding does no I/O; the only io error it reports is bad UTF-8.
            Err(LinesCodecError::Io(err)) if err.kind() == io::ErrorKind::InvalidData => {
                Ok(Some(Err(ProtocolError::InvalidUtf8)))
            }
            Err(LinesCodecError::Io(err)) => Err(err),
        }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LEN)
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let decoded = self.lines.decode(src);
            match self.classify(decoded)? {
                Some(Ok(line)) if line.is_empty() => continue,
                frame => return Ok(frame),
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let decoded = self.lines.decode_eof(src);
            match self.classify(decoded)? {
                Some(Ok(line)) if line.is_empty() => continue,
                frame => return Ok(frame),
            }
        }
    }
}

impl<T> Encoder<T> for FrameCodec
where
    T: AsRef<str>,
{
    type Error = io::Error;

    fn encode(&mut self, line: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        self.lines.encode(line, dst).map_err(|err| match err {
            LinesCodecError::Io(err) => err,
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        })
    }
}

pub fn frame_reader<R: AsyncRead>(reader: R, max_len: usize) -> FrameReader<R> {
    FramedRead::new(reader, FrameCodec::new(max_len))
}

pub fn frame_writer<W: AsyncWrite>(writer: W) -> FrameWriter<W> {
    FramedWrite::new(writer, FrameCodec::default())
}

/// Waits for the next frame. `Ok(None)` means the peer closed the stream.
///
/// Cancel safe: dropping the future before it resolves loses no data.
pub async fn next_frame<R>(reader: &mut FrameReader<R>) -> Result<Option<String>, FrameError>
where
    R: AsyncRead + Unpin,
{
    match reader.next().await {
        Some(Ok(Ok(line))) => Ok(Some(line)),
        Some(Ok(Err(err))) => Err(err.into()),
        Some(Err(err)) => Err(FrameError::ConnectionLost(err)),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use futures_util::SinkExt;

    use super::*;

    async fn read_all(input: &'static [u8], max_len: usize) -> Vec<Result<String, String>> {
        let mut reader = frame_reader(input, max_len);
        let mut frames = Vec::new();
        loop {
            match next_frame(&mut reader).await {
                Ok(Some(line)) => frames.push(Ok(line)),
                Ok(None) => return frames,
                Err(err) => frames.push(Err(err.to_string())),
            }
        }
    }

    #[tokio::test]
    async fn reads_frames_in_order_and_skips_blank_lines() {
        let frames = read_all(b"first\r\n\n\nsecond\nlast-without-newline", 64).await;

        assert_eq!(
            frames,
            vec![
                Ok("first".to_string()),
                Ok("second".to_string()),
                Ok("last-without-newline".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn oversized_frame_is_skipped_without_losing_the_next_one() {
        let mut reader = frame_reader(&b"0123456789abcdef-too-long\nok\n"[..], 8);

        let err = next_frame(&mut reader).await.expect_err("too long");
        assert!(matches!(
            err,
            FrameError::Protocol(ProtocolError::FrameTooLong { limit: 8 })
        ));
        assert_eq!(
            next_frame(&mut reader).await.expect("next").as_deref(),
            Some("ok")
        );
        assert!(next_frame(&mut reader).await.expect("eof").is_none());
    }

    #[tokio::test]
    async fn frame_at_exact_limit_is_accepted_with_either_line_ending() {
        let frames = read_all(b"12345678\n12345678\r\nnext\n", 8).await;

        assert_eq!(
            frames,
            vec![
                Ok("12345678".to_string()),
                Ok("12345678".to_string()),
                Ok("next".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn one_byte_over_the_limit_is_rejected() {
        let mut reader = frame_reader(&b"123456789\nnext\n"[..], 8);

        assert!(matches!(
            next_frame(&mut reader).await,
            Err(FrameError::Protocol(ProtocolError::FrameTooLong { limit: 8 }))
        ));
        assert_eq!(
            next_frame(&mut reader).await.expect("next").as_deref(),
            Some("next")
        );
    }

    #[tokio::test]
    async fn invalid_utf8_is_a_protocol_error() {
        let mut reader = frame_reader(&b"\xff\xfe\nfine\n"[..], 64);

        let err = next_frame(&mut reader).await.expect_err("bad utf-8");
        assert!(matches!(
            err,
            FrameError::Protocol(ProtocolError::InvalidUtf8)
        ));
        assert_eq!(
            next_frame(&mut reader).await.expect("next").as_deref(),
            Some("fine")
        );
    }

    #[test]
    fn decoder_waits_for_a_complete_line() {
        let mut codec = FrameCodec::new(64);
        let mut buf = BytesMut::from(&b"partial"[..]);

        assert!(codec.decode(&mut buf).expect("decode").is_none());
        buf.extend_from_slice(b" line\n");
        let frame = codec
            .decode(&mut buf)
            .expect("decode")
            .expect("complete line");
        assert_eq!(frame.ok().as_deref(), Some("partial line"));
    }

    #[tokio::test]
    async fn writer_appends_newline() {
        let (writer, reader) = tokio::io::duplex(1024);
        let mut writer = frame_writer(writer);
        let mut reader = frame_reader(reader, 64);

        writer.send("2").await.expect("write");
        assert_eq!(
            next_frame(&mut reader).await.expect("read").as_deref(),
            Some("2")
        );
    }
}
