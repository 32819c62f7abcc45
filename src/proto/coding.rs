//! transfer coding for response bodies and request bodies.

use core::mem;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::warn;

use crate::error::{Error, ParseError};

/// response body framing decoder. one per in flight response.
#[derive(Debug)]
pub(crate) enum Decoder {
    /// no body bytes follow the header section.
    None,
    /// `content-length` framed body with remaining byte count.
    Length(u64),
    /// `transfer-encoding: chunked` body.
    Chunked(ChunkedState, u64, BytesMut),
    /// body runs until the peer closes the connection.
    Eof,
}

/// outcome of one decode step.
pub(crate) enum Decode {
    /// non empty chunk of body data.
    Data(Bytes),
    /// message finished. chunked bodies may carry a raw trailer block.
    Complete(Option<Bytes>),
    /// more input bytes required.
    NeedMore,
}

impl Decoder {
    pub(crate) fn chunked() -> Self {
        Self::Chunked(ChunkedState::Size, 0, BytesMut::new())
    }

    pub(crate) fn decode(&mut self, src: &mut BytesMut, max_trailer_size: usize) -> Result<Decode, Error> {
        match *self {
            Self::None | Self::Length(0) => Ok(Decode::Complete(None)),
            Self::Length(ref mut rem) => {
                if src.is_empty() {
                    return Ok(Decode::NeedMore);
                }
                Ok(Decode::Data(bounded_split(rem, src)))
            }
            Self::Eof => {
                if src.is_empty() {
                    Ok(Decode::NeedMore)
                } else {
                    Ok(Decode::Data(src.split().freeze()))
                }
            }
            Self::Chunked(ref mut state, ref mut size, ref mut trailers) => loop {
                match state.step(src, size, trailers, max_trailer_size)? {
                    ChunkStep::NeedMore => return Ok(Decode::NeedMore),
                    ChunkStep::Data(bytes) => return Ok(Decode::Data(bytes)),
                    ChunkStep::Complete => {
                        let block = mem::take(trailers);
                        let block = if block.is_empty() { None } else { Some(block.freeze()) };
                        *self = Self::None;
                        return Ok(Decode::Complete(block));
                    }
                    ChunkStep::Continue => {}
                }
            },
        }
    }

    /// peer closed the connection. legal end of message only for eof framing.
    pub(crate) fn decode_eof(&mut self) -> Result<Decode, Error> {
        match self {
            Self::Eof | Self::None | Self::Length(0) => Ok(Decode::Complete(None)),
            _ => Err(Error::socket_msg("other side closed")),
        }
    }

    pub(crate) fn is_eof_framed(&self) -> bool {
        matches!(self, Self::Eof)
    }
}

/// byte machine for chunked decoding. trailer bytes are preserved verbatim so
/// advertised trailer names can be validated at message end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChunkedState {
    Size,
    SizeLws,
    Extension,
    SizeLf,
    Body,
    BodyCr,
    BodyLf,
    Trailers,
}

enum ChunkStep {
    Continue,
    NeedMore,
    Data(Bytes),
    Complete,
}

macro_rules! byte {
    ($rdr:ident) => {{
        if !$rdr.is_empty() {
            let b = $rdr[0];
            $rdr.advance(1);
            b
        } else {
            return Ok(ChunkStep::NeedMore);
        }
    }};
}

impl ChunkedState {
    fn step(
        &mut self,
        src: &mut BytesMut,
        size: &mut u64,
        trailers: &mut BytesMut,
        max_trailer_size: usize,
    ) -> Result<ChunkStep, Error> {
        match *self {
            Self::Size => {
                match byte!(src) {
                    b @ b'0'..=b'9' => *size = checked_size(*size, (b - b'0') as u64)?,
                    b @ b'a'..=b'f' => *size = checked_size(*size, (b + 10 - b'a') as u64)?,
                    b @ b'A'..=b'F' => *size = checked_size(*size, (b + 10 - b'A') as u64)?,
                    b'\t' | b' ' => *self = Self::SizeLws,
                    b';' => *self = Self::Extension,
                    b'\r' => *self = Self::SizeLf,
                    _ => return Err(ParseError::CHUNK_SIZE.into()),
                }
                Ok(ChunkStep::Continue)
            }
            Self::SizeLws => {
                // whitespace may follow the size, but no further digits.
                match byte!(src) {
                    b'\t' | b' ' => {}
                    b';' => *self = Self::Extension,
                    b'\r' => *self = Self::SizeLf,
                    _ => return Err(ParseError::CHUNK_SIZE.into()),
                }
                Ok(ChunkStep::Continue)
            }
            Self::Extension => {
                match byte!(src) {
                    b'\r' => *self = Self::SizeLf,
                    b'\n' => return Err(ParseError::CHUNK_SIZE.into()),
                    _ => {} // extensions are skipped, none supported
                }
                Ok(ChunkStep::Continue)
            }
            Self::SizeLf => match byte!(src) {
                b'\n' if *size > 0 => {
                    *self = Self::Body;
                    Ok(ChunkStep::Continue)
                }
                b'\n' => {
                    *self = Self::Trailers;
                    Ok(ChunkStep::Continue)
                }
                _ => Err(ParseError::CHUNK_SIZE.into()),
            },
            Self::Body => {
                if src.is_empty() {
                    return Ok(ChunkStep::NeedMore);
                }
                let bytes = bounded_split(size, src);
                if *size == 0 {
                    *self = Self::BodyCr;
                }
                Ok(ChunkStep::Data(bytes))
            }
            Self::BodyCr => match byte!(src) {
                b'\r' => {
                    *self = Self::BodyLf;
                    Ok(ChunkStep::Continue)
                }
                _ => Err(ParseError::CHUNK_SIZE.into()),
            },
            Self::BodyLf => match byte!(src) {
                b'\n' => {
                    *self = Self::Size;
                    Ok(ChunkStep::Continue)
                }
                _ => Err(ParseError::CHUNK_SIZE.into()),
            },
            Self::Trailers => {
                // after the zero size chunk the remainder is a header block
                // terminated by an empty line. accumulate and scan wholesale
                // rather than byte stepping.
                trailers.extend_from_slice(src);
                src.clear();

                let end = if trailers.starts_with(b"\r\n") {
                    // empty block, no trailers sent.
                    Some(2)
                } else {
                    find_terminator(trailers)
                };

                if let Some(end) = end {
                    // bytes past the terminator belong to the next response.
                    let rest = trailers.split_off(end);
                    src.extend_from_slice(&rest);
                    if end == 2 {
                        trailers.clear();
                    }
                    return Ok(ChunkStep::Complete);
                }

                if trailers.len() > max_trailer_size {
                    return Err(Error::HeadersOverflow);
                }

                Ok(ChunkStep::NeedMore)
            }
        }
    }
}

fn checked_size(size: u64, digit: u64) -> Result<u64, Error> {
    size.checked_mul(16)
        .and_then(|s| s.checked_add(digit))
        .ok_or_else(|| ParseError::CHUNK_SIZE.into())
}

// offset one past the "\r\n\r\n" trailer terminator, if present.
fn find_terminator(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

fn bounded_split(rem: &mut u64, buf: &mut BytesMut) -> Bytes {
    let len = buf.len() as u64;
    if *rem >= len {
        *rem -= len;
        buf.split().freeze()
    } else {
        let rem = mem::replace(rem, 0);
        buf.split_to(rem as usize).freeze()
    }
}

/// request body framing encoder.
///
/// fixed length bodies are written raw with a trailing bare line, chunked
/// bodies carry a leading `\r\n<hex>\r\n` frame per chunk so the very first
/// frame doubles as the header section terminator.
#[derive(Debug)]
pub(crate) enum Encoder {
    Length { remaining: u64 },
    Chunked,
}

impl Encoder {
    pub(crate) fn encode(&mut self, bytes: &Bytes, dst: &mut BytesMut) -> Result<(), Error> {
        if bytes.is_empty() {
            return Ok(());
        }

        match self {
            Self::Length { remaining } => {
                let len = bytes.len() as u64;
                if len > *remaining {
                    return Err(Error::ContentLengthMismatch);
                }
                *remaining -= len;
                dst.extend_from_slice(bytes);
            }
            Self::Chunked => {
                dst.put_slice(b"\r\n");
                dst.put_slice(format!("{:x}", bytes.len()).as_bytes());
                dst.put_slice(b"\r\n");
                dst.extend_from_slice(bytes);
            }
        }
        Ok(())
    }

    pub(crate) fn encode_eof(&mut self, dst: &mut BytesMut) -> Result<(), Error> {
        match self {
            Self::Length { remaining } => {
                if *remaining > 0 {
                    warn!(target: "proto", remaining = *remaining, "request body ended short of declared length");
                    return Err(Error::ContentLengthMismatch);
                }
                dst.put_slice(b"\r\n");
            }
            Self::Chunked => dst.put_slice(b"\r\n0\r\n\r\n"),
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn decode_all(decoder: &mut Decoder, input: &str) -> (Vec<u8>, Option<Bytes>) {
        let src = &mut BytesMut::from(input);
        let mut out = Vec::new();
        loop {
            match decoder.decode(src, 16 * 1024).unwrap() {
                Decode::Data(b) => out.extend_from_slice(&b),
                Decode::Complete(trailers) => return (out, trailers),
                Decode::NeedMore => panic!("decoder starved with {} bytes left", src.len()),
            }
        }
    }

    #[test]
    fn decode_length() {
        let mut decoder = Decoder::Length(5);
        let (body, trailers) = decode_all(&mut decoder, "hello");
        assert_eq!(body, b"hello");
        assert!(trailers.is_none());
    }

    #[test]
    fn decode_chunked_single_read() {
        let mut decoder = Decoder::chunked();
        let (body, trailers) = decode_all(&mut decoder, "10\r\n1234567890abcdef\r\n0\r\n\r\n");
        assert_eq!(body, b"1234567890abcdef");
        assert!(trailers.is_none());
    }

    #[test]
    fn decode_chunked_split_reads() {
        let mut decoder = Decoder::chunked();
        let src = &mut BytesMut::from("5\r\nhel");

        let Decode::Data(b) = decoder.decode(src, 1024).unwrap() else {
            panic!("expected data")
        };
        assert_eq!(&b[..], b"hel");

        src.extend_from_slice(b"lo\r\n0\r\n\r\n");
        let Decode::Data(b) = decoder.decode(src, 1024).unwrap() else {
            panic!("expected data")
        };
        assert_eq!(&b[..], b"lo");

        assert!(matches!(decoder.decode(src, 1024).unwrap(), Decode::Complete(None)));
    }

    #[test]
    fn decode_chunked_captures_trailers() {
        let mut decoder = Decoder::chunked();
        let (body, trailers) = decode_all(&mut decoder, "5\r\nhello\r\n0\r\nx-checksum: abc\r\n\r\n");
        assert_eq!(body, b"hello");
        assert_eq!(&trailers.unwrap()[..], b"x-checksum: abc\r\n\r\n");
    }

    #[test]
    fn decode_chunked_keeps_pipelined_rest() {
        let mut decoder = Decoder::chunked();
        let src = &mut BytesMut::from("5\r\nhello\r\n0\r\n\r\nHTTP/1.1 200");

        let Decode::Data(b) = decoder.decode(src, 1024).unwrap() else {
            panic!("expected data")
        };
        assert_eq!(&b[..], b"hello");

        assert!(matches!(decoder.decode(src, 1024).unwrap(), Decode::Complete(None)));
        assert_eq!(&src[..], b"HTTP/1.1 200");
    }

    #[test]
    fn decode_chunked_rejects_bad_size() {
        let mut decoder = Decoder::chunked();
        let src = &mut BytesMut::from("X\r\n");
        assert!(decoder.decode(src, 1024).is_err());
    }

    #[test]
    fn decode_chunked_rejects_overflowing_size() {
        let mut decoder = Decoder::chunked();
        let src = &mut BytesMut::from("f0000000000000003\r\n");
        assert!(decoder.decode(src, 1024).is_err());
    }

    #[test]
    fn decode_eof_framing() {
        let mut decoder = Decoder::Eof;
        let src = &mut BytesMut::from("partial");
        let Decode::Data(b) = decoder.decode(src, 1024).unwrap() else {
            panic!("expected data")
        };
        assert_eq!(&b[..], b"partial");
        assert!(matches!(decoder.decode_eof().unwrap(), Decode::Complete(None)));
    }

    #[test]
    fn decode_eof_mid_length_is_error() {
        let mut decoder = Decoder::Length(10);
        assert!(decoder.decode_eof().is_err());
    }

    #[test]
    fn encode_chunked_frames() {
        let mut encoder = Encoder::Chunked;
        let dst = &mut BytesMut::new();

        encoder.encode(&Bytes::from("foo bar"), dst).unwrap();
        assert_eq!(&dst[..], b"\r\n7\r\nfoo bar");

        encoder.encode(&Bytes::from("baz quux herp"), dst).unwrap();
        assert_eq!(&dst[..], b"\r\n7\r\nfoo bar\r\nd\r\nbaz quux herp");

        encoder.encode_eof(dst).unwrap();
        assert_eq!(&dst[..], b"\r\n7\r\nfoo bar\r\nd\r\nbaz quux herp\r\n0\r\n\r\n");
    }

    #[test]
    fn encode_length_enforces_declared_size() {
        let mut encoder = Encoder::Length { remaining: 8 };
        let dst = &mut BytesMut::new();

        encoder.encode(&Bytes::from("foo bar"), dst).unwrap();
        assert!(encoder.encode(&Bytes::from("baz"), dst).is_err());

        let mut encoder = Encoder::Length { remaining: 5 };
        let dst = &mut BytesMut::new();
        encoder.encode(&Bytes::from("hell"), dst).unwrap();
        assert!(encoder.encode_eof(dst).is_err());
    }

    #[test]
    fn encode_length_terminal_line() {
        let mut encoder = Encoder::Length { remaining: 5 };
        let dst = &mut BytesMut::new();
        encoder.encode(&Bytes::from("hello"), dst).unwrap();
        encoder.encode_eof(dst).unwrap();
        assert_eq!(&dst[..], b"hello\r\n");
    }
}
