//! incremental response head parsing on top of httparse.

use core::time::Duration;

use bytes::{Buf, BytesMut};
use http::{
    HeaderMap, StatusCode, Version,
    header::{HeaderName, HeaderValue},
};
use httparse::Status;

use crate::error::{Error, ParseError};

use super::coding::Decoder;

const MAX_HEADERS: usize = 128;

/// parsed response head together with the connection state it implies.
#[derive(Debug)]
pub(crate) struct Head {
    pub(crate) status: StatusCode,
    pub(crate) version: Version,
    pub(crate) headers: HeaderMap,
    pub(crate) keep_alive: bool,
    /// server marked the connection as upgraded.
    pub(crate) upgrade: bool,
    pub(crate) content_length: Option<u64>,
    pub(crate) chunked: bool,
    /// `keep-alive: timeout=N` hint, if advertised.
    pub(crate) keep_alive_timeout: Option<Duration>,
    /// lowercase names advertised by a `trailer` header.
    pub(crate) trailer_names: Vec<String>,
}

impl Head {
    /// body framing for this response. `is_head_method` skips the body for
    /// HEAD responses regardless of advertised framing.
    pub(crate) fn body_decoder(&self, is_head_method: bool) -> Decoder {
        if is_head_method
            || self.status.is_informational()
            || self.status == StatusCode::NO_CONTENT
            || self.status == StatusCode::NOT_MODIFIED
        {
            Decoder::None
        } else if self.chunked {
            Decoder::chunked()
        } else if let Some(n) = self.content_length {
            if n == 0 { Decoder::None } else { Decoder::Length(n) }
        } else {
            // no framing at all: the body runs to connection close.
            Decoder::Eof
        }
    }
}

/// try to parse a complete response head out of `buf`. consumes the head
/// bytes on success, leaves the buffer untouched when more input is needed.
pub(crate) fn decode_head(buf: &mut BytesMut, max_header_size: usize) -> Result<Option<Head>, Error> {
    let mut parsed_headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut res = httparse::Response::new(&mut parsed_headers);

    let len = match res.parse(buf.as_ref())? {
        Status::Complete(len) => len,
        Status::Partial => {
            if buf.len() > max_header_size {
                return Err(Error::HeadersOverflow);
            }
            return Ok(None);
        }
    };

    if len > max_header_size {
        return Err(Error::HeadersOverflow);
    }

    let version = match res.version {
        Some(1) => Version::HTTP_11,
        Some(0) => Version::HTTP_10,
        _ => return Err(ParseError::VERSION.into()),
    };

    let status = res
        .code
        .and_then(|code| StatusCode::from_u16(code).ok())
        .ok_or(ParseError::STATUS)?;

    let mut head = Head {
        status,
        version,
        headers: HeaderMap::with_capacity(res.headers.len()),
        keep_alive: version == Version::HTTP_11,
        upgrade: false,
        content_length: None,
        chunked: false,
        keep_alive_timeout: None,
        trailer_names: Vec::new(),
    };

    for h in res.headers.iter() {
        let name = HeaderName::from_bytes(h.name.as_bytes()).map_err(|_| ParseError::HEADER_TOKEN)?;
        let value = HeaderValue::from_bytes(h.value).map_err(|_| ParseError::HEADER_TOKEN)?;

        match name.as_str() {
            "connection" => {
                for token in split_tokens(h.value) {
                    if token.eq_ignore_ascii_case("close") {
                        head.keep_alive = false;
                    } else if token.eq_ignore_ascii_case("keep-alive") {
                        head.keep_alive = true;
                    } else if token.eq_ignore_ascii_case("upgrade") {
                        head.upgrade = true;
                    }
                }
            }
            "content-length" => {
                if head.chunked {
                    return Err(ParseError::TRANSFER_ENCODING.into());
                }
                let n = std::str::from_utf8(h.value)
                    .ok()
                    .and_then(|v| v.trim().parse::<u64>().ok())
                    .ok_or(ParseError::CONTENT_LENGTH)?;
                if head.content_length.is_some_and(|prev| prev != n) {
                    return Err(ParseError::CONTENT_LENGTH.into());
                }
                head.content_length = Some(n);
            }
            "transfer-encoding" => {
                if head.content_length.is_some() {
                    // both framings present is a request smuggling vector.
                    return Err(ParseError::TRANSFER_ENCODING.into());
                }
                for token in split_tokens(h.value) {
                    if token.eq_ignore_ascii_case("chunked") {
                        head.chunked = true;
                    }
                }
            }
            "keep-alive" => {
                for token in split_tokens(h.value) {
                    if let Some(secs) = token.strip_prefix("timeout=") {
                        if let Ok(secs) = secs.trim().parse::<u64>() {
                            head.keep_alive_timeout = Some(Duration::from_secs(secs));
                        }
                    }
                }
            }
            "trailer" => {
                for token in split_tokens(h.value) {
                    head.trailer_names.push(token.to_ascii_lowercase());
                }
            }
            _ => {}
        }

        head.headers.append(name, value);
    }

    buf.advance(len);
    Ok(Some(head))
}

/// parse a raw trailer block captured by the chunked decoder.
pub(crate) fn decode_trailers(block: &[u8]) -> Result<HeaderMap, Error> {
    let mut parsed = [httparse::EMPTY_HEADER; MAX_HEADERS];
    match httparse::parse_headers(block, &mut parsed)? {
        Status::Complete((_, headers)) => {
            let mut map = HeaderMap::with_capacity(headers.len());
            for h in headers {
                let name = HeaderName::from_bytes(h.name.as_bytes()).map_err(|_| ParseError::HEADER_TOKEN)?;
                let value = HeaderValue::from_bytes(h.value).map_err(|_| ParseError::HEADER_TOKEN)?;
                map.append(name, value);
            }
            Ok(map)
        }
        Status::Partial => Err(ParseError::HEADER_TOKEN.into()),
    }
}

fn split_tokens(value: &[u8]) -> impl Iterator<Item = &str> {
    std::str::from_utf8(value)
        .unwrap_or("")
        .split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
}
