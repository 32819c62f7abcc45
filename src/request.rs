use core::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use http::{
    HeaderMap, Method,
    header::{CONTENT_LENGTH, HOST},
};
use tokio_util::sync::CancellationToken;

use crate::{body::Body, error::Error};

// header keys the client generates itself. user supplied values would
// desync the connection framing.
const FORBIDDEN_HEADERS: &[&str] = &["transfer-encoding", "connection", "keep-alive", "upgrade", "expect"];

/// per request options handed to [Client::dispatch].
///
/// [Client::dispatch]: crate::client::Client::dispatch
pub struct RequestOpts {
    pub method: Method,
    /// request target. must be origin form, starting with `/`.
    pub path: String,
    pub headers: HeaderMap,
    pub body: Body,
    /// overrides the method based idempotence default (`GET`/`HEAD` true).
    pub idempotent: Option<bool>,
    /// protocol to upgrade to. the response socket is handed to
    /// `Handler::on_upgrade` once the server switches.
    pub upgrade: Option<String>,
    /// SNI hostname override for this request.
    pub servername: Option<String>,
    /// abort source. cancelling it errors the request with `UND_ERR_ABORTED`.
    pub signal: Option<CancellationToken>,
    pub headers_timeout: Option<Duration>,
    pub body_timeout: Option<Duration>,
}

impl Default for RequestOpts {
    fn default() -> Self {
        Self {
            method: Method::GET,
            path: "/".to_string(),
            headers: HeaderMap::new(),
            body: Body::Empty,
            idempotent: None,
            upgrade: None,
            servername: None,
            signal: None,
            headers_timeout: None,
            body_timeout: None,
        }
    }
}

impl RequestOpts {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            ..Self::default()
        }
    }
}

/// validated, normalized request record. the header blob is frozen at
/// construction, framing headers are generated at write time.
#[derive(Debug)]
pub(crate) struct Request {
    pub(crate) method: Method,
    pub(crate) path: String,
    /// serialized `name: value\r\n` lines, minus content-length.
    pub(crate) header_blob: Bytes,
    pub(crate) body: Body,
    /// numeric capture of a user declared content-length header.
    pub(crate) content_length: Option<u64>,
    pub(crate) has_host: bool,
    pub(crate) idempotent: bool,
    pub(crate) upgrade: Option<String>,
    pub(crate) servername: Option<String>,
    pub(crate) headers_timeout: Option<Duration>,
    pub(crate) body_timeout: Option<Duration>,
    /// method carries a payload even when the body is empty.
    pub(crate) expects_payload: bool,
}

impl Request {
    pub(crate) fn new(opts: RequestOpts) -> Result<Self, Error> {
        let RequestOpts {
            method,
            path,
            headers,
            body,
            idempotent,
            upgrade,
            servername,
            signal: _,
            headers_timeout,
            body_timeout,
        } = opts;

        if method == Method::CONNECT {
            return Err(Error::NotSupported("CONNECT"));
        }

        if !path.starts_with('/') {
            return Err(Error::invalid("path must start with '/'"));
        }

        let mut content_length = None;
        let mut has_host = false;
        let mut blob = BytesMut::new();

        for (name, value) in headers.iter() {
            if FORBIDDEN_HEADERS.contains(&name.as_str()) {
                return Err(Error::invalid(format!("header {name} is generated by the client")));
            }

            if name == CONTENT_LENGTH {
                let len = value
                    .to_str()
                    .ok()
                    .and_then(|v| v.parse::<u64>().ok())
                    .ok_or_else(|| Error::invalid("invalid content-length header"))?;
                if content_length.is_some_and(|prev| prev != len) {
                    return Err(Error::invalid("conflicting content-length headers"));
                }
                content_length = Some(len);
                continue;
            }

            if name == HOST {
                has_host = true;
            }

            blob.put_slice(name.as_str().as_bytes());
            blob.put_slice(b": ");
            blob.put_slice(value.as_bytes());
            blob.put_slice(b"\r\n");
        }

        if let (Some(declared), Some(actual)) = (content_length, body.size()) {
            if declared != actual && !matches!(body, Body::Empty) {
                return Err(Error::invalid("content-length does not match body size"));
            }
        }

        let idempotent = idempotent.unwrap_or(matches!(method, Method::GET | Method::HEAD));
        let expects_payload = matches!(method, Method::PUT | Method::POST | Method::PATCH);

        Ok(Self {
            method,
            path,
            header_blob: blob.freeze(),
            body,
            content_length,
            has_host,
            idempotent,
            upgrade,
            servername,
            headers_timeout,
            body_timeout,
            expects_payload,
        })
    }

    /// declared or derived request body length. `None` means unknown, which
    /// selects chunked framing for stream bodies.
    pub(crate) fn body_length(&self) -> Option<u64> {
        self.body.size().or(self.content_length)
    }
}

#[cfg(test)]
mod test {
    use http::header::{HeaderName, HeaderValue};

    use super::*;

    fn opts(method: Method) -> RequestOpts {
        RequestOpts::new(method, "/")
    }

    #[test]
    fn rejects_connect() {
        let err = Request::new(opts(Method::CONNECT)).unwrap_err();
        assert_eq!(err.code(), "UND_ERR_NOT_SUPPORTED");
    }

    #[test]
    fn rejects_relative_path() {
        let mut o = opts(Method::GET);
        o.path = "index.html".to_string();
        assert_eq!(Request::new(o).unwrap_err().code(), "UND_ERR_INVALID_ARG");
    }

    #[test]
    fn rejects_forbidden_headers() {
        for name in ["transfer-encoding", "connection", "keep-alive", "upgrade", "expect"] {
            let mut o = opts(Method::GET);
            o.headers.insert(
                HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_static("x"),
            );
            assert_eq!(Request::new(o).unwrap_err().code(), "UND_ERR_INVALID_ARG");
        }
    }

    #[test]
    fn captures_content_length_outside_blob() {
        let mut o = opts(Method::POST);
        o.headers.insert(CONTENT_LENGTH, HeaderValue::from_static("5"));
        o.body = Body::from("hello");
        let req = Request::new(o).unwrap();
        assert_eq!(req.content_length, Some(5));
        assert!(!req.header_blob.iter().any(|&b| b == b'5'));
    }

    #[test]
    fn rejects_mismatched_declared_length() {
        let mut o = opts(Method::POST);
        o.headers.insert(CONTENT_LENGTH, HeaderValue::from_static("3"));
        o.body = Body::from("hello");
        assert!(Request::new(o).is_err());
    }

    #[test]
    fn idempotent_defaults() {
        assert!(Request::new(opts(Method::GET)).unwrap().idempotent);
        assert!(Request::new(opts(Method::HEAD)).unwrap().idempotent);
        assert!(!Request::new(opts(Method::POST)).unwrap().idempotent);

        let mut o = opts(Method::POST);
        o.idempotent = Some(true);
        assert!(Request::new(o).unwrap().idempotent);
    }
}
