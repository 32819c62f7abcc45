//! request head serialization.

use bytes::{BufMut, BytesMut};

use crate::request::Request;

/// body framing picked for a request at write time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Framing {
    /// no body bytes follow.
    None,
    /// fixed length body written raw after the header section.
    Length(u64),
    /// chunked stream. the header section is left unterminated, the leading
    /// `\r\n` of the first chunk frame closes it.
    Chunked,
}

/// write the request line, connection policy, host fallback, frozen header
/// blob and framing headers into `dst`.
pub(crate) fn encode_head(dst: &mut BytesMut, req: &Request, pipelining: usize, host: &str, framing: Framing) {
    dst.reserve(req.method.as_str().len() + req.path.len() + req.header_blob.len() + 64);

    dst.put_slice(req.method.as_str().as_bytes());
    dst.put_slice(b" ");
    dst.put_slice(req.path.as_bytes());
    dst.put_slice(b" HTTP/1.1\r\n");

    match req.upgrade {
        Some(ref proto) => {
            dst.put_slice(b"connection: upgrade\r\nupgrade: ");
            dst.put_slice(proto.as_bytes());
            dst.put_slice(b"\r\n");
        }
        None if pipelining > 0 => dst.put_slice(b"connection: keep-alive\r\n"),
        None => dst.put_slice(b"connection: close\r\n"),
    }

    if !req.has_host {
        dst.put_slice(b"host: ");
        dst.put_slice(host.as_bytes());
        dst.put_slice(b"\r\n");
    }

    dst.put_slice(&req.header_blob);

    match framing {
        Framing::None if req.expects_payload => dst.put_slice(b"content-length: 0\r\n\r\n\r\n"),
        Framing::None => dst.put_slice(b"\r\n"),
        Framing::Length(n) => {
            dst.put_slice(b"content-length: ");
            dst.put_slice(n.to_string().as_bytes());
            dst.put_slice(b"\r\n\r\n");
        }
        Framing::Chunked => dst.put_slice(b"transfer-encoding: chunked\r\n"),
    }
}

#[cfg(test)]
mod test {
    use http::Method;
    use http::header::{HeaderValue, USER_AGENT};

    use crate::request::RequestOpts;

    use super::*;

    fn req(method: Method) -> Request {
        Request::new(RequestOpts::new(method, "/index")).unwrap()
    }

    fn encoded(req: &Request, pipelining: usize, framing: Framing) -> String {
        let mut dst = BytesMut::new();
        encode_head(&mut dst, req, pipelining, "example.com", framing);
        String::from_utf8(dst.to_vec()).unwrap()
    }

    #[test]
    fn get_with_keep_alive() {
        let out = encoded(&req(Method::GET), 1, Framing::None);
        assert_eq!(
            out,
            "GET /index HTTP/1.1\r\nconnection: keep-alive\r\nhost: example.com\r\n\r\n"
        );
    }

    #[test]
    fn connection_close_without_pipelining() {
        let out = encoded(&req(Method::GET), 0, Framing::None);
        assert!(out.contains("connection: close\r\n"));
    }

    #[test]
    fn empty_payload_method_declares_zero_length() {
        let out = encoded(&req(Method::POST), 1, Framing::None);
        assert!(out.ends_with("content-length: 0\r\n\r\n\r\n"));
    }

    #[test]
    fn fixed_length_framing() {
        let out = encoded(&req(Method::POST), 1, Framing::Length(5));
        assert!(out.ends_with("content-length: 5\r\n\r\n"));
    }

    #[test]
    fn chunked_framing_leaves_head_open() {
        let out = encoded(&req(Method::POST), 1, Framing::Chunked);
        assert!(out.ends_with("transfer-encoding: chunked\r\n"));
        assert!(!out.ends_with("\r\n\r\n"));
    }

    #[test]
    fn upgrade_headers() {
        let mut opts = RequestOpts::new(Method::GET, "/chat");
        opts.upgrade = Some("websocket".to_string());
        let req = Request::new(opts).unwrap();
        let out = encoded(&req, 1, Framing::None);
        assert!(out.contains("connection: upgrade\r\nupgrade: websocket\r\n"));
    }

    #[test]
    fn user_host_header_suppresses_fallback() {
        let mut opts = RequestOpts::new(Method::GET, "/");
        opts.headers.insert("host", HeaderValue::from_static("other.example"));
        opts.headers.insert(USER_AGENT, HeaderValue::from_static("tandem"));
        let req = Request::new(opts).unwrap();
        let out = encoded(&req, 1, Framing::None);
        assert!(out.contains("host: other.example\r\n"));
        assert!(!out.contains("host: example.com"));
        assert!(out.contains("user-agent: tandem\r\n"));
    }
}
