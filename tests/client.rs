mod common;

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use bytes::Bytes;
use http::{Method, header::CONTENT_LENGTH, header::HeaderValue};
use tokio::io::AsyncWriteExt;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use tandem::{
    AbortHandle, Body, BodySize, BoxBody, Client, ClientOptions, Event, Handler, Once, RequestOpts,
    ResponseHead, ResumeHandle, TimeoutConfig,
};

use common::*;

const OK_HELLO: &[u8] = b"HTTP/1.1 200 OK\r\ncontent-length: 5\r\n\r\nhello";

fn opts(pipelining: usize) -> ClientOptions {
    ClientOptions {
        pipelining,
        ..ClientOptions::default()
    }
}

/// handler that records its callback sequence for ordering assertions.
struct RecordingHandler {
    log: Arc<Mutex<Vec<String>>>,
    terminal: Arc<Notify>,
    cancel_on_data: Option<CancellationToken>,
}

impl RecordingHandler {
    fn new() -> (Self, Arc<Mutex<Vec<String>>>, Arc<Notify>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let terminal = Arc::new(Notify::new());
        (
            Self {
                log: log.clone(),
                terminal: terminal.clone(),
                cancel_on_data: None,
            },
            log,
            terminal,
        )
    }
}

impl Handler for RecordingHandler {
    fn on_headers(&mut self, head: &ResponseHead, _resume: &ResumeHandle) -> bool {
        self.log.lock().unwrap().push(format!("headers:{}", head.status.as_u16()));
        true
    }

    fn on_data(&mut self, chunk: Bytes) -> bool {
        self.log.lock().unwrap().push(format!("data:{}", chunk.len()));
        if let Some(token) = &self.cancel_on_data {
            token.cancel();
        }
        true
    }

    fn on_complete(&mut self, _trailers: Option<http::HeaderMap>) {
        self.log.lock().unwrap().push("complete".to_string());
        self.terminal.notify_one();
    }

    fn on_error(&mut self, err: tandem::error::Error) {
        self.log.lock().unwrap().push(format!("error:{}", err.code()));
        self.terminal.notify_one();
    }

    fn on_connect(&mut self, _abort: &AbortHandle) {
        self.log.lock().unwrap().push("connect".to_string());
    }
}

#[tokio::test]
async fn keep_alive_pipelined_gets() {
    let (listener, url) = listener().await;

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let buf = read_request_heads(&mut stream, 3).await;
        assert_eq!(count_occurrences(&buf, b"GET / HTTP/1.1"), 3);
        for _ in 0..3 {
            stream.write_all(OK_HELLO).await.unwrap();
        }
        hold_until_closed(&mut stream).await;
    });

    let client = Client::new(url.as_str(), opts(3)).unwrap();
    let mut events = client.events();

    let (r1, r2, r3) = tokio::join!(
        client.request(RequestOpts::default()),
        client.request(RequestOpts::default()),
        client.request(RequestOpts::default()),
    );

    for res in [r1, r2, r3] {
        let res = res.unwrap();
        assert_eq!(res.status.as_u16(), 200);
        assert_eq!(&res.body[..], b"hello");
    }

    let (mut connects, mut disconnects) = (0, 0);
    while let Ok(event) = events.try_recv() {
        match event {
            Event::Connect => connects += 1,
            Event::Disconnect(_) => disconnects += 1,
            _ => {}
        }
    }
    assert_eq!(connects, 1, "all three requests share one connection");
    assert_eq!(disconnects, 0);

    drop(client);
    server.await.unwrap();
}

#[tokio::test]
async fn socket_drop_errors_head_and_retries_tail() {
    let (listener, url) = listener().await;

    let server = tokio::spawn(async move {
        // first connection: all three requests arrive pipelined, the first
        // response dies mid body.
        let (mut stream, _) = listener.accept().await.unwrap();
        let buf = read_request_heads(&mut stream, 3).await;
        assert!(contains(&buf, b"GET /1 "));
        assert!(contains(&buf, b"GET /2 "));
        assert!(contains(&buf, b"GET /3 "));
        stream
            .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 5\r\n\r\nhe")
            .await
            .unwrap();
        stream.flush().await.unwrap();
        drop(stream);

        // second connection: the idempotent tail is re-issued in order.
        let (mut stream, _) = listener.accept().await.unwrap();
        let buf = read_request_heads(&mut stream, 2).await;
        let second = buf.windows(7).position(|w| w == b"GET /2 ").unwrap();
        let third = buf.windows(7).position(|w| w == b"GET /3 ").unwrap();
        assert!(second < third, "retried requests keep their original order");
        for _ in 0..2 {
            stream.write_all(OK_HELLO).await.unwrap();
        }
        hold_until_closed(&mut stream).await;
    });

    let client = Client::new(url.as_str(), opts(3)).unwrap();
    let mut events = client.events();

    let (r1, r2, r3) = tokio::join!(
        client.request(RequestOpts::new(Method::GET, "/1")),
        client.request(RequestOpts::new(Method::GET, "/2")),
        client.request(RequestOpts::new(Method::GET, "/3")),
    );

    assert_eq!(r1.unwrap_err().code(), "UND_ERR_SOCKET");
    assert_eq!(&r2.unwrap().body[..], b"hello");
    assert_eq!(&r3.unwrap().body[..], b"hello");

    let (mut connects, mut disconnects) = (0, 0);
    while let Ok(event) = events.try_recv() {
        match event {
            Event::Connect => connects += 1,
            Event::Disconnect(_) => disconnects += 1,
            _ => {}
        }
    }
    assert_eq!(connects, 2);
    assert_eq!(disconnects, 1);

    drop(client);
    server.await.unwrap();
}

#[tokio::test]
async fn non_idempotent_request_waits_for_pipeline_drain() {
    let (listener, url) = listener().await;

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let buf = read_request_heads(&mut stream, 1).await;
        assert!(contains(&buf, b"GET /first "));
        assert!(!contains(&buf, b"POST"), "POST must wait for the GET response");

        // nothing else may arrive while the GET response is outstanding.
        let mut tmp = [0u8; 256];
        let extra = tokio::time::timeout(Duration::from_millis(100), tokio::io::AsyncReadExt::read(&mut stream, &mut tmp)).await;
        assert!(extra.is_err(), "wire must stay quiet until the GET completes");

        stream.write_all(OK_HELLO).await.unwrap();

        let buf = read_until_contains(&mut stream, b"world").await;
        assert!(contains(&buf, b"POST /second "));
        assert!(contains(&buf, b"content-length: 5\r\n\r\nworld"));
        stream.write_all(OK_HELLO).await.unwrap();
        hold_until_closed(&mut stream).await;
    });

    let client = Client::new(url.as_str(), opts(2)).unwrap();

    let get = client.request(RequestOpts::new(Method::GET, "/first"));
    let mut post_opts = RequestOpts::new(Method::POST, "/second");
    post_opts.body = Body::from("world");
    let post = client.request(post_opts);

    let (get, post) = tokio::join!(get, post);
    assert_eq!(get.unwrap().status.as_u16(), 200);
    assert_eq!(post.unwrap().status.as_u16(), 200);

    drop(client);
    server.await.unwrap();
}

#[tokio::test]
async fn abort_mid_body_destroys_socket_without_further_callbacks() {
    let (listener, url) = listener().await;

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let _ = read_request_heads(&mut stream, 1).await;
        // a large declared body with only a prefix delivered keeps the
        // request mid stream when the abort lands.
        stream
            .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 1000\r\n\r\npartial-body")
            .await
            .unwrap();
        hold_until_closed(&mut stream).await;

        // the client recovers on a fresh connection.
        let (mut stream, _) = listener.accept().await.unwrap();
        let _ = read_request_heads(&mut stream, 1).await;
        stream.write_all(OK_HELLO).await.unwrap();
        hold_until_closed(&mut stream).await;
    });

    let client = Client::new(url.as_str(), opts(1)).unwrap();

    let token = CancellationToken::new();
    let (mut handler, log, terminal) = RecordingHandler::new();
    handler.cancel_on_data = Some(token.clone());

    let mut opts_abort = RequestOpts::default();
    opts_abort.signal = Some(token);
    client.dispatch(opts_abort, handler);

    terminal.notified().await;

    let log = log.lock().unwrap().clone();
    assert_eq!(log[0], "connect");
    assert_eq!(log[1], "headers:200");
    assert!(log[2].starts_with("data:"));
    assert_eq!(log.last().unwrap(), "error:UND_ERR_ABORTED");
    assert_eq!(
        log.iter().filter(|e| e.starts_with("error:")).count(),
        1,
        "exactly one terminal error"
    );
    assert!(!log.iter().any(|e| e == "complete"), "no callbacks after the error");

    // the client is still usable afterwards.
    let res = client.request(RequestOpts::default()).await.unwrap();
    assert_eq!(&res.body[..], b"hello");

    drop(client);
    server.await.unwrap();
}

#[tokio::test]
async fn strict_content_length_mismatch_fails_request() {
    let (listener, url) = listener().await;

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        // the client tears the connection down before completing the body.
        hold_until_closed(&mut stream).await;
    });

    let client = Client::new(url.as_str(), opts(1)).unwrap();

    let mut post = RequestOpts::new(Method::POST, "/upload");
    post.headers.insert(CONTENT_LENGTH, HeaderValue::from_static("5"));
    post.body = Body::Stream(BoxBody::new(Once::new("hell"), BodySize::Stream));

    let err = client.request(post).await.unwrap_err();
    assert_eq!(err.code(), "UND_ERR_CONTENT_LENGTH_MISMATCH");
    assert!(!client.connected());

    drop(client);
    server.await.unwrap();
}

#[tokio::test]
async fn lax_content_length_overlong_body_taints_instead_of_erroring() {
    let (listener, url) = listener().await;

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        // exactly the declared five body bytes arrive, the excess is
        // truncated client side.
        let buf = read_until_contains(&mut stream, b"\r\n\r\nhello").await;
        assert!(contains(&buf, b"content-length: 5"));
        assert!(!contains(&buf, b"world"), "bytes past the declared length stay off the wire");
        stream
            .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 4\r\n\r\ndone")
            .await
            .unwrap();
        hold_until_closed(&mut stream).await;

        // the tainted connection is closed after draining, and the client
        // carries on over a fresh one.
        let (mut stream, _) = listener.accept().await.unwrap();
        let _ = read_request_heads(&mut stream, 1).await;
        stream.write_all(OK_HELLO).await.unwrap();
        hold_until_closed(&mut stream).await;
    });

    let client = Client::new(
        url.as_str(),
        ClientOptions {
            pipelining: 1,
            strict_content_length: false,
            ..ClientOptions::default()
        },
    )
    .unwrap();
    let mut events = client.events();

    let mut post = RequestOpts::new(Method::POST, "/upload");
    post.headers.insert(CONTENT_LENGTH, HeaderValue::from_static("5"));
    post.body = Body::Stream(BoxBody::new(Once::new("hello world"), BodySize::Stream));

    // the request completes normally instead of erroring.
    let res = client.request(post).await.unwrap();
    assert_eq!(&res.body[..], b"done");

    tokio::time::sleep(Duration::from_millis(20)).await;

    // the connection survived until its response drained, then closed as an
    // informational reset rather than a failure.
    let mut disconnect_codes = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let Event::Disconnect(err) = event {
            disconnect_codes.push(err.code());
        }
    }
    assert_eq!(disconnect_codes, vec!["UND_ERR_INFO"]);

    let res = client.request(RequestOpts::default()).await.unwrap();
    assert_eq!(&res.body[..], b"hello");

    drop(client);
    server.await.unwrap();
}

#[tokio::test]
async fn lax_content_length_short_body_still_completes() {
    let (listener, url) = listener().await;

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        // only four of the declared five bytes ever arrive. answer anyway.
        let buf = read_until_contains(&mut stream, b"\r\n\r\nhell").await;
        assert!(contains(&buf, b"content-length: 5"));
        stream
            .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 4\r\n\r\ndone")
            .await
            .unwrap();
        hold_until_closed(&mut stream).await;
    });

    let client = Client::new(
        url.as_str(),
        ClientOptions {
            pipelining: 1,
            strict_content_length: false,
            ..ClientOptions::default()
        },
    )
    .unwrap();

    let mut post = RequestOpts::new(Method::POST, "/upload");
    post.headers.insert(CONTENT_LENGTH, HeaderValue::from_static("5"));
    post.body = Body::Stream(BoxBody::new(Once::new("hell"), BodySize::Stream));

    let res = client.request(post).await.unwrap();
    assert_eq!(res.status.as_u16(), 200);
    assert_eq!(&res.body[..], b"done");

    drop(client);
    server.await.unwrap();
}

#[tokio::test]
async fn drain_event_fires_once_per_transition() {
    let (listener, url) = listener().await;

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let _ = read_request_heads(&mut stream, 1).await;
        stream.write_all(OK_HELLO).await.unwrap();
        let _ = read_request_heads(&mut stream, 1).await;
        stream.write_all(OK_HELLO).await.unwrap();
        hold_until_closed(&mut stream).await;
    });

    let client = Client::new(url.as_str(), opts(1)).unwrap();
    let mut events = client.events();

    let first = client.request(RequestOpts::default());
    assert!(client.busy(), "pipelining=1 saturates after one dispatch");
    let second = client.request(RequestOpts::default());

    let (first, second) = tokio::join!(first, second);
    first.unwrap();
    second.unwrap();

    // give the driver a moment to settle the final transition.
    tokio::time::sleep(Duration::from_millis(20)).await;

    let mut drains = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, Event::Drain) {
            drains += 1;
        }
    }
    assert_eq!(drains, 1, "drain only on the busy to non-busy transition");

    drop(client);
    server.await.unwrap();
}

#[tokio::test]
async fn headers_timeout_surfaces_typed_error() {
    let (listener, url) = listener().await;

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        // swallow the request and never answer.
        hold_until_closed(&mut stream).await;
    });

    let client = Client::new(
        url.as_str(),
        ClientOptions {
            pipelining: 1,
            timeout: TimeoutConfig {
                headers_timeout: Duration::from_millis(200),
                ..TimeoutConfig::new()
            },
            ..ClientOptions::default()
        },
    )
    .unwrap();

    let err = client.request(RequestOpts::default()).await.unwrap_err();
    assert_eq!(err.code(), "UND_ERR_HEADERS_TIMEOUT");

    drop(client);
    server.await.unwrap();
}

#[tokio::test]
async fn chunked_response_with_trailers() {
    let (listener, url) = listener().await;

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let _ = read_request_heads(&mut stream, 1).await;
        stream
            .write_all(
                b"HTTP/1.1 200 OK\r\ntransfer-encoding: chunked\r\ntrailer: x-checksum\r\n\r\n\
                  5\r\nhello\r\n0\r\nx-checksum: abc\r\n\r\n",
            )
            .await
            .unwrap();
        hold_until_closed(&mut stream).await;
    });

    let client = Client::new(url.as_str(), opts(1)).unwrap();
    let res = client.request(RequestOpts::default()).await.unwrap();

    assert_eq!(&res.body[..], b"hello");
    let trailers = res.trailers.expect("trailers delivered on completion");
    assert_eq!(trailers.get("x-checksum").unwrap(), "abc");

    drop(client);
    server.await.unwrap();
}

#[tokio::test]
async fn advertised_trailer_missing_is_an_error() {
    let (listener, url) = listener().await;

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let _ = read_request_heads(&mut stream, 1).await;
        stream
            .write_all(
                b"HTTP/1.1 200 OK\r\ntransfer-encoding: chunked\r\ntrailer: x-checksum\r\n\r\n\
                  5\r\nhello\r\n0\r\n\r\n",
            )
            .await
            .unwrap();
        hold_until_closed(&mut stream).await;
    });

    let client = Client::new(url.as_str(), opts(1)).unwrap();
    let err = client.request(RequestOpts::default()).await.unwrap_err();
    assert_eq!(err.code(), "UND_ERR_TRAILER_MISMATCH");

    drop(client);
    server.await.unwrap();
}

#[tokio::test]
async fn connection_close_response_is_not_reused() {
    let (listener, url) = listener().await;

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let _ = read_request_heads(&mut stream, 1).await;
        stream
            .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 5\r\nconnection: close\r\n\r\nhello")
            .await
            .unwrap();
        drop(stream);

        let (mut stream, _) = listener.accept().await.unwrap();
        let _ = read_request_heads(&mut stream, 1).await;
        stream.write_all(OK_HELLO).await.unwrap();
        hold_until_closed(&mut stream).await;
    });

    let client = Client::new(url.as_str(), opts(1)).unwrap();

    let res = client.request(RequestOpts::default()).await.unwrap();
    assert_eq!(&res.body[..], b"hello");

    let res = client.request(RequestOpts::default()).await.unwrap();
    assert_eq!(&res.body[..], b"hello");

    drop(client);
    server.await.unwrap();
}

#[tokio::test]
async fn eof_terminated_body_reads_to_close() {
    let (listener, url) = listener().await;

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let _ = read_request_heads(&mut stream, 1).await;
        stream
            .write_all(b"HTTP/1.1 200 OK\r\n\r\nstreamed until close")
            .await
            .unwrap();
        stream.flush().await.unwrap();
        drop(stream);
    });

    let client = Client::new(url.as_str(), opts(1)).unwrap();
    let res = client.request(RequestOpts::default()).await.unwrap();
    assert_eq!(&res.body[..], b"streamed until close");

    drop(client);
    server.await.unwrap();
}

#[tokio::test]
async fn closed_client_rejects_new_dispatches() {
    let (listener, url) = listener().await;
    let client = Client::new(url.as_str(), opts(1)).unwrap();

    client.close().await;

    let err = client.request(RequestOpts::default()).await.unwrap_err();
    assert_eq!(err.code(), "UND_ERR_DESTROYED");
    assert!(client.destroyed());

    drop(listener);
}

#[tokio::test]
async fn chunked_request_body_frames() {
    let (listener, url) = listener().await;

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let buf = read_until_contains(&mut stream, b"0\r\n\r\n").await;
        assert!(contains(&buf, b"transfer-encoding: chunked\r\n"));
        assert!(contains(&buf, b"\r\n5\r\nhello\r\n0\r\n\r\n"));
        stream.write_all(OK_HELLO).await.unwrap();
        hold_until_closed(&mut stream).await;
    });

    let client = Client::new(url.as_str(), opts(1)).unwrap();

    let mut post = RequestOpts::new(Method::POST, "/upload");
    post.body = Body::Stream(BoxBody::new(Once::new("hello"), BodySize::Stream));

    let res = client.request(post).await.unwrap();
    assert_eq!(res.status.as_u16(), 200);

    drop(client);
    server.await.unwrap();
}

#[cfg(unix)]
#[tokio::test]
async fn socket_path_uses_local_endpoint() {
    let path = std::env::temp_dir().join(format!("tandem-test-{}.sock", std::process::id()));
    let _ = std::fs::remove_file(&path);
    let listener = tokio::net::UnixListener::bind(&path).unwrap();

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = Vec::new();
        let mut tmp = [0u8; 1024];
        while !contains(&buf, b"\r\n\r\n") {
            let n = tokio::io::AsyncReadExt::read(&mut stream, &mut tmp).await.unwrap();
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&tmp[..n]);
        }
        stream.write_all(OK_HELLO).await.unwrap();
    });

    let client = Client::new(
        "http://localhost",
        ClientOptions {
            socket_path: Some(path.clone()),
            ..ClientOptions::default()
        },
    )
    .unwrap();

    let res = client.request(RequestOpts::default()).await.unwrap();
    assert_eq!(&res.body[..], b"hello");

    drop(client);
    server.await.unwrap();
    let _ = std::fs::remove_file(&path);
}
