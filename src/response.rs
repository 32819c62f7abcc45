//! buffered response type backing the `request` convenience api.

use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use bytes::{Bytes, BytesMut};
use http::{HeaderMap, StatusCode, Version};
use tokio::sync::oneshot;

use crate::{
    error::Error,
    handler::{Handler, ResponseHead, ResumeHandle},
};

/// fully buffered http response.
#[derive(Debug)]
pub struct Response {
    pub status: StatusCode,
    pub version: Version,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub trailers: Option<HeaderMap>,
}

impl Response {
    /// response body interpreted as utf-8 text.
    pub fn text(&self) -> Result<&str, Error> {
        std::str::from_utf8(&self.body).map_err(|_| Error::invalid("response body is not valid utf-8"))
    }
}

/// resolves once the response completed or failed.
pub struct ResponseFuture {
    rx: oneshot::Receiver<Result<Response, Error>>,
}

impl Future for ResponseFuture {
    type Output = Result<Response, Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|res| match res {
            Ok(out) => out,
            // the driver dropped the handler without a terminal callback.
            // only reachable through process teardown races.
            Err(_) => Err(Error::socket_msg("request handler dropped")),
        })
    }
}

/// handler that buffers the whole response into a [Response].
pub(crate) struct CollectHandler {
    tx: Option<oneshot::Sender<Result<Response, Error>>>,
    head: Option<ResponseHead>,
    body: BytesMut,
}

impl CollectHandler {
    pub(crate) fn new() -> (Self, ResponseFuture) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                tx: Some(tx),
                head: None,
                body: BytesMut::new(),
            },
            ResponseFuture { rx },
        )
    }
}

impl Handler for CollectHandler {
    fn on_headers(&mut self, head: &ResponseHead, _resume: &ResumeHandle) -> bool {
        self.head = Some(head.clone());
        true
    }

    fn on_data(&mut self, chunk: Bytes) -> bool {
        self.body.extend_from_slice(&chunk);
        true
    }

    fn on_complete(&mut self, trailers: Option<HeaderMap>) {
        let Some(tx) = self.tx.take() else { return };
        let Some(head) = self.head.take() else { return };
        let _ = tx.send(Ok(Response {
            status: head.status,
            version: head.version,
            headers: head.headers,
            body: self.body.split().freeze(),
            trailers,
        }));
    }

    fn on_error(&mut self, err: Error) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Err(err));
        }
    }
}
