//! streaming handler contract between the client and its callers.

use bytes::Bytes;
use http::{HeaderMap, StatusCode, Version};
use tokio::sync::mpsc;

use crate::{conn::Upgraded, driver::Op, error::Error};

/// response head delivered to [Handler::on_headers].
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub status: StatusCode,
    pub version: Version,
    pub headers: HeaderMap,
}

/// per request callback surface.
///
/// callbacks arrive in order `on_connect`, `on_headers`, `on_data`*,
/// `on_complete`, with `on_error` possibly replacing any suffix of that
/// sequence. after `on_error` nothing else is invoked. `on_headers` and
/// `on_data` returning `false` requests back-pressure: the client stops
/// reading until the [ResumeHandle] is triggered.
pub trait Handler: Send + 'static {
    /// the request is about to be written to a connection.
    fn on_connect(&mut self, abort: &AbortHandle) {
        let _ = abort;
    }

    /// response head arrived. return `false` to pause delivery.
    fn on_headers(&mut self, head: &ResponseHead, resume: &ResumeHandle) -> bool {
        let (_, _) = (head, resume);
        true
    }

    /// a chunk of response body. return `false` to pause delivery.
    fn on_data(&mut self, chunk: Bytes) -> bool {
        let _ = chunk;
        true
    }

    /// response finished, with trailers when the server sent any.
    fn on_complete(&mut self, trailers: Option<HeaderMap>) {
        let _ = trailers;
    }

    /// the server switched protocols. the handler now owns the socket.
    fn on_upgrade(&mut self, head: ResponseHead, io: Upgraded) {
        let (_, _) = (head, io);
    }

    /// terminal failure. exactly zero or one per request.
    fn on_error(&mut self, err: Error) {
        let _ = err;
    }
}

impl Handler for Box<dyn Handler> {
    fn on_connect(&mut self, abort: &AbortHandle) {
        (**self).on_connect(abort)
    }

    fn on_headers(&mut self, head: &ResponseHead, resume: &ResumeHandle) -> bool {
        (**self).on_headers(head, resume)
    }

    fn on_data(&mut self, chunk: Bytes) -> bool {
        (**self).on_data(chunk)
    }

    fn on_complete(&mut self, trailers: Option<HeaderMap>) {
        (**self).on_complete(trailers)
    }

    fn on_upgrade(&mut self, head: ResponseHead, io: Upgraded) {
        (**self).on_upgrade(head, io)
    }

    fn on_error(&mut self, err: Error) {
        (**self).on_error(err)
    }
}

/// aborts one dispatched request. cheap to clone, safe to trigger from any
/// task; a request that already finished ignores the abort.
#[derive(Clone)]
pub struct AbortHandle {
    pub(crate) tx: mpsc::UnboundedSender<Op>,
    pub(crate) id: u64,
}

impl AbortHandle {
    pub fn abort(&self) {
        let _ = self.tx.send(Op::Abort(self.id));
    }
}

/// releases the back-pressure requested by returning `false` from
/// [Handler::on_headers] or [Handler::on_data].
#[derive(Clone)]
pub struct ResumeHandle {
    pub(crate) tx: mpsc::UnboundedSender<Op>,
    pub(crate) epoch: u64,
}

impl ResumeHandle {
    pub fn resume(&self) {
        let _ = self.tx.send(Op::ResumeParser { epoch: self.epoch });
    }
}
