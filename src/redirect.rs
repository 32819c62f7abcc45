//! redirect following on top of [Agent].

use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode, header::HOST, header::LOCATION};
use tracing::debug;

use crate::{
    agent::Agent,
    body::Body,
    conn::Upgraded,
    error::Error,
    handler::{AbortHandle, Handler, ResponseHead, ResumeHandle},
    origin::Origin,
    request::RequestOpts,
    response::{CollectHandler, ResponseFuture},
};

const REDIRECT_STATUSES: &[StatusCode] = &[
    StatusCode::MULTIPLE_CHOICES,
    StatusCode::MOVED_PERMANENTLY,
    StatusCode::FOUND,
    StatusCode::SEE_OTHER,
    StatusCode::TEMPORARY_REDIRECT,
    StatusCode::PERMANENT_REDIRECT,
];

/// agent wrapper that follows 3xx responses up to a redirection budget.
///
/// streaming request bodies are not replayable, so they dispatch straight
/// through without redirect handling.
#[derive(Clone)]
pub struct RedirectAgent {
    agent: Agent,
    max_redirections: usize,
}

impl RedirectAgent {
    pub fn new(agent: Agent, max_redirections: usize) -> Self {
        Self {
            agent,
            max_redirections,
        }
    }

    pub fn dispatch<H: Handler>(&self, origin: &Origin, opts: RequestOpts, handler: H) -> bool {
        if self.max_redirections == 0 || opts.body.is_stream() || opts.upgrade.is_some() {
            return self.agent.dispatch(origin, opts, handler);
        }

        let saved = Saved::capture(origin, &opts);
        let wrapped = RedirectHandler {
            agent: self.agent.clone(),
            saved,
            inner: Some(Box::new(handler)),
            remaining: self.max_redirections,
            history: Vec::new(),
            redirect_to: None,
        };
        self.agent.dispatch(origin, opts, wrapped)
    }

    /// buffered request against an absolute url, redirects followed.
    pub fn request(&self, url: &str, mut opts: RequestOpts) -> ResponseFuture {
        let (mut handler, fut) = CollectHandler::new();
        match Origin::parse_with_path(url) {
            Ok((origin, path)) => {
                opts.path = path;
                self.dispatch(&origin, opts, handler);
            }
            Err(e) => handler.on_error(e),
        }
        fut
    }
}

/// replayable request state captured before the first dispatch.
struct Saved {
    origin: Origin,
    path: String,
    method: Method,
    headers: HeaderMap,
    body: Option<Bytes>,
    idempotent: Option<bool>,
    servername: Option<String>,
    signal: Option<tokio_util::sync::CancellationToken>,
    headers_timeout: Option<std::time::Duration>,
    body_timeout: Option<std::time::Duration>,
}

impl Saved {
    fn capture(origin: &Origin, opts: &RequestOpts) -> Self {
        Self {
            origin: origin.clone(),
            path: opts.path.clone(),
            method: opts.method.clone(),
            headers: opts.headers.clone(),
            body: match &opts.body {
                Body::Bytes(b) => Some(b.clone()),
                _ => None,
            },
            idempotent: opts.idempotent,
            servername: opts.servername.clone(),
            signal: opts.signal.clone(),
            headers_timeout: opts.headers_timeout,
            body_timeout: opts.body_timeout,
        }
    }

    fn to_opts(&self) -> RequestOpts {
        RequestOpts {
            method: self.method.clone(),
            path: self.path.clone(),
            headers: self.headers.clone(),
            body: match &self.body {
                Some(b) => Body::Bytes(b.clone()),
                None => Body::Empty,
            },
            idempotent: self.idempotent,
            upgrade: None,
            servername: self.servername.clone(),
            signal: self.signal.clone(),
            headers_timeout: self.headers_timeout,
            body_timeout: self.body_timeout,
        }
    }
}

/// wraps the caller's handler: 3xx heads are swallowed, their bodies
/// discarded, and the rebuilt request re-dispatched from `on_complete`.
struct RedirectHandler {
    agent: Agent,
    saved: Saved,
    inner: Option<Box<dyn Handler>>,
    remaining: usize,
    history: Vec<String>,
    redirect_to: Option<(Origin, String, StatusCode)>,
}

impl RedirectHandler {
    fn resolve_location(&self, location: &[u8]) -> Option<(Origin, String)> {
        let location = std::str::from_utf8(location).ok()?;
        if location.starts_with('/') {
            Some((self.saved.origin.clone(), location.to_string()))
        } else if location.contains("://") {
            Origin::parse_with_path(location).ok()
        } else {
            None
        }
    }
}

impl Handler for RedirectHandler {
    fn on_connect(&mut self, abort: &AbortHandle) {
        if let Some(inner) = &mut self.inner {
            inner.on_connect(abort);
        }
    }

    fn on_headers(&mut self, head: &ResponseHead, resume: &ResumeHandle) -> bool {
        if self.remaining > 0 && REDIRECT_STATUSES.contains(&head.status) {
            if let Some(target) = head
                .headers
                .get(LOCATION)
                .and_then(|loc| self.resolve_location(loc.as_bytes()))
            {
                debug!(target: "client", status = %head.status, location = %format!("{}{}", target.0, target.1), "following redirect");
                self.remaining -= 1;
                self.redirect_to = Some((target.0, target.1, head.status));
                // consume the 3xx body silently.
                return true;
            }
        }

        match &mut self.inner {
            Some(inner) => inner.on_headers(head, resume),
            None => true,
        }
    }

    fn on_data(&mut self, chunk: Bytes) -> bool {
        if self.redirect_to.is_some() {
            return true;
        }
        match &mut self.inner {
            Some(inner) => inner.on_data(chunk),
            None => true,
        }
    }

    fn on_complete(&mut self, trailers: Option<HeaderMap>) {
        let Some((origin, path, status)) = self.redirect_to.take() else {
            if let Some(inner) = &mut self.inner {
                inner.on_complete(trailers);
            }
            return;
        };

        let key = format!("{origin}{path}");
        if self.history.contains(&key) {
            if let Some(inner) = &mut self.inner {
                inner.on_error(Error::invalid("circular redirect"));
            }
            return;
        }

        let mut saved = Saved {
            origin,
            path,
            method: self.saved.method.clone(),
            headers: self.saved.headers.clone(),
            body: self.saved.body.clone(),
            idempotent: self.saved.idempotent,
            servername: self.saved.servername.clone(),
            signal: self.saved.signal.clone(),
            headers_timeout: self.saved.headers_timeout,
            body_timeout: self.saved.body_timeout,
        };

        // the previous host no longer applies.
        saved.headers.remove(HOST);

        if status == StatusCode::SEE_OTHER {
            saved.method = Method::GET;
            saved.body = None;
            let content_keys: Vec<_> = saved
                .headers
                .keys()
                .filter(|k| k.as_str().starts_with("content-"))
                .cloned()
                .collect();
            for key in content_keys {
                saved.headers.remove(key);
            }
        }

        let mut history = std::mem::take(&mut self.history);
        history.push(key);

        let next = RedirectHandler {
            agent: self.agent.clone(),
            inner: self.inner.take(),
            remaining: self.remaining,
            history,
            redirect_to: None,
            saved,
        };

        let origin = next.saved.origin.clone();
        let opts = next.saved.to_opts();
        self.agent.dispatch(&origin, opts, next);
    }

    fn on_upgrade(&mut self, head: ResponseHead, io: Upgraded) {
        if let Some(inner) = &mut self.inner {
            inner.on_upgrade(head, io);
        }
    }

    fn on_error(&mut self, err: Error) {
        if let Some(inner) = &mut self.inner {
            inner.on_error(err);
        }
    }
}
