//! the client: one connection to one origin, a pipeline of requests on it.

use std::{
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    },
};

use tokio::sync::{broadcast, mpsc, oneshot};

use crate::{
    conn::TlsOptions,
    driver::{Driver, Item, Op},
    error::Error,
    handler::Handler,
    origin::Origin,
    request::{Request, RequestOpts},
    response::{CollectHandler, ResponseFuture},
    timeout::TimeoutConfig,
};

/// client configuration. every field has a usable default.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// max in-flight requests on the connection. default 1, i.e. the next
    /// request is written once the previous response completed.
    pub pipelining: usize,
    /// response header section byte cap. default 16 KiB.
    pub max_header_size: usize,
    pub timeout: TimeoutConfig,
    /// connect to a named local endpoint instead of tcp.
    pub socket_path: Option<PathBuf>,
    pub tls: TlsOptions,
    /// error instead of warn when a request body diverges from its declared
    /// content-length. default true.
    pub strict_content_length: bool,
    /// body bytes tolerated while quietly finishing an aborted response
    /// before the socket is closed instead. default 1 MiB.
    pub max_aborted_payload: usize,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            pipelining: 1,
            max_header_size: 16 * 1024,
            timeout: TimeoutConfig::new(),
            socket_path: None,
            tls: TlsOptions::default(),
            strict_content_length: true,
            max_aborted_payload: 1024 * 1024,
        }
    }
}

/// client lifecycle events, observable via [Client::events].
#[derive(Debug, Clone)]
pub enum Event {
    /// a connection to the origin was established.
    Connect,
    /// an established connection went away.
    Disconnect(Arc<Error>),
    /// a connection attempt failed.
    ConnectionError(Arc<Error>),
    /// the client transitioned from busy back to accepting work.
    Drain,
}

/// counters and flags shared between the handle and the driver task.
pub(crate) struct Shared {
    pub(crate) pending: AtomicUsize,
    pub(crate) running: AtomicUsize,
    pub(crate) connected: AtomicBool,
    pub(crate) closed: AtomicBool,
    pub(crate) destroyed: AtomicBool,
    pub(crate) reset: AtomicBool,
    pub(crate) writing: AtomicBool,
    pub(crate) need_drain: AtomicBool,
    next_id: AtomicU64,
}

impl Shared {
    fn new() -> Self {
        Self {
            pending: AtomicUsize::new(0),
            running: AtomicUsize::new(0),
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            reset: AtomicBool::new(false),
            writing: AtomicBool::new(false),
            need_drain: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
        }
    }
}

struct ClientInner {
    origin: Origin,
    pipelining: usize,
    tx: mpsc::UnboundedSender<Op>,
    shared: Arc<Shared>,
    events: broadcast::Sender<Event>,
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        // last handle gone: let the driver finish its backlog and exit.
        let _ = self.tx.send(Op::Release);
    }
}

/// pipelined http/1.1 client for a single origin.
///
/// cheap to clone; every clone addresses the same connection and queue. the
/// driver task winds down once the last clone is dropped.
///
/// must be created inside a tokio runtime.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    pub fn new<O>(origin: O, opts: ClientOptions) -> Result<Self, Error>
    where
        O: TryInto<Origin>,
        O::Error: Into<Error>,
    {
        let origin = origin.try_into().map_err(Into::into)?;

        if opts.max_header_size == 0 {
            return Err(Error::invalid("max_header_size must be positive"));
        }

        let shared = Arc::new(Shared::new());
        let (events, _) = broadcast::channel(32);
        let (tx, rx) = mpsc::unbounded_channel();

        Driver::spawn(origin.clone(), opts.clone(), shared.clone(), events.clone(), tx.clone(), rx);

        Ok(Self {
            inner: Arc::new(ClientInner {
                origin,
                pipelining: opts.pipelining,
                tx,
                shared,
                events,
            }),
        })
    }

    pub fn origin(&self) -> &Origin {
        &self.inner.origin
    }

    /// queue a request. returns `false` when the client is now saturated and
    /// the caller should hold further dispatches until a [Event::Drain].
    ///
    /// invalid options and closed or destroyed clients fail synchronously
    /// through `handler.on_error`.
    pub fn dispatch<H: Handler>(&self, opts: RequestOpts, handler: H) -> bool {
        let mut handler: Box<dyn Handler> = Box::new(handler);
        let shared = &self.inner.shared;

        if shared.destroyed.load(Ordering::Acquire) {
            handler.on_error(Error::Destroyed);
            return !self.busy();
        }
        if shared.closed.load(Ordering::Acquire) {
            handler.on_error(Error::Closed);
            return !self.busy();
        }

        let signal = opts.signal.clone();
        let req = match Request::new(opts) {
            Ok(req) => req,
            Err(e) => {
                handler.on_error(e);
                return !self.busy();
            }
        };

        let id = shared.next_id.fetch_add(1, Ordering::Relaxed);
        let done = tokio_util::sync::CancellationToken::new();

        shared.pending.fetch_add(1, Ordering::AcqRel);

        if let Err(rejected) = self.inner.tx.send(Op::Dispatch(Item {
            id,
            req,
            handler,
            done: done.clone(),
        })) {
            shared.pending.fetch_sub(1, Ordering::AcqRel);
            if let Op::Dispatch(mut item) = rejected.0 {
                item.handler.on_error(Error::Destroyed);
            }
            return true;
        }

        if let Some(signal) = signal {
            let tx = self.inner.tx.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = signal.cancelled() => {
                        let _ = tx.send(Op::Abort(id));
                    }
                    _ = done.cancelled() => {}
                }
            });
        }

        let busy = self.busy();
        if busy {
            shared.need_drain.store(true, Ordering::Release);
        }
        !busy
    }

    /// dispatch with a buffering handler and resolve the whole response.
    pub fn request(&self, opts: RequestOpts) -> ResponseFuture {
        let (handler, fut) = CollectHandler::new();
        self.dispatch(opts, handler);
        fut
    }

    /// stop accepting work, let queued requests finish, then tear down.
    pub async fn close(&self) {
        self.inner.shared.closed.store(true, Ordering::Release);
        let (done, wait) = oneshot::channel();
        if self.inner.tx.send(Op::Close(done)).is_ok() {
            let _ = wait.await;
        }
    }

    /// abort queued requests with `err` (default `UND_ERR_DESTROYED`) and
    /// tear the connection down.
    pub async fn destroy(&self, err: Option<Error>) {
        self.inner.shared.closed.store(true, Ordering::Release);
        self.inner.shared.destroyed.store(true, Ordering::Release);
        let (done, wait) = oneshot::channel();
        if self.inner.tx.send(Op::Destroy(err, done)).is_ok() {
            let _ = wait.await;
        }
    }

    pub fn events(&self) -> broadcast::Receiver<Event> {
        self.inner.events.subscribe()
    }

    pub fn pending(&self) -> usize {
        self.inner.shared.pending.load(Ordering::Acquire)
    }

    pub fn running(&self) -> usize {
        self.inner.shared.running.load(Ordering::Acquire)
    }

    pub fn size(&self) -> usize {
        self.pending() + self.running()
    }

    pub fn connected(&self) -> bool {
        self.inner.shared.connected.load(Ordering::Acquire)
    }

    pub fn closed(&self) -> bool {
        self.inner.shared.closed.load(Ordering::Acquire)
    }

    pub fn destroyed(&self) -> bool {
        self.inner.shared.destroyed.load(Ordering::Acquire)
    }

    /// queue saturated: as many requests in flight or queued as pipelining
    /// allows.
    pub fn full(&self) -> bool {
        self.size() >= self.inner.pipelining.max(1)
    }

    /// not accepting more work right now: saturated, draining a streaming
    /// body, or on a connection marked reset.
    pub fn busy(&self) -> bool {
        let shared = &self.inner.shared;
        shared.reset.load(Ordering::Acquire)
            || shared.writing.load(Ordering::Acquire)
            || shared.need_drain.load(Ordering::Acquire)
            || self.full()
    }
}
