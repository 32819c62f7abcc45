//! per client driver task: the resume scheduler, socket i/o and parser
//! callback dispatch all run here, so no two of them are ever concurrent
//! for one client.

use std::{
    future::Future,
    io,
    pin::Pin,
    sync::{Arc, atomic::Ordering},
    time::Duration,
};

use bytes::{Buf, Bytes, BytesMut};
use http::Method;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf},
    sync::{mpsc, oneshot},
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::{
    body::{Body, BoxBody},
    client::{ClientOptions, Event, Shared},
    conn::{self, Io, Upgraded},
    error::{Error, TimeoutError, TlsError},
    handler::{AbortHandle, Handler, ResponseHead, ResumeHandle},
    origin::Origin,
    proto::{
        coding::{Decode, Decoder, Encoder},
        decode::{Head, decode_head, decode_trailers},
        encode::{Framing, encode_head},
    },
    queue::Queue,
    request::Request,
    timeout::TimerPhase,
};

// reconnect backoff doubles per failed attempt up to this cap.
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);
// stop pulling body chunks while this much output is already buffered.
const WRITE_BUF_HIGH: usize = 64 * 1024;

pub(crate) enum Op {
    Dispatch(Item),
    Abort(u64),
    ResumeParser { epoch: u64 },
    Close(oneshot::Sender<()>),
    Destroy(Option<Error>, oneshot::Sender<()>),
    /// last client handle dropped: finish the backlog, then tear down.
    Release,
}

pub(crate) struct Item {
    pub(crate) id: u64,
    pub(crate) req: Request,
    pub(crate) handler: Box<dyn Handler>,
    pub(crate) done: CancellationToken,
}

struct Slot {
    id: u64,
    req: Request,
    handler: Box<dyn Handler>,
    done: CancellationToken,
    aborted: bool,
    errored: bool,
}

impl Slot {
    fn new(item: Item) -> Self {
        Self {
            id: item.id,
            req: item.req,
            handler: item.handler,
            done: item.done,
            aborted: false,
            errored: false,
        }
    }

    /// exactly one terminal error per request. later calls are no-ops.
    fn error(&mut self, err: Error) {
        if !self.errored {
            self.errored = true;
            self.handler.on_error(err);
        }
        self.done.cancel();
    }
}

impl Drop for Slot {
    fn drop(&mut self) {
        self.done.cancel();
    }
}

enum Stage {
    Head,
    Body(Decoder),
}

struct Conn {
    read: ReadHalf<Io>,
    write: WriteHalf<Io>,
    read_buf: BytesMut,
    write_buf: BytesMut,
    stage: Stage,
    /// whether the connection survives the current response.
    keep_alive: bool,
    /// trailer names advertised by the current response head.
    trailer_names: Vec<String>,
    idle_timeout: Duration,
    head_since: Instant,
    last_body: Instant,
    idle_since: Instant,
}

enum Socket {
    None,
    Connecting {
        fut: Pin<Box<dyn Future<Output = Result<Io, Error>> + Send>>,
        since: Instant,
    },
    Connected(Conn),
}

struct WriteStream {
    body: BoxBody,
    encoder: Encoder,
}

enum Tick {
    Op(Option<Op>),
    Timer,
    ConnectDone(Result<Io, Error>),
    Read(io::Result<usize>),
    Wrote(io::Result<usize>),
    BodyChunk(Option<Result<Bytes, Error>>),
}

pub(crate) struct Driver {
    origin: Origin,
    opts: ClientOptions,
    shared: Arc<Shared>,
    events: tokio::sync::broadcast::Sender<Event>,
    tx: mpsc::UnboundedSender<Op>,
    rx: mpsc::UnboundedReceiver<Op>,
    rx_closed: bool,
    queue: Queue<Slot>,
    socket: Socket,
    servername: Option<String>,
    reset: bool,
    writing: Option<WriteStream>,
    paused: bool,
    retry_delay: Duration,
    retry_at: Option<Instant>,
    timer_phase: TimerPhase,
    deadline: Option<Instant>,
    closed: bool,
    destroyed: bool,
    destroy_err: Option<Error>,
    on_destroyed: Vec<oneshot::Sender<()>>,
    /// connection generation, invalidates stale resume handles.
    epoch: u64,
    host_header: String,
    tls_state: Arc<conn::TlsState>,
}

impl Driver {
    pub(crate) fn spawn(
        origin: Origin,
        opts: ClientOptions,
        shared: Arc<Shared>,
        events: tokio::sync::broadcast::Sender<Event>,
        tx: mpsc::UnboundedSender<Op>,
        rx: mpsc::UnboundedReceiver<Op>,
    ) {
        let servername = opts
            .tls
            .servername
            .clone()
            .or_else(|| origin.default_servername().map(str::to_string));
        let host_header = origin.host_header();

        let driver = Self {
            origin,
            opts,
            shared,
            events,
            tx,
            rx,
            rx_closed: false,
            queue: Queue::new(),
            socket: Socket::None,
            servername,
            reset: false,
            writing: None,
            paused: false,
            retry_delay: Duration::ZERO,
            retry_at: None,
            timer_phase: TimerPhase::None,
            deadline: None,
            closed: false,
            destroyed: false,
            destroy_err: None,
            on_destroyed: Vec::new(),
            epoch: 0,
            host_header,
            tls_state: Arc::new(conn::TlsState::new()),
        };

        tokio::spawn(driver.run());
    }

    async fn run(mut self) {
        loop {
            self.resume();
            self.update_drain();
            self.retune_timer();
            self.publish_counters();

            if self.finished() {
                break;
            }

            let tick = self.next_tick().await;
            self.handle_tick(tick);
        }
        debug!(target: "client", origin = %self.origin, "client driver exited");
    }

    fn finished(&mut self) -> bool {
        if self.destroyed && self.queue.is_empty() && matches!(self.socket, Socket::None) {
            for done in self.on_destroyed.drain(..) {
                let _ = done.send(());
            }
            true
        } else {
            false
        }
    }

    async fn next_tick(&mut self) -> Tick {
        let deadline = self.deadline;
        let rx_closed = self.rx_closed;

        match &mut self.socket {
            Socket::None => tokio::select! {
                biased;
                op = self.rx.recv(), if !rx_closed => Tick::Op(op),
                _ = sleep_or_never(deadline) => Tick::Timer,
            },
            Socket::Connecting { fut, .. } => tokio::select! {
                biased;
                op = self.rx.recv(), if !rx_closed => Tick::Op(op),
                _ = sleep_or_never(deadline) => Tick::Timer,
                res = fut.as_mut() => Tick::ConnectDone(res),
            },
            Socket::Connected(conn) => {
                let Conn {
                    read,
                    write,
                    read_buf,
                    write_buf,
                    ..
                } = conn;
                let paused = self.paused;
                let body = &mut self.writing;
                let want_body = body.is_some() && write_buf.len() < WRITE_BUF_HIGH;
                let want_write = !write_buf.is_empty();

                tokio::select! {
                    biased;
                    op = self.rx.recv(), if !rx_closed => Tick::Op(op),
                    _ = sleep_or_never(deadline) => Tick::Timer,
                    res = write_some(write, write_buf), if want_write => Tick::Wrote(res),
                    chunk = next_body_chunk(body), if want_body => Tick::BodyChunk(chunk),
                    res = read.read_buf(read_buf), if !paused => Tick::Read(res),
                }
            }
        }
    }

    fn handle_tick(&mut self, tick: Tick) {
        match tick {
            Tick::Op(None) => {
                self.rx_closed = true;
                self.closed = true;
                self.shared.closed.store(true, Ordering::Release);
                // every resume handle is gone with the channel, so a pause
                // could never be lifted again.
                self.paused = false;
            }
            Tick::Op(Some(op)) => self.handle_op(op),
            Tick::Timer => self.on_timer(),
            Tick::ConnectDone(res) => self.on_connect_done(res),
            Tick::Read(Ok(0)) => self.on_read_eof(),
            Tick::Read(Ok(_)) => self.process_read(),
            Tick::Read(Err(e)) => self.teardown_socket(e.into()),
            Tick::Wrote(Ok(0)) => self.teardown_socket(Error::socket_msg("write zero")),
            Tick::Wrote(Ok(n)) => {
                if let Socket::Connected(conn) = &mut self.socket {
                    conn.write_buf.advance(n);
                }
            }
            Tick::Wrote(Err(e)) => self.teardown_socket(e.into()),
            Tick::BodyChunk(Some(Ok(chunk))) => self.on_body_chunk(chunk),
            Tick::BodyChunk(Some(Err(e))) => self.on_stream_body_failure(e),
            Tick::BodyChunk(None) => self.on_body_end(),
        }
    }

    fn handle_op(&mut self, op: Op) {
        match op {
            Op::Dispatch(mut item) => {
                if self.destroyed {
                    item.handler.on_error(Error::Destroyed);
                    item.done.cancel();
                } else if self.closed {
                    item.handler.on_error(Error::Closed);
                    item.done.cancel();
                } else {
                    self.queue.push(Slot::new(item));
                }
            }
            Op::Abort(id) => self.on_abort(id),
            Op::ResumeParser { epoch } => {
                if epoch == self.epoch && self.paused {
                    trace!(target: "client", "parser resumed");
                    self.paused = false;
                    self.process_read();
                }
            }
            Op::Close(done) => {
                self.closed = true;
                self.on_destroyed.push(done);
            }
            Op::Destroy(err, done) => {
                self.on_destroyed.push(done);
                self.begin_destroy(err);
            }
            Op::Release => {
                self.closed = true;
                self.shared.closed.store(true, Ordering::Release);
            }
        }
    }

    /// the scheduler. runs the dispatch steps until one of them stops.
    fn resume(&mut self) {
        loop {
            if self.destroyed {
                let err = self.destroy_err.clone().unwrap_or(Error::Destroyed);
                for mut slot in self.queue.drain_all() {
                    slot.error(err.clone());
                }
                return;
            }

            if self.queue.is_empty() {
                if self.closed {
                    self.begin_destroy(None);
                    continue;
                }
                self.queue.reset_if_empty();
                return;
            }

            if self.queue.running() >= self.opts.pipelining.max(1) {
                return;
            }

            if self.queue.pending() == 0 {
                return;
            }

            // splice out requests aborted while pending.
            if self.queue.peek_pending().is_some_and(|s| s.aborted || s.errored) {
                let mut slot = self.queue.remove_pending_head().expect("pending head exists");
                slot.error(Error::Aborted);
                continue;
            }

            // servername switch drains the pipeline, then reconnects with
            // the new SNI.
            let want = self.queue.peek_pending().and_then(|s| s.req.servername.clone());
            if self.origin.is_tls() && want.is_some() && want != self.servername {
                if self.queue.running() > 0 {
                    return;
                }
                self.servername = want;
                if !matches!(self.socket, Socket::None) {
                    self.teardown_socket(Error::Informational("servername changed"));
                    return;
                }
                continue;
            }

            match &self.socket {
                Socket::None => {
                    if self.retry_at.is_none() {
                        self.start_connect();
                    }
                    return;
                }
                Socket::Connecting { .. } => return,
                Socket::Connected(_) => {}
            }

            if self.reset || self.writing.is_some() {
                return;
            }

            // requests that cannot pipeline run exclusively.
            {
                let slot = self.queue.peek_pending().expect("pending head exists");
                let exclusive =
                    !slot.req.idempotent || slot.req.body.is_stream() || slot.req.upgrade.is_some();
                if self.queue.running() > 0 && exclusive {
                    return;
                }
            }

            // a stream with a known zero length degrades to an empty body.
            {
                let slot = self.queue.peek_pending_mut().expect("pending head exists");
                if slot.req.body.is_stream() && slot.req.body.size() == Some(0) {
                    slot.req.body = Body::Empty;
                }
            }

            self.write_request();
            self.queue.mark_running();
        }
    }

    /// serialize the first pending request into the connection write buffer.
    fn write_request(&mut self) {
        let pipelining = self.opts.pipelining;
        let abort = AbortHandle {
            tx: self.tx.clone(),
            id: self.queue.peek_pending().expect("pending head exists").id,
        };

        let running_before = self.queue.running();

        let Socket::Connected(conn) = &mut self.socket else {
            unreachable!("write_request requires a connected socket")
        };
        let slot = self.queue.peek_pending_mut().expect("pending head exists");

        slot.handler.on_connect(&abort);

        let req = &mut slot.req;
        let framing = match &req.body {
            Body::Empty => Framing::None,
            Body::Bytes(b) => Framing::Length(b.len() as u64),
            Body::Stream(_) => match req.body_length() {
                Some(n) => Framing::Length(n),
                None => Framing::Chunked,
            },
        };

        encode_head(&mut conn.write_buf, req, pipelining, &self.host_header, framing);

        match std::mem::take(&mut req.body) {
            Body::Empty => {}
            Body::Bytes(b) => {
                conn.write_buf.extend_from_slice(&b);
                conn.write_buf.extend_from_slice(b"\r\n");
                if !req.expects_payload {
                    self.reset = true;
                }
                if req.idempotent {
                    // idempotent buffer bodies survive the write for a
                    // possible retry on socket loss.
                    req.body = Body::Bytes(b);
                }
            }
            Body::Stream(body) => {
                let encoder = match framing {
                    Framing::Length(n) => Encoder::Length { remaining: n },
                    _ => Encoder::Chunked,
                };
                self.writing = Some(WriteStream { body, encoder });
                if !req.expects_payload {
                    self.reset = true;
                }
            }
        }

        if running_before == 0 {
            conn.head_since = Instant::now();
        }

        trace!(target: "client", id = slot.id, method = %slot.req.method, path = %slot.req.path, "request written");
    }

    fn on_body_chunk(&mut self, mut chunk: Bytes) {
        let strict = self.opts.strict_content_length;
        let Socket::Connected(conn) = &mut self.socket else {
            return;
        };
        let Some(ws) = &mut self.writing else { return };

        if !strict {
            if let Encoder::Length { remaining } = &ws.encoder {
                if (chunk.len() as u64) > *remaining {
                    warn!(target: "client", "request body exceeds declared content-length, truncating");
                    chunk = chunk.slice(..*remaining as usize);
                    // the divergence taints the connection. it drains its
                    // in-flight responses and then closes.
                    self.reset = true;
                }
            }
        }

        match ws.encoder.encode(&chunk, &mut conn.write_buf) {
            Ok(()) => {}
            Err(e) => {
                if strict {
                    self.on_stream_body_failure(e);
                } else {
                    warn!(target: "client", "request body diverges from declared content-length");
                    self.reset = true;
                }
            }
        }
    }

    fn on_body_end(&mut self) {
        let Some(mut ws) = self.writing.take() else { return };
        let Socket::Connected(conn) = &mut self.socket else {
            return;
        };

        match ws.encoder.encode_eof(&mut conn.write_buf) {
            Ok(()) => {}
            Err(e) => {
                if self.opts.strict_content_length {
                    self.on_stream_body_failure(e);
                } else {
                    // lax mode: the request stays alive on a connection now
                    // marked reset, which closes once its responses drain.
                    warn!(target: "client", "request body ended short of declared content-length");
                    self.reset = true;
                }
            }
        }
    }

    /// a streaming request body failed mid write. the connection framing is
    /// broken, so the request errors and the socket goes down.
    fn on_stream_body_failure(&mut self, err: Error) {
        self.writing = None;
        if let Some(slot) = self.queue.head_running_mut() {
            slot.error(err.clone());
        } else if let Some(slot) = self.queue.peek_pending_mut() {
            slot.error(err.clone());
        }
        self.teardown_socket(err);
    }

    fn process_read(&mut self) {
        enum Step {
            Head(Head),
            Body(Decode),
            Err(Error),
        }

        loop {
            if self.paused {
                return;
            }

            let step = {
                let Socket::Connected(conn) = &mut self.socket else {
                    return;
                };
                match &mut conn.stage {
                    Stage::Head => {
                        if conn.read_buf.is_empty() {
                            return;
                        }
                        match decode_head(&mut conn.read_buf, self.opts.max_header_size) {
                            Ok(Some(head)) => Step::Head(head),
                            Ok(None) => return,
                            Err(e) => Step::Err(e),
                        }
                    }
                    Stage::Body(decoder) => {
                        match decoder.decode(&mut conn.read_buf, self.opts.max_header_size) {
                            Ok(d) => Step::Body(d),
                            Err(e) => Step::Err(e),
                        }
                    }
                }
            };

            let proceed = match step {
                Step::Err(e) => {
                    self.protocol_error(e);
                    false
                }
                Step::Head(head) => self.on_head(head),
                Step::Body(Decode::NeedMore) => false,
                Step::Body(Decode::Data(b)) => self.on_body_data(b),
                Step::Body(Decode::Complete(block)) => self.on_message_complete(block),
            };

            if !proceed {
                return;
            }
        }
    }

    /// a complete response head parsed. returns whether reading continues.
    fn on_head(&mut self, head: Head) -> bool {
        if self.queue.running() == 0 {
            self.protocol_error(crate::error::ParseError::UNEXPECTED_RESPONSE.into());
            return false;
        }

        let status = head.status;
        let requested_upgrade = self
            .queue
            .head_running()
            .expect("running head exists")
            .req
            .upgrade
            .is_some();

        if status == http::StatusCode::SWITCHING_PROTOCOLS && !requested_upgrade {
            self.protocol_error(crate::error::ParseError::UNEXPECTED_UPGRADE.into());
            return false;
        }
        if head.upgrade && !requested_upgrade {
            // server upgraded a request that never asked for it.
            self.protocol_error(crate::error::ParseError::UNEXPECTED_UPGRADE.into());
            return false;
        }

        if status.is_informational() && status != http::StatusCode::SWITCHING_PROTOCOLS {
            // informational response: re-arm the headers timer, keep parsing.
            if let Socket::Connected(conn) = &mut self.socket {
                conn.head_since = Instant::now();
            }
            return true;
        }

        if status == http::StatusCode::SWITCHING_PROTOCOLS {
            self.do_upgrade(head);
            return false;
        }

        let is_head_method = self
            .queue
            .head_running()
            .expect("running head exists")
            .req
            .method
            == Method::HEAD;
        if is_head_method {
            self.reset = true;
        }

        let decoder = head.body_decoder(is_head_method);
        let cfg = self.opts.timeout;

        {
            let Socket::Connected(conn) = &mut self.socket else {
                return false;
            };
            conn.keep_alive = head.keep_alive && !decoder.is_eof_framed();
            conn.trailer_names = head.trailer_names;
            conn.last_body = Instant::now();
            match head.keep_alive_timeout {
                Some(hint) => match cfg.negotiated_idle(hint) {
                    Some(idle) => conn.idle_timeout = idle,
                    None => self.reset = true,
                },
                None => conn.idle_timeout = cfg.keep_alive_timeout,
            }
            conn.stage = Stage::Body(decoder);
        }

        let rh = ResponseHead {
            status,
            version: head.version,
            headers: head.headers,
        };
        let resume = ResumeHandle {
            tx: self.tx.clone(),
            epoch: self.epoch,
        };
        let slot = self.queue.head_running_mut().expect("running head exists");
        let proceed = slot.errored || slot.handler.on_headers(&rh, &resume);

        if !proceed {
            trace!(target: "client", "handler requested pause after headers");
            self.paused = true;
        }
        !self.paused
    }

    fn on_body_data(&mut self, chunk: Bytes) -> bool {
        if let Socket::Connected(conn) = &mut self.socket {
            conn.last_body = Instant::now();
        }

        let slot = self.queue.head_running_mut().expect("running head exists");
        let proceed = slot.errored || slot.handler.on_data(chunk);

        if !proceed {
            trace!(target: "client", "handler requested pause during body");
            self.paused = true;
        }
        !self.paused
    }

    fn on_message_complete(&mut self, block: Option<Bytes>) -> bool {
        let trailer_names = match &mut self.socket {
            Socket::Connected(conn) => std::mem::take(&mut conn.trailer_names),
            _ => Vec::new(),
        };

        let trailers = match block {
            Some(b) => match decode_trailers(&b) {
                Ok(map) => Some(map),
                Err(e) => {
                    self.protocol_error(e);
                    return false;
                }
            },
            None => None,
        };

        // every advertised trailer name must have arrived.
        let missing = trailer_names
            .iter()
            .any(|name| !trailers.as_ref().is_some_and(|t| t.contains_key(name.as_str())));
        if missing {
            self.protocol_error(Error::TrailerMismatch);
            return false;
        }

        let mut slot = self.queue.complete_head().expect("running head exists");
        if !slot.errored {
            slot.handler.on_complete(trailers);
        }
        drop(slot);

        let keep_alive = {
            let Socket::Connected(conn) = &mut self.socket else {
                return false;
            };
            conn.stage = Stage::Head;
            let now = Instant::now();
            conn.head_since = now;
            conn.idle_since = now;
            conn.keep_alive
        };

        if self.writing.is_some() {
            // the response outran its own request body.
            self.teardown_socket(Error::Informational("reset"));
            return false;
        }
        if !keep_alive {
            self.teardown_socket(Error::Informational("connection closed"));
            return false;
        }
        if self.reset && self.queue.running() == 0 {
            self.teardown_socket(Error::Informational("reset"));
            return false;
        }
        true
    }

    /// hand the raw socket to the upgrading request's handler.
    fn do_upgrade(&mut self, head: Head) {
        let Socket::Connected(conn) = std::mem::replace(&mut self.socket, Socket::None) else {
            return;
        };
        self.epoch += 1;
        self.paused = false;

        let Conn {
            read, write, read_buf, ..
        } = conn;
        let io = read.unsplit(write);
        let upgraded = Upgraded {
            io,
            read_buf: read_buf.freeze(),
        };

        let mut slot = self.queue.complete_head().expect("running head exists");
        if !slot.errored {
            let rh = ResponseHead {
                status: head.status,
                version: head.version,
                headers: head.headers,
            };
            slot.handler.on_upgrade(rh, upgraded);
        }
        drop(slot);

        debug!(target: "client", origin = %self.origin, "connection upgraded, socket surrendered");
        self.shared.connected.store(false, Ordering::Release);
        let _ = self.events.send(Event::Disconnect(Arc::new(Error::Informational("upgrade"))));
    }

    fn on_abort(&mut self, id: u64) {
        // pending: mark for splicing at the next resume pass.
        let mut in_pending = false;
        for slot in self.queue.pending_iter_mut() {
            if slot.id == id {
                slot.aborted = true;
                slot.error(Error::Aborted);
                in_pending = true;
                break;
            }
        }
        if in_pending {
            return;
        }

        let mut is_head = true;
        let mut found = false;
        for slot in self.queue.running_iter_mut() {
            if slot.id == id {
                slot.aborted = true;
                slot.error(Error::Aborted);
                found = true;
                break;
            }
            is_head = false;
        }
        if !found {
            // already finished, nothing to do.
            return;
        }

        // when the aborted response remainder is already buffered and small,
        // finish it quietly and keep the connection for the pipeline tail.
        if is_head && self.try_drain_buffered() {
            return;
        }

        self.teardown_socket(Error::Aborted);
    }

    /// try to complete the aborted head response from buffered bytes alone,
    /// bounded by `max_aborted_payload`.
    fn try_drain_buffered(&mut self) -> bool {
        let cap = self.opts.max_aborted_payload;
        let mut drained = 0usize;

        loop {
            let decoded = {
                let Socket::Connected(conn) = &mut self.socket else {
                    return false;
                };
                let Stage::Body(decoder) = &mut conn.stage else {
                    return false;
                };
                decoder.decode(&mut conn.read_buf, self.opts.max_header_size)
            };

            match decoded {
                Ok(Decode::Data(b)) => {
                    drained += b.len();
                    if drained > cap {
                        return false;
                    }
                }
                Ok(Decode::Complete(block)) => {
                    // completion bookkeeping runs with callbacks suppressed
                    // by the errored flag. any teardown it decides on stands.
                    let _ = self.on_message_complete(block);
                    return true;
                }
                Ok(Decode::NeedMore) | Err(_) => return false,
            }
        }
    }

    fn on_read_eof(&mut self) {
        // an eof framed body ends legitimately at connection close.
        let eof_completes = match &self.socket {
            Socket::Connected(conn) => matches!(&conn.stage, Stage::Body(d) if d.is_eof_framed()),
            _ => false,
        };
        if eof_completes {
            let _ = self.on_message_complete(None);
            return;
        }
        self.teardown_socket(Error::socket_msg("other side closed"));
    }

    fn protocol_error(&mut self, err: Error) {
        warn!(target: "proto", %err, "response protocol error");
        self.teardown_socket(err);
    }

    /// close the socket (if any), error the head running request, requeue the
    /// idempotent tail, classify the failure for the backlog and schedule a
    /// reconnect. the single funnel for every socket death.
    fn teardown_socket(&mut self, err: Error) {
        let was_connected = matches!(self.socket, Socket::Connected(_));
        let was_connecting = matches!(self.socket, Socket::Connecting { .. });

        self.socket = Socket::None;
        self.epoch += 1;
        self.paused = false;
        self.writing = None;
        // the taint belongs to the socket that just died.
        self.reset = false;

        let (head, retried) = self.queue.split_for_retry();
        let had_running = head.is_some();
        if let Some(mut slot) = head {
            slot.error(err.clone());
        }
        if retried > 0 {
            debug!(target: "client", retried, "idempotent tail requeued for a fresh connection");
        }

        // aborted or errored slots re-entering the pending region are dead.
        for mut slot in self.queue.remove_pending_where(|s| s.errored || s.aborted) {
            slot.error(Error::Aborted);
        }

        // failure classification for the backlog.
        if matches!(err, Error::Tls(TlsError::AltNameInvalid)) {
            let current = self.servername.clone();
            for mut slot in self
                .queue
                .remove_pending_where(|s| s.req.servername.is_none() || s.req.servername == current)
            {
                slot.error(err.clone());
            }
        } else if !had_running && !err.is_transient_socket() && !self.destroyed {
            for mut slot in self.queue.drain_all() {
                slot.error(err.clone());
            }
        }

        self.shared.connected.store(false, Ordering::Release);
        if was_connected {
            debug!(target: "client", origin = %self.origin, %err, "disconnected");
            let _ = self.events.send(Event::Disconnect(Arc::new(err)));
        } else if was_connecting {
            debug!(target: "client", origin = %self.origin, %err, "connect failed");
            let _ = self.events.send(Event::ConnectionError(Arc::new(err)));
        }

        // reconnect policy: first drop retries immediately, repeated drops
        // back off with doubling delay.
        if !self.destroyed && self.queue.pending() > 0 {
            if self.retry_delay > Duration::ZERO {
                self.retry_at = Some(Instant::now() + self.retry_delay);
                self.retry_delay = (self.retry_delay * 2).min(MAX_RETRY_DELAY);
            } else {
                self.retry_at = None;
                self.retry_delay = Duration::from_secs(1);
            }
        }
    }

    fn start_connect(&mut self) {
        let origin = self.origin.clone();
        let socket_path = self.opts.socket_path.clone();
        let servername = self.servername.clone();
        let tls = self.opts.tls.clone();
        let tls_state = self.tls_state.clone();

        debug!(target: "client", origin = %origin, "connecting");

        self.socket = Socket::Connecting {
            fut: Box::pin(async move {
                conn::connect(&origin, socket_path.as_ref(), servername.as_deref(), &tls, &tls_state).await
            }),
            since: Instant::now(),
        };
    }

    fn on_connect_done(&mut self, res: Result<Io, Error>) {
        match res {
            Ok(io) => {
                let (read, write) = tokio::io::split(io);
                let now = Instant::now();
                self.epoch += 1;
                self.socket = Socket::Connected(Conn {
                    read,
                    write,
                    read_buf: BytesMut::with_capacity(16 * 1024),
                    write_buf: BytesMut::new(),
                    stage: Stage::Head,
                    keep_alive: true,
                    trailer_names: Vec::new(),
                    idle_timeout: self.opts.timeout.keep_alive_timeout,
                    head_since: now,
                    last_body: now,
                    idle_since: now,
                });
                self.reset = false;
                self.retry_delay = Duration::ZERO;
                self.retry_at = None;
                self.shared.connected.store(true, Ordering::Release);
                debug!(target: "client", origin = %self.origin, "connected");
                let _ = self.events.send(Event::Connect);
            }
            Err(e) => self.teardown_socket(e),
        }
    }

    fn on_timer(&mut self) {
        let phase = self.timer_phase;
        self.timer_phase = TimerPhase::None;
        self.deadline = None;

        match phase {
            TimerPhase::Connect => self.teardown_socket(TimeoutError::Connect.into()),
            TimerPhase::Headers => self.teardown_socket(TimeoutError::Headers.into()),
            TimerPhase::Body => self.teardown_socket(TimeoutError::Body.into()),
            TimerPhase::Idle => {
                debug!(target: "client", origin = %self.origin, "idle keep-alive expired");
                self.teardown_socket(Error::Informational("socket idle timeout"));
            }
            TimerPhase::Retry => {
                self.retry_at = None;
            }
            TimerPhase::None => {}
        }
    }

    fn begin_destroy(&mut self, err: Option<Error>) {
        if !self.destroyed {
            self.destroyed = true;
            self.closed = true;
            self.shared.closed.store(true, Ordering::Release);
            self.shared.destroyed.store(true, Ordering::Release);
            self.destroy_err = err;

            if !matches!(self.socket, Socket::None) {
                let err = self.destroy_err.clone().unwrap_or(Error::Destroyed);
                self.teardown_socket(err);
            }
        }
    }

    /// one timer, one phase. recomputed after every loop pass.
    fn retune_timer(&mut self) {
        let cfg = self.opts.timeout;

        let (phase, deadline) = match &self.socket {
            Socket::Connecting { since, .. } => {
                (TimerPhase::Connect, at(*since, cfg.connect_timeout))
            }
            Socket::Connected(conn) => {
                if self.paused {
                    // server silence timers measure the peer, not a caller
                    // that requested back-pressure.
                    (TimerPhase::None, None)
                } else if self.queue.running() > 0 {
                    match &conn.stage {
                        Stage::Head => {
                            let t = self
                                .queue
                                .head_running()
                                .and_then(|s| s.req.headers_timeout)
                                .unwrap_or(cfg.headers_timeout);
                            (TimerPhase::Headers, at(conn.head_since, t))
                        }
                        Stage::Body(_) => {
                            let t = self
                                .queue
                                .head_running()
                                .and_then(|s| s.req.body_timeout)
                                .unwrap_or(cfg.body_timeout);
                            (TimerPhase::Body, at(conn.last_body, t))
                        }
                    }
                } else if self.queue.is_empty() {
                    (TimerPhase::Idle, at(conn.idle_since, conn.idle_timeout))
                } else {
                    (TimerPhase::None, None)
                }
            }
            Socket::None => match self.retry_at {
                Some(when) => (TimerPhase::Retry, Some(when)),
                None => (TimerPhase::None, None),
            },
        };

        self.timer_phase = phase;
        self.deadline = deadline;
    }

    fn raw_busy(&self) -> bool {
        self.reset || self.writing.is_some() || self.queue.size() >= self.opts.pipelining.max(1)
    }

    /// emit `drain` exactly once per busy to non-busy transition.
    fn update_drain(&mut self) {
        if self.destroyed {
            return;
        }
        if self.raw_busy() {
            self.shared.need_drain.store(true, Ordering::Release);
        } else if self.shared.need_drain.swap(false, Ordering::AcqRel) {
            let _ = self.events.send(Event::Drain);
        }
    }

    fn publish_counters(&self) {
        self.shared.pending.store(self.queue.pending(), Ordering::Release);
        self.shared.running.store(self.queue.running(), Ordering::Release);
        self.shared.reset.store(self.reset, Ordering::Release);
        self.shared
            .writing
            .store(self.writing.is_some(), Ordering::Release);
    }
}

fn at(since: Instant, timeout: Duration) -> Option<Instant> {
    if timeout.is_zero() { None } else { Some(since + timeout) }
}

async fn sleep_or_never(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending::<()>().await,
    }
}

async fn write_some(write: &mut WriteHalf<Io>, buf: &BytesMut) -> io::Result<usize> {
    write.write(buf.chunk()).await
}

async fn next_body_chunk(body: &mut Option<WriteStream>) -> Option<Result<Bytes, Error>> {
    match body {
        Some(ws) => std::future::poll_fn(|cx| ws.body.poll_chunk(cx)).await,
        None => std::future::pending().await,
    }
}
