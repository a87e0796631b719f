//! FLIP session: one connection multiplexing many streams.
//!
//! All protocol state lives in [`SessionState`] behind a short-held mutex
//! that is never held across an `.await`. A single spawned I/O task owns
//! the transport: it connects, then runs a read loop (feeding bytes to the
//! framer and dispatching frames under the lock) against a write loop
//! (draining the outbound queue one frame at a time, in order).
//!
//! Callers get a [`StreamHandle`] per stream. Dropping the handle cancels
//! the stream without touching any other stream on the session.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use bytes::Bytes;
use http::{Method, Uri};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::config::SessionConfig;
use crate::error::{FlipError, FrameError, Result};
use crate::frame::{rst_status, FlipFrame, FlipFramer, MAX_STREAM_ID};
use crate::header_block::{HeaderBlock, HeaderCompressor, HeaderDecompressor, VALUE_SEPARATOR};
use crate::pool::PoolShared;
use crate::request::{Endpoint, RequestInfo};
use crate::stream::{FlipStream, StreamEvent, StreamState};
use crate::transport::Connector;

/// Reply header announcing resources the server is about to push.
/// The value is `prio??url` entries joined by `||`.
pub const ASSOCIATED_CONTENT_HEADER: &str = "X-Associated-Content";

/// Counters kept for the lifetime of a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub streams_initiated: u64,
    pub streams_pushed: u64,
    pub streams_pushed_and_claimed: u64,
    /// Streams cancelled before they produced a result.
    pub streams_abandoned: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Connecting,
    Open,
    Closed,
}

/// A GET for an announced push that has not arrived yet.
struct PushWaiter {
    slot: Arc<AtomicU32>,
    delegate: UnboundedSender<StreamEvent>,
}

struct SessionState {
    status: Status,
    framer: FlipFramer,
    compressor: HeaderCompressor,
    decompressor: HeaderDecompressor,
    outbound: Option<UnboundedSender<Bytes>>,
    streams: HashMap<u32, FlipStream>,
    next_stream_id: u32,
    last_push_id: u32,
    /// Paths announced by X-Associated-Content and not yet pushed.
    expected_pushes: HashSet<String>,
    /// Pushed streams nobody asked for yet, by path.
    unclaimed_pushes: HashMap<String, u32>,
    push_waiters: HashMap<String, PushWaiter>,
    stats: SessionStats,
}

impl SessionState {
    fn new(config: &SessionConfig, outbound: UnboundedSender<Bytes>) -> Self {
        Self {
            status: Status::Connecting,
            framer: FlipFramer::new(config.version).with_max_data_length(config.max_frame_length),
            compressor: HeaderCompressor::new(config.enable_compression),
            decompressor: HeaderDecompressor::new(config.enable_compression),
            outbound: Some(outbound),
            streams: HashMap::new(),
            next_stream_id: 1,
            last_push_id: 0,
            expected_pushes: HashSet::new(),
            unclaimed_pushes: HashMap::new(),
            push_waiters: HashMap::new(),
            stats: SessionStats::default(),
        }
    }

    fn queue(&self, frame: Vec<u8>) -> Result<()> {
        let tx = self.outbound.as_ref().ok_or(FlipError::ConnectionClosed)?;
        tx.send(Bytes::from(frame))
            .map_err(|_| FlipError::ConnectionClosed)
    }

    fn send_rst(&self, stream_id: u32, status: u32) {
        let frame = self.framer.create_rst_stream(stream_id, status);
        match self.queue(frame) {
            Ok(()) => debug!(stream_id, status, "RST_STREAM queued"),
            Err(_) => trace!(stream_id, "session closing, RST_STREAM not sent"),
        }
    }

    /// Register a stream for `request`: claim a pushed stream, wait for an
    /// announced one, or open a new client stream.
    fn open_stream(
        &mut self,
        request: &RequestInfo,
        delegate: UnboundedSender<StreamEvent>,
        slot: &Arc<AtomicU32>,
    ) -> Result<()> {
        if self.status == Status::Closed {
            return Err(FlipError::ConnectionClosed);
        }

        if request.method == Method::GET && !request.has_body() {
            let path = request.path().to_string();
            if let Some(id) = self.unclaimed_pushes.remove(&path) {
                if let Some(stream) = self.streams.get_mut(&id) {
                    stream.attach(delegate);
                    slot.store(id, Ordering::Release);
                    self.stats.streams_pushed_and_claimed += 1;
                    debug!(stream_id = id, path = %path, "claimed pushed stream");
                    self.reap(id);
                    return Ok(());
                }
            }
            if self.expected_pushes.contains(&path) && !self.push_waiters.contains_key(&path) {
                debug!(path = %path, "waiting for announced push");
                self.push_waiters.insert(
                    path,
                    PushWaiter {
                        slot: Arc::clone(slot),
                        delegate,
                    },
                );
                return Ok(());
            }
        }

        let headers = request.syn_headers()?;
        let id = self.next_stream_id;
        if id > MAX_STREAM_ID {
            return Err(FlipError::Protocol("stream ids exhausted".to_string()));
        }
        let fin = !request.has_body();
        let frame = self
            .framer
            .create_syn_stream(id, request.priority, fin, &headers, &mut self.compressor)
            .map_err(|err| match err {
                FrameError::Compression(_) => FlipError::from(err),
                other => FlipError::InvalidRequest(other.to_string()),
            })?;
        self.queue(frame)?;
        self.next_stream_id += 2;

        let mut stream = FlipStream::new(id, delegate);
        stream.on_syn_sent(fin);
        self.streams.insert(id, stream);
        slot.store(id, Ordering::Release);
        self.stats.streams_initiated += 1;
        debug!(stream_id = id, method = %request.method, url = %request.url, fin, "SYN_STREAM queued");
        Ok(())
    }

    /// Apply one decoded frame.
    fn dispatch(&mut self, frame: FlipFrame) {
        match frame {
            FlipFrame::SynStream {
                stream_id,
                priority,
                fin,
                headers,
            } => self.on_syn_stream(stream_id, priority, fin, headers),
            FlipFrame::SynReply {
                stream_id,
                fin,
                headers,
            } => {
                let announced = headers
                    .get_ignore_case(ASSOCIATED_CONTENT_HEADER)
                    .map(parse_associated_content);
                let Some(stream) = self.active_stream_mut(stream_id, "SYN_REPLY") else {
                    return;
                };
                match stream.on_syn_reply(headers, fin) {
                    Ok(()) => {
                        trace!(stream_id, fin, "SYN_REPLY");
                        for path in announced.into_iter().flatten() {
                            debug!(stream_id, path = %path, "push announced");
                            self.expected_pushes.insert(path);
                        }
                    }
                    Err(err) => {
                        warn!(stream_id, error = %err, "rejecting SYN_REPLY");
                        stream.fail(err);
                        self.send_rst(stream_id, rst_status::PROTOCOL_ERROR);
                    }
                }
                self.reap(stream_id);
            }
            FlipFrame::Data {
                stream_id,
                fin,
                data,
            } => {
                let Some(stream) = self.active_stream_mut(stream_id, "DATA") else {
                    return;
                };
                trace!(stream_id, len = data.len(), fin, "DATA");
                if let Err(err) = stream.on_data(data, fin) {
                    warn!(stream_id, error = %err, "stream failed");
                    stream.fail(err);
                }
                self.reap(stream_id);
            }
            FlipFrame::RstStream { stream_id, status } => {
                let Some(stream) = self.active_stream_mut(stream_id, "RST_STREAM") else {
                    return;
                };
                if let Err(err) = stream.on_rst(status) {
                    debug!(stream_id, error = %err, "stream failed");
                    stream.fail(err);
                }
                self.reap(stream_id);
            }
        }
    }

    fn on_syn_stream(&mut self, stream_id: u32, priority: u8, fin: bool, headers: HeaderBlock) {
        if stream_id == 0 || stream_id % 2 == 1 {
            warn!(stream_id, "dropping server SYN_STREAM with a client stream id");
            return;
        }
        if stream_id <= self.last_push_id || self.streams.contains_key(&stream_id) {
            warn!(stream_id, last = self.last_push_id, "dropping SYN_STREAM with stale stream id");
            return;
        }
        self.last_push_id = stream_id;

        let Some(path) = push_path(&headers) else {
            warn!(stream_id, "dropping pushed stream without url");
            return;
        };

        self.expected_pushes.remove(&path);
        let mut stream = FlipStream::pushed(stream_id, headers, fin);
        self.stats.streams_pushed += 1;
        debug!(stream_id, priority, path = %path, "server push");

        match self.push_waiters.remove(&path) {
            Some(waiter) => {
                stream.attach(waiter.delegate);
                waiter.slot.store(stream_id, Ordering::Release);
                self.stats.streams_pushed_and_claimed += 1;
            }
            None => {
                if let Some(replaced) = self.unclaimed_pushes.insert(path, stream_id) {
                    debug!(stream_id = replaced, "discarding superseded push");
                    self.streams.remove(&replaced);
                }
            }
        }
        self.streams.insert(stream_id, stream);
        self.reap(stream_id);
    }

    fn active_stream_mut(&mut self, stream_id: u32, kind: &'static str) -> Option<&mut FlipStream> {
        match self.streams.get_mut(&stream_id) {
            Some(stream) if !stream.is_closed() => Some(stream),
            _ => {
                warn!(stream_id, kind, "dropping frame for unknown or closed stream");
                None
            }
        }
    }

    /// Forget a stream once it is closed and someone has taken its events.
    /// Unclaimed pushes stay until claimed.
    fn reap(&mut self, stream_id: u32) {
        let done = self
            .streams
            .get(&stream_id)
            .is_some_and(|s| s.is_closed() && (s.has_delegate() || !s.is_pushed()));
        if let Some(stream) = done.then(|| self.streams.remove(&stream_id)).flatten() {
            trace!(stream_id, bytes = stream.bytes_received(), "stream closed");
        }
    }

    fn active_stream_count(&self) -> usize {
        self.streams.values().filter(|s| !s.is_closed()).count()
    }
}

/// Path a pushed stream is served for: the `path` header, else the path of
/// its `url`.
fn push_path(headers: &HeaderBlock) -> Option<String> {
    if let Some(path) = headers.get("path").filter(|p| !p.is_empty()) {
        return Some(path.to_string());
    }
    headers.get("url").and_then(url_path)
}

fn url_path(url: &str) -> Option<String> {
    let uri: Uri = url.trim().parse().ok()?;
    uri.path_and_query().map(|pq| pq.as_str().to_string())
}

/// Paths listed in an X-Associated-Content value.
pub(crate) fn parse_associated_content(value: &str) -> Vec<String> {
    value
        .split(VALUE_SEPARATOR)
        .flat_map(|v| v.split("||"))
        .filter_map(|entry| {
            let url = entry.split_once("??").map_or(entry, |(_, url)| url);
            url_path(url)
        })
        .collect()
}

/// One FLIP connection to an endpoint.
pub struct FlipSession {
    endpoint: Endpoint,
    config: SessionConfig,
    state: Mutex<SessionState>,
    closed: AtomicBool,
    pool: Weak<PoolShared>,
    io_task: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for FlipSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlipSession")
            .field("endpoint", &self.endpoint)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl FlipSession {
    /// Open a session outside any pool. Must be called from within a
    /// Tokio runtime; the connect runs in the background.
    pub fn connect(
        endpoint: Endpoint,
        config: SessionConfig,
        connector: Arc<dyn Connector>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        Ok(Self::spawn(endpoint, config, connector, Weak::new()))
    }

    pub(crate) fn spawn(
        endpoint: Endpoint,
        config: SessionConfig,
        connector: Arc<dyn Connector>,
        pool: Weak<PoolShared>,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let session = Arc::new(Self {
            state: Mutex::new(SessionState::new(&config, tx)),
            endpoint,
            config,
            closed: AtomicBool::new(false),
            pool,
            io_task: Mutex::new(None),
        });
        info!(endpoint = %session.endpoint, ssl = session.config.ssl, "session created");

        let task = tokio::spawn(run_io(Arc::downgrade(&session), connector, rx));
        *session.io_task.lock().unwrap_or_else(PoisonError::into_inner) = Some(task);
        session
    }

    fn lock_state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// True once the transport is up and until the session closes.
    pub fn is_connected(&self) -> bool {
        self.lock_state().status == Status::Open
    }

    pub fn stats(&self) -> SessionStats {
        self.lock_state().stats
    }

    /// Open streams, pushed streams included.
    pub fn active_stream_count(&self) -> usize {
        self.lock_state().active_stream_count()
    }

    pub fn stream_state(&self, stream_id: u32) -> Option<StreamState> {
        self.lock_state().streams.get(&stream_id).map(FlipStream::state)
    }

    pub fn is_stream_active(&self, stream_id: u32) -> bool {
        self.lock_state()
            .streams
            .get(&stream_id)
            .is_some_and(|s| !s.is_closed())
    }

    /// Start a request. Never waits: the SYN_STREAM is queued (or a pushed
    /// stream is claimed) and the result arrives on the handle.
    pub fn create_stream(self: &Arc<Self>, request: &RequestInfo) -> Result<StreamHandle> {
        let (tx, rx) = mpsc::unbounded_channel();
        let slot = Arc::new(AtomicU32::new(0));
        let result = self.lock_state().open_stream(request, tx, &slot);
        match result {
            Ok(()) => Ok(StreamHandle {
                session: Arc::clone(self),
                slot,
                events: rx,
                done: false,
            }),
            Err(err) => {
                if err.is_session_fatal() {
                    self.shutdown(err.clone(), false);
                }
                Err(err)
            }
        }
    }

    fn send_data(&self, slot: &AtomicU32, data: &[u8], fin: bool) -> Result<()> {
        let mut state = self.lock_state();
        if state.status == Status::Closed {
            return Err(FlipError::ConnectionClosed);
        }
        let stream_id = slot.load(Ordering::Acquire);
        match state.streams.get(&stream_id) {
            Some(stream) if !stream.is_closed() && !stream.fin_sent() => {}
            _ => {
                debug!(stream_id, "discarding upload for closed stream");
                return Ok(());
            }
        }
        let frame = state.framer.create_data_frame(stream_id, data, fin)?;
        state.queue(frame)?;
        trace!(stream_id, len = data.len(), fin, "DATA queued");
        if fin {
            if let Some(stream) = state.streams.get_mut(&stream_id) {
                stream.on_fin_sent();
            }
            state.reap(stream_id);
        }
        Ok(())
    }

    fn cancel_stream(&self, slot: &Arc<AtomicU32>) {
        let mut state = self.lock_state();
        let stream_id = slot.load(Ordering::Acquire);
        if stream_id == 0 {
            let before = state.push_waiters.len();
            state.push_waiters.retain(|_, w| !Arc::ptr_eq(&w.slot, slot));
            if state.push_waiters.len() < before {
                state.stats.streams_abandoned += 1;
            }
            return;
        }

        let Some(mut stream) = state.streams.remove(&stream_id) else {
            return;
        };
        let pending = stream.is_pending();
        if stream.cancel() {
            state.send_rst(stream_id, rst_status::CANCEL);
        }
        if pending {
            state.stats.streams_abandoned += 1;
            debug!(stream_id, "stream cancelled");
        }
    }

    fn on_connected(&self) {
        let mut state = self.lock_state();
        if state.status == Status::Connecting {
            state.status = Status::Open;
            info!(endpoint = %self.endpoint, "session connected");
        }
    }

    /// Feed received bytes and dispatch every complete frame, one at a time.
    fn on_read(&self, data: &[u8]) -> Result<()> {
        let mut guard = self.lock_state();
        let state = &mut *guard;
        if state.status == Status::Closed {
            return Err(FlipError::ConnectionClosed);
        }
        state.framer.feed(data);
        while let Some(frame) = state.framer.next_frame(&mut state.decompressor)? {
            state.dispatch(frame);
        }
        Ok(())
    }

    /// Close the session: fail every stream with `err` and leave the pool.
    /// Requests still waiting for a push sent nothing, so a `local` close
    /// fails them with [`FlipError::Cancelled`] instead.
    fn shutdown(&self, err: FlipError, local: bool) {
        let (stats, active) = {
            let mut state = self.lock_state();
            if state.status == Status::Closed {
                return;
            }
            state.status = Status::Closed;
            self.closed.store(true, Ordering::Release);
            state.outbound = None;

            let active = state.active_stream_count();
            for (_, mut stream) in state.streams.drain() {
                stream.fail(err.clone());
            }
            let waiter_err = if local { FlipError::Cancelled } else { err.clone() };
            for (_, waiter) in state.push_waiters.drain() {
                let _ = waiter.delegate.send(StreamEvent::Failed(waiter_err.clone()));
            }
            state.unclaimed_pushes.clear();
            state.expected_pushes.clear();
            (state.stats, active)
        };

        if matches!(err, FlipError::ConnectionClosed) {
            info!(endpoint = %self.endpoint, active, ?stats, "session closed");
        } else {
            warn!(endpoint = %self.endpoint, active, ?stats, error = %err, "session failed");
        }

        if let Some(pool) = self.pool.upgrade() {
            pool.forget(&self.endpoint, self);
        }
    }

    /// Close the session now. Open streams fail with
    /// [`FlipError::ConnectionClosed`], requests waiting for a push with
    /// [`FlipError::Cancelled`].
    pub fn close(&self) {
        self.shutdown(FlipError::ConnectionClosed, true);
        if let Some(task) = self.io_task.lock().unwrap_or_else(PoisonError::into_inner).take() {
            task.abort();
        }
    }
}

impl Drop for FlipSession {
    fn drop(&mut self) {
        if let Some(task) = self.io_task.get_mut().unwrap_or_else(PoisonError::into_inner).take() {
            task.abort();
        }
        debug!(endpoint = %self.endpoint, "session dropped");
    }
}

async fn run_io(
    session: Weak<FlipSession>,
    connector: Arc<dyn Connector>,
    outbound: UnboundedReceiver<Bytes>,
) {
    let Some((endpoint, ssl, read_size)) = session
        .upgrade()
        .map(|s| (s.endpoint.clone(), s.config.ssl, s.config.read_buffer_size))
    else {
        return;
    };

    let result = drive(&session, connector.as_ref(), &endpoint, ssl, read_size, outbound).await;
    if let Some(session) = session.upgrade() {
        session.shutdown(result.err().unwrap_or(FlipError::ConnectionClosed), false);
    }
}

async fn drive(
    session: &Weak<FlipSession>,
    connector: &dyn Connector,
    endpoint: &Endpoint,
    ssl: bool,
    read_size: usize,
    mut outbound: UnboundedReceiver<Bytes>,
) -> Result<()> {
    let transport = connector
        .connect(endpoint, ssl)
        .await
        .map_err(|e| FlipError::Connect(Arc::new(e)))?;
    match session.upgrade() {
        Some(session) => session.on_connected(),
        None => return Ok(()),
    }

    let (mut reader, mut writer) = tokio::io::split(transport);
    tokio::select! {
        result = read_loop(session, &mut reader, read_size) => result,
        result = write_loop(&mut outbound, &mut writer) => result,
    }
}

async fn read_loop<R: AsyncRead + Unpin>(
    session: &Weak<FlipSession>,
    reader: &mut R,
    read_size: usize,
) -> Result<()> {
    let mut buf = vec![0u8; read_size];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Err(FlipError::ConnectionClosed);
        }
        trace!(len = n, "read");
        let Some(session) = session.upgrade() else {
            return Ok(());
        };
        session.on_read(&buf[..n])?;
    }
}

/// Writes queued frames in order. Ends when the queue's sender is gone.
async fn write_loop<W: AsyncWrite + Unpin>(
    outbound: &mut UnboundedReceiver<Bytes>,
    writer: &mut W,
) -> Result<()> {
    while let Some(frame) = outbound.recv().await {
        writer.write_all(&frame).await?;
        writer.flush().await?;
        trace!(len = frame.len(), "wrote frame");
    }
    Ok(())
}

/// A caller's end of one stream.
///
/// Events arrive in wire order. Dropping the handle cancels the stream if
/// it is still open.
pub struct StreamHandle {
    session: Arc<FlipSession>,
    /// Stream id, or 0 while waiting for an announced push.
    slot: Arc<AtomicU32>,
    events: UnboundedReceiver<StreamEvent>,
    done: bool,
}

impl fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamHandle")
            .field("stream_id", &self.stream_id())
            .field("done", &self.done)
            .finish()
    }
}

impl StreamHandle {
    /// `None` while the handle waits for a pushed stream.
    pub fn stream_id(&self) -> Option<u32> {
        match self.slot.load(Ordering::Acquire) {
            0 => None,
            id => Some(id),
        }
    }

    pub fn session(&self) -> &Arc<FlipSession> {
        &self.session
    }

    /// True once a terminal event was returned.
    pub fn is_finished(&self) -> bool {
        self.done
    }

    /// Next event for this stream. Returns `None` after the terminal event.
    pub async fn next_event(&mut self) -> Option<StreamEvent> {
        if self.done {
            return None;
        }
        let event = self
            .events
            .recv()
            .await
            .unwrap_or(StreamEvent::Failed(FlipError::ConnectionClosed));
        if event.is_terminal() {
            self.done = true;
        }
        Some(event)
    }

    /// Queue one DATA frame of the request body.
    pub fn send_data(&self, data: &[u8], fin: bool) -> Result<()> {
        self.session.send_data(&self.slot, data, fin)
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        self.session.cancel_stream(&self.slot);
    }
}
