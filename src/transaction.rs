//! Client-facing transaction: one HTTP-style request over a FLIP stream.
//!
//! Mirrors a plain HTTP transaction's `start` / `response_info` / `read`
//! contract so callers can swap transports.

use bytes::{Buf, Bytes, BytesMut};

use crate::error::{FlipError, Result};
use crate::pool::FlipSessionPool;
use crate::request::{Endpoint, RequestInfo};
use crate::response::ResponseInfo;
use crate::session::StreamHandle;
use crate::stream::StreamEvent;

/// Coarse progress of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadState {
    Idle,
    /// Waiting for the session's transport.
    Connecting,
    SendingRequest,
    WaitingForResponse,
    ReadingResponse,
    Done,
}

/// Request body bytes queued so far, out of the total.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UploadProgress {
    pub position: usize,
    pub size: usize,
}

pub struct FlipTransaction {
    pool: FlipSessionPool,
    stream: Option<StreamHandle>,
    response: Option<ResponseInfo>,
    phase: LoadState,
    upload: UploadProgress,
    /// Body bytes received but not yet read.
    pending: Bytes,
    eof: bool,
}

impl FlipTransaction {
    pub fn new(pool: &FlipSessionPool) -> Self {
        Self {
            pool: pool.clone(),
            stream: None,
            response: None,
            phase: LoadState::Idle,
            upload: UploadProgress::default(),
            pending: Bytes::new(),
            eof: false,
        }
    }

    /// Send `request` and wait for its response headers.
    ///
    /// Resolves once the reply arrives, or with the one error that ended
    /// the stream. The body, if any, is queued as DATA frames right after
    /// the SYN_STREAM, the last one carrying FIN.
    ///
    /// A body-less GET for a path the server announced in
    /// `X-Associated-Content` sends nothing and waits for the push. If the
    /// push never comes this waits until the session closes, so callers
    /// that need a bound should wrap the call in a timeout or drop it.
    pub async fn start(&mut self, request: &RequestInfo) -> Result<()> {
        if self.phase != LoadState::Idle {
            return Err(FlipError::InvalidRequest(
                "transaction already started".to_string(),
            ));
        }
        let result = self.start_inner(request).await;
        if result.is_err() {
            self.phase = LoadState::Done;
            self.eof = true;
        }
        result
    }

    async fn start_inner(&mut self, request: &RequestInfo) -> Result<()> {
        let endpoint = Endpoint::from_uri(&request.url, self.pool.config().ssl)?;
        self.phase = LoadState::Connecting;
        let session = self.pool.get(&endpoint);
        let mut stream = session.create_stream(request)?;
        tracing::debug!(%endpoint, stream_id = ?stream.stream_id(), "transaction started");

        self.upload = UploadProgress {
            position: 0,
            size: request.body_len(),
        };
        if let Some(body) = request.body.as_ref().filter(|b| !b.is_empty()) {
            self.phase = LoadState::SendingRequest;
            let chunk_size = session.config().max_data_frame_size;
            let mut chunks = body.chunks(chunk_size).peekable();
            while let Some(chunk) = chunks.next() {
                stream.send_data(chunk, chunks.peek().is_none())?;
                self.upload.position += chunk.len();
            }
        }

        self.phase = LoadState::WaitingForResponse;
        match stream.next_event().await {
            Some(StreamEvent::Reply(headers)) => {
                self.response = Some(ResponseInfo::from_headers(headers)?);
                self.stream = Some(stream);
                self.phase = LoadState::ReadingResponse;
                Ok(())
            }
            Some(StreamEvent::Failed(err)) => Err(err),
            Some(StreamEvent::Data(_)) | Some(StreamEvent::Fin) => Err(FlipError::InvalidResponse(
                "stream ended without a reply".to_string(),
            )),
            None => Err(FlipError::ConnectionClosed),
        }
    }

    /// Response headers. `Some` only after a successful [`start`](Self::start).
    pub fn response_info(&self) -> Option<&ResponseInfo> {
        self.response.as_ref()
    }

    /// Read body bytes into `buf`. Returns 0 at end of body; waits while
    /// nothing has arrived yet.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            if !self.pending.is_empty() {
                let n = buf.len().min(self.pending.len());
                buf[..n].copy_from_slice(&self.pending[..n]);
                self.pending.advance(n);
                return Ok(n);
            }
            if self.eof {
                return Ok(0);
            }
            let Some(stream) = self.stream.as_mut() else {
                return Err(FlipError::InvalidRequest(
                    "read before a successful start".to_string(),
                ));
            };
            match stream.next_event().await {
                Some(StreamEvent::Data(data)) => self.pending = data,
                Some(StreamEvent::Reply(_)) => {}
                Some(StreamEvent::Fin) | None => self.finish(),
                Some(StreamEvent::Failed(err)) => {
                    self.finish();
                    return Err(err);
                }
            }
        }
    }

    /// Read the rest of the body.
    pub async fn read_to_end(&mut self) -> Result<Bytes> {
        let mut body = BytesMut::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = self.read(&mut buf).await?;
            if n == 0 {
                return Ok(body.freeze());
            }
            body.extend_from_slice(&buf[..n]);
        }
    }

    fn finish(&mut self) {
        self.eof = true;
        self.phase = LoadState::Done;
    }

    /// Where the transaction is. Set as `start` and `read` progress.
    pub fn load_state(&self) -> LoadState {
        self.phase
    }

    pub fn upload_progress(&self) -> UploadProgress {
        self.upload
    }

    /// Stream carrying this transaction, once known.
    pub fn stream_id(&self) -> Option<u32> {
        self.stream.as_ref().and_then(StreamHandle::stream_id)
    }
}

impl std::fmt::Debug for FlipTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlipTransaction")
            .field("phase", &self.phase)
            .field("stream_id", &self.stream_id())
            .field("eof", &self.eof)
            .finish_non_exhaustive()
    }
}
