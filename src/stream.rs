//! Per-stream state for one request/response exchange.
//!
//! A [`FlipStream`] is owned by its session and mutated only under the
//! session lock. Results reach the consumer as [`StreamEvent`]s over a
//! channel; a pushed stream that nobody has claimed yet buffers its events
//! until a delegate is attached.

use std::collections::VecDeque;

use bytes::Bytes;
use tokio::sync::mpsc::UnboundedSender;

use crate::error::FlipError;
use crate::header_block::HeaderBlock;

/// State of a FLIP stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Registered, SYN_STREAM not yet queued.
    Created,
    /// SYN_STREAM queued, waiting for SYN_REPLY.
    SynSent,
    /// SYN_REPLY received, no body yet.
    HeadersReceived,
    /// Body data is flowing.
    Streaming,
    /// We sent FIN (no more outgoing data).
    HalfClosedLocal,
    /// Peer sent FIN (no more incoming data).
    HalfClosedRemote,
    /// Both sides done, or reset, or the session went away.
    Closed,
}

/// What the consumer of a stream observes, in order.
///
/// `Fin` and `Failed` are terminal; exactly one of them is delivered.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Reply(HeaderBlock),
    Data(Bytes),
    Fin,
    Failed(FlipError),
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Fin | Self::Failed(_))
    }
}

#[derive(Debug)]
pub(crate) struct FlipStream {
    id: u32,
    state: StreamState,
    pushed: bool,
    fin_sent: bool,
    fin_received: bool,
    response: Option<HeaderBlock>,
    delegate: Option<UnboundedSender<StreamEvent>>,
    /// Events held back until a delegate is attached.
    buffered: VecDeque<StreamEvent>,
    terminated: bool,
    bytes_received: usize,
}

impl FlipStream {
    /// A client-initiated stream delivering to `delegate`.
    pub fn new(id: u32, delegate: UnboundedSender<StreamEvent>) -> Self {
        Self {
            id,
            state: StreamState::Created,
            pushed: false,
            fin_sent: false,
            fin_received: false,
            response: None,
            delegate: Some(delegate),
            buffered: VecDeque::new(),
            terminated: false,
            bytes_received: 0,
        }
    }

    /// A server-pushed stream. Its SYN_STREAM headers stand in for the
    /// reply, and we never send on it.
    pub fn pushed(id: u32, headers: HeaderBlock, fin: bool) -> Self {
        let mut stream = Self {
            id,
            state: StreamState::HeadersReceived,
            pushed: true,
            fin_sent: true,
            fin_received: false,
            response: Some(headers.clone()),
            delegate: None,
            buffered: VecDeque::new(),
            terminated: false,
            bytes_received: 0,
        };
        stream.emit(StreamEvent::Reply(headers));
        if fin {
            stream.fin_received = true;
            stream.emit(StreamEvent::Fin);
        }
        stream.settle();
        stream
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn is_pushed(&self) -> bool {
        self.pushed
    }

    pub fn is_closed(&self) -> bool {
        self.state == StreamState::Closed
    }

    pub fn fin_sent(&self) -> bool {
        self.fin_sent
    }

    pub fn has_delegate(&self) -> bool {
        self.delegate.is_some()
    }

    pub fn bytes_received(&self) -> usize {
        self.bytes_received
    }

    /// The SYN_STREAM went onto the write queue.
    pub fn on_syn_sent(&mut self, fin: bool) {
        debug_assert_eq!(self.state, StreamState::Created);
        self.state = StreamState::SynSent;
        self.fin_sent = fin;
    }

    /// The last DATA frame of the request body went onto the write queue.
    pub fn on_fin_sent(&mut self) {
        self.fin_sent = true;
        self.settle();
    }

    pub fn on_syn_reply(&mut self, headers: HeaderBlock, fin: bool) -> Result<(), FlipError> {
        if self.state != StreamState::SynSent || self.response.is_some() {
            return Err(FlipError::Protocol(format!(
                "unexpected SYN_REPLY for stream {} in state {:?}",
                self.id, self.state
            )));
        }
        self.state = StreamState::HeadersReceived;
        self.response = Some(headers.clone());
        self.emit(StreamEvent::Reply(headers));
        if fin {
            self.fin_received = true;
            self.emit(StreamEvent::Fin);
        }
        self.settle();
        Ok(())
    }

    pub fn on_data(&mut self, data: Bytes, fin: bool) -> Result<(), FlipError> {
        if self.response.is_none() {
            return Err(FlipError::SynReplyNotReceived(self.id));
        }
        if self.state == StreamState::HeadersReceived {
            self.state = StreamState::Streaming;
        }
        if !data.is_empty() {
            self.bytes_received += data.len();
            self.emit(StreamEvent::Data(data));
        }
        if fin {
            self.fin_received = true;
            self.emit(StreamEvent::Fin);
        }
        self.settle();
        Ok(())
    }

    /// RST_STREAM from the peer. Status 0 is a normal close.
    pub fn on_rst(&mut self, status: u32) -> Result<(), FlipError> {
        if status != 0 {
            return Err(FlipError::Reset {
                stream_id: self.id,
                status,
            });
        }
        if self.response.is_none() {
            return Err(FlipError::SynReplyNotReceived(self.id));
        }
        self.fin_received = true;
        self.emit(StreamEvent::Fin);
        self.state = StreamState::Closed;
        Ok(())
    }

    /// Close with an error. No-op once a terminal event went out.
    pub fn fail(&mut self, err: FlipError) {
        self.emit(StreamEvent::Failed(err));
        self.state = StreamState::Closed;
    }

    /// Local cancellation. Returns true if the stream was still open, in
    /// which case the peer should be told with RST_STREAM.
    pub fn cancel(&mut self) -> bool {
        let was_open = !self.is_closed();
        self.state = StreamState::Closed;
        self.terminated = true;
        self.delegate = None;
        self.buffered.clear();
        was_open
    }

    /// True while no terminal event has been produced.
    pub fn is_pending(&self) -> bool {
        !self.terminated
    }

    /// Hand the stream to a consumer, replaying anything buffered so far.
    pub fn attach(&mut self, delegate: UnboundedSender<StreamEvent>) {
        for event in self.buffered.drain(..) {
            let _ = delegate.send(event);
        }
        self.delegate = Some(delegate);
    }

    fn emit(&mut self, event: StreamEvent) {
        if self.terminated {
            return;
        }
        if event.is_terminal() {
            self.terminated = true;
        }
        match &self.delegate {
            // A dropped receiver is a cancel in flight; the session hears
            // about it separately.
            Some(tx) => {
                let _ = tx.send(event);
            }
            None => self.buffered.push_back(event),
        }
    }

    fn settle(&mut self) {
        self.state = match (self.fin_sent, self.fin_received) {
            (true, true) => StreamState::Closed,
            (false, true) => StreamState::HalfClosedRemote,
            (true, false) if self.response.is_some() => StreamState::HalfClosedLocal,
            _ => self.state,
        };
    }
}
