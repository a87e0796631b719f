//! Scripted peer and in-memory connector for session tests.

use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use flip_net::{
    BoxedTransport, ConnectFuture, Connector, Endpoint, FlipFrame, FlipFrameHeader, FlipFramer,
    HeaderBlock, HeaderCompressor, HeaderDecompressor, FRAME_HEADER_SIZE,
};
use http::Uri;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn uri(s: &str) -> Uri {
    s.parse().unwrap()
}

pub fn google() -> Endpoint {
    Endpoint::new("www.google.com", 80)
}

/// Poll `cond` until it holds, failing the test after a second.
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(1), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("condition not reached");
}

/// Run `fut` briefly and drop it, the way a caller abandons a request.
pub async fn abandon<F: Future>(fut: F) {
    let result = tokio::time::timeout(Duration::from_millis(20), fut).await;
    assert!(result.is_err(), "future completed instead of pending");
}

/// Connector that hands out in-memory pipes. The far end of every
/// connection is delivered to the paired [`PeerListener`].
#[derive(Clone)]
pub struct MockConnector {
    peers: mpsc::UnboundedSender<DuplexStream>,
    connects: Arc<AtomicUsize>,
}

pub struct PeerListener {
    peers: mpsc::UnboundedReceiver<DuplexStream>,
    compression: bool,
}

pub fn mock_connector(compression: bool) -> (MockConnector, PeerListener) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        MockConnector {
            peers: tx,
            connects: Arc::new(AtomicUsize::new(0)),
        },
        PeerListener {
            peers: rx,
            compression,
        },
    )
}

impl MockConnector {
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

impl Connector for MockConnector {
    fn connect(&self, _endpoint: &Endpoint, _ssl: bool) -> ConnectFuture {
        let (client, server) = tokio::io::duplex(64 * 1024);
        self.connects.fetch_add(1, Ordering::SeqCst);
        let sent = self.peers.send(server);
        Box::pin(async move {
            sent.map_err(|_| io::Error::new(io::ErrorKind::ConnectionRefused, "listener gone"))?;
            Ok(Box::new(client) as BoxedTransport)
        })
    }
}

impl PeerListener {
    pub async fn accept(&mut self) -> Peer {
        let io = tokio::time::timeout(Duration::from_secs(1), self.peers.recv())
            .await
            .expect("no connection")
            .expect("connector dropped");
        Peer::new(io, self.compression)
    }
}

/// Connector whose connects always fail.
#[derive(Clone, Copy)]
pub struct RefusingConnector;

impl Connector for RefusingConnector {
    fn connect(&self, _endpoint: &Endpoint, _ssl: bool) -> ConnectFuture {
        Box::pin(async {
            Err(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"))
        })
    }
}

/// The server side of a mock connection.
pub struct Peer {
    io: DuplexStream,
    framer: FlipFramer,
    compressor: HeaderCompressor,
    decompressor: HeaderDecompressor,
}

impl Peer {
    fn new(io: DuplexStream, compression: bool) -> Self {
        Self {
            io,
            framer: FlipFramer::default(),
            compressor: HeaderCompressor::new(compression),
            decompressor: HeaderDecompressor::new(compression),
        }
    }

    /// Exact bytes of the next frame the client wrote.
    pub async fn read_raw(&mut self) -> Vec<u8> {
        let mut frame = vec![0u8; FRAME_HEADER_SIZE];
        tokio::time::timeout(Duration::from_secs(1), self.io.read_exact(&mut frame))
            .await
            .expect("client wrote nothing")
            .unwrap();
        let header = FlipFrameHeader::parse(&frame).unwrap();
        frame.resize(header.total_size(), 0);
        self.io.read_exact(&mut frame[FRAME_HEADER_SIZE..]).await.unwrap();
        frame
    }

    /// The next frame the client wrote, header block inflated.
    pub async fn read_frame(&mut self) -> FlipFrame {
        let raw = self.read_raw().await;
        let mut frames = self.framer.process(&raw, &mut self.decompressor).unwrap();
        assert_eq!(frames.len(), 1);
        frames.remove(0)
    }

    /// Everything the client writes until it closes the connection.
    pub async fn read_to_eof(&mut self) -> Vec<u8> {
        let mut rest = Vec::new();
        tokio::time::timeout(Duration::from_secs(1), self.io.read_to_end(&mut rest))
            .await
            .expect("client did not close")
            .unwrap();
        rest
    }

    pub async fn write(&mut self, bytes: &[u8]) {
        self.io.write_all(bytes).await.unwrap();
    }

    pub async fn send_reply(&mut self, stream_id: u32, headers: &[(&str, &str)], fin: bool) {
        let block: HeaderBlock = headers.iter().copied().collect();
        let frame = self
            .framer
            .create_syn_reply(stream_id, fin, &block, &mut self.compressor)
            .unwrap();
        self.write(&frame).await;
    }

    pub async fn send_push(&mut self, stream_id: u32, headers: &[(&str, &str)], fin: bool) {
        let block: HeaderBlock = headers.iter().copied().collect();
        let frame = self
            .framer
            .create_syn_stream(stream_id, 0, fin, &block, &mut self.compressor)
            .unwrap();
        self.write(&frame).await;
    }

    pub async fn send_data(&mut self, stream_id: u32, data: &[u8], fin: bool) {
        let frame = self.framer.create_data_frame(stream_id, data, fin).unwrap();
        self.write(&frame).await;
    }

    pub async fn send_rst(&mut self, stream_id: u32, status: u32) {
        let frame = self.framer.create_rst_stream(stream_id, status);
        self.write(&frame).await;
    }
}

pub const OK_REPLY: &[(&str, &str)] = &[
    ("status", "200"),
    ("url", "/index.php"),
    ("version", "HTTP/1.1"),
];

/// SYN_STREAM for `GET http://www.google.com/`, uncompressed.
pub const GET_SYN: &[u8] = &[
    0x80, 0x01, 0x00, 0x01, // header
    0x01, 0x00, 0x00, 0x45, // FIN, len
    0x00, 0x00, 0x00, 0x01, // stream id
    0xc0, 0x00, 0x00, 0x03, // priority 3, 3 headers
    0x00, 0x06, b'm', b'e', b't', b'h', b'o', b'd',
    0x00, 0x03, b'G', b'E', b'T',
    0x00, 0x03, b'u', b'r', b'l',
    0x00, 0x16, b'h', b't', b't', b'p', b':', b'/', b'/', b'w', b'w', b'w',
                b'.', b'g', b'o', b'o', b'g', b'l', b'e', b'.', b'c', b'o',
                b'm', b'/',
    0x00, 0x07, b'v', b'e', b'r', b's', b'i', b'o', b'n',
    0x00, 0x08, b'H', b'T', b'T', b'P', b'/', b'1', b'.', b'1',
];

/// SYN_STREAM for `POST http://www.google.com/`; the body follows.
pub const POST_SYN: &[u8] = &[
    0x80, 0x01, 0x00, 0x01,
    0x00, 0x00, 0x00, 0x46,
    0x00, 0x00, 0x00, 0x01,
    0xc0, 0x00, 0x00, 0x03,
    0x00, 0x06, b'm', b'e', b't', b'h', b'o', b'd',
    0x00, 0x04, b'P', b'O', b'S', b'T',
    0x00, 0x03, b'u', b'r', b'l',
    0x00, 0x16, b'h', b't', b't', b'p', b':', b'/', b'/', b'w', b'w', b'w',
                b'.', b'g', b'o', b'o', b'g', b'l', b'e', b'.', b'c', b'o',
                b'm', b'/',
    0x00, 0x07, b'v', b'e', b'r', b's', b'i', b'o', b'n',
    0x00, 0x08, b'H', b'T', b'T', b'P', b'/', b'1', b'.', b'1',
];

pub const UPLOAD_FRAME: &[u8] = &[
    0x00, 0x00, 0x00, 0x01,
    0x01, 0x00, 0x00, 0x0c, // FIN
    b'h', b'e', b'l', b'l', b'o', b' ', b'w', b'o', b'r', b'l', b'd', b'\0',
];

/// SYN_REPLY for stream 1 with an extra `hello: bye` header.
pub const SYN_REPLY: &[u8] = &[
    0x80, 0x01, 0x00, 0x02,
    0x00, 0x00, 0x00, 0x45,
    0x00, 0x00, 0x00, 0x01,
    0x00, 0x00, 0x00, 0x04,
    0x00, 0x05, b'h', b'e', b'l', b'l', b'o',
    0x00, 0x03, b'b', b'y', b'e',
    0x00, 0x06, b's', b't', b'a', b't', b'u', b's',
    0x00, 0x03, b'2', b'0', b'0',
    0x00, 0x03, b'u', b'r', b'l',
    0x00, 0x0a, b'/', b'i', b'n', b'd', b'e', b'x', b'.', b'p', b'h', b'p',
    0x00, 0x07, b'v', b'e', b'r', b's', b'i', b'o', b'n',
    0x00, 0x08, b'H', b'T', b'T', b'P', b'/', b'1', b'.', b'1',
];

pub const BODY_FRAME: &[u8] = &[
    0x00, 0x00, 0x00, 0x01,
    0x00, 0x00, 0x00, 0x06,
    b'h', b'e', b'l', b'l', b'o', b'!',
];

/// RST_STREAM(1, 0): the server's normal end of stream.
pub const FIN_FRAME: &[u8] = &[
    0x80, 0x01, 0x00, 0x03,
    0x00, 0x00, 0x00, 0x08,
    0x00, 0x00, 0x00, 0x01,
    0x00, 0x00, 0x00, 0x00,
];
