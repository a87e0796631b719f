//! flip-net: client side of the FLIP multiplexed transport
//!
//! FLIP carries many HTTP request/response exchanges over one TCP (or TLS)
//! connection. Each exchange is a stream: the request goes out as a
//! SYN_STREAM frame plus DATA frames, the response comes back as a
//! SYN_REPLY plus DATA, and either side can abort with RST_STREAM. Header
//! blocks are deflated with a zlib context shared by the whole connection.
//!
//! # Features
//!
//! - **Frame codec**: Incremental, sans-I/O parsing and building of
//!   SYN_STREAM, SYN_REPLY, RST_STREAM and DATA frames
//! - **Header compression**: Dictionary-seeded zlib via flate2
//! - **Sessions**: One connection per endpoint, pooled, with background
//!   connect and FIFO writes
//! - **Server push**: Pushed streams are buffered until requested, and
//!   requests for announced pushes wait for them
//! - **Transactions**: `start` / `response_info` / `read`, the shape of an
//!   ordinary HTTP transaction
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use flip_net::{FlipSessionPool, FlipTransaction, RequestInfo, SessionConfig};
//!
//! # async fn run() -> flip_net::Result<()> {
//! let pool = FlipSessionPool::with_tcp(SessionConfig::default())?;
//!
//! let request = RequestInfo::get("http://www.example.com/".parse().unwrap());
//! let mut trans = FlipTransaction::new(&pool);
//! trans.start(&request).await?;
//!
//! if let Some(info) = trans.response_info() {
//!     println!("{}", info.status_line());
//! }
//! let body = trans.read_to_end().await?;
//! println!("{} bytes", body.len());
//! # Ok(())
//! # }
//! ```
//!
//! # Architecture
//!
//! - [`frame`] and [`header_block`] are pure codecs (bytes in, frames out)
//! - [`FlipSession`] owns the codec state and the stream table behind one
//!   mutex, and a spawned task owns the socket
//! - [`FlipSessionPool`] maps endpoints to sessions
//! - [`FlipTransaction`] adapts one request onto a stream
//!
//! It does NOT provide:
//! - TLS (plug a TLS stream in through [`Connector`])
//! - Redirects, caching, auth or retries

pub mod config;
pub mod error;
pub mod frame;
pub mod header_block;
pub mod pool;
pub mod request;
pub mod response;
pub mod session;
pub mod stream;
pub mod transaction;
pub mod transport;

pub use config::SessionConfig;
pub use error::{FlipError, FrameError, Result};
pub use frame::{
    control_type, decode, encode, flags, priority, rst_status, Decoded, FlipFrame,
    FlipFrameHeader, FlipFramer, RawFrame, FLIP_VERSION, FRAME_HEADER_SIZE,
    MAX_CONTROL_FRAME_SIZE, MAX_DATA_FRAME_LENGTH, MAX_STREAM_ID,
};
pub use header_block::{
    FlipHeader, HeaderBlock, HeaderCompressor, HeaderDecompressor, FLIP_DICTIONARY,
};
pub use pool::FlipSessionPool;
pub use request::{Endpoint, RequestInfo};
pub use response::ResponseInfo;
pub use session::{FlipSession, SessionStats, StreamHandle, ASSOCIATED_CONTENT_HEADER};
pub use stream::{StreamEvent, StreamState};
pub use transaction::{FlipTransaction, LoadState, UploadProgress};
pub use transport::{BoxedTransport, ConnectFuture, Connector, TcpConnector, Transport};
