//! Byte-stream transports a session runs over.
//!
//! The session only needs an ordered, reliable byte stream. TLS, proxies
//! and test doubles plug in through [`Connector`].

use std::future::Future;
use std::io;
use std::pin::Pin;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use crate::request::Endpoint;

/// An established connection.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

pub type BoxedTransport = Box<dyn Transport>;

pub type ConnectFuture = Pin<Box<dyn Future<Output = io::Result<BoxedTransport>> + Send>>;

/// Opens transports for sessions. One call per session.
pub trait Connector: Send + Sync + 'static {
    /// Resolve `endpoint` and connect, wrapping the stream in TLS when
    /// `ssl` is set.
    fn connect(&self, endpoint: &Endpoint, ssl: bool) -> ConnectFuture;
}

/// Plain TCP. Host resolution is done by [`TcpStream::connect`].
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

impl Connector for TcpConnector {
    fn connect(&self, endpoint: &Endpoint, ssl: bool) -> ConnectFuture {
        let addr = (endpoint.host().to_string(), endpoint.port());
        Box::pin(async move {
            if ssl {
                return Err(io::Error::new(
                    io::ErrorKind::Unsupported,
                    "TcpConnector does not speak TLS; supply a TLS connector",
                ));
            }
            let stream = TcpStream::connect(addr).await?;
            stream.set_nodelay(true)?;
            Ok(Box::new(stream) as BoxedTransport)
        })
    }
}
