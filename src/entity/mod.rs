//! Uniform view over one inbound request or connection.
//!
//! Filters never see a concrete transport. Each listener wraps what it
//! accepted in an adapter implementing [`Entity`]:
//!
//! - [`HttpRequest`]: an HTTP/1.1 request (headers, cookies, URI, body)
//! - [`TcpConnection`]: the first payload chunk of a raw TCP stream
//!
//! Accessors a transport has no notion of keep their default
//! implementation and report [`EntityError::Unsupported`].

mod http_request;
mod tcp_connection;

pub use http_request::{BoxError, Cookie, ForwardBody, HttpRequest};
pub use tcp_connection::TcpConnection;

use std::net::{IpAddr, SocketAddr};

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, Method, Uri};
use thiserror::Error;

/// Entity adapter error.
#[derive(Debug, Error)]
pub enum EntityError {
    /// The remote endpoint could not be parsed as an address.
    #[error("invalid remote address: {0}")]
    InvalidAddress(String),

    /// The body could not be read.
    #[error("can't read body: {0}")]
    Body(String),

    /// The transport has no such accessor.
    #[error("{0} not supported by this protocol")]
    Unsupported(&'static str),
}

/// One inbound request or connection, for the duration of one evaluation.
///
/// Implementations must tolerate being queried repeatedly from the
/// concurrent prepare workers and the sequential apply loop.
#[async_trait]
pub trait Entity: Send + Sync {
    /// Network identity of the peer.
    fn ip(&self) -> IpAddr;

    /// Short protocol tag for logs.
    fn protocol(&self) -> &'static str;

    /// Wire-format capture of the full request. Never consumes the body.
    async fn raw(&self) -> Result<Bytes, EntityError>;

    /// Request body. Later readers see the same, unconsumed content.
    async fn body(&self) -> Result<Bytes, EntityError>;

    fn headers(&self) -> Result<HeaderMap, EntityError> {
        Err(EntityError::Unsupported("headers"))
    }

    fn cookies(&self) -> Result<Vec<Cookie>, EntityError> {
        Err(EntityError::Unsupported("cookies"))
    }

    fn uri(&self) -> Result<Uri, EntityError> {
        Err(EntityError::Unsupported("uri"))
    }

    fn method(&self) -> Result<Method, EntityError> {
        Err(EntityError::Unsupported("method"))
    }
}

/// Parse a remote endpoint (`ip:port`, `[v6]:port` or a bare address).
pub fn parse_remote(remote: &str) -> Result<IpAddr, EntityError> {
    if let Ok(addr) = remote.parse::<SocketAddr>() {
        return Ok(addr.ip());
    }
    remote
        .parse::<IpAddr>()
        .map_err(|_| EntityError::InvalidAddress(remote.to_string()))
}
