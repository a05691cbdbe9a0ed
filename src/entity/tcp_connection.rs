//! Raw TCP connection adapter.

use std::net::{IpAddr, SocketAddr};

use async_trait::async_trait;
use bytes::Bytes;

use super::{Entity, EntityError};

/// A TCP connection, represented by the first chunk the client sent.
///
/// Headers, cookies, URI and method have no meaning here and keep the
/// default unsupported accessors.
#[derive(Debug, Clone)]
pub struct TcpConnection {
    peer: SocketAddr,
    payload: Bytes,
}

impl TcpConnection {
    pub fn new(peer: SocketAddr, payload: Bytes) -> Self {
        Self { peer, payload }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Bytes already read from the client; must be replayed to the backend.
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }
}

#[async_trait]
impl Entity for TcpConnection {
    fn ip(&self) -> IpAddr {
        self.peer.ip()
    }

    fn protocol(&self) -> &'static str {
        "tcp"
    }

    async fn raw(&self) -> Result<Bytes, EntityError> {
        Ok(self.payload.clone())
    }

    async fn body(&self) -> Result<Bytes, EntityError> {
        Ok(self.payload.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_tcp_connection() {
        let conn = TcpConnection::new(
            "203.0.113.9:40022".parse().unwrap(),
            Bytes::from_static(b"SSH-2.0-OpenSSH_9.6\r\n"),
        );

        assert_eq!(conn.ip(), "203.0.113.9".parse::<IpAddr>().unwrap());
        assert_eq!(conn.raw().await.unwrap(), conn.body().await.unwrap());
        assert!(matches!(
            conn.headers(),
            Err(EntityError::Unsupported("headers"))
        ));
        assert!(conn.cookies().is_err());
    }
}
