//! Raw TCP shell.
//!
//! The first chunk the client sends is what the filters see. It is
//! replayed to the chosen backend before the two streams are spliced.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::io::{copy_bidirectional, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use super::{ConnectionGuard, Destination, Proxy};
use crate::entity::TcpConnection;
use crate::telemetry::counters;

const FIRST_CHUNK_SIZE: usize = 16 * 1024;

pub(super) async fn handle_connection<S>(
    proxy: Arc<Proxy>,
    mut client: S,
    peer: SocketAddr,
    guard: &ConnectionGuard,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let stats = guard.stats();

    let mut buf = BytesMut::with_capacity(FIRST_CHUNK_SIZE);
    let payload = match tokio::time::timeout(proxy.timeout(), client.read_buf(&mut buf)).await {
        Ok(Ok(0)) => {
            debug!("client closed before sending data");
            return;
        }
        Ok(Ok(_)) => buf.freeze(),
        Ok(Err(e)) => {
            debug!(error = %e, "can't read first chunk");
            return;
        }
        // Server-speaks-first protocols: judge on the address alone.
        Err(_) => Bytes::new(),
    };

    let entity = Arc::new(TcpConnection::new(peer, payload.clone()));
    let evaluation = proxy.engine().evaluate(entity).await;
    stats.record(&evaluation);

    let destination = if evaluation.is_accepted() {
        proxy.target()
    } else {
        counters::action_taken(proxy.name(), proxy.action().as_str());

        match proxy.filtered_destination() {
            Some(destination) => {
                info!(
                    proxy = %proxy.name(),
                    ip = %peer.ip(),
                    action = proxy.action().as_str(),
                    destination = %destination,
                    "piping filtered connection"
                );
                destination
            }
            None => {
                info!(proxy = %proxy.name(), ip = %peer.ip(), "dropping filtered connection");
                return;
            }
        }
    };

    let Destination::Tcp(address) = destination else {
        return;
    };

    let mut upstream =
        match tokio::time::timeout(proxy.timeout(), TcpStream::connect(address.as_str())).await {
            Ok(Ok(upstream)) => upstream,
            Ok(Err(e)) => {
                warn!(proxy = %proxy.name(), backend = %address, error = %e, "backend connect failed");
                counters::upstream_error(proxy.name(), "connect");
                stats.upstream_error();
                return;
            }
            Err(_) => {
                warn!(proxy = %proxy.name(), backend = %address, "backend connect timed out");
                counters::upstream_error(proxy.name(), "timeout");
                stats.upstream_error();
                return;
            }
        };

    if let Err(e) = upstream.write_all(&payload).await {
        warn!(proxy = %proxy.name(), backend = %address, error = %e, "can't replay first chunk");
        counters::upstream_error(proxy.name(), "write");
        stats.upstream_error();
        return;
    }

    match copy_bidirectional(&mut client, &mut upstream).await {
        Ok((to_backend, to_client)) => {
            debug!(
                bytes_to_backend = to_backend + payload.len() as u64,
                bytes_to_client = to_client,
                "connection finished"
            );
        }
        Err(e) => debug!(error = %e, "connection ended with error"),
    }
}
