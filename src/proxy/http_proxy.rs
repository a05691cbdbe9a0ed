//! HTTP/1.1 shell.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use bytes::Bytes;
use http::header::{
    HeaderName, HeaderValue, CONNECTION, LOCATION, PROXY_AUTHENTICATE, PROXY_AUTHORIZATION, TE,
    TRAILER, TRANSFER_ENCODING, UPGRADE,
};
use http::{HeaderMap, Request, Response, StatusCode, Uri};
use http_body_util::{BodyExt, Empty};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

use super::{ConnectionGuard, Destination, Proxy};
use crate::config::Action;
use crate::entity::{BoxError, ForwardBody, HttpRequest};
use crate::telemetry::{counters, Stats};

pub(super) type HttpClient = Client<HttpConnector, ForwardBody>;

const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
const KEEP_ALIVE: HeaderName = HeaderName::from_static("keep-alive");

/// Returned by the service to make hyper abort the connection unanswered.
#[derive(Debug, Error)]
#[error("connection dropped by filter action")]
struct Dropped;

pub(super) fn client() -> HttpClient {
    Client::builder(TokioExecutor::new()).build_http()
}

pub(super) async fn serve_connection<S>(
    proxy: Arc<Proxy>,
    io: S,
    peer: SocketAddr,
    client: HttpClient,
    guard: &ConnectionGuard,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let stats = guard.stats();
    let service = service_fn(move |request: Request<Incoming>| {
        handle(proxy.clone(), client.clone(), stats.clone(), peer, request)
    });

    if let Err(e) = http1::Builder::new()
        .timer(TokioTimer::new())
        .serve_connection(TokioIo::new(io), service)
        .await
    {
        debug!(error = %e, "connection closed");
    }
}

async fn handle(
    proxy: Arc<Proxy>,
    client: HttpClient,
    stats: Arc<Stats>,
    peer: SocketAddr,
    request: Request<Incoming>,
) -> Result<Response<ForwardBody>, BoxError> {
    let entity = match HttpRequest::new(&peer.to_string(), request) {
        Ok(entity) => Arc::new(entity),
        Err(e) => {
            warn!(proxy = %proxy.name(), error = %e, "can't wrap request");
            return Ok(status(StatusCode::BAD_REQUEST));
        }
    };

    match tokio::time::timeout(proxy.timeout(), route(&proxy, &client, &stats, peer, entity)).await
    {
        Ok(result) => result,
        Err(_) => {
            warn!(proxy = %proxy.name(), ip = %peer.ip(), "request timed out");
            counters::upstream_error(proxy.name(), "timeout");
            stats.upstream_error();
            Ok(status(StatusCode::GATEWAY_TIMEOUT))
        }
    }
}

async fn route(
    proxy: &Proxy,
    client: &HttpClient,
    stats: &Stats,
    peer: SocketAddr,
    entity: Arc<HttpRequest<Incoming>>,
) -> Result<Response<ForwardBody>, BoxError> {
    let evaluation = proxy.engine().evaluate(entity.clone()).await;
    stats.record(&evaluation);

    let destination = if evaluation.is_accepted() {
        proxy.target()
    } else {
        counters::action_taken(proxy.name(), proxy.action().as_str());

        match (proxy.action(), proxy.filtered_destination()) {
            (Action::Redirect, Some(Destination::Http(url))) => {
                info!(proxy = %proxy.name(), ip = %peer.ip(), location = %url, "redirecting filtered request");
                return redirect(url);
            }
            (_, Some(destination)) => {
                info!(
                    proxy = %proxy.name(),
                    ip = %peer.ip(),
                    action = proxy.action().as_str(),
                    destination = %destination,
                    "forwarding filtered request"
                );
                destination
            }
            (_, None) => {
                info!(proxy = %proxy.name(), ip = %peer.ip(), "dropping filtered request");
                return Err(Box::new(Dropped));
            }
        }
    };

    let Destination::Http(base) = destination else {
        return Ok(status(StatusCode::BAD_GATEWAY));
    };

    forward(proxy, client, stats, peer, &entity, base).await
}

async fn forward(
    proxy: &Proxy,
    client: &HttpClient,
    stats: &Stats,
    peer: SocketAddr,
    entity: &HttpRequest<Incoming>,
    base: &Uri,
) -> Result<Response<ForwardBody>, BoxError> {
    let mut request = match entity.take_request().await {
        Ok(request) => request,
        Err(e) => {
            warn!(proxy = %proxy.name(), error = %e, "can't rebuild request");
            return Ok(status(StatusCode::BAD_REQUEST));
        }
    };

    match rewrite_uri(base, request.uri()) {
        Ok(uri) => *request.uri_mut() = uri,
        Err(e) => {
            debug!(proxy = %proxy.name(), error = %e, "can't rewrite request target");
            return Ok(status(StatusCode::BAD_REQUEST));
        }
    }
    strip_hop_headers(request.headers_mut());
    append_forwarded_for(request.headers_mut(), peer.ip());

    match client.request(request).await {
        Ok(response) => {
            let mut response =
                response.map(|body| body.map_err(|e| -> BoxError { Box::new(e) }).boxed_unsync());
            strip_hop_headers(response.headers_mut());
            Ok(response)
        }
        Err(e) => {
            warn!(proxy = %proxy.name(), destination = %base, error = %e, "backend request failed");
            counters::upstream_error(proxy.name(), "request");
            stats.upstream_error();
            Ok(status(StatusCode::BAD_GATEWAY))
        }
    }
}

fn empty() -> ForwardBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed_unsync()
}

fn status(code: StatusCode) -> Response<ForwardBody> {
    let mut response = Response::new(empty());
    *response.status_mut() = code;
    response
}

fn redirect(location: &Uri) -> Result<Response<ForwardBody>, BoxError> {
    let mut response = status(StatusCode::FOUND);
    response
        .headers_mut()
        .insert(LOCATION, HeaderValue::from_str(&location.to_string())?);
    Ok(response)
}

/// Point `original`'s path and query at `base`, keeping `base`'s path as a
/// prefix.
fn rewrite_uri(base: &Uri, original: &Uri) -> Result<Uri, http::Error> {
    let prefix = base.path().trim_end_matches('/');
    let path_and_query = original
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    let mut builder = Uri::builder();
    if let Some(scheme) = base.scheme() {
        builder = builder.scheme(scheme.clone());
    }
    if let Some(authority) = base.authority() {
        builder = builder.authority(authority.clone());
    }
    builder
        .path_and_query(format!("{}{}", prefix, path_and_query))
        .build()
}

fn strip_hop_headers(headers: &mut HeaderMap) {
    for name in [
        &CONNECTION,
        &KEEP_ALIVE,
        &PROXY_AUTHENTICATE,
        &PROXY_AUTHORIZATION,
        &TE,
        &TRAILER,
        &TRANSFER_ENCODING,
        &UPGRADE,
    ] {
        headers.remove(name);
    }
}

fn append_forwarded_for(headers: &mut HeaderMap, ip: IpAddr) {
    let value = match headers.get(&X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
        Some(previous) => format!("{}, {}", previous, ip),
        None => ip.to_string(),
    };

    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert(X_FORWARDED_FOR.clone(), value);
    }
}
