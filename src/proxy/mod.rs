//! Proxies: the transport shells around a [`FilterEngine`].
//!
//! A proxy owns one listener and one backend. Every inbound request
//! (HTTP) or connection (TCP) is wrapped as an entity, evaluated, and then
//! either forwarded to the backend or handed to the configured [`Action`]:
//!
//! | action     | HTTP                        | TCP                     |
//! |------------|-----------------------------|-------------------------|
//! | `drop`     | abort the connection        | close the connection    |
//! | `redirect` | `302` to `url`              | not supported           |
//! | `proxy`    | forward to `url`            | pipe to `url`           |
//! | `none`     | forward to target (log only)| pipe to target          |

mod http_proxy;
mod tcp_proxy;
mod tls;

pub use tls::build_tls_acceptor;

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use http::Uri;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn, Instrument};

use crate::bootstrap::{DrainGuard, ShutdownManager, ShutdownState};
use crate::config::{Action, ProxyConfig, ProxyKind};
use crate::engine::{EngineError, FilterEngine, ThresholdPolicy};
use crate::filter::FilterSet;
use crate::store::SharedVerdictStore;
use crate::telemetry::{counters, Stats};

/// Deadline applied when a proxy sets none.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Proxy construction or startup error.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("action \"{action}\" not supported by {kind} proxy \"{proxy}\"")]
    UnsupportedAction {
        proxy: String,
        kind: &'static str,
        action: &'static str,
    },

    #[error("action \"{action}\" of proxy \"{proxy}\" requires a url")]
    MissingUrl { proxy: String, action: &'static str },

    #[error("invalid address \"{url}\" for proxy \"{proxy}\": {reason}")]
    InvalidUrl {
        proxy: String,
        url: String,
        reason: String,
    },

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("can't load TLS material for proxy \"{proxy}\": {source}")]
    Tls {
        proxy: String,
        #[source]
        source: io::Error,
    },

    #[error("can't bind proxy \"{proxy}\" to {address}: {source}")]
    Bind {
        proxy: String,
        address: SocketAddr,
        #[source]
        source: io::Error,
    },
}

/// Where traffic goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    /// Absolute `http://` URI
    Http(Uri),
    /// `host:port`
    Tcp(String),
}

impl std::fmt::Display for Destination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Destination::Http(uri) => write!(f, "{}", uri),
            Destination::Tcp(addr) => f.write_str(addr),
        }
    }
}

/// A validated proxy, ready to serve.
pub struct Proxy {
    name: String,
    kind: ProxyKind,
    listen: SocketAddr,
    target: Destination,
    timeout: Duration,
    action: Action,
    action_target: Option<Destination>,
    engine: FilterEngine,
    tls: Option<TlsAcceptor>,
}

impl Proxy {
    /// Validate `config` and resolve its filter chain.
    ///
    /// Fails on an action the transport can't perform, a missing or
    /// malformed url, an unknown filter name, or unloadable TLS material.
    pub fn new(
        config: &ProxyConfig,
        filters: &FilterSet,
        store: SharedVerdictStore,
    ) -> Result<Self, ProxyError> {
        let settings = &config.filter_settings;
        let action = settings.action;

        if config.kind == ProxyKind::Tcp && action == Action::Redirect {
            return Err(ProxyError::UnsupportedAction {
                proxy: config.name.clone(),
                kind: config.kind.as_str(),
                action: action.as_str(),
            });
        }

        let action_url = || {
            settings.url.as_deref().ok_or_else(|| ProxyError::MissingUrl {
                proxy: config.name.clone(),
                action: action.as_str(),
            })
        };
        let action_target = match action {
            Action::Redirect => Some(parse_redirect(&config.name, action_url()?)?),
            Action::Proxy => Some(parse_destination(&config.name, config.kind, action_url()?)?),
            Action::Drop | Action::None => None,
        };

        let target = parse_destination(&config.name, config.kind, &config.target)?;

        let engine = FilterEngine::new(
            &config.name,
            &config.filters,
            filters,
            ThresholdPolicy::from(settings),
            store,
        )?;

        let tls = config
            .tls
            .as_ref()
            .map(build_tls_acceptor)
            .transpose()
            .map_err(|source| ProxyError::Tls {
                proxy: config.name.clone(),
                source,
            })?;

        Ok(Self {
            name: config.name.clone(),
            kind: config.kind,
            listen: config.listen,
            target,
            timeout: config.timeout.unwrap_or(DEFAULT_TIMEOUT),
            action,
            action_target,
            engine,
            tls,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ProxyKind {
        self.kind
    }

    pub fn listen(&self) -> SocketAddr {
        self.listen
    }

    pub fn target(&self) -> &Destination {
        &self.target
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn action(&self) -> Action {
        self.action
    }

    pub fn engine(&self) -> &FilterEngine {
        &self.engine
    }

    /// Where a filtered entity goes, if anywhere.
    fn filtered_destination(&self) -> Option<&Destination> {
        match self.action {
            Action::Drop => None,
            Action::Redirect | Action::Proxy => self.action_target.as_ref(),
            Action::None => Some(&self.target),
        }
    }

    /// Bind the listening socket.
    pub async fn bind(&self) -> Result<TcpListener, ProxyError> {
        TcpListener::bind(self.listen)
            .await
            .map_err(|source| ProxyError::Bind {
                proxy: self.name.clone(),
                address: self.listen,
                source,
            })
    }

    /// Accept until the shutdown manager leaves `Running`.
    pub async fn run(
        self: Arc<Self>,
        listener: TcpListener,
        shutdown: Arc<ShutdownManager>,
        stats: Arc<Stats>,
    ) {
        let local = listener.local_addr().ok();
        info!(
            proxy = %self.name,
            kind = self.kind.as_str(),
            address = ?local,
            target = %self.target,
            tls = self.tls.is_some(),
            filters = self.engine.chain_len(),
            action = self.action.as_str(),
            "proxy started"
        );

        let client = http_proxy::client();
        let mut state_rx = shutdown.subscribe();

        loop {
            tokio::select! {
                biased;

                changed = state_rx.changed() => {
                    if changed.is_err() || *state_rx.borrow() != ShutdownState::Running {
                        break;
                    }
                }

                result = listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            let Some(drain) = shutdown.track() else {
                                break;
                            };
                            let guard = ConnectionGuard::open(drain, stats.clone());
                            counters::connection_opened(&self.name, self.kind.as_str());

                            let span = tracing::info_span!("conn", proxy = %self.name, peer = %peer);
                            let proxy = self.clone();
                            let client = client.clone();
                            tokio::spawn(
                                async move {
                                    proxy.handle(stream, peer, client, &guard).await;
                                    drop(guard);
                                }
                                .instrument(span),
                            );
                        }
                        Err(e) => {
                            error!(proxy = %self.name, error = %e, "accept error");
                        }
                    }
                }
            }
        }

        info!(proxy = %self.name, "proxy stopped");
    }

    async fn handle(
        self: Arc<Self>,
        stream: TcpStream,
        peer: SocketAddr,
        client: http_proxy::HttpClient,
        guard: &ConnectionGuard,
    ) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "can't set TCP_NODELAY");
        }

        let Some(acceptor) = self.tls.clone() else {
            self.dispatch(stream, peer, client, guard).await;
            return;
        };

        match tokio::time::timeout(self.timeout, acceptor.accept(stream)).await {
            Ok(Ok(tls_stream)) => {
                debug!("TLS handshake completed");
                self.dispatch(tls_stream, peer, client, guard).await;
            }
            Ok(Err(e)) => warn!(error = %e, "TLS handshake failed"),
            Err(_) => warn!("TLS handshake timeout"),
        }
    }

    async fn dispatch<S>(
        self: Arc<Self>,
        io: S,
        peer: SocketAddr,
        client: http_proxy::HttpClient,
        guard: &ConnectionGuard,
    ) where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        match self.kind {
            ProxyKind::Http => http_proxy::serve_connection(self, io, peer, client, guard).await,
            ProxyKind::Tcp => tcp_proxy::handle_connection(self, io, peer, guard).await,
        }
    }
}

/// Counts one inbound connection for the drain and the stats.
pub(crate) struct ConnectionGuard {
    _drain: DrainGuard,
    stats: Arc<Stats>,
}

impl ConnectionGuard {
    fn open(drain: DrainGuard, stats: Arc<Stats>) -> Self {
        stats.connection_opened();
        Self {
            _drain: drain,
            stats,
        }
    }

    pub(crate) fn stats(&self) -> Arc<Stats> {
        self.stats.clone()
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.stats.connection_closed();
    }
}

/// Parse a target or action url for `kind`.
///
/// HTTP wants an absolute `http://` URL. TCP wants `host:port`, optionally
/// written as `tcp://host:port`.
fn parse_destination(proxy: &str, kind: ProxyKind, url: &str) -> Result<Destination, ProxyError> {
    let invalid = |reason: &str| ProxyError::InvalidUrl {
        proxy: proxy.to_string(),
        url: url.to_string(),
        reason: reason.to_string(),
    };

    match kind {
        ProxyKind::Http => {
            let uri: Uri = url.parse().map_err(|e: http::uri::InvalidUri| invalid(&e.to_string()))?;
            match (uri.scheme_str(), uri.authority()) {
                (Some("http"), Some(_)) => Ok(Destination::Http(uri)),
                (Some(_), Some(_)) => Err(invalid("only http:// backends are supported")),
                _ => Err(invalid("expected an absolute URL")),
            }
        }
        ProxyKind::Tcp => {
            let addr = url.strip_prefix("tcp://").unwrap_or(url);
            match addr.rsplit_once(':') {
                Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {
                    Ok(Destination::Tcp(addr.to_string()))
                }
                _ => Err(invalid("expected host:port")),
            }
        }
    }
}

/// Redirect locations are only echoed back to the client, so any absolute
/// URL will do.
fn parse_redirect(proxy: &str, url: &str) -> Result<Destination, ProxyError> {
    let invalid = |reason: String| ProxyError::InvalidUrl {
        proxy: proxy.to_string(),
        url: url.to_string(),
        reason,
    };

    let uri: Uri = url.parse().map_err(|e: http::uri::InvalidUri| invalid(e.to_string()))?;
    if uri.scheme().is_none() || uri.authority().is_none() {
        return Err(invalid("expected an absolute URL".to_string()));
    }
    Ok(Destination::Http(uri))
}
