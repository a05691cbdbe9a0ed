//! HTTP request adapter.

use std::net::IpAddr;

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use http::header::{COOKIE, HOST};
use http::request::Parts;
use http::{HeaderMap, Method, Request, Uri};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Body;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{parse_remote, Entity, EntityError};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Body handed to the forwarding step.
pub type ForwardBody = UnsyncBoxBody<Bytes, BoxError>;

/// A single `name=value` pair from a `Cookie` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cookie {
    pub name: String,
    pub value: String,
}

enum BodySlot<B> {
    /// Nobody has looked at the body yet.
    Unread(B),
    /// Drained once; every reader gets this copy.
    Buffered(Bytes),
    /// Handed off to the forwarder.
    Taken,
    /// Draining failed; the request can't be evaluated or forwarded.
    Failed(String),
}

/// HTTP request wrapped as an [`Entity`].
///
/// The body is drained at most once, on the first `body()` or `raw()`
/// call, and kept in memory so that filters and the eventual forward step
/// all observe the complete original content.
pub struct HttpRequest<B> {
    ip: IpAddr,
    parts: Parts,
    body: Mutex<BodySlot<B>>,
}

impl<B> HttpRequest<B>
where
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: Into<BoxError>,
{
    /// Wrap a request received from `remote`.
    ///
    /// Fails when `remote` is not a valid address; the caller fails the
    /// request.
    pub fn new(remote: &str, request: Request<B>) -> Result<Self, EntityError> {
        let ip = parse_remote(remote)?;
        let (parts, body) = request.into_parts();

        Ok(Self {
            ip,
            parts,
            body: Mutex::new(BodySlot::Unread(body)),
        })
    }

    /// Request head.
    pub fn parts(&self) -> &Parts {
        &self.parts
    }

    async fn buffered_body(&self) -> Result<Bytes, EntityError> {
        let mut slot = self.body.lock().await;

        match std::mem::replace(&mut *slot, BodySlot::Taken) {
            BodySlot::Buffered(bytes) => {
                *slot = BodySlot::Buffered(bytes.clone());
                Ok(bytes)
            }
            BodySlot::Unread(body) => match body.collect().await {
                Ok(collected) => {
                    let bytes = collected.to_bytes();
                    debug!(ip = %self.ip, size = bytes.len(), "request body buffered");
                    *slot = BodySlot::Buffered(bytes.clone());
                    Ok(bytes)
                }
                Err(e) => {
                    let e: BoxError = e.into();
                    warn!(ip = %self.ip, error = %e, "can't drain request body");
                    let reason = e.to_string();
                    *slot = BodySlot::Failed(reason.clone());
                    Err(EntityError::Body(reason))
                }
            },
            BodySlot::Failed(reason) => {
                *slot = BodySlot::Failed(reason.clone());
                Err(EntityError::Body(reason))
            }
            BodySlot::Taken => Err(EntityError::Body(
                "body already handed to the forwarder".to_string(),
            )),
        }
    }

    /// Rebuild the request for forwarding.
    ///
    /// The body is streamed through untouched if no filter read it, or
    /// replayed from the buffer otherwise. Can be called once.
    pub async fn take_request(&self) -> Result<Request<ForwardBody>, EntityError> {
        let body: ForwardBody = {
            let mut slot = self.body.lock().await;
            match std::mem::replace(&mut *slot, BodySlot::Taken) {
                BodySlot::Unread(body) => body.map_err(|e| -> BoxError { e.into() }).boxed_unsync(),
                BodySlot::Buffered(bytes) => Full::new(bytes)
                    .map_err(|never| match never {})
                    .boxed_unsync(),
                BodySlot::Failed(reason) => {
                    *slot = BodySlot::Failed(reason.clone());
                    return Err(EntityError::Body(reason));
                }
                BodySlot::Taken => {
                    return Err(EntityError::Body("request already taken".to_string()))
                }
            }
        };

        let mut builder = Request::builder()
            .method(self.parts.method.clone())
            .uri(self.parts.uri.clone())
            .version(self.parts.version);
        if let Some(headers) = builder.headers_mut() {
            *headers = self.parts.headers.clone();
        }

        builder
            .body(body)
            .map_err(|e| EntityError::Body(e.to_string()))
    }

    fn dump_head(&self, out: &mut BytesMut) {
        let target = self
            .parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");

        out.put_slice(
            format!("{} {} {:?}\r\n", self.parts.method, target, self.parts.version).as_bytes(),
        );

        if !self.parts.headers.contains_key(HOST) {
            if let Some(authority) = self.parts.uri.authority() {
                out.put_slice(format!("host: {}\r\n", authority).as_bytes());
            }
        }

        for (name, value) in self.parts.headers.iter() {
            out.put_slice(name.as_str().as_bytes());
            out.put_slice(b": ");
            out.put_slice(value.as_bytes());
            out.put_slice(b"\r\n");
        }
        out.put_slice(b"\r\n");
    }
}

#[async_trait]
impl<B> Entity for HttpRequest<B>
where
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: Into<BoxError>,
{
    fn ip(&self) -> IpAddr {
        self.ip
    }

    fn protocol(&self) -> &'static str {
        "http"
    }

    async fn raw(&self) -> Result<Bytes, EntityError> {
        let body = self.buffered_body().await?;

        let mut out = BytesMut::with_capacity(256 + body.len());
        self.dump_head(&mut out);
        out.put_slice(&body);

        Ok(out.freeze())
    }

    async fn body(&self) -> Result<Bytes, EntityError> {
        self.buffered_body().await
    }

    fn headers(&self) -> Result<HeaderMap, EntityError> {
        Ok(self.parts.headers.clone())
    }

    fn cookies(&self) -> Result<Vec<Cookie>, EntityError> {
        let cookies = self
            .parts
            .headers
            .get_all(COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .flat_map(|line| line.split(';'))
            .filter_map(|pair| {
                let (name, value) = pair.trim().split_once('=')?;
                if name.is_empty() {
                    return None;
                }
                Some(Cookie {
                    name: name.to_string(),
                    value: value.trim_matches('"').to_string(),
                })
            })
            .collect();

        Ok(cookies)
    }

    fn uri(&self) -> Result<Uri, EntityError> {
        Ok(self.parts.uri.clone())
    }

    fn method(&self) -> Result<Method, EntityError> {
        Ok(self.parts.method.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::body::Frame;
    use std::pin::Pin;
    use std::task::{Context, Poll};

    /// Body that yields one chunk, then a connection reset.
    struct Truncated {
        sent: bool,
    }

    impl Body for Truncated {
        type Data = Bytes;
        type Error = std::io::Error;

        fn poll_frame(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
        ) -> Poll<Option<Result<Frame<Bytes>, Self::Error>>> {
            let this = self.get_mut();
            if this.sent {
                return Poll::Ready(Some(Err(std::io::Error::new(
                    std::io::ErrorKind::ConnectionReset,
                    "client went away",
                ))));
            }
            this.sent = true;
            Poll::Ready(Some(Ok(Frame::data(Bytes::from_static(b"user=ad")))))
        }
    }

    fn request(body: &'static str) -> Request<Full<Bytes>> {
        Request::builder()
            .method("POST")
            .uri("/login?next=%2F")
            .header("host", "backend.local")
            .header("user-agent", "curl/8.4.0")
            .header("cookie", "session=abc; theme=\"dark\"")
            .header("cookie", "lang=en")
            .body(Full::new(Bytes::from_static(body.as_bytes())))
            .unwrap()
    }

    #[test]
    fn test_invalid_remote_fails() {
        let result = HttpRequest::new("garbage", request(""));
        assert!(matches!(result, Err(EntityError::InvalidAddress(_))));
    }

    #[tokio::test]
    async fn test_body_read_twice() {
        let req = HttpRequest::new("198.51.100.4:52311", request("user=admin")).unwrap();

        let first = req.body().await.unwrap();
        let second = req.body().await.unwrap();
        assert_eq!(first, Bytes::from_static(b"user=admin"));
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_raw_keeps_body() {
        let req = HttpRequest::new("198.51.100.4:52311", request("user=admin")).unwrap();

        let raw = req.raw().await.unwrap();
        let text = String::from_utf8(raw.to_vec()).unwrap();
        assert!(text.starts_with("POST /login?next=%2F HTTP/1.1\r\n"));
        assert!(text.contains("user-agent: curl/8.4.0\r\n"));
        assert!(text.ends_with("\r\n\r\nuser=admin"));

        assert_eq!(req.body().await.unwrap(), Bytes::from_static(b"user=admin"));
    }

    #[tokio::test]
    async fn test_take_request_replays_body() {
        let req = HttpRequest::new("198.51.100.4:52311", request("payload")).unwrap();
        req.body().await.unwrap();

        let forwarded = req.take_request().await.unwrap();
        assert_eq!(forwarded.method(), Method::POST);
        assert_eq!(forwarded.headers()["host"], "backend.local");

        let body = forwarded.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body, Bytes::from_static(b"payload"));

        assert!(req.take_request().await.is_err());
    }

    #[tokio::test]
    async fn test_truncated_body_stays_failed() {
        let request = Request::builder()
            .method("POST")
            .uri("/login")
            .body(Truncated { sent: false })
            .unwrap();
        let req = HttpRequest::new("198.51.100.4:52311", request).unwrap();

        assert!(matches!(req.body().await, Err(EntityError::Body(_))));
        // Later readers never see a silently empty body.
        assert!(matches!(req.body().await, Err(EntityError::Body(_))));
        assert!(matches!(req.raw().await, Err(EntityError::Body(_))));
        assert!(req.take_request().await.is_err());
        assert!(matches!(req.body().await, Err(EntityError::Body(_))));
    }

    #[tokio::test]
    async fn test_take_request_streams_unread_body() {
        let req = HttpRequest::new("198.51.100.4:52311", request("untouched")).unwrap();

        let forwarded = req.take_request().await.unwrap();
        let body = forwarded.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body, Bytes::from_static(b"untouched"));
    }

    #[test]
    fn test_cookies() {
        let req = HttpRequest::new("[2001:db8::5]:443", request("")).unwrap();
        let cookies = req.cookies().unwrap();

        let names: Vec<_> = cookies.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["session", "theme", "lang"]);
        assert_eq!(cookies[1].value, "dark");
        assert_eq!(req.ip(), "2001:db8::5".parse::<IpAddr>().unwrap());
    }
}
