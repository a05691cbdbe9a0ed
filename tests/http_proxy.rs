//! End-to-end tests: a real server in front of local backends.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use axum::http::{HeaderMap, Uri};
use axum::Router;
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use bounced::bootstrap::{Running, Server};
use bounced::config::Config;
use bounced::store::VerdictStore;

/// HTTP backend answering `<label> <uri> <x-forwarded-for> <body>`.
async fn spawn_http_backend(label: &'static str) -> SocketAddr {
    let app = Router::new().fallback(move |uri: Uri, headers: HeaderMap, body: String| async move {
        let xff = headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("-")
            .to_string();
        format!("{} {} {} {}", label, uri, xff, body)
    });

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

/// TCP backend echoing whatever it receives.
async fn spawn_echo_backend() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let (mut reader, mut writer) = stream.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });
    addr
}

struct TestServer {
    server: Server,
    running: Running,
}

impl TestServer {
    async fn start(yaml: &str) -> Self {
        let config = Config::from_yaml(yaml).expect("invalid test config");
        let server = Server::new(config, PathBuf::from("test.yaml")).unwrap();
        let running = server.start().await.expect("server failed to start");

        // Give the accept loops a moment.
        tokio::time::sleep(Duration::from_millis(50)).await;

        Self { server, running }
    }

    fn proxy_url(&self, proxy: &str, path: &str) -> String {
        format!("http://{}{}", self.running.proxy_address(proxy).unwrap(), path)
    }

    fn admin_url(&self, path: &str) -> String {
        format!("http://{}{}", self.running.admin_address().unwrap(), path)
    }

    async fn stop(self) {
        self.server.stop(self.running).await.unwrap();
    }
}

fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .no_proxy()
        .build()
        .unwrap()
}

fn http_config(backend: SocketAddr, honeypot: SocketAddr) -> String {
    format!(
        r#"
store:
  backend: memory

admin:
  address: "127.0.0.1:0"

shutdown:
  drain_timeout: 1s

filters:
  - name: scanners
    type: header
    params:
      header: user-agent
      patterns: ["(?i)sqlmap", "(?i)nikto"]
  - name: injection
    type: regexp
    params:
      target: body
      patterns: ["(?i)union\\s+select"]

proxies:
  - name: web
    type: http
    listen: "127.0.0.1:0"
    target: "http://{backend}"
    filters: [scanners, injection]
    filter_settings:
      action: redirect
      url: "http://example.com/blocked"

  - name: strict
    type: http
    listen: "127.0.0.1:0"
    target: "http://{backend}"
    filters: [scanners]

  - name: trap
    type: http
    listen: "127.0.0.1:0"
    target: "http://{backend}"
    filters: [scanners]
    filter_settings:
      action: proxy
      url: "http://{honeypot}"

  - name: audit
    type: http
    listen: "127.0.0.1:0"
    target: "http://{backend}"
    filters: [scanners]
    filter_settings:
      action: none
"#
    )
}

#[tokio::test]
async fn test_accepted_request_reaches_backend() {
    let backend = spawn_http_backend("backend").await;
    let honeypot = spawn_http_backend("honeypot").await;
    let server = TestServer::start(&http_config(backend, honeypot)).await;

    let resp = client()
        .post(server.proxy_url("web", "/login?next=%2F"))
        .header("user-agent", "Mozilla/5.0")
        .body("user=alice")
        .send()
        .await
        .expect("request failed");

    assert_eq!(resp.status(), 200);
    assert_eq!(
        resp.text().await.unwrap(),
        "backend /login?next=%2F 127.0.0.1 user=alice"
    );

    server.stop().await;
}

#[tokio::test]
async fn test_filtered_request_is_redirected() {
    let backend = spawn_http_backend("backend").await;
    let honeypot = spawn_http_backend("honeypot").await;
    let server = TestServer::start(&http_config(backend, honeypot)).await;
    let client = client();

    let resp = client
        .get(server.proxy_url("web", "/"))
        .header("user-agent", "sqlmap/1.7")
        .send()
        .await
        .expect("request failed");

    assert_eq!(resp.status(), 302);
    assert_eq!(resp.headers()["location"], "http://example.com/blocked");

    // The body filter sees the full payload, and so does the backend.
    let resp = client
        .post(server.proxy_url("web", "/search"))
        .body("q=1 UNION SELECT password FROM users")
        .send()
        .await
        .expect("request failed");
    assert_eq!(resp.status(), 302);

    let resp = client
        .post(server.proxy_url("web", "/search"))
        .body("q=union")
        .send()
        .await
        .expect("request failed");
    assert_eq!(resp.status(), 200);
    assert!(resp.text().await.unwrap().ends_with("q=union"));

    server.stop().await;
}

#[tokio::test]
async fn test_filtered_request_is_dropped() {
    let backend = spawn_http_backend("backend").await;
    let honeypot = spawn_http_backend("honeypot").await;
    let server = TestServer::start(&http_config(backend, honeypot)).await;

    let result = client()
        .get(server.proxy_url("strict", "/"))
        .header("user-agent", "Nikto/2.5")
        .send()
        .await;
    assert!(result.is_err());

    server.stop().await;
}

#[tokio::test]
async fn test_filtered_request_goes_to_honeypot() {
    let backend = spawn_http_backend("backend").await;
    let honeypot = spawn_http_backend("honeypot").await;
    let server = TestServer::start(&http_config(backend, honeypot)).await;
    let client = client();

    let resp = client
        .get(server.proxy_url("trap", "/admin"))
        .header("user-agent", "sqlmap/1.7")
        .send()
        .await
        .expect("request failed");
    assert!(resp.text().await.unwrap().starts_with("honeypot /admin"));

    let resp = client
        .get(server.proxy_url("audit", "/admin"))
        .header("user-agent", "sqlmap/1.7")
        .send()
        .await
        .expect("request failed");
    assert!(resp.text().await.unwrap().starts_with("backend /admin"));

    server.stop().await;
}

#[tokio::test]
async fn test_backend_down_is_bad_gateway() {
    // Grab a free port and release it so nothing listens there.
    let dead = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };
    let honeypot = spawn_http_backend("honeypot").await;
    let server = TestServer::start(&http_config(dead, honeypot)).await;

    let resp = client()
        .get(server.proxy_url("web", "/"))
        .send()
        .await
        .expect("request failed");
    assert_eq!(resp.status(), 502);

    server.stop().await;
}

#[tokio::test]
async fn test_admin_api() {
    let backend = spawn_http_backend("backend").await;
    let honeypot = spawn_http_backend("honeypot").await;
    let server = TestServer::start(&http_config(backend, honeypot)).await;
    let client = client();

    let resp = client
        .get(server.admin_url("/healthz"))
        .send()
        .await
        .expect("request failed");
    assert_eq!(resp.status(), 200);
    let json: Value = resp.json().await.unwrap();
    assert_eq!(json["status"], "healthy");

    let resp = client
        .get(server.admin_url("/readyz"))
        .send()
        .await
        .expect("request failed");
    assert_eq!(resp.status(), 200);

    for agent in ["Mozilla/5.0", "curl/8.4.0", "sqlmap/1.7"] {
        client
            .get(server.proxy_url("web", "/"))
            .header("user-agent", agent)
            .send()
            .await
            .expect("request failed");
    }

    let json: Value = client
        .get(server.admin_url("/verdicts/127.0.0.1"))
        .send()
        .await
        .expect("request failed")
        .json()
        .await
        .unwrap();
    assert_eq!(json["ip"], "127.0.0.1");
    assert_eq!(json["accepts"], 2);
    assert_eq!(json["rejects"], 1);

    let json: Value = client
        .get(server.admin_url("/stats"))
        .send()
        .await
        .expect("request failed")
        .json()
        .await
        .unwrap();
    assert_eq!(json["evaluations"]["accepted"], 2);
    assert_eq!(json["evaluations"]["rejected"], 1);
    assert_eq!(json["store"]["backend"], "memory");
    assert_eq!(json["store"]["identities"], 1);

    let resp = client
        .get(server.admin_url("/verdicts/not-an-ip"))
        .send()
        .await
        .expect("request failed");
    assert_eq!(resp.status(), 400);

    let resp = client
        .get(server.admin_url("/metrics"))
        .send()
        .await
        .expect("request failed");
    assert_eq!(resp.status(), 200);
    assert!(resp.headers()["content-type"]
        .to_str()
        .unwrap()
        .starts_with("text/plain"));

    server.stop().await;
}

#[tokio::test]
async fn test_tcp_proxy() {
    let backend = spawn_echo_backend().await;
    let server = TestServer::start(&format!(
        r#"
store:
  backend: memory

admin:
  enabled: false

shutdown:
  drain_timeout: 1s

filters:
  - name: legacy-ssh
    type: regexp
    params:
      patterns: ["^SSH-1\\."]

proxies:
  - name: ssh
    type: tcp
    listen: "127.0.0.1:0"
    target: "{backend}"
    timeout: 2s
    filters: [legacy-ssh]
"#
    ))
    .await;
    let proxy = server.running.proxy_address("ssh").unwrap();

    let mut stream = TcpStream::connect(proxy).await.unwrap();
    stream.write_all(b"SSH-2.0-OpenSSH_9.6\r\n").await.unwrap();
    let mut buf = vec![0u8; 64];
    let n = stream.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"SSH-2.0-OpenSSH_9.6\r\n");
    drop(stream);

    let mut stream = TcpStream::connect(proxy).await.unwrap();
    stream.write_all(b"SSH-1.5-legacy\r\n").await.unwrap();
    let read = tokio::time::timeout(Duration::from_secs(2), stream.read(&mut buf))
        .await
        .expect("filtered connection was not closed");
    assert!(matches!(read, Ok(0) | Err(_)));

    assert_eq!(
        server.running.store().get_verdict("127.0.0.1").unwrap().rejects,
        1
    );

    server.stop().await;
}
