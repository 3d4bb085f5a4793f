use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::{TokioExecutor, TokioIo};
use tracing::debug;

use super::connector::{connect_tcp, http_connector, server_name};
use super::tls::{HelloProfile, RustlsDialer, TlsDialer, dial_tls};
use super::trace::ConnectionTrace;
use super::{BoxedIo, Executor, PoolSettings, h1};
use crate::error::{Error, TransportErrorKind, transport_error};
use crate::metrics::ClientMetrics;
use crate::middleware::AddHeaders;
use crate::request::WireRequest;
use crate::response::HttpResponse;
use crate::util::{classify_io_error, classify_transport_error, redact_uri_for_logs};

const CHROME_HEADERS: &[(&str, &str)] = &[
    ("pragma", "no-cache"),
    ("cache-control", "no-cache"),
    (
        "sec-ch-ua",
        r#""Not/A)Brand";v="99", "Chromium";v="109", "Google Chrome";v="109""#,
    ),
    ("sec-ch-ua-mobile", "?0"),
    ("sec-ch-ua-platform", r#""macOS""#),
    ("upgrade-insecure-requests", "1"),
    (
        "user-agent",
        "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/109.0.0.0 Safari/537.36",
    ),
    (
        "accept",
        "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,image/apng,*/*;q=0.8,application/signed-exchange;v=b3;q=0.7",
    ),
    ("sec-fetch-site", "none"),
    ("sec-fetch-mode", "navigate"),
    ("sec-fetch-user", "?1"),
    ("sec-fetch-dest", "document"),
    ("accept-language", "en-GB,en-US;q=0.9,en;q=0.8"),
    ("accept-encoding", "gzip, deflate, br, zstd"),
];

pub fn chrome_headers() -> AddHeaders {
    AddHeaders::from_static(CHROME_HEADERS)
}

pub struct ImpersonateExecutor {
    plain: Arc<dyn Executor>,
    http: HttpConnector,
    dialer: Arc<dyn TlsDialer>,
    fallback: Option<Arc<dyn TlsDialer>>,
    handshake_timeout: Option<Duration>,
    metrics: ClientMetrics,
}

impl ImpersonateExecutor {
    pub fn new(plain: Arc<dyn Executor>) -> Result<Self, Error> {
        let dialer = RustlsDialer::new(HelloProfile::Chrome, &[b"h2", b"http/1.1"])?;
        let fallback = RustlsDialer::new(HelloProfile::Compat, &[b"http/1.1"])?;
        Ok(Self::with_dialers(
            plain,
            Arc::new(dialer),
            Some(Arc::new(fallback)),
        ))
    }

    pub fn with_dialers(
        plain: Arc<dyn Executor>,
        dialer: Arc<dyn TlsDialer>,
        fallback: Option<Arc<dyn TlsDialer>>,
    ) -> Self {
        Self {
            plain,
            http: http_connector(Some(Duration::from_secs(10))),
            dialer,
            fallback,
            handshake_timeout: Some(Duration::from_secs(10)),
            metrics: ClientMetrics::disabled(),
        }
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.http = http_connector(Some(timeout));
        self
    }

    pub fn tls_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = Some(timeout);
        self
    }

    pub(crate) fn metrics(mut self, metrics: ClientMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    async fn execute_https(&self, request: WireRequest) -> Result<HttpResponse, Error> {
        let method = request.method().clone();
        let uri = redact_uri_for_logs(request.uri());
        let target = request.uri().clone();
        let host = server_name(&target).map_err(|_| Error::InvalidUri { uri: uri.clone() })?;

        let trace = ConnectionTrace::current();
        let session = dial_tls(
            || connect_tcp(self.http.clone(), target.clone(), trace.as_deref()),
            &host,
            self.dialer.as_ref(),
            self.fallback.as_deref(),
            self.handshake_timeout,
            &self.metrics,
            trace.as_deref(),
        )
        .await
        .map_err(|error| transport_error(classify_dial_error(&error), &method, &uri, error))?;

        match session.alpn.as_deref() {
            Some(b"h2") => send_http2(session.io, request).await,
            Some(b"http/1.1") | None => h1::send_request(session.io, request).await,
            Some(other) => Err(Error::UnsupportedProtocol {
                protocol: String::from_utf8_lossy(other).into_owned(),
                uri,
            }),
        }
    }
}

impl Executor for ImpersonateExecutor {
    fn execute(&self, request: WireRequest) -> BoxFuture<'_, Result<HttpResponse, Error>> {
        Box::pin(async move {
            match request.uri().scheme_str() {
                Some(scheme) if scheme.eq_ignore_ascii_case("https") => {
                    self.execute_https(request).await
                }
                Some(scheme) if scheme.eq_ignore_ascii_case("http") => {
                    self.plain.execute(request).await
                }
                Some(scheme) => Err(Error::UnsupportedScheme {
                    scheme: scheme.to_owned(),
                    uri: redact_uri_for_logs(request.uri()),
                }),
                None => Err(Error::InvalidUri {
                    uri: request.uri().to_string(),
                }),
            }
        })
    }

    fn close_idle_connections(&self) {
        self.plain.close_idle_connections();
    }

    fn pool_settings(&self) -> PoolSettings {
        PoolSettings {
            keep_alive: false,
            max_idle_per_host: -1,
        }
    }
}

fn classify_dial_error(error: &std::io::Error) -> TransportErrorKind {
    match classify_transport_error(error) {
        TransportErrorKind::Other => classify_io_error(error),
        kind => kind,
    }
}

async fn send_http2(io: BoxedIo, request: WireRequest) -> Result<HttpResponse, Error> {
    let method = request.method().clone();
    let uri = redact_uri_for_logs(request.uri());
    let fail = |error: hyper::Error| {
        let kind = match classify_transport_error(&error) {
            TransportErrorKind::Other => TransportErrorKind::Protocol,
            kind => kind,
        };
        transport_error(kind, &method, &uri, error)
    };

    let (mut sender, connection) =
        hyper::client::conn::http2::handshake(TokioExecutor::new(), TokioIo::new(io))
            .await
            .map_err(fail)?;
    let connection_uri = uri.clone();
    tokio::spawn(async move {
        if let Err(error) = connection.await {
            debug!(uri = %connection_uri, error = %error, "http2 connection closed with error");
        }
    });
    sender.ready().await.map_err(fail)?;
    let response = sender.send_request(request).await.map_err(fail)?;
    Ok(HttpResponse::from_http(response))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use bytes::Bytes;
    use futures_util::future::BoxFuture;
    use http::{HeaderMap, Method, StatusCode, Version};
    use http_body_util::Full;

    use std::io;
    use std::time::Duration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    use super::{ImpersonateExecutor, chrome_headers};
    use crate::client::{Client, Options};
    use crate::error::{Error, ErrorCode};
    use crate::middleware::RequestMiddleware;
    use crate::request::{Request, WireRequest};
    use crate::response::{HttpResponse, ResponseBody};
    use crate::transport::Executor;
    use crate::transport::tls::{TlsDialer, TlsSession};

    struct PlainDialer {
        alpn: Option<&'static [u8]>,
    }

    impl TlsDialer for PlainDialer {
        fn handshake<'a>(
            &'a self,
            tcp: TcpStream,
            _server_name: &'a str,
        ) -> BoxFuture<'a, io::Result<TlsSession>> {
            let alpn = self.alpn.map(<[u8]>::to_vec);
            Box::pin(async move {
                Ok(TlsSession {
                    io: Box::new(tcp),
                    alpn,
                })
            })
        }
    }

    async fn http1_server() -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let address = listener.local_addr().expect("addr");
        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&accepted);
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    let mut head = Vec::new();
                    let mut chunk = [0_u8; 512];
                    while !head.windows(4).any(|window| window == b"\r\n\r\n") {
                        match socket.read(&mut chunk).await {
                            Ok(0) | Err(_) => return,
                            Ok(read) => head.extend_from_slice(&chunk[..read]),
                        }
                    }
                    let _ = socket
                        .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok")
                        .await;
                });
            }
        });
        (format!("https://{address}/"), accepted)
    }

    fn impersonating(alpn: Option<&'static [u8]>) -> ImpersonateExecutor {
        ImpersonateExecutor::with_dialers(
            Arc::new(CountingExecutor::default()),
            Arc::new(PlainDialer { alpn }),
            None,
        )
    }

    #[tokio::test]
    async fn http1_and_missing_alpn_use_the_raw_exchange() {
        let (url, _) = http1_server().await;
        for alpn in [Some(&b"http/1.1"[..]), None] {
            let response = impersonating(alpn)
                .execute(wire(&url))
                .await
                .expect("response");
            assert_eq!(response.status(), StatusCode::OK);
            assert_eq!(response.text_lossy(64).await.expect("body"), "ok");
        }
    }

    #[tokio::test]
    async fn unknown_alpn_is_a_permanent_error() {
        let (url, accepted) = http1_server().await;
        match impersonating(Some(&b"spdy/3.1"[..])).execute(wire(&url)).await {
            Err(error @ Error::UnsupportedProtocol { .. }) => {
                assert!(error.is_permanent());
                assert!(error.to_string().contains("spdy/3.1"), "{error}");
            }
            other => panic!("unexpected result: {other:?}"),
        }

        let client = Client::new(Options {
            retry_wait_min: Duration::from_millis(1),
            retry_wait_max: Duration::from_millis(2),
            retry_max: 3,
            disable_http_fallback: true,
            executor: Some(Arc::new(impersonating(Some(&b"spdy/3.1"[..])))),
            ..Options::default()
        })
        .expect("client");
        let error = client.get(&url).await.expect_err("must fail");
        match error {
            Error::RetriesExhausted {
                attempts, source, ..
            } => {
                assert_eq!(attempts, 1);
                assert_eq!(
                    source.expect("last error").code(),
                    ErrorCode::UnsupportedProtocol
                );
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(accepted.load(Ordering::SeqCst), 2);
    }

    #[derive(Default)]
    struct CountingExecutor {
        calls: AtomicUsize,
    }

    impl Executor for CountingExecutor {
        fn execute(&self, _request: WireRequest) -> BoxFuture<'_, Result<HttpResponse, Error>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Box::pin(async {
                Ok(HttpResponse::new(
                    StatusCode::OK,
                    Version::HTTP_11,
                    HeaderMap::new(),
                    ResponseBody::empty(),
                ))
            })
        }
    }

    fn wire(uri: &str) -> WireRequest {
        http::Request::builder()
            .method(Method::GET)
            .uri(uri)
            .body(Full::new(Bytes::new()))
            .expect("request")
    }

    #[tokio::test]
    async fn plain_http_goes_to_the_wrapped_executor() {
        let plain = Arc::new(CountingExecutor::default());
        let executor = ImpersonateExecutor::new(plain.clone()).expect("executor");
        let response = executor
            .execute(wire("http://127.0.0.1:1/"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(plain.calls.load(Ordering::SeqCst), 1);
        assert!(executor.pool_settings().never_reuses());
    }

    #[tokio::test]
    async fn other_schemes_are_rejected() {
        let executor =
            ImpersonateExecutor::new(Arc::new(CountingExecutor::default())).expect("executor");
        match executor.execute(wire("ftp://127.0.0.1/file")).await {
            Err(Error::UnsupportedScheme { scheme, .. }) => assert_eq!(scheme, "ftp"),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn chrome_headers_fill_only_missing_values() {
        let mut request = Request::new(Method::GET, "https://scanme.sh/")
            .expect("request")
            .header("accept-language", "de")
            .expect("header");
        chrome_headers()
            .on_before_request(&mut request)
            .expect("middleware");
        assert_eq!(request.headers()["accept-language"], "de");
        assert_eq!(request.headers()["accept-encoding"], "gzip, deflate, br, zstd");
        assert!(
            request.headers()["user-agent"]
                .to_str()
                .expect("ascii")
                .contains("Chrome/109")
        );
        assert_eq!(request.headers().len(), 14);
    }
}
