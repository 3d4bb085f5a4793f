use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use http::header::{CONNECTION, HeaderValue};
use http_body_util::Full;
use hyper_util::client::legacy::Client as HyperClient;
use hyper_util::rt::{TokioExecutor, TokioTimer};
use tracing::debug;

use super::connector::{TlsFallbackConnector, http_connector};
use super::tls::{HelloProfile, RustlsDialer, TlsDialer};
use super::{Executor, PoolSettings};
use crate::error::{Error, transport_error};
use crate::metrics::ClientMetrics;
use crate::request::WireRequest;
use crate::response::HttpResponse;
use crate::util::{classify_transport_error, lock_unpoisoned, redact_uri_for_logs};

type PooledClient = HyperClient<TlsFallbackConnector, Full<Bytes>>;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
const DEFAULT_POOL_MAX_IDLE_PER_HOST: usize = 100;

#[derive(Clone)]
pub struct StandardExecutorBuilder {
    pooled: bool,
    http2_only: bool,
    connect_timeout: Duration,
    tls_handshake_timeout: Duration,
    pool_idle_timeout: Duration,
    pool_max_idle_per_host: usize,
    tls_fallback: bool,
    primary_dialer: Option<Arc<dyn TlsDialer>>,
    fallback_dialer: Option<Arc<dyn TlsDialer>>,
    metrics: ClientMetrics,
}

impl Default for StandardExecutorBuilder {
    fn default() -> Self {
        Self {
            pooled: true,
            http2_only: false,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            tls_handshake_timeout: DEFAULT_TLS_HANDSHAKE_TIMEOUT,
            pool_idle_timeout: DEFAULT_POOL_IDLE_TIMEOUT,
            pool_max_idle_per_host: DEFAULT_POOL_MAX_IDLE_PER_HOST,
            tls_fallback: true,
            primary_dialer: None,
            fallback_dialer: None,
            metrics: ClientMetrics::disabled(),
        }
    }
}

impl StandardExecutorBuilder {
    pub fn pooled(mut self, pooled: bool) -> Self {
        self.pooled = pooled;
        self
    }

    pub fn http2_only(mut self, http2_only: bool) -> Self {
        self.http2_only = http2_only;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn tls_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.tls_handshake_timeout = timeout;
        self
    }

    pub fn pool_idle_timeout(mut self, timeout: Duration) -> Self {
        self.pool_idle_timeout = timeout;
        self
    }

    pub fn pool_max_idle_per_host(mut self, max_idle: usize) -> Self {
        self.pool_max_idle_per_host = max_idle;
        self
    }

    pub fn tls_fallback(mut self, enabled: bool) -> Self {
        self.tls_fallback = enabled;
        self
    }

    pub fn tls_dialer(mut self, dialer: Arc<dyn TlsDialer>) -> Self {
        self.primary_dialer = Some(dialer);
        self
    }

    pub fn fallback_tls_dialer(mut self, dialer: Arc<dyn TlsDialer>) -> Self {
        self.fallback_dialer = Some(dialer);
        self
    }

    pub(crate) fn metrics(mut self, metrics: ClientMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn try_build(self) -> Result<StandardExecutor, Error> {
        let alpn: &[&[u8]] = if self.http2_only {
            &[b"h2"]
        } else {
            &[b"http/1.1"]
        };
        let primary = match self.primary_dialer.clone() {
            Some(dialer) => dialer,
            None => Arc::new(RustlsDialer::new(HelloProfile::Standard, alpn)?),
        };
        let fallback = if !self.tls_fallback {
            None
        } else if let Some(dialer) = self.fallback_dialer.clone() {
            Some(dialer)
        } else {
            Some(Arc::new(RustlsDialer::new(HelloProfile::Compat, alpn)?) as Arc<dyn TlsDialer>)
        };
        let connector = TlsFallbackConnector::new(
            http_connector(Some(self.connect_timeout)),
            primary,
            fallback,
            Some(self.tls_handshake_timeout),
            self.metrics.clone(),
        );
        let client = self.build_client(connector.clone());
        Ok(StandardExecutor {
            client: Mutex::new(client),
            connector,
            settings: self,
        })
    }

    fn build_client(&self, connector: TlsFallbackConnector) -> PooledClient {
        let mut builder = HyperClient::builder(TokioExecutor::new());
        builder.pool_timer(TokioTimer::new());
        builder.timer(TokioTimer::new());
        builder.http2_only(self.http2_only);
        if self.pooled {
            builder
                .pool_idle_timeout(self.pool_idle_timeout)
                .pool_max_idle_per_host(self.pool_max_idle_per_host);
        } else {
            builder.pool_max_idle_per_host(0);
        }
        builder.build(connector)
    }
}

pub struct StandardExecutor {
    client: Mutex<PooledClient>,
    connector: TlsFallbackConnector,
    settings: StandardExecutorBuilder,
}

impl StandardExecutor {
    pub fn builder() -> StandardExecutorBuilder {
        StandardExecutorBuilder::default()
    }

    fn client(&self) -> PooledClient {
        lock_unpoisoned(&self.client).clone()
    }
}

impl Executor for StandardExecutor {
    fn execute(&self, mut request: WireRequest) -> BoxFuture<'_, Result<HttpResponse, Error>> {
        Box::pin(async move {
            if !self.settings.pooled && !self.settings.http2_only {
                request
                    .headers_mut()
                    .entry(CONNECTION)
                    .or_insert(HeaderValue::from_static("close"));
            }
            let method = request.method().clone();
            let uri = redact_uri_for_logs(request.uri());
            if let Some(scheme) = request.uri().scheme_str()
                && !scheme.eq_ignore_ascii_case("http")
                && !scheme.eq_ignore_ascii_case("https")
            {
                return Err(Error::UnsupportedScheme {
                    scheme: scheme.to_owned(),
                    uri,
                });
            }
            if request.uri().host().is_none() {
                return Err(Error::InvalidUri { uri });
            }

            match self.client().request(request).await {
                Ok(response) => Ok(HttpResponse::from_http(response)),
                Err(source) => {
                    let kind = classify_transport_error(&source);
                    debug!(method = %method, uri = %uri, kind = %kind, "standard executor failed");
                    Err(transport_error(kind, &method, &uri, source))
                }
            }
        })
    }

    fn close_idle_connections(&self) {
        let fresh = self.settings.build_client(self.connector.clone());
        *lock_unpoisoned(&self.client) = fresh;
    }

    fn pool_settings(&self) -> PoolSettings {
        if self.settings.pooled {
            PoolSettings {
                keep_alive: true,
                max_idle_per_host: self.settings.pool_max_idle_per_host.min(i64::MAX as usize)
                    as i64,
            }
        } else {
            PoolSettings {
                keep_alive: false,
                max_idle_per_host: -1,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::thread;

    use bytes::Bytes;
    use http::{Method, StatusCode};
    use http_body_util::Full;

    use super::StandardExecutor;
    use crate::error::{Error, TransportErrorKind};
    use crate::transport::Executor;

    fn one_shot_server(response: &'static [u8]) -> (String, thread::JoinHandle<Vec<u8>>) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let address = listener.local_addr().expect("addr");
        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().expect("accept");
            let mut buffer = [0_u8; 4096];
            let read = stream.read(&mut buffer).expect("read request");
            stream.write_all(response).expect("write response");
            buffer[..read].to_vec()
        });
        (format!("http://{address}"), handle)
    }

    fn get(uri: &str) -> http::Request<Full<Bytes>> {
        http::Request::builder()
            .method(Method::GET)
            .uri(uri)
            .body(Full::new(Bytes::new()))
            .expect("request")
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn non_pooled_executor_asks_server_to_close() {
        let (base, server) =
            one_shot_server(b"HTTP/1.1 200 OK\r\ncontent-length: 2\r\nconnection: close\r\n\r\nok");
        let executor = StandardExecutor::builder()
            .pooled(false)
            .try_build()
            .expect("executor");
        assert!(executor.pool_settings().never_reuses());

        let response = executor
            .execute(get(&format!("{base}/close")))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.bytes_limited(1024).await.expect("body");
        assert_eq!(&body[..], b"ok");

        let raw = String::from_utf8(server.join().expect("server")).expect("utf8");
        assert!(raw.to_ascii_lowercase().contains("connection: close"), "{raw}");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn garbage_status_line_is_a_protocol_error() {
        let (base, server) = one_shot_server(b"HTTP/2 200\r\n\r\n");
        let executor = StandardExecutor::builder().try_build().expect("executor");
        let error = executor
            .execute(get(&format!("{base}/h2")))
            .await
            .expect_err("malformed response");
        assert_eq!(error.transport_kind(), Some(TransportErrorKind::Protocol));
        assert!(error.is_malformed_http_version(), "{error}");
        let _ = server.join();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn refused_connection_is_a_connect_error() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let address = listener.local_addr().expect("addr");
        drop(listener);

        let executor = StandardExecutor::builder().try_build().expect("executor");
        let error = executor
            .execute(get(&format!("http://{address}/")))
            .await
            .expect_err("refused");
        match error {
            Error::Transport { kind, .. } => assert_eq!(kind, TransportErrorKind::Connect),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
