use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use http::Uri;
use hyper::rt::{Read as HyperRead, ReadBufCursor, Write as HyperWrite};
use hyper_util::client::legacy::connect::{Connected, Connection, HttpConnector};
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;
use tower_service::Service;

use super::BoxedIo;
use super::tls::{TlsDialer, dial_tls};
use super::trace::ConnectionTrace;
use crate::error::BoxError;
use crate::metrics::ClientMetrics;

pub(crate) fn http_connector(connect_timeout: Option<Duration>) -> HttpConnector {
    let mut http = HttpConnector::new();
    http.enforce_http(false);
    http.set_nodelay(true);
    http.set_connect_timeout(connect_timeout.filter(|timeout| !timeout.is_zero()));
    http
}

pub(crate) async fn connect_tcp(
    mut http: HttpConnector,
    dst: Uri,
    trace: Option<&ConnectionTrace>,
) -> io::Result<TcpStream> {
    let address = dst.authority().map(|authority| authority.to_string());
    if let Some(trace) = trace {
        trace.dial_start(address.as_deref().unwrap_or_default());
    }
    let result = http
        .call(dst)
        .await
        .map(TokioIo::into_inner)
        .map_err(io::Error::other);
    if let Some(trace) = trace {
        trace.dial_done(
            address.as_deref().unwrap_or_default(),
            result.as_ref().map(|_| ()),
        );
    }
    result
}

pub(crate) fn server_name(dst: &Uri) -> Result<String, BoxError> {
    let host = dst.host().ok_or("request uri has no host")?;
    Ok(host.trim_start_matches('[').trim_end_matches(']').to_owned())
}

pub(crate) struct TlsConnection {
    inner: TokioIo<BoxedIo>,
    negotiated_h2: bool,
}

impl TlsConnection {
    fn new(io: BoxedIo, negotiated_h2: bool) -> Self {
        Self {
            inner: TokioIo::new(io),
            negotiated_h2,
        }
    }
}

impl HyperRead for TlsConnection {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: ReadBufCursor<'_>,
    ) -> Poll<Result<(), io::Error>> {
        let inner = &mut self.get_mut().inner;
        Pin::new(inner).poll_read(cx, buf)
    }
}

impl HyperWrite for TlsConnection {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, io::Error>> {
        let inner = &mut self.get_mut().inner;
        Pin::new(inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        let inner = &mut self.get_mut().inner;
        Pin::new(inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        let inner = &mut self.get_mut().inner;
        Pin::new(inner).poll_shutdown(cx)
    }
}

impl Connection for TlsConnection {
    fn connected(&self) -> Connected {
        let connected = Connected::new();
        if self.negotiated_h2 {
            connected.negotiated_h2()
        } else {
            connected
        }
    }
}

#[derive(Clone)]
pub(crate) struct TlsFallbackConnector {
    http: HttpConnector,
    primary: Arc<dyn TlsDialer>,
    fallback: Option<Arc<dyn TlsDialer>>,
    handshake_timeout: Option<Duration>,
    metrics: ClientMetrics,
}

impl TlsFallbackConnector {
    pub(crate) fn new(
        http: HttpConnector,
        primary: Arc<dyn TlsDialer>,
        fallback: Option<Arc<dyn TlsDialer>>,
        handshake_timeout: Option<Duration>,
        metrics: ClientMetrics,
    ) -> Self {
        Self {
            http,
            primary,
            fallback,
            handshake_timeout,
            metrics,
        }
    }

    async fn connect(
        self,
        dst: Uri,
        trace: Option<Arc<ConnectionTrace>>,
    ) -> Result<TlsConnection, BoxError> {
        let trace = trace.as_deref();
        let is_https = dst
            .scheme_str()
            .is_some_and(|scheme| scheme.eq_ignore_ascii_case("https"));
        if !is_https {
            let tcp = connect_tcp(self.http, dst, trace).await?;
            return Ok(TlsConnection::new(Box::new(tcp), false));
        }

        let server_name = server_name(&dst)?;
        let session = dial_tls(
            || connect_tcp(self.http.clone(), dst.clone(), trace),
            &server_name,
            self.primary.as_ref(),
            self.fallback.as_deref(),
            self.handshake_timeout,
            &self.metrics,
            trace,
        )
        .await?;
        let negotiated_h2 = session.alpn.as_deref() == Some(&b"h2"[..]);
        Ok(TlsConnection::new(session.io, negotiated_h2))
    }
}

impl Service<Uri> for TlsFallbackConnector {
    type Response = TlsConnection;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        match self.http.poll_ready(cx) {
            Poll::Ready(Ok(())) => Poll::Ready(Ok(())),
            Poll::Ready(Err(error)) => Poll::Ready(Err(Box::new(error))),
            Poll::Pending => Poll::Pending,
        }
    }

    // The pool may finish a dial on a background task, so the trace is
    // captured while the caller is still polling.
    fn call(&mut self, dst: Uri) -> Self::Future {
        let connector = self.clone();
        Box::pin(connector.connect(dst, ConnectionTrace::current()))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use http::Uri;
    use tokio::net::TcpListener;
    use tower_service::Service;

    use super::{TlsFallbackConnector, http_connector, server_name};
    use crate::metrics::ClientMetrics;
    use crate::transport::tls::{HelloProfile, RustlsDialer};
    use crate::transport::trace::ConnectionTrace;

    #[tokio::test]
    async fn dials_report_to_the_trace_of_the_calling_task() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let address = listener.local_addr().expect("addr");
        tokio::spawn(async move { while listener.accept().await.is_ok() {} });

        let dialer = RustlsDialer::new(HelloProfile::Standard, &[b"http/1.1"]).expect("dialer");
        let mut connector = TlsFallbackConnector::new(
            http_connector(None),
            Arc::new(dialer),
            None,
            None,
            ClientMetrics::disabled(),
        );
        let uri: Uri = format!("http://{address}/").parse().expect("uri");

        let trace = ConnectionTrace::new();
        let pending = trace.clone().scope(async { connector.call(uri) }).await;
        pending.await.expect("plain connection");
        assert_eq!(trace.dials(), 1);
    }

    #[test]
    fn ipv6_literals_lose_their_brackets() {
        let uri: Uri = "https://[::1]:8443/".parse().expect("uri");
        assert_eq!(server_name(&uri).expect("host"), "::1");
        let uri: Uri = "https://scanme.sh/".parse().expect("uri");
        assert_eq!(server_name(&uri).expect("host"), "scanme.sh");
    }
}
