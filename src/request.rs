use std::fmt;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use bytes::{BufMut, Bytes, BytesMut};
use http::header::{AUTHORIZATION, CONTENT_LENGTH, HOST, HeaderValue};
use http::{HeaderMap, Method, Uri, Version};
use http_body_util::Full;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::body::{BodySource, ReusableBody};
use crate::error::Error;
use crate::util::{parse_header_name, parse_header_value, parse_request_uri, redact_uri_for_logs};

pub type WireRequest = http::Request<Full<Bytes>>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuthKind {
    Basic,
    Digest,
}

#[derive(Clone, PartialEq, Eq)]
pub struct Auth {
    pub kind: AuthKind,
    pub username: String,
    pub password: String,
}

impl Auth {
    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            kind: AuthKind::Basic,
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn digest(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            kind: AuthKind::Digest,
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Auth {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("Auth")
            .field("kind", &self.kind)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Metrics {
    pub failures: u32,
    pub retries: u32,
    pub drain_errors: u32,
}

#[derive(Clone, Debug, Default)]
pub struct RequestContext {
    cancellation: Option<CancellationToken>,
    deadline: Option<Instant>,
}

impl RequestContext {
    pub fn is_cancelled(&self) -> bool {
        self.cancellation
            .as_ref()
            .is_some_and(CancellationToken::is_cancelled)
    }

    pub fn is_deadline_exceeded(&self) -> bool {
        self.deadline
            .is_some_and(|deadline| Instant::now() >= deadline)
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn error(&self, method: &Method, uri: &str) -> Option<Error> {
        if self.is_cancelled() {
            return Some(Error::Cancelled {
                method: method.clone(),
                uri: uri.to_owned(),
            });
        }
        if self.is_deadline_exceeded() {
            return Some(Error::DeadlineExceeded {
                method: method.clone(),
                uri: uri.to_owned(),
            });
        }
        None
    }

    pub async fn done(&self) {
        match (&self.cancellation, self.deadline) {
            (Some(token), Some(deadline)) => {
                tokio::select! {
                    _ = token.cancelled() => {}
                    _ = tokio::time::sleep_until(deadline) => {}
                }
            }
            (Some(token), None) => token.cancelled().await,
            (None, Some(deadline)) => tokio::time::sleep_until(deadline).await,
            (None, None) => std::future::pending::<()>().await,
        }
    }
}

pub struct Request {
    method: Method,
    uri: Uri,
    version: Version,
    headers: HeaderMap,
    body: Option<ReusableBody>,
    auth: Option<Auth>,
    context: RequestContext,
    metrics: Metrics,
    trace: bool,
}

impl Request {
    pub fn new(method: Method, url: &str) -> Result<Self, Error> {
        Ok(Self {
            method,
            uri: parse_request_uri(url)?,
            version: Version::HTTP_11,
            headers: HeaderMap::new(),
            body: None,
            auth: None,
            context: RequestContext::default(),
            metrics: Metrics::default(),
            trace: false,
        })
    }

    pub fn with_body(
        method: Method,
        url: &str,
        body: impl Into<BodySource>,
    ) -> Result<Self, Error> {
        let mut request = Self::new(method, url)?;
        request.set_body(body)?;
        Ok(request)
    }

    pub fn from_http<B>(request: http::Request<B>) -> Result<Self, Error>
    where
        B: Into<BodySource>,
    {
        let (parts, body) = request.into_parts();
        let uri = if parts.uri.scheme().is_some() {
            parts.uri
        } else {
            parse_request_uri(&parts.uri.to_string())?
        };
        let body = ReusableBody::new(body)?;
        Ok(Self {
            method: parts.method,
            uri,
            version: parts.version,
            headers: parts.headers,
            body: (!body.is_empty()).then_some(body),
            auth: None,
            context: RequestContext::default(),
            metrics: Metrics::default(),
            trace: false,
        })
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn set_method(&mut self, method: Method) {
        self.method = method;
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    pub fn set_uri(&mut self, uri: Uri) {
        self.uri = uri;
    }

    pub fn set_url(&mut self, url: &str) -> Result<(), Error> {
        self.uri = parse_request_uri(url)?;
        Ok(())
    }

    pub fn url(&self) -> String {
        self.uri.to_string()
    }

    pub(crate) fn redacted_url(&self) -> String {
        redact_uri_for_logs(&self.uri)
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    pub fn header(mut self, name: &str, value: &str) -> Result<Self, Error> {
        self.headers
            .insert(parse_header_name(name)?, parse_header_value(name, value)?);
        Ok(self)
    }

    pub fn body(&self) -> Option<&ReusableBody> {
        self.body.as_ref()
    }

    pub fn set_body(&mut self, body: impl Into<BodySource>) -> Result<(), Error> {
        self.body = Some(ReusableBody::new(body)?);
        Ok(())
    }

    pub fn clear_body(&mut self) {
        self.body = None;
    }

    pub fn content_length(&self) -> u64 {
        self.body.as_ref().map_or(0, |body| body.len() as u64)
    }

    pub fn body_bytes(&self) -> Bytes {
        self.body
            .as_ref()
            .map(ReusableBody::bytes)
            .unwrap_or_default()
    }

    pub fn auth(&self) -> Option<&Auth> {
        self.auth.as_ref()
    }

    pub fn set_auth(&mut self, auth: Option<Auth>) {
        self.auth = auth;
    }

    pub fn basic_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.auth = Some(Auth::basic(username, password));
        self
    }

    pub fn digest_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.auth = Some(Auth::digest(username, password));
        self
    }

    pub fn context(&self) -> &RequestContext {
        &self.context
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.context.cancellation = Some(token);
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.context.deadline = Some(deadline);
        self
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Emits connection events for every attempt as `debug` events on the
    /// `retryhttp::trace` target.
    pub fn with_trace(mut self) -> Self {
        self.trace = true;
        self
    }

    pub fn is_traced(&self) -> bool {
        self.trace
    }

    pub fn metrics(&self) -> Metrics {
        self.metrics
    }

    pub(crate) fn metrics_mut(&mut self) -> &mut Metrics {
        &mut self.metrics
    }

    pub fn dump(&self) -> Bytes {
        let wire = self.clone();
        let target = wire
            .uri
            .path_and_query()
            .map_or("/", |path_and_query| path_and_query.as_str());
        let mut out = BytesMut::new();
        out.put_slice(format!("{} {} {:?}\r\n", wire.method, target, wire.version).as_bytes());
        if !wire.headers.contains_key(HOST)
            && let Some(authority) = wire.uri.authority()
        {
            out.put_slice(format!("Host: {authority}\r\n").as_bytes());
        }
        let mut headers = wire.headers.clone();
        if let Some(value) = wire.basic_authorization() {
            headers.insert(AUTHORIZATION, value);
        }
        if wire.body.is_some() && !headers.contains_key(CONTENT_LENGTH) {
            headers.insert(CONTENT_LENGTH, HeaderValue::from(wire.content_length()));
        }
        for (name, value) in &headers {
            out.put_slice(name.as_str().as_bytes());
            out.put_slice(b": ");
            out.put_slice(value.as_bytes());
            out.put_slice(b"\r\n");
        }
        out.put_slice(b"\r\n");
        out.put_slice(&wire.body_bytes());
        out.freeze()
    }

    fn basic_authorization(&self) -> Option<HeaderValue> {
        let auth = self.auth.as_ref().filter(|auth| auth.kind == AuthKind::Basic)?;
        let credentials = BASE64_STANDARD.encode(format!("{}:{}", auth.username, auth.password));
        HeaderValue::from_str(&format!("Basic {credentials}")).ok()
    }

    pub(crate) fn to_wire(&self) -> Result<WireRequest, Error> {
        let body = self
            .body
            .as_ref()
            .map(ReusableBody::wire_body)
            .unwrap_or_else(|| Full::new(Bytes::new()));
        let mut request = http::Request::builder()
            .method(self.method.clone())
            .uri(self.uri.clone())
            .version(self.version)
            .body(body)
            .map_err(|source| Error::RequestBuild { source })?;
        *request.headers_mut() = self.headers.clone();
        if !request.headers().contains_key(AUTHORIZATION)
            && let Some(value) = self.basic_authorization()
        {
            request.headers_mut().insert(AUTHORIZATION, value);
        }
        Ok(request)
    }
}

impl Clone for Request {
    fn clone(&self) -> Self {
        let body = self.body.as_ref().map(|body| {
            let mut body = body.clone();
            body.rewind();
            body
        });
        Self {
            method: self.method.clone(),
            uri: self.uri.clone(),
            version: self.version,
            headers: self.headers.clone(),
            body,
            auth: self.auth.clone(),
            context: self.context.clone(),
            metrics: Metrics::default(),
            trace: self.trace,
        }
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("Request")
            .field("method", &self.method)
            .field("uri", &self.redacted_url())
            .field("headers", &self.headers.len())
            .field("content_length", &self.content_length())
            .field("auth", &self.auth)
            .field("metrics", &self.metrics)
            .finish()
    }
}
