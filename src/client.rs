use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use http::header::{AUTHORIZATION, CONTENT_TYPE};
use http::{Method, StatusCode};
use tracing::{Instrument, debug, info_span, warn};

use crate::auth::DigestChallenge;
use crate::backoff::{Backoff, ExponentialBackoff};
use crate::body::BodySource;
use crate::drain;
use crate::error::Error;
use crate::metrics::{ClientMetrics, ClientMetricsSnapshot};
use crate::middleware::RequestMiddleware;
use crate::request::{AuthKind, Request};
use crate::response::HttpResponse;
use crate::retry::{CheckRetry, RetryPolicy};
use crate::transport::tls::{HelloProfile, RustlsDialer};
use crate::transport::trace::ConnectionTrace;
use crate::transport::{Executor, ImpersonateExecutor, StandardExecutor, Tier, chrome_headers};
use crate::util::{
    is_redirect_status, parse_header_value, redirect_location, redirect_method,
    resolve_redirect_uri, same_origin, sanitize_headers_for_redirect,
};

const DEFAULT_RETRY_WAIT_MIN: Duration = Duration::from_secs(1);
const DEFAULT_RETRY_WAIT_MAX: Duration = Duration::from_secs(30);
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_RETRY_MAX: usize = 5;
const DEFAULT_RESP_READ_LIMIT: usize = 4096;
const DEFAULT_MAX_REDIRECTS: usize = 10;

pub type RequestLogHook = Arc<dyn Fn(&Request, usize) + Send + Sync>;
pub type ResponseLogHook = Arc<dyn Fn(&HttpResponse) + Send + Sync>;
pub type ErrorHandler = Arc<
    dyn Fn(Option<HttpResponse>, Option<Error>, usize) -> Result<HttpResponse, Error>
        + Send
        + Sync,
>;

pub fn pass_through_error_handler(
    response: Option<HttpResponse>,
    error: Option<Error>,
    _attempts: usize,
) -> Result<HttpResponse, Error> {
    match (response, error) {
        (Some(response), _) => Ok(response),
        (None, Some(error)) => Err(error),
        (None, None) => Err(Error::MissingResponse),
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TimeoutAdjust {
    pub threshold: Duration,
    pub fraction: f64,
}

impl Default for TimeoutAdjust {
    fn default() -> Self {
        Self {
            threshold: Duration::from_secs(15),
            fraction: 0.3,
        }
    }
}

impl TimeoutAdjust {
    pub fn attempt_timeout(&self, timeout: Duration, retry_max: usize) -> Duration {
        if timeout > self.threshold && retry_max > 1 && self.fraction.is_finite() {
            timeout.mul_f64(self.fraction.clamp(0.0, 1.0))
        } else {
            timeout
        }
    }
}

#[derive(Clone)]
pub struct Options {
    pub retry_wait_min: Duration,
    pub retry_wait_max: Duration,
    pub timeout: Duration,
    pub retry_max: usize,
    pub resp_read_limit: usize,
    pub kill_idle_conn: bool,
    pub disable_http_fallback: bool,
    pub disable_tls_fallback: bool,
    pub impersonate_chrome: bool,
    pub max_redirects: usize,
    pub timeout_adjust: Option<TimeoutAdjust>,
    pub check_retry: Option<Arc<dyn CheckRetry>>,
    pub backoff: Option<Arc<dyn Backoff>>,
    pub executor: Option<Arc<dyn Executor>>,
    pub http3_executor: Option<Arc<dyn Executor>>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            retry_wait_min: DEFAULT_RETRY_WAIT_MIN,
            retry_wait_max: DEFAULT_RETRY_WAIT_MAX,
            timeout: DEFAULT_TIMEOUT,
            retry_max: DEFAULT_RETRY_MAX,
            resp_read_limit: DEFAULT_RESP_READ_LIMIT,
            kill_idle_conn: false,
            disable_http_fallback: false,
            disable_tls_fallback: false,
            impersonate_chrome: false,
            max_redirects: DEFAULT_MAX_REDIRECTS,
            timeout_adjust: Some(TimeoutAdjust::default()),
            check_retry: None,
            backoff: None,
            executor: None,
            http3_executor: None,
        }
    }
}

impl Options {
    pub fn spraying() -> Self {
        Self {
            kill_idle_conn: true,
            timeout_adjust: None,
            ..Self::default()
        }
    }

    pub fn single() -> Self {
        Self {
            kill_idle_conn: false,
            timeout_adjust: None,
            ..Self::default()
        }
    }

    pub(crate) fn attempt_timeout(&self) -> Duration {
        match &self.timeout_adjust {
            Some(adjust) => adjust.attempt_timeout(self.timeout, self.retry_max),
            None => self.timeout,
        }
    }
}

impl fmt::Debug for Options {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("Options")
            .field("retry_wait_min", &self.retry_wait_min)
            .field("retry_wait_max", &self.retry_wait_max)
            .field("timeout", &self.timeout)
            .field("retry_max", &self.retry_max)
            .field("resp_read_limit", &self.resp_read_limit)
            .field("kill_idle_conn", &self.kill_idle_conn)
            .field("disable_http_fallback", &self.disable_http_fallback)
            .field("disable_tls_fallback", &self.disable_tls_fallback)
            .field("impersonate_chrome", &self.impersonate_chrome)
            .field("max_redirects", &self.max_redirects)
            .field("timeout_adjust", &self.timeout_adjust)
            .field("check_retry", &self.check_retry.is_some())
            .field("backoff", &self.backoff.is_some())
            .field("executor", &self.executor.is_some())
            .field("http3_executor", &self.http3_executor.is_some())
            .finish()
    }
}

pub struct ClientBuilder {
    options: Options,
    request_log_hook: Option<RequestLogHook>,
    response_log_hook: Option<ResponseLogHook>,
    error_handler: Option<ErrorHandler>,
    middleware: Vec<Arc<dyn RequestMiddleware>>,
    metrics_enabled: bool,
}

impl ClientBuilder {
    fn new(options: Options) -> Self {
        Self {
            options,
            request_log_hook: None,
            response_log_hook: None,
            error_handler: None,
            middleware: Vec::new(),
            metrics_enabled: true,
        }
    }

    pub fn options(mut self, options: Options) -> Self {
        self.options = options;
        self
    }

    pub fn retry_wait(mut self, min: Duration, max: Duration) -> Self {
        self.options.retry_wait_min = min;
        self.options.retry_wait_max = max;
        self
    }

    pub fn retry_max(mut self, retry_max: usize) -> Self {
        self.options.retry_max = retry_max;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.options.timeout = timeout;
        self
    }

    pub fn kill_idle_conn(mut self, kill: bool) -> Self {
        self.options.kill_idle_conn = kill;
        self
    }

    pub fn disable_http_fallback(mut self, disabled: bool) -> Self {
        self.options.disable_http_fallback = disabled;
        self
    }

    pub fn disable_tls_fallback(mut self, disabled: bool) -> Self {
        self.options.disable_tls_fallback = disabled;
        self
    }

    pub fn impersonate_chrome(mut self, enabled: bool) -> Self {
        self.options.impersonate_chrome = enabled;
        self
    }

    pub fn max_redirects(mut self, max_redirects: usize) -> Self {
        self.options.max_redirects = max_redirects;
        self
    }

    pub fn check_retry(mut self, check_retry: impl CheckRetry + 'static) -> Self {
        self.options.check_retry = Some(Arc::new(check_retry));
        self
    }

    pub fn backoff(mut self, backoff: impl Backoff + 'static) -> Self {
        self.options.backoff = Some(Arc::new(backoff));
        self
    }

    pub fn executor(mut self, executor: Arc<dyn Executor>) -> Self {
        self.options.executor = Some(executor);
        self
    }

    pub fn http3_executor(mut self, executor: Arc<dyn Executor>) -> Self {
        self.options.http3_executor = Some(executor);
        self
    }

    pub fn request_log_hook<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Request, usize) + Send + Sync + 'static,
    {
        self.request_log_hook = Some(Arc::new(hook));
        self
    }

    pub fn response_log_hook<F>(mut self, hook: F) -> Self
    where
        F: Fn(&HttpResponse) + Send + Sync + 'static,
    {
        self.response_log_hook = Some(Arc::new(hook));
        self
    }

    pub fn error_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(Option<HttpResponse>, Option<Error>, usize) -> Result<HttpResponse, Error>
            + Send
            + Sync
            + 'static,
    {
        self.error_handler = Some(Arc::new(handler));
        self
    }

    pub fn middleware(mut self, middleware: impl RequestMiddleware + 'static) -> Self {
        self.middleware.push(Arc::new(middleware));
        self
    }

    pub fn metrics_enabled(mut self, enabled: bool) -> Self {
        self.metrics_enabled = enabled;
        self
    }

    pub fn try_build(self) -> Result<Client, Error> {
        let Self {
            mut options,
            request_log_hook,
            response_log_hook,
            error_handler,
            mut middleware,
            metrics_enabled,
        } = self;
        let metrics = if metrics_enabled {
            ClientMetrics::enabled()
        } else {
            ClientMetrics::disabled()
        };

        let base: Arc<dyn Executor> = match options.executor.clone() {
            Some(executor) => {
                if executor.pool_settings().never_reuses() {
                    options.kill_idle_conn = true;
                }
                executor
            }
            None => Arc::new(
                StandardExecutor::builder()
                    .pooled(!options.kill_idle_conn)
                    .tls_fallback(!options.disable_tls_fallback)
                    .metrics(metrics.clone())
                    .try_build()?,
            ),
        };

        let impersonate: Option<Arc<dyn Executor>> = if options.impersonate_chrome {
            middleware.push(Arc::new(chrome_headers()));
            let executor = if options.disable_tls_fallback {
                let dialer = RustlsDialer::new(HelloProfile::Chrome, &[b"h2", b"http/1.1"])?;
                ImpersonateExecutor::with_dialers(Arc::clone(&base), Arc::new(dialer), None)
            } else {
                ImpersonateExecutor::new(Arc::clone(&base))?
            };
            Some(Arc::new(executor.metrics(metrics.clone())))
        } else {
            None
        };

        let http2: Option<Arc<dyn Executor>> = if options.disable_http_fallback {
            None
        } else {
            Some(Arc::new(
                StandardExecutor::builder()
                    .http2_only(true)
                    .pooled(!options.kill_idle_conn)
                    .tls_fallback(!options.disable_tls_fallback)
                    .metrics(metrics.clone())
                    .try_build()?,
            ))
        };

        let check_retry = options
            .check_retry
            .clone()
            .unwrap_or_else(|| Arc::new(RetryPolicy::standard()) as Arc<dyn CheckRetry>);
        let backoff = options
            .backoff
            .clone()
            .unwrap_or_else(|| Arc::new(ExponentialBackoff) as Arc<dyn Backoff>);
        let http3 = options.http3_executor.clone();

        Ok(Client {
            inner: Arc::new(ClientInner {
                attempt_timeout: options.attempt_timeout(),
                options,
                base,
                impersonate,
                http2,
                http3,
                check_retry,
                backoff,
                request_log_hook,
                response_log_hook,
                error_handler,
                middleware,
                metrics,
                request_count: AtomicU64::new(0),
            }),
        })
    }
}

#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    options: Options,
    attempt_timeout: Duration,
    base: Arc<dyn Executor>,
    impersonate: Option<Arc<dyn Executor>>,
    http2: Option<Arc<dyn Executor>>,
    http3: Option<Arc<dyn Executor>>,
    check_retry: Arc<dyn CheckRetry>,
    backoff: Arc<dyn Backoff>,
    request_log_hook: Option<RequestLogHook>,
    response_log_hook: Option<ResponseLogHook>,
    error_handler: Option<ErrorHandler>,
    middleware: Vec<Arc<dyn RequestMiddleware>>,
    metrics: ClientMetrics,
    request_count: AtomicU64,
}

enum Step {
    Done(Result<HttpResponse, Error>),
    Resend,
}

impl Client {
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new(Options::default())
    }

    pub fn with_options(options: Options) -> ClientBuilder {
        ClientBuilder::new(options)
    }

    pub fn new(options: Options) -> Result<Self, Error> {
        Self::with_options(options).try_build()
    }

    pub fn options(&self) -> &Options {
        &self.inner.options
    }

    pub fn request_count(&self) -> u64 {
        self.inner.request_count.load(Ordering::Relaxed)
    }

    pub fn metrics_snapshot(&self) -> ClientMetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    pub fn close_idle_connections(&self) {
        let inner = &self.inner;
        inner.base.close_idle_connections();
        for executor in [&inner.impersonate, &inner.http2, &inner.http3]
            .into_iter()
            .flatten()
        {
            executor.close_idle_connections();
        }
    }

    pub async fn get(&self, url: &str) -> Result<HttpResponse, Error> {
        let mut request = Request::new(Method::GET, url)?;
        self.execute(&mut request).await
    }

    pub async fn head(&self, url: &str) -> Result<HttpResponse, Error> {
        let mut request = Request::new(Method::HEAD, url)?;
        self.execute(&mut request).await
    }

    pub async fn post(
        &self,
        url: &str,
        content_type: &str,
        body: impl Into<BodySource>,
    ) -> Result<HttpResponse, Error> {
        let mut request = Request::with_body(Method::POST, url, body)?;
        request
            .headers_mut()
            .insert(CONTENT_TYPE, parse_header_value("content-type", content_type)?);
        self.execute(&mut request).await
    }

    pub async fn execute(&self, request: &mut Request) -> Result<HttpResponse, Error> {
        self.run(request, None).await
    }

    pub async fn execute_on(
        &self,
        tier: Tier,
        request: &mut Request,
    ) -> Result<HttpResponse, Error> {
        let inner = &self.inner;
        let executor = match tier {
            Tier::Standard => Some(Arc::clone(&inner.base)),
            Tier::Impersonate => inner.impersonate.clone(),
            Tier::Http2 => inner.http2.clone(),
            Tier::Http3 => inner.http3.clone(),
        }
        .ok_or(Error::ExecutorUnavailable {
            tier: tier.as_str(),
        })?;
        self.run(request, Some(executor)).await
    }

    async fn run(
        &self,
        request: &mut Request,
        pinned: Option<Arc<dyn Executor>>,
    ) -> Result<HttpResponse, Error> {
        let inner = &self.inner;
        inner.request_count.fetch_add(1, Ordering::Relaxed);
        inner.metrics.record_request_started();
        let _in_flight = inner.metrics.enter_in_flight();
        let started_at = Instant::now();

        let result = self.retry_loop(request, pinned).await;

        inner
            .metrics
            .record_request_completed(&result, started_at.elapsed());
        if inner.options.kill_idle_conn {
            inner.base.close_idle_connections();
        }
        result
    }

    fn default_executor(&self) -> Arc<dyn Executor> {
        let inner = &self.inner;
        match &inner.impersonate {
            Some(executor) if !inner.options.disable_http_fallback => Arc::clone(executor),
            _ => Arc::clone(&inner.base),
        }
    }

    async fn retry_loop(
        &self,
        request: &mut Request,
        pinned: Option<Arc<dyn Executor>>,
    ) -> Result<HttpResponse, Error> {
        let inner = &self.inner;
        let options = &inner.options;
        let executor = pinned.clone().unwrap_or_else(|| self.default_executor());
        let http2_fallback = if pinned.is_none() {
            inner.http2.clone()
        } else {
            None
        };
        let mut attempt = 0_usize;

        loop {
            self.apply_middleware(request)?;
            let mut current = request.clone();
            *current.metrics_mut() = request.metrics();
            let chain = self
                .send_chain(
                    &mut current,
                    attempt,
                    executor.as_ref(),
                    http2_fallback.as_deref(),
                )
                .await;
            *request.metrics_mut() = current.metrics();
            let outcome = chain?;

            if outcome.is_err() {
                request.metrics_mut().failures += 1;
                inner.metrics.record_failure();
            }
            if let (Some(hook), Ok(response)) = (&inner.response_log_hook, &outcome) {
                hook(response);
            }

            let decision =
                inner
                    .check_retry
                    .check_retry(request, outcome.as_ref().ok(), outcome.as_ref().err());
            let should_retry = match decision {
                Ok(should_retry) => should_retry,
                Err(policy_error) => {
                    if let Ok(response) = outcome {
                        self.drain(request, response).await;
                    }
                    return Err(policy_error);
                }
            };

            if !should_retry {
                if outcome.is_ok() {
                    return outcome;
                }
                return self.give_up(request, outcome, attempt + 1).await;
            }
            if attempt >= options.retry_max {
                return self.give_up(request, outcome, attempt + 1).await;
            }

            let delay = inner.backoff.backoff(
                u32::try_from(attempt + 1).unwrap_or(u32::MAX),
                options.retry_wait_min,
                options.retry_wait_max,
                outcome.as_ref().ok(),
            );
            let last_error = match outcome {
                Ok(response) => {
                    let status = response.status();
                    self.drain(request, response).await;
                    format!("status {status}")
                }
                Err(error) => error.to_string(),
            };
            warn!(
                method = %request.method(),
                uri = %request.redacted_url(),
                attempt = attempt,
                delay_ms = delay.as_millis() as u64,
                error = %last_error,
                "retrying request"
            );
            request.metrics_mut().retries += 1;
            inner.metrics.record_retry();
            if !delay.is_zero() {
                let method = request.method().clone();
                let uri = request.redacted_url();
                let context = request.context();
                tokio::select! {
                    biased;
                    _ = context.done() => {
                        let cancelled = context.error(&method, &uri);
                        return Err(cancelled.unwrap_or(Error::Cancelled { method, uri }));
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            attempt += 1;
        }
    }

    fn apply_middleware(&self, request: &mut Request) -> Result<(), Error> {
        for middleware in &self.inner.middleware {
            middleware
                .on_before_request(request)
                .map_err(|source| Error::Middleware { source })?;
        }
        Ok(())
    }

    async fn send_chain(
        &self,
        current: &mut Request,
        attempt: usize,
        executor: &dyn Executor,
        http2_fallback: Option<&dyn Executor>,
    ) -> Result<Result<HttpResponse, Error>, Error> {
        let mut redirects = 0_usize;
        let mut digest_answered = false;
        let mut resend = false;

        loop {
            if resend {
                self.apply_middleware(current)?;
            }
            if let Some(hook) = &self.inner.request_log_hook {
                hook(&*current, attempt);
            }

            let span = info_span!(
                "retryhttp.request",
                method = %current.method(),
                uri = %current.redacted_url(),
                attempt = attempt
            );
            let response = match self
                .send_attempt(executor, http2_fallback, current)
                .instrument(span)
                .await
            {
                Ok(response) => response,
                Err(error) => return Ok(Err(error)),
            };
            match self
                .follow_up(current, response, &mut redirects, &mut digest_answered)
                .await
            {
                Step::Resend => resend = true,
                Step::Done(result) => return Ok(result),
            }
        }
    }

    async fn send_attempt(
        &self,
        executor: &dyn Executor,
        http2_fallback: Option<&dyn Executor>,
        request: &Request,
    ) -> Result<HttpResponse, Error> {
        debug!("sending request");
        let result = self.send_once(executor, request).await;
        match (result, http2_fallback) {
            (Err(error), Some(http2)) if error.is_malformed_http_version() => {
                debug!(error = %error, "http/1 response was malformed; retrying over http/2");
                self.inner.metrics.record_http2_fallback();
                self.send_once(http2, request).await
            }
            (result, _) => result,
        }
    }

    async fn send_once(
        &self,
        executor: &dyn Executor,
        request: &Request,
    ) -> Result<HttpResponse, Error> {
        self.inner.metrics.record_attempt();
        let method = request.method().clone();
        let uri = request.redacted_url();
        let context = request.context();
        if let Some(error) = context.error(&method, &uri) {
            return Err(error);
        }
        let wire = request.to_wire()?;
        let timeout = self.inner.attempt_timeout;
        let trace = request.is_traced().then(ConnectionTrace::new);
        let call = executor.execute(wire);
        let call = async {
            let result = match trace.clone() {
                Some(trace) => trace.scope(call).await,
                None => call.await,
            };
            if let (Some(trace), Ok(_)) = (&trace, &result) {
                trace.got_response();
            }
            result
        };
        let exchange = async {
            if timeout.is_zero() {
                return call.await;
            }
            match tokio::time::timeout(timeout, call).await {
                Ok(result) => result,
                Err(_) => Err(Error::Timeout {
                    timeout_ms: timeout.as_millis(),
                    method: method.clone(),
                    uri: uri.clone(),
                }),
            }
        };
        tokio::select! {
            biased;
            _ = context.done() => Err(context
                .error(&method, &uri)
                .unwrap_or(Error::Cancelled { method: method.clone(), uri: uri.clone() })),
            result = exchange => result,
        }
    }

    async fn follow_up(
        &self,
        request: &mut Request,
        response: HttpResponse,
        redirects: &mut usize,
        digest_answered: &mut bool,
    ) -> Step {
        let status = response.status();
        let max_redirects = self.inner.options.max_redirects;

        if max_redirects > 0 && is_redirect_status(status) {
            let method = request.method().clone();
            let uri = request.redacted_url();
            if *redirects >= max_redirects {
                self.drain(request, response).await;
                return Step::Done(Err(Error::RedirectLimitExceeded {
                    max_redirects,
                    method,
                    uri,
                }));
            }
            let Some(location) = redirect_location(response.headers()) else {
                self.drain(request, response).await;
                return Step::Done(Err(Error::MissingRedirectLocation {
                    status: status.as_u16(),
                    method,
                    uri,
                }));
            };
            let Some(next_uri) = resolve_redirect_uri(request.uri(), &location) else {
                self.drain(request, response).await;
                return Step::Done(Err(Error::InvalidRedirectLocation {
                    location,
                    method,
                    uri,
                }));
            };
            self.drain(request, response).await;

            let next_method = redirect_method(&method, status);
            let changed_to_get = next_method == Method::GET && method != Method::GET;
            let same_origin_redirect = same_origin(request.uri(), &next_uri);
            sanitize_headers_for_redirect(
                request.headers_mut(),
                changed_to_get,
                same_origin_redirect,
            );
            if changed_to_get {
                request.clear_body();
            }
            if !same_origin_redirect {
                request.set_auth(None);
            }
            debug!(status = status.as_u16(), location = %location, "following redirect");
            request.set_method(next_method);
            request.set_uri(next_uri);
            *redirects += 1;
            return Step::Resend;
        }

        if status == StatusCode::UNAUTHORIZED && !*digest_answered {
            let target = request
                .uri()
                .path_and_query()
                .map_or_else(|| "/".to_owned(), |path| path.as_str().to_owned());
            let authorization = request
                .auth()
                .filter(|auth| auth.kind == AuthKind::Digest)
                .zip(DigestChallenge::from_headers(response.headers()))
                .and_then(|(auth, challenge)| {
                    challenge.authorization(auth, request.method(), &target)
                });
            if let Some(value) = authorization {
                self.drain(request, response).await;
                request.headers_mut().insert(AUTHORIZATION, value);
                *digest_answered = true;
                return Step::Resend;
            }
        }

        Step::Done(Ok(response))
    }

    async fn give_up(
        &self,
        request: &mut Request,
        outcome: Result<HttpResponse, Error>,
        attempts: usize,
    ) -> Result<HttpResponse, Error> {
        if let Some(handler) = &self.inner.error_handler {
            let (response, error) = match outcome {
                Ok(response) => (Some(response), None),
                Err(error) => (None, Some(error)),
            };
            return handler(response, error, attempts);
        }

        let (status, source) = match outcome {
            Ok(response) => {
                let status = response.status().as_u16();
                self.drain(request, response).await;
                (Some(status), None)
            }
            Err(error) => (None, Some(Box::new(error))),
        };
        Err(Error::RetriesExhausted {
            method: request.method().clone(),
            uri: request.redacted_url(),
            attempts,
            status,
            source,
        })
    }

    async fn drain(&self, request: &mut Request, response: HttpResponse) {
        let before = request.metrics().drain_errors;
        drain::discard(request, response, self.inner.options.resp_read_limit).await;
        if request.metrics().drain_errors > before {
            self.inner.metrics.record_drain_error();
        }
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("Client")
            .field("options", &self.inner.options)
            .field("impersonate", &self.inner.impersonate.is_some())
            .field("http2_fallback", &self.inner.http2.is_some())
            .field("http3", &self.inner.http3.is_some())
            .field("request_count", &self.request_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use futures_util::future::BoxFuture;
    use http::{HeaderMap, Method, StatusCode, Version};
    use tokio_util::sync::CancellationToken;

    use super::{Client, Options, TimeoutAdjust, pass_through_error_handler};
    use crate::error::{Error, TransportErrorKind, transport_error};
    use crate::request::{Request, WireRequest};
    use crate::response::{HttpResponse, ResponseBody};
    use crate::transport::trace::ConnectionTrace;
    use crate::transport::{Executor, PoolSettings, Tier};

    struct ScriptedExecutor {
        script: Vec<Result<u16, TransportErrorKind>>,
        calls: AtomicUsize,
        seen: Mutex<Vec<WireRequest>>,
        traced: AtomicUsize,
        pool: PoolSettings,
    }

    impl ScriptedExecutor {
        fn new(script: Vec<Result<u16, TransportErrorKind>>) -> Arc<Self> {
            Arc::new(Self {
                script,
                calls: AtomicUsize::new(0),
                seen: Mutex::new(Vec::new()),
                traced: AtomicUsize::new(0),
                pool: PoolSettings::default(),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl Executor for ScriptedExecutor {
        fn execute(&self, request: WireRequest) -> BoxFuture<'_, Result<HttpResponse, Error>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            let method = request.method().clone();
            let uri = request.uri().to_string();
            self.seen.lock().expect("seen").push(request);
            let step = self.script[call.min(self.script.len() - 1)];
            Box::pin(async move {
                if ConnectionTrace::current().is_some() {
                    self.traced.fetch_add(1, Ordering::SeqCst);
                }
                match step {
                    Ok(status) => Ok(HttpResponse::new(
                        StatusCode::from_u16(status).expect("status"),
                        Version::HTTP_11,
                        HeaderMap::new(),
                        ResponseBody::empty(),
                    )),
                    Err(kind) => Err(transport_error(kind, &method, &uri, "scripted failure")),
                }
            })
        }

        fn pool_settings(&self) -> PoolSettings {
            self.pool
        }
    }

    fn fast_options(executor: Arc<ScriptedExecutor>) -> Options {
        Options {
            retry_wait_min: Duration::from_millis(1),
            retry_wait_max: Duration::from_millis(2),
            retry_max: 3,
            disable_http_fallback: true,
            executor: Some(executor),
            ..Options::default()
        }
    }

    fn get() -> Request {
        Request::new(Method::GET, "http://127.0.0.1:1/target").expect("request")
    }

    #[test]
    fn presets_carry_documented_defaults() {
        for options in [Options::spraying(), Options::single()] {
            assert_eq!(options.retry_wait_min, Duration::from_secs(1));
            assert_eq!(options.retry_wait_max, Duration::from_secs(30));
            assert_eq!(options.timeout, Duration::from_secs(30));
            assert_eq!(options.retry_max, 5);
            assert_eq!(options.resp_read_limit, 4096);
            assert!(options.timeout_adjust.is_none());
        }
        assert!(Options::spraying().kill_idle_conn);
        assert!(!Options::single().kill_idle_conn);
    }

    #[test]
    fn timeout_adjust_shrinks_long_timeouts_with_retries() {
        let adjust = TimeoutAdjust::default();
        assert_eq!(
            adjust.attempt_timeout(Duration::from_secs(30), 5),
            Duration::from_secs(9)
        );
        assert_eq!(
            adjust.attempt_timeout(Duration::from_secs(10), 5),
            Duration::from_secs(10)
        );
        assert_eq!(
            adjust.attempt_timeout(Duration::from_secs(30), 1),
            Duration::from_secs(30)
        );
    }

    #[test]
    fn non_finite_fractions_leave_the_timeout_alone() {
        for fraction in [f64::NAN, f64::INFINITY] {
            let adjust = TimeoutAdjust {
                threshold: Duration::from_secs(1),
                fraction,
            };
            assert_eq!(
                adjust.attempt_timeout(Duration::from_secs(30), 5),
                Duration::from_secs(30)
            );
        }
        let options = Options {
            timeout_adjust: Some(TimeoutAdjust {
                threshold: Duration::from_secs(1),
                fraction: f64::NAN,
            }),
            ..Options::default()
        };
        assert_eq!(options.attempt_timeout(), options.timeout);
    }

    #[tokio::test]
    async fn traced_requests_carry_a_connection_trace_on_every_attempt() {
        let executor = ScriptedExecutor::new(vec![Ok(503), Ok(200)]);
        let client = Client::new(fast_options(Arc::clone(&executor))).expect("client");

        client.execute(&mut get()).await.expect("untraced response");
        assert_eq!(executor.traced.load(Ordering::SeqCst), 0);

        let mut request = get().with_trace();
        client.execute(&mut request).await.expect("traced response");
        assert_eq!(executor.calls(), 3);
        assert_eq!(executor.traced.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn middleware_runs_before_every_attempt() {
        let executor = ScriptedExecutor::new(vec![Ok(503), Ok(502), Ok(200)]);
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let client = Client::with_options(fast_options(Arc::clone(&executor)))
            .middleware(move |request: &mut Request| -> Result<(), crate::error::BoxError> {
                counter.fetch_add(1, Ordering::SeqCst);
                request.headers_mut().insert("x-scan", http::HeaderValue::from_static("1"));
                Ok(())
            })
            .try_build()
            .expect("client");
        let mut request = get();
        client.execute(&mut request).await.expect("response");
        assert_eq!(runs.load(Ordering::SeqCst), 3);
        assert_eq!(request.headers()["x-scan"], "1");
        let seen = executor.seen.lock().expect("seen");
        assert!(seen.iter().all(|wire| wire.headers()["x-scan"] == "1"));
    }

    #[tokio::test]
    async fn server_errors_are_retried_until_success() {
        let executor = ScriptedExecutor::new(vec![Ok(500), Ok(503), Ok(200)]);
        let client = Client::new(fast_options(Arc::clone(&executor))).expect("client");
        let mut request = get();
        let response = client.execute(&mut request).await.expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(executor.calls(), 3);
        assert_eq!(request.metrics().retries, 2);
        assert_eq!(request.metrics().failures, 0);
        assert_eq!(client.metrics_snapshot().retries, 2);
        assert_eq!(client.request_count(), 1);
    }

    #[tokio::test]
    async fn exhausted_retries_name_attempts_and_cause() {
        let executor = ScriptedExecutor::new(vec![Err(TransportErrorKind::Read)]);
        let client = Client::new(fast_options(Arc::clone(&executor))).expect("client");
        let mut request = get();
        let error = client.execute(&mut request).await.expect_err("must fail");
        match error {
            Error::RetriesExhausted {
                attempts, source, ..
            } => {
                assert_eq!(attempts, 4);
                assert_eq!(
                    source.and_then(|source| source.transport_kind()),
                    Some(TransportErrorKind::Read)
                );
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(executor.calls(), 4);
        assert_eq!(request.metrics().failures, 4);
        assert_eq!(request.metrics().retries, 3);
    }

    #[tokio::test]
    async fn client_errors_are_returned_without_retry() {
        let executor = ScriptedExecutor::new(vec![Ok(404)]);
        let client = Client::new(fast_options(Arc::clone(&executor))).expect("client");
        let mut request = get();
        let response = client.execute(&mut request).await.expect("response");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(executor.calls(), 1);
        assert_eq!(request.metrics().retries, 0);
    }

    #[tokio::test]
    async fn error_handler_owns_the_final_outcome() {
        let executor = ScriptedExecutor::new(vec![Ok(503)]);
        let seen_attempts = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&seen_attempts);
        let client = Client::with_options(fast_options(Arc::clone(&executor)))
            .error_handler(move |response, error, attempts| {
                seen.store(attempts, Ordering::SeqCst);
                pass_through_error_handler(response, error, attempts)
            })
            .try_build()
            .expect("client");
        let response = client.execute(&mut get()).await.expect("handler response");
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(seen_attempts.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn hooks_fire_per_attempt_in_order() {
        let executor = ScriptedExecutor::new(vec![Ok(500), Ok(200)]);
        let events = Arc::new(Mutex::new(Vec::new()));
        let requests = Arc::clone(&events);
        let responses = Arc::clone(&events);
        let client = Client::with_options(fast_options(executor))
            .request_log_hook(move |_, attempt| {
                requests.lock().expect("events").push(format!("request:{attempt}"));
            })
            .response_log_hook(move |response| {
                responses
                    .lock()
                    .expect("events")
                    .push(format!("response:{}", response.status().as_u16()));
            })
            .try_build()
            .expect("client");
        client.execute(&mut get()).await.expect("response");
        assert_eq!(
            *events.lock().expect("events"),
            vec!["request:0", "response:500", "request:1", "response:200"]
        );
    }

    #[tokio::test]
    async fn middleware_failure_aborts_before_sending() {
        let executor = ScriptedExecutor::new(vec![Ok(200)]);
        let client = Client::with_options(fast_options(Arc::clone(&executor)))
            .middleware(|_: &mut Request| -> Result<(), crate::error::BoxError> {
                Err("blocked".into())
            })
            .try_build()
            .expect("client");
        let error = client.execute(&mut get()).await.expect_err("must fail");
        assert!(matches!(error, Error::Middleware { .. }));
        assert_eq!(executor.calls(), 0);
    }

    #[tokio::test]
    async fn cancellation_during_backoff_stops_the_loop() {
        let executor = ScriptedExecutor::new(vec![Ok(503)]);
        let options = Options {
            retry_wait_min: Duration::from_secs(30),
            retry_wait_max: Duration::from_secs(30),
            ..fast_options(Arc::clone(&executor))
        };
        let client = Client::new(options).expect("client");
        let token = CancellationToken::new();
        let mut request = get().with_cancellation(token.clone());
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            token.cancel();
        });
        let error = client.execute(&mut request).await.expect_err("cancelled");
        assert!(error.is_cancellation(), "{error}");
        assert_eq!(executor.calls(), 1);
        assert_eq!(request.metrics().retries, 1);
        assert_eq!(client.metrics_snapshot().retries, 1);
    }

    #[tokio::test]
    async fn basic_auth_is_sent_on_every_attempt() {
        let executor = ScriptedExecutor::new(vec![Ok(502), Ok(200)]);
        let client = Client::new(fast_options(Arc::clone(&executor))).expect("client");
        let mut request = get().basic_auth("user", "pass");
        client.execute(&mut request).await.expect("response");
        let seen = executor.seen.lock().expect("seen");
        assert_eq!(seen.len(), 2);
        for wire in seen.iter() {
            assert_eq!(wire.headers()["authorization"], "Basic dXNlcjpwYXNz");
        }
    }

    #[tokio::test]
    async fn never_reusing_executor_turns_on_idle_kill() {
        let executor = Arc::new(ScriptedExecutor {
            script: vec![Ok(200)],
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
            traced: AtomicUsize::new(0),
            pool: PoolSettings {
                keep_alive: false,
                max_idle_per_host: 0,
            },
        });
        let client = Client::new(fast_options(executor)).expect("client");
        assert!(client.options().kill_idle_conn);
    }

    #[tokio::test]
    async fn missing_tiers_are_reported() {
        let executor = ScriptedExecutor::new(vec![Ok(200)]);
        let client = Client::new(fast_options(executor)).expect("client");
        let error = client
            .execute_on(Tier::Http3, &mut get())
            .await
            .expect_err("no http3 tier");
        assert!(matches!(error, Error::ExecutorUnavailable { tier: "http3" }));

        let http3 = ScriptedExecutor::new(vec![Ok(204)]);
        let client = Client::with_options(fast_options(ScriptedExecutor::new(vec![Ok(200)])))
            .http3_executor(http3.clone())
            .try_build()
            .expect("client");
        let response = client
            .execute_on(Tier::Http3, &mut get())
            .await
            .expect("http3 response");
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert_eq!(http3.calls(), 1);
    }
}
