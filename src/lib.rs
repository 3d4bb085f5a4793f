//! `retryhttp` is a retrying HTTP client for scanners: tolerant of flaky
//! targets, misbehaving servers and picky TLS stacks, with explicit control
//! over connection reuse.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::time::Duration;
//! use http::Method;
//! use retryhttp::prelude::{Client, Options, Request, RetryPolicy};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = Client::with_options(Options::spraying())
//!         .retry_max(3)
//!         .retry_wait(Duration::from_millis(200), Duration::from_secs(2))
//!         .check_retry(RetryPolicy::host_spray())
//!         .try_build()?;
//!
//!     let mut request = Request::new(Method::GET, "scanme.sh/robots.txt")?
//!         .with_timeout(Duration::from_secs(20));
//!     let response = client.execute(&mut request).await?;
//!
//!     println!(
//!         "status={} retries={}",
//!         response.status(),
//!         request.metrics().retries
//!     );
//!     Ok(())
//! }
//! ```
//!
//! # Choosing Options
//!
//! - `Options::spraying()` for many hosts: connections are closed after use.
//! - `Options::single()` for many requests to one host over kept-alive
//!   connections.
//! - Set `DISABLE_TLS_FALLBACK=true` to turn off the compatibility TLS
//!   redial process-wide.

pub mod alt_svc;
mod auth;
pub mod backoff;
pub mod body;
mod client;
pub mod drain;
mod error;
mod metrics;
pub mod middleware;
mod request;
mod response;
pub mod retry;
pub mod transport;
mod util;

pub use crate::alt_svc::{AltService, has_http2, has_http3, has_httpx};
pub use crate::backoff::{
    Backoff, ExponentialBackoff, ExponentialJitterBackoff, FullJitterBackoff, LinearJitterBackoff,
};
pub use crate::body::{BodySource, ReusableBody};
pub use crate::client::{
    Client, ClientBuilder, ErrorHandler, Options, RequestLogHook, ResponseLogHook, TimeoutAdjust,
    pass_through_error_handler,
};
pub use crate::error::{BoxError, Error, ErrorCode, TransportErrorKind};
pub use crate::metrics::ClientMetricsSnapshot;
pub use crate::middleware::{AddHeaders, RequestMiddleware};
pub use crate::request::{Auth, AuthKind, Metrics, Request, RequestContext, WireRequest};
pub use crate::response::{HttpResponse, ResponseBody};
pub use crate::retry::{CheckRetry, RetryPolicy};
pub use crate::transport::{Executor, PoolSettings, Tier};

pub type Result<T> = std::result::Result<T, Error>;

pub mod prelude {
    pub use crate::{
        Auth, Backoff, CheckRetry, Client, ClientBuilder, ClientMetricsSnapshot, Error, ErrorCode,
        ExponentialBackoff, HttpResponse, Metrics, Options, Request, RetryPolicy, Tier,
        TransportErrorKind,
    };
}
