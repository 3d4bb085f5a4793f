mod connector;
pub mod h1;
mod impersonate;
mod standard;
pub mod tls;
pub(crate) mod trace;

use std::fmt;

use futures_util::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::Error;
use crate::request::WireRequest;
use crate::response::HttpResponse;

pub use impersonate::{ImpersonateExecutor, chrome_headers};
pub use standard::{StandardExecutor, StandardExecutorBuilder};

pub trait Executor: Send + Sync {
    fn execute(&self, request: WireRequest) -> BoxFuture<'_, Result<HttpResponse, Error>>;

    fn close_idle_connections(&self) {}

    fn pool_settings(&self) -> PoolSettings {
        PoolSettings::default()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PoolSettings {
    pub keep_alive: bool,
    pub max_idle_per_host: i64,
}

impl PoolSettings {
    pub fn never_reuses(&self) -> bool {
        !self.keep_alive || self.max_idle_per_host < 0
    }
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            keep_alive: true,
            max_idle_per_host: 0,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Tier {
    Standard,
    Impersonate,
    Http2,
    Http3,
}

impl Tier {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Standard => "standard",
            Self::Impersonate => "impersonate",
            Self::Http2 => "http2",
            Self::Http3 => "http3",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

pub trait AsyncIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> AsyncIo for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

pub type BoxedIo = Box<dyn AsyncIo>;

#[cfg(test)]
mod tests {
    use super::{PoolSettings, Tier};

    #[test]
    fn pool_settings_report_reuse() {
        assert!(!PoolSettings::default().never_reuses());
        assert!(
            PoolSettings {
                keep_alive: false,
                max_idle_per_host: 100,
            }
            .never_reuses()
        );
        assert!(
            PoolSettings {
                keep_alive: true,
                max_idle_per_host: -1,
            }
            .never_reuses()
        );
    }

    #[test]
    fn tiers_have_stable_names() {
        assert_eq!(Tier::Http2.to_string(), "http2");
        assert_eq!(Tier::Impersonate.as_str(), "impersonate");
    }
}
