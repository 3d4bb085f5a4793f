use std::collections::BTreeSet;

use crate::error::{Error, TransportErrorKind};
use crate::request::Request;
use crate::response::HttpResponse;

pub trait CheckRetry: Send + Sync {
    fn check_retry(
        &self,
        request: &Request,
        response: Option<&HttpResponse>,
        error: Option<&Error>,
    ) -> Result<bool, Error>;
}

impl<F> CheckRetry for F
where
    F: Fn(&Request, Option<&HttpResponse>, Option<&Error>) -> Result<bool, Error> + Send + Sync,
{
    fn check_retry(
        &self,
        request: &Request,
        response: Option<&HttpResponse>,
        error: Option<&Error>,
    ) -> Result<bool, Error> {
        self(request, response, error)
    }
}

#[derive(Clone, Debug)]
pub struct RetryPolicy {
    retryable_status_codes: BTreeSet<u16>,
    retryable_transport_error_kinds: BTreeSet<TransportErrorKind>,
    retry_on_timeout: bool,
}

impl RetryPolicy {
    pub fn standard() -> Self {
        Self {
            retryable_status_codes: default_retryable_status_codes(),
            retryable_transport_error_kinds: all_transport_error_kinds(),
            retry_on_timeout: true,
        }
    }

    pub fn host_spray() -> Self {
        Self {
            retryable_status_codes: BTreeSet::new(),
            retryable_transport_error_kinds: all_transport_error_kinds(),
            retry_on_timeout: true,
        }
    }

    pub fn retryable_status_codes(mut self, codes: impl IntoIterator<Item = u16>) -> Self {
        self.retryable_status_codes = codes.into_iter().collect();
        self
    }

    pub fn retryable_transport_error_kinds(
        mut self,
        kinds: impl IntoIterator<Item = TransportErrorKind>,
    ) -> Self {
        self.retryable_transport_error_kinds = kinds.into_iter().collect();
        self
    }

    pub fn retry_on_timeout(mut self, retry: bool) -> Self {
        self.retry_on_timeout = retry;
        self
    }

    fn is_retryable_status(&self, status: u16) -> bool {
        self.retryable_status_codes.contains(&status)
    }

    fn is_retryable_error(&self, error: &Error) -> bool {
        if error.is_permanent() {
            return false;
        }
        match error {
            Error::Transport { kind, .. } => self.retryable_transport_error_kinds.contains(kind),
            Error::Timeout { .. } => self.retry_on_timeout,
            Error::ReadBody { .. } => true,
            _ => false,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::standard()
    }
}

impl CheckRetry for RetryPolicy {
    fn check_retry(
        &self,
        request: &Request,
        response: Option<&HttpResponse>,
        error: Option<&Error>,
    ) -> Result<bool, Error> {
        let uri = request.redacted_url();
        if let Some(context_error) = request.context().error(request.method(), &uri) {
            return Err(context_error);
        }
        if let Some(error) = error {
            return Ok(self.is_retryable_error(error));
        }
        if let Some(response) = response {
            return Ok(self.is_retryable_status(response.status().as_u16()));
        }
        Ok(false)
    }
}

fn default_retryable_status_codes() -> BTreeSet<u16> {
    std::iter::once(429_u16)
        .chain((500_u16..=599).filter(|status| *status != 501))
        .collect()
}

fn all_transport_error_kinds() -> BTreeSet<TransportErrorKind> {
    [
        TransportErrorKind::Dns,
        TransportErrorKind::Connect,
        TransportErrorKind::Tls,
        TransportErrorKind::Read,
        TransportErrorKind::Protocol,
        TransportErrorKind::Other,
    ]
    .into_iter()
    .collect()
}
