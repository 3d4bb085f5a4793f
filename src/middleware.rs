use http::header::{HeaderName, HeaderValue};

use crate::error::{BoxError, Error};
use crate::request::Request;
use crate::util::{parse_header_name, parse_header_value};

/// Runs before every send of a request: each retry attempt and each
/// redirect or digest resend within it.
pub trait RequestMiddleware: Send + Sync {
    fn on_before_request(&self, request: &mut Request) -> Result<(), BoxError>;
}

impl<F> RequestMiddleware for F
where
    F: Fn(&mut Request) -> Result<(), BoxError> + Send + Sync,
{
    fn on_before_request(&self, request: &mut Request) -> Result<(), BoxError> {
        self(request)
    }
}

#[derive(Clone, Debug, Default)]
pub struct AddHeaders {
    headers: Vec<(HeaderName, HeaderValue)>,
}

impl AddHeaders {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn from_static(pairs: &'static [(&'static str, &'static str)]) -> Self {
        let headers = pairs
            .iter()
            .map(|(name, value)| {
                (
                    HeaderName::from_static(name),
                    HeaderValue::from_static(value),
                )
            })
            .collect();
        Self { headers }
    }

    pub fn header(mut self, name: &str, value: &str) -> Result<Self, Error> {
        self.headers
            .push((parse_header_name(name)?, parse_header_value(name, value)?));
        Ok(self)
    }

    pub fn from_pairs<'a>(
        pairs: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) -> Result<Self, Error> {
        pairs
            .into_iter()
            .try_fold(Self::new(), |headers, (name, value)| headers.header(name, value))
    }
}

impl RequestMiddleware for AddHeaders {
    fn on_before_request(&self, request: &mut Request) -> Result<(), BoxError> {
        let headers = request.headers_mut();
        for (name, value) in &self.headers {
            if !headers.contains_key(name) {
                headers.insert(name.clone(), value.clone());
            }
        }
        Ok(())
    }
}
