use http::Method;
use thiserror::Error;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TransportErrorKind {
    Dns,
    Connect,
    Tls,
    Read,
    Protocol,
    Other,
}

impl std::fmt::Display for TransportErrorKind {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::Dns => "dns",
            Self::Connect => "connect",
            Self::Tls => "tls",
            Self::Read => "read",
            Self::Protocol => "protocol",
            Self::Other => "other",
        };
        formatter.write_str(text)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorCode {
    InvalidUri,
    BodySource,
    RequestBuild,
    InvalidHeaderName,
    InvalidHeaderValue,
    Transport,
    Timeout,
    Cancelled,
    DeadlineExceeded,
    Middleware,
    UnsupportedScheme,
    UnsupportedProtocol,
    ExecutorUnavailable,
    TlsConfig,
    ReadBody,
    ResponseBodyTooLarge,
    Deserialize,
    MissingResponse,
    MissingRedirectLocation,
    InvalidRedirectLocation,
    RedirectLimitExceeded,
    RetriesExhausted,
}

impl ErrorCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InvalidUri => "invalid_uri",
            Self::BodySource => "body_source",
            Self::RequestBuild => "request_build",
            Self::InvalidHeaderName => "invalid_header_name",
            Self::InvalidHeaderValue => "invalid_header_value",
            Self::Transport => "transport",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
            Self::DeadlineExceeded => "deadline_exceeded",
            Self::Middleware => "middleware",
            Self::UnsupportedScheme => "unsupported_scheme",
            Self::UnsupportedProtocol => "unsupported_protocol",
            Self::ExecutorUnavailable => "executor_unavailable",
            Self::TlsConfig => "tls_config",
            Self::ReadBody => "read_body",
            Self::ResponseBodyTooLarge => "response_body_too_large",
            Self::Deserialize => "deserialize",
            Self::MissingResponse => "missing_response",
            Self::MissingRedirectLocation => "missing_redirect_location",
            Self::InvalidRedirectLocation => "invalid_redirect_location",
            Self::RedirectLimitExceeded => "redirect_limit_exceeded",
            Self::RetriesExhausted => "retries_exhausted",
        }
    }
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("invalid request uri: {uri}")]
    InvalidUri { uri: String },
    #[error("failed to prepare reusable request body: {source}")]
    BodySource {
        #[source]
        source: std::io::Error,
    },
    #[error("failed to build http request: {source}")]
    RequestBuild {
        #[source]
        source: http::Error,
    },
    #[error("invalid header name {name}: {source}")]
    InvalidHeaderName {
        name: String,
        #[source]
        source: http::header::InvalidHeaderName,
    },
    #[error("invalid header value for {name}: {source}")]
    InvalidHeaderValue {
        name: String,
        #[source]
        source: http::header::InvalidHeaderValue,
    },
    #[error("http transport error ({kind}) for {method} {uri}: {source}")]
    Transport {
        kind: TransportErrorKind,
        method: Method,
        uri: String,
        #[source]
        source: BoxError,
    },
    #[error("http request timed out after {timeout_ms}ms for {method} {uri}")]
    Timeout {
        timeout_ms: u128,
        method: Method,
        uri: String,
    },
    #[error("http request cancelled for {method} {uri}")]
    Cancelled { method: Method, uri: String },
    #[error("http request deadline exceeded for {method} {uri}")]
    DeadlineExceeded { method: Method, uri: String },
    #[error("request middleware failed: {source}")]
    Middleware {
        #[source]
        source: BoxError,
    },
    #[error("unsupported url scheme {scheme} for {uri}")]
    UnsupportedScheme { scheme: String, uri: String },
    #[error("unsupported negotiated protocol {protocol:?} for {uri}")]
    UnsupportedProtocol { protocol: String, uri: String },
    #[error("no executor configured for tier {tier}")]
    ExecutorUnavailable { tier: &'static str },
    #[error("invalid tls configuration: {message}")]
    TlsConfig { message: String },
    #[error("failed to read response body: {source}")]
    ReadBody {
        #[source]
        source: BoxError,
    },
    #[error("response body too large ({actual_bytes} bytes > {limit_bytes} bytes)")]
    ResponseBodyTooLarge {
        limit_bytes: usize,
        actual_bytes: usize,
    },
    #[error("failed to decode response json: {source}; body={body}")]
    Deserialize {
        #[source]
        source: serde_json::Error,
        body: String,
    },
    #[error("no response to inspect")]
    MissingResponse,
    #[error("redirect response {status} missing location header for {method} {uri}")]
    MissingRedirectLocation {
        status: u16,
        method: Method,
        uri: String,
    },
    #[error("invalid redirect location {location} for {method} {uri}")]
    InvalidRedirectLocation {
        location: String,
        method: Method,
        uri: String,
    },
    #[error("stopped after {max_redirects} redirects for {method} {uri}")]
    RedirectLimitExceeded {
        max_redirects: usize,
        method: Method,
        uri: String,
    },
    #[error(
        "{method} {uri} giving up after {attempts} attempts{}",
        describe_last_outcome(.status, .source)
    )]
    RetriesExhausted {
        method: Method,
        uri: String,
        attempts: usize,
        status: Option<u16>,
        #[source]
        source: Option<Box<Error>>,
    },
}

fn describe_last_outcome(status: &Option<u16>, source: &Option<Box<Error>>) -> String {
    match (source, status) {
        (Some(source), _) => format!(": {source}"),
        (None, Some(status)) => format!(": last status {status}"),
        (None, None) => String::new(),
    }
}

impl Error {
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidUri { .. } => ErrorCode::InvalidUri,
            Self::BodySource { .. } => ErrorCode::BodySource,
            Self::RequestBuild { .. } => ErrorCode::RequestBuild,
            Self::InvalidHeaderName { .. } => ErrorCode::InvalidHeaderName,
            Self::InvalidHeaderValue { .. } => ErrorCode::InvalidHeaderValue,
            Self::Transport { .. } => ErrorCode::Transport,
            Self::Timeout { .. } => ErrorCode::Timeout,
            Self::Cancelled { .. } => ErrorCode::Cancelled,
            Self::DeadlineExceeded { .. } => ErrorCode::DeadlineExceeded,
            Self::Middleware { .. } => ErrorCode::Middleware,
            Self::UnsupportedScheme { .. } => ErrorCode::UnsupportedScheme,
            Self::UnsupportedProtocol { .. } => ErrorCode::UnsupportedProtocol,
            Self::ExecutorUnavailable { .. } => ErrorCode::ExecutorUnavailable,
            Self::TlsConfig { .. } => ErrorCode::TlsConfig,
            Self::ReadBody { .. } => ErrorCode::ReadBody,
            Self::ResponseBodyTooLarge { .. } => ErrorCode::ResponseBodyTooLarge,
            Self::Deserialize { .. } => ErrorCode::Deserialize,
            Self::MissingResponse => ErrorCode::MissingResponse,
            Self::MissingRedirectLocation { .. } => ErrorCode::MissingRedirectLocation,
            Self::InvalidRedirectLocation { .. } => ErrorCode::InvalidRedirectLocation,
            Self::RedirectLimitExceeded { .. } => ErrorCode::RedirectLimitExceeded,
            Self::RetriesExhausted { .. } => ErrorCode::RetriesExhausted,
        }
    }

    pub const fn transport_kind(&self) -> Option<TransportErrorKind> {
        match self {
            Self::Transport { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    pub const fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled { .. } | Self::DeadlineExceeded { .. })
    }

    pub const fn is_permanent(&self) -> bool {
        matches!(
            self,
            Self::InvalidUri { .. }
                | Self::BodySource { .. }
                | Self::RequestBuild { .. }
                | Self::InvalidHeaderName { .. }
                | Self::InvalidHeaderValue { .. }
                | Self::Cancelled { .. }
                | Self::DeadlineExceeded { .. }
                | Self::Middleware { .. }
                | Self::UnsupportedScheme { .. }
                | Self::UnsupportedProtocol { .. }
                | Self::ExecutorUnavailable { .. }
                | Self::TlsConfig { .. }
                | Self::MissingRedirectLocation { .. }
                | Self::InvalidRedirectLocation { .. }
                | Self::RedirectLimitExceeded { .. }
                | Self::RetriesExhausted { .. }
        )
    }

    pub fn is_malformed_http_version(&self) -> bool {
        let Self::Transport { kind, source, .. } = self else {
            return false;
        };
        if *kind != TransportErrorKind::Protocol {
            return false;
        }
        let mut current: Option<&(dyn std::error::Error + 'static)> = Some(source.as_ref());
        while let Some(error) = current {
            if let Some(hyper_error) = error.downcast_ref::<hyper::Error>()
                && hyper_error.is_parse()
            {
                return true;
            }
            let text = error.to_string().to_ascii_lowercase();
            if text.contains("invalid http version")
                || text.contains("malformed http version")
                || text.contains("malformed http response")
            {
                return true;
            }
            current = error.source();
        }
        false
    }
}

pub(crate) fn transport_error(
    kind: TransportErrorKind,
    method: &Method,
    uri: &str,
    source: impl Into<BoxError>,
) -> Error {
    Error::Transport {
        kind,
        method: method.clone(),
        uri: uri.to_owned(),
        source: source.into(),
    }
}

#[cfg(test)]
mod tests {
    use http::Method;

    use super::{Error, ErrorCode, TransportErrorKind, transport_error};

    #[test]
    fn retries_exhausted_message_names_attempts_and_last_cause() {
        let error = Error::RetriesExhausted {
            method: Method::GET,
            uri: "http://scanme.sh/".to_owned(),
            attempts: 6,
            status: None,
            source: Some(Box::new(transport_error(
                TransportErrorKind::Read,
                &Method::GET,
                "http://scanme.sh/",
                "connection reset by peer",
            ))),
        };
        let text = error.to_string();
        assert!(text.contains("giving up after 6 attempts"), "{text}");
        assert!(text.contains("connection reset by peer"), "{text}");
        assert_eq!(error.code(), ErrorCode::RetriesExhausted);
    }

    #[test]
    fn retries_exhausted_without_error_reports_status() {
        let error = Error::RetriesExhausted {
            method: Method::POST,
            uri: "http://scanme.sh/".to_owned(),
            attempts: 2,
            status: Some(503),
            source: None,
        };
        assert!(error.to_string().ends_with("last status 503"));
    }

    #[test]
    fn protocol_errors_with_version_text_are_malformed_versions() {
        let error = transport_error(
            TransportErrorKind::Protocol,
            &Method::GET,
            "http://127.0.0.1/",
            "malformed HTTP version \"HTTP/2\"",
        );
        assert!(error.is_malformed_http_version());

        let read = transport_error(
            TransportErrorKind::Read,
            &Method::GET,
            "http://127.0.0.1/",
            "malformed HTTP version",
        );
        assert!(!read.is_malformed_http_version());
    }

    #[test]
    fn cancellation_is_permanent() {
        let error = Error::Cancelled {
            method: Method::GET,
            uri: "http://127.0.0.1/".to_owned(),
        };
        assert!(error.is_cancellation());
        assert!(error.is_permanent());
        assert_eq!(error.code().as_str(), "cancelled");
    }
}
