use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use http::header::{
    AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE, COOKIE, HeaderName, HeaderValue, LOCATION,
    RETRY_AFTER,
};
use http::{HeaderMap, Method, StatusCode, Uri};

use crate::error::{Error, TransportErrorKind};

const MAX_ERROR_BODY_LEN: usize = 2048;

pub(crate) fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

pub(crate) fn parse_request_uri(text: &str) -> Result<Uri, Error> {
    let invalid = || Error::InvalidUri {
        uri: text.to_owned(),
    };
    let trimmed = text.trim();
    if trimmed.is_empty() || trimmed.starts_with("://") {
        return Err(invalid());
    }
    if trimmed.starts_with('/') {
        return trimmed.parse::<Uri>().map_err(|_| invalid());
    }

    let with_scheme = if trimmed.contains("://") {
        trimmed.to_owned()
    } else {
        let authority_end = trimmed.find(['/', '?', '#']).unwrap_or(trimmed.len());
        let authority = &trimmed[..authority_end];
        let scheme = if authority.ends_with(":80") {
            "http"
        } else {
            "https"
        };
        format!("{scheme}://{trimmed}")
    };

    let uri = with_scheme.parse::<Uri>().map_err(|_| invalid())?;
    match uri.scheme_str() {
        Some(scheme)
            if scheme.eq_ignore_ascii_case("http") || scheme.eq_ignore_ascii_case("https") => {}
        Some(scheme) => {
            return Err(Error::UnsupportedScheme {
                scheme: scheme.to_owned(),
                uri: text.to_owned(),
            });
        }
        None => return Err(invalid()),
    }
    if uri.host().is_none_or(str::is_empty) {
        return Err(invalid());
    }
    Ok(uri)
}

pub(crate) fn redact_uri_for_logs(uri: &Uri) -> String {
    let Ok(mut parsed) = url::Url::parse(&uri.to_string()) else {
        let text = uri.to_string();
        return text.split('?').next().unwrap_or(&text).to_owned();
    };

    let _ = parsed.set_username("");
    let _ = parsed.set_password(None);
    parsed.set_query(None);
    parsed.set_fragment(None);
    parsed.to_string()
}

pub(crate) fn parse_header_name(name: &str) -> Result<HeaderName, Error> {
    name.parse().map_err(|source| Error::InvalidHeaderName {
        name: name.to_owned(),
        source,
    })
}

pub(crate) fn parse_header_value(name: &str, value: &str) -> Result<HeaderValue, Error> {
    value.parse().map_err(|source| Error::InvalidHeaderValue {
        name: name.to_owned(),
        source,
    })
}

pub(crate) fn parse_retry_after(headers: &HeaderMap, now: SystemTime) -> Option<Duration> {
    let value = headers.get(RETRY_AFTER)?;
    let raw_value = value.to_str().ok()?.trim();
    if let Ok(seconds) = raw_value.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }

    let date = httpdate::parse_http_date(raw_value).ok()?;
    match date.duration_since(now) {
        Ok(duration) => Some(duration),
        Err(_) => Some(Duration::ZERO),
    }
}

pub(crate) fn default_port(uri: &Uri) -> Option<u16> {
    uri.port_u16().or_else(|| match uri.scheme_str() {
        Some("https") => Some(443),
        Some("http") => Some(80),
        _ => None,
    })
}

pub(crate) fn is_redirect_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::MOVED_PERMANENTLY
            | StatusCode::FOUND
            | StatusCode::SEE_OTHER
            | StatusCode::TEMPORARY_REDIRECT
            | StatusCode::PERMANENT_REDIRECT
    )
}

pub(crate) fn redirect_method(method: &Method, status: StatusCode) -> Method {
    match status {
        StatusCode::SEE_OTHER if *method != Method::HEAD => Method::GET,
        StatusCode::MOVED_PERMANENTLY | StatusCode::FOUND if *method == Method::POST => Method::GET,
        _ => method.clone(),
    }
}

pub(crate) fn redirect_location(headers: &HeaderMap) -> Option<String> {
    headers
        .get(LOCATION)
        .and_then(|value| value.to_str().ok())
        .map(ToOwned::to_owned)
}

pub(crate) fn same_origin(left: &Uri, right: &Uri) -> bool {
    let left_scheme = left.scheme_str().unwrap_or_default();
    let right_scheme = right.scheme_str().unwrap_or_default();
    if !left_scheme.eq_ignore_ascii_case(right_scheme) {
        return false;
    }

    let left_host = left.host().unwrap_or_default();
    let right_host = right.host().unwrap_or_default();
    if !left_host.eq_ignore_ascii_case(right_host) {
        return false;
    }

    default_port(left) == default_port(right)
}

pub(crate) fn resolve_redirect_uri(current_uri: &Uri, location: &str) -> Option<Uri> {
    let base = url::Url::parse(&current_uri.to_string()).ok()?;
    let joined = base.join(location).ok()?;
    joined.as_str().parse().ok()
}

pub(crate) fn sanitize_headers_for_redirect(
    headers: &mut HeaderMap,
    method_changed_to_get: bool,
    same_origin_redirect: bool,
) {
    if method_changed_to_get {
        headers.remove(CONTENT_LENGTH);
        headers.remove(CONTENT_TYPE);
    }
    if !same_origin_redirect {
        headers.remove(AUTHORIZATION);
        headers.remove(COOKIE);
    }
}

pub(crate) fn truncate_body(body: &[u8]) -> String {
    let text = String::from_utf8_lossy(body);
    if text.chars().count() <= MAX_ERROR_BODY_LEN {
        return text.into_owned();
    }

    let truncated: String = text.chars().take(MAX_ERROR_BODY_LEN).collect();
    format!("{truncated}...(truncated)")
}

pub(crate) fn classify_io_error(error: &std::io::Error) -> TransportErrorKind {
    use std::io::ErrorKind;

    match error.kind() {
        ErrorKind::ConnectionRefused | ErrorKind::AddrNotAvailable | ErrorKind::NotConnected => {
            TransportErrorKind::Connect
        }
        ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::BrokenPipe
        | ErrorKind::UnexpectedEof => TransportErrorKind::Read,
        ErrorKind::InvalidData => TransportErrorKind::Protocol,
        _ => classify_error_text(&error.to_string()),
    }
}

pub(crate) fn classify_transport_error(
    error: &(dyn std::error::Error + 'static),
) -> TransportErrorKind {
    let mut is_connect = false;
    let mut current: Option<&(dyn std::error::Error + 'static)> = Some(error);
    while let Some(layer) = current {
        if let Some(legacy) = layer.downcast_ref::<hyper_util::client::legacy::Error>()
            && legacy.is_connect()
        {
            is_connect = true;
        }
        if let Some(hyper_error) = layer.downcast_ref::<hyper::Error>() {
            if hyper_error.is_parse() || hyper_error.is_parse_status() {
                return TransportErrorKind::Protocol;
            }
            if hyper_error.is_incomplete_message() {
                return TransportErrorKind::Read;
            }
        }
        if let Some(io_error) = layer.downcast_ref::<std::io::Error>() {
            if let Some(inner) = io_error.get_ref() {
                if inner.is::<rustls::Error>() {
                    return TransportErrorKind::Tls;
                }
                if io_error.kind() == std::io::ErrorKind::Other {
                    current = Some(inner as &(dyn std::error::Error + 'static));
                    continue;
                }
            }
            let kind = classify_io_error(io_error);
            if kind != TransportErrorKind::Other {
                return if is_connect && kind == TransportErrorKind::Read {
                    TransportErrorKind::Connect
                } else {
                    kind
                };
            }
        }
        if layer.downcast_ref::<rustls::Error>().is_some() {
            return TransportErrorKind::Tls;
        }
        current = layer.source();
    }

    let kind = classify_error_text(&error.to_string());
    if kind == TransportErrorKind::Other && is_connect {
        return TransportErrorKind::Connect;
    }
    kind
}

fn classify_error_text(text: &str) -> TransportErrorKind {
    let text = text.to_ascii_lowercase();
    if text.contains("dns")
        || text.contains("name or service not known")
        || text.contains("failed to lookup address")
    {
        return TransportErrorKind::Dns;
    }
    if text.contains("tls") || text.contains("certificate") || text.contains("handshake") {
        return TransportErrorKind::Tls;
    }
    if text.contains("connection reset")
        || text.contains("broken pipe")
        || text.contains("unexpected eof")
        || text.contains("connection closed")
    {
        return TransportErrorKind::Read;
    }
    TransportErrorKind::Other
}
