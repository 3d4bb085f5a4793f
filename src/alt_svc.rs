use http::HeaderMap;
use http::header::ALT_SVC;

use crate::error::Error;
use crate::response::HttpResponse;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AltService {
    pub protocol: String,
    pub authority: String,
    pub max_age: Option<u64>,
    pub persist: bool,
}

pub fn parse_alt_svc(headers: &HeaderMap) -> Vec<AltService> {
    headers
        .get_all(ALT_SVC)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(split_outside_quotes(','))
        .filter_map(|entry| parse_entry(&entry))
        .collect()
}

pub fn has_http2(response: Option<&HttpResponse>) -> Result<(bool, String), Error> {
    has_httpx(response, "h2")
}

pub fn has_http3(response: Option<&HttpResponse>) -> Result<(bool, String), Error> {
    has_httpx(response, "h3")
}

pub fn has_httpx(response: Option<&HttpResponse>, protocol: &str) -> Result<(bool, String), Error> {
    let response = response.ok_or(Error::MissingResponse)?;
    Ok(parse_alt_svc(response.headers())
        .into_iter()
        .find(|service| service.protocol.eq_ignore_ascii_case(protocol))
        .map_or((false, String::new()), |service| (true, service.authority)))
}

fn parse_entry(entry: &str) -> Option<AltService> {
    let mut parts = split_outside_quotes(';')(entry).into_iter();
    let head = parts.next()?;
    let (protocol, authority) = head.split_once('=')?;
    let protocol = protocol.trim();
    if protocol.is_empty() || protocol.eq_ignore_ascii_case("clear") {
        return None;
    }

    let mut service = AltService {
        protocol: protocol.to_owned(),
        authority: unquote(authority.trim())?.to_owned(),
        max_age: None,
        persist: false,
    };
    for parameter in parts {
        let Some((name, value)) = parameter.split_once('=') else {
            continue;
        };
        let value = unquote(value.trim()).unwrap_or_default();
        match name.trim().to_ascii_lowercase().as_str() {
            "ma" => service.max_age = value.parse().ok(),
            "persist" => service.persist = value == "1",
            _ => {}
        }
    }
    Some(service)
}

fn unquote(value: &str) -> Option<&str> {
    match value.strip_prefix('"') {
        Some(rest) => rest.strip_suffix('"'),
        None => Some(value),
    }
}

fn split_outside_quotes(separator: char) -> impl Fn(&str) -> Vec<String> {
    move |text| {
        let mut pieces = Vec::new();
        let mut current = String::new();
        let mut quoted = false;
        for ch in text.chars() {
            match ch {
                '"' => {
                    quoted = !quoted;
                    current.push(ch);
                }
                ch if ch == separator && !quoted => {
                    pieces.push(current.trim().to_owned());
                    current.clear();
                }
                _ => current.push(ch),
            }
        }
        if !current.trim().is_empty() {
            pieces.push(current.trim().to_owned());
        }
        pieces
    }
}

#[cfg(test)]
mod tests {
    use http::header::{ALT_SVC, HeaderValue};
    use http::{HeaderMap, StatusCode, Version};

    use super::{AltService, has_http2, has_http3, has_httpx, parse_alt_svc};
    use crate::error::Error;
    use crate::response::{HttpResponse, ResponseBody};

    fn response(values: &[&'static str]) -> HttpResponse {
        let mut headers = HeaderMap::new();
        for value in values {
            headers.append(ALT_SVC, HeaderValue::from_static(value));
        }
        HttpResponse::new(StatusCode::OK, Version::HTTP_11, headers, ResponseBody::empty())
    }

    #[test]
    fn finds_advertised_http3_endpoint() {
        let response = response(&[r#"h3="edge.example:443""#]);
        assert_eq!(
            has_http3(Some(&response)).expect("hint"),
            (true, "edge.example:443".to_owned())
        );
        assert_eq!(has_http2(Some(&response)).expect("hint"), (false, String::new()));
    }

    #[test]
    fn missing_header_is_not_supported() {
        let response = response(&[]);
        assert_eq!(has_http3(Some(&response)).expect("hint"), (false, String::new()));
    }

    #[test]
    fn missing_response_is_an_error() {
        assert!(matches!(has_http2(None), Err(Error::MissingResponse)));
    }

    #[test]
    fn parses_lists_parameters_and_multiple_headers() {
        let response = response(&[
            r#"h3-29=":443"; ma=3600, h3=":443"; ma=86400; persist=1"#,
            r#"h2="alt.example:8443""#,
        ]);
        let services = parse_alt_svc(response.headers());
        assert_eq!(services.len(), 3);
        assert_eq!(
            services[1],
            AltService {
                protocol: "h3".to_owned(),
                authority: ":443".to_owned(),
                max_age: Some(86400),
                persist: true,
            }
        );
        assert_eq!(
            has_httpx(Some(&response), "H2").expect("hint"),
            (true, "alt.example:8443".to_owned())
        );
    }

    #[test]
    fn clear_and_garbage_are_skipped() {
        let response = response(&["clear", r#"h3="unterminated"#, "nonsense"]);
        assert!(parse_alt_svc(response.headers()).is_empty());
    }
}
