use std::io;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures_util::stream;
use http::header::{CONTENT_LENGTH, HOST, HeaderName, HeaderValue, TRANSFER_ENCODING};
use http::{HeaderMap, Method, StatusCode, Version};
use http_body::Frame;
use http_body_util::{BodyExt, StreamBody};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::trace::ConnectionTrace;
use crate::error::{Error, TransportErrorKind, transport_error};
use crate::request::WireRequest;
use crate::response::{HttpResponse, ResponseBody};
use crate::util::{classify_io_error, redact_uri_for_logs};

const MAX_HEAD_BYTES: usize = 64 * 1024;
const MAX_HEADERS: usize = 128;
const READ_CHUNK: usize = 8 * 1024;

pub async fn send_request<S>(mut stream: S, request: WireRequest) -> Result<HttpResponse, Error>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let method = request.method().clone();
    let uri = redact_uri_for_logs(request.uri());
    let io_error =
        |error: io::Error| transport_error(classify_io_error(&error), &method, &uri, error);

    let head = encode_request(request).await;
    let written = match stream.write_all(&head).await {
        Ok(()) => stream.flush().await,
        Err(error) => Err(error),
    };
    if let Some(trace) = ConnectionTrace::current() {
        trace.wrote_request(written.as_ref().map(|_| ()));
    }
    written.map_err(io_error)?;

    let mut buffer = BytesMut::with_capacity(READ_CHUNK);
    let parsed = loop {
        match parse_head(&buffer) {
            Ok(Some(head)) => {
                buffer.advance(head.length);
                if head.status.is_informational() && head.status != StatusCode::SWITCHING_PROTOCOLS
                {
                    continue;
                }
                break head;
            }
            Ok(None) => {}
            Err(message) => {
                return Err(transport_error(
                    TransportErrorKind::Protocol,
                    &method,
                    &uri,
                    message,
                ));
            }
        }
        if buffer.len() > MAX_HEAD_BYTES {
            return Err(transport_error(
                TransportErrorKind::Protocol,
                &method,
                &uri,
                format!("response head exceeds {MAX_HEAD_BYTES} bytes"),
            ));
        }
        let read = stream.read_buf(&mut buffer).await.map_err(io_error)?;
        if read == 0 {
            return Err(transport_error(
                TransportErrorKind::Read,
                &method,
                &uri,
                io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed before response head",
                ),
            ));
        }
    };

    let framing = body_framing(&method, parsed.status, &parsed.headers).map_err(|message| {
        transport_error(TransportErrorKind::Protocol, &method, &uri, message)
    })?;
    let reader = BodyReader {
        stream,
        buffer,
        framing,
    };
    let frames = stream::unfold(Some(reader), |state| async move {
        let mut reader = state?;
        match reader.next_chunk().await {
            Ok(Some(chunk)) => Some((Ok(Frame::data(chunk)), Some(reader))),
            Ok(None) => None,
            Err(error) => Some((Err(error), None)),
        }
    });

    Ok(HttpResponse::new(
        parsed.status,
        Version::HTTP_11,
        parsed.headers,
        ResponseBody::new(StreamBody::new(frames)),
    ))
}

async fn encode_request(request: WireRequest) -> Bytes {
    let (parts, body) = request.into_parts();
    let body = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(never) => match never {},
    };

    let target = parts
        .uri
        .path_and_query()
        .map_or("/", |path_and_query| path_and_query.as_str());
    let mut out = BytesMut::with_capacity(256 + body.len());
    out.put_slice(parts.method.as_str().as_bytes());
    out.put_u8(b' ');
    out.put_slice(target.as_bytes());
    out.put_slice(b" HTTP/1.1\r\n");

    if !parts.headers.contains_key(HOST)
        && let Some(host) = parts.uri.host()
    {
        out.put_slice(b"Host: ");
        out.put_slice(host.as_bytes());
        if let Some(port) = parts.uri.port_u16() {
            out.put_slice(format!(":{port}").as_bytes());
        }
        out.put_slice(b"\r\n");
    }
    for (name, value) in &parts.headers {
        out.put_slice(name.as_str().as_bytes());
        out.put_slice(b": ");
        out.put_slice(value.as_bytes());
        out.put_slice(b"\r\n");
    }
    let needs_length = !body.is_empty()
        || matches!(parts.method, Method::POST | Method::PUT | Method::PATCH);
    if needs_length
        && !parts.headers.contains_key(CONTENT_LENGTH)
        && !parts.headers.contains_key(TRANSFER_ENCODING)
    {
        out.put_slice(format!("Content-Length: {}\r\n", body.len()).as_bytes());
    }
    out.put_slice(b"\r\n");
    out.put_slice(&body);
    out.freeze()
}

struct ResponseHead {
    status: StatusCode,
    headers: HeaderMap,
    length: usize,
}

fn parse_head(buffer: &[u8]) -> Result<Option<ResponseHead>, String> {
    let mut slots = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut response = httparse::Response::new(&mut slots);
    let length = match response.parse(buffer) {
        Ok(httparse::Status::Complete(length)) => length,
        Ok(httparse::Status::Partial) => return Ok(None),
        Err(error) => return Err(format!("malformed HTTP response: {error}")),
    };
    let code = response.code.ok_or("malformed HTTP response: missing status")?;
    let status = StatusCode::from_u16(code)
        .map_err(|error| format!("malformed HTTP response: {error}"))?;

    let mut headers = HeaderMap::with_capacity(response.headers.len());
    for header in response.headers.iter() {
        let name = HeaderName::from_bytes(header.name.as_bytes())
            .map_err(|error| format!("invalid response header name: {error}"))?;
        let value = HeaderValue::from_bytes(header.value)
            .map_err(|error| format!("invalid response header value: {error}"))?;
        headers.append(name, value);
    }
    Ok(Some(ResponseHead {
        status,
        headers,
        length,
    }))
}

#[derive(Debug, PartialEq, Eq)]
enum Framing {
    Length(u64),
    Chunked(ChunkState),
    UntilEof,
}

#[derive(Debug, PartialEq, Eq)]
enum ChunkState {
    Size,
    Data(u64),
    DataEnd,
    Trailers,
    Done,
}

fn body_framing(
    method: &Method,
    status: StatusCode,
    headers: &HeaderMap,
) -> Result<Framing, String> {
    if *method == Method::HEAD
        || status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED
    {
        return Ok(Framing::Length(0));
    }
    let chunked = headers
        .get_all(TRANSFER_ENCODING)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .last()
        .is_some_and(|coding| coding.trim().eq_ignore_ascii_case("chunked"));
    if chunked {
        return Ok(Framing::Chunked(ChunkState::Size));
    }
    if let Some(value) = headers.get(CONTENT_LENGTH) {
        let length = value
            .to_str()
            .ok()
            .and_then(|text| text.trim().parse::<u64>().ok())
            .ok_or_else(|| format!("invalid content-length {value:?}"))?;
        return Ok(Framing::Length(length));
    }
    Ok(Framing::UntilEof)
}

struct BodyReader<S> {
    stream: S,
    buffer: BytesMut,
    framing: Framing,
}

impl<S> BodyReader<S>
where
    S: AsyncRead + Unpin,
{
    async fn fill(&mut self) -> io::Result<usize> {
        self.buffer.reserve(READ_CHUNK);
        self.stream.read_buf(&mut self.buffer).await
    }

    async fn fill_or_eof(&mut self, context: &'static str) -> io::Result<()> {
        if self.fill().await? == 0 {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, context));
        }
        Ok(())
    }

    async fn take_line(&mut self) -> io::Result<Bytes> {
        loop {
            if let Some(end) = self.buffer.windows(2).position(|window| window == b"\r\n") {
                let line = self.buffer.split_to(end).freeze();
                self.buffer.advance(2);
                return Ok(line);
            }
            if self.buffer.len() > MAX_HEAD_BYTES {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "chunk line too long",
                ));
            }
            self.fill_or_eof("connection closed inside chunked body").await?;
        }
    }

    async fn next_chunk(&mut self) -> io::Result<Option<Bytes>> {
        loop {
            match &mut self.framing {
                Framing::Length(0) => return Ok(None),
                Framing::Length(remaining) => {
                    let remaining = *remaining;
                    if self.buffer.is_empty() {
                        self.fill_or_eof("connection closed before end of body")
                            .await?;
                    }
                    let take = usize::try_from(remaining)
                        .unwrap_or(usize::MAX)
                        .min(self.buffer.len());
                    self.framing = Framing::Length(remaining - take as u64);
                    return Ok(Some(self.buffer.split_to(take).freeze()));
                }
                Framing::UntilEof => {
                    if self.buffer.is_empty() && self.fill().await? == 0 {
                        return Ok(None);
                    }
                    return Ok(Some(self.buffer.split().freeze()));
                }
                Framing::Chunked(ChunkState::Size) => {
                    let line = self.take_line().await?;
                    let size = parse_chunk_size(&line)?;
                    self.framing = Framing::Chunked(if size == 0 {
                        ChunkState::Trailers
                    } else {
                        ChunkState::Data(size)
                    });
                }
                Framing::Chunked(ChunkState::Data(remaining)) => {
                    let remaining = *remaining;
                    if self.buffer.is_empty() {
                        self.fill_or_eof("connection closed inside chunked body")
                            .await?;
                    }
                    let take = usize::try_from(remaining)
                        .unwrap_or(usize::MAX)
                        .min(self.buffer.len());
                    let left = remaining - take as u64;
                    self.framing = Framing::Chunked(if left == 0 {
                        ChunkState::DataEnd
                    } else {
                        ChunkState::Data(left)
                    });
                    return Ok(Some(self.buffer.split_to(take).freeze()));
                }
                Framing::Chunked(ChunkState::DataEnd) => {
                    let line = self.take_line().await?;
                    if !line.is_empty() {
                        return Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            "missing CRLF after chunk data",
                        ));
                    }
                    self.framing = Framing::Chunked(ChunkState::Size);
                }
                Framing::Chunked(ChunkState::Trailers) => {
                    if self.take_line().await?.is_empty() {
                        self.framing = Framing::Chunked(ChunkState::Done);
                    }
                }
                Framing::Chunked(ChunkState::Done) => return Ok(None),
            }
        }
    }
}

fn parse_chunk_size(line: &[u8]) -> io::Result<u64> {
    let invalid = || io::Error::new(io::ErrorKind::InvalidData, "invalid chunk size line");
    let text = std::str::from_utf8(line).map_err(|_| invalid())?;
    let digits = text.split(';').next().unwrap_or_default().trim();
    u64::from_str_radix(digits, 16).map_err(|_| invalid())
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use http::{Method, StatusCode};
    use http_body_util::Full;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, duplex};

    use super::send_request;
    use crate::error::{Error, TransportErrorKind};

    fn request(method: Method, body: &'static str) -> http::Request<Full<Bytes>> {
        http::Request::builder()
            .method(method)
            .uri("https://scanme.sh:8443/path?q=1")
            .header("user-agent", "scanner")
            .body(Full::new(Bytes::from_static(body.as_bytes())))
            .expect("request")
    }

    async fn serve(
        response: &'static [u8],
    ) -> (tokio::io::DuplexStream, tokio::task::JoinHandle<String>) {
        let (client, mut server) = duplex(64 * 1024);
        let handle = tokio::spawn(async move {
            let mut received = Vec::new();
            let mut chunk = [0_u8; 1024];
            while !received.windows(4).any(|window| window == b"\r\n\r\n") {
                let read = server.read(&mut chunk).await.expect("read request");
                if read == 0 {
                    break;
                }
                received.extend_from_slice(&chunk[..read]);
            }
            server.write_all(response).await.expect("write response");
            server.shutdown().await.expect("shutdown");
            String::from_utf8(received).expect("utf8 request")
        });
        (client, handle)
    }

    #[tokio::test]
    async fn writes_raw_target_host_and_length() {
        let (client, server) = serve(b"HTTP/1.1 204 No Content\r\n\r\n").await;
        let response = send_request(client, request(Method::POST, "a=1"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let raw = server.await.expect("server");
        assert!(raw.starts_with("POST /path?q=1 HTTP/1.1\r\n"), "{raw}");
        assert!(raw.contains("Host: scanme.sh:8443\r\n"), "{raw}");
        assert!(raw.contains("Content-Length: 3\r\n"), "{raw}");
        assert!(raw.ends_with("\r\n\r\na=1") || raw.ends_with("\r\n\r\n"), "{raw}");
    }

    #[tokio::test]
    async fn decodes_chunked_bodies() {
        let (client, _server) = serve(
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n4;ext=1\r\nWiki\r\n5\r\npedia\r\n0\r\nx-trailer: 1\r\n\r\n",
        )
        .await;
        let response = send_request(client, request(Method::GET, ""))
            .await
            .expect("response");
        let body = response.bytes_limited(1024).await.expect("body");
        assert_eq!(&body[..], b"Wikipedia");
    }

    #[tokio::test]
    async fn reads_until_close_without_framing() {
        let (client, _server) = serve(
            b"HTTP/1.1 100 Continue\r\n\r\nHTTP/1.1 200 OK\r\nx-mode: eof\r\n\r\nstreamed to the end",
        )
        .await;
        let response = send_request(client, request(Method::GET, ""))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["x-mode"], "eof");
        let text = response.text_lossy(1024).await.expect("body");
        assert_eq!(text, "streamed to the end");
    }

    #[tokio::test]
    async fn short_content_length_body_fails_on_read() {
        let (client, _server) = serve(b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nabc").await;
        let response = send_request(client, request(Method::GET, ""))
            .await
            .expect("head parses");
        match response.bytes_limited(1024).await {
            Err(Error::ReadBody { .. }) => {}
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn garbage_response_is_malformed() {
        let (client, _server) = serve(b"SSH-2.0-OpenSSH_9.6\r\n\r\n").await;
        let error = send_request(client, request(Method::GET, ""))
            .await
            .expect_err("not http");
        assert_eq!(error.transport_kind(), Some(TransportErrorKind::Protocol));
        assert!(error.is_malformed_http_version(), "{error}");
    }

    #[tokio::test]
    async fn closed_before_head_is_a_read_error() {
        let (client, _server) = serve(b"").await;
        let error = send_request(client, request(Method::GET, ""))
            .await
            .expect_err("empty response");
        assert_eq!(error.transport_kind(), Some(TransportErrorKind::Read));
    }
}
