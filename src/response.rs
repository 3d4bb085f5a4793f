use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use http::{HeaderMap, StatusCode, Version};
use http_body::{Body, Frame, SizeHint};
use http_body_util::BodyExt;
use http_body_util::combinators::UnsyncBoxBody;
use serde::de::DeserializeOwned;

use crate::error::{BoxError, Error};
use crate::util::truncate_body;

pub struct ResponseBody {
    inner: UnsyncBoxBody<Bytes, BoxError>,
}

impl ResponseBody {
    pub fn new<B>(body: B) -> Self
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        Self {
            inner: body.map_err(|error| -> BoxError { error.into() }).boxed_unsync(),
        }
    }

    pub fn empty() -> Self {
        Self::new(http_body_util::Empty::<Bytes>::new())
    }

    pub async fn collect_limited(mut self, max_bytes: usize) -> Result<Bytes, Error> {
        let mut collected = Vec::new();
        while let Some(frame) = self.inner.frame().await {
            let frame = frame.map_err(|source| Error::ReadBody { source })?;
            if let Some(data) = frame.data_ref() {
                let total = collected.len().saturating_add(data.len());
                if total > max_bytes {
                    return Err(Error::ResponseBodyTooLarge {
                        limit_bytes: max_bytes,
                        actual_bytes: total,
                    });
                }
                collected.extend_from_slice(data);
            }
        }
        Ok(Bytes::from(collected))
    }
}

impl Body for ResponseBody {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        Pin::new(&mut self.get_mut().inner).poll_frame(cx)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

impl std::fmt::Debug for ResponseBody {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.debug_struct("ResponseBody").finish_non_exhaustive()
    }
}

#[derive(Debug)]
pub struct HttpResponse {
    status: StatusCode,
    version: Version,
    headers: HeaderMap,
    body: ResponseBody,
}

impl HttpResponse {
    pub fn new(
        status: StatusCode,
        version: Version,
        headers: HeaderMap,
        body: ResponseBody,
    ) -> Self {
        Self {
            status,
            version,
            headers,
            body,
        }
    }

    pub(crate) fn from_http<B>(response: http::Response<B>) -> Self
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        let (parts, body) = response.into_parts();
        Self::new(parts.status, parts.version, parts.headers, ResponseBody::new(body))
    }

    pub fn status(&self) -> StatusCode {
        self.status
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

    pub fn body_mut(&mut self) -> &mut ResponseBody {
        &mut self.body
    }

    pub fn into_body(self) -> ResponseBody {
        self.body
    }

    pub async fn bytes_limited(self, max_bytes: usize) -> Result<Bytes, Error> {
        self.body.collect_limited(max_bytes).await
    }

    pub async fn text_lossy(self, max_bytes: usize) -> Result<String, Error> {
        let body = self.bytes_limited(max_bytes).await?;
        Ok(String::from_utf8_lossy(&body).into_owned())
    }

    pub async fn json<T>(self, max_bytes: usize) -> Result<T, Error>
    where
        T: DeserializeOwned,
    {
        let body = self.bytes_limited(max_bytes).await?;
        serde_json::from_slice(&body).map_err(|source| Error::Deserialize {
            source,
            body: truncate_body(&body),
        })
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use http::{HeaderMap, StatusCode, Version};
    use http_body_util::Full;
    use serde::Deserialize;

    use super::{HttpResponse, ResponseBody};
    use crate::error::Error;

    fn response(body: &'static str) -> HttpResponse {
        HttpResponse::new(
            StatusCode::OK,
            Version::HTTP_11,
            HeaderMap::new(),
            ResponseBody::new(Full::new(Bytes::from_static(body.as_bytes()))),
        )
    }

    #[tokio::test]
    async fn bytes_limited_rejects_oversized_bodies() {
        match response("0123456789").bytes_limited(4).await {
            Err(Error::ResponseBodyTooLarge {
                limit_bytes,
                actual_bytes,
            }) => {
                assert_eq!(limit_bytes, 4);
                assert_eq!(actual_bytes, 10);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn json_decodes_body() {
        #[derive(Deserialize)]
        struct Payload {
            name: String,
        }

        let payload: Payload = response(r#"{"name":"scanme"}"#)
            .json(1024)
            .await
            .expect("decode json");
        assert_eq!(payload.name, "scanme");
    }
}
