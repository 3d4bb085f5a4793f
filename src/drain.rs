use http_body_util::BodyExt;
use tracing::debug;

use crate::request::Request;
use crate::response::HttpResponse;

pub async fn discard(request: &mut Request, response: HttpResponse, limit: usize) -> usize {
    let mut body = response.into_body();
    let mut discarded = 0_usize;
    let mut failed = false;
    {
        let context = request.context();
        while discarded < limit {
            let frame = tokio::select! {
                biased;
                _ = context.done() => {
                    failed = true;
                    break;
                }
                frame = body.frame() => frame,
            };
            match frame {
                None => break,
                Some(Ok(frame)) => {
                    if let Some(data) = frame.data_ref() {
                        discarded = discarded.saturating_add(data.len());
                    }
                }
                Some(Err(error)) => {
                    debug!(error = %error, "failed to drain response body");
                    failed = true;
                    break;
                }
            }
        }
    }
    drop(body);
    if failed {
        request.metrics_mut().drain_errors += 1;
    }
    discarded.min(limit)
}
