use std::future::Future;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use tracing::debug;

tokio::task_local! {
    static CURRENT: Arc<ConnectionTrace>;
}

#[derive(Debug)]
pub(crate) struct ConnectionTrace {
    started_at: Instant,
    dials: AtomicUsize,
}

impl ConnectionTrace {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            started_at: Instant::now(),
            dials: AtomicUsize::new(0),
        })
    }

    pub(crate) fn current() -> Option<Arc<Self>> {
        CURRENT.try_with(Arc::clone).ok()
    }

    pub(crate) async fn scope<F>(self: Arc<Self>, future: F) -> F::Output
    where
        F: Future,
    {
        CURRENT.scope(self, future).await
    }

    pub(crate) fn dials(&self) -> usize {
        self.dials.load(Ordering::Relaxed)
    }

    fn elapsed_ms(&self) -> u64 {
        self.started_at.elapsed().as_millis() as u64
    }

    pub(crate) fn dial_start(&self, address: &str) {
        self.dials.fetch_add(1, Ordering::Relaxed);
        debug!(target: "retryhttp::trace", network = "tcp", address, "dial start");
    }

    pub(crate) fn dial_done(&self, address: &str, result: Result<(), &io::Error>) {
        debug!(
            target: "retryhttp::trace",
            network = "tcp",
            address,
            elapsed_ms = self.elapsed_ms(),
            error = ?result.err(),
            "dial done"
        );
    }

    pub(crate) fn tls_handshake_done(
        &self,
        server_name: &str,
        alpn: Option<&[u8]>,
        fallback: bool,
    ) {
        let alpn = alpn.map(String::from_utf8_lossy);
        debug!(
            target: "retryhttp::trace",
            server_name,
            alpn = alpn.as_deref(),
            fallback,
            elapsed_ms = self.elapsed_ms(),
            "tls handshake done"
        );
    }

    pub(crate) fn wrote_request(&self, result: Result<(), &io::Error>) {
        debug!(
            target: "retryhttp::trace",
            elapsed_ms = self.elapsed_ms(),
            error = ?result.err(),
            "wrote request"
        );
    }

    pub(crate) fn got_response(&self) {
        let reused = self.dials() == 0;
        debug!(target: "retryhttp::trace", reused, "got connection");
        debug!(
            target: "retryhttp::trace",
            elapsed_ms = self.elapsed_ms(),
            "got first response byte"
        );
    }
}
