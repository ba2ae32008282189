//! Per-request access log.
//!
//! [`log_request`] wraps every request.  It attaches a [`RequestLog`] handle
//! to the request extensions, lets handlers and the cache layer annotate it
//! with the cache status and cache file, and emits one structured line once
//! the response body has been fully sent, has failed, or was abandoned by
//! the client.

use std::path::Path;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll, ready};
use std::time::Instant;

use axum::body::{Body, Bytes};
use axum::extract::Request;
use axum::http::Method;
use axum::middleware::Next;
use axum::response::Response;
use futures::{Stream, StreamExt};
use tracing::info;

use crate::metrics::CacheStatus;

/// How the response body ended.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum BodyOutcome {
    /// The body was dropped before its end, e.g. the client disconnected.
    #[default]
    Incomplete,
    Complete,
    Failed(String),
}

impl BodyOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Incomplete => "incomplete",
            Self::Complete => "complete",
            Self::Failed(_) => "failed",
        }
    }
}

#[derive(Debug, Default)]
struct LogFields {
    cache_status: CacheStatus,
    cache_file: Option<String>,
    body: BodyOutcome,
}

/// Shared, per-request access log annotations.
#[derive(Debug, Clone, Default)]
pub struct RequestLog {
    fields: Arc<Mutex<LogFields>>,
}

impl RequestLog {
    pub fn set_cache_status(&self, status: CacheStatus) {
        self.with_fields(|f| f.cache_status = status);
    }

    pub fn set_cache_file(&self, path: &Path) {
        let path = path.display().to_string();
        self.with_fields(|f| f.cache_file = Some(path));
    }

    /// Current cache status and cache file (empty when none was resolved).
    pub fn snapshot(&self) -> (CacheStatus, String) {
        self.with_fields(|f| (f.cache_status, f.cache_file.clone().unwrap_or_default()))
    }

    pub fn body_outcome(&self) -> BodyOutcome {
        self.with_fields(|f| f.body.clone())
    }

    fn set_body_outcome(&self, outcome: BodyOutcome) {
        self.with_fields(|f| f.body = outcome);
    }

    fn with_fields<T>(&self, f: impl FnOnce(&mut LogFields) -> T) -> T {
        let mut guard = self.fields.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }
}

// ---------------------------------------------------------------------------
// Emission
// ---------------------------------------------------------------------------

/// Everything known about a request once its head is ready.  The log line
/// is written when this is dropped.
struct AccessEntry {
    method: Method,
    path: String,
    status: u16,
    started: Instant,
    log: RequestLog,
}

impl Drop for AccessEntry {
    fn drop(&mut self) {
        let (cache_status, cache_file) = self.log.snapshot();
        let body = self.log.body_outcome();
        let body_error = match &body {
            BodyOutcome::Failed(err) => err.as_str(),
            _ => "",
        };
        info!(
            target: "npmcache::access",
            cache = cache_status.as_str(),
            method = %self.method,
            path = %self.path,
            status = self.status,
            cache_file = %cache_file,
            body = body.as_str(),
            body_error,
            elapsed_ms = self.started.elapsed().as_millis() as u64,
            "request"
        );
    }
}

/// Response body stream that records how it ended and emits the access
/// log line at that point.
struct LoggedBody<S> {
    inner: S,
    entry: Option<AccessEntry>,
}

impl<S> LoggedBody<S> {
    fn finish(&mut self, outcome: BodyOutcome) {
        if let Some(entry) = self.entry.take() {
            entry.log.set_body_outcome(outcome);
        }
    }
}

impl<S> Stream for LoggedBody<S>
where
    S: Stream<Item = Result<Bytes, axum::Error>> + Unpin,
{
    type Item = Result<Bytes, axum::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let item = ready!(self.inner.poll_next_unpin(cx));
        match &item {
            None => self.finish(BodyOutcome::Complete),
            Some(Err(err)) => self.finish(BodyOutcome::Failed(err.to_string())),
            Some(Ok(_)) => {}
        }
        Poll::Ready(item)
    }
}

/// Access-log middleware.
pub async fn log_request(mut req: Request, next: Next) -> Response {
    let started = Instant::now();
    let method = req.method().clone();
    let path = req.uri().path().to_owned();

    let log = RequestLog::default();
    req.extensions_mut().insert(log.clone());

    let response = next.run(req).await;

    let entry = AccessEntry {
        status: response.status().as_u16(),
        method,
        path,
        started,
        log,
    };

    // HEAD responses never have their body polled.
    if entry.method == Method::HEAD {
        entry.log.set_body_outcome(BodyOutcome::Complete);
        return response;
    }

    response.map(|body| {
        Body::from_stream(LoggedBody {
            inner: body.into_data_stream(),
            entry: Some(entry),
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(log: &RequestLog) -> AccessEntry {
        AccessEntry {
            method: Method::GET,
            path: "/left-pad/-/left-pad-1.3.0.tgz".to_string(),
            status: 200,
            started: Instant::now(),
            log: log.clone(),
        }
    }

    #[test]
    fn defaults_to_hit_without_file() {
        let log = RequestLog::default();
        assert_eq!(log.snapshot(), (CacheStatus::Hit, String::new()));
        assert_eq!(log.body_outcome(), BodyOutcome::Incomplete);
    }

    #[test]
    fn clones_share_annotations() {
        let log = RequestLog::default();
        let handle = log.clone();
        handle.set_cache_status(CacheStatus::MissFailover);
        handle.set_cache_file(Path::new("/cache/npmjs/left-pad/.cache.json"));

        assert_eq!(
            log.snapshot(),
            (
                CacheStatus::MissFailover,
                "/cache/npmjs/left-pad/.cache.json".to_string()
            )
        );
    }

    #[tokio::test]
    async fn drained_body_is_complete() {
        let log = RequestLog::default();
        let body = LoggedBody {
            inner: futures::stream::iter(vec![Ok::<_, axum::Error>(Bytes::from_static(b"abc"))]),
            entry: Some(entry(&log)),
        };

        let chunks: Vec<_> = body.collect().await;
        assert_eq!(chunks.len(), 1);
        assert_eq!(log.body_outcome(), BodyOutcome::Complete);
    }

    #[tokio::test]
    async fn stream_error_is_recorded() {
        let log = RequestLog::default();
        let body = LoggedBody {
            inner: futures::stream::iter(vec![
                Ok(Bytes::from_static(b"partial")),
                Err(axum::Error::new(std::io::Error::other("disk read failed"))),
            ]),
            entry: Some(entry(&log)),
        };

        let _: Vec<_> = body.collect().await;
        let BodyOutcome::Failed(err) = log.body_outcome() else {
            panic!("expected failed body");
        };
        assert!(err.contains("disk read failed"));
    }

    #[tokio::test]
    async fn abandoned_body_is_incomplete() {
        let log = RequestLog::default();
        let mut body = LoggedBody {
            inner: futures::stream::iter(vec![
                Ok::<_, axum::Error>(Bytes::from_static(b"one")),
                Ok(Bytes::from_static(b"two")),
            ]),
            entry: Some(entry(&log)),
        };

        assert!(body.next().await.is_some());
        drop(body);
        assert_eq!(log.body_outcome(), BodyOutcome::Incomplete);
    }
}
