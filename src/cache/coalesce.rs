//! In-process coalescing of upstream fetches.
//!
//! When enabled, at most one upstream fetch per cache file runs at a time.
//! The first caller spawns the fetch as its own task and registers it under
//! the cache path; callers arriving while it is in flight await the same
//! shared handle and observe its result.  The task runs to completion even
//! if every caller goes away, and removes its entry once it settles, so a
//! later request starts a fresh fetch.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use tokio::sync::Mutex;
use tracing::debug;

type SharedFetch = Shared<BoxFuture<'static, Result<(), Arc<anyhow::Error>>>>;

/// Registry of in-flight fetches keyed by destination path.
#[derive(Clone, Default)]
pub struct FetchCoalescer {
    inflight: Arc<Mutex<HashMap<PathBuf, SharedFetch>>>,
}

impl FetchCoalescer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `fetch` for `key`, or join the fetch already running for it.
    pub async fn run<F>(&self, key: PathBuf, fetch: F) -> Result<()>
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let shared = {
            let mut inflight = self.inflight.lock().await;
            match inflight.get(&key) {
                Some(existing) => {
                    debug!(path = %key.display(), "joining in-flight upstream fetch");
                    existing.clone()
                }
                None => {
                    let registry = Arc::clone(&self.inflight);
                    let owned_key = key.clone();
                    // The removal below waits on the lock held here, so the
                    // entry is always inserted before it can be removed.
                    let task = tokio::spawn(async move {
                        let result = match AssertUnwindSafe(fetch).catch_unwind().await {
                            Ok(result) => result.map_err(Arc::new),
                            Err(_) => Err(Arc::new(anyhow::anyhow!("upstream fetch panicked"))),
                        };
                        registry.lock().await.remove(&owned_key);
                        result
                    });
                    let fut = async move {
                        task.await.unwrap_or_else(|e| {
                            Err(Arc::new(anyhow::anyhow!("upstream fetch task failed: {e}")))
                        })
                    }
                    .boxed()
                    .shared();
                    inflight.insert(key, fut.clone());
                    fut
                }
            }
        };

        shared.await.map_err(|e| anyhow::anyhow!("{e:#}"))
    }

    /// Number of fetches currently in flight.
    #[cfg(test)]
    pub async fn len(&self) -> usize {
        self.inflight.lock().await.len()
    }
}
