//! Runtimes the pageserver runs its work on.
//!
//! Per-tenant background loops run on [`BACKGROUND_RUNTIME`]. The storage work they do
//! (layer flush, compaction, gc) is synchronous file I/O and goes through
//! [`run_blocking`] so it never occupies an async worker thread.

use once_cell::sync::Lazy;
use tokio::runtime::Runtime;
use tracing::Instrument;

pub static BACKGROUND_RUNTIME: Lazy<Runtime> = Lazy::new(|| {
    tokio::runtime::Builder::new_multi_thread()
        .thread_name("background op worker")
        .enable_all()
        .build()
        .expect("Failed to create background op runtime")
});

/// Runs `f` on tokio's blocking thread pool inside the current span.
///
/// A panic inside `f` is resumed in the calling task, so whoever catches panics around
/// the caller sees it.
pub async fn run_blocking<F, T>(f: F) -> anyhow::Result<T>
where
    F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    T: Send + 'static,
{
    let span = tracing::Span::current();
    let handle = tokio::task::spawn_blocking(move || span.in_scope(f));
    match handle.in_current_span().await {
        Ok(res) => res,
        Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
        Err(e) => Err(anyhow::anyhow!("blocking task was cancelled: {e}")),
    }
}

#[cfg(test)]
mod tests {
    use futures::FutureExt;

    use super::*;

    #[tokio::test]
    async fn run_blocking_returns_result() {
        let v = run_blocking(|| Ok(21 * 2)).await.unwrap();
        assert_eq!(v, 42);
        let err = run_blocking(|| -> anyhow::Result<()> { anyhow::bail!("boom") })
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "boom");
    }

    #[tokio::test]
    async fn run_blocking_resumes_panic() {
        let res = std::panic::AssertUnwindSafe(run_blocking(|| -> anyhow::Result<()> {
            panic!("blocking panic")
        }))
        .catch_unwind()
        .await;
        assert!(res.is_err());
    }
}
