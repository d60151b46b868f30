//! Ordered, chunked fan-out with cooperative cancellation.
//!
//! [`chunked_map`] splits the input into chunks, runs each chunk on the tokio
//! runtime with bounded concurrency, and concatenates the results in input
//! order. The first failing item cancels the rest and its error is returned.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};

use futures::stream::{self, StreamExt, TryStreamExt};

use crate::error::{Error, Result};

/// Shared cancellation flag checked between items.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    /// Creates an un-cancelled flag.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Returns true once [`cancel`](Self::cancel) has been called.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Chunking parameters.
#[derive(Debug, Clone, Copy)]
pub struct ChunkOptions {
    /// Items per chunk. Zero is treated as one.
    pub chunk_size: usize,
    /// Maximum chunks in flight. Zero is treated as one.
    pub max_concurrency: usize,
}

impl Default for ChunkOptions {
    fn default() -> Self {
        Self {
            chunk_size: 100,
            max_concurrency: std::thread::available_parallelism().map_or(4, std::num::NonZero::get),
        }
    }
}

/// Applies `f` to every item, preserving input order.
///
/// Chunks are spawned as tokio tasks. If any item fails, the shared cancel
/// flag is raised so remaining chunks stop early, and the first error to occur
/// is returned, even when an earlier chunk only observed the cancellation. If
/// `cancel` is raised externally the call returns [`Error::Cancelled`].
///
/// # Errors
///
/// Returns the first error produced by `f`, or `Cancelled`.
pub async fn chunked_map<T, R, F, Fut>(
    items: Vec<T>,
    options: ChunkOptions,
    cancel: CancelFlag,
    f: F,
) -> Result<Vec<R>>
where
    T: Send + 'static,
    R: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R>> + Send + 'static,
{
    if items.is_empty() {
        return Ok(Vec::new());
    }
    let chunk_size = options.chunk_size.max(1);
    let concurrency = options.max_concurrency.max(1);
    let f = Arc::new(f);
    // Peers of a failing chunk report `Cancelled`; this keeps the real cause.
    let first_failure: Arc<Mutex<Option<Error>>> = Arc::new(Mutex::new(None));

    let mut chunks: Vec<Vec<T>> = Vec::new();
    let mut iter = items.into_iter().peekable();
    while iter.peek().is_some() {
        chunks.push(iter.by_ref().take(chunk_size).collect());
    }

    let collected: Result<Vec<Vec<R>>> = stream::iter(chunks)
        .map(|chunk| {
            let f = Arc::clone(&f);
            let cancel = cancel.clone();
            let first_failure = Arc::clone(&first_failure);
            async move {
                let handle = tokio::spawn(async move {
                    let mut out = Vec::with_capacity(chunk.len());
                    for item in chunk {
                        if cancel.is_cancelled() {
                            return Err(Error::Cancelled);
                        }
                        match f(item).await {
                            Ok(r) => out.push(r),
                            Err(e) => {
                                let e = match first_failure.lock() {
                                    Ok(mut slot) if slot.is_none() => {
                                        *slot = Some(e);
                                        Error::Cancelled
                                    }
                                    _ => e,
                                };
                                cancel.cancel();
                                return Err(e);
                            }
                        }
                    }
                    Ok(out)
                });
                handle
                    .await
                    .map_err(|e| Error::internal(format!("chunk task failed: {e}")))?
            }
        })
        .buffered(concurrency)
        .try_collect()
        .await;

    match collected {
        Ok(results) => Ok(results.into_iter().flatten().collect()),
        Err(e) => {
            let recorded = first_failure.lock().ok().and_then(|mut slot| slot.take());
            Err(recorded.unwrap_or(e))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn preserves_order_across_chunks() -> Result<()> {
        let items: Vec<u32> = (0..250).collect();
        let opts = ChunkOptions {
            chunk_size: 7,
            max_concurrency: 4,
        };
        let out = chunked_map(items, opts, CancelFlag::new(), |n| async move { Ok(n * 2) }).await?;
        assert_eq!(out.len(), 250);
        assert!(out.iter().enumerate().all(|(i, v)| *v == u32::try_from(i).unwrap() * 2));
        Ok(())
    }

    #[tokio::test]
    async fn first_error_short_circuits() {
        let cancel = CancelFlag::new();
        let result = chunked_map(
            (0..50).collect::<Vec<u32>>(),
            ChunkOptions {
                chunk_size: 5,
                max_concurrency: 2,
            },
            cancel.clone(),
            |n| async move {
                if n == 12 {
                    Err(Error::InvalidInput("boom".into()))
                } else {
                    Ok(n)
                }
            },
        )
        .await;
        assert!(matches!(result, Err(Error::InvalidInput(_))));
        assert!(cancel.is_cancelled());

        // A later chunk failing while an earlier one is still running.
        let result = chunked_map(
            (0..4).collect::<Vec<u32>>(),
            ChunkOptions {
                chunk_size: 2,
                max_concurrency: 2,
            },
            CancelFlag::new(),
            |n| async move {
                match n {
                    0 => {
                        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                        Ok(n)
                    }
                    2 => Err(Error::InvalidInput(format!("boom from item {n}"))),
                    _ => Ok(n),
                }
            },
        )
        .await;
        match result {
            Err(Error::InvalidInput(message)) => assert_eq!(message, "boom from item 2"),
            other => panic!("expected the failing item's error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn pre_cancelled_returns_cancelled() {
        let cancel = CancelFlag::new();
        cancel.cancel();
        let result = chunked_map(vec![1, 2, 3], ChunkOptions::default(), cancel, |n: i32| async move {
            Ok(n)
        })
        .await;
        assert!(matches!(result, Err(Error::Cancelled)));
    }
}
