//! Bulk fan-out of per-instance tasks.
//!
//! A batch of one behaves like a plain call and propagates its error. Larger
//! batches run every task concurrently, record each failure in its slot, and
//! return results in submission order once all tasks have settled.

use std::fmt::Display;
use std::future::Future;
use std::time::{Duration, Instant};

use futures_util::stream::{self, StreamExt};
use tracing::error;

/// Timing captured for one task.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TaskMetrics {
    /// Zero-based submission index.
    pub index: usize,
    /// Time from the task's first poll to its completion.
    pub elapsed: Duration,
}

/// Outcome of one task in a batch.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BulkResult<T> {
    /// Task output; `None` marks a failed task.
    pub item: Option<T>,
    /// Rendered error for failed tasks.
    pub error: Option<String>,
    /// Timing for the task.
    pub metrics: TaskMetrics,
}

impl<T> BulkResult<T> {
    /// Returns `true` when the task failed.
    #[must_use]
    pub const fn is_failure(&self) -> bool {
        self.item.is_none()
    }
}

/// Results of a whole batch, in submission order.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BatchReport<T> {
    /// One entry per submitted item.
    pub results: Vec<BulkResult<T>>,
}

impl<T> Default for BatchReport<T> {
    fn default() -> Self {
        Self {
            results: Vec::new(),
        }
    }
}

impl<T> BatchReport<T> {
    /// Wraps fan-out results.
    #[must_use]
    pub const fn new(results: Vec<BulkResult<T>>) -> Self {
        Self { results }
    }

    /// Successful items in submission order.
    pub fn succeeded(&self) -> impl Iterator<Item = &T> {
        self.results.iter().filter_map(|result| result.item.as_ref())
    }

    /// Number of failed tasks.
    #[must_use]
    pub fn failed(&self) -> usize {
        self.results.iter().filter(|result| result.is_failure()).count()
    }

    /// Number of submitted tasks.
    #[must_use]
    pub fn total(&self) -> usize {
        self.results.len()
    }

    /// Returns `true` when nothing was submitted.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }
}

/// Runs `task` once per item.
///
/// `concurrency` caps the number of in-flight tasks; `0` runs every task at
/// once.
///
/// # Errors
///
/// Only batches of exactly one item return an error, which is the task's own
/// error. Failures in larger batches are recorded in the results.
pub async fn fan_out<I, T, E, F, Fut>(
    items: Vec<I>,
    concurrency: usize,
    task: F,
) -> Result<Vec<BulkResult<T>>, E>
where
    F: Fn(I) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let total = items.len();
    if total == 1 {
        let started = Instant::now();
        let mut single = items;
        let Some(item) = single.pop() else {
            return Ok(Vec::new());
        };
        let output = task(item).await?;
        return Ok(vec![BulkResult {
            item: Some(output),
            error: None,
            metrics: TaskMetrics {
                index: 0,
                elapsed: started.elapsed(),
            },
        }]);
    }

    let limit = if concurrency == 0 {
        total.max(1)
    } else {
        concurrency
    };
    let task_ref = &task;
    let results = stream::iter(items.into_iter().enumerate())
        .map(|(index, item)| async move {
            let started = Instant::now();
            let outcome = task_ref(item).await;
            let metrics = TaskMetrics {
                index,
                elapsed: started.elapsed(),
            };
            match outcome {
                Ok(output) => BulkResult {
                    item: Some(output),
                    error: None,
                    metrics,
                },
                Err(err) => {
                    error!(item = index + 1, total, error = %err, "bulk task failed");
                    BulkResult {
                        item: None,
                        error: Some(err.to_string()),
                        metrics,
                    }
                }
            }
        })
        .buffered(limit)
        .collect::<Vec<_>>()
        .await;
    Ok(results)
}
