//! Task coordinator: parallel execution with ordered joins.
//!
//! Every task is spawned onto the runtime as soon as it is handed over.
//! Results land in the slot matching the task's input index, so callers
//! can zip them back against whatever list produced the tasks.
//!
//! Two failure modes:
//! - `FailFast` aborts all in-flight siblings on the first failure. Work a
//!   sibling already sent to a cloud provider is not undone; only its local
//!   waiting is abandoned.
//! - `CollectAll` lets every task finish and reports all failures at once.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;

use futures::FutureExt;
use thiserror::Error;
use tokio::task::{JoinError, JoinSet};
use tracing::debug;

/// A unit of work handed to the coordinator.
pub type BoxTask<T, E> = Pin<Box<dyn Future<Output = Result<T, E>> + Send + 'static>>;

/// How a batch reacts to a failing task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureMode {
    /// Abort the rest of the batch on the first failure.
    FailFast,
    /// Run everything, then report every failure together.
    CollectAll,
}

/// Failure of one or more coordinated tasks.
#[derive(Debug, Error)]
pub enum TaskError<E> {
    /// The task at `index` returned an error.
    #[error("{error}")]
    Failed { index: usize, error: E },
    /// The task at `index` panicked.
    #[error("task {index} panicked: {message}")]
    Panicked { index: usize, message: String },
    /// The runtime cancelled a task before it produced a result.
    #[error("task was cancelled before completing")]
    Cancelled,
    /// Several tasks failed (`CollectAll`). Failures are sorted by index.
    #[error("{} of {total} tasks failed: {}", failures.len(), join_failures(failures))]
    Aggregate {
        failures: Vec<TaskError<E>>,
        total: usize,
    },
}

impl<E> TaskError<E> {
    /// Input index of the failing task, if the failure belongs to one.
    pub fn index(&self) -> Option<usize> {
        match self {
            TaskError::Failed { index, .. } | TaskError::Panicked { index, .. } => Some(*index),
            TaskError::Cancelled | TaskError::Aggregate { .. } => None,
        }
    }
}

fn join_failures<E: fmt::Display>(failures: &[TaskError<E>]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

type Joined<T, E> = (usize, Result<Result<T, E>, Box<dyn Any + Send>>);

/// Run `tasks` in parallel and return their values in input order.
pub async fn run<T, E>(tasks: Vec<BoxTask<T, E>>, mode: FailureMode) -> Result<Vec<T>, TaskError<E>>
where
    T: Send + 'static,
    E: Send + 'static,
{
    let total = tasks.len();
    let mut set = spawn_all(tasks);
    let mut slots: Vec<Option<T>> = std::iter::repeat_with(|| None).take(total).collect();
    let mut failures = Vec::new();

    while let Some(joined) = set.join_next().await {
        match flatten(joined) {
            Ok((index, value)) => slots[index] = Some(value),
            Err(failure) => match mode {
                FailureMode::FailFast => {
                    debug!(
                        index = ?failure.index(),
                        in_flight = set.len(),
                        "task failed, aborting siblings"
                    );
                    set.abort_all();
                    return Err(failure);
                }
                FailureMode::CollectAll => failures.push(failure),
            },
        }
    }

    if !failures.is_empty() {
        failures.sort_by_key(|f| f.index().unwrap_or(usize::MAX));
        return Err(TaskError::Aggregate { failures, total });
    }

    slots
        .into_iter()
        .map(|slot| slot.ok_or(TaskError::Cancelled))
        .collect()
}

/// Run `tasks` to completion and return every outcome in input order.
///
/// Used where successful side effects must be recorded even when a
/// sibling fails.
pub async fn settle<T, E>(tasks: Vec<BoxTask<T, E>>) -> Vec<Result<T, TaskError<E>>>
where
    T: Send + 'static,
    E: Send + 'static,
{
    let total = tasks.len();
    let mut set = spawn_all(tasks);
    let mut slots: Vec<Option<Result<T, TaskError<E>>>> =
        std::iter::repeat_with(|| None).take(total).collect();

    while let Some(joined) = set.join_next().await {
        match flatten(joined) {
            Ok((index, value)) => slots[index] = Some(Ok(value)),
            Err(failure) => match failure.index() {
                Some(index) => slots[index] = Some(Err(failure)),
                None => debug!("task cancelled by the runtime"),
            },
        }
    }

    slots
        .into_iter()
        .map(|slot| slot.unwrap_or(Err(TaskError::Cancelled)))
        .collect()
}

fn spawn_all<T, E>(tasks: Vec<BoxTask<T, E>>) -> JoinSet<Joined<T, E>>
where
    T: Send + 'static,
    E: Send + 'static,
{
    let mut set = JoinSet::new();
    for (index, task) in tasks.into_iter().enumerate() {
        set.spawn(async move { (index, AssertUnwindSafe(task).catch_unwind().await) });
    }
    set
}

fn flatten<T, E>(joined: Result<Joined<T, E>, JoinError>) -> Result<(usize, T), TaskError<E>> {
    match joined {
        Ok((index, Ok(Ok(value)))) => Ok((index, value)),
        Ok((index, Ok(Err(error)))) => Err(TaskError::Failed { index, error }),
        Ok((index, Err(payload))) => Err(TaskError::Panicked {
            index,
            message: panic_message(payload.as_ref()),
        }),
        Err(_) => Err(TaskError::Cancelled),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::time::{sleep, Instant};

    fn ok_after(value: usize, delay_secs: u64) -> BoxTask<usize, String> {
        Box::pin(async move {
            sleep(Duration::from_secs(delay_secs)).await;
            Ok(value)
        })
    }

    fn fail_after(message: &str, delay_secs: u64) -> BoxTask<usize, String> {
        let message = message.to_string();
        Box::pin(async move {
            sleep(Duration::from_secs(delay_secs)).await;
            Err(message)
        })
    }

    #[tokio::test(start_paused = true)]
    async fn results_follow_input_order_not_completion_order() {
        let tasks = (0..5).map(|i| ok_after(i, 50 - (i as u64) * 10)).collect();
        let results = run(tasks, FailureMode::FailFast).await.unwrap();
        assert_eq!(results, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_batch_returns_empty_results() {
        let results = run::<usize, String>(Vec::new(), FailureMode::CollectAll)
            .await
            .unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn fail_fast_returns_before_slow_siblings_finish() {
        let finished = Arc::new(AtomicBool::new(false));
        let flag = finished.clone();
        let slow: BoxTask<usize, String> = Box::pin(async move {
            sleep(Duration::from_secs(3600)).await;
            flag.store(true, Ordering::SeqCst);
            Ok(0)
        });

        let started = Instant::now();
        let err = run(vec![slow, fail_after("boom", 1)], FailureMode::FailFast)
            .await
            .unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(3600));
        assert_eq!(err.index(), Some(1));
        assert_eq!(err.to_string(), "boom");

        // The aborted sibling never completes, even after its deadline.
        sleep(Duration::from_secs(7200)).await;
        assert!(!finished.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn collect_all_runs_every_task_before_failing() {
        let finished = Arc::new(AtomicBool::new(false));
        let flag = finished.clone();
        let slow: BoxTask<usize, String> = Box::pin(async move {
            sleep(Duration::from_secs(30)).await;
            flag.store(true, Ordering::SeqCst);
            Ok(7)
        });

        let err = run(vec![fail_after("early", 0), slow], FailureMode::CollectAll)
            .await
            .unwrap_err();
        assert!(finished.load(Ordering::SeqCst));
        match err {
            TaskError::Aggregate { failures, total } => {
                assert_eq!(total, 2);
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].index(), Some(0));
            }
            other => panic!("expected aggregate, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn aggregate_message_joins_every_failure() {
        let tasks = vec![
            fail_after("second", 2),
            ok_after(1, 1),
            fail_after("first", 1),
        ];
        let err = run(tasks, FailureMode::CollectAll).await.unwrap_err();
        assert_eq!(err.to_string(), "2 of 3 tasks failed: second; first");
    }

    #[test]
    fn task_errors_render_and_box_as_std_errors() {
        let nested: TaskError<String> = TaskError::Aggregate {
            failures: vec![
                TaskError::Panicked {
                    index: 0,
                    message: "boom".into(),
                },
                TaskError::Cancelled,
            ],
            total: 4,
        };
        let boxed: Box<dyn std::error::Error + Send + Sync> = Box::new(nested);
        assert_eq!(
            boxed.to_string(),
            "2 of 4 tasks failed: task 0 panicked: boom; task was cancelled before completing"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn settle_keeps_successes_at_their_indices() {
        let tasks = vec![ok_after(10, 3), fail_after("nope", 1), ok_after(30, 2)];
        let outcomes = settle(tasks).await;
        assert_eq!(outcomes.len(), 3);
        assert_eq!(*outcomes[0].as_ref().unwrap(), 10);
        assert!(outcomes[1].is_err());
        assert_eq!(*outcomes[2].as_ref().unwrap(), 30);
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_task_is_reported_not_lost() {
        fn explode() -> usize {
            panic!("exploded")
        }
        let panicking: BoxTask<usize, String> = Box::pin(async { Ok(explode()) });
        let err = run(vec![ok_after(0, 1), panicking], FailureMode::CollectAll)
            .await
            .unwrap_err();
        match err {
            TaskError::Aggregate { failures, .. } => match &failures[0] {
                TaskError::Panicked { index, message } => {
                    assert_eq!(*index, 1);
                    assert_eq!(message, "exploded");
                }
                other => panic!("expected panic failure, got {other:?}"),
            },
            other => panic!("expected aggregate, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn large_batches_do_not_lose_results() {
        let completed = Arc::new(AtomicUsize::new(0));
        let tasks: Vec<BoxTask<usize, String>> = (0..2000usize)
            .map(|i| {
                let completed = completed.clone();
                Box::pin(async move {
                    sleep(Duration::from_millis((i % 17) as u64)).await;
                    completed.fetch_add(1, Ordering::SeqCst);
                    Ok(i)
                }) as BoxTask<usize, String>
            })
            .collect();

        let results = run(tasks, FailureMode::FailFast).await.unwrap();
        assert_eq!(completed.load(Ordering::SeqCst), 2000);
        assert!(results.iter().enumerate().all(|(i, v)| i == *v));
    }
}
