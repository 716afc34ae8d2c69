//! Task-group combinators: run several cancellable tasks together and
//! decide when enough of them have finished to stop waiting for the rest.
//!
//! Every combinator creates a child [`CloseSignal`] ("the group signal")
//! and hands each task its own grandchild closer. Closing the group signal
//! cascades to every task's closer, so a well-behaved task notices and
//! winds down quickly; the combinator still waits for every spawned task
//! to actually finish before returning, so no task outlives its caller.

use tokio::task::JoinSet;

use crate::cancel::CloseSignal;
use crate::error::{Error, Result};

/// Run every task to completion. On the first failure (including the
/// first cancellation), closes the group signal and returns that error
/// once every task has wound down. On full success, returns results in
/// submission order.
pub async fn all_tasks<T, F, Fut>(closer: &CloseSignal, tasks: Vec<F>) -> Result<Vec<T>>
where
    F: FnOnce(CloseSignal) -> Fut,
    Fut: std::future::Future<Output = Result<T>> + Send + 'static,
    T: Send + 'static,
{
    let group = closer.create_child();
    let n = tasks.len();
    let mut set = JoinSet::new();
    for (idx, task) in tasks.into_iter().enumerate() {
        let child = group.create_child();
        set.spawn(async move { (idx, task(child).await) });
    }

    let mut results: Vec<Option<T>> = (0..n).map(|_| None).collect();
    let mut first_err = None;
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok((idx, Ok(v))) => results[idx] = Some(v),
            Ok((idx, Err(e))) => {
                let _ = idx;
                if first_err.is_none() {
                    first_err = Some(e);
                }
                group.close("a task in the group failed");
            }
            Err(join_err) => {
                if first_err.is_none() {
                    first_err = Some(Error::Invariant(format!("task panicked: {join_err}")));
                }
                group.close("a task in the group panicked");
            }
        }
    }

    if let Some(e) = first_err {
        return Err(e);
    }
    Ok(results.into_iter().map(|v| v.expect("invariant violated: missing task result")).collect())
}

/// Run every task; return the first success and cancel the rest. If every
/// task fails, return the first error encountered.
pub async fn any_tasks<T, F, Fut>(closer: &CloseSignal, tasks: Vec<F>) -> Result<T>
where
    F: FnOnce(CloseSignal) -> Fut,
    Fut: std::future::Future<Output = Result<T>> + Send + 'static,
    T: Send + 'static,
{
    let group = closer.create_child();
    let mut set = JoinSet::new();
    for task in tasks {
        let child = group.create_child();
        set.spawn(task(child));
    }

    let mut errors = Vec::new();
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(Ok(v)) => {
                group.close("one task in the group already succeeded");
                return Ok(v);
            }
            Ok(Err(e)) => errors.push(e),
            Err(join_err) => errors.push(Error::Invariant(format!("task panicked: {join_err}"))),
        }
    }
    Err(errors
        .into_iter()
        .next()
        .unwrap_or_else(|| Error::Invariant("any_tasks called with no tasks".into())))
}

/// Run every task; return as soon as `k` have succeeded, cancelling the
/// rest. Fails as soon as the remaining in-flight tasks can no longer
/// possibly reach `k` successes.
pub async fn some_tasks<T, F, Fut>(closer: &CloseSignal, k: usize, tasks: Vec<F>) -> Result<Vec<T>>
where
    F: FnOnce(CloseSignal) -> Fut,
    Fut: std::future::Future<Output = Result<T>> + Send + 'static,
    T: Send + 'static,
{
    let n = tasks.len();
    if k > n {
        return Err(Error::Invariant(format!(
            "some_tasks needs {k} successes but only {n} tasks were given"
        )));
    }
    let group = closer.create_child();
    let mut set = JoinSet::new();
    for task in tasks {
        let child = group.create_child();
        set.spawn(task(child));
    }

    let mut successes = Vec::new();
    let mut remaining = n;
    let mut last_err = None;
    while let Some(joined) = set.join_next().await {
        remaining -= 1;
        match joined {
            Ok(Ok(v)) => {
                successes.push(v);
                if successes.len() == k {
                    group.close("reached the target number of successes");
                    return Ok(successes);
                }
            }
            Ok(Err(e)) => last_err = Some(e),
            Err(join_err) => last_err = Some(Error::Invariant(format!("task panicked: {join_err}"))),
        }
        if successes.len() + remaining < k {
            group.close("can no longer reach the target number of successes");
            return Err(last_err.unwrap_or_else(|| {
                Error::Invariant("some_tasks could not collect enough successes".into())
            }));
        }
    }
    Err(last_err.unwrap_or_else(|| Error::Invariant("some_tasks could not collect enough successes".into())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn ok_after(ms: u64, v: i32) -> impl FnOnce(CloseSignal) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<i32>> + Send>> {
        move |_closer| {
            Box::pin(async move {
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(v)
            })
        }
    }

    fn err_after(ms: u64, msg: &'static str) -> impl FnOnce(CloseSignal) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<i32>> + Send>> {
        move |_closer| {
            Box::pin(async move {
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Err(Error::Invariant(msg.into()))
            })
        }
    }

    #[tokio::test]
    async fn all_tasks_preserves_submission_order() {
        let closer = CloseSignal::new();
        let results = all_tasks(&closer, vec![ok_after(30, 1), ok_after(5, 2), ok_after(15, 3)])
            .await
            .unwrap();
        assert_eq!(results, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn all_tasks_surfaces_first_error_and_cancels_group() {
        let closer = CloseSignal::new();
        let err = all_tasks(&closer, vec![ok_after(50, 1), err_after(5, "boom")])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Invariant(msg) if msg == "boom"));
    }

    #[tokio::test]
    async fn any_tasks_returns_first_success() {
        let closer = CloseSignal::new();
        let v = any_tasks(&closer, vec![ok_after(50, 1), ok_after(5, 2)]).await.unwrap();
        assert_eq!(v, 2);
    }

    #[tokio::test]
    async fn any_tasks_fails_when_all_fail() {
        let closer = CloseSignal::new();
        let err = any_tasks(&closer, vec![err_after(5, "a"), err_after(10, "b")])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Invariant(_)));
    }

    #[tokio::test]
    async fn some_tasks_stops_after_k_successes() {
        let closer = CloseSignal::new();
        let results = some_tasks(&closer, 2, vec![ok_after(5, 1), ok_after(10, 2), ok_after(50, 3)])
            .await
            .unwrap();
        assert_eq!(results.len(), 2);
    }

    #[tokio::test]
    async fn some_tasks_fails_fast_when_unreachable() {
        let closer = CloseSignal::new();
        let err = some_tasks(&closer, 2, vec![err_after(5, "a"), err_after(10, "b"), ok_after(50, 1)])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Invariant(_)));
    }

    #[tokio::test]
    async fn some_tasks_rejects_impossible_k() {
        let closer = CloseSignal::new();
        let err = some_tasks(&closer, 5, vec![ok_after(1, 1)]).await.unwrap_err();
        assert!(matches!(err, Error::Invariant(_)));
    }
}
