// SPDX-License-Identifier: Apache-2.0

//! Helpers for the binary's task set: the reader thread and the event consumer.

use std::error::Error;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::{Instant, timeout_at};
use tracing::error;

pub type TaskResult = Result<(), Box<dyn Error + Send + Sync>>;

/// Wait for the first task to finish and return its result.
pub async fn wait_for_any_task(tasks: &mut JoinSet<TaskResult>) -> TaskResult {
    match tasks.join_next().await {
        None => Ok(()),
        Some(res) => res?,
    }
}

pub async fn wait_for_tasks_with_timeout(
    tasks: &mut JoinSet<TaskResult>,
    timeout: Duration,
) -> TaskResult {
    wait_for_tasks_with_deadline(tasks, Instant::now() + timeout).await
}

/// Drain the set, keeping the last task error. Tasks still running at `stop_at` are
/// reported as a timeout.
pub async fn wait_for_tasks_with_deadline(
    tasks: &mut JoinSet<TaskResult>,
    stop_at: Instant,
) -> TaskResult {
    let mut result = Ok(());
    loop {
        match timeout_at(stop_at, tasks.join_next()).await {
            Err(_) => {
                result = Err("timed out waiting for tasks to complete".into());
                break;
            }
            Ok(None) => break,
            Ok(Some(Ok(Ok(())))) => {}
            Ok(Some(Ok(Err(e)))) => result = Err(e),
            Ok(Some(Err(e))) => error!(error = ?e, "Failed to join with task"),
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_any_task_returns_first_result() {
        let mut tasks: JoinSet<TaskResult> = JoinSet::new();
        tasks.spawn(async { Err("boom".into()) });
        tasks.spawn(async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        });

        let err = wait_for_any_task(&mut tasks).await.unwrap_err();
        assert_eq!(err.to_string(), "boom");
        tasks.abort_all();
    }

    #[tokio::test]
    async fn test_deadline_reports_stragglers() {
        let mut tasks: JoinSet<TaskResult> = JoinSet::new();
        tasks.spawn(async { Ok(()) });
        tasks.spawn(async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        });

        let res = wait_for_tasks_with_timeout(&mut tasks, Duration::from_millis(50)).await;
        assert!(res.is_err());
        tasks.abort_all();
    }

    #[tokio::test]
    async fn test_all_tasks_complete() {
        let mut tasks: JoinSet<TaskResult> = JoinSet::new();
        for _ in 0..3 {
            tasks.spawn(async { Ok(()) });
        }
        assert!(
            wait_for_tasks_with_timeout(&mut tasks, Duration::from_secs(5))
                .await
                .is_ok()
        );
    }
}
