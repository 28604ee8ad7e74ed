//! Bounded runner for remote asynchronous tasks.
//!
//! A run submits the operation, polls `task.get_status` every
//! `poll_interval` until the task leaves `pending` or the deadline passes,
//! and then destroys the remote handle. Destruction happens on every exit
//! path; a failed destroy is logged and never replaces the primary outcome.

use std::future::Future;
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::config::TaskPolicy;
use crate::connection::RemoteConnection;
use crate::error::{PoolError, Result, HANDLE_INVALID};
use crate::types::{TaskHandle, TaskStatus, TaskTerminal};

/// Successful task result.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskOutput {
    pub task: TaskHandle,
    /// Payload of `task.get_result` (Null when resolved by verification)
    pub result: Value,
    /// True when the handle vanished and the outcome was confirmed by a
    /// direct query instead of the task itself.
    pub verified: bool,
}

/// Releases the remote handle exactly once.
///
/// The normal path calls [`release`](Self::release). If the run future is
/// dropped first, `Drop` hands the destroy to the runtime.
struct HandleGuard {
    connection: Arc<RemoteConnection>,
    handle: Option<TaskHandle>,
}

impl HandleGuard {
    fn new(connection: Arc<RemoteConnection>, handle: TaskHandle) -> Self {
        Self { connection, handle: Some(handle) }
    }

    async fn release(&mut self) {
        if let Some(handle) = self.handle.take() {
            destroy(&self.connection, &handle).await;
        }
    }
}

impl Drop for HandleGuard {
    fn drop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let connection = self.connection.clone();
                runtime.spawn(async move {
                    destroy(&connection, &handle).await;
                });
            }
            Err(_) => {
                warn!(task = %handle, "No runtime available, task handle leaked");
            }
        }
    }
}

async fn destroy(connection: &RemoteConnection, handle: &TaskHandle) {
    let args = vec![json!(handle.as_str())];
    let outcome = if connection.is_evicted() {
        connection.call_detached("task.destroy", args).await
    } else {
        connection.call("task.destroy", args).await
    };
    match outcome {
        Ok(_) => debug!(task = %handle, "Task handle destroyed"),
        Err(e) => warn!(task = %handle, error = %e, "Failed to destroy task handle"),
    }
}

/// Runs async tasks over one connection.
pub struct TaskRunner {
    connection: Arc<RemoteConnection>,
}

impl TaskRunner {
    pub fn new(connection: Arc<RemoteConnection>) -> Self {
        Self { connection }
    }

    /// Submit `Async.{method}` and run it to completion.
    pub async fn run_method(&self, method: &str, args: Vec<Value>, policy: TaskPolicy) -> Result<TaskOutput> {
        let connection = self.connection.clone();
        let method = method.to_string();
        self.run(move || async move { connection.submit_async(&method, args).await }, policy)
            .await
    }

    /// Submit with `submit` and poll to completion under `policy`.
    pub async fn run<S, F>(&self, submit: S, policy: TaskPolicy) -> Result<TaskOutput>
    where
        S: FnOnce() -> F,
        F: Future<Output = Result<TaskHandle>>,
    {
        self.execute(submit, policy, None::<fn() -> std::future::Ready<Result<bool>>>)
            .await
    }

    /// Like [`run`](Self::run), but if the handle becomes invalid mid-poll
    /// `verify` is asked whether the target object already reached the
    /// desired state. `Ok(true)` resolves the run as a success.
    pub async fn run_verified<S, F, V, VF>(&self, submit: S, policy: TaskPolicy, verify: V) -> Result<TaskOutput>
    where
        S: FnOnce() -> F,
        F: Future<Output = Result<TaskHandle>>,
        V: FnOnce() -> VF,
        VF: Future<Output = Result<bool>>,
    {
        self.execute(submit, policy, Some(verify)).await
    }

    #[instrument(skip_all, fields(pool_id = %self.connection.pool_id()))]
    async fn execute<S, F, V, VF>(&self, submit: S, policy: TaskPolicy, verify: Option<V>) -> Result<TaskOutput>
    where
        S: FnOnce() -> F,
        F: Future<Output = Result<TaskHandle>>,
        V: FnOnce() -> VF,
        VF: Future<Output = Result<bool>>,
    {
        let handle = submit().await?;
        let mut guard = HandleGuard::new(self.connection.clone(), handle.clone());

        let outcome = self.poll_to_completion(&handle, policy).await;
        guard.release().await;

        info!(task = %handle, terminal = ?terminal_of(&outcome), "Task finished");

        match outcome {
            Err(e) if is_ambiguous(&e) => match verify {
                Some(verify) => resolve_ambiguous(handle, e, verify).await,
                None => Err(e),
            },
            other => other,
        }
    }

    async fn poll_to_completion(&self, handle: &TaskHandle, policy: TaskPolicy) -> Result<TaskOutput> {
        let started = Instant::now();
        let deadline = started + policy.timeout();

        loop {
            let status = self.status(handle).await?;
            debug!(task = %handle, status = status.as_str(), "Task polled");
            if !status.is_pending() {
                return self.finish(handle, status).await;
            }

            let now = Instant::now();
            if now >= deadline {
                self.cancel(handle).await;
                return Err(PoolError::Timeout {
                    task: handle.to_string(),
                    elapsed_ms: u64::try_from(now.duration_since(started).as_millis()).unwrap_or(u64::MAX),
                });
            }
            tokio::time::sleep(policy.poll_interval().min(deadline - now)).await;
        }
    }

    /// Collect the outcome of a task that left `pending`.
    async fn finish(&self, handle: &TaskHandle, status: TaskStatus) -> Result<TaskOutput> {
        match status {
            TaskStatus::Success => {
                let result = self
                    .connection
                    .call("task.get_result", vec![json!(handle.as_str())])
                    .await?;
                Ok(TaskOutput { task: handle.clone(), result, verified: false })
            }
            TaskStatus::Failure => {
                let error_info: Vec<String> = self
                    .connection
                    .call_as("task.get_error_info", vec![json!(handle.as_str())])
                    .await?;
                Err(PoolError::RemoteOperationFailure { task: handle.to_string(), error_info })
            }
            TaskStatus::Cancelled => Err(PoolError::TaskCancelled(handle.to_string())),
            TaskStatus::Pending | TaskStatus::Cancelling => Err(PoolError::UnexpectedResponse {
                method: "task.get_status".to_string(),
                reason: format!("task {} is still {}", handle, status.as_str()),
            }),
        }
    }

    async fn status(&self, handle: &TaskHandle) -> Result<TaskStatus> {
        let raw: String = self
            .connection
            .call_as("task.get_status", vec![json!(handle.as_str())])
            .await?;
        TaskStatus::parse(&raw).ok_or_else(|| PoolError::UnexpectedResponse {
            method: "task.get_status".to_string(),
            reason: format!("unknown status {}", raw),
        })
    }

    /// Request cancellation without waiting for it to take effect.
    async fn cancel(&self, handle: &TaskHandle) {
        warn!(task = %handle, "Task deadline exceeded, cancelling");
        if let Err(e) = self.connection.call("task.cancel", vec![json!(handle.as_str())]).await {
            debug!(task = %handle, error = %e, "Cancel request failed");
        }
    }
}

async fn resolve_ambiguous<V, VF>(handle: TaskHandle, original: PoolError, verify: V) -> Result<TaskOutput>
where
    V: FnOnce() -> VF,
    VF: Future<Output = Result<bool>>,
{
    warn!(task = %handle, "Task handle vanished mid-poll, checking target state directly");
    match verify().await {
        Ok(true) => {
            info!(task = %handle, "Target reached desired state, treating task as succeeded");
            Ok(TaskOutput { task: handle, result: Value::Null, verified: true })
        }
        Ok(false) => Err(original),
        Err(e) => {
            warn!(task = %handle, error = %e, "Direct state check failed");
            Err(original)
        }
    }
}

/// The task may or may not have completed: its handle vanished, or the
/// session could not be recovered while polling.
fn is_ambiguous(error: &PoolError) -> bool {
    matches!(error, PoolError::SessionLost(_))
        || error.api_fault().map(|f| f.is_api(HANDLE_INVALID)).unwrap_or(false)
}

fn terminal_of(outcome: &Result<TaskOutput>) -> TaskTerminal {
    match outcome {
        Ok(_) => TaskTerminal::Success,
        Err(PoolError::Timeout { .. }) => TaskTerminal::TimedOut,
        Err(PoolError::TaskCancelled(_)) => TaskTerminal::Cancelled,
        Err(_) => TaskTerminal::Failure,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionSettings;
    use crate::error::RpcFault;
    use crate::transport::mock::TaskScript;
    use crate::transport::MockPoolTransport;
    use crate::types::Credentials;
    use std::time::Duration;

    fn setup() -> (Arc<MockPoolTransport>, TaskRunner, Arc<RemoteConnection>) {
        let mock = Arc::new(MockPoolTransport::new("10.0.0.1", "root", "pw"));
        let conn = Arc::new(RemoteConnection::new(
            "pool-1",
            "10.0.0.1",
            Credentials::password("root", "pw"),
            mock.clone(),
            ConnectionSettings::default(),
        ));
        (mock, TaskRunner::new(conn.clone()), conn)
    }

    fn policy() -> TaskPolicy {
        TaskPolicy::new(Duration::from_secs(1), Duration::from_secs(10))
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_returns_result() {
        let (mock, runner, _) = setup();
        mock.set_task_script("VM.start", TaskScript::Succeed { polls: 3, result: "done".into() });

        let started = Instant::now();
        let out = runner.run_method("VM.start", vec![json!("OpaqueRef:vm")], policy()).await.unwrap();

        assert_eq!(out.result, json!("done"));
        assert!(!out.verified);
        assert!(started.elapsed() >= Duration::from_secs(3));
        assert!(started.elapsed() < Duration::from_secs(4));
        assert_eq!(mock.destroy_count(out.task.as_str()), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sub_second_policy_is_honoured() {
        let (mock, runner, _) = setup();
        mock.set_task_script("VM.start", TaskScript::Succeed { polls: 3, result: "done".into() });

        let policy = TaskPolicy::new(Duration::from_millis(100), Duration::from_millis(500));
        let started = Instant::now();
        let out = runner.run_method("VM.start", vec![], policy).await.unwrap();

        assert_eq!(out.result, json!("done"));
        assert_eq!(started.elapsed(), Duration::from_millis(300));
        assert_eq!(mock.destroy_count(out.task.as_str()), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sub_second_timeout_reports_milliseconds() {
        let (mock, runner, _) = setup();
        mock.set_task_script("VM.start", TaskScript::Hang);

        let policy = TaskPolicy::new(Duration::from_millis(200), Duration::from_millis(700));
        let err = runner.run_method("VM.start", vec![], policy).await.unwrap_err();

        assert!(matches!(err, PoolError::Timeout { elapsed_ms: 700, .. }));
        assert_eq!(mock.destroy_count(&mock.last_task().unwrap()), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_carries_error_info() {
        let (mock, runner, _) = setup();
        mock.set_task_script("VM.start", TaskScript::Fail {
            polls: 1,
            error_info: vec!["VM_BAD_POWER_STATE".into(), "running".into()],
        });

        let err = runner.run_method("VM.start", vec![], policy()).await.unwrap_err();
        match err {
            PoolError::RemoteOperationFailure { error_info, .. } => {
                assert_eq!(error_info[0], "VM_BAD_POWER_STATE");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        let task = mock.last_task().unwrap();
        assert_eq!(mock.destroy_count(&task), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_cancels_and_destroys() {
        let (mock, runner, _) = setup();
        mock.set_task_script("VM.migrate", TaskScript::Hang);

        let err = runner
            .run_method("VM.migrate", vec![], TaskPolicy::new(Duration::from_secs(1), Duration::from_secs(5)))
            .await
            .unwrap_err();

        assert!(matches!(err, PoolError::Timeout { elapsed_ms: 5000, .. }));
        let task = mock.last_task().unwrap();
        assert_eq!(mock.cancel_count(&task), 1);
        assert_eq!(mock.destroy_count(&task), 1);
        assert_eq!(mock.live_task_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_exception_still_destroys() {
        let (mock, runner, _) = setup();
        mock.set_task_script("VM.start", TaskScript::Hang);
        for _ in 0..3 {
            mock.inject_fault("task.get_status", RpcFault::Transient("reset".into()));
        }

        let err = runner.run_method("VM.start", vec![], policy()).await.unwrap_err();
        assert!(err.is_infrastructure());

        let task = mock.last_task().unwrap();
        assert_eq!(mock.destroy_count(&task), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_vanished_handle_resolved_by_verification() {
        let (mock, runner, conn) = setup();
        mock.set_task_script("VM.start", TaskScript::Vanish { polls: 1 });

        let submit_conn = conn.clone();
        let out = runner
            .run_verified(
                move || async move { submit_conn.submit_async("VM.start", vec![]).await },
                policy(),
                || async { Ok(true) },
            )
            .await
            .unwrap();

        assert!(out.verified);
        assert_eq!(mock.destroy_count(out.task.as_str()), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_vanished_handle_raises_when_check_fails() {
        let (mock, runner, conn) = setup();
        mock.set_task_script("VM.start", TaskScript::Vanish { polls: 0 });

        let submit_conn = conn.clone();
        let err = runner
            .run_verified(
                move || async move { submit_conn.submit_async("VM.start", vec![]).await },
                policy(),
                || async { Ok(false) },
            )
            .await
            .unwrap_err();

        assert!(is_ambiguous(&err));
        let task = mock.last_task().unwrap();
        assert_eq!(mock.destroy_count(&task), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_session_mid_poll_resolved_by_verification() {
        let (mock, runner, conn) = setup();
        mock.set_task_script("VM.clean_shutdown", TaskScript::Hang);
        for _ in 0..3 {
            mock.inject_fault("task.get_status", RpcFault::SessionInvalid);
        }

        let submit_conn = conn.clone();
        let out = runner
            .run_verified(
                move || async move { submit_conn.submit_async("VM.clean_shutdown", vec![]).await },
                policy(),
                || async { Ok(true) },
            )
            .await
            .unwrap();

        assert!(out.verified);
        assert_eq!(mock.destroy_count(out.task.as_str()), 1);
        assert!(conn.is_evicted());

        // cleanup session logged out again, evicted one released
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;
        assert_eq!(mock.active_session_count(), 0);
    }

    #[tokio::test]
    async fn test_submit_failure_creates_nothing_to_destroy() {
        let (mock, runner, _) = setup();
        mock.inject_fault("Async.VM.start", RpcFault::api("VM_BAD_POWER_STATE", vec![]));

        assert!(runner.run_method("VM.start", vec![], policy()).await.is_err());
        assert_eq!(mock.call_count("task.destroy"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_run_still_destroys() {
        let (mock, runner, _) = setup();
        mock.set_task_script("VM.start", TaskScript::Hang);

        let run = runner.run_method("VM.start", vec![], policy());
        let _ = tokio::time::timeout(Duration::from_millis(1500), run).await;

        // let the spawned destroy run
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;

        let task = mock.last_task().unwrap();
        assert_eq!(mock.destroy_count(&task), 1);
    }
}
