//! End-to-end behaviour of the pool client against the in-memory pool.

use std::sync::Arc;
use std::time::Duration;

use limiquantix_pool::transport::mock::TaskScript;
use limiquantix_pool::{
    ClusterReconciler, ConnectionSettings, Credentials, MockPoolTransport, PoolError, PowerState,
    ReconcileSettings, RpcFault, SessionPool, TaskPolicy, TaskRunner, VmStateChange, VmStateTable,
};

const MASTER: &str = "10.0.0.1";

fn setup() -> (Arc<MockPoolTransport>, SessionPool, Credentials) {
    let mock = Arc::new(MockPoolTransport::new(MASTER, "root", "secret"));
    let pool = SessionPool::new(mock.clone(), ConnectionSettings::default());
    (mock, pool, Credentials::password("root", "secret"))
}

// =============================================================================
// Session pool
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_transient_exhaustion_evicts_and_next_get_logs_in_afresh() {
    let (mock, pool, creds) = setup();
    let conn = pool.get_connection("pool-1", MASTER, &creds).await.unwrap();

    for _ in 0..3 {
        mock.inject_fault("VM.get_all_records", RpcFault::Transient("connection reset".into()));
    }
    let err = conn.call("VM.get_all_records", vec![]).await.unwrap_err();

    assert!(matches!(err, PoolError::RetriesExhausted { attempts: 3, .. }));
    assert!(err.is_infrastructure());
    assert_eq!(mock.call_count("VM.get_all_records"), 3);
    assert!(pool.cached("pool-1").is_none());

    let fresh = pool.get_connection("pool-1", MASTER, &creds).await.unwrap();
    assert!(!Arc::ptr_eq(&conn, &fresh));
    assert_eq!(mock.login_attempts().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_transient_recovers_within_budget() {
    let (mock, pool, creds) = setup();
    let conn = pool.get_connection("pool-1", MASTER, &creds).await.unwrap();

    mock.inject_fault("pool.get_all", RpcFault::Transient("timeout".into()));
    mock.inject_fault("pool.get_all", RpcFault::Transient("timeout".into()));
    let started = tokio::time::Instant::now();
    conn.call("pool.get_all", vec![]).await.unwrap();

    // two sleeps of the default retry interval
    assert!(started.elapsed() >= Duration::from_secs(2));
    assert!(pool.cached("pool-1").is_some());
}

#[tokio::test]
async fn test_login_follows_redirect_once() {
    let mock = Arc::new(MockPoolTransport::new("10.0.0.2", "root", "secret"));
    mock.add_host(MASTER);
    let pool = SessionPool::new(mock.clone(), ConnectionSettings::default());

    let conn = pool
        .get_connection("pool-1", MASTER, &Credentials::password("root", "secret"))
        .await
        .unwrap();

    assert_eq!(conn.master_address(), "10.0.0.2");
    let attempts = mock.login_attempts();
    assert_eq!(attempts.iter().filter(|a| a.address == "10.0.0.2").count(), 1);
    assert_eq!(attempts.len(), 2);
}

#[tokio::test]
async fn test_call_follows_master_change() {
    let (mock, pool, creds) = setup();
    mock.add_host("10.0.0.2");
    let conn = pool.get_connection("pool-1", MASTER, &creds).await.unwrap();

    mock.set_master("10.0.0.2");
    conn.call("pool.get_all", vec![]).await.unwrap();

    assert_eq!(conn.master_address(), "10.0.0.2");
    let logins_at_new_master = mock
        .login_attempts()
        .iter()
        .filter(|a| a.address == "10.0.0.2")
        .count();
    assert_eq!(logins_at_new_master, 1);
    assert!(pool.cached("pool-1").is_some());
}

#[tokio::test]
async fn test_credentials_tried_at_most_once_each() {
    let (mock, pool, _) = setup();
    let creds = Credentials::new("root", vec!["one".into(), "two".into(), "three".into()]);

    let err = pool.get_connection("pool-1", MASTER, &creds).await.unwrap_err();

    assert!(matches!(err, PoolError::AuthenticationFailure { attempts: 3, .. }));
    assert_eq!(mock.login_attempts().len(), 3);
    assert!(pool.cached("pool-1").is_none());
}

#[tokio::test]
async fn test_reauthentication_resumes_from_working_password() {
    let (mock, pool, _) = setup();
    let creds = Credentials::new("root", vec!["old".into(), "secret".into()]);

    let conn = pool.get_connection("pool-1", MASTER, &creds).await.unwrap();
    assert_eq!(mock.login_attempts().len(), 2);

    mock.invalidate_sessions();
    conn.call("pool.get_all", vec![]).await.unwrap();

    let attempts = mock.login_attempts();
    assert_eq!(attempts.len(), 3);
    assert_eq!(attempts[2].password, "secret");
}

#[tokio::test]
async fn test_api_fault_keeps_connection_cached() {
    let (mock, pool, creds) = setup();
    let conn = pool.get_connection("pool-1", MASTER, &creds).await.unwrap();

    mock.inject_fault("VM.start", RpcFault::api("VM_BAD_POWER_STATE", vec!["running".into()]));
    let err = conn.call("VM.start", vec![]).await.unwrap_err();

    assert!(!err.is_infrastructure());
    assert!(err.api_fault().map(|f| f.is_api("VM_BAD_POWER_STATE")).unwrap_or(false));
    assert!(pool.cached("pool-1").is_some());
}

// =============================================================================
// Task runner
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_every_terminal_path_destroys_exactly_once() {
    let scripts = vec![
        TaskScript::Succeed { polls: 2, result: "ok".into() },
        TaskScript::Fail { polls: 1, error_info: vec!["INTERNAL_ERROR".into()] },
        TaskScript::Hang,
    ];

    for script in scripts {
        let (mock, pool, creds) = setup();
        let conn = pool.get_connection("pool-1", MASTER, &creds).await.unwrap();
        mock.set_task_script("VM.clean_reboot", script.clone());

        let policy = TaskPolicy::new(Duration::from_secs(1), Duration::from_secs(5));
        let _ = TaskRunner::new(conn).run_method("VM.clean_reboot", vec![], policy).await;

        let task = mock.last_task().unwrap();
        assert_eq!(mock.destroy_count(&task), 1, "script {script:?}");
        assert_eq!(mock.live_task_count(), 0, "script {script:?}");
    }
}

#[tokio::test(start_paused = true)]
async fn test_timeout_reports_elapsed() {
    let (mock, pool, creds) = setup();
    let conn = pool.get_connection("pool-1", MASTER, &creds).await.unwrap();
    mock.set_task_script("VM.pool_migrate", TaskScript::Hang);

    let policy = TaskPolicy::new(Duration::from_secs(1), Duration::from_secs(3));
    let err = TaskRunner::new(conn)
        .run_method("VM.pool_migrate", vec![], policy)
        .await
        .unwrap_err();

    match err {
        PoolError::Timeout { elapsed_ms, .. } => assert_eq!(elapsed_ms, 3000),
        other => panic!("unexpected error: {other:?}"),
    }
}

// =============================================================================
// Reconciliation
// =============================================================================

struct Cluster {
    mock: Arc<MockPoolTransport>,
    pool: SessionPool,
    creds: Credentials,
    reconciler: ClusterReconciler,
    host_a: String,
    host_b: String,
}

fn cluster() -> Cluster {
    let (mock, pool, creds) = setup();
    let host_a = mock.host_uuid(MASTER).unwrap();
    let host_b = mock.add_host("10.0.0.2");
    let reconciler = ClusterReconciler::new(Arc::new(VmStateTable::new()), ReconcileSettings::default());
    Cluster { mock, pool, creds, reconciler, host_a, host_b }
}

#[tokio::test]
async fn test_full_then_delta_reports_nothing() {
    let c = cluster();
    c.mock.add_vm("web-1", Some(c.host_a.as_str()), "Running");
    c.mock.add_vm("web-2", Some(c.host_b.as_str()), "Paused");
    c.mock.add_vm("db-1", None, "Halted");
    let conn = c.pool.get_connection("pool-1", MASTER, &c.creds).await.unwrap();

    let table = c.reconciler.full_sync("c1", &conn).await.unwrap();
    assert_eq!(table.len(), 3);
    assert_eq!(table["web-2"].state, PowerState::Running);
    assert_eq!(table["db-1"].state, PowerState::Stopped);

    let changes = c.reconciler.delta_sync("c1", &conn).await.unwrap();
    assert!(changes.is_empty());
}

#[tokio::test]
async fn test_starting_vm_not_downgraded_by_lagging_scan() {
    let c = cluster();
    c.mock.add_vm("web-1", None, "Halted");
    let conn = c.pool.get_connection("pool-1", MASTER, &c.creds).await.unwrap();
    c.reconciler.table().put("c1", Some(c.host_a.as_str()), "web-1", PowerState::Starting).unwrap();

    let changes = c.reconciler.delta_sync("c1", &conn).await.unwrap();

    assert!(changes.is_empty());
    let cached = c.reconciler.table().get("c1", "web-1").unwrap().unwrap();
    assert_eq!(cached.state, PowerState::Starting);
}

#[tokio::test]
async fn test_starting_vm_adopts_running() {
    let c = cluster();
    c.mock.add_vm("web-1", Some(c.host_a.as_str()), "Running");
    let conn = c.pool.get_connection("pool-1", MASTER, &c.creds).await.unwrap();
    c.reconciler.table().put("c1", Some(c.host_a.as_str()), "web-1", PowerState::Starting).unwrap();

    let changes = c.reconciler.delta_sync("c1", &conn).await.unwrap();

    assert_eq!(changes, vec![VmStateChange::new("web-1", Some(c.host_a.clone()), PowerState::Running)]);
}

#[tokio::test]
async fn test_host_change_reported() {
    let c = cluster();
    c.mock.add_vm("web-1", Some(c.host_a.as_str()), "Running");
    let conn = c.pool.get_connection("pool-1", MASTER, &c.creds).await.unwrap();
    c.reconciler.full_sync("c1", &conn).await.unwrap();

    c.mock.set_vm_host("web-1", Some(c.host_b.as_str()));
    let changes = c.reconciler.delta_sync("c1", &conn).await.unwrap();

    assert_eq!(changes, vec![VmStateChange::new("web-1", Some(c.host_b.clone()), PowerState::Running)]);
    let cached = c.reconciler.table().get("c1", "web-1").unwrap().unwrap();
    assert_eq!(cached.host.as_deref(), Some(c.host_b.as_str()));
}

#[tokio::test]
async fn test_migration_completion_reported() {
    let c = cluster();
    c.mock.add_vm("web-1", Some(c.host_b.as_str()), "Running");
    let conn = c.pool.get_connection("pool-1", MASTER, &c.creds).await.unwrap();
    c.reconciler.table().put("c1", Some(c.host_a.as_str()), "web-1", PowerState::Migrating).unwrap();

    let changes = c.reconciler.delta_sync("c1", &conn).await.unwrap();

    assert_eq!(changes, vec![VmStateChange::new("web-1", Some(c.host_b.clone()), PowerState::Running)]);
}

#[tokio::test]
async fn test_stopping_vm_ignores_running_report() {
    let c = cluster();
    c.mock.add_vm("web-1", Some(c.host_a.as_str()), "Running");
    let conn = c.pool.get_connection("pool-1", MASTER, &c.creds).await.unwrap();
    c.reconciler.table().put("c1", Some(c.host_a.as_str()), "web-1", PowerState::Stopping).unwrap();

    let changes = c.reconciler.delta_sync("c1", &conn).await.unwrap();

    assert!(changes.is_empty());
    let cached = c.reconciler.table().get("c1", "web-1").unwrap().unwrap();
    assert_eq!(cached.state, PowerState::Stopping);
}

#[tokio::test]
async fn test_vanished_running_vm_reported_stopped() {
    let c = cluster();
    c.mock.add_vm("web-1", Some(c.host_a.as_str()), "Running");
    let conn = c.pool.get_connection("pool-1", MASTER, &c.creds).await.unwrap();
    c.reconciler.full_sync("c1", &conn).await.unwrap();

    c.mock.remove_vm("web-1");
    let changes = c.reconciler.delta_sync("c1", &conn).await.unwrap();

    assert_eq!(changes, vec![VmStateChange::new("web-1", Some(c.host_a.clone()), PowerState::Stopped)]);
    assert!(c.reconciler.table().get("c1", "web-1").unwrap().is_none());
}

#[tokio::test]
async fn test_new_vm_reported() {
    let c = cluster();
    let conn = c.pool.get_connection("pool-1", MASTER, &c.creds).await.unwrap();
    c.reconciler.full_sync("c1", &conn).await.unwrap();

    c.mock.add_vm("web-9", Some(c.host_b.as_str()), "Running");
    let changes = c.reconciler.delta_sync("c1", &conn).await.unwrap();

    assert_eq!(changes, vec![VmStateChange::new("web-9", Some(c.host_b.clone()), PowerState::Running)]);
}
