use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use serde_json::Value;
use tempfile::TempDir;
use tower::ServiceExt;
use usermgr_db::{DbError, ExecutionModel};
use usermgr_server::{app, config::DatabaseConfig, startup, startup_async, StartupError};

fn database_config(name: String, execution: ExecutionModel) -> DatabaseConfig {
    DatabaseConfig {
        name,
        execution,
        acquire_timeout_ms: 200,
        ..DatabaseConfig::default()
    }
}

fn temp_database(execution: ExecutionModel) -> (TempDir, DatabaseConfig) {
    let dir = TempDir::new().expect("temp dir");
    let path = dir.path().join("usermgr.db");
    let config = database_config(path.to_str().expect("utf-8 path").to_string(), execution);
    (dir, config)
}

async fn get_health(router: axum::Router) -> (StatusCode, Value) {
    let response = router
        .oneshot(
            Request::builder()
                .uri("/health")
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");

    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    (status, serde_json::from_slice(&body).expect("json body"))
}

#[tokio::test]
async fn health_check_returns_ok() {
    let (_dir, config) = temp_database(ExecutionModel::Blocking);
    let state = startup(&config).expect("startup");

    let (status, json) = get_health(app(state)).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "ok");
    assert_eq!(json["version"], env!("CARGO_PKG_VERSION"));
    assert_eq!(json["pool"]["size"], 5);
}

#[tokio::test]
async fn health_check_reports_unavailable_database() {
    let (_dir, config) = temp_database(ExecutionModel::NonBlocking);
    let state = startup(&config).expect("startup");
    state.engine.dispose();

    let (status, json) = get_health(app(state)).await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert!(json["error"].as_str().is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn startup_applies_migrations_for_the_repository() {
    let (_dir, config) = temp_database(ExecutionModel::NonBlocking);
    let state = startup(&config).expect("startup");

    let user = state
        .users
        .create_user("alice", "pw")
        .await
        .expect("users table exists after startup");
    assert_eq!(user.username, "alice");

    // A second startup against the same file applies nothing new.
    let again = startup(&config).expect("restart");
    assert!(again
        .users
        .get_user_by_username("alice")
        .await
        .expect("lookup")
        .is_some());
}

#[tokio::test]
async fn blocking_startup_runs_off_the_async_worker() {
    let (_dir, config) = temp_database(ExecutionModel::Blocking);

    let state = startup_async(config).await.expect("startup");
    let (status, json) = get_health(app(state)).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "ok");
}

#[tokio::test]
async fn async_startup_reports_the_failed_step() {
    let config = database_config(
        "/nonexistent-usermgr-dir/sub/usermgr.db".to_string(),
        ExecutionModel::Blocking,
    );

    let err = startup_async(config)
        .await
        .expect_err("unreachable database");
    assert!(
        matches!(err, StartupError::Provision(DbError::Connection(_))),
        "got {err:?}"
    );
}

#[test]
fn blocking_startup_fails_when_the_database_is_unreachable() {
    let config = database_config(
        "/nonexistent-usermgr-dir/sub/usermgr.db".to_string(),
        ExecutionModel::Blocking,
    );

    let err = startup(&config).expect_err("unreachable database");
    assert!(
        matches!(err, StartupError::Provision(DbError::Connection(_))),
        "got {err:?}"
    );
}

#[test]
fn non_blocking_startup_fails_at_the_first_database_use() {
    let config = database_config(
        "/nonexistent-usermgr-dir/sub/usermgr.db".to_string(),
        ExecutionModel::NonBlocking,
    );

    let err = startup(&config).expect_err("unreachable database");
    assert!(
        matches!(err, StartupError::Migrate(DbError::Connection(_))),
        "got {err:?}"
    );
}

#[test]
fn malformed_credentials_fail_before_any_io() {
    let mut config = database_config("users.db".to_string(), ExecutionModel::Blocking);
    config.address = "bad host".to_string();

    let err = startup(&config).expect_err("invalid address");
    assert!(
        matches!(err, StartupError::Provision(DbError::Encoding(_))),
        "got {err:?}"
    );
}
