use std::sync::{Arc, Barrier};
use std::time::Duration;

use tempfile::TempDir;
use usermgr_db::{
    build_connection_identifier, provision_with, DbError, ExecutionModel, IsolationMode,
    PoolSettings, SessionFactory,
};
use usermgr_users::{verify_secret, Argon2Params, AsyncUserDao, UserDao, UserError};

const FAST: Argon2Params = Argon2Params {
    memory_kib: 64,
    iterations: 1,
    parallelism: 1,
};

fn sessions(model: ExecutionModel) -> (TempDir, SessionFactory) {
    let dir = TempDir::new().expect("temp dir");
    let path = dir.path().join("users.db");
    let identifier = build_connection_identifier(
        "root",
        "root",
        "localhost:3306",
        path.to_str().expect("utf-8 path"),
        "sqlite+rusqlite",
    )
    .expect("identifier");
    let engine = provision_with(
        &identifier,
        IsolationMode::RepeatableRead,
        model,
        PoolSettings {
            acquire_timeout: Duration::from_secs(5),
            ..PoolSettings::default()
        },
    )
    .expect("engine");
    engine.run_migrations().expect("migrations");
    (dir, SessionFactory::new(Arc::new(engine)))
}

fn dao() -> (TempDir, UserDao) {
    let (dir, sessions) = sessions(ExecutionModel::Blocking);
    (dir, UserDao::new(sessions).with_hash_params(FAST))
}

#[test]
fn create_user_returns_storage_assigned_values() {
    let (_dir, dao) = dao();

    let user = dao.create_user("alice", "s3cret").expect("create");

    assert_eq!(user.id, 1);
    assert_eq!(user.username, "alice");
    assert_ne!(user.secret_hash, "s3cret");
    assert!(verify_secret("s3cret", &user.secret_hash).expect("verify"));
    assert_eq!(user.created_at, user.updated_at);
}

#[test]
fn created_user_is_visible_to_the_next_scope() {
    let (_dir, dao) = dao();
    let created = dao.create_user("bob", "pw").expect("create");

    let fetched = dao.get_user(created.id).expect("get");
    assert_eq!(fetched, created);

    let by_name = dao
        .get_user_by_username("bob")
        .expect("lookup")
        .expect("exists");
    assert_eq!(by_name.id, created.id);
    assert!(dao.get_user_by_username("nobody").expect("lookup").is_none());
}

#[test]
fn duplicate_username_is_rejected_and_first_user_kept() {
    let (_dir, dao) = dao();
    let first = dao.create_user("carol", "one").expect("first create");

    let err = dao
        .create_user("carol", "two")
        .expect_err("duplicate username");
    assert!(
        matches!(&err, UserError::UsernameTaken(name) if name == "carol"),
        "got {err:?}"
    );

    let stored = dao.get_user(first.id).expect("get");
    assert!(verify_secret("one", &stored.secret_hash).expect("verify"));
    assert_eq!(
        dao.sessions().engine().state().idle_connections,
        dao.sessions().engine().state().connections
    );
}

#[test]
fn invalid_usernames_never_reach_storage() {
    let (_dir, dao) = dao();

    assert!(matches!(
        dao.create_user("", "pw"),
        Err(UserError::InvalidUsername(_))
    ));
    assert!(matches!(
        dao.create_user(&"x".repeat(256), "pw"),
        Err(UserError::InvalidUsername(_))
    ));
    assert_eq!(dao.sessions().engine().state().connections, 1);
}

#[test]
fn concurrent_creates_of_one_username_yield_exactly_one_user() {
    let (_dir, dao) = dao();
    let barrier = Arc::new(Barrier::new(2));

    let handles: Vec<_> = (0..2)
        .map(|i| {
            let dao = dao.clone();
            let barrier = Arc::clone(&barrier);
            std::thread::spawn(move || {
                barrier.wait();
                dao.create_user("dave", &format!("secret-{i}"))
            })
        })
        .collect();

    let results: Vec<_> = handles
        .into_iter()
        .map(|h| h.join().expect("thread"))
        .collect();

    let created = results.iter().filter(|r| r.is_ok()).count();
    let taken = results
        .iter()
        .filter(|r| matches!(r, Err(UserError::UsernameTaken(_))))
        .count();
    assert_eq!((created, taken), (1, 1), "results: {results:?}");
}

#[test]
fn update_secret_rehashes() {
    let (_dir, dao) = dao();
    let user = dao.create_user("erin", "old").expect("create");

    let updated = dao.update_secret(user.id, "new").expect("update");

    assert_eq!(updated.id, user.id);
    assert_ne!(updated.secret_hash, user.secret_hash);
    assert!(updated.updated_at >= user.updated_at);
    assert!(dao.authenticate("erin", "new").expect("auth").is_some());
    assert!(dao.authenticate("erin", "old").expect("auth").is_none());
    assert!(matches!(
        dao.update_secret(user.id + 1, "x"),
        Err(UserError::NotFound(_))
    ));
}

#[test]
fn delete_user_removes_the_record() {
    let (_dir, dao) = dao();
    let user = dao.create_user("frank", "pw").expect("create");

    dao.delete_user(user.id).expect("delete");

    assert!(matches!(dao.get_user(user.id), Err(UserError::NotFound(id)) if id == user.id));
    assert!(matches!(
        dao.delete_user(user.id),
        Err(UserError::NotFound(_))
    ));
    dao.create_user("frank", "again").expect("username is free again");
}

#[test]
fn authenticate_distinguishes_nothing_to_the_caller() {
    let (_dir, dao) = dao();
    dao.create_user("grace", "pw").expect("create");

    assert!(dao.authenticate("grace", "pw").expect("auth").is_some());
    assert!(dao.authenticate("grace", "nope").expect("auth").is_none());
    assert!(dao.authenticate("heidi", "pw").expect("auth").is_none());
}

#[test]
fn database_errors_pass_through() {
    let (_dir, dao) = dao();
    dao.sessions().engine().dispose();

    let err = dao.create_user("ivan", "pw").expect_err("engine disposed");
    assert!(
        matches!(err, UserError::Db(DbError::Connection(_))),
        "got {err:?}"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn async_repository_round_trip() {
    let (_dir, sessions) = sessions(ExecutionModel::NonBlocking);
    let dao = AsyncUserDao::new(sessions).with_hash_params(FAST);

    let user = dao.create_user("judy", "pw").await.expect("create");
    assert!(user.id > 0);

    let err = dao
        .create_user("judy", "pw2")
        .await
        .expect_err("duplicate");
    assert!(matches!(err, UserError::UsernameTaken(_)), "got {err:?}");

    let fetched = dao.get_user(user.id).await.expect("get");
    assert_eq!(fetched, user);
    assert!(dao.authenticate("judy", "pw").await.expect("auth").is_some());

    let updated = dao.update_secret(user.id, "pw3").await.expect("update");
    assert!(verify_secret("pw3", &updated.secret_hash).expect("verify"));

    dao.delete_user(user.id).await.expect("delete");
    assert!(dao
        .get_user_by_username("judy")
        .await
        .expect("lookup")
        .is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn async_creates_beyond_the_pool_size_all_complete() {
    let (_dir, sessions) = sessions(ExecutionModel::NonBlocking);
    let dao = AsyncUserDao::new(sessions).with_hash_params(FAST);

    let mut tasks = Vec::new();
    for i in 0..15 {
        let dao = dao.clone();
        tasks.push(tokio::spawn(async move {
            dao.create_user(&format!("user-{i}"), "pw").await
        }));
    }

    let mut ids = Vec::new();
    for task in tasks {
        ids.push(task.await.expect("task").expect("create").id);
    }
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), 15);
    assert!(dao.sessions().engine().state().connections <= 5);
}
