use std::sync::{Arc, Mutex};
use std::time::Duration;

use storefront_db::prelude::*;
use storefront_db::{SqliteConnection, TxState};
use tempfile::TempDir;

async fn setup(dir: &TempDir) -> Result<Database, StoreError> {
    let url = dir.path().join("tx.db").to_string_lossy().into_owned();
    let db = Database::open(StoreOptions::builder(url).pool_size(4).finish()?).await?;
    db.execute_batch(
        "CREATE TABLE purchase (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            uuid TEXT NOT NULL UNIQUE,
            total REAL NOT NULL
        );",
    )
    .await?;
    Ok(db)
}

async fn purchase_count(db: &Database) -> Result<i64, StoreError> {
    let row = db.get("SELECT COUNT(*) AS cnt FROM purchase", &[]).await?;
    let cnt = row
        .as_ref()
        .and_then(|r| r.get("cnt"))
        .and_then(RowValues::as_int)
        .copied()
        .ok_or_else(|| StoreError::ExecutionError("missing count".into()))?;
    Ok(cnt)
}

#[tokio::test]
async fn begin_commit_rollback_exclusivity() -> Result<(), StoreError> {
    let dir = TempDir::new().expect("tempdir");
    let db = setup(&dir).await?;
    let conn = db.connection().await?;

    conn.begin().await?;
    let err = conn.begin().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AlreadyInTransaction);
    assert!(conn.in_transaction());

    conn.commit().await?;
    let err = conn.commit().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NoActiveTransaction);

    // rollback without a transaction is a no-op, not an error
    conn.rollback().await?;
    assert!(!conn.in_transaction());
    Ok(())
}

#[tokio::test]
async fn transactional_and_plain_entry_points_do_not_mix() -> Result<(), StoreError> {
    let dir = TempDir::new().expect("tempdir");
    let db = setup(&dir).await?;
    let conn = db.connection().await?;

    let err = conn
        .execute_dml_in_tx("DELETE FROM purchase", Default::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NoActiveTransaction);

    conn.begin().await?;
    let err = conn
        .execute_dml("DELETE FROM purchase", Default::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Execution);
    conn.rollback().await?;
    Ok(())
}

#[tokio::test]
async fn scoped_transaction_commits_and_closes_its_connection() -> Result<(), StoreError> {
    let dir = TempDir::new().expect("tempdir");
    let db = setup(&dir).await?;
    let before = db.metrics();

    let (conn, last_id) = db
        .transaction(|tx| async move {
            tx.run(
                "INSERT INTO purchase (uuid, total) VALUES (?1, ?2)",
                &["p-1".into(), 19.5.into()],
            )
            .await?;
            let res = tx
                .run(
                    "INSERT INTO purchase (uuid, total) VALUES (?1, ?2)",
                    &["p-2".into(), 5.0.into()],
                )
                .await?;
            Ok((Arc::clone(tx.connection()), res.last_insert_id))
        })
        .await?;

    assert_eq!(last_id, 2);
    assert!(conn.is_closed());
    assert!(!db.pool().contains(conn.id()));
    assert_eq!(purchase_count(&db).await?, 2);

    let after = db.metrics();
    assert_eq!(after.total_transactions, before.total_transactions + 1);
    assert_eq!(after.connections_closed, before.connections_closed + 1);
    assert_eq!(after.total_transaction_errors, before.total_transaction_errors);
    Ok(())
}

#[tokio::test]
async fn failing_callback_rolls_back_and_wraps_the_error() -> Result<(), StoreError> {
    let dir = TempDir::new().expect("tempdir");
    let db = setup(&dir).await?;
    let seen: Arc<Mutex<Option<Arc<SqliteConnection>>>> = Arc::new(Mutex::new(None));
    let before = db.metrics();

    let slot = Arc::clone(&seen);
    let err = db
        .transaction(move |tx| async move {
            *slot.lock().unwrap() = Some(Arc::clone(tx.connection()));
            tx.run(
                "INSERT INTO purchase (uuid, total) VALUES (?1, ?2)",
                &["p-boom".into(), 1.0.into()],
            )
            .await?;
            Err::<(), _>(StoreError::other("boom"))
        })
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::TransactionFailed);
    assert_eq!(err.root_kind(), ErrorKind::Other);
    assert!(err.to_string().contains("boom"), "got: {err}");
    assert!(err.rollback_error().is_none());

    let conn = seen.lock().unwrap().take().expect("callback ran");
    assert!(conn.is_closed());
    assert!(!conn.in_transaction());
    assert!(!db.pool().contains(conn.id()));
    assert_eq!(purchase_count(&db).await?, 0);

    let after = db.metrics();
    assert_eq!(after.connections_closed, before.connections_closed + 1);
    assert_eq!(after.total_transaction_errors, before.total_transaction_errors + 1);
    Ok(())
}

#[tokio::test]
async fn failed_rollback_is_reported_next_to_the_cause() -> Result<(), StoreError> {
    let dir = TempDir::new().expect("tempdir");
    let db = setup(&dir).await?;
    let before = db.metrics();

    let err = db
        .transaction(|tx| async move {
            tx.connection().set_force_rollback_busy_for_tests(true);
            tx.run(
                "INSERT INTO purchase (uuid, total) VALUES (?1, ?2)",
                &["p-stuck".into(), 2.0.into()],
            )
            .await?;
            Err::<(), _>(StoreError::other("boom"))
        })
        .await
        .unwrap_err();

    assert_eq!(err.root_kind(), ErrorKind::Other);
    let rollback = err.rollback_error().expect("rollback failure recorded");
    assert_eq!(rollback.kind(), ErrorKind::RollbackFailed);

    // closing the handle still discards the uncommitted insert
    assert_eq!(purchase_count(&db).await?, 0);
    assert_eq!(db.pool().size(), 1);
    // one failed transaction, however many steps of it failed
    let after = db.metrics();
    assert_eq!(after.total_transaction_errors, before.total_transaction_errors + 1);
    Ok(())
}

#[tokio::test]
async fn explicit_transaction_handle_lifecycle() -> Result<(), StoreError> {
    let dir = TempDir::new().expect("tempdir");
    let db = setup(&dir).await?;

    let mut tx = db.begin_transaction().await?;
    assert_eq!(tx.state(), TxState::Active);
    assert!(db.pool().contains(tx.connection().id()));
    let handle = tx.handle();
    handle
        .run(
            "INSERT INTO purchase (uuid, total) VALUES (?1, ?2)",
            &["p-explicit".into(), 7.25.into()],
        )
        .await?;
    let inside = handle
        .get("SELECT total FROM purchase WHERE uuid = ?1", &["p-explicit".into()])
        .await?
        .expect("row visible inside its transaction");
    assert_eq!(inside.get("total").and_then(RowValues::as_float), Some(7.25));

    tx.commit().await?;
    assert_eq!(tx.state(), TxState::Committed);
    assert!(tx.connection().is_closed());
    assert!(!db.pool().contains(tx.connection().id()));

    let err = tx.commit().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NoActiveTransaction);
    tx.rollback().await?;

    let err = handle.run("DELETE FROM purchase", &[]).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NoActiveTransaction);

    assert_eq!(purchase_count(&db).await?, 1);
    Ok(())
}

#[tokio::test]
async fn explicit_rollback_discards_writes() -> Result<(), StoreError> {
    let dir = TempDir::new().expect("tempdir");
    let db = setup(&dir).await?;

    let before = db.metrics();
    let mut tx = db.begin_transaction().await?;
    tx.handle()
        .execute_batch("INSERT INTO purchase (uuid, total) VALUES ('a', 1), ('b', 2);")
        .await?;
    assert_eq!(db.metrics().total_queries, before.total_queries + 1);
    tx.rollback().await?;
    assert_eq!(tx.state(), TxState::RolledBack);
    assert!(tx.connection().is_closed());
    assert_eq!(purchase_count(&db).await?, 0);
    Ok(())
}

#[tokio::test]
async fn dropped_transaction_is_rolled_back_and_released() -> Result<(), StoreError> {
    let dir = TempDir::new().expect("tempdir");
    let db = setup(&dir).await?;

    let tx = db.begin_transaction().await?;
    let conn = Arc::clone(tx.connection());
    tx.handle()
        .run(
            "INSERT INTO purchase (uuid, total) VALUES (?1, ?2)",
            &["p-dropped".into(), 3.0.into()],
        )
        .await?;
    drop(tx);

    for _ in 0..100 {
        if conn.is_closed() && !db.pool().contains(conn.id()) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(conn.is_closed());
    assert!(!db.pool().contains(conn.id()));
    assert_eq!(purchase_count(&db).await?, 0);
    Ok(())
}

#[tokio::test]
async fn statements_run_in_submission_order_within_a_transaction() -> Result<(), StoreError> {
    let dir = TempDir::new().expect("tempdir");
    let db = setup(&dir).await?;

    let totals = db
        .transaction(|tx| async move {
            for i in 1..=5 {
                tx.run(
                    "INSERT INTO purchase (uuid, total) VALUES (?1, ?2)",
                    &[format!("p-{i}").into(), f64::from(i).into()],
                )
                .await?;
            }
            tx.run("UPDATE purchase SET total = total * 10 WHERE id <= 2", &[])
                .await?;
            tx.all("SELECT total FROM purchase ORDER BY id", &[]).await
        })
        .await?;

    let totals: Vec<f64> = totals
        .iter()
        .filter_map(|row| row.get("total").and_then(RowValues::as_float))
        .collect();
    assert_eq!(totals, vec![10.0, 20.0, 3.0, 4.0, 5.0]);
    Ok(())
}

#[tokio::test]
async fn deferred_constraint_fails_the_commit() -> Result<(), StoreError> {
    let dir = TempDir::new().expect("tempdir");
    let db = setup(&dir).await?;
    db.execute_batch(
        "CREATE TABLE basket (id INTEGER PRIMARY KEY);
        CREATE TABLE basket_line (
            id INTEGER PRIMARY KEY,
            basket_id INTEGER NOT NULL
                REFERENCES basket(id) DEFERRABLE INITIALLY DEFERRED
        );",
    )
    .await?;
    let before = db.metrics();

    let mut tx = db.begin_transaction().await?;
    // deferred: the orphan line is accepted until COMMIT
    tx.handle()
        .run("INSERT INTO basket_line (basket_id) VALUES (?1)", &[RowValues::Int(42)])
        .await?;

    let err = tx.commit().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CommitFailed);
    assert_eq!(tx.state(), TxState::RolledBack);
    assert!(!tx.connection().in_transaction());
    assert!(tx.connection().is_closed());
    assert!(!db.pool().contains(tx.connection().id()));

    let after = db.metrics();
    assert_eq!(after.total_transaction_errors, before.total_transaction_errors + 1);

    let lines = db
        .get("SELECT COUNT(*) AS n FROM basket_line", &[])
        .await?
        .and_then(|r| r.get("n").and_then(RowValues::as_int).copied());
    assert_eq!(lines, Some(0));
    Ok(())
}

#[tokio::test]
async fn begin_on_a_locked_store_fails_to_start() -> Result<(), StoreError> {
    let dir = TempDir::new().expect("tempdir");
    let url = dir.path().join("locked.db").to_string_lossy().into_owned();
    let db = Database::open(StoreOptions::builder(url.as_str()).busy_timeout_ms(20).finish()?).await?;
    db.execute_batch("CREATE TABLE purchase (id INTEGER PRIMARY KEY);").await?;
    let before = db.metrics();
    let pool_size = db.pool().size();

    let blocker = rusqlite::Connection::open(&url).expect("raw connection");
    blocker.execute_batch("BEGIN EXCLUSIVE").expect("take write lock");

    let err = db.begin_transaction().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TransactionStartFailed);
    assert_eq!(db.pool().size(), pool_size, "failed begin leaves nothing registered");

    let after = db.metrics();
    assert_eq!(after.total_transaction_errors, before.total_transaction_errors + 1);
    assert_eq!(after.total_transactions, before.total_transactions);
    assert_eq!(after.connections_closed, before.connections_closed + 1);

    blocker.execute_batch("ROLLBACK").expect("release write lock");
    Ok(())
}
