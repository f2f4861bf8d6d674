use std::collections::HashSet;
use std::sync::Arc;

use storefront_db::{ConnectionPool, ErrorKind, MetricsRegistry, StoreError, StoreOptions};
use tempfile::TempDir;

fn options(dir: &TempDir, pool_size: usize) -> StoreOptions {
    StoreOptions::builder(dir.path().join("pool.db").to_string_lossy().into_owned())
        .pool_size(pool_size)
        .finish()
        .expect("valid options")
}

fn fresh_pool(opts: &StoreOptions) -> (ConnectionPool, Arc<MetricsRegistry>) {
    let metrics = Arc::new(MetricsRegistry::new());
    (ConnectionPool::from_options(opts, Arc::clone(&metrics)), metrics)
}

#[tokio::test]
async fn third_acquire_evicts_the_first_connection() -> Result<(), StoreError> {
    let dir = TempDir::new().expect("tempdir");
    let opts = options(&dir, 2);
    let (pool, metrics) = fresh_pool(&opts);

    let a = pool.acquire("a", &opts).await?;
    let b = pool.acquire("b", &opts).await?;
    assert_eq!(pool.size(), 2);

    let c = pool.acquire("c", &opts).await?;
    assert_eq!(pool.size(), 2);
    assert!(!pool.contains(a.id()), "oldest connection should be evicted");
    assert!(a.is_closed(), "evicted connection should be closed");
    assert!(pool.contains(b.id()));
    assert!(pool.contains(c.id()));
    assert_eq!(pool.ids(), vec![b.id().to_owned(), c.id().to_owned()]);

    let snap = metrics.snapshot(pool.size());
    assert_eq!(snap.connections_opened, 3);
    assert_eq!(snap.connections_closed, 1);
    assert_eq!(snap.active_connections, 2);
    Ok(())
}

#[tokio::test]
async fn pool_never_settles_above_max_size() -> Result<(), StoreError> {
    let dir = TempDir::new().expect("tempdir");
    let opts = options(&dir, 3);
    let (pool, _metrics) = fresh_pool(&opts);

    for i in 0..12 {
        pool.acquire(&format!("repo-{i}"), &opts).await?;
        assert!(pool.size() <= 3, "pool grew to {} after acquire {i}", pool.size());
    }
    assert_eq!(pool.size(), 3);
    Ok(())
}

#[tokio::test]
async fn named_acquire_reuses_idle_connection() -> Result<(), StoreError> {
    let dir = TempDir::new().expect("tempdir");
    let opts = options(&dir, 4);
    let (pool, metrics) = fresh_pool(&opts);

    let first = pool.acquire("default", &opts).await?;
    let second = pool.acquire("default", &opts).await?;
    assert_eq!(first.id(), second.id());
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(pool.size(), 1);
    assert_eq!(metrics.snapshot(pool.size()).connections_opened, 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_cold_acquires_share_one_connection() -> Result<(), StoreError> {
    let dir = TempDir::new().expect("tempdir");
    let opts = options(&dir, 4);
    let (pool, metrics) = fresh_pool(&opts);
    let pool = Arc::new(pool);

    let mut tasks = tokio::task::JoinSet::new();
    for _ in 0..16 {
        let pool = Arc::clone(&pool);
        let opts = opts.clone();
        tasks.spawn(async move { pool.acquire("default", &opts).await });
    }
    let mut ids = HashSet::new();
    while let Some(joined) = tasks.join_next().await {
        let conn = joined.expect("acquire task")?;
        ids.insert(conn.id().to_owned());
    }

    assert_eq!(ids.len(), 1, "every caller gets the same connection: {ids:?}");
    assert_eq!(pool.size(), 1);
    let snap = metrics.snapshot(pool.size());
    assert_eq!(snap.connections_opened, 1, "only one handle is opened");
    assert_eq!(snap.connections_closed, 0);
    Ok(())
}

#[tokio::test]
async fn connection_in_transaction_is_not_shared_or_evicted() -> Result<(), StoreError> {
    let dir = TempDir::new().expect("tempdir");
    let opts = options(&dir, 1);
    let (pool, _metrics) = fresh_pool(&opts);

    let busy = pool.acquire("default", &opts).await?;
    busy.begin().await?;

    let other = pool.acquire("default", &opts).await?;
    assert_ne!(busy.id(), other.id(), "busy connection must not be handed out");
    assert!(pool.contains(busy.id()), "busy connection must not be evicted");
    assert!(!busy.is_closed());
    assert_eq!(pool.size(), 2);

    busy.rollback().await?;

    // back to idle: the next registration trims the pool to max_size again
    let third = pool.acquire("reports", &opts).await?;
    assert_eq!(pool.size(), 1);
    assert!(pool.contains(third.id()));
    Ok(())
}

#[tokio::test]
async fn ceiling_reports_pool_exhausted() -> Result<(), StoreError> {
    let dir = TempDir::new().expect("tempdir");
    let opts = StoreOptions::builder(dir.path().join("pool.db").to_string_lossy().into_owned())
        .pool_size(1)
        .max_overflow(1)
        .finish()?;
    let (pool, metrics) = fresh_pool(&opts);

    // separate files so both writers can hold BEGIN IMMEDIATE at once
    let mut held = Vec::new();
    for i in 0..2 {
        let mut tx_opts = opts.clone();
        tx_opts.url = dir.path().join(format!("tx{i}.db")).to_string_lossy().into_owned();
        let conn = pool.open_dedicated(&tx_opts).await?;
        conn.begin().await?;
        pool.register("tx", Arc::clone(&conn)).await?;
        held.push(conn);
    }
    assert_eq!(pool.size(), 2);

    let err = pool.acquire("default", &opts).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConnectionPoolExhausted);
    assert_eq!(pool.size(), 2);

    let snap = metrics.snapshot(pool.size());
    assert_eq!(snap.connections_opened, 3);
    assert_eq!(snap.connections_closed, 1, "rejected connection is closed");

    for conn in held {
        conn.rollback().await?;
    }
    Ok(())
}

#[tokio::test]
async fn close_all_empties_the_pool() -> Result<(), StoreError> {
    let dir = TempDir::new().expect("tempdir");
    let opts = options(&dir, 5);
    let (pool, metrics) = fresh_pool(&opts);

    let conns = vec![
        pool.acquire("a", &opts).await?,
        pool.acquire("b", &opts).await?,
        pool.acquire("c", &opts).await?,
    ];
    assert_eq!(pool.close_all().await, 3);
    assert_eq!(pool.size(), 0);
    assert!(conns.iter().all(|c| c.is_closed()));
    assert_eq!(metrics.snapshot(0).connections_closed, 3);

    // statements on a closed handle fail cleanly
    let err = conns[0]
        .execute_select("SELECT 1", storefront_db::sqlite::Params::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConnectionFailed);

    // closing twice is harmless
    conns[0].close().await?;
    pool.close("a:0").await?;
    Ok(())
}

#[tokio::test]
async fn close_named_only_touches_that_name() -> Result<(), StoreError> {
    let dir = TempDir::new().expect("tempdir");
    let opts = options(&dir, 5);
    let (pool, _metrics) = fresh_pool(&opts);

    let writer = pool.acquire("writer", &opts).await?;
    let reader = pool.acquire("reader", &opts).await?;
    pool.close_named("writer").await?;
    assert!(writer.is_closed());
    assert!(!reader.is_closed());
    assert_eq!(pool.ids(), vec![reader.id().to_owned()]);

    let status = pool.status();
    assert_eq!(status.size, 1);
    assert_eq!(status.idle, 1);
    assert_eq!(status.in_transaction, 0);
    Ok(())
}
