use std::time::Duration;

use pretty_assertions::assert_eq;

use super::{MockServer, ServerRole};
use crate::{
    error::ErrorKind,
    options::{ClientOptions, ServerAddress},
    pool::{ConnectionPool, DriverStatus},
    read_preference::ReadPreference,
    session::Session,
};

fn base_options(hosts: Vec<ServerAddress>) -> ClientOptions {
    ClientOptions::builder()
        .hosts(hosts)
        .connect_timeout(Duration::from_millis(500))
        .reply_timeout(Duration::from_millis(500))
        .wait_queue_timeout(Duration::from_millis(200))
        .retry_backoff(Duration::from_millis(10))
        // Far enough out that tests control when (whether) health checks run.
        .heartbeat_frequency(Duration::from_secs(3600))
        .build()
}

/// A primary/secondary pair of mock servers wired to announce each other.
async fn replica_set() -> (MockServer, MockServer) {
    let primary = MockServer::start(ServerRole::Standalone).await;
    let secondary = MockServer::start(ServerRole::Standalone).await;
    let hosts = vec![primary.address_string(), secondary.address_string()];

    primary.set_role(ServerRole::Primary {
        set_name: "rs0".to_string(),
        hosts: hosts.clone(),
    });
    secondary.set_role(ServerRole::Secondary {
        set_name: "rs0".to_string(),
        hosts,
        primary: Some(primary.address_string()),
    });
    (primary, secondary)
}

#[tokio::test]
async fn released_connection_is_reused_before_dialing() {
    let server = MockServer::start(ServerRole::Standalone).await;
    let pool = ConnectionPool::connect(base_options(vec![server.address()]))
        .await
        .unwrap();
    assert_eq!(pool.status(), DriverStatus::Connected);

    let conn = pool.check_out(ReadPreference::Primary).await.unwrap();
    let first_id = conn.id();
    pool.check_in(conn);

    let conn = pool.check_out(ReadPreference::Primary).await.unwrap();
    assert_eq!(conn.id(), first_id, "idle reuse must win over a new dial");
    pool.check_in(conn);
    pool.close().await;
}

#[tokio::test]
async fn exhausted_host_blocks_then_fails_without_overdialing() {
    let server = MockServer::start(ServerRole::Standalone).await;
    let mut options = base_options(vec![server.address()]);
    options.max_pool_size = 1;
    options.min_pool_size = 1;
    let pool = ConnectionPool::connect(options).await.unwrap();

    let held = pool.check_out(ReadPreference::Primary).await.unwrap();

    let started = std::time::Instant::now();
    let err = pool.check_out(ReadPreference::Primary).await.unwrap_err();
    assert!(matches!(err.kind.as_ref(), ErrorKind::PoolExhausted { .. }));
    assert!(
        started.elapsed() >= Duration::from_millis(150),
        "the borrower should have waited for the wait-queue timeout"
    );
    assert_eq!(
        server.accepted_connections(),
        1,
        "a host at its cap must never be over-dialed"
    );

    pool.check_in(held);
    pool.close().await;
}

#[tokio::test]
async fn waiting_borrower_gets_the_returned_connection() {
    let server = MockServer::start(ServerRole::Standalone).await;
    let mut options = base_options(vec![server.address()]);
    options.max_pool_size = 1;
    options.wait_queue_timeout = Duration::from_secs(5);
    let pool = ConnectionPool::connect(options).await.unwrap();

    let held = pool.check_out(ReadPreference::Primary).await.unwrap();
    let held_id = held.id();

    let waiter = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.check_out(ReadPreference::Primary).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    pool.check_in(held);

    let conn = waiter.await.unwrap().unwrap();
    assert_eq!(conn.id(), held_id);
    pool.check_in(conn);
    pool.close().await;
}

#[tokio::test]
async fn unreachable_seed_is_pruned() {
    let server = MockServer::start(ServerRole::Standalone).await;

    // Bind a port and immediately free it so dialing it is refused.
    let dead = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_address = ServerAddress::new("127.0.0.1", dead.local_addr().unwrap().port());
    drop(dead);

    let mut options = base_options(vec![server.address(), dead_address.clone()]);
    options.retries_on_network_error = 2;
    let pool = ConnectionPool::connect(options).await.unwrap();

    assert_eq!(pool.hosts(), vec![server.address()]);
    assert!(!pool.hosts().contains(&dead_address));
    pool.close().await;
}

#[tokio::test]
async fn connect_fails_when_no_seed_is_reachable() {
    let dead = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_address = ServerAddress::new("127.0.0.1", dead.local_addr().unwrap().port());
    drop(dead);

    let mut options = base_options(vec![dead_address]);
    options.retries_on_network_error = 1;
    let err = ConnectionPool::connect(options).await.unwrap_err();
    assert!(matches!(err.kind.as_ref(), ErrorKind::Topology { .. }));
}

#[tokio::test]
async fn primary_discovery_and_membership_recording() {
    let (primary, secondary) = replica_set().await;
    let pool = ConnectionPool::connect(base_options(vec![
        primary.address(),
        secondary.address(),
    ]))
    .await
    .unwrap();

    assert_eq!(pool.primary(), Some(primary.address()));
    let hosts = pool.hosts();
    assert!(hosts.contains(&primary.address()));
    assert!(hosts.contains(&secondary.address()));
    pool.close().await;
}

#[tokio::test]
async fn membership_announcement_adds_unseeded_hosts() {
    let (primary, secondary) = replica_set().await;

    // Seed only the primary; the secondary is learned from the announcement.
    let pool = ConnectionPool::connect(base_options(vec![primary.address()]))
        .await
        .unwrap();

    assert!(pool.hosts().contains(&secondary.address()));
    pool.close().await;
}

#[tokio::test]
async fn read_preferences_select_the_right_member() {
    let (primary, secondary) = replica_set().await;
    let pool = ConnectionPool::connect(base_options(vec![
        primary.address(),
        secondary.address(),
    ]))
    .await
    .unwrap();

    let conn = pool.check_out(ReadPreference::Primary).await.unwrap();
    assert_eq!(conn.address(), &primary.address());
    pool.check_in(conn);

    let conn = pool.check_out(ReadPreference::Secondary).await.unwrap();
    assert_eq!(conn.address(), &secondary.address());
    pool.check_in(conn);

    let conn = pool
        .check_out(ReadPreference::SecondaryPreferred)
        .await
        .unwrap();
    assert_eq!(conn.address(), &secondary.address());
    pool.check_in(conn);

    // Nearest never fails outright on a healthy deployment.
    let conn = pool.check_out(ReadPreference::Nearest).await.unwrap();
    pool.check_in(conn);
    pool.close().await;
}

#[tokio::test]
async fn transactions_force_primary_reads() {
    let (primary, secondary) = replica_set().await;
    let pool = ConnectionPool::connect(base_options(vec![
        primary.address(),
        secondary.address(),
    ]))
    .await
    .unwrap();

    let mut session = Session::new();
    session.start_transaction().unwrap();

    let conn = pool
        .check_out_in_session(ReadPreference::Secondary, Some(&session))
        .await
        .unwrap();
    assert_eq!(
        conn.address(),
        &primary.address(),
        "an active transaction must pin reads to the primary"
    );
    pool.check_in(conn);

    session.abort_transaction(&pool).await.unwrap();
    let conn = pool
        .check_out_in_session(ReadPreference::Secondary, Some(&session))
        .await
        .unwrap();
    assert_eq!(conn.address(), &secondary.address());
    pool.check_in(conn);
    pool.close().await;
}

#[tokio::test]
async fn delisted_host_is_dropped_with_its_connections() {
    let (primary, secondary) = replica_set().await;
    let mut options = base_options(vec![primary.address(), secondary.address()]);
    options.heartbeat_frequency = Duration::from_millis(100);
    let pool = ConnectionPool::connect(options).await.unwrap();

    assert!(pool.hosts().contains(&secondary.address()));
    assert_eq!(pool.idle_connections(&secondary.address()), 1);

    // The primary stops listing the secondary.
    primary.set_role(ServerRole::Primary {
        set_name: "rs0".to_string(),
        hosts: vec![primary.address_string()],
    });

    let mut waited = Duration::ZERO;
    while pool.hosts().contains(&secondary.address()) && waited < Duration::from_secs(5) {
        tokio::time::sleep(Duration::from_millis(50)).await;
        waited += Duration::from_millis(50);
    }

    assert!(
        !pool.hosts().contains(&secondary.address()),
        "a de-listed host must leave the live host list"
    );
    assert_eq!(pool.idle_connections(&secondary.address()), 0);

    // No future borrow selects it: secondary selection now falls back to the primary.
    let conn = pool
        .check_out(ReadPreference::SecondaryPreferred)
        .await
        .unwrap();
    assert_eq!(conn.address(), &primary.address());
    pool.check_in(conn);
    pool.close().await;
}

#[tokio::test]
async fn monitor_restores_the_minimum_pool_size() {
    let server = MockServer::start(ServerRole::Standalone).await;
    let mut options = base_options(vec![server.address()]);
    options.min_pool_size = 2;
    options.max_pool_size = 4;
    options.heartbeat_frequency = Duration::from_millis(100);
    let pool = ConnectionPool::connect(options).await.unwrap();
    assert_eq!(pool.idle_connections(&server.address()), 2);

    // Borrow one and close it; the pool is now below its minimum.
    let conn = pool.check_out(ReadPreference::Primary).await.unwrap();
    pool.close_connection(conn).await;
    assert_eq!(pool.idle_connections(&server.address()), 1);

    let mut waited = Duration::ZERO;
    while pool.idle_connections(&server.address()) < 2 && waited < Duration::from_secs(5) {
        tokio::time::sleep(Duration::from_millis(50)).await;
        waited += Duration::from_millis(50);
    }
    assert_eq!(pool.idle_connections(&server.address()), 2);
    pool.close().await;
}

#[tokio::test]
async fn closed_pool_rejects_checkouts() {
    let server = MockServer::start(ServerRole::Standalone).await;
    let pool = ConnectionPool::connect(base_options(vec![server.address()]))
        .await
        .unwrap();
    pool.close().await;
    assert_eq!(pool.status(), DriverStatus::Disconnected);

    let err = pool.check_out(ReadPreference::Primary).await.unwrap_err();
    assert!(matches!(err.kind.as_ref(), ErrorKind::Topology { .. }));
}

#[tokio::test]
async fn dead_connections_are_not_requeued() {
    let server = MockServer::start(ServerRole::Standalone).await;
    let pool = ConnectionPool::connect(base_options(vec![server.address()]))
        .await
        .unwrap();

    let conn = pool.check_out(ReadPreference::Primary).await.unwrap();
    let closed_id = conn.id();
    conn.close().await;
    pool.check_in(conn);
    assert_eq!(pool.idle_connections(&server.address()), 0);

    let conn = pool.check_out(ReadPreference::Primary).await.unwrap();
    assert_ne!(conn.id(), closed_id, "a dead connection must not be reused");
    pool.check_in(conn);
    pool.close().await;
}
