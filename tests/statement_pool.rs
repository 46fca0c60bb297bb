mod support;

use cubrs::{ExecuteFlag, PrepareFlag};
use support::{unique_endpoint, url_for, MockBroker};

#[tokio::test]
async fn closed_statements_are_reused_without_a_round_trip() {
    let broker = MockBroker::new();
    let endpoint = unique_endpoint("pool-reuse");
    let conn = cubrs::connect_with_url(broker.connector(), &url_for(&endpoint), None, None)
        .await
        .unwrap();

    let sql = "select a from t order by a";
    let first = cubrs::prepare(conn, sql, PrepareFlag::NONE).await.unwrap();
    cubrs::execute(first, ExecuteFlag::NONE).await.unwrap();
    cubrs::close_req_handle(first).await.unwrap();
    assert_eq!(broker.prepare_count(), 1);

    // same text: pulled from the pool, no server contact, fresh id
    let second = cubrs::prepare(conn, sql, PrepareFlag::NONE).await.unwrap();
    assert_ne!(first, second);
    assert_eq!(broker.prepare_count(), 1);

    // the recycled handle executes with its existing server-side statement
    cubrs::execute(second, ExecuteFlag::NONE).await.unwrap();
    assert_eq!(broker.prepare_count(), 1);

    cubrs::disconnect(conn).await.unwrap();
}

#[tokio::test]
async fn pool_keys_are_case_insensitive() {
    let broker = MockBroker::new();
    let endpoint = unique_endpoint("pool-case");
    let conn = cubrs::connect_with_url(broker.connector(), &url_for(&endpoint), None, None)
        .await
        .unwrap();

    let stmt = cubrs::prepare(conn, "SELECT a FROM t", PrepareFlag::NONE)
        .await
        .unwrap();
    cubrs::close_req_handle(stmt).await.unwrap();
    let _ = cubrs::prepare(conn, "select a from t", PrepareFlag::NONE)
        .await
        .unwrap();
    assert_eq!(broker.prepare_count(), 1);

    cubrs::disconnect(conn).await.unwrap();
}

#[tokio::test]
async fn different_text_misses_the_pool() {
    let broker = MockBroker::new();
    let endpoint = unique_endpoint("pool-miss");
    let conn = cubrs::connect_with_url(broker.connector(), &url_for(&endpoint), None, None)
        .await
        .unwrap();

    let stmt = cubrs::prepare(conn, "select a from t", PrepareFlag::NONE)
        .await
        .unwrap();
    cubrs::close_req_handle(stmt).await.unwrap();
    let _ = cubrs::prepare(conn, "select b from t", PrepareFlag::NONE)
        .await
        .unwrap();
    // a miss is not an error, it just prepares for real
    assert_eq!(broker.prepare_count(), 2);

    cubrs::disconnect(conn).await.unwrap();
}

#[tokio::test]
async fn stale_id_of_a_parked_statement_is_rejected() {
    let broker = MockBroker::new();
    let endpoint = unique_endpoint("pool-stale");
    let conn = cubrs::connect_with_url(broker.connector(), &url_for(&endpoint), None, None)
        .await
        .unwrap();

    let stmt = cubrs::prepare(conn, "select a from t", PrepareFlag::NONE)
        .await
        .unwrap();
    cubrs::close_req_handle(stmt).await.unwrap();
    assert!(matches!(
        cubrs::execute(stmt, ExecuteFlag::NONE).await.unwrap_err(),
        cubrs::Error::ReqHandle
    ));

    cubrs::disconnect(conn).await.unwrap();
}

#[tokio::test]
async fn reconnect_invalidates_pooled_statements() {
    let broker = MockBroker::new();
    let endpoint = unique_endpoint("pool-invalid");
    let conn = cubrs::connect_with_url(broker.connector(), &url_for(&endpoint), None, None)
        .await
        .unwrap();

    let sql = "select a from t";
    let stmt = cubrs::prepare(conn, sql, PrepareFlag::NONE).await.unwrap();
    cubrs::close_req_handle(stmt).await.unwrap();

    // the transport dies; the reconnect must invalidate the parked handle
    broker.kill_sockets();
    let revived = cubrs::prepare(conn, sql, PrepareFlag::NONE).await.unwrap();
    assert_eq!(broker.prepare_count(), 1);

    // executing the revived handle now needs a fresh server-side prepare
    cubrs::execute(revived, ExecuteFlag::NONE).await.unwrap();
    assert_eq!(broker.prepare_count(), 2);

    cubrs::disconnect(conn).await.unwrap();
}
