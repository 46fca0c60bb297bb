mod support;

use cubrs::{
    CursorOrigin, DbParam, Error, ExecuteFlag, IsolationLevel, PrepareFlag, TranType,
};
use support::{unique_endpoint, url_for, MockBroker};

#[tokio::test]
async fn holdable_cursor_survives_commit_and_dies_on_rollback() {
    let broker = MockBroker::new();
    let endpoint = unique_endpoint("tx-holdable");
    let conn = cubrs::connect_with_url(broker.connector(), &url_for(&endpoint), None, None)
        .await
        .unwrap();

    let stmt = cubrs::prepare(conn, "select a from t order by a", PrepareFlag::HOLDABLE)
        .await
        .unwrap();
    cubrs::set_fetch_size(stmt, 1).await.unwrap();
    cubrs::execute(stmt, ExecuteFlag::NONE).await.unwrap();

    cubrs::cursor(stmt, 1, CursorOrigin::First).await.unwrap();
    cubrs::fetch(stmt).await.unwrap();
    assert_eq!(
        cubrs::get_data(stmt, 1).await.unwrap().as_i64().unwrap(),
        1
    );

    cubrs::end_tran(conn, TranType::Commit).await.unwrap();

    // the holdable result set is still fetchable after the commit
    cubrs::cursor(stmt, 1, CursorOrigin::Current).await.unwrap();
    cubrs::fetch(stmt).await.unwrap();
    assert_eq!(
        cubrs::get_data(stmt, 1).await.unwrap().as_i64().unwrap(),
        2
    );

    // a rollback after the commit closes the result set but keeps the
    // handle usable
    cubrs::end_tran(conn, TranType::Rollback).await.unwrap();
    assert!(cubrs::get_data(stmt, 1).await.is_err());
    cubrs::close_req_handle(stmt).await.unwrap();

    cubrs::disconnect(conn).await.unwrap();
}

#[tokio::test]
async fn unholdable_result_sets_close_at_commit() {
    let broker = MockBroker::new();
    let endpoint = unique_endpoint("tx-unholdable");
    let conn = cubrs::connect_with_url(broker.connector(), &url_for(&endpoint), None, None)
        .await
        .unwrap();

    let stmt = cubrs::prepare(conn, "select a from t", PrepareFlag::NONE)
        .await
        .unwrap();
    cubrs::execute(stmt, ExecuteFlag::NONE).await.unwrap();
    cubrs::cursor(stmt, 1, CursorOrigin::First).await.unwrap();
    cubrs::fetch(stmt).await.unwrap();

    cubrs::end_tran(conn, TranType::Commit).await.unwrap();
    assert!(matches!(
        cubrs::get_data(stmt, 1).await.unwrap_err(),
        Error::ReqHandle
    ));

    cubrs::disconnect(conn).await.unwrap();
}

#[tokio::test]
async fn autocommit_round_trip() {
    let broker = MockBroker::new();
    let endpoint = unique_endpoint("tx-autocommit");
    let conn = cubrs::connect_with_url(broker.connector(), &url_for(&endpoint), None, None)
        .await
        .unwrap();

    cubrs::set_autocommit(conn, true).await.unwrap();
    cubrs::end_tran(conn, TranType::Commit).await.unwrap();
    assert!(cubrs::get_autocommit(conn).await.unwrap());

    cubrs::set_autocommit(conn, false).await.unwrap();
    assert!(!cubrs::get_autocommit(conn).await.unwrap());

    cubrs::disconnect(conn).await.unwrap();
}

#[tokio::test]
async fn isolation_level_round_trip() {
    let broker = MockBroker::new();
    let endpoint = unique_endpoint("tx-isolation");
    let conn = cubrs::connect_with_url(broker.connector(), &url_for(&endpoint), None, None)
        .await
        .unwrap();

    cubrs::set_isolation_level(conn, IsolationLevel::RepeatableRead)
        .await
        .unwrap();
    let value = cubrs::get_db_parameter(conn, DbParam::IsolationLevel)
        .await
        .unwrap();
    assert_eq!(value, IsolationLevel::RepeatableRead.to_wire());

    cubrs::disconnect(conn).await.unwrap();
}

#[tokio::test]
async fn savepoints_pass_through() {
    let broker = MockBroker::new();
    let endpoint = unique_endpoint("tx-savepoint");
    let conn = cubrs::connect_with_url(broker.connector(), &url_for(&endpoint), None, None)
        .await
        .unwrap();

    cubrs::savepoint(conn, cubrs::SavepointCmd::Set, "sp1")
        .await
        .unwrap();
    cubrs::savepoint(conn, cubrs::SavepointCmd::Rollback, "sp1")
        .await
        .unwrap();

    cubrs::disconnect(conn).await.unwrap();
}
