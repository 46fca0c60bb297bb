mod support;

use std::time::Duration;

use cubrs::{Error, ExecuteFlag, PrepareFlag};
use support::{unique_endpoint, url_for, MockBroker};

#[tokio::test]
async fn cancel_interrupts_a_running_execute() {
    let broker = MockBroker::new();
    let endpoint = unique_endpoint("cancel");
    let conn = cubrs::connect_with_url(broker.connector(), &url_for(&endpoint), None, None)
        .await
        .unwrap();
    let stmt = cubrs::prepare(conn, "select * from huge", PrepareFlag::NONE)
        .await
        .unwrap();

    broker.state.lock().unwrap().execute_delay = Duration::from_secs(5);
    let running = tokio::spawn(async move { cubrs::execute(stmt, ExecuteFlag::NONE).await });

    tokio::time::sleep(Duration::from_millis(10)).await;
    // cancel goes around the busy session, over the control channel
    let cancelled_at = tokio::time::Instant::now();
    cubrs::cancel(conn).await.unwrap();

    let err = running.await.unwrap().unwrap_err();
    assert!(matches!(err, Error::QueryCancel));
    assert!(cancelled_at.elapsed() < Duration::from_millis(100));

    // the connection stays usable
    broker.state.lock().unwrap().execute_delay = Duration::ZERO;
    let stmt2 = cubrs::prepare(conn, "select a from t", PrepareFlag::NONE)
        .await
        .unwrap();
    cubrs::execute(stmt2, ExecuteFlag::NONE).await.unwrap();

    cubrs::disconnect(conn).await.unwrap();
}

#[tokio::test]
async fn busy_connections_refuse_a_second_caller() {
    let broker = MockBroker::new();
    let endpoint = unique_endpoint("cancel-busy");
    let conn = cubrs::connect_with_url(broker.connector(), &url_for(&endpoint), None, None)
        .await
        .unwrap();
    let stmt = cubrs::prepare(conn, "select * from huge", PrepareFlag::NONE)
        .await
        .unwrap();

    broker.state.lock().unwrap().execute_delay = Duration::from_millis(200);
    let running = tokio::spawn(async move { cubrs::execute(stmt, ExecuteFlag::NONE).await });
    tokio::time::sleep(Duration::from_millis(20)).await;

    // ordinary calls cannot barge in while the execute is in flight
    assert!(matches!(
        cubrs::get_autocommit(conn).await.unwrap_err(),
        Error::UsedConnection
    ));

    running.await.unwrap().unwrap();
    cubrs::disconnect(conn).await.unwrap();
}
