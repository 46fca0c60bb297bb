//! Connection-level entry points.
//!
//! Every public function here follows the same shape: resolve the opaque id,
//! take the session for the duration of the call (a second caller gets
//! [`Error::UsedConnection`]), zero the error record, do the work through
//! the failover driver, and record any failure with the broker-identity
//! suffix before returning it.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use log::debug;

use crate::config::{IsolationLevel, UrlConfig};
use crate::errors::{diagnostic_suffix, Error, Result};
use crate::handle::session::{Session, SessionState};
use crate::handle::{free_req_handle, table, ConnId};
use crate::host;
use crate::retry;
use crate::wire::{Connector, DbParam, SavepointCmd, TranType};

/// Resolves a connection id, takes the session and runs `op` under the
/// standard entry-point template.
pub(crate) async fn with_conn<T, F>(conn: ConnId, op: F) -> Result<T>
where
    F: for<'a> FnOnce(&'a Arc<Session>, &'a mut SessionState) -> BoxFuture<'a, Result<T>>,
{
    let session = table().get(conn)?;
    let mut guard = session
        .state
        .try_lock()
        .map_err(|_| Error::UsedConnection)?;
    guard.last_error.clear();
    let result = op(&session, &mut *guard).await;
    record_error(&session, &mut *guard, result)
}

/// Copies a failure into the connection's error record, tagged with the
/// identity of the broker worker that served the call.
pub(crate) fn record_error<T>(
    session: &Session,
    state: &mut SessionState,
    result: Result<T>,
) -> Result<T> {
    if let Err(err) = &result {
        let control = session.control_info();
        let message = match control.endpoint {
            Some(endpoint) => format!(
                "{err} {}",
                diagnostic_suffix(&endpoint.to_string(), control.cas, state.last_shard_id)
            ),
            None => err.to_string(),
        };
        state.last_error.record(err.code(), message);
    }
    result
}

/// Opens a connection described by a `cci:` URL. Explicit `user` /
/// `password` arguments override the ones embedded in the URL.
pub async fn connect_with_url(
    connector: Arc<dyn Connector>,
    url: &str,
    user: Option<&str>,
    password: Option<&str>,
) -> Result<ConnId> {
    connect_internal(connector, url, user, password, false).await
}

/// Like [`connect_with_url`], but the handle is parked in the per-process
/// cache on disconnect and physically reused by a later connect with the
/// same identity.
pub async fn pconnect_with_url(
    connector: Arc<dyn Connector>,
    url: &str,
    user: Option<&str>,
    password: Option<&str>,
) -> Result<ConnId> {
    connect_internal(connector, url, user, password, true).await
}

/// Opens a connection from discrete endpoint pieces.
pub async fn connect(
    connector: Arc<dyn Connector>,
    host: &str,
    port: u16,
    db: &str,
    user: Option<&str>,
    password: Option<&str>,
) -> Result<ConnId> {
    let url = format!("cci:cubrid:{host}:{port}:{db}:::");
    connect_internal(connector, &url, user, password, false).await
}

async fn connect_internal(
    connector: Arc<dyn Connector>,
    url: &str,
    user: Option<&str>,
    password: Option<&str>,
    pconnect: bool,
) -> Result<ConnId> {
    let mut config = UrlConfig::parse(url)?;
    if let Some(user) = user {
        config.user = user.to_owned();
    }
    if let Some(password) = password {
        config.password = password.to_owned();
    }

    let (id, session) = table().alloc_or_reuse(config, connector.clone())?;
    host::registry().ensure_health_checker(connector);

    let mut guard = session
        .state
        .try_lock()
        .map_err(|_| Error::UsedConnection)?;
    guard.last_error.clear();
    guard.pconnect = pconnect;
    guard.set_login_deadline();

    let result: Result<()> = async {
        retry::establish(&session, &mut *guard).await?;
        // finalize the login and harvest the session status
        let status = {
            let timeout = guard.remaining_time().map_err(|_| Error::LoginTimeout)?;
            guard.wire()?.end_tran(TranType::Commit, timeout).await?
        };
        guard.absorb_status(status);
        Ok(())
    }
    .await;
    guard.clear_deadline();

    match result {
        Ok(()) => {
            debug!("connected {} as {}", session.config.canonical_url(), id);
            Ok(id)
        }
        Err(err) => {
            guard.close_socket();
            drop(guard);
            table().free_connection(id);
            Err(err)
        }
    }
}

/// Closes a connection, or hands it back to its owner.
///
/// A pooled connection is rolled back and returned to its data source; a
/// pconnect-cached one is rolled back and parked; anything else is closed
/// for real. The id is invalid afterwards either way.
pub async fn disconnect(conn: ConnId) -> Result<()> {
    let session = table().get(conn)?;
    let datasource = session.datasource.lock().unwrap().clone();
    if let Some(datasource) = datasource {
        return crate::datasource::release_borrowed(&datasource, conn).await;
    }

    let mut guard = session
        .state
        .try_lock()
        .map_err(|_| Error::UsedConnection)?;
    guard.last_error.clear();

    if guard.pconnect {
        if !guard.is_out_tran() {
            let rolled_back: Result<()> = async {
                let timeout = guard.remaining_time()?;
                let status = guard.wire()?.end_tran(TranType::Rollback, timeout).await?;
                guard.absorb_status(status);
                Ok(())
            }
            .await;
            if rolled_back.is_err() {
                guard.close_socket();
            }
        }
        // statement ids must not survive into the parked handle
        for index in guard.all_req_indexes() {
            free_req_handle(table(), &mut *guard, index);
        }
        guard.stmt_pool = crate::handle::stmt_pool::StmtPool::new(
            crate::handle::session::DEFAULT_MAX_OPEN_PREPARED_STATEMENT,
        );
        drop(guard);
        if table().park_pconnect(conn) {
            return Ok(());
        }
        guard = session
            .state
            .try_lock()
            .map_err(|_| Error::UsedConnection)?;
    }

    if !guard.is_out_tran() {
        let timeout = guard.remaining_time().unwrap_or(None);
        if let Ok(wire) = guard.wire() {
            let _ = wire.end_tran(TranType::Rollback, timeout).await;
        }
    }
    guard.close_socket();
    drop(guard);
    table().free_connection(conn);
    Ok(())
}

/// Commits or rolls back the running transaction.
pub async fn end_tran(conn: ConnId, tran: TranType) -> Result<()> {
    with_conn(conn, |session, state| {
        Box::pin(async move {
            if !state.is_out_tran() {
                state.set_query_deadline(None);
                let result: Result<()> = async {
                    let timeout = state.remaining_time()?;
                    let status = state.wire()?.end_tran(tran, timeout).await?;
                    state.absorb_status(status);
                    Ok(())
                }
                .await;
                state.clear_deadline();
                match result {
                    Ok(()) => state.close_unholdable_resultsets(),
                    Err(err) => {
                        if err.is_communication() {
                            state.close_socket();
                        }
                        return Err(err);
                    }
                }
            } else if tran == TranType::Rollback {
                // the server already ended the transaction (autocommit or a
                // commit that raced this rollback); only local cleanup is due
                if state.broker_info.statement_pooling {
                    state.close_all_resultsets();
                } else {
                    for index in state.unholdable_req_indexes() {
                        free_req_handle(table(), state, index);
                    }
                }
            }
            retry::check_rc_time(session, state);
            Ok(())
        })
    })
    .await
}

pub async fn set_autocommit(conn: ConnId, autocommit: bool) -> Result<()> {
    with_conn(conn, |_, state| {
        Box::pin(async move {
            state.autocommit = autocommit;
            Ok(())
        })
    })
    .await
}

pub async fn get_autocommit(conn: ConnId) -> Result<bool> {
    with_conn(conn, |_, state| Box::pin(async move { Ok(state.autocommit) })).await
}

/// Reads a session parameter from the server.
pub async fn get_db_parameter(conn: ConnId, param: DbParam) -> Result<i32> {
    with_conn(conn, |session, state| {
        Box::pin(async move {
            state.set_query_deadline(None);
            let result = retry::retryable(session, state, None, |state| {
                Box::pin(async move {
                    let timeout = state.remaining_time()?;
                    state.wire()?.get_db_parameter(param, timeout).await
                })
            })
            .await;
            state.clear_deadline();
            result
        })
    })
    .await
}

/// Writes a session parameter on the server.
pub async fn set_db_parameter(conn: ConnId, param: DbParam, value: i32) -> Result<()> {
    with_conn(conn, |session, state| {
        Box::pin(async move {
            state.set_query_deadline(None);
            let result = retry::retryable(session, state, None, |state| {
                Box::pin(async move {
                    let timeout = state.remaining_time()?;
                    state.wire()?.set_db_parameter(param, value, timeout).await
                })
            })
            .await;
            state.clear_deadline();
            if result.is_ok() {
                match param {
                    DbParam::IsolationLevel => {
                        state.isolation = IsolationLevel::from_wire(value).ok();
                    }
                    DbParam::LockTimeout => {
                        state.lock_timeout = u64::try_from(value)
                            .ok()
                            .map(Duration::from_millis);
                    }
                    _ => {}
                }
            }
            result
        })
    })
    .await
}

pub async fn set_isolation_level(conn: ConnId, level: IsolationLevel) -> Result<()> {
    set_db_parameter(conn, DbParam::IsolationLevel, level.to_wire()).await
}

pub async fn set_lock_timeout(conn: ConnId, timeout: Duration) -> Result<()> {
    let millis = i32::try_from(timeout.as_millis()).map_err(|_| Error::InvalidArgs("timeout"))?;
    set_db_parameter(conn, DbParam::LockTimeout, millis).await
}

/// Connect/reconnect budget for this connection from now on; `None` means
/// unbounded.
pub async fn set_login_timeout(conn: ConnId, timeout: Option<Duration>) -> Result<()> {
    with_conn(conn, move |_, state| {
        Box::pin(async move {
            state.login_timeout = timeout;
            Ok(())
        })
    })
    .await
}

pub async fn get_login_timeout(conn: ConnId) -> Result<Option<Duration>> {
    with_conn(conn, |_, state| {
        Box::pin(async move { Ok(state.login_timeout) })
    })
    .await
}

/// Creates a savepoint or rolls back to one.
pub async fn savepoint(conn: ConnId, cmd: SavepointCmd, name: &str) -> Result<()> {
    let name = name.to_owned();
    with_conn(conn, |session, state| {
        Box::pin(async move {
            state.set_query_deadline(None);
            let result = retry::retryable(session, state, None, |state| {
                let name = name.clone();
                Box::pin(async move {
                    let timeout = state.remaining_time()?;
                    state.wire()?.savepoint(cmd, &name, timeout).await
                })
            })
            .await;
            state.clear_deadline();
            result.map(|status| state.absorb_status(status))
        })
    })
    .await
}

pub async fn get_db_version(conn: ConnId) -> Result<String> {
    with_conn(conn, |session, state| {
        Box::pin(async move {
            state.set_query_deadline(None);
            let result = retry::retryable(session, state, None, |state| {
                Box::pin(async move {
                    let timeout = state.remaining_time()?;
                    state.wire()?.get_db_version(timeout).await
                })
            })
            .await;
            state.clear_deadline();
            result
        })
    })
    .await
}

/// The generated key of the most recent insert on this connection.
///
/// The underlying buffer is overwritten by the next call on the same
/// connection; the value returned here is what the buffer held at call
/// time.
pub async fn get_last_insert_id(conn: ConnId) -> Result<Option<String>> {
    with_conn(conn, |_, state| {
        Box::pin(async move { Ok(state.last_insert_id.clone()) })
    })
    .await
}

/// Result-set holdability default for statements prepared after this call.
pub async fn set_holdability(conn: ConnId, holdable: u8) -> Result<()> {
    with_conn(conn, |_, state| {
        Box::pin(async move {
            match holdable {
                0 => state.holdability = false,
                1 => state.holdability = true,
                _ => return Err(Error::InvalidHoldability),
            }
            Ok(())
        })
    })
    .await
}

pub async fn get_holdability(conn: ConnId) -> Result<u8> {
    with_conn(conn, |_, state| {
        Box::pin(async move { Ok(u8::from(state.holdability)) })
    })
    .await
}

/// The shard that served the most recent request, for shard-aware brokers.
pub async fn get_shard_id(conn: ConnId) -> Result<Option<i32>> {
    with_conn(conn, |_, state| {
        Box::pin(async move { Ok(state.last_shard_id) })
    })
    .await
}

/// The last error recorded on the connection, as `(code, message)`. The
/// message carries the `[CAS INFO - ...]` suffix identifying the worker.
pub async fn get_last_error(conn: ConnId) -> Result<Option<(i32, String)>> {
    let session = table().get(conn)?;
    let guard = session
        .state
        .try_lock()
        .map_err(|_| Error::UsedConnection)?;
    if guard.last_error.is_set() {
        Ok(Some((guard.last_error.code, guard.last_error.message.clone())))
    } else {
        Ok(None)
    }
}

/// Cancels the request currently running on this connection.
///
/// This is the one operation allowed to target a busy connection: it skips
/// the session lock entirely and talks to the broker over a fresh control
/// socket, addressed by the worker identity captured at connect time.
pub async fn cancel(conn: ConnId) -> Result<()> {
    let session = table().get(conn)?;
    let control = session.control_info();
    let endpoint = control.endpoint.ok_or(Error::Communication)?;
    session.connector.cancel(&endpoint, control.cas).await
}
