//! Statement-level entry points: prepare, execute and friends.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use log::{debug, warn};

use crate::config::DbmsKind;
use crate::connection::{record_error, with_conn};
use crate::errors::{Error, Result};
use crate::handle::request::{CursorOrigin, HandleKind};
use crate::handle::session::{Session, SessionState};
use crate::handle::{alloc_req_handle, free_req_handle, table, ConnId, StmtId};
use crate::retry;
use crate::value::{BindValue, ParamMode, UType, Value};
use crate::wire::{
    ColumnInfo, ExecuteFlag, ExecuteReply, PrepareFlag, QueryResultInfo, StmtType, TranType,
    PROTOCOL_V7,
};

/// Resolves a statement id and runs `op` under the standard entry-point
/// template, against the owning connection.
pub(crate) async fn with_stmt<T, F>(stmt: StmtId, op: F) -> Result<T>
where
    F: for<'a> FnOnce(&'a Arc<Session>, &'a mut SessionState, usize) -> BoxFuture<'a, Result<T>>,
{
    let (session, index) = table().find_stmt(stmt)?;
    let mut guard = session
        .state
        .try_lock()
        .map_err(|_| Error::UsedConnection)?;
    guard.last_error.clear();
    let result = op(&session, &mut *guard, index).await;
    record_error(&session, &mut *guard, result)
}

/// Prepares `sql` on the connection and returns the statement id.
///
/// With statement pooling, a handle parked for the same text is handed back
/// without a server round trip; its query timeout is refreshed from the
/// connection.
pub async fn prepare(conn: ConnId, sql: &str, flag: PrepareFlag) -> Result<StmtId> {
    let sql = sql.to_owned();
    with_conn(conn, move |session, state| {
        Box::pin(async move {
            let mut flag = flag;
            if state.holdability {
                flag |= PrepareFlag::HOLDABLE;
            }

            if state.broker_info.statement_pooling {
                if let Some(index) = state.stmt_pool.take(&sql) {
                    let cookie = table().mint_stmt(session.slot, index);
                    let query_timeout = state.query_timeout;
                    let req = state.req_mut(index)?;
                    req.cookie = cookie;
                    req.query_timeout = query_timeout;
                    debug!("statement pool hit for {cookie}");
                    return Ok(cookie);
                }
            }

            let index = alloc_req_handle(table(), state, session.slot, HandleKind::Prepare);
            retry::apply_force_failback(state);
            state.set_query_deadline(None);
            let result = retry::retryable(session, state, Some(index), |state| {
                let sql = sql.clone();
                Box::pin(async move {
                    let timeout = state.remaining_time()?;
                    state.wire()?.prepare(&sql, flag, timeout).await
                })
            })
            .await;
            state.clear_deadline();

            match result {
                Ok(reply) => {
                    state.absorb_status(reply.status);
                    let req = state.req_mut(index)?;
                    req.apply_prepare(&sql, flag, reply);
                    let cookie = req.cookie;
                    if state.broker_info.statement_pooling {
                        state.stmt_pool.mark_in_use(index);
                    }
                    Ok(cookie)
                }
                Err(err) => {
                    free_req_handle(table(), state, index);
                    teardown_on_query_timeout(state, &err);
                    retry::check_rc_time(session, state);
                    Err(err)
                }
            }
        })
    })
    .await
}

/// Prepares and immediately executes in one sweep. The statement handle is
/// returned alongside the row count and stays open for fetching.
pub async fn prepare_and_execute(
    conn: ConnId,
    sql: &str,
    flag: ExecuteFlag,
) -> Result<(StmtId, i64)> {
    let stmt = prepare(conn, sql, PrepareFlag::NONE).await?;
    match execute(stmt, flag).await {
        Ok(affected) => Ok((stmt, affected)),
        Err(err) => {
            let _ = close_req_handle(stmt).await;
            Err(err)
        }
    }
}

#[derive(Clone, Copy)]
enum ExecMode {
    Single(ExecuteFlag),
    Array,
}

/// Executes a prepared statement. For queries the returned count is the
/// total number of rows in the result set.
pub async fn execute(stmt: StmtId, flag: ExecuteFlag) -> Result<i64> {
    with_stmt(stmt, move |session, state, index| {
        Box::pin(async move {
            state.last_shard_id = None;
            retry::apply_force_failback(state);

            // asynchronous execution is unsupported; a bare plan request
            // still needs the query info piggyback
            let mut flag = flag.without(ExecuteFlag::ASYNC);
            if flag.contains(ExecuteFlag::ONLY_QUERY_PLAN) {
                flag |= ExecuteFlag::QUERY_INFO;
            }

            let stmt_timeout = state.req(index)?.query_timeout;
            state.set_query_deadline(stmt_timeout);
            let started = Instant::now();
            let result =
                execute_with_recovery(session, state, index, ExecMode::Single(flag)).await;
            state.clear_deadline();
            log_slow_query(session, state, index, started.elapsed());

            let outcome = match result {
                Ok(reply) => {
                    state.absorb_status(reply.status);
                    if reply.last_insert_id.is_some() {
                        state.last_insert_id = reply.last_insert_id.clone();
                    }
                    let affected = reply.affected;
                    state.req_mut(index)?.apply_execute(&reply);
                    Ok(affected)
                }
                Err(err) => {
                    teardown_on_query_timeout(state, &err);
                    Err(err)
                }
            };
            retry::check_rc_time(session, state);
            outcome
        })
    })
    .await
}

/// Executes a statement once per bound parameter row (see
/// [`bind_param_array_size`]).
pub async fn execute_array(stmt: StmtId) -> Result<Vec<QueryResultInfo>> {
    with_stmt(stmt, move |session, state, index| {
        Box::pin(async move {
            state.last_shard_id = None;
            retry::apply_force_failback(state);
            let stmt_timeout = state.req(index)?.query_timeout;
            state.set_query_deadline(stmt_timeout);
            let result = execute_with_recovery(session, state, index, ExecMode::Array).await;
            state.clear_deadline();

            let outcome = match result {
                Ok(reply) => {
                    state.absorb_status(reply.status);
                    let results = reply.results.clone();
                    state.req_mut(index)?.apply_execute(&reply);
                    Ok(results)
                }
                Err(err) => {
                    teardown_on_query_timeout(state, &err);
                    Err(err)
                }
            };
            retry::check_rc_time(session, state);
            outcome
        })
    })
    .await
}

/// Runs a batch of standalone statements on one connection.
pub async fn execute_batch(conn: ConnId, sqls: &[String]) -> Result<Vec<QueryResultInfo>> {
    let sqls = sqls.to_vec();
    with_conn(conn, move |session, state| {
        Box::pin(async move {
            retry::apply_force_failback(state);
            state.set_query_deadline(None);
            let result = retry::retryable(session, state, None, |state| {
                let sqls = sqls.clone();
                Box::pin(async move {
                    let timeout = state.remaining_time()?;
                    state.wire()?.execute_batch(&sqls, timeout).await
                })
            })
            .await;
            state.clear_deadline();
            let outcome = match result {
                Ok(reply) => {
                    state.absorb_status(reply.status);
                    Ok(reply.results)
                }
                Err(err) => {
                    teardown_on_query_timeout(state, &err);
                    Err(err)
                }
            };
            retry::check_rc_time(session, state);
            outcome
        })
    })
    .await
}

/// Advances a multi-resultset statement to its next result set.
pub async fn next_result(stmt: StmtId) -> Result<i64> {
    with_stmt(stmt, |session, state, index| {
        Box::pin(async move {
            let stmt_timeout = state.req(index)?.query_timeout;
            state.set_query_deadline(stmt_timeout);
            let result = retry::retryable(session, state, Some(index), |state| {
                Box::pin(async move {
                    let server_id = state.req(index)?.server_stmt_id;
                    let timeout = state.remaining_time()?;
                    state.wire()?.next_result(server_id, timeout).await
                })
            })
            .await;
            state.clear_deadline();
            let reply = result?;
            state.absorb_status(reply.status);
            let req = state.req_mut(index)?;
            req.current_result += 1;
            req.total_rows = reply.affected;
            req.tuples.clear();
            req.cursor = Default::default();
            Ok(reply.affected)
        })
    })
    .await
}

/// The retry-wrapped execute body: a statement invalidated by a reconnect
/// (or never prepared on this socket) is prepared again from its stored
/// text first. A server-side plan eviction (`STMT_POOLING`) re-prepares and
/// retries: exactly once with a pinned plan on modern brokers, until it
/// sticks on legacy ones.
async fn execute_with_recovery(
    session: &Session,
    state: &mut SessionState,
    index: usize,
    mode: ExecMode,
) -> Result<ExecuteReply> {
    let mut pinned_retry_done = false;
    loop {
        let result = retry::retryable(session, state, Some(index), |state| {
            Box::pin(async move {
                ensure_prepared(state, index).await?;
                let (server_id, max_rows) = {
                    let req = state.req(index)?;
                    (req.server_stmt_id, req.max_rows)
                };
                let timeout = state.remaining_time()?;
                match mode {
                    ExecMode::Single(flag) => {
                        let binds = state.req(index)?.binds.clone();
                        state
                            .wire()?
                            .execute(server_id, flag, &binds, max_rows, timeout)
                            .await
                    }
                    ExecMode::Array => {
                        let rows = state
                            .req(index)?
                            .bind_rows
                            .clone()
                            .ok_or(Error::BindArraySize)?;
                        state
                            .wire()?
                            .execute_array(server_id, ExecuteFlag::NONE, &rows, timeout)
                            .await
                    }
                }
            })
        })
        .await;

        match result {
            Err(Error::StmtPooling) if state.broker_info.statement_pooling => {
                let modern = state.broker_info.protocol_version >= PROTOCOL_V7;
                if modern && pinned_retry_done {
                    return Err(Error::StmtPooling);
                }
                {
                    let req = state.req_mut(index)?;
                    req.free_content();
                    req.invalidate();
                    if modern {
                        req.prepare_flag |= PrepareFlag::XASL_CACHE_PINNED;
                    }
                }
                pinned_retry_done = true;
                debug!("server evicted the cached plan, preparing again");
            }
            other => return other,
        }
    }
}

/// Re-prepares a stale statement from the text and flags it was prepared
/// with, byte for byte.
async fn ensure_prepared(state: &mut SessionState, index: usize) -> Result<()> {
    let (stale, sql, flag) = {
        let req = state.req(index)?;
        (
            !req.valid || req.server_stmt_id < 0,
            req.sql.clone(),
            req.prepare_flag,
        )
    };
    if !stale {
        return Ok(());
    }
    let sql = sql.ok_or(Error::ReqHandle)?;
    let reply = {
        let timeout = state.remaining_time()?;
        state.wire()?.prepare(&sql, flag, timeout).await?
    };
    state.absorb_status(reply.status);
    state.req_mut(index)?.apply_prepare(&sql, flag, reply);
    Ok(())
}

/// Buffers the next window of rows around the cursor position.
pub async fn fetch(stmt: StmtId) -> Result<()> {
    fetch_internal(stmt, false).await
}

/// Like [`fetch`], but asks for a sensitive view of the rows. Not allowed
/// on holdable result sets.
pub async fn fetch_sensitive(stmt: StmtId) -> Result<()> {
    fetch_internal(stmt, true).await
}

async fn fetch_internal(stmt: StmtId, sensitive: bool) -> Result<()> {
    with_stmt(stmt, move |session, state, index| {
        Box::pin(async move {
            {
                let req = state.req_mut(index)?;
                if sensitive && req.holdable() {
                    return Err(Error::HoldableNotAllowed);
                }
                if req.is_closed {
                    return Err(Error::ReqHandle);
                }
                if req.cursor.position == 0 {
                    req.cursor.position = 1;
                }
            }
            let (position, buffered, server_id, fetch_size, stmt_timeout) = {
                let req = state.req(index)?;
                let pos = req.cursor.position;
                (
                    pos,
                    !req.tuples.is_empty()
                        && pos >= req.cursor.window_begin
                        && pos <= req.cursor.window_end,
                    req.server_stmt_id,
                    req.fetch_size,
                    req.query_timeout,
                )
            };

            if !buffered {
                state.set_query_deadline(stmt_timeout);
                let result = retry::retryable(session, state, Some(index), |state| {
                    Box::pin(async move {
                        let timeout = state.remaining_time()?;
                        state
                            .wire()?
                            .fetch(server_id, position, fetch_size, timeout)
                            .await
                    })
                })
                .await;
                state.clear_deadline();
                let reply = result?;
                state.absorb_status(reply.status);
                if reply.tuples.is_empty() {
                    retry::check_rc_time(session, state);
                    return Err(Error::NoMoreData);
                }
                state.req_mut(index)?.store_fetch_window(position, reply.tuples);
            }
            retry::check_rc_time(session, state);
            Ok(())
        })
    })
    .await
}

/// Moves the cursor relative to `origin`.
pub async fn cursor(stmt: StmtId, offset: i64, origin: CursorOrigin) -> Result<()> {
    with_stmt(stmt, move |_, state, index| {
        Box::pin(async move { state.req_mut(index)?.move_cursor(offset, origin) })
    })
    .await
}

/// Reads a column (1-based) of the row under the cursor. Conversion to the
/// caller's type happens on the returned [`Value`].
pub async fn get_data(stmt: StmtId, column: usize) -> Result<Value> {
    with_stmt(stmt, move |_, state, index| {
        Box::pin(async move { state.req(index)?.column_value(column).cloned() })
    })
    .await
}

/// Binds an input parameter (1-based).
pub async fn bind_param(stmt: StmtId, index: usize, u_type: UType, value: Value) -> Result<()> {
    with_stmt(stmt, move |_, state, req_index| {
        Box::pin(async move {
            state.req_mut(req_index)?.bind(
                index,
                BindValue {
                    u_type,
                    value,
                    mode: ParamMode::In,
                },
            )
        })
    })
    .await
}

/// Marks a parameter as an OUT parameter. Oracle-flavor connections also
/// record the declared type.
pub async fn register_out_param(stmt: StmtId, index: usize, u_type: UType) -> Result<()> {
    with_stmt(stmt, move |session, state, req_index| {
        Box::pin(async move {
            let declared = (session.config.kind == DbmsKind::CubridOracle).then_some(u_type);
            state.req_mut(req_index)?.register_out_param(index, declared)
        })
    })
    .await
}

/// Declares the number of rows for array binding; must precede
/// [`bind_param_array`].
pub async fn bind_param_array_size(stmt: StmtId, size: usize) -> Result<()> {
    with_stmt(stmt, move |_, state, index| {
        Box::pin(async move { state.req_mut(index)?.set_bind_array_size(size) })
    })
    .await
}

/// Binds one cell of the parameter array (`row` 0-based, `index` 1-based).
pub async fn bind_param_array(
    stmt: StmtId,
    row: usize,
    index: usize,
    u_type: UType,
    value: Value,
) -> Result<()> {
    with_stmt(stmt, move |_, state, req_index| {
        Box::pin(async move {
            state.req_mut(req_index)?.bind_array(
                row,
                index,
                BindValue {
                    u_type,
                    value,
                    mode: ParamMode::In,
                },
            )
        })
    })
    .await
}

/// Closes a statement handle and invalidates its id.
///
/// Under statement pooling the handle is parked for reuse instead: server
/// result sets are closed, the transaction a lone autocommit statement
/// opened is rolled back, and the handle returns to the pool keyed by its
/// sql text. A full pool falls through to the real close.
pub async fn close_req_handle(stmt: StmtId) -> Result<()> {
    let (session, index) = table().find_stmt(stmt)?;
    let mut guard = session
        .state
        .try_lock()
        .map_err(|_| Error::UsedConnection)?;
    let state = &mut *guard;
    state.last_error.clear();

    let poolable = state.broker_info.statement_pooling && state.req(index)?.sql.is_some();
    if poolable {
        let server_id = state.req(index)?.server_stmt_id;
        if server_id >= 0 {
            if let Ok(wire) = state.wire() {
                let _ = wire.close_result_set(server_id, None).await;
            }
        }
        {
            let req = state.req_mut(index)?;
            req.close_result_set();
            req.binds.clear();
            req.bind_rows = None;
        }
        if state.autocommit && !state.is_out_tran() {
            let rolled_back: Result<()> = async {
                let timeout = state.remaining_time()?;
                let status = state.wire()?.end_tran(TranType::Rollback, timeout).await?;
                state.absorb_status(status);
                Ok(())
            }
            .await;
            if rolled_back.is_err() {
                state.close_socket();
            }
        }
        let sql = state.req(index)?.sql.clone().unwrap_or_default();
        if state.stmt_pool.park(&sql, index) {
            table().unmap_stmt(stmt);
            return Ok(());
        }
    }

    let server_id = state.req(index)?.server_stmt_id;
    if server_id >= 0 {
        if let Ok(wire) = state.wire() {
            let _ = wire.close_statement(server_id, None).await;
        }
    }
    free_req_handle(table(), state, index);
    Ok(())
}

/// Column descriptions of the current result set.
pub async fn get_result_info(stmt: StmtId) -> Result<Vec<ColumnInfo>> {
    with_stmt(stmt, |_, state, index| {
        Box::pin(async move { Ok(state.req(index)?.columns.clone()) })
    })
    .await
}

pub async fn get_stmt_type(stmt: StmtId) -> Result<StmtType> {
    with_stmt(stmt, |_, state, index| {
        Box::pin(async move { Ok(state.req(index)?.stmt_type) })
    })
    .await
}

/// The server's plan for a prepared statement, as text.
pub async fn get_query_plan(stmt: StmtId) -> Result<String> {
    with_stmt(stmt, |session, state, index| {
        Box::pin(async move {
            state.set_query_deadline(None);
            let result = retry::retryable(session, state, Some(index), |state| {
                Box::pin(async move {
                    let server_id = state.req(index)?.server_stmt_id;
                    let timeout = state.remaining_time()?;
                    state.wire()?.get_query_plan(server_id, timeout).await
                })
            })
            .await;
            state.clear_deadline();
            result
        })
    })
    .await
}

pub async fn set_max_row(stmt: StmtId, max_rows: i64) -> Result<()> {
    with_stmt(stmt, move |_, state, index| {
        Box::pin(async move {
            state.req_mut(index)?.max_rows = max_rows;
            Ok(())
        })
    })
    .await
}

pub async fn set_fetch_size(stmt: StmtId, fetch_size: i32) -> Result<()> {
    with_stmt(stmt, move |_, state, index| {
        Box::pin(async move {
            if fetch_size <= 0 {
                return Err(Error::InvalidArgs("fetch size must be positive"));
            }
            state.req_mut(index)?.fetch_size = fetch_size;
            Ok(())
        })
    })
    .await
}

/// Per-statement deadline override; `None` falls back to the connection
/// default.
pub async fn set_query_timeout(stmt: StmtId, timeout: Option<Duration>) -> Result<()> {
    with_stmt(stmt, move |_, state, index| {
        Box::pin(async move {
            state.req_mut(index)?.query_timeout = timeout;
            Ok(())
        })
    })
    .await
}

pub async fn get_query_timeout(stmt: StmtId) -> Result<Option<Duration>> {
    with_stmt(stmt, |_, state, index| {
        Box::pin(async move { Ok(state.req(index)?.query_timeout) })
    })
    .await
}

/// Hard-closes the socket when a query timeout fired on a connection
/// configured to disconnect instead of lingering.
fn teardown_on_query_timeout(state: &mut SessionState, err: &Error) {
    if matches!(err, Error::QueryTimeout) && state.disconnect_on_query_timeout {
        state.close_socket();
    }
}

fn log_slow_query(session: &Session, state: &SessionState, index: usize, elapsed: Duration) {
    let threshold = session.config.slow_query_threshold;
    if threshold.is_zero() || elapsed < threshold {
        return;
    }
    if let Ok(req) = state.req(index) {
        if let Some(sql) = &req.sql {
            warn!(
                "slow query took {}ms on {}: {sql}",
                elapsed.as_millis(),
                session.config.canonical_url()
            );
        }
    }
}
