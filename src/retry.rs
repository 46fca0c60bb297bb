//! The retry / failover driver.
//!
//! Every wire-touching operation runs through [`retryable`]: on a transport
//! error (or a server-down condition the broker will not heal by itself)
//! while no transaction is open, the socket is dropped, the alternate-host
//! walk finds the next reachable broker under the login-timeout budget, and
//! the operation is replayed. Cached statements are invalidated by the
//! reconnect so replays prepare again first.

use futures::future::BoxFuture;
use log::{debug, info, warn};

use crate::errors::{Error, Result};
use crate::handle::session::{Session, SessionState, TranStatus};
use crate::host::{self, Availability};

/// `NEED_TO_RECONNECT`: a communication error always needs a client-side
/// reconnect; a server-down error only when the broker does not reconnect
/// on its own.
fn need_to_reconnect(state: &SessionState, err: &Error) -> bool {
    err.is_communication() || !state.broker_info.reconnect_when_server_down
}

/// Runs `op`, replaying it across reconnects while the session is out of a
/// transaction (or the failed call was the first of one).
pub(crate) async fn retryable<T, F>(
    session: &Session,
    state: &mut SessionState,
    req: Option<usize>,
    mut op: F,
) -> Result<T>
where
    F: for<'a> FnMut(&'a mut SessionState) -> BoxFuture<'a, Result<T>>,
{
    let first_op_in_tran = state.is_out_tran();
    let mut last = match op(state).await {
        Ok(value) => return Ok(value),
        Err(err) => err,
    };

    while (state.is_out_tran() || first_op_in_tran) && last.is_reconnectable() {
        info!(
            "retrying on {} after error: {last}",
            session.config.canonical_url()
        );
        if need_to_reconnect(state, &last) {
            reset_connect(session, state, req).await?;
        }
        match op(state).await {
            Ok(value) => return Ok(value),
            Err(err) => last = err,
        }
    }
    Err(last)
}

/// Frees the failed request's per-call content, raises the deadline to the
/// login budget and re-drives the connect procedure.
pub(crate) async fn reset_connect(
    session: &Session,
    state: &mut SessionState,
    req: Option<usize>,
) -> Result<()> {
    if let Some(index) = req {
        if let Ok(req) = state.req_mut(index) {
            req.free_content();
            req.invalidate();
        }
    }
    state.close_socket();
    state.raise_deadline_for_reconnect();
    establish(session, state).await.map(|_| ())
}

/// The connect procedure. Returns whether a new socket was opened (as
/// opposed to the existing one passing its health check). A fresh socket
/// invalidates every cached statement and resets the lazily-fetched
/// escape mode.
pub(crate) async fn establish(session: &Session, state: &mut SessionState) -> Result<bool> {
    let connected = connect_internal(session, state).await?;
    if connected {
        if state.broker_info.statement_pooling {
            state.invalidate_all_reqs();
        }
        state.no_backslash_escapes = None;
    }
    Ok(connected)
}

async fn connect_internal(session: &Session, state: &mut SessionState) -> Result<bool> {
    state
        .remaining_time()
        .map_err(|_| Error::LoginTimeout)?;

    if let Some(wire) = state.wire.as_deref_mut() {
        if wire.ping().await.is_ok() {
            return Ok(false);
        }
        state.close_socket();
    }

    let registry = host::registry();
    let rc_time = session.config.rc_time;
    let mut last = Error::Connect("no reachable host".into());

    // if all hosts turn out to be unreachable, ignore reachability and walk
    // once more to rescue from stale verdicts
    for ignore_reachability in [false, true] {
        for index in 0..state.hosts.len() {
            let endpoint = state.hosts[index].clone();
            if !ignore_reachability && !registry.is_reachable(&endpoint, rc_time) {
                debug!("skipping unreachable host {endpoint}");
                continue;
            }
            let timeout = match state.remaining_time() {
                Ok(timeout) => timeout,
                Err(_) => return Err(Error::LoginTimeout),
            };
            match session
                .connector
                .open(
                    &endpoint,
                    &session.config.db,
                    &session.config.user,
                    &session.config.password,
                    timeout,
                )
                .await
            {
                Ok(wire) => {
                    registry.set_status(&endpoint, Availability::Reachable);
                    state.broker_info = wire.broker_info().clone();
                    session.update_control(&endpoint, wire.cas_info());
                    state.wire = Some(wire);
                    state.host_index = index;
                    state.tran_status = TranStatus::OutTran;
                    state.force_failback = false;
                    if index != 0 {
                        warn!("connected to alternate host {endpoint}");
                    }
                    return Ok(true);
                }
                Err(err) if err.marks_host_unreachable() => {
                    warn!("host {endpoint} is unreachable: {err}");
                    registry.set_status(&endpoint, Availability::Unreachable);
                    last = err;
                }
                Err(err) => return Err(err),
            }
        }
    }

    if matches!(last, Error::QueryTimeout) {
        last = Error::LoginTimeout;
    }
    Err(last)
}

/// One-shot failback arming, run whenever a top-level operation finds the
/// session out of a transaction. The armed flag makes the next operation
/// hard-close the socket so the connect walk can move traffic back to the
/// recovered primary.
pub(crate) fn check_rc_time(session: &Session, state: &mut SessionState) {
    if !state.is_out_tran() || state.host_index == 0 {
        return;
    }
    let primary = state.hosts[0].clone();
    if host::registry().should_failback(&primary, session.config.rc_time) {
        info!(
            "arming failback towards {primary} for {}",
            session.config.canonical_url()
        );
        state.force_failback = true;
    }
}

/// The hard-close taken by prepare/execute entry points when the failback
/// flag is armed and the session is out of a transaction.
pub(crate) fn apply_force_failback(state: &mut SessionState) {
    if state.is_out_tran() && state.force_failback && state.wire.is_some() {
        state.close_socket();
        state.force_failback = false;
    }
}
