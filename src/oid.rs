//! Object (OID) and collection-attribute entry points. Each wraps a single
//! protocol call in the failover driver; element data comes back through an
//! ordinary request handle so the cursor/fetch/get_data machinery applies.

use crate::connection::with_conn;
use crate::errors::{Error, Result};
use crate::handle::request::HandleKind;
use crate::handle::{alloc_req_handle, free_req_handle, table, ConnId, StmtId};
use crate::retry;
use crate::value::{Oid, Value};
use crate::wire::{ColumnInfo, OidCmd, SetOp, SeqOp, Tuple};

/// Reads the named attributes of an object into a one-row request handle.
pub async fn oid_get(conn: ConnId, oid: Oid, attributes: &[String]) -> Result<StmtId> {
    let attributes = attributes.to_vec();
    with_conn(conn, move |session, state| {
        Box::pin(async move {
            let index = alloc_req_handle(table(), state, session.slot, HandleKind::OidGet);
            state.set_query_deadline(None);
            let result = retry::retryable(session, state, Some(index), |state| {
                let attributes = attributes.clone();
                Box::pin(async move {
                    let timeout = state.remaining_time()?;
                    state.wire()?.oid_get(oid, &attributes, timeout).await
                })
            })
            .await;
            state.clear_deadline();
            match result {
                Ok(reply) => {
                    state.absorb_status(reply.status);
                    let req = state.req_mut(index)?;
                    req.columns = reply.columns;
                    req.total_rows = 1;
                    req.valid = true;
                    req.store_fetch_window(1, vec![reply.tuple]);
                    req.cursor.position = 1;
                    Ok(req.cookie)
                }
                Err(err) => {
                    free_req_handle(table(), state, index);
                    Err(err)
                }
            }
        })
    })
    .await
}

/// Runs a lifecycle command against an object. `ClassName` answers with the
/// class name, the other commands answer with nothing.
pub async fn oid_cmd(conn: ConnId, cmd: OidCmd, oid: Oid) -> Result<Option<String>> {
    with_conn(conn, move |session, state| {
        Box::pin(async move {
            state.set_query_deadline(None);
            let result = retry::retryable(session, state, None, |state| {
                Box::pin(async move {
                    let timeout = state.remaining_time()?;
                    state.wire()?.oid_cmd(cmd, oid, timeout).await
                })
            })
            .await;
            state.clear_deadline();
            result
        })
    })
    .await
}

/// Number of objects and pages of a class, optionally approximated.
pub async fn get_class_num_objs(
    conn: ConnId,
    class_name: &str,
    approximate: bool,
) -> Result<(i64, i64)> {
    let class_name = class_name.to_owned();
    with_conn(conn, move |session, state| {
        Box::pin(async move {
            state.set_query_deadline(None);
            let result = retry::retryable(session, state, None, |state| {
                let class_name = class_name.clone();
                Box::pin(async move {
                    let timeout = state.remaining_time()?;
                    state
                        .wire()?
                        .get_class_num_objs(&class_name, approximate, timeout)
                        .await
                })
            })
            .await;
            state.clear_deadline();
            result
        })
    })
    .await
}

/// Fetches a collection attribute into a request handle with one element
/// per row.
pub async fn col_get(conn: ConnId, oid: Oid, attribute: &str) -> Result<StmtId> {
    let attribute = attribute.to_owned();
    with_conn(conn, move |session, state| {
        Box::pin(async move {
            let index = alloc_req_handle(table(), state, session.slot, HandleKind::ColGet);
            state.set_query_deadline(None);
            let result = retry::retryable(session, state, Some(index), |state| {
                let attribute = attribute.clone();
                Box::pin(async move {
                    let timeout = state.remaining_time()?;
                    state.wire()?.col_get(oid, &attribute, timeout).await
                })
            })
            .await;
            state.clear_deadline();
            match result {
                Ok((collection, status)) => {
                    state.absorb_status(status);
                    let element_type = collection.element_type();
                    let values = collection.into_values();
                    let req = state.req_mut(index)?;
                    req.columns = vec![ColumnInfo {
                        name: attribute.clone(),
                        u_type: element_type,
                        table: String::new(),
                        precision: 0,
                        scale: 0,
                        nullable: true,
                    }];
                    req.total_rows = values.len() as i64;
                    req.valid = true;
                    let tuples = values
                        .into_iter()
                        .map(|value| Tuple {
                            oid: None,
                            values: vec![value],
                        })
                        .collect();
                    req.store_fetch_window(1, tuples);
                    req.cursor.position = 1;
                    Ok(req.cookie)
                }
                Err(err) => {
                    free_req_handle(table(), state, index);
                    Err(err)
                }
            }
        })
    })
    .await
}

/// Element count of a collection attribute.
pub async fn col_size(conn: ConnId, oid: Oid, attribute: &str) -> Result<i32> {
    let attribute = attribute.to_owned();
    with_conn(conn, move |session, state| {
        Box::pin(async move {
            state.set_query_deadline(None);
            let result = retry::retryable(session, state, None, |state| {
                let attribute = attribute.clone();
                Box::pin(async move {
                    let timeout = state.remaining_time()?;
                    state.wire()?.col_size(oid, &attribute, timeout).await
                })
            })
            .await;
            state.clear_deadline();
            result
        })
    })
    .await
}

pub async fn col_set_add(conn: ConnId, oid: Oid, attribute: &str, value: Value) -> Result<()> {
    col_set_op(conn, SetOp::Add, oid, attribute, value).await
}

pub async fn col_set_drop(conn: ConnId, oid: Oid, attribute: &str, value: Value) -> Result<()> {
    col_set_op(conn, SetOp::Drop, oid, attribute, value).await
}

async fn col_set_op(
    conn: ConnId,
    op: SetOp,
    oid: Oid,
    attribute: &str,
    value: Value,
) -> Result<()> {
    let attribute = attribute.to_owned();
    with_conn(conn, move |session, state| {
        Box::pin(async move {
            state.set_query_deadline(None);
            let result = retry::retryable(session, state, None, |state| {
                let attribute = attribute.clone();
                let value = value.clone();
                Box::pin(async move {
                    let timeout = state.remaining_time()?;
                    state
                        .wire()?
                        .col_set_op(op, oid, &attribute, &value, timeout)
                        .await
                })
            })
            .await;
            state.clear_deadline();
            result.map(|status| state.absorb_status(status))
        })
    })
    .await
}

pub async fn col_seq_insert(
    conn: ConnId,
    oid: Oid,
    attribute: &str,
    index: i32,
    value: Value,
) -> Result<()> {
    col_seq_op(conn, SeqOp::Insert, oid, attribute, index, Some(value)).await
}

pub async fn col_seq_put(
    conn: ConnId,
    oid: Oid,
    attribute: &str,
    index: i32,
    value: Value,
) -> Result<()> {
    col_seq_op(conn, SeqOp::Put, oid, attribute, index, Some(value)).await
}

pub async fn col_seq_drop(conn: ConnId, oid: Oid, attribute: &str, index: i32) -> Result<()> {
    col_seq_op(conn, SeqOp::Drop, oid, attribute, index, None).await
}

async fn col_seq_op(
    conn: ConnId,
    op: SeqOp,
    oid: Oid,
    attribute: &str,
    index: i32,
    value: Option<Value>,
) -> Result<()> {
    if index < 1 {
        return Err(Error::InvalidArgs("sequence index is 1-based"));
    }
    let attribute = attribute.to_owned();
    with_conn(conn, move |session, state| {
        Box::pin(async move {
            state.set_query_deadline(None);
            let result = retry::retryable(session, state, None, |state| {
                let attribute = attribute.clone();
                let value = value.clone();
                Box::pin(async move {
                    let timeout = state.remaining_time()?;
                    state
                        .wire()?
                        .col_seq_op(op, oid, &attribute, index, value.as_ref(), timeout)
                        .await
                })
            })
            .await;
            state.clear_deadline();
            result.map(|status| state.absorb_status(status))
        })
    })
    .await
}
