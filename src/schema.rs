//! Catalog queries. The server answers a schema request with a statement-like
//! result set, so the returned id feeds the ordinary cursor/fetch machinery.

use crate::connection::with_conn;
use crate::errors::Result;
use crate::handle::request::HandleKind;
use crate::handle::{alloc_req_handle, free_req_handle, table, ConnId, StmtId};
use crate::retry;
use crate::wire::SchemaType;

/// Match `class_name` as a pattern rather than an exact name.
pub const CLASS_NAME_PATTERN_MATCH: i32 = 0x01;
/// Match `attr_name` as a pattern rather than an exact name.
pub const ATTR_NAME_PATTERN_MATCH: i32 = 0x02;

/// Requests catalog information and returns a fetchable statement id.
pub async fn schema_info(
    conn: ConnId,
    kind: SchemaType,
    class_name: Option<&str>,
    attr_name: Option<&str>,
    pattern_flag: i32,
) -> Result<StmtId> {
    let class_name = class_name.map(str::to_owned);
    let attr_name = attr_name.map(str::to_owned);
    with_conn(conn, move |session, state| {
        Box::pin(async move {
            let index = alloc_req_handle(table(), state, session.slot, HandleKind::SchemaInfo);
            state.set_query_deadline(None);
            let result = retry::retryable(session, state, Some(index), |state| {
                let class_name = class_name.clone();
                let attr_name = attr_name.clone();
                Box::pin(async move {
                    let timeout = state.remaining_time()?;
                    state
                        .wire()?
                        .schema_info(
                            kind,
                            class_name.as_deref(),
                            attr_name.as_deref(),
                            pattern_flag,
                            timeout,
                        )
                        .await
                })
            })
            .await;
            state.clear_deadline();
            match result {
                Ok(reply) => {
                    state.absorb_status(reply.status);
                    let req = state.req_mut(index)?;
                    req.server_stmt_id = reply.stmt_id;
                    req.stmt_type = reply.stmt_type;
                    req.columns = reply.columns;
                    req.valid = true;
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
