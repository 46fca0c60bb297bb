//! CUBRID driver for Rust, speaking the broker (CAS) protocol through a
//! pluggable wire layer.
//!
//! * opaque integer handles for connections and prepared statements, like
//!   the classic C client
//! * per-connection statement cache, reused across transactions when the
//!   broker advertises statement pooling
//! * transparent failover: transport errors outside a transaction close the
//!   socket, walk the alternate-host list under the login-timeout budget
//!   and replay the request
//! * a bounded connection pool ([`DataSource`]) with timed borrows and
//!   per-borrow session defaults
//!
//! The byte-level protocol is not part of this crate: bring an
//! implementation of [`wire::Connector`] / [`wire::WireSession`] and hand it
//! to [`connect_with_url`].
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use cubrs::{wire::Connector, CursorOrigin, ExecuteFlag, PrepareFlag};
//!
//! #[tokio::main]
//! async fn main() -> cubrs::Result<()> {
//!     let connector: Arc<dyn Connector> = todo!("your protocol implementation");
//!     let conn = cubrs::connect_with_url(
//!         connector,
//!         "cci:cubrid:127.0.0.1:33000:demodb:dba::?altHosts=backup:33000",
//!         None,
//!         None,
//!     )
//!     .await?;
//!
//!     let stmt = cubrs::prepare(conn, "select a from t order by a", PrepareFlag::NONE).await?;
//!     cubrs::execute(stmt, ExecuteFlag::NONE).await?;
//!     cubrs::cursor(stmt, 1, CursorOrigin::First).await?;
//!     cubrs::fetch(stmt).await?;
//!     let a = cubrs::get_data(stmt, 1).await?.as_i64()?;
//!     println!("a = {a}");
//!
//!     cubrs::close_req_handle(stmt).await?;
//!     cubrs::disconnect(conn).await?;
//!     Ok(())
//! }
//! ```

mod collection;
mod config;
mod connection;
mod datasource;
mod errors;
mod escape;
mod handle;
pub mod host;
mod lob;
mod oid;
mod retry;
mod schema;
mod statement;
mod value;
pub mod wire;

pub use crate::collection::{Collection, CollectionKind};
pub use crate::config::{
    DataSourceConfig, DbmsKind, Endpoint, IsolationLevel, Properties, UrlConfig,
};
pub use crate::connection::{
    cancel, connect, connect_with_url, disconnect, end_tran, get_autocommit, get_db_parameter,
    get_db_version, get_holdability, get_last_error, get_last_insert_id, get_login_timeout,
    get_shard_id, pconnect_with_url, savepoint, set_autocommit, set_db_parameter,
    set_holdability, set_isolation_level, set_lock_timeout, set_login_timeout,
};
pub use crate::datasource::{DataSource, PoolStatus};
pub use crate::errors::{cas_code, code, server_code, CasInfo, Error, Result};
pub use crate::escape::{escape_string, EscapeSource};
pub use crate::handle::request::CursorOrigin;
pub use crate::handle::{ConnId, StmtId};
pub use crate::lob::{lob_new, lob_read, lob_write, Lob, LOB_IO_LENGTH};
pub use crate::oid::{
    col_get, col_seq_drop, col_seq_insert, col_seq_put, col_set_add, col_set_drop, col_size,
    get_class_num_objs, oid_cmd, oid_get,
};
pub use crate::schema::{schema_info, ATTR_NAME_PATTERN_MATCH, CLASS_NAME_PATTERN_MATCH};
pub use crate::statement::{
    bind_param, bind_param_array, bind_param_array_size, close_req_handle, cursor, execute,
    execute_array, execute_batch, fetch, fetch_sensitive, get_data, get_query_plan,
    get_query_timeout, get_result_info, get_stmt_type, next_result, prepare, prepare_and_execute,
    register_out_param, set_fetch_size, set_max_row, set_query_timeout,
};
pub use crate::value::{BindValue, Oid, ParamMode, UType, Value};
pub use crate::wire::{
    ColumnInfo, DbParam, ExecuteFlag, LobKind, OidCmd, PrepareFlag, QueryResultInfo, SavepointCmd,
    SchemaType, StmtType, TranType,
};


const _: () = {
    const fn assert_send_sync<T: ?Sized + Send + Sync>() {}
    assert_send_sync::<DataSource>();
    assert_send_sync::<Error>();
};
