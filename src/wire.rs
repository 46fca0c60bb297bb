//! Contracts of the protocol layer.
//!
//! The driver core never frames bytes itself; it drives these traits. A
//! [`Connector`] owns socket establishment and the out-of-band cancel
//! channel, a [`WireSession`] owns one live broker conversation. Every
//! request-bearing call takes the remaining deadline budget and returns a
//! reply that carries the server's transaction-status flag.

use std::ops::{BitOr, BitOrAssign};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::collection::Collection;
use crate::config::Endpoint;
use crate::errors::{CasInfo, Result};
use crate::value::{BindValue, Oid, UType, Value};

/// Protocol revision at which the broker accepts a pinned-plan retry after
/// `STMT_POOLING`.
pub const PROTOCOL_V7: u8 = 7;

/// Capabilities and versions advertised by the broker at login.
#[derive(Debug, Clone, Default)]
pub struct BrokerInfo {
    pub version: String,
    pub protocol_version: u8,
    /// Whether the broker keeps prepared statements across transactions.
    pub statement_pooling: bool,
    /// Whether the broker transparently reconnects to a restarted server,
    /// making a client-side reconnect unnecessary for server-down errors.
    pub reconnect_when_server_down: bool,
}

/// Transaction-status flag piggybacked on every reply, plus the shard that
/// served the request for shard-aware connections.
#[derive(Debug, Clone, Copy, Default)]
pub struct ServerStatus {
    pub in_tran: bool,
    pub shard_id: Option<i32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranType {
    Commit,
    Rollback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SavepointCmd {
    Set,
    Rollback,
}

/// Statement kinds as reported by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[non_exhaustive]
pub enum StmtType {
    #[default]
    Select,
    Insert,
    Update,
    Delete,
    Call,
    Other,
}

impl StmtType {
    pub fn has_result_set(&self) -> bool {
        matches!(self, StmtType::Select | StmtType::Call)
    }
}

/// Prepare option bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PrepareFlag(u8);

impl PrepareFlag {
    pub const NONE: PrepareFlag = PrepareFlag(0);
    pub const HOLDABLE: PrepareFlag = PrepareFlag(0x01);
    pub const UPDATABLE: PrepareFlag = PrepareFlag(0x02);
    pub const XASL_CACHE_PINNED: PrepareFlag = PrepareFlag(0x04);

    pub fn contains(&self, other: PrepareFlag) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn bits(&self) -> u8 {
        self.0
    }
}

impl BitOr for PrepareFlag {
    type Output = PrepareFlag;

    fn bitor(self, rhs: PrepareFlag) -> PrepareFlag {
        PrepareFlag(self.0 | rhs.0)
    }
}

impl BitOrAssign for PrepareFlag {
    fn bitor_assign(&mut self, rhs: PrepareFlag) {
        self.0 |= rhs.0;
    }
}

/// Execute option bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExecuteFlag(u8);

impl ExecuteFlag {
    pub const NONE: ExecuteFlag = ExecuteFlag(0);
    /// Asynchronous execution, unsupported and stripped by the driver.
    pub const ASYNC: ExecuteFlag = ExecuteFlag(0x01);
    pub const QUERY_ALL: ExecuteFlag = ExecuteFlag(0x02);
    pub const QUERY_INFO: ExecuteFlag = ExecuteFlag(0x04);
    pub const ONLY_QUERY_PLAN: ExecuteFlag = ExecuteFlag(0x08);

    pub fn contains(&self, other: ExecuteFlag) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn without(self, other: ExecuteFlag) -> ExecuteFlag {
        ExecuteFlag(self.0 & !other.0)
    }

    pub fn bits(&self) -> u8 {
        self.0
    }
}

impl BitOr for ExecuteFlag {
    type Output = ExecuteFlag;

    fn bitor(self, rhs: ExecuteFlag) -> ExecuteFlag {
        ExecuteFlag(self.0 | rhs.0)
    }
}

impl BitOrAssign for ExecuteFlag {
    fn bitor_assign(&mut self, rhs: ExecuteFlag) {
        self.0 |= rhs.0;
    }
}

#[derive(Debug, Clone)]
pub struct ColumnInfo {
    pub name: String,
    pub u_type: UType,
    pub table: String,
    pub precision: i32,
    pub scale: i16,
    pub nullable: bool,
}

#[derive(Debug, Clone)]
pub struct PrepareReply {
    /// The server-assigned statement id.
    pub stmt_id: i32,
    pub stmt_type: StmtType,
    pub columns: Vec<ColumnInfo>,
    pub num_params: usize,
    pub status: ServerStatus,
}

/// One entry of the query-result vector of an execute.
#[derive(Debug, Clone, Copy)]
pub struct QueryResultInfo {
    pub stmt_type: StmtType,
    pub affected: i64,
}

#[derive(Debug, Clone)]
pub struct ExecuteReply {
    pub affected: i64,
    pub results: Vec<QueryResultInfo>,
    /// The generated key of the last insert, buffered per connection.
    pub last_insert_id: Option<String>,
    pub status: ServerStatus,
}

#[derive(Debug, Clone, Default)]
pub struct Tuple {
    pub oid: Option<Oid>,
    pub values: Vec<Value>,
}

#[derive(Debug, Clone)]
pub struct FetchReply {
    pub tuples: Vec<Tuple>,
    pub status: ServerStatus,
}

#[derive(Debug, Clone)]
pub struct OidGetReply {
    pub columns: Vec<ColumnInfo>,
    pub tuple: Tuple,
    pub status: ServerStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OidCmd {
    Drop,
    IsInstance,
    LockRead,
    LockWrite,
    ClassName,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum SchemaType {
    Class,
    VClass,
    Attribute,
    ClassAttribute,
    Method,
    Constraint,
    PrimaryKey,
    ImportedKeys,
    ExportedKeys,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetOp {
    Add,
    Drop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeqOp {
    Insert,
    Put,
    Drop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LobKind {
    Blob,
    Clob,
}

/// An opaque server-side locator plus the size the server reported for it.
#[derive(Debug, Clone)]
pub struct LobLocator {
    pub kind: LobKind,
    pub locator: Bytes,
    pub size: u64,
}

/// Session parameters addressable through `get_db_parameter` /
/// `set_db_parameter`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbParam {
    IsolationLevel,
    LockTimeout,
    MaxStringLength,
    AutoCommit,
    NoBackslashEscapes,
}

/// Socket establishment and the out-of-band control channel.
///
/// Implementations frame the handshake; the driver supplies the endpoint to
/// try and the remaining login budget. Open failures must map onto the
/// `Connect` / `Communication` / `LoginTimeout` / `FreeServer` taxonomy so
/// the alternate-host walk can classify them.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn open(
        &self,
        endpoint: &Endpoint,
        db: &str,
        user: &str,
        password: &str,
        timeout: Option<Duration>,
    ) -> Result<Box<dyn WireSession>>;

    /// A cheap liveness probe used by the background health checker.
    async fn check_alive(&self, endpoint: &Endpoint, timeout: Duration) -> bool;

    /// Opens a fresh control socket and asks the broker to cancel the
    /// request currently running on the worker identified by `cas`.
    async fn cancel(&self, endpoint: &Endpoint, cas: CasInfo) -> Result<()>;
}

/// One live conversation with a broker worker.
#[allow(clippy::too_many_arguments)]
#[async_trait]
pub trait WireSession: Send + std::fmt::Debug {
    fn broker_info(&self) -> &BrokerInfo;

    fn cas_info(&self) -> CasInfo;

    /// Health check on the open socket; an error means the socket is dead.
    async fn ping(&mut self) -> Result<()>;

    async fn prepare(
        &mut self,
        sql: &str,
        flag: PrepareFlag,
        timeout: Option<Duration>,
    ) -> Result<PrepareReply>;

    async fn execute(
        &mut self,
        stmt_id: i32,
        flag: ExecuteFlag,
        binds: &[BindValue],
        max_rows: i64,
        timeout: Option<Duration>,
    ) -> Result<ExecuteReply>;

    async fn execute_array(
        &mut self,
        stmt_id: i32,
        flag: ExecuteFlag,
        rows: &[Vec<BindValue>],
        timeout: Option<Duration>,
    ) -> Result<ExecuteReply>;

    async fn execute_batch(
        &mut self,
        sqls: &[String],
        timeout: Option<Duration>,
    ) -> Result<ExecuteReply>;

    async fn next_result(&mut self, stmt_id: i32, timeout: Option<Duration>)
        -> Result<ExecuteReply>;

    async fn fetch(
        &mut self,
        stmt_id: i32,
        start_pos: i64,
        fetch_size: i32,
        timeout: Option<Duration>,
    ) -> Result<FetchReply>;

    async fn close_statement(&mut self, stmt_id: i32, timeout: Option<Duration>) -> Result<()>;

    /// Closes the result set of a statement while keeping the statement
    /// itself prepared, so a pooled handle can be re-executed later.
    async fn close_result_set(&mut self, stmt_id: i32, timeout: Option<Duration>) -> Result<()>;

    async fn end_tran(&mut self, tran: TranType, timeout: Option<Duration>)
        -> Result<ServerStatus>;

    async fn savepoint(
        &mut self,
        cmd: SavepointCmd,
        name: &str,
        timeout: Option<Duration>,
    ) -> Result<ServerStatus>;

    async fn get_db_parameter(&mut self, param: DbParam, timeout: Option<Duration>)
        -> Result<i32>;

    async fn set_db_parameter(
        &mut self,
        param: DbParam,
        value: i32,
        timeout: Option<Duration>,
    ) -> Result<()>;

    async fn get_db_version(&mut self, timeout: Option<Duration>) -> Result<String>;

    async fn get_query_plan(&mut self, stmt_id: i32, timeout: Option<Duration>) -> Result<String>;

    async fn schema_info(
        &mut self,
        kind: SchemaType,
        class_name: Option<&str>,
        attr_name: Option<&str>,
        pattern_flag: i32,
        timeout: Option<Duration>,
    ) -> Result<PrepareReply>;

    async fn oid_get(
        &mut self,
        oid: Oid,
        attributes: &[String],
        timeout: Option<Duration>,
    ) -> Result<OidGetReply>;

    async fn oid_cmd(
        &mut self,
        cmd: OidCmd,
        oid: Oid,
        timeout: Option<Duration>,
    ) -> Result<Option<String>>;

    async fn get_class_num_objs(
        &mut self,
        class_name: &str,
        approximate: bool,
        timeout: Option<Duration>,
    ) -> Result<(i64, i64)>;

    async fn lob_new(&mut self, kind: LobKind, timeout: Option<Duration>) -> Result<LobLocator>;

    async fn lob_read(
        &mut self,
        lob: &LobLocator,
        offset: u64,
        length: usize,
        timeout: Option<Duration>,
    ) -> Result<Bytes>;

    async fn lob_write(
        &mut self,
        lob: &LobLocator,
        offset: u64,
        data: &[u8],
        timeout: Option<Duration>,
    ) -> Result<usize>;

    async fn col_get(
        &mut self,
        oid: Oid,
        attribute: &str,
        timeout: Option<Duration>,
    ) -> Result<(Collection, ServerStatus)>;

    async fn col_size(
        &mut self,
        oid: Oid,
        attribute: &str,
        timeout: Option<Duration>,
    ) -> Result<i32>;

    async fn col_set_op(
        &mut self,
        op: SetOp,
        oid: Oid,
        attribute: &str,
        value: &Value,
        timeout: Option<Duration>,
    ) -> Result<ServerStatus>;

    async fn col_seq_op(
        &mut self,
        op: SeqOp,
        oid: Oid,
        attribute: &str,
        index: i32,
        value: Option<&Value>,
        timeout: Option<Duration>,
    ) -> Result<ServerStatus>;
}
