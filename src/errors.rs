pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Client-side error codes, kept compatible with the classic CCI numbering.
pub mod code {
    pub const NO_ERROR: i32 = 0;
    pub const NO_MORE_MEMORY: i32 = -101;
    pub const COMMUNICATION: i32 = -102;
    pub const NO_MORE_DATA: i32 = -103;
    pub const CONNECT: i32 = -104;
    pub const ALLOC_CON_HANDLE: i32 = -105;
    pub const REQ_HANDLE: i32 = -106;
    pub const CON_HANDLE: i32 = -107;
    pub const QUERY_TIMEOUT: i32 = -108;
    pub const LOGIN_TIMEOUT: i32 = -109;
    pub const BIND_INDEX: i32 = -110;
    pub const BIND_ARRAY_SIZE: i32 = -111;
    pub const INVALID_ARGS: i32 = -112;
    pub const INVALID_URL: i32 = -113;
    pub const INVALID_LOB_HANDLE: i32 = -114;
    pub const INVALID_LOB_READ_POS: i32 = -115;
    pub const INVALID_HOLDABILITY: i32 = -116;
    pub const INVALID_DATASOURCE: i32 = -117;
    pub const DATASOURCE_TIMEOUT: i32 = -118;
    pub const DATASOURCE_TIMEDWAIT: i32 = -119;
    pub const USED_CONNECTION: i32 = -120;
    pub const NOT_UPDATABLE: i32 = -121;
    pub const NO_SHARD_AVAILABLE: i32 = -122;
    pub const PARAM_NAME: i32 = -123;
    pub const NO_PROPERTY: i32 = -124;
    pub const INVALID_PROPERTY_VALUE: i32 = -125;
    pub const TYPE_CONVERSION: i32 = -126;
    pub const DBMS: i32 = -127;
}

/// Server-side (CAS) error codes.
pub mod cas_code {
    pub const DBMS: i32 = -1001;
    pub const NUM_BIND: i32 = -1002;
    pub const NO_MORE_DATA: i32 = -1003;
    pub const OBJECT: i32 = -1004;
    pub const SCHEMA_TYPE: i32 = -1005;
    pub const STMT_POOLING: i32 = -1006;
    pub const HOLDABLE_NOT_ALLOWED: i32 = -1007;
    pub const MAX_CLIENT_EXCEEDED: i32 = -1008;
    pub const FREE_SERVER: i32 = -1009;
    pub const DBSERVER_DISCONNECTED: i32 = -1010;
    pub const QUERY_CANCEL: i32 = -1011;
}

/// Database-server error codes that indicate the server went away while the
/// broker stayed up. A `Dbms` error carrying one of these is treated like a
/// lost connection by the failover driver.
pub mod server_code {
    pub const TM_SERVER_DOWN_UNILATERALLY_ABORTED: i32 = -988;
    pub const OBJ_NO_CONNECT: i32 = -73;
    pub const NET_SERVER_CRASHED: i32 = -199;
    pub const BO_CONNECT_FAILED: i32 = -677;
}

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error("an IO error occurred: {detail}")]
    Io {
        #[from]
        detail: std::io::Error,
    },

    #[error("not enough memory")]
    NoMoreMemory,

    #[error("cannot communicate with the broker")]
    Communication,

    #[error("no more data")]
    NoMoreData,

    #[error("cannot connect to the broker: {0}")]
    Connect(String),

    #[error("all connection handles are in use")]
    AllocConHandle,

    #[error("invalid request handle")]
    ReqHandle,

    #[error("invalid connection handle")]
    ConHandle,

    #[error("request timed out")]
    QueryTimeout,

    #[error("connecting timed out")]
    LoginTimeout,

    #[error("parameter index {0} is out of range")]
    BindIndex(usize),

    #[error("array binding size mismatch")]
    BindArraySize,

    #[error("invalid argument: {0}")]
    InvalidArgs(&'static str),

    #[error("invalid connection URL: {0}")]
    InvalidUrl(String),

    #[error("invalid LOB handle")]
    InvalidLobHandle,

    #[error("invalid LOB read position")]
    InvalidLobReadPos,

    #[error("invalid holdability mode")]
    InvalidHoldability,

    #[error("invalid datasource")]
    InvalidDatasource(&'static str),

    #[error("all pooled connections are busy")]
    DatasourceTimeout,

    #[error("interrupted while waiting for a pooled connection")]
    DatasourceTimedWait,

    #[error("the connection is in use on another thread")]
    UsedConnection,

    #[error("the result set is not updatable")]
    NotUpdatable,

    #[error("no shard is available")]
    NoShardAvailable,

    #[error("unknown parameter name: {0}")]
    ParamName(String),

    #[error("unknown property: {0}")]
    NoProperty(String),

    #[error("invalid value for property {key}: {value}")]
    InvalidPropertyValue { key: String, value: String },

    #[error("cannot convert the column value to the requested type")]
    TypeConversion,

    /// An error reported by the database server, with its own code space.
    #[error("DBMS error {code}: {message}")]
    Dbms { code: i32, message: String },

    #[error("invalid number of bound parameters")]
    CasNumBind,

    #[error("no more data in the result set")]
    CasNoMoreData,

    #[error("invalid object reference")]
    CasObject,

    #[error("invalid schema request type")]
    CasSchemaType,

    /// The server invalidated the cached execution plan, the statement must
    /// be prepared again.
    #[error("the prepared statement was evicted by the server")]
    StmtPooling,

    #[error("a holdable sensitive result set is not allowed")]
    HoldableNotAllowed,

    #[error("too many clients are connected to the broker")]
    MaxClientExceeded,

    #[error("the broker is handing the connection to another server")]
    FreeServer,

    #[error("the database server disconnected")]
    DbServerDisconnected,

    #[error("the request was cancelled")]
    QueryCancel,
}

impl Error {
    /// The legacy signed error code for this error.
    pub fn code(&self) -> i32 {
        match self {
            Error::Io { .. } => code::COMMUNICATION,
            Error::NoMoreMemory => code::NO_MORE_MEMORY,
            Error::Communication => code::COMMUNICATION,
            Error::NoMoreData => code::NO_MORE_DATA,
            Error::Connect(_) => code::CONNECT,
            Error::AllocConHandle => code::ALLOC_CON_HANDLE,
            Error::ReqHandle => code::REQ_HANDLE,
            Error::ConHandle => code::CON_HANDLE,
            Error::QueryTimeout => code::QUERY_TIMEOUT,
            Error::LoginTimeout => code::LOGIN_TIMEOUT,
            Error::BindIndex(_) => code::BIND_INDEX,
            Error::BindArraySize => code::BIND_ARRAY_SIZE,
            Error::InvalidArgs(_) => code::INVALID_ARGS,
            Error::InvalidUrl(_) => code::INVALID_URL,
            Error::InvalidLobHandle => code::INVALID_LOB_HANDLE,
            Error::InvalidLobReadPos => code::INVALID_LOB_READ_POS,
            Error::InvalidHoldability => code::INVALID_HOLDABILITY,
            Error::InvalidDatasource(_) => code::INVALID_DATASOURCE,
            Error::DatasourceTimeout => code::DATASOURCE_TIMEOUT,
            Error::DatasourceTimedWait => code::DATASOURCE_TIMEDWAIT,
            Error::UsedConnection => code::USED_CONNECTION,
            Error::NotUpdatable => code::NOT_UPDATABLE,
            Error::NoShardAvailable => code::NO_SHARD_AVAILABLE,
            Error::ParamName(_) => code::PARAM_NAME,
            Error::NoProperty(_) => code::NO_PROPERTY,
            Error::InvalidPropertyValue { .. } => code::INVALID_PROPERTY_VALUE,
            Error::TypeConversion => code::TYPE_CONVERSION,
            Error::Dbms { .. } => code::DBMS,
            Error::CasNumBind => cas_code::NUM_BIND,
            Error::CasNoMoreData => cas_code::NO_MORE_DATA,
            Error::CasObject => cas_code::OBJECT,
            Error::CasSchemaType => cas_code::SCHEMA_TYPE,
            Error::StmtPooling => cas_code::STMT_POOLING,
            Error::HoldableNotAllowed => cas_code::HOLDABLE_NOT_ALLOWED,
            Error::MaxClientExceeded => cas_code::MAX_CLIENT_EXCEEDED,
            Error::FreeServer => cas_code::FREE_SERVER,
            Error::DbServerDisconnected => cas_code::DBSERVER_DISCONNECTED,
            Error::QueryCancel => cas_code::QUERY_CANCEL,
        }
    }

    /// The server error code carried by a `Dbms` error.
    pub fn server_error_code(&self) -> Option<i32> {
        match self {
            Error::Dbms { code, .. } => Some(*code),
            _ => None,
        }
    }

    pub(crate) fn is_communication(&self) -> bool {
        matches!(self, Error::Communication | Error::Io { .. })
    }

    pub(crate) fn is_server_down(&self) -> bool {
        matches!(
            self.server_error_code(),
            Some(
                server_code::TM_SERVER_DOWN_UNILATERALLY_ABORTED
                    | server_code::OBJ_NO_CONNECT
                    | server_code::NET_SERVER_CRASHED
                    | server_code::BO_CONNECT_FAILED
            )
        )
    }

    /// Whether the failover driver may close the socket, pick another host
    /// and replay the request that produced this error.
    pub(crate) fn is_reconnectable(&self) -> bool {
        self.is_communication() || self.is_server_down()
    }

    /// Errors that mark a connect attempt's target host as unreachable
    /// during the alternate-host walk.
    pub(crate) fn marks_host_unreachable(&self) -> bool {
        matches!(
            self,
            Error::Communication | Error::Io { .. } | Error::Connect(_) | Error::LoginTimeout
        ) || matches!(self, Error::FreeServer)
    }
}

/// Identity of the broker worker serving a connection, used to tag error
/// messages and to address out-of-band cancel requests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CasInfo {
    pub cas_id: i32,
    pub cas_pid: i32,
}

/// The last error recorded on a connection, readable through
/// [`crate::get_last_error`] after a failed call.
#[derive(Debug, Clone, Default)]
pub struct ErrorRecord {
    pub code: i32,
    pub message: String,
}

impl ErrorRecord {
    pub(crate) fn clear(&mut self) {
        self.code = code::NO_ERROR;
        self.message.clear();
    }

    /// Write-once per call: the first error to fire wins.
    pub(crate) fn record(&mut self, code: i32, message: String) {
        if self.code == crate::errors::code::NO_ERROR {
            self.code = code;
            self.message = message;
        }
    }

    pub(crate) fn is_set(&self) -> bool {
        self.code != code::NO_ERROR
    }
}

/// Formats the operator-diagnosis suffix appended to every error message
/// copied out of a connection.
pub(crate) fn diagnostic_suffix(
    addr: &str,
    cas: CasInfo,
    shard_id: Option<i32>,
) -> String {
    match shard_id {
        Some(shard) => format!(
            "[PROXY INFO - {},{},{},{}]",
            addr, cas.cas_id, cas.cas_pid, shard
        ),
        None => format!("[CAS INFO - {},{},{}]", addr, cas.cas_id, cas.cas_pid),
    }
}
