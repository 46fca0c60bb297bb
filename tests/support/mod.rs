//! A scripted in-memory broker for driving the driver without a server.
#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use cubrs::wire::{
    BrokerInfo, ColumnInfo, Connector, DbParam, ExecuteFlag, ExecuteReply, FetchReply, LobKind,
    LobLocator, OidCmd, OidGetReply, PrepareFlag, PrepareReply, QueryResultInfo, SavepointCmd,
    SchemaType, ServerStatus, SetOp, SeqOp, StmtType, TranType, Tuple, WireSession,
};
use cubrs::{
    CasInfo, Collection, CollectionKind, Endpoint, Error, Oid, Result, UType, Value,
};

pub struct BrokerState {
    /// Rows served to every query and schema request.
    pub rows: Vec<Vec<Value>>,
    pub columns: Vec<ColumnInfo>,
    pub down_hosts: HashSet<Endpoint>,
    pub connect_counts: HashMap<Endpoint, usize>,
    pub prepare_count: usize,
    pub execute_count: usize,
    pub fetch_count: usize,
    pub end_tran_count: usize,
    pub close_statement_count: usize,
    pub close_result_set_count: usize,
    pub fail_next_prepare: Option<Error>,
    pub fail_next_execute: Option<Error>,
    /// Consecutive executes that answer `STMT_POOLING`.
    pub stmt_pooling_failures: usize,
    /// Flags seen by each prepare, in order.
    pub prepare_flags: Vec<PrepareFlag>,
    pub executed_sqls: Vec<String>,
    pub param_sets: Vec<(DbParam, i32)>,
    pub no_backslash_escapes: i32,
    pub isolation: i32,
    pub lock_timeout: i32,
    pub last_insert_id: Option<String>,
    /// How long each execute busy-waits, to give cancel a window.
    pub execute_delay: Duration,
    pub next_stmt_id: i32,
    pub lob_store: Vec<u8>,
    pub collection: Option<Collection>,
}

impl Default for BrokerState {
    fn default() -> Self {
        BrokerState {
            rows: vec![vec![Value::Int(1)], vec![Value::Int(2)]],
            columns: vec![ColumnInfo {
                name: "a".into(),
                u_type: UType::Int,
                table: "t".into(),
                precision: 10,
                scale: 0,
                nullable: false,
            }],
            down_hosts: HashSet::new(),
            connect_counts: HashMap::new(),
            prepare_count: 0,
            execute_count: 0,
            fetch_count: 0,
            end_tran_count: 0,
            close_statement_count: 0,
            close_result_set_count: 0,
            fail_next_prepare: None,
            fail_next_execute: None,
            stmt_pooling_failures: 0,
            prepare_flags: Vec::new(),
            executed_sqls: Vec::new(),
            param_sets: Vec::new(),
            no_backslash_escapes: 0,
            isolation: 4,
            lock_timeout: -1,
            last_insert_id: None,
            execute_delay: Duration::ZERO,
            next_stmt_id: 1,
            lob_store: Vec::new(),
            collection: None,
        }
    }
}

/// The shared broker: one per test, handed to every mock connection.
pub struct MockBroker {
    pub state: Mutex<BrokerState>,
    pub info: Mutex<BrokerInfo>,
    /// Bumped by [`MockBroker::kill_sockets`]; connections from an older
    /// generation answer everything with a communication error.
    generation: AtomicUsize,
    cancelled: AtomicBool,
}

impl MockBroker {
    pub fn new() -> Arc<Self> {
        let _ = pretty_env_logger::try_init();
        Arc::new(MockBroker {
            state: Mutex::new(BrokerState::default()),
            info: Mutex::new(BrokerInfo {
                version: "11.2.0".into(),
                protocol_version: 7,
                statement_pooling: true,
                reconnect_when_server_down: false,
            }),
            generation: AtomicUsize::new(0),
            cancelled: AtomicBool::new(false),
        })
    }

    pub fn connector(self: &Arc<Self>) -> Arc<dyn Connector> {
        Arc::new(MockConnector {
            broker: self.clone(),
        })
    }

    /// Simulates the transport dying under every live connection.
    pub fn kill_sockets(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    pub fn take_host_down(&self, endpoint: &Endpoint) {
        self.state.lock().unwrap().down_hosts.insert(endpoint.clone());
    }

    pub fn bring_host_up(&self, endpoint: &Endpoint) {
        self.state.lock().unwrap().down_hosts.remove(endpoint);
    }

    pub fn connects_to(&self, endpoint: &Endpoint) -> usize {
        self.state
            .lock()
            .unwrap()
            .connect_counts
            .get(endpoint)
            .copied()
            .unwrap_or(0)
    }

    pub fn prepare_count(&self) -> usize {
        self.state.lock().unwrap().prepare_count
    }

    pub fn execute_count(&self) -> usize {
        self.state.lock().unwrap().execute_count
    }
}

pub struct MockConnector {
    broker: Arc<MockBroker>,
}

#[async_trait]
impl Connector for MockConnector {
    async fn open(
        &self,
        endpoint: &Endpoint,
        _db: &str,
        _user: &str,
        _password: &str,
        _timeout: Option<Duration>,
    ) -> Result<Box<dyn WireSession>> {
        let mut state = self.broker.state.lock().unwrap();
        if state.down_hosts.contains(endpoint) {
            return Err(Error::Connect(format!("{endpoint} is down")));
        }
        *state.connect_counts.entry(endpoint.clone()).or_insert(0) += 1;
        drop(state);
        Ok(Box::new(MockWire {
            broker: self.broker.clone(),
            info: self.broker.info.lock().unwrap().clone(),
            generation: self.broker.generation.load(Ordering::SeqCst),
            in_tran: false,
        }))
    }

    async fn check_alive(&self, endpoint: &Endpoint, _timeout: Duration) -> bool {
        !self.broker.state.lock().unwrap().down_hosts.contains(endpoint)
    }

    async fn cancel(&self, _endpoint: &Endpoint, _cas: CasInfo) -> Result<()> {
        self.broker.cancelled.store(true, Ordering::SeqCst);
        Ok(())
    }
}

pub struct MockWire {
    broker: Arc<MockBroker>,
    info: BrokerInfo,
    generation: usize,
    in_tran: bool,
}

impl std::fmt::Debug for MockWire {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockWire")
            .field("info", &self.info)
            .field("generation", &self.generation)
            .field("in_tran", &self.in_tran)
            .finish()
    }
}

impl MockWire {
    fn check_socket(&self) -> Result<()> {
        if self.generation != self.broker.generation.load(Ordering::SeqCst) {
            return Err(Error::Communication);
        }
        Ok(())
    }

    fn status(&self) -> ServerStatus {
        ServerStatus {
            in_tran: self.in_tran,
            shard_id: None,
        }
    }
}

#[async_trait]
impl WireSession for MockWire {
    fn broker_info(&self) -> &BrokerInfo {
        &self.info
    }

    fn cas_info(&self) -> CasInfo {
        CasInfo {
            cas_id: 1,
            cas_pid: 4711,
        }
    }

    async fn ping(&mut self) -> Result<()> {
        self.check_socket()
    }

    async fn prepare(
        &mut self,
        sql: &str,
        flag: PrepareFlag,
        _timeout: Option<Duration>,
    ) -> Result<PrepareReply> {
        self.check_socket()?;
        let mut state = self.broker.state.lock().unwrap();
        if let Some(err) = state.fail_next_prepare.take() {
            return Err(err);
        }
        state.prepare_count += 1;
        state.prepare_flags.push(flag);
        state.executed_sqls.push(sql.to_owned());
        let stmt_id = state.next_stmt_id;
        state.next_stmt_id += 1;
        Ok(PrepareReply {
            stmt_id,
            stmt_type: StmtType::Select,
            columns: state.columns.clone(),
            num_params: 0,
            status: self.status(),
        })
    }

    async fn execute(
        &mut self,
        _stmt_id: i32,
        _flag: ExecuteFlag,
        _binds: &[cubrs::BindValue],
        _max_rows: i64,
        timeout: Option<Duration>,
    ) -> Result<ExecuteReply> {
        self.check_socket()?;
        let delay = {
            let mut state = self.broker.state.lock().unwrap();
            if let Some(err) = state.fail_next_execute.take() {
                return Err(err);
            }
            if state.stmt_pooling_failures > 0 {
                state.stmt_pooling_failures -= 1;
                return Err(Error::StmtPooling);
            }
            state.execute_delay
        };
        if !delay.is_zero() {
            // a long-running statement: honor the deadline and watch for an
            // out-of-band cancel, like the real protocol layer does
            let budget = timeout.unwrap_or(Duration::MAX);
            let started = tokio::time::Instant::now();
            while started.elapsed() < delay {
                if self.broker.cancelled.swap(false, Ordering::SeqCst) {
                    return Err(Error::QueryCancel);
                }
                if started.elapsed() >= budget {
                    return Err(Error::QueryTimeout);
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }
        let mut state = self.broker.state.lock().unwrap();
        state.execute_count += 1;
        self.in_tran = true;
        Ok(ExecuteReply {
            affected: state.rows.len() as i64,
            results: vec![QueryResultInfo {
                stmt_type: StmtType::Select,
                affected: state.rows.len() as i64,
            }],
            last_insert_id: state.last_insert_id.clone(),
            status: self.status(),
        })
    }

    async fn execute_array(
        &mut self,
        _stmt_id: i32,
        _flag: ExecuteFlag,
        rows: &[Vec<cubrs::BindValue>],
        _timeout: Option<Duration>,
    ) -> Result<ExecuteReply> {
        self.check_socket()?;
        let mut state = self.broker.state.lock().unwrap();
        state.execute_count += 1;
        self.in_tran = true;
        Ok(ExecuteReply {
            affected: rows.len() as i64,
            results: rows
                .iter()
                .map(|_| QueryResultInfo {
                    stmt_type: StmtType::Insert,
                    affected: 1,
                })
                .collect(),
            last_insert_id: state.last_insert_id.take(),
            status: self.status(),
        })
    }

    async fn execute_batch(
        &mut self,
        sqls: &[String],
        _timeout: Option<Duration>,
    ) -> Result<ExecuteReply> {
        self.check_socket()?;
        let mut state = self.broker.state.lock().unwrap();
        state.execute_count += 1;
        state.executed_sqls.extend(sqls.iter().cloned());
        self.in_tran = true;
        Ok(ExecuteReply {
            affected: sqls.len() as i64,
            results: sqls
                .iter()
                .map(|_| QueryResultInfo {
                    stmt_type: StmtType::Other,
                    affected: 1,
                })
                .collect(),
            last_insert_id: None,
            status: self.status(),
        })
    }

    async fn next_result(
        &mut self,
        _stmt_id: i32,
        _timeout: Option<Duration>,
    ) -> Result<ExecuteReply> {
        self.check_socket()?;
        Err(Error::CasNoMoreData)
    }

    async fn fetch(
        &mut self,
        _stmt_id: i32,
        start_pos: i64,
        fetch_size: i32,
        _timeout: Option<Duration>,
    ) -> Result<FetchReply> {
        self.check_socket()?;
        let mut state = self.broker.state.lock().unwrap();
        state.fetch_count += 1;
        let start = (start_pos.max(1) - 1) as usize;
        let tuples = state
            .rows
            .iter()
            .skip(start)
            .take(fetch_size as usize)
            .map(|values| Tuple {
                oid: None,
                values: values.clone(),
            })
            .collect();
        Ok(FetchReply {
            tuples,
            status: self.status(),
        })
    }

    async fn close_statement(&mut self, _stmt_id: i32, _timeout: Option<Duration>) -> Result<()> {
        self.check_socket()?;
        self.broker.state.lock().unwrap().close_statement_count += 1;
        Ok(())
    }

    async fn close_result_set(&mut self, _stmt_id: i32, _timeout: Option<Duration>) -> Result<()> {
        self.check_socket()?;
        self.broker.state.lock().unwrap().close_result_set_count += 1;
        Ok(())
    }

    async fn end_tran(
        &mut self,
        _tran: TranType,
        _timeout: Option<Duration>,
    ) -> Result<ServerStatus> {
        self.check_socket()?;
        self.broker.state.lock().unwrap().end_tran_count += 1;
        self.in_tran = false;
        Ok(self.status())
    }

    async fn savepoint(
        &mut self,
        _cmd: SavepointCmd,
        _name: &str,
        _timeout: Option<Duration>,
    ) -> Result<ServerStatus> {
        self.check_socket()?;
        Ok(self.status())
    }

    async fn get_db_parameter(
        &mut self,
        param: DbParam,
        _timeout: Option<Duration>,
    ) -> Result<i32> {
        self.check_socket()?;
        let state = self.broker.state.lock().unwrap();
        Ok(match param {
            DbParam::IsolationLevel => state.isolation,
            DbParam::LockTimeout => state.lock_timeout,
            DbParam::MaxStringLength => 1_073_741_823,
            DbParam::AutoCommit => 1,
            DbParam::NoBackslashEscapes => state.no_backslash_escapes,
        })
    }

    async fn set_db_parameter(
        &mut self,
        param: DbParam,
        value: i32,
        _timeout: Option<Duration>,
    ) -> Result<()> {
        self.check_socket()?;
        let mut state = self.broker.state.lock().unwrap();
        state.param_sets.push((param, value));
        match param {
            DbParam::IsolationLevel => state.isolation = value,
            DbParam::LockTimeout => state.lock_timeout = value,
            DbParam::NoBackslashEscapes => state.no_backslash_escapes = value,
            _ => {}
        }
        Ok(())
    }

    async fn get_db_version(&mut self, _timeout: Option<Duration>) -> Result<String> {
        self.check_socket()?;
        Ok(self.info.version.clone())
    }

    async fn get_query_plan(&mut self, _stmt_id: i32, _timeout: Option<Duration>) -> Result<String> {
        self.check_socket()?;
        Ok("Index scan(t t, idx)".into())
    }

    async fn schema_info(
        &mut self,
        _kind: SchemaType,
        _class_name: Option<&str>,
        _attr_name: Option<&str>,
        _pattern_flag: i32,
        _timeout: Option<Duration>,
    ) -> Result<PrepareReply> {
        self.check_socket()?;
        let mut state = self.broker.state.lock().unwrap();
        let stmt_id = state.next_stmt_id;
        state.next_stmt_id += 1;
        Ok(PrepareReply {
            stmt_id,
            stmt_type: StmtType::Select,
            columns: state.columns.clone(),
            num_params: 0,
            status: self.status(),
        })
    }

    async fn oid_get(
        &mut self,
        oid: Oid,
        attributes: &[String],
        _timeout: Option<Duration>,
    ) -> Result<OidGetReply> {
        self.check_socket()?;
        Ok(OidGetReply {
            columns: attributes
                .iter()
                .map(|name| ColumnInfo {
                    name: name.clone(),
                    u_type: UType::String,
                    table: "t".into(),
                    precision: 0,
                    scale: 0,
                    nullable: true,
                })
                .collect(),
            tuple: Tuple {
                oid: Some(oid),
                values: attributes
                    .iter()
                    .map(|name| Value::Str(format!("{name}-value")))
                    .collect(),
            },
            status: self.status(),
        })
    }

    async fn oid_cmd(
        &mut self,
        cmd: OidCmd,
        _oid: Oid,
        _timeout: Option<Duration>,
    ) -> Result<Option<String>> {
        self.check_socket()?;
        Ok(match cmd {
            OidCmd::ClassName => Some("t".into()),
            _ => None,
        })
    }

    async fn get_class_num_objs(
        &mut self,
        _class_name: &str,
        _approximate: bool,
        _timeout: Option<Duration>,
    ) -> Result<(i64, i64)> {
        self.check_socket()?;
        Ok((42, 7))
    }

    async fn lob_new(&mut self, kind: LobKind, _timeout: Option<Duration>) -> Result<LobLocator> {
        self.check_socket()?;
        Ok(LobLocator {
            kind,
            locator: Bytes::from_static(b"lob-0001"),
            size: 0,
        })
    }

    async fn lob_read(
        &mut self,
        _lob: &LobLocator,
        offset: u64,
        length: usize,
        _timeout: Option<Duration>,
    ) -> Result<Bytes> {
        self.check_socket()?;
        let state = self.broker.state.lock().unwrap();
        let start = (offset as usize).min(state.lob_store.len());
        let end = (start + length).min(state.lob_store.len());
        Ok(Bytes::copy_from_slice(&state.lob_store[start..end]))
    }

    async fn lob_write(
        &mut self,
        _lob: &LobLocator,
        offset: u64,
        data: &[u8],
        _timeout: Option<Duration>,
    ) -> Result<usize> {
        self.check_socket()?;
        let mut state = self.broker.state.lock().unwrap();
        let offset = offset as usize;
        if state.lob_store.len() < offset + data.len() {
            state.lob_store.resize(offset + data.len(), 0);
        }
        state.lob_store[offset..offset + data.len()].copy_from_slice(data);
        Ok(data.len())
    }

    async fn col_get(
        &mut self,
        _oid: Oid,
        _attribute: &str,
        _timeout: Option<Duration>,
    ) -> Result<(Collection, ServerStatus)> {
        self.check_socket()?;
        let state = self.broker.state.lock().unwrap();
        let collection = state.collection.clone().unwrap_or_else(|| {
            Collection::new(
                CollectionKind::Sequence,
                UType::Int,
                vec![Value::Int(10), Value::Int(20)],
            )
        });
        Ok((collection, self.status()))
    }

    async fn col_size(
        &mut self,
        _oid: Oid,
        _attribute: &str,
        _timeout: Option<Duration>,
    ) -> Result<i32> {
        self.check_socket()?;
        let state = self.broker.state.lock().unwrap();
        Ok(state
            .collection
            .as_ref()
            .map(|collection| collection.len() as i32)
            .unwrap_or(2))
    }

    async fn col_set_op(
        &mut self,
        _op: SetOp,
        _oid: Oid,
        _attribute: &str,
        _value: &Value,
        _timeout: Option<Duration>,
    ) -> Result<ServerStatus> {
        self.check_socket()?;
        Ok(self.status())
    }

    async fn col_seq_op(
        &mut self,
        _op: SeqOp,
        _oid: Oid,
        _attribute: &str,
        _index: i32,
        _value: Option<&Value>,
        _timeout: Option<Duration>,
    ) -> Result<ServerStatus> {
        self.check_socket()?;
        Ok(self.status())
    }
}

/// A unique endpoint per test, so the global host registry never crosses
/// test boundaries.
pub fn unique_endpoint(tag: &str) -> Endpoint {
    use std::sync::atomic::AtomicU32;
    static COUNTER: AtomicU32 = AtomicU32::new(0);
    let n = COUNTER.fetch_add(1, Ordering::SeqCst);
    Endpoint::new(format!("{tag}-{n}.test"), 33000)
}

pub fn url_for(endpoint: &Endpoint) -> String {
    format!(
        "cci:cubrid:{}:{}:demodb:dba::",
        endpoint.host, endpoint.port
    )
}
