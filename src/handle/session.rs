use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use crate::config::{Endpoint, IsolationLevel, UrlConfig};
use crate::datasource::DataSourceShared;
use crate::errors::{CasInfo, Error, ErrorRecord, Result};
use crate::handle::request::ReqHandle;
use crate::handle::stmt_pool::StmtPool;
use crate::wire::{BrokerInfo, Connector, ServerStatus, WireSession};

pub(crate) const DEFAULT_MAX_OPEN_PREPARED_STATEMENT: usize = 1_000;

/// Whether the server has an open transaction for this session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TranStatus {
    OutTran,
    InTran,
}

/// The deadline of the call currently in flight. Absent means the call may
/// block indefinitely.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Deadline {
    started: Instant,
    budget: Duration,
}

impl Deadline {
    fn new(budget: Duration) -> Self {
        Deadline {
            started: Instant::now(),
            budget,
        }
    }

    fn remaining(&self) -> Option<Duration> {
        self.budget.checked_sub(self.started.elapsed())
    }
}

/// Identity of one connection slot. The mutable session state lives behind
/// an async mutex which doubles as the classic `used` flag: holding the
/// guard is being the one caller allowed on this connection. Cancel reaches
/// around it through [`Session::control`].
pub(crate) struct Session {
    pub(crate) slot: usize,
    pub(crate) config: UrlConfig,
    pub(crate) connector: Arc<dyn Connector>,
    pub(crate) state: Mutex<SessionState>,
    /// Worker identity for the out-of-band cancel channel.
    pub(crate) control: StdMutex<ControlInfo>,
    pub(crate) datasource: StdMutex<Option<Arc<DataSourceShared>>>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session").field("slot", &self.slot).finish()
    }
}

#[derive(Debug, Clone, Default)]
pub(crate) struct ControlInfo {
    pub(crate) endpoint: Option<Endpoint>,
    pub(crate) cas: CasInfo,
}

pub(crate) struct SessionState {
    pub(crate) wire: Option<Box<dyn WireSession>>,
    pub(crate) tran_status: TranStatus,
    pub(crate) autocommit: bool,
    pub(crate) isolation: Option<IsolationLevel>,
    pub(crate) lock_timeout: Option<Duration>,
    pub(crate) login_timeout: Option<Duration>,
    pub(crate) query_timeout: Option<Duration>,
    pub(crate) disconnect_on_query_timeout: bool,
    pub(crate) deadline: Option<Deadline>,
    /// Walk order for connects; index 0 is the primary.
    pub(crate) hosts: Vec<Endpoint>,
    pub(crate) host_index: usize,
    pub(crate) force_failback: bool,
    pub(crate) broker_info: BrokerInfo,
    pub(crate) last_error: ErrorRecord,
    pub(crate) reqs: Vec<Option<ReqHandle>>,
    pub(crate) stmt_pool: StmtPool,
    pub(crate) no_backslash_escapes: Option<bool>,
    pub(crate) holdability: bool,
    pub(crate) last_shard_id: Option<i32>,
    pub(crate) last_insert_id: Option<String>,
    /// Whether disconnect parks this handle in the pconnect cache.
    pub(crate) pconnect: bool,
}

impl Session {
    pub(crate) fn new(slot: usize, config: UrlConfig, connector: Arc<dyn Connector>) -> Self {
        let state = SessionState {
            wire: None,
            tran_status: TranStatus::OutTran,
            autocommit: true,
            isolation: None,
            lock_timeout: None,
            login_timeout: config.login_timeout,
            query_timeout: config.query_timeout,
            disconnect_on_query_timeout: config.disconnect_on_query_timeout,
            deadline: None,
            hosts: config.hosts(),
            host_index: 0,
            force_failback: false,
            broker_info: BrokerInfo::default(),
            last_error: ErrorRecord::default(),
            reqs: Vec::new(),
            stmt_pool: StmtPool::new(DEFAULT_MAX_OPEN_PREPARED_STATEMENT),
            no_backslash_escapes: None,
            holdability: false,
            last_shard_id: None,
            last_insert_id: None,
            pconnect: false,
        };
        Session {
            slot,
            config,
            connector,
            state: Mutex::new(state),
            control: StdMutex::new(ControlInfo::default()),
            datasource: StdMutex::new(None),
        }
    }

    /// Exact identity used by the pconnect cache and the datasource pool.
    pub(crate) fn matches(&self, config: &UrlConfig) -> bool {
        self.config.endpoint == config.endpoint
            && self.config.db == config.db
            && self.config.user == config.user
            && self.config.password == config.password
    }

    pub(crate) fn update_control(&self, endpoint: &Endpoint, cas: CasInfo) {
        let mut control = self.control.lock().unwrap();
        control.endpoint = Some(endpoint.clone());
        control.cas = cas;
    }

    pub(crate) fn control_info(&self) -> ControlInfo {
        self.control.lock().unwrap().clone()
    }
}

impl SessionState {
    pub(crate) fn is_out_tran(&self) -> bool {
        self.tran_status == TranStatus::OutTran
    }

    pub(crate) fn wire(&mut self) -> Result<&mut dyn WireSession> {
        match self.wire.as_deref_mut() {
            Some(wire) => Ok(wire),
            None => Err(Error::Communication),
        }
    }

    /// Drops the socket. A dead socket always means OUT_TRAN.
    pub(crate) fn close_socket(&mut self) {
        self.wire = None;
        self.tran_status = TranStatus::OutTran;
    }

    pub(crate) fn absorb_status(&mut self, status: ServerStatus) {
        self.tran_status = if status.in_tran {
            TranStatus::InTran
        } else {
            TranStatus::OutTran
        };
        if status.shard_id.is_some() {
            self.last_shard_id = status.shard_id;
        }
    }

    /// Arms the per-request deadline: an explicit statement timeout beats
    /// the connection-wide default.
    pub(crate) fn set_query_deadline(&mut self, stmt_timeout: Option<Duration>) {
        self.deadline = stmt_timeout.or(self.query_timeout).map(Deadline::new);
    }

    pub(crate) fn set_login_deadline(&mut self) {
        self.deadline = self.login_timeout.map(Deadline::new);
    }

    /// Before a reconnect the deadline is raised to at least the full login
    /// budget, so the replay is not starved by a short query timeout.
    pub(crate) fn raise_deadline_for_reconnect(&mut self) {
        match (self.deadline, self.login_timeout) {
            (Some(deadline), Some(login)) if deadline.budget < login => {
                self.deadline = Some(Deadline::new(login));
            }
            (Some(_), None) => self.deadline = None,
            _ => {}
        }
    }

    pub(crate) fn clear_deadline(&mut self) {
        self.deadline = None;
    }

    /// Budget left for the next wire call. Errors out once the deadline has
    /// passed so no further round trip is attempted.
    pub(crate) fn remaining_time(&self) -> Result<Option<Duration>> {
        match self.deadline {
            None => Ok(None),
            Some(deadline) => match deadline.remaining() {
                Some(rest) if !rest.is_zero() => Ok(Some(rest)),
                _ => Err(Error::QueryTimeout),
            },
        }
    }

    pub(crate) fn current_endpoint(&self) -> &Endpoint {
        &self.hosts[self.host_index]
    }

    pub(crate) fn req(&self, index: usize) -> Result<&ReqHandle> {
        self.reqs
            .get(index)
            .and_then(Option::as_ref)
            .ok_or(Error::ReqHandle)
    }

    pub(crate) fn req_mut(&mut self, index: usize) -> Result<&mut ReqHandle> {
        self.reqs
            .get_mut(index)
            .and_then(Option::as_mut)
            .ok_or(Error::ReqHandle)
    }

    /// Marks every child request handle stale after a reconnect; their next
    /// execute re-prepares first.
    pub(crate) fn invalidate_all_reqs(&mut self) {
        for req in self.reqs.iter_mut().flatten() {
            req.invalidate();
        }
    }

    /// Called when the transaction ends. Result sets that are not holdable
    /// die with the transaction; holdable ones survive unless they were
    /// opened before the transaction that just ended.
    pub(crate) fn close_unholdable_resultsets(&mut self) {
        for req in self.reqs.iter_mut().flatten() {
            if req.holdable() && req.is_from_current_tran {
                req.is_from_current_tran = false;
            } else {
                req.close_result_set();
            }
        }
    }

    pub(crate) fn close_all_resultsets(&mut self) {
        for req in self.reqs.iter_mut().flatten() {
            req.close_result_set();
            req.is_from_current_tran = false;
        }
    }

    /// Indexes of all non-holdable request handles, for the rollback path
    /// that frees them outright.
    pub(crate) fn unholdable_req_indexes(&self) -> Vec<usize> {
        self.reqs
            .iter()
            .enumerate()
            .filter_map(|(i, req)| match req {
                Some(req) if !req.holdable() => Some(i),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn all_req_indexes(&self) -> Vec<usize> {
        self.reqs
            .iter()
            .enumerate()
            .filter_map(|(i, req)| req.as_ref().map(|_| i))
            .collect()
    }
}
