//! A bounded pool of live connections.
//!
//! The pool owns a fixed-length slot vector sized at `max_pool_size`; each
//! slot is empty, idle or borrowed. Borrowing under contention waits on the
//! pool's notifier for up to `max_wait`; release flips the slot back and
//! wakes one waiter. Session defaults are re-asserted on every borrow so a
//! previous user's transaction settings never leak into the next one.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::{Mutex, Notify};
use tokio::time::{timeout_at, Instant};

use crate::config::{normalize_key, DataSourceConfig, IsolationLevel, Properties};
use crate::connection::connect_with_url;
use crate::errors::{Error, Result};
use crate::handle::{free_req_handle, table, ConnId};
use crate::handle::stmt_pool::StmtPool;
use crate::retry;
use crate::wire::{Connector, DbParam, TranType};

/// One entry of the pool's slot vector, holding the handle-table slot of
/// the pooled connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PoolSlot {
    Empty,
    Idle(usize),
    Borrowed(usize),
}

struct PoolState {
    slots: Vec<PoolSlot>,
    pool_size: usize,
    num_idle: usize,
    num_waiter: usize,
    max_wait: Duration,
    default_autocommit: bool,
    default_isolation: Option<IsolationLevel>,
    default_lock_timeout: Option<Duration>,
    login_timeout: Option<Duration>,
    destroyed: bool,
}

pub(crate) struct DataSourceShared {
    connector: Arc<dyn Connector>,
    url: String,
    user: String,
    password: String,
    pool_prepared_statement: bool,
    max_open_prepared_statement: usize,
    pool: Mutex<PoolState>,
    available: Notify,
}

/// Point-in-time pool counters, mostly for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    pub pool_size: usize,
    pub max_pool_size: usize,
    pub num_idle: usize,
    pub num_borrowed: usize,
    pub num_waiter: usize,
}

/// A shareable data source; clones hand out connections from the same pool.
#[derive(Clone)]
pub struct DataSource {
    shared: Arc<DataSourceShared>,
}

impl DataSource {
    /// Builds the pool from a property bag (see the recognized keys in
    /// [`DataSourceConfig`]) and eagerly opens `pool_size` connections.
    pub async fn new(connector: Arc<dyn Connector>, props: &Properties) -> Result<DataSource> {
        let config = DataSourceConfig::from_properties(props)?;
        let url = config.augmented_url();
        info!(
            "creating datasource for {} with pool size {}/{}",
            config.url, config.pool_size, config.max_pool_size
        );

        let shared = Arc::new(DataSourceShared {
            connector,
            url,
            user: config.user.clone(),
            password: config.password.clone(),
            pool_prepared_statement: config.pool_prepared_statement,
            max_open_prepared_statement: config.max_open_prepared_statement,
            pool: Mutex::new(PoolState {
                slots: vec![PoolSlot::Empty; config.max_pool_size],
                pool_size: config.pool_size,
                num_idle: 0,
                num_waiter: 0,
                max_wait: config.max_wait,
                default_autocommit: config.default_autocommit,
                default_isolation: config.default_isolation,
                default_lock_timeout: config.default_lock_timeout,
                login_timeout: config.login_timeout,
                destroyed: false,
            }),
            available: Notify::new(),
        });

        let mut opened = Vec::with_capacity(config.pool_size);
        for _ in 0..config.pool_size {
            match open_pooled(&shared).await {
                Ok(slot) => opened.push(slot),
                Err(err) => {
                    for slot in opened {
                        table().free_slot(slot);
                    }
                    return Err(err);
                }
            }
        }

        {
            let mut pool = shared.pool.lock().await;
            for (entry, slot) in pool.slots.iter_mut().zip(opened) {
                *entry = PoolSlot::Idle(slot);
            }
            pool.num_idle = config.pool_size;
        }
        Ok(DataSource { shared })
    }

    /// Borrows a connection, waiting up to `max_wait` when the pool is
    /// exhausted. The returned id is freshly minted for this borrow and
    /// dies at release.
    pub async fn borrow(&self) -> Result<ConnId> {
        let shared = &self.shared;
        let slot;
        let defaults;
        {
            let mut pool = shared.pool.lock().await;
            if pool.destroyed {
                return Err(Error::InvalidDatasource("the datasource was destroyed"));
            }
            if pool.num_idle == 0 || pool.num_waiter > 0 {
                let deadline = Instant::now() + pool.max_wait;
                loop {
                    pool.num_waiter += 1;
                    drop(pool);
                    let timed_out = timeout_at(deadline, shared.available.notified())
                        .await
                        .is_err();
                    pool = shared.pool.lock().await;
                    pool.num_waiter -= 1;
                    if pool.destroyed {
                        return Err(Error::InvalidDatasource("the datasource was destroyed"));
                    }
                    if timed_out {
                        return Err(Error::DatasourceTimeout);
                    }
                    if pool.num_idle > 0 {
                        break;
                    }
                }
            }
            let index = pool
                .slots
                .iter()
                .position(|entry| matches!(entry, PoolSlot::Idle(_)))
                .ok_or(Error::DatasourceTimedWait)?;
            let PoolSlot::Idle(s) = pool.slots[index] else {
                unreachable!()
            };
            pool.slots[index] = PoolSlot::Borrowed(s);
            pool.num_idle -= 1;
            slot = s;
            defaults = (
                pool.default_autocommit,
                pool.default_isolation,
                pool.default_lock_timeout,
                pool.login_timeout,
            );
        }

        let id = table().mint_conn_for_slot(slot)?;
        debug!("borrowed pooled connection {id}");
        let result = reset_borrow_defaults(id, defaults).await;
        if let Err(err) = result {
            // hand the slot back before surfacing the failure
            let _ = release_borrowed(shared, id).await;
            return Err(err);
        }
        Ok(id)
    }

    /// Returns a borrowed connection to the pool. Equivalent to calling
    /// [`crate::disconnect`] on the borrowed id.
    pub async fn release(&self, conn: ConnId) -> Result<()> {
        release_borrowed(&self.shared, conn).await
    }

    /// Adjusts a live pool. Recognized keys: `default_autocommit`,
    /// `default_isolation`, `default_lock_timeout`, `login_timeout`,
    /// `pool_size`.
    pub async fn change_property(&self, key: &str, value: &str) -> Result<()> {
        let invalid = || Error::InvalidPropertyValue {
            key: key.to_owned(),
            value: value.to_owned(),
        };
        match normalize_key(key).as_str() {
            "defaultautocommit" => {
                let parsed = parse_bool(value).ok_or_else(invalid)?;
                self.shared.pool.lock().await.default_autocommit = parsed;
            }
            "defaultisolation" => {
                let parsed = IsolationLevel::parse(value)?;
                self.shared.pool.lock().await.default_isolation = Some(parsed);
            }
            "defaultlocktimeout" => {
                let millis: u64 = value.parse().map_err(|_| invalid())?;
                self.shared.pool.lock().await.default_lock_timeout =
                    Some(Duration::from_millis(millis));
            }
            "logintimeout" => {
                let millis: u64 = value.parse().map_err(|_| invalid())?;
                self.shared.pool.lock().await.login_timeout = match millis {
                    0 => None,
                    ms => Some(Duration::from_millis(ms)),
                };
            }
            "poolsize" => {
                let new_size: usize = value.parse().map_err(|_| invalid())?;
                if new_size < 1 {
                    return Err(invalid());
                }
                self.resize(new_size, invalid).await?;
            }
            _ => return Err(Error::NoProperty(key.to_owned())),
        }
        Ok(())
    }

    async fn resize(
        &self,
        new_size: usize,
        invalid: impl Fn() -> Error,
    ) -> Result<()> {
        let shared = &self.shared;
        let old_size = {
            let pool = shared.pool.lock().await;
            if new_size > pool.slots.len() {
                return Err(invalid());
            }
            pool.pool_size
        };

        if new_size > old_size {
            // grow: open the delta outside the pool lock
            let mut opened = Vec::new();
            for _ in old_size..new_size {
                opened.push(open_pooled(shared).await?);
            }
            let mut pool = shared.pool.lock().await;
            for slot in opened {
                if let Some(entry) = pool
                    .slots
                    .iter_mut()
                    .find(|entry| **entry == PoolSlot::Empty)
                {
                    *entry = PoolSlot::Idle(slot);
                    pool.num_idle += 1;
                    shared.available.notify_one();
                } else {
                    table().free_slot(slot);
                }
            }
            pool.pool_size = new_size;
        } else {
            // shrink: retire idle connections first; borrowed ones shrink
            // the pool as they are released
            let retired = {
                let mut pool = shared.pool.lock().await;
                let mut retired = Vec::new();
                let mut excess = old_size - new_size;
                for entry in pool.slots.iter_mut() {
                    if excess == 0 {
                        break;
                    }
                    if let PoolSlot::Idle(slot) = *entry {
                        *entry = PoolSlot::Empty;
                        retired.push(slot);
                        excess -= 1;
                    }
                }
                pool.num_idle -= retired.len();
                pool.pool_size = new_size;
                retired
            };
            for slot in retired {
                close_idle_slot(slot).await;
            }
        }
        Ok(())
    }

    pub async fn status(&self) -> PoolStatus {
        let pool = self.shared.pool.lock().await;
        PoolStatus {
            pool_size: pool.pool_size,
            max_pool_size: pool.slots.len(),
            num_idle: pool.num_idle,
            num_borrowed: pool
                .slots
                .iter()
                .filter(|entry| matches!(entry, PoolSlot::Borrowed(_)))
                .count(),
            num_waiter: pool.num_waiter,
        }
    }

    /// Tears the pool down. Idle connections are closed; borrowed ones are
    /// freed client-side only, without touching sockets their borrowers may
    /// still be using.
    pub async fn destroy(self) -> Result<()> {
        let shared = self.shared;
        let (idle, borrowed) = {
            let mut pool = shared.pool.lock().await;
            pool.destroyed = true;
            let mut idle = Vec::new();
            let mut borrowed = Vec::new();
            for entry in pool.slots.iter_mut() {
                match *entry {
                    PoolSlot::Idle(slot) => idle.push(slot),
                    PoolSlot::Borrowed(slot) => borrowed.push(slot),
                    PoolSlot::Empty => {}
                }
                *entry = PoolSlot::Empty;
            }
            pool.num_idle = 0;
            idle.sort_unstable();
            (idle, borrowed)
        };
        shared.available.notify_waiters();

        for slot in idle {
            close_idle_slot(slot).await;
        }
        for slot in borrowed {
            warn!("destroying datasource with a borrowed connection in slot {slot}");
            table().free_slot(slot);
        }
        Ok(())
    }
}

/// Opens one pooled connection and wires it to its data source. Returns the
/// handle-table slot; the connection id minted by connect is revoked, the
/// pool mints a fresh one per borrow.
async fn open_pooled(shared: &Arc<DataSourceShared>) -> Result<usize> {
    let id = connect_with_url(
        shared.connector.clone(),
        &shared.url,
        Some(&shared.user),
        Some(&shared.password),
    )
    .await?;
    let session = table().get(id)?;
    *session.datasource.lock().unwrap() = Some(shared.clone());
    {
        let mut state = session
            .state
            .try_lock()
            .map_err(|_| Error::UsedConnection)?;
        state.stmt_pool = StmtPool::new(shared.max_open_prepared_statement);
    }
    let slot = session.slot;
    table().unmap_conn(id);
    Ok(slot)
}

/// Re-asserts the pool's session defaults on a just-borrowed connection.
async fn reset_borrow_defaults(
    conn: ConnId,
    (autocommit, isolation, lock_timeout, login_timeout): (
        bool,
        Option<IsolationLevel>,
        Option<Duration>,
        Option<Duration>,
    ),
) -> Result<()> {
    let session = table().get(conn)?;
    let mut guard = session
        .state
        .try_lock()
        .map_err(|_| Error::UsedConnection)?;
    let state = &mut *guard;
    state.last_error.clear();
    state.autocommit = autocommit;
    state.login_timeout = login_timeout;

    if let Some(isolation) = isolation {
        if state.isolation != Some(isolation) {
            let value = isolation.to_wire();
            retry::retryable(&session, state, None, |state| {
                Box::pin(async move {
                    let timeout = state.remaining_time()?;
                    state
                        .wire()?
                        .set_db_parameter(DbParam::IsolationLevel, value, timeout)
                        .await
                })
            })
            .await?;
            state.isolation = Some(isolation);
        }
    }
    if let Some(lock_timeout) = lock_timeout {
        if state.lock_timeout != Some(lock_timeout) {
            let value = i32::try_from(lock_timeout.as_millis())
                .map_err(|_| Error::InvalidArgs("lock timeout"))?;
            retry::retryable(&session, state, None, |state| {
                Box::pin(async move {
                    let timeout = state.remaining_time()?;
                    state
                        .wire()?
                        .set_db_parameter(DbParam::LockTimeout, value, timeout)
                        .await
                })
            })
            .await?;
            state.lock_timeout = Some(lock_timeout);
        }
    }
    Ok(())
}

/// The release path, also taken by [`crate::disconnect`] on a pooled
/// connection: recycle or close the statements, roll back, flip the slot
/// back to idle, wake one waiter.
pub(crate) async fn release_borrowed(
    shared: &Arc<DataSourceShared>,
    conn: ConnId,
) -> Result<()> {
    let session = table().get(conn)?;
    {
        let mut guard = session
            .state
            .try_lock()
            .map_err(|_| Error::UsedConnection)?;
        let state = &mut *guard;
        state.last_error.clear();

        if shared.pool_prepared_statement {
            for index in state.stmt_pool.drain_in_use() {
                let sql = state.req(index).ok().and_then(|req| req.sql.clone());
                match sql {
                    Some(sql) => {
                        if let Ok(req) = state.req_mut(index) {
                            req.close_result_set();
                            req.binds.clear();
                            req.bind_rows = None;
                        }
                        if !state.stmt_pool.park(&sql, index) {
                            free_req_handle(table(), state, index);
                        }
                    }
                    None => free_req_handle(table(), state, index),
                }
            }
            let parked: HashSet<usize> = state.stmt_pool.parked_handles().collect();
            for index in state.all_req_indexes() {
                if !parked.contains(&index) {
                    free_req_handle(table(), state, index);
                }
            }
        } else {
            for index in state.all_req_indexes() {
                free_req_handle(table(), state, index);
            }
        }

        if !state.is_out_tran() {
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
    }

    let slot = table().unmap_conn(conn).ok_or(Error::ConHandle)?;
    let mut pool = shared.pool.lock().await;
    if pool.pool_size < pool.slots.len() {
        // a shrink may still be pending; count the live connections
        let live = pool
            .slots
            .iter()
            .filter(|entry| !matches!(entry, PoolSlot::Empty))
            .count();
        if live > pool.pool_size {
            if let Some(entry) = pool
                .slots
                .iter_mut()
                .find(|entry| **entry == PoolSlot::Borrowed(slot))
            {
                *entry = PoolSlot::Empty;
                drop(pool);
                close_idle_slot(slot).await;
                return Ok(());
            }
        }
    }
    if let Some(entry) = pool
        .slots
        .iter_mut()
        .find(|entry| **entry == PoolSlot::Borrowed(slot))
    {
        *entry = PoolSlot::Idle(slot);
        pool.num_idle += 1;
        shared.available.notify_one();
        debug!("released pooled connection into slot {slot}");
    }
    Ok(())
}

/// Closes an idle pooled connection for real.
async fn close_idle_slot(slot: usize) {
    if let Some(session) = table().free_slot(slot) {
        if let Ok(mut state) = session.state.try_lock() {
            state.close_socket();
        }
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Some(true),
        "false" | "no" | "off" | "0" => Some(false),
        _ => None,
    }
}
