//! The process-wide handle table.
//!
//! Connections live in a fixed slotted arena; callers never see the slots,
//! only opaque cookies minted per allocation. A cookie dies with its handle,
//! so a stale id can only ever resolve to "no such handle", never to a
//! handle that happens to reuse the slot.

pub(crate) mod request;
pub(crate) mod session;
pub(crate) mod stmt_pool;

use std::collections::hash_map::RandomState;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::hash::{BuildHasher, Hasher};
use std::sync::{Arc, Mutex, OnceLock};

use crate::config::UrlConfig;
use crate::errors::{Error, Result};
use crate::handle::request::{HandleKind, ReqHandle};
use crate::handle::session::{Session, SessionState};
use crate::wire::Connector;

pub(crate) const MAX_CON_HANDLE: usize = 1024;
pub(crate) const REQ_HANDLE_ALLOC_SIZE: usize = 256;
const PCONNECT_CACHE_MAX: usize = 256;

/// Opaque identifier of a connection handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId(pub(crate) i32);

impl ConnId {
    /// The raw cookie value, for callers that store ids outside Rust.
    pub fn as_raw(&self) -> i32 {
        self.0
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Opaque identifier of a prepared statement (or schema/oid/collection
/// request) handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StmtId(pub(crate) i32);

impl StmtId {
    pub fn as_raw(&self) -> i32 {
        self.0
    }
}

impl fmt::Display for StmtId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Mints positive cookies from a per-process randomized origin.
struct IdMap<T> {
    next: i32,
    map: HashMap<i32, T>,
}

fn random_origin() -> i32 {
    let hash = RandomState::new().build_hasher().finish();
    (hash as i32 & 0x3fff_ffff) | 1
}

impl<T> IdMap<T> {
    fn new() -> Self {
        IdMap {
            next: random_origin(),
            map: HashMap::new(),
        }
    }

    fn mint(&mut self, value: T) -> i32 {
        loop {
            self.next = if self.next <= 0 || self.next == i32::MAX {
                1
            } else {
                self.next + 1
            };
            if let std::collections::hash_map::Entry::Vacant(entry) = self.map.entry(self.next) {
                entry.insert(value);
                return self.next;
            }
        }
    }

    fn get(&self, id: i32) -> Option<&T> {
        self.map.get(&id)
    }

    fn remove(&mut self, id: i32) -> Option<T> {
        self.map.remove(&id)
    }

    fn retain(&mut self, keep: impl FnMut(&i32, &mut T) -> bool) {
        self.map.retain(keep);
    }
}

struct TableInner {
    slots: Vec<Option<Arc<Session>>>,
    cursor: usize,
    conn_ids: IdMap<usize>,
    stmt_ids: IdMap<(usize, usize)>,
    /// Slots parked by pconnect-style disconnects, oldest first.
    pconnect: VecDeque<usize>,
}

pub(crate) struct HandleTable {
    inner: Mutex<TableInner>,
}

static TABLE: OnceLock<HandleTable> = OnceLock::new();

pub(crate) fn table() -> &'static HandleTable {
    TABLE.get_or_init(|| HandleTable::with_capacity(MAX_CON_HANDLE))
}

impl HandleTable {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        HandleTable {
            inner: Mutex::new(TableInner {
                slots: (0..capacity).map(|_| None).collect(),
                cursor: 0,
                conn_ids: IdMap::new(),
                stmt_ids: IdMap::new(),
                pconnect: VecDeque::new(),
            }),
        }
    }

    /// Reuses a parked handle with the exact same (endpoint, db, user,
    /// password) identity, or installs a fresh one in the first free slot.
    pub(crate) fn alloc_or_reuse(
        &self,
        config: UrlConfig,
        connector: Arc<dyn Connector>,
    ) -> Result<(ConnId, Arc<Session>)> {
        let mut inner = self.inner.lock().unwrap();

        if let Some(pos) = inner.pconnect.iter().position(|&slot| {
            inner.slots[slot]
                .as_ref()
                .is_some_and(|session| session.matches(&config))
        }) {
            let slot = inner.pconnect.remove(pos).unwrap();
            let session = inner.slots[slot].as_ref().unwrap().clone();
            let cookie = inner.conn_ids.mint(slot);
            return Ok((ConnId(cookie), session));
        }

        let capacity = inner.slots.len();
        for step in 1..=capacity {
            let slot = (inner.cursor + step) % capacity;
            if inner.slots[slot].is_none() {
                inner.cursor = slot;
                let session = Arc::new(Session::new(slot, config, connector));
                inner.slots[slot] = Some(session.clone());
                let cookie = inner.conn_ids.mint(slot);
                return Ok((ConnId(cookie), session));
            }
        }
        Err(Error::AllocConHandle)
    }

    pub(crate) fn get(&self, id: ConnId) -> Result<Arc<Session>> {
        let inner = self.inner.lock().unwrap();
        let slot = *inner.conn_ids.get(id.0).ok_or(Error::ConHandle)?;
        inner.slots[slot].clone().ok_or(Error::ConHandle)
    }

    pub(crate) fn find_stmt(&self, id: StmtId) -> Result<(Arc<Session>, usize)> {
        let inner = self.inner.lock().unwrap();
        let (slot, req) = *inner.stmt_ids.get(id.0).ok_or(Error::ReqHandle)?;
        let session = inner.slots[slot].clone().ok_or(Error::ReqHandle)?;
        Ok((session, req))
    }

    pub(crate) fn mint_stmt(&self, slot: usize, req: usize) -> StmtId {
        let mut inner = self.inner.lock().unwrap();
        StmtId(inner.stmt_ids.mint((slot, req)))
    }

    pub(crate) fn unmap_stmt(&self, id: StmtId) {
        let mut inner = self.inner.lock().unwrap();
        inner.stmt_ids.remove(id.0);
    }

    /// Parks a disconnected handle for later physical reuse. `false` means
    /// the cache is full and the handle must be freed for real.
    pub(crate) fn park_pconnect(&self, id: ConnId) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.pconnect.len() >= PCONNECT_CACHE_MAX {
            return false;
        }
        let Some(slot) = inner.conn_ids.remove(id.0) else {
            return false;
        };
        inner.pconnect.push_back(slot);
        true
    }

    /// Blanks the slot and invalidates the connection cookie along with
    /// every statement cookie that pointed into it.
    pub(crate) fn free_connection(&self, id: ConnId) -> Option<Arc<Session>> {
        let mut inner = self.inner.lock().unwrap();
        let slot = inner.conn_ids.remove(id.0)?;
        Self::blank_slot(&mut inner, slot)
    }

    /// Mints a cookie for a slot owned by a data source. The pool tracks
    /// connections by slot; a cookie only exists while one is borrowed.
    pub(crate) fn mint_conn_for_slot(&self, slot: usize) -> Result<ConnId> {
        let mut inner = self.inner.lock().unwrap();
        if inner.slots.get(slot).and_then(Option::as_ref).is_none() {
            return Err(Error::ConHandle);
        }
        Ok(ConnId(inner.conn_ids.mint(slot)))
    }

    /// Revokes a cookie without touching the slot it pointed at.
    pub(crate) fn unmap_conn(&self, id: ConnId) -> Option<usize> {
        let mut inner = self.inner.lock().unwrap();
        inner.conn_ids.remove(id.0)
    }

    /// Frees a slot directly, sweeping every cookie that pointed into it.
    /// This is the "disconnect, no close" path: nothing is sent on a socket
    /// a borrower may still be using.
    pub(crate) fn free_slot(&self, slot: usize) -> Option<Arc<Session>> {
        let mut inner = self.inner.lock().unwrap();
        inner.conn_ids.retain(|_, s| *s != slot);
        Self::blank_slot(&mut inner, slot)
    }

    fn blank_slot(inner: &mut TableInner, slot: usize) -> Option<Arc<Session>> {
        inner.stmt_ids.retain(|_, (s, _)| *s != slot);
        inner.pconnect.retain(|&s| s != slot);
        inner.slots[slot].take()
    }
}

/// Finds the first unused child index, growing the vector in blocks, and
/// installs a fresh request handle there.
pub(crate) fn alloc_req_handle(
    table: &HandleTable,
    state: &mut SessionState,
    slot: usize,
    kind: HandleKind,
) -> usize {
    let index = state
        .reqs
        .iter()
        .position(Option::is_none)
        .unwrap_or_else(|| {
            let index = state.reqs.len();
            state
                .reqs
                .resize_with(index + REQ_HANDLE_ALLOC_SIZE, || None);
            index
        });
    let cookie = table.mint_stmt(slot, index);
    state.reqs[index] = Some(ReqHandle::new(cookie, kind, state.query_timeout));
    index
}

/// Frees one request handle: unmaps its cookie and unlinks it from the
/// parent.
pub(crate) fn free_req_handle(table: &HandleTable, state: &mut SessionState, index: usize) {
    if let Some(req) = state.reqs.get_mut(index).and_then(Option::take) {
        table.unmap_stmt(req.cookie);
        state.stmt_pool.forget_in_use(index);
    }
}
