use std::time::Duration;

use crate::errors::{Error, Result};
use crate::value::{BindValue, ParamMode, UType, Value};
use crate::wire::{ColumnInfo, ExecuteReply, PrepareFlag, PrepareReply, QueryResultInfo, StmtType, Tuple};
use crate::StmtId;

pub(crate) const DEFAULT_FETCH_SIZE: i32 = 100;

/// What kind of server-side request a handle stands for. Everything but
/// `Prepare` is a one-shot result-set request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HandleKind {
    Prepare,
    OidGet,
    SchemaInfo,
    ColGet,
}

/// Where to move the cursor from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorOrigin {
    First,
    Current,
    Last,
}

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct CursorState {
    /// 1-based row the cursor points at; 0 means before the first row.
    pub(crate) position: i64,
    /// Window of row numbers currently held in the fetch buffer.
    pub(crate) window_begin: i64,
    pub(crate) window_end: i64,
}

/// Client-side state of one prepared statement (or schema / oid / collection
/// request). Everything needed to replay `prepare` + `execute` after a
/// reconnect lives here.
#[derive(Debug)]
pub(crate) struct ReqHandle {
    pub(crate) cookie: StmtId,
    pub(crate) kind: HandleKind,
    pub(crate) sql: Option<String>,
    pub(crate) prepare_flag: PrepareFlag,
    pub(crate) server_stmt_id: i32,
    pub(crate) stmt_type: StmtType,
    pub(crate) columns: Vec<ColumnInfo>,
    pub(crate) num_params: usize,
    pub(crate) binds: Vec<BindValue>,
    pub(crate) bind_rows: Option<Vec<Vec<BindValue>>>,
    pub(crate) fetch_size: i32,
    pub(crate) max_rows: i64,
    pub(crate) query_timeout: Option<Duration>,
    pub(crate) cursor: CursorState,
    pub(crate) tuples: Vec<Tuple>,
    /// Total rows of the current result set, as reported by execute.
    pub(crate) total_rows: i64,
    pub(crate) results: Vec<QueryResultInfo>,
    pub(crate) current_result: usize,
    /// Cleared when a reconnect makes the server-side statement id stale;
    /// the next execute must prepare again first.
    pub(crate) valid: bool,
    pub(crate) is_closed: bool,
    pub(crate) is_from_current_tran: bool,
}

impl ReqHandle {
    pub(crate) fn new(cookie: StmtId, kind: HandleKind, query_timeout: Option<Duration>) -> Self {
        ReqHandle {
            cookie,
            kind,
            sql: None,
            prepare_flag: PrepareFlag::NONE,
            server_stmt_id: -1,
            stmt_type: StmtType::Select,
            columns: Vec::new(),
            num_params: 0,
            binds: Vec::new(),
            bind_rows: None,
            fetch_size: DEFAULT_FETCH_SIZE,
            max_rows: 0,
            query_timeout,
            cursor: CursorState::default(),
            tuples: Vec::new(),
            total_rows: 0,
            results: Vec::new(),
            current_result: 0,
            valid: false,
            is_closed: false,
            is_from_current_tran: true,
        }
    }

    pub(crate) fn holdable(&self) -> bool {
        self.prepare_flag.contains(PrepareFlag::HOLDABLE)
    }

    pub(crate) fn apply_prepare(&mut self, sql: &str, flag: PrepareFlag, reply: PrepareReply) {
        self.sql = Some(sql.to_owned());
        self.prepare_flag = flag;
        self.server_stmt_id = reply.stmt_id;
        self.stmt_type = reply.stmt_type;
        self.columns = reply.columns;
        self.num_params = reply.num_params;
        self.valid = true;
        self.is_closed = false;
    }

    pub(crate) fn apply_execute(&mut self, reply: &ExecuteReply) {
        self.total_rows = reply.affected;
        self.results = reply.results.clone();
        self.current_result = 0;
        self.cursor = CursorState::default();
        self.tuples.clear();
        self.is_closed = false;
        self.is_from_current_tran = true;
    }

    /// Frees everything tied to one invocation, keeping the sql text, the
    /// flags and the binds so the statement can be replayed.
    pub(crate) fn free_content(&mut self) {
        self.cursor = CursorState::default();
        self.tuples.clear();
        self.results.clear();
        self.current_result = 0;
        self.total_rows = 0;
        self.columns.clear();
        self.server_stmt_id = -1;
    }

    pub(crate) fn invalidate(&mut self) {
        self.valid = false;
    }

    /// Closes the client side of the result set; the handle itself stays
    /// usable for a re-execute.
    pub(crate) fn close_result_set(&mut self) {
        self.cursor = CursorState::default();
        self.tuples.clear();
        self.is_closed = true;
    }

    pub(crate) fn bind(&mut self, index: usize, value: BindValue) -> Result<()> {
        if index == 0 || (self.num_params > 0 && index > self.num_params) {
            return Err(Error::BindIndex(index));
        }
        if self.binds.len() < index {
            self.binds.resize_with(index, BindValue::default);
        }
        self.binds[index - 1] = value;
        Ok(())
    }

    pub(crate) fn register_out_param(&mut self, index: usize, u_type: Option<UType>) -> Result<()> {
        if index == 0 || (self.num_params > 0 && index > self.num_params) {
            return Err(Error::BindIndex(index));
        }
        if self.binds.len() < index {
            self.binds.resize_with(index, BindValue::default);
        }
        let bind = &mut self.binds[index - 1];
        bind.mode = match bind.mode {
            ParamMode::In => ParamMode::Out,
            mode => mode,
        };
        if let Some(u_type) = u_type {
            bind.u_type = u_type;
        }
        Ok(())
    }

    pub(crate) fn set_bind_array_size(&mut self, size: usize) -> Result<()> {
        if size == 0 {
            return Err(Error::BindArraySize);
        }
        self.bind_rows = Some(vec![Vec::new(); size]);
        Ok(())
    }

    pub(crate) fn bind_array(&mut self, row: usize, index: usize, value: BindValue) -> Result<()> {
        let rows = self.bind_rows.as_mut().ok_or(Error::BindArraySize)?;
        let slot = rows.get_mut(row).ok_or(Error::BindArraySize)?;
        if index == 0 {
            return Err(Error::BindIndex(index));
        }
        if slot.len() < index {
            slot.resize_with(index, BindValue::default);
        }
        slot[index - 1] = value;
        Ok(())
    }

    /// Moves the cursor and reports whether the target row exists.
    pub(crate) fn move_cursor(&mut self, offset: i64, origin: CursorOrigin) -> Result<()> {
        let base = match origin {
            CursorOrigin::First => 0,
            CursorOrigin::Current => self.cursor.position,
            CursorOrigin::Last => self.total_rows + 1,
        };
        let target = base + offset * if matches!(origin, CursorOrigin::Last) { -1 } else { 1 };
        if target < 1 || (self.total_rows > 0 && target > self.total_rows) {
            return Err(Error::NoMoreData);
        }
        self.cursor.position = target;
        Ok(())
    }

    /// The row the cursor points at, if the fetch buffer holds it.
    pub(crate) fn current_tuple(&self) -> Result<&Tuple> {
        if self.is_closed {
            return Err(Error::ReqHandle);
        }
        let pos = self.cursor.position;
        if pos < self.cursor.window_begin || pos > self.cursor.window_end {
            return Err(Error::NoMoreData);
        }
        self.tuples
            .get((pos - self.cursor.window_begin) as usize)
            .ok_or(Error::NoMoreData)
    }

    pub(crate) fn store_fetch_window(&mut self, start: i64, tuples: Vec<Tuple>) {
        self.cursor.window_begin = start;
        self.cursor.window_end = start + tuples.len() as i64 - 1;
        self.tuples = tuples;
    }

    pub(crate) fn column_value(&self, column: usize) -> Result<&Value> {
        let tuple = self.current_tuple()?;
        if column == 0 {
            return Err(Error::InvalidArgs("column index is 1-based"));
        }
        tuple.values.get(column - 1).ok_or(Error::TypeConversion)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle() -> ReqHandle {
        let mut req = ReqHandle::new(StmtId(1), HandleKind::Prepare, None);
        req.total_rows = 3;
        req.store_fetch_window(
            1,
            (1..=3)
                .map(|i| Tuple {
                    oid: None,
                    values: vec![Value::Int(i)],
                })
                .collect(),
        );
        req
    }

    #[test]
    fn cursor_moves_within_bounds() {
        let mut req = handle();
        req.move_cursor(1, CursorOrigin::First).unwrap();
        assert_eq!(req.cursor.position, 1);
        req.move_cursor(1, CursorOrigin::Current).unwrap();
        assert_eq!(req.cursor.position, 2);
        req.move_cursor(1, CursorOrigin::Last).unwrap();
        assert_eq!(req.cursor.position, 3);
        assert!(matches!(
            req.move_cursor(1, CursorOrigin::Current).unwrap_err(),
            Error::NoMoreData
        ));
    }

    #[test]
    fn reads_current_row_from_window() {
        let mut req = handle();
        req.move_cursor(2, CursorOrigin::First).unwrap();
        assert_eq!(req.column_value(1).unwrap(), &Value::Int(2));
        assert!(req.column_value(2).is_err());
        assert!(req.column_value(0).is_err());
    }

    #[test]
    fn closed_result_set_rejects_reads() {
        let mut req = handle();
        req.move_cursor(1, CursorOrigin::First).unwrap();
        req.close_result_set();
        assert!(req.current_tuple().is_err());
    }

    #[test]
    fn bind_rejects_out_of_range_indexes() {
        let mut req = handle();
        req.num_params = 2;
        assert!(req.bind(1, BindValue::default()).is_ok());
        assert!(matches!(
            req.bind(3, BindValue::default()).unwrap_err(),
            Error::BindIndex(3)
        ));
        assert!(req.bind(0, BindValue::default()).is_err());
    }

    #[test]
    fn array_binding_requires_declared_size() {
        let mut req = handle();
        assert!(req.bind_array(0, 1, BindValue::default()).is_err());
        req.set_bind_array_size(2).unwrap();
        assert!(req.bind_array(1, 1, BindValue::default()).is_ok());
        assert!(req.bind_array(2, 1, BindValue::default()).is_err());
    }
}
