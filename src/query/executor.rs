#![forbid(unsafe_code)]

//! Statement execution and pagination bookkeeping.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};

use crate::backend::{GraphBackend, QueryCursor};
use crate::query::compiler::{CompiledQuery, Statement};
use crate::types::{KgError, Result, Row, Stage};

/// Single-pass, lazily evaluated page of results.
///
/// `total` is `None` when no total was requested, `Some(-1)` when the backend
/// could not report it. `size` is `-1` when the row count is unknown.
pub struct PaginatedStream<T> {
    rows: Box<dyn Iterator<Item = Result<T>> + Send>,
    total: Option<i64>,
    size: i64,
    from: u64,
}

impl<T> fmt::Debug for PaginatedStream<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PaginatedStream")
            .field("total", &self.total)
            .field("size", &self.size)
            .field("from", &self.from)
            .finish_non_exhaustive()
    }
}

impl<T: 'static> PaginatedStream<T> {
    /// Wraps an iterator with its bookkeeping.
    pub fn new(
        rows: Box<dyn Iterator<Item = Result<T>> + Send>,
        total: Option<i64>,
        size: i64,
        from: u64,
    ) -> Self {
        PaginatedStream {
            rows,
            total,
            size,
            from,
        }
    }

    /// Total row count, see the type docs for sentinels.
    pub fn total(&self) -> Option<i64> {
        self.total
    }

    /// Number of rows this stream yields, or `-1`.
    pub fn size(&self) -> i64 {
        self.size
    }

    /// Offset of the first row.
    pub fn from(&self) -> u64 {
        self.from
    }

    /// Transforms rows without consuming them.
    pub fn map<U, F>(self, mut f: F) -> PaginatedStream<U>
    where
        U: 'static,
        F: FnMut(T) -> U + Send + 'static,
    {
        PaginatedStream {
            rows: Box::new(self.rows.map(move |row| row.map(&mut f))),
            total: self.total,
            size: self.size,
            from: self.from,
        }
    }

    /// Drains the stream into a [`Page`], stopping at the first error.
    pub fn into_page(self) -> Result<Page<T>> {
        let (total, size, from) = (self.total, self.size, self.from);
        let data = self.rows.collect::<Result<Vec<_>>>()?;
        Ok(Page {
            data,
            total,
            size,
            from,
        })
    }
}

impl<T> Iterator for PaginatedStream<T> {
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        self.rows.next()
    }
}

/// Materialized page.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Page<T> {
    /// Rows.
    pub data: Vec<T>,
    /// Total row count.
    pub total: Option<i64>,
    /// Number of rows.
    pub size: i64,
    /// Offset of the first row.
    pub from: u64,
}

/// Closes the wrapped cursor when dropped.
struct CursorGuard {
    cursor: Box<dyn QueryCursor>,
}

impl Iterator for CursorGuard {
    type Item = Result<Row>;

    fn next(&mut self) -> Option<Self::Item> {
        self.cursor.next_row()
    }
}

impl Drop for CursorGuard {
    fn drop(&mut self) {
        self.cursor.close();
    }
}

/// Runs statements through a backend.
#[derive(Clone)]
pub struct Executor {
    backend: Arc<dyn GraphBackend>,
}

impl Executor {
    /// Creates an executor over `backend`.
    pub fn new(backend: Arc<dyn GraphBackend>) -> Self {
        Executor { backend }
    }

    /// Backend used for execution.
    pub fn backend(&self) -> &Arc<dyn GraphBackend> {
        &self.backend
    }

    /// Runs a compiled query, resolving an unreported total through its
    /// count statement.
    pub fn execute_compiled(&self, stage: Stage, compiled: &CompiledQuery) -> Result<PaginatedStream<Row>> {
        let mut stream = self.execute(stage, &compiled.statement)?;
        if let (Some(count), Some(-1)) = (&compiled.count, stream.total) {
            stream.total = Some(self.count(stage, count)?.map_or(-1, |c| c as i64));
        }
        Ok(stream)
    }

    /// Runs a statement.
    ///
    /// Without a page size, a positive offset is applied in-process: when the
    /// reported row count exceeds `from`, the first `from` rows are skipped
    /// and both size and total report the remainder. Any other offset without
    /// a page size is ignored.
    pub fn execute(&self, stage: Stage, statement: &Statement) -> Result<PaginatedStream<Row>> {
        let cursor = self.backend.execute(stage, statement).map_err(|err| {
            warn!(code = err.code(), error = %err, %stage, "executor.execute.failed");
            err
        })?;
        let guard = CursorGuard { cursor };
        let count = guard.cursor.count();
        let full_count = guard.cursor.full_count();

        let pagination = statement.pagination().unwrap_or_default();
        let from = pagination.from;
        if pagination.size.is_none() && from > 0 {
            if let Some(count) = count.filter(|c| *c > from) {
                let remaining = (count - from) as i64;
                debug!(from, count, "executor.execute.in_process_skip");
                let rows = guard.skip(from as usize);
                return Ok(PaginatedStream::new(
                    Box::new(rows),
                    Some(remaining),
                    remaining,
                    from,
                ));
            }
        }

        let total = match pagination.size {
            Some(_) if pagination.return_total => Some(full_count.map_or(-1, |c| c as i64)),
            Some(_) => None,
            None => match count {
                Some(c) => Some(c as i64),
                None if pagination.return_total => Some(-1),
                None => None,
            },
        };
        let size = count.map_or(-1, |c| c as i64);
        debug!(?total, size, from, "executor.execute.complete");
        Ok(PaginatedStream::new(Box::new(guard), total, size, from))
    }

    /// Runs a count-only statement and reads its `count` column.
    pub fn count(&self, stage: Stage, statement: &Statement) -> Result<Option<u64>> {
        let mut guard = CursorGuard {
            cursor: self.backend.execute(stage, statement)?,
        };
        match guard.next() {
            Some(row) => {
                let row = row?;
                row.get("count")
                    .map(|v| {
                        v.as_u64()
                            .ok_or_else(|| KgError::invalid_query("count column is not a number"))
                    })
                    .transpose()
            }
            None => Ok(None),
        }
    }
}
