//! Result sets and the client-side row cache.
//!
//! Every line the server sends for a statement lands in the cache of the
//! result set it belongs to, tuples and header lines interleaved. Tuples
//! are counted separately so that paging (`Xexport`) and `seek_row` can
//! translate between absolute row numbers, cache positions and lines.

use crate::protocol::QueryType;

/// Metadata for one column, filled in from `%` header lines.
#[derive(Debug, Default, Clone)]
pub struct Column {
    pub table_name: Option<String>,
    pub name: Option<String>,
    pub typ: Option<String>,
    pub length: i32,
    pub digits: i32,
    pub scale: i32,
}

#[derive(Debug)]
pub(crate) struct CacheLine {
    pub raw: String,
    /// Sliced fields, empty until the line is first accessed by field.
    pub fields: Vec<Option<String>>,
    /// Tuple number (within the cache) of this line, or the number of
    /// tuples before it when the line is not a tuple.
    pub tuplerev: i64,
}

impl CacheLine {
    pub fn is_tuple(&self) -> bool {
        matches!(self.raw.as_bytes().first(), Some(b'[') | Some(b'='))
    }
}

const CACHE_INITIAL: usize = 100;
const CACHE_MAX_INCREMENT: usize = 200000;
const CACHE_LINEAR_INCREMENT: usize = 20000;

#[derive(Debug)]
pub(crate) struct RowCache {
    /// Maximum number of tuples to keep (the connection's reply size).
    pub rowlimit: i64,
    /// Current growth ceiling for `lines`.
    limit: usize,
    pub lines: Vec<CacheLine>,
    /// Read cursor into `lines`, -1 before the first fetch.
    pub reader: isize,
    /// Absolute row number of the first cached tuple.
    pub first: i64,
    /// Number of tuples currently cached.
    pub tuplecount: i64,
    /// Line index of each cached tuple, in order.
    tuple_lines: Vec<usize>,
}

impl RowCache {
    fn new(rowlimit: i64) -> Self {
        RowCache {
            rowlimit,
            limit: 0,
            lines: Vec::new(),
            reader: -1,
            first: 0,
            tuplecount: 0,
            tuple_lines: Vec::new(),
        }
    }

    /// Line index holding tuple `n` (0-based within the cache).
    pub fn tuple_line(&self, n: i64) -> Option<usize> {
        usize::try_from(n).ok().and_then(|n| self.tuple_lines.get(n)).copied()
    }

    pub fn writer(&self) -> usize {
        self.lines.len()
    }

    /// Append a line, making room first if the cache is full. With
    /// `cacheall` the row limit is ignored (used while draining, when no
    /// line may be lost).
    pub fn add_line(&mut self, raw: String, cacheall: bool) {
        if self.lines.len() >= self.limit {
            self.make_room(cacheall);
        }
        let line = CacheLine {
            raw,
            fields: Vec::new(),
            tuplerev: self.tuplecount,
        };
        let is_tuple = line.is_tuple();
        self.lines.push(line);
        if is_tuple {
            self.tuple_lines.push(self.lines.len() - 1);
            self.tuplecount += 1;
        }
    }

    fn make_room(&mut self, cacheall: bool) {
        // if there are read entries, delete them
        if self.reader >= 0 {
            self.freeup(self.reader as usize + 1);
            return;
        }

        // otherwise grow: double, then linear, capped by the row limit
        loop {
            let oldsize = self.limit;
            let mut incr = if oldsize == 0 {
                CACHE_INITIAL
            } else {
                oldsize * 2
            };
            if incr > CACHE_MAX_INCREMENT {
                incr = CACHE_LINEAR_INCREMENT;
            }
            let mut newsize = oldsize + incr;
            if self.rowlimit > 0 && newsize > self.rowlimit as usize && !cacheall {
                newsize = self.rowlimit as usize;
                if newsize <= oldsize {
                    // not enough space, so increase the limit and retry
                    self.rowlimit += 100;
                    continue;
                }
            }
            self.limit = newsize;
            return;
        }
    }

    /// Drop the `k` oldest lines and compact, advancing `first` by the
    /// number of tuples evicted.
    pub fn freeup(&mut self, k: usize) {
        let k = k.min(self.lines.len());
        let evicted = self.lines[..k].iter().filter(|l| l.is_tuple()).count();
        self.lines.drain(..k);

        self.tuplecount = 0;
        self.tuple_lines.clear();
        for (i, line) in self.lines.iter_mut().enumerate() {
            line.tuplerev = self.tuplecount;
            if matches!(line.raw.as_bytes().first(), Some(b'[') | Some(b'=')) {
                self.tuple_lines.push(i);
                self.tuplecount += 1;
            }
        }

        self.reader = (self.reader - k as isize).max(-1);
        self.first += evicted as i64;
    }

    pub fn clear(&mut self) {
        self.lines.clear();
        self.tuple_lines.clear();
        self.tuplecount = 0;
        self.reader = -1;
        self.limit = 0;
    }
}

/// One typed response to one statement.
#[derive(Debug)]
pub(crate) struct ResultSet {
    /// Server-side handle for pagination, -1 when none.
    pub tableid: i64,
    pub querytype: Option<QueryType>,
    pub row_count: i64,
    /// Number of rows the server holds ready for this result.
    pub tuple_count: i64,
    pub last_id: i64,
    pub querytime: i64,
    pub maloptimizertime: i64,
    pub sqloptimizertime: i64,
    pub fieldcnt: usize,
    pub columns: Vec<Column>,
    pub error: Option<String>,
    pub sqlstate: Option<String>,
    pub cache: RowCache,
    /// Only comments seen so far; a fresh header may still reuse this set.
    pub commentonly: bool,
    /// A `&` header was parsed for this result.
    pub typed: bool,
}

impl ResultSet {
    pub fn new(rowlimit: i64) -> Self {
        ResultSet {
            tableid: -1,
            querytype: None,
            row_count: 0,
            tuple_count: 0,
            last_id: -1,
            querytime: 0,
            maloptimizertime: 0,
            sqloptimizertime: 0,
            fieldcnt: 0,
            columns: Vec::new(),
            error: None,
            sqlstate: None,
            cache: RowCache::new(rowlimit),
            commentonly: true,
            typed: false,
        }
    }

    pub fn ensure_columns(&mut self, n: usize) {
        if self.columns.len() < n {
            self.columns.resize_with(n, Column::default);
        }
    }

    /// Append an `!` line (the leading `!` already stripped). The first
    /// error may carry a 5-character SQLSTATE prefix terminated by `!`.
    pub fn add_error(&mut self, line: &str) {
        let mut message = line;
        let bytes = line.as_bytes();
        if bytes.len() > 6
            && bytes[5] == b'!'
            && bytes[..5]
                .iter()
                .all(|&c| c.is_ascii_digit() || c.is_ascii_uppercase())
        {
            if self.error.is_none() {
                self.sqlstate = Some(line[..5].to_string());
            }
            message = &line[6..];
        }
        let error = self.error.get_or_insert_with(String::new);
        error.push_str(message);
        error.push('\n');
    }

    pub fn add_cache(&mut self, line: String, cacheall: bool) {
        self.cache.add_line(line, cacheall);
        if self.row_count < self.cache.first + self.cache.tuplecount {
            self.row_count = self.cache.first + self.cache.tuplecount;
        }
    }

    pub fn clear(&mut self) {
        self.cache.clear();
        self.columns.clear();
        self.fieldcnt = 0;
        self.error = None;
        self.sqlstate = None;
        self.tableid = -1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn tuples(cache: &RowCache) -> Vec<&str> {
        cache
            .lines
            .iter()
            .filter(|l| l.is_tuple())
            .map(|l| l.raw.as_str())
            .collect()
    }

    #[test]
    fn add_line_tracks_tuples_and_headers() {
        let mut rs = ResultSet::new(100);
        rs.add_cache("% header".to_string(), false);
        rs.add_cache("[ 1 ]".to_string(), false);
        rs.add_cache("[ 2 ]".to_string(), false);
        assert_eq!(rs.cache.writer(), 3);
        assert_eq!(rs.cache.tuplecount, 2);
        assert_eq!(rs.row_count, 2);
        assert_eq!(rs.cache.lines[0].tuplerev, 0);
        assert_eq!(rs.cache.lines[1].tuplerev, 0);
        assert_eq!(rs.cache.lines[2].tuplerev, 1);
        assert_eq!(rs.cache.tuple_line(0), Some(1));
        assert_eq!(rs.cache.tuple_line(1), Some(2));
    }

    #[test]
    fn eviction_compacts_and_advances_first() {
        let mut rs = ResultSet::new(100);
        for i in 0..10 {
            rs.add_cache(format!("[ {i} ]"), false);
        }
        rs.cache.reader = 4;
        rs.cache.freeup(5);
        assert_eq!(rs.cache.first, 5);
        assert_eq!(rs.cache.tuplecount, 5);
        assert_eq!(rs.cache.reader, -1);
        assert_eq!(
            tuples(&rs.cache),
            vec!["[ 5 ]", "[ 6 ]", "[ 7 ]", "[ 8 ]", "[ 9 ]"]
        );
        // tuple<->line maps rebuilt
        assert_eq!(rs.cache.tuple_line(0), Some(0));
        assert_eq!(rs.cache.lines[4].tuplerev, 4);
    }

    #[test]
    fn full_cache_evicts_read_lines() {
        let mut rs = ResultSet::new(4);
        for i in 0..4 {
            rs.add_cache(format!("[ {i} ]"), false);
        }
        // rowlimit 4 reached; reading two rows lets the next add evict them
        rs.cache.reader = 1;
        rs.add_cache("[ 4 ]".to_string(), false);
        assert_eq!(rs.cache.first, 2);
        assert_eq!(tuples(&rs.cache), vec!["[ 2 ]", "[ 3 ]", "[ 4 ]"]);
        assert_eq!(rs.cache.reader, -1);
        assert_eq!(rs.row_count, 5);
    }

    #[test]
    fn cacheall_ignores_rowlimit() {
        let mut rs = ResultSet::new(2);
        for i in 0..50 {
            rs.add_cache(format!("[ {i} ]"), true);
        }
        assert_eq!(rs.cache.tuplecount, 50);
        assert_eq!(rs.cache.first, 0);
    }

    #[test]
    fn rowlimit_bumps_when_no_room_can_be_made() {
        let mut rs = ResultSet::new(1);
        rs.add_cache("[ 0 ]".to_string(), false);
        // nothing read yet, cache cannot shrink: the limit gives way
        rs.add_cache("[ 1 ]".to_string(), false);
        assert_eq!(rs.cache.tuplecount, 2);
        assert!(rs.cache.rowlimit > 1);
    }

    #[test]
    fn row_cache_invariant_after_mixed_operations() {
        let mut rs = ResultSet::new(100);
        rs.add_cache("% names".to_string(), false);
        for i in 0..20 {
            rs.add_cache(format!("[ {i} ]"), false);
        }
        rs.cache.reader = 10;
        rs.cache.freeup(6);
        // invariant: every line's tuplerev equals the number of tuples
        // before it, and tuple_line inverts it for tuples
        let mut seen = 0i64;
        for (i, line) in rs.cache.lines.iter().enumerate() {
            assert_eq!(line.tuplerev, seen);
            if line.is_tuple() {
                assert_eq!(rs.cache.tuple_line(seen), Some(i));
                seen += 1;
            }
        }
        assert_eq!(seen, rs.cache.tuplecount);
        assert!(rs.cache.first >= 0);
    }

    #[test]
    fn sqlstate_extraction() {
        let mut rs = ResultSet::new(100);
        rs.add_error("42000!syntax error");
        assert_eq!(rs.sqlstate.as_deref(), Some("42000"));
        assert_eq!(rs.error.as_deref(), Some("syntax error\n"));
        // subsequent errors concatenate, sqlstate stays
        rs.add_error("second problem");
        assert_eq!(rs.error.as_deref(), Some("syntax error\nsecond problem\n"));
        assert_eq!(rs.sqlstate.as_deref(), Some("42000"));
    }

    #[test]
    fn error_without_sqlstate() {
        let mut rs = ResultSet::new(100);
        rs.add_error("plain message");
        assert_eq!(rs.sqlstate, None);
        assert_eq!(rs.error.as_deref(), Some("plain message\n"));
        // too short for a state prefix
        let mut rs = ResultSet::new(100);
        rs.add_error("12345!");
        assert_eq!(rs.sqlstate, None);
        assert_eq!(rs.error.as_deref(), Some("12345!\n"));
    }
}
