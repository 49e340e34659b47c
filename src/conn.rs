//! The MAPI session: framed request/response traffic, the handle arena,
//! result-set bookkeeping and the row cache protocol.
//!
//! A [`Mapi`] owns its settings, the block stream and all statement
//! handles. Handles are addressed by [`HandleId`]; at most one handle is
//! *active* (has undrained server output) at any time, and sending a new
//! command implicitly drains the previous one.

use std::fs::File;
use std::io::Write as _;
use std::time::Duration;

use tracing::debug;

use crate::error::{Error, eyre, Result};
use crate::params::Param;
use crate::protocol::block::BlockStream;
use crate::protocol::fields::slice_row;
use crate::protocol::{PROMPT_BEGIN, PROMPT_FILE, PROMPT_MORE, QueryType};
use crate::result::{Column, ResultSet};
use crate::settings::Settings;

/// Upper bound on redirect targets remembered from one welcome message.
pub const MAX_REDIRECTS: usize = 50;

/// Identifies one statement handle within its connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandleId(pub(crate) usize);

/// Where `seek_row` counts from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Seek {
    Set,
    Cur,
    End,
}

pub(crate) struct Handle {
    /// Parameterized query text, kept for re-execution.
    pub template: Option<String>,
    /// The materialized query.
    pub query: Option<String>,
    pub params: Vec<Option<Param>>,
    pub results: Vec<ResultSet>,
    /// Index of the current result for the reader; consumed results stay
    /// as cleared slots below this.
    pub cur: usize,
    /// Result currently receiving parsed lines, if any.
    pub active: Option<usize>,
    /// The server asked for more input to complete the statement.
    pub needmore: bool,
    /// Table ids whose `Xclose` had to be postponed.
    pub pending_close: Vec<i64>,
}

impl Handle {
    fn new() -> Self {
        Handle {
            template: None,
            query: None,
            params: Vec::new(),
            results: Vec::new(),
            cur: 0,
            active: None,
            needmore: false,
            pending_close: Vec::new(),
        }
    }

    pub fn result(&self) -> Option<&ResultSet> {
        self.results.get(self.cur)
    }

    pub fn result_mut(&mut self) -> Option<&mut ResultSet> {
        self.results.get_mut(self.cur)
    }

    fn new_result(&mut self, rowlimit: i64) -> usize {
        self.results.push(ResultSet::new(rowlimit));
        let idx = self.results.len() - 1;
        self.active = Some(idx);
        idx
    }
}

/// A connection to a MonetDB server.
pub struct Mapi {
    pub(crate) settings: Settings,
    pub(crate) stream: Option<BlockStream>,
    pub(crate) connected: bool,
    broken: bool,
    pub(crate) motd: String,
    pub(crate) redirects: Vec<String>,
    pub(crate) redircnt: u32,
    pub(crate) redirmax: u32,
    pub(crate) handshake_options: i32,
    pub(crate) oobintr: bool,
    pub(crate) sizeheader: bool,
    pub(crate) columnar_protocol: bool,
    pub(crate) auto_commit: bool,
    pub(crate) cachelimit: i64,
    handles: Vec<Option<Handle>>,
    pub(crate) active: Option<HandleId>,
    pub(crate) tracelog: Option<File>,
}

impl Mapi {
    /// A fresh, unconnected session around `settings`.
    pub fn new(settings: Settings) -> Mapi {
        Mapi {
            settings,
            stream: None,
            connected: false,
            broken: false,
            motd: String::new(),
            redirects: Vec::new(),
            redircnt: 0,
            redirmax: 10,
            handshake_options: 0,
            oobintr: false,
            sizeheader: false,
            columnar_protocol: false,
            auto_commit: true,
            cachelimit: 100,
            handles: Vec::new(),
            active: None,
            tracelog: None,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Mutable access to the settings. Do not make changes while
    /// connected.
    pub fn settings_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Whether an I/O failure has made the transport unusable.
    pub fn is_broken(&self) -> bool {
        self.broken
    }

    /// The `#` lines of the welcome message.
    pub fn motd(&self) -> &str {
        &self.motd
    }

    pub fn get_autocommit(&self) -> bool {
        self.auto_commit
    }

    /// Negotiated during handshake: whether out-of-band interrupts are
    /// available.
    pub fn oob_interrupts(&self) -> bool {
        self.oobintr
    }

    /// Apply a deadline to all subsequent stream operations.
    pub fn set_timeout(&mut self, timeout: Option<Duration>) -> Result<()> {
        if let Some(stream) = &self.stream {
            stream.set_timeout(timeout)?;
        }
        Ok(())
    }

    pub(crate) fn log_record(&mut self, mark: &str, text: &str) {
        debug!(target: "mapi::conn", "{mark}: {text}");
        if let Some(log) = &mut self.tracelog {
            let _ = writeln!(log, "{mark} {text}");
        }
    }

    // handle arena ---------------------------------------------------------

    pub fn new_handle(&mut self) -> HandleId {
        for (i, slot) in self.handles.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(Handle::new());
                return HandleId(i);
            }
        }
        self.handles.push(Some(Handle::new()));
        HandleId(self.handles.len() - 1)
    }

    pub(crate) fn handle(&self, h: HandleId) -> Result<&Handle> {
        self.handles
            .get(h.0)
            .and_then(Option::as_ref)
            .ok_or(Error::Usage("invalid statement handle"))
    }

    pub(crate) fn handle_mut(&mut self, h: HandleId) -> Result<&mut Handle> {
        self.handles
            .get_mut(h.0)
            .and_then(Option::as_mut)
            .ok_or(Error::Usage("invalid statement handle"))
    }

    fn result_ref(&self, h: HandleId) -> Result<&ResultSet> {
        self.handle(h)?
            .result()
            .ok_or(Error::Usage("no current result"))
    }

    /// Close a handle, discarding unread output and releasing server-side
    /// state.
    pub fn close_handle(&mut self, h: HandleId) -> Result<()> {
        let finish = self.finish_handle(h);
        self.free_handle(h);
        finish
    }

    /// Remove the handle without any server traffic.
    pub(crate) fn free_handle(&mut self, h: HandleId) {
        if self.active == Some(h) {
            self.active = None;
        }
        if let Some(slot) = self.handles.get_mut(h.0) {
            *slot = None;
        }
    }

    // stream plumbing ------------------------------------------------------

    pub(crate) fn fail_stream(&mut self, err: Error, action: &'static str) -> Error {
        self.broken = true;
        self.close_connection();
        match err {
            Error::IoError(io)
                if matches!(
                    io.kind(),
                    std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock
                ) =>
            {
                Error::Timeout(action)
            }
            other => other,
        }
    }

    fn read_line_raw(&mut self, action: &'static str) -> Result<Vec<u8>> {
        let result = match self.stream.as_mut() {
            None => return Err(Error::Closed),
            Some(stream) => stream.read_line(),
        };
        result.map_err(|e| self.fail_stream(e, action))
    }

    pub(crate) fn write_stream(&mut self, data: &[u8], action: &'static str) -> Result<()> {
        let result = match self.stream.as_mut() {
            None => return Err(Error::Closed),
            Some(stream) => stream.write(data),
        };
        result.map_err(|e| self.fail_stream(e, action))
    }

    pub(crate) fn flush_stream(&mut self, action: &'static str) -> Result<()> {
        let result = match self.stream.as_mut() {
            None => return Err(Error::Closed),
            Some(stream) => stream.flush(),
        };
        result.map_err(|e| self.fail_stream(e, action))
    }

    /// Tear down the transport. Any open server-side result sets are
    /// forgotten, not closed.
    pub(crate) fn close_connection(&mut self) {
        self.connected = false;
        self.active = None;
        for hdl in self.handles.iter_mut().flatten() {
            hdl.active = None;
            for result in &mut hdl.results {
                result.tableid = -1;
            }
        }
        self.stream = None;
        debug!(target: "mapi::conn", "connection closed");
    }

    /// Close the connection. The session can be revived with
    /// [`Mapi::reconnect`].
    pub fn disconnect(&mut self) {
        self.close_connection();
    }

    // reply parsing --------------------------------------------------------

    /// Read ahead and cache server output for `h`.
    ///
    /// `lookahead > 0` stops at the first data line of a result that has
    /// one, `lookahead == 0` drains up to the prompt, and `lookahead < 0`
    /// behaves like 0 until a header is seen, then like 1.
    pub(crate) fn read_into_cache(&mut self, h: HandleId, mut lookahead: i32) -> Result<()> {
        debug_assert_eq!(self.active, Some(h));
        if self.handle(h)?.needmore {
            self.handle_mut(h)?.needmore = false;
            self.flush_stream("read_into_cache")?;
        }

        // the result currently receiving lines
        let mut rs: Option<usize> = {
            let hdl = self.handle(h)?;
            hdl.active
                .or_else(|| (hdl.cur < hdl.results.len()).then_some(hdl.cur))
        };

        loop {
            let line = self.read_line_raw("read_into_cache")?;
            match line.first().copied() {
                Some(PROMPT_BEGIN) => {
                    if line == PROMPT_FILE.as_bytes() {
                        // no file-transfer callback here; decline and stay
                        // in step with the server
                        self.write_stream(b"!HY000!cannot transfer files\n", "file transfer")?;
                        self.flush_stream("file transfer")?;
                        continue;
                    }
                    self.active = None;
                    self.handle_mut(h)?.active = None;
                    if line == PROMPT_MORE.as_bytes() {
                        // skip end of block
                        self.active = Some(h);
                        let _ = self.read_line_raw("read_into_cache")?;
                        self.handle_mut(h)?.needmore = true;
                        self.active = Some(h);
                    }
                    return Ok(());
                }
                Some(b'!') => {
                    let text = as_utf8(&line)?.to_string();
                    let cachelimit = self.cachelimit;
                    let hdl = self.handle_mut(h)?;
                    // start a new result set if we don't have one yet, or
                    // if the current one already produced normal output
                    let need_new = match rs.map(|i| &hdl.results[i]) {
                        None => true,
                        Some(r) => r.cache.writer() > 0 || r.typed,
                    };
                    let idx = if need_new {
                        let idx = hdl.new_result(cachelimit);
                        hdl.results[idx].commentonly = false;
                        idx
                    } else {
                        rs.expect("need_new is false")
                    };
                    hdl.active = Some(idx);
                    rs = Some(idx);
                    hdl.results[idx].add_error(&text[1..]);
                }
                Some(b'%') | Some(b'#') | Some(b'&') => {
                    if lookahead < 0 {
                        lookahead = 1;
                    }
                    let text = as_utf8(&line)?.to_string();
                    let lang_is_mal = self.settings.lang_is_mal();
                    let cachelimit = self.cachelimit;
                    let hdl = self.handle_mut(h)?;
                    let (idx, autocommit) =
                        parse_header_line(hdl, rs, &text, lang_is_mal, cachelimit);
                    hdl.active = Some(idx);
                    rs = Some(idx);
                    if !text.starts_with('&') {
                        hdl.results[idx].add_cache(text, lookahead == 0);
                    }
                    if let Some(value) = autocommit {
                        self.auto_commit = value;
                    }
                }
                _ => {
                    let text = as_utf8(&line)?.to_string();
                    let cachelimit = self.cachelimit;
                    let hdl = self.handle_mut(h)?;
                    let idx = match rs {
                        Some(idx) => idx,
                        None => hdl.new_result(cachelimit),
                    };
                    hdl.active = Some(idx);
                    rs = Some(idx);
                    hdl.results[idx].add_cache(text, lookahead == 0);
                    if lookahead > 0 {
                        let qt = hdl.results[idx].querytype;
                        let typed = hdl.results[idx].typed;
                        if !typed || matches!(qt, Some(QueryType::Table) | Some(QueryType::Update))
                        {
                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    // sending queries ------------------------------------------------------

    fn prepare_query_text(&mut self, h: HandleId, cmd: &str) -> Result<()> {
        let hdl = self.handle_mut(h)?;
        hdl.query = Some(cmd.to_string());
        hdl.template = None;
        Ok(())
    }

    fn execute_internal(&mut self, h: HandleId) -> Result<()> {
        if let Some(a) = self.active {
            self.read_into_cache(a, 0)?;
        }
        debug_assert!(self.active.is_none());
        self.finish_handle(h)?;

        let lang_is_sql = self.settings.lang_is_sql();
        let lang_is_mal = self.settings.lang_is_mal();
        let cmd = {
            let hdl = self.handle_mut(h)?;
            if let Some(template) = hdl.template.clone() {
                hdl.query = Some(crate::params::substitute(
                    &template,
                    &hdl.params,
                    lang_is_mal,
                ));
            }
            hdl.query
                .clone()
                .ok_or(Error::Usage("no query prepared on this handle"))?
        };

        debug!(target: "mapi::conn", "sending query of {} bytes", cmd.len());
        if lang_is_sql {
            // indicate to the server this is a SQL command
            self.write_stream(b"s", "execute")?;
        }
        self.write_stream(cmd.as_bytes(), "execute")?;
        if lang_is_sql {
            // all SQL statements should end with a semicolon
            self.write_stream(b"\n;", "execute")?;
        }
        self.write_stream(b"\n", "execute")?;
        self.flush_stream("execute")?;
        self.active = Some(h);
        Ok(())
    }

    /// Send a complete statement and read the response into the cache.
    ///
    /// Server-side statement failures are attached to the handle's result
    /// sets; see [`Mapi::result_error`].
    pub fn query(&mut self, cmd: &str) -> Result<HandleId> {
        self.check_connected()?;
        let h = self.new_handle();
        let outcome = self
            .prepare_query_text(h, cmd)
            .and_then(|()| self.execute_internal(h))
            .and_then(|()| self.read_into_cache(h, 1));
        match outcome {
            Ok(()) => Ok(h),
            Err(e) => {
                self.free_handle(h);
                Err(e)
            }
        }
    }

    /// Send a statement without waiting for the response; pair with
    /// [`Mapi::read_response`].
    pub fn send(&mut self, cmd: &str) -> Result<HandleId> {
        self.check_connected()?;
        let h = self.new_handle();
        let outcome = self
            .prepare_query_text(h, cmd)
            .and_then(|()| self.execute_internal(h));
        match outcome {
            Ok(()) => Ok(h),
            Err(e) => {
                self.free_handle(h);
                Err(e)
            }
        }
    }

    pub fn read_response(&mut self, h: HandleId) -> Result<()> {
        self.read_into_cache(h, 1)
    }

    /// Run another statement on an existing handle.
    pub fn query_handle(&mut self, h: HandleId, cmd: &str) -> Result<()> {
        self.finish_handle(h)?;
        self.prepare_query_text(h, cmd)?;
        self.execute_internal(h)?;
        self.read_into_cache(h, 1)
    }

    /// Begin an incremental statement; feed text with
    /// [`Mapi::query_part`] and finish with [`Mapi::query_done`].
    pub fn query_prep(&mut self) -> Result<HandleId> {
        self.check_connected()?;
        if let Some(a) = self.active {
            self.read_into_cache(a, 0)?;
        }
        if self.settings.lang_is_sql() {
            self.write_stream(b"S", "query_prep")?;
        }
        let h = self.new_handle();
        self.active = Some(h);
        Ok(h)
    }

    pub fn query_part(&mut self, h: HandleId, text: &str) -> Result<()> {
        debug_assert!(self.active.is_none() || self.active == Some(h));
        self.active = Some(h);
        {
            let hdl = self.handle_mut(h)?;
            // remember the query text for error messages, within reason
            match &mut hdl.query {
                None => hdl.query = Some(text.to_string()),
                Some(q) if q.len() < 512 => q.push_str(text),
                _ => {}
            }
            hdl.needmore = false;
        }
        self.write_stream(text.as_bytes(), "query_part")
    }

    /// Flush the accumulated statement and read the response. Returns
    /// true when the server wants more input.
    pub fn query_done(&mut self, h: HandleId) -> Result<bool> {
        debug_assert!(self.active.is_none() || self.active == Some(h));
        self.active = Some(h);
        self.handle_mut(h)?.needmore = false;
        self.flush_stream("query_done")?;
        self.read_into_cache(h, 1)?;
        Ok(self.handle(h)?.needmore)
    }

    /// Whether the previous send was left incomplete by the server.
    pub fn needmore(&self, h: HandleId) -> bool {
        self.handle(h).map(|hdl| hdl.needmore).unwrap_or(false)
    }

    // prepared statements --------------------------------------------------

    /// Keep `cmd` as a template with `?` placeholders for
    /// [`Mapi::execute`].
    pub fn prepare(&mut self, cmd: &str) -> Result<HandleId> {
        self.check_connected()?;
        let h = self.new_handle();
        self.prepare_handle(h, cmd)?;
        Ok(h)
    }

    pub fn prepare_handle(&mut self, h: HandleId, cmd: &str) -> Result<()> {
        self.finish_handle(h)?;
        let hdl = self.handle_mut(h)?;
        hdl.query = Some(cmd.to_string());
        hdl.template = Some(cmd.to_string());
        Ok(())
    }

    pub fn execute(&mut self, h: HandleId) -> Result<()> {
        self.execute_internal(h)?;
        self.read_into_cache(h, 1)
    }

    pub fn set_param(&mut self, h: HandleId, index: usize, value: Param) -> Result<()> {
        let hdl = self.handle_mut(h)?;
        if hdl.params.len() <= index {
            hdl.params.resize(index + 1, None);
        }
        hdl.params[index] = Some(value);
        Ok(())
    }

    pub fn clear_params(&mut self, h: HandleId) -> Result<()> {
        self.handle_mut(h)?.params.clear();
        Ok(())
    }

    // fetching -------------------------------------------------------------

    fn fetch_line_advance(&mut self, h: HandleId) -> Result<bool> {
        let exhausted = {
            let hdl = self.handle(h)?;
            match hdl.result() {
                Some(r) => {
                    r.cache.writer() == 0 || (r.cache.reader + 1) as usize >= r.cache.writer()
                }
                None => true,
            }
        };
        if exhausted {
            if self.active != Some(h) || self.handle(h)?.needmore {
                return Ok(false);
            }
            self.read_into_cache(h, 1)?;
            let hdl = self.handle(h)?;
            match hdl.result() {
                Some(r)
                    if r.cache.writer() > 0
                        && ((r.cache.reader + 1) as usize) < r.cache.writer() => {}
                _ => return Ok(false),
            }
        }
        let hdl = self.handle_mut(h)?;
        let result = hdl.result_mut().expect("checked above");
        result.cache.reader += 1;
        Ok(true)
    }

    /// Advance to the next cached line, demand-fetching the next page of
    /// a table result when the server still holds rows.
    fn fetch_line_step(&mut self, h: HandleId) -> Result<bool> {
        if self.fetch_line_advance(h)? {
            return Ok(true);
        }
        let wants_export = {
            let hdl = self.handle(h)?;
            match hdl.result() {
                Some(r) => {
                    self.settings.lang_is_sql()
                        && r.querytype == Some(QueryType::Table)
                        && r.row_count > 0
                        && r.cache.first + r.cache.tuplecount < r.row_count
                }
                None => false,
            }
        };
        if !wants_export || self.handle(h)?.needmore {
            return Ok(false);
        }
        if let Some(a) = self.active {
            self.read_into_cache(a, 0)?;
        }
        self.active = Some(h);
        let (tableid, next_first) = {
            let hdl = self.handle_mut(h)?;
            hdl.active = Some(hdl.cur);
            let r = hdl.result().expect("checked above");
            (r.tableid, r.cache.first + r.cache.tuplecount)
        };
        let command = format!("Xexport {tableid} {next_first}\n");
        self.log_record("W", command.trim_end());
        self.write_stream(command.as_bytes(), "fetch_line")?;
        self.flush_stream("fetch_line")?;
        self.fetch_line_advance(h)
    }

    /// The next raw line of the current result, paging as needed.
    pub fn fetch_line(&mut self, h: HandleId) -> Result<Option<&str>> {
        if !self.fetch_line_step(h)? {
            return Ok(None);
        }
        let r = self.result_ref(h)?;
        Ok(Some(r.cache.lines[r.cache.reader as usize].raw.as_str()))
    }

    /// Advance to the next data tuple. Returns its field count, or 0 when
    /// the result is exhausted.
    pub fn fetch_row(&mut self, h: HandleId) -> Result<usize> {
        loop {
            if !self.fetch_line_step(h)? {
                return Ok(0);
            }
            let r = self.result_ref(h)?;
            if r.cache.lines[r.cache.reader as usize].is_tuple() {
                break;
            }
        }
        self.slice_current_row(h)
    }

    /// Pull every remaining row of the current result into the cache.
    /// Returns the number of cached tuples.
    pub fn fetch_all_rows(&mut self, h: HandleId) -> Result<i64> {
        loop {
            let export = {
                let hdl = self.handle(h)?;
                match hdl.result() {
                    Some(r) => {
                        self.settings.lang_is_sql()
                            && self.active.is_none()
                            && r.row_count > 0
                            && r.cache.first + r.cache.tuplecount < r.row_count
                    }
                    None => false,
                }
            };
            if export {
                self.active = Some(h);
                let (tableid, next_first) = {
                    let hdl = self.handle_mut(h)?;
                    hdl.active = Some(hdl.cur);
                    let r = hdl.result().expect("checked above");
                    (r.tableid, r.cache.first + r.cache.tuplecount)
                };
                let command = format!("Xexport {tableid} {next_first}\n");
                self.log_record("W", command.trim_end());
                self.write_stream(command.as_bytes(), "fetch_all_rows")?;
                self.flush_stream("fetch_all_rows")?;
            }
            match self.active {
                Some(a) => self.read_into_cache(a, 0)?,
                None => break,
            }
        }
        Ok(self
            .handle(h)?
            .result()
            .map(|r| r.cache.tuplecount)
            .unwrap_or(0))
    }

    fn slice_current_row(&mut self, h: HandleId) -> Result<usize> {
        let null = if self.settings.lang_is_sql() {
            "NULL"
        } else {
            "nil"
        };
        let hdl = self.handle_mut(h)?;
        let result = hdl.result_mut().ok_or(Error::Usage("no current result"))?;
        let reader = result.cache.reader;
        if reader < 0 {
            return Err(Error::Usage("must do a successful fetch_row first"));
        }
        let line = &mut result.cache.lines[reader as usize];
        if !line.fields.is_empty() {
            return Ok(line.fields.len());
        }
        line.fields = if !line.raw.starts_with('[') {
            let text = line.raw.strip_prefix('=').unwrap_or(&line.raw);
            vec![Some(text.to_string())]
        } else {
            slice_row(&line.raw, Some(null), b']')
        };
        let n = line.fields.len();

        if n != result.fieldcnt {
            // column metadata no longer matches what the rows contain
            for column in &mut result.columns {
                column.name = None;
                column.typ = None;
                column.table_name = None;
                column.length = 0;
            }
        }
        if n > result.fieldcnt {
            result.fieldcnt = n;
            result.ensure_columns(n);
        }
        Ok(n)
    }

    /// Field `fnr` of the current row; `None` is a database NULL.
    pub fn fetch_field(&mut self, h: HandleId, fnr: usize) -> Result<Option<&str>> {
        self.check_current_is_tuple(h)?;
        self.slice_current_row(h)?;
        let r = self.result_ref(h)?;
        let line = &r.cache.lines[r.cache.reader as usize];
        line.fields
            .get(fnr)
            .map(|f| f.as_deref())
            .ok_or(Error::Usage("illegal field number"))
    }

    /// Byte length of field `fnr` of the current row (0 for NULL).
    pub fn fetch_field_len(&mut self, h: HandleId, fnr: usize) -> Result<usize> {
        Ok(self.fetch_field(h, fnr)?.map(str::len).unwrap_or(0))
    }

    fn check_current_is_tuple(&self, h: HandleId) -> Result<()> {
        let r = self.result_ref(h)?;
        let reader = r.cache.reader;
        if reader < 0 || !r.cache.lines[reader as usize].is_tuple() {
            return Err(Error::Usage("must do a successful fetch_row first"));
        }
        Ok(())
    }

    /// Rewind the read cursor to before the first cached row.
    pub fn fetch_reset(&mut self, h: HandleId) -> Result<()> {
        if let Some(r) = self.handle_mut(h)?.result_mut() {
            r.cache.reader = -1;
        }
        Ok(())
    }

    /// Position the read cursor so the next fetch returns row `rownr`
    /// (counted per `whence`). Rows outside the cache reset it and tag
    /// the next server fetch with the new start row.
    pub fn seek_row(&mut self, h: HandleId, rownr: i64, whence: Seek) -> Result<()> {
        let mut rownr = rownr;
        match whence {
            Seek::Set => {}
            Seek::Cur => {
                let r = self.result_ref(h)?;
                let next = (r.cache.reader + 1) as usize;
                let base = r
                    .cache
                    .lines
                    .get(next)
                    .map(|l| l.tuplerev)
                    .unwrap_or(r.cache.tuplecount);
                rownr += r.cache.first + base;
            }
            Seek::End => {
                if let Some(a) = self.active {
                    self.read_into_cache(a, 0)?;
                }
                rownr += self.result_ref(h)?.row_count;
            }
        }

        if rownr > self.result_ref(h)?.row_count {
            if let Some(a) = self.active {
                self.read_into_cache(a, 0)?;
            }
        }
        let row_count = self.result_ref(h)?.row_count;
        if rownr < 0 || rownr > row_count {
            return Err(Error::Usage("illegal row number"));
        }

        let hdl = self.handle_mut(h)?;
        let r = hdl.result_mut().ok_or(Error::Usage("no current result"))?;
        if r.cache.first <= rownr && rownr < r.cache.first + r.cache.tuplecount {
            // the requested tuple is in the cache
            let line = r
                .cache
                .tuple_line(rownr - r.cache.first)
                .ok_or_else(|| Error::LibraryBug(eyre!("tuple map out of sync")))?;
            r.cache.reader = line as isize - 1;
        } else {
            // reset the cache; the next fetch starts at the new first row
            let k = r.cache.writer();
            r.cache.freeup(k);
            r.cache.first = rownr;
        }
        Ok(())
    }

    // result navigation ----------------------------------------------------

    fn send_xclose(&mut self, h: HandleId, tableid: i64) -> Result<()> {
        let command = format!("Xclose {tableid}\n");
        self.log_record("W", command.trim_end());
        self.write_stream(command.as_bytes(), "close_result")?;
        self.flush_stream("close_result")?;
        self.active = Some(h);
        self.read_into_cache(h, 0)
    }

    /// Close the current result set, telling the server to drop any rows
    /// it still holds for it.
    fn close_result(&mut self, h: HandleId) -> Result<()> {
        let Some(cur) = ({
            let hdl = self.handle(h)?;
            (hdl.cur < hdl.results.len()).then_some(hdl.cur)
        }) else {
            return Ok(());
        };

        let (tableid, querytype, is_last) = {
            let hdl = self.handle(h)?;
            let r = &hdl.results[cur];
            (r.tableid, r.querytype, cur + 1 == hdl.results.len())
        };

        if tableid >= 0 && querytype != Some(QueryType::Prepare) {
            if let Some(a) = self.active {
                if is_last && !self.handle(a)?.needmore {
                    self.read_into_cache(a, -1)?;
                }
            }
            let defer = match self.active {
                Some(a) => {
                    let parsing_this = a == h && self.handle(h)?.active == Some(cur);
                    let r = &self.handle(h)?.results[cur];
                    !parsing_this || r.cache.tuplecount < r.row_count
                }
                None => false,
            };
            if defer {
                let r = &self.handle(h)?.results[cur];
                // results fully delivered up front were already dropped by
                // the server
                if r.row_count > r.tuple_count {
                    self.handle_mut(h)?.pending_close.push(tableid);
                }
            } else if self.connected {
                let pending = std::mem::take(&mut self.handle_mut(h)?.pending_close);
                for id in pending {
                    self.send_xclose(h, id)?;
                }
                let needs_close = {
                    let r = &self.handle(h)?.results[cur];
                    r.tuple_count < r.row_count
                };
                if needs_close {
                    self.send_xclose(h, tableid)?;
                }
            }
            self.handle_mut(h)?.results[cur].tableid = -1;
        }

        if self.active == Some(h) && self.handle(h)?.active == Some(cur) {
            self.read_into_cache(h, -1)?;
        }
        if self.handle(h)?.active == Some(cur) {
            return Err(Error::LibraryBug(eyre!(
                "result set still receiving output after drain"
            )));
        }

        let hdl = self.handle_mut(h)?;
        hdl.results[cur].clear();
        hdl.cur += 1;
        Ok(())
    }

    /// Discard the current result set and move to the next one, if any.
    pub fn next_result(&mut self, h: HandleId) -> Result<bool> {
        while self.handle(h)?.result().is_some() {
            self.close_result(h)?;
            if let Some(r) = self.handle(h)?.result() {
                let interesting = !r.typed
                    || matches!(
                        r.querytype,
                        Some(QueryType::Table)
                            | Some(QueryType::Update)
                            | Some(QueryType::Schema)
                            | Some(QueryType::Trans)
                            | Some(QueryType::Prepare)
                    )
                    || r.error.is_some();
                if interesting {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    /// Whether further result sets follow the current one.
    pub fn more_results(&mut self, h: HandleId) -> Result<bool> {
        if self.handle(h)?.result().is_none() {
            return Ok(false);
        }
        if self.result_ref(h)?.querytype == Some(QueryType::Table) && self.active == Some(h) {
            self.read_into_cache(h, -1)?;
        }
        if self.handle(h)?.needmore {
            return Ok(true);
        }
        let hdl = self.handle(h)?;
        Ok(hdl.results[hdl.cur + 1..].iter().any(|r| {
            !r.typed
                || matches!(
                    r.querytype,
                    Some(QueryType::Table)
                        | Some(QueryType::Update)
                        | Some(QueryType::Schema)
                        | Some(QueryType::Trans)
                        | Some(QueryType::Prepare)
                )
                || r.error.is_some()
        }))
    }

    /// Drain and discard all outstanding output for the handle.
    pub fn finish(&mut self, h: HandleId) -> Result<()> {
        self.finish_handle(h)
    }

    pub(crate) fn finish_handle(&mut self, h: HandleId) -> Result<()> {
        if self.active == Some(h) && !self.handle(h)?.needmore {
            self.read_into_cache(h, 0)?;
        }
        if self.connected {
            if self.handle(h)?.needmore {
                self.handle_mut(h)?.needmore = false;
                self.active = Some(h);
                self.flush_stream("finish_handle")?;
                self.read_into_cache(h, 0)?;
            }
            let pending = std::mem::take(&mut self.handle_mut(h)?.pending_close);
            for id in pending {
                self.send_xclose(h, id)?;
            }
        }
        self.handle_mut(h)?.pending_close.clear();
        while self.handle(h)?.result().is_some() {
            self.close_result(h)?;
            if self.handle(h)?.needmore {
                self.handle_mut(h)?.needmore = false;
                self.active = Some(h);
                self.flush_stream("finish_handle")?;
                self.read_into_cache(h, 0)?;
            }
        }
        Ok(())
    }

    // result accessors -----------------------------------------------------

    /// The server-side error of the current result, if any.
    pub fn result_error(&self, h: HandleId) -> Option<&str> {
        self.handle(h)
            .ok()
            .and_then(Handle::result)
            .and_then(|r| r.error.as_deref())
    }

    /// The SQLSTATE of the current result's first error.
    pub fn result_sqlstate(&self, h: HandleId) -> Option<&str> {
        self.handle(h)
            .ok()
            .and_then(Handle::result)
            .and_then(|r| r.sqlstate.as_deref())
    }

    pub fn get_field_count(&self, h: HandleId) -> usize {
        let Ok(hdl) = self.handle(h) else { return 0 };
        let Some(r) = hdl.result() else { return 0 };
        if r.fieldcnt == 0 {
            // no header seen; the sliced rows know best
            return r
                .cache
                .lines
                .iter()
                .map(|l| l.fields.len())
                .max()
                .unwrap_or(0);
        }
        r.fieldcnt
    }

    pub fn get_row_count(&self, h: HandleId) -> i64 {
        self.handle(h)
            .ok()
            .and_then(Handle::result)
            .map(|r| r.row_count)
            .unwrap_or(0)
    }

    /// Rows touched by an update/insert/delete.
    pub fn rows_affected(&self, h: HandleId) -> i64 {
        self.get_row_count(h)
    }

    pub fn get_last_id(&self, h: HandleId) -> i64 {
        self.handle(h)
            .ok()
            .and_then(Handle::result)
            .map(|r| r.last_id)
            .unwrap_or(-1)
    }

    pub fn get_querytype(&self, h: HandleId) -> Option<QueryType> {
        self.handle(h).ok().and_then(Handle::result)?.querytype
    }

    pub fn get_tableid(&self, h: HandleId) -> i64 {
        self.handle(h)
            .ok()
            .and_then(Handle::result)
            .map(|r| r.tableid)
            .unwrap_or(-1)
    }

    pub fn get_querytime(&self, h: HandleId) -> i64 {
        self.handle(h)
            .ok()
            .and_then(Handle::result)
            .map(|r| r.querytime)
            .unwrap_or(0)
    }

    pub fn get_maloptimizertime(&self, h: HandleId) -> i64 {
        self.handle(h)
            .ok()
            .and_then(Handle::result)
            .map(|r| r.maloptimizertime)
            .unwrap_or(0)
    }

    pub fn get_sqloptimizertime(&self, h: HandleId) -> i64 {
        self.handle(h)
            .ok()
            .and_then(Handle::result)
            .map(|r| r.sqloptimizertime)
            .unwrap_or(0)
    }

    fn column(&self, h: HandleId, fnr: usize) -> Option<&Column> {
        self.handle(h).ok()?.result()?.columns.get(fnr)
    }

    pub fn get_name(&self, h: HandleId, fnr: usize) -> Option<&str> {
        self.column(h, fnr)?.name.as_deref()
    }

    pub fn get_type(&self, h: HandleId, fnr: usize) -> Option<&str> {
        self.column(h, fnr)?.typ.as_deref()
    }

    pub fn get_table(&self, h: HandleId, fnr: usize) -> Option<&str> {
        self.column(h, fnr)?.table_name.as_deref()
    }

    pub fn get_len(&self, h: HandleId, fnr: usize) -> i32 {
        self.column(h, fnr).map(|c| c.length).unwrap_or(0)
    }

    pub fn get_digits(&self, h: HandleId, fnr: usize) -> i32 {
        self.column(h, fnr).map(|c| c.digits).unwrap_or(0)
    }

    pub fn get_scale(&self, h: HandleId, fnr: usize) -> i32 {
        self.column(h, fnr).map(|c| c.scale).unwrap_or(0)
    }

    pub fn get_query(&self, h: HandleId) -> Option<&str> {
        self.handle(h).ok()?.query.as_deref()
    }

    // control commands -----------------------------------------------------

    fn check_connected(&self) -> Result<()> {
        if !self.connected {
            return Err(Error::Closed);
        }
        Ok(())
    }

    /// Issue an `X` control command and drain its reply.
    pub(crate) fn xcommand(&mut self, name: &str, value: &str) -> Result<()> {
        self.check_connected()?;
        if let Some(a) = self.active {
            self.read_into_cache(a, 0)?;
        }
        let command = format!("X{name} {value}\n");
        self.log_record("W", command.trim_end());
        self.write_stream(command.as_bytes(), "xcommand")?;
        self.flush_stream("xcommand")?;
        let h = self.new_handle();
        self.handle_mut(h)?.query = Some("Xcommand".to_string());
        self.active = Some(h);
        let read = self.read_into_cache(h, 0);
        let close = self.close_handle(h);
        read.and(close)
    }

    /// Check the connection is alive with a harmless statement.
    pub fn ping(&mut self) -> Result<()> {
        let cmd = if self.settings.lang_is_sql() {
            "select true;"
        } else if self.settings.lang_is_mal() {
            "io.print(1);"
        } else {
            return Ok(());
        };
        let h = self.query(cmd)?;
        self.close_handle(h)
    }

    /// Set or unset the autocommit flag in the server.
    pub fn set_autocommit(&mut self, autocommit: bool) -> Result<()> {
        if self.auto_commit == autocommit {
            return Ok(());
        }
        if !self.settings.lang_is_sql() {
            return Err(Error::Usage("autocommit is only supported in SQL"));
        }
        self.auto_commit = autocommit;
        self.xcommand("auto_commit", if autocommit { "1" } else { "0" })
    }

    /// Ask the server to prefix result sets with a size header.
    pub fn set_size_header(&mut self, value: bool) -> Result<()> {
        if !self.settings.lang_is_sql() {
            return Err(Error::Usage("size header is only supported in SQL"));
        }
        self.sizeheader = value;
        // no underscore, unlike the handshake option
        self.xcommand("sizeheader", if value { "1" } else { "0" })
    }

    /// Release a server-side prepared-statement id.
    pub fn release_id(&mut self, id: i64) -> Result<()> {
        if !self.settings.lang_is_sql() {
            return Err(Error::Usage("release is only supported in SQL"));
        }
        self.xcommand("release", &id.to_string())
    }

    /// Change how many rows the server sends per reply, and the cache
    /// limit for new result sets.
    pub fn cache_limit(&mut self, limit: i64) -> Result<()> {
        self.cachelimit = limit;
        if self.settings.lang_is_sql() {
            self.xcommand("reply_size", &limit.to_string())?;
        }
        Ok(())
    }

    /// Tell the server the client's UTC offset in seconds.
    pub fn set_time_zone(&mut self, seconds: i64) -> Result<()> {
        if !self.settings.lang_is_sql() {
            return Ok(());
        }
        let sign = if seconds < 0 { '-' } else { '+' };
        let abs = seconds.abs();
        let statement = format!(
            "SET TIME ZONE INTERVAL '{sign}{:02}:{:02}' HOUR TO MINUTE",
            abs / 3600,
            (abs % 3600) / 60
        );
        let h = self.query(&statement)?;
        self.close_handle(h)
    }
}

fn as_utf8(line: &[u8]) -> Result<&str> {
    simdutf8::basic::from_utf8(line)
        .map_err(|_| Error::Protocol("server sent a line that is not valid UTF-8".into()))
}

/// Digest a `&`, `%` or `#` header line into the handle's result list.
/// Returns the index of the result the line applied to, and the new
/// autocommit state when the server reported a transaction change.
fn parse_header_line(
    hdl: &mut Handle,
    rs: Option<usize>,
    line: &str,
    lang_is_mal: bool,
    rowlimit: i64,
) -> (usize, Option<bool>) {
    if let Some(rest) = line.strip_prefix('&') {
        let mut tokens = rest.split_whitespace();
        let qt_code: i64 = tokens
            .next()
            .and_then(|t| t.parse().ok())
            .unwrap_or(-1);
        let qt = QueryType::from_code(qt_code);

        let reuse = matches!(
            rs.map(|i| &hdl.results[i]),
            Some(r) if qt == Some(QueryType::Block) || r.commentonly
        );
        let idx = if reuse {
            rs.expect("reuse implies some")
        } else {
            hdl.new_result(rowlimit)
        };
        let result = &mut hdl.results[idx];
        result.typed = true;
        result.commentonly = false;
        result.querytime = 0;
        result.maloptimizertime = 0;
        result.sqloptimizertime = 0;
        result.querytype = qt;

        fn num(tokens: &mut std::str::SplitWhitespace<'_>) -> i64 {
            tokens.next().and_then(|t| t.parse().ok()).unwrap_or(0)
        }
        let mut autocommit = None;
        match qt {
            Some(QueryType::Schema) => {
                result.querytime = num(&mut tokens);
                result.maloptimizertime = num(&mut tokens);
                result.sqloptimizertime = num(&mut tokens);
            }
            Some(QueryType::Trans) => {
                // the single token after the query type: 't' or 'f'
                autocommit = Some(tokens.next().map(|t| !t.starts_with('f')).unwrap_or(true));
            }
            Some(QueryType::Update) => {
                result.row_count = num(&mut tokens);
                result.last_id = num(&mut tokens);
                let _queryid = num(&mut tokens);
                result.querytime = num(&mut tokens);
                result.maloptimizertime = num(&mut tokens);
                result.sqloptimizertime = num(&mut tokens);
            }
            Some(QueryType::Table) => {
                result.tableid = num(&mut tokens);
                result.row_count = num(&mut tokens);
                result.fieldcnt = num(&mut tokens).max(0) as usize;
                result.tuple_count = num(&mut tokens);
                let _queryid = num(&mut tokens);
                result.querytime = num(&mut tokens);
                result.maloptimizertime = num(&mut tokens);
                result.sqloptimizertime = num(&mut tokens);
            }
            Some(QueryType::Prepare) => {
                result.tableid = num(&mut tokens);
                result.row_count = num(&mut tokens);
                result.fieldcnt = num(&mut tokens).max(0) as usize;
                result.tuple_count = num(&mut tokens);
            }
            Some(QueryType::Block) => {
                // continuation of a previous page, nothing to record
                result.querytype = Some(QueryType::Table);
            }
            _ => {}
        }
        let fieldcnt = result.fieldcnt;
        result.ensure_columns(fieldcnt);
        return (idx, autocommit);
    }

    let idx = match rs {
        Some(idx) => idx,
        None => hdl.new_result(rowlimit),
    };

    if line.starts_with('#') && !lang_is_mal {
        // comment
        return (idx, None);
    }

    let Some(etag) = line.rfind('#').filter(|&p| p > 0) else {
        // not a useful header line
        return (idx, None);
    };
    let tag = line[etag + 1..].trim();
    let values = slice_row(line, None, b'#');
    let n = values.len();

    let result = &mut hdl.results[idx];
    result.commentonly = false;
    if n > result.fieldcnt {
        result.fieldcnt = n;
        result.ensure_columns(n);
    }

    match tag {
        "name" => {
            result.fieldcnt = n;
            for (column, value) in result.columns.iter_mut().zip(values) {
                if value.is_some() {
                    column.name = value;
                }
            }
        }
        "type" => {
            result.fieldcnt = n;
            for (column, value) in result.columns.iter_mut().zip(values) {
                if value.is_some() {
                    column.typ = value;
                }
            }
        }
        "length" => {
            result.fieldcnt = n;
            for (column, value) in result.columns.iter_mut().zip(values) {
                if let Some(value) = value {
                    column.length = value.trim().parse().unwrap_or(0);
                }
            }
        }
        "table_name" => {
            result.fieldcnt = n;
            for (column, value) in result.columns.iter_mut().zip(values) {
                if value.is_some() {
                    column.table_name = value;
                }
            }
        }
        "typesizes" => {
            result.fieldcnt = n;
            for (column, value) in result.columns.iter_mut().zip(values) {
                if let Some(value) = value {
                    let mut parts = value.split_whitespace();
                    column.digits = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
                    column.scale = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
                }
            }
        }
        _ => {}
    }

    (idx, None)
}

#[cfg(test)]
pub(crate) fn mock_session(settings: Settings, input: Vec<u8>) -> Mapi {
    use crate::stream::mock::MockStream;
    use crate::stream::Stream;

    let mut mid = Mapi::new(settings);
    mid.stream = Some(BlockStream::new(Stream::Mock(MockStream::with_input(input))));
    mid.connected = true;
    mid
}
