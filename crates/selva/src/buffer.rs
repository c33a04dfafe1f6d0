//! Buffers, point, narrowing, and the editor primitives.
//!
//! This is the smallest editor-state model that gives every editor opcode
//! its documented observable behavior: a set of named buffers, one current
//! buffer, character-based text with 1-based positions, an accessible
//! region `[begv, zv]` maintained by narrowing, and global match-data
//! registers. Text is a `Vec<char>`; positional edits are O(n), which is
//! fine at this crate's scale.

use crate::{
    binding::UnwindAction,
    env::Env,
    error::RunResult,
    heap::{HeapData, Marker},
    intern::Q,
    tracer::ExecTracer,
    value::Value,
};

const TAB_WIDTH: usize = 8;

/// Handle of a buffer in the buffer set. Buffers are permanent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferId(u32);

/// One buffer: text, point, and narrowing bounds.
///
/// Positions are 1-based character positions; `z = len + 1` is the position
/// after the last character. The accessible region is `[begv, zv]` and
/// point always satisfies `begv <= pt <= zv`.
#[derive(Debug)]
pub(crate) struct Buffer {
    pub name: Box<str>,
    text: Vec<char>,
    pt: usize,
    begv: usize,
    zv: usize,
}

impl Buffer {
    fn new(name: &str) -> Self {
        Self {
            name: name.into(),
            text: Vec::new(),
            pt: 1,
            begv: 1,
            zv: 1,
        }
    }

    /// Position after the last character of the whole buffer.
    #[inline]
    pub fn z(&self) -> usize {
        self.text.len() + 1
    }

    #[inline]
    pub fn point(&self) -> usize {
        self.pt
    }

    #[inline]
    pub fn begv(&self) -> usize {
        self.begv
    }

    #[inline]
    pub fn zv(&self) -> usize {
        self.zv
    }

    /// Moves point, clamping into the accessible region.
    pub fn set_point(&mut self, pos: usize) {
        self.pt = pos.clamp(self.begv, self.zv);
    }

    /// The character at `pos`, which must be below `z`.
    #[inline]
    pub fn char_at(&self, pos: usize) -> char {
        self.text[pos - 1]
    }

    /// Inserts characters at point, moving point past them.
    pub fn insert_chars(&mut self, chars: &[char]) {
        let at = self.pt - 1;
        self.text.splice(at..at, chars.iter().copied());
        self.zv += chars.len();
        self.pt += chars.len();
    }

    /// Deletes `[beg, end)`; both must lie in the accessible region.
    pub fn delete_range(&mut self, beg: usize, end: usize) {
        self.text.drain(beg - 1..end - 1);
        let n = end - beg;
        self.zv -= n;
        if self.pt >= end {
            self.pt -= n;
        } else if self.pt > beg {
            self.pt = beg;
        }
    }

    pub fn narrow(&mut self, begv: usize, zv: usize) {
        self.begv = begv;
        self.zv = zv;
        self.pt = self.pt.clamp(begv, zv);
    }

    pub fn widen(&mut self) {
        self.begv = 1;
        self.zv = self.z();
    }

    /// Restores saved narrowing bounds, clamping against edits made while
    /// the restriction was saved.
    pub fn restore_restriction(&mut self, begv: usize, zv: usize) {
        let z = self.z();
        let begv = begv.min(z);
        let zv = zv.clamp(begv, z);
        self.narrow(begv, zv);
    }

    /// Erases all text and widens.
    pub fn erase(&mut self) {
        self.text.clear();
        self.pt = 1;
        self.begv = 1;
        self.zv = 1;
    }

    /// Start position of the line containing `pos`.
    fn line_start(&self, pos: usize) -> usize {
        let mut p = pos;
        while p > self.begv && self.char_at(p - 1) != '\n' {
            p -= 1;
        }
        p
    }

    /// End position of the line containing `pos` (before the newline).
    fn line_end(&self, pos: usize) -> usize {
        let mut p = pos;
        while p < self.zv && self.char_at(p) != '\n' {
            p += 1;
        }
        p
    }

    /// Display column of `pos`, counting tabs as stops of `TAB_WIDTH`.
    fn column_at(&self, pos: usize) -> usize {
        let mut col = 0;
        for p in self.line_start(pos)..pos {
            if self.char_at(p) == '\t' {
                col = (col / TAB_WIDTH + 1) * TAB_WIDTH;
            } else {
                col += 1;
            }
        }
        col
    }
}

/// All live buffers plus the current one.
#[derive(Debug)]
pub struct BufferSet {
    buffers: Vec<Buffer>,
    current: BufferId,
}

impl BufferSet {
    pub(crate) fn new() -> Self {
        Self {
            buffers: vec![Buffer::new("*scratch*")],
            current: BufferId(0),
        }
    }

    pub(crate) fn get_or_create(&mut self, name: &str) -> BufferId {
        if let Some(idx) = self.buffers.iter().position(|b| &*b.name == name) {
            return BufferId(idx as u32);
        }
        let id = BufferId(u32::try_from(self.buffers.len()).expect("buffer index exceeds u32"));
        self.buffers.push(Buffer::new(name));
        id
    }

    pub(crate) fn lookup(&self, name: &str) -> Option<BufferId> {
        self.buffers.iter().position(|b| &*b.name == name).map(|i| BufferId(i as u32))
    }

    #[inline]
    pub(crate) fn current(&self) -> BufferId {
        self.current
    }

    pub(crate) fn set_current(&mut self, id: BufferId) {
        self.current = id;
    }

    #[inline]
    pub(crate) fn get(&self, id: BufferId) -> &Buffer {
        &self.buffers[id.0 as usize]
    }

    #[inline]
    pub(crate) fn get_mut(&mut self, id: BufferId) -> &mut Buffer {
        &mut self.buffers[id.0 as usize]
    }

    #[inline]
    pub(crate) fn cur(&self) -> &Buffer {
        self.get(self.current)
    }

    #[inline]
    pub(crate) fn current_mut(&mut self) -> &mut Buffer {
        let id = self.current;
        self.get_mut(id)
    }
}

impl<Tr: ExecTracer> Env<Tr> {
    // ---- position coercion ----------------------------------------------

    /// An integer or a marker, coerced to a character position.
    pub(crate) fn as_charpos(&mut self, v: Value) -> RunResult<i64> {
        match v {
            Value::Int(n) => Ok(n),
            Value::Ref(id) => {
                if let HeapData::Marker(Marker {
                    buffer: Some(_),
                    charpos,
                }) = self.heap.get(id)
                {
                    Ok(*charpos as i64)
                } else {
                    Err(self.wrong_type(Q::IntegerOrMarkerP, v))
                }
            }
            _ => Err(self.wrong_type(Q::IntegerOrMarkerP, v)),
        }
    }

    // ---- point and motion ------------------------------------------------

    pub fn point(&self) -> Value {
        Value::int(self.buffers.cur().point() as i64)
    }

    pub fn point_min(&self) -> Value {
        Value::int(self.buffers.cur().begv() as i64)
    }

    pub fn point_max(&self) -> Value {
        Value::int(self.buffers.cur().zv() as i64)
    }

    /// Moves point to `pos`, clamping into the accessible region. Returns
    /// the position argument.
    pub fn goto_char(&mut self, pos: Value) -> RunResult<Value> {
        let n = self.as_charpos(pos)?;
        let target = usize::try_from(n).unwrap_or(1);
        self.buffers.current_mut().set_point(target);
        Ok(pos)
    }

    /// Moves point by `n` characters, signalling `beginning-of-buffer` or
    /// `end-of-buffer` when the motion is cut short.
    pub fn forward_char(&mut self, n: Value) -> RunResult<Value> {
        let delta = if n.is_nil() { 1 } else { self.as_charpos(n)? };
        let buf = self.buffers.current_mut();
        let target = buf.point() as i64 + delta;
        if target < buf.begv() as i64 {
            buf.set_point(0);
            let err = Q::BeginningOfBuffer.sym();
            return Err(crate::error::RunError::Signal {
                symbol: err,
                data: Value::NIL,
            });
        }
        if target > buf.zv() as i64 {
            let zv = buf.zv();
            buf.set_point(zv);
            return Err(crate::error::RunError::Signal {
                symbol: Q::EndOfBuffer.sym(),
                data: Value::NIL,
            });
        }
        buf.set_point(target as usize);
        Ok(Value::NIL)
    }

    /// Moves over `n` words; returns `t` when the full count was covered.
    pub fn forward_word(&mut self, n: Value) -> RunResult<Value> {
        let count = if n.is_nil() { 1 } else { self.as_charpos(n)? };
        let buf = self.buffers.current_mut();
        let mut pt = buf.point();
        let mut complete = true;
        if count >= 0 {
            for _ in 0..count {
                while pt < buf.zv() && !is_word_char(buf.char_at(pt)) {
                    pt += 1;
                }
                if pt == buf.zv() {
                    complete = false;
                    break;
                }
                while pt < buf.zv() && is_word_char(buf.char_at(pt)) {
                    pt += 1;
                }
            }
        } else {
            for _ in 0..-count {
                while pt > buf.begv() && !is_word_char(buf.char_at(pt - 1)) {
                    pt -= 1;
                }
                if pt == buf.begv() {
                    complete = false;
                    break;
                }
                while pt > buf.begv() && is_word_char(buf.char_at(pt - 1)) {
                    pt -= 1;
                }
            }
        }
        buf.set_point(pt);
        Ok(Value::bool(complete))
    }

    /// Moves forward across characters in `spec` (a skip set like `"a-z"`,
    /// leading `^` negating). Returns the signed distance moved.
    pub fn skip_chars(&mut self, spec: Value, limit: Value, forward: bool) -> RunResult<Value> {
        let set = {
            let Value::Ref(id) = spec else {
                return Err(self.wrong_type(Q::Stringp, spec));
            };
            let HeapData::Str(s) = self.heap.get(id) else {
                return Err(self.wrong_type(Q::Stringp, spec));
            };
            SkipSet::parse(&s.chars())
        };
        let lim = if limit.is_nil() {
            None
        } else {
            Some(self.as_charpos(limit)?)
        };
        let buf = self.buffers.current_mut();
        let start = buf.point();
        let mut pt = start;
        if forward {
            let stop = lim.map_or(buf.zv(), |l| (l.max(1) as usize).min(buf.zv()));
            while pt < stop && set.contains(buf.char_at(pt)) {
                pt += 1;
            }
        } else {
            let stop = lim.map_or(buf.begv(), |l| (l.max(1) as usize).max(buf.begv()));
            while pt > stop && set.contains(buf.char_at(pt - 1)) {
                pt -= 1;
            }
        }
        buf.set_point(pt);
        Ok(Value::int(pt as i64 - start as i64))
    }

    /// Moves to the start of the line `n` lines forward; returns the count
    /// of lines the motion fell short by.
    pub fn forward_line(&mut self, n: Value) -> RunResult<Value> {
        let count = if n.is_nil() { 1 } else { self.as_charpos(n)? };
        let buf = self.buffers.current_mut();
        let mut pt = buf.point();
        let mut shortfall = 0;
        if count >= 0 {
            let mut remaining = count;
            while remaining > 0 {
                let end = buf.line_end(pt);
                if end == buf.zv() {
                    pt = end;
                    shortfall = remaining;
                    break;
                }
                pt = end + 1;
                remaining -= 1;
            }
        } else {
            let mut remaining = -count;
            pt = buf.line_start(pt);
            while remaining > 0 && pt > buf.begv() {
                pt = buf.line_start(pt - 1);
                remaining -= 1;
            }
            shortfall = -remaining;
        }
        if count == 0 {
            pt = buf.line_start(pt);
        }
        buf.set_point(pt);
        Ok(Value::int(shortfall))
    }

    /// Moves to the end of the line `n - 1` lines forward.
    pub fn end_of_line(&mut self, n: Value) -> RunResult<Value> {
        let count = if n.is_nil() { 1 } else { self.as_charpos(n)? };
        if count != 1 {
            self.forward_line(Value::int(count - 1))?;
        }
        let buf = self.buffers.current_mut();
        let end = buf.line_end(buf.point());
        buf.set_point(end);
        Ok(Value::NIL)
    }

    // ---- character queries -----------------------------------------------

    pub fn char_after(&mut self, pos: Value) -> RunResult<Value> {
        let n = if pos.is_nil() {
            self.buffers.cur().point() as i64
        } else {
            self.as_charpos(pos)?
        };
        let buf = self.buffers.cur();
        if n < buf.begv() as i64 || n >= buf.zv() as i64 {
            return Ok(Value::NIL);
        }
        Ok(Value::int(buf.char_at(n as usize) as i64))
    }

    /// The character at point, or 0 at the end of the accessible region.
    pub fn following_char(&self) -> Value {
        let buf = self.buffers.cur();
        if buf.point() >= buf.zv() {
            Value::int(0)
        } else {
            Value::int(buf.char_at(buf.point()) as i64)
        }
    }

    pub fn preceding_char(&self) -> Value {
        let buf = self.buffers.cur();
        if buf.point() <= buf.begv() {
            Value::int(0)
        } else {
            Value::int(buf.char_at(buf.point() - 1) as i64)
        }
    }

    pub fn bolp(&self) -> Value {
        let buf = self.buffers.cur();
        Value::bool(buf.point() == buf.begv() || buf.char_at(buf.point() - 1) == '\n')
    }

    pub fn eolp(&self) -> Value {
        let buf = self.buffers.cur();
        Value::bool(buf.point() == buf.zv() || buf.char_at(buf.point()) == '\n')
    }

    pub fn bobp(&self) -> Value {
        let buf = self.buffers.cur();
        Value::bool(buf.point() == buf.begv())
    }

    pub fn eobp(&self) -> Value {
        let buf = self.buffers.cur();
        Value::bool(buf.point() == buf.zv())
    }

    /// The syntax class of a character, as the class's designator char.
    pub fn char_syntax(&mut self, c: Value) -> RunResult<Value> {
        let Value::Int(n) = c else {
            return Err(self.wrong_type(Q::Characterp, c));
        };
        let Some(ch) = u32::try_from(n).ok().and_then(char::from_u32) else {
            return Err(self.wrong_type(Q::Characterp, c));
        };
        Ok(Value::int(i64::from(syntax_class(ch) as u32)))
    }

    // ---- columns ---------------------------------------------------------

    pub fn current_column(&self) -> Value {
        let buf = self.buffers.cur();
        Value::int(buf.column_at(buf.point()) as i64)
    }

    /// Indents with spaces to `col`, returning the resulting column.
    pub fn indent_to(&mut self, col: Value) -> RunResult<Value> {
        let Value::Int(target) = col else {
            return Err(self.wrong_type(Q::Integerp, col));
        };
        let buf = self.buffers.current_mut();
        let current = buf.column_at(buf.point());
        if (current as i64) < target {
            let spaces = vec![' '; (target - current as i64) as usize];
            buf.insert_chars(&spaces);
        }
        let buf = self.buffers.cur();
        Ok(Value::int(buf.column_at(buf.point()) as i64))
    }

    // ---- text modification -----------------------------------------------

    /// Inserts strings and characters at point.
    pub fn insert(&mut self, args: &[Value]) -> RunResult<Value> {
        for &arg in args {
            let chars: Vec<char> = match arg {
                Value::Int(n) => {
                    let Some(ch) = u32::try_from(n).ok().and_then(char::from_u32) else {
                        return Err(self.wrong_type(Q::CharOrStringP, arg));
                    };
                    vec![ch]
                }
                Value::Ref(id) => {
                    if let HeapData::Str(s) = self.heap.get(id) {
                        s.chars()
                    } else {
                        return Err(self.wrong_type(Q::CharOrStringP, arg));
                    }
                }
                _ => return Err(self.wrong_type(Q::CharOrStringP, arg)),
            };
            self.buffers.current_mut().insert_chars(&chars);
        }
        Ok(Value::NIL)
    }

    /// The accessible-region text between two positions, as a new string.
    pub fn buffer_substring(&mut self, beg: Value, end: Value) -> RunResult<Value> {
        let (beg, end) = self.validate_region(beg, end)?;
        let buf = self.buffers.cur();
        let text: String = (beg..end).map(|p| buf.char_at(p)).collect();
        Ok(self.make_string(&text))
    }

    pub fn delete_region(&mut self, beg: Value, end: Value) -> RunResult<Value> {
        let (beg, end) = self.validate_region(beg, end)?;
        self.buffers.current_mut().delete_range(beg, end);
        Ok(Value::NIL)
    }

    /// Checks a region against the accessible bounds, swapping if reversed.
    fn validate_region(&mut self, beg: Value, end: Value) -> RunResult<(usize, usize)> {
        let b = self.as_charpos(beg)?;
        let e = self.as_charpos(end)?;
        let (lo, hi) = if b <= e { (b, e) } else { (e, b) };
        let buf = self.buffers.cur();
        if lo < buf.begv() as i64 || hi > buf.zv() as i64 {
            return Err(self.args_out_of_range(&[beg, end]));
        }
        Ok((lo as usize, hi as usize))
    }

    // ---- narrowing -------------------------------------------------------

    pub fn narrow_to_region(&mut self, beg: Value, end: Value) -> RunResult<Value> {
        let b = self.as_charpos(beg)?;
        let e = self.as_charpos(end)?;
        let (lo, hi) = if b <= e { (b, e) } else { (e, b) };
        let buf = self.buffers.current_mut();
        if lo < 1 || hi > buf.z() as i64 {
            return Err(self.args_out_of_range(&[beg, end]));
        }
        buf.narrow(lo as usize, hi as usize);
        Ok(Value::NIL)
    }

    pub fn widen(&mut self) -> Value {
        self.buffers.current_mut().widen();
        Value::NIL
    }

    // ---- buffers ---------------------------------------------------------

    pub fn current_buffer(&self) -> Value {
        Value::Buf(self.buffers.current())
    }

    /// Makes a buffer current, accepting a buffer or a buffer name.
    pub fn set_buffer(&mut self, v: Value) -> RunResult<Value> {
        match v {
            Value::Buf(id) => {
                self.buffers.set_current(id);
                Ok(v)
            }
            Value::Ref(id) => {
                let name = if let HeapData::Str(s) = self.heap.get(id) {
                    s.to_cow().into_owned()
                } else {
                    return Err(self.wrong_type(Q::Bufferp, v));
                };
                match self.buffers.lookup(&name) {
                    Some(buf) => {
                        self.buffers.set_current(buf);
                        Ok(Value::Buf(buf))
                    }
                    None => Err(self.error_msg(format!("No buffer named {name}"))),
                }
            }
            _ => Err(self.wrong_type(Q::Bufferp, v)),
        }
    }

    /// Finds or creates a named buffer.
    pub fn get_buffer_create(&mut self, name: &str) -> Value {
        Value::Buf(self.buffers.get_or_create(name))
    }

    // ---- markers ---------------------------------------------------------

    /// Repositions a marker; a nil position unsets it.
    pub fn set_marker(&mut self, marker: Value, pos: Value, buffer: Value) -> RunResult<Value> {
        let Value::Ref(id) = marker else {
            return Err(self.wrong_type(Q::Markerp, marker));
        };
        if !matches!(self.heap.get(id), HeapData::Marker(_)) {
            return Err(self.wrong_type(Q::Markerp, marker));
        }
        let new = if pos.is_nil() {
            Marker { buffer: None, charpos: 1 }
        } else {
            let charpos = self.as_charpos(pos)?;
            let target = match buffer {
                Value::Buf(b) => b,
                v if v.is_nil() => self.buffers.current(),
                other => return Err(self.wrong_type(Q::Bufferp, other)),
            };
            let buf = self.buffers.get(target);
            let clamped = charpos.clamp(buf.begv() as i64, buf.zv() as i64) as usize;
            Marker {
                buffer: Some(target),
                charpos: clamped,
            }
        };
        let HeapData::Marker(m) = self.heap.get_mut(id) else {
            unreachable!("checked above");
        };
        *m = new;
        Ok(marker)
    }

    // ---- match data ------------------------------------------------------

    /// Installs match data as flat begin/end position pairs.
    pub fn set_match_data(&mut self, registers: &[Option<usize>]) {
        self.match_data = registers.to_vec();
    }

    pub fn match_beginning(&mut self, n: Value) -> RunResult<Value> {
        self.match_register(n, 0)
    }

    pub fn match_end(&mut self, n: Value) -> RunResult<Value> {
        self.match_register(n, 1)
    }

    fn match_register(&mut self, n: Value, offset: usize) -> RunResult<Value> {
        let Value::Int(idx) = n else {
            return Err(self.wrong_type(Q::Integerp, n));
        };
        let Ok(idx) = usize::try_from(idx) else {
            return Err(self.args_out_of_range(&[n]));
        };
        let flat = idx * 2 + offset;
        if flat >= self.match_data.len() {
            return Err(self.args_out_of_range(&[n]));
        }
        Ok(self.match_data[flat].map_or(Value::NIL, |p| Value::int(p as i64)))
    }

    // ---- save-* unwind records -------------------------------------------

    /// Records an excursion (current buffer + point) on the binding stack.
    pub(crate) fn record_save_excursion(&mut self) {
        let buffer = self.buffers.current();
        let point = self.buffers.cur().point();
        self.record_unwind(UnwindAction::Excursion { buffer, point });
    }

    pub(crate) fn record_save_restriction(&mut self) {
        let buffer = self.buffers.current();
        let buf = self.buffers.cur();
        self.record_unwind(UnwindAction::Restriction {
            buffer,
            begv: buf.begv(),
            zv: buf.zv(),
        });
    }

    pub(crate) fn record_save_current_buffer(&mut self) {
        let buffer = self.buffers.current();
        self.record_unwind(UnwindAction::CurrentBuffer(buffer));
    }

    /// The legacy with-output-to-temp-buffer setup: (re)creates the named
    /// buffer, binds `standard-output` to it, and returns it.
    pub(crate) fn temp_output_buffer_setup(&mut self, name: Value) -> RunResult<Value> {
        let Value::Ref(id) = name else {
            return Err(self.wrong_type(Q::Stringp, name));
        };
        let HeapData::Str(s) = self.heap.get(id) else {
            return Err(self.wrong_type(Q::Stringp, name));
        };
        let name = s.to_cow().into_owned();
        let buf = self.buffers.get_or_create(&name);
        self.buffers.get_mut(buf).erase();
        self.specbind(Q::StandardOutput.id(), Value::Buf(buf))?;
        Ok(Value::Buf(buf))
    }
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric()
}

/// Syntax classes, reduced to the designator characters the `char-syntax`
/// opcode reports.
fn syntax_class(c: char) -> char {
    match c {
        c if c.is_alphanumeric() => 'w',
        ' ' | '\t' | '\n' | '\r' | '\x0c' => ' ',
        '(' | '[' | '{' => '(',
        ')' | ']' | '}' => ')',
        '"' => '"',
        '\\' => '\\',
        _ => '.',
    }
}

/// A parsed skip-chars spec: ranges, singletons, optional negation.
struct SkipSet {
    negated: bool,
    ranges: Vec<(char, char)>,
}

impl SkipSet {
    fn parse(spec: &[char]) -> Self {
        let mut i = 0;
        let negated = spec.first() == Some(&'^');
        if negated {
            i = 1;
        }
        let mut ranges = Vec::new();
        while i < spec.len() {
            let mut c = spec[i];
            if c == '\\' && i + 1 < spec.len() {
                i += 1;
                c = spec[i];
            }
            if i + 2 < spec.len() && spec[i + 1] == '-' {
                ranges.push((c, spec[i + 2]));
                i += 3;
            } else {
                ranges.push((c, c));
                i += 1;
            }
        }
        Self { negated, ranges }
    }

    fn contains(&self, c: char) -> bool {
        let hit = self.ranges.iter().any(|&(lo, hi)| c >= lo && c <= hi);
        hit != self.negated
    }
}
