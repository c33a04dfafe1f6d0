//! List, sequence, string, and property-list primitives.
//!
//! These are the named host primitives the dispatch loop marshals operands
//! into. Operand order and edge-case behavior follow the source system's
//! primitives; list walks are guarded against circular structure.

use crate::{
    env::Env,
    error::RunResult,
    heap::HeapData,
    intern::Q,
    tracer::ExecTracer,
    value::Value,
};

/// Bound on list walks; a longer walk is assumed circular.
const MAX_LIST_WALK: usize = 1 << 22;

/// Recursion bound for `equal`, as in the source system.
const EQUAL_DEPTH_LIMIT: usize = 200;

impl<Tr: ExecTracer> Env<Tr> {
    // ---- conses ----------------------------------------------------------

    /// `car`: nil gives nil; a non-list fails with `listp`.
    pub fn car(&mut self, v: Value) -> RunResult<Value> {
        match v {
            Value::Ref(id) => match self.heap.get(id) {
                HeapData::Cons(c) => Ok(c.car),
                _ => Err(self.wrong_type(Q::Listp, v)),
            },
            v if v.is_nil() => Ok(Value::NIL),
            _ => Err(self.wrong_type(Q::Listp, v)),
        }
    }

    pub fn cdr(&mut self, v: Value) -> RunResult<Value> {
        match v {
            Value::Ref(id) => match self.heap.get(id) {
                HeapData::Cons(c) => Ok(c.cdr),
                _ => Err(self.wrong_type(Q::Listp, v)),
            },
            v if v.is_nil() => Ok(Value::NIL),
            _ => Err(self.wrong_type(Q::Listp, v)),
        }
    }

    pub fn car_safe(&self, v: Value) -> Value {
        match v {
            Value::Ref(id) => match self.heap.get(id) {
                HeapData::Cons(c) => c.car,
                _ => Value::NIL,
            },
            _ => Value::NIL,
        }
    }

    pub fn cdr_safe(&self, v: Value) -> Value {
        match v {
            Value::Ref(id) => match self.heap.get(id) {
                HeapData::Cons(c) => c.cdr,
                _ => Value::NIL,
            },
            _ => Value::NIL,
        }
    }

    pub fn setcar(&mut self, cell: Value, v: Value) -> RunResult<Value> {
        match cell {
            Value::Ref(id) if matches!(self.heap.get(id), HeapData::Cons(_)) => {
                self.heap.cons_mut(id).car = v;
                Ok(v)
            }
            _ => Err(self.wrong_type(Q::Consp, cell)),
        }
    }

    pub fn setcdr(&mut self, cell: Value, v: Value) -> RunResult<Value> {
        match cell {
            Value::Ref(id) if matches!(self.heap.get(id), HeapData::Cons(_)) => {
                self.heap.cons_mut(id).cdr = v;
                Ok(v)
            }
            _ => Err(self.wrong_type(Q::Consp, cell)),
        }
    }

    // ---- list traversal --------------------------------------------------

    /// `nth`: walks off the end to nil, like the inline opcode loop.
    pub fn nth(&mut self, n: Value, list: Value) -> RunResult<Value> {
        let tail = self.nthcdr(n, list)?;
        self.car(tail)
    }

    pub fn nthcdr(&mut self, n: Value, list: Value) -> RunResult<Value> {
        let Value::Int(count) = n else {
            return Err(self.wrong_type(Q::Integerp, n));
        };
        let mut tail = list;
        for _ in 0..count.max(0) {
            if !tail.is_cons(&self.heap) {
                break;
            }
            tail = self.cdr(tail)?;
        }
        Ok(tail)
    }

    /// `memq`: identity membership; returns the found tail or nil.
    pub fn memq(&mut self, elt: Value, list: Value) -> RunResult<Value> {
        let mut tail = list;
        let mut steps = 0;
        while tail.is_cons(&self.heap) {
            if self.car(tail)? == elt {
                return Ok(tail);
            }
            tail = self.cdr(tail)?;
            steps += 1;
            if steps > MAX_LIST_WALK {
                return Err(self.error_msg("List contains a loop"));
            }
        }
        if tail.is_nil() {
            Ok(Value::NIL)
        } else {
            Err(self.wrong_type(Q::Listp, list))
        }
    }

    /// `member`: like `memq` with structural equality.
    pub fn member(&mut self, elt: Value, list: Value) -> RunResult<Value> {
        let mut tail = list;
        let mut steps = 0;
        while tail.is_cons(&self.heap) {
            let car = self.car(tail)?;
            if self.equal(elt, car)? {
                return Ok(tail);
            }
            tail = self.cdr(tail)?;
            steps += 1;
            if steps > MAX_LIST_WALK {
                return Err(self.error_msg("List contains a loop"));
            }
        }
        if tail.is_nil() {
            Ok(Value::NIL)
        } else {
            Err(self.wrong_type(Q::Listp, list))
        }
    }

    /// `assq`: association lookup by identity; non-cons elements are
    /// skipped.
    pub fn assq(&mut self, key: Value, alist: Value) -> RunResult<Value> {
        let mut tail = alist;
        let mut steps = 0;
        while tail.is_cons(&self.heap) {
            let entry = self.car(tail)?;
            if entry.is_cons(&self.heap) && self.car(entry)? == key {
                return Ok(entry);
            }
            tail = self.cdr(tail)?;
            steps += 1;
            if steps > MAX_LIST_WALK {
                return Err(self.error_msg("List contains a loop"));
            }
        }
        Ok(Value::NIL)
    }

    /// In-place list reversal by cdr rewriting.
    pub fn nreverse(&mut self, list: Value) -> RunResult<Value> {
        let mut prev = Value::NIL;
        let mut tail = list;
        let mut steps = 0;
        while !tail.is_nil() {
            let Value::Ref(id) = tail else {
                return Err(self.wrong_type(Q::Listp, tail));
            };
            if !matches!(self.heap.get(id), HeapData::Cons(_)) {
                return Err(self.wrong_type(Q::Listp, tail));
            }
            let next = self.heap.cons(id).cdr;
            self.heap.cons_mut(id).cdr = prev;
            prev = tail;
            tail = next;
            steps += 1;
            if steps > MAX_LIST_WALK {
                return Err(self.error_msg("List contains a loop"));
            }
        }
        Ok(prev)
    }

    /// Destructive two-list concatenation.
    pub fn nconc2(&mut self, a: Value, b: Value) -> RunResult<Value> {
        if a.is_nil() {
            return Ok(b);
        }
        let mut tail = a;
        let mut steps = 0;
        loop {
            let next = self.cdr(tail)?;
            if !next.is_cons(&self.heap) {
                if !next.is_nil() {
                    return Err(self.wrong_type(Q::Listp, next));
                }
                self.setcdr(tail, b)?;
                return Ok(a);
            }
            tail = next;
            steps += 1;
            if steps > MAX_LIST_WALK {
                return Err(self.error_msg("List contains a loop"));
            }
        }
    }

    // ---- sequences -------------------------------------------------------

    pub fn length(&mut self, v: Value) -> RunResult<Value> {
        match v {
            v if v.is_nil() => Ok(Value::int(0)),
            Value::Ref(id) => match self.heap.get(id) {
                HeapData::Str(s) => Ok(Value::int(s.char_len() as i64)),
                HeapData::Vector(items) => Ok(Value::int(items.len() as i64)),
                HeapData::Cons(_) => {
                    let mut count: i64 = 0;
                    let mut tail = v;
                    while tail.is_cons(&self.heap) {
                        count += 1;
                        tail = self.cdr(tail)?;
                        if count as usize > MAX_LIST_WALK {
                            return Err(self.error_msg("List contains a loop"));
                        }
                    }
                    if tail.is_nil() {
                        Ok(Value::int(count))
                    } else {
                        Err(self.wrong_type(Q::Listp, v))
                    }
                }
                _ => Err(self.wrong_type(Q::Sequencep, v)),
            },
            _ => Err(self.wrong_type(Q::Sequencep, v)),
        }
    }

    /// `elt`: list indexing via `nth`, array indexing via `aref`.
    pub fn elt(&mut self, seq: Value, n: Value) -> RunResult<Value> {
        if seq.is_list(&self.heap) {
            self.nth(n, seq)
        } else {
            self.aref(seq, n)
        }
    }

    pub fn aref(&mut self, array: Value, idx: Value) -> RunResult<Value> {
        let Value::Int(i) = idx else {
            return Err(self.wrong_type(Q::Integerp, idx));
        };
        let Value::Ref(id) = array else {
            return Err(self.wrong_type(Q::Arrayp, array));
        };
        match self.heap.get(id) {
            HeapData::Vector(items) => match usize::try_from(i).ok().and_then(|i| items.get(i)) {
                Some(v) => Ok(*v),
                None => Err(self.args_out_of_range(&[array, idx])),
            },
            HeapData::Str(s) => match usize::try_from(i).ok().and_then(|i| s.chars().get(i).copied()) {
                Some(c) => Ok(Value::int(c as i64)),
                None => Err(self.args_out_of_range(&[array, idx])),
            },
            _ => Err(self.wrong_type(Q::Arrayp, array)),
        }
    }

    pub fn aset(&mut self, array: Value, idx: Value, v: Value) -> RunResult<Value> {
        let Value::Int(i) = idx else {
            return Err(self.wrong_type(Q::Integerp, idx));
        };
        let Value::Ref(id) = array else {
            return Err(self.wrong_type(Q::Arrayp, array));
        };
        match self.heap.get_mut(id) {
            HeapData::Vector(items) => {
                let slot = usize::try_from(i).ok().and_then(|i| items.get_mut(i));
                match slot {
                    Some(slot) => {
                        *slot = v;
                        Ok(v)
                    }
                    None => Err(self.args_out_of_range(&[array, idx])),
                }
            }
            HeapData::Str(_) => {
                let Value::Int(ch) = v else {
                    return Err(self.wrong_type(Q::Characterp, v));
                };
                let Some(ch) = u32::try_from(ch).ok().and_then(char::from_u32) else {
                    return Err(self.wrong_type(Q::Characterp, v));
                };
                self.string_aset(id, i, ch)?;
                Ok(v)
            }
            _ => Err(self.wrong_type(Q::Arrayp, array)),
        }
    }

    /// Replaces one character of a string, rebuilding its byte storage.
    /// A running frame may be executing out of this string, so the frame
    /// relocation hook runs afterwards.
    fn string_aset(&mut self, id: crate::heap::HeapId, i: i64, ch: char) -> RunResult<()> {
        let (mut chars, multibyte) = {
            let s = self.heap.str_data(id);
            (s.chars(), s.multibyte)
        };
        let Some(slot) = usize::try_from(i).ok().and_then(|i| chars.get_mut(i)) else {
            let array = Value::Ref(id);
            return Err(self.args_out_of_range(&[array, Value::Int(i)]));
        };
        *slot = ch;
        let bytes: Box<[u8]> = if multibyte {
            chars.iter().collect::<String>().into_bytes().into()
        } else if let Ok(b) = chars
            .iter()
            .map(|&c| u8::try_from(c as u32))
            .collect::<Result<Box<[u8]>, _>>()
        {
            b
        } else {
            return Err(self.wrong_type(Q::Characterp, Value::Int(ch as i64)));
        };
        if let HeapData::Str(s) = self.heap.get_mut(id) {
            s.bytes = bytes;
        }
        self.relocate_frames();
        Ok(())
    }

    // ---- equality --------------------------------------------------------

    /// Structural equality, recursion-limited like the source system.
    pub fn equal(&mut self, a: Value, b: Value) -> RunResult<bool> {
        self.equal_rec(a, b, 0)
    }

    fn equal_rec(&mut self, a: Value, b: Value, depth: usize) -> RunResult<bool> {
        if depth > EQUAL_DEPTH_LIMIT {
            return Err(self.error_msg("Stack overflow in equal"));
        }
        if a == b {
            return Ok(true);
        }
        let (Value::Ref(ia), Value::Ref(ib)) = (a, b) else {
            return Ok(false);
        };
        match (self.heap.get(ia), self.heap.get(ib)) {
            (HeapData::Cons(ca), HeapData::Cons(cb)) => {
                let (ca, cb) = (*ca, *cb);
                Ok(self.equal_rec(ca.car, cb.car, depth + 1)?
                    && self.equal_rec(ca.cdr, cb.cdr, depth + 1)?)
            }
            (HeapData::Str(sa), HeapData::Str(sb)) => Ok(sa.chars() == sb.chars()),
            (HeapData::Vector(va), HeapData::Vector(vb)) => {
                if va.len() != vb.len() {
                    return Ok(false);
                }
                let pairs: Vec<(Value, Value)> =
                    va.iter().copied().zip(vb.iter().copied()).collect();
                for (x, y) in pairs {
                    if !self.equal_rec(x, y, depth + 1)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            (HeapData::Marker(ma), HeapData::Marker(mb)) => {
                Ok(ma.buffer == mb.buffer && (ma.buffer.is_none() || ma.charpos == mb.charpos))
            }
            _ => Ok(false),
        }
    }

    // ---- strings ---------------------------------------------------------

    /// Concatenates sequences of characters into a new string.
    pub fn concat(&mut self, args: &[Value]) -> RunResult<Value> {
        let mut out = String::new();
        for &arg in args {
            match arg {
                v if v.is_nil() => {}
                Value::Ref(id) => match self.heap.get(id) {
                    HeapData::Str(s) => out.extend(s.chars()),
                    HeapData::Vector(items) => {
                        let items = items.clone();
                        for item in items {
                            out.push(self.as_character(item)?);
                        }
                    }
                    HeapData::Cons(_) => {
                        let mut tail = arg;
                        while tail.is_cons(&self.heap) {
                            let c = self.car(tail)?;
                            out.push(self.as_character(c)?);
                            tail = self.cdr(tail)?;
                        }
                    }
                    _ => return Err(self.wrong_type(Q::Sequencep, arg)),
                },
                _ => return Err(self.wrong_type(Q::Sequencep, arg)),
            }
        }
        Ok(self.make_string(&out))
    }

    fn as_character(&mut self, v: Value) -> RunResult<char> {
        match v {
            Value::Int(n) => u32::try_from(n)
                .ok()
                .and_then(char::from_u32)
                .ok_or_else(|| self.wrong_type(Q::Characterp, v)),
            _ => Err(self.wrong_type(Q::Characterp, v)),
        }
    }

    /// `substring` over strings and vectors; negative indices count from
    /// the end, nil bounds mean the ends themselves.
    pub fn substring(&mut self, seq: Value, from: Value, to: Value) -> RunResult<Value> {
        let Value::Ref(id) = seq else {
            return Err(self.wrong_type(Q::Arrayp, seq));
        };
        let len = match self.heap.get(id) {
            HeapData::Str(s) => s.char_len(),
            HeapData::Vector(items) => items.len(),
            _ => return Err(self.wrong_type(Q::Arrayp, seq)),
        };
        let resolve = |v: Value, default: usize| -> Option<usize> {
            match v {
                v if v.is_nil() => Some(default),
                Value::Int(n) if n < 0 => usize::try_from(n + len as i64).ok(),
                Value::Int(n) => usize::try_from(n).ok(),
                _ => None,
            }
        };
        let (Some(start), Some(end)) = (resolve(from, 0), resolve(to, len)) else {
            return Err(self.args_out_of_range(&[seq, from, to]));
        };
        if start > end || end > len {
            return Err(self.args_out_of_range(&[seq, from, to]));
        }
        match self.heap.get(id) {
            HeapData::Str(s) => {
                let text: String = s.chars()[start..end].iter().collect();
                Ok(self.make_string(&text))
            }
            HeapData::Vector(items) => {
                let slice = items[start..end].to_vec();
                Ok(self.make_vector(&slice))
            }
            _ => unreachable!("checked above"),
        }
    }

    /// `string=` on strings and symbol names.
    pub fn string_equal(&mut self, a: Value, b: Value) -> RunResult<Value> {
        let sa = self.as_string_chars(a)?;
        let sb = self.as_string_chars(b)?;
        Ok(Value::bool(sa == sb))
    }

    /// `string<`: lexicographic by character.
    pub fn string_lessp(&mut self, a: Value, b: Value) -> RunResult<Value> {
        let sa = self.as_string_chars(a)?;
        let sb = self.as_string_chars(b)?;
        Ok(Value::bool(sa < sb))
    }

    fn as_string_chars(&mut self, v: Value) -> RunResult<Vec<char>> {
        match v {
            Value::Sym(id) => Ok(self.symbols.name(id).chars().collect()),
            Value::Ref(id) => match self.heap.get(id) {
                HeapData::Str(s) => Ok(s.chars()),
                _ => Err(self.wrong_type(Q::Stringp, v)),
            },
            _ => Err(self.wrong_type(Q::Stringp, v)),
        }
    }

    /// `upcase` on a character or a string.
    pub fn upcase(&mut self, v: Value) -> RunResult<Value> {
        self.case_convert(v, true)
    }

    pub fn downcase(&mut self, v: Value) -> RunResult<Value> {
        self.case_convert(v, false)
    }

    fn case_convert(&mut self, v: Value, up: bool) -> RunResult<Value> {
        match v {
            Value::Int(_) => {
                let c = self.as_character(v)?;
                let converted = if up {
                    c.to_uppercase().next().unwrap_or(c)
                } else {
                    c.to_lowercase().next().unwrap_or(c)
                };
                Ok(Value::int(converted as i64))
            }
            Value::Ref(id) if matches!(self.heap.get(id), HeapData::Str(_)) => {
                let text = self.heap.str_data(id).to_cow().into_owned();
                let converted = if up { text.to_uppercase() } else { text.to_lowercase() };
                Ok(self.make_string(&converted))
            }
            _ => Err(self.wrong_type(Q::CharOrStringP, v)),
        }
    }

    // ---- symbols and plists ----------------------------------------------

    /// The function cell of a symbol; nil when unset.
    pub fn symbol_function(&mut self, v: Value) -> RunResult<Value> {
        match v {
            Value::Sym(id) => Ok(self.symbols.get(id).function),
            _ => Err(self.wrong_type(Q::Symbolp, v)),
        }
    }

    /// Stores a symbol's function cell; nil and t refuse.
    pub fn fset(&mut self, symbol: Value, definition: Value) -> RunResult<Value> {
        let Value::Sym(id) = symbol else {
            return Err(self.wrong_type(Q::Symbolp, symbol));
        };
        if self.symbols.get(id).constant {
            return Err(self.setting_constant(id));
        }
        self.symbols.get_mut(id).function = definition;
        Ok(definition)
    }

    /// `get`: a property from a symbol's plist, nil when absent.
    pub fn get_property(&self, symbol: Value, prop: Value) -> Value {
        let Value::Sym(id) = symbol else {
            return Value::NIL;
        };
        let mut tail = self.symbols.get(id).plist;
        while tail.is_cons(&self.heap) {
            let key = self.car_safe(tail);
            let rest = self.cdr_safe(tail);
            if key == prop {
                return self.car_safe(rest);
            }
            tail = self.cdr_safe(rest);
        }
        Value::NIL
    }

    /// `put`: stores a property, updating in place when present.
    pub fn put_property(&mut self, symbol: crate::intern::SymbolId, prop: Value, value: Value) {
        let mut tail = self.symbols.get(symbol).plist;
        while tail.is_cons(&self.heap) {
            let key = self.car_safe(tail);
            let rest = self.cdr_safe(tail);
            if key == prop {
                let _ = self.setcar(rest, value);
                return;
            }
            tail = self.cdr_safe(rest);
        }
        let plist = self.symbols.get(symbol).plist;
        let rest = self.cons(value, plist);
        let plist = self.cons(prop, rest);
        self.symbols.get_mut(symbol).plist = plist;
    }
}
