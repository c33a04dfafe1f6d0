//! The dispatch loop, frames, and the entry façade.
//!
//! Execution keeps per-frame state (code pointers, operand stack, recorded
//! binding depth) in [`Frame`]; the loop itself works on a [`Cursor`] copy
//! of the program counter and syncs it back into the frame around any step
//! that can collect or run user code, so the relocation hook always
//! observes the program counter between two instructions.
//!
//! Non-local exits arrive as `Err` values from primitives; the loop's error
//! path searches this frame's handlers and either resumes at a saved
//! destination with the landing value pushed, or lets the exit continue to
//! the caller. The façade releases the frame, its handlers, and its
//! bindings on every exit path.

use smallvec::SmallVec;

use crate::{
    binding::UnwindAction,
    bytecode::{
        code::ArgSpec,
        op::{CONSTANT_BASE, Opcode},
    },
    env::Env,
    error::{RunError, RunResult},
    heap::{HeapData, HeapId},
    intern::{Q, SymbolCell},
    tracer::ExecTracer,
    value::Value,
};

/// One live invocation: code pointers, operand stack, and unwind bookkeeping.
///
/// `start`/`pc` are raw pointers into the heap-owned byte string; the frame
/// also holds the byte-string value itself, which keeps those bytes alive
/// against collection for as long as the frame is linked in. A null `start`
/// marks a native-resident frame, which the relocation hook skips.
pub(crate) struct Frame {
    /// The byte-string value (roots the code bytes).
    code: Value,
    bytes: HeapId,
    pub(crate) constants: HeapId,
    start: *const u8,
    pub(crate) pc: *const u8,
    len: usize,
    pub(crate) stack: Vec<Value>,
    /// One past the greatest legal stack depth (`max_depth + 1` slots).
    limit: usize,
    /// Binding-stack depth on entry; restored on every exit.
    pub(crate) entry_depth: usize,
    /// Amortizes the quit gate: only a wrapped-to-zero counter polls fully.
    quitcounter: u8,
}

impl Frame {
    pub(crate) fn cursor(&self) -> Cursor {
        // SAFETY: start/len describe the frame's live byte string, and pc
        // lies within it; the relocation hook rebases all three together.
        let end = unsafe { self.start.add(self.len) };
        Cursor {
            start: self.start,
            pc: self.pc,
            end,
        }
    }

    pub(crate) fn gc_roots(&self, roots: &mut Vec<Value>) {
        roots.push(self.code);
        roots.push(Value::Ref(self.constants));
        roots.extend(self.stack.iter().copied());
    }
}

/// A loop-local copy of the frame's program counter.
#[derive(Clone, Copy)]
pub(crate) struct Cursor {
    start: *const u8,
    pc: *const u8,
    end: *const u8,
}

impl Cursor {
    #[inline]
    pub(crate) fn pc_ptr(self) -> *const u8 {
        self.pc
    }

    /// Byte offset of the program counter within the code string.
    #[inline]
    pub(crate) fn offset(self) -> usize {
        self.pc as usize - self.start as usize
    }

    #[inline]
    fn len(self) -> usize {
        self.end as usize - self.start as usize
    }

    /// Fetches the next byte; `None` when the stream is exhausted.
    #[inline]
    fn fetch(&mut self) -> Option<u8> {
        if self.pc == self.end {
            return None;
        }
        // SAFETY: pc < end, so it addresses a live byte of the code string.
        let byte = unsafe { *self.pc };
        // SAFETY: advancing within the same allocation (at most one past).
        self.pc = unsafe { self.pc.add(1) };
        Some(byte)
    }

    /// Fetches a little-endian 16-bit operand.
    #[inline]
    fn fetch2(&mut self) -> Option<u16> {
        let lo = self.fetch()?;
        let hi = self.fetch()?;
        Some(u16::from_le_bytes([lo, hi]))
    }

    /// Absolute jump; false when the destination is outside the code.
    #[inline]
    fn jump_to(&mut self, dest: usize) -> bool {
        if dest >= self.len() {
            return false;
        }
        // SAFETY: dest < len, so the target is inside the code string.
        self.pc = unsafe { self.start.add(dest) };
        true
    }

    /// Relative jump from the current position.
    #[inline]
    fn jump_rel(&mut self, delta: i32) -> bool {
        let target = self.offset() as i64 + i64::from(delta);
        match usize::try_from(target) {
            Ok(t) if t < self.len() => {
                // SAFETY: 0 <= target < len, checked above.
                self.pc = unsafe { self.start.add(t) };
                true
            }
            _ => false,
        }
    }
}

/// What a handler frame catches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HandlerKind {
    /// A catch frame: tags match by identity.
    Catcher,
    /// A condition-case frame: clauses match error conditions.
    ConditionCase,
}

/// One handler-stack entry: enough saved interpreter state to re-enter the
/// loop at the saved destination with the landing value pushed.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Handler {
    pub kind: HandlerKind,
    pub tag: Value,
    /// Index of the owning frame in the active frame list.
    pub frame: usize,
    /// Saved operand-stack top.
    pub stack_top: usize,
    /// Saved destination offset within the byte string.
    pub dest: usize,
    /// Binding-stack depth to unwind to before resuming.
    pub binding_depth: usize,
}

/// Runs a fallible step; a raised exit is first offered to this frame's
/// handlers, resuming at the matched handler's destination, and otherwise
/// propagates to the caller (the façade unwinds on the way out).
macro_rules! recover {
    ($self:expr, $fi:expr, $cursor:ident, $e:expr) => {
        match $e {
            Ok(v) => v,
            Err(err) => {
                $cursor = $self.on_error($fi, err)?;
                continue;
            }
        }
    };
}

/// `recover!` for steps that may collect or run user code: syncs the pc
/// into the frame first and reloads it after, since the collector may have
/// rebased the code pointers in between.
macro_rules! recover_gc {
    ($self:expr, $fi:expr, $cursor:ident, $e:expr) => {{
        $self.frames[$fi].pc = $cursor.pc_ptr();
        match $e {
            Ok(v) => {
                $cursor = $self.frames[$fi].cursor();
                v
            }
            Err(err) => {
                $cursor = $self.on_error($fi, err)?;
                continue;
            }
        }
    }};
}

/// Fetches one operand byte, failing the instruction on overrun.
macro_rules! fetch1 {
    ($self:expr, $fi:expr, $cursor:ident) => {
        match $cursor.fetch() {
            Some(byte) => byte,
            None => {
                let err = $self.error_msg("Byte-code string overrun");
                $cursor = $self.on_error($fi, err)?;
                continue;
            }
        }
    };
}

/// Fetches a two-byte little-endian operand.
macro_rules! fetch2 {
    ($self:expr, $fi:expr, $cursor:ident) => {
        match $cursor.fetch2() {
            Some(word) => word,
            None => {
                let err = $self.error_msg("Byte-code string overrun");
                $cursor = $self.on_error($fi, err)?;
                continue;
            }
        }
    };
}

/// Absolute jump with the range check the checking build of the original
/// performs.
macro_rules! jump_abs {
    ($self:expr, $fi:expr, $cursor:ident, $dest:expr) => {
        if !$cursor.jump_to($dest) {
            let err = $self.error_msg("Byte-code jump out of range");
            $cursor = $self.on_error($fi, err)?;
            continue;
        }
    };
}

/// Relative jump with the same range policy.
macro_rules! jump_rel {
    ($self:expr, $fi:expr, $cursor:ident, $delta:expr) => {
        if !$cursor.jump_rel($delta) {
            let err = $self.error_msg("Byte-code jump out of range");
            $cursor = $self.on_error($fi, err)?;
            continue;
        }
    };
}

impl<Tr: ExecTracer> Env<Tr> {
    // ---- the entry façade ------------------------------------------------

    /// Executes a compiled code object with the given argument template and
    /// actuals, routing to a registered native translation when the object
    /// carries one.
    pub fn execute(&mut self, code: Value, args_template: Value, args: &[Value]) -> RunResult<Value> {
        let Value::Ref(id) = code else {
            return Err(self.wrong_type(Q::ByteCodeFunctionP, code));
        };
        let (bytes, constants, max_depth, native) = match self.heap.get(id) {
            HeapData::Code(c) => (c.bytes, c.constants, c.max_depth, c.native),
            _ => return Err(self.wrong_type(Q::ByteCodeFunctionP, code)),
        };
        if let Some(native) = native {
            let f = self.natives[native.index()];
            return f(self, args);
        }
        self.exec_byte_code(
            Value::Ref(bytes),
            Value::Ref(constants),
            Value::Int(max_depth as i64),
            args_template,
            args,
        )
    }

    /// The legacy three-argument entry point: a byte string, a constant
    /// vector, and a maximum stack depth, with no arguments to bind.
    pub fn byte_code(&mut self, bytes: Value, constants: Value, max_depth: Value) -> RunResult<Value> {
        self.exec_byte_code(bytes, constants, max_depth, Value::NIL, &[])
    }

    /// Validates the parts, installs a frame, binds arguments, and runs the
    /// dispatch loop. The frame, its handlers, and its bindings are
    /// released on every exit path.
    pub fn exec_byte_code(
        &mut self,
        bytestr: Value,
        constants: Value,
        max_depth: Value,
        args_template: Value,
        args: &[Value],
    ) -> RunResult<Value> {
        let bytes_id = self.check_byte_string(bytestr)?;
        let const_id = self.check_vector(constants)?;
        let depth = self.check_natnum(max_depth)?;

        let fi = self.push_frame(bytes_id, const_id, depth);
        let handler_floor = self.handlers.len();
        let entry_depth = self.frames[fi].entry_depth;
        let result = self
            .bind_args(fi, args_template, args)
            .and_then(|()| self.dispatch(fi));
        self.finish_frame(fi, handler_floor, entry_depth, result)
    }

    fn push_frame(&mut self, bytes: HeapId, constants: HeapId, max_depth: usize) -> usize {
        let (start, len) = {
            let s = self.heap.str_data(bytes);
            (s.bytes.as_ptr(), s.bytes.len())
        };
        let limit = max_depth + 1;
        self.frames.push(Frame {
            code: Value::Ref(bytes),
            bytes,
            constants,
            start,
            pc: start,
            len,
            stack: Vec::with_capacity(limit),
            limit,
            entry_depth: self.specpdl.len(),
            quitcounter: 0,
        });
        self.frames.len() - 1
    }

    /// The frame postlude, run on success and on non-local exit alike:
    /// drops this frame's handlers, rebalances the binding stack (running
    /// unwind actions), checks the balance invariant, and unlinks the frame.
    fn finish_frame(
        &mut self,
        fi: usize,
        handler_floor: usize,
        entry_depth: usize,
        result: RunResult<Value>,
    ) -> RunResult<Value> {
        self.handlers.truncate(handler_floor);
        let result = match result {
            Ok(value) => {
                if self.specpdl.len() == entry_depth {
                    Ok(value)
                } else {
                    if self.specpdl.len() > entry_depth {
                        let unwound = self.unwind_to(entry_depth);
                        if let Err(e) = unwound {
                            self.frames.pop();
                            return Err(e);
                        }
                    }
                    Err(self.error_msg("binding stack not balanced (serious byte compiler bug)"))
                }
            }
            Err(err) => {
                if self.specpdl.len() > entry_depth {
                    for v in err.payload() {
                        self.protect(v);
                    }
                    let unwound = self.unwind_to(entry_depth);
                    self.unprotect(2);
                    if let Err(e) = unwound {
                        // An unwind action's own exit supersedes.
                        self.frames.pop();
                        return Err(e);
                    }
                }
                Err(err)
            }
        };
        self.frames.pop();
        debug_assert_eq!(self.frames.len(), fi);
        result
    }

    /// The argument unpacker: checks the packed arity against the actual
    /// count, pushes the accepted actuals, packs any excess into a rest
    /// list, and fills missing optionals with nil.
    pub(crate) fn bind_args(&mut self, fi: usize, template: Value, args: &[Value]) -> RunResult<()> {
        if template.is_nil() {
            return Ok(());
        }
        let Value::Int(at) = template else {
            return Err(self.wrong_type(Q::Integerp, template));
        };
        let spec = ArgSpec(at);
        let (mandatory, rest, nonrest) = (spec.mandatory(), spec.rest(), spec.nonrest());
        let nargs = args.len() as i64;
        if !(mandatory <= nargs && (rest || nargs <= nonrest)) {
            return Err(self.wrong_nargs(mandatory, nonrest, args.len()));
        }
        let pushed = nonrest.min(nargs) as usize;
        for &arg in &args[..pushed] {
            self.push(fi, arg);
        }
        if nonrest < nargs {
            let rest_list = self.list(&args[pushed..]);
            self.push(fi, rest_list);
        } else {
            for _ in (nargs - i64::from(rest))..nonrest {
                self.push(fi, Value::NIL);
            }
        }
        Ok(())
    }

    // ---- the GC relocation hook ------------------------------------------

    /// Fixes up program counters after the collector moved byte-string
    /// storage: frames whose recorded start no longer matches the current
    /// storage address are rebased so `pc - start` is preserved.
    /// Native-resident frames (null start) are skipped.
    pub fn relocate_frames(&mut self) {
        for i in 0..self.frames.len() {
            if self.frames[i].start.is_null() {
                continue;
            }
            let bytes = self.frames[i].bytes;
            let HeapData::Str(s) = self.heap.get(bytes) else {
                continue;
            };
            let (new_start, new_len) = (s.bytes.as_ptr(), s.bytes.len());
            let frame = &mut self.frames[i];
            if frame.start != new_start {
                let offset = (frame.pc as usize - frame.start as usize).min(new_len);
                frame.start = new_start;
                frame.len = new_len;
                // SAFETY: offset <= new_len, so the rebased pc stays within
                // (or one past) the relocated byte string.
                frame.pc = unsafe { new_start.add(offset) };
            }
        }
    }

    // ---- operand-stack helpers -------------------------------------------

    #[inline]
    fn push(&mut self, fi: usize, v: Value) {
        self.frames[fi].stack.push(v);
    }

    #[inline]
    fn pop(&mut self, fi: usize) -> Value {
        self.frames[fi].stack.pop().expect("operand stack underflow")
    }

    #[inline]
    fn top(&self, fi: usize) -> Value {
        *self.frames[fi].stack.last().expect("operand stack empty")
    }

    #[inline]
    fn set_top(&mut self, fi: usize, v: Value) {
        *self.frames[fi].stack.last_mut().expect("operand stack empty") = v;
    }

    #[inline]
    fn discard(&mut self, fi: usize, n: usize) {
        let stack = &mut self.frames[fi].stack;
        let keep = stack.len() - n;
        stack.truncate(keep);
    }

    /// `top[-n]`: the value `n` slots below the top.
    #[inline]
    fn stack_ref(&self, fi: usize, n: usize) -> Value {
        let stack = &self.frames[fi].stack;
        stack[stack.len() - 1 - n]
    }

    /// Copies the top into the slot `n` below it, then drops the top.
    /// `n = 0` is a plain discard; `n = 1` is discard-below-top.
    fn stack_set(&mut self, fi: usize, n: usize) {
        let stack = &mut self.frames[fi].stack;
        let len = stack.len();
        let v = stack[len - 1];
        stack[len - 1 - n] = v;
        stack.truncate(len - 1);
    }

    /// The stack-range assertion of checking builds; a violation means the
    /// compiler declared too small a max-depth and is not recoverable.
    fn assert_stack_range(&self, fi: usize) {
        if cfg!(feature = "exec-checks") {
            let frame = &self.frames[fi];
            assert!(
                frame.stack.len() < frame.limit,
                "operand stack out of range (miscompiled max-depth)"
            );
        }
    }

    // ---- error delivery --------------------------------------------------

    fn invalid_opcode(&mut self, op: u8, offset: usize) -> RunError {
        self.error_msg(format!("Invalid byte opcode: op={op}, ptr={offset}"))
    }

    /// Offers a raised exit to this frame's handlers. On a match the
    /// binding stack is unwound to the handler's depth (running unwind
    /// actions), the operand stack is cut back to the saved top, the
    /// landing value is pushed, and the returned cursor re-enters the loop
    /// at the saved destination. Without a match the exit propagates.
    fn on_error(&mut self, fi: usize, err: RunError) -> RunResult<Cursor> {
        let mut idx = self.handlers.len();
        while idx > 0 && self.handlers[idx - 1].frame == fi {
            idx -= 1;
            let handler = self.handlers[idx];
            let matched = match (handler.kind, &err) {
                (HandlerKind::Catcher, RunError::Throw { tag, .. }) => *tag == handler.tag,
                (HandlerKind::ConditionCase, RunError::Signal { symbol, .. }) => {
                    self.condition_matches(handler.tag, *symbol)
                }
                _ => false,
            };
            if !matched {
                continue;
            }
            // Pop the matched handler and everything above it, then unwind
            // bindings down to it. The exit's values stay rooted while
            // unwind actions (which may collect) run.
            self.handlers.truncate(idx);
            for v in err.payload() {
                self.protect(v);
            }
            let unwound = self.unwind_to(handler.binding_depth);
            self.unprotect(2);
            unwound?;
            let landing = match (handler.kind, err) {
                (HandlerKind::Catcher, RunError::Throw { value, .. }) => value,
                (HandlerKind::ConditionCase, RunError::Signal { symbol, data }) => self.cons(symbol, data),
                _ => unreachable!("matched above"),
            };
            let frame = &mut self.frames[fi];
            frame.stack.truncate(handler.stack_top);
            frame.stack.push(landing);
            let mut cursor = frame.cursor();
            if !cursor.jump_to(handler.dest) {
                return Err(self.error_msg("Byte-code jump out of range"));
            }
            self.frames[fi].pc = cursor.pc_ptr();
            return Ok(cursor);
        }
        Err(err)
    }

    /// Whether a condition-case clause value covers an error symbol:
    /// `t` covers everything; a symbol covers errors whose
    /// `error-conditions` contain it; a list covers what its elements do.
    pub(crate) fn condition_matches(&self, clause: Value, error_symbol: Value) -> bool {
        if clause == Value::T {
            return true;
        }
        let conditions = self.get_property(error_symbol, Q::ErrorConditions.sym());
        if clause.is_symbol() {
            return self.memq_quietly(clause, conditions);
        }
        let mut tail = clause;
        while tail.is_cons(&self.heap) {
            if self.memq_quietly(self.car_safe(tail), conditions) {
                return true;
            }
            tail = self.cdr_safe(tail);
        }
        false
    }

    fn memq_quietly(&self, elt: Value, list: Value) -> bool {
        let mut tail = list;
        while tail.is_cons(&self.heap) {
            if self.car_safe(tail) == elt {
                return true;
            }
            tail = self.cdr_safe(tail);
        }
        false
    }

    // ---- helpers shared by several opcodes -------------------------------

    fn constant(&mut self, fi: usize, idx: usize) -> RunResult<Value> {
        let cid = self.frames[fi].constants;
        match self.heap.vector(cid).get(idx).copied() {
            Some(v) => Ok(v),
            None => {
                let vec = Value::Ref(cid);
                Err(self.args_out_of_range(&[vec, Value::int(idx as i64)]))
            }
        }
    }

    /// The CALL opcode body: the top `nargs + 1` slots are
    /// `[callee, args...]`; they stay on the stack (as collector roots)
    /// until the call returns, then collapse into nothing — the caller
    /// pushes the result.
    fn call_from_stack(&mut self, fi: usize, nargs: usize) -> RunResult<Value> {
        let len = self.frames[fi].stack.len();
        let base = len - nargs - 1;
        let callee = self.frames[fi].stack[base];
        let args: SmallVec<[Value; 8]> = self.frames[fi].stack[base + 1..].iter().copied().collect();
        let result = self.funcall(callee, &args);
        self.frames[fi].stack.truncate(base);
        result
    }

    /// Replaces the top `n` slots with a list of them, in order.
    fn list_from_stack(&mut self, fi: usize, n: usize) {
        let len = self.frames[fi].stack.len();
        let items: SmallVec<[Value; 8]> = self.frames[fi].stack[len - n..].iter().copied().collect();
        let list = self.list(&items);
        self.frames[fi].stack.truncate(len - n);
        self.push(fi, list);
    }

    fn concat_from_stack(&mut self, fi: usize, n: usize) -> RunResult<()> {
        let len = self.frames[fi].stack.len();
        let items: SmallVec<[Value; 8]> = self.frames[fi].stack[len - n..].iter().copied().collect();
        let joined = self.concat(&items)?;
        self.frames[fi].stack.truncate(len - n);
        self.push(fi, joined);
        Ok(())
    }

    fn insert_from_stack(&mut self, fi: usize, n: usize) -> RunResult<()> {
        let len = self.frames[fi].stack.len();
        let items: SmallVec<[Value; 8]> = self.frames[fi].stack[len - n..].iter().copied().collect();
        self.insert(&items)?;
        self.frames[fi].stack.truncate(len - n);
        self.push(fi, Value::NIL);
        Ok(())
    }

    fn specbind_value(&mut self, symbol: Value, value: Value) -> RunResult<()> {
        let Value::Sym(id) = symbol else {
            return Err(self.wrong_type(Q::Symbolp, symbol));
        };
        self.specbind(id, value)
    }

    fn unbind_n(&mut self, n: usize) -> RunResult<()> {
        let target = self.specpdl.len().saturating_sub(n);
        self.unwind_to(target)
    }

    /// The quit gate with per-frame amortization: only a counter that has
    /// wrapped to zero pays for the full poll.
    fn maybe_quit(&mut self, fi: usize) -> RunResult<()> {
        let counter = self.frames[fi].quitcounter;
        self.frames[fi].quitcounter = counter.wrapping_add(1);
        if counter != 0 {
            return Ok(());
        }
        self.handle_quit()
    }

    /// The legacy `save-window-excursion` body: record a state restore, run
    /// the body, rebalance, hand back the body's value.
    fn save_window_excursion(&mut self, body: Value) -> RunResult<Value> {
        let count = self.specpdl.len();
        self.record_save_excursion();
        self.protect(body);
        let result = self.run_body(body);
        self.unprotect(1);
        let value = result?;
        self.protect(value);
        let unwound = self.unwind_to(count);
        self.unprotect(1);
        unwound?;
        Ok(value)
    }

    /// The legacy `condition-case` opcode: runs the body value, and on a
    /// matching signal binds `var` to the error object and runs the
    /// clause's own body.
    fn legacy_condition_case(&mut self, var: Value, body: Value, clauses: Value) -> RunResult<Value> {
        self.protect(clauses);
        let result = self.run_body(body);
        self.unprotect(1);
        let (symbol, data) = match result {
            Err(RunError::Signal { symbol, data }) => (symbol, data),
            other => return other,
        };
        let mut tail = clauses;
        while tail.is_cons(&self.heap) {
            let clause = self.car_safe(tail);
            let condition = self.car_safe(clause);
            if self.condition_matches(condition, symbol) {
                let error_object = self.cons(symbol, data);
                let depth = self.specpdl.len();
                self.protect(error_object);
                let handled = (|| -> RunResult<Value> {
                    if let Value::Sym(id) = var
                        && !var.is_nil()
                    {
                        self.specbind(id, error_object)?;
                    }
                    let clause_body = self.cdr_safe(clause);
                    let value = self.run_body(clause_body)?;
                    self.protect(value);
                    let unwound = self.unwind_to(depth);
                    self.unprotect(1);
                    unwound?;
                    Ok(value)
                })();
                self.unprotect(1);
                return handled;
            }
            tail = self.cdr_safe(tail);
        }
        Err(RunError::Signal { symbol, data })
    }

    // ---- the dispatch loop -----------------------------------------------

    fn dispatch(&mut self, fi: usize) -> RunResult<Value> {
        let mut cursor = self.frames[fi].cursor();
        loop {
            self.assert_stack_range(fi);

            let offset = cursor.offset();
            let op = fetch1!(self, fi, cursor);
            self.tracer.on_instruction(offset, op);

            // The inline-constant range: 64 fast constants.
            if op >= CONSTANT_BASE {
                let v = recover!(self, fi, cursor, self.constant(fi, (op - CONSTANT_BASE) as usize));
                self.push(fi, v);
                continue;
            }
            let Some(opcode) = Opcode::from_repr(op) else {
                let err = self.invalid_opcode(op, offset);
                cursor = self.on_error(fi, err)?;
                continue;
            };
            if cfg!(feature = "strict-bytecode") && opcode.is_obsolete() {
                let err = self.error_msg(format!("{} is an obsolete bytecode", opcode.name()));
                cursor = self.on_error(fi, err)?;
                continue;
            }

            match opcode {
                // -- stack shuffling --------------------------------------
                Opcode::StackRef1
                | Opcode::StackRef2
                | Opcode::StackRef3
                | Opcode::StackRef4
                | Opcode::StackRef5 => {
                    let v = self.stack_ref(fi, op as usize);
                    self.push(fi, v);
                }
                Opcode::StackRef6 => {
                    let n = fetch1!(self, fi, cursor) as usize;
                    let v = self.stack_ref(fi, n);
                    self.push(fi, v);
                }
                Opcode::StackRef7 => {
                    let n = fetch2!(self, fi, cursor) as usize;
                    let v = self.stack_ref(fi, n);
                    self.push(fi, v);
                }
                Opcode::StackSet => {
                    let n = fetch1!(self, fi, cursor) as usize;
                    self.stack_set(fi, n);
                }
                Opcode::StackSet2 => {
                    let n = fetch2!(self, fi, cursor) as usize;
                    self.stack_set(fi, n);
                }
                Opcode::DiscardN => {
                    let mut n = fetch1!(self, fi, cursor) as usize;
                    if n & 0x80 != 0 {
                        n &= 0x7F;
                        if n > 0 {
                            let stack = &mut self.frames[fi].stack;
                            let len = stack.len();
                            stack[len - 1 - n] = stack[len - 1];
                        }
                    }
                    self.discard(fi, n);
                }
                Opcode::Dup => {
                    let v = self.top(fi);
                    self.push(fi, v);
                }
                Opcode::Discard => self.discard(fi, 1),

                // -- variables --------------------------------------------
                Opcode::VarRef0
                | Opcode::VarRef1
                | Opcode::VarRef2
                | Opcode::VarRef3
                | Opcode::VarRef4
                | Opcode::VarRef5
                | Opcode::VarRef6
                | Opcode::VarRef7 => {
                    let idx = match opcode {
                        Opcode::VarRef6 => fetch1!(self, fi, cursor) as usize,
                        Opcode::VarRef7 => fetch2!(self, fi, cursor) as usize,
                        _ => (op - Opcode::VarRef0 as u8) as usize,
                    };
                    let sym = recover!(self, fi, cursor, self.constant(fi, idx));
                    // Fast path: a bound plain-value cell.
                    let value = match sym {
                        Value::Sym(id) => match self.symbols.get(id).cell {
                            SymbolCell::Plain(v) if v != Value::Unbound => v,
                            _ => recover!(self, fi, cursor, self.symbol_value(sym)),
                        },
                        _ => recover!(self, fi, cursor, self.symbol_value(sym)),
                    };
                    self.push(fi, value);
                }
                Opcode::VarSet0
                | Opcode::VarSet1
                | Opcode::VarSet2
                | Opcode::VarSet3
                | Opcode::VarSet4
                | Opcode::VarSet5
                | Opcode::VarSet6
                | Opcode::VarSet7 => {
                    let idx = match opcode {
                        Opcode::VarSet6 => fetch1!(self, fi, cursor) as usize,
                        Opcode::VarSet7 => fetch2!(self, fi, cursor) as usize,
                        _ => (op - Opcode::VarSet0 as u8) as usize,
                    };
                    let sym = recover!(self, fi, cursor, self.constant(fi, idx));
                    let value = self.pop(fi);
                    // Fast path: plain untrapped cell, proper value.
                    match sym {
                        Value::Sym(id)
                            if value != Value::Unbound
                                && matches!(self.symbols.get(id).cell, SymbolCell::Plain(_))
                                && !self.symbols.get(id).trapped_write() =>
                        {
                            self.set_raw_symbol_value(id, value);
                        }
                        _ => {
                            recover_gc!(self, fi, cursor, self.set_symbol_value(sym, value));
                        }
                    }
                }
                Opcode::VarBind0
                | Opcode::VarBind1
                | Opcode::VarBind2
                | Opcode::VarBind3
                | Opcode::VarBind4
                | Opcode::VarBind5
                | Opcode::VarBind6
                | Opcode::VarBind7 => {
                    let idx = match opcode {
                        Opcode::VarBind6 => fetch1!(self, fi, cursor) as usize,
                        Opcode::VarBind7 => fetch2!(self, fi, cursor) as usize,
                        _ => (op - Opcode::VarBind0 as u8) as usize,
                    };
                    let sym = recover!(self, fi, cursor, self.constant(fi, idx));
                    let value = self.pop(fi);
                    recover_gc!(self, fi, cursor, self.specbind_value(sym, value));
                }

                // -- calls and unbinding ----------------------------------
                Opcode::Call0
                | Opcode::Call1
                | Opcode::Call2
                | Opcode::Call3
                | Opcode::Call4
                | Opcode::Call5
                | Opcode::Call6
                | Opcode::Call7 => {
                    let nargs = match opcode {
                        Opcode::Call6 => fetch1!(self, fi, cursor) as usize,
                        Opcode::Call7 => fetch2!(self, fi, cursor) as usize,
                        _ => (op - Opcode::Call0 as u8) as usize,
                    };
                    let result = recover_gc!(self, fi, cursor, self.call_from_stack(fi, nargs));
                    self.push(fi, result);
                }
                Opcode::Unbind0
                | Opcode::Unbind1
                | Opcode::Unbind2
                | Opcode::Unbind3
                | Opcode::Unbind4
                | Opcode::Unbind5
                | Opcode::Unbind6
                | Opcode::Unbind7 => {
                    let n = match opcode {
                        Opcode::Unbind6 => fetch1!(self, fi, cursor) as usize,
                        Opcode::Unbind7 => fetch2!(self, fi, cursor) as usize,
                        _ => (op - Opcode::Unbind0 as u8) as usize,
                    };
                    recover_gc!(self, fi, cursor, self.unbind_n(n));
                }
                Opcode::UnbindAll => {
                    let target = self.frames[fi].entry_depth;
                    recover_gc!(self, fi, cursor, self.unwind_to(target));
                }

                // -- handlers ---------------------------------------------
                Opcode::PopHandler => {
                    self.handlers.pop();
                }
                Opcode::PushCatch | Opcode::PushConditionCase => {
                    let kind = if opcode == Opcode::PushCatch {
                        HandlerKind::Catcher
                    } else {
                        HandlerKind::ConditionCase
                    };
                    let tag = self.pop(fi);
                    let dest = fetch2!(self, fi, cursor) as usize;
                    self.handlers.push(Handler {
                        kind,
                        tag,
                        frame: fi,
                        stack_top: self.frames[fi].stack.len(),
                        dest,
                        binding_depth: self.specpdl.len(),
                    });
                }
                Opcode::UnwindProtect => {
                    let handler = self.pop(fi);
                    let action = if self.functionp(handler) {
                        UnwindAction::CallFn(handler)
                    } else {
                        UnwindAction::Body(handler)
                    };
                    self.record_unwind(action);
                }
                Opcode::Catch => {
                    let body = self.pop(fi);
                    let tag = self.top(fi);
                    let value = recover_gc!(self, fi, cursor, self.call_with_catch(tag, body));
                    self.set_top(fi, value);
                }
                Opcode::ConditionCase => {
                    let clauses = self.pop(fi);
                    let body = self.pop(fi);
                    let var = self.top(fi);
                    let value = recover_gc!(self, fi, cursor, self.legacy_condition_case(var, body, clauses));
                    self.set_top(fi, value);
                }

                // -- jumps ------------------------------------------------
                Opcode::Goto => {
                    recover_gc!(self, fi, cursor, self.maybe_quit(fi));
                    let dest = fetch2!(self, fi, cursor) as usize;
                    jump_abs!(self, fi, cursor, dest);
                }
                Opcode::GotoIfNil => {
                    let dest = fetch2!(self, fi, cursor) as usize;
                    if self.pop(fi).is_nil() {
                        recover_gc!(self, fi, cursor, self.maybe_quit(fi));
                        jump_abs!(self, fi, cursor, dest);
                    }
                }
                Opcode::GotoIfNonNil => {
                    let dest = fetch2!(self, fi, cursor) as usize;
                    if !self.pop(fi).is_nil() {
                        recover_gc!(self, fi, cursor, self.maybe_quit(fi));
                        jump_abs!(self, fi, cursor, dest);
                    }
                }
                Opcode::GotoIfNilElsePop => {
                    let dest = fetch2!(self, fi, cursor) as usize;
                    if self.top(fi).is_nil() {
                        recover_gc!(self, fi, cursor, self.maybe_quit(fi));
                        jump_abs!(self, fi, cursor, dest);
                    } else {
                        self.discard(fi, 1);
                    }
                }
                Opcode::GotoIfNonNilElsePop => {
                    let dest = fetch2!(self, fi, cursor) as usize;
                    if !self.top(fi).is_nil() {
                        recover_gc!(self, fi, cursor, self.maybe_quit(fi));
                        jump_abs!(self, fi, cursor, dest);
                    } else {
                        self.discard(fi, 1);
                    }
                }
                Opcode::RGoto => {
                    recover_gc!(self, fi, cursor, self.maybe_quit(fi));
                    let byte = fetch1!(self, fi, cursor);
                    jump_rel!(self, fi, cursor, i32::from(byte) - 128);
                }
                Opcode::RGotoIfNil => {
                    let byte = fetch1!(self, fi, cursor);
                    if self.pop(fi).is_nil() {
                        recover_gc!(self, fi, cursor, self.maybe_quit(fi));
                        jump_rel!(self, fi, cursor, i32::from(byte) - 128);
                    }
                }
                Opcode::RGotoIfNonNil => {
                    let byte = fetch1!(self, fi, cursor);
                    if !self.pop(fi).is_nil() {
                        recover_gc!(self, fi, cursor, self.maybe_quit(fi));
                        jump_rel!(self, fi, cursor, i32::from(byte) - 128);
                    }
                }
                Opcode::RGotoIfNilElsePop => {
                    let byte = fetch1!(self, fi, cursor);
                    if self.top(fi).is_nil() {
                        recover_gc!(self, fi, cursor, self.maybe_quit(fi));
                        jump_rel!(self, fi, cursor, i32::from(byte) - 128);
                    } else {
                        self.discard(fi, 1);
                    }
                }
                Opcode::RGotoIfNonNilElsePop => {
                    let byte = fetch1!(self, fi, cursor);
                    if !self.top(fi).is_nil() {
                        recover_gc!(self, fi, cursor, self.maybe_quit(fi));
                        jump_rel!(self, fi, cursor, i32::from(byte) - 128);
                    } else {
                        self.discard(fi, 1);
                    }
                }
                Opcode::Return => {
                    return Ok(self.top(fi));
                }

                // -- constants --------------------------------------------
                Opcode::Constant2 => {
                    let idx = fetch2!(self, fi, cursor) as usize;
                    let v = recover!(self, fi, cursor, self.constant(fi, idx));
                    self.push(fi, v);
                }
                Opcode::Constant => unreachable!("handled by the inline-constant range"),

                // -- predicates and identity ------------------------------
                Opcode::Symbolp => {
                    let v = Value::bool(self.top(fi).is_symbol());
                    self.set_top(fi, v);
                }
                Opcode::Consp => {
                    let v = Value::bool(self.top(fi).is_cons(&self.heap));
                    self.set_top(fi, v);
                }
                Opcode::Stringp => {
                    let v = Value::bool(self.top(fi).is_string(&self.heap));
                    self.set_top(fi, v);
                }
                Opcode::Listp => {
                    let v = Value::bool(self.top(fi).is_list(&self.heap));
                    self.set_top(fi, v);
                }
                Opcode::Numberp => {
                    let v = Value::bool(self.top(fi).is_number());
                    self.set_top(fi, v);
                }
                Opcode::Integerp => {
                    let v = Value::bool(self.top(fi).is_integer());
                    self.set_top(fi, v);
                }
                Opcode::Not => {
                    let v = Value::bool(self.top(fi).is_nil());
                    self.set_top(fi, v);
                }
                Opcode::Eq => {
                    let v1 = self.pop(fi);
                    let v = Value::bool(v1 == self.top(fi));
                    self.set_top(fi, v);
                }
                Opcode::Equal => {
                    let v1 = self.pop(fi);
                    let top = self.top(fi);
                    let equal = recover!(self, fi, cursor, self.equal(top, v1));
                    self.set_top(fi, Value::bool(equal));
                }

                // -- lists ------------------------------------------------
                Opcode::Car => {
                    let top = self.top(fi);
                    let v = recover!(self, fi, cursor, self.car(top));
                    self.set_top(fi, v);
                }
                Opcode::Cdr => {
                    let top = self.top(fi);
                    let v = recover!(self, fi, cursor, self.cdr(top));
                    self.set_top(fi, v);
                }
                Opcode::CarSafe => {
                    let v = self.car_safe(self.top(fi));
                    self.set_top(fi, v);
                }
                Opcode::CdrSafe => {
                    let v = self.cdr_safe(self.top(fi));
                    self.set_top(fi, v);
                }
                Opcode::Cons => {
                    let v1 = self.pop(fi);
                    let top = self.top(fi);
                    let cell = self.cons(top, v1);
                    self.set_top(fi, cell);
                }
                Opcode::List1 => {
                    let top = self.top(fi);
                    let list = self.cons(top, Value::NIL);
                    self.set_top(fi, list);
                }
                Opcode::List2 => {
                    let v1 = self.pop(fi);
                    let top = self.top(fi);
                    let tail = self.cons(v1, Value::NIL);
                    let list = self.cons(top, tail);
                    self.set_top(fi, list);
                }
                Opcode::List3 => self.list_from_stack(fi, 3),
                Opcode::List4 => self.list_from_stack(fi, 4),
                Opcode::ListN => {
                    let n = fetch1!(self, fi, cursor) as usize;
                    self.list_from_stack(fi, n);
                }
                Opcode::Nth => {
                    let list = self.pop(fi);
                    let n = self.top(fi);
                    let v = recover!(self, fi, cursor, self.nth(n, list));
                    self.set_top(fi, v);
                }
                Opcode::Nthcdr => {
                    let list = self.pop(fi);
                    let n = self.top(fi);
                    let v = recover!(self, fi, cursor, self.nthcdr(n, list));
                    self.set_top(fi, v);
                }
                Opcode::Elt => {
                    let n = self.pop(fi);
                    let seq = self.top(fi);
                    let v = recover!(self, fi, cursor, self.elt(seq, n));
                    self.set_top(fi, v);
                }
                Opcode::Memq => {
                    let list = self.pop(fi);
                    let elt = self.top(fi);
                    let v = recover!(self, fi, cursor, self.memq(elt, list));
                    self.set_top(fi, v);
                }
                Opcode::Member => {
                    let list = self.pop(fi);
                    let elt = self.top(fi);
                    let v = recover!(self, fi, cursor, self.member(elt, list));
                    self.set_top(fi, v);
                }
                Opcode::Assq => {
                    let alist = self.pop(fi);
                    let key = self.top(fi);
                    let v = recover!(self, fi, cursor, self.assq(key, alist));
                    self.set_top(fi, v);
                }
                Opcode::Setcar => {
                    let v1 = self.pop(fi);
                    let cell = self.top(fi);
                    let v = recover!(self, fi, cursor, self.setcar(cell, v1));
                    self.set_top(fi, v);
                }
                Opcode::Setcdr => {
                    let v1 = self.pop(fi);
                    let cell = self.top(fi);
                    let v = recover!(self, fi, cursor, self.setcdr(cell, v1));
                    self.set_top(fi, v);
                }
                Opcode::Nreverse => {
                    let top = self.top(fi);
                    let v = recover!(self, fi, cursor, self.nreverse(top));
                    self.set_top(fi, v);
                }
                Opcode::Nconc => {
                    let v1 = self.pop(fi);
                    let top = self.top(fi);
                    let v = recover!(self, fi, cursor, self.nconc2(top, v1));
                    self.set_top(fi, v);
                }
                Opcode::Length => {
                    let top = self.top(fi);
                    let v = recover!(self, fi, cursor, self.length(top));
                    self.set_top(fi, v);
                }

                // -- arrays and sequences ---------------------------------
                Opcode::Aref => {
                    let idx = self.pop(fi);
                    let array = self.top(fi);
                    let v = recover!(self, fi, cursor, self.aref(array, idx));
                    self.set_top(fi, v);
                }
                Opcode::Aset => {
                    let newelt = self.pop(fi);
                    let idx = self.pop(fi);
                    let array = self.top(fi);
                    // aset on a string rebuilds its bytes, which relocates
                    // any frame running out of it; resync afterwards.
                    let v = recover_gc!(self, fi, cursor, self.aset(array, idx, newelt));
                    self.set_top(fi, v);
                }
                Opcode::Substring => {
                    let to = self.pop(fi);
                    let from = self.pop(fi);
                    let seq = self.top(fi);
                    let v = recover!(self, fi, cursor, self.substring(seq, from, to));
                    self.set_top(fi, v);
                }
                Opcode::Concat2 => recover!(self, fi, cursor, self.concat_from_stack(fi, 2)),
                Opcode::Concat3 => recover!(self, fi, cursor, self.concat_from_stack(fi, 3)),
                Opcode::Concat4 => recover!(self, fi, cursor, self.concat_from_stack(fi, 4)),
                Opcode::ConcatN => {
                    let n = fetch1!(self, fi, cursor) as usize;
                    recover!(self, fi, cursor, self.concat_from_stack(fi, n));
                }

                // -- symbols ----------------------------------------------
                Opcode::SymbolValue => {
                    let top = self.top(fi);
                    let v = recover!(self, fi, cursor, self.symbol_value(top));
                    self.set_top(fi, v);
                }
                Opcode::SymbolFunction => {
                    let top = self.top(fi);
                    let v = recover!(self, fi, cursor, self.symbol_function(top));
                    self.set_top(fi, v);
                }
                Opcode::Set => {
                    let value = self.pop(fi);
                    let sym = self.top(fi);
                    recover_gc!(self, fi, cursor, self.set_symbol_value(sym, value));
                    self.set_top(fi, value);
                }
                Opcode::Fset => {
                    let def = self.pop(fi);
                    let sym = self.top(fi);
                    let v = recover!(self, fi, cursor, self.fset(sym, def));
                    self.set_top(fi, v);
                }
                Opcode::Get => {
                    let prop = self.pop(fi);
                    let sym = self.top(fi);
                    let v = self.get_property(sym, prop);
                    self.set_top(fi, v);
                }

                // -- arithmetic -------------------------------------------
                Opcode::Sub1 => match self.top(fi) {
                    Value::Int(n) => self.set_top(fi, Value::Int(n.wrapping_sub(1))),
                    v => {
                        let r = recover!(self, fi, cursor, self.arith_sub1(v));
                        self.set_top(fi, r);
                    }
                },
                Opcode::Add1 => match self.top(fi) {
                    Value::Int(n) => self.set_top(fi, Value::Int(n.wrapping_add(1))),
                    v => {
                        let r = recover!(self, fi, cursor, self.arith_add1(v));
                        self.set_top(fi, r);
                    }
                },
                Opcode::Negate => match self.top(fi) {
                    Value::Int(n) => self.set_top(fi, Value::Int(n.wrapping_neg())),
                    v => {
                        let r = recover!(self, fi, cursor, self.arith_negate(v));
                        self.set_top(fi, r);
                    }
                },
                Opcode::Eqlsign => {
                    let v1 = self.pop(fi);
                    let top = self.top(fi);
                    let v = recover!(self, fi, cursor, self.arith_compare(top, v1, crate::arith::Cmp::Eql));
                    self.set_top(fi, v);
                }
                Opcode::Gtr | Opcode::Lss | Opcode::Leq | Opcode::Geq => {
                    let cmp = match opcode {
                        Opcode::Gtr => crate::arith::Cmp::Gtr,
                        Opcode::Lss => crate::arith::Cmp::Lss,
                        Opcode::Leq => crate::arith::Cmp::Leq,
                        _ => crate::arith::Cmp::Geq,
                    };
                    let v1 = self.pop(fi);
                    let top = self.top(fi);
                    let v = recover!(self, fi, cursor, self.arith_compare(top, v1, cmp));
                    self.set_top(fi, v);
                }
                Opcode::Plus => {
                    let v1 = self.pop(fi);
                    let top = self.top(fi);
                    let v = recover!(self, fi, cursor, self.arith_add(top, v1));
                    self.set_top(fi, v);
                }
                Opcode::Diff => {
                    let v1 = self.pop(fi);
                    let top = self.top(fi);
                    let v = recover!(self, fi, cursor, self.arith_sub(top, v1));
                    self.set_top(fi, v);
                }
                Opcode::Mult => {
                    let v1 = self.pop(fi);
                    let top = self.top(fi);
                    let v = recover!(self, fi, cursor, self.arith_mul(top, v1));
                    self.set_top(fi, v);
                }
                Opcode::Quo => {
                    let v1 = self.pop(fi);
                    let top = self.top(fi);
                    let v = recover!(self, fi, cursor, self.arith_div(top, v1));
                    self.set_top(fi, v);
                }
                Opcode::Rem => {
                    let v1 = self.pop(fi);
                    let top = self.top(fi);
                    let v = recover!(self, fi, cursor, self.arith_rem(top, v1));
                    self.set_top(fi, v);
                }
                Opcode::Max | Opcode::Min => {
                    let v1 = self.pop(fi);
                    let top = self.top(fi);
                    let v = recover!(
                        self,
                        fi,
                        cursor,
                        self.arith_extreme(top, v1, opcode == Opcode::Max)
                    );
                    self.set_top(fi, v);
                }

                // -- strings ----------------------------------------------
                Opcode::StringEqlsign => {
                    let v1 = self.pop(fi);
                    let top = self.top(fi);
                    let v = recover!(self, fi, cursor, self.string_equal(top, v1));
                    self.set_top(fi, v);
                }
                Opcode::StringLss => {
                    let v1 = self.pop(fi);
                    let top = self.top(fi);
                    let v = recover!(self, fi, cursor, self.string_lessp(top, v1));
                    self.set_top(fi, v);
                }
                Opcode::Upcase => {
                    let top = self.top(fi);
                    let v = recover!(self, fi, cursor, self.upcase(top));
                    self.set_top(fi, v);
                }
                Opcode::Downcase => {
                    let top = self.top(fi);
                    let v = recover!(self, fi, cursor, self.downcase(top));
                    self.set_top(fi, v);
                }

                // -- the editor group -------------------------------------
                Opcode::Point => {
                    let v = self.point();
                    self.push(fi, v);
                }
                Opcode::PointMax => {
                    let v = self.point_max();
                    self.push(fi, v);
                }
                Opcode::PointMin => {
                    let v = self.point_min();
                    self.push(fi, v);
                }
                Opcode::GotoChar => {
                    let top = self.top(fi);
                    let v = recover!(self, fi, cursor, self.goto_char(top));
                    self.set_top(fi, v);
                }
                Opcode::Insert => {
                    let top = self.top(fi);
                    let v = recover!(self, fi, cursor, self.insert(&[top]));
                    self.set_top(fi, v);
                }
                Opcode::InsertN => {
                    let n = fetch1!(self, fi, cursor) as usize;
                    recover!(self, fi, cursor, self.insert_from_stack(fi, n));
                }
                Opcode::CharAfter => {
                    let top = self.top(fi);
                    let v = recover!(self, fi, cursor, self.char_after(top));
                    self.set_top(fi, v);
                }
                Opcode::FollowingChar => {
                    let v = self.following_char();
                    self.push(fi, v);
                }
                Opcode::PrecedingChar => {
                    let v = self.preceding_char();
                    self.push(fi, v);
                }
                Opcode::CurrentColumn => {
                    let v = self.current_column();
                    self.push(fi, v);
                }
                Opcode::IndentTo => {
                    let top = self.top(fi);
                    let v = recover!(self, fi, cursor, self.indent_to(top));
                    self.set_top(fi, v);
                }
                Opcode::Eolp => {
                    let v = self.eolp();
                    self.push(fi, v);
                }
                Opcode::Eobp => {
                    let v = self.eobp();
                    self.push(fi, v);
                }
                Opcode::Bolp => {
                    let v = self.bolp();
                    self.push(fi, v);
                }
                Opcode::Bobp => {
                    let v = self.bobp();
                    self.push(fi, v);
                }
                Opcode::CurrentBuffer => {
                    let v = self.current_buffer();
                    self.push(fi, v);
                }
                Opcode::SetBuffer => {
                    let top = self.top(fi);
                    let v = recover!(self, fi, cursor, self.set_buffer(top));
                    self.set_top(fi, v);
                }
                Opcode::SaveCurrentBuffer | Opcode::SaveCurrentBuffer1 => {
                    self.record_save_current_buffer();
                }
                Opcode::ForwardChar => {
                    let top = self.top(fi);
                    let v = recover!(self, fi, cursor, self.forward_char(top));
                    self.set_top(fi, v);
                }
                Opcode::ForwardWord => {
                    let top = self.top(fi);
                    let v = recover!(self, fi, cursor, self.forward_word(top));
                    self.set_top(fi, v);
                }
                Opcode::SkipCharsForward | Opcode::SkipCharsBackward => {
                    let lim = self.pop(fi);
                    let spec = self.top(fi);
                    let forward = opcode == Opcode::SkipCharsForward;
                    let v = recover!(self, fi, cursor, self.skip_chars(spec, lim, forward));
                    self.set_top(fi, v);
                }
                Opcode::ForwardLine => {
                    let top = self.top(fi);
                    let v = recover!(self, fi, cursor, self.forward_line(top));
                    self.set_top(fi, v);
                }
                Opcode::CharSyntax => {
                    let top = self.top(fi);
                    let v = recover!(self, fi, cursor, self.char_syntax(top));
                    self.set_top(fi, v);
                }
                Opcode::BufferSubstring => {
                    let end = self.pop(fi);
                    let beg = self.top(fi);
                    let v = recover!(self, fi, cursor, self.buffer_substring(beg, end));
                    self.set_top(fi, v);
                }
                Opcode::DeleteRegion => {
                    let end = self.pop(fi);
                    let beg = self.top(fi);
                    let v = recover!(self, fi, cursor, self.delete_region(beg, end));
                    self.set_top(fi, v);
                }
                Opcode::NarrowToRegion => {
                    let end = self.pop(fi);
                    let beg = self.top(fi);
                    let v = recover!(self, fi, cursor, self.narrow_to_region(beg, end));
                    self.set_top(fi, v);
                }
                Opcode::Widen => {
                    let v = self.widen();
                    self.push(fi, v);
                }
                Opcode::EndOfLine => {
                    let top = self.top(fi);
                    let v = recover!(self, fi, cursor, self.end_of_line(top));
                    self.set_top(fi, v);
                }
                Opcode::SetMarker => {
                    let buffer = self.pop(fi);
                    let pos = self.pop(fi);
                    let marker = self.top(fi);
                    let v = recover!(self, fi, cursor, self.set_marker(marker, pos, buffer));
                    self.set_top(fi, v);
                }
                Opcode::MatchBeginning => {
                    let top = self.top(fi);
                    let v = recover!(self, fi, cursor, self.match_beginning(top));
                    self.set_top(fi, v);
                }
                Opcode::MatchEnd => {
                    let top = self.top(fi);
                    let v = recover!(self, fi, cursor, self.match_end(top));
                    self.set_top(fi, v);
                }

                // -- save-* forms -----------------------------------------
                Opcode::SaveExcursion => self.record_save_excursion(),
                Opcode::SaveRestriction => self.record_save_restriction(),
                Opcode::SaveWindowExcursion => {
                    let top = self.top(fi);
                    let v = recover_gc!(self, fi, cursor, self.save_window_excursion(top));
                    self.set_top(fi, v);
                }
                Opcode::TempOutputBufferSetup => {
                    let top = self.top(fi);
                    let v = recover_gc!(self, fi, cursor, self.temp_output_buffer_setup(top));
                    self.set_top(fi, v);
                }
                Opcode::TempOutputBufferShow => {
                    let v1 = self.pop(fi);
                    // Display is a no-op in this embedding; pop the
                    // standard-output binding the setup form installed.
                    self.set_top(fi, v1);
                    recover_gc!(self, fi, cursor, self.unbind_n(1));
                }

                // -- remaining obsolete opcodes ---------------------------
                Opcode::InteractiveP => {
                    let v = recover_gc!(self, fi, cursor, self.funcall(Q::InteractiveP.sym(), &[]));
                    self.push(fi, v);
                }
                Opcode::ScanBuffer | Opcode::SetMark => {
                    let err = self.error_msg(format!("{} is an obsolete bytecode", opcode.name()));
                    cursor = self.on_error(fi, err)?;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{eval::Subr, tracer::OpcodeMeter};
    use pretty_assertions::assert_eq;

    const RETURN: u8 = Opcode::Return as u8;
    const C0: u8 = CONSTANT_BASE;
    const C1: u8 = CONSTANT_BASE + 1;
    const C2: u8 = CONSTANT_BASE + 2;
    const C3: u8 = CONSTANT_BASE + 3;

    fn run(env: &mut Env, bytes: &[u8], constants: &[Value], depth: i64) -> RunResult<Value> {
        let b = env.make_unibyte_string(bytes);
        let c = env.make_vector(constants);
        env.byte_code(b, c, Value::int(depth))
    }

    fn signal_symbol(err: RunError) -> Value {
        match err {
            RunError::Signal { symbol, .. } => symbol,
            RunError::Throw { .. } => panic!("expected a signal, got a throw"),
        }
    }

    // -- the scenarios -----------------------------------------------------

    #[test]
    fn identity_function_returns_its_argument() {
        let mut env = Env::new();
        let bytes = env.make_unibyte_string(&[Opcode::Dup as u8, RETURN]);
        let constants = env.make_vector(&[]);
        let template = Value::int(1 << 8 | 1); // mandatory=1, nonrest=1
        let code = env.make_byte_code(template, bytes, constants, Value::int(2)).unwrap();
        let result = env.execute(code, template, &[Value::int(42)]).unwrap();
        assert_eq!(result, Value::int(42));
    }

    #[test]
    fn add_two_constants() {
        let mut env = Env::new();
        let result = run(
            &mut env,
            &[C0, C1, Opcode::Plus as u8, RETURN],
            &[Value::int(3), Value::int(4)],
            2,
        )
        .unwrap();
        assert_eq!(result, Value::int(7));
    }

    #[test]
    fn short_branch_taken_and_not_taken() {
        // 0: C0  1: C1  2: RGotoIfNonNil  3: operand  4: C2  5: Return
        // Operand 129 = delta +1 from the post-operand position, i.e. the
        // Return at offset 5.
        let bytes = [C0, C1, Opcode::RGotoIfNonNil as u8, 129, C2, RETURN];
        let mut env = Env::new();
        let taken = run(&mut env, &bytes, &[Value::int(42), Value::T, Value::int(7)], 3).unwrap();
        assert_eq!(taken, Value::int(42));
        let not_taken = run(&mut env, &bytes, &[Value::int(42), Value::NIL, Value::int(7)], 3).unwrap();
        assert_eq!(not_taken, Value::int(7));
    }

    #[test]
    fn short_branch_bias_128_falls_through() {
        // Delta = 128 - 128 = 0: branch taken but lands on the next
        // instruction anyway.
        let bytes = [C0, C1, Opcode::RGotoIfNonNil as u8, 128, C2, RETURN];
        let mut env = Env::new();
        let result = run(&mut env, &bytes, &[Value::int(42), Value::T, Value::int(7)], 3).unwrap();
        assert_eq!(result, Value::int(7));
    }

    #[test]
    fn backward_relative_branch_loops() {
        // 0: C0 (3)  1: Sub1  2: Dup  3: RGotoIfNonNil  4: operand 124
        // (delta -4, back to offset 1)  5: Return
        let bytes = [
            C0,
            Opcode::Sub1 as u8,
            Opcode::Dup as u8,
            Opcode::RGotoIfNonNil as u8,
            124,
            RETURN,
        ];
        let mut env = Env::new();
        let result = run(&mut env, &bytes, &[Value::int(3)], 2).unwrap();
        assert_eq!(result, Value::int(0));
    }

    #[test]
    fn absolute_branch_loops() {
        // 0: C0 (3)  1: Sub1  2: Dup  3: GotoIfNonNil 1  6: Return
        let bytes = [
            C0,
            Opcode::Sub1 as u8,
            Opcode::Dup as u8,
            Opcode::GotoIfNonNil as u8,
            1,
            0,
            RETURN,
        ];
        let mut env = Env::new();
        let result = run(&mut env, &bytes, &[Value::int(5)], 2).unwrap();
        assert_eq!(result, Value::int(0));
    }

    #[test]
    fn rest_arguments_pack_into_a_list() {
        // mandatory=1, rest, nonrest=2; four actuals leave [a0 a1 (a2 a3)].
        let mut env = Env::new();
        let bytes = env.make_unibyte_string(&[Opcode::ListN as u8, 3, RETURN]);
        let constants = env.make_vector(&[]);
        let template = Value::int((2 << 8) | (1 << 7) | 1);
        let code = env.make_byte_code(template, bytes, constants, Value::int(4)).unwrap();
        let args = [Value::int(1), Value::int(2), Value::int(3), Value::int(4)];
        let result = env.execute(code, template, &args).unwrap();
        assert_eq!(env.format_value(result), "(1 2 (3 4))");
    }

    #[test]
    fn missing_optionals_fill_with_nil() {
        let mut env = Env::new();
        let bytes = env.make_unibyte_string(&[Opcode::ListN as u8, 3, RETURN]);
        let constants = env.make_vector(&[]);
        let template = Value::int((3 << 8) | 1); // mandatory=1, nonrest=3
        let code = env.make_byte_code(template, bytes, constants, Value::int(4)).unwrap();
        let result = env.execute(code, template, &[Value::int(5)]).unwrap();
        assert_eq!(env.format_value(result), "(5 nil nil)");
    }

    #[test]
    fn rest_flag_fills_the_rest_slot_with_nil() {
        let mut env = Env::new();
        let bytes = env.make_unibyte_string(&[Opcode::ListN as u8, 3, RETURN]);
        let constants = env.make_vector(&[]);
        let template = Value::int((2 << 8) | (1 << 7) | 1);
        let code = env.make_byte_code(template, bytes, constants, Value::int(4)).unwrap();
        let result = env.execute(code, template, &[Value::int(5)]).unwrap();
        assert_eq!(env.format_value(result), "(5 nil nil)");
    }

    #[test]
    fn arg_count_outside_arity_is_rejected() {
        let mut env = Env::new();
        let bytes = env.make_unibyte_string(&[RETURN]);
        let constants = env.make_vector(&[]);
        let template = Value::int((3 << 8) | 1); // mandatory=1, nonrest=3
        let code = env.make_byte_code(template, bytes, constants, Value::int(4)).unwrap();
        let err = env.execute(code, template, &[]).unwrap_err();
        assert_eq!(signal_symbol(err), Q::WrongNumberOfArguments.sym());
        let too_many = [Value::int(1), Value::int(2), Value::int(3), Value::int(4)];
        let err = env.execute(code, template, &too_many).unwrap_err();
        let RunError::Signal { data, .. } = err else { unreachable!() };
        assert_eq!(env.format_value(data), "((1 . 3) 4)");
    }

    #[test]
    fn unpacker_acceptance_matches_arity_over_a_grid() {
        for mandatory in [0i64, 1, 2, 5] {
            for nonrest in [0i64, 1, 2, 5] {
                if nonrest < mandatory {
                    continue;
                }
                for rest in [0i64, 1] {
                    let template = (nonrest << 8) | (rest << 7) | mandatory;
                    for nargs in 0..8usize {
                        let mut env = Env::new();
                        let args: Vec<Value> = (0..nargs).map(|i| Value::int(i as i64)).collect();
                        let bytes = env.make_unibyte_string(&[RETURN]);
                        let constants = env.make_vector(&[]);
                        let b = env.check_byte_string(bytes).unwrap();
                        let c = env.check_vector(constants).unwrap();
                        let fi = env.push_frame(b, c, 16);
                        let accepted = env.bind_args(fi, Value::int(template), &args).is_ok();
                        let expected =
                            mandatory <= nargs as i64 && (rest == 1 || nargs as i64 <= nonrest);
                        assert_eq!(accepted, expected, "A={template} nargs={nargs}");
                        if accepted {
                            // Accepted calls always leave nonrest (+ rest)
                            // slots on the stack.
                            let expected_slots = nonrest as usize + rest as usize;
                            assert_eq!(env.frames[fi].stack.len(), expected_slots);
                        }
                        env.frames.pop();
                    }
                }
            }
        }
    }

    #[test]
    fn catch_opcode_resumes_at_saved_destination() {
        // 0: C0 (tag)        1: PushCatch -> 10
        // 4: C1 ('throw)     5: C0 (tag)    6: C2 (42)
        // 7: Call2           8: Return (not reached)
        // 9: padding         10: Return (landing)
        let mut env = Env::new();
        let tag = env.intern("my-tag");
        let throw = env.intern("throw");
        let bytes = [
            C0,
            Opcode::PushCatch as u8,
            10,
            0,
            C1,
            C0,
            C2,
            Opcode::Call2 as u8,
            RETURN,
            0,
            RETURN,
        ];
        let result = run(&mut env, &bytes, &[tag, throw, Value::int(42)], 4).unwrap();
        assert_eq!(result, Value::int(42));
        assert!(env.handlers.is_empty());
    }

    #[test]
    fn condition_case_opcode_catches_matching_signal() {
        // 0: C0 ('arith-error)  1: PushConditionCase -> 9
        // 4: C1 ('/)  5: C2 (1)  6: C3 (0)  7: Call2  8: Return
        // 9: Return (landing: the error object)
        let mut env = Env::new();
        let arith = env.intern("arith-error");
        let div = env.intern("/");
        let bytes = [
            C0,
            Opcode::PushConditionCase as u8,
            9,
            0,
            C1,
            C2,
            C3,
            Opcode::Call2 as u8,
            RETURN,
            RETURN,
        ];
        let result = run(&mut env, &bytes, &[arith, div, Value::int(1), Value::int(0)], 4).unwrap();
        assert_eq!(env.format_value(result), "(arith-error)");
        assert!(env.handlers.is_empty());
    }

    #[test]
    fn unmatched_throw_propagates_and_cleans_up() {
        // A catch for the wrong tag: the throw passes through.
        let mut env = Env::new();
        let tag = env.intern("tag-a");
        let other = env.intern("tag-b");
        let throw = env.intern("throw");
        let bytes = [
            C0,
            Opcode::PushCatch as u8,
            10,
            0,
            C1,
            C2,
            C3,
            Opcode::Call2 as u8,
            RETURN,
            0,
            RETURN,
        ];
        let err = run(&mut env, &bytes, &[tag, throw, other, Value::int(1)], 4).unwrap_err();
        assert_eq!(
            err,
            RunError::Throw {
                tag: other,
                value: Value::int(1)
            }
        );
        assert!(env.handlers.is_empty());
        assert!(env.frames.is_empty());
    }

    #[test]
    fn pophandler_discards_without_firing() {
        let mut env = Env::new();
        let tag = env.intern("tag");
        let bytes = [
            C0,
            Opcode::PushCatch as u8,
            0,
            0,
            Opcode::PopHandler as u8,
            C1,
            RETURN,
        ];
        let result = run(&mut env, &bytes, &[tag, Value::int(9)], 2).unwrap();
        assert_eq!(result, Value::int(9));
        assert!(env.handlers.is_empty());
    }

    // -- variables and bindings --------------------------------------------

    #[test]
    fn varref_reads_and_void_variable_signals() {
        let mut env = Env::new();
        let x = env.intern("exec-test-x");
        env.set_symbol_value(x, Value::int(31)).unwrap();
        let result = run(&mut env, &[Opcode::VarRef0 as u8, RETURN], &[x], 1).unwrap();
        assert_eq!(result, Value::int(31));

        let void = env.intern("exec-test-void");
        let err = run(&mut env, &[Opcode::VarRef0 as u8, RETURN], &[void], 1).unwrap_err();
        assert_eq!(signal_symbol(err), Q::VoidVariable.sym());
    }

    #[test]
    fn varset_writes_through_fast_and_generic_paths() {
        let mut env = Env::new();
        let x = env.intern("exec-test-set");
        let bytes = [C1, Opcode::VarSet0 as u8, C1, RETURN];
        let result = run(&mut env, &bytes, &[x, Value::int(8)], 1).unwrap();
        assert_eq!(result, Value::int(8));
        assert_eq!(env.symbol_value(x).unwrap(), Value::int(8));

        // Writing nil routes through the generic path and signals.
        let bytes = [C1, Opcode::VarSet0 as u8, C1, RETURN];
        let err = run(&mut env, &bytes, &[Value::NIL, Value::int(8)], 1).unwrap_err();
        assert_eq!(signal_symbol(err), Q::SettingConstant.sym());
    }

    #[test]
    fn varbind_unbind_restores_previous_value() {
        let mut env = Env::new();
        let x = env.intern("exec-test-bound");
        env.set_symbol_value(x, Value::int(1)).unwrap();
        // Bind x to 5, read it, unbind, return the read value.
        let bytes = [
            C1,
            Opcode::VarBind0 as u8,
            Opcode::VarRef0 as u8,
            Opcode::Unbind1 as u8,
            RETURN,
        ];
        let result = run(&mut env, &bytes, &[x, Value::int(5)], 2).unwrap();
        assert_eq!(result, Value::int(5));
        assert_eq!(env.symbol_value(x).unwrap(), Value::int(1));
        assert_eq!(env.binding_depth(), 0);
    }

    #[test]
    fn unbalanced_bindings_are_detected_and_rewound() {
        let mut env = Env::new();
        let x = env.intern("exec-test-unbalanced");
        let bytes = [C1, Opcode::VarBind0 as u8, C1, RETURN];
        let err = run(&mut env, &bytes, &[x, Value::int(5)], 2).unwrap_err();
        assert_eq!(signal_symbol(err), Q::Error.sym());
        // The stray binding was unwound before the error surfaced.
        assert_eq!(env.binding_depth(), 0);
        assert!(env.symbol_value(x).is_err());
    }

    #[test]
    fn unwind_protect_runs_on_normal_unbind() {
        let mut env = Env::new();
        // The handler inserts "U" into the current buffer.
        let marker_text = env.make_string("U");
        let hbytes = env.make_unibyte_string(&[C0, Opcode::Insert as u8, RETURN]);
        let hconst = env.make_vector(&[marker_text]);
        let handler = env
            .make_byte_code(Value::int(0), hbytes, hconst, Value::int(1))
            .unwrap();
        let handler_sym = env.intern("exec-test-cleanup");
        env.fset(handler_sym, handler).unwrap();

        let bytes = [
            C0,
            Opcode::UnwindProtect as u8,
            Opcode::Unbind1 as u8,
            C1,
            RETURN,
        ];
        let result = run(&mut env, &bytes, &[handler_sym, Value::int(3)], 1).unwrap();
        assert_eq!(result, Value::int(3));
        let text = env.buffer_substring(env.point_min(), env.point_max()).unwrap();
        assert_eq!(env.format_value(text), "\"U\"");
    }

    #[test]
    fn unwind_protect_runs_when_an_error_unwinds_the_frame() {
        let mut env = Env::new();
        let marker_text = env.make_string("U");
        let hbytes = env.make_unibyte_string(&[C0, Opcode::Insert as u8, RETURN]);
        let hconst = env.make_vector(&[marker_text]);
        let handler = env
            .make_byte_code(Value::int(0), hbytes, hconst, Value::int(1))
            .unwrap();
        let handler_sym = env.intern("exec-test-cleanup-2");
        env.fset(handler_sym, handler).unwrap();

        // Install the unwind-protect, then divide by zero.
        let div = env.intern("/");
        let bytes = [
            C0,
            Opcode::UnwindProtect as u8,
            C1,
            C2,
            C3,
            Opcode::Call2 as u8,
            RETURN,
        ];
        let err = run(
            &mut env,
            &bytes,
            &[handler_sym, div, Value::int(1), Value::int(0)],
            4,
        )
        .unwrap_err();
        assert_eq!(signal_symbol(err), Q::ArithError.sym());
        let text = env.buffer_substring(env.point_min(), env.point_max()).unwrap();
        assert_eq!(env.format_value(text), "\"U\"");
        assert_eq!(env.binding_depth(), 0);
    }

    // -- stack opcodes -----------------------------------------------------

    #[test]
    fn stack_ref_and_stack_set() {
        let mut env = Env::new();
        let consts = [Value::int(1), Value::int(2)];
        let result = run(&mut env, &[C0, C1, Opcode::StackRef1 as u8, RETURN], &consts, 3).unwrap();
        assert_eq!(result, Value::int(1));
        let result = run(&mut env, &[C0, C1, Opcode::StackSet as u8, 1, RETURN], &consts, 2).unwrap();
        assert_eq!(result, Value::int(2));
    }

    #[test]
    fn discard_n_with_preserve_tos_bit() {
        let mut env = Env::new();
        let consts = [Value::int(1), Value::int(2), Value::int(3)];
        let bytes = [C0, C1, C2, Opcode::DiscardN as u8, 0x82, RETURN];
        let result = run(&mut env, &bytes, &consts, 3).unwrap();
        assert_eq!(result, Value::int(3));
        // n & 0x7F == 0 with the bit set: a no-op.
        let bytes = [C0, Opcode::DiscardN as u8, 0x80, RETURN];
        let result = run(&mut env, &bytes, &consts, 1).unwrap();
        assert_eq!(result, Value::int(1));
    }

    #[test]
    fn constant_fast_path_covers_the_whole_range() {
        // Every opcode in [CONSTANT_BASE, 255] pushes its constant.
        let constants: Vec<Value> = (0..64).map(Value::int).collect();
        for idx in 0..64u8 {
            let mut env = Env::new();
            let bytes = [CONSTANT_BASE + idx, RETURN];
            let result = run(&mut env, &bytes, &constants, 1).unwrap();
            assert_eq!(result, Value::int(i64::from(idx)));
        }
    }

    #[test]
    fn constant2_reaches_beyond_the_inline_range() {
        let constants: Vec<Value> = (0..300).map(Value::int).collect();
        let mut env = Env::new();
        let bytes = [Opcode::Constant2 as u8, 0x2C, 0x01, RETURN]; // 300 little-endian
        let result = run(&mut env, &bytes, &constants, 1).unwrap();
        assert_eq!(result, Value::int(299));
    }

    // -- errors ------------------------------------------------------------

    #[test]
    fn invalid_opcode_reports_opcode_and_offset() {
        let mut env = Env::new();
        let err = run(&mut env, &[0, RETURN], &[], 1).unwrap_err();
        let RunError::Signal { symbol, data } = err else {
            panic!("expected a signal")
        };
        assert_eq!(symbol, Q::Error.sym());
        assert_eq!(env.format_value(data), "(\"Invalid byte opcode: op=0, ptr=0\")");
    }

    #[test]
    fn running_off_the_end_is_an_error_not_a_crash() {
        let mut env = Env::new();
        let err = run(&mut env, &[C0], &[Value::int(1)], 1).unwrap_err();
        assert_eq!(signal_symbol(err), Q::Error.sym());
    }

    #[test]
    fn jump_out_of_range_is_an_error() {
        let mut env = Env::new();
        let bytes = [Opcode::Goto as u8, 200, 0, RETURN];
        let err = run(&mut env, &bytes, &[], 1).unwrap_err();
        assert_eq!(signal_symbol(err), Q::Error.sym());
    }

    #[cfg(feature = "strict-bytecode")]
    #[test]
    fn strict_mode_refuses_obsolete_opcodes() {
        let mut env = Env::new();
        let err = run(&mut env, &[Opcode::SaveCurrentBuffer as u8, C0, RETURN], &[Value::T], 1).unwrap_err();
        assert_eq!(signal_symbol(err), Q::Error.sym());
    }

    #[cfg(not(feature = "strict-bytecode"))]
    #[test]
    fn obsolete_set_mark_always_signals() {
        let mut env = Env::new();
        let err = run(&mut env, &[Opcode::SetMark as u8, RETURN], &[], 1).unwrap_err();
        let RunError::Signal { data, .. } = err else {
            panic!("expected a signal")
        };
        assert_eq!(env.format_value(data), "(\"set-mark is an obsolete bytecode\")");
    }

    // -- the quit gate -----------------------------------------------------

    #[test]
    fn pending_quit_fires_at_a_taken_branch() {
        let mut env = Env::new();
        env.request_quit();
        let bytes = [
            C0,
            Opcode::Sub1 as u8,
            Opcode::Dup as u8,
            Opcode::GotoIfNonNil as u8,
            1,
            0,
            RETURN,
        ];
        let err = run(&mut env, &bytes, &[Value::int(100)], 2).unwrap_err();
        assert_eq!(signal_symbol(err), Q::Quit.sym());
        assert!(env.frames.is_empty());
    }

    #[test]
    fn inhibit_quit_suppresses_the_gate() {
        let mut env = Env::new();
        env.request_quit();
        env.set_raw_symbol_value(Q::InhibitQuit.id(), Value::T);
        let bytes = [
            C0,
            Opcode::Sub1 as u8,
            Opcode::Dup as u8,
            Opcode::GotoIfNonNil as u8,
            1,
            0,
            RETURN,
        ];
        let result = run(&mut env, &bytes, &[Value::int(100)], 2).unwrap();
        assert_eq!(result, Value::int(0));
        env.set_raw_symbol_value(Q::InhibitQuit.id(), Value::NIL);
        env.set_raw_symbol_value(Q::QuitFlag.id(), Value::NIL);
    }

    // -- collection and relocation -----------------------------------------

    #[test]
    fn collection_during_execution_preserves_the_fetch_stream() {
        let mut env = Env::new();
        // Unrooted garbage so the sweep frees something and the compactor
        // moves string storage.
        for _ in 0..100 {
            env.cons(Value::NIL, Value::NIL);
        }
        let gc = env.intern("garbage-collect");
        let bytes = [
            C0,
            Opcode::Call0 as u8,
            Opcode::Discard as u8,
            C1,
            RETURN,
        ];
        let collections_before = env.heap_stats().collections;
        let result = run(&mut env, &bytes, &[gc, Value::int(7)], 2).unwrap();
        assert_eq!(result, Value::int(7));
        assert!(env.heap_stats().collections > collections_before);
    }

    #[test]
    fn relocation_preserves_the_pc_offset() {
        let mut env = Env::new();
        let bytes = env.make_unibyte_string(&[C0, C1, Opcode::Plus as u8, RETURN]);
        let constants = env.make_vector(&[Value::int(1), Value::int(2)]);
        let b = env.check_byte_string(bytes).unwrap();
        let c = env.check_vector(constants).unwrap();
        let fi = env.push_frame(b, c, 2);

        // Advance the pc by two fetches, as if mid-execution.
        let mut cursor = env.frames[fi].cursor();
        assert_eq!(cursor.fetch(), Some(C0));
        assert_eq!(cursor.fetch(), Some(C1));
        env.frames[fi].pc = cursor.pc_ptr();

        // A collection with garbage compacts string storage.
        env.cons(Value::NIL, Value::NIL);
        env.garbage_collect();

        let frame = &env.frames[fi];
        let offset = frame.pc as usize - frame.start as usize;
        assert_eq!(offset, 2);
        let mut cursor = env.frames[fi].cursor();
        assert_eq!(cursor.fetch(), Some(Opcode::Plus as u8));
        env.frames.pop();
    }

    // -- editor opcodes ----------------------------------------------------

    #[test]
    fn insert_and_point_opcodes() {
        let mut env = Env::new();
        let hello = env.make_string("hi");
        let bytes = [C0, Opcode::Insert as u8, Opcode::Discard as u8, Opcode::Point as u8, RETURN];
        let result = run(&mut env, &bytes, &[hello], 2).unwrap();
        assert_eq!(result, Value::int(3));
    }

    #[test]
    fn save_excursion_restores_point_on_unbind() {
        let mut env = Env::new();
        let text = env.make_string("hello");
        env.insert(&[text]).unwrap();
        env.goto_char(Value::int(2)).unwrap();
        // save-excursion, goto-char 5, unbind, point
        let bytes = [
            Opcode::SaveExcursion as u8,
            C0,
            Opcode::GotoChar as u8,
            Opcode::Discard as u8,
            Opcode::Unbind1 as u8,
            Opcode::Point as u8,
            RETURN,
        ];
        let result = run(&mut env, &bytes, &[Value::int(5)], 2).unwrap();
        assert_eq!(result, Value::int(2));
        assert_eq!(env.point(), Value::int(2));
    }

    #[test]
    fn save_restriction_restores_narrowing() {
        let mut env = Env::new();
        let text = env.make_string("hello world");
        env.insert(&[text]).unwrap();
        // save-restriction, narrow 1..5, unbind, point-max
        let bytes = [
            Opcode::SaveRestriction as u8,
            C0,
            C1,
            Opcode::NarrowToRegion as u8,
            Opcode::Discard as u8,
            Opcode::Unbind1 as u8,
            Opcode::PointMax as u8,
            RETURN,
        ];
        let result = run(&mut env, &bytes, &[Value::int(1), Value::int(5)], 3).unwrap();
        assert_eq!(result, Value::int(12));
    }

    // -- arithmetic fast paths ---------------------------------------------

    #[test]
    fn inline_increment_and_float_comparison() {
        let mut env = Env::new();
        let result = run(&mut env, &[C0, Opcode::Add1 as u8, RETURN], &[Value::int(41)], 1).unwrap();
        assert_eq!(result, Value::int(42));
        let consts = [Value::int(1), Value::Float(1.0)];
        let result = run(&mut env, &[C0, C1, Opcode::Eqlsign as u8, RETURN], &consts, 2).unwrap();
        assert_eq!(result, Value::T);
    }

    // -- metering ----------------------------------------------------------

    #[test]
    fn opcode_meter_counts_dispatches() {
        let mut env = Env::with_tracer(OpcodeMeter::new());
        let bytes = [C0, C1, Opcode::Plus as u8, RETURN];
        let b = env.make_unibyte_string(&bytes);
        let c = env.make_vector(&[Value::int(3), Value::int(4)]);
        env.byte_code(b, c, Value::int(2)).unwrap();
        assert_eq!(env.tracer.count(Opcode::Plus as u8), 1);
        assert_eq!(env.tracer.count(C0), 1);
        assert_eq!(env.tracer.pair_count(C0, C1), 1);
        assert_eq!(env.tracer.pair_count(Opcode::Plus as u8, RETURN), 1);
    }

    // -- nested execution --------------------------------------------------

    #[test]
    fn bytecode_function_calls_bytecode_function() {
        let mut env = Env::new();
        // Inner: one mandatory arg, returns arg + 1.
        let ibytes = env.make_unibyte_string(&[Opcode::Add1 as u8, RETURN]);
        let iconst = env.make_vector(&[]);
        let itemplate = Value::int(1 << 8 | 1);
        let inner = env.make_byte_code(itemplate, ibytes, iconst, Value::int(2)).unwrap();
        let inner_sym = env.intern("exec-test-inc");
        env.fset(inner_sym, inner).unwrap();

        // Outer: (exec-test-inc 41)
        let bytes = [C0, C1, Opcode::Call1 as u8, RETURN];
        let result = run(&mut env, &bytes, &[inner_sym, Value::int(41)], 2).unwrap();
        assert_eq!(result, Value::int(42));
    }

    #[test]
    fn throw_from_nested_frame_reaches_outer_catch() {
        let mut env = Env::new();
        let tag = env.intern("nested-tag");
        // Inner function throws to the tag.
        let throw = env.intern("throw");
        let ibytes = env.make_unibyte_string(&[C0, C1, C2, Opcode::Call2 as u8, RETURN]);
        let iconst = env.make_vector(&[throw, tag, Value::int(77)]);
        let inner = env.make_byte_code(Value::int(0), ibytes, iconst, Value::int(3)).unwrap();
        let inner_sym = env.intern("exec-test-thrower");
        env.fset(inner_sym, inner).unwrap();

        // Outer: catch tag, call inner, land at Return.
        let bytes = [
            C0,
            Opcode::PushCatch as u8,
            7,
            0,
            C1,
            Opcode::Call0 as u8,
            RETURN,
            RETURN,
        ];
        let result = run(&mut env, &bytes, &[tag, inner_sym], 3).unwrap();
        assert_eq!(result, Value::int(77));
        assert!(env.handlers.is_empty());
        assert!(env.frames.is_empty());
    }

    #[test]
    fn native_handle_routes_around_the_dispatch_loop() {
        fn double(env: &mut Env, args: &[Value]) -> RunResult<Value> {
            env.arith_add(args[0], args[0])
        }
        let mut env = Env::new();
        let native = env.register_native(double);
        let bytes = env.make_unibyte_string(&[RETURN]);
        let constants = env.make_vector(&[]);
        let template = Value::int(1 << 8 | 1);
        let code = env.make_byte_code(template, bytes, constants, Value::int(1)).unwrap();
        env.set_code_native(code, native).unwrap();
        let result = env.execute(code, template, &[Value::int(21)]).unwrap();
        assert_eq!(result, Value::int(42));
    }

    #[test]
    fn throw_subr_without_catcher_escapes_the_facade() {
        let mut env = Env::new();
        let err = env
            .funcall(Value::Subr(Subr::Throw), &[Value::int(1), Value::int(2)])
            .unwrap_err();
        assert!(matches!(err, RunError::Throw { .. }));
    }

    // -- write traps and buffer-locals -------------------------------------

    #[test]
    fn watcher_trap_routes_varset_through_the_generic_path() {
        let mut env = Env::new();
        let x = env.intern("exec-test-watched");
        // Any callable works as a watcher; `list` accepts the three
        // notification arguments and ignores them.
        env.add_variable_watcher(x, Value::Subr(Subr::List)).unwrap();
        let bytes = [C1, Opcode::VarSet0 as u8, C1, RETURN];
        let result = run(&mut env, &bytes, &[x, Value::int(6)], 1).unwrap();
        assert_eq!(result, Value::int(6));
        assert_eq!(env.symbol_value(x).unwrap(), Value::int(6));

        // A watcher that rejects its arguments turns the write into an
        // error before the store happens.
        let y = env.intern("exec-test-watched-2");
        env.add_variable_watcher(y, Value::Subr(Subr::Car)).unwrap();
        let bytes = [C1, Opcode::VarSet0 as u8, C1, RETURN];
        let err = run(&mut env, &bytes, &[y, Value::int(6)], 1).unwrap_err();
        assert_eq!(signal_symbol(err), Q::WrongNumberOfArguments.sym());
        assert!(env.symbol_value(y).is_err());
    }

    #[test]
    fn varref_finds_buffer_local_values_through_the_generic_path() {
        let mut env = Env::new();
        let x = env.intern("exec-test-local");
        env.set_symbol_value(x, Value::int(1)).unwrap();
        env.make_local_variable(x).unwrap();
        env.set_symbol_value(x, Value::int(2)).unwrap();
        let result = run(&mut env, &[Opcode::VarRef0 as u8, RETURN], &[x], 1).unwrap();
        assert_eq!(result, Value::int(2));
        let other = env.get_buffer_create("exec-test-other");
        env.set_buffer(other).unwrap();
        let result = run(&mut env, &[Opcode::VarRef0 as u8, RETURN], &[x], 1).unwrap();
        assert_eq!(result, Value::int(1));
    }

    // -- obsolete opcode compatibility -------------------------------------

    #[cfg(not(feature = "strict-bytecode"))]
    #[test]
    fn legacy_catch_opcode_catches_a_thrown_body() {
        let mut env = Env::new();
        let tag = env.intern("legacy-tag");
        let throw = env.intern("throw");
        // The body thunk throws 5 to the tag.
        let tbytes = env.make_unibyte_string(&[C0, C1, C2, Opcode::Call2 as u8, RETURN]);
        let tconst = env.make_vector(&[throw, tag, Value::int(5)]);
        let thunk = env.make_byte_code(Value::int(0), tbytes, tconst, Value::int(3)).unwrap();
        let thunk_sym = env.intern("legacy-thrower");
        env.fset(thunk_sym, thunk).unwrap();

        let bytes = [C0, C1, Opcode::Catch as u8, RETURN];
        let result = run(&mut env, &bytes, &[tag, thunk_sym], 2).unwrap();
        assert_eq!(result, Value::int(5));
    }

    #[cfg(not(feature = "strict-bytecode"))]
    #[test]
    fn legacy_temp_output_buffer_pair_balances_bindings() {
        let mut env = Env::new();
        let name = env.make_string("*output*");
        let bytes = [
            C0,
            Opcode::TempOutputBufferSetup as u8,
            C1,
            Opcode::TempOutputBufferShow as u8,
            RETURN,
        ];
        let result = run(&mut env, &bytes, &[name, Value::int(5)], 2).unwrap();
        assert_eq!(result, Value::int(5));
        assert_eq!(env.binding_depth(), 0);
        // standard-output was rebound for the body and restored after.
        assert_eq!(env.raw_symbol_value(Q::StandardOutput.id()), Value::NIL);
    }

    #[cfg(not(feature = "strict-bytecode"))]
    #[test]
    fn legacy_unbind_all_rewinds_to_frame_entry() {
        let mut env = Env::new();
        let x = env.intern("exec-test-unbind-all");
        let bytes = [
            C1,
            Opcode::VarBind0 as u8,
            C1,
            Opcode::VarBind0 as u8,
            Opcode::UnbindAll as u8,
            C1,
            RETURN,
        ];
        let result = run(&mut env, &bytes, &[x, Value::int(4)], 2).unwrap();
        assert_eq!(result, Value::int(4));
        assert_eq!(env.binding_depth(), 0);
        assert!(env.symbol_value(x).is_err());
    }

    #[cfg(feature = "exec-checks")]
    #[test]
    #[should_panic(expected = "operand stack out of range")]
    fn stack_range_check_aborts_on_miscompiled_depth() {
        let mut env = Env::new();
        // Declared depth 1, but the program pushes two values.
        let bytes = [C0, C0, Opcode::Plus as u8, RETURN];
        let _ = run(&mut env, &bytes, &[Value::int(1)], 1);
    }
}
