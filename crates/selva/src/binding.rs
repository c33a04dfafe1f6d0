//! Dynamic variables and the binding stack.
//!
//! Symbol value cells come in three shapes: plain, aliased, and
//! buffer-local. The byte interpreter's VARREF/VARSET fast paths handle only
//! bound plain cells without write traps; everything else routes through
//! the generic accessors here, which follow alias chains, consult
//! buffer-local bindings, and notify variable watchers.
//!
//! The binding stack (`specpdl`) is a process-wide LIFO of scoped
//! rebindings and deferred unwind actions. `unwind_to` pops entries back to
//! a recorded depth, running each popped entry's action in LIFO order; the
//! dispatch loop records the depth on frame entry and the UNBIND opcode and
//! every non-local exit restore it.

use crate::{
    buffer::BufferId,
    env::Env,
    error::RunResult,
    heap::HeapData,
    intern::{BufferedCell, Q, SymbolCell, SymbolId},
    tracer::ExecTracer,
    value::Value,
};

/// Limit on alias/function indirection chains before declaring a cycle.
const INDIRECTION_LIMIT: usize = 64;

/// What a `Let` entry must restore on unwind.
#[derive(Debug, Clone, Copy)]
pub(crate) enum LetSaved {
    /// Restore a plain value cell.
    Plain(Value),
    /// Restore the default slot of a buffer-local cell.
    Default(Value),
    /// Restore one buffer's local slot of a buffer-local cell.
    Local { buffer: BufferId, old: Value },
}

/// A deferred unwind action.
#[derive(Debug, Clone, Copy)]
pub(crate) enum UnwindAction {
    /// Call a function with no arguments.
    CallFn(Value),
    /// Run a body: a function is called with no arguments; a list is
    /// treated as a sequence of zero-argument thunks.
    Body(Value),
    /// Restore the current buffer and its point.
    Excursion { buffer: BufferId, point: usize },
    /// Restore a buffer's narrowing bounds.
    Restriction { buffer: BufferId, begv: usize, zv: usize },
    /// Restore the current buffer only.
    CurrentBuffer(BufferId),
}

/// One binding-stack entry.
#[derive(Debug, Clone, Copy)]
pub(crate) enum SpecEntry {
    Let { symbol: SymbolId, saved: LetSaved },
    Unwind(UnwindAction),
}

impl SpecEntry {
    pub(crate) fn gc_roots(&self, roots: &mut Vec<Value>) {
        match self {
            Self::Let { saved, .. } => match saved {
                LetSaved::Plain(v) | LetSaved::Default(v) | LetSaved::Local { old: v, .. } => {
                    roots.push(*v);
                }
            },
            Self::Unwind(action) => match action {
                UnwindAction::CallFn(v) | UnwindAction::Body(v) => roots.push(*v),
                UnwindAction::Excursion { .. }
                | UnwindAction::Restriction { .. }
                | UnwindAction::CurrentBuffer(_) => {}
            },
        }
    }
}

impl<Tr: ExecTracer> Env<Tr> {
    // ---- symbol values ---------------------------------------------------

    /// Follows alias redirects to the symbol whose cell actually holds the
    /// value. Fails with `cyclic-variable-indirection` on a loop.
    pub(crate) fn resolve_variable(&mut self, symbol: SymbolId) -> RunResult<SymbolId> {
        let mut current = symbol;
        for _ in 0..INDIRECTION_LIMIT {
            match self.symbols.get(current).cell {
                SymbolCell::Alias(next) => current = next,
                _ => return Ok(current),
            }
        }
        let data = self.cons(Value::Sym(symbol), Value::NIL);
        Err(crate::error::RunError::Signal {
            symbol: Q::CyclicVariableIndirection.sym(),
            data,
        })
    }

    /// The generic variable read: alias chains, buffer-local lookup, void
    /// check. This is the slow path behind the VARREF opcode.
    pub fn symbol_value(&mut self, v: Value) -> RunResult<Value> {
        let Value::Sym(symbol) = v else {
            return Err(self.wrong_type(Q::Symbolp, v));
        };
        let target = self.resolve_variable(symbol)?;
        let value = self.raw_symbol_value(target);
        if value == Value::Unbound {
            return Err(self.void_variable(symbol));
        }
        Ok(value)
    }

    /// Reads the resolved cell without alias following or void checks.
    /// Returns `Unbound` for a void cell.
    pub(crate) fn raw_symbol_value(&self, symbol: SymbolId) -> Value {
        match &self.symbols.get(symbol).cell {
            SymbolCell::Plain(v) => *v,
            SymbolCell::Alias(_) => Value::Unbound,
            SymbolCell::Buffered(cell) => {
                let current = self.buffers.current();
                cell.locals.get(&current).copied().unwrap_or(cell.default)
            }
        }
    }

    /// Stores without alias following, watcher notification, or constant
    /// checks. Bootstrap and the fast VARSET path use this.
    pub(crate) fn set_raw_symbol_value(&mut self, symbol: SymbolId, value: Value) {
        let current = self.buffers.current();
        match &mut self.symbols.get_mut(symbol).cell {
            SymbolCell::Plain(v) => *v = value,
            cell @ SymbolCell::Alias(_) => *cell = SymbolCell::Plain(value),
            SymbolCell::Buffered(cell) => {
                if let Some(local) = cell.locals.get_mut(&current) {
                    *local = value;
                } else {
                    cell.default = value;
                }
            }
        }
    }

    /// The generic variable write: alias chains, constant check, watcher
    /// notification, buffer-local routing. The slow path behind VARSET.
    pub fn set_symbol_value(&mut self, v: Value, value: Value) -> RunResult<()> {
        let Value::Sym(symbol) = v else {
            return Err(self.wrong_type(Q::Symbolp, v));
        };
        let target = self.resolve_variable(symbol)?;
        if self.symbols.get(target).constant {
            return Err(self.setting_constant(symbol));
        }
        self.notify_watchers(target, value, Q::Set)?;
        self.set_raw_symbol_value(target, value);
        Ok(())
    }

    /// Makes `symbol` an alias for `target`.
    pub fn defvaralias(&mut self, symbol: Value, target: Value) -> RunResult<()> {
        let (Value::Sym(sym), Value::Sym(tgt)) = (symbol, target) else {
            let bad = if symbol.is_symbol() { target } else { symbol };
            return Err(self.wrong_type(Q::Symbolp, bad));
        };
        if self.symbols.get(sym).constant {
            return Err(self.setting_constant(sym));
        }
        self.symbols.get_mut(sym).cell = SymbolCell::Alias(tgt);
        Ok(())
    }

    /// Gives `symbol` a buffer-local value in the current buffer, promoting
    /// a plain cell to the buffer-local shape on first use.
    pub fn make_local_variable(&mut self, symbol: Value) -> RunResult<()> {
        let Value::Sym(sym) = symbol else {
            return Err(self.wrong_type(Q::Symbolp, symbol));
        };
        let target = self.resolve_variable(sym)?;
        if self.symbols.get(target).constant {
            return Err(self.setting_constant(sym));
        }
        let current = self.buffers.current();
        let cell = &mut self.symbols.get_mut(target).cell;
        match cell {
            SymbolCell::Plain(default) => {
                let default = *default;
                let mut buffered = BufferedCell {
                    default,
                    locals: ahash::AHashMap::new(),
                };
                buffered.locals.insert(current, default);
                *cell = SymbolCell::Buffered(buffered);
            }
            SymbolCell::Buffered(buffered) => {
                let default = buffered.default;
                buffered.locals.entry(current).or_insert(default);
            }
            SymbolCell::Alias(_) => unreachable!("alias resolved above"),
        }
        Ok(())
    }

    /// Registers a watcher function; its presence is the symbol's write
    /// trap. Watchers are called as `(watcher symbol newval operation)`.
    pub fn add_variable_watcher(&mut self, symbol: Value, watcher: Value) -> RunResult<()> {
        let Value::Sym(sym) = symbol else {
            return Err(self.wrong_type(Q::Symbolp, symbol));
        };
        let target = self.resolve_variable(sym)?;
        self.symbols.get_mut(target).watchers.push(watcher);
        Ok(())
    }

    fn notify_watchers(&mut self, symbol: SymbolId, newval: Value, operation: Q) -> RunResult<()> {
        if self.symbols.get(symbol).watchers.is_empty() {
            return Ok(());
        }
        // Watchers run arbitrary code; pin the new value while they do.
        self.protect(newval);
        let mut i = 0;
        let result = loop {
            let watcher = {
                let watchers = &self.symbols.get(symbol).watchers;
                if i >= watchers.len() {
                    break Ok(());
                }
                watchers[i]
            };
            let args = [Value::Sym(symbol), newval, operation.sym()];
            if let Err(e) = self.funcall(watcher, &args) {
                break Err(e);
            }
            i += 1;
        };
        self.unprotect(1);
        result
    }

    // ---- binding stack ---------------------------------------------------

    /// The observable binding-stack depth.
    #[inline]
    #[must_use]
    pub fn binding_depth(&self) -> usize {
        self.specpdl.len()
    }

    /// Rebinds `symbol` to `value`, recording the old state for unwinding.
    ///
    /// A buffer-local symbol with a local binding in the current buffer gets
    /// its local slot rebound; otherwise the default slot is rebound.
    pub fn specbind(&mut self, symbol: SymbolId, value: Value) -> RunResult<()> {
        let target = self.resolve_variable(symbol)?;
        if self.symbols.get(target).constant {
            return Err(self.setting_constant(symbol));
        }
        let current = self.buffers.current();
        let saved = match &self.symbols.get(target).cell {
            SymbolCell::Plain(old) => LetSaved::Plain(*old),
            SymbolCell::Buffered(cell) => match cell.locals.get(&current) {
                Some(old) => LetSaved::Local {
                    buffer: current,
                    old: *old,
                },
                None => LetSaved::Default(cell.default),
            },
            SymbolCell::Alias(_) => unreachable!("alias resolved above"),
        };
        self.specpdl.push(SpecEntry::Let { symbol: target, saved });
        self.notify_watchers(target, value, Q::Let)?;
        self.store_let(target, saved, value);
        Ok(())
    }

    /// Pushes a deferred unwind action.
    pub(crate) fn record_unwind(&mut self, action: UnwindAction) {
        self.specpdl.push(SpecEntry::Unwind(action));
    }

    /// Pops the binding stack down to `depth`, running each popped entry's
    /// unwind action in LIFO order. An error raised by an unwind action
    /// propagates once the entry has been popped, so unwinding never
    /// re-runs an action.
    pub fn unwind_to(&mut self, depth: usize) -> RunResult<()> {
        while self.specpdl.len() > depth {
            let entry = self.specpdl.pop().expect("binding stack underflow");
            match entry {
                SpecEntry::Let { symbol, saved } => {
                    let old = match saved {
                        LetSaved::Plain(v) | LetSaved::Default(v) | LetSaved::Local { old: v, .. } => v,
                    };
                    self.notify_watchers(symbol, old, Q::Unlet)?;
                    self.store_let(symbol, saved, old);
                }
                SpecEntry::Unwind(action) => self.run_unwind_action(action)?,
            }
        }
        Ok(())
    }

    fn store_let(&mut self, symbol: SymbolId, saved: LetSaved, value: Value) {
        match (&mut self.symbols.get_mut(symbol).cell, saved) {
            (SymbolCell::Plain(slot), LetSaved::Plain(_)) => *slot = value,
            (SymbolCell::Buffered(cell), LetSaved::Default(_)) => cell.default = value,
            (SymbolCell::Buffered(cell), LetSaved::Local { buffer, .. }) => {
                cell.locals.insert(buffer, value);
            }
            // The cell shape changed while the binding was live (e.g. a
            // make-local-variable in between); restore as best we can.
            (SymbolCell::Plain(slot), _) => *slot = value,
            (SymbolCell::Buffered(cell), LetSaved::Plain(_)) => cell.default = value,
            (cell @ SymbolCell::Alias(_), _) => *cell = SymbolCell::Plain(value),
        }
    }

    fn run_unwind_action(&mut self, action: UnwindAction) -> RunResult<()> {
        match action {
            UnwindAction::CallFn(f) => {
                self.protect(f);
                let result = self.funcall(f, &[]);
                self.unprotect(1);
                result.map(|_| ())
            }
            UnwindAction::Body(body) => {
                self.protect(body);
                let result = self.run_body(body);
                self.unprotect(1);
                result.map(|_| ())
            }
            UnwindAction::Excursion { buffer, point } => {
                self.buffers.set_current(buffer);
                self.buffers.current_mut().set_point(point);
                Ok(())
            }
            UnwindAction::Restriction { buffer, begv, zv } => {
                self.buffers.get_mut(buffer).restore_restriction(begv, zv);
                Ok(())
            }
            UnwindAction::CurrentBuffer(buffer) => {
                self.buffers.set_current(buffer);
                Ok(())
            }
        }
    }

    /// Runs an unwind-protect body value: a function is funcalled with no
    /// arguments; a list is run as a sequence of zero-argument thunks.
    pub(crate) fn run_body(&mut self, body: Value) -> RunResult<Value> {
        if self.functionp(body) {
            return self.funcall(body, &[]);
        }
        let mut result = Value::NIL;
        let mut tail = body;
        while let Value::Ref(id) = tail {
            let HeapData::Cons(cell) = self.heap.get(id) else { break };
            let (thunk, rest) = (cell.car, cell.cdr);
            result = self.funcall(thunk, &[])?;
            tail = rest;
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn env() -> Env {
        Env::new()
    }

    #[test]
    fn specbind_restores_on_unwind() {
        let mut env = env();
        let x = env.symbols.intern("x");
        env.set_raw_symbol_value(x, Value::int(1));
        let depth = env.binding_depth();
        env.specbind(x, Value::int(2)).unwrap();
        assert_eq!(env.raw_symbol_value(x), Value::int(2));
        env.unwind_to(depth).unwrap();
        assert_eq!(env.raw_symbol_value(x), Value::int(1));
    }

    #[test]
    fn specbind_of_void_variable_restores_void() {
        let mut env = env();
        let x = env.symbols.intern("x");
        let depth = env.binding_depth();
        env.specbind(x, Value::int(2)).unwrap();
        env.unwind_to(depth).unwrap();
        assert_eq!(env.raw_symbol_value(x), Value::Unbound);
    }

    #[test]
    fn nested_bindings_unwind_in_lifo_order() {
        let mut env = env();
        let x = env.symbols.intern("x");
        let depth = env.binding_depth();
        env.specbind(x, Value::int(1)).unwrap();
        env.specbind(x, Value::int(2)).unwrap();
        env.specbind(x, Value::int(3)).unwrap();
        assert_eq!(env.raw_symbol_value(x), Value::int(3));
        env.unwind_to(depth + 2).unwrap();
        assert_eq!(env.raw_symbol_value(x), Value::int(2));
        env.unwind_to(depth).unwrap();
        assert_eq!(env.raw_symbol_value(x), Value::Unbound);
    }

    #[test]
    fn alias_chain_resolves_to_base() {
        let mut env = env();
        let base = env.intern("base");
        let alias = env.intern("alias");
        env.defvaralias(alias, base).unwrap();
        env.set_symbol_value(alias, Value::int(7)).unwrap();
        assert_eq!(env.symbol_value(base).unwrap(), Value::int(7));
        assert_eq!(env.symbol_value(alias).unwrap(), Value::int(7));
    }

    #[test]
    fn alias_cycle_is_detected() {
        let mut env = env();
        let a = env.intern("a");
        let b = env.intern("b");
        env.defvaralias(a, b).unwrap();
        env.defvaralias(b, a).unwrap();
        let err = env.symbol_value(a).unwrap_err();
        assert!(matches!(
            err,
            crate::error::RunError::Signal { symbol, .. }
                if symbol == Q::CyclicVariableIndirection.sym()
        ));
    }

    #[test]
    fn setting_nil_signals_setting_constant() {
        let mut env = env();
        let err = env.set_symbol_value(Value::NIL, Value::int(1)).unwrap_err();
        assert!(matches!(
            err,
            crate::error::RunError::Signal { symbol, .. } if symbol == Q::SettingConstant.sym()
        ));
    }

    #[test]
    fn buffer_local_value_shadows_default() {
        let mut env = env();
        let x = env.intern("x");
        env.set_symbol_value(x, Value::int(10)).unwrap();
        env.make_local_variable(x).unwrap();
        env.set_symbol_value(x, Value::int(20)).unwrap();
        let other = env.buffers.get_or_create("other");
        env.buffers.set_current(other);
        assert_eq!(env.symbol_value(x).unwrap(), Value::int(10));
        let scratch = env.buffers.get_or_create("*scratch*");
        env.buffers.set_current(scratch);
        assert_eq!(env.symbol_value(x).unwrap(), Value::int(20));
    }
}
