//! The generic function-call path and the cooperative quit gate.
//!
//! Callees come in three shapes: built-in functions ([`Subr`]), compiled
//! code objects (dispatched back through the byte interpreter), and symbols
//! (resolved through their function cells, following indirection). `throw`
//! and `signal` are ordinary subrs, which is how a primitive can exit
//! non-locally out of the middle of a running frame.

use strum::{EnumIter, IntoStaticStr};

use crate::{
    env::Env,
    error::{RunError, RunResult},
    heap::HeapData,
    intern::Q,
    tracer::ExecTracer,
    value::Value,
};

/// Handle of a registered native translation of a code object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NativeId(u32);

impl NativeId {
    pub(crate) fn new(index: usize) -> Self {
        Self(u32::try_from(index).expect("native table index exceeds u32"))
    }

    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

/// A native translation: called by the entry façade in place of the
/// dispatch loop when a code object carries a handle.
pub type NativeFn<Tr> = fn(&mut Env<Tr>, &[Value]) -> RunResult<Value>;

/// Built-in functions, installed into symbol function cells at bootstrap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter, IntoStaticStr, strum::Display)]
#[strum(serialize_all = "kebab-case")]
pub enum Subr {
    Cons,
    Car,
    Cdr,
    List,
    Length,
    Memq,
    Member,
    Assq,
    Nth,
    Nthcdr,
    Setcar,
    Setcdr,
    Nreverse,
    Nconc,
    Equal,
    Eq,
    Not,
    #[strum(serialize = "+")]
    Plus,
    #[strum(serialize = "-")]
    Minus,
    #[strum(serialize = "*")]
    Times,
    #[strum(serialize = "/")]
    Quo,
    #[strum(serialize = "%")]
    Rem,
    #[strum(serialize = "1+")]
    Add1,
    #[strum(serialize = "1-")]
    Sub1,
    Max,
    Min,
    Throw,
    Signal,
    Error,
    Funcall,
    SymbolValue,
    Set,
    SymbolFunction,
    Fset,
    Get,
    Concat,
    Substring,
    Upcase,
    Downcase,
    CurrentBuffer,
    SetBuffer,
    GotoChar,
    Insert,
    Point,
    GarbageCollect,
}

impl<Tr: ExecTracer> Env<Tr> {
    /// Whether a value names something callable.
    pub(crate) fn functionp(&self, v: Value) -> bool {
        match v {
            Value::Subr(_) => true,
            Value::Ref(id) => matches!(self.heap.get(id), HeapData::Code(_)),
            Value::Sym(id) => !self.symbols.get(id).function.is_nil(),
            _ => false,
        }
    }

    /// Follows symbol function cells to the underlying function object.
    fn indirect_function(&mut self, f: Value) -> RunResult<Value> {
        let mut fun = f;
        for _ in 0..64 {
            let Value::Sym(id) = fun else {
                return Ok(fun);
            };
            let next = self.symbols.get(id).function;
            if next.is_nil() || next == Value::Unbound {
                return Err(self.void_function(fun));
            }
            fun = next;
        }
        let data = self.cons(f, Value::NIL);
        Err(RunError::Signal {
            symbol: Q::CyclicFunctionIndirection.sym(),
            data,
        })
    }

    /// The generic function-call path behind the CALL opcode.
    pub fn funcall(&mut self, f: Value, args: &[Value]) -> RunResult<Value> {
        if self.eval_depth >= self.max_eval_depth {
            return Err(self.error_msg("Lisp nesting exceeds maximum depth"));
        }
        self.eval_depth += 1;
        self.tracer.on_call(f, args.len());
        let result = self.funcall_inner(f, args);
        self.eval_depth -= 1;
        result
    }

    fn funcall_inner(&mut self, f: Value, args: &[Value]) -> RunResult<Value> {
        let fun = self.indirect_function(f)?;
        match fun {
            Value::Subr(subr) => self.call_subr(subr, args),
            Value::Ref(id) => match self.heap.get(id) {
                HeapData::Code(code) => {
                    let template = Value::Int(code.template);
                    self.execute(fun, template, args)
                }
                _ => Err(self.invalid_function(fun)),
            },
            _ => Err(self.invalid_function(fun)),
        }
    }

    /// Runs `body` with a catcher for `tag` established, the internal
    /// equivalent of the legacy `catch` opcode.
    pub(crate) fn call_with_catch(&mut self, tag: Value, body: Value) -> RunResult<Value> {
        match self.run_body(body) {
            Err(RunError::Throw { tag: thrown, value }) if thrown == tag => Ok(value),
            other => other,
        }
    }

    // ---- the quit gate ---------------------------------------------------

    /// The cooperative-interrupt gate, polled at every taken branch.
    ///
    /// Runs a deferred collection if one is requested; then, unless
    /// quitting is inhibited, turns a raised quit flag into a `quit` signal
    /// (or a throw, when `throw-on-input` matches the flag); otherwise
    /// drains pending signal callbacks.
    pub(crate) fn handle_quit(&mut self) -> RunResult<()> {
        if self.heap.gc_pending {
            self.garbage_collect();
        }
        let flag = self.raw_symbol_value(Q::QuitFlag.id());
        if !flag.is_nil() && flag != Value::Unbound {
            let inhibited = {
                let v = self.raw_symbol_value(Q::InhibitQuit.id());
                !v.is_nil() && v != Value::Unbound
            };
            if !inhibited {
                self.set_raw_symbol_value(Q::QuitFlag.id(), Value::NIL);
                let throw_on_input = self.raw_symbol_value(Q::ThrowOnInput.id());
                if throw_on_input == flag {
                    return Err(RunError::Throw {
                        tag: flag,
                        value: Value::T,
                    });
                }
                return Err(RunError::Signal {
                    symbol: Q::Quit.sym(),
                    data: Value::NIL,
                });
            }
        }
        if !self.pending_signals.is_empty() {
            let callbacks = std::mem::take(&mut self.pending_signals);
            for &callback in &callbacks {
                self.protect(callback);
            }
            let mut result = Ok(());
            for (i, &callback) in callbacks.iter().enumerate() {
                if let Err(e) = self.funcall(callback, &[]) {
                    // Requeue the callbacks not yet run.
                    self.pending_signals.extend_from_slice(&callbacks[i + 1..]);
                    result = Err(e);
                    break;
                }
            }
            self.unprotect(callbacks.len());
            return result;
        }
        Ok(())
    }

    // ---- subr dispatch ---------------------------------------------------

    fn call_subr(&mut self, subr: Subr, args: &[Value]) -> RunResult<Value> {
        match subr {
            Subr::Cons => {
                let [a, b] = self.fixed_args(subr, args)?;
                Ok(self.cons(a, b))
            }
            Subr::Car => {
                let [a] = self.fixed_args(subr, args)?;
                self.car(a)
            }
            Subr::Cdr => {
                let [a] = self.fixed_args(subr, args)?;
                self.cdr(a)
            }
            Subr::List => Ok(self.list(args)),
            Subr::Length => {
                let [a] = self.fixed_args(subr, args)?;
                self.length(a)
            }
            Subr::Memq => {
                let [a, b] = self.fixed_args(subr, args)?;
                self.memq(a, b)
            }
            Subr::Member => {
                let [a, b] = self.fixed_args(subr, args)?;
                self.member(a, b)
            }
            Subr::Assq => {
                let [a, b] = self.fixed_args(subr, args)?;
                self.assq(a, b)
            }
            Subr::Nth => {
                let [a, b] = self.fixed_args(subr, args)?;
                self.nth(a, b)
            }
            Subr::Nthcdr => {
                let [a, b] = self.fixed_args(subr, args)?;
                self.nthcdr(a, b)
            }
            Subr::Setcar => {
                let [a, b] = self.fixed_args(subr, args)?;
                self.setcar(a, b)
            }
            Subr::Setcdr => {
                let [a, b] = self.fixed_args(subr, args)?;
                self.setcdr(a, b)
            }
            Subr::Nreverse => {
                let [a] = self.fixed_args(subr, args)?;
                self.nreverse(a)
            }
            Subr::Nconc => {
                let mut result = Value::NIL;
                for &arg in args.iter().rev() {
                    result = self.nconc2(arg, result)?;
                }
                Ok(result)
            }
            Subr::Equal => {
                let [a, b] = self.fixed_args(subr, args)?;
                let eq = self.equal(a, b)?;
                Ok(Value::bool(eq))
            }
            Subr::Eq => {
                let [a, b] = self.fixed_args(subr, args)?;
                Ok(Value::bool(a == b))
            }
            Subr::Not => {
                let [a] = self.fixed_args(subr, args)?;
                Ok(Value::bool(a.is_nil()))
            }
            Subr::Plus => {
                let mut acc = Value::int(0);
                for &arg in args {
                    acc = self.arith_add(acc, arg)?;
                }
                Ok(acc)
            }
            Subr::Minus => match args {
                [] => Ok(Value::int(0)),
                [single] => self.arith_negate(*single),
                [first, rest @ ..] => {
                    let mut acc = *first;
                    for &arg in rest {
                        acc = self.arith_sub(acc, arg)?;
                    }
                    Ok(acc)
                }
            },
            Subr::Times => {
                let mut acc = Value::int(1);
                for &arg in args {
                    acc = self.arith_mul(acc, arg)?;
                }
                Ok(acc)
            }
            Subr::Quo => match args {
                [] => Err(self.subr_nargs_error(subr, args.len())),
                [single] => Ok(*single),
                [first, rest @ ..] => {
                    let mut acc = *first;
                    for &arg in rest {
                        acc = self.arith_div(acc, arg)?;
                    }
                    Ok(acc)
                }
            },
            Subr::Rem => {
                let [a, b] = self.fixed_args(subr, args)?;
                self.arith_rem(a, b)
            }
            Subr::Add1 => {
                let [a] = self.fixed_args(subr, args)?;
                self.arith_add1(a)
            }
            Subr::Sub1 => {
                let [a] = self.fixed_args(subr, args)?;
                self.arith_sub1(a)
            }
            Subr::Max => self.fold_extreme(subr, args, true),
            Subr::Min => self.fold_extreme(subr, args, false),
            Subr::Throw => {
                let [tag, value] = self.fixed_args(subr, args)?;
                Err(RunError::Throw { tag, value })
            }
            Subr::Signal => {
                let [symbol, data] = self.fixed_args(subr, args)?;
                Err(RunError::Signal { symbol, data })
            }
            Subr::Error => {
                // A formatting-free rendition: the first argument is the
                // message, the rest ride along as data.
                let data = self.list(args);
                Err(RunError::Signal {
                    symbol: Q::Error.sym(),
                    data,
                })
            }
            Subr::Funcall => match args {
                [f, rest @ ..] => self.funcall(*f, rest),
                [] => Err(self.subr_nargs_error(subr, 0)),
            },
            Subr::SymbolValue => {
                let [a] = self.fixed_args(subr, args)?;
                self.symbol_value(a)
            }
            Subr::Set => {
                let [sym, val] = self.fixed_args(subr, args)?;
                self.set_symbol_value(sym, val)?;
                Ok(val)
            }
            Subr::SymbolFunction => {
                let [a] = self.fixed_args(subr, args)?;
                self.symbol_function(a)
            }
            Subr::Fset => {
                let [sym, def] = self.fixed_args(subr, args)?;
                self.fset(sym, def)
            }
            Subr::Get => {
                let [sym, prop] = self.fixed_args(subr, args)?;
                Ok(self.get_property(sym, prop))
            }
            Subr::Concat => self.concat(args),
            Subr::Substring => match args {
                [s] => self.substring(*s, Value::NIL, Value::NIL),
                [s, from] => self.substring(*s, *from, Value::NIL),
                [s, from, to] => self.substring(*s, *from, *to),
                _ => Err(self.subr_nargs_error(subr, args.len())),
            },
            Subr::Upcase => {
                let [a] = self.fixed_args(subr, args)?;
                self.upcase(a)
            }
            Subr::Downcase => {
                let [a] = self.fixed_args(subr, args)?;
                self.downcase(a)
            }
            Subr::CurrentBuffer => Ok(self.current_buffer()),
            Subr::SetBuffer => {
                let [a] = self.fixed_args(subr, args)?;
                self.set_buffer(a)
            }
            Subr::GotoChar => {
                let [a] = self.fixed_args(subr, args)?;
                self.goto_char(a)
            }
            Subr::Insert => self.insert(args),
            Subr::Point => Ok(self.point()),
            Subr::GarbageCollect => {
                self.garbage_collect();
                Ok(Value::NIL)
            }
        }
    }

    fn fold_extreme(&mut self, subr: Subr, args: &[Value], want_max: bool) -> RunResult<Value> {
        let [first, rest @ ..] = args else {
            return Err(self.subr_nargs_error(subr, 0));
        };
        // Validate the first operand even when alone.
        self.coerce_number(*first)?;
        let mut acc = *first;
        for &arg in rest {
            acc = self.arith_extreme(acc, arg, want_max)?;
        }
        Ok(acc)
    }

    /// Exact-arity check that destructures into an array.
    fn fixed_args<const N: usize>(&mut self, subr: Subr, args: &[Value]) -> RunResult<[Value; N]> {
        match <[Value; N]>::try_from(args) {
            Ok(fixed) => Ok(fixed),
            Err(_) => Err(self.subr_nargs_error(subr, args.len())),
        }
    }

    fn subr_nargs_error(&mut self, subr: Subr, nargs: usize) -> RunError {
        let name = self.intern(subr.into());
        let data = self.list(&[name, Value::int(nargs as i64)]);
        RunError::Signal {
            symbol: Q::WrongNumberOfArguments.sym(),
            data,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn subrs_are_installed_in_function_cells() {
        let mut env = Env::new();
        let plus = env.intern("+");
        assert_eq!(env.symbol_function(plus).unwrap(), Value::Subr(Subr::Plus));
        let car = env.intern("car");
        assert_eq!(env.symbol_function(car).unwrap(), Value::Subr(Subr::Car));
    }

    #[test]
    fn funcall_through_symbol_indirection() {
        let mut env = Env::new();
        let plus = env.intern("+");
        let alias = env.intern("my-plus");
        env.fset(alias, plus).unwrap();
        let result = env.funcall(alias, &[Value::int(1), Value::int(2)]).unwrap();
        assert_eq!(result, Value::int(3));
    }

    #[test]
    fn funcall_of_undefined_symbol_fails() {
        let mut env = Env::new();
        let missing = env.intern("no-such-function");
        let err = env.funcall(missing, &[]).unwrap_err();
        assert!(matches!(
            err,
            RunError::Signal { symbol, .. } if symbol == Q::VoidFunction.sym()
        ));
    }

    #[test]
    fn throw_subr_raises() {
        let mut env = Env::new();
        let tag = env.intern("my-tag");
        let err = env
            .funcall(Value::Subr(Subr::Throw), &[tag, Value::int(5)])
            .unwrap_err();
        assert_eq!(
            err,
            RunError::Throw {
                tag,
                value: Value::int(5)
            }
        );
    }

    #[test]
    fn wrong_subr_arity_signals() {
        let mut env = Env::new();
        let err = env.funcall(Value::Subr(Subr::Car), &[]).unwrap_err();
        assert!(matches!(
            err,
            RunError::Signal { symbol, .. } if symbol == Q::WrongNumberOfArguments.sym()
        ));
    }

    #[test]
    fn quit_gate_translates_flag_to_signal() {
        let mut env = Env::new();
        env.request_quit();
        let err = env.handle_quit().unwrap_err();
        assert!(matches!(
            err,
            RunError::Signal { symbol, .. } if symbol == Q::Quit.sym()
        ));
        // The flag is consumed.
        assert!(env.handle_quit().is_ok());
    }

    #[test]
    fn quit_gate_honors_inhibit_quit() {
        let mut env = Env::new();
        env.request_quit();
        env.set_raw_symbol_value(Q::InhibitQuit.id(), Value::T);
        assert!(env.handle_quit().is_ok());
        // Releasing the inhibition lets the pending quit fire.
        env.set_raw_symbol_value(Q::InhibitQuit.id(), Value::NIL);
        assert!(env.handle_quit().is_err());
    }

    #[test]
    fn quit_gate_throws_on_input_when_tag_matches() {
        let mut env = Env::new();
        let tag = env.intern("input-tag");
        env.set_raw_symbol_value(Q::ThrowOnInput.id(), tag);
        env.set_raw_symbol_value(Q::QuitFlag.id(), tag);
        let err = env.handle_quit().unwrap_err();
        assert_eq!(err, RunError::Throw { tag, value: Value::T });
    }

    #[test]
    fn pending_signals_drain_at_gate() {
        let mut env = Env::new();
        let callback = env.intern("pending-callback");
        env.fset(callback, Value::Subr(Subr::CurrentBuffer)).unwrap();
        env.queue_pending_signal(callback);
        assert!(env.handle_quit().is_ok());
        assert!(env.pending_signals.is_empty());
    }
}
