//! The interpreter instance.
//!
//! [`Env`] owns every process-wide singleton of the execution model: the
//! heap, the obarray, the buffer set, the binding stack, the handler stack,
//! and the active frame list. It is single-threaded by design; embedders
//! that want parallelism create one `Env` per thread.

use crate::{
    binding::SpecEntry,
    buffer::BufferSet,
    bytecode::exec::{Frame, Handler},
    error::RunError,
    eval::{NativeFn, Subr},
    heap::{Cons, Heap, HeapData, HeapStats, LispStr, Marker},
    intern::{Obarray, Q, SymbolId},
    tracer::{ExecTracer, NoopTracer},
    value::{Value, format_value},
};

/// Default bound on nested function-call depth.
const MAX_EVAL_DEPTH: usize = 800;

/// A complete interpreter: heap, symbols, buffers, and the three stacks of
/// the execution model (binding stack, handler stack, active frames).
pub struct Env<Tr: ExecTracer = NoopTracer> {
    pub(crate) heap: Heap,
    pub(crate) symbols: Obarray,
    pub(crate) buffers: BufferSet,
    /// Match-data registers: pairs of begin/end positions, `None` when a
    /// subexpression did not participate in the last search.
    pub(crate) match_data: Vec<Option<usize>>,
    /// The binding stack (scoped rebindings and deferred unwind actions).
    pub(crate) specpdl: Vec<SpecEntry>,
    /// The handler stack (catchers and condition-cases).
    pub(crate) handlers: Vec<Handler>,
    /// The active frame list, innermost last.
    pub(crate) frames: Vec<Frame>,
    /// Registered native translations of code objects.
    pub(crate) natives: Vec<NativeFn<Tr>>,
    /// Callbacks drained at the quit gate.
    pub(crate) pending_signals: Vec<Value>,
    /// Explicit collector roots for values held in Rust locals across
    /// operations that may collect (the unwinding paths use this).
    pub(crate) gc_protect: Vec<Value>,
    pub(crate) eval_depth: usize,
    pub(crate) max_eval_depth: usize,
    pub(crate) tracer: Tr,
}

impl Default for Env {
    fn default() -> Self {
        Self::new()
    }
}

impl Env {
    /// Creates an interpreter with the no-op tracer.
    #[must_use]
    pub fn new() -> Self {
        Self::with_tracer(NoopTracer)
    }
}

impl<Tr: ExecTracer> Env<Tr> {
    /// Creates an interpreter with the given execution tracer.
    pub fn with_tracer(tracer: Tr) -> Self {
        let mut env = Self {
            heap: Heap::new(),
            symbols: Obarray::bootstrap(),
            buffers: BufferSet::new(),
            match_data: Vec::new(),
            specpdl: Vec::new(),
            handlers: Vec::new(),
            frames: Vec::new(),
            natives: Vec::new(),
            pending_signals: Vec::new(),
            gc_protect: Vec::new(),
            eval_depth: 0,
            max_eval_depth: MAX_EVAL_DEPTH,
            tracer,
        };
        env.define_standard_errors();
        env.install_subrs();
        env
    }

    /// Interns a symbol, returning it as a value.
    pub fn intern(&mut self, name: &str) -> Value {
        Value::Sym(self.symbols.intern(name))
    }

    /// The heap, for predicates that inspect object tags.
    #[must_use]
    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    /// The obarray.
    #[must_use]
    pub fn obarray(&self) -> &Obarray {
        &self.symbols
    }

    /// The printed name of a symbol value, if it is one.
    #[must_use]
    pub fn symbol_name(&self, v: Value) -> Option<&str> {
        match v {
            Value::Sym(id) => Some(self.symbols.name(id)),
            _ => None,
        }
    }

    // ---- constructors ----------------------------------------------------

    pub fn cons(&mut self, car: Value, cdr: Value) -> Value {
        Value::Ref(self.heap.alloc(HeapData::Cons(Cons { car, cdr })))
    }

    /// Builds a list from a slice, last element first.
    pub fn list(&mut self, items: &[Value]) -> Value {
        let mut tail = Value::NIL;
        for &item in items.iter().rev() {
            tail = self.cons(item, tail);
        }
        tail
    }

    /// Allocates a multibyte (character) string.
    pub fn make_string(&mut self, s: &str) -> Value {
        Value::Ref(self.heap.alloc(HeapData::Str(LispStr {
            bytes: s.as_bytes().into(),
            multibyte: true,
        })))
    }

    /// Allocates a unibyte (byte) string; compiled code uses this form.
    pub fn make_unibyte_string(&mut self, bytes: &[u8]) -> Value {
        Value::Ref(self.heap.alloc(HeapData::Str(LispStr {
            bytes: bytes.into(),
            multibyte: false,
        })))
    }

    pub fn make_vector(&mut self, items: &[Value]) -> Value {
        Value::Ref(self.heap.alloc(HeapData::Vector(items.to_vec())))
    }

    /// Allocates a marker pointing nowhere.
    pub fn make_marker(&mut self) -> Value {
        Value::Ref(self.heap.alloc(HeapData::Marker(Marker {
            buffer: None,
            charpos: 1,
        })))
    }

    /// Formats a value using the language's printed representation.
    #[must_use]
    pub fn format_value(&self, v: Value) -> String {
        format_value(v, &self.heap, &self.symbols)
    }

    // ---- error constructors ----------------------------------------------

    pub(crate) fn error_msg(&mut self, msg: impl AsRef<str>) -> RunError {
        let text = self.make_string(msg.as_ref());
        let data = self.cons(text, Value::NIL);
        RunError::Signal {
            symbol: Q::Error.sym(),
            data,
        }
    }

    pub(crate) fn wrong_type(&mut self, predicate: Q, value: Value) -> RunError {
        let data = self.list(&[predicate.sym(), value]);
        RunError::Signal {
            symbol: Q::WrongTypeArgument.sym(),
            data,
        }
    }

    pub(crate) fn void_variable(&mut self, symbol: SymbolId) -> RunError {
        let data = self.cons(Value::Sym(symbol), Value::NIL);
        RunError::Signal {
            symbol: Q::VoidVariable.sym(),
            data,
        }
    }

    pub(crate) fn void_function(&mut self, symbol: Value) -> RunError {
        let data = self.cons(symbol, Value::NIL);
        RunError::Signal {
            symbol: Q::VoidFunction.sym(),
            data,
        }
    }

    pub(crate) fn invalid_function(&mut self, value: Value) -> RunError {
        let data = self.cons(value, Value::NIL);
        RunError::Signal {
            symbol: Q::InvalidFunction.sym(),
            data,
        }
    }

    pub(crate) fn args_out_of_range(&mut self, args: &[Value]) -> RunError {
        let data = self.list(args);
        RunError::Signal {
            symbol: Q::ArgsOutOfRange.sym(),
            data,
        }
    }

    pub(crate) fn arith_error(&mut self) -> RunError {
        RunError::Signal {
            symbol: Q::ArithError.sym(),
            data: Value::NIL,
        }
    }

    pub(crate) fn setting_constant(&mut self, symbol: SymbolId) -> RunError {
        let data = self.cons(Value::Sym(symbol), Value::NIL);
        RunError::Signal {
            symbol: Q::SettingConstant.sym(),
            data,
        }
    }

    /// The argument-count failure: data is `((mandatory . nonrest) nargs)`.
    pub(crate) fn wrong_nargs(&mut self, mandatory: i64, nonrest: i64, nargs: usize) -> RunError {
        let arity = self.cons(Value::int(mandatory), Value::int(nonrest));
        let data = self.list(&[arity, Value::int(nargs as i64)]);
        RunError::Signal {
            symbol: Q::WrongNumberOfArguments.sym(),
            data,
        }
    }

    // ---- collector interface ---------------------------------------------

    /// Pins a value as a collector root while it is held in a Rust local
    /// across an operation that may collect. Pair with [`Self::unprotect`].
    pub(crate) fn protect(&mut self, v: Value) {
        self.gc_protect.push(v);
    }

    pub(crate) fn unprotect(&mut self, n: usize) {
        let keep = self.gc_protect.len() - n;
        self.gc_protect.truncate(keep);
    }

    /// Runs a collection now, then fixes up any frames whose byte strings
    /// moved during string compaction.
    pub fn garbage_collect(&mut self) {
        let mut roots: Vec<Value> = Vec::with_capacity(256);
        for frame in &self.frames {
            frame.gc_roots(&mut roots);
        }
        self.symbols.gc_roots(&mut roots);
        for entry in &self.specpdl {
            entry.gc_roots(&mut roots);
        }
        for handler in &self.handlers {
            roots.push(handler.tag);
        }
        roots.extend(self.pending_signals.iter().copied());
        roots.extend(self.gc_protect.iter().copied());

        let report = self.heap.collect(&roots);
        if report.strings_moved {
            self.relocate_frames();
        }
        self.tracer.on_gc(report.freed);
    }

    /// Heap statistics for monitoring.
    #[must_use]
    pub fn heap_stats(&self) -> HeapStats {
        self.heap.stats()
    }

    // ---- bootstrap -------------------------------------------------------

    fn define_standard_errors(&mut self) {
        self.define_error(Q::Error.id(), "error", None);
        self.define_error(Q::Quit.id(), "Quit", None);
        for (q, message) in [
            (Q::WrongTypeArgument, "Wrong type argument"),
            (Q::WrongNumberOfArguments, "Wrong number of arguments"),
            (Q::VoidVariable, "Symbol's value as variable is void"),
            (Q::VoidFunction, "Symbol's function definition is void"),
            (Q::InvalidFunction, "Invalid function"),
            (Q::ArgsOutOfRange, "Args out of range"),
            (Q::ArithError, "Arithmetic error"),
            (Q::SettingConstant, "Attempt to set a constant symbol"),
            (
                Q::CyclicVariableIndirection,
                "Symbol's chain of variable indirections contains a loop",
            ),
            (
                Q::CyclicFunctionIndirection,
                "Symbol's chain of function indirections contains a loop",
            ),
            (Q::BeginningOfBuffer, "Beginning of buffer"),
            (Q::EndOfBuffer, "End of buffer"),
        ] {
            self.define_error(q.id(), message, Some(Q::Error.id()));
        }
    }

    /// Defines an error symbol: sets `error-conditions` (the symbol plus its
    /// parent's conditions) and `error-message`.
    pub fn define_error(&mut self, symbol: SymbolId, message: &str, parent: Option<SymbolId>) {
        let parent_conditions = match parent {
            Some(p) => self.get_property(Value::Sym(p), Q::ErrorConditions.sym()),
            None => Value::NIL,
        };
        let conditions = self.cons(Value::Sym(symbol), parent_conditions);
        self.put_property(symbol, Q::ErrorConditions.sym(), conditions);
        let message = self.make_string(message);
        self.put_property(symbol, Q::ErrorMessage.sym(), message);
    }

    fn install_subrs(&mut self) {
        for subr in <Subr as strum::IntoEnumIterator>::iter() {
            let name: &'static str = subr.into();
            let id = self.symbols.intern(name);
            self.symbols.get_mut(id).function = Value::Subr(subr);
        }
    }

    /// Registers a native translation; code objects refer to it by handle.
    pub fn register_native(&mut self, f: NativeFn<Tr>) -> crate::eval::NativeId {
        let id = crate::eval::NativeId::new(self.natives.len());
        self.natives.push(f);
        id
    }

    /// Queues a callback to be run (with no arguments) at the next quit
    /// gate. This is the cooperative analogue of a pending signal.
    pub fn queue_pending_signal(&mut self, callback: Value) {
        self.pending_signals.push(callback);
    }

    /// Raises the cooperative quit flag; the running frame observes it at
    /// its next taken branch.
    pub fn request_quit(&mut self) {
        self.set_raw_symbol_value(Q::QuitFlag.id(), Value::T);
    }
}
