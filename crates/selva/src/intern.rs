//! Symbol interning and symbol cells.
//!
//! The obarray stores unique symbol names in a vector and returns indices
//! (`SymbolId`) for cheap storage and identity comparison. Symbols are
//! permanent: they are roots for the collector and are never swept.
//!
//! SymbolIds are laid out as follows:
//! * 0 and 1 — `nil` and `t`
//! * 2 to count(`Q`) — the well-known symbols the interpreter itself needs
//! * beyond — symbols interned by embedders and programs

use ahash::AHashMap;
use smallvec::SmallVec;
use strum::{EnumIter, IntoStaticStr};

use crate::{buffer::BufferId, value::Value};

/// Index into the obarray's storage.
///
/// Uses `u32` to save space; symbol words are carried inline in `Value`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SymbolId(u32);

impl SymbolId {
    pub(crate) const NIL: Self = Self(0);
    pub(crate) const T: Self = Self(1);

    #[inline]
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

/// Well-known symbols, interned at bootstrap in declaration order so that
/// the discriminant doubles as the `SymbolId`.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter, IntoStaticStr)]
#[strum(serialize_all = "kebab-case")]
pub(crate) enum Q {
    Nil,
    T,
    // Error symbols.
    Error,
    Quit,
    WrongTypeArgument,
    WrongNumberOfArguments,
    VoidVariable,
    VoidFunction,
    InvalidFunction,
    ArgsOutOfRange,
    ArithError,
    SettingConstant,
    CyclicVariableIndirection,
    CyclicFunctionIndirection,
    BeginningOfBuffer,
    EndOfBuffer,
    // Property names.
    ErrorConditions,
    ErrorMessage,
    // Type predicates named in wrong-type-argument data.
    Listp,
    Consp,
    Symbolp,
    Stringp,
    Vectorp,
    Arrayp,
    Sequencep,
    Integerp,
    Numberp,
    NumberOrMarkerP,
    IntegerOrMarkerP,
    CharOrStringP,
    Characterp,
    Bufferp,
    Markerp,
    Functionp,
    ByteCodeFunctionP,
    // Dynamic variables consulted by the interpreter.
    QuitFlag,
    InhibitQuit,
    ThrowOnInput,
    StandardOutput,
    // Variable-watcher operations.
    Set,
    Let,
    Unlet,
    Makunbound,
    // Misc.
    Many,
    InteractiveP,
}

impl Q {
    #[inline]
    pub(crate) fn id(self) -> SymbolId {
        SymbolId(self as u32)
    }

    #[inline]
    pub(crate) fn sym(self) -> Value {
        Value::Sym(self.id())
    }
}

/// How a symbol's value cell is stored.
#[derive(Debug)]
pub(crate) enum SymbolCell {
    /// A plain value cell; `Value::Unbound` when void.
    Plain(Value),
    /// The symbol is an alias for another variable.
    Alias(SymbolId),
    /// A buffer-local variable: a default plus per-buffer values.
    Buffered(BufferedCell),
}

#[derive(Debug)]
pub(crate) struct BufferedCell {
    pub default: Value,
    pub locals: AHashMap<BufferId, Value>,
}

/// One interned symbol: name plus value, function, and property cells.
#[derive(Debug)]
pub(crate) struct Symbol {
    pub name: Box<str>,
    pub cell: SymbolCell,
    pub function: Value,
    pub plist: Value,
    /// Variable watchers; a non-empty list is the symbol's "write trap", so
    /// the VARSET fast path must route through the generic setter.
    pub watchers: SmallVec<[Value; 1]>,
    /// Constant symbols (`nil`, `t`, keywords) refuse assignment.
    pub constant: bool,
}

impl Symbol {
    fn new(name: &str) -> Self {
        Self {
            name: name.into(),
            cell: SymbolCell::Plain(Value::Unbound),
            function: Value::NIL,
            plist: Value::NIL,
            watchers: SmallVec::new(),
            constant: false,
        }
    }

    /// Whether assignment must go through the generic value-setting path.
    #[inline]
    pub fn trapped_write(&self) -> bool {
        !self.watchers.is_empty() || self.constant
    }
}

/// The obarray: an interning table over all live symbols.
#[derive(Debug, Default)]
pub struct Obarray {
    names: AHashMap<Box<str>, SymbolId>,
    symbols: Vec<Symbol>,
}

impl Obarray {
    /// Builds the obarray and interns the well-known symbols in `Q` order.
    pub(crate) fn bootstrap() -> Self {
        let mut this = Self::default();
        for (i, q) in <Q as strum::IntoEnumIterator>::iter().enumerate() {
            let name: &'static str = q.into();
            let id = this.intern(name);
            debug_assert_eq!(id.index(), i);
        }
        // nil and t are self-evaluating constants.
        for q in [Q::Nil, Q::T] {
            let sym = this.get_mut(q.id());
            sym.cell = SymbolCell::Plain(q.sym());
            sym.constant = true;
        }
        // quit-flag, inhibit-quit, throw-on-input start out nil.
        for q in [Q::QuitFlag, Q::InhibitQuit, Q::ThrowOnInput, Q::StandardOutput] {
            this.get_mut(q.id()).cell = SymbolCell::Plain(Value::NIL);
        }
        this
    }

    /// Interns `name`, returning the existing symbol if already present.
    pub fn intern(&mut self, name: &str) -> SymbolId {
        if let Some(&id) = self.names.get(name) {
            return id;
        }
        let id = SymbolId(u32::try_from(self.symbols.len()).expect("obarray index exceeds u32"));
        self.symbols.push(Symbol::new(name));
        self.names.insert(name.into(), id);
        // Keywords are constants, like in the source language.
        if name.starts_with(':') {
            let sym = self.get_mut(id);
            sym.cell = SymbolCell::Plain(Value::Sym(id));
            sym.constant = true;
        }
        id
    }

    /// Looks up a symbol without interning it.
    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<SymbolId> {
        self.names.get(name).copied()
    }

    #[inline]
    #[must_use]
    pub fn name(&self, id: SymbolId) -> &str {
        &self.symbols[id.index()].name
    }

    #[inline]
    pub(crate) fn get(&self, id: SymbolId) -> &Symbol {
        &self.symbols[id.index()]
    }

    #[inline]
    pub(crate) fn get_mut(&mut self, id: SymbolId) -> &mut Symbol {
        &mut self.symbols[id.index()]
    }

    /// Pushes every value reachable from symbol cells onto `roots`.
    pub(crate) fn gc_roots(&self, roots: &mut Vec<Value>) {
        for sym in &self.symbols {
            match &sym.cell {
                SymbolCell::Plain(v) => roots.push(*v),
                SymbolCell::Alias(_) => {}
                SymbolCell::Buffered(cell) => {
                    roots.push(cell.default);
                    roots.extend(cell.locals.values().copied());
                }
            }
            roots.push(sym.function);
            roots.push(sym.plist);
            roots.extend(sym.watchers.iter().copied());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn well_known_symbols_get_fixed_ids() {
        let ob = Obarray::bootstrap();
        assert_eq!(ob.lookup("nil"), Some(SymbolId::NIL));
        assert_eq!(ob.lookup("t"), Some(SymbolId::T));
        assert_eq!(ob.lookup("wrong-type-argument"), Some(Q::WrongTypeArgument.id()));
        assert_eq!(ob.lookup("number-or-marker-p"), Some(Q::NumberOrMarkerP.id()));
        assert_eq!(ob.name(Q::ArgsOutOfRange.id()), "args-out-of-range");
    }

    #[test]
    fn interning_is_idempotent() {
        let mut ob = Obarray::bootstrap();
        let a = ob.intern("my-var");
        let b = ob.intern("my-var");
        assert_eq!(a, b);
        assert_ne!(a, ob.intern("my-other-var"));
    }

    #[test]
    fn keywords_are_self_evaluating_constants() {
        let mut ob = Obarray::bootstrap();
        let k = ob.intern(":test");
        assert!(ob.get(k).constant);
        let value = match &ob.get(k).cell {
            SymbolCell::Plain(v) => *v,
            _ => Value::Unbound,
        };
        assert_eq!(value, Value::Sym(k));
    }
}
