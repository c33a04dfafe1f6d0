#![doc = include_str!("../../../README.md")]
#![expect(clippy::cast_possible_truncation, reason = "numeric narrowing is checked at call sites")]
#![expect(clippy::cast_sign_loss, reason = "sign-changing casts are range-checked first")]
#![expect(clippy::cast_possible_wrap, reason = "wrap behavior mirrors the source system")]
#![expect(clippy::unused_self, reason = "error constructors keep a uniform receiver")]

mod arith;
mod binding;
mod buffer;
pub mod bytecode;
mod env;
mod error;
mod eval;
mod fns;
mod heap;
mod intern;
pub mod tracer;
mod value;

pub use crate::{
    buffer::BufferId,
    bytecode::{ArgSpec, Arity, CONSTANT_BASE, Opcode, arity_of},
    env::Env,
    error::{RunError, RunResult},
    eval::{NativeFn, NativeId, Subr},
    heap::{Heap, HeapId, HeapStats},
    intern::{Obarray, SymbolId},
    tracer::{ExecTracer, NoopTracer, OpcodeMeter},
    value::Value,
};
