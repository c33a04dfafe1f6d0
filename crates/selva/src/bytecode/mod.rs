//! The byte interpreter: code objects, the opcode table, and the dispatch
//! loop.
//!
//! # Module Structure
//!
//! - `op` - the opcode table with the compiled format's numeric values
//! - `code` - code objects and the packed arity descriptor
//! - `exec` - frames, the dispatch loop, and the entry façade

pub use code::{ArgSpec, Arity, Code, arity_of};
pub use op::{CONSTANT_BASE, Opcode};

mod code;
pub(crate) mod exec;
mod op;
