//! Code objects and the packed arity descriptor.

use crate::{
    env::Env,
    error::RunResult,
    eval::NativeId,
    heap::{HeapData, HeapId, LispStr},
    intern::Q,
    tracer::ExecTracer,
    value::Value,
};

/// A compiled code object: argument template, code bytes, constant pool,
/// declared maximum operand-stack depth, and an optional native handle the
/// entry façade routes to instead of the dispatch loop.
#[derive(Debug)]
pub struct Code {
    /// The packed arity descriptor (see [`ArgSpec`]).
    pub(crate) template: i64,
    /// The unibyte string of opcodes.
    pub(crate) bytes: HeapId,
    /// The constant vector indexed by opcode operands.
    pub(crate) constants: HeapId,
    /// Peak operand-stack usage; the stack region is `max_depth + 1` slots.
    pub(crate) max_depth: usize,
    /// A registered native translation, when one exists.
    pub(crate) native: Option<NativeId>,
}

/// The packed arity descriptor: bits 0–6 the mandatory count, bit 7 the
/// rest flag, bits 8 and up the total non-rest parameter count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArgSpec(pub i64);

impl ArgSpec {
    #[inline]
    #[must_use]
    pub fn mandatory(self) -> i64 {
        self.0 & 0x7F
    }

    #[inline]
    #[must_use]
    pub fn rest(self) -> bool {
        (self.0 >> 7) & 1 != 0
    }

    #[inline]
    #[must_use]
    pub fn nonrest(self) -> i64 {
        self.0 >> 8
    }
}

/// The maximum-argument half of an arity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    /// At most this many arguments.
    At(usize),
    /// Any number of arguments (a rest parameter is present).
    Many,
}

/// Decodes an arity descriptor into `(min, max-or-many)`.
#[must_use]
pub fn arity_of(template: i64) -> (usize, Arity) {
    let spec = ArgSpec(template);
    let min = spec.mandatory().max(0) as usize;
    if spec.rest() {
        (min, Arity::Many)
    } else {
        (min, Arity::At(spec.nonrest().max(0) as usize))
    }
}

impl<Tr: ExecTracer> Env<Tr> {
    /// Builds a code object value from its parts, validating as the entry
    /// façade does.
    pub fn make_byte_code(
        &mut self,
        template: Value,
        bytes: Value,
        constants: Value,
        max_depth: Value,
    ) -> RunResult<Value> {
        let Value::Int(template) = template else {
            return Err(self.wrong_type(Q::Integerp, template));
        };
        let bytes = self.check_byte_string(bytes)?;
        let constants = self.check_vector(constants)?;
        let max_depth = self.check_natnum(max_depth)?;
        Ok(Value::Ref(self.heap.alloc(HeapData::Code(Code {
            template,
            bytes,
            constants,
            max_depth,
            native: None,
        }))))
    }

    /// Attaches a native translation to a code object.
    pub fn set_code_native(&mut self, code: Value, native: NativeId) -> RunResult<()> {
        match code {
            Value::Ref(id) => match self.heap.get_mut(id) {
                HeapData::Code(c) => {
                    c.native = Some(native);
                    Ok(())
                }
                _ => Err(self.wrong_type(Q::ByteCodeFunctionP, code)),
            },
            _ => Err(self.wrong_type(Q::ByteCodeFunctionP, code)),
        }
    }

    /// Checks that `v` is a string and returns its single-byte form,
    /// copying a multibyte string down to unibyte first. Compilers of the
    /// wide-string era produced those; the interpreter only fetches bytes.
    pub(crate) fn check_byte_string(&mut self, v: Value) -> RunResult<HeapId> {
        let Value::Ref(id) = v else {
            return Err(self.wrong_type(Q::Stringp, v));
        };
        let HeapData::Str(s) = self.heap.get(id) else {
            return Err(self.wrong_type(Q::Stringp, v));
        };
        if !s.multibyte {
            return Ok(id);
        }
        let bytes: Vec<u8> = s.chars().iter().map(|&c| (c as u32).min(0xFF) as u8).collect();
        Ok(self.heap.alloc(HeapData::Str(LispStr {
            bytes: bytes.into(),
            multibyte: false,
        })))
    }

    pub(crate) fn check_vector(&mut self, v: Value) -> RunResult<HeapId> {
        match v {
            Value::Ref(id) if matches!(self.heap.get(id), HeapData::Vector(_)) => Ok(id),
            _ => Err(self.wrong_type(Q::Vectorp, v)),
        }
    }

    pub(crate) fn check_natnum(&mut self, v: Value) -> RunResult<usize> {
        match v {
            Value::Int(n) if n >= 0 => Ok(n as usize),
            _ => Err(self.wrong_type(Q::Integerp, v)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn arg_spec_unpacks_fields() {
        // mandatory=1, rest, nonrest=2
        let spec = ArgSpec((2 << 8) | (1 << 7) | 1);
        assert_eq!(spec.mandatory(), 1);
        assert!(spec.rest());
        assert_eq!(spec.nonrest(), 2);
    }

    #[test]
    fn arity_roundtrips_over_descriptor_grid() {
        // The round-trip property: arity_of agrees with the bit fields for
        // every combination in a broad grid.
        for mandatory in 0..128i64 {
            for nonrest in [0i64, 1, 2, 5, 127, 200] {
                if nonrest < mandatory {
                    continue;
                }
                for rest in [0i64, 1] {
                    let template = (nonrest << 8) | (rest << 7) | mandatory;
                    let (min, max) = arity_of(template);
                    assert_eq!(min, mandatory as usize);
                    match max {
                        Arity::Many => assert_eq!(rest, 1),
                        Arity::At(n) => {
                            assert_eq!(rest, 0);
                            assert_eq!(n, nonrest as usize);
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn make_byte_code_validates_parts() {
        let mut env = Env::new();
        let bytes = env.make_unibyte_string(&[0o207]);
        let constants = env.make_vector(&[]);
        assert!(env
            .make_byte_code(Value::int(0), bytes, constants, Value::int(1))
            .is_ok());
        assert!(env
            .make_byte_code(Value::int(0), Value::NIL, constants, Value::int(1))
            .is_err());
        assert!(env
            .make_byte_code(Value::int(0), bytes, Value::NIL, Value::int(1))
            .is_err());
        assert!(env
            .make_byte_code(Value::int(0), bytes, constants, Value::int(-1))
            .is_err());
    }

    #[test]
    fn multibyte_code_strings_are_coerced_to_unibyte() {
        let mut env = Env::new();
        let wide = env.make_string("abc");
        let id = env.check_byte_string(wide).unwrap();
        assert!(!env.heap.str_data(id).multibyte);
        assert_eq!(&*env.heap.str_data(id).bytes, b"abc");
    }
}
