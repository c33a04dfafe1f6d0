//! Arithmetic and numeric comparison primitives.
//!
//! Fixnums are i64 with wrapping overflow; floats are f64. Mixed operands
//! follow the contagion rule of the source language: if either side is a
//! float, the operation is carried out in floats. Markers coerce to their
//! character position.

use crate::{
    env::Env,
    error::RunResult,
    heap::{HeapData, Marker},
    intern::Q,
    tracer::ExecTracer,
    value::Value,
};

/// A coerced numeric operand.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Num {
    Int(i64),
    Float(f64),
}

impl Num {
    fn as_f64(self) -> f64 {
        match self {
            Self::Int(n) => n as f64,
            Self::Float(f) => f,
        }
    }

    fn into_value(self) -> Value {
        match self {
            Self::Int(n) => Value::Int(n),
            Self::Float(f) => Value::Float(f),
        }
    }
}

/// Comparison operators shared by the compare opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Cmp {
    Eql,
    Gtr,
    Lss,
    Leq,
    Geq,
}

impl<Tr: ExecTracer> Env<Tr> {
    /// Coerces to a number, accepting markers as positions.
    pub(crate) fn coerce_number(&mut self, v: Value) -> RunResult<Num> {
        match v {
            Value::Int(n) => Ok(Num::Int(n)),
            Value::Float(f) => Ok(Num::Float(f)),
            Value::Ref(id) => {
                if let HeapData::Marker(Marker {
                    buffer: Some(_),
                    charpos,
                }) = self.heap.get(id)
                {
                    Ok(Num::Int(*charpos as i64))
                } else {
                    Err(self.wrong_type(Q::NumberOrMarkerP, v))
                }
            }
            _ => Err(self.wrong_type(Q::NumberOrMarkerP, v)),
        }
    }

    pub(crate) fn arith_add(&mut self, a: Value, b: Value) -> RunResult<Value> {
        let (a, b) = (self.coerce_number(a)?, self.coerce_number(b)?);
        Ok(match (a, b) {
            (Num::Int(x), Num::Int(y)) => Value::Int(x.wrapping_add(y)),
            _ => Value::Float(a.as_f64() + b.as_f64()),
        })
    }

    pub(crate) fn arith_sub(&mut self, a: Value, b: Value) -> RunResult<Value> {
        let (a, b) = (self.coerce_number(a)?, self.coerce_number(b)?);
        Ok(match (a, b) {
            (Num::Int(x), Num::Int(y)) => Value::Int(x.wrapping_sub(y)),
            _ => Value::Float(a.as_f64() - b.as_f64()),
        })
    }

    pub(crate) fn arith_mul(&mut self, a: Value, b: Value) -> RunResult<Value> {
        let (a, b) = (self.coerce_number(a)?, self.coerce_number(b)?);
        Ok(match (a, b) {
            (Num::Int(x), Num::Int(y)) => Value::Int(x.wrapping_mul(y)),
            _ => Value::Float(a.as_f64() * b.as_f64()),
        })
    }

    /// Truncating division; integer division by zero signals `arith-error`.
    pub(crate) fn arith_div(&mut self, a: Value, b: Value) -> RunResult<Value> {
        let (a, b) = (self.coerce_number(a)?, self.coerce_number(b)?);
        match (a, b) {
            (Num::Int(x), Num::Int(y)) => {
                if y == 0 {
                    Err(self.arith_error())
                } else {
                    Ok(Value::Int(x.wrapping_div(y)))
                }
            }
            _ => Ok(Value::Float(a.as_f64() / b.as_f64())),
        }
    }

    pub(crate) fn arith_rem(&mut self, a: Value, b: Value) -> RunResult<Value> {
        let (a, b) = (self.coerce_number(a)?, self.coerce_number(b)?);
        match (a, b) {
            (Num::Int(x), Num::Int(y)) => {
                if y == 0 {
                    Err(self.arith_error())
                } else {
                    Ok(Value::Int(x.wrapping_rem(y)))
                }
            }
            _ => Ok(Value::Float(a.as_f64() % b.as_f64())),
        }
    }

    /// The generic `1+` path; the dispatch loop inlines the fixnum case.
    pub(crate) fn arith_add1(&mut self, v: Value) -> RunResult<Value> {
        match self.coerce_number(v)? {
            Num::Int(n) => Ok(Value::Int(n.wrapping_add(1))),
            Num::Float(f) => Ok(Value::Float(f + 1.0)),
        }
    }

    pub(crate) fn arith_sub1(&mut self, v: Value) -> RunResult<Value> {
        match self.coerce_number(v)? {
            Num::Int(n) => Ok(Value::Int(n.wrapping_sub(1))),
            Num::Float(f) => Ok(Value::Float(f - 1.0)),
        }
    }

    pub(crate) fn arith_negate(&mut self, v: Value) -> RunResult<Value> {
        match self.coerce_number(v)? {
            Num::Int(n) => Ok(Value::Int(n.wrapping_neg())),
            Num::Float(f) => Ok(Value::Float(-f)),
        }
    }

    /// Returns whichever operand compares greater (or lesser), preserving
    /// the winning operand's representation.
    pub(crate) fn arith_extreme(&mut self, a: Value, b: Value, want_max: bool) -> RunResult<Value> {
        let (x, y) = (self.coerce_number(a)?, self.coerce_number(b)?);
        let a_wins = if want_max {
            x.as_f64() >= y.as_f64()
        } else {
            x.as_f64() <= y.as_f64()
        };
        Ok(if a_wins { x.into_value() } else { y.into_value() })
    }

    /// Ordered comparison with float contagion. Integer pairs compare
    /// exactly; any float operand coerces both sides to float.
    pub(crate) fn arith_compare(&mut self, a: Value, b: Value, op: Cmp) -> RunResult<Value> {
        let (x, y) = (self.coerce_number(a)?, self.coerce_number(b)?);
        let result = match (x, y) {
            (Num::Int(i), Num::Int(j)) => match op {
                Cmp::Eql => i == j,
                Cmp::Gtr => i > j,
                Cmp::Lss => i < j,
                Cmp::Leq => i <= j,
                Cmp::Geq => i >= j,
            },
            _ => {
                let (f, g) = (x.as_f64(), y.as_f64());
                match op {
                    Cmp::Eql => f == g,
                    Cmp::Gtr => f > g,
                    Cmp::Lss => f < g,
                    Cmp::Leq => f <= g,
                    Cmp::Geq => f >= g,
                }
            }
        };
        Ok(Value::bool(result))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RunError;
    use pretty_assertions::assert_eq;

    #[test]
    fn integer_arithmetic() {
        let mut env = Env::new();
        assert_eq!(env.arith_add(Value::int(3), Value::int(4)).unwrap(), Value::int(7));
        assert_eq!(env.arith_sub(Value::int(3), Value::int(4)).unwrap(), Value::int(-1));
        assert_eq!(env.arith_mul(Value::int(3), Value::int(4)).unwrap(), Value::int(12));
        assert_eq!(env.arith_div(Value::int(7), Value::int(2)).unwrap(), Value::int(3));
        assert_eq!(env.arith_rem(Value::int(7), Value::int(2)).unwrap(), Value::int(1));
    }

    #[test]
    fn float_contagion() {
        let mut env = Env::new();
        assert_eq!(
            env.arith_add(Value::int(1), Value::Float(0.5)).unwrap(),
            Value::Float(1.5)
        );
        assert_eq!(
            env.arith_compare(Value::int(1), Value::Float(1.0), Cmp::Eql).unwrap(),
            Value::T
        );
        assert_eq!(
            env.arith_compare(Value::Float(0.5), Value::int(1), Cmp::Lss).unwrap(),
            Value::T
        );
    }

    #[test]
    fn division_by_zero_signals_arith_error() {
        let mut env = Env::new();
        let err = env.arith_div(Value::int(1), Value::int(0)).unwrap_err();
        assert!(matches!(
            err,
            RunError::Signal { symbol, .. } if symbol == Q::ArithError.sym()
        ));
        // Float division by zero does not signal.
        assert_eq!(
            env.arith_div(Value::Float(1.0), Value::Float(0.0)).unwrap(),
            Value::Float(f64::INFINITY)
        );
    }

    #[test]
    fn non_numbers_are_rejected() {
        let mut env = Env::new();
        let err = env.arith_add(Value::NIL, Value::int(1)).unwrap_err();
        assert!(matches!(
            err,
            RunError::Signal { symbol, .. } if symbol == Q::WrongTypeArgument.sym()
        ));
    }

    #[test]
    fn max_min_preserve_representation() {
        let mut env = Env::new();
        assert_eq!(
            env.arith_extreme(Value::int(2), Value::Float(1.5), true).unwrap(),
            Value::int(2)
        );
        assert_eq!(
            env.arith_extreme(Value::int(2), Value::Float(1.5), false).unwrap(),
            Value::Float(1.5)
        );
    }
}
