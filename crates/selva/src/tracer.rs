//! Execution tracing hooks.
//!
//! A trait-based tracing system for the dispatch loop with zero-cost
//! abstraction: the interpreter carries the tracer as a type parameter, so
//! with [`NoopTracer`] every hook compiles away. [`OpcodeMeter`] keeps the
//! classic per-opcode and opcode-pair execution histograms.

use crate::value::Value;

/// Trait for interpreter execution tracing.
///
/// All methods have default no-op implementations; implementations override
/// only the hooks they care about. `on_instruction` is the hottest hook —
/// called for every dispatched opcode — and should stay lightweight.
pub trait ExecTracer {
    /// Called before each opcode dispatch.
    ///
    /// `offset` is the opcode's byte offset in the code string.
    #[inline(always)]
    fn on_instruction(&mut self, _offset: usize, _opcode: u8) {}

    /// Called when the generic function-call path is entered.
    #[inline(always)]
    fn on_call(&mut self, _callee: Value, _nargs: usize) {}

    /// Called after a collection with the number of slots freed.
    #[inline(always)]
    fn on_gc(&mut self, _freed: usize) {}
}

/// Zero-cost no-op tracer, the production default.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTracer;

impl ExecTracer for NoopTracer {}

/// Per-opcode and opcode-pair execution counters.
///
/// `counts[op]` is how many times `op` was executed; `pairs[prev][op]` is
/// how many times `prev` was immediately followed by `op`. The pair table
/// is boxed — it is 256 × 256 counters.
pub struct OpcodeMeter {
    counts: Box<[u64; 256]>,
    pairs: Box<[[u32; 256]; 256]>,
    last: Option<u8>,
    calls: u64,
}

impl Default for OpcodeMeter {
    fn default() -> Self {
        Self::new()
    }
}

impl OpcodeMeter {
    #[must_use]
    pub fn new() -> Self {
        Self {
            counts: Box::new([0; 256]),
            pairs: vec![[0u32; 256]; 256].into_boxed_slice().try_into().expect("256 rows"),
            last: None,
            calls: 0,
        }
    }

    /// Execution count of one opcode.
    #[must_use]
    pub fn count(&self, opcode: u8) -> u64 {
        self.counts[opcode as usize]
    }

    /// How often `first` was immediately followed by `second`.
    #[must_use]
    pub fn pair_count(&self, first: u8, second: u8) -> u32 {
        self.pairs[first as usize][second as usize]
    }

    /// Total function calls observed.
    #[must_use]
    pub fn call_count(&self) -> u64 {
        self.calls
    }

    /// Opcodes sorted by execution count, most frequent first.
    #[must_use]
    pub fn hottest(&self, n: usize) -> Vec<(u8, u64)> {
        let mut entries: Vec<(u8, u64)> = (0u16..256)
            .map(|op| (op as u8, self.counts[op as usize]))
            .filter(|&(_, count)| count > 0)
            .collect();
        entries.sort_by(|a, b| b.1.cmp(&a.1));
        entries.truncate(n);
        entries
    }
}

impl ExecTracer for OpcodeMeter {
    fn on_instruction(&mut self, _offset: usize, opcode: u8) {
        self.counts[opcode as usize] = self.counts[opcode as usize].saturating_add(1);
        if let Some(prev) = self.last {
            let slot = &mut self.pairs[prev as usize][opcode as usize];
            *slot = slot.saturating_add(1);
        }
        self.last = Some(opcode);
    }

    fn on_call(&mut self, _callee: Value, _nargs: usize) {
        self.calls += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn meter_counts_instructions_and_pairs() {
        let mut meter = OpcodeMeter::new();
        meter.on_instruction(0, 10);
        meter.on_instruction(1, 20);
        meter.on_instruction(2, 10);
        assert_eq!(meter.count(10), 2);
        assert_eq!(meter.count(20), 1);
        assert_eq!(meter.pair_count(10, 20), 1);
        assert_eq!(meter.pair_count(20, 10), 1);
        assert_eq!(meter.pair_count(20, 20), 0);
        assert_eq!(meter.hottest(1), vec![(10, 2)]);
    }
}
