//! The opcode table.
//!
//! Numeric values are the compiled format's, unchanged. Several families
//! come in seven forms: the base opcode encodes operands 0–5 inline, the
//! `+6` form reads one following byte, and the `+7` form reads two
//! (little-endian). Absolute jump destinations are unsigned 16-bit
//! little-endian offsets; the short `RGoto*` family uses a single biased
//! byte (delta = byte − 128, applied after the byte is consumed).
//!
//! Bytes without a variant here — 0, 51–55, 128, 169, 180, 181, 183–191 —
//! are invalid and fail dispatch. Bytes at `Constant` (192) and above push
//! `constants[byte − 192]` directly.

use strum::{FromRepr, IntoStaticStr};

/// First byte of the inline-constant range; 64 fast constants follow.
pub const CONSTANT_BASE: u8 = Opcode::Constant as u8;

/// One opcode. Marked `#[repr(u8)]` so discriminants are the wire values.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr, IntoStaticStr)]
pub enum Opcode {
    // stack-ref 0 is invalid (dup covers it).
    StackRef1 = 1,
    StackRef2 = 2,
    StackRef3 = 3,
    StackRef4 = 4,
    StackRef5 = 5,
    StackRef6 = 6,
    StackRef7 = 7,
    VarRef0 = 8,
    VarRef1 = 9,
    VarRef2 = 10,
    VarRef3 = 11,
    VarRef4 = 12,
    VarRef5 = 13,
    VarRef6 = 14,
    VarRef7 = 15,
    VarSet0 = 16,
    VarSet1 = 17,
    VarSet2 = 18,
    VarSet3 = 19,
    VarSet4 = 20,
    VarSet5 = 21,
    VarSet6 = 22,
    VarSet7 = 23,
    VarBind0 = 24,
    VarBind1 = 25,
    VarBind2 = 26,
    VarBind3 = 27,
    VarBind4 = 28,
    VarBind5 = 29,
    VarBind6 = 30,
    VarBind7 = 31,
    Call0 = 32,
    Call1 = 33,
    Call2 = 34,
    Call3 = 35,
    Call4 = 36,
    Call5 = 37,
    Call6 = 38,
    Call7 = 39,
    Unbind0 = 40,
    Unbind1 = 41,
    Unbind2 = 42,
    Unbind3 = 43,
    Unbind4 = 44,
    Unbind5 = 45,
    Unbind6 = 46,
    Unbind7 = 47,
    PopHandler = 48,
    PushConditionCase = 49,
    PushCatch = 50,
    Nth = 56,
    Symbolp = 57,
    Consp = 58,
    Stringp = 59,
    Listp = 60,
    Eq = 61,
    Memq = 62,
    Not = 63,
    Car = 64,
    Cdr = 65,
    Cons = 66,
    List1 = 67,
    List2 = 68,
    List3 = 69,
    List4 = 70,
    Length = 71,
    Aref = 72,
    Aset = 73,
    SymbolValue = 74,
    SymbolFunction = 75,
    Set = 76,
    Fset = 77,
    Get = 78,
    Substring = 79,
    Concat2 = 80,
    Concat3 = 81,
    Concat4 = 82,
    Sub1 = 83,
    Add1 = 84,
    Eqlsign = 85,
    Gtr = 86,
    Lss = 87,
    Leq = 88,
    Geq = 89,
    Diff = 90,
    Negate = 91,
    Plus = 92,
    Max = 93,
    Min = 94,
    Mult = 95,
    Point = 96,
    /// Obsolete; replaced by `SaveCurrentBuffer1`.
    SaveCurrentBuffer = 97,
    GotoChar = 98,
    Insert = 99,
    PointMax = 100,
    PointMin = 101,
    CharAfter = 102,
    FollowingChar = 103,
    PrecedingChar = 104,
    CurrentColumn = 105,
    IndentTo = 106,
    /// Obsolete; always signals.
    ScanBuffer = 107,
    Eolp = 108,
    Eobp = 109,
    Bolp = 110,
    Bobp = 111,
    CurrentBuffer = 112,
    SetBuffer = 113,
    SaveCurrentBuffer1 = 114,
    /// Obsolete; always signals.
    SetMark = 115,
    /// Obsolete.
    InteractiveP = 116,
    ForwardChar = 117,
    ForwardWord = 118,
    SkipCharsForward = 119,
    SkipCharsBackward = 120,
    ForwardLine = 121,
    CharSyntax = 122,
    BufferSubstring = 123,
    DeleteRegion = 124,
    NarrowToRegion = 125,
    Widen = 126,
    EndOfLine = 127,
    Constant2 = 129,
    Goto = 130,
    GotoIfNil = 131,
    GotoIfNonNil = 132,
    GotoIfNilElsePop = 133,
    GotoIfNonNilElsePop = 134,
    Return = 135,
    Discard = 136,
    Dup = 137,
    SaveExcursion = 138,
    /// Obsolete.
    SaveWindowExcursion = 139,
    SaveRestriction = 140,
    /// Obsolete; superseded by `PushCatch`.
    Catch = 141,
    UnwindProtect = 142,
    /// Obsolete; superseded by `PushConditionCase`.
    ConditionCase = 143,
    /// Obsolete.
    TempOutputBufferSetup = 144,
    /// Obsolete.
    TempOutputBufferShow = 145,
    /// Obsolete; never generated.
    UnbindAll = 146,
    SetMarker = 147,
    MatchBeginning = 148,
    MatchEnd = 149,
    Upcase = 150,
    Downcase = 151,
    StringEqlsign = 152,
    StringLss = 153,
    Equal = 154,
    Nthcdr = 155,
    Elt = 156,
    Member = 157,
    Assq = 158,
    Nreverse = 159,
    Setcar = 160,
    Setcdr = 161,
    CarSafe = 162,
    CdrSafe = 163,
    Nconc = 164,
    Quo = 165,
    Rem = 166,
    Numberp = 167,
    Integerp = 168,
    RGoto = 170,
    RGotoIfNil = 171,
    RGotoIfNonNil = 172,
    RGotoIfNilElsePop = 173,
    RGotoIfNonNilElsePop = 174,
    ListN = 175,
    ConcatN = 176,
    InsertN = 177,
    StackSet = 178,
    StackSet2 = 179,
    DiscardN = 182,
    Constant = 192,
}

impl Opcode {
    /// The opcode's name for diagnostics.
    #[must_use]
    pub fn name(self) -> &'static str {
        self.into()
    }

    /// Whether this opcode is one of the obsolete forms kept only for
    /// compatibility with old compiled code.
    #[must_use]
    pub fn is_obsolete(self) -> bool {
        matches!(
            self,
            Self::SaveCurrentBuffer
                | Self::ScanBuffer
                | Self::SetMark
                | Self::InteractiveP
                | Self::SaveWindowExcursion
                | Self::Catch
                | Self::ConditionCase
                | Self::TempOutputBufferSetup
                | Self::TempOutputBufferShow
                | Self::UnbindAll
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn discriminants_match_the_wire_format() {
        assert_eq!(Opcode::VarRef0 as u8, 8);
        assert_eq!(Opcode::Call0 as u8, 32);
        assert_eq!(Opcode::PushCatch as u8, 50);
        assert_eq!(Opcode::Return as u8, 0o207);
        assert_eq!(Opcode::RGoto as u8, 0o252);
        assert_eq!(Opcode::DiscardN as u8, 0o266);
        assert_eq!(CONSTANT_BASE, 0o300);
    }

    #[test]
    fn gaps_in_the_table_do_not_decode() {
        for byte in [0u8, 51, 52, 53, 54, 55, 128, 169, 180, 181, 183, 191] {
            assert_eq!(Opcode::from_repr(byte), None, "byte {byte} should be invalid");
        }
        assert_eq!(Opcode::from_repr(1), Some(Opcode::StackRef1));
        assert_eq!(Opcode::from_repr(192), Some(Opcode::Constant));
    }
}
