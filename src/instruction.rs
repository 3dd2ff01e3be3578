// (C) 2020 Brandon Lewis
//
// This program is free software: you can redistribute it and/or
// modify it under the terms of the GNU Lesser General Public License
// as published by the Free Software Foundation, either version 3 of
// the License, or (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// Lesser General Public License for more details.
//
// You should have received a copy of the GNU Lesser General Public
// License along with this program.  If not, see
// <https://www.gnu.org/licenses/>.

// A single 32-bit word encodes every instruction:
//
//   bits  0..4   op      (5 bits, 0..31)
//   bits  5..13  a       (9 bits, 0..511)
//   bits 14..22  b / bx / sBx (18 bits)
//   bits 23..31  c       (9 bits, 0..511)
//
// `bx` reuses the same 18 bits as `b` when an instruction needs a wider
// unsigned operand (a constant-table index); `sBx` is the same bits
// biased by 2^17 for a signed relative jump. The all-ones word is never
// a valid instruction - it is the unresolved "break" placeholder the
// parser's loop epilogue patches.

pub const SBX_BIAS: i32 = 1 << 17;
pub const BREAK_PLACEHOLDER: u32 = u32::MAX;

const OP_BITS: u32 = 5;
const A_BITS: u32 = 9;
const BX_BITS: u32 = 18;
const C_BITS: u32 = 9;

const OP_SHIFT: u32 = 0;
const A_SHIFT: u32 = OP_SHIFT + OP_BITS;
const BX_SHIFT: u32 = A_SHIFT + A_BITS;
const C_SHIFT: u32 = BX_SHIFT + A_BITS;

const OP_MASK: u32 = (1 << OP_BITS) - 1;
const A_MASK: u32 = (1 << A_BITS) - 1;
const BX_MASK: u32 = (1 << BX_BITS) - 1;
const C_MASK: u32 = (1 << C_BITS) - 1;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Op {
    Return = 0,
    LoadSymbol = 1,
    StoreSymbol = 2,
    LoadBasic = 3,
    NewClz = 4,
    Not = 5,
    StoreMove = 6,
    CallFn = 7,
    MathAdd = 8,
    MathSub = 9,
    MathMul = 10,
    MathDiv = 11,
    CmpEe = 12,
    CmpNe = 13,
    CmpLt = 14,
    CmpGt = 15,
    CmpLe = 16,
    CmpGe = 17,
    CmpAnd = 18,
    CmpOr = 19,
    Jump = 20,
    JumpIf = 21,
    JumpIfNot = 22,
}

impl Op {
    pub fn from_u8(v: u8) -> Option<Op> {
        use Op::*;
        Some(match v {
            0 => Return,
            1 => LoadSymbol,
            2 => StoreSymbol,
            3 => LoadBasic,
            4 => NewClz,
            5 => Not,
            6 => StoreMove,
            7 => CallFn,
            8 => MathAdd,
            9 => MathSub,
            10 => MathMul,
            11 => MathDiv,
            12 => CmpEe,
            13 => CmpNe,
            14 => CmpLt,
            15 => CmpGt,
            16 => CmpLe,
            17 => CmpGe,
            18 => CmpAnd,
            19 => CmpOr,
            20 => Jump,
            21 => JumpIf,
            22 => JumpIfNot,
            _ => return None,
        })
    }
}

/// `LOAD_BASIC`'s `bx` operand selects amongst four special constants
/// before falling into the constant table.
pub const LOAD_BASIC_TRUE: u32 = 0;
pub const LOAD_BASIC_FALSE: u32 = 1;
pub const LOAD_BASIC_NULL: u32 = 2;
pub const LOAD_BASIC_CURRENT_MODULE: u32 = 3;
pub const LOAD_BASIC_CONST_OFFSET: u32 = 4;

/// Decoded, host-friendly view of one instruction word. `Insn` is never
/// stored in bytecode directly - `encode`/`decode` convert to and from
/// the packed `u32` that actually lives in a function's code vector.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Insn {
    pub op: Op,
    pub a: u16,
    pub b: u32,
    pub c: u16,
}

impl Insn {
    pub fn abc(op: Op, a: u16, b: u16, c: u16) -> Insn {
        Insn {
            op,
            a,
            b: b as u32,
            c,
        }
    }

    pub fn abx(op: Op, a: u16, bx: u32) -> Insn {
        Insn { op, a, b: bx, c: 0 }
    }

    pub fn asbx(op: Op, a: u16, sbx: i32) -> Insn {
        Insn {
            op,
            a,
            b: (sbx + SBX_BIAS) as u32,
            c: 0,
        }
    }

    pub fn sbx(self) -> i32 {
        self.b as i32 - SBX_BIAS
    }

    pub fn bx(self) -> u32 {
        self.b
    }

    pub fn b(self) -> u16 {
        (self.b & (A_MASK as u32)) as u16
    }
}

pub fn encode(insn: Insn) -> u32 {
    ((insn.op as u32 & OP_MASK) << OP_SHIFT)
        | ((insn.a as u32 & A_MASK) << A_SHIFT)
        | ((insn.b & BX_MASK) << BX_SHIFT)
        | ((insn.c as u32 & C_MASK) << C_SHIFT)
}

pub fn decode(word: u32) -> Option<Insn> {
    if word == BREAK_PLACEHOLDER {
        return None;
    }
    let op = Op::from_u8(((word >> OP_SHIFT) & OP_MASK) as u8)?;
    let a = ((word >> A_SHIFT) & A_MASK) as u16;
    let b = (word >> BX_SHIFT) & BX_MASK;
    let c = ((word >> C_SHIFT) & C_MASK) as u16;
    Some(Insn { op, a, b, c })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abc_round_trips() {
        let insn = Insn::abc(Op::MathAdd, 7, 511, 3);
        let word = encode(insn);
        assert_eq!(decode(word), Some(insn));
    }

    #[test]
    fn bx_round_trips_at_full_width() {
        let insn = Insn::abx(Op::LoadBasic, 2, (1 << 18) - 1);
        let word = encode(insn);
        let decoded = decode(word).unwrap();
        assert_eq!(decoded.bx(), (1 << 18) - 1);
    }

    #[test]
    fn sbx_round_trips_negative_offsets() {
        let insn = Insn::asbx(Op::Jump, 0, -100);
        let word = encode(insn);
        let decoded = decode(word).unwrap();
        assert_eq!(decoded.sbx(), -100);
    }

    #[test]
    fn sbx_round_trips_positive_offsets() {
        let insn = Insn::asbx(Op::Jump, 0, 5000);
        let word = encode(insn);
        assert_eq!(decode(word).unwrap().sbx(), 5000);
    }

    #[test]
    fn break_placeholder_decodes_to_none() {
        assert_eq!(decode(BREAK_PLACEHOLDER), None);
    }

    #[test]
    fn a_and_c_saturate_at_nine_bits() {
        let insn = Insn::abc(Op::StoreSymbol, 511, 0, 511);
        let word = encode(insn);
        let decoded = decode(word).unwrap();
        assert_eq!(decoded.a, 511);
        assert_eq!(decoded.c, 511);
    }
}
