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

// NaN-boxed value representation. A `Value` is a bare `u64`: either the
// bit pattern of a live IEEE-754 double, or a quiet-NaN payload carrying a
// 2-bit tag (Null / True / False) or, with the sign bit set, a 48-bit
// index into the GC's object arena.
//
// Same bit layout as a pointer-boxing NaN-tagged VM (e.g. wren, bifrost),
// except the "pointer" is an arena index rather than a raw address -
// there are no raw pointers into the heap anywhere in this crate.

use enumflags2::BitFlags;

use crate::gc::Gc;
use crate::object::ObjKind;

const QNAN: u64 = 0x7ffc_0000_0000_0000;
const SIGN_BIT: u64 = 0x8000_0000_0000_0000;
const TAG_MASK: u64 = 0x3;
const TAG_NULL: u64 = 1;
const TAG_TRUE: u64 = 2;
const TAG_FALSE: u64 = 3;
const PTR_MASK: u64 = SIGN_BIT | QNAN;

/// An index into `Gc`'s object arena. Never dereferenced directly; always
/// resolved through `Gc::get`/`Gc::get_mut`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ObjIndex(pub u32);

#[derive(Copy, Clone, PartialEq)]
pub struct Value(u64);

impl std::fmt::Debug for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_num() {
            write!(f, "Number({})", self.as_num())
        } else if self.is_bool() {
            write!(f, "Bool({})", self.as_bool())
        } else if self.is_null() {
            write!(f, "Null")
        } else {
            write!(f, "Ptr({:?})", self.as_ptr())
        }
    }
}

impl Value {
    pub fn null() -> Value {
        Value(QNAN | TAG_NULL)
    }

    pub fn from_bool(b: bool) -> Value {
        Value(QNAN | if b { TAG_TRUE } else { TAG_FALSE })
    }

    pub fn from_num(n: f64) -> Value {
        Value(n.to_bits())
    }

    pub fn from_ptr(idx: ObjIndex) -> Value {
        Value(PTR_MASK | idx.0 as u64)
    }

    #[inline]
    pub fn is_num(self) -> bool {
        (self.0 & QNAN) != QNAN
    }

    #[inline]
    pub fn is_bool(self) -> bool {
        (self.0 & PTR_MASK) == QNAN && matches!(self.0 & TAG_MASK, TAG_TRUE | TAG_FALSE)
    }

    #[inline]
    pub fn is_null(self) -> bool {
        (self.0 & PTR_MASK) == QNAN && (self.0 & TAG_MASK) == TAG_NULL
    }

    #[inline]
    pub fn is_ptr(self) -> bool {
        (self.0 & PTR_MASK) == PTR_MASK
    }

    /// Defined only when `is_num` holds.
    pub fn as_num(self) -> f64 {
        debug_assert!(self.is_num());
        f64::from_bits(self.0)
    }

    /// Defined only when `is_bool` holds.
    pub fn as_bool(self) -> bool {
        debug_assert!(self.is_bool());
        (self.0 & TAG_MASK) == TAG_TRUE
    }

    /// Defined only when `is_ptr` holds.
    pub fn as_ptr(self) -> ObjIndex {
        debug_assert!(self.is_ptr());
        ObjIndex((self.0 & !PTR_MASK) as u32)
    }

    /// Truthy = not null, not false, and not a weak reference whose
    /// target has gone away (spec.md 4.1).
    pub fn is_truthy(self, heap: &Gc) -> bool {
        if self.is_null() {
            return false;
        }
        if self.is_bool() {
            return self.as_bool();
        }
        if self.is_ptr() {
            if let Some(ObjKind::WeakRef(w)) = heap.kind(self.as_ptr()) {
                return w.data.is_some();
            }
        }
        true
    }

    pub fn type_tag(self, heap: &Gc) -> TypeTag {
        if self.is_num() {
            TypeTag::Number
        } else if self.is_bool() {
            TypeTag::Bool
        } else if self.is_null() {
            TypeTag::Null
        } else {
            match heap.kind(self.as_ptr()) {
                Some(ObjKind::Module(_)) => TypeTag::Module,
                Some(ObjKind::Class(_)) => TypeTag::Class,
                Some(ObjKind::Instance(_)) => TypeTag::Instance,
                Some(ObjKind::Function(_)) => TypeTag::Function,
                Some(ObjKind::NativeFn(_)) => TypeTag::NativeFn,
                Some(ObjKind::String(_)) => TypeTag::Str,
                Some(ObjKind::Reference(_)) => TypeTag::Reference,
                Some(ObjKind::WeakRef(_)) => TypeTag::WeakRef,
                None => TypeTag::Null,
            }
        }
    }

    // Numeric/pointer-identity equality, per spec.md 4.1: numbers by
    // value, strings by hash-then-content, any other object by identity,
    // different-type comparisons are false. This does NOT allocate, so it
    // is the one arithmetic-ish helper that lives directly on `Value`.
    pub fn eq(self, other: Value, heap: &Gc) -> bool {
        if self.is_num() && other.is_num() {
            return self.as_num() == other.as_num();
        }
        if self.is_bool() && other.is_bool() {
            return self.as_bool() == other.as_bool();
        }
        if self.is_null() && other.is_null() {
            return true;
        }
        if self.is_ptr() && other.is_ptr() {
            let a = self.as_ptr();
            let b = other.as_ptr();
            if a == b {
                return true;
            }
            if let (Some(ObjKind::String(sa)), Some(ObjKind::String(sb))) =
                (heap.kind(a), heap.kind(b))
            {
                return sa.hash == sb.hash && sa.value == sb.value;
            }
            return false;
        }
        false
    }
}

#[derive(BitFlags, Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u16)]
pub enum TypeTag {
    Null = 0b0000_0000_0001,
    Bool = 0b0000_0000_0010,
    Number = 0b0000_0000_0100,
    Str = 0b0000_0000_1000,
    Module = 0b0000_0001_0000,
    Class = 0b0000_0010_0000,
    Instance = 0b0000_0100_0000,
    Function = 0b0000_1000_0000,
    NativeFn = 0b0001_0000_0000,
    Reference = 0b0010_0000_0000,
    WeakRef = 0b0100_0000_0000,
}

pub type TypeSet = BitFlags<TypeTag>;

/// The coarser taxonomy the host API (section 6.1) actually sees via
/// `stack_get_type`. Several internal `TypeTag` kinds collapse to `Object`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum HostType {
    Undefined,
    Nil,
    Bool,
    Number,
    Str,
    Function,
    Object,
    Module,
}

impl From<TypeTag> for HostType {
    fn from(t: TypeTag) -> Self {
        match t {
            TypeTag::Null => HostType::Nil,
            TypeTag::Bool => HostType::Bool,
            TypeTag::Number => HostType::Number,
            TypeTag::Str => HostType::Str,
            TypeTag::Function | TypeTag::NativeFn => HostType::Function,
            TypeTag::Module => HostType::Module,
            TypeTag::Class | TypeTag::Instance | TypeTag::Reference | TypeTag::WeakRef => {
                HostType::Object
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gc::Gc;

    #[test]
    fn number_round_trips_bit_exact() {
        let samples = [
            0.0,
            -0.0,
            1.0,
            -1.0,
            f64::MIN_POSITIVE,
            -f64::MIN_POSITIVE,
            f64::INFINITY,
            f64::NEG_INFINITY,
            std::f64::consts::PI,
        ];
        for &n in &samples {
            let v = Value::from_num(n);
            assert!(v.is_num());
            assert_eq!(v.as_num().to_bits(), n.to_bits());
        }
    }

    #[test]
    fn bool_and_null_round_trip() {
        assert!(Value::from_bool(true).is_bool());
        assert!(Value::from_bool(true).as_bool());
        assert!(!Value::from_bool(false).as_bool());
        assert!(Value::null().is_null());
        assert!(!Value::null().is_bool());
        assert!(!Value::null().is_num());
    }

    #[test]
    fn truthiness_rules() {
        let heap = Gc::new(Default::default());
        assert!(!Value::null().is_truthy(&heap));
        assert!(!Value::from_bool(false).is_truthy(&heap));
        assert!(Value::from_bool(true).is_truthy(&heap));
        assert!(Value::from_num(0.0).is_truthy(&heap));
    }

    #[test]
    fn equality_is_reflexive_for_numbers() {
        let heap = Gc::new(Default::default());
        let a = Value::from_num(42.0);
        assert!(a.eq(a, &heap));
        assert!(!a.eq(Value::from_num(43.0), &heap));
        assert!(!a.eq(Value::null(), &heap));
    }
}
