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

// The eight heap object kinds, all sharing one GC header. Every object
// lives in `Gc`'s arena and is addressed by `ObjIndex`, never by a raw
// pointer - there is no `unsafe` anywhere in this module.

use std::collections::HashMap;

use crate::error::RuntimeError;
use crate::symbol::SymbolId;
use crate::value::{ObjIndex, Value};

/// Tri-state mark used by the tracing collector. `PendingFinalize` is a
/// separate state from `Unreachable` so a dead object with a `dtor` can
/// survive one extra sweep to run its finalizer before reclamation.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum GcMark {
    Unreachable,
    Reachable,
    PendingFinalize,
}

pub struct ObjHeader {
    pub mark: GcMark,
}

impl Default for ObjHeader {
    fn default() -> Self {
        ObjHeader {
            mark: GcMark::Unreachable,
        }
    }
}

// FNV-1a, 32-bit, matching the original C runtime's `bfVMString_hash`.
pub fn fnv1a_hash(bytes: &[u8]) -> u32 {
    const OFFSET_BASIS: u32 = 0x811c_9dc5;
    const PRIME: u32 = 0x0100_0193;
    bytes.iter().fold(OFFSET_BASIS, |hash, &b| {
        (hash ^ b as u32).wrapping_mul(PRIME)
    })
}

// Translates the escape sequences the lexer left untouched in the raw
// string-literal slice. Deferred here rather than done at lex time so the
// lexer never allocates for a token it might discard (e.g. on syntax
// error recovery).
pub fn unescape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('a') => out.push('\u{07}'),
            Some('b') => out.push('\u{08}'),
            Some('f') => out.push('\u{0C}'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('t') => out.push('\t'),
            Some('v') => out.push('\u{0B}'),
            Some('\\') => out.push('\\'),
            Some('\'') => out.push('\''),
            Some('"') => out.push('"'),
            Some('?') => out.push('?'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

pub struct ObjString {
    pub value: String,
    pub hash: u32,
}

impl ObjString {
    pub fn from_literal(raw: &str) -> Self {
        let value = unescape(raw);
        ObjString::from_value(value)
    }

    pub fn from_value(value: String) -> Self {
        let hash = fnv1a_hash(value.as_bytes());
        ObjString { value, hash }
    }
}

pub struct ObjFn {
    pub name: Option<ObjIndex>,
    pub arity: u8,
    pub code: Vec<u32>,
    pub constants: Vec<Value>,
    pub code_to_line: Vec<i32>,
    pub needed_stack_space: u16,
    pub module: ObjIndex,
}

pub type NativeFnPtr = fn(&mut crate::vm::Vm) -> Result<(), RuntimeError>;

pub struct ObjNativeFn {
    pub func: NativeFnPtr,
    pub arity: i32,
    pub statics: Vec<Value>,
    pub extra_data: Vec<u8>,
}

pub struct ObjModule {
    pub name: ObjIndex,
    pub variables: HashMap<SymbolId, Value>,
    pub init_fn: Option<ObjIndex>,
}

impl ObjModule {
    pub fn new(name: ObjIndex) -> Self {
        ObjModule {
            name,
            variables: HashMap::new(),
            init_fn: None,
        }
    }
}

pub struct ObjClass {
    pub name: ObjIndex,
    pub base_clz: Option<ObjIndex>,
    pub module: ObjIndex,
    pub symbols: HashMap<SymbolId, Value>,
    pub field_initializers: Vec<(SymbolId, Value)>,
    pub extra_data_size: usize,
    pub finalizer: Option<SymbolId>,
}

impl ObjClass {
    pub fn new(name: ObjIndex, module: ObjIndex) -> Self {
        ObjClass {
            name,
            base_clz: None,
            module,
            symbols: HashMap::new(),
            field_initializers: Vec::new(),
            extra_data_size: 0,
            finalizer: None,
        }
    }
}

pub struct ObjInstance {
    pub clz: ObjIndex,
    pub fields: HashMap<SymbolId, Value>,
    pub extra_data: Vec<u8>,
}

impl ObjInstance {
    pub fn new(clz: ObjIndex, extra_data_size: usize) -> Self {
        ObjInstance {
            clz,
            fields: HashMap::new(),
            extra_data: vec![0; extra_data_size],
        }
    }
}

pub struct ObjReference {
    pub clz: Option<ObjIndex>,
    pub extra_data: Vec<u8>,
}

// A weak reference. `data` is cleared to `None` by the collector when the
// pointee is swept, rather than left dangling (spec.md 4.1's truthiness
// rule for a "dead" weak ref depends on this).
pub struct ObjWeakRef {
    pub clz: Option<ObjIndex>,
    pub data: Option<ObjIndex>,
}

pub enum ObjKind {
    Module(ObjModule),
    Class(ObjClass),
    Instance(ObjInstance),
    Function(ObjFn),
    NativeFn(ObjNativeFn),
    String(ObjString),
    Reference(ObjReference),
    WeakRef(ObjWeakRef),
}

impl ObjKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            ObjKind::Module(_) => "module",
            ObjKind::Class(_) => "class",
            ObjKind::Instance(_) => "instance",
            ObjKind::Function(_) => "function",
            ObjKind::NativeFn(_) => "native fn",
            ObjKind::String(_) => "string",
            ObjKind::Reference(_) => "reference",
            ObjKind::WeakRef(_) => "weak ref",
        }
    }
}

pub struct Object {
    pub header: ObjHeader,
    pub kind: ObjKind,
}

impl Object {
    pub fn new(kind: ObjKind) -> Self {
        Object {
            header: ObjHeader::default(),
            kind,
        }
    }

    // Visits every `ObjIndex` this object directly owns, for the GC's
    // transitive mark phase. Weak references are deliberately NOT
    // followed - that is the entire point of a weak reference.
    pub fn trace(&self, mut visit: impl FnMut(ObjIndex)) {
        match &self.kind {
            ObjKind::Module(m) => {
                visit(m.name);
                if let Some(f) = m.init_fn {
                    visit(f);
                }
                for v in m.variables.values() {
                    trace_value(*v, &mut visit);
                }
            }
            ObjKind::Class(c) => {
                visit(c.name);
                visit(c.module);
                if let Some(base) = c.base_clz {
                    visit(base);
                }
                for v in c.symbols.values() {
                    trace_value(*v, &mut visit);
                }
                for (_, v) in &c.field_initializers {
                    trace_value(*v, &mut visit);
                }
            }
            ObjKind::Instance(i) => {
                visit(i.clz);
                for v in i.fields.values() {
                    trace_value(*v, &mut visit);
                }
            }
            ObjKind::Function(f) => {
                if let Some(n) = f.name {
                    visit(n);
                }
                visit(f.module);
                for v in &f.constants {
                    trace_value(*v, &mut visit);
                }
            }
            ObjKind::NativeFn(n) => {
                for v in &n.statics {
                    trace_value(*v, &mut visit);
                }
            }
            ObjKind::String(_) => {}
            ObjKind::Reference(r) => {
                if let Some(c) = r.clz {
                    visit(c);
                }
            }
            ObjKind::WeakRef(w) => {
                if let Some(c) = w.clz {
                    visit(c);
                }
                // w.data is intentionally not traced: a weak reference
                // must never keep its target alive.
            }
        }
    }
}

fn trace_value(v: Value, visit: &mut impl FnMut(ObjIndex)) {
    if v.is_ptr() {
        visit(v.as_ptr());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fnv1a_matches_known_vector() {
        // FNV-1a 32-bit of the empty string is the offset basis itself.
        assert_eq!(fnv1a_hash(b""), 0x811c_9dc5);
    }

    #[test]
    fn unescape_translates_common_sequences() {
        assert_eq!(unescape("a\\nb"), "a\nb");
        assert_eq!(unescape("\\t\\\\\\\""), "\t\\\"");
        assert_eq!(unescape("no escapes here"), "no escapes here");
    }

    #[test]
    fn unescape_leaves_unknown_sequence_intact() {
        assert_eq!(unescape("\\q"), "\\q");
    }
}
