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

// Compile-time state for one function being parsed. One of these exists
// per nested `func` the parser is currently inside; the parser keeps a
// stack of them (outermost is the enclosing module's implicit top-level
// function).

use crate::gc::Gc;
use crate::instruction::{encode, Insn};
use crate::object::{ObjFn, ObjKind, ObjString};
use crate::value::{ObjIndex, Value};

/// A compile-time constant literal, turned into a real `Value` only once
/// the function is finished and its strings can be allocated on the GC
/// heap (see `FunctionBuilder::finish`).
#[derive(Clone, Debug, PartialEq)]
pub enum ConstLit {
    Num(f64),
    Str(String),
    Bool(bool),
    Null,
    /// A value already living on the GC heap - used for nested function
    /// and class literals, whose `ObjIndex` is known at parse time.
    Obj(Value),
}

struct Local {
    name: String,
}

pub struct FunctionBuilder {
    pub name: Option<String>,
    constants: Vec<ConstLit>,
    locals: Vec<Local>,
    scope_sizes: Vec<usize>,
    code: Vec<u32>,
    code_to_line: Vec<i32>,
    max_local_idx: usize,
    temp_mark: usize,
}

impl FunctionBuilder {
    pub fn new(name: Option<String>) -> Self {
        FunctionBuilder {
            name,
            constants: Vec::new(),
            locals: Vec::new(),
            scope_sizes: vec![0],
            code: Vec::new(),
            code_to_line: Vec::new(),
            max_local_idx: 0,
            temp_mark: 0,
        }
    }

    pub fn push_scope(&mut self) {
        self.scope_sizes.push(0);
    }

    pub fn pop_scope(&mut self) {
        let count = self.scope_sizes.pop().unwrap_or(0);
        let new_len = self.locals.len().saturating_sub(count);
        self.locals.truncate(new_len);
    }

    /// Returns `None` if `name` already exists in the *current* (innermost)
    /// scope - the caller reports that as a compile error. Shadowing an
    /// outer scope's local is allowed.
    pub fn decl_local(&mut self, name: &str) -> Option<usize> {
        let current_scope_count = *self.scope_sizes.last().unwrap_or(&0);
        let scope_start = self.locals.len() - current_scope_count;
        if self.locals[scope_start..].iter().any(|l| l.name == name) {
            return None;
        }
        let idx = self.locals.len();
        self.locals.push(Local {
            name: name.to_string(),
        });
        *self.scope_sizes.last_mut().unwrap() += 1;
        self.max_local_idx = self.max_local_idx.max(idx);
        Some(idx)
    }

    pub fn push_temp(&mut self, n: usize) -> usize {
        let mark = self.locals.len();
        for _ in 0..n {
            self.locals.push(Local {
                name: String::new(),
            });
        }
        self.max_local_idx = self.max_local_idx.max(self.locals.len().saturating_sub(1));
        self.temp_mark = mark;
        mark
    }

    pub fn pop_temp(&mut self, mark: usize) {
        self.locals.truncate(mark);
    }

    /// Promotes a register already holding a value (usually the result of
    /// an anonymous `push_temp`) into a named local of the current scope,
    /// without moving it. Used for `var x = expr;`, where the expression's
    /// result register becomes `x` directly instead of being copied again.
    pub fn declare_temp_as_local(&mut self, reg: usize, name: &str) -> Result<(), ()> {
        let current_scope_count = *self.scope_sizes.last().unwrap_or(&0);
        let scope_start = self.locals.len().saturating_sub(current_scope_count);
        if self.locals[scope_start..].iter().any(|l| l.name == name) {
            return Err(());
        }
        if reg >= self.locals.len() {
            return Err(());
        }
        self.locals[reg].name = name.to_string();
        *self.scope_sizes.last_mut().unwrap() += 1;
        Ok(())
    }

    /// Rewrites any `BREAK_PLACEHOLDER` word in `[start, end)` into an
    /// unconditional jump to `target`. Called once a loop's body has been
    /// fully compiled; nested loops patch their own placeholders first, so
    /// by the time an outer loop scans its range only its own breaks
    /// remain as placeholders.
    pub fn patch_breaks_in_range(&mut self, start: usize, end: usize, target: usize) {
        for ip in start..end {
            if self.code[ip] == crate::instruction::BREAK_PLACEHOLDER {
                let offset = target as i32 - (ip as i32 + 1);
                self.code[ip] = encode(Insn::asbx(crate::instruction::Op::Jump, 0, offset));
            }
        }
    }

    pub fn locals_len(&self) -> usize {
        self.locals.len()
    }

    pub fn lookup(&self, name: &str) -> Option<usize> {
        self.locals.iter().rposition(|l| l.name == name)
    }

    /// Every already-heap-allocated object this builder's constant pool
    /// references (nested function/class literals). Used to root them
    /// for GC while the builder itself is still in-progress Rust state,
    /// not yet a heap `ObjFn` - see `Parser::push_pending_roots`.
    pub fn root_objects(&self) -> impl Iterator<Item = ObjIndex> + '_ {
        self.constants.iter().filter_map(|c| match c {
            ConstLit::Obj(v) if v.is_ptr() => Some(v.as_ptr()),
            _ => None,
        })
    }

    pub fn add_constant(&mut self, value: ConstLit) -> u32 {
        if let Some(idx) = self.constants.iter().position(|c| *c == value) {
            return idx as u32;
        }
        let idx = self.constants.len() as u32;
        self.constants.push(value);
        idx
    }

    pub fn emit(&mut self, insn: Insn, line: i32) -> usize {
        let ip = self.code.len();
        self.code.push(encode(insn));
        self.code_to_line.push(line);
        ip
    }

    pub fn emit_placeholder(&mut self, line: i32) -> usize {
        let ip = self.code.len();
        self.code.push(crate::instruction::BREAK_PLACEHOLDER);
        self.code_to_line.push(line);
        ip
    }

    pub fn patch(&mut self, ip: usize, insn: Insn) {
        self.code[ip] = encode(insn);
    }

    pub fn here(&self) -> usize {
        self.code.len()
    }

    pub fn finish(self, arity: u8, module: ObjIndex, heap: &mut Gc) -> (ObjFn, Option<String>) {
        let constants = self
            .constants
            .into_iter()
            .map(|c| match c {
                ConstLit::Num(n) => Value::from_num(n),
                ConstLit::Bool(b) => Value::from_bool(b),
                ConstLit::Null => Value::null(),
                ConstLit::Str(s) => {
                    Value::from_ptr(heap.alloc(ObjKind::String(ObjString::from_value(s))))
                }
                ConstLit::Obj(v) => v,
            })
            .collect();
        // Register numbers and local indices are the same space: the
        // parser declares a dummy local 0 for the call's reserved return
        // slot, then one per parameter, before compiling the body - so
        // the highest local index IS the highest register the function
        // ever touches.
        let needed_stack_space = (self.max_local_idx + 1) as u16;
        (
            ObjFn {
                name: None,
                arity,
                code: self.code,
                constants,
                code_to_line: self.code_to_line,
                needed_stack_space,
                module,
            },
            self.name,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instruction::Op;

    #[test]
    fn decl_local_rejects_redeclaration_in_same_scope() {
        let mut b = FunctionBuilder::new(None);
        assert_eq!(b.decl_local("x"), Some(0));
        assert_eq!(b.decl_local("x"), None);
    }

    #[test]
    fn decl_local_allows_shadowing_in_nested_scope() {
        let mut b = FunctionBuilder::new(None);
        b.decl_local("x");
        b.push_scope();
        assert_eq!(b.decl_local("x"), Some(1));
        b.pop_scope();
        assert_eq!(b.lookup("x"), Some(0));
    }

    #[test]
    fn pop_scope_truncates_locals() {
        let mut b = FunctionBuilder::new(None);
        b.decl_local("a");
        b.push_scope();
        b.decl_local("b");
        b.decl_local("c");
        assert_eq!(b.lookup("c"), Some(2));
        b.pop_scope();
        assert_eq!(b.lookup("c"), None);
        assert_eq!(b.lookup("a"), Some(0));
    }

    #[test]
    fn constant_pool_deduplicates() {
        let mut b = FunctionBuilder::new(None);
        let a = b.add_constant(ConstLit::Num(1.0));
        let c = b.add_constant(ConstLit::Num(2.0));
        let a2 = b.add_constant(ConstLit::Num(1.0));
        assert_eq!(a, a2);
        assert_ne!(a, c);
    }

    #[test]
    fn emit_records_line_numbers() {
        let mut b = FunctionBuilder::new(None);
        b.emit(Insn::abc(Op::Not, 0, 0, 0), 10);
        b.emit(Insn::abc(Op::Not, 0, 0, 0), 11);
        assert_eq!(b.code_to_line, vec![10, 11]);
    }

    #[test]
    fn placeholder_can_be_patched() {
        let mut b = FunctionBuilder::new(None);
        let ip = b.emit_placeholder(1);
        assert_eq!(b.code[ip], crate::instruction::BREAK_PLACEHOLDER);
        b.patch(ip, Insn::asbx(Op::Jump, 0, 3));
        assert_ne!(b.code[ip], crate::instruction::BREAK_PLACEHOLDER);
    }
}
