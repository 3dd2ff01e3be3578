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

// Execution Model
// ---------------
// A `Vm` owns a slot stack of `Value`, a stack of call `Frame`s, the GC
// heap, the symbol table, and the module table. Dispatch is a simple
// `loop { decode; match op; advance or branch }` over one function's
// code at a time; `CALL_FN` into a bytecode function pushes a `Frame`
// and the loop keeps going against the new frame's code, `RETURN` pops
// it and resumes the caller exactly where it left off.
//
// Slot addressing is always frame-relative: register `r` in the
// currently executing frame is `stack[frame.stack_base + r]`. The public
// host API (see `api.rs`) instead addresses slots relative to the
// current stack top - the two numbering schemes never appear together
// in the same function.

use std::collections::HashMap;

use crate::error::{ErrorKind, RuntimeError};
use crate::gc::{Gc, GcConfig};
use crate::instruction::{
    decode, Insn, Op, LOAD_BASIC_CONST_OFFSET, LOAD_BASIC_CURRENT_MODULE, LOAD_BASIC_FALSE,
    LOAD_BASIC_NULL, LOAD_BASIC_TRUE,
};
use crate::object::{ObjFn, ObjInstance, ObjKind, ObjModule, ObjString};
use crate::symbol::{BuiltinSymbols, SymbolId, SymbolTable};
use crate::value::{ObjIndex, Value};

pub type ModuleLookupFn = fn(&mut Vm, importer: &str, imported: &str) -> Option<String>;
pub type PrintFn = fn(&str);
pub type ErrorFn = fn(ErrorKind, i32, &str);

struct Frame {
    func: ObjIndex,
    ip: usize,
    stack_base: usize,
}

pub struct Handle {
    pub value: Value,
}

pub struct Vm {
    pub heap: Gc,
    pub symbols: SymbolTable,
    pub builtins: BuiltinSymbols,
    pub(crate) stack: Vec<Value>,
    frames: Vec<Frame>,
    pub(crate) modules: HashMap<String, ObjIndex>,
    handles: Vec<Option<Handle>>,
    handle_free_list: Vec<u32>,
    /// Objects already allocated by an in-progress parser (nested
    /// function/class literals, class bodies under construction) that
    /// aren't reachable from any other root yet. `import` can trigger a
    /// nested `exec_in_module` call, which may itself run a GC cycle
    /// mid-parse - spec.md 3/4.8 requires these survive that. A flat list
    /// rather than a per-parser stack: `truncate_parser_roots` unwinds
    /// however many entries the innermost `import` pushed.
    parser_roots: Vec<ObjIndex>,
    pub last_error: String,
    pub on_error: Option<ErrorFn>,
    pub on_print: Option<PrintFn>,
    pub on_module_lookup: Option<ModuleLookupFn>,
}

pub type HandleId = u32;

impl Vm {
    pub fn new() -> Self {
        let mut symbols = SymbolTable::new();
        let builtins = BuiltinSymbols::install(&mut symbols);
        Vm {
            heap: Gc::new(GcConfig::default()),
            symbols,
            builtins,
            stack: Vec::new(),
            frames: Vec::new(),
            modules: HashMap::new(),
            handles: Vec::new(),
            handle_free_list: Vec::new(),
            parser_roots: Vec::new(),
            last_error: String::new(),
            on_error: None,
            on_print: None,
            on_module_lookup: None,
        }
    }

    // --- stack / handles ---------------------------------------------------

    pub fn stack_size(&self) -> usize {
        self.stack.len()
    }

    pub fn stack_resize(&mut self, n: usize) {
        if n > self.stack.len() {
            self.stack.resize(n, Value::null());
        } else {
            self.stack.truncate(n);
        }
    }

    fn top_slot(&self, slot: usize) -> usize {
        self.stack.len() - 1 - slot
    }

    pub fn stack_get(&self, slot: usize) -> Value {
        self.stack[self.top_slot(slot)]
    }

    pub fn stack_set(&mut self, slot: usize, v: Value) {
        let idx = self.top_slot(slot);
        self.stack[idx] = v;
    }

    pub fn make_handle(&mut self, value: Value) -> HandleId {
        if let Some(id) = self.handle_free_list.pop() {
            self.handles[id as usize] = Some(Handle { value });
            id
        } else {
            let id = self.handles.len() as u32;
            self.handles.push(Some(Handle { value }));
            id
        }
    }

    pub fn handle_value(&self, id: HandleId) -> Option<Value> {
        self.handles
            .get(id as usize)
            .and_then(|h| h.as_ref())
            .map(|h| h.value)
    }

    pub fn destroy_handle(&mut self, id: HandleId) {
        if (id as usize) < self.handles.len() {
            self.handles[id as usize] = None;
            self.handle_free_list.push(id);
        }
    }

    pub(crate) fn push(&mut self, v: Value) {
        self.stack.push(v);
    }

    fn collect_roots(&self) -> Vec<Value> {
        let mut roots: Vec<Value> = self.stack.clone();
        for h in self.handles.iter().flatten() {
            roots.push(h.value);
        }
        for idx in self.modules.values() {
            roots.push(Value::from_ptr(*idx));
        }
        for f in &self.frames {
            roots.push(Value::from_ptr(f.func));
        }
        for idx in &self.parser_roots {
            roots.push(Value::from_ptr(*idx));
        }
        roots
    }

    /// Current length of the parser-roots list, for an in-progress
    /// parser to save before pushing its own pending allocations and
    /// restore (via `truncate_parser_roots`) once they're no longer at
    /// risk (either consumed, or attached to something else reachable).
    pub(crate) fn parser_roots_mark(&self) -> usize {
        self.parser_roots.len()
    }

    pub(crate) fn push_parser_roots(&mut self, idxs: impl Iterator<Item = ObjIndex>) {
        self.parser_roots.extend(idxs);
    }

    pub(crate) fn truncate_parser_roots(&mut self, mark: usize) {
        self.parser_roots.truncate(mark);
    }

    /// Runs a GC cycle if the heap has grown past its budget. Exposed
    /// directly for the host's `gc()` API call as well.
    pub fn maybe_collect(&mut self) {
        if self.heap.should_collect() {
            self.collect_now();
        }
    }

    pub fn collect_now(&mut self) {
        let roots = self.collect_roots();
        let to_finalize = self.heap.collect(roots.iter());
        for idx in to_finalize {
            self.run_finalizer(idx);
            self.heap.reclaim_finalized(idx);
        }
        self.heap.sweep();
        self.heap.end_cycle();
    }

    /// The `ObjIndex` of the native function currently executing, if the
    /// top call frame is one. A running native closure reads this to
    /// find its own captured statics - see `closure_get_static` in
    /// `api.rs`, the one host-API accessor spec.md 6.3 gives no explicit
    /// closure slot, since it's meant to be called from inside the
    /// closure itself.
    pub(crate) fn current_native_fn(&self) -> Option<ObjIndex> {
        let f = self.frames.last()?;
        match self.heap.kind(f.func) {
            Some(ObjKind::NativeFn(_)) => Some(f.func),
            _ => None,
        }
    }

    pub(crate) fn run_finalizer(&mut self, idx: ObjIndex) {
        let clz = match self.heap.kind(idx) {
            Some(ObjKind::Instance(i)) => i.clz,
            _ => return,
        };
        let dtor_sym = self.builtins.dtor;
        if let Some(method) = self.resolve_method(clz, dtor_sym) {
            let receiver = Value::from_ptr(idx);
            let _ = self.call_value(method, &[receiver]);
        }
    }

    // --- symbol / method resolution ------------------------------------------

    pub(crate) fn resolve_method(&self, clz: ObjIndex, sym: SymbolId) -> Option<Value> {
        let mut cur = Some(clz);
        while let Some(c) = cur {
            match self.heap.kind(c) {
                Some(ObjKind::Class(class)) => {
                    if let Some(v) = class.symbols.get(&sym) {
                        return Some(*v);
                    }
                    cur = class.base_clz;
                }
                _ => return None,
            }
        }
        None
    }

    pub(crate) fn load_symbol(&mut self, container: Value, sym: SymbolId) -> Result<Value, RuntimeError> {
        if container.is_ptr() {
            let idx = container.as_ptr();
            match self.heap.kind(idx) {
                Some(ObjKind::Instance(inst)) => {
                    if let Some(v) = inst.fields.get(&sym) {
                        return Ok(*v);
                    }
                    let clz = inst.clz;
                    return self.resolve_method(clz, sym).ok_or_else(|| {
                        RuntimeError::UnknownSymbol(self.symbols.name(sym).to_string())
                    });
                }
                Some(ObjKind::Class(_)) => {
                    return self.resolve_method(idx, sym).ok_or_else(|| {
                        RuntimeError::UnknownSymbol(self.symbols.name(sym).to_string())
                    });
                }
                Some(ObjKind::Module(module)) => {
                    return Ok(*module.variables.get(&sym).unwrap_or(&Value::null()));
                }
                _ => {}
            }
        }
        Err(RuntimeError::NotCallable)
    }

    pub(crate) fn store_symbol(
        &mut self,
        container: Value,
        sym: SymbolId,
        value: Value,
    ) -> Result<(), RuntimeError> {
        if container.is_ptr() {
            let idx = container.as_ptr();
            match self.heap.kind_mut(idx) {
                Some(ObjKind::Instance(inst)) => {
                    inst.fields.insert(sym, value);
                    return Ok(());
                }
                Some(ObjKind::Class(class)) => {
                    class.symbols.insert(sym, value);
                    return Ok(());
                }
                Some(ObjKind::Module(module)) => {
                    module.variables.insert(sym, value);
                    return Ok(());
                }
                _ => {}
            }
        }
        Err(RuntimeError::NotCallable)
    }

    // --- string conversion / arithmetic --------------------------------------

    pub fn stringify(&self, v: Value) -> String {
        if v.is_num() {
            let n = v.as_num();
            if n.fract() == 0.0 && n.abs() < 1e15 {
                format!("{}", n as i64)
            } else {
                format!("{}", n)
            }
        } else if v.is_bool() {
            v.as_bool().to_string()
        } else if v.is_null() {
            "null".to_string()
        } else {
            match self.heap.kind(v.as_ptr()) {
                Some(ObjKind::String(s)) => s.value.clone(),
                Some(other) => format!("<{}>", other.type_name()),
                None => "<invalid>".to_string(),
            }
        }
    }

    pub fn alloc_string(&mut self, s: String) -> Value {
        Value::from_ptr(self.heap.alloc(ObjKind::String(ObjString::from_value(s))))
    }

    fn is_string_val(&self, v: Value) -> bool {
        v.is_ptr() && matches!(self.heap.kind(v.as_ptr()), Some(ObjKind::String(_)))
    }

    fn add(&mut self, a: Value, b: Value) -> Result<Value, RuntimeError> {
        if a.is_num() && b.is_num() {
            return Ok(Value::from_num(a.as_num() + b.as_num()));
        }
        if self.is_string_val(a) || self.is_string_val(b) {
            let mut out = self.stringify(a);
            out.push_str(&self.stringify(b));
            return Ok(self.alloc_string(out));
        }
        Err(RuntimeError::TypeError {
            expect: crate::value::TypeTag::Number.into(),
            got: a.type_tag(&self.heap),
        })
    }

    fn numeric_binop(
        &self,
        a: Value,
        b: Value,
        f: impl Fn(f64, f64) -> f64,
    ) -> Result<Value, RuntimeError> {
        if !a.is_num() || !b.is_num() {
            return Err(RuntimeError::TypeError {
                expect: crate::value::TypeTag::Number.into(),
                got: if a.is_num() {
                    b.type_tag(&self.heap)
                } else {
                    a.type_tag(&self.heap)
                },
            });
        }
        Ok(Value::from_num(f(a.as_num(), b.as_num())))
    }

    fn compare(&self, a: Value, b: Value, f: impl Fn(f64, f64) -> bool) -> Value {
        if a.is_num() && b.is_num() {
            Value::from_bool(f(a.as_num(), b.as_num()))
        } else {
            Value::from_bool(false)
        }
    }

    // --- modules -------------------------------------------------------------

    pub fn module_make(&mut self, name: &str) -> ObjIndex {
        let name_val = self.alloc_string(name.to_string());
        let idx = self
            .heap
            .alloc(ObjKind::Module(ObjModule::new(name_val.as_ptr())));
        self.modules.insert(name.to_string(), idx);
        idx
    }

    pub fn module_by_name(&self, name: &str) -> Option<ObjIndex> {
        self.modules.get(name).copied()
    }

    // --- calling ---------------------------------------------------------------

    pub fn call_named(
        &mut self,
        module: &str,
        fn_name: &str,
        args: &[Value],
    ) -> Result<Value, RuntimeError> {
        let module_idx = self
            .module_by_name(module)
            .ok_or_else(|| RuntimeError::UnknownSymbol(module.to_string()))?;
        let sym = self.symbols.intern(fn_name);
        let callee = match self.heap.kind(module_idx) {
            Some(ObjKind::Module(m)) => *m
                .variables
                .get(&sym)
                .ok_or_else(|| RuntimeError::UnknownSymbol(fn_name.to_string()))?,
            _ => return Err(RuntimeError::NotCallable),
        };
        self.call_value(callee, args)
    }

    /// Resolves receiver rewriting exactly as `CALL_FN` would, then
    /// either runs a native function to completion or drives the
    /// bytecode dispatch loop. Used by the host API's `call` and by
    /// finalizer/import dispatch.
    pub fn call_value(&mut self, callee: Value, args: &[Value]) -> Result<Value, RuntimeError> {
        let (resolved, full_args) = self.rewrite_callee(callee, args)?;
        if !resolved.is_ptr() {
            return Err(RuntimeError::NotCallable);
        }
        match self.heap.kind(resolved.as_ptr()) {
            Some(ObjKind::NativeFn(nf)) => {
                if nf.arity >= 0 && nf.arity as usize != full_args.len() {
                    return Err(RuntimeError::Arity {
                        expected: nf.arity,
                        got: full_args.len(),
                    });
                }
                let func = nf.func;
                let base = self.stack.len();
                self.push(Value::null());
                for a in &full_args {
                    self.push(*a);
                }
                self.frames.push(Frame {
                    func: resolved.as_ptr(),
                    ip: 0,
                    stack_base: base,
                });
                let result = func(self);
                self.frames.pop();
                let retval = self.stack.pop().unwrap_or_else(Value::null);
                self.stack.truncate(base);
                result?;
                Ok(retval)
            }
            Some(ObjKind::Function(f)) => {
                let arity = f.arity as i32;
                let needed = f.needed_stack_space as usize;
                if arity as usize != full_args.len() {
                    return Err(RuntimeError::Arity {
                        expected: arity,
                        got: full_args.len(),
                    });
                }
                let base = self.stack.len();
                self.push(Value::null());
                for a in &full_args {
                    self.push(*a);
                }
                if self.stack.len() < base + needed {
                    self.stack.resize(base + needed, Value::null());
                }
                let depth = self.frames.len();
                self.frames.push(Frame {
                    func: resolved.as_ptr(),
                    ip: 0,
                    stack_base: base,
                });
                match self.run(depth) {
                    Ok(()) => Ok(self.stack[base]),
                    Err(e) => {
                        self.stack.truncate(base);
                        self.frames.truncate(depth);
                        Err(e)
                    }
                }
            }
            _ => Err(RuntimeError::NotCallable),
        }
    }

    fn rewrite_callee(
        &mut self,
        callee: Value,
        args: &[Value],
    ) -> Result<(Value, Vec<Value>), RuntimeError> {
        if !callee.is_ptr() {
            return Err(RuntimeError::NotCallable);
        }
        let call_sym = self.builtins.call;
        match self.heap.kind(callee.as_ptr()) {
            Some(ObjKind::Instance(inst)) => {
                let clz = inst.clz;
                let method = self.resolve_method(clz, call_sym).ok_or(RuntimeError::NotCallable)?;
                let mut full = Vec::with_capacity(args.len() + 1);
                full.push(callee);
                full.extend_from_slice(args);
                Ok((method, full))
            }
            Some(ObjKind::Reference(r)) => {
                let clz = r.clz.ok_or(RuntimeError::NotCallable)?;
                let method = self.resolve_method(clz, call_sym).ok_or(RuntimeError::NotCallable)?;
                let mut full = Vec::with_capacity(args.len() + 1);
                full.push(callee);
                full.extend_from_slice(args);
                Ok((method, full))
            }
            Some(ObjKind::Class(_)) => {
                let method = self
                    .resolve_method(callee.as_ptr(), call_sym)
                    .ok_or(RuntimeError::NotCallable)?;
                let mut full = Vec::with_capacity(args.len() + 1);
                full.push(callee);
                full.extend_from_slice(args);
                Ok((method, full))
            }
            Some(ObjKind::Function(_)) | Some(ObjKind::NativeFn(_)) => Ok((callee, args.to_vec())),
            _ => Err(RuntimeError::NotCallable),
        }
    }

    // --- dispatch loop -----------------------------------------------------------

    pub(crate) fn reg(&self, r: u16) -> usize {
        self.frames.last().unwrap().stack_base + r as usize
    }

    fn run(&mut self, stop_depth: usize) -> Result<(), RuntimeError> {
        while self.frames.len() > stop_depth {
            self.maybe_collect();
            let frame_idx = self.frames.len() - 1;
            let ip = self.frames[frame_idx].ip;
            let func = self.frames[frame_idx].func;
            let word = match self.heap.kind(func) {
                Some(ObjKind::Function(f)) => f.code.get(ip).copied(),
                _ => None,
            };
            let word = match word {
                Some(w) => w,
                None => return Err(RuntimeError::IllegalAddr(ip)),
            };
            let insn = match decode(word) {
                Some(i) => i,
                None => return Err(self.fail(RuntimeError::IllegalOpcode)),
            };
            self.frames[frame_idx].ip += 1;
            if let Err(e) = self.dispatch(insn) {
                return Err(self.fail(e));
            }
        }
        Ok(())
    }

    fn fail(&mut self, e: RuntimeError) -> RuntimeError {
        self.last_error = format!("{}", e);
        if let Some(cb) = self.on_error {
            let msg = self.last_error.clone();
            cb(ErrorKind::StackTraceBegin, -1, &msg);
            for frame in self.frames.iter().rev() {
                let line = match self.heap.kind(frame.func) {
                    Some(ObjKind::Function(f)) => f
                        .code_to_line
                        .get(frame.ip.saturating_sub(1))
                        .copied()
                        .unwrap_or(-1),
                    _ => -1,
                };
                cb(ErrorKind::Runtime, line, &msg);
            }
            cb(ErrorKind::StackTraceEnd, -1, "");
        }
        e
    }

    fn dispatch(&mut self, insn: Insn) -> Result<(), RuntimeError> {
        match insn.op {
            Op::Return => self.op_return(insn),
            Op::LoadSymbol => self.op_load_symbol(insn),
            Op::StoreSymbol => self.op_store_symbol(insn),
            Op::LoadBasic => self.op_load_basic(insn),
            Op::NewClz => self.op_new_clz(insn),
            Op::Not => {
                let v = self.stack[self.reg(insn.b())];
                let truthy = v.is_truthy(&self.heap);
                self.stack[self.reg(insn.a)] = Value::from_bool(!truthy);
                Ok(())
            }
            Op::StoreMove => {
                let v = self.stack[self.reg(insn.bx() as u16)];
                self.stack[self.reg(insn.a)] = v;
                Ok(())
            }
            Op::CallFn => self.op_call_fn(insn),
            Op::MathAdd => self.binop(insn, |vm, a, b| vm.add(a, b)),
            Op::MathSub => self.binop(insn, |vm, a, b| vm.numeric_binop(a, b, |x, y| x - y)),
            Op::MathMul => self.binop(insn, |vm, a, b| vm.numeric_binop(a, b, |x, y| x * y)),
            Op::MathDiv => self.binop(insn, |vm, a, b| {
                if b.is_num() && b.as_num() == 0.0 {
                    return Err(RuntimeError::DivideByZero);
                }
                vm.numeric_binop(a, b, |x, y| x / y)
            }),
            Op::CmpEe => {
                let (a, b) = self.read_bc(insn);
                let r = a.eq(b, &self.heap);
                self.stack[self.reg(insn.a)] = Value::from_bool(r);
                Ok(())
            }
            Op::CmpNe => {
                let (a, b) = self.read_bc(insn);
                let r = a.eq(b, &self.heap);
                self.stack[self.reg(insn.a)] = Value::from_bool(!r);
                Ok(())
            }
            Op::CmpLt => {
                let (a, b) = self.read_bc(insn);
                self.stack[self.reg(insn.a)] = self.compare(a, b, |x, y| x < y);
                Ok(())
            }
            Op::CmpGt => {
                let (a, b) = self.read_bc(insn);
                self.stack[self.reg(insn.a)] = self.compare(a, b, |x, y| x > y);
                Ok(())
            }
            Op::CmpLe => {
                let (a, b) = self.read_bc(insn);
                self.stack[self.reg(insn.a)] = self.compare(a, b, |x, y| x <= y);
                Ok(())
            }
            Op::CmpGe => {
                let (a, b) = self.read_bc(insn);
                self.stack[self.reg(insn.a)] = self.compare(a, b, |x, y| x >= y);
                Ok(())
            }
            Op::CmpAnd => {
                let (a, b) = self.read_bc(insn);
                let r = a.is_truthy(&self.heap) && b.is_truthy(&self.heap);
                self.stack[self.reg(insn.a)] = Value::from_bool(r);
                Ok(())
            }
            Op::CmpOr => {
                let (a, b) = self.read_bc(insn);
                let r = a.is_truthy(&self.heap) || b.is_truthy(&self.heap);
                self.stack[self.reg(insn.a)] = Value::from_bool(r);
                Ok(())
            }
            Op::Jump => {
                let frame = self.frames.last_mut().unwrap();
                frame.ip = (frame.ip as i64 + insn.sbx() as i64) as usize;
                Ok(())
            }
            Op::JumpIf => {
                let cond = self.stack[self.reg(insn.a)];
                if cond.is_truthy(&self.heap) {
                    let frame = self.frames.last_mut().unwrap();
                    frame.ip = (frame.ip as i64 + insn.sbx() as i64) as usize;
                }
                Ok(())
            }
            Op::JumpIfNot => {
                let cond = self.stack[self.reg(insn.a)];
                if !cond.is_truthy(&self.heap) {
                    let frame = self.frames.last_mut().unwrap();
                    frame.ip = (frame.ip as i64 + insn.sbx() as i64) as usize;
                }
                Ok(())
            }
        }
    }

    fn read_bc(&self, insn: Insn) -> (Value, Value) {
        (self.stack[self.reg(insn.b())], self.stack[self.reg(insn.c)])
    }

    fn binop(
        &mut self,
        insn: Insn,
        f: impl Fn(&mut Vm, Value, Value) -> Result<Value, RuntimeError>,
    ) -> Result<(), RuntimeError> {
        let a = self.stack[self.reg(insn.b())];
        let b = self.stack[self.reg(insn.c)];
        let result = f(self, a, b)?;
        self.stack[self.reg(insn.a)] = result;
        Ok(())
    }

    fn op_return(&mut self, insn: Insn) -> Result<(), RuntimeError> {
        let frame = self.frames.last().unwrap();
        let src_abs = frame.stack_base + insn.bx() as usize;
        let dest_abs = frame.stack_base;
        let retval = self.stack[src_abs];
        self.stack[dest_abs] = retval;
        self.stack.truncate(dest_abs + 1);
        self.frames.pop();
        Ok(())
    }

    fn op_load_symbol(&mut self, insn: Insn) -> Result<(), RuntimeError> {
        let container = self.stack[self.reg(insn.b())];
        let sym = SymbolId(insn.c as u32);
        let v = self.load_symbol(container, sym)?;
        self.stack[self.reg(insn.a)] = v;
        Ok(())
    }

    fn op_store_symbol(&mut self, insn: Insn) -> Result<(), RuntimeError> {
        let container = self.stack[self.reg(insn.a)];
        let sym = SymbolId(insn.b() as u32);
        let value = self.stack[self.reg(insn.c)];
        self.store_symbol(container, sym, value)
    }

    fn op_load_basic(&mut self, insn: Insn) -> Result<(), RuntimeError> {
        let bx = insn.bx();
        let v = match bx {
            LOAD_BASIC_TRUE => Value::from_bool(true),
            LOAD_BASIC_FALSE => Value::from_bool(false),
            LOAD_BASIC_NULL => Value::null(),
            LOAD_BASIC_CURRENT_MODULE => {
                let func = self.frames.last().unwrap().func;
                match self.heap.kind(func) {
                    Some(ObjKind::Function(f)) => Value::from_ptr(f.module),
                    _ => Value::null(),
                }
            }
            _ => {
                let func = self.frames.last().unwrap().func;
                let k = (bx - LOAD_BASIC_CONST_OFFSET) as usize;
                match self.heap.kind(func) {
                    Some(ObjKind::Function(f)) => *f.constants.get(k).unwrap_or(&Value::null()),
                    _ => Value::null(),
                }
            }
        };
        self.stack[self.reg(insn.a)] = v;
        Ok(())
    }

    fn op_new_clz(&mut self, insn: Insn) -> Result<(), RuntimeError> {
        let clz_val = self.stack[self.reg(insn.bx() as u16)];
        if !clz_val.is_ptr() {
            return Err(RuntimeError::NotCallable);
        }
        let clz_idx = clz_val.as_ptr();
        let (extra_size, inits) = match self.heap.kind(clz_idx) {
            Some(ObjKind::Class(c)) => (c.extra_data_size, c.field_initializers.clone()),
            _ => return Err(RuntimeError::NotCallable),
        };
        let mut inst = ObjInstance::new(clz_idx, extra_size);
        for (sym, v) in inits {
            inst.fields.insert(sym, v);
        }
        self.heap.push_temp_root(clz_idx).ok();
        let idx = self.heap.alloc(ObjKind::Instance(inst));
        self.heap.pop_temp_root();
        self.stack[self.reg(insn.a)] = Value::from_ptr(idx);
        Ok(())
    }

    fn op_call_fn(&mut self, insn: Insn) -> Result<(), RuntimeError> {
        let callee = self.stack[self.reg(insn.b())];
        let arg_start = self.reg(insn.a);
        let num_args = insn.c as usize;
        let args: Vec<Value> = self.stack[arg_start..arg_start + num_args].to_vec();
        let (resolved, full_args) = self.rewrite_callee(callee, &args)?;
        if !resolved.is_ptr() {
            return Err(RuntimeError::NotCallable);
        }
        match self.heap.kind(resolved.as_ptr()) {
            Some(ObjKind::NativeFn(nf)) => {
                if nf.arity >= 0 && nf.arity as usize != full_args.len() {
                    return Err(RuntimeError::Arity {
                        expected: nf.arity,
                        got: full_args.len(),
                    });
                }
                let func = nf.func;
                let base = self.stack.len();
                self.push(Value::null());
                for a in &full_args {
                    self.push(*a);
                }
                self.frames.push(Frame {
                    func: resolved.as_ptr(),
                    ip: 0,
                    stack_base: base,
                });
                let result = func(self);
                self.frames.pop();
                let retval = self.stack.pop().unwrap_or_else(Value::null);
                self.stack.truncate(base);
                result?;
                let dest = self.reg(insn.a);
                self.stack[dest] = retval;
                Ok(())
            }
            Some(ObjKind::Function(f)) => {
                let arity = f.arity as i32;
                let needed = f.needed_stack_space as usize;
                if arity as usize != full_args.len() {
                    return Err(RuntimeError::Arity {
                        expected: arity,
                        got: full_args.len(),
                    });
                }
                let dest_abs = self.reg(insn.a);
                self.stack.truncate(dest_abs);
                self.push(Value::null());
                for a in &full_args {
                    self.push(*a);
                }
                if self.stack.len() < dest_abs + needed {
                    self.stack.resize(dest_abs + needed, Value::null());
                }
                self.frames.push(Frame {
                    func: resolved.as_ptr(),
                    ip: 0,
                    stack_base: dest_abs,
                });
                Ok(())
            }
            _ => Err(RuntimeError::NotCallable),
        }
    }

    // --- compile / exec --------------------------------------------------------

    pub fn exec_in_module(&mut self, module_name: &str, source: &str) -> Result<(), ErrorKind> {
        let module_idx = match self.module_by_name(module_name) {
            Some(i) => i,
            None => self.module_make(module_name),
        };
        let mut parser = crate::parser::Parser::new(source, module_idx);
        let (func_idx, errors) = parser.compile_module(self);
        if !errors.is_empty() {
            if let Some(cb) = self.on_error {
                for e in &errors {
                    cb(ErrorKind::Compile, e.line, &e.message);
                }
            }
            return Err(ErrorKind::Compile);
        }
        match self.call_value(Value::from_ptr(func_idx), &[]) {
            Ok(_) => Ok(()),
            Err(_) => Err(ErrorKind::Runtime),
        }
    }
}

impl Default for Vm {
    fn default() -> Self {
        Vm::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instruction::encode;

    fn make_fn(
        vm: &mut Vm,
        module: ObjIndex,
        arity: u8,
        code: Vec<Insn>,
        constants: Vec<Value>,
    ) -> ObjIndex {
        let words = code.into_iter().map(encode).collect();
        vm.heap.alloc(ObjKind::Function(ObjFn {
            name: None,
            arity,
            code: words,
            constants,
            code_to_line: vec![1],
            needed_stack_space: 8,
            module,
        }))
    }

    #[test]
    fn addition_of_two_constants() {
        let mut vm = Vm::new();
        let module = vm.module_make("test");
        let five = Value::from_num(5.0);
        let seven = Value::from_num(7.0);
        let code = vec![
            Insn::abx(Op::LoadBasic, 1, LOAD_BASIC_CONST_OFFSET),
            Insn::abx(Op::LoadBasic, 2, LOAD_BASIC_CONST_OFFSET + 1),
            Insn::abc(Op::MathAdd, 1, 1, 2),
            Insn::abx(Op::Return, 0, 1),
        ];
        let f = make_fn(&mut vm, module, 0, code, vec![five, seven]);
        let result = vm.call_value(Value::from_ptr(f), &[]).unwrap();
        assert_eq!(result.as_num(), 12.0);
    }

    #[test]
    fn arity_mismatch_is_rejected() {
        let mut vm = Vm::new();
        let module = vm.module_make("test");
        let code = vec![Insn::abx(Op::Return, 0, 0)];
        let f = make_fn(&mut vm, module, 2, code, vec![]);
        let err = vm
            .call_value(Value::from_ptr(f), &[Value::from_num(1.0)])
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::FunctionArityMismatch);
    }

    #[test]
    fn string_concat_with_number_matches_fnv1a() {
        let mut vm = Vm::new();
        let prefix = vm.alloc_string("n=".to_string());
        let result = vm.add(prefix, Value::from_num(42.0)).unwrap();
        assert_eq!(vm.stringify(result), "n=42");
        let expected_hash = crate::object::fnv1a_hash(b"n=42");
        match vm.heap.kind(result.as_ptr()) {
            Some(ObjKind::String(s)) => assert_eq!(s.hash, expected_hash),
            _ => panic!("expected string"),
        }
    }

    #[test]
    fn comparison_never_true_across_types() {
        let vm = Vm::new();
        let lt = vm.compare(Value::from_num(1.0), Value::null(), |a, b| a < b);
        assert!(!lt.as_bool());
    }

    #[test]
    fn base_case_guard_returns_argument_directly() {
        // if (n < 2) return n; else return 99; -- exercises CmpLt + JumpIfNot
        // + both Return paths in one hand-assembled function.
        let mut vm = Vm::new();
        let module = vm.module_make("test");
        let two = Value::from_num(2.0);
        let ninety_nine = Value::from_num(99.0);
        let mut code = vec![
            Insn::abx(Op::LoadBasic, 2, LOAD_BASIC_CONST_OFFSET),
            Insn::abc(Op::CmpLt, 1, 0, 2),
            Insn::abc(Op::JumpIfNot, 1, 0, 0), // placeholder, patched below
            Insn::abx(Op::Return, 0, 0),       // return n
            Insn::abx(Op::LoadBasic, 1, LOAD_BASIC_CONST_OFFSET + 1),
            Insn::abx(Op::Return, 0, 1), // return 99
        ];
        let jump_target = 4i32;
        let cond_jump_idx = 2;
        code[cond_jump_idx] = Insn::asbx(Op::JumpIfNot, 1, jump_target - (cond_jump_idx as i32 + 1));
        let f = make_fn(&mut vm, module, 1, code, vec![two, ninety_nine]);

        let result = vm
            .call_value(Value::from_ptr(f), &[Value::from_num(1.0)])
            .unwrap();
        assert_eq!(result.as_num(), 1.0);

        let result = vm
            .call_value(Value::from_ptr(f), &[Value::from_num(5.0)])
            .unwrap();
        assert_eq!(result.as_num(), 99.0);
    }
}
