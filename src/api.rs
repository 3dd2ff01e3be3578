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

// Host embedding surface. A C host addresses values as "slots" relative
// to the current stack top rather than the frame-relative registers the
// bytecode dispatch loop uses internally - `Vm::stack_get`/`stack_set`
// already do that translation, everything here is built on top of them.
//
// The original C API passes raw function pointers and out-params for
// sizes; this port keeps the same operations but in Rust's native
// idiom - `Option`/`Result` instead of null/error-code out-params,
// owned `Vec<u8>`/`String` instead of caller-managed buffers.

use enumflags2::BitFlags;

use crate::error::{ErrorKind, RuntimeError};
use crate::object::{
    NativeFnPtr, ObjClass, ObjInstance, ObjKind, ObjNativeFn, ObjReference, ObjWeakRef,
};
use crate::value::{HostType, ObjIndex, Value};
use crate::vm::{HandleId, Vm};

/// One native method to attach to a host-defined class, mirroring the
/// C API's `{name, fn_ptr, arity, num_statics, extra_data}` entry.
pub struct MethodBind {
    pub name: String,
    pub func: NativeFnPtr,
    pub arity: i32,
    pub num_statics: usize,
    pub extra_data_size: usize,
}

/// Describes a whole host-defined class, built once and handed to
/// `stack_store_class`/`stack_make_reference_clz`.
pub struct ClassBind {
    pub name: String,
    pub extra_data_size: usize,
    pub finalizer: Option<NativeFnPtr>,
    pub methods: Vec<MethodBind>,
}

#[derive(Copy, Clone, BitFlags, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum StdModule {
    Io = 0b01,
}

pub type StdFlags = BitFlags<StdModule>;

impl Vm {
    // --- typed slot accessors -----------------------------------------------

    pub fn stack_set_string(&mut self, slot: usize, s: &str) {
        let v = self.alloc_string(s.to_string());
        self.stack_set(slot, v);
    }

    pub fn stack_set_number(&mut self, slot: usize, n: f64) {
        self.stack_set(slot, Value::from_num(n));
    }

    pub fn stack_set_bool(&mut self, slot: usize, b: bool) {
        self.stack_set(slot, Value::from_bool(b));
    }

    pub fn stack_set_nil(&mut self, slot: usize) {
        self.stack_set(slot, Value::null());
    }

    pub fn stack_read_string(&self, slot: usize) -> Option<String> {
        let v = self.stack_get(slot);
        if !v.is_ptr() {
            return None;
        }
        match self.heap.kind(v.as_ptr()) {
            Some(ObjKind::String(s)) => Some(s.value.clone()),
            _ => None,
        }
    }

    pub fn stack_read_number(&self, slot: usize) -> Option<f64> {
        let v = self.stack_get(slot);
        v.is_num().then(|| v.as_num())
    }

    pub fn stack_read_bool(&self, slot: usize) -> Option<bool> {
        let v = self.stack_get(slot);
        v.is_bool().then(|| v.as_bool())
    }

    /// Reads the raw extra-data bytes of an instance or reference
    /// living at `slot`.
    pub fn stack_read_instance(&self, slot: usize) -> Option<Vec<u8>> {
        let v = self.stack_get(slot);
        if !v.is_ptr() {
            return None;
        }
        match self.heap.kind(v.as_ptr()) {
            Some(ObjKind::Instance(i)) => Some(i.extra_data.clone()),
            Some(ObjKind::Reference(r)) => Some(r.extra_data.clone()),
            _ => None,
        }
    }

    pub fn stack_get_type(&self, slot: usize) -> HostType {
        self.stack_get(slot).type_tag(&self.heap).into()
    }

    pub fn stack_get_arity(&self, slot: usize) -> Option<i32> {
        let v = self.stack_get(slot);
        if !v.is_ptr() {
            return None;
        }
        match self.heap.kind(v.as_ptr()) {
            Some(ObjKind::Function(f)) => Some(f.arity as i32),
            Some(ObjKind::NativeFn(nf)) => Some(nf.arity),
            _ => None,
        }
    }

    // --- object construction -------------------------------------------------

    /// Builds a new instance of the class sitting at `clz_slot`,
    /// running its field initializers exactly as `new` would, and
    /// stores it at `dst_slot`.
    pub fn stack_make_instance(&mut self, clz_slot: usize, dst_slot: usize) -> Result<(), RuntimeError> {
        let clz_val = self.stack_get(clz_slot);
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
        self.stack_set(dst_slot, Value::from_ptr(idx));
        Ok(())
    }

    /// Allocates a classless reference with `extra_size` bytes of raw
    /// host-owned storage and stores it at `slot`.
    pub fn stack_make_reference(&mut self, slot: usize, extra_size: usize) {
        let obj = ObjReference {
            clz: None,
            extra_data: vec![0u8; extra_size],
        };
        let idx = self.heap.alloc(ObjKind::Reference(obj));
        self.stack_set(slot, Value::from_ptr(idx));
    }

    /// Registers `bind` as a class on `module_slot` and allocates a
    /// reference of it at `dst_slot` in one step.
    pub fn stack_make_reference_clz(
        &mut self,
        module_slot: usize,
        bind: &ClassBind,
        dst_slot: usize,
    ) {
        let module_val = self.stack_get(module_slot);
        let module_idx = if module_val.is_ptr() {
            module_val.as_ptr()
        } else {
            self.fallback_module()
        };
        let clz_idx = self.register_class_bind(module_idx, bind);
        let obj = ObjReference {
            clz: Some(clz_idx),
            extra_data: vec![0u8; bind.extra_data_size],
        };
        let idx = self.heap.alloc(ObjKind::Reference(obj));
        self.stack_set(dst_slot, Value::from_ptr(idx));
    }

    /// Makes `slot` a weak reference to whatever object lives at
    /// `target_slot`. Stores `Null` if `target_slot` isn't an object.
    pub fn stack_make_weak_ref(&mut self, slot: usize, target_slot: usize) {
        let target = self.stack_get(target_slot);
        let (clz, data) = if target.is_ptr() {
            let idx = target.as_ptr();
            let clz = match self.heap.kind(idx) {
                Some(ObjKind::Instance(i)) => Some(i.clz),
                Some(ObjKind::Reference(r)) => r.clz,
                _ => None,
            };
            (clz, Some(idx))
        } else {
            (None, None)
        };
        let idx = self.heap.alloc(ObjKind::WeakRef(ObjWeakRef { clz, data }));
        self.stack_set(slot, Value::from_ptr(idx));
    }

    pub fn reference_set_class(&mut self, slot: usize, clz_slot: usize) -> Result<(), RuntimeError> {
        let clz_val = self.stack_get(clz_slot);
        if !clz_val.is_ptr() {
            return Err(RuntimeError::NotCallable);
        }
        let target = self.stack_get(slot);
        if !target.is_ptr() {
            return Err(RuntimeError::NotCallable);
        }
        match self.heap.kind_mut(target.as_ptr()) {
            Some(ObjKind::Reference(r)) => {
                r.clz = Some(clz_val.as_ptr());
                Ok(())
            }
            _ => Err(RuntimeError::NotCallable),
        }
    }

    pub fn class_set_base_class(&mut self, slot: usize, clz_slot: usize) -> Result<(), RuntimeError> {
        let base_val = self.stack_get(clz_slot);
        if !base_val.is_ptr() {
            return Err(RuntimeError::NotCallable);
        }
        let target = self.stack_get(slot);
        if !target.is_ptr() {
            return Err(RuntimeError::NotCallable);
        }
        match self.heap.kind_mut(target.as_ptr()) {
            Some(ObjKind::Class(c)) => {
                c.base_clz = Some(base_val.as_ptr());
                Ok(())
            }
            _ => Err(RuntimeError::NotCallable),
        }
    }

    // --- variables, methods, classes ------------------------------------------

    pub fn stack_load_variable(
        &mut self,
        dst_slot: usize,
        container_slot: usize,
        name: &str,
    ) -> Result<(), RuntimeError> {
        let container = self.stack_get(container_slot);
        let sym = self.symbols.intern(name);
        let v = self.load_symbol(container, sym)?;
        self.stack_set(dst_slot, v);
        Ok(())
    }

    pub fn stack_store_variable(
        &mut self,
        container_slot: usize,
        name: &str,
        value_slot: usize,
    ) -> Result<(), RuntimeError> {
        let container = self.stack_get(container_slot);
        let value = self.stack_get(value_slot);
        let sym = self.symbols.intern(name);
        self.store_symbol(container, sym, value)
    }

    pub fn stack_store_native_fn(
        &mut self,
        container_slot: usize,
        name: &str,
        func: NativeFnPtr,
        arity: i32,
    ) -> Result<(), RuntimeError> {
        let idx = self.heap.alloc(ObjKind::NativeFn(ObjNativeFn {
            func,
            arity,
            statics: Vec::new(),
            extra_data: Vec::new(),
        }));
        let container = self.stack_get(container_slot);
        let sym = self.symbols.intern(name);
        self.store_symbol(container, sym, Value::from_ptr(idx))
    }

    /// Like `stack_store_native_fn`, but the resulting value carries
    /// its own statics (read/write via `closure_get_static`/
    /// `closure_set_static`) and a fixed-size extra-data buffer.
    pub fn stack_store_closure(
        &mut self,
        container_slot: usize,
        name: &str,
        func: NativeFnPtr,
        arity: i32,
        num_statics: usize,
        extra_data_size: usize,
    ) -> Result<(), RuntimeError> {
        let idx = self.heap.alloc(ObjKind::NativeFn(ObjNativeFn {
            func,
            arity,
            statics: vec![Value::null(); num_statics],
            extra_data: vec![0u8; extra_data_size],
        }));
        let container = self.stack_get(container_slot);
        let sym = self.symbols.intern(name);
        self.store_symbol(container, sym, Value::from_ptr(idx))
    }

    /// Reads static `static_idx` of the native closure currently
    /// executing - there is no `closure_slot` because a running closure
    /// has no other way to name itself (`frames` is private, and a
    /// `native_print`-style fn only receives `&mut Vm`). Reads through
    /// `Vm::current_native_fn`, the call frame's own record of which
    /// `NativeFn` object is on top.
    pub fn closure_get_static(&mut self, dst_slot: usize, static_idx: usize) -> Option<()> {
        let idx = self.current_native_fn()?;
        let val = match self.heap.kind(idx) {
            Some(ObjKind::NativeFn(nf)) => nf.statics.get(static_idx).copied(),
            _ => None,
        }?;
        self.stack_set(dst_slot, val);
        Some(())
    }

    pub fn closure_set_static(
        &mut self,
        closure_slot: usize,
        static_idx: usize,
        value_slot: usize,
    ) -> Result<(), RuntimeError> {
        let value = self.stack_get(value_slot);
        let v = self.stack_get(closure_slot);
        if !v.is_ptr() {
            return Err(RuntimeError::NotCallable);
        }
        match self.heap.kind_mut(v.as_ptr()) {
            Some(ObjKind::NativeFn(nf)) => {
                if let Some(slot) = nf.statics.get_mut(static_idx) {
                    *slot = value;
                    Ok(())
                } else {
                    Err(RuntimeError::IllegalAddr(static_idx))
                }
            }
            _ => Err(RuntimeError::NotCallable),
        }
    }

    pub fn closure_get_extra_data(&self, closure_slot: usize) -> Option<Vec<u8>> {
        let v = self.stack_get(closure_slot);
        if !v.is_ptr() {
            return None;
        }
        match self.heap.kind(v.as_ptr()) {
            Some(ObjKind::NativeFn(nf)) => Some(nf.extra_data.clone()),
            _ => None,
        }
    }

    pub fn stack_store_class(&mut self, container_slot: usize, bind: &ClassBind) {
        let container = self.stack_get(container_slot);
        let module_idx = if container.is_ptr() {
            container.as_ptr()
        } else {
            self.fallback_module()
        };
        let clz_idx = self.register_class_bind(module_idx, bind);
        let sym = self.symbols.intern(&bind.name);
        let _ = self.store_symbol(container, sym, Value::from_ptr(clz_idx));
    }

    /// Shared by `stack_store_class` and `stack_make_reference_clz`:
    /// allocates a real `ObjClass` from a host-provided description,
    /// wiring each `MethodBind` up as a native-fn symbol, and the
    /// finalizer (if any) under the `dtor` symbol so `Vm::run_finalizer`
    /// picks it up exactly like a script-defined destructor.
    fn register_class_bind(&mut self, module_idx: ObjIndex, bind: &ClassBind) -> ObjIndex {
        let name_val = self.alloc_string(bind.name.clone());
        let mut class_obj = ObjClass::new(name_val.as_ptr(), module_idx);
        class_obj.extra_data_size = bind.extra_data_size;
        for m in &bind.methods {
            let fn_idx = self.heap.alloc(ObjKind::NativeFn(ObjNativeFn {
                func: m.func,
                arity: m.arity,
                statics: vec![Value::null(); m.num_statics],
                extra_data: vec![0u8; m.extra_data_size],
            }));
            let sym = self.symbols.intern(&m.name);
            class_obj.symbols.insert(sym, Value::from_ptr(fn_idx));
        }
        if let Some(finalizer) = bind.finalizer {
            let dtor_sym = self.builtins.dtor;
            let fn_idx = self.heap.alloc(ObjKind::NativeFn(ObjNativeFn {
                func: finalizer,
                arity: 1,
                statics: Vec::new(),
                extra_data: Vec::new(),
            }));
            class_obj.symbols.insert(dtor_sym, Value::from_ptr(fn_idx));
            class_obj.finalizer = Some(dtor_sym);
        }
        self.heap.alloc(ObjKind::Class(class_obj))
    }

    // --- handles ---------------------------------------------------------------

    pub fn stack_make_handle(&mut self, slot: usize) -> HandleId {
        let v = self.stack_get(slot);
        self.make_handle(v)
    }

    pub fn stack_load_handle(&mut self, dst_slot: usize, handle: HandleId) -> Result<(), RuntimeError> {
        let v = self.handle_value(handle).ok_or(RuntimeError::IllegalAddr(handle as usize))?;
        self.stack_set(dst_slot, v);
        Ok(())
    }

    pub fn stack_destroy_handle(&mut self, handle: HandleId) {
        self.destroy_handle(handle);
    }

    pub fn handle_get_type(&self, handle: HandleId) -> Option<HostType> {
        self.handle_value(handle).map(|v| v.type_tag(&self.heap).into())
    }

    pub fn handle_get_arity(&self, handle: HandleId) -> Option<i32> {
        let v = self.handle_value(handle)?;
        if !v.is_ptr() {
            return None;
        }
        match self.heap.kind(v.as_ptr()) {
            Some(ObjKind::Function(f)) => Some(f.arity as i32),
            Some(ObjKind::NativeFn(nf)) => Some(nf.arity),
            _ => None,
        }
    }

    // --- modules -----------------------------------------------------------------

    /// Loads (compiling and running, if not already loaded) a module by
    /// name via the registered `on_module_lookup` callback, and stores
    /// its handle at `slot`.
    pub fn module_load(&mut self, slot: usize, name: &str) -> Result<(), ErrorKind> {
        if self.module_by_name(name).is_none() {
            let src = match self.on_module_lookup {
                Some(cb) => cb(self, "", name),
                None => None,
            };
            match src {
                Some(source) => self.exec_in_module(name, &source)?,
                None => return Err(ErrorKind::ModuleNotFound),
            }
        }
        let idx = self.module_by_name(name).unwrap();
        self.stack_set(slot, Value::from_ptr(idx));
        Ok(())
    }

    /// Loads the subset of built-in standard-library modules selected
    /// by `flags` (currently just `std:io`) and stores the last-loaded
    /// one at `slot`.
    pub fn module_load_std(&mut self, slot: usize, flags: StdFlags) -> Result<(), ErrorKind> {
        if flags.contains(StdModule::Io) {
            let idx = self.install_std_io();
            self.stack_set(slot, Value::from_ptr(idx));
        }
        Ok(())
    }

    fn install_std_io(&mut self) -> ObjIndex {
        if let Some(idx) = self.module_by_name("std:io") {
            return idx;
        }
        let idx = self.module_make("std:io");
        let print_fn = self.heap.alloc(ObjKind::NativeFn(ObjNativeFn {
            func: native_print,
            arity: -1,
            statics: Vec::new(),
            extra_data: Vec::new(),
        }));
        let sym = self.symbols.intern("print");
        if let Some(ObjKind::Module(m)) = self.heap.kind_mut(idx) {
            m.variables.insert(sym, Value::from_ptr(print_fn));
        }
        idx
    }

    pub fn module_unload(&mut self, name: &str) {
        self.modules.remove(name);
    }

    pub fn module_unload_all(&mut self) {
        self.modules.clear();
    }

    // --- execution -----------------------------------------------------------------

    /// Calls the value at `callable_slot` with `num_args` arguments
    /// starting at `args_start_slot`, storing the result at `dst_slot`.
    pub fn call(
        &mut self,
        dst_slot: usize,
        callable_slot: usize,
        args_start_slot: usize,
        num_args: usize,
    ) -> Result<(), ErrorKind> {
        let callee = self.stack_get(callable_slot);
        let args: Vec<Value> = (0..num_args)
            .map(|i| self.stack_get(args_start_slot - i))
            .collect();
        match self.call_value(callee, &args) {
            Ok(v) => {
                self.stack_set(dst_slot, v);
                Ok(())
            }
            Err(e) => Err(e.kind()),
        }
    }

    pub fn gc(&mut self) {
        self.collect_now();
    }

    pub fn error_string(&self) -> &str {
        &self.last_error
    }

    pub fn build_in_symbol_str(&self, kind: HostType) -> &'static str {
        match kind {
            HostType::Undefined => "undefined",
            HostType::Nil => "nil",
            HostType::Bool => "bool",
            HostType::Number => "number",
            HostType::Str => "string",
            HostType::Function => "function",
            HostType::Object => "object",
            HostType::Module => "module",
        }
    }
}

/// `std:io.print(...)`: formats every argument with the same
/// value-to-string routine the `+` concat rule uses, space-joins them,
/// and forwards the result to `on_print`.
fn native_print(vm: &mut Vm) -> Result<(), RuntimeError> {
    let base = vm.reg(0);
    let argc = vm.stack_size().saturating_sub(base + 1);
    let mut parts = Vec::with_capacity(argc);
    for i in 0..argc {
        let v = vm.stack[base + 1 + i];
        parts.push(vm.stringify(v));
    }
    let line = parts.join(" ");
    if let Some(cb) = vm.on_print {
        cb(&line);
    }
    vm.push(Value::null());
    Ok(())
}

// Not part of the wire-visible taxonomy (§6.1) but used internally to
// pick a sensible class-less owning module for host-allocated objects
// that don't go through `stack_store_class`/`stack_make_reference_clz`.
impl Vm {
    fn fallback_module(&mut self) -> ObjIndex {
        match self.module_by_name("host") {
            Some(idx) => idx,
            None => self.module_make("host"),
        }
    }
}
