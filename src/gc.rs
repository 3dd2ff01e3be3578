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

// Tracing mark-and-sweep heap. Objects live in a flat, id-indexed arena
// with a free list for slot reuse, rather than behind `Rc`/raw pointers -
// every live reference is an `ObjIndex`, so there is nothing for the
// collector to chase outside this module's own bookkeeping.
//
// Collection is non-incremental and non-generational by design: mark,
// then sweep, in one pass, with no write barrier.

use crate::error::RuntimeError;
use crate::object::{GcMark, Object, ObjKind};
use crate::value::{ObjIndex, Value};

// How many just-allocated, not-yet-attached objects can be rooted at
// once. Exceeding this during a single allocation sequence is a VM bug,
// not a guest program error.
const MAX_TEMP_ROOTS: usize = 8;

pub struct GcConfig {
    pub min_heap_size: usize,
    pub growth_factor: f64,
}

impl Default for GcConfig {
    fn default() -> Self {
        GcConfig {
            min_heap_size: 1 << 20,
            growth_factor: 1.0,
        }
    }
}

pub struct Gc {
    slots: Vec<Option<Object>>,
    free_list: Vec<u32>,
    bytes_allocated: usize,
    next_gc: usize,
    config: GcConfig,
    running: bool,
    temp_roots: Vec<ObjIndex>,
}

impl Gc {
    pub fn new(config: GcConfig) -> Self {
        let next_gc = config.min_heap_size;
        Gc {
            slots: Vec::new(),
            free_list: Vec::new(),
            bytes_allocated: 0,
            next_gc,
            config,
            running: false,
            temp_roots: Vec::new(),
        }
    }

    pub fn alloc(&mut self, kind: ObjKind) -> ObjIndex {
        self.bytes_allocated += estimate_size(&kind);
        let object = Object::new(kind);
        if let Some(idx) = self.free_list.pop() {
            self.slots[idx as usize] = Some(object);
            ObjIndex(idx)
        } else {
            let idx = self.slots.len() as u32;
            self.slots.push(Some(object));
            ObjIndex(idx)
        }
    }

    pub fn get(&self, idx: ObjIndex) -> Option<&Object> {
        self.slots.get(idx.0 as usize).and_then(|s| s.as_ref())
    }

    pub fn get_mut(&mut self, idx: ObjIndex) -> Option<&mut Object> {
        self.slots.get_mut(idx.0 as usize).and_then(|s| s.as_mut())
    }

    pub fn kind(&self, idx: ObjIndex) -> Option<&ObjKind> {
        self.get(idx).map(|o| &o.kind)
    }

    pub fn kind_mut(&mut self, idx: ObjIndex) -> Option<&mut ObjKind> {
        self.get_mut(idx).map(|o| &mut o.kind)
    }

    pub fn should_collect(&self) -> bool {
        !self.running && self.bytes_allocated >= self.next_gc
    }

    pub fn push_temp_root(&mut self, idx: ObjIndex) -> Result<(), RuntimeError> {
        if self.temp_roots.len() >= MAX_TEMP_ROOTS {
            return Err(RuntimeError::Overflow);
        }
        self.temp_roots.push(idx);
        Ok(())
    }

    pub fn pop_temp_root(&mut self) {
        self.temp_roots.pop();
    }

    // Runs the mark phase of one cycle. `roots` enumerates every `Value`
    // directly reachable from the stack, call frames, module table, and
    // live handles; the collector walks from there. Returns the indices
    // of instances whose class has a finalizer and which did not survive
    // this cycle - the caller (the interpreter) must run each one's
    // `dtor`, then call `reclaim_finalized` and finally `sweep`/`end_cycle`.
    //
    // `running` stays set across that whole sequence (not just this mark
    // phase): a `dtor` runs arbitrary script code that may itself cross
    // the allocation budget, and per spec.md 4.8 a GC already in progress
    // must not nest. `end_cycle` is the caller's signal that finalizers
    // have run and it is safe to collect again.
    pub fn collect<'a>(&mut self, roots: impl Iterator<Item = &'a Value>) -> Vec<ObjIndex> {
        self.running = true;

        let mut worklist: Vec<ObjIndex> = Vec::new();
        for v in roots {
            if v.is_ptr() {
                worklist.push(v.as_ptr());
            }
        }
        for r in &self.temp_roots {
            worklist.push(*r);
        }

        while let Some(idx) = worklist.pop() {
            let already_marked = match self.slots.get(idx.0 as usize).and_then(|s| s.as_ref()) {
                Some(obj) => obj.header.mark == GcMark::Reachable,
                None => continue,
            };
            if already_marked {
                continue;
            }
            if let Some(obj) = self.slots[idx.0 as usize].as_mut() {
                obj.header.mark = GcMark::Reachable;
            }
            if let Some(obj) = self.slots[idx.0 as usize].as_ref() {
                obj.trace(|child| worklist.push(child));
            }
        }

        let dead_instances: Vec<usize> = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| match slot {
                Some(obj) if obj.header.mark == GcMark::Unreachable => match &obj.kind {
                    ObjKind::Instance(inst) => Some((i, inst.clz)),
                    _ => None,
                },
                _ => None,
            })
            .filter(|(_, clz)| self.class_has_finalizer(*clz))
            .map(|(i, _)| i)
            .collect();

        let mut to_finalize = Vec::new();
        for i in dead_instances {
            if let Some(obj) = self.slots[i].as_mut() {
                obj.header.mark = GcMark::PendingFinalize;
            }
            to_finalize.push(ObjIndex(i as u32));
        }

        to_finalize
    }

    /// Clears the in-progress flag. Call once finalizers have run and the
    /// cycle's final `sweep` has completed.
    pub fn end_cycle(&mut self) {
        self.running = false;
    }

    fn class_has_finalizer(&self, clz: ObjIndex) -> bool {
        matches!(
            self.kind(clz),
            Some(ObjKind::Class(c)) if c.finalizer.is_some()
        )
    }

    // Frees everything still `Unreachable` and resets every surviving
    // object (Reachable or PendingFinalize) back to `Unreachable` ahead
    // of the next cycle. Updates the heap growth budget.
    pub fn sweep(&mut self) {
        for (i, slot) in self.slots.iter_mut().enumerate() {
            let free_this = match slot {
                Some(obj) if obj.header.mark == GcMark::Unreachable => true,
                Some(obj) => {
                    obj.header.mark = GcMark::Unreachable;
                    false
                }
                None => false,
            };
            if free_this {
                if let Some(obj) = slot.take() {
                    self.bytes_allocated = self.bytes_allocated.saturating_sub(estimate_size(&obj.kind));
                }
                self.free_list.push(i as u32);
            }
        }
        self.next_gc = std::cmp::max(
            self.config.min_heap_size,
            (self.bytes_allocated as f64 * (1.0 + self.config.growth_factor)) as usize,
        );
    }

    // Reclaims an instance whose finalizer has already run. Called by
    // the interpreter once per entry returned from `collect`.
    pub fn reclaim_finalized(&mut self, idx: ObjIndex) {
        if let Some(Some(obj)) = self.slots.get(idx.0 as usize) {
            if obj.header.mark != GcMark::PendingFinalize {
                return;
            }
        } else {
            return;
        }
        if let Some(obj) = self.slots[idx.0 as usize].take() {
            self.bytes_allocated = self.bytes_allocated.saturating_sub(estimate_size(&obj.kind));
        }
        self.free_list.push(idx.0);
    }

    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }

    pub fn object_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }
}

fn estimate_size(kind: &ObjKind) -> usize {
    match kind {
        ObjKind::Module(m) => 64 + m.variables.len() * 32,
        ObjKind::Class(c) => 96 + c.symbols.len() * 32,
        ObjKind::Instance(i) => 32 + i.fields.len() * 32 + i.extra_data.len(),
        ObjKind::Function(f) => 64 + f.code.len() * 4 + f.constants.len() * 16,
        ObjKind::NativeFn(n) => 48 + n.statics.len() * 16 + n.extra_data.len(),
        ObjKind::String(s) => 32 + s.value.len(),
        ObjKind::Reference(r) => 32 + r.extra_data.len(),
        ObjKind::WeakRef(_) => 24,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::ObjString;

    fn intern(gc: &mut Gc, s: &str) -> ObjIndex {
        gc.alloc(ObjKind::String(ObjString::from_value(s.to_string())))
    }

    #[test]
    fn unreachable_object_is_freed_by_sweep() {
        let mut gc = Gc::new(GcConfig::default());
        let idx = intern(&mut gc, "hello");
        assert!(gc.get(idx).is_some());
        let finalize = gc.collect(std::iter::empty());
        assert!(finalize.is_empty());
        gc.sweep();
        assert!(gc.get(idx).is_none());
    }

    #[test]
    fn rooted_object_survives_collection() {
        let mut gc = Gc::new(GcConfig::default());
        let idx = intern(&mut gc, "kept");
        let root = Value::from_ptr(idx);
        let roots = vec![root];
        gc.collect(roots.iter());
        gc.sweep();
        assert!(gc.get(idx).is_some());
    }

    #[test]
    fn freed_slot_is_recycled() {
        let mut gc = Gc::new(GcConfig::default());
        let a = intern(&mut gc, "a");
        gc.collect(std::iter::empty());
        gc.sweep();
        assert!(gc.get(a).is_none());
        let b = intern(&mut gc, "b");
        assert_eq!(a, b);
    }

    #[test]
    fn temp_root_keeps_allocation_alive_without_a_value_root() {
        let mut gc = Gc::new(GcConfig::default());
        let idx = intern(&mut gc, "transient");
        gc.push_temp_root(idx).unwrap();
        gc.collect(std::iter::empty());
        gc.sweep();
        assert!(gc.get(idx).is_some());
        gc.pop_temp_root();
        gc.collect(std::iter::empty());
        gc.sweep();
        assert!(gc.get(idx).is_none());
    }
}
