//! heap.rs — the object arena and the tri-color mark-sweep collector.
//!
//! Objects live in a `Vec<Slot>` arena instead of behind raw pointers: a
//! freed slot's index is pushed onto `free_list` and reused by the next
//! allocation, with the slot's generation bumped so a stale `ObjHandle`
//! from before the free is detectably wrong rather than silently aliasing
//! a new object. This is the "allocation list" from the spec, addressed by
//! index instead of linked by pointer — see `SPEC_FULL.md` §3 for why.
//!
//! `Heap` owns the string-interning table too: interning and GC are
//! coordinated here because the interning table holds *weak* references
//! that must be purged between mark and sweep (§4.6/§4.7).

use tracing::debug;

use crate::object::{fnv1a32, FunctionKind, Object, ObjBoundMethod, ObjClass, ObjClosure,
    ObjFunction, ObjHandle, ObjInstance, ObjNative, ObjString, ObjUpvalue, UpvalueLocation,
    NativeFn};
use crate::table::Table;
use crate::value::Value;

const INITIAL_NEXT_GC: usize = 1 << 20; // 1 MiB-equivalent, as in clox
const HEAP_GROW_FACTOR: usize = 2;

struct Slot {
    generation: u32,
    marked: bool,
    object: Option<Object>,
}

/// One entry of the weak string-interning table: the string's own cached
/// hash plus the handle pointing at its heap slot.
#[derive(Clone, Copy)]
enum InternSlot {
    Empty,
    Tombstone,
    Occupied { hash: u32, handle: ObjHandle },
}

pub struct Heap {
    slots: Vec<Slot>,
    free_list: Vec<u32>,
    interned: Vec<InternSlot>,
    interned_len: usize,
    pub bytes_allocated: usize,
    pub next_gc: usize,
    gray_stack: Vec<ObjHandle>,
    pub stress_gc: bool,
    pub gc_cycles: usize,
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl Heap {
    pub fn new() -> Self {
        Heap {
            slots: Vec::new(),
            free_list: Vec::new(),
            interned: Vec::new(),
            interned_len: 0,
            bytes_allocated: 0,
            next_gc: INITIAL_NEXT_GC,
            gray_stack: Vec::new(),
            stress_gc: false,
            gc_cycles: 0,
        }
    }

    // ----------------------------------------------------------------
    // allocation
    // ----------------------------------------------------------------

    fn approx_size(object: &Object) -> usize {
        match object {
            Object::String(s) => 32 + s.s.len(),
            Object::Function(f) => 64 + f.chunk.code.len() * 8,
            Object::Native(_) => 32,
            Object::Closure(c) => 24 + c.upvalues.len() * 8,
            Object::Upvalue(_) => 24,
            Object::Class(_) => 48,
            Object::Instance(_) => 48,
            Object::BoundMethod(_) => 24,
        }
    }

    /// Inserts `object` into the arena, reusing a freed slot if one is
    /// available, and returns a fresh handle. Does **not** check the GC
    /// threshold itself — callers that want the engine's "collect after
    /// crossing next_gc" behavior go through `Vm`'s allocation helpers,
    /// which call [`Heap::should_collect`] after this returns.
    pub fn alloc(&mut self, object: Object) -> ObjHandle {
        self.bytes_allocated += Self::approx_size(&object);
        if let Some(index) = self.free_list.pop() {
            let slot = &mut self.slots[index as usize];
            slot.marked = false;
            slot.object = Some(object);
            ObjHandle::new(index, slot.generation)
        } else {
            let index = self.slots.len() as u32;
            self.slots.push(Slot { generation: 0, marked: false, object: Some(object) });
            ObjHandle::new(index, 0)
        }
    }

    pub fn should_collect(&self) -> bool {
        self.stress_gc || self.bytes_allocated > self.next_gc
    }

    // ----------------------------------------------------------------
    // lookup
    // ----------------------------------------------------------------

    fn slot(&self, handle: ObjHandle) -> &Slot {
        let slot = &self.slots[handle.index as usize];
        debug_assert_eq!(slot.generation, handle.generation, "stale ObjHandle used after free");
        slot
    }

    fn slot_mut(&mut self, handle: ObjHandle) -> &mut Slot {
        let slot = &mut self.slots[handle.index as usize];
        debug_assert_eq!(slot.generation, handle.generation, "stale ObjHandle used after free");
        slot
    }

    pub fn get(&self, handle: ObjHandle) -> &Object {
        self.slot(handle).object.as_ref().expect("dereferenced a freed ObjHandle")
    }

    pub fn get_mut(&mut self, handle: ObjHandle) -> &mut Object {
        self.slot_mut(handle).object.as_mut().expect("dereferenced a freed ObjHandle")
    }

    pub fn as_string(&self, handle: ObjHandle) -> &str {
        &self.get(handle).as_string().expect("ObjHandle did not point at a string").s
    }

    // ----------------------------------------------------------------
    // convenience constructors
    // ----------------------------------------------------------------

    /// `copy_string`/`take_string`: interns `s`, allocating a new
    /// `ObjString` only if an equal string is not already interned.
    pub fn intern_string(&mut self, s: &str) -> ObjHandle {
        let hash = fnv1a32(s.as_bytes());
        if let Some(existing) = self.find_interned(s, hash) {
            return existing;
        }
        let handle = self.alloc(Object::String(ObjString::new(s)));
        self.interner_insert(hash, handle);
        handle
    }

    pub fn alloc_function(&mut self, kind: FunctionKind) -> ObjHandle {
        self.alloc(Object::Function(ObjFunction::new(kind)))
    }

    pub fn alloc_native(&mut self, name: &str, arity: Option<u8>, func: NativeFn) -> ObjHandle {
        self.alloc(Object::Native(ObjNative { name: Box::from(name), arity, func }))
    }

    pub fn alloc_closure(&mut self, function: ObjHandle, upvalues: Vec<ObjHandle>) -> ObjHandle {
        self.alloc(Object::Closure(ObjClosure { function, upvalues }))
    }

    pub fn alloc_upvalue(&mut self, stack_slot: usize) -> ObjHandle {
        self.alloc(Object::Upvalue(ObjUpvalue { location: UpvalueLocation::Stack(stack_slot) }))
    }

    pub fn alloc_class(&mut self, name: ObjHandle) -> ObjHandle {
        self.alloc(Object::Class(ObjClass::new(name)))
    }

    pub fn alloc_instance(&mut self, class: ObjHandle) -> ObjHandle {
        self.alloc(Object::Instance(ObjInstance::new(class)))
    }

    pub fn alloc_bound_method(&mut self, receiver: Value, method: ObjHandle) -> ObjHandle {
        self.alloc(Object::BoundMethod(ObjBoundMethod { receiver, method }))
    }

    // ----------------------------------------------------------------
    // weak string interning table (open-addressed, tombstoned)
    // ----------------------------------------------------------------

    fn find_interned(&self, s: &str, hash: u32) -> Option<ObjHandle> {
        if self.interned.is_empty() {
            return None;
        }
        let mask = self.interned.len() - 1;
        let mut idx = hash as usize & mask;
        loop {
            match self.interned[idx] {
                InternSlot::Empty => return None,
                InternSlot::Tombstone => {}
                InternSlot::Occupied { hash: h, handle } if h == hash && self.as_string(handle) == s => {
                    return Some(handle);
                }
                InternSlot::Occupied { .. } => {}
            }
            idx = (idx + 1) & mask;
        }
    }

    fn interner_insert(&mut self, hash: u32, handle: ObjHandle) {
        if self.interned.is_empty() || (self.interned_len + 1) as f64 > self.interned.len() as f64 * 0.75 {
            self.interner_grow();
        }
        let mask = self.interned.len() - 1;
        let mut idx = hash as usize & mask;
        loop {
            match self.interned[idx] {
                InternSlot::Empty | InternSlot::Tombstone => {
                    self.interned[idx] = InternSlot::Occupied { hash, handle };
                    self.interned_len += 1;
                    return;
                }
                InternSlot::Occupied { .. } => idx = (idx + 1) & mask,
            }
        }
    }

    fn interner_grow(&mut self) {
        let new_cap = if self.interned.is_empty() { 8 } else { self.interned.len() * 2 };
        let old = std::mem::take(&mut self.interned);
        self.interned = vec![InternSlot::Empty; new_cap];
        self.interned_len = 0;
        let mask = new_cap - 1;
        for slot in old {
            if let InternSlot::Occupied { hash, handle } = slot {
                let mut idx = hash as usize & mask;
                loop {
                    match self.interned[idx] {
                        InternSlot::Empty => {
                            self.interned[idx] = InternSlot::Occupied { hash, handle };
                            self.interned_len += 1;
                            break;
                        }
                        _ => idx = (idx + 1) & mask,
                    }
                }
            }
        }
    }

    /// Drops interner entries whose string is unmarked, right before
    /// sweep — otherwise a dead string could be "resurrected" by a later
    /// lookup finding a stale handle whose slot sweep is about to free.
    fn remove_white_strings(&mut self) {
        for slot in &mut self.interned {
            if let InternSlot::Occupied { handle, .. } = slot {
                if !self.slots[handle.index as usize].marked {
                    *slot = InternSlot::Tombstone;
                    self.interned_len -= 1;
                }
            }
        }
    }

    // ----------------------------------------------------------------
    // marking
    // ----------------------------------------------------------------

    pub fn mark_value(&mut self, value: Value) {
        if let Value::Obj(handle) = value {
            self.mark_object(handle);
        }
    }

    pub fn mark_object(&mut self, handle: ObjHandle) {
        let slot = &mut self.slots[handle.index as usize];
        if slot.marked {
            return;
        }
        slot.marked = true;
        self.gray_stack.push(handle);
    }

    pub fn mark_table(&mut self, table: &Table) {
        let entries: Vec<(ObjHandle, Value)> = table.iter().collect();
        for (key, value) in entries {
            self.mark_object(key);
            self.mark_value(value);
        }
    }

    /// Drains the gray worklist, blackening each object by marking
    /// everything it references. Every `match` arm here ends
    /// independently — there is no opcode-style fallthrough hazard in
    /// Rust, unlike the stray C `case` the spec calls out in §9.
    fn trace_references(&mut self) {
        while let Some(handle) = self.gray_stack.pop() {
            // Split the borrow: collect what needs marking, then mark, to
            // avoid holding `&self.slots[..]` while mutating `self`.
            let refs = self.collect_references(handle);
            for value in refs.values {
                self.mark_value(value);
            }
            for obj in refs.objects {
                self.mark_object(obj);
            }
            if let Some(table) = refs.table {
                self.mark_table(&table);
            }
        }
    }

    fn collect_references(&self, handle: ObjHandle) -> Blackened {
        let mut out = Blackened::default();
        match self.get(handle) {
            Object::String(_) | Object::Native(_) => {}
            Object::Function(f) => {
                if let Some(name) = f.name {
                    out.objects.push(name);
                }
                for c in &f.chunk.constants {
                    out.values.push(*c);
                }
            }
            Object::Closure(c) => {
                out.objects.push(c.function);
                out.objects.extend(c.upvalues.iter().copied());
            }
            Object::Upvalue(u) => {
                if let UpvalueLocation::Closed(v) = u.location {
                    out.values.push(v);
                }
            }
            Object::Class(cl) => {
                out.objects.push(cl.name);
                out.table = Some(clone_table(&cl.methods));
            }
            Object::Instance(inst) => {
                out.objects.push(inst.class);
                out.table = Some(clone_table(&inst.fields));
            }
            Object::BoundMethod(bm) => {
                out.values.push(bm.receiver);
                out.objects.push(bm.method);
            }
        }
        out
    }

    // ----------------------------------------------------------------
    // sweep
    // ----------------------------------------------------------------

    fn sweep(&mut self) {
        for index in 0..self.slots.len() {
            let slot = &mut self.slots[index];
            if slot.object.is_none() {
                continue;
            }
            if slot.marked {
                slot.marked = false;
            } else {
                let freed = slot.object.take().expect("checked above");
                self.bytes_allocated = self.bytes_allocated.saturating_sub(Self::approx_size(&freed));
                slot.generation = slot.generation.wrapping_add(1);
                self.free_list.push(index as u32);
            }
        }
    }

    /// Runs one full mark-sweep cycle. `mark_extra_roots` is supplied by
    /// the caller (the VM, or the compiler while it is still building)
    /// and marks whatever roots are not intrinsic to `Heap` itself — the
    /// stack, call frames, open upvalues, globals table, the active
    /// compiler chain, `init_string`.
    pub fn collect_garbage(&mut self, mark_extra_roots: impl FnOnce(&mut Heap)) {
        debug!(bytes_allocated = self.bytes_allocated, next_gc = self.next_gc, "gc: begin");
        mark_extra_roots(self);
        self.trace_references();
        self.remove_white_strings();
        self.sweep();
        self.next_gc = self.bytes_allocated.saturating_mul(HEAP_GROW_FACTOR).max(INITIAL_NEXT_GC);
        self.gc_cycles += 1;
        debug!(bytes_allocated = self.bytes_allocated, next_gc = self.next_gc, "gc: end");
    }

    #[cfg(test)]
    pub(crate) fn live_object_count(&self) -> usize {
        self.slots.iter().filter(|s| s.object.is_some()).count()
    }
}

#[derive(Default)]
struct Blackened {
    values: Vec<Value>,
    objects: Vec<ObjHandle>,
    table: Option<Table>,
}

/// Method tables/field tables are walked for marking without holding a
/// borrow of `Heap` across the mark calls; cloning a `Table` is cheap
/// relative to a GC pause and keeps the borrow checker happy without
/// `unsafe`.
fn clone_table(table: &Table) -> Table {
    let mut out = Table::new();
    for (k, v) in table.iter() {
        // hash doesn't matter for a throwaway clone used only for marking
        out.set(k, 0, v);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_dedupes_equal_strings() {
        let mut h = Heap::new();
        let a = h.intern_string("hello");
        let b = h.intern_string("hello");
        assert_eq!(a, b);
        let c = h.intern_string("world");
        assert_ne!(a, c);
    }

    #[test]
    fn unreachable_object_freed_by_gc() {
        let mut h = Heap::new();
        let keep = h.intern_string("keep");
        let _drop_me = h.intern_string("drop-me");
        let before = h.live_object_count();
        h.collect_garbage(|heap| heap.mark_object(keep));
        assert!(h.live_object_count() < before);
        assert_eq!(h.as_string(keep), "keep");
    }

    #[test]
    fn marking_is_idempotent_against_cycles() {
        let mut h = Heap::new();
        let name = h.intern_string("C");
        let class = h.alloc_class(name);
        // a method table entry pointing back at the class's own name is
        // enough of a cycle to exercise the gray-stack dedup.
        if let Object::Class(c) = h.get_mut(class) {
            c.methods.set(name, 0, Value::Obj(class));
        }
        h.collect_garbage(|heap| heap.mark_object(class));
        assert_eq!(h.live_object_count(), 2);
    }
}
