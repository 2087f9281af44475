//! Object heap
//!
//! All garbage-collected objects live in one arena of slots addressed by
//! [`ObjRef`] handles. A freed slot goes on a free list and is reused by the
//! next allocation, so a handle is stable for the lifetime of its object and
//! identity comparison is handle comparison.
//!
//! The heap owns the string-intern table and the byte accounting that
//! schedules collections, but it never starts a collection itself: only the
//! VM knows the full root set, so the VM decides when to collect and drives
//! the mark phase through [`Heap::mark_value`] / [`Heap::mark_object`] and
//! friends. This is also what makes compile-time allocation safe — while the
//! compiler builds functions through `&mut Heap` there are no frames and no
//! collection, so nothing can be swept out from under it.

use crate::object::{Obj, Str, UpvalueState};
use crate::table::{StrKey, Table};
use crate::value::Value;

/// Collections are scheduled when allocated bytes pass the threshold; after
/// each collection the threshold is the surviving bytes times this factor.
const GC_GROW_FACTOR: usize = 2;

/// First collection threshold
const GC_FIRST_THRESHOLD: usize = 1024 * 1024;

/// Handle to a heap object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjRef(u32);

#[derive(Debug)]
struct Slot {
    marked: bool,
    /// Size recorded at allocation, subtracted when freed
    size: usize,
    obj: Obj,
}

/// The object arena
#[derive(Debug)]
pub struct Heap {
    slots: Vec<Option<Slot>>,
    free: Vec<u32>,
    /// Intern table: every live string, keyed by itself
    strings: Table,
    /// Grey worklist for tri-color marking
    grey: Vec<ObjRef>,
    bytes_allocated: usize,
    next_gc: usize,
}

impl Heap {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            strings: Table::new(),
            grey: Vec::new(),
            bytes_allocated: 0,
            next_gc: GC_FIRST_THRESHOLD,
        }
    }

    /// Bytes currently attributed to live objects
    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }

    /// Whether the next runtime allocation should collect first
    pub fn should_collect(&self) -> bool {
        self.bytes_allocated > self.next_gc
    }

    /// Override the collection threshold (tests drive this low to force
    /// frequent collections).
    pub fn set_gc_threshold(&mut self, bytes: usize) {
        self.next_gc = bytes;
    }

    /// Number of live objects
    pub fn object_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Allocate a new object. Never collects; the VM checks
    /// [`Heap::should_collect`] before calling.
    pub fn allocate(&mut self, obj: Obj) -> ObjRef {
        let size = object_size(&obj);
        self.bytes_allocated += size;
        let slot = Slot {
            marked: false,
            size,
            obj,
        };
        match self.free.pop() {
            Some(index) => {
                self.slots[index as usize] = Some(slot);
                ObjRef(index)
            }
            None => {
                self.slots.push(Some(slot));
                ObjRef((self.slots.len() - 1) as u32)
            }
        }
    }

    /// Intern a string: return the existing handle for byte-equal contents,
    /// else allocate and register a new one.
    pub fn intern(&mut self, chars: &str) -> ObjRef {
        let hash = hash_str(chars);
        let slots = &self.slots;
        let found = self.strings.find_key(hash, |obj| {
            matches!(slots[obj.index()].as_ref().map(|s| &s.obj), Some(Obj::String(s)) if s.chars == chars)
        });
        if let Some(key) = found {
            return key.obj;
        }

        let obj = self.allocate(Obj::String(Str {
            chars: chars.to_string(),
            hash,
        }));
        self.strings.set(StrKey { obj, hash }, Value::Nil);
        obj
    }

    /// Look up an already-interned string without allocating
    pub fn find_interned(&self, chars: &str) -> Option<ObjRef> {
        let hash = hash_str(chars);
        let slots = &self.slots;
        self.strings
            .find_key(hash, |obj| {
                matches!(slots[obj.index()].as_ref().map(|s| &s.obj), Some(Obj::String(s)) if s.chars == chars)
            })
            .map(|key| key.obj)
    }

    /// Build a table key for an interned string
    pub fn key(&self, obj: ObjRef) -> StrKey {
        StrKey {
            obj,
            hash: self.string(obj).hash,
        }
    }

    // === Typed accessors ===
    //
    // Callers check kinds before downcasting (the VM reports a runtime error
    // for a wrong-kind value); reaching the panic here means a compiler or VM
    // invariant broke.

    pub fn get(&self, handle: ObjRef) -> &Obj {
        &self
            .slots[handle.index()]
            .as_ref()
            .expect("use of freed object handle")
            .obj
    }

    pub fn get_mut(&mut self, handle: ObjRef) -> &mut Obj {
        &mut self
            .slots[handle.index()]
            .as_mut()
            .expect("use of freed object handle")
            .obj
    }

    pub fn string(&self, handle: ObjRef) -> &Str {
        match self.get(handle) {
            Obj::String(s) => s,
            other => panic!("expected string object, found {:?}", other),
        }
    }

    pub fn function(&self, handle: ObjRef) -> &crate::object::Function {
        match self.get(handle) {
            Obj::Function(f) => f,
            other => panic!("expected function object, found {:?}", other),
        }
    }

    pub fn native(&self, handle: ObjRef) -> &crate::object::Native {
        match self.get(handle) {
            Obj::Native(n) => n,
            other => panic!("expected native object, found {:?}", other),
        }
    }

    pub fn closure(&self, handle: ObjRef) -> &crate::object::Closure {
        match self.get(handle) {
            Obj::Closure(c) => c,
            other => panic!("expected closure object, found {:?}", other),
        }
    }

    pub fn closure_mut(&mut self, handle: ObjRef) -> &mut crate::object::Closure {
        match self.get_mut(handle) {
            Obj::Closure(c) => c,
            other => panic!("expected closure object, found {:?}", other),
        }
    }

    pub fn upvalue(&self, handle: ObjRef) -> &crate::object::Upvalue {
        match self.get(handle) {
            Obj::Upvalue(u) => u,
            other => panic!("expected upvalue object, found {:?}", other),
        }
    }

    pub fn upvalue_mut(&mut self, handle: ObjRef) -> &mut crate::object::Upvalue {
        match self.get_mut(handle) {
            Obj::Upvalue(u) => u,
            other => panic!("expected upvalue object, found {:?}", other),
        }
    }

    pub fn class(&self, handle: ObjRef) -> &crate::object::Class {
        match self.get(handle) {
            Obj::Class(c) => c,
            other => panic!("expected class object, found {:?}", other),
        }
    }

    pub fn class_mut(&mut self, handle: ObjRef) -> &mut crate::object::Class {
        match self.get_mut(handle) {
            Obj::Class(c) => c,
            other => panic!("expected class object, found {:?}", other),
        }
    }

    pub fn instance(&self, handle: ObjRef) -> &crate::object::Instance {
        match self.get(handle) {
            Obj::Instance(i) => i,
            other => panic!("expected instance object, found {:?}", other),
        }
    }

    pub fn instance_mut(&mut self, handle: ObjRef) -> &mut crate::object::Instance {
        match self.get_mut(handle) {
            Obj::Instance(i) => i,
            other => panic!("expected instance object, found {:?}", other),
        }
    }

    pub fn bound_method(&self, handle: ObjRef) -> &crate::object::BoundMethod {
        match self.get(handle) {
            Obj::BoundMethod(b) => b,
            other => panic!("expected bound method object, found {:?}", other),
        }
    }

    /// The function a closure wraps
    pub fn closure_function(&self, closure: ObjRef) -> &crate::object::Function {
        self.function(self.closure(closure).function)
    }

    /// Copy every method of `superclass` into `subclass`. Runs before the
    /// subclass declares its own methods, so overrides win.
    pub fn inherit_methods(&mut self, superclass: ObjRef, subclass: ObjRef) {
        let methods: Vec<(StrKey, Value)> = self.class(superclass).methods.iter().collect();
        let sub = self.class_mut(subclass);
        for (key, value) in methods {
            sub.methods.set(key, value);
        }
    }

    // === Marking ===

    pub fn mark_value(&mut self, value: Value) {
        if let Value::Obj(handle) = value {
            self.mark_object(handle);
        }
    }

    /// Mark an object grey: flagged, queued for tracing
    pub fn mark_object(&mut self, handle: ObjRef) {
        let slot = self.slots[handle.index()]
            .as_mut()
            .expect("marking freed object");
        if slot.marked {
            return;
        }
        slot.marked = true;
        self.grey.push(handle);
    }

    /// Mark every key and value of a table
    pub fn mark_table(&mut self, table: &Table) {
        for (key, value) in table.iter() {
            self.mark_object(key.obj);
            self.mark_value(value);
        }
    }

    /// Drain the grey worklist, blackening each object by marking its
    /// children.
    pub fn trace_references(&mut self) {
        while let Some(handle) = self.grey.pop() {
            self.blacken(handle);
        }
    }

    fn blacken(&mut self, handle: ObjRef) {
        // Collect children first; marking mutates other slots.
        let mut children: Vec<ObjRef> = Vec::new();
        let mut child_values: Vec<Value> = Vec::new();
        match self.get(handle) {
            Obj::String(_) | Obj::Native(_) => {}
            Obj::Function(f) => {
                if let Some(name) = f.name {
                    children.push(name);
                }
                child_values.extend(f.chunk.constants.iter().copied());
            }
            Obj::Closure(c) => {
                children.push(c.function);
                children.extend(c.upvalues.iter().copied());
            }
            Obj::Upvalue(u) => {
                if let UpvalueState::Closed(value) = u.state {
                    child_values.push(value);
                }
            }
            Obj::Class(c) => {
                children.push(c.name);
                for (key, value) in c.methods.iter() {
                    children.push(key.obj);
                    child_values.push(value);
                }
            }
            Obj::Instance(i) => {
                children.push(i.class);
                for (key, value) in i.fields.iter() {
                    children.push(key.obj);
                    child_values.push(value);
                }
            }
            Obj::BoundMethod(b) => {
                children.push(b.method);
                child_values.push(b.receiver);
            }
        }
        for child in children {
            self.mark_object(child);
        }
        for value in child_values {
            self.mark_value(value);
        }
    }

    /// Whether an object survived the mark phase
    fn is_marked(slots: &[Option<Slot>], handle: ObjRef) -> bool {
        slots[handle.index()].as_ref().is_some_and(|s| s.marked)
    }

    /// Evict intern-table entries whose string did not survive marking. Runs
    /// between tracing and the sweep, so the sweep can free those strings.
    pub fn remove_white_strings(&mut self) {
        let slots = &self.slots;
        self.strings
            .remove_where(|obj| !Self::is_marked(slots, obj));
    }

    /// Free every unmarked object and clear the mark bits of survivors.
    /// Returns (objects freed, bytes freed) and schedules the next
    /// collection.
    pub fn sweep(&mut self) -> (usize, usize) {
        let mut freed = 0usize;
        let mut freed_bytes = 0usize;
        for (index, slot) in self.slots.iter_mut().enumerate() {
            match slot {
                Some(s) if s.marked => s.marked = false,
                Some(s) => {
                    freed += 1;
                    freed_bytes += s.size;
                    *slot = None;
                    self.free.push(index as u32);
                }
                None => {}
            }
        }
        self.bytes_allocated = self.bytes_allocated.saturating_sub(freed_bytes);
        self.next_gc = (self.bytes_allocated * GC_GROW_FACTOR).max(GC_FIRST_THRESHOLD / 16);
        (freed, freed_bytes)
    }
}

impl ObjRef {
    fn index(self) -> usize {
        self.0 as usize
    }
}

/// 32-bit FNV-1a
pub fn hash_str(s: &str) -> u32 {
    let mut hash: u32 = 2166136261;
    for &byte in s.as_bytes() {
        hash ^= byte as u32;
        hash = hash.wrapping_mul(16777619);
    }
    hash
}

/// Approximate size of an object. Payload growth after allocation (a field
/// table resizing, say) is not re-measured; the recorded size is what the
/// sweep gives back.
fn object_size(obj: &Obj) -> usize {
    use std::mem::size_of;
    let payload = match obj {
        Obj::String(s) => s.chars.capacity(),
        Obj::Function(f) => {
            f.chunk.code.capacity()
                + f.chunk.lines.capacity() * size_of::<u32>()
                + f.chunk.constants.capacity() * size_of::<Value>()
        }
        Obj::Closure(c) => c.upvalues.capacity() * size_of::<ObjRef>(),
        Obj::Class(c) => c.methods.len() * size_of::<(StrKey, Value)>(),
        Obj::Instance(i) => i.fields.len() * size_of::<(StrKey, Value)>(),
        Obj::Native(_) | Obj::Upvalue(_) | Obj::BoundMethod(_) => 0,
    };
    size_of::<Slot>() + payload
}
