use std::mem;

use super::object::{
    BoundMethodObj, ClassObj, ClosureObj, FnObj, InstanceObj, ListObj, Obj, ObjBody, ObjRef,
    StrObj, UpvalueObj, UpvalueState,
};
use super::table::{hash_bytes, Table};
use super::value::{format_number, Value};

// ---------------------------------------------------------------------------
// Heap
// ---------------------------------------------------------------------------
//
// Arena allocator plus tri-color mark-sweep collector. Objects live in
// `slots`, addressed by `ObjRef` index; freed slots go on a free list and
// are only reused after a sweep, so a live handle can never dangle.
//
// The heap also owns the intern table. Interned strings are weak roots:
// `remove_white_strings` runs between trace and sweep so interning cannot
// resurrect a dead string.
//
// The collector itself never decides when to run; the VM checks
// `should_collect` at its allocation points and marks its roots first.

/// Heap growth factor applied to the threshold after each collection.
const GC_HEAP_GROW_FACTOR: usize = 2;

/// First collection threshold.
const FIRST_GC_AT: usize = 1024 * 1024;

#[derive(Clone)]
pub struct Heap {
    slots: Vec<Option<Obj>>,
    free: Vec<u32>,
    /// Gray worklist. Plain `Vec`, not itself GC-managed.
    gray: Vec<ObjRef>,
    pub(crate) strings: Table,
    bytes_allocated: usize,
    next_gc: usize,
    stress: bool,
}

impl Heap {
    pub fn new() -> Heap {
        Heap {
            slots: Vec::new(),
            free: Vec::new(),
            gray: Vec::new(),
            strings: Table::new(),
            bytes_allocated: 0,
            next_gc: FIRST_GC_AT,
            stress: false,
        }
    }

    /// Collect on every allocation. Test hook for shaking out missing roots.
    pub fn set_stress(&mut self, on: bool) {
        self.stress = on;
    }

    pub fn should_collect(&self) -> bool {
        self.stress || self.bytes_allocated > self.next_gc
    }

    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }

    /// Number of live objects in the arena.
    pub fn object_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    // -- Allocation --

    pub fn alloc(&mut self, body: ObjBody) -> ObjRef {
        self.bytes_allocated += Self::obj_size(&body);
        let obj = Obj {
            marked: false,
            body,
        };
        match self.free.pop() {
            Some(index) => {
                self.slots[index as usize] = Some(obj);
                ObjRef(index)
            }
            None => {
                self.slots.push(Some(obj));
                ObjRef((self.slots.len() - 1) as u32)
            }
        }
    }

    /// Intern a string: return the existing handle for these bytes, or
    /// allocate a fresh string object and register it.
    pub fn intern(&mut self, s: &str) -> ObjRef {
        self.intern_bytes(s.as_bytes())
    }

    pub fn intern_bytes(&mut self, bytes: &[u8]) -> ObjRef {
        let hash = hash_bytes(bytes);
        let slots = &self.slots;
        let found = self.strings.find_string(hash, |r| {
            match &slots[r.index()] {
                Some(Obj {
                    body: ObjBody::String(s),
                    ..
                }) => s.bytes == bytes,
                _ => false,
            }
        });
        if let Some(r) = found {
            return r;
        }
        let r = self.alloc(ObjBody::String(StrObj {
            bytes: bytes.to_vec(),
            hash,
        }));
        self.strings.set(r, hash, Value::Nil);
        r
    }

    /// Approximate size accounting for the GC trigger.
    fn obj_size(body: &ObjBody) -> usize {
        let payload = match body {
            ObjBody::String(s) => s.bytes.len(),
            ObjBody::Function(f) => {
                f.chunk.code.len() + f.chunk.constants.len() * mem::size_of::<Value>()
            }
            ObjBody::Closure(c) => c.upvalues.len() * mem::size_of::<ObjRef>(),
            ObjBody::List(l) => l.items.len() * mem::size_of::<Value>(),
            ObjBody::Class(_)
            | ObjBody::Instance(_)
            | ObjBody::Upvalue(_)
            | ObjBody::BoundMethod(_)
            | ObjBody::Native(_)
            | ObjBody::Future(_) => 0,
        };
        mem::size_of::<Obj>() + payload
    }

    // -- Typed access --
    //
    // The bytecode verifier is the compiler: opcodes check value kinds
    // before reaching these, so a kind mismatch here is a VM bug.

    pub fn get(&self, r: ObjRef) -> &Obj {
        match &self.slots[r.index()] {
            Some(obj) => obj,
            None => panic!("heap: access to freed object {:?}", r),
        }
    }

    pub fn get_mut(&mut self, r: ObjRef) -> &mut Obj {
        match &mut self.slots[r.index()] {
            Some(obj) => obj,
            None => panic!("heap: access to freed object {:?}", r),
        }
    }

    pub fn kind_name(&self, r: ObjRef) -> &'static str {
        self.get(r).body.kind_name()
    }

    pub fn is_string(&self, r: ObjRef) -> bool {
        matches!(self.get(r).body, ObjBody::String(_))
    }

    pub fn string(&self, r: ObjRef) -> &StrObj {
        match &self.get(r).body {
            ObjBody::String(s) => s,
            _ => panic!("heap: expected string"),
        }
    }

    pub fn string_mut(&mut self, r: ObjRef) -> &mut StrObj {
        match &mut self.get_mut(r).body {
            ObjBody::String(s) => s,
            _ => panic!("heap: expected string"),
        }
    }

    pub fn function(&self, r: ObjRef) -> &FnObj {
        match &self.get(r).body {
            ObjBody::Function(f) => f,
            _ => panic!("heap: expected function"),
        }
    }

    pub fn closure(&self, r: ObjRef) -> &ClosureObj {
        match &self.get(r).body {
            ObjBody::Closure(c) => c,
            _ => panic!("heap: expected closure"),
        }
    }

    pub fn closure_mut(&mut self, r: ObjRef) -> &mut ClosureObj {
        match &mut self.get_mut(r).body {
            ObjBody::Closure(c) => c,
            _ => panic!("heap: expected closure"),
        }
    }

    pub fn upvalue(&self, r: ObjRef) -> &UpvalueObj {
        match &self.get(r).body {
            ObjBody::Upvalue(u) => u,
            _ => panic!("heap: expected upvalue"),
        }
    }

    pub fn upvalue_mut(&mut self, r: ObjRef) -> &mut UpvalueObj {
        match &mut self.get_mut(r).body {
            ObjBody::Upvalue(u) => u,
            _ => panic!("heap: expected upvalue"),
        }
    }

    pub fn class(&self, r: ObjRef) -> &ClassObj {
        match &self.get(r).body {
            ObjBody::Class(c) => c,
            _ => panic!("heap: expected class"),
        }
    }

    pub fn class_mut(&mut self, r: ObjRef) -> &mut ClassObj {
        match &mut self.get_mut(r).body {
            ObjBody::Class(c) => c,
            _ => panic!("heap: expected class"),
        }
    }

    pub fn instance(&self, r: ObjRef) -> &InstanceObj {
        match &self.get(r).body {
            ObjBody::Instance(i) => i,
            _ => panic!("heap: expected instance"),
        }
    }

    pub fn instance_mut(&mut self, r: ObjRef) -> &mut InstanceObj {
        match &mut self.get_mut(r).body {
            ObjBody::Instance(i) => i,
            _ => panic!("heap: expected instance"),
        }
    }

    pub fn bound_method(&self, r: ObjRef) -> &BoundMethodObj {
        match &self.get(r).body {
            ObjBody::BoundMethod(b) => b,
            _ => panic!("heap: expected bound method"),
        }
    }

    pub fn list(&self, r: ObjRef) -> &ListObj {
        match &self.get(r).body {
            ObjBody::List(l) => l,
            _ => panic!("heap: expected list"),
        }
    }

    pub fn list_mut(&mut self, r: ObjRef) -> &mut ListObj {
        match &mut self.get_mut(r).body {
            ObjBody::List(l) => l,
            _ => panic!("heap: expected list"),
        }
    }

    // -- Marking --

    pub fn mark_value(&mut self, value: Value) {
        if let Value::Obj(r) = value {
            self.mark_object(r);
        }
    }

    pub fn mark_object(&mut self, r: ObjRef) {
        let obj = match &mut self.slots[r.index()] {
            Some(obj) => obj,
            None => return,
        };
        if obj.marked {
            return;
        }
        obj.marked = true;
        self.gray.push(r);
    }

    /// Drain the gray worklist, blackening each object by marking its
    /// referents.
    pub fn trace_references(&mut self) {
        while let Some(r) = self.gray.pop() {
            self.blacken(r);
        }
    }

    fn blacken(&mut self, r: ObjRef) {
        // Gather referents first; marking mutates the arena.
        let mut values: Vec<Value> = Vec::new();
        let mut objects: Vec<ObjRef> = Vec::new();
        match &self.get(r).body {
            ObjBody::String(_) | ObjBody::Native(_) | ObjBody::Future(_) => {}
            ObjBody::Function(f) => {
                if let Some(name) = f.name {
                    objects.push(name);
                }
                values.extend(f.chunk.constants.iter().copied());
            }
            ObjBody::Closure(c) => {
                objects.push(c.function);
                objects.extend(c.upvalues.iter().copied());
            }
            ObjBody::Upvalue(u) => {
                if let UpvalueState::Closed(v) = u.state {
                    values.push(v);
                }
            }
            ObjBody::Class(c) => {
                objects.push(c.name);
                for (k, v) in c.methods.iter() {
                    objects.push(k);
                    values.push(v);
                }
            }
            ObjBody::Instance(i) => {
                objects.push(i.class);
                for (k, v) in i.fields.iter() {
                    objects.push(k);
                    values.push(v);
                }
            }
            ObjBody::BoundMethod(b) => {
                values.push(b.receiver);
                objects.push(b.method);
            }
            ObjBody::List(l) => {
                values.extend(l.items.iter().copied());
            }
        }
        for o in objects {
            self.mark_object(o);
        }
        for v in values {
            self.mark_value(v);
        }
    }

    /// Drop intern-table entries whose string was not marked, so the table
    /// cannot resurrect a string the sweep is about to free.
    pub fn remove_white_strings(&mut self) {
        let dead: Vec<(ObjRef, u32)> = self
            .strings
            .iter_with_hash()
            .filter(|(k, _, _)| !self.get(*k).marked)
            .map(|(k, h, _)| (k, h))
            .collect();
        for (k, h) in dead {
            self.strings.delete(k, h);
        }
    }

    /// Free every unmarked object and clear the mark on survivors.
    pub fn sweep(&mut self) {
        for index in 0..self.slots.len() {
            let survives = match &mut self.slots[index] {
                Some(obj) if obj.marked => {
                    obj.marked = false;
                    true
                }
                Some(_) => false,
                None => true,
            };
            if !survives {
                if let Some(obj) = self.slots[index].take() {
                    self.bytes_allocated = self
                        .bytes_allocated
                        .saturating_sub(Self::obj_size(&obj.body));
                    self.free.push(index as u32);
                }
            }
        }
        self.next_gc = (self.bytes_allocated * GC_HEAP_GROW_FACTOR).max(FIRST_GC_AT);
    }

    // -- Display --

    pub fn value_to_string(&self, value: Value) -> String {
        match value {
            Value::Nil => "nil".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => format_number(n),
            Value::Obj(r) => self.object_to_string(r),
        }
    }

    fn function_name(&self, r: ObjRef) -> String {
        match self.function(r).name {
            Some(name) => format!("<fn {}>", self.string(name).to_display()),
            None => "<script>".to_string(),
        }
    }

    fn object_to_string(&self, r: ObjRef) -> String {
        match &self.get(r).body {
            ObjBody::String(s) => s.to_display(),
            ObjBody::Function(_) => self.function_name(r),
            ObjBody::Closure(c) => self.function_name(c.function),
            ObjBody::BoundMethod(b) => self.function_name(self.closure(b.method).function),
            ObjBody::Upvalue(_) => "upvalue".to_string(),
            ObjBody::Class(c) => self.string(c.name).to_display(),
            ObjBody::Instance(i) => {
                format!("{} instance", self.string(self.class(i.class).name).to_display())
            }
            ObjBody::Native(_) => "<native fn>".to_string(),
            ObjBody::Future(_) => "<future obj>".to_string(),
            ObjBody::List(l) => {
                let items: Vec<String> =
                    l.items.iter().map(|v| self.value_to_string(*v)).collect();
                format!("[{}]", items.join(","))
            }
        }
    }
}

impl Default for Heap {
    fn default() -> Self {
        Heap::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_dedups() {
        let mut heap = Heap::new();
        let a = heap.intern("counter");
        let b = heap.intern("counter");
        let c = heap.intern("other");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn alloc_reuses_swept_slots() {
        let mut heap = Heap::new();
        let garbage = heap.alloc(ObjBody::List(ListObj { items: Vec::new() }));
        // Nothing marked: everything is white.
        heap.trace_references();
        heap.remove_white_strings();
        heap.sweep();
        let fresh = heap.alloc(ObjBody::List(ListObj { items: Vec::new() }));
        assert_eq!(garbage, fresh);
        assert_eq!(heap.object_count(), 1);
    }

    #[test]
    fn mark_keeps_transitive_referents() {
        let mut heap = Heap::new();
        let inner = heap.intern("payload");
        let list = heap.alloc(ObjBody::List(ListObj {
            items: vec![Value::Obj(inner)],
        }));
        heap.mark_object(list);
        heap.trace_references();
        heap.remove_white_strings();
        heap.sweep();
        assert_eq!(heap.object_count(), 2);
        // Marks are cleared for the next cycle.
        assert!(!heap.get(list).marked);
        assert!(!heap.get(inner).marked);
    }

    #[test]
    fn intern_table_does_not_resurrect_dead_strings() {
        let mut heap = Heap::new();
        let dead = heap.intern("ephemeral");
        heap.trace_references();
        heap.remove_white_strings();
        heap.sweep();
        assert_eq!(heap.object_count(), 0);
        // A fresh intern of the same text allocates a new object.
        let alive = heap.intern("ephemeral");
        assert_eq!(alive, dead); // slot reuse, not resurrection
        assert_eq!(heap.object_count(), 1);
    }

    #[test]
    fn bytes_accounting_shrinks_after_sweep() {
        let mut heap = Heap::new();
        heap.alloc(ObjBody::List(ListObj {
            items: vec![Value::Nil; 100],
        }));
        let before = heap.bytes_allocated();
        heap.trace_references();
        heap.remove_white_strings();
        heap.sweep();
        assert!(heap.bytes_allocated() < before);
    }

    #[test]
    fn future_display() {
        use crate::vm::object::FutureObj;
        let mut heap = Heap::new();
        let future = heap.alloc(ObjBody::Future(FutureObj { vm_id: 3 }));
        assert_eq!(heap.value_to_string(Value::Obj(future)), "<future obj>");
    }

    #[test]
    fn list_display() {
        let mut heap = Heap::new();
        let list = heap.alloc(ObjBody::List(ListObj {
            items: vec![Value::Number(1.0), Value::Number(2.5), Value::Nil],
        }));
        assert_eq!(heap.value_to_string(Value::Obj(list)), "[1,2.5,nil]");
    }
}
