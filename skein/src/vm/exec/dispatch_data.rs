use super::{Exec, Interrupt, Signal, Vm};
use crate::vm::object::{BoundMethodObj, ClassObj, ListObj, ObjBody, ObjRef};
use crate::vm::table::Table;
use crate::vm::value::Value;

// ---------------------------------------------------------------------------
// Globals, classes, properties, lists, indexing
// ---------------------------------------------------------------------------

/// Kind-and-length snapshot of an indexing target, taken so the heap borrow
/// ends before bounds checks report errors.
enum Indexable {
    List(usize),
    Str(usize),
    No,
}

impl Vm {
    // -- Globals --

    pub(crate) fn op_get_global(&mut self) -> Exec {
        let (name, hash) = self.read_name();
        match self.globals.get(name, hash) {
            Some(value) => {
                self.push(value)?;
                Ok(Signal::Continue)
            }
            None => {
                let text = self.heap.string(name).to_display();
                Err(self.report(&format!("Undefined variable '{text}'.")))
            }
        }
    }

    pub(crate) fn op_define_global(&mut self) -> Exec {
        let (name, hash) = self.read_name();
        let value = self.peek(0);
        self.globals.set(name, hash, value);
        self.pop()?;
        Ok(Signal::Continue)
    }

    pub(crate) fn op_set_global(&mut self) -> Exec {
        let (name, hash) = self.read_name();
        let value = self.peek(0);
        if self.globals.set(name, hash, value) {
            // The name was not defined; undo the insert and fail.
            self.globals.delete(name, hash);
            let text = self.heap.string(name).to_display();
            return Err(self.report(&format!("Undefined variable '{text}'.")));
        }
        Ok(Signal::Continue)
    }

    // -- Classes --

    pub(crate) fn op_class(&mut self) -> Exec {
        let (name, _) = self.read_name();
        let class = self.alloc(ObjBody::Class(ClassObj {
            name,
            methods: Table::new(),
        }));
        self.push(Value::Obj(class))?;
        Ok(Signal::Continue)
    }

    pub(crate) fn op_inherit(&mut self) -> Exec {
        let superclass = match self.peek(1).as_obj() {
            Some(r) if matches!(self.heap.get(r).body, ObjBody::Class(_)) => r,
            _ => return Err(self.report("Superclass must be a class.")),
        };
        let subclass = match self.peek(0).as_obj() {
            Some(r) => r,
            None => unreachable!("inherit target is a class"),
        };
        // Copy now, override later: methods declared after OP_INHERIT
        // replace the inherited entries.
        let methods = self.heap.class(superclass).methods.clone();
        methods.add_all_to(&mut self.heap.class_mut(subclass).methods);
        self.pop()?; // subclass
        Ok(Signal::Continue)
    }

    pub(crate) fn op_method(&mut self) -> Exec {
        let (name, hash) = self.read_name();
        let method = self.peek(0);
        let class = match self.peek(1).as_obj() {
            Some(r) => r,
            None => unreachable!("method target is a class"),
        };
        self.heap.class_mut(class).methods.set(name, hash, method);
        self.pop()?;
        Ok(Signal::Continue)
    }

    // -- Properties --

    pub(crate) fn op_get_property(&mut self) -> Exec {
        let (name, hash) = self.read_name();
        let instance = match self.peek(0).as_obj() {
            Some(r) if matches!(self.heap.get(r).body, ObjBody::Instance(_)) => r,
            _ => return Err(self.report("Only instances have properties.")),
        };
        if let Some(value) = self.heap.instance(instance).fields.get(name, hash) {
            self.pop()?;
            self.push(value)?;
            return Ok(Signal::Continue);
        }
        let class = self.heap.instance(instance).class;
        self.bind_method(class, name, hash)?;
        Ok(Signal::Continue)
    }

    pub(crate) fn op_set_property(&mut self) -> Exec {
        let (name, hash) = self.read_name();
        let instance = match self.peek(1).as_obj() {
            Some(r) if matches!(self.heap.get(r).body, ObjBody::Instance(_)) => r,
            _ => return Err(self.report("Only instances have fields.")),
        };
        let value = self.peek(0);
        self.heap.instance_mut(instance).fields.set(name, hash, value);
        let value = self.pop()?;
        self.pop()?; // instance
        self.push(value)?;
        Ok(Signal::Continue)
    }

    pub(crate) fn op_get_super(&mut self) -> Exec {
        let (name, hash) = self.read_name();
        let superclass = match self.pop()?.as_obj() {
            Some(r) => r,
            None => unreachable!("superclass slot holds a class"),
        };
        self.bind_method(superclass, name, hash)?;
        Ok(Signal::Continue)
    }

    /// Replace the receiver on top of the stack with a bound method from
    /// `class`, or fail with the undefined-property error.
    fn bind_method(&mut self, class: ObjRef, name: ObjRef, hash: u32) -> Result<(), Interrupt> {
        match self.heap.class(class).methods.get(name, hash) {
            Some(method) => {
                let method_ref = match method.as_obj() {
                    Some(r) => r,
                    None => unreachable!("methods are closures"),
                };
                let receiver = self.peek(0);
                // Receiver stays rooted on the stack during allocation.
                let bound = self.alloc(ObjBody::BoundMethod(BoundMethodObj {
                    receiver,
                    method: method_ref,
                }));
                self.pop()?;
                self.push(Value::Obj(bound))?;
                Ok(())
            }
            None => {
                let text = self.heap.string(name).to_display();
                Err(self.report(&format!("Undefined property '{text}'.")))
            }
        }
    }

    // -- Lists and indexing --

    pub(crate) fn op_build_list(&mut self) -> Exec {
        let count = self.read_byte() as usize;
        // Allocate first: the items are still rooted on the stack.
        let list = self.alloc(ObjBody::List(ListObj {
            items: Vec::with_capacity(count),
        }));
        let start = self.stack.len() - count;
        let items: Vec<Value> = self.stack[start..].to_vec();
        self.heap.list_mut(list).items = items;
        self.stack.truncate(start);
        self.push(Value::Obj(list))?;
        Ok(Signal::Continue)
    }

    pub(crate) fn op_index_get(&mut self) -> Exec {
        let index = self.pop()?;
        let target = self.pop()?;
        let r = match target.as_obj() {
            Some(r) => r,
            None => return Err(self.report("Only lists and strings can be indexed.")),
        };
        match self.indexable_len(r) {
            Indexable::List(len) => {
                let i = self.check_index(index, len)?;
                let value = self.heap.list(r).items[i];
                self.push(value)?;
            }
            Indexable::Str(len) => {
                let i = self.check_index(index, len)?;
                let byte = self.heap.string(r).bytes[i];
                let result = self.intern(&[byte]);
                self.push(Value::Obj(result))?;
            }
            Indexable::No => {
                return Err(self.report("Only lists and strings can be indexed."))
            }
        }
        Ok(Signal::Continue)
    }

    pub(crate) fn op_index_set(&mut self) -> Exec {
        let value = self.pop()?;
        let index = self.pop()?;
        let target = self.pop()?;
        let r = match target.as_obj() {
            Some(r) => r,
            None => return Err(self.report("Only lists and strings can be indexed.")),
        };
        match self.indexable_len(r) {
            Indexable::List(len) => {
                let i = self.check_index(index, len)?;
                self.heap.list_mut(r).items[i] = value;
            }
            Indexable::Str(len) => {
                let i = self.check_index(index, len)?;
                // In-place byte write, the original's legacy behavior.
                let source = match value.as_obj() {
                    Some(s)
                        if self.heap.is_string(s) && self.heap.string(s).bytes.len() == 1 =>
                    {
                        s
                    }
                    _ => {
                        return Err(
                            self.report("Can only assign a single-character string.")
                        )
                    }
                };
                let byte = self.heap.string(source).bytes[0];
                self.heap.string_mut(r).bytes[i] = byte;
            }
            Indexable::No => {
                return Err(self.report("Only lists and strings can be indexed."))
            }
        }
        // Assignment evaluates to the assigned value.
        self.push(value)?;
        Ok(Signal::Continue)
    }

    fn indexable_len(&self, r: ObjRef) -> Indexable {
        match &self.heap.get(r).body {
            ObjBody::List(list) => Indexable::List(list.items.len()),
            ObjBody::String(string) => Indexable::Str(string.bytes.len()),
            _ => Indexable::No,
        }
    }

    fn check_index(&mut self, index: Value, len: usize) -> Result<usize, Interrupt> {
        let n = match index {
            Value::Number(n) => n,
            _ => return Err(self.report("Index must be a number.")),
        };
        if n.fract() != 0.0 {
            return Err(self.report("Index must be an integer."));
        }
        if n < 0.0 || n >= len as f64 {
            return Err(self.report("Index out of range."));
        }
        Ok(n as usize)
    }
}
