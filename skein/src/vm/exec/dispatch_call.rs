use super::frame::{CallFrame, FRAMES_MAX};
use super::{Exec, Interrupt, Signal, Vm};
use crate::vm::object::{ClosureObj, InstanceObj, NativeFn, ObjBody, ObjRef, UpvalueObj, UpvalueState};
use crate::vm::table::Table;
use crate::vm::value::Value;

// ---------------------------------------------------------------------------
// Calls, returns, closures, upvalues
// ---------------------------------------------------------------------------

/// Snapshot of a callee's kind, taken so the heap borrow ends before the
/// call machinery mutates the VM.
enum Callee {
    Closure,
    BoundMethod(Value, ObjRef),
    Class,
    Native(&'static str, u8, NativeFn),
    NotCallable,
}

impl Vm {
    pub(crate) fn op_call(&mut self) -> Exec {
        let arg_count = self.read_byte() as usize;
        let callee = self.peek(arg_count);
        self.call_value(callee, arg_count)?;
        Ok(Signal::Continue)
    }

    pub(crate) fn call_value(
        &mut self,
        callee: Value,
        arg_count: usize,
    ) -> Result<(), Interrupt> {
        let r = match callee.as_obj() {
            Some(r) => r,
            None => return Err(self.report("Can only call functions and classes.")),
        };
        let kind = match &self.heap.get(r).body {
            ObjBody::Closure(_) => Callee::Closure,
            ObjBody::BoundMethod(b) => Callee::BoundMethod(b.receiver, b.method),
            ObjBody::Class(_) => Callee::Class,
            ObjBody::Native(n) => Callee::Native(n.name, n.arity, n.function),
            _ => Callee::NotCallable,
        };
        match kind {
            Callee::Closure => self.call_closure(r, arg_count),
            Callee::BoundMethod(receiver, method) => {
                let slot = self.stack.len() - arg_count - 1;
                self.stack[slot] = receiver;
                self.call_closure(method, arg_count)
            }
            Callee::Class => {
                // The class is rooted at peek(arg_count) while we allocate.
                let instance = self.alloc(ObjBody::Instance(InstanceObj {
                    class: r,
                    fields: Table::new(),
                }));
                let slot = self.stack.len() - arg_count - 1;
                self.stack[slot] = Value::Obj(instance);

                let init_string = self.init_string();
                let init_hash = self.heap.string(init_string).hash;
                match self.heap.class(r).methods.get(init_string, init_hash) {
                    Some(initializer) => {
                        let init_ref = match initializer.as_obj() {
                            Some(r) => r,
                            None => unreachable!("methods are closures"),
                        };
                        self.call_closure(init_ref, arg_count)
                    }
                    None if arg_count != 0 => Err(self.report(&format!(
                        "Expected 0 arguments but got {arg_count}."
                    ))),
                    None => Ok(()),
                }
            }
            Callee::Native(_, arity, function) => {
                if arg_count != arity as usize {
                    return Err(self.report(&format!(
                        "Expected {arity} arguments but got {arg_count}."
                    )));
                }
                let args_start = self.stack.len() - arg_count;
                let args: Vec<Value> = self.stack[args_start..].to_vec();
                match function(&mut self.heap, &args) {
                    Ok(result) => {
                        self.drop_top(arg_count + 1);
                        self.push(result)?;
                        Ok(())
                    }
                    Err(e) => Err(self.report(&e.0)),
                }
            }
            Callee::NotCallable => Err(self.report("Can only call functions and classes.")),
        }
    }

    pub(crate) fn call_closure(
        &mut self,
        closure: ObjRef,
        arg_count: usize,
    ) -> Result<(), Interrupt> {
        let function = self.heap.closure(closure).function;
        let arity = self.heap.function(function).arity as usize;
        if arg_count != arity {
            return Err(self.report(&format!(
                "Expected {arity} arguments but got {arg_count}."
            )));
        }
        if self.frames.len() == FRAMES_MAX {
            return Err(self.report("Stack overflow."));
        }
        let chunk = self.heap.function(function).chunk.clone();
        self.frames.push(CallFrame {
            closure,
            chunk,
            ip: 0,
            slots: self.stack.len() - arg_count - 1,
        });
        Ok(())
    }

    pub(crate) fn op_return(&mut self) -> Exec {
        let result = self.pop()?;
        let frame = match self.frames.pop() {
            Some(frame) => frame,
            None => unreachable!("return without a frame"),
        };
        self.close_upvalues(frame.slots);
        if self.frames.is_empty() {
            // Pop the script closure.
            self.pop()?;
            return Ok(Signal::Done);
        }
        self.stack.truncate(frame.slots);
        self.push(result)?;
        Ok(Signal::Continue)
    }

    // -- Method dispatch --

    pub(crate) fn op_invoke(&mut self) -> Exec {
        let (name, hash) = self.read_name();
        let arg_count = self.read_byte() as usize;
        let receiver = self.peek(arg_count);
        let instance = match receiver.as_obj() {
            Some(r) if matches!(self.heap.get(r).body, ObjBody::Instance(_)) => r,
            _ => return Err(self.report("Only instances have methods.")),
        };

        // A field shadows a method of the same name; it might hold any
        // callable.
        if let Some(field) = self.heap.instance(instance).fields.get(name, hash) {
            let slot = self.stack.len() - arg_count - 1;
            self.stack[slot] = field;
            self.call_value(field, arg_count)?;
            return Ok(Signal::Continue);
        }

        let class = self.heap.instance(instance).class;
        self.invoke_from_class(class, name, hash, arg_count)?;
        Ok(Signal::Continue)
    }

    pub(crate) fn op_super_invoke(&mut self) -> Exec {
        let (name, hash) = self.read_name();
        let arg_count = self.read_byte() as usize;
        let superclass = match self.pop()?.as_obj() {
            Some(r) => r,
            None => unreachable!("superclass slot holds a class"),
        };
        self.invoke_from_class(superclass, name, hash, arg_count)?;
        Ok(Signal::Continue)
    }

    fn invoke_from_class(
        &mut self,
        class: ObjRef,
        name: ObjRef,
        hash: u32,
        arg_count: usize,
    ) -> Result<(), Interrupt> {
        match self.heap.class(class).methods.get(name, hash) {
            Some(method) => {
                let method_ref = match method.as_obj() {
                    Some(r) => r,
                    None => unreachable!("methods are closures"),
                };
                self.call_closure(method_ref, arg_count)
            }
            None => {
                let text = self.heap.string(name).to_display();
                Err(self.report(&format!("Undefined property '{text}'.")))
            }
        }
    }

    // -- Closures and upvalues --

    pub(crate) fn op_closure(&mut self) -> Exec {
        let function = match self.read_constant() {
            Value::Obj(r) => r,
            _ => unreachable!("closure operand is a function constant"),
        };
        let upvalue_count = self.heap.function(function).upvalue_count;

        // The function constant is rooted through the running frame's
        // chunk; the fresh closure is pushed before capturing so every
        // later allocation sees it as a root.
        let closure = self.alloc(ObjBody::Closure(ClosureObj {
            function,
            upvalues: Vec::with_capacity(upvalue_count),
        }));
        self.push(Value::Obj(closure))?;

        for _ in 0..upvalue_count {
            let is_local = self.read_byte() == 1;
            let index = self.read_byte() as usize;
            let upvalue = if is_local {
                let slot = self.frame().slots + index;
                self.capture_upvalue(slot)
            } else {
                self.heap.closure(self.frame().closure).upvalues[index]
            };
            self.heap.closure_mut(closure).upvalues.push(upvalue);
        }
        Ok(Signal::Continue)
    }

    pub(crate) fn op_get_upvalue(&mut self) -> Exec {
        let index = self.read_byte() as usize;
        let upvalue = self.heap.closure(self.frame().closure).upvalues[index];
        let value = match self.heap.upvalue(upvalue).state {
            UpvalueState::Open(slot) => self.stack[slot],
            UpvalueState::Closed(value) => value,
        };
        self.push(value)?;
        Ok(Signal::Continue)
    }

    pub(crate) fn op_set_upvalue(&mut self) -> Exec {
        let index = self.read_byte() as usize;
        let upvalue = self.heap.closure(self.frame().closure).upvalues[index];
        let value = self.peek(0);
        match self.heap.upvalue(upvalue).state {
            UpvalueState::Open(slot) => self.stack[slot] = value,
            UpvalueState::Closed(_) => {
                self.heap.upvalue_mut(upvalue).state = UpvalueState::Closed(value);
            }
        }
        Ok(Signal::Continue)
    }

    pub(crate) fn op_close_upvalue(&mut self) -> Exec {
        self.close_upvalues(self.stack.len() - 1);
        self.pop()?;
        Ok(Signal::Continue)
    }

    /// Find or create the upvalue for a stack slot. The open list is kept
    /// sorted by descending slot with at most one upvalue per slot.
    fn capture_upvalue(&mut self, slot: usize) -> ObjRef {
        let mut prev: Option<ObjRef> = None;
        let mut current = self.open_upvalues;
        while let Some(r) = current {
            let (state, next) = {
                let u = self.heap.upvalue(r);
                (u.state, u.next)
            };
            match state {
                UpvalueState::Open(s) if s > slot => {
                    prev = Some(r);
                    current = next;
                }
                UpvalueState::Open(s) if s == slot => return r,
                _ => break,
            }
        }

        let created = self.alloc(ObjBody::Upvalue(UpvalueObj {
            state: UpvalueState::Open(slot),
            next: current,
        }));
        match prev {
            Some(p) => self.heap.upvalue_mut(p).next = Some(created),
            None => self.open_upvalues = Some(created),
        }
        created
    }

    /// Close every open upvalue at or above `last`, moving the stack value
    /// into the cell and unlinking it from the open list.
    pub(crate) fn close_upvalues(&mut self, last: usize) {
        while let Some(r) = self.open_upvalues {
            let (state, next) = {
                let u = self.heap.upvalue(r);
                (u.state, u.next)
            };
            let slot = match state {
                UpvalueState::Open(slot) => slot,
                UpvalueState::Closed(_) => break,
            };
            if slot < last {
                break;
            }
            let value = self.stack[slot];
            let upvalue = self.heap.upvalue_mut(r);
            upvalue.state = UpvalueState::Closed(value);
            upvalue.next = None;
            self.open_upvalues = next;
        }
    }
}
