mod dispatch_arith;
mod dispatch_call;
mod dispatch_data;
pub(crate) mod frame;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use super::chunk::OpCode;
use super::compiler::compile;
use super::debug::disassemble_chunk;
use super::dispatcher::Dispatcher;
use super::heap::Heap;
use super::natives;
use super::object::{ClosureObj, NativeObj, ObjBody, ObjRef};
use super::table::Table;
use super::value::Value;
use super::InterpretResult;
use frame::{CallFrame, FRAMES_MAX, STACK_MAX};

// ---------------------------------------------------------------------------
// Output sink
// ---------------------------------------------------------------------------

/// Where `print` goes. Forked child VMs share their parent's sink, so a
/// buffered sink observes the whole task tree; each line is written under
/// the lock and stays intact under concurrency.
#[derive(Clone)]
pub enum Output {
    Stdout,
    Buffer(Arc<Mutex<Vec<u8>>>),
}

impl Output {
    /// A capturing sink plus a handle to read it back.
    pub fn buffer() -> (Output, Arc<Mutex<Vec<u8>>>) {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        (Output::Buffer(Arc::clone(&buffer)), buffer)
    }

    fn write_line(&self, line: &str) {
        match self {
            Output::Stdout => println!("{line}"),
            Output::Buffer(buffer) => {
                let mut guard = buffer.lock().unwrap_or_else(|e| e.into_inner());
                guard.extend_from_slice(line.as_bytes());
                guard.push(b'\n');
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Control flow of the dispatch loop
// ---------------------------------------------------------------------------

/// Runtime error marker: diagnostics were already written and the stack was
/// reset by `report`/`fail`.
pub(crate) struct Interrupt;

pub(crate) enum Signal {
    Continue,
    /// The script (or an async body) ran to completion.
    Done,
}

pub(crate) type Exec = Result<Signal, Interrupt>;

// ---------------------------------------------------------------------------
// VM
// ---------------------------------------------------------------------------

pub struct Vm {
    pub(crate) heap: Heap,
    pub(crate) stack: Vec<Value>,
    pub(crate) frames: Vec<CallFrame>,
    /// Head of the open-upvalue list, sorted by descending stack slot.
    pub(crate) open_upvalues: Option<ObjRef>,
    pub(crate) globals: Table,
    init_string: ObjRef,
    /// One entry per lexically active `finish` block; each holds the join
    /// handles of the tasks spawned inside it, in spawn order.
    finish_groups: Vec<Vec<JoinHandle<InterpretResult>>>,
    /// Cooperative cancellation flag, shared with the dispatcher slot.
    pub(crate) cancel: Arc<AtomicBool>,
    dispatcher: Arc<Dispatcher>,
    pub(crate) slot: usize,
    out: Output,
    disassemble: bool,
}

impl Vm {
    pub fn new(dispatcher: &Arc<Dispatcher>) -> Vm {
        Vm::with_output(dispatcher, Output::Stdout)
    }

    pub fn with_output(dispatcher: &Arc<Dispatcher>, out: Output) -> Vm {
        let (slot, cancel) = dispatcher.acquire_slot_spin();
        dispatcher.register_current_thread(slot);

        let mut heap = Heap::new();
        if std::env::var_os("SKEIN_STRESS_GC").is_some() {
            heap.set_stress(true);
        }
        let init_string = heap.intern("init");

        let mut vm = Vm {
            heap,
            stack: Vec::with_capacity(256),
            frames: Vec::with_capacity(FRAMES_MAX),
            open_upvalues: None,
            globals: Table::new(),
            init_string,
            finish_groups: Vec::new(),
            cancel,
            dispatcher: Arc::clone(dispatcher),
            slot,
            out,
            disassemble: false,
        };
        vm.define_natives();
        vm
    }

    /// Dump the compiled top-level chunk to stderr before each run.
    pub fn set_disassemble(&mut self, on: bool) {
        self.disassemble = on;
    }

    /// The dispatcher slot this VM occupies.
    pub fn slot_index(&self) -> usize {
        self.slot
    }

    /// Collect on every allocation (test hook).
    pub fn set_gc_stress(&mut self) {
        self.heap.set_stress(true);
    }

    fn define_natives(&mut self) {
        for def in natives::REGISTRY {
            let name = self.heap.intern(def.name);
            let hash = self.heap.string(name).hash;
            let native = self.heap.alloc(ObjBody::Native(NativeObj {
                name: def.name,
                arity: def.arity,
                function: def.function,
            }));
            self.globals.set(name, hash, Value::Obj(native));
        }
    }

    // -- Entry point --

    pub fn interpret(&mut self, source: &str) -> InterpretResult {
        self.cancel.store(false, Ordering::Relaxed);

        let function = match compile(source, &mut self.heap) {
            Ok(function) => function,
            Err(_) => return InterpretResult::CompileError,
        };

        if self.disassemble {
            let chunk = self.heap.function(function).chunk.clone();
            eprint!("{}", disassemble_chunk(&self.heap, &chunk, "script"));
        }

        self.stack.clear();
        self.frames.clear();
        self.open_upvalues = None;

        if self.push(Value::Obj(function)).is_err() {
            return InterpretResult::RuntimeError;
        }
        let closure = self.alloc(ObjBody::Closure(ClosureObj {
            function,
            upvalues: Vec::new(),
        }));
        self.stack.pop();
        if self.push(Value::Obj(closure)).is_err() {
            return InterpretResult::RuntimeError;
        }
        if self.call_closure(closure, 0).is_err() {
            return InterpretResult::RuntimeError;
        }
        self.run()
    }

    // -- Dispatch loop --

    pub(crate) fn run(&mut self) -> InterpretResult {
        loop {
            // Cancellation is checked once per dispatch step so a global
            // terminate becomes observable within one opcode.
            if self.cancel.load(Ordering::Relaxed) {
                let _ = self.fail();
                return InterpretResult::RuntimeError;
            }

            let byte = self.read_byte();
            let op = match OpCode::from_byte(byte) {
                Some(op) => op,
                None => {
                    let _ = self.report(&format!("Unknown opcode {byte}."));
                    return InterpretResult::RuntimeError;
                }
            };

            let outcome: Exec = match op {
                OpCode::Constant => {
                    let value = self.read_constant();
                    self.push(value).map(|_| Signal::Continue)
                }
                OpCode::Nil => self.push(Value::Nil).map(|_| Signal::Continue),
                OpCode::True => self.push(Value::Bool(true)).map(|_| Signal::Continue),
                OpCode::False => self.push(Value::Bool(false)).map(|_| Signal::Continue),
                OpCode::Pop => self.pop().map(|_| Signal::Continue),
                OpCode::GetLocal => {
                    let slot = self.read_byte() as usize;
                    let value = self.stack[self.frame().slots + slot];
                    self.push(value).map(|_| Signal::Continue)
                }
                OpCode::SetLocal => {
                    let slot = self.read_byte() as usize;
                    let base = self.frame().slots;
                    let value = self.peek(0);
                    self.stack[base + slot] = value;
                    Ok(Signal::Continue)
                }
                OpCode::GetGlobal => self.op_get_global(),
                OpCode::DefineGlobal => self.op_define_global(),
                OpCode::SetGlobal => self.op_set_global(),
                OpCode::GetUpvalue => self.op_get_upvalue(),
                OpCode::SetUpvalue => self.op_set_upvalue(),
                OpCode::GetProperty => self.op_get_property(),
                OpCode::SetProperty => self.op_set_property(),
                OpCode::GetSuper => self.op_get_super(),
                OpCode::Equal => self.op_equal(),
                OpCode::Greater => self.op_greater(),
                OpCode::Less => self.op_less(),
                OpCode::Add => self.op_add(),
                OpCode::Subtract => self.op_subtract(),
                OpCode::Multiply => self.op_multiply(),
                OpCode::Divide => self.op_divide(),
                OpCode::Modulus => self.op_modulus(),
                OpCode::Not => self.op_not(),
                OpCode::Negate => self.op_negate(),
                OpCode::Print => self.op_print(),
                OpCode::Jump => {
                    let offset = self.read_u16() as usize;
                    self.frame_mut().ip += offset;
                    Ok(Signal::Continue)
                }
                OpCode::JumpIfFalse => {
                    let offset = self.read_u16() as usize;
                    if self.peek(0).is_falsey() {
                        self.frame_mut().ip += offset;
                    }
                    Ok(Signal::Continue)
                }
                OpCode::Loop => {
                    let offset = self.read_u16() as usize;
                    self.frame_mut().ip -= offset;
                    Ok(Signal::Continue)
                }
                OpCode::Call => self.op_call(),
                OpCode::Invoke => self.op_invoke(),
                OpCode::SuperInvoke => self.op_super_invoke(),
                OpCode::Closure => self.op_closure(),
                OpCode::CloseUpvalue => self.op_close_upvalue(),
                OpCode::Return => self.op_return(),
                OpCode::Class => self.op_class(),
                OpCode::Inherit => self.op_inherit(),
                OpCode::Method => self.op_method(),
                OpCode::BuildList => self.op_build_list(),
                OpCode::IndexGet => self.op_index_get(),
                OpCode::IndexSet => self.op_index_set(),
                OpCode::FinishBegin => {
                    self.finish_groups.push(Vec::new());
                    Ok(Signal::Continue)
                }
                OpCode::FinishEnd => self.op_finish_end(),
                OpCode::AsyncBegin => self.op_async_begin(),
                OpCode::AsyncEnd => Ok(Signal::Done),
                OpCode::Future => Err(self.report("Reserved opcode.")),
            };

            match outcome {
                Ok(Signal::Continue) => {}
                Ok(Signal::Done) => return InterpretResult::Ok,
                Err(Interrupt) => return InterpretResult::RuntimeError,
            }
        }
    }

    // -- Structured concurrency --

    fn op_async_begin(&mut self) -> Exec {
        // Fork happens before the operand is consumed: the child resumes
        // just past the two offset bytes, at the first byte of the body.
        let dispatcher = Arc::clone(&self.dispatcher);
        let handle = match dispatcher.async_begin(self) {
            Ok(handle) => handle,
            Err(e) => return Err(self.report(&format!("Failed to spawn task: {e}."))),
        };
        let offset = self.read_u16() as usize;
        self.frame_mut().ip += offset;
        match self.finish_groups.last_mut() {
            Some(group) => {
                group.push(handle);
                Ok(Signal::Continue)
            }
            None => Err(self.report("'async' outside of 'finish' block.")),
        }
    }

    fn op_finish_end(&mut self) -> Exec {
        let group = match self.finish_groups.pop() {
            Some(group) => group,
            None => return Err(self.report("Unbalanced 'finish' block.")),
        };
        let mut failed = false;
        // Join in LIFO order.
        for handle in group.into_iter().rev() {
            match handle.join() {
                Ok(InterpretResult::Ok) => {}
                _ => failed = true,
            }
        }
        if failed {
            // The failing worker already printed its diagnostics and
            // cancelled everyone; just propagate.
            Err(self.fail())
        } else {
            Ok(Signal::Continue)
        }
    }

    /// Structural fork for a child task: the arena clone carries the whole
    /// object graph (handles are indices), so the child sees the parent's
    /// state at spawn time and nothing after.
    pub(crate) fn fork(&self, slot: usize, cancel: Arc<AtomicBool>) -> Vm {
        Vm {
            heap: self.heap.clone(),
            stack: self.stack.clone(),
            frames: self.frames.clone(),
            open_upvalues: self.open_upvalues,
            globals: self.globals.clone(),
            init_string: self.init_string,
            finish_groups: Vec::new(),
            cancel,
            dispatcher: Arc::clone(&self.dispatcher),
            slot,
            out: self.out.clone(),
            disassemble: false,
        }
    }

    pub(crate) fn bump_ip(&mut self, n: usize) {
        self.frame_mut().ip += n;
    }

    /// Pop the value a completed future run left behind, if any.
    pub(crate) fn take_top(&mut self) -> Value {
        self.stack.pop().unwrap_or(Value::Nil)
    }

    // -- Decode helpers --

    #[inline]
    pub(crate) fn frame(&self) -> &CallFrame {
        &self.frames[self.frames.len() - 1]
    }

    #[inline]
    pub(crate) fn frame_mut(&mut self) -> &mut CallFrame {
        let last = self.frames.len() - 1;
        &mut self.frames[last]
    }

    #[inline]
    fn read_byte(&mut self) -> u8 {
        let frame = self.frame_mut();
        let byte = frame.chunk.code[frame.ip];
        frame.ip += 1;
        byte
    }

    #[inline]
    fn read_u16(&mut self) -> u16 {
        let frame = self.frame_mut();
        let value = u16::from_be_bytes([frame.chunk.code[frame.ip], frame.chunk.code[frame.ip + 1]]);
        frame.ip += 2;
        value
    }

    #[inline]
    fn read_constant(&mut self) -> Value {
        let index = self.read_byte() as usize;
        self.frame().chunk.constants[index]
    }

    /// Read a name constant: the interned string handle plus its hash.
    pub(crate) fn read_name(&mut self) -> (ObjRef, u32) {
        let value = self.read_constant();
        let name = match value {
            Value::Obj(r) => r,
            _ => unreachable!("name constants are interned strings"),
        };
        let hash = self.heap.string(name).hash;
        (name, hash)
    }

    // -- Stack --

    #[inline]
    pub(crate) fn push(&mut self, value: Value) -> Result<(), Interrupt> {
        if self.stack.len() >= STACK_MAX {
            return Err(self.report("Stack overflow."));
        }
        self.stack.push(value);
        Ok(())
    }

    #[inline]
    pub(crate) fn pop(&mut self) -> Result<Value, Interrupt> {
        match self.stack.pop() {
            Some(value) => Ok(value),
            None => Err(self.report("Stack underflow.")),
        }
    }

    #[inline]
    pub(crate) fn peek(&self, distance: usize) -> Value {
        self.stack[self.stack.len() - 1 - distance]
    }

    #[inline]
    pub(crate) fn drop_top(&mut self, n: usize) {
        let len = self.stack.len();
        self.stack.truncate(len - n);
    }

    pub(crate) fn write_line(&self, line: &str) {
        self.out.write_line(line);
    }

    // -- Errors --

    /// Print a runtime error with a stack trace, cancel outstanding work,
    /// and reset the VM.
    pub(crate) fn report(&mut self, message: &str) -> Interrupt {
        eprintln!("{message}");
        for frame in self.frames.iter().rev() {
            let line = frame
                .chunk
                .lines
                .get(frame.ip.saturating_sub(1))
                .copied()
                .unwrap_or(0);
            let function = self.heap.closure(frame.closure).function;
            match self.heap.function(function).name {
                Some(name) => {
                    eprintln!("[line {}] in {}()", line, self.heap.string(name).to_display())
                }
                None => eprintln!("[line {}] in script", line),
            }
        }
        self.fail()
    }

    /// Quiet failure path: cancel every worker, join stragglers so no task
    /// outlives the error, and reset the stack.
    pub(crate) fn fail(&mut self) -> Interrupt {
        self.dispatcher.terminate_all();
        let groups: Vec<_> = self.finish_groups.drain(..).collect();
        for group in groups.into_iter().rev() {
            for handle in group.into_iter().rev() {
                let _ = handle.join();
            }
        }
        self.reset_stack();
        Interrupt
    }

    fn reset_stack(&mut self) {
        self.stack.clear();
        self.frames.clear();
        self.open_upvalues = None;
    }

    // -- Allocation & GC --

    /// Allocate through the collector: runs a collection first when the
    /// threshold was crossed (or stress mode is on). Values reachable from
    /// the caller must be rooted — on the stack, in globals, or in frames.
    pub(crate) fn alloc(&mut self, body: ObjBody) -> ObjRef {
        if self.heap.should_collect() {
            self.collect_garbage();
        }
        self.heap.alloc(body)
    }

    pub(crate) fn intern(&mut self, bytes: &[u8]) -> ObjRef {
        if self.heap.should_collect() {
            self.collect_garbage();
        }
        self.heap.intern_bytes(bytes)
    }

    pub(crate) fn collect_garbage(&mut self) {
        // Roots: the value stack, every frame's closure, the open-upvalue
        // list, the globals table, and the cached "init" string.
        for i in 0..self.stack.len() {
            let value = self.stack[i];
            self.heap.mark_value(value);
        }
        let closures: Vec<ObjRef> = self.frames.iter().map(|f| f.closure).collect();
        for closure in closures {
            self.heap.mark_object(closure);
        }
        let mut upvalue = self.open_upvalues;
        while let Some(r) = upvalue {
            let next = self.heap.upvalue(r).next;
            self.heap.mark_object(r);
            upvalue = next;
        }
        let globals: Vec<(ObjRef, Value)> = self.globals.iter().collect();
        for (key, value) in globals {
            self.heap.mark_object(key);
            self.heap.mark_value(value);
        }
        self.heap.mark_object(self.init_string);

        self.heap.trace_references();
        self.heap.remove_white_strings();
        self.heap.sweep();
    }

    pub(crate) fn init_string(&self) -> ObjRef {
        self.init_string
    }

    /// Compile `source` and stand up its script frame without running it,
    /// so a future fork has a live frame to resume from.
    #[cfg(test)]
    pub(crate) fn prepare_for_future_test(&mut self, source: &str) {
        let function = compile(source, &mut self.heap).expect("test source compiles");
        self.stack.clear();
        self.frames.clear();
        self.open_upvalues = None;
        let closure = self.heap.alloc(ObjBody::Closure(ClosureObj {
            function,
            upvalues: Vec::new(),
        }));
        self.stack.push(Value::Obj(closure));
        let chunk = self.heap.function(function).chunk.clone();
        self.frames.push(CallFrame {
            closure,
            chunk,
            ip: 0,
            slots: 0,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_with_vm(configure: impl Fn(&mut Vm), source: &str) -> (InterpretResult, String) {
        let dispatcher = Dispatcher::new();
        let (out, buffer) = Output::buffer();
        let mut vm = Vm::with_output(&dispatcher, out);
        configure(&mut vm);
        let result = vm.interpret(source);
        let bytes = buffer.lock().unwrap_or_else(|e| e.into_inner()).clone();
        (result, String::from_utf8_lossy(&bytes).into_owned())
    }

    fn run_source(source: &str) -> (InterpretResult, String) {
        run_with_vm(|_| {}, source)
    }

    fn run_ok(source: &str) -> String {
        let (result, output) = run_source(source);
        assert_eq!(result, InterpretResult::Ok, "output so far: {output}");
        output
    }

    fn run_fails(source: &str) -> String {
        let (result, output) = run_source(source);
        assert_eq!(result, InterpretResult::RuntimeError, "output: {output}");
        output
    }

    // -- Arithmetic and printing --

    #[test]
    fn arithmetic_precedence() {
        assert_eq!(run_ok("print 1 + 2 * 3;"), "7\n");
    }

    #[test]
    fn grouping_and_negation() {
        assert_eq!(run_ok("print -(1 + 2) * 3;"), "-9\n");
    }

    #[test]
    fn string_concatenation() {
        assert_eq!(run_ok("print \"Hello, \" + \"world!\";"), "Hello, world!\n");
    }

    #[test]
    fn modulus_truncates_operands() {
        assert_eq!(run_ok("print 10 % 3;"), "1\n");
        assert_eq!(run_ok("print 10.9 % 3.9;"), "1\n");
        assert_eq!(run_ok("print -7 % 3;"), "-1\n");
    }

    #[test]
    fn modulo_by_zero_is_an_error() {
        run_fails("print 1 % 0;");
    }

    #[test]
    fn char_subtraction_yields_byte_difference() {
        assert_eq!(run_ok("print \"b\" - \"a\";"), "1\n");
        assert_eq!(run_ok("print \"a\" - \"b\";"), "-1\n");
    }

    #[test]
    fn longer_strings_do_not_subtract() {
        run_fails("print \"ab\" - \"a\";");
    }

    #[test]
    fn add_type_error() {
        run_fails("print 1 + \"a\";");
    }

    #[test]
    fn comparison_and_equality() {
        assert_eq!(run_ok("print 1 < 2; print 2 <= 2; print 3 > 4; print 1 == 1.0; print \"a\" == \"a\"; print \"a\" != \"b\";"),
            "true\ntrue\nfalse\ntrue\ntrue\ntrue\n");
    }

    #[test]
    fn truthiness() {
        assert_eq!(
            run_ok("print !nil; print !false; print !0; print !\"\";"),
            "true\ntrue\nfalse\nfalse\n"
        );
    }

    // -- Variables and control flow --

    #[test]
    fn globals_and_locals() {
        assert_eq!(
            run_ok("var a = 1; { var b = a + 1; print b; } print a;"),
            "2\n1\n"
        );
    }

    #[test]
    fn undefined_variable() {
        run_fails("print missing;");
    }

    #[test]
    fn assignment_to_undefined_global() {
        run_fails("missing = 1;");
    }

    #[test]
    fn if_else() {
        assert_eq!(
            run_ok("if (1 < 2) print \"yes\"; else print \"no\";"),
            "yes\n"
        );
        assert_eq!(
            run_ok("if (nil) print \"yes\"; else print \"no\";"),
            "no\n"
        );
    }

    #[test]
    fn short_circuit_and_or() {
        assert_eq!(
            run_ok("print false and missing; print true or missing; print 1 and 2; print nil or 3;"),
            "false\ntrue\n2\n3\n"
        );
    }

    #[test]
    fn while_loop() {
        assert_eq!(
            run_ok("var i = 0; while (i < 3) { print i; i = i + 1; }"),
            "0\n1\n2\n"
        );
    }

    #[test]
    fn for_loop_desugars() {
        assert_eq!(
            run_ok("for (var i = 0; i < 3; i = i + 1) print i;"),
            "0\n1\n2\n"
        );
    }

    #[test]
    fn for_loop_without_initializer() {
        assert_eq!(
            run_ok("var i = 0; for (; i < 2; i = i + 1) print i;"),
            "0\n1\n"
        );
    }

    // -- Functions, closures, upvalues --

    #[test]
    fn function_call_and_return() {
        assert_eq!(run_ok("fun add(a, b) { return a + b; } print add(1, 2);"), "3\n");
    }

    #[test]
    fn implicit_return_is_nil() {
        assert_eq!(run_ok("fun noop() {} print noop();"), "nil\n");
    }

    #[test]
    fn arity_mismatch() {
        run_fails("fun f(a) { return a; } f(1, 2);");
    }

    #[test]
    fn calling_a_number_fails() {
        run_fails("var x = 3; x();");
    }

    #[test]
    fn deep_recursion_overflows() {
        let output = run_fails("fun f() { f(); } f();");
        assert_eq!(output, "");
    }

    #[test]
    fn closure_counter() {
        let source = "
            fun makeCounter() { var n = 0; fun c() { n = n + 1; return n; } return c; }
            var c = makeCounter(); print c(); print c(); print c();";
        assert_eq!(run_ok(source), "1\n2\n3\n");
    }

    #[test]
    fn sibling_closures_share_one_cell() {
        let source = "
            fun make() {
              var x = 0;
              fun get() { return x; }
              fun set(v) { x = v; }
              return [get, set];
            }
            var pair = make();
            pair[1](42);
            print pair[0]();";
        assert_eq!(run_ok(source), "42\n");
    }

    #[test]
    fn upvalue_closes_at_scope_exit() {
        let source = "
            var f;
            { var a = \"captured\"; fun g() { print a; } f = g; }
            f();";
        assert_eq!(run_ok(source), "captured\n");
    }

    #[test]
    fn counters_are_independent() {
        let source = "
            fun makeCounter() { var n = 0; fun c() { n = n + 1; return n; } return c; }
            var a = makeCounter(); var b = makeCounter();
            print a(); print a(); print b();";
        assert_eq!(run_ok(source), "1\n2\n1\n");
    }

    // -- Classes --

    #[test]
    fn class_with_init_and_method() {
        let source = "
            class Box { init(v) { this.v = v; } get() { return this.v; } }
            print Box(42).get();";
        assert_eq!(run_ok(source), "42\n");
    }

    #[test]
    fn fields_default_and_update() {
        let source = "
            class P {}
            var p = P();
            p.x = 1; p.x = p.x + 1;
            print p.x;";
        assert_eq!(run_ok(source), "2\n");
    }

    #[test]
    fn undefined_property() {
        run_fails("class P {} print P().missing;");
    }

    #[test]
    fn property_on_non_instance() {
        run_fails("print (1).x;");
    }

    #[test]
    fn class_arity_without_init() {
        run_fails("class P {} P(1);");
    }

    #[test]
    fn bound_method_remembers_receiver() {
        let source = "
            class Greeter { init(n) { this.n = n; } hi() { print this.n; } }
            var m = Greeter(\"bob\").hi;
            m();";
        assert_eq!(run_ok(source), "bob\n");
    }

    #[test]
    fn fields_shadow_methods_in_invoke() {
        let source = "
            class C { m() { print \"method\"; } }
            var c = C();
            fun f() { print \"field\"; }
            c.m = f;
            c.m();";
        assert_eq!(run_ok(source), "field\n");
    }

    #[test]
    fn inheritance_with_super() {
        let source = "
            class A { greet() { print \"A\"; } }
            class B < A { greet() { super.greet(); print \"B\"; } }
            B().greet();";
        assert_eq!(run_ok(source), "A\nB\n");
    }

    #[test]
    fn inherited_method_dispatches_on_subclass() {
        let source = "
            class A { name() { return \"A\"; } describe() { print this.name(); } }
            class B < A { name() { return \"B\"; } }
            B().describe();";
        assert_eq!(run_ok(source), "B\n");
    }

    #[test]
    fn initializer_chains_through_super() {
        let source = "
            class A { init(v) { this.v = v; } }
            class B < A { init() { super.init(7); } }
            print B().v;";
        assert_eq!(run_ok(source), "7\n");
    }

    #[test]
    fn superclass_must_be_a_class() {
        run_fails("var NotAClass = 1; class B < NotAClass {}");
    }

    #[test]
    fn init_returns_the_instance() {
        let source = "
            class C { init() { this.v = 1; } }
            print C().v;";
        assert_eq!(run_ok(source), "1\n");
    }

    // -- Lists and indexing --

    #[test]
    fn list_literal_and_index() {
        assert_eq!(run_ok("var xs = [10, 20, 30]; print xs[1];"), "20\n");
    }

    #[test]
    fn list_index_assignment() {
        assert_eq!(
            run_ok("var xs = [10, 20, 30]; xs[1] = 99; print xs[1];"),
            "99\n"
        );
    }

    #[test]
    fn list_prints_with_commas() {
        assert_eq!(run_ok("print [1, 2, [3, \"x\"]];"), "[1,2,[3,x]]\n");
    }

    #[test]
    fn list_index_out_of_range() {
        run_fails("var xs = [1]; print xs[1];");
        run_fails("var xs = [1]; print xs[0 - 1];");
    }

    #[test]
    fn list_index_must_be_integer() {
        run_fails("var xs = [1, 2]; print xs[0.5];");
        run_fails("var xs = [1, 2]; print xs[\"0\"];");
    }

    #[test]
    fn string_index_yields_one_character_string() {
        assert_eq!(run_ok("var s = \"abc\"; print s[1];"), "b\n");
    }

    #[test]
    fn string_index_assignment_writes_in_place() {
        assert_eq!(run_ok("var s = \"abc\"; s[0] = \"x\"; print s;"), "xbc\n");
    }

    #[test]
    fn string_index_assignment_requires_single_char() {
        run_fails("var s = \"abc\"; s[0] = \"xy\";");
        run_fails("var s = \"abc\"; s[0] = 1;");
    }

    #[test]
    fn only_lists_and_strings_index() {
        run_fails("var x = 1; print x[0];");
    }

    // -- Natives --

    #[test]
    fn native_len_append_delete() {
        let source = "
            var xs = [1, 2];
            append(xs, 3);
            print len(xs);
            delete(xs, 0);
            print xs;
            print len(\"hello\");";
        assert_eq!(run_ok(source), "3\n[2,3]\n5\n");
    }

    #[test]
    fn native_clock_and_rand_produce_numbers() {
        assert_eq!(run_ok("print clock() > 0;"), "true\n");
        assert_eq!(run_ok("var r = rand(); print r >= 0 and r < 1;"), "true\n");
    }

    #[test]
    fn native_arity_checked() {
        run_fails("len();");
        run_fails("append([1]);");
    }

    #[test]
    fn native_type_errors() {
        run_fails("len(1);");
        run_fails("append(1, 2);");
        run_fails("delete([1], \"x\");");
    }

    // -- GC --

    #[test]
    fn stress_gc_runs_a_real_program() {
        let source = "
            fun makeCounter() { var n = 0; fun c() { n = n + 1; return n; } return c; }
            var c = makeCounter();
            var acc = \"\";
            for (var i = 0; i < 20; i = i + 1) { acc = acc + \"x\"; c(); }
            print len(acc); print c();";
        let (result, output) = run_with_vm(|vm| vm.set_gc_stress(), source);
        assert_eq!(result, InterpretResult::Ok, "{output}");
        assert_eq!(output, "20\n21\n");
    }

    #[test]
    fn stress_gc_keeps_classes_alive() {
        let source = "
            class Node { init(v) { this.v = v; this.next = nil; } }
            var head = Node(0);
            for (var i = 1; i < 10; i = i + 1) {
                var n = Node(i);
                n.next = head;
                head = n;
            }
            print head.v; print head.next.v;";
        let (result, output) = run_with_vm(|vm| vm.set_gc_stress(), source);
        assert_eq!(result, InterpretResult::Ok, "{output}");
        assert_eq!(output, "9\n8\n");
    }

    // -- Structured concurrency --

    #[test]
    fn finish_joins_async_tasks() {
        let source = "
            finish { async { print \"x\"; } async { print \"y\"; } }
            print \"done\";";
        let output = run_ok(source);
        let lines: Vec<&str> = output.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0..2].contains(&"x"));
        assert!(lines[0..2].contains(&"y"));
        assert_eq!(lines[2], "done");
    }

    #[test]
    fn async_sees_state_at_spawn_time() {
        let source = "
            var x = 1;
            finish { async { print x; } }";
        assert_eq!(run_ok(source), "1\n");
    }

    #[test]
    fn child_mutations_are_isolated() {
        let source = "
            var x = 1;
            finish { async { x = 2; } }
            print x;";
        assert_eq!(run_ok(source), "1\n");
    }

    #[test]
    fn nested_finish_blocks() {
        let source = "
            finish {
                async {
                    finish { async { print \"inner\"; } }
                    print \"outer\";
                }
            }
            print \"done\";";
        let output = run_ok(source);
        let lines: Vec<&str> = output.lines().collect();
        assert_eq!(lines, vec!["inner", "outer", "done"]);
    }

    #[test]
    fn many_tasks_all_complete() {
        let source = "
            finish {
                async { print 1; } async { print 1; } async { print 1; }
                async { print 1; } async { print 1; } async { print 1; }
            }
            print \"end\";";
        let output = run_ok(source);
        assert_eq!(output.matches('1').count(), 6);
        assert!(output.ends_with("end\n"));
    }

    #[test]
    fn child_error_cancels_the_program() {
        let source = "
            finish { async { print missing; } }
            print \"after\";";
        let output = run_fails(source);
        assert!(!output.contains("after"));
    }

    #[test]
    fn finish_without_async_is_a_no_op() {
        assert_eq!(run_ok("finish { print \"solo\"; }"), "solo\n");
    }

    #[test]
    fn closures_work_inside_async_bodies() {
        let source = "
            fun makeCounter() { var n = 0; fun c() { n = n + 1; return n; } return c; }
            var c = makeCounter();
            c();
            finish { async { print c(); } }
            print c();";
        // The child owns a copy of the counter state at spawn time.
        assert_eq!(run_ok(source), "2\n2\n");
    }

    // -- REPL-style persistence --

    #[test]
    fn globals_persist_across_interprets() {
        let dispatcher = Dispatcher::new();
        let (out, buffer) = Output::buffer();
        let mut vm = Vm::with_output(&dispatcher, out);
        assert_eq!(vm.interpret("var x = 40;"), InterpretResult::Ok);
        assert_eq!(vm.interpret("print x + 2;"), InterpretResult::Ok);
        let bytes = buffer.lock().unwrap_or_else(|e| e.into_inner()).clone();
        assert_eq!(String::from_utf8_lossy(&bytes), "42\n");
    }

    #[test]
    fn vm_recovers_after_runtime_error() {
        let dispatcher = Dispatcher::new();
        let (out, buffer) = Output::buffer();
        let mut vm = Vm::with_output(&dispatcher, out);
        assert_eq!(vm.interpret("print missing;"), InterpretResult::RuntimeError);
        assert_eq!(vm.interpret("print 1;"), InterpretResult::Ok);
        let bytes = buffer.lock().unwrap_or_else(|e| e.into_inner()).clone();
        assert_eq!(String::from_utf8_lossy(&bytes), "1\n");
    }
}
