//! vm.rs — the stack-based bytecode interpreter.
//!
//! One dispatch loop over `Op`, one value stack, one call-frame stack. The
//! frame stack is a plain `Vec` rather than a fixed array, but `FRAMES_MAX`
//! is still enforced as a hard cap so unbounded recursion fails the same
//! way clox's fixed `frames[FRAMES_MAX]` does: a "Stack overflow." runtime
//! error, not an out-of-memory abort.

use std::time::Instant;

use tracing::{error as log_error, warn};

use crate::chunk::Chunk;
use crate::compiler;
use crate::disasm::disassemble_chunk;
use crate::error::{FrameTrace, RuntimeError, VitteError};
use crate::heap::Heap;
use crate::object::{FunctionKind, NativeFn, Object, ObjHandle, UpvalueLocation};
use crate::table::Table;
use crate::value::{format_value, Value};

pub const FRAMES_MAX: usize = 64;

/// Where `print` and runtime-error text go. The CLI installs a host that
/// writes to real stdout/stderr; tests install one that captures output
/// into a buffer so scenario assertions don't touch process I/O.
pub trait Host: std::any::Any {
    fn print(&mut self, line: &str);
    fn report_error(&mut self, message: &str);
    fn as_any(&self) -> &dyn std::any::Any;
}

/// Writes to the process's actual stdout/stderr, for the REPL and file
/// driver.
#[derive(Default)]
pub struct StdHost;

impl Host for StdHost {
    fn print(&mut self, line: &str) {
        println!("{line}");
    }

    fn report_error(&mut self, message: &str) {
        eprintln!("{message}");
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

/// Captures everything printed, line by line, for tests.
#[derive(Default)]
pub struct BufferHost {
    pub lines: Vec<String>,
    pub errors: Vec<String>,
}

impl Host for BufferHost {
    fn print(&mut self, line: &str) {
        self.lines.push(line.to_string());
    }

    fn report_error(&mut self, message: &str) {
        self.errors.push(message.to_string());
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

/// Construction-time knobs, mirroring the teacher's `VmOptions` builder
/// rather than a long `Vm::new` parameter list.
pub struct VmOptions {
    pub stress_gc: bool,
    pub install_stdlib: bool,
    pub max_frames: usize,
    pub trace_execution: bool,
}

impl Default for VmOptions {
    fn default() -> Self {
        VmOptions { stress_gc: false, install_stdlib: true, max_frames: FRAMES_MAX, trace_execution: false }
    }
}

impl VmOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stress_gc(mut self, yes: bool) -> Self {
        self.stress_gc = yes;
        self
    }

    pub fn install_stdlib(mut self, yes: bool) -> Self {
        self.install_stdlib = yes;
        self
    }

    pub fn max_frames(mut self, n: usize) -> Self {
        self.max_frames = n;
        self
    }

    pub fn trace_execution(mut self, yes: bool) -> Self {
        self.trace_execution = yes;
        self
    }
}

struct CallFrame {
    closure: ObjHandle,
    ip: usize,
    slot_base: usize,
}

/// Successful completion of `Vm::interpret`. Carries nothing today; it
/// exists so a future caller can distinguish "ran, printed nothing" from
/// richer outcomes without breaking the `interpret` signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterpretOutcome;

pub struct Vm {
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    pub globals: Table,
    open_upvalues: Vec<ObjHandle>,
    pub compiler_roots: Vec<ObjHandle>,
    pub heap: Heap,
    init_string: ObjHandle,
    host: Box<dyn Host>,
    max_frames: usize,
    trace_execution: bool,
    started_at: Instant,
}

impl Vm {
    pub fn new(options: VmOptions) -> Self {
        let mut heap = Heap::new();
        heap.stress_gc = options.stress_gc;
        let init_string = heap.intern_string("init");
        let mut vm = Vm {
            stack: Vec::new(),
            frames: Vec::new(),
            globals: Table::new(),
            open_upvalues: Vec::new(),
            compiler_roots: Vec::new(),
            heap,
            init_string,
            host: Box::new(StdHost),
            max_frames: options.max_frames,
            trace_execution: options.trace_execution,
            started_at: Instant::now(),
        };
        if options.install_stdlib {
            vm.install_stdlib();
        }
        vm
    }

    pub fn set_host(&mut self, host: Box<dyn Host>) {
        self.host = host;
    }

    /// Gives back the installed host, so a test can install a `BufferHost`,
    /// run a program, and downcast this to inspect what it captured.
    pub fn host(&self) -> &dyn Host {
        self.host.as_ref()
    }

    pub fn set_stress_gc(&mut self, yes: bool) {
        self.heap.stress_gc = yes;
    }

    // ------------------------------------------------------------
    // allocation helpers — every path that can allocate goes through
    // these so the "collect once bytes_allocated crosses next_gc" policy
    // is enforced in one place (SPEC_FULL.md §4.6).
    // ------------------------------------------------------------

    pub(crate) fn intern(&mut self, s: &str) -> ObjHandle {
        let handle = self.heap.intern_string(s);
        self.root_during_collect(handle)
    }

    pub(crate) fn alloc_function(&mut self, kind: FunctionKind) -> ObjHandle {
        let handle = self.heap.alloc_function(kind);
        self.root_during_collect(handle)
    }

    fn alloc_closure(&mut self, function: ObjHandle, upvalues: Vec<ObjHandle>) -> ObjHandle {
        let handle = self.heap.alloc_closure(function, upvalues);
        self.root_during_collect(handle)
    }

    fn alloc_upvalue(&mut self, stack_slot: usize) -> ObjHandle {
        let handle = self.heap.alloc_upvalue(stack_slot);
        self.root_during_collect(handle)
    }

    fn alloc_class(&mut self, name: ObjHandle) -> ObjHandle {
        let handle = self.heap.alloc_class(name);
        self.root_during_collect(handle)
    }

    fn alloc_instance(&mut self, class: ObjHandle) -> ObjHandle {
        let handle = self.heap.alloc_instance(class);
        self.root_during_collect(handle)
    }

    fn alloc_bound_method(&mut self, receiver: Value, method: ObjHandle) -> ObjHandle {
        let handle = self.heap.alloc_bound_method(receiver, method);
        self.root_during_collect(handle)
    }

    /// A freshly-allocated handle isn't reachable from any root yet — not
    /// the stack, not a frame, not `globals`, not `compiler_roots`. Pushing
    /// it onto the value stack before checking whether this allocation
    /// should trigger a collection, then popping it right after, keeps it
    /// alive through its own potential sweep. Matches clox's push-then-
    /// allocate-then-pop convention (e.g. `copyString` callers push the
    /// result before the next allocation that could collect).
    fn root_during_collect(&mut self, handle: ObjHandle) -> ObjHandle {
        self.stack.push(Value::Obj(handle));
        if self.heap.should_collect() {
            self.collect_garbage();
        }
        self.stack.pop();
        handle
    }

    /// Splits `self` into disjoint field borrows so the gc-roots closure
    /// can see the stack/frames/globals/etc. while `heap` is mutably
    /// borrowed for the collection itself — no `unsafe` needed.
    fn collect_garbage(&mut self) {
        let Vm { heap, stack, frames, open_upvalues, globals, compiler_roots, init_string, .. } =
            self;
        let init_string = *init_string;
        heap.collect_garbage(|h| {
            for v in stack.iter() {
                h.mark_value(*v);
            }
            for f in frames.iter() {
                h.mark_object(f.closure);
            }
            for uv in open_upvalues.iter() {
                h.mark_object(*uv);
            }
            h.mark_table(globals);
            for c in compiler_roots.iter() {
                h.mark_object(*c);
            }
            h.mark_object(init_string);
        });
    }

    // ------------------------------------------------------------
    // native function registration
    // ------------------------------------------------------------

    pub fn define_native(&mut self, name: &str, arity: Option<u8>, func: NativeFn) {
        let handle = self.heap.alloc_native(name, arity, func);
        // `handle` has no root yet; `intern` below can itself allocate and
        // collect, so it has to see `handle` on the stack first.
        self.stack.push(Value::Obj(handle));
        let name_handle = self.intern(name);
        self.stack.pop();
        let hash = match self.heap.get(name_handle) {
            Object::String(s) => s.hash,
            _ => unreachable!("intern always returns a string"),
        };
        self.globals.set(name_handle, hash, Value::Obj(handle));
    }

    fn install_stdlib(&mut self) {
        self.define_native("clock", Some(0), native_clock);
        self.define_native("typeof", Some(1), native_typeof);
    }

    // ------------------------------------------------------------
    // stack helpers
    // ------------------------------------------------------------

    fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    fn pop(&mut self) -> Value {
        self.stack.pop().expect("stack underflow: compiler emitted unbalanced ops")
    }

    fn peek(&self, distance: usize) -> Value {
        self.stack[self.stack.len() - 1 - distance]
    }

    // ------------------------------------------------------------
    // entry point
    // ------------------------------------------------------------

    pub fn interpret(&mut self, source: &str) -> Result<InterpretOutcome, VitteError> {
        let script = match compiler::compile(self, source) {
            Ok(handle) => handle,
            Err(err) => {
                for d in &err.diagnostics {
                    log_error!(line = d.line, "{}", d.message);
                }
                return Err(VitteError::Compile(err));
            }
        };

        if self.trace_execution {
            let name = match self.heap.get(script) {
                Object::Function(f) => match f.name {
                    Some(n) => self.heap.as_string(n).to_string(),
                    None => "script".to_string(),
                },
                _ => unreachable!(),
            };
            let text = match self.heap.get(script) {
                Object::Function(f) => disassemble_chunk(&f.chunk, &self.heap, &name),
                _ => unreachable!(),
            };
            for line in text.lines() {
                self.host.print(line);
            }
        }

        self.stack.clear();
        self.frames.clear();
        self.open_upvalues.clear();

        let closure = self.alloc_closure(script, Vec::new());
        self.push(Value::Obj(closure));
        self.frames.push(CallFrame { closure, ip: 0, slot_base: 0 });

        match self.run() {
            Ok(()) => Ok(InterpretOutcome),
            Err(err) => {
                warn!("{}", err.message);
                Err(VitteError::Runtime(err))
            }
        }
    }

    // ------------------------------------------------------------
    // the dispatch loop
    // ------------------------------------------------------------

    fn run(&mut self) -> Result<(), RuntimeError> {
        loop {
            let op = {
                let frame = self.frames.last().expect("run() always has an active frame");
                let chunk = self.frame_chunk(frame.closure);
                match chunk.code.get(frame.ip) {
                    Some(op) => op.clone(),
                    None => {
                        return Err(self.runtime_error("ran off the end of a chunk without RETURN"))
                    }
                }
            };
            self.frames.last_mut().unwrap().ip += 1;

            use crate::ops::Op;
            match op {
                Op::Constant(idx) => {
                    let v = self.read_constant(idx);
                    self.push(v);
                }
                Op::Nil => self.push(Value::Nil),
                Op::True => self.push(Value::Bool(true)),
                Op::False => self.push(Value::Bool(false)),

                Op::GetLocal(slot) => {
                    let base = self.frames.last().unwrap().slot_base;
                    self.push(self.stack[base + slot as usize]);
                }
                Op::SetLocal(slot) => {
                    let base = self.frames.last().unwrap().slot_base;
                    self.stack[base + slot as usize] = self.peek(0);
                }

                Op::DefineGlobal(idx) => {
                    let name = self.read_string_constant(idx);
                    let hash = self.string_hash(name);
                    let value = self.peek(0);
                    self.globals.set(name, hash, value);
                    self.pop();
                }
                Op::GetGlobal(idx) => {
                    let name = self.read_string_constant(idx);
                    let hash = self.string_hash(name);
                    match self.globals.get(name, hash) {
                        Some(v) => self.push(v),
                        None => {
                            let msg = format!("Undefined variable '{}'.", self.heap.as_string(name));
                            return Err(self.runtime_error(&msg));
                        }
                    }
                }
                Op::SetGlobal(idx) => {
                    let name = self.read_string_constant(idx);
                    let hash = self.string_hash(name);
                    if !self.globals.contains(name, hash) {
                        let msg = format!("Undefined variable '{}'.", self.heap.as_string(name));
                        return Err(self.runtime_error(&msg));
                    }
                    self.globals.set(name, hash, self.peek(0));
                }

                Op::GetUpvalue(slot) => {
                    let closure = self.frames.last().unwrap().closure;
                    let up_handle = self.closure_upvalues(closure)[slot as usize];
                    let value = match self.heap.get(up_handle) {
                        Object::Upvalue(u) => match u.location {
                            UpvalueLocation::Stack(idx) => self.stack[idx],
                            UpvalueLocation::Closed(v) => v,
                        },
                        _ => unreachable!("upvalue slot did not hold an ObjUpvalue"),
                    };
                    self.push(value);
                }
                Op::SetUpvalue(slot) => {
                    let closure = self.frames.last().unwrap().closure;
                    let up_handle = self.closure_upvalues(closure)[slot as usize];
                    let value = self.peek(0);
                    let loc = match self.heap.get(up_handle) {
                        Object::Upvalue(u) => u.location,
                        _ => unreachable!("upvalue slot did not hold an ObjUpvalue"),
                    };
                    match loc {
                        UpvalueLocation::Stack(idx) => self.stack[idx] = value,
                        UpvalueLocation::Closed(_) => {
                            if let Object::Upvalue(u) = self.heap.get_mut(up_handle) {
                                u.location = UpvalueLocation::Closed(value);
                            }
                        }
                    }
                }
                Op::CloseUpvalue => {
                    let top = self.stack.len() - 1;
                    self.close_upvalues(top);
                    self.pop();
                }

                Op::GetProperty(idx) => {
                    let name = self.read_string_constant(idx);
                    let instance_val = self.peek(0);
                    let instance_handle = match instance_val {
                        Value::Obj(h) if matches!(self.heap.get(h), Object::Instance(_)) => h,
                        _ => return Err(self.runtime_error("Only instances have properties.")),
                    };
                    let hash = self.string_hash(name);
                    let field = match self.heap.get(instance_handle) {
                        Object::Instance(inst) => inst.fields.get(name, hash),
                        _ => unreachable!(),
                    };
                    if let Some(v) = field {
                        self.pop();
                        self.push(v);
                    } else {
                        let class_handle = match self.heap.get(instance_handle) {
                            Object::Instance(inst) => inst.class,
                            _ => unreachable!(),
                        };
                        match self.find_method(class_handle, name, hash) {
                            Some(method) => {
                                self.pop();
                                let bound = self.alloc_bound_method(instance_val, method);
                                self.push(Value::Obj(bound));
                            }
                            None => {
                                let msg = format!(
                                    "Undefined property '{}'.",
                                    self.heap.as_string(name)
                                );
                                return Err(self.runtime_error(&msg));
                            }
                        }
                    }
                }
                Op::SetProperty(idx) => {
                    let name = self.read_string_constant(idx);
                    let value = self.peek(0);
                    let instance_val = self.peek(1);
                    let instance_handle = match instance_val {
                        Value::Obj(h) if matches!(self.heap.get(h), Object::Instance(_)) => h,
                        _ => return Err(self.runtime_error("Only instances have fields.")),
                    };
                    let hash = self.string_hash(name);
                    match self.heap.get_mut(instance_handle) {
                        Object::Instance(inst) => {
                            inst.fields.set(name, hash, value);
                        }
                        _ => unreachable!(),
                    }
                    self.pop();
                    self.pop();
                    self.push(value);
                }
                Op::GetSuper(idx) => {
                    let name = self.read_string_constant(idx);
                    let superclass_val = self.pop();
                    let receiver = self.pop();
                    let superclass_handle = superclass_val.as_obj().expect("compiler guarantees a class");
                    let hash = self.string_hash(name);
                    match self.find_method(superclass_handle, name, hash) {
                        Some(method) => {
                            let bound = self.alloc_bound_method(receiver, method);
                            self.push(Value::Obj(bound));
                        }
                        None => {
                            let msg = format!("Undefined property '{}'.", self.heap.as_string(name));
                            return Err(self.runtime_error(&msg));
                        }
                    }
                }

                Op::Equal => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::Bool(a == b));
                }
                Op::Greater => self.binary_compare(|a, b| a > b)?,
                Op::Less => self.binary_compare(|a, b| a < b)?,
                Op::Add => self.add()?,
                Op::Subtract => self.binary_number(|a, b| a - b)?,
                Op::Multiply => self.binary_number(|a, b| a * b)?,
                Op::Divide => self.binary_number(|a, b| a / b)?,
                Op::Not => {
                    let v = self.pop();
                    self.push(Value::Bool(v.is_falsey()));
                }
                Op::Negate => {
                    let v = self.pop();
                    match v.as_number() {
                        Some(n) => self.push(Value::Number(-n)),
                        None => return Err(self.runtime_error("Operand must be a number.")),
                    }
                }

                Op::Pop => {
                    self.pop();
                }
                Op::Print => {
                    let v = self.pop();
                    let text = format_value(&self.heap, v);
                    self.host.print(&text);
                }
                Op::Jump(offset) => {
                    self.frames.last_mut().unwrap().ip += offset as usize;
                }
                Op::JumpIfFalse(offset) => {
                    if self.peek(0).is_falsey() {
                        self.frames.last_mut().unwrap().ip += offset as usize;
                    }
                }
                Op::Loop(offset) => {
                    self.frames.last_mut().unwrap().ip -= offset as usize;
                }

                Op::Call(argc) => {
                    let callee = self.peek(argc as usize);
                    self.call_value(callee, argc as usize)?;
                }
                Op::Invoke(name_idx, argc) => {
                    let name = self.read_string_constant(name_idx);
                    self.invoke(name, argc as usize)?;
                }
                Op::SuperInvoke(name_idx, argc) => {
                    let name = self.read_string_constant(name_idx);
                    let superclass_val = self.pop();
                    let superclass_handle = superclass_val.as_obj().expect("compiler guarantees a class");
                    let hash = self.string_hash(name);
                    let method = self.find_method(superclass_handle, name, hash).ok_or_else(|| {
                        self.runtime_error(&format!(
                            "Undefined property '{}'.",
                            self.heap.as_string(name)
                        ))
                    })?;
                    self.call_closure(method, argc as usize)?;
                }
                Op::Closure(idx, captures) => {
                    let function = self.read_constant(idx).as_obj().expect("CLOSURE operand is a function constant");
                    let mut upvalues = Vec::with_capacity(captures.len());
                    let enclosing_base = self.frames.last().unwrap().slot_base;
                    let enclosing_closure = self.frames.last().unwrap().closure;
                    for cap in &captures {
                        if cap.is_local {
                            upvalues.push(self.capture_upvalue(enclosing_base + cap.index as usize));
                        } else {
                            upvalues.push(self.closure_upvalues(enclosing_closure)[cap.index as usize]);
                        }
                    }
                    let handle = self.alloc_closure(function, upvalues);
                    self.push(Value::Obj(handle));
                }
                Op::Return => {
                    let result = self.pop();
                    let finished = self.frames.pop().expect("RETURN with no active frame");
                    self.close_upvalues(finished.slot_base);
                    if self.frames.is_empty() {
                        self.pop();
                        return Ok(());
                    }
                    self.stack.truncate(finished.slot_base);
                    self.push(result);
                }

                Op::Class(idx) => {
                    let name = self.read_string_constant(idx);
                    let handle = self.alloc_class(name);
                    self.push(Value::Obj(handle));
                }
                Op::Inherit => {
                    let subclass_val = self.peek(0);
                    let superclass_val = self.peek(1);
                    let superclass_handle = match superclass_val {
                        Value::Obj(h) if matches!(self.heap.get(h), Object::Class(_)) => h,
                        _ => return Err(self.runtime_error("Superclass must be a class.")),
                    };
                    let subclass_handle = subclass_val.as_obj().expect("compiler guarantees a class");
                    let entries: Vec<(ObjHandle, u32, Value)> = match self.heap.get(superclass_handle) {
                        Object::Class(c) => {
                            c.methods.iter().map(|(k, v)| (k, self.string_hash(k), v)).collect()
                        }
                        _ => unreachable!(),
                    };
                    if let Object::Class(sub) = self.heap.get_mut(subclass_handle) {
                        for (key, hash, value) in entries {
                            sub.methods.set(key, hash, value);
                        }
                    }
                    self.pop();
                }
                Op::Method(idx) => {
                    let name = self.read_string_constant(idx);
                    let method = self.pop();
                    let method_handle = method.as_obj().expect("method body is a closure");
                    let class_val = self.peek(0);
                    let class_handle = class_val.as_obj().expect("compiler guarantees a class");
                    let hash = self.string_hash(name);
                    if let Object::Class(c) = self.heap.get_mut(class_handle) {
                        c.methods.set(name, hash, Value::Obj(method_handle));
                    }
                }
            }
        }
    }

    // ------------------------------------------------------------
    // calls
    // ------------------------------------------------------------

    fn call_value(&mut self, callee: Value, argc: usize) -> Result<(), RuntimeError> {
        let handle = match callee {
            Value::Obj(h) => h,
            _ => return Err(self.runtime_error("Can only call functions and classes.")),
        };
        match self.heap.get(handle) {
            Object::Closure(_) => self.call_closure(handle, argc),
            Object::Native(_) => self.call_native(handle, argc),
            Object::Class(_) => self.call_class(handle, argc),
            Object::BoundMethod(bm) => {
                let receiver = bm.receiver;
                let method = bm.method;
                let base = self.stack.len() - 1 - argc;
                self.stack[base] = receiver;
                self.call_closure(method, argc)
            }
            _ => Err(self.runtime_error("Can only call functions and classes.")),
        }
    }

    fn call_closure(&mut self, closure_handle: ObjHandle, argc: usize) -> Result<(), RuntimeError> {
        let function_handle = match self.heap.get(closure_handle) {
            Object::Closure(c) => c.function,
            _ => unreachable!("call_closure called on a non-closure handle"),
        };
        let arity = match self.heap.get(function_handle) {
            Object::Function(f) => f.arity,
            _ => unreachable!(),
        };
        if argc != arity as usize {
            return Err(self.runtime_error(&format!(
                "Expected {} arguments but got {}.",
                arity, argc
            )));
        }
        if self.frames.len() >= self.max_frames {
            return Err(self.runtime_error("Stack overflow."));
        }
        let slot_base = self.stack.len() - 1 - argc;
        self.frames.push(CallFrame { closure: closure_handle, ip: 0, slot_base });
        Ok(())
    }

    fn call_native(&mut self, native_handle: ObjHandle, argc: usize) -> Result<(), RuntimeError> {
        let (arity, func) = match self.heap.get(native_handle) {
            Object::Native(n) => (n.arity, n.func),
            _ => unreachable!(),
        };
        if let Some(expected) = arity {
            if argc as u8 != expected {
                return Err(self.runtime_error(&format!(
                    "Expected {expected} arguments but got {argc}."
                )));
            }
        }
        let args_start = self.stack.len() - argc;
        let args: Vec<Value> = self.stack[args_start..].to_vec();
        match func(self, &args) {
            Ok(result) => {
                self.stack.truncate(args_start - 1);
                self.push(result);
                Ok(())
            }
            Err(message) => Err(self.runtime_error(&message)),
        }
    }

    fn call_class(&mut self, class_handle: ObjHandle, argc: usize) -> Result<(), RuntimeError> {
        let instance = self.alloc_instance(class_handle);
        let base = self.stack.len() - 1 - argc;
        self.stack[base] = Value::Obj(instance);
        let init_hash = self.string_hash(self.init_string);
        let initializer = match self.heap.get(class_handle) {
            Object::Class(c) => c.methods.get(self.init_string, init_hash),
            _ => unreachable!(),
        };
        match initializer {
            Some(Value::Obj(init_handle)) => self.call_closure(init_handle, argc),
            Some(_) => unreachable!("class method table holds non-closure value"),
            None => {
                if argc != 0 {
                    return Err(self.runtime_error(&format!(
                        "Expected 0 arguments but got {argc}."
                    )));
                }
                Ok(())
            }
        }
    }

    fn invoke(&mut self, name: ObjHandle, argc: usize) -> Result<(), RuntimeError> {
        let receiver = self.peek(argc);
        let instance_handle = match receiver {
            Value::Obj(h) if matches!(self.heap.get(h), Object::Instance(_)) => h,
            _ => return Err(self.runtime_error("Only instances have methods.")),
        };
        let hash = self.string_hash(name);
        let field = match self.heap.get(instance_handle) {
            Object::Instance(inst) => inst.fields.get(name, hash),
            _ => unreachable!(),
        };
        if let Some(value) = field {
            let base = self.stack.len() - 1 - argc;
            self.stack[base] = value;
            return self.call_value(value, argc);
        }
        let class_handle = match self.heap.get(instance_handle) {
            Object::Instance(inst) => inst.class,
            _ => unreachable!(),
        };
        let method = self.find_method(class_handle, name, hash).ok_or_else(|| {
            self.runtime_error(&format!("Undefined property '{}'.", self.heap.as_string(name)))
        })?;
        self.call_closure(method, argc)
    }

    fn find_method(&self, class_handle: ObjHandle, name: ObjHandle, hash: u32) -> Option<ObjHandle> {
        match self.heap.get(class_handle) {
            Object::Class(c) => c.methods.get(name, hash).and_then(|v| v.as_obj()),
            _ => None,
        }
    }

    // ------------------------------------------------------------
    // upvalues
    // ------------------------------------------------------------

    fn closure_upvalues(&self, closure_handle: ObjHandle) -> &[ObjHandle] {
        match self.heap.get(closure_handle) {
            Object::Closure(c) => &c.upvalues,
            _ => unreachable!("closure_upvalues called on a non-closure handle"),
        }
    }

    /// Reuses an existing open upvalue for `stack_slot` if one is already
    /// tracked, matching clox's `captureUpvalue` dedup — two closures that
    /// capture the same local share one cell, so mutating through either
    /// one is observable by the other.
    fn capture_upvalue(&mut self, stack_slot: usize) -> ObjHandle {
        for &handle in &self.open_upvalues {
            if let Object::Upvalue(u) = self.heap.get(handle) {
                if let UpvalueLocation::Stack(slot) = u.location {
                    if slot == stack_slot {
                        return handle;
                    }
                }
            }
        }
        let handle = self.alloc_upvalue(stack_slot);
        self.open_upvalues.push(handle);
        handle
    }

    /// Closes every open upvalue pointing at or above `from`, copying the
    /// stack value into the upvalue's own cell so it survives the frame
    /// that owned the slot returning.
    fn close_upvalues(&mut self, from: usize) {
        let mut remaining = Vec::with_capacity(self.open_upvalues.len());
        for handle in self.open_upvalues.drain(..) {
            let slot = match self.heap.get(handle) {
                Object::Upvalue(u) => match u.location {
                    UpvalueLocation::Stack(slot) => Some(slot),
                    UpvalueLocation::Closed(_) => None,
                },
                _ => None,
            };
            match slot {
                Some(slot) if slot >= from => {
                    let value = self.stack[slot];
                    if let Object::Upvalue(u) = self.heap.get_mut(handle) {
                        u.location = UpvalueLocation::Closed(value);
                    }
                }
                _ => remaining.push(handle),
            }
        }
        self.open_upvalues = remaining;
    }

    // ------------------------------------------------------------
    // arithmetic
    // ------------------------------------------------------------

    fn add(&mut self) -> Result<(), RuntimeError> {
        let b = self.peek(0);
        let a = self.peek(1);
        if let (Some(x), Some(y)) = (a.as_number(), b.as_number()) {
            self.pop();
            self.pop();
            self.push(Value::Number(x + y));
            return Ok(());
        }
        if let (Some(sa), Some(sb)) = (self.as_str(a), self.as_str(b)) {
            let concatenated = format!("{sa}{sb}");
            self.pop();
            self.pop();
            let handle = self.intern(&concatenated);
            self.push(Value::Obj(handle));
            return Ok(());
        }
        Err(self.runtime_error("Operands must be two numbers or two strings."))
    }

    fn as_str(&self, value: Value) -> Option<String> {
        match value {
            Value::Obj(h) => match self.heap.get(h) {
                Object::String(s) => Some(s.s.to_string()),
                _ => None,
            },
            _ => None,
        }
    }

    fn binary_number(&mut self, f: impl Fn(f64, f64) -> f64) -> Result<(), RuntimeError> {
        let b = self.peek(0).as_number();
        let a = self.peek(1).as_number();
        match (a, b) {
            (Some(x), Some(y)) => {
                self.pop();
                self.pop();
                self.push(Value::Number(f(x, y)));
                Ok(())
            }
            _ => Err(self.runtime_error("Operands must be numbers.")),
        }
    }

    fn binary_compare(&mut self, f: impl Fn(f64, f64) -> bool) -> Result<(), RuntimeError> {
        let b = self.peek(0).as_number();
        let a = self.peek(1).as_number();
        match (a, b) {
            (Some(x), Some(y)) => {
                self.pop();
                self.pop();
                self.push(Value::Bool(f(x, y)));
                Ok(())
            }
            _ => Err(self.runtime_error("Operands must be numbers.")),
        }
    }

    // ------------------------------------------------------------
    // chunk access / constant reads
    // ------------------------------------------------------------

    fn frame_chunk(&self, closure_handle: ObjHandle) -> &Chunk {
        match self.heap.get(closure_handle) {
            Object::Closure(c) => match self.heap.get(c.function) {
                Object::Function(f) => &f.chunk,
                _ => unreachable!(),
            },
            _ => unreachable!(),
        }
    }

    fn read_constant(&self, idx: u8) -> Value {
        let closure = self.frames.last().unwrap().closure;
        self.frame_chunk(closure).constants[idx as usize]
    }

    fn read_string_constant(&self, idx: u8) -> ObjHandle {
        self.read_constant(idx).as_obj().expect("string constant operand is always Value::Obj")
    }

    fn string_hash(&self, handle: ObjHandle) -> u32 {
        match self.heap.get(handle) {
            Object::String(s) => s.hash,
            _ => unreachable!("string_hash called on a non-string handle"),
        }
    }

    // ------------------------------------------------------------
    // error reporting
    // ------------------------------------------------------------

    fn runtime_error(&self, message: &str) -> RuntimeError {
        let mut trace = Vec::with_capacity(self.frames.len());
        for frame in self.frames.iter().rev() {
            let chunk = self.frame_chunk(frame.closure);
            let line = chunk.line_of(frame.ip.saturating_sub(1));
            let function_handle = match self.heap.get(frame.closure) {
                Object::Closure(c) => c.function,
                _ => unreachable!(),
            };
            let function_name = match self.heap.get(function_handle) {
                Object::Function(f) => match f.name {
                    Some(name) => self.heap.as_string(name).to_string(),
                    None => String::new(),
                },
                _ => unreachable!(),
            };
            trace.push(FrameTrace { line, function_name });
        }
        RuntimeError { message: message.to_string(), trace }
    }
}

fn native_clock(vm: &mut Vm, _args: &[Value]) -> Result<Value, String> {
    Ok(Value::Number(vm.started_at.elapsed().as_secs_f64()))
}

fn native_typeof(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    let value = args.first().ok_or("typeof() expects one argument.")?;
    let handle = vm.intern(value.type_name());
    Ok(Value::Obj(handle))
}
