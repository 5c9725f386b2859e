//! The bytecode interpreter: a stack-based dispatch loop over
//! `OpCode`, call frames with lexical upvalues, and the call protocol
//! shared by closures, bound methods, classes, and natives.

use nox_gc::{
    CallFrame, GcRef, ObjBoundMethod, ObjClass, ObjClosure, ObjFunction, ObjInstance, ObjKind,
    ObjList, ObjString, OpCode, Runtime, Value, FRAMES_MAX,
};

use crate::disassembler;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterpretResult {
    Ok,
    CompileError,
    RuntimeError,
}

/// Runs a freshly compiled top-level function to completion against
/// `runtime`. Natives must already be installed (see
/// [`crate::natives::install`]); the caller owns compilation, so this
/// crate never depends on `nox-compiler` outside of its own tests.
pub fn run(runtime: &mut Runtime, function: GcRef<ObjFunction>, trace: bool) -> InterpretResult {
    runtime.push(Value::Obj(function.as_obj_ref()));
    let closure = runtime.heap.alloc_closure(function);
    runtime.pop();
    runtime.push(Value::Obj(closure.as_obj_ref()));
    runtime.maybe_collect();

    let mut vm = Vm { runtime, trace };
    if !vm.call(closure, 0) {
        return InterpretResult::RuntimeError;
    }
    let result = vm.run_loop();
    tracing::debug!(?result, "interpret finished");
    result
}

struct Vm<'r> {
    runtime: &'r mut Runtime,
    trace: bool,
}

impl<'r> Vm<'r> {
    fn run_loop(&mut self) -> InterpretResult {
        loop {
            let frame_idx = self.runtime.frames.len() - 1;
            let closure = self.runtime.frames[frame_idx].closure;
            let base = self.runtime.frames[frame_idx].base;
            let mut ip = self.runtime.frames[frame_idx].ip;

            if self.trace {
                self.trace_stack();
                let chunk = &closure.get().function.get().chunk;
                let (line, _) = disassembler::disassemble_instruction(chunk, ip);
                eprintln!("{line}");
            }

            let op = OpCode::from_u8(read_byte(&closure, &mut ip));

            macro_rules! binary_number_op {
                ($make:expr, $op:tt) => {{
                    let (Some(b), Some(a)) = (self.runtime.peek(0).as_number(), self.runtime.peek(1).as_number()) else {
                        self.runtime.frames[frame_idx].ip = ip;
                        self.runtime_error("Operands must be numbers.");
                        return InterpretResult::RuntimeError;
                    };
                    self.runtime.pop();
                    self.runtime.pop();
                    self.runtime.push($make(a $op b));
                }};
            }

            match op {
                OpCode::Constant => {
                    let value = read_constant(&closure, &mut ip);
                    self.runtime.push(value);
                }
                OpCode::Nil => self.runtime.push(Value::Nil),
                OpCode::True => self.runtime.push(Value::Bool(true)),
                OpCode::False => self.runtime.push(Value::Bool(false)),
                OpCode::Pop => {
                    self.runtime.pop();
                }
                OpCode::GetLocal => {
                    let slot = read_byte(&closure, &mut ip) as usize;
                    self.runtime.push(self.runtime.stack[base + slot]);
                }
                OpCode::SetLocal => {
                    let slot = read_byte(&closure, &mut ip) as usize;
                    self.runtime.stack[base + slot] = self.runtime.peek(0);
                }
                OpCode::GetGlobal => {
                    let name = read_string(&closure, &mut ip);
                    match self.runtime.globals.get(name) {
                        Some(value) => self.runtime.push(value),
                        None => {
                            self.runtime.frames[frame_idx].ip = ip;
                            self.runtime_error(&format!(
                                "Undefined variable '{}'.",
                                name.get().as_str_lossy()
                            ));
                            return InterpretResult::RuntimeError;
                        }
                    }
                }
                OpCode::DefineGlobal => {
                    let name = read_string(&closure, &mut ip);
                    let value = self.runtime.peek(0);
                    self.runtime.globals.set(name, value);
                    self.runtime.pop();
                }
                OpCode::SetGlobal => {
                    let name = read_string(&closure, &mut ip);
                    let value = self.runtime.peek(0);
                    if self.runtime.globals.set(name, value) {
                        self.runtime.globals.delete(name);
                        self.runtime.frames[frame_idx].ip = ip;
                        self.runtime_error(&format!(
                            "Undefined variable '{}'.",
                            name.get().as_str_lossy()
                        ));
                        return InterpretResult::RuntimeError;
                    }
                }
                OpCode::GetUpvalue => {
                    let slot = read_byte(&closure, &mut ip) as usize;
                    let up = closure.get().upvalues[slot];
                    let value = match up.get().state.get() {
                        nox_gc::UpvalueState::Open(idx) => self.runtime.stack[idx],
                        nox_gc::UpvalueState::Closed(v) => v,
                    };
                    self.runtime.push(value);
                }
                OpCode::SetUpvalue => {
                    let slot = read_byte(&closure, &mut ip) as usize;
                    let up = closure.get().upvalues[slot];
                    let value = self.runtime.peek(0);
                    match up.get().state.get() {
                        nox_gc::UpvalueState::Open(idx) => self.runtime.stack[idx] = value,
                        nox_gc::UpvalueState::Closed(_) => {
                            up.get().state.set(nox_gc::UpvalueState::Closed(value))
                        }
                    }
                }
                OpCode::GetProperty => {
                    let name = read_string(&closure, &mut ip);
                    let receiver = self.runtime.peek(0);
                    let Value::Obj(obj) = receiver else {
                        self.runtime.frames[frame_idx].ip = ip;
                        self.runtime_error("Only instances have properties.");
                        return InterpretResult::RuntimeError;
                    };
                    if obj.kind() != ObjKind::Instance {
                        self.runtime.frames[frame_idx].ip = ip;
                        self.runtime_error("Only instances have properties.");
                        return InterpretResult::RuntimeError;
                    }
                    let instance: GcRef<ObjInstance> = unsafe { obj.downcast() };
                    let field = instance.get().fields.borrow().get(name);
                    if let Some(value) = field {
                        self.runtime.pop();
                        self.runtime.push(value);
                    } else {
                        self.runtime.frames[frame_idx].ip = ip;
                        if !self.bind_method(instance.get().class, name) {
                            return InterpretResult::RuntimeError;
                        }
                    }
                }
                OpCode::SetProperty => {
                    let name = read_string(&closure, &mut ip);
                    let receiver = self.runtime.peek(1);
                    let Value::Obj(obj) = receiver else {
                        self.runtime.frames[frame_idx].ip = ip;
                        self.runtime_error("Only instances have fields.");
                        return InterpretResult::RuntimeError;
                    };
                    if obj.kind() != ObjKind::Instance {
                        self.runtime.frames[frame_idx].ip = ip;
                        self.runtime_error("Only instances have fields.");
                        return InterpretResult::RuntimeError;
                    }
                    let instance: GcRef<ObjInstance> = unsafe { obj.downcast() };
                    let value = self.runtime.peek(0);
                    instance.get().fields.borrow_mut().set(name, value);
                    self.runtime.pop();
                    self.runtime.pop();
                    self.runtime.push(value);
                }
                OpCode::GetSuper => {
                    let name = read_string(&closure, &mut ip);
                    let superclass_value = self.runtime.pop();
                    let Value::Obj(obj) = superclass_value else {
                        unreachable!("compiler only emits GET_SUPER with a class on top")
                    };
                    let superclass: GcRef<ObjClass> = unsafe { obj.downcast() };
                    self.runtime.frames[frame_idx].ip = ip;
                    if !self.bind_method(superclass, name) {
                        return InterpretResult::RuntimeError;
                    }
                }
                OpCode::Equal => {
                    let b = self.runtime.pop();
                    let a = self.runtime.pop();
                    self.runtime.push(Value::Bool(a == b));
                }
                OpCode::Greater => binary_number_op!(Value::Bool, >),
                OpCode::Less => binary_number_op!(Value::Bool, <),
                OpCode::Add => {
                    let (b, a) = (self.runtime.peek(0), self.runtime.peek(1));
                    let both_strings = matches!(
                        (b.obj_kind(), a.obj_kind()),
                        (Some(ObjKind::String), Some(ObjKind::String))
                    );
                    if both_strings {
                        self.concatenate();
                    } else if let (Some(bn), Some(an)) = (b.as_number(), a.as_number()) {
                        self.runtime.pop();
                        self.runtime.pop();
                        self.runtime.push(Value::Number(an + bn));
                    } else {
                        self.runtime.frames[frame_idx].ip = ip;
                        self.runtime_error("Operands must be two numbers or two strings.");
                        return InterpretResult::RuntimeError;
                    }
                }
                OpCode::Subtract => binary_number_op!(Value::Number, -),
                OpCode::Multiply => binary_number_op!(Value::Number, *),
                OpCode::Divide => binary_number_op!(Value::Number, /),
                OpCode::Not => {
                    let v = self.runtime.pop();
                    self.runtime.push(Value::Bool(v.is_falsey()));
                }
                OpCode::Negate => {
                    let Some(n) = self.runtime.peek(0).as_number() else {
                        self.runtime.frames[frame_idx].ip = ip;
                        self.runtime_error("Operand must be a number.");
                        return InterpretResult::RuntimeError;
                    };
                    self.runtime.pop();
                    self.runtime.push(Value::Number(-n));
                }
                OpCode::Print => {
                    let value = self.runtime.pop();
                    println!("{value}");
                }
                OpCode::Jump => {
                    let offset = read_short(&closure, &mut ip);
                    ip += offset as usize;
                }
                OpCode::JumpIfFalse => {
                    let offset = read_short(&closure, &mut ip);
                    if self.runtime.peek(0).is_falsey() {
                        ip += offset as usize;
                    }
                }
                OpCode::Loop => {
                    let offset = read_short(&closure, &mut ip);
                    ip -= offset as usize;
                }
                OpCode::Call => {
                    let arg_count = read_byte(&closure, &mut ip);
                    self.runtime.frames[frame_idx].ip = ip;
                    let callee = self.runtime.peek(arg_count as usize);
                    if !self.call_value(callee, arg_count) {
                        return InterpretResult::RuntimeError;
                    }
                    continue;
                }
                OpCode::Invoke => {
                    let name = read_string(&closure, &mut ip);
                    let arg_count = read_byte(&closure, &mut ip);
                    self.runtime.frames[frame_idx].ip = ip;
                    if !self.invoke(name, arg_count) {
                        return InterpretResult::RuntimeError;
                    }
                    continue;
                }
                OpCode::Closure => {
                    let function_value = read_constant(&closure, &mut ip);
                    let Value::Obj(obj) = function_value else {
                        unreachable!("compiler only emits CLOSURE with a function constant")
                    };
                    let function: GcRef<ObjFunction> = unsafe { obj.downcast() };
                    let new_closure = self.runtime.heap.alloc_closure(function);
                    for _ in 0..function.get().upvalue_count {
                        let is_local = read_byte(&closure, &mut ip);
                        let index = read_byte(&closure, &mut ip) as usize;
                        let up = if is_local != 0 {
                            self.runtime.capture_upvalue(base + index)
                        } else {
                            closure.get().upvalues[index]
                        };
                        new_closure.get_mut_unchecked().upvalues.push(up);
                    }
                    self.runtime.push(Value::Obj(new_closure.as_obj_ref()));
                    self.runtime.maybe_collect();
                }
                OpCode::CloseUpvalue => {
                    let top = self.runtime.stack.len() - 1;
                    self.runtime.close_upvalues(top);
                    self.runtime.pop();
                }
                OpCode::Return => {
                    let result = self.runtime.pop();
                    self.runtime.close_upvalues(base);
                    self.runtime.frames.pop();
                    if self.runtime.frames.is_empty() {
                        self.runtime.pop();
                        return InterpretResult::Ok;
                    }
                    self.runtime.stack.truncate(base);
                    self.runtime.push(result);
                    continue;
                }
                OpCode::Class => {
                    let name = read_string(&closure, &mut ip);
                    let class = self.runtime.heap.alloc_class(name);
                    self.runtime.push(Value::Obj(class.as_obj_ref()));
                    self.runtime.maybe_collect();
                }
                OpCode::Inherit => {
                    let superclass_value = self.runtime.peek(1);
                    let Value::Obj(obj) = superclass_value else {
                        self.runtime.frames[frame_idx].ip = ip;
                        self.runtime_error("Superclass must be a class.");
                        return InterpretResult::RuntimeError;
                    };
                    if obj.kind() != ObjKind::Class {
                        self.runtime.frames[frame_idx].ip = ip;
                        self.runtime_error("Superclass must be a class.");
                        return InterpretResult::RuntimeError;
                    }
                    let superclass: GcRef<ObjClass> = unsafe { obj.downcast() };
                    let Value::Obj(sub_obj) = self.runtime.peek(0) else {
                        unreachable!("compiler only emits INHERIT with a class on top")
                    };
                    let subclass: GcRef<ObjClass> = unsafe { sub_obj.downcast() };
                    let super_methods = superclass.get().methods.borrow();
                    subclass.get().methods.borrow_mut().add_all(&super_methods);
                    drop(super_methods);
                    self.runtime.pop();
                }
                OpCode::Method => {
                    let name = read_string(&closure, &mut ip);
                    self.define_method(name);
                }
                OpCode::BuildList => {
                    let count = read_byte(&closure, &mut ip) as usize;
                    let start = self.runtime.stack.len() - count;
                    let items: Vec<Value> = self.runtime.stack.split_off(start);
                    let list = self.runtime.heap.alloc_list();
                    *list.get().items.borrow_mut() = items;
                    self.runtime.push(Value::Obj(list.as_obj_ref()));
                    self.runtime.maybe_collect();
                }
                OpCode::IndexSubscr => {
                    let index_value = self.runtime.pop();
                    let list_value = self.runtime.pop();
                    let Value::Obj(obj) = list_value else {
                        self.runtime.frames[frame_idx].ip = ip;
                        self.runtime_error("Only lists can be indexed.");
                        return InterpretResult::RuntimeError;
                    };
                    if obj.kind() != ObjKind::List {
                        self.runtime.frames[frame_idx].ip = ip;
                        self.runtime_error("Only lists can be indexed.");
                        return InterpretResult::RuntimeError;
                    }
                    let Some(index) = index_value.as_number() else {
                        self.runtime.frames[frame_idx].ip = ip;
                        self.runtime_error("List index must be a number.");
                        return InterpretResult::RuntimeError;
                    };
                    let list: GcRef<ObjList> = unsafe { obj.downcast() };
                    let items = list.get().items.borrow();
                    let Some(value) = valid_index(index, items.len()).map(|i| items[i]) else {
                        drop(items);
                        self.runtime.frames[frame_idx].ip = ip;
                        self.runtime_error("List index out of range.");
                        return InterpretResult::RuntimeError;
                    };
                    drop(items);
                    self.runtime.push(value);
                }
                OpCode::StoreSubscr => {
                    let item = self.runtime.pop();
                    let index_value = self.runtime.pop();
                    let list_value = self.runtime.pop();
                    let Value::Obj(obj) = list_value else {
                        self.runtime.frames[frame_idx].ip = ip;
                        self.runtime_error("Cannot store into a non-list value.");
                        return InterpretResult::RuntimeError;
                    };
                    if obj.kind() != ObjKind::List {
                        self.runtime.frames[frame_idx].ip = ip;
                        self.runtime_error("Cannot store into a non-list value.");
                        return InterpretResult::RuntimeError;
                    }
                    let Some(index) = index_value.as_number() else {
                        self.runtime.frames[frame_idx].ip = ip;
                        self.runtime_error("List index must be a number.");
                        return InterpretResult::RuntimeError;
                    };
                    let list: GcRef<ObjList> = unsafe { obj.downcast() };
                    let len = list.get().items.borrow().len();
                    let Some(i) = valid_index(index, len) else {
                        self.runtime.frames[frame_idx].ip = ip;
                        self.runtime_error("List index out of range.");
                        return InterpretResult::RuntimeError;
                    };
                    list.get().items.borrow_mut()[i] = item;
                    self.runtime.push(item);
                }
            }

            if self.runtime.frames.len() > frame_idx {
                self.runtime.frames[frame_idx].ip = ip;
            }
        }
    }

    fn trace_stack(&self) {
        let rendered: Vec<String> = self.runtime.stack.iter().map(|v| format!("[ {v} ]")).collect();
        eprintln!("          {}", rendered.join(""));
    }

    fn call(&mut self, closure: GcRef<ObjClosure>, arg_count: u8) -> bool {
        let arity = closure.get().function.get().arity;
        if arg_count != arity {
            self.runtime_error(&format!(
                "Expected {arity} arguments but got {arg_count}."
            ));
            return false;
        }
        if self.runtime.frames.len() == FRAMES_MAX {
            self.runtime_error("Stack overflow.");
            return false;
        }
        let base = self.runtime.stack.len() - arg_count as usize - 1;
        self.runtime.frames.push(CallFrame {
            closure,
            ip: 0,
            base,
        });
        true
    }

    fn call_value(&mut self, callee: Value, arg_count: u8) -> bool {
        let Value::Obj(obj) = callee else {
            self.runtime_error("Can only call functions and classes.");
            return false;
        };
        match obj.kind() {
            ObjKind::BoundMethod => {
                let bound: GcRef<ObjBoundMethod> = unsafe { obj.downcast() };
                let slot = self.runtime.stack.len() - arg_count as usize - 1;
                self.runtime.stack[slot] = bound.get().receiver;
                self.call(bound.get().method, arg_count)
            }
            ObjKind::Class => {
                let class: GcRef<ObjClass> = unsafe { obj.downcast() };
                let instance = self.runtime.heap.alloc_instance(class);
                let slot = self.runtime.stack.len() - arg_count as usize - 1;
                self.runtime.stack[slot] = Value::Obj(instance.as_obj_ref());
                self.runtime.maybe_collect();
                let init_name = self.runtime.init_string;
                let initializer = class.get().methods.borrow().get(init_name);
                if let Some(Value::Obj(init_obj)) = initializer {
                    let init_closure: GcRef<ObjClosure> = unsafe { init_obj.downcast() };
                    self.call(init_closure, arg_count)
                } else if arg_count != 0 {
                    self.runtime_error(&format!("Expected 0 arguments but got {arg_count}."));
                    false
                } else {
                    true
                }
            }
            ObjKind::Closure => {
                let c: GcRef<ObjClosure> = unsafe { obj.downcast() };
                self.call(c, arg_count)
            }
            ObjKind::Native => {
                let native: GcRef<nox_gc::ObjNative> = unsafe { obj.downcast() };
                let start = self.runtime.stack.len() - arg_count as usize;
                let args: Vec<Value> = self.runtime.stack[start..].to_vec();
                let mut sink = |s: &str| print!("{s}");
                let result = (native.get().function)(&mut sink, &args);
                self.runtime.stack.truncate(start - 1);
                match result {
                    Ok(value) => {
                        self.runtime.push(value);
                        true
                    }
                    Err(message) => {
                        self.runtime_error(&message);
                        false
                    }
                }
            }
            _ => {
                self.runtime_error("Can only call functions and classes.");
                false
            }
        }
    }

    fn invoke_from_class(&mut self, class: GcRef<ObjClass>, name: GcRef<ObjString>, arg_count: u8) -> bool {
        match class.get().methods.borrow().get(name) {
            Some(Value::Obj(obj)) => {
                let closure: GcRef<ObjClosure> = unsafe { obj.downcast() };
                self.call(closure, arg_count)
            }
            _ => {
                self.runtime_error(&format!(
                    "Undefined property '{}'.",
                    name.get().as_str_lossy()
                ));
                false
            }
        }
    }

    fn invoke(&mut self, name: GcRef<ObjString>, arg_count: u8) -> bool {
        let receiver = self.runtime.peek(arg_count as usize);
        let Value::Obj(obj) = receiver else {
            self.runtime_error("Only instances have methods.");
            return false;
        };
        if obj.kind() != ObjKind::Instance {
            self.runtime_error("Only instances have methods.");
            return false;
        }
        let instance: GcRef<ObjInstance> = unsafe { obj.downcast() };
        if let Some(value) = instance.get().fields.borrow().get(name) {
            let slot = self.runtime.stack.len() - arg_count as usize - 1;
            self.runtime.stack[slot] = value;
            return self.call_value(value, arg_count);
        }
        self.invoke_from_class(instance.get().class, name, arg_count)
    }

    fn bind_method(&mut self, class: GcRef<ObjClass>, name: GcRef<ObjString>) -> bool {
        match class.get().methods.borrow().get(name) {
            Some(Value::Obj(obj)) => {
                let method: GcRef<ObjClosure> = unsafe { obj.downcast() };
                let receiver = self.runtime.peek(0);
                let bound = self.runtime.heap.alloc_bound_method(receiver, method);
                self.runtime.pop();
                self.runtime.push(Value::Obj(bound.as_obj_ref()));
                self.runtime.maybe_collect();
                true
            }
            _ => {
                self.runtime_error(&format!(
                    "Undefined property '{}'.",
                    name.get().as_str_lossy()
                ));
                false
            }
        }
    }

    fn define_method(&mut self, name: GcRef<ObjString>) {
        let method = self.runtime.peek(0);
        let Value::Obj(class_obj) = self.runtime.peek(1) else {
            unreachable!("compiler only emits METHOD with a class beneath the method value")
        };
        let class: GcRef<ObjClass> = unsafe { class_obj.downcast() };
        class.get().methods.borrow_mut().set(name, method);
        self.runtime.pop();
    }

    fn concatenate(&mut self) {
        let b = self.runtime.peek(0);
        let a = self.runtime.peek(1);
        let (Value::Obj(bo), Value::Obj(ao)) = (b, a) else {
            unreachable!("caller already checked both operands are strings")
        };
        let bs: GcRef<ObjString> = unsafe { bo.downcast() };
        let as_: GcRef<ObjString> = unsafe { ao.downcast() };
        let mut combined = Vec::with_capacity(as_.get().bytes.len() + bs.get().bytes.len());
        combined.extend_from_slice(&as_.get().bytes);
        combined.extend_from_slice(&bs.get().bytes);
        let interned = self.runtime.intern_string(&combined);
        self.runtime.pop();
        self.runtime.pop();
        self.runtime.push(Value::Obj(interned.as_obj_ref()));
        self.runtime.maybe_collect();
    }

    fn runtime_error(&mut self, message: &str) {
        tracing::warn!(message, frames = self.runtime.frames.len(), "runtime error");
        eprintln!("{message}");
        for frame in self.runtime.frames.iter().rev() {
            let function = frame.closure.get().function;
            let instruction = frame.ip.saturating_sub(1);
            let line = function.get().chunk.lines.get(instruction).copied().unwrap_or(0);
            match function.get().name {
                Some(name) => eprintln!("[line {line}] in {}()", name.get().as_str_lossy()),
                None => eprintln!("[line {line}] in script"),
            }
        }
        self.runtime.stack.clear();
        self.runtime.frames.clear();
        self.runtime.open_upvalues = None;
    }
}

fn valid_index(index: f64, len: usize) -> Option<usize> {
    if index < 0.0 {
        return None;
    }
    let i = index as usize;
    if i < len {
        Some(i)
    } else {
        None
    }
}

fn read_byte(closure: &GcRef<ObjClosure>, ip: &mut usize) -> u8 {
    let byte = closure.get().function.get().chunk.code[*ip];
    *ip += 1;
    byte
}

fn read_short(closure: &GcRef<ObjClosure>, ip: &mut usize) -> u16 {
    let hi = read_byte(closure, ip) as u16;
    let lo = read_byte(closure, ip) as u16;
    (hi << 8) | lo
}

fn read_constant(closure: &GcRef<ObjClosure>, ip: &mut usize) -> Value {
    let index = read_byte(closure, ip) as usize;
    closure.get().function.get().chunk.constants[index]
}

fn read_string(closure: &GcRef<ObjClosure>, ip: &mut usize) -> GcRef<ObjString> {
    let Value::Obj(obj) = read_constant(closure, ip) else {
        unreachable!("compiler only emits name operands as string constants")
    };
    debug_assert_eq!(obj.kind(), ObjKind::String);
    unsafe { obj.downcast() }
}
