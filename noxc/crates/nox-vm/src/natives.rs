//! Built-in callables registered into the globals table at `Runtime`
//! construction, before any source is compiled, so `clock`, `show`,
//! `exit`, `append`, and `delete` resolve exactly like any other
//! global. The call protocol does not check native arity generically
//! (natives just receive whatever slice the call site gathered);
//! `clock`/`append`/`delete` check their own arity and report the
//! same "Expected N arguments but got M." wording used for closures.

use std::time::Instant;

use nox_gc::{ObjKind, ObjList, Runtime, Value};

fn expected_args(name: &str, expected: usize, got: usize) -> String {
    let _ = name;
    format!("Expected {expected} arguments but got {got}.")
}

pub fn clock(_print: &mut dyn FnMut(&str), args: &[Value]) -> Result<Value, String> {
    if !args.is_empty() {
        return Err(expected_args("clock", 0, args.len()));
    }
    Ok(Value::Number(process_start().elapsed().as_secs_f64()))
}

pub fn show(print: &mut dyn FnMut(&str), args: &[Value]) -> Result<Value, String> {
    let rendered: Vec<String> = args.iter().map(|v| v.to_string()).collect();
    print(&format!("show({})\n", rendered.join(", ")));
    Ok(Value::Number(args.len() as f64))
}

pub fn exit(_print: &mut dyn FnMut(&str), args: &[Value]) -> Result<Value, String> {
    if !args.is_empty() {
        return Err(expected_args("exit", 0, args.len()));
    }
    std::process::exit(0);
}

pub fn append(_print: &mut dyn FnMut(&str), args: &[Value]) -> Result<Value, String> {
    if args.len() != 2 {
        return Err(expected_args("append", 2, args.len()));
    }
    let Value::Obj(obj) = args[0] else {
        return Err("append() expects a list as its first argument.".to_string());
    };
    if obj.kind() != ObjKind::List {
        return Err("append() expects a list as its first argument.".to_string());
    }
    let list: nox_gc::GcRef<ObjList> = unsafe { obj.downcast() };
    list.get().items.borrow_mut().push(args[1]);
    Ok(Value::Nil)
}

pub fn delete(_print: &mut dyn FnMut(&str), args: &[Value]) -> Result<Value, String> {
    if args.len() != 2 {
        return Err(expected_args("delete", 2, args.len()));
    }
    let Value::Obj(obj) = args[0] else {
        return Err("delete() expects a list as its first argument.".to_string());
    };
    if obj.kind() != ObjKind::List {
        return Err("delete() expects a list as its first argument.".to_string());
    }
    let Some(index) = args[1].as_number() else {
        return Err("delete() expects a number index as its second argument.".to_string());
    };
    let list: nox_gc::GcRef<ObjList> = unsafe { obj.downcast() };
    let mut items = list.get().items.borrow_mut();
    let index = index as i64;
    if index < 0 || index as usize >= items.len() {
        return Err("List index out of range.".to_string());
    }
    items.remove(index as usize);
    Ok(Value::Nil)
}

fn process_start() -> Instant {
    use std::sync::OnceLock;
    static START: OnceLock<Instant> = OnceLock::new();
    *START.get_or_init(Instant::now)
}

/// Binds every native into `runtime.globals` under its public name.
pub fn install(runtime: &mut Runtime) {
    register(runtime, "clock", clock);
    register(runtime, "show", show);
    register(runtime, "exit", exit);
    register(runtime, "append", append);
    register(runtime, "delete", delete);
}

fn register(runtime: &mut Runtime, name: &'static str, function: nox_gc::object::NativeFn) {
    let interned = runtime.intern_string(name.as_bytes());
    let native = runtime.heap.alloc_native(name, function);
    runtime.globals.set(interned, Value::Obj(native.as_obj_ref()));
}
