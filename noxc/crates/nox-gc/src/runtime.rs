//! `Runtime` bundles the heap with everything that roots it: the
//! value stack, call frames, globals, open upvalues, and the interned
//! `init` string. Both the compiler and the VM hold one `&mut
//! Runtime`, which is what lets a single `Heap` serve both without
//! `nox-compiler` and `nox-vm` depending on each other.
//!
//! GC triggering is centralized rather than happening inside every
//! allocation (as the byte-counting `reallocate` hook the reference
//! implementation uses would do): callers invoke `maybe_collect` at
//! points where the stack already roots whatever was just produced.
//! `with_temp_root` covers the remaining cases where a value is live
//! only in a local variable across a call that might collect.

use crate::chunk::Chunk;
use crate::heap::Heap;
use crate::object::{GcRef, ObjClosure, ObjString, ObjUpvalue, UpvalueState};
use crate::table::{hash_bytes, Table};
use crate::value::Value;

pub const STACK_MAX: usize = 256 * 64;
pub const FRAMES_MAX: usize = 64;

pub struct CallFrame {
    pub closure: GcRef<ObjClosure>,
    pub ip: usize,
    /// Index into `Runtime::stack` where this frame's slot 0 lives.
    pub base: usize,
}

pub struct Runtime {
    pub heap: Heap,
    pub stack: Vec<Value>,
    pub frames: Vec<CallFrame>,
    pub globals: Table,
    pub open_upvalues: Option<GcRef<ObjUpvalue>>,
    pub init_string: GcRef<ObjString>,
}

impl Runtime {
    pub fn new() -> Self {
        let mut heap = Heap::new();
        let init_string = heap.alloc_string(b"init".to_vec().into_boxed_slice(), hash_bytes(b"init"));
        Runtime {
            heap,
            stack: Vec::with_capacity(STACK_MAX),
            frames: Vec::with_capacity(FRAMES_MAX),
            globals: Table::new(),
            open_upvalues: None,
            init_string,
        }
    }

    pub fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    pub fn pop(&mut self) -> Value {
        self.stack.pop().expect("value stack underflow")
    }

    pub fn peek(&self, distance: usize) -> Value {
        self.stack[self.stack.len() - 1 - distance]
    }

    /// Pushes `root` before running `f`, pops it after: keeps a
    /// value reachable across an allocation that might collect while
    /// the value itself has no other root yet.
    pub fn with_temp_root<R>(&mut self, root: Value, f: impl FnOnce(&mut Self) -> R) -> R {
        self.push(root);
        let result = f(self);
        self.pop();
        result
    }

    pub fn intern_string(&mut self, bytes: &[u8]) -> GcRef<ObjString> {
        let hash = hash_bytes(bytes);
        if let Some(existing) = self.heap.strings.find_string(bytes, hash) {
            return existing;
        }
        let s = self.heap.alloc_string(bytes.to_vec().into_boxed_slice(), hash);
        self.with_temp_root(Value::Obj(s.as_obj_ref()), |rt| {
            rt.heap.strings.set(s, Value::Nil);
        });
        s
    }

    /// Appends `value` to `chunk`'s constant pool. The pool is
    /// reachable through the in-progress function the compiler
    /// already roots, so no extra scoping is needed once it lands
    /// there; the caller should still check the result fits in a
    /// `u8` operand.
    pub fn add_constant(&mut self, chunk: &mut Chunk, value: Value) -> usize {
        self.with_temp_root(value, |_rt| chunk.add_constant(value))
    }

    pub fn capture_upvalue(&mut self, stack_index: usize) -> GcRef<ObjUpvalue> {
        let mut prev: Option<GcRef<ObjUpvalue>> = None;
        let mut current = self.open_upvalues;
        while let Some(up) = current {
            match up.get().state.get() {
                UpvalueState::Open(idx) if idx > stack_index => {
                    prev = Some(up);
                    current = up.get().next.get();
                }
                _ => break,
            }
        }
        if let Some(up) = current {
            if let UpvalueState::Open(idx) = up.get().state.get() {
                if idx == stack_index {
                    return up;
                }
            }
        }
        let created = self.heap.alloc_upvalue(stack_index);
        created.get().next.set(current);
        match prev {
            Some(p) => p.get().next.set(Some(created)),
            None => self.open_upvalues = Some(created),
        }
        created
    }

    /// Closes every open upvalue pointing at or above `from`, copying
    /// the stack value into the upvalue itself.
    pub fn close_upvalues(&mut self, from: usize) {
        while let Some(up) = self.open_upvalues {
            let idx = match up.get().state.get() {
                UpvalueState::Open(idx) => idx,
                UpvalueState::Closed(_) => break,
            };
            if idx < from {
                break;
            }
            let value = self.stack[idx];
            up.get().state.set(UpvalueState::Closed(value));
            self.open_upvalues = up.get().next.get();
        }
    }

    pub fn maybe_collect(&mut self) {
        if self.heap.should_collect() {
            self.collect_garbage(|_| {});
        }
    }

    pub fn maybe_collect_with(&mut self, mark_extra: impl FnOnce(&mut Heap)) {
        if self.heap.should_collect() {
            self.collect_garbage(mark_extra);
        }
    }

    /// Marks every root this `Runtime` knows about, then lets the
    /// caller mark anything else live (e.g. the compiler's
    /// in-progress function chain) before tracing, sweeping, and
    /// rescaling the collection threshold.
    pub fn collect_garbage(&mut self, mark_extra: impl FnOnce(&mut Heap)) {
        let before = self.heap.bytes_allocated;
        for &v in &self.stack {
            self.heap.mark_value(v);
        }
        self.heap.mark_table(&self.globals);
        for frame in &self.frames {
            self.heap.mark_object(frame.closure.as_obj_ref());
        }
        let mut up = self.open_upvalues;
        while let Some(u) = up {
            self.heap.mark_object(u.as_obj_ref());
            up = u.get().next.get();
        }
        self.heap.mark_object(self.init_string.as_obj_ref());
        mark_extra(&mut self.heap);

        self.heap.trace_references();
        self.heap.strings.remove_white();
        let (freed, survivors) = self.heap.sweep();
        self.heap.next_gc = self.heap.bytes_allocated * self.heap.growth_factor;
        tracing::debug!(
            before,
            after = self.heap.bytes_allocated,
            freed,
            survivors,
            next_gc = self.heap.next_gc,
            "gc cycle"
        );
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}
