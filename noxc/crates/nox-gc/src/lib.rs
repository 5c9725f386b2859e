//! Heap, value representation, and garbage collector shared by the
//! Nox compiler and virtual machine.

pub mod chunk;
pub mod heap;
pub mod object;
pub mod runtime;
pub mod table;
pub mod value;

pub use chunk::{Chunk, OpCode};
pub use heap::Heap;
pub use object::{
    display_obj, GcRef, ObjBoundMethod, ObjClass, ObjClosure, ObjFunction, ObjInstance, ObjKind,
    ObjList, ObjNative, ObjRef, ObjString, ObjUpvalue, UpvalueState,
};
pub use runtime::{CallFrame, Runtime, FRAMES_MAX, STACK_MAX};
pub use table::Table;
pub use value::Value;
