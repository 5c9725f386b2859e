//! Low-level allocation: the intrusive object list, byte accounting,
//! and the mark/sweep mechanics. `Heap` never decides *when* to
//! collect — that requires knowing the live roots, which only
//! `Runtime` (and, during compilation, the compiler) can supply. See
//! `Runtime::collect_garbage`.

use std::cell::Cell;
use std::ptr::NonNull;

use crate::chunk::Chunk;
use crate::object::{
    GcBox, GcRef, ObjBoundMethod, ObjClass, ObjClosure, ObjFunction, ObjHeader, ObjInstance,
    ObjKind, ObjList, ObjNative, ObjRef, ObjString, ObjUpvalue, UpvalueState,
};
use crate::table::Table;
use crate::value::Value;

const INITIAL_NEXT_GC: usize = 1024 * 1024;
const DEFAULT_GROWTH_FACTOR: usize = 2;

pub struct Heap {
    objects: Option<NonNull<ObjHeader>>,
    pub bytes_allocated: usize,
    pub next_gc: usize,
    pub stress_gc: bool,
    /// Multiplier applied to `bytes_allocated` after a collection to
    /// pick the next threshold. Configurable (see `noxt`'s config
    /// file) so deployments can trade collection frequency for peak
    /// memory.
    pub growth_factor: usize,
    pub strings: Table,
    gray_stack: Vec<NonNull<ObjHeader>>,
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl Heap {
    pub fn new() -> Self {
        Heap {
            objects: None,
            bytes_allocated: 0,
            next_gc: INITIAL_NEXT_GC,
            stress_gc: false,
            growth_factor: DEFAULT_GROWTH_FACTOR,
            strings: Table::new(),
            gray_stack: Vec::new(),
        }
    }

    pub fn should_collect(&self) -> bool {
        self.stress_gc || self.bytes_allocated > self.next_gc
    }

    fn alloc<T>(&mut self, kind: ObjKind, value: T) -> GcRef<T> {
        let boxed = Box::new(GcBox {
            header: ObjHeader {
                kind,
                marked: Cell::new(false),
                next: Cell::new(self.objects),
            },
            value,
        });
        let ptr = unsafe { NonNull::new_unchecked(Box::into_raw(boxed)) };
        self.objects = Some(ptr.cast::<ObjHeader>());
        self.bytes_allocated += std::mem::size_of::<GcBox<T>>();
        GcRef::from_raw(ptr)
    }

    pub fn alloc_string(&mut self, bytes: Box<[u8]>, hash: u32) -> GcRef<ObjString> {
        self.bytes_allocated += bytes.len();
        self.alloc(ObjKind::String, ObjString { bytes, hash })
    }

    pub fn alloc_function(&mut self) -> GcRef<ObjFunction> {
        self.alloc(ObjKind::Function, ObjFunction::new())
    }

    pub fn alloc_closure(&mut self, function: GcRef<ObjFunction>) -> GcRef<ObjClosure> {
        let upvalue_count = function.get().upvalue_count as usize;
        self.alloc(
            ObjKind::Closure,
            ObjClosure {
                function,
                upvalues: Vec::with_capacity(upvalue_count),
            },
        )
    }

    pub fn alloc_upvalue(&mut self, stack_index: usize) -> GcRef<ObjUpvalue> {
        self.alloc(
            ObjKind::Upvalue,
            ObjUpvalue {
                state: Cell::new(UpvalueState::Open(stack_index)),
                next: Cell::new(None),
            },
        )
    }

    pub fn alloc_class(&mut self, name: GcRef<ObjString>) -> GcRef<ObjClass> {
        self.alloc(
            ObjKind::Class,
            ObjClass {
                name,
                methods: std::cell::RefCell::new(Table::new()),
            },
        )
    }

    pub fn alloc_instance(&mut self, class: GcRef<ObjClass>) -> GcRef<ObjInstance> {
        self.alloc(
            ObjKind::Instance,
            ObjInstance {
                class,
                fields: std::cell::RefCell::new(Table::new()),
            },
        )
    }

    pub fn alloc_bound_method(
        &mut self,
        receiver: Value,
        method: GcRef<ObjClosure>,
    ) -> GcRef<ObjBoundMethod> {
        self.alloc(ObjKind::BoundMethod, ObjBoundMethod { receiver, method })
    }

    pub fn alloc_native(&mut self, name: &'static str, function: crate::object::NativeFn) -> GcRef<ObjNative> {
        self.alloc(ObjKind::Native, ObjNative { name, function })
    }

    pub fn alloc_list(&mut self) -> GcRef<ObjList> {
        self.alloc(
            ObjKind::List,
            ObjList {
                items: std::cell::RefCell::new(Vec::new()),
            },
        )
    }

    pub fn mark_value(&mut self, value: Value) {
        if let Value::Obj(o) = value {
            self.mark_object(o);
        }
    }

    pub fn mark_object(&mut self, obj: ObjRef) {
        let header = obj.header();
        if header.marked.get() {
            return;
        }
        header.marked.set(true);
        self.gray_stack.push(obj.0);
    }

    pub fn mark_table(&mut self, table: &Table) {
        for (key, value) in table.iter() {
            self.mark_object(key.as_obj_ref());
            self.mark_value(value);
        }
    }

    pub fn trace_references(&mut self) {
        while let Some(ptr) = self.gray_stack.pop() {
            self.blacken(ptr);
        }
    }

    fn blacken(&mut self, ptr: NonNull<ObjHeader>) {
        let obj = ObjRef(ptr);
        match obj.kind() {
            ObjKind::String | ObjKind::Native => {}
            ObjKind::Function => {
                let f: GcRef<ObjFunction> = unsafe { obj.downcast() };
                if let Some(name) = f.get().name {
                    self.mark_object(name.as_obj_ref());
                }
                self.mark_chunk_constants(&f.get().chunk);
            }
            ObjKind::Closure => {
                let c: GcRef<ObjClosure> = unsafe { obj.downcast() };
                self.mark_object(c.get().function.as_obj_ref());
                for up in &c.get().upvalues {
                    self.mark_object(up.as_obj_ref());
                }
            }
            ObjKind::Upvalue => {
                let u: GcRef<ObjUpvalue> = unsafe { obj.downcast() };
                if let UpvalueState::Closed(v) = u.get().state.get() {
                    self.mark_value(v);
                }
            }
            ObjKind::Class => {
                let c: GcRef<ObjClass> = unsafe { obj.downcast() };
                self.mark_object(c.get().name.as_obj_ref());
                let methods = c.get().methods.borrow();
                self.mark_table(&methods);
            }
            ObjKind::Instance => {
                let i: GcRef<ObjInstance> = unsafe { obj.downcast() };
                self.mark_object(i.get().class.as_obj_ref());
                let fields = i.get().fields.borrow();
                self.mark_table(&fields);
            }
            ObjKind::BoundMethod => {
                let b: GcRef<ObjBoundMethod> = unsafe { obj.downcast() };
                self.mark_value(b.get().receiver);
                self.mark_object(b.get().method.as_obj_ref());
            }
            ObjKind::List => {
                let l: GcRef<ObjList> = unsafe { obj.downcast() };
                let items = l.get().items.borrow();
                for &v in items.iter() {
                    self.mark_value(v);
                }
            }
        }
    }

    fn mark_chunk_constants(&mut self, chunk: &Chunk) {
        for &v in &chunk.constants {
            self.mark_value(v);
        }
    }

    /// Unlinks and frees every unmarked object, clearing the mark bit
    /// on survivors. Returns `(bytes_freed, survivor_count)`.
    pub fn sweep(&mut self) -> (usize, usize) {
        let mut freed = 0usize;
        let mut survivors = 0usize;
        let mut prev: Option<NonNull<ObjHeader>> = None;
        let mut current = self.objects;
        while let Some(ptr) = current {
            let header = unsafe { ptr.as_ref() };
            let next = header.next.get();
            if header.marked.get() {
                header.marked.set(false);
                survivors += 1;
                prev = Some(ptr);
            } else {
                match prev {
                    Some(p) => unsafe { p.as_ref().next.set(next) },
                    None => self.objects = next,
                }
                freed += self.free_object(ptr);
            }
            current = next;
        }
        (freed, survivors)
    }

    fn free_object(&mut self, ptr: NonNull<ObjHeader>) -> usize {
        let obj = ObjRef(ptr);
        macro_rules! drop_as {
            ($t:ty) => {{
                let size = std::mem::size_of::<GcBox<$t>>();
                let gc: GcRef<$t> = unsafe { obj.downcast() };
                drop(unsafe { Box::from_raw(gc_box_ptr(gc)) });
                size
            }};
        }
        match obj.kind() {
            ObjKind::String => {
                let extra = unsafe { obj.downcast::<ObjString>() }.get().bytes.len();
                let size = std::mem::size_of::<GcBox<ObjString>>();
                let gc: GcRef<ObjString> = unsafe { obj.downcast() };
                drop(unsafe { Box::from_raw(gc_box_ptr(gc)) });
                size + extra
            }
            ObjKind::Function => drop_as!(ObjFunction),
            ObjKind::Closure => drop_as!(ObjClosure),
            ObjKind::Upvalue => drop_as!(ObjUpvalue),
            ObjKind::Class => drop_as!(ObjClass),
            ObjKind::Instance => drop_as!(ObjInstance),
            ObjKind::BoundMethod => drop_as!(ObjBoundMethod),
            ObjKind::Native => drop_as!(ObjNative),
            ObjKind::List => drop_as!(ObjList),
        }
    }
}

fn gc_box_ptr<T>(gc: GcRef<T>) -> *mut GcBox<T> {
    gc.header() as *const ObjHeader as *mut ObjHeader as *mut GcBox<T>
}
