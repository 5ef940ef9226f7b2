//! object.rs — heap object variants that live behind an [`ObjHandle`].
//!
//! Every object lives in [`crate::heap::Heap`]'s slot arena; the arena slot
//! index (plus a generation counter, to catch stale handles) stands in for
//! the intrusive "next object in the allocation list" pointer the spec
//! describes, without `unsafe`.

use crate::chunk::Chunk;
use crate::table::Table;
use crate::value::Value;

/// A handle into [`crate::heap::Heap`]'s arena. Cheap to copy, never
/// dereferenced directly — always looked up through `Heap::get`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjHandle {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

impl ObjHandle {
    pub(crate) fn new(index: u32, generation: u32) -> Self {
        ObjHandle { index, generation }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionKind {
    Script,
    Function,
    Method,
    Initializer,
}

pub struct ObjString {
    pub s: Box<str>,
    pub hash: u32,
}

impl ObjString {
    pub fn new(s: &str) -> Self {
        ObjString { s: Box::from(s), hash: fnv1a32(s.as_bytes()) }
    }
}

pub struct ObjFunction {
    pub arity: u8,
    pub upvalue_count: u8,
    pub chunk: Chunk,
    pub name: Option<ObjHandle>,
    pub kind: FunctionKind,
}

impl ObjFunction {
    pub fn new(kind: FunctionKind) -> Self {
        ObjFunction { arity: 0, upvalue_count: 0, chunk: Chunk::new(), name: None, kind }
    }
}

pub type NativeFn = fn(&mut crate::vm::Vm, &[Value]) -> Result<Value, String>;

pub struct ObjNative {
    pub name: Box<str>,
    pub arity: Option<u8>,
    pub func: NativeFn,
}

pub struct ObjClosure {
    pub function: ObjHandle,
    pub upvalues: Vec<ObjHandle>,
}

/// Where an upvalue's cell currently lives: pointing into the VM stack
/// (open) or holding its own copy after the frame that owned the slot
/// returned (closed).
#[derive(Debug, Clone, Copy)]
pub enum UpvalueLocation {
    Stack(usize),
    Closed(Value),
}

pub struct ObjUpvalue {
    pub location: UpvalueLocation,
}

pub struct ObjClass {
    pub name: ObjHandle,
    pub methods: Table,
}

impl ObjClass {
    pub fn new(name: ObjHandle) -> Self {
        ObjClass { name, methods: Table::new() }
    }
}

pub struct ObjInstance {
    pub class: ObjHandle,
    pub fields: Table,
}

impl ObjInstance {
    pub fn new(class: ObjHandle) -> Self {
        ObjInstance { class, fields: Table::new() }
    }
}

pub struct ObjBoundMethod {
    pub receiver: Value,
    pub method: ObjHandle,
}

/// The tagged heap-object payload. The common header (`is_marked`, the
/// allocation-list link) lives in the arena slot, not here — see
/// `heap::Slot`.
pub enum Object {
    String(ObjString),
    Function(ObjFunction),
    Native(ObjNative),
    Closure(ObjClosure),
    Upvalue(ObjUpvalue),
    Class(ObjClass),
    Instance(ObjInstance),
    BoundMethod(ObjBoundMethod),
}

impl Object {
    pub fn type_name(&self) -> &'static str {
        match self {
            Object::String(_) => "string",
            Object::Function(_) => "function",
            Object::Native(_) => "native",
            Object::Closure(_) => "closure",
            Object::Upvalue(_) => "upvalue",
            Object::Class(_) => "class",
            Object::Instance(_) => "instance",
            Object::BoundMethod(_) => "bound method",
        }
    }

    pub fn as_string(&self) -> Option<&ObjString> {
        match self {
            Object::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_closure(&self) -> Option<&ObjClosure> {
        match self {
            Object::Closure(c) => Some(c),
            _ => None,
        }
    }
}

/// FNV-1a over raw bytes, 32-bit, per spec.
pub fn fnv1a32(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c9dc5;
    for &b in bytes {
        hash ^= b as u32;
        hash = hash.wrapping_mul(0x01000193);
    }
    hash
}
