use std::sync::Arc;

use super::chunk::Chunk;
use super::heap::Heap;
use super::natives::NativeError;
use super::table::Table;
use super::value::Value;

// ---------------------------------------------------------------------------
// Handles
// ---------------------------------------------------------------------------

/// Handle into the heap arena. Copying a handle copies a reference, not the
/// object; handle equality is reference identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjRef(pub(crate) u32);

impl ObjRef {
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

// ---------------------------------------------------------------------------
// Heap objects
// ---------------------------------------------------------------------------

/// An arena slot: the GC mark bit plus the object payload.
#[derive(Debug, Clone)]
pub struct Obj {
    pub marked: bool,
    pub body: ObjBody,
}

#[derive(Debug, Clone)]
pub enum ObjBody {
    String(StrObj),
    Function(FnObj),
    Closure(ClosureObj),
    Upvalue(UpvalueObj),
    Class(ClassObj),
    Instance(InstanceObj),
    BoundMethod(BoundMethodObj),
    List(ListObj),
    Native(NativeObj),
    Future(FutureObj),
}

impl ObjBody {
    pub fn kind_name(&self) -> &'static str {
        match self {
            ObjBody::String(_) => "string",
            ObjBody::Function(_) => "function",
            ObjBody::Closure(_) => "closure",
            ObjBody::Upvalue(_) => "upvalue",
            ObjBody::Class(_) => "class",
            ObjBody::Instance(_) => "instance",
            ObjBody::BoundMethod(_) => "bound method",
            ObjBody::List(_) => "list",
            ObjBody::Native(_) => "native",
            ObjBody::Future(_) => "future",
        }
    }
}

/// Interned string. The payload is raw bytes: the language's string
/// semantics are byte-oriented, and index assignment may patch a single
/// byte in place.
#[derive(Debug, Clone)]
pub struct StrObj {
    pub bytes: Vec<u8>,
    pub hash: u32,
}

impl StrObj {
    pub fn to_display(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }
}

/// Compiled function. Immutable once the compiler finishes with it, which is
/// why the chunk can be shared (`Arc`) between a parent VM and its forked
/// children.
#[derive(Debug, Clone)]
pub struct FnObj {
    pub arity: u8,
    pub upvalue_count: usize,
    pub chunk: Arc<Chunk>,
    /// Interned name; `None` for the implicit top-level script function.
    pub name: Option<ObjRef>,
}

#[derive(Debug, Clone)]
pub struct ClosureObj {
    pub function: ObjRef,
    pub upvalues: Vec<ObjRef>,
}

/// A captured variable cell. Open upvalues point at a live stack slot;
/// closing moves the value into the cell. The `next` link threads the VM's
/// open-upvalue list, sorted by descending stack slot.
#[derive(Debug, Clone)]
pub struct UpvalueObj {
    pub state: UpvalueState,
    pub next: Option<ObjRef>,
}

#[derive(Debug, Clone, Copy)]
pub enum UpvalueState {
    Open(usize),
    Closed(Value),
}

#[derive(Debug, Clone)]
pub struct ClassObj {
    pub name: ObjRef,
    pub methods: Table,
}

#[derive(Debug, Clone)]
pub struct InstanceObj {
    pub class: ObjRef,
    pub fields: Table,
}

#[derive(Debug, Clone)]
pub struct BoundMethodObj {
    pub receiver: Value,
    pub method: ObjRef,
}

#[derive(Debug, Clone)]
pub struct ListObj {
    pub items: Vec<Value>,
}

/// Native function ABI: the argument span lives on the calling VM's stack
/// and must not be retained past the call.
pub type NativeFn = fn(&mut Heap, &[Value]) -> Result<Value, NativeError>;

#[derive(Debug, Clone)]
pub struct NativeObj {
    pub name: &'static str,
    pub arity: u8,
    pub function: NativeFn,
}

/// Placeholder for the reserved `future` surface: identifies the worker
/// slot that produced a value, retrieved through the dispatcher.
#[derive(Debug, Clone)]
pub struct FutureObj {
    pub vm_id: usize,
}
