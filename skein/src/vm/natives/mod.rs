mod io;
mod list;
mod random;
mod time;

use super::object::NativeFn;

// ---------------------------------------------------------------------------
// Native function registry
// ---------------------------------------------------------------------------

/// Error from a native function call; surfaces as a runtime error in the
/// calling VM.
#[derive(Debug, Clone)]
pub struct NativeError(pub String);

impl NativeError {
    pub(crate) fn new(message: impl Into<String>) -> NativeError {
        NativeError(message.into())
    }
}

pub(crate) struct NativeDef {
    pub name: &'static str,
    pub arity: u8,
    pub function: NativeFn,
}

/// Every native bound into a fresh VM's globals. Each forked child VM gets
/// its own bindings from this same table.
pub(crate) const REGISTRY: &[NativeDef] = &[
    NativeDef {
        name: "clock",
        arity: 0,
        function: time::clock,
    },
    NativeDef {
        name: "rand",
        arity: 0,
        function: random::rand,
    },
    NativeDef {
        name: "append",
        arity: 2,
        function: list::append,
    },
    NativeDef {
        name: "delete",
        arity: 2,
        function: list::delete,
    },
    NativeDef {
        name: "len",
        arity: 1,
        function: list::len,
    },
    NativeDef {
        name: "string_input",
        arity: 0,
        function: io::string_input,
    },
    NativeDef {
        name: "number_input",
        arity: 0,
        function: io::number_input,
    },
];
