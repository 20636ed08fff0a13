use std::sync::Arc;

use crate::vm::chunk::Chunk;
use crate::vm::object::ObjRef;

// ---------------------------------------------------------------------------
// Call frames
// ---------------------------------------------------------------------------

/// Maximum call depth.
pub const FRAMES_MAX: usize = 64;

/// Value-stack capacity: 256 slots per frame.
pub const STACK_MAX: usize = FRAMES_MAX * 256;

/// One activation record. The chunk is cached out of the closure's function
/// so the dispatch loop never touches the heap to fetch code; it is shared
/// (`Arc`) because functions are immutable after compilation.
#[derive(Clone)]
pub(crate) struct CallFrame {
    pub closure: ObjRef,
    pub chunk: Arc<Chunk>,
    pub ip: usize,
    /// Stack index of slot 0 for this frame (the callee/receiver slot).
    pub slots: usize,
}
