use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use super::exec::Vm;
use super::value::Value;
use super::InterpretResult;

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------
//
// Owns a fixed pool of VM slots and the thread bookkeeping around them. The
// main VM takes slot 0; every `async` task takes a free slot for the
// lifetime of its worker thread. Slot state and the thread map are guarded
// by separate mutexes; `terminate_all` flips every assigned slot's cancel
// flag, which each VM observes once per dispatch step.

/// Fixed number of VM slots.
pub const POOL_SIZE: usize = 32;

/// Wait between probes when every slot is taken.
const POOL_FULL_BACKOFF: Duration = Duration::from_millis(10);

struct Slot {
    assigned: bool,
    cancel: Arc<AtomicBool>,
    /// Parked result of a completed future run, until retrieved.
    result: Option<Value>,
}

impl Slot {
    fn new() -> Slot {
        Slot {
            assigned: false,
            cancel: Arc::new(AtomicBool::new(false)),
            result: None,
        }
    }
}

pub struct Dispatcher {
    slots: Mutex<Vec<Slot>>,
    threads: Mutex<HashMap<ThreadId, usize>>,
    active: Mutex<Vec<ThreadId>>,
}

impl Dispatcher {
    pub fn new() -> Arc<Dispatcher> {
        let slots = (0..POOL_SIZE).map(|_| Slot::new()).collect();
        Arc::new(Dispatcher {
            slots: Mutex::new(slots),
            threads: Mutex::new(HashMap::new()),
            active: Mutex::new(Vec::new()),
        })
    }

    fn lock_slots(&self) -> std::sync::MutexGuard<'_, Vec<Slot>> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_threads(&self) -> std::sync::MutexGuard<'_, HashMap<ThreadId, usize>> {
        self.threads.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_active(&self) -> std::sync::MutexGuard<'_, Vec<ThreadId>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }

    // -- Slot lifecycle --

    /// Claim a free slot, resetting its cancel flag. None when the pool is
    /// full.
    fn acquire_slot(&self) -> Option<(usize, Arc<AtomicBool>)> {
        let mut slots = self.lock_slots();
        for (index, slot) in slots.iter_mut().enumerate() {
            if !slot.assigned {
                slot.assigned = true;
                slot.cancel = Arc::new(AtomicBool::new(false));
                slot.result = None;
                return Some((index, Arc::clone(&slot.cancel)));
            }
        }
        None
    }

    /// Claim a free slot, spinning until one opens up.
    pub(crate) fn acquire_slot_spin(&self) -> (usize, Arc<AtomicBool>) {
        loop {
            if let Some(claimed) = self.acquire_slot() {
                return claimed;
            }
            thread::sleep(POOL_FULL_BACKOFF);
        }
    }

    pub(crate) fn release_slot(&self, slot: usize) {
        let mut slots = self.lock_slots();
        slots[slot].assigned = false;
    }

    // -- Thread registry --

    pub(crate) fn register_current_thread(&self, slot: usize) {
        let id = thread::current().id();
        self.lock_threads().insert(id, slot);
        self.lock_active().push(id);
    }

    pub(crate) fn unregister_current_thread(&self) {
        let id = thread::current().id();
        self.lock_threads().remove(&id);
        let mut active = self.lock_active();
        if let Some(pos) = active.iter().position(|t| *t == id) {
            active.remove(pos);
        }
    }

    /// The calling thread's slot, if it runs a VM.
    pub fn slot_of_current_thread(&self) -> Option<usize> {
        self.lock_threads().get(&thread::current().id()).copied()
    }

    /// Flip the cancel flag on every assigned slot. Each running VM checks
    /// its flag once per opcode and unwinds with a runtime error.
    pub fn terminate_all(&self) {
        let slots = self.lock_slots();
        for slot in slots.iter() {
            if slot.assigned {
                slot.cancel.store(true, Ordering::Relaxed);
            }
        }
    }

    // -- Task launch --

    /// Claim a slot for the calling thread and fork `parent` into it.
    /// This is the entry point for a thread that already exists and wants
    /// a VM of its own; `async_begin` spawns the thread itself.
    pub fn dispatch_thread(self: &Arc<Self>, parent: &Vm) -> Vm {
        let (slot, cancel) = self.acquire_slot_spin();
        self.register_current_thread(slot);
        parent.fork(slot, cancel)
    }

    /// Fork `parent` into a fresh slot and run the async body on a worker
    /// thread. Called with the parent's ip at the `ASYNC_BEGIN` operand;
    /// the child skips the two offset bytes and lands on the body.
    pub(crate) fn async_begin(
        self: &Arc<Self>,
        parent: &Vm,
    ) -> Result<JoinHandle<InterpretResult>, String> {
        let (slot, cancel) = self.acquire_slot_spin();
        let mut child = parent.fork(slot, cancel);
        child.bump_ip(2);

        let dispatcher = Arc::clone(self);
        thread::Builder::new()
            .name(format!("skein-worker-{slot}"))
            .spawn(move || {
                dispatcher.register_current_thread(slot);
                let result = child.run();
                // On a runtime error the child has already printed its
                // diagnostics and cancelled every sibling.
                dispatcher.unregister_current_thread();
                dispatcher.release_slot(slot);
                result
            })
            .map_err(|e| e.to_string())
    }

    /// Synchronous future run: fork the parent past a call site, run the
    /// child to completion on this thread, and park the result in the
    /// slot. Returns the slot index for later retrieval.
    pub fn launch_future(self: &Arc<Self>, parent: &Vm) -> usize {
        let (slot, cancel) = self.acquire_slot_spin();
        let mut child = parent.fork(slot, cancel);
        child.bump_ip(3);

        let result = child.run();
        if result == InterpretResult::RuntimeError {
            self.terminate_all();
        }
        let value = child.take_top();
        let mut slots = self.lock_slots();
        slots[slot].result = Some(value);
        slot
    }

    /// Retrieve (and clear) a parked future result, releasing the slot.
    pub fn take_result(&self, slot: usize) -> Option<Value> {
        let mut slots = self.lock_slots();
        let value = slots[slot].result.take();
        slots[slot].assigned = false;
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::exec::Output;

    #[test]
    fn slots_are_reused_after_release() {
        let dispatcher = Dispatcher::new();
        let (a, _) = dispatcher.acquire_slot_spin();
        let (b, _) = dispatcher.acquire_slot_spin();
        assert_eq!(a, 0);
        assert_eq!(b, 1);
        dispatcher.release_slot(a);
        let (c, _) = dispatcher.acquire_slot_spin();
        assert_eq!(c, 0);
    }

    #[test]
    fn acquire_resets_cancel_flag() {
        let dispatcher = Dispatcher::new();
        let (slot, cancel) = dispatcher.acquire_slot_spin();
        cancel.store(true, Ordering::Relaxed);
        dispatcher.release_slot(slot);
        let (again, fresh) = dispatcher.acquire_slot_spin();
        assert_eq!(slot, again);
        assert!(!fresh.load(Ordering::Relaxed));
    }

    #[test]
    fn terminate_all_flags_assigned_slots_only() {
        let dispatcher = Dispatcher::new();
        let (a, cancel_a) = dispatcher.acquire_slot_spin();
        let (_b, cancel_b) = dispatcher.acquire_slot_spin();
        dispatcher.release_slot(a);
        dispatcher.terminate_all();
        assert!(!cancel_a.load(Ordering::Relaxed));
        assert!(cancel_b.load(Ordering::Relaxed));
    }

    #[test]
    fn thread_registry_maps_current_thread() {
        let dispatcher = Dispatcher::new();
        assert_eq!(dispatcher.slot_of_current_thread(), None);
        dispatcher.register_current_thread(5);
        assert_eq!(dispatcher.slot_of_current_thread(), Some(5));
        dispatcher.unregister_current_thread();
        assert_eq!(dispatcher.slot_of_current_thread(), None);
    }

    #[test]
    fn dispatch_thread_claims_a_fresh_slot_for_the_caller() {
        let dispatcher = Dispatcher::new();
        let (out, _buffer) = Output::buffer();
        let vm = Vm::with_output(&dispatcher, out);
        std::thread::scope(|scope| {
            scope
                .spawn(|| {
                    let child = dispatcher.dispatch_thread(&vm);
                    assert_ne!(child.slot_index(), vm.slot_index());
                    assert_eq!(
                        dispatcher.slot_of_current_thread(),
                        Some(child.slot_index())
                    );
                    dispatcher.unregister_current_thread();
                    dispatcher.release_slot(child.slot_index());
                })
                .join()
                .expect("worker thread");
        });
    }

    #[test]
    fn launch_future_parks_a_result_slot() {
        let dispatcher = Dispatcher::new();
        let (out, _buffer) = Output::buffer();
        let mut vm = Vm::with_output(&dispatcher, out);
        assert_eq!(vm.slot_index(), 0);
        // A finished script leaves nothing on the stack, so the parked
        // value is nil; the protocol (slot, park, retrieve) is what is
        // under test here. The leading `0;` compiles to exactly the three
        // bytes the future launch skips.
        vm.prepare_for_future_test("0; 1 + 2;");
        let slot = dispatcher.launch_future(&vm);
        assert_ne!(slot, 0);
        let result = dispatcher.take_result(slot);
        assert!(result.is_some());
        // The slot is free again after retrieval.
        let (reused, _) = dispatcher.acquire_slot_spin();
        assert_eq!(reused, slot);
    }
}
