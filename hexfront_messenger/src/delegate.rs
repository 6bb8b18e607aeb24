// Re-entrancy guard for delegate execution.
//
// At most one delegate method may execute on a given thread at a time;
// nested entry from the same thread is a programming bug and fails loudly.
// The state is thread-local, so concurrent threads (different connections,
// different game instances in one process) each hold their own guard without
// any cross-thread locking.
//
// `enter_delegate_execution()` returns an RAII guard; dropping it returns
// the thread to idle on every exit path, including panics and early returns.

use std::cell::Cell;

use crate::error::MessengerError;

#[derive(Clone, Copy, PartialEq)]
enum ExecutionState {
    Idle,
    Executing,
}

thread_local! {
    static STATE: Cell<ExecutionState> = const { Cell::new(ExecutionState::Idle) };
}

/// Proof that the current thread is inside a delegate execution. Dropping it
/// leaves the execution.
#[derive(Debug)]
pub struct DelegateGuard {
    // Ties the guard to the thread that entered; the thread-local release in
    // drop() must run on that same thread.
    _not_send: std::marker::PhantomData<*const ()>,
}

impl Drop for DelegateGuard {
    fn drop(&mut self) {
        STATE.with(|state| state.set(ExecutionState::Idle));
    }
}

/// Enter delegate execution on the current thread. Fails with
/// `MessengerError::Reentrancy` if this thread is already executing a
/// delegate — e.g. a delegate method synchronously invoking another
/// delegate method.
pub fn enter_delegate_execution() -> Result<DelegateGuard, MessengerError> {
    STATE.with(|state| {
        if state.get() == ExecutionState::Executing {
            return Err(MessengerError::Reentrancy);
        }
        state.set(ExecutionState::Executing);
        Ok(DelegateGuard {
            _not_send: std::marker::PhantomData,
        })
    })
}

/// True if the current thread is inside a delegate execution.
pub fn in_delegate_execution() -> bool {
    STATE.with(|state| state.get() == ExecutionState::Executing)
}
