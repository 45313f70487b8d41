//! Cooperative stack switching on top of boost-context style contexts.
//!
//! A fiber owns a protected stack and (between runs) the suspended context
//! that resumes it. Switching never involves the OS scheduler: the running
//! fiber resumes the target's context, and the target stores the
//! suspender's continuation back into the suspender's slot before doing
//! anything else. That hand-off is what makes `switch` symmetric even
//! though the underlying API is move-based.

use std::cell::UnsafeCell;

use context::stack::ProtectedFixedSizeStack;
use context::{Context, Transfer};

use crate::errors::Result;

use super::manager::Manager;

/// Entry point installed into a pool fiber. A fiber has exactly one entry
/// function for its whole life; per-switch data travels in the transfer
/// payload instead.
pub(crate) type FiberEntry = extern "C" fn(Transfer) -> !;

/// What a suspending fiber hands to the side it resumes. Lives on the
/// suspender's stack, which stays frozen until somebody resumes it, so the
/// pointer is valid for exactly as long as the receiver needs it.
struct SwitchPayload {
    from: *const Fiber,
    manager: *const Manager,
}

pub(crate) struct Fiber {
    stack: Option<ProtectedFixedSizeStack>,
    context: UnsafeCell<Option<Context>>,
}

// Fibers migrate between workers, but only one thread ever touches a given
// fiber at a time; ownership is mediated by the idle bitmap, the waiter
// slots and the stored-flag handshake.
unsafe impl Send for Fiber {}
unsafe impl Sync for Fiber {}

impl Fiber {
    /// Creates a pool fiber backed by `stack_size` bytes of guarded stack.
    /// The context is armed later, once an entry point is installed.
    pub fn with_stack(stack_size: usize) -> Result<Fiber> {
        let stack = ProtectedFixedSizeStack::new(stack_size)
            .map_err(|err| err_format!("failed to allocate fiber stack: {:?}", err))?;

        Ok(Fiber {
            stack: Some(stack),
            context: UnsafeCell::new(None),
        })
    }

    /// The calling OS thread's own execution context, viewed as a fiber so
    /// that switches to and from pool fibers are symmetric. Its context
    /// slot fills in the first time the thread switches away.
    pub fn thread_fiber() -> Fiber {
        Fiber {
            stack: None,
            context: UnsafeCell::new(None),
        }
    }

    /// Installs `entry` and arms a fresh context for it. Re-installing is
    /// allowed as long as the fiber is not currently running; the scheduler
    /// uses that to point one pool fiber at the main callback.
    pub fn set_entry(&self, entry: FiberEntry) {
        let stack = match self.stack {
            Some(ref stack) => stack,
            None => critical!("cannot install an entry point on a thread fiber"),
        };

        unsafe { *self.context.get() = Some(Context::new(stack, entry)) };
    }

    /// Switches execution to this fiber, suspending `from`. Control comes
    /// back when some other fiber switches to `from` again.
    ///
    /// # Safety
    ///
    /// `from` must be the fiber the calling code is actually running on,
    /// and nothing may hold it concurrently. References into the current
    /// worker's TLS must not be kept across this call: the fiber may be
    /// resumed by a different worker thread.
    pub unsafe fn switch(&self, from: &Fiber, manager: *const Manager) {
        let context = match (*self.context.get()).take() {
            Some(context) => context,
            None => critical!("switching to a fiber without a live context"),
        };

        let payload = SwitchPayload {
            from: from as *const Fiber,
            manager,
        };

        let transfer = context.resume(&payload as *const SwitchPayload as usize);
        Fiber::land(transfer);
    }

    /// First thing on the resumed side of any switch (including fiber entry
    /// points): stows the suspender's continuation back into its slot and
    /// hands out the manager it passed along.
    pub unsafe fn land(transfer: Transfer) -> *const Manager {
        let payload = &*(transfer.data as *const SwitchPayload);
        *(*payload.from).context.get() = Some(transfer.context);
        payload.manager
    }
}
