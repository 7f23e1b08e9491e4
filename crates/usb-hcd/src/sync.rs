//! Locking for state shared between the interrupt handler, the deferred
//! bottom half, and callers submitting requests.
//!
//! None of the driver may sleep, so the only lock is a spin lock that keeps
//! local interrupts disabled while held. How interrupts are masked is left
//! to the platform through [`IrqControl`].

use core::cell::UnsafeCell;
use core::marker::PhantomData;
use core::sync::atomic::{AtomicBool, Ordering};

use crate::{Fault, Result};

/// Masks and restores local interrupts.
pub trait IrqControl {
    type State;

    /// # Safety
    /// The returned state must be passed to [`IrqControl::restore`] on the
    /// same core, in LIFO order with any nested calls.
    unsafe fn disable() -> Self::State;

    /// # Safety
    /// `state` must come from the matching [`IrqControl::disable`].
    unsafe fn restore(state: Self::State);
}

/// For hosted builds without an interrupt controller.
pub struct NoIrq;

impl IrqControl for NoIrq {
    type State = ();

    unsafe fn disable() {}

    unsafe fn restore(_state: ()) {}
}

pub struct IrqSpinLock<T: ?Sized, I: IrqControl> {
    flag: AtomicBool,
    state: UnsafeCell<Option<I::State>>,
    marker: PhantomData<I>,
    value: UnsafeCell<T>,
}

pub struct IrqSpinLockGuard<'a, T: ?Sized, I: IrqControl> {
    lock: &'a IrqSpinLock<T, I>,
    marker: PhantomData<*mut ()>,
}

unsafe impl<T: Send + ?Sized, I: IrqControl> Send for IrqSpinLock<T, I> {}
unsafe impl<T: Send + ?Sized, I: IrqControl> Sync for IrqSpinLock<T, I> {}

impl<T, I: IrqControl> IrqSpinLock<T, I> {
    pub const fn new(value: T) -> Self {
        IrqSpinLock {
            flag: AtomicBool::new(false),
            state: UnsafeCell::new(None),
            marker: PhantomData,
            value: UnsafeCell::new(value),
        }
    }

    pub fn into_inner(self) -> T {
        self.value.into_inner()
    }
}

impl<T: ?Sized, I: IrqControl> IrqSpinLock<T, I> {
    fn try_acquire(&self) -> bool {
        self.flag
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    pub fn lock(&self) -> IrqSpinLockGuard<'_, T, I> {
        let mut state = unsafe { I::disable() };
        while !self.try_acquire() {
            unsafe { I::restore(state) };
            while self.flag.load(Ordering::Relaxed) {
                core::hint::spin_loop();
            }
            state = unsafe { I::disable() };
        }
        unsafe {
            self.state.get().write(Some(state));
        }
        IrqSpinLockGuard {
            lock: self,
            marker: PhantomData,
        }
    }

    fn unlock(&self) {
        let state = unsafe { (*self.state.get()).take() };
        self.flag.store(false, Ordering::Release);
        if let Some(state) = state {
            unsafe { I::restore(state) }
        }
    }
}

impl<T: ?Sized, I: IrqControl> core::ops::Deref for IrqSpinLockGuard<'_, T, I> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.value.get() }
    }
}

impl<T: ?Sized, I: IrqControl> core::ops::DerefMut for IrqSpinLockGuard<'_, T, I> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.value.get() }
    }
}

impl<T: ?Sized, I: IrqControl> Drop for IrqSpinLockGuard<'_, T, I> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}

/// Spins until `done` returns true, at most `limit` polls.
///
/// Used for the few places where the hardware has to let go of a
/// descriptor or table row before software may touch it. Running out of
/// polls means the controller is wedged and is reported as `fault`.
pub fn spin_until(limit: u32, fault: Fault, mut done: impl FnMut() -> bool) -> Result<(), Fault> {
    for _ in 0..limit {
        if done() {
            return Ok(());
        }
        core::hint::spin_loop();
    }
    if done() {
        Ok(())
    } else {
        Err(fault)
    }
}
