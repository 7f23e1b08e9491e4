//! The interface the rest of the system talks to.
//!
//! `UsbHost` puts the controller context behind an interrupt-safe spin lock
//! and splits interrupt handling into a top half, which only snapshots
//! registers, and a bottom half the platform runs from deferred context.
//! Completion callbacks always run with the lock released so they may
//! submit again.

use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};

use log::warn;

use crate::dispatch::IrqSnapshot;
use crate::hcd::{Hcd, HcdConfig};
use crate::regs::Registers;
use crate::ringbuffer::SpscQueue;
use crate::sync::{IrqControl, IrqSpinLock, IrqSpinLockGuard, NoIrq};
use crate::urb::{Completion, Urb, UrbCallback, UrbId};
use crate::{Fault, Result};

/// Snapshots the top half can queue before the bottom half runs.
pub const DEFERRED_DEPTH: usize = 64;

pub struct UsbHost<R: Registers, I: IrqControl = NoIrq> {
    hcd: IrqSpinLock<Hcd<R>, I>,
    deferred: SpscQueue<DEFERRED_DEPTH, IrqSnapshot>,
    bottom_half_running: AtomicBool,
}

impl<R: Registers, I: IrqControl> UsbHost<R, I> {
    pub fn new(hcd: Hcd<R>) -> Self {
        Self {
            hcd: IrqSpinLock::new(hcd),
            deferred: SpscQueue::new(),
            bottom_half_running: AtomicBool::new(false),
        }
    }

    pub fn attach(regs: R, config: HcdConfig) -> Result<Self, Fault> {
        Ok(Self::new(Hcd::attach(regs, config)?))
    }

    pub fn lock(&self) -> IrqSpinLockGuard<'_, Hcd<R>, I> {
        self.hcd.lock()
    }

    pub fn alloc_device(&self, device: u8) -> Result<()> {
        self.hcd.lock().alloc_device(device)
    }

    pub fn free_device(&self, device: u8) -> Result<()> {
        self.hcd.lock().free_device(device)
    }

    pub fn frame_number(&self) -> u16 {
        self.hcd.lock().frame_number()
    }

    pub fn fault(&self) -> Option<Fault> {
        self.hcd.lock().fault()
    }

    pub fn submit(&self, urb: Urb, callback: UrbCallback) -> Result<UrbId> {
        let (res, done) = {
            let mut hcd = self.hcd.lock();
            let res = hcd.submit(urb, callback);
            (res, hcd.take_completions())
        };
        self.deliver(done);
        res
    }

    /// Cancels `id`. Its callback has run with `Cancelled` by the time
    /// this returns, unless this is called from that same callback; then
    /// the cancellation is delivered as soon as the callback returns.
    pub fn unlink(&self, id: UrbId) -> Result<()> {
        let (res, done) = {
            let mut hcd = self.hcd.lock();
            let res = hcd.unlink(id);
            (res, hcd.take_completions())
        };
        self.deliver(done);
        res
    }

    /// Controller interrupt. Returns whether the bottom half has work.
    pub fn interrupt(&self) -> bool {
        let mut hcd = self.hcd.lock();
        let Some(snap) = hcd.top_half() else {
            return false;
        };
        // The lock makes this the only sender.
        if let Err(snap) = unsafe { self.deferred.try_send(snap) } {
            warn!("usb: deferred queue full, folding attention {:#x}", snap.attn);
            hcd.stash_attention(snap.attn);
        }
        true
    }

    /// Receive DMA interrupt. Returns whether the bottom half has work.
    pub fn rx_interrupt(&self) -> bool {
        let mut hcd = self.hcd.lock();
        hcd.rx_interrupt();
        !hcd.done.is_empty()
    }

    /// Bottom half. Drains queued snapshots, then runs every pending
    /// callback. Returns the fault that stopped the controller, if one did.
    pub fn run_deferred(&self) -> Result<(), Fault> {
        if self.bottom_half_running.swap(true, Ordering::Acquire) {
            return Ok(());
        }

        let mut res = Ok(());
        loop {
            // `bottom_half_running` makes this the only receiver.
            let snap = unsafe { self.deferred.try_recv() };
            let done = {
                let mut hcd = self.hcd.lock();
                // A snapshot-less pass still picks up attention folded in
                // by an overflowing top half.
                let snap = snap.unwrap_or_default();
                if let Err(fault) = hcd.bottom_half(&snap) {
                    res = Err(fault);
                }
                hcd.take_completions()
            };
            self.deliver(done);
            if snap.is_none() || res.is_err() {
                break;
            }
        }

        self.bottom_half_running.store(false, Ordering::Release);
        res
    }

    /// Root hub status timer. Returns the delay in milliseconds before it
    /// should fire again.
    pub fn poll_root_hub(&self) -> u32 {
        let (interval, done) = {
            let mut hcd = self.hcd.lock();
            let interval = hcd.poll_root_hub();
            (interval, hcd.take_completions())
        };
        self.deliver(done);
        interval
    }

    fn deliver(&self, done: Vec<Completion>) {
        for Completion { id, urb, callback } in done {
            match callback {
                Some(mut callback) => (&mut *callback)(id, &urb),
                None => {
                    let Some(mut callback) = self.hcd.lock().take_callback(id) else {
                        continue;
                    };
                    (&mut *callback)(id, &urb);
                    let finished = self.hcd.lock().restore_callback(id, callback);
                    if let Some((mut callback, urb)) = finished {
                        (&mut *callback)(id, &urb);
                    }
                }
            }
        }
    }
}
