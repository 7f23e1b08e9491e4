//! Host controller driver for the ETRAX 100LX on-chip USB 1.1 controller.
//!
//! Covers endpoint table allocation, the DMA descriptor rings for control,
//! bulk and interrupt transfers, per-endpoint request queues, interrupt
//! driven completion and the virtual two port root hub. Isochronous
//! transfers are not supported.

#![no_std]

extern crate alloc;

#[cfg(test)]
extern crate std;

#[cfg(test)]
mod sim;
#[cfg(test)]
mod tests;

mod builder;
pub mod desc;
pub mod dispatch;
pub mod epid;
pub mod hcd;
pub mod host;
pub mod regs;
pub mod ringbuffer;
pub mod roothub;
pub mod rx;
pub mod sync;
pub mod types;
pub mod urb;

pub use dispatch::IrqSnapshot;
pub use hcd::{Hcd, HcdConfig};
pub use host::UsbHost;
pub use regs::{Mmio, Registers};
pub use sync::{IrqControl, NoIrq};
pub use types::*;
pub use urb::{callback, Urb, UrbCallback, UrbId};
