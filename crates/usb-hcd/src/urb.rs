//! Transfer requests and the per-endpoint queues.
//!
//! A request is owned by the driver from submit until its callback runs.
//! Requests for one endpoint are served strictly in submission order; only
//! the head of a queue has descriptors linked into a ring.

use alloc::vec::Vec;

use log::{debug, trace};
use smallbox::space::S4;
use smallbox::{smallbox, SmallBox};
use thunderdome::Index;

use crate::desc::SegId;
use crate::hcd::Hcd;
use crate::regs::{Registers, SubChannel, R_DMA_CH8_SUB_EP};
use crate::sync::spin_until;
use crate::types::{Epid, SetupPacket, UsbPipe, UsbTransfer};
use crate::{Fault, Result, UrbError};

/// Largest packet the controller handles on any endpoint.
pub const MAX_PACKET_SIZE: u16 = 64;

/// Handle returned by submit and accepted by unlink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UrbId(pub(crate) Index);

/// Called once when a request finishes, or once per delivered report for
/// periodic requests.
pub type UrbCallback = SmallBox<dyn FnMut(UrbId, &Urb) + Send, S4>;

pub fn callback<F>(f: F) -> UrbCallback
where
    F: FnMut(UrbId, &Urb) + Send + 'static,
{
    smallbox!(f)
}

/// A transfer request.
///
/// `buffer` is the data to send for OUT transfers and the space to receive
/// into for IN transfers; its length is the requested transfer length.
#[derive(Debug, Clone)]
pub struct Urb {
    pub pipe: UsbPipe,
    pub setup: Option<SetupPacket>,
    pub buffer: Vec<u8>,
    /// Polling interval in frames, interrupt transfers only.
    pub interval: u8,
    pub status: Result<()>,
    pub actual_length: usize,
}

impl Urb {
    fn new(pipe: UsbPipe, setup: Option<SetupPacket>, buffer: Vec<u8>, interval: u8) -> Self {
        Self {
            pipe,
            setup,
            buffer,
            interval,
            status: Ok(()),
            actual_length: 0,
        }
    }

    /// Control transfer. IN requests get a receive buffer of
    /// `setup.length` bytes, OUT requests send `data`.
    pub fn control(pipe: UsbPipe, setup: SetupPacket, data: &[u8]) -> Self {
        let buffer = if setup.is_in() {
            alloc::vec![0; setup.length as usize]
        } else {
            data.to_vec()
        };
        Self::new(pipe, Some(setup), buffer, 0)
    }

    pub fn bulk_in(pipe: UsbPipe, len: usize) -> Self {
        Self::new(pipe, None, alloc::vec![0; len], 0)
    }

    pub fn bulk_out(pipe: UsbPipe, data: &[u8]) -> Self {
        Self::new(pipe, None, data.to_vec(), 0)
    }

    pub fn interrupt_in(pipe: UsbPipe, len: usize, interval: u8) -> Self {
        Self::new(pipe, None, alloc::vec![0; len], interval)
    }

    pub fn interrupt_out(pipe: UsbPipe, data: &[u8], interval: u8) -> Self {
        Self::new(pipe, None, data.to_vec(), interval)
    }

    /// Whether the transfer moves data from device to host.
    pub fn is_in(&self) -> bool {
        match self.setup {
            Some(setup) => setup.is_in(),
            None => self.pipe.is_in(),
        }
    }

    pub(crate) fn expects_in_data(&self) -> bool {
        self.is_in() && !self.buffer.is_empty()
    }

    pub fn data(&self) -> &[u8] {
        &self.buffer[..self.actual_length.min(self.buffer.len())]
    }
}

/// Driver private state of a queued request.
pub(crate) struct UrbEntry {
    pub urb: Urb,
    pub callback: Option<UrbCallback>,
    pub epid: Option<Epid>,
    /// Head of the linked segment chain, control and bulk only.
    pub head: Option<SegId>,
    pub rx_offset: usize,
    pub eot_seen: bool,
    pub overrun: bool,
    /// Interrupt IN packets gathered until end of transfer, never more
    /// than the buffer holds.
    pub pending: Vec<Vec<u8>>,
    /// Frame up to which a periodic OUT has been reported.
    pub intr_frame: u16,
    /// Served by the virtual root hub.
    pub root_hub: bool,
}

impl UrbEntry {
    pub fn new(urb: Urb, callback: UrbCallback, epid: Option<Epid>) -> Self {
        Self {
            urb,
            callback: Some(callback),
            epid,
            head: None,
            rx_offset: 0,
            eot_seen: false,
            overrun: false,
            pending: Vec::new(),
            intr_frame: 0,
            root_hub: false,
        }
    }
}

/// A finished request, or one report of a periodic one, waiting for its
/// callback to be run outside the lock.
pub struct Completion {
    pub id: UrbId,
    pub urb: Urb,
    /// `None` for periodic reports; their callback stays with the request.
    pub callback: Option<UrbCallback>,
}

impl<R: Registers> Hcd<R> {
    /// Queues `urb` and returns its handle. The callback runs exactly once
    /// for non-periodic requests, including when they are unlinked.
    pub fn submit(&mut self, urb: Urb, callback: UrbCallback) -> Result<UrbId> {
        if self.fault.is_some() {
            return Err(UrbError::Shutdown);
        }

        let pipe = urb.pipe;
        if pipe.transfer_type == UsbTransfer::Isochronous {
            return Err(UrbError::Unsupported);
        }
        if pipe.device == self.roothub.address() {
            return self.roothub_submit(urb, callback);
        }
        if pipe.max_packet == 0 || pipe.max_packet > MAX_PACKET_SIZE {
            return Err(UrbError::Invalid);
        }
        if pipe.transfer_type == UsbTransfer::Control && urb.setup.is_none() {
            return Err(UrbError::Invalid);
        }
        if !self.devices.is_allocated(pipe.device) {
            return Err(UrbError::NoDevice);
        }

        let epid = match self.epids.lookup(pipe.device, pipe.endpoint, pipe.speed, pipe.max_packet) {
            Some(epid) => {
                let slot = self.epids.slot(epid);
                if slot.transfer_type != pipe.transfer_type
                    || pipe.transfer_type == UsbTransfer::Interrupt
                {
                    return Err(UrbError::Busy);
                }
                epid
            }
            None => {
                let epid = self.epids.allocate()?;
                self.epids.setup(&mut self.regs, epid, &pipe);
                epid
            }
        };

        let id = UrbId(self.urbs.insert(UrbEntry::new(urb, callback, Some(epid))));
        let queue = &mut self.queues[epid.index()];
        queue.push_back(id);
        trace!("usb: submit {:?} on {} (depth {})", id, epid, queue.len());

        if queue.len() == 1 {
            if let Err(err) = self.start_transfer(epid, id) {
                self.queues[epid.index()].pop_back();
                self.urbs.remove(id.0);
                self.release_epid(epid);
                return Err(err);
            }
        }
        Ok(id)
    }

    /// Removes a queued request and completes it as cancelled.
    pub fn unlink(&mut self, id: UrbId) -> Result<()> {
        let entry = self.urbs.get(id.0).ok_or(UrbError::NotFound)?;
        if entry.root_hub {
            return self.roothub_unlink(id);
        }
        let epid = entry.epid.ok_or(UrbError::NotFound)?;
        let transfer_type = entry.urb.pipe.transfer_type;
        let pos = self.queues[epid.index()]
            .iter()
            .position(|&q| q == id)
            .ok_or(UrbError::NotFound)?;
        debug!("usb: unlink {:?} on {} at {}", id, epid, pos);

        match transfer_type {
            UsbTransfer::Interrupt => {
                self.unschedule_intr(epid);
                self.queues[epid.index()].clear();
                self.release_epid(epid);
            }
            _ if pos == 0 => {
                let sub = if transfer_type == UsbTransfer::Control {
                    SubChannel::Ctrl
                } else {
                    SubChannel::Bulk
                };
                self.ring_mut(sub).disable(epid);

                let limit = self.config.unlink_spin_limit;
                let regs = &mut self.regs;
                let released = spin_until(limit, Fault::UnlinkTimeout(epid), || {
                    regs.read(R_DMA_CH8_SUB_EP(sub)) != epid.raw() as u32
                        && !regs.read_ept(epid.raw()).hold
                });
                if let Err(fault) = released {
                    self.latch(fault);
                    return Err(UrbError::Shutdown);
                }

                // The chain is freed with the entry below.
                self.ring_mut(sub).disarm(epid);
                self.epids.slot_mut(epid).really_active = false;
                self.queues[epid.index()].pop_front();
                self.arm_next(epid);
            }
            _ => {
                self.queues[epid.index()].remove(pos);
            }
        }

        if let Some(mut entry) = self.urbs.remove(id.0) {
            if let Some(head) = entry.head.take() {
                self.segs.release_chain(head);
            }
            self.push_final(id, entry, Err(UrbError::Cancelled), 0);
        }
        Ok(())
    }

    /// Starts the next queued request on `epid`, or frees the row when the
    /// queue is empty. Requests that cannot be started are failed.
    pub(crate) fn arm_next(&mut self, epid: Epid) {
        while let Some(&next) = self.queues[epid.index()].front() {
            match self.start_transfer(epid, next) {
                Ok(()) => return,
                Err(err) => {
                    self.queues[epid.index()].pop_front();
                    if let Some(entry) = self.urbs.remove(next.0) {
                        self.push_final(next, entry, Err(err), 0);
                    }
                }
            }
        }
        self.release_epid(epid);
    }

    pub(crate) fn release_epid(&mut self, epid: Epid) {
        if !self.queues[epid.index()].is_empty() {
            return;
        }
        let limit = self.config.hold_spin_limit;
        if let Err(fault) = self.epids.free(&mut self.regs, epid, limit) {
            self.latch(fault);
        }
    }

    pub(crate) fn push_final(&mut self, id: UrbId, mut entry: UrbEntry, status: Result<()>, actual: usize) {
        entry.urb.status = status;
        entry.urb.actual_length = actual;
        trace!("usb: complete {:?} {:?} ({} bytes)", id, status, actual);
        match entry.callback.take() {
            Some(callback) => self.done.push(Completion {
                id,
                urb: entry.urb,
                callback: Some(callback),
            }),
            // The periodic callback is running right now; it gets this
            // result once it hands the closure back.
            None => self.parked.push((id, entry.urb)),
        }
    }

    /// Reports one round of a periodic request that stays queued.
    pub(crate) fn push_periodic(&mut self, id: UrbId, status: Result<()>, actual: usize) {
        let Some(entry) = self.urbs.get_mut(id.0) else {
            return;
        };
        entry.urb.status = status;
        entry.urb.actual_length = actual;
        self.done.push(Completion {
            id,
            urb: entry.urb.clone(),
            callback: None,
        });
    }

    pub(crate) fn take_callback(&mut self, id: UrbId) -> Option<UrbCallback> {
        self.urbs.get_mut(id.0)?.callback.take()
    }

    /// Puts a periodic callback back after it ran. If the request finished
    /// meanwhile, returns the callback with the final result it still has
    /// to be called with.
    pub(crate) fn restore_callback(&mut self, id: UrbId, callback: UrbCallback) -> Option<(UrbCallback, Urb)> {
        if let Some(entry) = self.urbs.get_mut(id.0) {
            entry.callback.get_or_insert(callback);
            return None;
        }
        let pos = self.parked.iter().position(|(parked, _)| *parked == id)?;
        let (_, urb) = self.parked.swap_remove(pos);
        Some((callback, urb))
    }

    pub fn take_completions(&mut self) -> Vec<Completion> {
        core::mem::take(&mut self.done)
    }

    /// Number of requests queued on the row serving this endpoint.
    pub fn queue_depth(&self, epid: Epid) -> usize {
        self.queues[epid.index()].len()
    }
}
