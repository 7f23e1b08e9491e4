//! The receive ring on DMA channel 9.
//!
//! All IN data, whatever the endpoint, lands in one circular list of fixed
//! size buffers. Each filled node carries the row it came from, so the
//! handler walks the ring in order and hands every packet to the request at
//! the head of that row's queue.

use alloc::boxed::Box;
use alloc::vec::Vec;

use bitflags::bitflags;
use log::{trace, warn};

use crate::hcd::Hcd;
use crate::regs::*;
use crate::types::{Epid, UsbTransfer};
use crate::UrbError;

/// Total receive buffer.
pub const RX_BUF_SIZE: usize = 32768;
/// Size of one receive node.
pub const RX_DESC_BUF_SIZE: usize = 64;
pub const NBR_OF_RX_DESC: usize = RX_BUF_SIZE / RX_DESC_BUF_SIZE;

const EPID_SHIFT: u16 = 11;

bitflags! {
    /// Status word the DMA writes back into a receive node.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct RxStatus: u16 {
        /// The node holds a complete packet.
        const EOP = 1 << 0;
        /// Last packet of the transfer.
        const EOT = 1 << 1;
        const NODATA = 1 << 2;
        const ERROR = 1 << 3;
        const EPID = 0x1f << EPID_SHIFT;
    }
}

impl RxStatus {
    pub fn with_epid(epid: Epid) -> Self {
        Self::from_bits_retain((epid.raw() as u16) << EPID_SHIFT)
    }

    pub fn epid(self) -> Epid {
        Epid::new(((self.bits() & Self::EPID.bits()) >> EPID_SHIFT) as usize).unwrap_or(Epid::DUMMY)
    }
}

#[derive(Clone)]
pub struct RxNode {
    pub eol: bool,
    pub hw_len: u16,
    pub status: RxStatus,
    pub buf: [u8; RX_DESC_BUF_SIZE],
}

impl Default for RxNode {
    fn default() -> Self {
        Self {
            eol: false,
            hw_len: 0,
            status: RxStatus::empty(),
            buf: [0; RX_DESC_BUF_SIZE],
        }
    }
}

pub struct RxRing {
    pub(crate) nodes: Box<[RxNode]>,
    /// Oldest node not yet consumed.
    pub(crate) next: usize,
    /// Node carrying the end-of-list marker.
    pub(crate) eol: usize,
}

impl RxRing {
    pub fn new() -> Self {
        let mut nodes: Box<[RxNode]> = (0..NBR_OF_RX_DESC).map(|_| RxNode::default()).collect();
        let eol = NBR_OF_RX_DESC - 1;
        nodes[eol].eol = true;
        Self { nodes, next: 0, eol }
    }

    fn ready(&self) -> bool {
        self.nodes[self.next].status.contains(RxStatus::EOP)
    }

    /// Hands the oldest node back to the DMA and makes it the new list end.
    fn consume(&mut self) {
        let idx = self.next;
        let node = &mut self.nodes[idx];
        node.status = RxStatus::empty();
        node.hw_len = 0;
        node.eol = true;
        self.nodes[self.eol].eol = false;
        self.eol = idx;
        self.next = (idx + 1) % self.nodes.len();
    }
}

impl Default for RxRing {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: Registers> Hcd<R> {
    /// Receive DMA interrupt. Returns whether any packet was consumed.
    pub fn rx_interrupt(&mut self) -> bool {
        self.regs.write(R_DMA_CH9_CLR_INTR, 1);
        self.drain_rx()
    }

    /// Hands every filled receive node to its request. The bottom half
    /// runs this before finishing anything, so a request never completes
    /// ahead of data already sitting in the ring.
    pub(crate) fn drain_rx(&mut self) -> bool {
        let mut consumed = false;
        let mut packet = [0u8; RX_DESC_BUF_SIZE];
        while self.rx.ready() {
            let node = &self.rx.nodes[self.rx.next];
            let status = node.status;
            let len = (node.hw_len as usize).min(RX_DESC_BUF_SIZE);
            packet[..len].copy_from_slice(&node.buf[..len]);
            self.rx.consume();
            consumed = true;

            if status.intersects(RxStatus::NODATA | RxStatus::ERROR) {
                trace!("usb: rx skip {:?}", status);
                continue;
            }
            self.route_rx(status.epid(), &packet[..len], status.contains(RxStatus::EOT));
        }

        if consumed {
            self.regs.write(R_DMA_CH9_CMD, DMA_CMD_CONTINUE);
        }
        consumed
    }

    fn route_rx(&mut self, epid: Epid, data: &[u8], eot: bool) {
        let Some(&id) = self.queues[epid.index()].front() else {
            warn!("usb: dropping {} bytes for {} with nothing queued", data.len(), epid);
            return;
        };
        let transfer_type = self.epids.slot(epid).transfer_type;
        let Some(entry) = self.urbs.get_mut(id.0) else {
            return;
        };

        if transfer_type == UsbTransfer::Interrupt {
            let held: usize = entry.pending.iter().map(Vec::len).sum();
            if entry.overrun || held + data.len() > entry.urb.buffer.len() {
                if !entry.overrun {
                    warn!("usb: {} interrupt data overruns buffer", epid);
                }
                entry.overrun = true;
                entry.pending.clear();
            } else {
                entry.pending.push(data.to_vec());
            }
            if eot {
                let chunks = core::mem::take(&mut entry.pending);
                let (status, actual) = if core::mem::take(&mut entry.overrun) {
                    (Err(UrbError::Protocol), 0)
                } else {
                    let mut actual = 0;
                    for chunk in &chunks {
                        entry.urb.buffer[actual..actual + chunk.len()].copy_from_slice(chunk);
                        actual += chunk.len();
                    }
                    (Ok(()), actual)
                };
                self.push_periodic(id, status, actual);
            }
            return;
        }

        let end = entry.rx_offset + data.len();
        if end > entry.urb.buffer.len() {
            warn!("usb: {} receive overrun ({} > {})", epid, end, entry.urb.buffer.len());
            entry.overrun = true;
        } else {
            entry.urb.buffer[entry.rx_offset..end].copy_from_slice(data);
            entry.rx_offset = end;
        }
        if eot {
            entry.eot_seen = true;
        }
    }
}
