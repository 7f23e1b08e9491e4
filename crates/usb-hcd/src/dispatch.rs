//! Completion handling.
//!
//! The top half runs in interrupt context: it reads the cause, status,
//! attention and port registers once, updates root hub change bits and
//! returns a snapshot. The bottom half takes snapshots one at a time and
//! reconciles each in-use row with its queue, finishing requests as the
//! hardware reports them done or failed.

use log::{debug, trace, warn};

use crate::desc::{effective_interval, DescState};
use crate::hcd::Hcd;
use crate::regs::*;
use crate::types::{Epid, UsbDirection, UsbTransfer};
use crate::{Fault, Result, UrbError};

/// Register state captured by one top-half run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IrqSnapshot {
    pub irq: UsbIrq,
    pub status: UsbStatus,
    /// Rows needing attention, bit `n` for row `n`.
    pub attn: u32,
    pub ports: [PortReg; 2],
    /// Frame counter at the time of the interrupt.
    pub frame: u16,
}

/// Whether the interrupt DMA visited a node of an endpoint polled every
/// `interval` frames in the frames after `from`, up to and including `to`.
/// Slot `f % MAX_INTR_INTERVAL` is walked in frame `f`, so the endpoint is
/// polled in every frame that is a multiple of `interval`.
fn polled_since(from: u16, to: u16, interval: usize) -> bool {
    let from = (from as u32 & FM_NUMBER_MASK) as usize;
    let elapsed = (to.wrapping_sub(from as u16) as u32 & FM_NUMBER_MASK) as usize;
    (from + elapsed) / interval > from / interval
}

impl<R: Registers> Hcd<R> {
    /// Reads and acknowledges the pending interrupt. Returns `None` when
    /// nothing was pending.
    pub fn top_half(&mut self) -> Option<IrqSnapshot> {
        let irq = UsbIrq::from_bits_truncate(self.regs.read(R_USB_IRQ_MASK_READ));
        if irq.is_empty() {
            return None;
        }

        let status = UsbStatus::from_bits_truncate(self.regs.read(R_USB_STATUS));
        let attn = if irq.contains(UsbIrq::EPID_ATTN) {
            self.regs.read(R_USB_EPID_ATTN)
        } else {
            0
        };
        let ports = [0, 1].map(|port| PortReg::from_bits_truncate(self.regs.read(port_status_reg(port))));
        let frame = self.frame_number();

        if irq.contains(UsbIrq::PORT_STATUS) {
            self.roothub.update_ports(ports);
        }
        if status.contains(UsbStatus::PERROR) {
            warn!("usb: controller reports protocol error");
        }
        if status.contains(UsbStatus::OURUN) {
            warn!("usb: controller reports fifo over/underrun");
        }

        for (cause, sub) in [
            (UsbIrq::CTL_EOT, SubChannel::Ctrl),
            (UsbIrq::BULK_EOT, SubChannel::Bulk),
            (UsbIrq::INTR_EOT, SubChannel::Intr),
        ] {
            if irq.contains(cause) {
                self.regs.write(R_DMA_CH8_SUB_CLR_INTR(sub), 1);
            }
        }

        trace!("usb: irq {:?} attn {:#x}", irq, attn);
        Some(IrqSnapshot {
            irq,
            status,
            attn,
            ports,
            frame,
        })
    }

    /// Keeps attention bits of a snapshot that could not be queued.
    pub fn stash_attention(&mut self, attn: u32) {
        self.attn_pending |= attn;
    }

    /// Walks rows 1..31 against `snap`. A fault stops the walk, is latched
    /// and returned.
    ///
    /// Received data is drained first: a chain the DMA reports finished
    /// may have its last packets still waiting in the receive ring.
    pub fn bottom_half(&mut self, snap: &IrqSnapshot) -> Result<(), Fault> {
        if let Some(fault) = self.fault {
            return Err(fault);
        }
        self.drain_rx();
        self.attn_pending |= snap.attn;

        let res = self.reconcile(snap);
        if let (Err(fault), None) = (res, self.fault) {
            self.latch(fault);
        }
        res
    }

    fn reconcile(&mut self, snap: &IrqSnapshot) -> Result<(), Fault> {
        for epid in Epid::all() {
            let bit = 1 << epid.index();
            let row = self.regs.read_ept(epid.raw());
            if row.hold {
                // Attention stays pending until the row is released.
                continue;
            }
            if !row.valid {
                if self.attn_pending & bit != 0 {
                    warn!("usb: attention on invalid {}", epid);
                    self.attn_pending &= !bit;
                }
                continue;
            }

            if self.attn_pending & bit != 0 {
                self.attn_pending &= !bit;
                self.handle_attention(epid, row)?;
            } else if self.epids.slot(epid).really_active {
                self.handle_progress(epid, snap)?;
            }
        }
        Ok(())
    }

    fn handle_attention(&mut self, epid: Epid, mut row: EptRow) -> Result<(), Fault> {
        if self.queues[epid.index()].is_empty() {
            return Err(Fault::OrphanAttention(epid));
        }

        let status = match row.error_code {
            EptError::NoError if row.retries_exhausted() => Err(UrbError::Protocol),
            EptError::NoError => Ok(()),
            EptError::Stall => Err(UrbError::Stall),
            EptError::BusError => return Err(Fault::BusError(epid)),
            EptError::BufferError => Err(UrbError::Protocol),
        };
        debug!("usb: attention on {}: {:?} -> {:?}", epid, row.error_code, status);

        row.error_code = EptError::NoError;
        row.error_count_in = 0;
        row.error_count_out = 0;

        if self.epids.slot(epid).transfer_type == UsbTransfer::Interrupt {
            if status.is_ok() {
                self.regs.write_ept(epid.raw(), row);
                return Ok(());
            }
            // Report the failure, then keep polling from DATA0.
            row.t_in = false;
            row.t_out = false;
            self.regs.write_ept(epid.raw(), row);
            if let Some(&id) = self.queues[epid.index()].front() {
                self.push_periodic(id, status, 0);
            }
            self.intr_ring.set_enabled(epid, true);
            self.start_sub(SubChannel::Intr);
            return Ok(());
        }

        self.regs.write_ept(epid.raw(), row);
        self.finish_head(epid, status)
    }

    /// No attention: a control or bulk row whose node the DMA disabled has
    /// finished its chain.
    fn handle_progress(&mut self, epid: Epid, snap: &IrqSnapshot) -> Result<(), Fault> {
        match self.epids.slot(epid).transfer_type {
            UsbTransfer::Control if !self.ctrl_ring.enabled(epid) => self.finish_head(epid, Ok(())),
            UsbTransfer::Bulk if !self.bulk_ring.enabled(epid) => self.finish_head(epid, Ok(())),
            UsbTransfer::Interrupt if snap.irq.contains(UsbIrq::INTR_EOT) => {
                let Some(&id) = self.queues[epid.index()].front() else {
                    return Ok(());
                };
                let Some(entry) = self.urbs.get_mut(id.0) else {
                    return Ok(());
                };
                if entry.urb.pipe.is_in() {
                    return Ok(());
                }
                let interval = effective_interval(entry.urb.interval);
                if !polled_since(entry.intr_frame, snap.frame, interval) {
                    return Ok(());
                }
                entry.intr_frame = snap.frame;
                let len = entry.urb.buffer.len();
                self.push_periodic(id, Ok(()), len);
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Completes the request at the head of `epid`'s queue and starts the
    /// next one.
    pub(crate) fn finish_head(&mut self, epid: Epid, status: Result<()>) -> Result<(), Fault> {
        let id = self.queues[epid.index()]
            .pop_front()
            .ok_or(Fault::OrphanAttention(epid))?;
        let Some(mut entry) = self.urbs.remove(id.0) else {
            return Err(Fault::OrphanAttention(epid));
        };

        let pipe = entry.urb.pipe;
        let mut actual = 0;
        let status = status.and_then(|()| {
            if entry.overrun {
                Err(UrbError::Protocol)
            } else if entry.urb.expects_in_data() {
                if entry.eot_seen {
                    actual = entry.rx_offset;
                    Ok(())
                } else {
                    warn!("usb: {} finished without end of transfer", epid);
                    Err(UrbError::Protocol)
                }
            } else {
                if !entry.urb.is_in() {
                    actual = entry.urb.buffer.len();
                }
                Ok(())
            }
        });

        if pipe.transfer_type == UsbTransfer::Bulk {
            let row = self.regs.read_ept(epid.raw());
            self.devices.set_toggle(pipe.device, pipe.endpoint, UsbDirection::In, row.t_in);
            self.devices.set_toggle(pipe.device, pipe.endpoint, UsbDirection::Out, row.t_out);
        }

        let sub = if pipe.transfer_type == UsbTransfer::Control {
            SubChannel::Ctrl
        } else {
            SubChannel::Bulk
        };
        if let Some(head) = self.ring_mut(sub).disarm(epid) {
            self.segs.set_chain_state(head, DescState::Completed);
            self.segs.release_chain(head);
        }
        entry.head = None;
        self.epids.slot_mut(epid).really_active = false;

        self.push_final(id, entry, status, actual);
        self.arm_next(epid);
        match self.fault {
            Some(fault) => Err(fault),
            None => Ok(()),
        }
    }
}
