//! Turning the request at the head of a queue into descriptors.
//!
//! Control and bulk requests become a segment chain hung off the row's
//! ring node. Interrupt requests get one node and segment in every slot of
//! the periodic ring they are polled in.

use log::{debug, trace};

use crate::desc::{
    effective_interval, ChainBuilder, DescState, EpCommand, IntrNode, SegId, Segment,
    MAX_INTR_INTERVAL,
};
use crate::hcd::Hcd;
use crate::regs::*;
use crate::types::{Epid, UsbDirection, UsbTransfer};
use crate::urb::UrbId;
use crate::{Result, UrbError};

impl<R: Registers> Hcd<R> {
    /// Links the descriptors for `id`, which must head `epid`'s queue.
    pub(crate) fn start_transfer(&mut self, epid: Epid, id: UrbId) -> Result<()> {
        let entry = self.urbs.get_mut(id.0).ok_or(UrbError::NotFound)?;
        entry.rx_offset = 0;
        entry.eot_seen = false;
        entry.overrun = false;
        entry.pending.clear();

        let transfer_type = entry.urb.pipe.transfer_type;
        match transfer_type {
            UsbTransfer::Control => self.build_ctrl(epid, id),
            UsbTransfer::Bulk => self.build_bulk(epid, id),
            UsbTransfer::Interrupt => self.build_intr(epid, id),
            UsbTransfer::Isochronous => Err(UrbError::Unsupported),
        }
    }

    fn build_ctrl(&mut self, epid: Epid, id: UrbId) -> Result<()> {
        let entry = self.urbs.get(id.0).ok_or(UrbError::NotFound)?;
        let setup = entry.urb.setup.ok_or(UrbError::Invalid)?;
        let max_packet = entry.urb.pipe.max_packet;
        let data = &entry.urb.buffer;

        let mut chain = ChainBuilder::new(&mut self.segs);
        chain.push(Segment::setup(&setup))?;
        if data.is_empty() {
            chain.push(Segment::zero_in())?;
        } else if setup.is_in() {
            chain.push(Segment::data_in(data.len(), max_packet))?;
            chain.push(Segment::zout())?;
        } else {
            chain.push(Segment::data_out(data))?;
            chain.push(Segment::zero_in())?;
        }
        let head = chain.finish().ok_or(UrbError::NoMemory)?;

        // Every control transfer starts with a DATA0 SETUP.
        let mut row = self.regs.read_ept(epid.raw());
        row.t_in = false;
        row.t_out = false;
        row.error_code = EptError::NoError;
        row.error_count_in = 0;
        row.error_count_out = 0;
        self.regs.write_ept(epid.raw(), row);

        self.link(SubChannel::Ctrl, epid, id, head);
        Ok(())
    }

    fn build_bulk(&mut self, epid: Epid, id: UrbId) -> Result<()> {
        let entry = self.urbs.get(id.0).ok_or(UrbError::NotFound)?;
        let pipe = entry.urb.pipe;
        let seg = if pipe.is_in() {
            Segment::data_in(entry.urb.buffer.len(), pipe.max_packet)
        } else {
            Segment::data_out(&entry.urb.buffer)
        };

        let mut chain = ChainBuilder::new(&mut self.segs);
        chain.push(seg)?;
        let head = chain.finish().ok_or(UrbError::NoMemory)?;

        // Bulk toggles survive the row being freed between requests.
        let mut row = self.regs.read_ept(epid.raw());
        row.t_in = self.devices.toggle(pipe.device, pipe.endpoint, UsbDirection::In);
        row.t_out = self.devices.toggle(pipe.device, pipe.endpoint, UsbDirection::Out);
        row.error_code = EptError::NoError;
        row.error_count_in = 0;
        row.error_count_out = 0;
        self.regs.write_ept(epid.raw(), row);

        self.link(SubChannel::Bulk, epid, id, head);
        Ok(())
    }

    fn link(&mut self, sub: SubChannel, epid: Epid, id: UrbId, head: SegId) {
        self.segs.set_chain_state(head, DescState::Submitted);
        self.ring_mut(sub).arm(epid, head);
        self.segs.set_chain_state(head, DescState::InFlight);
        if let Some(entry) = self.urbs.get_mut(id.0) {
            entry.head = Some(head);
        }
        self.epids.slot_mut(epid).really_active = true;
        trace!("usb: {:?} linked on {} ({:?})", id, epid, sub);
        self.start_sub(sub);
    }

    fn build_intr(&mut self, epid: Epid, id: UrbId) -> Result<()> {
        let frame = self.frame_number();
        let entry = self.urbs.get_mut(id.0).ok_or(UrbError::NotFound)?;
        entry.intr_frame = frame;
        let interval = effective_interval(entry.urb.interval);
        let out_data = (!entry.urb.pipe.is_in()).then(|| entry.urb.buffer.clone());

        for slot in (0..MAX_INTR_INTERVAL).step_by(interval) {
            let seg = match &out_data {
                Some(data) => Segment::data_out(data),
                None => Segment::zero_in(),
            };
            let sub = match self.segs.alloc(seg.last()) {
                Ok(sub) => sub,
                Err(err) => {
                    self.unschedule_intr(epid);
                    return Err(err);
                }
            };
            let node = IntrNode {
                command: EpCommand::ENABLE | EpCommand::INTR,
                epid,
                sub: Some(sub),
            };
            if let Err(err) = self.intr_ring.insert(slot, node) {
                self.segs.release_chain(sub);
                self.unschedule_intr(epid);
                return Err(err);
            }
            self.segs.set_chain_state(sub, DescState::InFlight);
        }

        self.epids.slot_mut(epid).really_active = true;
        debug!("usb: {:?} polled every {} frames on {}", id, interval, epid);
        self.start_sub(SubChannel::Intr);
        Ok(())
    }

    /// Takes `epid` out of every slot of the periodic ring.
    pub(crate) fn unschedule_intr(&mut self, epid: Epid) {
        for sub in self.intr_ring.remove(epid) {
            self.segs.release_chain(sub);
        }
        self.epids.slot_mut(epid).really_active = false;
    }

    /// Points an idle sub-channel at its ring head and starts it.
    pub(crate) fn start_sub(&mut self, sub: SubChannel) {
        if self.regs.read(R_DMA_CH8_SUB_CMD(sub)) & 0x7 != DMA_CMD_START {
            self.regs.write(R_DMA_CH8_SUB_EP(sub), Epid::DUMMY.raw() as u32);
            self.regs.write(R_DMA_CH8_SUB_CMD(sub), DMA_CMD_START);
        }
    }
}
