//! Register level model of the controller for tests.
//!
//! `SimRegs` stores plain register values, keeps the endpoint table behind
//! its index/data window, and clears the attention and interrupt cause
//! registers on read. The free functions below play the part of the DMA
//! engine: they edit descriptor memory the way the hardware would and then
//! raise the matching interrupt cause.

use std::collections::BTreeMap;
use std::vec::Vec;

use crate::hcd::Hcd;
use crate::regs::*;
use crate::rx::{RxStatus, RX_DESC_BUF_SIZE};
use crate::types::{Epid, NBR_OF_EPIDS};

const HOLD_BIT: u32 = 1 << 30;

pub struct SimRegs {
    regs: BTreeMap<usize, u32>,
    ept: [u32; NBR_OF_EPIDS],
    ept_index: usize,
    hold_polls: [u32; NBR_OF_EPIDS],
    pub command_busy_polls: u32,
    pub writes: Vec<(usize, u32)>,
}

impl SimRegs {
    pub fn new() -> Self {
        Self {
            regs: BTreeMap::new(),
            ept: [0; NBR_OF_EPIDS],
            ept_index: 0,
            hold_polls: [0; NBR_OF_EPIDS],
            command_busy_polls: 0,
            writes: Vec::new(),
        }
    }

    pub fn ept_row(&self, epid: Epid) -> EptRow {
        EptRow::from_u32(self.ept[epid.index()])
    }

    /// Changes a row from the controller side.
    pub fn set_ept_row(&mut self, epid: Epid, row: EptRow) {
        self.ept[epid.index()] = row.to_u32() & !HOLD_BIT;
    }

    /// The next `polls` reads of the row report it on hold.
    pub fn hold_for(&mut self, epid: Epid, polls: u32) {
        self.hold_polls[epid.index()] = polls;
    }

    pub fn raise(&mut self, irq: UsbIrq, attn: u32) {
        *self.regs.entry(R_USB_IRQ_MASK_READ).or_default() |= irq.bits();
        *self.regs.entry(R_USB_EPID_ATTN).or_default() |= attn;
    }

    pub fn set_port(&mut self, port: usize, status: PortReg) {
        self.regs.insert(port_status_reg(port), status.bits());
    }

    pub fn peek(&self, offset: usize) -> u32 {
        self.regs.get(&offset).copied().unwrap_or(0)
    }

    pub fn poke(&mut self, offset: usize, value: u32) {
        self.regs.insert(offset, value);
    }

    pub fn last_write(&self, offset: usize) -> Option<u32> {
        self.writes.iter().rev().find(|(o, _)| *o == offset).map(|(_, v)| *v)
    }
}

impl Registers for SimRegs {
    fn read(&mut self, offset: usize) -> u32 {
        match offset {
            R_USB_EPT_DATA => {
                let idx = self.ept_index;
                let mut value = self.ept[idx];
                if self.hold_polls[idx] > 0 {
                    self.hold_polls[idx] -= 1;
                    value |= HOLD_BIT;
                }
                value
            }
            R_USB_EPID_ATTN | R_USB_IRQ_MASK_READ => self.regs.remove(&offset).unwrap_or(0),
            R_USB_COMMAND => {
                let value = self.peek(offset) & !COMMAND_BUSY;
                if self.command_busy_polls > 0 {
                    self.command_busy_polls -= 1;
                    value | COMMAND_BUSY
                } else {
                    value
                }
            }
            _ => self.peek(offset),
        }
    }

    fn write(&mut self, offset: usize, value: u32) {
        self.writes.push((offset, value));
        match offset {
            R_USB_EPT_INDEX => self.ept_index = value as usize % NBR_OF_EPIDS,
            R_USB_EPT_DATA => self.ept[self.ept_index] = value & !HOLD_BIT,
            _ => {
                self.regs.insert(offset, value);
            }
        }
    }
}

/// The control or bulk DMA finished the chain on `epid`.
pub fn finish_chain(hcd: &mut Hcd<SimRegs>, epid: Epid) {
    let irq = if hcd.ctrl_ring.enabled(epid) {
        hcd.ctrl_ring.disable(epid);
        UsbIrq::CTL_EOT
    } else {
        hcd.bulk_ring.disable(epid);
        UsbIrq::BULK_EOT
    };
    hcd.regs.raise(irq, 0);
}

/// The controller stopped `epid` with `code` after `errors` retries.
pub fn raise_attention(hcd: &mut Hcd<SimRegs>, epid: Epid, code: EptError, errors: u8) {
    let mut row = hcd.regs.ept_row(epid);
    row.error_code = code;
    row.error_count_in = errors;
    hcd.regs.set_ept_row(epid, row);
    hcd.regs.raise(UsbIrq::EPID_ATTN, 1 << epid.index());
}

/// Writes one received packet into the next free receive node.
pub fn receive(hcd: &mut Hcd<SimRegs>, epid: Epid, data: &[u8], eot: bool) {
    receive_with(hcd, epid, data, if eot { RxStatus::EOT } else { RxStatus::empty() });
}

pub fn receive_with(hcd: &mut Hcd<SimRegs>, epid: Epid, data: &[u8], flags: RxStatus) {
    assert!(data.len() <= RX_DESC_BUF_SIZE);
    let count = hcd.rx.nodes.len();
    let idx = (0..count)
        .map(|i| (hcd.rx.next + i) % count)
        .find(|&i| !hcd.rx.nodes[i].status.contains(RxStatus::EOP))
        .expect("receive ring full");
    let node = &mut hcd.rx.nodes[idx];
    node.buf[..data.len()].copy_from_slice(data);
    node.hw_len = data.len() as u16;
    node.status = RxStatus::EOP | flags | RxStatus::with_epid(epid);
}
