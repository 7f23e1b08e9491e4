//! Controller context.
//!
//! [`Hcd`] owns the register block and every piece of driver state: the
//! endpoint table, descriptor memory, queues, device records and the root
//! hub. It is not synchronized itself; [`crate::UsbHost`] wraps it in the
//! interrupt-safe lock.

use alloc::collections::VecDeque;
use alloc::vec::Vec;

use log::{error, info, warn};
use thunderdome::Arena;

use crate::desc::{EpRing, IntrRing, SegmentPool, MAX_SEGMENTS};
use crate::epid::EpidTable;
use crate::regs::*;
use crate::roothub::RootHub;
use crate::rx::RxRing;
use crate::sync::spin_until;
use crate::types::{Epid, UsbDirection, NBR_OF_EPIDS};
use crate::urb::{Completion, Urb, UrbEntry, UrbId};
use crate::{Fault, Result, UrbError};

/// Number of bus addresses.
pub const MAX_DEVICES: usize = 128;

/// Tunables. The spin limits bound every busy-wait on the hardware.
#[derive(Debug, Clone, Copy)]
pub struct HcdConfig {
    /// Polls of a row's hold bit before freeing it.
    pub hold_spin_limit: u32,
    /// Polls while waiting for the DMA to leave a node being unlinked.
    pub unlink_spin_limit: u32,
    /// Polls of the command busy bit before issuing a port command.
    pub command_spin_limit: u32,
    /// Polling interval of the root hub status endpoint.
    pub root_hub_interval_ms: u32,
}

impl Default for HcdConfig {
    fn default() -> Self {
        Self {
            hold_spin_limit: 10_000,
            unlink_spin_limit: 10_000,
            command_spin_limit: 10_000,
            root_hub_interval_ms: 255,
        }
    }
}

/// Per-address records: whether the address is allocated and the data
/// toggles of its bulk endpoints.
pub(crate) struct DeviceTable {
    allocated: [bool; MAX_DEVICES],
    toggles: [[u16; 2]; MAX_DEVICES],
}

impl DeviceTable {
    pub fn new() -> Self {
        Self {
            allocated: [false; MAX_DEVICES],
            toggles: [[0; 2]; MAX_DEVICES],
        }
    }

    pub fn is_allocated(&self, device: u8) -> bool {
        self.allocated.get(device as usize).copied().unwrap_or(false)
    }

    pub fn toggle(&self, device: u8, endpoint: u8, dir: UsbDirection) -> bool {
        self.toggles
            .get(device as usize)
            .is_some_and(|t| t[dir as usize] & (1 << (endpoint & 0xf)) != 0)
    }

    pub fn set_toggle(&mut self, device: u8, endpoint: u8, dir: UsbDirection, value: bool) {
        if let Some(t) = self.toggles.get_mut(device as usize) {
            let bit = 1 << (endpoint & 0xf);
            if value {
                t[dir as usize] |= bit;
            } else {
                t[dir as usize] &= !bit;
            }
        }
    }
}

pub struct Hcd<R: Registers> {
    pub(crate) regs: R,
    pub(crate) config: HcdConfig,
    pub(crate) epids: EpidTable,
    pub(crate) segs: SegmentPool,
    pub(crate) ctrl_ring: EpRing,
    pub(crate) bulk_ring: EpRing,
    pub(crate) intr_ring: IntrRing,
    pub(crate) rx: RxRing,
    pub(crate) urbs: Arena<UrbEntry>,
    pub(crate) queues: [VecDeque<UrbId>; NBR_OF_EPIDS],
    pub(crate) devices: DeviceTable,
    pub(crate) roothub: RootHub,
    /// Attention bits seen but not yet handled.
    pub(crate) attn_pending: u32,
    pub(crate) fault: Option<Fault>,
    pub(crate) done: Vec<Completion>,
    /// Final results of requests whose callback was checked out when they
    /// finished.
    pub(crate) parked: Vec<(UrbId, Urb)>,
}

impl<R: Registers> Hcd<R> {
    /// Resets the controller, sets up descriptor memory and starts the
    /// host. Fails only if the controller never becomes ready for commands.
    pub fn attach(regs: R, config: HcdConfig) -> Result<Self, Fault> {
        let mut hcd = Self {
            regs,
            config,
            epids: EpidTable::new(),
            segs: SegmentPool::with_capacity(MAX_SEGMENTS),
            ctrl_ring: EpRing::new(),
            bulk_ring: EpRing::new(),
            intr_ring: IntrRing::new(),
            rx: RxRing::new(),
            urbs: Arena::new(),
            queues: core::array::from_fn(|_| VecDeque::new()),
            devices: DeviceTable::new(),
            roothub: RootHub::new(config.root_hub_interval_ms),
            attn_pending: 0,
            fault: None,
            done: Vec::new(),
            parked: Vec::new(),
        };

        let revision = hcd.regs.read(R_USB_REVISION);
        info!("usb: host controller revision {:#x}", revision);

        hcd.regs.write(R_USB_IRQ_MASK_CLR, u32::MAX);
        for sub in [SubChannel::Ctrl, SubChannel::Bulk, SubChannel::Intr, SubChannel::Isoc] {
            hcd.regs.write(R_DMA_CH8_SUB_CMD(sub), DMA_CMD_RESET);
        }
        hcd.regs.write(R_DMA_CH9_CMD, DMA_CMD_RESET);

        hcd.command(usb_command(0, PortCommand::Reset, CtrlCommand::Reset))?;

        // Row 0 stays valid so the idle rings always point at something.
        for index in 0..NBR_OF_EPIDS as u8 {
            hcd.regs.write_ept(index, EptRow::default());
        }
        let dummy = EptRow {
            valid: true,
            ..EptRow::default()
        };
        hcd.regs.write_ept(Epid::DUMMY.raw(), dummy);

        hcd.regs.write(R_DMA_CH9_FIRST, 0);
        hcd.regs.write(R_DMA_CH9_CMD, DMA_CMD_START);

        hcd.command(usb_command(0, PortCommand::Reset, CtrlCommand::HostConfig))?;
        hcd.command(usb_command(0, PortCommand::Reset, CtrlCommand::HostRun))?;

        let ports = [hcd.regs.read(port_status_reg(0)), hcd.regs.read(port_status_reg(1))];
        hcd.roothub.update_ports(ports.map(PortReg::from_bits_truncate));

        let irqs = UsbIrq::CTL_EOT
            | UsbIrq::BULK_EOT
            | UsbIrq::INTR_EOT
            | UsbIrq::EPID_ATTN
            | UsbIrq::PORT_STATUS
            | UsbIrq::CTL_STATUS;
        hcd.regs.write(R_USB_IRQ_MASK_SET, irqs.bits());
        Ok(hcd)
    }

    /// Waits for the command register to go idle, then writes `cmd`.
    pub(crate) fn command(&mut self, cmd: u32) -> Result<(), Fault> {
        let regs = &mut self.regs;
        spin_until(self.config.command_spin_limit, Fault::CommandTimeout, || {
            regs.read(R_USB_COMMAND) & COMMAND_BUSY == 0
        })?;
        self.regs.write(R_USB_COMMAND, cmd);
        Ok(())
    }

    pub(crate) fn ring_mut(&mut self, sub: SubChannel) -> &mut EpRing {
        match sub {
            SubChannel::Bulk => &mut self.bulk_ring,
            _ => &mut self.ctrl_ring,
        }
    }

    /// Records a fatal fault and stops the controller. Only the first fault
    /// is kept.
    pub(crate) fn latch(&mut self, fault: Fault) {
        if let Some(first) = self.fault {
            warn!("usb: {} after fault {}", fault, first);
            return;
        }
        error!("usb: fatal: {}, stopping controller", fault);
        self.fault = Some(fault);
        self.regs.write(R_USB_IRQ_MASK_CLR, u32::MAX);
        for sub in [SubChannel::Ctrl, SubChannel::Bulk, SubChannel::Intr, SubChannel::Isoc] {
            self.regs.write(R_DMA_CH8_SUB_CMD(sub), DMA_CMD_HOLD);
        }
        self.regs.write(R_DMA_CH9_CMD, DMA_CMD_HOLD);
        self.regs
            .write(R_USB_COMMAND, usb_command(0, PortCommand::Reset, CtrlCommand::HostNoRun));
    }

    pub fn fault(&self) -> Option<Fault> {
        self.fault
    }

    pub fn config(&self) -> &HcdConfig {
        &self.config
    }

    /// Current 11 bit frame number.
    pub fn frame_number(&mut self) -> u16 {
        (self.regs.read(R_USB_FM_NUMBER) & FM_NUMBER_MASK) as u16
    }

    /// Claims a bus address. The root hub's address is never handed out.
    pub fn alloc_device(&mut self, device: u8) -> Result<()> {
        let idx = device as usize;
        if idx >= MAX_DEVICES || device == self.roothub.address() {
            return Err(UrbError::Invalid);
        }
        if self.devices.allocated[idx] {
            return Err(UrbError::Busy);
        }
        self.devices.allocated[idx] = true;
        self.devices.toggles[idx] = [0; 2];
        Ok(())
    }

    pub fn free_device(&mut self, device: u8) -> Result<()> {
        let idx = device as usize;
        if !self.devices.is_allocated(device) {
            return Err(UrbError::NoDevice);
        }
        self.devices.allocated[idx] = false;
        self.devices.toggles[idx] = [0; 2];
        Ok(())
    }

    pub fn regs(&self) -> &R {
        &self.regs
    }
}
