//! Allocation of endpoint table rows.
//!
//! Every endpoint with traffic in flight owns one row of the 32 entry
//! hardware table. A row is claimed when the first request for an endpoint
//! arrives and released when its queue drains.

use log::{debug, warn};

use crate::regs::{EptRow, Registers};
use crate::sync::spin_until;
use crate::types::{Epid, UsbPipe, UsbSpeed, UsbTransfer, NBR_OF_EPIDS};
use crate::{Fault, Result, UrbError};

/// Software view of an allocated row.
#[derive(Debug, Default, Clone, Copy)]
pub struct EpidSlot {
    pub device: u8,
    pub endpoint: u8,
    pub speed: UsbSpeed,
    pub max_packet: u16,
    pub transfer_type: UsbTransfer,
    /// Descriptors for the row are linked into a ring and may be walked.
    pub really_active: bool,
}

impl EpidSlot {
    fn matches(&self, device: u8, endpoint: u8, speed: UsbSpeed, max_packet: u16) -> bool {
        self.device == device
            && self.endpoint == endpoint
            && self.speed == speed
            && self.max_packet == max_packet
    }
}

pub struct EpidTable {
    in_use: u32,
    slots: [EpidSlot; NBR_OF_EPIDS],
}

impl EpidTable {
    pub fn new() -> Self {
        Self {
            in_use: 1 << Epid::DUMMY.index(),
            slots: [EpidSlot::default(); NBR_OF_EPIDS],
        }
    }

    pub fn in_use(&self, epid: Epid) -> bool {
        self.in_use & (1 << epid.index()) != 0
    }

    /// Lowest free row. Does not claim it; [`EpidTable::setup`] does.
    pub fn allocate(&self) -> Result<Epid> {
        Epid::all()
            .find(|&epid| !self.in_use(epid))
            .ok_or(UrbError::Exhausted)
    }

    /// Row already serving this endpoint, whatever its direction.
    pub fn lookup(&self, device: u8, endpoint: u8, speed: UsbSpeed, max_packet: u16) -> Option<Epid> {
        Epid::all().find(|&epid| {
            self.in_use(epid) && self.slots[epid.index()].matches(device, endpoint, speed, max_packet)
        })
    }

    /// Claims `epid` for `pipe` and programs its hardware row.
    pub fn setup<R: Registers>(&mut self, regs: &mut R, epid: Epid, pipe: &UsbPipe) {
        if self.in_use(epid) {
            warn!("usb: setup of {} which is already in use", epid);
            return;
        }

        let row = EptRow {
            valid: true,
            dev: pipe.device,
            ep: pipe.endpoint,
            max_len: pipe.max_packet as u8,
            low_speed: pipe.speed == UsbSpeed::Low,
            ..EptRow::default()
        };
        regs.write_ept(epid.raw(), row);

        self.slots[epid.index()] = EpidSlot {
            device: pipe.device,
            endpoint: pipe.endpoint,
            speed: pipe.speed,
            max_packet: pipe.max_packet,
            transfer_type: pipe.transfer_type,
            really_active: false,
        };
        self.in_use |= 1 << epid.index();
        debug!("usb: {} -> dev {} ep {} ({:?})", epid, pipe.device, pipe.endpoint, pipe.transfer_type);
    }

    /// Invalidates the row once the hardware has let go of it.
    pub fn free<R: Registers>(&mut self, regs: &mut R, epid: Epid, hold_spin_limit: u32) -> Result<(), Fault> {
        if epid == Epid::DUMMY || !self.in_use(epid) {
            warn!("usb: free of {} which is not in use", epid);
            return Ok(());
        }

        spin_until(hold_spin_limit, Fault::HoldTimeout(epid), || !regs.read_ept(epid.raw()).hold)?;
        regs.write_ept(epid.raw(), EptRow::default());

        self.slots[epid.index()] = EpidSlot::default();
        self.in_use &= !(1 << epid.index());
        debug!("usb: released {}", epid);
        Ok(())
    }

    pub fn slot(&self, epid: Epid) -> &EpidSlot {
        &self.slots[epid.index()]
    }

    pub fn slot_mut(&mut self, epid: Epid) -> &mut EpidSlot {
        &mut self.slots[epid.index()]
    }

    pub fn count_in_use(&self) -> usize {
        Epid::all().filter(|&e| self.in_use(e)).count()
    }
}

impl Default for EpidTable {
    fn default() -> Self {
        Self::new()
    }
}
