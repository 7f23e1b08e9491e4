//! The virtual root hub.
//!
//! The controller's two ports are presented to the upper layers as a
//! standard two port hub. Requests to the hub are answered here from fixed
//! descriptor tables and software change bits; only port enable, reset and
//! suspend reach the hardware, as port commands.

use alloc::vec::Vec;

use bitflags::bitflags;
use bytemuck::{bytes_of, Pod, Zeroable};
use byteorder::{ByteOrder, LittleEndian};
use log::{debug, info, warn};

use crate::hcd::Hcd;
use crate::regs::*;
use crate::types::{SetupPacket, UsbTransfer};
use crate::urb::{Urb, UrbCallback, UrbEntry, UrbId};
use crate::{Result, UrbError};

pub const ROOT_HUB_PORTS: usize = 2;

bitflags! {
    /// wPortStatus, USB 2.0 11.24.2.7.1.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct HubPortStatus: u16 {
        const CONNECTED = 1 << 0;
        const ENABLED = 1 << 1;
        const SUSPENDED = 1 << 2;
        const OVER_CURRENT = 1 << 3;
        const RESET = 1 << 4;
        const POWER = 1 << 8;
        const LOW_SPEED = 1 << 9;
    }

    /// wPortChange, USB 2.0 11.24.2.7.2.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct HubPortChange: u16 {
        const C_CONNECTION = 1 << 0;
        const C_ENABLE = 1 << 1;
        const C_SUSPEND = 1 << 2;
        const C_OVER_CURRENT = 1 << 3;
        const C_RESET = 1 << 4;
    }
}

/// Standard requests, USB 2.0 table 9-4.
mod request {
    pub const GET_STATUS: u8 = 0;
    pub const CLEAR_FEATURE: u8 = 1;
    pub const SET_FEATURE: u8 = 3;
    pub const SET_ADDRESS: u8 = 5;
    pub const GET_DESCRIPTOR: u8 = 6;
    pub const GET_CONFIGURATION: u8 = 8;
    pub const SET_CONFIGURATION: u8 = 9;
    pub const GET_INTERFACE: u8 = 10;
    pub const SET_INTERFACE: u8 = 11;
}

/// Port features, USB 2.0 table 11-17.
mod feature {
    pub const PORT_ENABLE: u16 = 1;
    pub const PORT_SUSPEND: u16 = 2;
    pub const PORT_RESET: u16 = 4;
    pub const PORT_POWER: u16 = 8;
    pub const C_PORT_CONNECTION: u16 = 16;
    pub const C_PORT_ENABLE: u16 = 17;
    pub const C_PORT_SUSPEND: u16 = 18;
    pub const C_PORT_OVER_CURRENT: u16 = 19;
    pub const C_PORT_RESET: u16 = 20;
}

const DESC_DEVICE: u8 = 1;
const DESC_CONFIGURATION: u8 = 2;
const DESC_STRING: u8 = 3;
const DESC_INTERFACE: u8 = 4;
const DESC_ENDPOINT: u8 = 5;
const DESC_HUB: u8 = 0x29;
const CLASS_HUB: u8 = 9;

#[repr(C, packed)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct DeviceDescriptor {
    length: u8,
    descriptor_type: u8,
    usb_version: u16,
    class: u8,
    subclass: u8,
    protocol: u8,
    max_packet_size0: u8,
    vendor_id: u16,
    product_id: u16,
    version: u16,
    manufacturer: u8,
    product: u8,
    serial_number: u8,
    configuration_count: u8,
}

#[repr(C, packed)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct ConfigurationDescriptor {
    length: u8,
    descriptor_type: u8,
    total_length: u16,
    interface_count: u8,
    configuration_value: u8,
    string_index: u8,
    attributes: u8,
    maximum_power: u8,
}

#[repr(C, packed)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct InterfaceDescriptor {
    length: u8,
    descriptor_type: u8,
    number: u8,
    alternate_setting: u8,
    endpoint_count: u8,
    class: u8,
    subclass: u8,
    protocol: u8,
    string_index: u8,
}

#[repr(C, packed)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct EndpointDescriptor {
    length: u8,
    descriptor_type: u8,
    endpoint_address: u8,
    attributes: u8,
    max_packet: u16,
    interval: u8,
}

/// Configuration descriptor together with everything it announces.
#[repr(C, packed)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct ConfigurationBundle {
    configuration: ConfigurationDescriptor,
    interface: InterfaceDescriptor,
    endpoint: EndpointDescriptor,
}

#[repr(C, packed)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct HubDescriptor {
    length: u8,
    descriptor_type: u8,
    port_count: u8,
    characteristics: u16,
    power_good_delay: u8,
    maximum_hub_power: u8,
    removable: u8,
    port_power_mask: u8,
}

const DEVICE_DESCRIPTOR: DeviceDescriptor = DeviceDescriptor {
    length: 18,
    descriptor_type: DESC_DEVICE,
    usb_version: 0x0110,
    class: CLASS_HUB,
    subclass: 0,
    protocol: 0,
    max_packet_size0: 8,
    vendor_id: 0,
    product_id: 0,
    version: 0x0100,
    manufacturer: 1,
    product: 2,
    serial_number: 0,
    configuration_count: 1,
};

const CONFIGURATION: ConfigurationBundle = ConfigurationBundle {
    configuration: ConfigurationDescriptor {
        length: 9,
        descriptor_type: DESC_CONFIGURATION,
        total_length: 25,
        interface_count: 1,
        configuration_value: 1,
        string_index: 0,
        // Self powered.
        attributes: 0xc0,
        maximum_power: 0,
    },
    interface: InterfaceDescriptor {
        length: 9,
        descriptor_type: DESC_INTERFACE,
        number: 0,
        alternate_setting: 0,
        endpoint_count: 1,
        class: CLASS_HUB,
        subclass: 0,
        protocol: 0,
        string_index: 0,
    },
    endpoint: EndpointDescriptor {
        length: 7,
        descriptor_type: DESC_ENDPOINT,
        endpoint_address: 0x81,
        attributes: UsbTransfer::Interrupt as u8,
        max_packet: 8,
        interval: 0xff,
    },
};

const HUB_DESCRIPTOR: HubDescriptor = HubDescriptor {
    length: 9,
    descriptor_type: DESC_HUB,
    port_count: ROOT_HUB_PORTS as u8,
    // Per-port power switching and over-current reporting.
    characteristics: 0x0009,
    power_good_delay: 50,
    maximum_hub_power: 0,
    removable: 0,
    port_power_mask: 0xff,
};

const STRINGS: [&str; 2] = ["ETRAX USB", "USB root hub"];
const LANGID_EN_US: u16 = 0x0409;

pub struct RootHub {
    address: u8,
    configuration: u8,
    prev: [PortReg; ROOT_HUB_PORTS],
    change: [HubPortChange; ROOT_HUB_PORTS],
    status_urb: Option<UrbId>,
    default_interval_ms: u32,
    interval_ms: u32,
}

impl RootHub {
    pub fn new(interval_ms: u32) -> Self {
        Self {
            address: 0,
            configuration: 0,
            prev: [PortReg::empty(); ROOT_HUB_PORTS],
            change: [HubPortChange::empty(); ROOT_HUB_PORTS],
            status_urb: None,
            default_interval_ms: interval_ms,
            interval_ms,
        }
    }

    /// Bus address the upper layer gave the hub.
    pub fn address(&self) -> u8 {
        self.address
    }

    /// Folds a fresh read of the port registers into the change bits.
    pub fn update_ports(&mut self, ports: [PortReg; ROOT_HUB_PORTS]) {
        for (port, cur) in ports.into_iter().enumerate() {
            let prev = self.prev[port];
            let change = &mut self.change[port];
            if prev.contains(PortReg::CONNECTED) != cur.contains(PortReg::CONNECTED) {
                info!(
                    "usb: port {} {}",
                    port + 1,
                    if cur.contains(PortReg::CONNECTED) { "connected" } else { "disconnected" }
                );
                change.insert(HubPortChange::C_CONNECTION);
            }
            if prev.contains(PortReg::ENABLED) && !cur.contains(PortReg::ENABLED) {
                change.insert(HubPortChange::C_ENABLE);
            }
            if prev.contains(PortReg::RESET)
                && !cur.contains(PortReg::RESET)
                && cur.contains(PortReg::ENABLED)
            {
                change.insert(HubPortChange::C_RESET);
            }
            self.prev[port] = cur;
        }
    }

    pub fn port_status(&self, port: usize) -> HubPortStatus {
        let reg = self.prev[port];
        let mut status = HubPortStatus::POWER;
        status.set(HubPortStatus::CONNECTED, reg.contains(PortReg::CONNECTED));
        status.set(HubPortStatus::ENABLED, reg.contains(PortReg::ENABLED));
        status.set(HubPortStatus::SUSPENDED, reg.contains(PortReg::SUSPENDED));
        status.set(HubPortStatus::RESET, reg.contains(PortReg::RESET));
        status.set(HubPortStatus::LOW_SPEED, reg.contains(PortReg::LOW_SPEED));
        status
    }

    pub fn port_change(&self, port: usize) -> HubPortChange {
        self.change[port]
    }

    /// Status change bitmap as the hub's interrupt endpoint reports it:
    /// bit `n` is set when port `n` has a pending change.
    pub fn change_bitmap(&self) -> u8 {
        self.change
            .iter()
            .enumerate()
            .filter(|(_, c)| !c.is_empty())
            .fold(0, |map, (port, _)| map | 1 << (port + 1))
    }
}

/// Maps wIndex of a port request onto a 0-based port.
fn port_index(setup: &SetupPacket) -> Result<usize> {
    match setup.index {
        1..=2 => Ok(setup.index as usize - 1),
        _ => Err(UrbError::Stall),
    }
}

fn reply(buf: &mut [u8], data: &[u8]) -> usize {
    let len = data.len().min(buf.len());
    buf[..len].copy_from_slice(&data[..len]);
    len
}

fn string_descriptor(index: u8) -> Option<Vec<u8>> {
    let mut desc = alloc::vec![0, DESC_STRING];
    if index == 0 {
        let mut lang = [0; 2];
        LittleEndian::write_u16(&mut lang, LANGID_EN_US);
        desc.extend_from_slice(&lang);
    } else {
        let text = STRINGS.get(index as usize - 1)?;
        for unit in text.encode_utf16() {
            let mut pair = [0; 2];
            LittleEndian::write_u16(&mut pair, unit);
            desc.extend_from_slice(&pair);
        }
    }
    desc[0] = desc.len() as u8;
    Some(desc)
}

impl<R: Registers> Hcd<R> {
    /// Serves a request addressed to the hub without touching the bus.
    pub(crate) fn roothub_submit(&mut self, urb: Urb, callback: UrbCallback) -> Result<UrbId> {
        match urb.pipe.transfer_type {
            UsbTransfer::Control => {
                let setup = urb.setup.ok_or(UrbError::Invalid)?;
                let mut entry = UrbEntry::new(urb, callback, None);
                entry.root_hub = true;
                let (status, actual) = match self.roothub_control(&setup, &mut entry.urb.buffer) {
                    Ok(len) => (Ok(()), len),
                    Err(err) => {
                        debug!("usb: root hub stalls {:?}", setup);
                        (Err(err), 0)
                    }
                };
                let id = UrbId(self.urbs.insert(entry));
                if let Some(entry) = self.urbs.remove(id.0) {
                    self.push_final(id, entry, status, actual);
                }
                Ok(id)
            }
            UsbTransfer::Interrupt => {
                if self.roothub.status_urb.is_some() {
                    return Err(UrbError::Busy);
                }
                let requested = urb.interval as u32;
                let mut entry = UrbEntry::new(urb, callback, None);
                entry.root_hub = true;
                let id = UrbId(self.urbs.insert(entry));
                let hub = &mut self.roothub;
                hub.status_urb = Some(id);
                hub.interval_ms = match requested {
                    0 => hub.default_interval_ms,
                    ms => ms.min(hub.default_interval_ms),
                };
                debug!("usb: root hub status polled every {} ms", hub.interval_ms);
                Ok(id)
            }
            _ => Err(UrbError::Unsupported),
        }
    }

    pub(crate) fn roothub_unlink(&mut self, id: UrbId) -> Result<()> {
        if self.roothub.status_urb != Some(id) {
            return Err(UrbError::NotFound);
        }
        self.roothub.status_urb = None;
        let entry = self.urbs.remove(id.0).ok_or(UrbError::NotFound)?;
        self.push_final(id, entry, Err(UrbError::Cancelled), 0);
        Ok(())
    }

    /// Timer tick of the hub's status endpoint. Reports pending changes to
    /// the status request, if any, and returns the delay until the next
    /// tick in milliseconds.
    pub fn poll_root_hub(&mut self) -> u32 {
        let map = self.roothub.change_bitmap();
        if let Some(id) = self.roothub.status_urb {
            if map != 0 {
                let delivered = self.urbs.get_mut(id.0).map(|entry| {
                    entry.urb.buffer.first_mut().map(|b| *b = map).is_some()
                });
                match delivered {
                    Some(true) => self.push_periodic(id, Ok(()), 1),
                    Some(false) => self.push_periodic(id, Err(UrbError::Protocol), 0),
                    None => {}
                }
            }
        }
        self.roothub.interval_ms
    }

    /// Answers one hub control request. Returns the reply length, or the
    /// stall for anything the hub does not implement.
    fn roothub_control(&mut self, setup: &SetupPacket, buf: &mut [u8]) -> Result<usize> {
        use request::*;

        let value = setup.value;
        match (setup.request_type, setup.request) {
            (0x80, GET_STATUS) => Ok(reply(buf, &[1, 0])),
            (0x81 | 0x82, GET_STATUS) => Ok(reply(buf, &[0, 0])),
            (0xa0, GET_STATUS) => Ok(reply(buf, &[0; 4])),
            (0xa3, GET_STATUS) => {
                let port = port_index(setup)?;
                let mut status = [0; 4];
                LittleEndian::write_u16(&mut status[..2], self.roothub.port_status(port).bits());
                LittleEndian::write_u16(&mut status[2..], self.roothub.port_change(port).bits());
                Ok(reply(buf, &status))
            }

            (0x00 | 0x02 | 0x20, CLEAR_FEATURE) => Ok(0),
            (0x23, CLEAR_FEATURE) => {
                let port = port_index(setup)?;
                let clear = |hub: &mut RootHub, bit| {
                    hub.change[port].remove(bit);
                };
                match value {
                    feature::PORT_ENABLE => {
                        info!("usb: disabling port {}", port + 1);
                        self.regs.write(port_disable_reg(port), 1);
                    }
                    feature::PORT_SUSPEND => {
                        self.port_command(port, PortCommand::Resume)?;
                    }
                    feature::PORT_POWER => {}
                    feature::C_PORT_CONNECTION => clear(&mut self.roothub, HubPortChange::C_CONNECTION),
                    feature::C_PORT_ENABLE => clear(&mut self.roothub, HubPortChange::C_ENABLE),
                    feature::C_PORT_SUSPEND => clear(&mut self.roothub, HubPortChange::C_SUSPEND),
                    feature::C_PORT_OVER_CURRENT => {
                        clear(&mut self.roothub, HubPortChange::C_OVER_CURRENT)
                    }
                    feature::C_PORT_RESET => clear(&mut self.roothub, HubPortChange::C_RESET),
                    _ => return Err(UrbError::Stall),
                }
                Ok(0)
            }

            (0x00 | 0x20, SET_FEATURE) => Ok(0),
            (0x23, SET_FEATURE) => {
                let port = port_index(setup)?;
                match value {
                    feature::PORT_RESET => {
                        info!("usb: resetting port {}", port + 1);
                        self.port_command(port, PortCommand::Reset)?;
                    }
                    feature::PORT_SUSPEND => self.port_command(port, PortCommand::Suspend)?,
                    feature::PORT_POWER => {}
                    _ => return Err(UrbError::Stall),
                }
                Ok(0)
            }

            (0x00, SET_ADDRESS) => {
                self.roothub.address = (value & 0x7f) as u8;
                debug!("usb: root hub address {}", self.roothub.address);
                Ok(0)
            }

            (0x80, GET_DESCRIPTOR) => match ((value >> 8) as u8, value as u8) {
                (DESC_DEVICE, _) => Ok(reply(buf, bytes_of(&DEVICE_DESCRIPTOR))),
                (DESC_CONFIGURATION, _) => Ok(reply(buf, bytes_of(&CONFIGURATION))),
                (DESC_STRING, index) => {
                    let desc = string_descriptor(index).ok_or(UrbError::Stall)?;
                    Ok(reply(buf, &desc))
                }
                _ => Err(UrbError::Stall),
            },
            (0xa0, GET_DESCRIPTOR) => Ok(reply(buf, bytes_of(&HUB_DESCRIPTOR))),

            (0x80, GET_CONFIGURATION) => Ok(reply(buf, &[self.roothub.configuration])),
            (0x00, SET_CONFIGURATION) => {
                self.roothub.configuration = value as u8;
                Ok(0)
            }
            (0x81, GET_INTERFACE) => Ok(reply(buf, &[0])),
            (0x01, SET_INTERFACE) => Ok(0),

            _ => {
                warn!(
                    "usb: root hub request {:#x}/{:#x} not supported",
                    setup.request_type, setup.request
                );
                Err(UrbError::Stall)
            }
        }
    }

    fn port_command(&mut self, port: usize, cmd: PortCommand) -> Result<()> {
        let word = usb_command(port as u8 + 1, cmd, CtrlCommand::HostNop);
        if let Err(fault) = self.command(word) {
            self.latch(fault);
            return Err(UrbError::Shutdown);
        }
        Ok(())
    }
}
