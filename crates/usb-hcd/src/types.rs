//! Types shared between the driver and the upstream transfer-request layer.

use core::fmt;

use byteorder::{ByteOrder, LittleEndian};

/// Number of rows in the hardware endpoint table.
pub const NBR_OF_EPIDS: usize = 32;

/// Handle to a row of the hardware endpoint table.
///
/// Row 0 is the dummy the idle rings point at and is never handed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Epid(u8);

impl Epid {
    pub const DUMMY: Epid = Epid(0);

    pub fn new(index: usize) -> Option<Self> {
        if index < NBR_OF_EPIDS {
            Some(Epid(index as u8))
        } else {
            None
        }
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }

    pub fn raw(self) -> u8 {
        self.0
    }

    /// All allocatable handles.
    pub fn all() -> impl Iterator<Item = Epid> {
        (1..NBR_OF_EPIDS as u8).map(Epid)
    }
}

impl Default for Epid {
    fn default() -> Self {
        Epid::DUMMY
    }
}

impl fmt::Display for Epid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "epid {}", self.0)
    }
}

/// Direction of USB communication.
#[repr(u8)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum UsbDirection {
    #[default]
    Out = 0,
    In = 1,
}

/// Only full and low speed exist on this controller.
#[repr(u8)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum UsbSpeed {
    #[default]
    Full = 1,
    Low = 2,
}

#[repr(u8)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum UsbTransfer {
    #[default]
    Control = 0,
    Isochronous = 1,
    Bulk = 2,
    Interrupt = 3,
}

/// Address of a pipe: the physical properties that identify an endpoint on
/// the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsbPipe {
    pub device: u8,
    pub endpoint: u8,
    pub direction: UsbDirection,
    pub transfer_type: UsbTransfer,
    pub speed: UsbSpeed,
    pub max_packet: u16,
}

impl UsbPipe {
    pub fn control(device: u8, max_packet: u16) -> Self {
        Self {
            device,
            endpoint: 0,
            direction: UsbDirection::Out,
            transfer_type: UsbTransfer::Control,
            speed: UsbSpeed::Full,
            max_packet,
        }
    }

    pub fn bulk_in(device: u8, endpoint: u8, max_packet: u16) -> Self {
        Self::new(device, endpoint, UsbDirection::In, UsbTransfer::Bulk, max_packet)
    }

    pub fn bulk_out(device: u8, endpoint: u8, max_packet: u16) -> Self {
        Self::new(device, endpoint, UsbDirection::Out, UsbTransfer::Bulk, max_packet)
    }

    pub fn interrupt_in(device: u8, endpoint: u8, max_packet: u16) -> Self {
        Self::new(device, endpoint, UsbDirection::In, UsbTransfer::Interrupt, max_packet)
    }

    pub fn interrupt_out(device: u8, endpoint: u8, max_packet: u16) -> Self {
        Self::new(device, endpoint, UsbDirection::Out, UsbTransfer::Interrupt, max_packet)
    }

    fn new(
        device: u8,
        endpoint: u8,
        direction: UsbDirection,
        transfer_type: UsbTransfer,
        max_packet: u16,
    ) -> Self {
        Self {
            device,
            endpoint,
            direction,
            transfer_type,
            speed: UsbSpeed::Full,
            max_packet,
        }
    }

    pub fn low_speed(mut self) -> Self {
        self.speed = UsbSpeed::Low;
        self
    }

    pub fn is_in(&self) -> bool {
        self.direction == UsbDirection::In
    }
}

/// The 8 byte SETUP stage of a control transfer (USB 2.0 9.3).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SetupPacket {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

impl SetupPacket {
    pub const LEN: usize = 8;

    pub fn new(request_type: u8, request: u8, value: u16, index: u16, length: u16) -> Self {
        Self {
            request_type,
            request,
            value,
            index,
            length,
        }
    }

    pub fn to_bytes(&self) -> [u8; Self::LEN] {
        let mut buf = [0u8; Self::LEN];
        buf[0] = self.request_type;
        buf[1] = self.request;
        LittleEndian::write_u16(&mut buf[2..4], self.value);
        LittleEndian::write_u16(&mut buf[4..6], self.index);
        LittleEndian::write_u16(&mut buf[6..8], self.length);
        buf
    }

    pub fn from_bytes(buf: &[u8; Self::LEN]) -> Self {
        Self {
            request_type: buf[0],
            request: buf[1],
            value: LittleEndian::read_u16(&buf[2..4]),
            index: LittleEndian::read_u16(&buf[4..6]),
            length: LittleEndian::read_u16(&buf[6..8]),
        }
    }

    /// Data stage flows device to host.
    pub fn is_in(&self) -> bool {
        self.request_type & 0x80 != 0
    }
}

/// Why a request finished without success.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UrbError {
    /// The device answered with STALL.
    Stall,
    /// Short or malformed transfer, missing end of transfer, receive overrun,
    /// or too many bus errors.
    Protocol,
    /// No free endpoint table row; the caller may retry later.
    Exhausted,
    /// Removed by unlink.
    Cancelled,
    /// Isochronous, or a transfer type the root hub does not implement.
    Unsupported,
    /// The descriptor pool ran out.
    NoMemory,
    /// The device address was never allocated.
    NoDevice,
    /// The endpoint is in use by a transfer that cannot share it.
    Busy,
    /// Unlink of an id that is not queued.
    NotFound,
    /// Malformed request (bad max packet size, missing setup packet, ...).
    Invalid,
    /// The controller hit a fatal fault and no longer takes requests.
    Shutdown,
}

impl fmt::Display for UrbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            UrbError::Stall => "endpoint stalled",
            UrbError::Protocol => "protocol error",
            UrbError::Exhausted => "no free endpoint slot",
            UrbError::Cancelled => "request cancelled",
            UrbError::Unsupported => "transfer type not supported",
            UrbError::NoMemory => "descriptor pool exhausted",
            UrbError::NoDevice => "no such device",
            UrbError::Busy => "endpoint busy",
            UrbError::NotFound => "request not queued",
            UrbError::Invalid => "invalid request",
            UrbError::Shutdown => "controller shut down",
        };
        f.write_str(msg)
    }
}

impl core::error::Error for UrbError {}

/// Conditions the hardware contract declares impossible. Once one is seen
/// the controller is stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    BusError(Epid),
    /// Attention raised for a row with no queued request.
    OrphanAttention(Epid),
    HoldTimeout(Epid),
    UnlinkTimeout(Epid),
    CommandTimeout,
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Fault::BusError(epid) => write!(f, "bus error on {}", epid),
            Fault::OrphanAttention(epid) => write!(f, "attention on idle {}", epid),
            Fault::HoldTimeout(epid) => write!(f, "{} stuck on hold", epid),
            Fault::UnlinkTimeout(epid) => write!(f, "dma did not release {}", epid),
            Fault::CommandTimeout => f.write_str("port command stuck busy"),
        }
    }
}

impl core::error::Error for Fault {}

pub type Result<T, E = UrbError> = core::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setup_packet_is_little_endian() {
        let setup = SetupPacket::new(0x80, 6, 0x0100, 0, 18);
        let bytes = setup.to_bytes();
        assert_eq!(bytes, [0x80, 6, 0x00, 0x01, 0, 0, 18, 0]);
        assert_eq!(SetupPacket::from_bytes(&bytes), setup);
        assert!(setup.is_in());
    }

    #[test]
    fn epid_is_bounds_checked() {
        assert!(Epid::new(31).is_some());
        assert!(Epid::new(32).is_none());
        assert_eq!(Epid::all().count(), NBR_OF_EPIDS - 1);
        assert!(Epid::all().all(|e| e != Epid::DUMMY));
    }
}
