//! Register map of the host controller.
//!
//! The controller is driven through three groups of registers: the USB
//! block itself (command/status, interrupt mask, frame counter, root hub
//! ports and the endpoint table window), the four transmit sub-channels of
//! DMA channel 8, and the receive DMA channel 9. Offsets are relative to
//! the mapped base.

#![allow(non_snake_case)]

use bitflags::bitflags;

pub const R_USB_REVISION: usize = 0x0000;
pub const R_USB_COMMAND: usize = 0x0004;
pub const R_USB_STATUS: usize = 0x000C;
pub const R_USB_IRQ_MASK_SET: usize = 0x0010;
pub const R_USB_IRQ_MASK_READ: usize = 0x0014;
pub const R_USB_IRQ_MASK_CLR: usize = 0x0018;
pub const R_USB_IRQ_READ: usize = 0x001C;
pub const R_USB_FM_NUMBER: usize = 0x0020;
pub const R_USB_FM_INTERVAL: usize = 0x0024;
pub const R_USB_RH_STATUS: usize = 0x0030;
pub const R_USB_RH_PORT_STATUS_1: usize = 0x0034;
pub const R_USB_RH_PORT_STATUS_2: usize = 0x0038;
pub const R_USB_EPT_INDEX: usize = 0x003C;
pub const R_USB_EPT_DATA: usize = 0x0040;
pub const R_USB_EPT_DATA_ISO: usize = 0x0044;
pub const R_USB_EPID_ATTN: usize = 0x0048;
pub const R_USB_PORT1_DISABLE: usize = 0x004C;
pub const R_USB_PORT2_DISABLE: usize = 0x0050;

/// Transmit sub-channels of DMA channel 8.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubChannel {
    Ctrl = 0,
    Bulk = 1,
    Intr = 2,
    Isoc = 3,
}

/// Current (first) endpoint descriptor of a sub-channel.
pub const fn R_DMA_CH8_SUB_EP(sub: SubChannel) -> usize {
    0x0100 + (0x10 * sub as usize)
}
pub const fn R_DMA_CH8_SUB_CMD(sub: SubChannel) -> usize {
    0x0104 + (0x10 * sub as usize)
}
pub const fn R_DMA_CH8_SUB_CLR_INTR(sub: SubChannel) -> usize {
    0x0108 + (0x10 * sub as usize)
}

pub const R_DMA_CH9_FIRST: usize = 0x0140;
pub const R_DMA_CH9_CMD: usize = 0x0144;
pub const R_DMA_CH9_STATUS: usize = 0x0148;
pub const R_DMA_CH9_CLR_INTR: usize = 0x014C;

pub const DMA_CMD_HOLD: u32 = 0;
pub const DMA_CMD_START: u32 = 1;
pub const DMA_CMD_CONTINUE: u32 = 3;
pub const DMA_CMD_RESET: u32 = 4;

pub const FM_NUMBER_MASK: u32 = 0x7ff;

bitflags! {
    /// Interrupt causes, shared by the mask set/clear/read registers.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct UsbIrq: u32 {
        const ISO_EOF = 1 << 0;
        const INTR_EOF = 1 << 1;
        const ISO_EOT = 1 << 2;
        const INTR_EOT = 1 << 3;
        const CTL_EOT = 1 << 4;
        const BULK_EOT = 1 << 5;
        const EPID_ATTN = 1 << 6;
        const SOF = 1 << 7;
        const PORT_STATUS = 1 << 8;
        const CTL_STATUS = 1 << 9;
    }

    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct UsbStatus: u32 {
        const RUNNING = 1 << 0;
        const STARTED = 1 << 1;
        const HOST_MODE = 1 << 2;
        const DEVICE_MODE = 1 << 3;
        const PERROR = 1 << 4;
        const OURUN = 1 << 5;
    }

    /// Raw layout of `R_USB_RH_PORT_STATUS_n`.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct PortReg: u32 {
        const CONNECTED = 1 << 0;
        const ENABLED = 1 << 1;
        const SUSPENDED = 1 << 2;
        const RESET = 1 << 3;
        const LOW_SPEED = 1 << 4;
        const OVERRUN = 1 << 5;
    }
}

pub const COMMAND_BUSY: u32 = 1 << 31;
pub const COMMAND_PORT_SEL_SHIFT: u32 = 28;
pub const COMMAND_PORT_CMD_SHIFT: u32 = 26;

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortCommand {
    Reset = 0,
    Disable = 1,
    Suspend = 2,
    Resume = 3,
}

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CtrlCommand {
    Reset = 0,
    Deconfig = 1,
    HostConfig = 2,
    DevConfig = 3,
    HostNop = 4,
    HostRun = 5,
    HostNoRun = 6,
}

/// Encodes a value for `R_USB_COMMAND`. Port `0` selects no port.
pub fn usb_command(port: u8, port_cmd: PortCommand, ctrl_cmd: CtrlCommand) -> u32 {
    ((port as u32 & 0x3) << COMMAND_PORT_SEL_SHIFT)
        | ((port_cmd as u32) << COMMAND_PORT_CMD_SHIFT)
        | ctrl_cmd as u32
}

pub const fn port_status_reg(port: usize) -> usize {
    if port == 0 {
        R_USB_RH_PORT_STATUS_1
    } else {
        R_USB_RH_PORT_STATUS_2
    }
}

pub const fn port_disable_reg(port: usize) -> usize {
    if port == 0 {
        R_USB_PORT1_DISABLE
    } else {
        R_USB_PORT2_DISABLE
    }
}

/// Completion code the controller leaves in an endpoint table row.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EptError {
    NoError = 0,
    Stall = 1,
    BusError = 2,
    BufferError = 3,
}

impl EptError {
    pub fn from_u8(value: u8) -> Self {
        match value & 0x3 {
            0 => EptError::NoError,
            1 => EptError::Stall,
            2 => EptError::BusError,
            _ => EptError::BufferError,
        }
    }
}

/// Error counters saturate at this value; the row then reports no error
/// but the transfer has to be treated as failed.
pub const EPT_ERROR_COUNT_LIMIT: u8 = 3;

/// One row of the hardware endpoint table, as seen through `R_USB_EPT_DATA`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EptRow {
    pub valid: bool,
    pub hold: bool,
    pub error_count_in: u8,
    pub t_in: bool,
    pub low_speed: bool,
    pub port: u8,
    pub error_code: EptError,
    pub t_out: bool,
    pub error_count_out: u8,
    pub max_len: u8,
    pub ep: u8,
    pub dev: u8,
}

impl Default for EptRow {
    fn default() -> Self {
        Self {
            valid: false,
            hold: false,
            error_count_in: 0,
            t_in: false,
            low_speed: false,
            port: 0,
            error_code: EptError::NoError,
            t_out: false,
            error_count_out: 0,
            max_len: 0,
            ep: 0,
            dev: 0,
        }
    }
}

impl EptRow {
    pub fn from_u32(val: u32) -> Self {
        Self {
            dev: (val & 0x7f) as u8,
            ep: ((val >> 7) & 0xf) as u8,
            max_len: ((val >> 11) & 0x7f) as u8,
            error_count_out: ((val >> 19) & 0x3) as u8,
            t_out: (val >> 21) & 1 != 0,
            error_code: EptError::from_u8(((val >> 22) & 0x3) as u8),
            port: ((val >> 24) & 0x3) as u8,
            low_speed: (val >> 26) & 1 != 0,
            t_in: (val >> 27) & 1 != 0,
            error_count_in: ((val >> 28) & 0x3) as u8,
            hold: (val >> 30) & 1 != 0,
            valid: (val >> 31) & 1 != 0,
        }
    }

    pub fn to_u32(self) -> u32 {
        (self.dev as u32 & 0x7f)
            | ((self.ep as u32 & 0xf) << 7)
            | ((self.max_len as u32 & 0x7f) << 11)
            | ((self.error_count_out as u32 & 0x3) << 19)
            | ((self.t_out as u32) << 21)
            | ((self.error_code as u32) << 22)
            | ((self.port as u32 & 0x3) << 24)
            | ((self.low_speed as u32) << 26)
            | ((self.t_in as u32) << 27)
            | ((self.error_count_in as u32 & 0x3) << 28)
            | ((self.hold as u32) << 30)
            | ((self.valid as u32) << 31)
    }

    pub fn retries_exhausted(&self) -> bool {
        self.error_count_in == EPT_ERROR_COUNT_LIMIT || self.error_count_out == EPT_ERROR_COUNT_LIMIT
    }
}

/// Access to the controller's 32-bit registers.
///
/// Reads take `&mut self` because several registers (the attention mask,
/// the masked interrupt cause) clear on read.
pub trait Registers {
    fn read(&mut self, offset: usize) -> u32;
    fn write(&mut self, offset: usize, value: u32);

    fn read_ept(&mut self, index: u8) -> EptRow {
        self.write(R_USB_EPT_INDEX, index as u32);
        EptRow::from_u32(self.read(R_USB_EPT_DATA))
    }

    fn write_ept(&mut self, index: u8, row: EptRow) {
        self.write(R_USB_EPT_INDEX, index as u32);
        self.write(R_USB_EPT_DATA, row.to_u32());
    }
}

/// Memory mapped register block.
pub struct Mmio {
    base_addr: usize,
}

impl Mmio {
    /// # Safety
    /// `base_addr` must map the controller's register block for as long as
    /// the returned value is used.
    pub unsafe fn new(base_addr: *mut ()) -> Self {
        Self {
            base_addr: base_addr as usize,
        }
    }

    fn ptr(&self, offset: usize) -> *mut u32 {
        (self.base_addr + offset) as *mut u32
    }
}

impl Registers for Mmio {
    fn read(&mut self, offset: usize) -> u32 {
        unsafe { core::ptr::read_volatile(self.ptr(offset)) }
    }

    fn write(&mut self, offset: usize, value: u32) {
        unsafe { core::ptr::write_volatile(self.ptr(offset), value) }
    }
}
