//! Endpoint register model.
//!
//! Status fields of the endpoint registers are toggle-on-write: writing 1
//! flips a bit, writing 0 leaves it alone. A transition to a target status
//! is therefore expressed as the XOR delta between the current and the
//! target value, computed by the pure [`status_write`] function.

use tock_registers::fields::Field;
use tock_registers::LocalRegisterCopy;
use usb_device::UsbDirection;

use crate::registers::{bits, UsbRegisters, EPR, EPR_NO_TOGGLE};

/// Size of every endpoint buffer in packet memory, in bytes.
pub const EP_BUFFER_SIZE: usize = 64;

/// Offset of the buffer descriptor table in packet memory.
pub const BTABLE_OFFSET: u16 = 0x00;

/// COUNTn_RX value announcing a 64 byte receive buffer (2 blocks of 32 bytes).
pub const RX_COUNT_BLOCKS: u16 = (1 << 15) | (1 << 10);

/// Mask of the received byte count in COUNTn_RX.
pub const RX_COUNT_MASK: u16 = 0x03FF;

/// Logical endpoints of the device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Endpoint {
    /// Endpoint 0, control transfers.
    Ctrl = 0,
    /// Endpoint 1, bulk data used by the flashing protocol.
    Data = 1,
    /// Endpoint 2, CDC notification (interrupt) endpoint.
    Comm = 2,
}

impl Endpoint {
    /// All endpoints in register order.
    pub const ALL: [Endpoint; 3] = [Endpoint::Ctrl, Endpoint::Data, Endpoint::Comm];

    /// Endpoint number, also the index of its USB_EPnR register.
    pub fn index(self) -> usize {
        self as usize
    }

    /// Endpoint address in `direction`.
    pub fn address(self, direction: UsbDirection) -> u8 {
        self as u8 | direction as u8
    }

    /// Look an endpoint up by number; the direction bit of an endpoint
    /// address is ignored.
    pub fn from_number(number: u8) -> Option<Self> {
        match number & 0x0F {
            0 => Some(Endpoint::Ctrl),
            1 => Some(Endpoint::Data),
            2 => Some(Endpoint::Comm),
            _ => None,
        }
    }

    /// Packet memory offset of the transmit buffer.
    pub fn tx_offset(self) -> u16 {
        0x40 + (self as u16) * 0x80
    }

    /// Packet memory offset of the receive buffer.
    pub fn rx_offset(self) -> u16 {
        self.tx_offset() + EP_BUFFER_SIZE as u16
    }

    fn btable_entry(self) -> u16 {
        BTABLE_OFFSET + (self as u16) * 8
    }

    /// Packet memory offset of ADDRn_TX.
    pub fn tx_addr_entry(self) -> u16 {
        self.btable_entry()
    }

    /// Packet memory offset of COUNTn_TX.
    pub fn tx_count_entry(self) -> u16 {
        self.btable_entry() + 2
    }

    /// Packet memory offset of ADDRn_RX.
    pub fn rx_addr_entry(self) -> u16 {
        self.btable_entry() + 4
    }

    /// Packet memory offset of COUNTn_RX.
    pub fn rx_count_entry(self) -> u16 {
        self.btable_entry() + 6
    }

    fn type_bits(self) -> u16 {
        let ep_type = match self {
            Endpoint::Ctrl => EPR::EP_TYPE::Control,
            Endpoint::Data => EPR::EP_TYPE::Bulk,
            Endpoint::Comm => EPR::EP_TYPE::Interrupt,
        };
        bits(ep_type + EPR::EA.val(self as u16))
    }
}

/// Status of one direction of an endpoint.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EpStatus {
    /// All requests are ignored.
    Disabled = 0,
    /// Requests are answered with STALL.
    Stall = 1,
    /// Requests are answered with NAK.
    Nak = 2,
    /// The endpoint accepts (OUT) or has data for (IN) the next transaction.
    Valid = 3,
}

impl EpStatus {
    fn from_bits(bits: u16) -> Self {
        match bits & 0b11 {
            0 => EpStatus::Disabled,
            1 => EpStatus::Stall,
            2 => EpStatus::Nak,
            _ => EpStatus::Valid,
        }
    }
}

fn stat_field(direction: UsbDirection) -> Field<u16, EPR::Register> {
    match direction {
        UsbDirection::Out => EPR::STAT_RX,
        UsbDirection::In => EPR::STAT_TX,
    }
}

/// Compute the register value that moves the `direction` status of an
/// endpoint from its state in `current` to `target`.
///
/// The other direction's status, both data toggle bits and pending
/// completion flags are left untouched by the written value.
pub fn status_write(current: u16, direction: UsbDirection, target: EpStatus) -> u16 {
    let field = stat_field(direction);
    let transition = (target as u16 & field.mask) << field.shift;
    let preserve = EPR_NO_TOGGLE | (field.mask << field.shift);
    (current ^ transition) & preserve
}

/// Decode the `direction` status from an endpoint register value.
pub fn status(current: u16, direction: UsbDirection) -> EpStatus {
    let reg: LocalRegisterCopy<u16, EPR::Register> = LocalRegisterCopy::new(current);
    EpStatus::from_bits(reg.read(stat_field(direction)))
}

/// Current status of one direction of `ep`.
pub fn get_status<H: UsbRegisters>(hw: &H, ep: Endpoint, direction: UsbDirection) -> EpStatus {
    status(hw.read_epr(ep.index()), direction)
}

/// Move one direction of `ep` to `target`.
pub fn set_status<H: UsbRegisters>(
    hw: &mut H,
    ep: Endpoint,
    direction: UsbDirection,
    target: EpStatus,
) {
    let current = hw.read_epr(ep.index());
    hw.write_epr(ep.index(), status_write(current, direction, target));
}

/// Stall both directions of `ep`, OUT first.
pub fn stall<H: UsbRegisters>(hw: &mut H, ep: Endpoint) {
    log::trace!("stall {:?}", ep);
    set_status(hw, ep, UsbDirection::Out, EpStatus::Stall);
    set_status(hw, ep, UsbDirection::In, EpStatus::Stall);
}

/// Clear a stall: reception becomes VALID, transmission NAK.
pub fn unstall<H: UsbRegisters>(hw: &mut H, ep: Endpoint) {
    log::trace!("unstall {:?}", ep);
    set_status(hw, ep, UsbDirection::Out, EpStatus::Valid);
    set_status(hw, ep, UsbDirection::In, EpStatus::Nak);
}

/// Stall a single direction given as an endpoint address (bit 7 set for IN).
pub fn stall_address<H: UsbRegisters>(hw: &mut H, address: u8) {
    if let Some(ep) = Endpoint::from_number(address) {
        let direction = UsbDirection::from(address);
        log::trace!("stall {:?} {:?}", ep, direction);
        set_status(hw, ep, direction, EpStatus::Stall);
    }
}

/// `true` if either direction of `ep` is stalled.
pub fn is_stalled<H: UsbRegisters>(hw: &H, ep: Endpoint) -> bool {
    let current = hw.read_epr(ep.index());
    status(current, UsbDirection::Out) == EpStatus::Stall
        || status(current, UsbDirection::In) == EpStatus::Stall
}

/// Re-arm reception: RX status becomes VALID.
pub fn mark_rx_done<H: UsbRegisters>(hw: &mut H, ep: Endpoint) {
    set_status(hw, ep, UsbDirection::Out, EpStatus::Valid);
}

/// Hand the transmit buffer to the controller: TX status becomes VALID.
pub fn mark_tx_ready<H: UsbRegisters>(hw: &mut H, ep: Endpoint) {
    set_status(hw, ep, UsbDirection::In, EpStatus::Valid);
}

/// Clear the completion flag of one direction, keeping the other flag and
/// all toggle bits.
pub fn clear_ctr<H: UsbRegisters>(hw: &mut H, ep: Endpoint, direction: UsbDirection) {
    let current = hw.read_epr(ep.index());
    let flag = match direction {
        UsbDirection::Out => EPR::CTR_RX.mask << EPR::CTR_RX.shift,
        UsbDirection::In => EPR::CTR_TX.mask << EPR::CTR_TX.shift,
    };
    hw.write_epr(ep.index(), current & !flag & EPR_NO_TOGGLE);
}

/// `true` if the last reception on `ep` was a SETUP transaction.
pub fn is_setup<H: UsbRegisters>(hw: &H, ep: Endpoint) -> bool {
    let reg: LocalRegisterCopy<u16, EPR::Register> = LocalRegisterCopy::new(hw.read_epr(ep.index()));
    reg.is_set(EPR::SETUP)
}

/// Program the buffer descriptor table and the endpoint registers.
///
/// Every endpoint gets its type and address, reception VALID and
/// transmission NAK.
pub fn init_endpoints<H: UsbRegisters>(hw: &mut H) {
    for ep in Endpoint::ALL {
        hw.write_pma(ep.tx_addr_entry(), ep.tx_offset());
        hw.write_pma(ep.tx_count_entry(), 0);
        hw.write_pma(ep.rx_addr_entry(), ep.rx_offset());
        hw.write_pma(ep.rx_count_entry(), RX_COUNT_BLOCKS);
    }
    hw.write_btable(BTABLE_OFFSET);

    for ep in Endpoint::ALL {
        hw.write_epr(ep.index(), ep.type_bits());
        set_status(hw, ep, UsbDirection::Out, EpStatus::Valid);
        set_status(hw, ep, UsbDirection::In, EpStatus::Nak);
    }
}
