//! Register access for the full-speed USB device controller.
//!
//! The controller is reached through [`UsbRegisters`]. The driver never
//! touches memory directly, which keeps every register transition testable
//! against an emulated controller.

use core::ptr;

use tock_registers::fields::FieldValue;
use tock_registers::interfaces::{Readable, Writeable};
use tock_registers::registers::ReadWrite;
use tock_registers::{register_bitfields, register_structs, LocalRegisterCopy, RegisterLongName};

register_bitfields![u16,
    /// Endpoint register (USB_EPnR)
    pub EPR [
        /// Correct transfer for reception, cleared by writing 0
        CTR_RX OFFSET(15) NUMBITS(1) [],
        /// Data toggle for reception, toggled by writing 1
        DTOG_RX OFFSET(14) NUMBITS(1) [],
        /// Reception status, toggled by writing 1
        STAT_RX OFFSET(12) NUMBITS(2) [
            Disabled = 0,
            Stall = 1,
            Nak = 2,
            Valid = 3
        ],
        /// Last completed reception was a SETUP transaction
        SETUP OFFSET(11) NUMBITS(1) [],
        EP_TYPE OFFSET(9) NUMBITS(2) [
            Bulk = 0,
            Control = 1,
            Isochronous = 2,
            Interrupt = 3
        ],
        EP_KIND OFFSET(8) NUMBITS(1) [],
        /// Correct transfer for transmission, cleared by writing 0
        CTR_TX OFFSET(7) NUMBITS(1) [],
        /// Data toggle for transmission, toggled by writing 1
        DTOG_TX OFFSET(6) NUMBITS(1) [],
        /// Transmission status, toggled by writing 1
        STAT_TX OFFSET(4) NUMBITS(2) [
            Disabled = 0,
            Stall = 1,
            Nak = 2,
            Valid = 3
        ],
        /// Endpoint address
        EA OFFSET(0) NUMBITS(4) []
    ],

    /// Interrupt status register (USB_ISTR)
    pub ISTR [
        CTR OFFSET(15) NUMBITS(1) [],
        PMAOVR OFFSET(14) NUMBITS(1) [],
        ERR OFFSET(13) NUMBITS(1) [],
        WKUP OFFSET(12) NUMBITS(1) [],
        SUSP OFFSET(11) NUMBITS(1) [],
        RESET OFFSET(10) NUMBITS(1) [],
        SOF OFFSET(9) NUMBITS(1) [],
        ESOF OFFSET(8) NUMBITS(1) [],
        /// Set when the pending transfer is host to device
        DIR OFFSET(4) NUMBITS(1) [],
        EP_ID OFFSET(0) NUMBITS(4) []
    ],

    /// Control register (USB_CNTR)
    pub CNTR [
        CTRM OFFSET(15) NUMBITS(1) [],
        PMAOVRM OFFSET(14) NUMBITS(1) [],
        ERRM OFFSET(13) NUMBITS(1) [],
        WKUPM OFFSET(12) NUMBITS(1) [],
        SUSPM OFFSET(11) NUMBITS(1) [],
        RESETM OFFSET(10) NUMBITS(1) [],
        SOFM OFFSET(9) NUMBITS(1) [],
        ESOFM OFFSET(8) NUMBITS(1) [],
        RESUME OFFSET(4) NUMBITS(1) [],
        FSUSP OFFSET(3) NUMBITS(1) [],
        LP_MODE OFFSET(2) NUMBITS(1) [],
        PDWN OFFSET(1) NUMBITS(1) [],
        FRES OFFSET(0) NUMBITS(1) []
    ],

    /// Device address register (USB_DADDR)
    pub DADDR [
        EF OFFSET(7) NUMBITS(1) [],
        ADD OFFSET(0) NUMBITS(7) []
    ]
];

/// Bits of an endpoint register that are written back unchanged.
///
/// Contains neither the toggle fields (`DTOG_x`, `STAT_x`) nor the reserved
/// bits, and keeps `CTR_RX`/`CTR_TX` at their current value so that a
/// write of 1 leaves a pending completion flag alone.
pub const EPR_NO_TOGGLE: u16 = 0x8F8F;

/// Number of endpoint registers.
pub const EPR_COUNT: usize = 8;

/// Interrupt flags in ISTR that are cleared by writing 0.
pub const ISTR_EVENTS: u16 = 0x7F00;

/// Raw value of a register with only the fields in `value` set.
pub fn bits<R: RegisterLongName>(value: FieldValue<u16, R>) -> u16 {
    let mut reg: LocalRegisterCopy<u16, R> = LocalRegisterCopy::new(0);
    reg.modify(value);
    reg.get()
}

/// Hardware collaborator used by the driver.
///
/// All values are the low 16 bits of the controller registers. Packet
/// memory is addressed in bytes as seen by the controller and accessed
/// in whole 16-bit units; `offset` is always even.
pub trait UsbRegisters {
    /// Read endpoint register `index` (USB_EPnR).
    fn read_epr(&self, index: usize) -> u16;

    /// Write endpoint register `index`. Toggle and clear-on-zero fields
    /// follow the hardware write semantics.
    fn write_epr(&mut self, index: usize, value: u16);

    /// Read the interrupt status register.
    fn read_istr(&self) -> u16;

    /// Write the interrupt status register; event flags written as 0 are cleared.
    fn write_istr(&mut self, value: u16);

    /// Read the control register.
    fn read_cntr(&self) -> u16;

    /// Write the control register.
    fn write_cntr(&mut self, value: u16);

    /// Write the device address register.
    fn write_daddr(&mut self, value: u16);

    /// Write the buffer table offset register.
    fn write_btable(&mut self, value: u16);

    /// Read one 16-bit unit of packet memory.
    fn read_pma(&self, offset: u16) -> u16;

    /// Write one 16-bit unit of packet memory.
    fn write_pma(&mut self, offset: u16, value: u16);
}

register_structs! {
    /// STM32F1 USB full-speed device registers
    pub UsbRegisterBlock {
        (0x00 => epr: [ReadWrite<u32>; EPR_COUNT]),
        (0x20 => _reserved0),
        (0x40 => cntr: ReadWrite<u32>),
        (0x44 => istr: ReadWrite<u32>),
        (0x48 => _reserved1),
        (0x4C => daddr: ReadWrite<u32>),
        (0x50 => btable: ReadWrite<u32>),
        (0x54 => @END),
    }
}

/// Base address of the USB registers on STM32F103.
pub const STM32F1_USB_BASE: usize = 0x4000_5C00;

/// Base address of the packet memory on STM32F103.
pub const STM32F1_PMA_BASE: usize = 0x4000_6000;

/// Memory-mapped [`UsbRegisters`] for STM32F1 devices.
///
/// The packet memory is 16 bits wide but is mapped with a 32-bit stride
/// on the APB bus, so unit `n` lives at `pma_base + 4 * n`.
pub struct Stm32UsbRegisters {
    regs: &'static UsbRegisterBlock,
    pma_base: usize,
}

impl Stm32UsbRegisters {
    /// Create a register accessor.
    ///
    /// # Safety
    ///
    /// `usb_base` and `pma_base` must point to the USB peripheral and its
    /// packet memory, and no other code may access them while this value
    /// exists, except with the USB interrupt disabled.
    pub unsafe fn new(usb_base: usize, pma_base: usize) -> Self {
        Self {
            regs: &*(usb_base as *const UsbRegisterBlock),
            pma_base,
        }
    }

    /// Accessor for the STM32F103 default addresses.
    ///
    /// # Safety
    ///
    /// See [`Stm32UsbRegisters::new`].
    pub unsafe fn stm32f103() -> Self {
        Self::new(STM32F1_USB_BASE, STM32F1_PMA_BASE)
    }

    fn pma_ptr(&self, offset: u16) -> *mut u32 {
        (self.pma_base + (offset as usize >> 1) * 4) as *mut u32
    }
}

impl UsbRegisters for Stm32UsbRegisters {
    fn read_epr(&self, index: usize) -> u16 {
        self.regs.epr[index].get() as u16
    }

    fn write_epr(&mut self, index: usize, value: u16) {
        self.regs.epr[index].set(value as u32);
    }

    fn read_istr(&self) -> u16 {
        self.regs.istr.get() as u16
    }

    fn write_istr(&mut self, value: u16) {
        self.regs.istr.set(value as u32);
    }

    fn read_cntr(&self) -> u16 {
        self.regs.cntr.get() as u16
    }

    fn write_cntr(&mut self, value: u16) {
        self.regs.cntr.set(value as u32);
    }

    fn write_daddr(&mut self, value: u16) {
        self.regs.daddr.set(value as u32);
    }

    fn write_btable(&mut self, value: u16) {
        self.regs.btable.set(value as u32);
    }

    fn read_pma(&self, offset: u16) -> u16 {
        // SAFETY: the constructor guarantees exclusive access to packet memory
        unsafe { ptr::read_volatile(self.pma_ptr(offset)) as u16 }
    }

    fn write_pma(&mut self, offset: u16, value: u16) {
        // SAFETY: the constructor guarantees exclusive access to packet memory
        unsafe { ptr::write_volatile(self.pma_ptr(offset), value as u32) }
    }
}
