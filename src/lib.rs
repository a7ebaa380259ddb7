#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]
//!
//! USB full-speed device driver for STM32-style controllers with packet
//! memory and toggle-on-write endpoint registers.
//!
//! ## About
//!
//! The device presents itself as a CDC virtual serial port and carries
//! a small page flashing protocol on its bulk endpoint. A bootloader
//! uses it to receive a new firmware image from the host and write it
//! into its own program memory, page by page.
//!
//! The driver has three endpoints:
//!
//! * endpoint 0 - control transfers, standard requests and the CDC
//! line coding and control line state requests,
//! * endpoint 1 - bulk, flashing protocol (see [`loader`]),
//! * endpoint 2 - interrupt, CDC notifications (unused).
//!
//! This library contains no board support. The register block is reached
//! through [`UsbRegisters`], program memory through [`FlashIO`] and
//! descriptor tables through [`DeviceDescriptors`], all supplied by the
//! user. [`Stm32UsbRegisters`] implements [`UsbRegisters`] for STM32F1
//! devices.
//!
//! ### Limitations
//!
//! * One configuration, one control, one bulk and one interrupt endpoint.
//! No isochronous transfers.
//!
//! * Control endpoint buffers are 64 bytes. Longer descriptors are sent
//! in several packets.
//!
//! * The driver does not enable or mask the USB interrupt. All methods of
//! [`UsbVcp`] must be called from the USB interrupt handler or with the
//! interrupt masked.
//!
//! ## Example
//!
//! ```no_run
//! use usbd_vcp_loader::*;
//!
//! // Program memory driver. Erase and write are synchronous.
//!
//! struct Flash;
//!
//! impl FlashIO for Flash {
//!     const BASE_ADDRESS: u32 = 0x0800_2000;
//!     const PAGE_SIZE: u32 = 1024;
//!
//!     fn erase_page(&mut self, address: u32) {
//!         // unlock flash, set PER, write FAR, start, wait for BSY
//!     }
//!
//!     fn write_data(&mut self, address: u32, data: &[u16]) {
//!         // set PG, write half-words, wait for BSY
//!     }
//! }
//!
//! static DEVICE: [u8; 18] = [
//!     18, 1, 0x00, 0x02, 0x02, 0x00, 0x00, 64, 0x83, 0x04, 0x40, 0x57, 0x00, 0x02, 1, 2, 3, 1,
//! ];
//! static CONFIGURATION: [u8; 9] = [9, 2, 9, 0, 0, 1, 0, 0x80, 50];
//! static LANG_ID: [u8; 4] = [4, 3, 0x09, 0x04];
//! static STRINGS: [&[u8]; 1] = [&LANG_ID];
//!
//! let descriptors = StaticDescriptors::new(&DEVICE, &CONFIGURATION, &STRINGS).unwrap();
//! let hw = unsafe { Stm32UsbRegisters::stm32f103() };
//!
//! let mut usb = UsbVcp::new(hw, Flash, descriptors);
//! usb.init();
//!
//! // From the USB_LP_CAN1_RX0 interrupt handler:
//! usb.on_interrupt();
//!
//! if usb.loader().session().is_complete() {
//!     // jump to the new firmware
//! }
//! ```
//!

pub mod control;
pub mod descriptor;
pub mod device;
pub mod endpoint;
pub mod loader;
pub mod pma;
pub mod registers;

#[doc(inline)]
pub use crate::control::{ControlPipe, DeviceState, LineCoding, SetupPacket};
#[doc(inline)]
pub use crate::descriptor::{DeviceDescriptors, StaticDescriptors};
#[doc(inline)]
pub use crate::device::UsbVcp;
#[doc(inline)]
pub use crate::endpoint::{EpStatus, Endpoint};
#[doc(inline)]
pub use crate::loader::{
    CommandError, CommandRecord, FlashIO, FlashLoader, FlashSession, StatusCode,
};
#[doc(inline)]
pub use crate::registers::{Stm32UsbRegisters, UsbRegisters};
