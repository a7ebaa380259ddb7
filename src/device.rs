//! Interrupt dispatcher and device owner.

use tock_registers::LocalRegisterCopy;
use usb_device::device::UsbDeviceState;
use usb_device::UsbDirection;

use crate::control::{ControlPipe, DeviceState, LineCoding};
use crate::descriptor::DeviceDescriptors;
use crate::endpoint::{self, Endpoint};
use crate::loader::{FlashIO, FlashLoader};
use crate::registers::{
    bits, UsbRegisters, CNTR, DADDR, EPR, EPR_COUNT, EPR_NO_TOGGLE, ISTR, ISTR_EVENTS,
};

/// USB device with a CDC serial control interface and the page flashing
/// protocol on its bulk endpoint.
///
/// All state is owned here and is only modified from [`UsbVcp::on_interrupt`]
/// and [`UsbVcp::init`]. Callers sharing the value with other contexts must
/// mask the USB interrupt while accessing it.
pub struct UsbVcp<H: UsbRegisters, F: FlashIO, D: DeviceDescriptors> {
    hw: H,
    descriptors: D,
    control: ControlPipe,
    loader: FlashLoader<F>,
    state: DeviceState,
    address: u8,
}

impl<H: UsbRegisters, F: FlashIO, D: DeviceDescriptors> UsbVcp<H, F, D> {
    /// Create the device. The controller is not touched until
    /// [`UsbVcp::init`] is called.
    pub fn new(hw: H, flash: F, descriptors: D) -> Self {
        Self {
            hw,
            descriptors,
            control: ControlPipe::new(D::MAX_PACKET_SIZE_0, D::SELF_POWERED),
            loader: FlashLoader::new(flash),
            state: DeviceState::default(),
            address: 0,
        }
    }

    /// Reset the controller and bring up all endpoints at address 0.
    pub fn init(&mut self) {
        log::debug!("init endpoints");

        self.hw.write_cntr(bits(CNTR::FRES::SET));
        self.control.reset();
        self.loader.reset();
        self.state = DeviceState::default();
        self.address = 0;
        self.hw.write_cntr(0);

        endpoint::init_endpoints(&mut self.hw);

        self.hw.write_istr(0);
        self.hw.write_cntr(bits(
            CNTR::CTRM::SET + CNTR::RESETM::SET + CNTR::SUSPM::SET + CNTR::WKUPM::SET,
        ));
        self.hw.write_daddr(bits(DADDR::EF::SET + DADDR::ADD.val(0)));
    }

    /// USB interrupt handler.
    pub fn on_interrupt(&mut self) {
        let istr: LocalRegisterCopy<u16, ISTR::Register> =
            LocalRegisterCopy::new(self.hw.read_istr());
        let low_power = bits(CNTR::FSUSP::SET + CNTR::LP_MODE::SET);

        if istr.is_set(ISTR::WKUP) {
            log::debug!("wakeup");
            let cntr = self.hw.read_cntr();
            self.hw.write_cntr(cntr & !low_power);
            self.state.suspended = false;
        } else if istr.is_set(ISTR::SUSP) {
            log::debug!("suspend");
            self.state.suspended = true;
            let cntr = self.hw.read_cntr();
            self.hw.write_cntr(cntr | low_power);
        }

        self.hw.write_istr(!ISTR_EVENTS);

        if istr.is_set(ISTR::RESET) {
            log::debug!("bus reset");
            self.init();
            return;
        }

        loop {
            let istr: LocalRegisterCopy<u16, ISTR::Register> =
                LocalRegisterCopy::new(self.hw.read_istr());
            if !istr.is_set(ISTR::CTR) {
                break;
            }

            let number = istr.read(ISTR::EP_ID) as u8;
            let ep = match Endpoint::from_number(number) {
                Some(ep) => ep,
                None if (number as usize) < EPR_COUNT => {
                    log::warn!("transfer on unused endpoint {}", number);
                    let index = number as usize;
                    let flags = bits(EPR::CTR_RX::SET + EPR::CTR_TX::SET);
                    let epr = self.hw.read_epr(index);
                    self.hw.write_epr(index, epr & !flags & EPR_NO_TOGGLE);
                    continue;
                }
                None => break,
            };

            if istr.is_set(ISTR::DIR) {
                let setup = endpoint::is_setup(&self.hw, ep);
                endpoint::clear_ctr(&mut self.hw, ep, UsbDirection::Out);

                match ep {
                    Endpoint::Ctrl if setup => {
                        self.control
                            .on_setup(&mut self.hw, &self.descriptors, &mut self.state)
                    }
                    Endpoint::Ctrl => self.control.on_out(&mut self.hw),
                    Endpoint::Data => self.loader.on_bulk_out(&mut self.hw),
                    Endpoint::Comm => log::trace!("comm OUT"),
                }
            } else {
                if let Some(address) = self.state.pending_address.take() {
                    log::debug!("address {}", address);
                    self.hw.write_daddr(bits(DADDR::EF::SET + DADDR::ADD.val(address as u16)));
                    self.address = address;
                }

                endpoint::clear_ctr(&mut self.hw, ep, UsbDirection::In);

                match ep {
                    Endpoint::Ctrl => self.control.on_in(&mut self.hw),
                    Endpoint::Data => self.loader.on_bulk_in(&mut self.hw),
                    Endpoint::Comm => log::trace!("comm IN"),
                }
            }
        }
    }

    /// Device state in `usb-device` terms.
    pub fn state(&self) -> UsbDeviceState {
        if self.state.suspended {
            UsbDeviceState::Suspend
        } else if self.state.configured {
            UsbDeviceState::Configured
        } else if self.address != 0 {
            UsbDeviceState::Addressed
        } else {
            UsbDeviceState::Default
        }
    }

    /// Suspend, configuration and pending address flags.
    pub fn device_state(&self) -> &DeviceState {
        &self.state
    }

    /// Address currently programmed into the controller.
    pub fn address(&self) -> u8 {
        self.address
    }

    /// Line coding last set by the host.
    pub fn line_coding(&self) -> LineCoding {
        self.control.line_coding()
    }

    /// DTR/RTS byte, the high byte of the last SET_CONTROL_LINE_STATE value.
    pub fn dtr_rts(&self) -> u8 {
        self.control.dtr_rts()
    }

    /// Control endpoint handler.
    pub fn control(&self) -> &ControlPipe {
        &self.control
    }

    /// Bulk endpoint handler.
    pub fn loader(&self) -> &FlashLoader<F> {
        &self.loader
    }

    /// Flash backend.
    pub fn flash(&self) -> &F {
        self.loader.flash()
    }

    /// Mutable flash backend.
    pub fn flash_mut(&mut self) -> &mut F {
        self.loader.flash_mut()
    }

    /// Hardware access.
    pub fn hw(&self) -> &H {
        &self.hw
    }

    /// Mutable hardware access.
    pub fn hw_mut(&mut self) -> &mut H {
        &mut self.hw
    }
}
