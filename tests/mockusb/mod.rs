#![allow(dead_code)]
use std::cmp::min;

use usbd_vcp_loader::registers::UsbRegisters;
use usbd_vcp_loader::EpStatus;

const CTR_RX: u16 = 0x8000;
const DTOG_RX: u16 = 0x4000;
const STAT_RX: u16 = 0x3000;
const SETUP: u16 = 0x0800;
const CTR_TX: u16 = 0x0080;
const DTOG_TX: u16 = 0x0040;
const STAT_TX: u16 = 0x0030;
const EP_RW: u16 = 0x070F;

const ISTR_CTR: u16 = 0x8000;
const ISTR_DIR: u16 = 0x0010;
const ISTR_EVENTS: u16 = 0x7F00;

pub const ISTR_WKUP: u16 = 0x1000;
pub const ISTR_SUSP: u16 = 0x0800;
pub const ISTR_RESET: u16 = 0x0400;

pub const PMA_SIZE: usize = 512;
pub const MAX_PACKET: usize = 64;

#[derive(Debug, PartialEq, Eq)]
pub enum EPErr {
    Stalled,
    Nak,
}

fn decode(bits: u16) -> EpStatus {
    match bits & 0b11 {
        0 => EpStatus::Disabled,
        1 => EpStatus::Stall,
        2 => EpStatus::Nak,
        _ => EpStatus::Valid,
    }
}

/// Emulated full-speed device controller.
///
/// Endpoint registers follow the hardware write rules: completion flags
/// are cleared by writing 0, status and data toggle bits flip when
/// written as 1, SETUP is read-only.
pub struct TestRegisters {
    epr: [u16; 8],
    events: u16,
    cntr: u16,
    daddr: u16,
    btable: u16,
    pma: [u16; PMA_SIZE / 2],
    pub epr_writes: Vec<(usize, u16)>,
}

impl TestRegisters {
    pub fn new() -> Self {
        Self {
            epr: [0; 8],
            events: 0,
            cntr: 0x0003,
            daddr: 0,
            btable: 0,
            pma: [0; PMA_SIZE / 2],
            epr_writes: Vec::new(),
        }
    }

    // Host side

    fn entry(&self, ep: usize, offset: u16) -> u16 {
        self.btable + (ep as u16) * 8 + offset
    }

    fn pma_unit(&self, offset: u16) -> u16 {
        self.pma[(offset as usize) / 2]
    }

    fn set_pma_unit(&mut self, offset: u16, value: u16) {
        self.pma[(offset as usize) / 2] = value;
    }

    fn set_stat(&mut self, ep: usize, mask: u16, status: EpStatus) {
        let shift = mask.trailing_zeros();
        self.epr[ep] = (self.epr[ep] & !mask) | ((status as u16) << shift);
    }

    fn fill_rx(&mut self, ep: usize, data: &[u8]) {
        let addr = self.pma_unit(self.entry(ep, 4));
        let count_entry = self.entry(ep, 6);
        for (i, chunk) in data.chunks(2).enumerate() {
            let unit = match *chunk {
                [lo, hi] => u16::from_le_bytes([lo, hi]),
                [lo] => lo as u16 | 0xAA00,
                _ => 0,
            };
            self.set_pma_unit(addr + (i as u16) * 2, unit);
        }
        let count = self.pma_unit(count_entry);
        self.set_pma_unit(count_entry, (count & !0x03FF) | data.len() as u16);
    }

    /// SETUP transaction on endpoint 0. Accepted regardless of RX status.
    pub fn host_setup(&mut self, packet: &[u8; 8]) {
        self.fill_rx(0, packet);
        self.epr[0] |= CTR_RX | SETUP;
        self.set_stat(0, STAT_RX, EpStatus::Nak);
    }

    /// OUT transaction with `data`.
    pub fn host_out(&mut self, ep: usize, data: &[u8]) -> Result<(), EPErr> {
        assert!(data.len() <= MAX_PACKET);
        match self.status_rx(ep) {
            EpStatus::Valid => {}
            EpStatus::Stall => return Err(EPErr::Stalled),
            _ => return Err(EPErr::Nak),
        }
        self.fill_rx(ep, data);
        self.epr[ep] = (self.epr[ep] | CTR_RX) & !SETUP;
        self.epr[ep] ^= DTOG_RX;
        self.set_stat(ep, STAT_RX, EpStatus::Nak);
        Ok(())
    }

    /// IN transaction, returns the packet sent by the device.
    pub fn host_in(&mut self, ep: usize) -> Result<Vec<u8>, EPErr> {
        match self.status_tx(ep) {
            EpStatus::Valid => {}
            EpStatus::Stall => return Err(EPErr::Stalled),
            _ => return Err(EPErr::Nak),
        }
        let addr = self.pma_unit(self.entry(ep, 0));
        let count = min(self.pma_unit(self.entry(ep, 2)) as usize & 0x03FF, MAX_PACKET);
        let mut data = Vec::with_capacity(count);
        for i in 0..count {
            let unit = self.pma_unit(addr + (i as u16 / 2) * 2);
            data.push(unit.to_le_bytes()[i % 2]);
        }
        self.epr[ep] |= CTR_TX;
        self.epr[ep] ^= DTOG_TX;
        self.set_stat(ep, STAT_TX, EpStatus::Nak);
        Ok(data)
    }

    /// Bus reset: endpoint registers and address are cleared.
    pub fn bus_reset(&mut self) {
        self.epr = [0; 8];
        self.daddr = 0;
        self.events |= ISTR_RESET;
    }

    /// Raise interrupt events without any other effect.
    pub fn raise(&mut self, events: u16) {
        self.events |= events & ISTR_EVENTS;
    }

    /// Overwrite an endpoint register, bypassing the write rules.
    pub fn force_epr(&mut self, ep: usize, value: u16) {
        self.epr[ep] = value;
    }

    pub fn suspend(&mut self) {
        self.events |= ISTR_SUSP;
    }

    pub fn wakeup(&mut self) {
        self.events |= ISTR_WKUP;
    }

    pub fn status_rx(&self, ep: usize) -> EpStatus {
        decode(self.epr[ep] >> 12)
    }

    pub fn status_tx(&self, ep: usize) -> EpStatus {
        decode(self.epr[ep] >> 4)
    }

    pub fn epr(&self, ep: usize) -> u16 {
        self.epr[ep]
    }

    pub fn daddr(&self) -> u16 {
        self.daddr
    }

    pub fn cntr(&self) -> u16 {
        self.cntr
    }

    pub fn btable(&self) -> u16 {
        self.btable
    }

    pub fn pending_events(&self) -> u16 {
        self.events
    }

    pub fn pma(&self, offset: u16) -> u16 {
        self.pma_unit(offset)
    }

    /// Put raw bytes into the receive buffer of `ep` without any
    /// register side effects.
    pub fn load_rx(&mut self, ep: usize, data: &[u8]) {
        self.fill_rx(ep, data);
    }
}

impl UsbRegisters for TestRegisters {
    fn read_epr(&self, index: usize) -> u16 {
        self.epr[index]
    }

    fn write_epr(&mut self, index: usize, value: u16) {
        self.epr_writes.push((index, value));
        let old = self.epr[index];
        let toggle = STAT_RX | DTOG_RX | STAT_TX | DTOG_TX;
        self.epr[index] = (old & value & (CTR_RX | CTR_TX))
            | ((old ^ value) & toggle)
            | (value & EP_RW)
            | (old & SETUP);
    }

    fn read_istr(&self) -> u16 {
        let mut istr = self.events;
        if let Some(ep) = self.epr.iter().position(|r| r & (CTR_RX | CTR_TX) != 0) {
            istr |= ISTR_CTR | ep as u16;
            if self.epr[ep] & CTR_RX != 0 {
                istr |= ISTR_DIR;
            }
        }
        istr
    }

    fn write_istr(&mut self, value: u16) {
        self.events &= value | !ISTR_EVENTS;
    }

    fn read_cntr(&self) -> u16 {
        self.cntr
    }

    fn write_cntr(&mut self, value: u16) {
        self.cntr = value;
    }

    fn write_daddr(&mut self, value: u16) {
        self.daddr = value;
    }

    fn write_btable(&mut self, value: u16) {
        self.btable = value;
    }

    fn read_pma(&self, offset: u16) -> u16 {
        assert_eq!(offset % 2, 0, "unaligned packet memory access");
        self.pma_unit(offset)
    }

    fn write_pma(&mut self, offset: u16, value: u16) {
        assert_eq!(offset % 2, 0, "unaligned packet memory access");
        self.set_pma_unit(offset, value);
    }
}
