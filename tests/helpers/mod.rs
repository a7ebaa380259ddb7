#![allow(dead_code)]
use std::collections::BTreeMap;

use usbd_vcp_loader::*;

use crate::mockusb::{EPErr, TestRegisters, MAX_PACKET};

pub const FLASH_BASE: u32 = 0x0800_2000;
pub const FLASH_PAGE_SIZE: u32 = 1024;
pub const FLASH_PAGES: usize = 8;

pub const CTRL: usize = 0;
pub const DATA: usize = 1;
pub const COMM: usize = 2;

// bmRequestType
pub const DEVICE_TO_HOST: u8 = 0x80;
pub const HOST_TO_DEVICE: u8 = 0x00;
pub const TYPE_CLASS: u8 = 0x20;
pub const TYPE_VENDOR: u8 = 0x40;
pub const TO_INTERFACE: u8 = 0x01;
pub const TO_ENDPOINT: u8 = 0x02;
pub const TO_OTHER: u8 = 0x03;

pub static DEVICE: [u8; 18] = [
    18,   // bLength
    1,    // bDescriptorType
    0x00, 0x02, // bcdUSB
    0x02, // bDeviceClass (CDC)
    0x00, 0x00, // bDeviceSubClass, bDeviceProtocol
    64,   // bMaxPacketSize0
    0x83, 0x04, // idVendor
    0x40, 0x57, // idProduct
    0x00, 0x02, // bcdDevice
    1, 2, 3, // iManufacturer, iProduct, iSerialNumber
    1,    // bNumConfigurations
];

pub static CONFIGURATION: [u8; 67] = [
    // configuration
    9, 2, 67, 0, 2, 1, 0, 0x80, 50,
    // communication interface
    9, 4, 0, 0, 1, 0x02, 0x02, 0x01, 0,
    // header, call management, ACM, union
    5, 0x24, 0x00, 0x10, 0x01,
    5, 0x24, 0x01, 0x00, 0x01,
    4, 0x24, 0x02, 0x02,
    5, 0x24, 0x06, 0x00, 0x01,
    // notification endpoint 2 IN
    7, 5, 0x82, 0x03, 64, 0, 0xFF,
    // data interface
    9, 4, 1, 0, 2, 0x0A, 0x00, 0x00, 0,
    // bulk endpoint 1 OUT and IN
    7, 5, 0x01, 0x02, 64, 0, 0,
    7, 5, 0x81, 0x02, 64, 0, 0,
];

const fn ascii_string<const N: usize>(s: &str) -> [u8; N] {
    let bytes = s.as_bytes();
    let mut out = [0u8; N];
    out[0] = N as u8;
    out[1] = 3;
    let mut i = 0;
    while i < bytes.len() && 3 + 2 * i < N {
        out[2 + 2 * i] = bytes[i];
        i += 1;
    }
    out
}

pub static LANG_ID: [u8; 4] = [4, 3, 0x09, 0x04];
pub static MANUFACTURER: [u8; 12] = ascii_string("Maple");
pub static PRODUCT: [u8; 30] = ascii_string("USB VCP Loader");
// exactly one full packet
pub static SERIAL: [u8; 64] = ascii_string("0123456789ABCDEFGHIJKLMNOPQRSTU");

pub static STRINGS: [&[u8]; 4] = [&LANG_ID, &MANUFACTURER, &PRODUCT, &SERIAL];

/// RAM-backed program memory. Writes can only clear bits, like NOR flash.
pub struct TestFlash {
    pub memory: Vec<u8>,
    pub erased: Vec<u32>,
    pub writes: BTreeMap<u32, usize>,
}

impl TestFlash {
    pub fn new() -> Self {
        Self {
            memory: vec![0x00; FLASH_PAGES * FLASH_PAGE_SIZE as usize],
            erased: Vec::new(),
            writes: BTreeMap::new(),
        }
    }

    pub fn page(&self, page: usize) -> &[u8] {
        let size = FLASH_PAGE_SIZE as usize;
        &self.memory[page * size..(page + 1) * size]
    }

    fn offset(address: u32) -> usize {
        assert!(address >= FLASH_BASE, "address below flash base");
        (address - FLASH_BASE) as usize
    }
}

impl FlashIO for TestFlash {
    const BASE_ADDRESS: u32 = FLASH_BASE;
    const PAGE_SIZE: u32 = FLASH_PAGE_SIZE;

    fn erase_page(&mut self, address: u32) {
        assert_eq!(address % FLASH_PAGE_SIZE, 0, "erase of unaligned page");
        let offset = Self::offset(address);
        self.memory[offset..offset + FLASH_PAGE_SIZE as usize].fill(0xFF);
        self.erased.push(address);
    }

    fn write_data(&mut self, address: u32, data: &[u16]) {
        assert_eq!(address % 2, 0, "unaligned flash write");
        let offset = Self::offset(address);
        for (i, unit) in data.iter().enumerate() {
            let [lo, hi] = unit.to_le_bytes();
            self.memory[offset + 2 * i] &= lo;
            self.memory[offset + 2 * i + 1] &= hi;
        }
        self.writes.insert(address, data.len());
    }
}

pub type TestDevice = UsbVcp<TestRegisters, TestFlash, StaticDescriptors>;

pub fn descriptors() -> StaticDescriptors {
    StaticDescriptors::new(&DEVICE, &CONFIGURATION, &STRINGS).expect("valid descriptors")
}

/// Device after power-up, not yet enumerated.
pub fn new_device() -> TestDevice {
    let mut usb = UsbVcp::new(TestRegisters::new(), TestFlash::new(), descriptors());
    usb.init();
    usb
}

pub fn setup_packet(request_type: u8, request: u8, value: u16, index: u16, length: u16) -> [u8; 8] {
    let v = value.to_le_bytes();
    let i = index.to_le_bytes();
    let l = length.to_le_bytes();
    [request_type, request, v[0], v[1], i[0], i[1], l[0], l[1]]
}

/// Control transfer with an IN data stage.
pub fn control_read(
    usb: &mut TestDevice,
    request_type: u8,
    request: u8,
    value: u16,
    index: u16,
    length: u16,
) -> Result<Vec<u8>, EPErr> {
    let setup = setup_packet(DEVICE_TO_HOST | request_type, request, value, index, length);
    usb.hw_mut().host_setup(&setup);
    usb.on_interrupt();

    let mut data = Vec::new();
    loop {
        let packet = usb.hw_mut().host_in(CTRL)?;
        usb.on_interrupt();
        let short = packet.len() < MAX_PACKET;
        data.extend_from_slice(&packet);
        if short || data.len() >= length as usize {
            break;
        }
    }

    usb.hw_mut().host_out(CTRL, &[])?;
    usb.on_interrupt();

    Ok(data)
}

/// Control transfer with an optional OUT data stage.
pub fn control_write(
    usb: &mut TestDevice,
    request_type: u8,
    request: u8,
    value: u16,
    index: u16,
    data: &[u8],
) -> Result<(), EPErr> {
    let setup = setup_packet(
        HOST_TO_DEVICE | request_type,
        request,
        value,
        index,
        data.len() as u16,
    );
    usb.hw_mut().host_setup(&setup);
    usb.on_interrupt();

    for chunk in data.chunks(MAX_PACKET) {
        usb.hw_mut().host_out(CTRL, chunk)?;
        usb.on_interrupt();
    }

    let status = usb.hw_mut().host_in(CTRL)?;
    assert!(status.is_empty(), "status stage must be zero length");
    usb.on_interrupt();

    Ok(())
}

/// Enumerate at `address` with configuration 1.
pub fn enumerate(usb: &mut TestDevice, address: u8) {
    usb.hw_mut().bus_reset();
    usb.on_interrupt();
    control_read(usb, 0, 6, 0x0100, 0, 64).expect("device descriptor");
    control_write(usb, 0, 5, address as u16, 0, &[]).expect("set address");
    control_write(usb, 0, 9, 1, 0, &[]).expect("set configuration");
}

pub fn bulk_out(usb: &mut TestDevice, data: &[u8]) -> Result<(), EPErr> {
    usb.hw_mut().host_out(DATA, data)?;
    usb.on_interrupt();
    Ok(())
}

pub fn bulk_in(usb: &mut TestDevice) -> Result<Vec<u8>, EPErr> {
    let data = usb.hw_mut().host_in(DATA)?;
    usb.on_interrupt();
    Ok(data)
}

/// Send a command record and return the device's answer.
pub fn command(usb: &mut TestDevice, record: &[u8]) -> Vec<u8> {
    bulk_out(usb, record).expect("bulk OUT accepted");
    bulk_in(usb).expect("bulk IN answer")
}

pub fn session_header(pages: u16) -> [u8; 8] {
    CommandRecord::new(loader::CMD_SESSION_SIZE, pages, 0).to_bytes()
}

pub fn page_header(len: u16) -> [u8; 8] {
    CommandRecord::new(loader::CMD_PAGE_HEADER, 0, len).to_bytes()
}

/// Deterministic payload for page `page`.
pub fn page_data(page: usize, len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 + page * 31) as u8).collect()
}
