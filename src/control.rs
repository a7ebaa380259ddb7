//! Control endpoint state machine.
//!
//! Handles SETUP packets on endpoint 0, answers standard requests and the
//! CDC serial class requests, and drives multi-packet IN data stages.
//!
//! A class request that carries data or has effects is handled in two
//! phases. The SETUP records the request and acknowledges it; the payload
//! is applied when the OUT data stage arrives, or, for requests without a
//! data stage, when the status stage completes. The commit happens at most
//! once per SETUP.

use usb_device::control::{Recipient, Request, RequestType};
use usb_device::descriptor::descriptor_type;
use usb_device::UsbDirection;

use crate::descriptor::{self, DeviceDescriptors, DEVICE_QUALIFIER};
use crate::endpoint::{self, Endpoint, EP_BUFFER_SIZE};
use crate::pma;
use crate::registers::UsbRegisters;

/// CDC SET_LINE_CODING request code.
pub const SET_LINE_CODING: u8 = 0x20;
/// CDC GET_LINE_CODING request code.
pub const GET_LINE_CODING: u8 = 0x21;
/// CDC SET_CONTROL_LINE_STATE request code.
pub const SET_CONTROL_LINE_STATE: u8 = 0x22;
/// CDC SEND_BREAK request code.
pub const SEND_BREAK: u8 = 0x23;

/// Header of a control transfer, as received in the SETUP stage.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SetupPacket {
    raw: [u8; 8],
}

impl SetupPacket {
    /// Size of a SETUP packet.
    pub const LEN: usize = 8;

    /// Wrap the raw bytes of a SETUP packet.
    pub fn from_bytes(raw: [u8; 8]) -> Self {
        Self { raw }
    }

    /// Raw packet bytes.
    pub fn as_bytes(&self) -> &[u8; 8] {
        &self.raw
    }

    /// Direction of the data stage.
    pub fn direction(&self) -> UsbDirection {
        UsbDirection::from(self.raw[0])
    }

    /// Request type (standard, class or vendor).
    pub fn request_type(&self) -> RequestType {
        match (self.raw[0] >> 5) & 0b11 {
            0 => RequestType::Standard,
            1 => RequestType::Class,
            2 => RequestType::Vendor,
            _ => RequestType::Reserved,
        }
    }

    /// Recipient of the request.
    pub fn recipient(&self) -> Recipient {
        match self.raw[0] & 0b1_1111 {
            0 => Recipient::Device,
            1 => Recipient::Interface,
            2 => Recipient::Endpoint,
            3 => Recipient::Other,
            _ => Recipient::Reserved,
        }
    }

    /// `bRequest`
    pub fn request(&self) -> u8 {
        self.raw[1]
    }

    /// `wValue`
    pub fn value(&self) -> u16 {
        u16::from_le_bytes([self.raw[2], self.raw[3]])
    }

    /// `wIndex`
    pub fn index(&self) -> u16 {
        u16::from_le_bytes([self.raw[4], self.raw[5]])
    }

    /// `wLength`
    pub fn length(&self) -> u16 {
        u16::from_le_bytes([self.raw[6], self.raw[7]])
    }
}

/// Standard request codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StandardRequest {
    /// GET_STATUS
    GetStatus,
    /// CLEAR_FEATURE
    ClearFeature,
    /// SET_FEATURE
    SetFeature,
    /// SET_ADDRESS
    SetAddress,
    /// GET_DESCRIPTOR
    GetDescriptor,
    /// SET_DESCRIPTOR, not supported
    SetDescriptor,
    /// GET_CONFIGURATION
    GetConfiguration,
    /// SET_CONFIGURATION
    SetConfiguration,
    /// GET_INTERFACE
    GetInterface,
    /// SET_INTERFACE
    SetInterface,
    /// SYNCH_FRAME, not supported
    SynchFrame,
    /// Codes 2 and 4, reserved by the USB specification
    Reserved(u8),
}

impl StandardRequest {
    /// Decode `bRequest` of a standard request. Returns `None` for codes
    /// above SYNCH_FRAME.
    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            Request::GET_STATUS => StandardRequest::GetStatus,
            Request::CLEAR_FEATURE => StandardRequest::ClearFeature,
            Request::SET_FEATURE => StandardRequest::SetFeature,
            Request::SET_ADDRESS => StandardRequest::SetAddress,
            Request::GET_DESCRIPTOR => StandardRequest::GetDescriptor,
            Request::SET_DESCRIPTOR => StandardRequest::SetDescriptor,
            Request::GET_CONFIGURATION => StandardRequest::GetConfiguration,
            Request::SET_CONFIGURATION => StandardRequest::SetConfiguration,
            Request::GET_INTERFACE => StandardRequest::GetInterface,
            Request::SET_INTERFACE => StandardRequest::SetInterface,
            Request::SYNCH_FRAME => StandardRequest::SynchFrame,
            2 | 4 => StandardRequest::Reserved(code),
            _ => return None,
        })
    }
}

/// CDC line coding, as exchanged by GET/SET_LINE_CODING.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LineCoding {
    /// Data terminal rate in bits per second.
    pub baud_rate: u32,
    /// 0 - 1 stop bit, 1 - 1.5 stop bits, 2 - 2 stop bits.
    pub stop_bits: u8,
    /// 0 - none, 1 - odd, 2 - even, 3 - mark, 4 - space.
    pub parity: u8,
    /// Number of data bits.
    pub data_bits: u8,
}

impl LineCoding {
    /// Size of the record on the wire.
    pub const LEN: usize = 7;

    /// Baud rate reported until the host sets one.
    pub const DEFAULT_BAUD_RATE: u32 = 115200;

    /// Decode a line coding record. Returns `None` if `data` is shorter
    /// than [`LineCoding::LEN`].
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        match *data.get(..Self::LEN)? {
            [b0, b1, b2, b3, stop_bits, parity, data_bits] => Some(Self {
                baud_rate: u32::from_le_bytes([b0, b1, b2, b3]),
                stop_bits,
                parity,
                data_bits,
            }),
            _ => None,
        }
    }

    /// Encode as a line coding record.
    pub fn to_bytes(&self) -> [u8; 7] {
        let b = self.baud_rate.to_le_bytes();
        [b[0], b[1], b[2], b[3], self.stop_bits, self.parity, self.data_bits]
    }
}

impl Default for LineCoding {
    fn default() -> Self {
        Self {
            baud_rate: Self::DEFAULT_BAUD_RATE,
            stop_bits: 0,
            parity: 0,
            data_bits: 8,
        }
    }
}

/// Device level state shared by the control pipe and the interrupt handler.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeviceState {
    /// Bus is suspended.
    pub suspended: bool,
    /// A nonzero configuration is selected.
    pub configured: bool,
    /// Address received by SET_ADDRESS, applied after the status stage.
    pub pending_address: Option<u8>,
}

/// Stage of the current control transfer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControlStage {
    /// No transfer in progress.
    Idle,
    /// Sending data to the host.
    DataIn,
    /// Waiting for data from the host.
    DataOut,
    /// Zero-length acknowledge queued, waiting for the host to read it.
    StatusIn,
    /// Data sent, waiting for the host's zero-length OUT.
    StatusOut,
}

#[derive(Clone, Copy, Debug)]
enum DataSource {
    Empty,
    Static(&'static [u8]),
    Scratch { buf: [u8; 8], len: usize },
}

impl DataSource {
    fn scratch(data: &[u8]) -> Self {
        let mut buf = [0u8; 8];
        let len = data.len().min(buf.len());
        buf[..len].copy_from_slice(&data[..len]);
        DataSource::Scratch { buf, len }
    }

    fn bytes(&self) -> &[u8] {
        match self {
            DataSource::Empty => &[],
            DataSource::Static(data) => *data,
            DataSource::Scratch { buf, len } => &buf[..*len],
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PendingClassRequest {
    LineCoding,
    ControlLineState { value: u16 },
    Break { duration: u16 },
}

/// State of the current or most recent control transfer.
#[derive(Clone, Copy, Debug)]
pub struct ControlTransferContext {
    configuration: u8,
    setup: SetupPacket,
    stage: ControlStage,
    source: DataSource,
    offset: usize,
    remaining: usize,
    packet_size: usize,
    needs_zlp: bool,
    remote_wakeup: bool,
    self_powered: bool,
}

impl ControlTransferContext {
    fn new(packet_size: usize, self_powered: bool) -> Self {
        Self {
            configuration: 0,
            setup: SetupPacket::default(),
            stage: ControlStage::Idle,
            source: DataSource::Empty,
            offset: 0,
            remaining: 0,
            packet_size: packet_size.clamp(8, EP_BUFFER_SIZE),
            needs_zlp: false,
            remote_wakeup: false,
            self_powered,
        }
    }

    /// Selected configuration value, 0 if not configured.
    pub fn configuration(&self) -> u8 {
        self.configuration
    }

    /// Last received SETUP packet.
    pub fn setup(&self) -> &SetupPacket {
        &self.setup
    }

    /// Current transfer stage.
    pub fn stage(&self) -> ControlStage {
        self.stage
    }

    /// Bytes of the IN data stage not yet queued.
    pub fn remaining(&self) -> usize {
        self.remaining
    }

    /// Packet size of the control endpoint.
    pub fn packet_size(&self) -> usize {
        self.packet_size
    }

    /// Remote wakeup enabled by the host.
    pub fn remote_wakeup(&self) -> bool {
        self.remote_wakeup
    }

    /// Device reports itself as self-powered.
    pub fn self_powered(&self) -> bool {
        self.self_powered
    }
}

/// Control endpoint handler.
pub struct ControlPipe {
    context: ControlTransferContext,
    line_coding: LineCoding,
    dtr_rts: u8,
    pending: Option<PendingClassRequest>,
}

impl ControlPipe {
    /// Create a handler for a control endpoint with `packet_size` bytes
    /// per packet.
    pub fn new(packet_size: usize, self_powered: bool) -> Self {
        Self {
            context: ControlTransferContext::new(packet_size, self_powered),
            line_coding: LineCoding::default(),
            dtr_rts: 0,
            pending: None,
        }
    }

    /// Drop any transfer in progress and return to configuration 0.
    /// Line coding and DTR/RTS are kept.
    pub fn reset(&mut self) {
        let ctx = &self.context;
        self.context = ControlTransferContext::new(ctx.packet_size, ctx.self_powered);
        self.pending = None;
    }

    /// Transfer state.
    pub fn context(&self) -> &ControlTransferContext {
        &self.context
    }

    /// Line coding last set by the host.
    pub fn line_coding(&self) -> LineCoding {
        self.line_coding
    }

    /// DTR/RTS byte, the high byte of the last SET_CONTROL_LINE_STATE value.
    pub fn dtr_rts(&self) -> u8 {
        self.dtr_rts
    }

    /// Handle a SETUP transaction.
    pub fn on_setup<H: UsbRegisters, D: DeviceDescriptors>(
        &mut self,
        hw: &mut H,
        descriptors: &D,
        state: &mut DeviceState,
    ) {
        let mut raw = [0u8; SetupPacket::LEN];
        let n = pma::read(hw, Endpoint::Ctrl, &mut raw);

        self.pending = None;
        self.context.stage = ControlStage::Idle;
        self.context.remaining = 0;
        self.context.needs_zlp = false;

        if n != SetupPacket::LEN {
            log::warn!("short setup packet, {} bytes", n);
            self.reject(hw);
            return;
        }

        self.context.setup = SetupPacket::from_bytes(raw);
        log::trace!("setup {:02x?}", raw);

        match self.context.setup.request_type() {
            RequestType::Standard => self.standard_request(hw, descriptors, state),
            RequestType::Class => self.class_request(hw),
            _ => {
                log::debug!("unsupported request type {:02x}", raw[0]);
                self.reject(hw);
            }
        }
    }

    /// Handle an OUT transaction on the control endpoint.
    pub fn on_out<H: UsbRegisters>(&mut self, hw: &mut H) {
        let mut buf = [0u8; EP_BUFFER_SIZE];
        let n = pma::read(hw, Endpoint::Ctrl, &mut buf);

        if self.context.setup.request_type() == RequestType::Class {
            self.commit(&buf[..n]);
        }

        self.context.stage = match self.context.stage {
            ControlStage::DataOut => ControlStage::StatusIn,
            ControlStage::StatusOut => ControlStage::Idle,
            stage => {
                log::trace!("control OUT in {:?}", stage);
                stage
            }
        };
    }

    /// Handle a completed IN transaction on the control endpoint.
    pub fn on_in<H: UsbRegisters>(&mut self, hw: &mut H) {
        match self.context.stage {
            ControlStage::DataIn => {
                if self.context.remaining > 0 {
                    log::trace!("control IN, {} left", self.context.remaining);
                    self.transmit(hw);
                } else if self.context.needs_zlp {
                    self.context.needs_zlp = false;
                    pma::write(hw, Endpoint::Ctrl, &[]);
                } else {
                    self.context.stage = ControlStage::StatusOut;
                }
            }
            ControlStage::StatusIn => {
                self.commit(&[]);
                self.context.stage = ControlStage::Idle;
            }
            _ => {}
        }
    }

    fn standard_request<H: UsbRegisters, D: DeviceDescriptors>(
        &mut self,
        hw: &mut H,
        descriptors: &D,
        state: &mut DeviceState,
    ) {
        let setup = self.context.setup;

        match StandardRequest::from_code(setup.request()) {
            Some(StandardRequest::GetStatus) => self.get_status(hw),
            Some(StandardRequest::ClearFeature) => self.set_feature(hw, false),
            Some(StandardRequest::SetFeature) => self.set_feature(hw, true),
            Some(StandardRequest::SetAddress) => {
                let address = (setup.value() & 0x7F) as u8;
                log::debug!("set address {}", address);
                state.pending_address = Some(address);
                self.ack(hw);
            }
            Some(StandardRequest::GetDescriptor) => self.get_descriptor(hw, descriptors),
            Some(StandardRequest::GetConfiguration) => {
                let configuration = [self.context.configuration];
                self.start_in(hw, DataSource::scratch(&configuration));
            }
            Some(StandardRequest::SetConfiguration) => {
                let value = setup.value() as u8;
                log::debug!("set configuration {}", value);
                if value == 0 {
                    state.configured = false;
                } else {
                    self.class_start(state);
                    state.configured = true;
                }
                self.context.configuration = value;
                self.ack(hw);
            }
            Some(StandardRequest::GetInterface) => {
                self.start_in(hw, DataSource::scratch(&[0]));
            }
            Some(StandardRequest::SetInterface) => {
                self.class_start(state);
                self.ack(hw);
            }
            request => {
                log::debug!("unsupported standard request {:?}", request);
                self.reject(hw);
            }
        }
    }

    fn get_status<H: UsbRegisters>(&mut self, hw: &mut H) {
        let setup = self.context.setup;
        let status: u16 = match setup.recipient() {
            Recipient::Device => {
                ((self.context.remote_wakeup as u16) << 1) | self.context.self_powered as u16
            }
            Recipient::Interface => 0,
            Recipient::Endpoint => match Endpoint::from_number(setup.index() as u8) {
                Some(ep) => endpoint::is_stalled(hw, ep) as u16,
                None => return self.reject(hw),
            },
            _ => return self.reject(hw),
        };
        self.start_in(hw, DataSource::scratch(&status.to_le_bytes()));
    }

    fn set_feature<H: UsbRegisters>(&mut self, hw: &mut H, set: bool) {
        let setup = self.context.setup;
        match setup.recipient() {
            Recipient::Device => {
                if setup.value() == Request::FEATURE_DEVICE_REMOTE_WAKEUP {
                    self.context.remote_wakeup = set;
                }
            }
            Recipient::Interface => {}
            Recipient::Endpoint => {
                if setup.value() == Request::FEATURE_ENDPOINT_HALT {
                    match Endpoint::from_number(setup.index() as u8) {
                        Some(ep) if set => endpoint::stall(hw, ep),
                        Some(ep) => endpoint::unstall(hw, ep),
                        None => return self.reject(hw),
                    }
                }
            }
            _ => return self.reject(hw),
        }
        self.ack(hw);
    }

    fn get_descriptor<H: UsbRegisters, D: DeviceDescriptors>(&mut self, hw: &mut H, descriptors: &D) {
        let value = self.context.setup.value();
        let (kind, index) = ((value >> 8) as u8, value as u8);

        let data = match kind {
            descriptor_type::DEVICE => {
                let d = descriptors.device();
                &d[..descriptor::device_len(d)]
            }
            descriptor_type::CONFIGURATION => {
                let d = descriptors.configuration();
                &d[..descriptor::configuration_len(d)]
            }
            descriptor_type::STRING => match descriptors.string(index) {
                Some(d) => &d[..descriptor::string_len(d)],
                None => {
                    log::debug!("no string descriptor {}", index);
                    return self.reject(hw);
                }
            },
            DEVICE_QUALIFIER => {
                log::trace!("device qualifier requested");
                return self.reject(hw);
            }
            _ => {
                log::debug!("unknown descriptor type {}", kind);
                return self.reject(hw);
            }
        };

        self.start_in(hw, DataSource::Static(data));
    }

    fn class_request<H: UsbRegisters>(&mut self, hw: &mut H) {
        let setup = self.context.setup;

        match setup.request() {
            GET_LINE_CODING => {
                let coding = self.line_coding.to_bytes();
                self.start_in(hw, DataSource::scratch(&coding));
                return;
            }
            SET_LINE_CODING => self.pending = Some(PendingClassRequest::LineCoding),
            SET_CONTROL_LINE_STATE => {
                self.pending = Some(PendingClassRequest::ControlLineState {
                    value: setup.value(),
                })
            }
            SEND_BREAK => {
                self.pending = Some(PendingClassRequest::Break {
                    duration: setup.value(),
                })
            }
            code => log::info!("unknown class request {:02x}, acknowledged", code),
        }

        self.ack(hw);
        if setup.direction() == UsbDirection::Out && setup.length() > 0 {
            self.context.stage = ControlStage::DataOut;
        }
    }

    fn commit(&mut self, data: &[u8]) {
        match self.pending.take() {
            Some(PendingClassRequest::LineCoding) => match LineCoding::from_bytes(data) {
                Some(coding) => {
                    log::debug!("line coding {:?}", coding);
                    self.line_coding = coding;
                }
                None => log::warn!("line coding record too short, {} bytes", data.len()),
            },
            Some(PendingClassRequest::ControlLineState { value }) => {
                self.dtr_rts = (value >> 8) as u8;
                log::debug!("dtr/rts {:02x}", self.dtr_rts);
            }
            Some(PendingClassRequest::Break { duration }) => {
                log::trace!("break {} ms", duration);
            }
            None => {}
        }
    }

    fn class_start(&mut self, state: &mut DeviceState) {
        log::trace!("class start");
        self.line_coding = LineCoding::default();
        self.dtr_rts = 0;
        state.pending_address = None;
    }

    fn start_in<H: UsbRegisters>(&mut self, hw: &mut H, source: DataSource) {
        if self.context.setup.direction() == UsbDirection::Out {
            log::warn!("IN data stage for a host to device request");
            self.context.stage = ControlStage::Idle;
            return;
        }

        let requested = self.context.setup.length() as usize;
        let total = source.bytes().len().min(requested);

        self.context.source = source;
        self.context.offset = 0;
        self.context.remaining = total;
        self.context.needs_zlp =
            total > 0 && total < requested && total % self.context.packet_size == 0;
        self.context.stage = ControlStage::DataIn;

        self.transmit(hw);
    }

    fn transmit<H: UsbRegisters>(&mut self, hw: &mut H) {
        let ctx = &mut self.context;
        let start = ctx.offset;
        let len = ctx.remaining.min(ctx.packet_size);
        let chunk = ctx.source.bytes().get(start..start + len).unwrap_or(&[]);
        let sent = pma::write(hw, Endpoint::Ctrl, chunk);

        ctx.offset += sent;
        ctx.remaining = ctx.remaining.saturating_sub(sent);
    }

    fn ack<H: UsbRegisters>(&mut self, hw: &mut H) {
        pma::write(hw, Endpoint::Ctrl, &[]);
        self.context.stage = ControlStage::StatusIn;
    }

    fn reject<H: UsbRegisters>(&mut self, hw: &mut H) {
        endpoint::stall_address(hw, Endpoint::Ctrl.address(UsbDirection::Out));
        endpoint::stall_address(hw, Endpoint::Ctrl.address(UsbDirection::In));
        self.context.stage = ControlStage::Idle;
    }
}
