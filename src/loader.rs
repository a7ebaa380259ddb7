//! Page flashing protocol over the bulk endpoint.
//!
//! The host first announces the number of pages with a session header,
//! then sends each page as a page header followed by raw data packets.
//! Headers are fixed-size [`CommandRecord`]s and are echoed back when
//! accepted; a rejected packet is answered with a single [`StatusCode`]
//! byte and leaves the session where it was.
//!
//! ```text
//! host                                   device
//!  | -- session header (0x20, pages) -->  |
//!  | <-------------- echo ---------------  |
//!  | -- page header (0x21, data_len) -->  |  erase page
//!  | <-------------- echo ---------------  |
//!  | -- data ... data ----------------->  |  write
//!  | -- page header (0x21, data_len) -->  |  ...
//! ```

use crate::endpoint::{self, Endpoint, EP_BUFFER_SIZE};
use crate::pma;
use crate::registers::UsbRegisters;

/// Command id of a session header; `page` holds the total page count.
pub const CMD_SESSION_SIZE: u8 = 0x20;

/// Command id of a page header; `data_len` holds the page payload length.
pub const CMD_PAGE_HEADER: u8 = 0x21;

/// CRC-16/CCITT-FALSE (polynomial 0x1021, initial value 0xFFFF).
pub fn crc16(data: &[u8]) -> u16 {
    data.iter().fold(0xFFFF, |crc, &byte| {
        let mut crc = crc ^ ((byte as u16) << 8);
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ 0x1021
            } else {
                crc << 1
            };
        }
        crc
    })
}

/// Reasons a command record is rejected.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommandError {
    /// Packet size differs from [`CommandRecord::LEN`], or a page header
    /// announces an empty or oversized page.
    WrongLength,
    /// CRC does not match the record.
    WrongCrc,
    /// Valid record, but not the one expected in the current state.
    WrongId,
}

/// Codes sent to the host on the bulk IN endpoint.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatusCode {
    /// No error.
    NoError = 0,
    /// Command record has the wrong length.
    CmdWrongLength = 1,
    /// Command record CRC check failed.
    CmdWrongCrc = 2,
    /// Unexpected command id.
    CmdWrongId = 3,
}

impl From<CommandError> for StatusCode {
    fn from(err: CommandError) -> Self {
        match err {
            CommandError::WrongLength => StatusCode::CmdWrongLength,
            CommandError::WrongCrc => StatusCode::CmdWrongCrc,
            CommandError::WrongId => StatusCode::CmdWrongId,
        }
    }
}

/// Fixed-size command record.
///
/// Wire layout, little endian: `id`, one zero pad byte, `page`,
/// `data_len`, `crc`. The CRC covers the first six bytes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CommandRecord {
    /// Command id, [`CMD_SESSION_SIZE`] or [`CMD_PAGE_HEADER`].
    pub id: u8,
    /// Page count of a session header.
    pub page: u16,
    /// Payload length of a page header.
    pub data_len: u16,
    /// CRC-16 of the record.
    pub crc: u16,
}

impl CommandRecord {
    /// Size of a record on the wire.
    pub const LEN: usize = 8;

    /// Build a record with a valid CRC.
    pub fn new(id: u8, page: u16, data_len: u16) -> Self {
        let mut record = Self {
            id,
            page,
            data_len,
            crc: 0,
        };
        record.crc = crc16(&record.to_bytes()[..6]);
        record
    }

    /// Decode and check a received packet.
    pub fn parse(data: &[u8]) -> Result<Self, CommandError> {
        let bytes: [u8; Self::LEN] = data.try_into().map_err(|_| CommandError::WrongLength)?;

        let record = Self {
            id: bytes[0],
            page: u16::from_le_bytes([bytes[2], bytes[3]]),
            data_len: u16::from_le_bytes([bytes[4], bytes[5]]),
            crc: u16::from_le_bytes([bytes[6], bytes[7]]),
        };

        if crc16(&bytes[..6]) != record.crc {
            return Err(CommandError::WrongCrc);
        }

        Ok(record)
    }

    /// Encode for transmission.
    pub fn to_bytes(&self) -> [u8; Self::LEN] {
        let page = self.page.to_le_bytes();
        let len = self.data_len.to_le_bytes();
        let crc = self.crc.to_le_bytes();
        [self.id, 0, page[0], page[1], len[0], len[1], crc[0], crc[1]]
    }

    fn expect(data: &[u8], id: u8) -> Result<Self, CommandError> {
        let record = Self::parse(data)?;
        if record.id != id {
            return Err(CommandError::WrongId);
        }
        Ok(record)
    }
}

/// Program memory used as flashing target.
///
/// Both operations are synchronous and are called from the USB interrupt.
pub trait FlashIO {
    /// Address of page 0.
    const BASE_ADDRESS: u32;

    /// Size of one page in bytes.
    const PAGE_SIZE: u32;

    /// Erase the page starting at `address`.
    fn erase_page(&mut self, address: u32);

    /// Program `data` starting at `address`. `address` is always 16-bit
    /// aligned.
    fn write_data(&mut self, address: u32, data: &[u16]);
}

/// Protocol state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// Waiting for the session header.
    WaitSizeHeader,
    /// Waiting for the header of the next page.
    WaitDataHeader,
    /// Receiving page data.
    ReceivingPage,
    /// All announced pages are written.
    Done,
}

/// Progress of a flashing session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FlashSession {
    state: SessionState,
    total_pages: u16,
    current_page: u16,
    page_offset: u32,
    page_len: u32,
    carry: Option<u8>,
    last_record: Option<CommandRecord>,
}

impl FlashSession {
    /// Session waiting for its size header.
    pub const fn new() -> Self {
        Self {
            state: SessionState::WaitSizeHeader,
            total_pages: 0,
            current_page: 0,
            page_offset: 0,
            page_len: 0,
            carry: None,
            last_record: None,
        }
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Number of pages announced by the session header.
    pub fn total_pages(&self) -> u16 {
        self.total_pages
    }

    /// Index of the page being received, equal to the number of pages
    /// already written.
    pub fn current_page(&self) -> u16 {
        self.current_page
    }

    /// Bytes received for the current page.
    pub fn page_offset(&self) -> u32 {
        self.page_offset
    }

    /// Announced length of the current page.
    pub fn page_len(&self) -> u32 {
        self.page_len
    }

    /// A page header was accepted and its data is being received.
    pub fn header_accepted(&self) -> bool {
        self.state == SessionState::ReceivingPage
    }

    /// Last accepted command record.
    pub fn last_record(&self) -> Option<CommandRecord> {
        self.last_record
    }

    /// All announced pages are written.
    pub fn is_complete(&self) -> bool {
        self.state == SessionState::Done
    }
}

impl Default for FlashSession {
    fn default() -> Self {
        Self::new()
    }
}

/// Bulk endpoint handler running the flashing protocol.
pub struct FlashLoader<F: FlashIO> {
    flash: F,
    session: FlashSession,
}

impl<F: FlashIO> FlashLoader<F> {
    /// Create a loader writing to `flash`.
    pub fn new(flash: F) -> Self {
        Self {
            flash,
            session: FlashSession::new(),
        }
    }

    /// Session progress.
    pub fn session(&self) -> &FlashSession {
        &self.session
    }

    /// Flash backend.
    pub fn flash(&self) -> &F {
        &self.flash
    }

    /// Mutable flash backend.
    pub fn flash_mut(&mut self) -> &mut F {
        &mut self.flash
    }

    /// Forget the session, on bus reset.
    pub fn reset(&mut self) {
        self.session = FlashSession::new();
    }

    /// Handle an OUT transaction on the bulk endpoint.
    ///
    /// Reception is re-armed before a page erase so that the host can
    /// queue the first data packet while the page is being erased.
    pub fn on_bulk_out<H: UsbRegisters>(&mut self, hw: &mut H) {
        let mut buf = [0u8; EP_BUFFER_SIZE];
        let n = pma::read(hw, Endpoint::Data, &mut buf);

        let erase = match self.process(&buf[..n]) {
            Ok(Some(record)) => {
                pma::write(hw, Endpoint::Data, &record.to_bytes());
                record.id == CMD_PAGE_HEADER
            }
            Ok(None) => false,
            Err(err) => {
                let code = StatusCode::from(err);
                log::debug!("bulk packet rejected: {:?} in {:?}", code, self.session.state);
                pma::write(hw, Endpoint::Data, &[code as u8]);
                false
            }
        };

        endpoint::mark_rx_done(hw, Endpoint::Data);

        if erase {
            let address = self.page_address();
            log::debug!("erase page {} at {:#010x}", self.session.current_page, address);
            self.flash.erase_page(address);
        }
    }

    /// Handle a completed IN transaction on the bulk endpoint.
    pub fn on_bulk_in<H: UsbRegisters>(&mut self, _hw: &mut H) {
        log::trace!("bulk IN done");
    }

    fn process(&mut self, packet: &[u8]) -> Result<Option<CommandRecord>, CommandError> {
        match self.session.state {
            SessionState::WaitSizeHeader => {
                let record = CommandRecord::expect(packet, CMD_SESSION_SIZE)?;
                if record.page > 0 {
                    log::info!("flashing session, {} pages", record.page);
                    self.session.total_pages = record.page;
                    self.session.state = SessionState::WaitDataHeader;
                } else {
                    log::warn!("session header without pages");
                }
                self.session.last_record = Some(record);
                Ok(Some(record))
            }
            SessionState::WaitDataHeader => {
                let record = CommandRecord::expect(packet, CMD_PAGE_HEADER)?;
                let len = record.data_len as u32;
                if len == 0 || len > F::PAGE_SIZE {
                    return Err(CommandError::WrongLength);
                }
                self.session.page_len = len;
                self.session.page_offset = 0;
                self.session.carry = None;
                self.session.state = SessionState::ReceivingPage;
                self.session.last_record = Some(record);
                Ok(Some(record))
            }
            SessionState::ReceivingPage => {
                self.write_page_data(packet);
                Ok(None)
            }
            SessionState::Done => {
                CommandRecord::parse(packet)?;
                Err(CommandError::WrongId)
            }
        }
    }

    fn write_page_data(&mut self, data: &[u8]) {
        let room = F::PAGE_SIZE.saturating_sub(self.session.page_offset) as usize;
        let len = data.len().min(room);
        let page_done = self.session.page_offset + data.len() as u32 >= self.session.page_len;

        // odd byte left over from the previous packet goes first
        let mut bytes = [0u8; EP_BUFFER_SIZE + 1];
        let mut n = 0;
        if let Some(byte) = self.session.carry.take() {
            bytes[0] = byte;
            n = 1;
        }
        let start = self.session.page_offset - n as u32;
        bytes[n..n + len].copy_from_slice(&data[..len]);
        n += len;

        if n % 2 != 0 && !page_done {
            n -= 1;
            self.session.carry = Some(bytes[n]);
        }

        if n > 0 {
            let mut units = [0u16; EP_BUFFER_SIZE / 2 + 1];
            let count = (n + 1) / 2;
            for (unit, pair) in units.iter_mut().zip(bytes[..n].chunks(2)) {
                *unit = match *pair {
                    [lo, hi] => u16::from_le_bytes([lo, hi]),
                    [lo] => u16::from_le_bytes([lo, 0xFF]),
                    _ => 0xFFFF,
                };
            }
            self.flash.write_data(self.page_address() + start, &units[..count]);
        }

        self.session.page_offset += data.len() as u32;

        if self.session.page_offset >= self.session.page_len {
            self.session.current_page += 1;
            self.session.page_offset = 0;
            self.session.page_len = 0;
            self.session.state = if self.session.current_page >= self.session.total_pages {
                log::info!("flashing complete, {} pages", self.session.current_page);
                SessionState::Done
            } else {
                SessionState::WaitDataHeader
            };
        }
    }

    fn page_address(&self) -> u32 {
        F::BASE_ADDRESS + self.session.current_page as u32 * F::PAGE_SIZE
    }
}
