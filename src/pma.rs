//! Packet memory transfers.
//!
//! Packet memory is accessed in 16-bit units. Bytes are packed low byte
//! first; an odd tail byte occupies the low half of the last unit.

use crate::endpoint::{self, Endpoint, EP_BUFFER_SIZE, RX_COUNT_MASK};
use crate::registers::UsbRegisters;

/// Number of bytes received by the last OUT or SETUP transaction on `ep`.
pub fn rx_count<H: UsbRegisters>(hw: &H, ep: Endpoint) -> usize {
    (hw.read_pma(ep.rx_count_entry()) & RX_COUNT_MASK) as usize
}

/// Copy received bytes of `ep` into `dest`.
///
/// At most `dest.len()` bytes, the received count and the buffer size are
/// copied. Reception on the control endpoint is re-armed right after the
/// copy. Returns the number of bytes copied.
pub fn read<H: UsbRegisters>(hw: &mut H, ep: Endpoint, dest: &mut [u8]) -> usize {
    let count = dest.len().min(rx_count(hw, ep)).min(EP_BUFFER_SIZE);
    let base = ep.rx_offset();

    for (i, chunk) in dest[..count].chunks_mut(2).enumerate() {
        let unit = hw.read_pma(base + (i as u16) * 2).to_le_bytes();
        chunk.copy_from_slice(&unit[..chunk.len()]);
    }

    if ep == Endpoint::Ctrl {
        endpoint::mark_rx_done(hw, ep);
    }

    count
}

/// Queue `src` for transmission on `ep`.
///
/// At most one buffer worth of data is queued. The transmit count is set
/// and the endpoint is marked ready even for an empty `src`. Returns the
/// number of bytes queued.
pub fn write<H: UsbRegisters>(hw: &mut H, ep: Endpoint, src: &[u8]) -> usize {
    let count = src.len().min(EP_BUFFER_SIZE);
    let base = ep.tx_offset();

    for (i, chunk) in src[..count].chunks(2).enumerate() {
        let unit = match *chunk {
            [lo, hi] => u16::from_le_bytes([lo, hi]),
            [lo] => lo as u16,
            _ => 0,
        };
        hw.write_pma(base + (i as u16) * 2, unit);
    }

    hw.write_pma(ep.tx_count_entry(), count as u16);
    endpoint::mark_tx_ready(hw, ep);

    log::trace!("{:?} queued {} bytes", ep, count);
    count
}
