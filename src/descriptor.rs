//! Descriptor tables served by the control endpoint.
//!
//! The tables themselves belong to the application. The driver only reads
//! their length fields.

use usb_device::descriptor::descriptor_type;
use usb_device::UsbError;

/// Descriptor type of DEVICE_QUALIFIER, requested by high-speed aware hosts.
pub const DEVICE_QUALIFIER: u8 = 6;

const DEVICE_DESCRIPTOR_LEN: usize = 18;
const CONFIGURATION_HEADER_LEN: usize = 9;

/// Source of descriptor tables and static device properties.
///
/// # Example
///
/// ```
/// use usbd_vcp_loader::DeviceDescriptors;
///
/// struct Tables;
///
/// static DEVICE: [u8; 18] = [
///     18, 1, 0x00, 0x02, 0x02, 0x00, 0x00, 64, 0x83, 0x04, 0x40, 0x57, 0x00, 0x02, 1, 2, 3, 1,
/// ];
/// static CONFIGURATION: [u8; 9] = [9, 2, 9, 0, 0, 1, 0, 0x80, 50];
///
/// impl DeviceDescriptors for Tables {
///     const SELF_POWERED: bool = true;
///
///     fn device(&self) -> &'static [u8] {
///         &DEVICE
///     }
///
///     fn configuration(&self) -> &'static [u8] {
///         &CONFIGURATION
///     }
///
///     fn string(&self, _index: u8) -> Option<&'static [u8]> {
///         None
///     }
/// }
/// ```
pub trait DeviceDescriptors {
    /// Reported in the self-powered bit of a device GET_STATUS.
    const SELF_POWERED: bool = false;

    /// Packet size of the control endpoint. Must match `bMaxPacketSize0`
    /// of the device descriptor and must not exceed 64.
    const MAX_PACKET_SIZE_0: usize = 64;

    /// Device descriptor.
    fn device(&self) -> &'static [u8];

    /// Configuration descriptor followed by all interface, class and
    /// endpoint descriptors; `wTotalLength` covers all of them.
    fn configuration(&self) -> &'static [u8];

    /// String descriptor `index`, `None` if there is no such string.
    fn string(&self, index: u8) -> Option<&'static [u8]>;
}

/// Natural length of a device descriptor, from its `bLength` field.
pub fn device_len(descriptor: &[u8]) -> usize {
    descriptor
        .first()
        .map_or(0, |&len| (len as usize).min(descriptor.len()))
}

/// Natural length of a configuration descriptor set, from `wTotalLength`.
pub fn configuration_len(descriptor: &[u8]) -> usize {
    match descriptor.get(2..4) {
        Some(&[lo, hi]) => (u16::from_le_bytes([lo, hi]) as usize).min(descriptor.len()),
        _ => 0,
    }
}

/// Natural length of a string descriptor, from its `bLength` field.
pub fn string_len(descriptor: &[u8]) -> usize {
    device_len(descriptor)
}

/// [`DeviceDescriptors`] backed by static byte tables.
#[derive(Clone, Copy)]
pub struct StaticDescriptors {
    device: &'static [u8],
    configuration: &'static [u8],
    strings: &'static [&'static [u8]],
}

impl StaticDescriptors {
    /// Check the tables and wrap them.
    ///
    /// Returns [`UsbError::ParseError`] if a table is shorter than its own
    /// length field or carries the wrong descriptor type.
    pub fn new(
        device: &'static [u8],
        configuration: &'static [u8],
        strings: &'static [&'static [u8]],
    ) -> Result<Self, UsbError> {
        if device.len() < DEVICE_DESCRIPTOR_LEN
            || device[0] as usize != DEVICE_DESCRIPTOR_LEN
            || device[1] != descriptor_type::DEVICE
        {
            return Err(UsbError::ParseError);
        }

        if configuration.len() < CONFIGURATION_HEADER_LEN
            || configuration[1] != descriptor_type::CONFIGURATION
            || (u16::from_le_bytes([configuration[2], configuration[3]]) as usize)
                > configuration.len()
        {
            return Err(UsbError::ParseError);
        }

        for s in strings {
            if s.len() < 2 || s[1] != descriptor_type::STRING || s[0] as usize > s.len() {
                return Err(UsbError::ParseError);
            }
        }

        Ok(Self {
            device,
            configuration,
            strings,
        })
    }
}

impl DeviceDescriptors for StaticDescriptors {
    fn device(&self) -> &'static [u8] {
        self.device
    }

    fn configuration(&self) -> &'static [u8] {
        self.configuration
    }

    fn string(&self, index: u8) -> Option<&'static [u8]> {
        self.strings.get(index as usize).copied()
    }
}
