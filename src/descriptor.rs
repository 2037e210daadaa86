//! HID report descriptor for the emulated keyboard
//!
//! The device advertises a single keyboard application collection with one
//! 1-bit input field (the state of the "a" key) followed by 7 constant
//! padding bits. Reports carry no report ID.

/// Length in bytes of every input report the device sends
pub const REPORT_LEN: usize = 1;

/// Report ID used for every report (implicit, not sent on the wire)
pub const REPORT_ID: u8 = 0;

/// The advertised report descriptor. Host parsers must accept it unchanged.
pub const REPORT_DESCRIPTOR: [u8; 27] = [
    0x05, 0x01, // USAGE_PAGE (Generic Desktop)
    0x09, 0x06, // USAGE (Keyboard)
    0xa1, 0x01, // COLLECTION (Application)
    0x05, 0x07, //   USAGE_PAGE (Keyboard)
    0x09, 0x04, //   USAGE (Keyboard a and A)
    0x15, 0x00, //   LOGICAL_MINIMUM (0)
    0x25, 0x01, //   LOGICAL_MAXIMUM (1)
    0x75, 0x01, //   REPORT_SIZE (1)
    0x95, 0x01, //   REPORT_COUNT (1)
    0x81, 0x02, //   INPUT (Data,Var,Abs)
    0x75, 0x01, //   REPORT_SIZE (1)
    0x95, 0x07, //   REPORT_COUNT (7)
    0x81, 0x01, //   INPUT (Cnst,Ary,Abs)
    0xc0,       // END_COLLECTION
];

/// State of the single key carried in an input report
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyReport {
    Pressed,
    Released,
}

impl KeyReport {
    /// Wire bytes for this report. Bit 0 is the key state, bits 1-7 are padding.
    pub fn as_bytes(self) -> [u8; REPORT_LEN] {
        match self {
            KeyReport::Pressed => [0x01],
            KeyReport::Released => [0x00],
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            KeyReport::Pressed => "key down",
            KeyReport::Released => "key up",
        }
    }
}

/// Kind of a short descriptor item (bType field)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemKind {
    Main,
    Global,
    Local,
    Reserved,
}

/// A decoded short item from the report descriptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    /// Byte offset of the item prefix within the descriptor
    pub offset: usize,
    pub kind: ItemKind,
    /// bTag field (upper nibble of the prefix)
    pub tag: u8,
    /// Little-endian item payload, zero-extended
    pub data: u32,
    pub size: usize,
}

impl Item {
    /// Human readable name of the item, in HID Descriptor Tool style
    pub fn name(&self) -> &'static str {
        match (self.kind, self.tag) {
            (ItemKind::Main, 0x8) => "INPUT",
            (ItemKind::Main, 0x9) => "OUTPUT",
            (ItemKind::Main, 0xa) => "COLLECTION",
            (ItemKind::Main, 0xb) => "FEATURE",
            (ItemKind::Main, 0xc) => "END_COLLECTION",
            (ItemKind::Global, 0x0) => "USAGE_PAGE",
            (ItemKind::Global, 0x1) => "LOGICAL_MINIMUM",
            (ItemKind::Global, 0x2) => "LOGICAL_MAXIMUM",
            (ItemKind::Global, 0x7) => "REPORT_SIZE",
            (ItemKind::Global, 0x8) => "REPORT_ID",
            (ItemKind::Global, 0x9) => "REPORT_COUNT",
            (ItemKind::Local, 0x0) => "USAGE",
            (ItemKind::Local, 0x1) => "USAGE_MINIMUM",
            (ItemKind::Local, 0x2) => "USAGE_MAXIMUM",
            _ => "UNKNOWN",
        }
    }
}

/// Error produced when a descriptor cannot be decoded
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DescriptorError {
    #[error("item at offset {offset} is truncated")]
    Truncated { offset: usize },
    #[error("long items are not supported (offset {offset})")]
    LongItem { offset: usize },
}

/// Decode a report descriptor into its short items.
pub fn parse_items(descriptor: &[u8]) -> Result<Vec<Item>, DescriptorError> {
    let mut items = Vec::new();
    let mut offset = 0;

    while offset < descriptor.len() {
        let prefix = descriptor[offset];
        if prefix == 0xfe {
            return Err(DescriptorError::LongItem { offset });
        }

        let size = match prefix & 0x03 {
            3 => 4,
            n => n as usize,
        };
        let kind = match (prefix >> 2) & 0x03 {
            0 => ItemKind::Main,
            1 => ItemKind::Global,
            2 => ItemKind::Local,
            _ => ItemKind::Reserved,
        };

        let payload = descriptor
            .get(offset + 1..offset + 1 + size)
            .ok_or(DescriptorError::Truncated { offset })?;
        let data = payload
            .iter()
            .enumerate()
            .fold(0u32, |acc, (i, b)| acc | (u32::from(*b) << (8 * i)));

        items.push(Item {
            offset,
            kind,
            tag: prefix >> 4,
            data,
            size,
        });
        offset += 1 + size;
    }

    Ok(items)
}

/// The decoded items of [`REPORT_DESCRIPTOR`]
pub fn items() -> Vec<Item> {
    // The constant descriptor is well formed; see the tests below.
    parse_items(&REPORT_DESCRIPTOR).unwrap_or_default()
}

/// Total number of input bits declared by a descriptor
pub fn input_report_bits(items: &[Item]) -> u32 {
    let mut report_size = 0;
    let mut report_count = 0;
    let mut bits = 0;

    for item in items {
        match (item.kind, item.tag) {
            (ItemKind::Global, 0x7) => report_size = item.data,
            (ItemKind::Global, 0x9) => report_count = item.data,
            (ItemKind::Main, 0x8) => bits += report_size * report_count,
            _ => {}
        }
    }

    bits
}
