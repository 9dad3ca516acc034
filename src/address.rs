use std::fmt;

use thiserror::Error;

/// Start of the console's main RAM.
pub const RAM_START: u32 = 0x8000_0000;
/// End (exclusive) of the console's main RAM.
pub const RAM_END: u32 = 0x8180_0000;

#[derive(Error, Debug, PartialEq, Eq, Clone)]
pub enum AddressError {
    #[error("Invalid address or offset: '{0}'")]
    Invalid(String),
    #[error("Address out of range: {0:#010x}")]
    OutOfRange(u32),
    #[error("DOL offsets cannot be converted without a section map: '{0}'")]
    UnmappedOffset(String),
}

/// Converts the address strings found in mods (DOL offsets or RAM addresses) into RAM
/// addresses. The executable's layout is owned by the caller, this crate only asks.
pub trait AddressNormalizer: fmt::Debug {
    fn normalize(&self, target: &str) -> Result<u32, AddressError>;

    /// Vanilla bytes at a RAM address, if the implementation has access to the executable.
    fn original_bytes(&self, _address: u32, _length: usize) -> Option<Vec<u8>> {
        None
    }
}

/// Parse `0x8000_1234`, `80001234` or `0x1234` style numbers.
pub fn parse_address(text: &str) -> Option<u32> {
    let text = text.trim();
    let digits = text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
        .unwrap_or(text);
    let digits: String = digits.chars().filter(|ch| *ch != '_').collect();
    if digits.is_empty() || digits.len() > 8 {
        return None;
    }
    u32::from_str_radix(&digits, 16).ok()
}

pub fn is_ram_address(address: u32) -> bool {
    (RAM_START..RAM_END).contains(&address)
}

/// Normalizer which only understands RAM addresses.
#[derive(Debug, Default, Clone, Copy)]
pub struct RamAddresses;

impl AddressNormalizer for RamAddresses {
    #[tracing::instrument]
    fn normalize(&self, target: &str) -> Result<u32, AddressError> {
        let address = parse_address(target).ok_or_else(|| AddressError::Invalid(target.into()))?;
        if is_ram_address(address) {
            Ok(address)
        } else if address < RAM_START {
            Err(AddressError::UnmappedOffset(target.into()))
        } else {
            Err(AddressError::OutOfRange(address))
        }
    }
}
