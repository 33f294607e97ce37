use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::utils::{describe_status_word, format_hex_spaced};

/// One physical reader slot, identified by its PCSC reader name
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Terminal {
    pub name: String,
}

impl Terminal {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl fmt::Display for Terminal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// A card's answer to one command: response data plus the SW1/SW2 trailer.
///
/// Two responses are equal when every byte matches, which is what the
/// polling change test relies on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CardResponse {
    pub data: Vec<u8>,
    pub sw1: u8,
    pub sw2: u8,
}

impl CardResponse {
    pub fn new(data: Vec<u8>, sw1: u8, sw2: u8) -> Self {
        Self { data, sw1, sw2 }
    }

    /// Split a raw response into data and status word.
    /// Responses shorter than two bytes carry no status and map to `00 00`.
    pub fn from_bytes(raw: &[u8]) -> Self {
        match raw {
            [data @ .., sw1, sw2] => Self::new(data.to_vec(), *sw1, *sw2),
            _ => Self::new(raw.to_vec(), 0, 0),
        }
    }

    pub fn is_success(&self) -> bool {
        self.sw1 == 0x90 && self.sw2 == 0x00
    }

    pub fn status_word(&self) -> u16 {
        u16::from_be_bytes([self.sw1, self.sw2])
    }

    pub fn describe_status(&self) -> String {
        describe_status_word(self.sw1, self.sw2)
    }

    /// Data and status word back to back, as received from the card
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut raw = Vec::with_capacity(self.data.len() + 2);
        raw.extend_from_slice(&self.data);
        raw.push(self.sw1);
        raw.push(self.sw2);
        raw
    }
}

impl fmt::Display for CardResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.data.is_empty() {
            write!(f, "SW {:02X} {:02X}", self.sw1, self.sw2)
        } else {
            write!(
                f,
                "{} SW {:02X} {:02X}",
                format_hex_spaced(&self.data),
                self.sw1,
                self.sw2
            )
        }
    }
}
