/// PCSC Autoreader - APDU building and change-aware polling of smart card readers
///
/// The library assembles command APDUs byte-exactly and polls PCSC readers
/// on an interval, running a task only when the observed responses change.
pub mod cli;
pub mod core;

// Re-export commonly used types
pub use core::{
    apdu::{encode_length, ApduBuilder, CommandApdu},
    error::Error,
    polling::{CardTask, ChangeDetector, Poller, PollingReader, TerminalTask},
    reader::{CardReader, PcscCardReader, PcscReader, ReaderInfo, TerminalResponses},
    response::{CardResponse, Terminal},
    utils::{format_hex, parse_hex},
};
