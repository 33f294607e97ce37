use anyhow::{Context as AnyhowContext, Result};
use pcsc::{Card, Context, Protocols, Scope, ShareMode, MAX_BUFFER_SIZE_EXTENDED};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::ffi::{CStr, CString};
use std::time::{Duration, Instant};

use crate::core::apdu::CommandApdu;
use crate::core::response::{CardResponse, Terminal};
use crate::core::utils::format_hex;

/// Responses of one polling round, grouped by the terminal that produced them
pub type TerminalResponses = BTreeMap<Terminal, Vec<CardResponse>>;

/// Access to the card readers used by the poller.
///
/// Implementations must be safe to call repeatedly and are expected to
/// bound their own I/O time. Errors are not retried by the caller.
pub trait CardReader: Send + Sync + 'static {
    /// Send every command to the card in every terminal, collecting the
    /// responses per terminal in command order
    fn read_terminals(&self, commands: &[CommandApdu]) -> Result<TerminalResponses>;

    /// Send one command to every terminal and collect the distinct responses
    fn read(&self, command: &CommandApdu) -> Result<HashSet<CardResponse>> {
        let grouped = self.read_terminals(std::slice::from_ref(command))?;
        Ok(grouped.into_values().flatten().collect())
    }
}

/// Information about a PCSC reader
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReaderInfo {
    pub name: String,
    pub is_connected: bool,
    pub atr: Option<Vec<u8>>,
}

/// PCSC reader manager for one interactive connection
pub struct PcscReader {
    context: Context,
    current_reader: Option<String>,
    current_card: Option<Card>,
}

impl PcscReader {
    /// Create a new PCSC reader manager
    pub fn new() -> Result<Self> {
        let context =
            Context::establish(Scope::User).context("Failed to establish PCSC context")?;

        Ok(Self {
            context,
            current_reader: None,
            current_card: None,
        })
    }

    /// List all available readers
    pub fn list_readers(&self) -> Result<Vec<ReaderInfo>> {
        let mut reader_infos = Vec::new();

        for reader_name in reader_names(&self.context)? {
            let reader_name_str = reader_name.to_string_lossy().to_string();

            let (is_connected, atr) = self.get_reader_status(&reader_name);

            reader_infos.push(ReaderInfo {
                name: reader_name_str,
                is_connected,
                atr,
            });
        }

        Ok(reader_infos)
    }

    /// Card presence and ATR of a specific reader
    fn get_reader_status(&self, reader_name: &CStr) -> (bool, Option<Vec<u8>>) {
        match self
            .context
            .connect(reader_name, ShareMode::Shared, Protocols::ANY)
        {
            Ok(card) => match card.status2_owned() {
                Ok(status) => (true, Some(status.atr().to_vec())),
                Err(_) => (true, None),
            },
            Err(_) => (false, None),
        }
    }

    /// Connect to a specific reader
    pub fn connect(&mut self, reader_name: &str, share_mode: ShareMode) -> Result<()> {
        log::info!("Connecting to reader: {}", reader_name);

        let reader_cstr = CString::new(reader_name).context("Invalid reader name")?;
        let card = self
            .context
            .connect(&reader_cstr, share_mode, Protocols::ANY)
            .with_context(|| format!("Failed to connect to reader: {}", reader_name))?;

        self.current_reader = Some(reader_name.to_string());
        self.current_card = Some(card);

        log::info!("Successfully connected to reader: {}", reader_name);
        Ok(())
    }

    /// Disconnect from current reader
    pub fn disconnect(&mut self) -> Result<()> {
        if let Some(card) = self.current_card.take() {
            let _ = card
                .disconnect(pcsc::Disposition::LeaveCard)
                .map_err(|_e| log::warn!("Failed to disconnect cleanly from card"));
        }

        self.current_reader = None;
        log::info!("Disconnected from reader");
        Ok(())
    }

    pub fn current_reader(&self) -> Option<&str> {
        self.current_reader.as_deref()
    }

    pub fn is_connected(&self) -> bool {
        self.current_card.is_some()
    }

    /// Send one command to the connected card, returning the response and
    /// the round-trip time
    pub fn transmit(&self, apdu: &CommandApdu) -> Result<(CardResponse, Duration)> {
        let card = self
            .current_card
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("No card connected"))?;

        log::info!("Transmitting APDU: {}", format_hex(apdu.as_bytes()));

        let start_time = Instant::now();
        let raw = transmit_raw(card, apdu)?;
        let duration = start_time.elapsed();

        log::info!("Received response: {}", format_hex(&raw));
        Ok((CardResponse::from_bytes(&raw), duration))
    }
}

impl Drop for PcscReader {
    fn drop(&mut self) {
        let _ = self.disconnect();
    }
}

/// [`CardReader`] backed by the system PCSC service.
///
/// Each round connects to every reader (or to the configured subset) in
/// shared mode. Readers without a card, or whose card is pulled mid-round,
/// simply contribute no responses. A reader that cannot be connected to is
/// logged and skipped for that round.
pub struct PcscCardReader {
    context: Context,
    readers: Option<Vec<String>>,
}

impl PcscCardReader {
    pub fn new() -> Result<Self> {
        let context =
            Context::establish(Scope::User).context("Failed to establish PCSC context")?;
        Ok(Self {
            context,
            readers: None,
        })
    }

    /// Only poll readers whose name is in `names`
    pub fn with_readers(mut self, names: Vec<String>) -> Self {
        self.readers = if names.is_empty() { None } else { Some(names) };
        self
    }

    fn is_selected(&self, name: &str) -> bool {
        self.readers
            .as_ref()
            .map_or(true, |names| names.iter().any(|n| n == name))
    }

    fn read_terminal(&self, reader_name: &CStr, commands: &[CommandApdu]) -> Result<Vec<CardResponse>> {
        let card = match self
            .context
            .connect(reader_name, ShareMode::Shared, Protocols::ANY)
        {
            Ok(card) => card,
            Err(pcsc::Error::NoSmartcard | pcsc::Error::RemovedCard | pcsc::Error::UnpoweredCard) => {
                return Ok(Vec::new());
            }
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("Failed to connect to reader: {}", reader_name.to_string_lossy())
                })
            }
        };

        let mut responses = Vec::with_capacity(commands.len());
        for command in commands {
            match transmit_raw(&card, command) {
                Ok(raw) => responses.push(CardResponse::from_bytes(&raw)),
                Err(e) => {
                    log::warn!(
                        "Card in {} stopped answering: {e:#}",
                        reader_name.to_string_lossy()
                    );
                    break;
                }
            }
        }

        let _ = card
            .disconnect(pcsc::Disposition::LeaveCard)
            .map_err(|_e| log::warn!("Failed to disconnect cleanly from card"));

        Ok(responses)
    }
}

impl CardReader for PcscCardReader {
    fn read_terminals(&self, commands: &[CommandApdu]) -> Result<TerminalResponses> {
        let names = reader_names(&self.context)?
            .into_iter()
            .filter(|n| self.is_selected(&n.to_string_lossy()));

        Ok(collect_terminals(names, |reader_name| {
            self.read_terminal(reader_name, commands)
        }))
    }
}

/// Group the responses of every named reader. A reader that fails is logged
/// and skipped so the other terminals still count for the round.
fn collect_terminals<I, F>(names: I, mut read: F) -> TerminalResponses
where
    I: IntoIterator<Item = CString>,
    F: FnMut(&CStr) -> Result<Vec<CardResponse>>,
{
    let mut grouped = TerminalResponses::new();

    for reader_name in names {
        let name = reader_name.to_string_lossy().to_string();
        match read(&reader_name) {
            Ok(responses) => {
                log::debug!("{} answered {} command(s)", name, responses.len());
                if !responses.is_empty() {
                    grouped.insert(Terminal::new(name), responses);
                }
            }
            Err(e) => log::warn!("Skipping {name}: {e:#}"),
        }
    }

    grouped
}

/// Reader names known to the PCSC service; none attached is not an error
fn reader_names(context: &Context) -> Result<Vec<CString>> {
    match context.list_readers_owned() {
        Ok(names) => Ok(names),
        Err(pcsc::Error::NoReadersAvailable) => Ok(Vec::new()),
        Err(e) => Err(e).context("Failed to list readers"),
    }
}

fn transmit_raw(card: &Card, apdu: &CommandApdu) -> Result<Vec<u8>> {
    let mut response_buf = vec![0; MAX_BUFFER_SIZE_EXTENDED];
    let response = card
        .transmit(apdu.as_bytes(), &mut response_buf)
        .context("Transmit failed")?;
    Ok(response.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Answers every command with a fixed response per terminal
    struct FixedReader {
        terminals: Vec<(&'static str, Vec<u8>)>,
        seen: Mutex<Vec<Vec<u8>>>,
    }

    impl CardReader for FixedReader {
        fn read_terminals(&self, commands: &[CommandApdu]) -> Result<TerminalResponses> {
            let mut seen = self.seen.lock().unwrap();
            seen.extend(commands.iter().map(|c| c.as_bytes().to_vec()));
            Ok(self
                .terminals
                .iter()
                .map(|(name, raw)| {
                    let responses = commands.iter().map(|_| CardResponse::from_bytes(raw)).collect();
                    (Terminal::new(*name), responses)
                })
                .collect())
        }
    }

    #[test]
    fn test_failing_reader_does_not_hide_the_others() {
        let names = ["Reader A", "Busy Reader", "Empty Reader", "Reader C"]
            .map(|n| CString::new(n).unwrap());

        let grouped = collect_terminals(names, |name| match name.to_str().unwrap() {
            "Busy Reader" => Err(anyhow::anyhow!("Failed to connect to reader: sharing violation")),
            "Empty Reader" => Ok(Vec::new()),
            _ => Ok(vec![CardResponse::new(vec![0x01], 0x90, 0x00)]),
        });

        assert_eq!(
            grouped.keys().cloned().collect::<Vec<_>>(),
            vec![Terminal::new("Reader A"), Terminal::new("Reader C")]
        );
    }

    #[test]
    fn test_default_read_flattens_and_dedups() {
        let reader = FixedReader {
            terminals: vec![
                ("Reader A", vec![0x01, 0x90, 0x00]),
                ("Reader B", vec![0x01, 0x90, 0x00]),
                ("Reader C", vec![0x02, 0x90, 0x00]),
            ],
            seen: Mutex::new(Vec::new()),
        };

        let command = CommandApdu::from_bytes(vec![0x00, 0xCA, 0x00, 0x00]);
        let responses = reader.read(&command).unwrap();

        assert_eq!(responses.len(), 2);
        assert!(responses.contains(&CardResponse::new(vec![0x01], 0x90, 0x00)));
        assert!(responses.contains(&CardResponse::new(vec![0x02], 0x90, 0x00)));
        assert_eq!(*reader.seen.lock().unwrap(), vec![command.as_bytes().to_vec()]);
    }

    #[test]
    fn test_reader_info_serialization() {
        let info = ReaderInfo {
            name: "Mock Reader 1".to_string(),
            is_connected: true,
            atr: Some(vec![0x3B, 0x75]),
        };
        let json = serde_json::to_string(&info).unwrap();
        let back: ReaderInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(back.name, "Mock Reader 1");
        assert_eq!(back.atr, Some(vec![0x3B, 0x75]));
    }
}
