use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use pcsc::ShareMode;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use crate::core::{
    apdu::{ApduBuilder, CommandApdu},
    polling::{Poller, PollingReader},
    reader::{CardReader, PcscCardReader, PcscReader},
    response::{CardResponse, Terminal},
    utils::{format_ascii, format_hex, format_hex_spaced, parse_byte, parse_hex},
};

#[derive(Parser)]
#[command(name = "pcsc-autoreader")]
#[command(about = "Build smart card APDUs and watch PCSC readers for new card responses")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub debug: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Assemble an APDU and print it
    Build {
        #[command(flatten)]
        apdu: ApduArgs,

        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },

    /// List available PCSC readers
    List {
        /// Show detailed information about readers
        #[arg(short = 'l', long)]
        detailed: bool,
    },

    /// Build an APDU and send it once
    Transmit {
        /// Reader name or index (use 'list' to see available readers)
        reader: String,

        #[command(flatten)]
        apdu: ApduArgs,

        /// Connection share mode
        #[arg(short, long, default_value = "shared")]
        mode: ShareModeArg,

        /// Show response in different formats
        #[arg(short, long)]
        format: Option<ResponseFormat>,
    },

    /// Poll readers periodically and report whenever new responses appear
    Watch {
        #[command(flatten)]
        apdu: ApduArgs,

        /// Additional complete APDU in hex, sent after the first one
        #[arg(long = "command", conflicts_with = "merged")]
        commands: Vec<String>,

        /// Polling interval in milliseconds
        #[arg(short, long, default_value_t = 500, value_parser = clap::value_parser!(u64).range(1..))]
        interval: u64,

        /// Only poll this reader (repeatable)
        #[arg(short, long = "reader")]
        readers: Vec<String>,

        /// Report one merged response set instead of one line per reader
        #[arg(long)]
        merged: bool,

        /// Print events as JSON lines
        #[arg(long)]
        json: bool,
    },
}

/// APDU fields shared by every command that sends or prints an APDU
#[derive(Args, Clone, Debug)]
pub struct ApduArgs {
    /// Class byte in hex
    #[arg(long, default_value = "00", value_parser = parse_byte_arg)]
    pub cla: u8,

    /// Instruction byte in hex
    #[arg(long, default_value = "00", value_parser = parse_byte_arg)]
    pub ins: u8,

    /// Parameter 1 in hex
    #[arg(long, default_value = "00", value_parser = parse_byte_arg)]
    pub p1: u8,

    /// Parameter 2 in hex
    #[arg(long, default_value = "00", value_parser = parse_byte_arg)]
    pub p2: u8,

    /// Command data in hex (only the leading run of hex digits is used)
    #[arg(long)]
    pub data: Option<String>,

    /// Expected response length (1-65535)
    #[arg(long)]
    pub le: Option<usize>,

    /// Complete APDU in hex, used instead of the fields above
    #[arg(long, conflicts_with_all = ["data", "le"])]
    pub raw: Option<String>,
}

fn parse_byte_arg(s: &str) -> Result<u8, String> {
    parse_byte(s).map_err(|e| e.to_string())
}

impl ApduArgs {
    /// Builder populated from the header, data and Le arguments
    pub fn builder(&self) -> Result<ApduBuilder> {
        let mut builder = ApduBuilder::new().header([self.cla, self.ins, self.p1, self.p2]);
        if let Some(data) = &self.data {
            builder = builder.data_hex(data).context("Invalid command data")?;
        }
        if let Some(le) = self.le {
            builder = builder.le(le).context("Invalid expected length")?;
        }
        Ok(builder)
    }

    pub fn to_apdu(&self) -> Result<CommandApdu> {
        match &self.raw {
            Some(raw) => parse_raw_apdu(raw),
            None => Ok(self.builder()?.build()),
        }
    }
}

fn parse_raw_apdu(hex_str: &str) -> Result<CommandApdu> {
    let bytes = parse_hex(hex_str).context("Failed to parse APDU hex string")?;
    if bytes.len() < 4 {
        bail!("APDU needs at least 4 header bytes, got {}", bytes.len());
    }
    Ok(CommandApdu::from_bytes(bytes))
}

#[derive(Clone, Debug)]
pub enum ShareModeArg {
    Shared,
    Exclusive,
    Direct,
}

impl std::str::FromStr for ShareModeArg {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "shared" => Ok(ShareModeArg::Shared),
            "exclusive" => Ok(ShareModeArg::Exclusive),
            "direct" => Ok(ShareModeArg::Direct),
            _ => Err(format!("Invalid share mode: {s}")),
        }
    }
}

impl From<ShareModeArg> for ShareMode {
    fn from(mode: ShareModeArg) -> Self {
        match mode {
            ShareModeArg::Shared => ShareMode::Shared,
            ShareModeArg::Exclusive => ShareMode::Exclusive,
            ShareModeArg::Direct => ShareMode::Direct,
        }
    }
}

#[derive(Clone, Debug)]
pub enum ResponseFormat {
    Hex,
    HexSpaced,
    Ascii,
    All,
}

impl std::str::FromStr for ResponseFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "hex" => Ok(ResponseFormat::Hex),
            "spaced" => Ok(ResponseFormat::HexSpaced),
            "ascii" => Ok(ResponseFormat::Ascii),
            "all" => Ok(ResponseFormat::All),
            _ => Err(format!("Invalid format: {s}")),
        }
    }
}

pub fn run_cli() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let log_level = if cli.debug {
        log::LevelFilter::Debug
    } else if cli.verbose {
        log::LevelFilter::Info
    } else {
        log::LevelFilter::Warn
    };

    env_logger::Builder::from_default_env()
        .filter_level(log_level)
        .init();

    match cli.command {
        Commands::Build { apdu, json } => cmd_build(&apdu, json),
        Commands::List { detailed } => cmd_list(detailed),
        Commands::Transmit {
            reader,
            apdu,
            mode,
            format,
        } => cmd_transmit(&reader, &apdu, mode, format),
        Commands::Watch {
            apdu,
            commands,
            interval,
            readers,
            merged,
            json,
        } => cmd_watch(&apdu, &commands, interval, readers, merged, json),
    }
}

#[derive(Serialize)]
struct BuildOutput {
    apdu: String,
    length: usize,
    lc: Option<String>,
    data: Option<String>,
    le: Option<String>,
}

fn cmd_build(args: &ApduArgs, json: bool) -> Result<()> {
    let (apdu, builder) = match &args.raw {
        Some(raw) => (parse_raw_apdu(raw)?, None),
        None => {
            let builder = args.builder()?;
            (builder.build(), Some(builder))
        }
    };

    if json {
        let output = BuildOutput {
            apdu: format_hex(apdu.as_bytes()),
            length: apdu.len(),
            lc: builder.as_ref().and_then(|b| b.lc_field()).map(format_hex),
            data: builder.as_ref().and_then(|b| b.payload()).map(format_hex),
            le: builder.as_ref().and_then(|b| b.le_field()).map(format_hex),
        };
        println!(
            "{}",
            serde_json::to_string(&output).context("Failed to serialize APDU")?
        );
        return Ok(());
    }

    println!("APDU: {apdu}");
    if let Some(builder) = builder {
        println!("Header: {}", format_hex_spaced(&builder.header_bytes()));
        if let (Some(lc), Some(data)) = (builder.lc_field(), builder.payload()) {
            println!("Lc: {}", format_hex_spaced(lc));
            println!("Data: {}", format_hex_spaced(data));
        }
        if let Some(le) = builder.le_field() {
            println!("Le: {}", format_hex_spaced(le));
        }
    }
    println!("Length: {} bytes", apdu.len());

    Ok(())
}

fn cmd_list(detailed: bool) -> Result<()> {
    let reader = PcscReader::new().context("Failed to initialize PCSC")?;

    let readers = reader.list_readers().context("Failed to list readers")?;

    if readers.is_empty() {
        println!("No PCSC readers found.");
        return Ok(());
    }

    println!("Available PCSC readers:");
    for (i, reader_info) in readers.iter().enumerate() {
        if detailed {
            println!("  [{}] {}", i, reader_info.name);
            println!(
                "      Status: {}",
                if reader_info.is_connected {
                    "Card present"
                } else {
                    "No card"
                }
            );
            if let Some(ref atr) = reader_info.atr {
                println!("      ATR: {}", format_hex_spaced(atr));
            }
        } else if reader_info.is_connected {
            match reader_info.atr {
                Some(ref atr) => println!(
                    "  [{}] {} [CARD - ATR: {}]",
                    i,
                    reader_info.name,
                    format_hex_spaced(atr)
                ),
                None => println!("  [{}] {} [CARD]", i, reader_info.name),
            }
        } else {
            println!("  [{}] {}", i, reader_info.name);
        }
    }

    Ok(())
}

fn cmd_transmit(
    reader_name: &str,
    args: &ApduArgs,
    mode: ShareModeArg,
    format: Option<ResponseFormat>,
) -> Result<()> {
    let apdu = args.to_apdu()?;

    let mut reader = PcscReader::new().context("Failed to initialize PCSC")?;

    let reader_name = resolve_reader_name(&reader, reader_name)?;
    reader
        .connect(&reader_name, mode.into())
        .with_context(|| format!("Failed to connect to reader: {reader_name}"))?;

    let (response, duration) = reader
        .transmit(&apdu)
        .context("Failed to execute transmit command")?;

    println!("APDU: {apdu}");

    let format = format.unwrap_or(ResponseFormat::HexSpaced);
    print_response(&response.data, &format);

    println!(
        "Status: {:02X} {:02X} ({})",
        response.sw1,
        response.sw2,
        response.describe_status()
    );
    println!("Duration: {}ms", duration.as_millis());

    Ok(())
}

#[derive(Serialize)]
struct WatchEvent<'a> {
    timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    terminal: Option<&'a Terminal>,
    responses: Vec<&'a CardResponse>,
}

impl WatchEvent<'_> {
    fn print(&self, json: bool) {
        if json {
            match serde_json::to_string(self) {
                Ok(line) => println!("{line}"),
                Err(e) => log::error!("Failed to serialize event: {e}"),
            }
            return;
        }

        let responses = self
            .responses
            .iter()
            .map(|r| r.to_string())
            .collect::<Vec<_>>()
            .join(" | ");
        match self.terminal {
            Some(terminal) => println!(
                "[{}] {}: {}",
                self.timestamp.format("%H:%M:%S"),
                terminal,
                responses
            ),
            None => println!("[{}] {}", self.timestamp.format("%H:%M:%S"), responses),
        }
    }
}

fn cmd_watch(
    args: &ApduArgs,
    extra_commands: &[String],
    interval_ms: u64,
    readers: Vec<String>,
    merged: bool,
    json: bool,
) -> Result<()> {
    let mut commands = vec![args.to_apdu()?];
    for hex in extra_commands {
        commands.push(parse_raw_apdu(hex)?);
    }

    let card_reader: Arc<dyn CardReader> = Arc::new(
        PcscCardReader::new()
            .context("Failed to initialize PCSC")?
            .with_readers(readers),
    );

    let poller = if merged {
        Poller::single(
            card_reader,
            commands.remove(0),
            move |responses: &HashSet<CardResponse>| {
                let mut sorted: Vec<&CardResponse> = responses.iter().collect();
                sorted.sort_by_key(|r| r.to_bytes());
                WatchEvent {
                    timestamp: Utc::now(),
                    terminal: None,
                    responses: sorted,
                }
                .print(json);
            },
        )
    } else {
        Poller::per_terminal(
            card_reader,
            commands,
            move |terminal: &Terminal, responses: &[CardResponse]| {
                WatchEvent {
                    timestamp: Utc::now(),
                    terminal: Some(terminal),
                    responses: responses.iter().collect(),
                }
                .print(json);
            },
        )?
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start runtime")?;

    runtime.block_on(run_watch(poller, interval_ms, json))
}

async fn run_watch(poller: Poller, interval_ms: u64, json: bool) -> Result<()> {
    let polling = PollingReader::new(poller);
    polling.start(Duration::from_millis(interval_ms)).await?;

    if !json {
        println!("Watching readers every {interval_ms}ms, press Ctrl-C to stop");
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    polling.stop().await?;
    Ok(())
}

fn resolve_reader_name(reader: &PcscReader, name_or_index: &str) -> Result<String> {
    // Try to parse as index first
    if let Ok(index) = name_or_index.parse::<usize>() {
        let readers = reader.list_readers()?;
        if index < readers.len() {
            return Ok(readers[index].name.clone());
        }
        bail!(
            "Reader index {} out of range ({} reader(s) available)",
            index,
            readers.len()
        );
    }

    // Use as reader name directly
    Ok(name_or_index.to_string())
}

fn print_response(data: &[u8], format: &ResponseFormat) {
    if data.is_empty() {
        println!("Response: (empty)");
        return;
    }

    match format {
        ResponseFormat::Hex => {
            println!("Response: {}", format_hex(data));
        }
        ResponseFormat::HexSpaced => {
            println!("Response: {}", format_hex_spaced(data));
        }
        ResponseFormat::Ascii => {
            println!("Response (ASCII): {}", format_ascii(data));
        }
        ResponseFormat::All => {
            println!("Response (Hex): {}", format_hex_spaced(data));
            println!("Response (ASCII): {}", format_ascii(data));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("pcsc-autoreader").chain(args.iter().copied()))
            .unwrap()
    }

    #[test]
    fn test_apdu_args_build_select() {
        let cli = parse(&[
            "build", "--ins", "A4", "--p1", "04", "--data", "A0000000031010", "--le", "0",
        ]);
        let Commands::Build { apdu, .. } = cli.command else {
            panic!("expected build command");
        };
        // Le of 0 is out of range
        assert!(apdu.to_apdu().is_err());

        let cli = parse(&["build", "--ins", "0xA4", "--p1", "4", "--data", "A0000000031010"]);
        let Commands::Build { apdu, .. } = cli.command else {
            panic!("expected build command");
        };
        assert_eq!(
            apdu.to_apdu().unwrap().as_bytes(),
            &[0x00, 0xA4, 0x04, 0x00, 0x07, 0xA0, 0x00, 0x00, 0x00, 0x03, 0x10, 0x10]
        );
    }

    #[test]
    fn test_apdu_args_raw() {
        let cli = parse(&["build", "--raw", "FF CA 00 00 00"]);
        let Commands::Build { apdu, .. } = cli.command else {
            panic!("expected build command");
        };
        assert_eq!(
            apdu.to_apdu().unwrap().as_bytes(),
            &[0xFF, 0xCA, 0x00, 0x00, 0x00]
        );

        assert!(parse_raw_apdu("FFCA").is_err());
    }

    #[test]
    fn test_raw_conflicts_with_fields() {
        let result = Cli::try_parse_from([
            "pcsc-autoreader",
            "build",
            "--raw",
            "00A40400",
            "--data",
            "01",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_watch_defaults() {
        let cli = parse(&["watch", "--raw", "FFCA000000"]);
        assert!(matches!(cli.command, Commands::Watch { .. }));

        let cli = parse(&["watch", "--cla", "FF", "--ins", "CA", "-r", "Reader A", "-r", "Reader B"]);
        let Commands::Watch {
            interval,
            readers,
            merged,
            ..
        } = cli.command
        else {
            panic!("expected watch command");
        };
        assert_eq!(interval, 500);
        assert_eq!(readers, vec!["Reader A", "Reader B"]);
        assert!(!merged);
    }

    #[test]
    fn test_watch_rejects_zero_interval() {
        let result = Cli::try_parse_from(["pcsc-autoreader", "watch", "--interval", "0"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_share_mode_and_format_parsing() {
        assert!(matches!("Direct".parse::<ShareModeArg>(), Ok(ShareModeArg::Direct)));
        assert!("bogus".parse::<ShareModeArg>().is_err());
        assert!(matches!("spaced".parse::<ResponseFormat>(), Ok(ResponseFormat::HexSpaced)));
        assert!("dump".parse::<ResponseFormat>().is_err());
    }
}
