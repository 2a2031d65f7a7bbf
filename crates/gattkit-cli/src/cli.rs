//! Command-line interface definitions and parsing

use clap::{Parser, Subcommand, ValueEnum};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Configuration file path
    #[arg(short, long)]
    pub config: Option<String>,

    /// Talk to a simulated heart-rate sensor instead of the system adapter
    #[arg(long)]
    pub simulate: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List nearby peripherals, strongest signal first
    Scan {
        /// Scan duration in seconds (defaults to the configured duration)
        #[arg(short, long)]
        duration: Option<u64>,
        /// Only report peripherals advertising this service (repeatable)
        #[arg(short, long)]
        service: Vec<String>,
    },
    /// Connect and print the attribute tree
    Inspect {
        /// Device id or advertised name
        device: String,
        /// Restrict discovery to this service (repeatable)
        #[arg(short, long)]
        service: Vec<String>,
    },
    /// Read a characteristic
    Read {
        device: String,
        /// Characteristic UUID, short ("2A19") or full
        characteristic: String,
        #[arg(short, long, value_enum, default_value_t = ValueFormat::Hex)]
        format: ValueFormat,
    },
    /// Write a characteristic
    Write {
        device: String,
        characteristic: String,
        /// Value to write, interpreted according to --format
        value: String,
        #[arg(short, long, value_enum, default_value_t = ValueFormat::Hex)]
        format: ValueFormat,
        /// Use write without response
        #[arg(long)]
        no_response: bool,
    },
    /// Print notifications of a characteristic until Ctrl+C
    Listen {
        device: String,
        characteristic: String,
        /// Stop after this many notifications
        #[arg(short = 'n', long)]
        count: Option<usize>,
        #[arg(short, long, value_enum, default_value_t = ValueFormat::Hex)]
        format: ValueFormat,
    },
    /// Poll the signal strength of a connected peripheral
    Rssi {
        device: String,
        /// Number of readings to take
        #[arg(short = 'n', long, default_value_t = 5)]
        samples: usize,
        /// Seconds between readings
        #[arg(short, long, default_value_t = 1.0)]
        interval: f64,
    },
    /// Read the device information service
    Info { device: String },
    /// Print an example configuration file
    Config,
}

/// How characteristic values are rendered and parsed
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ValueFormat {
    Hex,
    Utf8,
    U8,
    U16,
    U32,
    U64,
    I8,
    I16,
    I32,
    I64,
}
