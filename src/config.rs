use crate::error::{BridgeError, Result};
use clap::{Parser, ValueEnum};
use rtl_tcp_protocol::CommandTable;
use sdr::{
    HackRfDevice, RtlSdrDevice, SdrDevice, SdrTcpArguments, SyntheticConfig, SyntheticDriver,
};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use strum::Display;

/// Hardware family served by the bridge
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Display)]
pub enum Backend {
    /// Native-driver dongles speaking unsigned samples
    #[value(name = "rtlsdr")]
    #[strum(serialize = "rtl-sdr")]
    RtlSdr,
    /// Signed-sample transceivers
    #[value(name = "hackrf")]
    #[strum(serialize = "hackrf")]
    HackRf,
}

impl Backend {
    /// A fresh device of this family backed by the synthetic tuner
    pub fn synthetic_device(self, table: Arc<CommandTable>) -> Arc<dyn SdrDevice> {
        match self {
            Backend::RtlSdr => Arc::new(RtlSdrDevice::new(
                "synthetic",
                SyntheticDriver::new(SyntheticConfig::rtlsdr()).opener(),
                table,
            )),
            Backend::HackRf => Arc::new(HackRfDevice::new(
                SyntheticDriver::new(SyntheticConfig::hackrf()).opener(),
                table,
            )),
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "rtl-tcp-bridge")]
#[command(about = "rtl_tcp compatible server for SDR tuners")]
pub struct Cli {
    /// Address to listen on
    #[arg(short = 'a', long)]
    pub address: Option<String>,

    /// Port to listen on
    #[arg(short = 'p', long)]
    pub port: Option<u16>,

    /// Center frequency in Hz
    #[arg(short = 'f', long)]
    pub frequency: Option<i64>,

    /// Sample rate in Hz
    #[arg(short = 's', long)]
    pub sample_rate: Option<i64>,

    /// Gain in tenths of a dB, 0 for automatic
    #[arg(short = 'g', long)]
    pub gain: Option<i32>,

    /// Frequency correction in ppm
    #[arg(short = 'P', long, allow_negative_numbers = true)]
    pub ppm: Option<i32>,

    /// rtl_tcp style argument string, e.g. "-a 0.0.0.0 -p 1234 -s 2048000"
    #[arg(long, conflicts_with = "config", allow_hyphen_values = true)]
    pub args: Option<String>,

    /// JSON file with the session arguments
    #[arg(long)]
    pub config: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = Backend::HackRf)]
    pub backend: Backend,
}

impl Cli {
    /// Session arguments: argument string or config file first, then individual flags on top
    pub fn session_arguments(&self) -> Result<SdrTcpArguments> {
        let mut args = match (&self.args, &self.config) {
            (Some(raw), _) => SdrTcpArguments::from_arg_string(raw)?,
            (None, Some(path)) => load_arguments(path)?,
            (None, None) => SdrTcpArguments::default(),
        };

        if let Some(address) = &self.address {
            args.address = address.clone();
        }
        if let Some(port) = self.port {
            args.port = port;
        }
        if let Some(frequency) = self.frequency {
            args.frequency_hz = frequency;
        }
        if let Some(sample_rate) = self.sample_rate {
            args.sample_rate_hz = sample_rate;
        }
        if let Some(gain) = self.gain {
            args.gain = gain;
        }
        if let Some(ppm) = self.ppm {
            args.ppm = ppm;
        }

        args.validate()?;
        Ok(args)
    }
}

/// Read session arguments from a JSON file. Missing fields take their defaults.
pub fn load_arguments(path: &Path) -> Result<SdrTcpArguments> {
    let text = fs::read_to_string(path).map_err(|e| {
        BridgeError::Config(format!("Cannot read {}: {}", path.display(), e))
    })?;
    let args: SdrTcpArguments = serde_json::from_str(&text)?;
    args.validate()?;
    Ok(args)
}
