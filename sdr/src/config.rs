use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

pub const DEFAULT_GAIN: i32 = 24;
pub const DEFAULT_PPM: i32 = 0;
pub const DEFAULT_FREQUENCY_HZ: i64 = 100_000_000;
pub const DEFAULT_SAMPLE_RATE_HZ: i64 = 2_048_000;
pub const DEFAULT_ADDRESS: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 1234;

const MAX_ADDRESS_LENGTH: usize = 256;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ArgumentError {
    #[error("No value for argument {0}")]
    MissingValue(String),

    #[error("Argument {0} must start with a dash")]
    MissingDash(String),

    #[error("Missing argument name after dash")]
    EmptyName,

    #[error("Expected argument '-{0}'")]
    Required(&'static str),

    #[error("Invalid value '{value}' for argument '-{name}'")]
    InvalidNumber { name: &'static str, value: String },

    #[error("Address must be shorter than {max} characters")]
    AddressTooLong { max: usize },
}

/// Startup parameters for one session. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SdrTcpArguments {
    /// Tuner gain in tenths of a dB, 0 selects automatic gain
    pub gain: i32,
    pub sample_rate_hz: i64,
    pub frequency_hz: i64,
    pub address: String,
    pub port: u16,
    /// Frequency correction in parts per million
    pub ppm: i32,
}

impl Default for SdrTcpArguments {
    fn default() -> Self {
        Self {
            gain: DEFAULT_GAIN,
            sample_rate_hz: DEFAULT_SAMPLE_RATE_HZ,
            frequency_hz: DEFAULT_FREQUENCY_HZ,
            address: DEFAULT_ADDRESS.to_string(),
            port: DEFAULT_PORT,
            ppm: DEFAULT_PPM,
        }
    }
}

impl SdrTcpArguments {
    /// Parse an rtl_tcp style argument string such as `-a 127.0.0.1 -p 1234 -s 2048000`.
    ///
    /// Address (`-a`) and port (`-p`) are required; everything else has a default.
    pub fn from_arg_string(raw: &str) -> Result<Self, ArgumentError> {
        let parsed = ArgumentParser::new(raw)?;

        let address = parsed.string("a").ok_or(ArgumentError::Required("a"))?;

        let args = Self {
            gain: parsed.number_or("g", DEFAULT_GAIN)?,
            sample_rate_hz: parsed.number_or("s", DEFAULT_SAMPLE_RATE_HZ)?,
            frequency_hz: parsed.number_or("f", DEFAULT_FREQUENCY_HZ)?,
            address: address.to_string(),
            port: parsed.number("p")?.ok_or(ArgumentError::Required("p"))?,
            ppm: parsed.number_or("P", DEFAULT_PPM)?,
        };
        args.validate()?;
        Ok(args)
    }

    pub fn validate(&self) -> Result<(), ArgumentError> {
        if self.address.len() >= MAX_ADDRESS_LENGTH {
            return Err(ArgumentError::AddressTooLong {
                max: MAX_ADDRESS_LENGTH,
            });
        }
        Ok(())
    }

    /// `address:port` suitable for binding
    pub fn bind_address(&self) -> String {
        if self.address.contains(':') && !self.address.starts_with('[') {
            format!("[{}]:{}", self.address, self.port)
        } else {
            format!("{}:{}", self.address, self.port)
        }
    }
}

impl fmt::Display for SdrTcpArguments {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "gain={} samplerate={}Hz frequency={}Hz address={} port={} ppm={}",
            self.gain, self.sample_rate_hz, self.frequency_hz, self.address, self.port, self.ppm
        )
    }
}

/// Key/value view over a `-key value` argument string
#[derive(Debug, Default)]
pub struct ArgumentParser {
    values: HashMap<String, String>,
}

impl ArgumentParser {
    pub fn new(raw: &str) -> Result<Self, ArgumentError> {
        let tokens = split_ignoring_quotes(raw);
        let mut values = HashMap::new();

        for pair in tokens.chunks(2) {
            let name = pair[0].trim();
            let value = match pair.get(1) {
                Some(value) => value,
                None => return Err(ArgumentError::MissingValue(name.to_string())),
            };
            let stripped = name
                .strip_prefix('-')
                .ok_or_else(|| ArgumentError::MissingDash(name.to_string()))?;
            if stripped.is_empty() {
                return Err(ArgumentError::EmptyName);
            }
            values.insert(stripped.to_string(), unquote(value.trim()).to_string());
        }

        Ok(Self { values })
    }

    pub fn string(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    pub fn number<T: std::str::FromStr>(
        &self,
        name: &'static str,
    ) -> Result<Option<T>, ArgumentError> {
        match self.values.get(name) {
            None => Ok(None),
            Some(value) => value
                .parse::<T>()
                .map(Some)
                .map_err(|_| ArgumentError::InvalidNumber {
                    name,
                    value: value.clone(),
                }),
        }
    }

    pub fn number_or<T: std::str::FromStr>(
        &self,
        name: &'static str,
        default: T,
    ) -> Result<T, ArgumentError> {
        Ok(self.number(name)?.unwrap_or(default))
    }
}

fn unquote(value: &str) -> &str {
    if value.len() < 2 {
        return value;
    }
    let quoted = (value.starts_with('"') && value.ends_with('"'))
        || (value.starts_with('\'') && value.ends_with('\''));
    if quoted {
        &value[1..value.len() - 1]
    } else {
        value
    }
}

/// Split on spaces, keeping quoted sections (single or double) together
fn split_ignoring_quotes(raw: &str) -> Vec<String> {
    let mut result = Vec::new();
    let mut current = String::new();
    let mut open_quote: Option<char> = None;

    for c in raw.chars() {
        match (c, open_quote) {
            ('\'' | '"', None) => open_quote = Some(c),
            ('\'' | '"', Some(q)) if q == c => open_quote = None,
            (' ', None) => {
                if !current.is_empty() {
                    result.push(std::mem::take(&mut current));
                }
            }
            _ => current.push(c),
        }
    }

    if !current.is_empty() {
        result.push(current);
    }
    result
}
