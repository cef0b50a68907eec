//! # rtl_tcp Protocol
//!
//! Wire format shared by the server and its clients.
//!
//! This crate provides:
//! - The opcode table and an explicitly built lookup table
//! - Command record and dongle info header serialization
//! - A connection wrapper split into read/write halves
//! - A blocking client for tooling and tests
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use rtl_tcp_protocol::{RtlTcpClient, TcpCommand};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut client = RtlTcpClient::connect("127.0.0.1:1234")?;
//! println!("Backend: {}", client.dongle_info().magic_str());
//!
//! client.send_command(TcpCommand::SetFreq, 100_000_000)?;
//!
//! let mut iq = [0u8; 16384];
//! let n = client.read_samples(&mut iq)?;
//! println!("Received {} sample bytes", n);
//!
//! client.send_exit()?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod protocol;

pub use client::RtlTcpClient;
pub use protocol::{
    CommandReader, CommandRecord, CommandTable, Connection, DongleInfo, ProtocolError,
    SampleWriter, TcpCommand, COMMAND_LEN, DONGLE_INFO_LEN,
};
