use std::collections::HashMap;
use std::fmt;
use std::io::{BufReader, BufWriter, Read, Write};
use std::net::{Shutdown, TcpStream};
use thiserror::Error;

/// Size of the dongle info header sent once per connection
pub const DONGLE_INFO_LEN: usize = 12;

/// Size of one client command record: opcode + big-endian argument
pub const COMMAND_LEN: usize = 5;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Duplicate opcode 0x{code:02x} for {command}")]
    DuplicateOpcode { code: u8, command: TcpCommand },

    #[error("Invalid dongle magic: {0:?}")]
    InvalidMagic([u8; 4]),
}

/// Commands a client can send over the TCP connection.
///
/// The discriminants are the on-wire opcodes and must never change, clients
/// depend on them bit for bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TcpCommand {
    // Standard rtl_tcp API
    SetFreq = 0x01,
    SetSampleRate = 0x02,
    SetGainMode = 0x03,
    SetGain = 0x04,
    SetFreqCorrection = 0x05,
    SetIfTunerGain = 0x06,
    SetTestMode = 0x07,
    SetAgcMode = 0x08,
    SetDirectSampling = 0x09,
    SetOffsetTuning = 0x0a,
    SetRtlXtal = 0x0b,
    SetTunerXtal = 0x0c,
    SetTunerGainById = 0x0d,

    // Vendor extensions
    AndroidExit = 0x7e,
    AndroidGainByPercentage = 0x7f,
    AndroidEnable16BitSigned = 0x80,

    // SDRplay (rsp_tcp) commands
    RspSetAntenna = 0x1f,
    RspSetLnaState = 0x20,
    RspSetIfGainR = 0x21,
    RspSetAgc = 0x22,
    RspSetAgcSetpoint = 0x23,
    RspSetNotch = 0x24,
    RspSetBiasT = 0x25,
}

impl TcpCommand {
    /// Every known command, in declaration order
    pub const ALL: [TcpCommand; 23] = [
        TcpCommand::SetFreq,
        TcpCommand::SetSampleRate,
        TcpCommand::SetGainMode,
        TcpCommand::SetGain,
        TcpCommand::SetFreqCorrection,
        TcpCommand::SetIfTunerGain,
        TcpCommand::SetTestMode,
        TcpCommand::SetAgcMode,
        TcpCommand::SetDirectSampling,
        TcpCommand::SetOffsetTuning,
        TcpCommand::SetRtlXtal,
        TcpCommand::SetTunerXtal,
        TcpCommand::SetTunerGainById,
        TcpCommand::AndroidExit,
        TcpCommand::AndroidGainByPercentage,
        TcpCommand::AndroidEnable16BitSigned,
        TcpCommand::RspSetAntenna,
        TcpCommand::RspSetLnaState,
        TcpCommand::RspSetIfGainR,
        TcpCommand::RspSetAgc,
        TcpCommand::RspSetAgcSetpoint,
        TcpCommand::RspSetNotch,
        TcpCommand::RspSetBiasT,
    ];

    pub const fn code(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for TcpCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}(0x{:02x})", self, self.code())
    }
}

const fn has_duplicate_codes(commands: &[TcpCommand]) -> bool {
    let mut i = 0;
    while i < commands.len() {
        let mut j = i + 1;
        while j < commands.len() {
            if commands[i] as u8 == commands[j] as u8 {
                return true;
            }
            j += 1;
        }
        i += 1;
    }
    false
}

const _: () = assert!(
    !has_duplicate_codes(&TcpCommand::ALL),
    "duplicate opcode in TcpCommand::ALL"
);

/// Immutable opcode lookup table.
///
/// Built once from an explicit command list and shared by reference; there
/// is no global registry.
#[derive(Debug, Clone)]
pub struct CommandTable {
    by_code: HashMap<u8, TcpCommand>,
}

impl CommandTable {
    /// Build a table, failing if two commands share an opcode
    pub fn from_commands<I>(commands: I) -> Result<Self, ProtocolError>
    where
        I: IntoIterator<Item = TcpCommand>,
    {
        let mut by_code = HashMap::new();
        for command in commands {
            if by_code.insert(command.code(), command).is_some() {
                return Err(ProtocolError::DuplicateOpcode {
                    code: command.code(),
                    command,
                });
            }
        }
        Ok(Self { by_code })
    }

    /// The table of every opcode this crate knows about
    pub fn standard() -> Self {
        let by_code = TcpCommand::ALL.iter().map(|c| (c.code(), *c)).collect();
        Self { by_code }
    }

    pub fn lookup(&self, code: u8) -> Option<TcpCommand> {
        self.by_code.get(&code).copied()
    }

    pub fn len(&self) -> usize {
        self.by_code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_code.is_empty()
    }

    /// Opcodes in ascending order
    pub fn codes(&self) -> Vec<u8> {
        let mut codes: Vec<u8> = self.by_code.keys().copied().collect();
        codes.sort_unstable();
        codes
    }
}

/// One raw command record as read from the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandRecord {
    pub opcode: u8,
    pub argument: u32,
}

impl CommandRecord {
    pub fn new(command: TcpCommand, argument: u32) -> Self {
        Self {
            opcode: command.code(),
            argument,
        }
    }

    /// Serialize to `[opcode][argument: u32 big endian]`
    pub fn to_bytes(&self) -> [u8; COMMAND_LEN] {
        let arg = self.argument.to_be_bytes();
        [self.opcode, arg[0], arg[1], arg[2], arg[3]]
    }

    pub fn from_bytes(bytes: [u8; COMMAND_LEN]) -> Self {
        Self {
            opcode: bytes[0],
            argument: u32::from_be_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]),
        }
    }
}

/// The 12 byte handshake header identifying the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DongleInfo {
    pub magic: [u8; 4],
    pub tuner_type: u32,
    pub gain_count: u32,
}

impl DongleInfo {
    pub fn new(magic: [u8; 4], tuner_type: u32, gain_count: u32) -> Self {
        Self {
            magic,
            tuner_type,
            gain_count,
        }
    }

    pub fn magic_str(&self) -> String {
        String::from_utf8_lossy(&self.magic).into_owned()
    }

    /// Serialize to `[magic][tuner_type: u32 BE][gain_count: u32 BE]`
    pub fn to_bytes(&self) -> [u8; DONGLE_INFO_LEN] {
        let mut bytes = [0u8; DONGLE_INFO_LEN];
        bytes[..4].copy_from_slice(&self.magic);
        bytes[4..8].copy_from_slice(&self.tuner_type.to_be_bytes());
        bytes[8..].copy_from_slice(&self.gain_count.to_be_bytes());
        bytes
    }

    pub fn from_bytes(bytes: [u8; DONGLE_INFO_LEN]) -> Result<Self, ProtocolError> {
        let magic = [bytes[0], bytes[1], bytes[2], bytes[3]];
        if !magic.iter().all(u8::is_ascii_graphic) {
            return Err(ProtocolError::InvalidMagic(magic));
        }
        Ok(Self {
            magic,
            tuner_type: u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
            gain_count: u32::from_be_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]),
        })
    }
}

/// Split reader/writer view of an accepted rtl_tcp connection.
///
/// The read half is unbuffered beyond one record so that shutting the
/// socket down from another thread unblocks `read_command` promptly.
pub struct Connection {
    reader: TcpStream,
    writer: BufWriter<TcpStream>,
}

impl Connection {
    pub fn new(stream: TcpStream) -> Result<Self, ProtocolError> {
        let reader = stream.try_clone()?;
        Ok(Connection {
            reader,
            writer: BufWriter::new(stream),
        })
    }

    /// Split into a command reader and a sample writer for separate threads
    pub fn split(self) -> (CommandReader, SampleWriter) {
        (
            CommandReader {
                reader: BufReader::with_capacity(COMMAND_LEN, self.reader),
            },
            SampleWriter {
                writer: self.writer,
            },
        )
    }
}

/// Read half: decodes command records
pub struct CommandReader {
    reader: BufReader<TcpStream>,
}

impl CommandReader {
    /// Read one record (blocking). Unknown opcodes are returned as-is.
    pub fn read_command(&mut self) -> Result<CommandRecord, ProtocolError> {
        let mut record = [0u8; COMMAND_LEN];
        self.reader.read_exact(&mut record)?;
        Ok(CommandRecord::from_bytes(record))
    }
}

/// Write half: header and sample bytes
pub struct SampleWriter {
    writer: BufWriter<TcpStream>,
}

impl SampleWriter {
    pub fn write_dongle_info(&mut self, info: &DongleInfo) -> Result<(), ProtocolError> {
        self.writer.write_all(&info.to_bytes())?;
        self.writer.flush()?;
        Ok(())
    }

    pub fn write_samples(&mut self, samples: &[u8]) -> Result<(), ProtocolError> {
        self.writer.write_all(samples)?;
        self.writer.flush()?;
        Ok(())
    }

    /// Flush and close both directions of the socket
    pub fn close(mut self) {
        let _ = self.writer.flush();
        let _ = self.writer.get_ref().shutdown(Shutdown::Both);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_values_are_stable() {
        assert_eq!(TcpCommand::SetFreq.code(), 0x01);
        assert_eq!(TcpCommand::SetTunerGainById.code(), 0x0d);
        assert_eq!(TcpCommand::AndroidExit.code(), 0x7e);
        assert_eq!(TcpCommand::AndroidGainByPercentage.code(), 0x7f);
        assert_eq!(TcpCommand::AndroidEnable16BitSigned.code(), 0x80);
        assert_eq!(TcpCommand::RspSetAntenna.code(), 0x1f);
        assert_eq!(TcpCommand::RspSetBiasT.code(), 0x25);
    }

    #[test]
    fn test_standard_table_has_every_command() {
        let table = CommandTable::standard();
        assert_eq!(table.len(), TcpCommand::ALL.len());
        for command in TcpCommand::ALL {
            assert_eq!(table.lookup(command.code()), Some(command));
        }
        assert_eq!(table.lookup(0x00), None);
        assert_eq!(table.lookup(0xff), None);
    }

    #[test]
    fn test_duplicate_opcode_rejected_at_construction() {
        let result = CommandTable::from_commands([
            TcpCommand::SetFreq,
            TcpCommand::SetGain,
            TcpCommand::SetFreq,
        ]);
        match result {
            Err(ProtocolError::DuplicateOpcode { code, command }) => {
                assert_eq!(code, 0x01);
                assert_eq!(command, TcpCommand::SetFreq);
            }
            other => panic!("Expected DuplicateOpcode, got {:?}", other),
        }
    }

    #[test]
    fn test_duplicate_detection_helper() {
        assert!(has_duplicate_codes(&[TcpCommand::SetGain, TcpCommand::SetGain]));
        assert!(!has_duplicate_codes(&TcpCommand::ALL));
    }

    #[test]
    fn test_codes_sorted() {
        let table =
            CommandTable::from_commands([TcpCommand::AndroidExit, TcpCommand::SetFreq]).unwrap();
        assert_eq!(table.codes(), vec![0x01, 0x7e]);
    }

    #[test]
    fn test_command_record_is_big_endian() {
        let record = CommandRecord::new(TcpCommand::SetFreq, 100_000_000);
        assert_eq!(record.to_bytes(), [0x01, 0x05, 0xf5, 0xe1, 0x00]);
        assert_eq!(CommandRecord::from_bytes(record.to_bytes()), record);
    }

    #[test]
    fn test_dongle_info_layout() {
        let info = DongleInfo::new(*b"RTL0", 5, 29);
        let bytes = info.to_bytes();
        assert_eq!(&bytes[..4], b"RTL0");
        assert_eq!(&bytes[4..8], &[0, 0, 0, 5]);
        assert_eq!(&bytes[8..], &[0, 0, 0, 29]);
        assert_eq!(DongleInfo::from_bytes(bytes).unwrap(), info);
        assert_eq!(info.magic_str(), "RTL0");
    }

    #[test]
    fn test_dongle_info_rejects_binary_magic() {
        let mut bytes = DongleInfo::new(*b"hxrf", 0, 0).to_bytes();
        bytes[0] = 0;
        assert!(matches!(
            DongleInfo::from_bytes(bytes),
            Err(ProtocolError::InvalidMagic(_))
        ));
    }
}
