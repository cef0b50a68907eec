use crate::protocol::{CommandRecord, DongleInfo, ProtocolError, TcpCommand, DONGLE_INFO_LEN};
use log::{debug, info};
use std::io::{BufReader, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::time::Duration;

/// Blocking rtl_tcp client: reads the header, streams samples, sends commands
pub struct RtlTcpClient {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
    dongle_info: DongleInfo,
}

impl RtlTcpClient {
    /// Connect and read the dongle info header
    pub fn connect<A: ToSocketAddrs + std::fmt::Debug>(address: A) -> Result<Self, ProtocolError> {
        info!("📡 Connecting to rtl_tcp server at {:?}", address);

        let stream = TcpStream::connect(address)?;
        stream.set_read_timeout(Some(Duration::from_secs(30)))?;
        stream.set_write_timeout(Some(Duration::from_secs(10)))?;
        stream.set_nodelay(true)?;

        let writer = stream.try_clone()?;
        let mut reader = BufReader::new(stream);

        let mut header = [0u8; DONGLE_INFO_LEN];
        reader.read_exact(&mut header)?;
        let dongle_info = DongleInfo::from_bytes(header)?;

        info!(
            "✅ Connected to '{}' (tuner type {}, {} gains)",
            dongle_info.magic_str(),
            dongle_info.tuner_type,
            dongle_info.gain_count
        );

        Ok(RtlTcpClient {
            reader,
            writer,
            dongle_info,
        })
    }

    pub fn dongle_info(&self) -> &DongleInfo {
        &self.dongle_info
    }

    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<(), ProtocolError> {
        self.reader.get_ref().set_read_timeout(timeout)?;
        Ok(())
    }

    pub fn send_command(&mut self, command: TcpCommand, argument: u32) -> Result<(), ProtocolError> {
        self.send_raw(CommandRecord::new(command, argument))
    }

    /// Send a record verbatim, including opcodes the server may not know
    pub fn send_raw(&mut self, record: CommandRecord) -> Result<(), ProtocolError> {
        debug!(
            "📤 Sending opcode 0x{:02x} argument {}",
            record.opcode, record.argument
        );
        self.writer.write_all(&record.to_bytes())?;
        self.writer.flush()?;
        Ok(())
    }

    /// Ask the server to stop serving and clean up
    pub fn send_exit(&mut self) -> Result<(), ProtocolError> {
        self.send_command(TcpCommand::AndroidExit, 0)
    }

    /// Read up to `buf.len()` sample bytes. Returns 0 once the server closed.
    pub fn read_samples(&mut self, buf: &mut [u8]) -> Result<usize, ProtocolError> {
        Ok(self.reader.read(buf)?)
    }

    /// Read exactly `buf.len()` sample bytes
    pub fn read_samples_exact(&mut self, buf: &mut [u8]) -> Result<(), ProtocolError> {
        self.reader.read_exact(buf)?;
        Ok(())
    }

    /// Read and discard until the server closes the connection
    pub fn drain_until_closed(&mut self) -> Result<usize, ProtocolError> {
        let mut total = 0;
        let mut buf = [0u8; 4096];
        loop {
            match self.reader.read(&mut buf) {
                Ok(0) => return Ok(total),
                Ok(n) => total += n,
                Err(e)
                    if matches!(
                        e.kind(),
                        std::io::ErrorKind::ConnectionReset | std::io::ErrorKind::ConnectionAborted
                    ) =>
                {
                    return Ok(total)
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    pub fn close(self) {
        let _ = self.writer.shutdown(Shutdown::Both);
    }
}
