//! HackRF family: a software rtl_tcp implementation on top of a driver
//! with two gain stages, no automatic gain and signed samples.

use crate::config::SdrTcpArguments;
use crate::device::{DeviceState, SdrDevice, SessionRunner, StatusListener};
use crate::driver::{DriverOpener, TunerDriver};
use crate::error::{Result, SdrError};
use crate::gain::{DEFAULT_LNA_GAIN, DEFAULT_VGA_GAIN, HACKRF_LNA, HACKRF_VGA};
use crate::lock;
use crate::tcp_server::{ServerConfig, TcpBackend};
use crate::types::SampleSource;
use rtl_tcp_protocol::{CommandTable, DongleInfo, TcpCommand};
use std::sync::{Arc, Mutex};

pub const HACKRF_MAGIC: [u8; 4] = *b"hxrf";

pub const SUPPORTED_COMMANDS: &[TcpCommand] = &[
    TcpCommand::SetFreq,
    TcpCommand::SetSampleRate,
    TcpCommand::AndroidExit,
    TcpCommand::AndroidGainByPercentage,
    TcpCommand::SetIfTunerGain,
    TcpCommand::SetGain,
    TcpCommand::SetAgcMode,
    TcpCommand::SetGainMode,
];

/// Baseband filter follows the sample rate at 3/4 of it
pub fn baseband_filter_for(sample_rate_hz: u32) -> u32 {
    (u64::from(sample_rate_hz) * 3 / 4) as u32
}

pub struct HackRfTcp {
    driver: Box<dyn TunerDriver>,
}

impl HackRfTcp {
    pub fn new(driver: Box<dyn TunerDriver>) -> Self {
        Self { driver }
    }

    /// Apply the startup arguments: sample rate, frequency, then default gains
    pub fn init_device(&mut self, args: &SdrTcpArguments) -> Result<()> {
        let sample_rate = u32::try_from(args.sample_rate_hz).map_err(|_| {
            SdrError::InvalidArgument(format!("sample rate {}", args.sample_rate_hz))
        })?;
        let frequency = u64::try_from(args.frequency_hz)
            .map_err(|_| SdrError::InvalidArgument(format!("frequency {}", args.frequency_hz)))?;

        self.set_sample_rate(sample_rate)?;
        self.driver.set_center_frequency(frequency)?;
        self.execute(TcpCommand::SetGainMode, 1)
    }

    fn set_sample_rate(&mut self, hz: u32) -> Result<()> {
        self.driver.set_sample_rate(hz)?;
        self.driver
            .set_baseband_filter_bandwidth(baseband_filter_for(hz))
    }
}

impl TcpBackend for HackRfTcp {
    fn dongle_info(&self) -> DongleInfo {
        DongleInfo::new(HACKRF_MAGIC, 0, 0)
    }

    fn supported_commands(&self) -> &'static [TcpCommand] {
        SUPPORTED_COMMANDS
    }

    fn execute(&mut self, command: TcpCommand, argument: u32) -> Result<()> {
        // gains arrive as signed values
        let signed = argument as i32;
        match command {
            TcpCommand::SetFreq => self.driver.set_center_frequency(u64::from(argument)),
            TcpCommand::SetSampleRate => self.set_sample_rate(argument),
            TcpCommand::SetIfTunerGain => self.driver.set_lna_gain(HACKRF_LNA.from_rtl_gain(signed)),
            TcpCommand::SetGain => self.driver.set_vga_gain(HACKRF_VGA.from_rtl_gain(signed)),
            TcpCommand::SetAgcMode | TcpCommand::SetGainMode => {
                // no automatic mode, fall back to gains that work in most places
                self.driver.set_vga_gain(DEFAULT_VGA_GAIN)?;
                self.driver.set_lna_gain(DEFAULT_LNA_GAIN)
            }
            TcpCommand::AndroidGainByPercentage => {
                let percentage = i64::from(signed);
                self.driver.set_lna_gain(HACKRF_LNA.scale(percentage))?;
                self.driver.set_vga_gain(HACKRF_VGA.scale(percentage))
            }
            other => {
                log::warn!("⚠️  Unsupported command {}", other);
                Ok(())
            }
        }
    }

    fn start_rx(&mut self) -> Result<SampleSource> {
        self.driver.start_rx()
    }

    fn stop_rx(&mut self) -> Result<()> {
        log::info!("📻 Stopping HackRF RX");
        self.driver.stop_rx()
    }
}

/// A HackRF reachable through `opener`
pub struct HackRfDevice {
    opener: Mutex<Option<DriverOpener>>,
    runner: SessionRunner,
}

impl HackRfDevice {
    pub fn new(opener: DriverOpener, table: Arc<CommandTable>) -> Self {
        Self {
            opener: Mutex::new(Some(opener)),
            runner: SessionRunner::new("HackRF", table),
        }
    }

    pub fn with_server_config(mut self, config: ServerConfig) -> Self {
        self.runner.config = config;
        self
    }
}

impl SdrDevice for HackRfDevice {
    fn name(&self) -> String {
        self.runner.lifecycle.name().to_string()
    }

    fn supported_commands(&self) -> Vec<u8> {
        SUPPORTED_COMMANDS.iter().map(|c| c.code()).collect()
    }

    fn open_async(&self, args: SdrTcpArguments) {
        let opener = lock(&self.opener).take();
        self.runner.open(args, move |args| {
            let opener = opener.ok_or(SdrError::AlreadyUsed)?;
            log::info!("📻 Opening HackRF");
            let mut tcp = HackRfTcp::new(opener()?);
            log::info!("Initialising TCP");
            tcp.init_device(args)?;
            Ok(tcp)
        });
    }

    fn close(&self) {
        self.runner.close();
    }

    fn add_status_listener(&self, listener: Arc<dyn StatusListener>) {
        self.runner.lifecycle.add_listener(listener);
    }

    fn state(&self) -> DeviceState {
        self.runner.lifecycle.state()
    }
}
