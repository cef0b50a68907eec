//! RTL-SDR family: commands pass straight through to the native driver.

use crate::config::SdrTcpArguments;
use crate::device::{DeviceState, SdrDevice, SessionRunner, StatusListener};
use crate::driver::{DriverOpener, TunerDriver};
use crate::error::{codes, DriverErrorKind, Result, SdrError};
use crate::gain::table_index_for_percentage;
use crate::lock;
use crate::tcp_server::{ServerConfig, TcpBackend};
use crate::types::SampleSource;
use rtl_tcp_protocol::{CommandTable, DongleInfo, TcpCommand};
use std::sync::{Arc, Mutex};

pub const RTLSDR_MAGIC: [u8; 4] = *b"RTL0";

pub const SUPPORTED_COMMANDS: &[TcpCommand] = &[
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
];

/// Split a SET_IF_TUNER_GAIN argument into stage (high half) and signed gain (low half)
pub fn split_if_gain(argument: u32) -> (u16, i16) {
    ((argument >> 16) as u16, (argument & 0xffff) as u16 as i16)
}

pub struct RtlSdrTcp {
    driver: Box<dyn TunerDriver>,
    gains: Vec<i32>,
}

impl RtlSdrTcp {
    pub fn new(driver: Box<dyn TunerDriver>) -> Self {
        let gains = driver.gain_table();
        Self { driver, gains }
    }

    /// Apply the startup arguments the way rtl_tcp does.
    ///
    /// Only sample rate and frequency are fatal; a sample rate the dongle
    /// cannot reach over USB usually means it is underpowered.
    pub fn init_device(&mut self, args: &SdrTcpArguments) -> Result<()> {
        if args.ppm != 0 {
            if let Err(e) = self.driver.set_freq_correction(args.ppm) {
                log::warn!("⚠️  Failed to set ppm to {}: {}", args.ppm, e);
            }
        }

        let sample_rate = u32::try_from(args.sample_rate_hz)
            .map_err(|_| SdrError::from_code(codes::EXIT_WRONG_ARGS))?;
        if let Err(e) = self.driver.set_sample_rate(sample_rate) {
            log::error!("Failed to set sample rate to {}: {}", sample_rate, e);
            let code = match e.code() {
                Some(codes::LIBUSB_ERROR_IO) | Some(codes::LIBUSB_ERROR_TIMEOUT) => {
                    codes::EXIT_NOT_ENOUGH_POWER
                }
                _ if e.kind() == DriverErrorKind::Timeout => codes::EXIT_NOT_ENOUGH_POWER,
                _ => codes::EXIT_WRONG_ARGS,
            };
            return Err(SdrError::from_code(code));
        }
        log::info!("Set sampling rate to {}", sample_rate);

        let frequency = u64::try_from(args.frequency_hz)
            .map_err(|_| SdrError::from_code(codes::EXIT_WRONG_ARGS))?;
        if let Err(e) = self.driver.set_center_frequency(frequency) {
            log::error!("Failed to set frequency to {}: {}", frequency, e);
            return Err(SdrError::from_code(codes::EXIT_WRONG_ARGS));
        }

        if args.gain == 0 {
            if let Err(e) = self.driver.set_tuner_gain_mode(false) {
                log::warn!("⚠️  Failed to enable automatic gain: {}", e);
            }
        } else {
            if let Err(e) = self.driver.set_tuner_gain_mode(true) {
                log::warn!("⚠️  Failed to enable manual gain: {}", e);
            }
            match self.driver.set_tuner_gain(args.gain) {
                Ok(()) => log::info!("Tuner gain set to {} dB", f64::from(args.gain) / 10.0),
                Err(e) => log::warn!("⚠️  Failed to set tuner gain: {}", e),
            }
        }
        Ok(())
    }

    fn dispatch(&mut self, command: TcpCommand, argument: u32) -> Result<()> {
        let signed = argument as i32;
        match command {
            TcpCommand::SetFreq => self.driver.set_center_frequency(u64::from(argument)),
            TcpCommand::SetSampleRate => self.driver.set_sample_rate(argument),
            TcpCommand::SetGainMode => self.driver.set_tuner_gain_mode(argument != 0),
            TcpCommand::SetGain => self.driver.set_tuner_gain(signed),
            TcpCommand::SetFreqCorrection => self.driver.set_freq_correction(signed),
            TcpCommand::SetIfTunerGain => {
                let (stage, gain) = split_if_gain(argument);
                self.driver.set_tuner_if_gain(stage, gain)
            }
            TcpCommand::SetTestMode => self.driver.set_test_mode(argument != 0),
            TcpCommand::SetAgcMode => self.driver.set_agc_mode(argument != 0),
            TcpCommand::SetDirectSampling => self.driver.set_direct_sampling(argument),
            TcpCommand::SetOffsetTuning => self.driver.set_offset_tuning(argument != 0),
            TcpCommand::SetRtlXtal => self.driver.set_xtal_freq(argument, 0),
            TcpCommand::SetTunerXtal => self.driver.set_xtal_freq(0, argument),
            TcpCommand::SetTunerGainById => match self.gains.get(argument as usize) {
                Some(&gain) => self.driver.set_tuner_gain(gain),
                None => {
                    log::debug!("Gain index {} out of range", argument);
                    Ok(())
                }
            },
            TcpCommand::AndroidGainByPercentage => {
                match table_index_for_percentage(argument, self.gains.len()) {
                    Some(index) => self.driver.set_tuner_gain(self.gains[index]),
                    None => Ok(()),
                }
            }
            other => {
                log::warn!("⚠️  Unsupported command {}", other);
                Ok(())
            }
        }
    }
}

impl TcpBackend for RtlSdrTcp {
    fn dongle_info(&self) -> DongleInfo {
        DongleInfo::new(
            RTLSDR_MAGIC,
            self.driver.tuner_type(),
            self.gains.len() as u32,
        )
    }

    fn supported_commands(&self) -> &'static [TcpCommand] {
        SUPPORTED_COMMANDS
    }

    /// The dongle keeps streaming whatever a single command does, so
    /// driver failures are logged rather than ending the session.
    fn execute(&mut self, command: TcpCommand, argument: u32) -> Result<()> {
        if let Err(e) = self.dispatch(command, argument) {
            log::warn!("⚠️  {} {} failed: {}", command, argument, e);
        }
        Ok(())
    }

    fn start_rx(&mut self) -> Result<SampleSource> {
        self.driver.start_rx()
    }

    fn stop_rx(&mut self) -> Result<()> {
        log::info!("📻 Stopping RTL-SDR RX");
        self.driver.stop_rx()
    }
}

/// An RTL2832U dongle reachable through `opener`
pub struct RtlSdrDevice {
    opener: Mutex<Option<DriverOpener>>,
    runner: SessionRunner,
}

impl RtlSdrDevice {
    /// `path` is the USB device path, used for display only
    pub fn new(path: &str, opener: DriverOpener, table: Arc<CommandTable>) -> Self {
        Self {
            opener: Mutex::new(Some(opener)),
            runner: SessionRunner::new(format!("rtl-sdr {}", path), table),
        }
    }

    pub fn with_server_config(mut self, config: ServerConfig) -> Self {
        self.runner.config = config;
        self
    }
}

impl SdrDevice for RtlSdrDevice {
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
            let mut tcp = RtlSdrTcp::new(opener()?);
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synthetic::{DriverCall, DriverCallKind, SyntheticConfig, SyntheticDriver, SyntheticProbe};

    fn backend_with(driver: SyntheticDriver) -> (RtlSdrTcp, SyntheticProbe) {
        let probe = driver.probe();
        (RtlSdrTcp::new(Box::new(driver)), probe)
    }

    fn backend() -> (RtlSdrTcp, SyntheticProbe) {
        backend_with(SyntheticDriver::new(SyntheticConfig::rtlsdr()))
    }

    #[test]
    fn test_header_reports_tuner_and_gains() {
        let (tcp, _) = backend();
        let info = tcp.dongle_info();
        assert_eq!(info.magic, *b"RTL0");
        assert_eq!(info.tuner_type, 5);
        assert_eq!(info.gain_count, 29);
    }

    #[test]
    fn test_if_gain_split() {
        assert_eq!(split_if_gain(0x0003_fff6), (3, -10));
        assert_eq!(split_if_gain(0x0001_0064), (1, 100));
    }

    #[test]
    fn test_pass_through_commands() {
        let (mut tcp, probe) = backend();
        tcp.execute(TcpCommand::SetFreq, 433_920_000).unwrap();
        tcp.execute(TcpCommand::SetFreqCorrection, (-3i32) as u32).unwrap();
        tcp.execute(TcpCommand::SetIfTunerGain, 0x0002_ffff).unwrap();
        tcp.execute(TcpCommand::SetRtlXtal, 28_800_000).unwrap();
        tcp.execute(TcpCommand::SetTunerXtal, 16_000_000).unwrap();
        tcp.execute(TcpCommand::SetDirectSampling, 2).unwrap();
        assert_eq!(
            probe.calls(),
            vec![
                DriverCall::CenterFrequency(433_920_000),
                DriverCall::FreqCorrection(-3),
                DriverCall::IfGain { stage: 2, gain: -1 },
                DriverCall::Xtal {
                    rtl_hz: 28_800_000,
                    tuner_hz: 0
                },
                DriverCall::Xtal {
                    rtl_hz: 0,
                    tuner_hz: 16_000_000
                },
                DriverCall::DirectSampling(2),
            ]
        );
    }

    #[test]
    fn test_gain_by_index_and_percentage() {
        let (mut tcp, probe) = backend();
        tcp.execute(TcpCommand::SetTunerGainById, 0).unwrap();
        tcp.execute(TcpCommand::SetTunerGainById, 28).unwrap();
        tcp.execute(TcpCommand::SetTunerGainById, 29).unwrap();
        tcp.execute(TcpCommand::AndroidGainByPercentage, 50).unwrap();
        tcp.execute(TcpCommand::AndroidGainByPercentage, 100).unwrap();
        assert_eq!(
            probe.calls(),
            vec![
                DriverCall::TunerGain(0),
                DriverCall::TunerGain(496),
                DriverCall::TunerGain(254),
                DriverCall::TunerGain(496),
            ]
        );
    }

    #[test]
    fn test_command_failures_do_not_end_the_session() {
        let driver = SyntheticDriver::new(SyntheticConfig::rtlsdr());
        driver.fail_on(DriverCallKind::TestMode, codes::LIBUSB_ERROR_PIPE);
        let (mut tcp, _) = backend_with(driver);
        assert!(tcp.execute(TcpCommand::SetTestMode, 1).is_ok());
    }

    #[test]
    fn test_init_with_automatic_gain() {
        let (mut tcp, probe) = backend();
        let args = SdrTcpArguments {
            gain: 0,
            ppm: 12,
            ..SdrTcpArguments::default()
        };
        tcp.init_device(&args).unwrap();
        assert_eq!(
            probe.calls(),
            vec![
                DriverCall::FreqCorrection(12),
                DriverCall::SampleRate(2_048_000),
                DriverCall::CenterFrequency(100_000_000),
                DriverCall::TunerGainMode(false),
            ]
        );
    }

    #[test]
    fn test_init_with_manual_gain_skips_zero_ppm() {
        let (mut tcp, probe) = backend();
        tcp.init_device(&SdrTcpArguments::default()).unwrap();
        assert_eq!(
            probe.calls(),
            vec![
                DriverCall::SampleRate(2_048_000),
                DriverCall::CenterFrequency(100_000_000),
                DriverCall::TunerGainMode(true),
                DriverCall::TunerGain(24),
            ]
        );
    }

    #[test]
    fn test_sample_rate_failures_map_to_exit_codes() {
        let driver = SyntheticDriver::new(SyntheticConfig::rtlsdr());
        driver.fail_on(DriverCallKind::SampleRate, codes::LIBUSB_ERROR_TIMEOUT);
        let (mut tcp, _) = backend_with(driver);
        let err = tcp.init_device(&SdrTcpArguments::default()).unwrap_err();
        assert_eq!(err.code(), Some(codes::EXIT_NOT_ENOUGH_POWER));

        let driver = SyntheticDriver::new(SyntheticConfig::rtlsdr());
        driver.fail_on(DriverCallKind::SampleRate, codes::LIBUSB_ERROR_INVALID_PARAM);
        let (mut tcp, _) = backend_with(driver);
        let err = tcp.init_device(&SdrTcpArguments::default()).unwrap_err();
        assert_eq!(err.code(), Some(codes::EXIT_WRONG_ARGS));
    }

    #[test]
    fn test_frequency_failure_is_wrong_args_and_gain_failure_is_not() {
        let driver = SyntheticDriver::new(SyntheticConfig::rtlsdr());
        driver.fail_on(DriverCallKind::TunerGain, codes::LIBUSB_ERROR_IO);
        let (mut tcp, _) = backend_with(driver);
        assert!(tcp.init_device(&SdrTcpArguments::default()).is_ok());

        let driver = SyntheticDriver::new(SyntheticConfig::rtlsdr());
        driver.fail_on(DriverCallKind::CenterFrequency, codes::LIBUSB_ERROR_IO);
        let (mut tcp, _) = backend_with(driver);
        let err = tcp.init_device(&SdrTcpArguments::default()).unwrap_err();
        assert_eq!(err.code(), Some(codes::EXIT_WRONG_ARGS));
    }
}
