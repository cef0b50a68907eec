use crate::error::{Result, SdrError};
use crate::types::SampleSource;

/// Opens the hardware on the device thread; consumed by the first open
pub type DriverOpener = Box<dyn FnOnce() -> Result<Box<dyn TunerDriver>> + Send>;

/// Opaque tuner driver.
///
/// Backends only program the tuner through this trait. Everything the
/// hardware does not offer reports [`SdrError::Unsupported`].
pub trait TunerDriver: Send {
    fn tuner_type(&self) -> u32 {
        0
    }

    /// Supported tuner gains in tenths of a dB, ascending
    fn gain_table(&self) -> Vec<i32> {
        Vec::new()
    }

    fn set_center_frequency(&mut self, hz: u64) -> Result<()>;

    fn set_sample_rate(&mut self, hz: u32) -> Result<()>;

    fn set_baseband_filter_bandwidth(&mut self, _hz: u32) -> Result<()> {
        Err(SdrError::unsupported("baseband filter bandwidth"))
    }

    fn set_lna_gain(&mut self, _value: u32) -> Result<()> {
        Err(SdrError::unsupported("LNA gain"))
    }

    fn set_vga_gain(&mut self, _value: u32) -> Result<()> {
        Err(SdrError::unsupported("VGA gain"))
    }

    fn set_tuner_gain_mode(&mut self, _manual: bool) -> Result<()> {
        Err(SdrError::unsupported("tuner gain mode"))
    }

    fn set_tuner_gain(&mut self, _tenths_of_db: i32) -> Result<()> {
        Err(SdrError::unsupported("tuner gain"))
    }

    fn set_freq_correction(&mut self, _ppm: i32) -> Result<()> {
        Err(SdrError::unsupported("frequency correction"))
    }

    fn set_tuner_if_gain(&mut self, _stage: u16, _gain: i16) -> Result<()> {
        Err(SdrError::unsupported("IF gain"))
    }

    fn set_test_mode(&mut self, _enabled: bool) -> Result<()> {
        Err(SdrError::unsupported("test mode"))
    }

    fn set_agc_mode(&mut self, _enabled: bool) -> Result<()> {
        Err(SdrError::unsupported("AGC mode"))
    }

    fn set_direct_sampling(&mut self, _mode: u32) -> Result<()> {
        Err(SdrError::unsupported("direct sampling"))
    }

    fn set_offset_tuning(&mut self, _enabled: bool) -> Result<()> {
        Err(SdrError::unsupported("offset tuning"))
    }

    /// A zero leaves that crystal unchanged
    fn set_xtal_freq(&mut self, _rtl_hz: u32, _tuner_hz: u32) -> Result<()> {
        Err(SdrError::unsupported("crystal frequency"))
    }

    /// Start sample delivery through a bounded queue
    fn start_rx(&mut self) -> Result<SampleSource>;

    fn stop_rx(&mut self) -> Result<()>;
}
