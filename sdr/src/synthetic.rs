//! Software tuner: a test tone through the same bounded queue and buffer
//! pool a real driver uses. Every call is recorded and any call can be made
//! to fail with a driver code.

use crate::driver::{DriverOpener, TunerDriver};
use crate::error::{Result, SdrError};
use crate::lock;
use crate::types::{queue_depth, SampleFormat, SampleSource, SAMPLE_BUFFER_SIZE};
use crossbeam::channel::{bounded, Receiver, SendTimeoutError, Sender, TryRecvError};
use crossbeam::select;
use std::collections::HashMap;
use std::f64::consts::TAU;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use strum::EnumDiscriminants;

/// R820T gain table in tenths of a dB
pub const R820T_GAINS: [i32; 29] = [
    0, 9, 14, 27, 37, 77, 87, 125, 144, 157, 166, 197, 207, 229, 254, 280, 297, 328, 338, 364, 372,
    386, 402, 421, 434, 439, 445, 480, 496,
];
pub const R820T_TUNER_TYPE: u32 = 5;

const SEND_TIMEOUT: Duration = Duration::from_millis(100);

/// One recorded driver call
#[derive(Debug, Clone, PartialEq, Eq, EnumDiscriminants)]
#[strum_discriminants(name(DriverCallKind), derive(Hash))]
pub enum DriverCall {
    CenterFrequency(u64),
    SampleRate(u32),
    BasebandFilter(u32),
    LnaGain(u32),
    VgaGain(u32),
    TunerGainMode(bool),
    TunerGain(i32),
    FreqCorrection(i32),
    IfGain { stage: u16, gain: i16 },
    TestMode(bool),
    AgcMode(bool),
    DirectSampling(u32),
    OffsetTuning(bool),
    Xtal { rtl_hz: u32, tuner_hz: u32 },
    StartRx,
    StopRx,
}

#[derive(Debug, Clone)]
pub struct SyntheticConfig {
    pub format: SampleFormat,
    pub tuner_type: u32,
    pub gain_table: Vec<i32>,
    /// Tone offset from the center frequency
    pub tone_offset_hz: f64,
    pub buffer_size: usize,
    /// Produce at the configured sample rate instead of as fast as possible
    pub paced: bool,
}

impl SyntheticConfig {
    /// Signed samples, no gain table
    pub fn hackrf() -> Self {
        Self {
            format: SampleFormat::Signed8,
            tuner_type: 0,
            gain_table: Vec::new(),
            tone_offset_hz: 10_000.0,
            buffer_size: SAMPLE_BUFFER_SIZE,
            paced: true,
        }
    }

    /// Unsigned samples behind an R820T
    pub fn rtlsdr() -> Self {
        Self {
            format: SampleFormat::Unsigned8,
            tuner_type: R820T_TUNER_TYPE,
            gain_table: R820T_GAINS.to_vec(),
            ..Self::hackrf()
        }
    }
}

#[derive(Default)]
struct Shared {
    calls: Vec<DriverCall>,
    failures: HashMap<DriverCallKind, i32>,
    streaming: bool,
}

/// Inspection handle that stays valid after the driver moves into a backend
#[derive(Clone)]
pub struct SyntheticProbe {
    shared: Arc<Mutex<Shared>>,
}

impl SyntheticProbe {
    pub fn calls(&self) -> Vec<DriverCall> {
        lock(&self.shared).calls.clone()
    }

    pub fn count(&self, kind: DriverCallKind) -> usize {
        lock(&self.shared)
            .calls
            .iter()
            .filter(|c| DriverCallKind::from(*c) == kind)
            .count()
    }

    pub fn is_streaming(&self) -> bool {
        lock(&self.shared).streaming
    }

    /// Make every later call of `kind` fail with `code`
    pub fn fail_on(&self, kind: DriverCallKind, code: i32) {
        lock(&self.shared).failures.insert(kind, code);
    }
}

struct Producer {
    /// Dropped to stop the producer, which also wakes it from pacing
    stop: Sender<()>,
    thread: JoinHandle<()>,
}

pub struct SyntheticDriver {
    config: SyntheticConfig,
    shared: Arc<Mutex<Shared>>,
    sample_rate: u32,
    producer: Option<Producer>,
}

impl SyntheticDriver {
    pub fn new(config: SyntheticConfig) -> Self {
        Self {
            config,
            shared: Arc::default(),
            sample_rate: 0,
            producer: None,
        }
    }

    pub fn probe(&self) -> SyntheticProbe {
        SyntheticProbe {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn fail_on(&self, kind: DriverCallKind, code: i32) {
        self.probe().fail_on(kind, code);
    }

    /// Hand this driver out on first open
    pub fn opener(self) -> DriverOpener {
        Box::new(move || Ok(Box::new(self) as Box<dyn TunerDriver>))
    }

    /// An opener for hardware that cannot be opened
    pub fn failing_opener(code: i32) -> DriverOpener {
        Box::new(move || Err(SdrError::from_code(code)))
    }

    fn record(&self, call: DriverCall) -> Result<()> {
        let mut shared = lock(&self.shared);
        let kind = DriverCallKind::from(&call);
        shared.calls.push(call);
        match shared.failures.get(&kind) {
            Some(&code) => Err(SdrError::from_code(code)),
            None => Ok(()),
        }
    }

    fn stop_producer(&mut self) {
        if let Some(producer) = self.producer.take() {
            drop(producer.stop);
            if producer.thread.join().is_err() {
                log::error!("Synthetic producer panicked");
            }
            lock(&self.shared).streaming = false;
        }
    }
}

impl TunerDriver for SyntheticDriver {
    fn tuner_type(&self) -> u32 {
        self.config.tuner_type
    }

    fn gain_table(&self) -> Vec<i32> {
        self.config.gain_table.clone()
    }

    fn set_center_frequency(&mut self, hz: u64) -> Result<()> {
        self.record(DriverCall::CenterFrequency(hz))
    }

    fn set_sample_rate(&mut self, hz: u32) -> Result<()> {
        self.record(DriverCall::SampleRate(hz))?;
        self.sample_rate = hz;
        Ok(())
    }

    fn set_baseband_filter_bandwidth(&mut self, hz: u32) -> Result<()> {
        self.record(DriverCall::BasebandFilter(hz))
    }

    fn set_lna_gain(&mut self, value: u32) -> Result<()> {
        self.record(DriverCall::LnaGain(value))
    }

    fn set_vga_gain(&mut self, value: u32) -> Result<()> {
        self.record(DriverCall::VgaGain(value))
    }

    fn set_tuner_gain_mode(&mut self, manual: bool) -> Result<()> {
        self.record(DriverCall::TunerGainMode(manual))
    }

    fn set_tuner_gain(&mut self, tenths_of_db: i32) -> Result<()> {
        self.record(DriverCall::TunerGain(tenths_of_db))
    }

    fn set_freq_correction(&mut self, ppm: i32) -> Result<()> {
        self.record(DriverCall::FreqCorrection(ppm))
    }

    fn set_tuner_if_gain(&mut self, stage: u16, gain: i16) -> Result<()> {
        self.record(DriverCall::IfGain { stage, gain })
    }

    fn set_test_mode(&mut self, enabled: bool) -> Result<()> {
        self.record(DriverCall::TestMode(enabled))
    }

    fn set_agc_mode(&mut self, enabled: bool) -> Result<()> {
        self.record(DriverCall::AgcMode(enabled))
    }

    fn set_direct_sampling(&mut self, mode: u32) -> Result<()> {
        self.record(DriverCall::DirectSampling(mode))
    }

    fn set_offset_tuning(&mut self, enabled: bool) -> Result<()> {
        self.record(DriverCall::OffsetTuning(enabled))
    }

    fn set_xtal_freq(&mut self, rtl_hz: u32, tuner_hz: u32) -> Result<()> {
        self.record(DriverCall::Xtal { rtl_hz, tuner_hz })
    }

    fn start_rx(&mut self) -> Result<SampleSource> {
        if self.producer.is_some() {
            return Err(SdrError::InvalidArgument("RX already running".to_string()));
        }
        self.record(DriverCall::StartRx)?;

        let depth = queue_depth(self.sample_rate);
        let (samples_tx, samples_rx) = bounded(depth);
        let (pool_tx, pool_rx) = bounded(depth);
        let (stop, stop_rx) = bounded::<()>(0);

        let tone = ToneGenerator::new(&self.config, self.sample_rate);
        let thread = thread::Builder::new()
            .name("synthetic-rx".to_string())
            .spawn(move || tone.run(samples_tx, pool_rx, stop_rx))?;

        self.producer = Some(Producer { stop, thread });
        lock(&self.shared).streaming = true;
        log::debug!("Synthetic RX started, queue depth {}", depth);
        Ok(SampleSource::new(samples_rx, self.config.format).with_pool(pool_tx))
    }

    fn stop_rx(&mut self) -> Result<()> {
        self.stop_producer();
        self.record(DriverCall::StopRx)
    }
}

impl Drop for SyntheticDriver {
    fn drop(&mut self) {
        self.stop_producer();
    }
}

struct ToneGenerator {
    format: SampleFormat,
    buffer_size: usize,
    step: f64,
    pace: Option<Duration>,
}

impl ToneGenerator {
    fn new(config: &SyntheticConfig, sample_rate: u32) -> Self {
        let rate = f64::from(sample_rate.max(1));
        let pace = config
            .paced
            .then(|| Duration::from_secs_f64((config.buffer_size / 2) as f64 / rate));
        Self {
            format: config.format,
            buffer_size: config.buffer_size,
            step: TAU * config.tone_offset_hz / rate,
            pace,
        }
    }

    fn encode(&self, v: f64) -> u8 {
        match self.format {
            SampleFormat::Unsigned8 => (127.5 + 127.0 * v) as u8,
            SampleFormat::Signed8 => (127.0 * v).round() as i8 as u8,
        }
    }

    fn run(self, samples: Sender<Vec<u8>>, pool: Receiver<Vec<u8>>, stop: Receiver<()>) {
        let mut phase = 0.0f64;
        while let Err(TryRecvError::Empty) = stop.try_recv() {
            let mut buf = pool.try_recv().unwrap_or_default();
            buf.resize(self.buffer_size, 0);
            for pair in buf.chunks_exact_mut(2) {
                pair[0] = self.encode(phase.cos());
                pair[1] = self.encode(phase.sin());
                phase = (phase + self.step) % TAU;
            }

            match samples.send_timeout(buf, SEND_TIMEOUT) {
                Ok(()) => {}
                // consumer is behind, drop the buffer
                Err(SendTimeoutError::Timeout(_)) => continue,
                Err(SendTimeoutError::Disconnected(_)) => break,
            }
            if let Some(pace) = self.pace {
                select! {
                    recv(stop) -> _ => break,
                    default(pace) => {}
                }
            }
        }
        log::debug!("Synthetic producer stopped");
    }
}
