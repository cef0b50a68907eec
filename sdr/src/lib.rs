pub mod config;
pub mod device;
pub mod driver;
pub mod error;
pub mod gain;
pub mod hackrf;
pub mod rtlsdr;
pub mod synthetic;
pub mod tcp_server;
pub mod types;

pub use config::{ArgumentError, SdrTcpArguments};
pub use device::{CloseAction, DeviceLifecycle, DeviceState, SdrDevice, StatusListener};
pub use driver::{DriverOpener, TunerDriver};
pub use error::{ErrorReason, ErrorReport, Result, SdrError};
pub use hackrf::{HackRfDevice, HackRfTcp};
pub use rtlsdr::{RtlSdrDevice, RtlSdrTcp};
pub use synthetic::{SyntheticConfig, SyntheticDriver, SyntheticProbe};
pub use tcp_server::{SdrTcpServer, ServerConfig, ServerHandle, TcpBackend};

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock, recovering the data if another thread panicked while holding it
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
