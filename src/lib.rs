pub mod config;
pub mod error;
pub mod keep_awake;
pub mod session;

pub use config::{Backend, Cli};
pub use error::{BridgeError, Result};
pub use keep_awake::{KeepAwake, LoggingKeepAwake, WakeLock};
pub use session::{CallbackId, SessionController, SessionRequest, StatusCallback};

use std::sync::{Mutex, MutexGuard, PoisonError};

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
