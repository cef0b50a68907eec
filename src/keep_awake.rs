//! Keep-awake resource held while a session is open.
//!
//! The platform side is a [`KeepAwake`] implementation; [`WakeLock`] is the
//! scoped handle that guarantees exactly one release per acquisition.

use log::{debug, info};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

pub trait KeepAwake: Send + Sync {
    fn acquire(&self) -> io::Result<()>;
    fn release(&self);
}

/// Held keep-awake resource. Released on [`WakeLock::release`] or drop, whichever comes first.
pub struct WakeLock {
    resource: Arc<dyn KeepAwake>,
    held: AtomicBool,
}

impl WakeLock {
    pub fn acquire(resource: Arc<dyn KeepAwake>) -> io::Result<Self> {
        resource.acquire()?;
        Ok(Self {
            resource,
            held: AtomicBool::new(true),
        })
    }

    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::SeqCst)
    }

    pub fn release(&self) {
        if self.held.swap(false, Ordering::SeqCst) {
            self.resource.release();
        } else {
            debug!("Wake lock already released");
        }
    }
}

impl Drop for WakeLock {
    fn drop(&mut self) {
        if self.held.swap(false, Ordering::SeqCst) {
            self.resource.release();
        }
    }
}

/// Keep-awake for hosts without a power manager: logs and counts.
#[derive(Debug, Default)]
pub struct LoggingKeepAwake {
    acquired: AtomicUsize,
    released: AtomicUsize,
}

impl LoggingKeepAwake {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquired(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    pub fn is_held(&self) -> bool {
        self.acquired() > self.released()
    }
}

impl KeepAwake for LoggingKeepAwake {
    fn acquire(&self) -> io::Result<()> {
        let count = self.acquired.fetch_add(1, Ordering::SeqCst) + 1;
        info!("🔒 Keep-awake acquired (#{})", count);
        Ok(())
    }

    fn release(&self) {
        let count = self.released.fetch_add(1, Ordering::SeqCst) + 1;
        info!("🔓 Keep-awake released (#{})", count);
    }
}
