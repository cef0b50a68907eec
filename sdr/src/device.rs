use crate::config::SdrTcpArguments;
use crate::error::{panic_message, Result, SdrError};
use crate::lock;
use crate::tcp_server::{SdrTcpServer, ServerConfig, ServerHandle, TcpBackend};
use rtl_tcp_protocol::CommandTable;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::thread;

/// Receives open/closed events from a device.
///
/// Each listener hears `on_closed` at most once per registration.
pub trait StatusListener: Send + Sync {
    /// The server is bound and ready for a client
    fn on_open(&self, device_name: &str);

    /// The session is over; `None` means a clean close
    fn on_closed(&self, error: Option<&SdrError>);
}

/// Capability contract shared by every hardware backend
pub trait SdrDevice: Send + Sync {
    /// Friendly name for display
    fn name(&self) -> String;

    /// Opcodes this backend acts on
    fn supported_commands(&self) -> Vec<u8>;

    /// Start the session in the background. Never blocks and never fails
    /// synchronously; the outcome arrives through the status listeners.
    fn open_async(&self, args: SdrTcpArguments);

    /// Request shutdown without waiting for it. Idempotent.
    fn close(&self);

    fn add_status_listener(&self, listener: Arc<dyn StatusListener>);

    fn state(&self) -> DeviceState;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Idle,
    Opening,
    Open,
    Closing,
    Closed,
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// What a close request has to do next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseAction {
    /// A session is in flight and has to be torn down
    Teardown,
    /// Nothing was running; listeners were already told
    ClosedImmediately,
    /// Already closing or closed
    Nothing,
}

struct LifecycleInner {
    state: DeviceState,
    listeners: Vec<Arc<dyn StatusListener>>,
}

/// State machine and listener list of one device.
///
/// `Idle -> Opening -> Open -> Closing -> Closed`, with `Opening -> Closed`
/// on failure. Nothing leaves `Closed`. Listeners are copied or drained under
/// the lock and invoked outside it.
pub struct DeviceLifecycle {
    name: String,
    inner: Mutex<LifecycleInner>,
}

impl DeviceLifecycle {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inner: Mutex::new(LifecycleInner {
                state: DeviceState::Idle,
                listeners: Vec::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> DeviceState {
        lock(&self.inner).state
    }

    pub fn add_listener(&self, listener: Arc<dyn StatusListener>) {
        lock(&self.inner).listeners.push(listener);
    }

    /// `Idle -> Opening`, or [`SdrError::AlreadyUsed`] from any other state
    pub fn begin_open(&self) -> Result<()> {
        let mut inner = lock(&self.inner);
        match inner.state {
            DeviceState::Idle => {
                inner.state = DeviceState::Opening;
                log::debug!("{}: Idle -> Opening", self.name);
                Ok(())
            }
            _ => Err(SdrError::AlreadyUsed),
        }
    }

    /// `Opening -> Open` and notify. Returns false if a close got there first.
    pub fn announce_open(&self) -> bool {
        let listeners = {
            let mut inner = lock(&self.inner);
            if inner.state != DeviceState::Opening {
                return false;
            }
            inner.state = DeviceState::Open;
            inner.listeners.clone()
        };
        log::info!("✅ {} is ready to accept clients", self.name);
        for listener in listeners {
            listener.on_open(&self.name);
        }
        true
    }

    pub fn begin_close(&self) -> CloseAction {
        let previous = {
            let mut inner = lock(&self.inner);
            let previous = inner.state;
            match previous {
                DeviceState::Idle => inner.state = DeviceState::Closed,
                DeviceState::Opening | DeviceState::Open => inner.state = DeviceState::Closing,
                DeviceState::Closing | DeviceState::Closed => {}
            }
            previous
        };
        match previous {
            DeviceState::Idle => {
                log::debug!("{}: closed before it was opened", self.name);
                self.announce_closed(None);
                CloseAction::ClosedImmediately
            }
            DeviceState::Opening | DeviceState::Open => {
                log::debug!("{}: {} -> Closing", self.name, previous);
                CloseAction::Teardown
            }
            DeviceState::Closing | DeviceState::Closed => CloseAction::Nothing,
        }
    }

    /// Move to `Closed` and deliver the close to every registered listener exactly once
    pub fn announce_closed(&self, error: Option<SdrError>) {
        let listeners = {
            let mut inner = lock(&self.inner);
            inner.state = DeviceState::Closed;
            std::mem::take(&mut inner.listeners)
        };
        match &error {
            None => log::info!("🔌 {} closed", self.name),
            Some(e) => log::warn!("🔌 {} closed due to {}", self.name, e),
        }
        for listener in listeners {
            listener.on_closed(error.as_ref());
        }
    }
}

/// Per-device session plumbing shared by the hardware families
pub(crate) struct SessionRunner {
    pub lifecycle: Arc<DeviceLifecycle>,
    pub handle: ServerHandle,
    pub table: Arc<CommandTable>,
    pub config: ServerConfig,
}

impl SessionRunner {
    pub fn new(name: impl Into<String>, table: Arc<CommandTable>) -> Self {
        Self {
            lifecycle: Arc::new(DeviceLifecycle::new(name)),
            handle: ServerHandle::new(),
            table,
            config: ServerConfig::default(),
        }
    }

    /// Open on a dedicated thread: build the backend, bind, announce open,
    /// serve, then announce the close. Panics become a closed-with-error.
    pub fn open<B, F>(&self, args: SdrTcpArguments, build: F)
    where
        B: TcpBackend,
        F: FnOnce(&SdrTcpArguments) -> Result<B> + Send + 'static,
    {
        if let Err(e) = self.lifecycle.begin_open() {
            log::warn!("⚠️  {} cannot be opened again", self.lifecycle.name());
            if self.lifecycle.state() == DeviceState::Closed {
                self.lifecycle.announce_closed(Some(e));
            }
            return;
        }

        let lifecycle = Arc::clone(&self.lifecycle);
        let handle = self.handle.clone();
        let table = Arc::clone(&self.table);
        let config = self.config.clone();

        let spawned = thread::Builder::new()
            .name(format!("{}-device", lifecycle.name()))
            .spawn(move || {
                let run = || -> Result<()> {
                    log::info!("📻 Opening {} with {}", lifecycle.name(), args);
                    let backend = build(&args)?;
                    let server = SdrTcpServer::bind(&args, backend, table, handle.clone())?
                        .with_config(config);
                    if !lifecycle.announce_open() {
                        handle.close();
                    }
                    server.serve_and_block()
                };
                let result = panic::catch_unwind(AssertUnwindSafe(run))
                    .unwrap_or_else(|p| Err(SdrError::Panicked(panic_message(p))));
                lifecycle.announce_closed(result.err());
                log::debug!("{} device thread finished", lifecycle.name());
            });

        if let Err(e) = spawned {
            self.lifecycle.announce_closed(Some(e.into()));
        }
    }

    pub fn close(&self) {
        if self.lifecycle.begin_close() == CloseAction::Teardown {
            log::info!("🛑 Closing {}", self.lifecycle.name());
            self.handle.close();
        }
    }
}
