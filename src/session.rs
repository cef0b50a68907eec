//! Single-flight session controller.
//!
//! Requests are queued FIFO and at most one is active. Queuing while a
//! session runs closes it, and the next request is promoted from that
//! session's close notification. The keep-awake resource is held from the
//! moment a session reports open until its close has been processed.

use crate::error::{BridgeError, Result};
use crate::keep_awake::{KeepAwake, WakeLock};
use crate::lock;
use log::{debug, error, info, warn};
use sdr::error::{panic_message, ErrorReport};
use sdr::{SdrDevice, SdrError, SdrTcpArguments, StatusListener};
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

/// How long `enqueue` waits for the active session to close
pub const RESTART_TIMEOUT: Duration = Duration::from_secs(10);
/// Default wait for `stop`
pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(10);

/// Observer of the controller's running state
pub trait StatusCallback: Send + Sync {
    fn on_server_running(&self);
    fn on_server_not_running(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackId(u64);

pub struct SessionRequest {
    pub device: Arc<dyn SdrDevice>,
    pub args: SdrTcpArguments,
}

struct Pending {
    id: u64,
    request: SessionRequest,
}

struct Active {
    id: u64,
    device: Arc<dyn SdrDevice>,
}

#[derive(Default)]
struct State {
    queue: VecDeque<Pending>,
    active: Option<Active>,
    next_id: u64,
    closes_processed: u64,
    wake_lock: Option<WakeLock>,
    last_error: Option<ErrorReport>,
}

struct Shared {
    state: Mutex<State>,
    changed: Condvar,
    callbacks: Mutex<Vec<(CallbackId, Arc<dyn StatusCallback>)>>,
    next_callback: AtomicU64,
    keep_awake: Arc<dyn KeepAwake>,
    restart_timeout: Duration,
}

pub struct SessionController {
    shared: Arc<Shared>,
}

impl SessionController {
    pub fn new(keep_awake: Arc<dyn KeepAwake>) -> Self {
        Self::with_restart_timeout(keep_awake, RESTART_TIMEOUT)
    }

    pub fn with_restart_timeout(keep_awake: Arc<dyn KeepAwake>, restart_timeout: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                changed: Condvar::new(),
                callbacks: Mutex::new(Vec::new()),
                next_callback: AtomicU64::new(0),
                keep_awake,
                restart_timeout,
            }),
        }
    }

    /// Queue a session. Starts it right away when idle; otherwise closes the
    /// active session and waits until that close has been processed.
    pub fn enqueue(&self, device: Arc<dyn SdrDevice>, args: SdrTcpArguments) -> Result<()> {
        let name = device.name();
        let mut state = self.shared.lock_state();
        let id = state.next_id;
        state.next_id += 1;
        state.queue.push_back(Pending {
            id,
            request: SessionRequest { device, args },
        });
        info!(
            "📥 Queued session {} for {} ({} waiting)",
            id,
            name,
            state.queue.len()
        );

        let running = match &state.active {
            Some(active) => Arc::clone(&active.device),
            None => {
                let next = Shared::promote_locked(&mut state);
                drop(state);
                Shared::launch(&self.shared, next);
                return Ok(());
            }
        };
        let seen = state.closes_processed;
        drop(state);

        info!("🔄 Restarting: closing {} for session {}", running.name(), id);
        running.close();

        let state = self.shared.lock_state();
        let (mut state, wait) = self
            .shared
            .changed
            .wait_timeout_while(state, self.shared.restart_timeout, |s| {
                s.closes_processed == seen
            })
            .unwrap_or_else(PoisonError::into_inner);

        if wait.timed_out() {
            let before = state.queue.len();
            state.queue.retain(|pending| pending.id != id);
            if state.queue.len() != before {
                error!(
                    "❌ {} did not close within {:?}, dropping session {}",
                    running.name(),
                    self.shared.restart_timeout,
                    id
                );
                return Err(BridgeError::CannotRestart(self.shared.restart_timeout));
            }
        }
        Ok(())
    }

    /// Drop everything queued, close the active session and wait for idle
    pub fn stop(&self, timeout: Duration) -> Result<()> {
        let device = {
            let mut state = self.shared.lock_state();
            if !state.queue.is_empty() {
                info!("🗑️  Dropping {} queued sessions", state.queue.len());
                state.queue.clear();
            }
            match &state.active {
                Some(active) => Arc::clone(&active.device),
                None => return Ok(()),
            }
        };

        info!("🛑 Stopping {}", device.name());
        device.close();
        if self.wait_until_idle(timeout) {
            Ok(())
        } else {
            error!("❌ {} did not close within {:?}", device.name(), timeout);
            Err(BridgeError::CannotClose(timeout))
        }
    }

    /// Block until no session is active. Returns false on timeout.
    pub fn wait_until_idle(&self, timeout: Duration) -> bool {
        let state = self.shared.lock_state();
        let (state, _) = self
            .shared
            .changed
            .wait_timeout_while(state, timeout, |s| s.active.is_some())
            .unwrap_or_else(PoisonError::into_inner);
        state.active.is_none()
    }

    pub fn is_running(&self) -> bool {
        self.shared.lock_state().active.is_some()
    }

    pub fn queued(&self) -> usize {
        self.shared.lock_state().queue.len()
    }

    pub fn last_error(&self) -> Option<ErrorReport> {
        self.shared.lock_state().last_error.clone()
    }

    pub fn holds_wake_lock(&self) -> bool {
        self.shared.lock_state().wake_lock.is_some()
    }

    /// Register an observer; it is told the current state straight away
    pub fn register_callback(&self, callback: Arc<dyn StatusCallback>) -> CallbackId {
        let id = CallbackId(self.shared.next_callback.fetch_add(1, Ordering::SeqCst));
        lock(&self.shared.callbacks).push((id, Arc::clone(&callback)));
        if self.is_running() {
            callback.on_server_running();
        } else {
            callback.on_server_not_running();
        }
        id
    }

    pub fn unregister_callback(&self, id: CallbackId) -> bool {
        let mut callbacks = lock(&self.shared.callbacks);
        let before = callbacks.len();
        callbacks.retain(|(registered, _)| *registered != id);
        callbacks.len() != before
    }
}

impl Shared {
    fn lock_state(&self) -> MutexGuard<'_, State> {
        lock(&self.state)
    }

    /// Pop the head of the queue into the active slot, or go idle.
    /// The session listener is added by `launch`, outside the state lock.
    fn promote_locked(state: &mut State) -> Option<Pending> {
        let pending = state.queue.pop_front()?;
        state.active = Some(Active {
            id: pending.id,
            device: Arc::clone(&pending.request.device),
        });
        Some(pending)
    }

    fn is_active(&self, id: u64) -> bool {
        matches!(&self.lock_state().active, Some(active) if active.id == id)
    }

    /// Open promoted sessions until one is in flight or the queue runs dry
    fn launch(shared: &Arc<Shared>, mut next: Option<Pending>) {
        loop {
            let Some(pending) = next.take() else {
                info!("💤 No sessions left, controller is idle");
                shared.changed.notify_all();
                shared.announce(false);
                return;
            };

            let Pending { id, request } = pending;
            let SessionRequest { device, args } = request;
            let name = device.name();
            info!("▶️  Starting session {} with {}", id, name);
            shared.announce(true);

            device.add_status_listener(Arc::new(SessionListener {
                shared: Arc::downgrade(shared),
                session: id,
            }));
            // a device may report its close from inside add_status_listener
            if !shared.is_active(id) {
                debug!("Session {} closed before it was opened", id);
                return;
            }

            let opened = panic::catch_unwind(AssertUnwindSafe(|| device.open_async(args)));
            let Err(payload) = opened else {
                return;
            };

            let err = SdrError::Panicked(panic_message(payload));
            error!("💥 Opening {} failed: {}", name, err);
            match Shared::finish(shared, id, Some(&err)) {
                Some(following) => next = following,
                None => return,
            }
        }
    }

    /// Retire the active session. `None` if `id` is no longer active,
    /// otherwise whatever got promoted in its place.
    fn finish(shared: &Arc<Shared>, id: u64, error: Option<&SdrError>) -> Option<Option<Pending>> {
        let next = {
            let mut state = shared.lock_state();
            match &state.active {
                Some(active) if active.id == id => {}
                _ => {
                    debug!("Ignoring close of stale session {}", id);
                    return None;
                }
            }
            state.active = None;
            state.closes_processed += 1;
            if let Some(err) = error {
                state.last_error = Some(ErrorReport::from(err));
            }
            if let Some(wake_lock) = state.wake_lock.take() {
                wake_lock.release();
            }
            Shared::promote_locked(&mut state)
        };
        shared.changed.notify_all();
        Some(next)
    }

    fn session_opened(&self, id: u64) {
        let mut state = self.lock_state();
        if !matches!(&state.active, Some(active) if active.id == id) {
            debug!("Session {} opened after it was retired", id);
            return;
        }
        if state.wake_lock.is_none() {
            match WakeLock::acquire(Arc::clone(&self.keep_awake)) {
                Ok(wake_lock) => state.wake_lock = Some(wake_lock),
                Err(e) => warn!("⚠️  Could not acquire keep-awake: {}", e),
            }
        }
    }

    fn session_closed(shared: &Arc<Shared>, id: u64, error: Option<&SdrError>) {
        match error {
            None => info!("⏹️  Session {} closed", id),
            Some(e) => warn!("⏹️  Session {} closed with error: {}", id, e),
        }
        if let Some(next) = Shared::finish(shared, id, error) {
            Shared::launch(shared, next);
        }
    }

    fn announce(&self, running: bool) {
        let callbacks: Vec<_> = lock(&self.callbacks)
            .iter()
            .map(|(_, callback)| Arc::clone(callback))
            .collect();
        for callback in callbacks {
            if running {
                callback.on_server_running();
            } else {
                callback.on_server_not_running();
            }
        }
    }
}

struct SessionListener {
    shared: Weak<Shared>,
    session: u64,
}

impl StatusListener for SessionListener {
    fn on_open(&self, device_name: &str) {
        if let Some(shared) = self.shared.upgrade() {
            info!("✅ Session {} is serving {}", self.session, device_name);
            shared.session_opened(self.session);
        }
    }

    fn on_closed(&self, error: Option<&SdrError>) {
        if let Some(shared) = self.shared.upgrade() {
            Shared::session_closed(&shared, self.session, error);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keep_awake::LoggingKeepAwake;
    use crossbeam::channel::bounded;
    use std::sync::atomic::AtomicBool;
    use std::thread;
    use sdr::error::ErrorReason;
    use sdr::{CloseAction, DeviceLifecycle, DeviceState};

    type Journal = Arc<Mutex<Vec<String>>>;

    /// In-memory device: opens synchronously, closes on request unless stuck
    struct FakeDevice {
        lifecycle: DeviceLifecycle,
        journal: Journal,
        stuck: bool,
    }

    impl FakeDevice {
        fn new(name: &str, journal: &Journal) -> Arc<Self> {
            Arc::new(Self {
                lifecycle: DeviceLifecycle::new(name),
                journal: Arc::clone(journal),
                stuck: false,
            })
        }

        fn stuck(name: &str, journal: &Journal) -> Arc<Self> {
            Arc::new(Self {
                lifecycle: DeviceLifecycle::new(name),
                journal: Arc::clone(journal),
                stuck: true,
            })
        }

        fn record(&self, what: &str) {
            lock(&self.journal).push(format!("{} {}", what, self.lifecycle.name()));
        }
    }

    impl SdrDevice for FakeDevice {
        fn name(&self) -> String {
            self.lifecycle.name().to_string()
        }

        fn supported_commands(&self) -> Vec<u8> {
            Vec::new()
        }

        fn open_async(&self, _args: SdrTcpArguments) {
            if let Err(e) = self.lifecycle.begin_open() {
                self.lifecycle.announce_closed(Some(e));
                return;
            }
            self.record("open");
            self.lifecycle.announce_open();
        }

        fn close(&self) {
            self.record("close");
            if self.lifecycle.begin_close() == CloseAction::Teardown && !self.stuck {
                self.lifecycle.announce_closed(None);
            }
        }

        fn add_status_listener(&self, listener: Arc<dyn StatusListener>) {
            self.lifecycle.add_listener(listener);
        }

        fn state(&self) -> DeviceState {
            self.lifecycle.state()
        }
    }

    struct PanickingDevice;

    impl SdrDevice for PanickingDevice {
        fn name(&self) -> String {
            "panicking".to_string()
        }

        fn supported_commands(&self) -> Vec<u8> {
            Vec::new()
        }

        fn open_async(&self, _args: SdrTcpArguments) {
            panic!("driver exploded");
        }

        fn close(&self) {}

        fn add_status_listener(&self, _listener: Arc<dyn StatusListener>) {}

        fn state(&self) -> DeviceState {
            DeviceState::Idle
        }
    }

    /// Already retired: answers every new listener with its close right away
    struct RetiredDevice {
        opened: AtomicBool,
    }

    impl SdrDevice for RetiredDevice {
        fn name(&self) -> String {
            "retired".to_string()
        }

        fn supported_commands(&self) -> Vec<u8> {
            Vec::new()
        }

        fn open_async(&self, _args: SdrTcpArguments) {
            self.opened.store(true, Ordering::SeqCst);
        }

        fn close(&self) {}

        fn add_status_listener(&self, listener: Arc<dyn StatusListener>) {
            listener.on_closed(Some(&SdrError::AlreadyUsed));
        }

        fn state(&self) -> DeviceState {
            DeviceState::Closed
        }
    }

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<bool>>,
    }

    impl StatusCallback for Recorder {
        fn on_server_running(&self) {
            lock(&self.events).push(true);
        }

        fn on_server_not_running(&self) {
            lock(&self.events).push(false);
        }
    }

    fn controller() -> (SessionController, Arc<LoggingKeepAwake>) {
        let keep_awake = Arc::new(LoggingKeepAwake::new());
        (SessionController::new(keep_awake.clone()), keep_awake)
    }

    #[test]
    fn test_idle_enqueue_starts_immediately() {
        let (controller, keep_awake) = controller();
        let journal = Journal::default();
        let device = FakeDevice::new("a", &journal);

        controller
            .enqueue(device.clone(), SdrTcpArguments::default())
            .unwrap();

        assert!(controller.is_running());
        assert_eq!(device.state(), DeviceState::Open);
        assert!(controller.holds_wake_lock());
        assert_eq!(keep_awake.acquired(), 1);
    }

    #[test]
    fn test_restart_closes_before_promoting() {
        let (controller, keep_awake) = controller();
        let journal = Journal::default();
        let first = FakeDevice::new("a", &journal);
        let second = FakeDevice::new("b", &journal);

        controller
            .enqueue(first.clone(), SdrTcpArguments::default())
            .unwrap();
        controller
            .enqueue(second.clone(), SdrTcpArguments::default())
            .unwrap();

        assert_eq!(*lock(&journal), vec!["open a", "close a", "open b"]);
        assert_eq!(first.state(), DeviceState::Closed);
        assert_eq!(second.state(), DeviceState::Open);
        assert_eq!(keep_awake.acquired(), 2);
        assert_eq!(keep_awake.released(), 1);
    }

    #[test]
    fn test_close_releases_wake_lock_and_goes_idle() {
        let (controller, keep_awake) = controller();
        let recorder = Arc::new(Recorder::default());
        controller.register_callback(recorder.clone());
        let journal = Journal::default();
        let device = FakeDevice::new("a", &journal);

        controller
            .enqueue(device.clone(), SdrTcpArguments::default())
            .unwrap();
        device.close();

        assert!(controller.wait_until_idle(Duration::from_secs(1)));
        assert!(!controller.holds_wake_lock());
        assert!(!keep_awake.is_held());
        assert_eq!(*lock(&recorder.events), vec![false, true, false]);
        assert_eq!(controller.last_error(), None);
    }

    #[test]
    fn test_stuck_session_cannot_restart() {
        let keep_awake = Arc::new(LoggingKeepAwake::new());
        let controller =
            SessionController::with_restart_timeout(keep_awake, Duration::from_millis(100));
        let journal = Journal::default();
        let stuck = FakeDevice::stuck("a", &journal);
        let waiting = FakeDevice::new("b", &journal);

        controller
            .enqueue(stuck.clone(), SdrTcpArguments::default())
            .unwrap();
        let err = controller
            .enqueue(waiting.clone(), SdrTcpArguments::default())
            .unwrap_err();

        assert!(matches!(err, BridgeError::CannotRestart(_)));
        assert_eq!(controller.queued(), 0);

        // the withdrawn request is not promoted by the late close
        stuck.lifecycle.announce_closed(None);
        assert!(controller.wait_until_idle(Duration::from_secs(1)));
        assert_eq!(waiting.state(), DeviceState::Idle);
    }

    #[test]
    fn test_stuck_session_cannot_close() {
        let (controller, _) = controller();
        let journal = Journal::default();
        let stuck = FakeDevice::stuck("a", &journal);
        controller
            .enqueue(stuck.clone(), SdrTcpArguments::default())
            .unwrap();

        let err = controller.stop(Duration::from_millis(100)).unwrap_err();
        assert!(matches!(err, BridgeError::CannotClose(_)));
        assert_eq!(err.reason(), ErrorReason::Replug);

        stuck.lifecycle.announce_closed(None);
        assert!(controller.wait_until_idle(Duration::from_secs(1)));
    }

    #[test]
    fn test_panicking_open_advances_queue() {
        let (controller, _) = controller();
        let journal = Journal::default();
        let next = FakeDevice::new("b", &journal);

        {
            let mut state = controller.shared.lock_state();
            state.queue.push_back(Pending {
                id: 100,
                request: SessionRequest {
                    device: Arc::new(PanickingDevice),
                    args: SdrTcpArguments::default(),
                },
            });
            state.queue.push_back(Pending {
                id: 101,
                request: SessionRequest {
                    device: next.clone(),
                    args: SdrTcpArguments::default(),
                },
            });
        }
        let head = {
            let mut state = controller.shared.lock_state();
            Shared::promote_locked(&mut state)
        };
        Shared::launch(&controller.shared, head);

        let report = controller.last_error().unwrap();
        assert_eq!(report.reason, ErrorReason::UnknownError);
        assert!(report.message.contains("driver exploded"));
        assert_eq!(next.state(), DeviceState::Open);
        assert!(controller.is_running());
    }

    #[test]
    fn test_close_during_listener_registration_does_not_deadlock() {
        let (controller, keep_awake) = controller();
        let controller = Arc::new(controller);
        let retired = Arc::new(RetiredDevice {
            opened: AtomicBool::new(false),
        });
        let journal = Journal::default();
        let next = FakeDevice::new("b", &journal);

        let (done_tx, done_rx) = bounded(1);
        {
            let controller = Arc::clone(&controller);
            let retired = retired.clone();
            let next = next.clone();
            thread::spawn(move || {
                {
                    let mut state = controller.shared.lock_state();
                    let retired: Arc<dyn SdrDevice> = retired;
                    let next: Arc<dyn SdrDevice> = next;
                    for (id, device) in [(200, retired), (201, next)] {
                        state.queue.push_back(Pending {
                            id,
                            request: SessionRequest {
                                device,
                                args: SdrTcpArguments::default(),
                            },
                        });
                    }
                }
                let head = Shared::promote_locked(&mut controller.shared.lock_state());
                Shared::launch(&controller.shared, head);
                let _ = done_tx.send(());
            });
        }

        done_rx
            .recv_timeout(Duration::from_secs(2))
            .expect("launch should not block on its own state lock");
        assert!(!retired.opened.load(Ordering::SeqCst));
        assert_eq!(next.state(), DeviceState::Open);
        assert_eq!(
            controller.last_error().map(|r| r.reason),
            Some(ErrorReason::AlreadyRunning)
        );
        assert_eq!(keep_awake.acquired(), 1);
    }

    #[test]
    fn test_reused_device_reports_already_running() {
        let (controller, _) = controller();
        let journal = Journal::default();
        let device = FakeDevice::new("a", &journal);

        controller
            .enqueue(device.clone(), SdrTcpArguments::default())
            .unwrap();
        controller.stop(CLOSE_TIMEOUT).unwrap();
        controller
            .enqueue(device.clone(), SdrTcpArguments::default())
            .unwrap();

        assert!(controller.wait_until_idle(Duration::from_secs(1)));
        let report = controller.last_error().unwrap();
        assert_eq!(report.reason, ErrorReason::AlreadyRunning);
    }

    #[test]
    fn test_register_reports_current_state() {
        let (controller, _) = controller();
        let journal = Journal::default();
        controller
            .enqueue(FakeDevice::new("a", &journal), SdrTcpArguments::default())
            .unwrap();

        let recorder = Arc::new(Recorder::default());
        let id = controller.register_callback(recorder.clone());
        assert_eq!(*lock(&recorder.events), vec![true]);

        assert!(controller.unregister_callback(id));
        assert!(!controller.unregister_callback(id));
        controller.stop(CLOSE_TIMEOUT).unwrap();
        assert_eq!(*lock(&recorder.events), vec![true]);
    }
}
