use crate::config::SdrTcpArguments;
use crate::error::{Result, SdrError};
use crate::lock;
use crate::types::{to_wire_format, Poll, SampleSource};
use rtl_tcp_protocol::{
    CommandReader, CommandTable, Connection, DongleInfo, ProtocolError, SampleWriter, TcpCommand,
};
use std::collections::HashSet;
use std::io;
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

pub const ACCEPT_TIMEOUT: Duration = Duration::from_secs(20);
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);
pub const ACCEPT_POLL: Duration = Duration::from_millis(50);

/// Hardware family specific half of the server: the header it announces
/// and how commands reach the driver.
pub trait TcpBackend: Send + 'static {
    fn dongle_info(&self) -> DongleInfo;

    fn supported_commands(&self) -> &'static [TcpCommand];

    /// Apply one command. [`TcpCommand::AndroidExit`] never reaches a backend.
    fn execute(&mut self, command: TcpCommand, argument: u32) -> Result<()>;

    fn start_rx(&mut self) -> Result<SampleSource>;

    fn stop_rx(&mut self) -> Result<()>;
}

/// Timing knobs for one server
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub accept_timeout: Duration,
    pub poll_interval: Duration,
    pub accept_poll: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            accept_timeout: ACCEPT_TIMEOUT,
            poll_interval: POLL_INTERVAL,
            accept_poll: ACCEPT_POLL,
        }
    }
}

/// Cancellation handle shared between a server and whoever may close it.
///
/// Closing sets the flag and shuts the client socket down, which unblocks
/// the command reader. Safe to call from any thread, any number of times.
#[derive(Clone, Default)]
pub struct ServerHandle {
    inner: Arc<HandleInner>,
}

#[derive(Default)]
struct HandleInner {
    cancelled: AtomicBool,
    connection: Mutex<Option<TcpStream>>,
}

impl ServerHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn close(&self) {
        if !self.inner.cancelled.swap(true, Ordering::SeqCst) {
            log::debug!("🛑 Server cancellation requested");
        }
        self.shutdown_connection();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
    }

    fn attach(&self, stream: &TcpStream) -> Result<()> {
        *lock(&self.inner.connection) = Some(stream.try_clone()?);
        // close() may have run between accept and attach
        if self.is_cancelled() {
            self.shutdown_connection();
        }
        Ok(())
    }

    fn shutdown_connection(&self) {
        if let Some(stream) = lock(&self.inner.connection).as_ref() {
            // NotConnected once the peer is gone
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}

/// rtl_tcp server for a single session: one listening socket, one client
pub struct SdrTcpServer<B: TcpBackend> {
    listener: TcpListener,
    local_addr: SocketAddr,
    backend: Arc<Mutex<B>>,
    table: Arc<CommandTable>,
    handle: ServerHandle,
    config: ServerConfig,
}

impl<B: TcpBackend> SdrTcpServer<B> {
    /// Bind the listening socket. The server is ready for a client once this returns.
    pub fn bind(
        args: &SdrTcpArguments,
        backend: B,
        table: Arc<CommandTable>,
        handle: ServerHandle,
    ) -> Result<Self> {
        let listener = TcpListener::bind(args.bind_address())?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;
        log::info!("📡 rtl_tcp server listening on {}", local_addr);

        Ok(Self {
            listener,
            local_addr,
            backend: Arc::new(Mutex::new(backend)),
            table,
            handle,
            config: ServerConfig::default(),
        })
    }

    pub fn with_config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn handle(&self) -> ServerHandle {
        self.handle.clone()
    }

    /// Accept one client and serve it until it disconnects, sends EXIT or
    /// the handle is closed. The listening socket is released on return.
    pub fn serve_and_block(self) -> Result<()> {
        let Self {
            listener,
            local_addr,
            backend,
            table,
            handle,
            config,
        } = self;

        log::info!("⏳ Waiting for client on {}...", local_addr);
        let stream = match accept(&listener, &handle, &config) {
            Ok(Some(stream)) => stream,
            Ok(None) => {
                log::info!("🛑 Closed before a client connected");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let mut source: Option<SampleSource> = None;
        let mut command_thread: Option<JoinHandle<Result<()>>> = None;
        let mut writer: Option<SampleWriter> = None;

        let stream_result = (|| {
            handle.attach(&stream)?;
            let (reader, sample_writer) = Connection::new(stream)?.split();
            let writer = writer.insert(sample_writer);

            let supported: HashSet<u8> = lock(&backend)
                .supported_commands()
                .iter()
                .map(|c| c.code())
                .collect();
            let thread_backend = Arc::clone(&backend);
            let thread_handle = handle.clone();
            let thread_table = Arc::clone(&table);
            command_thread = Some(
                thread::Builder::new()
                    .name("rtl-tcp-commands".to_string())
                    .spawn(move || {
                        command_loop(reader, thread_backend, thread_table, supported, thread_handle)
                    })?,
            );

            log::info!("📻 Starting RX");
            let source = source.insert(lock(&backend).start_rx()?);
            let info = lock(&backend).dongle_info();
            writer.write_dongle_info(&info)?;
            log::info!("📤 Sending samples (magic {})", info.magic_str());

            stream_samples(source, writer, &handle, config.poll_interval)
        })();

        // Transport failures caused by our own shutdown or a vanished client are a clean close
        let stream_result = match stream_result {
            Err(SdrError::Io(e)) | Err(SdrError::Protocol(ProtocolError::Io(e)))
                if handle.is_cancelled() || is_disconnect(&e) =>
            {
                log::debug!("Stream ended during shutdown: {}", e);
                Ok(())
            }
            other => other,
        };

        // Teardown
        handle.cancel();
        handle.shutdown_connection();
        if let Some(writer) = writer {
            writer.close();
        }
        drop(listener);

        let command_result = match command_thread {
            Some(thread) => {
                log::debug!("Joining command thread");
                let result = thread
                    .join()
                    .unwrap_or_else(|p| Err(SdrError::Panicked(crate::error::panic_message(p))));
                log::debug!("Command thread has finished");
                result
            }
            None => Ok(()),
        };

        let stop_result = match source {
            Some(source) => {
                let stopped = lock(&backend).stop_rx();
                let returned = source.drain_into_pool();
                log::debug!("Returned {} buffers to the pool", returned);
                stopped
            }
            None => Ok(()),
        };

        log::info!("🔌 Closing rtl_tcp server on {}", local_addr);
        command_result?;
        stream_result?;
        stop_result
    }
}

fn accept(
    listener: &TcpListener,
    handle: &ServerHandle,
    config: &ServerConfig,
) -> Result<Option<TcpStream>> {
    let deadline = Instant::now() + config.accept_timeout;
    loop {
        if handle.is_cancelled() {
            return Ok(None);
        }
        match listener.accept() {
            Ok((stream, addr)) => {
                log::info!("🔌 Client connected from {}", addr);
                stream.set_nonblocking(false)?;
                stream.set_nodelay(true)?;
                return Ok(Some(stream));
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                if Instant::now() >= deadline {
                    return Err(SdrError::AcceptTimeout(config.accept_timeout));
                }
                thread::sleep(config.accept_poll);
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }
}

fn is_disconnect(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
    )
}

fn stream_samples(
    source: &SampleSource,
    writer: &mut SampleWriter,
    handle: &ServerHandle,
    poll_interval: Duration,
) -> Result<()> {
    let format = source.format();
    while !handle.is_cancelled() {
        match source.poll(poll_interval) {
            Poll::Buffer(mut buf) => {
                to_wire_format(format, &mut buf);
                let written = writer.write_samples(&buf);
                source.recycle(buf);
                match written {
                    Ok(()) => {}
                    Err(_) if handle.is_cancelled() => break,
                    Err(ProtocolError::Io(e)) if is_disconnect(&e) => {
                        log::info!("🔌 Client disconnected: {}", e);
                        break;
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            Poll::Empty => {}
            Poll::Closed => {
                if handle.is_cancelled() {
                    break;
                }
                return Err(SdrError::ProducerStopped);
            }
        }
    }
    Ok(())
}

/// Read commands until the client goes away, sends EXIT, or the session is cancelled.
/// Always leaves the session cancelled so the streaming loop winds down too.
fn command_loop<B: TcpBackend>(
    mut reader: CommandReader,
    backend: Arc<Mutex<B>>,
    table: Arc<CommandTable>,
    supported: HashSet<u8>,
    handle: ServerHandle,
) -> Result<()> {
    log::debug!("Command listener starting");
    let result = loop {
        if handle.is_cancelled() {
            break Ok(());
        }
        let record = match reader.read_command() {
            Ok(record) => record,
            Err(_) if handle.is_cancelled() => break Ok(()),
            Err(ProtocolError::Io(e)) if is_disconnect(&e) => {
                log::info!("🔌 Client closed the command channel");
                break Ok(());
            }
            Err(e) => break Err(SdrError::from(e)),
        };

        let command = match table.lookup(record.opcode) {
            Some(command) => command,
            None => {
                log::warn!(
                    "⚠️  Ignoring unknown opcode 0x{:02x} (argument {})",
                    record.opcode,
                    record.argument
                );
                continue;
            }
        };

        if command == TcpCommand::AndroidExit {
            log::info!("👋 Client requested exit");
            handle.cancel();
            break Ok(());
        }

        if !supported.contains(&command.code()) {
            log::warn!("⚠️  Unsupported command {}", command);
            continue;
        }

        log::debug!("⚙️  {} {}", command, record.argument);
        if let Err(e) = lock(&backend).execute(command, record.argument) {
            log::warn!("Command listener closing due to {}", e);
            break Err(e);
        }
    };

    handle.cancel();
    log::debug!("Command listener closed");
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SampleFormat;
    use crossbeam::channel::{bounded, Sender};
    use rtl_tcp_protocol::RtlTcpClient;

    /// Backend that records commands and hands out whatever the test pushes
    struct ScriptedBackend {
        executed: Arc<Mutex<Vec<(TcpCommand, u32)>>>,
        samples: Option<crossbeam::channel::Receiver<Vec<u8>>>,
        stopped: Arc<AtomicBool>,
    }

    impl TcpBackend for ScriptedBackend {
        fn dongle_info(&self) -> DongleInfo {
            DongleInfo::new(*b"TEST", 7, 3)
        }

        fn supported_commands(&self) -> &'static [TcpCommand] {
            &[TcpCommand::SetFreq, TcpCommand::AndroidExit]
        }

        fn execute(&mut self, command: TcpCommand, argument: u32) -> Result<()> {
            self.executed.lock().unwrap().push((command, argument));
            Ok(())
        }

        fn start_rx(&mut self) -> Result<SampleSource> {
            let rx = self.samples.take().ok_or(SdrError::ProducerStopped)?;
            Ok(SampleSource::new(rx, SampleFormat::Signed8))
        }

        fn stop_rx(&mut self) -> Result<()> {
            self.stopped.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Harness {
        addr: SocketAddr,
        handle: ServerHandle,
        executed: Arc<Mutex<Vec<(TcpCommand, u32)>>>,
        stopped: Arc<AtomicBool>,
        samples: Sender<Vec<u8>>,
        server: JoinHandle<Result<()>>,
    }

    fn start_server(config: ServerConfig) -> Harness {
        let _ = env_logger::builder().is_test(true).try_init();
        let args = SdrTcpArguments {
            port: 0,
            ..SdrTcpArguments::default()
        };
        let (tx, rx) = bounded(8);
        let executed = Arc::new(Mutex::new(Vec::new()));
        let stopped = Arc::new(AtomicBool::new(false));
        let backend = ScriptedBackend {
            executed: Arc::clone(&executed),
            samples: Some(rx),
            stopped: Arc::clone(&stopped),
        };
        let server = SdrTcpServer::bind(
            &args,
            backend,
            Arc::new(CommandTable::standard()),
            ServerHandle::new(),
        )
        .unwrap()
        .with_config(config);
        let addr = server.local_addr();
        let handle = server.handle();
        let server = thread::spawn(move || server.serve_and_block());
        Harness {
            addr,
            handle,
            executed,
            stopped,
            samples: tx,
            server,
        }
    }

    fn fast_config() -> ServerConfig {
        ServerConfig {
            accept_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(50),
            accept_poll: Duration::from_millis(5),
        }
    }

    #[test]
    fn test_header_then_transformed_samples() {
        let harness = start_server(fast_config());
        let mut client = RtlTcpClient::connect(harness.addr).unwrap();
        assert_eq!(client.dongle_info(), &DongleInfo::new(*b"TEST", 7, 3));

        harness.samples.send(vec![0x00, 0x7f, 0x80, 0xff]).unwrap();
        let mut buf = [0u8; 4];
        client.read_samples_exact(&mut buf).unwrap();
        assert_eq!(buf, [0x80, 0xff, 0x00, 0x7f]);

        client.send_exit().unwrap();
        harness.server.join().unwrap().unwrap();
        assert!(harness.stopped.load(Ordering::SeqCst));
    }

    #[test]
    fn test_unknown_and_unsupported_opcodes_are_skipped() {
        let harness = start_server(fast_config());
        let mut client = RtlTcpClient::connect(harness.addr).unwrap();

        client
            .send_raw(rtl_tcp_protocol::CommandRecord {
                opcode: 0x55,
                argument: 0xdead_beef,
            })
            .unwrap();
        client.send_command(TcpCommand::SetGain, 100).unwrap();
        client.send_command(TcpCommand::SetFreq, 433_920_000).unwrap();
        client.send_exit().unwrap();

        harness.server.join().unwrap().unwrap();
        assert_eq!(
            *harness.executed.lock().unwrap(),
            vec![(TcpCommand::SetFreq, 433_920_000)]
        );
    }

    #[test]
    fn test_client_disconnect_is_a_clean_close() {
        let harness = start_server(fast_config());
        let client = RtlTcpClient::connect(harness.addr).unwrap();
        client.close();
        harness.server.join().unwrap().unwrap();
        assert!(harness.stopped.load(Ordering::SeqCst));
    }

    #[test]
    fn test_close_handle_unblocks_streaming() {
        let harness = start_server(fast_config());
        let mut client = RtlTcpClient::connect(harness.addr).unwrap();
        harness.handle.close();
        harness.handle.close();
        harness.server.join().unwrap().unwrap();
        assert_eq!(client.drain_until_closed().unwrap(), 0);
    }

    #[test]
    fn test_accept_timeout() {
        let harness = start_server(ServerConfig {
            accept_timeout: Duration::from_millis(100),
            ..fast_config()
        });
        let err = harness.server.join().unwrap().unwrap_err();
        assert!(matches!(err, SdrError::AcceptTimeout(_)));
        assert!(!harness.stopped.load(Ordering::SeqCst));
    }

    #[test]
    fn test_close_before_client_returns_ok() {
        let harness = start_server(fast_config());
        harness.handle.close();
        harness.server.join().unwrap().unwrap();
        assert!(TcpListener::bind(harness.addr).is_ok());
    }

    #[test]
    fn test_producer_stopping_is_an_error() {
        let harness = start_server(fast_config());
        let _client = RtlTcpClient::connect(harness.addr).unwrap();
        drop(harness.samples);
        let err = harness.server.join().unwrap().unwrap_err();
        assert!(matches!(err, SdrError::ProducerStopped));
    }
}
