use anyhow::Context;
use clap::Parser;
use crossbeam::channel::bounded;
use log::{error, info};
use rtl_tcp_bridge::session::CLOSE_TIMEOUT;
use rtl_tcp_bridge::{Cli, LoggingKeepAwake, SessionController};
use rtl_tcp_protocol::CommandTable;
use std::sync::Arc;
use std::time::Duration;

const IDLE_POLL: Duration = Duration::from_millis(100);

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let cli = Cli::parse();
    let args = cli
        .session_arguments()
        .context("Invalid session arguments")?;
    info!("🚀 Starting rtl-tcp-bridge ({}) with {}", cli.backend, args);

    let table = Arc::new(CommandTable::standard());
    let controller = SessionController::new(Arc::new(LoggingKeepAwake::new()));

    let (stop_tx, stop_rx) = bounded(1);
    ctrlc::set_handler(move || {
        info!("🛑 Received Ctrl+C, shutting down...");
        let _ = stop_tx.try_send(());
    })?;

    controller.enqueue(cli.backend.synthetic_device(table), args)?;

    while !controller.wait_until_idle(IDLE_POLL) {
        if stop_rx.try_recv().is_ok() {
            controller.stop(CLOSE_TIMEOUT)?;
            break;
        }
    }

    if let Some(report) = controller.last_error() {
        error!("❌ {}: {}", report.reason, report.message);
        anyhow::bail!("{} ({})", report.reason.user_message(), report.message);
    }

    info!("👋 Session finished");
    Ok(())
}
