#!/usr/bin/env cargo

//! IQ Capture Demo
//!
//! Connects to an rtl_tcp server, tunes it and records raw unsigned 8-bit IQ
//! samples to a file, then asks the server to exit.
//!
//! Usage:
//!   cargo run --example iq_capture_demo -- --duration 5
//!   cargo run --example iq_capture_demo -- --duration 5 --frequency 433920000 --server 127.0.0.1:1234

use clap::Parser;
use log::{error, info, warn};
use rtl_tcp_protocol::{RtlTcpClient, TcpCommand};
use std::fs::File;
use std::io::Write;
use std::time::{Duration, Instant};

#[derive(Parser)]
#[command(name = "iq_capture_demo")]
#[command(about = "Record IQ samples from an rtl_tcp server")]
struct Args {
    /// Seconds to record
    #[arg(short, long)]
    duration: u64,

    /// Output file (default: capture_<frequency>.cu8)
    #[arg(short, long)]
    output: Option<String>,

    /// rtl_tcp server address
    #[arg(short, long, default_value = "127.0.0.1:1234")]
    server: String,

    /// Center frequency in Hz
    #[arg(short, long)]
    frequency: Option<u32>,

    /// Sample rate in Hz
    #[arg(long)]
    sample_rate: Option<u32>,

    /// Gain as a percentage of the tuner's range
    #[arg(long)]
    gain_percent: Option<u32>,

    /// Leave the server running after the capture
    #[arg(long)]
    keep_server: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    let output_path = args.output.clone().unwrap_or_else(|| {
        format!("capture_{}.cu8", args.frequency.unwrap_or_default())
    });

    info!("📻 IQ Capture Demo");
    info!("📡 Server: {}", args.server);
    info!("⏱️  Duration: {}s", args.duration);
    info!("💾 Output: {}", output_path);

    let mut client = RtlTcpClient::connect(args.server.as_str())?;
    let dongle = *client.dongle_info();
    info!(
        "🔎 Dongle {} tuner type {} with {} gain steps",
        dongle.magic_str(),
        dongle.tuner_type,
        dongle.gain_count
    );

    if let Some(rate) = args.sample_rate {
        client.send_command(TcpCommand::SetSampleRate, rate)?;
    }
    if let Some(frequency) = args.frequency {
        client.send_command(TcpCommand::SetFreq, frequency)?;
    }
    if let Some(percent) = args.gain_percent {
        client.send_command(TcpCommand::SetGainMode, 1)?;
        client.send_command(TcpCommand::AndroidGainByPercentage, percent)?;
    }

    client.set_read_timeout(Some(Duration::from_secs(2)))?;
    let captured = capture(&mut client, &output_path, Duration::from_secs(args.duration))?;
    info!("💾 Saved {} bytes ({} IQ pairs) to {}", captured, captured / 2, output_path);

    if args.keep_server {
        client.close();
    } else {
        info!("👋 Asking the server to exit");
        client.send_exit()?;
        let trailing = client.drain_until_closed()?;
        info!("🔌 Server closed after {} trailing bytes", trailing);
    }

    info!("✅ Capture completed");
    Ok(())
}

/// Copy samples to `path` until `duration` has passed. Returns the bytes written.
fn capture(
    client: &mut RtlTcpClient,
    path: &str,
    duration: Duration,
) -> Result<usize, Box<dyn std::error::Error>> {
    let mut file = File::create(path)?;
    let mut buf = vec![0u8; 16 * 1024];
    let mut total = 0usize;
    let mut power_sum = 0f64;
    let start = Instant::now();

    info!("🔴 CAPTURING... ({}s)", duration.as_secs());
    while start.elapsed() < duration {
        let n = match client.read_samples(&mut buf) {
            Ok(0) => {
                warn!("⚠️  Server closed the connection");
                break;
            }
            Ok(n) => n,
            Err(e) => {
                error!("❌ Error reading samples: {}", e);
                break;
            }
        };
        file.write_all(&buf[..n])?;
        power_sum += buf[..n]
            .iter()
            .map(|&b| {
                let centered = b as f64 - 127.5;
                centered * centered
            })
            .sum::<f64>();
        total += n;
    }
    file.flush()?;

    if total > 0 {
        let rms = (power_sum / total as f64).sqrt();
        info!("📊 RMS amplitude {:.1} over {} bytes", rms, total);
    }
    Ok(total)
}
