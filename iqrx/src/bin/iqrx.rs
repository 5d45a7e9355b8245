//! iqrx receiver daemon.
//!
//! Binds a UDP port, reassembles sample frames, and prints one line per
//! completed frame plus a statistics line every few seconds.
//!
//! # Usage
//!
//! ```sh
//! iqrx --address 0.0.0.0 --port 5000 --ring 8
//! ```
//!
//! SIGINT or SIGTERM stops the receiver, joins the worker and prints the
//! final statistics.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use iqrx::runtime::{Receiver, ReceiverConfig, ReceiverError, StatsSnapshot};
use iqrx::sync::spsc::Timeout;

const DEFAULT_PORT: u16 = 5000;

/// Interval between statistics lines.
const STATS_INTERVAL: Duration = Duration::from_secs(5);

/// Longest wait for a frame before the shutdown flag is checked again.
const POLL_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("{0}")]
    Usage(String),
    #[error(transparent)]
    Receiver(#[from] ReceiverError),
    #[error("installing signal handler: {0}")]
    Signal(#[from] ctrlc::Error),
}

fn main() {
    iqrx::init_tracing();
    if let Err(e) = run() {
        eprintln!("iqrx: {e}");
        if matches!(e, CliError::Usage(_)) {
            eprintln!("iqrx: try --help");
        }
        std::process::exit(1);
    }
}

fn run() -> Result<(), CliError> {
    let args: Vec<String> = std::env::args().collect();
    let config = parse_args(&args)?;

    eprintln!(
        "iqrx: receiving on {}:{} (ring {}, queue {})",
        config.bind_address, config.port, config.ring_size, config.queue_capacity
    );

    let running = Arc::new(AtomicBool::new(true));
    let flag = Arc::clone(&running);
    ctrlc::set_handler(move || flag.store(false, Ordering::SeqCst))?;

    let stats = serve(config, &running)?;
    eprintln!("iqrx: stopped, {stats:?}");
    Ok(())
}

/// Receives and prints frames until `running` is cleared, then shuts the
/// receiver down. Returns the statistics taken just before shutdown.
fn serve(config: ReceiverConfig, running: &AtomicBool) -> Result<StatsSnapshot, CliError> {
    let (receiver, blocks) = Receiver::spawn_with_queue(config)?;
    receiver.start()?;
    if let Some(local) = receiver.local_addr() {
        eprintln!("iqrx: ready on {local}");
    }

    let mut last_stats = minstant::Instant::now();
    while running.load(Ordering::SeqCst) {
        if let Some(block) = blocks.pop_blocking(Timeout::Duration(POLL_INTERVAL)) {
            println!(
                "frame {:>5}  blocks {:>3}  bytes {:>6}  samples {:>6}  format {}B/{}b",
                block.frame_index(),
                block.block_count(),
                block.len(),
                block.sample_count(),
                block.format().sample_bytes,
                block.format().sample_bits,
            );
            blocks.recycle(block);
        }
        if last_stats.elapsed() >= STATS_INTERVAL {
            eprintln!("iqrx: {:?}", receiver.stats());
            last_stats = minstant::Instant::now();
        }
    }

    eprintln!("iqrx: shutting down");
    let stats = receiver.stats();
    receiver.shutdown();
    Ok(stats)
}

fn value<'a>(args: &'a [String], i: usize, flag: &str) -> Result<&'a str, CliError> {
    args.get(i)
        .map(String::as_str)
        .ok_or_else(|| CliError::Usage(format!("missing value for {flag}")))
}

fn number<T: std::str::FromStr>(raw: &str, flag: &str) -> Result<T, CliError>
where
    T::Err: std::fmt::Display,
{
    raw.parse()
        .map_err(|e| CliError::Usage(format!("invalid value for {flag}: {raw} ({e})")))
}

/// Parses command line arguments into a `ReceiverConfig`.
fn parse_args(args: &[String]) -> Result<ReceiverConfig, CliError> {
    let mut config = ReceiverConfig {
        port: DEFAULT_PORT,
        ..ReceiverConfig::default()
    };

    let mut i = 1;
    while i < args.len() {
        let flag = args[i].as_str();
        match flag {
            "--address" | "-a" => {
                i += 1;
                config.bind_address = value(args, i, flag)?.to_owned();
            }
            "--port" | "-p" => {
                i += 1;
                config.port = number(value(args, i, flag)?, flag)?;
            }
            "--ring" | "-r" => {
                i += 1;
                config.ring_size = number(value(args, i, flag)?, flag)?;
            }
            "--queue" | "-q" => {
                i += 1;
                config.queue_capacity = number(value(args, i, flag)?, flag)?;
            }
            "--batch" => {
                i += 1;
                config.recv_batch = number(value(args, i, flag)?, flag)?;
            }
            "--recv-buffer" => {
                i += 1;
                config.recv_buffer_size = Some(number(value(args, i, flag)?, flag)?);
            }
            "--rx-core" => {
                i += 1;
                config.rx_core = Some(number(value(args, i, flag)?, flag)?);
            }
            "--timeout-ms" => {
                i += 1;
                let ms: u64 = number(value(args, i, flag)?, flag)?;
                config.transition_timeout = Duration::from_millis(ms);
            }
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            arg => return Err(CliError::Usage(format!("unknown argument: {arg}"))),
        }
        i += 1;
    }

    config
        .validate()
        .map_err(|e| CliError::Usage(e.to_string()))?;
    Ok(config)
}

fn print_usage() {
    eprintln!(
        r#"iqrx - UDP sample-frame receiver

USAGE:
    iqrx [OPTIONS]

OPTIONS:
    -a, --address <ADDR>     Address to bind (default: 0.0.0.0)
    -p, --port <PORT>        UDP port (default: 5000)
    -r, --ring <N>           Frames in flight, power of two (default: 4)
    -q, --queue <N>          Output queue capacity in frames (default: 64)
        --batch <N>          Datagrams per wakeup (default: 64)
        --recv-buffer <B>    Kernel receive buffer in bytes
        --rx-core <CORE>     Pin the receive worker to a core
        --timeout-ms <MS>    Start/stop confirmation timeout (default: 2000)
    -h, --help               Print this help message

ENVIRONMENT:
    RUST_LOG                 Log filter when built with --features tracing

EXAMPLE:
    iqrx --port 5000 --ring 8 --recv-buffer 4194304
"#
    );
}
