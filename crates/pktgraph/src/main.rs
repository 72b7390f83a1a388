//! pktgraph entry point.
//!
//! ```text
//! pktgraph [driver args] -- [-l LEVEL] [--preserve-latency] \
//!     <system-config-path> <pipeline-config-path>
//! ```
//!
//! Everything before `--` belongs to the driver; the in-tree loopback
//! driver understands `--ports N`. Exit codes: 0 normal, 1 process-lock
//! collision, 2 configuration error, 3 driver error.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use pktgraph::{LoopbackDriver, RunOptions, System};
use pktgraph_core::{Error, PipelineConfig, SystemConfig, Topology};

/// Batched element-graph packet processing with coprocessor offload.
#[derive(Parser)]
#[command(name = "pktgraph", version, about, long_about = None)]
struct Cli {
    /// Log level: debug, info, notice, warning, error, critical, alert,
    /// emergency.
    #[arg(short = 'l', long, default_value = "info")]
    loglevel: String,

    /// Prefer dropping over queueing under TX backpressure.
    #[arg(long)]
    preserve_latency: bool,

    /// System configuration path.
    system_config: PathBuf,

    /// Pipeline configuration path.
    pipeline_config: PathBuf,
}

static TERMINATED: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_signal(_signum: libc::c_int) {
    TERMINATED.store(true, Ordering::SeqCst);
}

fn main() -> ExitCode {
    // Number formatting follows the user's locale, nothing else does.
    unsafe {
        libc::setlocale(libc::LC_NUMERIC, b"\0".as_ptr() as *const libc::c_char);
    }

    // Arguments up to `--` belong to the driver.
    let args: Vec<String> = std::env::args().collect();
    let (driver_args, own_args) = match args.iter().position(|a| a == "--") {
        Some(split) => (&args[1..split], &args[split + 1..]),
        None => (&args[1..1], &args[1..]),
    };
    let mut clap_args = vec![args[0].clone()];
    clap_args.extend(own_args.iter().cloned());
    let cli = Cli::parse_from(clap_args);

    let filter = match level_filter(&cli.loglevel) {
        Some(f) => f,
        None => {
            eprintln!("invalid value for loglevel: {}", cli.loglevel);
            return ExitCode::from(2);
        }
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_target(false)
        .init();

    match run(cli, driver_args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{:#}", e);
            match e.downcast_ref::<Error>() {
                Some(Error::LockCollision) => ExitCode::from(1),
                Some(Error::Driver(_)) => ExitCode::from(3),
                _ => ExitCode::from(2),
            }
        }
    }
}

fn run(cli: Cli, driver_args: &[String]) -> anyhow::Result<()> {
    tracing::info!("trying to acquire a process lock...");

    let num_ports = parse_driver_ports(driver_args).context("parsing driver arguments")?;
    let driver = Arc::new(LoopbackDriver::new(num_ports));

    let sys_text = std::fs::read_to_string(&cli.system_config)
        .with_context(|| format!("reading {}", cli.system_config.display()))?;
    let sys_cfg = SystemConfig::parse(&sys_text)
        .with_context(|| format!("loading {}", cli.system_config.display()))?;
    let pipe_text = std::fs::read_to_string(&cli.pipeline_config)
        .with_context(|| format!("reading {}", cli.pipeline_config.display()))?;
    let pipe_cfg = PipelineConfig::parse(&pipe_text)
        .with_context(|| format!("loading {}", cli.pipeline_config.display()))?;

    let topo = Topology::detect();
    tracing::info!(
        nodes = topo.num_nodes(),
        cores = topo.num_cores(),
        "topology detected"
    );

    unsafe {
        libc::signal(
            libc::SIGINT,
            handle_signal as *const () as libc::sighandler_t,
        );
        libc::signal(
            libc::SIGTERM,
            handle_signal as *const () as libc::sighandler_t,
        );
    }

    let system = System::launch(
        driver,
        &sys_cfg,
        &pipe_cfg,
        &topo,
        RunOptions {
            preserve_latency: cli.preserve_latency,
            lock_dir: None,
        },
    )?;
    tracing::info!("running, ^C to stop");

    while !TERMINATED.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(100));
    }
    system.stop()?;
    Ok(())
}

/// Map the syslog-style levels onto tracing filters.
fn level_filter(level: &str) -> Option<&'static str> {
    match level {
        "debug" => Some("debug"),
        "info" | "notice" => Some("info"),
        "warning" => Some("warn"),
        "error" | "critical" | "alert" | "emergency" => Some("error"),
        _ => None,
    }
}

fn parse_driver_ports(args: &[String]) -> anyhow::Result<usize> {
    let mut ports = 2usize;
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--ports" => {
                ports = iter
                    .next()
                    .context("--ports needs a value")?
                    .parse()
                    .context("--ports needs a number")?;
            }
            other => anyhow::bail!("unknown driver argument '{}'", other),
        }
    }
    Ok(ports)
}
