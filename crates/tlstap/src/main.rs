//! tlstap - print the plaintext passing through SSL_read/SSL_write

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tlstap::config::{ConfigLoader, TapConfig};
use tlstap::loader::HostStatus;
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, reload, EnvFilter, Registry};

/// Lets the configured level replace the startup filter once the config is read
type FilterHandle = reload::Handle<EnvFilter, Registry>;

#[derive(Parser)]
#[command(name = "tlstap")]
#[command(version)]
#[command(about = "Capture TLS plaintext at the SSL_read/SSL_write boundary", long_about = None)]
struct Cli {
    /// Increase verbosity
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Output format
    #[arg(short, long, value_enum, default_value_t = OutputFormat::Text, global = true)]
    format: OutputFormat,

    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Capture plaintext until interrupted (requires root)
    Record {
        /// Only trace this process
        #[arg(short, long)]
        pid: Option<u32>,

        /// Path to libssl.so (auto-detected if not specified)
        #[arg(long)]
        libssl: Option<PathBuf>,

        /// Path to the eBPF object (auto-detected if not specified)
        #[arg(long)]
        ebpf_path: Option<PathBuf>,

        /// Maximum in-flight calls tracked at once
        #[arg(long)]
        store_capacity: Option<u32>,

        /// Event ring buffer size in bytes
        #[arg(long)]
        channel_bytes: Option<u32>,
    },

    /// Show host capabilities relevant to capture
    Status,
}

/// CLI flags that override the loaded configuration
struct RecordArgs {
    pid: Option<u32>,
    libssl: Option<PathBuf>,
    ebpf_path: Option<PathBuf>,
    store_capacity: Option<u32>,
    channel_bytes: Option<u32>,
}

impl RecordArgs {
    fn apply(self, config: &mut TapConfig) {
        let capture = &mut config.capture;
        if self.pid.is_some() {
            capture.pid = self.pid;
        }
        if self.libssl.is_some() {
            capture.libssl_path = self.libssl;
        }
        if self.ebpf_path.is_some() {
            capture.ebpf_path = self.ebpf_path;
        }
        if let Some(capacity) = self.store_capacity {
            capture.store_capacity = capacity;
        }
        if let Some(bytes) = self.channel_bytes {
            capture.channel_bytes = bytes;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let log_filter = init_logging(cli.verbose, cli.format)?;

    let mut config = ConfigLoader::new()
        .with_cli_path(cli.config.clone())
        .load()
        .context("failed to load configuration")?;

    if let Some(handle) = log_filter {
        handle
            .reload(EnvFilter::new(level_directive(configured_level(
                &config.log_level,
            ))))
            .context("failed to apply configured log level")?;
    }

    match cli.command {
        Commands::Record {
            pid,
            libssl,
            ebpf_path,
            store_capacity,
            channel_bytes,
        } => {
            RecordArgs {
                pid,
                libssl,
                ebpf_path,
                store_capacity,
                channel_bytes,
            }
            .apply(&mut config);
            ConfigLoader::validate(&config).context("invalid capture settings")?;
            record_command(config, cli.format).await
        }
        Commands::Status => status_command(cli.format),
    }
}

/// Level picked by `-v` flags, if any
fn verbosity_level(verbose: u8) -> Option<Level> {
    match verbose {
        0 => None,
        1 => Some(Level::DEBUG),
        _ => Some(Level::TRACE),
    }
}

fn configured_level(configured: &str) -> Level {
    configured.parse().unwrap_or(Level::INFO)
}

fn level_directive(level: Level) -> String {
    level.as_str().to_ascii_lowercase()
}

/// Install the subscriber before anything else logs. RUST_LOG wins over CLI
/// verbosity, which wins over the configured level. Without either, logging
/// starts at info and the returned handle applies the configured level later.
/// Logs go to stderr so captures on stdout stay pipeable.
fn init_logging(verbose: u8, format: OutputFormat) -> anyhow::Result<Option<FilterHandle>> {
    let (filter, pinned) = match EnvFilter::try_from_default_env() {
        Ok(filter) => (filter, true),
        Err(_) => match verbosity_level(verbose) {
            Some(level) => (EnvFilter::new(level_directive(level)), true),
            None => (EnvFilter::new(level_directive(Level::INFO)), false),
        },
    };
    let (filter, handle) = reload::Layer::new(filter);

    let json = format == OutputFormat::Json;
    tracing_subscriber::registry()
        .with(filter)
        .with(json.then(|| {
            fmt::layer()
                .json()
                .with_target(false)
                .with_writer(std::io::stderr)
        }))
        .with((!json).then(|| fmt::layer().with_target(false).with_writer(std::io::stderr)))
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialise logging: {}", e))?;

    Ok((!pinned).then_some(handle))
}

#[cfg(target_os = "linux")]
async fn record_command(config: TapConfig, format: OutputFormat) -> anyhow::Result<()> {
    use tlstap::EbpfCapture;
    use tokio::sync::mpsc;

    let (tx, mut rx) = mpsc::channel(config.capture.queue_capacity);
    let mut capture = EbpfCapture::new(config.capture.clone());

    if let Err(e) = capture.start(tx).await {
        if e.is_permission_error() {
            anyhow::bail!("{} (try running as root)", e);
        }
        return Err(e.into());
    }

    info!("Recording, press Ctrl+C to stop");

    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Some(event) => match format {
                    OutputFormat::Text => println!("{}", event),
                    OutputFormat::Json => println!("{}", serde_json::to_string(&event)?),
                },
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    // Nothing reads the queue any more; let a parked sender fail fast
    drop(rx);
    capture.stop().await?;

    let stats = capture.stats();
    match format {
        OutputFormat::Text => info!("Capture summary: {}", stats),
        OutputFormat::Json => eprintln!("{}", serde_json::to_string(&stats)?),
    }
    let drops = stats.interceptor_drops();
    if drops > 0 {
        warn!("{} intercepted calls ended without an event", drops);
    }

    Ok(())
}

#[cfg(not(target_os = "linux"))]
async fn record_command(_config: TapConfig, _format: OutputFormat) -> anyhow::Result<()> {
    Err(tlstap::CaptureError::Unsupported.into())
}

fn status_command(format: OutputFormat) -> anyhow::Result<()> {
    let status = HostStatus::probe();

    if format == OutputFormat::Json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    println!();
    println!("tlstap v{}", env!("CARGO_PKG_VERSION"));
    println!();
    println!(
        "Platform: {} {}",
        std::env::consts::OS,
        std::env::consts::ARCH
    );
    println!("  Running as root: {}", status.root);
    println!("  BPF filesystem: {}", status.bpf_fs);
    println!("  BTF available: {}", status.btf);
    match status.kernel {
        Some((major, minor, patch)) => println!(
            "  Kernel: {}.{}.{} (ring buffer: {})",
            major,
            minor,
            patch,
            status.supports_ringbuf()
        ),
        None => println!("  Kernel: unknown"),
    }

    println!();
    if status.ssl_libraries.is_empty() {
        println!("SSL libraries: none found");
    } else {
        println!("SSL libraries:");
        for lib in &status.ssl_libraries {
            println!("  {}", lib.display());
        }
    }

    match &status.ebpf_object {
        Some(path) => println!("eBPF object: {}", path.display()),
        None => println!("eBPF object: not found (build ebpf/ or set capture.ebpf_path)"),
    }

    println!();
    println!(
        "Ready to record: {}",
        if status.ready() { "yes" } else { "no" }
    );
    println!();

    Ok(())
}
